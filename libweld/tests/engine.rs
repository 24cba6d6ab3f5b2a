//! End-to-end checks of the synthetic section pipeline: register entries,
//! finalize in dependency order, place the sections, write an image.

use libweld::Config;
use libweld::EpilogueInputs;
use libweld::SynthSecId;
use libweld::SyntheticSections;
use libweld::config::OutputKind;
use libweld::elf::shf;
use libweld::elf::sht;
use libweld::input::InputFile;
use libweld::input::InputSection;
use libweld::input::LinkInputs;
use libweld::input::Reloc;
use libweld::output::OutputSection;
use libweld::output::OutputSections;
use libweld::rela_dyn::DynamicReloc;
use libweld::rela_dyn::RelocPlace;
use libweld::section::SyntheticSection;
use libweld::symbol::Symbol;
use libweld::symbol::SymbolDb;
use libweld::symbol::SymbolPlacement;
use libweld::target::Mips;
use libweld::target::Target;

fn mips_config() -> Config {
    Config {
        machine: object::elf::EM_MIPS,
        emit_gnu_hash: false,
        emit_sysv_hash: true,
        ..Config::default()
    }
}

struct Link<'data> {
    config: Config,
    inputs: LinkInputs<'data>,
    outputs: OutputSections,
    symbols: SymbolDb<'data>,
    synth: SyntheticSections<'data>,
}

impl<'data> Link<'data> {
    fn new(config: Config) -> Self {
        let synth = SyntheticSections::new(&config, &Mips);
        Link {
            config,
            inputs: LinkInputs::default(),
            outputs: OutputSections::default(),
            symbols: SymbolDb::default(),
            synth,
        }
    }

    fn finalize(&mut self) {
        self.synth
            .finalize(
                &self.config,
                &Mips,
                &mut self.inputs,
                &mut self.outputs,
                &mut self.symbols,
                &EpilogueInputs::default(),
            )
            .unwrap();
    }

    /// Places every emitted section consecutively in one RW segment
    /// starting at `base_va` and returns the image size.
    fn place_all(&mut self, base_va: u64) -> usize {
        let ids: Vec<SynthSecId> = self
            .synth
            .emitted_sections()
            .map(|(id, _)| id)
            .collect();
        let mut addr = base_va;
        for id in ids {
            let section = self.synth.section_by_id(id).unwrap();
            let alignment = section.base().alignment.max(1);
            addr = addr.next_multiple_of(alignment);
            let size = section.size();
            let mut out = OutputSection::new(section.base().name.as_bytes().to_vec());
            out.addr = addr;
            out.size = size;
            out.file_offset = addr - base_va;
            out.section_index = (self.outputs.len() + 1) as u16;
            let out_id = self.outputs.add(out);
            self.synth.place(id, out_id, 0);
            addr += size;
        }
        (addr - base_va) as usize
    }

    fn write(&mut self, image_size: usize) -> Vec<u8> {
        let mut image = vec![0u8; image_size];
        self.synth
            .write_all(
                &mut image,
                &self.config,
                &Mips,
                &self.inputs,
                &mut self.symbols,
                &self.outputs,
            )
            .unwrap();
        self.synth
            .write_build_id(&mut image, &self.config, &self.outputs)
            .unwrap();
        image
    }

    fn section_bytes<'a>(&self, image: &'a [u8], id: SynthSecId) -> &'a [u8] {
        let section = self.synth.section_by_id(id).unwrap();
        let offset = section.base().file_offset(&self.outputs).unwrap() as usize;
        &image[offset..offset + section.size() as usize]
    }
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap())
}

#[test]
fn classic_hash_of_one_symbol() {
    let mut link = Link::new(mips_config());
    let main = link
        .symbols
        .add(Symbol::new(b"main".as_slice(), SymbolPlacement::Absolute));
    {
        let synth = &mut link.synth;
        synth.dynsym.add_symbol(&link.symbols, &mut synth.dynstr, main);
    }
    link.finalize();

    let image_size = link.place_all(0x10000);
    let image = link.write(image_size);
    let hash = link.section_bytes(&image, SynthSecId::SysvHash);

    // nbucket and nchain cover the null entry plus "main".
    assert_eq!(hash.len(), (2 + 2 + 2) * 4);
    assert_eq!(read_u32(hash, 0), 2); // nbucket
    assert_eq!(read_u32(hash, 4), 2); // nchain
    // sysv_hash("main") = 0x7c9a7f6a; 0x7c9a7f6a % 2 == 0.
    assert_eq!(read_u32(hash, 8), 1); // buckets[0] -> dynsym index of main
    assert_eq!(read_u32(hash, 12), 0); // buckets[1]
    assert_eq!(read_u32(hash, 16), 0); // chains[0]
    assert_eq!(read_u32(hash, 20), 0); // chains[1]: end of chain
}

/// A CIE with a 'zR' augmentation advertising absptr FDE pointers, padded to
/// 20 bytes.
fn test_cie() -> Vec<u8> {
    let mut cie = Vec::new();
    cie.extend_from_slice(&16u32.to_le_bytes()); // length
    cie.extend_from_slice(&0u32.to_le_bytes()); // CIE id
    cie.push(1); // version
    cie.extend_from_slice(b"zR\0");
    cie.push(0x01); // code alignment factor
    cie.push(0x78); // data alignment factor (-8)
    cie.push(0x1f); // return address register
    cie.push(0x01); // augmentation data length
    cie.push(0x00); // FDE encoding: absptr
    cie.extend_from_slice(&[0, 0, 0]); // padding
    assert_eq!(cie.len(), 20);
    cie
}

/// An FDE whose pc-begin is patched by a relocation, 20 bytes.
fn test_fde(cie_offset_delta: u32) -> Vec<u8> {
    let mut fde = Vec::new();
    fde.extend_from_slice(&16u32.to_le_bytes()); // length
    fde.extend_from_slice(&cie_offset_delta.to_le_bytes());
    fde.extend_from_slice(&0u64.to_le_bytes()); // pc begin (relocated)
    fde.extend_from_slice(&0u32.to_le_bytes()); // pc range
    assert_eq!(fde.len(), 20);
    fde
}

#[test]
fn eh_frame_dedups_cies_and_indexes_fdes() {
    let mut link = Link::new(mips_config());

    // The functions the two FDEs cover.
    let text_out = link.outputs.add({
        let mut out = OutputSection::new(".text");
        out.addr = 0x1000;
        out.size = 0x2000;
        out
    });

    let mut eh_data = Vec::new();
    eh_data.extend_from_slice(&test_cie());
    eh_data.extend_from_slice(&test_fde(24)); // FDE at 20: 20 + 4 - 0
    eh_data.extend_from_slice(&0u32.to_le_bytes()); // terminator
    let eh_data: &'static [u8] = eh_data.leak();

    let mut func_addrs = Vec::new();
    for (i, func_offset) in [0x1000u64, 0x0u64].into_iter().enumerate() {
        let file = link.inputs.add_file(InputFile::new(format!("f{i}.o")));
        let text = link
            .inputs
            .add_section(InputSection::new(file, b".text", sht::PROGBITS, &[]));
        link.inputs.section_mut(text).out = Some(text_out);
        link.inputs.section_mut(text).out_offset = func_offset;

        let mut func = Symbol::new(
            format!("func{i}").into_bytes(),
            SymbolPlacement::Defined(text),
        );
        func.sym_type = object::elf::STT_FUNC;
        let func = link.symbols.add(func);
        func_addrs.push(0x1000 + func_offset);

        let mut eh = InputSection::new(file, b".eh_frame", sht::PROGBITS, eh_data);
        eh.flags = shf::ALLOC;
        eh.relocations.is_rela = true;
        eh.relocations.relocs.push(Reloc {
            offset: 28, // pc-begin of the FDE
            r_type: object::elf::R_MIPS_64,
            symbol: Some(func),
            addend: 0,
        });
        let eh = link.inputs.add_section(eh);
        link.synth
            .add_eh_frame_section(&mut link.inputs, &link.symbols, &link.config, eh)
            .unwrap();
    }

    link.finalize();
    // One 20-byte CIE and two 20-byte FDEs, each padded to 24.
    assert_eq!(link.synth.eh_frame.size(), 72);
    assert_eq!(link.synth.eh_frame.num_fdes(), 2);

    let image_size = link.place_all(0x40000);
    let image = link.write(image_size);

    let eh = link.section_bytes(&image, SynthSecId::EhFrame);
    // Size fields cover the padding: aligned(20) - 4.
    assert_eq!(read_u32(eh, 0), 20); // CIE
    assert_eq!(read_u32(eh, 24), 20); // first FDE
    assert_eq!(read_u32(eh, 48), 20); // second FDE
    // CIE pointers: fde_offset + 4 - cie_offset.
    assert_eq!(read_u32(eh, 24 + 4), 28);
    assert_eq!(read_u32(eh, 48 + 4), 52);
    // pc-begin words hold the relocated function addresses.
    assert_eq!(read_u64(eh, 24 + 8), func_addrs[0]);
    assert_eq!(read_u64(eh, 48 + 8), func_addrs[1]);

    // The header is sorted by PC even though func1 precedes func0 in
    // registration order.
    let hdr = link.section_bytes(&image, SynthSecId::EhFrameHdr);
    let hdr_va = link
        .synth
        .section_by_id(SynthSecId::EhFrameHdr)
        .unwrap()
        .base()
        .va(&link.outputs);
    assert_eq!(hdr[0], 1);
    assert_eq!(read_u32(hdr, 8), 2); // fde count
    let first_pc = read_u32(hdr, 12) as i32 as i64 + hdr_va as i64;
    let second_pc = read_u32(hdr, 20) as i32 as i64 + hdr_va as i64;
    assert_eq!(first_pc, 0x1000);
    assert_eq!(second_pc, 0x2000);
    assert!(first_pc < second_pc);
}

#[test]
fn cap_relocs_emit_forty_byte_entries() {
    let mut link = Link::new(Config {
        is_static: true,
        ..mips_config()
    });

    let data_out = link.outputs.add({
        let mut out = OutputSection::new(".data");
        out.addr = 0x2000;
        out.size = 0x100;
        out
    });
    let text_out = link.outputs.add({
        let mut out = OutputSection::new(".text");
        out.addr = 0x4000;
        out.size = 0x100;
        out
    });

    let file = link.inputs.add_file(InputFile::new("a.o"));
    let data_sec = link
        .inputs
        .add_section(InputSection::new(file, b".data", sht::PROGBITS, &[]));
    link.inputs.section_mut(data_sec).out = Some(data_out);
    let text_sec = link
        .inputs
        .add_section(InputSection::new(file, b".text", sht::PROGBITS, &[]));
    link.inputs.section_mut(text_sec).out = Some(text_out);

    let mut section_sym = Symbol::new(b".data".as_slice(), SymbolPlacement::Defined(data_sec));
    section_sym.sym_type = object::elf::STT_SECTION;
    section_sym.binding = object::elf::STB_LOCAL;
    section_sym.file = Some(file);
    let section_sym = link.symbols.add(section_sym);

    let mut cap = Symbol::new(b"cap".as_slice(), SymbolPlacement::Defined(data_sec));
    cap.sym_type = object::elf::STT_OBJECT;
    cap.value = 0x10;
    cap.size = 0x20;
    cap.file = Some(file);
    let cap = link.symbols.add(cap);
    link.inputs.file_mut(file).symbols.extend([section_sym, cap]);

    let mut foo = Symbol::new(b"foo".as_slice(), SymbolPlacement::Defined(text_sec));
    foo.sym_type = object::elf::STT_FUNC;
    foo.size = 0x20;
    foo.file = Some(file);
    let foo = link.symbols.add(foo);

    let record = [0u8; 40];
    let record: &'static [u8] = record.to_vec().leak();
    let mut cap_sec = InputSection::new(file, b"__cap_relocs", sht::PROGBITS, record);
    cap_sec.relocations.is_rela = true;
    cap_sec.relocations.relocs.extend([
        Reloc {
            offset: 0,
            r_type: object::elf::R_MIPS_64,
            symbol: Some(section_sym),
            addend: 0x10,
        },
        Reloc {
            offset: 8,
            r_type: object::elf::R_MIPS_64,
            symbol: Some(foo),
            addend: 0,
        },
    ]);
    let cap_sec = link.inputs.add_section(cap_sec);
    link.synth
        .add_cap_relocs_section(&mut link.inputs, &link.symbols, &link.config, &Mips, cap_sec)
        .unwrap();

    link.finalize();
    assert_eq!(link.synth.cap_relocs.size(), 40);
    // A static link emits no dynamic relocations for capabilities.
    assert_eq!(link.synth.rela_dyn.num_relocs(), 0);

    let image_size = link.place_all(0x50000);
    let image = link.write(image_size);
    let entry = link.section_bytes(&image, SynthSecId::CapRelocs);

    assert_eq!(read_u64(entry, 0), 0x2010); // location: .data + 0x10
    assert_eq!(read_u64(entry, 8), 0x4000); // target: foo
    assert_eq!(read_u64(entry, 16), 0); // target offset
    assert_eq!(read_u64(entry, 24), 0x20); // target size
    assert_eq!(read_u64(entry, 32), 1u64 << 63); // function permission
}

#[test]
fn dynamic_relocations_sort_relative_first() {
    let mut link = Link::new(Config {
        output_kind: OutputKind::SharedObject,
        ..mips_config()
    });

    let mut preempt = Vec::new();
    for name in [b"a".as_slice(), b"b".as_slice()] {
        let mut sym = Symbol::new(name, SymbolPlacement::Undefined);
        sym.is_preemptible = true;
        let id = link.symbols.add(sym);
        preempt.push(id);
        let synth = &mut link.synth;
        synth.dynsym.add_symbol(&link.symbols, &mut synth.dynstr, id);
    }

    let relative = Mips.relative_rel();
    let absolute = object::elf::R_MIPS_64;
    for (r_type, sym, offset) in [
        (absolute, Some(preempt[1]), 0x00),
        (relative, None, 0x08),
        (absolute, Some(preempt[0]), 0x10),
        (relative, None, 0x18),
    ] {
        link.synth.rela_dyn.add_reloc(
            &Mips,
            DynamicReloc::new(r_type, RelocPlace::Got, offset, sym, 0),
        );
    }
    // Keep the GOT non-empty so the relocation targets stay in range.
    link.synth.got.has_got_off_rel = true;

    link.finalize();
    assert_eq!(link.synth.rela_dyn.relative_count(), 2);

    let image_size = link.place_all(0x60000);
    let image = link.write(image_size);
    let rela = link.section_bytes(&image, SynthSecId::RelaDyn);

    // MIPS64EL packs the relocation type into the top byte of r_info.
    let entry_type = |i: usize| (read_u64(rela, i * 24 + 8) >> 56) as u32;
    let entry_offset = |i: usize| read_u64(rela, i * 24);
    assert_eq!(entry_type(0), relative);
    assert_eq!(entry_type(1), relative);
    assert_eq!(entry_type(2), absolute);
    assert_eq!(entry_type(3), absolute);
    // Stable within each class: insertion order preserved.
    assert!(entry_offset(0) < entry_offset(1));
    // Non-relative entries are ordered by dynamic symbol index.
    let entry_sym = |i: usize| (read_u64(rela, i * 24 + 8) & 0xffff_ffff) as u32;
    assert!(entry_sym(2) <= entry_sym(3));
}

#[test]
fn dynamic_section_terminates_with_null() {
    let mut config = mips_config();
    config.output_kind = OutputKind::SharedObject;
    config.soname = Some("libtest.so.1".to_owned());
    let mut link = Link::new(config);

    let sym = {
        let mut sym = Symbol::new(b"exported".as_slice(), SymbolPlacement::Absolute);
        sym.is_preemptible = true;
        link.symbols.add(sym)
    };
    {
        let synth = &mut link.synth;
        synth.dynsym.add_symbol(&link.symbols, &mut synth.dynstr, sym);
    }
    link.synth
        .add_early_dynamic_entries(&link.config, &link.inputs);

    link.finalize();
    let image_size = link.place_all(0x70000);
    let image = link.write(image_size);
    let dynamic = link.section_bytes(&image, SynthSecId::Dynamic);

    // First tag is DT_SONAME (no auxiliary/rpath/needed came first).
    assert_eq!(read_u64(dynamic, 0), u64::from(object::elf::DT_SONAME));
    // The final entry is the DT_NULL terminator.
    let last = dynamic.len() - 16;
    assert_eq!(read_u64(dynamic, last), u64::from(object::elf::DT_NULL));
    assert_eq!(read_u64(dynamic, last + 8), 0);

    // MIPS images always describe their GOT to the loader.
    let mut tags = Vec::new();
    let mut at = 0;
    while at < dynamic.len() {
        tags.push(read_u64(dynamic, at));
        at += 16;
    }
    assert!(tags.contains(&u64::from(object::elf::DT_MIPS_LOCAL_GOTNO as u32)));
    assert!(tags.contains(&u64::from(object::elf::DT_MIPS_SYMTABNO as u32)));
}
