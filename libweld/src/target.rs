//! The target back-end interface. The engine asks the target for entry
//! sizes, relocation type constants and the machine code of PLT stubs; the
//! concrete relocation resolution lives with the rest of the per-target code
//! outside this engine.

use crate::error::Result;
use crate::format::OutputFormat;
use anyhow::bail;

pub trait Target: Sync {
    fn machine(&self) -> u16;

    /// Number of reserved entries at the start of `.got.plt`.
    fn got_plt_header_entries(&self) -> u64;

    fn plt_header_size(&self) -> u64;

    fn plt_entry_size(&self) -> u64;

    /// The dynamic relocation type that adds the load address.
    fn relative_rel(&self) -> u32;

    /// The dynamic relocation type used for IPLT entries. Zero when the
    /// target has none.
    fn irelative_rel(&self) -> u32 {
        0
    }

    fn tls_got_rel(&self) -> u32;

    fn tls_module_index_rel(&self) -> u32;

    fn tls_offset_rel(&self) -> u32;

    /// Marker symbols for the PLT header, as (name, offset) pairs. ARM uses
    /// these to emit mapping symbols that aid disassembly.
    fn plt_header_map_symbols(&self) -> &'static [(&'static str, u64)] {
        &[]
    }

    /// Marker symbols for each PLT entry, as (name, offset-within-entry).
    fn plt_entry_map_symbols(&self) -> &'static [(&'static str, u64)] {
        &[]
    }

    fn write_plt_header(&self, format: OutputFormat, buf: &mut [u8], got_plt_va: u64);

    fn write_plt_entry(
        &self,
        format: OutputFormat,
        buf: &mut [u8],
        got_entry_va: u64,
        plt_entry_va: u64,
        index: u32,
        rel_offset: u64,
    );

    fn write_got_plt_header(&self, format: OutputFormat, buf: &mut [u8]);

    /// Writes one `.got.plt` slot. Lazy binding makes the slot initially
    /// point back into the PLT.
    fn write_got_plt(&self, format: OutputFormat, buf: &mut [u8], plt_base_va: u64, plt_entry_va: u64);

    fn write_igot_plt(&self, format: OutputFormat, buf: &mut [u8], symbol_va: u64);

    /// Applies a single relocation to an already-written buffer. Only the
    /// kinds that show up in synthetic section payloads need to be handled.
    fn apply_relocation(
        &self,
        format: OutputFormat,
        buf: &mut [u8],
        offset: usize,
        r_type: u32,
        value: u64,
        place: u64,
    ) -> Result;
}

fn mips_hi(value: u64) -> u32 {
    (((value.wrapping_add(0x8000)) >> 16) & 0xffff) as u32
}

fn mips_lo(value: u64) -> u32 {
    (value & 0xffff) as u32
}

/// The MIPS back-end (O32 and N64, both endiannesses). The capability
/// hardened variant shares these constants.
pub struct Mips;

impl Target for Mips {
    fn machine(&self) -> u16 {
        object::elf::EM_MIPS
    }

    fn got_plt_header_entries(&self) -> u64 {
        2
    }

    fn plt_header_size(&self) -> u64 {
        32
    }

    fn plt_entry_size(&self) -> u64 {
        16
    }

    fn relative_rel(&self) -> u32 {
        object::elf::R_MIPS_REL32
    }

    fn tls_got_rel(&self) -> u32 {
        object::elf::R_MIPS_TLS_TPREL64
    }

    fn tls_module_index_rel(&self) -> u32 {
        object::elf::R_MIPS_TLS_DTPMOD64
    }

    fn tls_offset_rel(&self) -> u32 {
        object::elf::R_MIPS_TLS_DTPREL64
    }

    fn write_plt_header(&self, format: OutputFormat, buf: &mut [u8], got_plt_va: u64) {
        let is_64 = format.is_64();
        let load = if is_64 { 0xdf99_0000 } else { 0x8f99_0000 };
        let add = if is_64 { 0x679c_0000 } else { 0x279c_0000 };
        let mov = if is_64 { 0x03e0_782d } else { 0x03e0_7825 };
        // Entries are one word each, so the index is the byte offset shifted
        // by the word size.
        let srl = if is_64 { 0x0018_c0c2 } else { 0x0018_c082 };

        format.write_u32(buf, 0, 0x3c1c_0000 | mips_hi(got_plt_va)); // lui   $28, %hi(&GOTPLT[0])
        format.write_u32(buf, 4, load | mips_lo(got_plt_va)); // l[wd] $25, %lo(&GOTPLT[0])($28)
        format.write_u32(buf, 8, add | mips_lo(got_plt_va)); // addiu $28, $28, %lo(&GOTPLT[0])
        format.write_u32(buf, 12, 0x031c_c023); // subu  $24, $24, $28
        format.write_u32(buf, 16, mov); // move  $15, $31
        format.write_u32(buf, 20, srl); // srl   $24, $24, 2
        format.write_u32(buf, 24, 0x0320_f809); // jalr  $25
        format.write_u32(buf, 28, 0x2718_fffe); // subu  $24, $24, 2
    }

    fn write_plt_entry(
        &self,
        format: OutputFormat,
        buf: &mut [u8],
        got_entry_va: u64,
        _plt_entry_va: u64,
        _index: u32,
        _rel_offset: u64,
    ) {
        let is_64 = format.is_64();
        let load = if is_64 { 0xddf9_0000 } else { 0x8df9_0000 };
        let add = if is_64 { 0x65ef_0000 } else { 0x25ef_0000 };

        format.write_u32(buf, 0, 0x3c0f_0000 | mips_hi(got_entry_va)); // lui   $15, %hi(.got.plt entry)
        format.write_u32(buf, 4, load | mips_lo(got_entry_va)); // l[wd] $25, %lo(entry)($15)
        format.write_u32(buf, 8, 0x0320_0008); // jr    $25
        format.write_u32(buf, 12, add | mips_lo(got_entry_va)); // addiu $15, $15, %lo(entry)
    }

    fn write_got_plt_header(&self, format: OutputFormat, buf: &mut [u8]) {
        // Both reserved slots stay zero; the runtime linker fills them.
        let word = format.word_size() as usize;
        buf[..2 * word].fill(0);
    }

    fn write_got_plt(
        &self,
        format: OutputFormat,
        buf: &mut [u8],
        plt_base_va: u64,
        _plt_entry_va: u64,
    ) {
        // Unresolved entries point at the PLT header trampoline.
        format.write_word(buf, 0, plt_base_va);
    }

    fn write_igot_plt(&self, format: OutputFormat, buf: &mut [u8], symbol_va: u64) {
        format.write_word(buf, 0, symbol_va);
    }

    fn apply_relocation(
        &self,
        format: OutputFormat,
        buf: &mut [u8],
        offset: usize,
        r_type: u32,
        value: u64,
        place: u64,
    ) -> Result {
        /// Not defined by the `object` crate; value from the MIPS n32/n64 ABI.
        const R_MIPS_PC32: u32 = 248;

        match r_type {
            object::elf::R_MIPS_NONE => {}
            object::elf::R_MIPS_32 => format.write_u32(buf, offset, value as u32),
            object::elf::R_MIPS_64 => format.write_u64(buf, offset, value),
            R_MIPS_PC32 => {
                format.write_u32(buf, offset, value.wrapping_sub(place) as u32);
            }
            _ => bail!("Unsupported relocation type {r_type} in synthetic section payload"),
        }
        Ok(())
    }
}

/// The 32-bit ARM back-end. Present for the sections it behaves specially in:
/// the exception-index sentinel and the `.igot.plt`-inside-`.got` rule.
pub struct Arm;

impl Target for Arm {
    fn machine(&self) -> u16 {
        object::elf::EM_ARM
    }

    fn got_plt_header_entries(&self) -> u64 {
        3
    }

    fn plt_header_size(&self) -> u64 {
        32
    }

    fn plt_entry_size(&self) -> u64 {
        16
    }

    fn relative_rel(&self) -> u32 {
        object::elf::R_ARM_RELATIVE
    }

    fn irelative_rel(&self) -> u32 {
        object::elf::R_ARM_IRELATIVE
    }

    fn tls_got_rel(&self) -> u32 {
        object::elf::R_ARM_TLS_TPOFF32
    }

    fn tls_module_index_rel(&self) -> u32 {
        object::elf::R_ARM_TLS_DTPMOD32
    }

    fn tls_offset_rel(&self) -> u32 {
        object::elf::R_ARM_TLS_DTPOFF32
    }

    fn plt_header_map_symbols(&self) -> &'static [(&'static str, u64)] {
        &[("$a", 0), ("$d", 16)]
    }

    fn plt_entry_map_symbols(&self) -> &'static [(&'static str, u64)] {
        &[("$a", 0), ("$d", 12)]
    }

    fn write_plt_header(&self, format: OutputFormat, buf: &mut [u8], got_plt_va: u64) {
        // str lr, [sp, #-4]! ; ldr lr, [pc, #4] ; add lr, pc, lr ; ldr pc, [lr, #8]!
        format.write_u32(buf, 0, 0xe52d_e004);
        format.write_u32(buf, 4, 0xe59f_e004);
        format.write_u32(buf, 8, 0xe08f_e00e);
        format.write_u32(buf, 12, 0xe5be_f008);
        format.write_u32(buf, 16, got_plt_va as u32);
        buf[20..32].fill(0);
    }

    fn write_plt_entry(
        &self,
        format: OutputFormat,
        buf: &mut [u8],
        got_entry_va: u64,
        plt_entry_va: u64,
        _index: u32,
        _rel_offset: u64,
    ) {
        // add ip, pc, #offset ; add ip, ip, #offset ; ldr pc, [ip, #offset]!
        let offset = got_entry_va.wrapping_sub(plt_entry_va + 8);
        format.write_u32(buf, 0, 0xe28f_c600 | (((offset >> 20) & 0xff) as u32));
        format.write_u32(buf, 4, 0xe28c_ca00 | (((offset >> 12) & 0xff) as u32));
        format.write_u32(buf, 8, 0xe5bc_f000 | ((offset & 0xfff) as u32));
        format.write_u32(buf, 12, 0xd4d4_d4d4); // alignment filler
    }

    fn write_got_plt_header(&self, format: OutputFormat, buf: &mut [u8]) {
        let word = format.word_size() as usize;
        buf[..3 * word].fill(0);
    }

    fn write_got_plt(
        &self,
        format: OutputFormat,
        buf: &mut [u8],
        plt_base_va: u64,
        _plt_entry_va: u64,
    ) {
        format.write_word(buf, 0, plt_base_va);
    }

    fn write_igot_plt(&self, format: OutputFormat, buf: &mut [u8], symbol_va: u64) {
        format.write_word(buf, 0, symbol_va);
    }

    fn apply_relocation(
        &self,
        format: OutputFormat,
        buf: &mut [u8],
        offset: usize,
        r_type: u32,
        value: u64,
        place: u64,
    ) -> Result {
        match r_type {
            object::elf::R_ARM_NONE => {}
            object::elf::R_ARM_ABS32 => format.write_u32(buf, offset, value as u32),
            object::elf::R_ARM_PREL31 => {
                let existing = format.read_u32(buf, offset);
                let delta = value.wrapping_sub(place) as u32;
                format.write_u32(buf, offset, (existing & 0x8000_0000) | (delta & 0x7fff_ffff));
            }
            _ => bail!("Unsupported relocation type {r_type} in synthetic section payload"),
        }
        Ok(())
    }
}
