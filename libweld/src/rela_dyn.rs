//! Dynamic relocation sections: `.rela.dyn` (sorted, relative first) and the
//! PLT-paired `.rela.plt` / `.rela.iplt`. Records reference either an input
//! section or one of our own synthetic sections; final offsets and addends
//! are derived at write time when addresses are known.

use crate::config::Config;
use crate::context::WriteCx;
use crate::elf::shf;
use crate::elf::sht;
use crate::error::Result;
use crate::input::InputSectionId;
use crate::input::LinkInputs;
use crate::mips_got::mips_page_addr;
use crate::output::OutputSectionId;
use crate::section::SectionBase;
use crate::section::SyntheticSection;
use crate::symbol::SymbolId;
use crate::target::Target;

/// Where a dynamic relocation applies: an input section or one of the
/// synthetic sections that registers relocations against itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocPlace {
    Input(InputSectionId),
    Got,
    GotPlt,
    IgotPlt,
    MipsGot,
    CapRelocs,
}

#[derive(Debug, Clone, Copy)]
pub struct DynamicReloc {
    pub r_type: u32,
    pub place: RelocPlace,
    pub offset: u64,
    /// When set, the serialized addend is the symbol's virtual address plus
    /// `addend` and the symbol index is zero.
    pub use_sym_va: bool,
    pub symbol: Option<SymbolId>,
    pub addend: i64,
    /// MIPS page relocations encode the page base of an output section in
    /// the addend.
    pub output_sec: Option<OutputSectionId>,
}

impl DynamicReloc {
    pub fn new(
        r_type: u32,
        place: RelocPlace,
        offset: u64,
        symbol: Option<SymbolId>,
        addend: i64,
    ) -> Self {
        DynamicReloc {
            r_type,
            place,
            offset,
            use_sym_va: false,
            symbol,
            addend,
            output_sec: None,
        }
    }

    pub fn new_sym_va(
        r_type: u32,
        place: RelocPlace,
        offset: u64,
        symbol: SymbolId,
        addend: i64,
    ) -> Self {
        DynamicReloc {
            r_type,
            place,
            offset,
            use_sym_va: true,
            symbol: Some(symbol),
            addend,
            output_sec: None,
        }
    }

    pub fn mips_page(r_type: u32, offset: u64, output_sec: OutputSectionId, addend: i64) -> Self {
        DynamicReloc {
            r_type,
            place: RelocPlace::MipsGot,
            offset,
            use_sym_va: false,
            symbol: None,
            addend,
            output_sec: Some(output_sec),
        }
    }

    fn file_va(&self, cx: &WriteCx) -> u64 {
        let base = match self.place {
            RelocPlace::Input(id) => cx.inputs.section(id).output_address(cx.outputs),
            RelocPlace::Got => cx.synth_va(crate::context::SynthSecId::Got),
            RelocPlace::GotPlt => cx.synth_va(crate::context::SynthSecId::GotPlt),
            RelocPlace::IgotPlt => cx.synth_va(crate::context::SynthSecId::IgotPlt),
            RelocPlace::MipsGot => cx.synth_va(crate::context::SynthSecId::MipsGot),
            RelocPlace::CapRelocs => cx.synth_va(crate::context::SynthSecId::CapRelocs),
        };
        base + self.offset
    }

    fn final_addend(&self, cx: &WriteCx) -> i64 {
        if self.use_sym_va {
            let id = self.symbol.expect("symbol-relative reloc without a symbol");
            return cx.symbol_va_plus(id, self.addend) as i64;
        }
        match self.output_sec {
            Some(out) => mips_page_addr(cx.outputs.get(out).addr) as i64 + self.addend,
            None => self.addend,
        }
    }

    fn sym_index(&self, cx: &WriteCx) -> u32 {
        match self.symbol {
            Some(id) if !self.use_sym_va => cx.symbols.get(id).dynsym_index.get().unwrap_or(0),
            _ => 0,
        }
    }
}

pub struct RelaDynSection {
    pub base: SectionBase,
    relocs: Vec<DynamicReloc>,
    num_relative: usize,
    is_rela: bool,
    sort: bool,
    /// Addends that must be embedded at the relocation sites because the
    /// output is REL while the input carried RELA. Consumed by the writer.
    pub addend_copies: foldhash::HashMap<InputSectionId, Vec<DynamicReloc>>,
}

impl RelaDynSection {
    pub fn new(name: &'static str, is_rela: bool, sort: bool) -> Self {
        let ty = if is_rela { sht::RELA } else { sht::REL };
        RelaDynSection {
            base: SectionBase::new(name, ty, shf::ALLOC, 8),
            relocs: Vec::new(),
            num_relative: 0,
            is_rela,
            sort,
            addend_copies: foldhash::HashMap::default(),
        }
    }

    pub fn add_reloc(&mut self, target: &dyn Target, reloc: DynamicReloc) {
        assert!(!self.base.finalized);
        if reloc.r_type == target.relative_rel() {
            self.num_relative += 1;
        }
        self.relocs.push(reloc);
    }

    /// Like `add_reloc`, but also records the addend for REL output when the
    /// contributing input section carried RELA relocations.
    pub fn add_reloc_from_input(
        &mut self,
        target: &dyn Target,
        inputs: &LinkInputs,
        config: &Config,
        section: InputSectionId,
        reloc: DynamicReloc,
    ) {
        if !config.is_rela
            && config.rel_output_with_rela_inputs
            && inputs.section(section).relocations.is_rela
        {
            self.addend_copies.entry(section).or_default().push(reloc);
        }
        self.add_reloc(target, reloc);
    }

    pub fn num_relocs(&self) -> usize {
        self.relocs.len()
    }

    pub fn relative_count(&self) -> usize {
        self.num_relative
    }

    pub fn entry_size(&self, config: &Config) -> u64 {
        match (config.format.is_64(), self.is_rela) {
            (true, true) => 24,
            (true, false) => 16,
            (false, true) => 12,
            (false, false) => 8,
        }
    }

    /// The byte offset the next registered relocation will get. The PLT uses
    /// this to pair each entry with its relocation.
    pub fn next_reloc_offset(&self, config: &Config) -> u64 {
        self.relocs.len() as u64 * self.entry_size(config)
    }

    pub fn finalize(&mut self, config: &Config) {
        if self.base.finalized {
            return;
        }
        self.base.finalized = true;
        self.base.entsize = self.entry_size(config);
        self.base.alignment = config.word_size();
        self.base.size = self.relocs.len() as u64 * self.base.entsize;
    }
}

fn write_rel_info(cx: &WriteCx, buf: &mut [u8], offset: usize, sym: u32, r_type: u32) {
    let format = cx.config.format;
    if format.is_64() {
        // MIPS64 little-endian keeps the symbol half little-endian but packs
        // the type bytes as if the word were big-endian.
        let info = if cx.config.is_mips64el() {
            u64::from(sym) | (u64::from(r_type) << 56)
        } else {
            (u64::from(sym) << 32) | u64::from(r_type)
        };
        format.write_u64(buf, offset, info);
    } else {
        format.write_u32(buf, offset, (sym << 8) | (r_type & 0xff));
    }
}

impl SyntheticSection for RelaDynSection {
    fn base(&self) -> &SectionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut SectionBase {
        &mut self.base
    }

    fn is_empty(&self) -> bool {
        self.relocs.is_empty()
    }

    fn write_to(&self, cx: &WriteCx, buf: &mut [u8]) -> Result {
        let relative_type = cx.target.relative_rel();
        let mut resolved: Vec<(u64, u32, u32, i64)> = self
            .relocs
            .iter()
            .map(|reloc| {
                (
                    reloc.file_va(cx),
                    reloc.sym_index(cx),
                    reloc.r_type,
                    reloc.final_addend(cx),
                )
            })
            .collect();

        // Putting all relative relocations first lets the runtime process
        // that prefix without any symbol lookups; within each class order by
        // symbol index to improve locality.
        if self.sort {
            resolved.sort_by_key(|&(_, sym, r_type, _)| (r_type != relative_type, sym));
        }

        let format = cx.config.format;
        let entsize = self.entry_size(cx.config) as usize;
        for (i, (r_offset, sym, r_type, addend)) in resolved.into_iter().enumerate() {
            let at = i * entsize;
            if format.is_64() {
                format.write_u64(buf, at, r_offset);
                write_rel_info(cx, buf, at + 8, sym, r_type);
                if self.is_rela {
                    format.write_u64(buf, at + 16, addend as u64);
                }
            } else {
                format.write_u32(buf, at, r_offset as u32);
                write_rel_info(cx, buf, at + 4, sym, r_type);
                if self.is_rela {
                    format.write_u32(buf, at + 8, addend as u32);
                }
            }
        }
        Ok(())
    }
}
