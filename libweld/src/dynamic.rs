//! The `.dynamic` section: tag/value pairs describing the image to the
//! runtime loader. Entries that only depend on configuration are added
//! early; entries that need other sections' finalized sizes are added by the
//! late pass, which therefore runs after every other section finalized.

use crate::config::Config;
use crate::context::SynthSecId;
use crate::context::WriteCx;
use crate::elf::shf;
use crate::elf::sht;
use crate::error::Result;
use crate::input::LinkInputs;
use crate::output::OutputSectionId;
use crate::section::SectionBase;
use crate::section::SyntheticSection;
use crate::string_table::StringTableSection;
use crate::symbol::SymbolId;
use std::borrow::Cow;

enum EntryValue {
    Plain(u64),
    /// Absolute address of a synthetic section.
    SynthAddr(SynthSecId),
    /// Absolute address of an output section.
    OutSecAddr(OutputSectionId),
    OutSecSize(OutputSectionId),
    /// A symbol's virtual address.
    SymVa(SymbolId),
}

struct Entry {
    tag: u64,
    value: EntryValue,
}

/// Inputs to the late pass, snapshotted by the orchestrator once every other
/// section has a final size.
pub struct DynamicLateInputs {
    pub rela_dyn_size: u64,
    pub rela_dyn_entsize: u64,
    pub relative_reloc_count: u64,
    pub rela_plt_size: u64,
    pub dynstr_size: u64,
    pub dynsym_count: u64,
    pub symtab_entsize: u64,
    pub has_gnu_hash: bool,
    pub has_sysv_hash: bool,
    pub preinit_array: Option<OutputSectionId>,
    pub init_array: Option<OutputSectionId>,
    pub fini_array: Option<OutputSectionId>,
    pub init_symbol: Option<SymbolId>,
    pub fini_symbol: Option<SymbolId>,
    pub verdef_count: u64,
    pub verneed_count: u64,
    pub mips_local_gotno: u64,
    /// Dynsym index of the first symbol with a global GOT entry; the dynsym
    /// count when there is none.
    pub mips_gotsym: u64,
    pub has_mips_rld_map: bool,
}

pub struct DynamicSection {
    pub base: SectionBase,
    entries: Vec<Entry>,
}

impl DynamicSection {
    pub fn new(config: &Config) -> Self {
        // .dynamic is not writable on MIPS, nor when -z rodynamic was given.
        let flags = if config.is_mips() || config.z_rodynamic {
            shf::ALLOC
        } else {
            shf::ALLOC.with(shf::WRITE)
        };
        let mut base = SectionBase::new(
            crate::elf::secnames::DYNAMIC_SECTION_NAME,
            sht::DYNAMIC,
            flags,
            config.word_size(),
        );
        base.entsize = if config.format.is_64() { 16 } else { 8 };
        DynamicSection {
            base,
            entries: Vec::new(),
        }
    }

    fn add(&mut self, tag: u64, value: EntryValue) {
        self.entries.push(Entry { tag, value });
    }

    /// Entries that don't depend on other sections. Strings go into
    /// `.dynstr` now so its size is fixed early.
    pub fn add_early_entries<'data>(
        &mut self,
        config: &Config,
        inputs: &LinkInputs<'data>,
        dynstr: &mut StringTableSection<'data>,
    ) {
        use object::elf::*;

        for aux in &config.auxiliary {
            let offset = dynstr.add_string(Cow::Owned(aux.clone().into_bytes()), true);
            self.add(u64::from(DT_AUXILIARY as u32), EntryValue::Plain(offset.into()));
        }
        for filter in &config.filter {
            let offset = dynstr.add_string(Cow::Owned(filter.clone().into_bytes()), true);
            self.add(u64::from(DT_FILTER as u32), EntryValue::Plain(offset.into()));
        }
        if let Some(rpath) = &config.rpath {
            let tag = if config.enable_new_dtags {
                DT_RUNPATH
            } else {
                DT_RPATH
            };
            let offset = dynstr.add_string(Cow::Owned(rpath.clone().into_bytes()), true);
            self.add(tag.into(), EntryValue::Plain(offset.into()));
        }
        for file in &inputs.files {
            if file.is_shared && file.is_needed {
                if let Some(soname) = file.soname {
                    let offset = dynstr.add_str(soname, true);
                    self.add(DT_NEEDED.into(), EntryValue::Plain(offset.into()));
                }
            }
        }
        if let Some(soname) = &config.soname {
            let offset = dynstr.add_string(Cow::Owned(soname.clone().into_bytes()), true);
            self.add(DT_SONAME.into(), EntryValue::Plain(offset.into()));
        }

        let mut dt_flags: u64 = 0;
        let mut dt_flags_1: u64 = 0;
        if config.bsymbolic {
            dt_flags |= u64::from(DF_SYMBOLIC);
        }
        if config.z_nodelete {
            dt_flags_1 |= u64::from(DF_1_NODELETE);
        }
        if config.z_nodlopen {
            dt_flags_1 |= u64::from(DF_1_NOOPEN);
        }
        if config.z_now {
            dt_flags |= u64::from(DF_BIND_NOW);
            dt_flags_1 |= u64::from(DF_1_NOW);
        }
        if config.z_origin {
            dt_flags |= u64::from(DF_ORIGIN);
            dt_flags_1 |= u64::from(DF_1_ORIGIN);
        }
        if dt_flags != 0 {
            self.add(DT_FLAGS.into(), EntryValue::Plain(dt_flags));
        }
        if dt_flags_1 != 0 {
            self.add(DT_FLAGS_1.into(), EntryValue::Plain(dt_flags_1));
        }

        // DT_DEBUG is the loader's hook for debuggers. Only executables get
        // it, and only when .dynamic is writable, since the loader writes
        // into the entry at startup.
        if !config.is_shared() && !config.is_relocatable() && !config.z_rodynamic {
            self.add(DT_DEBUG.into(), EntryValue::Plain(0));
        }
    }

    /// Entries that depend on finalized sizes of other sections.
    pub fn finalize(&mut self, config: &Config, late: &DynamicLateInputs) {
        use object::elf::*;

        if self.base.finalized {
            return;
        }
        self.base.finalized = true;

        if late.rela_dyn_size > 0 {
            let (rel, relsz, relent) = if config.is_rela {
                (DT_RELA, DT_RELASZ, DT_RELAENT)
            } else {
                (DT_REL, DT_RELSZ, DT_RELENT)
            };
            self.add(rel.into(), EntryValue::SynthAddr(SynthSecId::RelaDyn));
            self.add(relsz.into(), EntryValue::Plain(late.rela_dyn_size));
            self.add(relent.into(), EntryValue::Plain(late.rela_dyn_entsize));

            // The MIPS runtime loader cannot handle the RELCOUNT tag; GOT
            // processing there is too entangled with relocation order.
            if !config.is_mips() && config.z_combreloc && late.relative_reloc_count > 0 {
                let count_tag = if config.is_rela {
                    DT_RELACOUNT
                } else {
                    DT_RELCOUNT
                };
                self.add(count_tag.into(), EntryValue::Plain(late.relative_reloc_count));
            }
        }
        if late.rela_plt_size > 0 {
            self.add(DT_JMPREL.into(), EntryValue::SynthAddr(SynthSecId::RelaPlt));
            self.add(DT_PLTRELSZ.into(), EntryValue::Plain(late.rela_plt_size));
            let (pltgot_tag, pltgot) = if config.is_mips() {
                (DT_MIPS_PLTGOT as u32, SynthSecId::GotPlt)
            } else {
                (DT_PLTGOT, SynthSecId::GotPlt)
            };
            self.add(pltgot_tag.into(), EntryValue::SynthAddr(pltgot));
            let plt_rel_kind = if config.is_rela { DT_RELA } else { DT_REL };
            self.add(DT_PLTREL.into(), EntryValue::Plain(plt_rel_kind.into()));
        }

        self.add(DT_SYMTAB.into(), EntryValue::SynthAddr(SynthSecId::Dynsym));
        self.add(DT_SYMENT.into(), EntryValue::Plain(late.symtab_entsize));
        self.add(DT_STRTAB.into(), EntryValue::SynthAddr(SynthSecId::Dynstr));
        self.add(DT_STRSZ.into(), EntryValue::Plain(late.dynstr_size));
        if !config.z_text {
            self.add(DT_TEXTREL.into(), EntryValue::Plain(0));
        }
        if late.has_gnu_hash {
            self.add(DT_GNU_HASH.into(), EntryValue::SynthAddr(SynthSecId::GnuHash));
        }
        if late.has_sysv_hash {
            self.add(DT_HASH.into(), EntryValue::SynthAddr(SynthSecId::SysvHash));
        }

        if let Some(out) = late.preinit_array {
            self.add(DT_PREINIT_ARRAY.into(), EntryValue::OutSecAddr(out));
            self.add(DT_PREINIT_ARRAYSZ.into(), EntryValue::OutSecSize(out));
        }
        if let Some(out) = late.init_array {
            self.add(DT_INIT_ARRAY.into(), EntryValue::OutSecAddr(out));
            self.add(DT_INIT_ARRAYSZ.into(), EntryValue::OutSecSize(out));
        }
        if let Some(out) = late.fini_array {
            self.add(DT_FINI_ARRAY.into(), EntryValue::OutSecAddr(out));
            self.add(DT_FINI_ARRAYSZ.into(), EntryValue::OutSecSize(out));
        }
        if let Some(id) = late.init_symbol {
            self.add(DT_INIT.into(), EntryValue::SymVa(id));
        }
        if let Some(id) = late.fini_symbol {
            self.add(DT_FINI.into(), EntryValue::SymVa(id));
        }

        let has_verneed = late.verneed_count != 0;
        if has_verneed || late.verdef_count != 0 {
            self.add(DT_VERSYM.into(), EntryValue::SynthAddr(SynthSecId::Versym));
        }
        if late.verdef_count != 0 {
            self.add(DT_VERDEF.into(), EntryValue::SynthAddr(SynthSecId::Verdef));
            self.add(DT_VERDEFNUM.into(), EntryValue::Plain(late.verdef_count));
        }
        if has_verneed {
            self.add(DT_VERNEED.into(), EntryValue::SynthAddr(SynthSecId::Verneed));
            self.add(DT_VERNEEDNUM.into(), EntryValue::Plain(late.verneed_count));
        }

        if config.is_mips() {
            self.add(u64::from(DT_MIPS_RLD_VERSION as u32), EntryValue::Plain(1));
            self.add(
                u64::from(DT_MIPS_FLAGS as u32),
                EntryValue::Plain(crate::elf::RHF_NOTPOT),
            );
            self.add(
                u64::from(DT_MIPS_BASE_ADDRESS as u32),
                EntryValue::Plain(config.image_base),
            );
            self.add(
                u64::from(DT_MIPS_SYMTABNO as u32),
                EntryValue::Plain(late.dynsym_count),
            );
            self.add(
                u64::from(DT_MIPS_LOCAL_GOTNO as u32),
                EntryValue::Plain(late.mips_local_gotno),
            );
            self.add(
                u64::from(DT_MIPS_GOTSYM as u32),
                EntryValue::Plain(late.mips_gotsym),
            );
            self.add(DT_PLTGOT.into(), EntryValue::SynthAddr(SynthSecId::MipsGot));
            if late.has_mips_rld_map {
                self.add(
                    u64::from(DT_MIPS_RLD_MAP as u32),
                    EntryValue::SynthAddr(SynthSecId::MipsRldMap),
                );
            }
        }

        // +1 for the terminating DT_NULL.
        self.base.size = (self.entries.len() as u64 + 1) * self.base.entsize;
    }
}

impl SyntheticSection for DynamicSection {
    fn base(&self) -> &SectionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut SectionBase {
        &mut self.base
    }

    fn write_to(&self, cx: &WriteCx, buf: &mut [u8]) -> Result {
        let format = cx.config.format;
        let word = format.word_size() as usize;
        let mut at = 0usize;
        for entry in &self.entries {
            let value = match entry.value {
                EntryValue::Plain(value) => value,
                EntryValue::SynthAddr(id) => cx.synth_va(id),
                EntryValue::OutSecAddr(out) => cx.outputs.get(out).addr,
                EntryValue::OutSecSize(out) => cx.outputs.get(out).size,
                EntryValue::SymVa(id) => cx.symbol_va(id),
            };
            format.write_word(buf, at, entry.tag);
            format.write_word(buf, at + word, value);
            at += 2 * word;
        }
        // The trailing DT_NULL terminator.
        format.write_word(buf, at, object::elf::DT_NULL.into());
        format.write_word(buf, at + word, 0);
        Ok(())
    }
}
