//! The engine context: one value owning every synthetic section, constructed
//! at link start and passed explicitly wherever the original design used
//! process-global section pointers. The orchestration here serializes
//! finalize into the producer-to-consumer order and runs the write phase in
//! parallel over disjoint output slices.

use crate::arm_exidx::ArmExidxSentinelSection;
use crate::build_id::BuildIdSection;
use crate::cap_relocs::CapRelocsSection;
use crate::config::Config;
use crate::dynamic::DynamicLateInputs;
use crate::dynamic::DynamicSection;
use crate::eh_frame::EhFrameHdrSection;
use crate::eh_frame::EhFrameSection;
use crate::elf::secnames;
use crate::error::Result;
use crate::gdb_index::GdbIndexSection;
use crate::got::GotPltSection;
use crate::got::GotSection;
use crate::got::IgotPltSection;
use crate::hash_tables::GnuHashSection;
use crate::hash_tables::SysvHashSection;
use crate::input::InputSectionId;
use crate::input::LinkInputs;
use crate::merge_strings::MergeStringsSection;
use crate::mips_abi::MipsAbiFlagsSection;
use crate::mips_abi::MipsOptionsSection;
use crate::mips_abi::MipsReginfoSection;
use crate::mips_abi::MipsRldMapSection;
use crate::mips_got::MipsGotSection;
use crate::output::OutputSectionId;
use crate::output::OutputSections;
use crate::plt::PltSection;
use crate::rela_dyn::RelaDynSection;
use crate::section::BssSection;
use crate::section::InterpSection;
use crate::section::SyntheticSection;
use crate::section::allocate_common_symbols;
use crate::string_table::StringTableSection;
use crate::symbol::SymbolDb;
use crate::symbol::SymbolFlags;
use crate::symbol::SymbolId;
use crate::symtab::SymbolTableSection;
use crate::target::Target;
use crate::thunk::ThunkSection;
use crate::versions::VersionDefinitionSection;
use crate::versions::VersionNeedSection;
use crate::versions::VersionTableSection;
use anyhow::Context as _;
use anyhow::bail;
use rayon::iter::IntoParallelIterator;
use rayon::iter::ParallelIterator;
use tracing::instrument;

/// Contents of the generated `.comment` section. The trailing NUL makes it a
/// well-formed merge-string piece.
const COMMENT_CONTENTS: &[u8] =
    concat!("Linker: weld ", env!("CARGO_PKG_VERSION"), "\0").as_bytes();

/// One unit of the parallel write pass.
#[derive(Clone, Copy)]
enum WriteJob {
    Synth(SynthSecId),
    Merge(usize),
}

/// Names every synthetic section the engine owns, for cross-references
/// (dynamic tags, relocation places) that must resolve to addresses at write
/// time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthSecId {
    Got,
    GotPlt,
    IgotPlt,
    MipsGot,
    Plt,
    Iplt,
    RelaDyn,
    RelaPlt,
    RelaIplt,
    Dynamic,
    Dynstr,
    Strtab,
    Shstrtab,
    Dynsym,
    Symtab,
    GnuHash,
    SysvHash,
    EhFrame,
    EhFrameHdr,
    BuildId,
    Versym,
    Verdef,
    Verneed,
    GdbIndex,
    CapRelocs,
    MipsAbiFlags,
    MipsOptions,
    MipsReginfo,
    MipsRldMap,
    ArmExidxSentinel,
    Thunks,
    Bss,
    BssRelRo,
    Interp,
}

const ALL_SECTION_IDS: &[SynthSecId] = &[
    SynthSecId::Got,
    SynthSecId::GotPlt,
    SynthSecId::IgotPlt,
    SynthSecId::MipsGot,
    SynthSecId::Plt,
    SynthSecId::Iplt,
    SynthSecId::RelaDyn,
    SynthSecId::RelaPlt,
    SynthSecId::RelaIplt,
    SynthSecId::Dynamic,
    SynthSecId::Dynstr,
    SynthSecId::Strtab,
    SynthSecId::Shstrtab,
    SynthSecId::Dynsym,
    SynthSecId::Symtab,
    SynthSecId::GnuHash,
    SynthSecId::SysvHash,
    SynthSecId::EhFrame,
    SynthSecId::EhFrameHdr,
    SynthSecId::BuildId,
    SynthSecId::Versym,
    SynthSecId::Verdef,
    SynthSecId::Verneed,
    SynthSecId::GdbIndex,
    SynthSecId::CapRelocs,
    SynthSecId::MipsAbiFlags,
    SynthSecId::MipsOptions,
    SynthSecId::MipsReginfo,
    SynthSecId::MipsRldMap,
    SynthSecId::ArmExidxSentinel,
    SynthSecId::Thunks,
    SynthSecId::Bss,
    SynthSecId::BssRelRo,
    SynthSecId::Interp,
];

/// Layout facts the dynamic section needs but the engine doesn't own:
/// the array output sections and the init/fini symbols, located by the
/// placement pass.
#[derive(Default)]
pub struct EpilogueInputs {
    pub preinit_array: Option<OutputSectionId>,
    pub init_array: Option<OutputSectionId>,
    pub fini_array: Option<OutputSectionId>,
    pub init_symbol: Option<SymbolId>,
    pub fini_symbol: Option<SymbolId>,
}

pub struct SyntheticSections<'data> {
    pub got: GotSection,
    pub got_plt: GotPltSection,
    pub igot_plt: IgotPltSection,
    pub mips_got: Option<MipsGotSection>,
    pub plt: PltSection,
    pub iplt: PltSection,
    pub rela_dyn: RelaDynSection,
    pub rela_plt: RelaDynSection,
    pub rela_iplt: RelaDynSection,
    pub dynamic: DynamicSection,
    pub dynstr: StringTableSection<'data>,
    pub strtab: StringTableSection<'data>,
    pub shstrtab: StringTableSection<'data>,
    pub dynsym: SymbolTableSection,
    pub symtab: SymbolTableSection,
    pub gnu_hash: Option<GnuHashSection>,
    pub sysv_hash: Option<SysvHashSection>,
    pub eh_frame: EhFrameSection<'data>,
    pub eh_frame_hdr: EhFrameHdrSection,
    pub build_id: BuildIdSection,
    pub versym: VersionTableSection,
    pub verdef: VersionDefinitionSection,
    pub verneed: VersionNeedSection,
    pub gdb_index: GdbIndexSection<'data>,
    pub cap_relocs: CapRelocsSection,
    pub mips_abiflags: Option<MipsAbiFlagsSection>,
    pub mips_options: Option<MipsOptionsSection>,
    pub mips_reginfo: Option<MipsReginfoSection>,
    pub mips_rld_map: Option<MipsRldMapSection>,
    pub arm_exidx_sentinel: Option<ArmExidxSentinelSection>,
    pub thunks: ThunkSection,
    pub bss: BssSection,
    pub bss_rel_ro: BssSection,
    pub interp: InterpSection,
    pub merge_strings: Vec<MergeStringsSection<'data>>,
}

impl<'data> SyntheticSections<'data> {
    pub fn new(config: &Config, target: &dyn Target) -> Self {
        let word = config.word_size();
        let (rela_dyn_name, rela_plt_name, rela_iplt_name) = if config.is_rela {
            (
                secnames::RELA_DYN_SECTION_NAME,
                secnames::RELA_PLT_SECTION_NAME,
                secnames::RELA_IPLT_SECTION_NAME,
            )
        } else {
            (
                secnames::REL_DYN_SECTION_NAME,
                secnames::REL_PLT_SECTION_NAME,
                secnames::REL_IPLT_SECTION_NAME,
            )
        };
        SyntheticSections {
            got: GotSection::new(word),
            got_plt: GotPltSection::new(word),
            igot_plt: IgotPltSection::new(word, config.is_arm()),
            mips_got: config.is_mips().then(|| MipsGotSection::new(config)),
            plt: PltSection::new(secnames::PLT_SECTION_NAME, target.plt_header_size()),
            iplt: PltSection::new(secnames::IPLT_SECTION_NAME, 0),
            rela_dyn: RelaDynSection::new(rela_dyn_name, config.is_rela, config.z_combreloc),
            rela_plt: RelaDynSection::new(rela_plt_name, config.is_rela, false),
            rela_iplt: RelaDynSection::new(rela_iplt_name, config.is_rela, false),
            dynamic: DynamicSection::new(config),
            dynstr: StringTableSection::new(secnames::DYNSTR_SECTION_NAME, true),
            strtab: StringTableSection::new(secnames::STRTAB_SECTION_NAME, false),
            shstrtab: StringTableSection::new(secnames::SHSTRTAB_SECTION_NAME, false),
            dynsym: SymbolTableSection::new(config, true),
            symtab: SymbolTableSection::new(config, false),
            gnu_hash: config.emit_gnu_hash.then(|| GnuHashSection::new(config)),
            sysv_hash: config.emit_sysv_hash.then(SysvHashSection::new),
            eh_frame: EhFrameSection::new(),
            eh_frame_hdr: EhFrameHdrSection::new(),
            build_id: BuildIdSection::new(),
            versym: VersionTableSection::new(),
            verdef: VersionDefinitionSection::new(),
            verneed: VersionNeedSection::new(config),
            gdb_index: GdbIndexSection::new(),
            cap_relocs: CapRelocsSection::new(),
            mips_abiflags: None,
            mips_options: None,
            mips_reginfo: None,
            mips_rld_map: (config.is_mips()
                && !config.is_shared()
                && !config.is_relocatable())
            .then(|| MipsRldMapSection::new(config)),
            arm_exidx_sentinel: config.is_arm().then(|| ArmExidxSentinelSection::new(word)),
            thunks: ThunkSection::new(word),
            bss: BssSection::new(secnames::BSS_SECTION_NAME),
            bss_rel_ro: BssSection::new(secnames::BSS_REL_RO_SECTION_NAME),
            interp: InterpSection::new(config.dynamic_linker.as_deref()),
            merge_strings: Vec::new(),
        }
    }

    pub fn section_by_id(&self, id: SynthSecId) -> Option<&dyn SyntheticSection> {
        Some(match id {
            SynthSecId::Got => &self.got,
            SynthSecId::GotPlt => &self.got_plt,
            SynthSecId::IgotPlt => &self.igot_plt,
            SynthSecId::MipsGot => self.mips_got.as_ref()?,
            SynthSecId::Plt => &self.plt,
            SynthSecId::Iplt => &self.iplt,
            SynthSecId::RelaDyn => &self.rela_dyn,
            SynthSecId::RelaPlt => &self.rela_plt,
            SynthSecId::RelaIplt => &self.rela_iplt,
            SynthSecId::Dynamic => &self.dynamic,
            SynthSecId::Dynstr => &self.dynstr,
            SynthSecId::Strtab => &self.strtab,
            SynthSecId::Shstrtab => &self.shstrtab,
            SynthSecId::Dynsym => &self.dynsym,
            SynthSecId::Symtab => &self.symtab,
            SynthSecId::GnuHash => self.gnu_hash.as_ref()?,
            SynthSecId::SysvHash => self.sysv_hash.as_ref()?,
            SynthSecId::EhFrame => &self.eh_frame,
            SynthSecId::EhFrameHdr => &self.eh_frame_hdr,
            SynthSecId::BuildId => &self.build_id,
            SynthSecId::Versym => &self.versym,
            SynthSecId::Verdef => &self.verdef,
            SynthSecId::Verneed => &self.verneed,
            SynthSecId::GdbIndex => &self.gdb_index,
            SynthSecId::CapRelocs => &self.cap_relocs,
            SynthSecId::MipsAbiFlags => self.mips_abiflags.as_ref()?,
            SynthSecId::MipsOptions => self.mips_options.as_ref()?,
            SynthSecId::MipsReginfo => self.mips_reginfo.as_ref()?,
            SynthSecId::MipsRldMap => self.mips_rld_map.as_ref()?,
            SynthSecId::ArmExidxSentinel => self.arm_exidx_sentinel.as_ref()?,
            SynthSecId::Thunks => &self.thunks,
            SynthSecId::Bss => &self.bss,
            SynthSecId::BssRelRo => &self.bss_rel_ro,
            SynthSecId::Interp => &self.interp,
        })
    }

    fn section_by_id_mut(&mut self, id: SynthSecId) -> Option<&mut dyn SyntheticSection> {
        Some(match id {
            SynthSecId::Got => &mut self.got,
            SynthSecId::GotPlt => &mut self.got_plt,
            SynthSecId::IgotPlt => &mut self.igot_plt,
            SynthSecId::MipsGot => self.mips_got.as_mut()?,
            SynthSecId::Plt => &mut self.plt,
            SynthSecId::Iplt => &mut self.iplt,
            SynthSecId::RelaDyn => &mut self.rela_dyn,
            SynthSecId::RelaPlt => &mut self.rela_plt,
            SynthSecId::RelaIplt => &mut self.rela_iplt,
            SynthSecId::Dynamic => &mut self.dynamic,
            SynthSecId::Dynstr => &mut self.dynstr,
            SynthSecId::Strtab => &mut self.strtab,
            SynthSecId::Shstrtab => &mut self.shstrtab,
            SynthSecId::Dynsym => &mut self.dynsym,
            SynthSecId::Symtab => &mut self.symtab,
            SynthSecId::GnuHash => self.gnu_hash.as_mut()?,
            SynthSecId::SysvHash => self.sysv_hash.as_mut()?,
            SynthSecId::EhFrame => &mut self.eh_frame,
            SynthSecId::EhFrameHdr => &mut self.eh_frame_hdr,
            SynthSecId::BuildId => &mut self.build_id,
            SynthSecId::Versym => &mut self.versym,
            SynthSecId::Verdef => &mut self.verdef,
            SynthSecId::Verneed => &mut self.verneed,
            SynthSecId::GdbIndex => &mut self.gdb_index,
            SynthSecId::CapRelocs => &mut self.cap_relocs,
            SynthSecId::MipsAbiFlags => self.mips_abiflags.as_mut()?,
            SynthSecId::MipsOptions => self.mips_options.as_mut()?,
            SynthSecId::MipsReginfo => self.mips_reginfo.as_mut()?,
            SynthSecId::MipsRldMap => self.mips_rld_map.as_mut()?,
            SynthSecId::ArmExidxSentinel => self.arm_exidx_sentinel.as_mut()?,
            SynthSecId::Thunks => &mut self.thunks,
            SynthSecId::Bss => &mut self.bss,
            SynthSecId::BssRelRo => &mut self.bss_rel_ro,
            SynthSecId::Interp => &mut self.interp,
        })
    }

    /// Every section that ends up in the output: live, non-empty, finalized.
    pub fn emitted_sections(&self) -> impl Iterator<Item = (SynthSecId, &dyn SyntheticSection)> {
        ALL_SECTION_IDS.iter().filter_map(move |&id| {
            let section = self.section_by_id(id)?;
            (section.base().live && !section.is_empty()).then_some((id, section))
        })
    }

    /// Assigns an output section to a synthetic section. Called by the
    /// placement pass.
    pub fn place(&mut self, id: SynthSecId, out: OutputSectionId, out_offset: u64) {
        if let Some(section) = self.section_by_id_mut(id) {
            let base = section.base_mut();
            base.out = Some(out);
            base.out_offset = out_offset;
        }
    }

    /// Like `place`, for the merged-string sections, which are addressed by
    /// index.
    pub fn place_merge_section(&mut self, index: usize, out: OutputSectionId, out_offset: u64) {
        let base = &mut self.merge_strings[index].base;
        base.out = Some(out);
        base.out_offset = out_offset;
    }

    // ------------------------------------------------------------------
    // Registration surfaces that span more than one section.
    // ------------------------------------------------------------------

    pub fn add_early_dynamic_entries(&mut self, config: &Config, inputs: &LinkInputs<'data>) {
        self.dynamic
            .add_early_entries(config, inputs, &mut self.dynstr);
    }

    pub fn add_verneed_symbol(
        &mut self,
        symbols: &mut SymbolDb<'data>,
        inputs: &LinkInputs<'data>,
        id: SymbolId,
    ) {
        self.verneed
            .add_symbol(symbols, inputs, &mut self.dynstr, id);
    }

    pub fn add_eh_frame_section(
        &mut self,
        inputs: &mut LinkInputs<'data>,
        symbols: &SymbolDb<'data>,
        config: &Config,
        id: InputSectionId,
    ) -> Result {
        self.eh_frame
            .add_section(inputs, symbols, config.format, id)
    }

    pub fn add_cap_relocs_section(
        &mut self,
        inputs: &mut LinkInputs<'data>,
        symbols: &SymbolDb<'data>,
        config: &Config,
        target: &dyn Target,
        id: InputSectionId,
    ) -> Result {
        self.cap_relocs
            .add_section(inputs, symbols, config, target, &mut self.rela_dyn, id)
    }

    /// Scans inputs for the MIPS auxiliary sections and builds their merged
    /// outputs.
    pub fn create_mips_sections(
        &mut self,
        inputs: &mut LinkInputs<'data>,
        config: &Config,
    ) -> Result {
        if !config.is_mips() {
            return Ok(());
        }
        self.mips_abiflags = MipsAbiFlagsSection::create(inputs, config)?;
        self.mips_options = MipsOptionsSection::create(inputs, config)?;
        self.mips_reginfo = MipsReginfoSection::create(inputs, config)?;
        Ok(())
    }

    /// Defines the target's PLT marker symbols in the static symbol table.
    pub fn add_plt_symbols(&mut self, target: &dyn Target, symbols: &mut SymbolDb<'data>) {
        self.plt
            .add_map_symbols(target, symbols, &mut self.symtab, &mut self.strtab);
        self.iplt
            .add_map_symbols(target, symbols, &mut self.symtab, &mut self.strtab);
    }

    /// Creates the `.comment` contents identifying the linker, fed through
    /// the merge-string machinery like any input piece.
    pub fn add_comment_section(&mut self, inputs: &mut LinkInputs<'data>) -> Result {
        let file = inputs.add_file(crate::input::InputFile::new("<internal>"));
        let mut section = crate::input::InputSection::new(
            file,
            secnames::COMMENT_SECTION_NAME.as_bytes(),
            crate::elf::sht::PROGBITS,
            COMMENT_CONTENTS,
        );
        section.flags = crate::elf::shf::MERGE.with(crate::elf::shf::STRINGS);
        section.entsize = 1;
        let id = inputs.add_section(section);

        let mut merged = MergeStringsSection::new(
            secnames::COMMENT_SECTION_NAME,
            crate::elf::sht::PROGBITS,
            crate::elf::shf::MERGE.with(crate::elf::shf::STRINGS),
            1,
        );
        merged.add_section(inputs, id)?;
        self.merge_strings.push(merged);
        Ok(())
    }

    /// Gathers defined common symbols into `.bss`, packed by descending
    /// alignment.
    pub fn allocate_commons(
        &mut self,
        config: &Config,
        symbols: &mut SymbolDb<'data>,
        outputs: &mut OutputSections,
    ) {
        if config.define_common {
            allocate_common_symbols(symbols, &mut self.bss, outputs);
        }
    }

    // ------------------------------------------------------------------
    // Finalize phase.
    // ------------------------------------------------------------------

    /// Runs every section's finalize in producer-to-consumer order. After
    /// this, all sizes are fixed; only addresses remain to be assigned.
    #[instrument(skip_all, name = "Finalize synthetic sections")]
    pub fn finalize(
        &mut self,
        config: &Config,
        target: &dyn Target,
        inputs: &mut LinkInputs<'data>,
        outputs: &mut OutputSections,
        symbols: &mut SymbolDb<'data>,
        epilogue: &EpilogueInputs,
    ) -> Result {
        let word = config.word_size();

        for merged in &mut self.merge_strings {
            merged.finalize(inputs, config.optimize);
        }

        self.eh_frame.finalize(inputs, config.format);
        self.eh_frame_hdr.finalize(self.eh_frame.num_fdes());
        self.eh_frame_hdr.base.live = !self.eh_frame.is_empty();

        self.got.finalize(word);
        self.got_plt
            .finalize(word, target.got_plt_header_entries());
        self.igot_plt.finalize(word);
        self.plt.finalize(target.plt_entry_size());
        self.iplt.finalize(target.plt_entry_size());

        // The MIPS GOT build feeds the dynamic relocation section, so it
        // must precede that section's finalize.
        if let Some(mips_got) = self.mips_got.as_mut() {
            mips_got.build(inputs, symbols, outputs, &mut self.rela_dyn, config, target)?;
        }
        self.cap_relocs.finalize()?;
        self.thunks.finalize();
        self.gdb_index.finalize();

        // Version sections touch .dynstr, so they come before anything that
        // needs its final size.
        self.verdef.finalize(config, &mut self.dynstr);
        self.verneed.finalize();

        // Dynsym ordering is delegated to .gnu.hash when present; the hash
        // sections then size themselves from the final symbol list.
        self.dynsym
            .finalize_dynamic(symbols, self.gnu_hash.as_mut(), config);
        if let Some(gnu_hash) = self.gnu_hash.as_mut() {
            gnu_hash.finalize(self.dynsym.num_symbols() as u32);
        }
        if let Some(sysv_hash) = self.sysv_hash.as_mut() {
            sysv_hash.finalize(symbols, self.dynsym.entries());
        }
        self.versym.finalize(self.dynsym.entries());
        self.versym.base.live =
            self.verdef.base.live || !self.verneed.is_empty();

        self.symtab.finalize_static(symbols);

        self.rela_dyn.finalize(config);
        self.rela_plt.finalize(config);
        self.rela_iplt.finalize(config);

        self.build_id.finalize(config);

        // The dynamic section reads nearly everything, so it goes last.
        let late = self.dynamic_late_inputs(config, symbols, outputs, epilogue);
        self.dynamic.finalize(config, &late);
        Ok(())
    }

    fn dynamic_late_inputs(
        &self,
        config: &Config,
        symbols: &SymbolDb<'data>,
        outputs: &OutputSections,
        epilogue: &EpilogueInputs,
    ) -> DynamicLateInputs {
        let dynsym_count = self.dynsym.num_symbols() as u64 + 1;
        let mips_gotsym = self
            .mips_got
            .as_ref()
            .and_then(|got| got.first_global_entry())
            .and_then(|id| symbols.get(id).dynsym_index.get())
            .map_or(dynsym_count, u64::from);
        DynamicLateInputs {
            rela_dyn_size: self.rela_dyn.size(),
            rela_dyn_entsize: self.rela_dyn.entry_size(config),
            relative_reloc_count: self.rela_dyn.relative_count() as u64,
            rela_plt_size: self.rela_plt.size(),
            dynstr_size: self.dynstr.size(),
            dynsym_count,
            symtab_entsize: SymbolTableSection::entry_size(config),
            has_gnu_hash: self.gnu_hash.is_some(),
            has_sysv_hash: self.sysv_hash.is_some(),
            preinit_array: epilogue.preinit_array,
            init_array: epilogue.init_array,
            fini_array: epilogue.fini_array,
            init_symbol: epilogue.init_symbol,
            fini_symbol: epilogue.fini_symbol,
            verdef_count: if self.verdef.base.live {
                self.verdef.num_definitions()
            } else {
                0
            },
            verneed_count: self.verneed.num_needed(),
            mips_local_gotno: self
                .mips_got
                .as_ref()
                .map_or(0, |got| got.local_entries_num(outputs)),
            mips_gotsym,
            has_mips_rld_map: self.mips_rld_map.is_some(),
        }
    }

    fn shndx(&self, outputs: &OutputSections, id: SynthSecId) -> Option<u32> {
        let section = self.section_by_id(id)?;
        section
            .base()
            .out
            .map(|out| u32::from(outputs.get(out).section_index))
    }

    /// Fills in output section link/info fields that point between our
    /// sections. Requires placement (section header indices assigned).
    pub fn set_output_links(&self, outputs: &mut OutputSections) {
        let links = [
            (SynthSecId::RelaDyn, SynthSecId::Dynsym, None),
            (SynthSecId::RelaPlt, SynthSecId::Dynsym, None),
            (SynthSecId::RelaIplt, SynthSecId::Dynsym, None),
            (SynthSecId::Dynamic, SynthSecId::Dynstr, None),
            (SynthSecId::SysvHash, SynthSecId::Dynsym, None),
            (SynthSecId::GnuHash, SynthSecId::Dynsym, None),
            (SynthSecId::Versym, SynthSecId::Dynsym, None),
            (
                SynthSecId::Verdef,
                SynthSecId::Dynstr,
                Some(self.verdef.num_definitions() as u32),
            ),
            (
                SynthSecId::Verneed,
                SynthSecId::Dynstr,
                Some(self.verneed.num_needed() as u32),
            ),
            (SynthSecId::Dynsym, SynthSecId::Dynstr, Some(self.dynsym.info)),
            (SynthSecId::Symtab, SynthSecId::Strtab, Some(self.symtab.info)),
        ];
        for (id, target_id, info) in links {
            let Some(out) = self.section_by_id(id).and_then(|s| s.base().out) else {
                continue;
            };
            let target_index = self.shndx(outputs, target_id);
            let record = outputs.get_mut(out);
            if let Some(target_index) = target_index {
                record.link = target_index;
            }
            if let Some(info) = info {
                record.info = info;
            }
        }
    }

    // ------------------------------------------------------------------
    // Write phase.
    // ------------------------------------------------------------------

    /// Writes every emitted section into `image`. The exception-frame
    /// section goes first (serially) because the header consumes the FDE
    /// table it produces; everything else is written in parallel into
    /// disjoint slices. The build-ID digest is computed last, over the
    /// complete image.
    #[instrument(skip_all, name = "Write synthetic sections")]
    pub fn write_all(
        &mut self,
        image: &mut [u8],
        config: &Config,
        target: &dyn Target,
        inputs: &LinkInputs<'data>,
        symbols: &mut SymbolDb<'data>,
        outputs: &OutputSections,
    ) -> Result {
        self.thunks.update_symbol_addresses(symbols, outputs);
        self.plt.update_map_symbol_addresses(symbols, outputs);
        self.iplt.update_map_symbol_addresses(symbols, outputs);

        // Serial pre-pass: .eh_frame produces the (pc, fde) pairs the header
        // sorts and emits.
        let fdes = {
            let cx = WriteCx {
                config,
                target,
                symbols,
                inputs,
                outputs,
                synth: self,
            };
            match self.eh_frame.base.file_offset(outputs) {
                Some(offset) if self.eh_frame.base.live && !self.eh_frame.is_empty() => {
                    let size = self.eh_frame.size() as usize;
                    let buf = &mut image[offset as usize..offset as usize + size];
                    Some(self.eh_frame.write_collecting_fdes(&cx, buf)?)
                }
                _ => None,
            }
        };
        if let Some(fdes) = fdes {
            self.eh_frame_hdr.set_fdes(fdes);
        }

        // Carve the image into one disjoint slice per remaining section.
        let mut jobs: Vec<(WriteJob, usize, usize)> = Vec::new();
        for (id, section) in self.emitted_sections() {
            if id == SynthSecId::EhFrame || section.base().ty == crate::elf::sht::NOBITS {
                continue;
            }
            let Some(offset) = section.base().file_offset(outputs) else {
                continue;
            };
            jobs.push((WriteJob::Synth(id), offset as usize, section.size() as usize));
        }
        for (index, merged) in self.merge_strings.iter().enumerate() {
            if !merged.base.live || merged.is_empty() {
                continue;
            }
            let Some(offset) = merged.base.file_offset(outputs) else {
                continue;
            };
            jobs.push((WriteJob::Merge(index), offset as usize, merged.size() as usize));
        }
        jobs.sort_by_key(|&(_, offset, _)| offset);

        let mut buffers: Vec<(WriteJob, &mut [u8])> = Vec::with_capacity(jobs.len());
        let mut rest = image;
        let mut consumed = 0usize;
        for (id, offset, size) in jobs {
            if offset < consumed {
                bail!("Synthetic sections overlap in the output image at 0x{offset:x}");
            }
            let (_, after_gap) = rest.split_at_mut(offset - consumed);
            let (buf, after) = after_gap.split_at_mut(size);
            buffers.push((id, buf));
            rest = after;
            consumed = offset + size;
        }

        let cx = WriteCx {
            config,
            target,
            symbols,
            inputs,
            outputs,
            synth: self,
        };
        buffers
            .into_par_iter()
            .try_for_each(|(job, buf)| -> Result {
                let section: &dyn SyntheticSection = match job {
                    WriteJob::Synth(id) => {
                        self.section_by_id(id).expect("emitted section exists")
                    }
                    WriteJob::Merge(index) => &self.merge_strings[index],
                };
                crate::debug_assert_bail!(
                    buf.len() as u64 == section.size(),
                    "Buffer for {} is {} bytes, section is {}",
                    section.base().name,
                    buf.len(),
                    section.size()
                );
                section
                    .write_to(&cx, buf)
                    .with_context(|| format!("Failed to write {}", section.base().name))
            })?;
        Ok(())
    }

    /// Final pass once the whole image (headers included) is in place.
    pub fn write_build_id(&self, image: &mut [u8], config: &Config, outputs: &OutputSections) -> Result {
        if let Some(offset) = self.build_id.base.file_offset(outputs) {
            self.build_id
                .write_build_id(image, offset as usize, config)?;
        }
        Ok(())
    }
}

/// Read-only context every `write_to` receives: configuration, collaborators
/// and the full section set for cross-references.
pub struct WriteCx<'a, 'data> {
    pub config: &'a Config,
    pub target: &'a dyn Target,
    pub symbols: &'a SymbolDb<'data>,
    pub inputs: &'a LinkInputs<'data>,
    pub outputs: &'a OutputSections,
    pub synth: &'a SyntheticSections<'data>,
}

impl WriteCx<'_, '_> {
    pub fn symbol_va(&self, id: SymbolId) -> u64 {
        self.symbol_va_plus(id, 0)
    }

    pub fn symbol_va_plus(&self, id: SymbolId, addend: i64) -> u64 {
        self.symbols.symbol_va_plus(
            id,
            addend,
            self.inputs,
            self.outputs,
            self.synth.bss.base.va(self.outputs),
        )
    }

    pub fn synth_va(&self, id: SynthSecId) -> u64 {
        self.synth
            .section_by_id(id)
            .map_or(0, |section| section.base().va(self.outputs))
    }

    pub fn plt_va(&self) -> u64 {
        self.synth_va(SynthSecId::Plt)
    }

    pub fn plt_size(&self) -> u64 {
        self.synth.plt.size()
    }

    pub fn got_plt_va(&self) -> u64 {
        self.synth_va(SynthSecId::GotPlt)
    }

    /// Where a symbol's PLT entry lives, accounting for the IPLT split.
    pub fn plt_entry_va(&self, id: SymbolId) -> u64 {
        let sym = self.symbols.get(id);
        let index = sym.plt_index.get().expect("PLT index not assigned");
        let entry_size = self.target.plt_entry_size();
        if sym.flags.contains(SymbolFlags::IN_IPLT) {
            self.synth.iplt.entry_va(self.outputs, index, entry_size)
        } else {
            self.synth.plt.entry_va(self.outputs, index, entry_size)
        }
    }

    /// Where a symbol's GOT-PLT slot lives, accounting for the IGOT split.
    pub fn got_plt_entry_va(&self, id: SymbolId) -> u64 {
        let sym = self.symbols.get(id);
        let index = sym.got_plt_index.get().expect("GOT-PLT index not assigned");
        let word = self.config.word_size();
        if sym.flags.contains(SymbolFlags::IN_IGOT) {
            self.synth_va(SynthSecId::IgotPlt) + u64::from(index) * word
        } else {
            self.synth_va(SynthSecId::GotPlt) + u64::from(index) * word
        }
    }

    /// Section header index commons were allocated into.
    pub fn common_shndx(&self) -> u16 {
        self.synth
            .bss
            .base
            .out
            .map_or(0, |out| self.outputs.get(out).section_index)
    }

    pub fn common_section_size(&self) -> u64 {
        self.synth.bss.size()
    }

    /// The primary `$gp` value, used by the MIPS register-info writers.
    pub fn mips_gp(&self) -> u64 {
        self.synth.mips_got.as_ref().map_or(0, |got| {
            got.gp(self.inputs, self.outputs, None, self.config.word_size())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comment_section_flows_through_string_merging() {
        let config = Config::default();
        let target = crate::target::Mips;
        let mut synth = SyntheticSections::new(&config, &target);
        let mut inputs = LinkInputs::default();
        synth.add_comment_section(&mut inputs).unwrap();

        let mut outputs = OutputSections::default();
        let mut symbols = SymbolDb::default();
        synth
            .finalize(
                &config,
                &target,
                &mut inputs,
                &mut outputs,
                &mut symbols,
                &EpilogueInputs::default(),
            )
            .unwrap();
        assert_eq!(
            synth.merge_strings[0].size() as usize,
            COMMENT_CONTENTS.len()
        );
    }
}

#[cfg(test)]
pub(crate) fn test_write_cx<R>(f: impl FnOnce(&WriteCx) -> R) -> R {
    let config = Config::default();
    let target = crate::target::Mips;
    let symbols = SymbolDb::default();
    let inputs = LinkInputs::default();
    let outputs = OutputSections::default();
    let synth = SyntheticSections::new(&config, &target);
    f(&WriteCx {
        config: &config,
        target: &target,
        symbols: &symbols,
        inputs: &inputs,
        outputs: &outputs,
        synth: &synth,
    })
}
