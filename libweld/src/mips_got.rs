//! The MIPS GOT. Unlike the generic GOT, entries must be addressable through
//! a 16-bit offset from `$gp`, so large links need several GOTs, each file
//! assigned to one. The build pass merges per-file GOTs into as few merged
//! GOTs as the configured size budget allows.

use crate::config::Config;
use crate::context::WriteCx;
use crate::elf::MIPS_GOT_HEADER_ENTRIES;
use crate::elf::secnames;
use crate::elf::shf;
use crate::elf::sht;
use crate::error::Result;
use crate::input::FileId;
use crate::input::LinkInputs;
use crate::output::OutputSectionId;
use crate::output::OutputSections;
use crate::rela_dyn::DynamicReloc;
use crate::rela_dyn::RelaDynSection;
use crate::rela_dyn::RelocPlace;
use crate::section::SectionBase;
use crate::section::SyntheticSection;
use crate::symbol::SymbolDb;
use crate::symbol::SymbolId;
use crate::target::Target;
use anyhow::bail;
use indexmap::IndexMap;

type Map<K, V> = IndexMap<K, V, foldhash::fast::RandomState>;

/// How a relocation wants to address the GOT. Classification drives which
/// part of the sub-GOT the entry lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MipsGotAccess {
    /// Page address of a local symbol.
    Page,
    /// 32-bit indexed local entry.
    Off32,
    /// 16-bit indexed local entry.
    Off16,
    /// Absolute address; preemptible symbols become reloc-only entries.
    Abs,
}

pub fn mips_page_addr(addr: u64) -> u64 {
    (addr.wrapping_add(0x8000)) & !0xffff
}

pub fn mips_page_count(size: u64) -> u64 {
    (size + 0xfffe) / 0xffff + 1
}

#[derive(Default, Clone)]
struct FileGot {
    file: Option<FileId>,
    start_index: u32,
    /// Output sections referenced by page relocations, with the index of
    /// their first page entry once assigned.
    page_index_map: Map<OutputSectionId, u32>,
    local16: Map<(SymbolId, i64), u32>,
    local32: Map<(SymbolId, i64), u32>,
    global: Map<SymbolId, u32>,
    relocs: Map<SymbolId, u32>,
    tls: Map<SymbolId, u32>,
    /// `None` is the single module-index entry shared by local-dynamic TLS.
    dyn_tls: Map<Option<SymbolId>, u32>,
}

fn set_union<K: core::hash::Hash + Eq + Copy>(dst: &mut Map<K, u32>, src: &Map<K, u32>) {
    for (&key, &value) in src {
        dst.entry(key).or_insert(value);
    }
}

impl FileGot {
    fn page_entries_num(&self, outputs: &OutputSections) -> u64 {
        self.page_index_map
            .keys()
            .map(|&out| mips_page_count(outputs.get(out).size))
            .sum()
    }

    fn entries_num(&self, outputs: &OutputSections) -> u64 {
        self.page_entries_num(outputs)
            + self.local16.len() as u64
            + self.global.len() as u64
            + self.relocs.len() as u64
            + self.tls.len() as u64
            + self.dyn_tls.len() as u64 * 2
    }

    /// Entries that must stay within the 16-bit index window. If there are
    /// TLS entries they are allocated after the reloc-only block, so both
    /// count.
    fn index_entries_num(&self, outputs: &OutputSections) -> u64 {
        let mut count =
            self.page_entries_num(outputs) + self.local16.len() as u64 + self.global.len() as u64;
        if !self.tls.is_empty() || !self.dyn_tls.is_empty() {
            count += self.relocs.len() as u64 + self.tls.len() as u64 + self.dyn_tls.len() as u64 * 2;
        }
        count
    }
}

pub struct MipsGotSection {
    pub base: SectionBase,
    gots: Vec<FileGot>,
    relocatable: bool,
}

impl MipsGotSection {
    pub fn new(config: &Config) -> Self {
        let mut base = SectionBase::new(
            secnames::GOT_SECTION_NAME,
            sht::PROGBITS,
            shf::ALLOC.with(shf::WRITE).with(shf::MIPS_GPREL),
            16,
        );
        base.entsize = config.word_size();
        MipsGotSection {
            base,
            gots: Vec::new(),
            relocatable: config.is_relocatable(),
        }
    }

    fn got_for_file<'a>(&'a mut self, inputs: &mut LinkInputs, file: FileId) -> &'a mut FileGot {
        let index = match inputs.file(file).mips_got {
            Some(index) => index,
            None => {
                self.gots.push(FileGot {
                    file: Some(file),
                    ..FileGot::default()
                });
                let index = self.gots.len() - 1;
                inputs.file_mut(file).mips_got = Some(index);
                index
            }
        };
        &mut self.gots[index]
    }

    pub fn add_entry(
        &mut self,
        inputs: &mut LinkInputs,
        symbols: &SymbolDb,
        file: FileId,
        id: SymbolId,
        addend: i64,
        access: MipsGotAccess,
    ) {
        assert!(!self.base.finalized);
        let sym = symbols.get(id);
        let out = match sym.placement {
            crate::symbol::SymbolPlacement::Defined(section) => inputs.section(section).out,
            _ => None,
        };
        let got = self.got_for_file(inputs, file);
        match access {
            MipsGotAccess::Page => {
                if let Some(out) = out {
                    got.page_index_map.entry(out).or_insert(0);
                }
            }
            _ if sym.is_tls() => {
                got.tls.entry(id).or_insert(0);
            }
            MipsGotAccess::Abs if sym.is_preemptible => {
                got.relocs.entry(id).or_insert(0);
            }
            _ if sym.is_preemptible => {
                got.global.entry(id).or_insert(0);
            }
            MipsGotAccess::Off32 => {
                got.local32.entry((id, addend)).or_insert(0);
            }
            _ => {
                got.local16.entry((id, addend)).or_insert(0);
            }
        }
    }

    pub fn add_dyn_tls_entry(&mut self, inputs: &mut LinkInputs, file: FileId, id: SymbolId) {
        self.got_for_file(inputs, file)
            .dyn_tls
            .entry(Some(id))
            .or_insert(0);
    }

    pub fn add_tls_index(&mut self, inputs: &mut LinkInputs, file: FileId) {
        self.got_for_file(inputs, file).dyn_tls.entry(None).or_insert(0);
    }

    fn try_merge_gots(
        dst: &mut FileGot,
        src: &FileGot,
        is_primary: bool,
        outputs: &OutputSections,
        config: &Config,
    ) -> bool {
        let mut merged = dst.clone();
        set_union(&mut merged.page_index_map, &src.page_index_map);
        set_union(&mut merged.local16, &src.local16);
        set_union(&mut merged.global, &src.global);
        set_union(&mut merged.relocs, &src.relocs);
        set_union(&mut merged.tls, &src.tls);
        set_union(&mut merged.dyn_tls, &src.dyn_tls);

        let header = if is_primary {
            u64::from(MIPS_GOT_HEADER_ENTRIES)
        } else {
            0
        };
        let count = header + merged.index_entries_num(outputs);
        if count * config.word_size() > config.mips_got_size {
            return false;
        }
        *dst = merged;
        true
    }

    /// Runs the GOT build pipeline: reclassify entries, merge sub-GOTs under
    /// the size budget, assign indices and emit dynamic relocations.
    pub fn build(
        &mut self,
        inputs: &mut LinkInputs,
        symbols: &mut SymbolDb,
        outputs: &OutputSections,
        rela_dyn: &mut RelaDynSection,
        config: &Config,
        target: &dyn Target,
    ) -> Result {
        if self.base.finalized {
            return Ok(());
        }
        self.base.finalized = true;
        if self.gots.is_empty() {
            self.update_alloc_size(outputs, config);
            return Ok(());
        }

        // A preemptible symbol may have become non-preemptible after, say, a
        // copy relocation. Move those from `global` to `local16`.
        for got in &mut self.gots {
            for (&id, _) in &got.global.clone() {
                if !symbols.get(id).is_preemptible {
                    got.local16.entry((id, 0)).or_insert(0);
                }
            }
            got.global.retain(|&id, _| symbols.get(id).is_preemptible);
        }

        // Drop reloc-only entries shadowed by a global entry for the same
        // symbol, and append 32-bit indexed locals after the 16-bit ones.
        for got in &mut self.gots {
            let global = std::mem::take(&mut got.global);
            got.relocs.retain(|id, _| !global.contains_key(id));
            got.global = global;
            let local32 = std::mem::take(&mut got.local32);
            set_union(&mut got.local16, &local32);
        }

        // The future primary GOT carries a reloc-only entry for every global
        // and reloc-only entry of every other GOT.
        let mut merged_gots = vec![FileGot::default()];
        for got in &mut self.gots {
            set_union(&mut merged_gots[0].relocs, &got.global);
            let relocs = std::mem::take(&mut got.relocs);
            set_union(&mut merged_gots[0].relocs, &relocs);
        }

        // Merge greedily: join each sub-GOT into the current tail unless that
        // would exceed the size budget, in which case start a new one.
        for got in std::mem::take(&mut self.gots) {
            let dst_index = merged_gots.len() - 1;
            let is_primary = dst_index == 0;
            if Self::try_merge_gots(&mut merged_gots[dst_index], &got, is_primary, outputs, config)
            {
                if let Some(file) = got.file {
                    inputs.file_mut(file).mips_got = Some(dst_index);
                }
            } else {
                if let Some(file) = got.file {
                    inputs.file_mut(file).mips_got = Some(merged_gots.len());
                }
                merged_gots.push(got);
            }
        }
        self.gots = merged_gots;

        for got in &self.gots {
            let header = if std::ptr::eq(got, &self.gots[0]) {
                u64::from(MIPS_GOT_HEADER_ENTRIES)
            } else {
                0
            };
            if (header + got.index_entries_num(outputs)) * config.word_size()
                > config.mips_got_size
            {
                bail!(
                    "MIPS GOT overflow: a single sub-GOT does not fit the 0x{:x} byte budget",
                    config.mips_got_size
                );
            }
        }

        // The primary GOT's reloc-only set still contains its own globals.
        let primary_global = self.gots[0].global.clone();
        self.gots[0]
            .relocs
            .retain(|id, _| !primary_global.contains_key(id));

        // Assign indices: header, then per sub-GOT pages, local16, global,
        // reloc-only, tls, dyn-tls.
        let mut index = MIPS_GOT_HEADER_ENTRIES;
        for (got_i, got) in self.gots.iter_mut().enumerate() {
            got.start_index = if got_i == 0 { 0 } else { index };
            for (&out, slot) in &mut got.page_index_map {
                // Worst case: every 64 KiB page of the output section has at
                // least one GOT relocation against it.
                *slot = index;
                index += mips_page_count(outputs.get(out).size) as u32;
            }
            for slot in got.local16.values_mut() {
                *slot = index;
                index += 1;
            }
            for slot in got.global.values_mut() {
                *slot = index;
                index += 1;
            }
            for slot in got.relocs.values_mut() {
                *slot = index;
                index += 1;
            }
            for slot in got.tls.values_mut() {
                *slot = index;
                index += 1;
            }
            for slot in got.dyn_tls.values_mut() {
                *slot = index;
                index += 2;
            }
        }

        // The dynamic symbol table sorts preemptible symbols by GOT index,
        // so publish the primary GOT positions.
        for (&id, &slot) in self.gots[0].global.iter().chain(self.gots[0].relocs.iter()) {
            symbols.get_mut(id).got_index.set(slot);
        }

        self.emit_dynamic_relocs(symbols, outputs, rela_dyn, config, target);
        self.update_alloc_size(outputs, config);
        tracing::debug!(
            num_gots = self.gots.len(),
            size = self.base.size,
            "merged MIPS GOTs"
        );
        Ok(())
    }

    fn emit_dynamic_relocs(
        &self,
        symbols: &SymbolDb,
        outputs: &OutputSections,
        rela_dyn: &mut RelaDynSection,
        config: &Config,
        target: &dyn Target,
    ) {
        let word = config.word_size();
        for (got_i, got) in self.gots.iter().enumerate() {
            for (&id, &slot) in &got.tls {
                if symbols.get(id).is_preemptible {
                    rela_dyn.add_reloc(
                        target,
                        DynamicReloc::new(
                            target.tls_got_rel(),
                            RelocPlace::MipsGot,
                            u64::from(slot) * word,
                            Some(id),
                            0,
                        ),
                    );
                }
            }
            for (&id, &slot) in &got.dyn_tls {
                let offset = u64::from(slot) * word;
                match id {
                    None => {
                        // The module-index-only slot needs no relocation in
                        // non-PIC output; the module index is known to be 1.
                        if config.is_pic() {
                            rela_dyn.add_reloc(
                                target,
                                DynamicReloc::new(
                                    target.tls_module_index_rel(),
                                    RelocPlace::MipsGot,
                                    offset,
                                    None,
                                    0,
                                ),
                            );
                        }
                    }
                    Some(id) => {
                        if !symbols.get(id).is_preemptible {
                            continue;
                        }
                        rela_dyn.add_reloc(
                            target,
                            DynamicReloc::new(
                                target.tls_module_index_rel(),
                                RelocPlace::MipsGot,
                                offset,
                                Some(id),
                                0,
                            ),
                        );
                        rela_dyn.add_reloc(
                            target,
                            DynamicReloc::new(
                                target.tls_offset_rel(),
                                RelocPlace::MipsGot,
                                offset + word,
                                Some(id),
                                0,
                            ),
                        );
                    }
                }
            }

            // Non-TLS entries of the primary GOT are written with final
            // addresses; only secondary GOTs need relocations for them.
            if got_i == 0 {
                continue;
            }

            for (&id, &slot) in &got.global {
                rela_dyn.add_reloc(
                    target,
                    DynamicReloc::new(
                        target.relative_rel(),
                        RelocPlace::MipsGot,
                        u64::from(slot) * word,
                        Some(id),
                        0,
                    ),
                );
            }
            if !config.is_pic() {
                continue;
            }
            for (&out, &first_slot) in &got.page_index_map {
                let page_count = mips_page_count(outputs.get(out).size);
                for page in 0..page_count {
                    rela_dyn.add_reloc(
                        target,
                        DynamicReloc::mips_page(
                            target.relative_rel(),
                            u64::from(first_slot) * word + page * word,
                            out,
                            (page * 0x10000) as i64,
                        ),
                    );
                }
            }
            for (&(id, addend), &slot) in &got.local16 {
                rela_dyn.add_reloc(
                    target,
                    DynamicReloc::new_sym_va(
                        target.relative_rel(),
                        RelocPlace::MipsGot,
                        u64::from(slot) * word,
                        id,
                        addend,
                    ),
                );
            }
        }
    }

    fn update_alloc_size(&mut self, outputs: &OutputSections, config: &Config) {
        let mut size = u64::from(MIPS_GOT_HEADER_ENTRIES) * config.word_size();
        for got in &self.gots {
            size += got.entries_num(outputs) * config.word_size();
        }
        self.base.size = size;
    }

    pub fn page_entry_offset(
        &self,
        inputs: &LinkInputs,
        outputs: &OutputSections,
        symbols: &SymbolDb,
        file: FileId,
        id: SymbolId,
        addend: i64,
        word: u64,
    ) -> Option<u64> {
        let got = &self.gots[inputs.file(file).mips_got?];
        let sym = symbols.get(id);
        let crate::symbol::SymbolPlacement::Defined(section) = sym.placement else {
            return None;
        };
        let out = inputs.section(section).out?;
        let sec_addr = mips_page_addr(outputs.get(out).addr);
        let sym_addr = mips_page_addr(symbols.symbol_va_plus(id, addend, inputs, outputs, 0));
        let index =
            u64::from(*got.page_index_map.get(&out)?) + (sym_addr.wrapping_sub(sec_addr)) / 0xffff;
        Some(index * word)
    }

    pub fn body_entry_offset(
        &self,
        inputs: &LinkInputs,
        symbols: &SymbolDb,
        file: FileId,
        id: SymbolId,
        addend: i64,
        word: u64,
    ) -> Option<u64> {
        let got = &self.gots[inputs.file(file).mips_got?];
        let sym = symbols.get(id);
        let slot = if sym.is_tls() {
            *got.tls.get(&id)?
        } else if sym.is_preemptible {
            *got.global.get(&id)?
        } else {
            *got.local16.get(&(id, addend))?
        };
        Some(u64::from(slot) * word)
    }

    pub fn tls_index_offset(&self, inputs: &LinkInputs, file: FileId, word: u64) -> Option<u64> {
        let got = &self.gots[inputs.file(file).mips_got?];
        Some(u64::from(*got.dyn_tls.get(&None)?) * word)
    }

    pub fn global_dyn_offset(
        &self,
        inputs: &LinkInputs,
        file: FileId,
        id: SymbolId,
        word: u64,
    ) -> Option<u64> {
        let got = &self.gots[inputs.file(file).mips_got?];
        Some(u64::from(*got.dyn_tls.get(&Some(id))?) * word)
    }

    /// The `$gp` value for code in `file`: 0x7ff0 past the base of the
    /// sub-GOT the file was merged into.
    pub fn gp(
        &self,
        inputs: &LinkInputs,
        outputs: &OutputSections,
        file: Option<FileId>,
        word: u64,
    ) -> u64 {
        let start = file
            .and_then(|f| inputs.file(f).mips_got)
            .map_or(0, |index| self.gots[index].start_index);
        self.base.va(outputs) + u64::from(start) * word + 0x7ff0
    }

    /// Number of entries the runtime loader treats as local: the header plus
    /// the primary GOT's page and 16-bit local entries.
    pub fn local_entries_num(&self, outputs: &OutputSections) -> u64 {
        let Some(primary) = self.gots.first() else {
            return u64::from(MIPS_GOT_HEADER_ENTRIES);
        };
        u64::from(MIPS_GOT_HEADER_ENTRIES)
            + primary.page_entries_num(outputs)
            + primary.local16.len() as u64
    }

    /// The first symbol with a global GOT entry; DT_MIPS_GOTSYM points at its
    /// dynsym slot.
    pub fn first_global_entry(&self) -> Option<SymbolId> {
        let primary = self.gots.first()?;
        primary
            .global
            .keys()
            .next()
            .or_else(|| primary.relocs.keys().next())
            .copied()
    }
}

impl SyntheticSection for MipsGotSection {
    fn base(&self) -> &SectionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut SectionBase {
        &mut self.base
    }

    fn is_empty(&self) -> bool {
        // The section stays in dynamic output because `.dynamic` mentions its
        // address and properties.
        self.relocatable
    }

    fn write_to(&self, cx: &WriteCx, buf: &mut [u8]) -> Result {
        let format = cx.config.format;
        let word = format.word_size();
        // Set the MSB of the second GOT slot. This is not required by any
        // MIPS ABI documentation, but all files generated by GNU tools carry
        // it, so runtime loaders may rely on it.
        format.write_word(buf, word as usize, 1u64 << (word * 8 - 1));
        let pic = cx.config.is_pic();
        for (got_i, got) in self.gots.iter().enumerate() {
            for (&out, &first_slot) in &got.page_index_map {
                let page_count = mips_page_count(cx.outputs.get(out).size);
                let first_page_addr = mips_page_addr(cx.outputs.get(out).addr);
                for page in 0..page_count {
                    let offset = (u64::from(first_slot) + page) * word;
                    format.write_word(buf, offset as usize, first_page_addr + page * 0x10000);
                }
            }
            for (&(id, addend), &slot) in &got.local16 {
                format.write_word(
                    buf,
                    (u64::from(slot) * word) as usize,
                    cx.symbol_va_plus(id, addend),
                );
            }
            // Secondary GOT globals are filled by REL32 dynamic relocations.
            if got_i == 0 {
                for (&id, &slot) in &got.global {
                    format.write_word(buf, (u64::from(slot) * word) as usize, cx.symbol_va(id));
                }
            }
            for (&id, &slot) in &got.relocs {
                format.write_word(buf, (u64::from(slot) * word) as usize, cx.symbol_va(id));
            }
            // TLS entries with dynamic relocations stay zero; otherwise the
            // value is adjusted by the thread-pointer offsets from the NPTL
            // ABI.
            for (&id, &slot) in &got.tls {
                let va = cx.symbol_va(id);
                let value = if cx.symbols.get(id).is_preemptible {
                    va
                } else {
                    va.wrapping_sub(0x7000)
                };
                format.write_word(buf, (u64::from(slot) * word) as usize, value);
            }
            for (&id, &slot) in &got.dyn_tls {
                let offset = u64::from(slot) * word;
                match id {
                    None => {
                        if !pic {
                            format.write_word(buf, offset as usize, 1);
                        }
                    }
                    Some(id) => {
                        if !cx.symbols.get(id).is_preemptible {
                            format.write_word(buf, offset as usize, 1);
                            format.write_word(
                                buf,
                                (offset + word) as usize,
                                cx.symbol_va(id).wrapping_sub(0x8000),
                            );
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::InputFile;
    use crate::input::InputSection;
    use crate::output::OutputSection;
    use crate::symbol::Symbol;
    use crate::symbol::SymbolPlacement;
    use crate::target::Mips;

    #[test]
    fn page_count_covers_section_boundaries() {
        assert_eq!(mips_page_count(1), 1);
        assert_eq!(mips_page_count(0xffff), 2);
        assert_eq!(mips_page_count(0x20000), 3);
    }

    #[test]
    fn build_assigns_indices_after_header() {
        let config = Config {
            machine: object::elf::EM_MIPS,
            ..Config::default()
        };
        let mut inputs = LinkInputs::default();
        let file = inputs.add_file(InputFile::new("a.o"));
        let mut outputs = OutputSections::default();
        let out = outputs.add(OutputSection::new(".text"));
        outputs.get_mut(out).size = 0x100;

        let mut symbols = SymbolDb::default();
        let section = inputs.add_section(InputSection::new(file, b".text", sht::PROGBITS, &[]));
        inputs.section_mut(section).out = Some(out);
        let mut local = Symbol::new(b"local".as_slice(), SymbolPlacement::Defined(section));
        local.binding = object::elf::STB_LOCAL;
        let local = symbols.add(local);
        let mut global = Symbol::new(b"global".as_slice(), SymbolPlacement::Undefined);
        global.is_preemptible = true;
        let global = symbols.add(global);

        let mut got = MipsGotSection::new(&config);
        got.add_entry(&mut inputs, &symbols, file, local, 0, MipsGotAccess::Off16);
        got.add_entry(&mut inputs, &symbols, file, global, 0, MipsGotAccess::Abs);

        let mut rela_dyn = RelaDynSection::new(
            crate::elf::secnames::RELA_DYN_SECTION_NAME,
            true,
            true,
        );
        got.build(&mut inputs, &mut symbols, &outputs, &mut rela_dyn, &config, &Mips)
            .unwrap();

        // Header (2) then the 16-bit local entry, then the reloc-only entry.
        assert_eq!(got.local_entries_num(&outputs), 3);
        assert_eq!(symbols.get(global).got_index.get(), Some(3));
        assert_eq!(got.size(), 4 * 8);
        assert_eq!(got.first_global_entry(), Some(global));
    }

    #[test]
    fn merge_respects_budget() {
        // Two files, each with enough 16-bit locals that both cannot share
        // one sub-GOT under a tiny budget.
        let config = Config {
            machine: object::elf::EM_MIPS,
            mips_got_size: (2 + 3) * 8, // header + 3 entries
            ..Config::default()
        };
        let mut inputs = LinkInputs::default();
        let outputs = OutputSections::default();
        let mut symbols = SymbolDb::default();
        let mut got = MipsGotSection::new(&config);

        for file_no in 0..2 {
            let file = inputs.add_file(InputFile::new(format!("f{file_no}.o")));
            for sym_no in 0..2 {
                let name = format!("s{file_no}_{sym_no}").into_bytes();
                let id = symbols.add(Symbol::new(name, SymbolPlacement::Absolute));
                got.add_entry(&mut inputs, &symbols, file, id, 0, MipsGotAccess::Off16);
            }
        }

        let mut rela_dyn = RelaDynSection::new(
            crate::elf::secnames::RELA_DYN_SECTION_NAME,
            true,
            true,
        );
        got.build(&mut inputs, &mut symbols, &outputs, &mut rela_dyn, &config, &Mips)
            .unwrap();

        assert_eq!(got.gots.len(), 2);
        assert_eq!(inputs.file(FileId::from_usize(0)).mips_got, Some(0));
        assert_eq!(inputs.file(FileId::from_usize(1)).mips_got, Some(1));
        for got_ref in &got.gots {
            assert!(got_ref.index_entries_num(&outputs) * 8 <= config.mips_got_size);
        }
    }
}
