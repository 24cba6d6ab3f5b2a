//! PLT trampolines. Two instances share this type: the regular PLT (with the
//! lazy-resolver header, paired with `.rela.plt`) and the IPLT (headerless,
//! paired with `.rela.iplt`, which shares an offset space with `.rela.plt`).

use crate::config::Config;
use crate::context::WriteCx;
use crate::elf::shf;
use crate::elf::sht;
use crate::error::Result;
use crate::rela_dyn::RelaDynSection;
use crate::section::SectionBase;
use crate::section::SyntheticSection;
use crate::symbol::SymbolDb;
use crate::symbol::SymbolFlags;
use crate::symbol::SymbolId;

pub struct PltSection {
    pub base: SectionBase,
    header_size: u64,
    /// Each entry remembers the offset its relocation had in the paired
    /// relocation section at registration time.
    entries: Vec<(SymbolId, u64)>,
    /// Target-requested marker symbols (offset within section, symbol).
    map_symbols: Vec<(u64, SymbolId)>,
}

impl PltSection {
    pub fn new(name: &'static str, header_size: u64) -> Self {
        PltSection {
            base: SectionBase::new(
                name,
                sht::PROGBITS,
                shf::ALLOC.with(shf::EXECINSTR),
                16,
            ),
            header_size,
            entries: Vec::new(),
            map_symbols: Vec::new(),
        }
    }

    pub fn is_iplt(&self) -> bool {
        self.header_size == 0
    }

    pub fn add_entry(
        &mut self,
        symbols: &mut SymbolDb,
        paired_relocs: &RelaDynSection,
        config: &Config,
        id: SymbolId,
    ) {
        assert!(!self.base.finalized);
        let sym = symbols.get_mut(id);
        sym.plt_index.assign(self.entries.len() as u32);
        if self.is_iplt() {
            sym.flags |= SymbolFlags::IN_IPLT;
        }
        self.entries
            .push((id, paired_relocs.next_reloc_offset(config)));
    }

    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }

    pub fn header_size(&self) -> u64 {
        self.header_size
    }

    pub fn entry_va(&self, outputs: &crate::output::OutputSections, index: u32, entry_size: u64) -> u64 {
        self.base.va(outputs) + self.header_size + u64::from(index) * entry_size
    }

    pub fn finalize(&mut self, entry_size: u64) {
        self.base.size = self.header_size + self.entries.len() as u64 * entry_size;
        self.base.finalized = true;
    }

    /// Defines the marker symbols some targets want in the PLT. The header
    /// (when present) and every entry get the target's (name, offset) pairs.
    pub fn add_map_symbols<'data>(
        &mut self,
        target: &dyn crate::target::Target,
        symbols: &mut SymbolDb<'data>,
        symtab: &mut crate::symtab::SymbolTableSection,
        strtab: &mut crate::string_table::StringTableSection<'data>,
    ) {
        let mut define = |map_symbols: &mut Vec<(u64, SymbolId)>, name: &str, offset: u64| {
            let mut symbol = crate::symbol::Symbol::new(
                name.as_bytes().to_vec(),
                crate::symbol::SymbolPlacement::Absolute,
            );
            symbol.binding = object::elf::STB_LOCAL;
            let id = symbols.add(symbol);
            symtab.add_symbol(symbols, strtab, id);
            map_symbols.push((offset, id));
        };
        if self.header_size != 0 {
            for &(name, offset) in target.plt_header_map_symbols() {
                define(&mut self.map_symbols, name, offset);
            }
        }
        let entry_size = target.plt_entry_size();
        for index in 0..self.entries.len() as u64 {
            for &(name, offset) in target.plt_entry_map_symbols() {
                define(
                    &mut self.map_symbols,
                    name,
                    self.header_size + index * entry_size + offset,
                );
            }
        }
    }

    /// Rebases the marker symbols once the section has an address.
    pub fn update_map_symbol_addresses(
        &self,
        symbols: &mut SymbolDb,
        outputs: &crate::output::OutputSections,
    ) {
        let section_va = self.base.va(outputs);
        for &(offset, id) in &self.map_symbols {
            symbols.get_mut(id).value = section_va + offset;
        }
    }
}

impl SyntheticSection for PltSection {
    fn base(&self) -> &SectionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut SectionBase {
        &mut self.base
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn write_to(&self, cx: &WriteCx, buf: &mut [u8]) -> Result {
        let format = cx.config.format;
        // The header calls into the dynamic linker to resolve symbols
        // lazily. The IPLT has no header.
        if self.header_size != 0 {
            cx.target.write_plt_header(
                format,
                &mut buf[..self.header_size as usize],
                cx.got_plt_va(),
            );
        }
        // The IPLT follows the PLT, and their relocation sections share one
        // offset space.
        let rel_base = if self.is_iplt() { cx.plt_size() } else { 0 };
        let entry_size = cx.target.plt_entry_size();
        let mut offset = self.header_size;
        for (index, &(id, rel_offset)) in self.entries.iter().enumerate() {
            let got_va = cx.got_plt_entry_va(id);
            let plt_va = self.base.va(cx.outputs) + offset;
            cx.target.write_plt_entry(
                format,
                &mut buf[offset as usize..(offset + entry_size) as usize],
                got_va,
                plt_va,
                index as u32,
                rel_base + rel_offset,
            );
            offset += entry_size;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::secnames;
    use crate::symbol::Symbol;
    use crate::symbol::SymbolPlacement;

    #[test]
    fn plt_indices_and_size() {
        let config = Config::default();
        let mut db = SymbolDb::default();
        let a = db.add(Symbol::new(b"a".as_slice(), SymbolPlacement::Undefined));
        let b = db.add(Symbol::new(b"b".as_slice(), SymbolPlacement::Undefined));

        let rela_plt = RelaDynSection::new(secnames::RELA_PLT_SECTION_NAME, true, false);
        let mut plt = PltSection::new(secnames::PLT_SECTION_NAME, 32);
        plt.add_entry(&mut db, &rela_plt, &config, a);
        plt.add_entry(&mut db, &rela_plt, &config, b);
        plt.finalize(16);

        assert_eq!(db.get(a).plt_index.get(), Some(0));
        assert_eq!(db.get(b).plt_index.get(), Some(1));
        assert!(!db.get(a).flags.contains(SymbolFlags::IN_IPLT));
        assert_eq!(plt.size(), 32 + 2 * 16);
    }

    #[test]
    fn iplt_marks_symbols() {
        let config = Config::default();
        let mut db = SymbolDb::default();
        let a = db.add(Symbol::new(b"a".as_slice(), SymbolPlacement::Absolute));

        let rela_iplt = RelaDynSection::new(secnames::RELA_IPLT_SECTION_NAME, true, false);
        let mut iplt = PltSection::new(secnames::IPLT_SECTION_NAME, 0);
        iplt.add_entry(&mut db, &rela_iplt, &config, a);
        iplt.finalize(16);

        assert!(db.get(a).flags.contains(SymbolFlags::IN_IPLT));
        assert_eq!(iplt.size(), 16);
    }
}
