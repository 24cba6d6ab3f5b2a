//! The generic GOT family. The MIPS GOT is different enough to live in its
//! own module.

use crate::context::WriteCx;
use crate::elf::secnames;
use crate::elf::shf;
use crate::elf::sht;
use crate::error::Result;
use crate::section::SectionBase;
use crate::section::SyntheticSection;
use crate::symbol::SymbolDb;
use crate::symbol::SymbolFlags;
use crate::symbol::SymbolId;

enum GotEntry {
    /// One slot holding the symbol's address (or zero until the runtime
    /// relocates it).
    Symbol(SymbolId),
    /// Module index + offset pair for a global-dynamic TLS access.
    DynTls(SymbolId),
    /// The shared module-index slot for local-dynamic TLS.
    TlsIndex,
}

pub struct GotSection {
    pub base: SectionBase,
    num_entries: u32,
    entries: Vec<GotEntry>,
    tls_index_entry: Option<u32>,
    /// A GOT-relative relocation was seen, so the section must exist even
    /// with no entries.
    pub has_got_off_rel: bool,
}

impl GotSection {
    pub fn new(word_size: u64) -> Self {
        let mut base = SectionBase::new(
            secnames::GOT_SECTION_NAME,
            sht::PROGBITS,
            shf::ALLOC.with(shf::WRITE),
            word_size,
        );
        base.entsize = word_size;
        GotSection {
            base,
            num_entries: 0,
            entries: Vec::new(),
            tls_index_entry: None,
            has_got_off_rel: false,
        }
    }

    pub fn add_entry(&mut self, symbols: &mut SymbolDb, id: SymbolId) {
        assert!(!self.base.finalized);
        symbols.get_mut(id).got_index.assign(self.num_entries);
        self.entries.push(GotEntry::Symbol(id));
        self.num_entries += 1;
    }

    /// Reserves the two slots a global-dynamic TLS access needs. Returns
    /// false if the symbol already had them.
    pub fn add_dyn_tls_entry(&mut self, symbols: &mut SymbolDb, id: SymbolId) -> bool {
        let sym = symbols.get_mut(id);
        if sym.global_dyn_index.is_assigned() {
            return false;
        }
        sym.global_dyn_index.assign(self.num_entries);
        self.entries.push(GotEntry::DynTls(id));
        self.num_entries += 2;
        true
    }

    /// Reserves the TLS module index slots. In total it takes two slots;
    /// only the first is meaningful.
    pub fn add_tls_index(&mut self) -> bool {
        if self.tls_index_entry.is_some() {
            return false;
        }
        self.tls_index_entry = Some(self.num_entries);
        self.entries.push(GotEntry::TlsIndex);
        self.num_entries += 2;
        true
    }

    pub fn tls_index_offset(&self, word_size: u64) -> Option<u64> {
        self.tls_index_entry.map(|n| u64::from(n) * word_size)
    }

    pub fn entry_va(&self, outputs: &crate::output::OutputSections, index: u32) -> u64 {
        self.base.va(outputs) + u64::from(index) * self.base.entsize
    }

    pub fn num_entries(&self) -> u32 {
        self.num_entries
    }

    pub fn finalize(&mut self, word_size: u64) {
        self.base.size = u64::from(self.num_entries) * word_size;
        self.base.finalized = true;
    }
}

impl SyntheticSection for GotSection {
    fn base(&self) -> &SectionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut SectionBase {
        &mut self.base
    }

    fn is_empty(&self) -> bool {
        self.num_entries == 0 && !self.has_got_off_rel
    }

    fn write_to(&self, cx: &WriteCx, buf: &mut [u8]) -> Result {
        // Slots that the runtime fills via dynamic relocations stay zero;
        // everything else gets the resolved address.
        let format = cx.config.format;
        let word = format.word_size() as usize;
        let mut offset = 0usize;
        for entry in &self.entries {
            match entry {
                GotEntry::Symbol(id) => {
                    let sym = cx.symbols.get(*id);
                    if !sym.is_preemptible {
                        format.write_word(buf, offset, cx.symbol_va(*id));
                    }
                    offset += word;
                }
                GotEntry::DynTls(id) => {
                    let sym = cx.symbols.get(*id);
                    if !sym.is_preemptible && !cx.config.is_pic() {
                        format.write_word(buf, offset, 1);
                        format.write_word(buf, offset + word, cx.symbol_va(*id));
                    }
                    offset += 2 * word;
                }
                GotEntry::TlsIndex => {
                    if !cx.config.is_pic() {
                        format.write_word(buf, offset, 1);
                    }
                    offset += 2 * word;
                }
            }
        }
        Ok(())
    }
}

pub struct GotPltSection {
    pub base: SectionBase,
    entries: Vec<SymbolId>,
}

impl GotPltSection {
    pub fn new(word_size: u64) -> Self {
        let mut base = SectionBase::new(
            secnames::GOT_PLT_SECTION_NAME,
            sht::PROGBITS,
            shf::ALLOC.with(shf::WRITE),
            word_size,
        );
        base.entsize = word_size;
        GotPltSection {
            base,
            entries: Vec::new(),
        }
    }

    pub fn add_entry(
        &mut self,
        symbols: &mut SymbolDb,
        id: SymbolId,
        header_entries: u64,
    ) {
        assert!(!self.base.finalized);
        symbols
            .get_mut(id)
            .got_plt_index
            .assign(header_entries as u32 + self.entries.len() as u32);
        self.entries.push(id);
    }

    pub fn finalize(&mut self, word_size: u64, header_entries: u64) {
        self.base.size = (header_entries + self.entries.len() as u64) * word_size;
        self.base.finalized = true;
    }
}

impl SyntheticSection for GotPltSection {
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
        let word = format.word_size() as usize;
        let header = cx.target.got_plt_header_entries() as usize * word;
        cx.target.write_got_plt_header(format, &mut buf[..header]);
        let plt_base = cx.plt_va();
        let mut offset = header;
        for &id in &self.entries {
            cx.target.write_got_plt(
                format,
                &mut buf[offset..offset + word],
                plt_base,
                cx.plt_entry_va(id),
            );
            offset += word;
        }
        Ok(())
    }
}

/// GOT-PLT slots for ifunc symbols. On ARM these are emitted inside `.got`;
/// elsewhere they follow `.got.plt`.
pub struct IgotPltSection {
    pub base: SectionBase,
    entries: Vec<SymbolId>,
}

impl IgotPltSection {
    pub fn new(word_size: u64, is_arm: bool) -> Self {
        let name = if is_arm {
            secnames::GOT_SECTION_NAME
        } else {
            secnames::IGOT_PLT_SECTION_NAME
        };
        let mut base = SectionBase::new(name, sht::PROGBITS, shf::ALLOC.with(shf::WRITE), word_size);
        base.entsize = word_size;
        IgotPltSection {
            base,
            entries: Vec::new(),
        }
    }

    pub fn add_entry(&mut self, symbols: &mut SymbolDb, id: SymbolId) {
        assert!(!self.base.finalized);
        let sym = symbols.get_mut(id);
        sym.flags |= SymbolFlags::IN_IGOT;
        sym.got_plt_index.assign(self.entries.len() as u32);
        self.entries.push(id);
    }

    pub fn finalize(&mut self, word_size: u64) {
        self.base.size = self.entries.len() as u64 * word_size;
        self.base.finalized = true;
    }
}

impl SyntheticSection for IgotPltSection {
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
        let word = format.word_size() as usize;
        for (i, &id) in self.entries.iter().enumerate() {
            cx.target
                .write_igot_plt(format, &mut buf[i * word..(i + 1) * word], cx.symbol_va(id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::Symbol;
    use crate::symbol::SymbolPlacement;

    #[test]
    fn entry_indices_are_assigned_in_order() {
        let mut db = SymbolDb::default();
        let a = db.add(Symbol::new(b"a".as_slice(), SymbolPlacement::Absolute));
        let b = db.add(Symbol::new(b"b".as_slice(), SymbolPlacement::Absolute));
        let c = db.add(Symbol::new(b"c".as_slice(), SymbolPlacement::Absolute));

        let mut got = GotSection::new(8);
        got.add_entry(&mut db, a);
        got.add_entry(&mut db, b);
        got.add_entry(&mut db, c);
        got.finalize(8);

        assert_eq!(db.get(a).got_index.get(), Some(0));
        assert_eq!(db.get(b).got_index.get(), Some(1));
        assert_eq!(db.get(c).got_index.get(), Some(2));
        assert_eq!(got.size(), 24);
    }

    #[test]
    fn dyn_tls_entries_take_two_slots_once() {
        let mut db = SymbolDb::default();
        let a = db.add(Symbol::new(b"a".as_slice(), SymbolPlacement::Absolute));

        let mut got = GotSection::new(8);
        assert!(got.add_dyn_tls_entry(&mut db, a));
        assert!(!got.add_dyn_tls_entry(&mut db, a));
        assert!(got.add_tls_index());
        assert!(!got.add_tls_index());
        got.finalize(8);

        assert_eq!(db.get(a).global_dyn_index.get(), Some(0));
        assert_eq!(got.tls_index_offset(8), Some(16));
        assert_eq!(got.size(), 32);
    }
}
