//! Thunk (range-extension trampoline) buffers. The thunk contents and the
//! decision of where one is needed belong to the per-target relocation code;
//! this section just packs them with their alignment and registers the
//! synthetic symbols that name them.

use crate::alignment::align_up;
use crate::context::WriteCx;
use crate::elf::secnames;
use crate::elf::shf;
use crate::elf::sht;
use crate::error::Result;
use crate::input::InputSectionId;
use crate::section::SectionBase;
use crate::section::SyntheticSection;
use crate::string_table::StringTableSection;
use crate::symbol::Symbol;
use crate::symbol::SymbolDb;
use crate::symbol::SymbolPlacement;
use crate::symtab::SymbolTableSection;

pub trait Thunk: Sync {
    fn size(&self) -> u64;

    fn alignment(&self) -> u64 {
        4
    }

    /// The name for the thunk's defining symbol.
    fn symbol_name(&self) -> String;

    /// The input section holding the branch the thunk extends.
    fn target_input_section(&self) -> Option<InputSectionId> {
        None
    }

    /// Writes the thunk's code. `va` is the thunk's own address.
    fn write(&self, cx: &WriteCx, buf: &mut [u8], va: u64) -> Result;
}

pub struct ThunkSection {
    pub base: SectionBase,
    thunks: Vec<(u64, crate::symbol::SymbolId, Box<dyn Thunk>)>,
}

impl ThunkSection {
    pub fn new(word_size: u64) -> Self {
        ThunkSection {
            base: SectionBase::new(
                secnames::TEXT_THUNK_SECTION_NAME,
                sht::PROGBITS,
                shf::ALLOC.with(shf::EXECINSTR),
                word_size,
            ),
            thunks: Vec::new(),
        }
    }

    /// Packs a thunk at the next aligned offset and defines a local symbol
    /// for it. Returns the thunk's offset within the section.
    pub fn add_thunk<'data>(
        &mut self,
        symbols: &mut SymbolDb<'data>,
        symtab: Option<(&mut SymbolTableSection, &mut StringTableSection<'data>)>,
        thunk: Box<dyn Thunk>,
    ) -> u64 {
        assert!(!self.base.finalized);
        let offset = align_up(self.base.size, thunk.alignment());
        self.base.size = offset + thunk.size();

        let mut symbol = Symbol::new(
            thunk.symbol_name().into_bytes(),
            SymbolPlacement::Absolute,
        );
        symbol.binding = object::elf::STB_LOCAL;
        symbol.sym_type = object::elf::STT_FUNC;
        symbol.value = offset;
        symbol.size = thunk.size();
        let id = symbols.add(symbol);
        if let Some((symtab, strtab)) = symtab {
            symtab.add_symbol(symbols, strtab, id);
        }

        self.thunks.push((offset, id, thunk));
        offset
    }

    pub fn target_input_section(&self) -> Option<InputSectionId> {
        self.thunks
            .first()
            .and_then(|(_, _, thunk)| thunk.target_input_section())
    }

    pub fn finalize(&mut self) {
        self.base.finalized = true;
    }

    /// Thunk symbols are created before addresses exist; once the section is
    /// placed, rebase them onto its address.
    pub fn update_symbol_addresses(
        &self,
        symbols: &mut SymbolDb,
        outputs: &crate::output::OutputSections,
    ) {
        let section_va = self.base.va(outputs);
        for (offset, id, _) in &self.thunks {
            symbols.get_mut(*id).value = section_va + offset;
        }
    }
}

impl SyntheticSection for ThunkSection {
    fn base(&self) -> &SectionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut SectionBase {
        &mut self.base
    }

    fn is_empty(&self) -> bool {
        self.thunks.is_empty()
    }

    fn write_to(&self, cx: &WriteCx, buf: &mut [u8]) -> Result {
        let section_va = self.base.va(cx.outputs);
        for (offset, _, thunk) in &self.thunks {
            let end = offset + thunk.size();
            thunk.write(
                cx,
                &mut buf[*offset as usize..end as usize],
                section_va + offset,
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedThunk {
        name: &'static str,
        bytes: Vec<u8>,
        alignment: u64,
    }

    impl Thunk for FixedThunk {
        fn size(&self) -> u64 {
            self.bytes.len() as u64
        }

        fn alignment(&self) -> u64 {
            self.alignment
        }

        fn symbol_name(&self) -> String {
            self.name.to_owned()
        }

        fn write(&self, _cx: &WriteCx, buf: &mut [u8], _va: u64) -> Result {
            buf.copy_from_slice(&self.bytes);
            Ok(())
        }
    }

    #[test]
    fn thunks_pack_with_alignment() {
        let mut db = SymbolDb::default();
        let mut section = ThunkSection::new(8);
        let first = section.add_thunk(
            &mut db,
            None,
            Box::new(FixedThunk {
                name: "__thunk_a",
                bytes: vec![0; 6],
                alignment: 4,
            }),
        );
        let second = section.add_thunk(
            &mut db,
            None,
            Box::new(FixedThunk {
                name: "__thunk_b",
                bytes: vec![0; 8],
                alignment: 8,
            }),
        );
        section.finalize();

        assert_eq!(first, 0);
        assert_eq!(second, 8);
        assert_eq!(section.size(), 16);
        assert_eq!(db.len(), 2);
    }
}
