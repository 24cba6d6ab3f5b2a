//! The static and dynamic symbol tables. Both hold (symbol, name offset)
//! pairs over their string table; ordering differs: the static table sorts
//! locals first, the dynamic one delegates ordering to `.gnu.hash` when
//! present, or to GOT order on MIPS.

use crate::config::Config;
use crate::context::WriteCx;
use crate::elf::STO_MIPS_PIC;
use crate::elf::STO_MIPS_PLT;
use crate::elf::SectionFlags;
use crate::elf::secnames;
use crate::elf::shf;
use crate::elf::sht;
use crate::error::Result;
use crate::hash_tables::GnuHashSection;
use crate::section::SectionBase;
use crate::section::SyntheticSection;
use crate::string_table::StringTableSection;
use crate::symbol::SymbolDb;
use crate::symbol::SymbolFlags;
use crate::symbol::SymbolId;
use crate::symbol::SymbolPlacement;

#[derive(Debug, Clone, Copy)]
pub struct SymbolTableEntry {
    pub symbol: SymbolId,
    pub name_offset: u32,
}

pub struct SymbolTableSection {
    pub base: SectionBase,
    is_dynamic: bool,
    entries: Vec<SymbolTableEntry>,
    /// sh_info: index of the first non-local symbol.
    pub info: u32,
}

impl SymbolTableSection {
    pub fn new(config: &Config, is_dynamic: bool) -> Self {
        let (name, ty, flags) = if is_dynamic {
            (secnames::DYNSYM_SECTION_NAME, sht::DYNSYM, shf::ALLOC)
        } else {
            (
                secnames::SYMTAB_SECTION_NAME,
                sht::SYMTAB,
                SectionFlags::empty(),
            )
        };
        let mut base = SectionBase::new(name, ty, flags, config.word_size());
        base.entsize = Self::entry_size(config);
        SymbolTableSection {
            base,
            is_dynamic,
            entries: Vec::new(),
            info: 1,
        }
    }

    pub fn entry_size(config: &Config) -> u64 {
        if config.format.is_64() { 24 } else { 16 }
    }

    pub fn is_dynamic(&self) -> bool {
        self.is_dynamic
    }

    pub fn add_symbol<'data>(
        &mut self,
        symbols: &SymbolDb<'data>,
        strtab: &mut StringTableSection<'data>,
        id: SymbolId,
    ) {
        assert!(!self.base.finalized);
        let sym = symbols.get(id);
        debug_assert!(
            !(self.is_dynamic && sym.is_local()),
            "local symbol added to .dynsym"
        );
        // Local symbol names repeat a lot (section names, file-scoped
        // statics), so hash those; globals are already unique.
        let hash_it = sym.is_local();
        let name_offset = strtab.add_string(sym.name.clone(), hash_it);
        self.entries.push(SymbolTableEntry {
            symbol: id,
            name_offset,
        });
    }

    pub fn num_symbols(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[SymbolTableEntry] {
        &self.entries
    }

    /// Finalizes the dynamic table: orders entries and assigns each symbol
    /// its dynsym index.
    pub fn finalize_dynamic(
        &mut self,
        symbols: &mut SymbolDb,
        gnu_hash: Option<&mut GnuHashSection>,
        config: &Config,
    ) {
        if self.base.finalized {
            return;
        }
        self.base.finalized = true;
        // All dynamic symbols are global, so sh_info is 1 (entry 0 is the
        // null entry).
        self.info = 1;

        if let Some(gnu_hash) = gnu_hash {
            // The hash section dictates symbol order: undefined first, then
            // bucket-grouped.
            gnu_hash.add_symbols(symbols, &mut self.entries);
        } else if config.is_mips() {
            // MIPS ABI: symbols with GOT entries go last, ordered by
            // ascending GOT index, mirroring the global GOT layout.
            self.entries.sort_by_key(|entry| {
                let sym = symbols.get(entry.symbol);
                match sym.got_index.get() {
                    Some(index) => (true, index),
                    None => (false, 0),
                }
            });
        }

        for (i, entry) in self.entries.iter().enumerate() {
            symbols
                .get_mut(entry.symbol)
                .dynsym_index
                .set(i as u32 + 1);
        }
        self.base.size = (self.entries.len() as u64 + 1) * self.base.entsize;
    }

    /// Finalizes the static table. Runs after thunk creation so thunk
    /// symbols are included; stable-partitions locals before globals.
    pub fn finalize_static(&mut self, symbols: &SymbolDb) {
        if self.base.finalized {
            return;
        }
        self.base.finalized = true;
        let mut ordered: Vec<SymbolTableEntry> = Vec::with_capacity(self.entries.len());
        let mut globals: Vec<SymbolTableEntry> = Vec::new();
        for entry in self.entries.drain(..) {
            if symbols.get(entry.symbol).is_local() {
                ordered.push(entry);
            } else {
                globals.push(entry);
            }
        }
        self.info = ordered.len() as u32 + 1;
        ordered.extend(globals);
        self.entries = ordered;
        self.base.size = (self.entries.len() as u64 + 1) * self.base.entsize;
    }
}

impl SyntheticSection for SymbolTableSection {
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
        let config = cx.config;
        let format = config.format;
        let entsize = self.base.entsize as usize;

        // The first entry stays zeroed as per the ELF spec.
        for (i, entry) in self.entries.iter().enumerate() {
            let at = (i + 1) * entsize;
            let sym = cx.symbols.get(entry.symbol);

            let info = (sym.binding << 4) | (sym.sym_type & 0xf);
            let mut other = sym.visibility & 0x3;
            // Help the MIPS runtime loader tell lazy-binding stubs from real
            // PLT-addressed functions, and mark PIC locals in relocatable
            // output.
            if config.is_mips() {
                if sym.is_in_plt() && sym.flags.contains(SymbolFlags::NEEDS_PLT_ADDR) {
                    other |= STO_MIPS_PLT;
                }
                if config.is_relocatable() && sym.flags.contains(SymbolFlags::MIPS_PIC) {
                    other |= STO_MIPS_PIC;
                }
            }

            let shndx: u16 = match sym.placement {
                SymbolPlacement::Defined(section) => match cx.inputs.section(section).out {
                    Some(out) => cx.outputs.get(out).section_index,
                    None => object::elf::SHN_ABS,
                },
                SymbolPlacement::Absolute => object::elf::SHN_ABS,
                SymbolPlacement::Common { .. } => {
                    if config.define_common {
                        cx.common_shndx()
                    } else {
                        object::elf::SHN_COMMON
                    }
                }
                SymbolPlacement::Shared { .. } | SymbolPlacement::Undefined => {
                    object::elf::SHN_UNDEF
                }
            };

            // st_value is normally the address; uninstantiated commons
            // (relocatable output) store their alignment instead.
            let value = match sym.placement {
                SymbolPlacement::Common { alignment } if !config.define_common => alignment,
                _ => cx.symbol_va(entry.symbol),
            };

            if format.is_64() {
                format.write_u32(buf, at, entry.name_offset);
                buf[at + 4] = info;
                buf[at + 5] = other;
                format.write_u16(buf, at + 6, shndx);
                format.write_u64(buf, at + 8, value);
                format.write_u64(buf, at + 16, sym.size);
            } else {
                format.write_u32(buf, at, entry.name_offset);
                format.write_u32(buf, at + 4, value as u32);
                format.write_u32(buf, at + 8, sym.size as u32);
                buf[at + 12] = info;
                buf[at + 13] = other;
                format.write_u16(buf, at + 14, shndx);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::Symbol;

    fn symbol(name: &'static [u8], binding: u8) -> Symbol<'static> {
        let mut sym = Symbol::new(name, SymbolPlacement::Absolute);
        sym.binding = binding;
        sym
    }

    #[test]
    fn static_table_partitions_locals_first() {
        let config = Config::default();
        let mut db = SymbolDb::default();
        let g1 = db.add(symbol(b"g1", object::elf::STB_GLOBAL));
        let l1 = db.add(symbol(b"l1", object::elf::STB_LOCAL));
        let g2 = db.add(symbol(b"g2", object::elf::STB_GLOBAL));
        let l2 = db.add(symbol(b"l2", object::elf::STB_LOCAL));

        let mut strtab = StringTableSection::new(".strtab", false);
        let mut symtab = SymbolTableSection::new(&config, false);
        for id in [g1, l1, g2, l2] {
            symtab.add_symbol(&db, &mut strtab, id);
        }
        symtab.finalize_static(&db);

        let order: Vec<SymbolId> = symtab.entries().iter().map(|e| e.symbol).collect();
        assert_eq!(order, vec![l1, l2, g1, g2]);
        assert_eq!(symtab.info, 3);
        assert_eq!(symtab.size(), 5 * 24);
    }

    #[test]
    fn dynamic_table_assigns_indices() {
        let config = Config::default();
        let mut db = SymbolDb::default();
        let a = db.add(symbol(b"a", object::elf::STB_GLOBAL));
        let b = db.add(symbol(b"b", object::elf::STB_GLOBAL));

        let mut dynstr = StringTableSection::new(".dynstr", true);
        let mut dynsym = SymbolTableSection::new(&config, true);
        dynsym.add_symbol(&db, &mut dynstr, a);
        dynsym.add_symbol(&db, &mut dynstr, b);
        dynsym.finalize_dynamic(&mut db, None, &config);

        assert_eq!(db.get(a).dynsym_index.get(), Some(1));
        assert_eq!(db.get(b).dynsym_index.get(), Some(2));
    }

    #[test]
    fn mips_dynsym_sorts_got_symbols_last_by_index() {
        let config = Config {
            machine: object::elf::EM_MIPS,
            ..Config::default()
        };
        let mut db = SymbolDb::default();
        let plain = db.add(symbol(b"plain", object::elf::STB_GLOBAL));
        let got_hi = db.add(symbol(b"got_hi", object::elf::STB_GLOBAL));
        let got_lo = db.add(symbol(b"got_lo", object::elf::STB_GLOBAL));
        db.get_mut(got_hi).got_index.set(7);
        db.get_mut(got_lo).got_index.set(3);

        let mut dynstr = StringTableSection::new(".dynstr", true);
        let mut dynsym = SymbolTableSection::new(&config, true);
        for id in [got_hi, plain, got_lo] {
            dynsym.add_symbol(&db, &mut dynstr, id);
        }
        dynsym.finalize_dynamic(&mut db, None, &config);

        let order: Vec<SymbolId> = dynsym.entries().iter().map(|e| e.symbol).collect();
        assert_eq!(order, vec![plain, got_lo, got_hi]);
    }
}
