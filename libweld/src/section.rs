//! The common shape shared by every synthetic section: a header of
//! name/flags/type/alignment, a back-reference to the output section the
//! layout pass placed it in, and the finalized size. Registration surfaces
//! and finalize signatures differ per section, so those stay on the concrete
//! types; the uniform parts are behind the `SyntheticSection` trait.

use crate::alignment::align_up;
use crate::context::WriteCx;
use crate::elf::SectionFlags;
use crate::elf::SectionType;
use crate::elf::secnames;
use crate::elf::sht;
use crate::elf::shf;
use crate::error::Result;
use crate::output::OutputSectionId;
use crate::output::OutputSections;
use crate::symbol::SymbolDb;
use crate::symbol::SymbolId;
use crate::symbol::SymbolPlacement;

pub struct SectionBase {
    pub name: &'static str,
    pub ty: SectionType,
    pub flags: SectionFlags,
    pub alignment: u64,
    pub entsize: u64,
    pub out: Option<OutputSectionId>,
    pub out_offset: u64,
    pub size: u64,
    pub live: bool,
    pub finalized: bool,
}

impl SectionBase {
    pub fn new(name: &'static str, ty: SectionType, flags: SectionFlags, alignment: u64) -> Self {
        SectionBase {
            name,
            ty,
            flags,
            alignment,
            entsize: 0,
            out: None,
            out_offset: 0,
            size: 0,
            live: true,
            finalized: false,
        }
    }

    /// The section's address in the output image. Zero until placed.
    pub fn va(&self, outputs: &OutputSections) -> u64 {
        match self.out {
            Some(out) => outputs.get(out).addr + self.out_offset,
            None => 0,
        }
    }

    pub fn file_offset(&self, outputs: &OutputSections) -> Option<u64> {
        self.out
            .map(|out| outputs.get(out).file_offset + self.out_offset)
    }
}

pub trait SyntheticSection {
    fn base(&self) -> &SectionBase;

    fn base_mut(&mut self) -> &mut SectionBase;

    /// Whether the section can be dropped from the output entirely.
    fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Valid after finalize.
    fn size(&self) -> u64 {
        self.base().size
    }

    /// Writes exactly `size()` bytes into `buf`.
    fn write_to(&self, cx: &WriteCx, buf: &mut [u8]) -> Result;
}

/// Uninitialized space. Tracks only size and alignment; `write_to` has
/// nothing to emit.
pub struct BssSection {
    pub base: SectionBase,
}

impl BssSection {
    pub fn new(name: &'static str) -> Self {
        BssSection {
            base: SectionBase::new(name, sht::NOBITS, shf::ALLOC.with(shf::WRITE), 1),
        }
    }

    /// Reserves `size` bytes aligned to `alignment` and returns the offset of
    /// the reservation.
    pub fn reserve_space(&mut self, size: u64, alignment: u64, outputs: &mut OutputSections) -> u64 {
        if let Some(out) = self.base.out {
            outputs.get_mut(out).update_alignment(alignment);
        }
        self.base.size = align_up(self.base.size, alignment) + size;
        self.base.alignment = self.base.alignment.max(alignment);
        self.base.size - size
    }
}

impl SyntheticSection for BssSection {
    fn base(&self) -> &SectionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut SectionBase {
        &mut self.base
    }

    fn write_to(&self, _cx: &WriteCx, _buf: &mut [u8]) -> Result {
        Ok(())
    }
}

/// The dynamic-linker path, NUL terminated.
pub struct InterpSection {
    pub base: SectionBase,
    path: Vec<u8>,
}

impl InterpSection {
    pub fn new(dynamic_linker: Option<&str>) -> Self {
        let mut base = SectionBase::new(
            secnames::INTERP_SECTION_NAME,
            sht::PROGBITS,
            shf::ALLOC,
            1,
        );
        let path = match dynamic_linker {
            Some(path) => {
                let mut bytes = path.as_bytes().to_vec();
                bytes.push(0);
                bytes
            }
            None => {
                base.live = false;
                Vec::new()
            }
        };
        base.size = path.len() as u64;
        base.finalized = true;
        InterpSection { base, path }
    }
}

impl SyntheticSection for InterpSection {
    fn base(&self) -> &SectionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut SectionBase {
        &mut self.base
    }

    fn write_to(&self, _cx: &WriteCx, buf: &mut [u8]) -> Result {
        buf[..self.path.len()].copy_from_slice(&self.path);
        Ok(())
    }
}

/// Gathers all defined common symbols and allocates them into `bss`,
/// recording the assigned offset on each symbol. Sorting by descending
/// alignment packs them tighter.
pub fn allocate_common_symbols(
    symbols: &mut SymbolDb,
    bss: &mut BssSection,
    outputs: &mut OutputSections,
) {
    let mut commons: Vec<SymbolId> = symbols
        .ids()
        .filter(|id| symbols.get(*id).is_common())
        .collect();
    commons.sort_by_key(|id| {
        let SymbolPlacement::Common { alignment } = symbols.get(*id).placement else {
            unreachable!();
        };
        std::cmp::Reverse(alignment)
    });
    for id in commons {
        let sym = symbols.get_mut(id);
        let SymbolPlacement::Common { alignment } = sym.placement else {
            continue;
        };
        let size = sym.size;
        sym.value = bss.reserve_space(size, alignment, outputs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::Symbol;

    #[test]
    fn common_symbols_pack_by_alignment() {
        let mut db = SymbolDb::default();
        let mut add = |name: &'static [u8], size, alignment| {
            let mut sym = Symbol::new(name, SymbolPlacement::Common { alignment });
            sym.size = size;
            db.add(sym)
        };
        let small = add(b"small", 1, 1);
        let big = add(b"big", 16, 16);
        let mid = add(b"mid", 4, 4);

        let mut bss = BssSection::new("COMMON");
        let mut outputs = OutputSections::default();
        allocate_common_symbols(&mut db, &mut bss, &mut outputs);

        assert_eq!(db.get(big).value, 0);
        assert_eq!(db.get(mid).value, 16);
        assert_eq!(db.get(small).value, 20);
        assert_eq!(bss.base.size, 21);
        assert_eq!(bss.base.alignment, 16);
    }
}
