//! The symbol model shared between the engine and its collaborators. Symbol
//! resolution happens upstream; the engine reads the resolved properties and
//! writes back the table indices it assigns.

use crate::input::FileId;
use crate::input::InputSectionId;
use crate::input::LinkInputs;
use crate::output::OutputSections;
use bitflags::bitflags;
use std::borrow::Cow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId(u32);

impl SymbolId {
    pub fn from_usize(raw: usize) -> Self {
        SymbolId(u32::try_from(raw).expect("symbol IDs overflowed 32 bits"))
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// An index into one of the tables the engine populates. Starts out
/// unassigned; the engine assigns each slot at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotIndex(u32);

impl SlotIndex {
    pub const UNASSIGNED: SlotIndex = SlotIndex(u32::MAX);

    pub fn get(self) -> Option<u32> {
        (self != Self::UNASSIGNED).then_some(self.0)
    }

    pub fn is_assigned(self) -> bool {
        self != Self::UNASSIGNED
    }

    pub fn assign(&mut self, value: u32) {
        debug_assert!(!self.is_assigned(), "table index assigned twice");
        self.0 = value;
    }

    /// Overwrites a possibly-assigned slot. The MIPS GOT build uses this when
    /// it renumbers primary-GOT entries after merging.
    pub fn set(&mut self, value: u32) {
        self.0 = value;
    }
}

impl Default for SlotIndex {
    fn default() -> Self {
        Self::UNASSIGNED
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SymbolFlags: u32 {
        /// The symbol got an IPLT entry rather than a regular PLT entry.
        const IN_IPLT = 1 << 0;
        /// The symbol's GOT-PLT slot lives in `.igot.plt` (or `.got` on ARM).
        const IN_IGOT = 1 << 1;
        /// The symbol's address must resolve to its PLT entry for pointer
        /// equality to hold.
        const NEEDS_PLT_ADDR = 1 << 2;
        /// A copy relocation places the definition in BSS.
        const NEEDS_COPY = 1 << 3;
        /// Local PIC definition (MIPS relocatable output marks these).
        const MIPS_PIC = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolPlacement {
    /// Defined in an input section.
    Defined(InputSectionId),
    /// Absolute value, no owning section.
    Absolute,
    /// A common definition; the allocator assigns its BSS offset.
    Common { alignment: u64 },
    /// Defined by a needed shared object. `verdef` indexes the version
    /// definition inside that object, when the symbol is versioned.
    Shared { verdef: Option<u32> },
    Undefined,
}

pub struct Symbol<'data> {
    pub name: Cow<'data, [u8]>,
    /// `object::elf::STB_*`
    pub binding: u8,
    /// `object::elf::STT_*`
    pub sym_type: u8,
    /// `object::elf::STV_*`
    pub visibility: u8,
    pub file: Option<FileId>,
    pub placement: SymbolPlacement,
    pub value: u64,
    pub size: u64,
    pub is_preemptible: bool,
    pub flags: SymbolFlags,

    // Engine-assigned table indices.
    pub got_index: SlotIndex,
    pub got_plt_index: SlotIndex,
    pub plt_index: SlotIndex,
    pub global_dyn_index: SlotIndex,
    pub dynsym_index: SlotIndex,
    pub version_id: u16,
}

impl<'data> Symbol<'data> {
    pub fn new(name: impl Into<Cow<'data, [u8]>>, placement: SymbolPlacement) -> Self {
        Symbol {
            name: name.into(),
            binding: object::elf::STB_GLOBAL,
            sym_type: object::elf::STT_NOTYPE,
            visibility: object::elf::STV_DEFAULT,
            file: None,
            placement,
            value: 0,
            size: 0,
            is_preemptible: false,
            flags: SymbolFlags::empty(),
            got_index: SlotIndex::UNASSIGNED,
            got_plt_index: SlotIndex::UNASSIGNED,
            plt_index: SlotIndex::UNASSIGNED,
            global_dyn_index: SlotIndex::UNASSIGNED,
            dynsym_index: SlotIndex::UNASSIGNED,
            version_id: object::elf::VER_NDX_GLOBAL,
        }
    }

    pub fn is_local(&self) -> bool {
        self.binding == object::elf::STB_LOCAL
    }

    pub fn is_tls(&self) -> bool {
        self.sym_type == object::elf::STT_TLS
    }

    pub fn is_func(&self) -> bool {
        self.sym_type == object::elf::STT_FUNC
    }

    pub fn is_section(&self) -> bool {
        self.sym_type == object::elf::STT_SECTION
    }

    pub fn is_undefined(&self) -> bool {
        self.placement == SymbolPlacement::Undefined
    }

    pub fn is_shared(&self) -> bool {
        matches!(self.placement, SymbolPlacement::Shared { .. })
    }

    pub fn is_common(&self) -> bool {
        matches!(self.placement, SymbolPlacement::Common { .. })
    }

    pub fn is_in_got(&self) -> bool {
        self.got_index.is_assigned()
    }

    pub fn is_in_plt(&self) -> bool {
        self.plt_index.is_assigned()
    }
}

/// Owns every symbol in the link. Sections refer to symbols by `SymbolId`.
#[derive(Default)]
pub struct SymbolDb<'data> {
    symbols: Vec<Symbol<'data>>,
}

impl<'data> SymbolDb<'data> {
    pub fn add(&mut self, symbol: Symbol<'data>) -> SymbolId {
        let id = SymbolId::from_usize(self.symbols.len());
        self.symbols.push(symbol);
        id
    }

    pub fn get(&self, id: SymbolId) -> &Symbol<'data> {
        &self.symbols[id.as_usize()]
    }

    pub fn get_mut(&mut self, id: SymbolId) -> &mut Symbol<'data> {
        &mut self.symbols[id.as_usize()]
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = SymbolId> + '_ {
        (0..self.symbols.len()).map(SymbolId::from_usize)
    }

    /// The virtual address of a symbol once output addresses are known.
    /// `common_base` is the address of the BSS section commons were packed
    /// into, zero before allocation.
    pub fn symbol_va(
        &self,
        id: SymbolId,
        inputs: &LinkInputs<'data>,
        outputs: &OutputSections,
        common_base: u64,
    ) -> u64 {
        self.symbol_va_plus(id, 0, inputs, outputs, common_base)
    }

    pub fn symbol_va_plus(
        &self,
        id: SymbolId,
        addend: i64,
        inputs: &LinkInputs<'data>,
        outputs: &OutputSections,
        common_base: u64,
    ) -> u64 {
        let sym = self.get(id);
        let base = match sym.placement {
            SymbolPlacement::Defined(section_id) => {
                let section = inputs.section(section_id);
                match section.out {
                    Some(out) => outputs.get(out).addr + section.out_offset + sym.value,
                    None => sym.value,
                }
            }
            SymbolPlacement::Absolute => sym.value,
            SymbolPlacement::Common { .. } => common_base + sym.value,
            SymbolPlacement::Shared { .. } | SymbolPlacement::Undefined => 0,
        };
        base.wrapping_add_signed(addend)
    }
}
