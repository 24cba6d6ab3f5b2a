//! The engine's view of parsed input files. Files own their sections;
//! synthetic sections borrow them by ID and never take ownership.

use crate::elf::SectionFlags;
use crate::elf::SectionType;
use crate::output::OutputSectionId;
use crate::symbol::SymbolId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId(u32);

impl FileId {
    pub fn from_usize(raw: usize) -> Self {
        FileId(u32::try_from(raw).expect("file IDs overflowed 32 bits"))
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InputSectionId(u32);

impl InputSectionId {
    pub fn from_usize(raw: usize) -> Self {
        InputSectionId(u32::try_from(raw).expect("section IDs overflowed 32 bits"))
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// A version definition read from a needed shared object, as consumed by
/// `.gnu.version_r`.
#[derive(Debug, Clone)]
pub struct SharedObjectVerdef<'data> {
    pub name: &'data [u8],
    pub hash: u32,
}

pub struct InputFile<'data> {
    pub name: String,
    /// For shared objects: the name recorded in DT_NEEDED entries.
    pub soname: Option<&'data str>,
    pub is_shared: bool,
    /// Whether a DT_NEEDED entry must be emitted for this shared object.
    pub is_needed: bool,
    /// Version definitions exported by this shared object.
    pub verdefs: Vec<SharedObjectVerdef<'data>>,
    pub sections: Vec<InputSectionId>,
    pub symbols: Vec<SymbolId>,
    /// Index of the merged sub-GOT this file's GOT entries landed in.
    /// Assigned by the MIPS GOT build.
    pub mips_got: Option<usize>,
    /// GP0 value from this file's `.reginfo` / `.MIPS.options`.
    pub mips_gp0: u64,
}

impl InputFile<'_> {
    pub fn new(name: impl Into<String>) -> Self {
        InputFile {
            name: name.into(),
            soname: None,
            is_shared: false,
            is_needed: false,
            verdefs: Vec::new(),
            sections: Vec::new(),
            symbols: Vec::new(),
            mips_got: None,
            mips_gp0: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reloc {
    pub offset: u64,
    pub r_type: u32,
    pub symbol: Option<SymbolId>,
    pub addend: i64,
}

/// Relocations attached to one input section. `is_rela` records whether the
/// input carried explicit addends; mixed inputs matter for the REL-output
/// compatibility path.
#[derive(Debug, Default, Clone)]
pub struct RelocationList {
    pub is_rela: bool,
    pub relocs: Vec<Reloc>,
}

/// A piece of a splittable section (exception frames, mergeable strings).
#[derive(Debug, Clone, Copy)]
pub struct SectionPiece {
    pub input_offset: u64,
    pub size: u64,
    pub live: bool,
    /// Filled during finalize.
    pub output_offset: u64,
}

pub struct InputSection<'data> {
    pub file: FileId,
    pub name: &'data [u8],
    pub ty: SectionType,
    pub flags: SectionFlags,
    pub data: &'data [u8],
    pub alignment: u64,
    pub entsize: u64,
    pub live: bool,
    pub out: Option<OutputSectionId>,
    pub out_offset: u64,
    /// Offset of this section's data within its object file. The debug index
    /// uses it to resolve DWARF addresses back to sections.
    pub file_offset: u64,
    pub relocations: RelocationList,
    pub pieces: Vec<SectionPiece>,
    /// For SHF_LINK_ORDER sections such as `.ARM.exidx` fragments: the
    /// executable section this one describes.
    pub link_order_dep: Option<InputSectionId>,
}

impl<'data> InputSection<'data> {
    pub fn new(file: FileId, name: &'data [u8], ty: SectionType, data: &'data [u8]) -> Self {
        InputSection {
            file,
            name,
            ty,
            flags: SectionFlags::empty(),
            data,
            alignment: 1,
            entsize: 0,
            live: true,
            out: None,
            out_offset: 0,
            file_offset: 0,
            relocations: RelocationList::default(),
            pieces: Vec::new(),
            link_order_dep: None,
        }
    }

    /// The address of this section in the output image. Zero for sections
    /// that were not placed.
    pub fn output_address(&self, outputs: &crate::output::OutputSections) -> u64 {
        match self.out {
            Some(out) => outputs.get(out).addr + self.out_offset,
            None => 0,
        }
    }
}

/// All parsed inputs, indexed by ID. Owned by the caller for the duration of
/// the link; the engine borrows it during register/finalize and again during
/// the write phase.
#[derive(Default)]
pub struct LinkInputs<'data> {
    pub files: Vec<InputFile<'data>>,
    pub sections: Vec<InputSection<'data>>,
}

impl<'data> LinkInputs<'data> {
    pub fn add_file(&mut self, file: InputFile<'data>) -> FileId {
        let id = FileId::from_usize(self.files.len());
        self.files.push(file);
        id
    }

    pub fn add_section(&mut self, section: InputSection<'data>) -> InputSectionId {
        let id = InputSectionId::from_usize(self.sections.len());
        self.files[section.file.as_usize()].sections.push(id);
        self.sections.push(section);
        id
    }

    pub fn file(&self, id: FileId) -> &InputFile<'data> {
        &self.files[id.as_usize()]
    }

    pub fn file_mut(&mut self, id: FileId) -> &mut InputFile<'data> {
        &mut self.files[id.as_usize()]
    }

    pub fn section(&self, id: InputSectionId) -> &InputSection<'data> {
        &self.sections[id.as_usize()]
    }

    pub fn section_mut(&mut self, id: InputSectionId) -> &mut InputSection<'data> {
        &mut self.sections[id.as_usize()]
    }

    pub fn section_ids(&self) -> impl Iterator<Item = InputSectionId> + '_ {
        (0..self.sections.len()).map(InputSectionId::from_usize)
    }
}
