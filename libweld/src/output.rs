//! Output-section records. Placement and ordering are decided by the layout
//! pass outside this engine; we only need each section's assigned address,
//! size, and header index, plus somewhere to record link/info fields.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputSectionId(u32);

impl OutputSectionId {
    pub fn from_usize(raw: usize) -> Self {
        OutputSectionId(u32::try_from(raw).expect("output section IDs overflowed 32 bits"))
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

pub struct OutputSection {
    pub name: Vec<u8>,
    pub addr: u64,
    pub size: u64,
    pub alignment: u64,
    /// File offset of this section's bytes in the output image.
    pub file_offset: u64,
    /// Index in the output section header table.
    pub section_index: u16,
    pub link: u32,
    pub info: u32,
}

impl OutputSection {
    pub fn new(name: impl Into<Vec<u8>>) -> Self {
        OutputSection {
            name: name.into(),
            addr: 0,
            size: 0,
            alignment: 1,
            file_offset: 0,
            section_index: 0,
            link: 0,
            info: 0,
        }
    }

    pub fn update_alignment(&mut self, alignment: u64) {
        self.alignment = self.alignment.max(alignment);
    }
}

#[derive(Default)]
pub struct OutputSections {
    sections: Vec<OutputSection>,
}

impl OutputSections {
    pub fn add(&mut self, section: OutputSection) -> OutputSectionId {
        let id = OutputSectionId::from_usize(self.sections.len());
        self.sections.push(section);
        id
    }

    pub fn get(&self, id: OutputSectionId) -> &OutputSection {
        &self.sections[id.as_usize()]
    }

    pub fn get_mut(&mut self, id: OutputSectionId) -> &mut OutputSection {
        &mut self.sections[id.as_usize()]
    }

    pub fn len(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }
}
