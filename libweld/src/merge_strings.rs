//! Merged sections. Input sections marked SHF_MERGE get split into pieces
//! and deduplicated; string pieces (SHF_STRINGS) can additionally share
//! storage with their suffixes when optimization allows. Output offsets are
//! written back into the contributing input sections before the write phase.

use crate::alignment::align_up;
use crate::context::WriteCx;
use crate::elf::SectionFlags;
use crate::elf::SectionType;
use crate::elf::shf;
use crate::error::Result;
use crate::hash::PassThroughHashMap;
use crate::hash::PreHashed;
use crate::hash::hash_bytes;
use crate::input::InputSectionId;
use crate::input::LinkInputs;
use crate::input::SectionPiece;
use crate::section::SectionBase;
use crate::section::SyntheticSection;
use anyhow::ensure;

pub struct MergeStringsSection<'data> {
    pub base: SectionBase,
    sections: Vec<InputSectionId>,
    /// Unique piece contents in output order, with their assigned offsets.
    entries: Vec<(&'data [u8], u64)>,
}

impl<'data> MergeStringsSection<'data> {
    pub fn new(name: &'static str, ty: SectionType, flags: SectionFlags, alignment: u64) -> Self {
        MergeStringsSection {
            base: SectionBase::new(name, ty, flags, alignment),
            sections: Vec::new(),
            entries: Vec::new(),
        }
    }

    /// Registers a mergeable input section, splitting it into pieces if the
    /// parser hasn't already.
    pub fn add_section(&mut self, inputs: &mut LinkInputs<'data>, id: InputSectionId) -> Result {
        assert!(!self.base.finalized);
        let section = inputs.section_mut(id);
        self.base.alignment = self.base.alignment.max(section.alignment);
        if section.pieces.is_empty() && !section.data.is_empty() {
            section.pieces = split_into_pieces(
                section.data,
                section.flags.contains(shf::STRINGS),
                section.entsize,
            )?;
        }
        self.sections.push(id);
        Ok(())
    }

    fn should_tail_merge(&self, optimize: u8) -> bool {
        self.base.flags.contains(shf::STRINGS) && optimize >= 2
    }

    /// Fixes the content and writes piece output offsets back into the
    /// contributing input sections.
    pub fn finalize(&mut self, inputs: &mut LinkInputs<'data>, optimize: u8) {
        if self.base.finalized {
            return;
        }
        self.base.finalized = true;

        if self.should_tail_merge(optimize) {
            self.finalize_tail_merge(inputs);
        } else {
            self.finalize_no_tail_merge(inputs);
        }
    }

    /// Offsets are assigned on first insertion; duplicates reuse the original
    /// offset.
    fn finalize_no_tail_merge(&mut self, inputs: &mut LinkInputs<'data>) {
        let mut offsets: PassThroughHashMap<&'data [u8], u64> = PassThroughHashMap::default();
        let mut size = 0;
        for &sec_id in &self.sections {
            let section = inputs.section_mut(sec_id);
            let data = section.data;
            for piece in &mut section.pieces {
                if !piece.live {
                    continue;
                }
                let bytes = piece_data(data, piece);
                let key = PreHashed::new(bytes, hash_bytes(bytes));
                let offset = *offsets.entry(key).or_insert_with(|| {
                    let offset = size;
                    size += bytes.len() as u64;
                    self.entries.push((bytes, offset));
                    offset
                });
                piece.output_offset = offset;
            }
        }
        self.base.size = align_up(size, self.base.alignment);
    }

    /// Deduplicates by substring suffix: a string that is the tail of another
    /// shares the longer string's storage.
    fn finalize_tail_merge(&mut self, inputs: &mut LinkInputs<'data>) {
        let mut unique: Vec<&'data [u8]> = Vec::new();
        let mut seen: PassThroughHashMap<&'data [u8], ()> = PassThroughHashMap::default();
        for &sec_id in &self.sections {
            let section = inputs.section(sec_id);
            for piece in &section.pieces {
                if !piece.live {
                    continue;
                }
                let bytes = piece_data(section.data, piece);
                if seen
                    .insert(PreHashed::new(bytes, hash_bytes(bytes)), ())
                    .is_none()
                {
                    unique.push(bytes);
                }
            }
        }

        // Sorting by reversed bytes, descending, places every string
        // immediately after the longest string it is a suffix of.
        unique.sort_by(|a, b| {
            let ra = a.iter().rev();
            let rb = b.iter().rev();
            rb.cmp(ra)
        });

        let mut offsets: PassThroughHashMap<&'data [u8], u64> = PassThroughHashMap::default();
        let mut size = 0u64;
        let mut prev: Option<(&'data [u8], u64)> = None;
        for bytes in unique {
            let offset = match prev {
                Some((prev_bytes, prev_offset)) if prev_bytes.ends_with(bytes) => {
                    prev_offset + (prev_bytes.len() - bytes.len()) as u64
                }
                _ => {
                    let offset = size;
                    size += bytes.len() as u64;
                    self.entries.push((bytes, offset));
                    prev = Some((bytes, offset));
                    offset
                }
            };
            offsets.insert(PreHashed::new(bytes, hash_bytes(bytes)), offset);
        }

        for &sec_id in &self.sections {
            let section = inputs.section_mut(sec_id);
            let data = section.data;
            for piece in &mut section.pieces {
                if !piece.live {
                    continue;
                }
                let bytes = piece_data(data, piece);
                piece.output_offset = offsets[&PreHashed::new(bytes, hash_bytes(bytes))];
            }
        }
        self.base.size = align_up(size, self.base.alignment);
    }
}

fn piece_data<'data>(data: &'data [u8], piece: &SectionPiece) -> &'data [u8] {
    &data[piece.input_offset as usize..(piece.input_offset + piece.size) as usize]
}

/// Splits section data into pieces: at NUL terminators for string sections
/// (the terminator belongs to the piece), at `entsize` boundaries otherwise.
pub fn split_into_pieces(data: &[u8], is_string: bool, entsize: u64) -> Result<Vec<SectionPiece>> {
    let mut pieces = Vec::new();
    if is_string {
        let mut offset = 0usize;
        while offset < data.len() {
            let nul = data[offset..]
                .iter()
                .position(|&b| b == 0)
                .map(|p| offset + p);
            ensure!(nul.is_some(), "String piece is not null terminated");
            let end = nul.unwrap() + 1;
            pieces.push(SectionPiece {
                input_offset: offset as u64,
                size: (end - offset) as u64,
                live: true,
                output_offset: 0,
            });
            offset = end;
        }
    } else {
        let entsize = entsize.max(1);
        ensure!(
            data.len() as u64 % entsize == 0,
            "Mergeable section size is not a multiple of its entry size"
        );
        for offset in (0..data.len() as u64).step_by(entsize as usize) {
            pieces.push(SectionPiece {
                input_offset: offset,
                size: entsize,
                live: true,
                output_offset: 0,
            });
        }
    }
    Ok(pieces)
}

impl SyntheticSection for MergeStringsSection<'_> {
    fn base(&self) -> &SectionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut SectionBase {
        &mut self.base
    }

    fn write_to(&self, _cx: &WriteCx, buf: &mut [u8]) -> Result {
        for (bytes, offset) in &self.entries {
            buf[*offset as usize..*offset as usize + bytes.len()].copy_from_slice(bytes);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::sht;
    use crate::input::FileId;
    use crate::input::InputFile;
    use crate::input::InputSection;

    fn string_section<'d>(inputs: &mut LinkInputs<'d>, data: &'d [u8]) -> InputSectionId {
        let mut section = InputSection::new(FileId::from_usize(0), b".rodata.str1.1", sht::PROGBITS, data);
        section.flags = shf::MERGE.with(shf::STRINGS);
        section.entsize = 1;
        inputs.add_section(section)
    }

    #[test]
    fn duplicate_strings_share_an_offset() {
        let mut inputs = LinkInputs::default();
        inputs.add_file(InputFile::new("a.o"));
        let a = string_section(&mut inputs, b"hello\0world\0");
        let b = string_section(&mut inputs, b"world\0");

        let mut merged =
            MergeStringsSection::new(".rodata.str", sht::PROGBITS, shf::MERGE.with(shf::STRINGS), 1);
        merged.add_section(&mut inputs, a).unwrap();
        merged.add_section(&mut inputs, b).unwrap();
        merged.finalize(&mut inputs, 1);

        assert_eq!(merged.size(), 12);
        let world_in_a = inputs.section(a).pieces[1].output_offset;
        let world_in_b = inputs.section(b).pieces[0].output_offset;
        assert_eq!(world_in_a, world_in_b);
    }

    #[test]
    fn tail_merge_shares_suffixes() {
        let mut inputs = LinkInputs::default();
        inputs.add_file(InputFile::new("a.o"));
        let a = string_section(&mut inputs, b"unwind\0");
        let b = string_section(&mut inputs, b"wind\0");

        let mut merged =
            MergeStringsSection::new(".rodata.str", sht::PROGBITS, shf::MERGE.with(shf::STRINGS), 1);
        merged.add_section(&mut inputs, a).unwrap();
        merged.add_section(&mut inputs, b).unwrap();
        merged.finalize(&mut inputs, 2);

        assert_eq!(merged.size(), 7);
        assert_eq!(inputs.section(a).pieces[0].output_offset, 0);
        assert_eq!(inputs.section(b).pieces[0].output_offset, 2);
    }
}
