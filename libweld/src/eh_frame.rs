//! Exception frames. Input `.eh_frame` sections are split into CIE and FDE
//! records; CIEs are deduplicated globally by their byte content and
//! personality symbol, FDEs survive only if the function they describe is
//! live. The header section is a binary-search table over the written FDEs,
//! so it consumes data the frame section produces during its own write.

use crate::context::WriteCx;
use crate::elf::EH_FRAME_ID_OFFSET;
use crate::elf::FDE_PC_BEGIN_OFFSET;
use crate::elf::eh_pe;
use crate::elf::secnames;
use crate::elf::shf;
use crate::elf::sht;
use crate::error::Result;
use crate::format::OutputFormat;
use crate::hash::PassThroughHashMap;
use crate::hash::PreHashed;
use crate::hash::hash_bytes;
use crate::input::InputSectionId;
use crate::input::LinkInputs;
use crate::input::SectionPiece;
use crate::section::SectionBase;
use crate::section::SyntheticSection;
use crate::symbol::SymbolId;
use crate::symbol::SymbolPlacement;
use anyhow::Context as _;
use anyhow::bail;
use anyhow::ensure;
use itertools::Itertools as _;

/// One entry for the header's search table: the PC an FDE covers and the
/// address of the FDE itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdeData {
    pub pc: u64,
    pub fde_va: u64,
}

struct CieRecord {
    section: InputSectionId,
    piece_index: usize,
    fde_encoding: u8,
    fdes: Vec<(InputSectionId, usize)>,
}

pub struct EhFrameSection<'data> {
    pub base: SectionBase,
    sections: Vec<InputSectionId>,
    cies: Vec<CieRecord>,
    cie_map: PassThroughHashMap<(&'data [u8], Option<SymbolId>), usize>,
    num_fdes: usize,
}

impl<'data> EhFrameSection<'data> {
    pub fn new() -> Self {
        EhFrameSection {
            base: SectionBase::new(
                secnames::EH_FRAME_SECTION_NAME,
                sht::PROGBITS,
                shf::ALLOC,
                1,
            ),
            sections: Vec::new(),
            cies: Vec::new(),
            cie_map: PassThroughHashMap::default(),
            num_fdes: 0,
        }
    }

    pub fn num_fdes(&self) -> usize {
        self.num_fdes
    }

    pub fn add_section(
        &mut self,
        inputs: &mut LinkInputs<'data>,
        symbols: &crate::symbol::SymbolDb,
        format: OutputFormat,
        id: InputSectionId,
    ) -> Result {
        assert!(!self.base.finalized);
        let name = file_name(inputs, id);
        {
            let section = inputs.section_mut(id);
            self.base.alignment = self.base.alignment.max(section.alignment);
            if section.pieces.is_empty() {
                section.pieces = split_eh_frame(section.data, format)
                    .with_context(|| format!("Invalid .eh_frame in {name}"))?;
            }
        }
        self.sections.push(id);

        let section = inputs.section(id);
        let data = section.data;
        let num_pieces = section.pieces.len();
        // Map from intra-input offset to CIE for resolving FDE references.
        let mut offset_to_cie: foldhash::HashMap<u64, usize> = foldhash::HashMap::default();
        let mut dead_pieces: Vec<usize> = Vec::new();

        for piece_index in 0..num_pieces {
            let piece = inputs.section(id).pieces[piece_index];
            // The empty record is the end marker.
            if piece.size == 4 {
                dead_pieces.push(piece_index);
                break;
            }
            let piece_bytes =
                &data[piece.input_offset as usize..(piece.input_offset + piece.size) as usize];
            let cie_id = format.read_u32(piece_bytes, EH_FRAME_ID_OFFSET);
            if cie_id == 0 {
                let (cie_index, is_new) =
                    self.add_cie(inputs, format, id, piece_index, piece_bytes)?;
                offset_to_cie.insert(piece.input_offset, cie_index);
                if !is_new {
                    // A byte-identical CIE was already emitted; this piece's
                    // relocations must not be applied on top of it.
                    dead_pieces.push(piece_index);
                }
                continue;
            }

            let cie_offset = piece
                .input_offset
                .wrapping_add(4)
                .wrapping_sub(u64::from(cie_id));
            let Some(&cie_index) = offset_to_cie.get(&cie_offset) else {
                bail!("{}: invalid CIE reference", file_name(inputs, id));
            };

            if !fde_is_live(inputs, symbols, id, &piece) {
                dead_pieces.push(piece_index);
                continue;
            }
            self.cies[cie_index].fdes.push((id, piece_index));
            self.num_fdes += 1;
        }

        for piece_index in dead_pieces {
            inputs.section_mut(id).pieces[piece_index].live = false;
        }
        Ok(())
    }

    /// Search for an existing CIE record or create a new one. CIEs are
    /// uniquified by their contents and where their relocations point.
    fn add_cie(
        &mut self,
        inputs: &LinkInputs<'data>,
        format: OutputFormat,
        id: InputSectionId,
        piece_index: usize,
        piece_bytes: &'data [u8],
    ) -> Result<(usize, bool)> {
        let section = inputs.section(id);
        let piece = &section.pieces[piece_index];
        let personality = first_reloc_in_piece(section, piece).and_then(|r| r.symbol);

        let key = PreHashed::new(
            (piece_bytes, personality),
            hash_bytes(piece_bytes) ^ personality.map_or(0, |p| p.as_usize() as u64),
        );
        if let Some(&existing) = self.cie_map.get(&key) {
            return Ok((existing, false));
        }
        let fde_encoding = parse_fde_encoding(piece_bytes, format)
            .with_context(|| format!("{}: malformed CIE", file_name(inputs, id)))?;
        let cie_index = self.cies.len();
        self.cies.push(CieRecord {
            section: id,
            piece_index,
            fde_encoding,
            fdes: Vec::new(),
        });
        self.cie_map.insert(key, cie_index);
        Ok((cie_index, true))
    }

    /// Lays out CIEs in first-seen order, each followed by its FDEs, every
    /// record padded up to the word size.
    pub fn finalize(&mut self, inputs: &mut LinkInputs<'data>, format: OutputFormat) {
        if self.base.finalized {
            return;
        }
        self.base.finalized = true;

        let word = format.word_size();
        let mut offset = 0u64;
        for cie in &self.cies {
            let piece = &mut inputs.section_mut(cie.section).pieces[cie.piece_index];
            piece.output_offset = offset;
            offset += piece.size.next_multiple_of(word);
            for &(fde_section, fde_piece) in &cie.fdes {
                let piece = &mut inputs.section_mut(fde_section).pieces[fde_piece];
                piece.output_offset = offset;
                offset += piece.size.next_multiple_of(word);
            }
        }

        // The LSB standard does not allow an .eh_frame section with zero call
        // frame information records, so an empty output still carries one
        // zero length word as a terminator.
        if offset == 0 {
            offset = 4;
        }
        self.base.size = offset;
    }

    /// Writes the deduplicated records, applies the input relocations, then
    /// decodes each FDE's PC for the header.
    pub fn write_collecting_fdes(&self, cx: &WriteCx, buf: &mut [u8]) -> Result<Vec<FdeData>> {
        let format = cx.config.format;
        let word = format.word_size();
        let va = self.base.va(cx.outputs);

        for cie in &self.cies {
            let cie_offset = self.copy_record(cx, buf, cie.section, cie.piece_index, word)?;
            for &(fde_section, fde_piece) in &cie.fdes {
                let fde_offset = self.copy_record(cx, buf, fde_section, fde_piece, word)?;
                // The FDE's second word is the offset back to its CIE.
                format.write_u32(
                    buf,
                    fde_offset as usize + EH_FRAME_ID_OFFSET,
                    (fde_offset + 4 - cie_offset) as u32,
                );
            }
        }

        for &section_id in &self.sections {
            self.relocate_section(cx, buf, va, section_id)?;
        }

        let mut fdes = Vec::with_capacity(self.num_fdes);
        for cie in &self.cies {
            for &(fde_section, fde_piece) in &cie.fdes {
                let piece = &cx.inputs.section(fde_section).pieces[fde_piece];
                let fde_offset = piece.output_offset;
                let pc = decode_fde_pc(format, buf, fde_offset, cie.fde_encoding, va)?;
                fdes.push(FdeData {
                    pc,
                    fde_va: va + fde_offset,
                });
            }
        }
        Ok(fdes)
    }

    fn copy_record(
        &self,
        cx: &WriteCx,
        buf: &mut [u8],
        section_id: InputSectionId,
        piece_index: usize,
        word: u64,
    ) -> Result<u64> {
        let section = cx.inputs.section(section_id);
        let piece = &section.pieces[piece_index];
        let out = piece.output_offset as usize;
        let bytes = &section.data
            [piece.input_offset as usize..(piece.input_offset + piece.size) as usize];
        buf[out..out + bytes.len()].copy_from_slice(bytes);
        // The record size field excludes the size word itself and covers the
        // alignment padding.
        cx.config.format.write_u32(
            buf,
            out,
            (piece.size.next_multiple_of(word) - 4) as u32,
        );
        Ok(piece.output_offset)
    }

    fn relocate_section(
        &self,
        cx: &WriteCx,
        buf: &mut [u8],
        section_va: u64,
        section_id: InputSectionId,
    ) -> Result {
        let section = cx.inputs.section(section_id);
        for reloc in &section.relocations.relocs {
            let Some(piece) = piece_containing(&section.pieces, reloc.offset) else {
                continue;
            };
            if !piece.live {
                continue;
            }
            let out_offset = piece.output_offset + (reloc.offset - piece.input_offset);
            let value = reloc
                .symbol
                .map_or(0, |id| cx.symbol_va(id))
                .wrapping_add_signed(reloc.addend);
            cx.target
                .apply_relocation(
                    cx.config.format,
                    buf,
                    out_offset as usize,
                    reloc.r_type,
                    value,
                    section_va + out_offset,
                )
                .with_context(|| {
                    format!(
                        "Failed to apply .eh_frame relocation at offset 0x{:x}",
                        reloc.offset
                    )
                })?;
        }
        Ok(())
    }
}

impl SyntheticSection for EhFrameSection<'_> {
    fn base(&self) -> &SectionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut SectionBase {
        &mut self.base
    }

    fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    fn write_to(&self, cx: &WriteCx, buf: &mut [u8]) -> Result {
        self.write_collecting_fdes(cx, buf).map(|_| ())
    }
}

/// The `.eh_frame_hdr` search table, preceded by a fixed 12-byte record.
pub struct EhFrameHdrSection {
    pub base: SectionBase,
    fdes: Vec<FdeData>,
}

impl EhFrameHdrSection {
    pub fn new() -> Self {
        EhFrameHdrSection {
            base: SectionBase::new(
                secnames::EH_FRAME_HDR_SECTION_NAME,
                sht::PROGBITS,
                shf::ALLOC,
                4,
            ),
            fdes: Vec::new(),
        }
    }

    pub fn finalize(&mut self, num_fdes: usize) {
        if self.base.finalized {
            return;
        }
        self.base.finalized = true;
        self.base.size = 12 + num_fdes as u64 * 8;
    }

    /// Called with the pairs the frame section decoded during its write.
    pub fn set_fdes(&mut self, fdes: Vec<FdeData>) {
        self.fdes = fdes;
    }
}

impl SyntheticSection for EhFrameHdrSection {
    fn base(&self) -> &SectionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut SectionBase {
        &mut self.base
    }

    fn write_to(&self, cx: &WriteCx, buf: &mut [u8]) -> Result {
        let format = cx.config.format;
        let va = self.base.va(cx.outputs);

        // Sort by PC and drop duplicates. Usually one FDE covers one
        // function, but ICF can fold two functions onto one address.
        let fdes: Vec<FdeData> = self
            .fdes
            .iter()
            .copied()
            .sorted_by_key(|fde| fde.pc)
            .dedup_by(|a, b| a.pc == b.pc)
            .collect();

        buf[0] = 1;
        buf[1] = eh_pe::PCREL | eh_pe::SDATA4;
        buf[2] = eh_pe::UDATA4;
        buf[3] = eh_pe::DATAREL | eh_pe::SDATA4;
        let eh_frame_va = cx.synth_va(crate::context::SynthSecId::EhFrame);
        format.write_u32(buf, 4, eh_frame_va.wrapping_sub(va + 4) as u32);
        format.write_u32(buf, 8, fdes.len() as u32);

        let mut at = 12usize;
        for fde in &fdes {
            format.write_u32(buf, at, fde.pc.wrapping_sub(va) as u32);
            format.write_u32(buf, at + 4, fde.fde_va.wrapping_sub(va) as u32);
            at += 8;
        }
        Ok(())
    }
}

fn file_name(inputs: &LinkInputs, id: InputSectionId) -> String {
    inputs.file(inputs.section(id).file).name.clone()
}

fn first_reloc_in_piece<'a>(
    section: &'a crate::input::InputSection,
    piece: &SectionPiece,
) -> Option<&'a crate::input::Reloc> {
    section
        .relocations
        .relocs
        .iter()
        .find(|r| r.offset >= piece.input_offset && r.offset < piece.input_offset + piece.size)
}

/// One FDE describes one function; it is live iff its pc-begin relocation
/// resolves to a symbol in a live section.
fn fde_is_live(
    inputs: &LinkInputs,
    symbols: &crate::symbol::SymbolDb,
    id: InputSectionId,
    piece: &SectionPiece,
) -> bool {
    let section = inputs.section(id);
    let Some(reloc) = first_reloc_in_piece(section, piece) else {
        return false;
    };
    let Some(symbol) = reloc.symbol else {
        return false;
    };
    match symbols.get(symbol).placement {
        SymbolPlacement::Defined(target) => inputs.section(target).live,
        _ => false,
    }
}

fn piece_containing(pieces: &[SectionPiece], offset: u64) -> Option<&SectionPiece> {
    pieces
        .iter()
        .find(|p| offset >= p.input_offset && offset < p.input_offset + p.size)
}

/// Splits `.eh_frame` data into its length-prefixed records. The terminator
/// (a zero length word) ends the walk.
pub fn split_eh_frame(data: &[u8], format: OutputFormat) -> Result<Vec<SectionPiece>> {
    let mut pieces = Vec::new();
    let mut offset = 0usize;
    while offset + 4 <= data.len() {
        let length = format.read_u32(data, offset);
        ensure!(
            length != 0xffff_ffff,
            "64-bit DWARF .eh_frame records are not supported"
        );
        let size = 4 + length as usize;
        ensure!(offset + size <= data.len(), "CFI record extends past section end");
        pieces.push(SectionPiece {
            input_offset: offset as u64,
            size: size as u64,
            live: true,
            output_offset: 0,
        });
        if length == 0 {
            break;
        }
        offset += size;
    }
    Ok(pieces)
}

/// Extracts the FDE pointer encoding advertised by a CIE's augmentation
/// data.
fn parse_fde_encoding(cie: &[u8], format: OutputFormat) -> Result<u8> {
    let mut at = 8usize; // length + id
    let version = *cie.get(at).context("CIE truncated")?;
    ensure!(
        version == 1 || version == 3,
        "Unsupported CIE version {version}"
    );
    at += 1;
    let aug_start = at;
    let aug_end = cie[at..]
        .iter()
        .position(|&b| b == 0)
        .map(|p| at + p)
        .context("CIE augmentation string is not terminated")?;
    let augmentation = &cie[aug_start..aug_end];
    at = aug_end + 1;

    let (_, len) = read_uleb128(&cie[at..])?; // code alignment factor
    at += len;
    let (_, len) = read_sleb128(&cie[at..])?; // data alignment factor
    at += len;
    if version == 1 {
        at += 1; // return address register
    } else {
        let (_, len) = read_uleb128(&cie[at..])?;
        at += len;
    }

    if augmentation.first() != Some(&b'z') {
        return Ok(eh_pe::ABSPTR);
    }
    let (_, len) = read_uleb128(&cie[at..])?; // augmentation data length
    at += len;
    for &ch in &augmentation[1..] {
        match ch {
            b'R' => return Ok(*cie.get(at).context("CIE truncated")?),
            b'P' => {
                let enc = *cie.get(at).context("CIE truncated")?;
                at += 1 + encoded_pointer_size(enc, format)?;
            }
            b'L' => at += 1,
            b'S' | b'B' => {}
            _ => bail!("Unknown CIE augmentation character {:?}", char::from(ch)),
        }
    }
    Ok(eh_pe::ABSPTR)
}

fn encoded_pointer_size(enc: u8, format: OutputFormat) -> Result<usize> {
    Ok(match enc & 0x7 {
        eh_pe::UDATA2 => 2,
        eh_pe::UDATA4 => 4,
        eh_pe::UDATA8 => 8,
        eh_pe::ABSPTR => format.word_size() as usize,
        _ => bail!("Unsupported encoded pointer size in CIE"),
    })
}

/// Reads the address an FDE applies to, stored 8 bytes in.
fn decode_fde_pc(
    format: OutputFormat,
    buf: &[u8],
    fde_offset: u64,
    encoding: u8,
    section_va: u64,
) -> Result<u64> {
    let at = fde_offset as usize + FDE_PC_BEGIN_OFFSET;
    let addr = match encoding & 0x7 {
        eh_pe::UDATA2 => u64::from(format.read_u16(buf, at)),
        eh_pe::UDATA4 => u64::from(format.read_u32(buf, at)),
        eh_pe::UDATA8 => format.read_u64(buf, at),
        eh_pe::ABSPTR => format.read_word(buf, at),
        _ => bail!("Unknown FDE size encoding"),
    };
    match encoding & 0x70 {
        eh_pe::ABSPTR => Ok(addr),
        eh_pe::PCREL => {
            let pc = section_va + fde_offset + FDE_PC_BEGIN_OFFSET as u64;
            // Narrow encodings are sign extended before the PC is added.
            let addr = match encoding & 0x7 {
                eh_pe::UDATA2 => i64::from(format.read_u16(buf, at) as i16) as u64,
                eh_pe::UDATA4 => i64::from(format.read_u32(buf, at) as i32) as u64,
                _ => addr,
            };
            Ok(addr.wrapping_add(pc))
        }
        _ => bail!("Unknown FDE size relative encoding"),
    }
}

fn read_uleb128(bytes: &[u8]) -> Result<(u64, usize)> {
    let mut result = 0u64;
    let mut shift = 0u32;
    for (i, &b) in bytes.iter().enumerate() {
        result |= u64::from(b & 0x7f) << shift;
        if b & 0x80 == 0 {
            return Ok((result, i + 1));
        }
        shift += 7;
        ensure!(shift < 64, "ULEB128 value too large");
    }
    bail!("Truncated ULEB128 value");
}

fn read_sleb128(bytes: &[u8]) -> Result<(i64, usize)> {
    let mut result = 0i64;
    let mut shift = 0u32;
    for (i, &b) in bytes.iter().enumerate() {
        result |= i64::from(b & 0x7f) << shift;
        shift += 7;
        if b & 0x80 == 0 {
            if shift < 64 && b & 0x40 != 0 {
                result |= -1i64 << shift;
            }
            return Ok((result, i + 1));
        }
        ensure!(shift < 64, "SLEB128 value too large");
    }
    bail!("Truncated SLEB128 value");
}
