//! The `.gdb_index` section (format version 7): a pre-computed index over
//! the DWARF data so the debugger doesn't have to parse `.debug_info` at
//! startup. We ingest each input's compilation units, address ranges and GNU
//! pubnames/pubtypes tables, then emit the CU list, address area, an
//! open-addressed symbol table and a constant pool. The index itself is
//! always little-endian, independent of the target byte order.

use crate::context::WriteCx;
use crate::elf::secnames;
use crate::elf::SectionFlags;
use crate::elf::sht;
use crate::error::Result;
use crate::format::Endianness;
use crate::hash::PassThroughHashMap;
use crate::hash::PreHashed;
use crate::hash::gdb_hash;
use crate::hash::hash_bytes;
use crate::input::FileId;
use crate::input::InputSectionId;
use crate::input::LinkInputs;
use crate::section::SectionBase;
use crate::section::SyntheticSection;
use anyhow::Context as _;
use anyhow::ensure;
use std::collections::BTreeSet;

const HEADER_SIZE: u64 = 24;
const CU_LIST_ENTRY_SIZE: u64 = 16;
const ADDRESS_ENTRY_SIZE: u64 = 20;
const SYMTAB_ENTRY_SIZE: u64 = 8;

struct AddressEntry {
    section: InputSectionId,
    low: u64,
    high: u64,
    cu_index: u32,
}

struct GdbSymbol {
    hash: u32,
    name_offset: u32,
    cu_vector_index: u32,
}

/// Interned strings for the constant pool. Starts with a NUL so offset zero
/// is the empty string.
struct StringPool<'data> {
    bytes_size: u32,
    strings: Vec<&'data [u8]>,
    dedup: PassThroughHashMap<&'data [u8], u32>,
}

impl<'data> StringPool<'data> {
    fn new() -> Self {
        StringPool {
            bytes_size: 1,
            strings: Vec::new(),
            dedup: PassThroughHashMap::default(),
        }
    }

    fn add(&mut self, string: &'data [u8]) -> u32 {
        let key = PreHashed::new(string, hash_bytes(string));
        if let Some(&offset) = self.dedup.get(&key) {
            return offset;
        }
        let offset = self.bytes_size;
        self.dedup.insert(key, offset);
        self.strings.push(string);
        self.bytes_size += string.len() as u32 + 1;
        offset
    }

    fn size(&self) -> u64 {
        u64::from(self.bytes_size)
    }

    fn write(&self, buf: &mut [u8]) {
        buf[0] = 0;
        let mut at = 1usize;
        for string in &self.strings {
            buf[at..at + string.len()].copy_from_slice(string);
            buf[at + string.len()] = 0;
            at += string.len() + 1;
        }
    }
}

pub struct GdbIndexSection<'data> {
    pub base: SectionBase,
    compilation_units: Vec<(u64, u64)>,
    address_area: Vec<AddressEntry>,
    symbols: Vec<GdbSymbol>,
    symbol_by_name: PassThroughHashMap<&'data [u8], usize>,
    cu_vectors: Vec<BTreeSet<u32>>,
    string_pool: StringPool<'data>,

    // Cumulative offsets computed at finalize.
    cu_types_offset: u64,
    sym_tab_offset: u64,
    constant_pool_offset: u64,
    cu_vector_offsets: Vec<u32>,
    cu_vectors_size: u64,
    string_pool_offset: u64,
    /// Open-addressed probe table; each slot indexes `symbols`.
    slots: Vec<Option<usize>>,
}

impl<'data> GdbIndexSection<'data> {
    pub fn new() -> Self {
        GdbIndexSection {
            base: SectionBase::new(
                secnames::GDB_INDEX_SECTION_NAME,
                sht::PROGBITS,
                SectionFlags::empty(),
                1,
            ),
            compilation_units: Vec::new(),
            address_area: Vec::new(),
            symbols: Vec::new(),
            symbol_by_name: PassThroughHashMap::default(),
            cu_vectors: Vec::new(),
            string_pool: StringPool::new(),
            cu_types_offset: 0,
            sym_tab_offset: 0,
            constant_pool_offset: 0,
            cu_vector_offsets: Vec::new(),
            cu_vectors_size: 0,
            string_pool_offset: 0,
            slots: Vec::new(),
        }
    }

    /// Ingests one input `.debug_info` section: its compilation units,
    /// address ranges and the file's GNU pubnames/pubtypes.
    pub fn add_debug_section(
        &mut self,
        inputs: &LinkInputs<'data>,
        endianness: Endianness,
        info_section: InputSectionId,
    ) -> Result {
        assert!(!self.base.finalized);
        let section = inputs.section(info_section);
        let file = section.file;
        let file_name = &inputs.file(file).name;

        let endian = match endianness {
            Endianness::Little => gimli::RunTimeEndian::Little,
            Endianness::Big => gimli::RunTimeEndian::Big,
        };
        let dwarf: gimli::Dwarf<gimli::EndianSlice<'data, gimli::RunTimeEndian>> =
            gimli::Dwarf::load(|id| -> Result<_> {
                Ok(gimli::EndianSlice::new(
                    debug_section_data(inputs, file, id.name()),
                    endian,
                ))
            })?;

        let base_cu_index = self.compilation_units.len() as u32;
        let mut cu_index = base_cu_index;
        let mut units = dwarf.units();
        while let Some(header) = units
            .next()
            .with_context(|| format!("{file_name}: error parsing DWARF unit headers"))?
        {
            self.compilation_units.push((
                section.out_offset + header.offset().as_debug_info_offset().map_or(0, |o| o.0 as u64),
                header.length_including_self() as u64,
            ));

            let unit = dwarf
                .unit(header)
                .with_context(|| format!("{file_name}: error parsing DWARF unit"))?;
            let mut ranges = dwarf.unit_ranges(&unit)?;
            while let Some(range) = ranges.next()? {
                if range.begin == range.end {
                    continue;
                }
                if let Some(target) = section_containing(inputs, file, range.begin) {
                    let target_offset = inputs.section(target).file_offset;
                    self.address_area.push(AddressEntry {
                        section: target,
                        low: range.begin - target_offset,
                        high: range.end - target_offset,
                        cu_index,
                    });
                }
            }
            cu_index += 1;
        }

        for table_name in [".debug_gnu_pubnames", ".debug_gnu_pubtypes"] {
            let data = debug_section_data(inputs, file, table_name);
            for (name, descriptor) in parse_gnu_pub_table(data, endianness)
                .with_context(|| format!("{file_name}: malformed {table_name}"))?
            {
                self.add_symbol(name, descriptor, base_cu_index);
            }
        }
        Ok(())
    }

    fn add_symbol(&mut self, name: &'data [u8], descriptor: u8, cu_index: u32) {
        let key = PreHashed::new(name, hash_bytes(name));
        let symbol_index = match self.symbol_by_name.get(&key) {
            Some(&index) => index,
            None => {
                let index = self.symbols.len();
                self.symbols.push(GdbSymbol {
                    hash: gdb_hash(name),
                    name_offset: self.string_pool.add(name),
                    cu_vector_index: self.cu_vectors.len() as u32,
                });
                self.cu_vectors.push(BTreeSet::new());
                self.symbol_by_name.insert(key, index);
                index
            }
        };
        let vector = self.symbols[symbol_index].cu_vector_index as usize;
        self.cu_vectors[vector].insert((u32::from(descriptor) << 24) | cu_index);
    }

    pub fn finalize(&mut self) {
        if self.base.finalized {
            return;
        }
        self.base.finalized = true;

        // Build the open-addressed probe table: power-of-two capacity with
        // room to keep the load factor under 3/4.
        let capacity = (self.symbols.len() * 4 / 3 + 1).next_power_of_two().max(16);
        self.slots = vec![None; capacity];
        let mask = capacity as u32 - 1;
        for (index, symbol) in self.symbols.iter().enumerate() {
            let mut slot = symbol.hash & mask;
            let step = ((symbol.hash.wrapping_mul(17)) & mask) | 1;
            while self.slots[slot as usize].is_some() {
                slot = (slot + step) & mask;
            }
            self.slots[slot as usize] = Some(index);
        }

        self.cu_types_offset =
            HEADER_SIZE + self.compilation_units.len() as u64 * CU_LIST_ENTRY_SIZE;
        self.sym_tab_offset =
            self.cu_types_offset + self.address_area.len() as u64 * ADDRESS_ENTRY_SIZE;
        self.constant_pool_offset =
            self.sym_tab_offset + self.slots.len() as u64 * SYMTAB_ENTRY_SIZE;

        self.cu_vectors_size = 0;
        for vector in &self.cu_vectors {
            self.cu_vector_offsets.push(self.cu_vectors_size as u32);
            self.cu_vectors_size += 4 * (vector.len() as u64 + 1);
        }
        self.string_pool_offset = self.constant_pool_offset + self.cu_vectors_size;

        self.base.size = self.string_pool_offset + self.string_pool.size();
    }
}

fn write32le(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn write64le(buf: &mut [u8], at: usize, value: u64) {
    buf[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

impl SyntheticSection for GdbIndexSection<'_> {
    fn base(&self) -> &SectionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut SectionBase {
        &mut self.base
    }

    fn is_empty(&self) -> bool {
        self.compilation_units.is_empty()
    }

    fn write_to(&self, cx: &WriteCx, buf: &mut [u8]) -> Result {
        write32le(buf, 0, 7); // version
        write32le(buf, 4, HEADER_SIZE as u32); // CU list offset
        write32le(buf, 8, self.cu_types_offset as u32); // types CU list offset
        write32le(buf, 12, self.cu_types_offset as u32); // address area offset
        write32le(buf, 16, self.sym_tab_offset as u32);
        write32le(buf, 20, self.constant_pool_offset as u32);
        let mut at = HEADER_SIZE as usize;

        for &(offset, length) in &self.compilation_units {
            write64le(buf, at, offset);
            write64le(buf, at + 8, length);
            at += CU_LIST_ENTRY_SIZE as usize;
        }

        for entry in &self.address_area {
            let base = cx.inputs.section(entry.section).output_address(cx.outputs);
            write64le(buf, at, base + entry.low);
            write64le(buf, at + 8, base + entry.high);
            write32le(buf, at + 16, entry.cu_index);
            at += ADDRESS_ENTRY_SIZE as usize;
        }

        for slot in &self.slots {
            if let Some(index) = slot {
                let symbol = &self.symbols[*index];
                // Name offsets are relative to the constant pool, which the
                // string pool follows.
                let name = symbol.name_offset as u64 + self.string_pool_offset
                    - self.constant_pool_offset;
                write32le(buf, at, name as u32);
                write32le(
                    buf,
                    at + 4,
                    self.cu_vector_offsets[symbol.cu_vector_index as usize],
                );
            }
            at += SYMTAB_ENTRY_SIZE as usize;
        }

        for vector in &self.cu_vectors {
            write32le(buf, at, vector.len() as u32);
            at += 4;
            for &value in vector {
                write32le(buf, at, value);
                at += 4;
            }
        }

        self.string_pool.write(&mut buf[self.string_pool_offset as usize..]);
        Ok(())
    }
}

fn debug_section_data<'data>(
    inputs: &LinkInputs<'data>,
    file: FileId,
    name: &str,
) -> &'data [u8] {
    inputs
        .file(file)
        .sections
        .iter()
        .map(|&id| inputs.section(id))
        .find(|section| section.name == name.as_bytes())
        .map_or(&[], |section| section.data)
}

/// Finds the input section of `file` whose file-offset range contains
/// `offset`. DWARF addresses in relocatable objects are resolved against
/// section file offsets.
fn section_containing(
    inputs: &LinkInputs,
    file: FileId,
    offset: u64,
) -> Option<InputSectionId> {
    inputs.file(file).sections.iter().copied().find(|&id| {
        let section = inputs.section(id);
        section.live
            && section.flags.contains(crate::elf::shf::ALLOC)
            && offset >= section.file_offset
            && offset < section.file_offset + section.data.len() as u64
    })
}

/// Parses a GNU-style pubnames/pubtypes table: sets of
/// (offset, descriptor, name) entries, each set led by a fixed header.
fn parse_gnu_pub_table(data: &[u8], endianness: Endianness) -> Result<Vec<(&[u8], u8)>> {
    let read_u32 = |at: usize| -> u32 {
        let bytes = [data[at], data[at + 1], data[at + 2], data[at + 3]];
        match endianness {
            Endianness::Little => u32::from_le_bytes(bytes),
            Endianness::Big => u32::from_be_bytes(bytes),
        }
    };

    let mut entries = Vec::new();
    let mut set_start = 0usize;
    while set_start + 14 <= data.len() {
        let unit_length = read_u32(set_start) as usize;
        ensure!(
            unit_length != 0xffff_ffff,
            "64-bit DWARF pub tables are not supported"
        );
        let set_end = set_start + 4 + unit_length;
        ensure!(set_end <= data.len(), "pub table set extends past section end");
        // Skip version, info offset and info size.
        let mut at = set_start + 14;
        while at + 4 <= set_end {
            let die_offset = read_u32(at);
            at += 4;
            if die_offset == 0 {
                break;
            }
            let descriptor = data[at];
            at += 1;
            let name_end = data[at..set_end]
                .iter()
                .position(|&b| b == 0)
                .map(|p| at + p)
                .context("pub table name is not null terminated")?;
            entries.push((&data[at..name_end], descriptor));
            at = name_end + 1;
        }
        set_start = set_end;
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gnu_pub_table_parsing() {
        // One set: version 2, covering one entry "main" with descriptor 0x30.
        let mut data: Vec<u8> = Vec::new();
        let body_len: u32 = 2 + 4 + 4 + (4 + 1 + 5) + 4;
        data.extend_from_slice(&body_len.to_le_bytes());
        data.extend_from_slice(&2u16.to_le_bytes()); // version
        data.extend_from_slice(&0u32.to_le_bytes()); // info offset
        data.extend_from_slice(&0x40u32.to_le_bytes()); // info size
        data.extend_from_slice(&0x19u32.to_le_bytes()); // die offset
        data.push(0x30); // descriptor
        data.extend_from_slice(b"main\0");
        data.extend_from_slice(&0u32.to_le_bytes()); // terminator

        let entries = parse_gnu_pub_table(&data, Endianness::Little).unwrap();
        assert_eq!(entries, vec![(b"main".as_slice(), 0x30)]);
    }

    #[test]
    fn symbols_share_cu_vectors_by_name() {
        let mut index = GdbIndexSection::new();
        index.add_symbol(b"foo", 0x20, 0);
        index.add_symbol(b"foo", 0x20, 1);
        index.add_symbol(b"bar", 0x10, 0);
        index.finalize();

        assert_eq!(index.symbols.len(), 2);
        assert_eq!(index.cu_vectors.len(), 2);
        let foo_vector = &index.cu_vectors[0];
        assert_eq!(
            foo_vector.iter().copied().collect::<Vec<u32>>(),
            vec![(0x20 << 24), (0x20 << 24) | 1]
        );
    }
}
