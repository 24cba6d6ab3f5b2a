//! String tables. ELF string tables start with a NUL byte; offsets returned
//! by `add_string` are stable for the life of the table.

use crate::context::WriteCx;
use crate::elf::SectionFlags;
use crate::elf::shf;
use crate::elf::sht;
use crate::error::Result;
use crate::hash::PassThroughHashMap;
use crate::hash::PreHashed;
use crate::hash::hash_bytes;
use crate::section::SectionBase;
use crate::section::SyntheticSection;
use std::borrow::Cow;

pub struct StringTableSection<'data> {
    pub base: SectionBase,
    is_dynamic: bool,
    strings: Vec<Cow<'data, [u8]>>,
    dedup: PassThroughHashMap<Vec<u8>, u32>,
}

impl<'data> StringTableSection<'data> {
    pub fn new(name: &'static str, is_dynamic: bool) -> Self {
        let flags = if is_dynamic {
            shf::ALLOC
        } else {
            SectionFlags::empty()
        };
        let mut table = StringTableSection {
            base: SectionBase::new(name, sht::STRTAB, flags, 1),
            is_dynamic,
            strings: Vec::new(),
            dedup: PassThroughHashMap::default(),
        };
        // The leading NUL that doubles as the empty string.
        table.add_string(Cow::Borrowed(&[]), false);
        table
    }

    pub fn is_dynamic(&self) -> bool {
        self.is_dynamic
    }

    /// Adds a string, returning its byte offset. When `hash_it` is set,
    /// duplicate strings return their original offset. Global symbol names
    /// are already uniqued upstream, so hashing them again would cost a lot
    /// for nearly no deduplication.
    pub fn add_string(&mut self, string: Cow<'data, [u8]>, hash_it: bool) -> u32 {
        if hash_it {
            let key = PreHashed::new(string.to_vec(), hash_bytes(&string));
            if let Some(&offset) = self.dedup.get(&key) {
                return offset;
            }
            self.dedup.insert(key, self.base.size as u32);
        }
        let offset = self.base.size as u32;
        self.base.size += string.len() as u64 + 1;
        self.strings.push(string);
        offset
    }

    pub fn add_str(&mut self, string: &'data str, hash_it: bool) -> u32 {
        self.add_string(Cow::Borrowed(string.as_bytes()), hash_it)
    }
}

impl SyntheticSection for StringTableSection<'_> {
    fn base(&self) -> &SectionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut SectionBase {
        &mut self.base
    }

    fn is_empty(&self) -> bool {
        // A table holding only the leading NUL still identifies itself.
        self.strings.len() <= 1
    }

    fn write_to(&self, _cx: &WriteCx, buf: &mut [u8]) -> Result {
        let mut offset = 0;
        for string in &self.strings {
            buf[offset..offset + string.len()].copy_from_slice(string);
            buf[offset + string.len()] = 0;
            offset += string.len() + 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_write_cx;

    #[test]
    fn offsets_round_trip() {
        let mut table = StringTableSection::new(".dynstr", true);
        let a = table.add_string(Cow::Borrowed(b"libc.so.6".as_slice()), true);
        let b = table.add_string(Cow::Borrowed(b"main".as_slice()), false);
        let a2 = table.add_string(Cow::Borrowed(b"libc.so.6".as_slice()), true);
        assert_eq!(a, 1);
        assert_eq!(a, a2);
        assert_eq!(b, 11);
        assert_eq!(table.size(), 16);

        let mut buf = vec![0xaau8; table.size() as usize];
        test_write_cx(|cx| table.write_to(cx, &mut buf)).unwrap();
        assert_eq!(buf[0], 0);
        assert_eq!(&buf[a as usize..a as usize + 10], b"libc.so.6\0");
        assert_eq!(&buf[b as usize..b as usize + 5], b"main\0");
    }

    #[test]
    fn unhashed_insertions_preserve_order() {
        let mut table = StringTableSection::new(".strtab", false);
        let first = table.add_string(Cow::Borrowed(b"x".as_slice()), false);
        let second = table.add_string(Cow::Borrowed(b"x".as_slice()), false);
        assert!(first < second);
    }
}
