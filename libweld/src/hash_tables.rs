//! The two on-disk symbol hash tables. `.hash` is the classic SysV
//! bucket/chain table; `.gnu.hash` adds a bloom filter and requires the
//! dynamic symbol table to be sorted so each bucket's symbols are contiguous.

use crate::config::Config;
use crate::context::WriteCx;
use crate::elf::secnames;
use crate::elf::shf;
use crate::elf::sht;
use crate::error::Result;
use crate::hash::gnu_hash;
use crate::hash::sysv_hash;
use crate::section::SectionBase;
use crate::section::SyntheticSection;
use crate::symbol::SymbolDb;
use crate::symtab::SymbolTableEntry;

pub struct SysvHashSection {
    pub base: SectionBase,
    /// (hash, dynsym index) per dynamic symbol, captured at finalize.
    entries: Vec<(u32, u32)>,
    num_symbols: u32,
}

impl SysvHashSection {
    pub fn new() -> Self {
        let mut base = SectionBase::new(secnames::HASH_SECTION_NAME, sht::HASH, shf::ALLOC, 4);
        base.entsize = 4;
        SysvHashSection {
            base,
            entries: Vec::new(),
            num_symbols: 0,
        }
    }

    /// `dynsym` must already have final indices assigned.
    pub fn finalize(&mut self, symbols: &SymbolDb, dynsym: &[SymbolTableEntry]) {
        if self.base.finalized {
            return;
        }
        self.base.finalized = true;
        // Create as many buckets as there are symbols (including the null
        // entry).
        self.num_symbols = dynsym.len() as u32 + 1;
        self.entries = dynsym
            .iter()
            .map(|entry| {
                let sym = symbols.get(entry.symbol);
                let index = sym.dynsym_index.get().expect("dynsym index not assigned");
                (sysv_hash(&sym.name), index)
            })
            .collect();
        self.base.size = (2 + 2 * u64::from(self.num_symbols)) * 4;
    }
}

impl SyntheticSection for SysvHashSection {
    fn base(&self) -> &SectionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut SectionBase {
        &mut self.base
    }

    fn write_to(&self, cx: &WriteCx, buf: &mut [u8]) -> Result {
        let format = cx.config.format;
        let n = self.num_symbols;
        format.write_u32(buf, 0, n); // nbucket
        format.write_u32(buf, 4, n); // nchain
        let buckets_at = 8usize;
        let chains_at = buckets_at + n as usize * 4;
        // Insert each symbol at the head of its bucket; the chain entry
        // holds the previous head.
        for &(hash, index) in &self.entries {
            let bucket = (hash % n) as usize;
            let prev = format.read_u32(buf, buckets_at + bucket * 4);
            format.write_u32(buf, chains_at + index as usize * 4, prev);
            format.write_u32(buf, buckets_at + bucket * 4, index);
        }
        Ok(())
    }
}

/// Bucket counts for `.gnu.hash`: the largest prime not greater than 2^n + 1
/// that fits the symbol count.
fn gnu_hash_bucket_count(num_symbols: usize) -> u32 {
    for n in [
        131071u32, 65521, 32749, 16381, 8191, 4093, 2039, 1021, 509, 251, 127, 61, 31, 13, 7, 3, 1,
    ] {
        if n as usize <= num_symbols {
            return n;
        }
    }
    0
}

struct GnuHashEntry {
    symbol: crate::symbol::SymbolId,
    hash: u32,
}

pub struct GnuHashSection {
    pub base: SectionBase,
    entries: Vec<GnuHashEntry>,
    num_buckets: u32,
    mask_words: u64,
    /// Dynsym index of the first hashed symbol.
    symbol_base: u32,
    is_64: bool,
}

impl GnuHashSection {
    pub fn new(config: &Config) -> Self {
        let mut base = SectionBase::new(
            secnames::GNU_HASH_SECTION_NAME,
            sht::GNU_HASH,
            shf::ALLOC,
            config.word_size(),
        );
        base.entsize = 0;
        GnuHashSection {
            base,
            entries: Vec::new(),
            num_buckets: 0,
            mask_words: 0,
            symbol_base: 0,
            is_64: config.format.is_64(),
        }
    }

    fn shift2(&self) -> u32 {
        if self.is_64 { 26 } else { 6 }
    }

    /// Reorders the dynamic symbol list to meet the on-disk requirements:
    /// undefined symbols first, then defined symbols grouped by hash bucket.
    /// Destructive on `table_entries`, which is the point.
    pub fn add_symbols(&mut self, symbols: &SymbolDb, table_entries: &mut Vec<SymbolTableEntry>) {
        let (undefined, defined): (Vec<_>, Vec<_>) = table_entries
            .drain(..)
            .partition(|entry| symbols.get(entry.symbol).is_undefined());
        *table_entries = undefined;
        if defined.is_empty() {
            return;
        }

        let mut hashed: Vec<(SymbolTableEntry, u32)> = defined
            .into_iter()
            .map(|entry| {
                let hash = gnu_hash(&symbols.get(entry.symbol).name);
                (entry, hash)
            })
            .collect();
        self.num_buckets = gnu_hash_bucket_count(hashed.len());
        let num_buckets = self.num_buckets;
        hashed.sort_by_key(|&(_, hash)| hash % num_buckets);

        for (entry, hash) in hashed {
            self.entries.push(GnuHashEntry {
                symbol: entry.symbol,
                hash,
            });
            table_entries.push(entry);
        }
    }

    pub fn finalize(&mut self, dynsym_count: u32) {
        if self.base.finalized {
            return;
        }
        self.base.finalized = true;
        let word = if self.is_64 { 8u64 } else { 4 };
        // Eight filter bits per symbol, rounded up to a power of two words.
        self.mask_words = if self.entries.is_empty() {
            1
        } else {
            ((self.entries.len() - 1) as u64 / word + 1).next_power_of_two()
        };
        self.symbol_base = dynsym_count + 1 - self.entries.len() as u32;
        self.base.size = 16 + word * self.mask_words + u64::from(self.num_buckets) * 4
            + self.entries.len() as u64 * 4;
    }
}

impl SyntheticSection for GnuHashSection {
    fn base(&self) -> &SectionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut SectionBase {
        &mut self.base
    }

    fn write_to(&self, cx: &WriteCx, buf: &mut [u8]) -> Result {
        let format = cx.config.format;
        let word = format.word_size();
        let word_bits = (word * 8) as u32;

        format.write_u32(buf, 0, self.num_buckets);
        format.write_u32(buf, 4, self.symbol_base);
        format.write_u32(buf, 8, self.mask_words as u32);
        format.write_u32(buf, 12, self.shift2());

        let bloom_at = 16usize;
        let buckets_at = bloom_at + (self.mask_words * word) as usize;
        let values_at = buckets_at + self.num_buckets as usize * 4;

        // Two bits per symbol; the filter rejects most negative lookups
        // before the hash table is consulted at all.
        for entry in &self.entries {
            let index = ((u64::from(entry.hash) / u64::from(word_bits)) & (self.mask_words - 1))
                as usize;
            let mut value = format.read_word(buf, bloom_at + index * word as usize);
            value |= 1u64 << (entry.hash % word_bits);
            value |= 1u64 << ((entry.hash >> self.shift2()) % word_bits);
            format.write_word(buf, bloom_at + index * word as usize, value);
        }

        // Buckets hold the dynsym index of their first symbol. The value
        // array is one chain per bucket; the last value of each chain has
        // its low bit set.
        let mut prev_bucket = None;
        for (i, entry) in self.entries.iter().enumerate() {
            let bucket = entry.hash % self.num_buckets;
            if prev_bucket != Some(bucket) {
                let dynsym_index = cx
                    .symbols
                    .get(entry.symbol)
                    .dynsym_index
                    .get()
                    .expect("dynsym index not assigned");
                format.write_u32(buf, buckets_at + bucket as usize * 4, dynsym_index);
                prev_bucket = Some(bucket);
            }
            let last_in_chain = self
                .entries
                .get(i + 1)
                .is_none_or(|next| next.hash % self.num_buckets != bucket);
            let value = if last_in_chain {
                entry.hash | 1
            } else {
                entry.hash & !1
            };
            format.write_u32(buf, values_at + i * 4, value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SyntheticSections;
    use crate::context::WriteCx;
    use crate::input::LinkInputs;
    use crate::output::OutputSections;
    use crate::section::SyntheticSection as _;
    use crate::symbol::Symbol;
    use crate::symbol::SymbolPlacement;

    #[test]
    fn bucket_counts_come_from_the_prime_ladder() {
        assert_eq!(gnu_hash_bucket_count(0), 0);
        assert_eq!(gnu_hash_bucket_count(1), 1);
        assert_eq!(gnu_hash_bucket_count(2), 1);
        assert_eq!(gnu_hash_bucket_count(3), 3);
        assert_eq!(gnu_hash_bucket_count(100), 61);
        assert_eq!(gnu_hash_bucket_count(70_000), 65521);
        assert_eq!(gnu_hash_bucket_count(1 << 20), 131071);
    }

    #[test]
    fn gnu_hash_groups_buckets_and_terminates_chains() {
        let config = crate::config::Config::default();
        let mut db = SymbolDb::default();
        let mut table_entries = Vec::new();
        for (name, placement) in [
            (b"undef".as_slice(), SymbolPlacement::Undefined),
            (b"alpha".as_slice(), SymbolPlacement::Absolute),
            (b"beta".as_slice(), SymbolPlacement::Absolute),
            (b"gamma".as_slice(), SymbolPlacement::Absolute),
            (b"delta".as_slice(), SymbolPlacement::Absolute),
        ] {
            let id = db.add(Symbol::new(name, placement));
            table_entries.push(SymbolTableEntry {
                symbol: id,
                name_offset: 0,
            });
        }

        let mut gnu = GnuHashSection::new(&config);
        gnu.add_symbols(&db, &mut table_entries);

        // Undefined symbols come first and are not hashed.
        assert!(db.get(table_entries[0].symbol).is_undefined());
        assert_eq!(gnu.entries.len(), 4);
        let num_buckets = gnu.num_buckets;
        // Bucket values are non-decreasing, so each bucket's symbols are
        // contiguous.
        let buckets: Vec<u32> = gnu.entries.iter().map(|e| e.hash % num_buckets).collect();
        assert!(buckets.windows(2).all(|w| w[0] <= w[1]));

        for (i, entry) in table_entries.iter().enumerate() {
            db.get_mut(entry.symbol).dynsym_index.set(i as u32 + 1);
        }
        gnu.finalize(table_entries.len() as u32);

        let symbols = db;
        let inputs = LinkInputs::default();
        let outputs = OutputSections::default();
        let synth = SyntheticSections::new(&config, &crate::target::Mips);
        let cx = WriteCx {
            config: &config,
            target: &crate::target::Mips,
            symbols: &symbols,
            inputs: &inputs,
            outputs: &outputs,
            synth: &synth,
        };
        let mut buf = vec![0u8; gnu.size() as usize];
        gnu.write_to(&cx, &mut buf).unwrap();

        // symbol_base is the dynsym index of the first hashed symbol.
        let symbol_base = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        assert_eq!(symbol_base, 2);

        // Exactly the last hash word of each bucket has its LSB set.
        let values_at = 16 + gnu.mask_words as usize * 8 + num_buckets as usize * 4;
        for (i, entry) in gnu.entries.iter().enumerate() {
            let word = u32::from_le_bytes(
                buf[values_at + i * 4..values_at + i * 4 + 4].try_into().unwrap(),
            );
            let last_in_bucket = gnu
                .entries
                .get(i + 1)
                .is_none_or(|next| next.hash % num_buckets != entry.hash % num_buckets);
            assert_eq!(word & 1 == 1, last_in_bucket);
            assert_eq!(word & !1, entry.hash & !1);
        }
    }
}
