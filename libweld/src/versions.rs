//! GNU symbol versioning: `.gnu.version` (per-symbol indices),
//! `.gnu.version_d` (our own definitions) and `.gnu.version_r` (versions
//! consumed from needed shared objects). Numbering: local is 0, global 1,
//! definitions from 2; need indices continue after the definitions.

use crate::config::Config;
use crate::context::WriteCx;
use crate::elf::secnames;
use crate::elf::shf;
use crate::elf::sht;
use crate::error::Result;
use crate::hash::sysv_hash;
use crate::input::FileId;
use crate::input::LinkInputs;
use crate::section::SectionBase;
use crate::section::SyntheticSection;
use crate::string_table::StringTableSection;
use crate::symbol::SymbolDb;
use crate::symbol::SymbolId;
use crate::symbol::SymbolPlacement;
use crate::symtab::SymbolTableEntry;
use indexmap::IndexMap;
use std::borrow::Cow;

const VERDEF_SIZE: u64 = 20;
const VERDAUX_SIZE: u64 = 8;
const VERNEED_SIZE: u64 = 16;
const VERNAUX_SIZE: u64 = 16;

/// `.gnu.version`: one 16-bit version index per dynamic symbol; entry 0 is
/// reserved for the null symbol.
pub struct VersionTableSection {
    pub base: SectionBase,
    order: Vec<SymbolId>,
}

impl VersionTableSection {
    pub fn new() -> Self {
        let mut base = SectionBase::new(
            secnames::GNU_VERSION_SECTION_NAME,
            sht::GNU_VERSYM,
            shf::ALLOC,
            2,
        );
        base.entsize = 2;
        VersionTableSection {
            base,
            order: Vec::new(),
        }
    }

    /// Captures the dynamic symbol table's final order.
    pub fn finalize(&mut self, dynsym: &[SymbolTableEntry]) {
        if self.base.finalized {
            return;
        }
        self.base.finalized = true;
        self.order = dynsym.iter().map(|entry| entry.symbol).collect();
        self.base.size = (self.order.len() as u64 + 1) * 2;
    }
}

impl SyntheticSection for VersionTableSection {
    fn base(&self) -> &SectionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut SectionBase {
        &mut self.base
    }

    fn write_to(&self, cx: &WriteCx, buf: &mut [u8]) -> Result {
        let format = cx.config.format;
        for (i, &id) in self.order.iter().enumerate() {
            format.write_u16(buf, (i + 1) * 2, cx.symbols.get(id).version_id);
        }
        Ok(())
    }
}

/// `.gnu.version_d`: one Verdef+Verdaux pair per version; the first entry is
/// the image's own base version carrying VER_FLG_BASE.
pub struct VersionDefinitionSection {
    pub base: SectionBase,
    /// (version id, name hash, name offset in .dynstr)
    defs: Vec<(u16, u32, u32)>,
}

impl VersionDefinitionSection {
    pub fn new() -> Self {
        VersionDefinitionSection {
            base: SectionBase::new(
                secnames::GNU_VERSION_D_SECTION_NAME,
                sht::GNU_VERDEF,
                shf::ALLOC,
                4,
            ),
            defs: Vec::new(),
        }
    }

    pub fn num_definitions(&self) -> u64 {
        self.defs.len() as u64
    }

    pub fn finalize<'data>(
        &mut self,
        config: &Config,
        dynstr: &mut StringTableSection<'data>,
    ) {
        if self.base.finalized {
            return;
        }
        self.base.finalized = true;
        if config.version_definitions.is_empty() {
            self.base.live = false;
            return;
        }

        // The base version is named after the soname, or failing that the
        // output file itself.
        let base_name: Vec<u8> = config
            .soname
            .clone()
            .unwrap_or_else(|| config.output_file_name.clone())
            .into_bytes();
        let hash = sysv_hash(&base_name);
        let offset = dynstr.add_string(Cow::Owned(base_name), true);
        self.defs.push((1, hash, offset));

        for def in &config.version_definitions {
            let hash = sysv_hash(&def.name);
            let offset = dynstr.add_string(Cow::Owned(def.name.clone()), true);
            self.defs.push((def.id, hash, offset));
        }
        self.base.size = (VERDEF_SIZE + VERDAUX_SIZE) * self.defs.len() as u64;
    }
}

impl SyntheticSection for VersionDefinitionSection {
    fn base(&self) -> &SectionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut SectionBase {
        &mut self.base
    }

    fn write_to(&self, cx: &WriteCx, buf: &mut [u8]) -> Result {
        let format = cx.config.format;
        let mut at = 0usize;
        for (i, &(id, hash, name_offset)) in self.defs.iter().enumerate() {
            let is_last = i + 1 == self.defs.len();
            format.write_u16(buf, at, 1); // vd_version
            format.write_u16(buf, at + 2, if id == 1 { object::elf::VER_FLG_BASE } else { 0 });
            format.write_u16(buf, at + 4, id); // vd_ndx
            format.write_u16(buf, at + 6, 1); // vd_cnt
            format.write_u32(buf, at + 8, hash);
            format.write_u32(buf, at + 12, VERDEF_SIZE as u32); // vd_aux
            format.write_u32(
                buf,
                at + 16,
                if is_last {
                    0
                } else {
                    (VERDEF_SIZE + VERDAUX_SIZE) as u32
                },
            );
            format.write_u32(buf, at + 20, name_offset); // vda_name
            format.write_u32(buf, at + 24, 0); // vda_next
            at += (VERDEF_SIZE + VERDAUX_SIZE) as usize;
        }
        Ok(())
    }
}

struct NeededVersion {
    name_offset: u32,
    index: u16,
    hash: u32,
}

struct NeededFile {
    soname_offset: u32,
    /// Keyed by the verdef index inside the shared object. Insertion order
    /// is emission order.
    versions: IndexMap<u32, NeededVersion, foldhash::fast::RandomState>,
}

/// `.gnu.version_r`: needs grouped by source shared object, one Verneed per
/// object followed by a Vernaux per consumed version.
pub struct VersionNeedSection {
    pub base: SectionBase,
    needed: IndexMap<FileId, NeededFile, foldhash::fast::RandomState>,
    next_index: u16,
}

impl VersionNeedSection {
    pub fn new(config: &Config) -> Self {
        VersionNeedSection {
            base: SectionBase::new(
                secnames::GNU_VERSION_R_SECTION_NAME,
                sht::GNU_VERNEED,
                shf::ALLOC,
                4,
            ),
            needed: IndexMap::default(),
            // 0 and 1 are reserved; definitions (plus the base version) come
            // before needs.
            next_index: config.version_definitions.len() as u16 + 2,
        }
    }

    /// Assigns the symbol's version index, creating Verneed/Vernaux records
    /// on first use of each (object, version) pair.
    pub fn add_symbol<'data>(
        &mut self,
        symbols: &mut SymbolDb<'data>,
        inputs: &LinkInputs<'data>,
        dynstr: &mut StringTableSection<'data>,
        id: SymbolId,
    ) {
        assert!(!self.base.finalized);
        let sym = symbols.get(id);
        let SymbolPlacement::Shared { verdef } = sym.placement else {
            return;
        };
        let Some(verdef_index) = verdef else {
            symbols.get_mut(id).version_id = object::elf::VER_NDX_GLOBAL;
            return;
        };
        let Some(file_id) = sym.file else {
            return;
        };
        let file = inputs.file(file_id);

        let entry = self.needed.entry(file_id).or_insert_with(|| NeededFile {
            soname_offset: dynstr.add_str(file.soname.unwrap_or(""), true),
            versions: IndexMap::default(),
        });
        let next_index = &mut self.next_index;
        let version = entry.versions.entry(verdef_index).or_insert_with(|| {
            let verdef = &file.verdefs[verdef_index as usize];
            let name_offset = dynstr.add_string(Cow::Borrowed(verdef.name), true);
            let index = *next_index;
            *next_index += 1;
            NeededVersion {
                name_offset,
                index,
                hash: verdef.hash,
            }
        });
        symbols.get_mut(id).version_id = version.index;
    }

    pub fn num_needed(&self) -> u64 {
        self.needed.len() as u64
    }

    pub fn finalize(&mut self) {
        if self.base.finalized {
            return;
        }
        self.base.finalized = true;
        let vernauxs: u64 = self.needed.values().map(|f| f.versions.len() as u64).sum();
        self.base.size = self.needed.len() as u64 * VERNEED_SIZE + vernauxs * VERNAUX_SIZE;
    }
}

impl SyntheticSection for VersionNeedSection {
    fn base(&self) -> &SectionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut SectionBase {
        &mut self.base
    }

    fn is_empty(&self) -> bool {
        self.needed.is_empty()
    }

    fn write_to(&self, cx: &WriteCx, buf: &mut [u8]) -> Result {
        let format = cx.config.format;
        // All Verneed records first, then the Vernaux chains.
        let mut verneed_at = 0usize;
        let mut vernaux_at = self.needed.len() * VERNEED_SIZE as usize;
        for (i, file) in self.needed.values().enumerate() {
            let is_last_file = i + 1 == self.needed.len();
            format.write_u16(buf, verneed_at, 1); // vn_version
            format.write_u16(buf, verneed_at + 2, file.versions.len() as u16);
            format.write_u32(buf, verneed_at + 4, file.soname_offset);
            format.write_u32(
                buf,
                verneed_at + 8,
                (vernaux_at - verneed_at) as u32, // vn_aux
            );
            format.write_u32(
                buf,
                verneed_at + 12,
                if is_last_file { 0 } else { VERNEED_SIZE as u32 },
            );
            verneed_at += VERNEED_SIZE as usize;

            for (j, version) in file.versions.values().enumerate() {
                let is_last = j + 1 == file.versions.len();
                format.write_u32(buf, vernaux_at, version.hash);
                format.write_u16(buf, vernaux_at + 4, 0); // vna_flags
                format.write_u16(buf, vernaux_at + 6, version.index);
                format.write_u32(buf, vernaux_at + 8, version.name_offset);
                format.write_u32(
                    buf,
                    vernaux_at + 12,
                    if is_last { 0 } else { VERNAUX_SIZE as u32 },
                );
                vernaux_at += VERNAUX_SIZE as usize;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::InputFile;
    use crate::input::SharedObjectVerdef;
    use crate::symbol::Symbol;

    #[test]
    fn need_indices_continue_after_definitions() {
        let config = Config {
            version_definitions: vec![crate::config::VersionDefinition {
                name: b"V1".to_vec(),
                id: 2,
            }],
            ..Config::default()
        };
        let mut inputs = LinkInputs::default();
        let mut libc = InputFile::new("libc.so.6");
        libc.is_shared = true;
        libc.soname = Some("libc.so.6");
        libc.verdefs = vec![
            SharedObjectVerdef {
                name: b"GLIBC_2.2.5",
                hash: sysv_hash(b"GLIBC_2.2.5"),
            },
            SharedObjectVerdef {
                name: b"GLIBC_2.34",
                hash: sysv_hash(b"GLIBC_2.34"),
            },
        ];
        let libc = inputs.add_file(libc);

        let mut symbols = SymbolDb::default();
        let mut printf = Symbol::new(
            b"printf".as_slice(),
            SymbolPlacement::Shared { verdef: Some(0) },
        );
        printf.file = Some(libc);
        let printf = symbols.add(printf);
        let mut pthread = Symbol::new(
            b"pthread_create".as_slice(),
            SymbolPlacement::Shared { verdef: Some(1) },
        );
        pthread.file = Some(libc);
        let pthread = symbols.add(pthread);

        let mut dynstr = StringTableSection::new(".dynstr", true);
        let mut verneed = VersionNeedSection::new(&config);
        verneed.add_symbol(&mut symbols, &inputs, &mut dynstr, printf);
        verneed.add_symbol(&mut symbols, &inputs, &mut dynstr, pthread);
        // Re-adding must not allocate a second index.
        verneed.add_symbol(&mut symbols, &inputs, &mut dynstr, printf);
        verneed.finalize();

        // One definition plus base occupies 2 and... the base is 1, the
        // definition takes 2, so needs start at 3.
        assert_eq!(symbols.get(printf).version_id, 3);
        assert_eq!(symbols.get(pthread).version_id, 4);
        assert_eq!(verneed.num_needed(), 1);
        assert_eq!(verneed.size(), 16 + 2 * 16);
    }
}
