//! ELF constants and record layouts that the synthetic sections emit. Where
//! the `object` crate already defines a constant we re-use it; the newtypes
//! here exist so that flags and types don't get mixed up with plain integers.

use std::fmt::Debug;

#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct SectionFlags(u32);

pub mod shf {
    use super::SectionFlags;

    pub const WRITE: SectionFlags = SectionFlags::from_u32(object::elf::SHF_WRITE);
    pub const ALLOC: SectionFlags = SectionFlags::from_u32(object::elf::SHF_ALLOC);
    pub const EXECINSTR: SectionFlags = SectionFlags::from_u32(object::elf::SHF_EXECINSTR);
    pub const MERGE: SectionFlags = SectionFlags::from_u32(object::elf::SHF_MERGE);
    pub const STRINGS: SectionFlags = SectionFlags::from_u32(object::elf::SHF_STRINGS);
    pub const LINK_ORDER: SectionFlags = SectionFlags::from_u32(object::elf::SHF_LINK_ORDER);
    pub const TLS: SectionFlags = SectionFlags::from_u32(object::elf::SHF_TLS);
    pub const MIPS_GPREL: SectionFlags = SectionFlags::from_u32(object::elf::SHF_MIPS_GPREL);
}

impl SectionFlags {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_u32(raw: u32) -> SectionFlags {
        SectionFlags(raw)
    }

    pub const fn contains(self, flag: SectionFlags) -> bool {
        self.0 & flag.0 == flag.0
    }

    #[must_use]
    pub const fn with(self, flags: SectionFlags) -> SectionFlags {
        SectionFlags(self.0 | flags.0)
    }

    pub const fn raw(self) -> u64 {
        self.0 as u64
    }
}

impl Debug for SectionFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SectionFlags(0x{:x})", self.0)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SectionType(u32);

pub mod sht {
    use super::SectionType;

    /// Not defined by the `object` crate; value from the MIPS ABI extensions spec.
    const SHT_MIPS_ABIFLAGS: u32 = 0x7000_002a;

    pub const NULL: SectionType = SectionType::from_u32(object::elf::SHT_NULL);
    pub const PROGBITS: SectionType = SectionType::from_u32(object::elf::SHT_PROGBITS);
    pub const SYMTAB: SectionType = SectionType::from_u32(object::elf::SHT_SYMTAB);
    pub const STRTAB: SectionType = SectionType::from_u32(object::elf::SHT_STRTAB);
    pub const RELA: SectionType = SectionType::from_u32(object::elf::SHT_RELA);
    pub const HASH: SectionType = SectionType::from_u32(object::elf::SHT_HASH);
    pub const DYNAMIC: SectionType = SectionType::from_u32(object::elf::SHT_DYNAMIC);
    pub const NOTE: SectionType = SectionType::from_u32(object::elf::SHT_NOTE);
    pub const NOBITS: SectionType = SectionType::from_u32(object::elf::SHT_NOBITS);
    pub const REL: SectionType = SectionType::from_u32(object::elf::SHT_REL);
    pub const DYNSYM: SectionType = SectionType::from_u32(object::elf::SHT_DYNSYM);
    pub const GNU_HASH: SectionType = SectionType::from_u32(object::elf::SHT_GNU_HASH);
    pub const GNU_VERDEF: SectionType = SectionType::from_u32(object::elf::SHT_GNU_VERDEF);
    pub const GNU_VERNEED: SectionType = SectionType::from_u32(object::elf::SHT_GNU_VERNEED);
    pub const GNU_VERSYM: SectionType = SectionType::from_u32(object::elf::SHT_GNU_VERSYM);
    pub const MIPS_REGINFO: SectionType = SectionType::from_u32(object::elf::SHT_MIPS_REGINFO);
    pub const MIPS_OPTIONS: SectionType = SectionType::from_u32(object::elf::SHT_MIPS_OPTIONS);
    pub const MIPS_ABIFLAGS: SectionType = SectionType::from_u32(SHT_MIPS_ABIFLAGS);
    pub const ARM_EXIDX: SectionType = SectionType::from_u32(object::elf::SHT_ARM_EXIDX);
}

impl SectionType {
    pub const fn from_u32(raw: u32) -> SectionType {
        SectionType(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

pub mod secnames {
    pub const GOT_SECTION_NAME: &str = ".got";
    pub const GOT_PLT_SECTION_NAME: &str = ".got.plt";
    pub const IGOT_PLT_SECTION_NAME: &str = ".igot.plt";
    pub const PLT_SECTION_NAME: &str = ".plt";
    pub const IPLT_SECTION_NAME: &str = ".iplt";
    pub const RELA_DYN_SECTION_NAME: &str = ".rela.dyn";
    pub const RELA_PLT_SECTION_NAME: &str = ".rela.plt";
    pub const RELA_IPLT_SECTION_NAME: &str = ".rela.iplt";
    pub const REL_DYN_SECTION_NAME: &str = ".rel.dyn";
    pub const REL_PLT_SECTION_NAME: &str = ".rel.plt";
    pub const REL_IPLT_SECTION_NAME: &str = ".rel.iplt";
    pub const DYNAMIC_SECTION_NAME: &str = ".dynamic";
    pub const DYNSYM_SECTION_NAME: &str = ".dynsym";
    pub const SYMTAB_SECTION_NAME: &str = ".symtab";
    pub const DYNSTR_SECTION_NAME: &str = ".dynstr";
    pub const STRTAB_SECTION_NAME: &str = ".strtab";
    pub const SHSTRTAB_SECTION_NAME: &str = ".shstrtab";
    pub const HASH_SECTION_NAME: &str = ".hash";
    pub const GNU_HASH_SECTION_NAME: &str = ".gnu.hash";
    pub const EH_FRAME_SECTION_NAME: &str = ".eh_frame";
    pub const EH_FRAME_HDR_SECTION_NAME: &str = ".eh_frame_hdr";
    pub const INTERP_SECTION_NAME: &str = ".interp";
    pub const NOTE_GNU_BUILD_ID_SECTION_NAME: &str = ".note.gnu.build-id";
    pub const GNU_VERSION_SECTION_NAME: &str = ".gnu.version";
    pub const GNU_VERSION_D_SECTION_NAME: &str = ".gnu.version_d";
    pub const GNU_VERSION_R_SECTION_NAME: &str = ".gnu.version_r";
    pub const GDB_INDEX_SECTION_NAME: &str = ".gdb_index";
    pub const DEBUG_INFO_SECTION_NAME: &str = ".debug_info";
    pub const CAP_RELOCS_SECTION_NAME: &str = "__cap_relocs";
    pub const MIPS_ABIFLAGS_SECTION_NAME: &str = ".MIPS.abiflags";
    pub const MIPS_OPTIONS_SECTION_NAME: &str = ".MIPS.options";
    pub const REGINFO_SECTION_NAME: &str = ".reginfo";
    pub const RLD_MAP_SECTION_NAME: &str = ".rld_map";
    pub const ARM_EXIDX_SECTION_NAME: &str = ".ARM.exidx";
    pub const TEXT_THUNK_SECTION_NAME: &str = ".text.thunk";
    pub const BSS_SECTION_NAME: &str = ".bss";
    pub const BSS_REL_RO_SECTION_NAME: &str = ".bss.rel.ro";
    pub const COMMENT_SECTION_NAME: &str = ".comment";
}

/// DWARF exception-header pointer encodings (`DW_EH_PE_*`).
pub mod eh_pe {
    pub const ABSPTR: u8 = 0x00;
    pub const UDATA2: u8 = 0x02;
    pub const UDATA4: u8 = 0x03;
    pub const UDATA8: u8 = 0x04;
    pub const SDATA4: u8 = 0x0b;
    pub const PCREL: u8 = 0x10;
    pub const DATAREL: u8 = 0x30;
    pub const OMIT: u8 = 0xff;
}

/// Offset within a CIE or FDE of the 4-byte CIE id / CIE pointer word.
pub const EH_FRAME_ID_OFFSET: usize = 4;

/// Offset within an FDE of the initial-location (pc-begin) field.
pub const FDE_PC_BEGIN_OFFSET: usize = 8;

/// The `.ARM.exidx` second word that marks a range as not unwindable.
pub const EXIDX_CANTUNWIND: u32 = 0x1;

/// MIPS `DT_MIPS_FLAGS` value: the runtime linker may not use the shortcut
/// pointers table.
pub const RHF_NOTPOT: u64 = 0x2;

/// MIPS `.MIPS.options` descriptor kind for register info records.
pub const ODK_REGINFO: u8 = 1;

/// MIPS st_other bits. Marks symbols that have a PLT entry and require
/// pointer equality, and PIC local definitions in relocatable output.
pub const STO_MIPS_PLT: u8 = 0x8;
pub const STO_MIPS_PIC: u8 = 0x20;

/// Number of reserved entries at the start of a MIPS GOT: the lazy resolver
/// slot and the module pointer slot.
pub const MIPS_GOT_HEADER_ENTRIES: u32 = 2;

/// Size in bytes of one `__cap_relocs` entry: five packed 64-bit fields.
pub const CAP_RELOC_ENTRY_SIZE: u64 = 40;

/// Capability permission bit set on function targets.
pub const CAP_PERM_FUNCTION: u64 = 1 << 63;

pub const GNU_NOTE_NAME: &[u8] = b"GNU\0";

/// Size of a `.MIPS.abiflags` record.
pub const MIPS_ABIFLAGS_SIZE: usize = 24;

/// Size of the fixed header of a `.MIPS.options` descriptor.
pub const MIPS_OPTIONS_HEADER_SIZE: usize = 8;

/// Sizes of the MIPS register-info records (32 and 64-bit forms).
pub const MIPS_REGINFO32_SIZE: usize = 24;
pub const MIPS_REGINFO64_SIZE: usize = 32;

/// A merged `.MIPS.abiflags` record. Field meanings follow the MIPS ABI
/// extension; we only combine them, the values come from inputs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MipsAbiFlags {
    pub version: u16,
    pub isa_level: u8,
    pub isa_rev: u8,
    pub gpr_size: u8,
    pub cpr1_size: u8,
    pub cpr2_size: u8,
    pub fp_abi: u8,
    pub isa_ext: u32,
    pub ases: u32,
    pub flags1: u32,
    pub flags2: u32,
}

/// Aggregated MIPS register-info. The 64-bit form carries a pad word that we
/// always emit as zero.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MipsRegInfo {
    pub ri_gprmask: u32,
    pub ri_cprmask: [u32; 4],
    pub ri_gp_value: i64,
}

/// MIPS `fp_abi` values from the ABI-flags extension.
pub mod fp_abi {
    pub const ANY: u8 = 0;
    pub const DOUBLE: u8 = 1;
    pub const SINGLE: u8 = 2;
    pub const SOFT: u8 = 3;
    pub const OLD_64: u8 = 4;
    pub const XX: u8 = 5;
    pub const FP_64: u8 = 6;
    pub const FP_64A: u8 = 7;
}
