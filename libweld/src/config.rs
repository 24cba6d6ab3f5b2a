//! Link configuration consumed by the synthetic sections. The driver parses
//! the command line and linker scripts elsewhere; by the time the engine runs,
//! everything it needs is in here.

use crate::format::OutputFormat;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Executable,
    PositionIndependentExecutable,
    SharedObject,
    Relocatable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildIdKind {
    None,
    /// xxhash64 of the image, 8 bytes.
    Fast,
    /// MD5 of the image, 16 bytes.
    Md5,
    /// SHA-1 of the image, 20 bytes.
    Sha1,
    /// 16 random bytes from the OS entropy source.
    Uuid,
    /// Verbatim user-supplied bytes.
    Hex(Vec<u8>),
}

impl BuildIdKind {
    pub fn hash_size(&self) -> usize {
        match self {
            BuildIdKind::None => 0,
            BuildIdKind::Fast => 8,
            BuildIdKind::Md5 | BuildIdKind::Uuid => 16,
            BuildIdKind::Sha1 => 20,
            BuildIdKind::Hex(bytes) => bytes.len(),
        }
    }
}

/// A version from the version script. IDs start at 2; ID 1 is the base
/// version named after the soname (or the output file name).
#[derive(Debug, Clone)]
pub struct VersionDefinition {
    pub name: Vec<u8>,
    pub id: u16,
}

pub struct Config {
    pub format: OutputFormat,
    /// ELF machine type (`object::elf::EM_*`).
    pub machine: u16,
    pub output_kind: OutputKind,
    /// Static link: no dynamic loader involved at runtime.
    pub is_static: bool,
    /// Whether dynamic relocations carry explicit addends.
    pub is_rela: bool,
    pub optimize: u8,
    pub build_id: BuildIdKind,
    pub output_file_name: String,
    pub soname: Option<String>,
    pub rpath: Option<String>,
    pub enable_new_dtags: bool,
    pub auxiliary: Vec<String>,
    pub filter: Vec<String>,
    pub dynamic_linker: Option<String>,
    pub init_symbol_name: String,
    pub fini_symbol_name: String,
    pub version_definitions: Vec<VersionDefinition>,
    /// Upper bound in bytes for a single MIPS sub-GOT.
    pub mips_got_size: u64,
    pub image_base: u64,
    pub define_common: bool,
    pub emit_gnu_hash: bool,
    pub emit_sysv_hash: bool,
    pub bsymbolic: bool,
    pub z_nodelete: bool,
    pub z_nodlopen: bool,
    pub z_now: bool,
    pub z_origin: bool,
    /// When false, text relocations are permitted and DT_TEXTREL is emitted.
    pub z_text: bool,
    pub z_combreloc: bool,
    pub z_rodynamic: bool,
    /// Downgrades capability relocations against undefined symbols from an
    /// error to a warning.
    pub allow_undefined_cap_relocs: bool,
    /// Compatibility mode for targets whose inputs carry RELA relocations but
    /// whose runtime only consumes REL: addends from dynamic relocations are
    /// copied back into the contributing sections for the writer to embed.
    pub rel_output_with_rela_inputs: bool,
}

impl Config {
    pub fn is_pic(&self) -> bool {
        matches!(
            self.output_kind,
            OutputKind::PositionIndependentExecutable | OutputKind::SharedObject
        )
    }

    pub fn is_relocatable(&self) -> bool {
        self.output_kind == OutputKind::Relocatable
    }

    pub fn is_shared(&self) -> bool {
        self.output_kind == OutputKind::SharedObject
    }

    pub fn word_size(&self) -> u64 {
        self.format.word_size()
    }

    pub fn is_mips(&self) -> bool {
        self.machine == object::elf::EM_MIPS
    }

    pub fn is_arm(&self) -> bool {
        self.machine == object::elf::EM_ARM
    }

    /// MIPS 64-bit little-endian packs relocation info bytes differently from
    /// every other target.
    pub fn is_mips64el(&self) -> bool {
        self.is_mips()
            && self.format.is_64()
            && self.format.endianness == crate::format::Endianness::Little
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            format: crate::format::ELF64LE,
            machine: object::elf::EM_X86_64,
            output_kind: OutputKind::Executable,
            is_static: false,
            is_rela: true,
            optimize: 1,
            build_id: BuildIdKind::None,
            output_file_name: "a.out".to_owned(),
            soname: None,
            rpath: None,
            enable_new_dtags: true,
            auxiliary: Vec::new(),
            filter: Vec::new(),
            dynamic_linker: None,
            init_symbol_name: "_init".to_owned(),
            fini_symbol_name: "_fini".to_owned(),
            version_definitions: Vec::new(),
            mips_got_size: 0xfff0,
            image_base: 0,
            define_common: true,
            emit_gnu_hash: true,
            emit_sysv_hash: false,
            bsymbolic: false,
            z_nodelete: false,
            z_nodlopen: false,
            z_now: false,
            z_origin: false,
            z_text: true,
            z_combreloc: true,
            z_rodynamic: false,
            allow_undefined_cap_relocs: false,
            rel_output_with_rela_inputs: false,
        }
    }
}
