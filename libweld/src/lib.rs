//! The synthetic section engine of the weld linker: every output section
//! whose bytes are computed from the aggregate state of the link rather than
//! copied from an input. Upstream passes register entries, the engine
//! finalizes sizes and indices in dependency order, and the writer asks each
//! section to emit its bytes once addresses are known.

pub mod alignment;
pub mod arm_exidx;
pub mod build_id;
pub mod cap_relocs;
pub mod config;
pub mod context;
pub mod dynamic;
pub mod eh_frame;
pub mod elf;
pub mod error;
pub mod format;
pub mod gdb_index;
pub mod got;
pub(crate) mod hash;
pub mod hash_tables;
pub mod input;
pub mod merge_strings;
pub mod mips_abi;
pub mod mips_got;
pub mod output;
pub mod plt;
pub mod rela_dyn;
pub mod section;
pub mod string_table;
pub mod symbol;
pub mod symtab;
pub mod target;
pub mod thunk;
pub mod versions;

pub use config::Config;
pub use context::EpilogueInputs;
pub use context::SynthSecId;
pub use context::SyntheticSections;
pub use context::WriteCx;
pub use error::Result;
