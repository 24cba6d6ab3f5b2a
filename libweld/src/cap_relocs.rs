//! The `__cap_relocs` table of the capability-hardened MIPS variant. Each
//! entry describes a bounded pointer the runtime must materialize: where it
//! lives, what it points at, and the bounds. Inputs carry one fixed 40-byte
//! record per capability plus a pair of 64-bit relocations; we validate the
//! pairing, resolve section symbols to real definitions, and re-emit the
//! table against output addresses.

use crate::config::Config;
use crate::context::WriteCx;
use crate::elf::CAP_PERM_FUNCTION;
use crate::elf::CAP_RELOC_ENTRY_SIZE;
use crate::elf::secnames;
use crate::elf::shf;
use crate::elf::sht;
use crate::error::Result;
use crate::error::warning;
use crate::input::InputSectionId;
use crate::input::LinkInputs;
use crate::rela_dyn::DynamicReloc;
use crate::rela_dyn::RelaDynSection;
use crate::rela_dyn::RelocPlace;
use crate::section::SectionBase;
use crate::section::SyntheticSection;
use crate::symbol::SymbolDb;
use crate::symbol::SymbolId;
use crate::symbol::SymbolPlacement;
use crate::target::Target;
use anyhow::bail;
use indexmap::IndexMap;

/// The on-disk entry layout. Fields are stored little-endian.
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
struct InMemoryCapRelocEntry {
    location: u64,
    target: u64,
    offset: u64,
    size: u64,
    permissions: u64,
}

const _: () = assert!(size_of::<InMemoryCapRelocEntry>() as u64 == CAP_RELOC_ENTRY_SIZE);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CapRelocLocation {
    base_sym: SymbolId,
    offset: u64,
    needs_dyn_reloc: bool,
}

#[derive(Debug, Clone, Copy)]
struct CapReloc {
    target: SymbolId,
    /// Addend of the target relocation: offset of the referenced location
    /// within the target symbol.
    target_sym_offset: u64,
    /// The capability's offset field from the raw input record.
    offset: u64,
    /// The capability's size field from the raw input record. Only a hint;
    /// the emitted size comes from the symbol.
    size_hint: u64,
    needs_dyn_reloc: bool,
}

pub struct CapRelocsSection {
    pub base: SectionBase,
    relocs: IndexMap<CapRelocLocation, CapReloc, foldhash::fast::RandomState>,
    errors: Vec<String>,
}

impl CapRelocsSection {
    pub fn new() -> Self {
        let mut base = SectionBase::new(
            secnames::CAP_RELOCS_SECTION_NAME,
            sht::PROGBITS,
            shf::ALLOC,
            8,
        );
        base.entsize = CAP_RELOC_ENTRY_SIZE;
        CapRelocsSection {
            base,
            relocs: IndexMap::default(),
            errors: Vec::new(),
        }
    }

    fn error(&mut self, message: String) {
        warning(&message);
        self.errors.push(message);
    }

    /// Consumes one input `__cap_relocs` section. Validation problems are
    /// accumulated so a single run surfaces as many as possible; only the
    /// duplicate-entry invariant aborts immediately.
    pub fn add_section(
        &mut self,
        inputs: &mut LinkInputs,
        symbols: &SymbolDb,
        config: &Config,
        target: &dyn Target,
        rela_dyn: &mut RelaDynSection,
        id: InputSectionId,
    ) -> Result {
        assert!(!self.base.finalized);
        let section_name;
        {
            let section = inputs.section_mut(id);
            debug_assert_eq!(section.name, secnames::CAP_RELOCS_SECTION_NAME.as_bytes());
            debug_assert!(section.relocations.is_rela, "__cap_relocs should be RELA");
            // The input is consumed here; it must not also be copied.
            section.out = None;
            section.live = false;
            let file_id = section.file;
            let raw_name = String::from_utf8_lossy(section.name).into_owned();
            section_name = format!("{}:({})", inputs.file(file_id).name, raw_name);
        }
        let section = inputs.section(id);

        if section.data.len() as u64 % CAP_RELOC_ENTRY_SIZE != 0 {
            self.error(format!(
                "{section_name}: section size is not a multiple of {CAP_RELOC_ENTRY_SIZE}"
            ));
            return Ok(());
        }
        let num_entries = section.data.len() as u64 / CAP_RELOC_ENTRY_SIZE;
        if num_entries * 2 != section.relocations.relocs.len() as u64 {
            self.error(format!(
                "{section_name}: expected {} relocations but got {}",
                num_entries * 2,
                section.relocations.relocs.len()
            ));
            return Ok(());
        }

        let format = config.format;
        let mut rels = section.relocations.relocs.iter();
        while let Some(location_rel) = rels.next() {
            let Some(target_rel) = rels.next() else { break };

            if location_rel.offset % CAP_RELOC_ENTRY_SIZE != 0 {
                self.error(format!(
                    "{section_name}: expected relocation offset to be a multiple of \
                     {CAP_RELOC_ENTRY_SIZE} but got {}",
                    location_rel.offset
                ));
                return Ok(());
            }
            if target_rel.offset != location_rel.offset + 8 {
                self.error(format!(
                    "{section_name}: expected target relocation ({}) to directly follow \
                     location relocation ({})",
                    target_rel.offset, location_rel.offset
                ));
                return Ok(());
            }
            if location_rel.addend < 0 {
                self.error(format!(
                    "{section_name}: addend is less than zero: {}",
                    location_rel.addend
                ));
                return Ok(());
            }
            if location_rel.r_type != object::elf::R_MIPS_64
                || target_rel.r_type != object::elf::R_MIPS_64
            {
                self.error(format!(
                    "{section_name}: expected R_MIPS_64 relocations in __cap_relocs"
                ));
                continue;
            }
            let (Some(location_sym), Some(target_sym)) = (location_rel.symbol, target_rel.symbol)
            else {
                self.error(format!("{section_name}: relocation without a symbol"));
                continue;
            };
            if symbols.get(location_sym).file != Some(section.file) {
                self.error(format!(
                    "{section_name}: expected capability relocation to point into the same file"
                ));
                continue;
            }

            let location_offset = location_rel.addend as u64;
            // The raw record supplies the capability offset and a size hint.
            let record_at = location_rel.offset as usize;
            let cap_offset = format.read_u64(section.data, record_at + 16);
            let cap_size = format.read_u64(section.data, record_at + 24);

            // Capability relocations are typically `.data + offset`; resolve
            // section symbols to the enclosing definition.
            let (location_sym, location_offset) = if symbols.get(location_sym).is_section() {
                resolve_section_symbol(inputs, symbols, location_sym, location_offset)
            } else {
                (location_sym, location_offset)
            };

            let target_body = symbols.get(target_sym);
            if target_body.is_undefined() {
                let message = format!(
                    "{section_name}: capability relocation against undefined symbol {}",
                    String::from_utf8_lossy(&target_body.name)
                );
                if config.allow_undefined_cap_relocs {
                    warning(&message);
                } else {
                    self.error(message);
                }
                continue;
            }
            let mut target_needs_dyn = false;
            if target_body.is_shared() {
                if config.is_static {
                    self.error(format!(
                        "{section_name}: cannot create a capability relocation against a \
                         shared symbol when linking statically"
                    ));
                    continue;
                }
                target_needs_dyn = true;
            }

            let loc_needs_dyn = config.is_pic();
            let target_needs_dyn = target_needs_dyn || config.is_pic();
            let entry_offset = self.relocs.len() as u64 * CAP_RELOC_ENTRY_SIZE;
            let key = CapRelocLocation {
                base_sym: location_sym,
                offset: location_offset,
                needs_dyn_reloc: loc_needs_dyn,
            };
            if self
                .relocs
                .insert(
                    key,
                    CapReloc {
                        target: target_sym,
                        target_sym_offset: target_rel.addend as u64,
                        offset: cap_offset,
                        size_hint: cap_size,
                        needs_dyn_reloc: target_needs_dyn,
                    },
                )
                .is_some()
            {
                bail!(
                    "{section_name}: duplicate capability relocation at {}+0x{:x}",
                    String::from_utf8_lossy(&symbols.get(location_sym).name),
                    location_offset
                );
            }

            if loc_needs_dyn {
                // The runtime only needs the load address added; a relative
                // relocation against the location field does that.
                rela_dyn.add_reloc(
                    target,
                    DynamicReloc::new_sym_va(
                        target.relative_rel(),
                        RelocPlace::CapRelocs,
                        entry_offset,
                        location_sym,
                        location_offset as i64,
                    ),
                );
            }
            if target_needs_dyn {
                // The capability target is the second field. The addend is
                // zero because the capability offset is part of the record.
                rela_dyn.add_reloc(
                    target,
                    DynamicReloc::new(
                        target.relative_rel(),
                        RelocPlace::CapRelocs,
                        entry_offset + 8,
                        Some(target_sym),
                        0,
                    ),
                );
            }
        }
        Ok(())
    }

    pub fn finalize(&mut self) -> Result {
        if self.base.finalized {
            return Ok(());
        }
        self.base.finalized = true;
        self.base.size = self.relocs.len() as u64 * CAP_RELOC_ENTRY_SIZE;
        if !self.errors.is_empty() {
            bail!(
                "invalid capability relocations:\n{}",
                self.errors.join("\n")
            );
        }
        Ok(())
    }
}

/// Translates a section symbol plus offset into the defined symbol enclosing
/// that offset. Exact matches on function or object symbols win; otherwise
/// the closest enclosing definition is used.
fn resolve_section_symbol(
    inputs: &LinkInputs,
    symbols: &SymbolDb,
    section_sym: SymbolId,
    offset: u64,
) -> (SymbolId, u64) {
    let SymbolPlacement::Defined(section_id) = symbols.get(section_sym).placement else {
        return (section_sym, offset);
    };
    let mut fallback = None;
    for &candidate in &inputs.file(inputs.section(section_id).file).symbols {
        let sym = symbols.get(candidate);
        if sym.placement != SymbolPlacement::Defined(section_id) || sym.is_section() {
            continue;
        }
        if sym.value <= offset && offset < sym.value + sym.size.max(1) {
            if sym.value == offset && (sym.is_func() || sym.sym_type == object::elf::STT_OBJECT) {
                return (candidate, 0);
            }
            fallback = Some((candidate, offset - sym.value));
        }
    }
    fallback.unwrap_or((section_sym, offset))
}

impl SyntheticSection for CapRelocsSection {
    fn base(&self) -> &SectionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut SectionBase {
        &mut self.base
    }

    fn is_empty(&self) -> bool {
        self.relocs.is_empty()
    }

    fn write_to(&self, cx: &WriteCx, buf: &mut [u8]) -> Result {
        let mut at = 0usize;
        for (location, reloc) in &self.relocs {
            // The location and target fields always hold virtual addresses;
            // in position-independent output the paired relative relocations
            // rebase them at load time.
            let location_va = cx.symbol_va_plus(location.base_sym, location.offset as i64);
            let target_va = cx.symbol_va_plus(reloc.target, reloc.target_sym_offset as i64);

            let target_body = cx.symbols.get(reloc.target);
            let mut target_size = target_body.size;
            if target_size == 0 {
                warning(&format!(
                    "could not determine size of capability relocation against {}",
                    String::from_utf8_lossy(&target_body.name)
                ));
                target_size = enclosing_section_size(cx, reloc.target).unwrap_or_else(|| {
                    warning(&format!(
                        "could not find section size for {}; using u64::MAX",
                        String::from_utf8_lossy(&target_body.name)
                    ));
                    u64::MAX
                });
            }
            debug_assert!(reloc.offset <= target_size || target_size == u64::MAX);
            debug_assert!(reloc.size_hint == 0 || reloc.offset <= reloc.size_hint);

            let permissions = if target_body.is_func() {
                CAP_PERM_FUNCTION
            } else {
                0
            };

            // Five packed little-endian 64-bit fields, regardless of the
            // target byte order.
            let entry = InMemoryCapRelocEntry {
                location: location_va.to_le(),
                target: target_va.to_le(),
                offset: reloc.offset.to_le(),
                size: target_size.to_le(),
                permissions: permissions.to_le(),
            };
            buf[at..at + CAP_RELOC_ENTRY_SIZE as usize]
                .copy_from_slice(bytemuck::bytes_of(&entry));
            at += CAP_RELOC_ENTRY_SIZE as usize;
        }
        Ok(())
    }
}

/// Size fallback when the target symbol has none: the rest of its enclosing
/// output section.
fn enclosing_section_size(cx: &WriteCx, target: SymbolId) -> Option<u64> {
    let sym = cx.symbols.get(target);
    match sym.placement {
        SymbolPlacement::Defined(section_id) => {
            let section = cx.inputs.section(section_id);
            let out = section.out?;
            let offset_in_out = section.out_offset + sym.value;
            Some(cx.outputs.get(out).size.saturating_sub(offset_in_out))
        }
        SymbolPlacement::Common { .. } => {
            // Commons were packed into BSS at a known offset.
            Some(cx.common_section_size().saturating_sub(sym.value))
        }
        _ => None,
    }
}
