//! The terminating sentinel for the `.ARM.exidx` unwind table. Its PREL31
//! field must point past the last byte of code the table covers, and its
//! second word is the CANTUNWIND marker.

use crate::context::WriteCx;
use crate::elf::EXIDX_CANTUNWIND;
use crate::elf::secnames;
use crate::elf::shf;
use crate::elf::sht;
use crate::error::Result;
use crate::input::InputSectionId;
use crate::section::SectionBase;
use crate::section::SyntheticSection;
use anyhow::Context as _;

pub struct ArmExidxSentinelSection {
    pub base: SectionBase,
    /// The last real (non-sentinel) `.ARM.exidx` input section, recorded by
    /// the placement pass that sorted the table.
    last_exidx_section: Option<InputSectionId>,
}

impl ArmExidxSentinelSection {
    pub fn new(word_size: u64) -> Self {
        let mut base = SectionBase::new(
            secnames::ARM_EXIDX_SECTION_NAME,
            sht::ARM_EXIDX,
            shf::ALLOC.with(shf::LINK_ORDER),
            word_size,
        );
        base.size = 8;
        base.finalized = true;
        ArmExidxSentinelSection {
            base,
            last_exidx_section: None,
        }
    }

    pub fn set_last_exidx_section(&mut self, section: InputSectionId) {
        self.last_exidx_section = Some(section);
    }
}

impl SyntheticSection for ArmExidxSentinelSection {
    fn base(&self) -> &SectionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut SectionBase {
        &mut self.base
    }

    fn is_empty(&self) -> bool {
        self.last_exidx_section.is_none()
    }

    fn write_to(&self, cx: &WriteCx, buf: &mut [u8]) -> Result {
        // The entry describes the upper bound of unwindable code: the end of
        // the executable section the last table fragment is ordered after.
        let last = self
            .last_exidx_section
            .context(".ARM.exidx sentinel has no preceding table fragment")?;
        let code = cx
            .inputs
            .section(last)
            .link_order_dep
            .context(".ARM.exidx fragment has no link-order dependency")?;
        let code_section = cx.inputs.section(code);
        let upper_bound =
            code_section.output_address(cx.outputs) + code_section.data.len() as u64;
        let place = self.base.va(cx.outputs);
        cx.target.apply_relocation(
            cx.config.format,
            buf,
            0,
            object::elf::R_ARM_PREL31,
            upper_bound,
            place,
        )?;
        cx.config.format.write_u32(buf, 4, EXIDX_CANTUNWIND);
        Ok(())
    }
}
