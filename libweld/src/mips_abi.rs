//! MIPS auxiliary ABI sections. Each merges the corresponding records from
//! every input into a single output record: `.MIPS.abiflags` everywhere,
//! `.MIPS.options` on N64, `.reginfo` on O32/N32, plus the `.rld_map`
//! scratch slot the runtime linker writes its debug map pointer into.

use crate::config::Config;
use crate::context::WriteCx;
use crate::elf::MIPS_ABIFLAGS_SIZE;
use crate::elf::MIPS_OPTIONS_HEADER_SIZE;
use crate::elf::MIPS_REGINFO32_SIZE;
use crate::elf::MIPS_REGINFO64_SIZE;
use crate::elf::MipsAbiFlags;
use crate::elf::MipsRegInfo;
use crate::elf::ODK_REGINFO;
use crate::elf::fp_abi;
use crate::elf::secnames;
use crate::elf::shf;
use crate::elf::sht;
use crate::error::Result;
use crate::error::warning;
use crate::format::OutputFormat;
use crate::input::LinkInputs;
use crate::section::SectionBase;
use crate::section::SyntheticSection;
use anyhow::bail;

/// Reconciles two `fp_abi` values. The ordering follows the MIPS ABI
/// compatibility chain: ANY fits anything, FPXX fits any concrete ABI, and
/// FP64A extends FP64.
fn merge_fp_abi(old: u8, new: u8, file_name: &str) -> Result<u8> {
    if old == new || new == fp_abi::ANY {
        return Ok(old);
    }
    if old == fp_abi::ANY {
        return Ok(new);
    }
    let rank = |abi: u8| match abi {
        fp_abi::XX => Some(1),
        fp_abi::DOUBLE => Some(2),
        fp_abi::FP_64 => Some(3),
        fp_abi::FP_64A => Some(4),
        _ => None,
    };
    match (rank(old), rank(new)) {
        (Some(a), Some(b)) => Ok(if a >= b { old } else { new }),
        _ => bail!("{file_name}: incompatible floating point ABI: {old} vs {new}"),
    }
}

fn read_abiflags(format: OutputFormat, data: &[u8]) -> MipsAbiFlags {
    MipsAbiFlags {
        version: format.read_u16(data, 0),
        isa_level: data[2],
        isa_rev: data[3],
        gpr_size: data[4],
        cpr1_size: data[5],
        cpr2_size: data[6],
        fp_abi: data[7],
        isa_ext: format.read_u32(data, 8),
        ases: format.read_u32(data, 12),
        flags1: format.read_u32(data, 16),
        flags2: format.read_u32(data, 20),
    }
}

pub struct MipsAbiFlagsSection {
    pub base: SectionBase,
    flags: MipsAbiFlags,
}

impl MipsAbiFlagsSection {
    /// Merges all input `.MIPS.abiflags` sections. Returns `None` when no
    /// input carried one.
    pub fn create(inputs: &mut LinkInputs, config: &Config) -> Result<Option<Self>> {
        let mut flags = MipsAbiFlags::default();
        let mut found = false;
        for id in inputs.section_ids().collect::<Vec<_>>() {
            if inputs.section(id).ty != sht::MIPS_ABIFLAGS {
                continue;
            }
            inputs.section_mut(id).live = false;
            found = true;

            let section = inputs.section(id);
            let file_name = inputs.file(section.file).name.clone();
            let size = section.data.len();
            // Older BFD linkers concatenate .MIPS.abiflags instead of
            // merging, so tolerate (but flag) trailing data past the first
            // record.
            if size < MIPS_ABIFLAGS_SIZE {
                bail!(
                    "{file_name}: invalid size of .MIPS.abiflags section: got {size} instead \
                     of {MIPS_ABIFLAGS_SIZE}"
                );
            }
            let record = read_abiflags(config.format, section.data);
            if record.version != 0 {
                bail!(
                    "{file_name}: unexpected .MIPS.abiflags version {}",
                    record.version
                );
            }
            if size > MIPS_ABIFLAGS_SIZE {
                warning(&format!(
                    "{file_name}: .MIPS.abiflags section has multiple entries: got {size} \
                     instead of {MIPS_ABIFLAGS_SIZE} bytes"
                ));
            }

            flags.isa_level = flags.isa_level.max(record.isa_level);
            flags.isa_rev = flags.isa_rev.max(record.isa_rev);
            flags.isa_ext = flags.isa_ext.max(record.isa_ext);
            flags.gpr_size = flags.gpr_size.max(record.gpr_size);
            flags.cpr1_size = flags.cpr1_size.max(record.cpr1_size);
            flags.cpr2_size = flags.cpr2_size.max(record.cpr2_size);
            flags.ases |= record.ases;
            flags.flags1 |= record.flags1;
            flags.flags2 |= record.flags2;
            flags.fp_abi = merge_fp_abi(flags.fp_abi, record.fp_abi, &file_name)?;
        }
        if !found {
            return Ok(None);
        }
        let mut base = SectionBase::new(
            secnames::MIPS_ABIFLAGS_SECTION_NAME,
            sht::MIPS_ABIFLAGS,
            shf::ALLOC,
            8,
        );
        base.entsize = MIPS_ABIFLAGS_SIZE as u64;
        base.size = MIPS_ABIFLAGS_SIZE as u64;
        base.finalized = true;
        Ok(Some(MipsAbiFlagsSection { base, flags }))
    }
}

impl SyntheticSection for MipsAbiFlagsSection {
    fn base(&self) -> &SectionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut SectionBase {
        &mut self.base
    }

    fn write_to(&self, cx: &WriteCx, buf: &mut [u8]) -> Result {
        let format = cx.config.format;
        format.write_u16(buf, 0, self.flags.version);
        buf[2] = self.flags.isa_level;
        buf[3] = self.flags.isa_rev;
        buf[4] = self.flags.gpr_size;
        buf[5] = self.flags.cpr1_size;
        buf[6] = self.flags.cpr2_size;
        buf[7] = self.flags.fp_abi;
        format.write_u32(buf, 8, self.flags.isa_ext);
        format.write_u32(buf, 12, self.flags.ases);
        format.write_u32(buf, 16, self.flags.flags1);
        format.write_u32(buf, 20, self.flags.flags2);
        Ok(())
    }
}

pub struct MipsOptionsSection {
    pub base: SectionBase,
    reginfo: MipsRegInfo,
}

impl MipsOptionsSection {
    /// Aggregates ODK_REGINFO descriptors from every `.MIPS.options`
    /// section. N64 only.
    pub fn create(inputs: &mut LinkInputs, config: &Config) -> Result<Option<Self>> {
        if !config.format.is_64() {
            return Ok(None);
        }
        let mut reginfo = MipsRegInfo::default();
        let mut found = false;
        for id in inputs.section_ids().collect::<Vec<_>>() {
            if inputs.section(id).ty != sht::MIPS_OPTIONS {
                continue;
            }
            inputs.section_mut(id).live = false;
            found = true;

            let section = inputs.section(id);
            let file_name = inputs.file(section.file).name.clone();
            let file = section.file;
            let mut data = section.data;
            while !data.is_empty() {
                if data.len() < MIPS_OPTIONS_HEADER_SIZE {
                    bail!("{file_name}: invalid size of .MIPS.options section");
                }
                let kind = data[0];
                let descriptor_size = data[1] as usize;
                if kind == ODK_REGINFO {
                    if data.len() < MIPS_OPTIONS_HEADER_SIZE + MIPS_REGINFO64_SIZE {
                        bail!("{file_name}: truncated ODK_REGINFO descriptor");
                    }
                    let body = &data[MIPS_OPTIONS_HEADER_SIZE..];
                    let gp_value = config.format.read_u64(body, 24) as i64;
                    if config.is_relocatable() && gp_value != 0 {
                        bail!("{file_name}: unsupported non-zero ri_gp_value");
                    }
                    reginfo.ri_gprmask |= config.format.read_u32(body, 0);
                    for (i, mask) in reginfo.ri_cprmask.iter_mut().enumerate() {
                        *mask |= config.format.read_u32(body, 8 + i * 4);
                    }
                    inputs.file_mut(file).mips_gp0 = gp_value as u64;
                    break;
                }
                if descriptor_size == 0 {
                    bail!("{file_name}: zero option descriptor size");
                }
                data = &data[descriptor_size.min(data.len())..];
            }
        }
        if !found {
            return Ok(None);
        }
        let mut base = SectionBase::new(
            secnames::MIPS_OPTIONS_SECTION_NAME,
            sht::MIPS_OPTIONS,
            shf::ALLOC,
            8,
        );
        base.entsize = (MIPS_OPTIONS_HEADER_SIZE + MIPS_REGINFO64_SIZE) as u64;
        base.size = base.entsize;
        base.finalized = true;
        Ok(Some(MipsOptionsSection { base, reginfo }))
    }
}

impl SyntheticSection for MipsOptionsSection {
    fn base(&self) -> &SectionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut SectionBase {
        &mut self.base
    }

    fn write_to(&self, cx: &WriteCx, buf: &mut [u8]) -> Result {
        let format = cx.config.format;
        buf[0] = ODK_REGINFO;
        buf[1] = self.base.size as u8;
        format.write_u16(buf, 2, 0); // section
        format.write_u32(buf, 4, 0); // info
        let body = &mut buf[MIPS_OPTIONS_HEADER_SIZE..];
        format.write_u32(body, 0, self.reginfo.ri_gprmask);
        for (i, mask) in self.reginfo.ri_cprmask.iter().enumerate() {
            format.write_u32(body, 8 + i * 4, *mask);
        }
        let gp_value = if cx.config.is_relocatable() {
            self.reginfo.ri_gp_value as u64
        } else {
            cx.mips_gp()
        };
        format.write_u64(body, 24, gp_value);
        Ok(())
    }
}

pub struct MipsReginfoSection {
    pub base: SectionBase,
    reginfo: MipsRegInfo,
}

impl MipsReginfoSection {
    /// Aggregates `.reginfo` sections. O32 and N32 only.
    pub fn create(inputs: &mut LinkInputs, config: &Config) -> Result<Option<Self>> {
        if config.format.is_64() {
            return Ok(None);
        }
        let mut reginfo = MipsRegInfo::default();
        let mut found = false;
        for id in inputs.section_ids().collect::<Vec<_>>() {
            if inputs.section(id).ty != sht::MIPS_REGINFO {
                continue;
            }
            inputs.section_mut(id).live = false;
            found = true;

            let section = inputs.section(id);
            let file_name = inputs.file(section.file).name.clone();
            let file = section.file;
            if section.data.len() != MIPS_REGINFO32_SIZE {
                bail!("{file_name}: invalid size of .reginfo section");
            }
            let gp_value = i64::from(config.format.read_u32(section.data, 20) as i32);
            if config.is_relocatable() && gp_value != 0 {
                bail!("{file_name}: unsupported non-zero ri_gp_value");
            }
            reginfo.ri_gprmask |= config.format.read_u32(section.data, 0);
            for (i, mask) in reginfo.ri_cprmask.iter_mut().enumerate() {
                *mask |= config.format.read_u32(section.data, 4 + i * 4);
            }
            inputs.file_mut(file).mips_gp0 = gp_value as u64;
        }
        if !found {
            return Ok(None);
        }
        let mut base = SectionBase::new(
            secnames::REGINFO_SECTION_NAME,
            sht::MIPS_REGINFO,
            shf::ALLOC,
            4,
        );
        base.entsize = MIPS_REGINFO32_SIZE as u64;
        base.size = MIPS_REGINFO32_SIZE as u64;
        base.finalized = true;
        Ok(Some(MipsReginfoSection { base, reginfo }))
    }
}

impl SyntheticSection for MipsReginfoSection {
    fn base(&self) -> &SectionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut SectionBase {
        &mut self.base
    }

    fn write_to(&self, cx: &WriteCx, buf: &mut [u8]) -> Result {
        let format = cx.config.format;
        format.write_u32(buf, 0, self.reginfo.ri_gprmask);
        for (i, mask) in self.reginfo.ri_cprmask.iter().enumerate() {
            format.write_u32(buf, 4 + i * 4, *mask);
        }
        let gp_value = if cx.config.is_relocatable() {
            self.reginfo.ri_gp_value as u32
        } else {
            cx.mips_gp() as u32
        };
        format.write_u32(buf, 20, gp_value);
        Ok(())
    }
}

/// One word of writable zeros; the runtime linker stores its debug map
/// pointer here (DT_MIPS_RLD_MAP).
pub struct MipsRldMapSection {
    pub base: SectionBase,
}

impl MipsRldMapSection {
    pub fn new(config: &Config) -> Self {
        let mut base = SectionBase::new(
            secnames::RLD_MAP_SECTION_NAME,
            sht::PROGBITS,
            shf::ALLOC.with(shf::WRITE),
            config.word_size(),
        );
        base.size = config.word_size();
        base.finalized = true;
        MipsRldMapSection { base }
    }
}

impl SyntheticSection for MipsRldMapSection {
    fn base(&self) -> &SectionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut SectionBase {
        &mut self.base
    }

    fn write_to(&self, _cx: &WriteCx, _buf: &mut [u8]) -> Result {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fp_abi_reconciliation() {
        assert_eq!(merge_fp_abi(fp_abi::ANY, fp_abi::FP_64, "t").unwrap(), fp_abi::FP_64);
        assert_eq!(merge_fp_abi(fp_abi::FP_64, fp_abi::ANY, "t").unwrap(), fp_abi::FP_64);
        assert_eq!(merge_fp_abi(fp_abi::XX, fp_abi::FP_64A, "t").unwrap(), fp_abi::FP_64A);
        assert_eq!(merge_fp_abi(fp_abi::FP_64A, fp_abi::FP_64, "t").unwrap(), fp_abi::FP_64A);
        assert!(merge_fp_abi(fp_abi::SOFT, fp_abi::FP_64, "t").is_err());
    }
}
