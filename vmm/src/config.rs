// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use std::str::FromStr;

use option_parser::{Address, ByteSized, OptionParser, OptionParserError, Toggle};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_VCPUS: u8 = 1;
pub const DEFAULT_MEMORY_MB: u64 = 512;
pub const DEFAULT_IDENTITY_MAP_ADDRESS: u64 = 0xfeff_c000;
/// The three-page TSS region follows the one-page identity map.
pub const DEFAULT_TSS_ADDRESS: u64 = DEFAULT_IDENTITY_MAP_ADDRESS + 0x1000;

/// Errors associated with accelerator configuration parameters.
#[derive(Debug, Error)]
pub enum Error {
    /// Error parsing accelerator options
    #[error("Error parsing --accel")]
    ParseAccel(#[source] OptionParserError),
    /// Error parsing CPU options
    #[error("Error parsing --cpus")]
    ParseCpus(#[source] OptionParserError),
    /// Max is less than boot
    #[error("Error parsing --cpus: max CPUs lower than boot CPUs")]
    ParseCpusMaxLowerThanBoot,
    /// Error parsing memory options
    #[error("Error parsing --memory")]
    ParseMemory(#[source] OptionParserError),
    /// Guest memory cannot be empty
    #[error("Error parsing --memory: size must be non zero")]
    ParseMemoryZeroSize,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Where the interrupt controllers live.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum IrqchipMode {
    /// PIC, IOAPIC and LAPICs are all emulated by the kernel.
    #[default]
    On,
    /// Everything is emulated in user space.
    Off,
    /// LAPICs in the kernel, PIC and IOAPIC in user space.
    Split,
}

#[derive(Debug, Error)]
pub enum ParseIrqchipModeError {
    #[error("invalid irqchip mode: {0}")]
    InvalidValue(String),
}

impl FromStr for IrqchipMode {
    type Err = ParseIrqchipModeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "on" | "true" => Ok(IrqchipMode::On),
            "off" | "false" => Ok(IrqchipMode::Off),
            "split" => Ok(IrqchipMode::Split),
            _ => Err(ParseIrqchipModeError::InvalidValue(s.to_owned())),
        }
    }
}

/// What to do when the kernel fails to emulate a guest instruction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum EmulationErrorPolicy {
    /// Dump state and stop the VM.
    #[default]
    Strict,
    /// Report the vCPU as interrupted when the failing instruction came
    /// from user mode in protected mode, so the guest kernel can deal
    /// with it.
    Permissive,
}

#[derive(Debug, Error)]
pub enum ParseEmulationErrorPolicyError {
    #[error("invalid emulation error policy: {0}")]
    InvalidValue(String),
}

impl FromStr for EmulationErrorPolicy {
    type Err = ParseEmulationErrorPolicyError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "strict" => Ok(EmulationErrorPolicy::Strict),
            "permissive" => Ok(EmulationErrorPolicy::Permissive),
            _ => Err(ParseEmulationErrorPolicyError::InvalidValue(s.to_owned())),
        }
    }
}

fn default_accelconfig_readonly_two_step() -> bool {
    true
}

fn default_accelconfig_identity_map() -> u64 {
    DEFAULT_IDENTITY_MAP_ADDRESS
}

fn default_accelconfig_tss() -> u64 {
    DEFAULT_TSS_ADDRESS
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct AccelConfig {
    #[serde(default)]
    pub kernel_irqchip: IrqchipMode,
    #[serde(default)]
    pub emulation_error: EmulationErrorPolicy,
    /// Flip the read-only bit of a slot by removing it first.
    #[serde(default = "default_accelconfig_readonly_two_step")]
    pub readonly_two_step: bool,
    /// Register the SMRAM address space.
    #[serde(default)]
    pub smm: bool,
    #[serde(default = "default_accelconfig_identity_map")]
    pub identity_map: u64,
    #[serde(default = "default_accelconfig_tss")]
    pub tss: u64,
}

impl AccelConfig {
    pub fn parse(accel: &str) -> Result<Self> {
        let mut parser = OptionParser::new();
        parser
            .add("kernel_irqchip")
            .add("emulation_error")
            .add("readonly_two_step")
            .add("smm")
            .add("identity_map")
            .add("tss");
        parser.parse(accel).map_err(Error::ParseAccel)?;

        let kernel_irqchip = parser
            .convert("kernel_irqchip")
            .map_err(Error::ParseAccel)?
            .unwrap_or_default();
        let emulation_error = parser
            .convert("emulation_error")
            .map_err(Error::ParseAccel)?
            .unwrap_or_default();
        let readonly_two_step = parser
            .convert::<Toggle>("readonly_two_step")
            .map_err(Error::ParseAccel)?
            .unwrap_or(Toggle(true))
            .0;
        let smm = parser
            .convert::<Toggle>("smm")
            .map_err(Error::ParseAccel)?
            .unwrap_or(Toggle(false))
            .0;
        let identity_map = parser
            .convert::<Address>("identity_map")
            .map_err(Error::ParseAccel)?
            .map(|a| a.0)
            .unwrap_or(DEFAULT_IDENTITY_MAP_ADDRESS);
        let tss = parser
            .convert::<Address>("tss")
            .map_err(Error::ParseAccel)?
            .map(|a| a.0)
            .unwrap_or(identity_map + 0x1000);

        Ok(AccelConfig {
            kernel_irqchip,
            emulation_error,
            readonly_two_step,
            smm,
            identity_map,
            tss,
        })
    }
}

impl Default for AccelConfig {
    fn default() -> Self {
        AccelConfig {
            kernel_irqchip: IrqchipMode::default(),
            emulation_error: EmulationErrorPolicy::default(),
            readonly_two_step: true,
            smm: false,
            identity_map: DEFAULT_IDENTITY_MAP_ADDRESS,
            tss: DEFAULT_TSS_ADDRESS,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct CpusConfig {
    pub boot_vcpus: u8,
    pub max_vcpus: u8,
}

impl CpusConfig {
    pub fn parse(cpus: &str) -> Result<Self> {
        let mut parser = OptionParser::new();
        parser.add("boot").add("max");
        parser.parse(cpus).map_err(Error::ParseCpus)?;

        let boot_vcpus: u8 = parser
            .convert("boot")
            .map_err(Error::ParseCpus)?
            .unwrap_or(DEFAULT_VCPUS);
        let max_vcpus: u8 = parser
            .convert("max")
            .map_err(Error::ParseCpus)?
            .unwrap_or(boot_vcpus);

        if max_vcpus < boot_vcpus {
            return Err(Error::ParseCpusMaxLowerThanBoot);
        }

        Ok(CpusConfig {
            boot_vcpus,
            max_vcpus,
        })
    }
}

impl Default for CpusConfig {
    fn default() -> Self {
        CpusConfig {
            boot_vcpus: DEFAULT_VCPUS,
            max_vcpus: DEFAULT_VCPUS,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct MemoryConfig {
    pub size: u64,
}

impl MemoryConfig {
    pub fn parse(memory: &str) -> Result<Self> {
        let mut parser = OptionParser::new();
        parser.add("size");
        parser.parse(memory).map_err(Error::ParseMemory)?;

        let size = parser
            .convert::<ByteSized>("size")
            .map_err(Error::ParseMemory)?
            .unwrap_or(ByteSized(DEFAULT_MEMORY_MB << 20))
            .0;
        if size == 0 {
            return Err(Error::ParseMemoryZeroSize);
        }

        Ok(MemoryConfig { size })
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        MemoryConfig {
            size: DEFAULT_MEMORY_MB << 20,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accel_parsing() -> Result<()> {
        assert_eq!(AccelConfig::parse("")?, AccelConfig::default());
        assert_eq!(
            AccelConfig::parse("kernel_irqchip=split")?.kernel_irqchip,
            IrqchipMode::Split
        );
        assert_eq!(
            AccelConfig::parse("kernel_irqchip=off,emulation_error=permissive")?,
            AccelConfig {
                kernel_irqchip: IrqchipMode::Off,
                emulation_error: EmulationErrorPolicy::Permissive,
                ..Default::default()
            }
        );
        assert!(!AccelConfig::parse("readonly_two_step=off")?.readonly_two_step);
        assert!(AccelConfig::parse("smm=on")?.smm);

        let config = AccelConfig::parse("identity_map=0xfffbc000")?;
        assert_eq!(config.identity_map, 0xfffb_c000);
        assert_eq!(config.tss, 0xfffb_d000);
        assert_eq!(
            AccelConfig::parse("identity_map=0xfffbc000,tss=0xfffb0000")?.tss,
            0xfffb_0000
        );

        assert!(AccelConfig::parse("kernel_irqchip=maybe").is_err());
        assert!(AccelConfig::parse("emulation_error=lenient").is_err());
        assert!(AccelConfig::parse("nested=on").is_err());
        Ok(())
    }

    #[test]
    fn test_accel_serialization() {
        let config = AccelConfig::parse("kernel_irqchip=split,smm=on").unwrap();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: AccelConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);

        let defaults: AccelConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(defaults, AccelConfig::default());
    }

    #[test]
    fn test_cpu_parsing() -> Result<()> {
        assert_eq!(CpusConfig::parse("")?, CpusConfig::default());
        assert_eq!(
            CpusConfig::parse("boot=2,max=4")?,
            CpusConfig {
                boot_vcpus: 2,
                max_vcpus: 4
            }
        );
        assert!(CpusConfig::parse("boot=4,max=2").is_err());
        assert!(CpusConfig::parse("boot=two").is_err());
        Ok(())
    }

    #[test]
    fn test_mem_parsing() -> Result<()> {
        assert_eq!(MemoryConfig::parse("")?, MemoryConfig::default());
        assert_eq!(MemoryConfig::parse("size=1G")?.size, 1 << 30);
        assert_eq!(MemoryConfig::parse("size=64M")?.size, 64 << 20);
        assert!(MemoryConfig::parse("size=0").is_err());
        assert!(MemoryConfig::parse("file=/dev/shm").is_err());
        Ok(())
    }
}
