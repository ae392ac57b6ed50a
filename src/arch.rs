//! Target architecture descriptor and its capability flags

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{CompileError, CompileResult};
use crate::format::DataFormat;

/// Number of tiles that fit in half of the destination register
const HALF_DEST_TILES: u32 = 8;

/// Accelerator architectures the front end can target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arch {
    Grayskull,
    Wormhole,
    WormholeB0,
    Blackhole,
}

impl Arch {
    pub fn name(&self) -> &'static str {
        match self {
            Arch::Grayskull => "grayskull",
            Arch::Wormhole => "wormhole",
            Arch::WormholeB0 => "wormhole_b0",
            Arch::Blackhole => "blackhole",
        }
    }

    pub fn is_grayskull(&self) -> bool {
        *self == Arch::Grayskull
    }

    pub fn is_wormhole_b0(&self) -> bool {
        *self == Arch::WormholeB0
    }

    /// Graphs on different chips may exchange data without a queue
    pub fn supports_queueless_multichip(&self) -> bool {
        !matches!(self, Arch::Blackhole)
    }

    /// Destination register can accumulate in 32-bit formats
    pub fn supports_fp32_dest(&self) -> bool {
        !self.is_grayskull()
    }

    pub fn supports_l1_acc(&self) -> bool {
        matches!(self, Arch::WormholeB0 | Arch::Blackhole)
    }

    pub fn supports_stochastic_rounding(&self) -> bool {
        self.is_wormhole_b0()
    }

    /// Any op type may be a gradient op on this architecture
    pub fn supports_any_gradient_op(&self) -> bool {
        self.is_wormhole_b0()
    }

    pub fn supports_tiny_tiles(&self) -> bool {
        !self.is_grayskull()
    }

    pub fn supports_dram_ports(&self) -> bool {
        self.is_wormhole_b0()
    }

    /// Grid coordinates (y, x) that never receive broadcast traffic by default
    pub fn default_broadcast_exclusions(&self) -> &'static [(u32, u32)] {
        match self {
            Arch::Grayskull => &[],
            Arch::Wormhole | Arch::WormholeB0 => &[(0, 0), (0, 9), (6, 0), (6, 9)],
            Arch::Blackhole => &[(0, 0), (0, 8)],
        }
    }

    /// Largest ublock (in tiles) that fits in dest for the given accumulation format
    pub fn max_dest_tiles(&self, acc_df: DataFormat) -> u32 {
        let mut max = HALF_DEST_TILES;
        if matches!(acc_df, DataFormat::Float32 | DataFormat::Int32) {
            max /= 2;
        }
        if *self == Arch::Wormhole {
            max *= 4;
        }
        max
    }
}

impl FromStr for Arch {
    type Err = CompileError;

    fn from_str(s: &str) -> CompileResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "grayskull" => Ok(Arch::Grayskull),
            "wormhole" => Ok(Arch::Wormhole),
            "wormhole_b0" => Ok(Arch::WormholeB0),
            "blackhole" => Ok(Arch::Blackhole),
            _ => Err(CompileError::parse_error(format!("Invalid arch string {}", s))),
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// The `devices` section: the architectures a netlist supports and the
/// one selected for this compilation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub arch: Arch,
    pub supported: Vec<Arch>,
}

impl DeviceInfo {
    pub fn new(arch: Arch) -> Self {
        Self {
            arch,
            supported: vec![arch],
        }
    }

    /// Pick the active architecture from the declared list
    pub fn select(supported: Vec<Arch>, arch_override: Option<Arch>) -> CompileResult<Self> {
        let arch = match (supported.as_slice(), arch_override) {
            ([], _) => {
                return Err(CompileError::parse_error(
                    "devices section must declare at least one arch",
                ))
            }
            ([single], arch_override) => {
                if let Some(other) = arch_override.filter(|other| other != single) {
                    log::warn!(
                        "ARCH_NAME={} ignored, netlist only supports {}",
                        other,
                        single
                    );
                }
                *single
            }
            (_, None) => {
                return Err(CompileError::parse_error(
                    "Must specify ARCH_NAME in cmdline if netlist supports multiple arch",
                ))
            }
            (list, Some(arch)) => {
                if !list.contains(&arch) {
                    return Err(CompileError::parse_error(format!(
                        "ARCH_NAME={} is not one of the archs supported by the netlist",
                        arch
                    )));
                }
                arch
            }
        };
        log::debug!("Selected arch {} from {:?}", arch, supported);
        Ok(Self { arch, supported })
    }
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self::new(Arch::Grayskull)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arch() {
        assert_eq!("WORMHOLE_B0".parse::<Arch>().unwrap(), Arch::WormholeB0);
        assert!("hopper".parse::<Arch>().is_err());
    }

    #[test]
    fn test_dest_capacity() {
        assert_eq!(Arch::Grayskull.max_dest_tiles(DataFormat::Float16_b), 8);
        assert_eq!(Arch::WormholeB0.max_dest_tiles(DataFormat::Float32), 4);
        assert_eq!(Arch::Wormhole.max_dest_tiles(DataFormat::Float16), 32);
        assert_eq!(Arch::Wormhole.max_dest_tiles(DataFormat::Int32), 16);
    }

    #[test]
    fn test_select_requires_override_for_multiple_archs() {
        let err = DeviceInfo::select(vec![Arch::Grayskull, Arch::WormholeB0], None).unwrap_err();
        assert!(err.message().contains("ARCH_NAME"));

        let info =
            DeviceInfo::select(vec![Arch::Grayskull, Arch::WormholeB0], Some(Arch::WormholeB0)).unwrap();
        assert_eq!(info.arch, Arch::WormholeB0);

        let single = DeviceInfo::select(vec![Arch::Grayskull], Some(Arch::Blackhole)).unwrap();
        assert_eq!(single.arch, Arch::Grayskull);
        assert!(
            DeviceInfo::select(vec![Arch::Grayskull, Arch::Wormhole], Some(Arch::Blackhole)).is_err()
        );
    }

    #[test]
    fn test_capabilities() {
        assert!(!Arch::Blackhole.supports_queueless_multichip());
        assert!(Arch::Grayskull.supports_queueless_multichip());
        assert!(!Arch::Grayskull.supports_fp32_dest());
        assert!(Arch::Blackhole.supports_l1_acc());
    }
}
