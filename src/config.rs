//! Compilation options, populated from the environment and the CLI

use serde::{Deserialize, Serialize};

use crate::arch::Arch;
use crate::error::CompileResult;

/// Environment variable that selects the target architecture
pub const ARCH_ENV_VAR: &str = "ARCH_NAME";

/// Knobs that are not part of the netlist text itself
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompileOptions {
    /// Concrete architecture, required when the netlist supports several
    pub arch_override: Option<Arch>,
    /// Program executors bind every `Param` to 1 instead of reading values
    pub ignore_runtime_parameters: bool,
}

impl CompileOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_arch(mut self, arch: Arch) -> Self {
        self.arch_override = Some(arch);
        self
    }

    /// Read `ARCH_NAME` from the process environment
    pub fn from_env() -> CompileResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> CompileResult<Self> {
        let arch_override = match lookup(ARCH_ENV_VAR) {
            Some(name) if !name.trim().is_empty() => Some(name.trim().parse()?),
            _ => None,
        };
        Ok(Self {
            arch_override,
            ..Self::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_parses_arch() {
        let opts = CompileOptions::from_lookup(|_| Some("wormhole_b0".to_string())).unwrap();
        assert_eq!(opts.arch_override, Some(Arch::WormholeB0));
    }

    #[test]
    fn test_missing_or_blank_env_means_no_override() {
        assert!(CompileOptions::from_lookup(|_| None).unwrap().arch_override.is_none());
        assert!(CompileOptions::from_lookup(|_| Some(" ".to_string()))
            .unwrap()
            .arch_override
            .is_none());
    }

    #[test]
    fn test_invalid_arch_is_an_error() {
        assert!(CompileOptions::from_lookup(|_| Some("tpu".to_string())).is_err());
    }
}
