//! Hardware definitions for the supported MME generations
//!
//! `MmeHal` carries the per-chip constants every other stage reads (cache
//! line size, accumulator budget, SB geometry, rate limiters).
//! `GeneratorConfig` is the user-facing configuration of a generator
//! session.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{DescGenError, DescGenResult};

/// Hardware generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chip {
    Gaudi2,
    Gaudi3,
}

impl fmt::Display for Chip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Chip::Gaudi2 => write!(f, "gaudi2"),
            Chip::Gaudi3 => write!(f, "gaudi3"),
        }
    }
}

impl FromStr for Chip {
    type Err = DescGenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gaudi2" => Ok(Chip::Gaudi2),
            "gaudi3" => Ok(Chip::Gaudi3),
            other => Err(DescGenError::config(format!("unknown chip '{}'", other))),
        }
    }
}

/// Accumulator bank budget used for roll arithmetic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccumBudget {
    /// Banks available in regular mode
    pub accums_nr: u32,
    /// Banks available when the EU runs two gemms (bgemm mode)
    pub accums_nr_2x: u32,
}

/// Default rate limiter values written to every descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimits {
    pub agu_a: u8,
    pub agu_b: u8,
    pub agu_out: u8,
    pub eu: u8,
}

/// Per-generation hardware constants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MmeHal {
    pub chip: Chip,
    /// Cache line size in bytes
    pub cl_size: u32,
    pub accums_nr: u32,
    pub accums_nr_2x: u32,
    /// SB size in cache lines
    pub sb_size: u32,
    /// Input SBs per core
    pub sb_nr: usize,
    /// Output write buffers per core
    pub wb_nr: usize,
    pub max_sb_reuse: u32,
    /// Maximal number of master MMEs a single operation can use
    pub max_mme_nr: u32,
    pub cores_per_mme: u32,
    /// Input ports of a single MME that have a dedicated SB
    pub input_ports_per_mme: u32,
    pub rate_limits: RateLimits,
    /// Size of the packed descriptor in bytes
    pub desc_size: usize,
}

impl MmeHal {
    pub fn gaudi2() -> Self {
        Self {
            chip: Chip::Gaudi2,
            cl_size: 128,
            accums_nr: 4,
            accums_nr_2x: 8,
            sb_size: 2768,
            sb_nr: 5,
            wb_nr: 2,
            max_sb_reuse: 240,
            max_mme_nr: 2,
            cores_per_mme: 2,
            input_ports_per_mme: 8,
            rate_limits: RateLimits {
                agu_a: 4,
                agu_b: 4,
                agu_out: 4,
                eu: 0,
            },
            desc_size: 728,
        }
    }

    pub fn gaudi3() -> Self {
        Self {
            chip: Chip::Gaudi3,
            cl_size: 128,
            accums_nr: 4,
            accums_nr_2x: 8,
            sb_size: 3200,
            sb_nr: 4,
            wb_nr: 1,
            max_sb_reuse: 240,
            max_mme_nr: 8,
            cores_per_mme: 2,
            input_ports_per_mme: 8,
            rate_limits: RateLimits {
                agu_a: 4,
                agu_b: 4,
                agu_out: 4,
                eu: 4,
            },
            desc_size: 656,
        }
    }

    pub fn for_chip(chip: Chip) -> Self {
        match chip {
            Chip::Gaudi2 => Self::gaudi2(),
            Chip::Gaudi3 => Self::gaudi3(),
        }
    }

    pub fn accum_budget(&self) -> AccumBudget {
        AccumBudget {
            accums_nr: self.accums_nr,
            accums_nr_2x: self.accums_nr_2x,
        }
    }

    /// Number of elements of the given size that fill one cache line
    pub fn elements_per_cl(&self, element_size: u32) -> u32 {
        self.cl_size / element_size
    }
}

/// Configuration of a descriptor generator session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub chip: Chip,
    /// Capacity of the descriptor cache, in distinct layer params
    pub cache_capacity: usize,
    /// Consult the descriptor cache at all
    pub use_cache: bool,
}

impl GeneratorConfig {
    pub fn new(chip: Chip, cache_capacity: usize, use_cache: bool) -> Self {
        Self {
            chip,
            cache_capacity,
            use_cache,
        }
    }

    pub fn default_gaudi2() -> Self {
        Self::new(Chip::Gaudi2, 1000, true)
    }

    pub fn hal(&self) -> MmeHal {
        MmeHal::for_chip(self.chip)
    }

    pub fn validate(&self) -> DescGenResult<()> {
        if self.use_cache && self.cache_capacity == 0 {
            return Err(DescGenError::config(
                "cache capacity must be positive when the cache is enabled",
            ));
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> DescGenResult<Self> {
        let config: GeneratorConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self::default_gaudi2()
    }
}

impl fmt::Display for GeneratorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hal = self.hal();
        write!(
            f,
            "{} ({} MMEs x {} cores, {}B descriptors), cache {}",
            self.chip,
            hal.max_mme_nr,
            hal.cores_per_mme,
            hal.desc_size,
            if self.use_cache {
                format!("capacity {}", self.cache_capacity)
            } else {
                "disabled".to_string()
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chip_from_str() {
        assert_eq!("gaudi2".parse::<Chip>().unwrap(), Chip::Gaudi2);
        assert_eq!("GAUDI3".parse::<Chip>().unwrap(), Chip::Gaudi3);
        assert!("gaudi1".parse::<Chip>().is_err());
    }

    #[test]
    fn test_hal_constants() {
        let g2 = MmeHal::for_chip(Chip::Gaudi2);
        assert_eq!(g2.sb_nr, 5);
        assert_eq!(g2.wb_nr, 2);
        assert_eq!(g2.rate_limits.eu, 0);
        let g3 = MmeHal::for_chip(Chip::Gaudi3);
        assert_eq!(g3.max_mme_nr, 8);
        assert_eq!(g3.rate_limits.eu, 4);
        assert_eq!(g3.accum_budget(), AccumBudget { accums_nr: 4, accums_nr_2x: 8 });
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = GeneratorConfig::new(Chip::Gaudi3, 16, true);
        let json = config.to_json().unwrap();
        assert_eq!(GeneratorConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn test_config_rejects_zero_capacity() {
        let err =
            GeneratorConfig::from_json(r#"{"chip": "gaudi2", "cache_capacity": 0}"#).unwrap_err();
        assert!(err.to_string().contains("cache capacity"));
    }

    #[test]
    fn test_config_display() {
        let config = GeneratorConfig::new(Chip::Gaudi2, 8, false);
        assert_eq!(
            config.to_string(),
            "gaudi2 (2 MMEs x 2 cores, 728B descriptors), cache disabled"
        );
    }
}
