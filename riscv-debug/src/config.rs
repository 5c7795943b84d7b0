//! Configuration of the debug core.
//!
//! The configuration is usually deserialized from YAML:
//!
//! ```
//! use riscv_debug::config::{DebugConfig, MemoryAccessMethod};
//!
//! let config = DebugConfig::from_yaml_str(
//!     r#"
//! command_timeout_sec: 2
//! mem_access: [sysbus, progbuf]
//! expose_csrs:
//!   - { start: 0x7c0, end: 0x7c1 }
//!   - { start: 0x7c4, name: myreg }
//! "#,
//! )
//! .unwrap();
//!
//! assert_eq!(config.mem_access, vec![MemoryAccessMethod::Sysbus, MemoryAccessMethod::Progbuf]);
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Ways of reaching target memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryAccessMethod {
    /// Load/store instructions executed from the program buffer.
    Progbuf,
    /// The Debug Module's system bus master.
    Sysbus,
    /// Abstract access-memory commands.
    Abstract,
}

impl MemoryAccessMethod {
    pub(crate) fn index(self) -> usize {
        match self {
            Self::Progbuf => 0,
            Self::Sysbus => 1,
            Self::Abstract => 2,
        }
    }
}

/// Order in which the harts of an SMP group are resumed when they can't be resumed at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResumeOrder {
    /// Ascending target order.
    #[default]
    Normal,
    /// Descending target order.
    Reversed,
}

/// Whether interrupts are masked while single stepping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IsrMaskMode {
    /// Interrupts stay enabled.
    #[default]
    Off,
    /// MIE/HIE/SIE/UIE are cleared for the duration of a step.
    StepOnly,
}

/// An inclusive range of register numbers, optionally named.
///
/// A named range must contain exactly one register.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRange {
    /// First register of the range.
    pub start: u32,
    /// Last register of the range. Defaults to `start`.
    #[serde(default)]
    pub end: Option<u32>,
    /// Name of the register.
    #[serde(default)]
    pub name: Option<String>,
}

impl RegisterRange {
    /// Last register in the range.
    pub fn last(&self) -> u32 {
        self.end.unwrap_or(self.start)
    }

    /// Whether `number` lies within the range.
    pub fn contains(&self, number: u32) -> bool {
        (self.start..=self.last()).contains(&number)
    }
}

/// Error in a [`DebugConfig`].
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum ConfigError {
    /// The configuration could not be parsed
    Parse(#[from] serde_yaml::Error),
    /// At most three memory access methods can be configured, got {0}
    TooManyMemoryAccessMethods(usize),
    /// Memory access method {0:?} is listed twice
    DuplicateMemoryAccessMethod(MemoryAccessMethod),
    /// Range {start:#x}-{end:#x} is empty
    EmptyRange {
        /// Start of the range.
        start: u32,
        /// End of the range.
        end: u32,
    },
    /// Range {start:#x}-{end:#x} is out of bounds (limit {limit:#x})
    RangeOutOfBounds {
        /// Start of the range.
        start: u32,
        /// End of the range.
        end: u32,
        /// Highest register number allowed.
        limit: u32,
    },
    /// Named range {0:#x} must contain a single register
    NamedRangeTooLarge(u32),
}

/// Configuration of the debug core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Timeout for a single DMI level operation, in seconds.
    pub command_timeout_sec: u64,
    /// Timeout for harts to come out of reset, in seconds.
    pub reset_timeout_sec: u64,
    /// Memory access methods, in order of preference.
    pub mem_access: Vec<MemoryAccessMethod>,
    /// Let the hart translate addresses of debugger memory accesses (MPRV).
    pub enable_virtual: bool,
    /// Translate virtual addresses by walking the page tables.
    pub enable_virt2phys: bool,
    /// CSRs to add to the register list.
    pub expose_csrs: Vec<RegisterRange>,
    /// Custom abstract command registers to add to the register list.
    pub expose_custom: Vec<RegisterRange>,
    /// CSRs to hide from the register list.
    pub hide_csrs: Vec<RegisterRange>,
    /// Order used to resume SMP harts.
    pub resume_order: ResumeOrder,
    /// Interrupt masking while stepping.
    pub isr_mask: IsrMaskMode,
    /// Enter debug mode on `ebreak` in M-mode.
    pub ebreakm: bool,
    /// Enter debug mode on `ebreak` in S-mode.
    pub ebreaks: bool,
    /// Enter debug mode on `ebreak` in U-mode.
    pub ebreaku: bool,
    /// Allow equality match triggers as a fallback for ranges.
    pub enable_eq_match_trigger: bool,
    /// Allow NAPOT match triggers.
    pub enable_napot_trigger: bool,
    /// Allow chained GE/LT triggers.
    pub enable_ge_lt_trigger: bool,
    /// Number of successful batches after which adaptive delays are reset.
    ///
    /// `None` keeps the delays for the lifetime of the session.
    pub reset_delays_wait: Option<u32>,
    /// Halt harts coming out of reset.
    pub reset_halt: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            command_timeout_sec: 5,
            reset_timeout_sec: 30,
            mem_access: vec![
                MemoryAccessMethod::Progbuf,
                MemoryAccessMethod::Sysbus,
                MemoryAccessMethod::Abstract,
            ],
            enable_virtual: false,
            enable_virt2phys: true,
            expose_csrs: Vec::new(),
            expose_custom: Vec::new(),
            hide_csrs: Vec::new(),
            resume_order: ResumeOrder::Normal,
            isr_mask: IsrMaskMode::Off,
            ebreakm: true,
            ebreaks: true,
            ebreaku: true,
            enable_eq_match_trigger: true,
            enable_napot_trigger: true,
            enable_ge_lt_trigger: true,
            reset_delays_wait: None,
            reset_halt: false,
        }
    }
}

impl DebugConfig {
    /// Parse and validate a YAML configuration.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for inconsistencies.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mem_access.len() > 3 {
            return Err(ConfigError::TooManyMemoryAccessMethods(
                self.mem_access.len(),
            ));
        }

        for (i, method) in self.mem_access.iter().enumerate() {
            if self.mem_access[..i].contains(method) {
                return Err(ConfigError::DuplicateMemoryAccessMethod(*method));
            }
        }

        for range in self.expose_csrs.iter().chain(self.hide_csrs.iter()) {
            validate_range(range, 4095)?;
        }
        for range in &self.expose_custom {
            validate_range(range, 0x3fff)?;
        }

        Ok(())
    }

    /// Timeout of a single DMI level operation.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_sec)
    }

    /// Timeout for harts to come out of reset.
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_timeout_sec)
    }

    /// Memory access methods to try, in order.
    ///
    /// An empty list means the default order.
    pub fn memory_access_order(&self) -> Vec<MemoryAccessMethod> {
        if self.mem_access.is_empty() {
            Self::default().mem_access
        } else {
            self.mem_access.clone()
        }
    }

    /// Whether CSR `number` is hidden.
    ///
    /// When `expose_csrs` and `hide_csrs` overlap, hiding wins because it is applied last.
    pub fn is_csr_hidden(&self, number: u32) -> bool {
        self.hide_csrs.iter().any(|range| range.contains(number))
    }
}

fn validate_range(range: &RegisterRange, limit: u32) -> Result<(), ConfigError> {
    let end = range.last();
    if end < range.start {
        return Err(ConfigError::EmptyRange {
            start: range.start,
            end,
        });
    }
    if end > limit {
        return Err(ConfigError::RangeOutOfBounds {
            start: range.start,
            end,
            limit,
        });
    }
    if range.name.is_some() && end != range.start {
        return Err(ConfigError::NamedRangeTooLarge(range.start));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults() {
        let config = DebugConfig::default();

        assert_eq!(config.command_timeout(), Duration::from_secs(5));
        assert_eq!(config.reset_timeout(), Duration::from_secs(30));
        assert!(config.enable_virt2phys);
        assert!(!config.enable_virtual);
        assert_eq!(config.isr_mask, IsrMaskMode::Off);
        assert_eq!(config.resume_order, ResumeOrder::Normal);
    }

    #[test]
    fn empty_yaml_gives_defaults() {
        let config = DebugConfig::from_yaml_str("{}").unwrap();

        assert_eq!(config, DebugConfig::default());
    }

    #[test]
    fn parse_full() {
        let config = DebugConfig::from_yaml_str(
            "
resume_order: reversed
isr_mask: step-only
ebreaku: false
enable_napot_trigger: false
hide_csrs:
  - { start: 0x300, end: 0x305 }
",
        )
        .unwrap();

        assert_eq!(config.resume_order, ResumeOrder::Reversed);
        assert_eq!(config.isr_mask, IsrMaskMode::StepOnly);
        assert!(!config.ebreaku);
        assert!(!config.enable_napot_trigger);
        assert!(config.is_csr_hidden(0x303));
        assert!(!config.is_csr_hidden(0x306));
    }

    #[test]
    fn duplicate_method_is_rejected() {
        let result = DebugConfig::from_yaml_str("mem_access: [sysbus, sysbus]");

        assert!(matches!(
            result,
            Err(ConfigError::DuplicateMemoryAccessMethod(
                MemoryAccessMethod::Sysbus
            ))
        ));
    }

    #[test]
    fn named_range_must_be_single() {
        let result =
            DebugConfig::from_yaml_str("expose_csrs: [{ start: 0x7c0, end: 0x7c2, name: foo }]");

        assert!(matches!(result, Err(ConfigError::NamedRangeTooLarge(0x7c0))));
    }

    #[test]
    fn empty_method_list_uses_default_order() {
        let config = DebugConfig {
            mem_access: vec![],
            ..Default::default()
        };

        assert_eq!(
            config.memory_access_order(),
            vec![
                MemoryAccessMethod::Progbuf,
                MemoryAccessMethod::Sysbus,
                MemoryAccessMethod::Abstract
            ]
        );
    }
}
