use dpsync_core::ValidationError;
use serde::{Deserialize, Serialize};

use crate::interface::check_if_name;

pub const TMC_PREFIX: &str = "config/vpp/v2/tmc/";

const MSS_MIN: u16 = 536;

/// One clamping config per interface, so the interface names the key.
pub fn tmc_key(interface: &str) -> String { format!("{}{}", TMC_PREFIX, interface.trim()) }

/// TCP MSS clamping toggle for one interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TmcConfig {
    #[serde(default)]
    pub name: String,
    pub interface: String,
    pub mss: u16,
    #[serde(default = "enabled")]
    pub enabled: bool,
}

fn enabled() -> bool { true }

impl TmcConfig {
    pub fn new(name: impl Into<String>, interface: impl Into<String>, mss: u16) -> Self {
        Self { name: name.into(), interface: interface.into(), mss, enabled: true }
    }

    pub fn key(&self) -> String { tmc_key(&self.interface) }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.interface.trim().is_empty() {
            return Err(ValidationError::new("interface", "no interface provided"));
        }
        check_if_name("interface", &self.interface)?;
        if self.enabled && self.mss < MSS_MIN {
            return Err(ValidationError::new("mss", format!("{} below minimum {}", self.mss, MSS_MIN)));
        }
        Ok(())
    }

    /// The config name is a label only.
    pub fn equivalent(&self, other: &TmcConfig) -> bool {
        self.interface.trim() == other.interface.trim() && self.mss == other.mss && self.enabled == other.enabled
    }
}
