use std::collections::BTreeSet;

use dpsync_core::ValidationError;
use serde::{Deserialize, Serialize};

use crate::interface::check_if_name;

pub const BD_PREFIX: &str = "config/vpp/l2/v2/bridge-domain/";

pub fn bridge_domain_key(name: &str) -> String { format!("{}{}", BD_PREFIX, name.trim()) }

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BdInterface {
    pub name: String,
    #[serde(default)]
    pub bvi: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeDomain {
    pub name: String,
    #[serde(default = "yes")]
    pub flood: bool,
    #[serde(default = "yes")]
    pub forward: bool,
    #[serde(default = "yes")]
    pub learn: bool,
    #[serde(default)]
    pub mac_age: u32,
    #[serde(default)]
    pub interfaces: Vec<BdInterface>,
}

fn yes() -> bool { true }

impl BridgeDomain {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), flood: true, forward: true, learn: true, mac_age: 0, interfaces: Vec::new() }
    }

    pub fn with_interface(mut self, name: impl Into<String>, bvi: bool) -> Self {
        self.interfaces.push(BdInterface { name: name.into(), bvi });
        self
    }

    pub fn key(&self) -> String { bridge_domain_key(&self.name) }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::new("name", "must not be empty"));
        }
        if self.mac_age > u32::from(u8::MAX) {
            return Err(ValidationError::new("mac_age", format!("{} exceeds {} minutes", self.mac_age, u8::MAX)));
        }
        let mut seen = BTreeSet::new();
        for (i, itf) in self.interfaces.iter().enumerate() {
            check_if_name(&format!("interfaces[{}].name", i), &itf.name)?;
            if !seen.insert(itf.name.trim()) {
                return Err(ValidationError::new(format!("interfaces[{}].name", i), "listed twice"));
            }
        }
        if self.interfaces.iter().filter(|i| i.bvi).count() > 1 {
            return Err(ValidationError::new("interfaces", "at most one bvi interface allowed"));
        }
        Ok(())
    }

    /// Membership is a set; listing order is incidental.
    pub fn equivalent(&self, other: &BridgeDomain) -> bool {
        let members = |bd: &BridgeDomain| bd.interfaces.iter().map(|i| (i.name.trim().to_string(), i.bvi)).collect::<BTreeSet<_>>();
        self.name.trim() == other.name.trim()
            && self.flood == other.flood
            && self.forward == other.forward
            && self.learn == other.learn
            && self.mac_age == other.mac_age
            && members(self) == members(other)
    }
}
