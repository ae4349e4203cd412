use dpsync_core::ValidationError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::net;

pub const INTERFACE_PREFIX: &str = "config/vpp/v2/interfaces/";

const MTU_MIN: u32 = 64;
const MTU_MAX: u32 = 9216;

static IF_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.:/\-]{0,62}$").expect("static regex"));

pub fn interface_key(name: &str) -> String { format!("{}{}", INTERFACE_PREFIX, name.trim()) }

pub(crate) fn check_if_name(field: &str, name: &str) -> Result<(), ValidationError> {
    if IF_NAME.is_match(name.trim()) {
        Ok(())
    } else {
        Err(ValidationError::new(field, format!("{:?} is not a valid interface name", name)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InterfaceKind {
    Loopback,
    Memif {
        id: u32,
        #[serde(default)]
        master: bool,
        #[serde(default)]
        socket_filename: String,
    },
    Tap {
        #[serde(default)]
        host_if_name: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    pub kind: InterfaceKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_addresses: Vec<String>,
}

fn default_enabled() -> bool { true }

impl Interface {
    pub fn loopback(name: impl Into<String>) -> Self {
        Self { name: name.into(), kind: InterfaceKind::Loopback, enabled: true, mtu: None, ip_addresses: Vec::new() }
    }

    pub fn memif(name: impl Into<String>, id: u32) -> Self {
        Self {
            name: name.into(),
            kind: InterfaceKind::Memif { id, master: false, socket_filename: String::new() },
            enabled: true,
            mtu: None,
            ip_addresses: Vec::new(),
        }
    }

    pub fn with_address(mut self, prefix: impl Into<String>) -> Self {
        self.ip_addresses.push(prefix.into());
        self
    }

    pub fn key(&self) -> String { interface_key(&self.name) }

    pub fn validate(&self) -> Result<(), ValidationError> {
        check_if_name("name", &self.name)?;
        if let Some(mtu) = self.mtu {
            if !(MTU_MIN..=MTU_MAX).contains(&mtu) {
                return Err(ValidationError::new("mtu", format!("{} outside {}..={}", mtu, MTU_MIN, MTU_MAX)));
            }
        }
        for (i, addr) in self.ip_addresses.iter().enumerate() {
            net::parse_prefix(addr).map_err(|e| ValidationError::new(format!("ip_addresses[{}]", i), e))?;
        }
        if let InterfaceKind::Tap { host_if_name } = &self.kind {
            if host_if_name.len() > 15 {
                return Err(ValidationError::new("kind.host_if_name", "longer than 15 characters"));
            }
        }
        Ok(())
    }

    /// Address order and textual form do not matter.
    pub fn equivalent(&self, other: &Interface) -> bool {
        self.name.trim() == other.name.trim()
            && self.kind == other.kind
            && self.enabled == other.enabled
            && self.mtu == other.mtu
            && self.sorted_addresses() == other.sorted_addresses()
    }

    pub fn sorted_addresses(&self) -> Vec<String> {
        let mut out: Vec<String> = self.ip_addresses.iter().map(|a| net::canonical_prefix(a)).collect();
        out.sort();
        out.dedup();
        out
    }
}
