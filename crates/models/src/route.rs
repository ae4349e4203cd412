use dpsync_core::ValidationError;
use serde::{Deserialize, Serialize};

use crate::interface::check_if_name;
use crate::net;

pub const ROUTE_PREFIX: &str = "config/vpp/v2/route/";

/// Key from table, destination and gateway. Addresses are canonicalized so
/// `10.1.0.7/24` and `10.1.0.0/24` name the same route.
pub fn route_key(vrf_id: u32, dst_network: &str, next_hop_addr: &str) -> String {
    format!(
        "{}vrf/{}/dst/{}/gw/{}",
        ROUTE_PREFIX,
        vrf_id,
        net::canonical_network(dst_network),
        net::canonical_ip(next_hop_addr)
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    #[serde(default)]
    pub vrf_id: u32,
    pub dst_network: String,
    pub next_hop_addr: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub outgoing_interface: String,
    #[serde(default)]
    pub weight: u32,
}

impl Route {
    pub fn new(dst_network: impl Into<String>, next_hop_addr: impl Into<String>) -> Self {
        Self { vrf_id: 0, dst_network: dst_network.into(), next_hop_addr: next_hop_addr.into(), outgoing_interface: String::new(), weight: 0 }
    }

    pub fn via(mut self, interface: impl Into<String>) -> Self {
        self.outgoing_interface = interface.into();
        self
    }

    pub fn key(&self) -> String { route_key(self.vrf_id, &self.dst_network, &self.next_hop_addr) }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let (dst, _) = net::parse_prefix(&self.dst_network).map_err(|e| ValidationError::new("dst_network", e))?;
        let nh = net::parse_ip(&self.next_hop_addr).map_err(|e| ValidationError::new("next_hop_addr", e))?;
        if dst.is_ipv4() != nh.is_ipv4() {
            return Err(ValidationError::new("next_hop_addr", "address family differs from dst_network"));
        }
        if !self.outgoing_interface.is_empty() {
            check_if_name("outgoing_interface", &self.outgoing_interface)?;
        }
        Ok(())
    }

    /// Weight 0 is the device default of 1.
    pub fn effective_weight(&self) -> u32 { self.weight.max(1) }

    pub fn equivalent(&self, other: &Route) -> bool {
        self.key() == other.key()
            && self.outgoing_interface.trim() == other.outgoing_interface.trim()
            && self.effective_weight() == other.effective_weight()
    }
}
