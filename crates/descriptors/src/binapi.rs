//! Typed device commands and replies.

use dpsync_device::{Message, Reply, RetvalReply};
use serde::{Deserialize, Serialize};

/// Sentinel for "no interface" in index fields.
pub const NO_INDEX: u32 = u32::MAX;

macro_rules! retval_message {
    ($ty:ident, $name:literal) => {
        impl Message for $ty {
            const NAME: &'static str = $name;
            type Reply = RetvalReply;
        }
    };
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceCreate {
    pub name: String,
    pub if_type: String,
    #[serde(default)]
    pub memif_id: u32,
    #[serde(default)]
    pub memif_master: bool,
    #[serde(default)]
    pub socket_filename: String,
    #[serde(default)]
    pub host_if_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceCreateReply {
    pub retval: i32,
    #[serde(default)]
    pub sw_if_index: u32,
}

impl Reply for InterfaceCreateReply {
    fn retval(&self) -> i32 { self.retval }
}

impl Message for InterfaceCreate {
    const NAME: &'static str = "interface_create";
    type Reply = InterfaceCreateReply;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceDelete {
    pub sw_if_index: u32,
}
retval_message!(InterfaceDelete, "interface_delete");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwInterfaceSetFlags {
    pub sw_if_index: u32,
    pub admin_up: bool,
}
retval_message!(SwInterfaceSetFlags, "sw_interface_set_flags");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwInterfaceSetMtu {
    pub sw_if_index: u32,
    pub mtu: u32,
}
retval_message!(SwInterfaceSetMtu, "sw_interface_set_mtu");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwInterfaceAddDelAddress {
    pub sw_if_index: u32,
    pub is_add: bool,
    pub prefix: String,
}
retval_message!(SwInterfaceAddDelAddress, "sw_interface_add_del_address");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpRouteAddDel {
    pub is_add: bool,
    pub vrf_id: u32,
    pub prefix: String,
    pub next_hop: String,
    pub sw_if_index: u32,
    pub weight: u32,
}
retval_message!(IpRouteAddDel, "ip_route_add_del");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeDomainAddDel {
    pub bd_id: u32,
    pub is_add: bool,
    pub flood: bool,
    pub forward: bool,
    pub learn: bool,
    pub mac_age: u8,
}
retval_message!(BridgeDomainAddDel, "bridge_domain_add_del");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwInterfaceSetL2Bridge {
    pub rx_sw_if_index: u32,
    pub bd_id: u32,
    pub bvi: bool,
    pub enable: bool,
}
retval_message!(SwInterfaceSetL2Bridge, "sw_interface_set_l2_bridge");

/// Local SID add/delete. Interface fields carry [`NO_INDEX`] when unused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SrLocalsidAddDel {
    pub is_del: bool,
    pub localsid: String,
    pub fib_table: u32,
    pub behavior: String,
    #[serde(default)]
    pub end_psp: bool,
    pub sw_if_index: u32,
    #[serde(default = "no_index")]
    pub in_sw_if_index: u32,
    #[serde(default)]
    pub vlan_index: u32,
    #[serde(default)]
    pub vrf_id: u32,
    #[serde(default)]
    pub nh_addr: String,
}
retval_message!(SrLocalsidAddDel, "sr_localsid_add_del");

fn no_index() -> u32 { NO_INDEX }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TmcEnableDisable {
    pub sw_if_index: u32,
    pub mss: u16,
    pub is_enable: bool,
}
retval_message!(TmcEnableDisable, "tmc_enable_disable");
