//! In-process dataplane used by tests and the CLI demo.
//!
//! Behaves like the real device where ordering matters: commands naming an
//! unknown `sw_if_index` fail, and deleting an interface that is still
//! referenced succeeds but is counted as an integrity violation.

use std::sync::{Arc, Mutex, MutexGuard};

use dpsync_device::{Channel, ChannelError, Connection, RawChannel};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::de::DeserializeOwned;
use serde_json::{json, Value as Json};
use tracing::{debug, warn};

use crate::binapi::*;

pub const RETVAL_INVALID_SW_IF_INDEX: i32 = -2;
pub const RETVAL_NO_SUCH_ENTRY: i32 = -6;
pub const RETVAL_ENTRY_EXISTS: i32 = -16;

/// One recorded command.
#[derive(Debug, Clone, PartialEq)]
pub struct SimCall {
    pub message: &'static str,
    pub payload: Json,
}

#[derive(Debug, Default)]
struct SimInterface {
    name: String,
    admin_up: bool,
    mtu: u32,
    addresses: FxHashSet<String>,
}

#[derive(Default)]
struct SimState {
    next_sw_if_index: u32,
    interfaces: FxHashMap<u32, SimInterface>,
    routes: FxHashMap<(u32, String, String), u32>,
    bridge_domains: FxHashMap<u32, FxHashSet<u32>>,
    local_sids: FxHashMap<String, (u32, u32)>,
    tmc: FxHashMap<u32, u16>,
    calls: Vec<SimCall>,
    fail_next: Option<(&'static str, i32)>,
    integrity_violations: u64,
}

impl SimState {
    fn known(&self, sw_if_index: u32) -> bool { sw_if_index == NO_INDEX || self.interfaces.contains_key(&sw_if_index) }

    fn references(&self, sw_if_index: u32) -> usize {
        self.routes.values().filter(|&&i| i == sw_if_index).count()
            + self.bridge_domains.values().filter(|m| m.contains(&sw_if_index)).count()
            + self.local_sids.values().filter(|&&(o, i)| o == sw_if_index || i == sw_if_index).count()
            + usize::from(self.tmc.contains_key(&sw_if_index))
    }

    fn handle(&mut self, message: &'static str, payload: Json) -> Result<Json, ChannelError> {
        match message {
            "interface_create" => {
                let req: InterfaceCreate = decode(message, payload)?;
                if self.interfaces.values().any(|i| i.name == req.name) {
                    return Ok(retval(RETVAL_ENTRY_EXISTS));
                }
                self.next_sw_if_index += 1;
                let sw_if_index = self.next_sw_if_index;
                self.interfaces.insert(sw_if_index, SimInterface { name: req.name, ..Default::default() });
                Ok(json!({ "retval": 0, "sw_if_index": sw_if_index }))
            }
            "interface_delete" => {
                let req: InterfaceDelete = decode(message, payload)?;
                if !self.interfaces.contains_key(&req.sw_if_index) {
                    return Ok(retval(RETVAL_INVALID_SW_IF_INDEX));
                }
                let refs = self.references(req.sw_if_index);
                if refs > 0 {
                    self.integrity_violations += 1;
                    warn!(sw_if_index = req.sw_if_index, refs, "interface deleted while still referenced");
                }
                self.interfaces.remove(&req.sw_if_index);
                Ok(retval(0))
            }
            "sw_interface_set_flags" => {
                let req: SwInterfaceSetFlags = decode(message, payload)?;
                Ok(retval(match self.interfaces.get_mut(&req.sw_if_index) {
                    Some(i) => {
                        i.admin_up = req.admin_up;
                        0
                    }
                    None => RETVAL_INVALID_SW_IF_INDEX,
                }))
            }
            "sw_interface_set_mtu" => {
                let req: SwInterfaceSetMtu = decode(message, payload)?;
                Ok(retval(match self.interfaces.get_mut(&req.sw_if_index) {
                    Some(i) => {
                        i.mtu = req.mtu;
                        0
                    }
                    None => RETVAL_INVALID_SW_IF_INDEX,
                }))
            }
            "sw_interface_add_del_address" => {
                let req: SwInterfaceAddDelAddress = decode(message, payload)?;
                let Some(i) = self.interfaces.get_mut(&req.sw_if_index) else {
                    return Ok(retval(RETVAL_INVALID_SW_IF_INDEX));
                };
                let ok = if req.is_add { i.addresses.insert(req.prefix) } else { i.addresses.remove(&req.prefix) };
                Ok(retval(if ok { 0 } else { RETVAL_NO_SUCH_ENTRY }))
            }
            "ip_route_add_del" => {
                let req: IpRouteAddDel = decode(message, payload)?;
                let key = (req.vrf_id, req.prefix, req.next_hop);
                if req.is_add {
                    if !self.known(req.sw_if_index) {
                        return Ok(retval(RETVAL_INVALID_SW_IF_INDEX));
                    }
                    self.routes.insert(key, req.sw_if_index);
                    Ok(retval(0))
                } else {
                    Ok(retval(if self.routes.remove(&key).is_some() { 0 } else { RETVAL_NO_SUCH_ENTRY }))
                }
            }
            "bridge_domain_add_del" => {
                let req: BridgeDomainAddDel = decode(message, payload)?;
                if req.is_add {
                    if self.bridge_domains.contains_key(&req.bd_id) {
                        return Ok(retval(RETVAL_ENTRY_EXISTS));
                    }
                    self.bridge_domains.insert(req.bd_id, FxHashSet::default());
                    Ok(retval(0))
                } else {
                    Ok(retval(if self.bridge_domains.remove(&req.bd_id).is_some() { 0 } else { RETVAL_NO_SUCH_ENTRY }))
                }
            }
            "sw_interface_set_l2_bridge" => {
                let req: SwInterfaceSetL2Bridge = decode(message, payload)?;
                if !self.interfaces.contains_key(&req.rx_sw_if_index) {
                    return Ok(retval(RETVAL_INVALID_SW_IF_INDEX));
                }
                let Some(members) = self.bridge_domains.get_mut(&req.bd_id) else {
                    return Ok(retval(RETVAL_NO_SUCH_ENTRY));
                };
                if req.enable {
                    members.insert(req.rx_sw_if_index);
                } else {
                    members.remove(&req.rx_sw_if_index);
                }
                Ok(retval(0))
            }
            "sr_localsid_add_del" => {
                let req: SrLocalsidAddDel = decode(message, payload)?;
                if req.is_del {
                    return Ok(retval(if self.local_sids.remove(&req.localsid).is_some() { 0 } else { RETVAL_NO_SUCH_ENTRY }));
                }
                if !self.known(req.sw_if_index) || !self.known(req.in_sw_if_index) {
                    return Ok(retval(RETVAL_INVALID_SW_IF_INDEX));
                }
                if self.local_sids.contains_key(&req.localsid) {
                    return Ok(retval(RETVAL_ENTRY_EXISTS));
                }
                self.local_sids.insert(req.localsid, (req.sw_if_index, req.in_sw_if_index));
                Ok(retval(0))
            }
            "tmc_enable_disable" => {
                let req: TmcEnableDisable = decode(message, payload)?;
                if !self.interfaces.contains_key(&req.sw_if_index) {
                    return Ok(retval(RETVAL_INVALID_SW_IF_INDEX));
                }
                if req.is_enable {
                    self.tmc.insert(req.sw_if_index, req.mss);
                } else {
                    self.tmc.remove(&req.sw_if_index);
                }
                Ok(retval(0))
            }
            other => Err(ChannelError::Transport(format!("unsupported message {}", other))),
        }
    }
}

fn retval(code: i32) -> Json { json!({ "retval": code }) }

fn decode<T: DeserializeOwned>(message: &'static str, payload: Json) -> Result<T, ChannelError> {
    serde_json::from_value(payload).map_err(|source| ChannelError::Codec { message, source })
}

/// Cheap to clone; every clone and every channel share one device.
#[derive(Clone, Default)]
pub struct SimDevice {
    state: Arc<Mutex<SimState>>,
}

impl SimDevice {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, SimState> { self.state.lock().unwrap_or_else(|p| p.into_inner()) }

    /// Make the next `message` call fail with `retval`, once.
    pub fn fail_next(&self, message: &'static str, retval: i32) { self.lock().fail_next = Some((message, retval)); }

    pub fn calls(&self) -> Vec<SimCall> { self.lock().calls.clone() }

    pub fn call_names(&self) -> Vec<&'static str> { self.lock().calls.iter().map(|c| c.message).collect() }

    pub fn count(&self, message: &str) -> usize { self.lock().calls.iter().filter(|c| c.message == message).count() }

    pub fn clear_calls(&self) { self.lock().calls.clear(); }

    pub fn integrity_violations(&self) -> u64 { self.lock().integrity_violations }

    pub fn interface_count(&self) -> usize { self.lock().interfaces.len() }
    pub fn route_count(&self) -> usize { self.lock().routes.len() }
    pub fn bridge_domain_count(&self) -> usize { self.lock().bridge_domains.len() }
    pub fn local_sid_count(&self) -> usize { self.lock().local_sids.len() }

    pub fn sw_if_index_of(&self, name: &str) -> Option<u32> {
        self.lock().interfaces.iter().find(|(_, i)| i.name == name).map(|(idx, _)| *idx)
    }

    pub fn is_admin_up(&self, sw_if_index: u32) -> bool { self.lock().interfaces.get(&sw_if_index).map(|i| i.admin_up).unwrap_or(false) }

    pub fn interface_mtu(&self, sw_if_index: u32) -> Option<u32> { self.lock().interfaces.get(&sw_if_index).map(|i| i.mtu) }

    pub fn has_address(&self, sw_if_index: u32, prefix: &str) -> bool {
        self.lock().interfaces.get(&sw_if_index).map(|i| i.addresses.contains(prefix)).unwrap_or(false)
    }

    pub fn tmc_mss(&self, sw_if_index: u32) -> Option<u16> { self.lock().tmc.get(&sw_if_index).copied() }

    /// Wipe all dataplane state as a device restart would; the call log and
    /// index counter survive.
    pub fn restart(&self) {
        let mut s = self.lock();
        s.interfaces.clear();
        s.routes.clear();
        s.bridge_domains.clear();
        s.local_sids.clear();
        s.tmc.clear();
        debug!("simulated device restarted");
    }
}

impl Connection for SimDevice {
    fn new_channel(&self) -> Result<Channel, ChannelError> { Ok(Channel::new(SimChannel { device: self.clone() })) }
}

struct SimChannel {
    device: SimDevice,
}

impl RawChannel for SimChannel {
    fn call(&mut self, message: &'static str, payload: Json) -> Result<Json, ChannelError> {
        let mut s = self.device.lock();
        s.calls.push(SimCall { message, payload: payload.clone() });
        if let Some((m, code)) = s.fail_next {
            if m == message {
                s.fail_next = None;
                debug!(message, retval = code, "injected failure");
                return Ok(retval(code));
            }
        }
        s.handle(message, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create(ch: &mut Channel, name: &str) -> u32 {
        let req = InterfaceCreate {
            name: name.into(),
            if_type: "loopback".into(),
            memif_id: 0,
            memif_master: false,
            socket_filename: String::new(),
            host_if_name: String::new(),
        };
        ch.send_request(&req).unwrap().sw_if_index
    }

    #[test]
    fn indices_are_monotonic() {
        let dev = SimDevice::new();
        let mut ch = dev.new_channel().unwrap();
        let a = create(&mut ch, "loop0");
        ch.send_request(&InterfaceDelete { sw_if_index: a }).unwrap();
        let b = create(&mut ch, "loop0");
        assert!(b > a);
    }

    #[test]
    fn unknown_interface_is_rejected() {
        let dev = SimDevice::new();
        let mut ch = dev.new_channel().unwrap();
        let e = ch.send_request(&TmcEnableDisable { sw_if_index: 42, mss: 1400, is_enable: true }).unwrap_err();
        assert_eq!(e.to_string(), "tmc_enable_disable returned -2");
    }

    #[test]
    fn deleting_referenced_interface_counts_violation() {
        let dev = SimDevice::new();
        let mut ch = dev.new_channel().unwrap();
        let idx = create(&mut ch, "memif1");
        ch.send_request(&TmcEnableDisable { sw_if_index: idx, mss: 1400, is_enable: true }).unwrap();
        ch.send_request(&InterfaceDelete { sw_if_index: idx }).unwrap();
        assert_eq!(dev.integrity_violations(), 1);
    }

    #[test]
    fn injected_failure_fires_once() {
        let dev = SimDevice::new();
        let mut ch = dev.new_channel().unwrap();
        dev.fail_next("interface_create", -1);
        let req = InterfaceCreate {
            name: "loop0".into(),
            if_type: "loopback".into(),
            memif_id: 0,
            memif_master: false,
            socket_filename: String::new(),
            host_if_name: String::new(),
        };
        assert!(ch.send_request(&req).is_err());
        assert!(ch.send_request(&req).is_ok());
        assert_eq!(dev.count("interface_create"), 2);
    }
}
