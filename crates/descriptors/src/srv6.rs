use anyhow::{Context, Result};
use dpsync_core::{Dependencies, Dependency, Descriptor, ValidationError};
use dpsync_device::Channel;
use dpsync_models::{interface_key, net, EndFunction, LocalSid, LOCAL_SID_PREFIX};

use crate::binapi::{SrLocalsidAddDel, NO_INDEX};
use crate::IfIndexes;

pub const LOCAL_SID_DESCRIPTOR: &str = "vpp-sr-localsid";

const OUTGOING_INTERFACE_DEP: &str = "sr-localsid-outgoing-interface-exists";
const INCOMING_INTERFACE_DEP: &str = "sr-localsid-incoming-interface-exists";

pub struct LocalSidDescriptor {
    channel: Channel,
    ifs: IfIndexes,
}

impl LocalSidDescriptor {
    pub fn new(channel: Channel, ifs: IfIndexes) -> Self { Self { channel, ifs } }

    fn request(&self, value: &LocalSid) -> Result<SrLocalsidAddDel> {
        let mut req = SrLocalsidAddDel {
            is_del: false,
            localsid: net::canonical_ip(&value.sid),
            fib_table: value.fib_table_id,
            behavior: String::new(),
            end_psp: false,
            sw_if_index: NO_INDEX,
            in_sw_if_index: NO_INDEX,
            vlan_index: 0,
            vrf_id: 0,
            nh_addr: String::new(),
        };
        let ef = value.end_function.as_ref().context("end function must be provided")?;
        req.behavior = ef.type_name().to_string();
        if let Some(out) = ef.outgoing_interface() {
            req.sw_if_index = self.ifs.sw_if_index(out)?;
        }
        if let Some(inc) = ef.incoming_interface() {
            req.in_sw_if_index = self.ifs.sw_if_index(inc)?;
        }
        match ef {
            EndFunction::Base => {}
            EndFunction::EndX { psp, next_hop, .. } => {
                req.end_psp = *psp;
                req.nh_addr = net::canonical_ip(next_hop);
            }
            EndFunction::EndT { psp, vrf_id } => {
                req.end_psp = *psp;
                req.vrf_id = *vrf_id;
            }
            EndFunction::EndDx2 { vlan_tag, next_hop, .. } => {
                req.vlan_index = *vlan_tag;
                req.nh_addr = net::trimmed_lowered(next_hop);
            }
            EndFunction::EndDx4 { next_hop, .. } | EndFunction::EndDx6 { next_hop, .. } => req.nh_addr = net::canonical_ip(next_hop),
            EndFunction::EndDt4 { vrf_id } | EndFunction::EndDt6 { vrf_id } => req.vrf_id = *vrf_id,
            EndFunction::EndAd { service_address, .. } => req.nh_addr = net::canonical_ip(service_address),
            EndFunction::Unknown { type_name, .. } => anyhow::bail!("unsupported end function type {}", type_name),
        }
        Ok(req)
    }
}

impl Descriptor for LocalSidDescriptor {
    type Value = LocalSid;
    type Metadata = ();

    fn name(&self) -> &'static str { LOCAL_SID_DESCRIPTOR }
    fn key_prefix(&self) -> &'static str { LOCAL_SID_PREFIX }
    fn key_of(&self, value: &LocalSid) -> String { value.key() }

    fn validate(&self, _key: &str, value: &LocalSid) -> Result<(), ValidationError> { value.validate() }

    fn equivalent(&self, _key: &str, old: &LocalSid, new: &LocalSid) -> bool { old.equivalent(new) }

    /// Depends on which end function is populated; the dynamic proxy needs both sides.
    fn dependencies(&self, _key: &str, value: &LocalSid) -> Dependencies {
        let mut deps = Dependencies::new();
        if let Some(ef) = &value.end_function {
            if let Some(out) = ef.outgoing_interface() {
                deps.push(Dependency::new(OUTGOING_INTERFACE_DEP, interface_key(out)));
            }
            if let Some(inc) = ef.incoming_interface() {
                deps.push(Dependency::new(INCOMING_INTERFACE_DEP, interface_key(inc)));
            }
        }
        deps
    }

    fn create(&mut self, _key: &str, value: &LocalSid) -> Result<()> {
        let req = self.request(value).with_context(|| format!("failed to add local sid {}", value.sid.trim()))?;
        self.channel.send_request(&req).with_context(|| format!("failed to add local sid {}", req.localsid))?;
        Ok(())
    }

    fn delete(&mut self, _key: &str, value: &LocalSid, _metadata: &()) -> Result<()> {
        let sid = net::canonical_ip(&value.sid);
        let req = SrLocalsidAddDel {
            is_del: true,
            localsid: sid.clone(),
            fib_table: value.fib_table_id,
            behavior: value.end_function.as_ref().map(|e| e.type_name().to_string()).unwrap_or_default(),
            end_psp: false,
            sw_if_index: NO_INDEX,
            in_sw_if_index: NO_INDEX,
            vlan_index: 0,
            vrf_id: 0,
            nh_addr: String::new(),
        };
        self.channel.send_request(&req).with_context(|| format!("failed to delete local sid {}", sid))?;
        Ok(())
    }
}
