use anyhow::{Context, Result};
use dpsync_core::{Dependencies, Dependency, Descriptor, ValidationError};
use dpsync_device::Channel;
use dpsync_models::{interface_key, BridgeDomain, BD_PREFIX};
use tracing::warn;

use crate::binapi::{BridgeDomainAddDel, SwInterfaceSetL2Bridge};
use crate::IfIndexes;

pub const BD_DESCRIPTOR: &str = "vpp-bd";

const BD_INTERFACE_DEP: &str = "bridge-domain-interface-exists";

/// Device bridge-domain id and the member indices bound at creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BdMeta {
    pub bd_id: u32,
    pub members: Vec<(u32, bool)>,
}

pub struct BridgeDomainDescriptor {
    channel: Channel,
    ifs: IfIndexes,
    next_bd_id: u32,
}

impl BridgeDomainDescriptor {
    pub fn new(channel: Channel, ifs: IfIndexes) -> Self { Self { channel, ifs, next_bd_id: 0 } }

    fn bd_request(value: &BridgeDomain, bd_id: u32, is_add: bool) -> BridgeDomainAddDel {
        BridgeDomainAddDel {
            bd_id,
            is_add,
            flood: value.flood,
            forward: value.forward,
            learn: value.learn,
            mac_age: u8::try_from(value.mac_age).unwrap_or(u8::MAX),
        }
    }

    fn unbind(&mut self, bd_id: u32, members: &[(u32, bool)]) -> Result<()> {
        for &(rx_sw_if_index, bvi) in members {
            self.channel
                .send_request(&SwInterfaceSetL2Bridge { rx_sw_if_index, bd_id, bvi, enable: false })
                .with_context(|| format!("unbinding sw_if_index {} from bd {}", rx_sw_if_index, bd_id))?;
        }
        Ok(())
    }
}

impl Descriptor for BridgeDomainDescriptor {
    type Value = BridgeDomain;
    type Metadata = BdMeta;

    fn name(&self) -> &'static str { BD_DESCRIPTOR }
    fn key_prefix(&self) -> &'static str { BD_PREFIX }
    fn key_of(&self, value: &BridgeDomain) -> String { value.key() }

    fn validate(&self, _key: &str, value: &BridgeDomain) -> Result<(), ValidationError> { value.validate() }

    fn equivalent(&self, _key: &str, old: &BridgeDomain, new: &BridgeDomain) -> bool { old.equivalent(new) }

    /// Every member interface must exist.
    fn dependencies(&self, _key: &str, value: &BridgeDomain) -> Dependencies {
        value.interfaces.iter().map(|i| Dependency::new(BD_INTERFACE_DEP, interface_key(&i.name))).collect()
    }

    fn create(&mut self, _key: &str, value: &BridgeDomain) -> Result<BdMeta> {
        let name = value.name.trim();
        let members = value
            .interfaces
            .iter()
            .map(|i| self.ifs.sw_if_index(&i.name).map(|idx| (idx, i.bvi)))
            .collect::<Result<Vec<_>>>()?;

        self.next_bd_id += 1;
        let bd_id = self.next_bd_id;
        self.channel
            .send_request(&Self::bd_request(value, bd_id, true))
            .with_context(|| format!("failed to add bridge domain {}", name))?;

        let mut bound = Vec::with_capacity(members.len());
        for &(rx_sw_if_index, bvi) in &members {
            let res = self.channel.send_request(&SwInterfaceSetL2Bridge { rx_sw_if_index, bd_id, bvi, enable: true });
            if let Err(e) = res {
                if let Err(undo) = self.unbind(bd_id, &bound).and_then(|_| {
                    self.channel.send_request(&Self::bd_request(value, bd_id, false)).map(|_| ()).map_err(Into::into)
                }) {
                    warn!(bd = %name, bd_id, error = %undo, "rollback of bridge domain create failed");
                }
                return Err(anyhow::Error::new(e).context(format!("failed to bind sw_if_index {} to bridge domain {}", rx_sw_if_index, name)));
            }
            bound.push((rx_sw_if_index, bvi));
        }
        Ok(BdMeta { bd_id, members: bound })
    }

    fn delete(&mut self, _key: &str, value: &BridgeDomain, metadata: &BdMeta) -> Result<()> {
        let name = value.name.trim();
        self.unbind(metadata.bd_id, &metadata.members).with_context(|| format!("failed to delete bridge domain {}", name))?;
        self.channel
            .send_request(&Self::bd_request(value, metadata.bd_id, false))
            .with_context(|| format!("failed to delete bridge domain {}", name))?;
        Ok(())
    }

    fn device_index(&self, metadata: &BdMeta) -> Option<u32> { Some(metadata.bd_id) }
}
