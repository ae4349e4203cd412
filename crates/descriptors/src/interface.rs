use anyhow::{Context, Result};
use dpsync_core::{Descriptor, ValidationError};
use dpsync_device::Channel;
use dpsync_models::{Interface, InterfaceKind, INTERFACE_PREFIX};
use tracing::{debug, warn};

use crate::binapi::{InterfaceCreate, InterfaceDelete, SwInterfaceAddDelAddress, SwInterfaceSetFlags, SwInterfaceSetMtu};

pub const INTERFACE_DESCRIPTOR: &str = "vpp-interface";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceMeta {
    pub sw_if_index: u32,
}

pub struct InterfaceDescriptor {
    channel: Channel,
}

impl InterfaceDescriptor {
    pub fn new(channel: Channel) -> Self { Self { channel } }

    fn configure(&mut self, sw_if_index: u32, value: &Interface) -> Result<()> {
        if let Some(mtu) = value.mtu {
            self.channel.send_request(&SwInterfaceSetMtu { sw_if_index, mtu })?;
        }
        for prefix in value.sorted_addresses() {
            self.channel
                .send_request(&SwInterfaceAddDelAddress { sw_if_index, is_add: true, prefix: prefix.clone() })
                .with_context(|| format!("adding address {}", prefix))?;
        }
        if value.enabled {
            self.channel.send_request(&SwInterfaceSetFlags { sw_if_index, admin_up: true })?;
        }
        Ok(())
    }
}

impl Descriptor for InterfaceDescriptor {
    type Value = Interface;
    type Metadata = InterfaceMeta;

    fn name(&self) -> &'static str { INTERFACE_DESCRIPTOR }
    fn key_prefix(&self) -> &'static str { INTERFACE_PREFIX }
    fn key_of(&self, value: &Interface) -> String { value.key() }

    fn validate(&self, _key: &str, value: &Interface) -> Result<(), ValidationError> { value.validate() }

    fn equivalent(&self, _key: &str, old: &Interface, new: &Interface) -> bool { old.equivalent(new) }

    fn create(&mut self, _key: &str, value: &Interface) -> Result<InterfaceMeta> {
        let name = value.name.trim().to_string();
        let mut req = InterfaceCreate {
            name: name.clone(),
            if_type: String::new(),
            memif_id: 0,
            memif_master: false,
            socket_filename: String::new(),
            host_if_name: String::new(),
        };
        match &value.kind {
            InterfaceKind::Loopback => req.if_type = "loopback".into(),
            InterfaceKind::Memif { id, master, socket_filename } => {
                req.if_type = "memif".into();
                req.memif_id = *id;
                req.memif_master = *master;
                req.socket_filename = socket_filename.clone();
            }
            InterfaceKind::Tap { host_if_name } => {
                req.if_type = "tap".into();
                req.host_if_name = host_if_name.clone();
            }
        }
        let reply = self.channel.send_request(&req).with_context(|| format!("failed to create interface {}", name))?;
        let sw_if_index = reply.sw_if_index;
        debug!(interface = %name, sw_if_index, "interface created");

        if let Err(e) = self.configure(sw_if_index, value) {
            // Do not leave a half-configured interface behind.
            if let Err(undo) = self.channel.send_request(&InterfaceDelete { sw_if_index }) {
                warn!(interface = %name, sw_if_index, error = %undo, "rollback of interface create failed");
            }
            return Err(e.context(format!("failed to configure interface {}", name)));
        }
        Ok(InterfaceMeta { sw_if_index })
    }

    fn delete(&mut self, _key: &str, value: &Interface, metadata: &InterfaceMeta) -> Result<()> {
        self.channel
            .send_request(&InterfaceDelete { sw_if_index: metadata.sw_if_index })
            .with_context(|| format!("failed to delete interface {}", value.name.trim()))?;
        Ok(())
    }

    fn device_index(&self, metadata: &InterfaceMeta) -> Option<u32> { Some(metadata.sw_if_index) }
}
