//! dpsync descriptors: one `Descriptor` per dataplane object type.
//!
//! Each descriptor owns its own device channel. Types that reference
//! interfaces hold a read view of the interface registry to translate
//! names into device indices at command time.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Result};
use dpsync_idx::RegistryView;
use dpsync_models::interface_key;

pub mod binapi;
mod interface;
mod l2;
mod route;
pub mod sim;
mod srv6;
mod tmc;

pub use interface::{InterfaceDescriptor, InterfaceMeta, INTERFACE_DESCRIPTOR};
pub use l2::{BdMeta, BridgeDomainDescriptor, BD_DESCRIPTOR};
pub use route::{RouteDescriptor, RouteMeta, ROUTE_DESCRIPTOR};
pub use sim::SimDevice;
pub use srv6::{LocalSidDescriptor, LOCAL_SID_DESCRIPTOR};
pub use tmc::{TmcDescriptor, TmcMeta, TMC_DESCRIPTOR};

/// Name-to-`sw_if_index` translation over the interface registry, falling
/// back to interfaces announced from outside the engine.
#[derive(Clone)]
pub struct IfIndexes {
    view: RegistryView<InterfaceMeta>,
    external: Option<RegistryView<()>>,
}

impl IfIndexes {
    pub fn new(view: RegistryView<InterfaceMeta>) -> Self { Self { view, external: None } }

    pub fn with_external(mut self, external: RegistryView<()>) -> Self {
        self.external = Some(external);
        self
    }

    pub fn sw_if_index(&self, name: &str) -> Result<u32> {
        let key = interface_key(name);
        self.view
            .lookup_idx(&key)
            .map(|(idx, _)| idx)
            .or_else(|| self.external.as_ref().and_then(|v| v.lookup_idx(&key)).map(|(idx, _)| idx))
            .ok_or_else(|| anyhow!("interface {} is not configured", name.trim()))
    }
}
