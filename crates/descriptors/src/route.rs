use anyhow::{Context, Result};
use dpsync_core::{Dependencies, Dependency, Descriptor, ValidationError};
use dpsync_device::Channel;
use dpsync_models::{interface_key, net, Route, ROUTE_PREFIX};

use crate::binapi::{IpRouteAddDel, NO_INDEX};
use crate::IfIndexes;

pub const ROUTE_DESCRIPTOR: &str = "vpp-route";

const OUTGOING_INTERFACE_DEP: &str = "route-outgoing-interface-exists";

/// Interface index the route was installed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteMeta {
    pub sw_if_index: u32,
}

pub struct RouteDescriptor {
    channel: Channel,
    ifs: IfIndexes,
}

impl RouteDescriptor {
    pub fn new(channel: Channel, ifs: IfIndexes) -> Self { Self { channel, ifs } }

    fn request(route: &Route, sw_if_index: u32, is_add: bool) -> IpRouteAddDel {
        IpRouteAddDel {
            is_add,
            vrf_id: route.vrf_id,
            prefix: net::canonical_network(&route.dst_network),
            next_hop: net::canonical_ip(&route.next_hop_addr),
            sw_if_index,
            weight: route.effective_weight(),
        }
    }
}

impl Descriptor for RouteDescriptor {
    type Value = Route;
    type Metadata = RouteMeta;

    fn name(&self) -> &'static str { ROUTE_DESCRIPTOR }
    fn key_prefix(&self) -> &'static str { ROUTE_PREFIX }
    fn key_of(&self, value: &Route) -> String { value.key() }

    fn validate(&self, _key: &str, value: &Route) -> Result<(), ValidationError> { value.validate() }

    fn equivalent(&self, _key: &str, old: &Route, new: &Route) -> bool { old.equivalent(new) }

    fn dependencies(&self, _key: &str, value: &Route) -> Dependencies {
        let mut deps = Dependencies::new();
        if !value.outgoing_interface.trim().is_empty() {
            deps.push(Dependency::new(OUTGOING_INTERFACE_DEP, interface_key(&value.outgoing_interface)));
        }
        deps
    }

    fn create(&mut self, key: &str, value: &Route) -> Result<RouteMeta> {
        let sw_if_index = if value.outgoing_interface.trim().is_empty() {
            NO_INDEX
        } else {
            self.ifs.sw_if_index(&value.outgoing_interface)?
        };
        self.channel
            .send_request(&Self::request(value, sw_if_index, true))
            .with_context(|| format!("failed to add route {}", key))?;
        Ok(RouteMeta { sw_if_index })
    }

    fn delete(&mut self, key: &str, value: &Route, metadata: &RouteMeta) -> Result<()> {
        self.channel
            .send_request(&Self::request(value, metadata.sw_if_index, false))
            .with_context(|| format!("failed to delete route {}", key))?;
        Ok(())
    }
}
