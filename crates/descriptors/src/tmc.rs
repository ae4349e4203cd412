use anyhow::{Context, Result};
use dpsync_core::{Dependencies, Dependency, Descriptor, ValidationError};
use dpsync_device::Channel;
use dpsync_models::{interface_key, TmcConfig, TMC_PREFIX};
use tracing::info;

use crate::binapi::TmcEnableDisable;
use crate::IfIndexes;

pub const TMC_DESCRIPTOR: &str = "vpp-tmc";

const TMC_INTERFACE_DEP: &str = "tmc-interface-exists";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TmcMeta {
    pub sw_if_index: u32,
}

pub struct TmcDescriptor {
    channel: Channel,
    ifs: IfIndexes,
}

impl TmcDescriptor {
    pub fn new(channel: Channel, ifs: IfIndexes) -> Self { Self { channel, ifs } }
}

impl Descriptor for TmcDescriptor {
    type Value = TmcConfig;
    type Metadata = TmcMeta;

    fn name(&self) -> &'static str { TMC_DESCRIPTOR }
    fn key_prefix(&self) -> &'static str { TMC_PREFIX }
    fn key_of(&self, value: &TmcConfig) -> String { value.key() }

    fn validate(&self, _key: &str, value: &TmcConfig) -> Result<(), ValidationError> { value.validate() }

    fn equivalent(&self, _key: &str, old: &TmcConfig, new: &TmcConfig) -> bool { old.equivalent(new) }

    fn dependencies(&self, _key: &str, value: &TmcConfig) -> Dependencies {
        let mut deps = Dependencies::new();
        deps.push(Dependency::new(TMC_INTERFACE_DEP, interface_key(&value.interface)));
        deps
    }

    fn create(&mut self, _key: &str, value: &TmcConfig) -> Result<TmcMeta> {
        let sw_if_index = self.ifs.sw_if_index(&value.interface)?;
        self.channel
            .send_request(&TmcEnableDisable { sw_if_index, mss: value.mss, is_enable: value.enabled })
            .with_context(|| format!("failed to add tmc config {}", value.name))?;
        info!(config = %value.name, sw_if_index, mss = value.mss, "tmc config configured");
        Ok(TmcMeta { sw_if_index })
    }

    fn delete(&mut self, _key: &str, value: &TmcConfig, metadata: &TmcMeta) -> Result<()> {
        self.channel
            .send_request(&TmcEnableDisable { sw_if_index: metadata.sw_if_index, mss: value.mss, is_enable: false })
            .with_context(|| format!("failed to delete tmc config {}", value.name))?;
        Ok(())
    }
}
