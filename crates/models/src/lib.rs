//! dpsync models: config object types, deterministic keys and validation.
//!
//! Every type derives its key from semantically significant fields only,
//! with addresses canonicalized and names trimmed, so two values describing
//! the same object always land on the same key.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

mod interface;
mod l2;
pub mod net;
mod route;
mod srv6;
mod tmc;

pub use interface::{interface_key, Interface, InterfaceKind, INTERFACE_PREFIX};
pub use l2::{bridge_domain_key, BdInterface, BridgeDomain, BD_PREFIX};
pub use route::{route_key, Route, ROUTE_PREFIX};
pub use srv6::{local_sid_key, EndFunction, LocalSid, LOCAL_SID_PREFIX};
pub use tmc::{tmc_key, TmcConfig, TMC_PREFIX};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Interface,
    Route,
    BridgeDomain,
    LocalSid,
    Tmc,
}

impl ItemKind {
    pub const ALL: [ItemKind; 5] = [ItemKind::Interface, ItemKind::Route, ItemKind::BridgeDomain, ItemKind::LocalSid, ItemKind::Tmc];

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Interface => "interface",
            ItemKind::Route => "route",
            ItemKind::BridgeDomain => "bridge_domain",
            ItemKind::LocalSid => "local_sid",
            ItemKind::Tmc => "tmc",
        }
    }

    pub fn key_prefix(&self) -> &'static str {
        match self {
            ItemKind::Interface => INTERFACE_PREFIX,
            ItemKind::Route => ROUTE_PREFIX,
            ItemKind::BridgeDomain => BD_PREFIX,
            ItemKind::LocalSid => LOCAL_SID_PREFIX,
            ItemKind::Tmc => TMC_PREFIX,
        }
    }

    /// Kind owning `key`, by prefix.
    pub fn of_key(key: &str) -> Option<ItemKind> { ItemKind::ALL.into_iter().find(|k| key.starts_with(k.key_prefix())) }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Any config object, for heterogeneous batches and desired-state files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum ConfigItem {
    Interface(Interface),
    Route(Route),
    BridgeDomain(BridgeDomain),
    LocalSid(LocalSid),
    Tmc(TmcConfig),
}

impl ConfigItem {
    pub fn kind(&self) -> ItemKind {
        match self {
            ConfigItem::Interface(_) => ItemKind::Interface,
            ConfigItem::Route(_) => ItemKind::Route,
            ConfigItem::BridgeDomain(_) => ItemKind::BridgeDomain,
            ConfigItem::LocalSid(_) => ItemKind::LocalSid,
            ConfigItem::Tmc(_) => ItemKind::Tmc,
        }
    }

    pub fn key(&self) -> String {
        match self {
            ConfigItem::Interface(v) => v.key(),
            ConfigItem::Route(v) => v.key(),
            ConfigItem::BridgeDomain(v) => v.key(),
            ConfigItem::LocalSid(v) => v.key(),
            ConfigItem::Tmc(v) => v.key(),
        }
    }
}

/// A model type that is one [`ConfigItem`] variant.
pub trait ItemValue: Into<ConfigItem> + Sized {
    const KIND: ItemKind;

    fn from_item(item: ConfigItem) -> Option<Self>;
}

macro_rules! item_value {
    ($ty:ident, $variant:ident) => {
        impl From<$ty> for ConfigItem {
            fn from(v: $ty) -> Self { ConfigItem::$variant(v) }
        }

        impl ItemValue for $ty {
            const KIND: ItemKind = ItemKind::$variant;

            fn from_item(item: ConfigItem) -> Option<Self> {
                match item {
                    ConfigItem::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

item_value!(Interface, Interface);
item_value!(Route, Route);
item_value!(BridgeDomain, BridgeDomain);
item_value!(LocalSid, LocalSid);
item_value!(TmcConfig, Tmc);

/// Full desired configuration as read from a file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DesiredState {
    #[serde(default)]
    pub items: Vec<ConfigItem>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_by_key_prefix() {
        let r: ConfigItem = Route::new("10.0.0.0/8", "10.0.0.1").into();
        assert_eq!(ItemKind::of_key(&r.key()), Some(ItemKind::Route));
        assert_eq!(ItemKind::of_key(&interface_key("memif1")), Some(ItemKind::Interface));
        assert_eq!(ItemKind::of_key("config/other/x"), None);
    }

    #[test]
    fn item_value_unwraps_matching_variant_only() {
        let item: ConfigItem = TmcConfig::new("c", "memif1", 1400).into();
        assert_eq!(<TmcConfig as ItemValue>::KIND, ItemKind::Tmc);
        assert!(Route::from_item(item.clone()).is_none());
        assert_eq!(TmcConfig::from_item(item).map(|t| t.mss), Some(1400));
    }

    #[test]
    fn desired_state_from_yaml() {
        let yaml = r#"
items:
  - model: interface
    name: memif1
    kind: { type: memif, id: 1 }
    ip_addresses: ["10.0.0.1/24"]
  - model: route
    dst_network: 10.1.0.0/24
    next_hop_addr: 10.0.0.2
    outgoing_interface: memif1
  - model: local_sid
    sid: "a::1"
    end_function:
      end_ad: { service_address: "10.0.0.9", outgoing_interface: memif1, incoming_interface: loop0 }
  - model: tmc
    interface: memif1
    mss: 1400
"#;
        let ds: DesiredState = serde_yaml::from_str(yaml).unwrap();
        let kinds: Vec<ItemKind> = ds.items.iter().map(|i| i.kind()).collect();
        assert_eq!(kinds, vec![ItemKind::Interface, ItemKind::Route, ItemKind::LocalSid, ItemKind::Tmc]);
        match &ds.items[0] {
            ConfigItem::Interface(i) => {
                assert!(i.enabled);
                assert_eq!(i.kind, InterfaceKind::Memif { id: 1, master: false, socket_filename: String::new() });
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
