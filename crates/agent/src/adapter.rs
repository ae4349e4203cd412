use std::sync::Arc;

use dpsync_core::{Descriptor, ObjectState, ReconcileError, Transition};
use dpsync_idx::RegistryEvent;
use dpsync_models::{ConfigItem, ItemKind, ItemValue};
use dpsync_reconcile::{CascadePolicy, RealizedState, Reconciler, Resolution};
use tokio::sync::broadcast;

/// A reconciler with its value type erased to [`ConfigItem`].
pub trait KindReconciler: Send {
    fn kind(&self) -> ItemKind;
    fn name(&self) -> &'static str;
    /// Whether `key` belongs to this reconciler's object type.
    fn key_selector(&self, key: &str) -> bool;
    fn source(&self) -> Arc<dyn RealizedState>;
    fn add_source(&mut self, source: Arc<dyn RealizedState>);
    fn set_policy(&mut self, policy: CascadePolicy);

    fn validate(&self, item: &ConfigItem) -> Result<(), ReconcileError>;
    /// Tracked value under the item's key is equivalent to `item`.
    fn holds_equivalent(&self, item: &ConfigItem) -> bool;
    fn needs_replace(&self, item: &ConfigItem) -> bool;

    fn put(&mut self, item: ConfigItem) -> Result<Transition, ReconcileError>;
    fn delete_key(&mut self, key: &str) -> Result<Transition, ReconcileError>;
    fn created(&mut self, name: &str) -> Resolution;
    fn deleted(&mut self, name: &str, policy: CascadePolicy) -> Resolution;
    fn reset(&mut self);

    fn state(&self, key: &str) -> ObjectState;
    fn item(&self, key: &str) -> Option<ConfigItem>;
    fn keys(&self) -> Vec<String>;
    fn dependents_of(&self, name: &str) -> Vec<String>;
    fn lookup_index(&self, key: &str) -> Option<u32>;
    fn subscribe(&self) -> broadcast::Receiver<RegistryEvent>;
}

/// Adapter from a typed [`Reconciler`] to [`KindReconciler`].
pub struct Typed<D: Descriptor> {
    inner: Reconciler<D>,
}

impl<D: Descriptor> Typed<D>
where
    D::Value: ItemValue,
{
    pub fn new(inner: Reconciler<D>) -> Self { Self { inner } }

    fn unwrap_item(&self, item: ConfigItem) -> Result<D::Value, ReconcileError> {
        let key = item.key();
        let got = item.kind();
        <D::Value as ItemValue>::from_item(item).ok_or_else(|| {
            ReconcileError::inconsistent(self.inner.kind(), key, format!("{} item routed to {} reconciler", got, <D::Value as ItemValue>::KIND))
        })
    }

    fn as_value(&self, item: &ConfigItem) -> Option<D::Value> {
        if item.kind() != <D::Value as ItemValue>::KIND {
            return None;
        }
        <D::Value as ItemValue>::from_item(item.clone())
    }
}

impl<D: Descriptor> KindReconciler for Typed<D>
where
    D::Value: ItemValue,
{
    fn kind(&self) -> ItemKind { <D::Value as ItemValue>::KIND }
    fn name(&self) -> &'static str { self.inner.kind() }
    fn key_selector(&self, key: &str) -> bool { self.inner.key_selector(key) }
    fn source(&self) -> Arc<dyn RealizedState> { self.inner.source() }
    fn add_source(&mut self, source: Arc<dyn RealizedState>) { self.inner.add_source(source) }
    fn set_policy(&mut self, policy: CascadePolicy) { self.inner.set_policy(policy) }

    fn validate(&self, item: &ConfigItem) -> Result<(), ReconcileError> {
        let value = self.unwrap_item(item.clone())?;
        self.inner.validate(&value)
    }

    fn holds_equivalent(&self, item: &ConfigItem) -> bool {
        self.as_value(item).map(|v| self.inner.holds_equivalent(&v)).unwrap_or(false)
    }

    fn needs_replace(&self, item: &ConfigItem) -> bool {
        self.as_value(item).map(|v| self.inner.needs_replace(&v)).unwrap_or(false)
    }

    fn put(&mut self, item: ConfigItem) -> Result<Transition, ReconcileError> {
        let value = self.unwrap_item(item)?;
        self.inner.add(value)
    }

    fn delete_key(&mut self, key: &str) -> Result<Transition, ReconcileError> { self.inner.delete_key(key) }
    fn created(&mut self, name: &str) -> Resolution { self.inner.resolve_created_dependency(name) }
    fn deleted(&mut self, name: &str, policy: CascadePolicy) -> Resolution { self.inner.resolve_deleted_dependency_as(name, policy) }
    fn reset(&mut self) { self.inner.reset() }

    fn state(&self, key: &str) -> ObjectState { self.inner.state(key) }
    fn item(&self, key: &str) -> Option<ConfigItem> { self.inner.value(key).cloned().map(Into::into) }
    fn keys(&self) -> Vec<String> { self.inner.keys() }
    fn dependents_of(&self, name: &str) -> Vec<String> { self.inner.dependents_of(name) }
    fn lookup_index(&self, key: &str) -> Option<u32> { self.inner.lookup_index(key) }
    fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> { self.inner.registry().subscribe() }
}
