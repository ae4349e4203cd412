//! dpsync core types: descriptor contract, object states and errors.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

mod error;

pub use error::{ReconcileError, ValidationError};

/// A prerequisite object that must be realized before the declaring object can be.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Dependency {
    pub label: &'static str,
    pub key: String,
}

impl Dependency {
    pub fn new(label: &'static str, key: impl Into<String>) -> Self {
        Self { label, key: key.into() }
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.key, self.label)
    }
}

/// Most objects declare zero, one or two dependencies.
pub type Dependencies = SmallVec<[Dependency; 2]>;

/// Lifecycle state of one config object inside a reconciler.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ObjectState {
    Absent,
    Pending,
    Realized,
}

impl fmt::Display for ObjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ObjectState::Absent => "absent",
            ObjectState::Pending => "pending",
            ObjectState::Realized => "realized",
        };
        f.write_str(s)
    }
}

/// Result of one reconciler step for a single key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub key: String,
    pub from: ObjectState,
    pub to: ObjectState,
    /// Whether the step issued at least one device command.
    pub device_call: bool,
    /// Unmet dependencies when `to` is `Pending`.
    pub missing: Dependencies,
}

impl Transition {
    pub fn new(key: impl Into<String>, from: ObjectState, to: ObjectState, device_call: bool) -> Self {
        Self { key: key.into(), from, to, device_call, missing: Dependencies::new() }
    }

    pub fn noop(key: impl Into<String>, state: ObjectState) -> Self {
        Self::new(key, state, state, false)
    }

    pub fn with_missing(mut self, missing: Dependencies) -> Self {
        self.missing = missing;
        self
    }

    pub fn is_noop(&self) -> bool { self.from == self.to && !self.device_call }
}

/// Contract every configurable object type implements.
///
/// A descriptor is bound to one key prefix and one value type. It owns the
/// device command channel it issues commands on, which is why `create` and
/// `delete` take `&mut self`: the owning reconciler is the only caller, so at
/// most one command is in flight per channel.
pub trait Descriptor: Send + 'static {
    type Value: Clone + fmt::Debug + PartialEq + Send + Sync + 'static;
    /// Opaque data returned by `create` and handed back to `delete`.
    type Metadata: Clone + fmt::Debug + Send + Sync + 'static;

    /// Descriptor name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Prefix shared by every key of this object type.
    fn key_prefix(&self) -> &'static str;

    fn key_selector(&self, key: &str) -> bool { key.starts_with(self.key_prefix()) }

    /// Deterministic key derived from the semantically significant fields.
    fn key_of(&self, value: &Self::Value) -> String;

    fn validate(&self, _key: &str, _value: &Self::Value) -> Result<(), ValidationError> { Ok(()) }

    /// Whether replacing `old` with `new` is a no-op for the device.
    fn equivalent(&self, _key: &str, old: &Self::Value, new: &Self::Value) -> bool { old == new }

    /// Dependencies are a function of the value, not only of the type.
    fn dependencies(&self, _key: &str, _value: &Self::Value) -> Dependencies { Dependencies::new() }

    fn create(&mut self, key: &str, value: &Self::Value) -> anyhow::Result<Self::Metadata>;

    fn delete(&mut self, key: &str, value: &Self::Value, metadata: &Self::Metadata) -> anyhow::Result<()>;

    /// Device-assigned handle embedded in the metadata, if any.
    fn device_index(&self, _metadata: &Self::Metadata) -> Option<u32> { None }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_noop_detection() {
        assert!(Transition::noop("k", ObjectState::Realized).is_noop());
        assert!(!Transition::new("k", ObjectState::Realized, ObjectState::Realized, true).is_noop());
        assert!(!Transition::new("k", ObjectState::Absent, ObjectState::Pending, false).is_noop());
    }

    #[test]
    fn dependency_display_names_key_and_label() {
        let d = Dependency::new("outgoing-interface-exists", "config/interface/memif1");
        assert_eq!(d.to_string(), "config/interface/memif1 (outgoing-interface-exists)");
    }
}
