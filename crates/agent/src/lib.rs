//! dpsync agent: every object type behind one entry point.
//!
//! The agent routes items to their reconciler by key, wires every reconciler's
//! realized set into every other one's resolver, and turns single-type
//! notifications into cross-type cascades: a realization re-drives pending
//! objects everywhere, a removal unwinds dependents (and their dependents)
//! before the prerequisite goes away.
//!
//! Each reconciler sits behind its own mutex and the agent never holds two
//! locks at once, so independent types never block each other.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use dpsync_core::{ObjectState, ReconcileError, Transition};
use dpsync_descriptors::{BridgeDomainDescriptor, IfIndexes, InterfaceDescriptor, LocalSidDescriptor, RouteDescriptor, TmcDescriptor};
use dpsync_device::{ChannelError, Connection};
use dpsync_idx::{NameIndexRegistry, RegistryEvent, RegistryView};
use dpsync_models::{ConfigItem, ItemKind, ItemValue};
use dpsync_reconcile::{CascadePolicy, PrefixSource, RealizedState, Reconciler, Resolution};
use metrics::{counter, histogram};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

mod adapter;
mod config;
pub mod watch;

pub use adapter::{KindReconciler, Typed};
pub use config::AgentConfig;
pub use watch::{spawn_change_loop, AgentEvent, ChangeEvent, LoopHandle};

const EXTERNAL: &str = "external";

/// Everything one agent operation did, including cascades.
#[derive(Debug, Default)]
pub struct Report {
    pub transitions: Vec<Transition>,
    /// Failures of cascaded steps and, for batches, of individual items.
    pub errors: Vec<ReconcileError>,
}

impl Report {
    pub fn push(&mut self, t: Transition) {
        if !t.is_noop() {
            self.transitions.push(t);
        }
    }

    pub fn merge(&mut self, other: Report) {
        self.transitions.extend(other.transitions);
        self.errors.extend(other.errors);
    }

    fn absorb(&mut self, res: Resolution) {
        self.transitions.extend(res.transitions);
        self.errors.extend(res.errors);
    }

    pub fn is_ok(&self) -> bool { self.errors.is_empty() }

    pub fn device_calls(&self) -> usize { self.transitions.iter().filter(|t| t.device_call).count() }

    /// Keys whose last recorded transition ended in `state`.
    pub fn ended_in(&self, state: ObjectState) -> Vec<String> {
        let mut last: FxHashMap<&str, ObjectState> = FxHashMap::default();
        for t in &self.transitions {
            last.insert(t.key.as_str(), t.to);
        }
        let mut out: Vec<String> = last.into_iter().filter(|(_, s)| *s == state).map(|(k, _)| k.to_string()).collect();
        out.sort();
        out
    }

    /// First failure wins; transitions are dropped.
    pub fn into_result(self) -> Result<Vec<Transition>, ReconcileError> {
        match self.errors.into_iter().next() {
            Some(e) => Err(e),
            None => Ok(self.transitions),
        }
    }
}

struct Slot {
    kind: ItemKind,
    name: &'static str,
    rec: Mutex<Box<dyn KindReconciler>>,
}

impl Slot {
    fn lock(&self) -> MutexGuard<'_, Box<dyn KindReconciler>> { self.rec.lock().unwrap_or_else(|p| p.into_inner()) }
}

/// Collects reconcilers and cross-wires their dependency sources.
pub struct AgentBuilder {
    recs: Vec<Box<dyn KindReconciler>>,
    policy: CascadePolicy,
    external: NameIndexRegistry<()>,
}

impl Default for AgentBuilder {
    fn default() -> Self { Self { recs: Vec::new(), policy: CascadePolicy::default(), external: NameIndexRegistry::new(EXTERNAL) } }
}

impl AgentBuilder {
    pub fn new() -> Self { Self::default() }

    /// Prerequisites announced through [`Agent::notify_realized`].
    pub fn external_view(&self) -> RegistryView<()> { self.external.view() }

    pub fn policy(mut self, policy: CascadePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with<D>(mut self, rec: Reconciler<D>) -> Self
    where
        D: dpsync_core::Descriptor,
        D::Value: ItemValue,
    {
        self.recs.push(Box::new(Typed::new(rec)));
        self
    }

    pub fn build(self) -> Agent {
        let external = self.external;
        let mut sources: Vec<Arc<dyn RealizedState>> = self.recs.iter().map(|r| r.source()).collect();
        sources.push(Arc::new(PrefixSource::new("", external.view())));

        let mut slots = Vec::with_capacity(self.recs.len());
        for (i, mut rec) in self.recs.into_iter().enumerate() {
            rec.set_policy(self.policy);
            for (j, src) in sources.iter().enumerate() {
                // Own registry is already a source of its resolver.
                if i != j {
                    rec.add_source(Arc::clone(src));
                }
            }
            slots.push(Slot { kind: rec.kind(), name: rec.name(), rec: Mutex::new(rec) });
        }
        info!(kinds = slots.len(), policy = ?self.policy, "agent assembled");
        Agent { slots, external: Mutex::new(external), policy: self.policy }
    }
}

pub struct Agent {
    slots: Vec<Slot>,
    external: Mutex<NameIndexRegistry<()>>,
    policy: CascadePolicy,
}

impl Agent {
    pub fn builder() -> AgentBuilder { AgentBuilder::new() }

    /// Standard set of object types, each on its own device channel.
    pub fn with_device(conn: &dyn Connection, policy: CascadePolicy) -> Result<Agent, ChannelError> {
        let builder = AgentBuilder::new().policy(policy);
        let ifs = Reconciler::new(InterfaceDescriptor::new(conn.new_channel()?));
        let idx = IfIndexes::new(ifs.view()).with_external(builder.external_view());
        let routes = Reconciler::new(RouteDescriptor::new(conn.new_channel()?, idx.clone()));
        let bds = Reconciler::new(BridgeDomainDescriptor::new(conn.new_channel()?, idx.clone()));
        let sids = Reconciler::new(LocalSidDescriptor::new(conn.new_channel()?, idx.clone()));
        let tmc = Reconciler::new(TmcDescriptor::new(conn.new_channel()?, idx));
        Ok(builder.with(ifs).with(routes).with(bds).with(sids).with(tmc).build())
    }

    pub fn policy(&self) -> CascadePolicy { self.policy }

    pub fn kinds(&self) -> Vec<ItemKind> { self.slots.iter().map(|s| s.kind).collect() }

    fn slot(&self, kind: ItemKind) -> Option<&Slot> { self.slots.iter().find(|s| s.kind == kind) }

    fn slot_for_key(&self, key: &str) -> Result<&Slot, ReconcileError> {
        self.slots
            .iter()
            .find(|s| s.lock().key_selector(key))
            .ok_or_else(|| ReconcileError::inconsistent("agent", key, "no reconciler handles this key"))
    }

    fn external(&self) -> MutexGuard<'_, NameIndexRegistry<()>> { self.external.lock().unwrap_or_else(|p| p.into_inner()) }

    /// Declare `item` desired. Replacing a realized, different value first
    /// unwinds everything that depends on it.
    pub fn put(&self, item: ConfigItem) -> Result<Report, ReconcileError> {
        let started = Instant::now();
        let key = item.key();
        let slot = self
            .slot(item.kind())
            .ok_or_else(|| ReconcileError::inconsistent("agent", key.as_str(), format!("no reconciler for {}", item.kind())))?;
        let mut report = Report::default();

        let replace = {
            let rec = slot.lock();
            rec.validate(&item)?;
            rec.needs_replace(&item)
        };
        if replace {
            debug!(kind = slot.name, key = %key, "replacing realized value");
            let mut visited = FxHashSet::default();
            visited.insert(key.clone());
            // The prerequisite comes right back, so dependents wait for it.
            if !self.unwind_dependents(&key, CascadePolicy::Requeue, &mut report, &mut visited) {
                return Err(Self::cascade_failure(slot.name, &key, report));
            }
        }

        let t = slot.lock().put(item)?;
        let realized = t.to == ObjectState::Realized && t.device_call;
        report.push(t);
        if realized {
            self.propagate_created(key, &mut report);
        }
        counter!("agent_ops_total", 1, "op" => "put");
        histogram!("agent_op_ms", started.elapsed().as_secs_f64() * 1000.0, "op" => "put");
        Ok(report)
    }

    /// Remove `key`, dependents of dependents first.
    pub fn delete(&self, key: &str) -> Result<Report, ReconcileError> {
        let started = Instant::now();
        let slot = self.slot_for_key(key)?;
        let mut report = Report::default();
        let realized = slot.lock().state(key) == ObjectState::Realized;
        // Still satisfied for dependents while an external source reports it.
        let external = self.external().lookup_idx(key).is_some();
        if realized && !external {
            let mut visited = FxHashSet::default();
            visited.insert(key.to_string());
            if !self.unwind_dependents(key, self.policy, &mut report, &mut visited) {
                return Err(Self::cascade_failure(slot.name, key, report));
            }
        }
        let t = slot.lock().delete_key(key)?;
        report.push(t);
        counter!("agent_ops_total", 1, "op" => "delete");
        histogram!("agent_op_ms", started.elapsed().as_secs_f64() * 1000.0, "op" => "delete");
        Ok(report)
    }

    /// Delete `old`, then put `new`. Either side missing is a programming error.
    /// A new value under the same key goes through the replace path of `put`.
    pub fn modify(&self, old: Option<ConfigItem>, new: Option<ConfigItem>) -> Result<Report, ReconcileError> {
        let (old, new) = match (old, new) {
            (Some(o), Some(n)) => (o, n),
            (None, n) => {
                let key = n.map(|i| i.key()).unwrap_or_default();
                return Err(ReconcileError::inconsistent("agent", key, "modify called without the old value"));
            }
            (Some(o), None) => return Err(ReconcileError::inconsistent("agent", o.key(), "modify called without the new value")),
        };
        if old.kind() != new.kind() {
            return Err(ReconcileError::inconsistent("agent", new.key(), format!("modify changes kind {} -> {}", old.kind(), new.kind())));
        }
        let slot = self.slot_for_key(&new.key())?;
        {
            let rec = slot.lock();
            rec.validate(&new)?;
            if old.key() == new.key() && rec.holds_equivalent(&new) {
                debug!(kind = slot.name, key = %new.key(), "modify with equivalent value is a no-op");
                return Ok(Report::default());
            }
        }
        if old.key() == new.key() {
            return self.put(new);
        }
        let mut report = self.delete(&old.key())?;
        report.merge(self.put(new)?);
        Ok(report)
    }

    /// Make the desired state exactly `items`: objects not listed are
    /// deleted with cascade, listed ones are put in any order.
    pub fn resync(&self, items: Vec<ConfigItem>) -> Report {
        let started = Instant::now();
        let mut desired: FxHashMap<String, ConfigItem> = FxHashMap::default();
        for item in items {
            desired.insert(item.key(), item);
        }
        let mut report = Report::default();

        let mut stale: Vec<String> = Vec::new();
        for slot in &self.slots {
            stale.extend(slot.lock().keys().into_iter().filter(|k| !desired.contains_key(k)));
        }
        for key in stale {
            match self.delete(&key) {
                Ok(r) => report.merge(r),
                Err(e) => report.errors.push(e),
            }
        }

        let mut keys: Vec<String> = desired.keys().cloned().collect();
        keys.sort();
        for key in keys {
            let Some(item) = desired.remove(&key) else { continue };
            match self.put(item) {
                Ok(r) => report.merge(r),
                Err(e) => report.errors.push(e),
            }
        }
        info!(
            changed = report.transitions.len(),
            errors = report.errors.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "resync done"
        );
        counter!("agent_ops_total", 1, "op" => "resync");
        histogram!("agent_op_ms", started.elapsed().as_secs_f64() * 1000.0, "op" => "resync");
        report
    }

    /// Forget all state without device calls, as after a device restart.
    pub fn reset(&self) {
        for slot in &self.slots {
            slot.lock().reset();
        }
        self.external().clear();
        info!("agent state reset");
    }

    /// A prerequisite outside the engine (e.g. a host link) appeared, with
    /// its device index when it has one.
    pub fn notify_realized(&self, key: &str, index: Option<u32>) -> Result<Report, ReconcileError> {
        {
            let mut ext = self.external();
            let idx = match index {
                Some(i) => i,
                None => ext.allocate_index(),
            };
            ext.register(key, idx, ()).map_err(|e| ReconcileError::inconsistent(EXTERNAL, key, e.to_string()))?;
        }
        let mut report = Report::default();
        self.propagate_created(key.to_string(), &mut report);
        Ok(report)
    }

    /// A prerequisite outside the engine disappeared.
    pub fn notify_removed(&self, key: &str) -> Report {
        let mut report = Report::default();
        let owned = self.slot_for_key(key).map(|s| s.lock().state(key) == ObjectState::Realized).unwrap_or(false);
        if !owned {
            let mut visited = FxHashSet::default();
            visited.insert(key.to_string());
            if !self.unwind_dependents(key, self.policy, &mut report, &mut visited) {
                warn!(key = %key, errors = report.errors.len(), "prerequisite gone but some dependents could not be removed");
            }
        }
        self.external().unregister(key);
        report
    }

    pub fn state(&self, key: &str) -> ObjectState {
        match self.slot_for_key(key) {
            Ok(slot) => slot.lock().state(key),
            Err(_) => ObjectState::Absent,
        }
    }

    pub fn item(&self, key: &str) -> Option<ConfigItem> { self.slot_for_key(key).ok()?.lock().item(key) }

    /// Device index of a realized object, or the allocated index of an
    /// external prerequisite.
    pub fn lookup_index(&self, key: &str) -> Option<u32> {
        if let Some(idx) = self.slot_for_key(key).ok().and_then(|s| s.lock().lookup_index(key)) {
            return Some(idx);
        }
        self.external().lookup_idx(key).map(|(idx, _)| idx)
    }

    pub fn keys(&self, kind: ItemKind) -> Vec<String> { self.slot(kind).map(|s| s.lock().keys()).unwrap_or_default() }

    pub fn subscribe(&self, kind: ItemKind) -> Option<broadcast::Receiver<RegistryEvent>> { self.slot(kind).map(|s| s.lock().subscribe()) }

    /// Re-drive pending objects everywhere until nothing new is realized.
    fn propagate_created(&self, first: String, report: &mut Report) {
        let mut queue = VecDeque::from([first]);
        while let Some(name) = queue.pop_front() {
            for slot in &self.slots {
                let res = slot.lock().created(&name);
                for t in &res.transitions {
                    if t.to == ObjectState::Realized && t.from != ObjectState::Realized {
                        queue.push_back(t.key.clone());
                    }
                }
                for e in &res.errors {
                    warn!(kind = slot.name, key = %e.key(), error = %e, "promotion failed");
                }
                report.absorb(res);
            }
        }
    }

    /// Undo every realized dependent of `name`, deepest first.
    ///
    /// Returns false when some removal was refused; everything above the
    /// refused object is then left in place.
    fn unwind_dependents(&self, name: &str, policy: CascadePolicy, report: &mut Report, visited: &mut FxHashSet<String>) -> bool {
        let mut dependents = Vec::new();
        for slot in &self.slots {
            dependents.extend(slot.lock().dependents_of(name));
        }
        let mut clean = true;
        for dep in dependents {
            if visited.insert(dep.clone()) {
                clean &= self.unwind_dependents(&dep, policy, report, visited);
            }
        }
        if !clean {
            debug!(name = %name, "dependents kept: a deeper removal failed");
            return false;
        }
        for slot in &self.slots {
            let res = slot.lock().deleted(name, policy);
            for e in &res.errors {
                warn!(kind = slot.name, key = %e.key(), error = %e, "cascading removal failed");
            }
            clean &= res.errors.is_empty();
            report.absorb(res);
        }
        clean
    }

    /// First refused cascade step, reported against the object that stays.
    fn cascade_failure(kind: &'static str, key: &str, report: Report) -> ReconcileError {
        counter!("agent_cascade_aborted", 1, "kind" => kind);
        report
            .errors
            .into_iter()
            .next()
            .unwrap_or_else(|| ReconcileError::inconsistent(kind, key, "dependent removal failed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dpsync_models::{Interface, Route};

    #[test]
    fn report_tracks_last_state_per_key() {
        let mut r = Report::default();
        r.push(Transition::new("a", ObjectState::Absent, ObjectState::Pending, false));
        r.push(Transition::new("a", ObjectState::Pending, ObjectState::Realized, true));
        r.push(Transition::noop("b", ObjectState::Realized));
        assert_eq!(r.transitions.len(), 2);
        assert_eq!(r.ended_in(ObjectState::Realized), vec!["a".to_string()]);
        assert_eq!(r.device_calls(), 1);
    }

    #[test]
    fn unknown_key_is_inconsistent() {
        let agent = AgentBuilder::new().build();
        assert!(matches!(agent.delete("config/other/x"), Err(ReconcileError::Inconsistent { .. })));
        assert_eq!(agent.state("config/other/x"), ObjectState::Absent);
    }

    #[test]
    fn kind_without_reconciler_is_rejected() {
        let agent = AgentBuilder::new().build();
        let e = agent.put(Route::new("10.0.0.0/8", "10.0.0.1").into()).unwrap_err();
        assert!(e.to_string().contains("no reconciler"), "{}", e);
        assert!(agent.put(Interface::loopback("x").into()).is_err());
    }
}
