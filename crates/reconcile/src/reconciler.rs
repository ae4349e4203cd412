use std::str::FromStr;
use std::sync::Arc;

use dpsync_core::{Dependencies, Descriptor, ObjectState, ReconcileError, Transition};
use dpsync_idx::{NameIndexRegistry, RegistryView};
use metrics::counter;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::resolver::{DependencyResolver, PrefixSource, Readiness, RealizedState};

/// What happens to dependents when one of their prerequisites disappears.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CascadePolicy {
    /// Undo realized dependents and forget them; drop pending dependents too.
    #[default]
    Drop,
    /// Undo realized dependents on the device and keep them pending.
    Requeue,
}

impl FromStr for CascadePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "requeue" => Ok(CascadePolicy::Requeue),
            "drop" => Ok(CascadePolicy::Drop),
            other => Err(format!("unknown cascade policy: {} (expect requeue|drop)", other)),
        }
    }
}

/// Transitions and failures produced by a notification pass.
#[derive(Debug, Default)]
pub struct Resolution {
    pub transitions: Vec<Transition>,
    pub errors: Vec<ReconcileError>,
}

impl Resolution {
    pub fn is_empty(&self) -> bool { self.transitions.is_empty() && self.errors.is_empty() }

    pub fn merge(&mut self, other: Resolution) {
        self.transitions.extend(other.transitions);
        self.errors.extend(other.errors);
    }

    /// Keys that reached `state` during this pass.
    pub fn keys_now(&self, state: ObjectState) -> Vec<String> {
        self.transitions.iter().filter(|t| t.to == state && t.from != state).map(|t| t.key.clone()).collect()
    }
}

#[derive(Debug, Clone)]
enum Status {
    Pending { missing: Dependencies },
    Realized,
}

#[derive(Debug, Clone)]
struct Tracked<V> {
    value: V,
    deps: Dependencies,
    status: Status,
}

impl<V> Tracked<V> {
    fn state(&self) -> ObjectState {
        match self.status {
            Status::Pending { .. } => ObjectState::Pending,
            Status::Realized => ObjectState::Realized,
        }
    }

    fn depends_on(&self, key: &str) -> bool { self.deps.iter().any(|d| d.key == key) }
}

/// Drives add/delete/modify of one object type through its descriptor.
///
/// Every object is tracked once with an explicit status; the registry holds
/// exactly the realized subset together with the metadata `create` returned.
pub struct Reconciler<D: Descriptor> {
    descriptor: D,
    registry: NameIndexRegistry<D::Metadata>,
    resolver: DependencyResolver,
    objects: FxHashMap<String, Tracked<D::Value>>,
    policy: CascadePolicy,
}

impl<D: Descriptor> Reconciler<D> {
    pub fn new(descriptor: D) -> Self {
        let registry = NameIndexRegistry::new(descriptor.name());
        let mut resolver = DependencyResolver::new();
        resolver.add_source(Arc::new(PrefixSource::new(descriptor.key_prefix(), registry.view())));
        Self { descriptor, registry, resolver, objects: FxHashMap::default(), policy: CascadePolicy::default() }
    }

    pub fn with_policy(mut self, policy: CascadePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn set_policy(&mut self, policy: CascadePolicy) { self.policy = policy; }

    pub fn kind(&self) -> &'static str { self.descriptor.name() }
    pub fn descriptor(&self) -> &D { &self.descriptor }
    pub fn policy(&self) -> CascadePolicy { self.policy }
    pub fn registry(&self) -> &NameIndexRegistry<D::Metadata> { &self.registry }
    pub fn view(&self) -> RegistryView<D::Metadata> { self.registry.view() }

    /// Realized-state predicate other reconcilers resolve dependencies against.
    pub fn source(&self) -> Arc<dyn RealizedState> {
        Arc::new(PrefixSource::new(self.descriptor.key_prefix(), self.registry.view()))
    }

    pub fn add_source(&mut self, source: Arc<dyn RealizedState>) { self.resolver.add_source(source); }

    pub fn state(&self, key: &str) -> ObjectState {
        self.objects.get(key).map(|t| t.state()).unwrap_or(ObjectState::Absent)
    }

    pub fn value(&self, key: &str) -> Option<&D::Value> { self.objects.get(key).map(|t| &t.value) }

    /// Whether the tracked value under `value`'s key is equivalent to it.
    pub fn holds_equivalent(&self, value: &D::Value) -> bool {
        let key = self.descriptor.key_of(value);
        self.objects.get(&key).map(|t| self.descriptor.equivalent(&key, &t.value, value)).unwrap_or(false)
    }

    /// Adding `value` would replace a realized object on the device.
    pub fn needs_replace(&self, value: &D::Value) -> bool {
        let key = self.descriptor.key_of(value);
        self.state(&key) == ObjectState::Realized && !self.holds_equivalent(value)
    }

    pub fn validate(&self, value: &D::Value) -> Result<(), ReconcileError> {
        let key = self.descriptor.key_of(value);
        self.descriptor
            .validate(&key, value)
            .map_err(|source| ReconcileError::Validation { kind: self.kind(), key, source })
    }

    pub fn lookup_index(&self, key: &str) -> Option<u32> { self.registry.lookup_idx(key).map(|(idx, _)| idx) }

    /// Unmet dependencies of a pending object.
    pub fn missing(&self, key: &str) -> Option<&Dependencies> {
        match &self.objects.get(key)?.status {
            Status::Pending { missing } => Some(missing),
            Status::Realized => None,
        }
    }

    pub fn keys(&self) -> Vec<String> {
        let mut out: Vec<String> = self.objects.keys().cloned().collect();
        out.sort();
        out
    }

    pub fn key_selector(&self, key: &str) -> bool { self.descriptor.key_selector(key) }

    /// Realized objects declaring `name` as a dependency.
    pub fn dependents_of(&self, name: &str) -> Vec<String> {
        let mut out: Vec<String> = self
            .objects
            .iter()
            .filter(|(_, t)| matches!(t.status, Status::Realized) && t.depends_on(name))
            .map(|(k, _)| k.clone())
            .collect();
        out.sort();
        out
    }

    /// Declare `value` as desired. Realizes it now or parks it as pending.
    pub fn add(&mut self, value: D::Value) -> Result<Transition, ReconcileError> {
        let kind = self.kind();
        let key = self.descriptor.key_of(&value);
        self.descriptor
            .validate(&key, &value)
            .map_err(|source| ReconcileError::Validation { kind, key: key.clone(), source })?;
        let deps = self.descriptor.dependencies(&key, &value);

        match self.state(&key) {
            ObjectState::Realized => {
                let same = self
                    .objects
                    .get(&key)
                    .map(|t| self.descriptor.equivalent(&key, &t.value, &value))
                    .unwrap_or(false);
                if same {
                    debug!(kind, key = %key, "equivalent value already realized");
                    return Ok(Transition::noop(key, ObjectState::Realized));
                }
                self.unrealize(&key)?;
                self.objects.remove(&key);
                let t = self.place(ObjectState::Realized, key, value, deps)?;
                Ok(Transition { device_call: true, ..t })
            }
            ObjectState::Pending => {
                // Last write wins; no queue of versions.
                self.objects.remove(&key);
                self.place(ObjectState::Pending, key, value, deps)
            }
            ObjectState::Absent => self.place(ObjectState::Absent, key, value, deps),
        }
    }

    pub fn delete(&mut self, value: &D::Value) -> Result<Transition, ReconcileError> {
        let key = self.descriptor.key_of(value);
        self.delete_key(&key)
    }

    /// Remove the object stored under `key`. Absent keys are a no-op.
    pub fn delete_key(&mut self, key: &str) -> Result<Transition, ReconcileError> {
        let kind = self.kind();
        match self.state(key) {
            ObjectState::Absent => {
                debug!(kind, key = %key, "delete of unknown key ignored");
                Ok(Transition::noop(key, ObjectState::Absent))
            }
            ObjectState::Pending => {
                self.objects.remove(key);
                debug!(kind, key = %key, "pending object removed; nothing was applied on the device");
                Ok(Transition::new(key, ObjectState::Pending, ObjectState::Absent, false))
            }
            ObjectState::Realized => {
                self.unrealize(key)?;
                self.objects.remove(key);
                Ok(Transition::new(key, ObjectState::Realized, ObjectState::Absent, true))
            }
        }
    }

    /// Replace `old` with `new` as delete followed by add.
    ///
    /// Either side missing is a programming error. When the delete fails the
    /// add is not attempted.
    pub fn modify(&mut self, old: Option<&D::Value>, new: Option<&D::Value>) -> Result<Vec<Transition>, ReconcileError> {
        let kind = self.kind();
        let (old, new) = match (old, new) {
            (Some(o), Some(n)) => (o, n),
            (None, n) => {
                let key = n.map(|v| self.descriptor.key_of(v)).unwrap_or_default();
                return Err(ReconcileError::inconsistent(kind, key, "modify called without the old value"));
            }
            (Some(o), None) => {
                let key = self.descriptor.key_of(o);
                return Err(ReconcileError::inconsistent(kind, key, "modify called without the new value"));
            }
        };
        let old_key = self.descriptor.key_of(old);
        let new_key = self.descriptor.key_of(new);
        self.descriptor
            .validate(&new_key, new)
            .map_err(|source| ReconcileError::Validation { kind, key: new_key.clone(), source })?;

        if old_key == new_key {
            if let Some(t) = self.objects.get(&new_key) {
                if self.descriptor.equivalent(&new_key, &t.value, new) {
                    debug!(kind, key = %new_key, "modify with equivalent value is a no-op");
                    return Ok(vec![Transition::noop(new_key.clone(), t.state())]);
                }
            }
        }

        let removed = self.delete_key(&old_key)?;
        let added = self.add(new.clone())?;
        info!(kind, old = %old_key, new = %new_key, "modified");
        Ok(vec![removed, added])
    }

    /// `name` was realized: promote pending objects that were waiting for it.
    pub fn resolve_created_dependency(&mut self, name: &str) -> Resolution {
        let mut out = Resolution::default();
        let mut waiting: Vec<String> = self
            .objects
            .iter()
            .filter(|(_, t)| matches!(t.status, Status::Pending { .. }) && t.depends_on(name))
            .map(|(k, _)| k.clone())
            .collect();
        waiting.sort();
        for key in waiting {
            let Some(t) = self.objects.remove(&key) else { continue };
            match self.place(ObjectState::Pending, key, t.value, t.deps) {
                Ok(tr) if tr.is_noop() => {}
                Ok(tr) => out.transitions.push(tr),
                Err(e) => {
                    warn!(kind = self.kind(), key = %e.key(), error = %e, "retry after dependency creation failed");
                    out.errors.push(e);
                }
            }
        }
        out
    }

    /// `name` is going away: undo every realized object depending on it.
    pub fn resolve_deleted_dependency(&mut self, name: &str) -> Resolution {
        let policy = self.policy;
        self.resolve_deleted_dependency_as(name, policy)
    }

    /// Same as [`Self::resolve_deleted_dependency`] with an explicit policy,
    /// e.g. `Requeue` while a prerequisite is only being replaced.
    pub fn resolve_deleted_dependency_as(&mut self, name: &str, policy: CascadePolicy) -> Resolution {
        let kind = self.kind();
        let mut out = Resolution::default();
        let mut affected: Vec<String> = self.objects.iter().filter(|(_, t)| t.depends_on(name)).map(|(k, _)| k.clone()).collect();
        affected.sort();
        for key in affected {
            let Some(state) = self.objects.get(&key).map(|t| t.state()) else { continue };
            if state == ObjectState::Realized {
                if let Err(e) = self.unrealize(&key) {
                    warn!(kind, key = %key, error = %e, "cascading delete failed");
                    out.errors.push(e);
                    continue;
                }
            }
            match policy {
                CascadePolicy::Drop => {
                    self.objects.remove(&key);
                    out.transitions.push(Transition::new(key, state, ObjectState::Absent, state == ObjectState::Realized));
                }
                CascadePolicy::Requeue => {
                    let Some(t) = self.objects.get_mut(&key) else { continue };
                    let mut missing = match &t.status {
                        Status::Pending { missing } => missing.clone(),
                        Status::Realized => Dependencies::new(),
                    };
                    for dep in t.deps.iter().filter(|d| d.key == name) {
                        if !missing.contains(dep) {
                            missing.push(dep.clone());
                        }
                    }
                    t.status = Status::Pending { missing: missing.clone() };
                    if state == ObjectState::Realized {
                        counter!("reconcile_requeued", 1, "kind" => kind);
                        out.transitions.push(
                            Transition::new(key, ObjectState::Realized, ObjectState::Pending, true).with_missing(missing),
                        );
                    }
                }
            }
        }
        out
    }

    /// Forget every object and registry entry without touching the device.
    pub fn reset(&mut self) {
        debug!(kind = self.kind(), dropped = self.objects.len(), "reset");
        self.objects.clear();
        self.registry.clear();
    }

    fn place(&mut self, prior: ObjectState, key: String, value: D::Value, deps: Dependencies) -> Result<Transition, ReconcileError> {
        let kind = self.kind();
        match self.resolver.readiness(kind, &key, &deps)? {
            Readiness::Blocked(missing) => {
                debug!(kind, key = %key, missing = ?missing.iter().map(|d| d.key.as_str()).collect::<Vec<_>>(), "dependencies unmet; object pending");
                if prior != ObjectState::Pending {
                    counter!("reconcile_pending", 1, "kind" => kind);
                }
                self.objects.insert(key.clone(), Tracked { value, deps, status: Status::Pending { missing: missing.clone() } });
                Ok(Transition::new(key, prior, ObjectState::Pending, false).with_missing(missing))
            }
            Readiness::Ready => match self.realize(&key, &value) {
                Ok(()) => {
                    self.objects.insert(key.clone(), Tracked { value, deps, status: Status::Realized });
                    Ok(Transition::new(key, prior, ObjectState::Realized, true))
                }
                Err(e) => {
                    // Once tracked, a refused create keeps the value for the next retry.
                    if prior != ObjectState::Absent {
                        self.objects.insert(key, Tracked { value, deps, status: Status::Pending { missing: Dependencies::new() } });
                    }
                    Err(e)
                }
            },
        }
    }

    fn realize(&mut self, key: &str, value: &D::Value) -> Result<(), ReconcileError> {
        let kind = self.kind();
        let metadata = match self.descriptor.create(key, value) {
            Ok(m) => m,
            Err(cause) => {
                counter!("reconcile_create_err", 1, "kind" => kind);
                return Err(ReconcileError::Device { kind, key: key.to_string(), cause });
            }
        };
        let index = match self.descriptor.device_index(&metadata) {
            Some(i) => i,
            None => self.registry.allocate_index(),
        };
        self.registry
            .register(key, index, metadata)
            .map_err(|e| ReconcileError::inconsistent(kind, key, e.to_string()))?;
        counter!("reconcile_create_ok", 1, "kind" => kind);
        info!(kind, key = %key, index, "realized");
        Ok(())
    }

    fn unrealize(&mut self, key: &str) -> Result<(), ReconcileError> {
        let kind = self.kind();
        let (_, metadata) = self
            .registry
            .lookup_idx(key)
            .ok_or_else(|| ReconcileError::inconsistent(kind, key, "realized object missing from registry"))?;
        let value = match self.objects.get(key) {
            Some(t) => &t.value,
            None => return Err(ReconcileError::inconsistent(kind, key, "registry entry without tracked value")),
        };
        if let Err(cause) = self.descriptor.delete(key, value, &metadata) {
            counter!("reconcile_delete_err", 1, "kind" => kind);
            return Err(ReconcileError::Device { kind, key: key.to_string(), cause });
        }
        self.registry.unregister(key);
        counter!("reconcile_delete_ok", 1, "kind" => kind);
        info!(kind, key = %key, "removed from device");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use dpsync_core::{Dependency, ValidationError};

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        name: String,
        needs: Option<String>,
        payload: u32,
    }

    fn item(name: &str, needs: Option<&str>, payload: u32) -> Item {
        Item { name: name.into(), needs: needs.map(str::to_string), payload }
    }

    #[derive(Default)]
    struct Shared {
        log: Vec<String>,
        fail_create: Option<String>,
        fail_delete: Option<String>,
    }

    struct Scripted(Arc<Mutex<Shared>>);

    impl Descriptor for Scripted {
        type Value = Item;
        type Metadata = u32;

        fn name(&self) -> &'static str { "scripted" }
        fn key_prefix(&self) -> &'static str { "item/" }
        fn key_of(&self, value: &Item) -> String { format!("item/{}", value.name) }

        fn validate(&self, _key: &str, value: &Item) -> Result<(), ValidationError> {
            if value.name.contains(' ') {
                return Err(ValidationError::new("name", "contains whitespace"));
            }
            Ok(())
        }

        fn dependencies(&self, _key: &str, value: &Item) -> Dependencies {
            value.needs.iter().map(|n| Dependency::new("needs", n.clone())).collect()
        }

        fn create(&mut self, key: &str, value: &Item) -> anyhow::Result<u32> {
            let mut s = self.0.lock().unwrap();
            s.log.push(format!("create {}", key));
            if s.fail_create.as_deref() == Some(key) {
                anyhow::bail!("create refused");
            }
            Ok(value.payload)
        }

        fn delete(&mut self, key: &str, _value: &Item, _metadata: &u32) -> anyhow::Result<()> {
            let mut s = self.0.lock().unwrap();
            s.log.push(format!("delete {}", key));
            if s.fail_delete.as_deref() == Some(key) {
                anyhow::bail!("delete refused");
            }
            Ok(())
        }
    }

    fn setup() -> (Reconciler<Scripted>, Arc<Mutex<Shared>>, NameIndexRegistry<()>) {
        let shared = Arc::new(Mutex::new(Shared::default()));
        let ext: NameIndexRegistry<()> = NameIndexRegistry::new("ext");
        let mut r = Reconciler::new(Scripted(Arc::clone(&shared)));
        r.add_source(Arc::new(PrefixSource::new("ext/", ext.view())));
        (r, shared, ext)
    }

    fn log(shared: &Arc<Mutex<Shared>>) -> Vec<String> { shared.lock().unwrap().log.clone() }

    #[test]
    fn add_without_dependencies_realizes() {
        let (mut r, shared, _ext) = setup();
        let t = r.add(item("a", None, 5)).unwrap();
        assert_eq!((t.from, t.to, t.device_call), (ObjectState::Absent, ObjectState::Realized, true));
        assert_eq!(r.registry().lookup_idx("item/a").map(|(_, m)| m), Some(5));
        assert_eq!(log(&shared), vec!["create item/a"]);
    }

    #[test]
    fn unmet_dependency_parks_then_promotes() {
        let (mut r, shared, mut ext) = setup();
        let t = r.add(item("a", Some("ext/x"), 1)).unwrap();
        assert_eq!(t.to, ObjectState::Pending);
        assert_eq!(t.missing.len(), 1);
        assert!(log(&shared).is_empty());
        assert!(r.missing("item/a").is_some());

        ext.register("ext/x", 1, ()).unwrap();
        let res = r.resolve_created_dependency("ext/x");
        assert!(res.errors.is_empty());
        assert_eq!(res.keys_now(ObjectState::Realized), vec!["item/a".to_string()]);
        assert_eq!(r.state("item/a"), ObjectState::Realized);
    }

    #[test]
    fn equivalent_readd_is_noop() {
        let (mut r, shared, _ext) = setup();
        r.add(item("a", None, 1)).unwrap();
        let t = r.add(item("a", None, 1)).unwrap();
        assert!(t.is_noop());
        assert_eq!(log(&shared).len(), 1);
    }

    #[test]
    fn changed_readd_replaces_on_device() {
        let (mut r, shared, _ext) = setup();
        r.add(item("a", None, 1)).unwrap();
        let t = r.add(item("a", None, 2)).unwrap();
        assert_eq!((t.from, t.to, t.device_call), (ObjectState::Realized, ObjectState::Realized, true));
        assert_eq!(log(&shared), vec!["create item/a", "delete item/a", "create item/a"]);
        assert_eq!(r.value("item/a").map(|v| v.payload), Some(2));
    }

    #[test]
    fn delete_pending_and_absent_skip_device() {
        let (mut r, shared, _ext) = setup();
        r.add(item("a", Some("ext/x"), 1)).unwrap();
        let t = r.delete_key("item/a").unwrap();
        assert_eq!((t.from, t.to, t.device_call), (ObjectState::Pending, ObjectState::Absent, false));
        assert!(r.delete_key("item/a").unwrap().is_noop());
        assert!(log(&shared).is_empty());
    }

    #[test]
    fn modify_requires_both_sides() {
        let (mut r, _shared, _ext) = setup();
        let e = r.modify(None, Some(&item("a", None, 1))).unwrap_err();
        assert!(matches!(e, ReconcileError::Inconsistent { .. }));
        let e = r.modify(Some(&item("a", None, 1)), None).unwrap_err();
        assert!(matches!(e, ReconcileError::Inconsistent { .. }));
    }

    #[test]
    fn modify_skips_add_when_delete_fails() {
        let (mut r, shared, _ext) = setup();
        r.add(item("a", None, 1)).unwrap();
        shared.lock().unwrap().fail_delete = Some("item/a".into());
        let e = r.modify(Some(&item("a", None, 1)), Some(&item("b", None, 1))).unwrap_err();
        assert!(matches!(e, ReconcileError::Device { .. }));
        assert_eq!(r.state("item/a"), ObjectState::Realized);
        assert_eq!(r.state("item/b"), ObjectState::Absent);
        assert!(!log(&shared).contains(&"create item/b".to_string()));
    }

    #[test]
    fn modify_equivalent_is_noop() {
        let (mut r, shared, _ext) = setup();
        r.add(item("a", None, 1)).unwrap();
        let ts = r.modify(Some(&item("a", None, 1)), Some(&item("a", None, 1))).unwrap();
        assert_eq!(ts.len(), 1);
        assert!(ts[0].is_noop());
        assert_eq!(log(&shared).len(), 1);
    }

    #[test]
    fn deleted_dependency_requeues_when_asked() {
        let (r, shared, mut ext) = setup();
        let mut r = r.with_policy(CascadePolicy::Requeue);
        ext.register("ext/x", 1, ()).unwrap();
        r.add(item("a", Some("ext/x"), 1)).unwrap();
        assert_eq!(r.dependents_of("ext/x"), vec!["item/a".to_string()]);

        let res = r.resolve_deleted_dependency("ext/x");
        ext.unregister("ext/x");
        assert!(res.errors.is_empty());
        assert_eq!(r.state("item/a"), ObjectState::Pending);
        assert!(r.registry().lookup_idx("item/a").is_none());
        assert_eq!(log(&shared).last().map(String::as_str), Some("delete item/a"));

        ext.register("ext/x", 2, ()).unwrap();
        r.resolve_created_dependency("ext/x");
        assert_eq!(r.state("item/a"), ObjectState::Realized);
    }

    #[test]
    fn deleted_dependency_drops_by_default() {
        let (mut r, _shared, mut ext) = setup();
        assert_eq!(r.policy(), CascadePolicy::Drop);
        ext.register("ext/x", 1, ()).unwrap();
        r.add(item("a", Some("ext/x"), 1)).unwrap();
        r.add(item("b", Some("ext/y"), 1)).unwrap();
        r.resolve_deleted_dependency("ext/x");
        r.resolve_deleted_dependency("ext/y");
        assert_eq!(r.state("item/a"), ObjectState::Absent);
        assert_eq!(r.state("item/b"), ObjectState::Absent);
    }

    #[test]
    fn every_dependent_of_a_removed_prerequisite_is_deleted() {
        let (mut r, shared, mut ext) = setup();
        ext.register("ext/x", 1, ()).unwrap();
        for name in ["c", "a", "b"] {
            r.add(item(name, Some("ext/x"), 1)).unwrap();
        }
        r.add(item("p", Some("ext/y"), 1)).unwrap();
        r.add(item("q", None, 1)).unwrap();

        let res = r.resolve_deleted_dependency("ext/x");
        assert!(res.errors.is_empty());
        let mut gone: Vec<&str> = res.transitions.iter().filter(|t| t.to == ObjectState::Absent).map(|t| t.key.as_str()).collect();
        gone.sort();
        assert_eq!(gone, vec!["item/a", "item/b", "item/c"]);
        assert!(res.transitions.iter().all(|t| t.device_call));
        assert_eq!(r.keys(), vec!["item/p".to_string(), "item/q".to_string()]);
        assert_eq!(log(&shared).iter().filter(|l| l.starts_with("delete")).count(), 3);
    }

    #[test]
    fn refused_delete_of_dependent_keeps_it_realized() {
        let (mut r, shared, mut ext) = setup();
        ext.register("ext/x", 1, ()).unwrap();
        r.add(item("a", Some("ext/x"), 1)).unwrap();
        r.add(item("b", Some("ext/x"), 1)).unwrap();
        shared.lock().unwrap().fail_delete = Some("item/a".into());

        let res = r.resolve_deleted_dependency("ext/x");
        assert_eq!(res.errors.len(), 1);
        assert_eq!(res.errors[0].key(), "item/a");
        assert_eq!(r.state("item/a"), ObjectState::Realized);
        assert!(r.registry().lookup_idx("item/a").is_some());
        assert_eq!(r.state("item/b"), ObjectState::Absent);
    }

    #[test]
    fn refused_replacement_keeps_new_value_tracked() {
        let (mut r, shared, _ext) = setup();
        r.add(item("a", None, 1)).unwrap();
        shared.lock().unwrap().fail_create = Some("item/a".into());
        let e = r.add(item("a", None, 2)).unwrap_err();
        assert!(matches!(e, ReconcileError::Device { .. }));
        assert_eq!(r.state("item/a"), ObjectState::Pending);
        assert_eq!(r.value("item/a").map(|v| v.payload), Some(2));
        assert!(r.registry().is_empty());

        shared.lock().unwrap().fail_create = None;
        let t = r.add(item("a", None, 2)).unwrap();
        assert_eq!((t.from, t.to), (ObjectState::Pending, ObjectState::Realized));
        assert_eq!(r.registry().lookup_idx("item/a").map(|(_, m)| m), Some(2));
    }

    #[test]
    fn create_failure_leaves_object_absent() {
        let (mut r, shared, _ext) = setup();
        shared.lock().unwrap().fail_create = Some("item/a".into());
        let e = r.add(item("a", None, 1)).unwrap_err();
        assert!(e.to_string().contains("create refused"), "e={}", e);
        assert_eq!(r.state("item/a"), ObjectState::Absent);
        assert!(r.registry().is_empty());
    }

    #[test]
    fn invalid_value_never_reaches_device() {
        let (mut r, shared, _ext) = setup();
        let e = r.add(item("bad name", None, 1)).unwrap_err();
        assert_eq!(e.field(), Some("name"));
        assert!(log(&shared).is_empty());
    }

    #[test]
    fn policy_parses_case_insensitively() {
        assert_eq!("Drop".parse::<CascadePolicy>(), Ok(CascadePolicy::Drop));
        assert_eq!("requeue".parse::<CascadePolicy>(), Ok(CascadePolicy::Requeue));
        assert!("later".parse::<CascadePolicy>().is_err());
    }
}
