use std::sync::Arc;

use dpsync_core::{Dependencies, Dependency, ReconcileError};
use dpsync_idx::RegistryView;

/// Read-only predicate over some set of realized objects.
pub trait RealizedState: Send + Sync {
    /// Whether keys like `key` are tracked by this source at all.
    fn handles(&self, key: &str) -> bool;
    fn is_realized(&self, key: &str) -> bool;
}

/// Registry view answering for every key starting with `prefix`.
pub struct PrefixSource<M> {
    prefix: String,
    view: RegistryView<M>,
}

impl<M> PrefixSource<M> {
    pub fn new(prefix: impl Into<String>, view: RegistryView<M>) -> Self {
        Self { prefix: prefix.into(), view }
    }
}

impl<M: Clone + Send + Sync + 'static> RealizedState for PrefixSource<M> {
    fn handles(&self, key: &str) -> bool { key.starts_with(&self.prefix) }
    fn is_realized(&self, key: &str) -> bool { self.view.contains(key) }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Blocked(Dependencies),
}

/// Decides whether every declared dependency is currently realized.
///
/// Holds no state of its own besides the sources it consults.
#[derive(Clone, Default)]
pub struct DependencyResolver {
    sources: Vec<Arc<dyn RealizedState>>,
}

impl DependencyResolver {
    pub fn new() -> Self { Self::default() }

    pub fn add_source(&mut self, source: Arc<dyn RealizedState>) { self.sources.push(source); }

    pub fn is_satisfied(&self, key: &str) -> bool {
        self.sources.iter().any(|s| s.handles(key) && s.is_realized(key))
    }

    /// All-or-nothing readiness of an object declaring `deps`.
    pub fn readiness(&self, kind: &'static str, own_key: &str, deps: &[Dependency]) -> Result<Readiness, ReconcileError> {
        let mut missing = Dependencies::new();
        for dep in deps {
            if dep.key == own_key {
                return Err(ReconcileError::inconsistent(
                    kind,
                    own_key,
                    format!("dependency `{}` names the object itself", dep.label),
                ));
            }
            if !self.is_satisfied(&dep.key) {
                missing.push(dep.clone());
            }
        }
        if missing.is_empty() { Ok(Readiness::Ready) } else { Ok(Readiness::Blocked(missing)) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dpsync_idx::NameIndexRegistry;

    #[test]
    fn ready_only_when_every_dependency_resolves() {
        let mut ifs: NameIndexRegistry<()> = NameIndexRegistry::new("if");
        let mut r = DependencyResolver::new();
        r.add_source(Arc::new(PrefixSource::new("if/", ifs.view())));
        let deps = vec![Dependency::new("in", "if/a"), Dependency::new("out", "if/b")];

        ifs.register("if/a", 1, ()).unwrap();
        match r.readiness("t", "rule/1", &deps).unwrap() {
            Readiness::Blocked(m) => assert_eq!(m.iter().map(|d| d.key.as_str()).collect::<Vec<_>>(), vec!["if/b"]),
            other => panic!("expected blocked, got {:?}", other),
        }
        ifs.register("if/b", 2, ()).unwrap();
        assert_eq!(r.readiness("t", "rule/1", &deps).unwrap(), Readiness::Ready);
    }

    #[test]
    fn unhandled_key_is_unsatisfied() {
        let ifs: NameIndexRegistry<()> = NameIndexRegistry::new("if");
        let mut r = DependencyResolver::new();
        r.add_source(Arc::new(PrefixSource::new("if/", ifs.view())));
        assert!(!r.is_satisfied("bd/x"));
    }

    #[test]
    fn self_dependency_is_inconsistent() {
        let r = DependencyResolver::new();
        let deps = vec![Dependency::new("loop", "rule/1")];
        let e = r.readiness("t", "rule/1", &deps).unwrap_err();
        assert!(matches!(e, ReconcileError::Inconsistent { .. }));
    }
}
