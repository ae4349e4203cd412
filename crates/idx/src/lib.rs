//! dpsync idx: bidirectional name <-> device index registry.
//!
//! The owning reconciler is the only writer (`&mut self`); every mutation
//! publishes an immutable table through `ArcSwap`, so any number of
//! [`RegistryView`] readers can resolve names concurrently without locking.

#![forbid(unsafe_code)]

use std::sync::Arc;

use arc_swap::ArcSwap;
use rustc_hash::FxHashMap;
use tokio::sync::broadcast;
use tracing::{debug, warn};

const EVENT_CAP: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("registry {0}: cannot register an empty name")]
    EmptyName(String),
}

/// One registered mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry<M> {
    pub name: String,
    pub index: u32,
    pub metadata: M,
    /// Generation number, unique within the registry for its whole lifetime.
    pub seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryEventKind {
    Registered,
    Unregistered,
    Cleared,
}

/// Registration notification; `name` is empty for `Cleared`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEvent {
    pub registry: Arc<str>,
    pub kind: RegistryEventKind,
    pub name: String,
    pub index: u32,
}

struct Table<M> {
    by_name: FxHashMap<String, Entry<M>>,
    by_index: FxHashMap<u32, String>,
}

impl<M> Default for Table<M> {
    fn default() -> Self { Self { by_name: FxHashMap::default(), by_index: FxHashMap::default() } }
}

impl<M: Clone> Clone for Table<M> {
    fn clone(&self) -> Self { Self { by_name: self.by_name.clone(), by_index: self.by_index.clone() } }
}

/// Name-to-index mapping owned by exactly one reconciler.
pub struct NameIndexRegistry<M> {
    title: Arc<str>,
    table: Table<M>,
    published: Arc<ArcSwap<Table<M>>>,
    seq: u64,
    next_auto: u32,
    events: broadcast::Sender<RegistryEvent>,
}

impl<M: Clone> NameIndexRegistry<M> {
    pub fn new(title: impl Into<Arc<str>>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAP);
        Self {
            title: title.into(),
            table: Table::default(),
            published: Arc::new(ArcSwap::from_pointee(Table::default())),
            seq: 0,
            next_auto: 0,
            events,
        }
    }

    pub fn title(&self) -> &str { &self.title }
    pub fn len(&self) -> usize { self.table.by_name.len() }
    pub fn is_empty(&self) -> bool { self.table.by_name.is_empty() }

    /// Insert or replace the mapping for `name`. Returns the generation number.
    pub fn register(&mut self, name: impl Into<String>, index: u32, metadata: M) -> Result<u64, RegistryError> {
        let name = name.into();
        if name.is_empty() {
            return Err(RegistryError::EmptyName(self.title.to_string()));
        }
        self.seq += 1;
        let seq = self.seq;
        if let Some(prev) = self.table.by_name.get(&name) {
            if prev.index != index && self.table.by_index.get(&prev.index) == Some(&name) {
                self.table.by_index.remove(&prev.index);
            }
        }
        if let Some(owner) = self.table.by_index.get(&index) {
            if owner != &name {
                warn!(registry = %self.title, index, old = %owner, new = %name, "index reassigned to a different name");
            }
        }
        self.table.by_index.insert(index, name.clone());
        self.table.by_name.insert(name.clone(), Entry { name: name.clone(), index, metadata, seq });
        debug!(registry = %self.title, name = %name, index, seq, "registered");
        self.publish();
        self.notify(RegistryEventKind::Registered, name, index);
        Ok(seq)
    }

    /// Remove the mapping for `name`; absent names are not an error.
    pub fn unregister(&mut self, name: &str) -> Option<Entry<M>> {
        let entry = self.table.by_name.remove(name)?;
        if self.table.by_index.get(&entry.index).map(|n| n == name).unwrap_or(false) {
            self.table.by_index.remove(&entry.index);
        }
        debug!(registry = %self.title, name = %name, index = entry.index, "unregistered");
        self.publish();
        self.notify(RegistryEventKind::Unregistered, name.to_string(), entry.index);
        Some(entry)
    }

    pub fn lookup_idx(&self, name: &str) -> Option<(u32, M)> {
        self.table.by_name.get(name).map(|e| (e.index, e.metadata.clone()))
    }

    pub fn lookup_name(&self, index: u32) -> Option<(String, M)> {
        let name = self.table.by_index.get(&index)?;
        self.table.by_name.get(name).map(|e| (e.name.clone(), e.metadata.clone()))
    }

    pub fn entry(&self, name: &str) -> Option<&Entry<M>> { self.table.by_name.get(name) }

    /// Next index for objects the device hands no index for. Never reused.
    pub fn allocate_index(&mut self) -> u32 {
        self.next_auto = self.next_auto.wrapping_add(1);
        self.next_auto
    }

    /// Drop every mapping. The generation sequence keeps counting.
    pub fn clear(&mut self) {
        let dropped = self.table.by_name.len();
        self.table = Table::default();
        debug!(registry = %self.title, dropped, "cleared");
        self.publish();
        self.notify(RegistryEventKind::Cleared, String::new(), 0);
    }

    /// Read-only handle for other components.
    pub fn view(&self) -> RegistryView<M> {
        RegistryView { title: Arc::clone(&self.title), published: Arc::clone(&self.published) }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> { self.events.subscribe() }

    fn publish(&self) {
        self.published.store(Arc::new(self.table.clone()));
        metrics::gauge!("registry_entries", self.table.by_name.len() as f64, "registry" => self.title.to_string());
    }

    fn notify(&self, kind: RegistryEventKind, name: String, index: u32) {
        // No subscribers is fine.
        let _ = self.events.send(RegistryEvent { registry: Arc::clone(&self.title), kind, name, index });
    }
}

/// Lock-free read access to the latest published table of a registry.
pub struct RegistryView<M> {
    title: Arc<str>,
    published: Arc<ArcSwap<Table<M>>>,
}

impl<M> Clone for RegistryView<M> {
    fn clone(&self) -> Self { Self { title: Arc::clone(&self.title), published: Arc::clone(&self.published) } }
}

impl<M: Clone> RegistryView<M> {
    pub fn title(&self) -> &str { &self.title }

    pub fn lookup_idx(&self, name: &str) -> Option<(u32, M)> {
        self.published.load().by_name.get(name).map(|e| (e.index, e.metadata.clone()))
    }

    pub fn lookup_name(&self, index: u32) -> Option<(String, M)> {
        let table = self.published.load();
        let name = table.by_index.get(&index)?;
        table.by_name.get(name).map(|e| (e.name.clone(), e.metadata.clone()))
    }

    pub fn contains(&self, name: &str) -> bool { self.published.load().by_name.contains_key(name) }
    pub fn len(&self) -> usize { self.published.load().by_name.len() }
    pub fn is_empty(&self) -> bool { self.published.load().by_name.is_empty() }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut out: Vec<String> = self.published.load().by_name.keys().cloned().collect();
        out.sort();
        out
    }
}
