//! Change loop: coalesces desired-state events per key and applies them in
//! batches on the blocking pool.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dpsync_models::ConfigItem;
use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{Agent, AgentConfig, Report};

/// One desired-state change for `key`. `value: None` is a deletion.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub key: String,
    pub value: Option<ConfigItem>,
    pub prev: Option<ConfigItem>,
}

impl ChangeEvent {
    pub fn put(item: ConfigItem) -> Self { Self { key: item.key(), value: Some(item), prev: None } }
    pub fn delete(key: impl Into<String>) -> Self { Self { key: key.into(), value: None, prev: None } }

    pub fn modify(prev: ConfigItem, value: ConfigItem) -> Self { Self { key: value.key(), value: Some(value), prev: Some(prev) } }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Change(ChangeEvent),
    /// A prerequisite managed outside the engine appeared or vanished.
    Prerequisite { key: String, present: bool, index: Option<u32> },
}

/// Per-key coalescing with FIFO order of first arrival.
struct ChangeCoalescer {
    map: FxHashMap<String, ChangeEvent>,
    order: VecDeque<String>,
    merged: u64,
}

impl ChangeCoalescer {
    fn new() -> Self { Self { map: FxHashMap::default(), order: VecDeque::new(), merged: 0 } }

    fn len(&self) -> usize { self.map.len() }

    /// Last value wins; the earliest `prev` is kept.
    fn push(&mut self, ev: ChangeEvent) {
        match self.map.get_mut(&ev.key) {
            Some(cur) => {
                cur.value = ev.value;
                if cur.prev.is_none() {
                    cur.prev = ev.prev;
                }
                self.merged += 1;
            }
            None => {
                self.order.push_back(ev.key.clone());
                self.map.insert(ev.key.clone(), ev);
            }
        }
    }

    fn drain(&mut self) -> Vec<ChangeEvent> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(key) = self.order.pop_front() {
            if let Some(ev) = self.map.remove(&key) {
                out.push(ev);
            }
        }
        out
    }
}

fn apply_one(agent: &Agent, ev: ChangeEvent) -> Result<Report, dpsync_core::ReconcileError> {
    match (ev.prev, ev.value) {
        (Some(prev), Some(value)) if prev.key() != value.key() => agent.modify(Some(prev), Some(value)),
        (_, Some(value)) => agent.put(value),
        (_, None) => agent.delete(&ev.key),
    }
}

/// Handle to a running change loop.
pub struct LoopHandle {
    epoch_rx: watch::Receiver<u64>,
    task: JoinHandle<()>,
}

impl LoopHandle {
    /// Bumped after every applied batch or prerequisite notification.
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }

    /// Wait for the loop to finish; it exits once every sender is dropped.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!(error = %e, "change loop task failed");
        }
    }
}

/// Spawn the change loop on the current tokio runtime.
pub fn spawn_change_loop(agent: Arc<Agent>, cfg: &AgentConfig) -> (mpsc::Sender<AgentEvent>, LoopHandle) {
    let cap = cfg.queue_cap.max(1);
    let (tx, mut rx) = mpsc::channel::<AgentEvent>(cap);
    let (epoch_tx, epoch_rx) = watch::channel(0u64);
    let tick = Duration::from_millis(cfg.tick_ms.max(1));

    let task = tokio::spawn(async move {
        let mut pending = ChangeCoalescer::new();
        let mut ticker = tokio::time::interval(tick);
        let mut epoch = 0u64;

        async fn flush(agent: &Arc<Agent>, pending: &mut ChangeCoalescer, epoch: &mut u64, epoch_tx: &watch::Sender<u64>) {
            let batch = pending.drain();
            gauge!("change_queue_len", 0.0);
            if batch.is_empty() {
                return;
            }
            let n = batch.len();
            let agent = Arc::clone(agent);
            let applied = tokio::task::spawn_blocking(move || {
                let mut errors = 0usize;
                for ev in batch {
                    let key = ev.key.clone();
                    match apply_one(&agent, ev) {
                        Ok(r) => {
                            for e in &r.errors {
                                warn!(key = %e.key(), error = %e, "cascade step failed");
                            }
                            errors += r.errors.len();
                        }
                        Err(e) => {
                            warn!(key = %key, error = %e, "change rejected");
                            errors += 1;
                        }
                    }
                }
                errors
            })
            .await;
            match applied {
                Ok(errors) => debug!(events = n, errors, "change batch applied"),
                Err(e) => warn!(error = %e, "change batch worker failed"),
            }
            counter!("change_batches_total", 1);
            *epoch += 1;
            let _ = epoch_tx.send(*epoch);
        }

        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(AgentEvent::Change(ev)) => {
                            pending.push(ev);
                            gauge!("change_queue_len", pending.len() as f64);
                            if pending.len() >= cap {
                                flush(&agent, &mut pending, &mut epoch, &epoch_tx).await;
                            }
                        }
                        Some(AgentEvent::Prerequisite { key, present, index }) => {
                            // Earlier changes go first.
                            flush(&agent, &mut pending, &mut epoch, &epoch_tx).await;
                            let a = Arc::clone(&agent);
                            let k = key.clone();
                            let res = tokio::task::spawn_blocking(move || {
                                if present { a.notify_realized(&k, index).map(|r| r.errors.len()) } else { Ok(a.notify_removed(&k).errors.len()) }
                            })
                            .await;
                            match res {
                                Ok(Ok(errors)) => debug!(key = %key, present, errors, "prerequisite applied"),
                                Ok(Err(e)) => warn!(key = %key, error = %e, "prerequisite rejected"),
                                Err(e) => warn!(error = %e, "prerequisite worker failed"),
                            }
                            epoch += 1;
                            let _ = epoch_tx.send(epoch);
                        }
                        None => {
                            debug!("change channel closed; draining and exiting change loop");
                            flush(&agent, &mut pending, &mut epoch, &epoch_tx).await;
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    flush(&agent, &mut pending, &mut epoch, &epoch_tx).await;
                }
            }
        }
        info!(coalesced = pending.merged, "change loop stopped");
    });

    (tx, LoopHandle { epoch_rx, task })
}
