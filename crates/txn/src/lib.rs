//! dpsync txn: batch heterogeneous config objects into one request.
//!
//! A builder accumulates items keyed by their derived key (last write wins),
//! `send()` hands the request to a [`ConfigTransport`] on the tokio runtime
//! and returns a [`Reply`] that resolves once the transport is done.

#![forbid(unsafe_code)]

use std::sync::Arc;

use dpsync_agent::{Agent, Report};
use dpsync_core::ReconcileError;
use dpsync_models::{BridgeDomain, ConfigItem, Interface, LocalSid, Route, TmcConfig};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum TxnError {
    #[error("transport: {0}")]
    Transport(String),
    #[error(transparent)]
    Rejected(#[from] ReconcileError),
    #[error("transaction {0} was dropped before replying")]
    Canceled(Uuid),
}

/// Full desired state, one list per object type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResyncRequest {
    pub txn_id: Uuid,
    pub interfaces: Vec<Interface>,
    pub routes: Vec<Route>,
    pub bridge_domains: Vec<BridgeDomain>,
    pub local_sids: Vec<LocalSid>,
    pub tmcs: Vec<TmcConfig>,
}

impl ResyncRequest {
    pub fn len(&self) -> usize {
        self.interfaces.len() + self.routes.len() + self.bridge_domains.len() + self.local_sids.len() + self.tmcs.len()
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    fn push(&mut self, item: ConfigItem) {
        match item {
            ConfigItem::Interface(v) => self.interfaces.push(v),
            ConfigItem::Route(v) => self.routes.push(v),
            ConfigItem::BridgeDomain(v) => self.bridge_domains.push(v),
            ConfigItem::LocalSid(v) => self.local_sids.push(v),
            ConfigItem::Tmc(v) => self.tmcs.push(v),
        }
    }

    pub fn into_items(self) -> Vec<ConfigItem> {
        let mut out = Vec::with_capacity(self.len());
        out.extend(self.interfaces.into_iter().map(ConfigItem::from));
        out.extend(self.routes.into_iter().map(ConfigItem::from));
        out.extend(self.bridge_domains.into_iter().map(ConfigItem::from));
        out.extend(self.local_sids.into_iter().map(ConfigItem::from));
        out.extend(self.tmcs.into_iter().map(ConfigItem::from));
        out
    }
}

/// Incremental change: values to put and keys to delete.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeRequest {
    pub txn_id: Uuid,
    pub puts: Vec<ConfigItem>,
    pub deletes: Vec<String>,
}

impl ChangeRequest {
    pub fn is_empty(&self) -> bool { self.puts.is_empty() && self.deletes.is_empty() }
}

/// Delivery path from builders to an agent.
#[async_trait::async_trait]
pub trait ConfigTransport: Send + Sync + 'static {
    async fn resync(&self, req: ResyncRequest) -> Result<(), TxnError>;
    async fn change(&self, req: ChangeRequest) -> Result<(), TxnError>;
}

/// Outcome of a sent transaction.
#[derive(Debug)]
pub struct Reply {
    txn_id: Uuid,
    rx: oneshot::Receiver<Result<(), TxnError>>,
}

impl Reply {
    fn ready(txn_id: Uuid, res: Result<(), TxnError>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(res);
        Self { txn_id, rx }
    }

    pub fn txn_id(&self) -> Uuid { self.txn_id }

    pub async fn receive_reply(self) -> Result<(), TxnError> {
        let id = self.txn_id;
        self.rx.await.unwrap_or(Err(TxnError::Canceled(id)))
    }

    /// Blocking variant for synchronous callers. Must not be called from
    /// inside an async context.
    pub fn blocking_receive_reply(self) -> Result<(), TxnError> {
        let id = self.txn_id;
        self.rx.blocking_recv().unwrap_or(Err(TxnError::Canceled(id)))
    }
}

fn dispatch<F, Fut>(txn_id: Uuid, kind: &'static str, call: F) -> Reply
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<(), TxnError>> + Send + 'static,
{
    let handle = match tokio::runtime::Handle::try_current() {
        Ok(h) => h,
        Err(e) => return Reply::ready(txn_id, Err(TxnError::Transport(e.to_string()))),
    };
    metrics::counter!("txn_sent_total", 1, "kind" => kind);
    let (tx, rx) = oneshot::channel();
    let fut = call();
    handle.spawn(async move {
        let res = fut.await;
        match &res {
            Ok(()) => debug!(%txn_id, kind, "transaction applied"),
            Err(e) => warn!(%txn_id, kind, error = %e, "transaction failed"),
        }
        // Caller may have dropped the reply.
        let _ = tx.send(res);
    });
    Reply { txn_id, rx }
}

/// Builder for a full-state resync.
pub struct ResyncTxn {
    transport: Arc<dyn ConfigTransport>,
    items: FxHashMap<String, ConfigItem>,
}

impl ResyncTxn {
    pub fn new(transport: Arc<dyn ConfigTransport>) -> Self { Self { transport, items: FxHashMap::default() } }

    pub fn item(mut self, item: impl Into<ConfigItem>) -> Self {
        let item = item.into();
        self.items.insert(item.key(), item);
        self
    }

    pub fn interface(self, v: Interface) -> Self { self.item(v) }
    pub fn route(self, v: Route) -> Self { self.item(v) }
    pub fn bridge_domain(self, v: BridgeDomain) -> Self { self.item(v) }
    pub fn local_sid(self, v: LocalSid) -> Self { self.item(v) }
    pub fn tmc(self, v: TmcConfig) -> Self { self.item(v) }

    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }

    /// Grouped request in key order.
    pub fn request(&self) -> ResyncRequest {
        let mut keys: Vec<&String> = self.items.keys().collect();
        keys.sort();
        let mut req = ResyncRequest { txn_id: Uuid::new_v4(), ..Default::default() };
        for k in keys {
            if let Some(item) = self.items.get(k) {
                req.push(item.clone());
            }
        }
        req
    }

    pub fn send(self) -> Reply {
        let req = self.request();
        let txn_id = req.txn_id;
        info!(%txn_id, items = req.len(), "sending resync");
        let transport = self.transport;
        dispatch(txn_id, "resync", move || async move { transport.resync(req).await })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Put,
    Delete,
}

enum TxnOp {
    Put(ConfigItem),
    Delete,
}

/// Builder for an incremental change. Adds become puts or deletions
/// depending on the last `.put()` / `.delete()` switch; puts are the default.
pub struct ChangeTxn {
    transport: Arc<dyn ConfigTransport>,
    mode: Mode,
    ops: FxHashMap<String, TxnOp>,
}

impl ChangeTxn {
    pub fn new(transport: Arc<dyn ConfigTransport>) -> Self { Self { transport, mode: Mode::Put, ops: FxHashMap::default() } }

    pub fn put(mut self) -> Self {
        self.mode = Mode::Put;
        self
    }

    pub fn delete(mut self) -> Self {
        self.mode = Mode::Delete;
        self
    }

    pub fn item(mut self, item: impl Into<ConfigItem>) -> Self {
        let item = item.into();
        let key = item.key();
        let op = match self.mode {
            Mode::Put => TxnOp::Put(item),
            Mode::Delete => TxnOp::Delete,
        };
        self.ops.insert(key, op);
        self
    }

    /// Delete by key regardless of mode.
    pub fn delete_key(mut self, key: impl Into<String>) -> Self {
        self.ops.insert(key.into(), TxnOp::Delete);
        self
    }

    pub fn interface(self, v: Interface) -> Self { self.item(v) }
    pub fn route(self, v: Route) -> Self { self.item(v) }
    pub fn bridge_domain(self, v: BridgeDomain) -> Self { self.item(v) }
    pub fn local_sid(self, v: LocalSid) -> Self { self.item(v) }
    pub fn tmc(self, v: TmcConfig) -> Self { self.item(v) }

    pub fn len(&self) -> usize { self.ops.len() }
    pub fn is_empty(&self) -> bool { self.ops.is_empty() }

    pub fn request(&self) -> ChangeRequest {
        let mut keys: Vec<&String> = self.ops.keys().collect();
        keys.sort();
        let mut req = ChangeRequest { txn_id: Uuid::new_v4(), ..Default::default() };
        for k in keys {
            match self.ops.get(k) {
                Some(TxnOp::Put(item)) => req.puts.push(item.clone()),
                Some(TxnOp::Delete) => req.deletes.push(k.clone()),
                None => {}
            }
        }
        req
    }

    pub fn send(self) -> Reply {
        let req = self.request();
        let txn_id = req.txn_id;
        info!(%txn_id, puts = req.puts.len(), deletes = req.deletes.len(), "sending change");
        let transport = self.transport;
        dispatch(txn_id, "change", move || async move { transport.change(req).await })
    }
}

/// Delivers requests to an in-process agent on the blocking pool.
#[derive(Clone)]
pub struct LocalTransport {
    agent: Arc<Agent>,
}

impl LocalTransport {
    pub fn new(agent: Arc<Agent>) -> Self { Self { agent } }

    pub fn agent(&self) -> &Arc<Agent> { &self.agent }

    async fn run<F>(&self, f: F) -> Result<(), TxnError>
    where
        F: FnOnce(&Agent) -> Report + Send + 'static,
    {
        let agent = Arc::clone(&self.agent);
        let report = tokio::task::spawn_blocking(move || f(&agent)).await.map_err(|e| TxnError::Transport(e.to_string()))?;
        match report.errors.into_iter().next() {
            Some(e) => Err(TxnError::Rejected(e)),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl ConfigTransport for LocalTransport {
    async fn resync(&self, req: ResyncRequest) -> Result<(), TxnError> {
        let items = req.into_items();
        self.run(move |agent| agent.resync(items)).await
    }

    /// Deletions go first; every op is attempted and the first error wins.
    async fn change(&self, req: ChangeRequest) -> Result<(), TxnError> {
        self.run(move |agent| {
            let mut report = Report::default();
            for key in &req.deletes {
                match agent.delete(key) {
                    Ok(r) => report.merge(r),
                    Err(e) => report.errors.push(e),
                }
            }
            for item in req.puts {
                match agent.put(item) {
                    Ok(r) => report.merge(r),
                    Err(e) => report.errors.push(e),
                }
            }
            report
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nowhere;

    #[async_trait::async_trait]
    impl ConfigTransport for Nowhere {
        async fn resync(&self, _req: ResyncRequest) -> Result<(), TxnError> { Ok(()) }
        async fn change(&self, _req: ChangeRequest) -> Result<(), TxnError> { Ok(()) }
    }

    #[test]
    fn last_write_per_key_wins() {
        let mut a = Interface::loopback("loop0");
        a.mtu = Some(1400);
        let mut b = Interface::loopback(" loop0");
        b.mtu = Some(1500);
        let txn = ResyncTxn::new(Arc::new(Nowhere)).interface(a).interface(b).route(Route::new("10.0.0.0/8", "10.0.0.1"));
        let req = txn.request();
        assert_eq!(req.len(), 2);
        assert_eq!(req.interfaces[0].mtu, Some(1500));
    }

    #[test]
    fn change_modes_switch_per_add() {
        let txn = ChangeTxn::new(Arc::new(Nowhere))
            .interface(Interface::loopback("a"))
            .delete()
            .interface(Interface::loopback("b"))
            .put()
            .tmc(TmcConfig::new("t", "a", 1400));
        let req = txn.request();
        assert_eq!(req.puts.len(), 2);
        assert_eq!(req.deletes, vec![dpsync_models::interface_key("b")]);
    }

    #[test]
    fn send_without_runtime_fails_fast() {
        let r = ResyncTxn::new(Arc::new(Nowhere)).interface(Interface::loopback("a")).send();
        assert!(matches!(r.blocking_receive_reply(), Err(TxnError::Transport(_))));
    }
}
