use std::panic::{catch_unwind, AssertUnwindSafe};

use crossfire::{mpsc, AsyncRx, MAsyncTx, TrySendError};
use log::*;

use super::server::{
    CallInfo, HandlerShape, LocalServer, RawCb, RetInfo, RetSink, ServerHandle, Value,
};
use crate::error::RpcError;

/// Typed completion for async calls; the variant selects the handler shape
/// the call is checked against.
pub enum Callback {
    E(Box<dyn FnOnce(Result<(), RpcError>) + Send>),
    One(Box<dyn FnOnce(Result<Value, RpcError>) + Send>),
    Multi(Box<dyn FnOnce(Result<Vec<Value>, RpcError>) + Send>),
}

impl Callback {
    pub fn e<F>(f: F) -> Callback
    where
        F: FnOnce(Result<(), RpcError>) + Send + 'static,
    {
        Callback::E(Box::new(f))
    }

    pub fn one<F>(f: F) -> Callback
    where
        F: FnOnce(Result<Value, RpcError>) + Send + 'static,
    {
        Callback::One(Box::new(f))
    }

    pub fn multi<F>(f: F) -> Callback
    where
        F: FnOnce(Result<Vec<Value>, RpcError>) + Send + 'static,
    {
        Callback::Multi(Box::new(f))
    }

    pub(crate) fn shape(&self) -> HandlerShape {
        match self {
            Callback::E(_) => HandlerShape::HE,
            Callback::One(_) => HandlerShape::H1,
            Callback::Multi(_) => HandlerShape::HN,
        }
    }
}

/// Execute the typed callback carried by an outcome. Panics inside the
/// callback are contained and logged.
pub fn exec_cb(ri: RetInfo) {
    let RetInfo { ret, err, cb } = ri;
    let Some(cb) = cb else {
        error!("chanrpc: outcome without callback reached exec_cb");
        return;
    };
    let r = catch_unwind(AssertUnwindSafe(move || match cb {
        Callback::E(f) => f(match err {
            Some(e) => Err(e),
            None => Ok(()),
        }),
        Callback::One(f) => f(match err {
            Some(e) => Err(e),
            None => Ok(ret.into_one()),
        }),
        Callback::Multi(f) => f(match err {
            Some(e) => Err(e),
            None => Ok(ret.into_multi()),
        }),
    }));
    if r.is_err() {
        error!("chanrpc: callback panicked");
    }
}

/// A dedicated return channel pair for async outcomes, for callers that
/// drain cluster results without a [LocalClient].
pub fn ret_channel(l: usize) -> (MAsyncTx<RetInfo>, AsyncRx<RetInfo>) {
    mpsc::bounded_async::<RetInfo>(l.max(1))
}

/// Per-caller handle to a [LocalServer].
///
/// Sync calls take `&mut self`: one outstanding sync call per client is the
/// contract, and the exclusive borrow enforces it. One client per task.
pub struct LocalClient {
    server: Option<ServerHandle>,
    sync_tx: MAsyncTx<RetInfo>,
    sync_rx: AsyncRx<RetInfo>,
    asyn_tx: MAsyncTx<RetInfo>,
    asyn_rx: AsyncRx<RetInfo>,
    asyn_cap: usize,
    pending_asyn: usize,
}

impl LocalClient {
    /// `l` is the async ring capacity; a client with `l == 0` can only make
    /// sync and fire-and-forget calls.
    pub fn new(l: usize) -> LocalClient {
        let (sync_tx, sync_rx) = mpsc::bounded_async::<RetInfo>(1);
        let (asyn_tx, asyn_rx) = mpsc::bounded_async::<RetInfo>(l.max(1));
        LocalClient {
            server: None,
            sync_tx,
            sync_rx,
            asyn_tx,
            asyn_rx,
            asyn_cap: l,
            pending_asyn: 0,
        }
    }

    pub fn attach(&mut self, s: &LocalServer) {
        self.server = Some(s.handle());
    }

    pub fn attach_handle(&mut self, h: ServerHandle) {
        self.server = Some(h);
    }

    pub fn attached(&self) -> bool {
        self.server.is_some()
    }

    fn server(&self) -> Result<&ServerHandle, RpcError> {
        self.server.as_ref().ok_or(RpcError::NotAttached)
    }

    /// Resolve a handler id and check it against the requested call style.
    fn f(&self, id: &str, want: HandlerShape) -> Result<(), RpcError> {
        let h = self.server()?;
        match h.shapes.read().unwrap().get(id) {
            None => Err(RpcError::NotRegistered),
            Some(s) if *s == want => Ok(()),
            Some(_) => Err(RpcError::ShapeMismatch),
        }
    }

    fn registered(&self, id: &str) -> Result<(), RpcError> {
        let h = self.server()?;
        if h.shapes.read().unwrap().contains_key(id) {
            Ok(())
        } else {
            Err(RpcError::NotRegistered)
        }
    }

    async fn call_blocking(&mut self, ci: CallInfo) -> Result<(), RpcError> {
        let h = self.server()?;
        h.tx.send(ci).await.map_err(|_| RpcError::ServerClosing)
    }

    async fn sync_call(&mut self, id: &str, args: Vec<Value>) -> Result<RetInfo, RpcError> {
        let ci = CallInfo {
            id: id.to_string(),
            args,
            sink: RetSink::Chan { tx: self.sync_tx.clone(), cb: None },
        };
        self.call_blocking(ci).await?;
        self.sync_rx.recv().await.map_err(|_| RpcError::ServerClosing)
    }

    pub async fn call0(&mut self, id: &str, args: Vec<Value>) -> Result<(), RpcError> {
        self.f(id, HandlerShape::HE)?;
        self.sync_call(id, args).await?.into_result0()
    }

    pub async fn call1(&mut self, id: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        self.f(id, HandlerShape::H1)?;
        self.sync_call(id, args).await?.into_result1()
    }

    pub async fn calln(&mut self, id: &str, args: Vec<Value>) -> Result<Vec<Value>, RpcError> {
        self.f(id, HandlerShape::HN)?;
        self.sync_call(id, args).await?.into_resultn()
    }

    /// Fire-and-forget. Never blocks; a full inbox drops the call with a log
    /// line.
    pub fn go(&self, id: &str, args: Vec<Value>) {
        let r = self.registered(id).and_then(|_| {
            let tx = &self.server.as_ref().unwrap().tx;
            match tx.try_send(CallInfo { id: id.to_string(), args, sink: RetSink::Discard }) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => Err(RpcError::QueueFull),
                Err(TrySendError::Disconnected(_)) => Err(RpcError::ServerClosing),
            }
        });
        if let Err(e) = r {
            error!("function id {}: go dropped: {}", id, e);
        }
    }

    /// Async call with a typed callback. Never blocks; every path (including
    /// failure to enqueue) eventually executes the callback once the caller
    /// drains the ring through [LocalClient::cb].
    pub fn asyn_call(&mut self, id: &str, args: Vec<Value>, cb: Callback) {
        if self.pending_asyn >= self.asyn_cap {
            exec_cb(RetInfo::from_err(RpcError::TooManyCalls, Some(cb)));
            return;
        }
        if let Err(e) = self.f(id, cb.shape()) {
            let _ = self.asyn_tx.try_send(RetInfo::from_err(e, Some(cb)));
            self.pending_asyn += 1;
            return;
        }
        let tx = self.server.as_ref().unwrap().tx.clone();
        let ci = CallInfo {
            id: id.to_string(),
            args,
            sink: RetSink::Chan { tx: self.asyn_tx.clone(), cb: Some(cb) },
        };
        match tx.try_send(ci) {
            Ok(()) => {}
            Err(e) => {
                let (err, ci) = match e {
                    TrySendError::Full(ci) => (RpcError::QueueFull, ci),
                    TrySendError::Disconnected(ci) => (RpcError::ServerClosing, ci),
                };
                let RetSink::Chan { cb, .. } = ci.sink else { unreachable!() };
                let _ = self.asyn_tx.try_send(RetInfo::from_err(err, cb));
            }
        }
        self.pending_asyn += 1;
    }

    /// Internal call path used by the cluster route table: non-blocking, the
    /// raw callback receives the outcome. Enqueue failure invokes it
    /// immediately with the error.
    pub fn rpc_call(&self, id: &str, args: Vec<Value>, cb: Option<RawCb>) {
        let sink = match cb {
            Some(f) => RetSink::Raw(f),
            None => RetSink::Discard,
        };
        let ci = CallInfo { id: id.to_string(), args, sink };
        let (ci, err) = match self.registered(id) {
            Err(e) => (ci, e),
            Ok(()) => match self.server.as_ref().unwrap().tx.try_send(ci) {
                Ok(()) => return,
                Err(TrySendError::Full(ci)) => (ci, RpcError::QueueFull),
                Err(TrySendError::Disconnected(ci)) => (ci, RpcError::ServerClosing),
            },
        };
        if let RetSink::Raw(f) = ci.sink {
            f(RetInfo::from_err(err, None));
        }
    }

    /// Account and execute one drained async outcome.
    pub fn cb(&mut self, ri: RetInfo) {
        self.pending_asyn -= 1;
        exec_cb(ri);
    }

    /// Receiver side of the async ring, for event loops that select on it
    /// and forward each item through [LocalClient::cb].
    pub fn asyn_ret_rx(&self) -> &AsyncRx<RetInfo> {
        &self.asyn_rx
    }

    /// Sender side of the async ring, for wiring cluster async results into
    /// this caller's drain loop.
    pub fn asyn_ret_tx(&self) -> MAsyncTx<RetInfo> {
        self.asyn_tx.clone()
    }

    pub fn pending_asyn(&self) -> usize {
        self.pending_asyn
    }

    pub fn idle(&self) -> bool {
        self.pending_asyn == 0
    }

    /// Drain the async ring until every pending call has completed.
    pub async fn close(&mut self) {
        while self.pending_asyn > 0 {
            match self.asyn_rx.recv().await {
                Ok(ri) => self.cb(ri),
                Err(_) => {
                    self.pending_asyn = 0;
                    break;
                }
            }
        }
    }
}
