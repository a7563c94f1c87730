use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use crossfire::{mpsc, AsyncRx, MAsyncTx};
use log::*;

use super::client::{Callback, LocalClient};
use crate::error::RpcError;

/// Opaque dynamic value carried through calls. Only the wire codec ever
/// interprets concrete types.
pub type Value = rmpv::Value;

/// Key identifying a registered handler; doubles as the wire msg id.
pub type HandlerId = String;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HandlerShape {
    H0,
    HE,
    H1,
    HN,
}

/// Return payload of a call: nothing, one value, or an ordered sequence.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Ret {
    None,
    One(Value),
    Multi(Vec<Value>),
}

impl Ret {
    /// Coerce to a single value the way `Call1` observes it.
    pub fn into_one(self) -> Value {
        match self {
            Ret::None => Value::Nil,
            Ret::One(v) => v,
            Ret::Multi(vs) => Value::Array(vs),
        }
    }

    /// Coerce to a sequence the way `CallN` observes it.
    pub fn into_multi(self) -> Vec<Value> {
        match self {
            Ret::None => Vec::new(),
            Ret::One(v) => vec![v],
            Ret::Multi(vs) => vs,
        }
    }
}

type Hf0 = Box<dyn FnMut(&[Value], &mut ExternalRet) + Send>;
type HfE = Box<dyn FnMut(&[Value], &mut ExternalRet) -> Result<(), RpcError> + Send>;
type Hf1 = Box<dyn FnMut(&[Value], &mut ExternalRet) -> Result<Value, RpcError> + Send>;
type HfN = Box<dyn FnMut(&[Value], &mut ExternalRet) -> Result<Vec<Value>, RpcError> + Send>;

/// A registered unit of work, tagged by its output shape.
///
/// Every handler receives the ordered argument sequence plus the external
/// return hook; a handler that takes the hook owns outcome delivery and its
/// plain return value is discarded.
pub enum Handler {
    H0(Hf0),
    HE(HfE),
    H1(Hf1),
    HN(HfN),
}

impl Handler {
    pub fn h0<F>(f: F) -> Handler
    where
        F: FnMut(&[Value], &mut ExternalRet) + Send + 'static,
    {
        Handler::H0(Box::new(f))
    }

    pub fn he<F>(f: F) -> Handler
    where
        F: FnMut(&[Value], &mut ExternalRet) -> Result<(), RpcError> + Send + 'static,
    {
        Handler::HE(Box::new(f))
    }

    pub fn h1<F>(f: F) -> Handler
    where
        F: FnMut(&[Value], &mut ExternalRet) -> Result<Value, RpcError> + Send + 'static,
    {
        Handler::H1(Box::new(f))
    }

    pub fn hn<F>(f: F) -> Handler
    where
        F: FnMut(&[Value], &mut ExternalRet) -> Result<Vec<Value>, RpcError> + Send + 'static,
    {
        Handler::HN(Box::new(f))
    }

    pub fn shape(&self) -> HandlerShape {
        match self {
            Handler::H0(_) => HandlerShape::H0,
            Handler::HE(_) => HandlerShape::HE,
            Handler::H1(_) => HandlerShape::H1,
            Handler::HN(_) => HandlerShape::HN,
        }
    }
}

/// Raw outcome receiver for the internal rpc call path.
pub type RawCb = Box<dyn FnOnce(RetInfo) + Send>;

/// Where an outcome goes once the handler finishes.
pub(crate) enum RetSink {
    Discard,
    Chan { tx: MAsyncTx<RetInfo>, cb: Option<Callback> },
    Raw(RawCb),
}

/// One queued call.
pub struct CallInfo {
    pub(crate) id: HandlerId,
    pub(crate) args: Vec<Value>,
    pub(crate) sink: RetSink,
}

/// One call outcome. `cb` is the originating typed callback, carried along
/// so the receiving side can execute it.
pub struct RetInfo {
    pub ret: Ret,
    pub err: Option<RpcError>,
    pub(crate) cb: Option<Callback>,
}

impl RetInfo {
    pub(crate) fn from_err(err: RpcError, cb: Option<Callback>) -> RetInfo {
        RetInfo { ret: Ret::None, err: Some(err), cb }
    }

    pub fn into_result0(self) -> Result<(), RpcError> {
        match self.err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn into_result1(self) -> Result<Value, RpcError> {
        match self.err {
            Some(e) => Err(e),
            None => Ok(self.ret.into_one()),
        }
    }

    pub fn into_resultn(self) -> Result<Vec<Value>, RpcError> {
        match self.err {
            Some(e) => Err(e),
            None => Ok(self.ret.into_multi()),
        }
    }
}

pub(crate) fn deliver(sink: RetSink, mut ri: RetInfo) {
    match sink {
        RetSink::Discard => {}
        RetSink::Chan { tx, cb } => {
            ri.cb = cb;
            if tx.try_send(ri).is_err() {
                warn!("chanrpc: return channel unavailable, outcome dropped");
            }
        }
        RetSink::Raw(f) => {
            if catch_unwind(AssertUnwindSafe(move || f(ri))).is_err() {
                error!("chanrpc: raw result callback panicked");
            }
        }
    }
}

/// One-shot outcome delivery, detachable from the dispatch loop. Safe to
/// fire from any task.
pub struct Responder {
    sink: RetSink,
}

impl Responder {
    pub fn send(self, res: Result<Ret, RpcError>) {
        let ri = match res {
            Ok(ret) => RetInfo { ret, err: None, cb: None },
            Err(e) => RetInfo::from_err(e, None),
        };
        deliver(self.sink, ri);
    }
}

/// Hook handed to every handler invocation. Taking it marks the call as
/// externally completed: the dispatch loop will not deliver the handler's
/// plain return value, and the taken [Responder] must eventually fire.
/// A leaked responder shows up as a pending async call that never drains.
pub struct ExternalRet {
    responder: Option<Responder>,
}

impl ExternalRet {
    pub fn take(&mut self) -> Responder {
        self.responder.take().expect("external ret already taken")
    }

    pub fn is_taken(&self) -> bool {
        self.responder.is_none()
    }
}

pub(crate) type ShapeMap = Arc<RwLock<HashMap<HandlerId, HandlerShape>>>;

/// Cheap handle letting clients reach a server from other tasks, usable
/// after the server itself moved into its executor task.
#[derive(Clone)]
pub struct ServerHandle {
    pub(crate) tx: MAsyncTx<CallInfo>,
    pub(crate) shapes: ShapeMap,
}

impl ServerHandle {
    /// Open a client attached to this server; `l` is its async ring capacity.
    pub fn open(&self, l: usize) -> LocalClient {
        let mut c = LocalClient::new(l);
        c.attach_handle(self.clone());
        c
    }

    // Shortcut call surface; each opens an ephemeral client and forwards.

    pub fn go(&self, id: &str, args: Vec<Value>) {
        self.open(0).go(id, args);
    }

    pub async fn call0(&self, id: &str, args: Vec<Value>) -> Result<(), RpcError> {
        self.open(0).call0(id, args).await
    }

    pub async fn call1(&self, id: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        self.open(0).call1(id, args).await
    }

    pub async fn calln(&self, id: &str, args: Vec<Value>) -> Result<Vec<Value>, RpcError> {
        self.open(0).calln(id, args).await
    }
}

/// In-process dispatch endpoint. One task owns it and drains the inbox;
/// handlers therefore never race each other and need no locks for state
/// they close over. Enqueueing from other tasks is safe.
pub struct LocalServer {
    functions: HashMap<HandlerId, Handler>,
    shapes: ShapeMap,
    tx: MAsyncTx<CallInfo>,
    rx: Option<AsyncRx<CallInfo>>,
}

impl LocalServer {
    /// `l` is the inbox capacity (at least 1).
    pub fn new(l: usize) -> LocalServer {
        let (tx, rx) = mpsc::bounded_async::<CallInfo>(l.max(1));
        LocalServer {
            functions: HashMap::new(),
            shapes: Arc::new(RwLock::new(HashMap::new())),
            tx,
            rx: Some(rx),
        }
    }

    /// Must be called before the owning task starts draining.
    /// Panics on a duplicate id.
    pub fn register(&mut self, id: impl Into<HandlerId>, h: Handler) {
        let id = id.into();
        if self.functions.contains_key(&id) {
            panic!("function id {}: already registered", id);
        }
        self.shapes.write().unwrap().insert(id.clone(), h.shape());
        self.functions.insert(id, h);
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle { tx: self.tx.clone(), shapes: self.shapes.clone() }
    }

    /// Open a client attached to this server; `l` is its async ring capacity.
    pub fn open(&self, l: usize) -> LocalClient {
        self.handle().open(l)
    }

    /// Next queued call, or None once the server is closed.
    pub async fn recv(&mut self) -> Option<CallInfo> {
        match &self.rx {
            Some(rx) => rx.recv().await.ok(),
            None => None,
        }
    }

    /// Invoke one queued call in the caller's context.
    pub fn exec(&mut self, ci: CallInfo) {
        let Some(h) = self.functions.get_mut(&ci.id) else {
            error!("function id {}: not registered", ci.id);
            deliver(ci.sink, RetInfo::from_err(RpcError::NotRegistered, None));
            return;
        };
        let mut ext = ExternalRet { responder: Some(Responder { sink: ci.sink }) };
        let out = catch_unwind(AssertUnwindSafe(|| match h {
            Handler::H0(f) => {
                f(&ci.args, &mut ext);
                Ok(Ret::None)
            }
            Handler::HE(f) => f(&ci.args, &mut ext).map(|_| Ret::None),
            Handler::H1(f) => f(&ci.args, &mut ext).map(Ret::One),
            Handler::HN(f) => f(&ci.args, &mut ext).map(Ret::Multi),
        }));
        match out {
            Ok(res) => {
                if let Some(r) = ext.responder.take() {
                    r.send(res);
                }
            }
            Err(p) => {
                let msg = panic_message(p.as_ref());
                error!("function id {}: handler panicked: {}", ci.id, msg);
                if let Some(r) = ext.responder.take() {
                    r.send(Err(RpcError::HandlerPanic(msg)));
                }
            }
        }
    }

    /// Drain the inbox until the server is closed.
    pub async fn run(&mut self) {
        loop {
            let Some(ci) = self.recv().await else { break };
            self.exec(ci);
        }
    }

    /// Stop accepting calls and fail everything still queued.
    pub fn close(&mut self) {
        let Some(rx) = self.rx.take() else { return };
        while let Ok(ci) = rx.try_recv() {
            deliver(ci.sink, RetInfo::from_err(RpcError::ServerClosing, None));
        }
    }
}

fn panic_message(p: &(dyn Any + Send)) -> String {
    if let Some(s) = p.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = p.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}
