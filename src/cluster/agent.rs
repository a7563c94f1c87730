use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;

use crossfire::{mpsc, MAsyncTx};
use log::*;

use super::msg::{CallType, WireMsg};
use crate::chanrpc::{Callback, RetInfo, Value};
use crate::codec::Codec;
use crate::error::RpcError;
use crate::net::Conn;

/// Where a pending remote call's outcome is delivered.
pub(crate) struct RequestInfo {
    pub(crate) cb: Option<Callback>,
    pub(crate) ret_tx: MAsyncTx<RetInfo>,
}

struct RequestTable {
    next_id: u32,
    map: HashMap<u32, RequestInfo>,
}

/// A live peer connection. Exposes the same call surface as a local client;
/// calls are translated into `RequestMsg` frames and outcomes correlated
/// back by request id (monotone per agent, wrapping at u32::MAX).
pub struct Agent<C: Codec> {
    pub(crate) codec: C,
    pub(crate) conn: Conn,
    peer_name: Mutex<String>,
    requests: Mutex<RequestTable>,
    req_count: AtomicI32,
    pub(crate) heartbeat_misses: AtomicI32,
}

impl<C: Codec> Agent<C> {
    pub(crate) fn new(conn: Conn) -> Agent<C> {
        Agent {
            codec: C::default(),
            conn,
            peer_name: Mutex::new(String::new()),
            requests: Mutex::new(RequestTable { next_id: 0, map: HashMap::new() }),
            req_count: AtomicI32::new(0),
            heartbeat_misses: AtomicI32::new(0),
        }
    }

    /// Peer identity; empty until `NotifyServerName` arrives.
    pub fn peer_name(&self) -> String {
        self.peer_name.lock().unwrap().clone()
    }

    pub(crate) fn set_peer_name(&self, name: &str) {
        *self.peer_name.lock().unwrap() = name.to_string();
    }

    pub fn local_addr(&self) -> String {
        self.conn.local_addr().to_string()
    }

    pub fn remote_addr(&self) -> String {
        self.conn.peer_addr().to_string()
    }

    /// Outstanding result-bearing requests on this connection.
    pub fn request_count(&self) -> i32 {
        self.req_count.load(Ordering::Acquire)
    }

    pub(crate) fn register_request(&self, req: RequestInfo) -> u32 {
        let mut t = self.requests.lock().unwrap();
        let id = t.next_id;
        t.next_id = t.next_id.wrapping_add(1);
        t.map.insert(id, req);
        self.req_count.fetch_add(1, Ordering::AcqRel);
        id
    }

    pub(crate) fn pop_request(&self, request_id: u32) -> Option<RequestInfo> {
        let mut t = self.requests.lock().unwrap();
        let req = t.map.remove(&request_id);
        if req.is_some() {
            self.req_count.fetch_sub(1, Ordering::AcqRel);
        }
        req
    }

    /// The peer will never answer these; fail them all.
    pub(crate) fn fail_pending(&self) {
        let pending: Vec<RequestInfo> = {
            let mut t = self.requests.lock().unwrap();
            t.map.drain().map(|(_, req)| req).collect()
        };
        for req in pending {
            self.req_count.fetch_sub(1, Ordering::AcqRel);
            let ri = RetInfo::from_err(RpcError::Transport, req.cb);
            if req.ret_tx.try_send(ri).is_err() {
                warn!("{}: abandoned request return channel unavailable", self.peer_name());
            }
        }
    }

    pub(crate) async fn write_msg(&self, msg: &WireMsg) -> Result<(), RpcError> {
        let Ok(data) = self.codec.encode(msg) else {
            return Err(RpcError::Encode);
        };
        self.conn.send(data).await
    }

    /// Fire-and-forget; no request is registered and no outcome returns.
    pub async fn go(&self, id: &str, args: Vec<Value>) {
        let msg = WireMsg::RequestMsg {
            request_id: 0,
            msg_id: id.to_string(),
            call_type: CallType::NotForResult as u8,
            args,
        };
        if let Err(e) = self.write_msg(&msg).await {
            debug!("{}: go {} dropped: {}", self.peer_name(), id, e);
        }
    }

    async fn call_for_result(&self, id: &str, args: Vec<Value>) -> RetInfo {
        let (tx, rx) = mpsc::bounded_async::<RetInfo>(1);
        let request_id = self.register_request(RequestInfo { cb: None, ret_tx: tx });
        let msg = WireMsg::RequestMsg {
            request_id,
            msg_id: id.to_string(),
            call_type: CallType::ForResult as u8,
            args,
        };
        if let Err(e) = self.write_msg(&msg).await {
            self.pop_request(request_id);
            return RetInfo::from_err(e, None);
        }
        match rx.recv().await {
            Ok(ri) => ri,
            Err(_) => RetInfo::from_err(RpcError::Transport, None),
        }
    }

    pub async fn call0(&self, id: &str, args: Vec<Value>) -> Result<(), RpcError> {
        self.call_for_result(id, args).await.into_result0()
    }

    pub async fn call1(&self, id: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        self.call_for_result(id, args).await.into_result1()
    }

    pub async fn calln(&self, id: &str, args: Vec<Value>) -> Result<Vec<Value>, RpcError> {
        self.call_for_result(id, args).await.into_resultn()
    }

    /// Async call; the outcome lands on `ret_tx` with `cb` attached, ready
    /// for [crate::chanrpc::exec_cb] on the caller's drain loop.
    pub async fn asyn_call(
        &self, ret_tx: &MAsyncTx<RetInfo>, id: &str, args: Vec<Value>, cb: Callback,
    ) {
        let request_id =
            self.register_request(RequestInfo { cb: Some(cb), ret_tx: ret_tx.clone() });
        let msg = WireMsg::RequestMsg {
            request_id,
            msg_id: id.to_string(),
            call_type: CallType::ForResult as u8,
            args,
        };
        if let Err(e) = self.write_msg(&msg).await {
            if let Some(req) = self.pop_request(request_id) {
                let _ = req.ret_tx.try_send(RetInfo::from_err(e, req.cb));
            }
        }
    }

    /// Tear the connection down; the read loop exits and the agent leaves
    /// the directory.
    pub fn destroy(&self) {
        self.conn.destroy();
    }
}
