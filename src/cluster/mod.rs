//! Cluster overlay: a mesh of named peer nodes over framed TCP exposing the
//! chanrpc call surface for remote modules.

mod agent;
mod msg;

pub use agent::Agent;
pub use msg::{CallType, WireMsg};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossfire::{mpmc, MAsyncRx, MAsyncTx, MTx};
use futures::FutureExt;
use log::*;
use tokio::net::TcpStream;
use tokio::time::{interval, sleep, Duration};

use crate::chanrpc::{Callback, HandlerId, LocalClient, LocalServer, RetInfo, Value};
use crate::codec::{Codec, MsgpCodec};
use crate::config::ClusterConfig;
use crate::error::RpcError;
use crate::net::{Conn, ConnHandler, FrameReader, TcpClient, TcpServer};

/// Seconds the in-flight count must stay zero before destroy tears down.
const QUIESCE_SECS: u32 = 5;

pub(crate) struct ClusterShared<C: Codec> {
    pub(crate) config: ClusterConfig,
    pub(crate) agents: Mutex<HashMap<String, Arc<Agent<C>>>>,
    pub(crate) routes: Mutex<HashMap<HandlerId, LocalClient>>,
    pub(crate) closing: AtomicBool,
    pub(crate) no_route_dropped: AtomicU64,
    listener: Mutex<Option<TcpServer>>,
    dialers: Mutex<Vec<TcpClient>>,
    hb_close: Mutex<Option<MTx<()>>>,
}

/// One process's membership in the mesh: directory of live peers, route
/// table for inbound requests, and the connection lifecycle.
pub struct ClusterNode<C: Codec = MsgpCodec> {
    shared: Arc<ClusterShared<C>>,
}

impl<C: Codec> Clone for ClusterNode<C> {
    fn clone(&self) -> Self {
        ClusterNode { shared: self.shared.clone() }
    }
}

impl<C: Codec> ClusterNode<C> {
    pub fn new(config: ClusterConfig) -> ClusterNode<C> {
        ClusterNode {
            shared: Arc::new(ClusterShared {
                config,
                agents: Mutex::new(HashMap::new()),
                routes: Mutex::new(HashMap::new()),
                closing: AtomicBool::new(false),
                no_route_dropped: AtomicU64::new(0),
                listener: Mutex::new(None),
                dialers: Mutex::new(Vec::new()),
                hb_close: Mutex::new(None),
            }),
        }
    }

    /// Bind a msg id to a local server. Inbound requests for it are issued
    /// on a dedicated capacity-0 client; outcomes travel per-request.
    /// Call during startup only; panics on a duplicate id.
    pub fn set_route(&self, id: impl Into<HandlerId>, server: &LocalServer) {
        let id = id.into();
        let mut routes = self.shared.routes.lock().unwrap();
        if routes.contains_key(&id) {
            panic!("msg id {}: route already set", id);
        }
        routes.insert(id, server.open(0));
    }

    /// Start listener, dialers and the heartbeat task. Returns the bound
    /// listen address when listening (useful with port 0).
    pub async fn init(&self) -> std::io::Result<Option<String>> {
        let shared = self.shared.clone();
        let handler: ConnHandler = Arc::new(move |stream: TcpStream| {
            let shared = shared.clone();
            async move { handle_conn(shared, stream).await }.boxed()
        });
        let mut listen_addr = None;
        if !self.shared.config.listen_addr.is_empty() {
            let srv = TcpServer::start(&self.shared.config.listen_addr, handler.clone()).await?;
            listen_addr = Some(srv.local_addr().to_string());
            *self.shared.listener.lock().unwrap() = Some(srv);
        }
        for addr in &self.shared.config.conn_addrs {
            let client = TcpClient::start(addr.clone(), handler.clone());
            self.shared.dialers.lock().unwrap().push(client);
        }
        let (tx, rx) = mpmc::unbounded_async::<()>();
        *self.shared.hb_close.lock().unwrap() = Some(tx);
        tokio::spawn(heartbeat_loop(self.shared.clone(), rx));
        Ok(listen_addr)
    }

    pub fn get_agent(&self, server_name: &str) -> Option<Arc<Agent<C>>> {
        self.shared.agents.lock().unwrap().get(server_name).cloned()
    }

    /// Total outstanding result-bearing requests across all agents.
    pub fn get_request_count(&self) -> i32 {
        self.shared.agents.lock().unwrap().values().map(|a| a.request_count()).sum()
    }

    /// Fire-and-forget requests dropped because the remote had no route.
    pub fn no_route_dropped(&self) -> u64 {
        self.shared.no_route_dropped.load(Ordering::Relaxed)
    }

    pub async fn go(&self, server_name: &str, id: &str, args: Vec<Value>) {
        match self.get_agent(server_name) {
            Some(a) => a.go(id, args).await,
            None => debug!("{} server is offline, go {} dropped", server_name, id),
        }
    }

    pub async fn call0(&self, server_name: &str, id: &str, args: Vec<Value>) -> Result<(), RpcError> {
        match self.get_agent(server_name) {
            Some(a) => a.call0(id, args).await,
            None => Err(RpcError::ServerOffline),
        }
    }

    pub async fn call1(
        &self, server_name: &str, id: &str, args: Vec<Value>,
    ) -> Result<Value, RpcError> {
        match self.get_agent(server_name) {
            Some(a) => a.call1(id, args).await,
            None => Err(RpcError::ServerOffline),
        }
    }

    pub async fn calln(
        &self, server_name: &str, id: &str, args: Vec<Value>,
    ) -> Result<Vec<Value>, RpcError> {
        match self.get_agent(server_name) {
            Some(a) => a.calln(id, args).await,
            None => Err(RpcError::ServerOffline),
        }
    }

    /// Async call; offline peers deliver the error through the ring like
    /// any other outcome.
    pub async fn asyn_call(
        &self, server_name: &str, ret_tx: &MAsyncTx<RetInfo>, id: &str, args: Vec<Value>,
        cb: Callback,
    ) {
        match self.get_agent(server_name) {
            Some(a) => a.asyn_call(ret_tx, id, args, cb).await,
            None => {
                let ri = RetInfo::from_err(RpcError::ServerOffline, Some(cb));
                if ret_tx.try_send(ri).is_err() {
                    warn!("{} offline and async ring full, callback lost", server_name);
                }
            }
        }
    }

    /// Graceful shutdown: refuse new result-bearing inbound work, wait for
    /// cluster-wide quiescence, then tear down listener, dialers and
    /// connections.
    pub async fn destroy(&self) {
        self.shared.closing.store(true, Ordering::Release);
        let mut no_request_secs = 0u32;
        loop {
            sleep(Duration::from_secs(1)).await;
            if self.get_request_count() == 0 {
                no_request_secs += 1;
                if no_request_secs >= QUIESCE_SECS {
                    break;
                }
            } else {
                no_request_secs = 0;
            }
        }
        if let Some(l) = self.shared.listener.lock().unwrap().take() {
            l.close();
        }
        for d in self.shared.dialers.lock().unwrap().drain(..) {
            d.close();
        }
        self.shared.hb_close.lock().unwrap().take();
        let agents: Vec<Arc<Agent<C>>> =
            self.shared.agents.lock().unwrap().values().cloned().collect();
        for a in agents {
            a.destroy();
        }
    }
}

impl<C: Codec> ClusterShared<C> {
    fn on_agent_close(&self, agent: &Arc<Agent<C>>) {
        let name = agent.peer_name();
        if !name.is_empty() {
            let mut agents = self.agents.lock().unwrap();
            if let Some(cur) = agents.get(&name) {
                if Arc::ptr_eq(cur, agent) {
                    agents.remove(&name);
                }
            }
            drop(agents);
            info!("{} server is offline", name);
        }
        agent.fail_pending();
    }
}

/// Per-connection lifetime: announce ourselves, pump inbound frames into
/// the dispatcher, clean up when the link dies.
async fn handle_conn<C: Codec>(shared: Arc<ClusterShared<C>>, stream: TcpStream) {
    let local_addr = stream.local_addr().map(|a| a.to_string()).unwrap_or_default();
    let peer_addr = stream.peer_addr().map(|a| a.to_string()).unwrap_or_default();
    let (rd, wr) = stream.into_split();
    let conn = Conn::start(wr, shared.config.pending_write_num, local_addr, peer_addr);
    let agent: Arc<Agent<C>> = Arc::new(Agent::new(conn.clone()));
    let hello = WireMsg::NotifyServerName { server_name: shared.config.server_name.clone() };
    if agent.write_msg(&hello).await.is_err() {
        conn.destroy();
        return;
    }
    let mut reader = FrameReader::new(rd);
    let close_rx = conn.close_rx();
    loop {
        let msg = tokio::select! {
            r = reader.read_frame() => match r {
                Ok(frame) => agent.codec.decode::<WireMsg>(frame),
                Err(e) => {
                    debug!("read message: {:?}", e);
                    break;
                }
            },
            _ = close_rx.recv() => break,
        };
        let Ok(msg) = msg else {
            debug!("undecodable message from {}, closing", conn.peer_addr());
            break;
        };
        shared.dispatch(&agent, msg).await;
    }
    conn.destroy();
    shared.on_agent_close(&agent);
}

async fn heartbeat_loop<C: Codec>(shared: Arc<ClusterShared<C>>, close_rx: MAsyncRx<()>) {
    let mut secs = shared.config.heart_beat_interval;
    if secs <= 0 {
        warn!("invalid heart_beat_interval, reset to 5");
        secs = 5;
    }
    let mut ticker = interval(Duration::from_secs(secs as u64));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = close_rx.recv() => return,
        }
        let agents: Vec<Arc<Agent<C>>> =
            shared.agents.lock().unwrap().values().cloned().collect();
        for agent in agents {
            if agent.heartbeat_misses.fetch_add(1, Ordering::AcqRel) + 1 >= 2 {
                warn!("{} heartbeat missed twice, destroying connection", agent.peer_name());
                agent.destroy();
            } else {
                let _ = agent.write_msg(&WireMsg::HeartBeat).await;
            }
        }
    }
}
