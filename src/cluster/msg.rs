use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::*;
use serde::{Deserialize, Serialize};

use super::agent::Agent;
use super::ClusterShared;
use crate::chanrpc::{RawCb, Ret, RetInfo, Value};
use crate::codec::Codec;
use crate::error::RpcError;

#[derive(Clone, Copy, PartialEq, Eq, Debug, strum::FromRepr)]
#[repr(u8)]
pub enum CallType {
    NotForResult = 0,
    ForResult = 1,
}

/// Cluster wire message set, carried behind the 4-byte length prefix.
///
/// `NotifyServerName` is the first frame in both directions. `err` in
/// `ResponseMsg` is the stringified error; empty means success.
#[derive(Debug, Serialize, Deserialize)]
pub enum WireMsg {
    NotifyServerName { server_name: String },
    HeartBeat,
    RequestMsg { request_id: u32, msg_id: String, call_type: u8, args: Vec<Value> },
    ResponseMsg { request_id: u32, ret: Ret, err: String },
}

impl<C: Codec> ClusterShared<C> {
    pub(crate) async fn dispatch(&self, agent: &Arc<Agent<C>>, msg: WireMsg) {
        match msg {
            WireMsg::NotifyServerName { server_name } => {
                self.handle_notify_server_name(agent, server_name)
            }
            WireMsg::HeartBeat => agent.heartbeat_misses.store(0, Ordering::Release),
            WireMsg::RequestMsg { request_id, msg_id, call_type, args } => {
                self.handle_request(agent, request_id, msg_id, call_type, args).await
            }
            WireMsg::ResponseMsg { request_id, ret, err } => {
                self.handle_response(agent, request_id, ret, err)
            }
        }
    }

    fn handle_notify_server_name(&self, agent: &Arc<Agent<C>>, server_name: String) {
        if server_name.is_empty() {
            warn!("peer {} announced an empty server name", agent.remote_addr());
            return;
        }
        agent.set_peer_name(&server_name);
        self.agents.lock().unwrap().insert(server_name.clone(), agent.clone());
        info!("{} server is online", server_name);
    }

    async fn handle_request(
        &self, agent: &Arc<Agent<C>>, request_id: u32, msg_id: String, call_type: u8,
        args: Vec<Value>,
    ) {
        let for_result = CallType::from_repr(call_type) != Some(CallType::NotForResult);
        if for_result && self.closing.load(Ordering::Acquire) {
            self.respond(agent, request_id, Ret::None, Some(RpcError::ServerClosing)).await;
            return;
        }
        let found = {
            let routes = self.routes.lock().unwrap();
            match routes.get(&msg_id) {
                None => false,
                Some(client) => {
                    if !for_result {
                        client.rpc_call(&msg_id, args, None);
                    } else {
                        let conn = agent.conn.clone();
                        let codec = C::default();
                        let completion: RawCb = Box::new(move |ri: RetInfo| {
                            let err = ri.err.as_ref().map(|e| e.to_wire()).unwrap_or_default();
                            let msg = WireMsg::ResponseMsg { request_id, ret: ri.ret, err };
                            match codec.encode(&msg) {
                                Ok(data) => conn.send_background(data),
                                Err(()) => error!("request id {}: response encode failed", request_id),
                            }
                        });
                        client.rpc_call(&msg_id, args, Some(completion));
                    }
                    true
                }
            }
        };
        if found {
            return;
        }
        if for_result {
            self.respond(agent, request_id, Ret::None, Some(RpcError::NoRoute)).await;
        } else {
            self.no_route_dropped.fetch_add(1, Ordering::Relaxed);
            warn!("msg id {}: no route, request dropped", msg_id);
        }
    }

    fn handle_response(&self, agent: &Arc<Agent<C>>, request_id: u32, ret: Ret, err: String) {
        let Some(req) = agent.pop_request(request_id) else {
            error!("request id {} does not exist", request_id);
            return;
        };
        let ri = RetInfo { ret, err: RpcError::from_wire(&err), cb: req.cb };
        if req.ret_tx.try_send(ri).is_err() {
            warn!("request id {}: return channel unavailable", request_id);
        }
    }

    async fn respond(
        &self, agent: &Arc<Agent<C>>, request_id: u32, ret: Ret, err: Option<RpcError>,
    ) {
        let err = err.map(|e| e.to_wire()).unwrap_or_default();
        let msg = WireMsg::ResponseMsg { request_id, ret, err };
        let _ = agent.write_msg(&msg).await;
    }
}
