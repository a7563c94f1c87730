//! In-process channel RPC: a single-owner dispatch loop per service module,
//! callable from any task through per-caller clients.

mod client;
mod server;

pub use client::{exec_cb, ret_channel, Callback, LocalClient};
pub use server::{
    CallInfo, ExternalRet, Handler, HandlerId, HandlerShape, LocalServer, RawCb, Responder, Ret,
    RetInfo, ServerHandle, Value,
};
