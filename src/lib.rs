//! # chanmesh
//!
//! Building blocks for long-lived, message-driven backend services (game
//! halls, gateways, match servers): an in-process **channel RPC** engine and
//! a **cluster overlay** that projects the same call surface across
//! processes over framed TCP.
//!
//! ## Model
//!
//! - Every service module owns one [LocalServer]. A single task drains its
//!   inbox, so handlers never race each other and need no locks for the
//!   state they close over.
//! - Other modules call through [LocalClient] handles: fire-and-forget
//!   (`go`), sync (`call0`/`call1`/`calln`), or async with a typed callback
//!   (`asyn_call`).
//! - A [ClusterNode] joins the process into a mesh of named peers. Routes
//!   bind msg ids to local servers; the node translates inbound
//!   `RequestMsg` frames into local rpc calls and correlates `ResponseMsg`
//!   frames back to their callers. Liveness is heartbeat-driven;
//!   [ClusterNode::destroy] drains in-flight requests before teardown.
//!
//! Handlers may defer their outcome by taking the [ExternalRet] hook and
//! firing the returned [Responder] later, from any task.
//!
//! ## Example
//!
//! ```no_run
//! use chanmesh::{ClusterConfig, ClusterNode, Handler, LocalServer, Value};
//!
//! async fn run_node() -> std::io::Result<()> {
//!     let mut hall = LocalServer::new(1024);
//!     hall.register("join", Handler::h1(|args, _ext| {
//!         let who = args[0].as_str().unwrap_or("guest");
//!         Ok(Value::from(format!("welcome {}", who)))
//!     }));
//!
//!     let mut config = ClusterConfig::default();
//!     config.server_name = "hall".to_string();
//!     config.listen_addr = "127.0.0.1:9301".to_string();
//!     let node: ClusterNode = ClusterNode::new(config);
//!     node.set_route("join", &hall);
//!     node.init().await?;
//!
//!     // the owning task drains the hall's inbox
//!     hall.run().await;
//!     Ok(())
//! }
//! ```

pub mod chanrpc;
pub mod cluster;
mod codec;
mod config;
pub mod error;
mod net;

pub use chanrpc::{
    exec_cb, ret_channel, CallInfo, Callback, ExternalRet, Handler, HandlerId, HandlerShape,
    LocalClient, LocalServer, RawCb, Responder, Ret, RetInfo, ServerHandle, Value,
};
pub use cluster::{Agent, CallType, ClusterNode, WireMsg};
pub use codec::{Codec, JsonCodec, MsgpCodec};
pub use config::ClusterConfig;
pub use error::RpcError;
