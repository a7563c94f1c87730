//! Call outcome errors, shared by the local engine and the cluster overlay.
//!
//! Internal kinds render as stable `rpc_` codes so they survive the wire as
//! plain strings; anything else decodes back as [RpcError::User].

/// Reserved prefix for internal error codes on the wire.
pub const WIRE_ERR_PREFIX: &str = "rpc_";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    /// Handler id is not present in the registry.
    #[error("rpc_not_registered")]
    NotRegistered,
    /// Call style does not match the registered handler shape.
    #[error("rpc_shape_mismatch")]
    ShapeMismatch,
    /// Non-blocking enqueue rejected, inbox is full.
    #[error("rpc_queue_full")]
    QueueFull,
    /// Async ring is at capacity, the call was never issued.
    #[error("rpc_too_many_calls")]
    TooManyCalls,
    /// The handler panicked; the payload is carried along.
    #[error("rpc_handler_panic: {0}")]
    HandlerPanic(String),
    /// Client is not attached to any server.
    #[error("rpc_not_attached")]
    NotAttached,
    /// No agent is known for the requested peer.
    #[error("rpc_server_offline")]
    ServerOffline,
    /// The callee is draining and refuses new result-bearing work.
    #[error("rpc_server_closing")]
    ServerClosing,
    /// The remote has no route for the message id.
    #[error("rpc_no_route")]
    NoRoute,
    /// The connection died with the request still in flight.
    #[error("rpc_transport")]
    Transport,
    /// Message could not be encoded for the wire.
    #[error("rpc_encode")]
    Encode,
    /// Error produced by handler logic; travels the wire verbatim.
    #[error("{0}")]
    User(String),
}

impl RpcError {
    #[inline]
    pub fn user(msg: impl Into<String>) -> Self {
        Self::User(msg.into())
    }

    /// String form written into `ResponseMsg.err`. The empty string means
    /// success and is produced by the caller, not here.
    #[inline]
    pub fn to_wire(&self) -> String {
        self.to_string()
    }

    /// Parse a `ResponseMsg.err` field. Empty means no error; unknown
    /// strings become [RpcError::User].
    pub fn from_wire(s: &str) -> Option<RpcError> {
        if s.is_empty() {
            return None;
        }
        let e = match s {
            "rpc_not_registered" => Self::NotRegistered,
            "rpc_shape_mismatch" => Self::ShapeMismatch,
            "rpc_queue_full" => Self::QueueFull,
            "rpc_too_many_calls" => Self::TooManyCalls,
            "rpc_not_attached" => Self::NotAttached,
            "rpc_server_offline" => Self::ServerOffline,
            "rpc_server_closing" => Self::ServerClosing,
            "rpc_no_route" => Self::NoRoute,
            "rpc_transport" => Self::Transport,
            "rpc_encode" => Self::Encode,
            _ => match s.strip_prefix("rpc_handler_panic: ") {
                Some(msg) => Self::HandlerPanic(msg.to_string()),
                None => Self::User(s.to_string()),
            },
        };
        Some(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_round_trip() {
        let kinds = vec![
            RpcError::NotRegistered,
            RpcError::ShapeMismatch,
            RpcError::QueueFull,
            RpcError::TooManyCalls,
            RpcError::HandlerPanic("index out of bounds".to_string()),
            RpcError::NotAttached,
            RpcError::ServerOffline,
            RpcError::ServerClosing,
            RpcError::NoRoute,
            RpcError::Transport,
            RpcError::Encode,
            RpcError::user("divide by zero"),
        ];
        for e in kinds {
            let s = e.to_wire();
            assert!(!s.is_empty());
            assert_eq!(RpcError::from_wire(&s), Some(e));
        }
        assert_eq!(RpcError::from_wire(""), None);
    }

    #[test]
    fn test_internal_codes_prefixed() {
        assert!(RpcError::QueueFull.to_wire().starts_with(WIRE_ERR_PREFIX));
        assert!(!RpcError::user("boom").to_wire().starts_with(WIRE_ERR_PREFIX));
    }
}
