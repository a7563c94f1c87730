use serde::Deserialize;

/// Node configuration. The embedder decides where it is loaded from; the
/// struct deserializes from any serde source with unset fields defaulted.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// This node's identity, announced to every peer on connect.
    pub server_name: String,
    /// TCP listen address; empty means do not listen.
    pub listen_addr: String,
    /// Peer addresses to dial, with auto-reconnect.
    pub conn_addrs: Vec<String>,
    /// Per-connection outbound queue capacity.
    pub pending_write_num: usize,
    /// Seconds between heartbeats; values <= 0 fall back to 5.
    pub heart_beat_interval: i64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            server_name: String::new(),
            listen_addr: String::new(),
            conn_addrs: Vec::new(),
            pending_write_num: 1000,
            heart_beat_interval: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_deserialize() {
        let cfg: ClusterConfig =
            serde_json::from_str(r#"{"server_name": "gate", "listen_addr": "127.0.0.1:9301"}"#)
                .expect("config");
        assert_eq!(cfg.server_name, "gate");
        assert_eq!(cfg.listen_addr, "127.0.0.1:9301");
        assert_eq!(cfg.heart_beat_interval, 5);
        assert!(cfg.conn_addrs.is_empty());
    }
}
