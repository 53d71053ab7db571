use std::sync::Arc;

/// The sentinel value used when TLS or client-certificate authentication is
/// not in use. Under the default configuration every peer collapses onto
/// this key, so the pairing queues degenerate to a single queue.
pub const NULL_KEY: &str = "";

/// A pluggable, pure transformation from a verified peer certificate subject
/// to an opaque tunnel-key string. Implementations MUST NOT mutate process
/// state from inside the closure — it runs on the accept path of both
/// listeners and is called once per accepted connection.
pub type TunnelKeyFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// The default derivation: identity. A verified CN of `"A"` becomes the
/// tunnel key `"A"`.
pub fn identity_tunnel_key() -> TunnelKeyFn {
    Arc::new(|cn: &str| cn.to_string())
}
