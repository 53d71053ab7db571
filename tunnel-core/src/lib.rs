//! Pairing and forwarding engine shared by the `relay` and `agent` binaries.
//!
//! This crate knows nothing about CLI flags, environment variables, or log
//! sinks — it consumes plain configuration structs and a tunnel-key
//! derivation function, and exposes the pieces a binary wires together:
//! listener adapters, the authenticator, the matcher, and the pump.

pub mod auth;
pub mod error;
pub mod keepalive;
pub mod listener;
pub mod matcher;
pub mod pending;
pub mod pipe;
pub mod pump;
pub mod tls;
pub mod tunnel_key;

pub use error::{CoreError, CoreResult};
pub use listener::{Listener, ListenerTransport};
pub use matcher::{Matcher, Side};
pub use pipe::{Connection, PipeRole, SocketPipe};
pub use tunnel_key::{TunnelKeyFn, NULL_KEY};
