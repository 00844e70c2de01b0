//! bosh-server: HTTP binding (long-poll) session layer.
//!
//! - Session registry and creation ([`session::SessionManager`])
//! - Connection multiplexer: rid ordering, hold ceiling, `wait` release
//! - Inactivity timer driven by connection lifecycle events
//! - Stanza forwarding to a [`router::PacketRouter`]
//! - axum front for `/http-bind`

pub mod config;
pub mod router;
pub mod server;
pub mod session;
