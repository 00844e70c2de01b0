//! Binding sessions: session entity, connection multiplexer, inactivity
//! timer, stanza forwarder and the manager that ties them together.

pub mod connection;
pub mod forwarder;
pub mod http_session;
pub mod manager;
pub mod timer;

pub use http_session::HttpSession;
pub use manager::SessionManager;
