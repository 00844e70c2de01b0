//! bosh-core: Shared protocol library for the HTTP binding.
//!
//! Provides the generic element tree that stands in for parsed stanzas, the
//! `<body/>` envelope (inbound request root, creation/payload/terminate
//! responses), and the binding error taxonomy.

pub mod body;
pub mod element;
pub mod error;

// Re-export commonly used items at crate root.
pub use body::{
    error_body, payload_body, terminate_body, BodyRequest, SessionCreationResponse, HTTPBIND_NAMESPACE,
};
pub use element::{Element, Node};
pub use error::{BindError, BoshError, BoshResult};
