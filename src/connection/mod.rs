//! Connection lifecycle on top of the authenticated transport

pub mod backoff;
pub mod envelope;
pub mod manager;

pub use backoff::ReconnectPolicy;
pub use envelope::{JsonObject, MessageHandler};
pub use manager::{ConnectionManager, ConnectionState, ManagerSettings};
