//! Streaming transport seam.
//!
//! A [`Transport`] opens one session per connection attempt; the session is
//! already past the protocol-level connect acknowledgement when handed back.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::constants::{DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_KEEP_ALIVE_SECS};
use crate::error::TransportError;

pub mod packet;
pub mod websocket;

pub use websocket::MqttWsTransport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    /// Bounds the upgrade plus the protocol connect handshake
    pub connect_timeout: Duration,
    pub keep_alive_secs: u16,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            keep_alive_secs: DEFAULT_KEEP_ALIVE_SECS,
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connected session against a presigned URL
    async fn open(
        &self,
        url: &str,
        client_id: &str,
    ) -> Result<Box<dyn TransportSession>, TransportError>;
}

#[async_trait]
pub trait TransportSession: Send {
    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError>;

    /// Next inbound message in delivery order; an error ends the session
    async fn next_message(&mut self) -> Result<InboundMessage, TransportError>;

    /// Graceful teardown; errors are irrelevant at this point
    async fn close(&mut self);
}
