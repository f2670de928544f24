//! Transport abstraction: one event protocol over interchangeable backends.
//!
//! A connection first `connect`s to obtain its outbound `Subscription`, then
//! joins session channels with `subscribe`. Everything published to a
//! channel reaches every member's subscription in publish order.

mod channel;
mod socket;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::config::{ServerConfig, TransportKind};
use crate::error::DebateError;
use crate::events::ServerEvent;

pub use channel::ChannelTransport;
pub use socket::SocketTransport;

pub type ConnectionId = Uuid;

/// Membership change on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    Connected {
        channel: String,
        connection: ConnectionId,
    },
    Disconnected {
        channel: String,
        connection: ConnectionId,
    },
}

impl PresenceEvent {
    pub fn channel(&self) -> &str {
        match self {
            PresenceEvent::Connected { channel, .. } | PresenceEvent::Disconnected { channel, .. } => {
                channel
            }
        }
    }
}

/// Outbound event stream of one connection.
pub struct Subscription {
    connection: ConnectionId,
    receiver: mpsc::Receiver<Arc<ServerEvent>>,
}

impl Subscription {
    pub(crate) fn new(connection: ConnectionId, receiver: mpsc::Receiver<Arc<ServerEvent>>) -> Self {
        Self {
            connection,
            receiver,
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Next event; `None` once the transport dropped the connection.
    pub async fn recv(&mut self) -> Option<Arc<ServerEvent>> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<ServerEvent>> {
        self.receiver.try_recv().ok()
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Register a connection. Connecting an id twice replaces the old queue.
    async fn connect(&self, connection: ConnectionId) -> Subscription;

    async fn subscribe(&self, channel: &str, connection: ConnectionId) -> Result<(), DebateError>;

    async fn unsubscribe(&self, channel: &str, connection: ConnectionId);

    /// Deliver an event to every member of `channel`; returns how many received it.
    async fn publish(&self, channel: &str, event: ServerEvent) -> Result<usize, DebateError>;

    /// Deliver an event to a single connection.
    async fn send_to(&self, connection: ConnectionId, event: ServerEvent) -> Result<(), DebateError>;

    fn members(&self, channel: &str) -> Vec<ConnectionId>;

    fn presence(&self) -> broadcast::Receiver<PresenceEvent>;

    /// Drop a connection and leave all its channels.
    async fn disconnect(&self, connection: ConnectionId);
}

/// Build the configured backend.
pub fn from_config(config: &ServerConfig) -> Arc<dyn Transport> {
    match config.transport {
        TransportKind::Socket => Arc::new(SocketTransport::new(config.connection_queue)),
        TransportKind::Channel => Arc::new(ChannelTransport::new(config.connection_queue)),
    }
}
