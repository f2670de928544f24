use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use super::{ConnectionId, PresenceEvent, Subscription, Transport};
use crate::error::DebateError;
use crate::events::ServerEvent;

#[derive(Default)]
struct Inner {
    connections: HashMap<ConnectionId, mpsc::Sender<Arc<ServerEvent>>>,
    channels: HashMap<String, HashSet<ConnectionId>>,
    memberships: HashMap<ConnectionId, HashSet<String>>,
}

/// One bidirectional socket per connection, each with its own bounded
/// outbound queue. A connection whose queue is full is disconnected.
pub struct SocketTransport {
    inner: Mutex<Inner>,
    presence: broadcast::Sender<PresenceEvent>,
    queue_capacity: usize,
}

impl SocketTransport {
    pub fn new(queue_capacity: usize) -> Self {
        let (presence, _) = broadcast::channel(256);
        Self {
            inner: Mutex::new(Inner::default()),
            presence,
            queue_capacity: queue_capacity.max(1),
        }
    }

    fn leave_all(&self, connection: ConnectionId) {
        let left = {
            let mut inner = self.inner.lock();
            inner.connections.remove(&connection);
            let channels = inner.memberships.remove(&connection).unwrap_or_default();
            for channel in &channels {
                if let Some(members) = inner.channels.get_mut(channel) {
                    members.remove(&connection);
                    if members.is_empty() {
                        inner.channels.remove(channel);
                    }
                }
            }
            channels
        };

        for channel in left {
            let _ = self.presence.send(PresenceEvent::Disconnected {
                channel,
                connection,
            });
        }
    }
}

#[async_trait]
impl Transport for SocketTransport {
    fn name(&self) -> &'static str {
        "socket"
    }

    async fn connect(&self, connection: ConnectionId) -> Subscription {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        self.inner.lock().connections.insert(connection, tx);
        debug!(%connection, "Socket connected");
        Subscription::new(connection, rx)
    }

    async fn subscribe(&self, channel: &str, connection: ConnectionId) -> Result<(), DebateError> {
        {
            let mut inner = self.inner.lock();
            if !inner.connections.contains_key(&connection) {
                return Err(DebateError::Transport(format!(
                    "connection {} is not connected",
                    connection
                )));
            }
            let joined = inner
                .memberships
                .entry(connection)
                .or_default()
                .insert(channel.to_string());
            inner
                .channels
                .entry(channel.to_string())
                .or_default()
                .insert(connection);
            if !joined {
                return Ok(());
            }
        }
        let _ = self.presence.send(PresenceEvent::Connected {
            channel: channel.to_string(),
            connection,
        });
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str, connection: ConnectionId) {
        let removed = {
            let mut inner = self.inner.lock();
            let removed = inner
                .memberships
                .get_mut(&connection)
                .is_some_and(|channels| channels.remove(channel));
            if let Some(members) = inner.channels.get_mut(channel) {
                members.remove(&connection);
                if members.is_empty() {
                    inner.channels.remove(channel);
                }
            }
            removed
        };
        if removed {
            let _ = self.presence.send(PresenceEvent::Disconnected {
                channel: channel.to_string(),
                connection,
            });
        }
    }

    async fn publish(&self, channel: &str, event: ServerEvent) -> Result<usize, DebateError> {
        let event = Arc::new(event);
        let mut delivered = 0;
        let mut dropped = Vec::new();
        {
            let inner = self.inner.lock();
            let Some(members) = inner.channels.get(channel) else {
                return Ok(0);
            };
            for connection in members {
                let Some(tx) = inner.connections.get(connection) else {
                    continue;
                };
                match tx.try_send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        warn!(%connection, channel, event = event.name(), "Outbound queue full, dropping slow connection");
                        dropped.push(*connection);
                    }
                    Err(TrySendError::Closed(_)) => dropped.push(*connection),
                }
            }
        }
        for connection in dropped {
            self.leave_all(connection);
        }
        Ok(delivered)
    }

    async fn send_to(&self, connection: ConnectionId, event: ServerEvent) -> Result<(), DebateError> {
        let tx = self
            .inner
            .lock()
            .connections
            .get(&connection)
            .cloned()
            .ok_or_else(|| DebateError::Transport(format!("connection {} is not connected", connection)))?;
        tx.try_send(Arc::new(event)).map_err(|e| {
            DebateError::Transport(format!("could not reach connection {}: {}", connection, e))
        })
    }

    fn members(&self, channel: &str) -> Vec<ConnectionId> {
        self.inner
            .lock()
            .channels
            .get(channel)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    fn presence(&self) -> broadcast::Receiver<PresenceEvent> {
        self.presence.subscribe()
    }

    async fn disconnect(&self, connection: ConnectionId) {
        debug!(%connection, "Socket disconnected");
        self.leave_all(connection);
    }
}
