use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ConnectionId, PresenceEvent, Subscription, Transport};
use crate::error::DebateError;
use crate::events::ServerEvent;

struct Connection {
    sender: mpsc::Sender<Arc<ServerEvent>>,
    /// Forwarder task per joined channel.
    forwarders: HashMap<String, CancellationToken>,
}

struct Channel {
    sender: broadcast::Sender<Arc<ServerEvent>>,
    members: HashSet<ConnectionId>,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<ConnectionId, Connection>,
    channels: HashMap<String, Channel>,
}

/// Managed broadcast channel per session; membership is presence.
///
/// Each member gets a forwarder task that copies the channel's broadcast into
/// the member's outbound queue. A member that lags behind a channel is
/// disconnected, like a full socket queue.
pub struct ChannelTransport {
    inner: Arc<Mutex<Inner>>,
    presence: broadcast::Sender<PresenceEvent>,
    capacity: usize,
}

impl ChannelTransport {
    pub fn new(capacity: usize) -> Self {
        let (presence, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            presence,
            capacity: capacity.max(1),
        }
    }

    /// Detach `connection` from `channel`; returns whether it was a member.
    fn leave(inner: &mut Inner, channel: &str, connection: ConnectionId) -> bool {
        if let Some(conn) = inner.connections.get_mut(&connection) {
            if let Some(token) = conn.forwarders.remove(channel) {
                token.cancel();
            }
        }
        let Some(entry) = inner.channels.get_mut(channel) else {
            return false;
        };
        let removed = entry.members.remove(&connection);
        if entry.members.is_empty() {
            inner.channels.remove(channel);
        }
        removed
    }

    /// Remove `connection` and all its memberships; returns the channels it left.
    fn drop_connection(inner: &mut Inner, connection: ConnectionId) -> Vec<String> {
        let channels: Vec<String> = inner
            .connections
            .get(&connection)
            .map(|c| c.forwarders.keys().cloned().collect())
            .unwrap_or_default();
        let left = channels
            .into_iter()
            .filter(|channel| Self::leave(inner, channel, connection))
            .collect();
        inner.connections.remove(&connection);
        left
    }
}

fn announce_left(presence: &broadcast::Sender<PresenceEvent>, channels: Vec<String>, connection: ConnectionId) {
    for channel in channels {
        let _ = presence.send(PresenceEvent::Disconnected {
            channel,
            connection,
        });
    }
}

struct Forwarder {
    channel: String,
    connection: ConnectionId,
    rx: broadcast::Receiver<Arc<ServerEvent>>,
    tx: mpsc::Sender<Arc<ServerEvent>>,
    cancel: CancellationToken,
    inner: Weak<Mutex<Inner>>,
    presence: broadcast::Sender<PresenceEvent>,
}

async fn forward(forwarder: Forwarder) {
    let Forwarder {
        channel,
        connection,
        mut rx,
        tx,
        cancel,
        inner,
        presence,
    } = forwarder;

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = rx.recv() => event,
        };
        match event {
            Ok(event) => {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(%connection, channel, skipped, "Member lagged behind channel, disconnecting");
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                let left = {
                    let mut inner = inner.lock();
                    // A reconnect under the same id owns a new queue; leave it alone.
                    let current = inner
                        .connections
                        .get(&connection)
                        .is_some_and(|c| c.sender.same_channel(&tx));
                    if current {
                        ChannelTransport::drop_connection(&mut inner, connection)
                    } else {
                        Vec::new()
                    }
                };
                announce_left(&presence, left, connection);
                break;
            }
            Err(RecvError::Closed) => break,
        }
    }
    debug!(%connection, channel, "Channel forwarder stopped");
}

#[async_trait]
impl Transport for ChannelTransport {
    fn name(&self) -> &'static str {
        "channel"
    }

    async fn connect(&self, connection: ConnectionId) -> Subscription {
        let (sender, rx) = mpsc::channel(self.capacity);
        let previous = self.inner.lock().connections.insert(
            connection,
            Connection {
                sender,
                forwarders: HashMap::new(),
            },
        );
        if let Some(previous) = previous {
            for token in previous.forwarders.values() {
                token.cancel();
            }
        }
        Subscription::new(connection, rx)
    }

    async fn subscribe(&self, channel: &str, connection: ConnectionId) -> Result<(), DebateError> {
        {
            let mut inner = self.inner.lock();
            let Inner {
                connections,
                channels,
            } = &mut *inner;
            let conn = connections.get_mut(&connection).ok_or_else(|| {
                DebateError::Transport(format!("connection {} is not connected", connection))
            })?;
            if conn.forwarders.contains_key(channel) {
                return Ok(());
            }

            let entry = channels.entry(channel.to_string()).or_insert_with(|| Channel {
                sender: broadcast::channel(self.capacity).0,
                members: HashSet::new(),
            });
            entry.members.insert(connection);

            let token = CancellationToken::new();
            conn.forwarders.insert(channel.to_string(), token.clone());
            tokio::spawn(forward(Forwarder {
                channel: channel.to_string(),
                connection,
                rx: entry.sender.subscribe(),
                tx: conn.sender.clone(),
                cancel: token,
                inner: Arc::downgrade(&self.inner),
                presence: self.presence.clone(),
            }));
        }
        let _ = self.presence.send(PresenceEvent::Connected {
            channel: channel.to_string(),
            connection,
        });
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str, connection: ConnectionId) {
        let removed = Self::leave(&mut self.inner.lock(), channel, connection);
        if removed {
            let _ = self.presence.send(PresenceEvent::Disconnected {
                channel: channel.to_string(),
                connection,
            });
        }
    }

    async fn publish(&self, channel: &str, event: ServerEvent) -> Result<usize, DebateError> {
        let inner = self.inner.lock();
        let Some(entry) = inner.channels.get(channel) else {
            return Ok(0);
        };
        // No receivers is not an error for a broadcast.
        Ok(entry.sender.send(Arc::new(event)).unwrap_or(0))
    }

    async fn send_to(&self, connection: ConnectionId, event: ServerEvent) -> Result<(), DebateError> {
        let sender = self
            .inner
            .lock()
            .connections
            .get(&connection)
            .map(|c| c.sender.clone())
            .ok_or_else(|| DebateError::Transport(format!("connection {} is not connected", connection)))?;
        sender.try_send(Arc::new(event)).map_err(|e| {
            DebateError::Transport(format!("could not reach connection {}: {}", connection, e))
        })
    }

    fn members(&self, channel: &str) -> Vec<ConnectionId> {
        self.inner
            .lock()
            .channels
            .get(channel)
            .map(|entry| entry.members.iter().copied().collect())
            .unwrap_or_default()
    }

    fn presence(&self) -> broadcast::Receiver<PresenceEvent> {
        self.presence.subscribe()
    }

    async fn disconnect(&self, connection: ConnectionId) {
        let left = Self::drop_connection(&mut self.inner.lock(), connection);
        announce_left(&self.presence, left, connection);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_lagging_member_is_disconnected() {
        let transport = ChannelTransport::new(2);
        let a = Uuid::new_v4();
        let mut presence = transport.presence();
        let mut slow = transport.connect(a).await;
        transport.subscribe("s1", a).await.unwrap();
        transport.subscribe("s2", a).await.unwrap();

        for seq in 0..10 {
            transport
                .publish(
                    "s1",
                    ServerEvent::AiSpeechAudioChunk {
                        job_id: Uuid::nil(),
                        seq,
                        audio: bytes::Bytes::new(),
                    },
                )
                .await
                .unwrap();
        }
        transport
            .publish("s1", ServerEvent::AiSpeechAudioEnd { job_id: Uuid::nil() })
            .await
            .unwrap();

        let mut seqs = Vec::new();
        let closed = tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while let Some(event) = slow.recv().await {
                if let ServerEvent::AiSpeechAudioChunk { seq, .. } = event.as_ref() {
                    seqs.push(*seq);
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "lagging subscription should be closed");
        assert!(seqs.windows(2).all(|w| w[1] == w[0] + 1));

        assert!(transport.members("s1").is_empty());
        assert!(transport.members("s2").is_empty());
        assert!(transport.send_to(a, ServerEvent::AiSpeechAudioEnd { job_id: Uuid::nil() }).await.is_err());

        let mut left = Vec::new();
        while let Ok(event) = presence.try_recv() {
            if let PresenceEvent::Disconnected { channel, connection } = event {
                assert_eq!(connection, a);
                left.push(channel);
            }
        }
        left.sort();
        assert_eq!(left, vec!["s1".to_string(), "s2".to_string()]);
    }

    #[tokio::test]
    async fn test_last_member_leaving_removes_channel() {
        let transport = ChannelTransport::new(4);
        let a = Uuid::new_v4();
        let _sub = transport.connect(a).await;
        transport.subscribe("s1", a).await.unwrap();
        transport.unsubscribe("s1", a).await;
        let event = ServerEvent::AiSpeechAudioEnd { job_id: Uuid::nil() };
        assert_eq!(transport.publish("s1", event).await.unwrap(), 0);
    }
}
