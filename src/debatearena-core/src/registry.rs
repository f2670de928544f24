//! Registry of live sessions and the connections bound to them.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DebateError;
use crate::events::{ClientEvent, ServerEvent, SessionId, StartDebate};
use crate::session::{SessionContext, SessionHandle};
use crate::state::Outcome;
use crate::transport::{ConnectionId, PresenceEvent};

struct SessionEntry {
    /// Distinguishes a re-created session from the one a watcher was spawned for.
    instance: Uuid,
    handle: SessionHandle,
    teardown: Option<Teardown>,
}

/// A pending end of an abandoned session.
struct Teardown {
    id: Uuid,
    token: CancellationToken,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, SessionEntry>,
    /// Ids claimed by a `startDebate` whose actor is not registered yet.
    reserved: HashSet<SessionId>,
    connections: HashMap<ConnectionId, SessionId>,
}

/// Holds a session id until the started session is registered.
struct Reservation<'a> {
    registry: &'a SessionRegistry,
    session_id: SessionId,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.registry.inner.lock().reserved.remove(&self.session_id);
    }
}

pub struct SessionRegistry {
    ctx: SessionContext,
    capacity: usize,
    grace_period: Duration,
    inner: Mutex<Inner>,
    shutdown: CancellationToken,
}

impl SessionRegistry {
    /// Create the registry and start watching transport presence.
    pub fn new(ctx: SessionContext) -> Arc<Self> {
        let registry = Arc::new(Self {
            capacity: ctx.config.server.max_sessions.max(1),
            grace_period: ctx.config.server.grace_period(),
            inner: Mutex::new(Inner::default()),
            shutdown: CancellationToken::new(),
            ctx,
        });
        tokio::spawn(presence_loop(
            Arc::downgrade(&registry),
            registry.ctx.transport.presence(),
            registry.shutdown.clone(),
        ));
        registry
    }

    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, session_id: &str) -> Option<SessionHandle> {
        self.inner
            .lock()
            .sessions
            .get(session_id)
            .map(|entry| entry.handle.clone())
    }

    pub fn session_for(&self, connection: ConnectionId) -> Option<SessionId> {
        self.inner.lock().connections.get(&connection).cloned()
    }

    /// Parse one inbound frame and route it. Failures are reported to the
    /// sending connection as `debateError`.
    pub async fn handle_frame(self: &Arc<Self>, connection: ConnectionId, frame: &str) {
        let result = match ClientEvent::parse(frame) {
            Ok(event) => self.route(connection, event).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            self.report_error(connection, &e).await;
        }
    }

    /// Send `debateError` to a single connection.
    pub async fn report_error(&self, connection: ConnectionId, err: &DebateError) {
        if err.is_client_error() {
            debug!(%connection, error = %err, "Client event rejected");
        } else {
            warn!(%connection, error = %err, "Client event failed");
        }
        if let Err(send_err) = self.ctx.transport.send_to(connection, ServerEvent::error(err)).await {
            warn!(%connection, error = %send_err, "Could not report error to connection");
        }
    }

    pub async fn route(self: &Arc<Self>, connection: ConnectionId, event: ClientEvent) -> Result<(), DebateError> {
        debug!(%connection, event = event.name(), "Routing client event");
        match event {
            ClientEvent::StartDebate(start) => self.start_session(connection, start).await.map(|_| ()),
            ClientEvent::JoinDebate { session_id } => self.join(connection, &session_id).await,
            ClientEvent::SubmitSpeech {
                participant_id,
                text,
                phase,
            } => {
                self.bound_session(connection)?
                    .submit_speech(participant_id, text, phase)
                    .await
            }
            ClientEvent::EndDebate => {
                self.bound_session(connection)?
                    .end(Outcome::Aborted {
                        reason: "ended by participant".to_string(),
                    })
                    .await
            }
        }
    }

    /// Create the session for a `startDebate` and bind the starter to it.
    pub async fn start_session(
        self: &Arc<Self>,
        connection: ConnectionId,
        start: StartDebate,
    ) -> Result<SessionHandle, DebateError> {
        let StartDebate {
            session_id,
            topic,
            participants,
        } = start;
        let reservation = self.reserve(&session_id)?;

        // The starter must be on the channel before the first state update goes out.
        self.ctx.transport.subscribe(&session_id, connection).await?;
        let handle = match SessionHandle::spawn(session_id.clone(), topic, participants, self.ctx.clone()) {
            Ok(handle) => handle,
            Err(e) => {
                self.ctx.transport.unsubscribe(&session_id, connection).await;
                return Err(e);
            }
        };

        let instance = Uuid::new_v4();
        let previous = {
            let mut inner = self.inner.lock();
            inner.reserved.remove(&session_id);
            inner.sessions.insert(
                session_id.clone(),
                SessionEntry {
                    instance,
                    handle: handle.clone(),
                    teardown: None,
                },
            );
            inner.connections.insert(connection, session_id.clone())
        };
        drop(reservation);
        self.leave_previous(connection, previous, &session_id).await;
        info!(%session_id, %connection, sessions = self.len(), "Session started");

        self.watch(session_id, instance, handle.clone());
        Ok(handle)
    }

    /// Bind a connection to a running session and send it the current state.
    pub async fn join(&self, connection: ConnectionId, session_id: &str) -> Result<(), DebateError> {
        let handle = self
            .get(session_id)
            .ok_or_else(|| DebateError::SessionNotFound(session_id.to_string()))?;
        self.ctx.transport.subscribe(session_id, connection).await?;
        let previous = {
            let mut inner = self.inner.lock();
            if let Some(teardown) = inner
                .sessions
                .get_mut(session_id)
                .and_then(|entry| entry.teardown.take())
            {
                teardown.token.cancel();
            }
            inner.connections.insert(connection, session_id.to_string())
        };
        self.leave_previous(connection, previous, session_id).await;
        info!(session_id, %connection, "Connection joined session");

        let snapshot = handle.snapshot().await?;
        self.ctx
            .transport
            .send_to(connection, ServerEvent::DebateStateUpdate(snapshot))
            .await
    }

    /// Forget a connection that closed.
    pub async fn disconnect(&self, connection: ConnectionId) {
        self.inner.lock().connections.remove(&connection);
        self.ctx.transport.disconnect(connection).await;
    }

    /// End every session and stop watching presence.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<SessionHandle> = {
            let mut inner = self.inner.lock();
            inner.connections.clear();
            inner.sessions.drain().map(|(_, entry)| entry.handle).collect()
        };
        info!(sessions = handles.len(), "Shutting down sessions");
        for handle in &handles {
            let ended = handle
                .end(Outcome::Aborted {
                    reason: "server shutting down".to_string(),
                })
                .await;
            if ended.is_err() {
                handle.cancel();
            }
        }
        for handle in handles {
            handle.finished().await;
        }
    }

    fn bound_session(&self, connection: ConnectionId) -> Result<SessionHandle, DebateError> {
        let inner = self.inner.lock();
        let session_id = inner
            .connections
            .get(&connection)
            .ok_or_else(|| DebateError::SessionNotFound(format!("connection {} has not joined a session", connection)))?;
        inner
            .sessions
            .get(session_id)
            .map(|entry| entry.handle.clone())
            .ok_or_else(|| DebateError::SessionNotFound(session_id.clone()))
    }

    /// Claim a free session id, counting claims in flight against capacity.
    fn reserve(&self, session_id: &str) -> Result<Reservation<'_>, DebateError> {
        let mut inner = self.inner.lock();
        if inner.sessions.contains_key(session_id) || inner.reserved.contains(session_id) {
            return Err(DebateError::SessionExists(session_id.to_string()));
        }
        if inner.sessions.len() + inner.reserved.len() >= self.capacity {
            return Err(DebateError::RegistryFull {
                capacity: self.capacity,
            });
        }
        inner.reserved.insert(session_id.to_string());
        Ok(Reservation {
            registry: self,
            session_id: session_id.to_string(),
        })
    }

    /// Leave the channel of the session a connection was bound to before.
    async fn leave_previous(&self, connection: ConnectionId, previous: Option<SessionId>, current: &str) {
        let Some(previous) = previous.filter(|p| p.as_str() != current) else {
            return;
        };
        debug!(%connection, from = %previous, to = current, "Connection rebound");
        self.ctx.transport.unsubscribe(&previous, connection).await;
    }

    /// Remove the session once its actor exits.
    fn watch(self: &Arc<Self>, session_id: SessionId, instance: Uuid, handle: SessionHandle) {
        let done = handle.done_token();
        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            done.cancelled().await;
            if let Some(registry) = registry.upgrade() {
                registry.remove(&session_id, instance);
            }
        });
    }

    fn remove(&self, session_id: &str, instance: Uuid) {
        let mut inner = self.inner.lock();
        if inner.sessions.get(session_id).is_some_and(|e| e.instance == instance) {
            inner.sessions.remove(session_id);
            inner.connections.retain(|_, bound| bound.as_str() != session_id);
            info!(session_id, sessions = inner.sessions.len(), "Session removed");
        }
    }

    fn on_presence(self: &Arc<Self>, event: PresenceEvent) {
        match event {
            PresenceEvent::Connected { channel, .. } => {
                let mut inner = self.inner.lock();
                if let Some(teardown) = inner
                    .sessions
                    .get_mut(&channel)
                    .and_then(|entry| entry.teardown.take())
                {
                    debug!(session_id = %channel, "Member rejoined, teardown cancelled");
                    teardown.token.cancel();
                }
            }
            PresenceEvent::Disconnected { channel, .. } => self.schedule_teardown_if_empty(&channel),
        }
    }

    fn schedule_teardown_if_empty(self: &Arc<Self>, session_id: &str) {
        if !self.ctx.transport.members(session_id).is_empty() {
            return;
        }
        let (id, token) = {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.sessions.get_mut(session_id) else {
                return;
            };
            if entry.teardown.is_some() {
                return;
            }
            let teardown = Teardown {
                id: Uuid::new_v4(),
                token: CancellationToken::new(),
            };
            let scheduled = (teardown.id, teardown.token.clone());
            entry.teardown = Some(teardown);
            scheduled
        };
        info!(session_id, grace_period = ?self.grace_period, "All members left, scheduling teardown");

        let registry = Arc::downgrade(self);
        let session_id = session_id.to_string();
        let grace_period = self.grace_period;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(grace_period) => {}
            }
            if let Some(registry) = registry.upgrade() {
                registry.teardown(&session_id, id).await;
            }
        });
    }

    async fn teardown(&self, session_id: &str, id: Uuid) {
        let handle = {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.sessions.get(session_id) else {
                return;
            };
            let scheduled = entry.teardown.as_ref().is_some_and(|t| t.id == id);
            if !scheduled || !self.ctx.transport.members(session_id).is_empty() {
                return;
            }
            let entry = inner.sessions.remove(session_id);
            inner.connections.retain(|_, bound| bound.as_str() != session_id);
            entry.map(|e| e.handle)
        };
        let Some(handle) = handle else {
            return;
        };
        info!(session_id, "Grace period expired, ending abandoned session");
        if handle
            .end(Outcome::Aborted {
                reason: "all participants left".to_string(),
            })
            .await
            .is_err()
        {
            handle.cancel();
        }
    }

    /// Re-check every session after missed presence events.
    fn sweep(self: &Arc<Self>) {
        let ids: Vec<SessionId> = self.inner.lock().sessions.keys().cloned().collect();
        for id in ids {
            self.schedule_teardown_if_empty(&id);
        }
    }
}

async fn presence_loop(
    registry: Weak<SessionRegistry>,
    mut presence: broadcast::Receiver<PresenceEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            event = presence.recv() => event,
        };
        let Some(registry) = registry.upgrade() else {
            break;
        };
        match event {
            Ok(event) => {
                debug!(channel = event.channel(), "Presence changed");
                registry.on_presence(event);
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Presence watcher lagged, re-checking sessions");
                registry.sweep();
            }
            Err(RecvError::Closed) => break,
        }
    }
    debug!("Presence watcher stopped");
}
