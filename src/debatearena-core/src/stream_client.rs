//! Reconnecting client for the streaming speech-synthesis provider.
//!
//! One client serves one audio job. Text goes out as numbered segments;
//! the provider answers each segment with audio frames followed by a
//! segment-final marker. On an abnormal close the client reconnects with
//! exponential backoff, re-sends every segment that was not yet finalized,
//! then flushes segments queued while disconnected, in order.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{StreamingConfig, SynthesisConfig};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StreamError {
    #[error("failed to connect to synthesis stream: {0}")]
    Connect(String),
    #[error("synthesis stream closed abnormally (code {code:?}): {reason}")]
    Closed { code: Option<u16>, reason: String },
    #[error("synthesis stream protocol error: {0}")]
    Protocol(String),
    #[error("synthesis stream unavailable after {attempts} reconnect attempts")]
    Exhausted { attempts: u32 },
    #[error("synthesis stream cancelled")]
    Cancelled,
}

/// One piece of text sent to the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSegment {
    pub id: u32,
    pub text: String,
}

/// Frame received from the provider.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderFrame {
    Audio { segment_id: u32, data: Bytes },
    SegmentDone { segment_id: u32 },
}

/// Frame handed to the caller of `ReconnectingStreamClient::recv`.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    Audio { segment_id: u32, data: Bytes },
    SegmentDone { segment_id: u32 },
    /// The connection was re-established; audio of unfinished segments will be re-sent from the start.
    Resumed,
}

/// A live connection to the provider.
#[async_trait]
pub trait StreamConnection: Send + Sync {
    async fn send(&mut self, segment: &TextSegment) -> Result<(), StreamError>;
    /// `None` once the provider closed the stream normally.
    async fn recv(&mut self) -> Option<Result<ProviderFrame, StreamError>>;
    async fn close(&mut self);
}

/// Opens provider connections.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self, voice_id: &str) -> Result<Box<dyn StreamConnection>, StreamError>;
}

/// Reconnect budget and backoff curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub connect_timeout: Duration,
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (0-based): `base * 2^attempt`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl From<&StreamingConfig> for ReconnectPolicy {
    fn from(config: &StreamingConfig) -> Self {
        Self {
            max_attempts: config.max_reconnect_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms.max(config.base_delay_ms)),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms.max(1)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connected,
    Disconnected,
    /// Closed normally by either side.
    Closed,
    /// Reconnect budget exhausted.
    Failed,
}

pub struct ReconnectingStreamClient {
    connector: Arc<dyn StreamConnector>,
    voice_id: String,
    policy: ReconnectPolicy,
    cancel: CancellationToken,
    conn: Option<Box<dyn StreamConnection>>,
    state: ConnectionState,
    /// Segments waiting for a live connection.
    queue: VecDeque<TextSegment>,
    /// Segments sent on the current connection and not yet finalized.
    unacked: VecDeque<TextSegment>,
    attempts: u32,
}

impl ReconnectingStreamClient {
    pub fn new(
        connector: Arc<dyn StreamConnector>,
        voice_id: impl Into<String>,
        policy: ReconnectPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            connector,
            voice_id: voice_id.into(),
            policy,
            cancel,
            conn: None,
            state: ConnectionState::Idle,
            queue: VecDeque::new(),
            unacked: VecDeque::new(),
            attempts: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Reconnect attempts consumed so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Open the first connection. A failed first try draws on the reconnect budget.
    pub async fn connect(&mut self) -> Result<(), StreamError> {
        match self.open().await {
            Ok(conn) => {
                self.conn = Some(conn);
                self.state = ConnectionState::Connected;
                Ok(())
            }
            Err(StreamError::Cancelled) => Err(StreamError::Cancelled),
            Err(e) => {
                warn!(voice_id = %self.voice_id, error = %e, "Initial synthesis stream connect failed");
                self.state = ConnectionState::Disconnected;
                self.reconnect().await
            }
        }
    }

    /// Send a segment, or queue it while disconnected.
    pub async fn send(&mut self, segment: TextSegment) -> Result<(), StreamError> {
        match self.state {
            ConnectionState::Failed => {
                return Err(StreamError::Exhausted {
                    attempts: self.attempts,
                });
            }
            ConnectionState::Closed => {
                return Err(StreamError::Protocol("stream already closed".to_string()));
            }
            _ => {}
        }

        self.queue.push_back(segment);
        if self.conn.is_some() {
            if let Err(e) = self.flush().await {
                debug!(voice_id = %self.voice_id, error = %e, "Send failed, segment stays queued");
            }
        }
        Ok(())
    }

    /// Next frame from the provider, reconnecting transparently on abnormal closes.
    ///
    /// Returns `Ok(None)` when the provider closed the stream normally.
    pub async fn recv(&mut self) -> Result<Option<StreamFrame>, StreamError> {
        loop {
            if self.state == ConnectionState::Closed {
                return Ok(None);
            }
            if self.conn.is_none() {
                self.reconnect().await?;
                return Ok(Some(StreamFrame::Resumed));
            }
            let Some(conn) = self.conn.as_mut() else {
                continue;
            };

            let frame = tokio::select! {
                _ = self.cancel.cancelled() => return Err(StreamError::Cancelled),
                frame = conn.recv() => frame,
            };

            match frame {
                Some(Ok(ProviderFrame::Audio { segment_id, data })) => {
                    return Ok(Some(StreamFrame::Audio { segment_id, data }));
                }
                Some(Ok(ProviderFrame::SegmentDone { segment_id })) => {
                    match self.unacked.front() {
                        Some(front) if front.id == segment_id => {
                            self.unacked.pop_front();
                        }
                        _ => {
                            return Err(StreamError::Protocol(format!(
                                "segment {} finalized out of order",
                                segment_id
                            )));
                        }
                    }
                    return Ok(Some(StreamFrame::SegmentDone { segment_id }));
                }
                None => {
                    debug!(voice_id = %self.voice_id, "Synthesis stream closed normally");
                    self.conn = None;
                    self.state = ConnectionState::Closed;
                    return Ok(None);
                }
                Some(Err(e)) => {
                    warn!(
                        voice_id = %self.voice_id,
                        error = %e,
                        unacked = self.unacked.len(),
                        queued = self.queue.len(),
                        "Synthesis stream dropped"
                    );
                    self.conn = None;
                    self.state = ConnectionState::Disconnected;
                }
            }
        }
    }

    /// Close the connection normally.
    pub async fn close(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close().await;
        }
        if self.state != ConnectionState::Failed {
            self.state = ConnectionState::Closed;
        }
    }

    async fn open(&self) -> Result<Box<dyn StreamConnection>, StreamError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(StreamError::Cancelled),
            result = tokio::time::timeout(self.policy.connect_timeout, self.connector.connect(&self.voice_id)) => {
                match result {
                    Ok(conn) => conn,
                    Err(_) => Err(StreamError::Connect(format!(
                        "timed out after {:?}",
                        self.policy.connect_timeout
                    ))),
                }
            }
        }
    }

    async fn reconnect(&mut self) -> Result<(), StreamError> {
        // Unfinished segments go back to the head of the queue in their original order.
        while let Some(segment) = self.unacked.pop_back() {
            self.queue.push_front(segment);
        }

        loop {
            if self.attempts >= self.policy.max_attempts {
                self.state = ConnectionState::Failed;
                warn!(
                    voice_id = %self.voice_id,
                    attempts = self.attempts,
                    "Synthesis stream reconnect budget exhausted"
                );
                return Err(StreamError::Exhausted {
                    attempts: self.attempts,
                });
            }

            let delay = self.policy.delay_for(self.attempts);
            self.attempts += 1;
            debug!(voice_id = %self.voice_id, attempt = self.attempts, ?delay, "Reconnecting synthesis stream");

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(StreamError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }

            match self.open().await {
                Ok(conn) => {
                    self.conn = Some(conn);
                    self.state = ConnectionState::Connected;
                    match self.flush().await {
                        Ok(()) => {
                            info!(
                                voice_id = %self.voice_id,
                                attempt = self.attempts,
                                "Synthesis stream reconnected"
                            );
                            return Ok(());
                        }
                        Err(e) => {
                            warn!(voice_id = %self.voice_id, error = %e, "Flush after reconnect failed");
                        }
                    }
                }
                Err(StreamError::Cancelled) => return Err(StreamError::Cancelled),
                Err(e) => {
                    warn!(voice_id = %self.voice_id, attempt = self.attempts, error = %e, "Reconnect failed");
                }
            }
        }
    }

    /// Send queued segments in order until the queue is empty or the connection fails.
    async fn flush(&mut self) -> Result<(), StreamError> {
        while let Some(segment) = self.queue.pop_front() {
            let Some(conn) = self.conn.as_mut() else {
                self.queue.push_front(segment);
                return Err(StreamError::Protocol("no live connection".to_string()));
            };
            match conn.send(&segment).await {
                Ok(()) => self.unacked.push_back(segment),
                Err(e) => {
                    self.queue.push_front(segment);
                    while let Some(sent) = self.unacked.pop_back() {
                        self.queue.push_front(sent);
                    }
                    self.conn = None;
                    self.state = ConnectionState::Disconnected;
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket connector for ElevenLabs-style multi-context `stream-input` endpoints.
///
/// Each segment is its own context: audio messages carry the context id and
/// the provider sends `isFinal` once the context is closed and rendered.
pub struct WebSocketConnector {
    ws_base: String,
    api_key: String,
    model_id: String,
    output_format: String,
}

impl WebSocketConnector {
    pub fn new(config: &SynthesisConfig, api_key: impl Into<String>) -> Self {
        Self {
            ws_base: config.ws_base.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model_id: config.model_id.clone(),
            output_format: config.output_format.clone(),
        }
    }

    fn url(&self, voice_id: &str) -> String {
        format!(
            "{}/text-to-speech/{}/multi-stream-input?model_id={}&output_format={}",
            self.ws_base, voice_id, self.model_id, self.output_format
        )
    }
}

#[async_trait]
impl StreamConnector for WebSocketConnector {
    async fn connect(&self, voice_id: &str) -> Result<Box<dyn StreamConnection>, StreamError> {
        let (mut ws, _) = connect_async(self.url(voice_id))
            .await
            .map_err(|e| StreamError::Connect(e.to_string()))?;

        let bos = json!({
            "text": " ",
            "voice_settings": { "stability": 0.5, "similarity_boost": 0.8 },
            "xi_api_key": self.api_key,
        });
        ws.send(Message::text(bos.to_string()))
            .await
            .map_err(|e| StreamError::Connect(e.to_string()))?;

        Ok(Box::new(WebSocketConnection { ws }))
    }
}

struct WebSocketConnection {
    ws: WsStream,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProviderMessage {
    #[serde(default)]
    audio: Option<String>,
    #[serde(default)]
    is_final: Option<bool>,
    #[serde(default)]
    context_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

fn context_id(segment_id: u32) -> String {
    format!("seg-{}", segment_id)
}

fn parse_context_id(context: Option<&str>) -> Result<u32, StreamError> {
    context
        .and_then(|c| c.strip_prefix("seg-"))
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| StreamError::Protocol(format!("unknown context id {:?}", context)))
}

fn parse_provider_message(text: &str) -> Result<Option<ProviderFrame>, StreamError> {
    let message: ProviderMessage =
        serde_json::from_str(text).map_err(|e| StreamError::Protocol(e.to_string()))?;
    if let Some(error) = message.error {
        return Err(StreamError::Protocol(error));
    }
    let segment_id = parse_context_id(message.context_id.as_deref())?;
    if message.is_final.unwrap_or(false) {
        return Ok(Some(ProviderFrame::SegmentDone { segment_id }));
    }
    match message.audio {
        Some(encoded) if !encoded.is_empty() => {
            let data = STANDARD
                .decode(encoded.as_bytes())
                .map_err(|e| StreamError::Protocol(format!("bad audio payload: {}", e)))?;
            Ok(Some(ProviderFrame::Audio {
                segment_id,
                data: Bytes::from(data),
            }))
        }
        _ => Ok(None),
    }
}

#[async_trait]
impl StreamConnection for WebSocketConnection {
    async fn send(&mut self, segment: &TextSegment) -> Result<(), StreamError> {
        let context = context_id(segment.id);
        let text = json!({ "text": format!("{} ", segment.text), "context_id": context });
        let close = json!({ "context_id": context, "close_context": true });
        for message in [text, close] {
            self.ws
                .send(Message::text(message.to_string()))
                .await
                .map_err(|e| StreamError::Closed {
                    code: None,
                    reason: e.to_string(),
                })?;
        }
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<ProviderFrame, StreamError>> {
        loop {
            let message = match self.ws.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    return Some(Err(StreamError::Closed {
                        code: None,
                        reason: e.to_string(),
                    }));
                }
                None => {
                    return Some(Err(StreamError::Closed {
                        code: None,
                        reason: "connection closed without close frame".to_string(),
                    }));
                }
            };

            match message {
                Message::Text(text) => match parse_provider_message(text.as_str()) {
                    Ok(Some(frame)) => return Some(Ok(frame)),
                    Ok(None) => continue,
                    Err(e) => return Some(Err(e)),
                },
                Message::Close(Some(frame)) if frame.code == CloseCode::Normal => return None,
                Message::Close(frame) => {
                    return Some(Err(StreamError::Closed {
                        code: frame.as_ref().map(|f| u16::from(f.code)),
                        reason: frame.map(|f| f.reason.to_string()).unwrap_or_default(),
                    }));
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                Message::Binary(_) => {
                    return Some(Err(StreamError::Protocol(
                        "unexpected binary message".to_string(),
                    )));
                }
            }
        }
    }

    async fn close(&mut self) {
        let _ = self
            .ws
            .send(Message::text(json!({ "close_socket": true }).to_string()))
            .await;
        let _ = self.ws.close(None).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedConnector, Step};

    fn policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
            connect_timeout: Duration::from_secs(1),
        }
    }

    fn segment(id: u32) -> TextSegment {
        TextSegment {
            id,
            text: format!("segment {}", id),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = policy(5);
        assert_eq!(p.delay_for(0), Duration::from_millis(100));
        assert_eq!(p.delay_for(1), Duration::from_millis(200));
        assert_eq!(p.delay_for(2), Duration::from_millis(400));
        assert_eq!(p.delay_for(3), Duration::from_millis(400));
        assert_eq!(p.delay_for(40), Duration::from_millis(400));
    }

    #[test]
    fn test_parse_provider_message() {
        let audio = parse_provider_message(r#"{"audio":"YWJj","contextId":"seg-2"}"#).unwrap();
        assert_eq!(
            audio,
            Some(ProviderFrame::Audio {
                segment_id: 2,
                data: Bytes::from_static(b"abc")
            })
        );
        let done = parse_provider_message(r#"{"isFinal":true,"contextId":"seg-2"}"#).unwrap();
        assert_eq!(done, Some(ProviderFrame::SegmentDone { segment_id: 2 }));
        assert!(parse_provider_message(r#"{"error":"quota"}"#).is_err());
        assert!(parse_provider_message(r#"{"audio":"YWJj","contextId":"other"}"#).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unfinished_segment_is_resent_after_drop() {
        let connector = ScriptedConnector::new(vec![
            vec![Step::Audio(0, b"a0"), Step::Drop],
            vec![Step::EchoAll],
        ]);
        let mut client = ReconnectingStreamClient::new(
            connector.clone(),
            "voice",
            policy(3),
            CancellationToken::new(),
        );
        client.connect().await.unwrap();
        client.send(segment(0)).await.unwrap();

        assert_eq!(
            client.recv().await.unwrap(),
            Some(StreamFrame::Audio {
                segment_id: 0,
                data: Bytes::from_static(b"a0")
            })
        );
        // Connection drops before segment 0 is final; it is resent first.
        assert_eq!(client.recv().await.unwrap(), Some(StreamFrame::Resumed));
        assert_eq!(client.attempts(), 1);
        assert_eq!(client.queued(), 0);
        client.send(segment(1)).await.unwrap();

        let mut frames = Vec::new();
        while let Some(frame) = client.recv().await.unwrap() {
            frames.push(frame);
            if frames.len() == 4 {
                break;
            }
        }
        assert_eq!(
            frames,
            vec![
                StreamFrame::Audio {
                    segment_id: 0,
                    data: Bytes::from("audio-0")
                },
                StreamFrame::SegmentDone { segment_id: 0 },
                StreamFrame::Audio {
                    segment_id: 1,
                    data: Bytes::from("audio-1")
                },
                StreamFrame::SegmentDone { segment_id: 1 },
            ]
        );
        assert_eq!(connector.sent(1), vec![segment(0), segment(1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_send_queues_and_flushes_in_order_on_reconnect() {
        let connector = ScriptedConnector::new(vec![vec![], vec![Step::EchoAll]]).fail_sends_after(2);
        let mut client = ReconnectingStreamClient::new(
            connector.clone(),
            "voice",
            policy(3),
            CancellationToken::new(),
        );
        client.connect().await.unwrap();
        client.send(segment(0)).await.unwrap();
        client.send(segment(1)).await.unwrap();
        assert_eq!(client.queued(), 0);

        // The socket breaks on the third send: everything unfinished is queued again.
        client.send(segment(2)).await.unwrap();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.queued(), 3);
        client.send(segment(3)).await.unwrap();
        assert_eq!(client.queued(), 4);

        assert_eq!(client.recv().await.unwrap(), Some(StreamFrame::Resumed));
        assert_eq!(client.attempts(), 1);
        assert_eq!(client.queued(), 0);
        assert_eq!(connector.sent(0), vec![segment(0), segment(1)]);
        assert_eq!(
            connector.sent(1),
            vec![segment(0), segment(1), segment(2), segment(3)]
        );

        let mut done = Vec::new();
        while let Some(frame) = client.recv().await.unwrap() {
            if let StreamFrame::SegmentDone { segment_id } = frame {
                done.push(segment_id);
                if done.len() == 4 {
                    break;
                }
            }
        }
        assert_eq!(done, vec![0, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhaustion_reports_failure() {
        let connector = ScriptedConnector::new(vec![vec![Step::Drop]]).refuse_after(1);
        let mut client = ReconnectingStreamClient::new(
            connector.clone(),
            "voice",
            policy(2),
            CancellationToken::new(),
        );
        client.connect().await.unwrap();
        client.send(segment(0)).await.unwrap();
        assert_eq!(
            client.recv().await,
            Err(StreamError::Exhausted { attempts: 2 })
        );
        assert_eq!(client.state(), ConnectionState::Failed);
        assert!(client.send(segment(1)).await.is_err());
        assert_eq!(connector.connects(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_connect_failure_uses_budget() {
        let connector = ScriptedConnector::new(vec![vec![Step::EchoAll]]).refuse_first(1);
        let mut client = ReconnectingStreamClient::new(
            connector.clone(),
            "voice",
            policy(3),
            CancellationToken::new(),
        );
        client.connect().await.unwrap();
        assert_eq!(client.attempts(), 1);
        assert_eq!(client.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff() {
        let connector = ScriptedConnector::new(vec![vec![Step::Drop]]).refuse_after(1);
        let cancel = CancellationToken::new();
        let mut client = ReconnectingStreamClient::new(
            connector,
            "voice",
            ReconnectPolicy {
                base_delay: Duration::from_secs(60),
                max_delay: Duration::from_secs(60),
                ..policy(3)
            },
            cancel.clone(),
        );
        client.connect().await.unwrap();
        client.send(segment(0)).await.unwrap();
        cancel.cancel();
        assert_eq!(client.recv().await, Err(StreamError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_normal_close_ends_stream() {
        let connector = ScriptedConnector::new(vec![vec![Step::Audio(0, b"x"), Step::Close]]);
        let mut client =
            ReconnectingStreamClient::new(connector, "voice", policy(3), CancellationToken::new());
        client.connect().await.unwrap();
        client.send(segment(0)).await.unwrap();
        assert!(matches!(client.recv().await, Ok(Some(StreamFrame::Audio { .. }))));
        assert_eq!(client.recv().await, Ok(None));
        assert_eq!(client.state(), ConnectionState::Closed);
        assert_eq!(client.attempts(), 0);
    }
}
