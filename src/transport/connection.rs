//! Lifecycle of the single streaming channel to the conversation backend.
//!
//! The manager never touches orchestrator state. Everything it observes is
//! published as a `TransportEvent` on an unbounded channel, stamped with the
//! connection epoch that produced it.

use crate::audio::pcm::PcmFrame;
use crate::config::LiveConfig;
use crate::error::{ReflectaError, Result};
use crate::transport::assembler::ReplyAssembler;
use crate::transport::protocol::{InboundMessage, OutboundMessage};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// API key for the conversation backend.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    api_key: String,
}

impl Credentials {
    pub fn new(api_key: &str) -> Self {
        Self {
            api_key: api_key.trim().to_string(),
        }
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn is_empty(&self) -> bool {
        self.api_key.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEventKind {
    StateChanged(ConnectionState),
    /// A complete reply, assembled from its fragments.
    Reply(String),
    /// Transcribed piece of the user's spoken turn, in arrival order.
    Transcript(String),
    Audio(PcmFrame),
    Interrupted,
    Error(String),
}

/// Something the channel observed, tagged with the connection it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportEvent {
    pub connection: u64,
    pub kind: TransportEventKind,
}

/// Raw message pipes of one open channel, before the handshake.
pub struct LiveChannel {
    pub outbound: mpsc::UnboundedSender<OutboundMessage>,
    pub inbound: mpsc::Receiver<InboundMessage>,
}

/// Opens the underlying channel (websocket, or a scripted mock).
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, credentials: &Credentials) -> Result<LiveChannel>;
}

/// Handshake parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveSettings {
    pub model: String,
    pub voice: String,
    pub handshake_timeout: Duration,
}

impl LiveSettings {
    pub fn from_config(config: &LiveConfig) -> Result<Self> {
        Ok(Self {
            model: config.model.clone(),
            voice: config.voice.clone(),
            handshake_timeout: config.handshake_timeout()?,
        })
    }
}

/// State and event publishing shared with the reader task.
#[derive(Clone)]
struct Publisher {
    state: Arc<watch::Sender<ConnectionState>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    current: Arc<AtomicU64>,
}

impl Publisher {
    /// Returns false once `epoch` has been superseded.
    fn emit(&self, epoch: u64, kind: TransportEventKind) -> bool {
        if self.current.load(Ordering::Acquire) != epoch {
            return false;
        }
        if self
            .events
            .send(TransportEvent {
                connection: epoch,
                kind,
            })
            .is_err()
        {
            debug!(epoch, "transport event receiver dropped");
        }
        true
    }

    fn set_state(&self, epoch: u64, state: ConnectionState) {
        if self.current.load(Ordering::Acquire) != epoch {
            return;
        }
        let previous = self.state.send_replace(state);
        if previous != state {
            info!(epoch, from = %previous, to = %state, "connection state changed");
            self.emit(epoch, TransportEventKind::StateChanged(state));
        }
    }

    fn fail(&self, epoch: u64, message: String) {
        warn!(epoch, error = %message, "streaming channel failed");
        self.emit(epoch, TransportEventKind::Error(message));
        self.set_state(epoch, ConnectionState::Error);
        self.set_state(epoch, ConnectionState::Disconnected);
    }
}

struct Link {
    outbound: mpsc::UnboundedSender<OutboundMessage>,
    reader: JoinHandle<()>,
}

/// Owns at most one open streaming channel.
///
/// No automatic reconnect: after `Error` the state settles on `Disconnected`
/// and the caller decides whether to `connect` again.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    settings: LiveSettings,
    publisher: Publisher,
    link: Option<Link>,
}

impl ConnectionManager {
    /// Create a manager and the receiver its events are published on.
    pub fn new(
        connector: Arc<dyn Connector>,
        settings: LiveSettings,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let manager = Self {
            connector,
            settings,
            publisher: Publisher {
                state: Arc::new(state),
                events,
                current: Arc::new(AtomicU64::new(0)),
            },
            link: None,
        };
        (manager, receiver)
    }

    pub fn state(&self) -> ConnectionState {
        *self.publisher.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Watch connection state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.publisher.state.subscribe()
    }

    /// Epoch of the most recent `connect` attempt.
    pub fn epoch(&self) -> u64 {
        self.publisher.current.load(Ordering::Acquire)
    }

    /// Open the channel and complete the handshake.
    ///
    /// An existing channel is torn down first. Fails without any network
    /// activity when `credentials` is missing or empty.
    pub async fn connect(
        &mut self,
        credentials: Option<&Credentials>,
        system_instruction: Option<&str>,
    ) -> Result<()> {
        let Some(credentials) = credentials.filter(|c| !c.is_empty()) else {
            warn!("streaming connect refused: no API key");
            return Err(ReflectaError::MissingCredential);
        };

        self.disconnect().await;

        let epoch = self.publisher.current.fetch_add(1, Ordering::AcqRel) + 1;
        self.publisher.set_state(epoch, ConnectionState::Connecting);

        match self.handshake(credentials, system_instruction).await {
            Ok(channel) => {
                let publisher = self.publisher.clone();
                let reader = tokio::spawn(read_loop(channel.inbound, epoch, publisher));
                self.link = Some(Link {
                    outbound: channel.outbound,
                    reader,
                });
                self.publisher.set_state(epoch, ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                self.publisher.fail(epoch, e.to_string());
                Err(e)
            }
        }
    }

    async fn handshake(
        &self,
        credentials: &Credentials,
        system_instruction: Option<&str>,
    ) -> Result<LiveChannel> {
        let mut channel = self.connector.open(credentials).await?;

        channel
            .outbound
            .send(OutboundMessage::Setup {
                model: self.settings.model.clone(),
                voice: self.settings.voice.clone(),
                system_instruction: system_instruction.map(str::to_string),
            })
            .map_err(|_| ReflectaError::ConnectionFailed {
                message: "channel closed before setup was sent".to_string(),
            })?;

        let timeout = self.settings.handshake_timeout;
        match tokio::time::timeout(timeout, await_setup(&mut channel.inbound)).await {
            Ok(result) => result.map(|()| channel),
            Err(_) => Err(ReflectaError::Handshake {
                message: format!("no setup acknowledgement within {:?}", timeout),
            }),
        }
    }

    /// Forward a user text turn.
    ///
    /// # Errors
    /// `ReflectaError::NotConnected` unless the state is `Connected`. Nothing
    /// is buffered for later delivery.
    pub fn send_text(&self, text: &str) -> Result<()> {
        self.send(OutboundMessage::Text(text.to_string()))
    }

    /// Forward one microphone frame. Same policy as `send_text`.
    pub fn send_audio(&self, frame: PcmFrame) -> Result<()> {
        self.send(OutboundMessage::Audio(frame))
    }

    fn send(&self, message: OutboundMessage) -> Result<()> {
        if !self.is_connected() {
            return Err(ReflectaError::NotConnected);
        }
        let link = self.link.as_ref().ok_or(ReflectaError::NotConnected)?;
        link.outbound
            .send(message)
            .map_err(|_| ReflectaError::NotConnected)
    }

    /// Tear down the channel. Safe to call in any state.
    pub async fn disconnect(&mut self) {
        let epoch = self.epoch();
        if let Some(link) = self.link.take() {
            link.reader.abort();
            if let Err(e) = link.reader.await
                && !e.is_cancelled()
            {
                warn!(epoch, error = %e, "stream reader ended abnormally");
            }
            // Dropping the sender lets the connector close the socket
            drop(link.outbound);
            debug!(epoch, "streaming channel torn down");
        }
        self.publisher.set_state(epoch, ConnectionState::Disconnected);
    }
}

async fn await_setup(inbound: &mut mpsc::Receiver<InboundMessage>) -> Result<()> {
    while let Some(message) = inbound.recv().await {
        match message {
            InboundMessage::SetupComplete => return Ok(()),
            InboundMessage::Error { message } => {
                return Err(ReflectaError::Handshake { message });
            }
            InboundMessage::Closed => break,
            other => debug!(?other, "ignoring message before setup completed"),
        }
    }
    Err(ReflectaError::Handshake {
        message: "channel closed before setup completed".to_string(),
    })
}

async fn read_loop(
    mut inbound: mpsc::Receiver<InboundMessage>,
    epoch: u64,
    publisher: Publisher,
) {
    let mut assembler = ReplyAssembler::new();

    while let Some(message) = inbound.recv().await {
        let kind = match message {
            InboundMessage::Fragment { text, is_final } => {
                match assembler.push(&text, is_final) {
                    Some(reply) if !reply.trim().is_empty() => TransportEventKind::Reply(reply),
                    Some(_) => {
                        debug!(epoch, "empty reply ignored");
                        continue;
                    }
                    None => continue,
                }
            }
            InboundMessage::Transcript { text } => TransportEventKind::Transcript(text),
            InboundMessage::Audio(frame) => TransportEventKind::Audio(frame),
            InboundMessage::Interrupted => TransportEventKind::Interrupted,
            InboundMessage::SetupComplete => {
                debug!(epoch, "duplicate setup acknowledgement");
                continue;
            }
            InboundMessage::Error { message } => {
                publisher.fail(epoch, message);
                return;
            }
            InboundMessage::Closed => {
                info!(epoch, "streaming channel closed by backend");
                publisher.set_state(epoch, ConnectionState::Disconnected);
                return;
            }
        };

        if !publisher.emit(epoch, kind) {
            return;
        }
    }

    publisher.fail(epoch, "streaming channel dropped".to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockConnector;

    fn settings() -> LiveSettings {
        LiveSettings {
            model: "models/test".to_string(),
            voice: "Aoede".to_string(),
            handshake_timeout: Duration::from_millis(200),
        }
    }

    fn manager(
        connector: &MockConnector,
    ) -> (ConnectionManager, mpsc::UnboundedReceiver<TransportEvent>) {
        ConnectionManager::new(Arc::new(connector.clone()), settings())
    }

    fn key() -> Credentials {
        Credentials::new("test-key")
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Vec<TransportEventKind> {
        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind);
        }
        kinds
    }

    async fn next_kind(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEventKind {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
            .kind
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let rendered = format!("{:?}", Credentials::new("secret"));
        assert!(!rendered.contains("secret"));
    }

    #[tokio::test]
    async fn test_connect_without_credentials_fails_fast() {
        let connector = MockConnector::new();
        let (mut manager, mut rx) = manager(&connector);

        let result = manager.connect(None, None).await;
        assert!(matches!(result, Err(ReflectaError::MissingCredential)));

        let result = manager.connect(Some(&Credentials::new("  ")), None).await;
        assert!(matches!(result, Err(ReflectaError::MissingCredential)));

        assert_eq!(connector.open_count(), 0);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_connect_sends_setup_and_reports_transitions() {
        let connector = MockConnector::new();
        let (mut manager, mut rx) = manager(&connector);

        manager
            .connect(Some(&key()), Some("be curious"))
            .await
            .unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.epoch(), 1);
        assert_eq!(
            drain(&mut rx),
            vec![
                TransportEventKind::StateChanged(ConnectionState::Connecting),
                TransportEventKind::StateChanged(ConnectionState::Connected),
            ]
        );

        let mut server = connector.take_server().unwrap();
        match server.received().first() {
            Some(OutboundMessage::Setup {
                model,
                system_instruction,
                ..
            }) => {
                assert_eq!(model, "models/test");
                assert_eq!(system_instruction.as_deref(), Some("be curious"));
            }
            other => panic!("Expected setup first, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_open_failure_goes_through_error_to_disconnected() {
        let connector = MockConnector::new().with_open_failure("refused");
        let (mut manager, mut rx) = manager(&connector);

        let result = manager.connect(Some(&key()), None).await;
        assert!(matches!(result, Err(ReflectaError::ConnectionFailed { .. })));
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        let kinds = drain(&mut rx);
        assert_eq!(
            kinds[0],
            TransportEventKind::StateChanged(ConnectionState::Connecting)
        );
        assert!(matches!(kinds[1], TransportEventKind::Error(_)));
        assert_eq!(
            &kinds[2..],
            &[
                TransportEventKind::StateChanged(ConnectionState::Error),
                TransportEventKind::StateChanged(ConnectionState::Disconnected),
            ]
        );
    }

    #[tokio::test]
    async fn test_handshake_times_out_without_acknowledgement() {
        let connector = MockConnector::new().without_setup_ack();
        let (mut manager, _rx) = manager(&connector);

        let result = manager.connect(Some(&key()), None).await;
        assert!(matches!(result, Err(ReflectaError::Handshake { .. })));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_send_requires_connected_state() {
        let connector = MockConnector::new();
        let (mut manager, _rx) = manager(&connector);

        assert!(matches!(
            manager.send_text("hello"),
            Err(ReflectaError::NotConnected)
        ));
        assert!(matches!(
            manager.send_audio(PcmFrame::new(vec![0; 4], 16000)),
            Err(ReflectaError::NotConnected)
        ));

        manager.connect(Some(&key()), None).await.unwrap();
        manager.send_text("hello").unwrap();
        manager
            .send_audio(PcmFrame::new(vec![1, 2], 16000))
            .unwrap();

        let mut server = connector.take_server().unwrap();
        let received = server.received();
        assert_eq!(received[1], OutboundMessage::Text("hello".to_string()));
        assert!(matches!(received[2], OutboundMessage::Audio(_)));
    }

    #[tokio::test]
    async fn test_fragments_become_one_reply_in_order() {
        let connector = MockConnector::new();
        let (mut manager, mut rx) = manager(&connector);
        manager.connect(Some(&key()), None).await.unwrap();
        drain(&mut rx);

        let server = connector.take_server().unwrap();
        server.reply(&["What ", "did ", "you ", "like?"]).await;

        assert_eq!(
            next_kind(&mut rx).await,
            TransportEventKind::Reply("What did you like?".to_string())
        );
    }

    #[tokio::test]
    async fn test_audio_and_interrupt_are_forwarded() {
        let connector = MockConnector::new();
        let (mut manager, mut rx) = manager(&connector);
        manager.connect(Some(&key()), None).await.unwrap();
        drain(&mut rx);

        let server = connector.take_server().unwrap();
        let frame = PcmFrame::new(vec![7; 8], 24000);
        server.audio(frame.clone()).await;
        server.interrupt().await;

        assert_eq!(next_kind(&mut rx).await, TransportEventKind::Audio(frame));
        assert_eq!(next_kind(&mut rx).await, TransportEventKind::Interrupted);
    }

    #[tokio::test]
    async fn test_backend_error_ends_in_disconnected() {
        let connector = MockConnector::new();
        let (mut manager, mut rx) = manager(&connector);
        manager.connect(Some(&key()), None).await.unwrap();
        drain(&mut rx);

        let server = connector.take_server().unwrap();
        server.fail("connection reset").await;

        assert_eq!(
            next_kind(&mut rx).await,
            TransportEventKind::Error("connection reset".to_string())
        );
        assert_eq!(
            next_kind(&mut rx).await,
            TransportEventKind::StateChanged(ConnectionState::Error)
        );
        assert_eq!(
            next_kind(&mut rx).await,
            TransportEventKind::StateChanged(ConnectionState::Disconnected)
        );
        assert!(matches!(
            manager.send_text("late"),
            Err(ReflectaError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_second_connect_replaces_first_channel() {
        let connector = MockConnector::new();
        let (mut manager, mut rx) = manager(&connector);

        manager.connect(Some(&key()), None).await.unwrap();
        let stale = connector.take_server().unwrap();
        manager.connect(Some(&key()), None).await.unwrap();
        let fresh = connector.take_server().unwrap();
        assert_eq!(connector.open_count(), 2);
        assert_eq!(manager.epoch(), 2);

        let kinds: Vec<_> = drain(&mut rx);
        assert!(kinds.contains(&TransportEventKind::StateChanged(
            ConnectionState::Disconnected
        )));

        // The first reader is gone, so its traffic never surfaces
        stale.reply(&["stale"]).await;
        fresh.reply(&["fresh"]).await;
        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.connection, 2);
        assert_eq!(event.kind, TransportEventKind::Reply("fresh".to_string()));
    }

    #[tokio::test]
    async fn test_transcripts_and_replies_keep_their_whitespace() {
        let connector = MockConnector::new();
        let (mut manager, mut rx) = manager(&connector);
        manager.connect(Some(&key()), None).await.unwrap();
        let server = connector.take_server().unwrap();
        drain(&mut rx);

        server.transcript(" 좋았").await;
        server.transcript("어요 ").await;
        server.reply(&[" What ", "did you ", "like? "]).await;

        let mut kinds = Vec::new();
        while kinds.len() < 3 {
            let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            kinds.push(event.kind);
        }
        assert_eq!(
            kinds,
            vec![
                TransportEventKind::Transcript(" 좋았".to_string()),
                TransportEventKind::Transcript("어요 ".to_string()),
                TransportEventKind::Reply(" What did you like? ".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let connector = MockConnector::new();
        let (mut manager, mut rx) = manager(&connector);

        manager.disconnect().await;
        assert!(drain(&mut rx).is_empty());

        manager.connect(Some(&key()), None).await.unwrap();
        manager.disconnect().await;
        manager.disconnect().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        let disconnects = drain(&mut rx)
            .into_iter()
            .filter(|k| *k == TransportEventKind::StateChanged(ConnectionState::Disconnected))
            .count();
        assert_eq!(disconnects, 1);
    }

    #[tokio::test]
    async fn test_subscribers_see_state() {
        let connector = MockConnector::new();
        let (mut manager, _rx) = manager(&connector);
        let watcher = manager.subscribe();

        manager.connect(Some(&key()), None).await.unwrap();
        assert_eq!(*watcher.borrow(), ConnectionState::Connected);
    }
}
