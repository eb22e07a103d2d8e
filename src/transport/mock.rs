//! Scripted stand-in for the conversation backend.

use crate::audio::pcm::PcmFrame;
use crate::defaults;
use crate::error::{ReflectaError, Result};
use crate::transport::connection::{Connector, Credentials, LiveChannel};
use crate::transport::protocol::{InboundMessage, OutboundMessage};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

#[derive(Default)]
struct MockConnectorState {
    open_failure: Option<String>,
    setup_error: Option<String>,
    skip_setup_ack: bool,
    servers: VecDeque<MockServer>,
    opens: usize,
}

/// Mock connector for testing.
///
/// Every successful `open` creates a `MockServer` the test retrieves with
/// `take_server` to script the backend side. Clones share state.
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<MockConnectorState>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every `open`, like an unreachable host.
    pub fn with_open_failure(self, message: &str) -> Self {
        self.state().open_failure = Some(message.to_string());
        self
    }

    /// Answer the handshake with an error instead of an acknowledgement.
    pub fn with_setup_error(self, message: &str) -> Self {
        self.state().setup_error = Some(message.to_string());
        self
    }

    /// Never acknowledge the handshake.
    pub fn without_setup_ack(self) -> Self {
        self.state().skip_setup_ack = true;
        self
    }

    /// Toggle open failures on an existing connector (e.g. between sessions).
    pub fn set_open_failure(&self, message: Option<&str>) {
        self.state().open_failure = message.map(str::to_string);
    }

    fn state(&self) -> MutexGuard<'_, MockConnectorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Oldest server not yet taken.
    pub fn take_server(&self) -> Option<MockServer> {
        self.state().servers.pop_front()
    }

    /// Number of `open` calls, failed ones included.
    pub fn open_count(&self) -> usize {
        self.state().opens
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, _credentials: &Credentials) -> Result<LiveChannel> {
        let mut state = self.state();
        state.opens += 1;
        if let Some(message) = state.open_failure.clone() {
            return Err(ReflectaError::ConnectionFailed { message });
        }

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound) = mpsc::channel(defaults::INBOUND_BUFFER);

        let handshake = match (&state.setup_error, state.skip_setup_ack) {
            (Some(message), _) => Some(InboundMessage::Error {
                message: message.clone(),
            }),
            (None, false) => Some(InboundMessage::SetupComplete),
            (None, true) => None,
        };
        if let Some(message) = handshake
            && inbound_tx.try_send(message).is_err()
        {
            return Err(ReflectaError::ConnectionFailed {
                message: "mock inbound buffer full".to_string(),
            });
        }

        state.servers.push_back(MockServer {
            outbound: outbound_rx,
            inbound: inbound_tx,
        });
        Ok(LiveChannel { outbound, inbound })
    }
}

/// Backend side of one mock connection.
///
/// Sends after the engine has dropped the channel are silently discarded.
pub struct MockServer {
    outbound: mpsc::UnboundedReceiver<OutboundMessage>,
    inbound: mpsc::Sender<InboundMessage>,
}

impl MockServer {
    async fn push(&self, message: InboundMessage) {
        if self.inbound.send(message).await.is_err() {
            // Engine side already torn down
        }
    }

    /// Send one fragment.
    pub async fn fragment(&self, text: &str, is_final: bool) {
        self.push(InboundMessage::Fragment {
            text: text.to_string(),
            is_final,
        })
        .await;
    }

    /// Stream a reply as non-final fragments followed by a final marker.
    pub async fn reply(&self, parts: &[&str]) {
        for part in parts {
            self.fragment(part, false).await;
        }
        self.fragment("", true).await;
    }

    /// Send a transcribed piece of the user's speech.
    pub async fn transcript(&self, text: &str) {
        self.push(InboundMessage::Transcript {
            text: text.to_string(),
        })
        .await;
    }

    pub async fn audio(&self, frame: PcmFrame) {
        self.push(InboundMessage::Audio(frame)).await;
    }

    pub async fn interrupt(&self) {
        self.push(InboundMessage::Interrupted).await;
    }

    /// Report an unrecoverable failure, like a reset connection.
    pub async fn fail(&self, message: &str) {
        self.push(InboundMessage::Error {
            message: message.to_string(),
        })
        .await;
    }

    /// Close the channel normally.
    pub async fn close(&self) {
        self.push(InboundMessage::Closed).await;
    }

    /// Everything the engine has sent so far, setup included.
    pub fn received(&mut self) -> Vec<OutboundMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = self.outbound.try_recv() {
            messages.push(message);
        }
        messages
    }

    /// Text turns the engine has sent since the last call.
    pub fn received_texts(&mut self) -> Vec<String> {
        self.received()
            .into_iter()
            .filter_map(|message| match message {
                OutboundMessage::Text(text) => Some(text),
                _ => None,
            })
            .collect()
    }

    /// Whether the engine still holds its end of the channel.
    pub fn is_open(&self) -> bool {
        !self.inbound.is_closed()
    }
}
