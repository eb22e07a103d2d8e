//! WebSocket connector for the live conversation endpoint.

use crate::defaults;
use crate::error::{ReflectaError, Result};
use crate::transport::connection::{Connector, Credentials, LiveChannel};
use crate::transport::protocol::{self, InboundMessage, OutboundMessage};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, info, warn};

/// Opens `wss://` channels with the API key as a query parameter.
///
/// Each channel runs a writer task (encodes `OutboundMessage`s) and a reader
/// task (decodes server frames). Dropping the outbound sender closes the
/// socket.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
        }
    }

    fn endpoint(&self, credentials: &Credentials) -> String {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}key={}", self.url, separator, credentials.api_key())
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, credentials: &Credentials) -> Result<LiveChannel> {
        let (stream, _) = connect_async(self.endpoint(credentials))
            .await
            .map_err(|e| ReflectaError::ConnectionFailed {
                message: format!("Failed to connect to {}: {}", self.url, e),
            })?;
        info!(url = %self.url, "websocket connected");

        let (mut sink, mut source) = stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<OutboundMessage>();
        let (inbound_tx, inbound) = mpsc::channel(defaults::INBOUND_BUFFER);

        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let text = match message.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "dropping unencodable outbound message");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    warn!(error = %e, "websocket write failed");
                    break;
                }
            }
            if let Err(e) = sink.close().await {
                debug!(error = %e, "websocket close failed");
            }
        });

        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                let messages = match frame {
                    Ok(Message::Text(text)) => protocol::decode_server_message(text.as_bytes()),
                    Ok(Message::Binary(bytes)) => protocol::decode_server_message(&bytes),
                    Ok(Message::Close(close)) => {
                        let mut messages = Vec::new();
                        if let Some(close) = close
                            && close.code != CloseCode::Normal
                        {
                            messages.push(InboundMessage::Error {
                                message: format!("closed with {}: {}", close.code, close.reason),
                            });
                        }
                        messages.push(InboundMessage::Closed);
                        Ok(messages)
                    }
                    Ok(_) => continue,
                    Err(e) => Ok(vec![InboundMessage::Error {
                        message: e.to_string(),
                    }]),
                };

                let messages = match messages {
                    Ok(messages) => messages,
                    Err(e) => {
                        warn!(error = %e, "skipping undecodable server frame");
                        continue;
                    }
                };

                for message in messages {
                    let terminal = matches!(
                        message,
                        InboundMessage::Closed | InboundMessage::Error { .. }
                    );
                    if inbound_tx.send(message).await.is_err() || terminal {
                        return;
                    }
                }
            }
            if inbound_tx.send(InboundMessage::Closed).await.is_err() {
                debug!("websocket reader finished after channel was dropped");
            }
        });

        Ok(LiveChannel { outbound, inbound })
    }
}
