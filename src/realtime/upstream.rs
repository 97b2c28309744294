//! Upstream transport
//!
//! The bridge talks to the vendor through a [`Connector`], which yields a pair of
//! channels per connection. Dropping the outbound sender closes the socket; the
//! inbound receiver ends when the remote side goes away.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use url::Url;

use crate::config::UpstreamConfig;
use crate::{Error, Result};

/// Per-link channel depth
const LINK_BUFFER: usize = 256;

/// One message on the upstream socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// JSON control message
    Text(String),
    /// Raw PCM16 audio
    Binary(Bytes),
}

/// An established upstream connection
#[derive(Debug)]
pub struct UpstreamLink {
    pub outbound: mpsc::Sender<WireMessage>,
    pub inbound: mpsc::Receiver<WireMessage>,
}

/// Opens upstream connections
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a new connection for a session using `voice`
    ///
    /// # Errors
    ///
    /// Returns a transport error if the endpoint is unreachable or the handshake fails
    async fn connect(&self, voice: &str) -> Result<UpstreamLink>;
}

/// Realtime endpoint over tokio-tungstenite
pub struct WsConnector {
    endpoint: Url,
    api_key: Option<SecretString>,
    handshake_timeout: Duration,
}

impl WsConnector {
    /// Build from the upstream config section
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the URL is invalid
    pub fn from_config(config: &UpstreamConfig) -> Result<Self> {
        let mut endpoint = Url::parse(&config.url)
            .map_err(|e| Error::Config(format!("invalid upstream url {}: {e}", config.url)))?;
        if !config.model.is_empty() {
            endpoint.query_pairs_mut().append_pair("model", &config.model);
        }
        Ok(Self {
            endpoint,
            api_key: config.api_key.clone(),
            handshake_timeout: config.handshake_timeout,
        })
    }

    /// Full endpoint URL including the model query
    #[must_use]
    pub const fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, voice: &str) -> Result<UpstreamLink> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| Error::Config("no upstream API key configured".to_string()))?;

        let mut request = self.endpoint.as_str().into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", api_key.expose_secret()))
            .map_err(|e| Error::Config(format!("invalid API key: {e}")))?;
        request.headers_mut().insert("Authorization", bearer);
        request
            .headers_mut()
            .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        tracing::debug!(endpoint = %self.endpoint, voice, "connecting upstream");

        let (socket, _response) =
            tokio::time::timeout(self.handshake_timeout, tokio_tungstenite::connect_async(request))
                .await
                .map_err(|_| Error::Transport("upstream handshake timed out".to_string()))??;

        let (mut sink, mut stream) = socket.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<WireMessage>(LINK_BUFFER);
        let (inbound_tx, inbound_rx) = mpsc::channel::<WireMessage>(LINK_BUFFER);

        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let frame = match msg {
                    WireMessage::Text(text) => Message::Text(text),
                    WireMessage::Binary(data) => Message::Binary(data.to_vec()),
                };
                if let Err(e) = sink.send(frame).await {
                    tracing::warn!(error = %e, "upstream send failed");
                    return;
                }
            }
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let msg = match frame {
                    Ok(Message::Text(text)) => WireMessage::Text(text),
                    Ok(Message::Binary(data)) => WireMessage::Binary(Bytes::from(data)),
                    Ok(Message::Close(reason)) => {
                        tracing::debug!(?reason, "upstream closed connection");
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::warn!(error = %e, "upstream receive failed");
                        break;
                    }
                };
                if inbound_tx.send(msg).await.is_err() {
                    break;
                }
            }
        });

        tracing::info!(endpoint = %self.endpoint, "upstream connected");
        Ok(UpstreamLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
