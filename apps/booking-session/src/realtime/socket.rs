use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::cookie::{CookieStore, Jar};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::COOKIE;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, trace};
use url::Url;

/// What the socket reports back to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    Message(String),
    Closed { code: Option<u16>, reason: Option<String> },
    Error(String),
}

/// One open socket: text frames go out through `outbound`, everything the
/// peer does comes back through `inbound`. Dropping `outbound` closes the
/// socket.
#[derive(Debug)]
pub struct SocketLink {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<SocketEvent>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid realtime url: {0}")]
    Url(String),
    #[error("invalid upgrade request: {0}")]
    Request(String),
    #[error("websocket handshake failed: {0}")]
    Handshake(#[from] tokio_tungstenite::tungstenite::Error),
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<SocketLink, TransportError>;
}

/// Opens sockets with tungstenite, attaching the session cookies from the
/// shared jar to the upgrade request.
pub struct TungsteniteConnector {
    jar: Option<Arc<Jar>>,
}

impl TungsteniteConnector {
    pub fn new(jar: Option<Arc<Jar>>) -> Self {
        Self { jar }
    }

    fn cookie_header(&self, url: &Url) -> Option<HeaderValue> {
        let jar = self.jar.as_ref()?;
        let lookup = cookie_lookup_url(url)?;
        let value = jar.cookies(&lookup)?;
        // reqwest and tungstenite pin different `http` majors.
        HeaderValue::from_bytes(value.as_bytes()).ok()
    }
}

/// The jar stores cookies against the http origin; websocket urls share it.
fn cookie_lookup_url(url: &Url) -> Option<Url> {
    let scheme = match url.scheme() {
        "ws" => "http",
        "wss" => "https",
        "http" | "https" => return Some(url.clone()),
        _ => return None,
    };
    let mut lookup = url.clone();
    lookup.set_scheme(scheme).ok()?;
    Some(lookup)
}

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, url: &Url) -> Result<SocketLink, TransportError> {
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(TransportError::Url(format!(
                "unsupported scheme '{}' in {url}",
                url.scheme()
            )));
        }

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|err| TransportError::Request(err.to_string()))?;
        if let Some(cookie) = self.cookie_header(url) {
            request.headers_mut().insert(COOKIE, cookie);
        }

        debug!(target = "booking.realtime", url = %url, "opening websocket");
        let (stream, _) = connect_async(request).await?;
        let (mut sink, mut stream) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<SocketEvent>();

        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                trace!(target = "booking.realtime", bytes = text.len(), "sending frame");
                if sink.send(Message::Text(text)).await.is_err() {
                    return;
                }
            }
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = inbound_tx.closed() => break,
                    frame = stream.next() => frame,
                };
                let event = match frame {
                    Some(Ok(Message::Text(text))) => SocketEvent::Message(text),
                    Some(Ok(Message::Close(frame))) => SocketEvent::Closed {
                        code: frame.as_ref().map(|frame| u16::from(frame.code)),
                        reason: frame
                            .map(|frame| frame.reason.into_owned())
                            .filter(|reason| !reason.is_empty()),
                    },
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => SocketEvent::Error(err.to_string()),
                    None => SocketEvent::Closed {
                        code: None,
                        reason: None,
                    },
                };
                let terminal = !matches!(event, SocketEvent::Message(_));
                if inbound_tx.send(event).is_err() || terminal {
                    break;
                }
            }
        });

        Ok(SocketLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
