use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::warn;
use url::Url;
use wirechat_core::{ClientFrame, ServerFrame, decode_server_frame, encode_client_frame};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid server url: {0}")]
    InvalidUrl(String),
    #[error("connect failed: {0}")]
    Connect(String),
}

/// Channel halves of one established connection. Dropping `outbound`
/// closes the write side; `inbound` yielding `None` means the link died.
#[derive(Debug)]
pub struct TransportLink {
    pub outbound: mpsc::UnboundedSender<ClientFrame>,
    pub inbound: mpsc::UnboundedReceiver<ServerFrame>,
}

/// Seam between the session and the wire, so the session logic can be
/// exercised against an in-memory peer.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, server_url: &str) -> Result<TransportLink, TransportError>;
}

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;
type WsWrite = futures::stream::SplitSink<WsStream, Message>;
type WsRead = futures::stream::SplitStream<WsStream>;

/// WebSocket transport carrying one JSON frame per text message.
#[derive(Debug, Default)]
pub struct WsTransport;

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, server_url: &str) -> Result<TransportLink, TransportError> {
        let parsed =
            Url::parse(server_url).map_err(|err| TransportError::InvalidUrl(err.to_string()))?;
        match parsed.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(TransportError::InvalidUrl(format!(
                    "scheme must be ws or wss, got {other}"
                )));
            }
        }

        let (ws_stream, _) = connect_async(server_url)
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        let (write_half, read_half) = ws_stream.split();

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_pump(write_half, outbound_rx));
        tokio::spawn(read_pump(read_half, inbound_tx));

        Ok(TransportLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

async fn write_pump(mut ws_write: WsWrite, mut outbound_rx: mpsc::UnboundedReceiver<ClientFrame>) {
    while let Some(frame) = outbound_rx.recv().await {
        match encode_client_frame(&frame) {
            Ok(text) => {
                if ws_write.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            Err(err) => warn!("failed to encode outgoing frame: {}", err),
        }
    }
    let _ = ws_write.close().await;
}

async fn read_pump(mut ws_read: WsRead, inbound_tx: mpsc::UnboundedSender<ServerFrame>) {
    while let Some(next) = ws_read.next().await {
        let message = match next {
            Ok(message) => message,
            Err(err) => {
                warn!("websocket receive error: {}", err);
                break;
            }
        };

        match message {
            Message::Text(text) => match decode_server_frame(text.as_str()) {
                Ok(frame) => {
                    if inbound_tx.send(frame).is_err() {
                        break;
                    }
                }
                // Fail closed: a frame we cannot parse never reaches the
                // session state.
                Err(err) => warn!("dropping malformed server frame: {}", err),
            },
            Message::Close(_) => break,
            Message::Binary(_) | Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
    }
}
