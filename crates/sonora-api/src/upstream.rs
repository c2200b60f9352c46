//! Websocket transport to the upstream audio device.
//!
//! The device speaks JSON text frames tagged by `type`. This module only
//! frames and parses them; pairing, backoff and request correlation are
//! owned by the relay's link manager.
//!
//! ```rust,ignore
//! let (mut writer, mut reader) = upstream::connect(&url).await?.split();
//! writer.send(&DeviceRequest::ReleaseSession { session_id: "abc".into() }).await?;
//! while let Some(msg) = reader.next().await {
//!     println!("{msg:?}");
//! }
//! ```

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::error::Error;
use crate::protocol::{Command, OutputDescription, QueueState, ZoneDescription, ZoneState};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ── Device → relay ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceMessage {
    /// The device accepted the relay as a paired extension.
    Paired {
        core_id: String,
        #[serde(default)]
        display_name: Option<String>,
    },
    /// The device dropped the pairing without closing the socket.
    Unpaired,
    /// Full zone and output listing. Sent after pairing and on topology changes.
    Zones {
        zones: Vec<ZoneDescription>,
        #[serde(default)]
        outputs: Vec<OutputDescription>,
    },
    ZoneChanged {
        zone: ZoneState,
    },
    ZoneRemoved {
        zone_id: String,
    },
    QueueChanged {
        queue: QueueState,
    },
    /// Answer to a [`DeviceRequest`] carrying a `request_id`.
    Reply {
        request_id: String,
        ok: bool,
        #[serde(default)]
        body: Value,
        #[serde(default)]
        error: Option<String>,
    },
}

// ── Relay → device ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceRequest {
    Command {
        request_id: String,
        session_id: String,
        command: Command,
    },
    Browse {
        request_id: String,
        session_id: String,
        body: Value,
    },
    Load {
        request_id: String,
        session_id: String,
        body: Value,
    },
    /// Drop any navigation context the device keeps for a session.
    ReleaseSession {
        session_id: String,
    },
}

// ── Connection ───────────────────────────────────────────────────────

/// An established websocket to the device.
pub struct DeviceConnection {
    socket: Socket,
}

/// Open a websocket to the device. Resolves once the handshake completes.
pub async fn connect(url: &Url) -> Result<DeviceConnection, Error> {
    tracing::info!(url = %url, "Connecting to upstream device");

    let (socket, _response) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .map_err(|e| Error::WebSocketConnect(e.to_string()))?;

    tracing::info!("Upstream websocket connected");
    Ok(DeviceConnection { socket })
}

impl DeviceConnection {
    /// Split into independently owned halves so reads never wait on writes.
    pub fn split(self) -> (DeviceWriter, DeviceReader) {
        let (sink, stream) = self.socket.split();
        (DeviceWriter { sink }, DeviceReader { stream })
    }
}

pub struct DeviceWriter {
    sink: SplitSink<Socket, Message>,
}

impl DeviceWriter {
    pub async fn send(&mut self, request: &DeviceRequest) -> Result<(), Error> {
        let text = serde_json::to_string(request).map_err(|e| Error::WebSocketSend(e.to_string()))?;
        self.sink
            .send(Message::text(text))
            .await
            .map_err(|e| Error::WebSocketSend(e.to_string()))
    }

    /// Send a close frame. Errors are irrelevant at this point.
    pub async fn close(mut self) {
        let _ = self.sink.close().await;
    }
}

pub struct DeviceReader {
    stream: SplitStream<Socket>,
}

impl DeviceReader {
    /// Next parsed message.
    ///
    /// `None` means the socket closed cleanly (close frame or end of
    /// stream); `Some(Err(_))` means it broke. Malformed frames are
    /// skipped.
    pub async fn next(&mut self) -> Option<Result<DeviceMessage, Error>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => {
                    if let Some(message) = parse_frame(&text) {
                        return Some(Ok(message));
                    }
                }
                Ok(Message::Close(frame)) => {
                    if let Some(ref cf) = frame {
                        tracing::info!(code = %cf.code, reason = %cf.reason, "Upstream close frame received");
                    } else {
                        tracing::info!("Upstream close frame received (no payload)");
                    }
                    return None;
                }
                Ok(Message::Ping(_)) => {
                    // tungstenite queues the pong automatically
                    tracing::trace!("Upstream ping");
                }
                Ok(_) => {
                    // Binary, Pong, Frame -- ignore
                }
                Err(tungstenite::Error::ConnectionClosed) => return None,
                Err(e) => return Some(Err(Error::WebSocketConnect(e.to_string()))),
            }
        }
    }
}

/// Parse one text frame, logging and discarding anything malformed.
fn parse_frame(text: &str) -> Option<DeviceMessage> {
    match serde_json::from_str(text) {
        Ok(message) => Some(message),
        Err(e) => {
            tracing::debug!(error = %e, "Failed to parse upstream frame");
            None
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
