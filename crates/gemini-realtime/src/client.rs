//! WebSocket connector for the Gemini Live API.

use crate::types::{ClientMessage, Setup, parse_server_message};
use async_trait::async_trait;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use livetalk_core::events::{ClientEvent, ServerEvent, SessionSetup};
use livetalk_core::transport::{Connector, LiveLink};
use livetalk_core::EngineError;
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::protocol::Message,
};
use tracing::{Instrument, debug, error, info, warn};

pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";
pub const DEFAULT_MODEL: &str = "models/gemini-2.0-flash-live-001";
pub const SETUP_TIMEOUT: Duration = Duration::from_secs(15);

const LINK_CAPACITY: usize = 128;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("invalid message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("no setup confirmation within {0:?}")]
    SetupTimeout(Duration),
    #[error("connection closed during setup{}", .0.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    ClosedDuringSetup(Option<String>),
}

#[derive(Debug)]
pub struct GeminiConfig {
    pub api_key: SecretString,
    pub model: String,
    pub endpoint: String,
    pub setup_timeout: Duration,
}

impl GeminiConfig {
    pub fn new(api_key: SecretString) -> Self {
        Self {
            api_key,
            model: DEFAULT_MODEL.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            setup_timeout: SETUP_TIMEOUT,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    fn url(&self) -> String {
        format!("{}?key={}", self.endpoint, self.api_key.expose_secret())
    }
}

/// Opens Gemini Live sessions and adapts them to [`LiveLink`]s.
pub struct GeminiConnector {
    config: GeminiConfig,
}

impl GeminiConnector {
    pub fn new(config: GeminiConfig) -> Self {
        Self { config }
    }

    /// Connects, sends the setup message and waits for `setupComplete`. On
    /// success a writer and a reader task own the socket halves.
    pub async fn open(&self, setup: SessionSetup) -> Result<LiveLink, ConnectError> {
        let (socket, _) = connect_async(self.config.url()).await?;
        info!(model = %self.config.model, "Connected to Gemini Live");
        let (mut sink, mut stream) = socket.split();

        let message = ClientMessage::Setup(Setup::from_session(&self.config.model, &setup));
        sink.send(Message::Text(serde_json::to_string(&message)?.into()))
            .await?;

        tokio::time::timeout(self.config.setup_timeout, await_setup_complete(&mut stream))
            .await
            .map_err(|_| ConnectError::SetupTimeout(self.config.setup_timeout))??;
        info!("Gemini session setup is complete");

        let (link, peer) = LiveLink::pair(LINK_CAPACITY);
        tokio::spawn(write_loop(sink, peer.outbound).in_current_span());
        tokio::spawn(read_loop(stream, peer.inbound).in_current_span());
        Ok(link)
    }
}

#[async_trait]
impl Connector for GeminiConnector {
    async fn connect(&self, setup: SessionSetup) -> Result<LiveLink, EngineError> {
        self.open(setup).await.map_err(|e| {
            error!(error = %e, "Gemini connection failed");
            EngineError::Connection(e.to_string())
        })
    }
}

async fn await_setup_complete(stream: &mut SplitStream<Socket>) -> Result<(), ConnectError> {
    while let Some(frame) = stream.next().await {
        let text = match frame? {
            Message::Text(text) => text.to_string(),
            Message::Binary(data) => String::from_utf8_lossy(&data).into_owned(),
            Message::Close(frame) => {
                return Err(ConnectError::ClosedDuringSetup(
                    frame.map(|f| f.reason.to_string()),
                ));
            }
            _ => continue,
        };
        let message = parse_server_message(&text)?;
        if message.is_setup_complete() {
            return Ok(());
        }
        debug!(?message, "Ignoring message received before setup completed");
    }
    Err(ConnectError::ClosedDuringSetup(None))
}

async fn write_loop(
    mut sink: SplitSink<Socket, Message>,
    mut outbound: mpsc::Receiver<ClientEvent>,
) {
    while let Some(event) = outbound.recv().await {
        let Some(message) = ClientMessage::from_event(event) else {
            debug!("Closing Gemini connection");
            if let Err(e) = sink.send(Message::Close(None)).await {
                debug!(error = %e, "Close frame not delivered");
            }
            return;
        };
        let payload = match serde_json::to_string(&message) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Could not serialize outbound message");
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Text(payload.into())).await {
            warn!(error = %e, "Failed to send to Gemini; stopping writer");
            return;
        }
    }
    // The session dropped its link without closing it.
    if let Err(e) = sink.close().await {
        debug!(error = %e, "Socket already closed");
    }
}

/// What one inbound frame means for the session.
#[derive(Debug, PartialEq)]
enum Inbound {
    Events(Vec<ServerEvent>),
    Ended(ServerEvent),
    Ignored,
}

fn classify(frame: Message) -> Inbound {
    match frame {
        Message::Text(text) => parse_frame(&text),
        Message::Binary(data) => match std::str::from_utf8(&data) {
            Ok(text) => parse_frame(text),
            Err(e) => {
                warn!(error = %e, len = data.len(), "Dropping non-UTF-8 binary frame");
                Inbound::Ignored
            }
        },
        Message::Close(frame) => Inbound::Ended(close_event(frame)),
        _ => Inbound::Ignored,
    }
}

fn parse_frame(text: &str) -> Inbound {
    match parse_server_message(text) {
        Ok(message) => Inbound::Events(message.into_events()),
        Err(e) => {
            warn!(error = %e, "Dropping unparseable message from Gemini");
            Inbound::Ignored
        }
    }
}

fn close_event(frame: Option<CloseFrame>) -> ServerEvent {
    match frame {
        None => ServerEvent::Closed(None),
        Some(frame) if matches!(frame.code, CloseCode::Normal | CloseCode::Away) => {
            ServerEvent::Closed(Some(frame.reason.to_string()))
        }
        Some(frame) => ServerEvent::Error(format!(
            "connection closed with code {}: {}",
            u16::from(frame.code),
            frame.reason
        )),
    }
}

async fn read_loop(mut stream: SplitStream<Socket>, inbound: mpsc::Sender<ServerEvent>) {
    while let Some(frame) = stream.next().await {
        let events = match frame {
            Ok(frame) => match classify(frame) {
                Inbound::Events(events) => events,
                Inbound::Ended(event) => {
                    info!(?event, "Gemini closed the connection");
                    let _ = inbound.send(event).await;
                    return;
                }
                Inbound::Ignored => continue,
            },
            Err(e) => {
                error!(error = %e, "Error reading from Gemini");
                let _ = inbound.send(ServerEvent::Error(e.to_string())).await;
                return;
            }
        };
        for event in events {
            if inbound.send(event).await.is_err() {
                debug!("Session no longer listening; stopping reader");
                return;
            }
        }
    }
    let _ = inbound.send(ServerEvent::Closed(None)).await;
}
