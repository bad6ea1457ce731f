use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use http::header::{HeaderValue, USER_AGENT};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, Message},
};
use tracing::debug;
use url::Url;

use crate::error::Result;

const EVENT_CHANNEL_CAPACITY: usize = 256;

const CLIENT_USER_AGENT: &str = concat!("rail-tunnel/", env!("CARGO_PKG_VERSION"));

/// Instructions for the writer side of a control connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    /// One encoded protocol frame.
    Send(String),
    /// Transport-level pong answering a transport-level ping.
    Pong(Vec<u8>),
    Close,
}

/// What the reader side of a control connection observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Frame(String),
    Closed(Option<String>),
    Error(String),
}

/// An established control connection, as a pair of channels.
///
/// Sends are fire-and-forget and delivered in the order they were enqueued.
/// The event stream ends with at most one `Closed` or `Error`.
pub struct Connection {
    pub commands: mpsc::UnboundedSender<TransportCommand>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Opens control connections. The session only talks to the relay through
/// this seam.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &Url) -> Result<Connection>;
}

/// Control connection over a WebSocket.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &Url) -> Result<Connection> {
        let mut request = url.as_str().into_client_request()?;
        request
            .headers_mut()
            .insert(USER_AGENT, HeaderValue::from_static(CLIENT_USER_AGENT));

        let (ws_stream, response) = connect_async(request).await?;
        debug!("Control connection established, status: {}", response.status());
        let (write, read) = ws_stream.split();

        let (commands_tx, commands_rx) = mpsc::unbounded_channel::<TransportCommand>();
        let (events_tx, events_rx) = mpsc::channel::<TransportEvent>(EVENT_CHANNEL_CAPACITY);

        // This task exclusively owns the write half - no locks needed
        tokio::spawn(async move {
            let mut write = write;
            let mut rx = commands_rx;
            while let Some(command) = rx.recv().await {
                let result = match command {
                    TransportCommand::Send(text) => write.send(Message::Text(text)).await,
                    TransportCommand::Pong(data) => write.send(Message::Pong(data)).await,
                    TransportCommand::Close => {
                        if let Err(e) = write.close().await {
                            debug!("Close error: {}", e);
                        }
                        break;
                    }
                };

                if let Err(e) = result {
                    debug!("Send error (connection closing): {}", e);
                    break;
                }
            }
        });

        let pong_tx = commands_tx.clone();
        tokio::spawn(async move {
            let mut read = read;
            let last = loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if events_tx.send(TransportEvent::Frame(text)).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => {
                            if events_tx.send(TransportEvent::Frame(text)).await.is_err() {
                                return;
                            }
                        }
                        Err(_) => debug!("Received non-UTF-8 binary message (ignoring)"),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        debug!("Received ping, sending pong");
                        let _ = pong_tx.send(TransportCommand::Pong(data));
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        break TransportEvent::Closed(frame.map(|f| f.reason.to_string()));
                    }
                    Some(Err(e)) => {
                        debug!("WebSocket read error: {}", e);
                        break TransportEvent::Error(e.to_string());
                    }
                    None => break TransportEvent::Closed(None),
                }
            };
            let _ = events_tx.send(last).await;
        });

        Ok(Connection {
            commands: commands_tx,
            events: events_rx,
        })
    }
}
