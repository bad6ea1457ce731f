use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::TunnelConfig;
use crate::error::{Result, TunnelError};
use crate::protocol::{DecodeError, HttpRequest, WireMessage};

use super::http_proxy::{bad_gateway, LocalForwarder};
use super::keepalive::{Keepalive, KEEPALIVE_INTERVAL};
use super::reconnect::RetrySchedule;
use super::reporter::SessionEvent;
use super::transport::{Connection, Connector, TransportCommand, TransportEvent, WsConnector};

/// Bound on establishing the control connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// How long a client-initiated close waits for the transport to confirm.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
}

impl SessionState {
    fn is_shutting_down(self) -> bool {
        matches!(self, SessionState::Closing | SessionState::Closed)
    }
}

/// Last-known view of the tunnel. Rebuilt on every successful connect; on
/// loss only `connected` flips, so the URLs stay available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub public_url: String,
    pub local_url: String,
    pub local_port: u16,
    pub connected: bool,
}

/// The client side of one tunnel.
///
/// State transitions happen in the driver task spawned by [`Session::start`];
/// the only other writer is [`Session::close`], which can only move the
/// session towards `Closed`. Local forwards run as independent tasks with no
/// concurrency cap.
pub struct Session<C: Connector = WsConnector> {
    config: TunnelConfig,
    connector: C,
    forwarder: LocalForwarder,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
    state: watch::Sender<SessionState>,
    info: watch::Sender<Option<ConnectionInfo>>,
    /// Writer of the live connection, if any.
    outbound: Mutex<Option<mpsc::UnboundedSender<TransportCommand>>>,
    shutdown: CancellationToken,
    driving: AtomicBool,
}

impl<C: Connector> Session<C> {
    pub fn new(
        config: TunnelConfig,
        connector: C,
        events: Option<mpsc::UnboundedSender<SessionEvent>>,
    ) -> Result<Arc<Self>> {
        let forwarder = LocalForwarder::new(&config.local_base_url)?;
        let (state, _) = watch::channel(SessionState::Disconnected);
        let (info, _) = watch::channel(None);

        Ok(Arc::new(Self {
            config,
            connector,
            forwarder,
            events,
            state,
            info,
            outbound: Mutex::new(None),
            shutdown: CancellationToken::new(),
            driving: AtomicBool::new(false),
        }))
    }

    /// Open the control connection and start serving it.
    ///
    /// Returns once the first connection is established; a failure here is
    /// returned to the caller and does not trigger reconnection.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let connection = self.connect().await?;

        self.driving.store(true, Ordering::SeqCst);
        let session = Arc::clone(self);
        tokio::spawn(async move { session.drive(connection).await });
        Ok(())
    }

    /// Shut the session down. Idempotent and non-blocking: marks the session
    /// `Closing`, stops reconnection, and asks the transport to close even if
    /// it is already closing.
    pub fn close(&self) {
        let first = self.state.send_if_modified(|state| {
            if state.is_shutting_down() {
                return false;
            }
            *state = SessionState::Closing;
            true
        });
        if first {
            info!("Shutting down tunnel...");
        }

        self.shutdown.cancel();
        self.info.send_modify(|info| {
            if let Some(info) = info {
                info.connected = false;
            }
        });
        if let Ok(outbound) = self.outbound.lock() {
            if let Some(commands) = outbound.as_ref() {
                let _ = commands.send(TransportCommand::Close);
            }
        }

        if !self.driving.load(Ordering::SeqCst) {
            self.settle_closed();
        }
    }

    /// Wait until the session has settled in `Closed`.
    pub async fn closed(&self) {
        let mut state = self.subscribe_state();
        let _ = state.wait_for(|s| *s == SessionState::Closed).await;
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn connection_info(&self) -> Option<ConnectionInfo> {
        self.info.borrow().clone()
    }

    /// Disconnected -> Connecting -> Connected, or back to Disconnected.
    async fn connect(&self) -> Result<Connection> {
        self.begin_connect()?;

        let url = self.config.control_url();
        info!("Connecting to {}", url);
        self.emit(SessionEvent::Connecting {
            url: url.to_string(),
        });

        let attempt = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(TunnelError::SessionClosed),
            result = timeout(CONNECT_TIMEOUT, self.connector.connect(url)) => match result {
                Ok(result) => result,
                Err(_) => Err(TunnelError::ConnectTimeout(CONNECT_TIMEOUT)),
            },
        };

        let connection = match attempt {
            Ok(connection) => connection,
            Err(e) => {
                self.transition(SessionState::Disconnected);
                return Err(e);
            }
        };

        self.on_connected(&connection)?;
        Ok(connection)
    }

    fn begin_connect(&self) -> Result<()> {
        let mut outcome = Ok(());
        self.state.send_if_modified(|state| match state {
            SessionState::Disconnected => {
                *state = SessionState::Connecting;
                true
            }
            SessionState::Closing | SessionState::Closed => {
                outcome = Err(TunnelError::SessionClosed);
                false
            }
            SessionState::Connecting | SessionState::Connected => {
                outcome = Err(TunnelError::AlreadyActive);
                false
            }
        });
        outcome
    }

    fn on_connected(&self, connection: &Connection) -> Result<()> {
        if !self.transition(SessionState::Connected) {
            let _ = connection.commands.send(TransportCommand::Close);
            return Err(TunnelError::SessionClosed);
        }

        let reconnected = self.info.borrow().is_some();
        let info = ConnectionInfo {
            public_url: self.config.relay_url.clone(),
            local_url: self.config.local_base_url.clone(),
            local_port: self.config.local_port,
            connected: true,
        };
        self.info.send_replace(Some(info.clone()));
        if let Ok(mut outbound) = self.outbound.lock() {
            *outbound = Some(connection.commands.clone());
        }

        info!("Connected to relay: {}", info.public_url);
        self.emit(SessionEvent::Connected { info, reconnected });
        Ok(())
    }

    /// Serve connections until the session is closed, reconnecting on loss.
    async fn drive(self: Arc<Self>, mut connection: Connection) {
        loop {
            let reason = self.serve(connection).await;
            if let Ok(mut outbound) = self.outbound.lock() {
                *outbound = None;
            }

            if self.shutdown.is_cancelled() {
                break;
            }
            self.on_disconnected(reason);

            match self.reconnect().await {
                Some(next) => connection = next,
                None => break,
            }
        }

        self.settle_closed();
    }

    /// Dispatch loop for one connection. Returns why the connection ended.
    async fn serve(self: &Arc<Self>, connection: Connection) -> String {
        let Connection {
            commands,
            mut events,
        } = connection;
        let _keepalive = Keepalive::start(commands.clone(), KEEPALIVE_INTERVAL);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    let _ = commands.send(TransportCommand::Close);
                    wait_for_close(&mut events).await;
                    return "closed by client".to_string();
                }
                event = events.recv() => match event {
                    Some(TransportEvent::Frame(text)) => self.dispatch(&text, &commands),
                    Some(TransportEvent::Closed(reason)) => {
                        return reason
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| "connection closed".to_string());
                    }
                    Some(TransportEvent::Error(e)) => {
                        warn!("Connection error: {}", e);
                        return e;
                    }
                    None => return "connection closed".to_string(),
                },
            }
        }
    }

    fn dispatch(self: &Arc<Self>, text: &str, commands: &mpsc::UnboundedSender<TransportCommand>) {
        let message = match WireMessage::decode(text) {
            Ok(message) => message,
            Err(DecodeError::InvalidRequest { request_id, source }) => {
                warn!("Rejecting request {}: {}", request_id, source);
                let response = bad_gateway(request_id);
                send_message(commands, &WireMessage::HttpResponse(response));
                return;
            }
            Err(e) => {
                warn!("Dropping frame: {}", TunnelError::from(e));
                return;
            }
        };

        match message {
            WireMessage::HttpRequest(request) => self.spawn_forward(request, commands.clone()),
            WireMessage::Ping { timestamp } => {
                debug!("Received ping, sending pong");
                send_message(commands, &WireMessage::pong(timestamp));
            }
            WireMessage::Pong { timestamp } => {
                debug!("Received pong ({})", timestamp);
            }
            WireMessage::Error { message } => {
                error!("{}", TunnelError::Relay(message.clone()));
                self.emit(SessionEvent::RelayError { message });
            }
            WireMessage::HttpResponse(response) => {
                debug!(
                    "Ignoring http_response for {} (client never issues requests)",
                    response.request_id
                );
            }
            WireMessage::Unknown { kind } => {
                debug!("Unknown message: {}", kind);
            }
        }
    }

    fn spawn_forward(
        self: &Arc<Self>,
        request: HttpRequest,
        commands: mpsc::UnboundedSender<TransportCommand>,
    ) {
        debug!(
            "{} {} -> {}",
            request.method, request.path, self.config.local_base_url
        );
        let session = Arc::clone(self);

        tokio::spawn(async move {
            let start = Instant::now();
            let method = request.method.clone();
            let path = request.path.clone();

            let response = session.forwarder.forward(request).await;

            session.emit(SessionEvent::RequestForwarded {
                method,
                path,
                status: response.status_code,
                duration_ms: start.elapsed().as_millis() as u64,
            });
            send_message(&commands, &WireMessage::HttpResponse(response));
        });
    }

    fn on_disconnected(&self, reason: String) {
        self.transition(SessionState::Disconnected);
        self.info.send_modify(|info| {
            if let Some(info) = info {
                info.connected = false;
            }
        });

        warn!("Tunnel connection closed: {}", reason);
        self.emit(SessionEvent::Disconnected { reason });
    }

    /// Retry until a connection is established or the session is closed.
    /// Attempts run one at a time.
    async fn reconnect(&self) -> Option<Connection> {
        let mut schedule = RetrySchedule::default();
        let mut delay = schedule.next_delay();

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return None,
                _ = sleep(delay) => {}
            }

            let attempt = schedule.attempts();
            info!("Attempting to reconnect (attempt {})", attempt);
            self.emit(SessionEvent::Reconnecting { attempt });

            match self.connect().await {
                Ok(connection) => return Some(connection),
                Err(TunnelError::SessionClosed) => return None,
                Err(e) => {
                    delay = schedule.next_delay();
                    warn!(
                        "Reconnection failed: {}. Retrying in {:?}",
                        e, delay
                    );
                    self.emit(SessionEvent::ReconnectFailed {
                        attempt,
                        error: e.to_string(),
                        next_retry_secs: delay.as_secs(),
                    });
                }
            }
        }
    }

    /// Move to `next` unless the session is shutting down.
    fn transition(&self, next: SessionState) -> bool {
        let mut allowed = true;
        self.state.send_if_modified(|state| {
            if state.is_shutting_down() {
                allowed = false;
                return false;
            }
            let changed = *state != next;
            *state = next;
            changed
        });
        allowed
    }

    fn settle_closed(&self) {
        let changed = self.state.send_if_modified(|state| {
            if *state == SessionState::Closed {
                return false;
            }
            *state = SessionState::Closed;
            true
        });
        if changed {
            info!("Tunnel closed");
            self.emit(SessionEvent::Closed);
        }
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

fn send_message(commands: &mpsc::UnboundedSender<TransportCommand>, message: &WireMessage) {
    match message.encode() {
        Ok(json) => {
            if commands.send(TransportCommand::Send(json)).is_err() {
                debug!("Dropping {} (connection closing)", message.kind());
            }
        }
        Err(e) => warn!("Failed to encode {}: {}", message.kind(), TunnelError::from(e)),
    }
}

/// Drain the event stream until the transport confirms it is gone.
async fn wait_for_close(events: &mut mpsc::Receiver<TransportEvent>) {
    let drained = timeout(CLOSE_GRACE, async {
        while let Some(event) = events.recv().await {
            if !matches!(event, TransportEvent::Frame(_)) {
                break;
            }
        }
    })
    .await;

    if drained.is_err() {
        debug!("Transport did not confirm close within {:?}", CLOSE_GRACE);
    }
}
