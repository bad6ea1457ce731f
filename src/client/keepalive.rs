use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

use super::transport::TransportCommand;
use crate::protocol::WireMessage;

pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Periodic `ping` frames for one live connection.
///
/// The first ping goes out one full period after start. The timer stops as
/// soon as this handle is dropped, so a stale timer can never outlive the
/// connection it was started for.
pub struct Keepalive {
    _guard: DropGuard,
}

impl Keepalive {
    pub fn start(commands: mpsc::UnboundedSender<TransportCommand>, period: Duration) -> Self {
        let token = CancellationToken::new();
        let cancelled = token.clone();

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        let json = match WireMessage::ping_now().encode() {
                            Ok(json) => json,
                            Err(e) => {
                                warn!("Failed to encode ping: {}", e);
                                continue;
                            }
                        };
                        if commands.send(TransportCommand::Send(json)).is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("Keepalive stopped");
        });

        Self {
            _guard: token.drop_guard(),
        }
    }
}
