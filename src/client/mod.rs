//! Tunnel client implementation.
//!
//! This module provides the core tunnel functionality:
//! - [`Session`] - owns the control connection, dispatches frames, reconnects
//! - HTTP proxy for forwarding requests to the local service
//! - Keepalive pings and the fixed reconnect schedule
//! - Console reporting of session lifecycle events

mod connection;
mod http_proxy;
mod keepalive;
mod reconnect;
mod reporter;
mod transport;

pub use connection::Session;
pub use reporter::{create_event_channel, ConsoleReporter};
pub use transport::WsConnector;
