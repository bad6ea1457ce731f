//! Protocol message types for tunnel communication.
//!
//! Defines the JSON frame format exchanged with the relay over the control
//! connection:
//! - [`WireMessage`] - the tagged envelope, one JSON object per frame
//! - [`HttpRequest`] / [`HttpResponse`] - forwarded request payloads
//!
//! Also provides type-safe ID wrappers for compile-time safety.

mod ids;
mod messages;

pub use ids::*;
pub use messages::*;
