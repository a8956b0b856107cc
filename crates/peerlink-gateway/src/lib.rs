//! Signaling relay: rooms of WebSocket sessions exchanging offer, answer
//! and candidate messages verbatim.

pub mod connection;
pub mod relay;

pub use relay::{Relay, SessionId};
