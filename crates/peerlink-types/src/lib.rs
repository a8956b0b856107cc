//! Shared vocabulary for PeerLink: data-channel frames, signaling relay
//! messages and the persisted transfer models.

pub mod frames;
pub mod models;
pub mod signal;

pub use frames::{ChannelMessage, ControlFrame, Frame, FrameError};
pub use models::{SendCheckpointKey, TransferRecord, TransferStatus};
pub use signal::{SignalCommand, SignalEvent};
