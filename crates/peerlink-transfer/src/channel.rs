//! Data channel surface consumed by the transfer engines.

use peerlink_types::{ChannelMessage, ControlFrame};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::error::{Result, TransferError};

/// Events surfaced by an established peer channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Message(ChannelMessage),
    Close,
}

/// An ordered, reliable, message-oriented channel to the remote peer.
pub trait DataChannel: Send {
    fn send_text(&self, text: String) -> Result<()>;

    fn send_binary(&self, data: Vec<u8>) -> Result<()>;

    fn send_frame(&self, frame: &ControlFrame) -> Result<()> {
        self.send_text(frame.to_json())
    }
}

/// In-process channel: every send lands as a `ChannelEvent::Message` on the
/// peer's event queue.
#[derive(Debug, Clone)]
pub struct MpscChannel {
    peer: UnboundedSender<ChannelEvent>,
}

impl MpscChannel {
    /// Two connected ends. Both event queues start with `ChannelEvent::Open`.
    pub fn pair() -> (
        (MpscChannel, UnboundedReceiver<ChannelEvent>),
        (MpscChannel, UnboundedReceiver<ChannelEvent>),
    ) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let _ = a_tx.send(ChannelEvent::Open);
        let _ = b_tx.send(ChannelEvent::Open);

        // Each end writes into the other end's queue.
        ((MpscChannel { peer: b_tx }, a_rx), (MpscChannel { peer: a_tx }, b_rx))
    }

    /// Tell the peer the channel went away.
    pub fn close(&self) {
        let _ = self.peer.send(ChannelEvent::Close);
    }

    fn push(&self, msg: ChannelMessage) -> Result<()> {
        self.peer
            .send(ChannelEvent::Message(msg))
            .map_err(|_| TransferError::Channel("peer dropped its end of the channel".into()))
    }
}

impl DataChannel for MpscChannel {
    fn send_text(&self, text: String) -> Result<()> {
        self.push(ChannelMessage::Text(text))
    }

    fn send_binary(&self, data: Vec<u8>) -> Result<()> {
        self.push(ChannelMessage::Binary(data))
    }
}
