use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raw message as surfaced by the data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Text(String),
    Binary(Vec<u8>),
}

/// Control frames exchanged over the data channel as JSON text.
///
/// Chunk payloads never travel as control frames; they are raw binary
/// messages whose index is implied by their position in the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    /// Sender announces a new file.
    Meta {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        size: u64,
        #[serde(rename = "mimeType")]
        mime_type: String,
        #[serde(rename = "totalChunks")]
        total_chunks: u64,
    },

    /// Receiver durably stored chunk `chunk`.
    Ack { chunk: u64 },

    /// Receiver asks the sender to continue from `from_chunk`.
    ResumeReq {
        #[serde(rename = "fromChunk")]
        from_chunk: u64,
    },

    /// Receiver asks the sender to stop after the in-flight chunk.
    PauseReq,

    /// Either side abandons the transfer.
    Cancel,

    /// Sender has sent every chunk.
    Done,
}

impl ControlFrame {
    /// Wire name of the frame, as found in the `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Meta { .. } => "meta",
            Self::Ack { .. } => "ack",
            Self::ResumeReq { .. } => "resume_req",
            Self::PauseReq => "pause_req",
            Self::Cancel => "cancel",
            Self::Done => "done",
        }
    }

    pub fn to_json(&self) -> String {
        // A tagged enum of plain fields always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// A decoded data-channel frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Control(ControlFrame),
    Chunk(Vec<u8>),
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Control(frame) => frame.kind(),
            Self::Chunk(_) => "chunk",
        }
    }
}

#[derive(Debug, Error)]
#[error("malformed control frame: {0}")]
pub struct FrameError(#[from] pub serde_json::Error);

impl TryFrom<ChannelMessage> for Frame {
    type Error = FrameError;

    fn try_from(msg: ChannelMessage) -> Result<Self, Self::Error> {
        match msg {
            ChannelMessage::Text(text) => serde_json::from_str(&text)
                .map(Frame::Control)
                .map_err(FrameError),
            ChannelMessage::Binary(data) => Ok(Frame::Chunk(data)),
        }
    }
}

impl From<ControlFrame> for ChannelMessage {
    fn from(frame: ControlFrame) -> Self {
        ChannelMessage::Text(frame.to_json())
    }
}
