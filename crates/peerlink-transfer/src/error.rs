use peerlink_types::FrameError;
use thiserror::Error;

use crate::sender::EntryId;

#[derive(Debug, Error)]
pub enum TransferError {
    /// The chunk store rejected a read or write. Protocol state was not advanced.
    #[error("storage error: {0:#}")]
    Storage(anyhow::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("channel error: {0}")]
    Channel(String),

    #[error(transparent)]
    Codec(#[from] FrameError),

    #[error("transfer {transfer_id} incomplete: {persisted} of {total} chunks stored")]
    IncompleteTransfer {
        transfer_id: String,
        persisted: u64,
        total: u64,
    },

    #[error("unexpected {frame} frame: {reason}")]
    UnexpectedFrame { frame: &'static str, reason: String },

    #[error("resume from chunk {from} is out of range (total {total})")]
    ResumeOutOfRange { from: u64, total: u64 },

    #[error("unknown queue entry {0}")]
    UnknownEntry(EntryId),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("no active transfer")]
    NoActiveTransfer,

    #[error("chunk {index} exceeds total of {total} chunks")]
    ChunkOverflow { index: u64, total: u64 },
}

impl TransferError {
    /// Violations of the wire protocol, as opposed to local failures.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::Codec(_)
                | Self::UnexpectedFrame { .. }
                | Self::ResumeOutOfRange { .. }
                | Self::ChunkOverflow { .. }
                | Self::IncompleteTransfer { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;
