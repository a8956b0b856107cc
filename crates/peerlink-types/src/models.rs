use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status shared by send-queue entries and persisted transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    Sending,
    Receiving,
    Paused,
    Sent,
    Complete,
    Failed,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::Receiving => "receiving",
            Self::Paused => "paused",
            Self::Sent => "sent",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    /// Terminal statuses never move again without an explicit new attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Complete | Self::Failed)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "sending" => Ok(Self::Sending),
            "receiving" => Ok(Self::Receiving),
            "paused" => Ok(Self::Paused),
            "sent" => Ok(Self::Sent),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown transfer status: {other}")),
        }
    }
}

/// One file transfer as tracked by the receiving side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub transfer_id: String,
    pub room_id: String,
    pub name: String,
    pub relative_path: Option<String>,
    pub size_bytes: u64,
    pub mime_type: String,
    pub total_chunks: u64,
    /// Number of chunks durably stored, contiguous from index 0.
    pub chunks_persisted: u64,
    pub status: TransferStatus,
    pub created_at: DateTime<Utc>,
}

impl TransferRecord {
    /// Progress as a whole percentage, 100 for an empty file.
    pub fn progress_percent(&self) -> u8 {
        if self.total_chunks == 0 {
            return if self.status == TransferStatus::Complete { 100 } else { 0 };
        }
        let pct = (self.chunks_persisted as f64 / self.total_chunks as f64 * 100.0).round();
        pct.min(100.0) as u8
    }

    pub fn is_complete(&self) -> bool {
        self.status == TransferStatus::Complete
    }
}

/// Natural identity of an outbound file across restarts.
///
/// A file handle cannot be persisted, so a send checkpoint is keyed by the
/// room it was offered in plus the file's name and size.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SendCheckpointKey {
    pub room_id: String,
    pub file_name: String,
    pub file_size: u64,
}

impl SendCheckpointKey {
    pub fn new(room_id: impl Into<String>, file_name: impl Into<String>, file_size: u64) -> Self {
        Self {
            room_id: room_id.into(),
            file_name: file_name.into(),
            file_size,
        }
    }
}
