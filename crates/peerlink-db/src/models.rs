//! Database row types that have no counterpart in peerlink-types.
//! Transfer metadata rows map straight onto `TransferRecord`.

use peerlink_types::SendCheckpointKey;

/// Resume checkpoint of an outbound file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendCheckpoint {
    pub key: SendCheckpointKey,
    pub last_acked_chunk: u64,
    pub total_chunks: u64,
    pub updated_at: String,
}

/// Result of reassembling a stored transfer into a writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSummary {
    pub bytes_written: u64,
    pub chunks: u64,
    /// Hex SHA-256 of the reassembled content.
    pub sha256: String,
}
