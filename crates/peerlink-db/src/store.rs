use anyhow::Result;

use peerlink_types::{SendCheckpointKey, TransferRecord, TransferStatus};

/// Persistence contract the transfer engines rely on.
///
/// Every method returns only after the change is durable (or has failed).
/// Callers must not advance protocol state when a write returns an error.
pub trait ChunkStore: Send + Sync {
    /// Store one chunk. Writing an existing index replaces it.
    fn put_chunk(&self, transfer_id: &str, index: u64, data: &[u8]) -> Result<()>;

    fn get_chunk(&self, transfer_id: &str, index: u64) -> Result<Option<Vec<u8>>>;

    /// Highest `k` such that chunks `0..=k` all exist, or `None` if chunk 0 is
    /// missing.
    fn highest_contiguous_index(&self, transfer_id: &str) -> Result<Option<u64>>;

    /// Insert or replace transfer metadata.
    fn put_metadata(&self, record: &TransferRecord) -> Result<()>;

    fn get_metadata(&self, transfer_id: &str) -> Result<Option<TransferRecord>>;

    fn update_progress(
        &self,
        transfer_id: &str,
        chunks_persisted: u64,
        status: TransferStatus,
    ) -> Result<()>;

    /// All transfers of a room, oldest first.
    fn list_by_room(&self, room_id: &str) -> Result<Vec<TransferRecord>>;

    /// Most recent unfinished transfer of the same file in the same room.
    fn find_resumable(&self, room_id: &str, name: &str, size: u64) -> Result<Option<TransferRecord>>;

    /// Most recent transfer of the room that was still receiving.
    fn latest_in_progress(&self, room_id: &str) -> Result<Option<TransferRecord>>;

    /// Remove metadata and every chunk of a transfer in one transaction.
    fn delete_transfer(&self, transfer_id: &str) -> Result<()>;

    fn put_send_checkpoint(
        &self,
        key: &SendCheckpointKey,
        last_acked_chunk: u64,
        total_chunks: u64,
    ) -> Result<()>;

    /// Last acknowledged chunk for an outbound file, `-1` if none.
    fn get_send_checkpoint(&self, key: &SendCheckpointKey) -> Result<i64>;

    fn clear_send_checkpoint(&self, key: &SendCheckpointKey) -> Result<()>;
}
