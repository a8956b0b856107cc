//! Test doubles shared by the engine unit tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use peerlink_db::{ChunkStore, Database};
use peerlink_types::{ChannelMessage, ControlFrame, Frame, SendCheckpointKey, TransferRecord, TransferStatus};

use crate::channel::DataChannel;

/// Channel that records everything sent through it.
#[derive(Default)]
pub struct RecordingChannel {
    sent: Mutex<Vec<ChannelMessage>>,
    failing: AtomicBool,
}

impl RecordingChannel {
    /// While failing, every send is rejected and nothing is recorded.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> crate::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(crate::TransferError::Channel("channel is closed".into()));
        }
        Ok(())
    }

    pub fn take(&self) -> Vec<ChannelMessage> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub fn control(msg: &ChannelMessage) -> Option<ControlFrame> {
        match Frame::try_from(msg.clone()) {
            Ok(Frame::Control(frame)) => Some(frame),
            _ => None,
        }
    }
}

impl DataChannel for RecordingChannel {
    fn send_text(&self, text: String) -> crate::Result<()> {
        self.check()?;
        self.sent.lock().unwrap().push(ChannelMessage::Text(text));
        Ok(())
    }

    fn send_binary(&self, data: Vec<u8>) -> crate::Result<()> {
        self.check()?;
        self.sent.lock().unwrap().push(ChannelMessage::Binary(data));
        Ok(())
    }
}

impl DataChannel for Arc<RecordingChannel> {
    fn send_text(&self, text: String) -> crate::Result<()> {
        self.as_ref().send_text(text)
    }

    fn send_binary(&self, data: Vec<u8>) -> crate::Result<()> {
        self.as_ref().send_binary(data)
    }
}

/// Database wrapper whose writes can be switched to fail.
pub struct FlakyStore {
    inner: Arc<Database>,
    fail_chunks: AtomicBool,
    fail_progress: AtomicBool,
    fail_checkpoints: AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: Arc<Database>) -> Self {
        Self {
            inner,
            fail_chunks: AtomicBool::new(false),
            fail_progress: AtomicBool::new(false),
            fail_checkpoints: AtomicBool::new(false),
        }
    }

    pub fn fail_chunks(&self, fail: bool) {
        self.fail_chunks.store(fail, Ordering::SeqCst);
    }

    pub fn fail_progress(&self, fail: bool) {
        self.fail_progress.store(fail, Ordering::SeqCst);
    }

    pub fn fail_checkpoints(&self, fail: bool) {
        self.fail_checkpoints.store(fail, Ordering::SeqCst);
    }
}

impl ChunkStore for FlakyStore {
    fn put_chunk(&self, transfer_id: &str, index: u64, data: &[u8]) -> Result<()> {
        if self.fail_chunks.load(Ordering::SeqCst) {
            bail!("disk full");
        }
        self.inner.put_chunk(transfer_id, index, data)
    }

    fn get_chunk(&self, transfer_id: &str, index: u64) -> Result<Option<Vec<u8>>> {
        self.inner.get_chunk(transfer_id, index)
    }

    fn highest_contiguous_index(&self, transfer_id: &str) -> Result<Option<u64>> {
        self.inner.highest_contiguous_index(transfer_id)
    }

    fn put_metadata(&self, record: &TransferRecord) -> Result<()> {
        self.inner.put_metadata(record)
    }

    fn get_metadata(&self, transfer_id: &str) -> Result<Option<TransferRecord>> {
        self.inner.get_metadata(transfer_id)
    }

    fn update_progress(
        &self,
        transfer_id: &str,
        chunks_persisted: u64,
        status: TransferStatus,
    ) -> Result<()> {
        if self.fail_progress.load(Ordering::SeqCst) {
            bail!("disk full");
        }
        self.inner.update_progress(transfer_id, chunks_persisted, status)
    }

    fn list_by_room(&self, room_id: &str) -> Result<Vec<TransferRecord>> {
        self.inner.list_by_room(room_id)
    }

    fn find_resumable(&self, room_id: &str, name: &str, size: u64) -> Result<Option<TransferRecord>> {
        self.inner.find_resumable(room_id, name, size)
    }

    fn latest_in_progress(&self, room_id: &str) -> Result<Option<TransferRecord>> {
        self.inner.latest_in_progress(room_id)
    }

    fn delete_transfer(&self, transfer_id: &str) -> Result<()> {
        self.inner.delete_transfer(transfer_id)
    }

    fn put_send_checkpoint(
        &self,
        key: &SendCheckpointKey,
        last_acked_chunk: u64,
        total_chunks: u64,
    ) -> Result<()> {
        if self.fail_checkpoints.load(Ordering::SeqCst) {
            bail!("disk full");
        }
        self.inner.put_send_checkpoint(key, last_acked_chunk, total_chunks)
    }

    fn get_send_checkpoint(&self, key: &SendCheckpointKey) -> Result<i64> {
        self.inner.get_send_checkpoint(key)
    }

    fn clear_send_checkpoint(&self, key: &SendCheckpointKey) -> Result<()> {
        self.inner.clear_send_checkpoint(key)
    }
}
