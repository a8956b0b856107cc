//! Send queue with a strict stop-and-wait sender.
//!
//! ```text
//! enqueue ─▶ Pending ─▶ Sending ─▶ Sent
//!              ▲   │       │
//!              │   ▼       ▼
//!              └─ Paused ◀─┘        (cancel removes the entry)
//! ```
//!
//! Exactly one entry is `Sending` at a time and it has at most one chunk in
//! flight. The acknowledged cursor is persisted as a send checkpoint before
//! the next chunk leaves, so a restarted sender picks up where the receiver
//! left off.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use peerlink_db::ChunkStore;
use peerlink_types::{ControlFrame, SendCheckpointKey, TransferStatus};

use crate::channel::DataChannel;
use crate::error::{Result, TransferError};
use crate::logging::{TransferEvent, TransferLog, TransferLogger};
use crate::protocol;
use crate::source::FileSource;
use crate::stats::{self, RateEstimate};

/// Engine-assigned queue entry id.
pub type EntryId = u64;

struct QueueEntry {
    id: EntryId,
    source: Box<dyn FileSource>,
    key: SendCheckpointKey,
    total_chunks: u64,
    status: TransferStatus,
    /// Last acknowledged chunk, -1 if none.
    last_sent_chunk: i64,
    in_flight: Option<u64>,
    /// Meta went out and nothing has answered it yet.
    awaiting_first_reply: bool,
    /// The receiver may not hold this entry as its current transfer.
    needs_announce: bool,
    started_at: Option<Instant>,
}

impl QueueEntry {
    fn acked_chunks(&self) -> u64 {
        (self.last_sent_chunk + 1) as u64
    }

    fn snapshot(&self) -> EntrySnapshot {
        let size = self.source.size();
        let finished = self.status == TransferStatus::Sent;
        EntrySnapshot {
            id: self.id,
            name: self.source.name().to_string(),
            relative_path: self.source.relative_path().map(str::to_string),
            size,
            mime_type: self.source.mime_type().to_string(),
            status: self.status,
            total_chunks: self.total_chunks,
            last_sent_chunk: self.last_sent_chunk,
            progress: protocol::percent(self.acked_chunks(), self.total_chunks, finished),
            bytes_transferred: protocol::bytes_through(size, self.acked_chunks()),
            elapsed: self.started_at.map(|t| t.elapsed()),
        }
    }
}

/// Point-in-time view of a queue entry.
#[derive(Debug, Clone, PartialEq)]
pub struct EntrySnapshot {
    pub id: EntryId,
    pub name: String,
    pub relative_path: Option<String>,
    pub size: u64,
    pub mime_type: String,
    pub status: TransferStatus,
    pub total_chunks: u64,
    pub last_sent_chunk: i64,
    pub progress: u8,
    pub bytes_transferred: u64,
    pub elapsed: Option<Duration>,
}

impl EntrySnapshot {
    pub fn rate(&self) -> RateEstimate {
        stats::estimate(
            self.bytes_transferred,
            self.size,
            self.elapsed.unwrap_or_default(),
        )
    }
}

/// Which transfer the receiver treats as current, as far as we know.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Announced {
    /// Nothing announced on this engine yet. A checkpointed entry is assumed
    /// to be the receiver's current transfer.
    Unknown,
    /// The receiver dropped its current transfer after a `cancel`.
    Discarded,
    Entry(EntryId),
}

/// Reply still owed for an entry that stopped sending with a chunk on the
/// wire. Replies arrive in send order, so these are matched front first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owed {
    Ack { entry: EntryId, index: u64 },
    /// Answer to a meta: `ack 0` or `resume_req`.
    FirstReply { entry: EntryId },
}

impl Owed {
    fn entry(&self) -> EntryId {
        match *self {
            Owed::Ack { entry, .. } | Owed::FirstReply { entry } => entry,
        }
    }
}

pub struct SendEngine {
    room_id: String,
    store: Arc<dyn ChunkStore>,
    logger: Arc<dyn TransferLogger>,
    entries: Vec<QueueEntry>,
    next_id: EntryId,
    active: Option<EntryId>,
    channel_open: bool,
    announced: Announced,
    owed: VecDeque<Owed>,
}

impl SendEngine {
    pub fn new(
        room_id: impl Into<String>,
        store: Arc<dyn ChunkStore>,
        logger: Arc<dyn TransferLogger>,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            store,
            logger,
            entries: Vec::new(),
            next_id: 1,
            active: None,
            channel_open: false,
            announced: Announced::Unknown,
            owed: VecDeque::new(),
        }
    }

    /// Add a file to the back of the queue. Picks up an existing send
    /// checkpoint for the same `(room, name, size)`.
    pub fn enqueue(&mut self, source: Box<dyn FileSource>) -> Result<EntryId> {
        let key = SendCheckpointKey::new(self.room_id.as_str(), source.name(), source.size());
        let total_chunks = protocol::total_chunks(source.size());
        let checkpoint = self
            .store
            .get_send_checkpoint(&key)
            .map_err(TransferError::Storage)?;
        let last_sent_chunk = checkpoint.clamp(-1, total_chunks as i64 - 1);

        let id = self.next_id;
        self.next_id += 1;

        self.log(
            id,
            TransferEvent::Queued {
                name: source.name().to_string(),
                size: source.size(),
                resume_from: last_sent_chunk + 1,
            },
        );

        self.entries.push(QueueEntry {
            id,
            source,
            key,
            total_chunks,
            status: TransferStatus::Pending,
            last_sent_chunk,
            in_flight: None,
            awaiting_first_reply: false,
            needs_announce: false,
            started_at: None,
        });
        Ok(id)
    }

    /// Start pending entries in queue order until one is sending or the
    /// queue runs dry. An entry that fails to start does not hold up the
    /// rest; the first such error is returned.
    pub fn drive_queue(&mut self, channel: &dyn DataChannel) -> Result<()> {
        let mut first_error = None;
        while self.channel_open && self.active.is_none() {
            let Some(id) = self
                .entries
                .iter()
                .find(|e| e.status == TransferStatus::Pending)
                .map(|e| e.id)
            else {
                break;
            };
            if let Err(e) = self.begin_transfer(channel, id) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Make `id` the sending entry and put its next chunk on the wire.
    ///
    /// A read or channel failure leaves no entry `Sending`: the entry is
    /// marked `Failed` (bad source) or returned to `Pending` (channel gone).
    pub fn begin_transfer(&mut self, channel: &dyn DataChannel, id: EntryId) -> Result<()> {
        let idx = self.index_of(id)?;
        if self.active.is_some_and(|active| active != id) {
            return Err(TransferError::InvalidState(
                "another entry is already sending".into(),
            ));
        }
        if self.entries[idx].status != TransferStatus::Pending {
            return Err(TransferError::InvalidState(format!(
                "entry {} is {}, not pending",
                id, self.entries[idx].status
            )));
        }

        // The paused chunk is still on the wire; wait for its ack instead of
        // sending it a second time.
        let reattach = self.owed.iter().enumerate().find_map(|(pos, owed)| match *owed {
            Owed::Ack { entry, index } if entry == id => Some((pos, index)),
            _ => None,
        });
        if let Some((pos, index)) = reattach {
            self.owed.remove(pos);
            let entry = &mut self.entries[idx];
            entry.status = TransferStatus::Sending;
            entry.in_flight = Some(index);
            self.active = Some(id);
            return Ok(());
        }

        let entry = &mut self.entries[idx];
        entry.status = TransferStatus::Sending;
        entry.started_at.get_or_insert_with(Instant::now);
        let resuming = entry.last_sent_chunk >= 0;
        self.active = Some(id);

        if !resuming || !self.receiver_holds(idx) {
            return self.announce(channel, idx);
        }

        self.announced = Announced::Entry(id);
        let entry = &mut self.entries[idx];
        entry.awaiting_first_reply = false;
        let cursor = entry.acked_chunks();
        if cursor >= entry.total_chunks {
            return self.finish(channel, idx);
        }
        self.send_chunk(channel, idx, cursor)
    }

    /// Route one control frame from the receiver.
    pub fn handle_frame(&mut self, channel: &dyn DataChannel, frame: &ControlFrame) -> Result<()> {
        match frame {
            ControlFrame::Ack { chunk } => self.on_ack(channel, *chunk),
            ControlFrame::ResumeReq { from_chunk } => self.on_resume_request(channel, *from_chunk),
            ControlFrame::PauseReq => self.on_pause_request(),
            ControlFrame::Cancel => self.on_remote_cancel(),
            other => Err(TransferError::UnexpectedFrame {
                frame: other.kind(),
                reason: "not valid for the sending side".into(),
            }),
        }
    }

    pub fn on_ack(&mut self, channel: &dyn DataChannel, index: u64) -> Result<()> {
        match self.owed.front().copied() {
            Some(Owed::Ack { entry, index: owed }) if owed == index => {
                self.owed.pop_front();
                return self.credit_owed(entry, index);
            }
            Some(Owed::FirstReply { entry }) if index == 0 => {
                self.owed.pop_front();
                self.log(entry, TransferEvent::StaleAck { index, expected: None });
                return Ok(());
            }
            _ => {}
        }

        let Some(id) = self.active else {
            self.log(0, TransferEvent::StaleAck { index, expected: None });
            return Ok(());
        };
        let idx = self.index_of(id)?;

        let expected = self.entries[idx].in_flight;
        if expected != Some(index) {
            self.log(id, TransferEvent::StaleAck { index, expected });
            return Ok(());
        }

        let entry = &self.entries[idx];
        self.store
            .put_send_checkpoint(&entry.key, index, entry.total_chunks)
            .map_err(TransferError::Storage)?;

        let entry = &mut self.entries[idx];
        entry.last_sent_chunk = index as i64;
        entry.in_flight = None;
        entry.awaiting_first_reply = false;
        let next = index + 1;
        let total = entry.total_chunks;
        self.log(id, TransferEvent::ChunkAcked { index });

        // Re-attached after another file took over the receiver.
        if !self.receiver_holds(idx) {
            return self.announce(channel, idx);
        }
        if next >= total {
            self.finish(channel, idx)?;
            return self.drive_queue(channel);
        }
        self.send_chunk(channel, idx, next)
    }

    /// Jump the active entry to `from`. Chunks before it are already stored
    /// on the receiving side.
    pub fn on_resume_request(&mut self, channel: &dyn DataChannel, from: u64) -> Result<()> {
        if let Some(Owed::FirstReply { entry }) = self.owed.front().copied() {
            self.owed.pop_front();
            self.log(entry, TransferEvent::StaleAck { index: from, expected: None });
            return Ok(());
        }

        let Some(id) = self.active else {
            return Err(TransferError::UnexpectedFrame {
                frame: "resume_req",
                reason: "no entry is sending".into(),
            });
        };
        let idx = self.index_of(id)?;

        // Answer to a repeated meta for the chunk already on the wire.
        if self.entries[idx].in_flight == Some(from) && !self.entries[idx].awaiting_first_reply {
            return Ok(());
        }

        let total = self.entries[idx].total_chunks;
        if from > total {
            let entry = &mut self.entries[idx];
            entry.status = TransferStatus::Failed;
            entry.in_flight = None;
            self.active = None;
            self.log(
                id,
                TransferEvent::Error {
                    message: format!("resume from {} past {} chunks", from, total),
                },
            );
            return Err(TransferError::ResumeOutOfRange { from, total });
        }

        self.log(id, TransferEvent::ResumeRequested { from_chunk: from });

        let entry = &self.entries[idx];
        let saved = match from {
            0 => self.store.clear_send_checkpoint(&entry.key),
            _ => self.store.put_send_checkpoint(&entry.key, from - 1, total),
        };
        saved.map_err(TransferError::Storage)?;

        let entry = &mut self.entries[idx];
        entry.last_sent_chunk = from as i64 - 1;
        entry.in_flight = None;
        entry.awaiting_first_reply = false;

        if from == total {
            self.finish(channel, idx)?;
            return self.drive_queue(channel);
        }
        self.send_chunk(channel, idx, from)
    }

    /// Receiver asked us to stop. Nothing is sent.
    pub fn on_pause_request(&mut self) -> Result<()> {
        match self.active {
            Some(id) => self.pause(id),
            None => Ok(()),
        }
    }

    pub fn pause(&mut self, id: EntryId) -> Result<()> {
        let idx = self.index_of(id)?;

        match self.entries[idx].status {
            TransferStatus::Sending => {
                self.stop_active(idx);
                let entry = &mut self.entries[idx];
                entry.status = TransferStatus::Paused;
                let chunks = entry.acked_chunks();
                self.log(id, TransferEvent::Paused { chunks });
                Ok(())
            }
            TransferStatus::Pending => {
                self.entries[idx].status = TransferStatus::Paused;
                Ok(())
            }
            other => Err(TransferError::InvalidState(format!(
                "cannot pause entry {} while {}",
                id, other
            ))),
        }
    }

    pub fn resume(&mut self, channel: &dyn DataChannel, id: EntryId) -> Result<()> {
        let idx = self.index_of(id)?;
        let entry = &mut self.entries[idx];
        if entry.status != TransferStatus::Paused {
            return Err(TransferError::InvalidState(format!(
                "cannot resume entry {} while {}",
                id, entry.status
            )));
        }
        entry.status = TransferStatus::Pending;
        self.drive_queue(channel)
    }

    /// Drop an entry. An active entry tells the receiver to discard its
    /// partial file.
    pub fn cancel(&mut self, channel: &dyn DataChannel, id: EntryId) -> Result<()> {
        let idx = self.index_of(id)?;

        if self.active == Some(id) {
            channel.send_frame(&ControlFrame::Cancel)?;
            self.stop_active(idx);
            self.announced = Announced::Discarded;
        }

        self.remove_entry(idx)?;
        self.log(id, TransferEvent::Cancelled { by_peer: false });
        Ok(())
    }

    /// Cancel every entry. Returns how many were removed.
    pub fn clear_queue(&mut self, channel: &dyn DataChannel) -> Result<usize> {
        let ids: Vec<EntryId> = self.entries.iter().map(|e| e.id).collect();
        for id in &ids {
            self.cancel(channel, *id)?;
        }
        Ok(ids.len())
    }

    /// Receiver abandoned its current transfer: the entry we announced last,
    /// or the one sending when nothing was announced on this engine.
    pub fn on_remote_cancel(&mut self) -> Result<()> {
        let target = match self.announced {
            Announced::Entry(id) => Some(id),
            Announced::Unknown => self.active,
            Announced::Discarded => None,
        };
        self.announced = Announced::Discarded;

        let Some(id) = target else {
            return Ok(());
        };
        let Some(idx) = self.entries.iter().position(|e| e.id == id) else {
            return Ok(());
        };
        if self.entries[idx].status.is_terminal() {
            return Ok(());
        }

        if self.active == Some(id) {
            self.active = None;
        }
        // Replies sent before the cancel have already arrived.
        self.owed.retain(|owed| owed.entry() != id);
        self.remove_entry(idx)?;
        self.log(id, TransferEvent::Cancelled { by_peer: true });
        Ok(())
    }

    pub fn on_channel_open(&mut self, channel: &dyn DataChannel) -> Result<()> {
        self.channel_open = true;
        self.drive_queue(channel)
    }

    /// Freeze the active entry back to pending at its acknowledged cursor.
    pub fn on_channel_closed(&mut self) {
        self.channel_open = false;
        self.owed.clear();

        if let Some(id) = self.active.take() {
            if let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) {
                entry.status = TransferStatus::Pending;
                if entry.in_flight.take().is_some() && entry.awaiting_first_reply {
                    entry.needs_announce = true;
                }
                entry.awaiting_first_reply = false;
            }
        }
    }

    pub fn entries(&self) -> Vec<EntrySnapshot> {
        self.entries.iter().map(QueueEntry::snapshot).collect()
    }

    pub fn entry(&self, id: EntryId) -> Option<EntrySnapshot> {
        self.entries.iter().find(|e| e.id == id).map(QueueEntry::snapshot)
    }

    pub fn active(&self) -> Option<EntryId> {
        self.active
    }

    pub fn is_channel_open(&self) -> bool {
        self.channel_open
    }

    // -- internals --

    fn index_of(&self, id: EntryId) -> Result<usize> {
        self.entries
            .iter()
            .position(|e| e.id == id)
            .ok_or(TransferError::UnknownEntry(id))
    }

    /// Whether the receiver still treats this entry as its current transfer.
    fn receiver_holds(&self, idx: usize) -> bool {
        let entry = &self.entries[idx];
        if entry.needs_announce {
            return false;
        }
        match self.announced {
            Announced::Unknown => true,
            Announced::Discarded => false,
            Announced::Entry(id) => id == entry.id,
        }
    }

    /// Send meta and chunk 0. The receiver answers with `ack 0`, or with
    /// `resume_req` when it already holds part of the file.
    fn announce(&mut self, channel: &dyn DataChannel, idx: usize) -> Result<()> {
        let entry = &self.entries[idx];
        let id = entry.id;
        let meta = ControlFrame::Meta {
            name: entry.source.name().to_string(),
            path: entry.source.relative_path().map(str::to_string),
            size: entry.source.size(),
            mime_type: entry.source.mime_type().to_string(),
            total_chunks: entry.total_chunks,
        };
        let event = TransferEvent::MetaSent {
            name: entry.source.name().to_string(),
            total_chunks: entry.total_chunks,
            reannounce: entry.last_sent_chunk >= 0,
        };

        if let Err(e) = channel.send_frame(&meta) {
            return Err(self.abort_active(idx, e));
        }
        self.announced = Announced::Entry(id);
        self.log(id, event);

        let entry = &mut self.entries[idx];
        entry.needs_announce = false;
        if entry.total_chunks == 0 {
            return self.finish(channel, idx);
        }
        entry.awaiting_first_reply = true;
        self.send_chunk(channel, idx, 0)
    }

    /// Take the active entry off the wire, remembering the reply its
    /// in-flight chunk will still draw.
    fn stop_active(&mut self, idx: usize) {
        let entry = &mut self.entries[idx];
        if let Some(index) = entry.in_flight.take() {
            let owed = if entry.awaiting_first_reply {
                // The receiver may drop this chunk while resuming.
                entry.needs_announce = true;
                Owed::FirstReply { entry: entry.id }
            } else {
                Owed::Ack {
                    entry: entry.id,
                    index,
                }
            };
            self.owed.push_back(owed);
        }
        entry.awaiting_first_reply = false;
        self.active = None;
    }

    /// Unwind the active entry after a local failure. A channel error puts
    /// it back to `Pending` as if the channel had closed; anything else
    /// fails it.
    fn abort_active(&mut self, idx: usize, err: TransferError) -> TransferError {
        let entry = &mut self.entries[idx];
        let id = entry.id;
        entry.in_flight = None;
        if matches!(err, TransferError::Channel(_)) {
            entry.status = TransferStatus::Pending;
            if entry.awaiting_first_reply {
                entry.needs_announce = true;
            }
            self.channel_open = false;
        } else {
            entry.status = TransferStatus::Failed;
        }
        entry.awaiting_first_reply = false;
        self.active = None;
        self.log(
            id,
            TransferEvent::Error {
                message: format!("send aborted: {}", err),
            },
        );
        err
    }

    fn send_chunk(&mut self, channel: &dyn DataChannel, idx: usize, index: u64) -> Result<()> {
        let entry = &mut self.entries[idx];
        let size = entry.source.size();
        let Some(range) = protocol::chunk_range(size, index) else {
            let total = entry.total_chunks;
            return Err(self.abort_active(idx, TransferError::ChunkOverflow { index, total }));
        };

        let data = match entry
            .source
            .read_at(range.start, (range.end - range.start) as usize)
        {
            Ok(data) => data,
            Err(e) => return Err(self.abort_active(idx, e.into())),
        };
        let len = data.len();
        if let Err(e) = channel.send_binary(data) {
            return Err(self.abort_active(idx, e));
        }

        let entry = &mut self.entries[idx];
        entry.in_flight = Some(index);
        let id = entry.id;
        self.log(id, TransferEvent::ChunkSent { index, size: len });
        Ok(())
    }

    fn finish(&mut self, channel: &dyn DataChannel, idx: usize) -> Result<()> {
        if let Err(e) = channel.send_frame(&ControlFrame::Done) {
            return Err(self.abort_active(idx, e));
        }

        let entry = &mut self.entries[idx];
        entry.status = TransferStatus::Sent;
        entry.in_flight = None;
        entry.awaiting_first_reply = false;
        entry.last_sent_chunk = entry.total_chunks as i64 - 1;
        let id = entry.id;
        let size = entry.source.size();
        let chunks = entry.total_chunks;
        let duration_ms = entry
            .started_at
            .map_or(0, |t| t.elapsed().as_millis() as u64);
        self.active = None;

        if let Err(e) = self.store.clear_send_checkpoint(&self.entries[idx].key) {
            self.log(
                id,
                TransferEvent::Error {
                    message: format!("failed to clear send checkpoint: {:#}", e),
                },
            );
        }

        self.log(
            id,
            TransferEvent::Complete {
                total_bytes: size,
                chunks,
                duration_ms,
            },
        );
        Ok(())
    }

    /// Record a late ack for an entry that is no longer sending.
    fn credit_owed(&mut self, id: EntryId, index: u64) -> Result<()> {
        let Some(idx) = self.entries.iter().position(|e| e.id == id) else {
            return Ok(());
        };

        let entry = &self.entries[idx];
        self.store
            .put_send_checkpoint(&entry.key, index, entry.total_chunks)
            .map_err(TransferError::Storage)?;

        self.entries[idx].last_sent_chunk = index as i64;
        self.log(id, TransferEvent::ChunkAcked { index });
        Ok(())
    }

    fn remove_entry(&mut self, idx: usize) -> Result<()> {
        let entry = self.entries.remove(idx);
        self.store
            .clear_send_checkpoint(&entry.key)
            .map_err(TransferError::Storage)
    }

    fn log(&self, id: EntryId, event: TransferEvent) {
        self.logger.log(TransferLog {
            component: "sender",
            transfer_id: format!("entry-{}", id),
            event,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::NullLogger;
    use crate::source::MemorySource;
    use crate::testing::{FlakyStore, RecordingChannel};
    use peerlink_db::Database;
    use peerlink_types::ChannelMessage;

    const C: usize = protocol::CHUNK_SIZE;

    fn engine() -> (SendEngine, Arc<Database>) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let engine = SendEngine::new("room", db.clone(), Arc::new(NullLogger));
        (engine, db)
    }

    fn file(name: &str, len: usize) -> Box<dyn FileSource> {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        Box::new(MemorySource::new(name, data))
    }

    #[test]
    fn fresh_entry_sends_meta_then_first_chunk() {
        let (mut engine, _db) = engine();
        let ch = RecordingChannel::default();

        let id = engine.enqueue(file("a.bin", 200_000)).unwrap();
        assert!(ch.take().is_empty(), "enqueue must not send");

        engine.on_channel_open(&ch).unwrap();
        let sent = ch.take();
        assert_eq!(sent.len(), 2);
        assert_eq!(
            RecordingChannel::control(&sent[0]),
            Some(ControlFrame::Meta {
                name: "a.bin".into(),
                path: None,
                size: 200_000,
                mime_type: "application/octet-stream".into(),
                total_chunks: 4,
            })
        );
        assert!(matches!(&sent[1], ChannelMessage::Binary(b) if b.len() == C));
        assert_eq!(engine.active(), Some(id));
        assert_eq!(engine.entry(id).unwrap().status, TransferStatus::Sending);
    }

    #[test]
    fn acks_advance_one_chunk_at_a_time() {
        let (mut engine, db) = engine();
        let ch = RecordingChannel::default();
        let id = engine.enqueue(file("a.bin", 200_000)).unwrap();
        engine.on_channel_open(&ch).unwrap();
        ch.take();

        for i in 0..3u64 {
            engine.on_ack(&ch, i).unwrap();
            let sent = ch.take();
            assert_eq!(sent.len(), 1, "exactly one chunk per ack");
            let expected_len = protocol::chunk_len(200_000, i + 1);
            assert!(matches!(&sent[0], ChannelMessage::Binary(b) if b.len() == expected_len));
            let key = SendCheckpointKey::new("room", "a.bin", 200_000);
            assert_eq!(db.get_send_checkpoint(&key).unwrap(), i as i64);
        }

        engine.on_ack(&ch, 3).unwrap();
        let sent = ch.take();
        assert_eq!(RecordingChannel::control(&sent[0]), Some(ControlFrame::Done));

        let snap = engine.entry(id).unwrap();
        assert_eq!(snap.status, TransferStatus::Sent);
        assert_eq!(snap.progress, 100);
        assert_eq!(snap.bytes_transferred, 200_000);
        assert_eq!(
            db.get_send_checkpoint(&SendCheckpointKey::new("room", "a.bin", 200_000))
                .unwrap(),
            -1
        );
    }

    #[test]
    fn stale_ack_is_ignored() {
        let (mut engine, _db) = engine();
        let ch = RecordingChannel::default();
        let id = engine.enqueue(file("a.bin", 200_000)).unwrap();
        engine.on_channel_open(&ch).unwrap();
        engine.on_ack(&ch, 0).unwrap();
        engine.on_ack(&ch, 1).unwrap();
        ch.take();

        // Chunk 2 is in flight; acks for 1 (duplicate) and 3 (future) move nothing.
        engine.on_ack(&ch, 1).unwrap();
        engine.on_ack(&ch, 3).unwrap();
        assert!(ch.take().is_empty());
        assert_eq!(engine.entry(id).unwrap().last_sent_chunk, 1);
    }

    #[test]
    fn empty_file_sends_meta_then_done() {
        let (mut engine, _db) = engine();
        let ch = RecordingChannel::default();
        let id = engine.enqueue(file("empty.txt", 0)).unwrap();
        engine.on_channel_open(&ch).unwrap();

        let sent = ch.take();
        assert_eq!(sent.len(), 2);
        assert!(matches!(
            RecordingChannel::control(&sent[0]),
            Some(ControlFrame::Meta { total_chunks: 0, .. })
        ));
        assert_eq!(RecordingChannel::control(&sent[1]), Some(ControlFrame::Done));
        let snap = engine.entry(id).unwrap();
        assert_eq!(snap.status, TransferStatus::Sent);
        assert_eq!(snap.progress, 100);
        assert_eq!(engine.active(), None);
    }

    #[test]
    fn queue_advances_to_next_entry_on_completion() {
        let (mut engine, _db) = engine();
        let ch = RecordingChannel::default();
        let first = engine.enqueue(file("a.bin", 10)).unwrap();
        let second = engine.enqueue(file("b.bin", 10)).unwrap();
        engine.on_channel_open(&ch).unwrap();
        ch.take();
        assert_eq!(engine.active(), Some(first));

        engine.on_ack(&ch, 0).unwrap();
        let sent = ch.take();
        assert_eq!(RecordingChannel::control(&sent[0]), Some(ControlFrame::Done));
        assert!(matches!(
            RecordingChannel::control(&sent[1]),
            Some(ControlFrame::Meta { ref name, .. }) if name == "b.bin"
        ));
        assert!(matches!(&sent[2], ChannelMessage::Binary(_)));
        assert_eq!(engine.active(), Some(second));
    }

    #[test]
    fn checkpoint_resume_skips_meta() {
        let (mut engine, db) = engine();
        let key = SendCheckpointKey::new("room", "a.bin", 200_000);
        db.put_send_checkpoint(&key, 1, 4).unwrap();

        let ch = RecordingChannel::default();
        let id = engine.enqueue(file("a.bin", 200_000)).unwrap();
        assert_eq!(engine.entry(id).unwrap().last_sent_chunk, 1);

        engine.on_channel_open(&ch).unwrap();
        let sent = ch.take();
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0], ChannelMessage::Binary(b) if b.len() == C));
        assert_eq!(engine.entry(id).unwrap().progress, 50);
    }

    #[test]
    fn resume_request_jumps_and_out_of_range_fails() {
        let (mut engine, _db) = engine();
        let ch = RecordingChannel::default();
        let id = engine.enqueue(file("a.bin", 200_000)).unwrap();
        engine.on_channel_open(&ch).unwrap();
        ch.take();

        engine.on_resume_request(&ch, 3).unwrap();
        let sent = ch.take();
        assert!(matches!(&sent[0], ChannelMessage::Binary(b) if b.len() == 3_392));
        assert_eq!(engine.entry(id).unwrap().last_sent_chunk, 2);

        let err = engine.on_resume_request(&ch, 9).unwrap_err();
        assert!(matches!(err, TransferError::ResumeOutOfRange { from: 9, total: 4 }));
        assert_eq!(engine.entry(id).unwrap().status, TransferStatus::Failed);
        assert_eq!(engine.active(), None);
    }

    #[test]
    fn resume_request_at_end_sends_done() {
        let (mut engine, _db) = engine();
        let ch = RecordingChannel::default();
        let id = engine.enqueue(file("a.bin", 100)).unwrap();
        engine.on_channel_open(&ch).unwrap();
        ch.take();

        engine.on_resume_request(&ch, 1).unwrap();
        assert_eq!(
            RecordingChannel::control(&ch.take()[0]),
            Some(ControlFrame::Done)
        );
        assert_eq!(engine.entry(id).unwrap().status, TransferStatus::Sent);
    }

    #[test]
    fn pause_and_resume_without_reannounce() {
        let (mut engine, _db) = engine();
        let ch = RecordingChannel::default();
        let id = engine.enqueue(file("a.bin", 200_000)).unwrap();
        engine.on_channel_open(&ch).unwrap();
        engine.on_ack(&ch, 0).unwrap();
        ch.take();

        // Chunk 1 in flight when the user pauses.
        engine.pause(id).unwrap();
        assert_eq!(engine.active(), None);
        assert!(ch.take().is_empty());

        // Its ack still lands and is credited.
        engine.on_ack(&ch, 1).unwrap();
        assert!(ch.take().is_empty());
        assert_eq!(engine.entry(id).unwrap().last_sent_chunk, 1);

        engine.resume(&ch, id).unwrap();
        let sent = ch.take();
        assert_eq!(sent.len(), 1, "no meta for the receiver's current file");
        assert!(matches!(&sent[0], ChannelMessage::Binary(_)));
    }

    #[test]
    fn resume_before_ack_waits_for_in_flight_chunk() {
        let (mut engine, _db) = engine();
        let ch = RecordingChannel::default();
        let id = engine.enqueue(file("a.bin", 200_000)).unwrap();
        engine.on_channel_open(&ch).unwrap();
        engine.on_ack(&ch, 0).unwrap();
        ch.take();

        engine.pause(id).unwrap();
        engine.resume(&ch, id).unwrap();
        assert!(ch.take().is_empty(), "chunk 1 must not be sent twice");

        engine.on_ack(&ch, 1).unwrap();
        assert_eq!(ch.take().len(), 1);
        assert_eq!(engine.entry(id).unwrap().last_sent_chunk, 1);
    }

    #[test]
    fn resuming_after_another_file_reannounces() {
        let (mut engine, _db) = engine();
        let ch = RecordingChannel::default();
        let a = engine.enqueue(file("a.bin", 200_000)).unwrap();
        let b = engine.enqueue(file("b.bin", 10)).unwrap();
        engine.on_channel_open(&ch).unwrap();
        engine.on_ack(&ch, 0).unwrap();
        engine.pause(a).unwrap();
        engine.on_ack(&ch, 1).unwrap();
        ch.take();

        // b runs to completion.
        engine.drive_queue(&ch).unwrap();
        assert_eq!(engine.active(), Some(b));
        engine.on_ack(&ch, 0).unwrap();
        ch.take();

        engine.resume(&ch, a).unwrap();
        let sent = ch.take();
        assert!(matches!(
            RecordingChannel::control(&sent[0]),
            Some(ControlFrame::Meta { ref name, .. }) if name == "a.bin"
        ));
        assert!(matches!(&sent[1], ChannelMessage::Binary(b) if b.len() == C));

        // Receiver answers with its own cursor.
        engine.on_resume_request(&ch, 2).unwrap();
        assert_eq!(ch.take().len(), 1);
        assert_eq!(engine.entry(a).unwrap().last_sent_chunk, 1);
    }

    #[test]
    fn receiver_pause_request_stops_sending() {
        let (mut engine, _db) = engine();
        let ch = RecordingChannel::default();
        let id = engine.enqueue(file("a.bin", 200_000)).unwrap();
        engine.on_channel_open(&ch).unwrap();
        ch.take();

        engine.handle_frame(&ch, &ControlFrame::PauseReq).unwrap();
        assert_eq!(engine.entry(id).unwrap().status, TransferStatus::Paused);
        assert!(ch.take().is_empty());
    }

    #[test]
    fn cancel_active_sends_cancel_and_clears_checkpoint() {
        let (mut engine, db) = engine();
        let ch = RecordingChannel::default();
        let id = engine.enqueue(file("a.bin", 200_000)).unwrap();
        engine.on_channel_open(&ch).unwrap();
        engine.on_ack(&ch, 0).unwrap();
        ch.take();

        engine.cancel(&ch, id).unwrap();
        assert_eq!(
            RecordingChannel::control(&ch.take()[0]),
            Some(ControlFrame::Cancel)
        );
        assert!(engine.entries().is_empty());
        assert_eq!(
            db.get_send_checkpoint(&SendCheckpointKey::new("room", "a.bin", 200_000))
                .unwrap(),
            -1
        );
        assert!(matches!(
            engine.cancel(&ch, id),
            Err(TransferError::UnknownEntry(_))
        ));
    }

    #[test]
    fn clear_queue_removes_everything() {
        let (mut engine, _db) = engine();
        let ch = RecordingChannel::default();
        engine.enqueue(file("a.bin", 10)).unwrap();
        engine.enqueue(file("b.bin", 10)).unwrap();
        engine.on_channel_open(&ch).unwrap();
        ch.take();

        assert_eq!(engine.clear_queue(&ch).unwrap(), 2);
        assert!(engine.entries().is_empty());
        assert_eq!(engine.active(), None);
    }

    #[test]
    fn remote_cancel_drops_active_entry() {
        let (mut engine, _db) = engine();
        let ch = RecordingChannel::default();
        engine.enqueue(file("a.bin", 200_000)).unwrap();
        engine.on_channel_open(&ch).unwrap();

        engine.handle_frame(&ch, &ControlFrame::Cancel).unwrap();
        assert!(engine.entries().is_empty());
        assert_eq!(engine.active(), None);
    }

    #[test]
    fn channel_close_freezes_active_entry() {
        let (mut engine, _db) = engine();
        let ch = RecordingChannel::default();
        let id = engine.enqueue(file("a.bin", 200_000)).unwrap();
        engine.on_channel_open(&ch).unwrap();
        engine.on_ack(&ch, 0).unwrap();
        engine.on_ack(&ch, 1).unwrap();
        ch.take();

        engine.on_channel_closed();
        let snap = engine.entry(id).unwrap();
        assert_eq!(snap.status, TransferStatus::Pending);
        assert_eq!(snap.last_sent_chunk, 1);

        // Nothing moves while closed.
        engine.drive_queue(&ch).unwrap();
        assert!(ch.take().is_empty());

        engine.on_channel_open(&ch).unwrap();
        let sent = ch.take();
        assert_eq!(sent.len(), 1, "meta-less resume");
        assert!(matches!(&sent[0], ChannelMessage::Binary(_)));
    }

    #[test]
    fn checkpoint_failure_sends_nothing() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let store = Arc::new(FlakyStore::new(db));
        let mut engine = SendEngine::new("room", store.clone(), Arc::new(NullLogger));
        let ch = RecordingChannel::default();
        let id = engine.enqueue(file("a.bin", 200_000)).unwrap();
        engine.on_channel_open(&ch).unwrap();
        ch.take();

        store.fail_checkpoints(true);
        assert!(matches!(engine.on_ack(&ch, 0), Err(TransferError::Storage(_))));
        assert!(ch.take().is_empty());
        assert_eq!(engine.entry(id).unwrap().last_sent_chunk, -1);

        // The same ack succeeds once the store recovers.
        store.fail_checkpoints(false);
        engine.on_ack(&ch, 0).unwrap();
        assert_eq!(ch.take().len(), 1);
    }

    #[test]
    fn unexpected_frames_are_rejected() {
        let (mut engine, _db) = engine();
        let ch = RecordingChannel::default();
        let err = engine.handle_frame(&ch, &ControlFrame::Done).unwrap_err();
        assert!(err.is_protocol_violation());
        assert!(engine.on_resume_request(&ch, 0).is_err());
    }

    struct Unreadable;

    impl FileSource for Unreadable {
        fn name(&self) -> &str {
            "gone.bin"
        }

        fn relative_path(&self) -> Option<&str> {
            None
        }

        fn size(&self) -> u64 {
            100
        }

        fn mime_type(&self) -> &str {
            "application/octet-stream"
        }

        fn read_at(&mut self, _offset: u64, _len: usize) -> std::io::Result<Vec<u8>> {
            Err(std::io::Error::other("file was deleted"))
        }
    }

    #[test]
    fn unreadable_source_fails_and_queue_moves_on() {
        let (mut engine, _db) = engine();
        let ch = RecordingChannel::default();
        let gone = engine.enqueue(Box::new(Unreadable)).unwrap();
        let next = engine.enqueue(file("b.bin", 10)).unwrap();

        let err = engine.on_channel_open(&ch).unwrap_err();
        assert!(matches!(err, TransferError::Io(_)));
        assert_eq!(engine.entry(gone).unwrap().status, TransferStatus::Failed);
        assert_eq!(engine.entry(next).unwrap().status, TransferStatus::Sending);
        assert_eq!(engine.active(), Some(next));

        let sent = ch.take();
        assert_eq!(sent.len(), 3, "meta for both files, one chunk for b.bin");
        assert!(matches!(&sent[2], ChannelMessage::Binary(b) if b.len() == 10));
    }

    #[test]
    fn channel_failure_returns_entry_to_pending() {
        let (mut engine, _db) = engine();
        let ch = RecordingChannel::default();
        let id = engine.enqueue(file("a.bin", 200_000)).unwrap();

        ch.set_failing(true);
        let err = engine.on_channel_open(&ch).unwrap_err();
        assert!(matches!(err, TransferError::Channel(_)));
        assert_eq!(engine.entry(id).unwrap().status, TransferStatus::Pending);
        assert_eq!(engine.active(), None);
        assert!(!engine.is_channel_open());

        ch.set_failing(false);
        engine.on_channel_open(&ch).unwrap();
        assert_eq!(ch.take().len(), 2, "meta and chunk 0");

        // Chunk 1 fails to leave after chunk 0's ack.
        ch.set_failing(true);
        assert!(matches!(engine.on_ack(&ch, 0), Err(TransferError::Channel(_))));
        let snap = engine.entry(id).unwrap();
        assert_eq!(snap.status, TransferStatus::Pending);
        assert_eq!(snap.last_sent_chunk, 0);

        ch.set_failing(false);
        engine.on_channel_open(&ch).unwrap();
        let sent = ch.take();
        assert_eq!(sent.len(), 1, "meta-less resume at chunk 1");
        assert!(matches!(&sent[0], ChannelMessage::Binary(b) if b.len() == C));
        assert_eq!(engine.entry(id).unwrap().status, TransferStatus::Sending);
    }

    #[test]
    fn resume_request_from_zero_clears_checkpoint() {
        let (mut engine, db) = engine();
        let key = SendCheckpointKey::new("room", "a.bin", 200_000);
        db.put_send_checkpoint(&key, 1, 4).unwrap();

        let ch = RecordingChannel::default();
        engine.enqueue(file("b.bin", 10)).unwrap();
        let a = engine.enqueue(file("a.bin", 200_000)).unwrap();
        engine.on_channel_open(&ch).unwrap();
        engine.on_ack(&ch, 0).unwrap();

        // b.bin took over the receiver, so a.bin is announced again.
        let sent = ch.take();
        assert!(matches!(
            sent.iter().rev().find_map(RecordingChannel::control),
            Some(ControlFrame::Meta { ref name, .. }) if name == "a.bin"
        ));

        // The receiver has nothing for it.
        engine.on_resume_request(&ch, 0).unwrap();
        assert_eq!(db.get_send_checkpoint(&key).unwrap(), -1);
        assert_eq!(engine.entry(a).unwrap().last_sent_chunk, -1);
        assert!(matches!(&ch.take()[0], ChannelMessage::Binary(b) if b.len() == C));
    }

    #[test]
    fn cancelled_file_forces_reannounce_of_resumed_one() {
        let (mut engine, _db) = engine();
        let ch = RecordingChannel::default();
        let a = engine.enqueue(file("a.bin", 200_000)).unwrap();
        engine.on_channel_open(&ch).unwrap();
        engine.on_ack(&ch, 0).unwrap();
        engine.pause(a).unwrap();

        let b = engine.enqueue(file("b.bin", 10)).unwrap();
        engine.drive_queue(&ch).unwrap();
        assert_eq!(engine.active(), Some(b));
        engine.cancel(&ch, b).unwrap();
        ch.take();

        // Chunk 1 of a.bin is still on the wire.
        engine.resume(&ch, a).unwrap();
        assert!(ch.take().is_empty());

        // Its ack arrives after the receiver dropped b.bin, so a.bin has to
        // be announced again.
        engine.on_ack(&ch, 1).unwrap();
        let sent = ch.take();
        assert_eq!(sent.len(), 2);
        assert!(matches!(
            RecordingChannel::control(&sent[0]),
            Some(ControlFrame::Meta { ref name, .. }) if name == "a.bin"
        ));

        // b.bin's chunk 0 was acked before the cancel landed; that ack is
        // not a.bin's.
        engine.on_ack(&ch, 0).unwrap();
        assert!(ch.take().is_empty());
        assert_eq!(engine.entry(a).unwrap().last_sent_chunk, 1);

        engine.on_resume_request(&ch, 2).unwrap();
        assert!(matches!(&ch.take()[0], ChannelMessage::Binary(b) if b.len() == C));
        assert_eq!(engine.entry(a).unwrap().last_sent_chunk, 1);
    }

    #[test]
    fn remote_cancel_drops_entry_resumed_from_checkpoint() {
        let (mut engine, db) = engine();
        let key = SendCheckpointKey::new("room", "a.bin", 200_000);
        db.put_send_checkpoint(&key, 1, 4).unwrap();

        let ch = RecordingChannel::default();
        engine.enqueue(file("a.bin", 200_000)).unwrap();
        engine.on_channel_open(&ch).unwrap();
        assert_eq!(ch.take().len(), 1, "meta-less resume");

        engine.handle_frame(&ch, &ControlFrame::Cancel).unwrap();
        assert!(engine.entries().is_empty());
        assert_eq!(engine.active(), None);
        assert_eq!(db.get_send_checkpoint(&key).unwrap(), -1);
    }

    #[test]
    fn snapshot_rate_uses_acknowledged_bytes() {
        let snap = EntrySnapshot {
            id: 1,
            name: "a.bin".into(),
            relative_path: None,
            size: 4_000,
            mime_type: "application/octet-stream".into(),
            status: TransferStatus::Sending,
            total_chunks: 1,
            last_sent_chunk: -1,
            progress: 25,
            bytes_transferred: 1_000,
            elapsed: Some(Duration::from_secs(2)),
        };
        let rate = snap.rate();
        assert_eq!(rate.bytes_per_sec, 500.0);
        assert_eq!(rate.eta, Some(Duration::from_secs(6)));

        let fresh = EntrySnapshot { elapsed: None, ..snap };
        assert_eq!(fresh.rate().eta, None);
    }
}
