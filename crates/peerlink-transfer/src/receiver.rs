//! Receive side: reassembles the incoming chunk stream into the chunk store.
//!
//! Chunks carry no index on the wire. The receiver assigns
//! `next_index = chunks_persisted` to each binary frame, stores it, records
//! progress and only then acknowledges it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use peerlink_db::ChunkStore;
use peerlink_types::{ControlFrame, Frame, TransferRecord, TransferStatus};

use crate::channel::DataChannel;
use crate::error::{Result, TransferError};
use crate::logging::{TransferEvent, TransferLog, TransferLogger};
use crate::protocol;
use crate::stats::{self, RateEstimate};

/// File description carried by a `meta` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub name: String,
    pub path: Option<String>,
    pub size: u64,
    pub mime_type: String,
    pub total_chunks: u64,
}

struct Inbound {
    record: TransferRecord,
    /// Drop the next binary frame: the sender's chunk 0 that raced our
    /// resume request.
    discard_next: bool,
    session_started: Instant,
    session_bytes: u64,
}

impl Inbound {
    fn is_live(&self) -> bool {
        matches!(
            self.record.status,
            TransferStatus::Receiving | TransferStatus::Paused
        )
    }

    fn is_same_file(&self, meta: &FileMeta) -> bool {
        self.record.name == meta.name && self.record.size_bytes == meta.size
    }
}

/// Point-in-time view of the current inbound transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiveSnapshot {
    pub transfer_id: String,
    pub name: String,
    pub relative_path: Option<String>,
    pub size: u64,
    pub mime_type: String,
    pub status: TransferStatus,
    pub total_chunks: u64,
    pub chunks_persisted: u64,
    pub progress: u8,
    pub bytes_received: u64,
    pub started_at: DateTime<Utc>,
    session_bytes: u64,
    session_elapsed: Duration,
}

impl ReceiveSnapshot {
    /// Rate over the current session only; resumed bytes don't count.
    pub fn rate(&self) -> RateEstimate {
        let remaining = self.size.saturating_sub(self.bytes_received);
        stats::estimate(
            self.session_bytes,
            self.session_bytes + remaining,
            self.session_elapsed,
        )
    }
}

pub struct ReceiveEngine {
    room_id: String,
    store: Arc<dyn ChunkStore>,
    logger: Arc<dyn TransferLogger>,
    current: Option<Inbound>,
}

impl ReceiveEngine {
    pub fn new(
        room_id: impl Into<String>,
        store: Arc<dyn ChunkStore>,
        logger: Arc<dyn TransferLogger>,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            store,
            logger,
            current: None,
        }
    }

    pub fn handle_frame(&mut self, channel: &dyn DataChannel, frame: Frame) -> Result<()> {
        match frame {
            Frame::Chunk(data) => self.on_binary_frame(channel, data),
            Frame::Control(ControlFrame::Meta {
                name,
                path,
                size,
                mime_type,
                total_chunks,
            }) => self.on_meta(
                channel,
                FileMeta {
                    name,
                    path,
                    size,
                    mime_type,
                    total_chunks,
                },
            ),
            Frame::Control(ControlFrame::Done) => self.on_done(),
            Frame::Control(ControlFrame::Cancel) => self.on_cancel(),
            Frame::Control(other) => Err(TransferError::UnexpectedFrame {
                frame: other.kind(),
                reason: "not valid for the receiving side".into(),
            }),
        }
    }

    /// Start or resume a transfer. A resumable record for the same
    /// `(room, name, size)` continues at its first missing chunk.
    pub fn on_meta(&mut self, channel: &dyn DataChannel, meta: FileMeta) -> Result<()> {
        if meta.total_chunks != protocol::total_chunks(meta.size) {
            return Err(TransferError::UnexpectedFrame {
                frame: "meta",
                reason: format!(
                    "{} chunks declared for {} bytes",
                    meta.total_chunks, meta.size
                ),
            });
        }

        if let Some(prev) = self.current.as_ref() {
            if prev.is_live() && !prev.is_same_file(&meta) {
                self.park_current()?;
            }
        }

        let resumable = self
            .store
            .find_resumable(&self.room_id, &meta.name, meta.size)
            .map_err(TransferError::Storage)?;

        let inbound = match resumable {
            Some(mut record) => {
                // Trust the chunk table, not the recorded counter.
                let next = self
                    .store
                    .highest_contiguous_index(&record.transfer_id)
                    .map_err(TransferError::Storage)?
                    .map_or(0, |h| h + 1)
                    .min(record.total_chunks);
                self.store
                    .update_progress(&record.transfer_id, next, TransferStatus::Receiving)
                    .map_err(TransferError::Storage)?;
                record.chunks_persisted = next;
                record.status = TransferStatus::Receiving;
                Inbound {
                    record,
                    discard_next: next > 0,
                    session_started: Instant::now(),
                    session_bytes: 0,
                }
            }
            None => {
                let record = TransferRecord {
                    transfer_id: new_transfer_id(&self.room_id),
                    room_id: self.room_id.clone(),
                    name: meta.name,
                    relative_path: meta.path,
                    size_bytes: meta.size,
                    mime_type: meta.mime_type,
                    total_chunks: meta.total_chunks,
                    chunks_persisted: 0,
                    status: TransferStatus::Receiving,
                    created_at: Utc::now(),
                };
                self.store
                    .put_metadata(&record)
                    .map_err(TransferError::Storage)?;
                Inbound {
                    record,
                    discard_next: false,
                    session_started: Instant::now(),
                    session_bytes: 0,
                }
            }
        };

        let record = &inbound.record;
        let resumed_at = record.chunks_persisted;
        log(
            &self.logger,
            &record.transfer_id,
            TransferEvent::Started {
                name: record.name.clone(),
                size: record.size_bytes,
                total_chunks: record.total_chunks,
                resumed_at,
            },
        );
        self.current = Some(inbound);

        if resumed_at > 0 {
            channel.send_frame(&ControlFrame::ResumeReq {
                from_chunk: resumed_at,
            })?;
        }
        Ok(())
    }

    /// Store the next chunk, record progress, then acknowledge it.
    pub fn on_binary_frame(&mut self, channel: &dyn DataChannel, data: Vec<u8>) -> Result<()> {
        let Some(inbound) = self.current.as_mut().filter(|c| c.is_live()) else {
            return Err(TransferError::NoActiveTransfer);
        };

        if inbound.discard_next {
            inbound.discard_next = false;
            log(
                &self.logger,
                &inbound.record.transfer_id,
                TransferEvent::FrameDiscarded { size: data.len() },
            );
            return Ok(());
        }

        let index = inbound.record.chunks_persisted;
        let total = inbound.record.total_chunks;
        if index >= total {
            self.fail_current(format!("chunk {} past end of {} chunks", index, total));
            return Err(TransferError::ChunkOverflow { index, total });
        }

        let expected = protocol::chunk_len(inbound.record.size_bytes, index);
        if data.len() != expected {
            let reason = format!("chunk {} is {} bytes, expected {}", index, data.len(), expected);
            self.fail_current(reason.clone());
            return Err(TransferError::UnexpectedFrame {
                frame: "chunk",
                reason,
            });
        }

        let transfer_id = inbound.record.transfer_id.clone();
        self.store
            .put_chunk(&transfer_id, index, &data)
            .map_err(TransferError::Storage)?;
        self.store
            .update_progress(&transfer_id, index + 1, TransferStatus::Receiving)
            .map_err(TransferError::Storage)?;

        inbound.record.chunks_persisted = index + 1;
        inbound.record.status = TransferStatus::Receiving;
        inbound.session_bytes += data.len() as u64;
        log(
            &self.logger,
            &transfer_id,
            TransferEvent::ChunkPersisted {
                index,
                size: data.len(),
            },
        );

        channel.send_frame(&ControlFrame::Ack { chunk: index })
    }

    /// Sender finished. Complete only if every chunk is stored.
    pub fn on_done(&mut self) -> Result<()> {
        let Some(inbound) = self.current.as_mut().filter(|c| c.is_live()) else {
            return Err(TransferError::NoActiveTransfer);
        };
        let record = &mut inbound.record;

        if record.chunks_persisted == record.total_chunks {
            self.store
                .update_progress(
                    &record.transfer_id,
                    record.total_chunks,
                    TransferStatus::Complete,
                )
                .map_err(TransferError::Storage)?;
            record.status = TransferStatus::Complete;
            log(
                &self.logger,
                &record.transfer_id,
                TransferEvent::Complete {
                    total_bytes: record.size_bytes,
                    chunks: record.total_chunks,
                    duration_ms: inbound.session_started.elapsed().as_millis() as u64,
                },
            );
            return Ok(());
        }

        let err = TransferError::IncompleteTransfer {
            transfer_id: record.transfer_id.clone(),
            persisted: record.chunks_persisted,
            total: record.total_chunks,
        };
        self.fail_current(err.to_string());
        Err(err)
    }

    /// Sender abandoned the transfer: drop everything stored for it.
    pub fn on_cancel(&mut self) -> Result<()> {
        self.discard_current(true)
    }

    /// Ask the sender to stop after its in-flight chunk.
    pub fn request_pause(&mut self, channel: &dyn DataChannel) -> Result<()> {
        let Some(inbound) = self.current.as_mut() else {
            return Err(TransferError::NoActiveTransfer);
        };
        if inbound.record.status != TransferStatus::Receiving {
            return Err(TransferError::InvalidState(format!(
                "cannot pause a {} transfer",
                inbound.record.status
            )));
        }

        channel.send_frame(&ControlFrame::PauseReq)?;
        self.store
            .update_progress(
                &inbound.record.transfer_id,
                inbound.record.chunks_persisted,
                TransferStatus::Paused,
            )
            .map_err(TransferError::Storage)?;
        inbound.record.status = TransferStatus::Paused;
        log(
            &self.logger,
            &inbound.record.transfer_id,
            TransferEvent::Paused {
                chunks: inbound.record.chunks_persisted,
            },
        );
        Ok(())
    }

    /// Abandon the current transfer from this side.
    pub fn cancel(&mut self, channel: &dyn DataChannel) -> Result<()> {
        if !self.has_active() {
            return Err(TransferError::NoActiveTransfer);
        }
        channel.send_frame(&ControlFrame::Cancel)?;
        self.discard_current(false)
    }

    /// Adopt the room's most recent in-progress transfer after a restart.
    pub fn rehydrate(&mut self) -> Result<Option<ReceiveSnapshot>> {
        if self.has_active() {
            return Ok(self.current());
        }

        let Some(mut record) = self
            .store
            .latest_in_progress(&self.room_id)
            .map_err(TransferError::Storage)?
        else {
            return Ok(None);
        };

        let next = self
            .store
            .highest_contiguous_index(&record.transfer_id)
            .map_err(TransferError::Storage)?
            .map_or(0, |h| h + 1)
            .min(record.total_chunks);
        if next != record.chunks_persisted {
            self.store
                .update_progress(&record.transfer_id, next, record.status)
                .map_err(TransferError::Storage)?;
            record.chunks_persisted = next;
        }

        self.current = Some(Inbound {
            record,
            discard_next: false,
            session_started: Instant::now(),
            session_bytes: 0,
        });
        Ok(self.current())
    }

    /// The channel dropped. Keep the transfer and its cursor for the
    /// sender's meta-less resume.
    pub fn on_channel_closed(&mut self) {
        if let Some(inbound) = self.current.as_mut() {
            inbound.discard_next = false;
        }
    }

    pub fn has_active(&self) -> bool {
        self.current.as_ref().is_some_and(Inbound::is_live)
    }

    pub fn current(&self) -> Option<ReceiveSnapshot> {
        self.current.as_ref().map(|inbound| {
            let r = &inbound.record;
            ReceiveSnapshot {
                transfer_id: r.transfer_id.clone(),
                name: r.name.clone(),
                relative_path: r.relative_path.clone(),
                size: r.size_bytes,
                mime_type: r.mime_type.clone(),
                status: r.status,
                total_chunks: r.total_chunks,
                chunks_persisted: r.chunks_persisted,
                progress: r.progress_percent(),
                bytes_received: protocol::bytes_through(r.size_bytes, r.chunks_persisted),
                started_at: r.created_at,
                session_bytes: inbound.session_bytes,
                session_elapsed: inbound.session_started.elapsed(),
            }
        })
    }

    /// Every transfer recorded for this room, oldest first.
    pub fn history(&self) -> Result<Vec<TransferRecord>> {
        self.store
            .list_by_room(&self.room_id)
            .map_err(TransferError::Storage)
    }

    fn park_current(&mut self) -> Result<()> {
        let Some(inbound) = self.current.take() else {
            return Ok(());
        };
        let record = &inbound.record;
        if let Err(e) = self.store.update_progress(
            &record.transfer_id,
            record.chunks_persisted,
            TransferStatus::Paused,
        ) {
            // Keep the slot so nothing is half-applied.
            self.current = Some(inbound);
            return Err(TransferError::Storage(e));
        }
        log(
            &self.logger,
            &record.transfer_id,
            TransferEvent::Paused {
                chunks: record.chunks_persisted,
            },
        );
        Ok(())
    }

    fn discard_current(&mut self, by_peer: bool) -> Result<()> {
        let Some(inbound) = self.current.as_ref().filter(|c| c.is_live()) else {
            return Err(TransferError::NoActiveTransfer);
        };
        let transfer_id = inbound.record.transfer_id.clone();
        self.store
            .delete_transfer(&transfer_id)
            .map_err(TransferError::Storage)?;
        self.current = None;
        log(&self.logger, &transfer_id, TransferEvent::Cancelled { by_peer });
        Ok(())
    }

    fn fail_current(&mut self, message: String) {
        let Some(inbound) = self.current.as_mut() else {
            return;
        };
        let record = &mut inbound.record;
        record.status = TransferStatus::Failed;
        if let Err(e) =
            self.store
                .update_progress(&record.transfer_id, record.chunks_persisted, TransferStatus::Failed)
        {
            tracing::warn!(transfer_id = %record.transfer_id, "Failed to persist failure: {:#}", e);
        }
        log(&self.logger, &record.transfer_id, TransferEvent::Error { message });
    }
}

fn new_transfer_id(room_id: &str) -> String {
    format!(
        "{}_{}_{:016x}",
        room_id,
        Utc::now().timestamp_millis(),
        rand::random::<u64>()
    )
}

fn log(logger: &Arc<dyn TransferLogger>, transfer_id: &str, event: TransferEvent) {
    logger.log(TransferLog {
        component: "receiver",
        transfer_id: transfer_id.to_string(),
        event,
    });
}
