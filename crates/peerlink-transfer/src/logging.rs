//! Structured transfer logging.
//!
//! Both engines report lifecycle and per-chunk events through a
//! [`TransferLogger`] so embedders can route them anywhere.

use std::fmt;

use crate::stats;

/// Structured log entry for a transfer operation.
#[derive(Debug, Clone)]
pub struct TransferLog {
    pub component: &'static str,
    /// Receiver transfer id, or `entry-<id>` for send-queue entries.
    pub transfer_id: String,
    pub event: TransferEvent,
}

/// Transfer events that can be logged.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// Sender: file added to the queue
    Queued {
        name: String,
        size: u64,
        resume_from: i64,
    },
    /// Sender: meta announced to the receiver
    MetaSent {
        name: String,
        total_chunks: u64,
        reannounce: bool,
    },
    /// Sender: chunk handed to the channel
    ChunkSent { index: u64, size: usize },
    /// Sender: ack matched the in-flight chunk
    ChunkAcked { index: u64 },
    /// Sender: ack that matched nothing in flight
    StaleAck { index: u64, expected: Option<u64> },
    /// Sender: receiver asked to continue from an index
    ResumeRequested { from_chunk: u64 },
    /// Receiver: new or resumed transfer
    Started {
        name: String,
        size: u64,
        total_chunks: u64,
        resumed_at: u64,
    },
    /// Receiver: chunk durably stored
    ChunkPersisted { index: u64, size: usize },
    /// Receiver: frame dropped after a resume request
    FrameDiscarded { size: usize },
    Paused { chunks: u64 },
    Cancelled { by_peer: bool },
    /// Transfer complete
    Complete {
        total_bytes: u64,
        chunks: u64,
        duration_ms: u64,
    },
    /// Error occurred
    Error { message: String },
}

impl fmt::Display for TransferEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued { name, size, resume_from } => {
                write!(f, "queued name={} size={} resume_from={}", name, size, resume_from)
            }
            Self::MetaSent { name, total_chunks, reannounce } => {
                write!(f, "meta_sent name={} chunks={} reannounce={}", name, total_chunks, reannounce)
            }
            Self::ChunkSent { index, size } => {
                write!(f, "chunk_sent idx={} size={}", index, size)
            }
            Self::ChunkAcked { index } => write!(f, "chunk_acked idx={}", index),
            Self::StaleAck { index, expected } => match expected {
                Some(expected) => write!(f, "stale_ack idx={} expected={}", index, expected),
                None => write!(f, "stale_ack idx={} expected=none", index),
            },
            Self::ResumeRequested { from_chunk } => {
                write!(f, "resume_requested from={}", from_chunk)
            }
            Self::Started { name, size, total_chunks, resumed_at } => {
                write!(
                    f,
                    "started name={} size={} chunks={} resumed_at={}",
                    name, size, total_chunks, resumed_at
                )
            }
            Self::ChunkPersisted { index, size } => {
                write!(f, "chunk_persisted idx={} size={}", index, size)
            }
            Self::FrameDiscarded { size } => write!(f, "frame_discarded size={}", size),
            Self::Paused { chunks } => write!(f, "paused chunks={}", chunks),
            Self::Cancelled { by_peer } => write!(f, "cancelled by_peer={}", by_peer),
            Self::Complete { total_bytes, chunks, duration_ms } => {
                let rate = if *duration_ms > 0 {
                    *total_bytes * 1000 / *duration_ms
                } else {
                    *total_bytes
                };
                write!(
                    f,
                    "complete bytes={} chunks={} duration_ms={} rate={}/s",
                    stats::format_bytes(*total_bytes),
                    chunks,
                    duration_ms,
                    stats::format_bytes(rate)
                )
            }
            Self::Error { message } => write!(f, "error: {}", message),
        }
    }
}

/// Trait for transfer logging. Implementations can write to tracing,
/// forward to a UI, or discard entries.
pub trait TransferLogger: Send + Sync {
    fn log(&self, entry: TransferLog);
}

/// Logger that uses the `tracing` crate.
pub struct TracingLogger;

impl TransferLogger for TracingLogger {
    fn log(&self, entry: TransferLog) {
        // Info for lifecycle events, debug for per-chunk spam
        match &entry.event {
            TransferEvent::ChunkSent { .. }
            | TransferEvent::ChunkAcked { .. }
            | TransferEvent::ChunkPersisted { .. } => {
                tracing::debug!(
                    component = entry.component,
                    transfer_id = %entry.transfer_id,
                    "{}",
                    entry.event,
                );
            }
            TransferEvent::StaleAck { .. }
            | TransferEvent::FrameDiscarded { .. }
            | TransferEvent::Error { .. } => {
                tracing::warn!(
                    component = entry.component,
                    transfer_id = %entry.transfer_id,
                    "{}",
                    entry.event,
                );
            }
            _ => {
                tracing::info!(
                    component = entry.component,
                    transfer_id = %entry.transfer_id,
                    "{}",
                    entry.event,
                );
            }
        }
    }
}

/// No-op logger that discards all log entries.
pub struct NullLogger;

impl TransferLogger for NullLogger {
    fn log(&self, _entry: TransferLog) {}
}
