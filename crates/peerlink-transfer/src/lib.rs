//! PeerLink transfer engines: resumable stop-and-wait file transfer.
//!
//! Provides chunked file transfer over an ordered peer channel with:
//! - A FIFO send queue with one chunk in flight at a time
//! - Receiver-side reassembly into a durable chunk store
//! - Send checkpoints and receiver records for resume after drops or restarts
//! - Pause, resume and cancel from either side

pub mod channel;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod session;
pub mod source;
pub mod stats;

#[cfg(test)]
mod testing;

// Re-export key types for convenience.
pub use channel::{ChannelEvent, DataChannel, MpscChannel};
pub use error::{Result, TransferError};
pub use logging::{NullLogger, TracingLogger, TransferEvent, TransferLog, TransferLogger};
pub use protocol::{CHUNK_SIZE, chunk_len, chunk_range, total_chunks};
pub use receiver::{FileMeta, ReceiveEngine, ReceiveSnapshot};
pub use sender::{EntryId, EntrySnapshot, SendEngine};
pub use session::{PeerSession, SessionCommand, SessionHandle, SessionSnapshot};
pub use source::{FileSource, LocalFile, MemorySource};
pub use stats::RateEstimate;
