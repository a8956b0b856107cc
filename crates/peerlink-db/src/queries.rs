use crate::models::{ExportSummary, SendCheckpoint};
use crate::store::ChunkStore;
use crate::Database;
use anyhow::{Result, anyhow, bail};
use chrono::{DateTime, SecondsFormat, Utc};
use peerlink_types::{SendCheckpointKey, TransferRecord, TransferStatus};
use rusqlite::types::Type;
use rusqlite::{Connection, Row};
use sha2::{Digest, Sha256};
use std::io::Write;
use tracing::{debug, info};

const TRANSFER_COLUMNS: &str = "transfer_id, room_id, name, relative_path, size_bytes, mime_type, \
     total_chunks, chunks_persisted, status, created_at";

impl ChunkStore for Database {
    // -- Chunks --

    fn put_chunk(&self, transfer_id: &str, index: u64, data: &[u8]) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO chunks (transfer_id, chunk_index, data) VALUES (?1, ?2, ?3)
                 ON CONFLICT(transfer_id, chunk_index) DO UPDATE SET data = excluded.data",
                rusqlite::params![transfer_id, index as i64, data],
            )?;
            Ok(())
        })
    }

    fn get_chunk(&self, transfer_id: &str, index: u64) -> Result<Option<Vec<u8>>> {
        self.with_conn(|conn| query_chunk(conn, transfer_id, index))
    }

    fn highest_contiguous_index(&self, transfer_id: &str) -> Result<Option<u64>> {
        self.with_conn(|conn| query_highest_contiguous(conn, transfer_id))
    }

    // -- Transfers --

    fn put_metadata(&self, record: &TransferRecord) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO transfers (transfer_id, room_id, name, relative_path, size_bytes, mime_type,
                                        total_chunks, chunks_persisted, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(transfer_id) DO UPDATE SET
                    room_id = excluded.room_id,
                    name = excluded.name,
                    relative_path = excluded.relative_path,
                    size_bytes = excluded.size_bytes,
                    mime_type = excluded.mime_type,
                    total_chunks = excluded.total_chunks,
                    chunks_persisted = excluded.chunks_persisted,
                    status = excluded.status",
                rusqlite::params![
                    record.transfer_id,
                    record.room_id,
                    record.name,
                    record.relative_path,
                    record.size_bytes as i64,
                    record.mime_type,
                    record.total_chunks as i64,
                    record.chunks_persisted as i64,
                    record.status.as_str(),
                    format_timestamp(&record.created_at),
                ],
            )?;
            Ok(())
        })
    }

    fn get_metadata(&self, transfer_id: &str) -> Result<Option<TransferRecord>> {
        self.with_conn(|conn| query_transfer(conn, transfer_id))
    }

    fn update_progress(
        &self,
        transfer_id: &str,
        chunks_persisted: u64,
        status: TransferStatus,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            let updated = conn.execute(
                "UPDATE transfers SET chunks_persisted = ?1, status = ?2 WHERE transfer_id = ?3",
                rusqlite::params![chunks_persisted as i64, status.as_str(), transfer_id],
            )?;
            if updated == 0 {
                bail!("Transfer not found: {}", transfer_id);
            }
            Ok(())
        })
    }

    fn list_by_room(&self, room_id: &str) -> Result<Vec<TransferRecord>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {TRANSFER_COLUMNS} FROM transfers
                 WHERE room_id = ?1
                 ORDER BY created_at ASC, rowid ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([room_id], transfer_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    fn find_resumable(&self, room_id: &str, name: &str, size: u64) -> Result<Option<TransferRecord>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {TRANSFER_COLUMNS} FROM transfers
                 WHERE room_id = ?1 AND name = ?2 AND size_bytes = ?3
                   AND status IN ('receiving', 'paused')
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT 1"
            );
            conn.query_row(
                &sql,
                rusqlite::params![room_id, name, size as i64],
                transfer_from_row,
            )
            .optional()
        })
    }

    fn latest_in_progress(&self, room_id: &str) -> Result<Option<TransferRecord>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {TRANSFER_COLUMNS} FROM transfers
                 WHERE room_id = ?1 AND status = 'receiving'
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT 1"
            );
            conn.query_row(&sql, [room_id], transfer_from_row).optional()
        })
    }

    fn delete_transfer(&self, transfer_id: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let chunks = tx.execute("DELETE FROM chunks WHERE transfer_id = ?1", [transfer_id])?;
            tx.execute("DELETE FROM transfers WHERE transfer_id = ?1", [transfer_id])?;
            tx.commit()?;
            debug!(transfer_id, chunks, "Deleted transfer");
            Ok(())
        })
    }

    // -- Send checkpoints --

    fn put_send_checkpoint(
        &self,
        key: &SendCheckpointKey,
        last_acked_chunk: u64,
        total_chunks: u64,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO send_checkpoints (room_id, file_name, file_size, last_acked_chunk, total_chunks, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, datetime('now'))
                 ON CONFLICT(room_id, file_name, file_size) DO UPDATE SET
                    last_acked_chunk = excluded.last_acked_chunk,
                    total_chunks = excluded.total_chunks,
                    updated_at = excluded.updated_at",
                rusqlite::params![
                    key.room_id,
                    key.file_name,
                    key.file_size as i64,
                    last_acked_chunk as i64,
                    total_chunks as i64,
                ],
            )?;
            Ok(())
        })
    }

    fn get_send_checkpoint(&self, key: &SendCheckpointKey) -> Result<i64> {
        Ok(self
            .send_checkpoint(key)?
            .map(|cp| cp.last_acked_chunk as i64)
            .unwrap_or(-1))
    }

    fn clear_send_checkpoint(&self, key: &SendCheckpointKey) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "DELETE FROM send_checkpoints WHERE room_id = ?1 AND file_name = ?2 AND file_size = ?3",
                rusqlite::params![key.room_id, key.file_name, key.file_size as i64],
            )?;
            Ok(())
        })
    }
}

impl Database {
    /// Full checkpoint row for an outbound file.
    pub fn send_checkpoint(&self, key: &SendCheckpointKey) -> Result<Option<SendCheckpoint>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT last_acked_chunk, total_chunks, updated_at FROM send_checkpoints
                 WHERE room_id = ?1 AND file_name = ?2 AND file_size = ?3",
                rusqlite::params![key.room_id, key.file_name, key.file_size as i64],
                |row| {
                    Ok(SendCheckpoint {
                        key: key.clone(),
                        last_acked_chunk: row.get::<_, i64>(0)? as u64,
                        total_chunks: row.get::<_, i64>(1)? as u64,
                        updated_at: row.get(2)?,
                    })
                },
            )
            .optional()
        })
    }

    pub fn chunk_count(&self, transfer_id: &str) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM chunks WHERE transfer_id = ?1",
                [transfer_id],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }

    /// Delete every transfer, chunk and send checkpoint of a room.
    /// Returns the number of transfers removed.
    pub fn clear_room(&self, room_id: &str) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM chunks WHERE transfer_id IN (SELECT transfer_id FROM transfers WHERE room_id = ?1)",
                [room_id],
            )?;
            let removed = tx.execute("DELETE FROM transfers WHERE room_id = ?1", [room_id])?;
            tx.execute("DELETE FROM send_checkpoints WHERE room_id = ?1", [room_id])?;
            tx.commit()?;
            info!(room_id, removed, "Cleared room transfers");
            Ok(removed)
        })
    }

    /// Reassemble a stored transfer into `writer`, chunk by chunk in index order.
    pub fn export_transfer<W: Write>(&self, transfer_id: &str, writer: &mut W) -> Result<ExportSummary> {
        let record = self
            .get_metadata(transfer_id)?
            .ok_or_else(|| anyhow!("Transfer not found: {}", transfer_id))?;

        let mut hasher = Sha256::new();
        let mut bytes_written = 0u64;

        for index in 0..record.total_chunks {
            let data = self
                .get_chunk(transfer_id, index)?
                .ok_or_else(|| anyhow!("Chunk {} of {} missing", index, transfer_id))?;
            writer.write_all(&data)?;
            hasher.update(&data);
            bytes_written += data.len() as u64;
        }
        writer.flush()?;

        if bytes_written != record.size_bytes {
            bail!(
                "Exported {} bytes for {} but metadata declares {}",
                bytes_written,
                transfer_id,
                record.size_bytes
            );
        }

        Ok(ExportSummary {
            bytes_written,
            chunks: record.total_chunks,
            sha256: hex::encode(hasher.finalize()),
        })
    }
}

// -- Query helpers --

fn query_chunk(conn: &Connection, transfer_id: &str, index: u64) -> Result<Option<Vec<u8>>> {
    conn.query_row(
        "SELECT data FROM chunks WHERE transfer_id = ?1 AND chunk_index = ?2",
        rusqlite::params![transfer_id, index as i64],
        |row| row.get(0),
    )
    .optional()
}

fn query_highest_contiguous(conn: &Connection, transfer_id: &str) -> Result<Option<u64>> {
    let (count, max): (i64, Option<i64>) = conn.query_row(
        "SELECT COUNT(*), MAX(chunk_index) FROM chunks WHERE transfer_id = ?1",
        [transfer_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    // Dense prefix: indices are unique, so count == max + 1 means no gaps.
    match max {
        None => return Ok(None),
        Some(max) if max + 1 == count => return Ok(Some(max as u64)),
        _ => {}
    }

    let mut stmt = conn.prepare(
        "SELECT chunk_index FROM chunks WHERE transfer_id = ?1 ORDER BY chunk_index ASC",
    )?;
    let mut rows = stmt.query([transfer_id])?;

    let mut highest: Option<u64> = None;
    while let Some(row) = rows.next()? {
        let index = row.get::<_, i64>(0)? as u64;
        let expected = highest.map_or(0, |h| h + 1);
        if index != expected {
            break;
        }
        highest = Some(index);
    }
    Ok(highest)
}

fn query_transfer(conn: &Connection, transfer_id: &str) -> Result<Option<TransferRecord>> {
    let sql = format!("SELECT {TRANSFER_COLUMNS} FROM transfers WHERE transfer_id = ?1");
    conn.query_row(&sql, [transfer_id], transfer_from_row).optional()
}

fn transfer_from_row(row: &Row<'_>) -> rusqlite::Result<TransferRecord> {
    let status: String = row.get(8)?;
    let status = status
        .parse::<TransferStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(8, Type::Text, e.into()))?;

    let created_at: String = row.get(9)?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(9, Type::Text, Box::new(e)))?;

    Ok(TransferRecord {
        transfer_id: row.get(0)?,
        room_id: row.get(1)?,
        name: row.get(2)?,
        relative_path: row.get(3)?,
        size_bytes: row.get::<_, i64>(4)? as u64,
        mime_type: row.get(5)?,
        total_chunks: row.get::<_, i64>(6)? as u64,
        chunks_persisted: row.get::<_, i64>(7)? as u64,
        status,
        created_at,
    })
}

// Fixed precision keeps lexical order equal to chronological order.
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
