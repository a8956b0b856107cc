use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 =
        conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;

    if version < 1 {
        info!("Running migration v1 (transfers + chunks)");
        conn.execute_batch(
            "
            CREATE TABLE transfers (
                transfer_id       TEXT PRIMARY KEY,
                room_id           TEXT NOT NULL,
                name              TEXT NOT NULL,
                relative_path     TEXT,
                size_bytes        INTEGER NOT NULL,
                mime_type         TEXT NOT NULL,
                total_chunks      INTEGER NOT NULL,
                chunks_persisted  INTEGER NOT NULL DEFAULT 0,
                status            TEXT NOT NULL,
                created_at        TEXT NOT NULL
            );

            CREATE INDEX idx_transfers_room
                ON transfers(room_id, created_at);

            CREATE INDEX idx_transfers_identity
                ON transfers(room_id, name, size_bytes);

            CREATE TABLE chunks (
                transfer_id  TEXT NOT NULL REFERENCES transfers(transfer_id) ON DELETE CASCADE,
                chunk_index  INTEGER NOT NULL,
                data         BLOB NOT NULL,
                PRIMARY KEY (transfer_id, chunk_index)
            );

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    if version < 2 {
        info!("Running migration v2 (send checkpoints)");
        conn.execute_batch(
            "
            CREATE TABLE send_checkpoints (
                room_id           TEXT NOT NULL,
                file_name         TEXT NOT NULL,
                file_size         INTEGER NOT NULL,
                last_acked_chunk  INTEGER NOT NULL,
                total_chunks      INTEGER NOT NULL,
                updated_at        TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (room_id, file_name, file_size)
            );

            INSERT INTO schema_version (version) VALUES (2);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
