use rusqlite::Connection;

use crate::error::Result;

pub const SCHEMA_VERSION: i64 = 1;

pub fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;
    conn.pragma_update(None, "wal_autocheckpoint", 100)?;

    // Fails harmlessly on in-memory and fresh databases.
    if conn
        .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
        .is_ok()
    {
        tracing::debug!("startup WAL checkpoint complete");
    }

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS metadata (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS nodes (
            id               INTEGER PRIMARY KEY,
            label            TEXT NOT NULL,
            value            TEXT NOT NULL,
            embedding        TEXT NOT NULL DEFAULT '[]',
            salience         REAL NOT NULL,
            is_active        INTEGER NOT NULL DEFAULT 1,
            last_accessed    INTEGER NOT NULL,
            is_hypothetical  INTEGER NOT NULL DEFAULT 0,
            decay_multiplier REAL
        );

        CREATE TABLE IF NOT EXISTS edges (
            from_id INTEGER NOT NULL REFERENCES nodes(id),
            to_id   INTEGER NOT NULL REFERENCES nodes(id),
            weight  REAL NOT NULL,
            PRIMARY KEY (from_id, to_id)
        );

        CREATE TABLE IF NOT EXISTS trm_branches (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL UNIQUE,
            base_commit INTEGER,
            created_at  REAL NOT NULL,
            is_active   INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS trm_nodes (
            branch_id  TEXT NOT NULL REFERENCES trm_branches(id),
            position   INTEGER NOT NULL,
            commit_id  INTEGER NOT NULL,
            parent_id  INTEGER,
            content    TEXT NOT NULL,
            timestamp  REAL NOT NULL,
            energy     REAL NOT NULL,
            depth      INTEGER NOT NULL DEFAULT 0,
            source_id  TEXT NOT NULL DEFAULT '',
            PRIMARY KEY (branch_id, position)
        );

        CREATE INDEX IF NOT EXISTS idx_edges_from ON edges(from_id);
        CREATE INDEX IF NOT EXISTS idx_trm_nodes_commit ON trm_nodes(commit_id);
        ",
    )?;

    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES ('schema_version', ?1)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

pub fn get_schema_version(conn: &Connection) -> Result<Option<i64>> {
    let mut stmt = conn.prepare("SELECT value FROM metadata WHERE key = 'schema_version'")?;
    let version = stmt
        .query_row([], |row| {
            let v: String = row.get(0)?;
            Ok(v.parse::<i64>().unwrap_or(0))
        })
        .ok();
    Ok(version)
}
