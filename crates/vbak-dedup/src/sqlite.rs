//! SQLite implementation of the [`ContentIndex`] trait.
//!
//! Unlike the in-memory backends this one can live in a file and survive
//! between runs; the stored stamp tells the engine whether the archive has
//! changed since the index was last brought up to date.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;
use vbak_types::{ChunkAddr, ContentHash, SessionName, VolumeName};

use crate::error::{DedupError, DedupResult};
use crate::traits::{ChunkLocation, ContentIndex};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 1;

/// Initialize or migrate the database schema. Idempotent.
fn migrate(conn: &mut Connection) -> DedupResult<()> {
    let current: u32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if current > CURRENT_VERSION {
        return Err(DedupError::Migration(format!(
            "index schema version {current} is newer than supported {CURRENT_VERSION}"
        )));
    }
    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;
        tx.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                hash BLOB PRIMARY KEY,        -- 32 bytes, stored chunk hash
                volume TEXT NOT NULL,
                session TEXT NOT NULL,
                addr INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS chunks_by_session ON chunks (volume, session);

            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )?;
        tx.pragma_update(None, "user_version", CURRENT_VERSION)?;
        tx.commit()?;
    }
    Ok(())
}

fn row_to_location(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, i64)> {
    Ok((row.get("volume")?, row.get("session")?, row.get("addr")?))
}

fn decode_location((volume, session, addr): (String, String, i64)) -> DedupResult<ChunkLocation> {
    let volume = VolumeName::new(volume).map_err(|e| DedupError::InvalidData(e.to_string()))?;
    let session = session
        .parse::<SessionName>()
        .map_err(|e| DedupError::InvalidData(e.to_string()))?;
    Ok(ChunkLocation::new(volume, session, ChunkAddr::new(addr as u64)))
}

/// SQLite-backed index.
pub struct SqliteIndex {
    conn: Connection,
}

impl SqliteIndex {
    /// Open (creating if needed) an index database file.
    pub fn open(path: impl AsRef<Path>) -> DedupResult<Self> {
        let mut conn = Connection::open(path)?;
        migrate(&mut conn)?;
        Ok(Self { conn })
    }

    /// Open an in-memory index.
    pub fn open_memory() -> DedupResult<Self> {
        let mut conn = Connection::open_in_memory()?;
        migrate(&mut conn)?;
        Ok(Self { conn })
    }
}

impl ContentIndex for SqliteIndex {
    fn lookup(&self, hash: &ContentHash) -> DedupResult<Option<ChunkLocation>> {
        let row = self
            .conn
            .query_row(
                "SELECT volume, session, addr FROM chunks WHERE hash = ?1",
                params![hash.as_bytes().as_slice()],
                row_to_location,
            )
            .optional()?;
        row.map(decode_location).transpose()
    }

    fn insert(&mut self, hash: ContentHash, location: ChunkLocation) -> DedupResult<bool> {
        let changed = self.conn.execute(
            "INSERT OR IGNORE INTO chunks (hash, volume, session, addr) VALUES (?1, ?2, ?3, ?4)",
            params![
                hash.as_bytes().as_slice(),
                location.volume.as_str(),
                location.session.to_string(),
                location.addr.offset() as i64
            ],
        )?;
        Ok(changed == 1)
    }

    fn relocate(
        &mut self,
        volume: &VolumeName,
        from: &SessionName,
        to: &SessionName,
        survives: &dyn Fn(ChunkAddr) -> bool,
    ) -> DedupResult<usize> {
        let tx = self.conn.transaction()?;
        let rows: Vec<(Vec<u8>, i64)> = {
            let mut stmt =
                tx.prepare("SELECT hash, addr FROM chunks WHERE volume = ?1 AND session = ?2")?;
            let rows = stmt
                .query_map(params![volume.as_str(), from.to_string()], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        let mut dropped = 0;
        for (hash, addr) in rows {
            if survives(ChunkAddr::new(addr as u64)) {
                tx.execute(
                    "UPDATE chunks SET session = ?1 WHERE hash = ?2",
                    params![to.to_string(), hash],
                )?;
            } else {
                tx.execute("DELETE FROM chunks WHERE hash = ?1", params![hash])?;
                dropped += 1;
            }
        }
        tx.commit()?;
        debug!(volume = %volume, from = %from, to = %to, dropped, "index entries relocated");
        Ok(dropped)
    }

    fn remove_volume(&mut self, volume: &VolumeName) -> DedupResult<usize> {
        Ok(self
            .conn
            .execute("DELETE FROM chunks WHERE volume = ?1", params![volume.as_str()])?)
    }

    fn len(&self) -> DedupResult<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn clear(&mut self) -> DedupResult<()> {
        self.conn
            .execute_batch("DELETE FROM chunks; DELETE FROM meta;")?;
        Ok(())
    }

    fn stamp(&self) -> DedupResult<Option<String>> {
        Ok(self
            .conn
            .query_row("SELECT value FROM meta WHERE key = 'stamp'", [], |row| {
                row.get(0)
            })
            .optional()?)
    }

    fn set_stamp(&mut self, stamp: &str) -> DedupResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES ('stamp', ?1)",
            params![stamp],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::testing;

    #[test]
    fn first_insert_wins() {
        testing::first_insert_wins(&mut SqliteIndex::open_memory().unwrap());
    }

    #[test]
    fn relocation() {
        testing::relocation(&mut SqliteIndex::open_memory().unwrap());
    }

    #[test]
    fn volume_removal() {
        testing::volume_removal(&mut SqliteIndex::open_memory().unwrap());
    }

    #[test]
    fn persists_entries_and_stamp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dedup.sqlite");
        {
            let mut index = SqliteIndex::open(&path).unwrap();
            index
                .insert(testing::h("a"), testing::loc("root", 1, 3))
                .unwrap();
            index.set_stamp("root=S_20240501-000000").unwrap();
        }
        let index = SqliteIndex::open(&path).unwrap();
        assert_eq!(
            index.lookup(&testing::h("a")).unwrap(),
            Some(testing::loc("root", 1, 3))
        );
        assert_eq!(
            index.stamp().unwrap().as_deref(),
            Some("root=S_20240501-000000")
        );
    }

    #[test]
    fn clear_forgets_stamp() {
        let mut index = SqliteIndex::open_memory().unwrap();
        index.set_stamp("x").unwrap();
        index.clear().unwrap();
        assert_eq!(index.stamp().unwrap(), None);
    }
}
