// Durable storage for songs, playlists, the queue snapshot and settings
// SQLite underneath; every record is a JSON blob keyed by its string id

mod schema;

pub use schema::{CURRENT_SCHEMA_VERSION, SCHEMA_VERSION_KEY};

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::model::{Playlist, PlaybackSettings, QueueSnapshot, Song};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Songs,
    Playlists,
    Queue,
    Settings,
}

impl Table {
    pub const ALL: [Table; 4] = [Table::Songs, Table::Playlists, Table::Queue, Table::Settings];

    pub fn name(self) -> &'static str {
        match self {
            Table::Songs => "songs",
            Table::Playlists => "playlists",
            Table::Queue => "queue",
            Table::Settings => "settings",
        }
    }
}

/// Anything that lives in one of the four typed tables.
pub trait Record: Serialize + DeserializeOwned {
    const TABLE: Table;

    fn record_id(&self) -> String;
}

impl Record for Song {
    const TABLE: Table = Table::Songs;

    fn record_id(&self) -> String {
        self.id.clone()
    }
}

impl Record for Playlist {
    const TABLE: Table = Table::Playlists;

    fn record_id(&self) -> String {
        self.id.clone()
    }
}

impl Record for QueueSnapshot {
    const TABLE: Table = Table::Queue;

    fn record_id(&self) -> String {
        QueueSnapshot::KEY.to_string()
    }
}

impl Record for PlaybackSettings {
    const TABLE: Table = Table::Settings;

    fn record_id(&self) -> String {
        PlaybackSettings::KEY.to_string()
    }
}

impl PlaybackSettings {
    pub const KEY: &'static str = "playback";
}

/// Opened once per process. All callers serialize through the inner mutex;
/// writes are committed before the call returns.
pub struct PersistentStore {
    conn: Mutex<Option<Connection>>,
    path: Option<PathBuf>,
}

impl PersistentStore {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EngineError::StoreUnavailable(format!("{}: {}", parent.display(), e)))?;
        }
        let conn = Connection::open(&path)
            .map_err(|e| EngineError::StoreUnavailable(format!("{}: {}", path.display(), e)))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        let store = Self::from_connection(conn, Some(path))?;
        info!("Opened store at {}", store.path.as_deref().unwrap_or(Path::new(":memory:")).display());
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, None)
    }

    fn from_connection(mut conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        schema::initialize(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            path,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Connection>> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self.lock();
        let conn = guard
            .as_mut()
            .ok_or_else(|| EngineError::StoreUnavailable("store is closed".to_string()))?;
        f(conn)
    }

    pub fn get<T: Record>(&self, id: &str) -> Result<Option<T>> {
        let raw: Option<String> = self.with_conn(|conn| {
            let sql = format!("SELECT value FROM {} WHERE id = ?1", T::TABLE.name());
            Ok(conn.query_row(&sql, params![id], |row| row.get(0)).optional()?)
        })?;
        raw.map(|json| decode::<T>(&json)).transpose()
    }

    pub fn put<T: Record>(&self, record: &T) -> Result<()> {
        let json = serde_json::to_string(record)?;
        let id = record.record_id();
        self.with_conn(|conn| {
            let sql = format!(
                "INSERT OR REPLACE INTO {} (id, value) VALUES (?1, ?2)",
                T::TABLE.name()
            );
            conn.execute(&sql, params![id, json])?;
            Ok(())
        })
    }

    /// All-or-nothing within the table.
    pub fn put_batch<T: Record>(&self, records: &[T]) -> Result<()> {
        let encoded = encode_all(records)?;
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            {
                let sql = format!(
                    "INSERT OR REPLACE INTO {} (id, value) VALUES (?1, ?2)",
                    T::TABLE.name()
                );
                let mut stmt = tx.prepare_cached(&sql)?;
                for (id, json) in &encoded {
                    stmt.execute(params![id, json])?;
                }
            }
            tx.commit()?;
            Ok(())
        })?;
        debug!("Wrote {} records to {}", records.len(), T::TABLE.name());
        Ok(())
    }

    /// Returns whether a row was removed.
    pub fn delete<T: Record>(&self, id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let sql = format!("DELETE FROM {} WHERE id = ?1", T::TABLE.name());
            Ok(conn.execute(&sql, params![id])? > 0)
        })
    }

    pub fn iterate<T: Record>(&self) -> Result<Vec<T>> {
        let rows: Vec<String> = self.with_conn(|conn| {
            let sql = format!("SELECT value FROM {} ORDER BY id", T::TABLE.name());
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        rows.iter().map(|json| decode::<T>(json)).collect()
    }

    pub fn clear(&self, table: Table) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(&format!("DELETE FROM {}", table.name()), [])?;
            Ok(())
        })
    }

    /// Swap a table's contents in one transaction. Used by import.
    pub fn replace_all<T: Record>(&self, records: &[T]) -> Result<()> {
        let encoded = encode_all(records)?;
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(&format!("DELETE FROM {}", T::TABLE.name()), [])?;
            {
                let sql = format!("INSERT INTO {} (id, value) VALUES (?1, ?2)", T::TABLE.name());
                let mut stmt = tx.prepare_cached(&sql)?;
                for (id, json) in &encoded {
                    stmt.execute(params![id, json])?;
                }
            }
            tx.commit()?;
            Ok(())
        })?;
        info!("Replaced {} with {} records", T::TABLE.name(), records.len());
        Ok(())
    }

    pub fn get_flag(&self, key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| schema::read_meta(conn, key))
    }

    pub fn set_flag(&self, key: &str, value: &str) -> Result<()> {
        self.with_conn(|conn| schema::write_meta(conn, key, value))
    }

    pub fn schema_version(&self) -> Result<u32> {
        self.with_conn(|conn| schema::stored_version(conn))
    }

    /// Release the connection. Later calls fail with `StoreUnavailable`.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.lock();
        if let Some(conn) = guard.take() {
            conn.close()
                .map_err(|(_, e)| EngineError::StoreUnavailable(e.to_string()))?;
            info!("Store closed");
        }
        Ok(())
    }
}

fn encode_all<T: Record>(records: &[T]) -> Result<Vec<(String, String)>> {
    records
        .iter()
        .map(|r| Ok((r.record_id(), serde_json::to_string(r)?)))
        .collect()
}

fn decode<T: Record>(json: &str) -> Result<T> {
    serde_json::from_str(json).map_err(|e| {
        EngineError::SerializationError(format!("{} record: {}", T::TABLE.name(), e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SystemKind;
    use tempfile::TempDir;

    fn song(path: &str) -> Song {
        Song::new(PathBuf::from(path), path.trim_start_matches('/'))
    }

    #[test]
    fn put_get_delete_round() {
        let store = PersistentStore::open_in_memory().unwrap();
        let a = song("/m/a.mp3");
        store.put(&a).unwrap();
        assert_eq!(store.get::<Song>(&a.id).unwrap(), Some(a.clone()));
        assert!(store.delete::<Song>(&a.id).unwrap());
        assert!(!store.delete::<Song>(&a.id).unwrap());
        assert_eq!(store.get::<Song>(&a.id).unwrap(), None);
    }

    #[test]
    fn batch_and_iterate() {
        let store = PersistentStore::open_in_memory().unwrap();
        let songs: Vec<Song> = ["/m/a.mp3", "/m/b.mp3", "/m/c.mp3"].iter().map(|p| song(p)).collect();
        store.put_batch(&songs).unwrap();
        assert_eq!(store.iterate::<Song>().unwrap().len(), 3);
        store.clear(Table::Songs).unwrap();
        assert!(store.iterate::<Song>().unwrap().is_empty());
    }

    #[test]
    fn tables_are_independent() {
        let store = PersistentStore::open_in_memory().unwrap();
        store.put(&Playlist::new_system(SystemKind::Liked)).unwrap();
        store.put(&PlaybackSettings::default()).unwrap();
        store.clear(Table::Playlists).unwrap();
        assert!(store.get::<PlaybackSettings>(PlaybackSettings::KEY).unwrap().is_some());
    }

    #[test]
    fn survives_reopen_and_reports_closed() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("library.db");
        let a = song("/m/a.mp3");
        {
            let store = PersistentStore::open(&db).unwrap();
            store.put(&a).unwrap();
            store.close().unwrap();
            assert!(matches!(store.get::<Song>(&a.id), Err(EngineError::StoreUnavailable(_))));
        }
        let store = PersistentStore::open(&db).unwrap();
        assert_eq!(store.get::<Song>(&a.id).unwrap(), Some(a));
        assert_eq!(store.schema_version().unwrap(), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn corrupt_record_is_a_serialization_error() {
        let store = PersistentStore::open_in_memory().unwrap();
        store
            .with_conn(|conn| {
                conn.execute("INSERT INTO songs (id, value) VALUES ('x', 'not json')", [])?;
                Ok(())
            })
            .unwrap();
        assert!(matches!(store.get::<Song>("x"), Err(EngineError::SerializationError(_))));
    }

    #[test]
    fn flags_round_trip() {
        let store = PersistentStore::open_in_memory().unwrap();
        assert_eq!(store.get_flag("firstLaunch").unwrap(), None);
        store.set_flag("firstLaunch", "done").unwrap();
        assert_eq!(store.get_flag("firstLaunch").unwrap().as_deref(), Some("done"));
    }
}
