use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use super::Table;
use crate::error::{EngineError, Result};

pub const SCHEMA_VERSION_KEY: &str = "schemaVersion";
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Forward migrations, applied in order. Entry `n` upgrades version `n` to `n + 1`.
const MIGRATIONS: [&str; 1] = [
    // 0 -> 1: unversioned databases only lacked the meta stamp
    "",
];

pub(super) fn initialize(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    for table in Table::ALL {
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                )",
                table.name()
            ),
            [],
        )?;
    }

    migrate(conn)
}

fn migrate(conn: &mut Connection) -> Result<()> {
    let found = stored_version(conn)?;
    if found > CURRENT_SCHEMA_VERSION {
        return Err(EngineError::SchemaIncompatible {
            found,
            supported: CURRENT_SCHEMA_VERSION,
        });
    }
    if found == CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn.transaction()?;
    for version in found..CURRENT_SCHEMA_VERSION {
        let step = MIGRATIONS[version as usize];
        if !step.is_empty() {
            tx.execute_batch(step)?;
        }
        info!("Migrated store schema {} -> {}", version, version + 1);
    }
    tx.execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
        params![SCHEMA_VERSION_KEY, CURRENT_SCHEMA_VERSION.to_string()],
    )?;
    tx.commit()?;
    Ok(())
}

pub(super) fn stored_version(conn: &Connection) -> Result<u32> {
    match read_meta(conn, SCHEMA_VERSION_KEY)? {
        None => Ok(0),
        Some(raw) => raw.parse().map_err(|_| {
            EngineError::SerializationError(format!("unreadable schema version '{}'", raw))
        }),
    }
}

pub(super) fn read_meta(conn: &Connection, key: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| row.get(0))
        .optional()?)
}

pub(super) fn write_meta(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
        params![key, value],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_database_is_stamped() {
        let mut conn = Connection::open_in_memory().unwrap();
        initialize(&mut conn).unwrap();
        assert_eq!(stored_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn newer_schema_fails_cleanly() {
        let mut conn = Connection::open_in_memory().unwrap();
        initialize(&mut conn).unwrap();
        write_meta(&conn, SCHEMA_VERSION_KEY, "99").unwrap();
        let err = initialize(&mut conn).unwrap_err();
        assert!(matches!(err, EngineError::SchemaIncompatible { found: 99, .. }));
    }

    #[test]
    fn initialize_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        initialize(&mut conn).unwrap();
        write_meta(&conn, "flag", "1").unwrap();
        initialize(&mut conn).unwrap();
        assert_eq!(read_meta(&conn, "flag").unwrap().as_deref(), Some("1"));
    }
}
