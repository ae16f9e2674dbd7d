//! Embedded SQLite database backing the keymanager.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::Connection;
use thiserror::Error;

const DB_FILENAME: &str = "vigil.db";

#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("database lock poisoned")]
    Poisoned,
}

struct Migration {
    version: i64,
    description: &'static str,
    statements: &'static [&'static str],
}

// The WAL pragma cannot run inside a transaction, so it is applied
// separately before the versioned migrations, in autocommit mode.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Create initial db_version table",
        statements: &[
            "CREATE TABLE db_version (version INTEGER) STRICT;",
            "INSERT INTO db_version VALUES (1);",
        ],
    },
    Migration {
        version: 2,
        description: "Create keymanager_data table",
        statements: &[
            "CREATE TABLE keymanager_data (
                pubkey TEXT PRIMARY KEY,
                url TEXT,
                fee_recipient TEXT NULL,
                gas_limit TEXT NULL,
                graffiti TEXT NULL
            ) STRICT;",
        ],
    },
];

pub struct Db {
    connection: Mutex<Connection>,
}

impl Db {
    pub fn open(data_dir: &Path) -> Result<Self, DbError> {
        Self::open_path(&data_dir.join(DB_FILENAME))
    }

    fn open_path(path: &PathBuf) -> Result<Self, DbError> {
        let connection = Connection::open(path)?;
        // Autocommit context; rusqlite connections start in autocommit mode.
        connection.pragma_update(None, "journal_mode", "WAL")?;
        Ok(Db {
            connection: Mutex::new(connection),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, DbError> {
        let connection = Connection::open_in_memory()?;
        Ok(Db {
            connection: Mutex::new(connection),
        })
    }

    fn current_version(connection: &Connection) -> Result<i64, DbError> {
        let result = connection.query_row("SELECT version FROM db_version;", [], |row| {
            row.get::<_, i64>(0)
        });
        match result {
            Ok(version) => Ok(version),
            Err(rusqlite::Error::SqliteFailure(_, Some(ref message)))
                if message.contains("no such table: db_version") =>
            {
                Ok(-1)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn run_migrations(&self) -> Result<(), DbError> {
        let mut connection = self.connection.lock().map_err(|_| DbError::Poisoned)?;
        let current = Self::current_version(&connection)?;
        let latest = MIGRATIONS.iter().map(|m| m.version).max().unwrap_or(0);
        if current == latest {
            return Ok(());
        }

        tracing::info!("Running database migrations");
        for migration in MIGRATIONS {
            if current >= migration.version {
                continue;
            }
            tracing::info!(
                "Migrating to version {}: {}",
                migration.version,
                migration.description
            );
            let tx = connection.transaction()?;
            for statement in migration.statements {
                tx.execute_batch(statement)?;
            }
            if migration.version > 1 {
                tx.execute("UPDATE db_version SET version = ?1;", [migration.version])?;
            }
            tx.commit()?;
        }
        Ok(())
    }

    /// Run `f` with the connection held. Statements are short-lived; no
    /// awaits happen under the lock.
    pub fn with_connection<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    ) -> Result<T, DbError> {
        let connection = self.connection.lock().map_err(|_| DbError::Poisoned)?;
        Ok(f(&connection)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let db = Db::open_in_memory().unwrap();
        db.run_migrations().unwrap();
        db.run_migrations().unwrap();

        let version: i64 = db
            .with_connection(|conn| {
                conn.query_row("SELECT version FROM db_version;", [], |row| row.get(0))
            })
            .unwrap();
        assert_eq!(version, 2);
    }

    #[test]
    fn keymanager_table_exists_after_migrations() {
        let db = Db::open_in_memory().unwrap();
        db.run_migrations().unwrap();
        let count: i64 = db
            .with_connection(|conn| {
                conn.query_row("SELECT COUNT(*) FROM keymanager_data;", [], |row| row.get(0))
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn opens_on_disk_database_in_wal_mode() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path()).unwrap();
        db.run_migrations().unwrap();
        let mode: String = db
            .with_connection(|conn| {
                conn.query_row("PRAGMA journal_mode;", [], |row| row.get(0))
            })
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }
}
