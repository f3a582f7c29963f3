//! Catalog schema migrations
//!
//! The schema version lives in `PRAGMA user_version`. Each migration runs in
//! its own transaction and bumps the version when it commits.

use rusqlite::Connection;
use tracing::{debug, info};

use super::CatalogError;

pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub sql: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "packages, channels, bundles and channel entries",
        sql: "
            CREATE TABLE package (
              name TEXT PRIMARY KEY,
              default_channel TEXT
            );
            CREATE TABLE channel (
              name TEXT NOT NULL,
              package_name TEXT NOT NULL,
              head_operatorbundle_name TEXT NOT NULL,
              PRIMARY KEY (name, package_name),
              FOREIGN KEY (package_name) REFERENCES package(name) ON DELETE CASCADE
            );
            CREATE TABLE operatorbundle (
              name TEXT PRIMARY KEY,
              csv TEXT NOT NULL,
              bundle TEXT NOT NULL,
              bundlepath TEXT,
              version TEXT,
              skiprange TEXT,
              replaces TEXT,
              skips TEXT
            );
            CREATE TABLE channel_entry (
              entry_id INTEGER PRIMARY KEY,
              channel_name TEXT NOT NULL,
              package_name TEXT NOT NULL,
              operatorbundle_name TEXT NOT NULL,
              replaces TEXT,
              depth INTEGER NOT NULL,
              FOREIGN KEY (channel_name, package_name)
                REFERENCES channel(name, package_name) ON DELETE CASCADE
            );
        ",
    },
    Migration {
        version: 2,
        description: "bundle package ownership and entry lookup index",
        sql: "
            ALTER TABLE operatorbundle ADD COLUMN package_name TEXT;
            CREATE INDEX idx_channel_entry_bundle ON channel_entry(operatorbundle_name);
            CREATE INDEX idx_channel_entry_package ON channel_entry(package_name, channel_name);
        ",
    },
];

/// Highest schema version this build understands
pub fn latest_version() -> i64 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

fn current_version(conn: &Connection) -> Result<i64, CatalogError> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}

/// Apply every migration newer than the database's version
///
/// A database written by a newer schema is refused rather than guessed at.
pub fn migrate(conn: &mut Connection) -> Result<i64, CatalogError> {
    let current = current_version(conn)?;
    let latest = latest_version();
    if current > latest {
        return Err(CatalogError::SchemaTooNew {
            found: current,
            supported: latest,
        });
    }

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        debug!(
            "Applying catalog migration {}: {}",
            migration.version, migration.description
        );
        let tx = conn.transaction()?;
        tx.execute_batch(migration.sql)?;
        tx.pragma_update(None, "user_version", migration.version)?;
        tx.commit()?;
    }

    if current < latest {
        info!("Catalog schema migrated from version {} to {}", current, latest);
    }
    Ok(latest)
}
