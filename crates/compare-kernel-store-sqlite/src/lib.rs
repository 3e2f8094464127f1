use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS slots (
  key TEXT PRIMARY KEY CHECK (length(key) > 0),
  value TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
";

/// Durable key-value slots backed by one `SQLite` database file.
pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlotEntry {
    pub key: String,
    pub value: String,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub slot_count: i64,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed slot store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            if table_exists(&self.conn, "slots")? {
                // Slot table created without a migration record; adopt it as version 1.
                record_schema_version(&self.conn, 1)?;
            } else {
                apply_migration_1(&self.conn)?;
            }
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Read the raw value stored under `key`.
    ///
    /// An unmigrated database has no slots and yields `None`.
    ///
    /// # Errors
    /// Returns an error when the slot table cannot be queried.
    pub fn read_slot(&self, key: &str) -> Result<Option<String>> {
        Ok(self.slot_entry(key)?.map(|entry| entry.value))
    }

    /// Read the value stored under `key` together with its last write time.
    ///
    /// # Errors
    /// Returns an error when the slot table cannot be queried or holds an invalid timestamp.
    pub fn slot_entry(&self, key: &str) -> Result<Option<SlotEntry>> {
        if !table_exists(&self.conn, "slots")? {
            return Ok(None);
        }

        let row = self
            .conn
            .query_row(
                "SELECT value, updated_at FROM slots WHERE key = ?1",
                params![key],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .with_context(|| format!("failed to read slot {key}"))?;

        let Some((value, updated_at)) = row else {
            return Ok(None);
        };

        Ok(Some(SlotEntry { key: key.to_string(), value, updated_at: parse_rfc3339(&updated_at)? }))
    }

    /// Overwrite the value stored under `key` (last writer wins).
    ///
    /// # Errors
    /// Returns an error when `key` is empty or the write fails.
    pub fn write_slot(&mut self, key: &str, value: &str) -> Result<()> {
        if key.trim().is_empty() {
            return Err(anyhow!("slot key MUST be non-empty"));
        }

        let now = now_rfc3339()?;
        self.conn
            .execute(
                "INSERT INTO slots(key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, now],
            )
            .with_context(|| format!("failed to write slot {key}"))?;
        Ok(())
    }

    /// Remove `key`, reporting whether a value existed.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn delete_slot(&mut self, key: &str) -> Result<bool> {
        if !table_exists(&self.conn, "slots")? {
            return Ok(false);
        }

        let removed = self
            .conn
            .execute("DELETE FROM slots WHERE key = ?1", params![key])
            .with_context(|| format!("failed to delete slot {key}"))?;
        Ok(removed > 0)
    }

    /// Run `PRAGMA quick_check` and summarize the slot table.
    ///
    /// # Errors
    /// Returns an error when the integrity pragmas or schema inspection fail.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let slot_count = if table_exists(&self.conn, "slots")? {
            self.conn
                .query_row("SELECT COUNT(*) FROM slots", [], |row| row.get::<_, i64>(0))
                .context("failed to count slots")?
        } else {
            0
        };

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            slot_count,
            schema_status,
        })
    }
}

fn apply_migration_1(conn: &Connection) -> Result<()> {
    conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
    record_schema_version(conn, 1)
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if table_exists(conn, "slots")? {
        return Ok((1, true));
    }

    Ok((0, false))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}
