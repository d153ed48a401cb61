//! SQLite mutation log.
//!
//! Implements `MutationLog` using rusqlite (bundled). The connection sits
//! behind a `parking_lot::Mutex`; multi-row operations run inside a single
//! transaction so each trait call is atomic.

use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Result, StorageError, SurveySyncError};
use crate::types::{DiscardedMutation, EntityKind, FieldDelta, Mutation, MutationType, User};

use super::traits::MutationLog;

const SELECT_COLS: &str = "SELECT sequence, id, survey_id, feature_id, entity_kind, entity_id, \
     user_id, mutation_type, field_deltas, retry_count, last_error, client_timestamp, \
     discard_reason FROM mutations";

/// Map a rusqlite error to a `SurveySyncError`.
fn storage_err(e: rusqlite::Error) -> SurveySyncError {
    SurveySyncError::Storage(StorageError::Sqlite(e))
}

fn corruption(
    id: &str,
    field: &str,
    source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> SurveySyncError {
    SurveySyncError::Storage(StorageError::Corruption {
        table: "mutations".to_string(),
        id: id.to_string(),
        field: field.to_string(),
        source: source.into(),
    })
}

// ============================================================================
// Row decoding
// ============================================================================

/// Raw column values; decoded into a `Mutation` outside the rusqlite closure
/// so parse failures surface as `StorageError::Corruption`.
struct MutationRow {
    sequence: i64,
    id: String,
    survey_id: String,
    feature_id: String,
    entity_kind: String,
    entity_id: String,
    user_id: String,
    mutation_type: String,
    field_deltas: String,
    retry_count: u32,
    last_error: Option<String>,
    client_timestamp: String,
    discard_reason: Option<String>,
}

impl MutationRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            sequence: row.get(0)?,
            id: row.get(1)?,
            survey_id: row.get(2)?,
            feature_id: row.get(3)?,
            entity_kind: row.get(4)?,
            entity_id: row.get(5)?,
            user_id: row.get(6)?,
            mutation_type: row.get(7)?,
            field_deltas: row.get(8)?,
            retry_count: row.get(9)?,
            last_error: row.get(10)?,
            client_timestamp: row.get(11)?,
            discard_reason: row.get(12)?,
        })
    }

    fn into_mutation(self) -> Result<Mutation> {
        let mutation_type: MutationType = self
            .mutation_type
            .parse()
            .map_err(|e: String| corruption(&self.id, "mutation_type", e))?;
        let field_deltas: Vec<FieldDelta> = serde_json::from_str(&self.field_deltas)
            .map_err(|e| corruption(&self.id, "field_deltas", e))?;
        let client_timestamp = DateTime::parse_from_rfc3339(&self.client_timestamp)
            .map_err(|e| corruption(&self.id, "client_timestamp", e))?
            .with_timezone(&Utc);

        Ok(Mutation {
            id: self.id,
            sequence: self.sequence,
            survey_id: self.survey_id,
            feature_id: self.feature_id,
            entity_kind: EntityKind::from(self.entity_kind),
            entity_id: self.entity_id,
            user_id: self.user_id,
            mutation_type,
            field_deltas,
            retry_count: self.retry_count,
            last_error: self.last_error,
            client_timestamp,
        })
    }
}

// ============================================================================
// SqliteMutationLog
// ============================================================================

pub struct SqliteMutationLog {
    conn: Mutex<Connection>,
}

impl SqliteMutationLog {
    /// Open (or create) a file-backed log, creating parent directories.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Transaction {
                message: format!("failed to create db directory {}", parent.display()),
                source: Some(Box::new(e)),
            })?;
        }
        let conn = Connection::open(path).map_err(storage_err)?;
        Self::init(conn)
    }

    /// Open an in-memory log (useful for tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=FULL;
             PRAGMA busy_timeout=5000;",
        )
        .map_err(storage_err)?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS mutations (
                sequence         INTEGER PRIMARY KEY AUTOINCREMENT,
                id               TEXT NOT NULL UNIQUE,
                survey_id        TEXT NOT NULL,
                feature_id       TEXT NOT NULL,
                entity_kind      TEXT NOT NULL,
                entity_id        TEXT NOT NULL,
                user_id          TEXT NOT NULL,
                mutation_type    TEXT NOT NULL,
                field_deltas     TEXT NOT NULL DEFAULT '[]',
                retry_count      INTEGER NOT NULL DEFAULT 0,
                last_error       TEXT,
                client_timestamp TEXT NOT NULL,
                discarded        INTEGER NOT NULL DEFAULT 0,
                discard_reason   TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_mutations_scope
                ON mutations(feature_id, discarded, sequence);
            CREATE TABLE IF NOT EXISTS users (
                id           TEXT PRIMARY KEY,
                email        TEXT NOT NULL,
                display_name TEXT NOT NULL
            );",
        )
        .map_err(storage_err)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run `f` inside one transaction; rolls back when `f` fails.
    fn with_tx<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction().map_err(storage_err)?;
        let value = f(&tx)?;
        tx.commit().map_err(storage_err)?;
        Ok(value)
    }

    fn query_mutations(&self, sql: &str, scope_id: &str) -> Result<Vec<MutationRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(sql).map_err(storage_err)?;
        let rows = stmt
            .query_map(params![scope_id], MutationRow::from_row)
            .map_err(storage_err)?;
        let rows: rusqlite::Result<Vec<_>> = rows.collect();
        rows.map_err(storage_err)
    }
}

impl MutationLog for SqliteMutationLog {
    fn append(&self, mut mutation: Mutation) -> Result<Mutation> {
        let deltas = serde_json::to_string(&mutation.field_deltas)
            .map_err(|e| SurveySyncError::Internal(format!("serialize field deltas: {e}")))?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO mutations \
             (id, survey_id, feature_id, entity_kind, entity_id, user_id, mutation_type, \
              field_deltas, retry_count, last_error, client_timestamp) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                mutation.id,
                mutation.survey_id,
                mutation.feature_id,
                mutation.entity_kind.as_str(),
                mutation.entity_id,
                mutation.user_id,
                mutation.mutation_type.as_str(),
                deltas,
                mutation.retry_count,
                mutation.last_error,
                mutation.client_timestamp.to_rfc3339(),
            ],
        )
        .map_err(storage_err)?;
        mutation.sequence = conn.last_insert_rowid();
        Ok(mutation)
    }

    fn pending_for(&self, scope_id: &str) -> Result<Vec<Mutation>> {
        let sql = format!("{} WHERE feature_id = ?1 AND discarded = 0 ORDER BY sequence", SELECT_COLS);
        self.query_mutations(&sql, scope_id)?
            .into_iter()
            .map(MutationRow::into_mutation)
            .collect()
    }

    fn finalize(&self, mutations: &[Mutation]) -> Result<usize> {
        self.with_tx(|conn| {
            let mut stmt = conn
                .prepare_cached("DELETE FROM mutations WHERE id = ?1 AND discarded = 0")
                .map_err(storage_err)?;
            let mut removed = 0;
            for mutation in mutations {
                removed += stmt.execute(params![mutation.id]).map_err(storage_err)?;
            }
            Ok(removed)
        })
    }

    fn mark_retry(&self, mutations: &[Mutation], error: &str) -> Result<()> {
        self.with_tx(|conn| {
            let mut stmt = conn
                .prepare_cached(
                    "UPDATE mutations SET retry_count = retry_count + 1, last_error = ?2 \
                     WHERE id = ?1 AND discarded = 0",
                )
                .map_err(storage_err)?;
            for mutation in mutations {
                stmt.execute(params![mutation.id, error])
                    .map_err(storage_err)?;
            }
            Ok(())
        })
    }

    fn user_of(&self, user_id: &str) -> Result<User> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT id, email, display_name FROM users WHERE id = ?1")
            .map_err(storage_err)?;
        let user = stmt
            .query_row(params![user_id], |row| {
                Ok(User {
                    id: row.get(0)?,
                    email: row.get(1)?,
                    display_name: row.get(2)?,
                })
            })
            .optional()
            .map_err(storage_err)?;
        user.ok_or_else(|| StorageError::user_not_found(user_id).into())
    }

    fn discard(&self, mutations: &[Mutation], reason: &str) -> Result<usize> {
        self.with_tx(|conn| {
            let mut stmt = conn
                .prepare_cached(
                    "UPDATE mutations SET discarded = 1, discard_reason = ?2 \
                     WHERE id = ?1 AND discarded = 0",
                )
                .map_err(storage_err)?;
            let mut moved = 0;
            for mutation in mutations {
                moved += stmt
                    .execute(params![mutation.id, reason])
                    .map_err(storage_err)?;
            }
            Ok(moved)
        })
    }

    fn discarded(&self, scope_id: &str) -> Result<Vec<DiscardedMutation>> {
        let sql = format!("{} WHERE feature_id = ?1 AND discarded = 1 ORDER BY sequence", SELECT_COLS);
        self.query_mutations(&sql, scope_id)?
            .into_iter()
            .map(|row| {
                let reason = row.discard_reason.clone().unwrap_or_default();
                Ok(DiscardedMutation {
                    mutation: row.into_mutation()?,
                    reason,
                })
            })
            .collect()
    }

    fn reset_retries(&self, scope_id: &str) -> Result<usize> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE mutations SET retry_count = 0, last_error = NULL \
             WHERE feature_id = ?1 AND discarded = 0 \
               AND (retry_count > 0 OR last_error IS NOT NULL)",
            params![scope_id],
        )
        .map_err(storage_err)
    }

    fn pending_scopes(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT DISTINCT feature_id FROM mutations WHERE discarded = 0 ORDER BY feature_id",
            )
            .map_err(storage_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(storage_err)?;
        let scopes: rusqlite::Result<Vec<_>> = rows.collect();
        scopes.map_err(storage_err)
    }

    fn put_user(&self, user: &User) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO users (id, email, display_name) VALUES (?1, ?2, ?3)",
            params![user.id, user.email, user.display_name],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    fn remove_user(&self, user_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let removed = conn
            .execute("DELETE FROM users WHERE id = ?1", params![user_id])
            .map_err(storage_err)?;
        Ok(removed > 0)
    }
}
