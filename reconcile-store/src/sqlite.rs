//! SQLite-backed datastore.
//!
//! Rows live in one table with their fields as JSON; relationship fields are
//! mirrored into a `links` table so SQLite enforces referential integrity.

use crate::error::{ConstraintKind, StoreError, StoreResult};
use crate::row::{Link, Row, RowPatch, StoredValue};
use crate::Datastore;
use reconcile_types::{NaturalKey, RecordId};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

const ROW_COLUMNS: &str =
    "id, model_type, key_parts, fields, owner, status, prior_status, tags";

/// Persistent datastore backed by SQLite.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens (or creates) a store at the given path.
    pub fn new(path: &str) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        debug!(path, "opened sqlite datastore");
        Ok(store)
    }

    /// Opens an in-memory store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS rows (
                id TEXT PRIMARY KEY,
                model_type TEXT NOT NULL,
                natural_key TEXT NOT NULL,
                key_parts TEXT NOT NULL,
                fields TEXT NOT NULL,
                owner TEXT,
                status TEXT,
                prior_status TEXT,
                tags TEXT NOT NULL,
                UNIQUE(model_type, key_parts)
            );

            CREATE TABLE IF NOT EXISTS links (
                from_id TEXT NOT NULL REFERENCES rows(id) ON DELETE CASCADE,
                field TEXT NOT NULL,
                to_id TEXT NOT NULL REFERENCES rows(id) ON DELETE RESTRICT
            );

            CREATE INDEX IF NOT EXISTS idx_rows_model ON rows(model_type);
            CREATE INDEX IF NOT EXISTS idx_links_from ON links(from_id, field);
            CREATE INDEX IF NOT EXISTS idx_links_to ON links(to_id);
            ",
        )?;
        Ok(())
    }
}

// ── Row encoding ─────────────────────────────────────────────────

struct RawRow {
    id: String,
    model_type: String,
    key_parts: String,
    fields: String,
    owner: Option<String>,
    status: Option<String>,
    prior_status: Option<String>,
    tags: String,
}

fn read_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        id: row.get(0)?,
        model_type: row.get(1)?,
        key_parts: row.get(2)?,
        fields: row.get(3)?,
        owner: row.get(4)?,
        status: row.get(5)?,
        prior_status: row.get(6)?,
        tags: row.get(7)?,
    })
}

impl RawRow {
    fn decode(self) -> StoreResult<Row> {
        let id = RecordId::parse(&self.id)
            .map_err(|e| StoreError::InvalidData(format!("invalid row id {}: {e}", self.id)))?;
        let key: NaturalKey = serde_json::from_str(&self.key_parts)?;
        let owner = self
            .owner
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        Ok(Row {
            id,
            model_type: self.model_type,
            key,
            fields: serde_json::from_str(&self.fields)?,
            owner,
            status: self.status,
            prior_status: self.prior_status,
            tags: serde_json::from_str(&self.tags)?,
        })
    }
}

/// Translates SQLite constraint failures into the store's own taxonomy.
fn map_write_error(err: rusqlite::Error, context: &str) -> StoreError {
    if let rusqlite::Error::SqliteFailure(ffi_err, _) = &err {
        let kind = match ffi_err.extended_code {
            rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                Some(ConstraintKind::Unique)
            }
            rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY => Some(ConstraintKind::ReferentialIntegrity),
            rusqlite::ffi::SQLITE_CONSTRAINT_NOTNULL => Some(ConstraintKind::Required),
            _ => None,
        };
        if let Some(kind) = kind {
            return StoreError::constraint(kind, format!("{context}: {err}"));
        }
    }
    StoreError::Database(err)
}

fn check_link_targets<'a>(
    conn: &Connection,
    links: impl Iterator<Item = &'a Link>,
) -> StoreResult<()> {
    let mut stmt = conn.prepare_cached("SELECT model_type FROM rows WHERE id = ?1")?;
    for link in links {
        let found: Option<String> = stmt
            .query_row(params![link.id.to_string()], |r| r.get(0))
            .optional()?;
        if found.as_deref() != Some(link.model_type.as_str()) {
            return Err(StoreError::constraint(
                ConstraintKind::ReferentialIntegrity,
                format!("link to missing {} row {}", link.model_type, link.id),
            ));
        }
    }
    Ok(())
}

fn write_links(conn: &Connection, id: RecordId, field: &str, value: &StoredValue) -> StoreResult<()> {
    let mut stmt =
        conn.prepare_cached("INSERT INTO links (from_id, field, to_id) VALUES (?1, ?2, ?3)")?;
    for link in value.links() {
        stmt.execute(params![id.to_string(), field, link.id.to_string()])
            .map_err(|e| map_write_error(e, field))?;
    }
    Ok(())
}

fn load_row(conn: &Connection, id: RecordId) -> StoreResult<Option<Row>> {
    let raw = conn
        .query_row(
            &format!("SELECT {ROW_COLUMNS} FROM rows WHERE id = ?1"),
            params![id.to_string()],
            read_raw,
        )
        .optional()?;
    raw.map(RawRow::decode).transpose()
}

impl Datastore for SqliteStore {
    fn list(&self, model_types: &[String]) -> StoreResult<Vec<Row>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {ROW_COLUMNS} FROM rows WHERE model_type = ?1 ORDER BY id"
        ))?;
        let mut result = Vec::new();
        for model_type in model_types {
            let raws = stmt
                .query_map(params![model_type], read_raw)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            for raw in raws {
                result.push(raw.decode()?);
            }
        }
        Ok(result)
    }

    fn get(&self, id: RecordId) -> StoreResult<Option<Row>> {
        let conn = self.lock()?;
        load_row(&conn, id)
    }

    fn find_by_key(&self, model_type: &str, key: &NaturalKey) -> StoreResult<Option<Row>> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {ROW_COLUMNS} FROM rows WHERE model_type = ?1 AND key_parts = ?2"
                ),
                params![model_type, serde_json::to_string(key)?],
                read_raw,
            )
            .optional()?;
        raw.map(RawRow::decode).transpose()
    }

    fn insert(&self, row: &Row) -> StoreResult<()> {
        if row.key.arity() == 0 {
            return Err(StoreError::constraint(
                ConstraintKind::Required,
                format!("{} row without natural key", row.model_type),
            ));
        }
        let mut conn = self.lock()?;
        let sp = conn.savepoint()?;
        check_link_targets(&sp, row.links())?;
        let owner = row.owner.as_ref().map(serde_json::to_string).transpose()?;
        sp.execute(
            "INSERT INTO rows (id, model_type, natural_key, key_parts, fields, owner, status, prior_status, tags)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                row.id.to_string(),
                row.model_type,
                row.key.to_string(),
                serde_json::to_string(&row.key)?,
                serde_json::to_string(&row.fields)?,
                owner,
                row.status,
                row.prior_status,
                serde_json::to_string(&row.tags)?,
            ],
        )
        .map_err(|e| map_write_error(e, &format!("{} {}", row.model_type, row.key)))?;
        for (field, value) in &row.fields {
            write_links(&sp, row.id, field, value)?;
        }
        sp.commit()?;
        Ok(())
    }

    fn update(&self, id: RecordId, patch: &RowPatch) -> StoreResult<Row> {
        let mut conn = self.lock()?;
        let sp = conn.savepoint()?;
        let mut row = load_row(&sp, id)?.ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        check_link_targets(&sp, patch.links())?;
        row.apply_patch(patch);

        let owner = row.owner.as_ref().map(serde_json::to_string).transpose()?;
        sp.execute(
            "UPDATE rows SET fields = ?2, owner = ?3, status = ?4, prior_status = ?5, tags = ?6
             WHERE id = ?1",
            params![
                id.to_string(),
                serde_json::to_string(&row.fields)?,
                owner,
                row.status,
                row.prior_status,
                serde_json::to_string(&row.tags)?,
            ],
        )
        .map_err(|e| map_write_error(e, &format!("{} {}", row.model_type, row.key)))?;
        for (field, value) in &patch.fields {
            sp.execute(
                "DELETE FROM links WHERE from_id = ?1 AND field = ?2",
                params![id.to_string(), field],
            )?;
            write_links(&sp, id, field, value)?;
        }
        sp.commit()?;
        Ok(row)
    }

    fn delete(&self, id: RecordId) -> StoreResult<()> {
        let mut conn = self.lock()?;
        let sp = conn.savepoint()?;
        let row = load_row(&sp, id)?.ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let referrer: Option<(String, String)> = sp
            .query_row(
                "SELECT r.model_type, r.natural_key FROM links l
                 JOIN rows r ON r.id = l.from_id
                 WHERE l.to_id = ?1 AND l.from_id != ?1 LIMIT 1",
                params![id.to_string()],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        if let Some((model_type, key)) = referrer {
            return Err(StoreError::constraint(
                ConstraintKind::ReferentialIntegrity,
                format!(
                    "{} {} is still referenced by {model_type} {key}",
                    row.model_type, row.key
                ),
            ));
        }

        sp.execute("DELETE FROM links WHERE from_id = ?1", params![id.to_string()])?;
        sp.execute("DELETE FROM rows WHERE id = ?1", params![id.to_string()])
            .map_err(|e| map_write_error(e, &format!("{} {}", row.model_type, row.key)))?;
        sp.commit()?;
        Ok(())
    }

    fn count(&self, model_type: &str) -> StoreResult<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM rows WHERE model_type = ?1",
            params![model_type],
            |r| r.get(0),
        )?;
        Ok(count as usize)
    }

    fn begin(&self) -> StoreResult<()> {
        let conn = self.lock()?;
        if !conn.is_autocommit() {
            return Err(StoreError::Transaction("transaction already open".into()));
        }
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    fn commit(&self) -> StoreResult<()> {
        let conn = self.lock()?;
        if conn.is_autocommit() {
            return Err(StoreError::Transaction("commit without begin".into()));
        }
        conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&self) -> StoreResult<()> {
        let conn = self.lock()?;
        if conn.is_autocommit() {
            return Err(StoreError::Transaction("rollback without begin".into()));
        }
        conn.execute_batch("ROLLBACK")?;
        Ok(())
    }
}
