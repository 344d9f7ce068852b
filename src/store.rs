//! Durable store: typed CRUD over the persisted tables.
//!
//! The live database is an in-memory SQLite connection. On open, the on-disk
//! file (if present) is loaded into memory, the idempotent schema DDL is
//! applied, and the store is flushed once. Every write schedules a flush
//! ~500 ms in the future; writes inside that window extend it (trailing-edge
//! debounce). `close` cancels the pending timer by flushing synchronously.
//!
//! Durability is bounded by the last completed flush. Flush I/O errors are
//! logged and swallowed; writes continue in memory.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::backup::Backup;
use rusqlite::{Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Current schema version, recorded in `PRAGMA user_version`.
const SCHEMA_VERSION: i64 = 1;

/// Trailing-edge debounce window for flushes.
const FLUSH_DEBOUNCE: Duration = Duration::from_millis(500);

/// Pages copied per backup step.
const BACKUP_PAGES_PER_STEP: std::os::raw::c_int = 100;

const SCHEMA_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS entities (
    id                TEXT PRIMARY KEY,
    label             TEXT NOT NULL,
    entity_type       TEXT NOT NULL DEFAULT 'unknown',
    properties        TEXT NOT NULL DEFAULT '{}',
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL,
    confidence        REAL NOT NULL DEFAULT 1.0,
    source_summary_id TEXT
);
CREATE INDEX IF NOT EXISTS idx_entities_label ON entities(label);
CREATE INDEX IF NOT EXISTS idx_entities_type ON entities(entity_type);

CREATE TABLE IF NOT EXISTS relations (
    id                TEXT PRIMARY KEY,
    subject_id        TEXT NOT NULL,
    predicate         TEXT NOT NULL,
    object_id         TEXT NOT NULL,
    properties        TEXT NOT NULL DEFAULT '{}',
    temporal_start    TEXT,
    temporal_end      TEXT,
    confidence        REAL NOT NULL DEFAULT 1.0,
    source_summary_id TEXT
);
CREATE INDEX IF NOT EXISTS idx_relations_subject ON relations(subject_id);
CREATE INDEX IF NOT EXISTS idx_relations_object ON relations(object_id);
CREATE INDEX IF NOT EXISTS idx_relations_predicate ON relations(predicate);

CREATE TABLE IF NOT EXISTS summaries (
    id          TEXT PRIMARY KEY,
    tier        INTEGER NOT NULL DEFAULT 0,
    content     TEXT NOT NULL,
    token_count INTEGER NOT NULL DEFAULT 0,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    session_id  TEXT,
    source_ids  TEXT NOT NULL DEFAULT '[]',
    metadata    TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_summaries_tier ON summaries(tier);
CREATE INDEX IF NOT EXISTS idx_summaries_session ON summaries(session_id);

CREATE TABLE IF NOT EXISTS vectors (
    id              TEXT PRIMARY KEY,
    source_id       TEXT NOT NULL,
    source_type     TEXT NOT NULL DEFAULT 'raw',
    content_preview TEXT NOT NULL DEFAULT '',
    embedding       BLOB NOT NULL,
    dimensions      INTEGER NOT NULL DEFAULT 384,
    metadata        TEXT NOT NULL DEFAULT '{}',
    created_at      TEXT NOT NULL,
    confidence      REAL NOT NULL DEFAULT 1.0
);
CREATE INDEX IF NOT EXISTS idx_vectors_source ON vectors(source_id);
CREATE INDEX IF NOT EXISTS idx_vectors_type ON vectors(source_type);

CREATE TABLE IF NOT EXISTS access_log (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    memory_id   TEXT NOT NULL,
    memory_type TEXT NOT NULL,
    accessed_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_access_log_memory ON access_log(memory_id);

CREATE TABLE IF NOT EXISTS sessions (
    id         TEXT PRIMARY KEY,
    started_at TEXT NOT NULL,
    ended_at   TEXT,
    metadata   TEXT NOT NULL DEFAULT '{}'
);
"#;

/// Format a timestamp the way every column stores it: ISO-8601 UTC with
/// millisecond precision.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored timestamp, tolerating malformed values.
pub fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Entity node row.
#[derive(Debug, Clone)]
pub struct EntityRow {
    pub id: String,
    pub label: String,
    pub entity_type: String,
    pub properties: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub confidence: f32,
    pub source_summary_id: Option<String>,
}

/// Relation edge row. Active when `temporal_end` is absent.
#[derive(Debug, Clone)]
pub struct RelationRow {
    pub id: String,
    pub subject_id: String,
    pub predicate: String,
    pub object_id: String,
    pub properties: serde_json::Value,
    pub temporal_start: Option<DateTime<Utc>>,
    pub temporal_end: Option<DateTime<Utc>>,
    pub confidence: f32,
    pub source_summary_id: Option<String>,
}

/// Tiered summary row. The tier is immutable after insert.
#[derive(Debug, Clone)]
pub struct SummaryRow {
    pub id: String,
    pub tier: u8,
    pub content: String,
    pub token_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub session_id: Option<String>,
    pub source_ids: Vec<String>,
    pub metadata: serde_json::Value,
}

/// Vector record row. The embedding blob is `4 × dimensions` bytes,
/// float32 little-endian in index order.
#[derive(Debug, Clone)]
pub struct VectorRow {
    pub id: String,
    pub source_id: String,
    pub source_type: String,
    pub content_preview: String,
    pub embedding: Vec<u8>,
    pub dimensions: usize,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub confidence: f32,
}

/// Session row.
#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
}

/// Per-tier aggregate used by `memory_status`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TierAggregate {
    pub count: usize,
    pub token_sum: usize,
}

struct StoreInner {
    conn: Mutex<Connection>,
    file_path: PathBuf,
    generation: AtomicU64,
    dirty: AtomicBool,
}

impl StoreInner {
    /// Serialize the in-memory database to the durable file.
    fn flush(&self) -> Result<()> {
        let conn = self.conn.lock();
        let mut disk = Connection::open(&self.file_path)
            .with_context(|| format!("open durable file {:?}", self.file_path))?;
        let backup = Backup::new(&*conn, &mut disk).context("begin backup")?;
        backup
            .run_to_completion(BACKUP_PAGES_PER_STEP, Duration::from_millis(0), None)
            .context("backup to durable file")?;
        drop(backup);
        self.dirty.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Handle to the durable store. Cheap to clone; all clones share one
/// in-memory database and one flush schedule.
#[derive(Clone)]
pub struct DurableStore {
    inner: Arc<StoreInner>,
}

impl DurableStore {
    /// Open (or create) the store under `data_dir`.
    ///
    /// Loads the durable file if present, applies the schema, flushes once.
    /// Failure here is fatal for the engine.
    pub fn open(data_dir: &Path, file_name: &str) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("create data directory {data_dir:?}"))?;
        let file_path = data_dir.join(file_name);

        let mut conn = Connection::open_in_memory().context("open in-memory database")?;
        if file_path.exists() {
            let disk = Connection::open(&file_path)
                .with_context(|| format!("open durable file {file_path:?}"))?;
            let backup = Backup::new(&disk, &mut conn).context("begin restore")?;
            backup
                .run_to_completion(BACKUP_PAGES_PER_STEP, Duration::from_millis(0), None)
                .context("restore durable file")?;
        }

        Self::migrate(&conn)?;

        let store = Self {
            inner: Arc::new(StoreInner {
                conn: Mutex::new(conn),
                file_path,
                generation: AtomicU64::new(0),
                dirty: AtomicBool::new(true),
            }),
        };

        if let Err(e) = store.inner.flush() {
            tracing::warn!("Initial flush failed: {e:#}");
        }

        Ok(store)
    }

    /// Apply the idempotent DDL and record the schema version.
    fn migrate(conn: &Connection) -> Result<()> {
        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .context("read user_version")?;
        conn.execute_batch(SCHEMA_DDL).context("apply schema DDL")?;
        if version < SCHEMA_VERSION {
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)
                .context("set user_version")?;
            tracing::info!("Schema migrated {version} -> {SCHEMA_VERSION}");
        }
        Ok(())
    }

    /// Record a mutation: mark dirty and (re)arm the debounced flush.
    fn touch(&self) {
        self.inner.dirty.store(true, Ordering::SeqCst);
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

        // Without a runtime (plain unit tests) the store stays dirty until an
        // explicit flush or close.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let inner = Arc::clone(&self.inner);
            handle.spawn(async move {
                tokio::time::sleep(FLUSH_DEBOUNCE).await;
                if inner.generation.load(Ordering::SeqCst) == generation
                    && inner.dirty.load(Ordering::SeqCst)
                {
                    if let Err(e) = inner.flush() {
                        tracing::warn!("Debounced flush failed: {e:#}");
                    }
                }
            });
        }
    }

    /// Synchronous flush for callers requiring immediate durability.
    pub fn flush_now(&self) -> Result<()> {
        self.inner.flush()
    }

    /// Flush synchronously and drop the schedule. The handle stays usable
    /// but callers should treat the store as closed.
    pub fn close(&self) {
        // Bumping the generation invalidates any pending debounce task.
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self.inner.flush() {
            tracing::warn!("Flush on close failed: {e:#}");
        }
    }

    /// True when in-memory state is ahead of the durable file.
    pub fn is_dirty(&self) -> bool {
        self.inner.dirty.load(Ordering::SeqCst)
    }

    pub fn file_path(&self) -> &Path {
        &self.inner.file_path
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self.inner.conn.lock();
        f(&conn).map_err(Into::into)
    }

    // ========================================================================
    // entities
    // ========================================================================

    pub fn upsert_entity(&self, entity: &EntityRow) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO entities
                 (id, label, entity_type, properties, created_at, updated_at, confidence, source_summary_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    entity.id,
                    entity.label,
                    entity.entity_type,
                    entity.properties.to_string(),
                    format_ts(&entity.created_at),
                    format_ts(&entity.updated_at),
                    entity.confidence as f64,
                    entity.source_summary_id,
                ],
            )
            .map(|_| ())
        })?;
        self.touch();
        Ok(())
    }

    pub fn entity_by_id(&self, id: &str) -> Result<Option<EntityRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM entities WHERE id = ?1",
                [id],
                Self::entity_from_row,
            )
            .optional()
        })
    }

    /// Case-insensitive exact label lookup.
    pub fn entity_by_label_ci(&self, label: &str) -> Result<Option<EntityRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM entities WHERE LOWER(label) = LOWER(?1)
                 ORDER BY confidence DESC LIMIT 1",
                [label],
                Self::entity_from_row,
            )
            .optional()
        })
    }

    /// Case-insensitive substring fallback, best-confidence first.
    pub fn entity_by_label_like(&self, fragment: &str) -> Result<Option<EntityRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM entities WHERE LOWER(label) LIKE '%' || LOWER(?1) || '%'
                 ORDER BY confidence DESC LIMIT 1",
                [fragment],
                Self::entity_from_row,
            )
            .optional()
        })
    }

    pub fn update_entity_confidence(&self, id: &str, confidence: f32, at: &DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE entities SET confidence = ?2, updated_at = ?3 WHERE id = ?1",
                rusqlite::params![id, confidence as f64, format_ts(at)],
            )
            .map(|_| ())
        })?;
        self.touch();
        Ok(())
    }

    pub fn delete_entity(&self, id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM entities WHERE id = ?1", [id]).map(|_| ())
        })?;
        self.touch();
        Ok(())
    }

    pub fn entity_count(&self) -> Result<usize> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM entities", [], |row| row.get::<_, i64>(0))
        })
        .map(|n| n as usize)
    }

    fn entity_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntityRow> {
        Ok(EntityRow {
            id: row.get("id")?,
            label: row.get("label")?,
            entity_type: row.get("entity_type")?,
            properties: serde_json::from_str(&row.get::<_, String>("properties")?)
                .unwrap_or_else(|_| serde_json::json!({})),
            created_at: parse_ts(&row.get::<_, String>("created_at")?),
            updated_at: parse_ts(&row.get::<_, String>("updated_at")?),
            confidence: row.get::<_, f64>("confidence")? as f32,
            source_summary_id: row.get("source_summary_id")?,
        })
    }

    // ========================================================================
    // relations
    // ========================================================================

    pub fn upsert_relation(&self, relation: &RelationRow) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO relations
                 (id, subject_id, predicate, object_id, properties,
                  temporal_start, temporal_end, confidence, source_summary_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    relation.id,
                    relation.subject_id,
                    relation.predicate,
                    relation.object_id,
                    relation.properties.to_string(),
                    relation.temporal_start.as_ref().map(format_ts),
                    relation.temporal_end.as_ref().map(format_ts),
                    relation.confidence as f64,
                    relation.source_summary_id,
                ],
            )
            .map(|_| ())
        })?;
        self.touch();
        Ok(())
    }

    pub fn relation_by_id(&self, id: &str) -> Result<Option<RelationRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM relations WHERE id = ?1",
                [id],
                Self::relation_from_row,
            )
            .optional()
        })
    }

    /// The at-most-one active relation for a `(subject, predicate)` pair.
    pub fn active_relation(&self, subject_id: &str, predicate: &str) -> Result<Option<RelationRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM relations
                 WHERE subject_id = ?1 AND predicate = ?2 AND temporal_end IS NULL
                 LIMIT 1",
                [subject_id, predicate],
                Self::relation_from_row,
            )
            .optional()
        })
    }

    /// Mark a relation ended and set its confidence.
    pub fn end_relation(&self, id: &str, at: &DateTime<Utc>, confidence: f32) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE relations SET temporal_end = ?2, confidence = ?3 WHERE id = ?1",
                rusqlite::params![id, format_ts(at), confidence as f64],
            )
            .map(|_| ())
        })?;
        self.touch();
        Ok(())
    }

    pub fn update_relation_confidence(
        &self,
        id: &str,
        confidence: f32,
        source_summary_id: Option<&str>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE relations SET confidence = ?2,
                        source_summary_id = COALESCE(?3, source_summary_id)
                 WHERE id = ?1",
                rusqlite::params![id, confidence as f64, source_summary_id],
            )
            .map(|_| ())
        })?;
        self.touch();
        Ok(())
    }

    pub fn outgoing_active(&self, entity_id: &str) -> Result<Vec<RelationRow>> {
        self.collect_relations(
            "SELECT * FROM relations WHERE subject_id = ?1 AND temporal_end IS NULL",
            entity_id,
        )
    }

    pub fn incoming_active(&self, entity_id: &str) -> Result<Vec<RelationRow>> {
        self.collect_relations(
            "SELECT * FROM relations WHERE object_id = ?1 AND temporal_end IS NULL",
            entity_id,
        )
    }

    /// Active relations with a case-insensitively equal predicate.
    pub fn relations_by_predicate_ci(&self, predicate: &str) -> Result<Vec<RelationRow>> {
        self.collect_relations(
            "SELECT * FROM relations
             WHERE LOWER(predicate) = LOWER(?1) AND temporal_end IS NULL",
            predicate,
        )
    }

    /// Delete every relation the entity participates in, active or not.
    pub fn delete_relations_for_entity(&self, entity_id: &str) -> Result<usize> {
        let deleted = self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM relations WHERE subject_id = ?1 OR object_id = ?1",
                [entity_id],
            )
        })?;
        self.touch();
        Ok(deleted)
    }

    pub fn active_relation_count(&self) -> Result<usize> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM relations WHERE temporal_end IS NULL",
                [],
                |row| row.get::<_, i64>(0),
            )
        })
        .map(|n| n as usize)
    }

    fn collect_relations(&self, sql: &str, param: &str) -> Result<Vec<RelationRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map([param], Self::relation_from_row)?;
            rows.collect()
        })
    }

    fn relation_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RelationRow> {
        Ok(RelationRow {
            id: row.get("id")?,
            subject_id: row.get("subject_id")?,
            predicate: row.get("predicate")?,
            object_id: row.get("object_id")?,
            properties: serde_json::from_str(&row.get::<_, String>("properties")?)
                .unwrap_or_else(|_| serde_json::json!({})),
            temporal_start: row
                .get::<_, Option<String>>("temporal_start")?
                .map(|raw| parse_ts(&raw)),
            temporal_end: row
                .get::<_, Option<String>>("temporal_end")?
                .map(|raw| parse_ts(&raw)),
            confidence: row.get::<_, f64>("confidence")? as f32,
            source_summary_id: row.get("source_summary_id")?,
        })
    }

    // ========================================================================
    // summaries
    // ========================================================================

    pub fn insert_summary(&self, summary: &SummaryRow) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO summaries
                 (id, tier, content, token_count, created_at, updated_at, session_id, source_ids, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    summary.id,
                    summary.tier as i64,
                    summary.content,
                    summary.token_count as i64,
                    format_ts(&summary.created_at),
                    format_ts(&summary.updated_at),
                    summary.session_id,
                    serde_json::to_string(&summary.source_ids).unwrap_or_else(|_| "[]".into()),
                    summary.metadata.to_string(),
                ],
            )
            .map(|_| ())
        })?;
        self.touch();
        Ok(())
    }

    pub fn summary_by_id(&self, id: &str) -> Result<Option<SummaryRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM summaries WHERE id = ?1",
                [id],
                Self::summary_from_row,
            )
            .optional()
        })
    }

    /// Content and token count update together; the tier never changes.
    pub fn update_summary_content(
        &self,
        id: &str,
        content: &str,
        token_count: usize,
        at: &DateTime<Utc>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE summaries SET content = ?2, token_count = ?3, updated_at = ?4 WHERE id = ?1",
                rusqlite::params![id, content, token_count as i64, format_ts(at)],
            )
            .map(|_| ())
        })?;
        self.touch();
        Ok(())
    }

    pub fn delete_summary(&self, id: &str) -> Result<bool> {
        let deleted =
            self.with_conn(|conn| conn.execute("DELETE FROM summaries WHERE id = ?1", [id]))?;
        self.touch();
        Ok(deleted > 0)
    }

    /// Newest-first summaries at a tier.
    pub fn summaries_at_tier(&self, tier: u8, limit: Option<usize>) -> Result<Vec<SummaryRow>> {
        let sql = match limit {
            Some(n) => format!(
                "SELECT * FROM summaries WHERE tier = ?1 ORDER BY created_at DESC LIMIT {n}"
            ),
            None => "SELECT * FROM summaries WHERE tier = ?1 ORDER BY created_at DESC".to_string(),
        };
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([tier as i64], Self::summary_from_row)?;
            rows.collect()
        })
    }

    /// Newest-first summaries at a tier tagged with a session.
    pub fn summaries_for_session(
        &self,
        tier: u8,
        session_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<SummaryRow>> {
        let sql = match limit {
            Some(n) => format!(
                "SELECT * FROM summaries WHERE tier = ?1 AND session_id = ?2
                 ORDER BY created_at DESC LIMIT {n}"
            ),
            None => "SELECT * FROM summaries WHERE tier = ?1 AND session_id = ?2
                     ORDER BY created_at DESC"
                .to_string(),
        };
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows =
                stmt.query_map(rusqlite::params![tier as i64, session_id], Self::summary_from_row)?;
            rows.collect()
        })
    }

    /// Newest-first summaries at a tier NOT tagged with the given session
    /// (untagged rows included).
    pub fn summaries_excluding_session(
        &self,
        tier: u8,
        session_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<SummaryRow>> {
        let sql = match limit {
            Some(n) => format!(
                "SELECT * FROM summaries
                 WHERE tier = ?1 AND (session_id IS NULL OR session_id != ?2)
                 ORDER BY created_at DESC LIMIT {n}"
            ),
            None => "SELECT * FROM summaries
                     WHERE tier = ?1 AND (session_id IS NULL OR session_id != ?2)
                     ORDER BY created_at DESC"
                .to_string(),
        };
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows =
                stmt.query_map(rusqlite::params![tier as i64, session_id], Self::summary_from_row)?;
            rows.collect()
        })
    }

    /// `GROUP BY tier` counts and token sums.
    pub fn tier_aggregates(&self) -> Result<HashMap<u8, TierAggregate>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT tier, COUNT(*), COALESCE(SUM(token_count), 0)
                 FROM summaries GROUP BY tier",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)? as u8,
                    TierAggregate {
                        count: row.get::<_, i64>(1)? as usize,
                        token_sum: row.get::<_, i64>(2)? as usize,
                    },
                ))
            })?;
            rows.collect()
        })
    }

    fn summary_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SummaryRow> {
        Ok(SummaryRow {
            id: row.get("id")?,
            tier: row.get::<_, i64>("tier")? as u8,
            content: row.get("content")?,
            token_count: row.get::<_, i64>("token_count")? as usize,
            created_at: parse_ts(&row.get::<_, String>("created_at")?),
            updated_at: parse_ts(&row.get::<_, String>("updated_at")?),
            session_id: row.get("session_id")?,
            source_ids: serde_json::from_str(&row.get::<_, String>("source_ids")?)
                .unwrap_or_default(),
            metadata: serde_json::from_str(&row.get::<_, String>("metadata")?)
                .unwrap_or_else(|_| serde_json::json!({})),
        })
    }

    // ========================================================================
    // vectors
    // ========================================================================

    pub fn insert_vector(&self, vector: &VectorRow) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO vectors
                 (id, source_id, source_type, content_preview, embedding,
                  dimensions, metadata, created_at, confidence)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    vector.id,
                    vector.source_id,
                    vector.source_type,
                    vector.content_preview,
                    vector.embedding,
                    vector.dimensions as i64,
                    vector.metadata.to_string(),
                    format_ts(&vector.created_at),
                    vector.confidence as f64,
                ],
            )
            .map(|_| ())
        })?;
        self.touch();
        Ok(())
    }

    pub fn delete_vector(&self, id: &str) -> Result<bool> {
        let deleted =
            self.with_conn(|conn| conn.execute("DELETE FROM vectors WHERE id = ?1", [id]))?;
        self.touch();
        Ok(deleted > 0)
    }

    pub fn delete_vectors_by_source(&self, source_id: &str) -> Result<usize> {
        let deleted = self.with_conn(|conn| {
            conn.execute("DELETE FROM vectors WHERE source_id = ?1", [source_id])
        })?;
        self.touch();
        Ok(deleted)
    }

    /// Every vector row in insertion order.
    pub fn all_vectors(&self) -> Result<Vec<VectorRow>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT * FROM vectors ORDER BY created_at ASC, id ASC")?;
            let rows = stmt.query_map([], Self::vector_from_row)?;
            rows.collect()
        })
    }

    pub fn vectors_by_source(&self, source_id: &str) -> Result<Vec<VectorRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM vectors WHERE source_id = ?1")?;
            let rows = stmt.query_map([source_id], Self::vector_from_row)?;
            rows.collect()
        })
    }

    pub fn vector_count(&self) -> Result<usize> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM vectors", [], |row| row.get::<_, i64>(0))
        })
        .map(|n| n as usize)
    }

    fn vector_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<VectorRow> {
        Ok(VectorRow {
            id: row.get("id")?,
            source_id: row.get("source_id")?,
            source_type: row.get("source_type")?,
            content_preview: row.get("content_preview")?,
            embedding: row.get("embedding")?,
            dimensions: row.get::<_, i64>("dimensions")? as usize,
            metadata: serde_json::from_str(&row.get::<_, String>("metadata")?)
                .unwrap_or_else(|_| serde_json::json!({})),
            created_at: parse_ts(&row.get::<_, String>("created_at")?),
            confidence: row.get::<_, f64>("confidence")? as f32,
        })
    }

    // ========================================================================
    // access log
    // ========================================================================

    pub fn log_access(&self, memory_id: &str, memory_type: &str, at: &DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO access_log (memory_id, memory_type, accessed_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![memory_id, memory_type, format_ts(at)],
            )
            .map(|_| ())
        })?;
        self.touch();
        Ok(())
    }

    pub fn access_count(&self, memory_id: &str) -> Result<usize> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM access_log WHERE memory_id = ?1",
                [memory_id],
                |row| row.get::<_, i64>(0),
            )
        })
        .map(|n| n as usize)
    }

    // ========================================================================
    // sessions
    // ========================================================================

    pub fn insert_session(&self, session: &SessionRow) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO sessions (id, started_at, ended_at, metadata)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    session.id,
                    format_ts(&session.started_at),
                    session.ended_at.as_ref().map(format_ts),
                    session.metadata.to_string(),
                ],
            )
            .map(|_| ())
        })?;
        self.touch();
        Ok(())
    }

    pub fn end_session(&self, id: &str, at: &DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions SET ended_at = ?2 WHERE id = ?1",
                rusqlite::params![id, format_ts(at)],
            )
            .map(|_| ())
        })?;
        self.touch();
        Ok(())
    }

    pub fn session_by_id(&self, id: &str) -> Result<Option<SessionRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM sessions WHERE id = ?1",
                [id],
                |row| {
                    Ok(SessionRow {
                        id: row.get("id")?,
                        started_at: parse_ts(&row.get::<_, String>("started_at")?),
                        ended_at: row
                            .get::<_, Option<String>>("ended_at")?
                            .map(|raw| parse_ts(&raw)),
                        metadata: serde_json::from_str(&row.get::<_, String>("metadata")?)
                            .unwrap_or_else(|_| serde_json::json!({})),
                    })
                },
            )
            .optional()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store() -> (DurableStore, TempDir) {
        let dir = TempDir::new().expect("temp dir");
        let store = DurableStore::open(dir.path(), "memory.db").expect("open store");
        (store, dir)
    }

    fn entity(label: &str, confidence: f32) -> EntityRow {
        let now = Utc::now();
        EntityRow {
            id: uuid::Uuid::new_v4().to_string(),
            label: label.to_string(),
            entity_type: "unknown".to_string(),
            properties: serde_json::json!({}),
            created_at: now,
            updated_at: now,
            confidence,
            source_summary_id: None,
        }
    }

    #[test]
    fn open_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let first = DurableStore::open(dir.path(), "memory.db").unwrap();
        first.close();
        drop(first);
        // Reopening applies the DDL against the restored file without error.
        let second = DurableStore::open(dir.path(), "memory.db").unwrap();
        assert_eq!(second.entity_count().unwrap(), 0);
    }

    #[test]
    fn entity_round_trip_and_ci_lookup() {
        let (store, _dir) = open_store();
        let row = entity("Paris", 0.9);
        store.upsert_entity(&row).unwrap();

        let by_id = store.entity_by_id(&row.id).unwrap().unwrap();
        assert_eq!(by_id.label, "Paris");
        assert!((by_id.confidence - 0.9).abs() < 1e-6);

        assert!(store.entity_by_label_ci("paris").unwrap().is_some());
        assert!(store.entity_by_label_ci("PARIS").unwrap().is_some());
        assert!(store.entity_by_label_ci("London").unwrap().is_none());
        assert!(store.entity_by_label_like("ari").unwrap().is_some());
    }

    #[test]
    fn flush_and_reload_preserves_rows() {
        let dir = TempDir::new().unwrap();
        {
            let store = DurableStore::open(dir.path(), "memory.db").unwrap();
            store.upsert_entity(&entity("Durable", 1.0)).unwrap();
            store.flush_now().unwrap();
            assert!(!store.is_dirty());
        }
        let reopened = DurableStore::open(dir.path(), "memory.db").unwrap();
        assert_eq!(reopened.entity_count().unwrap(), 1);
        assert!(reopened.entity_by_label_ci("durable").unwrap().is_some());
    }

    #[test]
    fn summary_tier_is_preserved_on_content_update() {
        let (store, _dir) = open_store();
        let now = Utc::now();
        let summary = SummaryRow {
            id: "s-1".to_string(),
            tier: 2,
            content: "original".to_string(),
            token_count: 1,
            created_at: now,
            updated_at: now,
            session_id: None,
            source_ids: vec![],
            metadata: serde_json::json!({}),
        };
        store.insert_summary(&summary).unwrap();
        store
            .update_summary_content("s-1", "corrected text", 3, &Utc::now())
            .unwrap();

        let reread = store.summary_by_id("s-1").unwrap().unwrap();
        assert_eq!(reread.tier, 2);
        assert_eq!(reread.content, "corrected text");
        assert_eq!(reread.token_count, 3);
    }

    #[test]
    fn tier_aggregates_group_counts_and_tokens() {
        let (store, _dir) = open_store();
        let now = Utc::now();
        for (tier, tokens) in [(1u8, 10usize), (1, 20), (2, 5)] {
            store
                .insert_summary(&SummaryRow {
                    id: uuid::Uuid::new_v4().to_string(),
                    tier,
                    content: "x".to_string(),
                    token_count: tokens,
                    created_at: now,
                    updated_at: now,
                    session_id: None,
                    source_ids: vec![],
                    metadata: serde_json::json!({}),
                })
                .unwrap();
        }

        let aggregates = store.tier_aggregates().unwrap();
        assert_eq!(aggregates[&1].count, 2);
        assert_eq!(aggregates[&1].token_sum, 30);
        assert_eq!(aggregates[&2].count, 1);
        assert_eq!(aggregates[&2].token_sum, 5);
    }

    #[test]
    fn vector_blob_round_trip() {
        let (store, _dir) = open_store();
        let values: Vec<f32> = vec![-1.0, -0.25, 0.0, 0.5, 1.0];
        let blob: Vec<u8> = values.iter().flat_map(|f| f.to_le_bytes()).collect();
        let now = Utc::now();
        store
            .insert_vector(&VectorRow {
                id: "v-1".to_string(),
                source_id: "m-1".to_string(),
                source_type: "fact".to_string(),
                content_preview: "preview".to_string(),
                embedding: blob.clone(),
                dimensions: values.len(),
                metadata: serde_json::json!({}),
                created_at: now,
                confidence: 1.0,
            })
            .unwrap();

        let rows = store.all_vectors().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].embedding, blob);

        let decoded: Vec<f32> = rows[0]
            .embedding
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        assert_eq!(decoded, values);
    }

    #[test]
    fn delete_vectors_by_source_removes_all() {
        let (store, _dir) = open_store();
        let now = Utc::now();
        for i in 0..3 {
            store
                .insert_vector(&VectorRow {
                    id: format!("v-{i}"),
                    source_id: "m-1".to_string(),
                    source_type: "event".to_string(),
                    content_preview: String::new(),
                    embedding: vec![0u8; 4],
                    dimensions: 1,
                    metadata: serde_json::json!({}),
                    created_at: now,
                    confidence: 1.0,
                })
                .unwrap();
        }
        assert_eq!(store.delete_vectors_by_source("m-1").unwrap(), 3);
        assert_eq!(store.vector_count().unwrap(), 0);
    }

    #[test]
    fn access_log_counts_per_memory() {
        let (store, _dir) = open_store();
        let now = Utc::now();
        for _ in 0..4 {
            store.log_access("m-1", "summary", &now).unwrap();
        }
        store.log_access("m-2", "entity", &now).unwrap();
        assert_eq!(store.access_count("m-1").unwrap(), 4);
        assert_eq!(store.access_count("m-2").unwrap(), 1);
        assert_eq!(store.access_count("m-3").unwrap(), 0);
    }

    #[test]
    fn timestamps_format_with_millis() {
        let ts = format_ts(&Utc::now());
        // e.g. 2026-08-02T12:34:56.789Z
        assert!(ts.ends_with('Z'));
        assert_eq!(ts.matches('.').count(), 1);
        let parsed = parse_ts(&ts);
        assert_eq!(format_ts(&parsed), ts);
    }
}
