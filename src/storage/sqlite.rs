//! SQLite catalog store.
//!
//! Durable registry of tools, capabilities, patterns and embeddings. All
//! access goes through the bounded connection pool; blocking SQLite calls run
//! on the blocking thread pool so no runtime worker waits on disk.

use crate::catalog::model::{compare_versions, pattern_key, Embedding, PatternText, Tool};
use crate::storage::pool::{ConnectionManager, ConnectionPool, PoolStats};
use crate::types::{Error, PoolConfig, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tool_catalog_tools (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    name             TEXT NOT NULL,
    version          TEXT NOT NULL,
    platform         TEXT NOT NULL,
    category         TEXT NOT NULL,
    description      TEXT NOT NULL DEFAULT '',
    execution_method TEXT NOT NULL,
    metadata_json    TEXT NOT NULL,
    definition_json  TEXT NOT NULL,
    fingerprint      TEXT NOT NULL,
    enabled          INTEGER NOT NULL DEFAULT 1,
    is_latest        INTEGER NOT NULL DEFAULT 0,
    created_at       TEXT NOT NULL,
    updated_at       TEXT NOT NULL,
    UNIQUE(name, version)
);

CREATE TABLE IF NOT EXISTS tool_catalog_capabilities (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    tool_id     INTEGER NOT NULL REFERENCES tool_catalog_tools(id) ON DELETE CASCADE,
    name        TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    UNIQUE(tool_id, name)
);

CREATE TABLE IF NOT EXISTS tool_catalog_patterns (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    capability_id    INTEGER NOT NULL REFERENCES tool_catalog_capabilities(id) ON DELETE CASCADE,
    pattern_key      TEXT NOT NULL,
    name             TEXT NOT NULL,
    description      TEXT NOT NULL,
    embedding_text   TEXT NOT NULL,
    content_hash     TEXT NOT NULL,
    use_cases_json   TEXT NOT NULL,
    inputs_json      TEXT NOT NULL,
    outputs_json     TEXT NOT NULL,
    examples_json    TEXT NOT NULL,
    estimates_json   TEXT NOT NULL,
    policy_json      TEXT NOT NULL,
    preferences_json TEXT NOT NULL,
    UNIQUE(capability_id, name)
);

CREATE INDEX IF NOT EXISTS idx_tool_catalog_patterns_key
    ON tool_catalog_patterns(pattern_key);

CREATE TABLE IF NOT EXISTS tool_catalog_embeddings (
    pattern_key  TEXT PRIMARY KEY,
    model        TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    dims         INTEGER NOT NULL,
    vector       BLOB,
    indexed_at   TEXT NOT NULL,
    failures     INTEGER NOT NULL DEFAULT 0,
    stale        INTEGER NOT NULL DEFAULT 0,
    last_error   TEXT
);
"#;

/// Opens SQLite connections with the pragmas the store relies on.
#[derive(Debug, Clone)]
pub struct SqliteManager {
    path: PathBuf,
}

impl SqliteManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConnectionManager for SqliteManager {
    type Connection = Connection;

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(conn)
    }

    fn is_valid(&self, conn: &mut Connection) -> bool {
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)).is_ok()
    }
}

/// Counts from applying one definition set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub unchanged: usize,
}

/// Catalog store over a pooled SQLite database.
#[derive(Debug)]
pub struct CatalogStore {
    pool: ConnectionPool<SqliteManager>,
    queries: AtomicU64,
}

impl CatalogStore {
    /// Open (creating if needed) and migrate.
    pub async fn open(path: impl Into<PathBuf>, pool_config: PoolConfig) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let pool = ConnectionPool::new(SqliteManager::new(&path), pool_config)?;
        let store = Self {
            pool,
            queries: AtomicU64::new(0),
        };
        store
            .with_conn(|conn| {
                conn.execute_batch(SCHEMA)?;
                Ok(())
            })
            .await?;
        tracing::info!(path = %path.display(), "catalog store ready");
        Ok(store)
    }

    /// Run blocking work on a pooled connection.
    pub async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let mut conn = self.pool.checkout().await?;
        self.queries.fetch_add(1, Ordering::Relaxed);
        tokio::task::spawn_blocking(move || f(&mut conn))
            .await
            .map_err(|e| Error::internal(format!("store task failed: {}", e)))?
    }

    pub fn pool(&self) -> &ConnectionPool<SqliteManager> {
        &self.pool
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Number of round trips made to SQLite.
    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    /// Make the stored catalog match `tools` in one transaction.
    ///
    /// Rows not present in `tools` are disabled, never deleted. `is_latest`
    /// is recomputed per name over enabled rows.
    pub async fn apply_definitions(&self, tools: Vec<Tool>) -> Result<ApplyReport> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let report = apply_in_tx(&tx, &tools)?;
            tx.commit()?;
            Ok(report)
        })
        .await
    }

    /// Every stored tool, including disabled and superseded versions.
    pub async fn load_tools(&self) -> Result<Vec<Tool>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name, version, definition_json, enabled, is_latest \
                 FROM tool_catalog_tools ORDER BY name, id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, bool>(3)?,
                    row.get::<_, bool>(4)?,
                ))
            })?;

            let mut tools = Vec::new();
            for row in rows {
                let (name, version, json, enabled, is_latest) = row?;
                let mut tool: Tool = serde_json::from_str(&json)?;
                tool.enabled = enabled;
                tool.is_latest = is_latest;
                tool.compile(&format!("db:{}@{}", name, version))?;
                tools.push(tool);
            }
            Ok(tools)
        })
        .await
    }

    /// Stored vectors that are not flagged stale.
    pub async fn load_embeddings(&self) -> Result<HashMap<String, Embedding>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT pattern_key, model, content_hash, vector, indexed_at \
                 FROM tool_catalog_embeddings WHERE vector IS NOT NULL AND stale = 0",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?;

            let mut out = HashMap::new();
            for row in rows {
                let (key, model, content_hash, blob, indexed_at) = row?;
                let indexed_at = DateTime::parse_from_rfc3339(&indexed_at)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now());
                out.insert(
                    key.clone(),
                    Embedding {
                        pattern_key: key,
                        model,
                        content_hash,
                        vector: decode_vector(&blob),
                        indexed_at,
                    },
                );
            }
            Ok(out)
        })
        .await
    }

    /// Patterns of enabled latest tools whose embedding is missing, failed,
    /// or computed from different text. `all` ignores staleness.
    pub async fn patterns_needing_embedding(
        &self,
        all: bool,
        key_prefix: Option<String>,
    ) -> Result<Vec<PatternText>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT p.pattern_key, p.embedding_text, p.content_hash \
                 FROM tool_catalog_patterns p \
                 JOIN tool_catalog_capabilities c ON c.id = p.capability_id \
                 JOIN tool_catalog_tools t ON t.id = c.tool_id \
                 LEFT JOIN tool_catalog_embeddings e ON e.pattern_key = p.pattern_key \
                 WHERE t.enabled = 1 AND t.is_latest = 1 \
                   AND (?1 OR e.pattern_key IS NULL OR e.vector IS NULL \
                        OR e.content_hash != p.content_hash) \
                   AND (?2 IS NULL OR substr(p.pattern_key, 1, length(?2)) = ?2) \
                 ORDER BY p.pattern_key",
            )?;
            let rows = stmt.query_map(params![all, key_prefix], |row| {
                Ok(PatternText {
                    pattern_key: row.get(0)?,
                    text: row.get(1)?,
                    content_hash: row.get(2)?,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
        })
        .await
    }

    pub async fn save_embedding(&self, embedding: Embedding) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO tool_catalog_embeddings \
                     (pattern_key, model, content_hash, dims, vector, indexed_at, failures, stale, last_error) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 0, NULL) \
                 ON CONFLICT(pattern_key) DO UPDATE SET \
                     model = excluded.model, content_hash = excluded.content_hash, \
                     dims = excluded.dims, vector = excluded.vector, \
                     indexed_at = excluded.indexed_at, failures = 0, stale = 0, last_error = NULL",
                params![
                    embedding.pattern_key,
                    embedding.model,
                    embedding.content_hash,
                    embedding.vector.len() as i64,
                    encode_vector(&embedding.vector),
                    embedding.indexed_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Record a failed embedding attempt; the pattern scores symbolically
    /// until a later backfill succeeds.
    pub async fn mark_embedding_failed(
        &self,
        pattern: PatternText,
        model: String,
        error: String,
    ) -> Result<u32> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO tool_catalog_embeddings \
                     (pattern_key, model, content_hash, dims, vector, indexed_at, failures, stale, last_error) \
                 VALUES (?1, ?2, ?3, 0, NULL, ?4, 1, 1, ?5) \
                 ON CONFLICT(pattern_key) DO UPDATE SET \
                     model = excluded.model, content_hash = excluded.content_hash, \
                     vector = NULL, dims = 0, indexed_at = excluded.indexed_at, \
                     failures = tool_catalog_embeddings.failures + 1, stale = 1, \
                     last_error = excluded.last_error",
                params![
                    pattern.pattern_key,
                    model,
                    pattern.content_hash,
                    Utc::now().to_rfc3339(),
                    error
                ],
            )?;
            let failures: u32 = conn.query_row(
                "SELECT failures FROM tool_catalog_embeddings WHERE pattern_key = ?1",
                [&pattern.pattern_key],
                |row| row.get(0),
            )?;
            Ok(failures)
        })
        .await
    }

    /// Keys currently flagged stale.
    pub async fn stale_embeddings(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT pattern_key FROM tool_catalog_embeddings WHERE stale = 1 ORDER BY pattern_key",
            )?;
            let keys = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(keys)
        })
        .await
    }
}

fn apply_in_tx(tx: &Transaction<'_>, tools: &[Tool]) -> Result<ApplyReport> {
    let mut existing: HashMap<(String, String), (i64, String, bool)> = HashMap::new();
    {
        let mut stmt =
            tx.prepare("SELECT id, name, version, fingerprint, enabled FROM tool_catalog_tools")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, bool>(4)?,
            ))
        })?;
        for row in rows {
            let (id, name, version, fingerprint, enabled) = row?;
            existing.insert((name, version), (id, fingerprint, enabled));
        }
    }

    let now = Utc::now().to_rfc3339();
    let mut report = ApplyReport::default();
    let mut seen: HashSet<(String, String)> = HashSet::new();

    for tool in tools {
        let key = (tool.name.clone(), tool.version.clone());
        if !seen.insert(key.clone()) {
            return Err(Error::definition(
                format!("{}@{}", tool.name, tool.version),
                "version",
                "duplicate (name, version) in definition set",
            ));
        }
        let fingerprint = tool.fingerprint();
        let definition_json = serde_json::to_string(tool)?;
        let metadata_json = serde_json::to_string(&tool.metadata)?;

        match existing.get(&key) {
            None => {
                tx.execute(
                    "INSERT INTO tool_catalog_tools \
                         (name, version, platform, category, description, execution_method, \
                          metadata_json, definition_json, fingerprint, enabled, is_latest, \
                          created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, ?11, ?11)",
                    params![
                        tool.name,
                        tool.version,
                        tool.platform,
                        tool.category,
                        tool.description,
                        tool.execution_method.as_str(),
                        metadata_json,
                        definition_json,
                        fingerprint,
                        tool.enabled,
                        now
                    ],
                )?;
                write_children(tx, tx.last_insert_rowid(), tool)?;
                report.added += 1;
            }
            Some((id, old_fingerprint, was_enabled)) => {
                if *old_fingerprint == fingerprint && *was_enabled == tool.enabled {
                    report.unchanged += 1;
                    continue;
                }
                tx.execute(
                    "UPDATE tool_catalog_tools SET platform = ?2, category = ?3, description = ?4, \
                         execution_method = ?5, metadata_json = ?6, definition_json = ?7, \
                         fingerprint = ?8, enabled = ?9, updated_at = ?10 \
                     WHERE id = ?1",
                    params![
                        id,
                        tool.platform,
                        tool.category,
                        tool.description,
                        tool.execution_method.as_str(),
                        metadata_json,
                        definition_json,
                        fingerprint,
                        tool.enabled,
                        now
                    ],
                )?;
                tx.execute(
                    "DELETE FROM tool_catalog_capabilities WHERE tool_id = ?1",
                    [id],
                )?;
                write_children(tx, *id, tool)?;
                if !was_enabled && tool.enabled {
                    report.added += 1;
                } else {
                    report.updated += 1;
                }
            }
        }
    }

    for (key, (id, _, enabled)) in &existing {
        if *enabled && !seen.contains(key) {
            tx.execute(
                "UPDATE tool_catalog_tools SET enabled = 0, updated_at = ?2 WHERE id = ?1",
                params![id, now],
            )?;
            report.removed += 1;
        }
    }

    recompute_latest(tx)?;
    Ok(report)
}

fn write_children(tx: &Transaction<'_>, tool_id: i64, tool: &Tool) -> Result<()> {
    for cap in &tool.capabilities {
        tx.execute(
            "INSERT INTO tool_catalog_capabilities (tool_id, name, description) VALUES (?1, ?2, ?3)",
            params![tool_id, cap.name, cap.description],
        )?;
        let cap_id = tx.last_insert_rowid();
        for pattern in &cap.patterns {
            let text = pattern.embedding_text(&tool.name, &cap.name);
            tx.execute(
                "INSERT INTO tool_catalog_patterns \
                     (capability_id, pattern_key, name, description, embedding_text, content_hash, \
                      use_cases_json, inputs_json, outputs_json, examples_json, estimates_json, \
                      policy_json, preferences_json) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    cap_id,
                    pattern_key(&tool.name, &cap.name, &pattern.name),
                    pattern.name,
                    pattern.description,
                    text,
                    crate::catalog::model::content_hash(&text),
                    serde_json::to_string(&pattern.typical_use_cases)?,
                    serde_json::to_string(&pattern.required_inputs)?,
                    serde_json::to_string(&pattern.expected_outputs)?,
                    serde_json::to_string(&pattern.examples)?,
                    serde_json::to_string(&pattern.estimates)?,
                    serde_json::to_string(&pattern.policy)?,
                    serde_json::to_string(&pattern.preferences)?,
                ],
            )?;
        }
    }
    Ok(())
}

fn recompute_latest(tx: &Transaction<'_>) -> Result<()> {
    tx.execute("UPDATE tool_catalog_tools SET is_latest = 0", [])?;

    let mut best: HashMap<String, (i64, String)> = HashMap::new();
    {
        let mut stmt =
            tx.prepare("SELECT id, name, version FROM tool_catalog_tools WHERE enabled = 1")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        for row in rows {
            let (id, name, version) = row?;
            let replace = best
                .get(&name)
                .map_or(true, |(_, v)| compare_versions(&version, v).is_gt());
            if replace {
                best.insert(name, (id, version));
            }
        }
    }

    for (id, _) in best.values() {
        tx.execute(
            "UPDATE tool_catalog_tools SET is_latest = 1 WHERE id = ?1",
            [id],
        )?;
    }
    Ok(())
}

/// Look up one tool row's enabled/latest flags (used by admin views and tests).
pub fn tool_flags(conn: &Connection, name: &str, version: &str) -> Result<Option<(bool, bool)>> {
    conn.query_row(
        "SELECT enabled, is_latest FROM tool_catalog_tools WHERE name = ?1 AND version = ?2",
        params![name, version],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .optional()
    .map_err(Error::from)
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::model::tests::sample_tool;

    async fn temp_store() -> (tempfile::TempDir, CatalogStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CatalogStore::open(dir.path().join("catalog.db"), PoolConfig::default())
            .await
            .unwrap();
        (dir, store)
    }

    fn versioned(version: &str) -> Tool {
        let mut tool = sample_tool();
        tool.version = version.to_string();
        tool
    }

    #[tokio::test]
    async fn test_apply_counts_added_updated_removed() {
        let (_dir, store) = temp_store().await;

        let report = store.apply_definitions(vec![sample_tool()]).await.unwrap();
        assert_eq!(report.added, 1);

        let report = store.apply_definitions(vec![sample_tool()]).await.unwrap();
        assert_eq!(report.unchanged, 1);
        assert_eq!(report.added + report.updated + report.removed, 0);

        let mut changed = sample_tool();
        changed.description = "Disk usage per mount".to_string();
        let report = store.apply_definitions(vec![changed]).await.unwrap();
        assert_eq!(report.updated, 1);

        let report = store.apply_definitions(vec![]).await.unwrap();
        assert_eq!(report.removed, 1);
    }

    #[tokio::test]
    async fn test_removed_tools_are_disabled_not_deleted() {
        let (_dir, store) = temp_store().await;
        store.apply_definitions(vec![sample_tool()]).await.unwrap();
        store.apply_definitions(vec![]).await.unwrap();

        let tools = store.load_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert!(!tools[0].enabled);
        assert!(!tools[0].is_latest);
    }

    #[tokio::test]
    async fn test_latest_flag_follows_highest_enabled_version() {
        let (_dir, store) = temp_store().await;
        store
            .apply_definitions(vec![versioned("1.2.0"), versioned("1.10.0")])
            .await
            .unwrap();

        let flags = store
            .with_conn(|c| {
                Ok((
                    tool_flags(c, "disk_usage", "1.2.0")?,
                    tool_flags(c, "disk_usage", "1.10.0")?,
                ))
            })
            .await
            .unwrap();
        assert_eq!(flags, (Some((true, false)), Some((true, true))));

        // Dropping the newest promotes the older one.
        store.apply_definitions(vec![versioned("1.2.0")]).await.unwrap();
        let flags = store
            .with_conn(|c| tool_flags(c, "disk_usage", "1.2.0"))
            .await
            .unwrap();
        assert_eq!(flags, Some((true, true)));
    }

    #[tokio::test]
    async fn test_duplicate_versions_abort_apply() {
        let (_dir, store) = temp_store().await;
        let err = store
            .apply_definitions(vec![sample_tool(), sample_tool()])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "validation_error");
        assert!(store.load_tools().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_embedding_staleness_tracks_content_hash() {
        let (_dir, store) = temp_store().await;
        store.apply_definitions(vec![sample_tool()]).await.unwrap();

        let pending = store.patterns_needing_embedding(false, None).await.unwrap();
        assert_eq!(pending.len(), 1);
        let pattern = pending[0].clone();

        store
            .save_embedding(Embedding {
                pattern_key: pattern.pattern_key.clone(),
                model: "test".to_string(),
                content_hash: pattern.content_hash.clone(),
                vector: vec![0.5, -0.25],
                indexed_at: Utc::now(),
            })
            .await
            .unwrap();
        assert!(store.patterns_needing_embedding(false, None).await.unwrap().is_empty());
        assert_eq!(store.patterns_needing_embedding(true, None).await.unwrap().len(), 1);

        let loaded = store.load_embeddings().await.unwrap();
        assert_eq!(loaded[&pattern.pattern_key].vector, vec![0.5, -0.25]);

        let mut edited = sample_tool();
        edited.capabilities[0].patterns[0].description = "Per-mount capacity".to_string();
        store.apply_definitions(vec![edited]).await.unwrap();
        assert_eq!(store.patterns_needing_embedding(false, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_embedding_flagged_stale() {
        let (_dir, store) = temp_store().await;
        store.apply_definitions(vec![sample_tool()]).await.unwrap();
        let pattern = store.patterns_needing_embedding(false, None).await.unwrap()[0].clone();

        let failures = store
            .mark_embedding_failed(pattern.clone(), "test".into(), "503".into())
            .await
            .unwrap();
        assert_eq!(failures, 1);
        let failures = store
            .mark_embedding_failed(pattern.clone(), "test".into(), "503".into())
            .await
            .unwrap();
        assert_eq!(failures, 2);

        assert_eq!(store.stale_embeddings().await.unwrap(), vec![pattern.pattern_key.clone()]);
        assert!(store.load_embeddings().await.unwrap().is_empty());
        assert_eq!(store.patterns_needing_embedding(false, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_key_prefix_is_literal() {
        let (_dir, store) = temp_store().await;
        let mut lookalike = sample_tool();
        lookalike.name = "diskXusage".to_string();
        store
            .apply_definitions(vec![sample_tool(), lookalike])
            .await
            .unwrap();

        let pending = store
            .patterns_needing_embedding(false, Some("disk_usage/".to_string()))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].pattern_key.starts_with("disk_usage/"));

        let none = store
            .patterns_needing_embedding(true, Some("disk%".to_string()))
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_vector_blob_encoding() {
        let v = vec![1.0f32, -2.5, 0.125];
        assert_eq!(decode_vector(&encode_vector(&v)), v);
    }
}
