//! Persistent cache tier backed by SQLite.
//! One row per fingerprint; rows are replaced wholesale on upsert and purged by
//! last-access age. `cache_metadata` holds the schema version and the time of
//! the last age purge.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use super::cache::{CacheEntry, Fingerprint, PersistentStore, StoreAggregate, StoreError};

/// Bumped whenever the row layout changes; older tables are dropped on open.
const SCHEMA_VERSION: &str = "2";

const ENTRY_COLUMNS: &str = "fingerprint, source_text, context_json, model_identifier,
     translated_text, created_at, last_accessed_at, hit_count";

/// Column values as stored, before decoding the blob key and context JSON.
struct RawRow {
    fingerprint: Vec<u8>,
    source_text: String,
    context_json: String,
    model_identifier: String,
    translated_text: String,
    created_at: i64,
    last_accessed_at: i64,
    hit_count: i64,
}

impl RawRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            fingerprint: row.get(0)?,
            source_text: row.get(1)?,
            context_json: row.get(2)?,
            model_identifier: row.get(3)?,
            translated_text: row.get(4)?,
            created_at: row.get(5)?,
            last_accessed_at: row.get(6)?,
            hit_count: row.get(7)?,
        })
    }

    fn into_entry(self) -> Result<CacheEntry, StoreError> {
        let key: [u8; 32] = self
            .fingerprint
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::Query("corrupt fingerprint".into()))?;
        let context: Vec<String> = serde_json::from_str(&self.context_json)
            .map_err(|e| StoreError::Query(format!("corrupt context_json: {e}")))?;
        Ok(CacheEntry {
            fingerprint: Fingerprint::from_bytes(key),
            source_text: self.source_text,
            context,
            model_identifier: self.model_identifier,
            translated_text: self.translated_text,
            created_at: self.created_at,
            last_accessed_at: self.last_accessed_at,
            hit_count: self.hit_count.max(0) as u64,
        })
    }
}

/// `%` and `_` in user input match literally.
fn like_pattern(keyword: &str) -> String {
    let mut pattern = String::with_capacity(keyword.len() + 2);
    pattern.push('%');
    for c in keyword.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Query(e.to_string())
    }
}

impl SqliteStore {
    /// Open (or create) the cache database. Parent directories are created.
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Open(format!("{}: {e}", parent.display())))?;
        }
        let conn = Connection::open(db_path).map_err(|e| StoreError::Open(e.to_string()))?;
        let store = Self::init(conn)?;
        info!(path = %db_path.display(), "SQLite cache opened");
        Ok(store)
    }

    /// Private in-memory database, mainly for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::Open(e.to_string()))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        // journal_mode answers with a row.
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
            .map_err(|e| StoreError::Open(format!("PRAGMA failed: {e}")))?;
        conn.execute_batch("PRAGMA synchronous=NORMAL;")
            .map_err(|e| StoreError::Open(format!("PRAGMA failed: {e}")))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cache_metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )
        .map_err(|e| StoreError::Open(format!("create metadata failed: {e}")))?;

        let version: Option<String> = conn
            .query_row(
                "SELECT value FROM cache_metadata WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        if version.as_deref() != Some(SCHEMA_VERSION) {
            if let Some(old) = &version {
                warn!(old = %old, new = SCHEMA_VERSION, "cache schema changed, dropping stale rows");
            }
            conn.execute_batch("DROP TABLE IF EXISTS translation_cache;")?;
        }

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS translation_cache (
                fingerprint BLOB PRIMARY KEY,
                source_text TEXT NOT NULL,
                context_json TEXT NOT NULL,
                model_identifier TEXT NOT NULL,
                translated_text TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                last_accessed_at INTEGER NOT NULL,
                hit_count INTEGER NOT NULL DEFAULT 1
            );
            CREATE INDEX IF NOT EXISTS idx_cache_accessed
                ON translation_cache(last_accessed_at);
            CREATE INDEX IF NOT EXISTS idx_cache_model
                ON translation_cache(model_identifier);",
        )
        .map_err(|e| StoreError::Open(format!("create table failed: {e}")))?;

        conn.execute(
            "INSERT OR REPLACE INTO cache_metadata (key, value) VALUES ('schema_version', ?1)",
            params![SCHEMA_VERSION],
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl PersistentStore for SqliteStore {
    fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>, StoreError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM translation_cache WHERE fingerprint = ?1"),
                params![fingerprint.as_bytes().as_slice()],
                RawRow::read,
            )
            .optional()?;
        let Some(row) = row else {
            return Ok(None);
        };
        debug!(fingerprint = ?fingerprint, "SQLite cache hit");
        row.into_entry().map(Some)
    }

    fn upsert(&self, entry: &CacheEntry) -> Result<(), StoreError> {
        let context_json = serde_json::to_string(&entry.context)
            .map_err(|e| StoreError::Query(e.to_string()))?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO translation_cache
             (fingerprint, source_text, context_json, model_identifier, translated_text,
              created_at, last_accessed_at, hit_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.fingerprint.as_bytes().as_slice(),
                entry.source_text,
                context_json,
                entry.model_identifier,
                entry.translated_text,
                entry.created_at,
                entry.last_accessed_at,
                entry.hit_count as i64,
            ],
        )?;
        Ok(())
    }

    fn record_hit(&self, fingerprint: &Fingerprint, accessed_at: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE translation_cache
             SET hit_count = hit_count + 1, last_accessed_at = ?2
             WHERE fingerprint = ?1",
            params![fingerprint.as_bytes().as_slice(), accessed_at],
        )?;
        Ok(())
    }

    fn purge_older_than(&self, cutoff: i64) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM translation_cache WHERE last_accessed_at < ?1",
            params![cutoff],
        )?;
        Ok(removed)
    }

    fn clear_model(&self, model_identifier: &str) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM translation_cache WHERE model_identifier = ?1",
            params![model_identifier],
        )?;
        Ok(removed)
    }

    fn insert_if_absent(&self, entry: &CacheEntry) -> Result<bool, StoreError> {
        let context_json = serde_json::to_string(&entry.context)
            .map_err(|e| StoreError::Query(e.to_string()))?;
        let conn = self.conn.lock();
        let inserted = conn.execute(
            &format!("INSERT OR IGNORE INTO translation_cache ({ENTRY_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
            params![
                entry.fingerprint.as_bytes().as_slice(),
                entry.source_text,
                context_json,
                entry.model_identifier,
                entry.translated_text,
                entry.created_at,
                entry.last_accessed_at,
                entry.hit_count as i64,
            ],
        )?;
        Ok(inserted > 0)
    }

    fn entries(&self) -> Result<Vec<CacheEntry>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM translation_cache ORDER BY created_at, source_text"
        ))?;
        let rows = stmt
            .query_map([], RawRow::read)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawRow::into_entry).collect()
    }

    fn search(
        &self,
        keyword: &str,
        model_identifier: Option<&str>,
        limit: usize,
    ) -> Result<Vec<CacheEntry>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM translation_cache
             WHERE (source_text LIKE ?1 ESCAPE '\\' OR translated_text LIKE ?1 ESCAPE '\\')
               AND (?2 IS NULL OR model_identifier = ?2)
             ORDER BY hit_count DESC, source_text
             LIMIT ?3"
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(params![like_pattern(keyword), model_identifier, limit], RawRow::read)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawRow::into_entry).collect()
    }

    fn clear_all(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        Ok(conn.execute("DELETE FROM translation_cache", [])?)
    }

    fn last_cleanup(&self) -> Result<Option<i64>, StoreError> {
        let conn = self.conn.lock();
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM cache_metadata WHERE key = 'last_cleanup'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        // An unreadable marker just means the next purge runs.
        Ok(value.and_then(|v| v.parse().ok()))
    }

    fn set_last_cleanup(&self, at: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO cache_metadata (key, value) VALUES ('last_cleanup', ?1)",
            params![at.to_string()],
        )?;
        Ok(())
    }

    fn aggregate(&self) -> Result<StoreAggregate, StoreError> {
        let conn = self.conn.lock();
        let (entry_count, total_bytes): (i64, i64) = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(LENGTH(source_text) + LENGTH(translated_text) + LENGTH(context_json)), 0)
             FROM translation_cache",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let mut stmt = conn.prepare(
            "SELECT model_identifier, COUNT(*) FROM translation_cache
             GROUP BY model_identifier ORDER BY model_identifier",
        )?;
        let per_model = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64)))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(StoreAggregate {
            entry_count: entry_count as u64,
            total_bytes: total_bytes as u64,
            per_model,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(text: &str, model: &str) -> CacheEntry {
        CacheEntry::new(text, &["before".to_string()], model, &format!("{text}!"))
    }

    #[test]
    fn upsert_then_get_round_trips_all_fields() {
        let store = SqliteStore::open_in_memory().unwrap();
        let entry = sample("Hello", "gpt/zh");
        store.upsert(&entry).unwrap();
        let loaded = store.get(&entry.fingerprint).unwrap().unwrap();
        assert_eq!(loaded, entry);
        assert!(store.get(&sample("Other", "gpt/zh").fingerprint).unwrap().is_none());
    }

    #[test]
    fn record_hit_bumps_count_and_access_time() {
        let store = SqliteStore::open_in_memory().unwrap();
        let entry = sample("Hello", "gpt/zh");
        store.upsert(&entry).unwrap();
        store.record_hit(&entry.fingerprint, entry.last_accessed_at + 10).unwrap();
        let loaded = store.get(&entry.fingerprint).unwrap().unwrap();
        assert_eq!(loaded.hit_count, 2);
        assert_eq!(loaded.last_accessed_at, entry.last_accessed_at + 10);
    }

    #[test]
    fn purge_removes_only_stale_rows() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut old = sample("old", "m");
        old.last_accessed_at -= 100 * 86_400;
        let fresh = sample("fresh", "m");
        store.upsert(&old).unwrap();
        store.upsert(&fresh).unwrap();

        let cutoff = fresh.last_accessed_at - 30 * 86_400;
        assert_eq!(store.purge_older_than(cutoff).unwrap(), 1);
        assert!(store.get(&old.fingerprint).unwrap().is_none());
        assert!(store.get(&fresh.fingerprint).unwrap().is_some());
    }

    #[test]
    fn aggregate_and_clear_model() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert(&sample("a", "m1")).unwrap();
        store.upsert(&sample("b", "m1")).unwrap();
        store.upsert(&sample("c", "m2")).unwrap();

        let agg = store.aggregate().unwrap();
        assert_eq!(agg.entry_count, 3);
        assert!(agg.total_bytes > 0);
        assert_eq!(agg.per_model, vec![("m1".to_string(), 2), ("m2".to_string(), 1)]);

        assert_eq!(store.clear_model("m1").unwrap(), 2);
        assert_eq!(store.aggregate().unwrap().entry_count, 1);
    }

    #[test]
    fn rows_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.db");
        let entry = sample("persist me", "m");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.upsert(&entry).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get(&entry.fingerprint).unwrap().unwrap().translated_text, "persist me!");
    }

    #[test]
    fn schema_version_mismatch_drops_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let entry = sample("stale", "m");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.upsert(&entry).unwrap();
            store
                .conn
                .lock()
                .execute(
                    "UPDATE cache_metadata SET value = '1' WHERE key = 'schema_version'",
                    [],
                )
                .unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert!(store.get(&entry.fingerprint).unwrap().is_none());
    }

    #[test]
    fn search_matches_either_side_and_filters_by_model() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut popular = CacheEntry::new("good morning", &[], "m1", "早安");
        popular.hit_count = 9;
        store.upsert(&popular).unwrap();
        store.upsert(&CacheEntry::new("good night", &[], "m1", "晚安")).unwrap();
        store.upsert(&CacheEntry::new("good night", &[], "m2", "おやすみ")).unwrap();
        store.upsert(&CacheEntry::new("100% sure", &[], "m1", "百分百")).unwrap();

        let hits = store.search("GOOD", None, 10).unwrap();
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].translated_text, "早安");

        let m2 = store.search("good", Some("m2"), 10).unwrap();
        assert_eq!(m2.len(), 1);
        assert_eq!(m2[0].translated_text, "おやすみ");

        assert_eq!(store.search("晚", None, 10).unwrap().len(), 1);
        assert_eq!(store.search("good", None, 1).unwrap().len(), 1);
        // Wildcards in the keyword are literal.
        assert_eq!(store.search("0%", None, 10).unwrap().len(), 1);
        assert!(store.search("_", None, 10).unwrap().is_empty());
    }

    #[test]
    fn insert_if_absent_keeps_existing_rows() {
        let store = SqliteStore::open_in_memory().unwrap();
        let original = sample("Hello", "m");
        store.upsert(&original).unwrap();

        let mut replacement = original.clone();
        replacement.translated_text = "changed".into();
        assert!(!store.insert_if_absent(&replacement).unwrap());
        assert!(store.insert_if_absent(&sample("new", "m")).unwrap());

        assert_eq!(store.get(&original.fingerprint).unwrap().unwrap(), original);
        assert_eq!(store.entries().unwrap().len(), 2);
        assert_eq!(store.clear_all().unwrap(), 2);
        assert!(store.entries().unwrap().is_empty());
    }

    #[test]
    fn last_cleanup_marker_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            assert_eq!(store.last_cleanup().unwrap(), None);
            store.set_last_cleanup(1_700_000_000).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.last_cleanup().unwrap(), Some(1_700_000_000));
    }
}
