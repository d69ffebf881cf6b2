//! 归档存储：按时间顺序保存被驱逐的条目（recall memory）
//!
//! 以 entry id 为键写入，重复写入同一条目是无操作，驱逐重试不会产生重复。
//! 检索为大小写不敏感的子串匹配，最新的在前，按 page_size 分页。

use std::path::Path;
use std::sync::RwLock;

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use uuid::Uuid;

use crate::core::StorageError;
use crate::memory::entry::{format_timestamp, parse_timestamp};
use crate::memory::{Entry, Role};

/// 默认每页条数
pub const DEFAULT_PAGE_SIZE: usize = 5;

#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// 写入一条记录；同一 entry id 再次写入不产生新记录
    async fn append(&self, entry: &Entry, session_id: &str) -> Result<(), StorageError>;

    /// 子串检索，page 从 0 开始；session_id 为 None 时检索所有会话
    async fn search(
        &self,
        query: &str,
        session_id: Option<&str>,
        page: usize,
    ) -> Result<Vec<Entry>, StorageError>;

    async fn count(&self, session_id: Option<&str>) -> Result<usize, StorageError>;

    fn page_size(&self) -> usize;
}

/// 进程内归档（测试与 `storage.backend = "memory"`）
pub struct InMemoryArchive {
    records: RwLock<Vec<(String, Entry)>>,
    page_size: usize,
}

impl InMemoryArchive {
    pub fn new(page_size: usize) -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            page_size: page_size.max(1),
        }
    }

    fn poisoned() -> StorageError {
        StorageError::Unavailable("archive lock poisoned".to_string())
    }
}

impl Default for InMemoryArchive {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_SIZE)
    }
}

#[async_trait]
impl ArchiveStore for InMemoryArchive {
    async fn append(&self, entry: &Entry, session_id: &str) -> Result<(), StorageError> {
        let mut records = self.records.write().map_err(|_| Self::poisoned())?;
        if records.iter().any(|(_, e)| e.id() == entry.id()) {
            return Ok(());
        }
        records.push((session_id.to_string(), entry.clone()));
        Ok(())
    }

    async fn search(
        &self,
        query: &str,
        session_id: Option<&str>,
        page: usize,
    ) -> Result<Vec<Entry>, StorageError> {
        let needle = query.to_lowercase();
        let records = self.records.read().map_err(|_| Self::poisoned())?;
        let mut hits: Vec<Entry> = records
            .iter()
            .filter(|(sid, _)| session_id.map_or(true, |s| s == sid))
            .filter(|(_, e)| e.content().to_lowercase().contains(&needle))
            .map(|(_, e)| e.clone())
            .collect();
        hits.sort_by(|a, b| b.timestamp().cmp(&a.timestamp()));
        Ok(hits
            .into_iter()
            .skip(page * self.page_size)
            .take(self.page_size)
            .collect())
    }

    async fn count(&self, session_id: Option<&str>) -> Result<usize, StorageError> {
        let records = self.records.read().map_err(|_| Self::poisoned())?;
        Ok(records
            .iter()
            .filter(|(sid, _)| session_id.map_or(true, |s| s == sid))
            .count())
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}

/// 打开（必要时创建）SQLite 数据库，归档与索引共用一个连接池
pub async fn open_sqlite_pool(db_path: impl AsRef<Path>) -> Result<SqlitePool, StorageError> {
    if let Some(parent) = db_path.as_ref().parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::Unavailable(format!("create {}: {e}", parent.display())))?;
        }
    }
    let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&db_url)
        .await?;
    Ok(pool)
}

/// SQLite 归档
pub struct SqliteArchive {
    pool: SqlitePool,
    page_size: usize,
}

impl SqliteArchive {
    pub async fn new(pool: SqlitePool, page_size: usize) -> Result<Self, StorageError> {
        let archive = Self {
            pool,
            page_size: page_size.max(1),
        };
        archive.init_tables().await?;
        Ok(archive)
    }

    async fn init_tables(&self) -> Result<(), StorageError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS archive_entries (
                entry_id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                token_cost INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_archive_session_time
             ON archive_entries(session_id, timestamp)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// LIKE 模式转义（\ 为转义符）
fn like_pattern(query: &str) -> String {
    let mut escaped = String::with_capacity(query.len() + 2);
    escaped.push('%');
    for c in query.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<Entry, StorageError> {
    let id: String = row.try_get("entry_id")?;
    let role: String = row.try_get("role")?;
    let content: String = row.try_get("content")?;
    let timestamp: String = row.try_get("timestamp")?;
    let token_cost: i64 = row.try_get("token_cost")?;

    let id = Uuid::parse_str(&id).map_err(|e| StorageError::Corrupt(format!("entry id {id}: {e}")))?;
    let role = Role::parse(&role).ok_or_else(|| StorageError::Corrupt(format!("role {role}")))?;
    let timestamp = parse_timestamp(&timestamp)
        .ok_or_else(|| StorageError::Corrupt(format!("timestamp {timestamp}")))?;

    Ok(Entry::restore(
        id,
        role,
        content,
        timestamp,
        token_cost.max(0) as usize,
    ))
}

#[async_trait]
impl ArchiveStore for SqliteArchive {
    async fn append(&self, entry: &Entry, session_id: &str) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT OR IGNORE INTO archive_entries
             (entry_id, session_id, role, content, timestamp, token_cost)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.id().to_string())
        .bind(session_id)
        .bind(entry.role().as_str())
        .bind(entry.content())
        .bind(format_timestamp(&entry.timestamp()))
        .bind(entry.token_cost() as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn search(
        &self,
        query: &str,
        session_id: Option<&str>,
        page: usize,
    ) -> Result<Vec<Entry>, StorageError> {
        let rows = sqlx::query(
            "SELECT entry_id, role, content, timestamp, token_cost
             FROM archive_entries
             WHERE content LIKE ? ESCAPE '\\'
               AND (? IS NULL OR session_id = ?)
             ORDER BY timestamp DESC
             LIMIT ? OFFSET ?",
        )
        .bind(like_pattern(query))
        .bind(session_id)
        .bind(session_id)
        .bind(self.page_size as i64)
        .bind((page * self.page_size) as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_entry).collect()
    }

    async fn count(&self, session_id: Option<&str>) -> Result<usize, StorageError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM archive_entries WHERE (? IS NULL OR session_id = ?)",
        )
        .bind(session_id)
        .bind(session_id)
        .fetch_one(&self.pool)
        .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n.max(0) as usize)
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::EntryKind;
    use chrono::{Duration, Utc};

    fn entry(content: &str, offset_ms: i64) -> Entry {
        Entry::new(
            Role::User,
            content.to_string(),
            Utc::now() + Duration::milliseconds(offset_ms),
            8,
            EntryKind::Conversation,
        )
    }

    #[tokio::test]
    async fn test_in_memory_search_newest_first_case_insensitive() {
        let archive = InMemoryArchive::new(5);
        archive.append(&entry("I like Blue", 0), "s1").await.unwrap();
        archive.append(&entry("blue whales", 10), "s1").await.unwrap();
        archive.append(&entry("red", 20), "s1").await.unwrap();

        let hits = archive.search("BLUE", None, 0).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].content(), "blue whales");
    }

    #[tokio::test]
    async fn test_in_memory_append_is_idempotent() {
        let archive = InMemoryArchive::default();
        let e = entry("once", 0);
        archive.append(&e, "s1").await.unwrap();
        archive.append(&e, "s1").await.unwrap();
        assert_eq!(archive.count(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_in_memory_pagination_and_session_filter() {
        let archive = InMemoryArchive::new(2);
        for i in 0..5 {
            archive.append(&entry(&format!("msg {i}"), i), "s1").await.unwrap();
        }
        archive.append(&entry("msg other", 99), "s2").await.unwrap();

        assert_eq!(archive.search("msg", Some("s1"), 0).await.unwrap().len(), 2);
        assert_eq!(archive.search("msg", Some("s1"), 2).await.unwrap().len(), 1);
        assert_eq!(archive.search("msg", Some("s2"), 0).await.unwrap().len(), 1);
        assert_eq!(archive.count(Some("s1")).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_sqlite_roundtrip_preserves_fields() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_sqlite_pool(dir.path().join("mem.db")).await.unwrap();
        let archive = SqliteArchive::new(pool, 5).await.unwrap();

        let e = entry("100% sure_about it", 0);
        archive.append(&e, "s1").await.unwrap();
        archive.append(&e, "s1").await.unwrap();
        assert_eq!(archive.count(Some("s1")).await.unwrap(), 1);

        let hits = archive.search("100% SURE_", Some("s1"), 0).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id(), e.id());
        assert_eq!(hits[0].role(), e.role());
        assert_eq!(hits[0].content(), e.content());
        assert_eq!(hits[0].timestamp(), e.timestamp());

        // 转义后 "_" 不再是通配符
        archive.append(&entry("sureXabout", 5), "s1").await.unwrap();
        let hits = archive.search("sure_about", None, 0).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id(), e.id());
    }

    #[test]
    fn test_like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("a%b_c\\"), "%a\\%b\\_c\\\\%");
    }
}
