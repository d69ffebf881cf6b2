//! 索引存储：被驱逐内容的转录文档，按相似度检索（archival memory）
//!
//! 配置了 EmbeddingProvider 时按余弦相似度打分，否则按 jieba 分词后的 Jaccard 相似度。
//! 以 range_id 为键写入，同一驱逐区间重复写入只保留一份。

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use crate::core::StorageError;
use crate::llm::EmbeddingProvider;
use crate::memory::archive::DEFAULT_PAGE_SIZE;
use crate::memory::tokenizer;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScoredDocument {
    pub document_text: String,
    pub score: f32,
    pub range_id: String,
    pub session_id: String,
}

#[async_trait]
pub trait IndexStore: Send + Sync {
    /// 写入一份文档；range_id 相同则覆盖
    async fn insert(
        &self,
        document_text: &str,
        session_id: &str,
        range_id: &str,
    ) -> Result<(), StorageError>;

    /// 相似度降序，page 从 0 开始
    async fn search(&self, query: &str, page: usize) -> Result<Vec<ScoredDocument>, StorageError>;

    fn page_size(&self) -> usize;
}

#[derive(Clone, Debug)]
struct IndexedDoc {
    document_text: String,
    session_id: String,
    range_id: String,
    embedding: Option<Vec<f32>>,
}

/// 打分方式：有嵌入则余弦，否则关键词
#[derive(Clone)]
struct Scorer {
    embedder: Option<Arc<dyn EmbeddingProvider>>,
}

impl Scorer {
    async fn embed(&self, text: &str) -> Result<Option<Vec<f32>>, StorageError> {
        match &self.embedder {
            Some(embedder) => embedder
                .embed(text)
                .await
                .map(Some)
                .map_err(|e| StorageError::Unavailable(format!("embedding: {e}"))),
            None => Ok(None),
        }
    }

    /// 打分并分页；分数为 0 的文档不返回，分数相同时后写入的在前
    async fn rank(
        &self,
        query: &str,
        docs: Vec<IndexedDoc>,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<ScoredDocument>, StorageError> {
        let query_embedding = self.embed(query).await?;
        let query_terms: HashSet<String> = tokenizer::tokenize_to_set(query);

        let mut scored: Vec<(usize, ScoredDocument)> = docs
            .into_iter()
            .enumerate()
            .map(|(order, doc)| {
                let score = match (&query_embedding, &doc.embedding) {
                    (Some(q), Some(d)) if !q.is_empty() => tokenizer::cosine_similarity(q, d),
                    _ => tokenizer::jaccard_similarity(
                        &query_terms,
                        &tokenizer::tokenize_to_set(&doc.document_text),
                    ),
                };
                (
                    order,
                    ScoredDocument {
                        document_text: doc.document_text,
                        score,
                        range_id: doc.range_id,
                        session_id: doc.session_id,
                    },
                )
            })
            .filter(|(_, d)| d.score > 0.0)
            .collect();

        scored.sort_by(|a, b| {
            b.1.score
                .partial_cmp(&a.1.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.0.cmp(&a.0))
        });

        Ok(scored
            .into_iter()
            .skip(page * page_size)
            .take(page_size)
            .map(|(_, d)| d)
            .collect())
    }
}

/// 进程内索引
pub struct InMemoryIndex {
    docs: RwLock<Vec<IndexedDoc>>,
    scorer: Scorer,
    page_size: usize,
}

impl InMemoryIndex {
    pub fn new(page_size: usize, embedder: Option<Arc<dyn EmbeddingProvider>>) -> Self {
        Self {
            docs: RwLock::new(Vec::new()),
            scorer: Scorer { embedder },
            page_size: page_size.max(1),
        }
    }

    /// 已写入的文档数
    pub fn len(&self) -> usize {
        self.docs.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned() -> StorageError {
        StorageError::Unavailable("index lock poisoned".to_string())
    }
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_SIZE, None)
    }
}

#[async_trait]
impl IndexStore for InMemoryIndex {
    async fn insert(
        &self,
        document_text: &str,
        session_id: &str,
        range_id: &str,
    ) -> Result<(), StorageError> {
        let embedding = self.scorer.embed(document_text).await?;
        let doc = IndexedDoc {
            document_text: document_text.to_string(),
            session_id: session_id.to_string(),
            range_id: range_id.to_string(),
            embedding,
        };
        let mut docs = self.docs.write().map_err(|_| Self::poisoned())?;
        docs.retain(|d| d.range_id != range_id);
        docs.push(doc);
        Ok(())
    }

    async fn search(&self, query: &str, page: usize) -> Result<Vec<ScoredDocument>, StorageError> {
        let docs = self.docs.read().map_err(|_| Self::poisoned())?.clone();
        self.scorer.rank(query, docs, page, self.page_size).await
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}

/// SQLite 索引：嵌入以 JSON 文本列保存，检索时载入后在进程内打分
pub struct SqliteIndex {
    pool: SqlitePool,
    scorer: Scorer,
    page_size: usize,
}

impl SqliteIndex {
    pub async fn new(
        pool: SqlitePool,
        page_size: usize,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
    ) -> Result<Self, StorageError> {
        let index = Self {
            pool,
            scorer: Scorer { embedder },
            page_size: page_size.max(1),
        };
        index.init_tables().await?;
        Ok(index)
    }

    async fn init_tables(&self) -> Result<(), StorageError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS index_documents (
                range_id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                document_text TEXT NOT NULL,
                embedding TEXT,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl IndexStore for SqliteIndex {
    async fn insert(
        &self,
        document_text: &str,
        session_id: &str,
        range_id: &str,
    ) -> Result<(), StorageError> {
        let embedding = self
            .scorer
            .embed(document_text)
            .await?
            .map(|v| serde_json::to_string(&v))
            .transpose()
            .map_err(|e| StorageError::Corrupt(e.to_string()))?;
        let now = chrono::Utc::now().to_rfc3339();

        sqlx::query(
            "INSERT OR REPLACE INTO index_documents
             (range_id, session_id, document_text, embedding, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(range_id)
        .bind(session_id)
        .bind(document_text)
        .bind(embedding)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn search(&self, query: &str, page: usize) -> Result<Vec<ScoredDocument>, StorageError> {
        let rows = sqlx::query(
            "SELECT range_id, session_id, document_text, embedding
             FROM index_documents ORDER BY rowid ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut docs = Vec::with_capacity(rows.len());
        for row in rows {
            let embedding: Option<String> = row.try_get("embedding")?;
            let embedding = embedding
                .map(|s| serde_json::from_str::<Vec<f32>>(&s))
                .transpose()
                .map_err(|e| StorageError::Corrupt(format!("embedding column: {e}")))?;
            docs.push(IndexedDoc {
                document_text: row.try_get("document_text")?,
                session_id: row.try_get("session_id")?,
                range_id: row.try_get("range_id")?,
                embedding,
            });
        }

        self.scorer.rank(query, docs, page, self.page_size).await
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}
