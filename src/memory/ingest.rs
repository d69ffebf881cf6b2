//! 导入旧会话
//!
//! 读取 `[{"role": ..., "content": ..., "timestamp": ...}]` 形式的 JSON 消息列表：
//! 逐条写入归档存储（conversation_search 可检索），整段转写作为一份文档写入索引存储
//! （archival_memory_search 可检索）。导入的消息不进入窗口，不影响记忆压力。
//! 写完后核对归档条数，对不上即报错。

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::{retry, AgentError, RetryConfig};
use crate::memory::entry::{format_timestamp, parse_timestamp};
use crate::memory::{ArchiveStore, Entry, IndexStore, Role, TokenCounter};

/// 导入文件中的一条消息；缺省角色为 user
#[derive(Debug, Clone, Deserialize)]
pub struct IngestMessage {
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

fn default_role() -> String {
    "user".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestReport {
    /// 写入归档的条数
    pub archived: usize,
    /// 内容为空而跳过的条数
    pub skipped: usize,
    /// 导入后该会话在归档中的总条数
    pub archive_total: usize,
    pub range_id: String,
}

pub fn load_messages(path: impl AsRef<Path>) -> anyhow::Result<Vec<IngestMessage>> {
    let path = path.as_ref();
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("read messages {}", path.display()))?;
    let messages: Vec<IngestMessage> = serde_json::from_str(&data)
        .with_context(|| format!("parse messages {}", path.display()))?;
    Ok(messages)
}

/// RFC 3339，或 `2024-01-15 09:00:00`（按 UTC）
fn parse_ingest_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    parse_timestamp(raw).or_else(|| {
        NaiveDateTime::parse_from_str(raw.trim(), "%Y-%m-%d %H:%M:%S")
            .ok()
            .map(|t| t.and_utc())
    })
}

/// 导入到 session_id 名下；没有可用时间戳的消息按文件顺序排在导入时刻之后
pub async fn ingest_messages(
    messages: &[IngestMessage],
    session_id: &str,
    archive: &Arc<dyn ArchiveStore>,
    index: &Arc<dyn IndexStore>,
    counter: &TokenCounter,
    retry_cfg: &RetryConfig,
) -> Result<IngestReport, AgentError> {
    let before = archive.count(Some(session_id)).await?;
    let imported_at = Utc::now();

    let mut entries = Vec::with_capacity(messages.len());
    let mut skipped = 0;
    for (i, msg) in messages.iter().enumerate() {
        if msg.content.trim().is_empty() {
            skipped += 1;
            continue;
        }
        let role = Role::parse(&msg.role).unwrap_or_else(|| {
            tracing::warn!(message = i + 1, role = %msg.role, "unknown role, importing as user");
            Role::User
        });
        let timestamp = match msg.timestamp.as_deref().map(parse_ingest_timestamp) {
            Some(Some(ts)) => ts,
            Some(None) => {
                tracing::warn!(message = i + 1, "invalid timestamp, using import time");
                imported_at + chrono::Duration::nanoseconds(i as i64)
            }
            None => imported_at + chrono::Duration::nanoseconds(i as i64),
        };
        let cost = counter.entry_cost(&msg.content);
        entries.push(Entry::restore(
            Uuid::new_v4(),
            role,
            msg.content.clone(),
            timestamp,
            cost,
        ));
    }

    let range_id = format!("ingest-{}", Uuid::new_v4());
    if entries.is_empty() {
        return Ok(IngestReport {
            archived: 0,
            skipped,
            archive_total: before,
            range_id,
        });
    }

    for entry in &entries {
        retry(retry_cfg, "archive.append", move || archive.append(entry, session_id)).await?;
    }

    let document = entries
        .iter()
        .map(|e| format!("[{}] {}", format_timestamp(&e.timestamp()), e.transcript_line()))
        .collect::<Vec<_>>()
        .join("\n");
    {
        let document = &document;
        let range_id = &range_id;
        retry(retry_cfg, "index.insert", move || index.insert(document, session_id, range_id))
            .await?;
    }

    let archive_total = archive.count(Some(session_id)).await?;
    if archive_total.saturating_sub(before) != entries.len() {
        return Err(AgentError::TransientIo(format!(
            "ingest verification failed: wrote {} messages but archive grew by {}",
            entries.len(),
            archive_total.saturating_sub(before)
        )));
    }

    tracing::info!(
        archived = entries.len(),
        skipped,
        archive_total,
        range_id = %range_id,
        "old messages ingested"
    );
    Ok(IngestReport {
        archived: entries.len(),
        skipped,
        archive_total,
        range_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryArchive, InMemoryIndex};
    use chrono::{Datelike, Timelike};
    use std::time::Duration;

    fn message(role: &str, content: &str, timestamp: Option<&str>) -> IngestMessage {
        IngestMessage {
            role: role.to_string(),
            content: content.to_string(),
            timestamp: timestamp.map(String::from),
        }
    }

    #[test]
    fn test_timestamp_formats() {
        let ts = parse_ingest_timestamp("2024-01-15 09:00:05").unwrap();
        assert_eq!((ts.year(), ts.month(), ts.day()), (2024, 1, 15));
        assert_eq!((ts.hour(), ts.second()), (9, 5));
        assert!(parse_ingest_timestamp("2024-01-15T09:00:00Z").is_some());
        assert!(parse_ingest_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_load_messages_defaults_role() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.json");
        std::fs::write(&path, r#"[{"content": "hello"}, {"role": "assistant", "content": "hi", "timestamp": "2024-01-15 09:00:00"}]"#)
            .unwrap();
        let msgs = load_messages(&path).unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, "user");
        assert!(msgs[0].timestamp.is_none());
        assert!(load_messages(dir.path().join("missing.json")).is_err());
    }

    #[tokio::test]
    async fn test_ingest_writes_archive_and_index() {
        let archive: Arc<dyn ArchiveStore> = Arc::new(InMemoryArchive::default());
        let index = Arc::new(InMemoryIndex::default());
        let index_dyn: Arc<dyn IndexStore> = index.clone();
        let msgs = vec![
            message("user", "This project must run fully local.", Some("2024-01-15 09:00:00")),
            message("assistant", "Understood, SQLite it is.", Some("2024-01-15 09:00:05")),
            message("user", "   ", None),
            message("narrator", "No Docker please.", Some("not a date")),
        ];
        let retry_cfg = RetryConfig::new(1, Duration::ZERO, Duration::from_secs(1));

        let report = ingest_messages(&msgs, "s1", &archive, &index_dyn, &TokenCounter::default(), &retry_cfg)
            .await
            .unwrap();
        assert_eq!(report.archived, 3);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.archive_total, 3);
        assert!(report.range_id.starts_with("ingest-"));

        let hits = archive.search("run fully local", Some("s1"), 0).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].role(), Role::User);
        assert_eq!(hits[0].timestamp().hour(), 9);

        let docker = archive.search("docker", Some("s1"), 0).await.unwrap();
        assert_eq!(docker[0].role(), Role::User);
        assert!(archive.search("docker", Some("other"), 0).await.unwrap().is_empty());

        assert_eq!(index.len(), 1);
        let docs = index.search("SQLite local", 0).await.unwrap();
        assert_eq!(docs[0].range_id, report.range_id);
        assert!(docs[0].document_text.contains("ASSISTANT: Understood, SQLite it is."));
    }

    #[tokio::test]
    async fn test_ingest_nothing_writes_nothing() {
        let archive: Arc<dyn ArchiveStore> = Arc::new(InMemoryArchive::default());
        let index = Arc::new(InMemoryIndex::default());
        let index_dyn: Arc<dyn IndexStore> = index.clone();
        let retry_cfg = RetryConfig::new(1, Duration::ZERO, Duration::from_secs(1));
        let report = ingest_messages(&[message("user", "", None)], "s1", &archive, &index_dyn, &TokenCounter::default(), &retry_cfg)
            .await
            .unwrap();
        assert_eq!(report.archived, 0);
        assert_eq!(index.len(), 0);
    }
}
