//! 窗口条目：一次对话内容的最小单位
//!
//! 创建时计算并缓存 token_cost，之后不可变；驱逐时所有权从 QueueController 转交归档存储。

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::memory::{Message, Role};

/// 条目类别
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// 普通对话内容（会被摘要与归档）
    Conversation,
    /// 窗口 index 0 的摘要槽
    Summary,
    /// 记忆压力提示：临时性，不参与摘要、不归档
    Advisory,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    id: Uuid,
    role: Role,
    content: String,
    timestamp: DateTime<Utc>,
    token_cost: usize,
    kind: EntryKind,
}

impl Entry {
    pub(crate) fn new(
        role: Role,
        content: String,
        timestamp: DateTime<Utc>,
        token_cost: usize,
        kind: EntryKind,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content,
            timestamp,
            token_cost,
            kind,
        }
    }

    /// 从存储中还原一条已归档的对话条目
    pub fn restore(
        id: Uuid,
        role: Role,
        content: String,
        timestamp: DateTime<Utc>,
        token_cost: usize,
    ) -> Self {
        Self {
            id,
            role,
            content,
            timestamp,
            token_cost,
            kind: EntryKind::Conversation,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn token_cost(&self) -> usize {
        self.token_cost
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn is_conversation(&self) -> bool {
        self.kind == EntryKind::Conversation
    }

    pub fn to_message(&self) -> Message {
        Message {
            role: self.role,
            content: self.content.clone(),
        }
    }

    /// 摘要 / 索引文档中的一行："USER: ..."
    pub fn transcript_line(&self) -> String {
        format!("{}: {}", self.role.as_str().to_uppercase(), self.content)
    }
}

/// 存储用的时间戳格式：固定 9 位小数，可按字典序排序，且可无损还原
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
