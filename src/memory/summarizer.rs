//! 递归摘要：新摘要 = f(旧摘要, 被驱逐的条目)
//!
//! LlmSummarizer 调用生成服务；ConcatSummarizer 不依赖模型，把被驱逐内容的截断转录接在旧摘要后面。

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::llm::{LlmClient, LlmError};
use crate::memory::{Entry, Message};

#[derive(Debug, Error)]
pub enum SummarizeError {
    #[error("summarizer LLM call failed: {0}")]
    Llm(#[from] LlmError),

    #[error("summarizer returned an empty summary")]
    Empty,
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, previous_summary: &str, entries: &[Entry]) -> Result<String, SummarizeError>;
}

/// 条目转录："ROLE: content"，每条一行
pub fn format_transcript(entries: &[Entry]) -> String {
    entries
        .iter()
        .map(Entry::transcript_line)
        .collect::<Vec<_>>()
        .join("\n")
}

fn summary_prompt(previous_summary: &str, transcript: &str) -> String {
    let previous = if previous_summary.trim().is_empty() {
        "(none)"
    } else {
        previous_summary
    };
    format!(
        "Summarize the following interaction based on the previous summary.\n\
         Focus on key facts, decisions, and important information.\n\n\
         Previous Summary:\n{previous}\n\n\
         New Interactions to Incorporate:\n{transcript}\n\n\
         Generate a concise updated summary:"
    )
}

pub struct LlmSummarizer {
    llm: Arc<dyn LlmClient>,
}

impl LlmSummarizer {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(&self, previous_summary: &str, entries: &[Entry]) -> Result<String, SummarizeError> {
        let messages = vec![
            Message::system("You are a helpful assistant that creates concise summaries."),
            Message::user(summary_prompt(previous_summary, &format_transcript(entries))),
        ];
        let summary = self.llm.complete(&messages).await?;
        let summary = summary.trim();
        if summary.is_empty() {
            return Err(SummarizeError::Empty);
        }
        Ok(summary.to_string())
    }
}

/// 无模型摘要：旧摘要 + "Recent activity: <转录前 excerpt_chars 个字符>..."，整体只保留末尾 max_chars 个字符
#[derive(Debug, Clone)]
pub struct ConcatSummarizer {
    excerpt_chars: usize,
    max_chars: usize,
}

impl ConcatSummarizer {
    pub fn new(excerpt_chars: usize, max_chars: usize) -> Self {
        Self {
            excerpt_chars,
            max_chars: max_chars.max(excerpt_chars),
        }
    }

    pub fn compose(&self, previous_summary: &str, entries: &[Entry]) -> String {
        let transcript = format_transcript(entries);
        let excerpt: String = transcript.chars().take(self.excerpt_chars).collect();
        let combined = if previous_summary.trim().is_empty() {
            format!("Recent activity: {excerpt}...")
        } else {
            format!("{previous_summary}\n\nRecent activity: {excerpt}...")
        };

        let len = combined.chars().count();
        if len <= self.max_chars {
            combined
        } else {
            combined.chars().skip(len - self.max_chars).collect()
        }
    }
}

impl Default for ConcatSummarizer {
    fn default() -> Self {
        Self::new(500, 2000)
    }
}

#[async_trait]
impl Summarizer for ConcatSummarizer {
    async fn summarize(&self, previous_summary: &str, entries: &[Entry]) -> Result<String, SummarizeError> {
        Ok(self.compose(previous_summary, entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::memory::{EntryKind, Role};
    use chrono::Utc;

    fn entries() -> Vec<Entry> {
        vec![
            Entry::new(Role::User, "I live in Oslo".into(), Utc::now(), 8, EntryKind::Conversation),
            Entry::new(Role::Assistant, "Noted".into(), Utc::now(), 6, EntryKind::Conversation),
        ]
    }

    #[test]
    fn test_format_transcript() {
        assert_eq!(format_transcript(&entries()), "USER: I live in Oslo\nASSISTANT: Noted");
    }

    #[tokio::test]
    async fn test_concat_summarizer() {
        let s = ConcatSummarizer::default();
        let first = s.summarize("", &entries()).await.unwrap();
        assert!(first.starts_with("Recent activity: USER: I live in Oslo"));
        let second = s.summarize(&first, &entries()).await.unwrap();
        assert!(second.starts_with(&first));
    }

    #[test]
    fn test_concat_summarizer_bounded() {
        let s = ConcatSummarizer::new(10, 40);
        let mut summary = String::new();
        for _ in 0..10 {
            summary = s.compose(&summary, &entries());
        }
        assert!(summary.chars().count() <= 40);
    }

    #[tokio::test]
    async fn test_llm_summarizer_uses_previous_summary() {
        let mock = Arc::new(MockLlmClient::scripted(vec![Ok("User lives in Oslo.".to_string())]));
        let s = LlmSummarizer::new(mock.clone());
        let out = s.summarize("User is called Ann.", &entries()).await.unwrap();
        assert_eq!(out, "User lives in Oslo.");
        let ctx = mock.last_context();
        assert!(ctx[1].content.contains("User is called Ann."));
        assert!(ctx[1].content.contains("USER: I live in Oslo"));
    }

    #[tokio::test]
    async fn test_llm_summarizer_propagates_failure() {
        let mock = Arc::new(MockLlmClient::scripted(vec![Err(LlmError::Timeout)]));
        let s = LlmSummarizer::new(mock);
        assert!(s.summarize("", &entries()).await.is_err());
    }
}
