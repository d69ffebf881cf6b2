//! QueueController：有限窗口 + 记忆压力状态机
//!
//! 窗口布局为 `[summary, e1, e2, ...]`。用量跨过 warn 阈值进入 Pressured 并注入一次压力提示；
//! 跨过 evict 阈值进入 Evicting，驱逐最旧的一段对话条目：先摘要，再写归档与索引，
//! 两个写入都成功后才替换摘要并从窗口移除。写入失败时窗口不变，选区被记住，下次重试同一段。
//!
//! 压力状态按不含压力提示的用量判定，提示本身不会把窗口推过 evict 阈值；
//! 但整体用量超过 max_tokens 时同样进入 Evicting。摘要条目的成本不超过 [`QueueConfig::summary_budget`]。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::core::{retry, AgentError, RetryConfig};
use crate::memory::summarizer::format_transcript;
use crate::memory::{
    ArchiveStore, Entry, EntryKind, IndexStore, Message, Role, Summarizer, TokenCounter,
};

/// 进入 Pressured 时注入的提示
pub const PRESSURE_ADVISORY: &str =
    "System Alert: Memory pressure detected. Save important data immediately.";

/// 摘要预算占 max_tokens 的比例上限
const SUMMARY_BUDGET_FRACTION: f64 = 0.25;

#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    pub max_tokens: usize,
    pub warn_threshold: f64,
    pub evict_threshold: f64,
}

impl QueueConfig {
    /// 要求 `0 < warn < evict <= 1` 且 max_tokens > 0
    pub fn new(max_tokens: usize, warn_threshold: f64, evict_threshold: f64) -> Result<Self, AgentError> {
        if max_tokens == 0 {
            return Err(AgentError::Config("memory.max_tokens must be > 0".to_string()));
        }
        if !(warn_threshold > 0.0 && warn_threshold < evict_threshold && evict_threshold <= 1.0) {
            return Err(AgentError::Config(format!(
                "thresholds must satisfy 0 < warn < evict <= 1 (warn={warn_threshold}, evict={evict_threshold})"
            )));
        }
        Ok(Self {
            max_tokens,
            warn_threshold,
            evict_threshold,
        })
    }

    /// 摘要条目（含协议开销）的 token 上限：max_tokens 的 1/4，且不超过 warn 阈值的一半
    pub fn summary_budget(&self) -> usize {
        let fraction = SUMMARY_BUDGET_FRACTION.min(self.warn_threshold / 2.0);
        (self.max_tokens as f64 * fraction).floor() as usize
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_tokens: 8192,
            warn_threshold: 0.70,
            evict_threshold: 0.95,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureState {
    Normal,
    Pressured,
    Evicting,
}

impl std::fmt::Display for PressureState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PressureState::Normal => "normal",
            PressureState::Pressured => "pressured",
            PressureState::Evicting => "evicting",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PressureReport {
    pub state: PressureState,
    pub usage_tokens: usize,
    pub usage_fraction: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowStatus {
    pub window_length: usize,
    pub usage_tokens: usize,
    pub max_tokens: usize,
    pub usage_fraction: f64,
    pub state: PressureState,
    pub current_summary: String,
    pub eviction_pending: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvictionReport {
    pub evicted: usize,
    pub evicted_tokens: usize,
    pub tokens_before: usize,
    pub tokens_after: usize,
    pub range_id: String,
    /// 摘要失败或超时，沿用了旧摘要
    pub summary_degraded: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PushOutcome {
    pub advisory_injected: bool,
    pub evictions: Vec<EvictionReport>,
}

/// 驱逐流水线依赖：摘要器、两个存储与各自的重试 / 超时策略
#[derive(Clone)]
pub struct EvictionPipeline {
    pub summarizer: Arc<dyn Summarizer>,
    pub archive: Arc<dyn ArchiveStore>,
    pub index: Arc<dyn IndexStore>,
    pub persist_retry: RetryConfig,
    pub summarize_timeout: Duration,
}

/// 上次未完成的驱逐：下次驱逐若窗口最旧条目仍是 first_id，则原样重试
#[derive(Debug, Clone)]
struct PendingEviction {
    first_id: Uuid,
    count: usize,
    range_id: String,
    summary: String,
    degraded: bool,
    archived: bool,
}

pub struct QueueController {
    config: QueueConfig,
    counter: TokenCounter,
    session_id: String,
    window: Vec<Entry>,
    pipeline: EvictionPipeline,
    advisory_issued: bool,
    pending: Option<PendingEviction>,
    last_timestamp: Option<DateTime<Utc>>,
}

impl QueueController {
    pub fn new(
        config: QueueConfig,
        counter: TokenCounter,
        session_id: impl Into<String>,
        pipeline: EvictionPipeline,
    ) -> Self {
        let mut queue = Self {
            config,
            counter,
            session_id: session_id.into(),
            window: Vec::new(),
            pipeline,
            advisory_issued: false,
            pending: None,
            last_timestamp: None,
        };
        let summary = queue.make_entry(Role::System, String::new(), EntryKind::Summary);
        queue.window.push(summary);
        queue
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn counter(&self) -> &TokenCounter {
        &self.counter
    }

    /// 窗口内全部条目（index 0 为摘要）
    pub fn entries(&self) -> &[Entry] {
        &self.window
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversation_len() == 0
    }

    pub fn conversation_len(&self) -> usize {
        self.window.iter().filter(|e| e.is_conversation()).count()
    }

    pub fn current_summary(&self) -> &str {
        self.window.first().map(Entry::content).unwrap_or("")
    }

    pub fn usage(&self) -> usize {
        self.counter.window_cost(&self.window)
    }

    /// 不含压力提示的用量，用于判定压力状态
    pub fn pressure_usage(&self) -> usize {
        self.window
            .iter()
            .filter(|e| e.kind() != EntryKind::Advisory)
            .map(Entry::token_cost)
            .sum()
    }

    /// 摘要预算，至少能放下一条空摘要
    pub fn summary_budget(&self) -> usize {
        self.config.summary_budget().max(self.counter.entry_cost(""))
    }

    /// 摘要超出预算时从头部截断，保留最新的部分
    fn fit_summary(&self, text: String) -> String {
        let budget = self.summary_budget();
        if self.counter.entry_cost(&text) <= budget {
            return text;
        }
        let chars: Vec<char> = text.chars().collect();
        let tail_cost = |k: usize| {
            let tail: String = chars[chars.len() - k..].iter().collect();
            self.counter.entry_cost(&tail)
        };
        // 尾部越长成本越高：二分找最长的可容纳尾部
        let (mut lo, mut hi) = (0, chars.len());
        while lo < hi {
            let mid = (lo + hi + 1) / 2;
            if tail_cost(mid) <= budget {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        let fitted: String = chars[chars.len() - lo..].iter().collect();
        tracing::debug!(
            original_chars = chars.len(),
            kept_chars = lo,
            budget,
            "summary truncated to budget"
        );
        fitted.trim_start().to_string()
    }

    /// 严格递增的时间戳
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = match self.last_timestamp {
            Some(last) if now <= last => last + chrono::Duration::nanoseconds(1),
            _ => now,
        };
        self.last_timestamp = Some(ts);
        ts
    }

    fn make_entry(&mut self, role: Role, content: String, kind: EntryKind) -> Entry {
        let cost = self.counter.entry_cost(&content);
        let ts = self.next_timestamp();
        Entry::new(role, content, ts, cost, kind)
    }

    fn fraction(&self, usage: usize) -> f64 {
        usage as f64 / self.config.max_tokens as f64
    }

    fn state_for(&self, pressure_usage: usize, usage: usize) -> PressureState {
        let fraction = self.fraction(pressure_usage);
        if fraction >= self.config.evict_threshold || usage > self.config.max_tokens {
            PressureState::Evicting
        } else if fraction >= self.config.warn_threshold {
            PressureState::Pressured
        } else {
            PressureState::Normal
        }
    }

    /// 无副作用的压力读数；usage_tokens 含压力提示
    pub fn check_pressure(&self) -> PressureReport {
        let usage = self.usage();
        PressureReport {
            state: self.state_for(self.pressure_usage(), usage),
            usage_tokens: usage,
            usage_fraction: self.fraction(usage),
        }
    }

    /// 追加一条对话条目；返回是否注入了压力提示。不会触发驱逐
    pub fn append(&mut self, role: Role, content: impl Into<String>) -> bool {
        let entry = self.make_entry(role, content.into(), EntryKind::Conversation);
        self.window.push(entry);
        self.sync_advisory()
    }

    /// 按当前状态维护压力提示：进入 Pressured 时注入一次，回到 Normal 时移除
    fn sync_advisory(&mut self) -> bool {
        match self.check_pressure().state {
            PressureState::Pressured if !self.advisory_issued => {
                let advisory =
                    self.make_entry(Role::System, PRESSURE_ADVISORY.to_string(), EntryKind::Advisory);
                self.window.push(advisory);
                self.advisory_issued = true;
                tracing::info!(
                    usage_tokens = self.usage(),
                    max_tokens = self.config.max_tokens,
                    "memory pressure: advisory injected"
                );
                true
            }
            PressureState::Normal if self.advisory_issued => {
                self.window.retain(|e| e.kind() != EntryKind::Advisory);
                self.advisory_issued = false;
                tracing::debug!("memory pressure cleared");
                false
            }
            _ => false,
        }
    }

    /// Evicting 时循环驱逐，直到回落或无法再驱逐；持久化失败时返回错误并保留待重试的驱逐
    pub async fn relieve_pressure(&mut self) -> Result<Vec<EvictionReport>, AgentError> {
        let mut reports = Vec::new();
        while self.check_pressure().state == PressureState::Evicting {
            match self.evict().await? {
                Some(report) => reports.push(report),
                None => {
                    tracing::warn!(
                        usage_tokens = self.usage(),
                        max_tokens = self.config.max_tokens,
                        "window over eviction threshold but nothing left to evict"
                    );
                    break;
                }
            }
        }
        Ok(reports)
    }

    /// append + relieve_pressure
    pub async fn push(&mut self, role: Role, content: impl Into<String>) -> Result<PushOutcome, AgentError> {
        let mut advisory_injected = self.append(role, content);
        let evictions = self.relieve_pressure().await?;
        if !evictions.is_empty() {
            advisory_injected |= self.sync_advisory();
        }
        Ok(PushOutcome {
            advisory_injected,
            evictions,
        })
    }

    /// 驱逐最旧的一段对话条目（成本 >= 总用量的 1/3，至少保留一条）；
    /// 选区还要保证按摘要预算计入新摘要后用量回落到 evict 阈值以下（条目够多时）。
    /// 对话条目少于两条时返回 Ok(None)
    pub async fn evict(&mut self) -> Result<Option<EvictionReport>, AgentError> {
        let conversation: Vec<&Entry> = self.window.iter().filter(|e| e.is_conversation()).collect();
        let n = conversation.len();
        if n < 2 {
            return Ok(None);
        }
        let tokens_before = self.usage();
        let first_id = conversation[0].id();

        let reuse = self
            .pending
            .as_ref()
            .filter(|p| p.first_id == first_id && p.count < n)
            .cloned();

        let count = match &reuse {
            Some(p) => p.count,
            None => {
                let target = tokens_before.div_ceil(3);
                let conversation_total: usize = conversation.iter().map(|e| e.token_cost()).sum();
                let summary_budget = self.summary_budget();
                // 按会再次注入压力提示估算，驱逐后的整体用量也不越界
                let advisory_cost = self.counter.entry_cost(PRESSURE_ADVISORY);
                let mut acc = 0;
                let mut count = 0;
                for e in conversation.iter().take(n - 1) {
                    acc += e.token_cost();
                    count += 1;
                    let projected = conversation_total - acc + summary_budget;
                    if acc >= target
                        && self.state_for(projected, projected + advisory_cost) != PressureState::Evicting
                    {
                        break;
                    }
                }
                count
            }
        };

        let run: Vec<Entry> = conversation[..count].iter().map(|e| (*e).clone()).collect();
        let evicted_tokens: usize = run.iter().map(Entry::token_cost).sum();

        let mut pending = match reuse {
            Some(p) => {
                tracing::info!(range_id = %p.range_id, "retrying pending eviction");
                p
            }
            None => {
                let range_id = format!("{}..{}", run[0].id(), run[count - 1].id());
                let (summary, degraded) = self.summarize_run(&run).await;
                let summary = self.fit_summary(summary);
                PendingEviction {
                    first_id,
                    count,
                    range_id,
                    summary,
                    degraded,
                    archived: false,
                }
            }
        };
        self.pending = Some(pending.clone());

        let archive = Arc::clone(&self.pipeline.archive);
        let index = Arc::clone(&self.pipeline.index);
        let retry_cfg = self.pipeline.persist_retry.clone();
        let session_id = self.session_id.clone();

        if !pending.archived {
            for entry in &run {
                let archive = &archive;
                let session_id = &session_id;
                retry(&retry_cfg, "archive.append", move || archive.append(entry, session_id))
                    .await
                    .map_err(|e| {
                        tracing::warn!(range_id = %pending.range_id, error = %e, "eviction aborted: archive write failed");
                        AgentError::from(e)
                    })?;
            }
            pending.archived = true;
            self.pending = Some(pending.clone());
        }

        let document = format_transcript(&run);
        {
            let index = &index;
            let document = &document;
            let session_id = &session_id;
            let range_id = &pending.range_id;
            retry(&retry_cfg, "index.insert", move || index.insert(document, session_id, range_id))
                .await
                .map_err(|e| {
                    tracing::warn!(range_id = %range_id, error = %e, "eviction aborted: index write failed");
                    AgentError::from(e)
                })?;
        }

        // 两个写入都成功：替换摘要，移除被驱逐的条目与压力提示
        self.pending = None;
        let summary = self.make_entry(Role::System, pending.summary.clone(), EntryKind::Summary);
        let remaining: Vec<Entry> = self
            .window
            .drain(..)
            .filter(|e| e.is_conversation())
            .skip(count)
            .collect();
        self.window = std::iter::once(summary).chain(remaining).collect();
        if self.check_pressure().state == PressureState::Normal {
            self.advisory_issued = false;
        }

        let report = EvictionReport {
            evicted: count,
            evicted_tokens,
            tokens_before,
            tokens_after: self.usage(),
            range_id: pending.range_id,
            summary_degraded: pending.degraded,
        };
        tracing::info!(
            evicted = report.evicted,
            tokens_before = report.tokens_before,
            tokens_after = report.tokens_after,
            range_id = %report.range_id,
            summary_degraded = report.summary_degraded,
            "evicted oldest entries"
        );
        Ok(Some(report))
    }

    /// 摘要失败或超时：沿用旧摘要（降级），驱逐继续
    async fn summarize_run(&self, run: &[Entry]) -> (String, bool) {
        let previous = self.current_summary().to_string();
        let call = self.pipeline.summarizer.summarize(&previous, run);
        match tokio::time::timeout(self.pipeline.summarize_timeout, call).await {
            Ok(Ok(summary)) => (summary, false),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "summarizer failed, keeping previous summary");
                (previous, true)
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.pipeline.summarize_timeout.as_millis() as u64,
                    "summarizer timed out, keeping previous summary"
                );
                (previous, true)
            }
        }
    }

    pub fn status(&self) -> WindowStatus {
        let report = self.check_pressure();
        WindowStatus {
            window_length: self.window.len(),
            usage_tokens: report.usage_tokens,
            max_tokens: self.config.max_tokens,
            usage_fraction: report.usage_fraction,
            state: report.state,
            current_summary: self.current_summary().to_string(),
            eviction_pending: self.pending.is_some(),
        }
    }

    pub fn set_summary(&mut self, text: impl Into<String>) {
        let text = self.fit_summary(text.into());
        let summary = self.make_entry(Role::System, text, EntryKind::Summary);
        match self.window.first_mut() {
            Some(slot) => *slot = summary,
            None => self.window.push(summary),
        }
        self.sync_advisory();
    }

    /// 清空窗口，只保留空摘要
    pub fn clear(&mut self) {
        self.window.clear();
        self.pending = None;
        self.advisory_issued = false;
        let summary = self.make_entry(Role::System, String::new(), EntryKind::Summary);
        self.window.push(summary);
    }

    /// 从快照恢复：摘要 + 已存在的对话条目（保留原 id / 时间戳 / 成本）
    pub fn restore(&mut self, summary: String, entries: Vec<Entry>) {
        self.clear();
        if let Some(max_ts) = entries.iter().map(Entry::timestamp).max() {
            if self.last_timestamp.map_or(true, |last| max_ts > last) {
                self.last_timestamp = Some(max_ts);
            }
        }
        self.set_summary(summary);
        self.window
            .extend(entries.into_iter().filter(Entry::is_conversation));
        self.sync_advisory();
    }

    /// 渲染为发往 LLM 的消息；空摘要不发送
    pub fn to_messages(&self) -> Vec<Message> {
        self.window
            .iter()
            .filter(|e| !(e.kind() == EntryKind::Summary && e.content().is_empty()))
            .map(Entry::to_message)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ConcatSummarizer, InMemoryArchive, InMemoryIndex, SummarizeError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedSummarizer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Summarizer for FixedSummarizer {
        async fn summarize(&self, _previous: &str, entries: &[Entry]) -> Result<String, SummarizeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("sum of {}", entries.len()))
        }
    }

    struct FailingSummarizer;

    #[async_trait]
    impl Summarizer for FailingSummarizer {
        async fn summarize(&self, _previous: &str, _entries: &[Entry]) -> Result<String, SummarizeError> {
            Err(SummarizeError::Empty)
        }
    }

    /// 前 fail_first 次写入失败的索引
    struct FlakyIndex {
        inner: InMemoryIndex,
        fail_first: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl IndexStore for FlakyIndex {
        async fn insert(&self, text: &str, sid: &str, range_id: &str) -> Result<(), crate::core::StorageError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.fail_first {
                return Err(crate::core::StorageError::Unavailable("index down".into()));
            }
            self.inner.insert(text, sid, range_id).await
        }

        async fn search(
            &self,
            query: &str,
            page: usize,
        ) -> Result<Vec<crate::memory::ScoredDocument>, crate::core::StorageError> {
            self.inner.search(query, page).await
        }

        fn page_size(&self) -> usize {
            self.inner.page_size()
        }
    }

    fn pipeline(summarizer: Arc<dyn Summarizer>, index: Arc<dyn IndexStore>) -> EvictionPipeline {
        EvictionPipeline {
            summarizer,
            archive: Arc::new(InMemoryArchive::default()),
            index,
            persist_retry: RetryConfig::new(1, Duration::ZERO, Duration::from_secs(1)),
            summarize_timeout: Duration::from_secs(1),
        }
    }

    fn queue(max_tokens: usize) -> QueueController {
        QueueController::new(
            QueueConfig::new(max_tokens, 0.7, 0.95).unwrap(),
            TokenCounter::default(),
            "s1",
            pipeline(Arc::new(ConcatSummarizer::default()), Arc::new(InMemoryIndex::default())),
        )
    }

    #[test]
    fn test_config_rejects_bad_thresholds() {
        assert!(QueueConfig::new(100, 0.9, 0.8).is_err());
        assert!(QueueConfig::new(100, 0.0, 0.8).is_err());
        assert!(QueueConfig::new(100, 0.5, 1.1).is_err());
        assert!(QueueConfig::new(0, 0.5, 0.9).is_err());
    }

    #[test]
    fn test_cached_cost_matches_recount_after_appends() {
        let mut q = queue(10_000);
        for i in 0..50 {
            q.append(Role::User, format!("message number {i} 中文内容"));
            assert_eq!(q.usage(), q.counter().recount(q.entries()));
        }
    }

    #[test]
    fn test_timestamps_strictly_increase() {
        let mut q = queue(10_000);
        for _ in 0..20 {
            q.append(Role::User, "x");
        }
        let ts: Vec<_> = q.entries().iter().map(Entry::timestamp).collect();
        assert!(ts.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_advisory_injected_once_per_episode() {
        let mut q = queue(200);
        // 每条 "x" * 40 = 10 + 4 = 14 token，空摘要 5
        let mut injected = 0;
        for _ in 0..9 {
            if q.append(Role::User, "x".repeat(40)) {
                injected += 1;
            }
        }
        // 5 + 9*14 = 131，仍是 Normal
        assert_eq!(injected, 0);
        assert!(q.append(Role::User, "x".repeat(40)));
        assert_eq!(q.check_pressure().state, PressureState::Pressured);
        let advisories = q.entries().iter().filter(|e| e.kind() == EntryKind::Advisory).count();
        assert_eq!(advisories, 1);
        assert!(!q.append(Role::User, "y"));
    }

    #[test]
    fn test_check_pressure_is_pure() {
        let mut q = queue(100);
        q.append(Role::User, "x".repeat(400));
        let before = q.entries().len();
        let report = q.check_pressure();
        assert_eq!(report.state, PressureState::Evicting);
        assert_eq!(q.entries().len(), before);
    }

    #[tokio::test]
    async fn test_evict_noop_with_fewer_than_two_entries() {
        let mut q = queue(100);
        assert!(q.evict().await.unwrap().is_none());
        q.append(Role::User, "x".repeat(400));
        assert!(q.evict().await.unwrap().is_none());
        assert_eq!(q.conversation_len(), 1);
    }

    #[tokio::test]
    async fn test_evict_keeps_at_least_one_entry() {
        for n in 2..8 {
            let mut q = queue(1_000_000);
            for i in 0..n {
                // 第一条极大，保证一条就超过 1/3
                let text = if i == 0 { "z".repeat(4000) } else { "small".to_string() };
                q.append(Role::User, text);
            }
            q.evict().await.unwrap();
            assert!(q.conversation_len() >= 1);
            assert_eq!(q.usage(), q.counter().recount(q.entries()));
        }

        let mut q = queue(1_000_000);
        q.append(Role::User, "a");
        q.append(Role::User, "b".repeat(4000));
        let report = q.evict().await.unwrap().unwrap();
        assert_eq!(report.evicted, 1);
        assert_eq!(q.conversation_len(), 1);
    }

    #[tokio::test]
    async fn test_push_evicts_and_replaces_summary() {
        let summarizer = Arc::new(FixedSummarizer {
            calls: AtomicUsize::new(0),
        });
        let mut q = QueueController::new(
            QueueConfig::new(100, 0.7, 0.95).unwrap(),
            TokenCounter::default(),
            "s1",
            pipeline(summarizer.clone(), Arc::new(InMemoryIndex::default())),
        );
        // 每条 14 token：第 5 条后 75 进入 Pressured（含提示 97），第 6 条后整体 111 超过 100
        let mut evictions = Vec::new();
        for _ in 0..8 {
            evictions.extend(q.push(Role::User, "x".repeat(40)).await.unwrap().evictions);
        }
        assert_eq!(evictions.len(), 1);
        assert_eq!(evictions[0].tokens_before, 111);
        assert_eq!(evictions[0].evicted, 3);
        assert_eq!(summarizer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(q.current_summary(), "sum of 3");

        // 摘要 6 + 5 * 14 = 76：又一次 Pressured，提示只有一条
        let report = q.check_pressure();
        assert_eq!(report.state, PressureState::Pressured);
        assert_eq!(q.pressure_usage(), 76);
        assert_eq!(report.usage_tokens, 98);
        let advisories = q.entries().iter().filter(|e| e.kind() == EntryKind::Advisory).count();
        assert_eq!(advisories, 1);
    }

    #[test]
    fn test_advisory_does_not_push_window_into_eviction() {
        let mut q = queue(100);
        // 5 + 12 * 6 = 77：加上 22 的提示共 99，仍低于 max_tokens
        for i in 0..12 {
            q.append(Role::User, format!("note {i:03}"));
        }
        assert_eq!(q.pressure_usage(), 77);
        assert_eq!(q.usage(), 99);
        assert_eq!(q.check_pressure().state, PressureState::Pressured);

        // 整体超过 max_tokens 时仍然驱逐
        q.append(Role::User, "note 012");
        assert_eq!(q.usage(), 105);
        assert_eq!(q.check_pressure().state, PressureState::Evicting);
    }

    #[test]
    fn test_summary_budget_caps_set_summary() {
        let mut q = queue(100);
        assert_eq!(q.summary_budget(), 25);
        q.set_summary(format!("{} newest fact", "old detail ".repeat(100)));
        assert!(q.entries()[0].token_cost() <= 25);
        assert!(q.current_summary().ends_with("newest fact"));
        assert_eq!(q.usage(), q.counter().recount(q.entries()));

        // 预算至少能放下空摘要
        let tiny = QueueController::new(
            QueueConfig::new(10, 0.5, 0.9).unwrap(),
            TokenCounter::default(),
            "s1",
            pipeline(Arc::new(ConcatSummarizer::default()), Arc::new(InMemoryIndex::default())),
        );
        assert_eq!(tiny.summary_budget(), 5);
    }

    #[tokio::test]
    async fn test_growing_summary_stays_within_budget() {
        let mut q = queue(200);
        for i in 0..40 {
            q.push(Role::User, format!("fact {i:02} {}", "detail ".repeat(6)))
                .await
                .unwrap();
            assert!(q.entries()[0].token_cost() <= q.summary_budget());
            assert!(q.check_pressure().state != PressureState::Evicting);
            assert!(q.usage() <= 200);
        }
        assert!(!q.current_summary().is_empty());
    }

    #[tokio::test]
    async fn test_summarizer_failure_keeps_previous_summary() {
        let mut q = QueueController::new(
            QueueConfig::new(1_000, 0.7, 0.95).unwrap(),
            TokenCounter::default(),
            "s1",
            pipeline(Arc::new(FailingSummarizer), Arc::new(InMemoryIndex::default())),
        );
        q.set_summary("earlier facts");
        for _ in 0..3 {
            q.append(Role::User, "hello there");
        }
        let report = q.evict().await.unwrap().unwrap();
        assert!(report.summary_degraded);
        assert_eq!(q.current_summary(), "earlier facts");
    }

    #[tokio::test]
    async fn test_failed_index_write_keeps_window_and_reuses_selection() {
        let summarizer = Arc::new(FixedSummarizer {
            calls: AtomicUsize::new(0),
        });
        let index = Arc::new(FlakyIndex {
            inner: InMemoryIndex::default(),
            fail_first: 2,
            calls: AtomicUsize::new(0),
        });
        let mut q = QueueController::new(
            QueueConfig::new(1_000, 0.7, 0.95).unwrap(),
            TokenCounter::default(),
            "s1",
            pipeline(summarizer.clone(), index.clone()),
        );
        for i in 0..6 {
            q.append(Role::User, format!("entry {i}"));
        }
        let before: Vec<Uuid> = q.entries().iter().map(Entry::id).collect();

        assert!(q.evict().await.is_err());
        assert!(q.status().eviction_pending);
        assert!(q.evict().await.is_err());
        let after: Vec<Uuid> = q.entries().iter().map(Entry::id).collect();
        assert_eq!(before, after);

        let report = q.evict().await.unwrap().unwrap();
        assert!(!q.status().eviction_pending);
        assert_eq!(summarizer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(index.inner.len(), 1);
        assert!(report.evicted >= 1);
    }

    #[tokio::test]
    async fn test_to_messages_skips_empty_summary() {
        let mut q = queue(1_000);
        q.append(Role::User, "hi");
        let msgs = q.to_messages();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].role, Role::User);

        q.set_summary("User said hi before");
        assert_eq!(q.to_messages().len(), 2);
        q.clear();
        assert!(q.to_messages().is_empty());
        assert_eq!(q.len(), 1);
    }
}
