//! Token 计数
//!
//! 纯函数、确定性：英文约 4 字符/token，中日韩等非 ASCII 约 1.5 字符/token（均向上取整）。
//! 空文本按固定常量计；每个条目另加固定的协议帧开销，避免系统性低估。

use crate::memory::Entry;

/// 默认每条消息的协议开销（<|im_start|>role ... <|im_end|>）
pub const DEFAULT_PER_ENTRY_OVERHEAD: usize = 4;
/// 空文本的固定估值
pub const DEFAULT_EMPTY_TEXT_COST: usize = 1;

#[derive(Debug, Clone, Copy)]
pub struct TokenCounter {
    per_entry_overhead: usize,
    empty_text_cost: usize,
}

impl TokenCounter {
    /// overhead 为 0 时按 1 处理
    pub fn new(per_entry_overhead: usize, empty_text_cost: usize) -> Self {
        Self {
            per_entry_overhead: per_entry_overhead.max(1),
            empty_text_cost: empty_text_cost.max(1),
        }
    }

    pub fn per_entry_overhead(&self) -> usize {
        self.per_entry_overhead
    }

    /// 文本 token 数；只含空白的文本按空文本计
    pub fn cost(&self, text: &str) -> usize {
        if text.trim().is_empty() {
            return self.empty_text_cost;
        }

        let mut ascii_chars = 0usize;
        let mut other_chars = 0usize;
        for c in text.chars() {
            if c.is_ascii() {
                ascii_chars += 1;
            } else {
                other_chars += 1;
            }
        }

        let tokens = ascii_chars.div_ceil(4) + (other_chars * 2).div_ceil(3);
        tokens.max(1)
    }

    /// 一个条目的 token 数（内容 + 协议开销），在条目创建时调用一次
    pub fn entry_cost(&self, content: &str) -> usize {
        self.cost(content) + self.per_entry_overhead
    }

    /// 窗口总 token 数（使用缓存值）
    pub fn window_cost(&self, entries: &[Entry]) -> usize {
        entries.iter().map(Entry::token_cost).sum()
    }

    /// 从内容重新计算窗口总 token 数（不使用缓存值）
    pub fn recount(&self, entries: &[Entry]) -> usize {
        entries.iter().map(|e| self.entry_cost(e.content())).sum()
    }
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::new(DEFAULT_PER_ENTRY_OVERHEAD, DEFAULT_EMPTY_TEXT_COST)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cost_english() {
        let counter = TokenCounter::default();
        assert_eq!(counter.cost("abcd"), 1);
        assert_eq!(counter.cost("abcde"), 2);
        let text = "Hello, world! This is a test.";
        assert!(counter.cost(text) < text.len());
    }

    #[test]
    fn test_cost_chinese() {
        let counter = TokenCounter::default();
        // 3 个汉字 -> 2 token
        assert_eq!(counter.cost("你好吗"), 2);
        assert!(counter.cost("你好世界，这是一个测试。") > 0);
    }

    #[test]
    fn test_empty_text_costs_constant() {
        let counter = TokenCounter::new(4, 3);
        assert_eq!(counter.cost(""), 3);
        assert_eq!(counter.entry_cost(""), 7);
    }

    #[test]
    fn test_whitespace_only_costs_like_empty() {
        let counter = TokenCounter::new(4, 3);
        assert_eq!(counter.cost("        "), 3);
        assert_eq!(counter.cost(" \n\t "), 3);
        assert_eq!(counter.entry_cost("   "), counter.entry_cost(""));
        assert_eq!(counter.cost("  a  "), 2);
    }

    #[test]
    fn test_overhead_never_zero() {
        let counter = TokenCounter::new(0, 0);
        assert_eq!(counter.entry_cost(""), 2);
    }

    #[test]
    fn test_cost_is_deterministic() {
        let counter = TokenCounter::default();
        let text = "mixed 中文 and English";
        assert_eq!(counter.cost(text), counter.cost(text));
    }
}
