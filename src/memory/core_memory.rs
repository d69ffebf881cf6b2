//! 核心记忆块：永不驱逐、始终随上下文发送的若干有界文本段（默认 persona / human）
//!
//! 只能通过 append / replace 修改；任何失败都保持原内容不变。

use serde::{Deserialize, Serialize};

/// 段配置：名称、字符上限、初始内容
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SectionSpec {
    pub name: String,
    pub cap_chars: usize,
    #[serde(default)]
    pub default_content: String,
}

impl SectionSpec {
    pub fn new(name: impl Into<String>, cap_chars: usize, default_content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cap_chars,
            default_content: default_content.into(),
        }
    }
}

/// 默认两段：persona 与 human，各 2000 字符
pub fn default_sections() -> Vec<SectionSpec> {
    vec![
        SectionSpec::new(
            "persona",
            2000,
            "I am a helpful assistant with a long-term memory. I keep important facts in core memory.",
        ),
        SectionSpec::new("human", 2000, "First name: unknown"),
    ]
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoreMemoryError {
    #[error("Unknown core memory section: {0}")]
    UnknownSection(String),

    #[error("Section '{section}' would hold {attempted} chars, cap is {cap}")]
    CapacityExceeded {
        section: String,
        cap: usize,
        attempted: usize,
    },

    #[error("Text to replace not found in section '{section}'")]
    NotFound { section: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Section {
    spec: SectionSpec,
    content: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CoreMemoryBlock {
    sections: Vec<Section>,
}

impl CoreMemoryBlock {
    pub fn new(specs: Vec<SectionSpec>) -> Self {
        let sections = specs
            .into_iter()
            .map(|spec| Section {
                content: spec.default_content.clone(),
                spec,
            })
            .collect();
        Self { sections }
    }

    fn section_mut(&mut self, name: &str) -> Result<&mut Section, CoreMemoryError> {
        self.sections
            .iter_mut()
            .find(|s| s.spec.name == name)
            .ok_or_else(|| CoreMemoryError::UnknownSection(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.sections
            .iter()
            .find(|s| s.spec.name == name)
            .map(|s| s.content.as_str())
    }

    /// 追加文本（非空段以换行分隔）；超出上限直接拒绝，不截断
    pub fn append(&mut self, name: &str, text: &str) -> Result<(), CoreMemoryError> {
        let section = self.section_mut(name)?;
        let next = if section.content.is_empty() {
            text.to_string()
        } else {
            format!("{}\n{}", section.content, text)
        };
        check_cap(section, &next)?;
        section.content = next;
        Ok(())
    }

    /// 替换第一处逐字匹配的 old
    pub fn replace(&mut self, name: &str, old: &str, new: &str) -> Result<(), CoreMemoryError> {
        let section = self.section_mut(name)?;
        if old.is_empty() || !section.content.contains(old) {
            return Err(CoreMemoryError::NotFound {
                section: name.to_string(),
            });
        }
        let next = section.content.replacen(old, new, 1);
        check_cap(section, &next)?;
        section.content = next;
        Ok(())
    }

    /// 按配置顺序返回 (段名, 内容)
    pub fn snapshot(&self) -> Vec<(String, String)> {
        self.sections
            .iter()
            .map(|s| (s.spec.name.clone(), s.content.clone()))
            .collect()
    }

    /// 从快照恢复内容；快照中未知的段被忽略，超出上限的内容被拒绝
    pub fn restore(&mut self, snapshot: &[(String, String)]) -> Result<(), CoreMemoryError> {
        for (name, content) in snapshot {
            if let Ok(section) = self.section_mut(name) {
                check_cap(section, content)?;
                section.content = content.clone();
            }
        }
        Ok(())
    }

    pub fn reset(&mut self) {
        for s in &mut self.sections {
            s.content = s.spec.default_content.clone();
        }
    }

    /// 渲染为系统提示中的核心记忆段
    pub fn to_prompt_section(&self) -> String {
        let mut out = String::from("## Core Memory\n");
        for s in &self.sections {
            out.push_str(&format!(
                "<{name} chars=\"{len}/{cap}\">\n{content}\n</{name}>\n",
                name = s.spec.name,
                len = s.content.chars().count(),
                cap = s.spec.cap_chars,
                content = s.content,
            ));
        }
        out
    }
}

fn check_cap(section: &Section, next: &str) -> Result<(), CoreMemoryError> {
    let attempted = next.chars().count();
    if attempted > section.spec.cap_chars {
        return Err(CoreMemoryError::CapacityExceeded {
            section: section.spec.name.clone(),
            cap: section.spec.cap_chars,
            attempted,
        });
    }
    Ok(())
}

impl Default for CoreMemoryBlock {
    fn default() -> Self {
        Self::new(default_sections())
    }
}
