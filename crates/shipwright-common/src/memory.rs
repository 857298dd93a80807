use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::Phase;

/// Classification of a memory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    Insight,
    Failure,
    Decision,
    Constraint,
}

impl MemoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insight => "insight",
            Self::Failure => "failure",
            Self::Decision => "decision",
            Self::Constraint => "constraint",
        }
    }
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemoryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insight" => Ok(Self::Insight),
            "failure" => Ok(Self::Failure),
            "decision" => Ok(Self::Decision),
            "constraint" => Ok(Self::Constraint),
            _ => Err(format!("Invalid memory kind: {}", s)),
        }
    }
}

/// A phase-tagged note threaded into every later phase's context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub phase: Phase,
    pub kind: MemoryKind,
    pub content: String,
}

impl MemoryRecord {
    pub fn new(phase: Phase, kind: MemoryKind, content: impl Into<String>) -> Self {
        Self {
            phase,
            kind,
            content: content.into(),
        }
    }
}

/// Render memories as a prompt section. Every record is included, in order.
pub fn render_memories(memories: &[MemoryRecord]) -> String {
    if memories.is_empty() {
        return "No memories recorded by earlier phases.".to_string();
    }
    memories
        .iter()
        .map(|m| format!("- [{}/{}] {}", m.phase, m.kind, m.content))
        .collect::<Vec<_>>()
        .join("\n")
}
