use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::supervisor::danger::DangerLevel;
use crate::supervisor::id_mapper::SessionId;
use crate::supervisor::stats::StatsAccumulator;

/// Per-block enumeration recorded at creation, selecting spawn parameters
/// and policy (spec GLOSSARY, §4.2). Never mutated after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Normal,
    Geek,
    Evolution,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    Message,
    ContextSeparator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockStatus {
    Pending,
    Streaming,
    Completed,
    Error,
}

impl BlockStatus {
    /// A block in `Completed` or `Error` is immutable except for archival
    /// and user feedback (spec §3 invariant).
    pub fn is_terminal(self) -> bool {
        matches!(self, BlockStatus::Completed | BlockStatus::Error)
    }
}

/// The closed set of BlockEvent type tags the Classifier emits (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockEventType {
    Thinking,
    ToolUse,
    ToolResult,
    Answer,
    Error,
}

/// Per-type metadata for a BlockEvent. `None` covers `thinking`/`answer`/
/// `error`, which carry only `content` and an optional `duration_ms`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockEventMeta {
    None,
    ToolUse {
        tool_name: String,
        tool_id: String,
        input_summary: String,
        /// [ADD] danger classification computed at classify time (spec §3
        /// ADD note) — not in the original distillation's meta table, but
        /// the only place a Danger Detector verdict can land.
        #[serde(skip_serializing_if = "Option::is_none")]
        danger_level: Option<DangerLevel>,
    },
    ToolResult {
        tool_id: String,
        is_error: bool,
        output_summary: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        file_path: Option<String>,
    },
}

/// One append-only entry in a Block's `event_stream`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockEvent {
    pub event_type: BlockEventType,
    pub content: String,
    pub timestamp_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default = "default_meta")]
    pub meta: BlockEventMeta,
}

fn default_meta() -> BlockEventMeta {
    BlockEventMeta::None
}

impl BlockEvent {
    pub fn new(event_type: BlockEventType, content: impl Into<String>, timestamp_ms: i64) -> Self {
        Self {
            event_type,
            content: content.into(),
            timestamp_ms,
            duration_ms: None,
            meta: BlockEventMeta::None,
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_meta(mut self, meta: BlockEventMeta) -> Self {
        self.meta = meta;
        self
    }
}

/// One entry in a Block's append-only `user_inputs` sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInput {
    pub content: String,
    pub timestamp_ms: i64,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl UserInput {
    pub fn new(content: impl Into<String>, timestamp_ms: i64) -> Self {
        Self {
            content: content.into(),
            timestamp_ms,
            metadata: serde_json::Value::Null,
        }
    }
}

/// One persisted round of a conversation: user inputs, the classified
/// event stream, and the final assistant text/stats (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub id: Uuid,
    pub uid: String,
    pub conversation_id: String,
    pub round_number: i64,
    pub block_type: BlockType,
    pub mode: Mode,
    pub user_inputs: Vec<UserInput>,
    pub assistant_content: String,
    pub event_stream: Vec<BlockEvent>,
    pub session_stats: Option<StatsAccumulator>,
    pub cc_session_id: Option<SessionId>,
    pub status: BlockStatus,
    pub parent_block_id: Option<Uuid>,
    pub branch_path: String,
    pub created_ts_ms: i64,
    pub updated_ts_ms: i64,
    pub error_message: Option<String>,
    pub archived_at: Option<i64>,
}

/// Generates the short, externally-visible `uid` — an 8-character slice of
/// a fresh v4 UUID's hex, following the teacher's short-id convention used
/// for flow-run IDs (`Uuid::new_v4().simple().to_string()[..8]`).
pub fn new_uid() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_status_terminal_classification() {
        assert!(!BlockStatus::Pending.is_terminal());
        assert!(!BlockStatus::Streaming.is_terminal());
        assert!(BlockStatus::Completed.is_terminal());
        assert!(BlockStatus::Error.is_terminal());
    }

    #[test]
    fn new_uid_is_eight_hex_chars() {
        let uid = new_uid();
        assert_eq!(uid.len(), 8);
        assert!(uid.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn block_event_builders_compose() {
        let ev = BlockEvent::new(BlockEventType::ToolUse, "ran Bash", 1_000)
            .with_duration(42)
            .with_meta(BlockEventMeta::ToolUse {
                tool_name: "Bash".into(),
                tool_id: "tool-1".into(),
                input_summary: "ls -la".into(),
                danger_level: Some(DangerLevel::Low),
            });
        assert_eq!(ev.duration_ms, Some(42));
        assert!(matches!(ev.meta, BlockEventMeta::ToolUse { .. }));
    }

    #[test]
    fn block_event_roundtrips_through_json() {
        let ev = BlockEvent::new(BlockEventType::Answer, "hi", 5).with_duration(10);
        let json = serde_json::to_string(&ev).unwrap();
        let back: BlockEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.content, "hi");
        assert_eq!(back.duration_ms, Some(10));
        assert!(matches!(back.event_type, BlockEventType::Answer));
    }
}
