use serde_json::Value;

use crate::supervisor::block::{BlockEvent, BlockEventMeta, BlockEventType};
use crate::supervisor::danger;
use crate::supervisor::stats::{StatsAccumulator, StatsCollector};

/// Maximum recursion depth when descending into `assistant`/`user`
/// container content blocks (spec §4.4 ADD — unknown/deeply nested content
/// must never cause unbounded recursion).
const MAX_DEPTH: u8 = 8;

/// Truncates text to roughly `limit` chars, breaking at a word boundary,
/// mirroring the teacher's `make_summary` helper in `api/agents/chat.rs`.
fn truncate_summary(text: &str, limit: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= limit {
        return trimmed.to_string();
    }
    let truncated: String = trimmed.chars().take(limit).collect();
    let boundary = truncated.rfind(' ').unwrap_or(truncated.len());
    format!("{}...", &truncated[..boundary])
}

/// Engine metadata surfaced by a `system`/`init` control message (spec
/// §4.4 — recorded into the Session Unit, never appended to the event
/// stream).
#[derive(Debug, Clone, Default)]
pub struct EngineMetadata {
    pub version: Option<String>,
    pub model: Option<String>,
    pub tools: Vec<String>,
}

/// What the classifier produced for one input frame.
pub enum ClassifyOutcome {
    /// A control message that carries no downstream emission.
    Swallowed,
    /// `system`/`init` — recorded onto the Session Unit, not the block.
    Metadata(EngineMetadata),
    /// Emit to the caller and append to the block's `event_stream`.
    Content(BlockEvent),
    /// Terminal `result` — a stats snapshot surfaced to the caller as a
    /// notification, but *not* appended to `event_stream` (spec §4.4).
    Result(StatsAccumulator),
}

/// One content event extracted from the raw frame, before duration/stats
/// bookkeeping is applied. Intermediate shape shared by direct events and
/// events recovered from `assistant`/`user` containers.
enum RawEvent {
    Thinking(String),
    ToolUse {
        name: String,
        id: String,
        input: Value,
    },
    ToolResult {
        id: String,
        is_error: bool,
        output: String,
        file_path: Option<String>,
    },
    Answer(String),
    Error(String),
}

/// Pure extraction: turns one frame's `type` + body into zero or more
/// [`RawEvent`]s, recursing into container types. Never panics on
/// malformed input — missing fields degrade to empty strings.
fn extract(ty: &str, raw: &Value, depth: u8) -> Vec<RawEvent> {
    if depth > MAX_DEPTH {
        return Vec::new();
    }
    match ty {
        "thinking" | "status" => {
            let text = raw
                .get("text")
                .or_else(|| raw.get("content"))
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            vec![RawEvent::Thinking(text)]
        }
        "tool_use" => vec![RawEvent::ToolUse {
            name: raw
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("?")
                .to_string(),
            id: raw
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            input: raw.get("input").cloned().unwrap_or(Value::Null),
        }],
        "tool_result" => vec![RawEvent::ToolResult {
            id: raw
                .get("tool_id")
                .or_else(|| raw.get("id"))
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            is_error: raw
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            output: extract_text_ish(raw.get("content").or_else(|| raw.get("output"))),
            file_path: raw
                .get("file_path")
                .or_else(|| raw.get("path"))
                .and_then(Value::as_str)
                .map(str::to_string),
        }],
        "assistant" => raw
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(Value::as_array)
            .map(|blocks| {
                blocks
                    .iter()
                    .flat_map(|b| {
                        let block_type = b.get("type").and_then(Value::as_str).unwrap_or("");
                        match block_type {
                            "text" => vec![RawEvent::Answer(
                                b.get("text").and_then(Value::as_str).unwrap_or("").to_string(),
                            )],
                            "tool_use" => extract("tool_use", b, depth + 1),
                            _ => Vec::new(),
                        }
                    })
                    .collect()
            })
            .unwrap_or_default(),
        "user" => raw
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(Value::as_array)
            .map(|blocks| {
                blocks
                    .iter()
                    .flat_map(|b| {
                        let block_type = b.get("type").and_then(Value::as_str).unwrap_or("");
                        match block_type {
                            "tool_result" => extract("tool_result", b, depth + 1),
                            _ => Vec::new(),
                        }
                    })
                    .collect()
            })
            .unwrap_or_default(),
        "answer" => vec![RawEvent::Answer(
            raw.get("text").and_then(Value::as_str).unwrap_or("").to_string(),
        )],
        "error" => vec![RawEvent::Error(
            raw.get("message")
                .or_else(|| raw.get("text"))
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        )],
        _ => {
            tracing::warn!(frame_type = ty, "unknown event type, best-effort extraction");
            vec![RawEvent::Answer(extract_text_ish(Some(raw)))]
        }
    }
}

/// Best-effort text extraction for unknown/partial frames: prefers a
/// `text` field, then a string `content`, then a compact JSON dump.
fn extract_text_ish(value: Option<&Value>) -> String {
    match value {
        Some(v) if v.is_string() => v.as_str().unwrap_or("").to_string(),
        Some(v) => v
            .get("text")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| serde_json::to_string(v).unwrap_or_default()),
        None => String::new(),
    }
}

/// Wall-clock phase used to attribute the gap between consecutive content
/// events (spec §4.4 duration accounting).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Thinking,
    Tool,
    Generation,
}

/// Stateful half of the Event Classifier: owns the duration state machine
/// and drives the Stats Collector. One instance per Session Unit, fed
/// frames in arrival order — never shared across sessions.
pub struct ClassifierState {
    phase: Phase,
    last_event_ms: Option<i64>,
}

impl Default for ClassifierState {
    fn default() -> Self {
        Self {
            phase: Phase::Thinking,
            last_event_ms: None,
        }
    }
}

impl ClassifierState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the elapsed time since the previous content event to whichever
    /// duration bucket `self.phase` currently names, then advances the
    /// clock. Call *before* changing `self.phase` for the new event.
    async fn attribute_gap(&mut self, now_ms: i64, stats: &StatsCollector) {
        if let Some(last) = self.last_event_ms {
            let gap = now_ms.saturating_sub(last).max(0) as u64;
            stats
                .mutate(|s| match self.phase {
                    Phase::Thinking => s.thinking_duration_ms += gap,
                    Phase::Tool => s.tool_duration_ms += gap,
                    Phase::Generation => s.generation_duration_ms += gap,
                })
                .await;
        }
        self.last_event_ms = Some(now_ms);
    }

    /// Classifies one framed JSON message, driving stats and phase
    /// transitions as a side effect. `now_ms` is the wall-clock timestamp
    /// the frame was observed at (used only for duration accounting — the
    /// authoritative duration total comes from the `result` message).
    pub async fn classify(&mut self, raw: &Value, now_ms: i64, stats: &StatsCollector) -> Vec<ClassifyOutcome> {
        let ty = raw.get("type").and_then(Value::as_str).unwrap_or("");

        if ty == "system" {
            let subtype = raw.get("subtype").and_then(Value::as_str).unwrap_or("");
            if subtype == "init" {
                let meta = EngineMetadata {
                    version: raw
                        .get("version")
                        .or_else(|| raw.get("claude_code_version"))
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    model: raw.get("model").and_then(Value::as_str).map(str::to_string),
                    tools: raw
                        .get("tools")
                        .and_then(Value::as_array)
                        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                        .unwrap_or_default(),
                };
                return vec![ClassifyOutcome::Metadata(meta)];
            }
            return vec![ClassifyOutcome::Swallowed];
        }

        if ty == "result" {
            self.attribute_gap(now_ms, stats).await;
            let usage = raw.get("usage");
            let get_u32 = |field: &str| {
                usage
                    .and_then(|u| u.get(field))
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as u32
            };
            let duration_ms = raw.get("duration_ms").and_then(Value::as_u64).unwrap_or(0);
            let cost_usd = raw.get("total_cost_usd").and_then(Value::as_f64).unwrap_or(0.0);

            stats
                .mutate(|s| {
                    s.apply_result(
                        get_u32("input_tokens"),
                        get_u32("output_tokens"),
                        get_u32("cache_read_input_tokens"),
                        get_u32("cache_creation_input_tokens"),
                        duration_ms,
                        cost_usd,
                    )
                })
                .await;

            return vec![ClassifyOutcome::Result(stats.snapshot().await)];
        }

        let raw_events = extract(ty, raw, 0);
        let mut outcomes = Vec::with_capacity(raw_events.len());
        for ev in raw_events {
            outcomes.push(self.classify_one(ev, now_ms, stats).await);
        }
        outcomes
    }

    async fn classify_one(&mut self, ev: RawEvent, now_ms: i64, stats: &StatsCollector) -> ClassifyOutcome {
        match ev {
            RawEvent::Thinking(text) => {
                self.attribute_gap(now_ms, stats).await;
                ClassifyOutcome::Content(BlockEvent::new(BlockEventType::Thinking, text, now_ms))
            }
            RawEvent::ToolUse { name, id, input } => {
                self.attribute_gap(now_ms, stats).await;
                self.phase = Phase::Tool;

                let serialized_input = input
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| serde_json::to_string(&input).unwrap_or_default());
                // Classify against the full serialized input — a pattern
                // (`rm -rf`, `curl|sh`, ...) past the display truncation
                // point must still be caught.
                let danger_level = danger::classify(&name, &serialized_input);
                let input_summary = truncate_summary(&serialized_input, 200);
                let file_path = input
                    .get("file_path")
                    .or_else(|| input.get("path"))
                    .and_then(Value::as_str)
                    .map(str::to_string);

                stats
                    .mutate(|s| s.record_tool_use(&name, file_path.as_deref()))
                    .await;

                let event = BlockEvent::new(BlockEventType::ToolUse, format!("{name}({input_summary})"), now_ms)
                    .with_meta(BlockEventMeta::ToolUse {
                        tool_name: name,
                        tool_id: id,
                        input_summary,
                        danger_level: Some(danger_level),
                    });
                ClassifyOutcome::Content(event)
            }
            RawEvent::ToolResult { id, is_error, output, file_path } => {
                self.attribute_gap(now_ms, stats).await;
                self.phase = Phase::Thinking;

                let output_summary = truncate_summary(&output, 500);
                let event = BlockEvent::new(BlockEventType::ToolResult, output_summary.clone(), now_ms)
                    .with_meta(BlockEventMeta::ToolResult {
                        tool_id: id,
                        is_error,
                        output_summary,
                        file_path,
                    });
                ClassifyOutcome::Content(event)
            }
            RawEvent::Answer(text) => {
                self.attribute_gap(now_ms, stats).await;
                self.phase = Phase::Generation;
                ClassifyOutcome::Content(BlockEvent::new(BlockEventType::Answer, text, now_ms))
            }
            RawEvent::Error(message) => {
                self.attribute_gap(now_ms, stats).await;
                ClassifyOutcome::Content(BlockEvent::new(BlockEventType::Error, message, now_ms))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn classify_one(value: Value, now_ms: i64) -> (Vec<ClassifyOutcome>, StatsCollector) {
        let stats = StatsCollector::new();
        let mut state = ClassifierState::new();
        let outcomes = state.classify(&value, now_ms, &stats).await;
        (outcomes, stats)
    }

    #[tokio::test]
    async fn system_init_is_swallowed_but_captures_metadata() {
        let (outcomes, _) = classify_one(
            json!({"type": "system", "subtype": "init", "model": "claude-x", "tools": ["Bash"]}),
            1,
        )
        .await;
        assert_eq!(outcomes.len(), 1);
        match &outcomes[0] {
            ClassifyOutcome::Metadata(meta) => {
                assert_eq!(meta.model.as_deref(), Some("claude-x"));
                assert_eq!(meta.tools, vec!["Bash".to_string()]);
            }
            _ => panic!("expected Metadata outcome"),
        }
    }

    #[tokio::test]
    async fn system_non_init_is_silently_swallowed() {
        let (outcomes, _) = classify_one(json!({"type": "system", "subtype": "other"}), 1).await;
        assert!(matches!(outcomes[0], ClassifyOutcome::Swallowed));
    }

    #[tokio::test]
    async fn result_produces_stats_snapshot_not_content() {
        let (outcomes, _) = classify_one(
            json!({
                "type": "result",
                "duration_ms": 500,
                "total_cost_usd": 0.01,
                "usage": {"input_tokens": 10, "output_tokens": 4}
            }),
            1_000,
        )
        .await;
        assert_eq!(outcomes.len(), 1);
        match &outcomes[0] {
            ClassifyOutcome::Result(stats) => {
                assert_eq!(stats.total_tokens(), 14);
                assert_eq!(stats.total_duration_ms, 500);
            }
            _ => panic!("expected Result outcome"),
        }
    }

    #[tokio::test]
    async fn tool_use_emits_with_danger_level() {
        let (outcomes, stats) = classify_one(
            json!({"type": "tool_use", "name": "Bash", "id": "t1", "input": "rm -rf /"}),
            1,
        )
        .await;
        match &outcomes[0] {
            ClassifyOutcome::Content(ev) => {
                assert!(matches!(ev.event_type, BlockEventType::ToolUse));
                match &ev.meta {
                    BlockEventMeta::ToolUse { danger_level, .. } => {
                        assert_eq!(*danger_level, Some(danger::DangerLevel::Critical));
                    }
                    _ => panic!("expected ToolUse meta"),
                }
            }
            _ => panic!("expected Content outcome"),
        }
        assert_eq!(stats.snapshot().await.tool_call_count, 1);
    }

    #[tokio::test]
    async fn danger_classification_sees_past_the_200_char_display_truncation() {
        // `rm -rf /` sits well past the 200-char point where `input_summary`
        // gets truncated for display — classification must still catch it.
        let padding = "x".repeat(220);
        let input = format!("echo {padding}; rm -rf /");
        let (outcomes, _) = classify_one(
            json!({"type": "tool_use", "name": "Bash", "id": "t1", "input": input}),
            1,
        )
        .await;
        match &outcomes[0] {
            ClassifyOutcome::Content(ev) => match &ev.meta {
                BlockEventMeta::ToolUse {
                    danger_level,
                    input_summary,
                    ..
                } => {
                    assert_eq!(*danger_level, Some(danger::DangerLevel::Critical));
                    assert!(input_summary.len() <= 201);
                }
                _ => panic!("expected ToolUse meta"),
            },
            _ => panic!("expected Content outcome"),
        }
    }

    #[tokio::test]
    async fn assistant_container_recurses_into_text_and_tool_use() {
        let (outcomes, _) = classify_one(
            json!({
                "type": "assistant",
                "message": {"content": [
                    {"type": "text", "text": "Hello"},
                    {"type": "tool_use", "name": "Read", "id": "t2", "input": {"file_path": "a.rs"}}
                ]}
            }),
            1,
        )
        .await;
        assert_eq!(outcomes.len(), 2);
        assert!(matches!(
            outcomes[0],
            ClassifyOutcome::Content(ref ev) if matches!(ev.event_type, BlockEventType::Answer)
        ));
        assert!(matches!(
            outcomes[1],
            ClassifyOutcome::Content(ref ev) if matches!(ev.event_type, BlockEventType::ToolUse)
        ));
    }

    #[tokio::test]
    async fn user_container_recurses_into_tool_result() {
        let (outcomes, _) = classify_one(
            json!({
                "type": "user",
                "message": {"content": [
                    {"type": "tool_result", "tool_id": "t2", "content": "ok"}
                ]}
            }),
            1,
        )
        .await;
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(
            outcomes[0],
            ClassifyOutcome::Content(ref ev) if matches!(ev.event_type, BlockEventType::ToolResult)
        ));
    }

    #[tokio::test]
    async fn tool_result_carries_file_path_when_present() {
        let (outcomes, _) = classify_one(
            json!({"type": "tool_result", "tool_id": "t1", "content": "wrote file", "file_path": "src/lib.rs"}),
            1,
        )
        .await;
        match &outcomes[0] {
            ClassifyOutcome::Content(ev) => match &ev.meta {
                BlockEventMeta::ToolResult { file_path, .. } => {
                    assert_eq!(file_path.as_deref(), Some("src/lib.rs"));
                }
                _ => panic!("expected ToolResult meta"),
            },
            _ => panic!("expected Content outcome"),
        }
    }

    #[tokio::test]
    async fn unknown_type_is_lossless_best_effort_answer() {
        let (outcomes, _) = classify_one(json!({"type": "narrate", "text": "once upon a time"}), 1).await;
        assert_eq!(outcomes.len(), 1);
        match &outcomes[0] {
            ClassifyOutcome::Content(ev) => {
                assert!(matches!(ev.event_type, BlockEventType::Answer));
                assert_eq!(ev.content, "once upon a time");
            }
            _ => panic!("expected Content outcome"),
        }
    }

    #[tokio::test]
    async fn duration_accounting_never_exceeds_total_by_much() {
        let stats = StatsCollector::new();
        let mut state = ClassifierState::new();
        state.classify(&json!({"type": "thinking", "text": "hm"}), 1_000_100, &stats).await;
        state.classify(&json!({"type": "tool_use", "name": "Bash", "id": "t1", "input": "ls"}), 1_000_150, &stats).await;
        state
            .classify(&json!({"type": "tool_result", "tool_id": "t1", "content": "ok"}), 1_000_200, &stats)
            .await;
        state.classify(&json!({"type": "answer", "text": "done"}), 1_000_300, &stats).await;
        state
            .classify(
                &json!({"type": "result", "duration_ms": 500, "total_cost_usd": 0.0, "usage": {}}),
                1_000_350,
            )
            .await;

        let snap = stats.snapshot().await;
        let sum = snap.thinking_duration_ms + snap.tool_duration_ms + snap.generation_duration_ms;
        assert!(sum <= snap.total_duration_ms + 250);
    }

    #[test]
    fn truncate_summary_breaks_at_word_boundary() {
        let long = "a ".repeat(200);
        let out = truncate_summary(&long, 10);
        assert!(out.ends_with("..."));
        assert!(out.len() <= 14);
    }

    #[test]
    fn extract_never_panics_on_deeply_nested_garbage() {
        let mut nested = json!({"type": "assistant", "message": {"content": []}});
        for _ in 0..20 {
            nested = json!({"type": "assistant", "message": {"content": [nested]}});
        }
        let _ = extract("assistant", &nested, 0);
    }
}
