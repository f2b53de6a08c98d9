use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Per-session accumulator of tokens, durations, tool calls, files, and
/// cost (spec §3, §4.5). Mutated exclusively by the Event Classifier
/// (single-writer); readers get a value-copy snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatsAccumulator {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cache_read_tokens: u32,
    pub cache_write_tokens: u32,
    pub tool_call_count: u32,
    pub files_modified: u32,
    pub total_duration_ms: u64,
    pub thinking_duration_ms: u64,
    pub tool_duration_ms: u64,
    pub generation_duration_ms: u64,
    /// Integer milli-cents (spec §6.3, §9 Open Question #3) — the
    /// persistence-layer unit. The engine's `result` message reports
    /// floating dollars; the classifier converts at the boundary.
    pub total_cost_milli_cents: i64,
    pub tools_used: HashSet<String>,
    pub file_paths: Vec<String>,
}

impl StatsAccumulator {
    pub fn total_tokens(&self) -> u32 {
        self.input_tokens
            .saturating_add(self.output_tokens)
            .saturating_add(self.cache_read_tokens)
            .saturating_add(self.cache_write_tokens)
    }

    /// Records one `tool_use` event into the running totals. `file_path` is
    /// supplied when the tool operated on a path-addressable resource (the
    /// classifier extracts it from the tool's serialised input).
    pub fn record_tool_use(&mut self, tool_name: &str, file_path: Option<&str>) {
        self.tool_call_count += 1;
        self.tools_used.insert(tool_name.to_string());
        if let Some(path) = file_path {
            self.files_modified += 1;
            self.file_paths.push(path.to_string());
        }
    }

    /// Replaces the estimated totals with the engine's authoritative
    /// `result` totals (spec §4.5, §9 Open Question #2: trust `result` on
    /// completion, wall-clock estimates are for intermediate UI only).
    pub fn apply_result(
        &mut self,
        input_tokens: u32,
        output_tokens: u32,
        cache_read_tokens: u32,
        cache_write_tokens: u32,
        total_duration_ms: u64,
        total_cost_usd: f64,
    ) {
        self.input_tokens = input_tokens;
        self.output_tokens = output_tokens;
        self.cache_read_tokens = cache_read_tokens;
        self.cache_write_tokens = cache_write_tokens;
        self.total_duration_ms = total_duration_ms;
        self.total_cost_milli_cents = (total_cost_usd * 100_000.0).round() as i64;
    }
}

/// Thread-safe handle a Session Unit hands to its classifier (writer) and
/// to callers of `stats_snapshot()` (readers). Short critical sections
/// only — never held across an `.await` on the engine pipes.
#[derive(Clone, Default)]
pub struct StatsCollector {
    inner: Arc<RwLock<StatsAccumulator>>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> StatsAccumulator {
        self.inner.read().await.clone()
    }

    pub async fn mutate(&self, f: impl FnOnce(&mut StatsAccumulator)) {
        let mut guard = self.inner.write().await;
        f(&mut guard);
    }
}
