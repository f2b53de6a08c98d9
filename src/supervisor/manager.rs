use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::config::Config;
use crate::error::SupervisorError;
use crate::supervisor::block::{Block, BlockEvent, BlockEventMeta, BlockEventType, BlockType, Mode, UserInput};
use crate::supervisor::danger::DangerLevel;
use crate::supervisor::engine::SpawnConfig;
use crate::supervisor::id_mapper::{self, SessionId};
use crate::supervisor::registry::Registry;
use crate::supervisor::session::{SessionEvent, SessionUnit};
use crate::supervisor::stats::StatsAccumulator;
use crate::supervisor::store::BlockStore;

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// One item of the stream `send_and_stream` hands back to the caller: the
/// live classified events (also landing in the persisted `event_stream`, in
/// the same order — spec §4.4 ordering rule) plus the turn's terminal
/// outcome.
#[derive(Debug, Clone)]
pub enum StreamItem {
    Event(BlockEvent),
    Completed {
        assistant_content: String,
        stats: StatsAccumulator,
    },
    Errored {
        message: String,
    },
}

/// Tool allowlist per mode. Evolution bypasses permissions entirely (spec
/// §4.2), so its list is never consulted; Geek additionally allows `Write`
/// over Normal's read/edit/bash set, following the teacher's per-agent
/// `permissions` vector threaded through `api/agents/chat.rs`.
fn default_allowed_tools(mode: Mode) -> Vec<String> {
    match mode {
        Mode::Normal => vec!["Read".into(), "Edit".into(), "Bash".into()],
        Mode::Geek => vec!["Read".into(), "Edit".into(), "Bash".into(), "Write".into()],
        Mode::Evolution => vec![],
    }
}

fn concat_answers(block: &Block) -> String {
    block
        .event_stream
        .iter()
        .filter(|e| matches!(e.event_type, BlockEventType::Answer))
        .map(|e| e.content.as_str())
        .collect::<Vec<_>>()
        .join("")
}

/// Orchestrates block lifecycle end to end: pending → streaming →
/// completed/error (spec §4.9 Block Manager), exposing the nine operations
/// of the caller-facing API (spec §6.2). The only component that talks to
/// both the Session Registry and the Block Store — generalizes the
/// teacher's inline `async_stream::stream! { spawn, write stdin, persist }`
/// handler in `api/agents/chat.rs` into a reusable type with the same three
/// responsibilities split into named methods.
#[derive(Clone)]
pub struct BlockManager {
    registry: Arc<Registry>,
    store: BlockStore,
    config: Config,
}

impl BlockManager {
    pub fn new(registry: Arc<Registry>, store: BlockStore, config: Config) -> Self {
        Self {
            registry,
            store,
            config,
        }
    }

    pub fn store(&self) -> &BlockStore {
        &self.store
    }

    /// Deterministically derive the SessionId for an external conversation
    /// identifier (spec §4.1, §6.2 `resolve`).
    pub fn resolve(&self, conversation_id: &str) -> SessionId {
        id_mapper::resolve(conversation_id)
    }

    fn working_dir(&self, conversation_id: &str, mode: Mode) -> PathBuf {
        let sub = match mode {
            Mode::Normal => "normal",
            Mode::Geek => "geek",
            Mode::Evolution => "evolution",
        };
        self.config
            .data_dir
            .join("workspaces")
            .join(sub)
            .join(conversation_id)
    }

    /// Obtains or lazily creates the Session Unit backing `conversation_id`
    /// at `mode` (spec §6.2 `ensure_session`). The in-process Registry does
    /// not survive a restart, so `resume` cannot be keyed off it; instead it
    /// is keyed off whether this SessionId's working directory already
    /// existed, which does survive a restart and is true exactly once this
    /// SessionId has ever been spawned before (spec §4.1 "restart
    /// survivability reduces to re-derive the same SessionId" — this is
    /// that re-derivation made concrete for the one case the engine's own
    /// catalog cannot disambiguate on its own: first-ever spawn vs. resume).
    pub async fn ensure_session(
        &self,
        conversation_id: &str,
        mode: Mode,
    ) -> Result<Arc<SessionUnit>, SupervisorError> {
        let session_id = self.resolve(conversation_id);
        let working_dir = self.working_dir(conversation_id, mode);
        let resume = working_dir.exists();
        std::fs::create_dir_all(&working_dir)?;
        let spawn_config = SpawnConfig {
            session_id,
            mode,
            working_dir,
            resume,
            allowed_tools: default_allowed_tools(mode),
            engine_binary: self.config.engine_binary.clone(),
        };
        self.registry.get_or_create(session_id, spawn_config).await
    }

    /// Creates a new block continuing `conversation_id`'s root chain (spec
    /// §4.9 `create`, §6.2 `create_block`) and appends the initial user
    /// inputs to it.
    pub async fn create_block(
        &self,
        conversation_id: String,
        mode: Mode,
        inputs: Vec<UserInput>,
    ) -> Result<Block, SupervisorError> {
        let mut block = self
            .store
            .create(conversation_id, mode, BlockType::Message, None, None)
            .await?;
        for input in inputs {
            self.store.append_user_input(block.id, input.clone()).await?;
            block.user_inputs.push(input);
        }
        Ok(block)
    }

    pub async fn append_user_input(&self, block_id: Uuid, content: String) -> Result<(), SupervisorError> {
        self.store
            .append_user_input(block_id, UserInput::new(content, now_ms()))
            .await
    }

    pub async fn fork_block(&self, parent_id: Uuid, inputs: Vec<UserInput>) -> Result<Block, SupervisorError> {
        self.store.fork(parent_id, inputs).await
    }

    pub async fn archive_block(&self, block_id: Uuid) -> Result<(), SupervisorError> {
        self.store.archive(block_id).await
    }

    pub async fn restore_block(&self, block_id: Uuid) -> Result<(), SupervisorError> {
        self.store.restore(block_id).await
    }

    pub async fn get_block(&self, block_id: Uuid) -> Result<Block, SupervisorError> {
        self.store.get_block(block_id).await
    }

    pub async fn list_blocks(
        &self,
        conversation_id: String,
        include_archived: bool,
    ) -> Result<Vec<Block>, SupervisorError> {
        self.store.list_blocks(conversation_id, include_archived).await
    }

    /// Injects `user_input` into the engine backing `block_id`'s
    /// conversation and drives the resulting event stream into the block —
    /// one append per classified event, completing or erroring the block on
    /// the terminal signal (spec §4.9 lifecycle, §6.2 `send_and_stream`).
    /// The returned channel carries the same events, in the same order,
    /// that land in the persisted `event_stream` (spec §4.4 ordering rule).
    ///
    /// In Geek mode, a `Critical` danger classification aborts the turn if
    /// `Config::geek_refuses_critical` is set (spec §4.6 — Geek "may refuse
    /// `Critical` if the caller's policy demands"); Evolution mode never
    /// refuses, only records.
    pub async fn send_and_stream(
        &self,
        conversation_id: String,
        block_id: Uuid,
        mode: Mode,
        user_input: String,
    ) -> Result<tokio::sync::mpsc::Receiver<StreamItem>, SupervisorError> {
        self.store
            .append_user_input(block_id, UserInput::new(user_input.clone(), now_ms()))
            .await?;

        let session = self.ensure_session(&conversation_id, mode).await?;
        if !matches!(mode, Mode::Normal) {
            self.store.attach_session(block_id, session.id).await?;
        }

        session.send(&user_input).await?;

        let (tx, rx) = tokio::sync::mpsc::channel(self.config.event_queue_capacity.max(1));
        let store = self.store.clone();
        let session_for_events = session.clone();
        let session_for_refusal = session.clone();
        let refuses_critical = matches!(mode, Mode::Geek) && self.config.geek_refuses_critical;

        tokio::spawn(async move {
            while let Some(event) = session_for_events.next_event().await {
                match event {
                    SessionEvent::Content(ev) => {
                        if refuses_critical && is_critical_tool_use(&ev) {
                            let message = format!("refused: critical tool_use `{}`", ev.content);
                            tracing::warn!(block_id = %block_id, "refusing critical tool_use in geek mode");
                            let _ = store.append_event(block_id, ev).await;
                            let _ = store.error(block_id, message.clone()).await;
                            session_for_refusal.terminate().await;
                            let _ = tx.send(StreamItem::Errored { message }).await;
                            return;
                        }

                        if store.append_event(block_id, ev.clone()).await.is_err() {
                            let _ = tx
                                .send(StreamItem::Errored {
                                    message: "persistence failure".to_string(),
                                })
                                .await;
                            return;
                        }
                        if tx.send(StreamItem::Event(ev)).await.is_err() {
                            return;
                        }
                    }
                    SessionEvent::Stats(stats) => {
                        let assistant_content = match store.get_block(block_id).await {
                            Ok(block) => concat_answers(&block),
                            Err(_) => String::new(),
                        };
                        let _ = store
                            .complete(block_id, assistant_content.clone(), stats.clone())
                            .await;
                        let _ = tx
                            .send(StreamItem::Completed {
                                assistant_content,
                                stats,
                            })
                            .await;
                        return;
                    }
                    SessionEvent::EngineMetadata(_) => {}
                    SessionEvent::Dead { reason } => {
                        let message = format!("engine died: {reason}");
                        let _ = store.error(block_id, message.clone()).await;
                        let _ = tx.send(StreamItem::Errored { message }).await;
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}

fn is_critical_tool_use(event: &BlockEvent) -> bool {
    matches!(event.event_type, BlockEventType::ToolUse)
        && matches!(
            &event.meta,
            BlockEventMeta::ToolUse {
                danger_level: Some(DangerLevel::Critical),
                ..
            }
        )
}
