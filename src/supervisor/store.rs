use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

use crate::error::SupervisorError;
use crate::supervisor::block::{Block, BlockEvent, BlockStatus, BlockType, Mode, UserInput};
use crate::supervisor::stats::StatsAccumulator;

const MAX_CONFLICT_ATTEMPTS: u32 = 3;

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn is_conflict(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn row_to_block(row: &Row<'_>) -> rusqlite::Result<Block> {
    let id: String = row.get("id")?;
    let parent_block_id: Option<String> = row.get("parent_block_id")?;
    let cc_session_id: Option<String> = row.get("cc_session_id")?;
    let block_type: String = row.get("block_type")?;
    let mode: String = row.get("mode")?;
    let status: String = row.get("status")?;
    let user_inputs: String = row.get("user_inputs")?;
    let event_stream: String = row.get("event_stream")?;
    let session_stats: Option<String> = row.get("session_stats")?;

    let to_serde_err = |e: serde_json::Error| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    };

    Ok(Block {
        id: Uuid::parse_str(&id).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?,
        uid: row.get("uid")?,
        conversation_id: row.get("conversation_id")?,
        round_number: row.get("round_number")?,
        block_type: serde_json::from_str(&block_type).map_err(to_serde_err)?,
        mode: serde_json::from_str(&mode).map_err(to_serde_err)?,
        user_inputs: serde_json::from_str(&user_inputs).map_err(to_serde_err)?,
        assistant_content: row.get("assistant_content")?,
        event_stream: serde_json::from_str(&event_stream).map_err(to_serde_err)?,
        session_stats: session_stats
            .map(|s| serde_json::from_str(&s).map_err(to_serde_err))
            .transpose()?,
        cc_session_id: cc_session_id
            .map(|s| {
                Uuid::parse_str(&s).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
                })
            })
            .transpose()?,
        status: serde_json::from_str(&status).map_err(to_serde_err)?,
        parent_block_id: parent_block_id
            .map(|s| {
                Uuid::parse_str(&s).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
                })
            })
            .transpose()?,
        branch_path: row.get("branch_path")?,
        created_ts_ms: row.get("created_ts_ms")?,
        updated_ts_ms: row.get("updated_ts_ms")?,
        error_message: row.get("error_message")?,
        archived_at: row.get("archived_at")?,
    })
}

fn fetch_block(conn: &Connection, id: Uuid) -> Result<Block, SupervisorError> {
    conn.query_row("SELECT * FROM blocks WHERE id = ?1", [id.to_string()], row_to_block)
        .optional()?
        .ok_or_else(|| SupervisorError::BlockNotFound(id.to_string()))
}

/// Append-only persistence of conversation Blocks (spec §4.9, §6.3).
/// `rusqlite::Connection` is `Send` but not `Sync`, so it is kept behind a
/// `std::sync::Mutex` the way `agtrace-index::Database` wraps its own
/// connection; every public method hops onto a blocking thread via
/// `spawn_blocking` so callers never stall the async runtime on sqlite IO,
/// following the `Arc<Mutex<Connection>>` + `spawn_blocking` pattern this
/// pack's other session-store implementations document.
#[derive(Clone)]
pub struct BlockStore {
    conn: Arc<Mutex<Connection>>,
}

impl BlockStore {
    pub fn open(path: &Path) -> Result<Self, SupervisorError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, SupervisorError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, SupervisorError> {
        Self::init_schema(&conn)?;
        Self::migrate_legacy_second_timestamps(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), SupervisorError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS blocks (
                id TEXT PRIMARY KEY,
                uid TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                round_number INTEGER NOT NULL,
                block_type TEXT NOT NULL,
                mode TEXT NOT NULL,
                user_inputs TEXT NOT NULL DEFAULT '[]',
                assistant_content TEXT NOT NULL DEFAULT '',
                event_stream TEXT NOT NULL DEFAULT '[]',
                session_stats TEXT,
                cc_session_id TEXT,
                status TEXT NOT NULL,
                parent_block_id TEXT,
                branch_path TEXT NOT NULL,
                created_ts_ms INTEGER NOT NULL,
                updated_ts_ms INTEGER NOT NULL,
                error_message TEXT,
                archived_at INTEGER,
                UNIQUE(conversation_id, round_number, branch_path)
            );

            CREATE INDEX IF NOT EXISTS idx_blocks_conv_round ON blocks(conversation_id, round_number);
            CREATE INDEX IF NOT EXISTS idx_blocks_status ON blocks(status);
            CREATE INDEX IF NOT EXISTS idx_blocks_mode ON blocks(mode);
            CREATE INDEX IF NOT EXISTS idx_blocks_cc_session ON blocks(cc_session_id);
            CREATE INDEX IF NOT EXISTS idx_blocks_parent ON blocks(parent_block_id);
            CREATE INDEX IF NOT EXISTS idx_blocks_archived ON blocks(archived_at);
            "#,
        )?;
        Ok(())
    }

    /// Rewrites any pre-existing second-granularity timestamp (under
    /// 10_000_000_000, i.e. before the year 2286 in milliseconds but long
    /// past it in seconds) to milliseconds, once, at open time.
    fn migrate_legacy_second_timestamps(conn: &Connection) -> Result<(), SupervisorError> {
        conn.execute(
            "UPDATE blocks SET created_ts_ms = created_ts_ms * 1000 WHERE created_ts_ms < 10000000000",
            [],
        )?;
        conn.execute(
            "UPDATE blocks SET updated_ts_ms = updated_ts_ms * 1000 WHERE updated_ts_ms < 10000000000",
            [],
        )?;
        Ok(())
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, SupervisorError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, SupervisorError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().expect("block store mutex poisoned");
            f(&guard)
        })
        .await
        .map_err(|e| SupervisorError::PersistenceFailure(format!("blocking task panicked: {e}")))?
    }

    /// Creates a new block, computing `round_number`/`branch_path` per spec
    /// §4.9 Round numbering in priority order: an explicit
    /// `round_number` always wins (rule #1, used for branching — callers
    /// that already know the target round, e.g. replaying an import);
    /// otherwise a `parent_block_id` continues that parent's own branch one
    /// round further (rule #2) — use [`BlockStore::fork`] to start a *new*
    /// branch instead; otherwise the conversation's root chain is extended
    /// (rule #3).
    pub async fn create(
        &self,
        conversation_id: String,
        mode: Mode,
        block_type: BlockType,
        parent_block_id: Option<Uuid>,
        explicit_round_number: Option<i64>,
    ) -> Result<Block, SupervisorError> {
        self.with_conn(move |conn| {
            for attempt in 0..MAX_CONFLICT_ATTEMPTS {
                let (round_number, branch_path) = if let Some(round_number) = explicit_round_number {
                    let branch_path = match parent_block_id {
                        Some(parent_id) => fetch_block(conn, parent_id)?.branch_path,
                        None => "0".to_string(),
                    };
                    (round_number, branch_path)
                } else if let Some(parent_id) = parent_block_id {
                    let parent = fetch_block(conn, parent_id)?;
                    (parent.round_number + 1, parent.branch_path)
                } else {
                    let max_round: Option<i64> = conn.query_row(
                        "SELECT MAX(round_number) FROM blocks WHERE conversation_id = ?1 AND branch_path = '0'",
                        [&conversation_id],
                        |row| row.get(0),
                    )?;
                    (max_round.map(|r| r + 1).unwrap_or(0), "0".to_string())
                };

                match insert_block(
                    conn,
                    &conversation_id,
                    round_number,
                    block_type,
                    mode,
                    parent_block_id,
                    &branch_path,
                ) {
                    Ok(block) => return Ok(block),
                    Err(e) if is_conflict(&e) => {
                        if attempt + 1 == MAX_CONFLICT_ATTEMPTS {
                            return Err(SupervisorError::Conflict { attempts: MAX_CONFLICT_ATTEMPTS });
                        }
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Err(SupervisorError::Conflict { attempts: MAX_CONFLICT_ATTEMPTS })
        })
        .await
    }

    /// Creates a child block that starts a new branch off `parent_id` (spec
    /// §4.9 Branching). `branch_path` extends the parent's with the next
    /// sibling index; `round_number` is `parent.round_number + 1`.
    pub async fn fork(&self, parent_id: Uuid, inputs: Vec<UserInput>) -> Result<Block, SupervisorError> {
        self.with_conn(move |conn| {
            for attempt in 0..MAX_CONFLICT_ATTEMPTS {
                let parent = fetch_block(conn, parent_id)?;
                let sibling_count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM blocks WHERE parent_block_id = ?1",
                    [parent_id.to_string()],
                    |row| row.get(0),
                )?;
                let branch_path = format!("{}/{}", parent.branch_path, sibling_count);
                let round_number = parent.round_number + 1;

                match insert_block(
                    conn,
                    &parent.conversation_id,
                    round_number,
                    parent.block_type,
                    parent.mode,
                    Some(parent_id),
                    &branch_path,
                ) {
                    Ok(mut block) => {
                        for input in &inputs {
                            append_user_input_row(conn, block.id, input)?;
                        }
                        block.user_inputs = inputs.clone();
                        return Ok(block);
                    }
                    Err(e) if is_conflict(&e) => {
                        if attempt + 1 == MAX_CONFLICT_ATTEMPTS {
                            return Err(SupervisorError::Conflict { attempts: MAX_CONFLICT_ATTEMPTS });
                        }
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Err(SupervisorError::Conflict { attempts: MAX_CONFLICT_ATTEMPTS })
        })
        .await
    }

    pub async fn get_block(&self, id: Uuid) -> Result<Block, SupervisorError> {
        self.with_conn(move |conn| fetch_block(conn, id)).await
    }

    pub async fn list_blocks(&self, conversation_id: String, include_archived: bool) -> Result<Vec<Block>, SupervisorError> {
        self.with_conn(move |conn| {
            let sql = if include_archived {
                "SELECT * FROM blocks WHERE conversation_id = ?1 ORDER BY round_number ASC"
            } else {
                "SELECT * FROM blocks WHERE conversation_id = ?1 AND archived_at IS NULL ORDER BY round_number ASC"
            };
            let mut stmt = conn.prepare(sql)?;
            let blocks = stmt
                .query_map([&conversation_id], row_to_block)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(blocks)
        })
        .await
    }

    /// Walks from the most recently touched non-archived block in
    /// `conversation_id` back to the root via `parent_block_id`, returning
    /// the chain root-first — the conversation's currently-active branch
    /// (spec §4.9 `get_active_path`).
    pub async fn get_active_path(&self, conversation_id: String) -> Result<Vec<Block>, SupervisorError> {
        self.with_conn(move |conn| {
            let leaf_id: Option<String> = conn
                .query_row(
                    "SELECT id FROM blocks WHERE conversation_id = ?1 AND archived_at IS NULL \
                     ORDER BY updated_ts_ms DESC, round_number DESC LIMIT 1",
                    [&conversation_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(leaf_id) = leaf_id else {
                return Ok(Vec::new());
            };

            let mut chain = Vec::new();
            let mut current = Uuid::parse_str(&leaf_id).ok();
            while let Some(id) = current {
                let block = fetch_block(conn, id)?;
                current = block.parent_block_id;
                chain.push(block);
            }
            chain.reverse();
            Ok(chain)
        })
        .await
    }

    /// Pushes onto `user_inputs`; rejected once the block is terminal
    /// (spec §8 invariant).
    pub async fn append_user_input(&self, id: Uuid, input: UserInput) -> Result<(), SupervisorError> {
        self.with_conn(move |conn| {
            let block = fetch_block(conn, id)?;
            if block.status.is_terminal() {
                return Err(SupervisorError::BlockImmutable(id.to_string()));
            }
            append_user_input_row(conn, id, &input)
        })
        .await
    }

    /// Pushes onto `event_stream`, transitioning `Pending` blocks to
    /// `Streaming` on first append (spec §4.9 `append_event`).
    pub async fn append_event(&self, id: Uuid, event: BlockEvent) -> Result<(), SupervisorError> {
        self.append_events_batch(id, vec![event]).await
    }

    /// As `append_event`, but atomic for the whole batch — used by the
    /// classifier to reduce write pressure under high event volume.
    pub async fn append_events_batch(&self, id: Uuid, events: Vec<BlockEvent>) -> Result<(), SupervisorError> {
        self.with_conn(move |conn| {
            let block = fetch_block(conn, id)?;
            if block.status.is_terminal() {
                return Err(SupervisorError::BlockImmutable(id.to_string()));
            }
            let mut stream = block.event_stream;
            stream.extend(events);
            let stream_json = serde_json::to_string(&stream)?;
            let new_status = if block.status == BlockStatus::Pending {
                BlockStatus::Streaming
            } else {
                block.status
            };
            conn.execute(
                "UPDATE blocks SET event_stream = ?1, status = ?2, updated_ts_ms = ?3 WHERE id = ?4",
                params![stream_json, serde_json::to_string(&new_status)?, now_ms(), id.to_string()],
            )?;
            Ok(())
        })
        .await
    }

    /// Atomically sets `assistant_content`, `session_stats`, and
    /// `status = Completed` (spec §4.9 `complete`).
    pub async fn complete(&self, id: Uuid, assistant_content: String, stats: StatsAccumulator) -> Result<(), SupervisorError> {
        self.with_conn(move |conn| {
            let block = fetch_block(conn, id)?;
            if block.status.is_terminal() {
                return Err(SupervisorError::BlockImmutable(id.to_string()));
            }
            conn.execute(
                "UPDATE blocks SET assistant_content = ?1, session_stats = ?2, status = ?3, updated_ts_ms = ?4 WHERE id = ?5",
                params![
                    assistant_content,
                    serde_json::to_string(&stats)?,
                    serde_json::to_string(&BlockStatus::Completed)?,
                    now_ms(),
                    id.to_string()
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Sets `error_message` and `status = Error` (spec §4.9 `error`).
    pub async fn error(&self, id: Uuid, message: String) -> Result<(), SupervisorError> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE blocks SET error_message = ?1, status = ?2, updated_ts_ms = ?3 WHERE id = ?4",
                params![message, serde_json::to_string(&BlockStatus::Error)?, now_ms(), id.to_string()],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn archive(&self, id: Uuid) -> Result<(), SupervisorError> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE blocks SET archived_at = ?1, updated_ts_ms = ?1 WHERE id = ?2",
                params![now_ms(), id.to_string()],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn restore(&self, id: Uuid) -> Result<(), SupervisorError> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE blocks SET archived_at = NULL, updated_ts_ms = ?1 WHERE id = ?2",
                params![now_ms(), id.to_string()],
            )?;
            Ok(())
        })
        .await
    }

    /// Records the SessionId a Geek/Evolution block is bound to (spec §3 —
    /// `cc_session_id` is set for those modes, left null for Normal). Called
    /// by the Block Manager once it has resolved the block's session, not at
    /// `create` time, since resolution may happen after the block exists.
    pub async fn attach_session(&self, id: Uuid, session_id: Uuid) -> Result<(), SupervisorError> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE blocks SET cc_session_id = ?1, updated_ts_ms = ?2 WHERE id = ?3",
                params![session_id.to_string(), now_ms(), id.to_string()],
            )?;
            Ok(())
        })
        .await
    }
}

fn append_user_input_row(conn: &Connection, id: Uuid, input: &UserInput) -> Result<(), SupervisorError> {
    let block = fetch_block(conn, id)?;
    let mut inputs = block.user_inputs;
    inputs.push(input.clone());
    let inputs_json = serde_json::to_string(&inputs)?;
    conn.execute(
        "UPDATE blocks SET user_inputs = ?1, updated_ts_ms = ?2 WHERE id = ?3",
        params![inputs_json, now_ms(), id.to_string()],
    )?;
    Ok(())
}

fn insert_block(
    conn: &Connection,
    conversation_id: &str,
    round_number: i64,
    block_type: BlockType,
    mode: Mode,
    parent_block_id: Option<Uuid>,
    branch_path: &str,
) -> Result<Block, rusqlite::Error> {
    let block = Block {
        id: Uuid::new_v4(),
        uid: crate::supervisor::block::new_uid(),
        conversation_id: conversation_id.to_string(),
        round_number,
        block_type,
        mode,
        user_inputs: Vec::new(),
        assistant_content: String::new(),
        event_stream: Vec::new(),
        session_stats: None,
        cc_session_id: None,
        status: BlockStatus::Pending,
        parent_block_id,
        branch_path: branch_path.to_string(),
        created_ts_ms: now_ms(),
        updated_ts_ms: now_ms(),
        error_message: None,
        archived_at: None,
    };

    let to_sql_err = |e: serde_json::Error| {
        rusqlite::Error::ToSqlConversionFailure(Box::new(e))
    };

    conn.execute(
        "INSERT INTO blocks (
            id, uid, conversation_id, round_number, block_type, mode,
            user_inputs, assistant_content, event_stream, session_stats,
            cc_session_id, status, parent_block_id, branch_path,
            created_ts_ms, updated_ts_ms, error_message, archived_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
        params![
            block.id.to_string(),
            block.uid,
            block.conversation_id,
            block.round_number,
            serde_json::to_string(&block.block_type).map_err(to_sql_err)?,
            serde_json::to_string(&block.mode).map_err(to_sql_err)?,
            serde_json::to_string(&block.user_inputs).map_err(to_sql_err)?,
            block.assistant_content,
            serde_json::to_string(&block.event_stream).map_err(to_sql_err)?,
            block.session_stats.as_ref().map(serde_json::to_string).transpose().map_err(to_sql_err)?,
            block.cc_session_id.map(|id| id.to_string()),
            serde_json::to_string(&block.status).map_err(to_sql_err)?,
            block.parent_block_id.map(|id| id.to_string()),
            block.branch_path,
            block.created_ts_ms,
            block.updated_ts_ms,
            block.error_message,
            block.archived_at,
        ],
    )?;

    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::block::{BlockEventMeta, BlockEventType};

    #[tokio::test]
    async fn create_assigns_sequential_round_numbers() {
        let store = BlockStore::open_in_memory().unwrap();
        let a = store.create("conv-1".into(), Mode::Normal, BlockType::Message, None, None).await.unwrap();
        let b = store.create("conv-1".into(), Mode::Normal, BlockType::Message, Some(a.id), None).await.unwrap();
        assert_eq!(a.round_number, 0);
        assert_eq!(b.round_number, 1);
        assert_eq!(a.branch_path, "0");
        assert_eq!(b.branch_path, "0");
    }

    #[tokio::test]
    async fn create_honors_an_explicit_round_number_over_the_parent_chain() {
        let store = BlockStore::open_in_memory().unwrap();
        let root = store.create("conv-1".into(), Mode::Normal, BlockType::Message, None, None).await.unwrap();
        // Without an explicit round_number this would land at round 1
        // (parent.round_number + 1); the explicit value must win instead.
        let replayed = store
            .create("conv-1".into(), Mode::Normal, BlockType::Message, Some(root.id), Some(7))
            .await
            .unwrap();
        assert_eq!(replayed.round_number, 7);
        assert_eq!(replayed.branch_path, root.branch_path);
    }

    #[tokio::test]
    async fn append_event_transitions_pending_to_streaming() {
        let store = BlockStore::open_in_memory().unwrap();
        let block = store.create("conv-1".into(), Mode::Normal, BlockType::Message, None, None).await.unwrap();
        assert_eq!(block.status, BlockStatus::Pending);

        store
            .append_event(block.id, BlockEvent::new(BlockEventType::Thinking, "hm", 1))
            .await
            .unwrap();

        let reloaded = store.get_block(block.id).await.unwrap();
        assert_eq!(reloaded.status, BlockStatus::Streaming);
        assert_eq!(reloaded.event_stream.len(), 1);
    }

    #[tokio::test]
    async fn completed_block_rejects_further_mutation() {
        let store = BlockStore::open_in_memory().unwrap();
        let block = store.create("conv-1".into(), Mode::Normal, BlockType::Message, None, None).await.unwrap();
        store
            .complete(block.id, "done".into(), StatsAccumulator::default())
            .await
            .unwrap();

        let result = store
            .append_event(block.id, BlockEvent::new(BlockEventType::Answer, "late", 2))
            .await;
        assert!(matches!(result, Err(SupervisorError::BlockImmutable(_))));

        let result = store.append_user_input(block.id, UserInput::new("late", 3)).await;
        assert!(matches!(result, Err(SupervisorError::BlockImmutable(_))));
    }

    #[tokio::test]
    async fn fork_creates_new_branch_with_child_index() {
        let store = BlockStore::open_in_memory().unwrap();
        let root = store.create("conv-1".into(), Mode::Normal, BlockType::Message, None, None).await.unwrap();

        let fork_a = store.fork(root.id, vec![UserInput::new("alt a", 10)]).await.unwrap();
        let fork_b = store.fork(root.id, vec![UserInput::new("alt b", 11)]).await.unwrap();

        assert_eq!(fork_a.branch_path, "0/0");
        assert_eq!(fork_b.branch_path, "0/1");
        assert_eq!(fork_a.round_number, 1);
        assert_eq!(fork_a.user_inputs.len(), 1);
    }

    #[tokio::test]
    async fn archive_excludes_from_default_listing() {
        let store = BlockStore::open_in_memory().unwrap();
        let block = store.create("conv-1".into(), Mode::Normal, BlockType::Message, None, None).await.unwrap();
        store.archive(block.id).await.unwrap();

        let visible = store.list_blocks("conv-1".into(), false).await.unwrap();
        assert!(visible.is_empty());
        let all = store.list_blocks("conv-1".into(), true).await.unwrap();
        assert_eq!(all.len(), 1);

        store.restore(block.id).await.unwrap();
        let visible = store.list_blocks("conv-1".into(), false).await.unwrap();
        assert_eq!(visible.len(), 1);
    }

    #[tokio::test]
    async fn get_active_path_walks_from_most_recently_touched_leaf() {
        let store = BlockStore::open_in_memory().unwrap();
        let root = store.create("conv-1".into(), Mode::Normal, BlockType::Message, None, None).await.unwrap();
        let child = store.create("conv-1".into(), Mode::Normal, BlockType::Message, Some(root.id), None).await.unwrap();

        let path = store.get_active_path("conv-1".into()).await.unwrap();
        assert_eq!(path.len(), 2);
        assert_eq!(path[0].id, root.id);
        assert_eq!(path[1].id, child.id);
    }

    #[tokio::test]
    async fn round_trip_preserves_event_meta() {
        let store = BlockStore::open_in_memory().unwrap();
        let block = store.create("conv-1".into(), Mode::Geek, BlockType::Message, None, None).await.unwrap();
        let event = BlockEvent::new(BlockEventType::ToolUse, "Bash(ls)", 5).with_meta(BlockEventMeta::ToolUse {
            tool_name: "Bash".into(),
            tool_id: "t1".into(),
            input_summary: "ls".into(),
            danger_level: Some(crate::supervisor::danger::DangerLevel::Low),
        });
        store.append_event(block.id, event).await.unwrap();

        let reloaded = store.get_block(block.id).await.unwrap();
        assert_eq!(reloaded.event_stream.len(), 1);
        assert!(matches!(reloaded.event_stream[0].meta, BlockEventMeta::ToolUse { .. }));
    }

    #[tokio::test]
    async fn attach_session_sets_cc_session_id() {
        let store = BlockStore::open_in_memory().unwrap();
        let block = store.create("conv-1".into(), Mode::Geek, BlockType::Message, None, None).await.unwrap();
        assert!(block.cc_session_id.is_none());

        let session_id = Uuid::new_v4();
        store.attach_session(block.id, session_id).await.unwrap();

        let reloaded = store.get_block(block.id).await.unwrap();
        assert_eq!(reloaded.cc_session_id, Some(session_id));
    }

    #[tokio::test]
    async fn get_block_of_unknown_id_is_not_found() {
        let store = BlockStore::open_in_memory().unwrap();
        let result = store.get_block(Uuid::new_v4()).await;
        assert!(matches!(result, Err(SupervisorError::BlockNotFound(_))));
    }
}
