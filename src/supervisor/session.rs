use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::error::SupervisorError;
use crate::supervisor::classifier::{ClassifierState, ClassifyOutcome, EngineMetadata};
use crate::supervisor::codec::{Frame, FrameCodec, StderrRing};
use crate::supervisor::engine::{self, SpawnConfig};
use crate::supervisor::id_mapper::SessionId;
use crate::supervisor::stats::{StatsAccumulator, StatsCollector};

/// The Session Unit's lifecycle state (spec §4.7). `Dead` is terminal —
/// nothing transitions out of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Starting = 0,
    Ready = 1,
    Busy = 2,
    Dead = 3,
}

impl Status {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Status::Starting,
            1 => Status::Ready,
            2 => Status::Busy,
            _ => Status::Dead,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Starting => "starting",
            Status::Ready => "ready",
            Status::Busy => "busy",
            Status::Dead => "dead",
        };
        write!(f, "{s}")
    }
}

/// Everything a consumer of a Session Unit's event stream can observe: the
/// classified content/control events plus the session's own lifecycle
/// signals (spec §4.4, §4.7).
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A classified BlockEvent to forward to the caller and append to the
    /// active block's `event_stream`.
    Content(crate::supervisor::block::BlockEvent),
    /// Terminal `result` message — a stats snapshot, *not* appended to
    /// `event_stream` (spec §4.4).
    Stats(StatsAccumulator),
    /// A `system`/`init` control message recorded onto the session, not
    /// the block.
    EngineMetadata(EngineMetadata),
    /// The engine process exited (clean, crashed, or cancelled). Terminal
    /// for this Session Unit.
    Dead { reason: String },
}

/// One engine + codec + classifier + stats, owning one bidirectional
/// conversation (spec §4.7). Three internal tasks cooperate: one drains
/// stdout into the Frame Codec, one runs the Event Classifier over the
/// resulting frames, and one owns the child handle to detect `EngineDied`
/// and to carry out `terminate()`'s grace-period kill.
pub struct SessionUnit {
    pub id: SessionId,
    status: AtomicU8,
    created_at: i64,
    last_active_at: AtomicI64,
    stats: StatsCollector,
    stdin: AsyncMutex<ChildStdin>,
    cancel: CancellationToken,
    metadata: AsyncMutex<EngineMetadata>,
    events_rx: AsyncMutex<mpsc::Receiver<SessionEvent>>,
    stderr_ring: Arc<std::sync::Mutex<StderrRing>>,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl SessionUnit {
    /// Spawns the engine process per `config` and starts its reader/
    /// classifier/waiter tasks. The returned unit starts in `Ready` — spec
    /// §4.7's `Starting` state covers only the window before `spawn`
    /// returns, which this constructor blocks through.
    pub fn spawn(
        config: SpawnConfig,
        event_queue_capacity: usize,
        terminate_grace: Duration,
    ) -> Result<Arc<Self>, SupervisorError> {
        let session_id = config.session_id;
        let process = engine::spawn(&config)?;

        let stdin = process.stdin;
        let stdout = process.stdout;
        let stderr = process.stderr;
        let child = process.child;

        let (events_tx, events_rx) = mpsc::channel(event_queue_capacity.max(1));
        let stderr_ring = Arc::new(std::sync::Mutex::new(StderrRing::new(200)));

        let unit = Arc::new(Self {
            id: session_id,
            status: AtomicU8::new(Status::Ready as u8),
            created_at: now_ms(),
            last_active_at: AtomicI64::new(now_ms()),
            stats: StatsCollector::new(),
            stdin: AsyncMutex::new(stdin),
            cancel: CancellationToken::new(),
            metadata: AsyncMutex::new(EngineMetadata::default()),
            events_rx: AsyncMutex::new(events_rx),
            stderr_ring: stderr_ring.clone(),
        });

        // stderr drain — diagnostics-only ring buffer (spec §4.3).
        let cancel_stderr = unit.cancel.clone();
        tokio::spawn(async move {
            let mut codec = FrameCodec::new(stderr);
            loop {
                tokio::select! {
                    _ = cancel_stderr.cancelled() => break,
                    frame = codec.next_frame() => match frame {
                        Some(Frame::Log { text, .. }) => {
                            if let Ok(mut ring) = stderr_ring.lock() {
                                ring.push(text);
                            }
                        }
                        Some(Frame::Framed { raw, .. }) => {
                            if let Ok(mut ring) = stderr_ring.lock() {
                                ring.push(raw.to_string());
                            }
                        }
                        Some(Frame::Error { .. }) | None => break,
                    }
                }
            }
        });

        // Internal raw-frame channel: exactly one task drains stdout
        // (spec §4.7 invariant), handing frames to exactly one classifier
        // task.
        let (frame_tx, mut frame_rx) = mpsc::channel::<serde_json::Value>(event_queue_capacity.max(1));
        let cancel_reader = unit.cancel.clone();
        tokio::spawn(async move {
            let mut codec = FrameCodec::new(stdout);
            loop {
                tokio::select! {
                    _ = cancel_reader.cancelled() => break,
                    frame = codec.next_frame() => match frame {
                        Some(Frame::Framed { raw, .. }) => {
                            if frame_tx.send(raw).await.is_err() {
                                break;
                            }
                        }
                        Some(Frame::Log { .. }) => continue,
                        Some(Frame::Error { message }) => {
                            tracing::warn!(error = %message, "frame codec io error, ending read loop");
                            break;
                        }
                        None => break,
                    }
                }
            }
        });

        let classifier_stats = unit.stats.clone();
        let classifier_events_tx = events_tx.clone();
        let unit_for_classifier = unit.clone();
        tokio::spawn(async move {
            let mut state = ClassifierState::new();
            while let Some(raw) = frame_rx.recv().await {
                let outcomes = state.classify(&raw, now_ms(), &classifier_stats).await;
                for outcome in outcomes {
                    match outcome {
                        ClassifyOutcome::Swallowed => {}
                        ClassifyOutcome::Metadata(meta) => {
                            *unit_for_classifier.metadata.lock().await = meta.clone();
                            if classifier_events_tx
                                .send(SessionEvent::EngineMetadata(meta))
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                        ClassifyOutcome::Content(event) => {
                            unit_for_classifier.touch();
                            if classifier_events_tx
                                .send(SessionEvent::Content(event))
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                        ClassifyOutcome::Result(stats) => {
                            unit_for_classifier.set_status(Status::Ready);
                            unit_for_classifier.touch();
                            if classifier_events_tx.send(SessionEvent::Stats(stats)).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });

        // Owns the child handle: either the engine exits on its own
        // (EngineDied) or `terminate()` cancels the token, in which case
        // this task waits out the grace period before killing it.
        let waiter_unit = unit.clone();
        let waiter_cancel = unit.cancel.clone();
        let waiter_events_tx = events_tx;
        tokio::spawn(async move {
            let mut child = child;
            tokio::select! {
                status = child.wait() => {
                    if waiter_unit.status() == Status::Dead {
                        return;
                    }
                    waiter_unit.set_status(Status::Dead);
                    let exit_desc = match status {
                        Ok(s) => format!("exit status {s}"),
                        Err(e) => format!("wait failed: {e}"),
                    };
                    let tail = waiter_unit.stderr_ring.lock().map(|r| r.snapshot()).unwrap_or_default();
                    let reason = if tail.is_empty() {
                        format!("engine died: {exit_desc}")
                    } else {
                        format!("engine died: {exit_desc}; stderr tail: {}", tail.join(" | "))
                    };
                    let _ = waiter_events_tx.send(SessionEvent::Dead { reason }).await;
                }
                _ = waiter_cancel.cancelled() => {
                    match tokio::time::timeout(terminate_grace, child.wait()).await {
                        Ok(_) => {
                            let _ = waiter_events_tx
                                .send(SessionEvent::Dead { reason: "cancelled".to_string() })
                                .await;
                        }
                        Err(_) => {
                            let _ = child.kill().await;
                            let _ = waiter_events_tx
                                .send(SessionEvent::Dead { reason: "cancelled: killed after grace period".to_string() })
                                .await;
                        }
                    }
                }
            }
        });

        Ok(unit)
    }

    fn touch(&self) {
        self.last_active_at.store(now_ms(), Ordering::SeqCst);
    }

    fn set_status(&self, status: Status) {
        // Dead is terminal — never overwritten once set.
        if self.status() == Status::Dead {
            return;
        }
        self.status.store(status as u8, Ordering::SeqCst);
    }

    pub fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn last_active_at(&self) -> i64 {
        self.last_active_at.load(Ordering::SeqCst)
    }

    pub async fn stats_snapshot(&self) -> StatsAccumulator {
        self.stats.snapshot().await
    }

    pub async fn metadata_snapshot(&self) -> EngineMetadata {
        self.metadata.lock().await.clone()
    }

    /// Injects a serialised user message into the engine's stdin, following
    /// the teacher's `{"type":"user","message":{"role":"user","content":...}}`
    /// wire shape (spec §4.2 ADD, §4.7). Fails if the session is not
    /// `Ready`. Stdin writes are serialised by `stdin`'s mutex (spec §5).
    pub async fn send(&self, input: &str) -> Result<(), SupervisorError> {
        if self.status() != Status::Ready {
            return Err(SupervisorError::NotReady(self.status().to_string()));
        }
        self.set_status(Status::Busy);
        self.touch();

        let payload = json!({
            "type": "user",
            "message": {
                "role": "user",
                "content": input,
            }
        });
        let mut line = serde_json::to_string(&payload)?;
        line.push('\n');

        let mut stdin = self.stdin.lock().await;
        stdin.write_all(line.as_bytes()).await.map_err(|e| {
            self.set_status(Status::Dead);
            SupervisorError::EngineDied(format!("stdin write failed: {e}"))
        })?;
        Ok(())
    }

    /// Awaits the next event, holding the internal lock for the duration of
    /// the wait. This enforces "lazy, single-consumer" draining (spec §4.7)
    /// without ever consuming the channel itself, so the same stream keeps
    /// delivering across every turn of the session's Ready↔Busy lifecycle —
    /// not just the first — and only ends once the channel's senders drop
    /// on `Dead`. Concurrent callers simply queue on the lock; nothing in
    /// this crate calls it from more than one task at a time per session.
    pub async fn next_event(&self) -> Option<SessionEvent> {
        let mut rx = self.events_rx.lock().await;
        rx.recv().await
    }

    /// Politely closes stdin and cancels the session's tasks; the waiter
    /// task carries out the grace-period wait and, if needed, the kill in
    /// the background. Idempotent once `Dead`.
    pub async fn terminate(&self) {
        if self.status() == Status::Dead {
            return;
        }
        self.set_status(Status::Dead);
        {
            let mut stdin = self.stdin.lock().await;
            let _ = stdin.shutdown().await;
        }
        self.cancel.cancel();
    }
}
