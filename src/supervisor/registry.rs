use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex as AsyncMutex, RwLock};

use crate::error::SupervisorError;
use crate::supervisor::engine::SpawnConfig;
use crate::supervisor::id_mapper::SessionId;
use crate::supervisor::session::{SessionUnit, Status};

/// A point-in-time, handle-free view of one live Session Unit, safe to hand
/// to callers that must not observe or hold a shared-mutable reference into
/// the registry (spec §4.8 isolation guarantee).
#[derive(Debug, Clone)]
pub struct SessionMetadata {
    pub id: SessionId,
    pub status: Status,
    pub created_at: i64,
    pub last_active_at: i64,
}

/// Process-wide owner of Session Units (spec §4.8). Generalizes the
/// teacher's `AppState.live_processes: Arc<Mutex<HashMap<String,
/// LiveClaudeProcess>>>` into a sharded design: the session map is an
/// `RwLock` (reads dominate — `lookup`/`list_active` vastly outnumber
/// inserts), and a separate per-SessionID "creation lock" map serialises
/// concurrent `get_or_create` calls for the *same* id without blocking
/// calls for different ids on each other.
pub struct Registry {
    sessions: Arc<RwLock<HashMap<SessionId, Arc<SessionUnit>>>>,
    creation_locks: Arc<std::sync::Mutex<HashMap<SessionId, Arc<AsyncMutex<()>>>>>,
    event_queue_capacity: usize,
    terminate_grace: Duration,
}

impl Registry {
    pub fn new(event_queue_capacity: usize, terminate_grace: Duration) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            creation_locks: Arc::new(std::sync::Mutex::new(HashMap::new())),
            event_queue_capacity,
            terminate_grace,
        }
    }

    fn creation_lock_for(&self, id: SessionId) -> Arc<AsyncMutex<()>> {
        let mut locks = self.creation_locks.lock().expect("creation_locks poisoned");
        locks.entry(id).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    /// Returns the live Session Unit for `session_id`, spawning one via
    /// `spawn_config` if none exists or the cached entry is `Dead`. The
    /// per-id creation lock guarantees concurrent callers racing on the
    /// same id observe exactly one spawn (spec §8 concurrency property).
    pub async fn get_or_create(
        &self,
        session_id: SessionId,
        spawn_config: SpawnConfig,
    ) -> Result<Arc<SessionUnit>, SupervisorError> {
        if let Some(unit) = self.lookup(session_id).await {
            return Ok(unit);
        }

        let creation_lock = self.creation_lock_for(session_id);
        let _guard = creation_lock.lock().await;

        // Re-check under the per-id lock: another caller may have already
        // spawned while we waited for it.
        if let Some(unit) = self.lookup(session_id).await {
            return Ok(unit);
        }

        let unit = SessionUnit::spawn(spawn_config, self.event_queue_capacity, self.terminate_grace)?;
        self.sessions.write().await.insert(session_id, unit.clone());
        Ok(unit)
    }

    /// Returns the live unit for `session_id`, evicting and discarding it
    /// first if it has gone `Dead` since it was last observed. Never
    /// creates.
    pub async fn lookup(&self, session_id: SessionId) -> Option<Arc<SessionUnit>> {
        {
            let sessions = self.sessions.read().await;
            match sessions.get(&session_id) {
                Some(unit) if unit.status() != Status::Dead => return Some(unit.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        // Entry exists but is dead: drop it under the write lock.
        let mut sessions = self.sessions.write().await;
        if let Some(unit) = sessions.get(&session_id) {
            if unit.status() == Status::Dead {
                sessions.remove(&session_id);
            }
        }
        None
    }

    /// Politely terminates the unit for `session_id`, if any, then removes
    /// it from the map. A no-op if the id is not registered.
    pub async fn terminate(&self, session_id: SessionId) {
        let unit = { self.sessions.write().await.remove(&session_id) };
        if let Some(unit) = unit {
            unit.terminate().await;
        }
        self.creation_locks.lock().expect("creation_locks poisoned").remove(&session_id);
    }

    /// Snapshots of every currently-registered unit, dead or alive — the
    /// reaper relies on this to find candidates without holding the map
    /// lock across its own `terminate` calls.
    pub async fn list_active(&self) -> Vec<SessionMetadata> {
        self.sessions
            .read()
            .await
            .values()
            .map(|unit| SessionMetadata {
                id: unit.id,
                status: unit.status(),
                created_at: unit.created_at(),
                last_active_at: unit.last_active_at(),
            })
            .collect()
    }

    /// Scans once for units whose `last_active_at` is older than `idle_ttl`
    /// and are not `Busy`, terminating each (spec §4.8 Reaping). Returns the
    /// count reaped. Factored out of [`Registry::spawn_reaper`]'s loop so a
    /// caller that wants a single on-demand pass (e.g. a `reap-once` CLI
    /// subcommand) doesn't have to spawn a background task to get one.
    pub async fn reap_once(&self, idle_ttl: Duration) -> usize {
        let now = Utc::now().timestamp_millis();
        let idle_ttl_ms = idle_ttl.as_millis() as i64;
        let candidates: Vec<SessionId> = self
            .list_active()
            .await
            .into_iter()
            .filter(|meta| {
                meta.status != Status::Busy
                    && meta.status != Status::Dead
                    && now.saturating_sub(meta.last_active_at) >= idle_ttl_ms
            })
            .map(|meta| meta.id)
            .collect();
        let reaped = candidates.len();
        for id in candidates {
            tracing::info!(session_id = %id, "reaping idle session");
            self.terminate(id).await;
        }
        reaped
    }

    /// Terminates every currently-registered session, dead or alive. Used
    /// on process shutdown (`main.rs::serve`'s graceful-shutdown hook) so
    /// engine subprocesses are asked to exit instead of being left to the
    /// OS when this process exits.
    pub async fn terminate_all(&self) {
        let ids: Vec<SessionId> = self.sessions.read().await.keys().copied().collect();
        for id in ids {
            self.terminate(id).await;
        }
    }

    /// Spawns the background reaper: wakes every `interval` and calls
    /// [`Registry::reap_once`] (spec §4.8). Mirrors the teacher's
    /// `flows/scheduler.rs` interval-loop shape. Runs until the process
    /// exits — there is no handle to stop it, matching the teacher's
    /// fire-and-forget scheduler task.
    pub fn spawn_reaper(self: &Arc<Self>, idle_ttl: Duration, interval: Duration) {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                registry.reap_once(idle_ttl).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::block::Mode;
    use std::path::PathBuf;
    use uuid::Uuid;

    fn config(session_id: SessionId) -> SpawnConfig {
        SpawnConfig {
            session_id,
            mode: Mode::Normal,
            working_dir: PathBuf::from("."),
            resume: false,
            allowed_tools: vec![],
            engine_binary: "cat".to_string(),
        }
    }

    #[tokio::test]
    async fn get_or_create_reuses_existing_unit() {
        let registry = Registry::new(16, Duration::from_millis(200));
        let id = Uuid::new_v4();
        let first = registry.get_or_create(id, config(id)).await.unwrap();
        let second = registry.get_or_create(id, config(id)).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn concurrent_get_or_create_spawns_exactly_once() {
        let registry = Arc::new(Registry::new(16, Duration::from_millis(200)));
        let id = Uuid::new_v4();
        let mut handles = Vec::new();
        for _ in 0..20 {
            let registry = registry.clone();
            let cfg = config(id);
            handles.push(tokio::spawn(async move { registry.get_or_create(id, cfg).await.unwrap() }));
        }
        let mut units = Vec::new();
        for h in handles {
            units.push(h.await.unwrap());
        }
        let first = &units[0];
        assert!(units.iter().all(|u| Arc::ptr_eq(u, first)));
    }

    #[tokio::test]
    async fn lookup_evicts_dead_entries() {
        let registry = Registry::new(16, Duration::from_millis(50));
        let id = Uuid::new_v4();
        let unit = registry.get_or_create(id, config(id)).await.unwrap();
        unit.terminate().await;
        assert!(registry.lookup(id).await.is_none());
    }

    #[tokio::test]
    async fn lookup_of_unknown_id_is_none() {
        let registry = Registry::new(16, Duration::from_millis(50));
        assert!(registry.lookup(Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn terminate_removes_from_list_active() {
        let registry = Registry::new(16, Duration::from_millis(50));
        let id = Uuid::new_v4();
        registry.get_or_create(id, config(id)).await.unwrap();
        assert_eq!(registry.list_active().await.len(), 1);
        registry.terminate(id).await;
        assert_eq!(registry.list_active().await.len(), 0);
    }

    #[tokio::test]
    async fn reap_once_terminates_idle_and_reports_count() {
        let registry = Registry::new(16, Duration::from_millis(50));
        let id = Uuid::new_v4();
        registry.get_or_create(id, config(id)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let reaped = registry.reap_once(Duration::from_millis(10)).await;
        assert_eq!(reaped, 1);
        assert!(registry.lookup(id).await.is_none());
    }

    #[tokio::test]
    async fn reap_once_is_a_no_op_on_an_empty_registry() {
        let registry = Registry::new(16, Duration::from_millis(50));
        assert_eq!(registry.reap_once(Duration::from_secs(1800)).await, 0);
    }

    #[tokio::test]
    async fn terminate_all_clears_every_session() {
        let registry = Registry::new(16, Duration::from_millis(50));
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        registry.get_or_create(a, config(a)).await.unwrap();
        registry.get_or_create(b, config(b)).await.unwrap();
        assert_eq!(registry.list_active().await.len(), 2);
        registry.terminate_all().await;
        assert_eq!(registry.list_active().await.len(), 0);
    }

    #[tokio::test]
    async fn reaper_terminates_idle_sessions_past_ttl() {
        let registry = Arc::new(Registry::new(16, Duration::from_millis(50)));
        let id = Uuid::new_v4();
        registry.get_or_create(id, config(id)).await.unwrap();
        registry.spawn_reaper(Duration::from_millis(10), Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(registry.lookup(id).await.is_none());
    }
}
