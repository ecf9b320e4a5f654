//! State Store (S) for the multi-agent orchestration core.
//!
//! Persists one `ConversationState` per session key under
//! `state_path/orchestration/<session_key>.json`. Writes are debounced so a
//! burst of mutations within a turn collapses into a single flush, and a
//! failed flush is retried with exponential back-off rather than silently
//! dropped — a gate transition (a new pending question or approval) bypasses
//! the debounce and flushes immediately, since losing one of those to a
//! crash would strand the user mid-approval.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::sleep;

use sa_domain::error::{Error, Result};
use sa_domain::orchestration::ConversationState;

/// Sessions idle longer than this are evicted from the in-memory cache on
/// the next sweep; the on-disk file is left untouched.
const TTL: Duration = Duration::from_secs(24 * 60 * 60);

const DEBOUNCE: Duration = Duration::from_millis(300);
const RETRY_BASE: Duration = Duration::from_millis(500);
const RETRY_CAP: Duration = Duration::from_secs(10);
const RETRY_ATTEMPTS: u32 = 8;

struct CacheEntry {
    state: ConversationState,
    last_touched: DateTime<Utc>,
}

/// State Store: async, debounced, retrying persistence for `ConversationState`.
pub struct ConversationStateStore {
    dir: PathBuf,
    cache: RwLock<HashMap<String, CacheEntry>>,
    /// Per-session load lock, so two concurrent `ensure_loaded` calls for
    /// the same never-before-seen key don't both hit disk.
    load_locks: RwLock<HashMap<String, Arc<AsyncMutex<()>>>>,
    /// Per-session flush lock, so a debounced flush and a `flush_now` for
    /// the same key never race each other onto disk (§4.1: "at-most-one
    /// in-flight write per session").
    flush_locks: RwLock<HashMap<String, Arc<AsyncMutex<()>>>>,
    /// Sessions with a debounce timer already in flight. `schedule_flush`
    /// no-ops while a session's key is present here, so a burst of
    /// mutations within one 300ms window coalesces into a single flush
    /// (§4.1: "further mutations piggyback").
    pending_debounce: Mutex<HashSet<String>>,
    /// Last successfully-persisted encoding per session, so a flush with
    /// nothing new to write is skipped (§4.1 serialization discipline).
    last_persisted: Mutex<HashMap<String, String>>,
}

impl ConversationStateStore {
    pub fn new(state_path: &Path) -> Result<Self> {
        let dir = state_path.join("orchestration");
        std::fs::create_dir_all(&dir).map_err(Error::Io)?;
        Ok(Self {
            dir,
            cache: RwLock::new(HashMap::new()),
            load_locks: RwLock::new(HashMap::new()),
            flush_locks: RwLock::new(HashMap::new()),
            pending_debounce: Mutex::new(HashSet::new()),
            last_persisted: Mutex::new(HashMap::new()),
        })
    }

    fn path_for(&self, session_key: &str) -> PathBuf {
        self.dir.join(format!("{session_key}.json"))
    }

    fn load_lock(&self, session_key: &str) -> Arc<AsyncMutex<()>> {
        if let Some(lock) = self.load_locks.read().get(session_key) {
            return lock.clone();
        }
        self.load_locks
            .write()
            .entry(session_key.to_owned())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn flush_lock(&self, session_key: &str) -> Arc<AsyncMutex<()>> {
        if let Some(lock) = self.flush_locks.read().get(session_key) {
            return lock.clone();
        }
        self.flush_locks
            .write()
            .entry(session_key.to_owned())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Ensure `session_key`'s state is in the in-memory cache, loading it
    /// from disk (or creating a fresh default) if not. Single-flight: only
    /// one caller actually touches the filesystem per key.
    pub async fn ensure_loaded(&self, session_key: &str) -> Result<()> {
        if self.cache.read().contains_key(session_key) {
            return Ok(());
        }

        let lock = self.load_lock(session_key);
        let _guard = lock.lock().await;

        // Re-check: another task may have loaded it while we waited.
        if self.cache.read().contains_key(session_key) {
            return Ok(());
        }

        let path = self.path_for(session_key);
        let mut state = if path.exists() {
            let raw = tokio::fs::read_to_string(&path).await.map_err(Error::Io)?;
            serde_json::from_str(&raw).map_err(Error::Json)?
        } else {
            ConversationState::default()
        };

        // §3 invariant: a persisted `is_loop_running = true` with no live
        // runtime loop behind it is stale and must never survive a load.
        state.reset_stale_loop_flag();

        self.cache.write().insert(
            session_key.to_owned(),
            CacheEntry {
                state,
                last_touched: Utc::now(),
            },
        );
        Ok(())
    }

    /// Read a clone of the current state. Caller must `ensure_loaded` first.
    pub fn get(&self, session_key: &str) -> Option<ConversationState> {
        self.cache.read().get(session_key).map(|e| e.state.clone())
    }

    /// Apply `mutator` to the session's state and debounce a flush. Returns
    /// the error if the session was never loaded.
    pub fn update<F>(&self, session_key: &str, mutator: F) -> Result<()>
    where
        F: FnOnce(&mut ConversationState),
    {
        let mut cache = self.cache.write();
        let entry = cache
            .get_mut(session_key)
            .ok_or_else(|| Error::Other(format!("session not loaded: {session_key}")))?;
        mutator(&mut entry.state);
        entry.last_touched = Utc::now();
        Ok(())
    }

    /// Schedule a debounced flush for `session_key`: waits `DEBOUNCE`, then
    /// persists with retrying back-off. Call after every `update` that
    /// doesn't need the stronger `flush_now` guarantee.
    ///
    /// At most one debounce timer is ever in flight per session — a second
    /// call while one is already pending is a no-op, so several mutations
    /// inside one 300ms window collapse into the single flush the first
    /// mutation scheduled (§4.1: "further mutations piggyback" / "at-most-
    /// one in-flight write per session").
    pub fn schedule_flush(self: &Arc<Self>, session_key: String) {
        {
            let mut pending = self.pending_debounce.lock();
            if !pending.insert(session_key.clone()) {
                return; // a timer is already pending for this session.
            }
        }
        let store = self.clone();
        tokio::spawn(async move {
            sleep(DEBOUNCE).await;
            store.pending_debounce.lock().remove(&session_key);
            if let Err(e) = store.flush(&session_key).await {
                tracing::error!(session_key, error = %e, "orchestration state flush failed after retries");
            }
        });
    }

    /// Flush immediately, bypassing the debounce window. Used for gate
    /// transitions (§4.1): a new pending question or approval must survive
    /// a crash immediately, not after a 300ms window.
    pub async fn flush_now(&self, session_key: &str) -> Result<()> {
        self.flush(session_key).await
    }

    /// Serialize and write the session's state to disk, retrying with
    /// exponential back-off (500ms -> 10s cap, 8 attempts) on failure.
    ///
    /// Serialized per session via `flush_lock` so a debounced flush racing
    /// a `flush_now` never interleaves two writers on the same file, and
    /// skips the write entirely when the encoding is unchanged since the
    /// last successful persist (§4.1 serialization discipline).
    async fn flush(&self, session_key: &str) -> Result<()> {
        let lock = self.flush_lock(session_key);
        let _guard = lock.lock().await;

        let json = {
            let cache = self.cache.read();
            let entry = cache
                .get(session_key)
                .ok_or_else(|| Error::Other(format!("session not loaded: {session_key}")))?;
            serde_json::to_string_pretty(&entry.state).map_err(Error::Json)?
        };

        if self.last_persisted.lock().get(session_key) == Some(&json) {
            return Ok(()); // no-op write: nothing changed since last persist.
        }

        let path = self.path_for(session_key);
        let mut attempt = 0;
        loop {
            match tokio::fs::write(&path, &json).await {
                Ok(()) => {
                    self.last_persisted
                        .lock()
                        .insert(session_key.to_owned(), json);
                    return Ok(());
                }
                Err(e) if attempt + 1 >= RETRY_ATTEMPTS => return Err(Error::Io(e)),
                Err(e) => {
                    tracing::warn!(
                        session_key,
                        attempt,
                        error = %e,
                        "orchestration state flush failed, retrying"
                    );
                    let delay = RETRY_BASE
                        .saturating_mul(1 << attempt.min(10))
                        .min(RETRY_CAP);
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Remove a session's state from the cache and disk entirely.
    pub async fn delete(&self, session_key: &str) -> Result<()> {
        self.cache.write().remove(session_key);
        self.load_locks.write().remove(session_key);
        let path = self.path_for(session_key);
        if path.exists() {
            tokio::fs::remove_file(&path).await.map_err(Error::Io)?;
        }
        Ok(())
    }

    /// Evict cache entries idle longer than `TTL`. Does not touch disk —
    /// the next `ensure_loaded` for an evicted key reloads it from the file.
    pub fn evict_stale(&self) {
        let now = Utc::now();
        self.cache.write().retain(|_, entry| {
            now.signed_duration_since(entry.last_touched)
                < chrono::Duration::from_std(TTL).unwrap()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sa_domain::orchestration::{Phase, UserQuestion};

    async fn temp_store() -> (tempfile::TempDir, Arc<ConversationStateStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ConversationStateStore::new(dir.path()).unwrap());
        (dir, store)
    }

    #[tokio::test]
    async fn ensure_loaded_creates_default_for_unknown_session() {
        let (_dir, store) = temp_store().await;
        store.ensure_loaded("s1").await.unwrap();
        let state = store.get("s1").unwrap();
        assert_eq!(state.phase, Phase::Idle);
    }

    #[tokio::test]
    async fn update_then_flush_now_persists_to_disk() {
        let (_dir, store) = temp_store().await;
        store.ensure_loaded("s1").await.unwrap();
        store
            .update("s1", |state| {
                state.phase = Phase::Running;
                state
                    .pending_questions
                    .push(UserQuestion::new("continue?", "chapo"));
            })
            .unwrap();
        store.flush_now("s1").await.unwrap();

        let path = store.path_for("s1");
        assert!(path.exists());
        let raw = std::fs::read_to_string(path).unwrap();
        let reloaded: ConversationState = serde_json::from_str(&raw).unwrap();
        assert_eq!(reloaded.phase, Phase::Running);
        assert_eq!(reloaded.pending_questions.len(), 1);
    }

    #[tokio::test]
    async fn ensure_loaded_resets_stale_loop_flag() {
        let (_dir, store) = temp_store().await;
        store.ensure_loaded("s1").await.unwrap();
        store
            .update("s1", |state| state.is_loop_running = true)
            .unwrap();
        store.flush_now("s1").await.unwrap();
        store.evict_stale_for_test("s1");

        store.ensure_loaded("s1").await.unwrap();
        assert!(!store.get("s1").unwrap().is_loop_running);
    }

    #[tokio::test]
    async fn delete_removes_cache_and_file() {
        let (_dir, store) = temp_store().await;
        store.ensure_loaded("s1").await.unwrap();
        store.flush_now("s1").await.unwrap();
        assert!(store.path_for("s1").exists());

        store.delete("s1").await.unwrap();
        assert!(!store.path_for("s1").exists());
        assert!(store.get("s1").is_none());
    }

    impl ConversationStateStore {
        /// Test-only: force-evict one key regardless of its TTL, to exercise
        /// the reload-from-disk path without waiting 24h.
        fn evict_stale_for_test(&self, session_key: &str) {
            self.cache.write().remove(session_key);
        }
    }
}
