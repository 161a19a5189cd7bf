//! Server-side session state
//!
//! The store's top-level map is the only globally shared structure and is
//! touched only for short insert/lookup/remove sections. Each session sits
//! behind its own mutex, so chunks for different sessions never wait on
//! each other.
//!
//! Completed and abandoned sessions are replaced by a tombstone so a retried
//! completion marker or a late chunk is recognised instead of opening a new,
//! never-finishing session under the same id.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Decoded,
    Written,
    Abandoned,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Written | SessionState::Abandoned)
    }
}

/// A checksum-verified chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredChunk {
    pub payload: String,
    pub checksum: String,
}

/// Result of storing a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreResult {
    /// First time this sequence was seen
    Inserted,
    /// Same payload and checksum already stored
    Duplicate,
    /// Different content already stored; original kept
    Conflict,
}

/// One in-flight transfer
#[derive(Debug)]
pub struct Session {
    id: String,
    chunks: BTreeMap<u16, StoredChunk>,
    highest_seen_seq: Option<u16>,
    complete_marker_seen: bool,
    state: SessionState,
    encoded_len: usize,
    decode_failures: u32,
    created_at: Instant,
    last_activity: Instant,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Instant::now();
        Self {
            id: id.into(),
            chunks: BTreeMap::new(),
            highest_seen_seq: None,
            complete_marker_seen: false,
            state: SessionState::Open,
            encoded_len: 0,
            decode_failures: 0,
            created_at: now,
            last_activity: now,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn highest_seen_seq(&self) -> Option<u16> {
        self.highest_seen_seq
    }

    pub fn complete_marker_seen(&self) -> bool {
        self.complete_marker_seen
    }

    pub fn mark_complete(&mut self) {
        self.complete_marker_seen = true;
    }

    /// Sum of stored payload lengths
    pub fn encoded_len(&self) -> usize {
        self.encoded_len
    }

    pub fn decode_failures(&self) -> u32 {
        self.decode_failures
    }

    /// Count a failed decode; returns the new total
    pub fn record_decode_failure(&mut self) -> u32 {
        self.decode_failures += 1;
        self.decode_failures
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn get(&self, sequence: u16) -> Option<&StoredChunk> {
        self.chunks.get(&sequence)
    }

    /// Store a verified chunk under the idempotent-overwrite rule
    pub fn store(&mut self, sequence: u16, payload: &str, checksum: &str) -> StoreResult {
        self.highest_seen_seq = Some(self.highest_seen_seq.map_or(sequence, |h| h.max(sequence)));

        match self.chunks.get(&sequence) {
            Some(existing) if existing.payload == payload && existing.checksum == checksum => {
                StoreResult::Duplicate
            }
            Some(_) => StoreResult::Conflict,
            None => {
                self.encoded_len += payload.len();
                self.chunks.insert(
                    sequence,
                    StoredChunk {
                        payload: payload.to_string(),
                        checksum: checksum.to_string(),
                    },
                );
                StoreResult::Inserted
            }
        }
    }

    /// First sequence in `0..=highest_seen_seq` with no stored chunk
    pub fn first_gap(&self) -> Option<u16> {
        let highest = self.highest_seen_seq?;
        (0..=highest).find(|seq| !self.chunks.contains_key(seq))
    }

    /// Concatenation of the stored chunks contiguous from sequence 0
    pub fn contiguous_prefix(&self) -> String {
        let mut out = String::with_capacity(self.encoded_len);
        for (expected, (seq, chunk)) in (0u16..).zip(self.chunks.iter()) {
            if *seq != expected {
                break;
            }
            out.push_str(&chunk.payload);
        }
        out
    }
}

/// Shared handle to a session
pub type SessionHandle = Arc<Mutex<Session>>;

/// Session store errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("session limit of {0} reached")]
    TooManySessions(usize),

    #[error("session {0} already completed")]
    AlreadyCompleted(String),

    #[error("session {0} was abandoned")]
    Abandoned(String),
}

enum Entry {
    Active(SessionHandle),
    Completed(Instant),
    Abandoned(Instant),
}

impl Entry {
    fn lookup(&self, id: &str) -> Result<SessionHandle, StoreError> {
        match self {
            Entry::Active(handle) => Ok(Arc::clone(handle)),
            Entry::Completed(_) => Err(StoreError::AlreadyCompleted(id.to_string())),
            Entry::Abandoned(_) => Err(StoreError::Abandoned(id.to_string())),
        }
    }
}

/// Registry of sessions keyed by session id
pub struct SessionStore {
    entries: RwLock<HashMap<String, Entry>>,
    max_sessions: usize,
    total_chunks: AtomicUsize,
    max_total_chunks: usize,
}

impl SessionStore {
    pub fn new(max_sessions: usize, max_total_chunks: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_sessions,
            total_chunks: AtomicUsize::new(0),
            max_total_chunks,
        }
    }

    /// Return the open session for `id`, creating it if unseen
    ///
    /// Concurrent callers for the same id always receive the same handle.
    pub async fn get_or_create(&self, id: &str) -> Result<SessionHandle, StoreError> {
        if let Some(entry) = self.entries.read().await.get(id) {
            return entry.lookup(id);
        }

        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get(id) {
            return entry.lookup(id);
        }

        let active = entries
            .values()
            .filter(|e| matches!(e, Entry::Active(_)))
            .count();
        if active >= self.max_sessions {
            return Err(StoreError::TooManySessions(self.max_sessions));
        }

        log::info!("New session {}", id);
        let handle = Arc::new(Mutex::new(Session::new(id)));
        entries.insert(id.to_string(), Entry::Active(Arc::clone(&handle)));
        Ok(handle)
    }

    /// Look up an open session without creating one
    pub async fn get(&self, id: &str) -> Option<SessionHandle> {
        match self.entries.read().await.get(id) {
            Some(Entry::Active(handle)) => Some(Arc::clone(handle)),
            _ => None,
        }
    }

    /// Whether `id` finished and is remembered as completed
    pub async fn is_completed(&self, id: &str) -> bool {
        matches!(self.entries.read().await.get(id), Some(Entry::Completed(_)))
    }

    /// Whether `id` was given up on and is remembered as abandoned
    pub async fn is_abandoned(&self, id: &str) -> bool {
        matches!(self.entries.read().await.get(id), Some(Entry::Abandoned(_)))
    }

    /// Replace a written session with a tombstone, releasing its chunks
    pub async fn complete(&self, id: &str, chunk_count: usize) {
        let mut entries = self.entries.write().await;
        if let Some(Entry::Active(_)) = entries.get(id) {
            self.release_chunks(chunk_count);
        }
        entries.insert(id.to_string(), Entry::Completed(Instant::now()));
    }

    /// Tombstone a session whose lock the caller already holds
    pub async fn abandon(&self, id: &str, chunk_count: usize) {
        let previous = self
            .entries
            .write()
            .await
            .insert(id.to_string(), Entry::Abandoned(Instant::now()));
        if let Some(Entry::Active(_)) = previous {
            self.release_chunks(chunk_count);
        }
    }

    /// Abandon an open session; unknown or finished ids are ignored
    pub async fn evict(&self, id: &str) {
        let handle = {
            let mut entries = self.entries.write().await;
            let handle = match entries.get(id) {
                Some(Entry::Active(handle)) => Arc::clone(handle),
                _ => return,
            };
            entries.insert(id.to_string(), Entry::Abandoned(Instant::now()));
            handle
        };

        let mut session = handle.lock().await;
        if !session.state().is_terminal() {
            session.set_state(SessionState::Abandoned);
        }
        self.release_chunks(session.chunk_count());
        log::debug!("Evicted session {}", id);
    }

    /// Abandon open sessions idle longer than `idle_timeout` and forget
    /// tombstones older than `tombstone_ttl`. Busy sessions are skipped.
    pub async fn evict_idle(&self, idle_timeout: Duration, tombstone_ttl: Duration) -> Vec<String> {
        let mut entries = self.entries.write().await;
        let mut abandoned = Vec::new();

        entries.retain(|_, entry| match entry {
            Entry::Active(_) => true,
            Entry::Completed(at) | Entry::Abandoned(at) => at.elapsed() <= tombstone_ttl,
        });

        let now = Instant::now();
        for (id, entry) in entries.iter_mut() {
            let Entry::Active(handle) = entry else {
                continue;
            };
            let idle = match handle.try_lock() {
                Ok(mut session) if session.idle_for() > idle_timeout => {
                    session.set_state(SessionState::Abandoned);
                    self.release_chunks(session.chunk_count());
                    true
                }
                _ => false,
            };
            if idle {
                abandoned.push(id.clone());
                *entry = Entry::Abandoned(now);
            }
        }

        abandoned
    }

    /// Reserve room for one more stored chunk across all sessions
    pub fn try_reserve_chunk(&self) -> bool {
        self.total_chunks
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_total_chunks).then_some(n + 1)
            })
            .is_ok()
    }

    /// Return a reservation that ended up unused
    pub fn release_chunks(&self, count: usize) {
        let _ = self
            .total_chunks
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(count)));
    }

    pub fn total_chunks(&self) -> usize {
        self.total_chunks.load(Ordering::Acquire)
    }

    /// Number of open sessions
    pub async fn len(&self) -> usize {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| matches!(e, Entry::Active(_)))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_idempotent_and_conflict() {
        let mut session = Session::new("AAAAAA");
        assert_eq!(session.store(0, "MZXW6", "AAA"), StoreResult::Inserted);
        assert_eq!(session.store(0, "MZXW6", "AAA"), StoreResult::Duplicate);
        assert_eq!(session.store(0, "MZXW7", "BBB"), StoreResult::Conflict);

        assert_eq!(session.get(0).unwrap().payload, "MZXW6");
        assert_eq!(session.encoded_len(), 5);
        assert_eq!(session.chunk_count(), 1);
    }

    #[test]
    fn test_prefix_and_gaps() {
        let mut session = Session::new("AAAAAA");
        assert_eq!(session.first_gap(), None);
        assert_eq!(session.contiguous_prefix(), "");

        session.store(2, "CC", "AAA");
        session.store(0, "AA", "AAA");
        assert_eq!(session.highest_seen_seq(), Some(2));
        assert_eq!(session.first_gap(), Some(1));
        assert_eq!(session.contiguous_prefix(), "AA");

        session.store(1, "BB", "AAA");
        assert_eq!(session.first_gap(), None);
        assert_eq!(session.contiguous_prefix(), "AABBCC");
    }

    #[test]
    fn test_terminal_states() {
        assert!(!SessionState::Open.is_terminal());
        assert!(!SessionState::Decoded.is_terminal());
        assert!(SessionState::Written.is_terminal());
        assert!(SessionState::Abandoned.is_terminal());
    }

    #[tokio::test]
    async fn test_get_or_create_returns_same_session() {
        let store = SessionStore::new(10, 100);
        let a = store.get_or_create("AAAAAA").await.unwrap();
        let b = store.get_or_create("AAAAAA").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_creation_resolves_to_one_session() {
        let store = Arc::new(SessionStore::new(10, 100));
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            tasks.push(tokio::spawn(async move {
                store.get_or_create("RACEID").await.unwrap()
            }));
        }

        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap());
        }
        assert!(handles.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_session_limit() {
        let store = SessionStore::new(2, 100);
        store.get_or_create("AAAAAA").await.unwrap();
        store.get_or_create("BBBBBB").await.unwrap();
        assert_eq!(
            store.get_or_create("CCCCCC").await.unwrap_err(),
            StoreError::TooManySessions(2)
        );
        // Existing sessions are still reachable
        assert!(store.get_or_create("AAAAAA").await.is_ok());
    }

    #[tokio::test]
    async fn test_evict_unknown_is_noop() {
        let store = SessionStore::new(2, 100);
        store.evict("ZZZZZZ").await;
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_evict_marks_abandoned_and_releases_chunks() {
        let store = SessionStore::new(2, 100);
        let handle = store.get_or_create("AAAAAA").await.unwrap();
        assert!(store.try_reserve_chunk());
        handle.lock().await.store(0, "MY", "AAA");
        assert_eq!(store.total_chunks(), 1);

        store.evict("AAAAAA").await;
        assert_eq!(handle.lock().await.state(), SessionState::Abandoned);
        assert_eq!(store.total_chunks(), 0);
        assert!(store.get("AAAAAA").await.is_none());
        assert!(store.is_abandoned("AAAAAA").await);
        assert_eq!(
            store.get_or_create("AAAAAA").await.unwrap_err(),
            StoreError::Abandoned("AAAAAA".to_string())
        );
    }

    #[tokio::test]
    async fn test_abandon_leaves_tombstone() {
        let store = SessionStore::new(2, 100);
        let handle = store.get_or_create("AAAAAA").await.unwrap();
        assert!(store.try_reserve_chunk());
        handle.lock().await.store(0, "MY", "AAA");

        store.abandon("AAAAAA", 1).await;
        assert_eq!(store.total_chunks(), 0);
        assert!(store.is_abandoned("AAAAAA").await);
        assert_eq!(store.len().await, 0);
        assert!(matches!(
            store.get_or_create("AAAAAA").await,
            Err(StoreError::Abandoned(_))
        ));

        // Abandoned tombstones expire like completed ones
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.evict_idle(Duration::from_secs(60), Duration::ZERO).await;
        assert!(!store.is_abandoned("AAAAAA").await);
        assert!(store.get_or_create("AAAAAA").await.is_ok());
    }

    #[tokio::test]
    async fn test_completed_tombstone() {
        let store = SessionStore::new(2, 100);
        store.get_or_create("AAAAAA").await.unwrap();
        store.complete("AAAAAA", 0).await;

        assert!(store.is_completed("AAAAAA").await);
        assert_eq!(
            store.get_or_create("AAAAAA").await.unwrap_err(),
            StoreError::AlreadyCompleted("AAAAAA".to_string())
        );
        assert_eq!(store.len().await, 0);

        // Tombstones expire with the idle sweep
        store.evict_idle(Duration::from_secs(60), Duration::ZERO).await;
        assert!(!store.is_completed("AAAAAA").await);
    }

    #[tokio::test]
    async fn test_evict_idle() {
        let store = SessionStore::new(4, 100);
        store.get_or_create("AAAAAA").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let fresh = store.get_or_create("BBBBBB").await.unwrap();
        fresh.lock().await.touch();

        let abandoned = store
            .evict_idle(Duration::from_millis(50), Duration::from_secs(60))
            .await;
        assert_eq!(abandoned, vec!["AAAAAA".to_string()]);
        assert_eq!(store.len().await, 1);
        assert!(store.is_abandoned("AAAAAA").await);
        assert!(matches!(
            store.get_or_create("AAAAAA").await,
            Err(StoreError::Abandoned(_))
        ));
    }

    #[tokio::test]
    async fn test_chunk_budget() {
        let store = SessionStore::new(4, 2);
        assert!(store.try_reserve_chunk());
        assert!(store.try_reserve_chunk());
        assert!(!store.try_reserve_chunk());
        store.release_chunks(1);
        assert!(store.try_reserve_chunk());
    }
}
