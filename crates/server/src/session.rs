use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use crate::completion::Completion;
use crate::engine::PeerHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    /// Offer/answer exchange in flight
    Negotiating,
    /// Local ICE candidates being collected
    Gathering,
    Connected,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationMode {
    /// Server offers, client answers, candidates trickle in afterwards
    Trickle,
    /// Client offers, server answers in one round trip
    SingleShot,
}

/// One WebRTC viewer. Owns the engine handle until [`PeerSession::release`].
pub struct PeerSession {
    id: Uuid,
    mode: NegotiationMode,
    handle: Box<dyn PeerHandle>,
    phase: Mutex<NegotiationPhase>,
    created_at: Instant,
    /// `true` on gathering complete, `false` if the session died first
    gathered: Completion<bool>,
    /// Outcomes of remote answers not yet applied
    pending_answers: Mutex<Vec<Arc<Completion<bool>>>>,
    /// Remote descriptions and remote candidates apply one at a time, in
    /// the order they take this lock
    remote_ops: Arc<tokio::sync::Mutex<()>>,
    /// Resolved once on release; ends the session's event loop
    closed: Completion<()>,
    released: AtomicBool,
}

impl PeerSession {
    pub fn new(id: Uuid, mode: NegotiationMode, handle: Box<dyn PeerHandle>) -> Self {
        Self {
            id,
            mode,
            handle,
            phase: Mutex::new(NegotiationPhase::Negotiating),
            created_at: Instant::now(),
            gathered: Completion::new(),
            pending_answers: Mutex::new(Vec::new()),
            remote_ops: Arc::new(tokio::sync::Mutex::new(())),
            closed: Completion::new(),
            released: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn mode(&self) -> NegotiationMode {
        self.mode
    }

    pub fn handle(&self) -> &dyn PeerHandle {
        self.handle.as_ref()
    }

    pub fn phase(&self) -> NegotiationPhase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_phase(&self, phase: NegotiationPhase) {
        let mut current = self.phase.lock().unwrap_or_else(|e| e.into_inner());
        // Closed is terminal
        if *current != NegotiationPhase::Closed {
            *current = phase;
        }
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn gathered(&self) -> &Completion<bool> {
        &self.gathered
    }

    pub fn closed(&self) -> &Completion<()> {
        &self.closed
    }

    /// Register a completion for one more remote answer. Earlier answers
    /// stay pending. A session that is already released gets a completion
    /// resolved to `false`.
    pub fn begin_answer(&self) -> Arc<Completion<bool>> {
        let done = Arc::new(Completion::new());
        let mut pending = self
            .pending_answers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        // Checked under the lock so a concurrent release always sees this entry.
        if self.released.load(Ordering::Acquire) {
            done.resolve(false);
            return done;
        }
        pending.retain(|answer| !answer.is_resolved());
        pending.push(Arc::clone(&done));
        done
    }

    /// Wait for this session's turn to touch its remote state. Hold the
    /// guard while applying a remote description or candidate.
    pub async fn remote_turn(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.remote_ops).lock_owned().await
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Fail every pending wait and close the engine handle. Runs once;
    /// later calls return immediately.
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.set_phase(NegotiationPhase::Closed);
        self.gathered.resolve(false);
        let pending = std::mem::take(
            &mut *self
                .pending_answers
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        );
        for answer in pending {
            answer.resolve(false);
        }
        self.closed.resolve(());

        if let Err(e) = self.handle.close().await {
            tracing::warn!(session_id = %self.id, "Failed to close peer connection: {e}");
        }
        tracing::debug!(session_id = %self.id, mode = ?self.mode, "Peer session released");
    }
}

#[derive(Debug, thiserror::Error)]
#[error("peer limit of {0} sessions reached")]
pub struct RegistryFull(pub usize);

pub type StreamActiveCallback = Box<dyn Fn(bool) + Send + Sync>;

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<Uuid, Arc<PeerSession>>,
    active: HashSet<Uuid>,
}

/// Live peer sessions plus the set of connected ones.
///
/// Safe to share between request handlers and engine event tasks. Every
/// mutation happens under one lock, and the stream-active callback runs
/// inside that same critical section, so it observes exactly one call per
/// empty/non-empty transition of the active set. The callback must not call
/// back into the registry.
pub struct PeerRegistry {
    inner: Mutex<RegistryInner>,
    max_peers: usize,
    on_stream_active: Option<StreamActiveCallback>,
}

impl PeerRegistry {
    /// `max_peers` of 0 tracks any number of sessions.
    pub fn new(max_peers: usize) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            max_peers,
            on_stream_active: None,
        }
    }

    /// Invoke `callback(true)` when the first peer connects and
    /// `callback(false)` when the last connected peer goes away.
    pub fn with_stream_active_callback(
        mut self,
        callback: impl Fn(bool) + Send + Sync + 'static,
    ) -> Self {
        self.on_stream_active = Some(Box::new(callback));
        self
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut RegistryInner) -> R) -> R {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let was_empty = inner.active.is_empty();
        let result = f(&mut inner);
        let is_empty = inner.active.is_empty();
        if was_empty != is_empty {
            tracing::info!(active = !is_empty, "Stream activity changed");
            if let Some(callback) = &self.on_stream_active {
                callback(!is_empty);
            }
        }
        result
    }

    pub fn insert(&self, session: Arc<PeerSession>) -> Result<(), RegistryFull> {
        self.mutate(|inner| {
            if self.max_peers != 0 && inner.sessions.len() >= self.max_peers {
                return Err(RegistryFull(self.max_peers));
            }
            inner.sessions.insert(session.id(), session);
            Ok(())
        })
    }

    pub fn is_full(&self) -> bool {
        self.max_peers != 0 && self.len() >= self.max_peers
    }

    pub fn max_peers(&self) -> usize {
        self.max_peers
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<PeerSession>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.sessions.get(&id).cloned()
    }

    /// Move a tracked session into the active set. Returns `false` for
    /// sessions no longer tracked, which are never re-added.
    pub fn mark_connected(&self, id: Uuid) -> bool {
        self.mutate(|inner| match inner.sessions.get(&id) {
            Some(session) => {
                session.set_phase(NegotiationPhase::Connected);
                inner.active.insert(id);
                true
            }
            None => false,
        })
    }

    /// Stop tracking a session. The caller releases the returned session.
    pub fn remove(&self, id: Uuid) -> Option<Arc<PeerSession>> {
        self.mutate(|inner| {
            inner.active.remove(&id);
            inner.sessions.remove(&id)
        })
    }

    /// Stop tracking every session; used on shutdown.
    pub fn drain(&self) -> Vec<Arc<PeerSession>> {
        self.mutate(|inner| {
            inner.active.clear();
            inner.sessions.drain().map(|(_, session)| session).collect()
        })
    }

    /// Sessions older than `max_age` that never reached `connected`.
    pub fn stale_sessions(&self, max_age: Duration) -> Vec<Uuid> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .sessions
            .values()
            .filter(|s| !inner.active.contains(&s.id()) && s.age() > max_age)
            .map(|s| s.id())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .sessions
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .active
            .len()
    }
}
