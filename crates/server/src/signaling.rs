//! WebRTC signaling orchestrator.
//!
//! Turns HTTP-carried offers, answers and candidates into tracked peer
//! sessions. Two flows share the same session type:
//!
//! - trickle: [`Orchestrator::create_offer`] → client answer via
//!   [`Orchestrator::process_answer`] → candidates via
//!   [`Orchestrator::add_ice_candidate`];
//! - single-shot: [`Orchestrator::process_offer`] answers a client offer in
//!   one call.
//!
//! Each session gets one task that consumes its engine events; terminal
//! connection states remove the session from the registry and release it.

use std::sync::Arc;
use std::time::Duration;

use camcast_protocol::{IceCandidatePayload, SignalingConfig};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::{ConnectionState, EngineError, EngineEvent, PeerEngine, SessionDescription};
use crate::session::{NegotiationMode, NegotiationPhase, PeerRegistry, PeerSession, RegistryFull};

#[derive(Debug, Clone, Copy)]
pub struct NegotiationSettings {
    pub gathering_timeout: Duration,
    pub answer_timeout: Duration,
    pub answer_waits_for_gathering: bool,
}

impl From<&SignalingConfig> for NegotiationSettings {
    fn from(config: &SignalingConfig) -> Self {
        Self {
            gathering_timeout: Duration::from_secs(config.gathering_timeout_secs),
            answer_timeout: Duration::from_secs(config.answer_timeout_secs),
            answer_waits_for_gathering: config.answer_waits_for_gathering,
        }
    }
}

impl Default for NegotiationSettings {
    fn default() -> Self {
        Self::from(&SignalingConfig::default())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    #[error("peer engine error: {0}")]
    Engine(#[from] EngineError),
    #[error(transparent)]
    PeerLimit(#[from] RegistryFull),
    #[error("unknown session {0}")]
    UnknownSession(Uuid),
    #[error("ICE gathering did not complete within {0:?}")]
    GatheringTimedOut(Duration),
    #[error("remote description not applied within {0:?}")]
    AnswerTimedOut(Duration),
    #[error("remote description rejected")]
    AnswerRejected,
    #[error("session closed during negotiation")]
    SessionClosed,
    #[error("engine produced no local description")]
    NoLocalDescription,
}

pub struct Orchestrator {
    engine: Arc<dyn PeerEngine>,
    registry: Arc<PeerRegistry>,
    settings: NegotiationSettings,
}

impl Orchestrator {
    pub fn new(
        engine: Arc<dyn PeerEngine>,
        registry: Arc<PeerRegistry>,
        settings: NegotiationSettings,
    ) -> Self {
        Self {
            engine,
            registry,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// Trickle flow, step 1: open a session and return its offer once local
    /// ICE gathering has completed.
    pub async fn create_offer(&self) -> Result<(Uuid, String), SignalingError> {
        let session = self.open_session(NegotiationMode::Trickle).await?;
        let id = session.id();

        match self.negotiate_offer(&session).await {
            Ok(sdp) => {
                info!(session_id = %id, "Offer ready");
                Ok((id, sdp))
            }
            Err(e) => {
                warn!(session_id = %id, "Offer negotiation failed: {e}");
                self.teardown(id).await;
                Err(e)
            }
        }
    }

    async fn negotiate_offer(&self, session: &PeerSession) -> Result<String, SignalingError> {
        let offer = session.handle().create_offer().await?;
        session.handle().set_local_description(offer).await?;
        session.set_phase(NegotiationPhase::Gathering);
        self.await_gathering(session).await?;
        self.local_sdp(session).await
    }

    /// Trickle flow, step 2: apply the client's answer to session `id`.
    pub async fn process_answer(&self, id: Uuid, sdp: String) -> Result<(), SignalingError> {
        let session = self
            .registry
            .get(id)
            .ok_or(SignalingError::UnknownSession(id))?;

        let done = session.begin_answer();
        let outcome = tokio::time::timeout(self.settings.answer_timeout, async {
            // Queue behind earlier answers and candidates for this session.
            let turn = session.remote_turn().await;
            let applier = Arc::clone(&session);
            let resolver = Arc::clone(&done);
            // Detached so a timeout never cancels the engine mid-apply.
            tokio::spawn(async move {
                let _turn = turn;
                // Released or timed out while queued
                if resolver.is_resolved() {
                    return;
                }
                let applied = match applier
                    .handle()
                    .set_remote_description(SessionDescription::answer(sdp))
                    .await
                {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(session_id = %applier.id(), "Failed to set remote answer: {e}");
                        false
                    }
                };
                resolver.resolve(applied);
            });
            done.wait().await
        })
        .await;
        let result = match outcome {
            Ok(Some(true)) => return Ok(()),
            Ok(Some(false)) if session.is_released() => Err(SignalingError::SessionClosed),
            Ok(_) => Err(SignalingError::AnswerRejected),
            Err(_) => {
                done.resolve(false);
                Err(SignalingError::AnswerTimedOut(self.settings.answer_timeout))
            }
        };
        self.teardown(id).await;
        result
    }

    /// Trickle flow, step 3: forward remote candidates in order, after any
    /// answer already in flight for the session. Unknown sessions are ignored.
    pub async fn add_ice_candidate(&self, id: Uuid, candidate: IceCandidatePayload) {
        let Some(session) = self.registry.get(id) else {
            debug!(session_id = %id, "Ignoring ICE candidate for unknown session");
            return;
        };
        let _turn = session.remote_turn().await;
        if let Err(e) = session.handle().add_ice_candidate(candidate).await {
            warn!(session_id = %id, "Failed to add remote ICE candidate: {e}");
        }
    }

    /// Single-shot flow: answer a client offer.
    pub async fn process_offer(&self, sdp: String) -> Result<String, SignalingError> {
        let session = self.open_session(NegotiationMode::SingleShot).await?;
        let id = session.id();

        match self.negotiate_answer(&session, sdp).await {
            Ok(answer) => {
                info!(session_id = %id, "Answer ready");
                Ok(answer)
            }
            Err(e) => {
                warn!(session_id = %id, "Answer negotiation failed: {e}");
                self.teardown(id).await;
                Err(e)
            }
        }
    }

    async fn negotiate_answer(
        &self,
        session: &PeerSession,
        offer: String,
    ) -> Result<String, SignalingError> {
        let handle = session.handle();
        handle
            .set_remote_description(SessionDescription::offer(offer))
            .await?;
        let answer = handle.create_answer().await?;
        let answer_sdp = answer.sdp.clone();
        handle.set_local_description(answer).await?;

        if !self.settings.answer_waits_for_gathering {
            return Ok(answer_sdp);
        }
        session.set_phase(NegotiationPhase::Gathering);
        self.await_gathering(session).await?;
        self.local_sdp(session).await
    }

    async fn await_gathering(&self, session: &PeerSession) -> Result<(), SignalingError> {
        let timeout = self.settings.gathering_timeout;
        match tokio::time::timeout(timeout, session.gathered().wait()).await {
            Ok(Some(true)) => Ok(()),
            Ok(_) => Err(SignalingError::SessionClosed),
            Err(_) => Err(SignalingError::GatheringTimedOut(timeout)),
        }
    }

    async fn local_sdp(&self, session: &PeerSession) -> Result<String, SignalingError> {
        match session.handle().local_description().await {
            Some(desc) if !desc.sdp.is_empty() => Ok(desc.sdp),
            _ => Err(SignalingError::NoLocalDescription),
        }
    }

    async fn open_session(&self, mode: NegotiationMode) -> Result<Arc<PeerSession>, SignalingError> {
        if self.registry.is_full() {
            return Err(RegistryFull(self.registry.max_peers()).into());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.engine.create_peer(tx).await?;
        let session = Arc::new(PeerSession::new(Uuid::new_v4(), mode, handle));

        if let Err(e) = self.registry.insert(Arc::clone(&session)) {
            session.release().await;
            return Err(e.into());
        }
        debug!(session_id = %session.id(), ?mode, peers = self.registry.len(), "Peer session opened");

        tokio::spawn(run_session_events(
            Arc::clone(&self.registry),
            Arc::clone(&session),
            rx,
        ));
        Ok(session)
    }

    /// Remove and release a session. No-op for unknown ids.
    pub async fn teardown(&self, id: Uuid) {
        if let Some(session) = self.registry.remove(id) {
            session.release().await;
        }
    }

    /// Tear down sessions that never connected within `max_age`.
    pub async fn reap_stale(&self, max_age: Duration) -> usize {
        let stale = self.registry.stale_sessions(max_age);
        for id in &stale {
            if let Some(session) = self.registry.remove(*id) {
                info!(
                    session_id = %id,
                    mode = ?session.mode(),
                    phase = ?session.phase(),
                    "Reaping peer session stuck in negotiation"
                );
                session.release().await;
            }
        }
        stale.len()
    }

    /// Release every session; used on shutdown.
    pub async fn close_all(&self) {
        if self.registry.is_empty() {
            return;
        }
        let sessions = self.registry.drain();
        let count = sessions.len();
        for session in sessions {
            session.release().await;
        }
        if count > 0 {
            info!(count, "Closed all peer sessions");
        }
    }
}

/// Single entry point for one session's engine events, applied in arrival order.
async fn run_session_events(
    registry: Arc<PeerRegistry>,
    session: Arc<PeerSession>,
    mut events: mpsc::UnboundedReceiver<EngineEvent>,
) {
    let id = session.id();
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = session.closed().wait() => None,
        };
        let Some(event) = event else { break };

        match event {
            EngineEvent::GatheringComplete => {
                if session.gathered().resolve(true) {
                    debug!(session_id = %id, "Local ICE gathering complete");
                }
            }
            EngineEvent::CandidateGathered(candidate) => {
                debug!(session_id = %id, candidate = %candidate.candidate, "Local ICE candidate gathered");
            }
            EngineEvent::ConnectionState(state) => {
                info!(
                    session_id = %id,
                    mode = ?session.mode(),
                    phase = ?session.phase(),
                    ?state,
                    "Peer connection state changed"
                );
                if state == ConnectionState::Connected {
                    if registry.mark_connected(id) {
                        info!(session_id = %id, active = registry.active_count(), "Peer connected");
                    }
                } else if state.is_terminal() {
                    if let Some(removed) = registry.remove(id) {
                        removed.release().await;
                    }
                    break;
                }
            }
        }
    }
    debug!(session_id = %id, "Peer event loop finished");
}
