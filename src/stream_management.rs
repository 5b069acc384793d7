//! Component G: XEP-0198 Stream Management.
//!
//! This module owns the §3 Stream Management *state* (counters, replay
//! cache, resumption bookkeeping) and the pure timing decisions of the tick
//! (`TickAction`). It does not itself own a transport or reconnect: the
//! actual reconnect I/O needs a fresh [`crate::transport::Transport`] and a
//! respawned dispatcher, both of which only [`crate::session::Session`] has
//! the handles for. [`SmEngine`] is the decision-making half of the state
//! machine; [`crate::session`] is the driver loop that calls it and acts on
//! its answers.
//!
//! Grounded on the teacher's `stanzastream::stream_management` for the
//! counter/cache shape, simplified from its worker-actor form into a
//! `Mutex`-guarded state plus pure query methods, since this crate drives
//! reconnection from a single `Session`-owned task rather than a mailbox
//! actor.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use minidom::Element;
use tokio::sync::Mutex;

use crate::error::ProtocolError;
use crate::stanza::Stanza;

/// Timing knobs for the engine. Defaults match spec: tick every 10 s, ack
/// request every 3rd stanza or 20 s of silence, 60 s silence before a
/// resumption attempt starts, up to 3 resumption attempts 30 s apart, then
/// up to 3 reconnect attempts 30 s apart before failing permanently.
#[derive(Debug, Clone, Copy)]
pub struct SmConfig {
    /// How often the maintenance tick fires.
    pub tick_interval: Duration,
    /// Send `<r/>` after this many outbound stanzas since the last one.
    pub ack_every: u32,
    /// Send `<r/>` after this much silence from the peer, regardless of
    /// count.
    pub ack_silence: Duration,
    /// Silence from the peer after which a resumption attempt begins.
    pub silence_to_resume: Duration,
    /// Interval between resumption attempts.
    pub resume_attempt_interval: Duration,
    /// Resumption attempts to make before escalating to full reconnect.
    pub resume_max_attempts: u32,
    /// Interval between full-reconnect attempts.
    pub reconnect_attempt_interval: Duration,
    /// Reconnect attempts to make before failing permanently.
    pub reconnect_max_attempts: u32,
}

impl Default for SmConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(10),
            ack_every: 3,
            ack_silence: Duration::from_secs(20),
            silence_to_resume: Duration::from_secs(60),
            resume_attempt_interval: Duration::from_secs(30),
            resume_max_attempts: 3,
            reconnect_attempt_interval: Duration::from_secs(30),
            reconnect_max_attempts: 3,
        }
    }
}

/// XEP-0198 state: counters, replay cache, resumption bookkeeping.
///
/// `None` at the [`SmEngine`] level means Stream Management has never been
/// enabled for this session; once enabled, the state persists across
/// resumption attempts and is only reset wholesale on a full reconnect
/// that re-enables from scratch.
pub struct SmState {
    /// Stream Management is currently active.
    pub enabled: bool,
    /// Server granted resumption (`resume='true'` on `<enabled/>`).
    pub resumption_enabled: bool,
    /// Opaque token presented on `<resume previd='...'/>`.
    pub resumption_id: Option<String>,
    /// Server's advertised resumption budget, in seconds.
    pub max_resume_seconds: u32,
    /// Count of SM-eligible stanzas sent since enable/resume.
    pub outbound_seq: u32,
    /// Count of SM-eligible stanzas received.
    pub inbound_seq: u32,
    /// Highest `h` the server has acknowledged.
    pub last_server_ack: u32,
    /// When `last_server_ack` was last updated (or the engine last heard
    /// from the peer at all).
    pub last_server_ack_time: Instant,
    /// Every SM-eligible stanza sent but not yet acknowledged, oldest first.
    pub replay_cache: VecDeque<Stanza>,
    /// `h` reported by the server on a failed resume; used to trim the
    /// cache correctly once a subsequent full reconnect re-enables SM.
    pub pending_resume_h: Option<u32>,
}

impl SmState {
    fn new(now: Instant) -> Self {
        Self {
            enabled: false,
            resumption_enabled: false,
            resumption_id: None,
            max_resume_seconds: 0,
            outbound_seq: 0,
            inbound_seq: 0,
            last_server_ack: 0,
            last_server_ack_time: now,
            replay_cache: VecDeque::new(),
            pending_resume_h: None,
        }
    }

    /// Record a successfully-sent SM-eligible stanza. Called by
    /// [`crate::writer::Writer`] in the same critical section as the write.
    pub fn record_outbound(&mut self, stanza: Stanza) {
        self.outbound_seq += 1;
        self.replay_cache.push_back(stanza);
    }

    /// Record a received SM-eligible element. Called by the dispatcher.
    pub fn record_inbound(&mut self) {
        self.inbound_seq += 1;
    }

    fn trim_front(&mut self, count: u32) {
        for _ in 0..count {
            if self.replay_cache.pop_front().is_none() {
                break;
            }
        }
    }

    /// Apply a server ack: trim the cache by `h - last_server_ack` entries
    /// and advance the watermark.
    pub fn handle_ack(&mut self, h: u32, now: Instant) {
        let trim = h.saturating_sub(self.last_server_ack);
        self.trim_front(trim);
        self.last_server_ack = h;
        self.last_server_ack_time = now;
    }

    /// Trim the cache using a previously recorded `pending_resume_h`
    /// (set by a failed-resume-with-`item-not-found`), then clear it.
    /// Returns the stanzas remaining in the cache, in send order, for
    /// replay.
    pub fn apply_pending_resume_trim(&mut self) -> Vec<Stanza> {
        if let Some(h) = self.pending_resume_h.take() {
            let trim = h.saturating_sub(self.last_server_ack);
            self.trim_front(trim);
            self.last_server_ack = h;
        }
        self.replay_snapshot()
    }

    /// A snapshot of the replay cache, in send order. Replays iterate this
    /// snapshot rather than the live `VecDeque`, so that concurrent trims
    /// from an ack arriving mid-replay can't desynchronise the iterator
    /// from the structure it's iterating (the source's bug, per design
    /// notes: it indexed the queue while draining it).
    pub fn replay_snapshot(&self) -> Vec<Stanza> {
        self.replay_cache.iter().cloned().collect()
    }

    fn should_send_ack_request(&self, now: Instant, config: &SmConfig) -> bool {
        let by_count = self.outbound_seq > 0 && self.outbound_seq % config.ack_every == 0;
        let by_silence = now.duration_since(self.last_server_ack_time) > config.ack_silence;
        by_count || by_silence
    }
}

/// Current position in the §4.G state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmPhase {
    /// Stream is up and (if SM is enabled) acks are flowing normally.
    Connected,
    /// Attempting to resume a dropped stream on a fresh TCP connection.
    Resuming,
    /// Resumption attempts exhausted; attempting a full reconnect + bind.
    Reconnecting,
    /// Reconnect budget exhausted. Terminal.
    Failed,
}

/// What the tick wants the driver loop (in [`crate::session`]) to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickAction {
    /// Nothing to do this tick.
    None,
    /// Send a bare `<r/>` ack request.
    SendAckRequest,
    /// Silence exceeded the resume threshold; start resuming.
    BeginResume,
    /// Still resuming and the per-attempt interval elapsed; try again.
    RetryResume,
    /// Resumption attempts exhausted; switch to full reconnect.
    EscalateToReconnect,
    /// Still reconnecting and the per-attempt interval elapsed; try again.
    RetryReconnect,
    /// Reconnect attempts exhausted. The session is now permanently down.
    FailPermanently,
}

/// How a `<failed/>` resume response should be handled, per §9's Open
/// Question resolution: only an `item-not-found` failure triggers the
/// trim-then-reconnect path; anything else is surfaced as a plain error,
/// never as `StreamResumed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedResumeOutcome {
    /// Server reported `item-not-found`; fall back to a full reconnect and
    /// let the next `<enabled/>` trim the cache using the stored `h`.
    ReconnectAndReenable,
    /// Any other condition: surface an error, do not claim resumption.
    SurfaceError,
}

/// The decision-making half of the Stream Management state machine. Holds
/// the shared, dispatcher/writer-visible [`SmState`] plus the phase and
/// attempt bookkeeping that only the tick driver touches.
pub struct SmEngine {
    config: SmConfig,
    state: Arc<Mutex<Option<SmState>>>,
    phase: Mutex<SmPhase>,
    resume_attempts: Mutex<u32>,
    reconnect_attempts: Mutex<u32>,
    phase_started: Mutex<Instant>,
}

impl SmEngine {
    /// Construct an engine with SM not yet enabled.
    pub fn new(config: SmConfig, now: Instant) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(None)),
            phase: Mutex::new(SmPhase::Connected),
            resume_attempts: Mutex::new(0),
            reconnect_attempts: Mutex::new(0),
            phase_started: Mutex::new(now),
        }
    }

    /// The shared state handle, cloned into [`crate::writer::Writer`] and
    /// the dispatcher so both can record traffic atomically with it.
    pub fn shared_state(&self) -> Arc<Mutex<Option<SmState>>> {
        self.state.clone()
    }

    pub fn config(&self) -> &SmConfig {
        &self.config
    }

    /// Build the `<enable/>` nonza for the given parameters.
    pub fn enable_request(with_resumption: bool, max_seconds: u32) -> Element {
        let mut el = Element::builder("enable", "urn:xmpp:sm:3")
            .attr("resume", if with_resumption { "true" } else { "false" });
        if max_seconds > 0 {
            el = el.attr("max", max_seconds.to_string());
        }
        el.build()
    }

    /// Build the `<resume/>` nonza for a resumption attempt.
    pub fn resume_request(h: u32, previd: &str) -> Element {
        Element::builder("resume", "urn:xmpp:sm:3")
            .attr("h", h.to_string())
            .attr("previd", previd)
            .build()
    }

    /// Build a bare `<r/>` ack request.
    pub fn ack_request() -> Element {
        Element::builder("r", "urn:xmpp:sm:3").build()
    }

    /// Build an `<a h='...'/>` ack reply to the peer's `<r/>`.
    pub fn ack_reply(h: u32) -> Element {
        Element::builder("a", "urn:xmpp:sm:3")
            .attr("h", h.to_string())
            .build()
    }

    /// Handle a server `<enabled .../>`. Creates `SmState` if this is a
    /// fresh enable, or reuses the existing one (trimming by
    /// `pending_resume_h` first) if this enable follows a reconnect after a
    /// failed, `item-not-found` resume. Returns the stanzas that must now
    /// be replayed, in order.
    ///
    /// Unlike `<resumed/>`, a fresh `<enabled/>` always starts a brand-new
    /// XEP-0198 numbering — the server's `h` restarts at 0, whether or not
    /// this is the very first enable of the session. So whenever this call
    /// reuses a pre-existing `SmState` (a reconnect-and-reenable, not the
    /// session's first enable), `outbound_seq`/`last_server_ack` are reset
    /// to match: the stanzas still outstanding become the first
    /// `replay.len()` of the new numbering rather than keeping their old
    /// sequence numbers.
    pub async fn handle_enabled(
        &self,
        resume: bool,
        id: Option<String>,
        max: u32,
        now: Instant,
    ) -> Vec<Stanza> {
        let mut guard = self.state.lock().await;
        let is_reenable = guard.is_some();
        let state = guard.get_or_insert_with(|| SmState::new(now));
        state.enabled = true;
        state.resumption_enabled = resume;
        state.resumption_id = id;
        state.max_resume_seconds = max;
        state.last_server_ack_time = now;

        let replay = if state.pending_resume_h.is_some() {
            state.apply_pending_resume_trim()
        } else {
            state.replay_snapshot()
        };

        if is_reenable {
            state.last_server_ack = 0;
            state.outbound_seq = replay.len() as u32;
            state.pending_resume_h = None;
        }

        drop(guard);
        self.mark_connected(now).await;
        replay
    }

    /// Handle `<a h='K'/>`.
    pub async fn handle_ack(&self, h: u32, now: Instant) {
        if let Some(state) = self.state.lock().await.as_mut() {
            state.handle_ack(h, now);
        }
    }

    /// Handle `<resumed h='K'/>`: trim, return the replay set, and advance
    /// the ack watermark.
    pub async fn handle_resumed(&self, h: u32, now: Instant) -> Vec<Stanza> {
        let replay = {
            let mut guard = self.state.lock().await;
            let state = guard.as_mut().expect("resume requires prior enable");
            state.handle_ack(h, now);
            state.replay_snapshot()
        };
        self.mark_connected(now).await;
        replay
    }

    /// Handle `<failed>`. `item_not_found` reflects whether the failure
    /// element carried an `<item-not-found/>` child; `h` is its `h`
    /// attribute, if present.
    pub async fn handle_failed(&self, item_not_found: bool, h: Option<u32>) -> FailedResumeOutcome {
        if item_not_found {
            if let (Some(state), Some(h)) = (self.state.lock().await.as_mut(), h) {
                state.pending_resume_h = Some(h);
            }
            FailedResumeOutcome::ReconnectAndReenable
        } else {
            FailedResumeOutcome::SurfaceError
        }
    }

    /// `true` if the tick should ask the dispatcher to send `<r/>`.
    pub async fn wants_ack_request(&self, now: Instant) -> bool {
        match self.state.lock().await.as_ref() {
            Some(state) if state.enabled => state.should_send_ack_request(now, &self.config),
            _ => false,
        }
    }

    async fn last_heard_from(&self) -> Option<Instant> {
        self.state
            .lock()
            .await
            .as_ref()
            .filter(|s| s.enabled)
            .map(|s| s.last_server_ack_time)
    }

    /// Decide what the tick should do, given the current time. Advances the
    /// internal phase/attempt bookkeeping for transitions it reports (so
    /// callers don't separately need to call a `begin_*`/`escalate_*`
    /// method — the single `tick` call is both the decision and the
    /// transition).
    ///
    /// Drop detection is evaluated before the ack-request cadence: silence
    /// past `ack_silence` (20s) is, by construction, also silence past
    /// nothing longer, but `ack_silence` is always shorter than
    /// `silence_to_resume` (60s), so once a stream goes quiet the ack-request
    /// condition would otherwise keep firing forever and the
    /// `Connected -> Resuming` transition below would never be reached.
    pub async fn tick(&self, now: Instant) -> TickAction {
        let Some(last_heard) = self.last_heard_from().await else {
            return TickAction::None;
        };

        let mut phase = self.phase.lock().await;
        match *phase {
            SmPhase::Connected => {
                if now.duration_since(last_heard) > self.config.silence_to_resume {
                    *phase = SmPhase::Resuming;
                    *self.phase_started.lock().await = now;
                    *self.resume_attempts.lock().await = 1;
                    return TickAction::BeginResume;
                }
                drop(phase);
                if self.wants_ack_request(now).await {
                    TickAction::SendAckRequest
                } else {
                    TickAction::None
                }
            }
            SmPhase::Resuming => {
                let started = *self.phase_started.lock().await;
                if now.duration_since(started) <= self.config.resume_attempt_interval {
                    return TickAction::None;
                }
                let mut attempts = self.resume_attempts.lock().await;
                if *attempts < self.config.resume_max_attempts {
                    *attempts += 1;
                    *self.phase_started.lock().await = now;
                    TickAction::RetryResume
                } else {
                    *phase = SmPhase::Reconnecting;
                    *self.phase_started.lock().await = now;
                    *self.reconnect_attempts.lock().await = 1;
                    TickAction::EscalateToReconnect
                }
            }
            SmPhase::Reconnecting => {
                let started = *self.phase_started.lock().await;
                if now.duration_since(started) <= self.config.reconnect_attempt_interval {
                    return TickAction::None;
                }
                let mut attempts = self.reconnect_attempts.lock().await;
                if *attempts < self.config.reconnect_max_attempts {
                    *attempts += 1;
                    *self.phase_started.lock().await = now;
                    TickAction::RetryReconnect
                } else {
                    *phase = SmPhase::Failed;
                    TickAction::FailPermanently
                }
            }
            SmPhase::Failed => TickAction::None,
        }
    }

    /// Reset to `Connected` after a successful resume, reconnect, or fresh
    /// enable. Clears all resumption-progress bookkeeping.
    pub async fn mark_connected(&self, now: Instant) {
        *self.phase.lock().await = SmPhase::Connected;
        *self.phase_started.lock().await = now;
        *self.resume_attempts.lock().await = 0;
        *self.reconnect_attempts.lock().await = 0;
    }

    /// Current phase, for diagnostics and tests.
    pub async fn phase(&self) -> SmPhase {
        *self.phase.lock().await
    }

    /// Record that a write to the transport just failed. A dead transport
    /// otherwise goes unnoticed by the tick: the failed `<r/>` never updates
    /// `last_server_ack_time`, so without this the silence clock never
    /// starts and the engine keeps re-issuing ack requests instead of
    /// transitioning to `Resuming`. Backdating the watermark past
    /// `silence_to_resume` makes the very next tick treat it as dropped.
    pub async fn note_write_failure(&self, now: Instant) {
        if let Some(state) = self.state.lock().await.as_mut() {
            if state.enabled {
                state.last_server_ack_time = now
                    .checked_sub(self.config.silence_to_resume + Duration::from_secs(1))
                    .unwrap_or(now);
            }
        }
    }
}

/// Parse a `<failed>` element's `h` attribute and whether it carries an
/// `item-not-found` child.
pub fn parse_failed(el: &Element) -> (bool, Option<u32>) {
    let item_not_found = el.children().any(|c| c.name() == "item-not-found");
    let h = el.attr("h").and_then(|s| s.parse().ok());
    (item_not_found, h)
}

/// Parse an `<enabled>` element's `resume`/`id`/`max` attributes.
pub fn parse_enabled(el: &Element) -> Result<(bool, Option<String>, u32), ProtocolError> {
    let resume = matches!(el.attr("resume"), Some("true") | Some("1"));
    let id = el.attr("id").map(str::to_owned);
    let max = el
        .attr("max")
        .map(|s| {
            s.parse()
                .map_err(|_| ProtocolError::MalformedStreamManagement("non-numeric max".into()))
        })
        .transpose()?
        .unwrap_or(0);
    Ok((resume, id, max))
}

/// Parse an `<a h='K'/>` element's `h` attribute.
pub fn parse_ack(el: &Element) -> Result<u32, ProtocolError> {
    el.attr("h")
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ProtocolError::MalformedStreamManagement("<a/> missing h".into()))
}

/// Parse a `<resumed h='K'/>` element's `h` attribute.
pub fn parse_resumed(el: &Element) -> Result<u32, ProtocolError> {
    el.attr("h")
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ProtocolError::MalformedStreamManagement("<resumed/> missing h".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stanza::{Header, Message};

    fn msg() -> Stanza {
        Stanza::Message(Message {
            header: Header::default(),
            payload: Element::builder("payload", "jabber:client").build(),
        })
    }

    #[test]
    fn cache_length_matches_outbound_minus_ack() {
        let mut state = SmState::new(Instant::now());
        state.record_outbound(msg());
        state.record_outbound(msg());
        state.record_outbound(msg());
        assert_eq!(state.replay_cache.len(), 3);
        state.handle_ack(2, Instant::now());
        assert_eq!(state.last_server_ack, 2);
        assert_eq!(state.replay_cache.len(), (state.outbound_seq - state.last_server_ack) as usize);
    }

    #[test]
    fn ack_cadence_triggers_every_third_stanza() {
        let config = SmConfig::default();
        let mut state = SmState::new(Instant::now());
        for i in 1..=3 {
            state.record_outbound(msg());
            let now = state.last_server_ack_time;
            assert_eq!(state.should_send_ack_request(now, &config), i == 3);
        }
    }

    #[test]
    fn pending_resume_trim_keeps_only_the_suffix() {
        let mut state = SmState::new(Instant::now());
        for _ in 0..5 {
            state.record_outbound(msg());
        }
        state.handle_ack(3, Instant::now());
        state.pending_resume_h = Some(4);
        let replay = state.apply_pending_resume_trim();
        assert_eq!(replay.len(), 1);
        assert_eq!(state.last_server_ack, 4);
    }

    #[tokio::test]
    async fn tick_escalates_resume_to_reconnect_after_budget() {
        let config = SmConfig {
            silence_to_resume: Duration::from_millis(0),
            resume_attempt_interval: Duration::from_millis(0),
            resume_max_attempts: 2,
            ..SmConfig::default()
        };
        let t0 = Instant::now();
        let engine = SmEngine::new(config, t0);
        engine.handle_enabled(true, Some("abc".into()), 60, t0).await;

        assert_eq!(engine.tick(t0).await, TickAction::BeginResume);
        assert_eq!(engine.phase().await, SmPhase::Resuming);
        assert_eq!(engine.tick(t0).await, TickAction::RetryResume);
        assert_eq!(engine.tick(t0).await, TickAction::EscalateToReconnect);
        assert_eq!(engine.phase().await, SmPhase::Reconnecting);
    }

    #[test]
    fn failed_resume_with_item_not_found_reconnects() {
        let el = Element::builder("failed", "urn:xmpp:sm:3")
            .append(Element::builder("item-not-found", "urn:ietf:params:xml:ns:xmpp-stanzas").build())
            .attr("h", "4")
            .build();
        let (inf, h) = parse_failed(&el);
        assert!(inf);
        assert_eq!(h, Some(4));
    }
}
