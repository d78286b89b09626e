//! Game session state machine.
//!
//! Owns turn order, betting, guessing, marble settlement, and the
//! consequences of participants dropping out. A `Session` has no internal
//! locking; callers serialize access (see [`SharedSession`](super::registry::SharedSession)).
//!
//! # Phases
//!
//! ```text
//! Waiting ──start_game──▶ Betting ──place_bet──▶ Guessing ──resolve──▶ Result
//!    ▲                       ▲                                          │
//!    │                       └───────────── advance (≥2 left) ──────────┤
//!    │                                                                  │
//!    └──── reset_for_rematch (<2 connected) ──── Finished ◀─ advance ───┘
//! ```
//!
//! Any in-round phase can also be forced to `Finished` when dropouts leave
//! at most one available participant.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info};

use tokio::task::JoinHandle;

use super::connection::{ceil_secs, spawn_keepalive, EpochClock, Subscription};
use super::participant::{Guess, Participant};
use crate::config::SessionConfig;

/// Session phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Lobby, before the first round
    #[default]
    Waiting,
    /// Current holder must hide some marbles
    Betting,
    /// Everyone else guesses the parity
    Guessing,
    /// Round settled, waiting for advance
    Result,
    /// Game over
    Finished,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Betting => "betting",
            Self::Guessing => "guessing",
            Self::Result => "result",
            Self::Finished => "finished",
        }
    }

    /// Betting, guessing or showing a result.
    pub fn is_in_round(&self) -> bool {
        matches!(self, Self::Betting | Self::Guessing | Self::Result)
    }
}

/// Name and token of a participant, as captured in a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlayerRef {
    pub token: String,
    pub name: String,
}

impl PlayerRef {
    fn of(p: &Participant) -> Self {
        Self {
            token: p.token.clone(),
            name: p.display_name.clone(),
        }
    }
}

/// Snapshot of a settled round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoundResult {
    pub placer: PlayerRef,
    pub amount: u32,
    pub is_even: bool,
    pub winners: Vec<PlayerRef>,
    pub losers: Vec<PlayerRef>,
    /// Marbles each winner received
    pub paid_per_winner: u32,
    /// Positive when the placer lost marbles overall
    pub placer_net_loss: i64,
}

impl RoundResult {
    pub fn placer_gained(&self) -> bool {
        self.placer_net_loss < 0
    }
}

/// Rejected session operations. The session is left untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("not this participant's turn")]
    InvalidTurn,
    #[error("bet amount out of range")]
    InvalidAmount,
    #[error("operation not allowed in the current phase")]
    WrongPhase,
    #[error("only the host can do that")]
    Unauthorized,
    #[error("participant not found in this session")]
    NotFound,
    #[error("not enough connected players")]
    NotEnoughPlayers,
}

/// One game instance.
#[derive(Debug)]
pub struct Session {
    /// Shareable 8-character code
    pub id: String,

    phase: Phase,

    /// Token allowed to start and reset the game
    host: String,

    /// Everyone who ever joined, in join order
    participants: Vec<Participant>,

    /// Seated players; excludes pending joiners
    turn_order: Vec<String>,

    /// Mid-round joiners spectating until the next advance
    pending: Vec<String>,

    turn_index: usize,

    current_bet: u32,

    last_result: Option<RoundResult>,

    result_started_at: Option<Instant>,

    pub created_at: DateTime<Utc>,

    last_activity_at: DateTime<Utc>,

    config: SessionConfig,
    clock: Arc<EpochClock>,
    rng: StdRng,
}

impl Session {
    /// Create a session in the lobby phase.
    pub fn new(id: String, host: String, clock: Arc<EpochClock>) -> Self {
        Self::with_config(id, host, clock, SessionConfig::default())
    }

    pub fn with_config(
        id: String,
        host: String,
        clock: Arc<EpochClock>,
        config: SessionConfig,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            phase: Phase::Waiting,
            host,
            participants: Vec::new(),
            turn_order: Vec::new(),
            pending: Vec::new(),
            turn_index: 0,
            current_bet: 0,
            last_result: None,
            result_started_at: None,
            created_at: now,
            last_activity_at: now,
            config,
            clock,
            rng: StdRng::from_os_rng(),
        }
    }

    /// Make turn selection deterministic.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    // Accessors

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Token of the current host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Check if `token` holds the host role.
    pub fn is_host(&self, token: &str) -> bool {
        self.host == token
    }

    /// Everyone who joined, seated or not, in join order.
    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    /// Look up a participant by token.
    pub fn participant(&self, token: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.token == token)
    }

    /// Check if `token` ever joined this session.
    pub fn has_participant(&self, token: &str) -> bool {
        self.participant(token).is_some()
    }

    /// Seated tokens in turn order.
    pub fn turn_order(&self) -> &[String] {
        &self.turn_order
    }

    /// Mid-round joiners waiting for the next advance.
    pub fn pending(&self) -> &[String] {
        &self.pending
    }

    /// Position of the current holder in the turn order.
    pub fn turn_index(&self) -> usize {
        self.turn_index
    }

    /// Marbles hidden this round (0 before a bet).
    pub fn current_bet(&self) -> u32 {
        self.current_bet
    }

    /// Most recently settled round.
    pub fn last_result(&self) -> Option<&RoundResult> {
        self.last_result.as_ref()
    }

    /// Time of the last mutation, used by the registry sweep.
    pub fn last_activity_at(&self) -> DateTime<Utc> {
        self.last_activity_at
    }

    /// Settings this session was created with.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Token of the participant whose turn it is, while a round is running.
    pub fn current_bettor(&self) -> Option<&str> {
        if !self.phase.is_in_round() {
            return None;
        }
        self.turn_order.get(self.turn_index).map(String::as_str)
    }

    /// Total marbles held by everyone in the session.
    pub fn total_marbles(&self) -> u64 {
        self.participants.iter().map(|p| p.marbles as u64).sum()
    }

    // Joining

    /// Seat a participant with a full stack. Lobby or post-game only.
    pub fn add_participant(
        &mut self,
        token: &str,
        name: &str,
        lang: &str,
    ) -> Result<(), SessionError> {
        if !matches!(self.phase, Phase::Waiting | Phase::Finished) {
            return Err(SessionError::WrongPhase);
        }

        let starting = self.config.starting_marbles;
        match self.index_of(token) {
            Some(idx) => {
                if !self.is_seated(token) {
                    self.participants[idx].marbles = starting;
                    self.turn_order.push(token.to_string());
                }
            }
            None => {
                let participant = self.make_participant(token, name, lang, starting);
                self.participants.push(participant);
                self.turn_order.push(token.to_string());
            }
        }
        self.pending.retain(|t| t != token);

        info!(session_id = %self.id, token, "participant seated");
        self.touch();
        Ok(())
    }

    /// Join while a round is running. The participant spectates until the
    /// next advance.
    pub fn add_pending_participant(
        &mut self,
        token: &str,
        name: &str,
        lang: &str,
    ) -> Result<(), SessionError> {
        if !self.phase.is_in_round() {
            return Err(SessionError::WrongPhase);
        }

        if self.is_seated(token) || self.pending.iter().any(|t| t == token) {
            return Ok(());
        }

        match self.index_of(token) {
            Some(idx) => self.participants[idx].marbles = 0,
            None => {
                let participant = self.make_participant(token, name, lang, 0);
                self.participants.push(participant);
            }
        }
        self.pending.push(token.to_string());

        info!(session_id = %self.id, token, "participant queued for next round");
        self.touch();
        Ok(())
    }

    // Connections

    /// Open a new push stream for a participant.
    pub fn attach(&mut self, token: &str) -> Result<Subscription, SessionError> {
        let participant = self.participant(token).ok_or(SessionError::NotFound)?;
        let subscription = participant.start_new_connection();
        self.on_reconnect(token);
        self.touch();
        Ok(subscription)
    }

    /// Tear down the stream owning `epoch`. Stale epochs are ignored.
    ///
    /// Returns whether the participant was marked disconnected.
    pub fn detach(&mut self, token: &str, epoch: u64) -> bool {
        let Some(participant) = self.participant(token) else {
            return false;
        };
        if !participant.end_connection(epoch) {
            return false;
        }
        if let Err(err) = self.on_disconnect(token) {
            debug!(session_id = %self.id, token, %err, "disconnect handling rejected");
        }
        true
    }

    /// Keep the stream owning `epoch` alive on the configured interval.
    ///
    /// Must be called from inside a tokio runtime. The task ends on its own
    /// once the stream is replaced or its listener goes away.
    pub fn spawn_keepalive_for(
        &self,
        token: &str,
        epoch: u64,
    ) -> Result<JoinHandle<()>, SessionError> {
        let link = self.participant(token).ok_or(SessionError::NotFound)?.link();
        Ok(spawn_keepalive(link, epoch, self.config.keepalive_interval()))
    }

    /// Lobby-only reinsertion of a participant who lost their seat.
    pub fn on_reconnect(&mut self, token: &str) -> bool {
        if self.phase != Phase::Waiting || self.is_seated(token) {
            return false;
        }
        let Some(idx) = self.index_of(token) else {
            return false;
        };

        self.participants[idx].marbles = self.config.starting_marbles;
        self.turn_order.push(token.to_string());
        self.pending.retain(|t| t != token);

        info!(session_id = %self.id, token, "participant reseated on reconnect");
        true
    }

    pub fn on_disconnect(&mut self, token: &str) -> Result<(), SessionError> {
        self.on_disconnect_at(token, Instant::now())
    }

    /// Apply phase consequences of a participant going silent.
    ///
    /// The link must already be marked disconnected; otherwise this is a
    /// no-op.
    pub fn on_disconnect_at(&mut self, token: &str, now: Instant) -> Result<(), SessionError> {
        let participant = self.participant(token).ok_or(SessionError::NotFound)?;
        if participant.is_connected() {
            return Ok(());
        }

        match self.phase {
            Phase::Waiting | Phase::Finished => {}
            Phase::Betting => {
                if self.current_bettor() == Some(token) {
                    let next = (self.turn_index + 1) % self.turn_order.len();
                    self.turn_index = self.next_eligible_from(next);
                    debug!(session_id = %self.id, token, "bettor left, turn skipped");
                }
                if self.available_count_at(now) <= 1 {
                    self.finish("not enough players available");
                }
            }
            Phase::Guessing => {
                if self.all_required_guesses_in() {
                    self.resolve()?;
                }
            }
            Phase::Result => {
                if self.available_count_at(now) <= 1 {
                    self.finish("not enough players available");
                }
            }
        }

        self.touch();
        Ok(())
    }

    pub fn on_grace_period_expired(&mut self, token: &str) -> bool {
        self.on_grace_period_expired_at(token, Instant::now())
    }

    /// Drop a participant whose grace window has lapsed.
    ///
    /// Outside a running game nobody is evicted; a lapsed host only hands
    /// the role on. Returns false without touching anything if the
    /// participant is back, still within the window or already removed.
    pub fn on_grace_period_expired_at(&mut self, token: &str, now: Instant) -> bool {
        let Some(idx) = self.index_of(token) else {
            return false;
        };
        if self.participants[idx].is_within_grace_period_at(now) {
            return false;
        }

        if !self.phase.is_in_round() {
            return self.host == token && self.transfer_host(token);
        }

        if let Some(pos) = self.pending.iter().position(|t| t == token) {
            self.pending.remove(pos);
            if self.host == token {
                self.transfer_host(token);
            }
            info!(session_id = %self.id, token, "pending participant expired");
            self.touch();
            return true;
        }

        let Some(pos) = self.turn_order.iter().position(|t| t == token) else {
            return self.host == token && self.transfer_host(token);
        };

        self.remove_seated(idx, pos, now);
        if self.host == token {
            self.transfer_host(token);
        }
        if self.available_count_at(now) <= 1 {
            self.finish("not enough players available");
        }

        info!(session_id = %self.id, token, phase = self.phase.as_str(), "participant removed after grace period");
        self.touch();
        true
    }

    pub fn check_and_expire_grace_periods(&mut self) -> Vec<String> {
        self.check_and_expire_grace_periods_at(Instant::now())
    }

    /// Expire everyone whose window has lapsed. Returns the tokens removed
    /// or otherwise affected.
    pub fn check_and_expire_grace_periods_at(&mut self, now: Instant) -> Vec<String> {
        let lapsed: Vec<String> = self
            .participants
            .iter()
            .filter(|p| !p.is_within_grace_period_at(now))
            .map(|p| p.token.clone())
            .collect();

        lapsed
            .into_iter()
            .filter(|token| self.on_grace_period_expired_at(token, now))
            .collect()
    }

    // Game flow

    /// Begin the first round with a randomly chosen bettor.
    pub fn start_game(&mut self) -> Result<(), SessionError> {
        if self.phase != Phase::Waiting {
            return Err(SessionError::WrongPhase);
        }
        self.begin_betting()?;
        self.touch();
        Ok(())
    }

    /// [`start_game`](Self::start_game), host only.
    pub fn start_game_by(&mut self, actor: &str) -> Result<(), SessionError> {
        if !self.is_host(actor) {
            return Err(SessionError::Unauthorized);
        }
        self.start_game()
    }

    pub fn place_bet(&mut self, actor: &str, amount: u32) -> Result<(), SessionError> {
        if self.phase != Phase::Betting {
            return Err(SessionError::WrongPhase);
        }
        let marbles = self
            .participant(actor)
            .ok_or(SessionError::NotFound)?
            .marbles;
        if self.current_bettor() != Some(actor) {
            return Err(SessionError::InvalidTurn);
        }
        if amount == 0 || amount > marbles {
            return Err(SessionError::InvalidAmount);
        }

        self.clear_guesses();
        self.current_bet = amount;
        self.phase = Phase::Guessing;

        debug!(session_id = %self.id, actor, amount, "bet placed");
        self.touch();
        Ok(())
    }

    /// Record a guess. A later guess replaces an earlier one.
    pub fn make_guess(&mut self, actor: &str, guess: Guess) -> Result<(), SessionError> {
        if self.phase != Phase::Guessing {
            return Err(SessionError::WrongPhase);
        }
        let idx = self.index_of(actor).ok_or(SessionError::NotFound)?;
        if self.current_bettor() == Some(actor) || !self.participants[idx].is_active() {
            return Err(SessionError::InvalidTurn);
        }

        self.participants[idx].guess = Some(guess);
        self.touch();
        Ok(())
    }

    /// Every connected, active non-bettor has guessed.
    ///
    /// Vacuously true when nobody is required to guess.
    pub fn all_required_guesses_in(&self) -> bool {
        let bettor = self.current_bettor();
        self.turn_order
            .iter()
            .filter(|t| Some(t.as_str()) != bettor)
            .filter_map(|t| self.participant(t))
            .filter(|p| p.is_connected() && p.is_active())
            .all(|p| p.guess.is_some())
    }

    pub fn resolve_if_ready(&mut self) -> Result<Option<RoundResult>, SessionError> {
        if self.phase != Phase::Guessing || !self.all_required_guesses_in() {
            return Ok(None);
        }
        self.resolve().map(Some)
    }

    /// Settle the round.
    ///
    /// Winners are paid out of the placer's stack, floored per winner and
    /// capped by what the placer holds. Independently, every loser pays the
    /// placer up to the bet. When the placer is short the per-winner share
    /// is floored a second time and the remainder is lost.
    pub fn resolve(&mut self) -> Result<RoundResult, SessionError> {
        self.resolve_at(Instant::now())
    }

    pub fn resolve_at(&mut self, now: Instant) -> Result<RoundResult, SessionError> {
        if self.phase != Phase::Guessing {
            return Err(SessionError::WrongPhase);
        }
        let placer_token = self
            .current_bettor()
            .ok_or(SessionError::NotFound)?
            .to_string();
        let placer_idx = self.index_of(&placer_token).ok_or(SessionError::NotFound)?;

        let bet = self.current_bet;
        let parity = Guess::of(bet);

        let mut winners = Vec::new();
        let mut losers = Vec::new();
        for token in &self.turn_order {
            if *token == placer_token {
                continue;
            }
            let Some(idx) = self.index_of(token) else {
                continue;
            };
            let p = &self.participants[idx];
            if !p.is_active() {
                continue;
            }
            match p.guess {
                Some(g) if g == parity => winners.push(idx),
                Some(_) => losers.push(idx),
                None => {}
            }
        }

        let mut paid_by_placer = 0u32;
        let mut paid_per_winner = 0u32;
        if !winners.is_empty() {
            let count = winners.len() as u32;
            let owed = (bet / count) * count;
            paid_by_placer = owed.min(self.participants[placer_idx].marbles);
            paid_per_winner = paid_by_placer / count;
            for &idx in &winners {
                self.participants[idx].marbles += paid_per_winner;
            }
            self.participants[placer_idx].marbles -= paid_by_placer;
        }

        let mut collected = 0u32;
        for &idx in &losers {
            let loss = bet.min(self.participants[idx].marbles);
            self.participants[idx].marbles -= loss;
            collected += loss;
        }
        self.participants[placer_idx].marbles += collected;

        let result = RoundResult {
            placer: PlayerRef::of(&self.participants[placer_idx]),
            amount: bet,
            is_even: parity == Guess::Even,
            winners: winners
                .iter()
                .map(|&i| PlayerRef::of(&self.participants[i]))
                .collect(),
            losers: losers
                .iter()
                .map(|&i| PlayerRef::of(&self.participants[i]))
                .collect(),
            paid_per_winner,
            placer_net_loss: paid_by_placer as i64 - collected as i64,
        };

        self.last_result = Some(result.clone());
        self.phase = Phase::Result;
        self.result_started_at = Some(now);

        info!(
            session_id = %self.id,
            placer = %placer_token,
            amount = bet,
            winners = result.winners.len(),
            losers = result.losers.len(),
            net = result.placer_net_loss,
            "round resolved"
        );
        self.touch();
        Ok(result)
    }

    /// Move past the result screen.
    ///
    /// Seats pending joiners, then either hands the turn to the next
    /// eligible holder (returns true) or ends the game (returns false).
    pub fn advance(&mut self) -> Result<bool, SessionError> {
        if self.phase != Phase::Result {
            return Err(SessionError::WrongPhase);
        }

        let starting = self.config.starting_marbles;
        for token in std::mem::take(&mut self.pending) {
            if let Some(idx) = self.index_of(&token) {
                self.participants[idx].marbles = starting;
                self.turn_order.push(token);
            }
        }

        self.result_started_at = None;
        self.touch();

        if self.connected_active_count() < 2 {
            self.finish("round over with fewer than two players left");
            return Ok(false);
        }

        let next = (self.turn_index + 1) % self.turn_order.len();
        self.turn_index = self.next_eligible_from(next);
        self.current_bet = 0;
        self.clear_guesses();
        self.phase = Phase::Betting;

        debug!(session_id = %self.id, bettor = ?self.current_bettor(), "next round");
        Ok(true)
    }

    pub fn result_cooldown_remaining(&self) -> Duration {
        self.result_cooldown_remaining_at(Instant::now())
    }

    /// Time left on the result screen. Zero outside `Result`.
    pub fn result_cooldown_remaining_at(&self, now: Instant) -> Duration {
        match (self.phase, self.result_started_at) {
            (Phase::Result, Some(started)) => self
                .config
                .result_cooldown()
                .saturating_sub(now.saturating_duration_since(started)),
            _ => Duration::ZERO,
        }
    }

    pub fn result_cooldown_elapsed(&self) -> bool {
        self.result_cooldown_elapsed_at(Instant::now())
    }

    /// The result screen has been up long enough to advance.
    pub fn result_cooldown_elapsed_at(&self, now: Instant) -> bool {
        self.phase == Phase::Result && self.result_cooldown_remaining_at(now).is_zero()
    }

    /// Start over with everyone still connected.
    ///
    /// Returns true if a new round started right away, false if the session
    /// went back to the lobby.
    pub fn reset_for_rematch(&mut self) -> Result<bool, SessionError> {
        if self.phase != Phase::Finished {
            return Err(SessionError::WrongPhase);
        }

        let starting = self.config.starting_marbles;
        let mut order = Vec::new();
        for p in &mut self.participants {
            p.guess = None;
            if p.is_connected() {
                p.marbles = starting;
                order.push(p.token.clone());
            } else {
                p.marbles = 0;
            }
        }
        self.turn_order = order;
        self.pending.clear();
        self.turn_index = 0;
        self.current_bet = 0;
        self.last_result = None;
        self.result_started_at = None;
        self.touch();

        match self.begin_betting() {
            Ok(()) => Ok(true),
            Err(_) => {
                self.phase = Phase::Waiting;
                info!(session_id = %self.id, "rematch back to lobby");
                Ok(false)
            }
        }
    }

    /// [`reset_for_rematch`](Self::reset_for_rematch), host only.
    pub fn reset_for_rematch_by(&mut self, actor: &str) -> Result<bool, SessionError> {
        if !self.is_host(actor) {
            return Err(SessionError::Unauthorized);
        }
        self.reset_for_rematch()
    }

    /// The last player standing.
    ///
    /// Falls back to a disconnected active player so a decided game stays
    /// decided.
    pub fn get_winner(&self) -> Option<&Participant> {
        if self.phase != Phase::Finished {
            return None;
        }
        let seated = || self.turn_order.iter().filter_map(|t| self.participant(t));
        seated()
            .find(|p| p.is_active() && p.is_connected())
            .or_else(|| seated().find(|p| p.is_active()))
    }

    // Fan-out

    /// Render and push state to each connected participant.
    ///
    /// `render` receives the session, the viewer token and the viewer's
    /// language. Returns how many pushes were queued.
    pub fn push_state_to_all_connected<F>(&self, render: F) -> usize
    where
        F: Fn(&Session, &str, &str) -> String,
    {
        let mut delivered = 0;
        for p in &self.participants {
            if !p.is_connected() {
                continue;
            }
            if p.push(render(self, &p.token, &p.lang)) {
                delivered += 1;
            }
        }
        debug!(session_id = %self.id, delivered, "state pushed");
        delivered
    }

    /// End every participant's stream.
    pub fn close_all_streams(&self) {
        for p in &self.participants {
            p.close_stream();
        }
    }

    /// Convert to JSON for presentation.
    pub fn to_json(&self) -> serde_json::Value {
        let players: Vec<serde_json::Value> = self
            .turn_order
            .iter()
            .filter_map(|t| self.participant(t))
            .map(|p| p.to_json())
            .collect();
        let pending: Vec<serde_json::Value> = self
            .pending
            .iter()
            .filter_map(|t| self.participant(t))
            .map(|p| p.to_json())
            .collect();

        serde_json::json!({
            "session_id": self.id,
            "phase": self.phase.as_str(),
            "host": self.host,
            "players": players,
            "pending": pending,
            "current_bettor": self.current_bettor(),
            "current_bet": self.current_bet,
            "last_result": self.last_result,
            "result_cooldown_seconds": ceil_secs(self.result_cooldown_remaining()),
            "winner": self.get_winner().map(|p| p.token.as_str())
        })
    }

    // Internals

    fn make_participant(&self, token: &str, name: &str, lang: &str, marbles: u32) -> Participant {
        Participant::new(
            token.to_string(),
            name,
            lang,
            marbles,
            self.config.max_name_len,
            Arc::clone(&self.clock),
            self.config.grace_period(),
        )
    }

    fn index_of(&self, token: &str) -> Option<usize> {
        self.participants.iter().position(|p| p.token == token)
    }

    fn is_seated(&self, token: &str) -> bool {
        self.turn_order.iter().any(|t| t == token)
    }

    fn is_eligible(&self, token: &str) -> bool {
        self.participant(token)
            .map(|p| p.is_connected() && p.is_active())
            .unwrap_or(false)
    }

    fn connected_active_count(&self) -> usize {
        self.turn_order
            .iter()
            .filter(|t| self.is_eligible(t))
            .count()
    }

    /// Seated, active, and connected or within grace.
    fn available_count_at(&self, now: Instant) -> usize {
        self.turn_order
            .iter()
            .filter_map(|t| self.participant(t))
            .filter(|p| p.is_active() && p.is_within_grace_period_at(now))
            .count()
    }

    /// First eligible position at or after `start`, wrapping. Falls back to
    /// `start` when nobody is eligible.
    fn next_eligible_from(&self, start: usize) -> usize {
        let len = self.turn_order.len();
        if len == 0 {
            return 0;
        }
        (0..len)
            .map(|offset| (start + offset) % len)
            .find(|&i| self.is_eligible(&self.turn_order[i]))
            .unwrap_or(start % len)
    }

    fn clear_guesses(&mut self) {
        for p in &mut self.participants {
            p.guess = None;
        }
    }

    fn begin_betting(&mut self) -> Result<(), SessionError> {
        let eligible: Vec<usize> = (0..self.turn_order.len())
            .filter(|&i| self.is_eligible(&self.turn_order[i]))
            .collect();
        if eligible.len() < 2 {
            return Err(SessionError::NotEnoughPlayers);
        }

        self.turn_index = eligible[self.rng.random_range(0..eligible.len())];
        self.current_bet = 0;
        self.clear_guesses();
        self.last_result = None;
        self.result_started_at = None;
        self.phase = Phase::Betting;

        info!(session_id = %self.id, bettor = ?self.current_bettor(), "game started");
        Ok(())
    }

    fn finish(&mut self, reason: &'static str) {
        self.phase = Phase::Finished;
        self.current_bet = 0;
        self.result_started_at = None;
        info!(session_id = %self.id, reason, "game finished");
    }

    /// Hand the host role to the first connected participant other than
    /// `from`.
    fn transfer_host(&mut self, from: &str) -> bool {
        let Some(next) = self
            .participants
            .iter()
            .find(|p| p.token != from && p.is_connected())
            .map(|p| p.token.clone())
        else {
            return false;
        };
        info!(session_id = %self.id, from, to = %next, "host transferred");
        self.host = next;
        true
    }

    /// Take a seated participant out of the game, sharing their marbles
    /// among the remaining connected players.
    ///
    /// With nobody connected the stack goes to seated players still within
    /// grace, then to any seated active player. It stays on the departing
    /// record only when no one is seated.
    fn remove_seated(&mut self, idx: usize, pos: usize, now: Instant) {
        let was_holder = pos == self.turn_index;
        self.participants[idx].guess = None;
        self.turn_order.remove(pos);

        let recipients = self.redistribution_targets(now);
        if !recipients.is_empty() {
            let departing = std::mem::take(&mut self.participants[idx].marbles);
            let count = recipients.len() as u32;
            let share = departing / count;
            let remainder = departing % count;
            for (k, &i) in recipients.iter().enumerate() {
                let extra = u32::from((k as u32) < remainder);
                self.participants[i].marbles += share + extra;
            }
        }

        let len = self.turn_order.len();
        if len == 0 {
            self.turn_index = 0;
        } else if pos < self.turn_index {
            self.turn_index -= 1;
        } else if was_holder {
            let successor = pos % len;
            match self.phase {
                Phase::Betting => self.turn_index = self.next_eligible_from(successor),
                Phase::Guessing => {
                    // placer gone, round is void
                    self.clear_guesses();
                    self.current_bet = 0;
                    self.phase = Phase::Betting;
                    self.turn_index = self.next_eligible_from(successor);
                }
                // advance() moves one past this
                Phase::Result => self.turn_index = (successor + len - 1) % len,
                Phase::Waiting | Phase::Finished => {}
            }
        }
    }

    /// Indices of seated participants who should receive a departing stack.
    fn redistribution_targets(&self, now: Instant) -> Vec<usize> {
        let seated: Vec<usize> = self
            .turn_order
            .iter()
            .filter_map(|t| self.index_of(t))
            .collect();
        let active: Vec<usize> = seated
            .iter()
            .copied()
            .filter(|&i| self.participants[i].is_active())
            .collect();

        let connected: Vec<usize> = active
            .iter()
            .copied()
            .filter(|&i| self.participants[i].is_connected())
            .collect();
        if !connected.is_empty() {
            return connected;
        }
        let in_grace: Vec<usize> = active
            .iter()
            .copied()
            .filter(|&i| self.participants[i].is_within_grace_period_at(now))
            .collect();
        if !in_grace.is_empty() {
            return in_grace;
        }
        if !active.is_empty() {
            return active;
        }
        seated
    }

    fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }
}
