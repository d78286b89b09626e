//! Connection lifecycle for a single participant.
//!
//! Every physical push stream gets a fresh epoch from a shared
//! [`EpochClock`]. Only the stream holding the current epoch may mark the
//! participant disconnected, so a slow teardown of a replaced stream can
//! never clobber its successor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Monotonic epoch source shared by every participant of a registry.
#[derive(Debug, Default)]
pub struct EpochClock {
    last: AtomicU64,
}

impl EpochClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next epoch. Never returns the same value twice.
    pub fn next(&self) -> u64 {
        self.last.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Most recently allocated epoch (0 if none yet).
    pub fn current(&self) -> u64 {
        self.last.load(Ordering::Acquire)
    }
}

/// An item travelling down a participant's push stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Push {
    /// Rendered state, opaque to the engine.
    Update(String),
    /// Liveness ping for detecting half-open streams.
    Keepalive,
}

/// Handed to the stream handler that opened a connection.
#[derive(Debug)]
pub struct Subscription {
    /// Proof of ownership for [`ConnectionLink::end_connection`].
    pub epoch: u64,
    pub updates: mpsc::UnboundedReceiver<Push>,
}

#[derive(Debug)]
struct LinkState {
    epoch: u64,
    connected: bool,
    disconnected_at: Option<Instant>,
    outbox: Option<mpsc::UnboundedSender<Push>>,
}

/// Connection state for one participant.
///
/// Shared between the session (which pushes updates) and the stream handler
/// (which opens and tears down the physical connection). Epoch comparison
/// and the state write happen under one lock.
#[derive(Debug)]
pub struct ConnectionLink {
    clock: Arc<EpochClock>,
    grace_period: Duration,
    created_at: Instant,
    state: Mutex<LinkState>,
}

impl ConnectionLink {
    /// Create a link that has not connected yet.
    pub fn new(clock: Arc<EpochClock>, grace_period: Duration) -> Self {
        Self {
            clock,
            grace_period,
            created_at: Instant::now(),
            state: Mutex::new(LinkState {
                epoch: 0,
                connected: false,
                disconnected_at: None,
                outbox: None,
            }),
        }
    }

    /// Claim the participant for a new physical connection.
    ///
    /// Any previous stream's sender is dropped, so its receiver ends once
    /// drained.
    pub fn start_new_connection(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        let epoch = self.clock.next();
        state.epoch = epoch;
        state.connected = true;
        state.disconnected_at = None;
        state.outbox = Some(tx);
        debug!(epoch, "connection started");
        Subscription {
            epoch,
            updates: rx,
        }
    }

    /// Mark disconnected, but only if `epoch` is still the current one.
    ///
    /// Returns whether the call took effect.
    pub fn end_connection(&self, epoch: u64) -> bool {
        self.end_connection_at(epoch, Instant::now())
    }

    pub fn end_connection_at(&self, epoch: u64, now: Instant) -> bool {
        let mut state = self.state.lock();
        if state.epoch != epoch {
            debug!(epoch, current = state.epoch, "stale connection teardown ignored");
            return false;
        }
        if !state.connected {
            return false;
        }
        state.connected = false;
        state.disconnected_at = Some(now);
        state.outbox = None;
        debug!(epoch, "connection ended");
        true
    }

    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn disconnected_at(&self) -> Option<Instant> {
        self.state.lock().disconnected_at
    }

    pub fn is_within_grace_period(&self) -> bool {
        self.is_within_grace_period_at(Instant::now())
    }

    /// Connected, or disconnected for less than the grace window.
    ///
    /// A link that never connected is measured from its creation.
    pub fn is_within_grace_period_at(&self, now: Instant) -> bool {
        let state = self.state.lock();
        if state.connected {
            return true;
        }
        let since = state.disconnected_at.unwrap_or(self.created_at);
        now.saturating_duration_since(since) < self.grace_period
    }

    pub fn grace_period_remaining(&self) -> Duration {
        self.grace_period_remaining_at(Instant::now())
    }

    /// Zero once expired or while connected.
    pub fn grace_period_remaining_at(&self, now: Instant) -> Duration {
        let state = self.state.lock();
        if state.connected {
            return Duration::ZERO;
        }
        let since = state.disconnected_at.unwrap_or(self.created_at);
        self.grace_period
            .saturating_sub(now.saturating_duration_since(since))
    }

    /// Queue an item on the current stream. No-op while disconnected.
    pub fn push(&self, item: Push) -> bool {
        let mut state = self.state.lock();
        if !state.connected {
            return false;
        }
        let Some(outbox) = state.outbox.as_ref() else {
            return false;
        };
        if outbox.send(item).is_err() {
            state.outbox = None;
            return false;
        }
        true
    }

    /// Send a keepalive on the stream owning `epoch`.
    ///
    /// A failed send closes that stream's outbox so its listener unblocks.
    /// The participant stays connected until the stream handler calls
    /// [`end_connection`](Self::end_connection).
    pub fn send_keepalive(&self, epoch: u64) -> bool {
        let mut state = self.state.lock();
        if state.epoch != epoch {
            return false;
        }
        let Some(outbox) = state.outbox.as_ref() else {
            return false;
        };
        if outbox.send(Push::Keepalive).is_err() {
            debug!(epoch, "keepalive failed, closing stream");
            state.outbox = None;
            return false;
        }
        true
    }

    /// Drop the outbox so any consumer sees the end of its stream.
    pub fn close(&self) {
        self.state.lock().outbox = None;
    }
}

/// Whole seconds, rounded up, for countdowns shown to players.
pub(crate) fn ceil_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

/// Ping the stream owning `epoch` every `every` until it is superseded or
/// the send fails.
pub fn spawn_keepalive(link: Arc<ConnectionLink>, epoch: u64, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick fires immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if !link.send_keepalive(epoch) {
                debug!(epoch, "keepalive loop stopped");
                break;
            }
        }
    })
}
