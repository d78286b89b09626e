//! Per-player record within a session.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use super::connection::{ceil_secs, ConnectionLink, EpochClock, Push, Subscription};

/// Name used when a participant submits an empty one.
pub const DEFAULT_DISPLAY_NAME: &str = "Player";

/// Language hint used when none is supplied.
pub const DEFAULT_LANGUAGE: &str = "en";

/// A parity guess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Guess {
    Even,
    Odd,
}

impl Guess {
    /// The guess matching a bet of `amount` marbles.
    pub fn of(amount: u32) -> Self {
        if amount % 2 == 0 {
            Self::Even
        } else {
            Self::Odd
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Even => "even",
            Self::Odd => "odd",
        }
    }
}

impl fmt::Display for Guess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One player or spectator.
#[derive(Debug, Clone)]
pub struct Participant {
    /// Opaque per-browser session token
    pub token: String,

    /// User-supplied display name, already capped
    pub display_name: String,

    /// Zero means spectator
    pub marbles: u32,

    /// Cleared at the start of every betting round
    pub guess: Option<Guess>,

    /// Two-letter locale hint for the presentation layer
    pub lang: String,

    link: Arc<ConnectionLink>,
}

impl Participant {
    pub fn new(
        token: String,
        display_name: &str,
        lang: &str,
        marbles: u32,
        max_name_len: usize,
        clock: Arc<EpochClock>,
        grace_period: Duration,
    ) -> Self {
        Self {
            token,
            display_name: cap_name(display_name, max_name_len),
            marbles,
            guess: None,
            lang: normalize_lang(lang),
            link: Arc::new(ConnectionLink::new(clock, grace_period)),
        }
    }

    /// Shared handle for the stream handler.
    pub fn link(&self) -> Arc<ConnectionLink> {
        Arc::clone(&self.link)
    }

    pub fn start_new_connection(&self) -> Subscription {
        self.link.start_new_connection()
    }

    pub fn end_connection(&self, epoch: u64) -> bool {
        self.link.end_connection(epoch)
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    pub fn is_spectator(&self) -> bool {
        self.marbles == 0
    }

    pub fn is_active(&self) -> bool {
        self.marbles > 0
    }

    pub fn disconnected_at(&self) -> Option<Instant> {
        self.link.disconnected_at()
    }

    pub fn is_within_grace_period(&self) -> bool {
        self.link.is_within_grace_period()
    }

    pub fn is_within_grace_period_at(&self, now: Instant) -> bool {
        self.link.is_within_grace_period_at(now)
    }

    pub fn grace_period_remaining(&self) -> Duration {
        self.link.grace_period_remaining()
    }

    pub fn grace_period_remaining_at(&self, now: Instant) -> Duration {
        self.link.grace_period_remaining_at(now)
    }

    /// Fire-and-forget push. Returns false if nothing was queued.
    pub fn push(&self, payload: String) -> bool {
        self.link.push(Push::Update(payload))
    }

    pub fn close_stream(&self) {
        self.link.close();
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "token": self.token,
            "name": self.display_name,
            "marbles": self.marbles,
            "has_guessed": self.guess.is_some(),
            "is_connected": self.is_connected(),
            "grace_seconds_remaining": ceil_secs(self.grace_period_remaining())
        })
    }
}

/// Trim and cut a display name to `max_len` characters.
pub fn cap_name(name: &str, max_len: usize) -> String {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return DEFAULT_DISPLAY_NAME.to_string();
    }
    trimmed.chars().take(max_len).collect()
}

fn normalize_lang(lang: &str) -> String {
    let tag: String = lang
        .trim()
        .chars()
        .take(2)
        .map(|c| c.to_ascii_lowercase())
        .collect();
    if tag.len() == 2 && tag.chars().all(|c| c.is_ascii_alphabetic()) {
        tag
    } else {
        DEFAULT_LANGUAGE.to_string()
    }
}
