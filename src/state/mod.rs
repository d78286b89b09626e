//! State management for marble sessions.
//!
//! - `connection` - per-participant connection epochs, push outbox, keepalive
//! - `participant` - player record and guesses
//! - `session` - the game state machine
//! - `registry` - concurrent directory of sessions with TTL sweeping
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        SessionRegistry                           │
//! │                                                                  │
//! │   session id ──▶ Arc<Mutex<Session>>          EpochClock (shared) │
//! │                                                                  │
//! │  ┌────────────────────────────────────────────────────────────┐  │
//! │  │                         Session                            │  │
//! │  │                                                            │  │
//! │  │  phase, host, turn order, pending queue, bet, last result  │  │
//! │  │                                                            │  │
//! │  │  Participant ── Arc<ConnectionLink> ──▶ push stream         │  │
//! │  │  Participant ── Arc<ConnectionLink> ──▶ push stream         │  │
//! │  └────────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let registry = Arc::new(SessionRegistry::new());
//! let _sweeper = registry.spawn_sweeper();
//!
//! let shared = registry.create("host-token");
//! let mut session = shared.lock();
//! session.add_participant("host-token", "Alice", "en")?;
//! let stream = session.attach("host-token")?;
//! session.push_state_to_all_connected(|s, viewer, lang| render(s, viewer, lang));
//! ```

pub mod connection;
pub mod participant;
pub mod registry;
pub mod session;

// Re-export commonly used types
pub use connection::{spawn_keepalive, ConnectionLink, EpochClock, Push, Subscription};
pub use participant::{Guess, Participant};
pub use registry::{SessionRegistry, SharedSession, SESSION_ID_LEN};
pub use session::{Phase, PlayerRef, RoundResult, Session, SessionError};
