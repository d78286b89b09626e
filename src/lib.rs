//! Marble Session Library
//!
//! Session engine for a turn-based parity-guessing marble game.
//!
//! # Overview
//!
//! - **Participants** - Per-player marble stacks and guesses, plus a
//!   connection primitive that uses epochs to survive rapid reconnects.
//!
//! - **Sessions** - The game state machine: turn order, bets, guesses,
//!   settlement, dropouts, grace periods and host transfer, and pushing
//!   rendered state to every connected participant.
//!
//! - **Registry** - Concurrent directory of sessions with a periodic sweep
//!   of finished and abandoned ones.
//!
//! # Design Principles
//!
//! 1. **No presentation** - Rendering is injected as a closure; the engine
//!    never knows what it pushes.
//!
//! 2. **One writer per session** - The registry hands out sessions behind a
//!    lock, and every mutation happens under it.
//!
//! 3. **No networking** - Streams are channels; wiring them to HTTP is the
//!    caller's job.
//!
//! 4. **Time is injectable** - Timed predicates have `_at` variants.
//!
//! # Example
//!
//! ```rust
//! use marble_session::{Guess, Phase, SessionRegistry};
//!
//! let registry = SessionRegistry::new();
//! let shared = registry.create("alice");
//! let mut session = shared.lock();
//!
//! session.add_participant("alice", "Alice", "en").unwrap();
//! session.add_participant("bob", "Bob", "en").unwrap();
//! let _alice = session.attach("alice").unwrap();
//! let _bob = session.attach("bob").unwrap();
//!
//! session.start_game_by("alice").unwrap();
//! let bettor = session.current_bettor().unwrap().to_string();
//! let guesser = if bettor == "alice" { "bob" } else { "alice" };
//!
//! session.place_bet(&bettor, 4).unwrap();
//! session.make_guess(guesser, Guess::Even).unwrap();
//! session.resolve_if_ready().unwrap();
//!
//! assert_eq!(session.phase(), Phase::Result);
//! assert_eq!(session.participant(guesser).unwrap().marbles, 14);
//! ```

pub mod config;
pub mod state;

// Re-export everything from state module at crate root
pub use config::{EngineConfig, RegistryConfig, SessionConfig};
pub use state::*;
