//! Session registry.
//!
//! Concurrent directory of live sessions keyed by their shareable code,
//! with a periodic sweep that drops finished or abandoned sessions.

use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::connection::EpochClock;
use super::session::{Phase, Session};
use crate::config::{EngineConfig, RegistryConfig, SessionConfig};

/// Length of a session code.
pub const SESSION_ID_LEN: usize = 8;

/// Lowercase letters and digits minus the easily confused ones.
const ID_ALPHABET: &[u8] = b"abcdefghjkmnpqrstuvwxyz23456789";

/// A session behind its per-session lock. Every mutation goes through it.
pub type SharedSession = Arc<Mutex<Session>>;

/// Registry of live sessions.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: DashMap<String, SharedSession>,
    clock: Arc<EpochClock>,
    session_config: SessionConfig,
    config: RegistryConfig,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            clock: Arc::new(EpochClock::new()),
            session_config: config.session,
            config: config.registry,
        }
    }

    /// Epoch source shared by every session in this registry.
    pub fn clock(&self) -> Arc<EpochClock> {
        Arc::clone(&self.clock)
    }

    /// Register a fresh session hosted by `host_token`.
    pub fn create(&self, host_token: &str) -> SharedSession {
        loop {
            let id = generate_id();
            match self.sessions.entry(id) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(slot) => {
                    let session = Session::with_config(
                        slot.key().clone(),
                        host_token.to_string(),
                        self.clock(),
                        self.session_config.clone(),
                    );
                    info!(session_id = %slot.key(), host = host_token, "session created");
                    let shared = Arc::new(Mutex::new(session));
                    slot.insert(Arc::clone(&shared));
                    return shared;
                }
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<SharedSession> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Deregister a session. Streams are left alone; see [`close`](Self::close).
    pub fn remove(&self, id: &str) -> Option<SharedSession> {
        self.sessions.remove(id).map(|(_, session)| session)
    }

    /// Deregister a session and end every participant's stream.
    pub fn close(&self, id: &str) -> bool {
        let Some(session) = self.remove(id) else {
            return false;
        };
        session.lock().close_all_streams();
        info!(session_id = id, "session closed");
        true
    }

    /// First session that knows `token`.
    pub fn find_by_participant(&self, token: &str) -> Option<SharedSession> {
        self.snapshot()
            .into_iter()
            .map(|(_, session)| session)
            .find(|session| session.lock().has_participant(token))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    pub fn sweep(&self) -> Vec<String> {
        self.sweep_at(Utc::now())
    }

    /// Remove finished sessions idle past the short TTL and any session
    /// idle past the long TTL. Returns the removed ids.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let finished_ttl = self.config.finished_ttl();
        let idle_ttl = self.config.idle_ttl();

        let mut removed = Vec::new();
        for (id, session) in self.snapshot() {
            let expired = {
                let session = session.lock();
                let idle_for = now - session.last_activity_at();
                (session.phase() == Phase::Finished && idle_for > finished_ttl)
                    || idle_for > idle_ttl
            };
            if expired && self.close(&id) {
                removed.push(id);
            }
        }

        if !removed.is_empty() {
            info!(count = removed.len(), remaining = self.len(), "swept sessions");
        }
        removed
    }

    /// Run [`sweep`](Self::sweep) on the configured interval.
    ///
    /// The task ends once the registry is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let registry: Weak<Self> = Arc::downgrade(self);
        let every = self.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    debug!("registry dropped, sweeper exiting");
                    break;
                };
                registry.sweep();
            }
        })
    }

    /// Clone out the entries so no shard lock is held while a session lock
    /// is taken.
    fn snapshot(&self) -> Vec<(String, SharedSession)> {
        self.sessions
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect()
    }
}

fn generate_id() -> String {
    let mut rng = rand::rng();
    (0..SESSION_ID_LEN)
        .map(|_| ID_ALPHABET[rng.random_range(0..ID_ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;

    fn hours(n: i64) -> chrono::Duration {
        chrono::Duration::hours(n)
    }

    #[test]
    fn test_generate_id() {
        let id = generate_id();
        assert_eq!(id.len(), SESSION_ID_LEN);
        assert!(id.bytes().all(|b| ID_ALPHABET.contains(&b)));
    }

    #[test]
    fn test_create_and_get() {
        let registry = SessionRegistry::new();
        let session = registry.create("host");
        let id = session.lock().id.clone();

        assert_eq!(registry.len(), 1);
        let found = registry.get(&id).unwrap();
        assert!(Arc::ptr_eq(&session, &found));
        assert_eq!(found.lock().host(), "host");
        assert!(registry.get("missing1").is_none());
    }

    #[test]
    fn test_ids_are_unique() {
        let registry = SessionRegistry::new();
        for _ in 0..200 {
            registry.create("h");
        }
        let ids: HashSet<String> = registry.ids().into_iter().collect();
        assert_eq!(ids.len(), 200);
    }

    #[test]
    fn test_sessions_share_epoch_clock() {
        let registry = SessionRegistry::new();
        let first = registry.create("a");
        let second = registry.create("b");

        let e1 = {
            let mut s = first.lock();
            s.add_participant("a", "A", "en").unwrap();
            s.attach("a").unwrap().epoch
        };
        let e2 = {
            let mut s = second.lock();
            s.add_participant("b", "B", "en").unwrap();
            s.attach("b").unwrap().epoch
        };
        assert!(e2 > e1);
        assert_eq!(registry.clock().current(), e2);
    }

    #[test]
    fn test_remove() {
        let registry = SessionRegistry::new();
        let id = registry.create("h").lock().id.clone();

        assert!(registry.remove(&id).is_some());
        assert!(registry.remove(&id).is_none());
        assert!(registry.is_empty());
        assert!(!registry.close(&id));
    }

    #[test]
    fn test_find_by_participant() {
        let registry = SessionRegistry::new();
        registry.create("x");
        let session = registry.create("a");
        session.lock().add_participant("a", "A", "en").unwrap();

        let found = registry.find_by_participant("a").unwrap();
        assert!(Arc::ptr_eq(&session, &found));
        assert!(registry.find_by_participant("nobody").is_none());
    }

    #[test]
    fn test_sweep_keeps_fresh_sessions() {
        let registry = SessionRegistry::new();
        registry.create("h");
        assert!(registry.sweep().is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_sweep_finished_after_short_ttl() {
        let registry = SessionRegistry::new();
        let lobby = registry.create("a");
        let finished = registry.create("b");
        let finished_id = {
            let mut s = finished.lock();
            for t in ["a", "b"] {
                s.add_participant(t, t, "en").unwrap();
            }
            let subs: Vec<_> = ["a", "b"].iter().map(|t| s.attach(t).unwrap()).collect();
            s.start_game().unwrap();
            let bettor = s.current_bettor().unwrap().to_string();
            let idx = if bettor == "a" { 1 } else { 0 };
            // the other player drops and never returns
            let other = ["a", "b"][idx];
            s.detach(other, subs[idx].epoch);
            s.check_and_expire_grace_periods_at(
                std::time::Instant::now() + Duration::from_secs(16),
            );
            assert_eq!(s.phase(), Phase::Finished);
            s.id.clone()
        };

        let removed = registry.sweep_at(Utc::now() + hours(2));
        assert_eq!(removed, vec![finished_id]);
        let lobby_id = lobby.lock().id.clone();
        assert!(registry.get(&lobby_id).is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_sweep_any_after_long_ttl() {
        let registry = SessionRegistry::new();
        registry.create("a");
        registry.create("b");

        assert!(registry.sweep_at(Utc::now() + hours(3)).is_empty());
        assert_eq!(registry.sweep_at(Utc::now() + hours(5)).len(), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_sweep_closes_streams() {
        let registry = SessionRegistry::new();
        let session = registry.create("a");
        let mut sub = {
            let mut s = session.lock();
            s.add_participant("a", "A", "en").unwrap();
            s.attach("a").unwrap()
        };

        registry.sweep_at(Utc::now() + hours(5));
        assert!(matches!(
            sub.updates.try_recv(),
            Err(tokio::sync::mpsc::error::TryRecvError::Disconnected)
        ));
        // pushes after removal go nowhere
        assert!(!session.lock().participant("a").unwrap().push("late".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_runs_on_interval() {
        let config = EngineConfig::from_json(
            r#"{"registry": {"sweep_interval_secs": 60, "idle_ttl_secs": 0}}"#,
        )
        .unwrap();
        let registry = Arc::new(SessionRegistry::with_config(config));
        registry.create("h");
        // let wall clock move past the zero TTL
        std::thread::sleep(Duration::from_millis(5));

        let handle = registry.spawn_sweeper();
        tokio::time::sleep(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;
        assert!(registry.is_empty());

        drop(registry);
        handle.await.unwrap();
    }
}
