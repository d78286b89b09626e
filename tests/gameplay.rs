use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use marble_session::{Guess, Phase, Push, SessionError, SessionRegistry, Subscription};
use pretty_assertions::assert_eq;

fn render(session: &marble_session::Session, viewer: &str, _lang: &str) -> String {
    format!(
        "{}|{}|{}",
        viewer,
        session.phase().as_str(),
        session.participant(viewer).map(|p| p.marbles).unwrap_or(0)
    )
}

fn drain(sub: &mut Subscription) -> Vec<Push> {
    let mut out = Vec::new();
    while let Ok(item) = sub.updates.try_recv() {
        out.push(item);
    }
    out
}

#[test]
fn full_game_through_registry() {
    let registry = SessionRegistry::new();
    let shared = registry.create("alice");
    let id = shared.lock().id.clone();

    let mut streams = Vec::new();
    {
        let found = registry.get(&id).unwrap();
        let mut session = found.lock();
        for (token, name) in [("alice", "Alice"), ("bob", "Bob"), ("carol", "Carol")] {
            session.add_participant(token, name, "en").unwrap();
            streams.push(session.attach(token).unwrap());
        }
        assert_eq!(session.start_game_by("bob"), Err(SessionError::Unauthorized));
        session.start_game_by("alice").unwrap();
        assert_eq!(session.push_state_to_all_connected(render), 3);
    }

    // Play rounds until someone is out of marbles or we hit a cap
    for _ in 0..50 {
        let mut session = shared.lock();
        if session.phase() == Phase::Finished {
            break;
        }
        let bettor = session.current_bettor().unwrap().to_string();
        let stack = session.participant(&bettor).unwrap().marbles;
        let before = session.total_marbles();

        session.place_bet(&bettor, stack.min(3)).unwrap();
        let guessers: Vec<String> = session
            .turn_order()
            .iter()
            .filter(|t| **t != bettor)
            .filter(|t| session.participant(t).unwrap().marbles > 0)
            .cloned()
            .collect();
        for (i, token) in guessers.iter().enumerate() {
            let guess = if i % 2 == 0 { Guess::Odd } else { Guess::Even };
            session.make_guess(token, guess).unwrap();
        }

        let result = session.resolve_if_ready().unwrap().unwrap();
        // a fully funded placer never loses marbles to rounding
        assert_eq!(session.total_marbles(), before);
        assert_eq!(result.placer.token, bettor);
        session.push_state_to_all_connected(render);
        session.advance().unwrap();
    }

    let session = shared.lock();
    if session.phase() == Phase::Finished {
        assert!(session.get_winner().is_some());
    }
    assert_eq!(session.total_marbles(), 30);
    drop(session);

    for stream in &mut streams {
        let pushes = drain(stream);
        assert!(!pushes.is_empty());
        assert!(pushes.iter().all(|p| matches!(p, Push::Update(_))));
    }
}

#[test]
fn reconnect_race_keeps_newest_stream() {
    let registry = SessionRegistry::new();
    let shared = registry.create("a");
    let (old, new) = {
        let mut session = shared.lock();
        session.add_participant("a", "A", "en").unwrap();
        session.add_participant("b", "B", "en").unwrap();
        let _b = session.attach("b").unwrap();
        let old = session.attach("a").unwrap();
        let new = session.attach("a").unwrap();
        (old, new)
    };
    let mut new = new;

    // slow teardown of the first stream arrives late
    assert!(!shared.lock().detach("a", old.epoch));

    let mut session = shared.lock();
    assert!(session.participant("a").unwrap().is_connected());
    session.push_state_to_all_connected(render);
    assert_eq!(drain(&mut new), vec![Push::Update("a|waiting|10".into())]);
}

#[test]
fn grace_expiry_ends_game_and_sweep_collects_it() {
    let registry = SessionRegistry::new();
    let shared = registry.create("a");
    let id = {
        let mut session = shared.lock();
        session.add_participant("a", "A", "en").unwrap();
        session.add_participant("b", "B", "en").unwrap();
        let _a = session.attach("a").unwrap();
        let b = session.attach("b").unwrap();
        session.start_game().unwrap();

        assert!(session.detach("b", b.epoch));
        assert_ne!(session.phase(), Phase::Finished);

        let expired =
            session.check_and_expire_grace_periods_at(Instant::now() + Duration::from_secs(16));
        assert_eq!(expired, vec!["b".to_string()]);
        assert_eq!(session.phase(), Phase::Finished);
        assert_eq!(session.get_winner().unwrap().token, "a");
        session.id.clone()
    };

    assert_eq!(
        registry.sweep_at(chrono::Utc::now() + chrono::Duration::minutes(61)),
        vec![id.clone()]
    );
    assert!(registry.get(&id).is_none());
}

#[test]
fn concurrent_guesses_are_serialized() {
    let registry = Arc::new(SessionRegistry::new());
    let shared = registry.create("p0");
    let tokens: Vec<String> = (0..6).map(|i| format!("p{i}")).collect();
    let _streams = {
        let mut session = shared.lock();
        let streams: Vec<Subscription> = tokens
            .iter()
            .map(|t| {
                session.add_participant(t, t, "en").unwrap();
                session.attach(t).unwrap()
            })
            .collect();
        session.start_game().unwrap();
        let bettor = session.current_bettor().unwrap().to_string();
        session.place_bet(&bettor, 2).unwrap();
        streams
    };

    let bettor = shared.lock().current_bettor().unwrap().to_string();
    let handles: Vec<_> = tokens
        .iter()
        .filter(|t| **t != bettor)
        .cloned()
        .map(|token| {
            let registry = Arc::clone(&registry);
            let id = shared.lock().id.clone();
            thread::spawn(move || {
                let session = registry.get(&id).unwrap();
                let mut session = session.lock();
                session.make_guess(&token, Guess::Even).unwrap();
                session.resolve_if_ready().unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let session = shared.lock();
    assert_eq!(session.phase(), Phase::Result);
    let result = session.last_result().unwrap();
    assert_eq!(result.winners.len(), 5);
    // 2 marbles split five ways floors to nothing
    assert_eq!(result.paid_per_winner, 0);
    assert_eq!(session.total_marbles(), 60);
}
