// ABOUTME: End-to-end coordinator scenarios against real subprocess engines
// ABOUTME: Crash recovery, cross-process arbitration, binding stress, cancellation and reaping

use roost_core::{
    CoordinatorConfig, EngineConfig, EngineState, ExtensionRegistry, RelayEvent, RoostError,
    SessionCoordinator, SessionStore, StreamRelay, Subscription,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Answers every prompt with one text line and the end marker.
const ECHO_ENGINE: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"type":"prompt"'*) echo 'pong'; echo '<<END>>' ;;
  esac
done
"#;

/// Streams forever once prompted.
const ENDLESS_ENGINE: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"type":"prompt"'*) echo 'partial' ;;
  esac
done
"#;

fn config(dir: &TempDir, script: &str) -> CoordinatorConfig {
    CoordinatorConfig {
        engine: EngineConfig {
            binary: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            working_dir: dir.path().to_path_buf(),
            start_timeout: Duration::from_secs(5),
            stop_grace: Duration::from_millis(500),
            ..EngineConfig::default()
        },
        heartbeat_interval: Duration::from_millis(50),
        lock_timeout: Duration::from_secs(2),
        idle_timeout: None,
        owner_id: None,
        ..CoordinatorConfig::default()
    }
}

async fn coordinator(db: &Path, config: CoordinatorConfig) -> SessionCoordinator {
    let store = SessionStore::open(db).await.unwrap();
    let registry = ExtensionRegistry::new(store.clone());
    SessionCoordinator::new(store, registry, Arc::new(StreamRelay::default()), config)
}

/// Collect events until one matches `done`.
async fn wait_for(sub: &mut Subscription, done: impl Fn(&RelayEvent) -> bool) -> Vec<RelayEvent> {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), sub.recv())
            .await
            .expect("timed out waiting for relay event")
            .expect("subscription ended");
        let finished = done(&event);
        seen.push(event);
        if finished {
            return seen;
        }
    }
}

fn is_final(event: &RelayEvent) -> bool {
    matches!(event, RelayEvent::Token(t) if t.is_final)
}

#[tokio::test]
async fn test_turn_streams_persists_and_closes() {
    let dir = TempDir::new().unwrap();
    let coord = coordinator(&dir.path().join("s.db"), config(&dir, ECHO_ENGINE)).await;
    let session = coord.open_session(Some("first")).await.unwrap();
    assert_eq!(coord.engine_state(&session.id).await, None);

    let mut sub = coord.subscribe(&session.id).await.unwrap();
    let receipt = coord.send_message(&session.id, "ping").await.unwrap();
    assert_eq!((receipt.user_seq, receipt.response_seq), (1, 2));

    let events = wait_for(&mut sub, is_final).await;
    assert!(matches!(events[0], RelayEvent::CaughtUp { .. }));
    assert!(events
        .iter()
        .any(|e| matches!(e, RelayEvent::UserMessage { body, .. } if body == "ping")));

    let history = coord.history(&session.id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].body, "pong\n");
    assert!(history[1].completed);

    assert_eq!(coord.active_bindings().await, vec![session.id.clone()]);
    assert_eq!(coord.engine_state(&session.id).await, Some(EngineState::Idle));
    assert!(coord.store().lock_holder(&session.id).await.unwrap().is_some());

    coord.close_session(&session.id).await.unwrap();
    coord.close_session(&session.id).await.unwrap();
    assert!(coord.active_bindings().await.is_empty());
    assert!(coord.store().lock_holder(&session.id).await.unwrap().is_none());
    assert!(matches!(
        wait_for(&mut sub, |e| matches!(e, RelayEvent::SessionClosed { .. })).await.last(),
        Some(RelayEvent::SessionClosed { .. })
    ));
}

#[tokio::test]
async fn test_close_unbound_or_unknown_session_is_noop() {
    let dir = TempDir::new().unwrap();
    let coord = coordinator(&dir.path().join("s.db"), config(&dir, ECHO_ENGINE)).await;
    let session = coord.open_session(None).await.unwrap();
    assert!(session.title.starts_with("session_"));

    coord.close_session(&session.id).await.unwrap();
    coord.close_session(&session.id).await.unwrap();
    coord.close_session("no-such-session").await.unwrap();
}

#[tokio::test]
async fn test_crash_leaves_interrupted_message_and_resend_succeeds() {
    let dir = TempDir::new().unwrap();
    // First prompt ever: emit a little, then die hard
    let script = r#"
while IFS= read -r line; do
  case "$line" in
    *'"type":"prompt"'*)
      if [ ! -f crashed ]; then touch crashed; echo 'half'; kill -9 $$; fi
      echo 'whole answer'; echo '<<END>>' ;;
  esac
done
"#;
    let coord = coordinator(&dir.path().join("s.db"), config(&dir, script)).await;
    let session = coord.open_session(Some("crashy")).await.unwrap();
    let mut sub = coord.subscribe(&session.id).await.unwrap();

    let first = coord.send_message(&session.id, "hello").await.unwrap();
    let events = wait_for(&mut sub, |e| matches!(e, RelayEvent::EngineCrashed { .. })).await;
    assert!(matches!(
        events.last(),
        Some(RelayEvent::EngineCrashed { seq: Some(seq), .. }) if *seq == first.response_seq
    ));

    let history = coord.history(&session.id).await.unwrap();
    let incomplete: Vec<_> = history.iter().filter(|m| !m.completed).collect();
    assert_eq!(incomplete.len(), 1);
    assert!(incomplete[0].interrupted);
    assert_eq!(incomplete[0].body, "half\n");

    let second = coord.send_message(&session.id, "hello").await.unwrap();
    assert_eq!(second.user_seq, first.response_seq + 1);
    wait_for(&mut sub, is_final).await;

    let history = coord.history(&session.id).await.unwrap();
    assert_eq!(history.len(), 4);
    let prior = &history[(first.response_seq - 1) as usize];
    assert!(prior.interrupted);
    assert_eq!(prior.body, "half\n");
    let latest = &history[(second.response_seq - 1) as usize];
    assert!(latest.completed);
    assert_eq!(latest.body, "whole answer\n");
}

#[tokio::test]
async fn test_hybrid_contention_until_heartbeat_lapses() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("shared.db");

    let mut config_a = config(&dir, ECHO_ENGINE);
    config_a.owner_id = Some("terminal".to_string());
    config_a.lock_timeout = Duration::from_millis(400);
    let mut config_b = config_a.clone();
    config_b.owner_id = Some("web".to_string());

    let a = coordinator(&db, config_a).await;
    let b = coordinator(&db, config_b).await;

    let session = a.open_session(Some("shared")).await.unwrap();
    let mut sub = a.subscribe(&session.id).await.unwrap();
    a.send_message(&session.id, "from terminal").await.unwrap();
    wait_for(&mut sub, is_final).await;

    let err = b.send_message(&session.id, "from web").await.unwrap_err();
    assert!(matches!(&err, RoostError::LockContention { owner, .. } if owner == "terminal"));
    assert_eq!(err.user_hint(), "session busy elsewhere");

    // A keeps renewing well past the lock timeout
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(matches!(
        b.resume_session(&session.id).await,
        Err(RoostError::LockContention { .. })
    ));

    // A dies without cleaning up; its lock record stays behind
    drop(sub);
    drop(a);
    assert!(matches!(
        b.send_message(&session.id, "from web").await,
        Err(RoostError::LockContention { .. })
    ));

    tokio::time::sleep(Duration::from_millis(700)).await;
    let mut sub = b.subscribe(&session.id).await.unwrap();
    b.send_message(&session.id, "from web").await.unwrap();
    wait_for(&mut sub, is_final).await;

    let holder = b.store().lock_holder(&session.id).await.unwrap().unwrap();
    assert_eq!(holder.owner, "web");
    assert_eq!(b.history(&session.id).await.unwrap().len(), 4);
    b.shutdown().await;
}

#[tokio::test]
async fn test_subscriber_in_other_process_sees_response_in_flight() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("shared.db");

    let mut config_a = config(&dir, ENDLESS_ENGINE);
    config_a.owner_id = Some("terminal".to_string());
    let mut config_b = config_a.clone();
    config_b.owner_id = Some("web".to_string());
    let a = coordinator(&db, config_a).await;
    let b = coordinator(&db, config_b).await;

    let session = a.open_session(Some("shared")).await.unwrap();
    let mut sub_a = a.subscribe(&session.id).await.unwrap();
    let receipt = a.send_message(&session.id, "keep going").await.unwrap();
    wait_for(&mut sub_a, |e| matches!(e, RelayEvent::Token(_))).await;

    // Nothing streams through B's relay, but the store knows better
    assert_eq!(b.relay().in_flight(&session.id), None);
    let mut sub_b = b.subscribe(&session.id).await.unwrap();
    assert!(matches!(
        sub_b.recv().await,
        Some(RelayEvent::InFlight { seq, .. }) if seq == receipt.response_seq
    ));

    a.stop_response(&session.id).await.unwrap();
    let mut settled = b.subscribe(&session.id).await.unwrap();
    assert!(matches!(settled.recv().await, Some(RelayEvent::CaughtUp { .. })));
    a.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_sends_spawn_one_engine() {
    let dir = TempDir::new().unwrap();
    let script = format!("echo started >> spawns.log\n{ECHO_ENGINE}");
    let coord = Arc::new(coordinator(&dir.path().join("s.db"), config(&dir, &script)).await);
    let session = coord.open_session(Some("stress")).await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..12 {
        let coord = coord.clone();
        let id = session.id.clone();
        tasks.push(tokio::spawn(async move {
            coord.send_message(&id, &format!("message {i}")).await
        }));
    }

    let mut accepted = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(RoostError::EngineBusy(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert!(accepted >= 1);

    let mut sub = coord.subscribe(&session.id).await.unwrap();
    if coord.relay().in_flight(&session.id).is_some() {
        wait_for(&mut sub, is_final).await;
    }

    let spawns = std::fs::read_to_string(dir.path().join("spawns.log")).unwrap();
    assert_eq!(spawns.lines().count(), 1);
    assert_eq!(coord.active_bindings().await.len(), 1);

    // Sequence numbers stayed gap-free through the contention
    let seqs: Vec<i64> = coord
        .history(&session.id)
        .await
        .unwrap()
        .iter()
        .map(|m| m.seq)
        .collect();
    assert_eq!(seqs, (1..=seqs.len() as i64).collect::<Vec<_>>());
    coord.shutdown().await;
}

#[tokio::test]
async fn test_stop_from_another_task_interrupts_response() {
    let dir = TempDir::new().unwrap();
    let coord = Arc::new(coordinator(&dir.path().join("s.db"), config(&dir, ENDLESS_ENGINE)).await);
    let session = coord.open_session(Some("long")).await.unwrap();
    let mut sub = coord.subscribe(&session.id).await.unwrap();

    let receipt = coord.send_message(&session.id, "go on").await.unwrap();
    wait_for(&mut sub, |e| matches!(e, RelayEvent::Token(_))).await;
    assert_eq!(coord.engine_state(&session.id).await, Some(EngineState::Streaming));

    let canceller = coord.clone();
    let id = session.id.clone();
    tokio::spawn(async move { canceller.stop_response(&id).await })
        .await
        .unwrap()
        .unwrap();

    let events = wait_for(&mut sub, |e| matches!(e, RelayEvent::Interrupted { .. })).await;
    assert!(matches!(
        events.last(),
        Some(RelayEvent::Interrupted { seq, .. }) if *seq == receipt.response_seq
    ));
    let history = coord.history(&session.id).await.unwrap();
    assert!(history.last().unwrap().interrupted);
    assert!(coord.active_bindings().await.is_empty());

    // The session is still usable
    let again = coord.send_message(&session.id, "once more").await.unwrap();
    assert_eq!(again.user_seq, receipt.response_seq + 1);
    coord.shutdown().await;
    assert!(coord.store().lock_holder(&session.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_idle_engine_is_reaped() {
    let dir = TempDir::new().unwrap();
    let mut cfg = config(&dir, ECHO_ENGINE);
    cfg.idle_timeout = Some(Duration::from_millis(200));
    let coord = coordinator(&dir.path().join("s.db"), cfg).await;
    let session = coord.open_session(None).await.unwrap();

    let mut sub = coord.subscribe(&session.id).await.unwrap();
    coord.send_message(&session.id, "ping").await.unwrap();
    wait_for(&mut sub, is_final).await;

    let mut reaped = false;
    for _ in 0..60 {
        if coord.active_bindings().await.is_empty() {
            reaped = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(reaped);
    assert!(coord.store().lock_holder(&session.id).await.unwrap().is_none());

    // A new turn binds again
    coord.send_message(&session.id, "ping").await.unwrap();
    wait_for(&mut sub, is_final).await;
    assert_eq!(coord.history(&session.id).await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_lost_lock_stops_engine() {
    let dir = TempDir::new().unwrap();
    let mut cfg = config(&dir, ECHO_ENGINE);
    cfg.owner_id = Some("original".to_string());
    let coord = coordinator(&dir.path().join("s.db"), cfg).await;
    let session = coord.open_session(None).await.unwrap();
    coord.resume_session(&session.id).await.unwrap();
    assert_eq!(coord.active_bindings().await.len(), 1);

    // Another process reclaims the session behind our back
    let store = coord.store();
    assert!(store.release_lock(&session.id, "original").await.unwrap());
    store
        .try_acquire_lock(&session.id, "intruder", Duration::from_secs(2))
        .await
        .unwrap();

    let mut stopped = false;
    for _ in 0..60 {
        if coord.active_bindings().await.is_empty() {
            stopped = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(stopped);
    assert_eq!(
        store.lock_holder(&session.id).await.unwrap().unwrap().owner,
        "intruder"
    );
    assert!(matches!(
        coord.send_message(&session.id, "hi").await,
        Err(RoostError::LockContention { .. })
    ));
}

#[tokio::test]
async fn test_failed_start_leaves_session_unbound() {
    let dir = TempDir::new().unwrap();
    let mut cfg = config(&dir, ECHO_ENGINE);
    cfg.engine.binary = "roost-missing-engine".to_string();
    let coord = coordinator(&dir.path().join("s.db"), cfg).await;
    let session = coord.open_session(None).await.unwrap();

    let err = coord.send_message(&session.id, "hi").await.unwrap_err();
    assert!(matches!(err, RoostError::EngineSpawn(_)));
    assert!(coord.active_bindings().await.is_empty());
    assert!(coord.store().lock_holder(&session.id).await.unwrap().is_none());
    assert!(coord.history(&session.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_session_management() {
    let dir = TempDir::new().unwrap();
    let coord = coordinator(&dir.path().join("s.db"), config(&dir, ECHO_ENGINE)).await;
    let first = coord.open_session(Some("first")).await.unwrap();
    let second = coord.open_session(Some("second")).await.unwrap();

    let view = coord
        .switch_active_session(Some(&second.id), &first.id)
        .await
        .unwrap();
    assert_eq!(view.session.title, "first");
    assert!(view.messages.is_empty());
    let titles: Vec<String> = coord
        .list_sessions()
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.title)
        .collect();
    assert_eq!(titles, vec!["first", "second"]);

    assert!(matches!(
        coord.switch_active_session(None, "missing").await,
        Err(RoostError::SessionNotFound(_))
    ));

    let enabled = coord
        .configure_extensions(&first.id, ["GitHub", "screen"])
        .await
        .unwrap();
    assert_eq!(enabled.len(), 2);
    assert!(matches!(
        coord.configure_extensions(&first.id, ["warp-drive"]).await,
        Err(RoostError::UnknownExtension(_))
    ));
    assert_eq!(coord.available_extensions().len(), 4);

    coord.delete_session(&second.id).await.unwrap();
    assert_eq!(coord.list_sessions().await.unwrap().len(), 1);
    assert!(matches!(
        coord.send_message(&second.id, "hi").await,
        Err(RoostError::SessionNotFound(_))
    ));
}
