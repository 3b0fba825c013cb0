//! Lifecycle tests for the orchestrator against a mock provisioner

mod common;

use common::{wait_for, Harness, TestOptions, ROUTE_BASE};
use serde_json::json;
use spawnhub::error::{ConflictKind, LifecycleError};
use spawnhub::orchestrator::{ProgressView, StartOutcome, StopOutcome};
use spawnhub::progress::ProgressEvent;
use spawnhub::provisioner::BackendHandle;
use spawnhub::record::{BackendRecord, ServerKey, ServerState};
use spawnhub::routes::{RouteData, RouteEntry, RouteOp, RouteTable};
use std::time::Duration;

fn handle_of(record: &BackendRecord) -> BackendHandle {
    BackendHandle {
        target: record.target.clone().unwrap(),
        state: record.provisioner_state.clone(),
    }
}

fn state_of(h: &Harness, owner: &str, name: &str) -> Option<ServerState> {
    h.orch.get_record(owner, name).ok().map(|r| r.state)
}

// ==================== Start ====================

#[tokio::test]
async fn test_start_reaches_ready_and_registers_route() {
    let h = Harness::new();

    let outcome = h.orch.request_start("alice", "", json!({"image": "base"})).await.unwrap();
    assert_eq!(
        outcome,
        StartOutcome::Ready {
            url: "/user/alice/".to_string()
        }
    );

    let record = h.orch.get_record("alice", "").unwrap();
    assert_eq!(record.state, ServerState::Ready);
    assert_eq!(record.route.as_deref(), Some("/user/alice/"));
    assert_eq!(record.options["image"], "base");
    assert!(record.started_at.is_some());

    let route = h.routes.get("/user/alice/").unwrap();
    assert_eq!(Some(route.target), record.target);
    assert_eq!(route.data, RouteData::for_server(&ServerKey::default_server("alice")));

    // Persisted
    let stored = h.store.get(&ServerKey::default_server("alice")).unwrap().unwrap();
    assert_eq!(stored.state, ServerState::Ready);
}

#[tokio::test]
async fn test_named_servers_are_independent() {
    let h = Harness::new();

    h.orch.request_start("alice", "", json!({})).await.unwrap();
    let outcome = h.orch.request_start("alice", "lab", json!({})).await.unwrap();
    assert_eq!(
        outcome,
        StartOutcome::Ready {
            url: "/user/alice/lab/".to_string()
        }
    );

    assert!(h.routes.get("/user/alice/").is_some());
    assert!(h.routes.get("/user/alice/lab/").is_some());
    assert_eq!(h.orch.list_records().len(), 2);
}

#[tokio::test]
async fn test_invalid_server_name_is_rejected() {
    let h = Harness::new();

    let err = h.orch.request_start("alice", "progress", json!({})).await.unwrap_err();
    assert!(matches!(err, LifecycleError::InvalidRequest(_)));

    let err = h.orch.request_start("alice", "a b", json!({})).await.unwrap_err();
    assert!(matches!(err, LifecycleError::InvalidRequest(_)));
    assert_eq!(h.provisioner.start_count(), 0);
}

#[tokio::test]
async fn test_start_when_ready_conflicts() {
    let h = Harness::new();
    h.orch.request_start("alice", "", json!({})).await.unwrap();

    let err = h.orch.request_start("alice", "", json!({})).await.unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::Conflict {
            kind: ConflictKind::AlreadyRunning,
            ..
        }
    ));
    assert_eq!(h.provisioner.start_count(), 1);
}

#[tokio::test]
async fn test_slow_start_returns_pending_and_finishes_in_background() {
    let mut options = TestOptions::default();
    options.settings.slow_spawn_timeout = Duration::from_millis(50);
    let h = Harness::with_options(options);
    h.provisioner.set_ready_delay(Duration::from_millis(300));

    let outcome = h.orch.request_start("alice", "", json!({})).await.unwrap();
    assert_eq!(outcome, StartOutcome::Pending);
    assert_eq!(state_of(&h, "alice", ""), Some(ServerState::SpawnPending));

    // A second request joins instead of starting again
    let outcome = h.orch.request_start("alice", "", json!({})).await.unwrap();
    assert!(outcome.already_pending());

    assert!(wait_for(Duration::from_secs(3), || state_of(&h, "alice", "") == Some(ServerState::Ready)).await);
    assert_eq!(h.provisioner.start_count(), 1);
    assert!(h.routes.get("/user/alice/").is_some());
}

#[tokio::test]
async fn test_concurrent_starts_admit_exactly_one() {
    let mut options = TestOptions::default();
    options.settings.slow_spawn_timeout = Duration::from_millis(50);
    let h = Harness::with_options(options);
    h.provisioner.set_start_delay(Duration::from_millis(200));

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let orch = h.orch.clone();
        tasks.push(tokio::spawn(async move { orch.request_start("alice", "", json!({})).await }));
    }

    let mut accepted = 0;
    for task in tasks {
        let outcome = task.await.unwrap().unwrap();
        if outcome.accepted() {
            accepted += 1;
        } else {
            assert!(outcome.already_pending());
        }
    }

    assert_eq!(accepted, 1);
    assert!(wait_for(Duration::from_secs(3), || state_of(&h, "alice", "") == Some(ServerState::Ready)).await);
    assert_eq!(h.provisioner.start_count(), 1);
}

#[tokio::test]
async fn test_unsaved_server_is_dropped_when_store_rejects_start() {
    let h = Harness::new();
    let conn = rusqlite::Connection::open(&h.store_path).unwrap();
    conn.execute_batch(
        "CREATE TRIGGER reject_inserts BEFORE INSERT ON servers
         BEGIN SELECT RAISE(ABORT, 'store is read-only'); END;",
    )
    .unwrap();

    assert!(h.orch.request_start("alice", "", json!({})).await.is_err());
    assert_eq!(h.provisioner.start_count(), 0);
    assert!(h.orch.list_records().is_empty());
    assert!(matches!(h.orch.get_record("alice", ""), Err(LifecycleError::NotFound(_))));

    conn.execute_batch("DROP TRIGGER reject_inserts;").unwrap();
    h.orch.request_start("alice", "", json!({})).await.unwrap();
    assert_eq!(state_of(&h, "alice", ""), Some(ServerState::Ready));
}

// ==================== Admission ====================

#[tokio::test]
async fn test_throttles_when_too_many_starts_are_pending() {
    let mut options = TestOptions::default();
    options.concurrent_spawn_limit = 2;
    options.retry_min_secs = 5;
    options.retry_max_secs = 10;
    options.settings.slow_spawn_timeout = Duration::from_millis(20);
    let h = Harness::with_options(options);
    h.provisioner.set_ready_delay(Duration::from_millis(500));

    assert_eq!(h.orch.request_start("alice", "", json!({})).await.unwrap(), StartOutcome::Pending);
    assert_eq!(h.orch.request_start("bob", "", json!({})).await.unwrap(), StartOutcome::Pending);
    assert_eq!(h.orch.admission_snapshot().pending(), 2);

    match h.orch.request_start("carol", "", json!({})).await.unwrap_err() {
        LifecycleError::Throttled { retry_after_secs } => {
            assert!((5..=10).contains(&retry_after_secs), "{}", retry_after_secs);
        }
        other => panic!("expected throttling, got {:?}", other),
    }

    // The throttled request left nothing behind
    assert!(matches!(
        h.orch.get_record("carol", ""),
        Err(LifecycleError::NotFound(_))
    ));
    assert_eq!(h.provisioner.start_count(), 2);

    // Once the pending starts finish, carol is admitted
    assert!(wait_for(Duration::from_secs(3), || h.orch.admission_snapshot().pending() == 0).await);
    assert!(h.orch.request_start("carol", "", json!({})).await.unwrap().accepted());
}

#[tokio::test]
async fn test_proxy_pending_counts_towards_spawn_limit() {
    let mut options = TestOptions::default();
    options.concurrent_spawn_limit = 1;
    options.settings.slow_spawn_timeout = Duration::from_millis(20);
    let h = Harness::with_options(options);
    h.routes.set_delay(Some(Duration::from_millis(400)));

    assert_eq!(h.orch.request_start("alice", "", json!({})).await.unwrap(), StartOutcome::Pending);
    assert!(wait_for(Duration::from_secs(1), || h.orch.admission_snapshot().proxy_pending == 1).await);

    let err = h.orch.request_start("bob", "", json!({})).await.unwrap_err();
    assert!(matches!(err, LifecycleError::Throttled { .. }));
}

#[tokio::test]
async fn test_capacity_limit_rejects_new_servers() {
    let mut options = TestOptions::default();
    options.active_server_limit = 1;
    let h = Harness::with_options(options);

    h.orch.request_start("alice", "", json!({})).await.unwrap();
    let err = h.orch.request_start("bob", "", json!({})).await.unwrap_err();
    assert!(matches!(err, LifecycleError::CapacityExceeded { active: 1, limit: 1 }));

    // Stopping alice frees the slot
    h.orch.request_stop("alice", "", false).await.unwrap();
    assert!(h.orch.request_start("bob", "", json!({})).await.unwrap().accepted());
}

// ==================== Start failures ====================

#[tokio::test]
async fn test_provisioner_start_failure_marks_failed() {
    let h = Harness::new();
    h.provisioner.fail_next_starts(1);

    let err = h.orch.request_start("alice", "", json!({})).await.unwrap_err();
    assert!(matches!(err, LifecycleError::Provisioner(_)));

    let record = h.orch.get_record("alice", "").unwrap();
    assert_eq!(record.state, ServerState::Failed);
    assert!(record.last_error.unwrap().contains("mock start failure"));
    assert!(h.routes.routes().is_empty());
    assert_eq!(h.orch.breaker().consecutive_failures(), 1);

    // A failed server may be started again
    assert!(h.orch.request_start("alice", "", json!({})).await.unwrap().accepted());
    assert_eq!(h.orch.breaker().consecutive_failures(), 0);
}

#[tokio::test]
async fn test_readiness_failure_stops_backend() {
    let h = Harness::new();
    h.provisioner.fail_next_readiness(1);

    let err = h.orch.request_start("alice", "", json!({})).await.unwrap_err();
    assert!(matches!(err, LifecycleError::Provisioner(_)));
    assert_eq!(h.provisioner.stop_count(), 1);
    assert_eq!(h.provisioner.running_count(), 0);
    assert_eq!(state_of(&h, "alice", ""), Some(ServerState::Failed));
}

#[tokio::test]
async fn test_start_timeout_fails_start() {
    let mut options = TestOptions::default();
    options.settings.start_timeout = Duration::from_millis(100);
    let h = Harness::with_options(options);
    h.provisioner.set_ready_delay(Duration::from_secs(5));

    let err = h.orch.request_start("alice", "", json!({})).await.unwrap_err();
    assert!(err.to_string().contains("did not become ready"), "{}", err);
    assert_eq!(h.provisioner.running_count(), 0);
    assert_eq!(state_of(&h, "alice", ""), Some(ServerState::Failed));
}

#[tokio::test]
async fn test_route_failure_triggers_compensating_stop() {
    let h = Harness::new();
    h.routes.fail_next(RouteOp::Add, 10);

    let err = h.orch.request_start("alice", "", json!({})).await.unwrap_err();
    assert!(matches!(err, LifecycleError::RouteSync(_)));

    // Every attempt was made, then the backend was stopped
    assert_eq!(h.routes.add_count(), 2);
    assert_eq!(h.provisioner.stop_count(), 1);
    assert_eq!(h.provisioner.running_count(), 0);

    let record = h.orch.get_record("alice", "").unwrap();
    assert_eq!(record.state, ServerState::Failed);
    assert!(record.target.is_none());
    assert!(record.route.is_none());
}

#[tokio::test]
async fn test_transient_route_failure_is_retried() {
    let h = Harness::new();
    h.routes.fail_next(RouteOp::Add, 1);

    assert!(h.orch.request_start("alice", "", json!({})).await.unwrap().accepted());
    assert_eq!(state_of(&h, "alice", ""), Some(ServerState::Ready));
    assert_eq!(h.routes.add_count(), 2);
}

#[tokio::test]
async fn test_breaker_trips_once_and_signals_fatal() {
    let mut options = TestOptions::default();
    options.consecutive_failure_limit = 3;
    let h = Harness::with_options(options);
    let mut fatal = h.orch.fatal_signal();
    h.provisioner.fail_next_starts(5);

    for user in ["u1", "u2", "u3", "u4", "u5"] {
        assert!(h.orch.request_start(user, "", json!({})).await.is_err());
    }
    assert_eq!(h.orch.breaker().consecutive_failures(), 5);
    assert!(h.orch.breaker().is_tripped());

    tokio::time::timeout(Duration::from_secs(2), fatal.changed())
        .await
        .unwrap()
        .unwrap();
    let reason = fatal.borrow_and_update().clone().unwrap();
    assert!(reason.contains("3 consecutive"), "{}", reason);

    // No second trip
    let again = tokio::time::timeout(Duration::from_millis(200), fatal.changed()).await;
    assert!(again.is_err());
}

#[tokio::test]
async fn test_breaker_disabled_never_signals() {
    let h = Harness::new();
    let mut fatal = h.orch.fatal_signal();
    h.provisioner.fail_next_starts(4);

    for user in ["u1", "u2", "u3", "u4"] {
        assert!(h.orch.request_start(user, "", json!({})).await.is_err());
    }
    assert!(!h.orch.breaker().is_tripped());
    assert!(tokio::time::timeout(Duration::from_millis(200), fatal.changed()).await.is_err());
}

// ==================== Stop ====================

#[tokio::test]
async fn test_stop_removes_route_before_backend() {
    let h = Harness::new();
    h.orch.request_start("alice", "", json!({})).await.unwrap();

    let outcome = h.orch.request_stop("alice", "", false).await.unwrap();
    assert_eq!(outcome, StopOutcome::Stopped);

    assert_eq!(h.provisioner.route_present_at_stop(), vec![false]);
    assert!(h.routes.get("/user/alice/").is_none());

    let record = h.orch.get_record("alice", "").unwrap();
    assert_eq!(record.state, ServerState::Stopped);
    assert!(record.target.is_none());
    assert!(record.provisioner_state.is_null());
}

#[tokio::test]
async fn test_stop_while_starting_conflicts() {
    let mut options = TestOptions::default();
    options.settings.slow_spawn_timeout = Duration::from_millis(20);
    let h = Harness::with_options(options);
    h.provisioner.set_ready_delay(Duration::from_millis(300));

    assert_eq!(h.orch.request_start("alice", "", json!({})).await.unwrap(), StartOutcome::Pending);
    let err = h.orch.request_stop("alice", "", false).await.unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::Conflict {
            kind: ConflictKind::SpawnPending,
            ..
        }
    ));
}

#[tokio::test]
async fn test_slow_stop_is_pending_and_start_conflicts() {
    let mut options = TestOptions::default();
    options.settings.slow_stop_timeout = Duration::from_millis(20);
    let h = Harness::with_options(options);
    h.orch.request_start("alice", "", json!({})).await.unwrap();
    h.provisioner.set_stop_delay(Duration::from_millis(300));

    assert_eq!(h.orch.request_stop("alice", "", false).await.unwrap(), StopOutcome::Pending);
    assert_eq!(state_of(&h, "alice", ""), Some(ServerState::StopPending));

    let err = h.orch.request_start("alice", "", json!({})).await.unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::Conflict {
            kind: ConflictKind::StopPending,
            ..
        }
    ));

    // A second stop joins the first
    let _ = h.orch.request_stop("alice", "", false).await.unwrap();
    assert!(wait_for(Duration::from_secs(2), || state_of(&h, "alice", "") == Some(ServerState::Stopped)).await);
    assert_eq!(h.provisioner.stop_count(), 1);
}

#[tokio::test]
async fn test_stop_of_stopped_server_is_immediate() {
    let h = Harness::new();
    h.orch.request_start("alice", "", json!({})).await.unwrap();
    h.orch.request_stop("alice", "", false).await.unwrap();

    assert_eq!(h.orch.request_stop("alice", "", false).await.unwrap(), StopOutcome::Stopped);
    assert_eq!(h.provisioner.stop_count(), 1);
}

#[tokio::test]
async fn test_stop_of_failed_server_settles_to_stopped() {
    let h = Harness::new();
    h.provisioner.fail_next_starts(1);
    let _ = h.orch.request_start("alice", "", json!({})).await;

    assert_eq!(h.orch.request_stop("alice", "", false).await.unwrap(), StopOutcome::Stopped);
    assert_eq!(state_of(&h, "alice", ""), Some(ServerState::Stopped));
}

#[tokio::test]
async fn test_stop_unknown_server_is_not_found() {
    let h = Harness::new();
    let err = h.orch.request_stop("nobody", "", false).await.unwrap_err();
    assert!(matches!(err, LifecycleError::NotFound(_)));
}

#[tokio::test]
async fn test_stop_with_remove_deletes_record() {
    let h = Harness::new();
    h.orch.request_start("alice", "lab", json!({})).await.unwrap();

    h.orch.request_stop("alice", "lab", true).await.unwrap();
    assert!(matches!(h.orch.get_record("alice", "lab"), Err(LifecycleError::NotFound(_))));
    assert!(h.store.get(&ServerKey::new("alice", "lab")).unwrap().is_none());

    // The name can be reused
    assert!(h.orch.request_start("alice", "lab", json!({})).await.unwrap().accepted());
}

#[tokio::test]
async fn test_delete_waits_for_slow_stop() {
    let mut options = TestOptions::default();
    options.settings.slow_stop_timeout = Duration::from_millis(20);
    let h = Harness::with_options(options);
    h.orch.request_start("alice", "", json!({})).await.unwrap();
    h.provisioner.set_stop_delay(Duration::from_millis(200));

    h.orch.delete_server("alice", "").await.unwrap();
    assert!(h.store.get(&ServerKey::default_server("alice")).unwrap().is_none());
    assert_eq!(h.provisioner.running_count(), 0);

    let err = h.orch.delete_server("alice", "").await.unwrap_err();
    assert!(matches!(err, LifecycleError::NotFound(_)));
}

#[tokio::test]
async fn test_stop_failure_still_clears_record() {
    let h = Harness::new();
    h.orch.request_start("alice", "", json!({})).await.unwrap();
    h.provisioner.fail_next_stops(1);

    let err = h.orch.request_stop("alice", "", false).await.unwrap_err();
    assert!(matches!(err, LifecycleError::Provisioner(_)));
    assert_eq!(state_of(&h, "alice", ""), Some(ServerState::Stopped));
    assert!(h.routes.get("/user/alice/").is_none());
}

#[tokio::test]
async fn test_route_delete_failure_does_not_block_stop() {
    let h = Harness::new();
    h.orch.request_start("alice", "", json!({})).await.unwrap();
    h.routes.fail_next(RouteOp::Delete, 10);

    assert_eq!(h.orch.request_stop("alice", "", false).await.unwrap(), StopOutcome::Stopped);
    assert_eq!(h.provisioner.running_count(), 0);
    assert_eq!(state_of(&h, "alice", ""), Some(ServerState::Stopped));
}

// ==================== Liveness ====================

#[tokio::test]
async fn test_unexpected_exit_is_cleaned_up() {
    let h = Harness::new();
    h.orch.request_start("alice", "", json!({})).await.unwrap();
    let record = h.orch.get_record("alice", "").unwrap();

    h.provisioner.exit(&handle_of(&record), Some(1));

    assert!(wait_for(Duration::from_secs(2), || state_of(&h, "alice", "") == Some(ServerState::Stopped)).await);
    assert!(h.routes.get("/user/alice/").is_none());

    // Restartable afterwards
    assert!(h.orch.request_start("alice", "", json!({})).await.unwrap().accepted());
}

#[tokio::test]
async fn test_watcher_of_old_generation_does_not_touch_new_server() {
    let h = Harness::new();
    h.orch.request_start("alice", "", json!({})).await.unwrap();
    let first = h.orch.get_record("alice", "").unwrap();
    h.orch.request_stop("alice", "", false).await.unwrap();
    h.orch.request_start("alice", "", json!({})).await.unwrap();

    // The old backend reporting an exit is irrelevant to the new one
    h.provisioner.exit(&handle_of(&first), Some(0));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(state_of(&h, "alice", ""), Some(ServerState::Ready));
}

// ==================== Progress ====================

#[tokio::test]
async fn test_progress_stream_ends_with_ready() {
    let mut options = TestOptions::default();
    options.settings.slow_spawn_timeout = Duration::from_millis(20);
    let h = Harness::with_options(options);
    h.provisioner.set_start_delay(Duration::from_millis(100));
    h.provisioner.set_ready_delay(Duration::from_millis(200));
    h.provisioner
        .set_progress_events(vec![ProgressEvent::new(50, "Pulling image"), ProgressEvent::failed("ignored")]);

    assert_eq!(h.orch.request_start("alice", "", json!({})).await.unwrap(), StartOutcome::Pending);

    let ProgressView::Live(mut sub) = h.orch.subscribe_progress("alice", "").unwrap() else {
        panic!("expected a live progress stream");
    };

    let mut events = Vec::new();
    while let Some(event) = tokio::time::timeout(Duration::from_secs(2), sub.recv()).await.unwrap() {
        events.push(event);
    }

    let last = events.last().unwrap();
    assert!(last.ready);
    assert_eq!(last.url.as_deref(), Some("/user/alice/"));
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    assert!(events.iter().any(|e| e.message == "Pulling image"));
    assert!(events.windows(2).all(|w| w[0].percent <= w[1].percent));
}

#[tokio::test]
async fn test_progress_after_completion() {
    let h = Harness::new();
    h.orch.request_start("alice", "", json!({})).await.unwrap();

    match h.orch.subscribe_progress("alice", "").unwrap() {
        ProgressView::Finished(event) => {
            assert!(event.ready);
            assert_eq!(event.url.as_deref(), Some("/user/alice/"));
        }
        ProgressView::Live(_) => panic!("start already finished"),
    }

    h.provisioner.fail_next_starts(1);
    let _ = h.orch.request_start("bob", "", json!({})).await;
    match h.orch.subscribe_progress("bob", "").unwrap() {
        ProgressView::Finished(event) => {
            assert!(event.failed);
            assert!(event.message.contains("mock start failure"));
        }
        ProgressView::Live(_) => panic!("start already finished"),
    }

    h.orch.request_stop("alice", "", false).await.unwrap();
    assert!(matches!(
        h.orch.subscribe_progress("alice", ""),
        Err(LifecycleError::Conflict {
            kind: ConflictKind::NotRunning,
            ..
        })
    ));
    assert!(matches!(
        h.orch.subscribe_progress("nobody", ""),
        Err(LifecycleError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_progress_stream_reports_failure() {
    let mut options = TestOptions::default();
    options.settings.slow_spawn_timeout = Duration::from_millis(20);
    let h = Harness::with_options(options);
    h.provisioner.set_ready_delay(Duration::from_millis(150));
    h.provisioner.fail_next_readiness(1);

    assert_eq!(h.orch.request_start("alice", "", json!({})).await.unwrap(), StartOutcome::Pending);
    let ProgressView::Live(mut sub) = h.orch.subscribe_progress("alice", "").unwrap() else {
        panic!("expected a live progress stream");
    };

    let mut last = None;
    while let Some(event) = tokio::time::timeout(Duration::from_secs(2), sub.recv()).await.unwrap() {
        last = Some(event);
    }
    let last = last.unwrap();
    assert!(last.failed);
    assert!(last.message.contains("mock readiness failure"));
}

// ==================== Routes ====================

#[tokio::test]
async fn test_check_routes_reconciles_table() {
    let mut options = TestOptions::default();
    options.settings.default_target = Some("http://127.0.0.1:8081".to_string());
    let h = Harness::with_options(options);

    h.orch.request_start("alice", "", json!({})).await.unwrap();
    h.orch.request_start("bob", "", json!({})).await.unwrap();

    // alice's route vanished, a ghost route points at a server nobody knows
    h.routes.delete_route("/user/alice/").await.unwrap();
    h.routes.insert(
        "/user/ghost/",
        RouteEntry {
            target: "http://127.0.0.1:1".to_string(),
            data: RouteData::for_server(&ServerKey::default_server("ghost")),
        },
    );
    // Routes without an owner are not ours
    h.routes.insert(
        "/services/metrics/",
        RouteEntry {
            target: "http://127.0.0.1:2".to_string(),
            data: RouteData::default(),
        },
    );

    let report = h.orch.check_routes().await.unwrap();
    assert_eq!(report.added, vec!["/".to_string(), "/user/alice/".to_string()]);
    assert_eq!(report.removed, vec!["/user/ghost/".to_string()]);

    assert!(h.routes.get("/user/alice/").is_some());
    assert!(h.routes.get("/user/bob/").is_some());
    assert!(h.routes.get("/services/metrics/").is_some());
    assert_eq!(h.routes.get("/").unwrap().target, "http://127.0.0.1:8081");

    // A second pass has nothing to do
    let report = h.orch.check_routes().await.unwrap();
    assert!(report.added.is_empty());
    assert!(report.removed.is_empty());
}

#[tokio::test]
async fn test_check_routes_removes_route_of_stopped_server() {
    let h = Harness::new();
    h.orch.request_start("alice", "", json!({})).await.unwrap();
    // Exactly the attempts of the stop fail
    h.routes.fail_next(RouteOp::Delete, 2);
    h.orch.request_stop("alice", "", false).await.unwrap();
    assert!(h.routes.get("/user/alice/").is_some());

    let report = h.orch.check_routes().await.unwrap();
    assert_eq!(report.removed, vec!["/user/alice/".to_string()]);
    assert!(h.routes.get("/user/alice/").is_none());
}

#[tokio::test]
async fn test_check_routes_skips_pending_servers() {
    let mut options = TestOptions::default();
    options.settings.slow_stop_timeout = Duration::from_millis(20);
    let h = Harness::with_options(options);
    h.orch.request_start("alice", "", json!({})).await.unwrap();

    h.routes.set_delay(Some(Duration::from_millis(200)));
    assert_eq!(h.orch.request_stop("alice", "", false).await.unwrap(), StopOutcome::Pending);
    h.routes.set_delay(None);

    // The stop owns alice's route until it finishes
    let report = h.orch.check_routes().await.unwrap();
    assert!(report.removed.is_empty());
    assert!(report.added.is_empty());
}

// ==================== Activity ====================

#[tokio::test]
async fn test_activity_is_coalesced_and_persisted() {
    let h = Harness::new();
    h.orch.request_start("alice", "", json!({})).await.unwrap();
    let started = h.orch.get_record("alice", "").unwrap().last_activity.unwrap();

    assert!(!h.orch.record_activity("alice", "", started + chrono::Duration::seconds(5)).unwrap());

    let later = started + chrono::Duration::minutes(5);
    assert!(h.orch.record_activity("alice", "", later).unwrap());
    let stored = h.store.get(&ServerKey::default_server("alice")).unwrap().unwrap();
    assert_eq!(stored.last_activity, Some(later));

    assert!(matches!(
        h.orch.record_activity("nobody", "", later),
        Err(LifecycleError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_state_transitions_advance_last_activity() {
    let mut options = TestOptions::default();
    options.settings.activity_resolution = Duration::from_millis(1);
    let h = Harness::with_options(options);

    h.orch.request_start("alice", "", json!({})).await.unwrap();
    let ready_at = h.orch.get_record("alice", "").unwrap().last_activity.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.orch.request_stop("alice", "", false).await.unwrap(), StopOutcome::Stopped);

    let stopped = h.orch.get_record("alice", "").unwrap();
    let stopped_at = stopped.last_activity.unwrap();
    assert!(stopped_at > ready_at, "{} should be after {}", stopped_at, ready_at);
    let stored = h.store.get(&ServerKey::default_server("alice")).unwrap().unwrap();
    assert_eq!(stored.last_activity, Some(stopped_at));

    // A failed start counts as activity too
    tokio::time::sleep(Duration::from_millis(20)).await;
    h.provisioner.fail_next_starts(1);
    assert!(h.orch.request_start("alice", "", json!({})).await.is_err());
    let failed = h.orch.get_record("alice", "").unwrap();
    assert_eq!(failed.state, ServerState::Failed);
    assert!(failed.last_activity.unwrap() > stopped_at);
}

// ==================== Restart ====================

#[tokio::test]
async fn test_restore_reattaches_running_servers() {
    let h = Harness::new();
    h.orch.request_start("alice", "", json!({})).await.unwrap();
    h.orch.request_start("bob", "", json!({})).await.unwrap();
    let bob = h.orch.get_record("bob", "").unwrap();

    // bob's backend dies while the control plane is down; the proxy lost its table
    h.provisioner.exit(&handle_of(&bob), None);
    h.routes.delete_route("/user/alice/").await.unwrap();
    h.routes.delete_route("/user/bob/").await.unwrap();

    let next = h.restarted();
    assert_eq!(next.orch.restore().await.unwrap(), 1);

    assert_eq!(state_of(&next, "alice", ""), Some(ServerState::Ready));
    assert!(h.routes.get("/user/alice/").is_some());

    let bob = next.orch.get_record("bob", "").unwrap();
    assert_eq!(bob.state, ServerState::Stopped);
    assert!(bob.provisioner_state.is_null());
    assert!(h.routes.get("/user/bob/").is_none());

    // The restored server is watched
    let alice = next.orch.get_record("alice", "").unwrap();
    h.provisioner.exit(&handle_of(&alice), Some(137));
    assert!(wait_for(Duration::from_secs(2), || state_of(&next, "alice", "") == Some(ServerState::Stopped)).await);
}

#[tokio::test]
async fn test_restore_normalises_interrupted_operations() {
    let h = Harness::new();

    let mut pending = BackendRecord::new(ServerKey::default_server("carol"));
    pending.state = ServerState::SpawnPending;
    h.store.upsert(&pending).unwrap();

    let mut stopping = BackendRecord::new(ServerKey::new("dave", "lab"));
    stopping.state = ServerState::StopPending;
    stopping.provisioner_state = json!({"id": 999});
    h.store.upsert(&stopping).unwrap();

    let mut failed = BackendRecord::new(ServerKey::default_server("erin"));
    failed.state = ServerState::Failed;
    failed.last_error = Some("boom".to_string());
    h.store.upsert(&failed).unwrap();

    assert_eq!(h.orch.restore().await.unwrap(), 0);
    assert_eq!(state_of(&h, "carol", ""), Some(ServerState::Stopped));
    assert_eq!(state_of(&h, "dave", "lab"), Some(ServerState::Stopped));
    assert_eq!(state_of(&h, "erin", ""), Some(ServerState::Failed));

    // All of them can be started
    for (owner, name) in [("carol", ""), ("dave", "lab"), ("erin", "")] {
        assert!(h.orch.request_start(owner, name, json!({})).await.unwrap().accepted());
    }
}

#[tokio::test]
async fn test_records_are_loaded_lazily_from_store() {
    let h = Harness::new();
    h.orch.request_start("alice", "", json!({})).await.unwrap();
    h.orch.request_stop("alice", "", false).await.unwrap();

    // No restore: the record is read on first use
    let next = h.restarted();
    assert_eq!(state_of(&next, "alice", ""), Some(ServerState::Stopped));
    assert!(next.orch.request_start("alice", "", json!({})).await.unwrap().accepted());
}

// ==================== Shutdown ====================

#[tokio::test]
async fn test_shutdown_stops_running_servers() {
    let h = Harness::new();
    h.orch.request_start("alice", "", json!({})).await.unwrap();
    h.orch.request_start("bob", "lab", json!({})).await.unwrap();

    h.orch.shutdown().await;

    assert_eq!(h.provisioner.running_count(), 0);
    assert!(h.routes.routes().is_empty());
    for record in h.orch.list_records() {
        assert_eq!(record.state, ServerState::Stopped);
    }
}

#[tokio::test]
async fn test_shutdown_can_leave_servers_running() {
    let mut options = TestOptions::default();
    options.settings.stop_on_shutdown = false;
    let h = Harness::with_options(options);
    h.orch.request_start("alice", "", json!({})).await.unwrap();

    h.orch.shutdown().await;

    assert_eq!(h.provisioner.running_count(), 1);
    assert_eq!(state_of(&h, "alice", ""), Some(ServerState::Ready));
}

#[tokio::test]
async fn test_list_records_is_sorted() {
    let h = Harness::new();
    for (owner, name) in [("bob", ""), ("alice", "lab"), ("alice", "")] {
        h.orch.request_start(owner, name, json!({})).await.unwrap();
    }

    let keys: Vec<String> = h.orch.list_records().iter().map(|r| r.key.to_string()).collect();
    assert_eq!(keys, vec!["alice", "alice/lab", "bob"]);
    assert_eq!(
        h.orch.url_for(&ServerKey::new("bob", "x")),
        format!("{}bob/x/", ROUTE_BASE)
    );
}
