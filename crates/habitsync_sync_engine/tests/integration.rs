//! End-to-end sync passes between a local store and an in-memory remote.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use habitsync_protocol::{
    Badge, Completion, CompletionKey, Habit, QueuedMutation, StepRecord, SyncStatus, UserBadge,
};
use habitsync_storage::{FaultyBackend, InMemoryBackend};
use habitsync_store::{meta, LocalStore, RetryPolicy, StoreConfig};
use habitsync_sync_engine::{
    BackgroundSync, MemoryRemote, NetworkMonitor, RemoteError, RemoteMethod, RemoteService,
    SyncConfig, SyncOrchestrator, SyncPhase, SyncState,
};
use std::sync::Arc;
use std::time::Duration;

const USER: &str = "user-1";

struct Harness {
    store: Arc<LocalStore>,
    remote: Arc<MemoryRemote>,
    network: NetworkMonitor,
    sync: SyncOrchestrator,
}

impl Harness {
    fn new() -> Self {
        Self::with(LocalStore::open_in_memory().unwrap(), SyncConfig::new(USER))
    }

    fn with(store: LocalStore, config: SyncConfig) -> Self {
        let store = Arc::new(store);
        let remote = Arc::new(MemoryRemote::new());
        let network = NetworkMonitor::new();
        let sync = SyncOrchestrator::new(
            Arc::clone(&store),
            Arc::clone(&remote) as Arc<dyn RemoteService>,
            network.clone(),
            config,
        );
        Self {
            store,
            remote,
            network,
            sync,
        }
    }

    /// Creates a habit locally and queues its remote create, as the app does.
    fn create_habit(&self, id: &str, name: &str) -> Habit {
        let mut habit = Habit::new(USER, name, Utc::now());
        habit.id = id.to_string();
        let queued = habit.clone();
        self.store
            .transaction(|txn| {
                txn.create(queued.clone())?;
                txn.enqueue(QueuedMutation::CreateHabit(queued));
                Ok(())
            })
            .unwrap();
        habit
    }

    fn complete(&self, habit_id: &str, date: NaiveDate, at: DateTime<Utc>) {
        self.store
            .transaction(|txn| {
                txn.create(Completion::new(habit_id, date, at))?;
                txn.enqueue(QueuedMutation::CreateCompletion {
                    habit_id: habit_id.to_string(),
                    date,
                });
                Ok(())
            })
            .unwrap();
    }

    fn completion_row(&self, habit_id: &str, date: NaiveDate) -> Option<habitsync_store::Row<Completion>> {
        self.store.get_row::<Completion>(&CompletionKey {
            habit_id: habit_id.to_string(),
            date,
        })
    }
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

fn at(date: NaiveDate, hour: u32) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_hms_opt(hour, 0, 0).unwrap())
}

fn remote_habit(id: &str, name: &str) -> Habit {
    let mut habit = Habit::new(USER, name, Utc::now());
    habit.id = id.to_string();
    habit
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn offline_completion_is_pushed_on_reconnect() {
    let h = Harness::new();
    let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
    h.network.set_connected(false);
    h.create_habit("H1", "Read");
    h.complete("H1", date, at(date, 9));
    assert_eq!(h.completion_row("H1", date).unwrap().sync_status, SyncStatus::Pending);

    let report = h.sync.sync().await;
    assert!(!report.success);
    assert!(report.is_offline());
    assert_eq!(report.failures[0].phase, SyncPhase::Connectivity);
    assert_eq!(h.remote.total_calls(), 0);
    assert_eq!(h.completion_row("H1", date).unwrap().sync_status, SyncStatus::Pending);

    h.network.set_connected(true);
    let report = h.sync.sync().await;
    assert!(report.success, "{report:?}");
    assert_eq!(report.counts.pushed, 2);
    assert_eq!(report.counts.queue_superseded, 2);
    assert_eq!(report.counts.queue_replayed, 0);

    assert_eq!(h.completion_row("H1", date).unwrap().sync_status, SyncStatus::Synced);
    assert!(h
        .remote
        .completions()
        .iter()
        .any(|c| c.habit_id == "H1" && c.date == date));
    assert!(h.store.queue().is_empty());
    assert!(h.store.get_meta_time(meta::LAST_SYNC_AT).is_some());
}

#[tokio::test]
async fn concurrent_completions_keep_the_earliest() {
    let h = Harness::new();
    let date = today();
    h.remote.seed_habit(remote_habit("H1", "Stretch"));
    assert!(h.sync.sync().await.success);

    // This device marks the habit at 09:00, another device at 10:00.
    h.complete("H1", date, at(date, 9));
    h.remote.seed_completion(Completion::new("H1", date, at(date, 10)));

    let report = h.sync.sync().await;
    assert!(report.success, "{report:?}");

    let completions: Vec<Completion> = h
        .store
        .list::<Completion>()
        .into_iter()
        .filter(|c| c.habit_id == "H1" && c.date == date)
        .collect();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].completed_at, at(date, 9));
    assert_eq!(h.completion_row("H1", date).unwrap().sync_status, SyncStatus::Synced);
}

#[tokio::test]
async fn stale_local_steps_take_remote_maximum() {
    let h = Harness::new();
    let date = today();
    h.store
        .put_synced(StepRecord::new(USER, date, 4200, 3.0, 150.0), Utc::now())
        .unwrap();
    h.remote.seed_steps(StepRecord::new(USER, date, 9800, 7.1, 380.0));

    let report = h.sync.sync().await;
    assert!(report.success, "{report:?}");

    let row = h.store.get_row::<StepRecord>(&StepRecord::new(USER, date, 0, 0.0, 0.0).key()).unwrap();
    assert_eq!(row.data.steps, 9800);
    assert_eq!(row.sync_status, SyncStatus::Synced);
}

#[tokio::test]
async fn mixed_step_maximum_is_pushed_back() {
    let h = Harness::new();
    let date = today();
    let key = StepRecord::new(USER, date, 0, 0.0, 0.0).key();
    h.store
        .put_synced(StepRecord::new(USER, date, 4200, 3.0, 500.0), Utc::now())
        .unwrap();
    h.remote.seed_steps(StepRecord::new(USER, date, 9800, 7.1, 380.0));

    h.sync.sync().await;
    let row = h.store.get_row::<StepRecord>(&key).unwrap();
    assert_eq!(row.data, StepRecord::new(USER, date, 9800, 7.1, 500.0));
    assert_eq!(row.sync_status, SyncStatus::Pending);

    let report = h.sync.sync().await;
    assert!(report.success, "{report:?}");
    assert_eq!(h.store.get_row::<StepRecord>(&key).unwrap().sync_status, SyncStatus::Synced);
    assert_eq!(h.remote.steps(), vec![StepRecord::new(USER, date, 9800, 7.1, 500.0)]);
}

#[tokio::test]
async fn offline_steps_never_lower_the_remote_reading() {
    let h = Harness::new();
    let date = today();
    let key = StepRecord::new(USER, date, 0, 0.0, 0.0).key();
    h.store
        .transaction(|txn| {
            let record = StepRecord::new(USER, date, 4200, 3.0, 150.0);
            txn.create(record.clone())?;
            txn.enqueue(QueuedMutation::LogSteps(record));
            Ok(())
        })
        .unwrap();
    h.remote.seed_steps(StepRecord::new(USER, date, 9800, 7.1, 380.0));

    let report = h.sync.sync().await;
    assert!(report.success, "{report:?}");

    let row = h.store.get_row::<StepRecord>(&key).unwrap();
    assert_eq!(row.data, StepRecord::new(USER, date, 9800, 7.1, 380.0));
    assert_eq!(row.sync_status, SyncStatus::Synced);
    assert_eq!(h.remote.steps(), vec![StepRecord::new(USER, date, 9800, 7.1, 380.0)]);
    assert_eq!(h.remote.calls(RemoteMethod::LogSteps), 0);
    assert!(h.store.queue().get_pending().is_empty());
}

#[tokio::test]
async fn pending_steps_upload_the_per_field_maximum() {
    let h = Harness::new();
    let date = today();
    let key = StepRecord::new(USER, date, 0, 0.0, 0.0).key();
    h.store
        .transaction(|txn| {
            let record = StepRecord::new(USER, date, 4200, 3.0, 500.0);
            txn.upsert(record.clone());
            txn.enqueue(QueuedMutation::LogSteps(record));
            Ok(())
        })
        .unwrap();
    h.remote.seed_steps(StepRecord::new(USER, date, 9800, 7.1, 380.0));

    let report = h.sync.sync().await;
    assert!(report.success, "{report:?}");

    let merged = StepRecord::new(USER, date, 9800, 7.1, 500.0);
    let row = h.store.get_row::<StepRecord>(&key).unwrap();
    assert_eq!(row.data, merged);
    assert_eq!(row.sync_status, SyncStatus::Synced);
    assert_eq!(h.remote.steps(), vec![merged]);
}

#[tokio::test]
async fn replayed_step_item_does_not_lower_the_remote() {
    let h = Harness::new();
    let date = today();
    let current = StepRecord::new(USER, date, 9800, 7.1, 380.0);
    h.store
        .put_synced(current.clone(), Utc::now() - chrono::Duration::minutes(5))
        .unwrap();
    h.remote.seed_steps(current.clone());
    h.store
        .transaction(|txn| {
            txn.enqueue(QueuedMutation::LogSteps(StepRecord::new(USER, date, 4200, 3.0, 150.0)));
            Ok(())
        })
        .unwrap();

    let report = h.sync.sync().await;
    assert!(report.success, "{report:?}");
    assert_eq!(report.counts.queue_replayed, 1);
    assert_eq!(h.remote.calls(RemoteMethod::LogSteps), 0);
    assert_eq!(h.remote.steps(), vec![current]);
}

#[tokio::test]
async fn persistent_validation_error_dead_letters_the_item() {
    let config = StoreConfig::default()
        .sync_on_commit(false)
        .retry(RetryPolicy::new(5).with_backoff(vec![Duration::ZERO]));
    let store = LocalStore::open_with_backend(Box::new(InMemoryBackend::new()), config).unwrap();
    let h = Harness::with(store, SyncConfig::new(USER));
    h.create_habit("H2", "");

    for _ in 0..6 {
        let report = h.sync.sync().await;
        assert!(!report.success);
    }

    let queue = h.store.queue();
    assert!(queue.get_pending().is_empty());
    let failed = queue.get_failed_items();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].retry_count, 5);
    assert!(failed[0].error_message.as_deref().unwrap().contains("empty"));

    let row = h.store.get_row::<Habit>(&"H2".to_string()).unwrap();
    assert_eq!(row.sync_status, SyncStatus::Error);
    assert!(row.error_message.is_some());

    assert_eq!(queue.retry_failed().unwrap(), 1);
    assert_eq!(queue.get_pending().len(), 1);
}

#[tokio::test]
async fn second_sync_is_idempotent() {
    let h = Harness::new();
    let date = today();
    h.remote.seed_habit(remote_habit("R1", "Walk"));
    h.remote.seed_completion(Completion::new("R1", date, at(date, 7)));
    h.remote.seed_steps(StepRecord::new(USER, date, 5000, 4.0, 200.0));
    h.remote.seed_badge(Badge {
        id: "b1".into(),
        name: "First Step".into(),
        description: "Log a habit".into(),
        icon: None,
        requirement: 1,
    });
    h.remote.seed_user_badge(UserBadge {
        id: "ub1".into(),
        user_id: USER.into(),
        badge_id: "b1".into(),
        earned_at: Utc::now(),
    });
    h.remote.seed_user_badge(UserBadge {
        id: "ub2".into(),
        user_id: "someone-else".into(),
        badge_id: "b1".into(),
        earned_at: Utc::now(),
    });

    h.create_habit("L1", "Meditate");
    h.complete("L1", date, at(date, 8));
    h.store
        .transaction(|txn| {
            let record = StepRecord::new(USER, date - chrono::Days::new(1), 3000, 2.0, 100.0);
            txn.create(record.clone())?;
            txn.enqueue(QueuedMutation::LogSteps(record));
            Ok(())
        })
        .unwrap();

    let first = h.sync.sync().await;
    assert!(first.success, "{first:?}");
    assert_eq!(h.store.list::<UserBadge>().len(), 1);
    assert_eq!(h.store.list::<Badge>().len(), 1);

    let habits = h.store.rows::<Habit>();
    let completions = h.store.rows::<Completion>();
    let steps = h.store.rows::<StepRecord>();
    let badges = h.store.rows::<Badge>();
    let user_badges = h.store.rows::<UserBadge>();
    h.remote.reset_calls();

    let second = h.sync.sync().await;
    assert!(second.success, "{second:?}");
    assert_eq!(h.remote.mutating_calls(), 0);
    assert_eq!(second.counts.pushed, 0);
    assert_eq!(second.counts.pulled, 0);
    assert_eq!(h.store.rows::<Habit>(), habits);
    assert_eq!(h.store.rows::<Completion>(), completions);
    assert_eq!(h.store.rows::<StepRecord>(), steps);
    assert_eq!(h.store.rows::<Badge>(), badges);
    assert_eq!(h.store.rows::<UserBadge>(), user_badges);
}

#[tokio::test]
async fn pending_habit_is_not_clobbered_by_pull() {
    let h = Harness::new();
    h.remote.seed_habit(remote_habit("H1", "Original"));
    assert!(h.sync.sync().await.success);

    let mut local = h.store.get::<Habit>(&"H1".to_string()).unwrap();
    local.name = "Local edit".into();
    local.touch(Utc::now());
    h.store.update(local).unwrap();

    let mut newer = remote_habit("H1", "Remote edit");
    newer.updated_at = Utc::now() + chrono::Duration::hours(1);
    h.remote.seed_habit(newer);
    h.remote
        .fail_next(RemoteMethod::UpdateHabit, RemoteError::server(500, "boom"));

    let report = h.sync.sync().await;
    assert!(!report.success);
    assert_eq!(report.counts.push_failed, 1);

    let row = h.store.get_row::<Habit>(&"H1".to_string()).unwrap();
    assert_eq!(row.data.name, "Local edit");
    assert_eq!(row.sync_status, SyncStatus::Error);
}

#[tokio::test]
async fn newer_remote_habit_replaces_synced_row() {
    let h = Harness::new();
    h.remote.seed_habit(remote_habit("H1", "Original"));
    assert!(h.sync.sync().await.success);

    let mut newer = remote_habit("H1", "Renamed elsewhere");
    newer.updated_at = Utc::now() + chrono::Duration::hours(1);
    h.remote.seed_habit(newer);

    assert!(h.sync.sync().await.success);
    let row = h.store.get_row::<Habit>(&"H1".to_string()).unwrap();
    assert_eq!(row.data.name, "Renamed elsewhere");
    assert_eq!(row.sync_status, SyncStatus::Synced);
}

#[tokio::test]
async fn habit_deleted_elsewhere_is_removed_with_its_completions() {
    let h = Harness::new();
    let date = today();
    h.remote.seed_habit(remote_habit("H1", "Run"));
    h.remote.seed_completion(Completion::new("H1", date, at(date, 6)));
    assert!(h.sync.sync().await.success);
    assert!(h.completion_row("H1", date).is_some());

    h.remote.remove_habit("H1");
    let report = h.sync.sync().await;
    assert!(report.success, "{report:?}");
    assert_eq!(report.counts.removed, 1);
    assert!(h.store.get_row::<Habit>(&"H1".to_string()).is_none());
    assert!(h.completion_row("H1", date).is_none());
}

#[tokio::test]
async fn unpushed_completion_survives_remote_habit_removal() {
    let h = Harness::new();
    let date = today();
    h.remote.seed_habit(remote_habit("H1", "Stretch"));
    assert!(h.sync.sync().await.success);

    h.store.create(Completion::new("H1", date, at(date, 7))).unwrap();
    h.remote.remove_habit("H1");

    let report = h.sync.sync().await;
    assert!(!report.success);
    assert_eq!(report.counts.removed, 1);
    assert!(h.store.get_row::<Habit>(&"H1".to_string()).is_none());

    let row = h.completion_row("H1", date).unwrap();
    assert_eq!(row.sync_status, SyncStatus::Error);
    assert!(row.error_message.as_deref().unwrap().contains("no longer exists"));

    let report = h.sync.sync().await;
    assert!(report.success, "{report:?}");
    assert_eq!(report.counts.deferred, 0);
    assert_eq!(h.completion_row("H1", date).unwrap().sync_status, SyncStatus::Error);
}

#[tokio::test]
async fn local_delete_reaches_remote() {
    let h = Harness::new();
    let date = today();
    h.remote.seed_habit(remote_habit("H1", "Run"));
    h.remote.seed_completion(Completion::new("H1", date, at(date, 6)));
    assert!(h.sync.sync().await.success);

    h.store.delete::<Habit>(&"H1".to_string()).unwrap();
    let tombstone = h.store.get_row::<Habit>(&"H1".to_string()).unwrap();
    assert!(tombstone.deleted);

    let report = h.sync.sync().await;
    assert!(report.success, "{report:?}");
    assert!(h.remote.habits().is_empty());
    assert!(h.remote.completions().is_empty());
    assert!(h.store.get_row::<Habit>(&"H1".to_string()).is_none());
    assert!(h.completion_row("H1", date).is_none());
}

#[tokio::test]
async fn completion_waits_for_its_habit() {
    let h = Harness::new();
    let date = today();
    h.store.create(remote_habit("H1", "Read")).unwrap();
    h.store.create(Completion::new("H1", date, at(date, 9))).unwrap();
    h.remote
        .fail_next(RemoteMethod::CreateHabit, RemoteError::server(503, "busy"));

    let report = h.sync.sync().await;
    assert!(!report.success);
    assert_eq!(report.counts.deferred, 1);
    assert_eq!(h.remote.calls(RemoteMethod::CreateCompletion), 0);
    assert_eq!(h.completion_row("H1", date).unwrap().sync_status, SyncStatus::Pending);

    let report = h.sync.sync().await;
    assert!(report.success, "{report:?}");
    assert_eq!(h.completion_row("H1", date).unwrap().sync_status, SyncStatus::Synced);
    assert_eq!(h.remote.completions().len(), 1);
}

#[tokio::test]
async fn concurrent_syncs_share_one_pass() {
    let h = Harness::new();
    assert!(h.sync.sync().await.success);
    h.remote.reset_calls();
    h.remote.set_latency(Some(Duration::from_millis(20)));

    let other = h.sync.clone();
    let (a, b) = tokio::join!(h.sync.sync(), other.sync());

    assert_eq!(a, b);
    assert_eq!(h.remote.calls(RemoteMethod::ListHabits), 1);
    assert_eq!(h.sync.state(), SyncState::Idle);
    assert_eq!(h.sync.last_report(), Some(a));
}

#[tokio::test]
async fn abandoned_sync_still_finishes_its_pass() {
    let h = Harness::new();
    h.remote.set_latency(Some(Duration::from_millis(20)));

    let abandoned = tokio::time::timeout(Duration::from_millis(5), h.sync.sync()).await;
    assert!(abandoned.is_err());
    assert_eq!(h.sync.state(), SyncState::Syncing);

    assert!(eventually(|| h.sync.state() == SyncState::Idle).await);
    let report = h.sync.last_report().unwrap();
    assert!(report.success, "{report:?}");
}

#[tokio::test]
async fn unreachable_remote_stops_the_pass_without_spending_retries() {
    let h = Harness::new();
    assert!(h.sync.sync().await.success);
    h.create_habit("H1", "Read");
    h.remote.set_online(false);

    let report = h.sync.sync().await;
    assert!(!report.success);
    assert!(report.is_offline());
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].phase, SyncPhase::Push);

    let row = h.store.get_row::<Habit>(&"H1".to_string()).unwrap();
    assert_eq!(row.sync_status, SyncStatus::Pending);
    let items = h.store.queue().items();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].retry_count, 0);
}

#[tokio::test]
async fn timeouts_fail_phases_not_the_pass() {
    let config = SyncConfig::new(USER).with_request_timeout(Duration::from_millis(20));
    let h = Harness::with(LocalStore::open_in_memory().unwrap(), config);
    h.create_habit("H1", "Read");
    h.remote.set_latency(Some(Duration::from_millis(200)));

    let report = h.sync.sync().await;
    assert!(!report.success);
    assert!(!report.is_offline());
    let phases: Vec<SyncPhase> = report.failures.iter().map(|f| f.phase).collect();
    assert_eq!(phases, vec![SyncPhase::Import, SyncPhase::Push, SyncPhase::Pull, SyncPhase::Drain]);
    assert!(h.store.get_meta(meta::INITIAL_IMPORT_COMPLETE).is_none());
    assert_eq!(h.store.queue().items()[0].retry_count, 0);
}

#[tokio::test]
async fn local_write_failure_keeps_rows_pending() {
    let (backend, switch) = FaultyBackend::new(InMemoryBackend::new());
    let store = LocalStore::open_with_backend(
        Box::new(backend),
        StoreConfig::default().sync_on_commit(false),
    )
    .unwrap();
    let h = Harness::with(store, SyncConfig::new(USER));
    assert!(h.sync.sync().await.success);
    h.create_habit("H1", "Read");

    switch.fail_writes();
    let report = h.sync.sync().await;
    assert!(!report.success);
    assert!(!report.is_offline());
    assert!(report.failures.iter().any(|f| f.phase == SyncPhase::Push));
    assert_eq!(
        h.store.get_row::<Habit>(&"H1".to_string()).unwrap().sync_status,
        SyncStatus::Pending
    );

    // The remote already holds the habit; the create falls back to an update.
    switch.heal();
    let report = h.sync.sync().await;
    assert!(report.success, "{report:?}");
    assert_eq!(
        h.store.get_row::<Habit>(&"H1".to_string()).unwrap().sync_status,
        SyncStatus::Synced
    );
    assert_eq!(h.remote.habits().len(), 1);
}

#[tokio::test]
async fn background_sync_runs_on_trigger_and_reconnection() {
    let h = Harness::new();
    let background = BackgroundSync::spawn(h.sync.clone(), None);

    assert!(background.trigger());
    let sync = h.sync.clone();
    assert!(eventually(|| sync.last_report().is_some()).await);

    let remote = Arc::clone(&h.remote);
    let before = remote.calls(RemoteMethod::ListBadges);
    h.network.set_connected(false);
    h.network.set_connected(true);
    assert!(eventually(|| remote.calls(RemoteMethod::ListBadges) > before).await);

    background.shutdown().await;
    assert_eq!(h.network.listener_count(), 0);
}

#[tokio::test]
async fn background_sync_runs_on_interval() {
    let h = Harness::new();
    let background = BackgroundSync::spawn(h.sync.clone(), Some(Duration::from_millis(20)));

    let remote = Arc::clone(&h.remote);
    assert!(eventually(|| remote.calls(RemoteMethod::ListBadges) >= 3).await);

    background.shutdown().await;
    let settled = remote.total_calls();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(remote.total_calls(), settled);
}
