//! End-to-end event-loop behavior against the in-memory cluster.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use podstamp::api::WatchError;
use podstamp::mock::MockCluster;
use podstamp::object::{EventPayload, WatchEvent};
use podstamp::reconcile::AppliedRecord;
use podstamp::{Controller, Notifier, Role, Settings, StartupPolicy};

const SCOPE_MARKER: &str = "podstamp.io/managed";
const RESOURCE_MARKER: &str = "podstamp.io/stamp";
const PROCESSED_MARKER: &str = "podstamp.io/processed-at";

#[derive(Clone, Default)]
struct Recorder {
    records: Arc<Mutex<Vec<AppliedRecord>>>,
}

impl Recorder {
    fn records(&self) -> Vec<AppliedRecord> {
        self.records.lock().unwrap().clone()
    }
}

impl Notifier for Recorder {
    fn applied(&self, record: &AppliedRecord) {
        self.records.lock().unwrap().push(record.clone());
    }
}

fn settings(policy: StartupPolicy) -> Settings {
    Settings {
        scope_marker: SCOPE_MARKER.into(),
        resource_marker: RESOURCE_MARKER.into(),
        processed_marker: PROCESSED_MARKER.into(),
        startup_policy: policy,
    }
    .validate()
    .unwrap()
}

fn opt_in() -> Option<BTreeMap<String, String>> {
    Some([(RESOURCE_MARKER.to_string(), "true".to_string())].into())
}

fn managed_scope() -> Option<BTreeMap<String, String>> {
    Some([(SCOPE_MARKER.to_string(), "true".to_string())].into())
}

struct Harness {
    cluster: Arc<MockCluster>,
    recorder: Recorder,
    role_tx: watch::Sender<Role>,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl Harness {
    fn start(policy: StartupPolicy) -> Self {
        let cluster = Arc::new(MockCluster::new());
        let recorder = Recorder::default();
        let (role_tx, role_rx) = watch::channel(Role::Leader);
        let cancel = CancellationToken::new();
        let controller = Controller::new(cluster.clone(), settings(policy), recorder.clone());
        let task = tokio::spawn(controller.run(role_rx, cancel.clone()));
        Self {
            cluster,
            recorder,
            role_tx,
            cancel,
            task,
        }
    }

    /// Waits until at least `n` watch subscriptions have been opened.
    async fn wait_watch_opens(&self, n: u64) {
        for _ in 0..1000 {
            if self.cluster.watch_opens() >= n {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("watch was not opened {n} times");
    }

    /// Lets queued events drain through the loop.
    async fn settle(&self) {
        sleep(Duration::from_secs(1)).await;
    }

    async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn eligible_workload_is_stamped_and_reported_once() {
    let h = Harness::start(StartupPolicy::SkipExisting);
    h.cluster.put_scope("team-a", managed_scope());
    h.wait_watch_opens(1).await;

    h.cluster.create_workload("team-a", "web-0", opt_in());
    h.settle().await;

    let stored = h.cluster.workload("team-a", "web-0").unwrap();
    let stamp = stored.annotation(PROCESSED_MARKER).expect("marker written");
    assert!(stamp.ends_with('Z'));

    let records = h.recorder.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].name, "web-0");
    assert_eq!(records[0].namespace, "team-a");
    assert_eq!(records[0].applied_at, stamp);

    h.stop().await;
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn unmanaged_scope_means_no_write_and_no_record() {
    let h = Harness::start(StartupPolicy::SkipExisting);
    h.cluster.put_scope("team-b", None);
    h.wait_watch_opens(1).await;

    h.cluster.create_workload("team-b", "web-0", opt_in());
    h.settle().await;

    let stored = h.cluster.workload("team-b", "web-0").unwrap();
    assert!(stored.annotation(PROCESSED_MARKER).is_none());
    assert!(h.recorder.records().is_empty());

    h.stop().await;
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn workload_without_opt_in_is_skipped() {
    let h = Harness::start(StartupPolicy::SkipExisting);
    h.cluster.put_scope("team-a", managed_scope());
    h.wait_watch_opens(1).await;

    h.cluster.create_workload("team-a", "quiet-0", None);
    h.settle().await;

    let stored = h.cluster.workload("team-a", "quiet-0").unwrap();
    assert!(stored.annotations.is_none());
    assert!(h.recorder.records().is_empty());

    h.stop().await;
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn missing_scope_is_a_skip_not_a_fault() {
    let h = Harness::start(StartupPolicy::SkipExisting);
    h.wait_watch_opens(1).await;

    h.cluster.create_workload("nowhere", "web-0", opt_in());
    h.settle().await;

    assert!(h.recorder.records().is_empty());
    h.stop().await;
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn unrecognized_payloads_and_lifecycle_events_are_ignored() {
    let h = Harness::start(StartupPolicy::SkipExisting);
    h.cluster.put_scope("team-a", managed_scope());
    h.wait_watch_opens(1).await;

    h.cluster.push_raw(Ok(WatchEvent::Added(EventPayload::Unrecognized {
        kind: "ConfigMap".into(),
    })));
    let eligible = h.cluster.create_workload("team-a", "web-0", opt_in());
    h.settle().await;
    // Replaying the workload as Modified/Deleted must not trigger
    // another write.
    let baseline = h.recorder.records().len();
    assert_eq!(baseline, 1);
    h.cluster.push_raw(Ok(WatchEvent::Modified(EventPayload::Workload(Box::new(
        eligible.clone(),
    )))));
    h.cluster.push_raw(Ok(WatchEvent::Deleted(EventPayload::Workload(Box::new(
        eligible,
    )))));
    h.settle().await;

    assert_eq!(h.recorder.records().len(), baseline);
    h.stop().await;
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn desync_relists_and_resumes_under_process_existing() {
    let cluster = Arc::new(MockCluster::new());
    cluster.put_scope("team-a", managed_scope());
    cluster.create_workload("team-a", "pre-0", opt_in());

    let recorder = Recorder::default();
    let (_role_tx, role_rx) = watch::channel(Role::Leader);
    let cancel = CancellationToken::new();
    let controller = Controller::new(
        cluster.clone(),
        settings(StartupPolicy::ProcessExisting),
        recorder.clone(),
    );
    let task = tokio::spawn(controller.run(role_rx, cancel.clone()));

    // Startup relist admits the pre-existing workload.
    for _ in 0..1000 {
        if !recorder.records().is_empty() {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(recorder.records().len(), 1);
    assert_eq!(recorder.records()[0].name, "pre-0");
    let opens_before = cluster.watch_opens();

    // Lose the feed position entirely.
    cluster.push_raw(Err(WatchError::Desynced("expired".into())));
    for _ in 0..1000 {
        if cluster.watch_opens() > opens_before {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    sleep(Duration::from_secs(1)).await;

    // The relist re-admits pre-0 (harmless, idempotent) and the loop
    // keeps consuming fresh Added events afterwards.
    cluster.create_workload("team-a", "post-0", opt_in());
    sleep(Duration::from_secs(1)).await;

    let names: Vec<_> = recorder.records().iter().map(|r| r.name.clone()).collect();
    assert!(names.contains(&"post-0".to_string()));
    let stored = cluster.workload("team-a", "pre-0").unwrap();
    let map = stored.annotations.unwrap();
    assert_eq!(map.keys().filter(|k| k.as_str() == PROCESSED_MARKER).count(), 1);

    cancel.cancel();
    let _ = task.await;
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn demotion_halts_consumption_until_re_promoted() {
    let h = Harness::start(StartupPolicy::SkipExisting);
    h.cluster.put_scope("team-a", managed_scope());
    h.wait_watch_opens(1).await;

    h.role_tx.send_replace(Role::Follower);
    h.settle().await;

    // Created while following: must not be stamped by this instance.
    h.cluster.create_workload("team-a", "missed-0", opt_in());
    h.settle().await;
    assert!(h.recorder.records().is_empty());
    let stored = h.cluster.workload("team-a", "missed-0").unwrap();
    assert!(stored.annotation(PROCESSED_MARKER).is_none());

    // Re-promotion opens a fresh watch; future creations flow again.
    h.role_tx.send_replace(Role::Leader);
    h.wait_watch_opens(2).await;
    h.cluster.create_workload("team-a", "seen-0", opt_in());
    h.settle().await;

    let records = h.recorder.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].name, "seen-0");

    h.stop().await;
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn demotion_outranks_queued_events() {
    let h = Harness::start(StartupPolicy::SkipExisting);
    h.cluster.put_scope("team-a", managed_scope());
    h.wait_watch_opens(1).await;

    // Queue several eligible creations and then the demotion without
    // yielding to the loop in between, so the role change and the
    // buffered items become ready simultaneously.
    h.cluster.create_workload("team-a", "q-0", opt_in());
    h.cluster.create_workload("team-a", "q-1", opt_in());
    h.cluster.create_workload("team-a", "q-2", opt_in());
    h.role_tx.send_replace(Role::Follower);
    h.settle().await;

    assert!(h.recorder.records().is_empty());
    for name in ["q-0", "q-1", "q-2"] {
        let stored = h.cluster.workload("team-a", name).unwrap();
        assert!(stored.annotation(PROCESSED_MARKER).is_none());
    }

    h.stop().await;
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn reconcile_failure_does_not_stall_the_loop() {
    let h = Harness::start(StartupPolicy::SkipExisting);
    h.cluster.put_scope("team-a", managed_scope());
    h.wait_watch_opens(1).await;

    // Exactly the retry budget, so the first workload's write exhausts
    // its retries while the next workload's write goes through.
    h.cluster.conflict_next_updates(3);
    h.cluster.create_workload("team-a", "cursed-0", opt_in());
    h.settle().await;
    assert!(h.recorder.records().is_empty());

    h.cluster.create_workload("team-a", "fine-0", opt_in());
    h.settle().await;
    let records = h.recorder.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].name, "fine-0");

    h.stop().await;
}
