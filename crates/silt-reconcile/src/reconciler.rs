//! The reconcile tick and stopped-worker cleanup.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use silt_dataplane::DataPlaneHub;
use silt_state::{Snapshot, WorkerStoppedEvent};
use silt_supervisor::Supervisor;

/// Sandbox log directories are deleted this long after the worker stops.
const LOG_GC_DELAY: Duration = Duration::from_secs(5 * 60);

/// Drives the periodic reconciliation of supervisor state, data-plane
/// telemetry and the snapshot.
pub struct Reconciler {
    snapshot: Snapshot,
    supervisor: Arc<dyn Supervisor>,
    hub: DataPlaneHub,
    logs_dir: PathBuf,
    log_gc_delay: Duration,
}

impl Reconciler {
    pub fn new(
        snapshot: Snapshot,
        supervisor: Arc<dyn Supervisor>,
        hub: DataPlaneHub,
        logs_dir: PathBuf,
    ) -> Self {
        Self {
            snapshot,
            supervisor,
            hub,
            logs_dir,
            log_gc_delay: LOG_GC_DELAY,
        }
    }

    /// Shorten the log GC delay (for tests).
    pub fn with_log_gc_delay(mut self, delay: Duration) -> Self {
        self.log_gc_delay = delay;
        self
    }

    /// One reconcile pass:
    /// 1. fold the supervisor's `ps` table into every worker,
    /// 2. apply the latest data-plane stats broadcast,
    /// 3. reap stopped/lost workers (destroy + `workerStopped` events).
    pub async fn tick(&self) -> Vec<WorkerStoppedEvent> {
        match self.supervisor.ps().await {
            Ok(table) => self.snapshot.switch_to_all(&table).await,
            Err(e) => {
                // Skip the process-state fold this tick; stats and reap
                // still run.
                warn!(error = %e, "supervisor ps failed");
            }
        }

        self.snapshot.sync(&self.hub.latest_stats()).await;
        self.snapshot.correct().await
    }

    /// Periodic reconcile loop.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = interval.as_millis() as u64, "reconciler started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let reaped = self.tick().await;
                    if !reaped.is_empty() {
                        debug!(reaped = reaped.len(), "reconcile pass reaped workers");
                    }
                }
                _ = shutdown.changed() => {
                    info!("reconciler shutting down");
                    break;
                }
            }
        }
    }

    /// Apply container status reports from the data plane as they arrive,
    /// independent of the tick.
    pub fn spawn_report_listener(&self) -> JoinHandle<()> {
        let snapshot = self.snapshot.clone();
        let mut reports = self.hub.subscribe_reports();
        tokio::spawn(async move {
            loop {
                match reports.recv().await {
                    Ok(report) => snapshot.apply_status_report(&report).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "status report listener lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Schedule stopped workers' sandbox log directories for deletion.
    pub fn spawn_log_gc(&self) -> JoinHandle<()> {
        let logs_dir = self.logs_dir.clone();
        let delay = self.log_gc_delay;
        let mut stopped = self.snapshot.events().subscribe_worker_stopped();
        tokio::spawn(async move {
            loop {
                match stopped.recv().await {
                    Ok(event) => {
                        let dir = logs_dir.join(&event.worker_name);
                        debug!(dir = %dir.display(), "log directory scheduled for deletion");
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            match tokio::fs::remove_dir_all(&dir).await {
                                Ok(()) => debug!(dir = %dir.display(), "log directory removed"),
                                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                                Err(e) => {
                                    warn!(dir = %dir.display(), error = %e, "log directory removal failed");
                                }
                            }
                        });
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "log gc listener lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use silt_core::WorkerDefaults;
    use silt_state::{
        ApplyMode, BrokerKey, BrokerStats, ContainerReportEvent, ContainerStatusReport,
        ContainerStatus, EventBus, FunctionProfile, ProfileRegistry, WorkerMetadata,
        WorkerStats, WorkerStatsReport,
    };
    use silt_supervisor::mock::MockSupervisor;
    use silt_supervisor::{TurfProcess, TurfState};

    fn test_profile(name: &str) -> FunctionProfile {
        serde_json::from_value(serde_json::json!({
            "name": name,
            "runtime": "aworker",
            "url": format!("file:///srv/{name}.zip"),
            "signature": "sig",
            "worker": { "max_activate_requests": 10 },
        }))
        .unwrap()
    }

    struct Harness {
        reconciler: Reconciler,
        snapshot: Snapshot,
        supervisor: Arc<MockSupervisor>,
        hub: DataPlaneHub,
        logs: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        let registry = ProfileRegistry::new(WorkerDefaults::default());
        registry
            .set(vec![test_profile("func")], ApplyMode::Immediately)
            .await
            .unwrap();

        let supervisor = Arc::new(MockSupervisor::new());
        let snapshot = Snapshot::new(
            registry,
            supervisor.clone() as Arc<dyn Supervisor>,
            EventBus::new(),
        );
        let hub = DataPlaneHub::new();
        let logs = tempfile::tempdir().unwrap();

        let reconciler = Reconciler::new(
            snapshot.clone(),
            supervisor.clone() as Arc<dyn Supervisor>,
            hub.clone(),
            logs.path().to_path_buf(),
        )
        .with_log_gc_delay(Duration::from_millis(50));

        Harness {
            reconciler,
            snapshot,
            supervisor,
            hub,
            logs,
        }
    }

    async fn register(h: &Harness, name: &str, credential: &str) {
        h.snapshot
            .register(&WorkerMetadata {
                function_name: "func".to_string(),
                is_inspector: false,
                name: name.to_string(),
                credential: credential.to_string(),
            })
            .await
            .unwrap();
    }

    fn stats(entries: &[(&str, u32)]) -> WorkerStatsReport {
        WorkerStatsReport {
            brokers: vec![BrokerStats {
                function_name: "func".to_string(),
                is_inspector: false,
                workers: entries
                    .iter()
                    .map(|(name, active)| WorkerStats {
                        name: name.to_string(),
                        active_request_count: *active,
                        max_activate_requests: 10,
                    })
                    .collect(),
            }],
        }
    }

    #[tokio::test]
    async fn tick_reclaims_stopped_workers() {
        let h = harness().await;
        register(&h, "hello", "world").await;
        register(&h, "foo", "bar").await;

        h.supervisor.set_ps(vec![TurfProcess {
            name: "foo".to_string(),
            pid: 123,
            status: TurfState::Stopped,
        }]);
        h.hub.ingest_stats(stats(&[("foo", 6), ("hello", 1)]));

        let events = h.reconciler.tick().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].worker_name, "foo");
        assert_eq!(events[0].pid, Some(123));

        let key = BrokerKey::new("func", false);
        // hello saw no supervisor entry and is still within its init
        // window: untouched.
        assert_eq!(
            h.snapshot.worker_status(&key, "hello").await,
            Some(ContainerStatus::Created)
        );
        assert!(h.snapshot.worker_status(&key, "foo").await.is_none());
        assert_eq!(h.supervisor.calls_for("delete"), vec!["delete foo"]);
    }

    #[tokio::test]
    async fn tick_survives_supervisor_failure() {
        let h = harness().await;
        register(&h, "hello", "world").await;
        h.supervisor.fail_next("ps", -11, 1);

        // Stats and reap still run; nothing explodes.
        let events = h.reconciler.tick().await;
        assert!(events.is_empty());
        assert_eq!(h.snapshot.broker_count().await, 1);
    }

    #[tokio::test]
    async fn second_tick_is_quiet() {
        let h = harness().await;
        register(&h, "foo", "bar").await;
        h.supervisor.set_ps(vec![TurfProcess {
            name: "foo".to_string(),
            pid: 123,
            status: TurfState::Stopped,
        }]);

        assert_eq!(h.reconciler.tick().await.len(), 1);
        assert_eq!(h.reconciler.tick().await.len(), 0);
    }

    #[tokio::test]
    async fn report_listener_applies_fast_path() {
        let h = harness().await;
        register(&h, "hello", "world").await;
        let listener = h.reconciler.spawn_report_listener();

        h.hub.ingest_status_report(ContainerStatusReport {
            function_name: "func".to_string(),
            name: "hello".to_string(),
            is_inspector: false,
            event: ContainerReportEvent::ContainerInstalled,
            request_id: None,
        });

        let key = BrokerKey::new("func", false);
        // The listener applies the report without any tick.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            h.snapshot.worker_status(&key, "hello").await,
            Some(ContainerStatus::Ready)
        );
        listener.abort();
    }

    #[tokio::test]
    async fn stopped_worker_log_dir_is_garbage_collected() {
        let h = harness().await;
        register(&h, "foo", "bar").await;

        let dir = h.logs.path().join("foo");
        tokio::fs::create_dir_all(&dir).await.unwrap();

        let gc = h.reconciler.spawn_log_gc();
        h.supervisor.set_ps(vec![TurfProcess {
            name: "foo".to_string(),
            pid: 123,
            status: TurfState::Stopped,
        }]);
        h.reconciler.tick().await;

        // Still present right after the event, gone after the delay.
        assert!(dir.is_dir());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!dir.exists());
        gc.abort();
    }
}
