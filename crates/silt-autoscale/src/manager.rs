//! The auto-scale cycle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use silt_dataplane::{DataPlaneHub, ReduceCapacityBroker, ReduceCapacityRequest};
use silt_launch::WorkerLauncher;
use silt_state::{BrokerDelta, Snapshot};
use silt_supervisor::Supervisor;

/// Owns the virtual memory budget and drives scaling decisions.
pub struct CapacityManager {
    snapshot: Snapshot,
    launcher: Arc<WorkerLauncher>,
    hub: DataPlaneHub,
    supervisor: Arc<dyn Supervisor>,
    /// Global admission budget (bytes).
    virtual_memory_pool_size: u64,
    /// Serializes cycles: a new one is a no-op while one is active.
    cycle: Mutex<()>,
}

impl CapacityManager {
    pub fn new(
        snapshot: Snapshot,
        launcher: Arc<WorkerLauncher>,
        hub: DataPlaneHub,
        supervisor: Arc<dyn Supervisor>,
        virtual_memory_pool_size: u64,
    ) -> Self {
        Self {
            snapshot,
            launcher,
            hub,
            supervisor,
            virtual_memory_pool_size,
            cycle: Mutex::new(()),
        }
    }

    /// Run one auto-scale cycle: evaluate all brokers, expand within the
    /// budget, then shrink through the data-plane handshake. Expansion
    /// completes before shrink begins, so shrink reads post-expansion
    /// counts.
    pub async fn auto_scale(&self) {
        let Ok(_cycle) = self.cycle.try_lock() else {
            debug!("auto-scale cycle already active, skipping");
            return;
        };

        let deltas = self.snapshot.evaluate_all(false).await;
        let expansions: Vec<BrokerDelta> =
            deltas.iter().filter(|d| d.delta > 0).cloned().collect();
        let shrinks: Vec<BrokerDelta> =
            deltas.into_iter().filter(|d| d.delta < 0).collect();

        self.expand(expansions).await;
        self.shrink(shrinks).await;
    }

    /// Launch the positive deltas, clamping each to what the remaining
    /// budget affords. A failed batch is logged; the cycle moves on so
    /// other brokers still progress.
    async fn expand(&self, deltas: Vec<BrokerDelta>) {
        if deltas.is_empty() {
            return;
        }

        let mut used = self.snapshot.virtual_memory_used().await;
        for delta in deltas {
            let mut count = delta.delta as u64;
            if delta.memory_limit > 0 {
                let affordable =
                    self.virtual_memory_pool_size.saturating_sub(used) / delta.memory_limit;
                if count > affordable {
                    warn!(
                        function = %delta.key,
                        want = count,
                        affordable,
                        "expansion clamped by virtual memory budget"
                    );
                    count = affordable;
                }
            }
            if count == 0 {
                continue;
            }
            used += count * delta.memory_limit;

            match self
                .launcher
                .try_batch_launch(
                    &delta.key.function_name,
                    count as usize,
                    delta.key.is_inspector,
                )
                .await
            {
                Ok(names) => {
                    info!(
                        function = %delta.key,
                        launched = names.len(),
                        "expansion complete"
                    );
                }
                Err(e) => {
                    warn!(function = %delta.key, error = %e, "expansion batch failed");
                }
            }
        }
    }

    /// Offer shrink victims to the data plane and stop what it confirms.
    /// Victims are PendingStop from the draw onward, so they take no new
    /// dispatches either way.
    async fn shrink(&self, deltas: Vec<BrokerDelta>) {
        let mut brokers = Vec::new();
        for delta in deltas {
            let victims = self
                .snapshot
                .shrink_draw(&delta.key, (-delta.delta) as usize)
                .await;
            if victims.is_empty() {
                continue;
            }
            debug!(function = %delta.key, victims = victims.len(), "shrink victims drawn");
            brokers.push(ReduceCapacityBroker {
                function_name: delta.key.function_name.clone(),
                is_inspector: delta.key.is_inspector,
                workers: victims,
            });
        }
        if brokers.is_empty() {
            return;
        }

        let response = self
            .hub
            .reduce_capacity(&ReduceCapacityRequest { brokers })
            .await;
        for worker in response.confirmed_workers() {
            self.stop_worker(&worker.name).await;
        }
    }

    /// Stop one worker's sandbox; idempotent, and failures are only
    /// warned about since the worker is already being discarded.
    pub async fn stop_worker(&self, name: &str) {
        match self.supervisor.stop(name).await {
            Ok(()) => debug!(worker = %name, "worker stop issued"),
            Err(e) => warn!(worker = %name, error = %e, "failed to stop worker"),
        }
    }

    /// Periodic auto-scale loop.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = interval.as_millis() as u64, "capacity manager started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.auto_scale().await;
                }
                _ = shutdown.changed() => {
                    info!("capacity manager shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use silt_core::WorkerDefaults;
    use silt_dataplane::MockDataPlane;
    use silt_launch::{LauncherOptions, LocalCodeManager};
    use silt_state::{
        ApplyMode, BrokerKey, BrokerStats, ContainerReportEvent, ContainerStatusReport,
        ContainerStatus, EventBus, FunctionProfile, ProfileRegistry, WorkerMetadata,
        WorkerStats, WorkerStatsReport,
    };
    use silt_supervisor::mock::MockSupervisor;
    use silt_supervisor::{TurfProcess, TurfState};

    const MIB: u64 = 1024 * 1024;

    fn test_profile(name: &str, memory_bytes: u64) -> FunctionProfile {
        serde_json::from_value(serde_json::json!({
            "name": name,
            "runtime": "aworker",
            "url": format!("file:///srv/{name}.zip"),
            "signature": "sig",
            "source_file": "index.js",
            "resource_limit": { "memory_bytes": memory_bytes, "cpu_fraction": 1.0 },
            "worker": {
                "max_activate_requests": 10,
                "replica_count_limit": 10,
                "initialization_timeout_ms": 5000u64,
            },
        }))
        .unwrap()
    }

    struct Harness {
        manager: Arc<CapacityManager>,
        snapshot: Snapshot,
        registry: ProfileRegistry,
        supervisor: Arc<MockSupervisor>,
        plane: Arc<MockDataPlane>,
        _dirs: (tempfile::TempDir, tempfile::TempDir),
    }

    async fn harness(pool_size: u64, profiles: Vec<FunctionProfile>) -> Harness {
        let registry = ProfileRegistry::new(WorkerDefaults::default());
        registry.set(profiles, ApplyMode::Immediately).await.unwrap();

        let supervisor = Arc::new(MockSupervisor::new());
        let snapshot = Snapshot::new(
            registry.clone(),
            supervisor.clone() as Arc<dyn Supervisor>,
            EventBus::new(),
        );

        let bundles = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        let launcher = Arc::new(WorkerLauncher::new(
            snapshot.clone(),
            supervisor.clone() as Arc<dyn Supervisor>,
            Arc::new(LocalCodeManager::new(bundles.path().to_path_buf())),
            LauncherOptions {
                virtual_memory_pool_size: pool_size,
                expand_concurrency: 4,
                expand_interval: Duration::from_millis(1),
                logs_dir: logs.path().to_path_buf(),
                seed: None,
            },
        ));

        let hub = DataPlaneHub::new();
        let plane = Arc::new(MockDataPlane::new());
        hub.add_client(plane.clone());

        let manager = Arc::new(CapacityManager::new(
            snapshot.clone(),
            launcher,
            hub,
            supervisor.clone() as Arc<dyn Supervisor>,
            pool_size,
        ));

        Harness {
            manager,
            snapshot,
            registry,
            supervisor,
            plane,
            _dirs: (bundles, logs),
        }
    }

    /// Register a Ready worker and feed its stats through sync.
    async fn add_ready_worker(h: &Harness, function: &str, name: &str, credential: &str) {
        h.snapshot
            .register(&WorkerMetadata {
                function_name: function.to_string(),
                is_inspector: false,
                name: name.to_string(),
                credential: credential.to_string(),
            })
            .await
            .unwrap();
        h.snapshot
            .apply_status_report(&ContainerStatusReport {
                function_name: function.to_string(),
                name: name.to_string(),
                is_inspector: false,
                event: ContainerReportEvent::ContainerInstalled,
                request_id: None,
            })
            .await;
    }

    async fn sync_stats(h: &Harness, function: &str, entries: &[(&str, u32)]) {
        h.snapshot
            .sync(&WorkerStatsReport {
                brokers: vec![BrokerStats {
                    function_name: function.to_string(),
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
            })
            .await;
    }

    /// Emulate the data plane installing every Created worker.
    fn install_workers(snapshot: Snapshot) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(5)).await;
                for key in snapshot.broker_keys().await {
                    let created: Vec<String> = snapshot
                        .with_broker(&key, |b| {
                            b.workers()
                                .filter(|w| w.is_initializing())
                                .map(|w| w.name().to_string())
                                .collect()
                        })
                        .await
                        .unwrap_or_default();
                    for name in created {
                        snapshot
                            .apply_status_report(&ContainerStatusReport {
                                function_name: key.function_name.clone(),
                                name,
                                is_inspector: key.is_inspector,
                                event: ContainerReportEvent::ContainerInstalled,
                                request_id: None,
                            })
                            .await;
                    }
                }
            }
        })
    }

    #[tokio::test]
    async fn expands_under_load() {
        // Two saturated workers, pool wide enough for everything the
        // policy wants: three launches.
        let h = harness(6 * 512 * MIB, vec![test_profile("func", 512 * MIB)]).await;
        let installer = install_workers(h.snapshot.clone());

        add_ready_worker(&h, "func", "w-0", "c0").await;
        add_ready_worker(&h, "func", "w-1", "c1").await;
        sync_stats(&h, "func", &[("w-0", 10), ("w-1", 10)]).await;

        h.manager.auto_scale().await;

        assert_eq!(h.supervisor.calls_for("create").len(), 3);
        let key = BrokerKey::new("func", false);
        let worker_count = h
            .snapshot
            .with_broker(&key, |b| b.worker_count())
            .await
            .unwrap();
        assert_eq!(worker_count, 5);

        installer.abort();
    }

    #[tokio::test]
    async fn expansion_clamped_by_budget() {
        // Same load, but the pool only affords one more worker: the batch
        // is clamped to one launch, not three.
        let h = harness(3 * 512 * MIB, vec![test_profile("func", 512 * MIB)]).await;
        let installer = install_workers(h.snapshot.clone());

        add_ready_worker(&h, "func", "w-0", "c0").await;
        add_ready_worker(&h, "func", "w-1", "c1").await;
        sync_stats(&h, "func", &[("w-0", 10), ("w-1", 10)]).await;

        h.manager.auto_scale().await;

        assert_eq!(h.supervisor.calls_for("create").len(), 1);

        installer.abort();
    }

    #[tokio::test]
    async fn shrinks_after_hysteresis() {
        let h = harness(6 * 512 * MIB, vec![test_profile("func", 512 * MIB)]).await;

        add_ready_worker(&h, "func", "hello", "world").await;
        add_ready_worker(&h, "func", "foo", "bar").await;
        sync_stats(&h, "func", &[("hello", 1), ("foo", 1)]).await;

        // 59 idle cycles arm the hysteresis; nothing is stopped yet.
        for _ in 0..59 {
            h.manager.auto_scale().await;
        }
        assert!(h.supervisor.calls_for("stop").is_empty());

        // The 60th fires: one victim, tie broken by credential.
        h.manager.auto_scale().await;
        assert_eq!(h.supervisor.calls_for("stop"), vec!["stop foo"]);

        let key = BrokerKey::new("func", false);
        assert_eq!(
            h.snapshot.worker_status(&key, "foo").await,
            Some(ContainerStatus::PendingStop)
        );
        assert_eq!(
            h.snapshot.worker_status(&key, "hello").await,
            Some(ContainerStatus::Ready)
        );
        assert_eq!(h.plane.reduce_requests().len(), 1);
    }

    #[tokio::test]
    async fn unconfirmed_victims_are_not_stopped() {
        let h = harness(6 * 512 * MIB, vec![test_profile("func", 512 * MIB)]).await;
        h.plane.refuse_worker("foo");

        add_ready_worker(&h, "func", "hello", "world").await;
        add_ready_worker(&h, "func", "foo", "bar").await;
        sync_stats(&h, "func", &[("hello", 1), ("foo", 1)]).await;

        for _ in 0..60 {
            h.manager.auto_scale().await;
        }
        // foo was drawn (LCC tiebreak) but the data plane refused it.
        assert!(h.supervisor.calls_for("stop").is_empty());
    }

    #[tokio::test]
    async fn withdrawn_profile_drains_all_workers() {
        let h = harness(6 * 512 * MIB, vec![test_profile("func", 512 * MIB)]).await;

        add_ready_worker(&h, "func", "w-0", "c0").await;
        add_ready_worker(&h, "func", "w-1", "c1").await;
        sync_stats(&h, "func", &[("w-0", 1), ("w-1", 1)]).await;

        // Withdraw the profile, then refresh broker state.
        h.registry.set(vec![], ApplyMode::Immediately).await.unwrap();
        sync_stats(&h, "func", &[("w-0", 1), ("w-1", 1)]).await;

        h.manager.auto_scale().await;
        assert_eq!(h.supervisor.calls_for("stop").len(), 2);

        // The reconcile pass afterwards reaps the stopped sandboxes and
        // the now-empty, profile-less broker disappears.
        h.snapshot
            .switch_to_all(&[
                TurfProcess {
                    name: "w-0".to_string(),
                    pid: 1,
                    status: TurfState::Stopped,
                },
                TurfProcess {
                    name: "w-1".to_string(),
                    pid: 2,
                    status: TurfState::Stopped,
                },
            ])
            .await;
        h.snapshot.correct().await;
        assert_eq!(h.snapshot.broker_count().await, 0);
    }

    #[tokio::test]
    async fn launch_failures_do_not_abort_the_cycle() {
        let h = harness(
            12 * 512 * MIB,
            vec![test_profile("alpha", 512 * MIB), test_profile("beta", 512 * MIB)],
        )
        .await;
        let installer = install_workers(h.snapshot.clone());

        add_ready_worker(&h, "alpha", "a-0", "c0").await;
        add_ready_worker(&h, "beta", "b-0", "c1").await;
        h.snapshot
            .sync(&WorkerStatsReport {
                brokers: vec![
                    BrokerStats {
                        function_name: "alpha".to_string(),
                        is_inspector: false,
                        workers: vec![WorkerStats {
                            name: "a-0".to_string(),
                            active_request_count: 10,
                            max_activate_requests: 10,
                        }],
                    },
                    BrokerStats {
                        function_name: "beta".to_string(),
                        is_inspector: false,
                        workers: vec![WorkerStats {
                            name: "b-0".to_string(),
                            active_request_count: 10,
                            max_activate_requests: 10,
                        }],
                    },
                ],
            })
            .await;

        // Every create for alpha fails; beta must still expand.
        h.supervisor.fail_next("create", -22, 2);

        h.manager.auto_scale().await;

        // alpha comes first in the deterministic cycle order and eats the
        // injected failures; beta's creates then succeed.
        let creates = h.supervisor.calls_for("create");
        assert!(creates.iter().any(|c| c.contains("beta-")));

        installer.abort();
    }
}
