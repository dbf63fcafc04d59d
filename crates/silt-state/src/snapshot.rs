//! The collection of brokers — the control plane's single picture of the
//! world.
//!
//! `Snapshot` is a cloneable handle over shared interior state. All
//! mutation happens under one write lock with no await points held across
//! it; supervisor I/O and event publication run strictly after the lock is
//! released (snapshot-then-act).

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use silt_supervisor::{Supervisor, TurfProcess, TurfState};

use crate::broker::{Broker, StartingPoolItem, WorkerHandle};
use crate::error::{StateError, StateResult};
use crate::events::{EventBus, WorkerStoppedEvent};
use crate::registry::ProfileRegistry;
use crate::types::{
    BrokerKey, ContainerStatusReport, FunctionProfile, WorkerActivity, WorkerMetadata,
    WorkerStatsReport,
};
use crate::worker::{ContainerStatus, ReadyWaiter};

/// One broker's scaling verdict, annotated for capacity admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerDelta {
    pub key: BrokerKey,
    /// Positive: replicas to launch. Negative: replicas to drop.
    pub delta: i64,
    pub memory_limit: u64,
}

/// Shared handle to the broker map.
#[derive(Clone)]
pub struct Snapshot {
    brokers: Arc<RwLock<HashMap<BrokerKey, Broker>>>,
    registry: ProfileRegistry,
    supervisor: Arc<dyn Supervisor>,
    events: EventBus,
}

impl Snapshot {
    pub fn new(
        registry: ProfileRegistry,
        supervisor: Arc<dyn Supervisor>,
        events: EventBus,
    ) -> Self {
        Self {
            brokers: Arc::new(RwLock::new(HashMap::new())),
            registry,
            supervisor,
            events,
        }
    }

    pub fn registry(&self) -> &ProfileRegistry {
        &self.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Register a freshly launched worker with its broker, creating the
    /// broker lazily. Arms the init watchdog and returns the waiter that
    /// settles with the worker's readiness outcome.
    pub async fn register(&self, meta: &WorkerMetadata) -> StateResult<ReadyWaiter> {
        let Some(profile) = self.registry.get(&meta.function_name) else {
            return Err(StateError::NoFunction(meta.function_name.clone()));
        };

        let key = meta.broker_key();
        let mut brokers = self.brokers.write().await;

        // Worker names are globally unique, not just per broker.
        for broker in brokers.values() {
            if broker.worker(&meta.name).is_some() {
                return Err(StateError::DuplicateWorker(meta.name.clone()));
            }
        }

        let shrink_redundant_times = self.registry.defaults().shrink_redundant_times;
        let broker = brokers.entry(key.clone()).or_insert_with(|| {
            Broker::new(
                key.function_name.clone(),
                key.is_inspector,
                Some(profile.clone()),
                shrink_redundant_times,
            )
        });

        let waiter = broker.register(&meta.name, &meta.credential)?;

        // Init watchdog: the ready timer starts at registration and is
        // independent of reconcile ticks.
        let worker = broker
            .worker_mut(&meta.name)
            .expect("worker registered above");
        let deadline = tokio::time::Instant::from_std(worker.init_deadline());
        let watchdog = tokio::spawn({
            let snapshot = self.clone();
            let key = key.clone();
            let name = meta.name.clone();
            async move {
                tokio::time::sleep_until(deadline).await;
                snapshot.fail_initialization(&key, &name).await;
            }
        });
        worker.set_watchdog(watchdog);

        Ok(waiter)
    }

    /// Stop a worker that never became Ready within its deadline.
    async fn fail_initialization(&self, key: &BrokerKey, name: &str) {
        let mut brokers = self.brokers.write().await;
        if let Some(broker) = brokers.get_mut(key) {
            if let Some(worker) = broker.worker_mut(name) {
                if worker.is_initializing() {
                    worker.set_stopped("initialization timeout");
                }
            }
            broker.prune_starting_pool();
        }
    }

    /// Remove a worker immediately and destroy its sandbox. Used by the
    /// launch path when a worker fails before becoming Ready.
    pub async fn unregister(&self, key: &BrokerKey, name: &str) {
        let removed = {
            let mut brokers = self.brokers.write().await;
            brokers
                .get_mut(key)
                .and_then(|broker| broker.remove_worker(name))
        };
        if removed.is_some() {
            if let Err(e) = self.supervisor.destroy(name).await {
                warn!(worker = %name, error = %e, "failed to destroy sandbox");
            }
        }
    }

    /// Distribute a data-plane stats push across the brokers. Every broker
    /// refreshes its profile from the registry; brokers unknown to us are
    /// ignored.
    pub async fn sync(&self, report: &WorkerStatsReport) {
        let mut by_key: HashMap<BrokerKey, &[crate::types::WorkerStats]> = HashMap::new();
        for broker_stats in &report.brokers {
            by_key.insert(
                BrokerKey::new(broker_stats.function_name.clone(), broker_stats.is_inspector),
                &broker_stats.workers,
            );
        }

        let mut brokers = self.brokers.write().await;
        for (key, broker) in brokers.iter_mut() {
            let stats = by_key.get(key).copied().unwrap_or(&[]);
            broker.sync(stats, self.registry.get(&key.function_name));
        }
    }

    /// Fold a supervisor `ps` table into every worker's state machine.
    pub async fn switch_to_all(&self, processes: &[TurfProcess]) {
        let by_name: HashMap<&str, &TurfProcess> =
            processes.iter().map(|p| (p.name.as_str(), p)).collect();

        let mut brokers = self.brokers.write().await;
        for broker in brokers.values_mut() {
            let names: Vec<String> =
                broker.workers().map(|w| w.name().to_string()).collect();
            for name in names {
                if let Some(worker) = broker.worker_mut(&name) {
                    worker.switch_to(by_name.get(name.as_str()).copied());
                }
            }
            broker.prune_starting_pool();
        }
    }

    /// Event-driven fast path: apply a container status report as it
    /// arrives, independent of the reconcile tick.
    pub async fn apply_status_report(&self, report: &ContainerStatusReport) {
        let key = BrokerKey::new(report.function_name.clone(), report.is_inspector);
        let mut brokers = self.brokers.write().await;
        let Some(broker) = brokers.get_mut(&key) else {
            debug!(function = %key, worker = %report.name, "status report for unknown broker");
            return;
        };
        let Some(worker) = broker.worker_mut(&report.name) else {
            debug!(function = %key, worker = %report.name, "status report for unknown worker");
            return;
        };
        worker.apply_report(&report.event);
        broker.prune_starting_pool();
    }

    /// Reap workers that have reached Stopped or Unknown: remove them from
    /// their brokers, drop empty brokers whose profile is gone, then (lock
    /// released) destroy the sandboxes and publish `WorkerStoppedEvent`s.
    ///
    /// Idempotent: with no state change a second call emits nothing.
    pub async fn correct(&self) -> Vec<WorkerStoppedEvent> {
        let reaped = {
            let mut brokers = self.brokers.write().await;
            let mut reaped = Vec::new();

            for (key, broker) in brokers.iter_mut() {
                let dead: Vec<String> = broker
                    .workers()
                    .filter(|w| w.status() >= ContainerStatus::Stopped)
                    .map(|w| w.name().to_string())
                    .collect();
                for name in dead {
                    if let Some(worker) = broker.remove_worker(&name) {
                        reaped.push(WorkerStoppedEvent {
                            function_name: key.function_name.clone(),
                            is_inspector: key.is_inspector,
                            worker_name: worker.name().to_string(),
                            credential: worker.credential().to_string(),
                            pid: worker.pid(),
                            status: worker.status(),
                        });
                    }
                }
            }

            let registry = &self.registry;
            brokers.retain(|key, broker| {
                !broker.is_empty() || registry.contains(&key.function_name)
            });

            reaped
        };

        for event in &reaped {
            if let Err(e) = self.supervisor.destroy(&event.worker_name).await {
                warn!(worker = %event.worker_name, error = %e, "failed to destroy sandbox");
            }
            self.events.publish_worker_stopped(event.clone());
        }
        reaped
    }

    /// Memory pinned in the virtual pool by all live workers.
    pub async fn virtual_memory_used(&self) -> u64 {
        let brokers = self.brokers.read().await;
        brokers.values().map(|b| b.virtual_memory()).sum()
    }

    /// Run the water-level policy over every broker.
    pub async fn evaluate_all(&self, expansion_only: bool) -> Vec<BrokerDelta> {
        let mut brokers = self.brokers.write().await;
        let mut deltas: Vec<BrokerDelta> = brokers
            .iter_mut()
            .map(|(key, broker)| BrokerDelta {
                key: key.clone(),
                delta: broker.evaluate_water_level(expansion_only),
                memory_limit: broker.memory_limit(),
            })
            .collect();
        // Stable order for deterministic cycles.
        deltas.sort_by(|a, b| {
            (&a.key.function_name, a.key.is_inspector)
                .cmp(&(&b.key.function_name, b.key.is_inspector))
        });
        deltas
    }

    /// Draw shrink victims from one broker (marking them PendingStop).
    pub async fn shrink_draw(&self, key: &BrokerKey, n: usize) -> Vec<WorkerHandle> {
        let mut brokers = self.brokers.write().await;
        brokers
            .get_mut(key)
            .map(|broker| broker.shrink_draw(n))
            .unwrap_or_default()
    }

    /// Admit one request onto a warming worker of the given broker.
    pub async fn prerequest_starting_pool(&self, key: &BrokerKey) -> bool {
        let mut brokers = self.brokers.write().await;
        brokers
            .get_mut(key)
            .map(|broker| broker.prerequest_starting_pool())
            .unwrap_or(false)
    }

    pub async fn broker_count(&self) -> usize {
        self.brokers.read().await.len()
    }

    pub async fn broker_keys(&self) -> Vec<BrokerKey> {
        self.brokers.read().await.keys().cloned().collect()
    }

    /// Read one broker under the lock.
    pub async fn with_broker<R>(
        &self,
        key: &BrokerKey,
        f: impl FnOnce(&Broker) -> R,
    ) -> Option<R> {
        let brokers = self.brokers.read().await;
        brokers.get(key).map(f)
    }

    pub async fn worker_status(
        &self,
        key: &BrokerKey,
        name: &str,
    ) -> Option<ContainerStatus> {
        self.with_broker(key, |b| b.worker(name).map(|w| w.status()))
            .await
            .flatten()
    }

    /// Serialize the full snapshot for telemetry export.
    pub async fn stats(&self) -> SnapshotStats {
        let brokers = self.brokers.read().await;
        let mut out: Vec<BrokerSnapshot> = brokers
            .iter()
            .map(|(key, broker)| BrokerSnapshot {
                function_name: key.function_name.clone(),
                is_inspector: key.is_inspector,
                profile: broker.profile().map(|p| (**p).clone()),
                redundant_times: broker.redundant_times(),
                workers: broker
                    .workers()
                    .map(|w| WorkerSnapshot {
                        name: w.name().to_string(),
                        credential: w.credential().to_string(),
                        pid: w.pid(),
                        container_status: w.status(),
                        turf_state: w.turf_state(),
                        data: w.data(),
                        register_time_ms: w.register_time_ms(),
                        disposable: w.disposable(),
                    })
                    .collect(),
                starting_pool: broker.starting_pool().cloned().collect(),
            })
            .collect();
        out.sort_by(|a, b| {
            (&a.function_name, a.is_inspector).cmp(&(&b.function_name, b.is_inspector))
        });
        SnapshotStats { brokers: out }
    }
}

/// Serializable view of the full snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotStats {
    pub brokers: Vec<BrokerSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerSnapshot {
    pub function_name: String,
    pub is_inspector: bool,
    pub profile: Option<FunctionProfile>,
    pub redundant_times: u32,
    pub workers: Vec<WorkerSnapshot>,
    pub starting_pool: Vec<StartingPoolItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub name: String,
    pub credential: String,
    pub pid: Option<i32>,
    pub container_status: ContainerStatus,
    pub turf_state: Option<TurfState>,
    pub data: Option<WorkerActivity>,
    pub register_time_ms: u64,
    pub disposable: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ApplyMode;
    use crate::types::{BrokerStats, WorkerStats};
    use silt_core::WorkerDefaults;
    use silt_supervisor::mock::MockSupervisor;

    fn test_profile_json(name: &str, timeout_ms: u64) -> FunctionProfile {
        serde_json::from_value(serde_json::json!({
            "name": name,
            "runtime": "aworker",
            "url": format!("file:///srv/{name}.zip"),
            "signature": "sig",
            "worker": { "initialization_timeout_ms": timeout_ms },
        }))
        .unwrap()
    }

    async fn test_snapshot() -> (Snapshot, Arc<MockSupervisor>, ProfileRegistry) {
        let registry = ProfileRegistry::new(WorkerDefaults::default());
        registry
            .set(vec![test_profile_json("func", 10_000)], ApplyMode::Immediately)
            .await
            .unwrap();
        let supervisor = Arc::new(MockSupervisor::new());
        let snapshot = Snapshot::new(
            registry.clone(),
            supervisor.clone() as Arc<dyn Supervisor>,
            EventBus::new(),
        );
        (snapshot, supervisor, registry)
    }

    fn meta(name: &str, credential: &str) -> WorkerMetadata {
        WorkerMetadata {
            function_name: "func".to_string(),
            is_inspector: false,
            name: name.to_string(),
            credential: credential.to_string(),
        }
    }

    fn key() -> BrokerKey {
        BrokerKey::new("func", false)
    }

    fn stats_report(entries: &[(&str, u32)]) -> WorkerStatsReport {
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
    async fn register_creates_broker_lazily() {
        let (snapshot, _, _) = test_snapshot().await;
        assert_eq!(snapshot.broker_count().await, 0);

        snapshot.register(&meta("hello", "world")).await.unwrap();
        assert_eq!(snapshot.broker_count().await, 1);
        assert_eq!(
            snapshot.worker_status(&key(), "hello").await,
            Some(ContainerStatus::Created)
        );
    }

    #[tokio::test]
    async fn register_requires_profile() {
        let (snapshot, _, _) = test_snapshot().await;
        let mut unknown = meta("hello", "world");
        unknown.function_name = "nope".to_string();

        let err = snapshot.register(&unknown).await.unwrap_err();
        assert!(matches!(err, StateError::NoFunction(_)));
    }

    #[tokio::test]
    async fn names_are_globally_unique() {
        let (snapshot, _, registry) = test_snapshot().await;
        registry
            .set(
                vec![
                    test_profile_json("func", 10_000),
                    test_profile_json("other", 10_000),
                ],
                ApplyMode::Immediately,
            )
            .await
            .unwrap();

        snapshot.register(&meta("hello", "world")).await.unwrap();

        let mut clash = meta("hello", "other-cred");
        clash.function_name = "other".to_string();
        let err = snapshot.register(&clash).await.unwrap_err();
        assert!(matches!(err, StateError::DuplicateWorker(_)));
    }

    #[tokio::test]
    async fn sync_and_correct_reclaim_stopped_workers() {
        let (snapshot, supervisor, _) = test_snapshot().await;
        snapshot.register(&meta("hello", "world")).await.unwrap();
        snapshot.register(&meta("foo", "bar")).await.unwrap();

        let mut stopped_rx = snapshot.events().subscribe_worker_stopped();

        // Supervisor only knows about foo, and reports it stopped.
        snapshot
            .switch_to_all(&[TurfProcess {
                name: "foo".to_string(),
                pid: 123,
                status: TurfState::Stopped,
            }])
            .await;
        snapshot.sync(&stats_report(&[("foo", 6), ("hello", 1)])).await;

        let events = snapshot.correct().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].worker_name, "foo");
        assert_eq!(events[0].pid, Some(123));

        let received = stopped_rx.recv().await.unwrap();
        assert_eq!(received.worker_name, "foo");

        // hello is still within its init window: untouched.
        assert_eq!(
            snapshot.worker_status(&key(), "hello").await,
            Some(ContainerStatus::Created)
        );
        assert!(snapshot.worker_status(&key(), "foo").await.is_none());

        // The sandbox was destroyed (stop + delete).
        assert_eq!(supervisor.calls_for("delete"), vec!["delete foo"]);
    }

    #[tokio::test]
    async fn correct_is_idempotent() {
        let (snapshot, _, _) = test_snapshot().await;
        snapshot.register(&meta("hello", "world")).await.unwrap();
        snapshot
            .switch_to_all(&[TurfProcess {
                name: "hello".to_string(),
                pid: 1,
                status: TurfState::Stopped,
            }])
            .await;

        assert_eq!(snapshot.correct().await.len(), 1);
        assert_eq!(snapshot.correct().await.len(), 0);
    }

    #[tokio::test]
    async fn empty_broker_without_profile_is_dropped() {
        let (snapshot, _, registry) = test_snapshot().await;
        snapshot.register(&meta("hello", "world")).await.unwrap();

        // Stop the only worker, then withdraw the profile.
        snapshot
            .switch_to_all(&[TurfProcess {
                name: "hello".to_string(),
                pid: 1,
                status: TurfState::Stopped,
            }])
            .await;
        registry.set(vec![], ApplyMode::Immediately).await.unwrap();

        snapshot.correct().await;
        assert_eq!(snapshot.broker_count().await, 0);
    }

    #[tokio::test]
    async fn empty_broker_with_profile_is_kept() {
        let (snapshot, _, _) = test_snapshot().await;
        snapshot.register(&meta("hello", "world")).await.unwrap();
        snapshot
            .switch_to_all(&[TurfProcess {
                name: "hello".to_string(),
                pid: 1,
                status: TurfState::Stopped,
            }])
            .await;

        snapshot.correct().await;
        assert_eq!(snapshot.broker_count().await, 1);
    }

    #[tokio::test]
    async fn init_watchdog_stops_worker_once() {
        let (snapshot, _, registry) = test_snapshot().await;
        registry
            .set(vec![test_profile_json("func", 20)], ApplyMode::Immediately)
            .await
            .unwrap();

        let waiter = snapshot.register(&meta("hello", "world")).await.unwrap();
        let err = waiter.wait().await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::ReadyError::InitTimeout
                | crate::error::ReadyError::Stopped(ContainerStatus::Stopped)
        ));

        // Give the watchdog time to fire, then check exactly one Stopped.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert_eq!(
            snapshot.worker_status(&key(), "hello").await,
            Some(ContainerStatus::Stopped)
        );
        // Starting pool no longer references it.
        let pool_len = snapshot
            .with_broker(&key(), |b| b.starting_pool().count())
            .await
            .unwrap();
        assert_eq!(pool_len, 0);
    }

    #[tokio::test]
    async fn status_report_fast_path() {
        let (snapshot, _, _) = test_snapshot().await;
        snapshot.register(&meta("hello", "world")).await.unwrap();

        snapshot
            .apply_status_report(&ContainerStatusReport {
                function_name: "func".to_string(),
                name: "hello".to_string(),
                is_inspector: false,
                event: crate::types::ContainerReportEvent::ContainerInstalled,
                request_id: None,
            })
            .await;

        assert_eq!(
            snapshot.worker_status(&key(), "hello").await,
            Some(ContainerStatus::Ready)
        );
        // Ready workers leave the starting pool.
        let pool_len = snapshot
            .with_broker(&key(), |b| b.starting_pool().count())
            .await
            .unwrap();
        assert_eq!(pool_len, 0);
    }

    #[tokio::test]
    async fn virtual_memory_counts_live_workers() {
        let (snapshot, _, _) = test_snapshot().await;
        assert_eq!(snapshot.virtual_memory_used().await, 0);

        snapshot.register(&meta("hello", "world")).await.unwrap();
        snapshot.register(&meta("foo", "bar")).await.unwrap();
        assert_eq!(snapshot.virtual_memory_used().await, 2 * 512 * 1024 * 1024);
    }

    #[tokio::test]
    async fn unregister_destroys_sandbox() {
        let (snapshot, supervisor, _) = test_snapshot().await;
        snapshot.register(&meta("hello", "world")).await.unwrap();

        snapshot.unregister(&key(), "hello").await;
        assert!(snapshot.worker_status(&key(), "hello").await.is_none());
        assert_eq!(supervisor.calls_for("stop"), vec!["stop hello"]);
        assert_eq!(supervisor.calls_for("delete"), vec!["delete hello"]);
    }

    #[tokio::test]
    async fn stats_round_trip() {
        let (snapshot, _, _) = test_snapshot().await;
        snapshot.register(&meta("hello", "world")).await.unwrap();
        snapshot.register(&meta("foo", "bar")).await.unwrap();
        snapshot
            .apply_status_report(&ContainerStatusReport {
                function_name: "func".to_string(),
                name: "hello".to_string(),
                is_inspector: false,
                event: crate::types::ContainerReportEvent::ContainerInstalled,
                request_id: None,
            })
            .await;
        snapshot.sync(&stats_report(&[("hello", 2), ("foo", 0)])).await;

        let stats = snapshot.stats().await;
        let json = serde_json::to_string(&stats).unwrap();
        let rebuilt: SnapshotStats = serde_json::from_str(&json).unwrap();
        assert_eq!(rebuilt, stats);

        assert_eq!(stats.brokers.len(), 1);
        let broker = &stats.brokers[0];
        assert_eq!(broker.workers.len(), 2);
        assert_eq!(broker.starting_pool.len(), 1);
        assert_eq!(broker.starting_pool[0].worker_name, "foo");
    }
}
