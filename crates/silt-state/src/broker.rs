//! Per-function scheduling unit.
//!
//! A broker aggregates the replicas of one (function, inspector) pair:
//! their live workers, the starting pool of replicas that have not become
//! Ready yet, and the water-level policy that turns observed load into
//! expand/shrink deltas.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::types::{FunctionProfile, WorkerStats};
use crate::worker::{ContainerStatus, ReadyWaiter, Worker};

/// Water level at or below which a broker becomes shrink-eligible.
const SHRINK_WATER_LEVEL: f64 = 0.6;
/// Water level at or above which a broker expands.
const EXPANSION_WATER_LEVEL: f64 = 0.8;
/// Water level scaling decisions aim for.
const NORMAL_WATER_LEVEL: f64 = 0.7;

/// A worker registered but not yet Ready, tracked for request
/// pre-admission onto warming replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartingPoolItem {
    pub worker_name: String,
    pub credential: String,
    pub max_activate_requests: u32,
    /// Requests this warming worker is still expected to absorb.
    pub estimate_request_left: u32,
}

/// Name + credential pair identifying a shrink victim toward the data
/// plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHandle {
    pub name: String,
    pub credential: String,
}

/// All replicas of one (function, inspector) pair.
pub struct Broker {
    function_name: String,
    is_inspector: bool,
    profile: Option<Arc<FunctionProfile>>,
    workers: BTreeMap<String, Worker>,
    starting_pool: BTreeMap<String, StartingPoolItem>,
    /// Consecutive shrink-eligible evaluations (hysteresis counter).
    redundant_times: u32,
    /// Eligible evaluations required before a shrink fires
    /// (`worker.shrink_redundant_times`).
    shrink_redundant_times: u32,
    next_seq: u64,
}

impl Broker {
    pub fn new(
        function_name: impl Into<String>,
        is_inspector: bool,
        profile: Option<Arc<FunctionProfile>>,
        shrink_redundant_times: u32,
    ) -> Self {
        Self {
            function_name: function_name.into(),
            is_inspector,
            profile,
            workers: BTreeMap::new(),
            starting_pool: BTreeMap::new(),
            redundant_times: 0,
            shrink_redundant_times,
            next_seq: 0,
        }
    }

    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    pub fn is_inspector(&self) -> bool {
        self.is_inspector
    }

    pub fn profile(&self) -> Option<&Arc<FunctionProfile>> {
        self.profile.as_ref()
    }

    pub fn redundant_times(&self) -> u32 {
        self.redundant_times
    }

    pub fn workers(&self) -> impl Iterator<Item = &Worker> {
        self.workers.values()
    }

    pub fn worker(&self, name: &str) -> Option<&Worker> {
        self.workers.get(name)
    }

    pub fn worker_mut(&mut self, name: &str) -> Option<&mut Worker> {
        self.workers.get_mut(name)
    }

    pub fn starting_pool(&self) -> impl Iterator<Item = &StartingPoolItem> {
        self.starting_pool.values()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Register a freshly launched worker. Requires a published profile.
    pub fn register(
        &mut self,
        name: &str,
        credential: &str,
    ) -> StateResult<ReadyWaiter> {
        let Some(profile) = self.profile.clone() else {
            return Err(StateError::NoFunction(self.function_name.clone()));
        };
        if self.workers.contains_key(name) {
            return Err(StateError::DuplicateWorker(name.to_string()));
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        let worker = Worker::new(
            name,
            credential,
            Duration::from_millis(profile.initialization_timeout_ms()),
            profile.disposable(),
            seq,
        );
        let waiter = worker.ready_waiter();

        self.starting_pool.insert(
            name.to_string(),
            StartingPoolItem {
                worker_name: name.to_string(),
                credential: credential.to_string(),
                max_activate_requests: profile.max_activate_requests(),
                estimate_request_left: profile.max_activate_requests(),
            },
        );
        self.workers.insert(name.to_string(), worker);

        debug!(
            function = %self.function_name,
            worker = %name,
            "worker registered"
        );
        Ok(waiter)
    }

    /// Remove a worker (and its starting-pool entry). The caller owns the
    /// follow-up toward the supervisor.
    pub fn remove_worker(&mut self, name: &str) -> Option<Worker> {
        self.starting_pool.remove(name);
        self.workers.remove(name)
    }

    /// Refresh this broker from a stats push and the current profile.
    ///
    /// Workers named in `stats` get their counters replaced; all others
    /// have them cleared. Starting-pool entries follow their worker out of
    /// Created, and warming entries with fresh stats get their remaining
    /// estimate recomputed.
    pub fn sync(
        &mut self,
        stats: &[WorkerStats],
        profile: Option<Arc<FunctionProfile>>,
    ) {
        self.profile = profile;

        let by_name: BTreeMap<&str, &WorkerStats> =
            stats.iter().map(|s| (s.name.as_str(), s)).collect();

        for (name, worker) in self.workers.iter_mut() {
            worker.sync(by_name.get(name.as_str()).copied());
        }

        self.prune_starting_pool();
        for (name, entry) in self.starting_pool.iter_mut() {
            if let Some(stat) = by_name.get(name.as_str()) {
                entry.estimate_request_left = entry
                    .max_activate_requests
                    .saturating_sub(stat.active_request_count);
            }
        }
    }

    /// Drop starting-pool entries whose worker is gone or no longer
    /// initializing. Keeps the pool invariant: every entry has a Created
    /// worker behind it.
    pub fn prune_starting_pool(&mut self) {
        let workers = &self.workers;
        self.starting_pool.retain(|name, _| {
            workers
                .get(name)
                .map(|w| w.is_initializing())
                .unwrap_or(false)
        });
    }

    /// Admit one request onto a warming worker, if any has estimated
    /// headroom left. Decrements the first such entry.
    pub fn prerequest_starting_pool(&mut self) -> bool {
        for entry in self.starting_pool.values_mut() {
            if entry.estimate_request_left > 0 {
                entry.estimate_request_left -= 1;
                return true;
            }
        }
        false
    }

    // ── Derived metrics ─────────────────────────────────────────────

    /// Replicas counting toward capacity (Ready or draining).
    pub fn worker_count(&self) -> u32 {
        self.workers.values().filter(|w| w.counts_capacity()).count() as u32
    }

    pub fn active_request_count(&self) -> u32 {
        self.workers
            .values()
            .filter(|w| w.counts_capacity())
            .filter_map(|w| w.data())
            .map(|d| d.active_request_count)
            .sum()
    }

    pub fn total_max_activate_requests(&self) -> u32 {
        self.workers
            .values()
            .filter(|w| w.counts_capacity())
            .filter_map(|w| w.data())
            .map(|d| d.max_activate_requests)
            .sum()
    }

    pub fn water_level(&self) -> f64 {
        let total = self.total_max_activate_requests();
        if total == 0 {
            return 0.0;
        }
        f64::from(self.active_request_count()) / f64::from(total)
    }

    /// Minimum replicas kept through shrinks: inspectors pin one,
    /// disposables none, everything else follows the profile.
    pub fn reservation_count(&self) -> u32 {
        if self.is_inspector {
            return 1;
        }
        match &self.profile {
            Some(p) if p.disposable() => 0,
            Some(p) => p.reservation_count(),
            None => 0,
        }
    }

    pub fn memory_limit(&self) -> u64 {
        self.profile.as_ref().map(|p| p.memory_limit()).unwrap_or(0)
    }

    /// Memory this broker pins in the virtual pool: every live replica,
    /// including ones still starting, at the profile's limit.
    pub fn virtual_memory(&self) -> u64 {
        let live = self.workers.values().filter(|w| w.is_live()).count() as u64;
        live * self.memory_limit()
    }

    // ── Scaling policy ──────────────────────────────────────────────

    /// Evaluate the broker's water level into a replica delta: positive to
    /// expand, negative to shrink, zero to hold.
    pub fn evaluate_water_level(&mut self, expansion_only: bool) -> i64 {
        if self
            .profile
            .as_ref()
            .map(|p| p.disposable())
            .unwrap_or(false)
        {
            return 0;
        }

        let Some(profile) = self.profile.clone() else {
            // Profile withdrawn: drain everything.
            return if expansion_only {
                0
            } else {
                -i64::from(self.worker_count())
            };
        };

        let worker_count = self.worker_count();
        if worker_count == 0 {
            return 0;
        }

        let total = f64::from(self.total_max_activate_requests());
        if total <= 0.0 {
            // No telemetry yet; nothing to decide on.
            return 0;
        }
        let active = f64::from(self.active_request_count());
        let water_level = active / total;
        let max_per_worker = f64::from(profile.max_activate_requests().max(1));
        let reservation = self.reservation_count();

        let shrink_eligible = water_level <= SHRINK_WATER_LEVEL
            && worker_count > reservation
            // Keep the last worker while it still carries requests.
            && !(worker_count == 1 && active > 0.0);

        if shrink_eligible {
            self.redundant_times += 1;
            if self.redundant_times < self.shrink_redundant_times {
                return 0;
            }
            self.redundant_times = 0;

            let target = active / NORMAL_WATER_LEVEL;
            let delta = ((total - target) / max_per_worker).floor() as i64;
            let delta = delta.min(i64::from(worker_count - reservation)).max(0);
            debug!(
                function = %self.function_name,
                water_level,
                delta,
                "shrink fired"
            );
            return -delta;
        }

        if water_level >= EXPANSION_WATER_LEVEL {
            self.redundant_times = 0;

            let target = active / NORMAL_WATER_LEVEL;
            let idle = (total - active).max(0.0);
            let delta = ((target - idle) / max_per_worker).ceil() as i64;
            let headroom =
                i64::from(profile.replica_count_limit().saturating_sub(worker_count));
            let delta = delta.clamp(0, headroom);
            debug!(
                function = %self.function_name,
                water_level,
                delta,
                "expansion evaluated"
            );
            return delta;
        }

        self.redundant_times = 0;
        0
    }

    /// Select `n` shrink victims by the profile's strategy and mark them
    /// PendingStop so they stop accepting new dispatches.
    pub fn shrink_draw(&mut self, n: usize) -> Vec<WorkerHandle> {
        let strategy = self
            .profile
            .as_ref()
            .map(|p| p.shrink_strategy().to_string())
            .unwrap_or_else(|| "LCC".to_string());

        let mut candidates: Vec<&Worker> = self
            .workers
            .values()
            .filter(|w| w.status() == ContainerStatus::Ready)
            .collect();

        match strategy.as_str() {
            "FIFO" => candidates.sort_by_key(|w| (w.register_time_ms(), w.seq())),
            "FILO" => {
                candidates.sort_by_key(|w| (w.register_time_ms(), w.seq()));
                candidates.reverse();
            }
            "LCC" => sort_by_least_active(&mut candidates),
            other => {
                warn!(
                    function = %self.function_name,
                    strategy = %other,
                    "unknown shrink strategy, falling back to LCC"
                );
                sort_by_least_active(&mut candidates);
            }
        }

        let victims: Vec<WorkerHandle> = candidates
            .into_iter()
            .take(n)
            .map(|w| WorkerHandle {
                name: w.name().to_string(),
                credential: w.credential().to_string(),
            })
            .collect();

        for victim in &victims {
            if let Some(worker) = self.workers.get_mut(&victim.name) {
                worker.update_container_status(ContainerStatus::PendingStop, "shrink draw");
            }
        }
        victims
    }
}

/// Least-current-connections order: fewest active requests first,
/// credential as the stable tiebreak.
fn sort_by_least_active(candidates: &mut [&Worker]) {
    candidates.sort_by(|a, b| {
        let a_active = a.data().map(|d| d.active_request_count).unwrap_or(0);
        let b_active = b.data().map(|d| d.active_request_count).unwrap_or(0);
        a_active
            .cmp(&b_active)
            .then_with(|| a.credential().cmp(b.credential()))
    });
}
