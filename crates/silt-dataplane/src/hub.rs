//! Fan-out hub over all connected data planes.
//!
//! Caches the most recent worker-stats broadcast for the reconciler,
//! re-publishes container status reports on a typed channel, and fans
//! capacity reductions out to every available client.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;
use tracing::{debug, warn};

use silt_state::{ContainerStatusReport, FunctionProfile, KvPair, WorkerStatsReport};

use crate::client::{
    DataPlaneClient, ReduceCapacityBroker, ReduceCapacityRequest, ReduceCapacityResponse,
};

const REPORT_CHANNEL_CAPACITY: usize = 256;

struct HubInner {
    clients: RwLock<Vec<Arc<dyn DataPlaneClient>>>,
    latest_stats: RwLock<WorkerStatsReport>,
    reports_tx: broadcast::Sender<ContainerStatusReport>,
}

/// Shared handle over the connected data planes.
#[derive(Clone)]
pub struct DataPlaneHub {
    inner: Arc<HubInner>,
}

impl DataPlaneHub {
    pub fn new() -> Self {
        let (reports_tx, _) = broadcast::channel(REPORT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(HubInner {
                clients: RwLock::new(Vec::new()),
                latest_stats: RwLock::new(WorkerStatsReport::default()),
                reports_tx,
            }),
        }
    }

    pub fn add_client(&self, client: Arc<dyn DataPlaneClient>) {
        self.inner.clients.write().expect("lock poisoned").push(client);
    }

    pub fn client_count(&self) -> usize {
        self.inner.clients.read().expect("lock poisoned").len()
    }

    fn clients(&self) -> Vec<Arc<dyn DataPlaneClient>> {
        self.inner.clients.read().expect("lock poisoned").clone()
    }

    /// Record a worker-stats broadcast; the reconciler reads it back on
    /// its next tick.
    pub fn ingest_stats(&self, report: WorkerStatsReport) {
        *self.inner.latest_stats.write().expect("lock poisoned") = report;
    }

    pub fn latest_stats(&self) -> WorkerStatsReport {
        self.inner.latest_stats.read().expect("lock poisoned").clone()
    }

    /// Re-publish an incoming container status report to subscribers.
    pub fn ingest_status_report(&self, report: ContainerStatusReport) {
        let _ = self.inner.reports_tx.send(report);
    }

    pub fn subscribe_reports(&self) -> broadcast::Receiver<ContainerStatusReport> {
        self.inner.reports_tx.subscribe()
    }

    /// Offer shrink victims to every available data plane and union the
    /// confirmations. A failing client is skipped with a warning; the
    /// others still get to confirm.
    pub async fn reduce_capacity(
        &self,
        request: &ReduceCapacityRequest,
    ) -> ReduceCapacityResponse {
        let mut confirmed: Vec<ReduceCapacityBroker> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for client in self.clients() {
            match client.reduce_capacity(request).await {
                Ok(response) => {
                    for broker in response.brokers {
                        let workers: Vec<_> = broker
                            .workers
                            .into_iter()
                            .filter(|w| seen.insert(w.name.clone()))
                            .collect();
                        if workers.is_empty() {
                            continue;
                        }
                        match confirmed.iter_mut().find(|b| {
                            b.function_name == broker.function_name
                                && b.is_inspector == broker.is_inspector
                        }) {
                            Some(existing) => existing.workers.extend(workers),
                            None => confirmed.push(ReduceCapacityBroker {
                                function_name: broker.function_name,
                                is_inspector: broker.is_inspector,
                                workers,
                            }),
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "data plane refused reduce-capacity call");
                }
            }
        }

        debug!(
            offered = request.brokers.iter().map(|b| b.workers.len()).sum::<usize>(),
            confirmed = confirmed.iter().map(|b| b.workers.len()).sum::<usize>(),
            "capacity reduction negotiated"
        );
        ReduceCapacityResponse { brokers: confirmed }
    }

    /// Push the profile set to every data plane.
    pub async fn set_function_profiles(&self, profiles: &[Arc<FunctionProfile>]) {
        for client in self.clients() {
            if let Err(e) = client.set_function_profiles(profiles).await {
                warn!(error = %e, "failed to push profiles to data plane");
            }
        }
    }

    pub async fn use_inspector(&self, function_name: &str, enable: bool) {
        for client in self.clients() {
            if let Err(e) = client.use_inspector(function_name, enable).await {
                warn!(error = %e, function = %function_name, "failed to toggle inspector");
            }
        }
    }

    pub async fn set_platform_environment_variables(&self, pairs: &[KvPair]) {
        for client in self.clients() {
            if let Err(e) = client.set_platform_environment_variables(pairs).await {
                warn!(error = %e, "failed to push platform environment");
            }
        }
    }
}

impl Default for DataPlaneHub {
    fn default() -> Self {
        Self::new()
    }
}
