//! The data-plane client trait and its request/response types.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use silt_state::{FunctionProfile, KvPair, WorkerHandle};

/// One broker's shrink victims offered to the data plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReduceCapacityBroker {
    pub function_name: String,
    pub is_inspector: bool,
    pub workers: Vec<WorkerHandle>,
}

/// Capacity-reduction offer covering one autoscale cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReduceCapacityRequest {
    pub brokers: Vec<ReduceCapacityBroker>,
}

/// The subset of offered workers the data plane agreed to drop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReduceCapacityResponse {
    pub brokers: Vec<ReduceCapacityBroker>,
}

impl ReduceCapacityRequest {
    pub fn is_empty(&self) -> bool {
        self.brokers.iter().all(|b| b.workers.is_empty())
    }
}

impl ReduceCapacityResponse {
    /// All confirmed workers across brokers.
    pub fn confirmed_workers(&self) -> impl Iterator<Item = &WorkerHandle> {
        self.brokers.iter().flat_map(|b| b.workers.iter())
    }
}

/// One connected data plane.
#[async_trait]
pub trait DataPlaneClient: Send + Sync {
    /// Offer shrink victims; the data plane returns the subset it is
    /// willing to drop (it may refuse workers that just took traffic).
    async fn reduce_capacity(
        &self,
        request: &ReduceCapacityRequest,
    ) -> anyhow::Result<ReduceCapacityResponse>;

    /// Push the current profile set to the data plane.
    async fn set_function_profiles(
        &self,
        profiles: &[Arc<FunctionProfile>],
    ) -> anyhow::Result<()>;

    /// Toggle inspector (debug) routing for one function.
    async fn use_inspector(&self, function_name: &str, enable: bool) -> anyhow::Result<()>;

    /// Push platform-wide environment variables.
    async fn set_platform_environment_variables(
        &self,
        pairs: &[KvPair],
    ) -> anyhow::Result<()>;
}
