//! Scripted in-memory data plane for tests.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use silt_state::{FunctionProfile, KvPair};

use crate::client::{
    DataPlaneClient, ReduceCapacityBroker, ReduceCapacityRequest, ReduceCapacityResponse,
};

/// A [`DataPlaneClient`] that confirms every offered worker unless told to
/// refuse it, and records what it was asked.
#[derive(Default)]
pub struct MockDataPlane {
    refused: Mutex<HashSet<String>>,
    reduce_requests: Mutex<Vec<ReduceCapacityRequest>>,
    profile_pushes: Mutex<Vec<Vec<String>>>,
    fail_reduce: Mutex<bool>,
}

impl MockDataPlane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse to drop the named worker in future reduce-capacity calls.
    pub fn refuse_worker(&self, name: &str) {
        self.refused.lock().unwrap().insert(name.to_string());
    }

    /// Make reduce-capacity calls error out entirely.
    pub fn fail_reduce_capacity(&self) {
        *self.fail_reduce.lock().unwrap() = true;
    }

    pub fn reduce_requests(&self) -> Vec<ReduceCapacityRequest> {
        self.reduce_requests.lock().unwrap().clone()
    }

    /// Function names of every profile push received, in order.
    pub fn profile_pushes(&self) -> Vec<Vec<String>> {
        self.profile_pushes.lock().unwrap().clone()
    }
}

#[async_trait]
impl DataPlaneClient for MockDataPlane {
    async fn reduce_capacity(
        &self,
        request: &ReduceCapacityRequest,
    ) -> anyhow::Result<ReduceCapacityResponse> {
        if *self.fail_reduce.lock().unwrap() {
            anyhow::bail!("data plane unavailable");
        }
        self.reduce_requests.lock().unwrap().push(request.clone());

        let refused = self.refused.lock().unwrap();
        let brokers = request
            .brokers
            .iter()
            .map(|broker| ReduceCapacityBroker {
                function_name: broker.function_name.clone(),
                is_inspector: broker.is_inspector,
                workers: broker
                    .workers
                    .iter()
                    .filter(|w| !refused.contains(&w.name))
                    .cloned()
                    .collect(),
            })
            .collect();
        Ok(ReduceCapacityResponse { brokers })
    }

    async fn set_function_profiles(
        &self,
        profiles: &[Arc<FunctionProfile>],
    ) -> anyhow::Result<()> {
        self.profile_pushes
            .lock()
            .unwrap()
            .push(profiles.iter().map(|p| p.name.clone()).collect());
        Ok(())
    }

    async fn use_inspector(&self, _function_name: &str, _enable: bool) -> anyhow::Result<()> {
        Ok(())
    }

    async fn set_platform_environment_variables(
        &self,
        _pairs: &[KvPair],
    ) -> anyhow::Result<()> {
        Ok(())
    }
}
