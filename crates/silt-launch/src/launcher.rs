//! The worker launcher.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

use silt_core::Config;
use silt_state::{Snapshot, WorkerMetadata};
use silt_supervisor::{StartOptions, Supervisor};

use crate::bundle::{BundleLockTable, CodeManager, write_bundle_spec};
use crate::error::{LaunchError, LaunchResult};

/// Launcher knobs, lifted from the configuration.
#[derive(Debug, Clone)]
pub struct LauncherOptions {
    /// Global admission budget (bytes).
    pub virtual_memory_pool_size: u64,
    /// Concurrent launches allowed per function.
    pub expand_concurrency: u32,
    /// Delay before a launch that had to queue behind the gate starts.
    pub expand_interval: Duration,
    /// Per-worker sandbox log directories live under here.
    pub logs_dir: PathBuf,
    /// Seed process to clone workers from, when configured.
    pub seed: Option<String>,
}

impl LauncherOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            virtual_memory_pool_size: config.virtual_memory_pool_size,
            expand_concurrency: config.control_plane.expand_concurrency,
            expand_interval: config.control_plane.expand_interval(),
            logs_dir: config.turf.logs_dir.clone(),
            seed: (!config.turf.seed.is_empty()).then(|| config.turf.seed.clone()),
        }
    }
}

/// Executes launches: admission, bundle preparation, supervisor
/// `create`+`start`, registration, ready wait.
pub struct WorkerLauncher {
    snapshot: Snapshot,
    supervisor: Arc<dyn Supervisor>,
    code: Arc<dyn CodeManager>,
    options: LauncherOptions,
    bundle_locks: BundleLockTable,
    /// Per-function launch gates bounding concurrency.
    gates: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl WorkerLauncher {
    pub fn new(
        snapshot: Snapshot,
        supervisor: Arc<dyn Supervisor>,
        code: Arc<dyn CodeManager>,
        options: LauncherOptions,
    ) -> Self {
        Self {
            snapshot,
            supervisor,
            code,
            options,
            bundle_locks: BundleLockTable::new(),
            gates: Mutex::new(HashMap::new()),
        }
    }

    /// Launch one worker for `function_name` and wait until it is Ready.
    /// Returns the worker's process name.
    pub async fn try_launch(
        &self,
        function_name: &str,
        inspect: bool,
    ) -> LaunchResult<String> {
        let Some(profile) = self.snapshot.registry().get(function_name) else {
            return Err(LaunchError::NoFunction(function_name.to_string()));
        };

        // Bound launch concurrency per function; launches that had to
        // queue are staggered by the expand interval.
        let gate = self.gate(function_name);
        let _permit = match gate.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                let permit = gate
                    .acquire_owned()
                    .await
                    .expect("launch gate never closes");
                tokio::time::sleep(self.options.expand_interval).await;
                permit
            }
        };

        // Admission against the virtual memory pool. Inspector spec
        // inflation does not apply here; the budget sees the real limit.
        let used = self.snapshot.virtual_memory_used().await;
        let need = profile.memory_limit();
        if need + used > self.options.virtual_memory_pool_size {
            return Err(LaunchError::NoEnoughVirtualMemory {
                function: function_name.to_string(),
                need,
                available: self.options.virtual_memory_pool_size.saturating_sub(used),
            });
        }

        let worker_name = format!("{function_name}-{}", short_id());
        let credential = Uuid::new_v4().simple().to_string();

        let bundle = self
            .code
            .ensure_bundle(&profile)
            .await
            .map_err(|source| LaunchError::EnsureCodeFailed {
                function: function_name.to_string(),
                source,
            })?;

        // The spec write and the create that consumes it stay under the
        // bundle lock; a concurrent launch must not swap config.json
        // between them.
        {
            let _bundle_guard = self.bundle_locks.lock(&bundle).await;
            write_bundle_spec(&bundle, &profile, &worker_name, &credential, inspect).await?;
            self.supervisor.create(&worker_name, &bundle).await?;
        }

        let log_dir = self.options.logs_dir.join(&worker_name);
        tokio::fs::create_dir_all(&log_dir).await?;
        let start = StartOptions {
            seed: self.options.seed.clone(),
            stdout: Some(log_dir.join("stdout.log")),
            stderr: Some(log_dir.join("stderr.log")),
        };
        if let Err(e) = self.supervisor.start(&worker_name, start).await {
            if let Err(cleanup) = self.supervisor.delete(&worker_name).await {
                warn!(worker = %worker_name, error = %cleanup, "failed to delete sandbox after start failure");
            }
            return Err(e.into());
        }

        let meta = WorkerMetadata {
            function_name: function_name.to_string(),
            is_inspector: inspect,
            name: worker_name.clone(),
            credential,
        };
        let key = meta.broker_key();
        let waiter = self.snapshot.register(&meta).await?;
        info!(worker = %worker_name, function = %function_name, "worker started, awaiting readiness");

        match waiter.wait().await {
            Ok(()) => Ok(worker_name),
            Err(e) => {
                self.snapshot.unregister(&key, &worker_name).await;
                Err(e.into())
            }
        }
    }

    /// Launch `count` workers concurrently. All launches run to
    /// completion; if any failed, the first error is surfaced.
    pub async fn try_batch_launch(
        &self,
        function_name: &str,
        count: usize,
        inspect: bool,
    ) -> LaunchResult<Vec<String>> {
        let launches = (0..count).map(|_| self.try_launch(function_name, inspect));
        let results = futures::future::join_all(launches).await;

        let mut names = Vec::with_capacity(count);
        let mut first_error = None;
        for result in results {
            match result {
                Ok(name) => names.push(name),
                Err(e) => {
                    warn!(function = %function_name, error = %e, "launch failed in batch");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(names),
        }
    }

    pub fn options(&self) -> &LauncherOptions {
        &self.options
    }

    fn gate(&self, function_name: &str) -> Arc<Semaphore> {
        let mut gates = self.gates.lock().expect("lock poisoned");
        gates
            .entry(function_name.to_string())
            .or_insert_with(|| {
                Arc::new(Semaphore::new(self.options.expand_concurrency.max(1) as usize))
            })
            .clone()
    }
}

fn short_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}
