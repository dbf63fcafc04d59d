//! OCI-style bundle preparation.
//!
//! Every worker sandbox starts from a bundle directory: `<bundle>/code/`
//! holding the function code and `<bundle>/config.json` holding the spec.
//! Concurrent launches from the same bundle serialize around the spec
//! write through a keyed lock table.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use silt_state::FunctionProfile;

use crate::error::LaunchResult;

/// CPU quota period in microseconds (one second of wall time per core).
const CPU_PERIOD_US: u64 = 1_000_000;
/// Baseline CPU shares.
const CPU_SHARES: u64 = 1024;
/// Inspector sandboxes get their memory limit inflated in the spec only;
/// budget accounting keeps the original.
const INSPECTOR_MEMORY_FACTOR: u64 = 100;

/// Provides the code bundle for a function. Fetching and unpacking are
/// outside the control plane; implementations only guarantee the bundle
/// directory exists and holds the function's code.
#[async_trait]
pub trait CodeManager: Send + Sync {
    async fn ensure_bundle(&self, profile: &FunctionProfile) -> anyhow::Result<PathBuf>;
}

/// Bundles laid out under a base directory, one per function.
pub struct LocalCodeManager {
    bundles_dir: PathBuf,
}

impl LocalCodeManager {
    pub fn new(bundles_dir: PathBuf) -> Self {
        Self { bundles_dir }
    }
}

#[async_trait]
impl CodeManager for LocalCodeManager {
    async fn ensure_bundle(&self, profile: &FunctionProfile) -> anyhow::Result<PathBuf> {
        let bundle = self.bundles_dir.join(&profile.name);
        tokio::fs::create_dir_all(bundle.join("code")).await?;
        Ok(bundle)
    }
}

/// Keyed exclusive locks, one per bundle path. Holders queue; the table
/// is process-wide because bundles are process-wide resources.
#[derive(Clone, Default)]
pub struct BundleLockTable {
    locks: Arc<Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>>,
}

impl BundleLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, bundle: &Path) -> OwnedMutexGuard<()> {
        let entry = {
            let mut locks = self.locks.lock().expect("lock poisoned");
            locks
                .entry(bundle.to_path_buf())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        entry.lock_owned().await
    }
}

// ── Bundle spec ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleSpec {
    pub oci_version: String,
    pub process: ProcessSpec,
    pub linux: LinuxSpec,
    pub turf: TurfSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub args: Vec<String>,
    /// `KEY=VALUE` pairs.
    pub env: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinuxSpec {
    pub resources: ResourcesSpec,
    pub seccomp: SeccompSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcesSpec {
    pub memory: MemorySpec,
    pub cpu: CpuSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySpec {
    pub limit: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuSpec {
    pub shares: u64,
    pub quota: u64,
    pub period: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeccompSpec {
    pub default_action: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurfSpec {
    pub runtime: String,
}

/// Build the spec for one worker and write `<bundle>/config.json`.
///
/// The caller must hold the bundle's lock: concurrent launches from the
/// same bundle must not interleave spec writes.
pub async fn write_bundle_spec(
    bundle: &Path,
    profile: &FunctionProfile,
    worker_name: &str,
    credential: &str,
    inspect: bool,
) -> LaunchResult<PathBuf> {
    let spec = build_spec(profile, worker_name, credential, inspect);
    let path = bundle.join("config.json");
    let body = serde_json::to_vec_pretty(&spec)?;
    tokio::fs::write(&path, body).await?;
    debug!(bundle = %bundle.display(), worker = %worker_name, "bundle spec written");
    Ok(path)
}

fn build_spec(
    profile: &FunctionProfile,
    worker_name: &str,
    credential: &str,
    inspect: bool,
) -> BundleSpec {
    let mut args = vec![profile.runtime.clone()];
    args.extend(profile.worker.exec_argv.iter().cloned());
    args.extend(profile.worker.v8_options.iter().cloned());
    if let Some(source_file) = &profile.source_file {
        args.push(source_file.clone());
    } else if let Some(handler) = &profile.handler {
        args.push(handler.clone());
    }

    let mut env: Vec<String> = profile
        .environments
        .iter()
        .map(|kv| format!("{}={}", kv.key, kv.value))
        .collect();
    env.push(format!("SILT_FUNCTION_NAME={}", profile.name));
    env.push(format!("SILT_WORKER_NAME={worker_name}"));
    env.push(format!("SILT_WORKER_CREDENTIAL={credential}"));

    let memory_limit = if inspect {
        profile.memory_limit() * INSPECTOR_MEMORY_FACTOR
    } else {
        profile.memory_limit()
    };
    let quota = (profile.resource_limit.cpu_fraction * CPU_PERIOD_US as f64) as u64;

    BundleSpec {
        oci_version: "1.0.0".to_string(),
        process: ProcessSpec { args, env },
        linux: LinuxSpec {
            resources: ResourcesSpec {
                memory: MemorySpec {
                    limit: memory_limit,
                },
                cpu: CpuSpec {
                    shares: CPU_SHARES,
                    quota,
                    period: CPU_PERIOD_US,
                },
            },
            seccomp: SeccompSpec {
                default_action: "SCMP_ACT_ALLOW".to_string(),
            },
        },
        turf: TurfSpec {
            runtime: profile.runtime.clone(),
        },
    }
}
