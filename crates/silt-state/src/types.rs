//! Domain types: function profiles, telemetry reports, broker keys.
//!
//! All types serialize to/from JSON; profiles arrive as JSON pushes and the
//! snapshot is exported as JSON for telemetry.

use serde::{Deserialize, Serialize};
use std::fmt;

use silt_core::WorkerDefaults;

/// Declarative description of one function, immutable once published.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionProfile {
    pub name: String,
    /// Worker runtime kind, e.g. "aworker" or "nodejs".
    pub runtime: String,
    /// Source URI of the code package.
    pub url: String,
    /// Integrity signature of the code package.
    pub signature: String,
    /// Entry source file (service-worker style runtimes).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    /// Entry handler `module.function` (nodejs style runtimes).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
    #[serde(default)]
    pub resource_limit: ResourceLimit,
    #[serde(default)]
    pub worker: WorkerSettings,
    /// Environment variables injected into the sandbox.
    #[serde(default)]
    pub environments: Vec<KvPair>,
}

/// Resource limits for one worker sandbox.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResourceLimit {
    /// Memory limit in bytes.
    pub memory_bytes: u64,
    /// CPU share, 1.0 = one full core.
    pub cpu_fraction: f64,
}

impl Default for ResourceLimit {
    fn default() -> Self {
        Self {
            memory_bytes: 512 * 1024 * 1024,
            cpu_fraction: 1.0,
        }
    }
}

/// Per-function worker settings. Unset fields fall back to the `[worker]`
/// configuration defaults when the profile is published.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerSettings {
    pub max_activate_requests: Option<u32>,
    pub replica_count_limit: Option<u32>,
    pub reservation_count: Option<u32>,
    /// Victim selection strategy; kept as a free string so an unknown
    /// strategy degrades to the LCC fallback instead of rejecting the
    /// profile.
    pub shrink_strategy: Option<String>,
    pub initialization_timeout_ms: Option<u64>,
    pub v8_options: Vec<String>,
    pub exec_argv: Vec<String>,
    /// Reject requests instead of queueing on still-starting workers.
    pub fast_fail_requests_on_starting: bool,
    /// Disposable workers serve exactly one request and exit; they are
    /// lifecycle-driven, never load-scaled.
    pub disposable: bool,
}

/// One environment variable entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: String,
}

impl FunctionProfile {
    /// Fill unset worker fields from the configuration defaults. Called
    /// once at publication; afterwards the accessors below always see
    /// concrete values.
    pub fn normalize(&mut self, defaults: &WorkerDefaults) {
        let w = &mut self.worker;
        w.max_activate_requests
            .get_or_insert(defaults.max_activate_requests);
        w.replica_count_limit
            .get_or_insert(defaults.replica_count_limit);
        w.reservation_count.get_or_insert(defaults.reservation_count);
        w.shrink_strategy
            .get_or_insert_with(|| defaults.default_shrink_strategy.clone());
        w.initialization_timeout_ms
            .get_or_insert(defaults.default_initializer_timeout_ms);
    }

    pub fn memory_limit(&self) -> u64 {
        self.resource_limit.memory_bytes
    }

    pub fn max_activate_requests(&self) -> u32 {
        self.worker.max_activate_requests.unwrap_or(10)
    }

    pub fn replica_count_limit(&self) -> u32 {
        self.worker.replica_count_limit.unwrap_or(10)
    }

    pub fn reservation_count(&self) -> u32 {
        self.worker.reservation_count.unwrap_or(0)
    }

    pub fn shrink_strategy(&self) -> &str {
        self.worker.shrink_strategy.as_deref().unwrap_or("LCC")
    }

    pub fn initialization_timeout_ms(&self) -> u64 {
        self.worker.initialization_timeout_ms.unwrap_or(10_000)
    }

    pub fn disposable(&self) -> bool {
        self.worker.disposable
    }
}

/// Identifies a broker: one function name, debugged or not.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BrokerKey {
    pub function_name: String,
    pub is_inspector: bool,
}

impl BrokerKey {
    pub fn new(function_name: impl Into<String>, is_inspector: bool) -> Self {
        Self {
            function_name: function_name.into(),
            is_inspector,
        }
    }
}

impl fmt::Display for BrokerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_inspector {
            write!(f, "{}(inspector)", self.function_name)
        } else {
            f.write_str(&self.function_name)
        }
    }
}

/// Registration record for a freshly launched worker.
#[derive(Debug, Clone)]
pub struct WorkerMetadata {
    pub function_name: String,
    pub is_inspector: bool,
    /// Globally unique sandbox process name.
    pub name: String,
    /// Opaque token the worker presents on its delegate connection.
    pub credential: String,
}

impl WorkerMetadata {
    pub fn broker_key(&self) -> BrokerKey {
        BrokerKey::new(self.function_name.clone(), self.is_inspector)
    }
}

// ── Data-plane telemetry ──────────────────────────────────────────

/// Request counters for one worker, as pushed by the data plane.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerStats {
    pub name: String,
    pub active_request_count: u32,
    pub max_activate_requests: u32,
}

/// Stats for one broker's workers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BrokerStats {
    pub function_name: String,
    pub is_inspector: bool,
    pub workers: Vec<WorkerStats>,
}

/// A full worker-stats broadcast from one data plane.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerStatsReport {
    pub brokers: Vec<BrokerStats>,
}

/// Last-observed request counters kept on the worker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerActivity {
    pub max_activate_requests: u32,
    pub active_request_count: u32,
}

// ── Status reports ────────────────────────────────────────────────

/// Container lifecycle events observed by the data plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerReportEvent {
    ContainerInstalled,
    RequestDrained,
    ContainerDisconnected,
    #[serde(other)]
    Unrecognized,
}

/// Event-driven status report, applied independently of the reconcile tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerStatusReport {
    pub function_name: String,
    pub name: String,
    pub is_inspector: bool,
    pub event: ContainerReportEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}
