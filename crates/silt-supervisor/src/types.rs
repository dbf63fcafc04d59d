//! Types describing supervisor-side sandbox state.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// OS-level sandbox state as reported by `turf ps` / `turf state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurfState {
    Init,
    Starting,
    Cloning,
    Running,
    /// Seed processes park here; the control plane ignores it.
    Forkwait,
    Stopping,
    Stopped,
    Unknown,
}

impl TurfState {
    /// Parse a state token. Unrecognized tokens map to `Unknown` rather
    /// than erroring; a newer turf may grow states we have not seen.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "init" => TurfState::Init,
            "starting" => TurfState::Starting,
            "cloning" => TurfState::Cloning,
            "running" => TurfState::Running,
            "forkwait" => TurfState::Forkwait,
            "stopping" => TurfState::Stopping,
            "stopped" => TurfState::Stopped,
            _ => TurfState::Unknown,
        }
    }
}

impl fmt::Display for TurfState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TurfState::Init => "init",
            TurfState::Starting => "starting",
            TurfState::Cloning => "cloning",
            TurfState::Running => "running",
            TurfState::Forkwait => "forkwait",
            TurfState::Stopping => "stopping",
            TurfState::Stopped => "stopped",
            TurfState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// One line of `turf ps` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurfProcess {
    pub name: String,
    pub pid: i32,
    pub status: TurfState,
}

/// A value from `turf state` output: `pid`, `stat.*` and `rusage.*` keys
/// are numeric, everything else is a string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TurfValue {
    Int(i64),
    Str(String),
}

/// Parsed `turf state <name>` record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurfStateRecord {
    pub values: HashMap<String, TurfValue>,
}

impl TurfStateRecord {
    pub fn pid(&self) -> Option<i32> {
        match self.values.get("pid") {
            Some(TurfValue::Int(pid)) => Some(*pid as i32),
            _ => None,
        }
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.values.get(key) {
            Some(TurfValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.values.get(key) {
            Some(TurfValue::Str(v)) => Some(v),
            _ => None,
        }
    }
}
