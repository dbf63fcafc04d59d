//! Scripted in-memory supervisor for tests.
//!
//! Records every command in invocation order and serves a caller-provided
//! `ps` table. Failures can be injected per command to exercise the retry
//! and swallow policies.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::client::{StartOptions, Supervisor};
use crate::error::{TurfError, TurfResult};
use crate::types::{TurfProcess, TurfStateRecord};

#[derive(Default)]
struct Script {
    ps_table: Vec<TurfProcess>,
    /// Remaining injected failures per command verb ("stop", "create", ...):
    /// (code, times left).
    failures: HashMap<String, (i32, u32)>,
}

/// An in-memory [`Supervisor`] that records calls instead of running turf.
#[derive(Default)]
pub struct MockSupervisor {
    calls: Mutex<Vec<String>>,
    script: Mutex<Script>,
}

impl MockSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the table served by `ps`.
    pub fn set_ps(&self, table: Vec<TurfProcess>) {
        self.script.lock().unwrap().ps_table = table;
    }

    /// Make the next `times` invocations of `verb` fail with `code`.
    pub fn fail_next(&self, verb: &str, code: i32, times: u32) {
        self.script
            .lock()
            .unwrap()
            .failures
            .insert(verb.to_string(), (code, times));
    }

    /// Every command recorded so far, e.g. `"stop hello"`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls recorded for one verb.
    pub fn calls_for(&self, verb: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(verb))
            .collect()
    }

    fn record(&self, verb: &str, rest: &str) -> TurfResult<()> {
        self.calls.lock().unwrap().push(if rest.is_empty() {
            verb.to_string()
        } else {
            format!("{verb} {rest}")
        });

        let mut script = self.script.lock().unwrap();
        if let Some((code, times)) = script.failures.get_mut(verb) {
            if *times > 0 {
                *times -= 1;
                return Err(TurfError::Command {
                    command: format!("{verb} {rest}"),
                    code: Some(*code),
                    stderr: "injected failure".to_string(),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Supervisor for MockSupervisor {
    async fn create(&self, name: &str, _bundle_path: &Path) -> TurfResult<()> {
        self.record("create", name)
    }

    async fn start(&self, name: &str, _options: StartOptions) -> TurfResult<()> {
        self.record("start", name)
    }

    async fn stop(&self, name: &str) -> TurfResult<()> {
        match self.record("stop", name) {
            Ok(()) => Ok(()),
            Err(e) if e.is_gone() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, name: &str) -> TurfResult<()> {
        match self.record("delete", name) {
            Ok(()) => Ok(()),
            Err(e) if e.is_gone() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn ps(&self) -> TurfResult<Vec<TurfProcess>> {
        self.record("ps", "")?;
        Ok(self.script.lock().unwrap().ps_table.clone())
    }

    async fn state(&self, name: &str) -> TurfResult<Option<TurfStateRecord>> {
        self.record("state", name)?;
        let script = self.script.lock().unwrap();
        let present = script.ps_table.iter().any(|p| p.name == name);
        Ok(present.then(TurfStateRecord::default))
    }
}
