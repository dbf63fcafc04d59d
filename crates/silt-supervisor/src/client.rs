//! The `Supervisor` trait and the turf CLI client.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{TurfError, TurfResult};
use crate::types::{TurfProcess, TurfState, TurfStateRecord, TurfValue};

/// Options for `turf start`.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Name of the seed process to clone from, when seeding is enabled.
    pub seed: Option<String>,
    /// File receiving the sandbox's stdout.
    pub stdout: Option<PathBuf>,
    /// File receiving the sandbox's stderr.
    pub stderr: Option<PathBuf>,
}

/// Command/query interface to the sandbox supervisor.
#[async_trait]
pub trait Supervisor: Send + Sync {
    async fn create(&self, name: &str, bundle_path: &Path) -> TurfResult<()>;

    async fn start(&self, name: &str, options: StartOptions) -> TurfResult<()>;

    /// Stop a sandbox. Graceful first; retried with force on transient
    /// failures. A sandbox that is already gone counts as success.
    async fn stop(&self, name: &str) -> TurfResult<()>;

    async fn delete(&self, name: &str) -> TurfResult<()>;

    /// `stop` then `delete`.
    async fn destroy(&self, name: &str) -> TurfResult<()> {
        self.stop(name).await?;
        self.delete(name).await
    }

    async fn ps(&self) -> TurfResult<Vec<TurfProcess>>;

    /// Detailed sandbox state; `None` when the sandbox does not exist.
    async fn state(&self, name: &str) -> TurfResult<Option<TurfStateRecord>>;
}

/// Supervisor implementation that shells out to the turf binary.
pub struct TurfClient {
    bin: PathBuf,
    /// Upper bound on the graceful stop window before force takes over.
    graceful_exit_period: Duration,
}

/// Force-stop retries after a transient graceful failure.
const STOP_RETRIES: u32 = 3;
/// Backoff between stop attempts.
const STOP_BACKOFF: Duration = Duration::from_secs(1);

impl TurfClient {
    pub fn new(bin: PathBuf, graceful_exit_period: Duration) -> Self {
        Self {
            bin,
            graceful_exit_period,
        }
    }

    async fn run(&self, args: &[&str]) -> TurfResult<String> {
        debug!(turf = %self.bin.display(), ?args, "invoking turf");
        let output = Command::new(&self.bin).args(args).output().await?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        Err(TurfError::Command {
            command: args.join(" "),
            code: output.status.code().map(normalize_code),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// turf reports errno-style negative codes; the OS exposes them as the low
/// byte of the exit status. Fold them back into signed form.
fn normalize_code(code: i32) -> i32 {
    if code > 127 { code - 256 } else { code }
}

#[async_trait]
impl Supervisor for TurfClient {
    async fn create(&self, name: &str, bundle_path: &Path) -> TurfResult<()> {
        let bundle = bundle_path.to_string_lossy();
        self.run(&["create", "-b", &bundle, name]).await?;
        Ok(())
    }

    async fn start(&self, name: &str, options: StartOptions) -> TurfResult<()> {
        let mut args: Vec<String> = vec!["start".to_string()];
        if let Some(seed) = &options.seed {
            args.push("--seed".to_string());
            args.push(seed.clone());
        }
        if let Some(stdout) = &options.stdout {
            args.push("--stdout".to_string());
            args.push(stdout.to_string_lossy().into_owned());
        }
        if let Some(stderr) = &options.stderr {
            args.push("--stderr".to_string());
            args.push(stderr.to_string_lossy().into_owned());
        }
        args.push(name.to_string());

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(&args).await?;
        Ok(())
    }

    async fn stop(&self, name: &str) -> TurfResult<()> {
        let started = Instant::now();

        match self.run(&["stop", name]).await {
            Ok(_) => return Ok(()),
            Err(e) if e.is_gone() => return Ok(()),
            Err(e) if e.is_transient() => {
                debug!(%name, code = ?e.code(), "graceful stop busy, escalating to force");
            }
            Err(e) => return Err(e),
        }

        let mut last = None;
        for attempt in 1..=STOP_RETRIES {
            tokio::time::sleep(STOP_BACKOFF).await;
            match self.run(&["stop", "--force", name]).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_gone() => return Ok(()),
                Err(e) if e.is_transient() => {
                    warn!(%name, attempt, code = ?e.code(), "force stop still busy");
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
            if started.elapsed() > self.graceful_exit_period {
                break;
            }
        }

        Err(last.unwrap_or(TurfError::Command {
            command: format!("stop --force {name}"),
            code: None,
            stderr: "retries exhausted".to_string(),
        }))
    }

    async fn delete(&self, name: &str) -> TurfResult<()> {
        match self.run(&["delete", name]).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_gone() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn ps(&self) -> TurfResult<Vec<TurfProcess>> {
        let out = self.run(&["ps"]).await?;
        Ok(parse_ps(&out))
    }

    async fn state(&self, name: &str) -> TurfResult<Option<TurfStateRecord>> {
        match self.run(&["state", name]).await {
            Ok(out) => Ok(Some(parse_state(&out))),
            Err(e) if e.is_gone() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Parse `turf ps` output: one `<name> <pid> <status>` line per sandbox.
/// Malformed lines are dropped with a warning rather than failing the poll.
pub fn parse_ps(out: &str) -> Vec<TurfProcess> {
    let mut processes = Vec::new();
    for line in out.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(name), Some(pid), Some(status)) =
            (fields.next(), fields.next(), fields.next())
        else {
            warn!(%line, "malformed turf ps line");
            continue;
        };
        let Ok(pid) = pid.parse::<i32>() else {
            warn!(%line, "non-numeric pid in turf ps line");
            continue;
        };
        processes.push(TurfProcess {
            name: name.to_string(),
            pid,
            status: TurfState::parse(status),
        });
    }
    processes
}

/// Parse `turf state` output: `key: value` lines. `pid`, `stat.*` and
/// `rusage.*` values are numeric; everything else stays a string.
pub fn parse_state(out: &str) -> TurfStateRecord {
    let mut record = TurfStateRecord::default();
    for line in out.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        if key.is_empty() {
            continue;
        }

        let numeric = key == "pid" || key.starts_with("stat.") || key.starts_with("rusage.");
        let parsed = if numeric {
            match value.parse::<i64>() {
                Ok(v) => TurfValue::Int(v),
                Err(_) => TurfValue::Str(value.to_string()),
            }
        } else {
            TurfValue::Str(value.to_string())
        };
        record.values.insert(key.to_string(), parsed);
    }
    record
}
