//! Per-replica worker state.
//!
//! A worker's `ContainerStatus` only moves forward: Created → Ready →
//! PendingStop → Stopped, with Unknown as a sink reachable from anywhere.
//! Readiness is observed through a watch channel so any number of waiters
//! (in practice, the launch that registered the worker) can await the
//! settled outcome.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use silt_supervisor::{TurfProcess, TurfState};

use crate::error::ReadyError;
use crate::types::{ContainerReportEvent, WorkerActivity, WorkerStats};

/// Grace added on top of the profile's initialization timeout before the
/// ready wait gives up.
pub const INIT_GRACE: Duration = Duration::from_millis(100);

/// Worker lifecycle status. The derived ordering is the transition order;
/// updates that would move backwards are rejected.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum ContainerStatus {
    Created,
    Ready,
    PendingStop,
    Stopped,
    Unknown,
}

/// One sandboxed replica of a function.
pub struct Worker {
    name: String,
    credential: String,
    pid: Option<i32>,
    status: ContainerStatus,
    turf_state: Option<TurfState>,
    /// Last request counters observed from the data plane.
    data: Option<WorkerActivity>,
    register_time_ms: u64,
    register_instant: Instant,
    /// Registration sequence within the broker; breaks register-time ties
    /// for FIFO/FILO victim selection.
    seq: u64,
    init_timeout: Duration,
    disposable: bool,
    status_tx: watch::Sender<ContainerStatus>,
    /// Init watchdog armed at registration; aborted once the worker
    /// leaves Created.
    watchdog: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn new(
        name: impl Into<String>,
        credential: impl Into<String>,
        init_timeout: Duration,
        disposable: bool,
        seq: u64,
    ) -> Self {
        let (status_tx, _) = watch::channel(ContainerStatus::Created);
        Self {
            name: name.into(),
            credential: credential.into(),
            pid: None,
            status: ContainerStatus::Created,
            turf_state: None,
            data: None,
            register_time_ms: epoch_ms(),
            register_instant: Instant::now(),
            seq,
            init_timeout,
            disposable,
            status_tx,
            watchdog: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn credential(&self) -> &str {
        &self.credential
    }

    pub fn pid(&self) -> Option<i32> {
        self.pid
    }

    pub fn status(&self) -> ContainerStatus {
        self.status
    }

    pub fn turf_state(&self) -> Option<TurfState> {
        self.turf_state
    }

    pub fn data(&self) -> Option<WorkerActivity> {
        self.data
    }

    pub fn register_time_ms(&self) -> u64 {
        self.register_time_ms
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn disposable(&self) -> bool {
        self.disposable
    }

    pub fn init_timeout(&self) -> Duration {
        self.init_timeout
    }

    /// Deadline for the ready wait and the init watchdog.
    pub fn init_deadline(&self) -> Instant {
        self.register_instant + self.init_timeout + INIT_GRACE
    }

    /// Still waiting for its first `ContainerInstalled`.
    pub fn is_initializing(&self) -> bool {
        self.status == ContainerStatus::Created
    }

    /// Counts toward request capacity (Ready or draining).
    pub fn counts_capacity(&self) -> bool {
        matches!(
            self.status,
            ContainerStatus::Ready | ContainerStatus::PendingStop
        )
    }

    /// Not yet observed stopped or lost.
    pub fn is_live(&self) -> bool {
        self.status < ContainerStatus::Stopped
    }

    pub fn set_watchdog(&mut self, handle: JoinHandle<()>) {
        self.watchdog = Some(handle);
    }

    /// Advance the container status. Regressions under the transition
    /// ordering are rejected; returns whether the update was applied.
    pub fn update_container_status(
        &mut self,
        status: ContainerStatus,
        reason: &str,
    ) -> bool {
        if status < self.status {
            debug!(
                worker = %self.name,
                from = ?self.status,
                to = ?status,
                reason,
                "rejected status regression"
            );
            return false;
        }
        if status == self.status {
            return false;
        }

        let old = self.status;
        self.status = status;
        info!(
            worker = %self.name,
            from = ?old,
            to = ?status,
            reason,
            "worker status changed"
        );

        if old == ContainerStatus::Created {
            if let Some(watchdog) = self.watchdog.take() {
                watchdog.abort();
            }
        }

        let _ = self.status_tx.send(status);
        true
    }

    pub fn set_ready(&mut self) -> bool {
        self.update_container_status(ContainerStatus::Ready, "ready")
    }

    pub fn set_stopped(&mut self, reason: &str) -> bool {
        self.update_container_status(ContainerStatus::Stopped, reason)
    }

    /// Refresh the last-observed request counters; `None` clears them.
    pub fn sync(&mut self, stats: Option<&WorkerStats>) {
        self.data = stats.map(|s| WorkerActivity {
            max_activate_requests: s.max_activate_requests,
            active_request_count: s.active_request_count,
        });
    }

    /// Fold the supervisor's view of this sandbox into the status machine.
    /// `None` means the process was absent from `ps`.
    pub fn switch_to(&mut self, process: Option<&TurfProcess>) {
        let Some(process) = process else {
            self.turf_state = None;
            if self.status == ContainerStatus::Ready {
                self.set_stopped("sandbox disappeared");
            }
            return;
        };

        self.pid = Some(process.pid);
        self.turf_state = Some(process.status);

        match process.status {
            TurfState::Init
            | TurfState::Starting
            | TurfState::Cloning
            | TurfState::Running => {
                if self.status == ContainerStatus::Created
                    && self.register_instant.elapsed() > self.init_timeout
                {
                    self.set_stopped("connect timeout");
                }
            }
            TurfState::Stopping | TurfState::Stopped => {
                self.update_container_status(ContainerStatus::Stopped, "turf reports stopped");
            }
            TurfState::Unknown => {
                self.update_container_status(ContainerStatus::Unknown, "turf reports unknown");
            }
            // Seed-only state.
            TurfState::Forkwait => {}
        }
    }

    /// Apply an event-driven status report from the data plane.
    pub fn apply_report(&mut self, event: &ContainerReportEvent) {
        match event {
            ContainerReportEvent::ContainerInstalled => {
                self.set_ready();
            }
            ContainerReportEvent::RequestDrained
            | ContainerReportEvent::ContainerDisconnected => {
                self.set_stopped("container report");
            }
            ContainerReportEvent::Unrecognized => {
                warn!(worker = %self.name, "unrecognized container report event");
                self.update_container_status(ContainerStatus::Unknown, "unrecognized report");
            }
        }
    }

    /// A one-shot handle resolving when this worker settles: Ok at Ready,
    /// an error if it stops first or the init deadline passes.
    pub fn ready_waiter(&self) -> ReadyWaiter {
        ReadyWaiter {
            rx: self.status_tx.subscribe(),
            deadline: self.init_deadline(),
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.abort();
        }
    }
}

/// Awaits a worker's readiness outcome. Obtained at registration time;
/// waiting after the worker has settled returns the settled outcome.
#[derive(Debug)]
pub struct ReadyWaiter {
    rx: watch::Receiver<ContainerStatus>,
    deadline: Instant,
}

impl ReadyWaiter {
    pub async fn wait(mut self) -> Result<(), ReadyError> {
        loop {
            match *self.rx.borrow_and_update() {
                ContainerStatus::Ready => return Ok(()),
                ContainerStatus::Created => {}
                status => return Err(ReadyError::Stopped(status)),
            }

            let remaining = self.deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ReadyError::InitTimeout);
            }
            match tokio::time::timeout(remaining, self.rx.changed()).await {
                Ok(Ok(())) => {}
                // The worker was dropped before settling.
                Ok(Err(_)) => return Err(ReadyError::Stopped(ContainerStatus::Unknown)),
                Err(_) => return Err(ReadyError::InitTimeout),
            }
        }
    }
}

pub(crate) fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_worker() -> Worker {
        Worker::new("hello", "world", Duration::from_millis(50), false, 0)
    }

    fn running(pid: i32) -> TurfProcess {
        TurfProcess {
            name: "hello".to_string(),
            pid,
            status: TurfState::Running,
        }
    }

    #[test]
    fn status_ordering() {
        assert!(ContainerStatus::Created < ContainerStatus::Ready);
        assert!(ContainerStatus::Ready < ContainerStatus::PendingStop);
        assert!(ContainerStatus::PendingStop < ContainerStatus::Stopped);
        assert!(ContainerStatus::Stopped < ContainerStatus::Unknown);
    }

    #[test]
    fn regressions_are_rejected() {
        let mut worker = test_worker();
        assert!(worker.set_ready());
        assert!(!worker.update_container_status(ContainerStatus::Created, "regress"));
        assert_eq!(worker.status(), ContainerStatus::Ready);

        assert!(worker.set_stopped("done"));
        assert!(!worker.set_ready());
        assert_eq!(worker.status(), ContainerStatus::Stopped);
    }

    #[test]
    fn unknown_is_a_sink() {
        let mut worker = test_worker();
        assert!(worker.update_container_status(ContainerStatus::Unknown, "lost"));
        assert!(!worker.set_ready());
        assert!(!worker.set_stopped("late"));
        assert_eq!(worker.status(), ContainerStatus::Unknown);
    }

    #[test]
    fn switch_to_running_within_timeout_keeps_created() {
        let mut worker = test_worker();
        worker.switch_to(Some(&running(42)));
        assert_eq!(worker.status(), ContainerStatus::Created);
        assert_eq!(worker.pid(), Some(42));
        assert_eq!(worker.turf_state(), Some(TurfState::Running));
    }

    #[tokio::test]
    async fn switch_to_running_past_timeout_stops_created_worker() {
        let mut worker = Worker::new("hello", "world", Duration::from_millis(1), false, 0);
        tokio::time::sleep(Duration::from_millis(10)).await;
        worker.switch_to(Some(&running(42)));
        assert_eq!(worker.status(), ContainerStatus::Stopped);
    }

    #[test]
    fn switch_to_stopped_state() {
        let mut worker = test_worker();
        worker.set_ready();
        worker.switch_to(Some(&TurfProcess {
            name: "hello".to_string(),
            pid: 42,
            status: TurfState::Stopped,
        }));
        assert_eq!(worker.status(), ContainerStatus::Stopped);
    }

    #[test]
    fn switch_to_absent_process_only_fells_ready_workers() {
        let mut created = test_worker();
        created.switch_to(None);
        assert_eq!(created.status(), ContainerStatus::Created);

        let mut ready = test_worker();
        ready.set_ready();
        ready.switch_to(None);
        assert_eq!(ready.status(), ContainerStatus::Stopped);
    }

    #[test]
    fn switch_to_forkwait_is_a_noop() {
        let mut worker = test_worker();
        worker.set_ready();
        worker.switch_to(Some(&TurfProcess {
            name: "hello".to_string(),
            pid: 42,
            status: TurfState::Forkwait,
        }));
        assert_eq!(worker.status(), ContainerStatus::Ready);
    }

    #[test]
    fn report_events_map_to_statuses() {
        let mut worker = test_worker();
        worker.apply_report(&ContainerReportEvent::ContainerInstalled);
        assert_eq!(worker.status(), ContainerStatus::Ready);

        worker.apply_report(&ContainerReportEvent::RequestDrained);
        assert_eq!(worker.status(), ContainerStatus::Stopped);

        let mut other = test_worker();
        other.apply_report(&ContainerReportEvent::Unrecognized);
        assert_eq!(other.status(), ContainerStatus::Unknown);
    }

    #[test]
    fn sync_replaces_counters() {
        let mut worker = test_worker();
        worker.sync(Some(&WorkerStats {
            name: "hello".to_string(),
            active_request_count: 3,
            max_activate_requests: 10,
        }));
        assert_eq!(
            worker.data(),
            Some(WorkerActivity {
                max_activate_requests: 10,
                active_request_count: 3
            })
        );

        worker.sync(None);
        assert_eq!(worker.data(), None);
    }

    #[tokio::test]
    async fn waiter_resolves_on_ready() {
        let mut worker = Worker::new("hello", "world", Duration::from_secs(5), false, 0);
        let waiter = worker.ready_waiter();
        worker.set_ready();
        waiter.wait().await.unwrap();
    }

    #[tokio::test]
    async fn waiter_rejects_on_stop() {
        let mut worker = Worker::new("hello", "world", Duration::from_secs(5), false, 0);
        let waiter = worker.ready_waiter();
        worker.set_stopped("boom");
        let err = waiter.wait().await.unwrap_err();
        assert!(matches!(err, ReadyError::Stopped(ContainerStatus::Stopped)));
    }

    #[tokio::test]
    async fn waiter_rejects_on_deadline() {
        let worker = Worker::new("hello", "world", Duration::from_millis(10), false, 0);
        let waiter = worker.ready_waiter();
        let err = waiter.wait().await.unwrap_err();
        assert!(matches!(err, ReadyError::InitTimeout));
    }

    #[tokio::test]
    async fn waiter_after_settling_sees_outcome() {
        let mut worker = Worker::new("hello", "world", Duration::from_secs(5), false, 0);
        worker.set_ready();
        worker.ready_waiter().wait().await.unwrap();
    }
}
