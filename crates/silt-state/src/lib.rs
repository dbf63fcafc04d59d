//! silt-state — the control plane's in-memory model.
//!
//! Three loosely-synchronized information sources meet here: declarative
//! function profiles ([`ProfileRegistry`]), per-worker request telemetry
//! from the data plane, and supervisor-side process state. The [`Snapshot`]
//! reconciles them into one picture: a [`Broker`] per (function, inspector)
//! pair, each owning its [`Worker`] replicas and their starting pool.

pub mod broker;
pub mod error;
pub mod events;
pub mod registry;
pub mod snapshot;
pub mod types;
pub mod worker;

pub use broker::{Broker, StartingPoolItem, WorkerHandle};
pub use error::{ProfileError, ReadyError, StateError, StateResult};
pub use events::{EventBus, WorkerStoppedEvent};
pub use registry::{ApplyMode, PresetHook, ProfileRegistry};
pub use snapshot::{BrokerDelta, BrokerSnapshot, Snapshot, SnapshotStats, WorkerSnapshot};
pub use types::*;
pub use worker::{ContainerStatus, ReadyWaiter, Worker};
