//! silt-supervisor — client for the external `turf` sandbox supervisor.
//!
//! The control plane never touches sandboxed processes directly; it issues
//! commands (`create`, `start`, `stop`, `delete`) and queries (`ps`,
//! `state`) through the turf CLI. The [`Supervisor`] trait is the seam the
//! rest of the control plane programs against; [`TurfClient`] is the real
//! implementation, [`mock::MockSupervisor`] the scripted one for tests.

pub mod client;
pub mod error;
pub mod mock;
pub mod types;

pub use client::{StartOptions, Supervisor, TurfClient};
pub use error::{TurfError, TurfResult};
pub use types::{TurfProcess, TurfState, TurfStateRecord, TurfValue};
