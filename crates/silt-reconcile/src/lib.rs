//! silt-reconcile — the periodic state reconciler.
//!
//! Every tick pulls the supervisor's process table and the latest
//! data-plane stats into the snapshot, then reaps workers that stopped or
//! were lost. Each step is individually guarded: one failing source never
//! halts reconciliation.

pub mod reconciler;

pub use reconciler::Reconciler;
