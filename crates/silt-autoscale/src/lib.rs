//! silt-autoscale — the capacity manager.
//!
//! One auto-scale cycle turns the brokers' water levels into concrete
//! actions: expansions bounded by the virtual memory budget, then shrinks
//! negotiated with the data plane before any sandbox is stopped.

pub mod manager;

pub use manager::CapacityManager;
