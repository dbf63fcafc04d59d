//! silt-dataplane — the control plane's view of its data planes.
//!
//! The data plane terminates client requests and routes them to workers;
//! the control plane consumes its worker-stats broadcasts and container
//! status reports, and asks it to confirm capacity reductions before
//! sandboxes are stopped. Transport wiring lives outside this crate; the
//! [`DataPlaneClient`] trait is the seam.

pub mod client;
pub mod hub;
pub mod mock;

pub use client::{
    DataPlaneClient, ReduceCapacityBroker, ReduceCapacityRequest, ReduceCapacityResponse,
};
pub use hub::DataPlaneHub;
pub use mock::MockDataPlane;
