//! HTTP API gateway for the VirtualBox fleet provider.
//!
//! Accepts environment declarations from the orchestrator and drives the
//! provider's bring-up, teardown, reporting, image export and volume
//! destruction.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod declaration;
pub mod error;
pub mod routes;
pub mod state;
