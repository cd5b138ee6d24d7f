//! Domain types and pure policy functions for the generation job engine.
//!
//! Everything in this crate is synchronous and free of I/O so it can be
//! shared by the provider bridge, the orchestration engine and tooling.

pub mod classification;
pub mod cooldown;
pub mod error;
pub mod job;
pub mod refund;
pub mod timeouts;
pub mod types;
