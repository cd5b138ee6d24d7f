//! Generation provider boundary.
//!
//! Defines the [`GenerationProvider`] trait the engine submits jobs
//! through, strict decoding of raw provider events into
//! [`messages::ProviderEvent`], and a concrete [`remote::RemoteProvider`]
//! that talks to a provider over REST and a WebSocket event stream.

pub mod api;
pub mod channels;
pub mod client;
pub mod config;
pub mod messages;
pub mod processor;
pub mod provider;
pub mod reconnect;
pub mod remote;

pub use messages::{DecodeError, EventKind, ProviderEvent};
pub use provider::{CancelTarget, GenerationProvider, JobHandle, ProviderError};
