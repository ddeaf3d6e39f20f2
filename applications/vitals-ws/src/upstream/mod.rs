//! Outbound connection to a vital-signs provider
//!
//! Used when this process is itself the client: it dials a provider over
//! WebSocket, forwards readings into the local store and dispatcher, and
//! reconnects according to [`ReconnectPolicy`].

pub mod client;
pub mod policy;

pub use client::{spawn, UpstreamHandle, UpstreamStatus};
pub use policy::{ReconnectDecision, ReconnectPolicy};
