//! Adaptive upstream selection core.
//!
//! Keeps continuously updated per-endpoint health and performance telemetry
//! and picks the best endpoint for each outgoing connection from named
//! groups, with at most one concurrent selection computation per group.
//!
//! The crate is deliberately protocol-agnostic: tunnels are opened through
//! opaque [`adapter::EndpointAdapter`] capabilities supplied by the protocol
//! layer. What lives here is the measurement plane (delay and throughput
//! probes with bounded history), the provider lifecycle (fetched or static
//! endpoint sets with versioning and health checking), and the URL-test
//! group selector with its single-flight memo.

pub mod adapter;
pub mod error;
pub mod health;
pub mod history;
pub mod net;
pub mod outbound;
pub mod provider;
pub mod types;
pub mod util;

pub use error::{CoreError, Result};
