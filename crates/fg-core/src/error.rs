use std::{io, time::Duration};
use thiserror::Error;

pub type Result<T, E = CoreError> = std::result::Result<T, E>;

/// Error taxonomy of the selection core.
///
/// Probe failures are recorded into telemetry and consumed silently by the
/// health checker; only operations whose caller can act on the failure
/// surface one of these. Selection itself never fails, it degrades.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("{0}: scheme not supported")]
    UnknownScheme(String),

    #[error("dial: {0}")]
    Dial(#[source] io::Error),

    #[error("transport: {0}")]
    Transport(String),

    #[error("timeout after {0:?}")]
    Timeout(Duration),

    #[error("parse: {0}")]
    Parse(String),

    #[error("provider has no endpoints")]
    EmptySet,

    #[error("endpoint {0} not found")]
    UnknownEndpoint(String),
}
