use thiserror::Error;

#[derive(Debug, Error)]
pub enum SubsError {
    #[error("fetch error: {0}")]
    Fetch(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("document contains no usable entries")]
    Empty,
    #[error("unsupported")]
    Unsupported,
}

/// One decoded proxy entry, before any protocol-specific interpretation.
///
/// `params` keeps the full mapping so the adapter layer can pull whatever
/// protocol fields it needs; `name` and `kind` are hoisted because every
/// consumer filters and dispatches on them.
#[derive(Debug, Clone)]
pub struct RawOutbound {
    pub name: String,
    pub kind: String,
    pub params: serde_yaml::Mapping,
}

impl RawOutbound {
    /// String-typed parameter lookup, for the common case.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }

    pub fn param_u64(&self, key: &str) -> Option<u64> {
        self.params.get(key).and_then(|v| v.as_u64())
    }
}
