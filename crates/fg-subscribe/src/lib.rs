//! Provider document decoding.
//!
//! Endpoint providers periodically fetch a remote document describing their
//! proxy membership. Two formats exist in the wild: a structured YAML
//! document with a top-level `proxies` array, and bare share links, one per
//! line, often base64-wrapped. This crate turns either into a uniform list
//! of [`RawOutbound`] entries; turning those into live adapters is the
//! protocol layer's job.

pub mod model;
pub mod parse_clash;
pub mod parse_uris;

pub use model::{RawOutbound, SubsError};
