//! gproxy core
//!
//! Shared foundation for all gproxy crates: process configuration,
//! the error taxonomy used across every channel, and the field
//! encryption manager.

pub mod config;
pub mod encryption;
pub mod error;

pub use config::{EnvNames, ProxyConfig};
pub use encryption::EncryptionManager;
pub use error::{FieldError, ProxyError, Result};

/// A database record or request parameter map.
///
/// Records flow through the whole pipeline as JSON maps: adapters
/// produce them from rows, tables encode/decode them, endpoints
/// validate them against method descriptors.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Build a [`Record`] from `(key, value)` pairs.
///
/// Convenience for tests and internal construction:
///
/// ```
/// use gproxy_core::record;
/// use serde_json::json;
///
/// let rec = record([("id", json!("acme")), ("active", json!(true))]);
/// assert_eq!(rec.get("id").unwrap(), "acme");
/// ```
pub fn record<I>(pairs: I) -> Record
where
    I: IntoIterator<Item = (&'static str, serde_json::Value)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}
