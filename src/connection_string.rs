//! Connection descriptor parsing.
//!
//! A descriptor is a `Key=Value;Key=Value` string over a fixed key set. Parsing
//! validates the whole string up front; the result is immutable and keeps the
//! original text, which is what `Display` returns.
//!
//! Accepted authentication combinations:
//! - `HostName` + `SharedAccessKeyName` + `SharedAccessKey` (service policy)
//! - `HostName` + `DeviceId` + `SharedAccessKey` (device key)
//! - `HostName` + `DeviceId` + `x509` (certificate)
//!
//! `SharedAccessKey` and `x509` are mutually exclusive.
//!
//! # Examples
//!
//! ```ignore
//! use devicelink::connection_string::{ConnectionDescriptor, DEVICE_ID};
//!
//! let descriptor: ConnectionDescriptor = "HostName=h;DeviceId=d;SharedAccessKey=Zm9v".parse()?;
//! assert_eq!(descriptor.require(DEVICE_ID)?, "d");
//! assert_eq!(descriptor.to_string(), "HostName=h;DeviceId=d;SharedAccessKey=Zm9v");
//! ```

use std::{collections::HashMap, fmt, str::FromStr};

use crate::error::PipelineError;

pub const HOST_NAME: &str = "HostName";
pub const SHARED_ACCESS_KEY_NAME: &str = "SharedAccessKeyName";
pub const SHARED_ACCESS_KEY: &str = "SharedAccessKey";
pub const SHARED_ACCESS_SIGNATURE: &str = "SharedAccessSignature";
pub const DEVICE_ID: &str = "DeviceId";
pub const MODULE_ID: &str = "ModuleId";
pub const GATEWAY_HOST_NAME: &str = "GatewayHostName";
pub const X509: &str = "x509";

const VALID_KEYS: [&str; 8] = [
    HOST_NAME,
    SHARED_ACCESS_KEY_NAME,
    SHARED_ACCESS_KEY,
    SHARED_ACCESS_SIGNATURE,
    DEVICE_ID,
    MODULE_ID,
    GATEWAY_HOST_NAME,
    X509,
];

/// A validated, immutable connection descriptor.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    original: String,
    values: HashMap<String, String>,
}

impl ConnectionDescriptor {
    /// Parses and validates `s`.
    ///
    /// # Errors
    ///
    /// `Format` when a segment has no `=`, a key repeats, a key is unknown,
    /// the key combination is incomplete, or both `SharedAccessKey` and
    /// `x509` are present.
    pub fn parse(s: &str) -> Result<Self, PipelineError> {
        let segments: Vec<&str> = s.split(';').collect();
        let mut values = HashMap::with_capacity(segments.len());
        for segment in &segments {
            let (key, value) = segment.split_once('=').ok_or_else(|| {
                PipelineError::Format("Invalid connection string: unable to parse".into())
            })?;
            values.insert(key.to_string(), value.to_string());
        }

        // A repeated key collapses into one map entry.
        if values.len() != segments.len() {
            return Err(PipelineError::Format(
                "Invalid connection string: duplicate key".into(),
            ));
        }

        let descriptor = Self {
            original: s.to_string(),
            values,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    fn validate(&self) -> Result<(), PipelineError> {
        if let Some(key) = self.values.keys().find(|k| !VALID_KEYS.contains(&k.as_str())) {
            return Err(PipelineError::Format(format!(
                "Invalid connection string: invalid key '{key}'"
            )));
        }

        let has = |key: &str| self.values.contains_key(key);
        if has(SHARED_ACCESS_KEY) && has(X509) {
            return Err(PipelineError::Format(
                "Invalid connection string: mixed authentication scheme".into(),
            ));
        }

        let device_auth = has(DEVICE_ID) && (has(SHARED_ACCESS_KEY) || has(X509));
        let policy_auth = has(SHARED_ACCESS_KEY) && has(SHARED_ACCESS_KEY_NAME);
        if !(has(HOST_NAME) && (device_auth || policy_auth)) {
            return Err(PipelineError::Format(
                "Invalid connection string: incomplete".into(),
            ));
        }
        Ok(())
    }

    /// Looks up `key`, returning `None` when absent.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Looks up `key`, falling back to `default`. Never fails.
    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// Indexed access.
    ///
    /// # Errors
    ///
    /// `KeyNotFound` when `key` is absent.
    pub fn require(&self, key: &str) -> Result<&str, PipelineError> {
        self.get(key)
            .ok_or_else(|| PipelineError::KeyNotFound(key.to_string()))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// True when the descriptor selects certificate authentication.
    pub fn uses_x509(&self) -> bool {
        self.get(X509)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }
}

impl FromStr for ConnectionDescriptor {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&str> = self.values.keys().map(String::as_str).collect();
        keys.sort_unstable();
        f.debug_struct("ConnectionDescriptor")
            .field("keys", &keys)
            .finish()
    }
}
