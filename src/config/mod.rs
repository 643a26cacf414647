//! Pipeline configuration loading, validation, and credentials.
//!
//! [`PipelineConfig`] holds everything about *where* and *how* to connect.
//! It is plain data: serializable, loadable from TOML, and validated with the
//! `validator` crate. The secret half lives in [`Credential`], attached
//! separately so exactly one authentication scheme is present by
//! construction: a SAS token manager or an X.509 certificate, never both.
//!
//! # Examples
//!
//! ```toml
//! hostname = "myhub.azure-devices.net"
//! device_id = "sensor-17"
//! keep_alive = 60
//! cipher = ["ecdhe_rsa_aes128_gcm_sha256", "ecdhe_rsa_aes256_gcm_sha384"]
//!
//! [retry]
//! initial_delay_ms = 500
//! max_elapsed_secs = 120
//! ```
//!
//! ```ignore
//! let descriptor: ConnectionDescriptor = std::env::var("DEVICE_CONNECTION_STRING")?.parse()?;
//! let (config, credential) = PipelineConfig::from_descriptor(&descriptor, None)?;
//! ```

use std::{
    fmt,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info};
use validator::{Validate, ValidationError};

use crate::{
    connection_string::{
        ConnectionDescriptor, DEVICE_ID, GATEWAY_HOST_NAME, HOST_NAME, MODULE_ID,
        SHARED_ACCESS_KEY, SHARED_ACCESS_KEY_NAME,
    },
    error::PipelineError,
    sastoken::SasTokenManager,
    signer::SymmetricKeySigner,
};

pub mod logger;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV_VAR: &str = "DEVICELINK_CONFIG";

/// Errors that can occur during configuration loading, parsing, or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Generic configuration-related error with a descriptive message.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error while accessing configuration files.
    #[error("IO error while reading configuration: {0}")]
    IoError(#[from] std::io::Error),

    /// Failure to parse the TOML configuration.
    #[error("Parse error while reading configuration: {0}")]
    ParseError(String),

    /// Validation failure after successful parsing.
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Failure to serialize a configuration back to TOML.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<ConfigError> for PipelineError {
    fn from(err: ConfigError) -> Self {
        PipelineError::Config(err.to_string())
    }
}

/// Connection and policy settings for one device or module identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PipelineConfig {
    /// Hub hostname, e.g. `myhub.azure-devices.net`.
    #[validate(length(min = 1, max = 253, message = "Hostname must be between 1 and 253 characters"))]
    pub hostname: String,

    /// Edge gateway to connect through instead of `hostname`.
    pub gateway_hostname: Option<String>,

    #[validate(length(min = 1, max = 128, message = "Device id must be between 1 and 128 characters"))]
    pub device_id: String,

    pub module_id: Option<String>,

    /// Appended to the user agent reported on connect.
    pub product_info: String,

    /// PEM trust bundle for the server certificate, when not using system roots.
    pub server_verification_cert: Option<String>,

    /// Tunnel the protocol over websockets.
    pub websockets: bool,

    /// OpenSSL-style cipher list. A TOML string or array is accepted; arrays
    /// are joined with `:`. Stored upper-case with `_` replaced by `-`.
    #[serde(deserialize_with = "deserialize_cipher")]
    pub cipher: String,

    #[validate(nested)]
    pub proxy: Option<ProxyOptions>,

    /// Keep-alive interval in seconds.
    #[validate(range(min = 1, max = 1740, message = "keep_alive must be between 1 and 1740 seconds"))]
    pub keep_alive: u64,

    /// Connect automatically before operations that need a connection.
    pub auto_connect: bool,

    /// Reconnect automatically after an unexpected drop.
    pub connection_retry: bool,

    /// Seconds to wait before the first automatic reconnect.
    #[validate(range(min = 1, message = "connection_retry_interval must be at least 1 second"))]
    pub connection_retry_interval: u64,

    /// Retry policy for failed operations.
    #[validate(nested)]
    pub retry: RetryConfig,

    /// Seconds before subscribe/unsubscribe operations time out.
    #[validate(range(min = 1, max = 3600, message = "operation_timeout must be between 1 and 3600 seconds"))]
    pub operation_timeout: u64,

    /// Lifetime of locally signed SAS tokens, in seconds.
    #[validate(range(min = 1, message = "sastoken_ttl must be at least 1 second"))]
    pub sastoken_ttl: u64,

    /// Seconds before token expiry at which renewal runs.
    pub sastoken_renewal_margin: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            gateway_hostname: None,
            device_id: String::new(),
            module_id: None,
            product_info: String::new(),
            server_verification_cert: None,
            websockets: false,
            cipher: String::new(),
            proxy: None,
            keep_alive: 60,
            auto_connect: true,
            connection_retry: true,
            connection_retry_interval: 10,
            retry: RetryConfig::default(),
            operation_timeout: 10,
            sastoken_ttl: 3600,
            sastoken_renewal_margin: 120,
        }
    }
}

impl PipelineConfig {
    /// Default settings for a device identity.
    pub fn for_device(hostname: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            device_id: device_id.into(),
            ..Default::default()
        }
    }

    /// Locates and loads the configuration file named by `DEVICELINK_CONFIG`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_ENV_VAR)
            .map(PathBuf::from)
            .map_err(|_| ConfigError::Config(format!("{CONFIG_ENV_VAR} is not set")))?;
        Self::load(&path)
    }

    /// Loads and validates configuration from `path`.
    ///
    /// # Errors
    ///
    /// Propagates IO, parsing, and validation errors as `ConfigError`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        info!(path = %path.display(), "Loading pipeline configuration");
        if !path.exists() {
            return Err(ConfigError::Config(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig =
            toml::from_str(text).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.check()?;
        debug!(hostname = %config.hostname, device_id = %config.device_id, "Configuration parsed");
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::SerializationError(e.to_string()))
    }

    /// Runs field validation plus the cross-field rules.
    pub fn check(&self) -> Result<(), ConfigError> {
        self.validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        if self.retry.max_delay_ms < self.retry.initial_delay_ms {
            return Err(ConfigError::ValidationError(
                "retry.max_delay_ms must not be less than retry.initial_delay_ms".into(),
            ));
        }
        Ok(())
    }

    /// Builds configuration and credential from a parsed connection descriptor.
    ///
    /// `x509` must be supplied exactly when the descriptor selects `x509=true`.
    ///
    /// # Errors
    ///
    /// - `Config` when the descriptor has no device identity, or the
    ///   certificate and key schemes conflict
    /// - `InvalidKey` when the shared access key is not base64
    pub fn from_descriptor(
        descriptor: &ConnectionDescriptor,
        x509: Option<X509Credential>,
    ) -> Result<(Self, Credential), PipelineError> {
        let mut config = Self::for_device(
            descriptor.require(HOST_NAME)?,
            descriptor.get(DEVICE_ID).ok_or_else(|| {
                PipelineError::Config("connection string does not name a device".into())
            })?,
        );
        config.module_id = descriptor.get(MODULE_ID).map(str::to_string);
        config.gateway_hostname = descriptor.get(GATEWAY_HOST_NAME).map(str::to_string);

        let credential = match (descriptor.get(SHARED_ACCESS_KEY), x509) {
            (Some(_), Some(_)) => {
                return Err(PipelineError::Config(
                    "One of either 'sastoken' or 'x509' must be provided, not both".into(),
                ))
            }
            (Some(key), None) => {
                let signer = Arc::new(SymmetricKeySigner::new(key)?);
                let manager = SasTokenManager::signed(
                    &config.resource_uri(),
                    signer,
                    descriptor.get(SHARED_ACCESS_KEY_NAME),
                    config.sastoken_ttl(),
                )?;
                Credential::SasToken(Arc::new(manager))
            }
            (None, Some(cert)) if descriptor.uses_x509() => Credential::X509(cert),
            (None, _) => {
                return Err(PipelineError::Config(
                    "One of either 'sastoken' or 'x509' must be provided".into(),
                ))
            }
        };
        config
            .check()
            .map_err(|e| PipelineError::Config(e.to_string()))?;
        Ok((config, credential))
    }

    /// Host the transport should connect to: the gateway when set.
    pub fn connect_hostname(&self) -> &str {
        self.gateway_hostname.as_deref().unwrap_or(&self.hostname)
    }

    /// Resource URI that SAS tokens for this identity are scoped to.
    pub fn resource_uri(&self) -> String {
        match &self.module_id {
            Some(module_id) => format!("{}/devices/{}/modules/{}", self.hostname, self.device_id, module_id),
            None => format!("{}/devices/{}", self.hostname, self.device_id),
        }
    }

    /// MQTT client id: `device` or `device/module`.
    pub fn client_id(&self) -> String {
        match &self.module_id {
            Some(module_id) => format!("{}/{}", self.device_id, module_id),
            None => self.device_id.clone(),
        }
    }

    /// MQTT username: `<host>/<client id>/?api-version=...`.
    pub fn username(&self) -> String {
        let mut username = format!(
            "{}/{}/?api-version={}&DeviceClientType={}",
            self.hostname,
            self.client_id(),
            crate::IOTHUB_API_VERSION,
            crate::encoding::quote(&self.user_agent())
        );
        if let Some(module_id) = &self.module_id {
            if self.gateway_hostname.is_some() {
                username.push_str(&format!("&x-ms-edge-moduleId={module_id}"));
            }
        }
        username
    }

    pub fn user_agent(&self) -> String {
        format!("{}{}", crate::USER_AGENT, self.product_info)
    }

    /// Replaces the cipher list with the normalized join of `ciphers`.
    pub fn with_ciphers<S: AsRef<str>>(mut self, ciphers: &[S]) -> Self {
        let joined = ciphers.iter().map(AsRef::as_ref).collect::<Vec<_>>().join(":");
        self.cipher = normalize_cipher(&joined);
        self
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive)
    }

    pub fn connection_retry_interval(&self) -> Duration {
        Duration::from_secs(self.connection_retry_interval)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout)
    }

    pub fn sastoken_ttl(&self) -> Duration {
        Duration::from_secs(self.sastoken_ttl)
    }

    pub fn sastoken_renewal_margin(&self) -> Duration {
        Duration::from_secs(self.sastoken_renewal_margin)
    }
}

/// Upper-cases a cipher list and replaces `_` with `-`.
pub fn normalize_cipher(cipher: &str) -> String {
    cipher.to_uppercase().replace('_', "-")
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CipherInput {
    One(String),
    Many(Vec<String>),
}

fn deserialize_cipher<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let joined = match CipherInput::deserialize(deserializer)? {
        CipherInput::One(s) => s,
        CipherInput::Many(list) => list.join(":"),
    };
    Ok(normalize_cipher(&joined))
}

/// Exponential backoff with jitter for retrying failed operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RetryConfig {
    /// Retry operations that fail with a transient error.
    pub enabled: bool,

    #[validate(range(min = 1, message = "initial_delay_ms must be at least 1"))]
    pub initial_delay_ms: u64,

    #[validate(range(min = 1, message = "max_delay_ms must be at least 1"))]
    pub max_delay_ms: u64,

    /// Growth factor applied after each attempt.
    #[validate(range(min = 1.0, max = 10.0, message = "multiplier must be between 1.0 and 10.0"))]
    pub multiplier: f64,

    /// Fraction of each delay randomized away, `0.0..=1.0`.
    #[validate(range(min = 0.0, max = 1.0, message = "jitter must be between 0.0 and 1.0"))]
    pub jitter: f64,

    /// Total time an operation may spend retrying before its last error is surfaced.
    #[validate(range(min = 1, message = "max_elapsed_secs must be at least 1"))]
    pub max_elapsed_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            jitter: 0.2,
            max_elapsed_secs: 300,
        }
    }
}

/// Proxy protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
    Http,
    Socks4,
    Socks5,
}

/// Proxy settings handed through to the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ProxyOptions {
    pub proxy_type: ProxyType,

    #[validate(length(min = 1, message = "Proxy address must not be empty"))]
    pub proxy_address: String,

    #[validate(range(min = 1, message = "Proxy port must be between 1 and 65535"))]
    pub proxy_port: u16,

    #[serde(default)]
    pub proxy_username: Option<String>,

    #[serde(default)]
    #[validate(custom(function = "validate_not_blank"))]
    pub proxy_password: Option<String>,
}

fn validate_not_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new("blank").with_message("Value must not be blank".into()));
    }
    Ok(())
}

/// An X.509 client certificate.
#[derive(Clone, PartialEq)]
pub struct X509Credential {
    pub certificate_file: PathBuf,
    pub key_file: PathBuf,
    pub pass_phrase: Option<String>,
}

impl X509Credential {
    pub fn new(certificate_file: impl Into<PathBuf>, key_file: impl Into<PathBuf>) -> Self {
        Self {
            certificate_file: certificate_file.into(),
            key_file: key_file.into(),
            pass_phrase: None,
        }
    }
}

impl fmt::Debug for X509Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("X509Credential")
            .field("certificate_file", &self.certificate_file)
            .field("key_file", &self.key_file)
            .field("pass_phrase", &self.pass_phrase.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// The authentication scheme: exactly one of a SAS token or an X.509 certificate.
#[derive(Debug, Clone)]
pub enum Credential {
    SasToken(Arc<SasTokenManager>),
    X509(X509Credential),
}

impl Credential {
    /// Wraps a user-supplied `SharedAccessSignature` string.
    pub fn from_sastoken_string(token: &str) -> Result<Self, PipelineError> {
        Ok(Credential::SasToken(Arc::new(SasTokenManager::fixed(token)?)))
    }

    pub fn sastoken(&self) -> Option<&Arc<SasTokenManager>> {
        match self {
            Credential::SasToken(manager) => Some(manager),
            Credential::X509(_) => None,
        }
    }

    /// Password to present on connect: the current token, if any.
    pub fn password(&self) -> Option<String> {
        self.sastoken().map(|manager| manager.token_string())
    }
}
