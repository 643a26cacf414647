//! Error taxonomy for the pipeline core.
//!
//! `PipelineError` is the single error type that flows through operation
//! callbacks, bridges and the synchronous parsing/encoding APIs. It is
//! `Clone` because one failure can complete several operations at once (for
//! example every operation queued behind a failed connect).
//!
//! # Error Categories
//!
//! **Malformed input** (returned synchronously, never retried):
//! - `Format`: connection descriptor or token string is malformed
//! - `MalformedTopic`, `DuplicateProperty`: topic decoding failures
//! - `KeyNotFound`: indexed access to an absent descriptor key
//!
//! **Credential material** (fatal to the operation):
//! - `InvalidKey`, `Signing`
//!
//! **Connectivity** (delivered through operation callbacks):
//! - `NotConnected`, `ConnectionFailed`, `ConnectionDropped`: transient, retryable
//! - `OperationCancelled`: in-flight work abandoned by disconnect or shutdown
//! - `Credential`: token expired or rejected, drives re-authorization
//! - `Timeout`: an operation or a blocking wait ran out of time
//!
//! **Service responses**: `Service` wraps [`ServiceError`], mapped from a
//! status code.
//!
//! **Programming errors**: `MissingResultField`, `TargetGone`, `AlreadyResolved`,
//! `Pipeline`.
//!
//! # Usage
//!
//! ```ignore
//! match pipeline.run_blocking(OpKind::GetTwin, None) {
//!     Ok(output) => println!("twin: {:?}", output),
//!     Err(e) if e.is_retryable() => println!("transient failure: {e}"),
//!     Err(e) => return Err(e),
//! }
//! ```

use thiserror::Error;

/// The unified error type for pipeline operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PipelineError {
    /// A connection descriptor or token string could not be parsed.
    #[error("Format error: {0}")]
    Format(String),

    /// A topic string is missing the segments required for decoding.
    #[error("Malformed topic: {0}")]
    MalformedTopic(String),

    /// The same key appears twice in an encoded property section.
    #[error("Duplicate keys in response topic: {0}")]
    DuplicateProperty(String),

    /// Indexed access to a descriptor key that is not present.
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// The signing key is not valid base64.
    #[error("Invalid signing key: {0}")]
    InvalidKey(String),

    /// The HMAC primitive rejected the key/message combination.
    #[error("Signing failed: {0}")]
    Signing(String),

    /// The operation needs a connection and the pipeline is not connected.
    #[error("Operation requires a connection but the pipeline is not connected")]
    NotConnected,

    /// In-flight work was abandoned because of a disconnect or shutdown.
    #[error("Operation cancelled: {0}")]
    OperationCancelled(String),

    /// The credential was rejected, expired, or could not be produced.
    #[error("Credential error: {0}")]
    Credential(String),

    /// The transport could not establish a connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// An established connection was lost.
    #[error("Connection dropped: {0}")]
    ConnectionDropped(String),

    /// The operation did not complete in time.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The service answered with a failure status.
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// A callback expected a named result field that was not supplied.
    #[error("Callback was missing the expected result field '{0}'")]
    MissingResultField(String),

    /// The target of a weak callback no longer exists.
    #[error("Callback target is gone: {0}")]
    TargetGone(String),

    /// A single-assignment result was resolved twice.
    #[error("Result was already resolved")]
    AlreadyResolved,

    /// The awaitable bridge was created outside a runtime or its runtime is gone.
    #[error("No async runtime available: {0}")]
    NoRuntime(String),

    /// The configuration failed validation.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// An operation reached a point in the chain where nothing could handle it.
    #[error("Pipeline error: {0}")]
    Pipeline(String),
}

impl PipelineError {
    /// Returns true for transient failures that the retry stage may re-submit.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::NotConnected
                | PipelineError::ConnectionFailed(_)
                | PipelineError::ConnectionDropped(_)
                | PipelineError::Timeout(_)
        ) || matches!(self, PipelineError::Service(s) if s.is_retryable())
    }

    /// Returns true for failures that should move the connection into re-authorization.
    pub fn is_credential(&self) -> bool {
        matches!(
            self,
            PipelineError::Credential(_) | PipelineError::Service(ServiceError::Unauthorized(_))
        )
    }
}

/// Errors derived from a service status code.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ServiceError {
    #[error("Service returned 400 (argument error): {0}")]
    Argument(String),
    #[error("Service returned 401 (unauthorized): {0}")]
    Unauthorized(String),
    #[error("Service returned 403 (quota exceeded): {0}")]
    QuotaExceeded(String),
    #[error("Service returned 404 (not found): {0}")]
    NotFound(String),
    #[error("Service returned 408 (device timeout): {0}")]
    DeviceTimeout(String),
    #[error("Service returned 409 (already exists): {0}")]
    AlreadyExists(String),
    #[error("Service returned 412 (invalid etag): {0}")]
    InvalidEtag(String),
    #[error("Service returned 413 (message too large): {0}")]
    MessageTooLarge(String),
    #[error("Service returned 429 (throttling): {0}")]
    Throttling(String),
    #[error("Service returned 500 (internal service error): {0}")]
    InternalService(String),
    #[error("Service returned 502 (bad response): {0}")]
    BadResponse(String),
    #[error("Service returned 503 (service unavailable): {0}")]
    ServiceUnavailable(String),
    #[error("Service returned 504 (timeout): {0}")]
    Timeout(String),
    #[error("Service returned failed status code {code}: {message}")]
    FailedStatusCode { code: u16, message: String },
}

impl ServiceError {
    /// Maps a failed status code to its error.
    ///
    /// Codes outside the fixed table become `FailedStatusCode`.
    pub fn from_status(code: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            400 => ServiceError::Argument(message),
            401 => ServiceError::Unauthorized(message),
            403 => ServiceError::QuotaExceeded(message),
            404 => ServiceError::NotFound(message),
            408 => ServiceError::DeviceTimeout(message),
            409 => ServiceError::AlreadyExists(message),
            412 => ServiceError::InvalidEtag(message),
            413 => ServiceError::MessageTooLarge(message),
            429 => ServiceError::Throttling(message),
            500 => ServiceError::InternalService(message),
            502 => ServiceError::BadResponse(message),
            503 => ServiceError::ServiceUnavailable(message),
            504 => ServiceError::Timeout(message),
            code => ServiceError::FailedStatusCode { code, message },
        }
    }

    /// Returns `Ok(())` for success codes (below 300) and the mapped error otherwise.
    pub fn check_status(code: u16, message: impl Into<String>) -> Result<(), ServiceError> {
        if code < 300 {
            Ok(())
        } else {
            Err(Self::from_status(code, message))
        }
    }

    /// Throttling and transient server conditions can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServiceError::Throttling(_)
                | ServiceError::ServiceUnavailable(_)
                | ServiceError::Timeout(_)
        )
    }

    /// The status code this error was created from.
    pub fn status_code(&self) -> u16 {
        match self {
            ServiceError::Argument(_) => 400,
            ServiceError::Unauthorized(_) => 401,
            ServiceError::QuotaExceeded(_) => 403,
            ServiceError::NotFound(_) => 404,
            ServiceError::DeviceTimeout(_) => 408,
            ServiceError::AlreadyExists(_) => 409,
            ServiceError::InvalidEtag(_) => 412,
            ServiceError::MessageTooLarge(_) => 413,
            ServiceError::Throttling(_) => 429,
            ServiceError::InternalService(_) => 500,
            ServiceError::BadResponse(_) => 502,
            ServiceError::ServiceUnavailable(_) => 503,
            ServiceError::Timeout(_) => 504,
            ServiceError::FailedStatusCode { code, .. } => *code,
        }
    }
}
