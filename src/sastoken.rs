//! Shared access signature tokens and their lifecycle.
//!
//! A [`SasToken`] is an immutable value: resource URI, expiry, optional key
//! name and signature. [`SasTokenManager`] owns the *current* token and swaps
//! in a freshly signed one on [`refresh`](SasTokenManager::refresh). Readers
//! take an `Arc` snapshot under a read lock that is only held for the pointer
//! copy, so a refresh in progress never blocks them and never exposes a
//! half-built token.
//!
//! Three origins are supported:
//! - **Signed**: a resource URI plus a [`Signer`]; refresh re-signs locally.
//! - **Generated**: an external [`TokenSource`] (for example a hardware
//!   security module). Failures surface as `Credential` errors and are not
//!   retried here.
//! - **Fixed**: a `SharedAccessSignature` string supplied by the user. It
//!   cannot be refreshed.
//!
//! # Token format
//!
//! ```text
//! SharedAccessSignature sr=<encoded-uri>&sig=<encoded-sig>&se=<expiry>[&skn=<key-name>]
//! ```
//!
//! # Examples
//!
//! ```ignore
//! use std::{sync::Arc, time::Duration};
//! use devicelink::{sastoken::SasTokenManager, signer::SymmetricKeySigner};
//!
//! let signer = Arc::new(SymmetricKeySigner::new(key)?);
//! let manager = SasTokenManager::signed("hub.net/devices/dev1", signer, None, Duration::from_secs(3600))?;
//! let header = manager.token_string();
//! manager.refresh()?;
//! ```

use std::{
    fmt,
    str::FromStr,
    sync::{Arc, Mutex, PoisonError, RwLock},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tracing::{debug, instrument};

use crate::{
    encoding::{quote, unquote},
    error::PipelineError,
    signer::Signer,
};

/// Default token lifetime.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(3600);

/// Default time before expiry at which a renewal is scheduled.
pub const DEFAULT_RENEWAL_MARGIN: Duration = Duration::from_secs(120);

const TOKEN_PREFIX: &str = "SharedAccessSignature ";

/// Seconds since the Unix epoch.
pub(crate) fn epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// An immutable shared access signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SasToken {
    /// Resource URI, already percent-encoded.
    resource_uri: String,
    /// Raw base64 signature (not url-encoded).
    signature: String,
    /// Expiry in epoch seconds.
    expiry: u64,
    key_name: Option<String>,
}

impl SasToken {
    /// Builds a token by signing `quote(uri) + "\n" + expiry`.
    pub fn sign(
        uri: &str,
        signer: &dyn Signer,
        key_name: Option<&str>,
        expiry: u64,
    ) -> Result<Self, PipelineError> {
        let resource_uri = quote(uri);
        let message = format!("{resource_uri}\n{expiry}");
        let signature = signer.sign(message.as_bytes())?;
        Ok(Self {
            resource_uri,
            signature,
            expiry,
            key_name: key_name.map(str::to_string),
        })
    }

    pub fn resource_uri(&self) -> &str {
        &self.resource_uri
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn expiry(&self) -> u64 {
        self.expiry
    }

    pub fn key_name(&self) -> Option<&str> {
        self.key_name.as_deref()
    }

    /// Time left before the token expires, zero once expired.
    pub fn remaining(&self) -> Duration {
        Duration::from_secs(self.expiry.saturating_sub(epoch_seconds()))
    }
}

impl fmt::Display for SasToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{TOKEN_PREFIX}sr={}&sig={}&se={}",
            self.resource_uri,
            quote(&self.signature),
            self.expiry
        )?;
        if let Some(key_name) = &self.key_name {
            write!(f, "&skn={key_name}")?;
        }
        Ok(())
    }
}

impl FromStr for SasToken {
    type Err = PipelineError;

    /// Parses a `SharedAccessSignature ...` string.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s
            .strip_prefix(TOKEN_PREFIX)
            .ok_or_else(|| PipelineError::Format("Invalid SasToken string: missing prefix".into()))?;

        let (mut resource_uri, mut signature, mut expiry, mut key_name) = (None, None, None, None);
        for part in body.split('&') {
            let (key, value) = part.split_once('=').ok_or_else(|| {
                PipelineError::Format(format!("Invalid SasToken string: segment '{part}'"))
            })?;
            let slot = match key {
                "sr" => &mut resource_uri,
                "sig" => &mut signature,
                "se" => &mut expiry,
                "skn" => &mut key_name,
                other => {
                    return Err(PipelineError::Format(format!(
                        "Invalid SasToken string: unknown field '{other}'"
                    )))
                }
            };
            if slot.replace(value.to_string()).is_some() {
                return Err(PipelineError::Format(format!(
                    "Invalid SasToken string: duplicate field '{key}'"
                )));
            }
        }

        let (Some(resource_uri), Some(signature), Some(expiry)) = (resource_uri, signature, expiry)
        else {
            return Err(PipelineError::Format(
                "Invalid SasToken string: sr, sig and se are required".into(),
            ));
        };
        let expiry = expiry
            .parse::<u64>()
            .map_err(|e| PipelineError::Format(format!("Invalid SasToken expiry: {e}")))?;

        Ok(Self {
            resource_uri,
            signature: unquote(&signature),
            expiry,
            key_name,
        })
    }
}

/// An external producer of tokens.
///
/// Errors are reported to the renewal path as `Credential` errors; the
/// manager does not retry them.
pub trait TokenSource: Send + Sync {
    fn generate(&self, ttl: Duration) -> Result<SasToken, PipelineError>;
}

enum TokenOrigin {
    Signed {
        uri: String,
        signer: Arc<dyn Signer>,
        key_name: Option<String>,
    },
    Generated(Arc<dyn TokenSource>),
    Fixed,
}

/// Owns the current token and replaces it atomically on refresh.
pub struct SasTokenManager {
    origin: TokenOrigin,
    ttl: Duration,
    current: RwLock<Arc<SasToken>>,
    refresh_lock: Mutex<()>,
}

impl SasTokenManager {
    /// Creates a manager that signs tokens locally.
    pub fn signed(
        uri: &str,
        signer: Arc<dyn Signer>,
        key_name: Option<&str>,
        ttl: Duration,
    ) -> Result<Self, PipelineError> {
        let expiry = epoch_seconds() + ttl.as_secs();
        let token = SasToken::sign(uri, signer.as_ref(), key_name, expiry)?;
        Ok(Self::with_origin(
            TokenOrigin::Signed {
                uri: uri.to_string(),
                signer,
                key_name: key_name.map(str::to_string),
            },
            ttl,
            token,
        ))
    }

    /// Creates a manager backed by an external token source.
    pub fn generated(source: Arc<dyn TokenSource>, ttl: Duration) -> Result<Self, PipelineError> {
        let token = source.generate(ttl).map_err(into_credential)?;
        Ok(Self::with_origin(TokenOrigin::Generated(source), ttl, token))
    }

    /// Wraps a user-supplied token string. The result cannot be refreshed.
    pub fn fixed(token: &str) -> Result<Self, PipelineError> {
        let token: SasToken = token.parse()?;
        let ttl = token.remaining();
        Ok(Self::with_origin(TokenOrigin::Fixed, ttl, token))
    }

    fn with_origin(origin: TokenOrigin, ttl: Duration, token: SasToken) -> Self {
        Self {
            origin,
            ttl,
            current: RwLock::new(Arc::new(token)),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Snapshot of the current token.
    pub fn current(&self) -> Arc<SasToken> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The current token in wire format.
    pub fn token_string(&self) -> String {
        self.current().to_string()
    }

    pub fn expiry(&self) -> u64 {
        self.current().expiry()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Fixed tokens cannot be renewed; the other origins can.
    pub fn is_renewable(&self) -> bool {
        !matches!(self.origin, TokenOrigin::Fixed)
    }

    /// Produces a new token and swaps it in.
    ///
    /// Expiry is `now + ttl`, bumped past the previous expiry so successive
    /// refreshes always move it forward.
    ///
    /// # Errors
    ///
    /// - `Signing` / `InvalidKey` from a local signer
    /// - `Credential` from an external source, or when the token is fixed
    #[instrument(skip(self), level = "debug")]
    pub fn refresh(&self) -> Result<Arc<SasToken>, PipelineError> {
        let _guard = self
            .refresh_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let previous = self.current().expiry();

        let token = match &self.origin {
            TokenOrigin::Signed {
                uri,
                signer,
                key_name,
            } => {
                let expiry = (epoch_seconds() + self.ttl.as_secs()).max(previous + 1);
                SasToken::sign(uri, signer.as_ref(), key_name.as_deref(), expiry)?
            }
            TokenOrigin::Generated(source) => source.generate(self.ttl).map_err(into_credential)?,
            TokenOrigin::Fixed => {
                return Err(PipelineError::Credential(
                    "a user-supplied SAS token cannot be renewed".into(),
                ))
            }
        };

        let token = Arc::new(token);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&token);
        debug!(expiry = token.expiry(), "SAS token refreshed");
        Ok(token)
    }

    /// Delay until the renewal should run: `expiry - margin - now`.
    ///
    /// # Errors
    ///
    /// - `Config` when the configured lifetime is shorter than the margin
    /// - `Credential` when the current token already expires within the
    ///   margin, as a short-lived token from a [`TokenSource`] would
    pub fn renewal_delay(&self, margin: Duration) -> Result<Duration, PipelineError> {
        if self.ttl < margin {
            return Err(PipelineError::Config(format!(
                "SAS token ttl ({}s) is shorter than the renewal margin ({}s)",
                self.ttl.as_secs(),
                margin.as_secs()
            )));
        }
        let remaining = self.current().remaining();
        if remaining <= margin {
            return Err(PipelineError::Credential(format!(
                "SAS token expires in {}s, within the renewal margin ({}s)",
                remaining.as_secs(),
                margin.as_secs()
            )));
        }
        Ok(remaining - margin)
    }
}

impl fmt::Debug for SasTokenManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let origin = match self.origin {
            TokenOrigin::Signed { .. } => "signed",
            TokenOrigin::Generated(_) => "generated",
            TokenOrigin::Fixed => "fixed",
        };
        f.debug_struct("SasTokenManager")
            .field("origin", &origin)
            .field("ttl", &self.ttl)
            .field("expiry", &self.expiry())
            .finish()
    }
}

fn into_credential(err: PipelineError) -> PipelineError {
    match err {
        PipelineError::Credential(_) => err,
        other => PipelineError::Credential(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::thread;

    use super::*;
    use crate::signer::SymmetricKeySigner;

    const KEY: &str = "c2VjcmV0a2V5MTIzNDU2Nzg5MA==";
    const URI: &str = "myhub.azure-devices.net/devices/dev1";

    fn signer() -> Arc<dyn Signer> {
        Arc::new(SymmetricKeySigner::new(KEY).unwrap())
    }

    #[test]
    fn test_token_format_known_vector() {
        let token = SasToken::sign(URI, signer().as_ref(), None, 1_700_000_000).unwrap();
        assert_eq!(
            token.to_string(),
            "SharedAccessSignature sr=myhub.azure-devices.net%2Fdevices%2Fdev1\
             &sig=T7Q%2FJ%2FAIuIEGu7iHirbmVLwplEeUmDRK9PxaJibeBME%3D&se=1700000000"
        );
    }

    #[test]
    fn test_token_format_with_key_name() {
        let token = SasToken::sign(URI, signer().as_ref(), Some("owner"), 1_700_000_000).unwrap();
        assert!(token.to_string().ends_with("&se=1700000000&skn=owner"));
        assert_eq!(token.key_name(), Some("owner"));
    }

    #[test]
    fn test_token_parse_round_trip() {
        let token = SasToken::sign(URI, signer().as_ref(), Some("owner"), 1_700_000_000).unwrap();
        let parsed: SasToken = token.to_string().parse().unwrap();
        assert_eq!(parsed, token);
    }

    #[test]
    fn test_token_parse_rejects_malformed() {
        for bad in [
            "sr=a&sig=b&se=1",
            "SharedAccessSignature sr=a&sig=b",
            "SharedAccessSignature sr=a&sig=b&se=notanumber",
            "SharedAccessSignature sr=a&sig=b&se=1&foo=bar",
            "SharedAccessSignature sr=a&sr=a&sig=b&se=1",
            "SharedAccessSignature sr",
        ] {
            assert!(
                matches!(bad.parse::<SasToken>(), Err(PipelineError::Format(_))),
                "{bad}"
            );
        }
    }

    #[test]
    fn test_manager_default_ttl_expiry() {
        let manager = SasTokenManager::signed(URI, signer(), None, DEFAULT_TOKEN_TTL).unwrap();
        let now = epoch_seconds();
        assert!(manager.expiry() >= now + 3599 && manager.expiry() <= now + 3601);
        assert!(manager.is_renewable());
    }

    #[test]
    fn test_refresh_strictly_increases_expiry() {
        let manager = SasTokenManager::signed(URI, signer(), None, DEFAULT_TOKEN_TTL).unwrap();
        let mut last = manager.expiry();
        for _ in 0..3 {
            thread::sleep(Duration::from_millis(5));
            let token = manager.refresh().unwrap();
            assert!(token.expiry() > last);
            last = token.expiry();
        }
        assert_eq!(manager.expiry(), last);
    }

    #[test]
    fn test_readers_see_whole_tokens_during_refresh() {
        let manager = Arc::new(SasTokenManager::signed(URI, signer(), None, DEFAULT_TOKEN_TTL).unwrap());
        let stop = Arc::new(AtomicBool::new(false));
        let reader = {
            let manager = Arc::clone(&manager);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    let token: SasToken = manager.token_string().parse().unwrap();
                    assert_eq!(token.resource_uri(), quote(URI));
                }
            })
        };
        for _ in 0..20 {
            manager.refresh().unwrap();
        }
        stop.store(true, Ordering::Relaxed);
        reader.join().unwrap();
    }

    struct CountingSource {
        calls: AtomicU64,
        fail: bool,
    }

    impl TokenSource for CountingSource {
        fn generate(&self, ttl: Duration) -> Result<SasToken, PipelineError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail && n > 0 {
                return Err(PipelineError::Signing("hsm unavailable".into()));
            }
            let signer = SymmetricKeySigner::new(KEY)?;
            SasToken::sign(URI, &signer, None, epoch_seconds() + ttl.as_secs() + n)
        }
    }

    struct ShortLivedSource;

    impl TokenSource for ShortLivedSource {
        fn generate(&self, _ttl: Duration) -> Result<SasToken, PipelineError> {
            let signer = SymmetricKeySigner::new(KEY)?;
            SasToken::sign(URI, &signer, None, epoch_seconds() + 30)
        }
    }

    #[test]
    fn test_renewal_delay_rejects_token_inside_margin() {
        let manager = SasTokenManager::generated(Arc::new(ShortLivedSource), DEFAULT_TOKEN_TTL).unwrap();
        assert!(matches!(
            manager.renewal_delay(DEFAULT_RENEWAL_MARGIN),
            Err(PipelineError::Credential(_))
        ));
    }

    #[test]
    fn test_generated_source_refresh() {
        let source = Arc::new(CountingSource {
            calls: AtomicU64::new(0),
            fail: false,
        });
        let manager = SasTokenManager::generated(source.clone(), DEFAULT_TOKEN_TTL).unwrap();
        manager.refresh().unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_generated_source_failure_is_credential_error() {
        let source = Arc::new(CountingSource {
            calls: AtomicU64::new(0),
            fail: true,
        });
        let manager = SasTokenManager::generated(source.clone(), DEFAULT_TOKEN_TTL).unwrap();
        let before = manager.token_string();
        assert!(matches!(manager.refresh(), Err(PipelineError::Credential(_))));
        // No internal retry and the old token stays in place.
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert_eq!(manager.token_string(), before);
    }

    #[test]
    fn test_fixed_token_cannot_refresh() {
        let token = SasToken::sign(URI, signer().as_ref(), None, epoch_seconds() + 600).unwrap();
        let manager = SasTokenManager::fixed(&token.to_string()).unwrap();
        assert!(!manager.is_renewable());
        assert_eq!(manager.token_string(), token.to_string());
        assert!(matches!(manager.refresh(), Err(PipelineError::Credential(_))));
    }

    #[test]
    fn test_renewal_delay() {
        let manager = SasTokenManager::signed(URI, signer(), None, DEFAULT_TOKEN_TTL).unwrap();
        let delay = manager.renewal_delay(DEFAULT_RENEWAL_MARGIN).unwrap();
        assert!(delay <= Duration::from_secs(3480));
        assert!(delay >= Duration::from_secs(3470));

        let short = SasTokenManager::signed(URI, signer(), None, Duration::from_secs(60)).unwrap();
        assert!(matches!(
            short.renewal_delay(DEFAULT_RENEWAL_MARGIN),
            Err(PipelineError::Config(_))
        ));
    }
}
