//! Push request authentication
//!
//! A push is accepted when any configured check passes: a shared token (in
//! the `token` query parameter or as the bearer token), or a Google-signed
//! OIDC bearer token. With nothing configured every push is accepted.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use http::HeaderMap;
use http::header::{AUTHORIZATION, HOST};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use log::{debug, info, warn};
use serde::Deserialize;
use subtle::ConstantTimeEq;

use crate::config::{OidcSettings, ServeSettings};
use crate::transport::{Cancellation, HttpRequest, RequestBody, Transport};

/// Google's signing keys for OIDC tokens
pub const GOOGLE_JWKS_URL: &str = "https://www.googleapis.com/oauth2/v3/certs";

/// Issuers Google uses for OIDC tokens
const GOOGLE_ISSUERS: [&str; 2] = ["accounts.google.com", "https://accounts.google.com"];

/// How long fetched keys are trusted
const JWKS_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// Maximum JWKS response size
const MAX_JWKS_SIZE: u64 = 512 * 1024;

/// Clock skew leeway for token expiry validation
const LEEWAY_SECS: u64 = 60;

/// Why a push was not authorized
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("No push credentials supplied")]
    Missing,
    #[error("Malformed Authorization header")]
    MalformedHeader,
    #[error("Push token does not match")]
    TokenMismatch,
    #[error("Cannot determine the push audience")]
    UnknownAudience,
    #[error("Invalid OIDC token: {0}")]
    InvalidToken(String),
    #[error("OIDC token email {0:?} is not the expected service account")]
    WrongServiceAccount(Option<String>),
    #[error("Failed to fetch Google signing keys: {0}")]
    Jwks(String),
}

/// Claims of a verified push token
#[derive(Debug, Clone, Deserialize)]
pub struct PushClaims {
    pub iss: String,
    pub sub: String,
    pub exp: i64,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub email_verified: Option<bool>,
}

/// Verifies OIDC bearer tokens
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str, audience: &str, cancel: &Cancellation) -> Result<PushClaims, AuthError>;
}

/// JWKS response structure (RFC 7517)
#[derive(Debug, Clone, Deserialize)]
struct JwkSet {
    keys: Vec<Jwk>,
}

#[derive(Debug, Clone, Deserialize)]
struct Jwk {
    kid: Option<String>,
    kty: String,
    alg: Option<String>,
    n: Option<String>,
    e: Option<String>,
}

impl JwkSet {
    fn find(&self, kid: &str) -> Option<&Jwk> {
        self.keys.iter().find(|k| k.kid.as_deref() == Some(kid))
    }
}

struct CachedKeys {
    fetched_at: Instant,
    keys: JwkSet,
}

/// Verifies Google-signed OIDC tokens against Google's published keys
pub struct GoogleOidcVerifier {
    transport: Arc<dyn Transport>,
    jwks_url: String,
    cache: Mutex<Option<CachedKeys>>,
}

impl GoogleOidcVerifier {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            jwks_url: GOOGLE_JWKS_URL.to_string(),
            cache: Mutex::new(None),
        }
    }

    pub fn with_jwks_url(mut self, jwks_url: impl Into<String>) -> Self {
        self.jwks_url = jwks_url.into();
        self
    }

    /// Cached keys, fetched when missing, stale or `refresh` is set
    fn keys(&self, refresh: bool, cancel: &Cancellation) -> Result<JwkSet, AuthError> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if !refresh
            && let Some(cached) = cache.as_ref()
            && cached.fetched_at.elapsed() < JWKS_CACHE_TTL
        {
            return Ok(cached.keys.clone());
        }

        let keys = self.fetch_jwks(cancel)?;
        *cache = Some(CachedKeys {
            fetched_at: Instant::now(),
            keys: keys.clone(),
        });
        Ok(keys)
    }

    fn fetch_jwks(&self, cancel: &Cancellation) -> Result<JwkSet, AuthError> {
        debug!("Fetching signing keys from {}", self.jwks_url);
        let mut request: HttpRequest = http::Request::get(self.jwks_url.as_str())
            .body(RequestBody::Empty)
            .map_err(|e| AuthError::Jwks(e.to_string()))?;
        request.extensions_mut().insert(cancel.clone());

        let response = self
            .transport
            .round_trip(request)
            .map_err(|e| AuthError::Jwks(e.to_string()))?;
        if !response.status().is_success() {
            return Err(AuthError::Jwks(format!("HTTP {}", response.status())));
        }

        let bytes = response
            .into_body()
            .read_limited(MAX_JWKS_SIZE)
            .map_err(|e| AuthError::Jwks(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| AuthError::Jwks(format!("Failed to parse JWKS: {e}")))
    }
}

impl TokenVerifier for GoogleOidcVerifier {
    fn verify(&self, token: &str, audience: &str, cancel: &Cancellation) -> Result<PushClaims, AuthError> {
        let header = decode_header(token).map_err(|e| AuthError::InvalidToken(e.to_string()))?;
        let kid = header
            .kid
            .ok_or_else(|| AuthError::InvalidToken("token has no kid".into()))?;

        let keys = self.keys(false, cancel)?;
        let jwk = match keys.find(&kid) {
            Some(jwk) => jwk.clone(),
            None => {
                info!("Signing key {kid} not cached; refreshing keys");
                self.keys(true, cancel)?
                    .find(&kid)
                    .cloned()
                    .ok_or_else(|| AuthError::InvalidToken(format!("unknown signing key {kid}")))?
            }
        };

        // Algorithm comes from the key, never from the token header
        if jwk.kty != "RSA" || jwk.alg.as_deref().is_some_and(|alg| alg != "RS256") {
            return Err(AuthError::InvalidToken(format!(
                "unsupported key type {} for {kid}",
                jwk.kty
            )));
        }
        let (Some(n), Some(e)) = (jwk.n.as_deref(), jwk.e.as_deref()) else {
            return Err(AuthError::InvalidToken(format!("RSA key {kid} is incomplete")));
        };
        let key = DecodingKey::from_rsa_components(n, e)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[audience]);
        validation.set_issuer(&GOOGLE_ISSUERS);
        validation.leeway = LEEWAY_SECS;

        let data = decode::<PushClaims>(token, &key, &validation)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;
        Ok(data.claims)
    }
}

/// Which checks a push must pass
#[derive(Debug, Clone, Default)]
pub struct PushAuthConfig {
    pub shared_token: Option<String>,
    pub oidc: Option<OidcSettings>,
}

impl From<&ServeSettings> for PushAuthConfig {
    fn from(settings: &ServeSettings) -> Self {
        Self {
            shared_token: settings.shared_token.clone(),
            oidc: settings.oidc.clone(),
        }
    }
}

/// Applies [`PushAuthConfig`] to inbound requests
pub struct PushAuthenticator {
    config: PushAuthConfig,
    verifier: Option<Arc<dyn TokenVerifier>>,
}

impl PushAuthenticator {
    pub fn new(config: PushAuthConfig, verifier: Option<Arc<dyn TokenVerifier>>) -> Self {
        Self { config, verifier }
    }

    /// Authorize one push request
    ///
    /// Returns the verified claims when the OIDC check was used.
    pub fn authorize(
        &self,
        headers: &HeaderMap,
        query_token: Option<&str>,
        path: &str,
        cancel: &Cancellation,
    ) -> Result<Option<PushClaims>, AuthError> {
        let bearer = bearer_token(headers);

        if let Some(expected) = self.config.shared_token.as_deref() {
            let presented = [query_token, bearer.as_ref().ok().copied().flatten()];
            if presented
                .into_iter()
                .flatten()
                .any(|token| constant_time_eq(token.as_bytes(), expected.as_bytes()))
            {
                return Ok(None);
            }
        }

        let Some(oidc) = self.config.oidc.as_ref() else {
            return match self.config.shared_token {
                None => Ok(None),
                Some(_) if query_token.is_none() && matches!(bearer, Ok(None)) => Err(AuthError::Missing),
                Some(_) => Err(AuthError::TokenMismatch),
            };
        };

        let token = bearer?.ok_or(AuthError::Missing)?;
        let audience = match oidc.audience.clone() {
            Some(audience) => audience,
            None => public_url(headers, path).ok_or(AuthError::UnknownAudience)?,
        };
        let verifier = self
            .verifier
            .as_ref()
            .ok_or_else(|| AuthError::InvalidToken("no verifier configured".into()))?;
        let claims = verifier.verify(token, &audience, cancel)?;

        if let Some(expected) = oidc.service_account_email.as_deref() {
            let matches = claims
                .email
                .as_deref()
                .is_some_and(|email| email.eq_ignore_ascii_case(expected));
            if !matches || claims.email_verified != Some(true) {
                warn!("Rejected push from {:?}", claims.email);
                return Err(AuthError::WrongServiceAccount(claims.email));
            }
        }

        Ok(Some(claims))
    }
}

/// Bearer token from the Authorization header
///
/// `Ok(None)` when the header is absent.
fn bearer_token(headers: &HeaderMap) -> Result<Option<&str>, AuthError> {
    let Some(value) = headers.get(AUTHORIZATION) else {
        return Ok(None);
    };
    let value = value.to_str().map_err(|_| AuthError::MalformedHeader)?.trim();
    let (scheme, token) = value.split_once(' ').ok_or(AuthError::MalformedHeader)?;
    let token = token.trim();
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() || token.contains(' ') {
        return Err(AuthError::MalformedHeader);
    }
    Ok(Some(token))
}

/// The URL the push was addressed to, as seen by the client
///
/// Uses `X-Forwarded-Proto` (default `http`) and `X-Forwarded-Host` or
/// `Host`. The query string is not part of the result.
pub fn public_url(headers: &HeaderMap, path: &str) -> Option<String> {
    let first = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    let proto = first("x-forwarded-proto").unwrap_or("http");
    let host = first("x-forwarded-host").or_else(|| first(HOST.as_str()))?;
    Some(format!("{proto}://{host}{path}"))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}
