//! Configuration loading for the relay
//!
//! Supports loading OAuth credentials from (in order of priority):
//! 1. Compile-time embedded credentials (for production builds)
//! 2. JSON file (Google Cloud Console format)
//! 3. Runtime environment variables (fallback)
//!
//! Push server options arrive as raw [`ServeOptions`] from the command line
//! and are validated into [`ServeSettings`].

use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::{AddrParseError, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Credentials filename in the relay config directory
const CREDENTIALS_FILE: &str = "google-credentials.json";

/// Default listen address for the push server
pub const DEFAULT_BIND: &str = "127.0.0.1:8788";
/// Default push endpoint path
pub const DEFAULT_PATH: &str = "/gmail-pubsub";
/// Default limit on inbound push bodies
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;
/// Default deadline for handling one push
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Default timeout for one hook delivery
pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(15);

/// Invalid user-supplied settings
#[derive(Debug, thiserror::Error)]
pub enum UsageError {
    #[error("An account is required (--account or RELAY_ACCOUNT)")]
    MissingAccount,
    #[error("A Pub/Sub topic is required")]
    MissingTopic,
    #[error("Invalid bind address {value:?}: {source}")]
    InvalidBind {
        value: String,
        #[source]
        source: AddrParseError,
    },
    #[error("Push path must start with '/': {0:?}")]
    InvalidPath(String),
    #[error("--max-body-bytes must be greater than zero")]
    ZeroBodyLimit,
    #[error("Shared push token must not be empty")]
    EmptyToken,
    #[error("--oidc-audience and --oidc-email require --verify-oidc")]
    OidcWithoutVerify,
    #[error("Hook url must be http(s): {0:?}")]
    InvalidHookUrl(String),
}

/// OAuth credentials for Gmail API access
#[derive(Debug, Clone)]
pub struct GmailCredentials {
    pub client_id: String,
    pub client_secret: String,
}

/// Google Cloud Console credential file format (installed app)
#[derive(Deserialize)]
struct GoogleCredentialFile {
    installed: Option<InstalledCredentials>,
    web: Option<InstalledCredentials>,
}

#[derive(Deserialize)]
struct InstalledCredentials {
    client_id: String,
    client_secret: String,
}

impl GmailCredentials {
    /// Load credentials using the following priority:
    /// 1. Compile-time embedded credentials (for production builds)
    /// 2. JSON file (~/.config/relay/google-credentials.json)
    /// 3. Runtime environment variables
    pub fn load() -> Result<Self> {
        if let Some(creds) = Self::from_compile_time() {
            return Ok(creds);
        }

        if config::config_exists(CREDENTIALS_FILE) {
            let creds: GoogleCredentialFile = config::load_json(CREDENTIALS_FILE)?;
            return Self::from_credential_file(creds);
        }

        Self::from_env()
    }

    /// Load credentials embedded at compile time via environment variables.
    /// Build with: GOOGLE_CLIENT_ID=xxx GOOGLE_CLIENT_SECRET=yyy cargo build --release
    pub fn from_compile_time() -> Option<Self> {
        let client_id = option_env!("GOOGLE_CLIENT_ID")?;
        let client_secret = option_env!("GOOGLE_CLIENT_SECRET")?;

        if client_id.is_empty() || client_secret.is_empty() {
            return None;
        }

        Some(Self {
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
        })
    }

    /// Load credentials from a specific JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let creds: GoogleCredentialFile = config::load_json_file(path)?;
        Self::from_credential_file(creds)
    }

    fn from_credential_file(creds: GoogleCredentialFile) -> Result<Self> {
        // Support both "installed" (desktop) and "web" credential types
        let installed = creds
            .installed
            .or(creds.web)
            .context("Credentials file missing 'installed' or 'web' section")?;

        Ok(Self {
            client_id: installed.client_id,
            client_secret: installed.client_secret,
        })
    }

    /// Parse credentials from JSON string (Google Cloud Console format)
    pub fn from_json(json: &str) -> Result<Self> {
        let creds: GoogleCredentialFile =
            serde_json::from_str(json).context("Failed to parse credentials JSON")?;
        Self::from_credential_file(creds)
    }

    /// Load credentials from environment variables
    pub fn from_env() -> Result<Self> {
        let client_id = std::env::var("GMAIL_CLIENT_ID")
            .context("GMAIL_CLIENT_ID environment variable not set")?;
        let client_secret = std::env::var("GMAIL_CLIENT_SECRET")
            .context("GMAIL_CLIENT_SECRET environment variable not set")?;

        Ok(Self {
            client_id,
            client_secret,
        })
    }

    /// Get the default credentials file path (~/.config/relay/google-credentials.json)
    pub fn default_credentials_path() -> Option<PathBuf> {
        config::config_path(CREDENTIALS_FILE)
    }
}

/// OIDC verification settings for push requests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OidcSettings {
    /// Expected audience; the public push URL when unset
    pub audience: Option<String>,
    /// Required `email` claim (the push subscription's service account)
    pub service_account_email: Option<String>,
}

/// Raw push server options as given on the command line
#[derive(Debug, Clone, Default)]
pub struct ServeOptions {
    pub bind: Option<String>,
    pub path: Option<String>,
    pub token: Option<String>,
    pub verify_oidc: bool,
    pub oidc_audience: Option<String>,
    pub oidc_email: Option<String>,
    pub max_body_bytes: Option<usize>,
}

/// Validated push server settings
#[derive(Debug, Clone)]
pub struct ServeSettings {
    pub bind: SocketAddr,
    pub path: String,
    pub shared_token: Option<String>,
    pub oidc: Option<OidcSettings>,
    pub max_body_bytes: usize,
    pub request_timeout: Duration,
    pub hook_timeout: Duration,
}

impl Default for ServeSettings {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8788)),
            path: DEFAULT_PATH.to_string(),
            shared_token: None,
            oidc: None,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            hook_timeout: DEFAULT_HOOK_TIMEOUT,
        }
    }
}

impl ServeSettings {
    /// Validate raw options, filling in defaults
    pub fn from_options(options: ServeOptions) -> Result<Self, UsageError> {
        let bind_value = non_empty(options.bind).unwrap_or_else(|| DEFAULT_BIND.to_string());
        let bind: SocketAddr = bind_value
            .parse()
            .map_err(|source| UsageError::InvalidBind {
                value: bind_value.clone(),
                source,
            })?;

        let path = non_empty(options.path).unwrap_or_else(|| DEFAULT_PATH.to_string());
        if !path.starts_with('/') || path.contains('?') {
            return Err(UsageError::InvalidPath(path));
        }

        let shared_token = match options.token {
            Some(token) if token.trim().is_empty() => return Err(UsageError::EmptyToken),
            other => other,
        };

        let oidc_audience = non_empty(options.oidc_audience);
        let oidc_email = non_empty(options.oidc_email);
        let oidc = if options.verify_oidc {
            Some(OidcSettings {
                audience: oidc_audience,
                service_account_email: oidc_email,
            })
        } else if oidc_audience.is_some() || oidc_email.is_some() {
            return Err(UsageError::OidcWithoutVerify);
        } else {
            None
        };

        let max_body_bytes = match options.max_body_bytes {
            Some(0) => return Err(UsageError::ZeroBodyLimit),
            Some(n) => n,
            None => DEFAULT_MAX_BODY_BYTES,
        };

        Ok(Self {
            bind,
            path,
            shared_token,
            oidc,
            max_body_bytes,
            ..Self::default()
        })
    }
}

/// Check a hook url before storing it
pub fn validate_hook_url(url: &str) -> Result<(), UsageError> {
    match url::Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") && parsed.has_host() => Ok(()),
        _ => Err(UsageError::InvalidHookUrl(url.to_string())),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
