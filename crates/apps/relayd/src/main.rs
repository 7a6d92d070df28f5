//! relayd - Gmail push notifications to webhooks
//!
//! Subcommands:
//! - `watch start|status|renew|stop|hook` manage the Gmail watch record
//! - `token import` stores OAuth tokens for an account
//! - `serve` runs the Pub/Sub push endpoint

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use log::{error, info, warn};
use relay::config::validate_hook_url;
use relay::gmail::StoredToken;
use relay::gmail::api::WatchRequest;
use relay::models::parse_history_id;
use relay::storage::default_dir;
use relay::{
    Cancellation, CircuitBreaker, FileSecretStore, GmailClient, GmailCredentials,
    GoogleOidcVerifier, HookDispatcher, PushAuthConfig, PushAuthenticator, PushServer,
    RetryTransport, SecretStore, ServeSettings, StoredTokenSource, Transport, UreqTransport,
    UsageError, WatchState, WatchStateStore,
};

mod cli;

use cli::{Cli, Command, HookArgs, ServeArgs, TokenAction, WatchAction};

/// Gmail only supports including the listed labels
const LABEL_FILTER_INCLUDE: &str = "INCLUDE";

fn main() -> ExitCode {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    // Bootstrap config directory
    if let Err(e) = config::init() {
        error!("Failed to initialize config directory: {}", e);
    }

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            if e.downcast_ref::<UsageError>().is_some() {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let account = cli
        .account
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty())
        .ok_or(UsageError::MissingAccount)?;

    match cli.command {
        Command::Watch { action } => watch(&account, action),
        Command::Token { action } => token(&account, action),
        Command::Serve(args) => serve(&account, args),
    }
}

/// Shared upstream plumbing for one account
struct Upstream {
    breaker: Arc<CircuitBreaker>,
    gmail: Arc<GmailClient>,
}

impl Upstream {
    fn connect(account: &str) -> Result<Self> {
        let credentials = match GmailCredentials::load() {
            Ok(credentials) => credentials,
            Err(e) => {
                if let Some(path) = GmailCredentials::default_credentials_path() {
                    warn!(
                        "To configure Gmail access, either:\n\
                         1. Place your Google OAuth credentials at: {}\n\
                         2. Or set environment variables: GMAIL_CLIENT_ID and GMAIL_CLIENT_SECRET",
                        path.display()
                    );
                }
                return Err(e);
            }
        };

        let secrets: Arc<dyn SecretStore> = Arc::new(FileSecretStore::open_default()?);
        let breaker = Arc::new(CircuitBreaker::new());
        let transport: Arc<dyn Transport> = Arc::new(RetryTransport::new(
            UreqTransport::default(),
            breaker.clone(),
        ));
        let tokens = StoredTokenSource::new(account, credentials, secrets, transport.clone());
        let gmail = Arc::new(GmailClient::new(transport, Arc::new(tokens)));

        Ok(Self { breaker, gmail })
    }
}

fn state_dir() -> Result<PathBuf> {
    default_dir().context("Could not determine config directory")
}

fn ttl(hours: u64) -> Duration {
    Duration::from_secs(hours.saturating_mul(3600))
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn print_state(state: &WatchState) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(state)?);
    Ok(())
}

fn hook_from_args(args: &HookArgs) -> Result<Option<relay::HookConfig>> {
    let hook = args.to_config();
    if let Some(hook) = &hook {
        validate_hook_url(&hook.url)?;
    }
    Ok(hook)
}

fn watch_request(topic: &str, labels: &[String]) -> WatchRequest {
    WatchRequest {
        topic_name: topic.to_string(),
        label_ids: labels.to_vec(),
        label_filter_behavior: (!labels.is_empty()).then(|| LABEL_FILTER_INCLUDE.to_string()),
    }
}

fn watch(account: &str, action: WatchAction) -> Result<()> {
    let dir = state_dir()?;
    let cancel = Cancellation::never();

    match action {
        WatchAction::Start {
            topic,
            labels,
            ttl_hours,
            hook,
        } => {
            let topic = topic.trim();
            if topic.is_empty() {
                return Err(UsageError::MissingTopic.into());
            }
            let hook = hook_from_args(&hook)?;

            let mut state = WatchState::new(account, topic, labels);
            let upstream = Upstream::connect(account)?;
            let response = upstream
                .gmail
                .watch(&watch_request(&state.topic, &state.labels), &cancel)
                .context("Gmail watch request failed")?;
            let history_id = parse_history_id(&response.history_id)
                .with_context(|| format!("Gmail returned an invalid historyId {:?}", response.history_id))?;

            state.history_id = history_id.to_string();
            state.hook = hook;
            state.apply_expiration(
                now_ms(),
                ttl(ttl_hours),
                response.expiration.parse().ok(),
            );
            let store = WatchStateStore::create(&dir, state)?;
            info!(
                "Watching {} on {} from historyId {}",
                account,
                topic,
                history_id
            );
            print_state(&store.get())
        }
        WatchAction::Status => {
            let store = WatchStateStore::load(&dir, account)?;
            let state = store.get();
            if state.renewal_due(now_ms()) {
                warn!("Watch for {} is due for renewal", account);
            }
            print_state(&state)
        }
        WatchAction::Renew { ttl_hours } => {
            let store = WatchStateStore::load(&dir, account)?;
            let state = store.get();
            let upstream = Upstream::connect(account)?;
            let response = upstream
                .gmail
                .watch(&watch_request(&state.topic, &state.labels), &cancel)
                .context("Gmail watch renewal failed")?;

            store.update(|state| {
                state.apply_expiration(
                    now_ms(),
                    ttl(ttl_hours),
                    response.expiration.parse().ok(),
                );
            })?;
            info!("Renewed watch for {}", account);
            print_state(&store.get())
        }
        WatchAction::Stop => {
            let store = WatchStateStore::load(&dir, account)?;
            let upstream = Upstream::connect(account)?;
            upstream
                .gmail
                .stop(&cancel)
                .context("Gmail stop request failed")?;
            store.delete()?;
            info!("Stopped watch for {}", account);
            Ok(())
        }
        WatchAction::Hook { hook, clear } => {
            let store = WatchStateStore::load(&dir, account)?;
            let hook = if clear {
                None
            } else {
                match hook_from_args(&hook)? {
                    Some(hook) => Some(hook),
                    None => bail!("Pass --url to set the hook or --clear to remove it"),
                }
            };
            store.update(|state| state.hook = hook)?;
            print_state(&store.get())
        }
    }
}

fn token(account: &str, action: TokenAction) -> Result<()> {
    match action {
        TokenAction::Import {
            refresh_token,
            access_token,
            expires_in,
        } => {
            let refresh_token = refresh_token.trim();
            if refresh_token.is_empty() {
                bail!("--refresh-token must not be empty");
            }
            let secrets = FileSecretStore::open_default()?;
            let token = StoredToken {
                access_token: access_token.unwrap_or_default(),
                refresh_token: Some(refresh_token.to_string()),
                expires_at: expires_in.map(|secs| chrono::Utc::now().timestamp() + secs),
            };
            StoredTokenSource::store_token(&secrets, account, &token)?;
            info!("Stored token for {} in {}", account, secrets.path().display());
            Ok(())
        }
    }
}

fn serve(account: &str, args: ServeArgs) -> Result<()> {
    let settings = ServeSettings::from_options(args.into())?;
    let store = Arc::new(WatchStateStore::load(&state_dir()?, account)?);
    let upstream = Upstream::connect(account)?;

    let verifier = settings.oidc.as_ref().map(|_| {
        Arc::new(GoogleOidcVerifier::new(Arc::new(UreqTransport::default())))
            as Arc<dyn relay::push::TokenVerifier>
    });
    let auth = PushAuthenticator::new(PushAuthConfig::from(&settings), verifier);
    let dispatcher = HookDispatcher::new(Arc::new(UreqTransport::new(settings.hook_timeout)))
        .with_timeout(settings.hook_timeout);

    let bind = settings.bind;
    let server = Arc::new(PushServer::new(
        store,
        upstream.gmail.clone(),
        auth,
        dispatcher,
        settings,
    ));

    let runtime = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;
    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(bind)
            .await
            .with_context(|| format!("Failed to bind {}", bind))?;
        server
            .serve(listener, async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to listen for Ctrl-C: {}", e);
                }
            })
            .await
    })?;

    if upstream.breaker.is_open() {
        warn!("Exiting with the Gmail circuit breaker open");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_saturates() {
        assert_eq!(ttl(24), Duration::from_secs(86_400));
        assert_eq!(ttl(u64::MAX), Duration::from_secs(u64::MAX));
    }
}
