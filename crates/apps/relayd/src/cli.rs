//! Command line definitions

use clap::{Args, Parser, Subcommand};
use relay::ServeOptions;
use relay::models::HookConfig;

/// Longest accepted `--ttl-hours` (30 days)
pub const MAX_TTL_HOURS: u64 = 720;

/// Relay Gmail push notifications to a webhook
#[derive(Debug, Parser)]
#[command(name = "relayd", version)]
pub struct Cli {
    /// Gmail account to operate on
    #[arg(long, global = true, env = "RELAY_ACCOUNT")]
    pub account: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Manage the Gmail watch for the account
    Watch {
        #[command(subcommand)]
        action: WatchAction,
    },

    /// Manage stored OAuth tokens
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },

    /// Run the push endpoint until Ctrl-C
    Serve(ServeArgs),
}

#[derive(Debug, Subcommand)]
pub enum WatchAction {
    /// Subscribe the mailbox to a Pub/Sub topic
    Start {
        /// Pub/Sub topic, projects/<project>/topics/<name>
        #[arg(long, env = "RELAY_TOPIC")]
        topic: String,

        /// Label to watch (repeatable)
        #[arg(long = "label")]
        labels: Vec<String>,

        /// Hours until the watch should be considered expired
        #[arg(long, default_value_t = 24, value_parser = clap::value_parser!(u64).range(1..=MAX_TTL_HOURS))]
        ttl_hours: u64,

        #[command(flatten)]
        hook: HookArgs,
    },

    /// Print the stored watch state
    Status,

    /// Re-subscribe with the stored topic and labels
    Renew {
        /// Hours until the watch should be considered expired
        #[arg(long, default_value_t = 24, value_parser = clap::value_parser!(u64).range(1..=MAX_TTL_HOURS))]
        ttl_hours: u64,
    },

    /// Unsubscribe and forget the watch
    Stop,

    /// Set or clear the hook
    Hook {
        #[command(flatten)]
        hook: HookArgs,

        /// Remove the hook
        #[arg(long, conflicts_with_all = ["hook_url", "hook_token", "hook_include_body", "hook_max_bytes"])]
        clear: bool,
    },
}

/// Hook delivery flags
#[derive(Debug, Default, Args)]
pub struct HookArgs {
    /// Webhook receiving new messages
    #[arg(long = "hook-url", alias = "url")]
    pub hook_url: Option<String>,

    /// Bearer token sent to the hook
    #[arg(long = "hook-token", requires = "hook_url")]
    pub hook_token: Option<String>,

    /// Include plain text bodies in the payload
    #[arg(long = "include-body", requires = "hook_url")]
    pub hook_include_body: bool,

    /// Body byte budget per message
    #[arg(long = "max-bytes", requires = "hook_url")]
    pub hook_max_bytes: Option<usize>,
}

impl HookArgs {
    /// The hook these flags describe, None without a url
    pub fn to_config(&self) -> Option<HookConfig> {
        let url = self.hook_url.as_deref()?.trim();
        let mut hook = HookConfig::new(url);
        hook.token = self.hook_token.clone().filter(|t| !t.is_empty());
        hook.include_body = self.hook_include_body;
        hook.max_bytes = self.hook_max_bytes.unwrap_or(0);
        Some(hook)
    }
}

#[derive(Debug, Subcommand)]
pub enum TokenAction {
    /// Store OAuth tokens obtained elsewhere
    Import {
        #[arg(long, env = "RELAY_REFRESH_TOKEN")]
        refresh_token: String,

        #[arg(long, requires = "expires_in")]
        access_token: Option<String>,

        /// Seconds until the access token expires
        #[arg(long, requires = "access_token")]
        expires_in: Option<i64>,
    },
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(long, env = "RELAY_BIND")]
    pub bind: Option<String>,

    /// Push endpoint path
    #[arg(long, env = "RELAY_PATH")]
    pub path: Option<String>,

    /// Shared secret expected as ?token= or bearer
    #[arg(long, env = "RELAY_PUSH_TOKEN")]
    pub token: Option<String>,

    /// Verify Google-signed OIDC tokens from Pub/Sub
    #[arg(long)]
    pub verify_oidc: bool,

    /// Expected OIDC audience (defaults to the request URL)
    #[arg(long)]
    pub oidc_audience: Option<String>,

    /// Expected push service account
    #[arg(long)]
    pub oidc_email: Option<String>,

    /// Largest accepted push body
    #[arg(long)]
    pub max_body_bytes: Option<usize>,
}

impl From<ServeArgs> for ServeOptions {
    fn from(args: ServeArgs) -> Self {
        Self {
            bind: args.bind,
            path: args.path,
            token: args.token,
            verify_oidc: args.verify_oidc,
            oidc_audience: args.oidc_audience,
            oidc_email: args.oidc_email,
            max_body_bytes: args.max_body_bytes,
        }
    }
}
