//! Command-line interface parsing and handling
//!
//! This module handles parsing command-line arguments and executing the appropriate commands.

pub mod chat;

use std::error::Error;
use std::sync::Arc;

use clap::{Args as ClapArgs, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::core::config::orchestrator::ConfigOrchestrator;
use crate::core::config::{Config, ConfigKey};
use crate::core::identity::{
    resolve_user_id, IdentityStore, KeyringStore, MemoryStore, KEY_AUTH_TOKEN, KEY_USER_ID,
};
use crate::core::message::MessageOrigin;

/// Environment variable holding the `tracing` filter directives.
pub const LOG_ENV: &str = "SPARKCHAT_LOG";

#[derive(Parser, Debug)]
#[command(name = "sparkchat")]
#[command(about = "Chat with a match over the conventional backend or the ledger")]
#[command(
    long_about = "sparkchat opens one conversation with a match and keeps it in sync. \
Messages go out over a websocket (conventional mode) or as signed ledger \
transactions (ledger mode); history is polled either way.\n\n\
Identity:\n\
  Use 'sparkchat login <user-id>' to store your identity in the system keyring.\n\n\
Chat commands:\n\
  /mode             Ask to switch between conventional and ledger mode\n\
  /yes, /no         Confirm or cancel a pending mode switch\n\
  /react <n> <e>    Add reaction <e> to message number <n>\n\
  /failed           List sends that did not go through\n\
  /retry <n>        Re-send failed message number <n>\n\
  /dismiss <n>      Forget failed message number <n>\n\
  /quit             Leave the conversation\n\n\
Logging:\n\
  SPARKCHAT_LOG     tracing filter for stderr diagnostics (default: warn)"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Open a conversation
    Chat(ChatArgs),
    /// Print a conversation's history once and exit
    History(HistoryArgs),
    /// Store your user id (and optional auth token) in the keyring
    Login {
        /// Your user id
        user: String,
        /// Bearer token for the chat backend
        #[arg(long)]
        token: Option<String>,
    },
    /// Remove the stored identity
    Logout,
    /// Show the stored user id
    Whoami,
    /// Set configuration values, or print them all when no value is given
    Set {
        /// Configuration key to set
        key: Option<String>,
        /// Value to set for the key
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        value: Option<Vec<String>>,
    },
    /// Unset configuration values
    Unset {
        /// Configuration key to unset
        key: String,
    },
}

#[derive(ClapArgs, Debug, Clone)]
pub struct ChatArgs {
    /// Conversation id
    pub conversation: String,
    /// User id of the match on the other side
    #[arg(short = 'p', long)]
    pub partner: Option<String>,
    /// Starting transport mode (conventional or ledger)
    #[arg(short = 'm', long, value_parser = parse_mode)]
    pub mode: Option<MessageOrigin>,
    /// Act as this user id instead of the stored identity
    #[arg(short = 'u', long)]
    pub user: Option<String>,
    /// Use the in-process ledger instead of the ledger service
    #[arg(long)]
    pub offline: bool,
    /// Keep identity and ledger keys in memory only (needs --user)
    #[arg(long, requires = "user")]
    pub no_keyring: bool,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct HistoryArgs {
    /// Conversation id
    pub conversation: String,
    /// Backend to read from (conventional or ledger)
    #[arg(short = 'm', long, value_parser = parse_mode)]
    pub mode: Option<MessageOrigin>,
}

fn parse_mode(raw: &str) -> Result<MessageOrigin, String> {
    MessageOrigin::try_from(raw)
}

pub fn main() -> Result<(), Box<dyn Error>> {
    init_logging();
    tokio::runtime::Runtime::new()?.block_on(async_main())
}

/// Installs the stderr subscriber. Library code only emits events.
fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

async fn async_main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let config = ConfigOrchestrator::for_default_path()?;

    match args.command {
        Commands::Chat(chat_args) => chat::run_chat(&config, chat_args).await,
        Commands::History(history_args) => chat::print_history(&config, history_args).await,
        Commands::Login { user, token } => {
            let store = keyring_store(&config)?;
            let user = user.trim();
            if user.is_empty() {
                eprintln!("❌ User id cannot be blank");
                std::process::exit(1);
            }
            store.set(KEY_USER_ID, user)?;
            if let Some(token) = token.filter(|token| !token.trim().is_empty()) {
                store.set(KEY_AUTH_TOKEN, token.trim())?;
            }
            println!("✅ Logged in as {user}");
            Ok(())
        }
        Commands::Logout => {
            let store = keyring_store(&config)?;
            store.delete(KEY_USER_ID)?;
            store.delete(KEY_AUTH_TOKEN)?;
            println!("✅ Logged out");
            Ok(())
        }
        Commands::Whoami => {
            let store = keyring_store(&config)?;
            match resolve_user_id(store.as_ref()) {
                Ok(user) => println!("{user}"),
                Err(_) => {
                    eprintln!("⚠️  Not logged in. Run: sparkchat login <user-id>");
                    std::process::exit(1);
                }
            }
            Ok(())
        }
        Commands::Set { key, value } => {
            let Some(key) = key else {
                config.load_with_cache()?.print_all();
                return Ok(());
            };
            let key = parse_key_or_exit(&key);
            let value = value.map(|parts| parts.join(" ")).unwrap_or_default();
            if value.trim().is_empty() {
                config.load_with_cache()?.print_all();
                return Ok(());
            }
            config.mutate(|config| {
                config.set_value(key, &value)?;
                Ok(())
            })?;
            println!("✅ Set {key} to: {}", value.trim());
            Ok(())
        }
        Commands::Unset { key } => {
            let key = parse_key_or_exit(&key);
            config.mutate(|config| {
                config.unset_value(key);
                Ok(())
            })?;
            println!("✅ Unset {key}");
            Ok(())
        }
    }
}

fn parse_key_or_exit(raw: &str) -> ConfigKey {
    match ConfigKey::parse(raw) {
        Some(key) => key,
        None => {
            eprintln!("❌ Unknown config key: {raw}");
            let known: Vec<&str> = ConfigKey::ALL.iter().map(|key| key.as_str()).collect();
            eprintln!("Known keys: {}", known.join(", "));
            std::process::exit(1);
        }
    }
}

fn keyring_store(config: &ConfigOrchestrator) -> Result<Arc<dyn IdentityStore>, Box<dyn Error>> {
    let store = identity_store(&config.load_with_cache()?, None, false);
    if !store.persists() {
        eprintln!("⚠️  use_keyring is off; identity changes will not persist");
    }
    Ok(store)
}

/// Identity store for a chat run. `--user` and `--no-keyring` keep
/// everything in memory.
pub(crate) fn session_store(config: &Config, args: &ChatArgs) -> Arc<dyn IdentityStore> {
    identity_store(config, args.user.as_deref(), args.no_keyring)
}

/// An explicit user always wins. With the keyring off and no user the store
/// is empty, so anything needing an identity reports it as unavailable.
pub(crate) fn identity_store(
    config: &Config,
    user: Option<&str>,
    no_keyring: bool,
) -> Arc<dyn IdentityStore> {
    match user {
        Some(user) => Arc::new(MemoryStore::with_user(user)),
        None if no_keyring || !config.use_keyring() => Arc::new(MemoryStore::new()),
        None => Arc::new(KeyringStore::new()),
    }
}
