use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use frames::MessageKind;
use malaka_realtime::auth::{self, FileTokenStore, MemoryTokenStore, TokenError, TokenStore};
use malaka_realtime::consumers::notifications::NotificationFeed;
use malaka_realtime::consumers::record_lock::{CurrentUser, LockHolder, RecordLockWatch};
use malaka_realtime::consumers::typing::send_typing;
use malaka_realtime::{ApiError, Backstop, ConnectOutcome, ConnectionManager, ConnectionState, RealtimeConfig, RestClient};
use serde_json::{Value, json};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("no usable access token; run `malaka-ws token set <jwt>` or pass --token")]
    MissingToken,
    #[error("timed out waiting for the realtime connection")]
    Timeout,
    #[error("token store: {0}")]
    Token(#[from] TokenError),
    #[error("backstop request failed: {0}")]
    Api(#[from] ApiError),
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("signal handler failed: {0}")]
    Signal(#[from] std::io::Error),
}

#[derive(Parser, Debug)]
#[command(name = "malaka-ws", about = "Malaka ERP realtime channel CLI")]
struct Cli {
    #[arg(long, env = "MALAKA_API_URL")]
    api_url: Option<String>,

    /// Use this JWT instead of the token file.
    #[arg(long, env = "MALAKA_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[arg(long, env = "MALAKA_TOKEN_FILE")]
    token_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Inspect or change the stored access token.
    Token(TokenCommand),
    /// Print every inbound frame as a JSON line until Ctrl-C.
    Watch(WatchArgs),
    /// Send one typing indicator.
    Typing(TypingArgs),
    /// Hold an advisory record lock until Ctrl-C.
    Lock(LockArgs),
}

#[derive(Args, Debug)]
struct TokenCommand {
    #[command(subcommand)]
    command: TokenSubcommand,
}

#[derive(Subcommand, Debug)]
enum TokenSubcommand {
    Show,
    Set { token: String },
    Clear,
}

#[derive(Args, Debug)]
struct WatchArgs {
    /// Only print these kinds. Defaults to every known kind.
    #[arg(long = "kind")]
    kinds: Vec<String>,

    /// Pull notifications and action items over REST before watching.
    #[arg(long, default_value_t = false)]
    notifications: bool,
}

#[derive(Args, Debug)]
struct TypingArgs {
    conversation_id: String,

    #[arg(long, default_value_t = false)]
    stop: bool,
}

#[derive(Args, Debug)]
struct LockArgs {
    entity_type: String,
    entity_id: String,

    #[arg(long, env = "MALAKA_USER_ID")]
    user_id: String,

    #[arg(long, env = "MALAKA_USER_EMAIL", default_value = "")]
    user_email: String,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    let mut config = RealtimeConfig::from_env();
    if let Some(url) = cli.api_url {
        config = config.with_api_base_url(url);
    }
    if let Some(path) = cli.token_file {
        config.token_file = path;
    }
    let tokens: Arc<dyn TokenStore> = match cli.token {
        Some(token) => Arc::new(MemoryTokenStore::new(Some(token))),
        None => Arc::new(FileTokenStore::new(config.token_file.clone())),
    };

    match cli.command {
        Command::Token(cmd) => run_token(tokens.as_ref(), cmd).await,
        Command::Watch(args) => run_watch(config, tokens, args).await,
        Command::Typing(args) => run_typing(config, tokens, args).await,
        Command::Lock(args) => run_lock(config, tokens, args).await,
    }
}

// =============================================================================
// COMMANDS
// =============================================================================

async fn run_token(tokens: &dyn TokenStore, cmd: TokenCommand) -> Result<(), CliError> {
    match cmd.command {
        TokenSubcommand::Show => {
            let token = tokens.load().await?;
            print_json(&token_report(token.as_deref(), auth::now_secs()))
        }
        TokenSubcommand::Set { token } => {
            let token = token.trim();
            auth::decode_expiry(token)?;
            tokens.store(token).await?;
            eprintln!("token stored");
            Ok(())
        }
        TokenSubcommand::Clear => {
            tokens.clear().await?;
            eprintln!("token cleared");
            Ok(())
        }
    }
}

async fn run_watch(config: RealtimeConfig, tokens: Arc<dyn TokenStore>, args: WatchArgs) -> Result<(), CliError> {
    let manager = ConnectionManager::new(config.clone(), Arc::clone(&tokens));

    let _feed = if args.notifications {
        let rest = Arc::new(RestClient::new(&config, tokens)?);
        let feed = NotificationFeed::mount(&manager, Arc::clone(&rest) as Arc<dyn Backstop>);
        feed.refresh().await?;
        feed.refresh_action_items().await?;
        let unread_messages = rest.message_unread_count().await?;
        eprintln!(
            "{} notifications, {} unread, {} action items, {unread_messages} unread messages",
            feed.snapshot().len(),
            feed.unread_count(),
            feed.action_items().total()
        );
        Some(feed)
    } else {
        None
    };

    let kinds = watch_kinds(&args.kinds);
    let mut raw = manager.watch_raw_frames();
    let printer = tokio::spawn(async move {
        loop {
            match raw.recv().await {
                Ok(text) => {
                    if let Some(line) = frame_line(&text, &kinds) {
                        println!("{line}");
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "output fell behind; frames dropped"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut states = manager.watch_state();
    let state_log = tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            info!(?state, "connection state");
        }
    });

    connect(&manager).await?;
    tokio::signal::ctrl_c().await?;
    manager.disconnect().await;
    state_log.abort();
    printer.abort();
    Ok(())
}

async fn run_typing(config: RealtimeConfig, tokens: Arc<dyn TokenStore>, args: TypingArgs) -> Result<(), CliError> {
    let manager = ConnectionManager::new(config, tokens);
    connect(&manager).await?;
    wait_connected(&manager).await?;

    let sent = send_typing(&manager, &args.conversation_id, !args.stop);
    manager.disconnect().await;
    if sent {
        eprintln!("typing indicator sent");
    }
    Ok(())
}

async fn run_lock(config: RealtimeConfig, tokens: Arc<dyn TokenStore>, args: LockArgs) -> Result<(), CliError> {
    let manager = ConnectionManager::new(config, tokens);
    connect(&manager).await?;
    wait_connected(&manager).await?;

    let user = CurrentUser { id: args.user_id, email: args.user_email };
    let watch = RecordLockWatch::mount(&manager, &args.entity_type, Some(&args.entity_id), user);
    eprintln!("holding lock on {}/{}; Ctrl-C to release", args.entity_type, args.entity_id);

    let mut last: Option<LockHolder> = None;
    let mut poll = tokio::time::interval(LOCK_POLL_INTERVAL);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                result?;
                break;
            }
            _ = poll.tick() => {
                let current = watch.locked_by();
                if current != last {
                    print_json(&lock_report(current.as_ref()))?;
                    last = current;
                }
            }
        }
    }

    drop(watch);
    manager.disconnect().await;
    Ok(())
}

// =============================================================================
// HELPERS
// =============================================================================

async fn connect(manager: &ConnectionManager) -> Result<(), CliError> {
    match manager.connect().await {
        ConnectOutcome::MissingToken => Err(CliError::MissingToken),
        ConnectOutcome::Started | ConnectOutcome::AlreadyActive => Ok(()),
    }
}

async fn wait_connected(manager: &ConnectionManager) -> Result<(), CliError> {
    let mut states = manager.watch_state();
    match tokio::time::timeout(CONNECT_TIMEOUT, states.wait_for(|s| *s == ConnectionState::Connected)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(_)) | Err(_) => Err(CliError::Timeout),
    }
}

fn watch_kinds(names: &[String]) -> Vec<MessageKind> {
    if names.is_empty() {
        return MessageKind::KNOWN.to_vec();
    }
    let mut seen = HashSet::new();
    names
        .iter()
        .map(|n| MessageKind::parse(n.trim()))
        .filter(|kind| seen.insert(kind.clone()))
        .collect()
}

/// One output line for a watched frame, as received. Frames of other kinds
/// and text that is not an envelope yield `None`.
fn frame_line(text: &str, kinds: &[MessageKind]) -> Option<String> {
    let envelope = frames::decode_envelope(text).ok()?;
    if !kinds.contains(&MessageKind::parse(&envelope.kind)) {
        return None;
    }
    serde_json::to_string(&envelope).ok()
}

fn token_report(token: Option<&str>, now: i64) -> Value {
    let Some(token) = token else {
        return json!({ "stored": false });
    };
    match auth::decode_expiry(token) {
        Ok(Some(exp)) => json!({
            "stored": true,
            "expires_at": exp,
            "expired": auth::is_expired(token, now),
            "remaining_secs": exp.saturating_sub(now).max(0),
        }),
        Ok(None) => json!({ "stored": true, "expires_at": null, "expired": false }),
        Err(e) => json!({ "stored": true, "expired": true, "error": e.to_string() }),
    }
}

fn lock_report(holder: Option<&LockHolder>) -> Value {
    match holder {
        Some(h) => json!({ "locked_by_other": true, "user_id": h.user_id, "user_email": h.user_email }),
        None => json!({ "locked_by_other": false }),
    }
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
