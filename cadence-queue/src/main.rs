//! cadence-queue - Inspect and repair the publishing queue
//!
//! Operator tool for the state cadence-send works on: due posts, the
//! dead-letter queue, connected accounts and queue statistics.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use libcadence::accounts::AccountRepository;
use libcadence::logging::LoggingConfig;
use libcadence::retry::{RetryCoordinator, RetryPolicy};
use libcadence::types::DeadLetterEntry;
use libcadence::{Adapters, CadenceError, Config, Database, Post, Result, SocialAccount, Vault};

/// Upper bound on the posts `due` lists
const DUE_LIMIT: u32 = 500;

#[derive(Parser, Debug)]
#[command(name = "cadence-queue")]
#[command(version)]
#[command(about = "Inspect and repair the publishing queue")]
#[command(long_about = "\
cadence-queue - Inspect and repair the publishing queue

DESCRIPTION:
    cadence-queue shows what the cadence-send worker is working on and lets
    an operator act on what it could not finish.

COMMANDS:
    due           List posts that are due for publishing
    dead-letters  List publishes that exhausted their retries
    requeue       Give a dead-lettered publish a fresh set of attempts
    accounts      List the connected accounts of a team
    disconnect    Disconnect an account and drop its tokens
    stats         Show queue statistics
    keygen        Generate a token encryption key

USAGE EXAMPLES:
    # What would the next poll pick up?
    cadence-queue due

    # Open dead letters as JSON
    cadence-queue dead-letters --format json

    # Retry a dead-lettered publish
    cadence-queue requeue <DEAD_LETTER_ID>

    # Check that a team's tokens still work
    cadence-queue accounts <TEAM_ID> --check

    # Create a key for CADENCE_VAULT_KEY
    cadence-queue keygen

CONFIGURATION:
    Configuration file: $CADENCE_CONFIG or ~/.config/cadence/config.toml
    Account commands need the token encryption key in $CADENCE_VAULT_KEY

EXIT CODES:
    0 - Success
    1 - Operation failed
    2 - Database or configuration error
    3 - Invalid input (bad ID, unknown dead letter, etc.)
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List posts that are due for publishing
    Due {
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List dead-lettered publishes
    DeadLetters {
        /// Include entries that were already requeued
        #[arg(long)]
        all: bool,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Requeue a dead-lettered publish
    Requeue {
        /// Dead letter ID
        id: String,
    },

    /// List a team's connected accounts
    Accounts {
        /// Team ID
        team_id: String,

        /// Ask each platform whether the stored token still works
        #[arg(long)]
        check: bool,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Disconnect an account
    Disconnect {
        /// Account ID
        account_id: String,
    },

    /// Show queue statistics
    Stats {
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Print a new random token encryption key
    Keygen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = CadenceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            other => Err(CadenceError::InvalidInput(format!(
                "Invalid format '{}'. Must be 'text' or 'json'",
                other
            ))),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut logging = LoggingConfig::from_env(cli.verbose);
    if std::env::var("CADENCE_LOG_LEVEL").is_err() {
        logging.level = "warn".to_string();
    }
    if let Err(e) = logging.init() {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    // keygen is how a first install gets its key; it needs no config
    if let Commands::Keygen = cli.command {
        println!("{}", Vault::generate_key());
        return Ok(());
    }

    let config = Config::load()?;
    let db = Database::new(&config.database.path).await?;
    let now = chrono::Utc::now().timestamp();

    let result = match cli.command {
        Commands::Due { format } => cmd_due(&db, format.parse()?, now).await,
        Commands::DeadLetters { all, format } => {
            let retry = RetryCoordinator::new(db.clone(), RetryPolicy::from_config(&config.scheduling));
            cmd_dead_letters(&retry, all, format.parse()?, now).await
        }
        Commands::Requeue { id } => {
            validate_id(&id, "dead letter")?;
            let retry = RetryCoordinator::new(db.clone(), RetryPolicy::from_config(&config.scheduling));
            cmd_requeue(&retry, &id, now).await
        }
        Commands::Accounts {
            team_id,
            check,
            format,
        } => {
            let format = format.parse()?;
            let accounts = account_repository(&db, &config)?;
            let adapters = if check {
                Adapters::from_config(&config.platforms)?
            } else {
                Adapters::new()
            };
            cmd_accounts(&accounts, &adapters, &team_id, check, format, now).await
        }
        Commands::Disconnect { account_id } => {
            validate_id(&account_id, "account")?;
            let accounts = account_repository(&db, &config)?;
            cmd_disconnect(&accounts, &account_id).await
        }
        Commands::Stats { format } => cmd_stats(&db, format.parse()?, now).await,
        Commands::Keygen => Ok(()),
    };

    db.close().await;
    result
}

fn account_repository(db: &Database, config: &Config) -> Result<AccountRepository> {
    let vault = Vault::from_config(&config.vault)?;
    Ok(AccountRepository::new(db.clone(), Arc::new(vault)))
}

fn validate_id(id: &str, what: &str) -> Result<()> {
    uuid::Uuid::parse_str(id)
        .map(|_| ())
        .map_err(|_| CadenceError::InvalidInput(format!("Invalid {} ID '{}'", what, id)))
}

/// List due posts
async fn cmd_due(db: &Database, format: OutputFormat, now: i64) -> Result<()> {
    let posts = db.due_posts(now, DUE_LIMIT).await?;

    match format {
        OutputFormat::Json => print_json(&posts)?,
        OutputFormat::Text => output_due_text(&posts, now),
    }
    Ok(())
}

fn output_due_text(posts: &[Post], now: i64) {
    for post in posts {
        let due_at = match post.status {
            libcadence::PostStatus::Queued => post.next_attempt_at,
            _ => post.scheduled_at,
        };
        let platforms: Vec<&str> = post.platforms.iter().map(|p| p.as_str()).collect();

        println!(
            "{} | {} | {} | {} | {}",
            post.id,
            post.status.as_str(),
            platforms.join(","),
            truncate_content(&post.content, 50),
            due_at
                .map(|ts| format_age(now, ts))
                .unwrap_or_else(|| "unknown".to_string())
        );
    }
}

/// List dead letters, newest first
async fn cmd_dead_letters(
    retry: &RetryCoordinator,
    include_resolved: bool,
    format: OutputFormat,
    now: i64,
) -> Result<()> {
    let entries = retry.list_dead_letters(include_resolved).await?;

    match format {
        OutputFormat::Json => print_json(&entries)?,
        OutputFormat::Text => output_dead_letters_text(&entries, now),
    }
    Ok(())
}

fn output_dead_letters_text(entries: &[DeadLetterEntry], now: i64) {
    for entry in entries {
        let state = match entry.resolved_at {
            Some(_) => "resolved",
            None => "open",
        };
        println!(
            "{} | {} | {} | {} attempts | {} | {} | {}",
            entry.id,
            entry.post_id,
            entry.platform,
            entry.attempts,
            truncate_content(&entry.last_error, 60),
            format_age(now, entry.created_at),
            state
        );
    }
}

async fn cmd_requeue(retry: &RetryCoordinator, id: &str, now: i64) -> Result<()> {
    let entry = retry.requeue(id, now).await?;
    println!("Requeued post {} on {}", entry.post_id, entry.platform);
    Ok(())
}

/// Per-account output of `accounts`
#[derive(serde::Serialize)]
struct AccountRow {
    #[serde(flatten)]
    account: SocialAccount,
    /// Set only with --check
    token_valid: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    check_error: Option<String>,
}

async fn cmd_accounts(
    accounts: &AccountRepository,
    adapters: &Adapters,
    team_id: &str,
    check: bool,
    format: OutputFormat,
    now: i64,
) -> Result<()> {
    let mut rows = Vec::new();

    for account in accounts.find_by_team_id(team_id).await? {
        let mut row = AccountRow {
            account,
            token_valid: None,
            check_error: None,
        };
        if check {
            match check_token(accounts, adapters, &row.account).await {
                Ok(valid) => row.token_valid = Some(valid),
                Err(e) => row.check_error = Some(e.to_string()),
            }
        }
        rows.push(row);
    }

    match format {
        OutputFormat::Json => print_json(&rows)?,
        OutputFormat::Text => output_accounts_text(&rows, now),
    }
    Ok(())
}

/// Ask the platform whether the account's token is still accepted
async fn check_token(
    accounts: &AccountRepository,
    adapters: &Adapters,
    account: &SocialAccount,
) -> Result<bool> {
    if account.status.requires_reconnect() {
        return Ok(false);
    }
    let adapter = Arc::clone(adapters.require(account.platform)?);

    let valid = accounts
        .with_credentials(account, move |credentials| async move {
            adapter.validate_token(&credentials).await
        })
        .await??;

    tracing::debug!(account_id = %account.id, valid = valid, "Token checked");
    Ok(valid)
}

fn output_accounts_text(rows: &[AccountRow], now: i64) {
    for row in rows {
        let account = &row.account;
        let expires = account
            .token_expires_at
            .map(|ts| format!("expires {}", format_age(now, ts)))
            .unwrap_or_else(|| "no expiry".to_string());
        let check = match (&row.token_valid, &row.check_error) {
            (Some(true), _) => " | token ok",
            (Some(false), _) => " | token rejected",
            (None, Some(_)) => " | check failed",
            (None, None) => "",
        };

        println!(
            "{} | {} | {} | {} | {}{}",
            account.id,
            account.platform,
            account.handle.as_deref().unwrap_or(&account.platform_user_id),
            account.status.as_str(),
            expires,
            check
        );
        if let Some(error) = &row.check_error {
            eprintln!("{}: {}", account.id, error);
        }
    }
}

async fn cmd_disconnect(accounts: &AccountRepository, account_id: &str) -> Result<()> {
    if !accounts.disconnect(account_id).await? {
        return Err(CadenceError::InvalidInput(format!(
            "No connected account with ID '{}'",
            account_id
        )));
    }
    println!("Disconnected account {}", account_id);
    Ok(())
}

async fn cmd_stats(db: &Database, format: OutputFormat, now: i64) -> Result<()> {
    let stats = db.queue_stats(now).await?;

    match format {
        OutputFormat::Json => print_json(&stats)?,
        OutputFormat::Text => {
            println!("Scheduled:         {}", stats.scheduled);
            println!("Queued:            {}", stats.queued);
            println!("Due now:           {}", stats.due_now);
            println!("Published:         {}", stats.published);
            println!("Failed:            {}", stats.failed);
            println!("Drafts:            {}", stats.draft);
            println!("Pending retries:   {}", stats.pending_retries);
            println!("Open dead letters: {}", stats.open_dead_letters);
        }
    }
    Ok(())
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| CadenceError::InvalidInput(format!("JSON output failed: {}", e)))?;
    println!("{}", json);
    Ok(())
}

/// Truncate to `max_chars` characters with an ellipsis
fn truncate_content(content: &str, max_chars: usize) -> String {
    let single_line = content.replace('\n', " ");
    if single_line.chars().count() <= max_chars {
        single_line
    } else {
        let truncated: String = single_line.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

/// "in 5m" or "3h 2m ago", relative to `now`
fn format_age(now: i64, at: i64) -> String {
    let diff = at - now;
    // minute precision is enough for an operator
    let rounded = |secs: i64| Duration::from_secs((secs.unsigned_abs() / 60) * 60);

    if diff.abs() < 60 {
        "now".to_string()
    } else if diff > 0 {
        format!("in {}", humantime::format_duration(rounded(diff)))
    } else {
        format!("{} ago", humantime::format_duration(rounded(diff)))
    }
}
