//! cadence-send - Background worker for scheduled publishing
//!
//! Polls the queue for due posts and publishes them, keeps account tokens
//! fresh, and refreshes analytics for published posts.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use libcadence::accounts::AccountRepository;
use libcadence::analytics::AnalyticsRefresher;
use libcadence::cache::MemoryCache;
use libcadence::lock::{LockManager, SqlLockManager};
use libcadence::logging::LoggingConfig;
use libcadence::refresh::TokenRefresher;
use libcadence::retry::{RetryCoordinator, RetryPolicy};
use libcadence::{Adapters, CadenceError, Config, Database, Dispatcher, Poller, Result, Vault};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "cadence-send")]
#[command(version)]
#[command(about = "Background worker for scheduled publishing")]
#[command(long_about = "\
cadence-send - Background worker for scheduled publishing

DESCRIPTION:
    cadence-send is a long-running worker that publishes scheduled posts to
    Twitter/X, LinkedIn and Mastodon when they come due.

    Every poll it refreshes account tokens that are about to expire, claims
    due posts and publishes them, retrying transient failures with
    exponential backoff. Pairs that keep failing are moved to the
    dead-letter queue (see cadence-queue dead-letters). Several workers may
    share one database; they coordinate through short-lived locks.

USAGE:
    # Run in foreground (logs to stderr)
    cadence-send

    # Poll every 10 seconds
    cadence-send --poll-interval 10

    # Process due posts once and exit
    cadence-send --once

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (in-flight publishes get
                      scheduling.shutdown_grace_secs to finish)

CONFIGURATION:
    Configuration file: $CADENCE_CONFIG or ~/.config/cadence/config.toml
    Token encryption key: $CADENCE_VAULT_KEY (see cadence-queue keygen)
    Logging: CADENCE_LOG_FORMAT (text, json, pretty), CADENCE_LOG_LEVEL

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration error
    3 - Invalid arguments
")]
struct Cli {
    /// Poll interval in seconds (overrides config)
    #[arg(long, value_name = "SECONDS")]
    poll_interval: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Run one poll and one analytics cycle, print the reports and exit
    #[arg(long)]
    once: bool,
}

/// Everything one worker process runs
struct Worker {
    poller: Poller,
    analytics: AnalyticsRefresher,
}

impl Worker {
    fn build(db: Database, vault: Vault, adapters: Adapters, config: &Config) -> Self {
        let scheduling = &config.scheduling;
        let accounts = AccountRepository::new(db.clone(), Arc::new(vault));
        let locks: Arc<dyn LockManager> = Arc::new(SqlLockManager::new(db.clone()));

        let refresher = Arc::new(TokenRefresher::new(
            accounts.clone(),
            adapters.clone(),
            Arc::clone(&locks),
            scheduling.lock_ttl(),
            Duration::from_secs(scheduling.refresh_lookahead_secs),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            db.clone(),
            accounts.clone(),
            adapters.clone(),
            locks,
            RetryCoordinator::new(db.clone(), RetryPolicy::from_config(scheduling)),
            Arc::clone(&refresher),
            scheduling.lock_ttl(),
        ));

        let poller = Poller::new(db.clone(), dispatcher, scheduling).with_token_sweep(refresher);
        let analytics = AnalyticsRefresher::new(
            db,
            accounts,
            adapters,
            Arc::new(MemoryCache::new()),
            &config.analytics,
        );

        Self { poller, analytics }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = LoggingConfig::from_env(cli.verbose).init() {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }

    if let Err(e) = run(cli).await {
        error!(error = %e, "cadence-send exiting");
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load()?;
    if let Some(secs) = cli.poll_interval {
        if secs == 0 {
            return Err(CadenceError::InvalidInput(
                "--poll-interval must be greater than 0".to_string(),
            ));
        }
        config.scheduling.poll_interval_secs = secs;
    }

    let vault = Vault::from_config(&config.vault)?;
    let adapters = Adapters::from_config(&config.platforms)?;
    let db = Database::new(&config.database.path).await?;

    info!(
        platforms = ?adapters.configured(),
        poll_interval_secs = config.scheduling.poll_interval_secs,
        max_workers = config.scheduling.max_workers,
        "cadence-send starting"
    );

    // leftovers from workers that died holding locks
    let purged = SqlLockManager::new(db.clone()).purge_expired().await?;
    if purged > 0 {
        info!(count = purged, "Removed expired locks");
    }

    let worker = Worker::build(db.clone(), vault, adapters, &config);

    if cli.once {
        let cycle = worker.poller.run_cycle().await?;
        let analytics = worker.analytics.refresh_cycle().await?;
        let report = serde_json::json!({ "poll": cycle, "analytics": analytics });
        println!("{}", report);
        db.close().await;
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let signals = spawn_signal_listener(cancel.clone())?;

    let Worker { poller, analytics } = worker;
    let analytics_cancel = cancel.clone();
    let analytics_task = tokio::spawn(async move { analytics.run(analytics_cancel).await });

    let result = poller.run(cancel.clone()).await;

    cancel.cancel();
    match analytics_task.await {
        Ok(Err(e)) => error!(error = %e, "Analytics refresher failed"),
        Err(e) => error!(error = %e, "Analytics refresher panicked"),
        Ok(Ok(())) => {}
    }
    signals.close();
    db.close().await;

    info!("cadence-send stopped");
    result
}

/// Cancel `cancel` on SIGINT or SIGTERM
#[cfg(unix)]
fn spawn_signal_listener(cancel: CancellationToken) -> Result<SignalListener> {
    use futures::stream::StreamExt;
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook_tokio::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM]).map_err(|e| {
        CadenceError::Io(std::io::Error::new(
            e.kind(),
            format!("signal setup failed: {}", e),
        ))
    })?;
    let handle = signals.handle();

    tokio::spawn(async move {
        if let Some(signal) = signals.next().await {
            info!(signal = signal, "Received shutdown signal, stopping gracefully");
            cancel.cancel();
        }
    });

    Ok(SignalListener(handle))
}

#[cfg(not(unix))]
fn spawn_signal_listener(cancel: CancellationToken) -> Result<SignalListener> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, stopping gracefully");
            cancel.cancel();
        }
    });
    Ok(SignalListener(()))
}

#[cfg(unix)]
struct SignalListener(signal_hook_tokio::Handle);

#[cfg(not(unix))]
struct SignalListener(());

impl SignalListener {
    fn close(self) {
        #[cfg(unix)]
        self.0.close();
    }
}
