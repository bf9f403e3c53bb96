//! Continuous-operation controller.
//!
//! Runs inbox scan cycles back-to-back separated by a sleep. Cycle
//! errors are classified against a catalogue of known transient
//! transport/protocol signatures; transient failures back off with a
//! growing, capped sleep and throttled log severity. SIGINT/SIGTERM
//! exit the loop cleanly between cycles; cancellation is not an error.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::Error;
use crate::github::GitHubClient;
use crate::mailstore::{ImapSession, MailStore};
use crate::notify::{Notifier, Severity, SlackWebhook};
use crate::pipeline::{MessageProcessor, PrefetchCache, ProcessedLedger};

/// Backoff sleep never exceeds this.
pub const BACKOFF_CEILING: Duration = Duration::from_secs(60);

/// Every Nth consecutive transient failure logs at error severity.
const ESCALATION_PERIOD: u32 = 5;

/// Error-message signatures considered transient and worth retrying
/// with backoff.
pub const TRANSIENT_ERRORS: &[&str] = &[
    "unexpected EOF",
    "unexpected end of file",
    "connection reset by peer",
    "timed out",
    "Resource temporarily unavailable",
    "broken pipe",
    "connection closed",
    "NO Lookup failed",
    "NO System Error",
];

/// Check an error's rendered chain against the transient catalogue.
pub fn is_transient_error(err: &Error) -> bool {
    let message = err.to_string();
    TRANSIENT_ERRORS.iter().any(|sig| message.contains(sig))
}

fn is_cancelled(err: &Error) -> bool {
    matches!(err, Error::Pipeline(p) if p.is_cancelled())
}

/// Consecutive-transient-failure counter and the derived sleep.
#[derive(Debug)]
pub struct BackoffState {
    base: Duration,
    failures: u32,
}

impl BackoffState {
    pub fn new(base: Duration) -> Self {
        Self { base, failures: 0 }
    }

    /// Any successful cycle resets the counter.
    pub fn on_success(&mut self) {
        self.failures = 0;
    }

    /// Record one transient failure; returns the new count.
    pub fn on_transient_failure(&mut self) -> u32 {
        self.failures += 1;
        self.failures
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// `min(base * (failures + 1), ceiling)`.
    pub fn sleep_interval(&self) -> Duration {
        (self.base * (self.failures + 1)).min(BACKOFF_CEILING)
    }
}

/// Run one full scan cycle against a fresh mail-store session.
///
/// Dials and authenticates, selects the inbox, processes every page,
/// then logs out. The prefetch cache and ledger are the caller's:
/// their lifetime spans cycles.
pub fn run_once(
    config: &Config,
    cache: &mut PrefetchCache,
    ledger: &mut ProcessedLedger,
    uid_filter: Option<&HashSet<u32>>,
    dry_run: bool,
    cancel: &AtomicBool,
) -> Result<(), Error> {
    let provider = GitHubClient::new(config.github.token.clone());
    let policy = config
        .github
        .approval_enabled
        .then_some(&config.github.approval_policy);
    let processor = MessageProcessor::new(&config.rules, &provider, policy, dry_run);

    let credentials = &config.credentials;
    let mut session = ImapSession::connect(
        &credentials.host,
        credentials.port,
        &credentials.username,
        &credentials.password,
    )?;

    let result = processor.run_cycle(&mut session, cache, ledger, uid_filter, cancel);
    if let Err(e) = session.close() {
        debug!(error = %e, "Error closing IMAP session");
    }
    result.map_err(Error::from)
}

/// One bounded invocation (the `once` subcommand). Installs a signal
/// listener so a long scan can still be interrupted at a page boundary.
pub async fn run_once_command(
    config: Arc<Config>,
    uid_filter: Option<HashSet<u32>>,
    dry_run: bool,
) -> Result<(), Error> {
    let shutdown = Arc::new(AtomicBool::new(false));
    spawn_shutdown_listener(Arc::clone(&shutdown), Arc::new(Notify::new()));

    let handle = tokio::task::spawn_blocking(move || {
        let mut cache = PrefetchCache::new();
        let mut ledger = ProcessedLedger::new();
        run_once(
            &config,
            &mut cache,
            &mut ledger,
            uid_filter.as_ref(),
            dry_run,
            &shutdown,
        )
    });
    handle.await.expect("scan task panicked")
}

/// List mailbox names (the `list-mailboxes` subcommand).
pub async fn run_list_mailboxes(config: Arc<Config>) -> Result<(), Error> {
    let handle = tokio::task::spawn_blocking(move || -> Result<Vec<String>, Error> {
        let credentials = &config.credentials;
        let mut session = ImapSession::connect(
            &credentials.host,
            credentials.port,
            &credentials.username,
            &credentials.password,
        )?;
        let mailboxes = session.list_mailboxes()?;
        let _ = session.close();
        Ok(mailboxes)
    });
    let mailboxes = handle.await.expect("list task panicked")?;
    info!(mailboxes = %mailboxes.join("\n"), "Found mailboxes");
    Ok(())
}

/// Server mode: cycles until a shutdown signal arrives.
pub async fn run_server(config: Config, dry_run: bool) -> Result<(), Error> {
    let config = Arc::new(config);
    let shutdown = Arc::new(AtomicBool::new(false));
    let wake = Arc::new(Notify::new());
    spawn_shutdown_listener(Arc::clone(&shutdown), Arc::clone(&wake));

    let notifier = match config.slack {
        Some(ref slack) => Notifier::new(
            Arc::new(SlackWebhook::new(slack.webhook_url.clone())),
            slack.send_level,
        ),
        None => Notifier::disabled(),
    };

    info!("Server started (press Ctrl+C to stop)");

    // Run-lifetime shared state: both survive across cycles so repeat
    // messages stay no-ops and repeat references stay cached.
    let mut cache = PrefetchCache::new();
    let mut ledger = ProcessedLedger::new();
    let mut backoff = BackoffState::new(config.server.sleep_interval);

    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        let cycle = {
            let config = Arc::clone(&config);
            let shutdown = Arc::clone(&shutdown);
            let mut moved_cache = cache;
            let mut moved_ledger = ledger;
            tokio::task::spawn_blocking(move || {
                let result = run_once(
                    &config,
                    &mut moved_cache,
                    &mut moved_ledger,
                    None,
                    dry_run,
                    &shutdown,
                );
                (result, moved_cache, moved_ledger)
            })
        };
        let result = match cycle.await {
            Ok((result, returned_cache, returned_ledger)) => {
                cache = returned_cache;
                ledger = returned_ledger;
                result
            }
            Err(e) => {
                error!(error = %e, "Cycle task panicked");
                cache = PrefetchCache::new();
                ledger = ProcessedLedger::new();
                Ok(())
            }
        };

        match result {
            Ok(()) => backoff.on_success(),
            Err(ref e) if is_cancelled(e) => break,
            Err(e) => {
                const MESSAGE: &str = "Failed to process messages";
                if is_transient_error(&e) {
                    let failures = backoff.on_transient_failure();
                    let fields = [
                        ("error", e.to_string()),
                        ("failures", failures.to_string()),
                    ];
                    if failures % ESCALATION_PERIOD == 0 {
                        error!(error = %e, failures, "Failed to process messages");
                        notifier.post(Severity::Error, MESSAGE, &fields).await;
                    } else {
                        warn!(error = %e, failures, "Failed to process messages");
                        notifier.post(Severity::Warn, MESSAGE, &fields).await;
                    }
                } else {
                    error!(error = %e, "Failed to process messages");
                    notifier
                        .post(Severity::Error, MESSAGE, &[("error", e.to_string())])
                        .await;
                }
            }
        }

        let sleep = backoff.sleep_interval();
        if sleep > config.server.sleep_interval {
            warn!(
                interval = ?sleep,
                failures = backoff.failures(),
                "Backing off"
            );
            notifier
                .post(
                    Severity::Warn,
                    "Backing off",
                    &[
                        ("interval", format!("{sleep:?}")),
                        ("failures", backoff.failures().to_string()),
                    ],
                )
                .await;
        }

        tokio::select! {
            _ = wake.notified() => break,
            _ = tokio::time::sleep(sleep) => {}
        }
    }

    info!("Server stopped");
    Ok(())
}

fn spawn_shutdown_listener(shutdown: Arc<AtomicBool>, wake: Arc<Notify>) {
    tokio::spawn(async move {
        wait_for_signal().await;
        debug!("Received shutdown signal");
        shutdown.store(true, Ordering::Relaxed);
        wake.notify_waiters();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
