//! Per-message processing and the inbox scan cycle.
//!
//! A cycle walks the selected mailbox in fixed-size sequence windows
//! until an empty page, runs each not-yet-ledgered message through
//! normalize → rules → dispatch, and records completed UIDs in the
//! ledger. A processing error aborts the remainder of the cycle and
//! propagates; the caller decides whether and when to retry.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info};

use crate::error::PipelineError;
use crate::github::PullRequestProvider;
use crate::mailstore::{MailStore, PageWindow};
use crate::pipeline::actions::{Action, ActionDispatcher, ApprovalGate, ApprovalPolicy};
use crate::pipeline::prefetch::{PrefetchCache, PrefetchResolver};
use crate::pipeline::rules::RuleSet;
use crate::pipeline::types::MailMessage;

/// Sequence window size for paged fetching.
pub const PAGE_SIZE: u32 = 100;

const INBOX: &str = "INBOX";

/// UIDs already handled in this run. Lifetime = one process invocation;
/// nothing is persisted across restarts.
#[derive(Debug, Default)]
pub struct ProcessedLedger {
    uids: HashSet<u32>,
}

impl ProcessedLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, uid: u32) -> bool {
        self.uids.contains(&uid)
    }

    pub fn record(&mut self, uid: u32) {
        self.uids.insert(uid);
    }

    pub fn len(&self) -> usize {
        self.uids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uids.is_empty()
    }
}

/// Evaluates messages against the rule set and dispatches the results.
///
/// Holds the per-run collaborators; per-cycle state (store session,
/// prefetch cache, ledger) is passed into each call so tests and the
/// controller can inject their own.
pub struct MessageProcessor<'a> {
    ruleset: &'a RuleSet,
    provider: &'a dyn PullRequestProvider,
    /// Present only when the approval feature is enabled.
    approval_policy: Option<&'a ApprovalPolicy>,
    dry_run: bool,
}

impl<'a> MessageProcessor<'a> {
    pub fn new(
        ruleset: &'a RuleSet,
        provider: &'a dyn PullRequestProvider,
        approval_policy: Option<&'a ApprovalPolicy>,
        dry_run: bool,
    ) -> Self {
        Self {
            ruleset,
            provider,
            approval_policy,
            dry_run,
        }
    }

    /// Evaluate one message and execute whatever actions accumulate.
    ///
    /// Returns the actions taken (planned actions under dry-run). Seen
    /// messages and non-matching messages return an empty list.
    pub fn evaluate_and_act(
        &self,
        store: &mut dyn MailStore,
        cache: &mut PrefetchCache,
        message: &MailMessage,
    ) -> Result<Vec<Action>, PipelineError> {
        let mut resolver = PrefetchResolver::new(self.provider, cache);
        let plan = self.ruleset.plan(message, &mut resolver);

        if plan.actions.is_empty() {
            debug!(uid = message.uid, subject = %message.subject, "No actions matched");
            return Ok(plan.actions);
        }

        let described: Vec<String> = plan.actions.iter().map(|a| a.to_string()).collect();
        info!(
            uid = message.uid,
            subject = %message.subject,
            actions = %described.join(", "),
            dry_run = self.dry_run,
            "Actions matched"
        );
        if self.dry_run {
            return Ok(plan.actions);
        }

        let gate = self.approval_policy.map(|policy| ApprovalGate {
            provider: self.provider,
            policy,
        });
        ActionDispatcher::new(store, gate).execute(message.uid, &plan.actions, &plan.prefetched)?;
        Ok(plan.actions)
    }

    /// Run one full inbox scan.
    ///
    /// `uid_filter` restricts a bounded invocation to an explicit UID
    /// set. Cancellation is observed at page boundaries; messages of the
    /// in-flight page finish first.
    pub fn run_cycle(
        &self,
        store: &mut dyn MailStore,
        cache: &mut PrefetchCache,
        ledger: &mut ProcessedLedger,
        uid_filter: Option<&HashSet<u32>>,
        cancel: &AtomicBool,
    ) -> Result<(), PipelineError> {
        store.select(INBOX, true)?;

        let mut window = PageWindow::new(1, PAGE_SIZE);
        loop {
            if cancel.load(Ordering::Relaxed) {
                return Err(PipelineError::Cancelled);
            }

            let page = store.fetch_page(window)?;
            if page.is_empty() {
                debug!("No more messages in mailbox");
                return Ok(());
            }

            for fetched in &page {
                if ledger.contains(fetched.uid) {
                    debug!(uid = fetched.uid, "Skipped processed message");
                    continue;
                }
                if let Some(filter) = uid_filter {
                    if !filter.contains(&fetched.uid) {
                        debug!(uid = fetched.uid, "Skipped message not in target UIDs");
                        continue;
                    }
                }

                let message = MailMessage::from_fetched(fetched);
                if !message.seen {
                    debug!(
                        uid = message.uid,
                        from = ?message.from,
                        subject = %message.subject,
                        "Unread message"
                    );
                }

                self.evaluate_and_act(store, cache, &message)
                    .map_err(|e| PipelineError::for_uid(message.uid, e))?;
                ledger.record(message.uid);
            }

            window = window.next();
        }
    }
}
