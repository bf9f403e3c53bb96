//! Action grammar and dispatch.
//!
//! Action strings are parsed once at config-load time into [`Action`];
//! the dispatcher only pattern-matches the parsed variants. Execution
//! order equals list order, and a failing action aborts the rest of the
//! message's list; there is no partial-success continuation.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::github::PullRequestProvider;
use crate::mailstore::MailStore;
use crate::pipeline::prefetch::ResolvedPrefetches;

/// Where `delete` sends messages. Gmail exposes trash as a mailbox.
pub const TRASH_MAILBOX: &str = "[Gmail]/Trash";

static MOVE_TO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)^move\s+to\s+"([^"]*)"$"#).unwrap());
static LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)^label\s+"([^"]*)"$"#).unwrap());
static DELETE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)^delete$").unwrap());
static GITHUB_REVIEW: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^github\s+review$").unwrap());

/// One parsed action from a filter's action list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Alias for moving to [`TRASH_MAILBOX`].
    Delete,
    MoveTo(String),
    Label(String),
    /// Gated GitHub pull request approval.
    Review,
    /// Unrecognized action string; warned about and skipped at dispatch.
    Unknown(String),
}

impl Action {
    /// Parse one action string. Keywords are case-insensitive; quoted
    /// arguments keep their case.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if DELETE.is_match(trimmed) {
            Self::Delete
        } else if let Some(captures) = MOVE_TO.captures(trimmed) {
            Self::MoveTo(captures[1].to_string())
        } else if let Some(captures) = LABEL.captures(trimmed) {
            Self::Label(captures[1].to_string())
        } else if GITHUB_REVIEW.is_match(trimmed) {
            Self::Review
        } else {
            Self::Unknown(raw.to_string())
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delete => write!(f, "delete"),
            Self::MoveTo(dest) => write!(f, "move to {dest:?}"),
            Self::Label(name) => write!(f, "label {name:?}"),
            Self::Review => write!(f, "github review"),
            Self::Unknown(raw) => write!(f, "{raw}"),
        }
    }
}

/// Allow-lists gating the approval action.
#[derive(Debug, Clone, Default)]
pub struct ApprovalPolicy {
    /// `owner/repo` names approvals may be submitted for.
    pub allowed_repositories: Vec<String>,
    /// Pull request authors approvals may be submitted for.
    pub allowed_authors: Vec<String>,
}

/// Provider plus policy, present only when the approval feature is
/// enabled in configuration.
pub struct ApprovalGate<'a> {
    pub provider: &'a dyn PullRequestProvider,
    pub policy: &'a ApprovalPolicy,
}

/// Executes a message's accumulated action list against the mail store.
pub struct ActionDispatcher<'a> {
    store: &'a mut dyn MailStore,
    approvals: Option<ApprovalGate<'a>>,
}

impl<'a> ActionDispatcher<'a> {
    pub fn new(store: &'a mut dyn MailStore, approvals: Option<ApprovalGate<'a>>) -> Self {
        Self { store, approvals }
    }

    /// Execute actions in order. Every mutation targets exactly the one
    /// given uid. The first failure aborts the remaining actions.
    pub fn execute(
        &mut self,
        uid: u32,
        actions: &[Action],
        prefetched: &ResolvedPrefetches,
    ) -> Result<(), PipelineError> {
        for action in actions {
            match action {
                Action::Delete => self.move_message(uid, TRASH_MAILBOX, action)?,
                Action::MoveTo(destination) => self.move_message(uid, destination, action)?,
                Action::Label(name) => {
                    self.store
                        .copy_message(uid, name)
                        .map_err(|e| PipelineError::Action {
                            action: action.to_string(),
                            source: e,
                        })?;
                }
                Action::Review => self.review(uid, prefetched)?,
                Action::Unknown(raw) => {
                    warn!(action = %raw, "Unknown action");
                }
            }
        }
        Ok(())
    }

    fn move_message(
        &mut self,
        uid: u32,
        destination: &str,
        action: &Action,
    ) -> Result<(), PipelineError> {
        self.store
            .move_message(uid, destination)
            .map_err(|e| PipelineError::Action {
                action: action.to_string(),
                source: e,
            })
    }

    /// The approval action. Allow-list rejections and already-approved
    /// pull requests are silent skips, not errors.
    fn review(&mut self, uid: u32, prefetched: &ResolvedPrefetches) -> Result<(), PipelineError> {
        let gate = match self.approvals {
            Some(ref gate) => gate,
            None => {
                // Config validation rejects review actions while the
                // feature is disabled, so this is unreachable in practice.
                warn!(uid, "Review action dispatched without approval gate");
                return Ok(());
            }
        };

        let pr = prefetched
            .pull_request
            .as_ref()
            .ok_or(PipelineError::MissingPrefetchData)?;
        let reference = pr.reference();
        let repo = reference.repo_full_name();

        if !gate.policy.allowed_repositories.contains(&repo) {
            debug!(uid, repo = %repo, "Repository not in allowed list");
            return Ok(());
        }
        if !gate.policy.allowed_authors.contains(&pr.author) {
            debug!(uid, author = %pr.author, "Author not in allowed list");
            return Ok(());
        }

        let me = gate.provider.current_username()?;
        let approvals = gate.provider.list_approvals(&reference)?;
        if approvals.contains(&me) {
            debug!(uid, pr = %reference, "Already approved pull request");
            return Ok(());
        }

        gate.provider.submit_approval(&reference)?;
        info!(uid, pr = %reference, "Approved pull request");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::error::{GitHubError, MailStoreError};
    use crate::github::{PullRequest, PullRequestRef};
    use crate::mailstore::{FetchedMessage, PageWindow};

    // ── Parsing ─────────────────────────────────────────────────────

    #[test]
    fn parses_keyword_forms_case_insensitively() {
        assert_eq!(Action::parse("delete"), Action::Delete);
        assert_eq!(Action::parse("  DELETE "), Action::Delete);
        assert_eq!(
            Action::parse(r#"move to "Archive/2026""#),
            Action::MoveTo("Archive/2026".into())
        );
        assert_eq!(
            Action::parse(r#"Move To "Archive""#),
            Action::MoveTo("Archive".into())
        );
        assert_eq!(Action::parse(r#"label "CI""#), Action::Label("CI".into()));
        assert_eq!(Action::parse("github review"), Action::Review);
        assert_eq!(Action::parse("GitHub  Review"), Action::Review);
    }

    #[test]
    fn quoted_arguments_keep_case() {
        assert_eq!(
            Action::parse(r#"LABEL "Inbox/Later""#),
            Action::Label("Inbox/Later".into())
        );
    }

    #[test]
    fn unparsable_strings_become_unknown() {
        assert_eq!(
            Action::parse("archive everything"),
            Action::Unknown("archive everything".into())
        );
        // Missing quotes means the grammar does not match.
        assert_eq!(
            Action::parse("label CI"),
            Action::Unknown("label CI".into())
        );
    }

    // ── Dispatch ────────────────────────────────────────────────────

    /// Records mutations; optionally fails a specific call.
    #[derive(Default)]
    struct RecordingStore {
        ops: Vec<String>,
        fail_on: Option<String>,
    }

    impl MailStore for RecordingStore {
        fn select(&mut self, _mailbox: &str, _read_only: bool) -> Result<(), MailStoreError> {
            Ok(())
        }

        fn fetch_page(
            &mut self,
            _window: PageWindow,
        ) -> Result<Vec<FetchedMessage>, MailStoreError> {
            Ok(vec![])
        }

        fn move_message(&mut self, uid: u32, destination: &str) -> Result<(), MailStoreError> {
            let op = format!("move {uid} -> {destination}");
            if self.fail_on.as_deref() == Some(destination) {
                return Err(MailStoreError::Command {
                    command: "MOVE".into(),
                    response: "NO failed".into(),
                });
            }
            self.ops.push(op);
            Ok(())
        }

        fn copy_message(&mut self, uid: u32, destination: &str) -> Result<(), MailStoreError> {
            let op = format!("copy {uid} -> {destination}");
            if self.fail_on.as_deref() == Some(destination) {
                return Err(MailStoreError::Command {
                    command: "COPY".into(),
                    response: "NO failed".into(),
                });
            }
            self.ops.push(op);
            Ok(())
        }

        fn list_mailboxes(&mut self) -> Result<Vec<String>, MailStoreError> {
            Ok(vec![])
        }

        fn close(&mut self) -> Result<(), MailStoreError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeGitHub {
        current_user: String,
        existing_approvals: Vec<String>,
        submitted: Mutex<Vec<String>>,
    }

    impl PullRequestProvider for FakeGitHub {
        fn get_pull_request(&self, pr: &PullRequestRef) -> Result<PullRequest, GitHubError> {
            Ok(PullRequest {
                owner: pr.owner.clone(),
                repo: pr.repo.clone(),
                number: pr.number,
                author: "alice".into(),
            })
        }

        fn list_approvals(&self, _pr: &PullRequestRef) -> Result<Vec<String>, GitHubError> {
            Ok(self.existing_approvals.clone())
        }

        fn current_username(&self) -> Result<String, GitHubError> {
            Ok(self.current_user.clone())
        }

        fn submit_approval(&self, pr: &PullRequestRef) -> Result<(), GitHubError> {
            self.submitted.lock().unwrap().push(pr.to_string());
            Ok(())
        }
    }

    fn prefetched_pr() -> ResolvedPrefetches {
        ResolvedPrefetches {
            pull_request: Some(PullRequest {
                owner: "acme".into(),
                repo: "widgets".into(),
                number: 57,
                author: "alice".into(),
            }),
        }
    }

    fn open_policy() -> ApprovalPolicy {
        ApprovalPolicy {
            allowed_repositories: vec!["acme/widgets".into()],
            allowed_authors: vec!["alice".into()],
        }
    }

    #[test]
    fn delete_is_an_alias_for_move_to_trash() {
        let mut store = RecordingStore::default();
        let mut dispatcher = ActionDispatcher::new(&mut store, None);
        dispatcher
            .execute(3, &[Action::Delete], &ResolvedPrefetches::default())
            .unwrap();

        let mut store2 = RecordingStore::default();
        let mut dispatcher2 = ActionDispatcher::new(&mut store2, None);
        dispatcher2
            .execute(
                3,
                &[Action::MoveTo(TRASH_MAILBOX.into())],
                &ResolvedPrefetches::default(),
            )
            .unwrap();

        assert_eq!(store.ops, store2.ops);
        assert_eq!(store.ops, vec!["move 3 -> [Gmail]/Trash"]);
    }

    #[test]
    fn executes_in_list_order() {
        let mut store = RecordingStore::default();
        let mut dispatcher = ActionDispatcher::new(&mut store, None);
        dispatcher
            .execute(
                7,
                &[
                    Action::Label("A".into()),
                    Action::Label("B".into()),
                    Action::MoveTo("Done".into()),
                ],
                &ResolvedPrefetches::default(),
            )
            .unwrap();
        assert_eq!(
            store.ops,
            vec!["copy 7 -> A", "copy 7 -> B", "move 7 -> Done"]
        );
    }

    #[test]
    fn failure_aborts_remaining_actions() {
        let mut store = RecordingStore {
            fail_on: Some("B".into()),
            ..Default::default()
        };
        let mut dispatcher = ActionDispatcher::new(&mut store, None);
        let err = dispatcher
            .execute(
                7,
                &[
                    Action::Label("A".into()),
                    Action::Label("B".into()),
                    Action::Label("C".into()),
                ],
                &ResolvedPrefetches::default(),
            )
            .unwrap_err();
        assert!(matches!(err, PipelineError::Action { .. }));
        assert_eq!(store.ops, vec!["copy 7 -> A"]);
    }

    #[test]
    fn unknown_action_is_skipped_not_fatal() {
        let mut store = RecordingStore::default();
        let mut dispatcher = ActionDispatcher::new(&mut store, None);
        dispatcher
            .execute(
                7,
                &[
                    Action::Unknown("frobnicate".into()),
                    Action::Label("A".into()),
                ],
                &ResolvedPrefetches::default(),
            )
            .unwrap();
        assert_eq!(store.ops, vec!["copy 7 -> A"]);
    }

    #[test]
    fn review_submits_when_all_gates_pass() {
        let mut store = RecordingStore::default();
        let github = FakeGitHub {
            current_user: "me".into(),
            ..Default::default()
        };
        let policy = open_policy();
        let mut dispatcher = ActionDispatcher::new(
            &mut store,
            Some(ApprovalGate {
                provider: &github,
                policy: &policy,
            }),
        );
        dispatcher
            .execute(7, &[Action::Review], &prefetched_pr())
            .unwrap();
        assert_eq!(*github.submitted.lock().unwrap(), vec!["acme/widgets#57"]);
    }

    #[test]
    fn review_skipped_when_repository_not_allowed() {
        let mut store = RecordingStore::default();
        let github = FakeGitHub {
            current_user: "me".into(),
            ..Default::default()
        };
        let policy = ApprovalPolicy {
            allowed_repositories: vec!["other/repo".into()],
            allowed_authors: vec!["alice".into()],
        };
        let mut dispatcher = ActionDispatcher::new(
            &mut store,
            Some(ApprovalGate {
                provider: &github,
                policy: &policy,
            }),
        );
        dispatcher
            .execute(7, &[Action::Review], &prefetched_pr())
            .unwrap();
        assert!(github.submitted.lock().unwrap().is_empty());
    }

    #[test]
    fn review_skipped_when_author_not_allowed() {
        let mut store = RecordingStore::default();
        let github = FakeGitHub {
            current_user: "me".into(),
            ..Default::default()
        };
        let policy = ApprovalPolicy {
            allowed_repositories: vec!["acme/widgets".into()],
            allowed_authors: vec!["someone-else".into()],
        };
        let mut dispatcher = ActionDispatcher::new(
            &mut store,
            Some(ApprovalGate {
                provider: &github,
                policy: &policy,
            }),
        );
        dispatcher
            .execute(7, &[Action::Review], &prefetched_pr())
            .unwrap();
        assert!(github.submitted.lock().unwrap().is_empty());
    }

    #[test]
    fn review_idempotent_when_already_approved() {
        let mut store = RecordingStore::default();
        let github = FakeGitHub {
            current_user: "me".into(),
            existing_approvals: vec!["me".into()],
            ..Default::default()
        };
        let policy = open_policy();
        let mut dispatcher = ActionDispatcher::new(
            &mut store,
            Some(ApprovalGate {
                provider: &github,
                policy: &policy,
            }),
        );
        dispatcher
            .execute(7, &[Action::Review], &prefetched_pr())
            .unwrap();
        assert!(github.submitted.lock().unwrap().is_empty());
    }

    #[test]
    fn review_with_absent_prefetch_data_is_an_error() {
        let mut store = RecordingStore::default();
        let github = FakeGitHub {
            current_user: "me".into(),
            ..Default::default()
        };
        let policy = open_policy();
        let mut dispatcher = ActionDispatcher::new(
            &mut store,
            Some(ApprovalGate {
                provider: &github,
                policy: &policy,
            }),
        );
        let err = dispatcher
            .execute(7, &[Action::Review], &ResolvedPrefetches::default())
            .unwrap_err();
        assert!(matches!(err, PipelineError::MissingPrefetchData));
    }
}
