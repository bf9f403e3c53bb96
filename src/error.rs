//! Error types for mailwarden.

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Mail store error: {0}")]
    MailStore(#[from] MailStoreError),

    #[error("GitHub error: {0}")]
    GitHub(#[from] GitHubError),

    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors. All of these are fatal at load time;
/// the run loop never starts with a half-valid config.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid condition for filter {filter:?}: {message}")]
    Condition { filter: String, message: String },

    #[error("Filter {filter:?} uses \"github review\" but github.approval is disabled")]
    ApprovalDisabled { filter: String },

    #[error(
        "Filter {filter:?} uses \"github review\" without declaring the \"github pull request\" prefetch"
    )]
    MissingPrefetch { filter: String },

    #[error("github.approval.{list} must not be empty when the approval action is used")]
    EmptyAllowList { list: String },

    #[error("A filter declares the \"github pull request\" prefetch but github.token is empty")]
    MissingToken,

    #[error("Invalid slack.send_level {level:?} (expected debug, info, warn or error)")]
    InvalidSendLevel { level: String },
}

/// Mail-store session errors (dial, auth, protocol).
#[derive(Debug, thiserror::Error)]
pub enum MailStoreError {
    #[error("Failed to dial IMAP server {host}:{port}: {reason}")]
    Dial {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("IMAP login failed: {0}")]
    Auth(String),

    #[error("IMAP command {command} failed: {response}")]
    Command { command: String, response: String },

    #[error("IMAP connection closed")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// GitHub API errors.
#[derive(Debug, thiserror::Error)]
pub enum GitHubError {
    #[error("GitHub request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("GitHub returned {status} for {endpoint}")]
    Status { status: u16, endpoint: String },
}

/// Notification sink errors.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Webhook post failed: {0}")]
    Post(#[from] reqwest::Error),

    #[error("Webhook returned non-200 status: {0}")]
    Status(u16),
}

/// Errors from the per-message / per-cycle processing pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("uid {uid}: {source}")]
    Message {
        uid: u32,
        #[source]
        source: Box<PipelineError>,
    },

    #[error("Action {action:?} failed: {source}")]
    Action {
        action: String,
        #[source]
        source: MailStoreError,
    },

    #[error("Approval action failed: {0}")]
    Approval(#[from] GitHubError),

    #[error("Approval action dispatched without pull request prefetch data")]
    MissingPrefetchData,

    #[error("Mail store error: {0}")]
    MailStore(#[from] MailStoreError),

    #[error("Cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Wrap an error with the UID of the message being processed.
    pub fn for_uid(uid: u32, source: PipelineError) -> Self {
        Self::Message {
            uid,
            source: Box::new(source),
        }
    }

    /// True when this error (at any wrapping depth) is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Message { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

/// Result type alias for mailwarden.
pub type Result<T> = std::result::Result<T, Error>;
