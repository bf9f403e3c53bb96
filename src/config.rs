//! Configuration loading and validation.
//!
//! Everything that can fail is surfaced here, at load time: condition
//! compilation, action parsing, and the approval-action preconditions.
//! By the time a [`Config`] exists, no mail-store session has been
//! opened and every rule is ready to run.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use secrecy::SecretString;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::notify::Severity;
use crate::pipeline::actions::{Action, ApprovalPolicy};
use crate::pipeline::expr::Condition;
use crate::pipeline::prefetch::PrefetchKind;
use crate::pipeline::rules::{FilterRule, RuleSet};

const DEFAULT_IMAP_HOST: &str = "imap.gmail.com";
const DEFAULT_IMAP_PORT: u16 = 993;
const DEFAULT_SLEEP_SECS: u64 = 15;

/// `$VAR` / `${VAR}` references in secret config values.
static ENV_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)").unwrap()
});

// ── Raw (deserialized) form ─────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawConfig {
    credentials: RawCredentials,
    #[serde(default)]
    server: RawServer,
    #[serde(default)]
    slack: Option<RawSlack>,
    #[serde(default)]
    github: RawGitHub,
    #[serde(default)]
    filters: Vec<RawFilter>,
}

#[derive(Debug, Deserialize)]
struct RawCredentials {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    username: String,
    #[serde(default)]
    password: String,
}

fn default_host() -> String {
    DEFAULT_IMAP_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_IMAP_PORT
}

#[derive(Debug, Default, Deserialize)]
struct RawServer {
    #[serde(default)]
    sleep_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawSlack {
    webhook_url: String,
    #[serde(default)]
    send_level: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawGitHub {
    #[serde(default)]
    token: String,
    #[serde(default)]
    approval: RawApproval,
}

#[derive(Debug, Default, Deserialize)]
struct RawApproval {
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    allowed_repositories: Vec<String>,
    #[serde(default)]
    allowed_authors: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawFilter {
    name: String,
    #[serde(default)]
    prefetches: Vec<String>,
    condition: String,
    #[serde(default)]
    actions: Vec<String>,
    #[serde(default)]
    halt_on_match: bool,
}

// ── Validated form ──────────────────────────────────────────────────

#[derive(Debug)]
pub struct Credentials {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
}

#[derive(Debug)]
pub struct ServerConfig {
    /// Base sleep between cycles; backoff multiplies this.
    pub sleep_interval: Duration,
}

#[derive(Debug)]
pub struct SlackConfig {
    pub webhook_url: String,
    pub send_level: Severity,
}

#[derive(Debug)]
pub struct GitHubConfig {
    pub token: SecretString,
    pub approval_enabled: bool,
    pub approval_policy: ApprovalPolicy,
}

/// Fully validated configuration with compiled rules.
#[derive(Debug)]
pub struct Config {
    pub credentials: Credentials,
    pub server: ServerConfig,
    pub slack: Option<SlackConfig>,
    pub github: GitHubConfig,
    pub rules: RuleSet,
}

impl Config {
    /// Read and validate a config file.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate config text (public for testing).
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(content)?;

        let slack = match raw.slack {
            Some(slack) => {
                let send_level = match slack.send_level {
                    Some(ref level) => Severity::parse(level).ok_or_else(|| {
                        ConfigError::InvalidSendLevel {
                            level: level.clone(),
                        }
                    })?,
                    None => Severity::Error,
                };
                Some(SlackConfig {
                    webhook_url: slack.webhook_url,
                    send_level,
                })
            }
            None => None,
        };

        let mut rules = Vec::with_capacity(raw.filters.len());
        let mut any_pull_request_prefetch = false;
        for filter in &raw.filters {
            let condition =
                Condition::compile(&filter.condition).map_err(|message| ConfigError::Condition {
                    filter: filter.name.clone(),
                    message,
                })?;

            let declares_pull_request = filter
                .prefetches
                .iter()
                .any(|p| PrefetchKind::from_request(p) == Some(PrefetchKind::PullRequest));
            any_pull_request_prefetch |= declares_pull_request;

            let actions: Vec<Action> = filter.actions.iter().map(|a| Action::parse(a)).collect();
            if actions.contains(&Action::Review) {
                if !raw.github.approval.enabled {
                    return Err(ConfigError::ApprovalDisabled {
                        filter: filter.name.clone(),
                    });
                }
                if !declares_pull_request {
                    return Err(ConfigError::MissingPrefetch {
                        filter: filter.name.clone(),
                    });
                }
                if raw.github.approval.allowed_repositories.is_empty() {
                    return Err(ConfigError::EmptyAllowList {
                        list: "allowed_repositories".into(),
                    });
                }
                if raw.github.approval.allowed_authors.is_empty() {
                    return Err(ConfigError::EmptyAllowList {
                        list: "allowed_authors".into(),
                    });
                }
            }

            rules.push(FilterRule {
                name: filter.name.clone(),
                prefetches: filter.prefetches.clone(),
                condition,
                actions,
                halt_on_match: filter.halt_on_match,
            });
        }

        let token = expand_env(&raw.github.token);
        if any_pull_request_prefetch && token.is_empty() {
            return Err(ConfigError::MissingToken);
        }

        Ok(Self {
            credentials: Credentials {
                host: raw.credentials.host,
                port: raw.credentials.port,
                username: raw.credentials.username,
                password: SecretString::from(expand_env(&raw.credentials.password)),
            },
            server: ServerConfig {
                sleep_interval: Duration::from_secs(
                    raw.server.sleep_interval_secs.unwrap_or(DEFAULT_SLEEP_SECS),
                ),
            },
            slack,
            github: GitHubConfig {
                token: SecretString::from(token),
                approval_enabled: raw.github.approval.enabled,
                approval_policy: ApprovalPolicy {
                    allowed_repositories: raw.github.approval.allowed_repositories,
                    allowed_authors: raw.github.approval.allowed_authors,
                },
            },
            rules: RuleSet::new(rules),
        })
    }
}

/// Expand `$VAR` / `${VAR}` references from the environment. Unset
/// variables expand to the empty string.
fn expand_env(value: &str) -> String {
    ENV_REF
        .replace_all(value, |captures: &regex::Captures<'_>| {
            let name = captures
                .get(1)
                .or_else(|| captures.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            std::env::var(name).unwrap_or_default()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
        [credentials]
        username = "user@example.com"
        password = "hunter2"
    "#;

    fn full_config(approval_enabled: bool) -> String {
        format!(
            r#"
            [credentials]
            username = "user@example.com"
            password = "hunter2"

            [server]
            sleep_interval_secs = 20

            [slack]
            webhook_url = "https://hooks.slack.com/services/T/B/X"
            send_level = "warn"

            [github]
            token = "ghp_token"

            [github.approval]
            enabled = {approval_enabled}
            allowed_repositories = ["acme/widgets"]
            allowed_authors = ["alice"]

            [[filters]]
            name = "auto-approve"
            prefetches = ["github pull request"]
            condition = 'pull_request.author == "alice"'
            actions = ['label "PR"', 'github review']
            halt_on_match = true
            "#
        )
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let config = Config::from_toml(MINIMAL).unwrap();
        assert_eq!(config.credentials.host, DEFAULT_IMAP_HOST);
        assert_eq!(config.credentials.port, DEFAULT_IMAP_PORT);
        assert_eq!(config.server.sleep_interval, Duration::from_secs(15));
        assert!(config.slack.is_none());
        assert!(config.rules.rules().is_empty());
    }

    #[test]
    fn full_config_parses_and_compiles() {
        let config = Config::from_toml(&full_config(true)).unwrap();
        assert_eq!(config.server.sleep_interval, Duration::from_secs(20));
        let slack = config.slack.unwrap();
        assert_eq!(slack.send_level, Severity::Warn);
        assert_eq!(config.rules.rules().len(), 1);
        let rule = &config.rules.rules()[0];
        assert!(rule.halt_on_match);
        assert_eq!(rule.actions.len(), 2);
        assert!(config.github.approval_enabled);
    }

    #[test]
    fn load_reads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();
        let config = Config::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.credentials.username, "user@example.com");
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = Config::load("/nonexistent/mailwarden.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn bad_condition_is_fatal_at_load() {
        let content = r#"
            [credentials]
            username = "u"

            [[filters]]
            name = "broken"
            condition = 'message.subject == '
            actions = ["delete"]
        "#;
        let err = Config::from_toml(content).unwrap_err();
        match err {
            ConfigError::Condition { filter, .. } => assert_eq!(filter, "broken"),
            other => panic!("expected Condition error, got {other}"),
        }
    }

    #[test]
    fn review_requires_approval_enabled() {
        let err = Config::from_toml(&full_config(false)).unwrap_err();
        assert!(matches!(err, ConfigError::ApprovalDisabled { .. }));
    }

    #[test]
    fn review_requires_declared_prefetch() {
        let content = r#"
            [credentials]
            username = "u"

            [github]
            token = "t"

            [github.approval]
            enabled = true
            allowed_repositories = ["acme/widgets"]
            allowed_authors = ["alice"]

            [[filters]]
            name = "no-prefetch"
            condition = "true"
            actions = ["github review"]
        "#;
        let err = Config::from_toml(content).unwrap_err();
        assert!(matches!(err, ConfigError::MissingPrefetch { .. }));
    }

    #[test]
    fn review_requires_non_empty_allow_lists() {
        let content = r#"
            [credentials]
            username = "u"

            [github]
            token = "t"

            [github.approval]
            enabled = true
            allowed_authors = ["alice"]

            [[filters]]
            name = "f"
            prefetches = ["github pull request"]
            condition = "true"
            actions = ["github review"]
        "#;
        let err = Config::from_toml(content).unwrap_err();
        match err {
            ConfigError::EmptyAllowList { list } => {
                assert_eq!(list, "allowed_repositories");
            }
            other => panic!("expected EmptyAllowList, got {other}"),
        }
    }

    #[test]
    fn prefetch_without_token_is_fatal() {
        let content = r#"
            [credentials]
            username = "u"

            [[filters]]
            name = "f"
            prefetches = ["github pull request"]
            condition = "true"
            actions = ["delete"]
        "#;
        let err = Config::from_toml(content).unwrap_err();
        assert!(matches!(err, ConfigError::MissingToken));
    }

    #[test]
    fn invalid_send_level_is_fatal() {
        let content = r#"
            [credentials]
            username = "u"

            [slack]
            webhook_url = "https://hooks.slack.com/x"
            send_level = "loudest"
        "#;
        let err = Config::from_toml(content).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSendLevel { .. }));
    }

    #[test]
    fn unknown_actions_survive_load_as_unknown() {
        let content = r#"
            [credentials]
            username = "u"

            [[filters]]
            name = "f"
            condition = "true"
            actions = ["frobnicate the inbox"]
        "#;
        let config = Config::from_toml(content).unwrap();
        assert_eq!(
            config.rules.rules()[0].actions,
            vec![Action::Unknown("frobnicate the inbox".into())]
        );
    }

    #[test]
    fn env_references_expand() {
        // SAFETY: tests in this module touching the environment use a
        // unique variable name to avoid cross-test interference.
        unsafe { std::env::set_var("MAILWARDEN_TEST_SECRET", "s3cret") };
        assert_eq!(expand_env("$MAILWARDEN_TEST_SECRET"), "s3cret");
        assert_eq!(expand_env("${MAILWARDEN_TEST_SECRET}"), "s3cret");
        assert_eq!(expand_env("plain"), "plain");
        assert_eq!(expand_env("$MAILWARDEN_TEST_UNSET"), "");
    }
}
