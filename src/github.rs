//! GitHub pull request provider.
//!
//! The pipeline consumes this through [`PullRequestProvider`]; the real
//! adapter talks to the REST v3 API with a personal access token. The
//! client is blocking because the whole processing cycle runs inside
//! `spawn_blocking`.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::GitHubError;
use crate::pipeline::expr::{Namespace, Value};

/// Pull request URLs follow the pattern: `https://github.com/owner/repo/pull/123`
static PULL_REQUEST_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https://github\.com/([^/\s]+)/([^/\s]+)/pull/(\d+)").unwrap()
});

/// Warn when the remaining API quota drops below this.
const RATE_LIMIT_WARN_THRESHOLD: u64 = 500;

/// Identity of one pull request. Also the prefetch cache key, rendered
/// as `owner/repo#number`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PullRequestRef {
    pub owner: String,
    pub repo: String,
    pub number: u64,
}

impl PullRequestRef {
    /// `owner/repo` as used by the approval allow-list.
    pub fn repo_full_name(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

impl fmt::Display for PullRequestRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.owner, self.repo, self.number)
    }
}

/// Extract the first pull request reference from message text.
pub fn find_pull_request_ref(body: &str) -> Option<PullRequestRef> {
    let captures = PULL_REQUEST_URL.captures(body)?;
    let number = captures[3].parse().ok()?;
    Some(PullRequestRef {
        owner: captures[1].to_string(),
        repo: captures[2].to_string(),
        number,
    })
}

/// Pull request data consumed by conditions and the approval action.
#[derive(Debug, Clone, PartialEq)]
pub struct PullRequest {
    pub owner: String,
    pub repo: String,
    pub number: u64,
    pub author: String,
}

impl PullRequest {
    pub fn reference(&self) -> PullRequestRef {
        PullRequestRef {
            owner: self.owner.clone(),
            repo: self.repo.clone(),
            number: self.number,
        }
    }

    /// Bind as the `pull_request` namespace for the evaluator.
    pub fn namespace(&self) -> Namespace {
        let mut ns = Namespace::new();
        ns.insert("owner".into(), Value::Str(self.owner.clone()));
        ns.insert("repo".into(), Value::Str(self.repo.clone()));
        ns.insert("number".into(), Value::Int(self.number as i64));
        ns.insert("author".into(), Value::Str(self.author.clone()));
        ns
    }
}

/// Capabilities the pipeline needs from GitHub.
pub trait PullRequestProvider: Send + Sync {
    /// Fetch pull request metadata.
    fn get_pull_request(&self, pr: &PullRequestRef) -> Result<PullRequest, GitHubError>;

    /// Logins of users with an APPROVED review on the pull request.
    fn list_approvals(&self, pr: &PullRequestRef) -> Result<Vec<String>, GitHubError>;

    /// Login of the authenticated user.
    fn current_username(&self) -> Result<String, GitHubError>;

    /// Submit an approving review.
    fn submit_approval(&self, pr: &PullRequestRef) -> Result<(), GitHubError>;
}

// ── REST adapter ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ApiUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct ApiPullRequest {
    user: Option<ApiUser>,
}

#[derive(Debug, Deserialize)]
struct ApiReview {
    user: Option<ApiUser>,
    state: String,
}

/// REST v3 client authenticated with a personal access token.
pub struct GitHubClient {
    http: reqwest::blocking::Client,
    token: SecretString,
    base_url: String,
}

impl GitHubClient {
    pub fn new(token: SecretString) -> Self {
        Self::with_base_url(token, "https://api.github.com")
    }

    pub fn with_base_url(token: SecretString, base_url: impl Into<String>) -> Self {
        let http = reqwest::blocking::Client::builder()
            .user_agent(concat!("mailwarden/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("reqwest client construction cannot fail with static settings");
        Self {
            http,
            token,
            base_url: base_url.into(),
        }
    }

    fn get(&self, endpoint: &str) -> Result<reqwest::blocking::Response, GitHubError> {
        let response = self
            .http
            .get(format!("{}{endpoint}", self.base_url))
            .bearer_auth(self.token.expose_secret())
            .header("Accept", "application/vnd.github+json")
            .send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(GitHubError::Status {
                status: status.as_u16(),
                endpoint: endpoint.to_string(),
            });
        }
        check_rate_limit(&response);
        Ok(response)
    }
}

fn check_rate_limit(response: &reqwest::blocking::Response) {
    let remaining = response
        .headers()
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if let Some(remaining) = remaining {
        if remaining < RATE_LIMIT_WARN_THRESHOLD {
            warn!(remaining, "GitHub API rate limit quota is low");
        }
    }
}

impl PullRequestProvider for GitHubClient {
    fn get_pull_request(&self, pr: &PullRequestRef) -> Result<PullRequest, GitHubError> {
        let endpoint = format!("/repos/{}/{}/pulls/{}", pr.owner, pr.repo, pr.number);
        let api: ApiPullRequest = self.get(&endpoint)?.json()?;
        let author = api.user.map(|u| u.login).unwrap_or_default();
        debug!(pr = %pr, author = %author, "Fetched pull request data");
        Ok(PullRequest {
            owner: pr.owner.clone(),
            repo: pr.repo.clone(),
            number: pr.number,
            author,
        })
    }

    fn list_approvals(&self, pr: &PullRequestRef) -> Result<Vec<String>, GitHubError> {
        let endpoint = format!(
            "/repos/{}/{}/pulls/{}/reviews",
            pr.owner, pr.repo, pr.number
        );
        let reviews: Vec<ApiReview> = self.get(&endpoint)?.json()?;
        Ok(reviews
            .into_iter()
            .filter(|r| r.state == "APPROVED")
            .filter_map(|r| r.user.map(|u| u.login))
            .collect())
    }

    fn current_username(&self) -> Result<String, GitHubError> {
        let user: ApiUser = self.get("/user")?.json()?;
        Ok(user.login)
    }

    fn submit_approval(&self, pr: &PullRequestRef) -> Result<(), GitHubError> {
        let endpoint = format!(
            "/repos/{}/{}/pulls/{}/reviews",
            pr.owner, pr.repo, pr.number
        );
        let response = self
            .http
            .post(format!("{}{endpoint}", self.base_url))
            .bearer_auth(self.token.expose_secret())
            .header("Accept", "application/vnd.github+json")
            .json(&serde_json::json!({ "event": "APPROVE" }))
            .send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(GitHubError::Status {
                status: status.as_u16(),
                endpoint,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_pull_request_ref_in_body() {
        let body = "Review requested:\nhttps://github.com/acme/widgets/pull/57\nthanks";
        let pr = find_pull_request_ref(body).unwrap();
        assert_eq!(pr.owner, "acme");
        assert_eq!(pr.repo, "widgets");
        assert_eq!(pr.number, 57);
        assert_eq!(pr.to_string(), "acme/widgets#57");
        assert_eq!(pr.repo_full_name(), "acme/widgets");
    }

    #[test]
    fn first_reference_wins() {
        let body = "https://github.com/a/b/pull/1 and https://github.com/c/d/pull/2";
        let pr = find_pull_request_ref(body).unwrap();
        assert_eq!(pr.to_string(), "a/b#1");
    }

    #[test]
    fn no_reference_in_plain_text() {
        assert!(find_pull_request_ref("nothing to see here").is_none());
        assert!(find_pull_request_ref("https://github.com/acme/widgets/issues/3").is_none());
    }

    #[test]
    fn pull_request_namespace_fields() {
        let pr = PullRequest {
            owner: "acme".into(),
            repo: "widgets".into(),
            number: 57,
            author: "alice".into(),
        };
        let ns = pr.namespace();
        assert_eq!(ns.get("author"), Some(&Value::Str("alice".into())));
        assert_eq!(ns.get("number"), Some(&Value::Int(57)));
        assert_eq!(ns.get("owner"), Some(&Value::Str("acme".into())));
    }

    #[test]
    fn review_deserialization_filters_approvals() {
        let raw = r#"[
            {"user": {"login": "alice"}, "state": "APPROVED"},
            {"user": {"login": "bob"}, "state": "CHANGES_REQUESTED"},
            {"user": null, "state": "APPROVED"}
        ]"#;
        let reviews: Vec<ApiReview> = serde_json::from_str(raw).unwrap();
        let approvals: Vec<String> = reviews
            .into_iter()
            .filter(|r| r.state == "APPROVED")
            .filter_map(|r| r.user.map(|u| u.login))
            .collect();
        assert_eq!(approvals, vec!["alice"]);
    }
}
