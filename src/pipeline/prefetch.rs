//! Prefetch resolution for rule conditions.
//!
//! A rule may declare prefetch requests by name. The resolver executes a
//! request only when the name is known, the message body carries a
//! parsable resource reference, and the derived resource key has not been
//! fetched before in this run. Fetch failures are logged and yield absent
//! data; rule evaluation proceeds either way.

use std::collections::HashMap;

use tracing::{debug, error};

use crate::github::{find_pull_request_ref, PullRequest, PullRequestProvider, PullRequestRef};
use crate::pipeline::expr::EvalContext;

/// Namespace name under which pull request data is exposed to conditions.
pub const PULL_REQUEST_NAMESPACE: &str = "pull_request";

/// Known prefetch requests. Request names are matched case-insensitively
/// with collapsed whitespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchKind {
    PullRequest,
}

impl PrefetchKind {
    pub fn from_request(name: &str) -> Option<Self> {
        let normalized = name.split_whitespace().collect::<Vec<_>>().join(" ");
        match normalized.to_lowercase().as_str() {
            "github pull request" => Some(Self::PullRequest),
            _ => None,
        }
    }
}

/// Run-lifetime memo of fetched resources, keyed by resource identity
/// (not message identity): identical references across messages and
/// rules are fetched once. Injected into each cycle by reference.
#[derive(Debug, Default)]
pub struct PrefetchCache {
    pull_requests: HashMap<PullRequestRef, PullRequest>,
}

impl PrefetchCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pull_requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pull_requests.is_empty()
    }
}

/// Prefetch data resolved for a single message. Persists across the
/// message's rules so later rules and the dispatcher see the same data.
#[derive(Debug, Default, Clone)]
pub struct ResolvedPrefetches {
    pub pull_request: Option<PullRequest>,
}

impl ResolvedPrefetches {
    /// Bind every resolved namespace into an evaluation context.
    pub fn bind_into(&self, ctx: &mut EvalContext) {
        if let Some(ref pr) = self.pull_request {
            ctx.bind(PULL_REQUEST_NAMESPACE, pr.namespace());
        }
    }
}

/// Executes prefetch requests against a provider, memoizing per resource.
pub struct PrefetchResolver<'a> {
    provider: &'a dyn PullRequestProvider,
    cache: &'a mut PrefetchCache,
}

impl<'a> PrefetchResolver<'a> {
    pub fn new(provider: &'a dyn PullRequestProvider, cache: &'a mut PrefetchCache) -> Self {
        Self { provider, cache }
    }

    /// Resolve one request against a message body. Fills `resolved` when
    /// data is obtained; absent data is not an error.
    pub fn resolve(&mut self, request: &str, body: &str, resolved: &mut ResolvedPrefetches) {
        match PrefetchKind::from_request(request) {
            Some(PrefetchKind::PullRequest) => {
                if resolved.pull_request.is_some() {
                    return;
                }
                resolved.pull_request = self.resolve_pull_request(body);
            }
            None => {
                debug!(request, "Ignoring unknown prefetch request");
            }
        }
    }

    fn resolve_pull_request(&mut self, body: &str) -> Option<PullRequest> {
        let reference = match find_pull_request_ref(body) {
            Some(r) => r,
            None => {
                debug!("No pull request reference in message body");
                return None;
            }
        };

        if let Some(cached) = self.cache.pull_requests.get(&reference) {
            debug!(pr = %reference, "Pull request prefetch served from cache");
            return Some(cached.clone());
        }

        match self.provider.get_pull_request(&reference) {
            Ok(pr) => {
                self.cache.pull_requests.insert(reference, pr.clone());
                Some(pr)
            }
            Err(e) => {
                error!(pr = %reference, error = %e, "Pull request prefetch failed");
                None
            }
        }
    }
}
