//! Ordered rule evaluation with halt-on-match semantics.
//!
//! Rules run in declaration order, and that order is the sole ordering
//! signal, there is no priority field. Each matching rule appends its
//! actions, in its own order, to the message's pending sequence; a
//! halting match stops further rules but keeps what earlier non-halting
//! matches accumulated.

use tracing::{debug, error};

use crate::pipeline::actions::Action;
use crate::pipeline::expr::{Condition, EvalContext};
use crate::pipeline::prefetch::{PrefetchResolver, ResolvedPrefetches};
use crate::pipeline::types::MailMessage;

/// One user-defined filter rule, fully compiled at config-load time.
#[derive(Debug)]
pub struct FilterRule {
    pub name: String,
    /// Prefetch requests this rule's condition may rely on.
    pub prefetches: Vec<String>,
    pub condition: Condition,
    pub actions: Vec<Action>,
    pub halt_on_match: bool,
}

/// The accumulated outcome of evaluating a message against a rule set.
#[derive(Debug, Default)]
pub struct MessagePlan {
    /// Pending actions, in execution order. Empty means no-op.
    pub actions: Vec<Action>,
    /// Prefetch data resolved while evaluating, for the dispatcher.
    pub prefetched: ResolvedPrefetches,
}

/// The ordered rule set loaded from configuration.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<FilterRule>,
}

impl RuleSet {
    pub fn new(rules: Vec<FilterRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[FilterRule] {
        &self.rules
    }

    /// Evaluate every rule against one message and accumulate actions.
    ///
    /// Seen messages yield an empty plan before any rule is evaluated.
    /// Condition evaluation failures are logged and count as non-match.
    pub fn plan(&self, message: &MailMessage, resolver: &mut PrefetchResolver) -> MessagePlan {
        let mut plan = MessagePlan::default();

        if message.seen {
            return plan;
        }

        for rule in &self.rules {
            for request in &rule.prefetches {
                resolver.resolve(request, &message.body, &mut plan.prefetched);
            }

            let mut ctx = EvalContext::new();
            ctx.bind("message", message.namespace());
            plan.prefetched.bind_into(&mut ctx);

            let matched = match rule.condition.is_match(&ctx) {
                Ok(matched) => matched,
                Err(e) => {
                    error!(
                        uid = message.uid,
                        rule = %rule.name,
                        condition = rule.condition.source(),
                        error = %e,
                        "Condition evaluation failed"
                    );
                    false
                }
            };

            if matched {
                plan.actions.extend(rule.actions.iter().cloned());
                if rule.halt_on_match {
                    debug!(uid = message.uid, rule = %rule.name, "Halt on match");
                    break;
                }
            }
        }

        plan
    }
}
