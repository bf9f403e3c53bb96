//! Rule-evaluation and action-dispatch pipeline.

pub mod actions;
pub mod expr;
pub mod prefetch;
pub mod processor;
pub mod rules;
pub mod types;

pub use actions::{Action, ActionDispatcher, ApprovalPolicy};
pub use expr::{Condition, EvalContext, Value};
pub use prefetch::{PrefetchCache, PrefetchResolver, ResolvedPrefetches};
pub use processor::{MessageProcessor, ProcessedLedger};
pub use rules::{FilterRule, MessagePlan, RuleSet};
pub use types::MailMessage;
