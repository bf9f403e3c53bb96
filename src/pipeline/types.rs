//! Shared types for the filtering pipeline.

use chrono::{DateTime, Utc};

use crate::mailstore::{Address, FetchedMessage};
use crate::pipeline::expr::{Namespace, Value};

/// Normalized message attribute bag.
///
/// Built once per fetched message and never mutated afterwards. This is
/// what conditions evaluate against, exposed as the `message` namespace.
#[derive(Debug, Clone)]
pub struct MailMessage {
    /// Store-assigned unique identifier.
    pub uid: u32,
    /// Seen messages are skipped before any rule runs.
    pub seen: bool,
    /// Bare sender addresses, header order, not deduplicated.
    pub from: Vec<String>,
    /// Sender display names, aligned with `from` (empty string when absent).
    pub from_name: Vec<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub reply_to: Vec<String>,
    pub subject: String,
    /// All text body segments concatenated in wire order.
    pub body: String,
    pub date: Option<DateTime<Utc>>,
}

impl MailMessage {
    /// Normalize a raw fetch record. Pure transform, no side effects.
    pub fn from_fetched(fetched: &FetchedMessage) -> Self {
        let envelope = &fetched.envelope;
        Self {
            uid: fetched.uid,
            seen: fetched.seen,
            from: bare_addresses(&envelope.from),
            from_name: display_names(&envelope.from),
            to: bare_addresses(&envelope.to),
            cc: bare_addresses(&envelope.cc),
            reply_to: bare_addresses(&envelope.reply_to),
            subject: envelope.subject.clone(),
            body: fetched.body_parts.concat(),
            date: envelope.date,
        }
    }

    /// Bind this message as the `message` namespace for the evaluator.
    pub fn namespace(&self) -> Namespace {
        let mut ns = Namespace::new();
        ns.insert("from".into(), Value::str_list(self.from.clone()));
        ns.insert("from_name".into(), Value::str_list(self.from_name.clone()));
        ns.insert("to".into(), Value::str_list(self.to.clone()));
        ns.insert("cc".into(), Value::str_list(self.cc.clone()));
        ns.insert("reply_to".into(), Value::str_list(self.reply_to.clone()));
        ns.insert("subject".into(), Value::Str(self.subject.clone()));
        ns.insert("body".into(), Value::Str(self.body.clone()));
        ns
    }
}

fn bare_addresses(addresses: &[Address]) -> Vec<String> {
    addresses.iter().map(|a| a.address.clone()).collect()
}

fn display_names(addresses: &[Address]) -> Vec<String> {
    addresses
        .iter()
        .map(|a| a.name.clone().unwrap_or_default())
        .collect()
}
