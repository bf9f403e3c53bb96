//! Mail-store abstraction.
//!
//! Adapters are pure I/O, no business logic: they fetch raw messages and
//! execute single-message mutations. Rule evaluation and action planning
//! live in the pipeline. The one real adapter is [`imap::ImapSession`].

pub mod imap;

use crate::error::MailStoreError;

pub use imap::ImapSession;

/// An address from a message envelope.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Address {
    /// Display name, if the header carried one.
    pub name: Option<String>,
    /// The bare `mailbox@host` address.
    pub address: String,
}

impl Address {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            name: None,
            address: address.into(),
        }
    }

    pub fn named(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            address: address.into(),
        }
    }
}

/// Envelope headers of a fetched message. Address lists keep header
/// order and are not deduplicated.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    pub from: Vec<Address>,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub reply_to: Vec<Address>,
    pub subject: String,
    pub date: Option<chrono::DateTime<chrono::Utc>>,
}

/// A raw fetched message: envelope, flags and body segments, exactly as
/// the store returned them. Snapshot taken at fetch time.
#[derive(Debug, Clone)]
pub struct FetchedMessage {
    /// Store-assigned unique identifier.
    pub uid: u32,
    /// Whether the message carries the seen flag.
    pub seen: bool,
    pub envelope: Envelope,
    /// Text body segments in wire order; the normalizer concatenates.
    pub body_parts: Vec<String>,
}

/// A fixed-size sequence window for paged fetching.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageWindow {
    /// First sequence number, 1-based.
    pub start: u32,
    /// Number of sequence slots in the window.
    pub count: u32,
}

impl PageWindow {
    pub fn new(start: u32, count: u32) -> Self {
        Self { start, count }
    }

    /// Last sequence number covered by this window.
    pub fn end(&self) -> u32 {
        self.start.saturating_add(self.count.saturating_sub(1))
    }

    /// The window immediately after this one.
    pub fn next(&self) -> Self {
        Self::new(self.start.saturating_add(self.count), self.count)
    }
}

/// A mail-store session. One session serves one cycle; calls are serial.
///
/// Authentication happens when the concrete session is constructed, so a
/// value of this type is always logged in.
pub trait MailStore {
    /// Select a mailbox. `read_only` avoids implicit flag changes on fetch.
    fn select(&mut self, mailbox: &str, read_only: bool) -> Result<(), MailStoreError>;

    /// Fetch a window of messages. An empty result means the scan is done.
    fn fetch_page(&mut self, window: PageWindow) -> Result<Vec<FetchedMessage>, MailStoreError>;

    /// Move one message to another mailbox.
    fn move_message(&mut self, uid: u32, destination: &str) -> Result<(), MailStoreError>;

    /// Copy one message to another mailbox (Gmail: applies a label).
    fn copy_message(&mut self, uid: u32, destination: &str) -> Result<(), MailStoreError>;

    /// List all mailbox names.
    fn list_mailboxes(&mut self) -> Result<Vec<String>, MailStoreError>;

    /// Log out and drop the connection.
    fn close(&mut self) -> Result<(), MailStoreError>;
}
