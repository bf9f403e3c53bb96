//! mailwarden — rule-driven IMAP inbox sidecar.

pub mod config;
pub mod error;
pub mod github;
pub mod mailstore;
pub mod notify;
pub mod pipeline;
pub mod server;
