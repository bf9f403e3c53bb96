//! IMAP session over TLS.
//!
//! Blocking by design: the scan cycle is serial and runs inside
//! `spawn_blocking`. Command handling is line-based with support for
//! RFC 3501 literals (`{N}` byte counts), which FETCH uses for message
//! bodies. Fetched RFC822 content is parsed with `mail-parser`.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use mail_parser::MessageParser;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use crate::error::MailStoreError;
use crate::mailstore::{Address, Envelope, FetchedMessage, MailStore, PageWindow};

const READ_TIMEOUT: Duration = Duration::from_secs(30);

static FETCH_UID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bUID (\d+)").unwrap());
static FETCH_FLAGS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"FLAGS \(([^)]*)\)").unwrap());
static LITERAL_SIZE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{(\d+)\}\r?\n?$").unwrap());
static LIST_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\* LIST \([^)]*\) (?:"[^"]*"|NIL) (.+?)\r?\n?$"#).unwrap()
});

/// One response entry: the line text plus an attached literal, if the
/// line announced one.
#[derive(Debug)]
struct ResponseLine {
    text: String,
    literal: Option<Vec<u8>>,
}

/// An authenticated IMAP session. Construction dials, performs the TLS
/// handshake and logs in; a value of this type is always usable.
pub struct ImapSession {
    stream: rustls::StreamOwned<rustls::ClientConnection, TcpStream>,
    tag: u32,
}

impl ImapSession {
    /// Dial the server and authenticate.
    pub fn connect(
        host: &str,
        port: u16,
        username: &str,
        password: &SecretString,
    ) -> Result<Self, MailStoreError> {
        let tcp = TcpStream::connect((host, port)).map_err(|e| MailStoreError::Dial {
            host: host.to_string(),
            port,
            reason: e.to_string(),
        })?;
        tcp.set_read_timeout(Some(READ_TIMEOUT))?;

        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        );
        let server_name = rustls_pki_types::ServerName::try_from(host.to_string())
            .map_err(|e| MailStoreError::Tls(e.to_string()))?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| MailStoreError::Tls(e.to_string()))?;

        let mut session = Self {
            stream: rustls::StreamOwned::new(conn, tcp),
            tag: 0,
        };

        let greeting = session.read_line()?;
        debug!(greeting = greeting.trim(), "IMAP server greeting");

        let login = format!(
            "LOGIN {} {}",
            quote_string(username),
            quote_string(password.expose_secret())
        );
        session
            .command("LOGIN", &login)
            .map_err(|e| MailStoreError::Auth(e.to_string()))?;

        Ok(session)
    }

    fn next_tag(&mut self) -> String {
        self.tag += 1;
        format!("A{}", self.tag)
    }

    fn read_line(&mut self) -> Result<String, MailStoreError> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match self.stream.read(&mut byte) {
                Ok(0) => return Err(MailStoreError::ConnectionClosed),
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(String::from_utf8_lossy(&buf).to_string());
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn read_literal(&mut self, size: usize) -> Result<Vec<u8>, MailStoreError> {
        let mut buf = vec![0u8; size];
        self.stream.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Send one command and collect response lines until the tagged
    /// completion. Lines announcing a literal get the bytes attached.
    /// A tagged response other than OK is a command failure.
    fn command(&mut self, name: &str, body: &str) -> Result<Vec<ResponseLine>, MailStoreError> {
        let tag = self.next_tag();
        let full = format!("{tag} {body}\r\n");
        self.stream.write_all(full.as_bytes())?;
        self.stream.flush()?;

        let mut lines = Vec::new();
        loop {
            let text = self.read_line()?;
            let done = text.starts_with(&tag);
            let literal = match LITERAL_SIZE.captures(text.trim_end()) {
                Some(captures) if !done => {
                    let size: usize = captures[1]
                        .parse()
                        .map_err(|_| MailStoreError::Command {
                            command: name.to_string(),
                            response: format!("bad literal size in {text:?}"),
                        })?;
                    Some(self.read_literal(size)?)
                }
                _ => None,
            };
            lines.push(ResponseLine { text, literal });
            if done {
                break;
            }
        }

        let status = &lines.last().expect("loop pushes at least one line").text;
        if !status.starts_with(&format!("{tag} OK")) {
            return Err(MailStoreError::Command {
                command: name.to_string(),
                response: status.trim().to_string(),
            });
        }
        Ok(lines)
    }
}

impl MailStore for ImapSession {
    fn select(&mut self, mailbox: &str, read_only: bool) -> Result<(), MailStoreError> {
        let verb = if read_only { "EXAMINE" } else { "SELECT" };
        self.command(verb, &format!("{verb} {}", quote_string(mailbox)))?;
        Ok(())
    }

    fn fetch_page(&mut self, window: PageWindow) -> Result<Vec<FetchedMessage>, MailStoreError> {
        let body = format!(
            "FETCH {}:{} (UID FLAGS BODY.PEEK[])",
            window.start,
            window.end()
        );
        // Windows past the end of the mailbox yield an OK response with
        // no untagged FETCH lines; that empty page ends the scan.
        let lines = self.command("FETCH", &body)?;

        let mut messages = Vec::new();
        for line in &lines {
            if !line.text.starts_with("* ") || !line.text.contains(" FETCH ") {
                continue;
            }
            let raw = match line.literal {
                Some(ref bytes) => bytes,
                None => continue,
            };
            let uid = match FETCH_UID
                .captures(&line.text)
                .and_then(|c| c[1].parse().ok())
            {
                Some(uid) => uid,
                None => continue,
            };
            let seen = FETCH_FLAGS
                .captures(&line.text)
                .is_some_and(|c| c[1].contains("\\Seen"));

            if let Some(parsed) = MessageParser::default().parse(raw.as_slice()) {
                messages.push(FetchedMessage {
                    uid,
                    seen,
                    envelope: extract_envelope(&parsed),
                    body_parts: extract_body_parts(&parsed),
                });
            }
        }
        Ok(messages)
    }

    fn move_message(&mut self, uid: u32, destination: &str) -> Result<(), MailStoreError> {
        self.command(
            "MOVE",
            &format!("UID MOVE {uid} {}", quote_string(destination)),
        )?;
        Ok(())
    }

    fn copy_message(&mut self, uid: u32, destination: &str) -> Result<(), MailStoreError> {
        self.command(
            "COPY",
            &format!("UID COPY {uid} {}", quote_string(destination)),
        )?;
        Ok(())
    }

    fn list_mailboxes(&mut self) -> Result<Vec<String>, MailStoreError> {
        let lines = self.command("LIST", r#"LIST "" "*""#)?;
        Ok(lines
            .iter()
            .filter_map(|line| parse_list_mailbox(&line.text))
            .collect())
    }

    fn close(&mut self) -> Result<(), MailStoreError> {
        // Best effort; the server may already have dropped us.
        let _ = self.command("LOGOUT", "LOGOUT");
        Ok(())
    }
}

/// Quote a string for use in an IMAP command.
fn quote_string(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Extract a mailbox name from a `* LIST` response line.
fn parse_list_mailbox(line: &str) -> Option<String> {
    let name = LIST_LINE.captures(line)?[1].trim().to_string();
    if name.starts_with('"') && name.ends_with('"') && name.len() >= 2 {
        Some(name[1..name.len() - 1].replace("\\\"", "\"").replace("\\\\", "\\"))
    } else {
        Some(name)
    }
}

fn extract_envelope(parsed: &mail_parser::Message<'_>) -> Envelope {
    Envelope {
        from: convert_addresses(parsed.from()),
        to: convert_addresses(parsed.to()),
        cc: convert_addresses(parsed.cc()),
        reply_to: convert_addresses(parsed.reply_to()),
        subject: parsed.subject().unwrap_or_default().to_string(),
        date: parsed
            .date()
            .and_then(|d| chrono::DateTime::from_timestamp(d.to_timestamp(), 0)),
    }
}

fn convert_addresses(header: Option<&mail_parser::Address<'_>>) -> Vec<Address> {
    let Some(header) = header else {
        return Vec::new();
    };
    match header {
        mail_parser::Address::List(addrs) => addrs.iter().map(convert_addr).collect(),
        mail_parser::Address::Group(groups) => groups
            .iter()
            .flat_map(|g| g.addresses.iter().map(convert_addr))
            .collect(),
    }
}

fn convert_addr(addr: &mail_parser::Addr<'_>) -> Address {
    Address {
        name: addr.name.as_ref().map(|n| n.to_string()),
        address: addr
            .address
            .as_ref()
            .map(|a| a.to_string())
            .unwrap_or_default(),
    }
}

/// Collect text body segments in wire order; fall back to stripped HTML.
fn extract_body_parts(parsed: &mail_parser::Message<'_>) -> Vec<String> {
    let texts: Vec<String> = (0..)
        .map_while(|i| parsed.body_text(i))
        .map(|t| t.to_string())
        .collect();
    if !texts.is_empty() {
        return texts;
    }
    if let Some(html) = parsed.body_html(0) {
        return vec![strip_html(html.as_ref())];
    }
    Vec::new()
}

/// Strip HTML tags from content (basic) and normalize whitespace.
fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    // Session methods need a live server; the protocol parsing below is
    // what unit tests can cover.

    #[test]
    fn quotes_and_escapes_strings() {
        assert_eq!(quote_string("INBOX"), r#""INBOX""#);
        assert_eq!(quote_string(r#"we"ird"#), r#""we\"ird""#);
        assert_eq!(quote_string(r"back\slash"), r#""back\\slash""#);
    }

    #[test]
    fn parses_fetch_metadata() {
        let line = r"* 3 FETCH (UID 118 FLAGS (\Seen \Answered) BODY[] {442}";
        let uid: u32 = FETCH_UID.captures(line).unwrap()[1].parse().unwrap();
        assert_eq!(uid, 118);
        assert!(FETCH_FLAGS.captures(line).unwrap()[1].contains("\\Seen"));
        let size: usize = LITERAL_SIZE.captures(line).unwrap()[1].parse().unwrap();
        assert_eq!(size, 442);
    }

    #[test]
    fn unseen_message_has_no_seen_flag() {
        let line = r"* 4 FETCH (UID 119 FLAGS () BODY[] {10}";
        assert!(!FETCH_FLAGS.captures(line).unwrap()[1].contains("\\Seen"));
    }

    #[test]
    fn parses_list_responses() {
        assert_eq!(
            parse_list_mailbox("* LIST (\\HasNoChildren) \"/\" \"INBOX\"\r\n"),
            Some("INBOX".into())
        );
        assert_eq!(
            parse_list_mailbox("* LIST (\\HasNoChildren \\Trash) \"/\" \"[Gmail]/Trash\"\r\n"),
            Some("[Gmail]/Trash".into())
        );
        assert_eq!(
            parse_list_mailbox("* LIST (\\HasNoChildren) \"/\" Drafts\r\n"),
            Some("Drafts".into())
        );
        assert_eq!(parse_list_mailbox("* SEARCH 1 2 3"), None);
    }

    #[test]
    fn strip_html_basic() {
        assert_eq!(strip_html("<p>Hello <b>world</b></p>"), "Hello world");
        assert_eq!(strip_html("plain text"), "plain text");
        assert_eq!(strip_html("<div>  spaced   out  </div>"), "spaced out");
    }

    #[test]
    fn extracts_envelope_from_rfc822() {
        let raw = concat!(
            "From: Alice <alice@example.com>\r\n",
            "To: me@example.com\r\n",
            "Cc: bob@example.com, carol@example.com\r\n",
            "Reply-To: alice@example.com\r\n",
            "Subject: Build status\r\n",
            "Date: Mon, 3 Aug 2026 10:00:00 +0000\r\n",
            "\r\n",
            "All green.\r\n"
        );
        let parsed = MessageParser::default().parse(raw.as_bytes()).unwrap();
        let envelope = extract_envelope(&parsed);
        assert_eq!(envelope.from, vec![Address::named("Alice", "alice@example.com")]);
        assert_eq!(envelope.cc.len(), 2);
        assert_eq!(envelope.subject, "Build status");
        assert!(envelope.date.is_some());
        let parts = extract_body_parts(&parsed);
        assert_eq!(parts.len(), 1);
        assert!(parts[0].contains("All green."));
    }

    #[test]
    fn html_only_message_falls_back_to_stripped_text() {
        let raw = concat!(
            "From: a@b.c\r\n",
            "Subject: html\r\n",
            "Content-Type: text/html\r\n",
            "\r\n",
            "<html><body><p>Click <a href=\"x\">here</a></p></body></html>\r\n"
        );
        let parsed = MessageParser::default().parse(raw.as_bytes()).unwrap();
        let parts = extract_body_parts(&parsed);
        assert_eq!(parts.len(), 1);
        assert!(parts[0].contains("Click here"));
    }
}
