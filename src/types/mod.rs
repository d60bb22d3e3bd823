//! Core types for the dispatch client.
//!
//! This module provides:
//! - The caller-facing notification message
//! - Address parsing for the SMTP envelope
//! - Batch send results

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::errors::{DeliveryError, MessageFailure, SmtpError, SmtpResult};

/// Email address with optional display name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    /// Display name (e.g., "John Doe").
    pub name: Option<String>,
    /// Email address (e.g., "john@example.com").
    pub email: String,
}

impl Address {
    /// Parses an address from a string (e.g., "John Doe <john@example.com>").
    pub fn parse(s: &str) -> SmtpResult<Self> {
        let s = s.trim();

        if let Some(start) = s.find('<') {
            let end = s.rfind('>').filter(|end| *end > start).ok_or_else(|| {
                SmtpError::invalid_address(format!("invalid address {:?}: missing '>'", s))
            })?;
            if !s[end + 1..].trim().is_empty() {
                return Err(SmtpError::invalid_address(format!(
                    "invalid address {:?}: unexpected text after '>'",
                    s
                )));
            }
            let name = s[..start].trim().trim_matches('"');
            if name.chars().any(char::is_control) {
                return Err(SmtpError::invalid_address(format!(
                    "invalid address {:?}: control character in display name",
                    s
                )));
            }
            let email = s[start + 1..end].trim();
            Self::validate_email(email)?;
            return Ok(Self {
                name: (!name.is_empty()).then(|| name.to_string()),
                email: email.to_string(),
            });
        }

        Self::validate_email(s)?;
        Ok(Self {
            name: None,
            email: s.to_string(),
        })
    }

    /// Checks the address against the SMTP envelope grammar.
    fn validate_email(email: &str) -> SmtpResult<()> {
        lettre::Address::from_str(email)
            .map(|_| ())
            .map_err(|e| {
                SmtpError::invalid_address(format!("invalid address {:?}: {}", email, e)).with_cause(e)
            })
    }

    /// Returns the address as an SMTP envelope address.
    pub fn to_envelope(&self) -> SmtpResult<lettre::Address> {
        lettre::Address::from_str(&self.email).map_err(|e| {
            SmtpError::invalid_address(format!("invalid address {:?}: {}", self.email, e)).with_cause(e)
        })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} <{}>", name, self.email),
            None => write!(f, "{}", self.email),
        }
    }
}

/// A file attached from memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedFile {
    /// File name shown to the recipient.
    pub name: String,
    /// Raw content.
    pub content: Vec<u8>,
}

impl AttachedFile {
    /// Creates a new attached file.
    pub fn new(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

/// One logical notification email.
#[derive(Debug, Clone, Default)]
pub struct Message {
    /// Sender address.
    pub from: String,
    /// Recipients, in order.
    pub to: Vec<String>,
    /// Reply-To addresses, each applied as its own entry.
    pub reply_to: Vec<String>,
    /// Subject line.
    pub subject: String,
    /// Body content keyed by content type (e.g. `text/html`).
    pub body: HashMap<String, String>,
    /// Files embedded inline (e.g. images referenced by `cid:`).
    pub embedded_files: Vec<PathBuf>,
    /// Files attached from memory.
    pub attached_files: Vec<AttachedFile>,
}

impl Message {
    /// Creates a new message builder.
    pub fn builder() -> MessageBuilder {
        MessageBuilder::default()
    }

    /// Returns the body for a content type, empty if absent.
    pub fn body_for(&self, content_type: &str) -> &str {
        self.body.get(content_type).map(String::as_str).unwrap_or("")
    }

    /// Returns true if the message carries embedded or attached files.
    pub fn has_files(&self) -> bool {
        !self.embedded_files.is_empty() || !self.attached_files.is_empty()
    }
}

/// Builder for messages.
#[derive(Debug, Default)]
pub struct MessageBuilder {
    message: Message,
}

impl MessageBuilder {
    /// Sets the sender address.
    pub fn from(mut self, address: impl Into<String>) -> Self {
        self.message.from = address.into();
        self
    }

    /// Adds a recipient.
    pub fn to(mut self, address: impl Into<String>) -> Self {
        self.message.to.push(address.into());
        self
    }

    /// Adds multiple recipients.
    pub fn to_many<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.message.to.extend(addresses.into_iter().map(Into::into));
        self
    }

    /// Adds a Reply-To address.
    pub fn reply_to(mut self, address: impl Into<String>) -> Self {
        self.message.reply_to.push(address.into());
        self
    }

    /// Sets the subject.
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.message.subject = subject.into();
        self
    }

    /// Sets the body for one content type.
    pub fn body(mut self, content_type: impl Into<String>, content: impl Into<String>) -> Self {
        self.message.body.insert(content_type.into(), content.into());
        self
    }

    /// Embeds a file inline.
    pub fn embed(mut self, path: impl Into<PathBuf>) -> Self {
        self.message.embedded_files.push(path.into());
        self
    }

    /// Attaches a file from memory.
    pub fn attach(mut self, name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        self.message.attached_files.push(AttachedFile::new(name, content));
        self
    }

    /// Builds the message.
    pub fn build(self) -> SmtpResult<Message> {
        if self.message.from.trim().is_empty() {
            return Err(SmtpError::invalid_address("From address is required"));
        }

        if self.message.to.is_empty() {
            return Err(SmtpError::invalid_address("At least one recipient is required"));
        }

        Ok(self.message)
    }
}

/// Result of sending a batch of messages.
///
/// `error` is set iff at least one message failed; callers learn about
/// partial success from `sent`, not from the error alone.
#[derive(Debug, Default)]
pub struct BatchSendResult {
    /// Messages the server accepted.
    pub sent: usize,
    /// Aggregate of every per-message failure.
    pub error: Option<DeliveryError>,
}

impl BatchSendResult {
    pub(crate) fn from_parts(sent: usize, failures: Vec<MessageFailure>) -> Self {
        Self {
            sent,
            error: (!failures.is_empty()).then(|| DeliveryError::new(failures)),
        }
    }

    /// Returns the per-message failures in batch order.
    pub fn failures(&self) -> &[MessageFailure] {
        self.error.as_ref().map(DeliveryError::failures).unwrap_or(&[])
    }

    /// Returns the number of messages attempted.
    pub fn attempted(&self) -> usize {
        self.sent + self.failures().len()
    }

    /// Returns true if every message was sent.
    pub fn is_complete_success(&self) -> bool {
        self.error.is_none()
    }

    /// Converts into the sent count, or the sent count with the aggregate error.
    pub fn into_result(self) -> Result<usize, (usize, DeliveryError)> {
        match self.error {
            None => Ok(self.sent),
            Some(err) => Err((self.sent, err)),
        }
    }
}
