//! Error types for the dispatch client.
//!
//! Errors carry a [`SmtpErrorKind`]; every kind belongs to one
//! [`ErrorClass`] which decides how the batch loop treats it:
//! configuration errors abort a batch before anything is sent, transport
//! errors are recorded per message, and invalid-address errors are
//! recorded per message without counting toward the failure metric.

use std::fmt;
use thiserror::Error;

/// Result type for dispatch operations.
pub type SmtpResult<T> = Result<T, SmtpError>;

/// Error kinds categorizing different failure modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SmtpErrorKind {
    // Configuration errors
    /// Configuration is invalid (e.g. host is not `host:port`).
    ConfigurationInvalid,
    /// Client certificate or key could not be loaded.
    CertificateInvalid,

    // Address errors
    /// A sender or recipient address could not be parsed.
    InvalidAddress,

    // Connection errors
    /// Connection could not be established.
    ConnectionFailed,
    /// Network operation timed out.
    Timeout,

    // TLS errors
    /// TLS handshake or STARTTLS negotiation failed.
    TlsFailed,

    // Authentication errors
    /// Server rejected the credentials.
    AuthenticationFailed,

    // Server responses
    /// Server answered with a transient (4xx) failure.
    TransientRejection,
    /// Server answered with a permanent (5xx) failure.
    PermanentRejection,
    /// Server response could not be understood.
    InvalidResponse,

    // Message errors
    /// Message could not be serialized.
    EncodingFailed,
    /// An embedded or attached file could not be read.
    AttachmentError,

    // Generic
    /// Unknown or internal error.
    Unknown,
}

/// How a failure is treated by the batch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Defect in the operator's settings; fatal to the whole batch.
    Configuration,
    /// Defect in the caller's input; recorded but not alarmed on.
    InvalidAddress,
    /// Delivery-system fault; recorded and counted as a failure.
    Transport,
}

impl SmtpErrorKind {
    /// Returns the class of this error kind.
    pub fn class(&self) -> ErrorClass {
        match self {
            SmtpErrorKind::ConfigurationInvalid | SmtpErrorKind::CertificateInvalid => {
                ErrorClass::Configuration
            }
            SmtpErrorKind::InvalidAddress => ErrorClass::InvalidAddress,
            _ => ErrorClass::Transport,
        }
    }
}

impl fmt::Display for SmtpErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SmtpErrorKind::ConfigurationInvalid => write!(f, "Invalid configuration"),
            SmtpErrorKind::CertificateInvalid => write!(f, "Could not load cert or key file"),
            SmtpErrorKind::InvalidAddress => write!(f, "Invalid address"),
            SmtpErrorKind::ConnectionFailed => write!(f, "Connection failed"),
            SmtpErrorKind::Timeout => write!(f, "Timed out"),
            SmtpErrorKind::TlsFailed => write!(f, "TLS negotiation failed"),
            SmtpErrorKind::AuthenticationFailed => write!(f, "Authentication failed"),
            SmtpErrorKind::TransientRejection => write!(f, "Transient rejection"),
            SmtpErrorKind::PermanentRejection => write!(f, "Permanent rejection"),
            SmtpErrorKind::InvalidResponse => write!(f, "Invalid server response"),
            SmtpErrorKind::EncodingFailed => write!(f, "Encoding failed"),
            SmtpErrorKind::AttachmentError => write!(f, "Attachment error"),
            SmtpErrorKind::Unknown => write!(f, "Unknown error"),
        }
    }
}

/// Dispatch error with detailed information.
#[derive(Error, Debug)]
pub struct SmtpError {
    /// Error kind.
    kind: SmtpErrorKind,
    /// Human-readable message.
    message: String,
    /// SMTP status code if available.
    smtp_code: Option<u16>,
    /// Underlying cause.
    #[source]
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl SmtpError {
    /// Creates a new error.
    pub fn new(kind: SmtpErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            smtp_code: None,
            cause: None,
        }
    }

    /// Sets the SMTP status code.
    pub fn with_smtp_code(mut self, code: u16) -> Self {
        self.smtp_code = Some(code);
        self
    }

    /// Sets the underlying cause.
    pub fn with_cause<E: std::error::Error + Send + Sync + 'static>(mut self, cause: E) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Returns the error kind.
    pub fn kind(&self) -> SmtpErrorKind {
        self.kind
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the SMTP status code if available.
    pub fn smtp_code(&self) -> Option<u16> {
        self.smtp_code
    }

    /// Returns the error class.
    pub fn class(&self) -> ErrorClass {
        self.kind.class()
    }

    /// Returns true for errors that abort a batch before any send.
    pub fn is_configuration(&self) -> bool {
        self.class() == ErrorClass::Configuration
    }

    /// Returns true for malformed sender or recipient addresses.
    pub fn is_invalid_address(&self) -> bool {
        self.class() == ErrorClass::InvalidAddress
    }

    // Convenience constructors

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::ConfigurationInvalid, message)
    }

    /// Creates a certificate loading error.
    pub fn certificate(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::CertificateInvalid, message)
    }

    /// Creates an invalid address error.
    pub fn invalid_address(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::InvalidAddress, message)
    }

    /// Creates a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::ConnectionFailed, message)
    }

    /// Creates a TLS error.
    pub fn tls(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::TlsFailed, message)
    }

    /// Creates an encoding error.
    pub fn encoding(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::EncodingFailed, message)
    }

    /// Creates an error from an SMTP reply code.
    pub fn from_smtp_response(code: u16, message: impl Into<String>) -> Self {
        let kind = match code {
            530 | 534 | 535 | 538 => SmtpErrorKind::AuthenticationFailed,
            400..=499 => SmtpErrorKind::TransientRejection,
            500..=599 => SmtpErrorKind::PermanentRejection,
            _ => SmtpErrorKind::InvalidResponse,
        };
        Self::new(kind, message).with_smtp_code(code)
    }
}

impl fmt::Display for SmtpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(code) = self.smtp_code {
            write!(f, " (SMTP {})", code)?;
        }
        Ok(())
    }
}

impl From<std::io::Error> for SmtpError {
    fn from(err: std::io::Error) -> Self {
        SmtpError::encoding(err.to_string()).with_cause(err)
    }
}

/// A single message that could not be delivered.
#[derive(Error, Debug)]
#[error("failed to send notification to email addresses: {}: {}", .recipients.join(";"), .error)]
pub struct MessageFailure {
    /// The `To` list of the failed message.
    pub recipients: Vec<String>,
    /// What went wrong.
    #[source]
    pub error: SmtpError,
}

impl MessageFailure {
    /// Wraps an error with the recipients of the message that caused it.
    pub fn new(recipients: &[String], error: SmtpError) -> Self {
        Self {
            recipients: recipients.to_vec(),
            error,
        }
    }
}

/// Aggregate of every per-message failure in one batch.
#[derive(Error, Debug)]
pub struct DeliveryError {
    failures: Vec<MessageFailure>,
}

impl DeliveryError {
    pub(crate) fn new(failures: Vec<MessageFailure>) -> Self {
        Self { failures }
    }

    /// Returns the individual failures in batch order.
    pub fn failures(&self) -> &[MessageFailure] {
        &self.failures
    }

    /// Consumes the error, returning the individual failures.
    pub fn into_failures(self) -> Vec<MessageFailure> {
        self.failures
    }
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.failures.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", failure)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_class() {
        assert_eq!(SmtpErrorKind::ConfigurationInvalid.class(), ErrorClass::Configuration);
        assert_eq!(SmtpErrorKind::CertificateInvalid.class(), ErrorClass::Configuration);
        assert_eq!(SmtpErrorKind::InvalidAddress.class(), ErrorClass::InvalidAddress);
        assert_eq!(SmtpErrorKind::ConnectionFailed.class(), ErrorClass::Transport);
        assert_eq!(SmtpErrorKind::PermanentRejection.class(), ErrorClass::Transport);
    }

    #[test]
    fn test_smtp_error_from_response() {
        let err = SmtpError::from_smtp_response(535, "Authentication failed");
        assert_eq!(err.kind(), SmtpErrorKind::AuthenticationFailed);
        assert_eq!(err.smtp_code(), Some(535));

        let err = SmtpError::from_smtp_response(421, "Service unavailable");
        assert_eq!(err.kind(), SmtpErrorKind::TransientRejection);

        let err = SmtpError::from_smtp_response(550, "No such user");
        assert_eq!(err.kind(), SmtpErrorKind::PermanentRejection);
        assert!(!err.is_invalid_address());
    }

    #[test]
    fn test_message_failure_display() {
        let failure = MessageFailure::new(
            &["a@example.com".to_string(), "b@example.com".to_string()],
            SmtpError::connection("refused"),
        );
        assert_eq!(
            failure.to_string(),
            "failed to send notification to email addresses: a@example.com;b@example.com: Connection failed: refused"
        );
    }

    #[test]
    fn test_delivery_error_joins_failures() {
        let err = DeliveryError::new(vec![
            MessageFailure::new(&["a@example.com".to_string()], SmtpError::connection("refused")),
            MessageFailure::new(&["bad".to_string()], SmtpError::invalid_address("bad")),
        ]);
        assert_eq!(err.failures().len(), 2);
        assert_eq!(err.to_string().lines().count(), 2);
    }
}
