//! # SMTP Notification Dispatch
//!
//! An outbound mail client for alert and notification emails with:
//! - Batch dispatch over one dialer, one attempt per message
//! - STARTTLS policy, implicit TLS and client certificates
//! - Multipart message construction with embedded and attached files
//! - Trace context propagation through message headers
//! - Process-wide delivery metrics
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use integrations_smtp_dispatch::{Message, SmtpClient, SmtpSettings};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = SmtpSettings::builder()
//!         .host("smtp.example.com:587")
//!         .credentials("grafana", "password")
//!         .start_tls_policy("MandatoryStartTLS")
//!         .content_types(["text/html", "text/plain"])
//!         .build()?;
//!
//!     let client = SmtpClient::new(settings)?;
//!
//!     let message = Message::builder()
//!         .from("Grafana <alerts@example.com>")
//!         .to("oncall@example.com")
//!         .subject("[FIRING:1] HighCPU")
//!         .body("text/html", "<p>CPU is high</p>")
//!         .body("text/plain", "CPU is high")
//!         .build()?;
//!
//!     let result = client.send(&[message]).await?;
//!     println!("sent {} message(s)", result.sent);
//!     if let Some(err) = result.error {
//!         eprintln!("{}", err);
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core modules
pub mod config;
pub mod errors;
pub mod types;

// Message construction
pub mod mime;
pub mod propagation;

// Transport layer
pub mod transport;

// Observability
pub mod observability;

// Client
pub mod client;

// Mocks for testing
pub mod mocks;

// Re-exports for convenience
pub use client::{Mailer, SmtpClient, SmtpClientBuilder};
pub use config::{SmtpSettings, SmtpSettingsBuilder, StartTlsPolicy, instance_name, set_instance_name};
pub use errors::{DeliveryError, ErrorClass, MessageFailure, SmtpError, SmtpErrorKind, SmtpResult};
pub use types::{Address, AttachedFile, BatchSendResult, Message, MessageBuilder};
pub use mime::{WireMessage, build_wire_message};
pub use propagation::{HeaderCarrier, WireHeaderCarrier};
pub use transport::{Dialer, LettreTransportFactory, MailTransport, TransportFactory};
pub use observability::{DeliveryMetrics, MetricsSnapshot};
