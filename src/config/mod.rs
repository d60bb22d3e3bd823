//! Configuration types for the dispatch client.
//!
//! Provides the operator-facing transport settings with a builder:
//! - Server address (`host:port`)
//! - Credentials and TLS material
//! - STARTTLS policy and EHLO identity
//! - Static headers and content-type precedence
//! - Trace propagation toggle

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::errors::{SmtpError, SmtpResult};

/// Default content types when none are configured.
pub const DEFAULT_CONTENT_TYPES: &[&str] = &["text/html"];

/// Port on which the server expects implicit TLS instead of STARTTLS.
pub const IMPLICIT_TLS_PORT: u16 = 465;

static INSTANCE_NAME: OnceLock<String> = OnceLock::new();

/// Sets the process-wide instance name used as the default EHLO identity.
///
/// Only the first call has an effect. Returns false if the name was
/// already set (or already derived from the environment).
pub fn set_instance_name(name: impl Into<String>) -> bool {
    INSTANCE_NAME.set(name.into()).is_ok()
}

/// Returns the process-wide instance name.
///
/// Falls back to `INSTANCE_NAME`, then `HOSTNAME` from the environment,
/// then `localhost`.
pub fn instance_name() -> &'static str {
    INSTANCE_NAME.get_or_init(|| {
        ["INSTANCE_NAME", "HOSTNAME"]
            .iter()
            .filter_map(|var| std::env::var(var).ok())
            .map(|value| value.trim().to_string())
            .find(|value| !value.is_empty())
            .unwrap_or_else(|| "localhost".to_string())
    })
}

/// STARTTLS policy for plain-text connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartTlsPolicy {
    /// Never upgrade the connection.
    NoStartTls,
    /// Upgrade when the server advertises STARTTLS.
    #[default]
    OpportunisticStartTls,
    /// Fail unless the connection can be upgraded.
    MandatoryStartTls,
}

impl StartTlsPolicy {
    /// Resolves a symbolic policy name.
    ///
    /// Unrecognized names resolve to [`StartTlsPolicy::OpportunisticStartTls`]
    /// rather than failing.
    pub fn from_name(name: &str) -> Self {
        match name {
            "NoStartTLS" => StartTlsPolicy::NoStartTls,
            "MandatoryStartTLS" => StartTlsPolicy::MandatoryStartTls,
            "OpportunisticStartTLS" | "" => StartTlsPolicy::OpportunisticStartTls,
            _other => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    policy = %_other,
                    "Unknown STARTTLS policy, falling back to OpportunisticStartTLS"
                );
                StartTlsPolicy::OpportunisticStartTls
            }
        }
    }

    /// Returns the symbolic name of this policy.
    pub fn name(&self) -> &'static str {
        match self {
            StartTlsPolicy::NoStartTls => "NoStartTLS",
            StartTlsPolicy::OpportunisticStartTls => "OpportunisticStartTLS",
            StartTlsPolicy::MandatoryStartTls => "MandatoryStartTLS",
        }
    }
}

/// Transport settings shared by every send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpSettings {
    /// Server address in `host:port` form.
    pub host: String,
    /// Authentication username; empty disables authentication.
    #[serde(default)]
    pub user: String,
    /// Authentication password (serialization skipped for security).
    #[serde(skip_serializing, default)]
    pub password: Option<SecretString>,
    /// Path to client certificate file (PEM).
    #[serde(default)]
    pub cert_file: Option<PathBuf>,
    /// Path to client key file (PEM).
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    /// Skip server certificate and hostname verification.
    #[serde(default)]
    pub skip_verify: bool,
    /// Symbolic STARTTLS policy name.
    #[serde(default, rename = "startTLS_policy")]
    pub start_tls_policy: String,
    /// Local identity for EHLO; defaults to the instance name.
    #[serde(default)]
    pub ehlo_identity: Option<String>,
    /// Headers added to every message.
    #[serde(default)]
    pub static_headers: BTreeMap<String, String>,
    /// Body content types, most preferred first.
    #[serde(default = "default_content_types")]
    pub content_types: Vec<String>,
    /// Inject trace context into message headers.
    #[serde(default)]
    pub enable_tracing: bool,
    /// Network timeout for each connection.
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

fn default_content_types() -> Vec<String> {
    DEFAULT_CONTENT_TYPES.iter().map(|s| s.to_string()).collect()
}

impl SmtpSettings {
    /// Creates a new settings builder.
    pub fn builder() -> SmtpSettingsBuilder {
        SmtpSettingsBuilder::default()
    }

    /// Parses settings from a TOML document.
    pub fn from_toml_str(s: &str) -> SmtpResult<Self> {
        let settings: SmtpSettings = toml::from_str(s)
            .map_err(|e| SmtpError::configuration(format!("Invalid TOML settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parses settings from a JSON document.
    pub fn from_json_str(s: &str) -> SmtpResult<Self> {
        let settings: SmtpSettings = serde_json::from_str(s)
            .map_err(|e| SmtpError::configuration(format!("Invalid JSON settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validates the structural fields.
    ///
    /// The `host:port` split is not checked here; it happens when a batch
    /// is dialed (see [`SmtpSettings::host_port`]).
    pub fn validate(&self) -> SmtpResult<()> {
        if self.host.trim().is_empty() {
            return Err(SmtpError::configuration("Host is required"));
        }

        if self.key_file.is_some() && self.cert_file.is_none() {
            return Err(SmtpError::configuration("key_file is set without cert_file"));
        }

        Ok(())
    }

    /// Splits the host setting into hostname and port.
    pub fn host_port(&self) -> SmtpResult<(String, u16)> {
        split_host_port(&self.host)
    }

    /// Returns true if authentication is configured.
    pub fn has_auth(&self) -> bool {
        !self.user.is_empty()
    }

    /// Returns the resolved STARTTLS policy.
    pub fn start_tls_policy(&self) -> StartTlsPolicy {
        StartTlsPolicy::from_name(&self.start_tls_policy)
    }

    /// Returns the EHLO identity: the explicit override or the instance name.
    pub fn local_name(&self) -> &str {
        match self.ehlo_identity.as_deref() {
            Some(identity) if !identity.is_empty() => identity,
            _ => instance_name(),
        }
    }
}

/// Splits `host:port`, accepting bracketed IPv6 literals.
pub fn split_host_port(address: &str) -> SmtpResult<(String, u16)> {
    let invalid = |reason: &str| {
        SmtpError::configuration(format!("address {}: {}", address, reason))
    };

    let (host, port) = if let Some(rest) = address.strip_prefix('[') {
        let end = rest.find(']').ok_or_else(|| invalid("missing ']' in address"))?;
        let port = rest[end + 1..]
            .strip_prefix(':')
            .ok_or_else(|| invalid("missing port in address"))?;
        (&rest[..end], port)
    } else {
        let idx = address.rfind(':').ok_or_else(|| invalid("missing port in address"))?;
        let host = &address[..idx];
        if host.contains(':') {
            return Err(invalid("too many colons in address"));
        }
        (host, &address[idx + 1..])
    };

    if host.is_empty() {
        return Err(invalid("missing host in address"));
    }

    let port = port
        .parse::<u16>()
        .map_err(|_| invalid("invalid port"))?;

    Ok((host.to_string(), port))
}

/// Builder for transport settings.
#[derive(Debug, Default)]
pub struct SmtpSettingsBuilder {
    host: Option<String>,
    user: String,
    password: Option<SecretString>,
    cert_file: Option<PathBuf>,
    key_file: Option<PathBuf>,
    skip_verify: bool,
    start_tls_policy: String,
    ehlo_identity: Option<String>,
    static_headers: BTreeMap<String, String>,
    content_types: Vec<String>,
    enable_tracing: bool,
    timeout: Option<Duration>,
}

impl SmtpSettingsBuilder {
    /// Sets the server address (`host:port`).
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Sets plain credentials.
    pub fn credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = Some(SecretString::new(password.into()));
        self
    }

    /// Sets the client certificate and key files.
    pub fn client_certificate(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.cert_file = Some(cert.into());
        self.key_file = Some(key.into());
        self
    }

    /// Sets whether to skip certificate verification.
    pub fn skip_verify(mut self, skip: bool) -> Self {
        self.skip_verify = skip;
        self
    }

    /// Sets the STARTTLS policy by symbolic name.
    pub fn start_tls_policy(mut self, policy: impl Into<String>) -> Self {
        self.start_tls_policy = policy.into();
        self
    }

    /// Sets the EHLO identity.
    pub fn ehlo_identity(mut self, identity: impl Into<String>) -> Self {
        self.ehlo_identity = Some(identity.into());
        self
    }

    /// Adds a static header.
    pub fn static_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.static_headers.insert(name.into(), value.into());
        self
    }

    /// Sets the content types, most preferred first.
    pub fn content_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.content_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Enables trace context propagation.
    pub fn enable_tracing(mut self, enable: bool) -> Self {
        self.enable_tracing = enable;
        self
    }

    /// Sets the network timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Builds the settings.
    pub fn build(self) -> SmtpResult<SmtpSettings> {
        let settings = SmtpSettings {
            host: self.host.ok_or_else(|| SmtpError::configuration("Host is required"))?,
            user: self.user,
            password: self.password,
            cert_file: self.cert_file,
            key_file: self.key_file,
            skip_verify: self.skip_verify,
            start_tls_policy: self.start_tls_policy,
            ehlo_identity: self.ehlo_identity,
            static_headers: self.static_headers,
            content_types: if self.content_types.is_empty() {
                default_content_types()
            } else {
                self.content_types
            },
            enable_tracing: self.enable_tracing,
            timeout: self.timeout,
        };

        settings.validate()?;
        Ok(settings)
    }
}

// Humantime serde support
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_str(&humantime::format_duration(*d).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: Option<String> = Option::deserialize(deserializer)?;
        s.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
