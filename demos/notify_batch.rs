//! Notification Batch Example
//!
//! This example demonstrates how to:
//! - Load transport settings from TOML
//! - Send a batch of alert notifications with HTML and plain-text bodies
//! - Inspect partial success and the delivery metrics
//!
//! Point `SMTP_SETTINGS` at a TOML file to use your own server; otherwise
//! a local relay on port 1025 (e.g. MailHog) is assumed.

use integrations_smtp_dispatch::{DeliveryMetrics, Message, SmtpClient, SmtpError, SmtpSettings};

const DEFAULT_SETTINGS: &str = r#"
host = "localhost:1025"
startTLS_policy = "NoStartTLS"
ehlo_identity = "grafana.local"
content_types = ["text/html", "text/plain"]
timeout = "10s"

[static_headers]
X-Grafana-Org = "1"
"#;

#[tokio::main]
async fn main() -> Result<(), SmtpError> {
    let settings = match std::env::var("SMTP_SETTINGS") {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| SmtpError::configuration(format!("could not read {}: {}", path, e)))?;
            SmtpSettings::from_toml_str(&raw)?
        }
        Err(_) => SmtpSettings::from_toml_str(DEFAULT_SETTINGS)?,
    };

    println!("Dispatching through {} ({})", settings.host, settings.start_tls_policy().name());
    let client = SmtpClient::new(settings)?;

    let recipients = ["oncall@example.com", "sre@example.com", "not-an-address"];
    let messages = recipients
        .iter()
        .map(|to| {
            Message::builder()
                .from("Grafana <alerts@grafana.local>")
                .to(*to)
                .reply_to("noreply@grafana.local")
                .subject("[FIRING:1] HighCPU (instance=web-01)")
                .body("text/html", "<h2>HighCPU</h2><p>CPU usage above 90% for 5m.</p>")
                .body("text/plain", "HighCPU: CPU usage above 90% for 5m.")
                .attach("labels.json", br#"{"alertname":"HighCPU","instance":"web-01"}"#.to_vec())
                .build()
        })
        .collect::<Result<Vec<_>, _>>()?;

    let result = client.send(&messages).await?;

    println!("Sent {} of {} notification(s)", result.sent, messages.len());
    if let Some(err) = &result.error {
        for failure in err.failures() {
            let class = if failure.error.is_invalid_address() { "input" } else { "delivery" };
            eprintln!("  [{}] {}", class, failure);
        }
    }

    let snapshot = DeliveryMetrics::global().snapshot();
    println!(
        "Metrics: attempted={} sent={} failed={}",
        snapshot.attempted, snapshot.sent, snapshot.failed
    );

    Ok(())
}
