//! Batch dispatch client.
//!
//! [`SmtpClient`] sends a batch of notifications over one dialer:
//! - Configuration defects abort the batch before anything is sent
//! - Messages are sent strictly in order, one attempt each
//! - A failed message never stops the ones after it
//! - Every outcome is recorded in the process-wide delivery metrics
//!
//! Each batch runs under a `notifications.SmtpClient.Send` OpenTelemetry
//! span. The span is the parent of the context injected into messages.

use async_trait::async_trait;
use opentelemetry::global::{self, BoxedTracer};
use opentelemetry::trace::{Span, Status, TraceContextExt, Tracer};
use opentelemetry::{Array, Context, KeyValue, StringValue, Value};
use std::fmt;
use std::sync::Arc;

use crate::config::SmtpSettings;
use crate::errors::{MessageFailure, SmtpError, SmtpResult};
use crate::mime::build_wire_message;
use crate::observability::{DeliveryMetrics, Timer};
use crate::transport::{envelope_for, Dialer, LettreTransportFactory, MailTransport, TransportFactory};
use crate::types::{BatchSendResult, Message};

/// Instrumentation name used with the global tracer provider.
pub const TRACER_NAME: &str = "notifications";

/// Name of the span covering one batch.
pub const SEND_SPAN_NAME: &str = "notifications.SmtpClient.Send";

/// Sends batches of notification emails.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Sends every message once, in order, carrying `cx` into the headers
    /// when trace propagation is enabled.
    async fn send(&self, cx: &Context, messages: &[Message]) -> SmtpResult<BatchSendResult>;
}

/// SMTP notification client.
#[derive(Clone)]
pub struct SmtpClient {
    /// Transport settings.
    settings: Arc<SmtpSettings>,
    /// Opens a transport per batch.
    factory: Arc<dyn TransportFactory>,
    /// Delivery counters.
    metrics: &'static DeliveryMetrics,
    /// Tracer for the batch span; the global one when unset.
    tracer: Option<Arc<BoxedTracer>>,
}

impl fmt::Debug for SmtpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpClient")
            .field("settings", &self.settings)
            .field("factory", &self.factory)
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

impl SmtpClient {
    /// Creates a client backed by `lettre`.
    ///
    /// Only structural validation happens here; the `host:port` split and
    /// certificate loading happen on each send.
    pub fn new(settings: SmtpSettings) -> SmtpResult<Self> {
        Self::builder().settings(settings).build()
    }

    /// Creates a builder for the client.
    pub fn builder() -> SmtpClientBuilder {
        SmtpClientBuilder::default()
    }

    /// Returns the transport settings.
    pub fn settings(&self) -> &SmtpSettings {
        &self.settings
    }

    /// Returns the delivery counters this client writes to.
    pub fn metrics(&self) -> &'static DeliveryMetrics {
        self.metrics
    }

    /// Sends a batch with the current trace context.
    pub async fn send(&self, messages: &[Message]) -> SmtpResult<BatchSendResult> {
        let cx = Context::current();
        self.send_with_context(&cx, messages).await
    }

    /// Sends a batch, injecting `cx` into each message when enabled.
    ///
    /// Returns `Err` only for configuration defects, before any message is
    /// attempted. Per-message failures are reported in the result together
    /// with the number of messages sent.
    pub async fn send_with_context(&self, cx: &Context, messages: &[Message]) -> SmtpResult<BatchSendResult> {
        let timer = Timer::start("notifications.smtp.send");
        let cx = self.start_send_span(cx, messages.len());
        let cx = &cx;

        #[cfg(feature = "tracing")]
        let result = {
            use tracing::Instrument;
            let span = tracing::info_span!(
                "notifications.smtp.send",
                messages = messages.len(),
                host = %self.settings.host
            );
            self.dispatch(cx, messages).instrument(span).await
        };

        #[cfg(not(feature = "tracing"))]
        let result = self.dispatch(cx, messages).await;

        let _elapsed = timer.stop();

        #[cfg(feature = "tracing")]
        match &result {
            Ok(batch) => tracing::info!(
                sent = batch.sent,
                failed = batch.failures().len(),
                duration_ms = _elapsed.as_millis() as u64,
                "Notification batch finished"
            ),
            Err(e) => tracing::error!(error = %e, "Notification batch aborted"),
        }

        if let Err(e) = &result {
            cx.span().record_error(e);
            cx.span().set_status(Status::error(e.to_string()));
        }
        cx.span().end();

        result
    }

    /// Starts the batch span as a child of `parent`.
    fn start_send_span(&self, parent: &Context, messages: usize) -> Context {
        let mut span = match &self.tracer {
            Some(tracer) => tracer.start_with_context(SEND_SPAN_NAME, parent),
            None => global::tracer(TRACER_NAME).start_with_context(SEND_SPAN_NAME, parent),
        };
        span.set_attribute(KeyValue::new("messages", messages as i64));
        parent.with_span(span)
    }

    async fn dispatch(&self, cx: &Context, messages: &[Message]) -> SmtpResult<BatchSendResult> {
        let dialer = Dialer::from_settings(&self.settings)?;
        let transport = self.factory.open(&dialer)?;

        let mut sent = 0;
        let mut failures = Vec::new();

        for message in messages {
            cx.span().set_attribute(KeyValue::new("smtp.sender", message.from.clone()));
            cx.span().set_attribute(KeyValue::new(
                "smtp.recipients",
                Value::Array(Array::String(message.to.iter().cloned().map(StringValue::from).collect())),
            ));

            let outcome = self.send_one(transport.as_ref(), cx, message).await;
            self.metrics.record_attempt();

            match outcome {
                Ok(()) => {
                    sent += 1;
                    self.metrics.record_sent();

                    #[cfg(feature = "tracing")]
                    tracing::debug!(
                        from = %message.from,
                        to = %message.to.join(";"),
                        "Notification sent"
                    );
                }
                Err(error) => {
                    // Malformed addresses are caller input, not delivery faults.
                    if !error.is_invalid_address() {
                        self.metrics.record_failed();
                    }

                    #[cfg(feature = "tracing")]
                    tracing::error!(
                        to = %message.to.join(";"),
                        error = %error,
                        smtp_code = error.smtp_code(),
                        "Failed to send notification"
                    );

                    let failure = MessageFailure::new(&message.to, error);
                    cx.span().record_error(&failure);
                    cx.span().set_status(Status::error(failure.to_string()));
                    failures.push(failure);
                }
            }
        }

        Ok(BatchSendResult::from_parts(sent, failures))
    }

    async fn send_one(&self, transport: &dyn MailTransport, cx: &Context, message: &Message) -> SmtpResult<()> {
        let wire = build_wire_message(&self.settings, message, cx);
        let envelope = envelope_for(message)?;
        let data = wire.to_bytes()?;

        transport.send_raw(&envelope, &data).await
    }
}

#[async_trait]
impl Mailer for SmtpClient {
    async fn send(&self, cx: &Context, messages: &[Message]) -> SmtpResult<BatchSendResult> {
        self.send_with_context(cx, messages).await
    }
}

/// Builder for SmtpClient.
#[derive(Default)]
pub struct SmtpClientBuilder {
    settings: Option<SmtpSettings>,
    factory: Option<Arc<dyn TransportFactory>>,
    metrics: Option<&'static DeliveryMetrics>,
    tracer: Option<BoxedTracer>,
}

impl fmt::Debug for SmtpClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpClientBuilder")
            .field("settings", &self.settings)
            .field("factory", &self.factory)
            .field("metrics", &self.metrics)
            .field("tracer", &self.tracer.is_some())
            .finish()
    }
}

impl SmtpClientBuilder {
    /// Sets the transport settings.
    pub fn settings(mut self, settings: SmtpSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Replaces the `lettre` transport factory.
    pub fn transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Writes delivery counters to `metrics` instead of the global ones.
    pub fn metrics(mut self, metrics: &'static DeliveryMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Starts batch spans on `tracer` instead of the global tracer.
    pub fn tracer(mut self, tracer: BoxedTracer) -> Self {
        self.tracer = Some(tracer);
        self
    }

    /// Builds the client.
    pub fn build(self) -> SmtpResult<SmtpClient> {
        let settings = self
            .settings
            .ok_or_else(|| SmtpError::configuration("Settings are required"))?;
        settings.validate()?;

        Ok(SmtpClient {
            settings: Arc::new(settings),
            factory: self.factory.unwrap_or_else(|| Arc::new(LettreTransportFactory)),
            metrics: self.metrics.unwrap_or_else(DeliveryMetrics::global),
            tracer: self.tracer.map(Arc::new),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SmtpErrorKind;
    use crate::mocks::{MockTransport, MockTransportFactory, RecordingTracer, TestFixtures};

    fn private_metrics() -> &'static DeliveryMetrics {
        Box::leak(Box::new(DeliveryMetrics::new()))
    }

    fn client(factory: &MockTransportFactory) -> SmtpClient {
        SmtpClient::builder()
            .settings(TestFixtures::settings())
            .transport_factory(Arc::new(factory.clone()))
            .metrics(private_metrics())
            .build()
            .unwrap()
    }

    #[test]
    fn test_client_builder() {
        let client = SmtpClient::new(TestFixtures::settings()).unwrap();
        assert_eq!(client.settings().host, "smtp.example.com:587");
        assert!(std::ptr::eq(client.metrics(), DeliveryMetrics::global()));

        assert!(SmtpClient::builder().build().is_err());
    }

    #[tokio::test]
    async fn test_send_all_succeed() {
        let transport = MockTransport::new();
        let factory = MockTransportFactory::new(transport.clone());
        let client = client(&factory);

        let messages = vec![TestFixtures::message("a@example.com"), TestFixtures::message("b@example.com")];
        let result = client.send(&messages).await.unwrap();

        assert_eq!(result.sent, 2);
        assert!(result.is_complete_success());
        assert_eq!(factory.opened(), 1);
        assert_eq!(transport.sent_count(), 2);
        assert_eq!(client.metrics().snapshot().sent, 2);
    }

    #[tokio::test]
    async fn test_send_empty_batch() {
        let transport = MockTransport::new();
        let factory = MockTransportFactory::new(transport.clone());
        let client = client(&factory);

        let result = client.send(&[]).await.unwrap();
        assert_eq!(result.sent, 0);
        assert!(result.error.is_none());
        assert_eq!(client.metrics().snapshot().attempted, 0);
    }

    #[tokio::test]
    async fn test_transport_failure_is_per_message() {
        let transport = MockTransport::new();
        transport.fail_message(0, SmtpError::from_smtp_response(550, "mailbox unavailable"));
        let factory = MockTransportFactory::new(transport.clone());
        let client = client(&factory);

        let messages = vec![TestFixtures::message("a@example.com"), TestFixtures::message("b@example.com")];
        let result = client.send(&messages).await.unwrap();

        assert_eq!(result.sent, 1);
        let failures = result.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].recipients, vec!["a@example.com"]);
        assert_eq!(failures[0].error.kind(), SmtpErrorKind::PermanentRejection);

        let snapshot = client.metrics().snapshot();
        assert_eq!(snapshot.attempted, 2);
        assert_eq!(snapshot.sent, 1);
        assert_eq!(snapshot.failed, 1);
    }

    #[tokio::test]
    async fn test_factory_failure_aborts_batch() {
        let factory = MockTransportFactory::failing(SmtpError::configuration("no transport"));
        let client = client(&factory);

        let err = client.send(&[TestFixtures::message("a@example.com")]).await.unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(client.metrics().snapshot().attempted, 0);
    }

    #[tokio::test]
    async fn test_send_span_records_batch() {
        let transport = MockTransport::new();
        transport.fail_message(1, SmtpError::from_smtp_response(550, "mailbox unavailable"));
        let factory = MockTransportFactory::new(transport.clone());
        let tracer = RecordingTracer::new();
        let client = SmtpClient::builder()
            .settings(TestFixtures::settings())
            .transport_factory(Arc::new(factory.clone()))
            .metrics(private_metrics())
            .tracer(tracer.boxed())
            .build()
            .unwrap();

        let messages = vec![TestFixtures::message("a@example.com"), TestFixtures::message("b@example.com")];
        client.send(&messages).await.unwrap();

        let spans = tracer.spans();
        assert_eq!(spans.len(), 1);
        let span = &spans[0];
        assert_eq!(span.name, SEND_SPAN_NAME);
        assert!(span.ended);
        assert_eq!(span.attribute("messages"), Some(Value::I64(2)));
        assert_eq!(span.attribute("smtp.sender"), Some(Value::from("Grafana <alerts@example.com>")));
        assert_eq!(
            span.attribute("smtp.recipients"),
            Some(Value::Array(Array::String(vec![StringValue::from("b@example.com")])))
        );
        assert!(matches!(span.status, Status::Error { .. }));
        assert_eq!(span.events, ["exception"]);
    }

    #[tokio::test]
    async fn test_send_span_records_aborted_batch() {
        let factory = MockTransportFactory::failing(SmtpError::configuration("no transport"));
        let tracer = RecordingTracer::new();
        let client = SmtpClient::builder()
            .settings(TestFixtures::settings())
            .transport_factory(Arc::new(factory))
            .metrics(private_metrics())
            .tracer(tracer.boxed())
            .build()
            .unwrap();

        client.send(&[TestFixtures::message("a@example.com")]).await.unwrap_err();

        let spans = tracer.spans();
        assert!(spans[0].ended);
        assert!(matches!(spans[0].status, Status::Error { .. }));
        assert_eq!(spans[0].attribute("smtp.sender"), None);
    }

    #[test]
    fn test_mailer_trait_object() {
        let transport = MockTransport::new();
        let factory = MockTransportFactory::new(transport.clone());
        let client: Arc<dyn Mailer> = Arc::new(client(&factory));

        let messages = [TestFixtures::message("a@example.com")];
        let result = tokio_test::block_on(client.send(&Context::new(), &messages));
        assert_eq!(result.unwrap().sent, 1);
        assert_eq!(transport.sent_count(), 1);
    }
}
