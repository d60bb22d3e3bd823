//! Mock implementations for testing.
//!
//! Provides a recording transport, a counting transport factory, a
//! recording tracer, a deterministic trace propagator and fixtures for
//! London-School TDD.

use async_trait::async_trait;
use lettre::address::Envelope;
use opentelemetry::propagation::text_map_propagator::FieldIter;
use opentelemetry::global::BoxedTracer;
use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
use opentelemetry::trace::{
    Span, SpanBuilder, SpanContext, SpanId, Status, TraceContextExt, TraceFlags, TraceId, TraceState, Tracer,
};
use opentelemetry::{Context, KeyValue, Value};
use std::borrow::Cow;
use std::collections::HashMap;
use std::time::SystemTime;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::SmtpSettings;
use crate::errors::{SmtpError, SmtpResult};
use crate::transport::{Dialer, MailTransport, TransportFactory};
use crate::types::Message;

/// A message handed to the mock transport.
#[derive(Debug, Clone)]
pub struct SentMessage {
    /// Envelope sender.
    pub from: Option<String>,
    /// Envelope recipients.
    pub to: Vec<String>,
    /// Serialized message.
    pub data: Vec<u8>,
}

impl SentMessage {
    /// Returns the serialized message as text.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

#[derive(Debug, Default)]
struct MockState {
    /// Messages accepted so far.
    sent: Vec<SentMessage>,
    /// Calls made so far, accepted or not.
    calls: usize,
    /// Failures keyed by call index.
    fail_at: HashMap<usize, SmtpError>,
    /// Failures keyed by envelope recipient.
    fail_for: HashMap<String, SmtpError>,
}

/// Mock mail transport for testing.
///
/// Clones share state, so a test can keep a handle while the client owns
/// another.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Creates a new mock transport that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the call with the given zero-based index.
    pub fn fail_message(&self, index: usize, error: SmtpError) -> &Self {
        self.state.lock().unwrap().fail_at.insert(index, error);
        self
    }

    /// Fails the first message addressed to `recipient`.
    pub fn fail_recipient(&self, recipient: impl Into<String>, error: SmtpError) -> &Self {
        self.state.lock().unwrap().fail_for.insert(recipient.into(), error);
        self
    }

    /// Returns the accepted messages in order.
    pub fn sent(&self) -> Vec<SentMessage> {
        self.state.lock().unwrap().sent.clone()
    }

    /// Returns the number of accepted messages.
    pub fn sent_count(&self) -> usize {
        self.state.lock().unwrap().sent.len()
    }

    /// Returns the number of send calls, including failed ones.
    pub fn calls(&self) -> usize {
        self.state.lock().unwrap().calls
    }
}

#[async_trait]
impl MailTransport for MockTransport {
    async fn send_raw(&self, envelope: &Envelope, message: &[u8]) -> SmtpResult<()> {
        let mut state = self.state.lock().unwrap();
        let index = state.calls;
        state.calls += 1;

        let to: Vec<String> = envelope.to().iter().map(|a| a.to_string()).collect();

        if let Some(error) = state.fail_at.remove(&index) {
            return Err(error);
        }
        if let Some(error) = to.iter().find_map(|rcpt| state.fail_for.remove(rcpt)) {
            return Err(error);
        }

        state.sent.push(SentMessage {
            from: envelope.from().map(|a| a.to_string()),
            to,
            data: message.to_vec(),
        });
        Ok(())
    }
}

/// Mock transport factory for testing.
#[derive(Debug, Clone)]
pub struct MockTransportFactory {
    transport: MockTransport,
    opened: Arc<AtomicUsize>,
    dialers: Arc<Mutex<Vec<Dialer>>>,
    error: Arc<Mutex<Option<SmtpError>>>,
}

impl MockTransportFactory {
    /// Creates a factory handing out `transport`.
    pub fn new(transport: MockTransport) -> Self {
        Self {
            transport,
            opened: Arc::new(AtomicUsize::new(0)),
            dialers: Arc::new(Mutex::new(Vec::new())),
            error: Arc::new(Mutex::new(None)),
        }
    }

    /// Creates a factory whose next open fails with `error`.
    pub fn failing(error: SmtpError) -> Self {
        let factory = Self::new(MockTransport::new());
        *factory.error.lock().unwrap() = Some(error);
        factory
    }

    /// Returns the number of transports opened.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Returns the dialers transports were opened for.
    pub fn dialers(&self) -> Vec<Dialer> {
        self.dialers.lock().unwrap().clone()
    }
}

impl TransportFactory for MockTransportFactory {
    fn open(&self, dialer: &Dialer) -> SmtpResult<Arc<dyn MailTransport>> {
        if let Some(error) = self.error.lock().unwrap().take() {
            return Err(error);
        }

        self.opened.fetch_add(1, Ordering::SeqCst);
        self.dialers.lock().unwrap().push(dialer.clone());
        Ok(Arc::new(self.transport.clone()))
    }
}

/// A span captured by [`RecordingTracer`].
#[derive(Debug, Clone)]
pub struct RecordedSpan {
    /// Span name.
    pub name: String,
    /// Identity of the span.
    pub span_context: SpanContext,
    /// Span ID of the parent, if the span had a valid one.
    pub parent_span_id: Option<SpanId>,
    /// Attributes in the order they were set.
    pub attributes: Vec<KeyValue>,
    /// Final status.
    pub status: Status,
    /// Names of the events added, in order.
    pub events: Vec<String>,
    /// Whether the span was ended.
    pub ended: bool,
}

impl RecordedSpan {
    /// Returns the last value set for `key`.
    pub fn attribute(&self, key: &str) -> Option<Value> {
        self.attributes
            .iter()
            .rev()
            .find(|kv| kv.key.as_str() == key)
            .map(|kv| kv.value.clone())
    }
}

/// Tracer that records every span it starts.
#[derive(Debug, Clone, Default)]
pub struct RecordingTracer {
    spans: Arc<Mutex<Vec<RecordedSpan>>>,
}

impl RecordingTracer {
    /// Trace ID given to spans started without a valid parent.
    pub const ROOT_TRACE_ID: u128 = 0x4bf9_2f35_77b3_4da6_a3ce_929d_0e0e_4736;

    /// Creates a new tracer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a boxed handle sharing this tracer's records.
    pub fn boxed(&self) -> BoxedTracer {
        BoxedTracer::new(Box::new(self.clone()))
    }

    /// Returns the spans started so far.
    pub fn spans(&self) -> Vec<RecordedSpan> {
        self.spans.lock().unwrap().clone()
    }
}

impl Tracer for RecordingTracer {
    type Span = RecordingSpan;

    fn build_with_context(&self, builder: SpanBuilder, parent_cx: &Context) -> Self::Span {
        let parent = parent_cx.span().span_context().clone();
        let mut spans = self.spans.lock().unwrap();

        let trace_id = if parent.is_valid() {
            parent.trace_id()
        } else {
            TraceId::from(Self::ROOT_TRACE_ID)
        };
        let span_context = SpanContext::new(
            trace_id,
            SpanId::from(spans.len() as u64 + 1),
            TraceFlags::SAMPLED,
            false,
            TraceState::default(),
        );

        spans.push(RecordedSpan {
            name: builder.name.into_owned(),
            span_context: span_context.clone(),
            parent_span_id: parent.is_valid().then(|| parent.span_id()),
            attributes: Vec::new(),
            status: Status::Unset,
            events: Vec::new(),
            ended: false,
        });

        RecordingSpan {
            index: spans.len() - 1,
            span_context,
            spans: self.spans.clone(),
        }
    }
}

/// Live span handed out by [`RecordingTracer`].
#[derive(Debug)]
pub struct RecordingSpan {
    index: usize,
    span_context: SpanContext,
    spans: Arc<Mutex<Vec<RecordedSpan>>>,
}

impl RecordingSpan {
    fn update(&self, f: impl FnOnce(&mut RecordedSpan)) {
        f(&mut self.spans.lock().unwrap()[self.index]);
    }
}

impl Span for RecordingSpan {
    fn add_event_with_timestamp<T>(&mut self, name: T, _timestamp: SystemTime, _attributes: Vec<KeyValue>)
    where
        T: Into<Cow<'static, str>>,
    {
        let name = name.into().into_owned();
        self.update(|span| span.events.push(name));
    }

    fn span_context(&self) -> &SpanContext {
        &self.span_context
    }

    fn is_recording(&self) -> bool {
        true
    }

    fn set_attribute(&mut self, attribute: KeyValue) {
        self.update(|span| span.attributes.push(attribute));
    }

    fn set_status(&mut self, status: Status) {
        self.update(|span| span.status = status);
    }

    fn update_name<T>(&mut self, new_name: T)
    where
        T: Into<Cow<'static, str>>,
    {
        let name = new_name.into().into_owned();
        self.update(|span| span.name = name);
    }

    fn end_with_timestamp(&mut self, _timestamp: SystemTime) {
        self.update(|span| span.ended = true);
    }
}

/// Trace identifier carried in a [`Context`] for [`TestPropagator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceTag(pub String);

/// Propagator that writes the active span, or else a [`TraceTag`], to the
/// `traceparent` header.
#[derive(Debug)]
pub struct TestPropagator {
    fields: Vec<String>,
}

impl TestPropagator {
    /// Header the propagator writes.
    pub const HEADER: &'static str = "traceparent";

    /// Creates a new propagator.
    pub fn new() -> Self {
        Self {
            fields: vec![Self::HEADER.to_string()],
        }
    }
}

impl Default for TestPropagator {
    fn default() -> Self {
        Self::new()
    }
}

impl TextMapPropagator for TestPropagator {
    fn inject_context(&self, cx: &Context, injector: &mut dyn Injector) {
        let span_context = cx.span().span_context().clone();
        if span_context.is_valid() {
            injector.set(
                Self::HEADER,
                format!("00-{}-{}-01", span_context.trace_id(), span_context.span_id()),
            );
        } else if let Some(tag) = cx.get::<TraceTag>() {
            injector.set(Self::HEADER, tag.0.clone());
        }
    }

    fn extract_with_context(&self, cx: &Context, extractor: &dyn Extractor) -> Context {
        match extractor.get(Self::HEADER) {
            Some(value) => cx.with_value(TraceTag(value.to_string())),
            None => cx.clone(),
        }
    }

    fn fields(&self) -> FieldIter<'_> {
        FieldIter::new(&self.fields)
    }
}

/// Test fixtures.
pub struct TestFixtures;

impl TestFixtures {
    /// Settings pointing at a fake server.
    pub fn settings() -> SmtpSettings {
        Self::settings_builder().build().unwrap()
    }

    /// Settings builder preloaded with a fake server.
    pub fn settings_builder() -> crate::config::SmtpSettingsBuilder {
        SmtpSettings::builder()
            .host("smtp.example.com:587")
            .ehlo_identity("grafana.example.com")
            .content_types(["text/html", "text/plain"])
    }

    /// A simple notification to one recipient.
    pub fn message(to: &str) -> Message {
        Message::builder()
            .from("Grafana <alerts@example.com>")
            .to(to)
            .subject("[FIRING:1] HighCPU")
            .body("text/html", "<p>CPU is high</p>")
            .body("text/plain", "CPU is high")
            .build()
            .unwrap()
    }
}
