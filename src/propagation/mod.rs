//! Trace context propagation through message headers.
//!
//! A [`WireHeaderCarrier`] exposes a [`WireMessage`]'s headers as a text
//! map so an `opentelemetry` propagator can write the current trace
//! context into the outgoing message (and read it back).

use opentelemetry::global;
use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
use opentelemetry::Context;

use crate::mime::WireMessage;

/// Key/value view over a message's headers.
pub trait HeaderCarrier {
    /// Returns the first value of the header, or an empty string.
    fn get(&self, key: &str) -> String;

    /// Sets the header, replacing any existing values.
    fn set(&mut self, key: &str, value: String);

    /// Returns every header name present on the serialized message.
    fn keys(&self) -> Vec<String>;
}

/// Carrier over the headers of a [`WireMessage`].
#[derive(Debug)]
pub struct WireHeaderCarrier<'a> {
    message: &'a mut WireMessage,
}

impl<'a> WireHeaderCarrier<'a> {
    /// Wraps a message.
    pub fn new(message: &'a mut WireMessage) -> Self {
        Self { message }
    }
}

impl HeaderCarrier for WireHeaderCarrier<'_> {
    fn get(&self, key: &str) -> String {
        self.message.header(key).first().cloned().unwrap_or_default()
    }

    fn set(&mut self, key: &str, value: String) {
        self.message.set_header(key, [value]);
    }

    /// Serializes the whole message and re-parses its header block.
    ///
    /// This picks up headers that only exist in the written form (Date,
    /// Message-ID, MIME-Version, Content-Type) and reads embedded files
    /// from disk, so it is not meant for hot paths.
    fn keys(&self) -> Vec<String> {
        let mut buf = Vec::new();
        // A failed write still leaves the header block in `buf`.
        let _ = self.message.write_to(&mut buf);

        match mailparse::parse_headers(&buf) {
            Ok((headers, _)) => {
                let mut keys: Vec<String> = Vec::with_capacity(headers.len());
                for header in headers {
                    let key = header.get_key();
                    if !keys.iter().any(|k| k.eq_ignore_ascii_case(&key)) {
                        keys.push(key);
                    }
                }
                keys
            }
            Err(_) => self.message.header_names().map(str::to_string).collect(),
        }
    }
}

impl Injector for WireHeaderCarrier<'_> {
    fn set(&mut self, key: &str, value: String) {
        HeaderCarrier::set(self, key, value);
    }
}

impl Extractor for WireHeaderCarrier<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.message.header(key).first().map(String::as_str)
    }

    /// Names held in the header store; see [`HeaderCarrier::keys`] for the
    /// full wire set.
    fn keys(&self) -> Vec<&str> {
        self.message.header_names().collect()
    }
}

/// Injects `cx` into the message headers using the global propagator.
pub fn inject_context(cx: &Context, message: &mut WireMessage) {
    let mut carrier = WireHeaderCarrier::new(message);
    global::get_text_map_propagator(|propagator| propagator.inject_context(cx, &mut carrier));
}

/// Injects `cx` into the message headers using `propagator`.
pub fn inject_with(propagator: &dyn TextMapPropagator, cx: &Context, message: &mut WireMessage) {
    let mut carrier = WireHeaderCarrier::new(message);
    propagator.inject_context(cx, &mut carrier);
}
