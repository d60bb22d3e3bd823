//! Wire-ready messages and their MIME encoding.
//!
//! [`WireMessage`] holds the assembled headers, body parts and files of
//! one outgoing message. [`MimeEncoder`] writes it out in RFC 5322 form:
//! - Header encoding (RFC 2047) and folding
//! - Quoted-printable body parts
//! - `multipart/alternative`, `multipart/related` and `multipart/mixed` nesting
//! - Base64 files streamed in line-sized chunks

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use opentelemetry::Context;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::config::SmtpSettings;
use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};
use crate::propagation;
use crate::types::{Address, AttachedFile, Message};

/// Headers whose values are mailbox lists.
const ADDRESS_HEADERS: &[&str] = &["from", "to", "cc", "bcc", "reply-to", "sender"];

/// Raw bytes per base64 line (76 encoded characters).
const BASE64_LINE_BYTES: usize = 57;

/// Raw bytes per RFC 2047 encoded word (68 characters once encoded).
const ENCODED_WORD_BYTES: usize = 42;

/// One body representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyPart {
    /// Content type label (e.g. `text/plain`).
    pub content_type: String,
    /// Body text.
    pub content: String,
}

/// Protocol-ready message.
#[derive(Debug, Clone)]
pub struct WireMessage {
    /// Header names with their values, in insertion order.
    headers: Vec<(String, Vec<String>)>,
    /// Primary body followed by alternatives.
    parts: Vec<BodyPart>,
    /// Files embedded inline.
    embedded: Vec<PathBuf>,
    /// Files attached from memory.
    attachments: Vec<AttachedFile>,
    /// Domain used for generated Message-IDs.
    domain: String,
}

impl WireMessage {
    /// Creates an empty message; `domain` is used for generated Message-IDs.
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            headers: Vec::new(),
            parts: Vec::new(),
            embedded: Vec::new(),
            attachments: Vec::new(),
            domain: domain.into(),
        }
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.headers
            .iter()
            .position(|(existing, _)| existing.eq_ignore_ascii_case(name))
    }

    /// Sets a header, replacing any existing values.
    pub fn set_header<I, S>(&mut self, name: &str, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values: Vec<String> = values.into_iter().map(Into::into).collect();
        match self.position(name) {
            Some(idx) => self.headers[idx].1 = values,
            None => self.headers.push((name.to_string(), values)),
        }
    }

    /// Appends one value to a header, keeping existing values.
    pub fn add_header_value(&mut self, name: &str, value: impl Into<String>) {
        match self.position(name) {
            Some(idx) => self.headers[idx].1.push(value.into()),
            None => self.headers.push((name.to_string(), vec![value.into()])),
        }
    }

    /// Returns the values of a header; empty if absent.
    pub fn header(&self, name: &str) -> &[String] {
        self.position(name)
            .map(|idx| self.headers[idx].1.as_slice())
            .unwrap_or(&[])
    }

    /// Returns true if the header is present.
    pub fn has_header(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Returns the names of the headers stored on the message.
    ///
    /// Headers generated while writing (Date, Message-ID, MIME-Version,
    /// Content-Type) are not included.
    pub fn header_names(&self) -> impl Iterator<Item = &str> {
        self.headers.iter().map(|(name, _)| name.as_str())
    }

    /// Sets the primary body, dropping any previous parts.
    pub fn set_body(&mut self, content_type: impl Into<String>, content: impl Into<String>) {
        self.parts.clear();
        self.parts.push(BodyPart {
            content_type: content_type.into(),
            content: content.into(),
        });
    }

    /// Adds an alternative representation after the existing parts.
    pub fn add_alternative(&mut self, content_type: impl Into<String>, content: impl Into<String>) {
        self.parts.push(BodyPart {
            content_type: content_type.into(),
            content: content.into(),
        });
    }

    /// Returns the primary body part.
    pub fn body(&self) -> Option<&BodyPart> {
        self.parts.first()
    }

    /// Returns the alternatives, in declaration order.
    pub fn alternatives(&self) -> &[BodyPart] {
        self.parts.get(1..).unwrap_or(&[])
    }

    /// Embeds a file inline.
    pub fn embed(&mut self, path: impl Into<PathBuf>) {
        self.embedded.push(path.into());
    }

    /// Returns the embedded file paths.
    pub fn embedded(&self) -> &[PathBuf] {
        &self.embedded
    }

    /// Attaches a file from memory.
    pub fn attach(&mut self, file: AttachedFile) {
        self.attachments.push(file);
    }

    /// Returns the attached files.
    pub fn attachments(&self) -> &[AttachedFile] {
        &self.attachments
    }

    /// Writes the message in RFC 5322 form.
    pub fn write_to<W: Write>(&self, out: &mut W) -> SmtpResult<()> {
        MimeEncoder::new(&self.domain).encode(self, out)
    }

    /// Encodes the message into a buffer.
    pub fn to_bytes(&self) -> SmtpResult<Vec<u8>> {
        let mut buf = Vec::new();
        self.write_to(&mut buf)?;
        Ok(buf)
    }
}

/// Assembles the wire form of a notification.
///
/// Static headers are applied first so that From, To and Subject from the
/// message win over a static header of the same name. When tracing is
/// enabled, `cx` is injected through the globally installed propagator.
/// The least-preferred configured content type becomes the primary body;
/// the others follow as alternatives, ending with the most preferred.
///
/// Nothing is read from disk here; embedded files are streamed when the
/// message is written.
pub fn build_wire_message(settings: &SmtpSettings, message: &Message, cx: &Context) -> WireMessage {
    let mut wire = WireMessage::new(settings.local_name());

    for (name, value) in &settings.static_headers {
        wire.set_header(name, [value.as_str()]);
    }

    wire.set_header("From", [message.from.as_str()]);
    wire.set_header("To", message.to.iter().map(String::as_str));
    wire.set_header("Subject", [message.subject.as_str()]);

    if settings.enable_tracing {
        propagation::inject_context(cx, &mut wire);
    }

    for path in &message.embedded_files {
        wire.embed(path.clone());
    }
    for file in &message.attached_files {
        wire.attach(file.clone());
    }

    for address in &message.reply_to {
        wire.add_header_value("Reply-To", address.as_str());
    }

    let mut content_types = settings.content_types.iter().rev();
    if let Some(primary) = content_types.next() {
        wire.set_body(primary.as_str(), message.body_for(primary));
        for content_type in content_types {
            wire.add_alternative(content_type.as_str(), message.body_for(content_type));
        }
    }

    wire
}

/// MIME encoder for wire messages.
pub struct MimeEncoder {
    /// Date for the message.
    date: DateTime<Utc>,
    /// Domain for message IDs.
    domain: String,
}

impl MimeEncoder {
    /// Creates a new encoder.
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            date: Utc::now(),
            domain: domain.into(),
        }
    }

    /// Encodes a message.
    pub fn encode<W: Write>(&self, message: &WireMessage, out: &mut W) -> SmtpResult<()> {
        if !message.has_header("MIME-Version") {
            self.write_header(out, "MIME-Version", "1.0")?;
        }
        if !message.has_header("Date") {
            self.write_header(out, "Date", &self.format_date())?;
        }
        if !message.has_header("Message-ID") {
            self.write_header(out, "Message-ID", &format!("<{}>", self.generate_message_id()))?;
        }

        for (name, values) in &message.headers {
            let is_address = ADDRESS_HEADERS.contains(&name.to_ascii_lowercase().as_str());
            let encoded: Vec<String> = values
                .iter()
                .map(|v| if is_address { self.encode_address(v) } else { self.encode_header(v) })
                .collect();
            self.write_header(out, name, &encoded.join(", "))?;
        }

        if message.attachments.is_empty() {
            self.write_related(out, message)
        } else {
            let boundary = self.generate_boundary();
            self.write_header(out, "Content-Type", &format!("multipart/mixed; boundary=\"{}\"", boundary))?;
            out.write_all(b"\r\n")?;

            write!(out, "--{}\r\n", boundary)?;
            self.write_related(out, message)?;

            for attachment in &message.attachments {
                write!(out, "\r\n--{}\r\n", boundary)?;
                self.write_attachment(out, attachment)?;
            }

            write!(out, "\r\n--{}--\r\n", boundary)?;
            Ok(())
        }
    }

    /// Writes the body with inline files (multipart/related when any).
    fn write_related<W: Write>(&self, out: &mut W, message: &WireMessage) -> SmtpResult<()> {
        if message.embedded.is_empty() {
            return self.write_alternative(out, &message.parts);
        }

        let boundary = self.generate_boundary();
        self.write_header(out, "Content-Type", &format!("multipart/related; boundary=\"{}\"", boundary))?;
        out.write_all(b"\r\n")?;

        write!(out, "--{}\r\n", boundary)?;
        self.write_alternative(out, &message.parts)?;

        for path in &message.embedded {
            write!(out, "\r\n--{}\r\n", boundary)?;
            self.write_embedded(out, path)?;
        }

        write!(out, "\r\n--{}--\r\n", boundary)?;
        Ok(())
    }

    /// Writes the body parts (multipart/alternative when more than one).
    fn write_alternative<W: Write>(&self, out: &mut W, parts: &[BodyPart]) -> SmtpResult<()> {
        match parts {
            [] => self.write_part(out, "text/plain", ""),
            [single] => self.write_part(out, &single.content_type, &single.content),
            _ => {
                let boundary = self.generate_boundary();
                self.write_header(out, "Content-Type", &format!("multipart/alternative; boundary=\"{}\"", boundary))?;
                out.write_all(b"\r\n")?;

                for part in parts {
                    write!(out, "--{}\r\n", boundary)?;
                    self.write_part(out, &part.content_type, &part.content)?;
                    out.write_all(b"\r\n")?;
                }

                write!(out, "--{}--\r\n", boundary)?;
                Ok(())
            }
        }
    }

    /// Writes a single quoted-printable part.
    fn write_part<W: Write>(&self, out: &mut W, content_type: &str, content: &str) -> SmtpResult<()> {
        let content_type = if content_type.starts_with("text/") && !content_type.contains("charset") {
            format!("{}; charset=UTF-8", content_type)
        } else {
            content_type.to_string()
        };
        self.write_header(out, "Content-Type", &content_type)?;
        self.write_header(out, "Content-Transfer-Encoding", "quoted-printable")?;
        out.write_all(b"\r\n")?;
        out.write_all(&quoted_printable::encode(content.as_bytes()))?;
        Ok(())
    }

    /// Writes an inline file, streaming it from disk.
    fn write_embedded<W: Write>(&self, out: &mut W, path: &Path) -> SmtpResult<()> {
        let file = File::open(path).map_err(|e| {
            SmtpError::new(
                SmtpErrorKind::AttachmentError,
                format!("could not open embedded file {}: {}", path.display(), e),
            )
            .with_cause(e)
        })?;

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let content_type = mime_guess::from_path(path).first_or_octet_stream();
        let encoded_name = self.encode_header(&name);

        self.write_header(out, "Content-Type", &format!("{}; name=\"{}\"", content_type, encoded_name))?;
        self.write_header(out, "Content-Transfer-Encoding", "base64")?;
        self.write_header(out, "Content-Disposition", &format!("inline; filename=\"{}\"", encoded_name))?;
        self.write_header(out, "Content-ID", &format!("<{}>", encoded_name))?;
        out.write_all(b"\r\n")?;

        write_base64_lines(BufReader::new(file), out).map_err(|e| {
            SmtpError::new(
                SmtpErrorKind::AttachmentError,
                format!("could not read embedded file {}: {}", path.display(), e),
            )
            .with_cause(e)
        })
    }

    /// Writes an attachment, streaming it from the in-memory buffer.
    fn write_attachment<W: Write>(&self, out: &mut W, attachment: &AttachedFile) -> SmtpResult<()> {
        let content_type = mime_guess::from_path(&attachment.name).first_or_octet_stream();
        let encoded_name = self.encode_header(&attachment.name);

        self.write_header(out, "Content-Type", &format!("{}; name=\"{}\"", content_type, encoded_name))?;
        self.write_header(out, "Content-Transfer-Encoding", "base64")?;
        self.write_header(out, "Content-Disposition", &format!("attachment; filename=\"{}\"", encoded_name))?;
        out.write_all(b"\r\n")?;

        write_base64_lines(attachment.content.as_slice(), out)?;
        Ok(())
    }

    /// Writes a header line.
    fn write_header<W: Write>(&self, out: &mut W, name: &str, value: &str) -> SmtpResult<()> {
        if name.is_empty() || name.chars().any(|c| c.is_control() || c == ':' || c == ' ' || !c.is_ascii()) {
            return Err(SmtpError::encoding(format!("Invalid header name: {:?}", name)));
        }

        let header = format!("{}: {}", name, value);
        out.write_all(self.fold_header(&header).as_bytes())?;
        out.write_all(b"\r\n")?;
        Ok(())
    }

    /// Folds a header line at 78 characters.
    ///
    /// The header name always shares its line with the first value word.
    fn fold_header(&self, header: &str) -> String {
        if header.len() <= 78 {
            return header.to_string();
        }

        let mut result = String::new();
        let mut words = header.split(' ');
        let mut current_line = words.next().unwrap_or_default().to_string();
        if let Some(first) = words.next() {
            current_line.push(' ');
            current_line.push_str(first);
        }

        for word in words {
            if current_line.len() + 1 + word.len() <= 76 {
                current_line.push(' ');
                current_line.push_str(word);
            } else {
                result.push_str(&current_line);
                result.push_str("\r\n ");
                current_line = word.to_string();
            }
        }

        result.push_str(&current_line);
        result
    }

    /// Encodes a header value using RFC 2047 when it is not plain ASCII.
    ///
    /// Long values become several encoded words, each split on a character
    /// boundary so it decodes on its own.
    fn encode_header(&self, value: &str) -> String {
        if value.chars().all(|c| c.is_ascii() && !c.is_control()) {
            return value.to_string();
        }

        let mut words = Vec::new();
        let mut start = 0;
        for (idx, ch) in value.char_indices() {
            if idx + ch.len_utf8() - start > ENCODED_WORD_BYTES {
                words.push(&value[start..idx]);
                start = idx;
            }
        }
        words.push(&value[start..]);

        words
            .iter()
            .map(|word| format!("=?UTF-8?B?{}?=", BASE64.encode(word.as_bytes())))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Encodes a mailbox, keeping the address part readable.
    fn encode_address(&self, value: &str) -> String {
        match Address::parse(value) {
            Ok(Address { name: Some(name), email }) => {
                let needs_quotes = name.contains(|c: char| c.is_ascii() && !c.is_alphanumeric() && c != ' ');
                if !name.is_ascii() || name.chars().any(char::is_control) {
                    format!("{} <{}>", self.encode_header(&name), email)
                } else if needs_quotes {
                    let quoted = name.replace('\\', "\\\\").replace('"', "\\\"");
                    format!("\"{}\" <{}>", quoted, email)
                } else {
                    format!("{} <{}>", name, email)
                }
            }
            Ok(Address { name: None, email }) => email,
            // Unparseable input is encoded whole.
            Err(_) => self.encode_header(value),
        }
    }

    /// Generates a unique message ID.
    fn generate_message_id(&self) -> String {
        format!("{}.{}@{}", Uuid::new_v4(), self.date.timestamp(), self.domain)
    }

    /// Generates a unique boundary.
    fn generate_boundary(&self) -> String {
        format!("----=_Part_{}", Uuid::new_v4().simple())
    }

    /// Formats the date for the Date header.
    fn format_date(&self) -> String {
        self.date.format("%a, %d %b %Y %H:%M:%S %z").to_string()
    }
}

impl Default for MimeEncoder {
    fn default() -> Self {
        Self::new("localhost")
    }
}

/// Base64-encodes `reader` into `out`, one CRLF-terminated line at a time.
fn write_base64_lines<R: Read, W: Write>(mut reader: R, out: &mut W) -> io::Result<()> {
    let mut buf = [0u8; BASE64_LINE_BYTES * 64];
    loop {
        let filled = fill(&mut reader, &mut buf)?;
        for line in buf[..filled].chunks(BASE64_LINE_BYTES) {
            out.write_all(BASE64.encode(line).as_bytes())?;
            out.write_all(b"\r\n")?;
        }
        if filled < buf.len() {
            return Ok(());
        }
    }
}

/// Reads until `buf` is full or the reader is exhausted.
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
