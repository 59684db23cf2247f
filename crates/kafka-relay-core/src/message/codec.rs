//! Text wire format for relay messages.
//!
//! A default message renders as
//!
//! ```text
//! Message #42 from PaymeTv at 2026-02-27T12:34:56.789Z
//! ```
//!
//! and a message with custom text appends `": "` and the text verbatim:
//!
//! ```text
//! Message #42 from PaymeTv at 2026-02-27T12:34:56.789Z: order created
//! ```

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;

use crate::error::{CodecError, CodecResult};

use super::Message;

/// Extra check applied to every decoded message.
///
/// Returning `Err(reason)` rejects the record as malformed.
pub type Validator = Arc<dyn Fn(&Message) -> Result<(), String> + Send + Sync>;

/// Separator between the fixed prefix and custom text.
const TEXT_SEPARATOR: &str = ": ";

/// Encoder/decoder for the relay wire format.
#[derive(Clone)]
pub struct MessageCodec {
    source: String,
    pattern: Regex,
    validators: Vec<Validator>,
}

impl MessageCodec {
    /// Create a codec for messages produced by `source`.
    #[must_use]
    pub fn new(source: impl Into<String>) -> Self {
        let source = source.into();
        let pattern = Regex::new(&format!(
            r"(?s)^Message #(\d+) from {} at (\d{{4}}-\d{{2}}-\d{{2}}T\d{{2}}:\d{{2}}:\d{{2}}\.\d{{3}}Z)(?:{}(.*))?$",
            regex::escape(&source),
            regex::escape(TEXT_SEPARATOR),
        ))
        .expect("valid regex");

        Self {
            source,
            pattern,
            validators: Vec::new(),
        }
    }

    /// Register a validator run after structural decoding succeeds.
    #[must_use]
    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Message) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validators.push(Arc::new(validator));
        self
    }

    /// Source name rendered into every message.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Render a message to its wire bytes.
    #[must_use]
    pub fn encode(&self, sequence: u64, produced_at: DateTime<Utc>, text: &str) -> Bytes {
        let timestamp = produced_at.to_rfc3339_opts(SecondsFormat::Millis, true);
        let mut rendered = format!(
            "Message #{sequence} from {} at {timestamp}",
            self.source
        );
        if !text.is_empty() {
            rendered.push_str(TEXT_SEPARATOR);
            rendered.push_str(text);
        }
        Bytes::from(rendered)
    }

    /// Render an existing [`Message`].
    #[must_use]
    pub fn encode_message(&self, message: &Message) -> Bytes {
        self.encode(message.sequence(), message.produced_at(), message.payload())
    }

    /// Parse wire bytes back into a [`Message`].
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::MalformedMessage`] if the bytes are not UTF-8,
    /// do not match the wire format, carry a zero or overflowing sequence,
    /// carry an impossible timestamp, or fail a registered validator.
    pub fn decode(&self, bytes: &[u8]) -> CodecResult<Message> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| CodecError::malformed(format!("payload is not UTF-8: {e}")))?;

        let caps = self
            .pattern
            .captures(text)
            .ok_or_else(|| CodecError::malformed(format!("unexpected format: {}", preview(text))))?;

        let sequence: u64 = caps[1]
            .parse()
            .map_err(|_| CodecError::malformed(format!("sequence out of range: {}", &caps[1])))?;
        if sequence == 0 {
            return Err(CodecError::malformed("sequence must start at 1"));
        }

        let produced_at = DateTime::parse_from_rfc3339(&caps[2])
            .map_err(|e| CodecError::malformed(format!("invalid timestamp {}: {e}", &caps[2])))?
            .with_timezone(&Utc);

        let payload = caps.get(3).map_or("", |m| m.as_str());
        let message = Message::new(sequence, produced_at, payload);

        for validator in &self.validators {
            validator(&message).map_err(CodecError::malformed)?;
        }

        Ok(message)
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new("PaymeTv")
    }
}

impl fmt::Debug for MessageCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageCodec")
            .field("source", &self.source)
            .field("validators", &self.validators.len())
            .finish()
    }
}

/// First characters of a rejected payload, for log lines.
fn preview(text: &str) -> String {
    const MAX: usize = 64;
    match text.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
