use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use rdkafka::message::{Header, Headers, OwnedHeaders};
use rdkafka::Message;

use crate::kafka_producer::ProduceError;

/// Message metadata: ASCII names to raw values. Trace context is written here
/// as UTF-8 strings, see [`crate::propagation`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHeaders(BTreeMap<String, Bytes>);

impl MessageHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Bytes>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Bytes> {
        self.0.get(key)
    }

    /// Values that are not valid UTF-8 read as absent.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .and_then(|value| std::str::from_utf8(value).ok())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_kafka(&self) -> OwnedHeaders {
        self.0.iter().fold(
            OwnedHeaders::new_with_capacity(self.0.len()),
            |headers, (key, value)| {
                headers.insert(Header {
                    key: key.as_str(),
                    value: Some(&value[..]),
                })
            },
        )
    }

    /// Headers without a value are skipped.
    pub fn from_kafka<H: Headers>(headers: &H) -> Self {
        let mut converted = Self::new();
        for header in headers.iter() {
            if let Some(value) = header.value {
                converted.insert(header.key, Bytes::copy_from_slice(value));
            }
        }
        converted
    }
}

/// A message ready to be handed to the send pipeline. Never mutated after
/// submission, and never resubmitted automatically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub headers: MessageHeaders,
}

/// A message delivered on a partition claim. Read-only for the handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Bytes,
    /// Milliseconds since the epoch, when the broker provided one.
    pub timestamp: Option<i64>,
    pub headers: MessageHeaders,
}

impl InboundMessage {
    pub fn from_kafka<M: Message>(message: &M) -> Self {
        Self {
            topic: message.topic().to_owned(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(Bytes::copy_from_slice),
            value: message
                .payload()
                .map(Bytes::copy_from_slice)
                .unwrap_or_default(),
            timestamp: message.timestamp().to_millis(),
            headers: message
                .headers()
                .map(MessageHeaders::from_kafka)
                .unwrap_or_default(),
        }
    }
}

/// Outcome reported by the broker for one submitted message.
#[derive(Debug)]
pub enum AckResult {
    Success {
        partition: i32,
        offset: i64,
        duration: Duration,
    },
    Failure {
        error: ProduceError,
        duration: Duration,
    },
}

impl AckResult {
    pub fn is_success(&self) -> bool {
        matches!(self, AckResult::Success { .. })
    }

    pub fn duration(&self) -> Duration {
        match self {
            AckResult::Success { duration, .. } | AckResult::Failure { duration, .. } => *duration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kafka_headers_keep_every_entry() {
        let mut headers = MessageHeaders::new();
        headers.insert("traceparent", "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01");
        headers.insert("baggage", "user=alice");

        let kafka = headers.to_kafka();
        assert_eq!(kafka.count(), 2);
        assert_eq!(MessageHeaders::from_kafka(&kafka), headers);
    }

    #[test]
    fn non_utf8_values_read_as_absent() {
        let mut headers = MessageHeaders::new();
        headers.insert("binary", Bytes::from_static(&[0xff, 0xfe]));
        assert!(headers.get("binary").is_some());
        assert_eq!(headers.get_str("binary"), None);
    }
}
