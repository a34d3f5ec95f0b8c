//! Dead-letter records and their header encoding.
//!
//! A dead-lettered message keeps its original payload bytes untouched. Why it
//! was isolated travels next to it as `x-dlq-*` headers, so an operator can
//! inspect the topic with any Kafka tool.

use crate::event_bus::{Delivery, DeliveryPosition, OutboundRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Header carrying the [`DeadLetterReason`].
pub const HEADER_REASON: &str = "x-dlq-reason";
/// Header carrying the human-readable detail.
pub const HEADER_DETAIL: &str = "x-dlq-detail";
/// Header carrying the RFC 3339 time the message was first isolated.
pub const HEADER_FIRST_SEEN_AT: &str = "x-dlq-first-seen-at";
/// Header carrying the source topic.
pub const HEADER_SOURCE_TOPIC: &str = "x-dlq-source-topic";
/// Header carrying the source partition.
pub const HEADER_SOURCE_PARTITION: &str = "x-dlq-source-partition";
/// Header carrying the source offset.
pub const HEADER_SOURCE_OFFSET: &str = "x-dlq-source-offset";

/// Why a message was dead-lettered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// Field present with wrong type or value
    SchemaViolation,
    /// Required field absent
    MissingField,
    /// Not JSON, or unprocessable after repeated delivery attempts
    Unparseable,
}

impl DeadLetterReason {
    /// Stable tag.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::SchemaViolation => "schema_violation",
            Self::MissingField => "missing_field",
            Self::Unparseable => "unparseable",
        }
    }

    /// Parse a tag.
    #[must_use]
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "schema_violation" => Some(Self::SchemaViolation),
            "missing_field" => Some(Self::MissingField),
            "unparseable" => Some(Self::Unparseable),
            _ => None,
        }
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A poison message and why it was isolated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeadLetterRecord {
    /// Original payload, byte for byte
    pub original: Vec<u8>,
    /// Original partitioning key
    pub key: Option<String>,
    /// Classification
    pub reason: DeadLetterReason,
    /// Human-readable explanation
    pub detail: String,
    /// When the router first saw it
    pub first_seen_at: DateTime<Utc>,
    /// Where it was read from
    pub source: DeliveryPosition,
}

/// A DLQ message whose headers could not be decoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterDecodeError {
    /// A required header is missing
    #[error("Missing dead-letter header '{0}'")]
    MissingHeader(&'static str),

    /// A header is present but malformed
    #[error("Malformed dead-letter header '{header}': {value}")]
    MalformedHeader {
        /// Header name
        header: &'static str,
        /// Offending value
        value: String,
    },
}

impl DeadLetterRecord {
    /// Build a record for a delivery.
    #[must_use]
    pub fn for_delivery(
        delivery: &Delivery,
        reason: DeadLetterReason,
        detail: impl Into<String>,
        first_seen_at: DateTime<Utc>,
    ) -> Self {
        Self {
            original: delivery.payload.clone(),
            key: delivery.key.clone(),
            reason,
            detail: detail.into(),
            first_seen_at,
            source: delivery.position.clone(),
        }
    }

    /// Encode as a record for the dead-letter topic.
    #[must_use]
    pub fn to_outbound(&self, dlq_topic: &str) -> OutboundRecord {
        let mut record = OutboundRecord::new(dlq_topic, self.original.clone())
            .with_header(HEADER_REASON, self.reason.as_str())
            .with_header(HEADER_DETAIL, self.detail.clone())
            .with_header(HEADER_FIRST_SEEN_AT, self.first_seen_at.to_rfc3339())
            .with_header(HEADER_SOURCE_TOPIC, self.source.topic.clone())
            .with_header(HEADER_SOURCE_PARTITION, self.source.partition.to_string())
            .with_header(HEADER_SOURCE_OFFSET, self.source.offset.to_string());
        if let Some(key) = &self.key {
            record = record.with_key(key.clone());
        }
        record
    }

    /// Decode a message read back from the dead-letter topic.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterDecodeError`] if any `x-dlq-*` header is missing or
    /// malformed.
    pub fn from_delivery(delivery: &Delivery) -> Result<Self, DeadLetterDecodeError> {
        let header = |name: &'static str| {
            delivery
                .headers
                .get(name)
                .ok_or(DeadLetterDecodeError::MissingHeader(name))
        };
        let malformed = |header: &'static str, value: &str| DeadLetterDecodeError::MalformedHeader {
            header,
            value: value.to_string(),
        };

        let reason_tag = header(HEADER_REASON)?;
        let reason = DeadLetterReason::parse(reason_tag)
            .ok_or_else(|| malformed(HEADER_REASON, reason_tag))?;
        let seen = header(HEADER_FIRST_SEEN_AT)?;
        let first_seen_at = DateTime::parse_from_rfc3339(seen)
            .map_err(|_| malformed(HEADER_FIRST_SEEN_AT, seen))?
            .with_timezone(&Utc);
        let partition = header(HEADER_SOURCE_PARTITION)?;
        let offset = header(HEADER_SOURCE_OFFSET)?;

        Ok(Self {
            original: delivery.payload.clone(),
            key: delivery.key.clone(),
            reason,
            detail: header(HEADER_DETAIL)?.clone(),
            first_seen_at,
            source: DeliveryPosition {
                topic: header(HEADER_SOURCE_TOPIC)?.clone(),
                partition: partition
                    .parse()
                    .map_err(|_| malformed(HEADER_SOURCE_PARTITION, partition))?,
                offset: offset
                    .parse()
                    .map_err(|_| malformed(HEADER_SOURCE_OFFSET, offset))?,
            },
        })
    }
}
