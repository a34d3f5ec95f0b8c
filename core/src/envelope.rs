//! Event envelopes and the validator that guards business logic.
//!
//! Every message that flows through the fulfillment topics is JSON. Before any
//! consumer acts on a message it passes through [`validate`], which either
//! yields a typed [`Envelope`] or a classified [`ValidationError`]. Nothing that
//! fails validation ever reaches reservation or aggregation code.
//!
//! # Wire Format
//!
//! Inbound orders (`order.placed`):
//!
//! ```json
//! {"order_id": "o1", "item": "burger", "qty": 2, "student_id": "s123"}
//! ```
//!
//! `event_type` may be omitted on inbound orders and defaults to `OrderPlaced`.
//! `item_id` is accepted as an alias of `item`, and `event_time` / `timestamp`
//! as aliases of `published_at`.
//!
//! Outcome events (`inventory.reserved`, `inventory.failed`):
//!
//! ```json
//! {"event_type": "InventoryReserved", "order_id": "o1", "item": "burger",
//!  "qty": 2, "outcome": "reserved", "timestamp": "2025-01-01T00:00:00Z"}
//! ```
//!
//! # Determinism
//!
//! [`validate`] is a pure function of its input bytes. The reservation consumer
//! and the analytics replay path must reach the same verdict for the same bytes.

use crate::dead_letter::DeadLetterReason;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// The kind of event carried by an envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventType {
    /// An order was accepted by order intake.
    OrderPlaced,
    /// Stock was reserved for an order.
    InventoryReserved,
    /// Stock could not be reserved for an order.
    InventoryFailed,
}

impl EventType {
    /// Stable wire name of the event type.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::OrderPlaced => "OrderPlaced",
            Self::InventoryReserved => "InventoryReserved",
            Self::InventoryFailed => "InventoryFailed",
        }
    }

    /// Parse a wire name. Returns `None` for unknown names.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "OrderPlaced" => Some(Self::OrderPlaced),
            "InventoryReserved" => Some(Self::InventoryReserved),
            "InventoryFailed" => Some(Self::InventoryFailed),
            _ => None,
        }
    }

    /// The reservation outcome this event type reports, if it is an outcome event.
    #[must_use]
    pub const fn outcome(&self) -> Option<Outcome> {
        match self {
            Self::OrderPlaced => None,
            Self::InventoryReserved => Some(Outcome::Reserved),
            Self::InventoryFailed => Some(Outcome::Failed),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Business key of an order.
///
/// Not globally unique across retries: the same order may be published more
/// than once, which is exactly what the idempotency ledger guards against.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(String);

impl OrderId {
    /// Wrap a raw order id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of applying reservation rules to an order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// Stock was decremented.
    Reserved,
    /// Stock was left untouched.
    Failed,
}

impl Outcome {
    /// Stable storage name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Reserved => "reserved",
            Self::Failed => "failed",
        }
    }

    /// Parse a storage name.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "reserved" => Some(Self::Reserved),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// The event type announcing this outcome.
    #[must_use]
    pub const fn event_type(&self) -> EventType {
        match self {
            Self::Reserved => EventType::InventoryReserved,
            Self::Failed => EventType::InventoryFailed,
        }
    }
}

/// Why a reservation failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The item exists but not enough units are available.
    OutOfStock,
    /// The item has no stock entry at all.
    UnknownItem,
    /// Forced failure from fault-injection configuration.
    ForcedFailure,
}

impl FailureReason {
    /// Stable storage name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::OutOfStock => "out_of_stock",
            Self::UnknownItem => "unknown_item",
            Self::ForcedFailure => "forced_failure",
        }
    }

    /// Parse a storage name.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "out_of_stock" => Some(Self::OutOfStock),
            "unknown_item" => Some(Self::UnknownItem),
            "forced_failure" => Some(Self::ForcedFailure),
            _ => None,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order fields shared by every event type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrderPayload {
    /// Item being ordered.
    pub item: String,
    /// Units requested, always positive.
    pub quantity: u32,
    /// Who placed the order (`student_id` on the wire).
    pub requester_id: Option<String>,
}

/// Fields only outcome events carry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutcomeDetails {
    /// Outcome reported by the event.
    pub outcome: Outcome,
    /// Failure reason for `InventoryFailed`.
    pub reason: Option<FailureReason>,
    /// When the originating order was published, if it said.
    pub placed_at: Option<DateTime<Utc>>,
}

/// A structurally valid event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    /// Declared event type.
    pub event_type: EventType,
    /// Business key.
    pub order_id: OrderId,
    /// Order fields.
    pub payload: OrderPayload,
    /// Publication time carried by the message itself.
    pub published_at: Option<DateTime<Utc>>,
    /// Present exactly when `event_type` is an outcome type.
    pub outcome: Option<OutcomeDetails>,
}

/// Classified validation failure. Permanent: never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The bytes are not a JSON object.
    #[error("Unparseable message: {0}")]
    Unparseable(String),

    /// A required field is absent, null, or empty.
    #[error("Missing required field '{0}'")]
    MissingField(&'static str),

    /// A field is present but has the wrong type or an invalid value.
    #[error("Schema violation on field '{field}': {reason}")]
    SchemaViolation {
        /// Offending field
        field: &'static str,
        /// What was wrong with it
        reason: String,
    },
}

impl ValidationError {
    /// Dead-letter reason tag for this error.
    #[must_use]
    pub const fn dead_letter_reason(&self) -> DeadLetterReason {
        match self {
            Self::Unparseable(_) => DeadLetterReason::Unparseable,
            Self::MissingField(_) => DeadLetterReason::MissingField,
            Self::SchemaViolation { .. } => DeadLetterReason::SchemaViolation,
        }
    }
}

/// Parse and structurally validate raw message bytes.
///
/// # Errors
///
/// - [`ValidationError::Unparseable`] if the bytes are not a JSON object
/// - [`ValidationError::MissingField`] if `order_id`, `item` or `qty` (or
///   `outcome` on outcome events) is absent, null or empty
/// - [`ValidationError::SchemaViolation`] for unknown event types, wrong
///   primitive types, non-positive quantities and malformed timestamps
///
/// # Example
///
/// ```
/// use fulfillment_core::envelope::{validate, EventType, ValidationError};
///
/// let envelope = validate(br#"{"order_id":"o1","item":"burger","qty":2}"#).unwrap();
/// assert_eq!(envelope.event_type, EventType::OrderPlaced);
/// assert_eq!(envelope.payload.quantity, 2);
///
/// let err = validate(br#"{"order_id":"o1","item":"burger"}"#).unwrap_err();
/// assert_eq!(err, ValidationError::MissingField("qty"));
/// ```
pub fn validate(raw: &[u8]) -> Result<Envelope, ValidationError> {
    let value: Value =
        serde_json::from_slice(raw).map_err(|e| ValidationError::Unparseable(e.to_string()))?;
    let Value::Object(fields) = value else {
        return Err(ValidationError::Unparseable(format!(
            "expected a JSON object, found {}",
            kind_of(&value)
        )));
    };

    let event_type = match fields.get("event_type") {
        None | Some(Value::Null) => EventType::OrderPlaced,
        Some(Value::String(name)) => {
            EventType::parse(name).ok_or_else(|| ValidationError::SchemaViolation {
                field: "event_type",
                reason: format!("unknown event type '{name}'"),
            })?
        },
        Some(other) => {
            return Err(type_mismatch("event_type", "a string", other));
        },
    };

    let order_id = OrderId::new(required_string(&fields, "order_id", &[])?);
    let item = required_string(&fields, "item", &["item_id"])?;
    let quantity = required_quantity(&fields)?;
    let requester_id = optional_string(&fields, "student_id", &["requester_id"])?;
    let published_at = optional_timestamp(&fields, "published_at", &["event_time", "timestamp"])?;

    let outcome = match event_type.outcome() {
        None => None,
        Some(expected) => Some(outcome_details(&fields, event_type, expected)?),
    };

    Ok(Envelope {
        event_type,
        order_id,
        payload: OrderPayload {
            item,
            quantity,
            requester_id,
        },
        published_at,
        outcome,
    })
}

fn outcome_details(
    fields: &Map<String, Value>,
    event_type: EventType,
    expected: Outcome,
) -> Result<OutcomeDetails, ValidationError> {
    let raw = required_string(fields, "outcome", &["status"])?;
    let outcome = Outcome::parse(&raw.to_ascii_lowercase()).ok_or_else(|| {
        ValidationError::SchemaViolation {
            field: "outcome",
            reason: format!("unknown outcome '{raw}'"),
        }
    })?;
    if outcome != expected {
        return Err(ValidationError::SchemaViolation {
            field: "outcome",
            reason: format!("{event_type} cannot carry outcome '{}'", outcome.as_str()),
        });
    }

    let reason = match optional_string(fields, "reason", &[])? {
        None => None,
        Some(name) => Some(FailureReason::parse(&name).ok_or_else(|| {
            ValidationError::SchemaViolation {
                field: "reason",
                reason: format!("unknown failure reason '{name}'"),
            }
        })?),
    };

    Ok(OutcomeDetails {
        outcome,
        reason,
        placed_at: optional_timestamp(fields, "placed_at", &[])?,
    })
}

/// First non-null value among `name` and its aliases.
fn lookup<'a>(
    fields: &'a Map<String, Value>,
    name: &'static str,
    aliases: &[&'static str],
) -> Option<&'a Value> {
    std::iter::once(name)
        .chain(aliases.iter().copied())
        .filter_map(|key| fields.get(key))
        .find(|value| !value.is_null())
}

fn required_string(
    fields: &Map<String, Value>,
    name: &'static str,
    aliases: &[&'static str],
) -> Result<String, ValidationError> {
    match lookup(fields, name, aliases) {
        None => Err(ValidationError::MissingField(name)),
        Some(Value::String(s)) if s.is_empty() => Err(ValidationError::MissingField(name)),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(type_mismatch(name, "a string", other)),
    }
}

fn optional_string(
    fields: &Map<String, Value>,
    name: &'static str,
    aliases: &[&'static str],
) -> Result<Option<String>, ValidationError> {
    match lookup(fields, name, aliases) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(type_mismatch(name, "a string", other)),
    }
}

fn required_quantity(fields: &Map<String, Value>) -> Result<u32, ValidationError> {
    let value = lookup(fields, "qty", &["quantity"]).ok_or(ValidationError::MissingField("qty"))?;
    let Value::Number(number) = value else {
        return Err(type_mismatch("qty", "a positive integer", value));
    };

    let violation = |reason: String| ValidationError::SchemaViolation {
        field: "qty",
        reason,
    };

    match (number.as_u64(), number.as_i64()) {
        (Some(0), _) => Err(violation("must be a positive integer, got 0".to_string())),
        (Some(qty), _) => u32::try_from(qty)
            .map_err(|_| violation(format!("{qty} exceeds the maximum order quantity"))),
        (None, Some(negative)) => Err(violation(format!(
            "must be a positive integer, got {negative}"
        ))),
        (None, None) => Err(violation(format!("must be an integer, got {number}"))),
    }
}

fn optional_timestamp(
    fields: &Map<String, Value>,
    name: &'static str,
    aliases: &[&'static str],
) -> Result<Option<DateTime<Utc>>, ValidationError> {
    match lookup(fields, name, aliases) {
        None => Ok(None),
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|ts| Some(ts.with_timezone(&Utc)))
            .map_err(|e| ValidationError::SchemaViolation {
                field: name,
                reason: format!("'{s}' is not an RFC 3339 timestamp: {e}"),
            }),
        Some(other) => Err(type_mismatch(name, "an RFC 3339 string", other)),
    }
}

fn type_mismatch(field: &'static str, expected: &str, found: &Value) -> ValidationError {
    ValidationError::SchemaViolation {
        field,
        reason: format!("expected {expected}, found {}", kind_of(found)),
    }
}

const fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Wire form of an `OrderPlaced` message, as order intake publishes it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPlacedEvent {
    /// Always [`EventType::OrderPlaced`].
    pub event_type: EventType,
    /// Business key.
    pub order_id: OrderId,
    /// Item being ordered.
    pub item: String,
    /// Units requested.
    pub qty: u32,
    /// Who placed the order.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub student_id: Option<String>,
    /// When order intake published the order.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
}

impl OrderPlacedEvent {
    /// Build an order message.
    #[must_use]
    pub fn new(order_id: impl Into<String>, item: impl Into<String>, qty: u32) -> Self {
        Self {
            event_type: EventType::OrderPlaced,
            order_id: OrderId::new(order_id),
            item: item.into(),
            qty,
            student_id: None,
            published_at: None,
        }
    }

    /// Set the requester.
    #[must_use]
    pub fn with_student(mut self, student_id: impl Into<String>) -> Self {
        self.student_id = Some(student_id.into());
        self
    }

    /// Stamp the publication time.
    #[must_use]
    pub const fn published_at(mut self, at: DateTime<Utc>) -> Self {
        self.published_at = Some(at);
        self
    }

    /// Serialize to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Wire form of `InventoryReserved` / `InventoryFailed`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeEvent {
    /// `InventoryReserved` or `InventoryFailed`.
    pub event_type: EventType,
    /// Business key.
    pub order_id: OrderId,
    /// Item from the order.
    pub item: String,
    /// Quantity from the order.
    pub qty: u32,
    /// Reservation outcome.
    pub outcome: Outcome,
    /// Why the reservation failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    /// When the originating order was published.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placed_at: Option<DateTime<Utc>>,
    /// When the outcome was committed.
    pub timestamp: DateTime<Utc>,
}

impl OutcomeEvent {
    /// Serialize to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
