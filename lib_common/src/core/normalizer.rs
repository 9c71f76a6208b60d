//! # Event Normalizer
//!
//! Pure translation from one raw change-stream document into the relay's
//! display-ready `NormalizedEvent`. Nothing here holds state or performs I/O.
//!
//! Field order is never touched: BSON documents keep server order and the
//! structured rendering uses an order-preserving JSON map, because the order of
//! fields (recent-history arrays, compound keys) often carries meaning.

use bson::{Bson, Document};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{Map, Value};

/// Stand-in for a namespace component missing from the raw notification.
pub const NAMESPACE_PLACEHOLDER: &str = "unknown";

/// Operation tag assumed when a notification carries none.
pub const UNKNOWN_OPERATION: &str = "unknown";

/// One raw change notification exactly as the upstream feed delivered it.
#[derive(Debug, Clone, PartialEq)]
pub struct RawNotification(Document);

impl RawNotification {
    pub fn new(document: Document) -> Self {
        Self(document)
    }

    pub fn as_document(&self) -> &Document {
        &self.0
    }

    pub fn operation_tag(&self) -> Option<&str> {
        self.0.get_str("operationType").ok()
    }

    /// Embedded document under `key`, treating an explicit `null` as absent.
    fn sub_document(&self, key: &str) -> Option<&Document> {
        match self.0.get(key) {
            Some(Bson::Document(d)) => Some(d),
            _ => None,
        }
    }
}

/// The closed set of operations viewers are shown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Insert,
    Update,
    Replace,
    Delete,
    Drop,
    Invalidate,
    /// Any other tag; the original spelling is kept for display.
    Unknown(String),
}

impl Operation {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "insert" => Operation::Insert,
            "update" => Operation::Update,
            "replace" => Operation::Replace,
            "delete" => Operation::Delete,
            "drop" => Operation::Drop,
            "invalidate" => Operation::Invalidate,
            other => Operation::Unknown(other.to_string()),
        }
    }

    /// Uppercased display label (`INSERT`, `RENAME`, ...).
    pub fn label(&self) -> String {
        match self {
            Operation::Insert => "INSERT".into(),
            Operation::Update => "UPDATE".into(),
            Operation::Replace => "REPLACE".into(),
            Operation::Delete => "DELETE".into(),
            Operation::Drop => "DROP".into(),
            Operation::Invalidate => "INVALIDATE".into(),
            Operation::Unknown(tag) => tag.to_uppercase(),
        }
    }
}

/// Canonical, display-ready form of one upstream change.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEvent {
    pub operation: Operation,
    pub timestamp: DateTime<Utc>,
    /// `container.resource`.
    pub namespace: String,
    pub key_fields: Document,
    pub document: Option<Document>,
    pub update_delta: Option<Document>,
    pub rendered_text: String,
    pub rendered_structured: Value,
    /// The whole raw notification in display form.
    pub raw: Value,
}

/// Which part of the notification ends up rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadSource {
    Document,
    UpdateDelta,
    KeyFields,
}

impl NormalizedEvent {
    /// Payload precedence: full document, then update description, then key.
    pub fn payload_source(&self) -> PayloadSource {
        if self.document.is_some() {
            PayloadSource::Document
        } else if self.update_delta.is_some() {
            PayloadSource::UpdateDelta
        } else {
            PayloadSource::KeyFields
        }
    }

    fn payload(&self) -> &Document {
        self.document
            .as_ref()
            .or(self.update_delta.as_ref())
            .unwrap_or(&self.key_fields)
    }
}

/// Normalizes one raw notification.
pub fn normalize(raw: &RawNotification) -> NormalizedEvent {
    let operation = Operation::from_tag(raw.operation_tag().unwrap_or(UNKNOWN_OPERATION));

    let key_fields = raw.sub_document("documentKey").cloned().unwrap_or_default();
    let update_delta = raw.sub_document("updateDescription").cloned();

    // Deletes carry no full document; the pre-image stands in when the
    // collection records one.
    let document = raw.sub_document("fullDocument").cloned().or_else(|| {
        if operation == Operation::Delete {
            raw.sub_document("fullDocumentBeforeChange").cloned()
        } else {
            None
        }
    });

    let mut event = NormalizedEvent {
        operation,
        timestamp: event_timestamp(raw),
        namespace: namespace_of(raw),
        key_fields,
        document,
        update_delta,
        rendered_text: String::new(),
        rendered_structured: Value::Null,
        raw: display_document(raw.as_document()),
    };

    let structured = display_document(event.payload());
    event.rendered_text =
        serde_json::to_string_pretty(&structured).unwrap_or_else(|_| structured.to_string());
    event.rendered_structured = structured;
    event
}

fn namespace_of(raw: &RawNotification) -> String {
    let ns = raw.sub_document("ns");
    let db = ns.and_then(|n| n.get_str("db").ok()).unwrap_or(NAMESPACE_PLACEHOLDER);
    let coll = ns.and_then(|n| n.get_str("coll").ok()).unwrap_or(NAMESPACE_PLACEHOLDER);
    format!("{}.{}", db, coll)
}

fn event_timestamp(raw: &RawNotification) -> DateTime<Utc> {
    let doc = raw.as_document();
    if let Some(Bson::DateTime(wall)) = doc.get("wallTime") {
        if let Some(ts) = DateTime::from_timestamp_millis(wall.timestamp_millis()) {
            return ts;
        }
    }
    if let Some(Bson::Timestamp(cluster)) = doc.get("clusterTime") {
        if let Some(ts) = Utc.timestamp_opt(i64::from(cluster.time), 0).single() {
            return ts;
        }
    }
    Utc::now()
}

/// Display form of a document: an order-preserving JSON object.
pub fn display_document(doc: &Document) -> Value {
    let mut map = Map::with_capacity(doc.len());
    for (key, value) in doc {
        map.insert(key.clone(), display_value(value));
    }
    Value::Object(map)
}

/// Display form of one BSON value.
///
/// Opaque identifiers become their canonical string, binaries their byte
/// sequence, dates RFC 3339. Kinds with no natural JSON shape fall back to
/// relaxed Extended JSON.
pub fn display_value(value: &Bson) -> Value {
    match value {
        Bson::Document(doc) => display_document(doc),
        Bson::Array(items) => Value::Array(items.iter().map(display_value).collect()),
        Bson::String(s) => Value::String(s.clone()),
        Bson::Boolean(b) => Value::Bool(*b),
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::Int32(i) => Value::from(*i),
        Bson::Int64(i) => Value::from(*i),
        Bson::Double(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(f.to_string())),
        Bson::ObjectId(oid) => Value::String(oid.to_hex()),
        Bson::Binary(bin) => Value::Array(bin.bytes.iter().map(|b| Value::from(*b)).collect()),
        Bson::DateTime(dt) => match DateTime::from_timestamp_millis(dt.timestamp_millis()) {
            Some(ts) => Value::String(ts.to_rfc3339_opts(SecondsFormat::Millis, true)),
            None => Value::from(dt.timestamp_millis()),
        },
        other => other.clone().into_relaxed_extjson(),
    }
}
