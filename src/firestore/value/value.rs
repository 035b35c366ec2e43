use std::collections::BTreeMap;

use crate::firestore::model::{DatabaseId, DocumentKey, GeoPoint, Timestamp};
use crate::firestore::value::{ArrayValue, BytesValue, MapValue};

/// A single field value stored in a document.
///
/// Equality follows the database's semantics rather than Rust's `f64`
/// semantics: all NaNs are equal to each other, `-0.0` is not equal to `0.0`
/// and an integer never equals a double.
#[derive(Clone, Debug)]
pub struct FirestoreValue {
    kind: ValueKind,
}

/// Write-only placeholders resolved into transforms when a mutation is built.
#[derive(Clone, Debug, PartialEq)]
pub enum SentinelValue {
    ServerTimestamp,
    ArrayUnion(Vec<FirestoreValue>),
    ArrayRemove(Vec<FirestoreValue>),
    NumericIncrement(Box<FirestoreValue>),
    Delete,
}

#[derive(Clone, Debug)]
pub enum ValueKind {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    Timestamp(Timestamp),
    /// Local stand-in for a server timestamp that has not been committed yet.
    ServerTimestamp {
        local_write_time: Timestamp,
        previous_value: Option<Box<FirestoreValue>>,
    },
    String(String),
    Bytes(BytesValue),
    /// Fully qualified resource name of the referenced document.
    Reference(String),
    GeoPoint(GeoPoint),
    Array(ArrayValue),
    Vector(Vec<f64>),
    Map(MapValue),
    /// Sorts after every other value; only used for range bounds.
    MaxValue,
    Sentinel(SentinelValue),
}

impl FirestoreValue {
    pub fn from_kind(kind: ValueKind) -> Self {
        Self { kind }
    }

    pub fn null() -> Self {
        Self::from_kind(ValueKind::Null)
    }

    pub fn from_bool(value: bool) -> Self {
        Self::from_kind(ValueKind::Boolean(value))
    }

    pub fn from_integer(value: i64) -> Self {
        Self::from_kind(ValueKind::Integer(value))
    }

    pub fn from_double(value: f64) -> Self {
        Self::from_kind(ValueKind::Double(value))
    }

    pub fn from_timestamp(value: Timestamp) -> Self {
        Self::from_kind(ValueKind::Timestamp(value))
    }

    pub fn from_string(value: impl Into<String>) -> Self {
        Self::from_kind(ValueKind::String(value.into()))
    }

    pub fn from_bytes(value: BytesValue) -> Self {
        Self::from_kind(ValueKind::Bytes(value))
    }

    /// Builds a reference from a full resource name
    /// (`projects/p/databases/d/documents/...`).
    pub fn from_reference(path: impl Into<String>) -> Self {
        Self::from_kind(ValueKind::Reference(path.into()))
    }

    pub fn from_document_reference(database: &DatabaseId, key: &DocumentKey) -> Self {
        Self::from_reference(format!("{}/{}", database.documents_root(), key.path()))
    }

    pub fn from_geo_point(value: GeoPoint) -> Self {
        Self::from_kind(ValueKind::GeoPoint(value))
    }

    pub fn from_array(values: Vec<FirestoreValue>) -> Self {
        Self::from_kind(ValueKind::Array(ArrayValue::new(values)))
    }

    pub fn from_vector(values: Vec<f64>) -> Self {
        Self::from_kind(ValueKind::Vector(values))
    }

    pub fn from_map(map: BTreeMap<String, FirestoreValue>) -> Self {
        Self::from_kind(ValueKind::Map(MapValue::new(map)))
    }

    pub fn empty_map() -> Self {
        Self::from_map(BTreeMap::new())
    }

    pub fn max_value() -> Self {
        Self::from_kind(ValueKind::MaxValue)
    }

    pub fn server_timestamp_placeholder(
        local_write_time: Timestamp,
        previous_value: Option<FirestoreValue>,
    ) -> Self {
        // Nested placeholders collapse to the oldest committed value.
        let previous_value = previous_value.and_then(|value| match value.kind {
            ValueKind::ServerTimestamp { previous_value, .. } => previous_value,
            _ => Some(Box::new(value)),
        });
        Self::from_kind(ValueKind::ServerTimestamp {
            local_write_time,
            previous_value,
        })
    }

    /// Sentinel that instructs the backend to populate the field with the
    /// commit time.
    pub fn server_timestamp() -> Self {
        Self::from_kind(ValueKind::Sentinel(SentinelValue::ServerTimestamp))
    }

    /// Sentinel that unions the provided elements with an existing array field.
    pub fn array_union(elements: Vec<FirestoreValue>) -> Self {
        Self::from_kind(ValueKind::Sentinel(SentinelValue::ArrayUnion(elements)))
    }

    /// Sentinel that removes the provided elements from an existing array field.
    pub fn array_remove(elements: Vec<FirestoreValue>) -> Self {
        Self::from_kind(ValueKind::Sentinel(SentinelValue::ArrayRemove(elements)))
    }

    /// Sentinel that increments the targeted numeric field by `operand`.
    pub fn numeric_increment(operand: FirestoreValue) -> Self {
        Self::from_kind(ValueKind::Sentinel(SentinelValue::NumericIncrement(Box::new(operand))))
    }

    /// Sentinel that removes the field from the document.
    pub fn delete_field() -> Self {
        Self::from_kind(ValueKind::Sentinel(SentinelValue::Delete))
    }

    pub fn kind(&self) -> &ValueKind {
        &self.kind
    }

    pub fn into_kind(self) -> ValueKind {
        self.kind
    }

    pub fn is_null(&self) -> bool {
        matches!(self.kind, ValueKind::Null)
    }

    pub fn is_nan(&self) -> bool {
        matches!(self.kind, ValueKind::Double(value) if value.is_nan())
    }

    pub fn is_integer(&self) -> bool {
        matches!(self.kind, ValueKind::Integer(_))
    }

    pub fn is_number(&self) -> bool {
        matches!(self.kind, ValueKind::Integer(_) | ValueKind::Double(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self.kind, ValueKind::Array(_))
    }

    pub fn is_map(&self) -> bool {
        matches!(self.kind, ValueKind::Map(_))
    }

    pub fn is_sentinel(&self) -> bool {
        matches!(self.kind, ValueKind::Sentinel(_))
    }

    pub fn is_server_timestamp(&self) -> bool {
        matches!(self.kind, ValueKind::ServerTimestamp { .. })
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.kind {
            ValueKind::Boolean(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self.kind {
            ValueKind::Integer(value) => Some(value),
            _ => None,
        }
    }

    /// Numeric value as a double, for integers and doubles alike.
    pub fn as_f64(&self) -> Option<f64> {
        match self.kind {
            ValueKind::Integer(value) => Some(value as f64),
            ValueKind::Double(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.kind {
            ValueKind::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<&str> {
        match &self.kind {
            ValueKind::Reference(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[FirestoreValue]> {
        match &self.kind {
            ValueKind::Array(array) => Some(array.values()),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, FirestoreValue>> {
        match &self.kind {
            ValueKind::Map(map) => Some(map.fields()),
            _ => None,
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut BTreeMap<String, FirestoreValue>> {
        match &mut self.kind {
            ValueKind::Map(map) => Some(map.fields_mut()),
            _ => None,
        }
    }
}

impl PartialEq for FirestoreValue {
    fn eq(&self, other: &Self) -> bool {
        super::compare::values_equal(self, other)
    }
}

impl From<bool> for FirestoreValue {
    fn from(value: bool) -> Self {
        Self::from_bool(value)
    }
}

impl From<i64> for FirestoreValue {
    fn from(value: i64) -> Self {
        Self::from_integer(value)
    }
}

impl From<i32> for FirestoreValue {
    fn from(value: i32) -> Self {
        Self::from_integer(i64::from(value))
    }
}

impl From<f64> for FirestoreValue {
    fn from(value: f64) -> Self {
        Self::from_double(value)
    }
}

impl From<&str> for FirestoreValue {
    fn from(value: &str) -> Self {
        Self::from_string(value)
    }
}

impl From<String> for FirestoreValue {
    fn from(value: String) -> Self {
        Self::from_string(value)
    }
}

impl From<Timestamp> for FirestoreValue {
    fn from(value: Timestamp) -> Self {
        Self::from_timestamp(value)
    }
}

impl From<GeoPoint> for FirestoreValue {
    fn from(value: GeoPoint) -> Self {
        Self::from_geo_point(value)
    }
}

impl From<Vec<FirestoreValue>> for FirestoreValue {
    fn from(value: Vec<FirestoreValue>) -> Self {
        Self::from_array(value)
    }
}

impl From<BTreeMap<String, FirestoreValue>> for FirestoreValue {
    fn from(value: BTreeMap<String, FirestoreValue>) -> Self {
        Self::from_map(value)
    }
}
