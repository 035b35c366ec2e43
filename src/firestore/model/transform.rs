use crate::firestore::model::{FieldPath, Timestamp};
use crate::firestore::value::{values_equal, FirestoreValue, ValueKind};

/// Describes a single field transform applied during a write.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldTransform {
    field_path: FieldPath,
    operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field_path: FieldPath, operation: TransformOperation) -> Self {
        Self {
            field_path,
            operation,
        }
    }

    pub fn field_path(&self) -> &FieldPath {
        &self.field_path
    }

    pub fn operation(&self) -> &TransformOperation {
        &self.operation
    }
}

/// Write-time sentinel operations supported by the backend.
#[derive(Clone, Debug, PartialEq)]
pub enum TransformOperation {
    ServerTimestamp,
    ArrayUnion(Vec<FirestoreValue>),
    ArrayRemove(Vec<FirestoreValue>),
    NumericIncrement(FirestoreValue),
}

impl TransformOperation {
    /// Computes the optimistic value shown locally before the server responds.
    pub fn apply_to_local_view(
        &self,
        previous: Option<&FirestoreValue>,
        local_write_time: Timestamp,
    ) -> FirestoreValue {
        match self {
            TransformOperation::ServerTimestamp => {
                FirestoreValue::server_timestamp_placeholder(local_write_time, previous.cloned())
            }
            TransformOperation::ArrayUnion(elements) => {
                let mut values = coerced_array(previous);
                for element in elements {
                    if !values.iter().any(|existing| values_equal(existing, element)) {
                        values.push(element.clone());
                    }
                }
                FirestoreValue::from_array(values)
            }
            TransformOperation::ArrayRemove(elements) => {
                let mut values = coerced_array(previous);
                values.retain(|existing| !elements.iter().any(|element| values_equal(existing, element)));
                FirestoreValue::from_array(values)
            }
            TransformOperation::NumericIncrement(operand) => {
                let base = self
                    .compute_base_value(previous)
                    .unwrap_or_else(|| FirestoreValue::from_integer(0));
                increment(&base, operand)
            }
        }
    }

    /// Every transform type takes the server-computed result once the write is
    /// acknowledged.
    pub fn apply_to_remote_document(
        &self,
        _previous: Option<&FirestoreValue>,
        server_result: FirestoreValue,
    ) -> FirestoreValue {
        server_result
    }

    /// Value to persist as a base for idempotent replays. Only increments need
    /// one: the current numeric value, or integer zero when the field is not a
    /// number.
    pub fn compute_base_value(&self, previous: Option<&FirestoreValue>) -> Option<FirestoreValue> {
        match self {
            TransformOperation::NumericIncrement(_) => Some(match previous {
                Some(value) if value.is_number() => value.clone(),
                _ => FirestoreValue::from_integer(0),
            }),
            _ => None,
        }
    }
}

fn coerced_array(previous: Option<&FirestoreValue>) -> Vec<FirestoreValue> {
    previous
        .and_then(FirestoreValue::as_array)
        .map(|values| values.to_vec())
        .unwrap_or_default()
}

fn increment(base: &FirestoreValue, operand: &FirestoreValue) -> FirestoreValue {
    match (base.kind(), operand.kind()) {
        (ValueKind::Integer(left), ValueKind::Integer(right)) => {
            FirestoreValue::from_integer(left.saturating_add(*right))
        }
        _ => {
            let left = base.as_f64().unwrap_or(0.0);
            let right = operand.as_f64().unwrap_or(0.0);
            FirestoreValue::from_double(left + right)
        }
    }
}
