//! Write-time field values. Each helper returns a sentinel that the write
//! path turns into a field transform or a field deletion.

use crate::firestore::value::FirestoreValue;

/// Sets the field to the commit time of the write. Until the write is
/// acknowledged, local reads show the estimate chosen by the snapshot options.
pub fn server_timestamp() -> FirestoreValue {
    FirestoreValue::server_timestamp()
}

/// Adds `operand` to the field's current numeric value, treating a missing or
/// non-numeric field as zero.
pub fn increment(operand: impl Into<IncrementOperand>) -> FirestoreValue {
    let operand = match operand.into() {
        IncrementOperand::Integer(value) => FirestoreValue::from_integer(value),
        IncrementOperand::Double(value) => FirestoreValue::from_double(value),
    };
    FirestoreValue::numeric_increment(operand)
}

/// Appends each element not already present in the array field.
pub fn array_union(elements: Vec<FirestoreValue>) -> FirestoreValue {
    FirestoreValue::array_union(elements)
}

/// Removes every instance of each element from the array field.
pub fn array_remove(elements: Vec<FirestoreValue>) -> FirestoreValue {
    FirestoreValue::array_remove(elements)
}

/// Deletes the field. Only valid in `update_doc` and merging `set_doc`.
pub fn delete_field() -> FirestoreValue {
    FirestoreValue::delete_field()
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum IncrementOperand {
    Integer(i64),
    Double(f64),
}

impl From<i64> for IncrementOperand {
    fn from(value: i64) -> Self {
        IncrementOperand::Integer(value)
    }
}

impl From<i32> for IncrementOperand {
    fn from(value: i32) -> Self {
        IncrementOperand::Integer(i64::from(value))
    }
}

impl From<f64> for IncrementOperand {
    fn from(value: f64) -> Self {
        IncrementOperand::Double(value)
    }
}
