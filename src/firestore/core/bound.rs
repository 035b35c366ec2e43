use std::cmp::Ordering;

use crate::firestore::core::filter::reference_key;
use crate::firestore::core::query::{Direction, OrderBy};
use crate::firestore::model::MutableDocument;
use crate::firestore::value::{canonical_id, compare_values, FirestoreValue};
use crate::util::assert::fail;

/// A cursor position: one value per order-by component.
#[derive(Clone, Debug, PartialEq)]
pub struct Bound {
    pub position: Vec<FirestoreValue>,
    /// Whether a document sitting exactly on the bound is part of the result.
    pub inclusive: bool,
}

impl Bound {
    pub fn new(position: Vec<FirestoreValue>, inclusive: bool) -> Self {
        Self { position, inclusive }
    }

    /// Compares the bound with `document` along `order_by`.
    pub fn compare_to_document(&self, order_by: &[OrderBy], document: &MutableDocument) -> Ordering {
        for (component, order) in self.position.iter().zip(order_by) {
            let ordering = if order.field.is_key_field() {
                match reference_key(component) {
                    Some(key) => key.cmp(document.key()),
                    None => fail(0xa1b2, "cursor on the document key must be a reference"),
                }
            } else {
                match document.data().field(&order.field) {
                    Some(value) => compare_values(component, value),
                    None => fail(0xa1b3, "field referenced by a cursor is missing from the document"),
                }
            };
            let ordering = match order.direction {
                Direction::Ascending => ordering,
                Direction::Descending => ordering.reverse(),
            };
            if ordering.is_ne() {
                return ordering;
            }
        }
        Ordering::Equal
    }

    /// Whether a start bound admits `document`.
    pub fn sorts_before_document(&self, order_by: &[OrderBy], document: &MutableDocument) -> bool {
        let ordering = self.compare_to_document(order_by, document);
        if self.inclusive {
            ordering.is_le()
        } else {
            ordering.is_lt()
        }
    }

    /// Whether an end bound admits `document`.
    pub fn sorts_after_document(&self, order_by: &[OrderBy], document: &MutableDocument) -> bool {
        let ordering = self.compare_to_document(order_by, document);
        if self.inclusive {
            ordering.is_ge()
        } else {
            ordering.is_gt()
        }
    }

    pub(crate) fn canonical_position(&self) -> String {
        self.position.iter().map(canonical_id).collect::<Vec<_>>().join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{DocumentKey, FieldPath, ObjectValue, SnapshotVersion};

    fn doc(value: i64) -> MutableDocument {
        let mut data = ObjectValue::empty();
        data.set(&FieldPath::from_dot_separated("n").unwrap(), FirestoreValue::from_integer(value));
        MutableDocument::new_found_document(DocumentKey::from_string("c/d").unwrap(), SnapshotVersion::min(), data)
    }

    fn order(direction: Direction) -> Vec<OrderBy> {
        vec![OrderBy::new(FieldPath::from_dot_separated("n").unwrap(), direction)]
    }

    #[test]
    fn inclusive_start_bound_admits_equal_document() {
        let bound = Bound::new(vec![FirestoreValue::from_integer(5)], true);
        assert!(bound.sorts_before_document(&order(Direction::Ascending), &doc(5)));
        let exclusive = Bound::new(vec![FirestoreValue::from_integer(5)], false);
        assert!(!exclusive.sorts_before_document(&order(Direction::Ascending), &doc(5)));
        assert!(exclusive.sorts_before_document(&order(Direction::Ascending), &doc(6)));
    }

    #[test]
    fn descending_order_flips_comparison() {
        let bound = Bound::new(vec![FirestoreValue::from_integer(5)], false);
        assert!(bound.sorts_before_document(&order(Direction::Descending), &doc(4)));
        assert!(bound.sorts_after_document(&order(Direction::Descending), &doc(6)));
    }
}
