use std::cmp::Ordering;
use std::fmt;

use crate::firestore::model::{DocumentKey, FieldPath, MutableDocument, ResourcePath};
use crate::firestore::value::{canonical_id, compare_values, type_order, values_equal, FirestoreValue, ValueKind};

/// Comparison operators supported by field filters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FilterOperator {
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
    GreaterThanOrEqual,
    GreaterThan,
    ArrayContains,
    ArrayContainsAny,
    In,
    NotIn,
}

impl FilterOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::LessThan => "<",
            FilterOperator::LessThanOrEqual => "<=",
            FilterOperator::Equal => "==",
            FilterOperator::NotEqual => "!=",
            FilterOperator::GreaterThanOrEqual => ">=",
            FilterOperator::GreaterThan => ">",
            FilterOperator::ArrayContains => "array-contains",
            FilterOperator::ArrayContainsAny => "array-contains-any",
            FilterOperator::In => "in",
            FilterOperator::NotIn => "not-in",
        }
    }

    pub fn is_inequality(&self) -> bool {
        matches!(
            self,
            FilterOperator::LessThan
                | FilterOperator::LessThanOrEqual
                | FilterOperator::GreaterThan
                | FilterOperator::GreaterThanOrEqual
                | FilterOperator::NotEqual
                | FilterOperator::NotIn
        )
    }

    fn matches_comparison(&self, ordering: Ordering) -> bool {
        match self {
            FilterOperator::LessThan => ordering == Ordering::Less,
            FilterOperator::LessThanOrEqual => ordering != Ordering::Greater,
            FilterOperator::Equal => ordering == Ordering::Equal,
            FilterOperator::NotEqual => ordering != Ordering::Equal,
            FilterOperator::GreaterThan => ordering == Ordering::Greater,
            FilterOperator::GreaterThanOrEqual => ordering != Ordering::Less,
            _ => false,
        }
    }
}

impl fmt::Display for FilterOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldFilter {
    field: FieldPath,
    op: FilterOperator,
    value: FirestoreValue,
}

impl FieldFilter {
    pub fn new(field: FieldPath, op: FilterOperator, value: FirestoreValue) -> Self {
        Self { field, op, value }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn op(&self) -> FilterOperator {
        self.op
    }

    pub fn value(&self) -> &FirestoreValue {
        &self.value
    }

    pub fn is_inequality(&self) -> bool {
        self.op.is_inequality()
    }

    pub fn matches(&self, document: &MutableDocument) -> bool {
        if self.field.is_key_field() {
            return self.matches_key(document.key());
        }
        let other = document.data().field(&self.field);
        match self.op {
            FilterOperator::ArrayContains => other
                .and_then(FirestoreValue::as_array)
                .is_some_and(|values| values.iter().any(|v| values_equal(v, &self.value))),
            FilterOperator::ArrayContainsAny => {
                let (Some(values), Some(needles)) = (other.and_then(FirestoreValue::as_array), self.value.as_array())
                else {
                    return false;
                };
                values
                    .iter()
                    .any(|value| needles.iter().any(|needle| values_equal(value, needle)))
            }
            FilterOperator::In => match (other, self.value.as_array()) {
                (Some(other), Some(needles)) => needles.iter().any(|needle| values_equal(other, needle)),
                _ => false,
            },
            FilterOperator::NotIn => {
                let Some(needles) = self.value.as_array() else {
                    return false;
                };
                if needles.iter().any(FirestoreValue::is_null) {
                    return false;
                }
                match other {
                    Some(other) => !other.is_null() && !needles.iter().any(|needle| values_equal(other, needle)),
                    None => false,
                }
            }
            FilterOperator::NotEqual => match other {
                Some(other) => !other.is_null() && self.op.matches_comparison(compare_values(other, &self.value)),
                None => false,
            },
            _ => match other {
                Some(other) => {
                    type_order(other) == type_order(&self.value)
                        && self.op.matches_comparison(compare_values(other, &self.value))
                }
                None => false,
            },
        }
    }

    fn matches_key(&self, key: &DocumentKey) -> bool {
        match self.op {
            FilterOperator::In | FilterOperator::NotIn => {
                let contained = self
                    .value
                    .as_array()
                    .unwrap_or_default()
                    .iter()
                    .filter_map(reference_key)
                    .any(|candidate| &candidate == key);
                if self.op == FilterOperator::In {
                    contained
                } else {
                    !contained
                }
            }
            _ => match reference_key(&self.value) {
                Some(other) => self.op.matches_comparison(key.cmp(&other)),
                None => false,
            },
        }
    }

    pub fn canonical_id(&self) -> String {
        format!(
            "{}{}{}",
            self.field.canonical_string(),
            self.op.as_str(),
            canonical_id(&self.value)
        )
    }
}

/// Extracts the document key from a reference value.
pub(crate) fn reference_key(value: &FirestoreValue) -> Option<DocumentKey> {
    let name = match value.kind() {
        ValueKind::Reference(name) => name,
        _ => return None,
    };
    let path = name.split_once("/documents/").map(|(_, path)| path)?;
    DocumentKey::from_path(ResourcePath::from_string(path).ok()?).ok()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompositeOperator {
    And,
    Or,
}

impl CompositeOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompositeOperator::And => "and",
            CompositeOperator::Or => "or",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CompositeFilter {
    op: CompositeOperator,
    filters: Vec<Filter>,
}

impl CompositeFilter {
    pub fn new(op: CompositeOperator, filters: Vec<Filter>) -> Self {
        Self { op, filters }
    }

    pub fn op(&self) -> CompositeOperator {
        self.op
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn is_conjunction(&self) -> bool {
        self.op == CompositeOperator::And
    }

    /// True when every member is a field filter.
    pub fn is_flat(&self) -> bool {
        self.filters.iter().all(|filter| matches!(filter, Filter::Field(_)))
    }

    pub fn is_flat_conjunction(&self) -> bool {
        self.is_conjunction() && self.is_flat()
    }

    pub fn matches(&self, document: &MutableDocument) -> bool {
        match self.op {
            CompositeOperator::And => self.filters.iter().all(|filter| filter.matches(document)),
            CompositeOperator::Or => self.filters.iter().any(|filter| filter.matches(document)),
        }
    }
}

/// A node of the filter tree attached to a query.
#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    Field(FieldFilter),
    Composite(CompositeFilter),
}

impl Filter {
    pub fn field(field: FieldPath, op: FilterOperator, value: FirestoreValue) -> Self {
        Filter::Field(FieldFilter::new(field, op, value))
    }

    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::Composite(CompositeFilter::new(CompositeOperator::And, filters))
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Composite(CompositeFilter::new(CompositeOperator::Or, filters))
    }

    pub fn matches(&self, document: &MutableDocument) -> bool {
        match self {
            Filter::Field(filter) => filter.matches(document),
            Filter::Composite(filter) => filter.matches(document),
        }
    }

    /// Every field filter in the tree, depth first.
    pub fn flattened_filters(&self) -> Vec<&FieldFilter> {
        let mut out = Vec::new();
        self.collect_field_filters(&mut out);
        out
    }

    fn collect_field_filters<'a>(&'a self, out: &mut Vec<&'a FieldFilter>) {
        match self {
            Filter::Field(filter) => out.push(filter),
            Filter::Composite(composite) => {
                for filter in &composite.filters {
                    filter.collect_field_filters(out);
                }
            }
        }
    }

    pub fn canonical_id(&self) -> String {
        match self {
            Filter::Field(filter) => filter.canonical_id(),
            Filter::Composite(composite) => {
                let members: Vec<String> = composite.filters.iter().map(Filter::canonical_id).collect();
                if composite.is_flat_conjunction() {
                    members.join(",")
                } else {
                    format!("{}({})", composite.op.as_str(), members.join(","))
                }
            }
        }
    }
}

impl From<FieldFilter> for Filter {
    fn from(filter: FieldFilter) -> Self {
        Filter::Field(filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{DatabaseId, ObjectValue, SnapshotVersion};

    fn doc(path: &str, fields: &[(&str, FirestoreValue)]) -> MutableDocument {
        let mut data = ObjectValue::empty();
        for (field, value) in fields {
            data.set(&FieldPath::from_dot_separated(field).unwrap(), value.clone());
        }
        MutableDocument::new_found_document(DocumentKey::from_string(path).unwrap(), SnapshotVersion::min(), data)
    }

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    #[test]
    fn comparison_requires_same_type() {
        let document = doc("rooms/a", &[("n", FirestoreValue::from_string("3"))]);
        let filter = FieldFilter::new(field("n"), FilterOperator::GreaterThan, FirestoreValue::from_integer(1));
        assert!(!filter.matches(&document));
        let document = doc("rooms/a", &[("n", FirestoreValue::from_double(3.5))]);
        assert!(filter.matches(&document));
    }

    #[test]
    fn not_equal_skips_missing_and_null() {
        let filter = FieldFilter::new(field("n"), FilterOperator::NotEqual, FirestoreValue::from_integer(1));
        assert!(!filter.matches(&doc("rooms/a", &[])));
        assert!(!filter.matches(&doc("rooms/a", &[("n", FirestoreValue::null())])));
        assert!(filter.matches(&doc("rooms/a", &[("n", FirestoreValue::from_integer(2))])));
    }

    #[test]
    fn array_operators() {
        let document = doc(
            "rooms/a",
            &[(
                "tags",
                FirestoreValue::from_array(vec![FirestoreValue::from_string("x"), FirestoreValue::from_string("y")]),
            )],
        );
        let contains = FieldFilter::new(field("tags"), FilterOperator::ArrayContains, FirestoreValue::from_string("y"));
        assert!(contains.matches(&document));
        let any = FieldFilter::new(
            field("tags"),
            FilterOperator::ArrayContainsAny,
            FirestoreValue::from_array(vec![FirestoreValue::from_string("z"), FirestoreValue::from_string("x")]),
        );
        assert!(any.matches(&document));
    }

    #[test]
    fn not_in_with_null_never_matches() {
        let filter = FieldFilter::new(
            field("n"),
            FilterOperator::NotIn,
            FirestoreValue::from_array(vec![FirestoreValue::null()]),
        );
        assert!(!filter.matches(&doc("rooms/a", &[("n", FirestoreValue::from_integer(2))])));
    }

    #[test]
    fn key_field_filters_compare_keys() {
        let db = DatabaseId::default("p");
        let reference =
            FirestoreValue::from_document_reference(&db, &DocumentKey::from_string("rooms/b").unwrap());
        let filter = FieldFilter::new(FieldPath::key_path(), FilterOperator::LessThan, reference.clone());
        assert!(filter.matches(&doc("rooms/a", &[])));
        assert!(!filter.matches(&doc("rooms/c", &[])));
        let in_filter = FieldFilter::new(
            FieldPath::key_path(),
            FilterOperator::In,
            FirestoreValue::from_array(vec![reference]),
        );
        assert!(in_filter.matches(&doc("rooms/b", &[])));
    }

    #[test]
    fn composite_filters_and_canonical_ids() {
        let a = Filter::field(field("a"), FilterOperator::Equal, FirestoreValue::from_integer(1));
        let b = Filter::field(field("b"), FilterOperator::Equal, FirestoreValue::from_integer(2));
        let or = Filter::or(vec![a.clone(), b.clone()]);
        assert!(or.matches(&doc("rooms/x", &[("b", FirestoreValue::from_integer(2))])));
        assert_eq!(or.canonical_id(), "or(a==1,b==2)");
        assert_eq!(Filter::and(vec![a, b]).canonical_id(), "a==1,b==2");
        assert_eq!(or.flattened_filters().len(), 2);
    }
}
