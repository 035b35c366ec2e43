use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::firestore::core::bound::Bound;
use crate::firestore::core::filter::Filter;
use crate::firestore::core::target::Target;
use crate::firestore::model::{DocumentKey, FieldPath, MutableDocument, ResourcePath};
use crate::firestore::value::compare_values;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Ascending => "asc",
            Direction::Descending => "desc",
        }
    }

    fn flipped(self) -> Self {
        match self {
            Direction::Ascending => Direction::Descending,
            Direction::Descending => Direction::Ascending,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OrderBy {
    pub field: FieldPath,
    pub direction: Direction,
}

impl OrderBy {
    pub fn new(field: FieldPath, direction: Direction) -> Self {
        Self { field, direction }
    }

    pub fn canonical_id(&self) -> String {
        format!("{}{}", self.field.canonical_string(), self.direction.as_str())
    }

    fn compare_documents(&self, left: &MutableDocument, right: &MutableDocument) -> Ordering {
        let ordering = if self.field.is_key_field() {
            left.key().cmp(right.key())
        } else {
            match (left.data().field(&self.field), right.data().field(&self.field)) {
                (Some(l), Some(r)) => compare_values(l, r),
                // Documents lacking an order-by field never match the query.
                (l, r) => l.is_some().cmp(&r.is_some()),
            }
        };
        match self.direction {
            Direction::Ascending => ordering,
            Direction::Descending => ordering.reverse(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LimitType {
    First,
    Last,
}

/// Sort order over documents derived from a query's normalized order-by.
pub type DocumentComparator = Arc<dyn Fn(&MutableDocument, &MutableDocument) -> Ordering + Send + Sync>;

/// An immutable description of a set of documents.
///
/// Builders return modified copies; the original query is unchanged.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    path: ResourcePath,
    collection_group: Option<String>,
    explicit_order_by: Vec<OrderBy>,
    filters: Vec<Filter>,
    limit: Option<u32>,
    limit_type: LimitType,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
}

impl Query {
    /// A query over the documents directly under `path`, or over the single
    /// document at `path` when it has an even number of segments.
    pub fn new(path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            explicit_order_by: Vec::new(),
            filters: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
            start_at: None,
            end_at: None,
        }
    }

    pub fn collection_group(collection_id: impl Into<String>) -> Self {
        let mut query = Self::new(ResourcePath::root());
        query.collection_group = Some(collection_id.into());
        query
    }

    pub fn for_document(key: &DocumentKey) -> Self {
        Self::new(key.path().clone())
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group_id(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn explicit_order_by(&self) -> &[OrderBy] {
        &self.explicit_order_by
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    pub fn start_at(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    pub fn end_at(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    pub fn has_limit(&self) -> bool {
        self.limit.is_some()
    }

    pub fn with_filter(&self, filter: impl Into<Filter>) -> Self {
        let mut query = self.clone();
        query.filters.push(filter.into());
        query
    }

    pub fn with_order_by(&self, order_by: OrderBy) -> Self {
        let mut query = self.clone();
        query.explicit_order_by.push(order_by);
        query
    }

    pub fn with_limit_to_first(&self, limit: u32) -> Self {
        let mut query = self.clone();
        query.limit = Some(limit);
        query.limit_type = LimitType::First;
        query
    }

    pub fn with_limit_to_last(&self, limit: u32) -> Self {
        let mut query = self.clone();
        query.limit = Some(limit);
        query.limit_type = LimitType::Last;
        query
    }

    pub fn with_start_at(&self, bound: Bound) -> Self {
        let mut query = self.clone();
        query.start_at = Some(bound);
        query
    }

    pub fn with_end_at(&self, bound: Bound) -> Self {
        let mut query = self.clone();
        query.end_at = Some(bound);
        query
    }

    /// The same query rooted at a concrete collection. Used to expand
    /// collection group queries.
    pub fn as_collection_query_at_path(&self, path: ResourcePath) -> Self {
        let mut query = self.clone();
        query.path = path;
        query.collection_group = None;
        query
    }

    pub fn is_document_query(&self) -> bool {
        self.path.is_document_path() && self.collection_group.is_none() && self.filters.is_empty()
    }

    pub fn is_collection_group_query(&self) -> bool {
        self.collection_group.is_some()
    }

    pub fn matches_all_documents(&self) -> bool {
        self.filters.is_empty()
            && self.limit.is_none()
            && self.start_at.is_none()
            && self.end_at.is_none()
            && (self.explicit_order_by.is_empty()
                || (self.explicit_order_by.len() == 1 && self.explicit_order_by[0].field.is_key_field()))
    }

    /// Fields constrained by inequality filters anywhere in the filter tree.
    pub fn inequality_filter_fields(&self) -> BTreeSet<FieldPath> {
        self.filters
            .iter()
            .flat_map(Filter::flattened_filters)
            .filter(|filter| filter.is_inequality())
            .map(|filter| filter.field().clone())
            .collect()
    }

    /// Explicit order-by followed by implicit orderings on inequality fields
    /// and a trailing document key ordering.
    pub fn normalized_order_by(&self) -> Vec<OrderBy> {
        let mut result = self.explicit_order_by.clone();
        let mut seen: BTreeSet<FieldPath> = result.iter().map(|order| order.field.clone()).collect();
        let last_direction = result
            .last()
            .map(|order| order.direction)
            .unwrap_or(Direction::Ascending);
        for field in self.inequality_filter_fields() {
            if !field.is_key_field() && seen.insert(field.clone()) {
                result.push(OrderBy::new(field, last_direction));
            }
        }
        if !seen.contains(&FieldPath::key_path()) {
            result.push(OrderBy::new(FieldPath::key_path(), last_direction));
        }
        result
    }

    pub fn comparator(&self) -> DocumentComparator {
        let order_by = self.normalized_order_by();
        Arc::new(move |left: &MutableDocument, right: &MutableDocument| {
            order_by
                .iter()
                .map(|order| order.compare_documents(left, right))
                .find(|ordering| ordering.is_ne())
                .unwrap_or(Ordering::Equal)
        })
    }

    pub fn matches(&self, document: &MutableDocument) -> bool {
        document.is_found_document()
            && self.matches_path_and_collection_group(document)
            && self.matches_order_by(document)
            && self.matches_filters(document)
            && self.matches_bounds(document)
    }

    fn matches_path_and_collection_group(&self, document: &MutableDocument) -> bool {
        let document_path = document.key().path();
        if let Some(group) = &self.collection_group {
            document.key().has_collection_id(group) && self.path.is_prefix_of(document_path)
        } else if self.path.is_document_path() {
            &self.path == document_path
        } else {
            self.path.is_immediate_parent_of(document_path)
        }
    }

    fn matches_order_by(&self, document: &MutableDocument) -> bool {
        self.normalized_order_by()
            .iter()
            .all(|order| order.field.is_key_field() || document.data().field(&order.field).is_some())
    }

    fn matches_filters(&self, document: &MutableDocument) -> bool {
        self.filters.iter().all(|filter| filter.matches(document))
    }

    fn matches_bounds(&self, document: &MutableDocument) -> bool {
        let order_by = self.normalized_order_by();
        if let Some(start) = &self.start_at {
            if !start.sorts_before_document(&order_by, document) {
                return false;
            }
        }
        if let Some(end) = &self.end_at {
            if !end.sorts_after_document(&order_by, document) {
                return false;
            }
        }
        true
    }

    /// Converts the query into the target sent to the backend. Limit-to-last
    /// queries are executed as limit-to-first with every ordering flipped and
    /// the cursors swapped.
    pub fn to_target(&self) -> Target {
        let order_by = self.normalized_order_by();
        match self.limit_type {
            LimitType::First => Target::new(
                self.path.clone(),
                self.collection_group.clone(),
                self.filters.clone(),
                order_by,
                self.limit,
                self.start_at.clone(),
                self.end_at.clone(),
            ),
            LimitType::Last => {
                let flipped = order_by
                    .into_iter()
                    .map(|order| OrderBy::new(order.field, order.direction.flipped()))
                    .collect();
                Target::new(
                    self.path.clone(),
                    self.collection_group.clone(),
                    self.filters.clone(),
                    flipped,
                    self.limit,
                    self.end_at.clone(),
                    self.start_at.clone(),
                )
            }
        }
    }

    /// Stable identity used to key views and listeners.
    pub fn canonical_id(&self) -> String {
        let limit_type = match self.limit_type {
            LimitType::First => "F",
            LimitType::Last => "L",
        };
        format!("{}|lt:{limit_type}", self.to_target().canonical_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::filter::FilterOperator;
    use crate::firestore::model::{ObjectValue, SnapshotVersion};
    use crate::firestore::value::FirestoreValue;

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    fn doc(path: &str, n: i64) -> MutableDocument {
        let mut data = ObjectValue::empty();
        data.set(&field("n"), FirestoreValue::from_integer(n));
        MutableDocument::new_found_document(DocumentKey::from_string(path).unwrap(), SnapshotVersion::min(), data)
    }

    fn rooms() -> Query {
        Query::new(ResourcePath::from_string("rooms").unwrap())
    }

    #[test]
    fn normalized_order_by_adds_inequality_and_key() {
        let query = rooms().with_filter(Filter::field(
            field("n"),
            FilterOperator::GreaterThan,
            FirestoreValue::from_integer(1),
        ));
        let order: Vec<String> = query.normalized_order_by().iter().map(OrderBy::canonical_id).collect();
        assert_eq!(order, vec!["nasc", "__name__asc"]);
    }

    #[test]
    fn implicit_orders_follow_last_explicit_direction() {
        let query = rooms().with_order_by(OrderBy::new(field("n"), Direction::Descending));
        let order = query.normalized_order_by();
        assert_eq!(order[1], OrderBy::new(FieldPath::key_path(), Direction::Descending));
    }

    #[test]
    fn matches_only_immediate_children() {
        let query = rooms();
        assert!(query.matches(&doc("rooms/a", 1)));
        assert!(!query.matches(&doc("rooms/a/messages/b", 1)));
        let group = Query::collection_group("messages");
        assert!(group.matches(&doc("rooms/a/messages/b", 1)));
        assert!(!group.matches(&doc("rooms/a", 1)));
    }

    #[test]
    fn comparator_sorts_by_field_then_key() {
        let query = rooms().with_order_by(OrderBy::new(field("n"), Direction::Ascending));
        let comparator = query.comparator();
        assert_eq!(comparator(&doc("rooms/b", 1), &doc("rooms/a", 2)), Ordering::Less);
        assert_eq!(comparator(&doc("rooms/b", 1), &doc("rooms/a", 1)), Ordering::Greater);
    }

    #[test]
    fn limit_to_last_flips_target() {
        let query = rooms()
            .with_order_by(OrderBy::new(field("n"), Direction::Ascending))
            .with_start_at(Bound::new(vec![FirestoreValue::from_integer(1)], true))
            .with_limit_to_last(2);
        let target = query.to_target();
        assert_eq!(target.order_by()[0].direction, Direction::Descending);
        assert!(target.start_at().is_none());
        assert_eq!(target.end_at().map(|b| b.inclusive), Some(true));
        assert_ne!(query.canonical_id(), query.with_limit_to_first(2).canonical_id());
    }

    #[test]
    fn bounds_filter_documents() {
        let query = rooms()
            .with_order_by(OrderBy::new(field("n"), Direction::Ascending))
            .with_start_at(Bound::new(vec![FirestoreValue::from_integer(2)], true))
            .with_end_at(Bound::new(vec![FirestoreValue::from_integer(3)], false));
        assert!(!query.matches(&doc("rooms/a", 1)));
        assert!(query.matches(&doc("rooms/a", 2)));
        assert!(!query.matches(&doc("rooms/a", 3)));
    }

    #[test]
    fn matches_all_documents_only_without_constraints() {
        assert!(rooms().matches_all_documents());
        assert!(!rooms().with_limit_to_first(1).matches_all_documents());
    }
}
