use std::fmt::{Display, Formatter};

use crate::firestore::core::{self, Bound, Direction, Filter, FilterOperator, LimitType, OrderBy};
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{DocumentKey, IntoFieldPath};
use crate::firestore::value::{FirestoreValue, ValueKind};

use super::database::Firestore;

/// A query against one collection or a collection group. Builder methods
/// return a new query and leave `self` untouched.
#[derive(Clone, Debug)]
pub struct Query {
    firestore: Firestore,
    query: core::Query,
}

impl Query {
    pub(crate) fn from_core(firestore: Firestore, query: core::Query) -> Self {
        Self { firestore, query }
    }

    /// Returns the Firestore instance that created this query.
    pub fn firestore(&self) -> &Firestore {
        &self.firestore
    }

    pub(crate) fn core(&self) -> &core::Query {
        &self.query
    }

    /// Adds a field filter. Filters on the document id accept either a
    /// reference value or a document id string.
    pub fn where_field(
        &self,
        field: impl IntoFieldPath,
        op: FilterOperator,
        value: FirestoreValue,
    ) -> FirestoreResult<Self> {
        let field = field.into_field_path()?;
        let value = if field.is_key_field() {
            self.parse_document_id_value(op, value)?
        } else {
            value
        };
        validate_filter_value(op, &value)?;
        Ok(self.with_core(self.query.with_filter(Filter::field(field, op, value))))
    }

    /// Adds a composite (`and` / `or`) filter built with [`Filter::and`] and
    /// [`Filter::or`].
    pub fn where_filter(&self, filter: Filter) -> FirestoreResult<Self> {
        for field_filter in filter.flattened_filters() {
            validate_filter_value(field_filter.op(), field_filter.value())?;
        }
        Ok(self.with_core(self.query.with_filter(filter)))
    }

    pub fn order_by(&self, field: impl IntoFieldPath, direction: Direction) -> FirestoreResult<Self> {
        if self.query.start_at().is_some() || self.query.end_at().is_some() {
            return Err(invalid_argument(
                "order_by() must be called before start_at(), start_after(), end_before() or end_at()",
            ));
        }
        let field = field.into_field_path()?;
        Ok(self.with_core(self.query.with_order_by(OrderBy::new(field, direction))))
    }

    /// Keeps only the first `limit` matching documents.
    pub fn limit(&self, limit: u32) -> FirestoreResult<Self> {
        validate_limit(limit)?;
        Ok(self.with_core(self.query.with_limit_to_first(limit)))
    }

    /// Keeps only the last `limit` matching documents. Requires an explicit
    /// order by when the query is executed.
    pub fn limit_to_last(&self, limit: u32) -> FirestoreResult<Self> {
        validate_limit(limit)?;
        Ok(self.with_core(self.query.with_limit_to_last(limit)))
    }

    pub fn start_at(&self, values: Vec<FirestoreValue>) -> FirestoreResult<Self> {
        let bound = self.bound("start_at", values, true)?;
        Ok(self.with_core(self.query.with_start_at(bound)))
    }

    pub fn start_after(&self, values: Vec<FirestoreValue>) -> FirestoreResult<Self> {
        let bound = self.bound("start_after", values, false)?;
        Ok(self.with_core(self.query.with_start_at(bound)))
    }

    pub fn end_at(&self, values: Vec<FirestoreValue>) -> FirestoreResult<Self> {
        let bound = self.bound("end_at", values, true)?;
        Ok(self.with_core(self.query.with_end_at(bound)))
    }

    pub fn end_before(&self, values: Vec<FirestoreValue>) -> FirestoreResult<Self> {
        let bound = self.bound("end_before", values, false)?;
        Ok(self.with_core(self.query.with_end_at(bound)))
    }

    /// Rejects queries the backend would refuse to run.
    pub(crate) fn validate_for_execution(&self) -> FirestoreResult<()> {
        if self.query.limit_type() == LimitType::Last && self.query.explicit_order_by().is_empty() {
            return Err(invalid_argument(
                "limit_to_last() queries require specifying at least one order_by() clause",
            ));
        }
        Ok(())
    }

    fn with_core(&self, query: core::Query) -> Self {
        Self {
            firestore: self.firestore.clone(),
            query,
        }
    }

    fn bound(&self, method: &str, values: Vec<FirestoreValue>, inclusive: bool) -> FirestoreResult<Bound> {
        let order_by = self.query.normalized_order_by();
        if values.is_empty() {
            return Err(invalid_argument(format!("{method}() requires at least one value")));
        }
        if values.len() > order_by.len() {
            return Err(invalid_argument(format!(
                "Too many arguments provided to {method}(). The number of arguments must be less than or equal to the number of order_by() clauses"
            )));
        }
        let mut position = Vec::with_capacity(values.len());
        for (value, order) in values.into_iter().zip(order_by.iter()) {
            if order.field.is_key_field() {
                position.push(self.parse_document_id_value(FilterOperator::Equal, value)?);
            } else {
                position.push(value);
            }
        }
        Ok(Bound::new(position, inclusive))
    }

    /// Converts document id strings into reference values for filters and
    /// cursors on the document key.
    fn parse_document_id_value(&self, op: FilterOperator, value: FirestoreValue) -> FirestoreResult<FirestoreValue> {
        if matches!(op, FilterOperator::ArrayContains | FilterOperator::ArrayContainsAny) {
            return Err(invalid_argument(format!(
                "Invalid query. You can't perform '{op}' queries on the document id"
            )));
        }
        match value.kind() {
            ValueKind::Array(array) if matches!(op, FilterOperator::In | FilterOperator::NotIn) => {
                let converted = array
                    .values()
                    .iter()
                    .map(|element| self.parse_document_id_value(FilterOperator::Equal, element.clone()))
                    .collect::<FirestoreResult<Vec<_>>>()?;
                Ok(FirestoreValue::from_array(converted))
            }
            ValueKind::String(id) => {
                if id.is_empty() {
                    return Err(invalid_argument("Invalid query. The document id must not be empty"));
                }
                if self.query.collection_group_id().is_none() && id.contains('/') {
                    return Err(invalid_argument(format!(
                        "Invalid query. A plain document id ('{id}') is required when querying a collection"
                    )));
                }
                let path = self.query.path().child(id.split('/'));
                let key = DocumentKey::from_path(path)?;
                Ok(FirestoreValue::from_document_reference(self.firestore.database_id(), &key))
            }
            ValueKind::Reference(_) => Ok(value),
            _ => Err(invalid_argument(
                "Invalid query. Document id values must be strings or document references",
            )),
        }
    }
}

impl Display for Query {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Query({})", self.query.canonical_id())
    }
}

impl PartialEq for Query {
    fn eq(&self, other: &Self) -> bool {
        self.firestore.database_id() == other.firestore.database_id() && self.query == other.query
    }
}

fn validate_limit(limit: u32) -> FirestoreResult<()> {
    if limit == 0 {
        return Err(invalid_argument("Query limit must be positive"));
    }
    Ok(())
}

fn validate_filter_value(op: FilterOperator, value: &FirestoreValue) -> FirestoreResult<()> {
    match op {
        FilterOperator::In | FilterOperator::NotIn | FilterOperator::ArrayContainsAny => match value.kind() {
            ValueKind::Array(array) if !array.values().is_empty() => Ok(()),
            _ => Err(invalid_argument(format!(
                "Invalid query. A non-empty array is required for '{op}' filters"
            ))),
        },
        _ if value.is_sentinel() => Err(invalid_argument("Invalid query. Field values cannot be used in filters")),
        _ => Ok(()),
    }
}
