use serde_json::{json, Value as JsonValue};

use crate::firestore::core::bound::Bound;
use crate::firestore::core::filter::{CompositeFilter, CompositeOperator, FieldFilter, Filter, FilterOperator};
use crate::firestore::core::query::{Direction, OrderBy};
use crate::firestore::core::target::Target;
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::FieldPath;
use crate::firestore::remote::serializer::{decode_value, encode_value, JsonProtoSerializer};
use crate::firestore::value::FirestoreValue;

/// Encodes a non-document target as a `QueryTarget` message:
/// `{ parent, structuredQuery }`.
pub(crate) fn encode_query_target(serializer: &JsonProtoSerializer, target: &Target) -> JsonValue {
    let (parent, from_entry) = match target.collection_group() {
        Some(group) => (
            target.path().clone(),
            json!({ "collectionId": group, "allDescendants": true }),
        ),
        None => (
            target.path().without_last(),
            json!({ "collectionId": target.path().last_segment().unwrap_or_default() }),
        ),
    };

    let mut structured = serde_json::Map::new();
    structured.insert("from".to_string(), JsonValue::Array(vec![from_entry]));

    if let Some(filter) = encode_filters(target.filters()) {
        structured.insert("where".to_string(), filter);
    }

    if !target.order_by().is_empty() {
        let orders: Vec<_> = target.order_by().iter().map(encode_order_by).collect();
        structured.insert("orderBy".to_string(), JsonValue::Array(orders));
    }

    if let Some(limit) = target.limit() {
        structured.insert("limit".to_string(), json!(limit));
    }

    if let Some(start) = target.start_at() {
        structured.insert("startAt".to_string(), encode_cursor(start, start.inclusive));
    }

    if let Some(end) = target.end_at() {
        structured.insert("endAt".to_string(), encode_cursor(end, !end.inclusive));
    }

    json!({
        "parent": serializer.resource_name(&parent),
        "structuredQuery": JsonValue::Object(structured),
    })
}

/// Decodes a `QueryTarget` message produced by [`encode_query_target`].
pub(crate) fn decode_query_target(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<Target> {
    let parent = value
        .get("parent")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument("query target missing parent"))?;
    let mut path = serializer.resource_path_from_name(parent)?;
    let query = value
        .get("structuredQuery")
        .ok_or_else(|| invalid_argument("query target missing structuredQuery"))?;

    let from = query
        .get("from")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| invalid_argument("structured query missing from"))?;
    if from.len() != 1 {
        return Err(invalid_argument(
            "structured query must select exactly one collection",
        ));
    }
    let collection_id = from[0]
        .get("collectionId")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument("from entry missing collectionId"))?;
    let all_descendants = from[0]
        .get("allDescendants")
        .and_then(JsonValue::as_bool)
        .unwrap_or(false);
    let collection_group = if all_descendants {
        Some(collection_id.to_string())
    } else {
        path = path.child([collection_id]);
        None
    };

    let filters = match query.get("where") {
        Some(filter) => decode_filters(filter)?,
        None => Vec::new(),
    };
    let order_by = match query.get("orderBy").and_then(JsonValue::as_array) {
        Some(orders) => orders
            .iter()
            .map(decode_order_by)
            .collect::<FirestoreResult<Vec<_>>>()?,
        None => Vec::new(),
    };
    let limit = match query.get("limit") {
        // Both the bare number and the wrapper message are accepted.
        Some(limit) => limit
            .as_u64()
            .or_else(|| limit.get("value").and_then(JsonValue::as_u64))
            .map(|limit| limit as u32),
        None => None,
    };
    let start_at = query
        .get("startAt")
        .map(|cursor| decode_cursor(cursor).map(|(position, before)| Bound::new(position, before)))
        .transpose()?;
    let end_at = query
        .get("endAt")
        .map(|cursor| decode_cursor(cursor).map(|(position, before)| Bound::new(position, !before)))
        .transpose()?;

    Ok(Target::new(path, collection_group, filters, order_by, limit, start_at, end_at))
}

/// The target's filters are an implicit conjunction.
fn encode_filters(filters: &[Filter]) -> Option<JsonValue> {
    match filters {
        [] => None,
        [single] => Some(encode_filter(single)),
        many => Some(encode_composite(CompositeOperator::And, many)),
    }
}

fn encode_filter(filter: &Filter) -> JsonValue {
    match filter {
        Filter::Field(field_filter) => encode_field_filter(field_filter),
        Filter::Composite(composite) => match composite.filters() {
            [single] => encode_filter(single),
            filters => encode_composite(composite.op(), filters),
        },
    }
}

fn encode_composite(op: CompositeOperator, filters: &[Filter]) -> JsonValue {
    let op = match op {
        CompositeOperator::And => "AND",
        CompositeOperator::Or => "OR",
    };
    json!({
        "compositeFilter": {
            "op": op,
            "filters": filters.iter().map(encode_filter).collect::<Vec<_>>(),
        }
    })
}

fn encode_field_filter(filter: &FieldFilter) -> JsonValue {
    let field = json!({ "fieldPath": filter.field().canonical_string() });
    let unary = match filter.op() {
        FilterOperator::Equal if filter.value().is_nan() => Some("IS_NAN"),
        FilterOperator::Equal if filter.value().is_null() => Some("IS_NULL"),
        FilterOperator::NotEqual if filter.value().is_nan() => Some("IS_NOT_NAN"),
        FilterOperator::NotEqual if filter.value().is_null() => Some("IS_NOT_NULL"),
        _ => None,
    };
    if let Some(op) = unary {
        return json!({ "unaryFilter": { "field": field, "op": op } });
    }
    json!({
        "fieldFilter": {
            "field": field,
            "op": operator_name(filter.op()),
            "value": encode_value(filter.value()),
        }
    })
}

/// Decodes a `where` clause. A flat conjunction unfolds into its members so
/// that encoding and decoding round-trip.
fn decode_filters(value: &JsonValue) -> FirestoreResult<Vec<Filter>> {
    match decode_filter(value)? {
        Filter::Composite(composite) if composite.is_flat_conjunction() => Ok(composite.filters().to_vec()),
        filter => Ok(vec![filter]),
    }
}

fn decode_filter(value: &JsonValue) -> FirestoreResult<Filter> {
    if let Some(composite) = value.get("compositeFilter") {
        let op = match composite.get("op").and_then(JsonValue::as_str) {
            Some("AND") => CompositeOperator::And,
            Some("OR") => CompositeOperator::Or,
            other => return Err(invalid_argument(format!("unknown composite operator {other:?}"))),
        };
        let filters = composite
            .get("filters")
            .and_then(JsonValue::as_array)
            .map(|filters| filters.iter().map(decode_filter).collect::<FirestoreResult<Vec<_>>>())
            .transpose()?
            .unwrap_or_default();
        return Ok(Filter::Composite(CompositeFilter::new(op, filters)));
    }
    if let Some(unary) = value.get("unaryFilter") {
        let field = decode_field_reference(unary.get("field"))?;
        let (op, operand) = match unary.get("op").and_then(JsonValue::as_str) {
            Some("IS_NAN") => (FilterOperator::Equal, FirestoreValue::from_double(f64::NAN)),
            Some("IS_NULL") => (FilterOperator::Equal, FirestoreValue::null()),
            Some("IS_NOT_NAN") => (FilterOperator::NotEqual, FirestoreValue::from_double(f64::NAN)),
            Some("IS_NOT_NULL") => (FilterOperator::NotEqual, FirestoreValue::null()),
            other => return Err(invalid_argument(format!("unknown unary operator {other:?}"))),
        };
        return Ok(Filter::field(field, op, operand));
    }
    if let Some(field_filter) = value.get("fieldFilter") {
        let field = decode_field_reference(field_filter.get("field"))?;
        let op = field_filter
            .get("op")
            .and_then(JsonValue::as_str)
            .and_then(operator_from_name)
            .ok_or_else(|| invalid_argument("unknown field filter operator"))?;
        let operand = field_filter
            .get("value")
            .map(decode_value)
            .transpose()?
            .ok_or_else(|| invalid_argument("field filter missing value"))?;
        return Ok(Filter::field(field, op, operand));
    }
    Err(invalid_argument("unknown filter type"))
}

fn encode_order_by(order: &OrderBy) -> JsonValue {
    let direction = match order.direction {
        Direction::Ascending => "ASCENDING",
        Direction::Descending => "DESCENDING",
    };
    json!({
        "field": { "fieldPath": order.field.canonical_string() },
        "direction": direction,
    })
}

fn decode_order_by(value: &JsonValue) -> FirestoreResult<OrderBy> {
    let field = decode_field_reference(value.get("field"))?;
    let direction = match value.get("direction").and_then(JsonValue::as_str) {
        Some("DESCENDING") => Direction::Descending,
        _ => Direction::Ascending,
    };
    Ok(OrderBy::new(field, direction))
}

fn encode_cursor(bound: &Bound, before: bool) -> JsonValue {
    json!({
        "values": bound.position.iter().map(encode_value).collect::<Vec<_>>(),
        "before": before,
    })
}

fn decode_cursor(value: &JsonValue) -> FirestoreResult<(Vec<FirestoreValue>, bool)> {
    let position = match value.get("values").and_then(JsonValue::as_array) {
        Some(values) => values.iter().map(decode_value).collect::<FirestoreResult<Vec<_>>>()?,
        None => Vec::new(),
    };
    let before = value.get("before").and_then(JsonValue::as_bool).unwrap_or(false);
    Ok((position, before))
}

fn decode_field_reference(value: Option<&JsonValue>) -> FirestoreResult<FieldPath> {
    let path = value
        .and_then(|field| field.get("fieldPath"))
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument("field reference missing fieldPath"))?;
    FieldPath::from_server_format(path)
}

fn operator_name(op: FilterOperator) -> &'static str {
    match op {
        FilterOperator::LessThan => "LESS_THAN",
        FilterOperator::LessThanOrEqual => "LESS_THAN_OR_EQUAL",
        FilterOperator::Equal => "EQUAL",
        FilterOperator::NotEqual => "NOT_EQUAL",
        FilterOperator::GreaterThanOrEqual => "GREATER_THAN_OR_EQUAL",
        FilterOperator::GreaterThan => "GREATER_THAN",
        FilterOperator::ArrayContains => "ARRAY_CONTAINS",
        FilterOperator::ArrayContainsAny => "ARRAY_CONTAINS_ANY",
        FilterOperator::In => "IN",
        FilterOperator::NotIn => "NOT_IN",
    }
}

fn operator_from_name(name: &str) -> Option<FilterOperator> {
    Some(match name {
        "LESS_THAN" => FilterOperator::LessThan,
        "LESS_THAN_OR_EQUAL" => FilterOperator::LessThanOrEqual,
        "EQUAL" => FilterOperator::Equal,
        "NOT_EQUAL" => FilterOperator::NotEqual,
        "GREATER_THAN_OR_EQUAL" => FilterOperator::GreaterThanOrEqual,
        "GREATER_THAN" => FilterOperator::GreaterThan,
        "ARRAY_CONTAINS" => FilterOperator::ArrayContains,
        "ARRAY_CONTAINS_ANY" => FilterOperator::ArrayContainsAny,
        "IN" => FilterOperator::In,
        "NOT_IN" => FilterOperator::NotIn,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::Query;
    use crate::firestore::model::{DatabaseId, ResourcePath};

    fn serializer() -> JsonProtoSerializer {
        JsonProtoSerializer::new(DatabaseId::new("project", "(default)"))
    }

    fn path(value: &str) -> FieldPath {
        FieldPath::from_dot_separated(value).unwrap()
    }

    fn round_trip(query: Query) {
        let serializer = serializer();
        let target = query.to_target();
        let encoded = encode_query_target(&serializer, &target);
        let decoded = decode_query_target(&serializer, &encoded).unwrap();
        assert_eq!(decoded, target);
        assert_eq!(decoded.canonical_id(), target.canonical_id());
    }

    #[test]
    fn encodes_collection_parent_and_from() {
        let query = Query::new(ResourcePath::from_string("rooms/a/messages").unwrap());
        let encoded = encode_query_target(&serializer(), &query.to_target());
        assert_eq!(
            encoded["parent"],
            json!("projects/project/databases/(default)/documents/rooms/a")
        );
        assert_eq!(encoded["structuredQuery"]["from"], json!([{ "collectionId": "messages" }]));
        assert_eq!(
            encoded["structuredQuery"]["orderBy"],
            json!([{ "field": { "fieldPath": "__name__" }, "direction": "ASCENDING" }])
        );
    }

    #[test]
    fn filters_order_limit_and_cursors_round_trip() {
        let query = Query::new(ResourcePath::from_string("rooms").unwrap())
            .with_filter(FieldFilter::new(path("size"), FilterOperator::GreaterThan, FirestoreValue::from_integer(2)))
            .with_filter(FieldFilter::new(path("tag"), FilterOperator::Equal, FirestoreValue::null()))
            .with_order_by(OrderBy::new(path("size"), Direction::Descending))
            .with_limit_to_first(10)
            .with_start_at(Bound::new(vec![FirestoreValue::from_integer(9)], true))
            .with_end_at(Bound::new(vec![FirestoreValue::from_integer(3)], false));
        round_trip(query);
    }

    #[test]
    fn or_filters_and_collection_groups_round_trip() {
        let query = Query::collection_group("messages").with_filter(Filter::or(vec![
            Filter::field(path("a"), FilterOperator::Equal, FirestoreValue::from_integer(1)),
            Filter::field(path("b"), FilterOperator::In, FirestoreValue::from_array(vec![
                FirestoreValue::from_integer(2),
                FirestoreValue::from_integer(3),
            ])),
        ]));
        round_trip(query);
    }

    #[test]
    fn limit_to_last_round_trips_flipped() {
        let query = Query::new(ResourcePath::from_string("rooms").unwrap())
            .with_order_by(OrderBy::new(path("size"), Direction::Ascending))
            .with_limit_to_last(2);
        round_trip(query);
    }

    #[test]
    fn null_equality_uses_unary_filter() {
        let filter = FieldFilter::new(path("tag"), FilterOperator::NotEqual, FirestoreValue::null());
        assert_eq!(
            encode_field_filter(&filter),
            json!({ "unaryFilter": { "field": { "fieldPath": "tag" }, "op": "IS_NOT_NULL" } })
        );
    }
}
