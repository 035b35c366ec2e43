//! Ordering, equality, canonical ids and size estimates for field values.

use std::cmp::Ordering;

use crate::firestore::model::resource_path::compare_segments;
use crate::firestore::value::{FirestoreValue, SentinelValue, ValueKind};

/// Relative position of each value type in the cross-type ordering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TypeOrder {
    Null = 0,
    Boolean = 1,
    Number = 2,
    Timestamp = 3,
    ServerTimestamp = 4,
    String = 5,
    Blob = 6,
    Reference = 7,
    GeoPoint = 8,
    Array = 9,
    Vector = 10,
    Object = 11,
    MaxValue = 12,
}

pub fn type_order(value: &FirestoreValue) -> TypeOrder {
    match value.kind() {
        ValueKind::Null => TypeOrder::Null,
        ValueKind::Boolean(_) => TypeOrder::Boolean,
        ValueKind::Integer(_) | ValueKind::Double(_) => TypeOrder::Number,
        ValueKind::Timestamp(_) => TypeOrder::Timestamp,
        ValueKind::ServerTimestamp { .. } => TypeOrder::ServerTimestamp,
        ValueKind::String(_) => TypeOrder::String,
        ValueKind::Bytes(_) => TypeOrder::Blob,
        ValueKind::Reference(_) => TypeOrder::Reference,
        ValueKind::GeoPoint(_) => TypeOrder::GeoPoint,
        ValueKind::Array(_) => TypeOrder::Array,
        ValueKind::Vector(_) => TypeOrder::Vector,
        ValueKind::Map(_) | ValueKind::Sentinel(_) => TypeOrder::Object,
        ValueKind::MaxValue => TypeOrder::MaxValue,
    }
}

/// Equality under the database's value semantics.
///
/// Integers and doubles are never equal to each other. Two doubles are equal
/// when they are both NaN, or numerically equal with the same sign of zero.
pub fn values_equal(left: &FirestoreValue, right: &FirestoreValue) -> bool {
    if std::ptr::eq(left, right) {
        return true;
    }
    if type_order(left) != type_order(right) {
        return false;
    }
    match (left.kind(), right.kind()) {
        (ValueKind::Null, ValueKind::Null) | (ValueKind::MaxValue, ValueKind::MaxValue) => true,
        (ValueKind::Boolean(l), ValueKind::Boolean(r)) => l == r,
        (ValueKind::Integer(l), ValueKind::Integer(r)) => l == r,
        (ValueKind::Double(l), ValueKind::Double(r)) => doubles_equal(*l, *r),
        (ValueKind::Integer(_), ValueKind::Double(_))
        | (ValueKind::Double(_), ValueKind::Integer(_)) => false,
        (ValueKind::Timestamp(l), ValueKind::Timestamp(r)) => l == r,
        (
            ValueKind::ServerTimestamp {
                local_write_time: l,
                ..
            },
            ValueKind::ServerTimestamp {
                local_write_time: r,
                ..
            },
        ) => l == r,
        (ValueKind::String(l), ValueKind::String(r)) => l == r,
        (ValueKind::Bytes(l), ValueKind::Bytes(r)) => l == r,
        (ValueKind::Reference(l), ValueKind::Reference(r)) => l == r,
        (ValueKind::GeoPoint(l), ValueKind::GeoPoint(r)) => {
            l.latitude() == r.latitude() && l.longitude() == r.longitude()
        }
        (ValueKind::Array(l), ValueKind::Array(r)) => {
            l.values().len() == r.values().len()
                && l.values()
                    .iter()
                    .zip(r.values())
                    .all(|(a, b)| values_equal(a, b))
        }
        (ValueKind::Vector(l), ValueKind::Vector(r)) => {
            l.len() == r.len() && l.iter().zip(r).all(|(a, b)| doubles_equal(*a, *b))
        }
        (ValueKind::Map(l), ValueKind::Map(r)) => {
            l.fields().len() == r.fields().len()
                && l.fields().iter().all(|(key, value)| {
                    r.fields()
                        .get(key)
                        .is_some_and(|other| values_equal(value, other))
                })
        }
        (ValueKind::Sentinel(l), ValueKind::Sentinel(r)) => sentinels_equal(l, r),
        _ => false,
    }
}

fn doubles_equal(left: f64, right: f64) -> bool {
    if left == right {
        left.is_sign_negative() == right.is_sign_negative()
    } else {
        left.is_nan() && right.is_nan()
    }
}

fn sentinels_equal(left: &SentinelValue, right: &SentinelValue) -> bool {
    match (left, right) {
        (SentinelValue::ServerTimestamp, SentinelValue::ServerTimestamp)
        | (SentinelValue::Delete, SentinelValue::Delete) => true,
        (SentinelValue::ArrayUnion(l), SentinelValue::ArrayUnion(r))
        | (SentinelValue::ArrayRemove(l), SentinelValue::ArrayRemove(r)) => {
            l.len() == r.len() && l.iter().zip(r).all(|(a, b)| values_equal(a, b))
        }
        (SentinelValue::NumericIncrement(l), SentinelValue::NumericIncrement(r)) => {
            values_equal(l, r)
        }
        _ => false,
    }
}

/// Total order over values, first by [`TypeOrder`] then within each type.
pub fn compare_values(left: &FirestoreValue, right: &FirestoreValue) -> Ordering {
    let left_type = type_order(left);
    let right_type = type_order(right);
    if left_type != right_type {
        return left_type.cmp(&right_type);
    }

    match (left.kind(), right.kind()) {
        (ValueKind::Boolean(l), ValueKind::Boolean(r)) => l.cmp(r),
        (ValueKind::Integer(l), ValueKind::Integer(r)) => l.cmp(r),
        (ValueKind::Double(l), ValueKind::Double(r)) => compare_doubles(*l, *r),
        (ValueKind::Integer(l), ValueKind::Double(r)) => compare_integer_to_double(*l, *r),
        (ValueKind::Double(l), ValueKind::Integer(r)) => {
            compare_integer_to_double(*r, *l).reverse()
        }
        (ValueKind::Timestamp(l), ValueKind::Timestamp(r)) => l.cmp(r),
        (
            ValueKind::ServerTimestamp {
                local_write_time: l,
                ..
            },
            ValueKind::ServerTimestamp {
                local_write_time: r,
                ..
            },
        ) => l.cmp(r),
        (ValueKind::String(l), ValueKind::String(r)) => l.as_bytes().cmp(r.as_bytes()),
        (ValueKind::Bytes(l), ValueKind::Bytes(r)) => l.as_slice().cmp(r.as_slice()),
        (ValueKind::Reference(l), ValueKind::Reference(r)) => compare_references(l, r),
        (ValueKind::GeoPoint(l), ValueKind::GeoPoint(r)) => l.compare(r),
        (ValueKind::Array(l), ValueKind::Array(r)) => compare_arrays(l.values(), r.values()),
        (ValueKind::Vector(l), ValueKind::Vector(r)) => l.len().cmp(&r.len()).then_with(|| {
            l.iter()
                .zip(r)
                .map(|(a, b)| compare_doubles(*a, *b))
                .find(|ordering| ordering.is_ne())
                .unwrap_or(Ordering::Equal)
        }),
        (ValueKind::Map(l), ValueKind::Map(r)) => {
            // BTreeMap iterates keys in byte order, which is UTF-8 order.
            for ((left_key, left_value), (right_key, right_value)) in
                l.fields().iter().zip(r.fields().iter())
            {
                let ordering = left_key
                    .as_bytes()
                    .cmp(right_key.as_bytes())
                    .then_with(|| compare_values(left_value, right_value));
                if ordering.is_ne() {
                    return ordering;
                }
            }
            l.fields().len().cmp(&r.fields().len())
        }
        _ => Ordering::Equal,
    }
}

/// NaN sorts before every other number; `-0.0` and `0.0` compare equal.
fn compare_doubles(left: f64, right: f64) -> Ordering {
    match left.partial_cmp(&right) {
        Some(ordering) => ordering,
        None => match (left.is_nan(), right.is_nan()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            _ => Ordering::Greater,
        },
    }
}

/// Exact comparison of an `i64` against an `f64` without rounding the integer.
fn compare_integer_to_double(left: i64, right: f64) -> Ordering {
    if right.is_nan() {
        return Ordering::Greater;
    }
    // 2^63 is exactly representable; every i64 is below it.
    if right >= 9_223_372_036_854_775_808.0 {
        return Ordering::Less;
    }
    if right < -9_223_372_036_854_775_808.0 {
        return Ordering::Greater;
    }
    let truncated = right.trunc();
    match left.cmp(&(truncated as i64)) {
        Ordering::Equal => {
            let fraction = right - truncated;
            if fraction > 0.0 {
                Ordering::Less
            } else if fraction < 0.0 {
                Ordering::Greater
            } else {
                Ordering::Equal
            }
        }
        ordering => ordering,
    }
}

fn compare_references(left: &str, right: &str) -> Ordering {
    let left_segments: Vec<&str> = left.split('/').collect();
    let right_segments: Vec<&str> = right.split('/').collect();
    for (l, r) in left_segments.iter().zip(right_segments.iter()) {
        let ordering = compare_segments(l, r);
        if ordering.is_ne() {
            return ordering;
        }
    }
    left_segments.len().cmp(&right_segments.len())
}

fn compare_arrays(left: &[FirestoreValue], right: &[FirestoreValue]) -> Ordering {
    for (l, r) in left.iter().zip(right) {
        let ordering = compare_values(l, r);
        if ordering.is_ne() {
            return ordering;
        }
    }
    left.len().cmp(&right.len())
}

/// Stable textual identity of a value, used to build target canonical ids.
pub fn canonical_id(value: &FirestoreValue) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &FirestoreValue, out: &mut String) {
    match value.kind() {
        ValueKind::Null => out.push_str("null"),
        ValueKind::Boolean(flag) => out.push_str(if *flag { "true" } else { "false" }),
        ValueKind::Integer(number) => out.push_str(&number.to_string()),
        ValueKind::Double(number) => out.push_str(&format_double(*number)),
        ValueKind::Timestamp(ts) => out.push_str(&format!("time({},{})", ts.seconds, ts.nanos)),
        ValueKind::ServerTimestamp {
            local_write_time, ..
        } => out.push_str(&format!(
            "serverTimestamp({},{})",
            local_write_time.seconds, local_write_time.nanos
        )),
        ValueKind::String(text) => out.push_str(text),
        ValueKind::Bytes(bytes) => out.push_str(&bytes.to_base64()),
        ValueKind::Reference(name) => {
            // Canonicalise to the document path relative to the database.
            let path = name
                .split_once("/documents/")
                .map(|(_, path)| path)
                .unwrap_or(name);
            out.push_str(path);
        }
        ValueKind::GeoPoint(point) => out.push_str(&format!(
            "geo({},{})",
            format_double(point.latitude()),
            format_double(point.longitude())
        )),
        ValueKind::Array(array) => {
            out.push('[');
            for (index, element) in array.values().iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(element, out);
            }
            out.push(']');
        }
        ValueKind::Vector(values) => {
            out.push_str("{__type__:__vector__,value:[");
            let rendered: Vec<String> = values.iter().map(|v| format_double(*v)).collect();
            out.push_str(&rendered.join(","));
            out.push_str("]}");
        }
        ValueKind::Map(map) => {
            out.push('{');
            for (index, (key, field)) in map.fields().iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(key);
                out.push(':');
                write_canonical(field, out);
            }
            out.push('}');
        }
        ValueKind::MaxValue => out.push_str("__max__"),
        ValueKind::Sentinel(sentinel) => out.push_str(&format!("{sentinel:?}")),
    }
}

fn format_double(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else {
        format!("{value}")
    }
}

/// Approximate in-memory size of a value, used for cache size accounting.
pub fn estimate_byte_size(value: &FirestoreValue) -> usize {
    match value.kind() {
        ValueKind::Null | ValueKind::Boolean(_) => 4,
        ValueKind::Integer(_) | ValueKind::Double(_) => 8,
        ValueKind::Timestamp(_) | ValueKind::ServerTimestamp { .. } => 16,
        ValueKind::String(text) => text.len() * 2,
        ValueKind::Bytes(bytes) => bytes.len(),
        ValueKind::Reference(name) => name.len(),
        ValueKind::GeoPoint(_) => 16,
        ValueKind::Array(array) => array.values().iter().map(estimate_byte_size).sum(),
        ValueKind::Vector(values) => values.len() * 8,
        ValueKind::Map(map) => map
            .fields()
            .iter()
            .map(|(key, field)| key.len() * 2 + estimate_byte_size(field))
            .sum(),
        ValueKind::MaxValue | ValueKind::Sentinel(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{GeoPoint, Timestamp};
    use crate::firestore::value::BytesValue;
    use std::collections::BTreeMap;

    fn map(entries: &[(&str, FirestoreValue)]) -> FirestoreValue {
        FirestoreValue::from_map(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect::<BTreeMap<_, _>>(),
        )
    }

    /// Values listed in strictly ascending order; values within the same
    /// inner vector compare equal.
    fn ordered_groups() -> Vec<Vec<FirestoreValue>> {
        vec![
            vec![FirestoreValue::null()],
            vec![FirestoreValue::from_bool(false)],
            vec![FirestoreValue::from_bool(true)],
            vec![FirestoreValue::from_double(f64::NAN)],
            vec![FirestoreValue::from_double(f64::NEG_INFINITY)],
            vec![FirestoreValue::from_integer(i64::MIN)],
            vec![FirestoreValue::from_integer(-1), FirestoreValue::from_double(-1.0)],
            vec![
                FirestoreValue::from_integer(0),
                FirestoreValue::from_double(0.0),
                FirestoreValue::from_double(-0.0),
            ],
            vec![FirestoreValue::from_double(0.5)],
            vec![FirestoreValue::from_integer(1), FirestoreValue::from_double(1.0)],
            vec![FirestoreValue::from_integer(i64::MAX)],
            vec![FirestoreValue::from_double(f64::INFINITY)],
            vec![FirestoreValue::from_timestamp(Timestamp::new(1, 0))],
            vec![FirestoreValue::from_timestamp(Timestamp::new(1, 1))],
            vec![FirestoreValue::server_timestamp_placeholder(Timestamp::new(0, 0), None)],
            vec![FirestoreValue::from_string("")],
            vec![FirestoreValue::from_string("a")],
            vec![FirestoreValue::from_string("\u{ffff}")],
            vec![FirestoreValue::from_string("\u{1f600}")],
            vec![FirestoreValue::from_bytes(BytesValue::new(vec![]))],
            vec![FirestoreValue::from_bytes(BytesValue::new(vec![0]))],
            vec![FirestoreValue::from_reference("projects/p/databases/d/documents/c/a")],
            vec![FirestoreValue::from_reference("projects/p/databases/d/documents/c/b")],
            vec![FirestoreValue::from_geo_point(GeoPoint::new(-1.0, 0.0).unwrap())],
            vec![FirestoreValue::from_geo_point(GeoPoint::new(1.0, 0.0).unwrap())],
            vec![FirestoreValue::from_array(vec![])],
            vec![FirestoreValue::from_array(vec![FirestoreValue::from_integer(1)])],
            vec![FirestoreValue::from_array(vec![
                FirestoreValue::from_integer(1),
                FirestoreValue::from_integer(0),
            ])],
            vec![FirestoreValue::from_vector(vec![9.0])],
            vec![FirestoreValue::from_vector(vec![1.0, 2.0])],
            vec![map(&[])],
            vec![map(&[("a", FirestoreValue::from_integer(1))])],
            vec![map(&[
                ("a", FirestoreValue::from_integer(1)),
                ("b", FirestoreValue::from_integer(0)),
            ])],
            vec![map(&[("b", FirestoreValue::from_integer(0))])],
            vec![FirestoreValue::max_value()],
        ]
    }

    #[test]
    fn compare_is_a_total_order() {
        let groups = ordered_groups();
        for (i, left_group) in groups.iter().enumerate() {
            for (j, right_group) in groups.iter().enumerate() {
                for left in left_group {
                    for right in right_group {
                        let expected = i.cmp(&j);
                        assert_eq!(
                            compare_values(left, right),
                            expected,
                            "compare({left:?}, {right:?})"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn equality_is_reflexive() {
        for group in ordered_groups() {
            for value in group {
                assert!(values_equal(&value, &value.clone()), "{value:?} != itself");
            }
        }
    }

    #[test]
    fn number_equality_quirks() {
        let nan = FirestoreValue::from_double(f64::NAN);
        let other_nan = FirestoreValue::from_double(-f64::NAN);
        assert!(values_equal(&nan, &other_nan));
        let zero = FirestoreValue::from_double(0.0);
        let negative_zero = FirestoreValue::from_double(-0.0);
        assert!(!values_equal(&zero, &negative_zero));
        assert_eq!(compare_values(&zero, &negative_zero), Ordering::Equal);
        assert!(!values_equal(
            &FirestoreValue::from_integer(1),
            &FirestoreValue::from_double(1.0)
        ));
    }

    #[test]
    fn integer_double_comparison_is_exact() {
        let big = FirestoreValue::from_integer(9_007_199_254_740_993);
        let rounded = FirestoreValue::from_double(9_007_199_254_740_992.0);
        assert_eq!(compare_values(&big, &rounded), Ordering::Greater);
        let half = FirestoreValue::from_double(-0.5);
        assert_eq!(compare_values(&FirestoreValue::from_integer(0), &half), Ordering::Greater);
        assert_eq!(compare_values(&FirestoreValue::from_integer(-1), &half), Ordering::Less);
    }

    #[test]
    fn canonical_ids_are_stable() {
        let value = map(&[
            ("b", FirestoreValue::from_array(vec![FirestoreValue::from_integer(1)])),
            ("a", FirestoreValue::from_string("x")),
        ]);
        assert_eq!(canonical_id(&value), "{a:x,b:[1]}");
        assert_eq!(
            canonical_id(&FirestoreValue::from_timestamp(Timestamp::new(3, 4))),
            "time(3,4)"
        );
        assert_eq!(
            canonical_id(&FirestoreValue::from_reference(
                "projects/p/databases/d/documents/c/a"
            )),
            "c/a"
        );
    }

    #[test]
    fn estimates_nested_sizes() {
        let value = map(&[("ab", FirestoreValue::from_string("xyz"))]);
        assert_eq!(estimate_byte_size(&value), 4 + 6);
    }
}
