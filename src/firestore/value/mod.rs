mod array_value;
mod bytes_value;
pub mod compare;
mod map_value;
mod value;

pub use array_value::ArrayValue;
pub use bytes_value::BytesValue;
pub use compare::{canonical_id, compare_values, estimate_byte_size, type_order, values_equal, TypeOrder};
pub use map_value::MapValue;
pub use value::{FirestoreValue, SentinelValue, ValueKind};
