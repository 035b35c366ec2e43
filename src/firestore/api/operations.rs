use std::collections::{BTreeMap, HashSet};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{
    DocumentKey, FieldMask, FieldPath, FieldTransform, Mutation, ObjectValue, Precondition, TransformOperation,
};
use crate::firestore::value::{FirestoreValue, SentinelValue, ValueKind};

/// Options that configure the behaviour of `set_doc` writes.
#[derive(Clone, Debug, Default)]
pub struct SetOptions {
    /// Merge the provided fields into the existing document instead of
    /// replacing it.
    pub merge: bool,
    /// Explicit field mask that should be merged. When set, this takes
    /// precedence over the `merge` flag.
    pub merge_fields: Option<Vec<FieldPath>>,
}

impl SetOptions {
    /// Merges every field present in the provided data.
    pub fn merge_all() -> Self {
        Self {
            merge: true,
            merge_fields: None,
        }
    }

    /// Merges only the listed field paths.
    pub fn merge_fields<I>(fields: I) -> FirestoreResult<Self>
    where
        I: IntoIterator<Item = FieldPath>,
    {
        let mut unique = Vec::new();
        let mut seen = HashSet::new();
        for field in fields {
            if seen.insert(field.clone()) {
                unique.push(field);
            }
        }
        if unique.is_empty() {
            return Err(invalid_argument("merge_fields requires at least one field path"));
        }
        Ok(Self {
            merge: false,
            merge_fields: Some(unique),
        })
    }

    pub fn is_merge(&self) -> bool {
        self.merge || self.merge_fields.is_some()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WriteKind {
    Set,
    MergeSet,
    Update,
}

/// Collects the field mask and transforms while user data is parsed.
struct ParseContext {
    kind: WriteKind,
    field_mask: Vec<FieldPath>,
    transforms: Vec<FieldTransform>,
}

impl ParseContext {
    fn new(kind: WriteKind) -> Self {
        Self {
            kind,
            field_mask: Vec::new(),
            transforms: Vec::new(),
        }
    }

    /// Whether `path` or something below it was written or transformed.
    fn contains(&self, path: &FieldPath) -> bool {
        self.field_mask.iter().any(|field| path.is_prefix_of(field))
            || self
                .transforms
                .iter()
                .any(|transform| path.is_prefix_of(transform.field_path()))
    }

    fn record_leaf(&mut self, path: &FieldPath) {
        if self.kind != WriteKind::Update {
            self.field_mask.push(path.clone());
        }
    }

    fn parse_object(
        &mut self,
        fields: &BTreeMap<String, FirestoreValue>,
        path: Option<&FieldPath>,
    ) -> FirestoreResult<BTreeMap<String, FirestoreValue>> {
        if fields.is_empty() {
            if let Some(path) = path {
                self.record_leaf(path);
            }
            return Ok(BTreeMap::new());
        }
        let mut parsed = BTreeMap::new();
        for (key, value) in fields {
            let child = match path {
                Some(parent) if !key.is_empty() => parent.child(key.clone()),
                _ => FieldPath::new([key.clone()])?,
            };
            if let Some(value) = self.parse_value(value, &child)? {
                parsed.insert(key.clone(), value);
            }
        }
        Ok(parsed)
    }

    /// Returns the value to store at `path`, or `None` when the value was a
    /// sentinel consumed into the mask or a transform.
    fn parse_value(&mut self, value: &FirestoreValue, path: &FieldPath) -> FirestoreResult<Option<FirestoreValue>> {
        match value.kind() {
            ValueKind::Sentinel(sentinel) => {
                self.parse_sentinel(sentinel, path)?;
                Ok(None)
            }
            ValueKind::Map(map) => {
                let parsed = self.parse_object(map.fields(), Some(path))?;
                Ok(Some(FirestoreValue::from_map(parsed)))
            }
            ValueKind::Array(array) => {
                for element in array.values() {
                    reject_sentinels(element, path)?;
                }
                self.record_leaf(path);
                Ok(Some(value.clone()))
            }
            ValueKind::ServerTimestamp { .. } | ValueKind::MaxValue => Err(invalid_argument(format!(
                "Invalid data. Unsupported field value at '{path}'"
            ))),
            _ => {
                self.record_leaf(path);
                Ok(Some(value.clone()))
            }
        }
    }

    fn parse_sentinel(&mut self, sentinel: &SentinelValue, path: &FieldPath) -> FirestoreResult<()> {
        let operation = match sentinel {
            SentinelValue::Delete => {
                return match self.kind {
                    WriteKind::MergeSet => {
                        self.field_mask.push(path.clone());
                        Ok(())
                    }
                    WriteKind::Set => Err(invalid_argument(format!(
                        "delete_field() cannot be used with set_doc() unless you pass merge options (found in field '{path}')"
                    ))),
                    WriteKind::Update => Err(invalid_argument(format!(
                        "delete_field() can only appear at the top level of your update data (found in field '{path}')"
                    ))),
                };
            }
            SentinelValue::ServerTimestamp => TransformOperation::ServerTimestamp,
            SentinelValue::ArrayUnion(elements) => {
                for element in elements {
                    reject_sentinels(element, path)?;
                }
                TransformOperation::ArrayUnion(elements.clone())
            }
            SentinelValue::ArrayRemove(elements) => {
                for element in elements {
                    reject_sentinels(element, path)?;
                }
                TransformOperation::ArrayRemove(elements.clone())
            }
            SentinelValue::NumericIncrement(operand) => match operand.kind() {
                ValueKind::Integer(_) | ValueKind::Double(_) => {
                    TransformOperation::NumericIncrement(operand.as_ref().clone())
                }
                _ => return Err(invalid_argument("increment() requires a numeric operand")),
            },
        };
        self.transforms.push(FieldTransform::new(path.clone(), operation));
        Ok(())
    }
}

fn reject_sentinels(value: &FirestoreValue, path: &FieldPath) -> FirestoreResult<()> {
    match value.kind() {
        ValueKind::Sentinel(_) => Err(invalid_argument(format!(
            "Invalid data. Field values such as server_timestamp() cannot be used inside arrays (field '{path}')"
        ))),
        ValueKind::Array(array) => array
            .values()
            .iter()
            .try_for_each(|element| reject_sentinels(element, path)),
        ValueKind::Map(map) => map
            .fields()
            .values()
            .try_for_each(|element| reject_sentinels(element, path)),
        _ => Ok(()),
    }
}

/// Turns `set_doc` data into a set mutation, or a patch when merging.
pub(crate) fn parse_set_data(
    key: DocumentKey,
    data: BTreeMap<String, FirestoreValue>,
    options: &SetOptions,
) -> FirestoreResult<Mutation> {
    let kind = if options.is_merge() {
        WriteKind::MergeSet
    } else {
        WriteKind::Set
    };
    let mut context = ParseContext::new(kind);
    let parsed = ObjectValue::from_map(context.parse_object(&data, None)?);

    if let Some(merge_fields) = &options.merge_fields {
        for field in merge_fields {
            if !context.contains(field) {
                return Err(invalid_argument(format!(
                    "Field '{field}' is specified in merge_fields but missing from the provided data"
                )));
            }
        }
        let mask = FieldMask::new(merge_fields.iter().cloned());
        let transforms = context
            .transforms
            .into_iter()
            .filter(|transform| mask.covers(transform.field_path()))
            .collect();
        return Ok(Mutation::patch(key, parsed, mask, Precondition::None).with_field_transforms(transforms));
    }

    if kind == WriteKind::MergeSet {
        let mask = FieldMask::new(context.field_mask);
        return Ok(Mutation::patch(key, parsed, mask, Precondition::None).with_field_transforms(context.transforms));
    }
    Ok(Mutation::set(key, parsed).with_field_transforms(context.transforms))
}

/// Turns `update_doc` data, keyed by dot-separated field paths, into a patch
/// that requires the document to exist.
pub(crate) fn parse_update_data(key: DocumentKey, data: BTreeMap<String, FirestoreValue>) -> FirestoreResult<Mutation> {
    if data.is_empty() {
        return Err(invalid_argument("update_doc requires at least one field/value pair"));
    }
    let mut context = ParseContext::new(WriteKind::Update);
    let mut object = ObjectValue::empty();
    let mut mask: Vec<FieldPath> = Vec::new();

    for (field, value) in &data {
        let path = FieldPath::from_dot_separated(field)?;
        if let Some(existing) = mask
            .iter()
            .chain(context.transforms.iter().map(FieldTransform::field_path))
            .find(|existing| existing.is_prefix_of(&path) || path.is_prefix_of(existing))
        {
            return Err(invalid_argument(format!(
                "Field '{path}' conflicts with field '{existing}' in the same update"
            )));
        }
        if matches!(value.kind(), ValueKind::Sentinel(SentinelValue::Delete)) {
            mask.push(path);
            continue;
        }
        if let Some(parsed) = context.parse_value(value, &path)? {
            object.set(&path, parsed);
            mask.push(path);
        }
    }

    Ok(Mutation::patch(key, object, FieldMask::new(mask), Precondition::Exists(true))
        .with_field_transforms(context.transforms))
}
