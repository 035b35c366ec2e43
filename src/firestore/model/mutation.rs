use std::collections::BTreeSet;

use crate::firestore::model::{
    DocumentKey, FieldMask, FieldPath, FieldTransform, MutableDocument, ObjectValue, SnapshotVersion,
    Timestamp,
};
use crate::firestore::value::FirestoreValue;
use crate::util::assert::hard_assert;

/// Condition the stored document must satisfy for a mutation to apply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Precondition {
    #[default]
    None,
    Exists(bool),
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    pub fn is_none(&self) -> bool {
        matches!(self, Precondition::None)
    }

    pub fn is_valid_for(&self, document: &MutableDocument) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(exists) => *exists == document.is_found_document(),
            Precondition::UpdateTime(update_time) => {
                document.is_found_document() && document.version() == *update_time
            }
        }
    }
}

/// Server acknowledgement of a single mutation.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationResult {
    /// Commit version of the write, or the document's update time when known.
    pub version: SnapshotVersion,
    /// One result per field transform, in declaration order.
    pub transform_results: Vec<FirestoreValue>,
}

impl MutationResult {
    pub fn new(version: SnapshotVersion, transform_results: Vec<FirestoreValue>) -> Self {
        Self {
            version,
            transform_results,
        }
    }
}

/// A write against a single document.
#[derive(Clone, Debug, PartialEq)]
pub enum Mutation {
    /// Replaces the whole document.
    Set {
        key: DocumentKey,
        value: ObjectValue,
        precondition: Precondition,
        field_transforms: Vec<FieldTransform>,
    },
    /// Updates the fields named in `mask`; masked fields absent from `data`
    /// are deleted.
    Patch {
        key: DocumentKey,
        data: ObjectValue,
        mask: FieldMask,
        precondition: Precondition,
        field_transforms: Vec<FieldTransform>,
    },
    Delete {
        key: DocumentKey,
        precondition: Precondition,
    },
    /// Checks a precondition without writing. Only meaningful on the server.
    Verify {
        key: DocumentKey,
        precondition: Precondition,
    },
}

impl Mutation {
    pub fn set(key: DocumentKey, value: ObjectValue) -> Self {
        Mutation::Set {
            key,
            value,
            precondition: Precondition::None,
            field_transforms: Vec::new(),
        }
    }

    pub fn patch(key: DocumentKey, data: ObjectValue, mask: FieldMask, precondition: Precondition) -> Self {
        Mutation::Patch {
            key,
            data,
            mask,
            precondition,
            field_transforms: Vec::new(),
        }
    }

    pub fn delete(key: DocumentKey) -> Self {
        Mutation::Delete {
            key,
            precondition: Precondition::None,
        }
    }

    pub fn verify(key: DocumentKey, precondition: Precondition) -> Self {
        Mutation::Verify { key, precondition }
    }

    /// Replaces the mutation's field transforms. Delete and verify carry none.
    pub fn with_field_transforms(mut self, transforms: Vec<FieldTransform>) -> Self {
        match &mut self {
            Mutation::Set {
                field_transforms, ..
            }
            | Mutation::Patch {
                field_transforms, ..
            } => *field_transforms = transforms,
            Mutation::Delete { .. } | Mutation::Verify { .. } => {}
        }
        self
    }

    pub fn key(&self) -> &DocumentKey {
        match self {
            Mutation::Set { key, .. }
            | Mutation::Patch { key, .. }
            | Mutation::Delete { key, .. }
            | Mutation::Verify { key, .. } => key,
        }
    }

    pub fn precondition(&self) -> Precondition {
        match self {
            Mutation::Set { precondition, .. }
            | Mutation::Patch { precondition, .. }
            | Mutation::Delete { precondition, .. }
            | Mutation::Verify { precondition, .. } => *precondition,
        }
    }

    pub fn field_transforms(&self) -> &[FieldTransform] {
        match self {
            Mutation::Set {
                field_transforms, ..
            }
            | Mutation::Patch {
                field_transforms, ..
            } => field_transforms,
            Mutation::Delete { .. } | Mutation::Verify { .. } => &[],
        }
    }

    pub fn is_set(&self) -> bool {
        matches!(self, Mutation::Set { .. })
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Mutation::Delete { .. })
    }

    /// Applies the acknowledged mutation to the cached remote document.
    pub fn apply_to_remote_document(&self, document: &mut MutableDocument, result: &MutationResult) {
        self.verify_key(document);
        match self {
            Mutation::Set { value, .. } => {
                let transform_results = self.server_transform_results(document, &result.transform_results);
                let mut data = value.clone();
                data.set_all(transform_results.iter().map(|(path, value)| (path, value)));
                document
                    .convert_to_found_document(result.version, data)
                    .set_has_committed_mutations();
            }
            Mutation::Patch { precondition, .. } => {
                if !precondition.is_valid_for(document) {
                    // The server accepted a patch we could not apply locally;
                    // the document's contents are unknown until watch catches up.
                    document.convert_to_unknown_document(result.version);
                    return;
                }
                let transform_results = self.server_transform_results(document, &result.transform_results);
                let mut data = document.data().clone();
                let patch = self.patch_values();
                data.set_all(patch.iter().map(|(path, value)| (path, value)));
                data.set_all(transform_results.iter().map(|(path, value)| (path, value)));
                document
                    .convert_to_found_document(result.version, data)
                    .set_has_committed_mutations();
            }
            Mutation::Delete { .. } => {
                hard_assert(
                    result.transform_results.is_empty(),
                    0x4a2c,
                    "transform results received by a delete mutation",
                );
                document
                    .convert_to_no_document(result.version)
                    .set_has_committed_mutations();
            }
            Mutation::Verify { .. } => {}
        }
    }

    /// Applies the mutation to the local view of `document`.
    ///
    /// `previous_mask` holds the fields changed by earlier mutations in the
    /// same overlay computation, `None` meaning the whole document. Returns
    /// the updated mask.
    pub fn apply_to_local_view(
        &self,
        document: &mut MutableDocument,
        previous_mask: Option<FieldMask>,
        local_write_time: Timestamp,
    ) -> Option<FieldMask> {
        self.verify_key(document);
        match self {
            Mutation::Set {
                value, precondition, ..
            } => {
                if !precondition.is_valid_for(document) {
                    return previous_mask;
                }
                let transform_results = self.local_transform_results(document, local_write_time);
                let mut data = value.clone();
                data.set_all(transform_results.iter().map(|(path, value)| (path, value)));
                let version = document.version();
                document
                    .convert_to_found_document(version, data)
                    .set_has_local_mutations();
                None
            }
            Mutation::Patch {
                mask,
                precondition,
                field_transforms,
                ..
            } => {
                if !precondition.is_valid_for(document) {
                    return previous_mask;
                }
                let transform_results = self.local_transform_results(document, local_write_time);
                let mut data = document.data().clone();
                let patch = self.patch_values();
                data.set_all(patch.iter().map(|(path, value)| (path, value)));
                data.set_all(transform_results.iter().map(|(path, value)| (path, value)));
                let version = document.version();
                document
                    .convert_to_found_document(version, data)
                    .set_has_local_mutations();
                let previous_mask = previous_mask?;
                Some(
                    previous_mask
                        .union_with(mask.fields().cloned())
                        .union_with(field_transforms.iter().map(|t| t.field_path().clone())),
                )
            }
            Mutation::Delete { precondition, .. } => {
                if !precondition.is_valid_for(document) {
                    return previous_mask;
                }
                let version = document.version();
                document.convert_to_no_document(version).set_has_local_mutations();
                None
            }
            Mutation::Verify { .. } => previous_mask,
        }
    }

    /// Fields this mutation writes, `None` when it replaces the whole document.
    pub fn extract_field_mask(&self) -> Option<FieldMask> {
        match self {
            Mutation::Patch {
                mask,
                field_transforms,
                ..
            } => Some(mask.union_with(field_transforms.iter().map(|t| t.field_path().clone()))),
            Mutation::Verify { .. } => Some(FieldMask::empty()),
            Mutation::Set { .. } | Mutation::Delete { .. } => None,
        }
    }

    /// Base values needed to replay the mutation's transforms idempotently,
    /// or `None` when no transform needs one.
    pub fn extract_base_value(&self, document: &MutableDocument) -> Option<ObjectValue> {
        let mut base = ObjectValue::empty();
        let mut found = false;
        for transform in self.field_transforms() {
            let existing = document.data().field(transform.field_path());
            if let Some(value) = transform.operation().compute_base_value(existing) {
                base.set(transform.field_path(), value);
                found = true;
            }
        }
        found.then_some(base)
    }

    fn verify_key(&self, document: &MutableDocument) {
        hard_assert(
            document.key() == self.key(),
            0x0d5b,
            "can only apply a mutation to a document with the same key",
        );
    }

    fn patch_values(&self) -> Vec<(FieldPath, Option<FirestoreValue>)> {
        let Mutation::Patch { data, mask, .. } = self else {
            return Vec::new();
        };
        mask.fields()
            .filter(|path| !path.is_empty())
            .map(|path| (path.clone(), data.field(path).cloned()))
            .collect()
    }

    fn server_transform_results(
        &self,
        document: &MutableDocument,
        server_results: &[FirestoreValue],
    ) -> Vec<(FieldPath, Option<FirestoreValue>)> {
        let transforms = self.field_transforms();
        hard_assert(
            transforms.len() == server_results.len(),
            0x3e57,
            &format!(
                "server transform result count ({}) should match field transform count ({})",
                server_results.len(),
                transforms.len()
            ),
        );
        transforms
            .iter()
            .zip(server_results)
            .map(|(transform, server_result)| {
                let previous = document.data().field(transform.field_path());
                let value = transform
                    .operation()
                    .apply_to_remote_document(previous, server_result.clone());
                (transform.field_path().clone(), Some(value))
            })
            .collect()
    }

    fn local_transform_results(
        &self,
        document: &MutableDocument,
        local_write_time: Timestamp,
    ) -> Vec<(FieldPath, Option<FirestoreValue>)> {
        self.field_transforms()
            .iter()
            .map(|transform| {
                let previous = document.data().field(transform.field_path());
                let value = transform
                    .operation()
                    .apply_to_local_view(previous, local_write_time);
                (transform.field_path().clone(), Some(value))
            })
            .collect()
    }
}

/// Collapses the local mutations already applied to `document` into the
/// single mutation stored as its overlay.
///
/// `mask` is the result of the `apply_to_local_view` chain: `None` produces a
/// set or delete of the whole document, otherwise a patch of the masked
/// fields. Returns `None` when there is nothing to overlay.
pub fn calculate_overlay_mutation(document: &MutableDocument, mask: Option<&FieldMask>) -> Option<Mutation> {
    if !document.has_local_mutations() {
        return None;
    }
    let Some(mask) = mask else {
        if document.is_no_document() {
            return Some(Mutation::delete(document.key().clone()));
        }
        return Some(Mutation::set(document.key().clone(), document.data().clone()));
    };
    if mask.is_empty() {
        return None;
    }

    let mut patch = ObjectValue::empty();
    let mut paths: BTreeSet<FieldPath> = BTreeSet::new();
    for field in mask.fields() {
        if paths.contains(field) {
            continue;
        }
        let mut path = field.clone();
        let mut value = document.data().field(&path);
        if value.is_none() && path.len() > 1 {
            // A deleted nested field is written as its parent so the overlay
            // does not resurrect an empty intermediate map.
            if let Some(parent) = path.parent() {
                path = parent;
                value = document.data().field(&path);
            }
        }
        match value {
            Some(value) => patch.set(&path, value.clone()),
            None => patch.delete(&path),
        }
        paths.insert(path);
    }
    Some(Mutation::patch(
        document.key().clone(),
        patch,
        FieldMask::new(paths),
        Precondition::None,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::TransformOperation;

    fn key() -> DocumentKey {
        DocumentKey::from_string("rooms/eros").unwrap()
    }

    fn path(text: &str) -> FieldPath {
        FieldPath::from_dot_separated(text).unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn object(entries: &[(&str, FirestoreValue)]) -> ObjectValue {
        let mut value = ObjectValue::empty();
        for (field, v) in entries {
            value.set(&path(field), v.clone());
        }
        value
    }

    fn base_doc() -> MutableDocument {
        MutableDocument::new_found_document(
            key(),
            version(1),
            object(&[
                ("a", FirestoreValue::from_integer(1)),
                ("b.c", FirestoreValue::from_string("x")),
            ]),
        )
    }

    #[test]
    fn set_replaces_document_locally() {
        let mut doc = base_doc();
        let mutation = Mutation::set(key(), object(&[("z", FirestoreValue::from_bool(true))]));
        let mask = mutation.apply_to_local_view(&mut doc, Some(FieldMask::empty()), Timestamp::new(2, 0));
        assert!(mask.is_none());
        assert!(doc.has_local_mutations());
        assert!(doc.field(&path("a")).is_none());
        assert_eq!(doc.field(&path("z")), Some(&FirestoreValue::from_bool(true)));
    }

    #[test]
    fn patch_merges_and_deletes_masked_fields() {
        let mut doc = base_doc();
        let mutation = Mutation::patch(
            key(),
            object(&[("a", FirestoreValue::from_integer(2))]),
            FieldMask::new([path("a"), path("b.c")]),
            Precondition::Exists(true),
        );
        let mask = mutation.apply_to_local_view(&mut doc, Some(FieldMask::empty()), Timestamp::new(2, 0));
        assert_eq!(doc.field(&path("a")), Some(&FirestoreValue::from_integer(2)));
        assert!(doc.field(&path("b.c")).is_none());
        assert_eq!(mask.map(|m| m.len()), Some(2));
    }

    #[test]
    fn patch_with_failed_precondition_keeps_previous_mask() {
        let mut doc = MutableDocument::new_no_document(key(), version(1));
        let mutation = Mutation::patch(
            key(),
            object(&[("a", FirestoreValue::from_integer(2))]),
            FieldMask::new([path("a")]),
            Precondition::Exists(true),
        );
        let previous = FieldMask::new([path("q")]);
        let mask = mutation.apply_to_local_view(&mut doc, Some(previous.clone()), Timestamp::new(2, 0));
        assert_eq!(mask, Some(previous));
        assert!(doc.is_no_document());
    }

    #[test]
    fn acknowledged_patch_on_missing_document_becomes_unknown() {
        let mut doc = MutableDocument::new_no_document(key(), version(1));
        let mutation = Mutation::patch(
            key(),
            object(&[("a", FirestoreValue::from_integer(2))]),
            FieldMask::new([path("a")]),
            Precondition::Exists(true),
        );
        mutation.apply_to_remote_document(&mut doc, &MutationResult::new(version(3), Vec::new()));
        assert!(doc.is_unknown_document());
        assert_eq!(doc.version(), version(3));
    }

    #[test]
    fn acknowledged_transform_uses_server_result() {
        let mut doc = base_doc();
        let mutation = Mutation::patch(key(), ObjectValue::empty(), FieldMask::empty(), Precondition::None)
            .with_field_transforms(vec![FieldTransform::new(
                path("a"),
                TransformOperation::NumericIncrement(FirestoreValue::from_integer(1)),
            )]);
        mutation.apply_to_remote_document(
            &mut doc,
            &MutationResult::new(version(4), vec![FirestoreValue::from_integer(10)]),
        );
        assert_eq!(doc.field(&path("a")), Some(&FirestoreValue::from_integer(10)));
        assert!(doc.has_committed_mutations());
    }

    #[test]
    fn base_value_extracted_for_increment() {
        let doc = base_doc();
        let mutation = Mutation::set(key(), ObjectValue::empty()).with_field_transforms(vec![FieldTransform::new(
            path("a"),
            TransformOperation::NumericIncrement(FirestoreValue::from_integer(1)),
        )]);
        let base = mutation.extract_base_value(&doc).unwrap();
        assert_eq!(base.field(&path("a")), Some(&FirestoreValue::from_integer(1)));
        assert!(Mutation::delete(key()).extract_base_value(&doc).is_none());
    }

    #[test]
    fn overlay_for_whole_document_changes() {
        let mut doc = base_doc();
        let mask = Mutation::delete(key()).apply_to_local_view(&mut doc, None, Timestamp::new(2, 0));
        assert_eq!(
            calculate_overlay_mutation(&doc, mask.as_ref()),
            Some(Mutation::delete(key()))
        );
        assert_eq!(calculate_overlay_mutation(&base_doc(), None), None);
    }

    #[test]
    fn overlay_patch_falls_back_to_parent_for_deleted_nested_field() {
        let mut doc = base_doc();
        let mutation = Mutation::patch(key(), ObjectValue::empty(), FieldMask::new([path("b.c")]), Precondition::None);
        let mask = mutation.apply_to_local_view(&mut doc, Some(FieldMask::empty()), Timestamp::new(2, 0));
        let overlay = calculate_overlay_mutation(&doc, mask.as_ref()).unwrap();
        match overlay {
            Mutation::Patch { mask, data, .. } => {
                assert!(mask.covers(&path("b")));
                assert!(data.field(&path("b")).unwrap().is_map());
            }
            other => panic!("unexpected overlay {other:?}"),
        }
    }
}
