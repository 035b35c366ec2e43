use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::firestore::core::target::TargetId;
use crate::firestore::error::{internal_error, invalid_argument, FirestoreError, FirestoreResult};
use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion};
use crate::firestore::remote::rpc_error::map_grpc_status;
use crate::firestore::remote::serializer::JsonProtoSerializer;

/// One decoded message from the listen stream.
#[derive(Debug, Clone)]
pub enum WatchChange {
    TargetChange(WatchTargetChange),
    DocumentChange(DocumentWatchChange),
    ExistenceFilter(ExistenceFilterChange),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchTargetChangeState {
    NoChange,
    Added,
    Removed,
    Current,
    Reset,
}

/// State change for a set of targets. An empty `target_ids` means the change
/// applies to every active target.
#[derive(Debug, Clone)]
pub struct WatchTargetChange {
    pub state: WatchTargetChangeState,
    pub target_ids: Vec<TargetId>,
    pub resume_token: Vec<u8>,
    pub read_time: SnapshotVersion,
    pub cause: Option<FirestoreError>,
}

impl WatchTargetChange {
    pub fn new(state: WatchTargetChangeState, target_ids: Vec<TargetId>) -> Self {
        Self {
            state,
            target_ids,
            resume_token: Vec::new(),
            read_time: SnapshotVersion::min(),
            cause: None,
        }
    }

    pub fn with_resume_token(mut self, resume_token: Vec<u8>) -> Self {
        self.resume_token = resume_token;
        self
    }

    pub fn with_cause(mut self, cause: FirestoreError) -> Self {
        self.cause = Some(cause);
        self
    }
}

/// A document entering, changing in, or leaving a set of targets. A
/// `new_doc` of `None` removes the document from the targets without
/// telling whether it still exists.
#[derive(Debug, Clone)]
pub struct DocumentWatchChange {
    pub updated_target_ids: Vec<TargetId>,
    pub removed_target_ids: Vec<TargetId>,
    pub key: DocumentKey,
    pub new_doc: Option<MutableDocument>,
}

#[derive(Debug, Clone)]
pub struct ExistenceFilterChange {
    pub target_id: TargetId,
    pub existence_filter: ExistenceFilter,
}

/// Number of documents the backend believes match a target, optionally with
/// a bloom filter of their names.
#[derive(Debug, Clone, PartialEq)]
pub struct ExistenceFilter {
    pub count: i32,
    pub unchanged_names: Option<BloomFilterProto>,
}

impl ExistenceFilter {
    pub fn new(count: i32) -> Self {
        Self {
            count,
            unchanged_names: None,
        }
    }
}

/// Raw bloom filter parameters as they arrive on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilterProto {
    pub bitmap: Vec<u8>,
    pub padding: i32,
    pub hash_count: i32,
}

#[derive(Debug, Deserialize)]
struct StatusCause {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: Option<String>,
}

/// Decodes a `ListenResponse`. Unknown response types decode to `None`.
pub fn decode_watch_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<Option<WatchChange>> {
    if let Some(target_change) = value.get("targetChange") {
        return decode_target_change(serializer, target_change).map(Some);
    }
    if let Some(document_change) = value.get("documentChange") {
        return decode_document_change(serializer, document_change).map(Some);
    }
    if let Some(document_delete) = value.get("documentDelete") {
        return decode_document_delete(serializer, document_delete).map(Some);
    }
    if let Some(document_remove) = value.get("documentRemove") {
        return decode_document_remove(serializer, document_remove).map(Some);
    }
    if let Some(filter) = value.get("filter") {
        return decode_filter_change(filter).map(Some);
    }
    Ok(None)
}

/// Snapshot version carried by a response: only global target changes
/// (no target ids) advance the consistent snapshot.
pub fn snapshot_version_of(change: &WatchChange) -> SnapshotVersion {
    match change {
        WatchChange::TargetChange(change) if change.target_ids.is_empty() => change.read_time,
        _ => SnapshotVersion::min(),
    }
}

fn decode_target_change(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<WatchChange> {
    let state = value
        .get("targetChangeType")
        .and_then(JsonValue::as_str)
        .map(target_state_from_str)
        .unwrap_or(WatchTargetChangeState::NoChange);
    let resume_token = decode_bytes(value.get("resumeToken"))?;
    let read_time = serializer.decode_version(value.get("readTime"))?;
    let cause = value
        .get("cause")
        .map(|cause| serde_json::from_value::<StatusCause>(cause.clone()))
        .transpose()
        .map_err(|err| internal_error(format!("Failed to decode watch cause: {err}")))?
        .map(|cause| map_grpc_status(cause.code, cause.message));

    Ok(WatchChange::TargetChange(WatchTargetChange {
        state,
        target_ids: numeric_array(value.get("targetIds")),
        resume_token,
        read_time,
        cause,
    }))
}

fn decode_document_change(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<WatchChange> {
    let document = value
        .get("document")
        .ok_or_else(|| invalid_argument("documentChange missing document"))?;
    let new_doc = serializer.decode_document(document)?;
    Ok(WatchChange::DocumentChange(DocumentWatchChange {
        updated_target_ids: numeric_array(value.get("targetIds")),
        removed_target_ids: numeric_array(value.get("removedTargetIds")),
        key: new_doc.key().clone(),
        new_doc: Some(new_doc),
    }))
}

fn decode_document_delete(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<WatchChange> {
    let key = decode_document_name(serializer, value, "documentDelete")?;
    let read_time = serializer.decode_version(value.get("readTime"))?;
    Ok(WatchChange::DocumentChange(DocumentWatchChange {
        updated_target_ids: Vec::new(),
        removed_target_ids: numeric_array(value.get("removedTargetIds")),
        new_doc: Some(MutableDocument::new_no_document(key.clone(), read_time)),
        key,
    }))
}

fn decode_document_remove(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<WatchChange> {
    let key = decode_document_name(serializer, value, "documentRemove")?;
    Ok(WatchChange::DocumentChange(DocumentWatchChange {
        updated_target_ids: Vec::new(),
        removed_target_ids: numeric_array(value.get("removedTargetIds")),
        key,
        new_doc: None,
    }))
}

fn decode_filter_change(value: &JsonValue) -> FirestoreResult<WatchChange> {
    let target_id = value
        .get("targetId")
        .and_then(JsonValue::as_i64)
        .unwrap_or_default() as TargetId;
    let count = value.get("count").and_then(JsonValue::as_i64).unwrap_or_default() as i32;
    let unchanged_names = match value.get("unchangedNames") {
        Some(names) => {
            let bits = names.get("bits");
            Some(BloomFilterProto {
                bitmap: decode_bytes(bits.and_then(|bits| bits.get("bitmap")))?,
                padding: bits
                    .and_then(|bits| bits.get("padding"))
                    .and_then(JsonValue::as_i64)
                    .unwrap_or_default() as i32,
                hash_count: names
                    .get("hashCount")
                    .and_then(JsonValue::as_i64)
                    .unwrap_or_default() as i32,
            })
        }
        None => None,
    };
    Ok(WatchChange::ExistenceFilter(ExistenceFilterChange {
        target_id,
        existence_filter: ExistenceFilter {
            count,
            unchanged_names,
        },
    }))
}

fn decode_document_name(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
    kind: &str,
) -> FirestoreResult<DocumentKey> {
    let name = value
        .get("document")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument(format!("{kind} missing document")))?;
    serializer.document_key_from_name(name)
}

fn decode_bytes(value: Option<&JsonValue>) -> FirestoreResult<Vec<u8>> {
    match value.and_then(JsonValue::as_str) {
        Some(encoded) => BASE64_STANDARD
            .decode(encoded)
            .map_err(|err| invalid_argument(format!("Invalid base64 payload: {err}"))),
        None => Ok(Vec::new()),
    }
}

fn numeric_array(value: Option<&JsonValue>) -> Vec<TargetId> {
    value
        .and_then(JsonValue::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.as_i64().map(|value| value as TargetId))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default()
}

fn target_state_from_str(value: &str) -> WatchTargetChangeState {
    match value {
        "ADD" => WatchTargetChangeState::Added,
        "REMOVE" => WatchTargetChangeState::Removed,
        "CURRENT" => WatchTargetChangeState::Current,
        "RESET" => WatchTargetChangeState::Reset,
        _ => WatchTargetChangeState::NoChange,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::FirestoreErrorCode;
    use crate::firestore::model::{DatabaseId, Timestamp};
    use serde_json::json;

    fn serializer() -> JsonProtoSerializer {
        JsonProtoSerializer::new(DatabaseId::new("project", "(default)"))
    }

    const ROOT: &str = "projects/project/databases/(default)/documents";

    #[test]
    fn decodes_target_change() {
        let change = json!({
            "targetChange": {
                "targetIds": [1, 2],
                "resumeToken": BASE64_STANDARD.encode([1u8, 2, 3]),
                "targetChangeType": "CURRENT"
            }
        });

        match decode_watch_change(&serializer(), &change).unwrap().unwrap() {
            WatchChange::TargetChange(change) => {
                assert_eq!(change.target_ids, vec![1, 2]);
                assert_eq!(change.resume_token, vec![1, 2, 3]);
                assert_eq!(change.state, WatchTargetChangeState::Current);
                assert!(change.cause.is_none());
            }
            other => panic!("unexpected change: {other:?}"),
        }
    }

    #[test]
    fn removal_cause_maps_grpc_code() {
        let change = json!({
            "targetChange": {
                "targetIds": [4],
                "targetChangeType": "REMOVE",
                "cause": { "code": 7, "message": "denied" }
            }
        });
        let WatchChange::TargetChange(change) = decode_watch_change(&serializer(), &change).unwrap().unwrap() else {
            panic!("expected target change");
        };
        let cause = change.cause.unwrap();
        assert_eq!(cause.code, FirestoreErrorCode::PermissionDenied);
        assert_eq!(cause.message(), "denied");
    }

    #[test]
    fn global_no_change_carries_snapshot_version() {
        let change = json!({ "targetChange": { "readTime": "1970-01-01T00:00:05Z" } });
        let decoded = decode_watch_change(&serializer(), &change).unwrap().unwrap();
        assert_eq!(snapshot_version_of(&decoded), SnapshotVersion::new(Timestamp::new(5, 0)));

        let targeted = json!({ "targetChange": { "targetIds": [2], "readTime": "1970-01-01T00:00:05Z" } });
        let decoded = decode_watch_change(&serializer(), &targeted).unwrap().unwrap();
        assert_eq!(snapshot_version_of(&decoded), SnapshotVersion::min());
    }

    #[test]
    fn global_change_of_any_type_carries_snapshot_version() {
        let change = json!({
            "targetChange": { "targetChangeType": "CURRENT", "readTime": "1970-01-01T00:00:07Z" }
        });
        let decoded = decode_watch_change(&serializer(), &change).unwrap().unwrap();
        assert_eq!(snapshot_version_of(&decoded), SnapshotVersion::new(Timestamp::new(7, 0)));

        let document = json!({
            "documentRemove": {
                "document": "projects/project/databases/(default)/documents/coll/a",
                "removedTargetIds": [2]
            }
        });
        let decoded = decode_watch_change(&serializer(), &document).unwrap().unwrap();
        assert_eq!(snapshot_version_of(&decoded), SnapshotVersion::min());
    }

    #[test]
    fn decodes_document_messages() {
        let change = json!({
            "documentChange": {
                "document": {
                    "name": format!("{ROOT}/rooms/a"),
                    "fields": { "n": { "integerValue": "1" } },
                    "updateTime": "1970-01-01T00:00:02Z"
                },
                "targetIds": [2],
                "removedTargetIds": [4]
            }
        });
        let WatchChange::DocumentChange(change) = decode_watch_change(&serializer(), &change).unwrap().unwrap() else {
            panic!("expected document change");
        };
        assert_eq!(change.updated_target_ids, vec![2]);
        assert_eq!(change.removed_target_ids, vec![4]);
        let doc = change.new_doc.unwrap();
        assert!(doc.is_found_document());
        assert_eq!(doc.version(), SnapshotVersion::new(Timestamp::new(2, 0)));

        let delete = json!({
            "documentDelete": {
                "document": format!("{ROOT}/rooms/a"),
                "readTime": "1970-01-01T00:00:03Z",
                "removedTargetIds": [2]
            }
        });
        let WatchChange::DocumentChange(change) = decode_watch_change(&serializer(), &delete).unwrap().unwrap() else {
            panic!("expected document change");
        };
        assert!(change.new_doc.unwrap().is_no_document());
        assert!(change.updated_target_ids.is_empty());

        let remove = json!({ "documentRemove": { "document": format!("{ROOT}/rooms/a"), "removedTargetIds": [2] } });
        let WatchChange::DocumentChange(change) = decode_watch_change(&serializer(), &remove).unwrap().unwrap() else {
            panic!("expected document change");
        };
        assert!(change.new_doc.is_none());
        assert_eq!(change.key, DocumentKey::from_string("rooms/a").unwrap());
    }

    #[test]
    fn decodes_existence_filter_with_bloom_filter() {
        let change = json!({
            "filter": {
                "targetId": 2,
                "count": 3,
                "unchangedNames": {
                    "bits": { "bitmap": BASE64_STANDARD.encode([0x0fu8, 0xf0]), "padding": 4 },
                    "hashCount": 2
                }
            }
        });
        let WatchChange::ExistenceFilter(change) = decode_watch_change(&serializer(), &change).unwrap().unwrap() else {
            panic!("expected existence filter");
        };
        assert_eq!(change.target_id, 2);
        assert_eq!(change.existence_filter.count, 3);
        assert_eq!(
            change.existence_filter.unchanged_names,
            Some(BloomFilterProto {
                bitmap: vec![0x0f, 0xf0],
                padding: 4,
                hash_count: 2
            })
        );
    }
}
