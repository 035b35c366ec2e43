use std::collections::BTreeMap;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{json, Value as JsonValue};

use crate::firestore::core::query::Query;
use crate::firestore::core::target::Target;
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::local::{TargetData, TargetPurpose};
use crate::firestore::model::{
    DatabaseId, DocumentKey, FieldMask, FieldPath, FieldTransform, GeoPoint, MutableDocument, Mutation,
    MutationResult, ObjectValue, Precondition, ResourcePath, SnapshotVersion, Timestamp, TransformOperation,
};
use crate::firestore::remote::structured_query::{decode_query_target, encode_query_target};
use crate::firestore::value::{BytesValue, FirestoreValue, MapValue, ValueKind};
use crate::util::assert::fail;

const VECTOR_TYPE_KEY: &str = "__type__";
const VECTOR_TYPE_VALUE: &str = "__vector__";
const VECTOR_VALUE_KEY: &str = "value";

/// Converts model types to and from the JSON mapping of the backend's
/// protocol buffers.
#[derive(Clone, Debug)]
pub struct JsonProtoSerializer {
    database_id: DatabaseId,
}

impl JsonProtoSerializer {
    pub fn new(database_id: DatabaseId) -> Self {
        Self { database_id }
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.database_id
    }

    pub fn database_name(&self) -> String {
        self.database_id.canonical_name()
    }

    pub fn document_name(&self, key: &DocumentKey) -> String {
        self.resource_name(key.path())
    }

    /// Full resource name of a path below the documents root.
    pub fn resource_name(&self, path: &ResourcePath) -> String {
        if path.is_empty() {
            self.database_id.documents_root()
        } else {
            format!("{}/{}", self.database_id.documents_root(), path.canonical_string())
        }
    }

    pub fn document_key_from_name(&self, name: &str) -> FirestoreResult<DocumentKey> {
        DocumentKey::from_path(self.resource_path_from_name(name)?)
    }

    /// Path below the documents root named by `name`. Names from another
    /// database are rejected.
    pub fn resource_path_from_name(&self, name: &str) -> FirestoreResult<ResourcePath> {
        let root = self.database_id.documents_root();
        if name == root {
            return Ok(ResourcePath::root());
        }
        let relative = name
            .strip_prefix(&root)
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| {
                invalid_argument(format!("resource name {name} does not belong to database {root}"))
            })?;
        ResourcePath::from_string(relative)
    }

    pub fn encode_value(&self, value: &FirestoreValue) -> JsonValue {
        encode_value(value)
    }

    pub fn decode_value(&self, value: &JsonValue) -> FirestoreResult<FirestoreValue> {
        decode_value(value)
    }

    pub fn encode_fields(&self, data: &ObjectValue) -> JsonValue {
        encode_map_fields(data.fields())
    }

    /// Decodes the `fields` member of a document or map value. A missing
    /// member is an empty document.
    pub fn decode_fields(&self, value: &JsonValue) -> FirestoreResult<ObjectValue> {
        Ok(ObjectValue::from_map(decode_map_value(value)?.into_fields()))
    }

    pub fn encode_timestamp(&self, timestamp: &Timestamp) -> String {
        encode_timestamp(timestamp)
    }

    pub fn decode_timestamp(&self, value: &str) -> FirestoreResult<Timestamp> {
        parse_timestamp(value)
    }

    pub fn encode_version(&self, version: SnapshotVersion) -> String {
        encode_timestamp(&version.timestamp())
    }

    pub fn decode_version(&self, value: Option<&JsonValue>) -> FirestoreResult<SnapshotVersion> {
        match value.and_then(JsonValue::as_str) {
            Some(text) => Ok(SnapshotVersion::new(parse_timestamp(text)?)),
            None => Ok(SnapshotVersion::min()),
        }
    }

    /// Decodes a `Document` message into a found document.
    pub fn decode_document(&self, document: &JsonValue) -> FirestoreResult<MutableDocument> {
        let name = document
            .get("name")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("document missing name"))?;
        let key = self.document_key_from_name(name)?;
        let data = self.decode_fields(document)?;
        let version = self.decode_version(document.get("updateTime"))?;
        let create_time = self.decode_version(document.get("createTime"))?;
        let mut result = MutableDocument::new_found_document(key, version, data);
        result.set_create_time(create_time);
        Ok(result)
    }

    /// Decodes one entry of a `batchGet` response.
    pub fn decode_maybe_document(&self, response: &JsonValue) -> FirestoreResult<MutableDocument> {
        if let Some(found) = response.get("found") {
            return self.decode_document(found);
        }
        if let Some(missing) = response.get("missing").and_then(JsonValue::as_str) {
            let key = self.document_key_from_name(missing)?;
            let read_time = self.decode_version(response.get("readTime"))?;
            if read_time == SnapshotVersion::min() {
                return Err(invalid_argument("batchGet missing document without a read time"));
            }
            return Ok(MutableDocument::new_no_document(key, read_time));
        }
        Err(invalid_argument("batchGet response has neither found nor missing"))
    }

    /// Encodes a mutation as a `Write` message.
    pub fn encode_mutation(&self, mutation: &Mutation) -> JsonValue {
        let mut write = serde_json::Map::new();
        match mutation {
            Mutation::Set { key, value, .. } => {
                write.insert("update".to_string(), self.encode_document(key, value));
            }
            Mutation::Patch { key, data, mask, .. } => {
                write.insert("update".to_string(), self.encode_document(key, data));
                write.insert("updateMask".to_string(), encode_field_mask(mask));
            }
            Mutation::Delete { key, .. } => {
                write.insert("delete".to_string(), json!(self.document_name(key)));
            }
            Mutation::Verify { key, .. } => {
                write.insert("verify".to_string(), json!(self.document_name(key)));
            }
        }

        let transforms = mutation.field_transforms();
        if !transforms.is_empty() {
            let encoded = transforms
                .iter()
                .map(|transform| self.encode_field_transform(transform))
                .collect();
            write.insert("updateTransforms".to_string(), JsonValue::Array(encoded));
        }

        if let Some(precondition) = self.encode_precondition(mutation.precondition()) {
            write.insert("currentDocument".to_string(), precondition);
        }
        JsonValue::Object(write)
    }

    /// Decodes a `Write` message.
    pub fn decode_mutation(&self, write: &JsonValue) -> FirestoreResult<Mutation> {
        let precondition = match write.get("currentDocument") {
            Some(current) => self.decode_precondition(current)?,
            None => Precondition::None,
        };
        let transforms = match write.get("updateTransforms").and_then(JsonValue::as_array) {
            Some(entries) => entries
                .iter()
                .map(|entry| self.decode_field_transform(entry))
                .collect::<FirestoreResult<Vec<_>>>()?,
            None => Vec::new(),
        };

        if let Some(update) = write.get("update") {
            let name = update
                .get("name")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| invalid_argument("update write missing document name"))?;
            let key = self.document_key_from_name(name)?;
            let data = self.decode_fields(update)?;
            let mutation = match write.get("updateMask") {
                Some(mask) => Mutation::patch(key, data, decode_field_mask(mask)?, precondition),
                None => Mutation::Set {
                    key,
                    value: data,
                    precondition,
                    field_transforms: Vec::new(),
                },
            };
            return Ok(mutation.with_field_transforms(transforms));
        }
        if let Some(name) = write.get("delete").and_then(JsonValue::as_str) {
            return Ok(Mutation::Delete {
                key: self.document_key_from_name(name)?,
                precondition,
            });
        }
        if let Some(name) = write.get("verify").and_then(JsonValue::as_str) {
            return Ok(Mutation::verify(self.document_key_from_name(name)?, precondition));
        }
        Err(invalid_argument("unknown write operation"))
    }

    /// Decodes a `WriteResult`. Writes without an update time, such as
    /// deletes, take the commit version.
    pub fn decode_write_result(
        &self,
        result: &JsonValue,
        commit_version: SnapshotVersion,
    ) -> FirestoreResult<MutationResult> {
        let mut version = self.decode_version(result.get("updateTime"))?;
        if version == SnapshotVersion::min() {
            version = commit_version;
        }
        let transform_results = match result.get("transformResults").and_then(JsonValue::as_array) {
            Some(values) => values
                .iter()
                .map(decode_value)
                .collect::<FirestoreResult<Vec<_>>>()?,
            None => Vec::new(),
        };
        Ok(MutationResult::new(version, transform_results))
    }

    pub fn decode_write_results(
        &self,
        results: Option<&JsonValue>,
        commit_version: SnapshotVersion,
    ) -> FirestoreResult<Vec<MutationResult>> {
        match results.and_then(JsonValue::as_array) {
            Some(entries) => entries
                .iter()
                .map(|entry| self.decode_write_result(entry, commit_version))
                .collect(),
            None => Ok(Vec::new()),
        }
    }

    /// Encodes a `Target` message for the listen stream.
    pub fn encode_target(&self, target_data: &TargetData) -> JsonValue {
        let target = &target_data.target;
        let mut encoded = serde_json::Map::new();
        if target.is_document_target() {
            encoded.insert(
                "documents".to_string(),
                json!({ "documents": [self.resource_name(target.path())] }),
            );
        } else {
            encoded.insert("query".to_string(), encode_query_target(self, target));
        }
        encoded.insert("targetId".to_string(), json!(target_data.target_id));

        if !target_data.resume_token.is_empty() {
            encoded.insert(
                "resumeToken".to_string(),
                json!(BASE64_STANDARD.encode(&target_data.resume_token)),
            );
            if let Some(expected_count) = target_data.expected_count {
                encoded.insert("expectedCount".to_string(), json!(expected_count));
            }
        } else if target_data.snapshot_version > SnapshotVersion::min() {
            encoded.insert(
                "readTime".to_string(),
                json!(self.encode_version(target_data.snapshot_version)),
            );
            if let Some(expected_count) = target_data.expected_count {
                encoded.insert("expectedCount".to_string(), json!(expected_count));
            }
        }
        JsonValue::Object(encoded)
    }

    /// Decodes the target carried by a listen request, the inverse of
    /// [`Self::encode_target`] for the target definition.
    pub fn decode_target(&self, encoded: &JsonValue) -> FirestoreResult<Target> {
        if let Some(documents) = encoded.get("documents") {
            let names = documents
                .get("documents")
                .and_then(JsonValue::as_array)
                .ok_or_else(|| invalid_argument("documents target without documents"))?;
            if names.len() != 1 {
                return Err(invalid_argument("documents target must name exactly one document"));
            }
            let name = names[0]
                .as_str()
                .ok_or_else(|| invalid_argument("document name must be a string"))?;
            let key = self.document_key_from_name(name)?;
            return Ok(Query::for_document(&key).to_target());
        }
        let query = encoded
            .get("query")
            .ok_or_else(|| invalid_argument("target has neither query nor documents"))?;
        decode_query_target(self, query)
    }

    /// Labels that tell the backend why a target is being listened to.
    pub fn encode_listen_request_labels(&self, target_data: &TargetData) -> Option<BTreeMap<String, String>> {
        let purpose = match target_data.purpose {
            TargetPurpose::Listen => return None,
            TargetPurpose::ExistenceFilterMismatch => "existence-filter-mismatch",
            TargetPurpose::ExistenceFilterMismatchBloom => "existence-filter-mismatch-bloom",
            TargetPurpose::LimboResolution => "limbo-document",
        };
        Some(BTreeMap::from([("goog-listen-tags".to_string(), purpose.to_string())]))
    }

    fn encode_document(&self, key: &DocumentKey, data: &ObjectValue) -> JsonValue {
        json!({
            "name": self.document_name(key),
            "fields": self.encode_fields(data),
        })
    }

    fn encode_precondition(&self, precondition: Precondition) -> Option<JsonValue> {
        match precondition {
            Precondition::None => None,
            Precondition::Exists(exists) => Some(json!({ "exists": exists })),
            Precondition::UpdateTime(version) => Some(json!({ "updateTime": self.encode_version(version) })),
        }
    }

    fn decode_precondition(&self, value: &JsonValue) -> FirestoreResult<Precondition> {
        if let Some(exists) = value.get("exists").and_then(JsonValue::as_bool) {
            return Ok(Precondition::Exists(exists));
        }
        if value.get("updateTime").is_some() {
            return Ok(Precondition::UpdateTime(self.decode_version(value.get("updateTime"))?));
        }
        Ok(Precondition::None)
    }

    fn encode_field_transform(&self, transform: &FieldTransform) -> JsonValue {
        let field_path = transform.field_path().canonical_string();
        match transform.operation() {
            TransformOperation::ServerTimestamp => json!({
                "fieldPath": field_path,
                "setToServerValue": "REQUEST_TIME"
            }),
            TransformOperation::ArrayUnion(elements) => json!({
                "fieldPath": field_path,
                "appendMissingElements": { "values": elements.iter().map(encode_value).collect::<Vec<_>>() }
            }),
            TransformOperation::ArrayRemove(elements) => json!({
                "fieldPath": field_path,
                "removeAllFromArray": { "values": elements.iter().map(encode_value).collect::<Vec<_>>() }
            }),
            TransformOperation::NumericIncrement(operand) => json!({
                "fieldPath": field_path,
                "increment": encode_value(operand)
            }),
        }
    }

    fn decode_field_transform(&self, value: &JsonValue) -> FirestoreResult<FieldTransform> {
        let field_path = value
            .get("fieldPath")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("field transform missing fieldPath"))?;
        let field_path = FieldPath::from_server_format(field_path)?;
        let operation = if let Some(server_value) = value.get("setToServerValue") {
            if server_value.as_str() != Some("REQUEST_TIME") {
                return Err(invalid_argument(format!("unknown server value {server_value}")));
            }
            TransformOperation::ServerTimestamp
        } else if let Some(elements) = value.get("appendMissingElements") {
            TransformOperation::ArrayUnion(decode_array_values(elements)?)
        } else if let Some(elements) = value.get("removeAllFromArray") {
            TransformOperation::ArrayRemove(decode_array_values(elements)?)
        } else if let Some(operand) = value.get("increment") {
            TransformOperation::NumericIncrement(decode_value(operand)?)
        } else {
            return Err(invalid_argument("unknown field transform"));
        };
        Ok(FieldTransform::new(field_path, operation))
    }
}

fn encode_field_mask(mask: &FieldMask) -> JsonValue {
    let paths: Vec<String> = mask.fields().map(FieldPath::canonical_string).collect();
    json!({ "fieldPaths": paths })
}

fn decode_field_mask(value: &JsonValue) -> FirestoreResult<FieldMask> {
    let paths = match value.get("fieldPaths").and_then(JsonValue::as_array) {
        Some(paths) => paths
            .iter()
            .map(|path| {
                path.as_str()
                    .ok_or_else(|| invalid_argument("field mask paths must be strings"))
                    .and_then(FieldPath::from_server_format)
            })
            .collect::<FirestoreResult<Vec<_>>>()?,
        None => Vec::new(),
    };
    Ok(FieldMask::new(paths))
}

fn encode_map_fields(fields: &BTreeMap<String, FirestoreValue>) -> JsonValue {
    let mut encoded = serde_json::Map::new();
    for (key, value) in fields {
        encoded.insert(key.clone(), encode_value(value));
    }
    JsonValue::Object(encoded)
}

pub(crate) fn encode_value(value: &FirestoreValue) -> JsonValue {
    match value.kind() {
        ValueKind::Null => json!({ "nullValue": JsonValue::Null }),
        ValueKind::Boolean(boolean) => json!({ "booleanValue": boolean }),
        ValueKind::Integer(integer) => json!({ "integerValue": integer.to_string() }),
        ValueKind::Double(double) => encode_double(*double),
        ValueKind::Timestamp(timestamp) => json!({ "timestampValue": encode_timestamp(timestamp) }),
        ValueKind::String(string) => json!({ "stringValue": string }),
        ValueKind::Bytes(bytes) => json!({ "bytesValue": bytes.to_base64() }),
        ValueKind::Reference(reference) => json!({ "referenceValue": reference }),
        ValueKind::GeoPoint(point) => json!({
            "geoPointValue": {
                "latitude": point.latitude(),
                "longitude": point.longitude(),
            }
        }),
        ValueKind::Array(array) => {
            let values = array.values().iter().map(encode_value).collect::<Vec<_>>();
            json!({ "arrayValue": { "values": values } })
        }
        ValueKind::Vector(values) => {
            let values = values.iter().map(|value| encode_double(*value)).collect::<Vec<_>>();
            json!({
                "mapValue": {
                    "fields": {
                        VECTOR_TYPE_KEY: { "stringValue": VECTOR_TYPE_VALUE },
                        VECTOR_VALUE_KEY: { "arrayValue": { "values": values } }
                    }
                }
            })
        }
        ValueKind::Map(map) => json!({
            "mapValue": {
                "fields": encode_map_fields(map.fields())
            }
        }),
        ValueKind::ServerTimestamp { .. } | ValueKind::MaxValue | ValueKind::Sentinel(_) => {
            fail(0x71c1, format!("value cannot be sent to the backend: {value:?}"))
        }
    }
}

/// JSON has no NaN or infinities; the proto JSON mapping spells them out.
fn encode_double(value: f64) -> JsonValue {
    if value.is_nan() {
        json!({ "doubleValue": "NaN" })
    } else if value.is_infinite() {
        json!({ "doubleValue": if value > 0.0 { "Infinity" } else { "-Infinity" } })
    } else {
        json!({ "doubleValue": value })
    }
}

fn decode_map_value(value: &JsonValue) -> FirestoreResult<MapValue> {
    let map = value
        .as_object()
        .ok_or_else(|| invalid_argument("Expected object for map value"))?;
    let fields_object = match map.get("fields") {
        Some(fields_value) => fields_value
            .as_object()
            .ok_or_else(|| invalid_argument("Expected 'fields' to be an object"))?,
        None => return Ok(MapValue::new(BTreeMap::new())),
    };

    let mut fields = BTreeMap::new();
    for (key, value) in fields_object {
        fields.insert(key.clone(), decode_value(value)?);
    }
    Ok(MapValue::new(fields))
}

fn decode_array_values(value: &JsonValue) -> FirestoreResult<Vec<FirestoreValue>> {
    match value.get("values").and_then(JsonValue::as_array) {
        Some(entries) => entries.iter().map(decode_value).collect(),
        None => Ok(Vec::new()),
    }
}

pub(crate) fn decode_value(value: &JsonValue) -> FirestoreResult<FirestoreValue> {
    let object = value
        .as_object()
        .ok_or_else(|| invalid_argument("Expected Firestore value object"))?;
    if object.contains_key("nullValue") {
        return Ok(FirestoreValue::null());
    }
    if let Some(bool_value) = object.get("booleanValue") {
        let value = bool_value
            .as_bool()
            .ok_or_else(|| invalid_argument("booleanValue must be bool"))?;
        return Ok(FirestoreValue::from_bool(value));
    }
    if let Some(integer_value) = object.get("integerValue") {
        let parsed = match integer_value {
            JsonValue::String(value) => {
                i64::from_str(value).map_err(|err| invalid_argument(format!("Invalid integerValue: {err}")))?
            }
            JsonValue::Number(number) => number
                .as_i64()
                .ok_or_else(|| invalid_argument("Integer out of range"))?,
            _ => return Err(invalid_argument("integerValue must be a string or number")),
        };
        return Ok(FirestoreValue::from_integer(parsed));
    }
    if let Some(double_value) = object.get("doubleValue") {
        return Ok(FirestoreValue::from_double(decode_double(double_value)?));
    }
    if let Some(timestamp_value) = object.get("timestampValue") {
        let timestamp_str = timestamp_value
            .as_str()
            .ok_or_else(|| invalid_argument("timestampValue must be string"))?;
        return Ok(FirestoreValue::from_timestamp(parse_timestamp(timestamp_str)?));
    }
    if let Some(string_value) = object.get("stringValue") {
        let str_value = string_value
            .as_str()
            .ok_or_else(|| invalid_argument("stringValue must be string"))?;
        return Ok(FirestoreValue::from_string(str_value));
    }
    if let Some(bytes_value) = object.get("bytesValue") {
        let str_value = bytes_value
            .as_str()
            .ok_or_else(|| invalid_argument("bytesValue must be base64 string"))?;
        let decoded =
            BytesValue::from_base64(str_value).map_err(|err| invalid_argument(format!("Invalid bytesValue: {err}")))?;
        return Ok(FirestoreValue::from_bytes(decoded));
    }
    if let Some(reference_value) = object.get("referenceValue") {
        let str_value = reference_value
            .as_str()
            .ok_or_else(|| invalid_argument("referenceValue must be string"))?;
        return Ok(FirestoreValue::from_reference(str_value));
    }
    if let Some(geo_point) = object.get("geoPointValue") {
        let latitude = geo_point
            .get("latitude")
            .and_then(JsonValue::as_f64)
            .unwrap_or_default();
        let longitude = geo_point
            .get("longitude")
            .and_then(JsonValue::as_f64)
            .unwrap_or_default();
        return Ok(FirestoreValue::from_geo_point(GeoPoint::new(latitude, longitude)?));
    }
    if let Some(array_value) = object.get("arrayValue") {
        return Ok(FirestoreValue::from_array(decode_array_values(array_value)?));
    }
    if let Some(map_value) = object.get("mapValue") {
        let map = decode_map_value(map_value)?;
        if let Some(vector) = as_vector(&map) {
            return Ok(FirestoreValue::from_vector(vector));
        }
        return Ok(FirestoreValue::from_map(map.into_fields()));
    }

    Err(invalid_argument("Unknown Firestore value type"))
}

fn as_vector(map: &MapValue) -> Option<Vec<f64>> {
    let fields = map.fields();
    if fields.get(VECTOR_TYPE_KEY)?.as_str()? != VECTOR_TYPE_VALUE {
        return None;
    }
    fields
        .get(VECTOR_VALUE_KEY)?
        .as_array()?
        .iter()
        .map(FirestoreValue::as_f64)
        .collect()
}

fn decode_double(value: &JsonValue) -> FirestoreResult<f64> {
    match value {
        JsonValue::Number(number) => number
            .as_f64()
            .ok_or_else(|| invalid_argument("Invalid doubleValue")),
        JsonValue::String(text) => match text.as_str() {
            "NaN" => Ok(f64::NAN),
            "Infinity" => Ok(f64::INFINITY),
            "-Infinity" => Ok(f64::NEG_INFINITY),
            other => other
                .parse::<f64>()
                .map_err(|err| invalid_argument(format!("Invalid doubleValue: {err}"))),
        },
        _ => Err(invalid_argument("doubleValue must be a number or string")),
    }
}

fn encode_timestamp(timestamp: &Timestamp) -> String {
    match Utc.timestamp_opt(timestamp.seconds, timestamp.nanos as u32).single() {
        Some(datetime) => datetime.to_rfc3339_opts(SecondsFormat::Nanos, true),
        None => "1970-01-01T00:00:00.000000000Z".to_string(),
    }
}

fn parse_timestamp(value: &str) -> FirestoreResult<Timestamp> {
    let datetime =
        DateTime::parse_from_rfc3339(value).map_err(|err| invalid_argument(format!("Invalid timestamp: {err}")))?;
    let datetime_utc = datetime.with_timezone(&Utc);
    Ok(Timestamp::new(
        datetime_utc.timestamp(),
        datetime_utc.timestamp_subsec_nanos() as i32,
    ))
}
