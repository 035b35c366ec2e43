use std::collections::BTreeMap;

use crate::firestore::model::{FieldMask, FieldPath};
use crate::firestore::value::{estimate_byte_size, FirestoreValue, ValueKind};

/// Mutable document contents: a nested map addressed by field paths.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObjectValue {
    fields: BTreeMap<String, FirestoreValue>,
}

impl ObjectValue {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_map(fields: BTreeMap<String, FirestoreValue>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &BTreeMap<String, FirestoreValue> {
        &self.fields
    }

    pub fn into_map(self) -> BTreeMap<String, FirestoreValue> {
        self.fields
    }

    pub fn to_value(&self) -> FirestoreValue {
        FirestoreValue::from_map(self.fields.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Returns the value at `path`, or `None` when absent.
    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        let segments = path.segments();
        let (last, parents) = segments.split_last()?;
        let mut current = &self.fields;
        for segment in parents {
            current = current.get(segment)?.as_map()?;
        }
        current.get(last)
    }

    /// Sets `path` to `value`, creating (or replacing non-map) intermediate
    /// fields with maps.
    pub fn set(&mut self, path: &FieldPath, value: FirestoreValue) {
        let segments = path.segments();
        let Some((last, parents)) = segments.split_last() else {
            return;
        };
        let mut current = &mut self.fields;
        for segment in parents {
            let entry = current
                .entry(segment.clone())
                .or_insert_with(FirestoreValue::empty_map);
            if !entry.is_map() {
                *entry = FirestoreValue::empty_map();
            }
            current = match entry.as_map_mut() {
                Some(map) => map,
                None => return,
            };
        }
        current.insert(last.clone(), value);
    }

    /// Removes the field at `path`. Missing parents make this a no-op.
    pub fn delete(&mut self, path: &FieldPath) {
        let segments = path.segments();
        let Some((last, parents)) = segments.split_last() else {
            return;
        };
        let mut current = &mut self.fields;
        for segment in parents {
            current = match current.get_mut(segment).and_then(FirestoreValue::as_map_mut) {
                Some(map) => map,
                None => return,
            };
        }
        current.remove(last);
    }

    /// Applies a batch of sets (`Some`) and deletes (`None`).
    pub fn set_all<'a, I>(&mut self, updates: I)
    where
        I: IntoIterator<Item = (&'a FieldPath, &'a Option<FirestoreValue>)>,
    {
        for (path, value) in updates {
            match value {
                Some(value) => self.set(path, value.clone()),
                None => self.delete(path),
            }
        }
    }

    /// Leaf paths of the object. Empty nested maps count as leaves.
    pub fn field_mask(&self) -> FieldMask {
        let mut paths = Vec::new();
        collect_leaf_paths(&self.fields, &mut Vec::new(), &mut paths);
        FieldMask::new(paths)
    }

    pub fn estimate_byte_size(&self) -> usize {
        self.fields
            .iter()
            .map(|(key, value)| key.len() * 2 + estimate_byte_size(value))
            .sum()
    }
}

fn collect_leaf_paths(
    fields: &BTreeMap<String, FirestoreValue>,
    prefix: &mut Vec<String>,
    out: &mut Vec<FieldPath>,
) {
    for (key, value) in fields {
        prefix.push(key.clone());
        match value.kind() {
            ValueKind::Map(nested) if !nested.is_empty() => {
                collect_leaf_paths(nested.fields(), prefix, out);
            }
            _ => out.push(FieldPath::from_segments_unchecked(prefix.clone())),
        }
        prefix.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(text: &str) -> FieldPath {
        FieldPath::from_dot_separated(text).unwrap()
    }

    #[test]
    fn set_creates_intermediate_maps() {
        let mut object = ObjectValue::empty();
        object.set(&path("a.b.c"), FirestoreValue::from_integer(1));
        assert_eq!(
            object.field(&path("a.b.c")),
            Some(&FirestoreValue::from_integer(1))
        );
        assert!(object.field(&path("a.b")).unwrap().is_map());
    }

    #[test]
    fn set_replaces_non_map_parent() {
        let mut object = ObjectValue::empty();
        object.set(&path("a"), FirestoreValue::from_string("leaf"));
        object.set(&path("a.b"), FirestoreValue::from_bool(true));
        assert_eq!(object.field(&path("a.b")), Some(&FirestoreValue::from_bool(true)));
    }

    #[test]
    fn delete_ignores_missing_parents() {
        let mut object = ObjectValue::empty();
        object.set(&path("a.b"), FirestoreValue::from_integer(1));
        object.delete(&path("x.y"));
        object.delete(&path("a.b"));
        assert!(object.field(&path("a.b")).is_none());
        assert!(object.field(&path("a")).is_some());
    }

    #[test]
    fn set_all_applies_sets_and_deletes() {
        let mut object = ObjectValue::empty();
        object.set(&path("old"), FirestoreValue::from_integer(1));
        let updates = vec![
            (path("old"), None),
            (path("new.x"), Some(FirestoreValue::from_integer(2))),
        ];
        object.set_all(updates.iter().map(|(p, v)| (p, v)));
        assert!(object.field(&path("old")).is_none());
        assert_eq!(object.field(&path("new.x")), Some(&FirestoreValue::from_integer(2)));
    }

    #[test]
    fn field_mask_lists_leaves() {
        let mut object = ObjectValue::empty();
        object.set(&path("a.b"), FirestoreValue::from_integer(1));
        object.set(&path("a.c"), FirestoreValue::empty_map());
        object.set(&path("d"), FirestoreValue::null());
        let mask = object.field_mask();
        let fields: Vec<String> = mask.fields().map(|f| f.canonical_string()).collect();
        assert_eq!(fields, vec!["a.b", "a.c", "d"]);
    }
}
