use std::collections::BTreeSet;

use crate::firestore::model::FieldPath;

/// Set of field paths touched by a patch or covered by an overlay.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldMask {
    fields: BTreeSet<FieldPath>,
}

impl FieldMask {
    pub fn new<I>(fields: I) -> Self
    where
        I: IntoIterator<Item = FieldPath>,
    {
        Self {
            fields: fields.into_iter().collect(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldPath> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Whether `path` is one of the mask's fields or nested beneath one.
    pub fn covers(&self, path: &FieldPath) -> bool {
        self.fields.iter().any(|field| field.is_prefix_of(path))
    }

    pub fn union_with<I>(&self, extra: I) -> Self
    where
        I: IntoIterator<Item = FieldPath>,
    {
        let mut fields = self.fields.clone();
        fields.extend(extra);
        Self { fields }
    }
}
