use crate::firestore::value::FirestoreValue;

#[derive(Clone, Debug, PartialEq)]
pub struct ArrayValue {
    values: Vec<FirestoreValue>,
}

impl ArrayValue {
    pub fn new(values: Vec<FirestoreValue>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[FirestoreValue] {
        &self.values
    }

    pub fn into_values(self) -> Vec<FirestoreValue> {
        self.values
    }

    /// Whether any element equals `needle` under value equality.
    pub fn contains(&self, needle: &FirestoreValue) -> bool {
        self.values.iter().any(|value| value == needle)
    }
}
