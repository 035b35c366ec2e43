use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::resource_path::compare_segments;

pub const DOCUMENT_KEY_NAME: &str = "__name__";

/// Dot-separated path to a field inside a document.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    pub fn new<S, I>(segments: I) -> FirestoreResult<Self>
    where
        S: Into<String>,
        I: IntoIterator<Item = S>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() {
            return Err(invalid_argument(
                "FieldPath must contain at least one segment",
            ));
        }
        if segments.iter().any(String::is_empty) {
            return Err(invalid_argument("FieldPath segments must not be empty"));
        }
        Ok(Self { segments })
    }

    /// Builds a path from trusted segments. Callers guarantee non-emptiness.
    pub(crate) fn from_segments_unchecked(segments: Vec<String>) -> Self {
        Self { segments }
    }

    /// Parses a user supplied `a.b.c` path.
    pub fn from_dot_separated(path: &str) -> FirestoreResult<Self> {
        if path.is_empty() {
            return Err(invalid_argument("FieldPath string cannot be empty"));
        }
        if path.contains(['~', '*', '/', '[', ']']) {
            return Err(invalid_argument(format!(
                "Invalid field path ({path}). Paths must not contain '~', '*', '/', '[', or ']'"
            )));
        }
        if path.starts_with('.') || path.ends_with('.') || path.contains("..") {
            return Err(invalid_argument(format!(
                "Invalid field path ({path}). Paths must not be empty, begin with '.', end with '.', or contain '..'"
            )));
        }
        FieldPath::new(path.split('.'))
    }

    /// Parses the escaped canonical form produced by [`canonical_string`](Self::canonical_string).
    pub fn from_server_format(path: &str) -> FirestoreResult<Self> {
        let mut segments = Vec::new();
        let mut current = String::new();
        let mut in_backticks = false;
        let mut chars = path.chars();
        while let Some(ch) = chars.next() {
            match ch {
                '\\' => {
                    let escaped = chars
                        .next()
                        .ok_or_else(|| invalid_argument(format!("Path has trailing escape character: {path}")))?;
                    current.push(escaped);
                }
                '`' => in_backticks = !in_backticks,
                '.' if !in_backticks => {
                    if current.is_empty() {
                        return Err(invalid_argument(format!("Invalid field path ({path})")));
                    }
                    segments.push(std::mem::take(&mut current));
                }
                other => current.push(other),
            }
        }
        if in_backticks {
            return Err(invalid_argument(format!("Unterminated ` in path: {path}")));
        }
        if current.is_empty() {
            return Err(invalid_argument(format!("Invalid field path ({path})")));
        }
        segments.push(current);
        FieldPath::new(segments)
    }

    pub fn key_path() -> Self {
        Self {
            segments: vec![DOCUMENT_KEY_NAME.to_string()],
        }
    }

    pub fn document_id() -> Self {
        Self::key_path()
    }

    pub fn is_key_field(&self) -> bool {
        self.segments.len() == 1 && self.segments[0] == DOCUMENT_KEY_NAME
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn first_segment(&self) -> &str {
        &self.segments[0]
    }

    pub fn last_segment(&self) -> &str {
        self.segments
            .last()
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    /// Returns the path with the first segment removed, or `None` if only one
    /// segment remains.
    pub fn pop_first(&self) -> Option<Self> {
        if self.segments.len() <= 1 {
            return None;
        }
        Some(Self {
            segments: self.segments[1..].to_vec(),
        })
    }

    pub fn parent(&self) -> Option<Self> {
        if self.segments.len() <= 1 {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    pub fn is_prefix_of(&self, other: &FieldPath) -> bool {
        self.len() <= other.len()
            && self
                .segments
                .iter()
                .zip(other.segments.iter())
                .all(|(l, r)| l == r)
    }

    /// Escaped form: segments that are not plain identifiers are wrapped in
    /// backticks, with `\` and `` ` `` backslash-escaped.
    pub fn canonical_string(&self) -> String {
        self.segments
            .iter()
            .map(|segment| escape_segment(segment))
            .collect::<Vec<_>>()
            .join(".")
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.segments.clone()
    }
}

fn is_identifier(segment: &str) -> bool {
    let mut chars = segment.chars();
    match chars.next() {
        Some(first) if first == '_' || first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|ch| ch == '_' || ch.is_ascii_alphanumeric())
}

fn escape_segment(segment: &str) -> String {
    if is_identifier(segment) {
        return segment.to_string();
    }
    let escaped = segment.replace('\\', "\\\\").replace('`', "\\`");
    format!("`{escaped}`")
}

impl PartialOrd for FieldPath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FieldPath {
    fn cmp(&self, other: &Self) -> Ordering {
        for (l, r) in self.segments.iter().zip(other.segments.iter()) {
            match compare_segments(l, r) {
                Ordering::Equal => continue,
                ordering => return ordering,
            }
        }
        self.len().cmp(&other.len())
    }
}

impl Display for FieldPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.canonical_string())
    }
}

/// Trait that converts common user inputs into a validated [`FieldPath`].
pub trait IntoFieldPath {
    fn into_field_path(self) -> FirestoreResult<FieldPath>;
}

impl IntoFieldPath for FieldPath {
    fn into_field_path(self) -> FirestoreResult<FieldPath> {
        Ok(self)
    }
}

impl<'a> IntoFieldPath for &'a FieldPath {
    fn into_field_path(self) -> FirestoreResult<FieldPath> {
        Ok(self.clone())
    }
}

impl IntoFieldPath for String {
    fn into_field_path(self) -> FirestoreResult<FieldPath> {
        FieldPath::from_dot_separated(&self)
    }
}

impl<'a> IntoFieldPath for &'a str {
    fn into_field_path(self) -> FirestoreResult<FieldPath> {
        FieldPath::from_dot_separated(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_dot_path() {
        let field = FieldPath::from_dot_separated("foo.bar").unwrap();
        assert_eq!(field.segments(), &["foo", "bar"]);
    }

    #[test]
    fn rejects_malformed_paths() {
        assert!(FieldPath::from_dot_separated("").is_err());
        assert!(FieldPath::from_dot_separated("a..b").is_err());
        assert!(FieldPath::from_dot_separated("a/b").is_err());
    }

    #[test]
    fn canonical_form_escapes_non_identifiers() {
        let path = FieldPath::new(["a", "b c", "d`e", "1x"]).unwrap();
        assert_eq!(path.canonical_string(), "a.`b c`.`d\\`e`.`1x`");
        let parsed = FieldPath::from_server_format(&path.canonical_string()).unwrap();
        assert_eq!(parsed, path);
    }

    #[test]
    fn key_path_detection() {
        assert!(FieldPath::key_path().is_key_field());
        assert!(!FieldPath::from_dot_separated("a.__name__").unwrap().is_key_field());
    }

    #[test]
    fn prefix_and_ordering() {
        let a = FieldPath::from_dot_separated("a").unwrap();
        let ab = FieldPath::from_dot_separated("a.b").unwrap();
        assert!(a.is_prefix_of(&ab));
        assert!(a < ab);
        assert_eq!(ab.pop_first().unwrap().canonical_string(), "b");
    }
}
