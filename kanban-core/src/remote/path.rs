/// Key paths into the replicated store.
///
/// A path is a list of segments rendered as `a/b/c`. Constructors never fail;
/// store implementations call [`StorePath::validate`] before touching data,
/// so an id containing `/` or reserved characters is rejected at the store
/// boundary instead of silently addressing another node.
use std::fmt;

use super::RemoteError;

const RESERVED: &[char] = &['.', '#', '$', '[', ']', '/'];

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct StorePath {
    segments: Vec<String>,
}

impl StorePath {
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse a `/`-separated path. Empty segments are ignored.
    pub fn parse(raw: &str) -> Result<Self, RemoteError> {
        let path = Self {
            segments: raw
                .split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        };
        path.validate()?;
        Ok(path)
    }

    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    /// Append every segment of `relative`.
    pub fn join(&self, relative: &StorePath) -> Self {
        let mut segments = self.segments.clone();
        segments.extend(relative.segments.iter().cloned());
        Self { segments }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn parent(&self) -> Option<StorePath> {
        if self.segments.is_empty() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    pub fn last(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// True when `other` is this path or lies below it.
    pub fn contains(&self, other: &StorePath) -> bool {
        other.segments.len() >= self.segments.len()
            && self.segments.iter().zip(&other.segments).all(|(a, b)| a == b)
    }

    /// True when a write at one path can change the value seen at the other.
    pub fn overlaps(&self, other: &StorePath) -> bool {
        self.contains(other) || other.contains(self)
    }

    pub fn validate(&self) -> Result<(), RemoteError> {
        for segment in &self.segments {
            if segment.is_empty() {
                return Err(self.invalid("empty segment"));
            }
            if segment.chars().any(|c| RESERVED.contains(&c) || c.is_control()) {
                return Err(self.invalid(&format!("segment '{}' contains a reserved character", segment)));
            }
        }
        Ok(())
    }

    /// Check that `id` addresses exactly one child: non-empty, no `/`, no
    /// reserved characters. Needed wherever an id is spliced into a
    /// multi-path update key, since [`StorePath::parse`] would split it.
    pub fn check_segment(id: &str) -> Result<(), RemoteError> {
        Self::root().child(id).validate()
    }

    fn invalid(&self, reason: &str) -> RemoteError {
        RemoteError::InvalidPath {
            path: self.to_string(),
            reason: reason.to_string(),
        }
    }

    // ── Persisted layout ────────────────────────────────────────────────────

    pub fn board() -> Self {
        Self::root().child("board")
    }

    pub fn columns() -> Self {
        Self::board().child("columns")
    }

    pub fn column(column_id: &str) -> Self {
        Self::columns().child(column_id)
    }

    pub fn tasks() -> Self {
        Self::board().child("tasks")
    }

    pub fn task(task_id: &str) -> Self {
        Self::tasks().child(task_id)
    }

    pub fn column_order() -> Self {
        Self::board().child("columnOrder")
    }

    pub fn presence_root() -> Self {
        Self::root().child("presence")
    }

    pub fn presence(session_id: &str) -> Self {
        Self::presence_root().child(session_id)
    }

    pub fn users() -> Self {
        Self::root().child("users")
    }

    pub fn user(user_id: &str) -> Self {
        Self::users().child(user_id)
    }

    pub fn labels() -> Self {
        Self::root().child("labels")
    }

    pub fn label(label_id: &str) -> Self {
        Self::labels().child(label_id)
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ignores_empty_segments() {
        let path = StorePath::parse("/board//columns/c1/").unwrap();
        assert_eq!(path.segments(), &["board", "columns", "c1"]);
        assert_eq!(path.to_string(), "board/columns/c1");
        assert!(StorePath::parse("").unwrap().is_root());
    }

    #[test]
    fn test_parse_rejects_reserved_characters() {
        assert!(StorePath::parse("board/col.1").is_err());
        assert!(StorePath::parse("board/$x").is_err());
        assert!(StorePath::parse("a/b[0]").is_err());
    }

    #[test]
    fn test_child_with_slash_fails_validation() {
        let path = StorePath::column("a/b");
        assert!(matches!(path.validate(), Err(RemoteError::InvalidPath { .. })));
    }

    #[test]
    fn test_check_segment() {
        assert!(StorePath::check_segment("task-1").is_ok());
        assert!(StorePath::check_segment("").is_err());
        assert!(StorePath::check_segment("t1/description").is_err());
        assert!(StorePath::check_segment("a.b").is_err());
    }

    #[test]
    fn test_contains_and_overlaps() {
        let board = StorePath::board();
        let column = StorePath::column("c1");
        assert!(board.contains(&column));
        assert!(!column.contains(&board));
        assert!(column.overlaps(&board));
        assert!(!StorePath::task("t1").overlaps(&column));
        assert!(StorePath::root().contains(&column));
    }

    #[test]
    fn test_layout_paths() {
        assert_eq!(StorePath::column_order().to_string(), "board/columnOrder");
        assert_eq!(StorePath::task("t1").to_string(), "board/tasks/t1");
        assert_eq!(StorePath::presence("s1").to_string(), "presence/s1");
        assert_eq!(StorePath::label("l1").to_string(), "labels/l1");
        assert_eq!(StorePath::user("u1").parent(), Some(StorePath::users()));
    }
}
