//! Bus object path value type.
//!
//! Paths are built from slash-separated segments. The empty path renders as
//! `/`, and appending a segment never produces doubled slashes, so paths can
//! be concatenated mechanically while walking the object tree.

use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectPath {
    path: String,
}

impl ObjectPath {
    /// The root path, `/`.
    pub fn root() -> ObjectPath {
        ObjectPath::default()
    }

    /// Build a path from an existing string, normalizing leading slashes.
    pub fn new(path: &str) -> ObjectPath {
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            ObjectPath::root()
        } else {
            ObjectPath {
                path: format!("/{}", trimmed),
            }
        }
    }

    /// Append one or more segments, returning the extended path.
    pub fn append(&self, node: &str) -> ObjectPath {
        let node = node.trim_matches('/');
        if node.is_empty() {
            return self.clone();
        }
        ObjectPath {
            path: format!("{}/{}", self.path, node),
        }
    }

    pub fn as_str(&self) -> &str {
        if self.path.is_empty() {
            "/"
        } else {
            &self.path
        }
    }

    pub fn is_root(&self) -> bool {
        self.path.is_empty()
    }

    /// True when every segment is a legal bus path element.
    pub fn is_valid_segment(segment: &str) -> bool {
        !segment.is_empty()
            && segment
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_')
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for ObjectPath {
    fn from(path: &str) -> ObjectPath {
        ObjectPath::new(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_renders_as_slash() {
        assert_eq!(ObjectPath::root().as_str(), "/");
        assert!(ObjectPath::root().is_root());
    }

    #[test]
    fn test_append_builds_full_path() {
        let path = ObjectPath::root().append("com").append("demo").append("device");
        assert_eq!(path.as_str(), "/com/demo/device");
    }

    #[test]
    fn test_append_empty_is_identity() {
        let path = ObjectPath::new("/com/demo");
        assert_eq!(path.append("").as_str(), "/com/demo");
    }

    #[test]
    fn test_new_normalizes_slashes() {
        assert_eq!(ObjectPath::new("com/demo/").as_str(), "/com/demo");
        assert_eq!(ObjectPath::new("/").as_str(), "/");
    }

    #[test]
    fn test_segment_validation() {
        assert!(ObjectPath::is_valid_segment("mfgr_name"));
        assert!(ObjectPath::is_valid_segment("level2"));
        assert!(!ObjectPath::is_valid_segment(""));
        assert!(!ObjectPath::is_valid_segment("has-dash"));
        assert!(!ObjectPath::is_valid_segment("has space"));
    }
}
