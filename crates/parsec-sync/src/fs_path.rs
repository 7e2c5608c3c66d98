//! A pathlib-like absolute path within a single workspace (spec §4.4,
//! grounded in `original_source/parsec/core/fs/workspacefs/workspacefs.py`'s
//! pathlib-style interface, re-expressed as a typed value instead of a
//! string subclass).

use std::fmt;

use parsec_core::ids::EntryName;

/// An absolute path rooted at the workspace root, e.g. `/docs/report.txt`.
/// The root itself is the empty path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FsPath {
    parts: Vec<EntryName>,
}

#[derive(Debug, thiserror::Error)]
pub enum FsPathError {
    #[error("path component is invalid: {0}")]
    InvalidComponent(String),
}

impl FsPath {
    pub fn root() -> Self {
        Self { parts: Vec::new() }
    }

    pub fn parse(raw: &str) -> Result<Self, FsPathError> {
        let mut parts = Vec::new();
        for component in raw.split('/') {
            if component.is_empty() || component == "." {
                continue;
            }
            let name = EntryName::new(component)
                .map_err(|_| FsPathError::InvalidComponent(component.to_string()))?;
            parts.push(name);
        }
        Ok(Self { parts })
    }

    pub fn is_root(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn name(&self) -> Option<&EntryName> {
        self.parts.last()
    }

    /// `None` for the root (it has no parent within the workspace).
    pub fn parent(&self) -> Option<FsPath> {
        if self.parts.is_empty() {
            return None;
        }
        Some(Self {
            parts: self.parts[..self.parts.len() - 1].to_vec(),
        })
    }

    pub fn child(&self, name: EntryName) -> FsPath {
        let mut parts = self.parts.clone();
        parts.push(name);
        Self { parts }
    }

    pub fn parts(&self) -> &[EntryName] {
        &self.parts
    }

    pub fn depth(&self) -> usize {
        self.parts.len()
    }
}

impl fmt::Display for FsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/")?;
        for (i, part) in self.parts.iter().enumerate() {
            if i > 0 {
                write!(f, "/")?;
            }
            write!(f, "{part}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_displays_round_trip() {
        let p = FsPath::parse("/docs/report.txt").unwrap();
        assert_eq!(p.to_string(), "/docs/report.txt");
        assert_eq!(p.name().unwrap().as_str(), "report.txt");
        assert_eq!(p.depth(), 2);
    }

    #[test]
    fn root_has_no_parent_and_no_name() {
        let root = FsPath::root();
        assert!(root.is_root());
        assert!(root.parent().is_none());
        assert!(root.name().is_none());
    }

    #[test]
    fn parent_of_child_strips_last_component() {
        let p = FsPath::parse("/a/b/c").unwrap();
        let parent = p.parent().unwrap();
        assert_eq!(parent.to_string(), "/a/b");
    }

    #[test]
    fn rejects_empty_component() {
        assert!(FsPath::parse("/a//b").is_ok()); // collapsed, not rejected
        assert!(FsPath::parse("/a/b/").unwrap().to_string() == "/a/b");
    }
}
