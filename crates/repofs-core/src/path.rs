// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Validated repository-relative paths
//!
//! Paths crossing the OS boundary arrive as wide strings and are converted to
//! UTF-8 before they reach this type. Internally a `RepoPath` is always
//! relative, `/`-separated, and free of `.`/`..` components; the empty path
//! denotes the mount root. Equality is byte-exact.

use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PathError {
    #[error("absolute paths are not allowed: {0}")]
    Absolute(String),
    #[error("path contains a forbidden component: {0}")]
    ForbiddenComponent(String),
    #[error("path contains an embedded NUL byte")]
    EmbeddedNul,
    #[error("path is not valid UTF-8")]
    NotUtf8,
}

/// Borrowed repository-relative path slice.
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct RepoPath(str);

/// Owned repository-relative path.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RepoPathBuf(String);

impl RepoPath {
    /// The mount root.
    pub fn root() -> &'static RepoPath {
        RepoPath::from_valid("")
    }

    fn from_valid(s: &str) -> &RepoPath {
        // Safety: RepoPath is a transparent wrapper over str.
        unsafe { &*(s as *const str as *const RepoPath) }
    }

    pub fn parse(s: &str) -> Result<&RepoPath, PathError> {
        validate(s)?;
        Ok(Self::from_valid(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|c| !c.is_empty())
    }

    /// Final path component, or `None` for the root.
    pub fn basename(&self) -> Option<&str> {
        self.components().last()
    }

    /// Everything up to the final component; the root's parent is `None`.
    pub fn parent(&self) -> Option<&RepoPath> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(pos) => Some(Self::from_valid(&self.0[..pos])),
            None => Some(RepoPath::root()),
        }
    }

    pub fn join(&self, component: &str) -> RepoPathBuf {
        if self.is_root() {
            RepoPathBuf(component.to_string())
        } else {
            RepoPathBuf(format!("{}/{}", &self.0, component))
        }
    }

    pub fn to_owned(&self) -> RepoPathBuf {
        RepoPathBuf(self.0.to_string())
    }
}

impl RepoPathBuf {
    pub fn root() -> Self {
        Self(String::new())
    }

    pub fn parse(s: impl Into<String>) -> Result<Self, PathError> {
        let s = s.into();
        validate(&s)?;
        Ok(Self(s))
    }

    /// Convert a path that arrived from the OS with `\` separators.
    pub fn from_wide_separators(s: &str) -> Result<Self, PathError> {
        Self::parse(s.replace('\\', "/"))
    }

    pub fn as_repo_path(&self) -> &RepoPath {
        RepoPath::from_valid(&self.0)
    }
}

fn validate(s: &str) -> Result<(), PathError> {
    if s.starts_with('/') || s.starts_with('\\') || s.contains(':') {
        return Err(PathError::Absolute(s.to_string()));
    }
    if s.bytes().any(|b| b == 0) {
        return Err(PathError::EmbeddedNul);
    }
    for component in s.split('/') {
        if !s.is_empty() && (component.is_empty() || component == "." || component == "..") {
            return Err(PathError::ForbiddenComponent(s.to_string()));
        }
    }
    Ok(())
}

impl Deref for RepoPathBuf {
    type Target = RepoPath;

    fn deref(&self) -> &RepoPath {
        self.as_repo_path()
    }
}

impl Borrow<RepoPath> for RepoPathBuf {
    fn borrow(&self) -> &RepoPath {
        self.as_repo_path()
    }
}

impl AsRef<RepoPath> for RepoPathBuf {
    fn as_ref(&self) -> &RepoPath {
        self.as_repo_path()
    }
}

impl AsRef<RepoPath> for RepoPath {
    fn as_ref(&self) -> &RepoPath {
        self
    }
}

impl PartialEq<RepoPath> for RepoPathBuf {
    fn eq(&self, other: &RepoPath) -> bool {
        self.as_repo_path() == other
    }
}

impl fmt::Display for RepoPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            f.write_str("<root>")
        } else {
            f.write_str(&self.0)
        }
    }
}

impl fmt::Display for RepoPathBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.as_repo_path(), f)
    }
}

impl fmt::Debug for RepoPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RepoPath({:?})", &self.0)
    }
}

impl fmt::Debug for RepoPathBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RepoPathBuf({:?})", &self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_path() {
        let root = RepoPathBuf::root();
        assert!(root.is_root());
        assert_eq!(root.parent(), None);
        assert_eq!(root.basename(), None);
    }

    #[test]
    fn parse_rejects_absolute() {
        assert!(matches!(
            RepoPathBuf::parse("/etc/passwd"),
            Err(PathError::Absolute(_))
        ));
        assert!(matches!(
            RepoPathBuf::parse("C:\\repo"),
            Err(PathError::Absolute(_))
        ));
    }

    #[test]
    fn parse_rejects_dot_components() {
        assert!(RepoPathBuf::parse("a/../b").is_err());
        assert!(RepoPathBuf::parse("./a").is_err());
        assert!(RepoPathBuf::parse("a//b").is_err());
    }

    #[test]
    fn parent_and_basename() {
        let p = RepoPathBuf::parse("src/lib/io.rs").unwrap();
        assert_eq!(p.basename(), Some("io.rs"));
        assert_eq!(p.parent().unwrap().as_str(), "src/lib");
        let top = RepoPathBuf::parse("README").unwrap();
        assert!(top.parent().unwrap().is_root());
    }

    #[test]
    fn wide_separator_conversion() {
        let p = RepoPathBuf::from_wide_separators("dir\\sub\\file.txt").unwrap();
        assert_eq!(p.as_str(), "dir/sub/file.txt");
    }

    #[test]
    fn join_from_root() {
        assert_eq!(RepoPath::root().join("a").as_str(), "a");
        let a = RepoPathBuf::parse("a").unwrap();
        assert_eq!(a.join("b").as_str(), "a/b");
    }
}
