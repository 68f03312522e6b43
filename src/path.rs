//! Logical path handling.

/// A forward-slash-rooted, case-sensitive, normalized path as seen by the mount.
///
/// `/` is the root and always exists. Normalization collapses repeated slashes,
/// strips a trailing slash (except for the root itself), and rejects `.`/`..`
/// segments -- the shim is expected to resolve those before calling into the core.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ApiPath(String);

impl ApiPath {
    pub const ROOT: &'static str = "/";

    /// Normalize and wrap a path. Returns `None` if the path contains a `.`/`..`
    /// segment or is not rooted.
    pub fn new(raw: &str) -> Option<Self> {
        if !raw.starts_with('/') {
            return None;
        }
        let mut segments = Vec::new();
        for segment in raw.split('/') {
            match segment {
                "" => continue,
                "." | ".." => return None,
                other => segments.push(other),
            }
        }
        if segments.is_empty() {
            return Some(Self(Self::ROOT.to_string()));
        }
        Some(Self(format!("/{}", segments.join("/"))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == Self::ROOT
    }

    /// The parent directory's api_path. The root has no parent.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) => Some(Self(Self::ROOT.to_string())),
            Some(idx) => Some(Self(self.0[..idx].to_string())),
            None => None,
        }
    }

    /// The final path segment (file or directory name).
    pub fn name(&self) -> &str {
        if self.is_root() {
            return "";
        }
        match self.0.rfind('/') {
            Some(idx) => &self.0[idx + 1..],
            None => &self.0,
        }
    }

    /// Build a child path of this directory.
    pub fn join(&self, name: &str) -> Self {
        if self.is_root() {
            Self(format!("/{name}"))
        } else {
            Self(format!("{}/{name}", self.0))
        }
    }

    /// `true` if `self` is `other` or a descendant of `other`.
    pub fn is_under(&self, other: &ApiPath) -> bool {
        if other.is_root() {
            return true;
        }
        self.0 == other.0 || self.0.starts_with(&format!("{}/", other.0))
    }
}

impl std::fmt::Display for ApiPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ApiPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_repeated_slashes() {
        assert_eq!(ApiPath::new("//a//b/").unwrap().as_str(), "/a/b");
    }

    #[test]
    fn rejects_dot_segments() {
        assert!(ApiPath::new("/a/../b").is_none());
        assert!(ApiPath::new("/a/./b").is_none());
    }

    #[test]
    fn root_has_no_parent() {
        assert!(ApiPath::new("/").unwrap().parent().is_none());
    }

    #[test]
    fn parent_of_top_level_is_root() {
        assert_eq!(ApiPath::new("/a").unwrap().parent().unwrap().as_str(), "/");
    }

    #[test]
    fn is_under_matches_self_and_descendants() {
        let dir = ApiPath::new("/a/b").unwrap();
        assert!(ApiPath::new("/a/b").unwrap().is_under(&dir));
        assert!(ApiPath::new("/a/b/c").unwrap().is_under(&dir));
        assert!(!ApiPath::new("/a/bc").unwrap().is_under(&dir));
    }

    #[test]
    fn join_builds_child_path() {
        assert_eq!(ApiPath::new("/").unwrap().join("a").as_str(), "/a");
        assert_eq!(ApiPath::new("/a").unwrap().join("b").as_str(), "/a/b");
    }
}
