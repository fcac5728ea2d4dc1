//! Registry path handling.
//!
//! The host registry addresses objects with slash-delimited paths which may
//! carry a leading or trailing slash. Storage keys never do.

use camino::{Utf8Path, Utf8PathBuf};

/// Normalize a registry path into a storage key.
///
/// Strips leading and trailing slashes and performs no other validation:
/// interior separators, `..` components and arbitrary characters are kept.
///
/// ```rust
/// use storage_driver::normalize;
///
/// assert_eq!(normalize("/a/b/").as_str(), "a/b");
/// assert_eq!(normalize(normalize("/a/b/").as_str()).as_str(), "a/b");
/// assert_eq!(normalize("/").as_str(), "");
/// ```
pub fn normalize(path: &str) -> &Utf8Path {
    Utf8Path::new(path.trim_matches('/'))
}

/// Prefix a normalized path with an optional virtual root.
///
/// An empty `path` addresses the root itself.
pub fn rooted(root: &Utf8Path, path: &Utf8Path) -> Utf8PathBuf {
    if root.as_str().is_empty() {
        path.to_owned()
    } else if path.as_str().is_empty() {
        root.to_owned()
    } else {
        root.join(path)
    }
}

/// Remove a virtual root from a storage key, returning `None` when the key
/// lives outside of the root.
pub fn unrooted<'k>(root: &Utf8Path, key: &'k str) -> Option<&'k str> {
    if root.as_str().is_empty() {
        return Some(key);
    }

    key.strip_prefix(root.as_str())
        .and_then(|rest| rest.strip_prefix('/'))
}

/// The prefix used to list the contents of a directory path.
///
/// A non-empty directory is listed as `dir/`, so `a` never matches `ab/...`.
pub fn directory_prefix(path: &Utf8Path) -> String {
    if path.as_str().is_empty() {
        String::new()
    } else {
        format!("{path}/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_slashes() {
        assert_eq!(normalize("/a/b/").as_str(), "a/b");
        assert_eq!(normalize("a/b").as_str(), "a/b");
        assert_eq!(normalize("/a").as_str(), "a");
        assert_eq!(normalize("a/").as_str(), "a");
        assert_eq!(normalize("").as_str(), "");
    }

    #[test]
    fn idempotent() {
        for path in ["/a/b/", "//a//", "x", "", "/", "repositories/library/ubuntu/_index_images"] {
            let once = normalize(path);
            assert_eq!(normalize(once.as_str()), once, "path: {path:?}");
        }
    }

    #[test]
    fn keeps_interior() {
        assert_eq!(normalize("/a//b/../c/").as_str(), "a//b/../c");
    }

    #[test]
    fn root_prefixing() {
        let root = Utf8Path::new("registry");
        assert_eq!(rooted(root, Utf8Path::new("a/b")), "registry/a/b");
        assert_eq!(rooted(root, Utf8Path::new("")), "registry");
        assert_eq!(rooted(Utf8Path::new(""), Utf8Path::new("a/b")), "a/b");

        assert_eq!(unrooted(root, "registry/a/b"), Some("a/b"));
        assert_eq!(unrooted(root, "registryx/a"), None);
        assert_eq!(unrooted(Utf8Path::new(""), "a/b"), Some("a/b"));
    }

    #[test]
    fn directory_prefixes() {
        assert_eq!(directory_prefix(Utf8Path::new("a")), "a/");
        assert_eq!(directory_prefix(Utf8Path::new("")), "");
    }
}
