//! User path sanitizing and root-confined resolution.
//!
//! Every user-supplied path goes through [`sanitize`] before it is joined to a
//! storage root, and every join goes through [`resolve_checked`] before any
//! filesystem mutation. The string filter alone is never trusted: the checked
//! resolution rejects symlink components and compares canonical paths.

use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::ErrorKind;

use crate::error::StoreError;

/// Normalizes a raw user path into a relative, `/`-separated form.
///
/// Backslashes become separators, empty, `.` and `..` segments are dropped and
/// leading/trailing separators disappear. Inputs that cannot be interpreted
/// unambiguously (NUL or control characters, drive prefixes) are rejected.
/// The empty string denotes the root itself.
pub fn sanitize(raw: &str) -> Result<String, StoreError> {
    if raw.chars().any(|c| c.is_control()) {
        return Err(StoreError::InvalidPath);
    }
    let unified = raw.replace('\\', "/");
    let mut segments = Vec::new();
    for segment in unified.split('/') {
        let segment = segment.trim();
        match segment {
            "" | "." | ".." => continue,
            _ if segment.contains(':') => return Err(StoreError::InvalidPath),
            _ => segments.push(segment),
        }
    }
    Ok(segments.join("/"))
}

/// Restricts a new entry name to the characters the drive accepts.
///
/// Folder names may contain ASCII letters, digits, `_`, `-` and spaces; file
/// names additionally allow `.`. Disallowed characters are removed. A name
/// that ends up empty or made only of dots is invalid.
pub fn sanitize_name(raw: &str, allow_dot: bool) -> Result<String, StoreError> {
    let filtered: String = raw
        .trim()
        .chars()
        .filter(|c| {
            c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ' ') || (allow_dot && *c == '.')
        })
        .collect();
    let name = filtered.trim().to_string();
    if name.is_empty() || name.chars().all(|c| c == '.') {
        return Err(StoreError::InvalidPath);
    }
    Ok(name)
}

/// Joins two sanitized relative paths.
pub fn join(parent: &str, name: &str) -> String {
    match (parent.is_empty(), name.is_empty()) {
        (true, _) => name.to_string(),
        (_, true) => parent.to_string(),
        _ => format!("{parent}/{name}"),
    }
}

/// Last segment of a sanitized relative path.
pub fn file_name(relative: &str) -> &str {
    relative.rsplit('/').next().unwrap_or(relative)
}

/// Parent of a sanitized relative path, the empty string for top-level entries.
pub fn parent(relative: &str) -> &str {
    relative.rsplit_once('/').map(|(head, _)| head).unwrap_or("")
}

/// Splits `name.ext` into (`name`, `Some(ext)`); dotfiles keep their dot.
pub fn split_extension(name: &str) -> (&str, Option<&str>) {
    match name.rfind('.') {
        Some(index) if index > 0 && index + 1 < name.len() => {
            (&name[..index], Some(&name[index + 1..]))
        }
        _ => (name, None),
    }
}

/// Whether `candidate` equals `ancestor` or lies beneath it, comparing whole
/// segments so `docs2` is not considered inside `docs`.
pub fn is_same_or_descendant(ancestor: &str, candidate: &str) -> bool {
    if ancestor.is_empty() {
        return true;
    }
    candidate == ancestor
        || candidate
            .strip_prefix(ancestor)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Resolves an already sanitized relative path under `root`, checking that no
/// component is a symlink and that the real path stays under the real root.
///
/// With `allow_missing_leaf` the trailing components may not exist yet; the
/// check then applies to the deepest existing ancestor.
pub async fn resolve_checked(
    root: &Path,
    relative: &str,
    allow_missing_leaf: bool,
) -> Result<PathBuf, StoreError> {
    if sanitize(relative)? != relative {
        return Err(StoreError::InvalidPath);
    }
    let target = if relative.is_empty() {
        root.to_path_buf()
    } else {
        root.join(relative)
    };

    let mut current = root.to_path_buf();
    let mut deepest_existing = root.to_path_buf();
    let segments: Vec<&str> = relative.split('/').filter(|s| !s.is_empty()).collect();
    for (index, segment) in segments.iter().enumerate() {
        current.push(segment);
        match fs::symlink_metadata(&current).await {
            Ok(metadata) => {
                if metadata.file_type().is_symlink() {
                    return Err(StoreError::InvalidPath);
                }
                if index + 1 < segments.len() && !metadata.is_dir() {
                    return Err(StoreError::InvalidPath);
                }
                deepest_existing.clone_from(&current);
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                if allow_missing_leaf {
                    break;
                }
                return Err(StoreError::NotFound);
            }
            Err(err) => return Err(StoreError::Io(err)),
        }
    }

    let real_root = fs::canonicalize(root).await?;
    let real = fs::canonicalize(&deepest_existing).await?;
    if !real.starts_with(&real_root) {
        return Err(StoreError::InvalidPath);
    }
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sanitize_strips_traversal_and_separators() {
        assert_eq!(sanitize("../../etc/passwd").unwrap(), "etc/passwd");
        assert_eq!(sanitize("/docs//a.txt/").unwrap(), "docs/a.txt");
        assert_eq!(sanitize("docs\\..\\b.txt").unwrap(), "docs/b.txt");
        assert_eq!(sanitize("./docs/./x").unwrap(), "docs/x");
        assert_eq!(sanitize("").unwrap(), "");
        assert_eq!(sanitize("a..b/...").unwrap(), "a..b/...");
    }

    #[test]
    fn sanitize_rejects_ambiguous_input() {
        assert!(matches!(sanitize("C:/windows"), Err(StoreError::InvalidPath)));
        assert!(matches!(sanitize("a\0b"), Err(StoreError::InvalidPath)));
        assert!(matches!(sanitize("a\nb"), Err(StoreError::InvalidPath)));
    }

    #[test]
    fn sanitize_is_idempotent() {
        let inputs = [
            "",
            "a",
            "/a/b/",
            "../a/../../b",
            "a\\b\\..\\c",
            " spaced / name ",
            "./././x",
            "deep/er/../path/file.tar.gz",
        ];
        for input in inputs {
            let once = sanitize(input).unwrap();
            assert_eq!(sanitize(&once).unwrap(), once, "input {input:?}");
        }
    }

    #[test]
    fn sanitize_name_filters_charset() {
        assert_eq!(sanitize_name(" My Folder! ", false).unwrap(), "My Folder");
        assert_eq!(sanitize_name("re/port.txt", true).unwrap(), "report.txt");
        assert_eq!(sanitize_name("a.b", false).unwrap(), "ab");
        assert!(sanitize_name("..", true).is_err());
        assert!(sanitize_name("???", true).is_err());
    }

    #[test]
    fn descendant_check_compares_whole_segments() {
        assert!(is_same_or_descendant("docs", "docs"));
        assert!(is_same_or_descendant("docs", "docs/old"));
        assert!(!is_same_or_descendant("docs", "docs2"));
        assert!(!is_same_or_descendant("docs/old", "docs"));
        assert!(is_same_or_descendant("", "anything"));
    }

    #[test]
    fn path_helpers_split_segments() {
        assert_eq!(join("", "a"), "a");
        assert_eq!(join("a", "b"), "a/b");
        assert_eq!(file_name("a/b/c.txt"), "c.txt");
        assert_eq!(parent("a/b/c.txt"), "a/b");
        assert_eq!(parent("c.txt"), "");
        assert_eq!(split_extension("report.txt"), ("report", Some("txt")));
        assert_eq!(split_extension(".env"), (".env", None));
        assert_eq!(split_extension("archive"), ("archive", None));
    }

    #[tokio::test]
    async fn resolved_paths_stay_under_root() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("root");
        std::fs::create_dir_all(root.join("docs")).expect("create docs");
        let hostile = ["../../outside", "/etc/passwd", "docs/../../x", "..\\..\\y"];
        for raw in hostile {
            let relative = sanitize(raw).unwrap();
            let resolved = resolve_checked(&root, &relative, true).await.unwrap();
            assert!(resolved.starts_with(&root), "{raw:?} escaped");
        }
    }

    #[tokio::test]
    async fn resolve_rejects_unsanitized_input() {
        let temp = tempdir().expect("tempdir");
        let result = resolve_checked(temp.path(), "../x", true).await;
        assert!(matches!(result, Err(StoreError::InvalidPath)));
    }

    #[tokio::test]
    async fn resolve_reports_missing_when_leaf_required() {
        let temp = tempdir().expect("tempdir");
        let result = resolve_checked(temp.path(), "nope.txt", false).await;
        assert!(matches!(result, Err(StoreError::NotFound)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn resolve_rejects_symlink() {
        use std::os::unix::fs::symlink;

        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("root");
        std::fs::create_dir_all(&root).expect("create root");

        let outside = temp.path().join("outside.txt");
        std::fs::write(&outside, b"secret").expect("write outside file");
        symlink(&outside, root.join("link")).expect("symlink");

        let result = resolve_checked(&root, "link", false).await;
        assert!(matches!(result, Err(StoreError::InvalidPath)));
    }
}
