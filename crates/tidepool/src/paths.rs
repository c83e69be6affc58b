//! Lexical path handling for sandbox paths.
//!
//! Sandbox paths are POSIX paths inside the container and never touch the
//! host filesystem, so all of this is plain string manipulation.

/// Resolve `path` against `workdir` and normalize `.` and `..` segments.
///
/// Absolute paths ignore `workdir`. `..` never climbs above `/`.
pub fn resolve(workdir: &str, path: &str) -> String {
    let path = path.trim();
    let joined = if path.starts_with('/') {
        path.to_string()
    } else if path.is_empty() {
        workdir.to_string()
    } else {
        format!("{}/{}", workdir.trim_end_matches('/'), path)
    };
    normalize(&joined)
}

/// Normalize an absolute path.
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Render an absolute sandbox path relative to `workdir`.
///
/// Paths outside the working directory stay absolute. The working directory
/// itself renders as `.`.
pub fn relative_to(workdir: &str, path: &str) -> String {
    let workdir = normalize(workdir);
    let path = normalize(path);
    if path == workdir {
        return ".".to_string();
    }
    let prefix = if workdir == "/" {
        "/".to_string()
    } else {
        format!("{workdir}/")
    };
    match path.strip_prefix(&prefix) {
        Some(rest) => rest.to_string(),
        None => path,
    }
}

/// Parent directory of a normalized absolute path.
pub fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Final component of a normalized absolute path.
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Whether a caller-supplied path contains a parent-directory segment.
pub fn has_traversal(path: &str) -> bool {
    path.split(['/', '\\']).any(|segment| segment == "..")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_relative() {
        assert_eq!(resolve("/work", "out/report.csv"), "/work/out/report.csv");
        assert_eq!(resolve("/work/", "./a.txt"), "/work/a.txt");
        assert_eq!(resolve("/work", ""), "/work");
        assert_eq!(resolve("/work", "."), "/work");
    }

    #[test]
    fn test_resolve_absolute_ignores_workdir() {
        assert_eq!(resolve("/work", "/tmp/x"), "/tmp/x");
    }

    #[test]
    fn test_resolve_never_climbs_above_root() {
        assert_eq!(resolve("/work", "../../../etc/passwd"), "/etc/passwd");
        assert_eq!(resolve("/", ".."), "/");
    }

    #[test]
    fn test_relative_to() {
        assert_eq!(relative_to("/work", "/work/a/b.txt"), "a/b.txt");
        assert_eq!(relative_to("/work", "/work"), ".");
        assert_eq!(relative_to("/work", "/workspace/x"), "/workspace/x");
        assert_eq!(relative_to("/", "/etc/hosts"), "etc/hosts");
    }

    #[test]
    fn test_parent_and_file_name() {
        assert_eq!(parent("/work/a/b.txt"), "/work/a");
        assert_eq!(parent("/work"), "/");
        assert_eq!(parent("/"), "/");
        assert_eq!(file_name("/work/a/b.txt"), "b.txt");
    }

    #[test]
    fn test_has_traversal() {
        assert!(has_traversal("../secrets"));
        assert!(has_traversal("data/../../x"));
        assert!(has_traversal("..\\windows"));
        assert!(!has_traversal("data/..hidden/file"));
        assert!(!has_traversal("report..csv"));
    }
}
