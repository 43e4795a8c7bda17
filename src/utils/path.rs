use std::path::PathBuf;

/// Turn a remote-supplied file name into a safe relative path.
///
/// Separators are normalized, `.`/`..` components dropped and every
/// component stripped down to alphanumerics plus `.-_ `. Never returns an
/// empty or absolute path.
pub fn sanitize_relative_path(name: &str) -> PathBuf {
    let normalized = name.replace('\\', "/");
    let mut result = PathBuf::new();

    for part in normalized.split('/').filter(|s| !s.is_empty()) {
        if matches!(part, "." | "..") {
            continue;
        }
        let safe: String = part
            .chars()
            .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' '))
            .collect();
        // A component of only dots would walk upwards again.
        if !safe.is_empty() && !safe.chars().all(|c| c == '.') {
            result.push(safe);
        }
    }

    if result.as_os_str().is_empty() {
        PathBuf::from("file")
    } else {
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_relative_path() {
        assert_eq!(sanitize_relative_path("report.pdf"), PathBuf::from("report.pdf"));
        assert_eq!(sanitize_relative_path("../../etc/passwd"), PathBuf::from("etc/passwd"));
        assert_eq!(sanitize_relative_path("C:\\Users\\me\\a.txt"), PathBuf::from("C/Users/me/a.txt"));
        assert_eq!(sanitize_relative_path("/abs/x"), PathBuf::from("abs/x"));
        assert_eq!(sanitize_relative_path("bad<>|name?.txt"), PathBuf::from("badname.txt"));
        assert_eq!(sanitize_relative_path(""), PathBuf::from("file"));
        assert_eq!(sanitize_relative_path("../.."), PathBuf::from("file"));
        assert_eq!(sanitize_relative_path("a/.../b"), PathBuf::from("a/b"));
    }
}
