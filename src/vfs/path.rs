//! Canonical path handling for the virtual namespace.
//!
//! Canonical form: forward-slash separator, single leading slash, no
//! trailing slash except for the root itself. Comparison is
//! case-insensitive, case-preserving.

use once_cell::sync::Lazy;
use std::collections::HashSet;

/// Characters Windows forbids in names; replaced by `_` during
/// sanitisation.
const FORBIDDEN: [char; 9] = ['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

static RESERVED_STEMS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7",
        "COM8", "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
    ]
    .into_iter()
    .collect()
});

const MAX_NAME_CHARS: usize = 255;

/// Normalise any incoming path to canonical form. `..` resolves
/// upwards and can never escape the root.
pub fn canonicalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return "/".to_string();
    }
    let mut out = String::with_capacity(path.len() + 1);
    for part in parts {
        out.push('/');
        out.push_str(part);
    }
    out
}

/// Non-empty segments of a canonical path.
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Parent of a canonical path; `None` for the root.
pub fn parent(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Final segment of a canonical path; empty for the root.
pub fn leaf(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or("")
}

pub fn join(parent: &str, leaf: &str) -> String {
    if parent == "/" {
        format!("/{}", leaf)
    } else {
        format!("{}/{}", parent, leaf)
    }
}

/// Case-insensitive name equality.
pub fn eq_ci(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.to_lowercase()
}

/// Lowercased form used as a lookup key.
pub fn fold(path: &str) -> String {
    path.to_lowercase()
}

/// Whether `path` equals `prefix` or lies underneath it,
/// case-insensitively. Both must be canonical.
pub fn starts_with_ci(path: &str, prefix: &str) -> bool {
    let path = fold(path);
    let prefix = fold(prefix);
    if prefix == "/" {
        return true;
    }
    path == prefix || path.starts_with(&format!("{}/", prefix))
}

/// Rewrite `path` so that the `old` prefix becomes `new`. Returns
/// `None` when `path` is not under `old`.
pub fn reparent(path: &str, old: &str, new: &str) -> Option<String> {
    if !starts_with_ci(path, old) {
        return None;
    }
    if path.len() == old.len() {
        return Some(new.to_string());
    }
    Some(format!("{}{}", new, &path[old.len()..]))
}

/// Sanitise a single leaf name:
/// forbidden characters become `_`; trailing spaces and dots are
/// trimmed; reserved device-name stems get `_File` appended before the
/// extension; the result is truncated to 255 characters keeping the
/// extension.
pub fn sanitize_name(name: &str) -> String {
    let mut cleaned: String = name
        .chars()
        .map(|c| if FORBIDDEN.contains(&c) { '_' } else { c })
        .collect();

    while cleaned.ends_with(' ') || cleaned.ends_with('.') {
        cleaned.pop();
    }
    if cleaned.is_empty() {
        return "_".to_string();
    }

    let (stem, extension) = match cleaned.find('.') {
        Some(idx) => (&cleaned[..idx], &cleaned[idx..]),
        None => (cleaned.as_str(), ""),
    };
    if RESERVED_STEMS.contains(stem.to_ascii_uppercase().as_str()) {
        cleaned = format!("{}_File{}", stem, extension);
    }

    truncate_keeping_extension(&cleaned, MAX_NAME_CHARS)
}

fn truncate_keeping_extension(name: &str, max_chars: usize) -> String {
    if name.chars().count() <= max_chars {
        return name.to_string();
    }
    let (stem, extension) = match name.rfind('.') {
        Some(idx) if idx > 0 => (&name[..idx], &name[idx..]),
        _ => (name, ""),
    };
    let ext_chars = extension.chars().count();
    let keep = max_chars.saturating_sub(ext_chars).max(1);
    let truncated: String = stem.chars().take(keep).collect();
    format!("{}{}", truncated, extension)
}

/// Collision suffix: `name (n)` for files, placed before the extension.
pub fn numbered_name(name: &str, n: u32) -> String {
    match name.rfind('.') {
        Some(idx) if idx > 0 => format!("{} ({}){}", &name[..idx], n, &name[idx..]),
        _ => format!("{} ({})", name, n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize() {
        assert_eq!(canonicalize(""), "/");
        assert_eq!(canonicalize("/"), "/");
        assert_eq!(canonicalize("a/b"), "/a/b");
        assert_eq!(canonicalize("/a//b/"), "/a/b");
        assert_eq!(canonicalize("\\a\\b"), "/a/b");
        assert_eq!(canonicalize("/a/./b"), "/a/b");
        assert_eq!(canonicalize("/a/../b"), "/b");
        assert_eq!(canonicalize("/../../a"), "/a");
    }

    #[test]
    fn test_parent_and_leaf() {
        assert_eq!(parent("/"), None);
        assert_eq!(parent("/a"), Some("/"));
        assert_eq!(parent("/a/b"), Some("/a"));
        assert_eq!(leaf("/a/b"), "b");
        assert_eq!(leaf("/"), "");
        assert_eq!(join("/", "x"), "/x");
        assert_eq!(join("/a", "x"), "/a/x");
    }

    #[test]
    fn test_case_insensitive_prefix() {
        assert!(starts_with_ci("/Movies/Film.mkv", "/movies"));
        assert!(starts_with_ci("/Movies", "/MOVIES"));
        assert!(!starts_with_ci("/MoviesExtra/x", "/Movies"));
        assert!(starts_with_ci("/anything", "/"));
    }

    #[test]
    fn test_reparent() {
        assert_eq!(
            reparent("/a/b/c.mkv", "/a", "/z").as_deref(),
            Some("/z/b/c.mkv")
        );
        assert_eq!(reparent("/a", "/a", "/z").as_deref(), Some("/z"));
        assert_eq!(reparent("/ab/c", "/a", "/z"), None);
    }

    #[test]
    fn test_sanitize_forbidden_characters() {
        assert_eq!(sanitize_name("a<b>c:d\"e|f?g*h"), "a_b_c_d_e_f_g_h");
        assert_eq!(sanitize_name("slash/back\\slash"), "slash_back_slash");
    }

    #[test]
    fn test_sanitize_trailing_dots_and_spaces() {
        assert_eq!(sanitize_name("name. . ."), "name");
        assert_eq!(sanitize_name("name   "), "name");
        assert_eq!(sanitize_name("...."), "_");
    }

    #[test]
    fn test_sanitize_reserved_device_names() {
        assert_eq!(sanitize_name("CON"), "CON_File");
        assert_eq!(sanitize_name("con.txt"), "con_File.txt");
        assert_eq!(sanitize_name("Com1.log"), "Com1_File.log");
        assert_eq!(sanitize_name("console.txt"), "console.txt");
        assert_eq!(sanitize_name("LPT9"), "LPT9_File");
    }

    #[test]
    fn test_sanitize_truncates_keeping_extension() {
        let long = format!("{}.mkv", "x".repeat(300));
        let out = sanitize_name(&long);
        assert_eq!(out.chars().count(), 255);
        assert!(out.ends_with(".mkv"));
    }

    #[test]
    fn test_numbered_name() {
        assert_eq!(numbered_name("file.mkv", 1), "file (1).mkv");
        assert_eq!(numbered_name("folder", 2), "folder (2)");
        assert_eq!(numbered_name(".hidden", 1), ".hidden (1)");
    }
}
