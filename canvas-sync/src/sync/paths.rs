use std::path::{Path, PathBuf};

/// Turns a remote display name into a single safe path component.
///
/// Canvas names are free-form; separators would silently create extra
/// directory levels and `..` could leave the sync root. Everything else,
/// surrounding whitespace included, is kept as is so distinct remote names
/// stay distinct locally.
pub fn sanitize_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c => c,
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".repeat(cleaned.len().max(1)),
        _ => cleaned,
    }
}

pub fn course_dir(sync_root: &Path, course_name: &str) -> PathBuf {
    sync_root.join(sanitize_component(course_name))
}

pub fn child_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(sanitize_component(name))
}
