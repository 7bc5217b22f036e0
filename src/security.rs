#![forbid(unsafe_code)]

//! Filename and path helpers shared by every route that touches the disk.

use std::path::{Component, Path};

/// Reduces a client-supplied filename to `[A-Za-z0-9_.-]`.
///
/// Path separators become word breaks, whitespace runs collapse into a single
/// underscore and leading/trailing dots or underscores are stripped, so the
/// result can never name a parent directory. May return an empty string.
pub fn secure_filename(name: &str) -> String {
    let spaced = name.replace(['/', '\\'], " ");
    let joined = spaced.split_whitespace().collect::<Vec<_>>().join("_");
    let kept: String = joined
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | '-'))
        .collect();
    kept.trim_matches(|ch| ch == '.' || ch == '_').to_string()
}

/// True when `value` is exactly one normal path component.
pub fn is_safe_path_segment(value: &str) -> bool {
    let mut components = Path::new(value).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}
