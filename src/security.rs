//! Filename and path hygiene for untrusted input.

use std::path::{Component, Path, PathBuf};

/// Characters that are never allowed in a stored filename.
const FORBIDDEN_CHARS: [char; 9] = ['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Reduce an untrusted attachment name to a safe single path component.
///
/// Only the final component survives (`/` and `\` are both separators) and
/// every forbidden character is replaced by `_`.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();

    let cleaned: String = base
        .chars()
        .map(|c| if FORBIDDEN_CHARS.contains(&c) || c.is_control() { '_' } else { c })
        .collect();
    let cleaned = cleaned.trim();

    match cleaned {
        "" | "." | ".." => "attachment".to_string(),
        other => other.to_string(),
    }
}

/// Lexically normalize a path, resolving `.` and `..` without touching the
/// filesystem. `..` never climbs above the root.
pub fn normalize_lexical(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if components
                    .last()
                    .is_some_and(|c| matches!(c, Component::Normal(_)))
                {
                    components.pop();
                }
            }
            Component::CurDir => {}
            other => components.push(other),
        }
    }
    components.iter().collect()
}

/// Resolve symlinks on the deepest existing ancestor of an already
/// normalized path, then re-append the non-existent tail.
fn resolve_existing_prefix(path: &Path) -> PathBuf {
    let mut ancestor = path;
    let mut tail = Vec::new();
    loop {
        if let Ok(canonical) = ancestor.canonicalize() {
            return tail
                .into_iter()
                .rev()
                .fold(canonical, |acc: PathBuf, part| acc.join(part));
        }
        match (ancestor.parent(), ancestor.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_os_string());
                ancestor = parent;
            }
            _ => return path.to_path_buf(),
        }
    }
}

/// True when `path` (absolute, or relative to the working directory)
/// resolves to a location under `base`.
pub fn is_safe_path(path: &Path, base: &Path) -> bool {
    let absolute = |p: &Path| {
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("/"))
                .join(p)
        }
    };

    let base = resolve_existing_prefix(&normalize_lexical(&absolute(base)));
    let target = resolve_existing_prefix(&normalize_lexical(&absolute(path)));
    target.starts_with(&base)
}
