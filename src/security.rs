#![forbid(unsafe_code)]

//! Input hardening: anything that turns caller-supplied text into a process
//! argument or a filesystem path goes through here first.

use std::path::{Component, Path, PathBuf};

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Length of a YouTube video identifier.
pub const MEDIA_REF_LEN: usize = 11;
const MAX_TITLE_LEN: usize = 100;

/// Fails fast when a binary is started as root. The fetch tool runs with the
/// server's privileges, so the server must not have any to spare.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!(
            "{process} must not be run as root; use a regular user or a dedicated service account"
        );
    }
    Ok(())
}

/// Returns true for exactly eleven characters out of `[A-Za-z0-9_-]`.
pub fn is_valid_media_ref(value: &str) -> bool {
    value.len() == MEDIA_REF_LEN
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Turns an arbitrary title into a file-name stem. Spaces become `_`, other
/// characters outside `[A-Za-z0-9_-]` are dropped. Returns `None` when nothing
/// usable remains.
pub fn sanitize_title(title: &str) -> Option<String> {
    let mut out = String::with_capacity(title.len().min(MAX_TITLE_LEN));
    for c in title.trim().chars() {
        if out.len() >= MAX_TITLE_LEN {
            break;
        }
        match c {
            c if c.is_ascii_alphanumeric() || c == '-' || c == '_' => out.push(c),
            c if c.is_whitespace() => {
                if !out.ends_with('_') {
                    out.push('_');
                }
            }
            _ => {}
        }
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() || trimmed.chars().all(|c| c == '-') {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Resolves a caller-supplied relative path under `root`.
///
/// Absolute paths, `..`, `.` and prefixes are rejected outright. When the
/// target exists it is canonicalized as well, so a symlink pointing out of the
/// root is rejected too.
pub fn resolve_within_root(root: &Path, requested: &str) -> Option<PathBuf> {
    let trimmed = requested.trim();
    if trimmed.is_empty() || trimmed.contains('\0') || trimmed.contains('\\') {
        return None;
    }
    let candidate = Path::new(trimmed);
    if candidate
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return None;
    }

    let joined = root.join(candidate);
    match (joined.canonicalize(), root.canonicalize()) {
        (Ok(real), Ok(real_root)) if !real.starts_with(&real_root) => None,
        _ => Some(joined),
    }
}
