//! Filename sanitization and object-key derivation for the artifact broker.
//!
//! Callers choose filenames; the server chooses keys. A key is always
//! `projects/{p}/sessions/{s}/iterations/{n}/{sanitized}` and the sanitized
//! component can never contain a path separator or `..`, so a key can only
//! land under the session's own prefix.

use uuid::Uuid;

const MAX_FILENAME_LEN: usize = 128;
const FALLBACK_FILENAME: &str = "file";

/// Reduce a caller-supplied filename to a single safe path component.
pub fn sanitize_filename(name: &str) -> String {
    let last = name.rsplit(['/', '\\']).next().unwrap_or("");

    let mut out = String::with_capacity(last.len());
    let mut in_run = false;
    for c in last.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            in_run = false;
        } else if c == '.' {
            if !out.ends_with('.') {
                out.push('.');
            }
            in_run = false;
        } else if !in_run {
            out.push('-');
            in_run = true;
        }
    }

    let mut trimmed = out.trim_matches(|c| c == '.' || c == '-').to_string();
    if trimmed.len() > MAX_FILENAME_LEN {
        // Output is ASCII only, so any byte index is a char boundary.
        trimmed.truncate(MAX_FILENAME_LEN);
        trimmed = trimmed
            .trim_end_matches(|c| c == '.' || c == '-')
            .to_string();
    }
    if trimmed.is_empty() {
        FALLBACK_FILENAME.to_string()
    } else {
        trimmed
    }
}

/// Prefix every object of a session lives under, trailing slash included.
pub fn session_prefix(project_id: Uuid, session_id: Uuid) -> String {
    format!("projects/{}/sessions/{}/", project_id, session_id)
}

pub fn object_key(project_id: Uuid, session_id: Uuid, iteration: i32, sanitized: &str) -> String {
    format!(
        "{}iterations/{}/{}",
        session_prefix(project_id, session_id),
        iteration,
        sanitized
    )
}

/// Normalize a declared content type for allowlist comparison: parameters
/// such as `; charset=utf-8` are dropped and the media type lowercased.
pub fn normalize_content_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

pub fn content_type_allowed(content_type: &str, allowed: &[String]) -> bool {
    let normalized = normalize_content_type(content_type);
    !normalized.is_empty() && allowed.iter().any(|a| *a == normalized)
}
