// crates/core/src/validate.rs
//! Identifier and filename checks applied at the service boundary.

use std::sync::OnceLock;

use regex_lite::Regex;

use crate::options::ALLOWED_EXTENSIONS;

/// Longest name a single path component may have on common filesystems.
pub const MAX_FILENAME_LEN: usize = 255;

fn job_id_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9-]{0,254}$").expect("static regex"))
}

fn unsafe_filename_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^A-Za-z0-9._-]").expect("static regex"))
}

/// Accepts alphanumerics and hyphens, first character alphanumeric, at most
/// 255 characters. Anything else (separators, whitespace, shell
/// metacharacters, control characters) is rejected.
pub fn validate_job_id(id: &str) -> bool {
    job_id_pattern().is_match(id)
}

/// Same as [`validate_job_id`] for optional form values.
pub fn validate_optional_job_id(id: Option<&str>) -> bool {
    id.is_some_and(validate_job_id)
}

/// Reduce an uploaded filename to a safe single path component.
///
/// Directory parts are dropped, disallowed characters become `_`, and the
/// result is capped at 255 bytes keeping the extension. Returns `None` when
/// nothing usable remains.
pub fn sanitize_filename(filename: &str) -> Option<String> {
    let base = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();
    let cleaned = unsafe_filename_chars().replace_all(base, "_").into_owned();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        return None;
    }
    Some(truncate_keep_extension(&cleaned, MAX_FILENAME_LEN))
}

/// Name under which an upload is stored: `{job_id}_{sanitized}`, capped so
/// the tool's derived output directory name stays a legal component.
pub fn stored_upload_name(job_id: &str, sanitized: &str) -> String {
    truncate_keep_extension(&format!("{job_id}_{sanitized}"), MAX_FILENAME_LEN)
}

fn truncate_keep_extension(name: &str, limit: usize) -> String {
    if name.len() <= limit {
        return name.to_string();
    }
    let ext = extension(name)
        .map(|e| format!(".{e}"))
        .filter(|e| e.len() < limit / 2)
        .unwrap_or_default();
    let keep = limit - ext.len();
    let stem: String = name.chars().take(keep).collect();
    stem + &ext
}

/// Extension after the last dot, if any.
pub fn extension(filename: &str) -> Option<&str> {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ext)
        .filter(|ext| !ext.is_empty())
}

/// Filename without its final extension.
pub fn file_stem(filename: &str) -> &str {
    match filename.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => filename,
    }
}

/// True if the filename carries one of the accepted audio extensions.
pub fn allowed_file(filename: &str) -> bool {
    extension(filename)
        .map(|ext| ext.to_ascii_lowercase())
        .is_some_and(|ext| ALLOWED_EXTENSIONS.contains(&ext.as_str()))
}
