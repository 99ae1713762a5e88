//! Upload validation: filename sanitization, extension allow/block lists and
//! MIME type detection.

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::UploadConfig;
use crate::error::{AppError, Result};

/// Validated metadata for an incoming upload.
#[derive(Debug, Clone)]
pub struct ValidatedName {
    pub original_name: String,
    pub sanitized_name: String,
    pub extension: String,
}

/// Sanitize a filename: strip path components, replace dangerous characters
/// and cap the length at 255 bytes.
pub fn sanitize_filename(filename: &str) -> String {
    static UNSAFE_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w\s\-.]").unwrap());
    static COLLAPSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[_\s]+").unwrap());

    if filename.is_empty() {
        return "unnamed_file".to_string();
    }

    // Drop any path components (traversal attempts included)
    let base = Path::new(filename)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let cleaned = UNSAFE_CHARS.replace_all(&base, "_");
    let cleaned = COLLAPSE.replace_all(&cleaned, "_");
    let cleaned = cleaned.trim_matches(['_', '.'].as_slice()).to_string();

    if cleaned.is_empty() {
        return "unnamed_file".to_string();
    }

    if cleaned.len() > 255 {
        let (stem, ext) = split_extension(&cleaned);
        let keep = 255usize.saturating_sub(ext.len() + 1);
        let mut stem: String = stem.chars().take(keep).collect();
        if !ext.is_empty() {
            stem.push('.');
            stem.push_str(&ext);
        }
        return stem;
    }

    cleaned
}

/// Lowercased extension without the dot, empty if none.
pub fn extract_extension(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

fn split_extension(filename: &str) -> (String, String) {
    match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), ext.to_string()),
        _ => (filename.to_string(), String::new()),
    }
}

/// Validate the declared filename against the extension lists and return the
/// sanitized pieces. No side effects on failure.
pub fn validate_name(declared_name: &str, config: &UploadConfig) -> Result<ValidatedName> {
    if declared_name.trim().is_empty() {
        return Err(AppError::InvalidInput("Filename is required".to_string()));
    }

    let sanitized = sanitize_filename(declared_name);
    let extension = extract_extension(&sanitized);

    let blocked = config
        .blocked_extensions
        .iter()
        .any(|e| e.to_lowercase() == extension);
    if blocked {
        return Err(AppError::InvalidInput(format!(
            "File extension \"{}\" is not allowed for security reasons",
            extension
        )));
    }

    if !config.allowed_extensions.is_empty()
        && !config
            .allowed_extensions
            .iter()
            .any(|e| e.to_lowercase() == extension)
    {
        return Err(AppError::InvalidInput(format!(
            "File extension \"{}\" is not allowed. Allowed extensions: {}",
            extension,
            config.allowed_extensions.join(", ")
        )));
    }

    Ok(ValidatedName {
        original_name: declared_name.to_string(),
        sanitized_name: sanitized,
        extension,
    })
}

/// Detect the MIME type with content sniffing first, extension guess second
/// and the client-declared type last.
pub fn detect_mime_type(head: &[u8], filename: &str, declared: Option<&str>) -> String {
    if let Some(kind) = infer::get(head) {
        return kind.mime_type().to_string();
    }
    if let Some(guess) = mime_guess::from_path(filename).first() {
        return guess.essence_str().to_string();
    }
    declared
        .filter(|s| !s.is_empty())
        .unwrap_or("application/octet-stream")
        .to_string()
}

/// Enforce the allowed-MIME list (empty list admits everything).
pub fn validate_mime_type(mime: &str, config: &UploadConfig) -> Result<()> {
    if !config.allowed_mime_types.is_empty()
        && !config.allowed_mime_types.iter().any(|m| m == mime)
    {
        return Err(AppError::InvalidInput(format!(
            "MIME type \"{}\" is not allowed. Allowed types: {}",
            mime,
            config.allowed_mime_types.join(", ")
        )));
    }
    Ok(())
}
