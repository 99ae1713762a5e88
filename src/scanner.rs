//! Text extraction and sensitive-marker detection for uploaded documents.
//!
//! Scanning is advisory: every failure path degrades to the empty "not
//! detected" result so an upload is never failed by its scan.

use std::fs;
use std::io::Read;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::config::ScanConfig;

static EMAIL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b[A-Z0-9._%+-]+@[A-Z0-9.-]+\.[A-Z]{2,}\b").unwrap());
static PHONE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\+?\d[\d\s\-().]{7,}\d").unwrap());
static USERNAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(user\s?name|login\s?id)\b").unwrap());
static PASSWORD_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(pass\s?word|pwd)\b").unwrap());

const CREDENTIAL_KEYWORDS: &[&str] = &[
    "otp",
    "one time password",
    "security answer",
    "ssn",
    "pan",
    "aadhar",
    "secret question",
];

/// Kinds of sensitive markers a scan can report. Serialized as
/// `snake_case` strings; variant order matches the sorted string order so
/// `Ord` and the stored JSON agree.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Marker {
    CredentialKeyword,
    Email,
    Password,
    Phone,
    Username,
}

impl Marker {
    /// Human label used when building the summary sentence.
    pub fn label(&self) -> &'static str {
        match self {
            Marker::CredentialKeyword => "other sensitive keyword",
            Marker::Email => "email address",
            Marker::Password => "password",
            Marker::Phone => "phone number",
            Marker::Username => "username",
        }
    }
}

/// Deterministic scan outcome, persisted atomically with the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub detected: bool,
    /// Sorted, duplicate-free marker kinds.
    pub markers: Vec<Marker>,
    pub summary: String,
}

impl ScanResult {
    pub fn clean() -> Self {
        Self {
            detected: false,
            markers: Vec::new(),
            summary: String::new(),
        }
    }

    pub fn markers_json(&self) -> String {
        serde_json::to_string(&self.markers).unwrap_or_else(|_| "[]".to_string())
    }
}

/// Extract text from the file (when supported) and detect sensitive markers.
pub fn scan_file(path: &Path, extension: &str, mime_type: &str, config: &ScanConfig) -> ScanResult {
    if !config.enabled {
        return ScanResult::clean();
    }

    let normalized_ext = extension.trim_start_matches('.').to_lowercase();
    if !config.supported_extensions().contains(&normalized_ext) {
        return ScanResult::clean();
    }

    match fs::metadata(path) {
        Ok(meta) => {
            if meta.len() > config.max_bytes {
                tracing::info!(
                    "Skipping sensitive scan for {:?}; size {} exceeds {} bytes",
                    path,
                    meta.len(),
                    config.max_bytes
                );
                return ScanResult::clean();
            }
        }
        Err(e) => {
            tracing::warn!("Unable to determine file size for sensitive scan: {}", e);
        }
    }

    let text = extract_text(path, &normalized_ext, mime_type, config);
    if text.is_empty() {
        return ScanResult::clean();
    }

    let text = truncate_chars(text, config.max_text_chars);

    let markers = detect_markers(&text);
    if markers.is_empty() {
        return ScanResult::clean();
    }

    let markers: Vec<Marker> = markers.into_iter().collect();
    let summary = format_summary(&markers);
    ScanResult {
        detected: true,
        markers,
        summary,
    }
}

fn extract_text(path: &Path, extension: &str, _mime_type: &str, config: &ScanConfig) -> String {
    let result = match extension {
        "txt" => extract_txt_text(path),
        "pdf" => extract_pdf_text(path, config.max_pdf_pages),
        "rtf" => extract_rtf_text(path),
        "docx" => extract_docx_text(path),
        // No .doc extraction capability; degrade to empty text.
        "doc" => {
            tracing::debug!("No extractor available for .doc file {:?}", path);
            Ok(String::new())
        }
        _ => Ok(String::new()),
    };

    match result {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!("Failed to extract text for sensitive scan from {:?}: {}", path, e);
            String::new()
        }
    }
}

fn extract_txt_text(path: &Path) -> anyhow::Result<String> {
    let bytes = fs::read(path)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn extract_pdf_text(path: &Path, max_pages: u32) -> anyhow::Result<String> {
    let doc = lopdf::Document::load(path)?;
    let pages: Vec<u32> = doc
        .get_pages()
        .keys()
        .copied()
        .take(max_pages as usize)
        .collect();
    if pages.is_empty() {
        return Ok(String::new());
    }
    Ok(doc.extract_text(&pages)?)
}

fn extract_rtf_text(path: &Path) -> anyhow::Result<String> {
    let bytes = fs::read(path)?;
    Ok(strip_rtf(&String::from_utf8_lossy(&bytes)))
}

fn extract_docx_text(path: &Path) -> anyhow::Result<String> {
    static TAG_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").unwrap());

    let file = fs::File::open(path)?;
    let mut archive = zip::ZipArchive::new(file)?;
    let mut xml = String::new();
    archive
        .by_name("word/document.xml")?
        .read_to_string(&mut xml)?;

    // Paragraph ends become newlines, all other markup is dropped.
    let xml = xml.replace("</w:p>", "\n");
    Ok(TAG_PATTERN.replace_all(&xml, "").into_owned())
}

/// Minimal RTF-to-text: drops control words, group braces and hex escapes,
/// keeps literal text and the line breaks produced by \par.
fn strip_rtf(input: &str) -> String {
    let mut out = String::with_capacity(input.len() / 2);
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' | '}' => {}
            '\\' => match chars.peek() {
                Some('\\') | Some('{') | Some('}') => {
                    out.push(chars.next().unwrap());
                }
                Some('\'') => {
                    // \'hh hex escape: skip the quote and two hex digits
                    chars.next();
                    chars.next();
                    chars.next();
                }
                _ => {
                    let mut word = String::new();
                    while let Some(&n) = chars.peek() {
                        if n.is_ascii_alphabetic() {
                            word.push(n);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    // Numeric parameter after the control word
                    while let Some(&n) = chars.peek() {
                        if n.is_ascii_digit() || n == '-' {
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    // One space after a control word is part of the word
                    if let Some(&' ') = chars.peek() {
                        chars.next();
                    }
                    if word == "par" || word == "line" {
                        out.push('\n');
                    }
                }
            },
            '\r' | '\n' => {}
            _ => out.push(c),
        }
    }

    out
}

fn truncate_chars(text: String, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text;
    }
    text.chars().take(max_chars).collect()
}

fn detect_markers(text: &str) -> BTreeSet<Marker> {
    let mut matches = BTreeSet::new();

    if EMAIL_PATTERN.is_match(text) {
        matches.insert(Marker::Email);
    }
    if PHONE_PATTERN.is_match(text) {
        matches.insert(Marker::Phone);
    }
    if USERNAME_PATTERN.is_match(text) {
        matches.insert(Marker::Username);
    }
    if PASSWORD_PATTERN.is_match(text) {
        matches.insert(Marker::Password);
    }

    let text_lower = text.to_lowercase();
    if CREDENTIAL_KEYWORDS.iter().any(|kw| text_lower.contains(kw)) {
        matches.insert(Marker::CredentialKeyword);
    }

    matches
}

/// "Contains X" for one marker, "Contains A, B and C" for several. Labels
/// follow the sorted marker order so the sentence is deterministic.
fn format_summary(markers: &[Marker]) -> String {
    let readable: Vec<&str> = markers.iter().map(|m| m.label()).collect();
    match readable.as_slice() {
        [] => String::new(),
        [only] => format!("Contains {}", only),
        [rest @ .., last] => format!("Contains {} and {}", rest.join(", "), last),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(dir: &tempfile::TempDir, name: &str, content: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(content).unwrap();
        path
    }

    #[test]
    fn detects_email_in_text_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, "a.txt", b"reach me at john@example.com please");
        let result = scan_file(&path, "txt", "text/plain", &ScanConfig::default());
        assert!(result.detected);
        assert_eq!(result.markers, vec![Marker::Email]);
        assert_eq!(result.summary, "Contains email address");
        assert_eq!(result.markers_json(), r#"["email"]"#);
    }

    #[test]
    fn multiple_marker_families_sorted_and_joined() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(
            &dir,
            "a.txt",
            b"email: a@b.org password: hunter2 call +1 (555) 123-4567",
        );
        let result = scan_file(&path, "txt", "text/plain", &ScanConfig::default());
        assert!(result.detected);
        assert_eq!(
            result.markers,
            vec![Marker::Email, Marker::Password, Marker::Phone]
        );
        assert_eq!(
            result.summary,
            "Contains email address, password and phone number"
        );
    }

    #[test]
    fn duplicate_matches_collapse_to_one_marker() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, "a.txt", b"a@b.org c@d.org e@f.org");
        let result = scan_file(&path, "txt", "text/plain", &ScanConfig::default());
        assert_eq!(result.markers, vec![Marker::Email]);
    }

    #[test]
    fn credential_keywords_match_case_insensitively() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, "a.txt", b"your OTP expires in five minutes");
        let result = scan_file(&path, "txt", "text/plain", &ScanConfig::default());
        assert_eq!(result.markers, vec![Marker::CredentialKeyword]);
        assert_eq!(result.summary, "Contains other sensitive keyword");
    }

    #[test]
    fn disabled_scan_returns_clean() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, "a.txt", b"john@example.com");
        let mut config = ScanConfig::default();
        config.enabled = false;
        let result = scan_file(&path, "txt", "text/plain", &config);
        assert!(!result.detected);
        assert!(result.markers.is_empty());
        assert!(result.summary.is_empty());
    }

    #[test]
    fn unsupported_extension_returns_clean() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, "a.png", b"john@example.com");
        let result = scan_file(&path, "png", "image/png", &ScanConfig::default());
        assert!(!result.detected);
    }

    #[test]
    fn oversize_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, "a.txt", b"john@example.com");
        let mut config = ScanConfig::default();
        config.max_bytes = 4;
        let result = scan_file(&path, "txt", "text/plain", &config);
        assert!(!result.detected);
    }

    #[test]
    fn text_is_truncated_before_matching() {
        let dir = tempfile::tempdir().unwrap();
        let mut content = vec![b'x'; 100];
        content.extend_from_slice(b" john@example.com");
        let path = write_temp(&dir, "a.txt", &content);
        let mut config = ScanConfig::default();
        config.max_text_chars = 50;
        let result = scan_file(&path, "txt", "text/plain", &config);
        assert!(!result.detected);
    }

    #[test]
    fn rtf_control_words_are_stripped() {
        let text = strip_rtf(r"{\rtf1\ansi pass word: \b secret\b0 \par a@b.org}");
        assert!(text.contains("pass word"));
        assert!(text.contains("a@b.org"));
        assert!(!text.contains("rtf1"));
        assert!(text.contains('\n'));
    }

    #[test]
    fn rtf_file_is_scanned() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, "a.rtf", br"{\rtf1 contact john@example.com\par}");
        let result = scan_file(&path, "rtf", "application/rtf", &ScanConfig::default());
        assert!(result.detected);
        assert_eq!(result.markers, vec![Marker::Email]);
    }

    #[test]
    fn corrupt_pdf_degrades_to_clean() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, "a.pdf", b"not really a pdf john@example.com");
        let result = scan_file(&path, "pdf", "application/pdf", &ScanConfig::default());
        assert!(!result.detected);
    }

    #[test]
    fn doc_extension_has_no_capability() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, "a.doc", b"john@example.com");
        let result = scan_file(&path, "doc", "application/msword", &ScanConfig::default());
        assert!(!result.detected);
    }

    #[test]
    fn username_label_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, "a.txt", b"Login ID: jdoe");
        let result = scan_file(&path, "txt", "text/plain", &ScanConfig::default());
        assert_eq!(result.markers, vec![Marker::Username]);
        assert_eq!(result.summary, "Contains username");
    }
}
