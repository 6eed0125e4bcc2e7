//! Filename resolution: Content-Disposition parsing, URL fallbacks,
//! sanitization, and collision suffixing.

use std::path::Path;

use tracing::debug;
use url::Url;

/// Suffix appended to the final filename for the in-progress temp file.
pub const TEMP_SUFFIX: &str = ".zdmr.part";

/// Picks the on-disk filename from the first response's headers, falling back
/// to the URL path and finally a content-type-derived generic name.
#[must_use]
pub fn resolve_filename(
    url: &Url,
    content_disposition: Option<&str>,
    content_type: Option<&str>,
) -> String {
    if let Some(header) = content_disposition {
        if let Some(name) = parse_content_disposition(header) {
            let sanitized = sanitize_filename(&name);
            if !sanitized.is_empty() {
                return sanitized;
            }
        }
    }

    if let Some(segment) = url
        .path_segments()
        .and_then(|mut s| s.next_back())
        .filter(|s| !s.is_empty())
    {
        let decoded = urlencoding::decode(segment)
            .map(|c| c.into_owned())
            .unwrap_or_else(|_| segment.to_string());
        let sanitized = sanitize_filename(&decoded);
        if !sanitized.is_empty() && sanitized != "." {
            return sanitized;
        }
    }

    let mut name = "download".to_string();
    if let Some(ext) = content_type.and_then(extension_from_content_type) {
        name.push_str(ext);
    }
    name
}

/// Extracts a filename from a Content-Disposition header.
///
/// Prefers `filename*=` (RFC 5987) over `filename=`; once a value is chosen
/// the rest of the header is discarded. Candidates containing `;` are
/// rejected so a sloppy parse can never leak the next parameter into the
/// name.
#[must_use]
pub fn parse_content_disposition(header: &str) -> Option<String> {
    let lower = header.to_ascii_lowercase();

    if let Some(idx) = lower.find("filename*=") {
        let rest = param_value(&header[idx + "filename*=".len()..]);
        // RFC 5987 form: charset'language'percent-encoded
        if let Some(pos) = rest.find("''") {
            let encoded = rest[pos + 2..].trim().trim_matches('"');
            if let Ok(decoded) = urlencoding::decode(encoded) {
                return accept_candidate(&decoded);
            }
        }
        let bare = rest.trim().trim_matches('"');
        if let Some(name) = accept_candidate(bare) {
            return Some(name);
        }
    }

    if let Some(idx) = lower.find("filename=") {
        let rest = param_value(&header[idx + "filename=".len()..]);
        let value = rest.trim().trim_matches('"');
        if let Some(name) = accept_candidate(value) {
            return Some(name);
        }
    }

    None
}

/// Cuts a parameter value at the first `;` outside quotes.
fn param_value(s: &str) -> &str {
    let mut in_quotes = false;
    let mut escaped = false;
    for (i, ch) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            ';' if !in_quotes => return s[..i].trim(),
            _ => {}
        }
    }
    s.trim()
}

fn accept_candidate(name: &str) -> Option<String> {
    if name.is_empty() {
        return None;
    }
    if name.contains(';') {
        debug!(candidate = %name, "rejecting filename candidate containing ';'");
        return None;
    }
    Some(name.to_string())
}

/// Strips path separators and control characters, then trims trailing dots
/// and spaces (which Windows-style destinations refuse).
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    cleaned.trim_end_matches(['.', ' ']).to_string()
}

/// Maps a Content-Type to a file extension for the generic fallback name.
#[must_use]
pub fn extension_from_content_type(content_type: &str) -> Option<&'static str> {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    let ext = match mime.as_str() {
        "application/zip" => ".zip",
        "application/gzip" => ".gz",
        "application/pdf" => ".pdf",
        "application/json" => ".json",
        "application/xml" | "text/xml" => ".xml",
        "application/octet-stream" => ".bin",
        "text/html" => ".html",
        "text/plain" => ".txt",
        "image/jpeg" => ".jpg",
        "image/png" => ".png",
        "image/gif" => ".gif",
        "video/mp4" => ".mp4",
        "audio/mpeg" => ".mp3",
        _ => return None,
    };
    Some(ext)
}

/// Finds the first free `name`, `name (1)`, `name (2)`, ... slot in
/// `dest_dir`, also treating an existing temp file as a taken slot. The
/// caller reserves the winner by creating its temp file.
#[must_use]
pub fn choose_unique_filename(dest_dir: &Path, desired: &str) -> String {
    let desired = {
        let s = sanitize_filename(desired);
        if s.is_empty() {
            "download".to_string()
        } else {
            s
        }
    };

    if slot_free(dest_dir, &desired) {
        return desired;
    }

    let (stem, ext) = match desired.rfind('.') {
        Some(pos) if pos > 0 => (&desired[..pos], &desired[pos..]),
        _ => (desired.as_str(), ""),
    };
    for n in 1.. {
        let candidate = format!("{stem} ({n}){ext}");
        if slot_free(dest_dir, &candidate) {
            return candidate;
        }
    }
    unreachable!("suffix search is unbounded")
}

fn slot_free(dest_dir: &Path, name: &str) -> bool {
    !dest_dir.join(name).exists() && !dest_dir.join(format!("{name}{TEMP_SUFFIX}")).exists()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    // ---- Content-Disposition ----

    #[test]
    fn test_cd_plain_quoted_filename() {
        let got = parse_content_disposition(r#"attachment; filename="report.pdf""#).unwrap();
        assert_eq!(got, "report.pdf");
    }

    #[test]
    fn test_cd_unquoted_filename() {
        let got = parse_content_disposition("attachment; filename=report.pdf").unwrap();
        assert_eq!(got, "report.pdf");
    }

    #[test]
    fn test_cd_filename_star_preferred_and_following_params_dropped() {
        let header =
            "attachment; filename*=UTF-8''Qwen3-4B-Q5_K_M.gguf; filename=Qwen3-4B-Q5_K_M.gguf";
        let got = parse_content_disposition(header).unwrap();
        assert_eq!(got, "Qwen3-4B-Q5_K_M.gguf");
    }

    #[test]
    fn test_cd_filename_star_percent_decodes() {
        let got =
            parse_content_disposition("attachment; filename*=UTF-8''a%20b.txt; filename=x.txt")
                .unwrap();
        assert_eq!(got, "a b.txt");
    }

    #[test]
    fn test_cd_candidate_with_semicolon_rejected() {
        // A decoded name that still contains ';' means the parse consumed a
        // following parameter; never accept it.
        let got = parse_content_disposition("attachment; filename*=UTF-8''a%3Bfilename=b");
        assert_eq!(got, None);
    }

    #[test]
    fn test_cd_empty_or_missing() {
        assert_eq!(parse_content_disposition("attachment"), None);
        assert_eq!(parse_content_disposition("attachment; filename="), None);
    }

    // ---- resolution chain ----

    #[test]
    fn test_resolve_prefers_content_disposition() {
        let got = resolve_filename(
            &url("https://example.com/ignored/path.bin"),
            Some(r#"attachment; filename="model.gguf""#),
            None,
        );
        assert_eq!(got, "model.gguf");
    }

    #[test]
    fn test_resolve_falls_back_to_url_segment_decoded() {
        let got = resolve_filename(&url("https://example.com/files/My%20File.zip"), None, None);
        assert_eq!(got, "My File.zip");
    }

    #[test]
    fn test_resolve_generic_name_gets_content_type_extension() {
        let got = resolve_filename(&url("https://example.com/"), None, Some("application/zip"));
        assert_eq!(got, "download.zip");
    }

    #[test]
    fn test_resolve_generic_name_without_known_type() {
        let got = resolve_filename(&url("https://example.com/"), None, Some("application/x-weird"));
        assert_eq!(got, "download");
    }

    // ---- sanitization ----

    #[test]
    fn test_sanitize_strips_separators_and_controls() {
        assert_eq!(sanitize_filename("a/b\\c:d"), "a_b_c_d");
        assert_eq!(sanitize_filename("evil\u{0}name\n"), "evil_name");
    }

    #[test]
    fn test_sanitize_trims_trailing_dots_and_spaces() {
        assert_eq!(sanitize_filename("report. . "), "report");
        assert_eq!(sanitize_filename("normal.txt"), "normal.txt");
    }

    #[test]
    fn test_sanitized_output_never_contains_forbidden_chars() {
        let nasty = "a;b/c\\d:e*f?g\"h<i>j|k\u{7f}";
        let clean = sanitize_filename(nasty);
        assert!(!clean.contains('/'));
        assert!(!clean.contains('\\'));
        assert!(clean.chars().all(|c| !c.is_control()));
    }

    // ---- collision suffixing ----

    #[test]
    fn test_unique_filename_free_dir_keeps_name() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(choose_unique_filename(dir.path(), "file.zip"), "file.zip");
    }

    #[test]
    fn test_unique_filename_suffixes_in_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("file.zip"), b"x").unwrap();
        std::fs::write(dir.path().join("file (1).zip"), b"x").unwrap();

        assert_eq!(
            choose_unique_filename(dir.path(), "file.zip"),
            "file (2).zip"
        );
    }

    #[test]
    fn test_unique_filename_without_extension() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("file"), b"x").unwrap();
        assert_eq!(choose_unique_filename(dir.path(), "file"), "file (1)");
    }

    #[test]
    fn test_unique_filename_respects_pending_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(format!("file.zip{TEMP_SUFFIX}")), b"x").unwrap();
        assert_eq!(
            choose_unique_filename(dir.path(), "file.zip"),
            "file (1).zip"
        );
    }

    #[test]
    fn test_unique_filename_applied_twice_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let first = choose_unique_filename(dir.path(), "file.zip");
        std::fs::write(dir.path().join(&first), b"x").unwrap();
        let second = choose_unique_filename(dir.path(), "file.zip");
        assert_ne!(first, second);
    }
}
