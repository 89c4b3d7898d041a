//! Documentation links for proxy-reported error codes, and the report
//! formatter used by the discovery error channel.
//!
//! The code table is keyed by full code first (which may select a
//! subsection fragment), then by code prefix. Unknown codes map to the
//! empty string.

use std::path::Path;

use crate::proto::{SourceLocation, UserFunctionError};

/// Brand used in user-visible error reports.
pub const SYSTEM_BRAND: &str = "Statehost";

const DOC_BASE_URL: &str = "https://docs.kalix.io/";

/// Full codes with a dedicated page or subsection.
const SPECIFIC_CODES: &[(&str, &str)] = &[
    ("KLX-00112", "javascript/views.html#changing"),
    ("KLX-00402", "javascript/topic-eventing.html"),
    ("KLX-00406", "javascript/topic-eventing.html"),
    ("AS-00112", "javascript/views.html#changing"),
];

/// Code prefixes mapping to a component's documentation page.
const CODE_CATEGORIES: &[(&str, &str)] = &[
    ("KLX-001", "javascript/views.html"),
    ("KLX-002", "javascript/value-entity.html"),
    ("KLX-003", "javascript/eventsourced.html"),
    ("KLX-004", "javascript/actions-publishing-subscribing.html"),
    ("KLX-005", "javascript/replicated-entity.html"),
    ("KLX-009", "javascript/index.html"),
    ("AS-001", "javascript/views.html"),
    ("AS-002", "javascript/value-entity.html"),
    ("AS-003", "javascript/eventsourced.html"),
];

/// The documentation URL for an error code, or the empty string when the
/// code is unknown.
pub fn doc_link(code: &str) -> String {
    if code.is_empty() {
        return String::new();
    }

    if let Some((_, path)) = SPECIFIC_CODES.iter().find(|(c, _)| *c == code) {
        return format!("{DOC_BASE_URL}{path}");
    }

    if let Some((_, path)) = CODE_CATEGORIES
        .iter()
        .find(|(prefix, _)| code.starts_with(prefix))
    {
        return format!("{DOC_BASE_URL}{path}");
    }

    String::new()
}

/// Format a proxy-reported user error for the logs.
///
/// Produces a header line, the detail with its documentation link, and one
/// source excerpt per location, read from the named file relative to
/// `base_dir`. The layout is stable; tooling greps it.
pub fn format_error_report(error: &UserFunctionError, base_dir: &Path) -> String {
    let mut out = format!(
        "Error reported from {}: {} {}",
        SYSTEM_BRAND, error.code, error.message
    );

    out.push_str("\n\n");

    if !error.detail.is_empty() {
        out.push_str(&error.detail);
        let url = doc_link(&error.code);
        if !url.is_empty() {
            out.push_str("\nSee documentation: ");
            out.push_str(&url);
        }
    }

    for location in &error.source_locations {
        out.push_str(&format!(
            "\n\nAt {}:{}:{}:",
            location.file_name,
            location.start_line + 1,
            location.start_col + 1
        ));
        for line in source_excerpt(location, base_dir) {
            out.push('\n');
            out.push_str(&line);
        }
    }

    out
}

/// The excerpt quoted under an `At file:line:col:` header.
///
/// Quotes the file's lines from one before the reported start line through
/// the end line, clamped to the file. Unreadable files quote nothing.
fn source_excerpt(location: &SourceLocation, base_dir: &Path) -> Vec<String> {
    let path = base_dir.join(&location.file_name);
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(_) => return Vec::new(),
    };

    let lines: Vec<&str> = content.lines().collect();
    if lines.is_empty() {
        return Vec::new();
    }

    let first = location.start_line.max(1).saturating_sub(1) as usize;
    let last = (location.end_line.max(0) as usize).min(lines.len() - 1);
    if first > last {
        return Vec::new();
    }

    lines[first..=last].iter().map(|l| l.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_specific_code_with_fragment() {
        assert_eq!(
            doc_link("KLX-00112"),
            "https://docs.kalix.io/javascript/views.html#changing"
        );
    }

    #[test]
    fn test_category_prefix() {
        assert_eq!(
            doc_link("KLX-00201"),
            "https://docs.kalix.io/javascript/value-entity.html"
        );
        assert_eq!(
            doc_link("AS-00301"),
            "https://docs.kalix.io/javascript/eventsourced.html"
        );
    }

    #[test]
    fn test_unknown_code_is_empty() {
        assert_eq!(doc_link("XX-99999"), "");
        assert_eq!(doc_link(""), "");
    }

    #[test]
    fn test_report_format_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("package.test.json"),
            "  \"name\": \"some-name\",\n  \"version\": \"some-version\"",
        )
        .unwrap();

        let error = UserFunctionError {
            code: "KLX-00112".to_string(),
            message: "test message".to_string(),
            detail: "test details".to_string(),
            source_locations: vec![SourceLocation {
                file_name: "package.test.json".to_string(),
                start_line: 1,
                start_col: 3,
                end_line: 2,
                end_col: 5,
            }],
        };

        let expected = "\
Error reported from Statehost: KLX-00112 test message

test details
See documentation: https://docs.kalix.io/javascript/views.html#changing

At package.test.json:2:4:
  \"name\": \"some-name\",
  \"version\": \"some-version\"";

        assert_eq!(format_error_report(&error, dir.path()), expected);
    }

    #[test]
    fn test_report_without_detail_or_location() {
        let error = UserFunctionError {
            code: "XX-00001".to_string(),
            message: "boom".to_string(),
            detail: String::new(),
            source_locations: vec![],
        };
        assert_eq!(
            format_error_report(&error, Path::new(".")),
            "Error reported from Statehost: XX-00001 boom\n\n"
        );
    }

    #[test]
    fn test_report_with_missing_file_quotes_nothing() {
        let error = UserFunctionError {
            code: "KLX-00112".to_string(),
            message: "m".to_string(),
            detail: "d".to_string(),
            source_locations: vec![SourceLocation {
                file_name: "does-not-exist.json".to_string(),
                start_line: 0,
                start_col: 0,
                end_line: 0,
                end_col: 0,
            }],
        };
        let report = format_error_report(&error, Path::new("/nonexistent"));
        assert!(report.ends_with("At does-not-exist.json:1:1:"));
    }
}
