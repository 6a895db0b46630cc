//! Greasemonkey-style metadata header parsing.
//!
//! The header is the block of `// @directive value` lines between
//! `// ==UserScript==` and `// ==/UserScript==`. A file without a begin
//! marker parses trivially (all defaults). Invalid `@version` values are
//! ignored; invalid `@match` / `@run-at` values reject the whole file.

use thiserror::Error;
use tracing::debug;

use crate::matcher::{MatchGlob, PatternError, UrlPattern};
use crate::script::{RunLocation, UserScript};

const USER_SCRIPT_BEGIN: &str = "// ==UserScript==";
const USER_SCRIPT_END: &str = "// ==/UserScript==";

const NAME: &str = "// @name";
const NAMESPACE: &str = "// @namespace";
const VERSION: &str = "// @version";
const DESCRIPTION: &str = "// @description";
const INCLUDE: &str = "// @include";
const EXCLUDE: &str = "// @exclude";
const MATCH: &str = "// @match";
const EXCLUDE_MATCH: &str = "// @exclude_match";
const RUN_AT: &str = "// @run-at";
const URL_SOURCE: &str = "// @url";

const RUN_AT_DOCUMENT_START: &str = "document-start";
const RUN_AT_DOCUMENT_END: &str = "document-end";
const RUN_AT_DOCUMENT_IDLE: &str = "document-idle";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetadataError {
    #[error("invalid match pattern \"{value}\": {source}")]
    InvalidPattern {
        value: String,
        #[source]
        source: PatternError,
    },
    #[error("invalid run-at value \"{0}\"")]
    InvalidRunAt(String),
}

/// Extract the value of `prefix` from `line`: the prefix must be followed by
/// whitespace, the value is the trimmed remainder (possibly empty).
fn declaration_value(line: &str, prefix: &str) -> Option<String> {
    let rest = line.strip_prefix(prefix)?;
    let first = rest.chars().next()?;
    if !first.is_whitespace() {
        return None;
    }
    Some(rest.trim().to_string())
}

/// Validate a `@version` value: one to four dot-separated decimal components.
/// Returns the value unchanged when valid.
fn validated_version(value: &str) -> Option<String> {
    let components: Vec<&str> = value.split('.').collect();
    if components.is_empty() || components.len() > 4 {
        return None;
    }
    for component in &components {
        if component.is_empty() || !component.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        if component.parse::<u32>().is_err() {
            return None;
        }
    }
    Some(value.to_string())
}

/// Include/exclude rules are glob-escaped before storage so backslashes and
/// URL query separators match literally.
fn escape_glob(value: &str) -> String {
    value.replace('\\', "\\\\").replace('?', "\\?")
}

/// Parse the metadata header of `text` into `script`.
///
/// A file whose final line lacks a trailing newline loses that line's last
/// byte; header files are expected to be newline-terminated. See the
/// `final_line_without_newline` test.
pub fn parse_metadata_header(text: &str, script: &mut UserScript) -> Result<(), MetadataError> {
    let mut line_start = 0;
    let mut in_metadata = false;

    while line_start < text.len() {
        let (line_end, next_start) = match text[line_start..].find('\n') {
            Some(offset) => (line_start + offset, line_start + offset + 1),
            None => (floor_char_boundary(text, text.len() - 1), text.len()),
        };
        let line = &text[line_start..line_end];
        line_start = next_start;

        if !in_metadata {
            if line.starts_with(USER_SCRIPT_BEGIN) {
                in_metadata = true;
            }
            continue;
        }
        if line.starts_with(USER_SCRIPT_END) {
            break;
        }

        if let Some(value) = declaration_value(line, NAMESPACE) {
            script.name_space = value;
        } else if let Some(value) = declaration_value(line, NAME) {
            script.name = value;
        } else if let Some(value) = declaration_value(line, DESCRIPTION) {
            script.description = value;
        } else if let Some(value) = declaration_value(line, VERSION) {
            match validated_version(&value) {
                Some(version) => script.version = Some(version),
                None => debug!(value = %value, "ignoring invalid @version"),
            }
        } else if let Some(value) = declaration_value(line, INCLUDE) {
            script.globs.push(MatchGlob::new(escape_glob(&value)));
        } else if let Some(value) = declaration_value(line, EXCLUDE_MATCH) {
            let pattern = UrlPattern::parse(&value).map_err(|source| {
                MetadataError::InvalidPattern {
                    value: value.clone(),
                    source,
                }
            })?;
            script.exclude_url_patterns.push(pattern);
        } else if let Some(value) = declaration_value(line, EXCLUDE) {
            script.exclude_globs.push(MatchGlob::new(escape_glob(&value)));
        } else if let Some(value) = declaration_value(line, MATCH) {
            let pattern = UrlPattern::parse(&value).map_err(|source| {
                MetadataError::InvalidPattern {
                    value: value.clone(),
                    source,
                }
            })?;
            script.url_patterns.push(pattern);
        } else if let Some(value) = declaration_value(line, RUN_AT) {
            script.run_location = Some(match value.as_str() {
                RUN_AT_DOCUMENT_START => RunLocation::DocumentStart,
                RUN_AT_DOCUMENT_END => RunLocation::DocumentEnd,
                RUN_AT_DOCUMENT_IDLE => RunLocation::DocumentIdle,
                _ => return Err(MetadataError::InvalidRunAt(value)),
            });
        } else if let Some(value) = declaration_value(line, URL_SOURCE) {
            script.url_source = Some(value);
        }
        // Unknown directives and free-form comment lines are ignored.
    }

    if script.has_no_inclusion_rules() {
        script.globs.push(MatchGlob::new("*"));
    }
    Ok(())
}

/// Largest char boundary at or below `index`.
fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}
