//! User script records: the unit everything else stores, ships and injects.

pub mod metadata;

use std::path::PathBuf;

use bytes::Bytes;
use sha2::{Digest, Sha256};

use crate::matcher::{MatchGlob, UrlPattern};

/// Document lifecycle stage at which a script payload runs.
///
/// Ordering matters: the scheduler only advances forward through these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RunLocation {
    DocumentStart,
    DocumentEnd,
    DocumentIdle,
}

impl RunLocation {
    /// The stage that immediately follows this one.
    pub fn next(self) -> Option<RunLocation> {
        match self {
            RunLocation::DocumentStart => Some(RunLocation::DocumentEnd),
            RunLocation::DocumentEnd => Some(RunLocation::DocumentIdle),
            RunLocation::DocumentIdle => None,
        }
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            RunLocation::DocumentStart => 0,
            RunLocation::DocumentEnd => 1,
            RunLocation::DocumentIdle => 2,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Option<RunLocation> {
        match value {
            0 => Some(RunLocation::DocumentStart),
            1 => Some(RunLocation::DocumentEnd),
            2 => Some(RunLocation::DocumentIdle),
            _ => None,
        }
    }
}

/// Fallback policy for documents whose own URL is unmatchable (about:, data:).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchOriginAsFallback {
    /// Match the document URL only.
    #[default]
    Never,
    /// For about: documents, climb parent/opener frames for a matchable URL.
    MatchForAboutSchemeAndClimbTree,
    /// Match against the (precursor) origin directly.
    Always,
}

impl MatchOriginAsFallback {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            MatchOriginAsFallback::Never => 0,
            MatchOriginAsFallback::MatchForAboutSchemeAndClimbTree => 1,
            MatchOriginAsFallback::Always => 2,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Option<MatchOriginAsFallback> {
        match value {
            0 => Some(MatchOriginAsFallback::Never),
            1 => Some(MatchOriginAsFallback::MatchForAboutSchemeAndClimbTree),
            2 => Some(MatchOriginAsFallback::Always),
            _ => None,
        }
    }
}

/// One payload carried by a script: the content plus its identity.
///
/// The content key is the SHA-256 of the content, hex-encoded. Consumers use
/// it for deduplication and source memoization, so two payloads with equal
/// bytes share identity regardless of which record carried them.
#[derive(Debug, Clone)]
pub struct ScriptFile {
    content: Bytes,
    content_key: String,
}

impl ScriptFile {
    pub fn new(content: impl Into<Bytes>) -> Self {
        let content = content.into();
        let content_key = hex::encode(Sha256::digest(&content));
        Self {
            content,
            content_key,
        }
    }

    /// Rebuild from already-known parts (wire decode path).
    pub(crate) fn from_parts(content: Bytes, content_key: String) -> Self {
        Self {
            content,
            content_key,
        }
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn content_key(&self) -> &str {
        &self.content_key
    }

    /// Content as text. Producers validate UTF-8 at load time; anything that
    /// slipped through a hostile region is replaced rather than trusted.
    pub fn source(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.content)
    }
}

/// A complete user script record.
#[derive(Debug, Clone, Default)]
pub struct UserScript {
    /// Stable identity, derived from the backing file name.
    pub key: String,
    pub name: String,
    pub name_space: String,
    pub description: String,
    /// Only set when the declared version parsed as dotted integers.
    pub version: Option<String>,
    /// Homepage/source URL declared by the script, if any.
    pub url_source: Option<String>,
    /// Backing file on disk, when loaded from storage.
    pub file_path: Option<PathBuf>,

    pub globs: Vec<MatchGlob>,
    pub exclude_globs: Vec<MatchGlob>,
    pub url_patterns: Vec<UrlPattern>,
    pub exclude_url_patterns: Vec<UrlPattern>,

    pub run_location: Option<RunLocation>,
    pub emulate_greasemonkey: bool,
    pub match_origin_as_fallback: MatchOriginAsFallback,

    pub js: Option<ScriptFile>,
    pub css: Option<ScriptFile>,
}

impl UserScript {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Self::default()
        }
    }

    /// Stage the JS payload runs at. Unset records default to document-idle.
    pub fn run_location(&self) -> RunLocation {
        self.run_location.unwrap_or(RunLocation::DocumentIdle)
    }

    /// True when the record declares no include/match directive at all and
    /// therefore should receive the implicit catch-all glob.
    pub(crate) fn has_no_inclusion_rules(&self) -> bool {
        self.globs.is_empty() && self.url_patterns.is_empty()
    }
}
