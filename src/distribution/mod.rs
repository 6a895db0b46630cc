//! Versioned binary distribution of the active script set.
//!
//! The producer serializes the whole set into one read-only region; consumers
//! decode independent duplicates of it. Layout (all integers little-endian):
//!
//! ```text
//! u32 record_count
//! record_count x header:
//!     str key, name, namespace, description, version, url_source
//!     u8 run_location, u8 origin_fallback, u8 flags (bit0 greasemonkey,
//!                                                    bit1 has_css)
//!     list globs, list exclude_globs, list patterns, list exclude_patterns
//!     str js_content_key, str css_content_key
//! record_count x js payload (length-prefixed), in header order
//! one css payload per has_css record (length-prefixed), in header order
//! ```
//!
//! where `str` is u32 length + UTF-8 bytes and `list` is u32 count + strs.
//! Consumers treat the region as untrusted: every read is bounds-checked and
//! any corruption rejects the whole update.

use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;
use tracing::debug;

use crate::matcher::{MatchGlob, UrlPattern};
use crate::script::{MatchOriginAsFallback, RunLocation, ScriptFile, UserScript};

/// Sanity cap on the record count, enforced at serialize time and checked
/// again before any per-record decode work.
pub const MAX_SCRIPT_COUNT: u32 = 100_000;

const FLAG_EMULATE_GREASEMONKEY: u8 = 1 << 0;
const FLAG_HAS_CSS: u8 = 1 << 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DistributionError {
    #[error("record count {0} exceeds sanity maximum {MAX_SCRIPT_COUNT}")]
    TooManyRecords(u32),
    #[error("truncated region: needed {needed} more bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },
    #[error("non-UTF8 string field in region")]
    InvalidString,
    #[error("invalid {field} tag {value}")]
    InvalidTag { field: &'static str, value: u8 },
    #[error("invalid embedded match pattern \"{0}\"")]
    InvalidPattern(String),
    #[error("region allocation failed")]
    ResourceExhausted,
}

/// An immutable, duplicable region holding one serialized script set.
#[derive(Debug, Clone)]
pub struct ScriptRegion {
    bytes: Bytes,
}

impl ScriptRegion {
    /// An independent read-only handle onto the same underlying storage.
    pub fn duplicate(&self) -> ScriptRegion {
        self.clone()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Serialize the active set into a region sized exactly to its encoding.
pub fn serialize(scripts: &[UserScript]) -> Result<ScriptRegion, DistributionError> {
    if scripts.len() > MAX_SCRIPT_COUNT as usize {
        return Err(DistributionError::TooManyRecords(scripts.len() as u32));
    }

    let mut encoded = Vec::new();
    encoded.put_u32_le(scripts.len() as u32);

    for script in scripts {
        put_str(&mut encoded, &script.key);
        put_str(&mut encoded, &script.name);
        put_str(&mut encoded, &script.name_space);
        put_str(&mut encoded, &script.description);
        put_str(&mut encoded, script.version.as_deref().unwrap_or(""));
        put_str(&mut encoded, script.url_source.as_deref().unwrap_or(""));

        encoded.put_u8(script.run_location().as_u8());
        encoded.put_u8(script.match_origin_as_fallback.as_u8());
        let mut flags = 0u8;
        if script.emulate_greasemonkey {
            flags |= FLAG_EMULATE_GREASEMONKEY;
        }
        if script.css.is_some() {
            flags |= FLAG_HAS_CSS;
        }
        encoded.put_u8(flags);

        put_list(&mut encoded, script.globs.iter().map(MatchGlob::as_str));
        put_list(&mut encoded, script.exclude_globs.iter().map(MatchGlob::as_str));
        put_list(&mut encoded, script.url_patterns.iter().map(UrlPattern::as_str));
        put_list(
            &mut encoded,
            script.exclude_url_patterns.iter().map(UrlPattern::as_str),
        );

        put_str(
            &mut encoded,
            script.js.as_ref().map(ScriptFile::content_key).unwrap_or(""),
        );
        put_str(
            &mut encoded,
            script.css.as_ref().map(ScriptFile::content_key).unwrap_or(""),
        );
    }

    for script in scripts {
        match &script.js {
            Some(js) => put_bytes(&mut encoded, js.content()),
            None => put_bytes(&mut encoded, &[]),
        }
    }
    for script in scripts {
        if let Some(css) = &script.css {
            put_bytes(&mut encoded, css.content());
        }
    }

    // Copy into storage sized exactly to the encoding; an allocation failure
    // here must not take the producer down.
    let mut region = Vec::new();
    region
        .try_reserve_exact(encoded.len())
        .map_err(|_| DistributionError::ResourceExhausted)?;
    region.extend_from_slice(&encoded);

    debug!(
        records = scripts.len(),
        bytes = region.len(),
        "serialized script distribution"
    );
    Ok(ScriptRegion {
        bytes: Bytes::from(region),
    })
}

/// Decode a region into records. Payload contents are zero-copy slices of
/// the region's storage.
pub fn parse(region: &ScriptRegion) -> Result<Vec<UserScript>, DistributionError> {
    let mut reader = Reader::new(region.bytes.clone());

    let record_count = reader.read_u32()?;
    if record_count > MAX_SCRIPT_COUNT {
        return Err(DistributionError::TooManyRecords(record_count));
    }

    let mut scripts = Vec::with_capacity(record_count.min(1024) as usize);
    for _ in 0..record_count {
        let mut script = UserScript::new(reader.read_string()?);
        script.name = reader.read_string()?;
        script.name_space = reader.read_string()?;
        script.description = reader.read_string()?;
        script.version = non_empty(reader.read_string()?);
        script.url_source = non_empty(reader.read_string()?);

        let run_location = reader.read_u8()?;
        script.run_location = Some(RunLocation::from_u8(run_location).ok_or(
            DistributionError::InvalidTag {
                field: "run_location",
                value: run_location,
            },
        )?);
        let fallback = reader.read_u8()?;
        script.match_origin_as_fallback = MatchOriginAsFallback::from_u8(fallback).ok_or(
            DistributionError::InvalidTag {
                field: "origin_fallback",
                value: fallback,
            },
        )?;
        let flags = reader.read_u8()?;
        script.emulate_greasemonkey = flags & FLAG_EMULATE_GREASEMONKEY != 0;
        let has_css = flags & FLAG_HAS_CSS != 0;

        for _ in 0..reader.read_u32()? {
            script.globs.push(MatchGlob::new(reader.read_string()?));
        }
        for _ in 0..reader.read_u32()? {
            script
                .exclude_globs
                .push(MatchGlob::new(reader.read_string()?));
        }
        for _ in 0..reader.read_u32()? {
            let source = reader.read_string()?;
            script.url_patterns.push(
                UrlPattern::parse(&source)
                    .map_err(|_| DistributionError::InvalidPattern(source))?,
            );
        }
        for _ in 0..reader.read_u32()? {
            let source = reader.read_string()?;
            script.exclude_url_patterns.push(
                UrlPattern::parse(&source)
                    .map_err(|_| DistributionError::InvalidPattern(source))?,
            );
        }

        let js_key = reader.read_string()?;
        let css_key = reader.read_string()?;
        // Payload contents arrive in the trailing sections; stash the keys
        // in placeholder files until then.
        script.js = Some(ScriptFile::from_parts(Bytes::new(), js_key));
        if has_css {
            script.css = Some(ScriptFile::from_parts(Bytes::new(), css_key));
        }
        scripts.push(script);
    }

    for script in &mut scripts {
        let content = reader.read_payload()?;
        if let Some(js) = script.js.take() {
            script.js = Some(ScriptFile::from_parts(content, js.content_key().to_string()));
        }
    }
    for script in &mut scripts {
        if let Some(css) = script.css.take() {
            let content = reader.read_payload()?;
            script.css = Some(ScriptFile::from_parts(
                content,
                css.content_key().to_string(),
            ));
        }
    }

    Ok(scripts)
}

/// Test helper: wrap raw bytes as a region without going through
/// `serialize`, for corruption scenarios.
#[cfg(test)]
pub(crate) fn region_from_raw(bytes: &[u8]) -> ScriptRegion {
    ScriptRegion {
        bytes: Bytes::copy_from_slice(bytes),
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn put_str(buf: &mut Vec<u8>, value: &str) {
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

fn put_bytes(buf: &mut Vec<u8>, value: &[u8]) {
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(value);
}

fn put_list<'a>(buf: &mut Vec<u8>, values: impl ExactSizeIterator<Item = &'a str>) {
    buf.put_u32_le(values.len() as u32);
    for value in values {
        put_str(buf, value);
    }
}

/// Bounds-checked cursor over an untrusted region.
struct Reader {
    buf: Bytes,
    pos: usize,
}

impl Reader {
    fn new(buf: Bytes) -> Self {
        Self { buf, pos: 0 }
    }

    fn ensure(&self, needed: usize) -> Result<(), DistributionError> {
        let remaining = self.buf.len() - self.pos;
        if needed > remaining {
            return Err(DistributionError::Truncated { needed, remaining });
        }
        Ok(())
    }

    fn read_u8(&mut self) -> Result<u8, DistributionError> {
        self.ensure(1)?;
        let value = self.buf[self.pos];
        self.pos += 1;
        Ok(value)
    }

    fn read_u32(&mut self) -> Result<u32, DistributionError> {
        self.ensure(4)?;
        let value = (&self.buf[self.pos..self.pos + 4]).get_u32_le();
        self.pos += 4;
        Ok(value)
    }

    fn read_string(&mut self) -> Result<String, DistributionError> {
        let len = self.read_u32()? as usize;
        self.ensure(len)?;
        let value = std::str::from_utf8(&self.buf[self.pos..self.pos + len])
            .map_err(|_| DistributionError::InvalidString)?
            .to_string();
        self.pos += len;
        Ok(value)
    }

    /// A length-prefixed payload as a zero-copy slice of the region.
    fn read_payload(&mut self) -> Result<Bytes, DistributionError> {
        let len = self.read_u32()? as usize;
        self.ensure(len)?;
        let value = self.buf.slice(self.pos..self.pos + len);
        self.pos += len;
        Ok(value)
    }
}
