//! Consumer-side memoization of injectable source text.
//!
//! Wrapping and UTF-8 conversion happen once per content key; repeat
//! injections of the same payload reuse the cached `Arc<str>`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::script::ScriptFile;

/// Greasemonkey-compatible wrapper giving scripts an `unsafeWindow` binding.
const GREASEMONKEY_HEAD: &str = "(function (unsafeWindow) {\n";
const GREASEMONKEY_TAIL: &str = "\n})(window);";

#[derive(Debug, Default)]
pub struct SourceCache {
    sources: DashMap<String, Arc<str>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl SourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Injectable JS source for a payload, wrapped when the script emulates
    /// the greasemonkey environment.
    pub fn js_source(&self, file: &ScriptFile, emulate_greasemonkey: bool) -> Arc<str> {
        // Wrapped and plain renditions of the same content are distinct.
        let key = if emulate_greasemonkey {
            format!("{}+gm", file.content_key())
        } else {
            file.content_key().to_string()
        };
        self.lookup(key, || {
            if emulate_greasemonkey {
                format!("{GREASEMONKEY_HEAD}{}{GREASEMONKEY_TAIL}", file.source())
            } else {
                file.source().into_owned()
            }
        })
    }

    /// Injectable stylesheet text for a payload.
    pub fn css_source(&self, file: &ScriptFile) -> Arc<str> {
        self.lookup(file.content_key().to_string(), || {
            file.source().into_owned()
        })
    }

    fn lookup(&self, key: String, build: impl FnOnce() -> String) -> Arc<str> {
        if let Some(source) = self.sources.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Arc::clone(&source);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let source: Arc<str> = Arc::from(build());
        debug!(key = %key, bytes = source.len(), "memoized script source");
        self.sources.insert(key, Arc::clone(&source));
        source
    }

    /// Drop all memoized sources (the script set changed).
    pub fn clear(&self) {
        self.sources.clear();
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}
