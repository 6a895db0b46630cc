//! Effective-URL resolution for documents with opaque origins.
//!
//! about: and data: documents carry no matchable URL of their own. Depending
//! on a script's fallback policy we either match the (precursor) origin
//! directly, or climb the frame tree looking for the nearest ancestor with a
//! real URL — but only if that ancestor's origin agrees with the document's
//! precursor, so a script never matches across an origin boundary.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use tracing::debug;
use url::Url;

use crate::script::MatchOriginAsFallback;
use crate::types::ContextId;

/// The (scheme, host, port) tuple of an origin, or of an opaque origin's
/// precursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginTuple {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl OriginTuple {
    pub fn from_url(url: &Url) -> Option<OriginTuple> {
        Some(OriginTuple {
            scheme: url.scheme().to_string(),
            host: url.host_str()?.to_string(),
            port: url.port_or_known_default().unwrap_or(0),
        })
    }

    /// Serialize the tuple back into a bare origin URL for matching.
    pub fn to_url(&self) -> Option<Url> {
        let mut url = Url::parse(&format!("{}://{}/", self.scheme, self.host)).ok()?;
        if url.port_or_known_default() != Some(self.port) {
            url.set_port(Some(self.port)).ok()?;
        }
        Some(url)
    }
}

/// View of the frame tree the embedder exposes for origin climbing.
pub trait FrameTree: Send + Sync {
    /// Parent frame, or for a top-level frame its opener, if any.
    fn parent_or_opener(&self, frame: ContextId) -> Option<ContextId>;

    /// Current document URL of the frame.
    fn document_url(&self, frame: ContextId) -> Option<Url>;

    /// The frame origin's tuple, or its precursor tuple when opaque.
    fn origin_tuple(&self, frame: ContextId) -> Option<OriginTuple>;
}

/// Resolve the URL to run admission against for one document.
///
/// Every bail-out (chain end, cycle, missing data, origin mismatch) falls
/// back to the document's own URL, never to a partially-climbed one.
pub fn effective_document_url(
    tree: &dyn FrameTree,
    frame: ContextId,
    document_url: &Url,
    behavior: MatchOriginAsFallback,
) -> Url {
    match behavior {
        MatchOriginAsFallback::Never => document_url.clone(),
        MatchOriginAsFallback::Always => {
            if document_url.scheme() != "about" && document_url.scheme() != "data" {
                return document_url.clone();
            }
            match tree.origin_tuple(frame).and_then(|t| t.to_url()) {
                Some(origin_url) => origin_url,
                None => document_url.clone(),
            }
        }
        MatchOriginAsFallback::MatchForAboutSchemeAndClimbTree => {
            if document_url.scheme() != "about" {
                return document_url.clone();
            }
            climb_for_url(tree, frame, document_url)
        }
    }
}

fn climb_for_url(tree: &dyn FrameTree, frame: ContextId, document_url: &Url) -> Url {
    let Some(expected) = tree.origin_tuple(frame) else {
        return document_url.clone();
    };

    let mut visited = HashSet::new();
    visited.insert(frame);
    let mut current = frame;

    loop {
        let Some(next) = tree.parent_or_opener(current) else {
            return document_url.clone();
        };
        if !visited.insert(next) {
            debug!(frame = %frame, "frame chain cycle while climbing for effective URL");
            return document_url.clone();
        }
        let Some(url) = tree.document_url(next) else {
            return document_url.clone();
        };
        if url.scheme() == "about" {
            current = next;
            continue;
        }
        // Nearest ancestor with a real URL. Only usable when its origin
        // tuple agrees with this document's precursor.
        match tree.origin_tuple(next) {
            Some(tuple) if tuple == expected => return url,
            _ => return document_url.clone(),
        }
    }
}

/// Simple owned frame registry implementing [`FrameTree`].
///
/// Embedders that already track their frame tree can implement the trait
/// directly; this registry covers hosts (and tests) that do not.
#[derive(Debug, Default)]
pub struct FrameMap {
    frames: RwLock<HashMap<ContextId, FrameEntry>>,
}

#[derive(Debug, Clone, Default)]
struct FrameEntry {
    url: Option<Url>,
    parent_or_opener: Option<ContextId>,
    origin_tuple: Option<OriginTuple>,
}

impl FrameMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a frame. `origin_tuple` may be the precursor of
    /// an opaque origin; when `None` it is derived from the URL.
    pub fn insert(
        &self,
        frame: ContextId,
        url: Option<Url>,
        parent_or_opener: Option<ContextId>,
        origin_tuple: Option<OriginTuple>,
    ) {
        let origin_tuple = origin_tuple.or_else(|| url.as_ref().and_then(OriginTuple::from_url));
        if let Ok(mut frames) = self.frames.write() {
            frames.insert(
                frame,
                FrameEntry {
                    url,
                    parent_or_opener,
                    origin_tuple,
                },
            );
        }
    }

    pub fn set_document_url(&self, frame: ContextId, url: Url) {
        if let Ok(mut frames) = self.frames.write() {
            let entry = frames.entry(frame).or_default();
            entry.origin_tuple = OriginTuple::from_url(&url);
            entry.url = Some(url);
        }
    }

    pub fn remove(&self, frame: ContextId) {
        if let Ok(mut frames) = self.frames.write() {
            frames.remove(&frame);
        }
    }
}

impl FrameTree for FrameMap {
    fn parent_or_opener(&self, frame: ContextId) -> Option<ContextId> {
        self.frames.read().ok()?.get(&frame)?.parent_or_opener
    }

    fn document_url(&self, frame: ContextId) -> Option<Url> {
        self.frames.read().ok()?.get(&frame)?.url.clone()
    }

    fn origin_tuple(&self, frame: ContextId) -> Option<OriginTuple> {
        self.frames.read().ok()?.get(&frame)?.origin_tuple.clone()
    }
}
