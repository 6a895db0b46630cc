//! Consumer-side decoded script set.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, trace};
use url::Url;

use crate::distribution::{self, DistributionError, ScriptRegion};
use crate::matcher::{self, effective_document_url, FrameTree};
use crate::scheduler::task::ScriptInjection;
use crate::script::{RunLocation, ScriptFile, UserScript};
use crate::types::ContextId;

#[derive(Debug, Default)]
pub struct ScriptSet {
    scripts: Vec<Arc<UserScript>>,
}

/// Content keys of both payloads, empty string where a payload is absent.
fn payload_keys(script: &UserScript) -> (&str, &str) {
    (
        script.js.as_ref().map(ScriptFile::content_key).unwrap_or(""),
        script
            .css
            .as_ref()
            .map(ScriptFile::content_key)
            .unwrap_or(""),
    )
}

impl ScriptSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the set with the contents of `region`.
    ///
    /// Returns the keys of scripts that vanished or whose payload content
    /// changed, so pending work scheduled against them can be cancelled.
    /// A corrupt region is rejected wholesale and leaves the set untouched.
    pub fn update(&mut self, region: &ScriptRegion) -> Result<HashSet<String>, DistributionError> {
        let incoming = distribution::parse(region)?;

        let previous: HashMap<&str, (&str, &str)> = self
            .scripts
            .iter()
            .map(|s| (s.key.as_str(), payload_keys(s)))
            .collect();

        let mut changed = HashSet::new();
        for (key, old_keys) in &previous {
            let replacement = incoming.iter().find(|s| s.key == *key);
            let still_same = replacement.is_some_and(|s| payload_keys(s) == *old_keys);
            if !still_same {
                changed.insert((*key).to_string());
            }
        }

        debug!(
            scripts = incoming.len(),
            changed = changed.len(),
            "script set updated"
        );
        self.scripts = incoming.into_iter().map(Arc::new).collect();
        Ok(changed)
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }

    /// Build the injection tasks due for one context at one stage.
    ///
    /// A bundle carries its stylesheet only at document-start, and its
    /// script only at the stage it declared.
    pub fn injections_for(
        &self,
        frames: &dyn FrameTree,
        context: ContextId,
        document_url: &Url,
        stage: RunLocation,
    ) -> Vec<ScriptInjection> {
        let mut tasks = Vec::new();
        for script in &self.scripts {
            let effective = effective_document_url(
                frames,
                context,
                document_url,
                script.match_origin_as_fallback,
            );
            if !matcher::matches_url(script, &effective) {
                trace!(key = %script.key, url = %effective, "script not admissible");
                continue;
            }
            let inject_css = script.css.is_some() && stage == RunLocation::DocumentStart;
            let inject_js = script.js.is_some() && script.run_location() == stage;
            if inject_css || inject_js {
                tasks.push(ScriptInjection::new(
                    Arc::clone(script),
                    context,
                    inject_js,
                    inject_css,
                ));
            }
        }
        tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::{FrameMap, MatchGlob};

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn script(key: &str, body: &str, run_at: RunLocation) -> UserScript {
        let mut script = UserScript::new(key);
        script.globs.push(MatchGlob::new("https://example.com/*"));
        script.run_location = Some(run_at);
        script.js = Some(ScriptFile::new(body.as_bytes().to_vec()));
        script
    }

    fn region_of(scripts: &[UserScript]) -> ScriptRegion {
        distribution::serialize(scripts).unwrap()
    }

    #[test]
    fn update_reports_removed_and_changed_keys() {
        let mut set = ScriptSet::new();
        set.update(&region_of(&[
            script("a.user.js", "a1();", RunLocation::DocumentIdle),
            script("b.user.js", "b();", RunLocation::DocumentIdle),
            script("c.user.js", "c();", RunLocation::DocumentIdle),
        ]))
        .unwrap();

        // a changes content, b vanishes, c stays identical.
        let changed = set
            .update(&region_of(&[
                script("a.user.js", "a2();", RunLocation::DocumentIdle),
                script("c.user.js", "c();", RunLocation::DocumentIdle),
            ]))
            .unwrap();

        assert!(changed.contains("a.user.js"));
        assert!(changed.contains("b.user.js"));
        assert!(!changed.contains("c.user.js"));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn stylesheet_only_change_is_reported() {
        let mut red = script("a.user.js", "a();", RunLocation::DocumentEnd);
        red.css = Some(ScriptFile::new("p { color: red }".as_bytes().to_vec()));
        let mut set = ScriptSet::new();
        set.update(&region_of(&[red])).unwrap();

        // Same key, same script body, recolored stylesheet.
        let mut blue = script("a.user.js", "a();", RunLocation::DocumentEnd);
        blue.css = Some(ScriptFile::new("p { color: blue }".as_bytes().to_vec()));
        let changed = set.update(&region_of(&[blue])).unwrap();

        assert!(changed.contains("a.user.js"));
    }

    #[test]
    fn corrupt_region_leaves_the_set_untouched() {
        let mut set = ScriptSet::new();
        set.update(&region_of(&[script(
            "a.user.js",
            "a();",
            RunLocation::DocumentIdle,
        )]))
        .unwrap();

        let good = region_of(&[script("b.user.js", "b();", RunLocation::DocumentIdle)]);
        let bytes = good.as_bytes();
        let cut = distribution::region_from_raw(&bytes[..bytes.len() - 2]);
        assert!(set.update(&cut).is_err());
        assert_eq!(set.len(), 1);
        assert_eq!(set.scripts[0].key, "a.user.js");
    }

    #[test]
    fn stage_gating_for_js_and_css() {
        let mut with_css = script("s.user.js", "s();", RunLocation::DocumentEnd);
        with_css.css = Some(ScriptFile::new("p {}".as_bytes().to_vec()));

        let mut set = ScriptSet::new();
        set.update(&region_of(&[with_css])).unwrap();

        let frames = FrameMap::new();
        let page = url("https://example.com/page");

        // Start: stylesheet only.
        let start = set.injections_for(&frames, ContextId(1), &page, RunLocation::DocumentStart);
        assert_eq!(start.len(), 1);

        // End: script only.
        let end = set.injections_for(&frames, ContextId(1), &page, RunLocation::DocumentEnd);
        assert_eq!(end.len(), 1);

        // Idle: nothing due.
        let idle = set.injections_for(&frames, ContextId(1), &page, RunLocation::DocumentIdle);
        assert!(idle.is_empty());
    }

    #[test]
    fn non_matching_url_yields_nothing() {
        let mut set = ScriptSet::new();
        set.update(&region_of(&[script(
            "a.user.js",
            "a();",
            RunLocation::DocumentIdle,
        )]))
        .unwrap();

        let frames = FrameMap::new();
        let other = url("https://other.org/");
        let tasks = set.injections_for(&frames, ContextId(1), &other, RunLocation::DocumentIdle);
        assert!(tasks.is_empty());
    }
}
