//! Injection tasks and the host execution capability.

use std::collections::HashSet;
use std::sync::Arc;

use crate::cache::SourceCache;
use crate::script::{RunLocation, UserScript};
use crate::types::ContextId;

/// What the host did with an injection request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionOutcome {
    /// Injected synchronously (or deduplicated away).
    Finished,
    /// Injection started; completion arrives via `injection_finished`.
    Blocked,
    /// The host cannot take it yet; retry on a later pass.
    Waiting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionKind {
    Script,
    Stylesheet,
}

/// One payload handed to the host for execution.
#[derive(Debug)]
pub struct InjectionRequest<'a> {
    pub context: ContextId,
    /// Task id to report back through `injection_finished` when the
    /// outcome was `Blocked`.
    pub task: u64,
    pub script_key: &'a str,
    pub content_key: &'a str,
    pub kind: InjectionKind,
    pub source: &'a str,
}

/// Opaque execution capability. The engine decides *what* to inject and
/// *when*; the host performs the actual execution.
pub trait InjectionHost: Send + Sync {
    fn inject(&self, request: &InjectionRequest<'_>) -> InjectionOutcome;
}

/// A payload a task still owes its context, resolved against the dedup
/// sets and ready to hand to the host.
#[derive(Debug, Clone)]
pub(crate) struct DuePayload {
    pub(crate) kind: InjectionKind,
    pub(crate) content_key: String,
    pub(crate) source: Arc<str>,
}

/// One script bundle scheduled into one context at one stage.
#[derive(Debug, Clone)]
pub struct ScriptInjection {
    pub(crate) id: u64,
    script: Arc<UserScript>,
    context: ContextId,
    inject_js: bool,
    inject_css: bool,
}

impl ScriptInjection {
    pub(crate) fn new(
        script: Arc<UserScript>,
        context: ContextId,
        inject_js: bool,
        inject_css: bool,
    ) -> Self {
        Self {
            id: 0,
            script,
            context,
            inject_js,
            inject_css,
        }
    }

    pub fn script_key(&self) -> &str {
        &self.script.key
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn run_location(&self) -> RunLocation {
        self.script.run_location()
    }

    /// The payloads still due in this context, stylesheet before script.
    /// Content whose key already sits in a dedup set is skipped.
    ///
    /// The caller marks the returned keys in the dedup sets *before*
    /// calling the host, so a reentrant pass sees them as in flight.
    pub(crate) fn due_payloads(
        &self,
        cache: &SourceCache,
        executed: &HashSet<String>,
        inserted: &HashSet<String>,
    ) -> Vec<DuePayload> {
        let mut due = Vec::new();
        if self.inject_css {
            if let Some(css) = &self.script.css {
                if !inserted.contains(css.content_key()) {
                    due.push(DuePayload {
                        kind: InjectionKind::Stylesheet,
                        content_key: css.content_key().to_string(),
                        source: cache.css_source(css),
                    });
                }
            }
        }
        if self.inject_js {
            if let Some(js) = &self.script.js {
                if !executed.contains(js.content_key()) {
                    due.push(DuePayload {
                        kind: InjectionKind::Script,
                        content_key: js.content_key().to_string(),
                        source: cache.js_source(js, self.script.emulate_greasemonkey),
                    });
                }
            }
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::ScriptFile;

    fn bundle(js: &str, css: Option<&str>) -> Arc<UserScript> {
        let mut script = UserScript::new("b.user.js");
        script.js = Some(ScriptFile::new(js.as_bytes().to_vec()));
        script.css = css.map(|c| ScriptFile::new(c.as_bytes().to_vec()));
        Arc::new(script)
    }

    #[test]
    fn stylesheet_precedes_script() {
        let cache = SourceCache::new();
        let task = ScriptInjection::new(bundle("js();", Some("css {}")), ContextId(1), true, true);

        let due = task.due_payloads(&cache, &HashSet::new(), &HashSet::new());
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].kind, InjectionKind::Stylesheet);
        assert_eq!(due[1].kind, InjectionKind::Script);
        assert_eq!(&*due[1].source, "js();");
    }

    #[test]
    fn content_already_in_dedup_sets_is_skipped() {
        let cache = SourceCache::new();
        let script = bundle("js();", Some("css {}"));
        let js_key = script.js.as_ref().unwrap().content_key().to_string();
        let task = ScriptInjection::new(script, ContextId(1), true, true);

        let executed: HashSet<String> = [js_key].into();
        let due = task.due_payloads(&cache, &executed, &HashSet::new());
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].kind, InjectionKind::Stylesheet);
    }

    #[test]
    fn stage_flags_gate_payloads() {
        let cache = SourceCache::new();
        let task = ScriptInjection::new(bundle("js();", Some("css {}")), ContextId(1), false, true);

        let due = task.due_payloads(&cache, &HashSet::new(), &HashSet::new());
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].kind, InjectionKind::Stylesheet);
    }

    #[test]
    fn greasemonkey_wrap_travels_with_the_payload() {
        let cache = SourceCache::new();
        let mut script = UserScript::new("gm.user.js");
        script.js = Some(ScriptFile::new("js();".as_bytes().to_vec()));
        script.emulate_greasemonkey = true;
        let task = ScriptInjection::new(Arc::new(script), ContextId(1), true, false);

        let due = task.due_payloads(&cache, &HashSet::new(), &HashSet::new());
        assert!(due[0].source.starts_with("(function (unsafeWindow) {\n"));
    }
}
