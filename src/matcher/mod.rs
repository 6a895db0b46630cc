//! URL admission: globs, match patterns and origin fallback.

pub mod glob;
pub mod origin;
pub mod pattern;

pub use glob::MatchGlob;
pub use origin::{effective_document_url, FrameMap, FrameTree, OriginTuple};
pub use pattern::{PatternError, UrlPattern};

use url::Url;

use crate::script::UserScript;

/// Whether a script is admissible for a document at `url`.
///
/// Admission requires at least one include glob or match pattern to hit,
/// and no exclude glob or exclude pattern to hit. Globs run against the
/// full URL string; patterns against the parsed URL.
pub fn matches_url(script: &UserScript, url: &Url) -> bool {
    let spec = url.as_str();

    let included = script.globs.iter().any(|g| g.matches(spec))
        || script.url_patterns.iter().any(|p| p.matches(url));
    if !included {
        return false;
    }
    if script.exclude_globs.iter().any(|g| g.matches(spec)) {
        return false;
    }
    if script.exclude_url_patterns.iter().any(|p| p.matches(url)) {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn include_glob_admits() {
        let mut script = UserScript::new("a.user.js");
        script.globs.push(MatchGlob::new("https://example.com/*"));
        assert!(matches_url(&script, &url("https://example.com/page")));
        assert!(!matches_url(&script, &url("https://other.com/page")));
    }

    #[test]
    fn match_pattern_admits() {
        let mut script = UserScript::new("a.user.js");
        script
            .url_patterns
            .push(UrlPattern::parse("*://*.example.com/*").unwrap());
        assert!(matches_url(&script, &url("http://www.example.com/x")));
    }

    #[test]
    fn exclude_glob_wins_over_include() {
        let mut script = UserScript::new("a.user.js");
        script.globs.push(MatchGlob::new("https://example.com/*"));
        script
            .exclude_globs
            .push(MatchGlob::new("https://example.com/admin/*"));
        assert!(matches_url(&script, &url("https://example.com/page")));
        assert!(!matches_url(&script, &url("https://example.com/admin/panel")));
    }

    #[test]
    fn exclude_pattern_wins_over_include() {
        let mut script = UserScript::new("a.user.js");
        script.globs.push(MatchGlob::new("*"));
        script
            .exclude_url_patterns
            .push(UrlPattern::parse("https://example.com/*").unwrap());
        assert!(matches_url(&script, &url("https://other.com/")));
        assert!(!matches_url(&script, &url("https://example.com/")));
    }

    #[test]
    fn no_rules_means_no_admission() {
        // The implicit catch-all is the parser's job, not the matcher's.
        let script = UserScript::new("a.user.js");
        assert!(!matches_url(&script, &url("https://example.com/")));
    }
}
