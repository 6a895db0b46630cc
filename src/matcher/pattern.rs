//! `@match` URL patterns: `<scheme>://<host><path>`.
//!
//! Scheme is one of http, https, file, ftp, or `*` (http or https only).
//! Host is a literal, `*`, or `*.domain` (the domain itself plus any
//! subdomain). Path is a glob over path + query.

use thiserror::Error;
use url::Url;

use super::glob::MatchGlob;

const ALLOWED_SCHEMES: [&str; 4] = ["http", "https", "file", "ftp"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatternError {
    #[error("missing '://' separator in \"{0}\"")]
    MissingSchemeSeparator(String),
    #[error("scheme \"{0}\" is not allowed in match patterns")]
    DisallowedScheme(String),
    #[error("invalid host \"{0}\": '*' may only appear as a leading '*.' label")]
    InvalidHost(String),
    #[error("pattern path must start with '/' in \"{0}\"")]
    InvalidPath(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SchemePattern {
    /// `*://` — http or https.
    AnyWebScheme,
    Exact(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum HostPattern {
    /// `*`, or the empty host of file: patterns.
    Any,
    Exact(String),
    /// `*.domain` — the domain itself or any subdomain of it.
    DomainOrSubdomain(String),
}

/// A parsed, matchable URL pattern. Keeps the source text for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlPattern {
    source: String,
    scheme: SchemePattern,
    host: HostPattern,
    path: MatchGlob,
}

impl UrlPattern {
    pub fn parse(source: &str) -> Result<UrlPattern, PatternError> {
        let (scheme_str, rest) = source
            .split_once("://")
            .ok_or_else(|| PatternError::MissingSchemeSeparator(source.to_string()))?;

        let scheme = if scheme_str == "*" {
            SchemePattern::AnyWebScheme
        } else if ALLOWED_SCHEMES.contains(&scheme_str) {
            SchemePattern::Exact(scheme_str.to_string())
        } else {
            return Err(PatternError::DisallowedScheme(scheme_str.to_string()));
        };

        let (host_str, path_str) = match rest.find('/') {
            Some(slash) => (&rest[..slash], &rest[slash..]),
            None => return Err(PatternError::InvalidPath(source.to_string())),
        };

        let host = if host_str.is_empty() || host_str == "*" {
            HostPattern::Any
        } else if let Some(domain) = host_str.strip_prefix("*.") {
            if domain.is_empty() || domain.contains('*') {
                return Err(PatternError::InvalidHost(host_str.to_string()));
            }
            HostPattern::DomainOrSubdomain(domain.to_ascii_lowercase())
        } else if host_str.contains('*') {
            return Err(PatternError::InvalidHost(host_str.to_string()));
        } else {
            HostPattern::Exact(host_str.to_ascii_lowercase())
        };

        // Only '*' is a wildcard in pattern paths; '?' separates the query
        // and must match literally.
        let path_glob = path_str.replace('\\', "\\\\").replace('?', "\\?");

        Ok(UrlPattern {
            source: source.to_string(),
            scheme,
            host,
            path: MatchGlob::new(path_glob),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, url: &Url) -> bool {
        self.matches_scheme(url.scheme())
            && self.matches_host(url.host_str().unwrap_or(""))
            && self.matches_path(url)
    }

    fn matches_scheme(&self, scheme: &str) -> bool {
        match &self.scheme {
            SchemePattern::AnyWebScheme => scheme == "http" || scheme == "https",
            SchemePattern::Exact(s) => s == scheme,
        }
    }

    fn matches_host(&self, host: &str) -> bool {
        match &self.host {
            HostPattern::Any => true,
            HostPattern::Exact(expected) => host.eq_ignore_ascii_case(expected),
            HostPattern::DomainOrSubdomain(domain) => {
                let host = host.to_ascii_lowercase();
                host == *domain || host.ends_with(&format!(".{domain}"))
            }
        }
    }

    fn matches_path(&self, url: &Url) -> bool {
        // The path glob covers path plus query, mirroring how the
        // patterns are written ("/search?*").
        match url.query() {
            Some(query) => self.path.matches(&format!("{}?{}", url.path(), query)),
            None => self.path.matches(url.path()),
        }
    }
}
