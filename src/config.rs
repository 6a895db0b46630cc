//! Engine configuration.
//!
//! Defaults are overridable from the environment so embedders and tests can
//! retarget the storage directory without code changes.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

/// Fallback delay before a context that reached DocumentEnd is idled anyway.
const DEFAULT_IDLE_TIMEOUT_MS: u64 = 200;

/// Startup attempts before the crash guard disables the feature.
const DEFAULT_MAX_STARTUP_TRYOUTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct ScriptsConfig {
    /// Flat directory holding the installed script files.
    pub scripts_dir: PathBuf,
    /// Preference document path. `None` keeps preferences in memory.
    pub prefs_path: Option<PathBuf>,
    /// Fallback idle timer armed when a context reaches DocumentEnd.
    pub idle_timeout: Duration,
    /// Consecutive startup loads that may begin without completing before
    /// the feature is switched off.
    pub max_startup_tryouts: u32,
}

impl Default for ScriptsConfig {
    fn default() -> Self {
        Self {
            scripts_dir: PathBuf::from("userscripts"),
            prefs_path: None,
            idle_timeout: Duration::from_millis(DEFAULT_IDLE_TIMEOUT_MS),
            max_startup_tryouts: DEFAULT_MAX_STARTUP_TRYOUTS,
        }
    }
}

impl ScriptsConfig {
    /// Build configuration from environment variables, falling back to
    /// defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("USERSCRIPTS_DIR") {
            if !dir.is_empty() {
                config.scripts_dir = PathBuf::from(dir);
            }
        }

        if let Ok(path) = std::env::var("USERSCRIPTS_PREFS") {
            if !path.is_empty() {
                config.prefs_path = Some(PathBuf::from(path));
            }
        }

        if let Ok(ms) = std::env::var("USERSCRIPTS_IDLE_TIMEOUT_MS") {
            match ms.parse::<u64>() {
                Ok(ms) => config.idle_timeout = Duration::from_millis(ms),
                Err(_) => warn!(value = %ms, "ignoring invalid USERSCRIPTS_IDLE_TIMEOUT_MS"),
            }
        }

        if let Ok(n) = std::env::var("USERSCRIPTS_MAX_STARTUP_TRYOUTS") {
            match n.parse::<u32>() {
                Ok(n) => config.max_startup_tryouts = n,
                Err(_) => warn!(value = %n, "ignoring invalid USERSCRIPTS_MAX_STARTUP_TRYOUTS"),
            }
        }

        config
    }
}
