//! Persisted script preferences.
//!
//! One JSON document holds the global enabled flag, the startup crash-guard
//! counter and a per-script entry map. The path is optional; without one the
//! store is memory-only (tests, ephemeral embedders).

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::script::UserScript;

/// The persisted per-script record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScriptPrefEntry {
    pub enabled: bool,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub version: String,
    /// Milliseconds since the Unix epoch, stringified.
    #[serde(default)]
    pub install_time: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PrefData {
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    startup_tryout: u32,
    #[serde(default)]
    scripts: BTreeMap<String, ScriptPrefEntry>,
}

#[derive(Debug)]
pub struct ScriptPrefs {
    path: Option<PathBuf>,
    data: RwLock<PrefData>,
}

impl ScriptPrefs {
    /// Memory-only store. The feature starts disabled, as it does on a
    /// fresh profile.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: RwLock::new(PrefData::default()),
        }
    }

    /// Load from `path`, falling back to defaults when the file is missing
    /// or unreadable.
    pub fn load(path: PathBuf) -> Self {
        let data = match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(data) => data,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "malformed preference document, starting fresh");
                    PrefData::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => PrefData::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not read preferences, starting fresh");
                PrefData::default()
            }
        };
        Self {
            path: Some(path),
            data: RwLock::new(data),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.data.read().map(|d| d.enabled).unwrap_or(false)
    }

    pub fn set_enabled(&self, enabled: bool) {
        if let Ok(mut data) = self.data.write() {
            data.enabled = enabled;
            self.persist(&data);
        }
    }

    pub fn startup_tryout(&self) -> u32 {
        self.data.read().map(|d| d.startup_tryout).unwrap_or(0)
    }

    pub fn set_startup_tryout(&self, tryout: u32) {
        if let Ok(mut data) = self.data.write() {
            data.startup_tryout = tryout;
            self.persist(&data);
        }
    }

    pub fn set_script_enabled(&self, key: &str, enabled: bool) {
        if let Ok(mut data) = self.data.write() {
            data.scripts.entry(key.to_string()).or_insert_with(|| {
                new_entry(String::new(), String::new(), String::new())
            });
            if let Some(entry) = data.scripts.get_mut(key) {
                entry.enabled = enabled;
            }
            self.persist(&data);
        }
    }

    pub fn remove_script(&self, key: &str) {
        if let Ok(mut data) = self.data.write() {
            if data.scripts.remove(key).is_some() {
                self.persist(&data);
            }
        }
    }

    pub fn entry(&self, key: &str) -> Option<ScriptPrefEntry> {
        self.data.read().ok()?.scripts.get(key).cloned()
    }

    /// Reconcile a freshly loaded script list against stored preferences.
    ///
    /// Refreshes name/description/version of known entries, creates entries
    /// for newcomers (disabled, installed now), drops disabled records from
    /// the list, deletes entries whose backing file vanished, and clears
    /// the list entirely when the feature is globally off.
    pub fn compare_with_prefs(&self, scripts: &mut Vec<UserScript>) {
        let Ok(mut data) = self.data.write() else {
            scripts.clear();
            return;
        };
        if !data.enabled {
            debug!("user scripts globally disabled, clearing active list");
            scripts.clear();
            return;
        }

        let now_ms = chrono::Utc::now().timestamp_millis().to_string();
        let mut seen: HashSet<String> = HashSet::new();

        scripts.retain(|script| {
            seen.insert(script.key.clone());
            let entry = data.scripts.entry(script.key.clone()).or_insert_with(|| {
                debug!(key = %script.key, "registering newly discovered script (disabled)");
                ScriptPrefEntry {
                    enabled: false,
                    name: String::new(),
                    description: String::new(),
                    version: String::new(),
                    install_time: now_ms.clone(),
                }
            });
            entry.name = script.name.clone();
            entry.description = script.description.clone();
            entry.version = script.version.clone().unwrap_or_default();
            entry.enabled
        });

        let before = data.scripts.len();
        data.scripts.retain(|key, _| seen.contains(key));
        if data.scripts.len() != before {
            debug!(
                removed = before - data.scripts.len(),
                "dropped preference entries for vanished scripts"
            );
        }

        self.persist(&data);
    }

    /// Pretty-printed listing of every known script, keyed by id.
    pub fn scripts_info_json(&self) -> String {
        let Ok(data) = self.data.read() else {
            return "{}".to_string();
        };
        serde_json::to_string_pretty(&data.scripts).unwrap_or_else(|_| "{}".to_string())
    }

    fn persist(&self, data: &PrefData) {
        let Some(path) = &self.path else {
            return;
        };
        match serde_json::to_string_pretty(data) {
            Ok(text) => {
                if let Err(e) = std::fs::write(path, text) {
                    warn!(path = %path.display(), error = %e, "failed to persist preferences");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode preferences"),
        }
    }
}

fn new_entry(name: String, description: String, version: String) -> ScriptPrefEntry {
    ScriptPrefEntry {
        enabled: false,
        name,
        description,
        version,
        install_time: chrono::Utc::now().timestamp_millis().to_string(),
    }
}
