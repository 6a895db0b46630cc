//! Flat-directory script storage.
//!
//! Every regular file in the directory is a candidate script; its file name
//! is the script key. Per-file failures are logged and skipped so one broken
//! file never poisons a scan.

use std::path::Path;

use tracing::{debug, warn};

use crate::script::{metadata, ScriptFile, UserScript};
use crate::types::{Result, ScriptError};

pub fn ensure_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).map_err(|source| ScriptError::FileIo {
        path: dir.to_path_buf(),
        source,
    })
}

fn file_key(path: &Path) -> Result<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| ScriptError::Parse(format!("no file name in {}", path.display())))
}

/// Load and validate a single script file.
pub fn load_script_file(path: &Path) -> Result<UserScript> {
    let key = file_key(path)?;
    let bytes = std::fs::read(path).map_err(|source| ScriptError::FileIo {
        path: path.to_path_buf(),
        source,
    })?;
    let text = String::from_utf8(bytes)
        .map_err(|_| ScriptError::Parse("user script must be UTF-8 encoded".to_string()))?;

    let mut script = UserScript::new(key);
    metadata::parse_metadata_header(&text, &mut script)
        .map_err(|e| ScriptError::Parse(e.to_string()))?;

    // Payload content is reduced to ASCII; header values keep their
    // original text.
    let mut content = text;
    content.retain(|c| c.is_ascii());
    script.js = Some(ScriptFile::new(content.into_bytes()));
    script.file_path = Some(path.to_path_buf());
    Ok(script)
}

/// Scan the storage directory. Returns loaded scripts sorted by key.
pub fn scan_dir(dir: &Path) -> Vec<UserScript> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "cannot read scripts directory");
            return Vec::new();
        }
    };

    let mut scripts = Vec::new();
    for entry in entries {
        let path = match entry {
            Ok(entry) => entry.path(),
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "skipping unreadable directory entry");
                continue;
            }
        };
        if !path.is_file() {
            continue;
        }
        match load_script_file(&path) {
            Ok(script) => {
                debug!(key = %script.key, "loaded script file");
                scripts.push(script);
            }
            Err(e) => warn!(path = %path.display(), error = %e, "skipping script file"),
        }
    }

    scripts.sort_by(|a, b| a.key.cmp(&b.key));
    scripts
}

/// Validate `src` and copy it into the storage directory. Returns the key
/// the installed script will load under.
pub fn install_file(src: &Path, dir: &Path) -> Result<String> {
    let key = file_key(src)?;
    // Reject broken files before they reach storage.
    load_script_file(src)?;

    ensure_dir(dir)?;
    let dest = dir.join(&key);
    std::fs::copy(src, &dest).map_err(|source| ScriptError::FileIo {
        path: dest.clone(),
        source,
    })?;
    debug!(key = %key, dest = %dest.display(), "installed script file");
    Ok(key)
}

/// Delete one stored script file.
pub fn remove_file(dir: &Path, key: &str) -> Result<()> {
    let path = dir.join(key);
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(ScriptError::UnknownScript(key.to_string()))
        }
        Err(source) => Err(ScriptError::FileIo { path, source }),
    }
}

/// Raw source text of one stored script.
pub fn read_source(dir: &Path, key: &str) -> Result<String> {
    let path = dir.join(key);
    match std::fs::read_to_string(&path) {
        Ok(text) => Ok(text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(ScriptError::UnknownScript(key.to_string()))
        }
        Err(source) => Err(ScriptError::FileIo { path, source }),
    }
}
