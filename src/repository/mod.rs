//! Script repository: storage, reconciliation and distribution.
//!
//! All filesystem work runs on a single loader worker fed by an unbounded
//! queue, so results always apply in submission order and the coordinating
//! side never blocks on disk. Observers subscribe to a broadcast channel.

pub mod fs;
pub mod prefs;

use std::path::PathBuf;
use std::sync::{Arc, RwLock, Weak};

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task;
use tracing::{debug, error, info, warn};

use crate::config::ScriptsConfig;
use crate::distribution::{self, ScriptRegion};
use crate::script::UserScript;
use crate::types::{Result, ScriptError};

pub use prefs::{ScriptPrefEntry, ScriptPrefs};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Notifications emitted by the repository.
#[derive(Debug, Clone)]
pub enum ScriptEvent {
    /// A load completed and a fresh distribution region is available.
    ScriptsUpdated,
    /// An install request finished.
    InstallFinished { success: bool, message: String },
}

enum LoadJob {
    Scan,
    Remove {
        key: String,
    },
    Install {
        path: PathBuf,
        respond: oneshot::Sender<(bool, String)>,
    },
}

pub struct ScriptRepository {
    inner: Arc<RepoInner>,
}

struct RepoInner {
    config: ScriptsConfig,
    prefs: ScriptPrefs,
    active: RwLock<Arc<Vec<UserScript>>>,
    region: RwLock<Option<ScriptRegion>>,
    events: broadcast::Sender<ScriptEvent>,
    jobs: mpsc::UnboundedSender<LoadJob>,
}

impl ScriptRepository {
    /// Build the repository and spawn its loader worker. Requires a running
    /// tokio runtime.
    pub fn new(config: ScriptsConfig) -> Self {
        let prefs = match &config.prefs_path {
            Some(path) => ScriptPrefs::load(path.clone()),
            None => ScriptPrefs::in_memory(),
        };
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (jobs, jobs_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(RepoInner {
            config,
            prefs,
            active: RwLock::new(Arc::new(Vec::new())),
            region: RwLock::new(None),
            events,
            jobs,
        });
        spawn_loader(Arc::downgrade(&inner), jobs_rx);
        Self { inner }
    }

    /// Queue a storage rescan.
    pub fn start_load(&self) {
        self.inner.enqueue(LoadJob::Scan);
    }

    /// Startup entry point with the crash guard: after too many startup
    /// loads that began but never completed, the feature switches itself
    /// off instead of loading again.
    pub fn attempt_load(&self) {
        let tryout = self.inner.prefs.startup_tryout();
        if tryout >= self.inner.config.max_startup_tryouts {
            warn!(
                tryout,
                "startup loads keep failing to complete, disabling user scripts"
            );
            self.inner.prefs.set_enabled(false);
            return;
        }
        self.inner.prefs.set_startup_tryout(tryout + 1);
        self.start_load();
    }

    /// Globally enable or disable the feature, then reload.
    pub fn set_feature_enabled(&self, enabled: bool) {
        info!(enabled, "user scripts feature toggled");
        self.inner.prefs.set_enabled(enabled);
        self.start_load();
    }

    pub fn is_feature_enabled(&self) -> bool {
        self.inner.prefs.is_enabled()
    }

    /// Enable or disable one script, then reload.
    pub fn set_script_enabled(&self, key: &str, enabled: bool) {
        self.inner.prefs.set_script_enabled(key, enabled);
        self.start_load();
    }

    /// Delete a script's file and preference entry, then reload.
    pub fn remove_script(&self, key: &str) {
        self.inner.prefs.remove_script(key);
        self.inner.enqueue(LoadJob::Remove {
            key: key.to_string(),
        });
    }

    /// Validate and copy a script file into storage, then reload.
    pub async fn install(&self, path: PathBuf) -> (bool, String) {
        let (respond, response) = oneshot::channel();
        self.inner.enqueue(LoadJob::Install { path, respond });
        match response.await {
            Ok(outcome) => outcome,
            Err(_) => (false, "script loader unavailable".to_string()),
        }
    }

    /// Source text of one stored script, for display.
    pub async fn fetch_source(&self, key: &str) -> Result<String> {
        if !self.inner.prefs.is_enabled() {
            return Err(ScriptError::Disabled);
        }
        let dir = self.inner.config.scripts_dir.clone();
        let key = key.to_string();
        task::spawn_blocking(move || fs::read_source(&dir, &key))
            .await
            .map_err(|e| ScriptError::Internal(format!("fetch task failed: {e}")))?
    }

    /// Pretty JSON listing of all known scripts and their preference state.
    pub fn scripts_info_json(&self) -> String {
        self.inner.prefs.scripts_info_json()
    }

    /// Snapshot of the currently active (enabled, reconciled) scripts.
    pub fn active_scripts(&self) -> Arc<Vec<UserScript>> {
        self.inner
            .active
            .read()
            .map(|active| Arc::clone(&*active))
            .unwrap_or_default()
    }

    /// Duplicate of the current distribution region, if a load completed.
    pub fn region(&self) -> Option<ScriptRegion> {
        self.inner
            .region
            .read()
            .ok()
            .and_then(|region| region.as_ref().map(ScriptRegion::duplicate))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScriptEvent> {
        self.inner.events.subscribe()
    }

    pub fn prefs(&self) -> &ScriptPrefs {
        &self.inner.prefs
    }
}

fn spawn_loader(inner: Weak<RepoInner>, mut jobs: mpsc::UnboundedReceiver<LoadJob>) {
    tokio::spawn(async move {
        debug!("script loader worker started");
        while let Some(job) = jobs.recv().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            inner.run_job(job).await;
        }
        debug!("script loader worker stopped");
    });
}

impl RepoInner {
    fn enqueue(&self, job: LoadJob) {
        if self.jobs.send(job).is_err() {
            error!("script loader queue is gone, dropping job");
        }
    }

    async fn run_job(self: Arc<Self>, job: LoadJob) {
        match job {
            LoadJob::Scan => self.scan().await,
            LoadJob::Remove { key } => {
                let dir = self.config.scripts_dir.clone();
                let file_key = key.clone();
                match task::spawn_blocking(move || fs::remove_file(&dir, &file_key)).await {
                    Ok(Ok(())) => info!(key = %key, "removed script file"),
                    Ok(Err(e)) => warn!(key = %key, error = %e, "could not remove script file"),
                    Err(e) => error!(key = %key, error = %e, "remove task failed"),
                }
                self.scan().await;
            }
            LoadJob::Install { path, respond } => {
                let dir = self.config.scripts_dir.clone();
                let src = path.clone();
                let (success, message) =
                    match task::spawn_blocking(move || fs::install_file(&src, &dir)).await {
                        Ok(Ok(key)) => (true, format!("installed {key}")),
                        Ok(Err(e)) => (false, e.to_string()),
                        Err(e) => (false, format!("install task failed: {e}")),
                    };
                info!(path = %path.display(), success, %message, "install finished");
                let _ = self.events.send(ScriptEvent::InstallFinished {
                    success,
                    message: message.clone(),
                });
                let _ = respond.send((success, message));
                self.scan().await;
            }
        }
    }

    async fn scan(&self) {
        let dir = self.config.scripts_dir.clone();
        let scripts = match task::spawn_blocking(move || fs::scan_dir(&dir)).await {
            Ok(scripts) => scripts,
            Err(e) => {
                error!(error = %e, "script scan task failed");
                return;
            }
        };
        self.on_scripts_loaded(scripts);
    }

    fn on_scripts_loaded(&self, mut scripts: Vec<UserScript>) {
        self.prefs.compare_with_prefs(&mut scripts);
        let count = scripts.len();

        let snapshot = Arc::new(scripts);
        if let Ok(mut active) = self.active.write() {
            *active = Arc::clone(&snapshot);
        }

        match distribution::serialize(&snapshot) {
            Ok(region) => {
                if let Ok(mut slot) = self.region.write() {
                    *slot = Some(region);
                }
                // A completed load clears the crash-guard counter.
                self.prefs.set_startup_tryout(0);
                info!(scripts = count, "script load complete");
                let _ = self.events.send(ScriptEvent::ScriptsUpdated);
            }
            Err(e) => {
                warn!(error = %e, "distribution failed, retaining previous region");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const VALID: &str =
        "// ==UserScript==\n// @name repo test\n// ==/UserScript==\nrun();\n";

    fn config_for(dir: &std::path::Path) -> ScriptsConfig {
        ScriptsConfig {
            scripts_dir: dir.to_path_buf(),
            ..ScriptsConfig::default()
        }
    }

    async fn wait_until(repo: &ScriptRepository, pred: impl Fn(&ScriptRepository) -> bool) {
        let mut events = repo.subscribe();
        timeout(Duration::from_secs(5), async {
            while !pred(repo) {
                events.recv().await.expect("event channel closed");
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn load_reconciles_and_distributes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.user.js"), VALID).unwrap();

        let repo = ScriptRepository::new(config_for(dir.path()));
        repo.set_feature_enabled(true);
        repo.set_script_enabled("a.user.js", true);
        wait_until(&repo, |r| !r.active_scripts().is_empty()).await;

        let active = repo.active_scripts();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].key, "a.user.js");
        let region = repo.region().expect("region after load");
        let decoded = distribution::parse(&region).unwrap();
        assert_eq!(decoded.len(), 1);
    }

    #[tokio::test]
    async fn disabled_scripts_stay_out_of_the_active_set() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.user.js"), VALID).unwrap();

        let repo = ScriptRepository::new(config_for(dir.path()));
        repo.set_feature_enabled(true);
        repo.set_script_enabled("a.user.js", true);
        wait_until(&repo, |r| !r.active_scripts().is_empty()).await;

        repo.set_script_enabled("a.user.js", false);
        wait_until(&repo, |r| r.active_scripts().is_empty()).await;
        // The entry survives, only the active list drops it.
        assert!(repo.prefs().entry("a.user.js").is_some());
    }

    #[tokio::test]
    async fn install_validates_copies_and_notifies() {
        let src_dir = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        let src = src_dir.path().join("new.user.js");
        std::fs::write(&src, VALID).unwrap();

        let repo = ScriptRepository::new(config_for(store.path()));
        repo.set_feature_enabled(true);
        let mut events = repo.subscribe();

        let (success, message) = repo.install(src).await;
        assert!(success, "{message}");
        assert!(store.path().join("new.user.js").is_file());

        let got_install_event = timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(ScriptEvent::InstallFinished { success, .. }) = events.recv().await {
                    break success;
                }
            }
        })
        .await
        .unwrap();
        assert!(got_install_event);
    }

    #[tokio::test]
    async fn install_of_broken_file_fails() {
        let src_dir = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        let src = src_dir.path().join("bad.user.js");
        std::fs::write(
            &src,
            "// ==UserScript==\n// @run-at whenever\n// ==/UserScript==\n",
        )
        .unwrap();

        let repo = ScriptRepository::new(config_for(store.path()));
        let (success, message) = repo.install(src).await;
        assert!(!success);
        assert!(message.contains("run-at"), "{message}");
        assert!(!store.path().join("bad.user.js").exists());
    }

    #[tokio::test]
    async fn remove_deletes_file_and_entry() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.user.js"), VALID).unwrap();

        let repo = ScriptRepository::new(config_for(dir.path()));
        repo.set_feature_enabled(true);
        repo.set_script_enabled("a.user.js", true);
        wait_until(&repo, |r| !r.active_scripts().is_empty()).await;

        repo.remove_script("a.user.js");
        wait_until(&repo, |r| r.active_scripts().is_empty()).await;
        assert!(!dir.path().join("a.user.js").exists());
        assert!(repo.prefs().entry("a.user.js").is_none());
    }

    #[tokio::test]
    async fn crash_guard_disables_after_repeated_tryouts() {
        let dir = tempfile::tempdir().unwrap();
        let repo = ScriptRepository::new(config_for(dir.path()));
        repo.prefs().set_enabled(true);
        repo.prefs().set_startup_tryout(3);

        repo.attempt_load();
        assert!(!repo.is_feature_enabled());
    }

    #[tokio::test]
    async fn completed_load_resets_the_crash_guard() {
        let dir = tempfile::tempdir().unwrap();
        let repo = ScriptRepository::new(config_for(dir.path()));
        repo.prefs().set_enabled(true);
        repo.prefs().set_startup_tryout(2);

        repo.attempt_load();
        wait_until(&repo, |r| r.prefs().startup_tryout() == 0).await;
        assert!(repo.is_feature_enabled());
    }

    #[tokio::test]
    async fn fetch_source_respects_the_feature_flag() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.user.js"), VALID).unwrap();

        let repo = ScriptRepository::new(config_for(dir.path()));
        assert!(matches!(
            repo.fetch_source("a.user.js").await,
            Err(ScriptError::Disabled)
        ));

        repo.set_feature_enabled(true);
        let source = repo.fetch_source("a.user.js").await.unwrap();
        assert!(source.contains("repo test"));
        assert!(matches!(
            repo.fetch_source("nope.user.js").await,
            Err(ScriptError::UnknownScript(_))
        ));
    }
}
