//! End-to-end pipeline: stored script files through the repository into a
//! distribution region, decoded by a scheduler that injects via a mock host.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::timeout;
use url::Url;

use userscripts::{
    ContextId, InjectionHost, InjectionKind, InjectionOutcome, InjectionRequest,
    InjectionScheduler, RunLocation, ScriptRepository, ScriptsConfig,
    matcher::FrameMap,
};

const START_SCRIPT: &str = "\
// ==UserScript==
// @name         banner
// @include      https://example.com/*
// @run-at       document-start
// ==/UserScript==
banner();
";

const IDLE_SCRIPT: &str = "\
// ==UserScript==
// @name         cleanup
// @include      https://example.com/*
// ==/UserScript==
cleanup();
";

const OFF_SITE_SCRIPT: &str = "\
// ==UserScript==
// @name         elsewhere
// @include      https://other.org/*
// ==/UserScript==
elsewhere();
";

#[derive(Default)]
struct CollectingHost {
    injected: Mutex<Vec<(InjectionKind, String)>>,
}

impl InjectionHost for CollectingHost {
    fn inject(&self, request: &InjectionRequest<'_>) -> InjectionOutcome {
        self.injected
            .lock()
            .unwrap()
            .push((request.kind, request.script_key.to_string()));
        InjectionOutcome::Finished
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

impl CollectingHost {
    fn script_keys(&self) -> Vec<String> {
        self.injected
            .lock()
            .unwrap()
            .iter()
            .map(|(_, key)| key.clone())
            .collect()
    }
}

async fn wait_for_active(repo: &ScriptRepository, count: usize) {
    let mut events = repo.subscribe();
    timeout(Duration::from_secs(5), async {
        while repo.active_scripts().len() != count {
            events.recv().await.expect("repository event channel closed");
        }
    })
    .await
    .expect("active set never reached expected size");
}

#[tokio::test]
async fn scripts_flow_from_disk_to_injection() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("banner.user.js"), START_SCRIPT).unwrap();
    std::fs::write(dir.path().join("cleanup.user.js"), IDLE_SCRIPT).unwrap();
    std::fs::write(dir.path().join("elsewhere.user.js"), OFF_SITE_SCRIPT).unwrap();

    let repo = ScriptRepository::new(ScriptsConfig {
        scripts_dir: dir.path().to_path_buf(),
        ..ScriptsConfig::default()
    });
    repo.set_feature_enabled(true);
    repo.set_script_enabled("banner.user.js", true);
    repo.set_script_enabled("cleanup.user.js", true);
    repo.set_script_enabled("elsewhere.user.js", true);
    wait_for_active(&repo, 3).await;

    // Consumer side: decode a duplicate of the producer's region.
    let region = repo.region().expect("region after load");
    let frames = Arc::new(FrameMap::new());
    frames.insert(
        ContextId(7),
        Some(Url::parse("https://example.com/landing").unwrap()),
        None,
        None,
    );
    let host = Arc::new(CollectingHost::default());
    let scheduler = InjectionScheduler::new(frames, host.clone(), Duration::from_millis(200));
    scheduler.update_scripts(&region.duplicate()).unwrap();

    scheduler.create_context(ContextId(7));
    scheduler.signal(ContextId(7), RunLocation::DocumentStart);
    scheduler.signal(ContextId(7), RunLocation::DocumentEnd);
    scheduler.resources_settled(ContextId(7));

    // banner at start, cleanup at idle, elsewhere filtered by URL.
    assert_eq!(host.script_keys(), ["banner.user.js", "cleanup.user.js"]);
}

#[tokio::test]
async fn disabling_a_script_stops_future_injection() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("banner.user.js"), START_SCRIPT).unwrap();

    let repo = ScriptRepository::new(ScriptsConfig {
        scripts_dir: dir.path().to_path_buf(),
        ..ScriptsConfig::default()
    });
    repo.set_feature_enabled(true);
    repo.set_script_enabled("banner.user.js", true);
    wait_for_active(&repo, 1).await;

    repo.set_script_enabled("banner.user.js", false);
    wait_for_active(&repo, 0).await;

    let region = repo.region().expect("region after reload");
    let frames = Arc::new(FrameMap::new());
    frames.insert(
        ContextId(1),
        Some(Url::parse("https://example.com/").unwrap()),
        None,
        None,
    );
    let host = Arc::new(CollectingHost::default());
    let scheduler = InjectionScheduler::new(frames, host.clone(), Duration::from_millis(200));
    scheduler.update_scripts(&region).unwrap();

    scheduler.signal(ContextId(1), RunLocation::DocumentStart);
    assert!(host.script_keys().is_empty());
}

#[tokio::test]
async fn install_makes_a_script_injectable_after_enabling() {
    init_tracing();
    let src_dir = tempfile::tempdir().unwrap();
    let store = tempfile::tempdir().unwrap();
    let src = src_dir.path().join("banner.user.js");
    std::fs::write(&src, START_SCRIPT).unwrap();

    let repo = ScriptRepository::new(ScriptsConfig {
        scripts_dir: store.path().to_path_buf(),
        ..ScriptsConfig::default()
    });
    repo.set_feature_enabled(true);

    let mut events = repo.subscribe();
    let (success, message) = repo.install(src).await;
    assert!(success, "{message}");

    // The post-install rescan registers the script; fresh installs stay
    // disabled until the user opts in.
    let info = timeout(Duration::from_secs(5), async {
        loop {
            let listing: serde_json::Value =
                serde_json::from_str(&repo.scripts_info_json()).unwrap();
            if listing.get("banner.user.js").is_some() {
                break listing;
            }
            events.recv().await.expect("repository event channel closed");
        }
    })
    .await
    .expect("installed script never registered");
    assert_eq!(info["banner.user.js"]["enabled"], serde_json::json!(false));

    repo.set_script_enabled("banner.user.js", true);
    wait_for_active(&repo, 1).await;

    let keys: HashSet<String> = repo
        .active_scripts()
        .iter()
        .map(|s| s.key.clone())
        .collect();
    assert!(keys.contains("banner.user.js"));
}
