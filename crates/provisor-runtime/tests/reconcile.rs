//! End-to-end runs against the in-memory host.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use provisor_content::tree_hash;
use provisor_core::{
    ActionKind, ActionStatus, DesiredState, ErrorKind, PortMapping, ProvisorConfig, MARKER_PATH,
};
use provisor_host::{ContainerRuntime, MockEnvironment, MockFetcher, MockResponse};
use provisor_runtime::{ExitClass, FinalState, Reconciler, RunPhase};

const MAIN_URL: &str = "https://example.org/lab/archive/main.zip";
const MASTER_URL: &str = "https://example.org/lab/archive/master.zip";

fn zip_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
    let buf = std::io::Cursor::new(Vec::new());
    let mut zip = zip::ZipWriter::new(buf);
    let options = zip::write::SimpleFileOptions::default();
    for (name, data) in entries {
        zip.start_file(*name, options).unwrap();
        zip.write_all(data.as_bytes()).unwrap();
    }
    zip.finish().unwrap().into_inner()
}

/// Hash of the content a zip would deploy (after top-folder stripping).
fn expected_hash(bytes: &[u8], subdir: Option<&str>) -> String {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.zip");
    std::fs::write(&path, bytes).unwrap();
    let mut archive = zip::ZipArchive::new(std::fs::File::open(&path).unwrap()).unwrap();
    let out = dir.path().join("x");
    archive.extract(&out).unwrap();
    let root = match subdir {
        Some(s) => out.join(s),
        None => out,
    };
    tree_hash(&root).unwrap()
}

struct Lab {
    dir: tempfile::TempDir,
    env: MockEnvironment,
    fetcher: MockFetcher,
    config: ProvisorConfig,
}

impl Lab {
    fn new(env: MockEnvironment, fetcher: MockFetcher) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = ProvisorConfig::for_testing(dir.path().join("data")).unwrap();
        Self {
            dir,
            env,
            fetcher,
            config,
        }
    }

    fn fresh() -> Self {
        Self::new(
            MockEnvironment::new().with_registry_image("php:8.2-apache"),
            MockFetcher::new(),
        )
    }

    fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            Arc::new(self.env.clone()),
            Arc::new(self.env.clone()),
            Arc::new(self.fetcher.clone()),
            &self.config,
        )
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    fn write_site_zip(&self, entries: &[(&str, &str)]) -> (PathBuf, Vec<u8>) {
        let bytes = zip_bytes(entries);
        let path = self.path("site.zip");
        std::fs::write(&path, &bytes).unwrap();
        (path, bytes)
    }
}

fn desired(local: Option<&Path>, remote: bool) -> DesiredState {
    let mut source = serde_json::Map::new();
    if let Some(local) = local {
        source.insert("local".into(), local.to_string_lossy().into());
    }
    if remote {
        source.insert(
            "remote".into(),
            serde_json::json!({
                "url": "https://example.org/lab/archive/{branch}.zip",
                "branches": ["main", "master"]
            }),
        );
    }
    let doc = serde_json::json!({
        "image": { "reference": "php:8.2-apache" },
        "container": { "name": "lab-web", "ports": { "host": 8080 } },
        "content": { "source": source }
    });
    DesiredState::from_json(&doc.to_string()).unwrap()
}

fn executed_kinds(state: &FinalState) -> Vec<ActionKind> {
    state
        .results
        .iter()
        .filter(|r| !r.is_skipped())
        .map(|r| r.key.kind)
        .collect()
}

#[tokio::test]
async fn test_local_zip_scenario_deploys_on_port_8080() {
    let lab = Lab::fresh();
    let (zip_path, bytes) = lab.write_site_zip(&[("index.html", "<h1>lab</h1>")]);
    let desired = desired(Some(&zip_path), false);

    let state = lab.reconciler().reconcile(&desired).await;

    assert_eq!(state.phase, RunPhase::Deployed, "{:?}", state.error);
    assert_eq!(state.exit_class(), ExitClass::Success);
    assert_eq!(state.content_hash, Some(expected_hash(&bytes, None)));
    assert_eq!(
        executed_kinds(&state),
        vec![
            ActionKind::InstallPackage,
            ActionKind::StartDaemon,
            ActionKind::PullOrBuildImage,
            ActionKind::RunContainer,
            ActionKind::DeployContent,
            ActionKind::ReloadService,
        ]
    );

    let container = lab.env.container("lab-web").unwrap();
    assert!(container.running);
    assert_eq!(container.ports.host, 8080);
    assert_eq!(container.ports.container, 80);
    assert!(container.files.contains_key("/var/www/html/index.html"));
    assert!(lab.fetcher.calls().is_empty());
}

#[tokio::test]
async fn test_second_run_is_all_skipped() {
    let lab = Lab::fresh();
    let (zip_path, _) = lab.write_site_zip(&[("index.html", "<h1>lab</h1>")]);
    let desired = desired(Some(&zip_path), false);
    let reconciler = lab.reconciler();

    let first = reconciler.reconcile(&desired).await;
    assert!(first.is_deployed());

    lab.env.clear_calls();
    let second = reconciler.reconcile(&desired).await;

    assert!(second.is_deployed());
    assert_eq!(second.results.len(), first.results.len());
    assert!(second.results.iter().all(|r| r.is_skipped()));
    assert_eq!(second.exit_class(), ExitClass::Success);
    assert_eq!(second.content_hash, first.content_hash);
    assert!(lab.env.mutating_calls().is_empty());
}

#[tokio::test]
async fn test_container_hidden_by_stopped_daemon_gets_desired_port() {
    let env = MockEnvironment::new()
        .with_daemon_running()
        .with_registry_image("php:8.2-apache")
        .with_image("php:8.2-apache")
        .with_container(
            "lab-web",
            "php:8.2-apache",
            PortMapping {
                host: 9090,
                container: 80,
            },
            false,
        );
    env.stop_daemon();
    let lab = Lab::new(env, MockFetcher::new());
    let (zip_path, _) = lab.write_site_zip(&[("index.html", "<h1>lab</h1>")]);
    let desired = desired(Some(&zip_path), false);
    let reconciler = lab.reconciler();

    let first = reconciler.reconcile(&desired).await;
    assert!(first.is_deployed(), "{:?}", first.error);
    let container = lab.env.container("lab-web").unwrap();
    assert!(container.running);
    assert_eq!(container.ports.host, 8080);

    let second = reconciler.reconcile(&desired).await;
    assert!(second.is_deployed());
    assert!(executed_kinds(&second).is_empty(), "{:?}", executed_kinds(&second));
}

#[tokio::test]
async fn test_edited_local_zip_is_redeployed() {
    let lab = Lab::fresh();
    let (zip_path, _) = lab.write_site_zip(&[("index.html", "v1")]);
    let desired = desired(Some(&zip_path), false);
    let reconciler = lab.reconciler();

    let first = reconciler.reconcile(&desired).await;
    assert!(first.is_deployed(), "{:?}", first.error);

    let (_, v2) = lab.write_site_zip(&[("index.html", "v2")]);
    let second = reconciler.reconcile(&desired).await;

    assert!(second.is_deployed(), "{:?}", second.error);
    assert_eq!(
        executed_kinds(&second),
        vec![ActionKind::DeployContent, ActionKind::ReloadService]
    );
    assert_eq!(second.content_hash, Some(expected_hash(&v2, None)));
    assert_ne!(second.content_hash, first.content_hash);
    let served = &lab.env.container("lab-web").unwrap().files["/var/www/html/index.html"];
    assert_eq!(served.as_slice(), b"v2");

    let third = reconciler.reconcile(&desired).await;
    assert!(third.results.iter().all(|r| r.is_skipped()));
}

#[tokio::test]
async fn test_remote_scenario_main_missing_master_served() {
    let master = zip_bytes(&[("lab-master/index.php", "<?php echo 'ok';")]);
    let lab = Lab::new(
        MockEnvironment::new().with_registry_image("php:8.2-apache"),
        MockFetcher::new().respond(MASTER_URL, MockResponse::Body(master.clone())),
    );
    let desired = desired(None, true);

    let state = lab.reconciler().reconcile(&desired).await;

    assert!(state.is_deployed(), "{:?}", state.error);
    assert_eq!(lab.fetcher.calls(), vec![MAIN_URL.to_string(), MASTER_URL.to_string()]);
    assert_eq!(
        state.content_hash,
        Some(expected_hash(&master, Some("lab-master")))
    );

    let deploy = state
        .results
        .iter()
        .find(|r| r.key.kind == ActionKind::DeployContent)
        .unwrap();
    assert_eq!(deploy.attempts.len(), 2);
    assert_eq!(deploy.failed_attempts(), 1);
    assert!(deploy.attempts[1].succeeded());
    // Fallback was needed, so the run is partial rather than clean.
    assert_eq!(state.exit_class(), ExitClass::Partial);
}

#[tokio::test]
async fn test_local_artifact_takes_precedence_over_remote() {
    let lab = Lab::new(
        MockEnvironment::new().with_registry_image("php:8.2-apache"),
        MockFetcher::new().respond(
            MAIN_URL,
            MockResponse::Body(zip_bytes(&[("index.html", "remote")])),
        ),
    );
    let (zip_path, bytes) = lab.write_site_zip(&[("index.html", "local")]);
    let desired = desired(Some(&zip_path), true);

    let state = lab.reconciler().reconcile(&desired).await;

    assert!(state.is_deployed());
    assert!(lab.fetcher.calls().is_empty());
    assert_eq!(state.content_hash, Some(expected_hash(&bytes, None)));
}

#[tokio::test]
async fn test_failed_run_resumes_from_failed_action() {
    let lab = Lab::fresh();
    let (zip_path, _) = lab.write_site_zip(&[("index.html", "<h1>lab</h1>")]);
    let desired = desired(Some(&zip_path), false);
    let reconciler = lab.reconciler();

    lab.env.fail("pull:php:8.2-apache");
    let first = reconciler.reconcile(&desired).await;
    assert_eq!(first.phase, RunPhase::Failed);
    assert_eq!(first.exit_class(), ExitClass::Failure);
    let error = first.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::StrategiesExhausted);
    assert_eq!(
        executed_kinds(&first),
        vec![
            ActionKind::InstallPackage,
            ActionKind::StartDaemon,
            ActionKind::PullOrBuildImage,
        ]
    );
    assert!(lab.env.container("lab-web").is_none());

    lab.env.clear_faults();
    let second = reconciler.reconcile(&desired).await;
    assert!(second.is_deployed());
    assert_eq!(
        executed_kinds(&second),
        vec![
            ActionKind::PullOrBuildImage,
            ActionKind::RunContainer,
            ActionKind::DeployContent,
            ActionKind::ReloadService,
        ]
    );
}

#[tokio::test]
async fn test_failed_reload_is_retried_alone() {
    let lab = Lab::fresh();
    let (zip_path, _) = lab.write_site_zip(&[("index.html", "<h1>lab</h1>")]);
    let desired = desired(Some(&zip_path), false);
    let reconciler = lab.reconciler();

    lab.env.fail("exec:lab-web:apache2ctl");
    lab.env.fail("exec:lab-web:service");
    let first = reconciler.reconcile(&desired).await;
    assert_eq!(first.phase, RunPhase::Failed);
    assert_eq!(
        first.results.last().map(|r| r.key.kind),
        Some(ActionKind::ReloadService)
    );

    lab.env.clear_faults();
    let second = reconciler.reconcile(&desired).await;
    assert!(second.is_deployed());
    assert_eq!(executed_kinds(&second), vec![ActionKind::ReloadService]);

    let raw = lab
        .env
        .read_file("lab-web", MARKER_PATH)
        .await
        .unwrap()
        .unwrap();
    assert!(raw.contains("\"reloaded\": true"));
}

#[tokio::test]
async fn test_unreachable_environment_fails_before_mutation() {
    let lab = Lab::new(
        MockEnvironment::new()
            .with_daemon_running()
            .with_ping_errors(100),
        MockFetcher::new(),
    );
    let (zip_path, _) = lab.write_site_zip(&[("index.html", "x")]);

    let state = lab.reconciler().reconcile(&desired(Some(&zip_path), false)).await;

    assert_eq!(state.phase, RunPhase::Failed);
    assert_eq!(
        state.error.as_ref().map(|e| e.kind),
        Some(ErrorKind::EnvironmentUnavailable)
    );
    assert!(state.results.is_empty());
    assert!(lab.env.mutating_calls().is_empty());
}

#[tokio::test]
async fn test_cancel_stops_at_action_boundary() {
    let lab = Lab::new(
        MockEnvironment::new()
            .with_daemon_running()
            .with_registry_image("php:8.2-apache"),
        MockFetcher::new(),
    );
    let (zip_path, _) = lab.write_site_zip(&[("index.html", "x")]);
    let reconciler = lab.reconciler();
    reconciler.cancel_token().cancel();

    let state = reconciler.reconcile(&desired(Some(&zip_path), false)).await;

    assert_eq!(state.phase, RunPhase::Failed);
    assert_eq!(
        state.error.as_ref().map(|e| e.kind),
        Some(ErrorKind::Cancelled)
    );
    // Satisfied steps before the checkpoint are still reported.
    assert!(state.results.iter().all(|r| r.is_skipped()));
    assert_eq!(state.results.len(), 2);
    assert!(lab.env.mutating_calls().is_empty());
}

#[tokio::test]
async fn test_missing_index_is_partial() {
    let lab = Lab::fresh();
    let (zip_path, _) = lab.write_site_zip(&[("readme.txt", "no index here")]);

    let state = lab.reconciler().reconcile(&desired(Some(&zip_path), false)).await;

    assert!(state.is_deployed());
    assert_eq!(state.warnings.len(), 1);
    assert_eq!(state.exit_class(), ExitClass::Partial);
}

#[tokio::test]
async fn test_journal_records_every_result() {
    let lab = Lab::fresh();
    let (zip_path, _) = lab.write_site_zip(&[("index.html", "x")]);
    let reconciler = lab.reconciler();

    let state = reconciler.reconcile(&desired(Some(&zip_path), false)).await;

    let records = reconciler.journal().records_for(&state.run_id).unwrap();
    assert_eq!(records.len(), state.results.len());
    assert!(records
        .iter()
        .all(|r| r.result.status == ActionStatus::Succeeded));
    assert_eq!(reconciler.journal().path(), lab.config.data_paths.run_log);
}

#[tokio::test]
async fn test_stop_then_up_restarts_and_redeploys() {
    let lab = Lab::fresh();
    let (zip_path, _) = lab.write_site_zip(&[("index.html", "x")]);
    let desired = desired(Some(&zip_path), false);
    let reconciler = lab.reconciler();

    assert!(reconciler.reconcile(&desired).await.is_deployed());
    assert!(reconciler.stop(&desired).await.unwrap());
    assert!(!lab.env.container("lab-web").unwrap().running);
    assert!(!reconciler.stop(&desired).await.unwrap());

    let state = reconciler.reconcile(&desired).await;
    assert!(state.is_deployed());
    assert_eq!(
        executed_kinds(&state),
        vec![
            ActionKind::RunContainer,
            ActionKind::DeployContent,
            ActionKind::ReloadService,
        ]
    );
    let run = &state.results[3];
    assert_eq!(run.attempts[0].strategy, "start-existing");
}

#[tokio::test]
async fn test_plan_is_read_only() {
    let lab = Lab::fresh();
    let (zip_path, _) = lab.write_site_zip(&[("index.html", "x")]);

    let actions = lab
        .reconciler()
        .plan(&desired(Some(&zip_path), false))
        .await
        .unwrap();

    assert_eq!(actions.len(), 6);
    assert!(lab.env.mutating_calls().is_empty());
}
