//! Remote branch fallback over real HTTP into a container target.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use provisor_content::{tree_hash, ContainerTarget, ContentDeployer, ContentTarget};
use provisor_core::{ContentSource, ContentSpec, DataPaths, PortMapping, RemoteSource};
use provisor_host::{HttpFetcher, MockEnvironment, StrategyChain};

fn github_style_zip() -> Vec<u8> {
    let buf = std::io::Cursor::new(Vec::new());
    let mut zip = zip::ZipWriter::new(buf);
    let options = zip::write::SimpleFileOptions::default();
    zip.add_directory("lab-master/", options).unwrap();
    zip.start_file("lab-master/index.php", options).unwrap();
    zip.write_all(b"<?php echo 'lab';").unwrap();
    zip.start_file("lab-master/uploads/.keep", options).unwrap();
    zip.finish().unwrap().into_inner()
}

#[tokio::test]
async fn test_main_missing_master_served() {
    let body = github_style_zip();
    let served = body.clone();
    let app = Router::new().route(
        "/lab/archive/master.zip",
        get(move || {
            let served = served.clone();
            async move { served }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let dir = tempfile::tempdir().unwrap();
    let paths = DataPaths::new(dir.path()).unwrap();
    let env = MockEnvironment::new()
        .with_daemon_running()
        .with_image("php:8.2-apache")
        .with_container(
            "lab-web",
            "php:8.2-apache",
            PortMapping {
                host: 8080,
                container: 80,
            },
            true,
        );

    let content = ContentSpec {
        source: ContentSource {
            local: None,
            remote: Some(RemoteSource {
                url: format!("http://{}/lab/archive/{{branch}}.zip", addr),
                branches: vec!["main".into(), "master".into()],
            }),
            sha256: None,
        },
        root: "/var/www/html".into(),
        owner: Some("www-data:www-data".into()),
    };

    let deployer = ContentDeployer::new(Arc::new(HttpFetcher::new()), &paths);
    let target = ContainerTarget::new(Arc::new(env.clone()), "lab-web", "/var/www/html");
    let mut chain = StrategyChain::new(Duration::from_secs(10));
    let deployment = deployer.deploy(&content, &target, &mut chain).await.unwrap();

    assert_eq!(deployment.origin, "remote:master");
    let attempts = chain.into_attempts();
    assert_eq!(attempts.len(), 2);
    assert!(!attempts[0].succeeded());
    assert!(attempts[1].succeeded());

    // Hash of the archive's single top-level folder.
    let check = tempfile::tempdir().unwrap();
    let zip_path = check.path().join("master.zip");
    std::fs::write(&zip_path, &body).unwrap();
    let mut archive = zip::ZipArchive::new(std::fs::File::open(&zip_path).unwrap()).unwrap();
    archive.extract(check.path().join("x")).unwrap();
    let expected = tree_hash(&check.path().join("x/lab-master")).unwrap();
    assert_eq!(deployment.content_hash, expected);

    let container = env.container("lab-web").unwrap();
    assert!(container.files.contains_key("/var/www/html/index.php"));
    assert!(container.files.contains_key("/var/www/html/uploads/.keep"));
    assert!(container.permissions_normalized);
    assert_eq!(container.owner.as_deref(), Some("www-data:www-data"));

    let marker = target.read_marker().await.unwrap().unwrap();
    assert_eq!(marker.content_hash, expected);
    assert_eq!(marker.source_fingerprint, content.source.fingerprint(None));
}
