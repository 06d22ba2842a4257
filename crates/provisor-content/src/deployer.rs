//! Content Deployer — resolve, unpack, verify, sync, normalize, mark.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use provisor_core::{ContentMarker, ContentSpec, DataPaths, Error, Result};
use provisor_host::{ArtifactFetcher, FetchError, StrategyChain};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::archive::{content_root, extract_zip, is_zip};
use crate::digest::tree_hash;
use crate::source::{candidates, local_digest, Candidate};
use crate::target::ContentTarget;

/// Documents that count as a site entry point.
pub const INDEX_DOCUMENTS: &[&str] = &["index.html", "index.htm", "index.php"];

/// A completed deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployment {
    pub content_hash: String,
    /// Label of the candidate the content came from.
    pub origin: String,
    pub warnings: Vec<String>,
}

/// A candidate that was fetched, unpacked and hashed.
struct Resolved {
    root: PathBuf,
    hash: String,
}

pub struct ContentDeployer {
    fetcher: Arc<dyn ArtifactFetcher>,
    downloads: PathBuf,
    staging: PathBuf,
}

impl ContentDeployer {
    pub fn new(fetcher: Arc<dyn ArtifactFetcher>, paths: &DataPaths) -> Self {
        Self {
            fetcher,
            downloads: paths.downloads.clone(),
            staging: paths.staging.clone(),
        }
    }

    /// Deploy `content` into `target`, recording one strategy attempt per
    /// candidate source tried.
    ///
    /// Returns the content hash of the deployed tree. A missing index
    /// document is reported as a warning, not an error.
    pub async fn deploy(
        &self,
        content: &ContentSpec,
        target: &dyn ContentTarget,
        chain: &mut StrategyChain,
    ) -> Result<Deployment> {
        let source = &content.source;
        let work = tempfile::Builder::new()
            .prefix("deploy-")
            .tempdir_in(&self.staging)?;

        // Taken before resolution so the marker describes what was read.
        let artifact = local_digest(source).await;
        let all = candidates(source);
        let mut chosen = None;
        for (i, candidate) in all.iter().enumerate() {
            let unpack_dir = work.path().join(i.to_string());
            let label = candidate.label();
            let attempt = self.resolve(candidate, unpack_dir, source.sha256.as_deref());
            if let Some(resolved) = chain.attempt(label.clone(), attempt).await {
                chosen = Some((label, resolved));
                break;
            }
        }
        let Some((origin, resolved)) = chosen else {
            return Err(Error::ContentUnresolved {
                attempts: all.len(),
            });
        };
        info!(
            "Resolved content from {} (sha256 {})",
            origin, resolved.hash
        );

        target.sync_tree(&resolved.root).await?;

        let mut warnings = Vec::new();
        if !INDEX_DOCUMENTS
            .iter()
            .any(|doc| resolved.root.join(doc).is_file())
        {
            let warning = Error::StructuralWarning(format!(
                "no index document ({}) at the content root of {}",
                INDEX_DOCUMENTS.join(", "),
                target.describe()
            ));
            warn!("{}", warning);
            warnings.push(warning.to_string());
        }

        target
            .normalize_permissions(content.owner.as_deref())
            .await?;

        let marker = ContentMarker::new(&resolved.hash, source.fingerprint(artifact.as_deref()));
        target.write_marker(&marker).await?;

        Ok(Deployment {
            content_hash: resolved.hash,
            origin,
            warnings,
        })
    }

    async fn resolve(
        &self,
        candidate: &Candidate,
        unpack_dir: PathBuf,
        pin: Option<&str>,
    ) -> Result<Resolved> {
        let root = match candidate {
            Candidate::Local(path) => {
                if !path.exists() {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("{} does not exist", path.display()),
                    )));
                }
                if path.is_dir() {
                    path.clone()
                } else {
                    unpack(path.clone(), unpack_dir).await?
                }
            }
            Candidate::Remote { url, .. } => {
                let dest = self.downloads.join(download_name(url));
                self.fetcher.fetch(url, &dest).await.map_err(fetch_error)?;
                unpack(dest, unpack_dir).await?
            }
        };

        let hash = {
            let root = root.clone();
            tokio::task::spawn_blocking(move || tree_hash(&root))
                .await
                .map_err(|e| Error::Internal(e.to_string()))??
        };

        if let Some(pin) = pin {
            if !pin.eq_ignore_ascii_case(&hash) {
                return Err(Error::PinMismatch {
                    expected: pin.to_string(),
                    actual: hash,
                });
            }
        }
        Ok(Resolved { root, hash })
    }
}

/// Extract a zip artifact and locate its content root.
async fn unpack(archive: PathBuf, dest: PathBuf) -> Result<PathBuf> {
    tokio::task::spawn_blocking(move || -> Result<PathBuf> {
        if !is_zip(&archive)? {
            return Err(Error::Archive(format!(
                "{} is not a zip archive",
                archive.display()
            )));
        }
        extract_zip(&archive, &dest)?;
        Ok(content_root(&dest)?)
    })
    .await
    .map_err(|e| Error::Internal(e.to_string()))?
}

fn fetch_error(err: FetchError) -> Error {
    match err {
        FetchError::NotFound { url } => Error::ArtifactNotFound(url),
        FetchError::Status { url, status } => {
            Error::Network(format!("HTTP {} from {}", status, url))
        }
        FetchError::Network { url, reason } => Error::Network(format!("{}: {}", url, reason)),
        FetchError::Io(e) => Error::Io(e),
    }
}

/// Stable file name for a downloaded URL.
fn download_name(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    let digest = hex::encode(hasher.finalize());
    let base = Path::new(url.split(['?', '#']).next().unwrap_or(url))
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("artifact");
    format!("{}-{}", &digest[..12], base)
}
