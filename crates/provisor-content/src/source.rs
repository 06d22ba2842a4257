//! Candidate sources for a content bundle, in resolution order.

use std::path::PathBuf;

use provisor_core::{ContentSource, Error, Result};
use tracing::warn;

use crate::digest::artifact_digest;

/// One place the bundle may come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Candidate {
    /// Local zip archive or directory, used verbatim.
    Local(PathBuf),
    /// Remote archive; `branch` is set when the URL was a branch template.
    Remote { branch: Option<String>, url: String },
}

impl Candidate {
    /// Strategy label recorded in the action result.
    pub fn label(&self) -> String {
        match self {
            Self::Local(path) => format!("local:{}", path.display()),
            Self::Remote {
                branch: Some(branch),
                ..
            } => format!("remote:{}", branch),
            Self::Remote { url, .. } => format!("remote:{}", url),
        }
    }
}

/// Local path first, then each remote URL in branch order.
pub fn candidates(source: &ContentSource) -> Vec<Candidate> {
    let mut out = Vec::new();
    if let Some(local) = &source.local {
        out.push(Candidate::Local(local.clone()));
    }
    if let Some(remote) = &source.remote {
        out.extend(
            remote
                .urls()
                .into_iter()
                .map(|(branch, url)| Candidate::Remote { branch, url }),
        );
    }
    out
}

/// Digest of the configured local artifact, for [`ContentSource::fingerprint`].
///
/// `None` when no local path is configured, nothing exists there, or it
/// cannot be read. Unreadable artifacts are logged.
pub async fn local_digest(source: &ContentSource) -> Option<String> {
    let path = source.local.clone()?;
    let digest = tokio::task::spawn_blocking(move || -> Result<Option<String>> {
        Ok(artifact_digest(&path)?)
    })
    .await
    .map_err(|e| Error::Internal(e.to_string()))
    .and_then(|r| r);
    match digest {
        Ok(d) => d,
        Err(e) => {
            warn!("Cannot digest local content artifact: {}", e);
            None
        }
    }
}
