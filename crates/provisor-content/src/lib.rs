//! Provisor Content — resolves a content bundle from its candidate sources,
//! unpacks and hashes it, and syncs it into a deployment target.

pub mod archive;
pub mod deployer;
pub mod digest;
pub mod permissions;
pub mod source;
pub mod target;

pub use deployer::{ContentDeployer, Deployment, INDEX_DOCUMENTS};
pub use digest::{artifact_digest, tree_hash};
pub use source::{candidates, local_digest, Candidate};
pub use target::{ContainerTarget, ContentTarget, DirectoryTarget};
