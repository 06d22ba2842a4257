//! Content hash of a directory tree.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// sha256 over every regular file below `root`, hex encoded.
///
/// Files are visited in sorted relative-path order; each contributes its
/// `/`-separated relative path, a NUL, its length as 8 little-endian bytes
/// and its bytes. Directory layout alone (empty dirs) does not change the hash.
pub fn tree_hash(root: &Path) -> std::io::Result<String> {
    let mut hasher = Sha256::new();
    for (rel, path) in list_files(root)? {
        let bytes = std::fs::read(&path)?;
        hasher.update(rel.as_bytes());
        hasher.update([0u8]);
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(&bytes);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Digest of a local artifact as it sits on disk: sha256 of a file's bytes,
/// or [`tree_hash`] of a directory. `None` when nothing is there.
pub fn artifact_digest(path: &Path) -> std::io::Result<Option<String>> {
    let meta = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    if meta.is_dir() {
        return tree_hash(path).map(Some);
    }
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(Some(hex::encode(hasher.finalize())))
}

/// Regular files below `root` as (relative path, absolute path), sorted.
pub fn list_files(root: &Path) -> std::io::Result<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let path = entry.path();
            if file_type.is_dir() {
                stack.push(path);
            } else if file_type.is_file() {
                let rel = path
                    .strip_prefix(root)
                    .unwrap_or(&path)
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                files.push((rel, path));
            }
        }
    }
    files.sort();
    Ok(files)
}
