//! Zip detection and extraction, plus plain directory copies.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use provisor_core::{Error, Result};
use tracing::debug;

/// Local file header or (empty archive) end-of-central-directory signature.
const ZIP_MAGIC: [&[u8; 4]; 2] = [b"PK\x03\x04", b"PK\x05\x06"];

/// Whether `path` starts with a zip signature.
pub fn is_zip(path: &Path) -> std::io::Result<bool> {
    let mut magic = [0u8; 4];
    let mut file = File::open(path)?;
    let mut filled = 0;
    while filled < magic.len() {
        let n = file.read(&mut magic[filled..])?;
        if n == 0 {
            return Ok(false);
        }
        filled += n;
    }
    Ok(ZIP_MAGIC.iter().any(|m| **m == magic))
}

/// Extract a zip archive into `dest`.
///
/// Fails on any entry whose path would land outside `dest`.
pub fn extract_zip(archive_path: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| Error::Archive(format!("Invalid ZIP file: {}", e)))?;
    std::fs::create_dir_all(dest)?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| Error::Archive(format!("Unreadable ZIP entry {}: {}", i, e)))?;
        let rel = entry.enclosed_name().ok_or_else(|| {
            Error::Archive(format!("ZIP entry '{}' escapes the destination", entry.name()))
        })?;
        let out = dest.join(rel);

        if entry.is_dir() {
            std::fs::create_dir_all(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&out)?;
        std::io::copy(&mut entry, &mut file)?;
    }

    debug!(
        "Extracted {} entries from {} into {}",
        archive.len(),
        archive_path.display(),
        dest.display()
    );
    Ok(())
}

/// The directory that holds the content: a lone top-level folder (the
/// GitHub archive layout) or `dir` itself.
pub fn content_root(dir: &Path) -> std::io::Result<PathBuf> {
    let mut entries = std::fs::read_dir(dir)?.collect::<std::io::Result<Vec<_>>>()?;
    if entries.len() == 1 {
        let only = entries.remove(0).path();
        if only.is_dir() {
            return Ok(only);
        }
    }
    Ok(dir.to_path_buf())
}

/// Recursively copy the contents of `src` into `dest`.
pub fn copy_dir(src: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let target = dest.join(entry.file_name());
        if file_type.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
    use std::io::Write;
    let buf = std::io::Cursor::new(Vec::new());
    let mut zip = zip::ZipWriter::new(buf);
    let options = zip::write::SimpleFileOptions::default();
    for (name, data) in entries {
        if name.ends_with('/') {
            zip.add_directory(*name, options).unwrap();
        } else {
            zip.start_file(*name, options).unwrap();
            zip.write_all(data).unwrap();
        }
    }
    zip.finish().unwrap().into_inner()
}
