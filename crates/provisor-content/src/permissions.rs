//! Fixed ownership and mode policy for deployed trees.

use std::path::Path;

pub const DIR_MODE: u32 = 0o755;
pub const FILE_MODE: u32 = 0o644;

/// Commands that apply the mode policy below `root` inside a container.
pub fn chmod_commands(root: &str) -> Vec<Vec<String>> {
    [("d", DIR_MODE), ("f", FILE_MODE)]
        .into_iter()
        .map(|(kind, mode)| {
            vec![
                "find".into(),
                root.into(),
                "-type".into(),
                kind.into(),
                "-exec".into(),
                "chmod".into(),
                format!("{:o}", mode),
                "{}".into(),
                "+".into(),
            ]
        })
        .collect()
}

pub fn chown_command(root: &str, owner: &str) -> Vec<String> {
    vec!["chown".into(), "-R".into(), owner.into(), root.into()]
}

/// Apply the mode policy to a local tree, `root` included.
#[cfg(unix)]
pub fn normalize_tree(root: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(DIR_MODE))?;
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                stack.push(entry.path());
            } else if file_type.is_file() {
                std::fs::set_permissions(entry.path(), std::fs::Permissions::from_mode(FILE_MODE))?;
            }
        }
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn normalize_tree(root: &Path) -> std::io::Result<()> {
    std::fs::metadata(root).map(|_| ())
}
