//! Content hashing and tree copying for task bundles.

use std::fs;
use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

/// Hex SHA-256 over every regular file under `dir`.
///
/// Files are visited in sorted relative-path order and each contributes
/// `path \0 bytes \0`, so renames change the hash as well as edits.
pub fn hash_tree(dir: &Path) -> io::Result<String> {
    let mut hasher = Sha256::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = relative(dir, entry.path());
        hasher.update(rel.as_bytes());
        hasher.update([0u8]);
        hasher.update(fs::read(entry.path())?);
        hasher.update([0u8]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Copy the regular files and directories of `src` into `dst`.
pub(crate) fn copy_tree(src: &Path, dst: &Path) -> io::Result<u64> {
    let mut copied = 0;
    for entry in WalkDir::new(src).sort_by_file_name() {
        let entry = entry.map_err(io::Error::other)?;
        let target = dst.join(relative(src, entry.path()));
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            copied += fs::copy(entry.path(), &target)?;
        }
    }
    Ok(copied)
}

/// `/`-separated path of `path` below `root`.
fn relative(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_content_sensitive() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("main.py"), "def handler(ctx, ev): pass\n").unwrap();
        fs::create_dir(dir.path().join("lib")).unwrap();
        fs::write(dir.path().join("lib/util.py"), "X = 1\n").unwrap();

        let first = hash_tree(dir.path()).unwrap();
        assert_eq!(first, hash_tree(dir.path()).unwrap());
        assert_eq!(first.len(), 64);

        fs::write(dir.path().join("lib/util.py"), "X = 2\n").unwrap();
        assert_ne!(first, hash_tree(dir.path()).unwrap());
    }

    #[test]
    fn hash_covers_file_names() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        fs::write(a.path().join("one.py"), "same").unwrap();
        fs::write(b.path().join("two.py"), "same").unwrap();
        assert_ne!(hash_tree(a.path()).unwrap(), hash_tree(b.path()).unwrap());
    }

    #[test]
    fn copy_tree_preserves_layout() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        fs::create_dir(src.path().join("pkg")).unwrap();
        fs::write(src.path().join("pkg/mod.py"), "pass\n").unwrap();
        fs::write(src.path().join("main.py"), "pass\n").unwrap();

        let target = dst.path().join("copy");
        copy_tree(src.path(), &target).unwrap();

        assert!(target.join("main.py").is_file());
        assert!(target.join("pkg/mod.py").is_file());
        assert_eq!(hash_tree(src.path()).unwrap(), hash_tree(&target).unwrap());
    }
}
