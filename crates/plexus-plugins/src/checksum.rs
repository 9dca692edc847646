//! Content hashing of plugin sources.
//!
//! The hash is recomputed at every load and by the watcher after every burst
//! of file events. It detects drift only; it is not a trust anchor.

use std::path::{Path, PathBuf};

use tracing::debug;

/// Directory names skipped when hashing and watching.
pub const IGNORED_DIRS: &[&str] = &[".git", ".svn", ".hg", "node_modules", "target"];

/// File names skipped when hashing and watching.
pub const IGNORED_FILES: &[&str] = &[".DS_Store", "Thumbs.db"];

/// Whether any component of `path` is version-control or OS metadata.
#[must_use]
pub fn is_ignored_path(path: &Path) -> bool {
    path.components().any(|c| {
        c.as_os_str()
            .to_str()
            .is_some_and(|s| IGNORED_DIRS.contains(&s) || IGNORED_FILES.contains(&s))
    })
}

/// Compute a deterministic blake3 hash over every file below `dir`.
///
/// Files are sorted by relative path. Each file contributes its path length,
/// path, content length and content, so renames change the hash too.
/// Symlinks and ignored paths are skipped. A missing directory hashes as
/// empty.
///
/// # Errors
///
/// Returns an error if `dir` exists but cannot be listed. Files that vanish
/// between listing and reading are skipped.
pub fn compute_source_hash(dir: &Path) -> std::io::Result<String> {
    let mut hasher = blake3::Hasher::new();
    let mut paths = Vec::new();
    collect_source_paths(dir, &mut paths)?;
    paths.sort();

    for path in &paths {
        let Ok(rel) = path.strip_prefix(dir) else {
            continue;
        };
        match std::fs::read(path) {
            Ok(content) => {
                let rel = rel.to_string_lossy();
                let rel = rel.as_bytes();
                hasher.update(&(rel.len() as u64).to_le_bytes());
                hasher.update(rel);
                hasher.update(&(content.len() as u64).to_le_bytes());
                hasher.update(&content);
            },
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Skipping unreadable file in hash");
            },
        }
    }

    Ok(hasher.finalize().to_hex().to_string())
}

fn collect_source_paths(dir: &Path, paths: &mut Vec<PathBuf>) -> std::io::Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }

    for entry in std::fs::read_dir(dir)? {
        let Ok(entry) = entry else { continue };
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_symlink() {
            continue;
        }

        let name = entry.file_name();
        let name = name.to_string_lossy();
        let path = entry.path();

        if file_type.is_dir() {
            if IGNORED_DIRS.contains(&name.as_ref()) {
                continue;
            }
            collect_source_paths(&path, paths)?;
        } else if file_type.is_file() && !IGNORED_FILES.contains(&name.as_ref()) {
            paths.push(path);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn hash_is_deterministic() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello").unwrap();
        std::fs::write(dir.path().join("b.txt"), "world").unwrap();

        let first = compute_source_hash(dir.path()).unwrap();
        assert_eq!(first, compute_source_hash(dir.path()).unwrap());
    }

    #[test]
    fn hash_tracks_content_and_renames() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello").unwrap();
        let before = compute_source_hash(dir.path()).unwrap();

        std::fs::write(dir.path().join("a.txt"), "goodbye").unwrap();
        let edited = compute_source_hash(dir.path()).unwrap();
        assert_ne!(before, edited);

        std::fs::rename(dir.path().join("a.txt"), dir.path().join("b.txt")).unwrap();
        assert_ne!(edited, compute_source_hash(dir.path()).unwrap());
    }

    #[test]
    fn ignored_paths_do_not_affect_hash() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("main.sh"), "echo").unwrap();
        let before = compute_source_hash(dir.path()).unwrap();

        std::fs::create_dir(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git/HEAD"), "ref").unwrap();
        std::fs::write(dir.path().join(".DS_Store"), "junk").unwrap();
        assert_eq!(before, compute_source_hash(dir.path()).unwrap());

        assert!(is_ignored_path(Path::new("/p/billing/.git/HEAD")));
        assert!(!is_ignored_path(Path::new("/p/billing/backend/run.sh")));
    }

    #[test]
    fn missing_directory_hashes_as_empty() {
        let dir = TempDir::new().unwrap();
        let missing = compute_source_hash(&dir.path().join("nope")).unwrap();
        let empty = compute_source_hash(dir.path()).unwrap();
        assert_eq!(missing, empty);
    }
}
