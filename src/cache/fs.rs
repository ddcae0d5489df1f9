//! Filesystem helpers shared by the cache stores.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;

use tempfile::NamedTempFile;

use super::error::{CacheError, CacheResult};

/// Create `dir` and its parents.
pub(crate) fn ensure_dir(dir: &Path) -> CacheResult<()> {
    fs::create_dir_all(dir).map_err(|err| CacheError::io(dir, err))
}

/// Replace `path` with `contents` so readers see either the old or the new file.
///
/// The temp file lives next to the target so the final rename stays on one filesystem.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> CacheResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| CacheError::validation(format!("`{}` has no parent", path.display())))?;
    ensure_dir(parent)?;

    let mut temp = NamedTempFile::new_in(parent).map_err(|err| CacheError::io(parent, err))?;
    temp.write_all(contents)
        .and_then(|_| temp.as_file().sync_all())
        .map_err(|err| CacheError::io(temp.path(), err))?;
    temp.persist(path)
        .map_err(|err| CacheError::io(path, err.error))?;
    Ok(())
}

/// Remove a file; returns false when it is already gone.
pub(crate) fn remove_file(path: &Path) -> CacheResult<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(CacheError::io(path, err)),
    }
}

/// Remove a directory tree; returns false when it is already gone.
pub(crate) fn remove_dir_all(path: &Path) -> CacheResult<bool> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(CacheError::io(path, err)),
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn write_atomic_creates_parents_and_replaces() {
        let dir = TempDir::new().expect("temp dir");
        let target = dir.path().join("a/b/file.json");

        write_atomic(&target, b"first").expect("first write");
        write_atomic(&target, b"second").expect("second write");

        assert_eq!(fs::read(&target).expect("read back"), b"second");
        let leftovers = fs::read_dir(target.parent().expect("parent"))
            .expect("list")
            .count();
        assert_eq!(leftovers, 1, "temp files must not linger");
    }

    #[test]
    fn removing_missing_paths_is_not_an_error() {
        let dir = TempDir::new().expect("temp dir");
        assert!(!remove_file(&dir.path().join("nope")).expect("remove file"));
        assert!(!remove_dir_all(&dir.path().join("nope")).expect("remove dir"));
    }
}
