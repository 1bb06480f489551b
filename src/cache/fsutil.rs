//! Filesystem helpers shared by the disk backend, the facade state files and
//! the config snapshot.

use std::fs;
use std::io::Write;
use std::path::Path;

use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;
use tracing::debug;

/// Write `contents` to `path` through a temp file in the same directory and
/// an atomic rename, so readers never observe a partial file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(contents)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

/// Read and decode a JSON file, treating absence and corruption as `None`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let raw = fs::read(path).ok()?;
    match serde_json::from_slice(&raw) {
        Ok(value) => Some(value),
        Err(err) => {
            debug!(
                op = "fsutil::read_json",
                path = %path.display(),
                error = %err,
                "Ignoring undecodable JSON file"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_creates_parents_and_replaces() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested/state.json");

        write_atomic(&path, b"[1]").expect("first write");
        write_atomic(&path, b"[1,2]").expect("second write");

        let value: Vec<u32> = read_json(&path).expect("decodes");
        assert_eq!(value, vec![1, 2]);
    }

    #[test]
    fn corrupt_and_missing_files_read_as_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.json");
        assert!(read_json::<Vec<u32>>(&path).is_none());

        fs::write(&path, b"{not json").expect("write");
        assert!(read_json::<Vec<u32>>(&path).is_none());
    }
}
