//! File persistence helpers with atomic writes
//!
//! Settings and runtime configuration are written via temp file + rename so
//! a crash never leaves a half-written file behind.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

use super::RuntimeConfig;
use super::error::{StorageError, StorageResult};

/// Write data atomically to a file
///
/// Creates a temporary file, writes the data, syncs, then renames
pub fn write_atomic(path: &Path, data: &[u8]) -> StorageResult<()> {
    let temp_path = path.with_extension("tmp");
    let failed = |detail: String| StorageError::AtomicWriteFailed {
        path: path.to_path_buf(),
        detail,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let mut file = File::create(&temp_path)
        .map_err(|err| failed(format!("cannot create {}: {err}", temp_path.display())))?;
    file.write_all(data)
        .map_err(|err| failed(format!("write failed: {err}")))?;
    file.sync_all()
        .map_err(|err| failed(format!("sync failed: {err}")))?;
    drop(file);

    fs::rename(&temp_path, path)
        .map_err(|err| failed(format!("rename from {} failed: {err}", temp_path.display())))?;

    // Sync parent directory
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        let dir = OpenOptions::new().read(true).open(parent)?;
        dir.sync_all()?;
    }

    Ok(())
}

/// Read a whole file
pub fn read_file(path: &Path) -> StorageResult<Vec<u8>> {
    if !path.exists() {
        return Err(StorageError::PathNotFound(path.to_path_buf()));
    }
    Ok(fs::read(path)?)
}

/// Write runtime configuration as pretty JSON
pub fn write_config(path: &Path, config: &RuntimeConfig) -> StorageResult<()> {
    let json = serde_json::to_vec_pretty(config)?;
    write_atomic(path, &json)
}

/// Load runtime configuration
pub fn load_config(path: &Path) -> StorageResult<RuntimeConfig> {
    let data = read_file(path)?;
    Ok(serde_json::from_slice(&data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_and_read_config() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("callflow.json");

        let config = RuntimeConfig::default()
            .with_capacity(8)
            .with_idle_ttl(std::time::Duration::from_secs(30));
        write_config(&path, &config).unwrap();
        let loaded = load_config(&path).unwrap();

        assert_eq!(loaded.cache_capacity, 8);
        assert_eq!(loaded.idle_ttl_ms, 30_000);
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_atomic_write_creates_parents() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("nested/dir/test.dat");

        write_atomic(&target, b"Hello, world!").unwrap();
        assert_eq!(read_file(&target).unwrap(), b"Hello, world!");
        assert!(!target.with_extension("tmp").exists());
    }

    #[test]
    fn test_missing_file() {
        let temp = TempDir::new().unwrap();
        assert!(matches!(
            read_file(&temp.path().join("absent.json")),
            Err(StorageError::PathNotFound(_))
        ));
    }
}
