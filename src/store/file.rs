// src/store/file.rs
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};

use super::SnapshotStore;

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Filesystem-backed store rooted at a data directory. Atomic replace is
/// write-to-temp-then-rename in the same directory, so the rename never
/// crosses a filesystem boundary.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    fn ensure_parent(full: &Path) -> Result<()> {
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        Ok(())
    }

    fn tmp_sibling(full: &Path) -> PathBuf {
        let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
        let name = full
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "snapshot".to_string());
        full.with_file_name(format!(".{name}.tmp.{}.{seq}", std::process::id()))
    }
}

impl SnapshotStore for FileStore {
    fn write_atomic(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let full = self.resolve(path);
        Self::ensure_parent(&full)?;

        let tmp = Self::tmp_sibling(&full);
        {
            let mut f = fs::File::create(&tmp)
                .with_context(|| format!("creating temp file {}", tmp.display()))?;
            f.write_all(bytes)
                .with_context(|| format!("writing temp file {}", tmp.display()))?;
            f.sync_all().ok();
        }
        if let Err(e) = fs::rename(&tmp, &full) {
            let _ = fs::remove_file(&tmp);
            return Err(e).with_context(|| format!("renaming into {}", full.display()));
        }
        Ok(())
    }

    fn read(&self, path: &str) -> Option<Vec<u8>> {
        fs::read(self.resolve(path)).ok()
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve(path).exists()
    }

    fn create_exclusive(&self, path: &str, bytes: &[u8]) -> Result<bool> {
        let full = self.resolve(path);
        Self::ensure_parent(&full)?;
        match OpenOptions::new().write(true).create_new(true).open(&full) {
            Ok(mut f) => {
                f.write_all(bytes)
                    .with_context(|| format!("writing lock record {}", full.display()))?;
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e).with_context(|| format!("creating {}", full.display())),
        }
    }

    fn remove(&self, path: &str) -> Result<()> {
        match fs::remove_file(self.resolve(path)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {path}")),
        }
    }
}
