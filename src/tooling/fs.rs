use std::{
    fs,
    os::unix::fs::{FileTypeExt, MetadataExt},
    path::{self, Path, PathBuf},
};

use crate::error::{IoContext, Result};

/// Local filesystem queries and the few mutations the lifecycle performs
/// directly instead of through an external tool.
pub trait FsPort: Send + Sync {
    fn exists(&self, path: &Path) -> bool;
    fn is_dir(&self, path: &Path) -> bool;
    fn is_file(&self, path: &Path) -> bool;
    fn is_block_device(&self, path: &Path) -> bool;
    /// Same rule as `mountpoint(1)`: `path` sits on a different device than
    /// its parent, or is its own parent.
    fn is_mount(&self, path: &Path) -> bool;
    /// Resolves symlinks when the target exists, otherwise returns the
    /// absolute form of `path`.
    fn resolve(&self, path: &Path) -> PathBuf;
    fn available_bytes(&self, dir: &Path) -> Result<u64>;
    fn create_dir(&self, path: &Path) -> Result<()>;
    fn remove_dir(&self, path: &Path) -> Result<()>;
    fn remove_file(&self, path: &Path) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFs;

impl FsPort for LocalFs {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn is_file(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn is_block_device(&self, path: &Path) -> bool {
        fs::metadata(path)
            .map(|m| m.file_type().is_block_device())
            .unwrap_or(false)
    }

    fn is_mount(&self, path: &Path) -> bool {
        let Ok(meta) = fs::symlink_metadata(path) else {
            return false;
        };
        if meta.file_type().is_symlink() || !meta.is_dir() {
            return false;
        }
        let Ok(parent) = fs::metadata(path.join("..")) else {
            return false;
        };
        meta.dev() != parent.dev() || meta.ino() == parent.ino()
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        fs::canonicalize(path)
            .or_else(|_| path::absolute(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }

    fn available_bytes(&self, dir: &Path) -> Result<u64> {
        fs2::available_space(dir).io_context(|| format!("statvfs {}", dir.display()))
    }

    fn create_dir(&self, path: &Path) -> Result<()> {
        fs::create_dir(path).io_context(|| format!("mkdir {}", path.display()))
    }

    fn remove_dir(&self, path: &Path) -> Result<()> {
        fs::remove_dir(path).io_context(|| format!("rmdir {}", path.display()))
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        fs::remove_file(path).io_context(|| format!("rm {}", path.display()))
    }
}
