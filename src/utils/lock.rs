use std::{
    fs::{self, File, OpenOptions},
    io,
    os::unix::fs::{DirBuilderExt, OpenOptionsExt},
    path::{Path, PathBuf},
};

use fs2::FileExt;

use crate::error::{Error, IoContext, Result};

/// Exclusive `flock` held for the lifetime of one mount/unmount run against
/// a volume group. Released on drop.
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl std::fmt::Debug for RunLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLock").field("path", &self.path).finish()
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

impl RunLock {
    pub fn for_volume_group(vg: &str) -> Result<Self> {
        Self::try_acquire_at(&lock_dir(), &format!("lvsnap-{vg}"))
    }

    pub fn try_acquire_at(dir: &Path, name: &str) -> Result<Self> {
        let path = dir.join(format!("{}.lock", sanitize_name(name)));
        ensure_dir(dir)?;
        let file = open_lockfile(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self { file, path }),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(Error::Precondition(format!(
                "another lvsnap run holds lock {}",
                path.display()
            ))),
            Err(e) => Err(e).io_context(|| format!("flock {}", path.display())),
        }
    }
}

fn ensure_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        return Ok(());
    }
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(dir)
        .io_context(|| format!("create lock dir {}", dir.display()))
}

fn open_lockfile(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o644)
        .open(path)
        .io_context(|| format!("open lockfile {}", path.display()))
}

fn lock_dir() -> PathBuf {
    let run_lock = Path::new("/run/lock");
    if run_lock.is_dir() {
        run_lock.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

/// VG names may contain characters LVM accepts but we'd rather not put into
/// a file name.
fn sanitize_name(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
