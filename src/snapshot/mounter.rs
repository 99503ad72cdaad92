use std::{path::Path, sync::Arc};

use tracing as log;

use crate::{
    error::{Error, Result, precondition},
    snapshot::{LvRef, probe::SystemStateProbe},
    tooling::{FsPort, MountPort, Toolbox},
};

/// Read-only always. ext3/ext4 additionally get `noload`: the snapshot
/// carries the origin's in-flight journal and must never be replayed.
pub fn mount_options(fs_type: &str) -> Vec<&'static str> {
    let mut opts = vec!["ro"];
    if matches!(fs_type, "ext3" | "ext4") {
        opts.push("noload");
    }
    opts
}

pub struct MountController {
    probe: Arc<SystemStateProbe>,
    mount: Arc<dyn MountPort>,
    fs: Arc<dyn FsPort>,
}

impl MountController {
    pub fn new(tools: &Toolbox, probe: Arc<SystemStateProbe>) -> Self {
        Self {
            probe,
            mount: tools.mount(),
            fs: tools.fs(),
        }
    }

    /// Fails unless `mountpoint` is absent or an unmounted directory.
    /// Changes nothing.
    pub fn check_mountpoint(&self, mountpoint: &Path) -> Result<()> {
        if !self.fs.exists(mountpoint) {
            return Ok(());
        }
        if !self.fs.is_dir(mountpoint) {
            precondition!("mountpoint {} is not a directory", mountpoint.display());
        }
        if self.fs.is_mount(mountpoint) {
            precondition!("mountpoint {} is already mounted", mountpoint.display());
        }
        Ok(())
    }

    pub fn mount(&self, dev: &Path, mountpoint: &Path) -> Result<()> {
        self.check_mountpoint(mountpoint)?;
        if !self.fs.exists(mountpoint) {
            log::info!("[mount] creating mountpoint dir {}", mountpoint.display());
            self.fs.create_dir(mountpoint)?;
        }

        let fs_type = self.mount.fs_type(dev)?;
        log::info!("[mount] detected {fs_type} on {}", dev.display());
        let opts = mount_options(&fs_type);
        log::info!(
            "[mount] mounting {} at {} ({})",
            dev.display(),
            mountpoint.display(),
            opts.join(",")
        );
        self.mount.mount(dev, mountpoint, &opts)
    }

    /// Unmounts `snapshot` from `mountpoint` if, and only if, the live mount
    /// table says it is mounted there, then optionally drops the directory.
    pub fn unmount(&self, snapshot: &LvRef, mountpoint: &Path, remove_mountpoint: bool) -> Result<()> {
        if !self.fs.exists(mountpoint) {
            log::info!("[unmount] mountpoint {} does not exist", mountpoint.display());
            return Ok(());
        }

        let dev = snapshot.device();
        match self.probe.mounted_from(mountpoint)? {
            Some(src) if src == dev => {
                log::info!(
                    "[unmount] unmounting {} from {}",
                    dev.display(),
                    mountpoint.display()
                );
                self.mount.umount(&dev)?;
            }
            _ => log::info!(
                "[unmount] {} is not mounted at {}, skipping",
                dev.display(),
                mountpoint.display()
            ),
        }

        if !self.fs.is_dir(mountpoint) {
            return Err(Error::Inconsistent(format!(
                "mountpoint {} is expected to be a directory",
                mountpoint.display()
            )));
        }
        if remove_mountpoint {
            log::info!("[unmount] removing mountpoint {}", mountpoint.display());
            self.fs.remove_dir(mountpoint)?;
        }
        Ok(())
    }
}
