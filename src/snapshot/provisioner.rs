use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use tracing as log;

use crate::{
    error::{Result, precondition},
    snapshot::{
        LvRef,
        probe::{PvState, SystemStateProbe},
    },
    tooling::{AllocMethod, FsPort, LoopPort, LvmPort, Toolbox},
    utils::process::Runner,
};

/// Extra room on top of the snapshot size for PV metadata; LVM needs at
/// least one more 4 MB extent.
pub const PV_OVERHEAD_MB: u64 = 16;

/// The backing file may use at most this share of the free space left on
/// its filesystem.
pub const MAX_FREE_SPACE_SHARE: f64 = 0.9;

const MB: f64 = 1024.0 * 1024.0;

type DynRunner = dyn Runner + Send + Sync;

/// Temporary file -> loop device -> PV -> VG extension, and the way back.
pub struct LoopBackedVolumeProvisioner {
    probe: Arc<SystemStateProbe>,
    runner: Arc<DynRunner>,
    lvm: Arc<dyn LvmPort>,
    lo: Arc<dyn LoopPort>,
    fs: Arc<dyn FsPort>,
    allocate_timeout: Duration,
}

impl LoopBackedVolumeProvisioner {
    pub fn new(tools: &Toolbox, probe: Arc<SystemStateProbe>, allocate_timeout: Duration) -> Self {
        Self {
            probe,
            runner: tools.runner(),
            lvm: tools.lvm(),
            lo: tools.lo(),
            fs: tools.fs(),
            allocate_timeout,
        }
    }

    /// Creates the backing file. Fails with a precondition error, before
    /// writing anything, if the file exists, would live on `source` itself,
    /// or would eat more than 90% of the free space.
    pub fn allocate(
        &self,
        file: &Path,
        size_mb: u64,
        method: AllocMethod,
        source: &LvRef,
    ) -> Result<()> {
        let total_mb = size_mb + PV_OVERHEAD_MB;
        let dir = self.check_allocation(file, total_mb, source)?;

        log::info!(
            "[alloc] creating {} ({total_mb} MB) with {} in {}, timeout {}s",
            file.display(),
            method.bin(),
            dir.display(),
            self.allocate_timeout.as_secs()
        );
        let cmd = method
            .command(file, total_mb)
            .timeout(self.allocate_timeout);
        self.runner.run(&cmd)
    }

    fn check_allocation(&self, file: &Path, total_mb: u64, source: &LvRef) -> Result<PathBuf> {
        if self.fs.exists(file) {
            precondition!("backing file {} already exists", file.display());
        }
        let Some(dir) = file.parent().filter(|d| !d.as_os_str().is_empty()) else {
            precondition!("backing file {} has no parent directory", file.display());
        };

        // a PV file on the origin LV hangs all I/O once the snapshot exists
        let mounts = self.probe.list_mounts()?;
        let fs_root = self.probe.find_mount_point(dir);
        let source_dev = source.device();
        if mounts.get(&fs_root) == Some(&source_dev) {
            precondition!(
                "backing file {} would live on {} ({}), the volume being snapshotted",
                file.display(),
                fs_root.display(),
                source_dev.display()
            );
        }

        let free_mb = self.fs.available_bytes(dir)? as f64 / MB;
        if free_mb <= 0.0 || total_mb as f64 / free_mb > MAX_FREE_SPACE_SHARE {
            precondition!(
                "backing file {} of {total_mb} MB would take more than 90% of the {free_mb:.0} MB available in {}",
                file.display(),
                dir.display()
            );
        }
        log::debug!("[alloc] {free_mb:.0} MB available in {}", dir.display());
        Ok(dir.to_path_buf())
    }

    /// Attaches `file` to the existing loop device `dev`, turns it into a PV
    /// and adds it to `vg`.
    pub fn attach(&self, dev: &Path, file: &Path, vg: &str) -> Result<()> {
        if !self.fs.is_block_device(dev) {
            precondition!(
                "no block device at {}; the loop device node must exist beforehand",
                dev.display()
            );
        }
        log::info!("[loop] attaching {} to {}", file.display(), dev.display());
        self.lo.attach(dev, file)?;
        log::info!("[lvm] creating physical volume on {}", dev.display());
        self.lvm.pvcreate(dev)?;
        log::info!("[lvm] extending volume group {vg} with {}", dev.display());
        self.lvm.vgextend(vg, dev)
    }

    /// Takes the loop device out of `vg` and wipes its PV label. Nothing is
    /// touched while `dev` serves a file other than `file`, or when the PV
    /// belongs to another group.
    pub fn release_pv(&self, dev: &Path, file: &Path, vg: &str) -> Result<()> {
        if let Some(attached) = self.probe.loop_backing(dev)?
            && !self.serves(&attached, file)
        {
            log::warn!(
                "[lvm] {} serves {} instead of {}; leaving its physical volume",
                dev.display(),
                attached.display(),
                file.display()
            );
            return Ok(());
        }
        let mut state = self.probe.pv_state(dev)?;
        if state == PvState::Member(vg.to_string()) {
            log::info!("[lvm] removing {} from volume group {vg}", dev.display());
            self.lvm.vgreduce(vg, dev)?;
            state = self.probe.pv_state(dev)?;
        }
        match state {
            PvState::Orphan => {
                log::info!("[lvm] destroying physical volume {}", dev.display());
                self.lvm.pvremove(dev)
            }
            PvState::Absent => {
                log::debug!("[lvm] {} is not a physical volume", dev.display());
                Ok(())
            }
            PvState::Member(other) => {
                log::warn!(
                    "[lvm] {} belongs to volume group {other}, not {vg}; leaving it",
                    dev.display()
                );
                Ok(())
            }
        }
    }

    /// Detaches `dev` only while it still serves `file`.
    pub fn detach_loop(&self, dev: &Path, file: &Path) -> Result<()> {
        match self.probe.loop_backing(dev)? {
            Some(attached) if self.serves(&attached, file) => {
                log::info!("[loop] detaching {}", dev.display());
                self.lo.detach(dev)
            }
            Some(attached) => {
                log::warn!(
                    "[loop] {} serves {} instead of {}; not detaching",
                    dev.display(),
                    attached.display(),
                    file.display()
                );
                Ok(())
            }
            None => {
                log::debug!("[loop] {} is not attached", dev.display());
                Ok(())
            }
        }
    }

    fn serves(&self, attached: &Path, file: &Path) -> bool {
        attached == file || attached == self.fs.resolve(file)
    }

    pub fn remove_backing_file(&self, file: &Path) -> Result<()> {
        if !self.fs.exists(file) {
            log::debug!("[alloc] backing file {} does not exist", file.display());
            return Ok(());
        }
        if !self.fs.is_file(file) {
            log::warn!(
                "[alloc] {} is not a regular file; not removing it",
                file.display()
            );
            return Ok(());
        }
        log::info!("[alloc] removing backing file {}", file.display());
        self.fs.remove_file(file)
    }
}
