use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{
    error::Result,
    snapshot::SnapshotPlan,
    tooling::{FsPort, LoopPort, LvmPort, MountPort, Toolbox},
};

/// Membership of a block device in LVM, as `pvs` sees it right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PvState {
    /// Not a physical volume.
    Absent,
    /// A PV that belongs to no volume group.
    Orphan,
    Member(String),
}

/// Read-only view of kernel and LVM state. Nothing here is cached: every
/// call asks the host again.
pub struct SystemStateProbe {
    lvm: Arc<dyn LvmPort>,
    lo: Arc<dyn LoopPort>,
    mount: Arc<dyn MountPort>,
    fs: Arc<dyn FsPort>,
}

impl SystemStateProbe {
    pub fn new(tools: &Toolbox) -> Self {
        Self {
            lvm: tools.lvm(),
            lo: tools.lo(),
            mount: tools.mount(),
            fs: tools.fs(),
        }
    }

    pub fn list_mounts(&self) -> Result<BTreeMap<PathBuf, PathBuf>> {
        self.mount.list_mounts()
    }

    /// Source device currently mounted at `mountpoint`, if any.
    pub fn mounted_from(&self, mountpoint: &Path) -> Result<Option<PathBuf>> {
        Ok(self.list_mounts()?.remove(mountpoint))
    }

    /// Nearest ancestor of `path` (itself included) that is a mount boundary.
    pub fn find_mount_point(&self, path: &Path) -> PathBuf {
        let mut cur = self.fs.resolve(path);
        while !self.fs.is_mount(&cur) {
            match cur.parent() {
                Some(parent) => cur = self.fs.resolve(parent),
                None => break,
            }
        }
        cur
    }

    pub fn list_physical_volumes(&self) -> Result<BTreeMap<PathBuf, String>> {
        self.lvm.list_pvs()
    }

    pub fn pv_state(&self, dev: &Path) -> Result<PvState> {
        let pvs = self.list_physical_volumes()?;
        Ok(classify_pv(dev, pvs.get(dev).map(String::as_str)))
    }

    pub fn list_loop_devices(&self) -> Result<BTreeMap<PathBuf, PathBuf>> {
        self.lo.list()
    }

    /// File currently attached to `dev`, if the loop device is in use.
    pub fn loop_backing(&self, dev: &Path) -> Result<Option<PathBuf>> {
        Ok(self.list_loop_devices()?.remove(dev))
    }

    #[inline]
    pub fn device_exists(&self, dev: &Path) -> bool {
        self.fs.exists(dev)
    }

    pub fn status(&self, plan: &SnapshotPlan) -> Result<SnapshotStatus> {
        let snapshot_device = plan.snapshot().device();
        let loop_backing = match &plan.backing {
            Some(b) => Some(LoopStatus {
                device: b.loop_device.clone(),
                pv: self.pv_state(&b.loop_device)?,
                attached: self.loop_backing(&b.loop_device)?,
                file: b.file.clone(),
                file_exists: self.fs.exists(&b.file),
            }),
            None => None,
        };
        Ok(SnapshotStatus {
            source_device: plan.source().device(),
            source_present: self.device_exists(&plan.source().device()),
            snapshot_present: self.device_exists(&snapshot_device),
            snapshot_device,
            mountpoint: plan.mountpoint.clone(),
            mountpoint_exists: self.fs.exists(&plan.mountpoint),
            mounted_from: self.mounted_from(&plan.mountpoint)?,
            loop_backing,
        })
    }
}

/// `pvs` prints an orphan PV either with an empty VG column or with the
/// device path repeated in it; both mean "no group".
fn classify_pv(dev: &Path, vg_column: Option<&str>) -> PvState {
    match vg_column {
        None => PvState::Absent,
        Some(vg) if vg.is_empty() || Path::new(vg) == dev => PvState::Orphan,
        Some(vg) => PvState::Member(vg.to_string()),
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotStatus {
    pub source_device: PathBuf,
    pub source_present: bool,
    pub snapshot_device: PathBuf,
    pub snapshot_present: bool,
    pub mountpoint: PathBuf,
    pub mountpoint_exists: bool,
    pub mounted_from: Option<PathBuf>,
    pub loop_backing: Option<LoopStatus>,
}

impl SnapshotStatus {
    pub fn is_mounted(&self) -> bool {
        self.mounted_from.as_deref() == Some(self.snapshot_device.as_path())
    }
}

#[derive(Debug, Clone)]
pub struct LoopStatus {
    pub device: PathBuf,
    pub pv: PvState,
    pub attached: Option<PathBuf>,
    pub file: PathBuf,
    pub file_exists: bool,
}
