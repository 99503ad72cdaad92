use std::sync::Arc;

use tracing as log;

use crate::{
    error::{Error, Result},
    snapshot::{LvRef, probe::SystemStateProbe},
    tooling::{LvmPort, Toolbox},
};

pub struct SnapshotManager {
    probe: Arc<SystemStateProbe>,
    lvm: Arc<dyn LvmPort>,
}

impl SnapshotManager {
    pub fn new(tools: &Toolbox, probe: Arc<SystemStateProbe>) -> Self {
        Self {
            probe,
            lvm: tools.lvm(),
        }
    }

    /// Creates `source.vg/name` as a copy-on-write snapshot of `source`.
    /// The snapshot's mapper device must exist once lvcreate returns.
    pub fn create(&self, source: &LvRef, name: &str, size_mb: u64) -> Result<LvRef> {
        log::info!("[lvm] creating snapshot {name} of {source} ({size_mb} MB)");
        self.lvm
            .lvcreate_snapshot(&source.vg, &source.lv, name, size_mb)?;
        let snap = LvRef::new(&source.vg, name);
        let dev = snap.device();
        if !self.probe.device_exists(&dev) {
            return Err(Error::Inconsistent(format!(
                "lvcreate succeeded but snapshot device {} did not appear",
                dev.display()
            )));
        }
        Ok(snap)
    }

    /// Removes the snapshot if its device exists; a no-op otherwise.
    pub fn remove(&self, vg: &str, name: &str) -> Result<()> {
        let snap = LvRef::new(vg, name);
        if !self.probe.device_exists(&snap.device()) {
            log::info!("[lvm] snapshot volume {snap} does not exist");
            return Ok(());
        }
        log::info!("[lvm] removing snapshot volume {snap}");
        self.lvm.lvremove_force(vg, name)
    }
}
