use std::{collections::BTreeSet, sync::Arc};

use crate::{
    error::Result,
    utils::{bins::ensure_bins, process::Runner},
};

pub mod alloc;
pub mod fs;
pub mod losetup;
pub mod lvm;
pub mod mount;

pub use alloc::AllocMethod;
pub use fs::{FsPort, LocalFs};
pub use losetup::{LoopPort, LosetupCli};
pub use lvm::{LvmCli, LvmPort};
pub use mount::{MountCli, MountPort};

type DynRunner = dyn Runner + Send + Sync;

/// Every port the snapshot lifecycle talks to, built over one runner.
#[derive(Clone)]
pub struct Toolbox {
    runner: Arc<DynRunner>,
    lvm: Arc<dyn LvmPort>,
    lo: Arc<dyn LoopPort>,
    mount: Arc<dyn MountPort>,
    fs: Arc<dyn FsPort>,
}

impl Toolbox {
    pub fn new(runner: Arc<DynRunner>) -> Self {
        Self::with_fs(runner, Arc::new(LocalFs))
    }

    pub fn with_fs(runner: Arc<DynRunner>, fs: Arc<dyn FsPort>) -> Self {
        Self {
            lvm: Arc::new(LvmCli::new(runner.clone())),
            lo: Arc::new(LosetupCli::new(runner.clone())),
            mount: Arc::new(MountCli::new(runner.clone())),
            runner,
            fs,
        }
    }

    #[inline]
    pub fn runner(&self) -> Arc<DynRunner> {
        self.runner.clone()
    }
    #[inline]
    pub fn lvm(&self) -> Arc<dyn LvmPort> {
        self.lvm.clone()
    }
    #[inline]
    pub fn lo(&self) -> Arc<dyn LoopPort> {
        self.lo.clone()
    }
    #[inline]
    pub fn mount(&self) -> Arc<dyn MountPort> {
        self.mount.clone()
    }
    #[inline]
    pub fn fs(&self) -> Arc<dyn FsPort> {
        self.fs.clone()
    }
}

/// Checks `PATH` for every tool an action may invoke. `alloc` is the
/// backing-file allocator when one will run.
pub fn ensure_bins_for(loop_backed: bool, alloc: Option<AllocMethod>) -> Result<()> {
    let mut all: BTreeSet<&'static str> = BTreeSet::new();
    all.extend(lvm::REQ_BINS);
    all.extend(mount::REQ_BINS);
    if loop_backed {
        all.extend(losetup::REQ_BINS);
    }
    if let Some(m) = alloc {
        all.insert(m.bin());
    }
    ensure_bins(all)
}
