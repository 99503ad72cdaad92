//! Mount and unmount sequencing, with rollback of a failed mount.
//!
//! Mount walks `Start -> [BackingFileAllocated -> PvAttached] ->
//! SnapshotCreated -> Mounted`; the bracketed stages only run for a
//! loop-backed plan. Unmount always runs the same fixed teardown, and every
//! teardown step re-probes the host first, so teardown doubles as the
//! rollback for a mount that stopped anywhere along the way. Unmount stops
//! at the first failing step; rollback runs every step regardless.

use std::{fmt, sync::Arc};

use tracing as log;

use crate::{
    error::{ErrorKind, Result, precondition},
    snapshot::{
        Action, Request, SnapshotPlan, Timeouts,
        mounter::MountController,
        probe::{SnapshotStatus, SystemStateProbe},
        provisioner::LoopBackedVolumeProvisioner,
        snapper::SnapshotManager,
    },
    tooling::{AllocMethod, Toolbox},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountStage {
    Start,
    BackingFileAllocated,
    PvAttached,
    SnapshotCreated,
    Mounted,
}

impl fmt::Display for MountStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MountStage::Start => "START",
            MountStage::BackingFileAllocated => "BACKING_FILE_ALLOCATED",
            MountStage::PvAttached => "PV_ATTACHED",
            MountStage::SnapshotCreated => "SNAPSHOT_CREATED",
            MountStage::Mounted => "MOUNTED",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    UnmountFs,
    RemoveSnapshotLv,
    ReleasePv,
    DetachLoop,
    RemoveBackingFile,
}

impl TeardownStep {
    const PLAIN: &'static [TeardownStep] = &[TeardownStep::UnmountFs, TeardownStep::RemoveSnapshotLv];
    const LOOP_BACKED: &'static [TeardownStep] = &[
        TeardownStep::UnmountFs,
        TeardownStep::RemoveSnapshotLv,
        TeardownStep::ReleasePv,
        TeardownStep::DetachLoop,
        TeardownStep::RemoveBackingFile,
    ];

    /// Fixed teardown order; the loop steps only when `loop_backed`.
    pub fn sequence(loop_backed: bool) -> &'static [TeardownStep] {
        if loop_backed { Self::LOOP_BACKED } else { Self::PLAIN }
    }
}

impl fmt::Display for TeardownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TeardownStep::UnmountFs => "UNMOUNT_FS",
            TeardownStep::RemoveSnapshotLv => "REMOVE_SNAPSHOT_LV",
            TeardownStep::ReleasePv => "RELEASE_PV",
            TeardownStep::DetachLoop => "DETACH_LOOP",
            TeardownStep::RemoveBackingFile => "REMOVE_BACKING_FILE",
        })
    }
}

pub struct Lifecycle {
    probe: Arc<SystemStateProbe>,
    provisioner: LoopBackedVolumeProvisioner,
    snapper: SnapshotManager,
    mounter: MountController,
}

impl Lifecycle {
    pub fn new(tools: &Toolbox, timeouts: Timeouts) -> Self {
        let probe = Arc::new(SystemStateProbe::new(tools));
        Self {
            provisioner: LoopBackedVolumeProvisioner::new(
                tools,
                probe.clone(),
                timeouts.allocate(),
            ),
            snapper: SnapshotManager::new(tools, probe.clone()),
            mounter: MountController::new(tools, probe.clone()),
            probe,
        }
    }

    /// Validates the request and runs its action.
    pub fn execute(&self, req: &Request) -> Result<()> {
        req.validate()?;
        log::info!("[{}] {}", req.action, req.plan.snapshot());
        match req.action {
            Action::Mount => self.mount(&req.plan, AllocMethod::from_flag(req.use_fallocate)),
            Action::Unmount => self.unmount(&req.plan, req.remove_mountpoint),
        }
    }

    /// Brings the snapshot up to `Mounted`. On failure every resource this
    /// run may have created is torn down again and the original error is
    /// returned.
    pub fn mount(&self, plan: &SnapshotPlan, method: AllocMethod) -> Result<()> {
        let snapshot_dev = plan.snapshot().device();
        if self.probe.device_exists(&snapshot_dev) {
            precondition!("snapshot device {} already exists", snapshot_dev.display());
        }
        let source_dev = plan.source().device();
        if !self.probe.device_exists(&source_dev) {
            precondition!("source device {} does not exist", source_dev.display());
        }
        self.mounter.check_mountpoint(&plan.mountpoint)?;

        let mut stage = MountStage::Start;
        let Err(err) = self.advance(plan, method, &mut stage) else {
            return Ok(());
        };

        let cause = if err.is_timeout() { "timed out" } else { "failed" };
        log::error!("[mount] {cause} at {stage} ({}): {err}; rolling back", err.kind());
        // Before the backing file is allocated, a refused allocation means
        // the file was never ours to remove.
        let owns_backing = plan.backing.is_some()
            && (stage != MountStage::Start || err.kind() != ErrorKind::PreconditionViolation);
        match self.rollback(plan, owns_backing) {
            0 => log::info!("[mount] rollback complete"),
            n => log::warn!("[mount] rollback incomplete: {n} step(s) failed"),
        }
        Err(err)
    }

    fn advance(&self, plan: &SnapshotPlan, method: AllocMethod, stage: &mut MountStage) -> Result<()> {
        let source = plan.source();
        if let Some(b) = &plan.backing {
            self.provisioner
                .allocate(&b.file, plan.size_mb, method, &source)?;
            enter(stage, MountStage::BackingFileAllocated);
            self.provisioner
                .attach(&b.loop_device, &b.file, &plan.vg)?;
            enter(stage, MountStage::PvAttached);
        }
        let snapshot = self.snapper.create(&source, &plan.name, plan.size_mb)?;
        enter(stage, MountStage::SnapshotCreated);
        self.mounter.mount(&snapshot.device(), &plan.mountpoint)?;
        enter(stage, MountStage::Mounted);
        Ok(())
    }

    /// Tears down whatever is left of the snapshot. Safe on a host where it
    /// was never mounted.
    pub fn unmount(&self, plan: &SnapshotPlan, remove_mountpoint: bool) -> Result<()> {
        self.teardown(plan, remove_mountpoint, plan.backing.is_some())
    }

    /// Stops at the first failing step: later steps need the earlier ones
    /// done (a mounted snapshot cannot be removed, a PV in use cannot be
    /// detached).
    fn teardown(&self, plan: &SnapshotPlan, remove_mountpoint: bool, loop_backed: bool) -> Result<()> {
        for &step in TeardownStep::sequence(loop_backed) {
            log::info!("[unmount] {step}");
            self.run_step(step, plan, remove_mountpoint).inspect_err(|e| {
                log::error!("[unmount] {step} failed: {e}");
            })?;
        }
        Ok(())
    }

    /// Runs every step even after a failure; returns how many failed.
    fn rollback(&self, plan: &SnapshotPlan, loop_backed: bool) -> usize {
        let mut failed = 0;
        for &step in TeardownStep::sequence(loop_backed) {
            log::info!("[rollback] {step}");
            if let Err(e) = self.run_step(step, plan, false) {
                log::warn!("[rollback] {step} failed: {e}; continuing");
                failed += 1;
            }
        }
        failed
    }

    fn run_step(&self, step: TeardownStep, plan: &SnapshotPlan, remove_mountpoint: bool) -> Result<()> {
        match (step, &plan.backing) {
            (TeardownStep::UnmountFs, _) => {
                self.mounter
                    .unmount(&plan.snapshot(), &plan.mountpoint, remove_mountpoint)
            }
            (TeardownStep::RemoveSnapshotLv, _) => self.snapper.remove(&plan.vg, &plan.name),
            (TeardownStep::ReleasePv, Some(b)) => {
                self.provisioner
                    .release_pv(&b.loop_device, &b.file, &plan.vg)
            }
            (TeardownStep::DetachLoop, Some(b)) => self.provisioner.detach_loop(&b.loop_device, &b.file),
            (TeardownStep::RemoveBackingFile, Some(b)) => self.provisioner.remove_backing_file(&b.file),
            (_, None) => Ok(()),
        }
    }

    pub fn status(&self, plan: &SnapshotPlan) -> Result<SnapshotStatus> {
        self.probe.status(plan)
    }
}

fn enter(stage: &mut MountStage, next: MountStage) {
    log::info!("[mount] {stage} -> {next}");
    *stage = next;
}
