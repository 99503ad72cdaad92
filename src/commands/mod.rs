use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Subcommand;
use tracing as log;

use crate::{
    AppCtx,
    error::{self, precondition},
    snapshot::{Action, Lifecycle, Request},
    tooling::{AllocMethod, Toolbox, ensure_bins_for},
    ui,
    utils::{lock::RunLock, process::ProcessRunner},
};

#[derive(Debug, Subcommand)]
pub enum Cmd {
    /// Create the snapshot (and its loop-backed PV, if configured) and mount it read-only
    Mount,
    /// Unmount and remove the snapshot and everything created for it
    Unmount,
    /// Show what currently exists on the host; changes nothing
    Status,
}

impl Cmd {
    pub fn run(&self, ctx: &AppCtx) -> Result<()> {
        match self {
            Cmd::Mount => run_action(ctx, Action::Mount),
            Cmd::Unmount => run_action(ctx, Action::Unmount),
            Cmd::Status => status(ctx),
        }
    }
}

fn toolbox(ctx: &AppCtx) -> Toolbox {
    Toolbox::new(Arc::new(ProcessRunner::new(ctx.cfg.timeouts.command)))
}

fn ensure_root(action: Action) -> error::Result<()> {
    if !nix::unistd::geteuid().is_root() {
        precondition!("{action} must be run as root");
    }
    Ok(())
}

fn run_action(ctx: &AppCtx, action: Action) -> Result<()> {
    let req = Request {
        action,
        plan: ctx.cfg.snapshot.clone(),
        use_fallocate: ctx.use_fallocate,
        remove_mountpoint: ctx.remove_mountpoint,
    };
    req.validate()?;
    ensure_root(action)?;

    let loop_backed = req.plan.backing.is_some();
    let alloc = (action == Action::Mount && loop_backed)
        .then(|| AllocMethod::from_flag(req.use_fallocate));
    ensure_bins_for(loop_backed, alloc)?;
    let _lock = RunLock::for_volume_group(&req.plan.vg)?;

    Lifecycle::new(&toolbox(ctx), ctx.cfg.timeouts)
        .execute(&req)
        .with_context(|| format!("{action} {}", req.plan.snapshot()))?;
    log::info!("[{action}] done");
    Ok(())
}

fn status(ctx: &AppCtx) -> Result<()> {
    let plan = &ctx.cfg.snapshot;
    ensure_bins_for(plan.backing.is_some(), None)?;
    let st = Lifecycle::new(&toolbox(ctx), ctx.cfg.timeouts)
        .status(plan)
        .with_context(|| format!("probe {}", plan.snapshot()))?;
    ui::log_status(&st);
    Ok(())
}
