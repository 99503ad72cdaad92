//! Provisioning and teardown of a read-only, mounted LVM snapshot, optionally
//! backed by a temporary loop device when the volume group has no room left.

use std::{
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    error::{Result, config_error},
    utils::naming::{lv_fq, mapper_path},
};

pub mod lifecycle;
pub mod mounter;
pub mod probe;
pub mod provisioner;
pub mod snapper;

pub use lifecycle::Lifecycle;

/// A logical volume addressed by VG and LV name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LvRef {
    pub vg: String,
    pub lv: String,
}

impl LvRef {
    pub fn new(vg: impl Into<String>, lv: impl Into<String>) -> Self {
        Self {
            vg: vg.into(),
            lv: lv.into(),
        }
    }

    pub fn device(&self) -> PathBuf {
        mapper_path(&self.vg, &self.lv)
    }

    pub fn fq(&self) -> String {
        lv_fq(&self.vg, &self.lv)
    }
}

impl fmt::Display for LvRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fq())
    }
}

/// Temporary file exposed through a loop device and added to the VG as an
/// extra PV for the lifetime of the snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopBacking {
    pub file: PathBuf,
    pub loop_device: PathBuf,
}

impl LoopBacking {
    /// The backing file and the loop device only make sense together.
    pub fn pair(file: Option<PathBuf>, loop_device: Option<PathBuf>) -> Result<Option<Self>> {
        match (file, loop_device) {
            (Some(file), Some(loop_device)) => Ok(Some(Self { file, loop_device })),
            (None, None) => Ok(None),
            _ => config_error!("backing file and loop device must always be configured together"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotPlan {
    pub vg: String,
    pub lv: String,
    pub name: String,
    /// Copy-on-write space in MB; the snapshot is dropped by LVM once the
    /// source has diverged by more than this.
    pub size_mb: u64,
    pub mountpoint: PathBuf,
    pub backing: Option<LoopBacking>,
}

impl SnapshotPlan {
    pub fn source(&self) -> LvRef {
        LvRef::new(&self.vg, &self.lv)
    }

    pub fn snapshot(&self) -> LvRef {
        LvRef::new(&self.vg, &self.name)
    }

    pub fn validate(&self) -> Result<()> {
        let names = [
            ("volume group", &self.vg),
            ("logical volume", &self.lv),
            ("snapshot", &self.name),
        ];
        for (what, v) in names {
            if v.trim().is_empty() {
                config_error!("{what} name must not be empty");
            }
        }
        if self.name == self.lv {
            config_error!(
                "snapshot name must differ from the source volume name '{}'",
                self.lv
            );
        }
        if self.size_mb == 0 {
            config_error!("snapshot size must be greater than 0 MB");
        }
        require_absolute("mountpoint", &self.mountpoint)?;
        if let Some(b) = &self.backing {
            require_absolute("backing file", &b.file)?;
            require_absolute("loop device", &b.loop_device)?;
        }
        Ok(())
    }
}

fn require_absolute(what: &str, p: &Path) -> Result<()> {
    if !p.is_absolute() {
        config_error!("{what} must be an absolute path, got '{}'", p.display());
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Mount,
    Unmount,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Mount => "snapshot-mount",
            Action::Unmount => "snapshot-unmount",
        })
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    pub action: Action,
    pub plan: SnapshotPlan,
    pub use_fallocate: bool,
    pub remove_mountpoint: bool,
}

impl Request {
    pub fn validate(&self) -> Result<()> {
        match self.action {
            Action::Mount if self.remove_mountpoint => {
                config_error!("--remove-mountpoint is not applicable to {}", self.action)
            }
            Action::Unmount if self.use_fallocate => {
                config_error!("--use-fallocate is not applicable to {}", self.action)
            }
            _ => {}
        }
        self.plan.validate()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Limit for routine commands.
    pub command: Duration,
    /// Multiplier applied to `command` for the backing-file allocation.
    pub allocate_factor: u32,
}

impl Timeouts {
    pub fn allocate(&self) -> Duration {
        self.command.saturating_mul(self.allocate_factor)
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            command: Duration::from_secs(60),
            allocate_factor: 15,
        }
    }
}
