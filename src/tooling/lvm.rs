use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{
    error::{Error, Result},
    utils::{
        naming::lv_fq,
        process::{CmdSpec, Runner, StdioSpec},
    },
};

pub const REQ_BINS: &[&str] = &[
    "lvcreate", "lvremove", "pvcreate", "pvremove", "vgextend", "vgreduce", "pvs",
];

pub trait LvmPort: Send + Sync {
    /// PV device path -> VG column, exactly as `pvs` reports it.
    fn list_pvs(&self) -> Result<BTreeMap<PathBuf, String>>;
    fn lvcreate_snapshot(&self, vg: &str, lv: &str, snap: &str, size_mb: u64) -> Result<()>;
    fn lvremove_force(&self, vg: &str, lv: &str) -> Result<()>;
    fn pvcreate(&self, dev: &Path) -> Result<()>;
    fn pvremove(&self, dev: &Path) -> Result<()>;
    fn vgextend(&self, vg: &str, dev: &Path) -> Result<()>;
    fn vgreduce(&self, vg: &str, dev: &Path) -> Result<()>;
}

type DynRunner = dyn Runner + Send + Sync;

pub struct LvmCli {
    runner: Arc<DynRunner>,
}

impl LvmCli {
    pub fn new(runner: Arc<DynRunner>) -> Self {
        Self { runner }
    }

    #[inline]
    fn tool(&self, bin: &str) -> CmdSpec {
        CmdSpec::new(bin)
            .stdout(StdioSpec::Inherit)
            .stderr(StdioSpec::Inherit)
    }
}

impl LvmPort for LvmCli {
    fn list_pvs(&self) -> Result<BTreeMap<PathBuf, String>> {
        let cmd = CmdSpec::new("pvs")
            .args(["-o", "pv_name,vg_name", "--noheadings", "--separator", ";"])
            .stdout(StdioSpec::Pipe)
            .stderr(StdioSpec::Inherit);
        let out = self.runner.run_capture(&cmd)?;
        parse_pvs(&out)
    }

    fn lvcreate_snapshot(&self, vg: &str, lv: &str, snap: &str, size_mb: u64) -> Result<()> {
        let cmd = self
            .tool("lvcreate")
            .args(["-s", "-n", snap, "-L", &format!("{size_mb}m")])
            .arg(lv_fq(vg, lv));
        self.runner.run(&cmd)
    }

    fn lvremove_force(&self, vg: &str, lv: &str) -> Result<()> {
        let cmd = self.tool("lvremove").arg("--force").arg(lv_fq(vg, lv));
        self.runner.run(&cmd)
    }

    fn pvcreate(&self, dev: &Path) -> Result<()> {
        let cmd = self.tool("pvcreate").arg(dev.display().to_string());
        self.runner.run(&cmd)
    }

    fn pvremove(&self, dev: &Path) -> Result<()> {
        let cmd = self.tool("pvremove").arg(dev.display().to_string());
        self.runner.run(&cmd)
    }

    fn vgextend(&self, vg: &str, dev: &Path) -> Result<()> {
        let cmd = self.tool("vgextend").arg(vg).arg(dev.display().to_string());
        self.runner.run(&cmd)
    }

    fn vgreduce(&self, vg: &str, dev: &Path) -> Result<()> {
        let cmd = self.tool("vgreduce").arg(vg).arg(dev.display().to_string());
        self.runner.run(&cmd)
    }
}

/// Parses `pvs -o pv_name,vg_name --noheadings --separator ';'`:
///
/// ```text
///   /dev/sda2;main-vg
///   /dev/loop5;main-vg
/// ```
pub fn parse_pvs(out: &str) -> Result<BTreeMap<PathBuf, String>> {
    let mut pvs = BTreeMap::new();
    for line in out.lines().filter(|l| !l.trim().is_empty()) {
        let (pv, vg) = line
            .split_once(';')
            .ok_or_else(|| Error::parse("pvs", line))?;
        let pv = pv.trim();
        if pv.is_empty() {
            return Err(Error::parse("pvs", line));
        }
        pvs.insert(PathBuf::from(pv), vg.trim().to_string());
    }
    Ok(pvs)
}
