use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{Arc, LazyLock},
};

use regex::Regex;

use crate::{
    error::{Error, Result},
    utils::process::{CmdSpec, Runner, StdioSpec},
};

pub const REQ_BINS: &[&str] = &["findmnt", "blkid", "mount", "umount"];

static FINDMNT_PAIR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"([A-Z0-9_%:-]+)="([^"]*)""#).expect("static regex"));

pub trait MountPort: Send + Sync {
    /// Mountpoint -> source device of every entry in the mount table.
    fn list_mounts(&self) -> Result<BTreeMap<PathBuf, PathBuf>>;
    /// Filesystem type reported by `blkid`.
    fn fs_type(&self, dev: &Path) -> Result<String>;
    fn mount(&self, dev: &Path, target: &Path, options: &[&str]) -> Result<()>;
    fn umount(&self, dev: &Path) -> Result<()>;
}

type DynRunner = dyn Runner + Send + Sync;

pub struct MountCli {
    runner: Arc<DynRunner>,
}

impl MountCli {
    pub fn new(runner: Arc<DynRunner>) -> Self {
        Self { runner }
    }
}

impl MountPort for MountCli {
    fn list_mounts(&self) -> Result<BTreeMap<PathBuf, PathBuf>> {
        let cmd = CmdSpec::new("findmnt")
            .arg("-P")
            .stdout(StdioSpec::Pipe)
            .stderr(StdioSpec::Inherit);
        let out = self.runner.run_capture(&cmd)?;
        parse_findmnt(&out)
    }

    fn fs_type(&self, dev: &Path) -> Result<String> {
        let cmd = CmdSpec::new("blkid")
            .arg(dev.display().to_string())
            .stdout(StdioSpec::Pipe)
            .stderr(StdioSpec::Inherit);
        let out = self.runner.run_capture(&cmd)?;
        parse_blkid_type(&out)
    }

    fn mount(&self, dev: &Path, target: &Path, options: &[&str]) -> Result<()> {
        let cmd = CmdSpec::new("mount")
            .arg("-o")
            .arg(options.join(","))
            .arg(dev.display().to_string())
            .arg(target.display().to_string());
        self.runner.run(&cmd)
    }

    fn umount(&self, dev: &Path) -> Result<()> {
        self.runner
            .run(&CmdSpec::new("umount").arg(dev.display().to_string()))
    }
}

/// Parses `findmnt -P`:
///
/// ```text
/// TARGET="/" SOURCE="/dev/sda1" FSTYPE="ext4" OPTIONS="rw,noatime"
/// ```
///
/// Every line must carry both `TARGET` and `SOURCE`. Later entries for the
/// same target shadow earlier ones, as over-mounts do.
pub fn parse_findmnt(out: &str) -> Result<BTreeMap<PathBuf, PathBuf>> {
    let mut mounts = BTreeMap::new();
    for line in out.lines().filter(|l| !l.trim().is_empty()) {
        let mut target = None;
        let mut source = None;
        for caps in FINDMNT_PAIR.captures_iter(line) {
            match &caps[1] {
                "TARGET" => target = Some(unescape(&caps[2])),
                "SOURCE" => source = Some(unescape(&caps[2])),
                _ => {}
            }
        }
        match (target, source) {
            (Some(t), Some(s)) if !t.is_empty() && !s.is_empty() => {
                mounts.insert(PathBuf::from(t), PathBuf::from(s));
            }
            _ => return Err(Error::parse("findmnt", line)),
        }
    }
    Ok(mounts)
}

/// Extracts `TYPE` from `blkid <dev>`:
///
/// ```text
/// /dev/vg1/system: UUID="1492fdc0-e025-1111-9f27-23f422f33551" TYPE="ext4"
/// ```
pub fn parse_blkid_type(out: &str) -> Result<String> {
    out.split_whitespace()
        .find_map(|tok| tok.strip_prefix("TYPE=\""))
        .and_then(|rest| rest.strip_suffix('"'))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::parse("blkid", out.trim()))
}

/// findmnt writes unsafe bytes as `\xNN`.
fn unescape(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && bytes.get(i + 1) == Some(&b'x')
            && let Some(b) = s
                .get(i + 2..i + 4)
                .and_then(|h| u8::from_str_radix(h, 16).ok())
        {
            out.push(b);
            i += 4;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
