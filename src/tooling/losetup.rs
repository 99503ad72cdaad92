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

pub const REQ_BINS: &[&str] = &["losetup"];

// /dev/loop5: [0052]:8651046 (/media/raw/1.tmp)
static LOSETUP_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<dev>[^:\s]+):\s.*?\((?P<file>.*)\)\s*$").expect("static regex")
});

pub trait LoopPort: Send + Sync {
    /// Loop device -> backing file of every attached loop device.
    fn list(&self) -> Result<BTreeMap<PathBuf, PathBuf>>;
    fn attach(&self, dev: &Path, file: &Path) -> Result<()>;
    fn detach(&self, dev: &Path) -> Result<()>;
}

type DynRunner = dyn Runner + Send + Sync;

pub struct LosetupCli {
    runner: Arc<DynRunner>,
}

impl LosetupCli {
    pub fn new(runner: Arc<DynRunner>) -> Self {
        Self { runner }
    }

    #[inline]
    fn losetup(&self) -> CmdSpec {
        CmdSpec::new("losetup")
    }
}

impl LoopPort for LosetupCli {
    fn list(&self) -> Result<BTreeMap<PathBuf, PathBuf>> {
        let cmd = self
            .losetup()
            .arg("-a")
            .stdout(StdioSpec::Pipe)
            .stderr(StdioSpec::Inherit);
        let out = self.runner.run_capture(&cmd)?;
        parse_losetup(&out)
    }

    fn attach(&self, dev: &Path, file: &Path) -> Result<()> {
        let cmd = self
            .losetup()
            .arg(dev.display().to_string())
            .arg(file.display().to_string());
        self.runner.run(&cmd)
    }

    fn detach(&self, dev: &Path) -> Result<()> {
        let cmd = self.losetup().arg("-d").arg(dev.display().to_string());
        self.runner.run(&cmd)
    }
}

pub fn parse_losetup(out: &str) -> Result<BTreeMap<PathBuf, PathBuf>> {
    let mut loops = BTreeMap::new();
    for line in out.lines().filter(|l| !l.trim().is_empty()) {
        let caps = LOSETUP_LINE
            .captures(line.trim())
            .ok_or_else(|| Error::parse("losetup", line))?;
        loops.insert(PathBuf::from(&caps["dev"]), PathBuf::from(&caps["file"]));
    }
    Ok(loops)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::ErrorKind, testing::FakeRunner};

    #[test]
    fn parse_typical_output() {
        let out = "/dev/loop5: [0052]:8651046 (/media/raw/1.tmp)\n\
                   /dev/loop0: [64769]:131 (/var/lib/snapd/snaps/core_1.snap)\n";
        let loops = parse_losetup(out).unwrap();
        assert_eq!(loops.len(), 2);
        assert_eq!(loops[Path::new("/dev/loop5")], Path::new("/media/raw/1.tmp"));
        assert_eq!(
            loops[Path::new("/dev/loop0")],
            Path::new("/var/lib/snapd/snaps/core_1.snap")
        );
    }

    #[test]
    fn parse_backing_file_with_spaces_and_parens() {
        let out = "/dev/loop7: [2049]:12 (/media/raw dir/snap (1).tmp)\n";
        let loops = parse_losetup(out).unwrap();
        assert_eq!(
            loops[Path::new("/dev/loop7")],
            Path::new("/media/raw dir/snap (1).tmp")
        );
    }

    #[test]
    fn parse_empty_output() {
        assert!(parse_losetup("\n").unwrap().is_empty());
    }

    #[test]
    fn parse_garbage_fails() {
        let err = parse_losetup("loop devices: none\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ParseFailure);
    }

    #[test]
    fn attach_and_detach_commands() {
        let runner = Arc::new(FakeRunner::new());
        let lo = LosetupCli::new(runner.clone());
        lo.attach(Path::new("/dev/loop7"), Path::new("/media/raw/snap.tmp"))
            .unwrap();
        lo.detach(Path::new("/dev/loop7")).unwrap();
        assert_eq!(
            runner.calls(),
            vec!["losetup /dev/loop7 /media/raw/snap.tmp", "losetup -d /dev/loop7"]
        );
    }
}
