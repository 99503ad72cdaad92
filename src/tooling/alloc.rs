use std::path::Path;

use crate::utils::process::{CmdSpec, StdioSpec};

pub const FALLOCATE_BIN: &str = "fallocate";
pub const DD_BIN: &str = "dd";

/// Block size used when zero-filling a backing file.
pub const DD_BLOCK_MB: u64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocMethod {
    /// `fallocate`, fast but only supported by some filesystems.
    Fallocate,
    /// `dd` from `/dev/zero`, works everywhere.
    ZeroFill,
}

impl AllocMethod {
    pub fn from_flag(use_fallocate: bool) -> Self {
        if use_fallocate {
            AllocMethod::Fallocate
        } else {
            AllocMethod::ZeroFill
        }
    }

    pub fn bin(self) -> &'static str {
        match self {
            AllocMethod::Fallocate => FALLOCATE_BIN,
            AllocMethod::ZeroFill => DD_BIN,
        }
    }

    pub fn command(self, target: &Path, size_mb: u64) -> CmdSpec {
        let cmd = match self {
            AllocMethod::Fallocate => CmdSpec::new(FALLOCATE_BIN)
                .args(["-l", &format!("{size_mb}M")])
                .arg(target.display().to_string()),
            AllocMethod::ZeroFill => CmdSpec::new(DD_BIN).args([
                "if=/dev/zero".to_string(),
                format!("of={}", target.display()),
                format!("bs={DD_BLOCK_MB}M"),
                format!("count={}", dd_blocks(size_mb)),
            ]),
        };
        cmd.stdout(StdioSpec::Null).stderr(StdioSpec::Inherit)
    }
}

#[inline]
pub fn dd_blocks(size_mb: u64) -> u64 {
    size_mb.div_ceil(DD_BLOCK_MB)
}
