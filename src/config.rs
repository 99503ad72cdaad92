use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use config as cfg;
use serde::{Deserialize, Serialize};

use crate::{
    error::{self, config_error},
    snapshot::{LoopBacking, SnapshotPlan, Timeouts},
};

pub const DEFAULT_SIZE_MB: u64 = 4096;

/// Ceiling for the allocation timeout (`command_secs * allocate_factor`),
/// and so for every timeout: one week.
pub const MAX_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub snapshot: SnapshotPlan,
    pub timeouts: Timeouts,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw: RawConfig = cfg::Config::builder()
            .add_source(cfg::File::from(path))
            .build()
            .with_context(|| format!("load {}", path.display()))?
            .try_deserialize()
            .with_context(|| format!("deserialize {}", path.display()))?;

        let n = config_helpers::Normalizer;
        let s = raw.snapshot;
        let required = |v: Option<String>, key: &str| {
            n.trim_opt(v)
                .ok_or_else(|| anyhow!("[snapshot] {key} must be set"))
        };
        let backing = match s.backing {
            Some(b) => LoopBacking::pair(
                n.trim_opt(b.file).map(|p| n.path(&p)),
                n.trim_opt(b.loop_device).map(|p| n.path(&p)),
            )
            .context("[snapshot.backing]")?,
            None => None,
        };
        let snapshot = SnapshotPlan {
            vg: required(s.vg, "vg")?,
            lv: required(s.lv, "lv")?,
            name: required(s.name, "name")?,
            size_mb: s.size_mb.unwrap_or(DEFAULT_SIZE_MB),
            mountpoint: n.path(&required(s.mountpoint, "mountpoint")?),
            backing,
        };
        snapshot
            .validate()
            .with_context(|| format!("[snapshot] in {}", path.display()))?;

        let timeouts = normalize_timeouts(raw.timeouts).context("[timeouts]")?;
        Ok(Self { snapshot, timeouts })
    }

    pub fn to_toml(&self) -> Result<String> {
        #[derive(Serialize)]
        struct BackingOut<'a> {
            file: &'a Path,
            loop_device: &'a Path,
        }
        #[derive(Serialize)]
        struct SnapshotOut<'a> {
            vg: &'a str,
            lv: &'a str,
            name: &'a str,
            size_mb: u64,
            mountpoint: &'a Path,
            #[serde(skip_serializing_if = "Option::is_none")]
            backing: Option<BackingOut<'a>>,
        }
        #[derive(Serialize)]
        struct TimeoutsOut {
            command_secs: u64,
            allocate_factor: u32,
        }
        #[derive(Serialize)]
        struct Out<'a> {
            snapshot: SnapshotOut<'a>,
            timeouts: TimeoutsOut,
        }

        let s = &self.snapshot;
        let out = Out {
            snapshot: SnapshotOut {
                vg: &s.vg,
                lv: &s.lv,
                name: &s.name,
                size_mb: s.size_mb,
                mountpoint: &s.mountpoint,
                backing: s.backing.as_ref().map(|b| BackingOut {
                    file: &b.file,
                    loop_device: &b.loop_device,
                }),
            },
            timeouts: TimeoutsOut {
                command_secs: self.timeouts.command.as_secs(),
                allocate_factor: self.timeouts.allocate_factor,
            },
        };
        Ok(toml::to_string_pretty(&out)?)
    }
}

fn normalize_timeouts(raw: RawTimeouts) -> error::Result<Timeouts> {
    let defaults = Timeouts::default();
    let command_secs = raw.command_secs.unwrap_or(defaults.command.as_secs());
    let allocate_factor = raw.allocate_factor.unwrap_or(defaults.allocate_factor);
    if command_secs == 0 {
        config_error!("command_secs must be greater than 0");
    }
    if allocate_factor == 0 {
        config_error!("allocate_factor must be greater than 0");
    }
    match command_secs.checked_mul(u64::from(allocate_factor)) {
        Some(secs) if secs <= MAX_TIMEOUT_SECS => {}
        _ => config_error!(
            "command_secs ({command_secs}) * allocate_factor ({allocate_factor}) must not exceed {MAX_TIMEOUT_SECS}"
        ),
    }
    Ok(Timeouts {
        command: Duration::from_secs(command_secs),
        allocate_factor,
    })
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    snapshot: RawSnapshot,

    #[serde(default)]
    timeouts: RawTimeouts,
}

#[derive(Debug, Deserialize)]
struct RawSnapshot {
    vg: Option<String>,
    lv: Option<String>,
    name: Option<String>,
    size_mb: Option<u64>,
    mountpoint: Option<String>,
    #[serde(default)]
    backing: Option<RawBacking>,
}

#[derive(Debug, Deserialize)]
struct RawBacking {
    file: Option<String>,
    loop_device: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawTimeouts {
    command_secs: Option<u64>,
    allocate_factor: Option<u32>,
}

mod config_helpers {
    use std::path::PathBuf;

    pub(super) struct Normalizer;

    impl Normalizer {
        #[inline]
        pub fn trim_opt(&self, s: Option<String>) -> Option<String> {
            s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
        }

        /// Lexical cleanup only (`//`, `/./`, trailing `/`). Relative paths
        /// stay relative so validation can reject them.
        #[inline]
        pub fn path(&self, p: &str) -> PathBuf {
            PathBuf::from(p).components().collect()
        }
    }
}
