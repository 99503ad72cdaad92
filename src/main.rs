use anyhow::Result;
use clap::{CommandFactory, Parser};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, fmt};

mod commands;
mod config;
mod error;
mod snapshot;
#[cfg(test)]
mod testing;
mod tooling;
mod ui;
mod utils;

use commands::Cmd;
use config::Config;

pub struct AppCtx {
    pub cfg: Config,
    pub use_fallocate: bool,
    pub remove_mountpoint: bool,
}

#[derive(Parser, Debug)]
#[command(
    name = "lvsnap",
    about = "Read-only LVM snapshot mount/unmount helper with loop-backed spill space",
    arg_required_else_help = false,
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    #[arg(long, default_value = "./config.toml", global = true)]
    config: PathBuf,

    #[arg(long, global = true)]
    debug: bool,

    #[arg(long, global = true)]
    check_config: bool,

    #[arg(long, global = true)]
    print_config: bool,

    /// Allocate the backing file with fallocate instead of zero-filling it (mount only)
    #[arg(long, global = true)]
    use_fallocate: bool,

    /// Remove the mountpoint directory after unmounting (unmount only)
    #[arg(long, global = true)]
    remove_mountpoint: bool,

    #[command(subcommand)]
    command: Option<Cmd>,
}

fn init_tracing(debug: bool) {
    let default = if debug { "trace" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_file(debug)
        .with_line_number(debug)
        .without_time()
        .try_init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    if cli.command.is_none() && !cli.check_config && !cli.print_config {
        let mut cmd = Cli::command();
        cmd.print_help()?;
        println!();
        return Ok(());
    }
    let cfg = Config::load(&cli.config)?;

    if cli.check_config {
        tracing::info!("config OK");
        return Ok(());
    }
    if cli.print_config {
        println!("{}", cfg.to_toml()?);
        return Ok(());
    }

    let Some(cmd) = cli.command else {
        let mut cmd = Cli::command();
        cmd.print_help()?;
        println!();
        return Ok(());
    };

    let ctx = AppCtx {
        cfg,
        use_fallocate: cli.use_fallocate,
        remove_mountpoint: cli.remove_mountpoint,
    };
    cmd.run(&ctx)
}
