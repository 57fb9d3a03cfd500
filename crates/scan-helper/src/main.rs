//! fxbridge-scan - scans one plugin module in its own process.
//!
//! Run by the host for each module that is not cached yet.  A crash here
//! leaves the module on the blacklist; success writes its info file.
//! Diagnostics go to stderr, which the host collects into the module's
//! error log.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use fxbridge::scan::Discovery;
use fxbridge::{BridgeConfig, ScanMode};

#[derive(Parser, Debug)]
#[command(name = "fxbridge-scan")]
struct Args {
    /// Plugin module to scan
    plugin: PathBuf,

    /// Cache directory to write the info file into
    #[arg(long, value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    /// Host config file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

fn run(args: Args) -> anyhow::Result<usize> {
    let mut config = match &args.config {
        Some(path) => BridgeConfig::load_from(path)?,
        None => BridgeConfig::load(),
    };
    if args.cache_dir.is_some() {
        config.cache_dir = args.cache_dir;
    }
    config.scan_mode = ScanMode::InProcess;

    let discovery = Discovery::from_config(config)?;
    let records = discovery.scan_in_process(&args.plugin)?;
    for record in &records {
        log::info!("found {} ({:#x})", record.name, record.unique_id);
    }
    Ok(records.len())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let plugin = args.plugin.clone();
    match run(args) {
        Ok(count) => {
            log::debug!("{}: {} plugin(s)", plugin.display(), count);
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("{}: {:#}", plugin.display(), e);
            ExitCode::FAILURE
        }
    }
}
