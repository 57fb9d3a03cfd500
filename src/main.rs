//! fxbridge - discover and inspect VST 2.x plugin modules.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};

use fxbridge::scan::{Discovery, ExternalScanner};
use fxbridge::{BridgeConfig, CacheStore, ScanMode};

#[derive(Parser, Debug)]
#[command(name = "fxbridge", version, about)]
struct Args {
    /// Config file (defaults to the user config dir)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Scan in this process instead of through the helper
    #[arg(long, global = true)]
    in_process: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan plugin modules, or every configured plugin directory
    Scan {
        paths: Vec<PathBuf>,
        /// Ignore the cache and the blacklist
        #[arg(long)]
        force: bool,
    },
    /// Print the records for one module as JSON
    Info {
        path: PathBuf,
        #[arg(long)]
        force: bool,
    },
    /// Inspect or edit the scan blacklist
    Blacklist {
        #[command(subcommand)]
        action: BlacklistAction,
    },
    /// Manage the metadata cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand, Debug)]
enum BlacklistAction {
    List,
    Clear,
    Remove { path: PathBuf },
}

#[derive(Subcommand, Debug)]
enum CacheAction {
    Clear,
}

fn load_config(path: Option<&Path>) -> anyhow::Result<(BridgeConfig, Option<PathBuf>)> {
    match path {
        Some(path) => {
            let config = BridgeConfig::load_from(path)
                .with_context(|| format!("loading config {}", path.display()))?;
            Ok((config, Some(path.to_path_buf())))
        }
        None => Ok((
            BridgeConfig::load(),
            BridgeConfig::default_path().filter(|p| p.exists()),
        )),
    }
}

fn discovery(config: BridgeConfig, config_path: Option<PathBuf>) -> anyhow::Result<Discovery> {
    let external = config.resolved_scanner_program().map(|program| {
        let scanner = ExternalScanner::new(program, config.scan_timeout_ds);
        match config_path {
            Some(path) => scanner.with_config(path),
            None => scanner,
        }
    });
    Ok(Discovery::from_config(config)?.with_external_scanner(external))
}

fn scan(discovery: &Discovery, paths: &[PathBuf], force: bool) -> anyhow::Result<()> {
    let found = if paths.is_empty() {
        if force {
            discovery.cache().clear_blacklist()?;
            discovery.cache().clear()?;
        }
        discovery.discover()
    } else {
        let mut found = Vec::new();
        for path in paths {
            let records = if force {
                discovery.rescan(path)?
            } else {
                discovery.get_info(path)
            };
            if records.is_empty() {
                log::warn!("{}: no plugins found", path.display());
            }
            found.extend(records.into_iter().map(|r| (path.clone(), r)));
        }
        found
    };

    for (path, record) in &found {
        println!(
            "{:<32} {:<20} {:<11} {:>#10x}  {}",
            record.name,
            record.vendor,
            record.category,
            record.unique_id,
            path.display()
        );
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let (mut config, config_path) = load_config(args.config.as_deref())?;
    if args.in_process {
        config.scan_mode = ScanMode::InProcess;
    }

    match args.command {
        Command::Scan { paths, force } => {
            let discovery = discovery(config, config_path)?;
            scan(&discovery, &paths, force)?;
        }
        Command::Info { path, force } => {
            let discovery = discovery(config, config_path)?;
            let records = if force {
                discovery.rescan(&path)?
            } else {
                discovery.get_info(&path)
            };
            if records.is_empty() {
                anyhow::bail!("{}: no plugins found", path.display());
            }
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        Command::Blacklist { action } => {
            let cache = CacheStore::from_config(&config)?;
            match action {
                BlacklistAction::List => {
                    for path in cache.blacklisted()? {
                        println!("{}", path.display());
                    }
                }
                BlacklistAction::Clear => cache.clear_blacklist()?,
                BlacklistAction::Remove { path } => cache.unblacklist(&path)?,
            }
        }
        Command::Cache {
            action: CacheAction::Clear,
        } => {
            let cache = CacheStore::from_config(&config)?;
            let removed = cache.clear()?;
            log::info!("cache: removed {} files from {}", removed, cache.dir().display());
        }
    }
    Ok(())
}
