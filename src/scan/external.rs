//! Out-of-process scanning through the `fxbridge-scan` helper.
//!
//! A crashing plugin takes the helper down instead of the host.  The helper
//! writes the cache and blacklist itself; the host only waits, collects the
//! helper's output into the per-plugin error log and cleans up after a
//! timeout or cancellation.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::cache::CacheStore;
use crate::error::{BridgeError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Shared flag that aborts running external scans.
#[derive(Debug, Clone, Default)]
pub struct ScanCancel(Arc<AtomicBool>);

impl ScanCancel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct ExternalScanner {
    program: PathBuf,
    /// Deciseconds; zero or negative waits forever.
    timeout_ds: i32,
    config: Option<PathBuf>,
}

type LogSink = Arc<Mutex<Option<File>>>;

impl ExternalScanner {
    pub fn new(program: impl Into<PathBuf>, timeout_ds: i32) -> Self {
        Self {
            program: program.into(),
            timeout_ds,
            config: None,
        }
    }

    /// Pass a config file through to the helper.
    pub fn with_config(mut self, config: impl Into<PathBuf>) -> Self {
        self.config = Some(config.into());
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn timeout(&self) -> Option<Duration> {
        (self.timeout_ds > 0).then(|| Duration::from_millis(self.timeout_ds as u64 * 100))
    }

    /// Run the helper for `plugin` and wait for it.
    ///
    /// Returns whether the helper reported success.  On timeout or
    /// cancellation the helper is killed, any info file it left behind is
    /// removed and the plugin is taken off the blacklist so the next run
    /// tries again.
    pub fn run(&self, plugin: &Path, cache: &CacheStore, cancel: &ScanCancel) -> Result<bool> {
        let mut command = Command::new(&self.program);
        command
            .arg(plugin)
            .arg("--cache-dir")
            .arg(cache.dir())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(config) = &self.config {
            command.arg("--config").arg(config);
        }

        log::debug!("scan: running {} {}", self.program.display(), plugin.display());
        let mut child = command.spawn().map_err(|source| BridgeError::ScannerLaunch {
            program: self.program.clone(),
            source,
        })?;

        let sink: LogSink = Arc::new(Mutex::new(match cache.create_error_log(plugin) {
            Ok(file) => Some(file),
            Err(e) => {
                log::error!("scan: cannot create error log for {}: {}", plugin.display(), e);
                None
            }
        }));
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(forward_output(stdout, sink.clone(), plugin.to_path_buf()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(forward_output(stderr, sink.clone(), plugin.to_path_buf()));
        }

        let started = Instant::now();
        let outcome = loop {
            if let Some(status) = child.try_wait()? {
                break Ok(status.success());
            }
            if cancel.is_cancelled() {
                log::info!("scan: cancelled {}", plugin.display());
                break Err(BridgeError::ScanCancelled(plugin.to_path_buf()));
            }
            if self.timeout().is_some_and(|t| started.elapsed() >= t) {
                log::warn!("scan: {} timed out", plugin.display());
                break Err(BridgeError::ScanTimedOut(plugin.to_path_buf()));
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        if outcome.is_err() {
            let _ = child.kill();
            let _ = child.wait();
            if let Err(e) = cache.remove(plugin) {
                log::warn!("scan: cannot remove partial cache for {}: {}", plugin.display(), e);
            }
            if let Err(e) = cache.unblacklist(plugin) {
                log::warn!("scan: cannot update blacklist: {}", e);
            }
        }

        for reader in readers {
            let _ = reader.join();
        }
        outcome
    }
}

fn forward_output<R: Read + Send + 'static>(stream: R, sink: LogSink, plugin: PathBuf) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for line in BufReader::new(stream).lines() {
            let Ok(line) = line else { break };
            let mut file = sink.lock();
            match file.as_mut() {
                Some(f) => {
                    let _ = writeln!(f, "{}", line);
                }
                None => log::error!("scan: {}: {}", plugin.display(), line),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_program_is_a_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::open(dir.path()).unwrap();
        let scanner = ExternalScanner::new(dir.path().join("no-such-helper"), 10);
        let err = scanner
            .run(Path::new("/plugins/a.so"), &cache, &ScanCancel::new())
            .unwrap_err();
        assert!(matches!(err, BridgeError::ScannerLaunch { .. }));
    }

    #[test]
    fn timeout_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::open(dir.path().join("cache")).unwrap();

        // The "plugin" is a script the shell runs in place of the helper.
        let plugin = dir.path().join("slow.so");
        std::fs::write(&plugin, "echo scanning\nexec sleep 5\n").unwrap();
        cache.blacklist(&plugin).unwrap();
        std::fs::write(cache.info_path(&plugin), "partial").unwrap();

        let scanner = ExternalScanner::new("/bin/sh", 2);
        let err = scanner.run(&plugin, &cache, &ScanCancel::new()).unwrap_err();
        assert!(matches!(err, BridgeError::ScanTimedOut(_)));
        assert!(!cache.info_path(&plugin).exists());
        assert!(!cache.is_blacklisted(&plugin));
        let log = std::fs::read_to_string(cache.error_log_path(&plugin)).unwrap();
        assert!(log.contains("scanning"));
    }

    #[test]
    fn cancel_stops_a_running_scan() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::open(dir.path().join("cache")).unwrap();
        let plugin = dir.path().join("stuck.so");
        std::fs::write(&plugin, "exec sleep 5\n").unwrap();
        cache.blacklist(&plugin).unwrap();
        std::fs::write(cache.info_path(&plugin), "partial").unwrap();

        let cancel = ScanCancel::new();
        let canceller = {
            let cancel = cancel.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(200));
                cancel.cancel();
            })
        };

        // No timeout: only the cancel flag can end the wait early.
        let started = Instant::now();
        let scanner = ExternalScanner::new("/bin/sh", 0);
        let err = scanner.run(&plugin, &cache, &cancel).unwrap_err();
        canceller.join().unwrap();

        assert!(matches!(err, BridgeError::ScanCancelled(ref path) if path == &plugin));
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(!cache.info_path(&plugin).exists());
        assert!(!cache.is_blacklisted(&plugin));
    }

    #[test]
    fn cancel_flag() {
        let cancel = ScanCancel::new();
        let shared = cancel.clone();
        shared.cancel();
        assert!(cancel.is_cancelled());
        cancel.reset();
        assert!(!shared.is_cancelled());
    }
}
