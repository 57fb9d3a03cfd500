//! Plugin discovery: cache first, then a scan in this process or in the
//! helper, with the blacklist guarding against modules that crash.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache::CacheStore;
use crate::config::{BridgeConfig, ScanMode};
use crate::error::Result;
use crate::module::{DlLoader, ModuleLoader};

use super::external::{ExternalScanner, ScanCancel};
use super::record::ScanRecord;
use super::scanner::{Scanner, visible_records};

/// File extensions treated as plugin modules.
const PLUGIN_EXTENSIONS: &[&str] = &["so", "dll"];

/// Directory recursion limit, as a guard against symlink loops.
const MAX_DEPTH: usize = 16;

pub fn is_plugin_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| PLUGIN_EXTENSIONS.iter().any(|p| e.eq_ignore_ascii_case(p)))
}

pub struct Discovery {
    config: BridgeConfig,
    cache: CacheStore,
    scanner: Scanner,
    external: Option<ExternalScanner>,
    cancel: ScanCancel,
}

impl Discovery {
    pub fn new(config: BridgeConfig, cache: CacheStore, loader: Arc<dyn ModuleLoader>) -> Self {
        let external = config
            .resolved_scanner_program()
            .map(|program| ExternalScanner::new(program, config.scan_timeout_ds));
        Self {
            config,
            cache,
            scanner: Scanner::new(loader),
            external,
            cancel: ScanCancel::new(),
        }
    }

    /// Discovery backed by `dlopen` and the configured cache directory.
    pub fn from_config(config: BridgeConfig) -> Result<Self> {
        let cache = CacheStore::from_config(&config)?;
        let loader = Arc::new(DlLoader::from_config(&config));
        Ok(Self::new(config, cache, loader))
    }

    pub fn with_external_scanner(mut self, scanner: Option<ExternalScanner>) -> Self {
        self.external = scanner;
        self
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Token that aborts running external scans when cancelled.
    pub fn cancel_token(&self) -> ScanCancel {
        self.cancel.clone()
    }

    /// Records for one module using the configured scan mode.
    pub fn get_info(&self, path: &Path) -> Vec<ScanRecord> {
        self.get_info_with(path, self.config.scan_mode)
    }

    pub fn get_info_with(&self, path: &Path, mode: ScanMode) -> Vec<ScanRecord> {
        if !is_plugin_file(path) {
            log::debug!("scan: skipping {} (not a plugin module)", path.display());
            return Vec::new();
        }
        if self.cache.is_blacklisted(path) {
            log::debug!("scan: skipping blacklisted {}", path.display());
            return Vec::new();
        }
        if let Some(entry) = self.cache.lookup(path) {
            return visible_records(&entry.records);
        }

        match mode {
            ScanMode::CacheOnly => Vec::new(),
            ScanMode::InProcess => self.scan_in_process(path).unwrap_or_else(|e| {
                log::warn!("scan: {}", e);
                Vec::new()
            }),
            ScanMode::External => match &self.external {
                Some(external) => self.scan_external(external, path),
                None => {
                    log::warn!("scan: no scanner helper found, scanning {} in process", path.display());
                    self.scan_in_process(path).unwrap_or_else(|e| {
                        log::warn!("scan: {}", e);
                        Vec::new()
                    })
                }
            },
        }
    }

    /// Scan in this process.  The module is blacklisted for the duration so
    /// a crash leaves it marked; success clears the mark and caches the
    /// result.
    pub fn scan_in_process(&self, path: &Path) -> Result<Vec<ScanRecord>> {
        self.cache.blacklist(path)?;
        let report = self.scanner.scan_detailed(path)?;
        self.cache.unblacklist(path)?;

        let records = report.into_records();
        self.cache.store(path, &records)?;
        Ok(visible_records(&records))
    }

    fn scan_external(&self, external: &ExternalScanner, path: &Path) -> Vec<ScanRecord> {
        match external.run(path, &self.cache, &self.cancel) {
            Ok(true) => {}
            Ok(false) => log::warn!("scan: helper failed for {}", path.display()),
            Err(e) => {
                log::warn!("scan: {}", e);
                return Vec::new();
            }
        }
        if self.cache.is_blacklisted(path) {
            return Vec::new();
        }
        self.cache
            .lookup(path)
            .map(|entry| visible_records(&entry.records))
            .unwrap_or_default()
    }

    /// Forget everything known about `path` and scan it again, even if it
    /// is blacklisted.
    pub fn rescan(&self, path: &Path) -> Result<Vec<ScanRecord>> {
        self.cache.unblacklist(path)?;
        self.cache.remove(path)?;
        Ok(self.get_info(path))
    }

    /// Every plugin module under the configured directories.
    pub fn plugin_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        for dir in &self.config.plugin_dirs {
            if !dir.is_dir() {
                continue;
            }
            log::info!("scan: searching {}", dir.display());
            collect_plugin_files(dir, 0, &mut files);
        }
        files.sort();
        files.dedup();
        files
    }

    /// Records for every module under the configured directories, sorted
    /// by plugin name.
    pub fn discover(&self) -> Vec<(PathBuf, ScanRecord)> {
        let mut found = Vec::new();
        for path in self.plugin_files() {
            if self.cancel.is_cancelled() {
                log::info!("scan: discovery cancelled");
                break;
            }
            for record in self.get_info(&path) {
                found.push((path.clone(), record));
            }
        }
        found.sort_by(|a, b| a.1.name.to_lowercase().cmp(&b.1.name.to_lowercase()));
        log::info!("scan: found {} plugins total", found.len());
        found
    }
}

fn collect_plugin_files(dir: &Path, depth: usize, files: &mut Vec<PathBuf>) {
    if depth > MAX_DEPTH {
        return;
    }
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            log::debug!("scan: cannot read {}: {}", dir.display(), e);
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_plugin_files(&path, depth + 1, files);
        } else if is_plugin_file(&path) {
            files.push(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::StaticLoader;

    #[test]
    fn plugin_extensions() {
        assert!(is_plugin_file(Path::new("/x/Reverb.so")));
        assert!(is_plugin_file(Path::new("/x/Reverb.DLL")));
        assert!(!is_plugin_file(Path::new("/x/readme.txt")));
        assert!(!is_plugin_file(Path::new("/x/noext")));
    }

    #[test]
    fn walks_nested_directories() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("vendor").join("bundle");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(dir.path().join("a.so"), b"").unwrap();
        std::fs::write(nested.join("b.so"), b"").unwrap();
        std::fs::write(nested.join("notes.txt"), b"").unwrap();

        let config = BridgeConfig {
            plugin_dirs: vec![dir.path().to_path_buf(), dir.path().join("missing")],
            ..BridgeConfig::default()
        };
        let cache = CacheStore::open(dir.path().join("cache")).unwrap();
        let discovery = Discovery::new(config, cache, Arc::new(StaticLoader::new()));
        assert_eq!(
            discovery.plugin_files(),
            vec![dir.path().join("a.so"), nested.join("b.so")]
        );
    }

    #[test]
    fn cache_only_never_scans() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = dir.path().join("a.so");
        std::fs::write(&plugin, b"").unwrap();
        let loader = Arc::new(StaticLoader::new());
        let cache = CacheStore::open(dir.path().join("cache")).unwrap();
        let discovery = Discovery::new(BridgeConfig::default(), cache, loader.clone());

        assert!(discovery.get_info_with(&plugin, ScanMode::CacheOnly).is_empty());
        assert_eq!(loader.load_count(), 0);
    }

    #[test]
    fn failed_scan_stays_blacklisted() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = dir.path().join("broken.so");
        std::fs::write(&plugin, b"").unwrap();
        let cache = CacheStore::open(dir.path().join("cache")).unwrap();
        let discovery = Discovery::new(BridgeConfig::default(), cache, Arc::new(StaticLoader::new()));

        assert!(discovery.get_info_with(&plugin, ScanMode::InProcess).is_empty());
        assert!(discovery.cache().is_blacklisted(&plugin));
    }
}
