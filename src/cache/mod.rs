//! Cache store: scan results, the blacklist and scanner error logs.
//!
//! One info file per module path, named by a hash of the path (not the
//! binary) plus the target architecture.  An info file is only trusted while
//! it is at least as new as the module it describes.

pub mod info_file;

use std::ffi::OsStr;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use sha2::{Digest, Sha256};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::scan::ScanRecord;

const INFO_EXT: &str = "fsi";
const ERROR_LOG_EXT: &str = "err";
const BLACKLIST_FILE: &str = "blacklist.txt";

/// A validated cache hit.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub path: PathBuf,
    pub records: Vec<ScanRecord>,
    pub modified: SystemTime,
}

/// `sha256(path)` truncated to 32 hex digits, plus the target architecture.
pub fn cache_key(plugin: &Path) -> String {
    let hex = format!("{:x}", Sha256::digest(plugin.as_os_str().as_bytes()));
    format!("{}-{}", &hex[..32], std::env::consts::ARCH)
}

#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    /// Use `dir`, creating it if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn from_config(config: &BridgeConfig) -> Result<Self> {
        Self::open(config.resolved_cache_dir())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn info_path(&self, plugin: &Path) -> PathBuf {
        self.dir.join(format!("{}.{}", cache_key(plugin), INFO_EXT))
    }

    pub fn error_log_path(&self, plugin: &Path) -> PathBuf {
        self.dir.join(format!("{}.{}", cache_key(plugin), ERROR_LOG_EXT))
    }

    fn blacklist_path(&self) -> PathBuf {
        self.dir.join(BLACKLIST_FILE)
    }

    // ---- scan records ----------------------------------------------------

    /// Cached records for `plugin`, if present and still fresh.  A corrupt
    /// file counts as a miss.
    pub fn lookup(&self, plugin: &Path) -> Option<CacheEntry> {
        match self.lookup_entry(plugin) {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("scan: {}", e);
                None
            }
        }
    }

    /// Like [`lookup`](Self::lookup) but reports corrupt files.
    pub fn lookup_entry(&self, plugin: &Path) -> Result<Option<CacheEntry>> {
        let info = self.info_path(plugin);
        let Ok(info_meta) = fs::metadata(&info) else {
            return Ok(None);
        };
        let Ok(plugin_meta) = fs::metadata(plugin) else {
            log::debug!("scan: {} no longer exists", plugin.display());
            return Ok(None);
        };

        let cached_at = info_meta.modified()?;
        let built_at = plugin_meta.modified()?;
        if cached_at < built_at {
            log::debug!("scan: cache for {} is stale", plugin.display());
            return Ok(None);
        }

        let text = fs::read_to_string(&info).map_err(|e| BridgeError::corrupt(&info, e.to_string()))?;
        let records = info_file::parse(&text, plugin).map_err(|reason| BridgeError::corrupt(&info, reason))?;
        Ok(Some(CacheEntry {
            path: plugin.to_path_buf(),
            records,
            modified: cached_at,
        }))
    }

    pub fn store(&self, plugin: &Path, records: &[ScanRecord]) -> Result<()> {
        let info = self.info_path(plugin);
        fs::write(&info, info_file::render(plugin, records))?;
        log::debug!("scan: cached {} record(s) for {}", records.len(), plugin.display());
        Ok(())
    }

    /// Forget the cached records for `plugin`.
    pub fn remove(&self, plugin: &Path) -> Result<()> {
        match fs::remove_file(self.info_path(plugin)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete every info file and error log.  Returns how many were removed.
    pub fn clear(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let ours = path
                .extension()
                .is_some_and(|ext| ext == INFO_EXT || ext == ERROR_LOG_EXT);
            if ours {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Truncate and open the scanner error log for `plugin`.
    pub fn create_error_log(&self, plugin: &Path) -> Result<File> {
        Ok(File::create(self.error_log_path(plugin))?)
    }

    // ---- blacklist -------------------------------------------------------

    /// Blacklisted module paths, in the order they were added.  Entries are
    /// raw path bytes, one per line.
    pub fn blacklisted(&self) -> Result<Vec<PathBuf>> {
        match fs::read(self.blacklist_path()) {
            Ok(bytes) => Ok(bytes
                .split(|&b| b == b'\n')
                .filter(|line| !line.is_empty())
                .map(|line| PathBuf::from(OsStr::from_bytes(line)))
                .collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn is_blacklisted(&self, plugin: &Path) -> bool {
        let plugin = blacklist_form(plugin);
        match self.blacklisted() {
            Ok(list) => list.iter().any(|p| *p == plugin),
            Err(e) => {
                log::warn!("scan: cannot read blacklist: {}", e);
                false
            }
        }
    }

    /// Append `plugin` to the blacklist.
    pub fn blacklist(&self, plugin: &Path) -> Result<()> {
        if self.is_blacklisted(plugin) {
            return Ok(());
        }
        let mut line = blacklist_form(plugin).as_os_str().as_bytes().to_vec();
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.blacklist_path())?;
        file.write_all(&line)?;
        Ok(())
    }

    /// Drop `plugin` from the blacklist; the file is rewritten in full.
    pub fn unblacklist(&self, plugin: &Path) -> Result<()> {
        let plugin = blacklist_form(plugin);
        let list = self.blacklisted()?;
        if !list.contains(&plugin) {
            return Ok(());
        }
        let mut bytes = Vec::new();
        for path in list.iter().filter(|p| **p != plugin) {
            bytes.extend_from_slice(path.as_os_str().as_bytes());
            bytes.push(b'\n');
        }
        fs::write(self.blacklist_path(), bytes)?;
        Ok(())
    }

    pub fn clear_blacklist(&self) -> Result<()> {
        match fs::remove_file(self.blacklist_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Blacklist entries are compared in canonical form, so `./x.so` and
/// `/dir/sub/../x.so` name the same module.  A module that no longer exists
/// falls back to its absolute path.
fn blacklist_form(plugin: &Path) -> PathBuf {
    fs::canonicalize(plugin)
        .or_else(|_| std::path::absolute(plugin))
        .unwrap_or_else(|_| plugin.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::PluginCategory;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn record() -> ScanRecord {
        ScanRecord {
            name: "Gain".into(),
            vendor: "Unknown".into(),
            category: PluginCategory::Effect,
            inputs: 1,
            outputs: 1,
            ..ScanRecord::default()
        }
    }

    #[test]
    fn key_depends_on_path_and_arch() {
        let a = cache_key(Path::new("/plugins/a.so"));
        let b = cache_key(Path::new("/plugins/b.so"));
        assert_ne!(a, b);
        assert_eq!(a, cache_key(Path::new("/plugins/a.so")));
        assert!(a.ends_with(std::env::consts::ARCH));
        assert_eq!(a.split('-').next().map(str::len), Some(32));
    }

    #[test]
    fn store_then_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = dir.path().join("gain.so");
        fs::write(&plugin, b"binary").unwrap();
        let cache = CacheStore::open(dir.path().join("cache")).unwrap();

        assert!(cache.lookup(&plugin).is_none());
        cache.store(&plugin, &[record()]).unwrap();
        let entry = cache.lookup(&plugin).unwrap();
        assert_eq!(entry.records, vec![record()]);
    }

    #[test]
    fn newer_plugin_invalidates_entry() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = dir.path().join("gain.so");
        fs::write(&plugin, b"binary").unwrap();
        let cache = CacheStore::open(dir.path()).unwrap();
        cache.store(&plugin, &[record()]).unwrap();

        let info_time = fs::metadata(cache.info_path(&plugin)).unwrap().modified().unwrap();
        File::options()
            .write(true)
            .open(&plugin)
            .unwrap()
            .set_modified(info_time + Duration::from_secs(10))
            .unwrap();
        assert!(cache.lookup(&plugin).is_none());
    }

    #[test]
    fn corrupt_file_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = dir.path().join("gain.so");
        fs::write(&plugin, b"binary").unwrap();
        let cache = CacheStore::open(dir.path()).unwrap();
        fs::write(cache.info_path(&plugin), "garbage\n").unwrap();

        assert!(matches!(
            cache.lookup_entry(&plugin),
            Err(BridgeError::CacheCorrupt { .. })
        ));
        assert!(cache.lookup(&plugin).is_none());
    }

    #[test]
    fn blacklist_add_remove() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::open(dir.path()).unwrap();
        let a = Path::new("/plugins/a.so");
        let b = Path::new("/plugins/b.so");

        cache.blacklist(a).unwrap();
        cache.blacklist(b).unwrap();
        cache.blacklist(a).unwrap();
        assert_eq!(cache.blacklisted().unwrap(), vec![a.to_path_buf(), b.to_path_buf()]);

        cache.unblacklist(a).unwrap();
        assert!(!cache.is_blacklisted(a));
        assert!(cache.is_blacklisted(b));

        cache.clear_blacklist().unwrap();
        assert!(cache.blacklisted().unwrap().is_empty());
    }

    #[test]
    fn blacklist_keeps_non_utf8_paths() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::open(dir.path()).unwrap();
        let crashy = Path::new("/plugins/crashy.so");
        let latin1 = Path::new(OsStr::from_bytes(b"/plugins/caf\xe9/broken.so"));

        cache.blacklist(crashy).unwrap();
        cache.blacklist(latin1).unwrap();
        cache.blacklist(latin1).unwrap();
        assert!(cache.is_blacklisted(crashy));
        assert!(cache.is_blacklisted(latin1));
        assert_eq!(cache.blacklisted().unwrap().len(), 2);

        cache.unblacklist(crashy).unwrap();
        assert!(!cache.is_blacklisted(crashy));
        assert_eq!(cache.blacklisted().unwrap(), vec![latin1.to_path_buf()]);
        assert_eq!(
            fs::read(dir.path().join(BLACKLIST_FILE)).unwrap(),
            b"/plugins/caf\xe9/broken.so\n".to_vec()
        );
    }

    #[test]
    fn blacklist_matches_relative_spellings() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::open(dir.path().join("cache")).unwrap();
        let plugins = dir.path().join("plugins");
        fs::create_dir_all(plugins.join("sub")).unwrap();
        let plugin = plugins.join("x.so");
        fs::write(&plugin, b"binary").unwrap();

        cache.blacklist(&plugins.join("sub/../x.so")).unwrap();
        assert!(cache.is_blacklisted(&plugin));
        assert!(cache.is_blacklisted(&plugins.join("./x.so")));
        cache.blacklist(&plugin).unwrap();
        assert_eq!(cache.blacklisted().unwrap().len(), 1);

        cache.unblacklist(&plugins.join("sub/./../x.so")).unwrap();
        assert!(!cache.is_blacklisted(&plugin));
        assert!(cache.blacklisted().unwrap().is_empty());
    }

    #[test]
    fn clear_removes_only_cache_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::open(dir.path()).unwrap();
        let plugin = Path::new("/plugins/a.so");
        cache.store(plugin, &[record()]).unwrap();
        cache.create_error_log(plugin).unwrap();
        cache.blacklist(plugin).unwrap();

        assert_eq!(cache.clear().unwrap(), 2);
        assert!(cache.is_blacklisted(plugin));
    }
}
