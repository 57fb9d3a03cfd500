//! Host-side configuration, persisted as JSON under the user config dir.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// Standard Linux directories where LinuxVST modules are installed.
const PLUGIN_SEARCH_DIRS: &[&str] = &[
    "~/.lxvst",
    "~/.vst",
    "/usr/lib/lxvst",
    "/usr/local/lib/lxvst",
    "/usr/lib/vst",
    "/usr/local/lib/vst",
];

/// How discovery obtains metadata for a module that is not cached yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScanMode {
    /// Never instantiate anything; cached records only.
    CacheOnly,
    /// Instantiate in this process.
    InProcess,
    /// Run the helper scanner executable per module.
    External,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EditorConfig {
    /// Sleep between event-queue polls on the engine thread.
    pub poll_interval_ms: u64,
    /// Interval of the pass that services window requests, queued calls
    /// and idle callbacks.
    pub idle_interval_ms: u64,
    /// How long `open_editor` waits for the window before giving up.
    pub open_timeout_ms: u64,
    /// Delay between `EditOpen` and the first `EditGetRect`; some plugins
    /// report a zero rect if asked immediately.
    pub editor_open_settle_ms: u64,
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1,
            idle_interval_ms: 50,
            open_timeout_ms: 5000,
            editor_open_settle_ms: 100,
        }
    }
}

impl EditorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn editor_open_settle(&self) -> Duration {
        Duration::from_millis(self.editor_open_settle_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub plugin_dirs: Vec<PathBuf>,
    pub library_search_path: Vec<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub scan_mode: ScanMode,
    /// Deciseconds; zero or negative disables the timeout.
    pub scan_timeout_ds: i32,
    pub scanner_program: Option<PathBuf>,
    pub editor: EditorConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            plugin_dirs: expand_search_dirs(PLUGIN_SEARCH_DIRS),
            library_search_path: Vec::new(),
            cache_dir: None,
            scan_mode: ScanMode::External,
            scan_timeout_ds: 150,
            scanner_program: None,
            editor: EditorConfig::default(),
        }
    }
}

impl BridgeConfig {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("fxbridge").join("config.json"))
    }

    /// Load from the default location, falling back to defaults.
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load_from(&path).unwrap_or_else(|e| {
                log::warn!("config: {}; using defaults", e);
                Self::default()
            }),
            _ => Self::default(),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&text)
            .map_err(|e| BridgeError::Config(format!("{}: {}", path.display(), e)))?;
        config.plugin_dirs = config
            .plugin_dirs
            .iter()
            .map(|p| expand_home(p))
            .collect();
        log::debug!("config: loaded {}", path.display());
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| BridgeError::Config(e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn resolved_cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("fxbridge")
        })
    }

    /// Extra module search directories: configured ones first, then the
    /// colon-separated `LXVST_PATH` environment variable.
    pub fn module_search_path(&self) -> Vec<PathBuf> {
        let mut dirs = self.library_search_path.clone();
        if let Ok(env) = std::env::var("LXVST_PATH") {
            dirs.extend(
                env.split(':')
                    .filter(|s| !s.is_empty())
                    .map(|s| expand_home(Path::new(s))),
            );
        }
        dirs
    }

    /// The helper executable: configured, or `fxbridge-scan` next to the
    /// running binary.
    pub fn resolved_scanner_program(&self) -> Option<PathBuf> {
        if let Some(program) = &self.scanner_program {
            return Some(program.clone());
        }
        let exe = std::env::current_exe().ok()?;
        let candidate = exe.parent()?.join("fxbridge-scan");
        candidate.is_file().then_some(candidate)
    }
}

fn expand_search_dirs(dirs: &[&str]) -> Vec<PathBuf> {
    dirs.iter().map(|d| expand_home(Path::new(d))).collect()
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config: BridgeConfig =
            serde_json::from_str(r#"{ "scan_mode": "in-process", "editor": { "idle_interval_ms": 10 } }"#)
                .unwrap();
        assert_eq!(config.scan_mode, ScanMode::InProcess);
        assert_eq!(config.scan_timeout_ds, 150);
        assert_eq!(config.editor.idle_interval_ms, 10);
        assert_eq!(config.editor.poll_interval_ms, 1);
    }

    #[test]
    fn save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut config = BridgeConfig::default();
        config.plugin_dirs = vec![dir.path().join("plugins")];
        config.scan_mode = ScanMode::CacheOnly;
        config.save_to(&path).unwrap();
        assert_eq!(BridgeConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            BridgeConfig::load_from(&path),
            Err(BridgeError::Config(_))
        ));
    }

    #[test]
    fn tilde_is_expanded() {
        let expanded = expand_home(Path::new("~/.lxvst"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expanded, home.join(".lxvst"));
        }
        assert_eq!(expand_home(Path::new("/usr/lib/vst")), PathBuf::from("/usr/lib/vst"));
    }
}
