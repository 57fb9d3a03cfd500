use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the loader, bridge, scanner, cache and editor engine.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to load plugin module {path}: {reason}")]
    LoadFailed { path: PathBuf, reason: String },
    #[error("no VST entry point in {0}")]
    EntryPointMissing(PathBuf),
    #[error("{0} is not a VST plugin (bad magic)")]
    NotAPlugin(PathBuf),
    #[error("failed to instantiate plugin from {0}")]
    InstantiationFailed(PathBuf),
    #[error("plugin \"{0}\" has no editor")]
    EditorUnavailable(String),
    #[error("cannot create editor for plugin \"{0}\"")]
    EditorCreateFailed(String),
    #[error("corrupt cache file {path}: {reason}")]
    CacheCorrupt { path: PathBuf, reason: String },
    #[error("module {path} still has {refs} live instance(s)")]
    InUse { path: PathBuf, refs: usize },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot launch scanner {program}: {source}")]
    ScannerLaunch {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("scan of {0} timed out")]
    ScanTimedOut(PathBuf),
    #[error("scan of {0} was cancelled")]
    ScanCancelled(PathBuf),
    #[error("editor engine is not running")]
    EngineStopped,
    #[error("configuration error: {0}")]
    Config(String),
}

impl BridgeError {
    pub(crate) fn load_failed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::LoadFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CacheCorrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
