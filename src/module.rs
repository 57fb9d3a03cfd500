//! Module loader.
//!
//! Opens a plugin shared library, resolves its entry point and keeps the
//! `dlopen` handle alive for as long as any instance created from it exists.
//! Instances hold a [`ModuleLease`]; the count of live leases gates
//! [`ModuleHandle::unload`].
//!
//! Note that glibc may keep a library mapped after `dlclose` (e.g. when it
//! registered thread-local destructors).  The handle is still considered
//! unloaded once `unload` returns `Ok`.

use std::collections::HashMap;
use std::ffi::{CStr, CString, c_void};
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::abi::{ENTRY_SYMBOL, EntryProc, LEGACY_ENTRY_SYMBOL};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};

#[cfg(target_os = "macos")]
pub const MODULE_SUFFIX: &str = "dylib";
#[cfg(not(target_os = "macos"))]
pub const MODULE_SUFFIX: &str = "so";

// ---------------------------------------------------------------------------
// OS library handle
// ---------------------------------------------------------------------------

/// Owned `dlopen` handle, closed on drop.
pub(crate) struct LibraryHandle(*mut c_void);

// The handle is an opaque token; dlclose/dlsym are thread-safe.
unsafe impl Send for LibraryHandle {}
unsafe impl Sync for LibraryHandle {}

impl LibraryHandle {
    pub(crate) fn open(path: &Path) -> std::result::Result<Self, String> {
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| "path contains a NUL byte".to_string())?;
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_LOCAL | libc::RTLD_LAZY) };
        if handle.is_null() {
            return Err(last_dl_error());
        }
        Ok(Self(handle))
    }

    pub(crate) fn symbol(&self, name: &[u8]) -> Option<*mut c_void> {
        let name = CStr::from_bytes_with_nul(name).ok()?;
        let sym = unsafe { libc::dlsym(self.0, name.as_ptr()) };
        (!sym.is_null()).then_some(sym)
    }
}

impl Drop for LibraryHandle {
    fn drop(&mut self) {
        unsafe {
            libc::dlclose(self.0);
        }
    }
}

fn last_dl_error() -> String {
    unsafe {
        let err = libc::dlerror();
        if err.is_null() {
            "unknown dlopen error".to_string()
        } else {
            CStr::from_ptr(err).to_string_lossy().into_owned()
        }
    }
}

// ---------------------------------------------------------------------------
// ModuleHandle
// ---------------------------------------------------------------------------

struct ModuleState {
    live: usize,
    library: Option<LibraryHandle>,
    unloaded: bool,
}

struct ModuleInner {
    path: PathBuf,
    name: String,
    entry: EntryProc,
    state: Mutex<ModuleState>,
}

/// One loaded plugin module, shared by every instance created from it.
#[derive(Clone)]
pub struct ModuleHandle {
    inner: Arc<ModuleInner>,
}

impl ModuleHandle {
    fn new(path: PathBuf, name: String, entry: EntryProc, library: Option<LibraryHandle>) -> Self {
        Self {
            inner: Arc::new(ModuleInner {
                path,
                name,
                entry,
                state: Mutex::new(ModuleState {
                    live: 0,
                    library,
                    unloaded: false,
                }),
            }),
        }
    }

    /// Wrap an entry point that is linked into the current process.
    pub fn from_entry(path: impl Into<PathBuf>, name: impl Into<String>, entry: EntryProc) -> Self {
        Self::new(path.into(), name.into(), entry, None)
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Display name (file stem of the module).
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn entry(&self) -> EntryProc {
        self.inner.entry
    }

    pub fn live_instances(&self) -> usize {
        self.inner.state.lock().live
    }

    pub fn is_loaded(&self) -> bool {
        !self.inner.state.lock().unloaded
    }

    /// Take a counted reference for a new instance.
    pub(crate) fn acquire(&self) -> Result<ModuleLease> {
        let mut state = self.inner.state.lock();
        if state.unloaded {
            return Err(BridgeError::load_failed(
                &self.inner.path,
                "module has been unloaded",
            ));
        }
        state.live += 1;
        Ok(ModuleLease {
            module: self.clone(),
        })
    }

    /// Release OS resources.  Fails with `InUse` while instances are alive.
    pub fn unload(&self) -> Result<()> {
        let library = {
            let mut state = self.inner.state.lock();
            if state.live > 0 {
                return Err(BridgeError::InUse {
                    path: self.inner.path.clone(),
                    refs: state.live,
                });
            }
            state.unloaded = true;
            state.library.take()
        };
        if library.is_some() {
            log::debug!("VST: unloading {}", self.inner.path.display());
        }
        drop(library);
        Ok(())
    }

    pub fn ptr_eq(&self, other: &ModuleHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ModuleHandle")
            .field("path", &self.inner.path)
            .field("name", &self.inner.name)
            .field("live", &state.live)
            .field("loaded", &!state.unloaded)
            .finish()
    }
}

/// A counted reference to a module; dropping it decrements the count.
pub struct ModuleLease {
    module: ModuleHandle,
}

impl ModuleLease {
    pub fn module(&self) -> &ModuleHandle {
        &self.module
    }
}

impl Drop for ModuleLease {
    fn drop(&mut self) {
        let mut state = self.module.inner.state.lock();
        state.live = state.live.saturating_sub(1);
    }
}

// ---------------------------------------------------------------------------
// Loaders
// ---------------------------------------------------------------------------

/// Source of plugin modules.
pub trait ModuleLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<ModuleHandle>;
}

/// Loads modules from disk with `dlopen`.
#[derive(Debug, Clone, Default)]
pub struct DlLoader {
    search_path: Vec<PathBuf>,
}

impl DlLoader {
    pub fn new(search_path: Vec<PathBuf>) -> Self {
        Self { search_path }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(config.module_search_path())
    }

    fn open_library(&self, path: &Path) -> Result<LibraryHandle> {
        let first_error = match LibraryHandle::open(path) {
            Ok(lib) => return Ok(lib),
            Err(e) => e,
        };
        log::debug!("VST: dlopen failed for {}: {}", path.display(), first_error);

        let Some(file_name) = path.file_name() else {
            return Err(BridgeError::load_failed(path, first_error));
        };

        for dir in &self.search_path {
            let candidate = dir.join(file_name);
            match LibraryHandle::open(&candidate) {
                Ok(lib) => {
                    log::debug!("VST: found {} via search path", candidate.display());
                    return Ok(lib);
                }
                Err(e) => log::debug!("VST: dlopen failed for {}: {}", candidate.display(), e),
            }
        }

        Err(BridgeError::load_failed(path, first_error))
    }
}

impl ModuleLoader for DlLoader {
    fn load(&self, path: &Path) -> Result<ModuleHandle> {
        let path = with_module_suffix(path);
        let library = self.open_library(&path)?;

        let entry_ptr = library
            .symbol(ENTRY_SYMBOL)
            .or_else(|| library.symbol(LEGACY_ENTRY_SYMBOL))
            .ok_or_else(|| BridgeError::EntryPointMissing(path.clone()))?;

        // SAFETY: the symbol is the module's documented entry point.
        let entry: EntryProc = unsafe { std::mem::transmute::<*mut c_void, EntryProc>(entry_ptr) };

        log::debug!("VST: loaded {}", path.display());
        Ok(ModuleHandle::new(
            path.clone(),
            module_display_name(&path),
            entry,
            Some(library),
        ))
    }
}

/// Entry points linked into the host itself, addressed by a virtual path.
#[derive(Default)]
pub struct StaticLoader {
    modules: Mutex<HashMap<PathBuf, (String, EntryProc)>>,
    loads: AtomicUsize,
}

impl StaticLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, path: impl Into<PathBuf>, name: impl Into<String>, entry: EntryProc) {
        self.modules.lock().insert(path.into(), (name.into(), entry));
    }

    /// Number of successful `load` calls so far.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl ModuleLoader for StaticLoader {
    fn load(&self, path: &Path) -> Result<ModuleHandle> {
        let (name, entry) = self
            .modules
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| BridgeError::load_failed(path, "no such module registered"))?;
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(ModuleHandle::from_entry(path, name, entry))
    }
}

/// Append the platform library suffix if the path has none.
pub fn with_module_suffix(path: &Path) -> PathBuf {
    let has_suffix = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case(MODULE_SUFFIX));
    if has_suffix {
        path.to_path_buf()
    } else {
        let mut s = path.as_os_str().to_owned();
        s.push(".");
        s.push(MODULE_SUFFIX);
        PathBuf::from(s)
    }
}

pub fn module_display_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "Unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{AEffect, HostCallbackProc};

    unsafe extern "C" fn null_entry(_host: HostCallbackProc) -> *mut AEffect {
        std::ptr::null_mut()
    }

    #[test]
    fn suffix_is_appended_once() {
        assert_eq!(
            with_module_suffix(Path::new("/plugins/reverb")),
            PathBuf::from(format!("/plugins/reverb.{}", MODULE_SUFFIX))
        );
        let already = PathBuf::from(format!("/plugins/reverb.{}", MODULE_SUFFIX));
        assert_eq!(with_module_suffix(&already), already);
    }

    #[test]
    fn unload_refuses_while_leased() {
        let module = ModuleHandle::from_entry("/static/null.so", "null", null_entry);
        let lease = module.acquire().unwrap();
        assert_eq!(module.live_instances(), 1);
        assert!(matches!(module.unload(), Err(BridgeError::InUse { refs: 1, .. })));
        assert!(module.is_loaded());

        drop(lease);
        assert_eq!(module.live_instances(), 0);
        module.unload().unwrap();
        assert!(!module.is_loaded());
        assert!(module.acquire().is_err());
    }

    #[test]
    fn missing_library_reports_load_failed() {
        let loader = DlLoader::new(vec![PathBuf::from("/nonexistent-a"), PathBuf::from("/nonexistent-b")]);
        let err = loader.load(Path::new("/definitely/not/here/plugin")).unwrap_err();
        assert!(matches!(err, BridgeError::LoadFailed { .. }));
    }

    /// A real shared library with neither entry symbol.
    fn system_libm() -> Option<PathBuf> {
        [
            "/lib/x86_64-linux-gnu",
            "/usr/lib/x86_64-linux-gnu",
            "/lib/aarch64-linux-gnu",
            "/usr/lib/aarch64-linux-gnu",
            "/lib64",
            "/usr/lib64",
            "/lib",
            "/usr/lib",
        ]
        .iter()
        .map(|dir| Path::new(dir).join("libm.so.6"))
        .find(|path| path.exists())
    }

    #[test]
    fn search_path_reaches_later_directories() {
        let Some(libm) = system_libm() else {
            return;
        };
        let empty = tempfile::tempdir().unwrap();
        let libs = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(&libm, libs.path().join("fxbridge-libm.so")).unwrap();

        // Not found by dlopen's own lookup, so only the second directory
        // can supply it.  It opens, but has no entry point.
        let loader = DlLoader::new(vec![empty.path().to_path_buf(), libs.path().to_path_buf()]);
        let err = loader.load(Path::new("fxbridge-libm")).unwrap_err();
        assert!(
            matches!(&err, BridgeError::EntryPointMissing(path) if path == Path::new("fxbridge-libm.so")),
            "{err}"
        );

        let without_dirs = DlLoader::new(vec![empty.path().to_path_buf()]);
        assert!(matches!(
            without_dirs.load(Path::new("fxbridge-libm")),
            Err(BridgeError::LoadFailed { .. })
        ));
    }

    #[test]
    fn library_without_entry_point_is_rejected() {
        let Some(libm) = system_libm() else {
            return;
        };
        let dir = tempfile::tempdir().unwrap();
        let plugin = dir.path().join("NoEntry.so");
        std::os::unix::fs::symlink(&libm, &plugin).unwrap();

        let err = DlLoader::default().load(&plugin).unwrap_err();
        assert!(matches!(err, BridgeError::EntryPointMissing(path) if path == plugin));
    }

    #[test]
    fn static_loader_counts_loads() {
        let loader = StaticLoader::new();
        loader.register("/static/null.so", "null", null_entry);
        assert!(loader.load(Path::new("/static/other.so")).is_err());
        let module = loader.load(Path::new("/static/null.so")).unwrap();
        assert_eq!(module.name(), "null");
        assert_eq!(loader.load_count(), 1);
    }
}
