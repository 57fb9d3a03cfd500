//! fxbridge: hosting bridge for VST 2.x plugin modules on Linux.
//!
//! - [`module`] loads plugin libraries and tracks live instances.
//! - [`bridge`] instantiates plugins and talks to them through the raw ABI.
//! - [`scan`] and [`cache`] discover plugins and remember what they are.
//! - [`editor`] runs the thread that owns every plugin editor window.

pub mod abi;
pub mod bridge;
pub mod cache;
pub mod config;
pub mod editor;
pub mod error;
pub mod module;
pub mod scan;

pub use bridge::{DispatchCall, HostContext, HostRequest, PluginInstance};
pub use cache::{CacheEntry, CacheStore};
pub use config::{BridgeConfig, EditorConfig, ScanMode};
pub use editor::{EditorEngine, EditorObserver, EditorState, WindowHandle};
pub use error::{BridgeError, Result};
pub use module::{DlLoader, ModuleHandle, ModuleLoader, StaticLoader};
pub use scan::{Discovery, PluginCategory, ScanRecord, Scanner};
