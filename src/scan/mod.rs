//! Plugin metadata: scanning, shell expansion and discovery.

pub mod discovery;
pub mod external;
pub mod record;
pub mod scanner;

pub use discovery::{Discovery, is_plugin_file};
pub use external::{ExternalScanner, ScanCancel};
pub use record::{PluginCategory, ScanRecord};
pub use scanner::{ScanReport, Scanner, visible_records};
