//! Metadata scanner and shell expansion.

use std::ffi::c_void;
use std::path::Path;
use std::sync::Arc;

use crate::abi::{Opcode, SHELL_TERMINATOR_ID, string_from_buffer};
use crate::bridge::{DispatchCall, PluginInstance, with_loading_id};
use crate::error::Result;
use crate::module::{ModuleHandle, ModuleLoader};

use super::record::{PluginCategory, ScanRecord};

/// Upper bound on sub-plugins taken from one shell.
const MAX_SHELL_PLUGINS: usize = 4096;

/// Buffer for the shell enumeration name (65 bytes per the ABI, padded).
const SHELL_NAME_LEN: usize = 256;

/// Result of scanning one module.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanReport {
    /// The shell-level record, when the module is a shell.
    pub shell: Option<ScanRecord>,
    pub plugins: Vec<ScanRecord>,
}

impl ScanReport {
    /// All records in storage order: the shell record first, if any.
    pub fn into_records(self) -> Vec<ScanRecord> {
        self.shell.into_iter().chain(self.plugins).collect()
    }
}

/// Records a caller should see: a shell's own record is hidden when it
/// yielded any sub-plugins.
pub fn visible_records(records: &[ScanRecord]) -> Vec<ScanRecord> {
    match records.split_first() {
        Some((first, rest)) if first.is_shell() && !rest.is_empty() => rest.to_vec(),
        _ => records.to_vec(),
    }
}

pub struct Scanner {
    loader: Arc<dyn ModuleLoader>,
}

impl Scanner {
    pub fn new(loader: Arc<dyn ModuleLoader>) -> Self {
        Self { loader }
    }

    /// Load, instantiate and describe the plugin(s) in `path`.
    pub fn scan(&self, path: &Path) -> Result<Vec<ScanRecord>> {
        let report = self.scan_detailed(path)?;
        Ok(visible_records(&report.into_records()))
    }

    pub fn scan_detailed(&self, path: &Path) -> Result<ScanReport> {
        log::debug!("scan: loading {}", path.display());
        let module = self.loader.load(path)?;
        let report = scan_module(&module);
        if let Err(e) = module.unload() {
            log::debug!("scan: {}", e);
        }
        report
    }
}

fn scan_module(module: &ModuleHandle) -> Result<ScanReport> {
    // Held for the whole scan so closing one instance does not unload the
    // module before the shell's sub-plugins are instantiated.
    let _hold = module.acquire()?;

    let instance = PluginInstance::instantiate(module, None)?;
    instance.dispatch(DispatchCall::new(Opcode::Open));
    let mut record = describe(&instance, module.name());

    if record.category != PluginCategory::Shell {
        instance.close();
        log::info!("scan: {} ({})", record.name, record.category);
        return Ok(ScanReport {
            shell: None,
            plugins: vec![record],
        });
    }

    let contained = enumerate_shell(&instance);
    instance.close();
    log::info!(
        "scan: {} is a shell with {} plugin(s)",
        module.path().display(),
        contained.len()
    );

    record.sub_ids = contained.iter().map(|(id, _)| *id).collect();
    record.sub_names = contained.iter().map(|(_, name)| name.clone()).collect();

    let mut plugins = Vec::with_capacity(contained.len());
    for (id, shell_name) in &contained {
        match scan_sub_plugin(module, *id, shell_name) {
            Ok(sub) => plugins.push(sub),
            Err(e) => log::warn!("scan: sub-plugin {:#x} of {}: {}", id, module.path().display(), e),
        }
    }

    Ok(ScanReport {
        shell: Some(record),
        plugins,
    })
}

/// Walk the shell enumeration until the terminator ID.
fn enumerate_shell(instance: &PluginInstance) -> Vec<(i32, String)> {
    let mut contained: Vec<(i32, String)> = Vec::new();
    loop {
        let mut name = [0u8; SHELL_NAME_LEN];
        let call = unsafe {
            DispatchCall::new(Opcode::ShellGetNextPlugin).with_ptr(name.as_mut_ptr() as *mut c_void)
        };
        let id = instance.dispatch(call) as i32;
        if id == SHELL_TERMINATOR_ID {
            break;
        }
        if contained.iter().any(|(seen, _)| *seen == id) {
            log::warn!("scan: {} repeats sub-plugin {:#x}", instance.name(), id);
            break;
        }
        if contained.len() >= MAX_SHELL_PLUGINS {
            log::warn!("scan: {} lists too many sub-plugins", instance.name());
            break;
        }
        name[SHELL_NAME_LEN - 1] = 0;
        contained.push((id, sanitize(string_from_buffer(&name))));
    }
    contained
}

fn scan_sub_plugin(module: &ModuleHandle, id: i32, shell_name: &str) -> Result<ScanRecord> {
    with_loading_id(id, || {
        let instance = PluginInstance::instantiate(module, None)?;
        instance.dispatch(DispatchCall::new(Opcode::Open));
        let mut record = describe(&instance, module.name());
        instance.close();

        // Sub-plugins often report the shell's own name; the name from the
        // enumeration is the one users know.
        if !shell_name.is_empty() {
            record.name = shell_name.to_string();
        }
        record.unique_id = id;
        log::info!("scan:   {} ({:#x}, {})", record.name, id, record.category);
        Ok(record)
    })
}

fn sanitize(value: String) -> String {
    if value.contains(['\n', '\r']) {
        value.replace(['\n', '\r'], " ")
    } else {
        value
    }
}

/// Interrogate an opened instance.
fn describe(instance: &PluginInstance, module_name: &str) -> ScanRecord {
    let version = instance.vst_version();

    let mut name = sanitize(instance.get_string(Opcode::GetEffectName, 0));
    if name.is_empty() {
        name = sanitize(instance.get_string(Opcode::GetProductString, 0));
    }
    if name.is_empty() {
        name = module_name.to_string();
    }

    let mut vendor = sanitize(instance.get_string(Opcode::GetVendorString, 0));
    if vendor.is_empty() {
        vendor = "Unknown".to_string();
    }

    let num_params = instance.num_params().max(0);
    let mut param_names = Vec::with_capacity(num_params as usize);
    let mut param_labels = Vec::with_capacity(num_params as usize);
    for index in 0..num_params {
        let label = sanitize(instance.get_string(Opcode::GetParamLabel, index));
        let name = sanitize(instance.get_string(Opcode::GetParamName, index));
        param_names.push(if name.is_empty() { "No Name".to_string() } else { name });
        param_labels.push(if label.is_empty() { "No Label".to_string() } else { label });
    }

    let is_synth = instance.is_synth();
    let midi_inputs = version >= 2 && (is_synth || instance.can_do("receiveVstEvents"));
    let midi_outputs =
        version >= 2 && (instance.can_do("sendVstEvents") || instance.can_do("sendVstMidiEvent"));

    ScanRecord {
        name,
        vendor,
        unique_id: instance.unique_id(),
        category: PluginCategory::from_code(instance.category()),
        inputs: instance.num_inputs(),
        outputs: instance.num_outputs(),
        midi_inputs: midi_inputs as i32,
        midi_outputs: midi_outputs as i32,
        is_instrument: is_synth,
        has_editor: instance.has_editor(),
        can_replace: instance.can_replacing(),
        num_programs: instance.num_programs(),
        num_params,
        param_names,
        param_labels,
        sub_ids: Vec::new(),
        sub_names: Vec::new(),
    }
}
