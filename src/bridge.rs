//! Dispatch bridge: instantiation, the host callback and the raw call path
//! into a plugin's function table.
//!
//! A [`PluginInstance`] is a cheap, cloneable reference to one live plugin.
//! The editor engine keeps its own clone while a window is registered, so an
//! instance is never freed underneath the engine thread.

use std::cell::Cell;
use std::ffi::{CStr, c_char, c_void};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::abi::{
    AEffect, EFFECT_MAGIC, ERect, HOST_VST_VERSION, HostOpcode, KeyEvent, Opcode, flags,
    string_from_buffer,
};
use crate::editor::EditorLink;
use crate::error::{BridgeError, Result};
use crate::module::{ModuleHandle, ModuleLease};

/// Vendor and product strings reported to plugins.
pub const HOST_VENDOR: &str = "fxbridge";
pub const HOST_PRODUCT: &str = "fxbridge";

/// Capability queries answered "yes" when no host context handles them.
pub const DEFAULT_CAN_DO: &[&str] = &[
    "supplyIdle",
    "sendVstTimeInfo",
    "sendVstEvents",
    "sendVstMidiEvent",
    "receiveVstEvents",
    "receiveVstMidiEvent",
    "supportShell",
    "shellCategory",
    "shellCategorycurID",
];

/// Scratch buffer for string opcodes.  The ABI nominally allows 64 bytes but
/// plenty of plugins write past that.
const STRING_BUFFER_LEN: usize = 256;

pub type InstanceId = u64;

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

fn next_instance_id() -> InstanceId {
    NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed)
}

// ---------------------------------------------------------------------------
// Sub-plugin ID reported during shell instantiation
// ---------------------------------------------------------------------------

thread_local! {
    static LOADING_SHELL_ID: Cell<i32> = const { Cell::new(0) };
}

/// Run `f` with `id` reported to plugins asking for the current shell
/// sub-plugin (`HostOpcode::CurrentId`).  Restores the previous value after.
pub fn with_loading_id<R>(id: i32, f: impl FnOnce() -> R) -> R {
    let previous = LOADING_SHELL_ID.with(|c| c.replace(id));
    let result = f();
    LOADING_SHELL_ID.with(|c| c.set(previous));
    result
}

pub fn current_loading_id() -> i32 {
    LOADING_SHELL_ID.with(|c| c.get())
}

// ---------------------------------------------------------------------------
// Host side of the callback
// ---------------------------------------------------------------------------

/// A decoded host-callback request.
#[derive(Debug, Clone, PartialEq)]
pub enum HostRequest<'a> {
    Automate { index: i32, value: f32 },
    Idle,
    NeedIdle,
    WantMidi,
    IoChanged,
    SizeWindow { width: i32, height: i32 },
    GetSampleRate,
    GetBlockSize,
    GetTime { flags: isize },
    GetCurrentProcessLevel,
    GetAutomationState,
    CanDo(&'a str),
    UpdateDisplay,
    BeginEdit(i32),
    EndEdit(i32),
    Other {
        opcode: HostOpcode,
        index: i32,
        value: isize,
        opt: f32,
    },
}

impl<'a> HostRequest<'a> {
    /// # Safety
    /// For `CanDo`, `ptr` must be null or point to a NUL-terminated string
    /// that outlives `'a`.
    unsafe fn decode(op: HostOpcode, index: i32, value: isize, ptr: *mut c_void, opt: f32) -> Self {
        match op {
            HostOpcode::Automate => HostRequest::Automate { index, value: opt },
            HostOpcode::Idle => HostRequest::Idle,
            HostOpcode::NeedIdle => HostRequest::NeedIdle,
            HostOpcode::WantMidi => HostRequest::WantMidi,
            HostOpcode::IoChanged => HostRequest::IoChanged,
            HostOpcode::SizeWindow => HostRequest::SizeWindow {
                width: index,
                height: value as i32,
            },
            HostOpcode::GetSampleRate => HostRequest::GetSampleRate,
            HostOpcode::GetBlockSize => HostRequest::GetBlockSize,
            HostOpcode::GetTime => HostRequest::GetTime { flags: value },
            HostOpcode::GetCurrentProcessLevel => HostRequest::GetCurrentProcessLevel,
            HostOpcode::GetAutomationState => HostRequest::GetAutomationState,
            HostOpcode::CanDo => {
                let query = if ptr.is_null() {
                    ""
                } else {
                    unsafe { CStr::from_ptr(ptr as *const c_char) }
                        .to_str()
                        .unwrap_or("")
                };
                HostRequest::CanDo(query)
            }
            HostOpcode::UpdateDisplay => HostRequest::UpdateDisplay,
            HostOpcode::BeginEdit => HostRequest::BeginEdit(index),
            HostOpcode::EndEdit => HostRequest::EndEdit(index),
            opcode => HostRequest::Other {
                opcode,
                index,
                value,
                opt,
            },
        }
    }
}

/// Answer given when nobody else handles a request: the capability
/// allow-list says yes, everything else is zero.
pub fn default_response(request: &HostRequest<'_>) -> isize {
    match request {
        HostRequest::CanDo(query) => DEFAULT_CAN_DO.contains(query) as isize,
        _ => 0,
    }
}

/// Host-side state a running plugin can call back into.
///
/// Called on whatever thread the plugin happens to call from (audio, GUI or
/// editor engine).  Return `None` to fall back to [`default_response`].
pub trait HostContext: Send + Sync {
    fn handle(&self, request: &HostRequest<'_>) -> Option<isize>;
}

type ContextBox = Box<Arc<dyn HostContext>>;

/// Recover the context stored in `resvd1`.
///
/// # Safety
/// `effect` must be null or a live `AEffect` whose `resvd1` is zero or was
/// set by [`PluginInstance::instantiate`].
unsafe fn context_of<'a>(effect: *mut AEffect) -> Option<&'a dyn HostContext> {
    if effect.is_null() {
        return None;
    }
    let slot = unsafe { (*effect).resvd1 };
    if slot == 0 {
        return None;
    }
    let context = unsafe { &*(slot as *const Arc<dyn HostContext>) };
    Some(context.as_ref())
}

fn write_host_string(ptr: *mut c_void, value: &str) -> isize {
    if ptr.is_null() {
        return 0;
    }
    // 64-byte buffer per the ABI, keep room for the terminator.
    let bytes = &value.as_bytes()[..value.len().min(63)];
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr as *mut u8, bytes.len());
        *(ptr as *mut u8).add(bytes.len()) = 0;
    }
    1
}

/// The callback handed to every plugin entry point.
pub(crate) unsafe extern "C" fn host_callback(
    effect: *mut AEffect,
    opcode: i32,
    index: i32,
    value: isize,
    ptr: *mut c_void,
    opt: f32,
) -> isize {
    let Ok(op) = HostOpcode::try_from(opcode) else {
        log::trace!("VST: unhandled host opcode {}", opcode);
        return 0;
    };

    match op {
        HostOpcode::Version => return HOST_VST_VERSION,
        HostOpcode::CurrentId => return current_loading_id() as isize,
        HostOpcode::GetVendorString => return write_host_string(ptr, HOST_VENDOR),
        HostOpcode::GetProductString => return write_host_string(ptr, HOST_PRODUCT),
        HostOpcode::GetVendorVersion => return 1,
        _ => {}
    }

    let request = unsafe { HostRequest::decode(op, index, value, ptr, opt) };
    match unsafe { context_of(effect) } {
        Some(context) => context
            .handle(&request)
            .unwrap_or_else(|| default_response(&request)),
        None => default_response(&request),
    }
}

// ---------------------------------------------------------------------------
// Dispatcher calls
// ---------------------------------------------------------------------------

/// One plugin-bound call, lowered to the raw dispatcher arguments only when
/// it is issued.
#[derive(Debug, Clone, Copy)]
pub struct DispatchCall {
    pub opcode: Opcode,
    pub index: i32,
    pub value: isize,
    ptr: *mut c_void,
    pub opt: f32,
}

// The pointer is only ever handed to the plugin; `with_ptr` is where the
// caller vouches for it.
unsafe impl Send for DispatchCall {}

impl DispatchCall {
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            index: 0,
            value: 0,
            ptr: std::ptr::null_mut(),
            opt: 0.0,
        }
    }

    pub fn index(mut self, index: i32) -> Self {
        self.index = index;
        self
    }

    pub fn value(mut self, value: isize) -> Self {
        self.value = value;
        self
    }

    pub fn opt(mut self, opt: f32) -> Self {
        self.opt = opt;
        self
    }

    /// # Safety
    /// `ptr` must be valid for whatever the plugin does with it for this
    /// opcode, for as long as the call may be pending (queued calls run on
    /// the editor thread).
    pub unsafe fn with_ptr(mut self, ptr: *mut c_void) -> Self {
        self.ptr = ptr;
        self
    }

    pub fn ptr(&self) -> *mut c_void {
        self.ptr
    }

    pub fn key(event: KeyEvent) -> Self {
        Self::new(event.opcode())
            .index(event.character)
            .value(event.virtual_key)
            .opt(event.modifiers)
    }
}

// ---------------------------------------------------------------------------
// PluginInstance
// ---------------------------------------------------------------------------

struct InstanceInner {
    id: InstanceId,
    effect: *mut AEffect,
    path: PathBuf,
    name: String,
    lease: Mutex<Option<ModuleLease>>,
    // Keeps the pointer stored in resvd1 valid.
    _context: Option<ContextBox>,
    closed: AtomicBool,
    /// Serialises audio processing against state loads.
    process_lock: Mutex<()>,
    editor: Mutex<EditorLink>,
    editor_changed: Condvar,
}

// All access to the plugin goes through the function table; the plugin is
// responsible for its own thread safety, and host-side mutable state is
// behind the mutexes above.
unsafe impl Send for InstanceInner {}
unsafe impl Sync for InstanceInner {}

impl InstanceInner {
    fn shutdown_plugin(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let _process = self.process_lock.lock();
            unsafe {
                raw_dispatch(self.effect, DispatchCall::new(Opcode::MainsChanged));
                raw_dispatch(self.effect, DispatchCall::new(Opcode::Close));
            }
        }
        log::debug!("VST: closed instance {} ({})", self.id, self.name);

        let lease = self.lease.lock().take();
        if let Some(lease) = lease {
            let module = lease.module().clone();
            drop(lease);
            if module.live_instances() == 0 {
                if let Err(e) = module.unload() {
                    log::debug!("VST: unload of {} skipped: {}", module.path().display(), e);
                }
            }
        }
    }
}

impl Drop for InstanceInner {
    fn drop(&mut self) {
        self.shutdown_plugin();
    }
}

unsafe fn raw_dispatch(effect: *mut AEffect, call: DispatchCall) -> isize {
    let Some(dispatcher) = (unsafe { (*effect).dispatcher }) else {
        return 0;
    };
    unsafe {
        dispatcher(
            effect,
            call.opcode.raw(),
            call.index,
            call.value,
            call.ptr,
            call.opt,
        )
    }
}

#[derive(Clone)]
pub struct PluginInstance {
    inner: Arc<InstanceInner>,
}

impl PluginInstance {
    /// Create a plugin instance from a loaded module.
    ///
    /// With a `context`, the plugin is opened immediately and its callbacks
    /// are routed to the context.  Without one (scanning), the plugin only
    /// sees the built-in answers and the caller is responsible for sending
    /// `Opcode::Open`.
    pub fn instantiate(
        module: &ModuleHandle,
        context: Option<Arc<dyn HostContext>>,
    ) -> Result<Self> {
        let lease = module.acquire()?;
        let entry = module.entry();

        let effect = unsafe { entry(host_callback) };
        if effect.is_null() {
            log::warn!("VST: {} returned no plugin", module.path().display());
            return Err(BridgeError::InstantiationFailed(module.path().to_path_buf()));
        }

        let magic = unsafe { (*effect).magic };
        if magic != EFFECT_MAGIC {
            log::warn!(
                "VST: {} has bad magic {:#010x}",
                module.path().display(),
                magic
            );
            return Err(BridgeError::NotAPlugin(module.path().to_path_buf()));
        }

        let context: Option<ContextBox> = context.map(Box::new);
        let slot = context
            .as_ref()
            .map(|b| &**b as *const Arc<dyn HostContext> as isize)
            .unwrap_or(0);
        unsafe {
            (*effect).resvd1 = slot;
        }

        let instance = Self {
            inner: Arc::new(InstanceInner {
                id: next_instance_id(),
                effect,
                path: module.path().to_path_buf(),
                name: module.name().to_string(),
                lease: Mutex::new(Some(lease)),
                _context: context,
                closed: AtomicBool::new(false),
                process_lock: Mutex::new(()),
                editor: Mutex::new(EditorLink::default()),
                editor_changed: Condvar::new(),
            }),
        };

        if slot != 0 {
            instance.dispatch(DispatchCall::new(Opcode::Open));
            let version = instance.dispatch(DispatchCall::new(Opcode::GetVstVersion));
            log::debug!(
                "VST: opened {} (instance {}, version {})",
                instance.inner.name,
                instance.inner.id,
                version
            );
        }

        Ok(instance)
    }

    pub fn id(&self) -> InstanceId {
        self.inner.id
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn ptr_eq(&self, other: &PluginInstance) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Raw pointer to the plugin's function table.
    pub fn effect_ptr(&self) -> *mut AEffect {
        self.inner.effect
    }

    fn effect(&self) -> Option<&AEffect> {
        if self.is_closed() {
            None
        } else {
            Some(unsafe { &*self.inner.effect })
        }
    }

    /// Pass a call straight to the plugin dispatcher.  Returns 0 once the
    /// instance is closed.
    pub fn dispatch(&self, call: DispatchCall) -> isize {
        if self.is_closed() {
            return 0;
        }
        unsafe { raw_dispatch(self.inner.effect, call) }
    }

    /// Close the editor if one is open, shut the plugin down and release the
    /// module.  Safe to call more than once.
    pub fn close(&self) {
        if self.is_closed() {
            return;
        }
        crate::editor::force_teardown(self);
        self.inner.shutdown_plugin();
    }

    // ---- function table fields ------------------------------------------

    pub fn num_inputs(&self) -> i32 {
        self.effect().map(|e| e.num_inputs).unwrap_or(0)
    }

    pub fn num_outputs(&self) -> i32 {
        self.effect().map(|e| e.num_outputs).unwrap_or(0)
    }

    pub fn num_params(&self) -> i32 {
        self.effect().map(|e| e.num_params).unwrap_or(0)
    }

    pub fn num_programs(&self) -> i32 {
        self.effect().map(|e| e.num_programs).unwrap_or(0)
    }

    pub fn unique_id(&self) -> i32 {
        self.effect().map(|e| e.unique_id).unwrap_or(0)
    }

    pub fn flags(&self) -> i32 {
        self.effect().map(|e| e.flags).unwrap_or(0)
    }

    pub fn has_editor(&self) -> bool {
        self.flags() & flags::HAS_EDITOR != 0
    }

    pub fn can_replacing(&self) -> bool {
        self.flags() & flags::CAN_REPLACING != 0
    }

    pub fn is_synth(&self) -> bool {
        self.flags() & flags::IS_SYNTH != 0
    }

    // ---- typed helpers ---------------------------------------------------

    /// Call a string-returning opcode and copy the result out.
    pub fn get_string(&self, opcode: Opcode, index: i32) -> String {
        let mut buf = [0u8; STRING_BUFFER_LEN];
        let call = unsafe {
            DispatchCall::new(opcode)
                .index(index)
                .with_ptr(buf.as_mut_ptr() as *mut c_void)
        };
        self.dispatch(call);
        // Force termination in case the plugin filled the whole buffer.
        buf[STRING_BUFFER_LEN - 1] = 0;
        string_from_buffer(&buf)
    }

    pub fn can_do(&self, capability: &str) -> bool {
        let Ok(query) = std::ffi::CString::new(capability) else {
            return false;
        };
        let call = unsafe { DispatchCall::new(Opcode::CanDo).with_ptr(query.as_ptr() as *mut c_void) };
        self.dispatch(call) > 0
    }

    pub fn vst_version(&self) -> i32 {
        self.dispatch(DispatchCall::new(Opcode::GetVstVersion)) as i32
    }

    pub fn category(&self) -> isize {
        self.dispatch(DispatchCall::new(Opcode::GetPlugCategory))
    }

    pub fn program(&self) -> i32 {
        self.dispatch(DispatchCall::new(Opcode::GetProgram)) as i32
    }

    /// Editor size as reported by the plugin, if it reported one.
    pub fn edit_get_rect(&self) -> Option<ERect> {
        let mut rect: *mut ERect = std::ptr::null_mut();
        let call = unsafe {
            DispatchCall::new(Opcode::EditGetRect)
                .with_ptr(&mut rect as *mut *mut ERect as *mut c_void)
        };
        self.dispatch(call);
        if rect.is_null() {
            None
        } else {
            Some(unsafe { *rect })
        }
    }

    /// Opaque plugin state.  `preset` selects the current program only.
    pub fn get_chunk(&self, preset: bool) -> Vec<u8> {
        let mut data: *mut c_void = std::ptr::null_mut();
        let call = unsafe {
            DispatchCall::new(Opcode::GetChunk)
                .index(preset as i32)
                .with_ptr(&mut data as *mut *mut c_void as *mut c_void)
        };
        let len = self.dispatch(call);
        if data.is_null() || len <= 0 {
            return Vec::new();
        }
        unsafe { std::slice::from_raw_parts(data as *const u8, len as usize) }.to_vec()
    }

    /// Load opaque state.  Holds the process lock for the duration.
    pub fn set_chunk(&self, data: &[u8], preset: bool) -> isize {
        let _process = self.inner.process_lock.lock();
        let call = unsafe {
            DispatchCall::new(Opcode::SetChunk)
                .index(preset as i32)
                .value(data.len() as isize)
                .with_ptr(data.as_ptr() as *mut c_void)
        };
        self.dispatch(call)
    }

    pub fn set_parameter(&self, index: i32, value: f32) {
        if let Some(set) = self.effect().and_then(|e| e.set_parameter) {
            unsafe { set(self.inner.effect, index, value) };
        }
    }

    pub fn get_parameter(&self, index: i32) -> f32 {
        match self.effect().and_then(|e| e.get_parameter) {
            Some(get) => unsafe { get(self.inner.effect, index) },
            None => 0.0,
        }
    }

    /// Run one block of audio.  Channel slices must cover the plugin's
    /// declared inputs and outputs; the block length is the shortest slice.
    pub fn process(&self, inputs: &[&[f32]], outputs: &mut [&mut [f32]]) {
        let _process = self.inner.process_lock.lock();
        let Some(effect) = self.effect() else {
            return;
        };
        if inputs.len() < effect.num_inputs.max(0) as usize
            || outputs.len() < effect.num_outputs.max(0) as usize
        {
            log::warn!(
                "VST: {} needs {}in/{}out, got {}in/{}out",
                self.inner.name,
                effect.num_inputs,
                effect.num_outputs,
                inputs.len(),
                outputs.len()
            );
            return;
        }

        let frames = inputs
            .iter()
            .map(|c| c.len())
            .chain(outputs.iter().map(|c| c.len()))
            .min()
            .unwrap_or(0);
        let in_ptrs: Vec<*const f32> = inputs.iter().map(|c| c.as_ptr()).collect();
        let mut out_ptrs: Vec<*mut f32> = outputs.iter_mut().map(|c| c.as_mut_ptr()).collect();

        let process = if effect.has_flag(flags::CAN_REPLACING) {
            effect.process_replacing.or(effect.process)
        } else {
            effect.process
        };
        if let Some(process) = process {
            unsafe {
                process(
                    self.inner.effect,
                    in_ptrs.as_ptr(),
                    out_ptrs.as_mut_ptr(),
                    frames as i32,
                )
            };
        }
    }

    // ---- editor engine plumbing -----------------------------------------

    pub(crate) fn editor_link(&self) -> &Mutex<EditorLink> {
        &self.inner.editor
    }

    pub(crate) fn editor_changed(&self) -> &Condvar {
        &self.inner.editor_changed
    }
}

impl fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginInstance")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}
