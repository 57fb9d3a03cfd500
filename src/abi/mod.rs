//! Bit-exact plugin ABI.
//!
//! Everything in here mirrors the native VST 2.x binary interface: the
//! `AEffect` function table handed back by a module's entry point, the
//! dispatcher and host-callback calling conventions, flag bits and the
//! numeric opcodes.  Field order and widths must not change; plugins read
//! and write these structs directly.

pub mod opcode;

use std::os::raw::c_void;

pub use opcode::{HostOpcode, Opcode};

/// `'VstP'`, the first field of every valid `AEffect`.
pub const EFFECT_MAGIC: i32 = i32::from_be_bytes(*b"VstP");

/// Version reported to plugins through `HostOpcode::Version`.
pub const HOST_VST_VERSION: isize = 2400;

/// Primary entry symbol, then the legacy fallback.
pub const ENTRY_SYMBOL: &[u8] = b"VSTPluginMain\0";
pub const LEGACY_ENTRY_SYMBOL: &[u8] = b"main\0";

/// Sub-plugin ID returned by the shell enumeration opcode once exhausted.
pub const SHELL_TERMINATOR_ID: i32 = 0;

// ---------------------------------------------------------------------------
// Function pointer types
// ---------------------------------------------------------------------------

pub type HostCallbackProc = unsafe extern "C" fn(
    effect: *mut AEffect,
    opcode: i32,
    index: i32,
    value: isize,
    ptr: *mut c_void,
    opt: f32,
) -> isize;

pub type DispatcherProc = unsafe extern "C" fn(
    effect: *mut AEffect,
    opcode: i32,
    index: i32,
    value: isize,
    ptr: *mut c_void,
    opt: f32,
) -> isize;

pub type ProcessProc = unsafe extern "C" fn(
    effect: *mut AEffect,
    inputs: *const *const f32,
    outputs: *mut *mut f32,
    sample_frames: i32,
);

pub type ProcessDoubleProc = unsafe extern "C" fn(
    effect: *mut AEffect,
    inputs: *const *const f64,
    outputs: *mut *mut f64,
    sample_frames: i32,
);

pub type SetParameterProc = unsafe extern "C" fn(effect: *mut AEffect, index: i32, value: f32);

pub type GetParameterProc = unsafe extern "C" fn(effect: *mut AEffect, index: i32) -> f32;

/// Signature of the module entry point (`VSTPluginMain` / `main`).
pub type EntryProc = unsafe extern "C" fn(host: HostCallbackProc) -> *mut AEffect;

// ---------------------------------------------------------------------------
// AEffect
// ---------------------------------------------------------------------------

/// The plugin's function table.
///
/// All function pointers are `Option` so that a plugin leaving one null is
/// observable instead of undefined behaviour; the layout is identical to the
/// bare pointer thanks to the null niche.
#[repr(C)]
pub struct AEffect {
    pub magic: i32,
    pub dispatcher: Option<DispatcherProc>,
    /// Deprecated accumulating process call.
    pub process: Option<ProcessProc>,
    pub set_parameter: Option<SetParameterProc>,
    pub get_parameter: Option<GetParameterProc>,
    pub num_programs: i32,
    pub num_params: i32,
    pub num_inputs: i32,
    pub num_outputs: i32,
    pub flags: i32,
    /// Reserved for the host.  The bridge stores its user context here.
    pub resvd1: isize,
    pub resvd2: isize,
    pub initial_delay: i32,
    pub real_qualities: i32,
    pub off_qualities: i32,
    pub io_ratio: f32,
    /// Plugin-private.
    pub object: *mut c_void,
    pub user: *mut c_void,
    pub unique_id: i32,
    pub version: i32,
    pub process_replacing: Option<ProcessProc>,
    pub process_double_replacing: Option<ProcessDoubleProc>,
    pub future: [u8; 56],
}

impl AEffect {
    pub fn has_flag(&self, flag: i32) -> bool {
        self.flags & flag != 0
    }
}

/// Editor rectangle returned through `Opcode::EditGetRect`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ERect {
    pub top: i16,
    pub left: i16,
    pub bottom: i16,
    pub right: i16,
}

impl ERect {
    pub fn width(&self) -> i32 {
        self.right as i32 - self.left as i32
    }

    pub fn height(&self) -> i32 {
        self.bottom as i32 - self.top as i32
    }
}

// ---------------------------------------------------------------------------
// Flags
// ---------------------------------------------------------------------------

pub mod flags {
    pub const HAS_EDITOR: i32 = 1;
    pub const CAN_REPLACING: i32 = 1 << 4;
    pub const PROGRAM_CHUNKS: i32 = 1 << 5;
    pub const IS_SYNTH: i32 = 1 << 8;
    pub const NO_SOUND_IN_STOP: i32 = 1 << 9;
    pub const CAN_DOUBLE_REPLACING: i32 = 1 << 12;
}

// ---------------------------------------------------------------------------
// Plugin categories
// ---------------------------------------------------------------------------

pub mod category {
    pub const UNKNOWN: isize = 0;
    pub const EFFECT: isize = 1;
    pub const SYNTH: isize = 2;
    pub const ANALYSIS: isize = 3;
    pub const MASTERING: isize = 4;
    pub const SPACIALIZER: isize = 5;
    pub const ROOM_FX: isize = 6;
    pub const SURROUND_FX: isize = 7;
    pub const RESTORATION: isize = 8;
    pub const OFFLINE_PROCESS: isize = 9;
    pub const SHELL: isize = 10;
    pub const GENERATOR: isize = 11;
}

// ---------------------------------------------------------------------------
// Editor key events
// ---------------------------------------------------------------------------

/// A key press or release forwarded from the host GUI to the plugin editor.
///
/// Marshalled as `index = character`, `value = virtual key`, `opt = modifier
/// bits` for `Opcode::EditKeyDown` / `Opcode::EditKeyUp`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyEvent {
    pub character: i32,
    pub virtual_key: isize,
    pub modifiers: f32,
    pub pressed: bool,
}

impl KeyEvent {
    pub fn opcode(&self) -> Opcode {
        if self.pressed {
            Opcode::EditKeyDown
        } else {
            Opcode::EditKeyUp
        }
    }
}

/// Copy a NUL-terminated string out of a fixed-size buffer the plugin wrote
/// into.  Stops at the first NUL or at the end of the buffer, whichever comes
/// first, so a plugin that forgets the terminator cannot make us over-read.
pub fn string_from_buffer(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}
