//! In-process fake plugins speaking the raw ABI, for driving the bridge
//! without real modules on disk.

#![allow(dead_code)]

use std::ffi::{CStr, c_char, c_void};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use fxbridge::abi::{
    AEffect, EFFECT_MAGIC, ERect, EntryProc, HostCallbackProc, HostOpcode, Opcode, category, flags,
};
use fxbridge::config::EditorConfig;
use fxbridge::editor::{HeadlessProbe, HeadlessWindows, WindowSystem};
use fxbridge::{EditorEngine, PluginInstance, StaticLoader};

pub const REVERB_ID: i32 = i32::from_be_bytes(*b"Rvb1");
pub const SHELL_ID: i32 = i32::from_be_bytes(*b"Shl0");
pub const SHELL_SUB_IDS: [i32; 3] = [0x5331_0001, 0x5331_0002, 0x5331_0003];
pub const SHELL_SUB_NAMES: [&str; 3] = ["Bundle Comp", "Bundle EQ", "Bundle Synth"];

/// Host-visible state of one fake instance.
pub struct FakeState {
    pub name: &'static str,
    pub vendor: &'static str,
    pub category: isize,
    pub synth: bool,
    pub host: HostCallbackProc,
    pub calls: Mutex<Vec<i32>>,
    pub program: AtomicI32,
    pub editor_open: AtomicBool,
    pub rect: ERect,
    pub chunk: Mutex<Vec<u8>>,
    pub params: Mutex<Vec<f32>>,
    pub next_sub: AtomicUsize,
    pub closed: AtomicBool,
}

impl FakeState {
    pub fn saw(&self, opcode: Opcode) -> usize {
        self.calls.lock().iter().filter(|&&op| op == opcode.raw()).count()
    }
}

/// Clone the state behind a live instance.
pub fn state_of(instance: &PluginInstance) -> Arc<FakeState> {
    unsafe {
        let object = (*instance.effect_ptr()).object as *const FakeState;
        Arc::increment_strong_count(object);
        Arc::from_raw(object)
    }
}

unsafe fn state<'a>(effect: *mut AEffect) -> &'a FakeState {
    unsafe { &*((*effect).object as *const FakeState) }
}

fn write_str(ptr: *mut c_void, value: &str) -> isize {
    if ptr.is_null() {
        return 0;
    }
    unsafe {
        std::ptr::copy_nonoverlapping(value.as_ptr(), ptr as *mut u8, value.len());
        *(ptr as *mut u8).add(value.len()) = 0;
    }
    1
}

unsafe extern "C" fn dispatcher(
    effect: *mut AEffect,
    opcode: i32,
    index: i32,
    value: isize,
    ptr: *mut c_void,
    _opt: f32,
) -> isize {
    let st = unsafe { state(effect) };
    st.calls.lock().push(opcode);

    let Ok(op) = Opcode::try_from(opcode) else {
        return 0;
    };
    match op {
        Opcode::Close => {
            st.closed.store(true, Ordering::SeqCst);
            unsafe {
                drop(Arc::from_raw((*effect).object as *const FakeState));
                drop(Box::from_raw(effect));
            }
            1
        }
        Opcode::GetEffectName => write_str(ptr, st.name),
        Opcode::GetProductString => write_str(ptr, st.name),
        Opcode::GetVendorString => write_str(ptr, st.vendor),
        Opcode::GetParamName => write_str(ptr, &format!("Param {}", index)),
        Opcode::GetParamLabel => write_str(ptr, if index % 2 == 0 { "dB" } else { "%" }),
        Opcode::GetPlugCategory => st.category,
        Opcode::GetVstVersion => 2400,
        Opcode::CanDo => {
            let query = unsafe { CStr::from_ptr(ptr as *const c_char) };
            match query.to_bytes() {
                b"receiveVstEvents" => st.synth as isize,
                b"sendVstEvents" => 0,
                _ => -1,
            }
        }
        Opcode::SetProgram => {
            st.program.store(value as i32, Ordering::SeqCst);
            0
        }
        Opcode::GetProgram => st.program.load(Ordering::SeqCst) as isize,
        Opcode::EditGetRect => {
            if !ptr.is_null() {
                unsafe { *(ptr as *mut *const ERect) = &st.rect };
            }
            1
        }
        Opcode::EditOpen => {
            st.editor_open.store(true, Ordering::SeqCst);
            // Real editors commonly ask the host for their size while opening.
            unsafe {
                (st.host)(
                    effect,
                    HostOpcode::SizeWindow.raw(),
                    st.rect.right as i32,
                    st.rect.bottom as isize,
                    std::ptr::null_mut(),
                    0.0,
                )
            };
            1
        }
        Opcode::EditClose => {
            st.editor_open.store(false, Ordering::SeqCst);
            1
        }
        Opcode::GetChunk => {
            let chunk = st.chunk.lock();
            unsafe { *(ptr as *mut *const u8) = chunk.as_ptr() };
            chunk.len() as isize
        }
        Opcode::SetChunk => {
            let data = unsafe { std::slice::from_raw_parts(ptr as *const u8, value as usize) };
            *st.chunk.lock() = data.to_vec();
            1
        }
        Opcode::ShellGetNextPlugin => {
            let next = st.next_sub.fetch_add(1, Ordering::SeqCst);
            match SHELL_SUB_IDS.get(next) {
                Some(id) => {
                    write_str(ptr, SHELL_SUB_NAMES[next]);
                    *id as isize
                }
                None => 0,
            }
        }
        _ => 0,
    }
}

unsafe extern "C" fn set_parameter(effect: *mut AEffect, index: i32, value: f32) {
    let st = unsafe { state(effect) };
    if let Some(slot) = st.params.lock().get_mut(index as usize) {
        *slot = value;
    }
    unsafe {
        (st.host)(
            effect,
            HostOpcode::Automate.raw(),
            index,
            0,
            std::ptr::null_mut(),
            value,
        )
    };
}

unsafe extern "C" fn get_parameter(effect: *mut AEffect, index: i32) -> f32 {
    let st = unsafe { state(effect) };
    st.params.lock().get(index as usize).copied().unwrap_or(0.0)
}

/// Halves every input sample into the matching output.
unsafe extern "C" fn process_replacing(
    effect: *mut AEffect,
    inputs: *const *const f32,
    outputs: *mut *mut f32,
    frames: i32,
) {
    let channels = unsafe { (*effect).num_outputs } as usize;
    for ch in 0..channels {
        unsafe {
            let input = std::slice::from_raw_parts(*inputs.add(ch), frames as usize);
            let output = std::slice::from_raw_parts_mut(*outputs.add(ch), frames as usize);
            for (o, i) in output.iter_mut().zip(input) {
                *o = i * 0.5;
            }
        }
    }
}

struct Shape {
    name: &'static str,
    vendor: &'static str,
    category: isize,
    flags: i32,
    unique_id: i32,
    inputs: i32,
    outputs: i32,
    params: i32,
    programs: i32,
}

fn build(host: HostCallbackProc, shape: Shape) -> *mut AEffect {
    let state = Arc::new(FakeState {
        name: shape.name,
        vendor: shape.vendor,
        category: shape.category,
        synth: shape.flags & flags::IS_SYNTH != 0,
        host,
        calls: Mutex::new(Vec::new()),
        program: AtomicI32::new(0),
        editor_open: AtomicBool::new(false),
        rect: ERect {
            top: 0,
            left: 0,
            bottom: 300,
            right: 640,
        },
        chunk: Mutex::new(b"initial".to_vec()),
        params: Mutex::new(vec![0.0; shape.params as usize]),
        next_sub: AtomicUsize::new(0),
        closed: AtomicBool::new(false),
    });

    Box::into_raw(Box::new(AEffect {
        magic: EFFECT_MAGIC,
        dispatcher: Some(dispatcher),
        process: None,
        set_parameter: Some(set_parameter),
        get_parameter: Some(get_parameter),
        num_programs: shape.programs,
        num_params: shape.params,
        num_inputs: shape.inputs,
        num_outputs: shape.outputs,
        flags: shape.flags,
        resvd1: 0,
        resvd2: 0,
        initial_delay: 0,
        real_qualities: 0,
        off_qualities: 0,
        io_ratio: 1.0,
        object: Arc::into_raw(state) as *mut c_void,
        user: std::ptr::null_mut(),
        unique_id: shape.unique_id,
        version: 1,
        process_replacing: Some(process_replacing),
        process_double_replacing: None,
        future: [0; 56],
    }))
}

/// Stereo effect with an editor and 12 parameters.
pub unsafe extern "C" fn reverb_entry(host: HostCallbackProc) -> *mut AEffect {
    build(
        host,
        Shape {
            name: "Reverb",
            vendor: "Acme Audio",
            category: category::EFFECT,
            flags: flags::HAS_EDITOR | flags::CAN_REPLACING | flags::PROGRAM_CHUNKS,
            unique_id: REVERB_ID,
            inputs: 2,
            outputs: 2,
            params: 12,
            programs: 8,
        },
    )
}

/// Mono effect without an editor.
pub unsafe extern "C" fn plain_entry(host: HostCallbackProc) -> *mut AEffect {
    build(
        host,
        Shape {
            name: "Gain",
            vendor: "Acme Audio",
            category: category::EFFECT,
            flags: flags::CAN_REPLACING,
            unique_id: i32::from_be_bytes(*b"Gain"),
            inputs: 1,
            outputs: 1,
            params: 1,
            programs: 1,
        },
    )
}

/// A shell containing three plugins.  The host's current-ID answer picks
/// which one the entry point builds.
pub unsafe extern "C" fn shell_entry(host: HostCallbackProc) -> *mut AEffect {
    let id = unsafe {
        host(
            std::ptr::null_mut(),
            HostOpcode::CurrentId.raw(),
            0,
            0,
            std::ptr::null_mut(),
            0.0,
        )
    } as i32;

    if id == 0 {
        return build(
            host,
            Shape {
                name: "Bundle",
                vendor: "Bundle Co",
                category: category::SHELL,
                flags: 0,
                unique_id: SHELL_ID,
                inputs: 0,
                outputs: 0,
                params: 0,
                programs: 0,
            },
        );
    }

    let synth = id == SHELL_SUB_IDS[2];
    build(
        host,
        Shape {
            name: "Bundle",
            vendor: "Bundle Co",
            category: if synth { category::SYNTH } else { category::EFFECT },
            flags: if synth {
                flags::IS_SYNTH | flags::CAN_REPLACING
            } else {
                flags::CAN_REPLACING
            },
            unique_id: id,
            inputs: if synth { 0 } else { 2 },
            outputs: 2,
            params: 2,
            programs: 1,
        },
    )
}

/// Returns a table without the magic number.
pub unsafe extern "C" fn bad_magic_entry(host: HostCallbackProc) -> *mut AEffect {
    let effect = build(
        host,
        Shape {
            name: "Broken",
            vendor: "",
            category: 0,
            flags: 0,
            unique_id: 0,
            inputs: 0,
            outputs: 0,
            params: 0,
            programs: 0,
        },
    );
    unsafe { (*effect).magic = 0 };
    effect
}

pub unsafe extern "C" fn null_entry(_host: HostCallbackProc) -> *mut AEffect {
    std::ptr::null_mut()
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Create an (empty) module file so cache timestamps have something to
/// compare against, and register its entry point under that path.
pub fn install(loader: &StaticLoader, dir: &Path, file: &str, entry: EntryProc) -> PathBuf {
    let path = dir.join(file);
    std::fs::write(&path, b"").unwrap();
    let name = path.file_stem().unwrap().to_string_lossy().into_owned();
    loader.register(&path, name, entry);
    path
}

pub fn fast_editor_config() -> EditorConfig {
    EditorConfig {
        poll_interval_ms: 1,
        idle_interval_ms: 5,
        open_timeout_ms: 2000,
        editor_open_settle_ms: 0,
    }
}

pub fn headless_engine(config: EditorConfig) -> (EditorEngine, Arc<HeadlessProbe>) {
    let probe = Arc::new(HeadlessProbe::default());
    let windows_probe = probe.clone();
    let engine = EditorEngine::spawn(config, None, move || {
        Ok(Box::new(HeadlessWindows::new(windows_probe)) as Box<dyn WindowSystem>)
    })
    .unwrap();
    (engine, probe)
}

/// Poll `check` until it holds or a second passes.
pub fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    check()
}
