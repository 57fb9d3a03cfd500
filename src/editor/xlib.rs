//! Xlib window backend.
//!
//! libX11 is opened at runtime rather than linked, so hosts without X can
//! still load this crate (they just cannot start an X11 editor engine).
//! Events are read into a raw 192-byte `XEvent` buffer and decoded by
//! offset (64-bit layout).

use std::collections::HashMap;
use std::ffi::{CString, c_char, c_int, c_long, c_uchar, c_ulong, c_void};
use std::path::Path;

use crate::error::{BridgeError, Result};
use crate::module::LibraryHandle;

use super::window::{WindowEvent, WindowHandle, WindowSystem};

const LIBX11_NAMES: &[&str] = &["libX11.so.6", "libX11.so"];

const REPARENT_NOTIFY: i32 = 21;
const CONFIGURE_NOTIFY: i32 = 22;
const CLIENT_MESSAGE: i32 = 33;

const STRUCTURE_NOTIFY_MASK: c_long = 1 << 17;
const SUBSTRUCTURE_NOTIFY_MASK: c_long = 1 << 19;

/// Payload of the synthetic "launch editor" client message.
const LAUNCH_EDITOR_MAGIC: c_long = 0x0FEE_DBAC;

type XEventBuf = [u8; 192];

// XAnyEvent / XClientMessageEvent / XConfigureEvent / XReparentEvent offsets.
const OFF_WINDOW: usize = 32;
const OFF_MESSAGE_TYPE: usize = 40;
const OFF_FORMAT: usize = 48;
const OFF_DATA_L0: usize = 56;
const OFF_CONFIGURE_WINDOW: usize = 40;
const OFF_CONFIGURE_WIDTH: usize = 56;
const OFF_CONFIGURE_HEIGHT: usize = 60;
const OFF_REPARENT_WINDOW: usize = 40;
const OFF_REPARENT_PARENT: usize = 48;

type PluginEventProc = unsafe extern "C" fn(event: *mut XEventBuf);

#[allow(clippy::type_complexity)]
struct XlibFns {
    open_display: unsafe extern "C" fn(*const c_char) -> *mut c_void,
    close_display: unsafe extern "C" fn(*mut c_void) -> c_int,
    default_root_window: unsafe extern "C" fn(*mut c_void) -> c_ulong,
    create_simple_window: unsafe extern "C" fn(
        *mut c_void,
        c_ulong,
        c_int,
        c_int,
        c_int,
        c_int,
        c_int,
        c_ulong,
        c_ulong,
    ) -> c_ulong,
    select_input: unsafe extern "C" fn(*mut c_void, c_ulong, c_long) -> c_int,
    intern_atom: unsafe extern "C" fn(*mut c_void, *const c_char, c_int) -> c_ulong,
    send_event: unsafe extern "C" fn(*mut c_void, c_ulong, c_int, c_long, *mut XEventBuf) -> c_int,
    flush: unsafe extern "C" fn(*mut c_void) -> c_int,
    pending: unsafe extern "C" fn(*mut c_void) -> c_int,
    next_event: unsafe extern "C" fn(*mut c_void, *mut XEventBuf) -> c_int,
    resize_window: unsafe extern "C" fn(*mut c_void, c_ulong, c_int, c_int) -> c_int,
    move_window: unsafe extern "C" fn(*mut c_void, c_ulong, c_int, c_int) -> c_int,
    destroy_window: unsafe extern "C" fn(*mut c_void, c_ulong) -> c_int,
    get_window_property: unsafe extern "C" fn(
        *mut c_void,
        c_ulong,
        c_ulong,
        c_long,
        c_long,
        c_int,
        c_ulong,
        *mut c_ulong,
        *mut c_int,
        *mut c_ulong,
        *mut c_ulong,
        *mut *mut c_uchar,
    ) -> c_int,
    free: unsafe extern "C" fn(*mut c_void) -> c_int,
}

fn resolve<T: Copy>(lib: &LibraryHandle, name: &str) -> Result<T> {
    let symbol = format!("{}\0", name);
    let ptr = lib
        .symbol(symbol.as_bytes())
        .ok_or_else(|| BridgeError::load_failed(LIBX11_NAMES[0], format!("missing {}", name)))?;
    // SAFETY: T is the documented signature of the Xlib function `name`.
    Ok(unsafe { std::mem::transmute_copy::<*mut c_void, T>(&ptr) })
}

impl XlibFns {
    fn load(lib: &LibraryHandle) -> Result<Self> {
        Ok(Self {
            open_display: resolve(lib, "XOpenDisplay")?,
            close_display: resolve(lib, "XCloseDisplay")?,
            default_root_window: resolve(lib, "XDefaultRootWindow")?,
            create_simple_window: resolve(lib, "XCreateSimpleWindow")?,
            select_input: resolve(lib, "XSelectInput")?,
            intern_atom: resolve(lib, "XInternAtom")?,
            send_event: resolve(lib, "XSendEvent")?,
            flush: resolve(lib, "XFlush")?,
            pending: resolve(lib, "XPending")?,
            next_event: resolve(lib, "XNextEvent")?,
            resize_window: resolve(lib, "XResizeWindow")?,
            move_window: resolve(lib, "XMoveWindow")?,
            destroy_window: resolve(lib, "XDestroyWindow")?,
            get_window_property: resolve(lib, "XGetWindowProperty")?,
            free: resolve(lib, "XFree")?,
        })
    }
}

fn read<T: Copy>(event: &XEventBuf, offset: usize) -> T {
    debug_assert!(offset + std::mem::size_of::<T>() <= event.len());
    unsafe { std::ptr::read_unaligned(event.as_ptr().add(offset) as *const T) }
}

fn write<T: Copy>(event: &mut XEventBuf, offset: usize, value: T) {
    debug_assert!(offset + std::mem::size_of::<T>() <= event.len());
    unsafe { std::ptr::write_unaligned(event.as_mut_ptr().add(offset) as *mut T, value) }
}

/// The window the plugin reparented into one of ours.
#[derive(Default)]
struct PluginChild {
    window: c_ulong,
    event_proc: Option<PluginEventProc>,
}

pub struct XlibWindowSystem {
    x: XlibFns,
    display: *mut c_void,
    root: c_ulong,
    launch_atom: c_ulong,
    event_proc_atom: c_ulong,
    /// Our top-level editor windows and what the plugin put inside them.
    windows: HashMap<c_ulong, PluginChild>,
    // Declared last: dropped after the display is closed.
    _lib: LibraryHandle,
}

impl XlibWindowSystem {
    /// Open libX11 and connect to the default display.
    pub fn open() -> Result<Self> {
        let lib = LIBX11_NAMES
            .iter()
            .find_map(|name| LibraryHandle::open(Path::new(name)).ok())
            .ok_or_else(|| BridgeError::load_failed(LIBX11_NAMES[0], "libX11 not found"))?;
        let x = XlibFns::load(&lib)?;

        let display = unsafe { (x.open_display)(std::ptr::null()) };
        if display.is_null() {
            return Err(BridgeError::EditorCreateFailed(
                "cannot open X display".to_string(),
            ));
        }

        let root = unsafe { (x.default_root_window)(display) };
        let launch_atom = intern(&x, display, "LaunchEditor");
        let event_proc_atom = intern(&x, display, "_XEventProc");
        log::info!("editor: connected to X display");

        Ok(Self {
            x,
            display,
            root,
            launch_atom,
            event_proc_atom,
            windows: HashMap::new(),
            _lib: lib,
        })
    }

    fn read_event_proc(&self, child: c_ulong) -> Option<PluginEventProc> {
        let mut actual_type: c_ulong = 0;
        let mut actual_format: c_int = 0;
        let mut items: c_ulong = 0;
        let mut bytes_after: c_ulong = 0;
        let mut data: *mut c_uchar = std::ptr::null_mut();
        let status = unsafe {
            (self.x.get_window_property)(
                self.display,
                child,
                self.event_proc_atom,
                0,
                2,
                0,
                0, // AnyPropertyType
                &mut actual_type,
                &mut actual_format,
                &mut items,
                &mut bytes_after,
                &mut data,
            )
        };
        if status != 0 || data.is_null() {
            return None;
        }
        let proc_ptr = if items > 0 {
            unsafe { std::ptr::read_unaligned(data as *const *mut c_void) }
        } else {
            std::ptr::null_mut()
        };
        unsafe { (self.x.free)(data as *mut c_void) };
        if proc_ptr.is_null() {
            None
        } else {
            Some(unsafe { std::mem::transmute::<*mut c_void, PluginEventProc>(proc_ptr) })
        }
    }

    /// Handle one raw event; returns the engine-level event if there is one.
    fn translate(&mut self, event: &mut XEventBuf) -> Option<WindowEvent> {
        let kind: i32 = read(event, 0);
        let any_window: c_ulong = read(event, OFF_WINDOW);

        match kind {
            CLIENT_MESSAGE => {
                let message_type: c_ulong = read(event, OFF_MESSAGE_TYPE);
                let payload: c_long = read(event, OFF_DATA_L0);
                if message_type == self.launch_atom && payload == LAUNCH_EDITOR_MAGIC {
                    return Some(WindowEvent::LaunchEditor(WindowHandle(any_window as u64)));
                }
            }
            CONFIGURE_NOTIFY => {
                let window: c_ulong = read(event, OFF_CONFIGURE_WINDOW);
                if let Some(child) = self.windows.get(&window) {
                    let width: c_int = read(event, OFF_CONFIGURE_WIDTH);
                    let height: c_int = read(event, OFF_CONFIGURE_HEIGHT);
                    if child.window != 0 {
                        // Keep the plugin's own window at the origin.
                        unsafe { (self.x.move_window)(self.display, child.window, 0, 0) };
                    }
                    return Some(WindowEvent::Configure {
                        window: WindowHandle(window as u64),
                        width,
                        height,
                    });
                }
            }
            REPARENT_NOTIFY => {
                let child: c_ulong = read(event, OFF_REPARENT_WINDOW);
                let parent: c_ulong = read(event, OFF_REPARENT_PARENT);
                if self.windows.contains_key(&parent) {
                    let event_proc = self.read_event_proc(child);
                    log::debug!(
                        "editor: plugin window {:#x} in {:#x} (event proc: {})",
                        child,
                        parent,
                        event_proc.is_some()
                    );
                    self.windows.insert(
                        parent,
                        PluginChild {
                            window: child,
                            event_proc,
                        },
                    );
                }
            }
            _ => {}
        }

        // Plugins that install an _XEventProc expect the host to pump
        // their window's events into it.
        let target = self
            .windows
            .values()
            .find(|c| c.window != 0 && c.window == any_window)
            .and_then(|c| c.event_proc);
        if let Some(event_proc) = target {
            unsafe { event_proc(event) };
        }
        None
    }
}

fn intern(x: &XlibFns, display: *mut c_void, name: &str) -> c_ulong {
    match CString::new(name) {
        Ok(c_name) => unsafe { (x.intern_atom)(display, c_name.as_ptr(), 0) },
        Err(_) => 0,
    }
}

impl WindowSystem for XlibWindowSystem {
    fn display_handle(&self) -> isize {
        self.display as isize
    }

    fn create_window(&mut self, width: i32, height: i32) -> std::result::Result<WindowHandle, String> {
        let window = unsafe {
            (self.x.create_simple_window)(
                self.display,
                self.root,
                0,
                0,
                width.max(1),
                height.max(1),
                0,
                0,
                0,
            )
        };
        if window == 0 {
            return Err("XCreateSimpleWindow failed".to_string());
        }
        unsafe {
            (self.x.select_input)(
                self.display,
                window,
                STRUCTURE_NOTIFY_MASK | SUBSTRUCTURE_NOTIFY_MASK,
            );
            (self.x.flush)(self.display);
        }
        self.windows.insert(window, PluginChild::default());
        Ok(WindowHandle(window as u64))
    }

    fn request_activation(&mut self, window: WindowHandle) -> std::result::Result<(), String> {
        let mut event: XEventBuf = [0; 192];
        write(&mut event, 0, CLIENT_MESSAGE);
        write(&mut event, OFF_WINDOW, window.0 as c_ulong);
        write(&mut event, OFF_MESSAGE_TYPE, self.launch_atom);
        write(&mut event, OFF_FORMAT, 32 as c_int);
        write(&mut event, OFF_DATA_L0, LAUNCH_EDITOR_MAGIC);

        let status = unsafe {
            (self.x.send_event)(self.display, window.0 as c_ulong, 0, 0, &mut event)
        };
        unsafe { (self.x.flush)(self.display) };
        if status == 0 {
            return Err("XSendEvent failed".to_string());
        }
        Ok(())
    }

    fn resize_window(&mut self, window: WindowHandle, width: i32, height: i32) {
        unsafe {
            (self.x.resize_window)(self.display, window.0 as c_ulong, width.max(1), height.max(1));
            (self.x.flush)(self.display);
        }
    }

    fn destroy_window(&mut self, window: WindowHandle) {
        if self.windows.remove(&(window.0 as c_ulong)).is_none() {
            log::warn!("editor: destroy of unknown window {:#x}", window.0);
            return;
        }
        unsafe {
            (self.x.destroy_window)(self.display, window.0 as c_ulong);
            (self.x.flush)(self.display);
        }
    }

    fn next_event(&mut self) -> Option<WindowEvent> {
        loop {
            if unsafe { (self.x.pending)(self.display) } <= 0 {
                return None;
            }
            let mut event: XEventBuf = [0; 192];
            unsafe { (self.x.next_event)(self.display, &mut event) };
            if let Some(translated) = self.translate(&mut event) {
                return Some(translated);
            }
        }
    }
}

impl Drop for XlibWindowSystem {
    fn drop(&mut self) {
        for (&window, _) in self.windows.iter() {
            unsafe { (self.x.destroy_window)(self.display, window) };
        }
        unsafe { (self.x.close_display)(self.display) };
    }
}
