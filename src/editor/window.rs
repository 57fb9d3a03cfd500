//! Native window backends driven by the editor engine thread.

use std::collections::{HashSet, VecDeque};
use std::ffi::c_void;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

/// Platform window ID (an X11 `Window` on Linux).  Zero is never valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowHandle(pub u64);

impl WindowHandle {
    pub fn raw(self) -> u64 {
        self.0
    }

    /// The form the plugin receives as the `EditOpen` pointer argument.
    pub fn as_ptr(self) -> *mut c_void {
        self.0 as usize as *mut c_void
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowEvent {
    /// The synthetic "window is real" event posted by `request_activation`
    /// has come back through the queue.
    LaunchEditor(WindowHandle),
    /// The host (or window manager) changed the window size.
    Configure {
        window: WindowHandle,
        width: i32,
        height: i32,
    },
}

/// A window server connection.
///
/// Only ever touched from the editor engine thread, so implementations do
/// not need to be `Send`.
pub trait WindowSystem {
    /// Passed to the plugin as the `EditOpen` value argument.
    fn display_handle(&self) -> isize;

    fn create_window(&mut self, width: i32, height: i32) -> Result<WindowHandle, String>;

    /// Post a `LaunchEditor` event for `window` into this system's own
    /// queue, to be delivered once the server knows about the window.
    fn request_activation(&mut self, window: WindowHandle) -> Result<(), String>;

    fn resize_window(&mut self, window: WindowHandle, width: i32, height: i32);

    fn destroy_window(&mut self, window: WindowHandle);

    /// Next pending event, without blocking.
    fn next_event(&mut self) -> Option<WindowEvent>;
}

// ---------------------------------------------------------------------------
// Headless backend
// ---------------------------------------------------------------------------

/// Counters and an event injector shared with a [`HeadlessWindows`].
#[derive(Debug, Default)]
pub struct HeadlessProbe {
    pub created: AtomicUsize,
    pub destroyed: AtomicUsize,
    pub resized: AtomicUsize,
    /// Destroy requests for a window that was not alive.
    pub double_destroys: AtomicUsize,
    injected: Mutex<VecDeque<WindowEvent>>,
}

impl HeadlessProbe {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn resized(&self) -> usize {
        self.resized.load(Ordering::SeqCst)
    }

    pub fn double_destroys(&self) -> usize {
        self.double_destroys.load(Ordering::SeqCst)
    }

    /// Queue an event as if the window server had sent it.
    pub fn inject(&self, event: WindowEvent) {
        self.injected.lock().push_back(event);
    }
}

/// Window system with no server behind it.  Windows are plain IDs; used
/// where no display is available.
pub struct HeadlessWindows {
    next_id: u64,
    live: HashSet<u64>,
    events: VecDeque<WindowEvent>,
    probe: Arc<HeadlessProbe>,
    fail_create: bool,
    launch: bool,
}

impl HeadlessWindows {
    pub fn new(probe: Arc<HeadlessProbe>) -> Self {
        Self {
            next_id: 0x40_0000,
            live: HashSet::new(),
            events: VecDeque::new(),
            probe,
            fail_create: false,
            launch: true,
        }
    }

    /// A backend whose window creation always fails.
    pub fn failing(probe: Arc<HeadlessProbe>) -> Self {
        Self {
            fail_create: true,
            ..Self::new(probe)
        }
    }

    /// A backend that creates windows but never reports one as mapped, so
    /// no editor is ever launched.
    pub fn silent(probe: Arc<HeadlessProbe>) -> Self {
        Self {
            launch: false,
            ..Self::new(probe)
        }
    }
}

impl WindowSystem for HeadlessWindows {
    fn display_handle(&self) -> isize {
        0
    }

    fn create_window(&mut self, _width: i32, _height: i32) -> Result<WindowHandle, String> {
        if self.fail_create {
            return Err("window creation disabled".to_string());
        }
        self.next_id += 1;
        self.live.insert(self.next_id);
        self.probe.created.fetch_add(1, Ordering::SeqCst);
        Ok(WindowHandle(self.next_id))
    }

    fn request_activation(&mut self, window: WindowHandle) -> Result<(), String> {
        if !self.live.contains(&window.0) {
            return Err(format!("unknown window {:#x}", window.0));
        }
        if self.launch {
            self.events.push_back(WindowEvent::LaunchEditor(window));
        }
        Ok(())
    }

    fn resize_window(&mut self, window: WindowHandle, _width: i32, _height: i32) {
        if self.live.contains(&window.0) {
            self.probe.resized.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn destroy_window(&mut self, window: WindowHandle) {
        if self.live.remove(&window.0) {
            self.probe.destroyed.fetch_add(1, Ordering::SeqCst);
        } else {
            log::error!("editor: destroy of unknown window {:#x}", window.0);
            self.probe.double_destroys.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn next_event(&mut self) -> Option<WindowEvent> {
        if let Some(event) = self.probe.injected.lock().pop_front() {
            return Some(event);
        }
        self.events.pop_front()
    }
}
