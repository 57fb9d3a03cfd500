//! Editor window engine.
//!
//! One thread per engine owns the window system connection.  It is the only
//! thread that creates, resizes or destroys editor windows.  Callers on any
//! other thread register an instance, then block on the instance's condvar
//! until the engine reports the window as activated or gone.
//!
//! Every engine pass (`idle_interval_ms`) the thread walks the registered
//! instances: services create/destroy requests, drains each instance's
//! command queue and sends the editor idle opcodes.  Between passes it polls
//! the window system for events every `poll_interval_ms`.
//!
//! Locking: the slot list mutex is always taken before an instance's editor
//! mutex, never the other way round.  Neither is held across a call into the
//! plugin, so a plugin may call back into the host (and the host into the
//! engine) from inside any opcode the engine sends.  Engine calls made on
//! the engine thread itself run inline instead of waiting on the queue.

pub mod arena;
mod command;
pub mod window;
pub mod xlib;

use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};

use crate::abi::{KeyEvent, Opcode};
use crate::bridge::{DispatchCall, PluginInstance};
use crate::config::EditorConfig;
use crate::error::{BridgeError, Result};

use arena::{SlotArena, SlotKey};
use command::{CommandReceiver, CommandSender, EditorCommand};
pub use window::{HeadlessProbe, HeadlessWindows, WindowEvent, WindowHandle, WindowSystem};
pub use xlib::XlibWindowSystem;

/// How often a blocked caller re-checks that the engine is still alive.
const LIVENESS_CHECK: Duration = Duration::from_millis(100);

thread_local! {
    static ON_ENGINE_THREAD: Cell<bool> = const { Cell::new(false) };
}

fn on_engine_thread() -> bool {
    ON_ENGINE_THREAD.with(Cell::get)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EditorState {
    #[default]
    NoWindow,
    /// Registered; the engine has not created the window yet.
    PendingCreate,
    /// Window exists, waiting for the launch event to open the editor.
    Created,
    Activated,
    /// Teardown requested; the engine closes it on its next pass.
    PendingDestroy,
    Gone,
}

/// Per-instance editor bookkeeping, guarded by the instance's editor mutex.
#[derive(Default)]
pub(crate) struct EditorLink {
    pub(crate) state: EditorState,
    pub(crate) window: Option<WindowHandle>,
    /// The plugin has been told to open its editor in `window`.
    pub(crate) activated: bool,
    pub(crate) destroy: bool,
    pub(crate) commands: Option<CommandSender>,
    pub(crate) engine_alive: Option<Arc<AtomicBool>>,
    pub(crate) wants_idle: bool,
    pub(crate) size: (i32, i32),
    pub(crate) resize_request: Option<(i32, i32)>,
    pub(crate) current_program: Option<i32>,
}

impl EditorLink {
    fn is_idle(&self) -> bool {
        matches!(self.state, EditorState::NoWindow | EditorState::Gone)
    }

    fn request_destroy(&mut self) {
        self.destroy = true;
        self.state = EditorState::PendingDestroy;
    }

    fn mark_gone(&mut self) {
        self.state = EditorState::Gone;
        self.window = None;
        self.activated = false;
        self.destroy = false;
        self.commands = None;
        self.engine_alive = None;
        self.resize_request = None;
    }

    fn engine_alive(&self) -> bool {
        self.engine_alive
            .as_ref()
            .is_some_and(|alive| alive.load(Ordering::SeqCst))
    }
}

/// Receives size changes of editor windows, on the engine thread.
pub trait EditorObserver: Send + Sync {
    fn on_resize_requested(&self, instance: &PluginInstance, width: i32, height: i32);
}

struct Slot {
    instance: PluginInstance,
    commands: CommandReceiver,
}

struct EngineShared {
    slots: Mutex<SlotArena<Slot>>,
    running: AtomicBool,
    /// Cleared once the thread has torn every window down.
    alive: Arc<AtomicBool>,
    config: EditorConfig,
    observer: Option<Arc<dyn EditorObserver>>,
}

pub struct EditorEngine {
    shared: Arc<EngineShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl EditorEngine {
    /// Start the engine thread.  `factory` runs on that thread and builds
    /// the window system it will own.
    pub fn spawn<F>(
        config: EditorConfig,
        observer: Option<Arc<dyn EditorObserver>>,
        factory: F,
    ) -> Result<Self>
    where
        F: FnOnce() -> Result<Box<dyn WindowSystem>> + Send + 'static,
    {
        let shared = Arc::new(EngineShared {
            slots: Mutex::new(SlotArena::new()),
            running: AtomicBool::new(true),
            alive: Arc::new(AtomicBool::new(true)),
            config,
            observer,
        });

        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
        let thread_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name("fxbridge-editor".to_string())
            .spawn(move || {
                let windows = match factory() {
                    Ok(windows) => windows,
                    Err(e) => {
                        thread_shared.running.store(false, Ordering::SeqCst);
                        thread_shared.alive.store(false, Ordering::SeqCst);
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                ON_ENGINE_THREAD.with(|flag| flag.set(true));
                run_engine(&thread_shared, windows);
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = handle.join();
                return Err(BridgeError::EngineStopped);
            }
        }

        log::info!("editor: engine thread started");
        Ok(Self {
            shared,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Start an engine on the default X display.
    pub fn spawn_x11(
        config: EditorConfig,
        observer: Option<Arc<dyn EditorObserver>>,
    ) -> Result<Self> {
        Self::spawn(config, observer, || {
            XlibWindowSystem::open().map(|x| Box::new(x) as Box<dyn WindowSystem>)
        })
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Number of instances currently registered with the engine.
    pub fn registered(&self) -> usize {
        self.shared.slots.lock().len()
    }

    /// Open the plugin's editor and return its window.
    ///
    /// Blocks until the engine has created the window and opened the editor
    /// in it, or `open_timeout_ms` passes.  On timeout the half-open window
    /// is scheduled for teardown and the instance should be treated as
    /// having no editor.
    pub fn open_editor(&self, instance: &PluginInstance) -> Result<WindowHandle> {
        if !instance.has_editor() {
            return Err(BridgeError::EditorUnavailable(instance.name().to_string()));
        }
        if instance.is_closed() {
            return Err(BridgeError::EditorCreateFailed(instance.name().to_string()));
        }
        if !self.is_running() {
            return Err(BridgeError::EngineStopped);
        }
        if on_engine_thread() {
            // The engine thread cannot wait on itself.
            let link = instance.editor_link().lock();
            return match (link.state, link.window) {
                (EditorState::Activated, Some(window)) => Ok(window),
                _ => Err(BridgeError::EditorCreateFailed(instance.name().to_string())),
            };
        }

        let deadline = Instant::now() + self.shared.config.open_timeout();
        loop {
            let mut slots = self.shared.slots.lock();
            let mut link = instance.editor_link().lock();
            match link.state {
                EditorState::Activated => {
                    if let Some(window) = link.window {
                        return Ok(window);
                    }
                }
                EditorState::PendingDestroy => {
                    drop(slots);
                    wait_until_gone(instance, &mut link);
                    continue;
                }
                EditorState::NoWindow | EditorState::Gone => {
                    self.register(&mut slots, instance, &mut link);
                }
                EditorState::PendingCreate | EditorState::Created => {}
            }
            drop(slots);
            return wait_for_activation(instance, &mut link, deadline);
        }
    }

    fn register(&self, slots: &mut SlotArena<Slot>, instance: &PluginInstance, link: &mut EditorLink) {
        let (tx, rx) = command::queue();
        slots.insert(Slot {
            instance: instance.clone(),
            commands: rx,
        });
        link.state = EditorState::PendingCreate;
        link.window = None;
        link.activated = false;
        link.destroy = false;
        link.commands = Some(tx);
        link.engine_alive = Some(self.shared.alive.clone());
        log::debug!("editor: {} registered", instance.name());
    }

    /// Close the editor and wait until the engine has destroyed the window.
    /// Concurrent callers all return once the instance is `Gone`.
    pub fn close_editor(&self, instance: &PluginInstance) -> Result<()> {
        force_teardown(instance);
        Ok(())
    }

    pub fn editor_state(&self, instance: &PluginInstance) -> EditorState {
        instance.editor_link().lock().state
    }

    /// The editor window, once the plugin has been shown in it.
    pub fn native_window_handle(&self, instance: &PluginInstance) -> Option<WindowHandle> {
        let link = instance.editor_link().lock();
        match link.state {
            EditorState::Activated => link.window,
            _ => None,
        }
    }

    /// Current editor size, as last reported by the plugin or the host.
    pub fn editor_size(&self, instance: &PluginInstance) -> Option<(i32, i32)> {
        let link = instance.editor_link().lock();
        (link.state == EditorState::Activated).then_some(link.size)
    }

    /// Take the last window size change, if one arrived since the last call.
    pub fn take_resize_request(&self, instance: &PluginInstance) -> Option<(i32, i32)> {
        instance.editor_link().lock().resize_request.take()
    }

    /// Program the plugin reported after the last `set_program`.
    pub fn current_program(&self, instance: &PluginInstance) -> Option<i32> {
        instance.editor_link().lock().current_program
    }

    /// Ask the engine to call the plugin's generic idle opcode every pass.
    pub fn set_wants_idle(&self, instance: &PluginInstance, wants_idle: bool) {
        instance.editor_link().lock().wants_idle = wants_idle;
    }

    pub fn set_program(&self, instance: &PluginInstance, program: i32) {
        run_or_queue(instance, EditorCommand::SetProgram(program));
    }

    pub fn set_chunk(&self, instance: &PluginInstance, data: Vec<u8>, preset: bool) {
        run_or_queue(instance, EditorCommand::SetChunk { data, preset });
    }

    pub fn forward_key_event(&self, instance: &PluginInstance, event: KeyEvent) {
        run_or_queue(instance, EditorCommand::Key(event));
    }

    /// Issue a dispatcher call from the editor thread and wait for its
    /// result.  Runs on the calling thread if no editor is registered, or if
    /// that already is the editor thread.
    pub fn call_deferred(&self, instance: &PluginInstance, call: DispatchCall) -> Result<isize> {
        let (reply, result) = mpsc::sync_channel(1);
        run_or_queue(instance, EditorCommand::Dispatch { call, reply });
        result.recv().map_err(|_| BridgeError::EngineStopped)
    }

    /// Dispatch `call`, sending opcodes that belong to the editor thread
    /// through the engine and everything else straight to the plugin.
    pub fn dispatch(&self, instance: &PluginInstance, call: DispatchCall) -> Result<isize> {
        if call.opcode.is_editor_affine() {
            self.call_deferred(instance, call)
        } else {
            Ok(instance.dispatch(call))
        }
    }

    /// Stop the thread, tearing down every remaining editor.
    pub fn shutdown(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("editor: engine thread panicked");
            }
        }
    }
}

impl Drop for EditorEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Caller-side helpers
// ---------------------------------------------------------------------------

fn run_or_queue(instance: &PluginInstance, command: EditorCommand) {
    let command = if on_engine_thread() {
        command
    } else {
        let link = instance.editor_link().lock();
        match link.commands.as_ref() {
            Some(tx) => match tx.send(command) {
                Ok(()) => return,
                Err(mpsc::SendError(command)) => command,
            },
            None => command,
        }
    };
    command.execute(instance);
}

fn wait_until_gone(instance: &PluginInstance, link: &mut MutexGuard<'_, EditorLink>) {
    while !link.is_idle() {
        if !link.engine_alive() {
            link.mark_gone();
            instance.editor_changed().notify_all();
            break;
        }
        instance.editor_changed().wait_for(link, LIVENESS_CHECK);
    }
}

fn wait_for_activation(
    instance: &PluginInstance,
    link: &mut MutexGuard<'_, EditorLink>,
    deadline: Instant,
) -> Result<WindowHandle> {
    loop {
        match (link.state, link.window) {
            (EditorState::Activated, Some(window)) => return Ok(window),
            (EditorState::NoWindow | EditorState::Gone, _) => {
                return Err(BridgeError::EditorCreateFailed(instance.name().to_string()));
            }
            _ => {}
        }
        if !link.engine_alive() {
            link.mark_gone();
            instance.editor_changed().notify_all();
            return Err(BridgeError::EngineStopped);
        }
        let now = Instant::now();
        if now >= deadline {
            log::warn!("editor: timed out opening editor for {}", instance.name());
            link.request_destroy();
            return Err(BridgeError::EditorCreateFailed(instance.name().to_string()));
        }
        instance
            .editor_changed()
            .wait_until(link, deadline.min(now + LIVENESS_CHECK));
    }
}

/// Request teardown and block until the engine reports the window gone.
pub(crate) fn force_teardown(instance: &PluginInstance) {
    let mut link = instance.editor_link().lock();
    if link.is_idle() {
        return;
    }
    if !link.destroy {
        link.request_destroy();
    }
    if on_engine_thread() {
        log::debug!("editor: {} closed from a plugin callback", instance.name());
        return;
    }
    wait_until_gone(instance, &mut link);
}

// ---------------------------------------------------------------------------
// Engine thread
// ---------------------------------------------------------------------------

fn run_engine(shared: &EngineShared, mut windows: Box<dyn WindowSystem>) {
    let poll = shared.config.poll_interval();
    let idle = shared.config.idle_interval();
    let mut last_pass: Option<Instant> = None;

    while shared.running.load(Ordering::SeqCst) {
        while let Some(event) = windows.next_event() {
            handle_event(shared, windows.as_mut(), event);
        }
        if last_pass.is_none_or(|t| t.elapsed() >= idle) {
            service_pass(shared, windows.as_mut());
            last_pass = Some(Instant::now());
        }
        std::thread::sleep(poll);
    }

    teardown_all(shared, windows.as_mut());
    shared.alive.store(false, Ordering::SeqCst);
    log::info!("editor: engine thread stopped");
}

fn service_pass(shared: &EngineShared, windows: &mut dyn WindowSystem) {
    let work: Vec<(SlotKey, PluginInstance, Vec<EditorCommand>)> = shared
        .slots
        .lock()
        .iter()
        .map(|(key, slot)| {
            (key, slot.instance.clone(), command::take_pending(&slot.commands))
        })
        .collect();

    for (key, instance, commands) in work {
        service_instance(shared, windows, key, &instance, commands);
    }
}

fn service_instance(
    shared: &EngineShared,
    windows: &mut dyn WindowSystem,
    key: SlotKey,
    instance: &PluginInstance,
    commands: Vec<EditorCommand>,
) {
    let (destroy, create) = {
        let link = instance.editor_link().lock();
        let create = link.state == EditorState::PendingCreate && link.window.is_none();
        (link.destroy, create)
    };

    if destroy {
        command::run_all(commands, instance);
        destroy_editor(windows, instance);
        retire(shared, key, instance);
        return;
    }

    if create {
        match create_window(windows) {
            Ok(window) => {
                let mut link = instance.editor_link().lock();
                link.window = Some(window);
                // A caller that gave up meanwhile has already asked for
                // teardown; the next pass destroys the window.
                if !link.destroy {
                    link.state = EditorState::Created;
                }
            }
            Err(reason) => {
                log::warn!("editor: cannot create window for {}: {}", instance.name(), reason);
                command::run_all(commands, instance);
                retire(shared, key, instance);
                return;
            }
        }
    }

    command::run_all(commands, instance);

    let (activated, wants_idle) = {
        let link = instance.editor_link().lock();
        (link.state == EditorState::Activated, link.wants_idle)
    };
    if activated {
        instance.dispatch(DispatchCall::new(Opcode::EditIdle));
    }
    if wants_idle {
        instance.dispatch(DispatchCall::new(Opcode::Idle));
    }
}

fn create_window(windows: &mut dyn WindowSystem) -> std::result::Result<WindowHandle, String> {
    let window = windows.create_window(1, 1)?;
    if let Err(e) = windows.request_activation(window) {
        windows.destroy_window(window);
        return Err(e);
    }
    Ok(window)
}

fn destroy_editor(windows: &mut dyn WindowSystem, instance: &PluginInstance) {
    let (window, activated) = {
        let mut link = instance.editor_link().lock();
        (link.window.take(), std::mem::take(&mut link.activated))
    };
    if let Some(window) = window {
        if activated {
            instance.dispatch(DispatchCall::new(Opcode::EditClose));
        }
        windows.destroy_window(window);
        log::debug!("editor: closed editor for {}", instance.name());
    }
}

/// Unregister `instance`, run whatever was queued since the last pass and
/// report the editor gone.
fn retire(shared: &EngineShared, key: SlotKey, instance: &PluginInstance) {
    let slot = shared.slots.lock().remove(key);
    if let Some(slot) = slot {
        finish_slot(slot);
    }
    report_gone(instance);
}

/// Drop the slot's queue, then run what it still held.  Commands sent after
/// this point find the queue closed and run on the sender's thread.
fn finish_slot(slot: Slot) {
    let Slot { instance, commands } = slot;
    let pending = command::take_pending(&commands);
    drop(commands);
    command::run_all(pending, &instance);
}

fn report_gone(instance: &PluginInstance) {
    let mut link = instance.editor_link().lock();
    link.size = (0, 0);
    link.mark_gone();
    instance.editor_changed().notify_all();
}

fn find_by_window(slots: &SlotArena<Slot>, window: WindowHandle) -> Option<PluginInstance> {
    slots
        .iter()
        .find(|(_, slot)| slot.instance.editor_link().lock().window == Some(window))
        .map(|(_, slot)| slot.instance.clone())
}

fn handle_event(shared: &EngineShared, windows: &mut dyn WindowSystem, event: WindowEvent) {
    match event {
        WindowEvent::LaunchEditor(window) => activate(shared, windows, window),
        WindowEvent::Configure {
            window,
            width,
            height,
        } => {
            let target = {
                let slots = shared.slots.lock();
                let instance = find_by_window(&slots, window);
                if let Some(instance) = &instance {
                    let mut link = instance.editor_link().lock();
                    if link.size == (width, height) {
                        return;
                    }
                    link.size = (width, height);
                    link.resize_request = Some((width, height));
                }
                instance
            };
            if let (Some(instance), Some(observer)) = (target, &shared.observer) {
                observer.on_resize_requested(&instance, width, height);
            }
        }
    }
}

fn activate(shared: &EngineShared, windows: &mut dyn WindowSystem, window: WindowHandle) {
    let target = find_by_window(&shared.slots.lock(), window);
    let Some(instance) = target else {
        log::debug!("editor: launch event for unknown window {:#x}", window.raw());
        return;
    };
    {
        let link = instance.editor_link().lock();
        if link.destroy || link.state != EditorState::Created {
            return;
        }
    }

    let open = unsafe {
        DispatchCall::new(Opcode::EditOpen)
            .value(windows.display_handle())
            .with_ptr(window.as_ptr())
    };
    instance.dispatch(open);

    // Some plugins only know their size a moment after opening.
    std::thread::sleep(shared.config.editor_open_settle());

    let size = match instance.edit_get_rect() {
        Some(rect) if rect.width() > 0 && rect.height() > 0 => {
            windows.resize_window(window, rect.width(), rect.height());
            Some((rect.width(), rect.height()))
        }
        _ => {
            log::debug!("editor: {} reported no editor size", instance.name());
            None
        }
    };

    let mut link = instance.editor_link().lock();
    link.activated = true;
    if let Some(size) = size {
        link.size = size;
    }
    if !link.destroy {
        link.state = EditorState::Activated;
    }
    instance.editor_changed().notify_all();
    log::debug!(
        "editor: {} activated in {:#x} ({}x{})",
        instance.name(),
        window.raw(),
        link.size.0,
        link.size.1
    );
}

fn teardown_all(shared: &EngineShared, windows: &mut dyn WindowSystem) {
    let slots = shared.slots.lock().drain();
    for slot in slots {
        let instance = slot.instance.clone();
        finish_slot(slot);
        destroy_editor(windows, &instance);
        report_gone(&instance);
    }
}
