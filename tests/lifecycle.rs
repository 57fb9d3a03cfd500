mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;

use fxbridge::abi::Opcode;
use fxbridge::bridge::{HostContext, HostRequest};
use fxbridge::module::ModuleLoader;
use fxbridge::{BridgeError, DispatchCall, ModuleHandle, PluginInstance, StaticLoader};

use common::*;

#[derive(Default)]
struct Recorder {
    automated: Mutex<Vec<(i32, f32)>>,
}

impl HostContext for Recorder {
    fn handle(&self, request: &HostRequest<'_>) -> Option<isize> {
        match request {
            HostRequest::Automate { index, value } => {
                self.automated.lock().push((*index, *value));
                Some(0)
            }
            HostRequest::GetSampleRate => Some(48_000),
            _ => None,
        }
    }
}

fn reverb_module() -> ModuleHandle {
    ModuleHandle::from_entry("/virtual/Reverb.so", "Reverb", reverb_entry)
}

#[test]
fn refcount_returns_to_zero_and_module_unloads() {
    let module = reverb_module();
    let a = PluginInstance::instantiate(&module, Some(Arc::new(Recorder::default()))).unwrap();
    let b = PluginInstance::instantiate(&module, Some(Arc::new(Recorder::default()))).unwrap();
    assert_eq!(module.live_instances(), 2);

    let err = module.unload().unwrap_err();
    assert!(matches!(err, BridgeError::InUse { refs: 2, .. }));
    assert!(module.is_loaded());

    a.close();
    assert_eq!(module.live_instances(), 1);
    assert!(module.is_loaded());

    b.close();
    assert_eq!(module.live_instances(), 0);
    assert!(!module.is_loaded());

    // A handle that has been unloaded cannot create instances.
    assert!(matches!(
        PluginInstance::instantiate(&module, None),
        Err(BridgeError::LoadFailed { .. })
    ));
}

#[test]
fn dropping_the_last_clone_closes_the_plugin() {
    let module = reverb_module();
    let instance = PluginInstance::instantiate(&module, None).unwrap();
    let state = state_of(&instance);
    let clone = instance.clone();
    drop(instance);
    assert!(!state.closed.load(Ordering::SeqCst));
    drop(clone);
    assert!(state.closed.load(Ordering::SeqCst));
    assert_eq!(module.live_instances(), 0);
}

#[test]
fn close_is_idempotent_and_shuts_down_in_order() {
    let module = reverb_module();
    let instance = PluginInstance::instantiate(&module, Some(Arc::new(Recorder::default()))).unwrap();
    let state = state_of(&instance);
    instance.close();
    instance.close();

    let calls = state.calls.lock().clone();
    assert_eq!(calls.first(), Some(&Opcode::Open.raw()));
    let tail = &calls[calls.len() - 2..];
    assert_eq!(tail, &[Opcode::MainsChanged.raw(), Opcode::Close.raw()]);
    assert_eq!(state.saw(Opcode::Close), 1);

    assert!(instance.is_closed());
    assert_eq!(instance.dispatch(DispatchCall::new(Opcode::GetVstVersion)), 0);
    assert_eq!(instance.num_params(), 0);
}

#[test]
fn context_receives_plugin_callbacks() {
    let module = reverb_module();
    let recorder = Arc::new(Recorder::default());
    let instance = PluginInstance::instantiate(&module, Some(recorder.clone())).unwrap();

    instance.set_parameter(3, 0.25);
    assert_eq!(instance.get_parameter(3), 0.25);
    assert_eq!(*recorder.automated.lock(), vec![(3, 0.25)]);
    instance.close();
}

#[test]
fn process_and_chunks() {
    let module = reverb_module();
    let instance = PluginInstance::instantiate(&module, None).unwrap();
    instance.dispatch(DispatchCall::new(Opcode::Open));

    let left = [1.0f32, 0.5, -1.0, 0.0];
    let right = [0.2f32; 4];
    let mut out_l = [9.0f32; 4];
    let mut out_r = [9.0f32; 4];
    {
        let mut outputs: [&mut [f32]; 2] = [&mut out_l, &mut out_r];
        instance.process(&[&left, &right], &mut outputs);
    }
    assert_eq!(out_l, [0.5, 0.25, -0.5, 0.0]);
    assert_eq!(out_r, [0.1; 4]);

    // Too few channels: nothing is written.
    let mut mono = [9.0f32; 4];
    instance.process(&[&left], &mut [&mut mono]);
    assert_eq!(mono, [9.0; 4]);

    assert_eq!(instance.get_chunk(false), b"initial".to_vec());
    instance.set_chunk(b"state v2", false);
    assert_eq!(instance.get_chunk(true), b"state v2".to_vec());
    instance.close();
}

#[test]
fn loader_results_share_nothing_between_loads() {
    let dir = tempfile::tempdir().unwrap();
    let loader = StaticLoader::new();
    let path = install(&loader, dir.path(), "Gain.so", plain_entry);

    let first = loader.load(&path).unwrap();
    let second = loader.load(&path).unwrap();
    assert!(!first.ptr_eq(&second));
    assert_eq!(first.name(), "Gain");
    assert_eq!(loader.load_count(), 2);

    let missing = loader.load(&dir.path().join("Missing.so")).unwrap_err();
    assert!(matches!(missing, BridgeError::LoadFailed { .. }));
}

#[test]
fn typed_accessors() {
    let module = reverb_module();
    let instance = PluginInstance::instantiate(&module, Some(Arc::new(Recorder::default()))).unwrap();
    assert_eq!(instance.unique_id(), REVERB_ID);
    assert_eq!((instance.num_inputs(), instance.num_outputs()), (2, 2));
    assert!(instance.has_editor());
    assert!(instance.can_replacing());
    assert!(!instance.is_synth());
    assert_eq!(instance.get_string(Opcode::GetEffectName, 0), "Reverb");
    assert!(!instance.can_do("receiveVstEvents"));
    assert_eq!(instance.vst_version(), 2400);
    let rect = instance.edit_get_rect().unwrap();
    assert_eq!((rect.width(), rect.height()), (640, 300));
    instance.close();
}
