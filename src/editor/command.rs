//! Deferred plugin calls queued by caller threads and drained by the editor
//! engine thread once per pass.  Commands run with no engine lock held.

use std::sync::mpsc;

use crate::abi::{KeyEvent, Opcode};
use crate::bridge::{DispatchCall, PluginInstance};

pub(crate) enum EditorCommand {
    SetProgram(i32),
    SetChunk { data: Vec<u8>, preset: bool },
    Dispatch {
        call: DispatchCall,
        reply: mpsc::SyncSender<isize>,
    },
    Key(KeyEvent),
}

pub(crate) type CommandSender = mpsc::Sender<EditorCommand>;
pub(crate) type CommandReceiver = mpsc::Receiver<EditorCommand>;

pub(crate) fn queue() -> (CommandSender, CommandReceiver) {
    mpsc::channel()
}

impl EditorCommand {
    pub(crate) fn execute(self, instance: &PluginInstance) {
        match self {
            EditorCommand::SetProgram(program) => {
                let settled = apply_program(instance, program);
                instance.editor_link().lock().current_program = Some(settled);
            }
            EditorCommand::SetChunk { data, preset } => {
                instance.set_chunk(&data, preset);
            }
            EditorCommand::Dispatch { call, reply } => {
                let ret = instance.dispatch(call);
                // The requester may have given up; nothing to do then.
                let _ = reply.send(ret);
            }
            EditorCommand::Key(event) => {
                instance.dispatch(DispatchCall::key(event));
            }
        }
    }
}

/// Change program, bracketed for 2.x plugins, and read back the program the
/// plugin actually settled on.
fn apply_program(instance: &PluginInstance, program: i32) -> i32 {
    let bracketed = instance.vst_version() >= 2;
    if bracketed {
        instance.dispatch(DispatchCall::new(Opcode::BeginSetProgram));
    }
    instance.dispatch(DispatchCall::new(Opcode::SetProgram).value(program as isize));
    if bracketed {
        instance.dispatch(DispatchCall::new(Opcode::EndSetProgram));
    }
    instance.program()
}

/// Everything queued so far, in order.
pub(crate) fn take_pending(commands: &CommandReceiver) -> Vec<EditorCommand> {
    commands.try_iter().collect()
}

pub(crate) fn run_all(commands: Vec<EditorCommand>, instance: &PluginInstance) {
    for command in commands {
        command.execute(instance);
    }
}
