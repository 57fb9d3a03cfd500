//! Opcode selectors for both directions of the ABI.
//!
//! Plugin-bound calls go through `AEffect::dispatcher` with an [`Opcode`];
//! host-bound calls arrive in the host callback with a [`HostOpcode`].  Both
//! are closed enums on the Rust side and are lowered to their raw `i32` only
//! at the native call site.

/// Requests the host sends to the plugin dispatcher.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Open = 0,
    Close = 1,
    SetProgram = 2,
    GetProgram = 3,
    SetProgramName = 4,
    GetProgramName = 5,
    GetParamLabel = 6,
    GetParamDisplay = 7,
    GetParamName = 8,
    SetSampleRate = 10,
    SetBlockSize = 11,
    MainsChanged = 12,
    EditGetRect = 13,
    EditOpen = 14,
    EditClose = 15,
    EditIdle = 19,
    EditTop = 20,
    Identify = 22,
    GetChunk = 23,
    SetChunk = 24,
    ProcessEvents = 25,
    CanBeAutomated = 26,
    String2Parameter = 27,
    GetProgramNameIndexed = 29,
    GetInputProperties = 33,
    GetOutputProperties = 34,
    GetPlugCategory = 35,
    SetSpeakerArrangement = 42,
    SetBypass = 44,
    GetEffectName = 45,
    GetVendorString = 47,
    GetProductString = 48,
    GetVendorVersion = 49,
    VendorSpecific = 50,
    CanDo = 51,
    GetTailSize = 52,
    Idle = 53,
    GetParameterProperties = 56,
    GetVstVersion = 58,
    EditKeyDown = 59,
    EditKeyUp = 60,
    SetEditKnobMode = 61,
    GetMidiProgramName = 62,
    GetCurrentMidiProgram = 63,
    GetMidiProgramCategory = 64,
    HasMidiProgramsChanged = 65,
    GetMidiKeyName = 66,
    BeginSetProgram = 67,
    EndSetProgram = 68,
    GetSpeakerArrangement = 69,
    ShellGetNextPlugin = 70,
    StartProcess = 71,
    StopProcess = 72,
    SetTotalSampleToProcess = 73,
    SetPanLaw = 74,
    BeginLoadBank = 75,
    BeginLoadProgram = 76,
    SetProcessPrecision = 77,
    GetNumMidiInputChannels = 78,
    GetNumMidiOutputChannels = 79,
}

impl Opcode {
    pub const ALL: &'static [Opcode] = &[
        Opcode::Open,
        Opcode::Close,
        Opcode::SetProgram,
        Opcode::GetProgram,
        Opcode::SetProgramName,
        Opcode::GetProgramName,
        Opcode::GetParamLabel,
        Opcode::GetParamDisplay,
        Opcode::GetParamName,
        Opcode::SetSampleRate,
        Opcode::SetBlockSize,
        Opcode::MainsChanged,
        Opcode::EditGetRect,
        Opcode::EditOpen,
        Opcode::EditClose,
        Opcode::EditIdle,
        Opcode::EditTop,
        Opcode::Identify,
        Opcode::GetChunk,
        Opcode::SetChunk,
        Opcode::ProcessEvents,
        Opcode::CanBeAutomated,
        Opcode::String2Parameter,
        Opcode::GetProgramNameIndexed,
        Opcode::GetInputProperties,
        Opcode::GetOutputProperties,
        Opcode::GetPlugCategory,
        Opcode::SetSpeakerArrangement,
        Opcode::SetBypass,
        Opcode::GetEffectName,
        Opcode::GetVendorString,
        Opcode::GetProductString,
        Opcode::GetVendorVersion,
        Opcode::VendorSpecific,
        Opcode::CanDo,
        Opcode::GetTailSize,
        Opcode::Idle,
        Opcode::GetParameterProperties,
        Opcode::GetVstVersion,
        Opcode::EditKeyDown,
        Opcode::EditKeyUp,
        Opcode::SetEditKnobMode,
        Opcode::GetMidiProgramName,
        Opcode::GetCurrentMidiProgram,
        Opcode::GetMidiProgramCategory,
        Opcode::HasMidiProgramsChanged,
        Opcode::GetMidiKeyName,
        Opcode::BeginSetProgram,
        Opcode::EndSetProgram,
        Opcode::GetSpeakerArrangement,
        Opcode::ShellGetNextPlugin,
        Opcode::StartProcess,
        Opcode::StopProcess,
        Opcode::SetTotalSampleToProcess,
        Opcode::SetPanLaw,
        Opcode::BeginLoadBank,
        Opcode::BeginLoadProgram,
        Opcode::SetProcessPrecision,
        Opcode::GetNumMidiInputChannels,
        Opcode::GetNumMidiOutputChannels,
    ];

    #[inline]
    pub fn raw(self) -> i32 {
        self as i32
    }

    /// Opcodes many plugins only accept from the thread that owns their
    /// editor.  The editor engine routes these through its queue.
    pub fn is_editor_affine(self) -> bool {
        matches!(
            self,
            Opcode::SetProgram
                | Opcode::SetChunk
                | Opcode::GetChunk
                | Opcode::EditOpen
                | Opcode::EditClose
                | Opcode::EditIdle
                | Opcode::EditGetRect
                | Opcode::EditKeyDown
                | Opcode::EditKeyUp
                | Opcode::BeginSetProgram
                | Opcode::EndSetProgram
        )
    }
}

impl TryFrom<i32> for Opcode {
    type Error = i32;

    fn try_from(raw: i32) -> Result<Self, Self::Error> {
        Opcode::ALL
            .iter()
            .copied()
            .find(|op| op.raw() == raw)
            .ok_or(raw)
    }
}

/// Requests a plugin makes through the host callback.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostOpcode {
    Automate = 0,
    Version = 1,
    CurrentId = 2,
    Idle = 3,
    PinConnected = 4,
    WantMidi = 6,
    GetTime = 7,
    ProcessEvents = 8,
    IoChanged = 13,
    NeedIdle = 14,
    SizeWindow = 15,
    GetSampleRate = 16,
    GetBlockSize = 17,
    GetInputLatency = 18,
    GetOutputLatency = 19,
    GetCurrentProcessLevel = 23,
    GetAutomationState = 24,
    GetVendorString = 32,
    GetProductString = 33,
    GetVendorVersion = 34,
    VendorSpecific = 35,
    CanDo = 37,
    GetLanguage = 38,
    GetDirectory = 41,
    UpdateDisplay = 42,
    BeginEdit = 43,
    EndEdit = 44,
    OpenFileSelector = 45,
    CloseFileSelector = 46,
}

impl HostOpcode {
    const ALL: &'static [HostOpcode] = &[
        HostOpcode::Automate,
        HostOpcode::Version,
        HostOpcode::CurrentId,
        HostOpcode::Idle,
        HostOpcode::PinConnected,
        HostOpcode::WantMidi,
        HostOpcode::GetTime,
        HostOpcode::ProcessEvents,
        HostOpcode::IoChanged,
        HostOpcode::NeedIdle,
        HostOpcode::SizeWindow,
        HostOpcode::GetSampleRate,
        HostOpcode::GetBlockSize,
        HostOpcode::GetInputLatency,
        HostOpcode::GetOutputLatency,
        HostOpcode::GetCurrentProcessLevel,
        HostOpcode::GetAutomationState,
        HostOpcode::GetVendorString,
        HostOpcode::GetProductString,
        HostOpcode::GetVendorVersion,
        HostOpcode::VendorSpecific,
        HostOpcode::CanDo,
        HostOpcode::GetLanguage,
        HostOpcode::GetDirectory,
        HostOpcode::UpdateDisplay,
        HostOpcode::BeginEdit,
        HostOpcode::EndEdit,
        HostOpcode::OpenFileSelector,
        HostOpcode::CloseFileSelector,
    ];

    #[inline]
    pub fn raw(self) -> i32 {
        self as i32
    }
}

impl TryFrom<i32> for HostOpcode {
    type Error = i32;

    fn try_from(raw: i32) -> Result<Self, Self::Error> {
        HostOpcode::ALL
            .iter()
            .copied()
            .find(|op| op.raw() == raw)
            .ok_or(raw)
    }
}
