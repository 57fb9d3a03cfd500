use std::fmt;

use serde::{Deserialize, Serialize};

use crate::abi::category;

/// Plugin category as reported by `Opcode::GetPlugCategory`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PluginCategory {
    #[default]
    Unknown,
    Effect,
    Synth,
    Analysis,
    Mastering,
    Spacializer,
    RoomFx,
    SurroundFx,
    Restoration,
    Offline,
    Shell,
    Generator,
}

impl PluginCategory {
    pub const ALL: &'static [PluginCategory] = &[
        PluginCategory::Unknown,
        PluginCategory::Effect,
        PluginCategory::Synth,
        PluginCategory::Analysis,
        PluginCategory::Mastering,
        PluginCategory::Spacializer,
        PluginCategory::RoomFx,
        PluginCategory::SurroundFx,
        PluginCategory::Restoration,
        PluginCategory::Offline,
        PluginCategory::Shell,
        PluginCategory::Generator,
    ];

    pub fn from_code(code: isize) -> Self {
        match code {
            category::EFFECT => PluginCategory::Effect,
            category::SYNTH => PluginCategory::Synth,
            category::ANALYSIS => PluginCategory::Analysis,
            category::MASTERING => PluginCategory::Mastering,
            category::SPACIALIZER => PluginCategory::Spacializer,
            category::ROOM_FX => PluginCategory::RoomFx,
            category::SURROUND_FX => PluginCategory::SurroundFx,
            category::RESTORATION => PluginCategory::Restoration,
            category::OFFLINE_PROCESS => PluginCategory::Offline,
            category::SHELL => PluginCategory::Shell,
            category::GENERATOR => PluginCategory::Generator,
            _ => PluginCategory::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PluginCategory::Unknown => "Unknown",
            PluginCategory::Effect => "Effect",
            PluginCategory::Synth => "Synth",
            PluginCategory::Analysis => "Analysis",
            PluginCategory::Mastering => "Mastering",
            PluginCategory::Spacializer => "Spacializer",
            PluginCategory::RoomFx => "RoomFx",
            PluginCategory::SurroundFx => "SurroundFx",
            PluginCategory::Restoration => "Restoration",
            PluginCategory::Offline => "Offline",
            PluginCategory::Shell => "Shell",
            PluginCategory::Generator => "Generator",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.as_str() == tag)
    }
}

impl fmt::Display for PluginCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Everything the scanner learns about one plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRecord {
    pub name: String,
    pub vendor: String,
    pub unique_id: i32,
    pub category: PluginCategory,
    pub inputs: i32,
    pub outputs: i32,
    pub midi_inputs: i32,
    pub midi_outputs: i32,
    pub is_instrument: bool,
    pub has_editor: bool,
    pub can_replace: bool,
    pub num_programs: i32,
    pub num_params: i32,
    pub param_names: Vec<String>,
    pub param_labels: Vec<String>,
    /// Contained plugin IDs, for shell records.
    pub sub_ids: Vec<i32>,
    pub sub_names: Vec<String>,
}

impl ScanRecord {
    pub fn is_shell(&self) -> bool {
        self.category == PluginCategory::Shell
    }
}
