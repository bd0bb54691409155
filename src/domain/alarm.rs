use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::{Display, EnumIter, IntoEnumIterator};

/// Alarm sources the controller can report
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, EnumIter,
)]
#[serde(rename_all = "snake_case")]
pub enum AlarmKind {
    /// Grid meter could not be read
    #[strum(to_string = "Grid meter")]
    GridMeter,
    /// An inverter runs above its temperature limit
    #[strum(to_string = "Inverter temperature")]
    Temperature,
    /// Limit write-back to the DTU keeps failing
    #[strum(to_string = "OpenDTU write")]
    Dtu,
    /// An inverter is unreachable or not producing
    #[strum(to_string = "Inverter")]
    Inverter,
    /// Plug-in solar meter could not be read
    #[strum(to_string = "Aux meter")]
    AuxMeter,
    /// Battery charge current is limited
    #[strum(to_string = "Battery charge current limit")]
    Battery,
}

/// Kind and message of the alarm occupying the shared slot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlarmSlot {
    pub kind: AlarmKind,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

/// On/off state per alarm kind plus one shared slot.
///
/// The slot belongs to the first kind that raised an alarm and is only freed
/// when that same kind clears (compare-and-set); other kinds raising or
/// clearing never touch it.
#[derive(Debug, Clone)]
pub struct AlarmRegistry {
    states: BTreeMap<AlarmKind, bool>,
    slot: Option<AlarmSlot>,
}

impl AlarmRegistry {
    pub fn new() -> Self {
        Self {
            states: AlarmKind::iter().map(|k| (k, false)).collect(),
            slot: None,
        }
    }

    /// Raise `kind`. Returns true if it holds the shared slot afterwards.
    pub fn raise(&mut self, kind: AlarmKind, message: impl Into<String>) -> bool {
        self.states.insert(kind, true);
        match &self.slot {
            Some(slot) => slot.kind == kind,
            None => {
                self.slot = Some(AlarmSlot {
                    kind,
                    message: message.into(),
                    raised_at: Utc::now(),
                });
                true
            }
        }
    }

    /// Clear `kind`. Returns true if this freed the shared slot.
    pub fn clear(&mut self, kind: AlarmKind) -> bool {
        self.states.insert(kind, false);
        if self.slot.as_ref().is_some_and(|s| s.kind == kind) {
            self.slot = None;
            true
        } else {
            false
        }
    }

    pub fn set(&mut self, kind: AlarmKind, on: bool, message: impl Into<String>) {
        if on {
            self.raise(kind, message);
        } else {
            self.clear(kind);
        }
    }

    pub fn is_active(&self, kind: AlarmKind) -> bool {
        self.states.get(&kind).copied().unwrap_or(false)
    }

    pub fn holder(&self) -> Option<&AlarmSlot> {
        self.slot.as_ref()
    }

    pub fn states(&self) -> &BTreeMap<AlarmKind, bool> {
        &self.states
    }
}

impl Default for AlarmRegistry {
    fn default() -> Self {
        Self::new()
    }
}
