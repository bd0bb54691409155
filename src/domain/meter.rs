use serde::{Deserialize, Serialize};

/// One sample from a single-phase energy meter
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeterReading {
    /// Positive when importing from the grid, negative when feeding in
    pub power_w: f64,
    pub voltage_v: f64,
    /// Energy counter in Wh
    pub total_wh: f64,
}

impl MeterReading {
    pub fn current_a(&self) -> f64 {
        if self.voltage_v.abs() > f64::EPSILON {
            self.power_w / self.voltage_v
        } else {
            0.0
        }
    }

    pub fn total_kwh(&self) -> f64 {
        self.total_wh / 1000.0
    }
}

/// Battery telemetry used by the SOC window and the feed-in budget
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatteryReading {
    pub soc: i32,
    /// Positive while charging
    pub current_a: f64,
    pub max_charge_current_a: f64,
    pub voltage_v: Option<f64>,
    pub max_discharge_current_a: Option<f64>,
}

impl BatteryReading {
    /// Power the battery may deliver, if the BMS reports enough to tell.
    pub fn max_discharge_w(&self) -> Option<f64> {
        match (self.voltage_v, self.max_discharge_current_a) {
            (Some(v), Some(a)) if v > 0.0 && a >= 0.0 => Some(v * a),
            _ => None,
        }
    }
}
