use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use super::limiter::DeviceState;
use super::soc_window::SocWindowValues;
use crate::domain::{units, AlarmKind};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GridValues {
    pub power_w: f64,
    pub voltage_v: f64,
    pub current_a: f64,
    pub energy_forward_kwh: f64,
    pub filtered_w: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CounterValues {
    pub update_index: u8,
    pub loop_index: u32,
    pub feed_in_index: u8,
    pub fetch_count: u8,
    pub read_errors: u32,
    pub connect_errors: u32,
    pub write_errors: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceValues {
    pub index: usize,
    pub name: String,
    pub serial: String,
    pub state: DeviceState,
    pub dc_voltage_v: f64,
    pub dc_current_a: f64,
    pub ac_power_w: f64,
    pub temperature_c: Option<f64>,
    pub yield_total_kwh: f64,
    pub limit_percent: u32,
    pub setpoint_w: f64,
    pub connect_counter: u32,
}

/// Everything the status surface shows, copied out after each tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PublishedValues {
    pub updated_at: Option<DateTime<Utc>>,
    pub grid: GridValues,
    pub counters: CounterValues,
    pub devices: Vec<DeviceValues>,
    pub soc: SocWindowValues,
    pub aux_feed_in_w: f64,
    pub max_feed_in_w: f64,
    pub alarms: BTreeMap<AlarmKind, bool>,
    pub alarm_message: Option<String>,
    pub display: BTreeMap<String, String>,
}

impl PublishedValues {
    /// Rebuild the text renderings from the numeric values.
    pub fn render_display(&mut self) {
        let mut display = BTreeMap::new();
        display.insert("grid.power".to_string(), units::watts(self.grid.power_w));
        display.insert("grid.voltage".to_string(), units::volts(self.grid.voltage_v));
        display.insert("grid.current".to_string(), units::amps(self.grid.current_a));
        display.insert(
            "grid.energy_forward".to_string(),
            units::kilowatt_hours(self.grid.energy_forward_kwh),
        );
        display.insert("grid.filtered".to_string(), units::watts(self.grid.filtered_w));
        display.insert("aux_feed_in".to_string(), units::watts(self.aux_feed_in_w));
        display.insert("max_feed_in".to_string(), units::watts(self.max_feed_in_w));
        display.insert("soc".to_string(), units::percent(f64::from(self.soc.soc)));
        display.insert(
            "soc.floating_max".to_string(),
            units::percent(f64::from(self.soc.floating_max)),
        );
        display.insert(
            "soc.charge_current".to_string(),
            units::amps(self.soc.charge_current_a),
        );
        display.insert(
            "heater.temperature".to_string(),
            units::celsius(self.soc.heater_temperature_c),
        );

        for device in &self.devices {
            let key = |field: &str| format!("device.{}.{field}", device.index);
            display.insert(key("dc_voltage"), units::volts_dc(device.dc_voltage_v));
            display.insert(key("dc_current"), units::amps(device.dc_current_a));
            display.insert(key("ac_power"), units::watts(device.ac_power_w));
            display.insert(key("yield_total"), units::kilowatt_hours(device.yield_total_kwh));
            display.insert(key("setpoint"), units::watts(device.setpoint_w));
            if let Some(t) = device.temperature_c {
                display.insert(key("temperature"), units::celsius(t));
            }
        }
        self.display = display;
    }
}
