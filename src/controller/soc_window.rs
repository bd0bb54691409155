use serde::Serialize;
use tracing::{debug, info};

use crate::domain::BatteryReading;

/// Distance between the base SOC and the lowest allowed floating maximum.
pub const FLOATING_RANGE: i32 = 10;

const UPPER_SOC: i32 = 100;
const LIMIT_ENTER_A: f64 = 0.2;
const LIMIT_LEAVE_A: f64 = 1.2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeaterSettings {
    pub base_temperature_c: f64,
    pub elevated_temperature_c: f64,
    /// Sign-of-life ticks the elevated temperature is held
    pub hold_ticks: u32,
    pub min_aux_feed_in_w: f64,
}

impl Default for HeaterSettings {
    fn default() -> Self {
        Self {
            base_temperature_c: 5.0,
            elevated_temperature_c: 15.0,
            hold_ticks: 3,
            min_aux_feed_in_w: 50.0,
        }
    }
}

/// Published view of the window
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SocWindowValues {
    pub soc: i32,
    pub increment: i32,
    pub floating_max: i32,
    pub min_soc: i32,
    pub charge_current_a: f64,
    pub max_charge_current_a: f64,
    pub charge_limited: bool,
    pub heater_temperature_c: f64,
}

/// Adaptive SOC band gating feed-in.
///
/// Every SOC peak above the floating maximum widens the band by two points;
/// every turn below it narrows the band by one, down to `base + 10`. The
/// minimum SOC mirrors the maximum around the base SOC.
#[derive(Debug, Clone)]
pub struct SocWindowController {
    base_soc: i32,
    soc: i32,
    last_increment: i32,
    floating_max: i32,
    charge_limited: bool,
    charge_current_a: f64,
    max_charge_current_a: f64,
    max_discharge_w: Option<f64>,
    attached: bool,
    heater: HeaterSettings,
    heater_countdown: u32,
}

impl SocWindowController {
    pub fn new(base_soc: i32, heater: HeaterSettings) -> Self {
        Self {
            base_soc,
            soc: base_soc,
            last_increment: 0,
            floating_max: base_soc + FLOATING_RANGE,
            charge_limited: false,
            charge_current_a: 0.0,
            max_charge_current_a: 20.0,
            max_discharge_w: None,
            attached: false,
            heater,
            heater_countdown: 0,
        }
    }

    pub fn baseline_max(&self) -> i32 {
        self.base_soc + FLOATING_RANGE
    }

    pub fn floating_max(&self) -> i32 {
        self.floating_max
    }

    pub fn soc(&self) -> i32 {
        self.soc
    }

    pub fn min_soc(&self) -> i32 {
        self.base_soc - (self.floating_max - self.base_soc)
    }

    pub fn feed_in_permitted(&self) -> bool {
        self.soc >= self.min_soc()
    }

    pub fn charge_limited(&self) -> bool {
        self.charge_limited
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Discharge power the battery allows, unlimited when unknown.
    pub fn discharge_budget_w(&self) -> f64 {
        self.max_discharge_w.unwrap_or(f64::INFINITY)
    }

    /// Start taking battery readings into account.
    pub fn attach(&mut self) {
        self.attached = true;
    }

    pub fn update(&mut self, reading: &BatteryReading) {
        self.attached = true;

        let headroom = reading.max_charge_current_a - reading.current_a;
        self.charge_limited = if self.charge_limited {
            headroom < LIMIT_LEAVE_A
        } else {
            headroom < LIMIT_ENTER_A
        };
        self.charge_current_a = reading.current_a;
        self.max_charge_current_a = reading.max_charge_current_a;
        self.max_discharge_w = reading.max_discharge_w();

        let old = self.soc;
        let increment = reading.soc - old;
        if increment == 0 {
            return;
        }

        if increment * self.last_increment < 0 {
            let baseline = self.baseline_max();
            if self.last_increment > 0 && old <= UPPER_SOC && old > self.floating_max {
                self.floating_max = (self.floating_max + 2).min(UPPER_SOC);
                info!(soc = old, floating_max = self.floating_max, "SOC peak, window widened");
            } else if old < self.floating_max && (old >= baseline || self.floating_max > baseline) {
                self.floating_max = (self.floating_max - 1).max(baseline);
                debug!(soc = old, floating_max = self.floating_max, "SOC turn, window narrowed");
            }
        }
        self.last_increment = increment;
        self.soc = reading.soc;
    }

    /// No battery source: the window stays at its baseline.
    pub fn freeze(&mut self) {
        self.floating_max = self.baseline_max();
    }

    /// Writable attribute; rejects values outside `[base + 10, 100]`.
    pub fn set_floating_max(&mut self, value: i32) -> bool {
        if (self.baseline_max()..=UPPER_SOC).contains(&value) {
            self.floating_max = value;
            true
        } else {
            false
        }
    }

    /// Re-arm the heater hold while surplus solar cannot go into the battery.
    pub fn note_aux_feed_in(&mut self, aux_w: f64) {
        if self.charge_limited && aux_w > self.heater.min_aux_feed_in_w {
            self.heater_countdown = self.heater.hold_ticks;
        }
    }

    /// Sign-of-life tick.
    pub fn tick_heater(&mut self) {
        self.heater_countdown = self.heater_countdown.saturating_sub(1);
    }

    pub fn heater_countdown(&self) -> u32 {
        self.heater_countdown
    }

    pub fn heater_temperature_c(&self) -> f64 {
        if self.heater_countdown > 0 {
            self.heater.elevated_temperature_c
        } else {
            self.heater.base_temperature_c
        }
    }

    pub fn values(&self) -> SocWindowValues {
        SocWindowValues {
            soc: self.soc,
            increment: self.last_increment,
            floating_max: self.floating_max,
            min_soc: self.min_soc(),
            charge_current_a: self.charge_current_a,
            max_charge_current_a: self.max_charge_current_a,
            charge_limited: self.charge_limited,
            heater_temperature_c: self.heater_temperature_c(),
        }
    }
}
