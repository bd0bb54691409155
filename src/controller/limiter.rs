use serde::Serialize;
use strum::Display;
use tracing::{debug, info, warn};

use crate::domain::{DeviceView, FleetSnapshot};
use crate::hardware::LimitWriter;

/// The temperature alarm clears this many degrees below the limit.
const TEMPERATURE_OFF_OFFSET_C: f64 = 5.0;

/// Per-device bounds for the output limit
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimiterSettings {
    pub min_percent: u32,
    pub max_percent: u32,
    pub step_percent: u32,
    pub max_temperature_c: f64,
    /// Cycles a grid-connected inverter may stay silent before it counts as
    /// not producing
    pub produce_counter_threshold: u32,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            min_percent: 2,
            max_percent: 100,
            step_percent: 2,
            max_temperature_c: 60.0,
            produce_counter_threshold: 90,
        }
    }
}

impl LimiterSettings {
    /// Round to the nearest step and clamp into `[min, max]`.
    pub fn quantize(&self, percent: f64) -> u32 {
        let step = f64::from(self.step_percent.max(1));
        let stepped = (percent / step).round() * step;
        stepped.clamp(f64::from(self.min_percent), f64::from(self.max_percent)) as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Unreachable,
    ConnectedNotProducing,
    Producing,
}

/// Why a device is forced to its minimum limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum DeviceFault {
    #[strum(to_string = "not reachable by DTU")]
    Unreachable,
    #[strum(to_string = "not connected to grid")]
    OffGrid,
    #[strum(to_string = "connected but not producing")]
    NotProducing,
    #[strum(to_string = "temperature too high")]
    Overheated,
}

/// Decision for one device before any write-back happens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimitPlan {
    pub old_percent: u32,
    pub new_percent: u32,
    pub max_power_w: f64,
    pub state: DeviceState,
    pub fault: Option<DeviceFault>,
    /// Leave the device alone this cycle
    pub hold: bool,
}

/// Result of one [`DeviceLimiter::adjust`] call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdjustOutcome {
    pub remaining_grid_delta: f64,
    pub remaining_feed_in: f64,
    pub old_percent: u32,
    /// Limit in effect after this call
    pub new_percent: u32,
    /// Limit the device should run at, held back on hold or failed write
    pub target_percent: u32,
    pub absorbed_w: f64,
    pub wrote: bool,
    pub state: DeviceState,
}

/// Limit control for one inverter behind the DTU.
#[derive(Debug, Clone)]
pub struct DeviceLimiter {
    index: usize,
    serial: Option<String>,
    name: Option<String>,
    settings: LimiterSettings,
    connect_counter: u32,
    temperature_alarm: bool,
    write_failures: u32,
    state: DeviceState,
    fault: Option<DeviceFault>,
    not_producing: bool,
    setpoint_w: f64,
}

impl DeviceLimiter {
    pub fn new(index: usize, serial: Option<String>, settings: LimiterSettings) -> Self {
        Self {
            index,
            serial: serial.filter(|s| !s.trim().is_empty()),
            name: None,
            settings,
            connect_counter: 0,
            temperature_alarm: false,
            write_failures: 0,
            state: DeviceState::Unreachable,
            fault: None,
            not_producing: false,
            setpoint_w: 0.0,
        }
    }

    /// Label shown instead of the name the DTU reports.
    pub fn with_name(mut self, name: Option<String>) -> Self {
        self.name = name.filter(|n| !n.trim().is_empty());
        self
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Fault seen on the last visit, if any.
    pub fn fault(&self) -> Option<DeviceFault> {
        self.fault
    }

    /// Reachable and on the grid, but silent past the hysteresis.
    pub fn not_producing(&self) -> bool {
        self.not_producing
    }

    pub fn connect_counter(&self) -> u32 {
        self.connect_counter
    }

    pub fn temperature_alarm(&self) -> bool {
        self.temperature_alarm
    }

    /// Two consecutive failed writes escalate to an alarm.
    pub fn write_alarm(&self) -> bool {
        self.write_failures >= 2
    }

    pub fn setpoint_w(&self) -> f64 {
        self.setpoint_w
    }

    /// Find this device in a snapshot, by serial when one is configured.
    pub fn locate<'a>(&self, fleet: &'a FleetSnapshot) -> Option<DeviceView<'a>> {
        match &self.serial {
            Some(serial) => fleet.find_serial(serial),
            None => fleet.get(self.index),
        }
    }

    /// The device is absent from the latest snapshot.
    pub fn mark_missing(&mut self) {
        self.state = DeviceState::Unreachable;
        self.not_producing = false;
        self.fault = Some(DeviceFault::Unreachable);
    }

    /// Update hysteresis, the thermal latch, state and fault from `view`.
    ///
    /// Runs once per fresh snapshot for every device, visited or not.
    pub fn observe(&mut self, view: &DeviceView<'_>, grid_delta: f64) {
        let reachable = view.reachable;
        let grid_connected = view.grid_connected();
        let mut producing = view.producing;

        if producing || !grid_connected {
            self.connect_counter = 0;
        } else if self.connect_counter < self.settings.produce_counter_threshold {
            self.connect_counter += 1;
            producing = true;
        }

        if let Some(temp) = view.temperature_c {
            if temp > self.settings.max_temperature_c && grid_delta > 0.0 {
                self.temperature_alarm = true;
            } else if temp < self.settings.max_temperature_c - TEMPERATURE_OFF_OFFSET_C {
                self.temperature_alarm = false;
            }
        }

        self.not_producing = reachable && grid_connected && !producing;
        self.state = if !reachable {
            DeviceState::Unreachable
        } else if grid_connected && producing {
            DeviceState::Producing
        } else {
            DeviceState::ConnectedNotProducing
        };

        self.fault = if self.temperature_alarm {
            Some(DeviceFault::Overheated)
        } else if !reachable {
            Some(DeviceFault::Unreachable)
        } else if !grid_connected {
            Some(DeviceFault::OffGrid)
        } else if !producing {
            Some(DeviceFault::NotProducing)
        } else {
            None
        };
    }

    /// Observe `view` and compute the new limit without touching the device.
    pub fn plan(&mut self, view: &DeviceView<'_>, grid_delta: f64, max_feed_in: f64) -> LimitPlan {
        self.observe(view, grid_delta);

        let old_percent = view.limit_percent();
        let max_power_w = view.max_power_w();
        let mut plan = LimitPlan {
            old_percent,
            new_percent: old_percent,
            max_power_w,
            state: self.state,
            fault: self.fault,
            hold: false,
        };

        // fail-safe target, but no write: the device cannot take it or asked for more power while hot
        if !view.reachable || max_power_w <= 0.0 || (self.temperature_alarm && grid_delta > 0.0) {
            plan.new_percent = self.settings.min_percent;
            plan.hold = true;
            return plan;
        }

        if self.fault.is_some() {
            plan.new_percent = self.settings.min_percent;
            return plan;
        }

        let act_feed_in = f64::from(old_percent) * max_power_w / 100.0;
        let add_feed_in = grid_delta.min(max_feed_in - act_feed_in);
        if add_feed_in != 0.0 {
            plan.new_percent = self
                .settings
                .quantize(f64::from(old_percent) + add_feed_in * 100.0 / max_power_w);
        }
        plan
    }

    /// One limit correction for this device.
    ///
    /// `grid_delta` is the outstanding grid power (positive: import, the
    /// device may produce more) and `max_feed_in` the remaining output budget.
    pub async fn adjust(
        &mut self,
        view: &DeviceView<'_>,
        grid_delta: f64,
        max_feed_in: f64,
        writer: &dyn LimitWriter,
    ) -> AdjustOutcome {
        let plan = self.plan(view, grid_delta, max_feed_in);
        debug!(
            serial = %view.serial,
            grid_delta,
            max_feed_in,
            old_percent = plan.old_percent,
            new_percent = plan.new_percent,
            "limit plan"
        );

        if self.not_producing {
            info!(serial = %view.serial, "connected to DTU and grid but not producing");
            writer.reset_device(&view.serial).await;
        }
        if let Some(fault) = plan.fault.filter(|f| *f != DeviceFault::NotProducing) {
            info!(serial = %view.serial, %fault, "device fault");
        }

        let mut effective = plan.old_percent;
        let mut wrote = false;
        if !plan.hold && plan.new_percent != plan.old_percent {
            if writer.push_limit(&view.serial, plan.new_percent).await {
                self.write_failures = 0;
                effective = plan.new_percent;
                wrote = true;
            } else {
                self.write_failures = self.write_failures.saturating_add(1);
                warn!(
                    serial = %view.serial,
                    consecutive = self.write_failures,
                    "limit write failed"
                );
            }
        }

        let per_percent = plan.max_power_w / 100.0;
        let absorbed_w = (f64::from(effective) - f64::from(plan.old_percent)) * per_percent;
        self.setpoint_w = f64::from(effective) * per_percent;

        AdjustOutcome {
            remaining_grid_delta: grid_delta - absorbed_w,
            remaining_feed_in: max_feed_in - self.setpoint_w,
            old_percent: plan.old_percent,
            new_percent: effective,
            target_percent: plan.new_percent,
            absorbed_w,
            wrote,
            state: plan.state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::snapshot::fixtures::device;
    use crate::domain::DeviceSnapshot;
    use crate::hardware::dtu::MockLimitWriter;
    use chrono::Utc;
    use mockall::predicate::eq;
    use proptest::prelude::*;
    use rstest::rstest;

    fn fleet_of(device: DeviceSnapshot) -> FleetSnapshot {
        FleetSnapshot::new(Utc::now(), vec![device])
    }

    fn limiter() -> DeviceLimiter {
        DeviceLimiter::new(0, None, LimiterSettings::default())
    }

    #[tokio::test]
    async fn test_export_reduces_limit() {
        // 50% of 2000 W, 350 W too much export
        let fleet = fleet_of(device("A", 50.0, 1000.0));
        let view = fleet.get(0).unwrap();
        let mut writer = MockLimitWriter::new();
        writer
            .expect_push_limit()
            .with(eq("A"), eq(32))
            .times(1)
            .returning(|_, _| true);

        let mut limiter = limiter();
        let outcome = limiter.adjust(&view, -350.0, 800.0, &writer).await;

        assert!(outcome.wrote);
        assert_eq!(outcome.new_percent, 32);
        assert_eq!(outcome.absorbed_w, -360.0);
        assert_eq!(outcome.remaining_grid_delta, 10.0);
        assert_eq!(outcome.remaining_feed_in, 800.0 - 640.0);
        assert_eq!(limiter.setpoint_w(), 640.0);
    }

    #[tokio::test]
    async fn test_import_capped_by_feed_in_budget() {
        let fleet = fleet_of(device("A", 20.0, 400.0));
        let view = fleet.get(0).unwrap();
        let mut writer = MockLimitWriter::new();
        // 400 W now, 600 W budget, 1000 W import: only 200 W more allowed
        writer
            .expect_push_limit()
            .with(eq("A"), eq(30))
            .times(1)
            .returning(|_, _| true);

        let outcome = limiter().adjust(&view, 1000.0, 600.0, &writer).await;
        assert_eq!(outcome.new_percent, 30);
        assert_eq!(outcome.remaining_grid_delta, 800.0);
        assert_eq!(outcome.remaining_feed_in, 0.0);
    }

    #[tokio::test]
    async fn test_hot_device_holds_on_import() {
        let mut hot = device("A", 40.0, 320.0);
        hot.temperature_c = Some(85.0);
        let fleet = fleet_of(hot);
        let view = fleet.get(0).unwrap();
        let writer = MockLimitWriter::new();

        let mut limiter = DeviceLimiter::new(
            0,
            None,
            LimiterSettings {
                max_temperature_c: 80.0,
                ..LimiterSettings::default()
            },
        );
        let outcome = limiter.adjust(&view, 200.0, 800.0, &writer).await;

        assert!(limiter.temperature_alarm());
        assert!(!outcome.wrote);
        assert_eq!(outcome.absorbed_w, 0.0);
        assert_eq!(outcome.remaining_grid_delta, 200.0);
    }

    #[test]
    fn test_temperature_alarm_clears_below_offset() {
        let settings = LimiterSettings {
            max_temperature_c: 80.0,
            ..LimiterSettings::default()
        };
        let mut limiter = DeviceLimiter::new(0, None, settings);

        let mut dev = device("A", 40.0, 320.0);
        dev.temperature_c = Some(81.0);
        let fleet = fleet_of(dev.clone());
        limiter.plan(&fleet.get(0).unwrap(), 100.0, 800.0);
        assert!(limiter.temperature_alarm());

        dev.temperature_c = Some(76.0);
        let fleet = fleet_of(dev.clone());
        limiter.plan(&fleet.get(0).unwrap(), 100.0, 800.0);
        assert!(limiter.temperature_alarm(), "76 is inside the hysteresis band");

        dev.temperature_c = Some(74.5);
        let fleet = fleet_of(dev);
        limiter.plan(&fleet.get(0).unwrap(), 100.0, 800.0);
        assert!(!limiter.temperature_alarm());
    }

    #[tokio::test]
    async fn test_unreachable_device_untouched() {
        let mut dev = device("A", 60.0, 480.0);
        dev.reachable = false;
        dev.producing = false;
        let fleet = fleet_of(dev);
        let writer = MockLimitWriter::new();

        let mut limiter = limiter();
        let outcome = limiter.adjust(&fleet.get(0).unwrap(), -300.0, 800.0, &writer).await;

        assert_eq!(outcome.state, DeviceState::Unreachable);
        assert_eq!(outcome.absorbed_w, 0.0);
        assert_eq!(outcome.remaining_grid_delta, -300.0);
        assert_eq!(outcome.new_percent, 60);
        assert_eq!(outcome.target_percent, 2);
        assert!(!outcome.wrote);
    }

    #[test]
    fn test_unreachable_plan_targets_minimum() {
        let mut dev = device("A", 60.0, 480.0);
        dev.reachable = false;
        let fleet = fleet_of(dev);

        let plan = limiter().plan(&fleet.get(0).unwrap(), -300.0, 800.0);
        assert_eq!(plan.old_percent, 60);
        assert_eq!(plan.new_percent, 2);
        assert!(plan.hold);
        assert_eq!(plan.fault, Some(DeviceFault::Unreachable));
    }

    #[tokio::test]
    async fn test_hot_device_not_producing_still_reset() {
        let mut dev = device("A", 40.0, 320.0);
        dev.temperature_c = Some(95.0);
        dev.producing = false;
        let fleet = fleet_of(dev);
        let mut writer = MockLimitWriter::new();
        writer
            .expect_reset_device()
            .with(eq("A"))
            .times(1)
            .returning(|_| true);

        let mut limiter = DeviceLimiter::new(
            0,
            None,
            LimiterSettings {
                produce_counter_threshold: 0,
                ..LimiterSettings::default()
            },
        );
        let outcome = limiter.adjust(&fleet.get(0).unwrap(), 200.0, 800.0, &writer).await;

        assert_eq!(limiter.fault(), Some(DeviceFault::Overheated));
        assert!(limiter.not_producing());
        assert_eq!(outcome.target_percent, 2);
        assert!(!outcome.wrote);
    }

    #[tokio::test]
    async fn test_not_producing_after_hysteresis_resets_and_minimises() {
        let mut dev = device("A", 50.0, 400.0);
        dev.producing = false;
        let fleet = fleet_of(dev);
        let view = fleet.get(0).unwrap();

        let settings = LimiterSettings {
            produce_counter_threshold: 2,
            ..LimiterSettings::default()
        };
        let mut limiter = DeviceLimiter::new(0, None, settings);

        // the first two cycles still count as producing
        for _ in 0..2 {
            let plan = limiter.plan(&view, 0.0, 800.0);
            assert_eq!(plan.fault, None);
            assert_eq!(plan.state, DeviceState::Producing);
        }

        let mut writer = MockLimitWriter::new();
        writer
            .expect_reset_device()
            .with(eq("A"))
            .times(1)
            .returning(|_| true);
        writer
            .expect_push_limit()
            .with(eq("A"), eq(2))
            .times(1)
            .returning(|_, _| true);

        let outcome = limiter.adjust(&view, 0.0, 800.0, &writer).await;
        assert_eq!(outcome.state, DeviceState::ConnectedNotProducing);
        assert_eq!(outcome.new_percent, 2);
        assert_eq!(limiter.connect_counter(), 2);
    }

    #[tokio::test]
    async fn test_write_latch_ignores_first_failure() {
        let fleet = fleet_of(device("A", 50.0, 1000.0));
        let view = fleet.get(0).unwrap();
        let mut writer = MockLimitWriter::new();
        let mut seq = mockall::Sequence::new();
        writer
            .expect_push_limit()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_, _| false);
        writer
            .expect_push_limit()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| true);

        let mut limiter = limiter();

        let first = limiter.adjust(&view, -400.0, 800.0, &writer).await;
        assert!(!limiter.write_alarm());
        assert_eq!(first.absorbed_w, 0.0);
        assert_eq!(first.new_percent, 50);

        limiter.adjust(&view, -400.0, 800.0, &writer).await;
        assert!(limiter.write_alarm());

        limiter.adjust(&view, -400.0, 800.0, &writer).await;
        assert!(!limiter.write_alarm());
    }

    #[rstest]
    #[case::zero_delta(0.0, 50)]
    #[case::below_half_step(15.0, 50)]
    #[case::one_step_up(20.0, 52)]
    #[case::floor(-5000.0, 2)]
    #[case::ceiling(1100.0, 100)]
    fn test_plan_quantisation(#[case] grid_delta: f64, #[case] expected: u32) {
        // 50% of 2000 W, budget large enough
        let fleet = fleet_of(device("A", 50.0, 1000.0));
        let plan = limiter().plan(&fleet.get(0).unwrap(), grid_delta, 5000.0);
        assert_eq!(plan.new_percent, expected);
    }

    #[test]
    fn test_serial_lookup_wins_over_index() {
        let fleet = FleetSnapshot::new(
            Utc::now(),
            vec![device("A", 50.0, 400.0), device("B", 50.0, 400.0)],
        );
        let limiter = DeviceLimiter::new(0, Some("B".into()), LimiterSettings::default());
        assert_eq!(limiter.locate(&fleet).unwrap().index, 1);

        let missing = DeviceLimiter::new(0, Some("C".into()), LimiterSettings::default());
        assert!(missing.locate(&fleet).is_none());
    }

    proptest! {
        #[test]
        fn prop_new_percent_on_step_and_in_bounds(
            old in 1u32..=100,
            abs in 10.0f64..1500.0,
            grid_delta in -3000.0f64..3000.0,
            budget in 0.0f64..800.0,
        ) {
            let fleet = fleet_of(device("A", f64::from(old), abs));
            let settings = LimiterSettings::default();
            let plan = limiter().plan(&fleet.get(0).unwrap(), grid_delta, budget);
            if plan.new_percent != plan.old_percent {
                prop_assert_eq!(plan.new_percent % settings.step_percent, 0);
                prop_assert!(plan.new_percent >= settings.min_percent);
                prop_assert!(plan.new_percent <= settings.max_percent);
            }
        }

        #[test]
        fn prop_fault_forces_minimum(
            old in 1u32..=100,
            grid_delta in -3000.0f64..3000.0,
            fault in 0u8..4,
        ) {
            let mut dev = device("A", f64::from(old), 400.0);
            match fault {
                0 => dev.ac_voltage_v = 0.0,
                1 => dev.temperature_c = Some(200.0),
                2 => dev.producing = false,
                _ => {
                    dev.reachable = false;
                    dev.producing = false;
                }
            }
            let fleet = fleet_of(dev);
            let mut limiter = DeviceLimiter::new(0, None, LimiterSettings {
                produce_counter_threshold: 0,
                ..LimiterSettings::default()
            });
            if fault == 1 {
                // latch the thermal alarm with an import request first
                limiter.plan(&fleet.get(0).unwrap(), 10.0, 800.0);
            }
            let plan = limiter.plan(&fleet.get(0).unwrap(), grid_delta, 800.0);
            prop_assert_eq!(plan.new_percent, 2);
        }

        #[test]
        fn prop_zero_delta_is_idempotent(old in 1u32..=100, abs in 10.0f64..1500.0) {
            let fleet = fleet_of(device("A", f64::from(old), abs));
            let mut limiter = limiter();
            let view = fleet.get(0).unwrap();
            let first = limiter.plan(&view, 0.0, 10_000.0);
            let second = limiter.plan(&view, 0.0, 10_000.0);
            prop_assert_eq!(first.new_percent, old);
            prop_assert_eq!(second.new_percent, old);
        }
    }
}
