use std::sync::Arc;
use tracing::{debug, info, warn};

use super::limiter::{DeviceFault, DeviceLimiter, DeviceState};
use super::published::DeviceValues;
use super::smoother::GridSmoother;
use crate::domain::{AlarmKind, AlarmRegistry};
use crate::hardware::{ErrorCounters, LimitWriter, RefreshStatus, TelemetryCache};

/// Highest value of the negative-grid streak counter
const FEED_IN_INDEX_MAX: u8 = 254;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FleetSettings {
    pub zero_point_w: f64,
    pub accuracy_w: f64,
    pub negative_grid_threshold_w: f64,
}

/// Per-cycle inputs gathered by the service before the fleet runs
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleInput {
    pub max_feed_in_w: f64,
    pub discharge_budget_w: f64,
    pub aux_feed_in_w: f64,
    pub feed_in_permitted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleStatus {
    /// At least one device took a new limit
    Adjusted,
    /// Fresh data, nothing to change
    Unchanged,
    NoNewData,
    FetchFailed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleReport {
    pub status: CycleStatus,
    pub target_w: f64,
    pub residual_w: f64,
    pub rotated: bool,
    pub controller_reset: bool,
}

impl CycleReport {
    fn skipped(status: CycleStatus) -> Self {
        Self {
            status,
            target_w: 0.0,
            residual_w: 0.0,
            rotated: false,
            controller_reset: false,
        }
    }
}

/// Drives every inverter towards the smoothed grid target, one cycle at a time.
pub struct FleetController {
    cache: TelemetryCache,
    writer: Arc<dyn LimitWriter>,
    limiters: Vec<DeviceLimiter>,
    /// Visiting order as positions into `limiters`
    order: Vec<usize>,
    settings: FleetSettings,
    feed_in_index: u8,
    loop_index: u32,
}

impl FleetController {
    pub fn new(
        cache: TelemetryCache,
        writer: Arc<dyn LimitWriter>,
        limiters: Vec<DeviceLimiter>,
        settings: FleetSettings,
    ) -> Self {
        let order = (0..limiters.len()).collect();
        Self {
            cache,
            writer,
            limiters,
            order,
            settings,
            feed_in_index: 0,
            loop_index: 0,
        }
    }

    pub fn feed_in_index(&self) -> u8 {
        self.feed_in_index
    }

    pub fn loop_index(&self) -> u32 {
        self.loop_index
    }

    /// Called by the sign-of-life tick.
    pub fn reset_loop_index(&mut self) {
        self.loop_index = 0;
    }

    pub fn order(&self) -> &[usize] {
        &self.order
    }

    pub fn limiters(&self) -> &[DeviceLimiter] {
        &self.limiters
    }

    pub fn error_counters(&self) -> ErrorCounters {
        self.cache.error_counters()
    }

    pub async fn run_cycle(
        &mut self,
        input: CycleInput,
        smoother: &mut GridSmoother,
        alarms: &mut AlarmRegistry,
    ) -> CycleReport {
        match self.cache.refresh().await {
            Ok(RefreshStatus::NewData) => {}
            Ok(RefreshStatus::NoNewData) => {
                info!("DTU has no new data, limits unchanged");
                return CycleReport::skipped(CycleStatus::NoNewData);
            }
            Err(e) => {
                warn!(error = %e, "limit data unavailable");
                return CycleReport::skipped(CycleStatus::FetchFailed);
            }
        }
        let Some(snapshot) = self.cache.snapshot() else {
            return CycleReport::skipped(CycleStatus::FetchFailed);
        };

        let zero = self.settings.zero_point_w;
        let target = smoother.value() - zero;
        let mut remaining = target;
        let mut budget = if input.feed_in_permitted {
            input.max_feed_in_w.min(input.discharge_budget_w) - input.aux_feed_in_w
        } else {
            0.0
        };
        debug!(target, budget, "control loop preset");

        let mut changed = false;
        let mut visited = vec![false; self.limiters.len()];
        for &position in &self.order {
            if remaining.abs() <= self.settings.accuracy_w {
                break;
            }
            visited[position] = true;
            let limiter = &mut self.limiters[position];
            let Some(view) = limiter.locate(snapshot) else {
                warn!(index = limiter.index(), "configured inverter missing from DTU data");
                limiter.mark_missing();
                continue;
            };
            let outcome = limiter
                .adjust(&view, remaining, budget, self.writer.as_ref())
                .await;
            remaining = outcome.remaining_grid_delta;
            budget = outcome.remaining_feed_in;
            if outcome.absorbed_w != 0.0 {
                changed = true;
            }
        }

        // devices behind the dead-band still track the fresh snapshot
        for (limiter, _) in self.limiters.iter_mut().zip(&visited).filter(|(_, v)| !**v) {
            match limiter.locate(snapshot) {
                Some(view) => limiter.observe(&view, remaining),
                None => limiter.mark_missing(),
            }
        }

        let rotated = !changed && self.order.len() > 1;
        if changed {
            smoother.assume(remaining + zero);
            info!(residual = remaining, "limits changed");
        } else if rotated {
            self.order.rotate_left(1);
            debug!(order = ?self.order, "no change, rotating inverters");
        }

        let controller_reset = !snapshot.any_reachable();
        if controller_reset {
            self.writer.reset_controller().await;
        }

        if smoother.value() < -self.settings.negative_grid_threshold_w {
            self.feed_in_index = (self.feed_in_index + 1).min(FEED_IN_INDEX_MAX);
        } else {
            self.feed_in_index = 0;
        }
        self.loop_index = self.loop_index.saturating_add(1);

        self.update_alarms(alarms);

        CycleReport {
            status: if changed {
                CycleStatus::Adjusted
            } else {
                CycleStatus::Unchanged
            },
            target_w: target,
            residual_w: remaining,
            rotated,
            controller_reset,
        }
    }

    fn update_alarms(&self, alarms: &mut AlarmRegistry) {
        let faulty = self.limiters.iter().find_map(|limiter| {
            if limiter.state() == DeviceState::Unreachable {
                Some((limiter.index(), DeviceFault::Unreachable))
            } else if limiter.not_producing() {
                Some((limiter.index(), DeviceFault::NotProducing))
            } else {
                None
            }
        });
        match faulty {
            Some((index, fault)) => {
                alarms.raise(AlarmKind::Inverter, format!("Inverter {index} / {fault}"));
            }
            None => {
                alarms.clear(AlarmKind::Inverter);
            }
        }

        alarms.set(
            AlarmKind::Temperature,
            self.limiters.iter().any(DeviceLimiter::temperature_alarm),
            "Inverter temperature too high",
        );
        alarms.set(
            AlarmKind::Dtu,
            self.limiters.iter().any(DeviceLimiter::write_alarm),
            "OpenDTU rejected limit update",
        );
    }

    /// Per-device values for publishing.
    pub fn device_values(&self) -> Vec<DeviceValues> {
        let snapshot = self.cache.snapshot();
        self.limiters
            .iter()
            .map(|limiter| {
                let view = snapshot.and_then(|s| limiter.locate(s));
                DeviceValues {
                    index: limiter.index(),
                    name: limiter
                        .name()
                        .or(view.as_ref().map(|v| v.name.as_str()))
                        .unwrap_or_default()
                        .to_string(),
                    serial: view.map(|v| v.serial.clone()).unwrap_or_default(),
                    state: if view.is_some() {
                        limiter.state()
                    } else {
                        DeviceState::Unreachable
                    },
                    dc_voltage_v: view.map_or(0.0, |v| v.dc_voltage_v),
                    dc_current_a: view.map_or(0.0, |v| v.dc_current_a),
                    ac_power_w: view.map_or(0.0, |v| v.ac_power_w),
                    temperature_c: view.and_then(|v| v.temperature_c),
                    yield_total_kwh: view.map_or(0.0, |v| v.ac_yield_total_kwh),
                    limit_percent: view.map_or(0, |v| v.limit_percent()),
                    setpoint_w: limiter.setpoint_w(),
                    connect_counter: limiter.connect_counter(),
                }
            })
            .collect()
    }
}
