pub mod fleet;
pub mod limiter;
pub mod published;
pub mod sign_of_life;
pub mod smoother;
pub mod soc_window;

use anyhow::Result;
use futures::FutureExt;
use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    sync::{mpsc, RwLock},
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Config, MAX_FEED_IN_CAP_W};
use crate::domain::{bump_counter, AlarmKind, AlarmRegistry};
use crate::hardware::{
    BatteryMonitor, Credentials, HttpBatteryMonitor, HttpJsonClient, RelaySwitch, RetryPolicy,
    ShellyMeter, TelemetryCache,
};

pub use fleet::{CycleInput, CycleReport, CycleStatus, FleetController, FleetSettings};
pub use limiter::{DeviceLimiter, DeviceState, LimiterSettings};
pub use published::{DeviceValues, PublishedValues};
pub use sign_of_life::RelayAction;
pub use smoother::{GridSmoother, SmootherSettings};
pub use soc_window::{HeaterSettings, SocWindowController};

/// Changes to writable attributes, sent by the status API
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlCommand {
    SetMaxFeedIn(f64),
    SetSocFloatingMax(i32),
}

#[derive(Debug, Error, PartialEq)]
pub enum SettingsError {
    #[error("{name} must be within {min}..={max}, got {value}")]
    OutOfRange {
        name: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
}

/// Accepted ranges of the writable attributes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SettingLimits {
    pub max_feed_in_w: f64,
    pub soc_floating_min: i32,
    pub soc_floating_max: i32,
}

impl SettingLimits {
    pub fn check(&self, cmd: ControlCommand) -> Result<(), SettingsError> {
        match cmd {
            ControlCommand::SetMaxFeedIn(value) if !(0.0..=self.max_feed_in_w).contains(&value) => {
                Err(SettingsError::OutOfRange {
                    name: "max_feed_in",
                    value,
                    min: 0.0,
                    max: self.max_feed_in_w,
                })
            }
            ControlCommand::SetSocFloatingMax(value)
                if !(self.soc_floating_min..=self.soc_floating_max).contains(&value) =>
            {
                Err(SettingsError::OutOfRange {
                    name: "soc_floating_max",
                    value: f64::from(value),
                    min: f64::from(self.soc_floating_min),
                    max: f64::from(self.soc_floating_max),
                })
            }
            _ => Ok(()),
        }
    }
}

/// Handles shared with the status API
#[derive(Clone)]
pub struct AppState {
    pub published: Arc<RwLock<PublishedValues>>,
    pub commands: mpsc::Sender<ControlCommand>,
    pub limits: SettingLimits,
}

#[derive(Debug, Clone, Copy)]
pub struct ServiceTiming {
    pub loop_period: Duration,
    pub sign_of_life_period: Duration,
    pub battery_attach_delay: Duration,
}

/// Owns every control component and runs the timers; the only writer of
/// controller state.
pub struct ControlService {
    fleet: FleetController,
    smoother: GridSmoother,
    soc: SocWindowController,
    alarms: AlarmRegistry,
    grid_meter: ShellyMeter,
    aux_meter: Option<ShellyMeter>,
    battery: Option<Arc<dyn BatteryMonitor>>,
    relay: RelaySwitch,
    limits: SettingLimits,
    max_feed_in_w: f64,
    aux_default_w: f64,
    aux_feed_in_w: f64,
    feed_in_index_limit: u8,
    values: PublishedValues,
    published: Arc<RwLock<PublishedValues>>,
    timing: ServiceTiming,
}

impl ControlService {
    pub fn from_config(cfg: &Config, published: Arc<RwLock<PublishedValues>>) -> Result<Self> {
        let dtu_http = HttpJsonClient::new(
            cfg.dtu.timeout(),
            Credentials::from_parts(&cfg.dtu.username, &cfg.dtu.password),
            cfg.dtu.retry_policy(),
        )?;
        let cache = TelemetryCache::new(cfg.dtu.base_url.clone(), dtu_http);
        let writer = Arc::new(cache.writer());

        let limiter_settings = LimiterSettings {
            min_percent: cfg.limits.min_percent,
            max_percent: cfg.limits.max_percent,
            step_percent: cfg.limits.step_percent,
            max_temperature_c: cfg.limits.max_temperature_c,
            produce_counter_threshold: cfg.limits.produce_counter_threshold,
        };
        let limiters = cfg
            .inverters
            .iter()
            .map(|inv| {
                DeviceLimiter::new(inv.index, inv.serial.clone(), limiter_settings)
                    .with_name(inv.name.clone())
            })
            .collect();
        let fleet = FleetController::new(
            cache,
            writer,
            limiters,
            FleetSettings {
                zero_point_w: cfg.controller.zero_point_w,
                accuracy_w: cfg.controller.accuracy_w,
                negative_grid_threshold_w: cfg.controller.negative_grid_threshold_w,
            },
        );

        let smoother = GridSmoother::new(SmootherSettings {
            consume_factor: cfg.controller.consume_filter_factor,
            feed_in_factor: cfg.controller.feed_in_filter_factor,
            big_change_w: cfg.controller.big_change_w,
            accuracy_w: cfg.controller.accuracy_w,
            zero_point_w: cfg.controller.zero_point_w,
            failure_sentinel_w: cfg.controller.failure_sentinel_w,
        });

        let soc = SocWindowController::new(
            cfg.soc.base_soc,
            HeaterSettings {
                base_temperature_c: cfg.heater.base_temperature_c,
                elevated_temperature_c: cfg.heater.elevated_temperature_c,
                hold_ticks: cfg.heater.hold_ticks,
                min_aux_feed_in_w: cfg.heater.min_aux_feed_in_w,
            },
        );

        let meter_http = HttpJsonClient::new(
            cfg.meter.timeout(),
            Credentials::from_parts(&cfg.meter.username, &cfg.meter.password),
            cfg.meter.retry_policy(),
        )?;
        let grid_meter = ShellyMeter::new(cfg.meter.grid_url.clone(), meter_http.clone());
        let aux_meter = cfg
            .meter
            .aux_url
            .as_ref()
            .filter(|u| !u.trim().is_empty())
            .map(|url| ShellyMeter::new(url.clone(), meter_http.clone()));

        let battery = match cfg.battery.status_url.as_ref().filter(|u| !u.trim().is_empty()) {
            Some(url) => {
                let http = HttpJsonClient::new(
                    Duration::from_millis(cfg.battery.timeout_ms),
                    None,
                    RetryPolicy::NONE,
                )?;
                Some(Arc::new(HttpBatteryMonitor::new(url.clone(), http)) as Arc<dyn BatteryMonitor>)
            }
            None => None,
        };

        let relay_http = HttpJsonClient::new(cfg.meter.timeout(), None, RetryPolicy::NONE)?;
        let relay = RelaySwitch::new(
            relay_http,
            cfg.relay.keep_alive_url.clone(),
            cfg.relay.switch_off_url.clone(),
        );

        let limits = SettingLimits {
            max_feed_in_w: MAX_FEED_IN_CAP_W,
            soc_floating_min: soc.baseline_max(),
            soc_floating_max: 100,
        };

        Ok(Self {
            fleet,
            smoother,
            soc,
            alarms: AlarmRegistry::new(),
            grid_meter,
            aux_meter,
            battery,
            relay,
            limits,
            max_feed_in_w: cfg.controller.max_feed_in_w,
            aux_default_w: cfg.meter.aux_default_w,
            aux_feed_in_w: 0.0,
            feed_in_index_limit: cfg.relay.feed_in_index_limit,
            values: PublishedValues::default(),
            published,
            timing: ServiceTiming {
                loop_period: Duration::from_secs(cfg.controller.loop_seconds.max(1)),
                sign_of_life_period: Duration::from_secs(cfg.controller.sign_of_life_minutes.max(1) * 60),
                battery_attach_delay: Duration::from_secs(cfg.battery.attach_delay_seconds),
            },
        })
    }

    pub fn limits(&self) -> SettingLimits {
        self.limits
    }

    pub fn alarms(&self) -> &AlarmRegistry {
        &self.alarms
    }

    pub fn fleet(&self) -> &FleetController {
        &self.fleet
    }

    pub fn soc(&self) -> &SocWindowController {
        &self.soc
    }

    pub fn smoother(&self) -> &GridSmoother {
        &self.smoother
    }

    /// Make the battery source count from now on instead of after the attach delay.
    pub fn attach_battery(&mut self) {
        if self.battery.is_some() {
            info!("attaching battery monitor");
            self.soc.attach();
        }
    }

    /// One control tick: meters, smoothing, fleet cycle, battery, publish.
    pub async fn control_tick(&mut self) -> CycleReport {
        self.read_aux_meter().await;
        self.read_grid_meter().await;

        let input = CycleInput {
            max_feed_in_w: self.max_feed_in_w,
            discharge_budget_w: self.soc.discharge_budget_w(),
            aux_feed_in_w: self.aux_feed_in_w,
            feed_in_permitted: self.soc.feed_in_permitted(),
        };
        let report = self
            .fleet
            .run_cycle(input, &mut self.smoother, &mut self.alarms)
            .await;

        self.read_battery().await;
        self.publish().await;
        report
    }

    async fn read_aux_meter(&mut self) {
        let Some(meter) = &self.aux_meter else {
            self.aux_feed_in_w = 0.0;
            return;
        };
        match meter.read().await {
            Ok(reading) => {
                self.aux_feed_in_w = reading.power_w;
                self.alarms.clear(AlarmKind::AuxMeter);
            }
            Err(e) => {
                warn!(error = %e, "aux meter unreadable, assuming default feed-in");
                self.aux_feed_in_w = self.aux_default_w;
                self.alarms
                    .raise(AlarmKind::AuxMeter, format!("{} / {e}", AlarmKind::AuxMeter));
            }
        }
    }

    async fn read_grid_meter(&mut self) {
        match self.grid_meter.read().await {
            Ok(reading) => {
                let filtered = self.smoother.update(reading.power_w, self.soc.charge_limited());
                self.values.grid.power_w = reading.power_w;
                self.values.grid.voltage_v = reading.voltage_v;
                self.values.grid.current_a = reading.current_a();
                self.values.grid.energy_forward_kwh = reading.total_kwh();
                self.values.counters.update_index = bump_counter(self.values.counters.update_index);
                self.alarms.clear(AlarmKind::GridMeter);
                info!(raw = reading.power_w, filtered, "grid meter");
            }
            Err(e) => {
                let filtered = self.smoother.fail();
                warn!(error = %e, filtered, "grid meter unreadable, assuming feed-in");
                self.alarms
                    .raise(AlarmKind::GridMeter, format!("{} / {e}", AlarmKind::GridMeter));
            }
        }
    }

    async fn read_battery(&mut self) {
        let Some(battery) = &self.battery else {
            self.soc.freeze();
            return;
        };
        if !self.soc.is_attached() {
            return;
        }
        match battery.read().await {
            Ok(reading) => {
                self.soc.update(&reading);
                self.alarms.set(
                    AlarmKind::Battery,
                    self.soc.charge_limited(),
                    "Battery charge current limited",
                );
                self.soc.note_aux_feed_in(self.aux_feed_in_w);
            }
            Err(e) => warn!(error = %e, "battery read failed, SOC window unchanged"),
        }
    }

    /// Slow tick: relay keep-alive, heater countdown and loop index reset.
    pub async fn sign_of_life_tick(&mut self) -> RelayAction {
        let action = sign_of_life::decide(
            self.fleet.loop_index(),
            self.soc.soc(),
            self.soc.min_soc(),
            self.fleet.feed_in_index(),
            self.feed_in_index_limit,
        );
        info!(
            %action,
            loop_index = self.fleet.loop_index(),
            soc = self.soc.soc(),
            min_soc = self.soc.min_soc(),
            feed_in_index = self.fleet.feed_in_index(),
            "sign of life"
        );
        match action {
            RelayAction::KeepAlive => self.relay.keep_alive().await,
            RelayAction::SwitchOff => self.relay.switch_off().await,
            RelayAction::Lapse => {}
        }
        self.fleet.reset_loop_index();
        self.soc.tick_heater();
        self.publish().await;
        action
    }

    pub fn apply(&mut self, cmd: ControlCommand) -> Result<(), SettingsError> {
        self.limits.check(cmd)?;
        match cmd {
            ControlCommand::SetMaxFeedIn(value) => self.max_feed_in_w = value,
            ControlCommand::SetSocFloatingMax(value) => {
                self.soc.set_floating_max(value);
            }
        }
        info!(?cmd, "setting changed");
        Ok(())
    }

    pub async fn publish(&mut self) {
        let counters = self.fleet.error_counters();
        let v = &mut self.values;
        v.updated_at = Some(chrono::Utc::now());
        v.grid.filtered_w = self.smoother.value();
        v.counters.loop_index = self.fleet.loop_index();
        v.counters.feed_in_index = self.fleet.feed_in_index();
        v.counters.fetch_count = counters.fetch_count;
        v.counters.read_errors = counters.read_errors;
        v.counters.connect_errors = counters.connect_errors;
        v.counters.write_errors = counters.write_errors;
        v.devices = self.fleet.device_values();
        v.soc = self.soc.values();
        v.aux_feed_in_w = self.aux_feed_in_w;
        v.max_feed_in_w = self.max_feed_in_w;
        v.alarms = self.alarms.states().clone();
        v.alarm_message = self.alarms.holder().map(|slot| slot.message.clone());
        v.render_display();

        *self.published.write().await = self.values.clone();
    }

    pub async fn run(mut self, mut commands: mpsc::Receiver<ControlCommand>, cancel: CancellationToken) {
        let now = Instant::now();
        let mut control = interval_at(now + self.timing.loop_period, self.timing.loop_period);
        control.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sign_of_life = interval_at(
            now + self.timing.sign_of_life_period,
            self.timing.sign_of_life_period,
        );
        sign_of_life.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let attach = tokio::time::sleep(self.timing.battery_attach_delay);
        tokio::pin!(attach);
        let mut attach_pending = self.battery.is_some();

        self.publish().await;
        info!(
            loop_seconds = self.timing.loop_period.as_secs(),
            inverters = self.fleet.limiters().len(),
            "control service started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = control.tick() => {
                    let tick = AssertUnwindSafe(self.control_tick()).catch_unwind().await;
                    if tick.is_err() {
                        error!("control tick panicked");
                    }
                }
                _ = sign_of_life.tick() => {
                    let tick = AssertUnwindSafe(self.sign_of_life_tick()).catch_unwind().await;
                    if tick.is_err() {
                        error!("sign-of-life tick panicked");
                    }
                }
                _ = &mut attach, if attach_pending => {
                    attach_pending = false;
                    self.attach_battery();
                }
                Some(cmd) = commands.recv() => {
                    match self.apply(cmd) {
                        Ok(()) => self.publish().await,
                        Err(e) => warn!(error = %e, "setting rejected"),
                    }
                }
            }
        }
        info!("control service stopped");
    }
}

/// Build the service from `cfg` and run it on its own task.
pub fn spawn_control_service(cfg: &Config) -> Result<(AppState, CancellationToken, JoinHandle<()>)> {
    let published = Arc::new(RwLock::new(PublishedValues::default()));
    let service = ControlService::from_config(cfg, published.clone())?;
    let (tx, rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();
    let state = AppState {
        published,
        commands: tx,
        limits: service.limits(),
    };
    let handle = tokio::spawn(service.run(rx, cancel.clone()));
    Ok((state, cancel, handle))
}
