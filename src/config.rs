use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use std::{net::SocketAddr, path::Path, path::PathBuf, time::Duration};
use thiserror::Error;

use crate::hardware::RetryPolicy;

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";
pub const ENV_PREFIX: &str = "ZFI__";
/// Upper bound of the writable max feed-in setting
pub const MAX_FEED_IN_CAP_W: f64 = 800.0;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub dtu: DtuConfig,
    pub meter: MeterConfig,
    pub battery: BatteryConfig,
    pub relay: RelayConfig,
    pub controller: ControllerConfig,
    pub limits: LimitsConfig,
    pub soc: SocConfig,
    pub heater: HeaterConfig,
    pub logging: LoggingConfig,
    pub inverters: Vec<InverterConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8088,
            request_timeout_secs: 10,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DtuConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub timeout_ms: u64,
    pub retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for DtuConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1".into(),
            username: String::new(),
            password: String::new(),
            timeout_ms: 2500,
            retries: 0,
            retry_backoff_ms: 200,
        }
    }
}

impl DtuConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retries, Duration::from_millis(self.retry_backoff_ms))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MeterConfig {
    pub grid_url: String,
    pub aux_url: Option<String>,
    pub username: String,
    pub password: String,
    pub timeout_ms: u64,
    pub retries: u32,
    pub retry_backoff_ms: u64,
    /// Assumed plug-in solar output while the aux meter is unreadable
    pub aux_default_w: f64,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            grid_url: "http://127.0.0.1/status".into(),
            aux_url: None,
            username: String::new(),
            password: String::new(),
            timeout_ms: 2500,
            retries: 0,
            retry_backoff_ms: 200,
            aux_default_w: 500.0,
        }
    }
}

impl MeterConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retries, Duration::from_millis(self.retry_backoff_ms))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatteryConfig {
    pub status_url: Option<String>,
    pub attach_delay_seconds: u64,
    pub timeout_ms: u64,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            status_url: None,
            attach_delay_seconds: 60,
            timeout_ms: 2500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub keep_alive_url: Option<String>,
    pub switch_off_url: Option<String>,
    /// Negative-grid streak at which the relay is switched off
    pub feed_in_index_limit: u8,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            keep_alive_url: None,
            switch_off_url: None,
            feed_in_index_limit: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub loop_seconds: u64,
    pub sign_of_life_minutes: u64,
    pub zero_point_w: f64,
    pub max_feed_in_w: f64,
    pub accuracy_w: f64,
    pub consume_filter_factor: f64,
    pub feed_in_filter_factor: f64,
    pub big_change_w: f64,
    pub negative_grid_threshold_w: f64,
    pub failure_sentinel_w: f64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            loop_seconds: 5,
            sign_of_life_minutes: 10,
            zero_point_w: 50.0,
            max_feed_in_w: 600.0,
            accuracy_w: 10.0,
            consume_filter_factor: 4.0,
            feed_in_filter_factor: 1.0,
            big_change_w: 100.0,
            negative_grid_threshold_w: 100.0,
            failure_sentinel_w: -100.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub min_percent: u32,
    pub max_percent: u32,
    pub step_percent: u32,
    pub max_temperature_c: f64,
    pub produce_counter_threshold: u32,
}

impl Default for LimitsConfig {
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

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SocConfig {
    pub base_soc: i32,
}

impl Default for SocConfig {
    fn default() -> Self {
        Self { base_soc: 53 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HeaterConfig {
    pub base_temperature_c: f64,
    pub elevated_temperature_c: f64,
    pub hold_ticks: u32,
    pub min_aux_feed_in_w: f64,
}

impl Default for HeaterConfig {
    fn default() -> Self {
        Self {
            base_temperature_c: 5.0,
            elevated_temperature_c: 15.0,
            hold_ticks: 3,
            min_aux_feed_in_w: 50.0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Optional JSON log file next to stdout
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InverterConfig {
    pub index: usize,
    #[serde(default)]
    pub serial: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// TOML file overlaid with `ZFI__SECTION__KEY` environment variables.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let cfg: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(Box::new)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        let l = &self.limits;
        let c = &self.controller;

        if self.inverters.is_empty() {
            return invalid("at least one [[inverters]] entry is required".into());
        }
        if l.step_percent == 0 {
            return invalid("limits.step_percent must be positive".into());
        }
        if l.min_percent > l.max_percent || l.max_percent > 100 {
            return invalid(format!(
                "limits must satisfy min <= max <= 100, got {}..{}",
                l.min_percent, l.max_percent
            ));
        }
        if l.min_percent % l.step_percent != 0 || l.max_percent % l.step_percent != 0 {
            return invalid(format!(
                "limits.min_percent and limits.max_percent must be multiples of step {}",
                l.step_percent
            ));
        }
        if c.consume_filter_factor < c.feed_in_filter_factor || c.feed_in_filter_factor < 0.0 {
            return invalid("controller.consume_filter_factor must be >= feed_in_filter_factor >= 0".into());
        }
        if c.loop_seconds == 0 || c.sign_of_life_minutes == 0 {
            return invalid("controller intervals must be positive".into());
        }
        if !(0.0..=MAX_FEED_IN_CAP_W).contains(&c.max_feed_in_w) {
            return invalid(format!(
                "controller.max_feed_in_w must be within 0..={MAX_FEED_IN_CAP_W}"
            ));
        }
        if c.accuracy_w < 0.0 {
            return invalid("controller.accuracy_w must not be negative".into());
        }
        let h = &self.heater;
        for (name, t) in [
            ("heater.base_temperature_c", h.base_temperature_c),
            ("heater.elevated_temperature_c", h.elevated_temperature_c),
        ] {
            if !(0.0..=20.0).contains(&t) {
                return invalid(format!("{name} must be within 0..=20"));
            }
        }
        if !(10..=90).contains(&self.soc.base_soc) {
            return invalid("soc.base_soc must be within 10..=90".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn valid() -> Config {
        Config {
            inverters: vec![InverterConfig {
                index: 0,
                serial: None,
                name: None,
            }],
            ..Config::default()
        }
    }

    #[test]
    fn test_defaults_validate_with_one_inverter() {
        assert!(valid().validate().is_ok());
        assert!(Config::default().validate().is_err());
    }

    #[test]
    fn test_limits_must_align_with_step() {
        let mut cfg = valid();
        cfg.limits.step_percent = 4;
        cfg.limits.min_percent = 2;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("multiples of step"));
    }

    #[test]
    fn test_filter_factor_order() {
        let mut cfg = valid();
        cfg.controller.consume_filter_factor = 1.0;
        cfg.controller.feed_in_filter_factor = 3.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_max_feed_in_cap() {
        let mut cfg = valid();
        cfg.controller.max_feed_in_w = 801.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_heater_range() {
        let mut cfg = valid();
        cfg.heater.elevated_temperature_c = 25.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[dtu]
base_url = "http://10.1.1.98"
username = "admin"

[controller]
zero_point_w = 25

[[inverters]]
index = 0
serial = "114182001"

[[inverters]]
index = 1
"#
        )
        .unwrap();

        let cfg = Config::load_from(file.path()).unwrap();
        assert_eq!(cfg.dtu.base_url, "http://10.1.1.98");
        assert_eq!(cfg.controller.zero_point_w, 25.0);
        assert_eq!(cfg.controller.loop_seconds, 5);
        assert_eq!(cfg.inverters.len(), 2);
        assert_eq!(cfg.inverters[0].serial.as_deref(), Some("114182001"));
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[controller]\nloop_seconds = 5\n").unwrap();
        assert!(matches!(
            Config::load_from(file.path()),
            Err(ConfigError::Invalid(_))
        ));
    }
}
