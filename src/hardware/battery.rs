use async_trait::async_trait;
use serde::Deserialize;

use super::http::{HttpJsonClient, TelemetryError};
use crate::domain::BatteryReading;

/// Source of battery telemetry for the SOC window
#[async_trait]
pub trait BatteryMonitor: Send + Sync {
    async fn read(&self) -> Result<BatteryReading, TelemetryError>;
}

#[derive(Debug, Deserialize)]
struct RawBattery {
    soc: f64,
    current: f64,
    max_charge_current: f64,
    #[serde(default)]
    voltage: Option<f64>,
    #[serde(default)]
    max_discharge_current: Option<f64>,
}

/// BMS bridge publishing a flat JSON status document.
#[derive(Debug, Clone)]
pub struct HttpBatteryMonitor {
    http: HttpJsonClient,
    url: String,
}

impl HttpBatteryMonitor {
    pub fn new(url: impl Into<String>, http: HttpJsonClient) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl BatteryMonitor for HttpBatteryMonitor {
    async fn read(&self) -> Result<BatteryReading, TelemetryError> {
        let raw: RawBattery = self.http.get_json(&self.url).await?;
        if !(0.0..=100.0).contains(&raw.soc) {
            return Err(TelemetryError::Malformed(format!("soc out of range: {}", raw.soc)));
        }
        Ok(BatteryReading {
            soc: raw.soc.round() as i32,
            current_a: raw.current,
            max_charge_current_a: raw.max_charge_current,
            voltage_v: raw.voltage,
            max_discharge_current_a: raw.max_discharge_current,
        })
    }
}
