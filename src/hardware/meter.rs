use serde::Deserialize;

use super::http::{HttpJsonClient, TelemetryError};
use crate::domain::MeterReading;

#[derive(Debug, Deserialize)]
struct ShellyStatus {
    #[serde(default)]
    emeters: Vec<ShellyEmeter>,
}

#[derive(Debug, Deserialize)]
struct ShellyEmeter {
    power: f64,
    voltage: f64,
    #[serde(default)]
    total: f64,
}

/// Shelly EM `/status` reader; only the first emeter channel is used.
#[derive(Debug, Clone)]
pub struct ShellyMeter {
    http: HttpJsonClient,
    url: String,
}

impl ShellyMeter {
    pub fn new(url: impl Into<String>, http: HttpJsonClient) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }

    pub async fn read(&self) -> Result<MeterReading, TelemetryError> {
        let status: ShellyStatus = self.http.get_json(&self.url).await?;
        let emeter = status
            .emeters
            .into_iter()
            .next()
            .ok_or_else(|| TelemetryError::Malformed("no emeters in status".to_string()))?;
        Ok(MeterReading {
            power_w: emeter.power,
            voltage_v: emeter.voltage,
            total_wh: emeter.total,
        })
    }
}
