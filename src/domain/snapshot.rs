use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::ops::Deref;
use thiserror::Error;

/// Errors raised while turning a DTU live-data payload into a snapshot
#[derive(Debug, Error, PartialEq)]
pub enum SnapshotError {
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("payload has no inverters")]
    NoInverters,
    #[error("inverter {index} is missing {section} telemetry")]
    MissingSection { index: usize, section: &'static str },
}

/// Latest telemetry of one inverter, as reported by the DTU.
///
/// Values are immutable once parsed; a refresh replaces the whole
/// [`FleetSnapshot`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub serial: String,
    pub name: String,
    pub reachable: bool,
    pub producing: bool,
    /// Relative output limit in percent of the nominal power
    pub limit_relative_percent: f64,
    /// Absolute output limit in watts
    pub limit_absolute_w: f64,
    pub ac_voltage_v: f64,
    pub ac_power_w: f64,
    pub ac_yield_total_kwh: f64,
    pub dc_voltage_v: f64,
    pub dc_current_a: f64,
    pub temperature_c: Option<f64>,
    /// Seconds since the DTU last heard from this inverter
    pub data_age_s: u64,
}

impl DeviceSnapshot {
    /// The inverter's AC side sees a live grid.
    pub fn grid_connected(&self) -> bool {
        self.ac_voltage_v > 100.0
    }

    /// Limit percent as the integer baseline used for corrections.
    pub fn limit_percent(&self) -> u32 {
        if self.limit_relative_percent.is_finite() && self.limit_relative_percent > 0.0 {
            self.limit_relative_percent.round().min(100.0) as u32
        } else {
            0
        }
    }

    /// Nominal power derived from the absolute and relative limits.
    ///
    /// Zero means the relation is unknown and the device must not be adjusted.
    pub fn max_power_w(&self) -> f64 {
        match self.limit_percent() {
            0 => 0.0,
            percent => self.limit_absolute_w * 100.0 / f64::from(percent),
        }
    }
}

/// One consistent fetch of the whole fleet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FleetSnapshot {
    pub fetched_at: DateTime<Utc>,
    devices: Vec<DeviceSnapshot>,
}

/// Read-only view of one device inside a [`FleetSnapshot`].
///
/// Carries the fleet's fetch timestamp so every view handed out during a
/// cycle can be checked against the same fetch.
#[derive(Debug, Clone, Copy)]
pub struct DeviceView<'a> {
    pub index: usize,
    pub fetched_at: DateTime<Utc>,
    device: &'a DeviceSnapshot,
}

impl Deref for DeviceView<'_> {
    type Target = DeviceSnapshot;

    fn deref(&self) -> &Self::Target {
        self.device
    }
}

impl FleetSnapshot {
    pub fn new(fetched_at: DateTime<Utc>, devices: Vec<DeviceSnapshot>) -> Self {
        Self {
            fetched_at,
            devices,
        }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<DeviceView<'_>> {
        self.devices.get(index).map(|device| DeviceView {
            index,
            fetched_at: self.fetched_at,
            device,
        })
    }

    pub fn find_serial(&self, serial: &str) -> Option<DeviceView<'_>> {
        self.devices
            .iter()
            .position(|d| d.serial == serial)
            .and_then(|index| self.get(index))
    }

    pub fn views(&self) -> impl Iterator<Item = DeviceView<'_>> {
        (0..self.devices.len()).filter_map(|i| self.get(i))
    }

    pub fn any_reachable(&self) -> bool {
        self.devices.iter().any(|d| d.reachable)
    }

    /// Data age of the first device, used to detect a DTU that has not
    /// polled its inverters since the previous fetch.
    pub fn data_age_marker(&self) -> Option<u64> {
        self.devices.first().map(|d| d.data_age_s)
    }
}

/// Boolean coercion applied to every flag-like telemetry field.
///
/// Accepts `true`, non-zero numbers and the strings `"1"` / `"true"` in any
/// case. Everything else, including missing values, is `false`.
pub fn coerce_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => {
            let s = s.trim();
            s == "1" || s.eq_ignore_ascii_case("true")
        }
        _ => false,
    }
}

/// Numeric coercion for fields that arrive as numbers or numeric strings.
pub fn coerce_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|f| f.is_finite())
}

fn coerce_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

type RawChannel = HashMap<String, Value>;

#[derive(Debug, Deserialize)]
struct RawLiveData {
    #[serde(default)]
    inverters: Vec<RawInverter>,
}

#[derive(Debug, Deserialize)]
struct RawInverter {
    #[serde(default)]
    serial: Value,
    #[serde(default)]
    name: Value,
    #[serde(default)]
    data_age: Value,
    #[serde(default)]
    reachable: Value,
    #[serde(default)]
    producing: Value,
    #[serde(default)]
    limit_relative: Value,
    #[serde(default)]
    limit_absolute: Value,
    #[serde(rename = "AC", default)]
    ac: HashMap<String, RawChannel>,
    #[serde(rename = "DC", default)]
    dc: HashMap<String, RawChannel>,
    #[serde(rename = "INV", default)]
    inv: HashMap<String, RawChannel>,
}

fn measurement(channel: Option<&RawChannel>, key: &str) -> Option<f64> {
    channel
        .and_then(|c| c.get(key))
        .and_then(|m| m.get("v"))
        .and_then(coerce_f64)
}

impl RawInverter {
    fn check_shape(&self, index: usize) -> Result<(), SnapshotError> {
        if !self.ac.contains_key("0") {
            return Err(SnapshotError::MissingSection { index, section: "AC" });
        }
        if !self.dc.contains_key("0") {
            return Err(SnapshotError::MissingSection { index, section: "DC" });
        }
        Ok(())
    }

    fn into_snapshot(self) -> DeviceSnapshot {
        let ac = self.ac.get("0");
        let dc = self.dc.get("0");
        let inv = self.inv.get("0");

        let serial = coerce_string(&self.serial);
        let limit_relative = coerce_f64(&self.limit_relative);
        let limit_absolute = coerce_f64(&self.limit_absolute);
        // A device whose identity or limits cannot be read is never adjusted.
        let well_formed = serial.is_some() && limit_relative.is_some() && limit_absolute.is_some();

        DeviceSnapshot {
            name: coerce_string(&self.name)
                .or_else(|| serial.clone())
                .unwrap_or_default(),
            serial: serial.unwrap_or_default(),
            reachable: well_formed && coerce_bool(&self.reachable),
            producing: well_formed && coerce_bool(&self.producing),
            limit_relative_percent: limit_relative.unwrap_or(0.0),
            limit_absolute_w: limit_absolute.unwrap_or(0.0),
            ac_voltage_v: measurement(ac, "Voltage").unwrap_or(0.0),
            ac_power_w: measurement(ac, "Power").unwrap_or(0.0),
            ac_yield_total_kwh: measurement(ac, "YieldTotal").unwrap_or(0.0),
            dc_voltage_v: measurement(dc, "Voltage").unwrap_or(0.0),
            dc_current_a: measurement(dc, "Current").unwrap_or(0.0),
            temperature_c: measurement(inv, "Temperature"),
            data_age_s: coerce_f64(&self.data_age).map_or(0, |a| a.max(0.0) as u64),
        }
    }
}

/// Parse an OpenDTU `/api/livedata/status` body into a fleet snapshot.
///
/// The payload is rejected as a whole when its structure is wrong; a single
/// inverter without AC or DC telemetry invalidates the fetch.
pub fn parse_live_data(body: &str, fetched_at: DateTime<Utc>) -> Result<FleetSnapshot, SnapshotError> {
    let raw: RawLiveData =
        serde_json::from_str(body).map_err(|e| SnapshotError::InvalidJson(e.to_string()))?;
    if raw.inverters.is_empty() {
        return Err(SnapshotError::NoInverters);
    }
    for (index, inverter) in raw.inverters.iter().enumerate() {
        inverter.check_shape(index)?;
    }
    let devices = raw
        .inverters
        .into_iter()
        .map(RawInverter::into_snapshot)
        .collect();
    Ok(FleetSnapshot::new(fetched_at, devices))
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(inverters: Value) -> String {
        json!({ "inverters": inverters, "total": {} }).to_string()
    }

    fn inverter(serial: &str, reachable: Value) -> Value {
        json!({
            "serial": serial,
            "name": "Garage",
            "data_age": 4,
            "reachable": reachable,
            "producing": "1",
            "limit_relative": 50.0,
            "limit_absolute": 400,
            "AC": {"0": {
                "Power": {"v": 398.2, "u": "W", "d": 1},
                "Voltage": {"v": 231.4, "u": "V", "d": 1},
                "YieldTotal": {"v": 812.344, "u": "kWh", "d": 3}
            }},
            "DC": {"0": {
                "name": {"u": "Panel A"},
                "Voltage": {"v": 33.1, "u": "V", "d": 1},
                "Current": {"v": 6.070000172, "u": "A", "d": 2}
            }},
            "INV": {"0": {"Temperature": {"v": 41.5, "u": "°C", "d": 1}}}
        })
    }

    #[test]
    fn test_coerce_bool_variants() {
        for truthy in [json!(true), json!(1), json!("1"), json!("True"), json!("TRUE"), json!("true")] {
            assert!(coerce_bool(&truthy), "{truthy} should be true");
        }
        for falsy in [json!(false), json!(0), json!("0"), json!("yes"), json!(null), json!([])] {
            assert!(!coerce_bool(&falsy), "{falsy} should be false");
        }
    }

    #[test]
    fn test_coerce_f64_accepts_numeric_strings() {
        assert_eq!(coerce_f64(&json!("42.5")), Some(42.5));
        assert_eq!(coerce_f64(&json!(7)), Some(7.0));
        assert_eq!(coerce_f64(&json!("n/a")), None);
        assert_eq!(coerce_f64(&json!(null)), None);
    }

    #[test]
    fn test_parse_live_data() {
        let now = Utc::now();
        let body = payload(json!([inverter("114182001", json!(true))]));
        let fleet = parse_live_data(&body, now).unwrap();

        assert_eq!(fleet.len(), 1);
        let view = fleet.get(0).unwrap();
        assert_eq!(view.serial, "114182001");
        assert!(view.reachable);
        assert!(view.producing);
        assert_eq!(view.limit_percent(), 50);
        assert_eq!(view.max_power_w(), 800.0);
        assert_eq!(view.temperature_c, Some(41.5));
        assert_eq!(view.data_age_s, 4);
        assert!(view.grid_connected());
        assert_eq!(view.fetched_at, now);
    }

    #[test]
    fn test_missing_dc_section_rejects_whole_payload() {
        let mut broken = inverter("2", json!(true));
        broken.as_object_mut().unwrap().remove("DC");
        let body = payload(json!([inverter("1", json!(true)), broken]));

        let err = parse_live_data(&body, Utc::now()).unwrap_err();
        assert_eq!(err, SnapshotError::MissingSection { index: 1, section: "DC" });
    }

    #[test]
    fn test_empty_and_invalid_payloads() {
        assert_eq!(
            parse_live_data(&payload(json!([])), Utc::now()).unwrap_err(),
            SnapshotError::NoInverters
        );
        assert!(matches!(
            parse_live_data("<html>", Utc::now()),
            Err(SnapshotError::InvalidJson(_))
        ));
    }

    #[test]
    fn test_unreadable_limits_mark_device_unreachable() {
        let mut odd = inverter("3", json!(true));
        odd["limit_relative"] = json!("unknown");
        let fleet = parse_live_data(&payload(json!([odd])), Utc::now()).unwrap();

        let view = fleet.get(0).unwrap();
        assert!(!view.reachable);
        assert!(!view.producing);
        assert_eq!(view.max_power_w(), 0.0);
    }

    #[test]
    fn test_views_share_fetch_timestamp() {
        let now = Utc::now();
        let body = payload(json!([
            inverter("1", json!(1)),
            inverter("2", json!("false")),
            inverter("3", json!("True"))
        ]));
        let fleet = parse_live_data(&body, now).unwrap();

        assert!(fleet.views().all(|v| v.fetched_at == now));
        assert_eq!(fleet.find_serial("2").map(|v| v.index), Some(1));
        assert!(!fleet.get(1).unwrap().reachable);
        assert!(fleet.any_reachable());
    }
}
