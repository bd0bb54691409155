pub mod battery;
pub mod dtu;
pub mod http;
pub mod meter;
pub mod relay;

pub use battery::{BatteryMonitor, HttpBatteryMonitor};
pub use dtu::{DtuWriter, ErrorCounters, LimitWriter, RefreshStatus, TelemetryCache};
pub use http::{Credentials, HttpJsonClient, RetryPolicy, TelemetryError};
pub use meter::ShellyMeter;
pub use relay::RelaySwitch;
