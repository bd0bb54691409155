//! OpenDTU access: one live-data fetch per cycle shared by every inverter,
//! plus the limit / restart / reboot write-backs.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc,
};
use tracing::{debug, info, warn};

use super::http::{HttpJsonClient, TelemetryError};
use crate::domain::{bump_counter, parse_live_data, DeviceView, FleetSnapshot};

/// Device write-back seam used by the limiters.
///
/// Every call is best-effort: failures are logged, counted and reported as
/// `false`, never propagated.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LimitWriter: Send + Sync {
    async fn push_limit(&self, serial: &str, percent: u32) -> bool;
    async fn reset_device(&self, serial: &str) -> bool;
    async fn reset_controller(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshStatus {
    NewData,
    NoNewData,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ErrorCounters {
    pub fetch_count: u8,
    pub read_errors: u32,
    pub write_errors: u32,
    pub connect_errors: u32,
}

/// State shared between the cache and its writer handles
#[derive(Debug, Default)]
struct WriteState {
    write_errors: AtomicU32,
    any_reachable: AtomicBool,
}

/// Holds the latest fleet snapshot fetched from the DTU.
///
/// A failed refresh keeps the previous snapshot available.
#[derive(Debug)]
pub struct TelemetryCache {
    http: HttpJsonClient,
    base_url: String,
    snapshot: Option<FleetSnapshot>,
    last_data_age: Option<u64>,
    fetch_count: u8,
    read_errors: u32,
    connect_errors: u32,
    shared: Arc<WriteState>,
}

impl TelemetryCache {
    pub fn new(base_url: impl Into<String>, http: HttpJsonClient) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            snapshot: None,
            last_data_age: None,
            fetch_count: 0,
            read_errors: 0,
            connect_errors: 0,
            shared: Arc::new(WriteState::default()),
        }
    }

    /// Fetch `/api/livedata/status` once and replace the snapshot.
    pub async fn refresh(&mut self) -> Result<RefreshStatus, TelemetryError> {
        let url = format!("{}/api/livedata/status", self.base_url);
        let body = match self.http.get_text(&url).await {
            Ok(body) => body,
            Err(e) => {
                if e.is_connect() {
                    self.connect_errors = self.connect_errors.wrapping_add(1);
                } else if e.is_read() {
                    self.read_errors = self.read_errors.wrapping_add(1);
                }
                warn!(error = %e, "DTU live data fetch failed");
                return Err(e);
            }
        };

        let snapshot = parse_live_data(&body, Utc::now()).map_err(|e| {
            warn!(error = %e, "DTU live data rejected");
            TelemetryError::from(e)
        })?;

        let age = snapshot.data_age_marker();
        let status = match self.last_data_age {
            Some(previous) if Some(previous) == age => RefreshStatus::NoNewData,
            _ => RefreshStatus::NewData,
        };
        self.last_data_age = age;
        self.fetch_count = bump_counter(self.fetch_count);
        self.shared
            .any_reachable
            .store(snapshot.any_reachable(), Ordering::Relaxed);
        self.snapshot = Some(snapshot);

        debug!(?status, fetch_count = self.fetch_count, "DTU live data refreshed");
        Ok(status)
    }

    pub fn get(&self, index: usize) -> Option<DeviceView<'_>> {
        self.snapshot.as_ref().and_then(|s| s.get(index))
    }

    pub fn snapshot(&self) -> Option<&FleetSnapshot> {
        self.snapshot.as_ref()
    }

    pub fn error_counters(&self) -> ErrorCounters {
        ErrorCounters {
            fetch_count: self.fetch_count,
            read_errors: self.read_errors,
            write_errors: self.shared.write_errors.load(Ordering::Relaxed),
            connect_errors: self.connect_errors,
        }
    }

    /// Write-back handle sharing this cache's session and counters.
    pub fn writer(&self) -> DtuWriter {
        DtuWriter {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            shared: self.shared.clone(),
        }
    }
}

/// [`LimitWriter`] against the OpenDTU REST API
#[derive(Debug, Clone)]
pub struct DtuWriter {
    http: HttpJsonClient,
    base_url: String,
    shared: Arc<WriteState>,
}

impl DtuWriter {
    async fn post(&self, endpoint: &str, payload: serde_json::Value) -> bool {
        let url = format!("{}{}", self.base_url, endpoint);
        match self.http.post_data(&url, &payload.to_string()).await {
            Ok(_) => true,
            Err(e) => {
                self.shared.write_errors.fetch_add(1, Ordering::Relaxed);
                warn!(endpoint, error = %e, "DTU write failed");
                false
            }
        }
    }
}

#[async_trait]
impl LimitWriter for DtuWriter {
    async fn push_limit(&self, serial: &str, percent: u32) -> bool {
        info!(serial, percent, "pushing new limit");
        self.post(
            "/api/limit/config",
            json!({ "serial": serial, "limit_type": 1, "limit_value": percent }),
        )
        .await
    }

    async fn reset_device(&self, serial: &str) -> bool {
        info!(serial, "restarting inverter");
        self.post("/api/power/config", json!({ "serial": serial, "restart": true }))
            .await
    }

    async fn reset_controller(&self) -> bool {
        if self.shared.any_reachable.load(Ordering::Relaxed) {
            debug!("DTU reboot skipped, an inverter is reachable");
            return true;
        }
        warn!("no inverter reachable, rebooting DTU");
        self.post("/api/maintenance/reboot", json!({ "reboot": true }))
            .await
    }
}
