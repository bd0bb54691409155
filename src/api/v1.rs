use axum::{extract::State, routing::get, routing::put, Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use validator::Validate;

use super::error::ApiError;
use super::response::{success, ApiResponse};
use crate::controller::{AppState, ControlCommand, DeviceValues, PublishedValues};
use crate::domain::AlarmKind;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/devices", get(list_devices))
        .route("/alarms", get(get_alarms))
        .route("/settings/max-feed-in", put(set_max_feed_in))
        .route("/settings/soc-floating-max", put(set_soc_floating_max))
        .with_state(state)
}

pub async fn get_status(State(st): State<AppState>) -> ApiResponse<PublishedValues> {
    let values = st.published.read().await.clone();
    let updated_at = values.updated_at;
    success(values).with_updated_at(updated_at)
}

pub async fn list_devices(State(st): State<AppState>) -> ApiResponse<Vec<DeviceValues>> {
    let values = st.published.read().await;
    let devices = values.devices.clone();
    let count = devices.len();
    success(devices)
        .with_count(count)
        .with_updated_at(values.updated_at)
}

#[derive(Debug, Serialize)]
pub struct AlarmStatus {
    pub states: BTreeMap<AlarmKind, bool>,
    /// Message of the alarm holding the shared slot
    pub message: Option<String>,
}

pub async fn get_alarms(State(st): State<AppState>) -> ApiResponse<AlarmStatus> {
    let values = st.published.read().await;
    success(AlarmStatus {
        states: values.alarms.clone(),
        message: values.alarm_message.clone(),
    })
}

#[derive(Debug, Deserialize, Validate)]
pub struct MaxFeedInRequest {
    #[validate(range(min = 0.0, max = 800.0))]
    pub value: f64,
}

#[derive(Debug, Deserialize, Validate)]
pub struct SocFloatingMaxRequest {
    #[validate(range(min = 0, max = 100))]
    pub value: i32,
}

#[derive(Debug, Serialize)]
pub struct SettingAccepted<T> {
    pub value: T,
}

pub async fn set_max_feed_in(
    State(st): State<AppState>,
    Json(req): Json<MaxFeedInRequest>,
) -> Result<ApiResponse<SettingAccepted<f64>>, ApiError> {
    req.validate()?;
    submit(&st, ControlCommand::SetMaxFeedIn(req.value)).await?;
    Ok(success(SettingAccepted { value: req.value }))
}

pub async fn set_soc_floating_max(
    State(st): State<AppState>,
    Json(req): Json<SocFloatingMaxRequest>,
) -> Result<ApiResponse<SettingAccepted<i32>>, ApiError> {
    req.validate()?;
    submit(&st, ControlCommand::SetSocFloatingMax(req.value)).await?;
    Ok(success(SettingAccepted { value: req.value }))
}

async fn submit(st: &AppState, cmd: ControlCommand) -> Result<(), ApiError> {
    st.limits.check(cmd)?;
    st.commands
        .send(cmd)
        .await
        .map_err(|_| ApiError::ServiceUnavailable("control loop is not running".into()))?;
    tracing::info!(?cmd, "setting submitted");
    Ok(())
}
