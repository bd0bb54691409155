use tracing::{info, warn};

use super::http::HttpJsonClient;

/// Relay in front of the inverters, driven by plain GET requests.
///
/// A relay that stops receiving keep-alives drops the inverters off the grid.
#[derive(Debug, Clone)]
pub struct RelaySwitch {
    http: HttpJsonClient,
    keep_alive_url: Option<String>,
    switch_off_url: Option<String>,
}

impl RelaySwitch {
    pub fn new(http: HttpJsonClient, keep_alive_url: Option<String>, switch_off_url: Option<String>) -> Self {
        Self {
            http,
            keep_alive_url: keep_alive_url.filter(|u| !u.trim().is_empty()),
            switch_off_url: switch_off_url.filter(|u| !u.trim().is_empty()),
        }
    }

    pub async fn keep_alive(&self) {
        if let Some(url) = &self.keep_alive_url {
            self.fire(url, "keep-alive").await;
        }
    }

    pub async fn switch_off(&self) {
        if let Some(url) = &self.switch_off_url {
            self.fire(url, "switch-off").await;
        }
    }

    async fn fire(&self, url: &str, action: &'static str) {
        match self.http.get_text(url).await {
            Ok(_) => info!(action, "relay request sent"),
            Err(e) => warn!(action, error = %e, "relay request failed"),
        }
    }
}
