//! Wi-Fi station services: scan and configure.
//!
//! The supplicant/driver is a collaborator behind [`WifiDriver`]; credential
//! persistence is its problem. These services only validate and translate.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::service::{CommandService, ServiceOutcome};
use crate::{STATUS_BAD_PAYLOAD, STATUS_DRIVER_FAILED, STATUS_INVALID_REQUEST};

/// One access point from a scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessPoint {
    pub ssid: String,
    /// Received signal strength, dBm.
    pub rssi: i8,
    pub channel: u8,
    pub secure: bool,
}

/// Station driver seam. Implemented by the platform layer and by test fakes.
pub trait WifiDriver: Send + Sync {
    /// Scan for nearby access points.
    fn scan(&self) -> anyhow::Result<Vec<AccessPoint>>;

    /// Apply station credentials. An empty passphrase means an open network.
    /// The driver persists credentials itself.
    fn configure(&self, ssid: &str, passphrase: &str) -> anyhow::Result<()>;
}

// ── wifiScan ──────────────────────────────────────────────────────────────────

/// `wifiScan` — returns the scan results as a JSON payload.
pub struct WifiScanService {
    driver: Arc<dyn WifiDriver>,
}

impl WifiScanService {
    pub fn new(driver: Arc<dyn WifiDriver>) -> Self {
        Self { driver }
    }
}

impl CommandService for WifiScanService {
    fn op(&self) -> &'static str {
        "wifiScan"
    }

    fn handle(&self, _payload: Option<&[u8]>) -> ServiceOutcome {
        let aps = match self.driver.scan() {
            Ok(aps) => aps,
            Err(e) => {
                tracing::warn!(error = %e, "wifi scan failed");
                return ServiceOutcome::error(STATUS_DRIVER_FAILED);
            }
        };
        match serde_json::to_vec(&aps) {
            Ok(blob) => ServiceOutcome::ok_with(blob),
            Err(e) => {
                tracing::warn!(error = %e, "scan result serialization failed");
                ServiceOutcome::error(STATUS_DRIVER_FAILED)
            }
        }
    }
}

// ── wifiConfigure ─────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ConfigureRequest {
    ssid: String,
    #[serde(default)]
    passphrase: String,
}

/// `wifiConfigure` — validates credentials and hands them to the driver.
pub struct WifiConfigureService {
    driver: Arc<dyn WifiDriver>,
}

impl WifiConfigureService {
    pub fn new(driver: Arc<dyn WifiDriver>) -> Self {
        Self { driver }
    }
}

impl CommandService for WifiConfigureService {
    fn op(&self) -> &'static str {
        "wifiConfigure"
    }

    fn handle(&self, payload: Option<&[u8]>) -> ServiceOutcome {
        let Some(payload) = payload else {
            return ServiceOutcome::error(STATUS_BAD_PAYLOAD);
        };
        let request: ConfigureRequest = match serde_json::from_slice(payload) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!(error = %e, "wifi configure payload rejected");
                return ServiceOutcome::error(STATUS_BAD_PAYLOAD);
            }
        };

        // SSIDs are 1..=32 bytes; WPA passphrases 8..=64 or empty for open.
        let ssid_ok = !request.ssid.is_empty() && request.ssid.len() <= 32;
        let pass_ok =
            request.passphrase.is_empty() || (8..=64).contains(&request.passphrase.len());
        if !ssid_ok || !pass_ok {
            return ServiceOutcome::error(STATUS_INVALID_REQUEST);
        }

        match self.driver.configure(&request.ssid, &request.passphrase) {
            Ok(()) => {
                tracing::info!(ssid = %request.ssid, "wifi credentials applied");
                ServiceOutcome::ok()
            }
            Err(e) => {
                tracing::warn!(error = %e, "wifi configure failed");
                ServiceOutcome::error(STATUS_DRIVER_FAILED)
            }
        }
    }
}
