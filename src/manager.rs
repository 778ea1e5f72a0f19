//! Scanning and session construction.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::advertisement::Advertisement;
use crate::ble::{BleCentral, Peripheral};
use crate::crypto::AppKey;
use crate::error::{Error, Result};
use crate::session::DeviceSession;

/// Discovers SESAME peripherals through the host scanner and hands out a
/// [`DeviceSession`] per device. All sessions built by one manager share its
/// [`AppKey`].
pub struct BleManager {
    central: Arc<dyn BleCentral>,
    app_key: Arc<AppKey>,
}

impl BleManager {
    /// A manager using the process-wide [`AppKey`].
    pub fn new(central: Arc<dyn BleCentral>) -> Self {
        Self::with_app_key(central, AppKey::shared())
    }

    /// A manager with pinned key material, for reproducible handshakes.
    pub fn with_app_key(central: Arc<dyn BleCentral>, app_key: Arc<AppKey>) -> Self {
        BleManager { central, app_key }
    }

    /// Scan and build a session for every parseable SESAME peripheral, keyed
    /// by Bluetooth address. Individual peripherals that fail to parse are
    /// skipped; a scanner failure yields an empty set.
    pub async fn scan(&self, duration: Duration) -> HashMap<String, DeviceSession> {
        tracing::info!("starting scan for SESAME devices");
        let peripherals = match self.central.scan(duration).await {
            Ok(peripherals) => peripherals,
            Err(e) => {
                tracing::error!("scan failed: {e:#}");
                return HashMap::new();
            }
        };

        let mut sessions = HashMap::new();
        for peripheral in peripherals {
            let address = peripheral.info().bt_address.clone();
            match self.build_session(peripheral) {
                Ok(session) => {
                    sessions.insert(address, session);
                }
                Err(e) => tracing::warn!(%address, "skipping peripheral: {e}"),
            }
        }
        tracing::info!(found = sessions.len(), "scan completed");
        sessions
    }

    /// Scan for one device by its Bluetooth address (case-insensitive).
    pub async fn scan_by_address(
        &self,
        address: &str,
        duration: Duration,
    ) -> Result<DeviceSession> {
        tracing::info!(%address, "scanning for a SESAME device");
        let peripherals = self
            .central
            .scan(duration)
            .await
            .map_err(Error::Transport)?;

        let peripheral = peripherals
            .into_iter()
            .find(|peripheral| {
                peripheral
                    .info()
                    .bt_address
                    .eq_ignore_ascii_case(address)
            })
            .ok_or_else(|| Error::NotFound(address.to_string()))?;

        self.build_session(peripheral)
    }

    fn build_session(&self, peripheral: Arc<dyn Peripheral>) -> Result<DeviceSession> {
        let advertisement = Advertisement::parse(&peripheral.info())?;
        DeviceSession::new(peripheral, advertisement, self.app_key.clone())
    }
}
