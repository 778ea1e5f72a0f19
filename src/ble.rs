//! The host BLE stack abstraction consumed by the session core.
//!
//! The crate never talks to an adapter directly: the embedding application
//! supplies implementations of these traits (btleplug, bluer, a simulator, …)
//! and the core drives them. Implementations report their failures as
//! [`anyhow::Error`]; the session layer wraps them into
//! [`Error::Transport`](crate::Error::Transport).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::{uuid, Uuid};

/// The GATT service every SESAME device advertises.
pub const SERVICE_UUID: Uuid = uuid!("0000fd81-0000-1000-8000-00805f9b34fb");

/// Host → device characteristic (commands).
pub const TX_UUID: Uuid = uuid!("16860002-a5ae-9856-b6d3-dbb4c676993e");

/// Device → host characteristic (notifications).
pub const RX_UUID: Uuid = uuid!("16860003-a5ae-9856-b6d3-dbb4c676993e");

/// CANDY HOUSE's Bluetooth SIG manufacturer identifier.
pub const MANUFACTURER_ID: u16 = 0x055A;

/// Called with the raw value of every notification on a subscribed
/// characteristic. Must not block.
pub type NotificationHandler = Box<dyn Fn(Vec<u8>) + Send + Sync>;

/// Called once when the link to the peripheral is lost. Must not block.
pub type DisconnectHandler = Box<dyn Fn() + Send + Sync>;

/// A snapshot of what the scanner saw for one peripheral.
#[derive(Debug, Clone, Default)]
pub struct PeripheralInfo {
    /// OS-level identifier for the peripheral (Bluetooth address, or a UUID
    /// on hosts that hide addresses).
    pub bt_address: String,
    /// The advertised local name, if any.
    pub local_name: Option<String>,
    /// Received signal strength in dBm.
    pub rssi: i16,
    /// Advertised service UUIDs.
    pub service_uuids: Vec<Uuid>,
    /// Manufacturer-specific data, keyed by manufacturer identifier.
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
}

/// One GATT service discovered on a connected peripheral.
#[derive(Debug, Clone)]
pub struct GattService {
    pub uuid: Uuid,
    /// Characteristic UUIDs contained in this service.
    pub characteristics: Vec<Uuid>,
}

impl GattService {
    pub fn has_characteristic(&self, uuid: Uuid) -> bool {
        self.characteristics.contains(&uuid)
    }
}

/// The scanning side of the host stack.
#[async_trait]
pub trait BleCentral: Send + Sync {
    /// Scan for `duration` and return every peripheral observed, with the
    /// advertisement data the OS collected for it.
    async fn scan(&self, duration: Duration) -> anyhow::Result<Vec<Arc<dyn Peripheral>>>;
}

/// A peripheral the scanner produced. Holds whatever OS handle is needed to
/// connect to it later.
#[async_trait]
pub trait Peripheral: Send + Sync {
    /// The advertisement snapshot captured at scan time.
    fn info(&self) -> PeripheralInfo;

    /// Open a connection and return the live link.
    async fn connect(&self) -> anyhow::Result<Arc<dyn PeripheralLink>>;
}

/// A live GATT connection.
#[async_trait]
pub trait PeripheralLink: Send + Sync {
    async fn discover_services(&self) -> anyhow::Result<Vec<GattService>>;

    /// Write a value to a characteristic. `with_response` selects a GATT
    /// write-with-response; the SESAME protocol only uses fire-and-forget
    /// writes (`false`).
    async fn write(
        &self,
        characteristic: Uuid,
        value: &[u8],
        with_response: bool,
    ) -> anyhow::Result<()>;

    /// Enable notifications on a characteristic and route every value to
    /// `handler`.
    async fn subscribe(
        &self,
        characteristic: Uuid,
        handler: NotificationHandler,
    ) -> anyhow::Result<()>;

    async fn unsubscribe(&self, characteristic: Uuid) -> anyhow::Result<()>;

    /// Register the handler invoked when the link drops, whether by
    /// [`disconnect`](Self::disconnect) or by the peer going away.
    fn set_disconnect_handler(&self, handler: DisconnectHandler);

    async fn disconnect(&self) -> anyhow::Result<()>;
}
