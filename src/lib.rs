//! Host-side BLE client for CANDY HOUSE SESAME smart locks and bots.
//!
//! The crate is the device session core: it decodes SESAME advertisements,
//! speaks the fragmented GATT transport, runs the authenticated key-exchange
//! handshake, encrypts the channel with per-session AES-CCM, and exposes one
//! [`DeviceSession`] per device with lock/unlock/click/toggle operations and
//! mechanical status reporting.
//!
//! It deliberately owns no Bluetooth adapter: the embedding application
//! implements the traits in [`ble`] over its host stack and hands a scanner
//! to [`BleManager`]. Registration with the vendor mobile app is assumed to
//! have happened already; the caller supplies the resulting device secret
//! key and long-term public key per session.

pub mod advertisement;
pub mod ble;
pub mod crypto;
pub mod device;
pub mod error;
pub mod manager;
pub mod mech;
pub mod protocol;
pub mod session;
#[cfg(test)]
mod tests;
pub mod transport;

pub use advertisement::{Advertisement, ProductModel};
pub use crypto::AppKey;
pub use device::{DeviceKey, DeviceStatus, Intention, LoginState};
pub use error::{Error, Result};
pub use manager::BleManager;
pub use mech::{MechSetting, MechStatus};
pub use session::DeviceSession;
