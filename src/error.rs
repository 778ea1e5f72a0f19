use thiserror::Error;

/// Everything that can go wrong between a scan and a turned lock.
///
/// The session layer keeps `Auth` and `Protocol` failures to itself (they are
/// logged and the offending frame is dropped); every other variant reaches the
/// caller of the operation that triggered it.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed caller input: bad key length, invalid hex, out-of-range enum byte.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The advertisement is not a parseable SESAME advertisement.
    #[error("invalid advertisement: {0}")]
    InvalidAdvertisement(String),

    /// The product type is not in the known set.
    #[error("unsupported device: {0}")]
    UnsupportedDevice(String),

    /// The device has never been registered with the vendor mobile app.
    #[error("initial configuration needed from the official mobile app")]
    InitialConfigNeeded,

    /// `scan_by_address` did not find the requested peripheral.
    #[error("device not found: {0}")]
    NotFound(String),

    /// A failure reported by the host BLE stack.
    #[error("BLE transport failure")]
    Transport(#[source] anyhow::Error),

    /// AES-CCM tag mismatch on an inbound frame.
    #[error("authenticated decryption failed")]
    Auth,

    /// Unexpected op/item/result code or a truncated frame.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Operation attempted before the login handshake completed.
    #[error("operation requires a logged-in session")]
    NotLoggedIn,

    /// `toggle` was invoked without a known mechanical status.
    #[error("mechanical status unknown")]
    StatusUnknown,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
