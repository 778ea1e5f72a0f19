//! Per-device identity and classification: the registered key material, the
//! device status ladder with its login classes, the derived motion intention,
//! and the per-product profile that the session is parameterized over.

use std::fmt;

use crate::error::{Error, Result};
use crate::mech::{
    BotMechSetting, BotMechStatus, LockMechSetting, LockMechStatus, MechSetting, MechStatus,
    NO_TARGET,
};

/// The only key slot this client operates: multi-host index assignment is
/// done by the vendor app, never by us.
pub const KEY_INDEX: [u8; 2] = [0x00, 0x00];

/// Key material registered for one device: the 16-byte shared secret and the
/// device's 64-byte long-term public key, both handed out by the vendor app
/// at registration time.
#[derive(Clone, Default)]
pub struct DeviceKey {
    secret_key: Option<[u8; 16]>,
    public_key: Option<[u8; 64]>,
}

impl DeviceKey {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_secret_key(&mut self, key: &[u8]) -> Result<()> {
        self.secret_key = Some(key.try_into().map_err(|_| {
            Error::InvalidArgument(format!("secret key must be 16 bytes, got {}", key.len()))
        })?);
        Ok(())
    }

    pub fn set_secret_key_hex(&mut self, key: &str) -> Result<()> {
        let bytes = hex::decode(key)
            .map_err(|e| Error::InvalidArgument(format!("secret key is not valid hex: {e}")))?;
        self.set_secret_key(&bytes)
    }

    pub fn set_device_public_key(&mut self, key: &[u8]) -> Result<()> {
        self.public_key = Some(key.try_into().map_err(|_| {
            Error::InvalidArgument(format!(
                "device public key must be 64 bytes, got {}",
                key.len()
            ))
        })?);
        Ok(())
    }

    pub fn set_device_public_key_hex(&mut self, key: &str) -> Result<()> {
        let bytes = hex::decode(key).map_err(|e| {
            Error::InvalidArgument(format!("device public key is not valid hex: {e}"))
        })?;
        self.set_device_public_key(&bytes)
    }

    pub fn secret_key(&self) -> Option<[u8; 16]> {
        self.secret_key
    }

    pub fn device_public_key(&self) -> Option<[u8; 64]> {
        self.public_key
    }

    pub fn key_index(&self) -> [u8; 2] {
        KEY_INDEX
    }
}

impl fmt::Debug for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceKey")
            .field("secret_key", &self.secret_key.map(|_| "<set>"))
            .field("public_key", &self.public_key.map(|_| "<set>"))
            .finish()
    }
}

/// Whether a [`DeviceStatus`] belongs to the authenticated half of the
/// session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    LoggedIn,
    NotLoggedIn,
}

/// The device status ladder. The session's login event is signaled exactly
/// while the current status is of the `LoggedIn` class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    NoBleSignal,
    ReceivedBle,
    BleConnecting,
    WaitingGatt,
    BleLogining,
    Registering,
    ReadyToRegister,
    WaitingForAuth,
    Reset,
    DfuMode,
    Busy,
    NoSettings,
    Locked,
    Moved,
    Unlocked,
    WaitApConnect,
    IotConnected,
    IotDisconnected,
}

impl DeviceStatus {
    pub fn login_state(self) -> LoginState {
        match self {
            DeviceStatus::NoSettings
            | DeviceStatus::Locked
            | DeviceStatus::Moved
            | DeviceStatus::Unlocked
            | DeviceStatus::WaitApConnect
            | DeviceStatus::IotConnected
            | DeviceStatus::IotDisconnected => LoginState::LoggedIn,
            _ => LoginState::NotLoggedIn,
        }
    }

    pub fn is_logged_in(self) -> bool {
        self.login_state() == LoginState::LoggedIn
    }
}

/// What the mechanism is currently trying to do, derived from status and
/// (for locks) the configured stop positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intention {
    Idle,
    Locking,
    Unlocking,
    Holding,
    MovingToUnknownTarget,
}

/// Parsed body of a successful login response.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoginResponse {
    /// The device's clock at login, as a raw epoch timestamp.
    pub system_time: u32,
    pub mech_setting: MechSetting,
    pub mech_status: MechStatus,
}

/// The capability set distinguishing the two product families. The session
/// logic is shared; everything product-specific funnels through here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeviceProfile {
    Lock,
    Bot,
}

impl DeviceProfile {
    pub(crate) fn parse_status(self, raw: &[u8]) -> Result<MechStatus> {
        match self {
            DeviceProfile::Lock => Ok(MechStatus::Lock(LockMechStatus::parse(raw)?)),
            DeviceProfile::Bot => Ok(MechStatus::Bot(BotMechStatus::parse(raw)?)),
        }
    }

    pub(crate) fn parse_setting(self, raw: &[u8]) -> Result<MechSetting> {
        match self {
            DeviceProfile::Lock => Ok(MechSetting::Lock(LockMechSetting::parse(raw)?)),
            DeviceProfile::Bot => Ok(MechSetting::Bot(BotMechSetting::parse(raw)?)),
        }
    }

    /// Login responses carry `system_time(4) || reserved(4) || setting(12) ||
    /// status(8)` for both families.
    pub(crate) fn parse_login_response(self, raw: &[u8]) -> Result<LoginResponse> {
        if raw.len() < 28 {
            return Err(Error::Protocol("login response too short".into()));
        }
        Ok(LoginResponse {
            system_time: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            mech_setting: self.parse_setting(&raw[8..20])?,
            mech_status: self.parse_status(&raw[20..28])?,
        })
    }

    pub(crate) fn supports_click(self) -> bool {
        matches!(self, DeviceProfile::Bot)
    }

    /// Recompute the intention after a status update. A lock whose target
    /// matches neither configured position keeps its previous intention.
    pub(crate) fn derive_intention(
        self,
        status: &MechStatus,
        setting: Option<&MechSetting>,
        previous: Intention,
    ) -> Intention {
        match (self, status) {
            (DeviceProfile::Lock, MechStatus::Lock(status)) => {
                if status.target() == NO_TARGET {
                    return Intention::Idle;
                }
                match setting.and_then(MechSetting::as_lock) {
                    None => Intention::MovingToUnknownTarget,
                    Some(setting) if status.target() == setting.lock_position() => {
                        Intention::Locking
                    }
                    Some(setting) if status.target() == setting.unlock_position() => {
                        Intention::Unlocking
                    }
                    Some(_) => previous,
                }
            }
            (DeviceProfile::Bot, MechStatus::Bot(status)) => match status.motor_status() {
                0 => Intention::Idle,
                1 => Intention::Locking,
                2 => Intention::Holding,
                3 => Intention::Unlocking,
                _ => Intention::MovingToUnknownTarget,
            },
            _ => previous,
        }
    }

    /// The device status to park in after a successful login.
    pub(crate) fn login_status(self, response: &LoginResponse) -> DeviceStatus {
        let configured = match self {
            DeviceProfile::Lock => response
                .mech_setting
                .as_lock()
                .is_some_and(LockMechSetting::is_configured),
            // A bot needs no stop-position calibration.
            DeviceProfile::Bot => true,
        };
        if !configured {
            DeviceStatus::NoSettings
        } else if response.mech_status.is_in_lock_range() {
            DeviceStatus::Locked
        } else {
            DeviceStatus::Unlocked
        }
    }
}
