//! Mechanical status and setting records reported by the devices.
//!
//! Both product families share an 8-byte status record whose last byte is a
//! flag field (bit 1 in-lock-range, bit 2 in-unlock-range, bit 5
//! battery-critical); the leading fields differ per product, as does the
//! battery chemistry and therefore the voltage → percentage curve.

use crate::error::{Error, Result};

const BATTERY_PERCENTS: [f64; 10] = [100.0, 50.0, 40.0, 32.0, 21.0, 13.0, 10.0, 7.0, 3.0, 0.0];
const LOCK_BATTERY_VOLTS: [f64; 10] = [6.0, 5.8, 5.7, 5.6, 5.4, 5.2, 5.1, 5.0, 4.8, 4.6];
const BOT_BATTERY_VOLTS: [f64; 10] = [3.0, 2.9, 2.85, 2.8, 2.7, 2.6, 2.55, 2.5, 2.4, 2.3];

const FLAG_IN_LOCK_RANGE: u8 = 1 << 1;
const FLAG_IN_UNLOCK_RANGE: u8 = 1 << 2;
const FLAG_BATTERY_CRITICAL: u8 = 1 << 5;

/// Position the lock is told to move to when no target is active.
pub const NO_TARGET: i16 = i16::MIN;

/// Piecewise-linear interpolation over the anchor voltages, clamped at the
/// endpoints.
fn battery_percent(voltage: f64, volts: &[f64; 10]) -> u8 {
    if voltage >= volts[0] {
        return 100;
    }
    if voltage <= volts[volts.len() - 1] {
        return 0;
    }
    for i in 0..volts.len() - 1 {
        if voltage <= volts[i] && voltage > volts[i + 1] {
            let t = (voltage - volts[i + 1]) / (volts[i] - volts[i + 1]);
            return (BATTERY_PERCENTS[i + 1] + t * (BATTERY_PERCENTS[i] - BATTERY_PERCENTS[i + 1]))
                as u8;
        }
    }
    0
}

fn read_u16(raw: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([raw[at], raw[at + 1]])
}

fn read_i16(raw: &[u8], at: usize) -> i16 {
    i16::from_le_bytes([raw[at], raw[at + 1]])
}

/// Mechanical status of a SESAME lock (8 bytes).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LockMechStatus {
    battery_voltage: f64,
    target: i16,
    position: i16,
    ret_code: u8,
    flags: u8,
}

impl LockMechStatus {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < 8 {
            return Err(Error::Protocol("lock mechanical status too short".into()));
        }
        Ok(LockMechStatus {
            battery_voltage: f64::from(read_u16(raw, 0)) * 7.2 / 1023.0,
            target: read_i16(raw, 2),
            position: read_i16(raw, 4),
            ret_code: raw[6],
            flags: raw[7],
        })
    }

    pub fn battery_voltage(&self) -> f64 {
        self.battery_voltage
    }

    pub fn battery_percent(&self) -> u8 {
        battery_percent(self.battery_voltage, &LOCK_BATTERY_VOLTS)
    }

    /// The position the motor is currently driving toward, or [`NO_TARGET`].
    pub fn target(&self) -> i16 {
        self.target
    }

    pub fn position(&self) -> i16 {
        self.position
    }

    /// Result of the last locking/unlocking request.
    pub fn ret_code(&self) -> u8 {
        self.ret_code
    }

    pub fn is_in_lock_range(&self) -> bool {
        self.flags & FLAG_IN_LOCK_RANGE != 0
    }

    pub fn is_in_unlock_range(&self) -> bool {
        self.flags & FLAG_IN_UNLOCK_RANGE != 0
    }

    pub fn is_battery_critical(&self) -> bool {
        self.flags & FLAG_BATTERY_CRITICAL != 0
    }
}

/// Mechanical status of a SESAME bot (8 bytes).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BotMechStatus {
    battery_voltage: f64,
    motor_status: u8,
    flags: u8,
}

impl BotMechStatus {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < 8 {
            return Err(Error::Protocol("bot mechanical status too short".into()));
        }
        Ok(BotMechStatus {
            battery_voltage: f64::from(read_u16(raw, 0)) * 3.6 / 1023.0,
            motor_status: raw[4],
            flags: raw[7],
        })
    }

    pub fn battery_voltage(&self) -> f64 {
        self.battery_voltage
    }

    pub fn battery_percent(&self) -> u8 {
        battery_percent(self.battery_voltage, &BOT_BATTERY_VOLTS)
    }

    pub fn motor_status(&self) -> u8 {
        self.motor_status
    }

    pub fn is_in_lock_range(&self) -> bool {
        self.flags & FLAG_IN_LOCK_RANGE != 0
    }

    pub fn is_in_unlock_range(&self) -> bool {
        self.flags & FLAG_IN_UNLOCK_RANGE != 0
    }

    pub fn is_battery_critical(&self) -> bool {
        self.flags & FLAG_BATTERY_CRITICAL != 0
    }
}

/// Mechanical status of either product.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MechStatus {
    Lock(LockMechStatus),
    Bot(BotMechStatus),
}

impl MechStatus {
    pub fn battery_voltage(&self) -> f64 {
        match self {
            MechStatus::Lock(s) => s.battery_voltage(),
            MechStatus::Bot(s) => s.battery_voltage(),
        }
    }

    pub fn battery_percent(&self) -> u8 {
        match self {
            MechStatus::Lock(s) => s.battery_percent(),
            MechStatus::Bot(s) => s.battery_percent(),
        }
    }

    pub fn is_in_lock_range(&self) -> bool {
        match self {
            MechStatus::Lock(s) => s.is_in_lock_range(),
            MechStatus::Bot(s) => s.is_in_lock_range(),
        }
    }

    pub fn is_in_unlock_range(&self) -> bool {
        match self {
            MechStatus::Lock(s) => s.is_in_unlock_range(),
            MechStatus::Bot(s) => s.is_in_unlock_range(),
        }
    }

    pub fn is_battery_critical(&self) -> bool {
        match self {
            MechStatus::Lock(s) => s.is_battery_critical(),
            MechStatus::Bot(s) => s.is_battery_critical(),
        }
    }
}

/// Mechanical setting of a SESAME lock: the two configured stop positions.
/// Trailing record bytes beyond them exist on the wire but carry nothing the
/// client uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockMechSetting {
    lock_position: i16,
    unlock_position: i16,
}

impl LockMechSetting {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < 4 {
            return Err(Error::Protocol("lock mechanical setting too short".into()));
        }
        Ok(LockMechSetting {
            lock_position: read_i16(raw, 0),
            unlock_position: read_i16(raw, 2),
        })
    }

    pub fn lock_position(&self) -> i16 {
        self.lock_position
    }

    pub fn unlock_position(&self) -> i16 {
        self.unlock_position
    }

    /// The stop positions have been calibrated (they differ).
    pub fn is_configured(&self) -> bool {
        self.lock_position != self.unlock_position
    }
}

/// Rotation direction preference of a bot's arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmDirection {
    Normal,
    Reversed,
}

/// What a press of the bot's physical button does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonMode {
    Click,
    Toggle,
}

/// Mechanical setting of a SESAME bot (12 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BotMechSetting {
    arm_direction: ArmDirection,
    lock_sec: u8,
    unlock_sec: u8,
    click_lock_sec: u8,
    click_hold_sec: u8,
    click_unlock_sec: u8,
    button_mode: ButtonMode,
}

impl BotMechSetting {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < 7 {
            return Err(Error::Protocol("bot mechanical setting too short".into()));
        }
        let arm_direction = match raw[0] {
            0 => ArmDirection::Normal,
            1 => ArmDirection::Reversed,
            other => {
                return Err(Error::Protocol(format!("unknown arm direction {other:#04x}")));
            }
        };
        let button_mode = match raw[6] {
            0 => ButtonMode::Click,
            1 => ButtonMode::Toggle,
            other => {
                return Err(Error::Protocol(format!("unknown button mode {other:#04x}")));
            }
        };
        Ok(BotMechSetting {
            arm_direction,
            lock_sec: raw[1],
            unlock_sec: raw[2],
            click_lock_sec: raw[3],
            click_hold_sec: raw[4],
            click_unlock_sec: raw[5],
            button_mode,
        })
    }

    pub fn arm_direction(&self) -> ArmDirection {
        self.arm_direction
    }

    pub fn lock_sec(&self) -> u8 {
        self.lock_sec
    }

    pub fn unlock_sec(&self) -> u8 {
        self.unlock_sec
    }

    pub fn click_lock_sec(&self) -> u8 {
        self.click_lock_sec
    }

    pub fn click_hold_sec(&self) -> u8 {
        self.click_hold_sec
    }

    pub fn click_unlock_sec(&self) -> u8 {
        self.click_unlock_sec
    }

    pub fn button_mode(&self) -> ButtonMode {
        self.button_mode
    }
}

/// Mechanical setting of either product.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MechSetting {
    Lock(LockMechSetting),
    Bot(BotMechSetting),
}

impl MechSetting {
    pub fn as_lock(&self) -> Option<&LockMechSetting> {
        match self {
            MechSetting::Lock(s) => Some(s),
            MechSetting::Bot(_) => None,
        }
    }

    pub fn as_bot(&self) -> Option<&BotMechSetting> {
        match self {
            MechSetting::Bot(s) => Some(s),
            MechSetting::Lock(_) => None,
        }
    }
}
