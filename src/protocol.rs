//! Application-layer codec: op/item/result codes, outbound command encoding,
//! inbound notify decoding, and the history-tag field.
//!
//! After decryption every frame is `op_code || payload`; the only op codes a
//! device notifies with are `Publish` and `Response`.

use crate::error::{Error, Result};

/// Operation requested of (or reported by) the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Create = 1,
    Read = 2,
    Update = 3,
    Delete = 4,
    Sync = 5,
    Async = 6,
    Response = 7,
    Publish = 8,
    Undefine = 16,
}

impl TryFrom<u8> for OpCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            1 => OpCode::Create,
            2 => OpCode::Read,
            3 => OpCode::Update,
            4 => OpCode::Delete,
            5 => OpCode::Sync,
            6 => OpCode::Async,
            7 => OpCode::Response,
            8 => OpCode::Publish,
            16 => OpCode::Undefine,
            other => return Err(Error::Protocol(format!("unknown op code {other:#04x}"))),
        })
    }
}

/// The item an operation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ItemCode {
    None = 0,
    Registration = 1,
    Login = 2,
    User = 3,
    History = 4,
    VersionTag = 5,
    DisconnectRebootNow = 6,
    EnableDfu = 7,
    Time = 8,
    BleConnectionParam = 9,
    BleAdvParam = 10,
    Autolock = 11,
    ServerAdvKick = 12,
    SsmToken = 13,
    Initial = 14,
    Irer = 15,
    TimePhone = 16,
    MechSetting = 80,
    MechStatus = 81,
    Lock = 82,
    Unlock = 83,
    MoveTo = 84,
    DriveDirection = 85,
    Stop = 86,
    DetectDir = 87,
    Toggle = 88,
    Click = 89,
}

impl TryFrom<u8> for ItemCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => ItemCode::None,
            1 => ItemCode::Registration,
            2 => ItemCode::Login,
            3 => ItemCode::User,
            4 => ItemCode::History,
            5 => ItemCode::VersionTag,
            6 => ItemCode::DisconnectRebootNow,
            7 => ItemCode::EnableDfu,
            8 => ItemCode::Time,
            9 => ItemCode::BleConnectionParam,
            10 => ItemCode::BleAdvParam,
            11 => ItemCode::Autolock,
            12 => ItemCode::ServerAdvKick,
            13 => ItemCode::SsmToken,
            14 => ItemCode::Initial,
            15 => ItemCode::Irer,
            16 => ItemCode::TimePhone,
            80 => ItemCode::MechSetting,
            81 => ItemCode::MechStatus,
            82 => ItemCode::Lock,
            83 => ItemCode::Unlock,
            84 => ItemCode::MoveTo,
            85 => ItemCode::DriveDirection,
            86 => ItemCode::Stop,
            87 => ItemCode::DetectDir,
            88 => ItemCode::Toggle,
            89 => ItemCode::Click,
            other => return Err(Error::Protocol(format!("unknown item code {other:#04x}"))),
        })
    }
}

/// Outcome of a command, reported in a [`Response`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResultCode {
    Success = 0,
    InvalidFormat = 1,
    NotSupported = 2,
    StorageFail = 3,
    InvalidSig = 4,
    NotFound = 5,
    Unknown = 6,
    Busy = 7,
    InvalidParam = 8,
}

impl TryFrom<u8> for ResultCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => ResultCode::Success,
            1 => ResultCode::InvalidFormat,
            2 => ResultCode::NotSupported,
            3 => ResultCode::StorageFail,
            4 => ResultCode::InvalidSig,
            5 => ResultCode::NotFound,
            6 => ResultCode::Unknown,
            7 => ResultCode::Busy,
            8 => ResultCode::InvalidParam,
            other => return Err(Error::Protocol(format!("unknown result code {other:#04x}"))),
        })
    }
}

/// An outbound command: `op_code || item_code || body`.
#[derive(Debug, Clone)]
pub struct Command {
    pub op: OpCode,
    pub item: ItemCode,
    pub body: Vec<u8>,
}

impl Command {
    pub fn new(op: OpCode, item: ItemCode, body: Vec<u8>) -> Self {
        Command { op, item, body }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.body.len());
        out.push(self.op as u8);
        out.push(self.item as u8);
        out.extend_from_slice(&self.body);
        out
    }
}

/// An unsolicited `publish` from the device: `item_code || body`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub item: ItemCode,
    pub body: Vec<u8>,
}

impl Publish {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let (&item, body) = payload
            .split_first()
            .ok_or_else(|| Error::Protocol("truncated publish".into()))?;
        Ok(Publish {
            item: ItemCode::try_from(item)?,
            body: body.to_vec(),
        })
    }
}

/// A reply to an earlier command: `item_code || op_code || result_code || body`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub item: ItemCode,
    pub op: OpCode,
    pub result: ResultCode,
    pub body: Vec<u8>,
}

impl Response {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let [item, op, result, body @ ..] = payload else {
            return Err(Error::Protocol("truncated response".into()));
        };
        Ok(Response {
            item: ItemCode::try_from(*item)?,
            op: OpCode::try_from(*op)?,
            result: ResultCode::try_from(*result)?,
            body: body.to_vec(),
        })
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Publish(Publish),
    Response(Response),
}

impl Notification {
    pub fn parse(frame: &[u8]) -> Result<Self> {
        let (&op, payload) = frame
            .split_first()
            .ok_or_else(|| Error::Protocol("empty notify frame".into()))?;
        match OpCode::try_from(op)? {
            OpCode::Publish => Ok(Notification::Publish(Publish::parse(payload)?)),
            OpCode::Response => Ok(Notification::Response(Response::parse(payload)?)),
            other => Err(Error::Protocol(format!(
                "unexpected notify op code {other:?}"
            ))),
        }
    }
}

/// Length of the history-tag field carried by lock/unlock/click commands.
pub const HISTORY_TAG_LEN: usize = 22;

/// Encode a caller-supplied label into the fixed 22-byte history-tag field:
/// one length byte, at most 21 bytes of UTF-8 (truncated on a code-point
/// boundary), zero padding.
pub fn history_tag(tag: &str) -> [u8; HISTORY_TAG_LEN] {
    let bytes = tag.as_bytes();
    let mut cut = bytes.len().min(HISTORY_TAG_LEN - 1);
    while !tag.is_char_boundary(cut) {
        cut -= 1;
    }

    let mut out = [0u8; HISTORY_TAG_LEN];
    out[0] = cut as u8;
    out[1..1 + cut].copy_from_slice(&bytes[..cut]);
    out
}
