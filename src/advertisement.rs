//! Decoding of SESAME advertisements into product identity.
//!
//! Every SESAME device advertises the vendor service UUID plus a
//! manufacturer-data entry laid out as `product_type (1) || reserved (1) ||
//! flags (1)`, with flag bit 0 marking a registered device. The device UUID
//! travels base64-encoded in the local name, except on the WM2 where it is
//! synthesized from a fixed prefix and six extra manufacturer-data bytes.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use uuid::Uuid;

use crate::ble::{PeripheralInfo, MANUFACTURER_ID, SERVICE_UUID};
use crate::device::DeviceProfile;
use crate::error::{Error, Result};

/// Known SESAME product families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProductModel {
    /// Wi-Fi module. Advertises like the rest but has no lockable mechanism.
    Wm2,
    /// SESAME 3 lock.
    Ss2,
    /// SESAME 4 lock.
    Ss4,
    /// SESAME bot button pusher.
    SesameBot1,
}

impl ProductModel {
    pub fn from_type_byte(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ProductModel::Ss2),
            1 => Ok(ProductModel::Wm2),
            2 => Ok(ProductModel::SesameBot1),
            4 => Ok(ProductModel::Ss4),
            other => Err(Error::UnsupportedDevice(format!(
                "unknown product type {other:#04x}"
            ))),
        }
    }

    pub fn from_model_name(name: &str) -> Result<Self> {
        match name {
            "sesame_2" => Ok(ProductModel::Ss2),
            "wm_2" => Ok(ProductModel::Wm2),
            "ssmbot_1" => Ok(ProductModel::SesameBot1),
            "sesame_4" => Ok(ProductModel::Ss4),
            other => Err(Error::UnsupportedDevice(format!(
                "unknown device model {other:?}"
            ))),
        }
    }

    pub fn model_name(self) -> &'static str {
        match self {
            ProductModel::Wm2 => "wm_2",
            ProductModel::Ss2 => "sesame_2",
            ProductModel::Ss4 => "sesame_4",
            ProductModel::SesameBot1 => "ssmbot_1",
        }
    }

    pub fn product_type_byte(self) -> u8 {
        match self {
            ProductModel::Ss2 => 0,
            ProductModel::Wm2 => 1,
            ProductModel::SesameBot1 => 2,
            ProductModel::Ss4 => 4,
        }
    }

    pub fn is_locker(self) -> bool {
        !matches!(self, ProductModel::Wm2)
    }

    /// The session profile for lockable variants.
    pub(crate) fn profile(self) -> Option<DeviceProfile> {
        match self {
            ProductModel::Wm2 => None,
            ProductModel::Ss2 | ProductModel::Ss4 => Some(DeviceProfile::Lock),
            ProductModel::SesameBot1 => Some(DeviceProfile::Bot),
        }
    }
}

/// Identity extracted from one SESAME advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    bt_address: String,
    rssi: i16,
    product_model: ProductModel,
    is_registered: bool,
    device_uuid: Uuid,
}

impl Advertisement {
    /// Decode the scanner's snapshot of one peripheral. Fails with
    /// [`Error::InvalidAdvertisement`] when the required fields are absent
    /// and [`Error::UnsupportedDevice`] for unknown product types.
    pub fn parse(info: &PeripheralInfo) -> Result<Self> {
        if !info.service_uuids.contains(&SERVICE_UUID) {
            return Err(Error::InvalidAdvertisement(
                "vendor service UUID not advertised".into(),
            ));
        }
        let data = info
            .manufacturer_data
            .get(&MANUFACTURER_ID)
            .ok_or_else(|| Error::InvalidAdvertisement("no manufacturer data".into()))?;
        if data.len() < 3 {
            return Err(Error::InvalidAdvertisement(format!(
                "manufacturer data too short ({} bytes)",
                data.len()
            )));
        }

        let product_model = ProductModel::from_type_byte(data[0])?;
        let is_registered = data[2] & 1 != 0;
        let device_uuid = match product_model {
            ProductModel::Wm2 => wm2_device_uuid(data)?,
            _ => named_device_uuid(info.local_name.as_deref())?,
        };

        Ok(Advertisement {
            bt_address: info.bt_address.clone(),
            rssi: info.rssi,
            product_model,
            is_registered,
            device_uuid,
        })
    }

    pub fn bt_address(&self) -> &str {
        &self.bt_address
    }

    pub fn rssi(&self) -> i16 {
        self.rssi
    }

    pub fn product_model(&self) -> ProductModel {
        self.product_model
    }

    pub fn is_registered(&self) -> bool {
        self.is_registered
    }

    pub fn device_uuid(&self) -> Uuid {
        self.device_uuid
    }
}

/// WM2 advertisements carry six identifier bytes behind the flags; the UUID
/// is those bytes behind a fixed vendor prefix.
fn wm2_device_uuid(data: &[u8]) -> Result<Uuid> {
    const PREFIX: [u8; 10] = [0x00, 0x00, 0x00, 0x00, 0x05, 0x5a, 0xfd, 0x81, 0x00, 0x01];

    if data.len() < 9 {
        return Err(Error::InvalidAdvertisement(
            "WM2 manufacturer data too short for a device identifier".into(),
        ));
    }
    let mut bytes = [0u8; 16];
    bytes[..10].copy_from_slice(&PREFIX);
    bytes[10..].copy_from_slice(&data[3..9]);
    Ok(Uuid::from_bytes(bytes))
}

/// All other models put the base64 of the 16-byte device UUID in the local
/// name, with its padding stripped.
fn named_device_uuid(local_name: Option<&str>) -> Result<Uuid> {
    let name =
        local_name.ok_or_else(|| Error::InvalidAdvertisement("no local name".into()))?;
    let decoded = BASE64
        .decode(format!("{name}=="))
        .map_err(|e| Error::InvalidAdvertisement(format!("local name is not base64: {e}")))?;
    Uuid::from_slice(&decoded).map_err(|e| {
        Error::InvalidAdvertisement(format!("local name does not hold a device UUID: {e}"))
    })
}
