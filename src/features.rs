//! CCID reader features: the feature-request TLV and control codes.

// ───── Std Lib ─────
use std::collections::HashMap;

// ───── Local Modules ─────
use crate::error::Error;

// Feature tags from the CCID specification, part 10.
pub const FEATURE_VERIFY_PIN_START: u8 = 0x01;
pub const FEATURE_VERIFY_PIN_FINISH: u8 = 0x02;
pub const FEATURE_MODIFY_PIN_START: u8 = 0x03;
pub const FEATURE_MODIFY_PIN_FINISH: u8 = 0x04;
pub const FEATURE_GET_KEY_PRESSED: u8 = 0x05;
pub const FEATURE_VERIFY_PIN_DIRECT: u8 = 0x06;
pub const FEATURE_MODIFY_PIN_DIRECT: u8 = 0x07;
pub const FEATURE_MCT_READER_DIRECT: u8 = 0x08;
pub const FEATURE_MCT_UNIVERSAL: u8 = 0x09;
pub const FEATURE_IFD_PIN_PROPERTIES: u8 = 0x0A;
pub const FEATURE_ABORT: u8 = 0x0B;
pub const FEATURE_SET_SPE_MESSAGE: u8 = 0x0C;
pub const FEATURE_VERIFY_PIN_DIRECT_APP_ID: u8 = 0x0D;
pub const FEATURE_MODIFY_PIN_DIRECT_APP_ID: u8 = 0x0E;
pub const FEATURE_WRITE_DISPLAY: u8 = 0x0F;
pub const FEATURE_GET_KEY: u8 = 0x10;
pub const FEATURE_IFD_DISPLAY_PROPERTIES: u8 = 0x11;
pub const FEATURE_GET_TLV_PROPERTIES: u8 = 0x12;
pub const FEATURE_CCID_ESC_COMMAND: u8 = 0x13;

/// Composes a reader control code from a function number.
///
/// winscard and pcsclite derive their `SCARD_CTL_CODE` differently; this is
/// the platform-conditional composition.
#[cfg(target_os = "windows")]
pub const fn ccid_ioctl(code: u32) -> u32 {
    (0x31 << 16) | (code << 2)
}

/// Composes a reader control code from a function number.
///
/// winscard and pcsclite derive their `SCARD_CTL_CODE` differently; this is
/// the platform-conditional composition.
#[cfg(not(target_os = "windows"))]
pub const fn ccid_ioctl(code: u32) -> u32 {
    0x4200_0000 | code
}

/// Control code asking a CCID reader for its feature TLV.
pub const CM_IOCTL_GET_FEATURE_REQUEST: u32 = ccid_ioctl(3400);

/// Decodes a `CM_IOCTL_GET_FEATURE_REQUEST` response.
///
/// The body is a sequence of `tag(1) · length(1) · value(length)` records,
/// value big-endian unsigned. Returns the `feature tag → control code`
/// mapping. A truncated record or a value wider than a control code fails
/// with `InvalidResponse`.
pub fn decode_feature_tlv(data: &[u8]) -> Result<HashMap<u8, u32>, Error> {
    let mut features = HashMap::new();
    let mut index = 0;
    while index < data.len() {
        if index + 2 > data.len() {
            log::warn!("feature TLV truncated at offset {}", index);
            return Err(Error::InvalidResponse);
        }
        let tag = data[index];
        let length = data[index + 1] as usize;
        index += 2;
        if length > 4 || index + length > data.len() {
            log::warn!(
                "feature TLV record 0x{:02X} has bad length {}",
                tag,
                length
            );
            return Err(Error::InvalidResponse);
        }
        let mut value: u32 = 0;
        for &byte in &data[index..index + length] {
            value = (value << 8) | u32::from(byte);
        }
        index += length;
        features.insert(tag, value);
    }
    Ok(features)
}
