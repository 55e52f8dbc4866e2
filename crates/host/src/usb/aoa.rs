//! Android Open Accessory handshake
//!
//! Switches an Android device into accessory mode with vendor control
//! requests:
//! 1. `GET_PROTOCOL` reads the supported protocol version (0 = unsupported)
//! 2. `SEND_STRING` announces each identity string by index
//! 3. `START` makes the device re-enumerate as an accessory
//!
//! After `START` the device disconnects and comes back with the Google
//! accessory VID and one of the accessory PIDs.

use crate::config::AccessoryIdentity;
use byteorder::{ByteOrder, LittleEndian};
use common::{Error, Result};
use rusb::{DeviceHandle, Direction, Recipient, RequestType, UsbContext};
use std::time::Duration;
use tracing::{debug, info};

/// Vendor ID of a device in accessory mode
pub const ACCESSORY_VID: u16 = 0x18D1;

/// Product IDs of a device in accessory mode (with/without ADB and audio)
pub const ACCESSORY_PIDS: [u16; 4] = [0x2D00, 0x2D01, 0x2D04, 0x2D05];

const ACCESSORY_GET_PROTOCOL: u8 = 51;
const ACCESSORY_SEND_STRING: u8 = 52;
const ACCESSORY_START: u8 = 53;

const CONTROL_TIMEOUT: Duration = Duration::from_secs(1);

/// Whether a VID/PID pair identifies a device in accessory mode
pub fn is_accessory_mode(vendor_id: u16, product_id: u16) -> bool {
    vendor_id == ACCESSORY_VID && ACCESSORY_PIDS.contains(&product_id)
}

/// Decode the `GET_PROTOCOL` response
pub fn parse_protocol_version(response: &[u8]) -> Option<u16> {
    if response.len() != 2 {
        return None;
    }
    Some(LittleEndian::read_u16(response))
}

/// NUL-terminated payload for `SEND_STRING`
pub fn encode_identity_string(value: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(value.len() + 1);
    payload.extend_from_slice(value.as_bytes());
    payload.push(0);
    payload
}

/// Map a libusb error onto the common error type
pub fn map_rusb_error(error: rusb::Error) -> Error {
    match error {
        rusb::Error::Access => Error::PermissionDenied(error.to_string()),
        rusb::Error::NoDevice => Error::NotConnected,
        rusb::Error::Io => Error::Io(std::io::Error::other(error.to_string())),
        other => Error::Usb(other.to_string()),
    }
}

/// Query the accessory protocol version
pub fn get_protocol<T: UsbContext>(handle: &DeviceHandle<T>) -> Result<u16> {
    let request_type = rusb::request_type(Direction::In, RequestType::Vendor, Recipient::Device);
    let mut buffer = [0u8; 2];

    let len = handle
        .read_control(
            request_type,
            ACCESSORY_GET_PROTOCOL,
            0,
            0,
            &mut buffer,
            CONTROL_TIMEOUT,
        )
        .map_err(map_rusb_error)?;

    parse_protocol_version(&buffer[..len])
        .ok_or_else(|| Error::Usb(format!("Unexpected protocol response length {}", len)))
}

/// Run the full handshake, returning the device's protocol version
pub fn start_accessory_mode<T: UsbContext>(
    handle: &DeviceHandle<T>,
    identity: &AccessoryIdentity,
) -> Result<u16> {
    let version = get_protocol(handle)?;
    if version == 0 {
        return Err(Error::Usb(
            "Device does not support accessory mode".to_string(),
        ));
    }
    info!("Accessory protocol version is {}", version);

    let request_type = rusb::request_type(Direction::Out, RequestType::Vendor, Recipient::Device);

    for (index, value) in identity.fields().iter().enumerate() {
        let payload = encode_identity_string(value);
        let written = handle
            .write_control(
                request_type,
                ACCESSORY_SEND_STRING,
                0,
                index as u16,
                &payload,
                CONTROL_TIMEOUT,
            )
            .map_err(map_rusb_error)?;

        if written != payload.len() {
            return Err(Error::Usb(format!(
                "Short write for identity string {}: {} of {} bytes",
                index,
                written,
                payload.len()
            )));
        }
        debug!("Sent identity string {}: {:?}", index, value);
    }

    handle
        .write_control(
            request_type,
            ACCESSORY_START,
            0,
            0,
            &[],
            CONTROL_TIMEOUT,
        )
        .map_err(map_rusb_error)?;

    info!("Requested accessory mode");
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessory_mode_ids() {
        assert!(is_accessory_mode(0x18D1, 0x2D00));
        assert!(is_accessory_mode(0x18D1, 0x2D01));
        assert!(is_accessory_mode(0x18D1, 0x2D04));
        assert!(is_accessory_mode(0x18D1, 0x2D05));

        // Audio-only accessory modes have no bulk pair
        assert!(!is_accessory_mode(0x18D1, 0x2D02));
        // ADB on a Pixel
        assert!(!is_accessory_mode(0x18D1, 0x4EE7));
        assert!(!is_accessory_mode(0x04E8, 0x2D00));
    }

    #[test]
    fn test_parse_protocol_version() {
        assert_eq!(parse_protocol_version(&[0x02, 0x00]), Some(2));
        assert_eq!(parse_protocol_version(&[0x01, 0x01]), Some(0x0101));
        assert_eq!(parse_protocol_version(&[0x01]), None);
        assert_eq!(parse_protocol_version(&[]), None);
    }

    #[test]
    fn test_encode_identity_string() {
        assert_eq!(encode_identity_string("Acme"), b"Acme\0".to_vec());
        assert_eq!(encode_identity_string(""), vec![0]);
    }

    #[test]
    fn test_map_rusb_error() {
        assert!(matches!(
            map_rusb_error(rusb::Error::Access),
            Error::PermissionDenied(_)
        ));
        assert!(matches!(
            map_rusb_error(rusb::Error::NoDevice),
            Error::NotConnected
        ));
        assert!(matches!(map_rusb_error(rusb::Error::Io), Error::Io(_)));
        assert!(matches!(
            map_rusb_error(rusb::Error::Timeout),
            Error::Usb(_)
        ));
    }
}
