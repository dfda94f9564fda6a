// Jackson Coxson

use crate::{IdeviceError, util::plist_to_xml_bytes};

pub const HEADER_LEN: usize = 16;

/// Largest message body accepted from usbmuxd
pub const MAX_BODY_LEN: usize = 1024 * 1024;

/// The fixed little-endian header preceding every usbmuxd message
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawPacketHeader {
    /// Length of the header plus body
    pub size: u32,
    pub version: u32,
    pub message: u32,
    pub tag: u32,
}

impl RawPacketHeader {
    pub fn parse(buf: &[u8; HEADER_LEN]) -> Result<Self, IdeviceError> {
        let word = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        let header = Self {
            size: word(0),
            version: word(4),
            message: word(8),
            tag: word(12),
        };
        if (header.size as usize) < HEADER_LEN {
            return Err(IdeviceError::ProtocolError(format!(
                "usbmuxd packet length {} is shorter than its header",
                header.size
            )));
        }
        if header.size as usize > HEADER_LEN + MAX_BODY_LEN {
            return Err(IdeviceError::ProtocolError(format!(
                "usbmuxd packet length {} exceeds the maximum of {}",
                header.size,
                HEADER_LEN + MAX_BODY_LEN
            )));
        }
        Ok(header)
    }

    pub fn body_len(&self) -> usize {
        self.size as usize - HEADER_LEN
    }
}

/// Serializes a plist request with its usbmuxd header
pub fn encode(
    body: plist::Dictionary,
    version: u32,
    message: u32,
    tag: u32,
) -> Result<Vec<u8>, IdeviceError> {
    let body = plist_to_xml_bytes(&plist::Value::Dictionary(body))?;
    let size = u32::try_from(body.len() + HEADER_LEN)
        .map_err(|_| IdeviceError::InvalidArgument("usbmuxd request too large".into()))?;

    let mut out = Vec::with_capacity(size as usize);
    out.extend_from_slice(&size.to_le_bytes());
    out.extend_from_slice(&version.to_le_bytes());
    out.extend_from_slice(&message.to_le_bytes());
    out.extend_from_slice(&tag.to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fields_are_little_endian() {
        let mut d = plist::Dictionary::new();
        d.insert("MessageType".into(), "ListDevices".into());
        let raw = encode(d, 1, 8, 7).unwrap();

        let header: [u8; HEADER_LEN] = raw[..HEADER_LEN].try_into().unwrap();
        let header = RawPacketHeader::parse(&header).unwrap();
        assert_eq!(header.size as usize, raw.len());
        assert_eq!(header.version, 1);
        assert_eq!(header.message, 8);
        assert_eq!(header.tag, 7);
        assert_eq!(header.body_len(), raw.len() - HEADER_LEN);
    }

    #[test]
    fn short_length_is_rejected() {
        let mut header = [0u8; HEADER_LEN];
        header[0] = 4;
        assert!(matches!(
            RawPacketHeader::parse(&header),
            Err(IdeviceError::ProtocolError(_))
        ));
    }

    #[test]
    fn huge_length_is_rejected() {
        let mut header = [0u8; HEADER_LEN];
        header[..4].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            RawPacketHeader::parse(&header),
            Err(IdeviceError::ProtocolError(_))
        ));
    }
}
