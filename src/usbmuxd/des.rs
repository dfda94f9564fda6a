// Jackson Coxson

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::{
    IdeviceError,
    usbmuxd::{Connection, UsbmuxdDevice},
};

#[derive(Deserialize)]
pub struct ListDevicesResponse {
    #[serde(rename = "DeviceList")]
    pub device_list: Vec<DeviceListResponse>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DeviceListResponse {
    #[serde(rename = "DeviceID")]
    pub device_id: u32,
    #[serde(rename = "Properties")]
    pub properties: DevicePropertiesResponse,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DevicePropertiesResponse {
    #[serde(rename = "ConnectionType")]
    pub connection_type: String,
    #[serde(rename = "NetworkAddress")]
    pub network_address: Option<plist::Data>,
    #[serde(rename = "SerialNumber")]
    pub serial_number: String,
}

impl DeviceListResponse {
    pub fn into_usbmuxd_dev(self) -> Result<UsbmuxdDevice, IdeviceError> {
        self.try_into()
    }
}

fn ipv6_at(addr: &[u8], offset: usize) -> IpAddr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&addr[offset..offset + 16]);
    IpAddr::V6(Ipv6Addr::from(octets))
}

/// Decodes the sockaddr blob usbmuxd reports for network devices
fn network_connection(addr: &[u8]) -> Result<Connection, IdeviceError> {
    if addr.len() < 8 {
        return Err(IdeviceError::ProtocolError(format!(
            "network address is {} bytes",
            addr.len()
        )));
    }
    Ok(match (addr[0], addr[1]) {
        // Linux sockaddr_in
        (0x02, _) => Connection::Network(IpAddr::V4(Ipv4Addr::new(
            addr[4], addr[5], addr[6], addr[7],
        ))),
        // Linux sockaddr_in6
        (0x1E, _) if addr.len() >= 24 => Connection::Network(ipv6_at(addr, 8)),
        // BSD sockaddr_in6, length byte first
        (0x1C, 0x1E) if addr.len() >= 28 => Connection::Network(ipv6_at(addr, 8)),
        (a, b) => {
            warn!("Unknown network address family {a:02X} {b:02X}");
            Connection::Unknown(format!("Network {a:02X}"))
        }
    })
}

impl TryFrom<DeviceListResponse> for UsbmuxdDevice {
    type Error = IdeviceError;

    fn try_from(dev: DeviceListResponse) -> Result<Self, Self::Error> {
        let connection_type = match dev.properties.connection_type.as_str() {
            "Network" => match dev.properties.network_address {
                Some(addr) => network_connection(&Vec::<u8>::from(addr))?,
                None => {
                    return Err(IdeviceError::ProtocolError(
                        "network device without an address".into(),
                    ));
                }
            },
            "USB" => Connection::Usb,
            _ => Connection::Unknown(dev.properties.connection_type),
        };
        debug!("Connection type: {connection_type:?}");
        Ok(UsbmuxdDevice {
            connection_type,
            udid: dev.properties.serial_number,
            device_id: dev.device_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_address_families() {
        assert_eq!(
            network_connection(&[0x02, 0, 0, 0, 192, 168, 1, 20]).unwrap(),
            Connection::Network(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)))
        );

        let mut v6 = vec![0x1C, 0x1E, 0, 0, 0, 0, 0, 0];
        v6.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        v6.extend_from_slice(&[0, 0, 0, 0]);
        assert_eq!(
            network_connection(&v6).unwrap(),
            Connection::Network(IpAddr::V6(Ipv6Addr::LOCALHOST))
        );

        assert!(network_connection(&[0x02, 0]).is_err());
        assert!(matches!(
            network_connection(&[0x07, 0, 0, 0, 0, 0, 0, 0]).unwrap(),
            Connection::Unknown(_)
        ));
    }
}
