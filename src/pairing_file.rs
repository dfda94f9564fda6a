// Jackson Coxson
//! Pair records
//!
//! A pair record holds the host identity a device accepted during trust
//! pairing. usbmuxd keeps one per device; one can also be supplied as a file.
//! The PEM blobs are kept as-is and only parsed when a TLS session is started.

use std::path::Path;

use plist::Data;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::IdeviceError;

#[derive(Clone)]
pub struct PairingFile {
    /// Device certificate, PEM
    pub device_certificate: Vec<u8>,
    /// Host private key, PEM
    pub host_private_key: Vec<u8>,
    /// Host certificate, PEM
    pub host_certificate: Vec<u8>,
    /// Root certificate, PEM
    pub root_certificate: Vec<u8>,
    pub system_buid: String,
    pub host_id: String,
    /// Escrow bag allowing access while locked
    pub escrow_bag: Vec<u8>,
    pub wifi_mac_address: Option<String>,
    pub udid: Option<String>,
}

impl std::fmt::Debug for PairingFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Keys stay out of logs
        f.debug_struct("PairingFile")
            .field("host_id", &self.host_id)
            .field("system_buid", &self.system_buid)
            .field("udid", &self.udid)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
struct RawPairingFile {
    device_certificate: Data,
    host_private_key: Data,
    host_certificate: Data,
    root_certificate: Data,
    #[serde(rename = "SystemBUID")]
    system_buid: String,
    #[serde(rename = "HostID")]
    host_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    escrow_bag: Option<Data>,
    #[serde(
        rename = "WiFiMACAddress",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    wifi_mac_address: Option<String>,
    #[serde(rename = "UDID", default, skip_serializing_if = "Option::is_none")]
    udid: Option<String>,
}

impl PairingFile {
    /// Reads a pair record plist from disk
    ///
    /// # Errors
    /// `Io` if the file can't be read, `ProtocolError` if it isn't a pair record
    pub fn read_from_file(path: impl AsRef<Path>) -> Result<Self, IdeviceError> {
        let f = std::fs::read(path)?;
        Self::from_bytes(&f)
    }

    /// Parses a pair record from XML or binary plist bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdeviceError> {
        match plist::from_bytes::<RawPairingFile>(bytes) {
            Ok(r) => Ok(r.into()),
            Err(e) => {
                warn!("Unable to parse pair record: {e:?}");
                Err(IdeviceError::ProtocolError(format!(
                    "malformed pair record: {e}"
                )))
            }
        }
    }

    pub fn from_value(v: &plist::Value) -> Result<Self, IdeviceError> {
        let raw: RawPairingFile = plist::from_value(v)
            .map_err(|e| IdeviceError::ProtocolError(format!("malformed pair record: {e}")))?;
        Ok(raw.into())
    }

    /// Serializes the record as an XML plist
    pub fn serialize(&self) -> Result<Vec<u8>, IdeviceError> {
        let raw = RawPairingFile::from(self.clone());
        let mut buf = Vec::new();
        plist::to_writer_xml(&mut buf, &raw)?;
        Ok(buf)
    }
}

impl From<RawPairingFile> for PairingFile {
    fn from(value: RawPairingFile) -> Self {
        Self {
            device_certificate: value.device_certificate.into(),
            host_private_key: value.host_private_key.into(),
            host_certificate: value.host_certificate.into(),
            root_certificate: value.root_certificate.into(),
            system_buid: value.system_buid,
            host_id: value.host_id,
            escrow_bag: value.escrow_bag.map(Into::into).unwrap_or_default(),
            wifi_mac_address: value.wifi_mac_address,
            udid: value.udid,
        }
    }
}

impl From<PairingFile> for RawPairingFile {
    fn from(value: PairingFile) -> Self {
        Self {
            device_certificate: Data::new(value.device_certificate),
            host_private_key: Data::new(value.host_private_key),
            host_certificate: Data::new(value.host_certificate),
            root_certificate: Data::new(value.root_certificate),
            system_buid: value.system_buid,
            host_id: value.host_id,
            escrow_bag: (!value.escrow_bag.is_empty()).then(|| Data::new(value.escrow_bag)),
            wifi_mac_address: value.wifi_mac_address,
            udid: value.udid,
        }
    }
}
