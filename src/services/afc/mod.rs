//! AFC (Apple File Conduit) client
//!
//! AFC exposes a slice of the device file system. Bundles are staged through
//! it before installation, and house arrest vends app containers over it.

use std::collections::HashMap;

use errors::AfcError;
use file::FileDescriptor;
use opcode::{AfcFopenMode, AfcOpcode};
use packet::AfcPacket;
use tracing::{debug, warn};

use crate::{Idevice, IdeviceError, IdeviceService, config::ServiceNames};

pub mod errors;
pub mod file;
pub mod opcode;
pub mod packet;

/// The magic number opening every AFC packet
pub const MAGIC: u64 = 0x4141504c36414643;

#[derive(Debug)]
pub struct AfcClient {
    pub idevice: Idevice,
    package_number: u64,
}

/// Information about a file on the device
#[derive(Clone, Debug)]
pub struct FileInfo {
    pub size: usize,
    /// File type, e.g. `S_IFREG` or `S_IFDIR`
    pub st_ifmt: String,
    /// Every attribute the device reported
    pub attributes: HashMap<String, String>,
}

impl FileInfo {
    pub fn is_dir(&self) -> bool {
        self.st_ifmt == "S_IFDIR"
    }
}

impl IdeviceService for AfcClient {
    fn service_name(names: &ServiceNames) -> &str {
        &names.afc
    }

    fn from_idevice(idevice: Idevice) -> Self {
        Self::new(idevice)
    }
}

/// Splits a NUL separated payload into its strings
fn nul_separated(payload: &[u8]) -> Vec<String> {
    payload
        .split(|b| *b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect()
}

impl AfcClient {
    pub fn new(idevice: Idevice) -> Self {
        Self {
            idevice,
            package_number: 0,
        }
    }

    /// Sends one operation and reads its reply
    async fn request(
        &mut self,
        operation: AfcOpcode,
        header_payload: Vec<u8>,
        payload: Vec<u8>,
    ) -> Result<AfcPacket, IdeviceError> {
        let packet = AfcPacket::new(operation, self.package_number, header_payload, payload);
        self.package_number += 1;
        self.send(packet).await?;
        self.read().await
    }

    /// Lists a directory, without `.` and `..`
    pub async fn list_dir(&mut self, path: impl Into<String>) -> Result<Vec<String>, IdeviceError> {
        let path = path.into();
        let res = self
            .request(AfcOpcode::ReadDir, path.into_bytes(), Vec::new())
            .await?;
        Ok(nul_separated(&res.payload)
            .into_iter()
            .filter(|s| s != "." && s != "..")
            .collect())
    }

    pub async fn mk_dir(&mut self, path: impl Into<String>) -> Result<(), IdeviceError> {
        let path = path.into();
        self.request(AfcOpcode::MakeDir, path.into_bytes(), Vec::new())
            .await?;
        Ok(())
    }

    /// # Errors
    /// `AfcMissingAttribute` if the device omits `st_size` or `st_ifmt`
    pub async fn get_file_info(
        &mut self,
        path: impl Into<String>,
    ) -> Result<FileInfo, IdeviceError> {
        let path = path.into();
        let res = self
            .request(AfcOpcode::GetFileInfo, path.into_bytes(), Vec::new())
            .await?;

        let strings = nul_separated(&res.payload);
        let attributes: HashMap<String, String> = strings
            .chunks_exact(2)
            .map(|chunk| (chunk[0].clone(), chunk[1].clone()))
            .collect();

        let size = attributes
            .get("st_size")
            .and_then(|x| x.parse::<usize>().ok())
            .ok_or(IdeviceError::AfcMissingAttribute)?;
        let st_ifmt = attributes
            .get("st_ifmt")
            .cloned()
            .ok_or(IdeviceError::AfcMissingAttribute)?;

        Ok(FileInfo {
            size,
            st_ifmt,
            attributes,
        })
    }

    /// Removes a file or an empty directory
    pub async fn remove(&mut self, path: impl Into<String>) -> Result<(), IdeviceError> {
        let path = path.into();
        self.request(AfcOpcode::RemovePath, path.into_bytes(), Vec::new())
            .await?;
        Ok(())
    }

    /// Recursively removes a path and everything below it
    pub async fn remove_all(&mut self, path: impl Into<String>) -> Result<(), IdeviceError> {
        let path = path.into();
        debug!("Removing {path} recursively");
        self.request(AfcOpcode::RemovePathAndContents, path.into_bytes(), Vec::new())
            .await?;
        Ok(())
    }

    /// Opens a file on the device
    pub async fn open(
        &mut self,
        path: impl Into<String>,
        mode: AfcFopenMode,
    ) -> Result<FileDescriptor<'_>, IdeviceError> {
        let path = path.into();
        let mut header_payload = (mode as u64).to_le_bytes().to_vec();
        header_payload.extend(path.as_bytes());

        let res = self
            .request(AfcOpcode::FileOpen, header_payload, Vec::new())
            .await?;
        let fd = res
            .header_payload
            .get(..8)
            .and_then(|b| <[u8; 8]>::try_from(b).ok())
            .map(u64::from_le_bytes)
            .ok_or_else(|| IdeviceError::ProtocolError("FileOpen without a descriptor".into()))?;

        Ok(FileDescriptor {
            client: self,
            fd,
            path,
        })
    }

    /// Reads a reply, turning a failed status into `Afc`
    pub async fn read(&mut self) -> Result<AfcPacket, IdeviceError> {
        let res = AfcPacket::read(&mut self.idevice).await?;
        if res.header.operation == AfcOpcode::Status {
            let code = res
                .header_payload
                .get(..8)
                .and_then(|b| <[u8; 8]>::try_from(b).ok())
                .map(u64::from_le_bytes)
                .ok_or_else(|| IdeviceError::ProtocolError("status without a code".into()))?;
            let e = AfcError::from(code);
            if e != AfcError::Success {
                warn!("AFC status {code}: {e}");
                return Err(IdeviceError::Afc(e));
            }
        }
        Ok(res)
    }

    pub async fn send(&mut self, packet: AfcPacket) -> Result<(), IdeviceError> {
        let packet = packet.serialize();
        self.idevice.send_raw(&packet).await
    }
}
