// Jackson Coxson

use crate::IdeviceError;

use super::{AfcClient, opcode::AfcOpcode, packet::AfcPacket};

/// Largest chunk moved per read or write request
const MAX_TRANSFER: u64 = 64 * 1024;

/// Handle for an open file on the device.
/// Call close before dropping
#[derive(Debug)]
pub struct FileDescriptor<'a> {
    pub(crate) client: &'a mut AfcClient,
    pub(crate) fd: u64,
    pub(crate) path: String,
}

impl FileDescriptor<'_> {
    pub fn path(&self) -> &str {
        &self.path
    }

    async fn request(
        &mut self,
        operation: AfcOpcode,
        extra: &[u8],
        payload: Vec<u8>,
    ) -> Result<AfcPacket, IdeviceError> {
        let mut header_payload = self.fd.to_le_bytes().to_vec();
        header_payload.extend_from_slice(extra);
        self.client.request(operation, header_payload, payload).await
    }

    pub async fn close(mut self) -> Result<(), IdeviceError> {
        self.request(AfcOpcode::FileClose, &[], Vec::new()).await?;
        Ok(())
    }

    /// Reads from the cursor until the device reports end of file
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, IdeviceError> {
        let mut collected = Vec::new();
        loop {
            let res = self
                .request(AfcOpcode::Read, &MAX_TRANSFER.to_le_bytes(), Vec::new())
                .await?;
            if res.payload.is_empty() {
                return Ok(collected);
            }
            collected.extend(res.payload);
        }
    }

    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), IdeviceError> {
        self.write_with_progress(bytes, |_| async {}, ()).await
    }

    /// Writes `bytes`, invoking `callback` with `((written, total), state)`
    /// after each chunk is acknowledged
    pub async fn write_with_progress<Fut, S>(
        &mut self,
        bytes: &[u8],
        callback: impl Fn(((usize, usize), S)) -> Fut,
        state: S,
    ) -> Result<(), IdeviceError>
    where
        Fut: std::future::Future<Output = ()>,
        S: Clone,
    {
        let total = bytes.len();
        let mut written = 0;
        for chunk in bytes.chunks(MAX_TRANSFER as usize) {
            self.request(AfcOpcode::Write, &[], chunk.to_vec()).await?;
            written += chunk.len();
            callback(((written, total), state.clone())).await;
        }
        Ok(())
    }
}
