// Jackson Coxson

use tracing::trace;

use crate::{Idevice, IdeviceError};

use super::opcode::AfcOpcode;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AfcPacketHeader {
    pub magic: u64,
    /// Header, header payload and payload
    pub entire_len: u64,
    /// Header and header payload
    pub header_payload_len: u64,
    pub packet_num: u64,
    pub operation: AfcOpcode,
}

#[derive(Clone, Debug)]
pub struct AfcPacket {
    pub header: AfcPacketHeader,
    pub header_payload: Vec<u8>,
    pub payload: Vec<u8>,
}

impl AfcPacketHeader {
    pub const LEN: u64 = 40;

    pub fn serialize(&self) -> Vec<u8> {
        let mut res = Vec::with_capacity(Self::LEN as usize);
        for word in [
            self.magic,
            self.entire_len,
            self.header_payload_len,
            self.packet_num,
            self.operation as u64,
        ] {
            res.extend_from_slice(&word.to_le_bytes());
        }
        res
    }

    /// Decodes and validates a header
    pub fn parse(bytes: &[u8]) -> Result<Self, IdeviceError> {
        if bytes.len() < Self::LEN as usize {
            return Err(IdeviceError::ProtocolError("short AFC header".into()));
        }
        let word = |i: usize| {
            let mut w = [0u8; 8];
            w.copy_from_slice(&bytes[i * 8..i * 8 + 8]);
            u64::from_le_bytes(w)
        };

        if word(0) != super::MAGIC {
            return Err(IdeviceError::InvalidAfcMagic);
        }
        let operation = AfcOpcode::try_from(word(4)).map_err(|_| IdeviceError::UnknownAfcOpcode)?;
        let res = Self {
            magic: word(0),
            entire_len: word(1),
            header_payload_len: word(2),
            packet_num: word(3),
            operation,
        };
        if res.header_payload_len < Self::LEN || res.entire_len < res.header_payload_len {
            return Err(IdeviceError::ProtocolError(format!(
                "inconsistent AFC lengths {} / {}",
                res.header_payload_len, res.entire_len
            )));
        }
        Ok(res)
    }

    pub async fn read(reader: &mut Idevice) -> Result<Self, IdeviceError> {
        let bytes = reader.read_raw(Self::LEN as usize).await?;
        let header = Self::parse(&bytes)?;
        let max = reader.max_frame_len() as u64;
        if header.entire_len - Self::LEN > max {
            return Err(IdeviceError::ProtocolError(format!(
                "AFC packet of {} bytes exceeds the maximum of {max}",
                header.entire_len
            )));
        }
        Ok(header)
    }
}

impl AfcPacket {
    /// Builds a packet, filling in the length fields
    pub fn new(
        operation: AfcOpcode,
        packet_num: u64,
        header_payload: Vec<u8>,
        payload: Vec<u8>,
    ) -> Self {
        let header_payload_len = AfcPacketHeader::LEN + header_payload.len() as u64;
        Self {
            header: AfcPacketHeader {
                magic: super::MAGIC,
                entire_len: header_payload_len + payload.len() as u64,
                header_payload_len,
                packet_num,
                operation,
            },
            header_payload,
            payload,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut res = self.header.serialize();
        res.extend_from_slice(&self.header_payload);
        res.extend_from_slice(&self.payload);
        res
    }

    pub async fn read(reader: &mut Idevice) -> Result<Self, IdeviceError> {
        let header = AfcPacketHeader::read(reader).await?;
        let header_payload = reader
            .read_raw((header.header_payload_len - AfcPacketHeader::LEN) as usize)
            .await?;
        let payload = reader
            .read_raw((header.entire_len - header.header_payload_len) as usize)
            .await?;

        trace!(
            "Recv afc {:?} #{} ({} + {} bytes)",
            header.operation,
            header.packet_num,
            header_payload.len(),
            payload.len()
        );
        Ok(Self {
            header,
            header_payload,
            payload,
        })
    }
}
