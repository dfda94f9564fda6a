//! GDB Remote Debugging Protocol implementation for iOS devices
//!
//! Provides functionality for communicating with debugserver using the
//! GDB Remote Serial Protocol as documented at:
//! https://sourceware.org/gdb/current/onlinedocs/gdb.html/Packets.html#Packets
//!
//! Packets travel as `$<data>#<checksum>` over the raw service stream, with no
//! length prefix. Incoming bytes are buffered so packets split across reads,
//! or several packets in one read, are handled.

use std::{fmt::Write, time::Duration};

use tracing::{debug, trace};

use crate::{Idevice, IdeviceError, IdeviceService, config::ServiceNames};

/// Accumulates stream bytes and splits them into packets
#[derive(Debug, Default)]
pub struct RspBuffer {
    buf: Vec<u8>,
}

impl RspBuffer {
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Extracts the next complete packet's data, `None` if more bytes are needed
    ///
    /// # Errors
    /// `ProtocolError` on a bad checksum or bytes outside of a packet
    pub fn next_packet(&mut self) -> Result<Option<Vec<u8>>, IdeviceError> {
        // acks carry nothing once the packet they confirm is sent
        let skip = self.buf.iter().take_while(|b| **b == b'+').count();
        self.buf.drain(..skip);

        let Some(first) = self.buf.first() else {
            return Ok(None);
        };
        match *first {
            b'$' => {}
            b'-' => {
                self.buf.drain(..1);
                return Err(IdeviceError::ProtocolError(
                    "debugserver rejected a packet".into(),
                ));
            }
            other => {
                self.buf.clear();
                return Err(IdeviceError::ProtocolError(format!(
                    "unexpected byte {other:#04x} outside of a packet"
                )));
            }
        }

        let Some(hash) = self.buf.iter().position(|b| *b == b'#') else {
            return Ok(None);
        };
        if self.buf.len() < hash + 3 {
            return Ok(None);
        }

        let packet: Vec<u8> = self.buf.drain(..hash + 3).collect();
        let data = &packet[1..hash];
        let received = &packet[hash + 1..];
        if received != b"00" && received != calculate_checksum(data).as_bytes() {
            return Err(IdeviceError::ProtocolError(format!(
                "bad checksum {} for {}",
                String::from_utf8_lossy(received),
                String::from_utf8_lossy(data)
            )));
        }
        Ok(Some(data.to_vec()))
    }
}

/// Client for the debugserver service
///
/// Handles packet formatting, checksums, and acknowledgments.
#[derive(Debug)]
pub struct DebugProxyClient {
    pub idevice: Idevice,
    buffer: RspBuffer,
    /// Flag indicating whether ACK mode is disabled
    pub noack_mode: bool,
}

/// Represents a debugserver command with arguments
///
/// Commands follow the GDB Remote Serial Protocol format:
/// $<command>[<hex-encoded args>]#<checksum>
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DebugserverCommand {
    /// The command name (e.g. "qSupported", "vCont")
    pub name: String,
    /// Command arguments that will be hex-encoded
    pub argv: Vec<String>,
}

impl DebugserverCommand {
    pub fn new(name: String, argv: Vec<String>) -> Self {
        Self { name, argv }
    }

    fn encode(&self) -> String {
        let hex_args = self
            .argv
            .iter()
            .map(|arg| hex_encode(arg.as_bytes()))
            .collect::<Vec<String>>()
            .join("");
        format!("{}{}", self.name, hex_args)
    }
}

impl IdeviceService for DebugProxyClient {
    fn service_name(names: &ServiceNames) -> &str {
        &names.debugserver
    }

    fn from_idevice(idevice: Idevice) -> Self {
        Self::new(idevice)
    }
}

impl DebugProxyClient {
    pub fn new(idevice: Idevice) -> Self {
        Self {
            idevice,
            buffer: RspBuffer::default(),
            noack_mode: false,
        }
    }

    /// Sends a command to debugserver and waits for the response
    pub async fn send_command(
        &mut self,
        command: impl Into<DebugserverCommand>,
    ) -> Result<String, IdeviceError> {
        let command = command.into();
        self.send_packet(&command.encode()).await?;
        let res = self.read_packet().await?;
        Ok(String::from_utf8_lossy(&res).into_owned())
    }

    /// Frames `data` and sends it
    pub async fn send_packet(&mut self, data: &str) -> Result<(), IdeviceError> {
        let packet = format!("${data}#{}", calculate_checksum(data.as_bytes()));
        debug!("Sending packet: {packet}");
        // debugserver reads bare RSP from the service socket, no length prefix
        self.idevice.send_raw(packet.as_bytes()).await
    }

    /// Reads the next packet, bounded by the connection's timeout
    pub async fn read_packet(&mut self) -> Result<Vec<u8>, IdeviceError> {
        let limit = Some(self.idevice.timeout());
        self.read_packet_within(limit).await
    }

    /// Reads the next packet, waiting at most `limit` for bytes.
    /// `None` waits until the session is torn down.
    pub async fn read_packet_within(
        &mut self,
        limit: Option<Duration>,
    ) -> Result<Vec<u8>, IdeviceError> {
        loop {
            if let Some(packet) = self.buffer.next_packet()? {
                trace!("Received packet: {}", String::from_utf8_lossy(&packet));
                if !self.noack_mode {
                    self.send_ack().await?;
                }
                return Ok(packet);
            }
            let bytes = self.idevice.read_any_within(16 * 1024, limit).await?;
            self.buffer.extend(&bytes);
        }
    }

    /// Sends an acknowledgment (+)
    pub async fn send_ack(&mut self) -> Result<(), IdeviceError> {
        self.idevice.send_raw(b"+").await
    }

    /// Asks debugserver to stop acknowledging packets, and stops sending acks
    pub async fn start_no_ack_mode(&mut self) -> Result<(), IdeviceError> {
        let res = self.send_command("QStartNoAckMode").await?;
        if res != "OK" {
            return Err(IdeviceError::ProtocolError(format!(
                "QStartNoAckMode answered {res}"
            )));
        }
        self.noack_mode = true;
        Ok(())
    }

    /// Sets one environment variable of the process to be launched
    pub async fn set_environment(&mut self, key: &str, value: &str) -> Result<(), IdeviceError> {
        let packet = format!(
            "QEnvironmentHexEncoded:{}",
            hex_encode(format!("{key}={value}").as_bytes())
        );
        self.send_packet(&packet).await?;
        self.expect_ok("QEnvironmentHexEncoded").await
    }

    pub async fn disable_aslr(&mut self) -> Result<(), IdeviceError> {
        self.send_packet("QSetDisableASLR:1").await?;
        self.expect_ok("QSetDisableASLR").await
    }

    /// Sets program arguments using the 'A' command
    ///
    /// Formats arguments according to GDB protocol:
    /// A<arglen>,<argnum>,<argdata>
    ///
    /// # Errors
    /// `InvalidArgument` if `argv` is empty, `LaunchFailed` if debugserver
    /// refuses the arguments
    pub async fn set_argv(&mut self, argv: &[String]) -> Result<(), IdeviceError> {
        if argv.is_empty() {
            return Err(IdeviceError::InvalidArgument("empty argv".into()));
        }
        let mut packet = String::from("A");
        for (i, arg) in argv.iter().enumerate() {
            if i > 0 {
                packet.push(',');
            }
            let hex = hex_encode(arg.as_bytes());
            let _ = write!(packet, "{},{},{}", hex.len(), i, hex);
        }
        self.send_packet(&packet).await?;
        let res = self.read_packet().await?;
        if res != b"OK" {
            return Err(IdeviceError::LaunchFailed(format!(
                "debugserver refused the arguments: {}",
                String::from_utf8_lossy(&res)
            )));
        }
        Ok(())
    }

    /// Whether the process set up by [`Self::set_argv`] started
    ///
    /// # Errors
    /// `LaunchFailed` carrying debugserver's message
    pub async fn launch_success(&mut self) -> Result<(), IdeviceError> {
        let res = self.send_command("qLaunchSuccess").await?;
        if res != "OK" {
            let reason = res.strip_prefix('E').unwrap_or(&res).to_string();
            return Err(IdeviceError::LaunchFailed(reason));
        }
        Ok(())
    }

    /// Resumes the process without waiting for a reply
    pub async fn continue_process(&mut self) -> Result<(), IdeviceError> {
        self.send_packet("vCont;c").await
    }

    /// Kills the process
    pub async fn kill(&mut self) -> Result<(), IdeviceError> {
        self.send_packet("k").await
    }

    async fn expect_ok(&mut self, what: &str) -> Result<(), IdeviceError> {
        let res = self.read_packet().await?;
        if res != b"OK" {
            return Err(IdeviceError::ProtocolError(format!(
                "{what} answered {}",
                String::from_utf8_lossy(&res)
            )));
        }
        Ok(())
    }
}

/// Calculates the checksum for a GDB protocol packet
///
/// The checksum is computed as the modulo 256 sum of all characters
/// between '$' and '#', formatted as two lowercase hex digits.
fn calculate_checksum(data: &[u8]) -> String {
    let checksum = data.iter().fold(0u8, |acc, byte| acc.wrapping_add(*byte));
    format!("{checksum:02x}")
}

/// Hex-encodes bytes as uppercase string
pub fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().fold(String::new(), |mut output, b| {
        let _ = write!(output, "{b:02X}");
        output
    })
}

/// Decodes a hex string of either case
pub fn hex_decode(hex: &[u8]) -> Result<Vec<u8>, IdeviceError> {
    if hex.len() % 2 != 0 {
        return Err(IdeviceError::ProtocolError("odd hex length".into()));
    }
    hex.chunks_exact(2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|s| u8::from_str_radix(s, 16).ok())
                .ok_or_else(|| {
                    IdeviceError::ProtocolError(format!(
                        "invalid hex {}",
                        String::from_utf8_lossy(pair)
                    ))
                })
        })
        .collect()
}

impl From<String> for DebugserverCommand {
    /// Converts a string into a debugserver command by splitting on whitespace
    ///
    /// The first token becomes the command name, remaining tokens become arguments
    fn from(s: String) -> Self {
        let mut split = s.split_whitespace();
        let command = split.next().unwrap_or("").to_string();
        let arguments: Vec<String> = split.map(|s| s.to_string()).collect();
        Self::new(command, arguments)
    }
}

impl From<&str> for DebugserverCommand {
    fn from(s: &str) -> DebugserverCommand {
        s.to_string().into()
    }
}
