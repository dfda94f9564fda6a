#![doc = include_str!("../README.md")]
// Jackson Coxson

pub mod cancel;
pub mod channel;
pub mod config;
pub mod frame;
pub mod pairing_file;
pub mod provider;
pub mod session;
pub mod usbmuxd;
mod util;

pub mod services;
pub use services::*;
pub mod utils;

use std::{io, time::Duration};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use cancel::CancelToken;
use channel::ChannelMode;
use config::{FruitstrapConfig, ServiceNames};
use frame::FrameReader;

pub use session::{Session, SessionCloser, SessionState};
pub use util::{pretty_print_dictionary, pretty_print_plist};

/// A trait combining all required characteristics for a device communication socket
///
/// Tokio's TcpStream, UnixStream and DuplexStream implement this trait.
pub trait ReadWrite: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug {}

// Blanket implementation for any compatible type
impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug> ReadWrite for T {}

/// A lockdown service a [`Session`] can start
///
/// The service name is looked up in the configured [`ServiceNames`] so that it
/// can be overridden without recompiling.
pub trait IdeviceService: Sized {
    /// Returns the service name as advertised by the device
    fn service_name(names: &ServiceNames) -> &str;

    /// Wraps a freshly started service connection
    fn from_idevice(idevice: Idevice) -> Self;
}

/// Type alias for boxed device connection sockets
pub type IdeviceSocket = Box<dyn ReadWrite>;

/// Default bound on every send and receive
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default size of the chunks bulk data is written in
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Main handle for communicating with a service on the device
///
/// Owns the socket, the inbound frame buffer and the session's cancellation
/// token. Every I/O call is bounded by the configured timeout and fails with
/// `Cancelled` or `Disconnected` as soon as the session is torn down.
pub struct Idevice {
    /// The underlying connection socket, boxed for dynamic dispatch
    socket: Option<Box<dyn ReadWrite>>,
    /// Unique label identifying this connection
    label: String,
    mode: ChannelMode,
    frames: FrameReader,
    cancel: CancelToken,
    timeout: Duration,
    chunk_size: usize,
}

impl std::fmt::Debug for Idevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Idevice")
            .field("label", &self.label)
            .field("mode", &self.mode)
            .field("buffered", &self.frames.len())
            .field("connected", &self.socket.is_some())
            .finish()
    }
}

impl Idevice {
    /// Creates a new device connection handle
    ///
    /// # Arguments
    /// * `socket` - The established connection socket
    /// * `label` - Unique identifier for this connection
    pub fn new(socket: Box<dyn ReadWrite>, label: impl Into<String>) -> Self {
        Self {
            socket: Some(socket),
            label: label.into(),
            mode: ChannelMode::Plain,
            frames: FrameReader::default(),
            cancel: CancelToken::never(),
            timeout: DEFAULT_TIMEOUT,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Binds this connection to a session's cancellation and limits
    pub fn attach(&mut self, cancel: CancelToken, config: &FruitstrapConfig) {
        self.cancel = cancel;
        self.timeout = config.io_timeout;
        self.chunk_size = config.chunk_size.max(1);
        self.frames.set_max_len(config.max_frame_len);
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn mode(&self) -> ChannelMode {
        self.mode
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Changes the bound applied to subsequent sends and receives
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Sends a plist-formatted message to the device
    ///
    /// # Errors
    /// Returns `IdeviceError` if serialization or transmission fails
    pub(crate) async fn send_plist(&mut self, message: plist::Value) -> Result<(), IdeviceError> {
        debug!("Sending plist: {}", pretty_print_plist(&message));
        let body = util::plist_to_xml_bytes(&message)?;
        let framed = frame::encode(&body)?;
        self.write_all(&framed).await
    }

    /// Reads a plist message and converts a device `Error` into a typed error
    ///
    /// # Errors
    /// `ProtocolError` if the frame isn't a plist dictionary, or the error the
    /// device reported
    pub(crate) async fn read_plist(&mut self) -> Result<plist::Dictionary, IdeviceError> {
        let res = self.read_plist_unchecked().await?;

        if let Some(e) = res.get("Error") {
            let e = match e {
                plist::Value::String(e) => e.as_str(),
                _ => return Err(IdeviceError::ProtocolError("Error is not a string".into())),
            };
            return Err(IdeviceError::from_device_error_type(e, &res)
                .unwrap_or_else(|| IdeviceError::UnknownErrorType(e.to_string())));
        }
        Ok(res)
    }

    /// Reads a plist message without interpreting `Error`, for services that
    /// report failures in their own vocabulary
    pub(crate) async fn read_plist_unchecked(
        &mut self,
    ) -> Result<plist::Dictionary, IdeviceError> {
        loop {
            if let Some(frame) = self.frames.next_frame()? {
                let res = util::device_dictionary(&frame)?;
                debug!("Received plist: {}", pretty_print_dictionary(&res));
                return Ok(res);
            }
            self.fill().await?;
        }
    }

    /// Sends raw binary data to the device
    pub async fn send_raw(&mut self, message: &[u8]) -> Result<(), IdeviceError> {
        self.send_raw_with_progress(message, |_| async {}, ()).await
    }

    /// Sends raw binary data with progress callbacks
    ///
    /// # Arguments
    /// * `message` - The bytes to send
    /// * `callback` - Invoked after each chunk with `((bytes_sent, total), state)`
    /// * `state` - Arbitrary state passed to callback
    pub async fn send_raw_with_progress<Fut, S>(
        &mut self,
        message: &[u8],
        callback: impl Fn(((usize, usize), S)) -> Fut,
        state: S,
    ) -> Result<(), IdeviceError>
    where
        Fut: std::future::Future<Output = ()>,
        S: Clone,
    {
        let total = message.len();
        let mut sent = 0;
        for part in message.chunks(self.chunk_size) {
            self.write_all(part).await?;
            sent += part.len();
            trace!("Wrote {sent}/{total}");
            callback(((sent, total), state.clone())).await;
        }
        Ok(())
    }

    /// Largest single message this connection accepts
    pub fn max_frame_len(&self) -> usize {
        self.frames.max_len()
    }

    /// Reads exactly `len` bytes from the device
    ///
    /// # Errors
    /// `ProtocolError` if `len` exceeds [`Idevice::max_frame_len`]
    pub async fn read_raw(&mut self, len: usize) -> Result<Vec<u8>, IdeviceError> {
        if len > self.frames.max_len() {
            return Err(IdeviceError::ProtocolError(format!(
                "read of {len} bytes exceeds the maximum of {}",
                self.frames.max_len()
            )));
        }
        let mut res = Vec::with_capacity(len.min(self.chunk_size));
        while res.len() < len {
            if self.frames.is_empty() {
                self.fill().await?;
            }
            res.extend_from_slice(&self.frames.take(len - res.len()));
        }
        Ok(res)
    }

    /// Reads up to `max_size` bytes from the device
    pub async fn read_any(&mut self, max_size: usize) -> Result<Vec<u8>, IdeviceError> {
        let limit = Some(self.timeout);
        self.read_any_within(max_size, limit).await
    }

    /// Reads up to `max_size` bytes, waiting at most `limit` for them to arrive.
    /// `None` waits until data arrives or the session is cancelled.
    pub async fn read_any_within(
        &mut self,
        max_size: usize,
        limit: Option<Duration>,
    ) -> Result<Vec<u8>, IdeviceError> {
        if self.frames.is_empty() {
            self.fill_within(limit).await?;
        }
        Ok(self.frames.take(max_size).to_vec())
    }

    /// Shuts down the write half and drops the socket
    pub async fn close(&mut self) -> Result<(), IdeviceError> {
        if let Some(mut socket) = self.socket.take() {
            socket.shutdown().await.map_err(IdeviceError::from_socket_io)?;
        }
        Ok(())
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<(), IdeviceError> {
        let socket = self
            .socket
            .as_mut()
            .ok_or(IdeviceError::NoEstablishedConnection)?;
        cancel::guard(&mut self.cancel, Some(self.timeout), async {
            socket
                .write_all(buf)
                .await
                .map_err(IdeviceError::from_socket_io)?;
            socket.flush().await.map_err(IdeviceError::from_socket_io)
        })
        .await
    }

    async fn fill(&mut self) -> Result<(), IdeviceError> {
        let limit = Some(self.timeout);
        self.fill_within(limit).await
    }

    /// Reads whatever is available into the frame buffer
    async fn fill_within(&mut self, limit: Option<Duration>) -> Result<(), IdeviceError> {
        let socket = self
            .socket
            .as_mut()
            .ok_or(IdeviceError::NoEstablishedConnection)?;
        let mut buf = [0u8; 16 * 1024];
        let n = cancel::guard(&mut self.cancel, limit, async {
            socket
                .read(&mut buf)
                .await
                .map_err(IdeviceError::from_socket_io)
        })
        .await?;
        if n == 0 {
            debug!("{} reached end of stream", self.label);
            return Err(IdeviceError::Disconnected);
        }
        self.frames.extend(&buf[..n]);
        Ok(())
    }
}

/// Comprehensive error type for all device communication failures
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum IdeviceError {
    #[error("device transport failed: {0}")]
    Transport(io::Error),
    #[error("device disconnected")]
    Disconnected,
    #[error("protocol violation: {0}")]
    ProtocolError(String),
    #[error("device is not paired with this host")]
    PairingRequired,
    #[error("device not found")]
    DeviceNotFound,
    #[error("image rejected: {0}")]
    ImageRejected(String),
    #[error("timed out waiting for the image to mount")]
    MountTimeout,
    #[error("install rejected: {0}")]
    InstallRejected(String),
    #[error("transfer interrupted: {0}")]
    TransferInterrupted(String),
    #[error("launch failed: {0}")]
    LaunchFailed(String),
    #[error("attach failed: {0}")]
    AttachFailed(String),
    #[error("session was closed")]
    Cancelled,
    #[error("timed out waiting for the device")]
    Timeout,

    #[error("local io failed")]
    Io(#[from] io::Error),
    #[error("PEM parse failed")]
    PemParseFailed(#[from] rustls::pki_types::pem::Error),
    #[error("TLS error")]
    Rustls(#[from] rustls::Error),
    #[error("io on plist")]
    Plist(#[from] plist::Error),
    #[error("no established connection")]
    NoEstablishedConnection,
    #[error("this request was prohibited")]
    GetProhibited,
    #[error("no session is active")]
    SessionInactive,
    #[error("device locked")]
    DeviceLocked,
    #[error("service not found")]
    ServiceNotFound,
    #[error("invalid session state: {0}")]
    InvalidState(String),

    #[error("device refused connection")]
    UsbConnectionRefused,
    #[error("bad command")]
    UsbBadCommand,
    #[error("bad device")]
    UsbBadDevice,
    #[error("usb bad version")]
    UsbBadVersion,

    #[error("afc error: {0}")]
    Afc(#[from] afc::errors::AfcError),
    #[error("unknown afc opcode")]
    UnknownAfcOpcode,
    #[error("invalid afc magic")]
    InvalidAfcMagic,
    #[error("missing file attribute")]
    AfcMissingAttribute,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("internal error: {0}")]
    InternalError(String),
    #[error("unknown error `{0}` returned from device")]
    UnknownErrorType(String),
}

impl IdeviceError {
    /// Converts a device-reported error string to a typed error
    ///
    /// # Arguments
    /// * `e` - The error string from device
    /// * `context` - Full plist context containing additional error details
    fn from_device_error_type(e: &str, context: &plist::Dictionary) -> Option<Self> {
        match e {
            "GetProhibited" => Some(Self::GetProhibited),
            "SessionInactive" => Some(Self::SessionInactive),
            "DeviceLocked" => Some(Self::DeviceLocked),
            "InvalidService" | "ServiceProhibited" => Some(Self::ServiceNotFound),
            "InvalidHostID"
            | "PairingDialogResponsePending"
            | "UserDeniedPairing"
            | "PasswordProtected" => Some(Self::PairingRequired),
            "InternalError" => {
                let detailed_error = context
                    .get("DetailedError")
                    .and_then(|d| d.as_string())
                    .unwrap_or("No context")
                    .to_string();
                Some(Self::InternalError(detailed_error))
            }
            _ => None,
        }
    }

    /// Maps socket failures, folding the ones that mean the peer is gone
    pub(crate) fn from_socket_io(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected => Self::Disconnected,
            _ => Self::Transport(e),
        }
    }

    /// Whether the whole session is unusable after this error
    pub fn ends_session(&self) -> bool {
        matches!(
            self,
            Self::Disconnected | Self::Cancelled | Self::Timeout | Self::Transport(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    fn pair() -> (Idevice, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(1024);
        (Idevice::new(Box::new(client), "test"), server)
    }

    #[tokio::test]
    async fn plist_survives_fragmented_delivery() {
        let (mut dev, mut server) = pair();
        let mut d = plist::Dictionary::new();
        d.insert("Request".into(), "QueryType".into());
        let body = util::plist_to_xml_bytes(&plist::Value::Dictionary(d)).unwrap();
        let wire = frame::encode(&body).unwrap();

        tokio::spawn(async move {
            for chunk in wire.chunks(3) {
                server.write_all(chunk).await.unwrap();
                server.flush().await.unwrap();
                tokio::task::yield_now().await;
            }
            // keep the stream open until the reader is done
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let res = dev.read_plist().await.unwrap();
        assert_eq!(
            res.get("Request").and_then(|x| x.as_string()),
            Some("QueryType")
        );
    }

    #[tokio::test]
    async fn eof_is_disconnected() {
        let (mut dev, server) = pair();
        drop(server);
        assert!(matches!(
            dev.read_plist().await,
            Err(IdeviceError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn device_error_is_typed() {
        let (mut dev, mut server) = pair();
        let mut d = plist::Dictionary::new();
        d.insert("Error".into(), "InvalidHostID".into());
        let body = util::plist_to_xml_bytes(&plist::Value::Dictionary(d)).unwrap();
        server
            .write_all(&frame::encode(&body).unwrap())
            .await
            .unwrap();
        assert!(matches!(
            dev.read_plist().await,
            Err(IdeviceError::PairingRequired)
        ));
    }

    #[tokio::test]
    async fn silent_device_times_out() {
        let (mut dev, _server) = pair();
        dev.set_timeout(Duration::from_millis(20));
        assert!(matches!(dev.read_raw(4).await, Err(IdeviceError::Timeout)));
    }

    #[tokio::test]
    async fn oversized_read_is_refused() {
        let (mut dev, _server) = pair();
        dev.frames.set_max_len(1024);
        assert!(matches!(
            dev.read_raw(usize::MAX / 2).await,
            Err(IdeviceError::ProtocolError(_))
        ));
        assert!(matches!(
            dev.read_raw(1025).await,
            Err(IdeviceError::ProtocolError(_))
        ));
    }

    #[tokio::test]
    async fn progress_reports_bytes() {
        let (mut dev, mut server) = pair();
        dev.chunk_size = 4;
        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; 10];
            server.read_exact(&mut buf).await.unwrap();
            buf
        });

        let seen = Arc::new(Mutex::new(Vec::<(usize, usize)>::new()));
        dev.send_raw_with_progress(
            b"0123456789",
            |((sent, total), seen): ((usize, usize), Arc<Mutex<Vec<(usize, usize)>>>)| async move {
                seen.lock().unwrap().push((sent, total));
            },
            seen.clone(),
        )
        .await
        .unwrap();

        assert_eq!(reader.await.unwrap(), b"0123456789");
        assert_eq!(*seen.lock().unwrap(), vec![(4, 10), (8, 10), (10, 10)]);
    }
}
