// Jackson Coxson
//! USB Multiplexing Daemon (usbmuxd) client
//!
//! usbmuxd owns the USB connections to attached devices. It lists them, hands
//! out pair records, and turns a connection to its socket into a byte stream to
//! a TCP port on the device.

use std::{
    net::{AddrParseError, IpAddr, SocketAddr},
    pin::Pin,
    str::FromStr,
    time::Duration,
};

#[cfg(not(unix))]
use std::net::{Ipv4Addr, SocketAddrV4};

use futures::{Stream, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::{
    DEFAULT_TIMEOUT, Idevice, IdeviceError, ReadWrite,
    cancel::{CancelReason, CancelSource},
    pairing_file::PairingFile,
    provider::UsbmuxdProvider,
    usbmuxd::des::DeviceListResponse,
};

mod des;
mod raw_packet;

/// How a device is attached
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Connection {
    Usb,
    Network(IpAddr),
    Unknown(String),
}

/// A device as usbmuxd reports it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbmuxdDevice {
    pub connection_type: Connection,
    pub udid: String,
    /// usbmuxd-assigned id, valid until the device detaches
    pub device_id: u32,
}

/// Events from a `Listen` connection
#[derive(Debug, Clone)]
pub enum UsbmuxdListenEvent {
    Connected(UsbmuxdDevice),
    /// The mux ID
    Disconnected(u32),
}

/// Which device a command is aimed at
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DeviceSelector {
    /// The first attached device, USB before network
    #[default]
    Any,
    Udid(String),
}

impl DeviceSelector {
    pub fn matches(&self, device: &UsbmuxdDevice) -> bool {
        match self {
            Self::Any => true,
            Self::Udid(udid) => device.udid.eq_ignore_ascii_case(udid),
        }
    }

    /// Picks a matching device, preferring USB over network attachments
    pub fn choose(&self, devices: Vec<UsbmuxdDevice>) -> Option<UsbmuxdDevice> {
        let mut candidates = devices
            .into_iter()
            .filter(|d| self.matches(d))
            .collect::<Vec<_>>();
        candidates.sort_by_key(|d| d.connection_type != Connection::Usb);
        candidates.into_iter().next()
    }
}

impl From<Option<String>> for DeviceSelector {
    fn from(value: Option<String>) -> Self {
        match value {
            Some(udid) => Self::Udid(udid),
            None => Self::Any,
        }
    }
}

impl std::fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Any => write!(f, "any device"),
            Self::Udid(udid) => write!(f, "{udid}"),
        }
    }
}

/// Active connection to the usbmuxd service
pub struct UsbmuxdConnection {
    socket: Box<dyn ReadWrite>,
    tag: u32,
    /// Bound on each request and its reply
    timeout: Duration,
}

/// Address of the usbmuxd service
#[derive(Clone, Debug)]
pub enum UsbmuxdAddr {
    #[cfg(unix)]
    UnixSocket(String),
    TcpSocket(SocketAddr),
}

impl UsbmuxdAddr {
    pub const DEFAULT_PORT: u16 = 27015;
    pub const SOCKET_FILE: &'static str = "/var/run/usbmuxd";

    /// Opens a raw stream to usbmuxd
    pub async fn to_socket(&self) -> Result<Box<dyn ReadWrite>, IdeviceError> {
        Ok(match self {
            #[cfg(unix)]
            Self::UnixSocket(addr) => Box::new(
                tokio::net::UnixStream::connect(addr)
                    .await
                    .map_err(IdeviceError::Transport)?,
            ),
            Self::TcpSocket(addr) => Box::new(
                tokio::net::TcpStream::connect(addr)
                    .await
                    .map_err(IdeviceError::Transport)?,
            ),
        })
    }

    pub async fn connect(&self, tag: u32) -> Result<UsbmuxdConnection, IdeviceError> {
        self.connect_within(tag, DEFAULT_TIMEOUT).await
    }

    /// Connects, failing with `Timeout` if usbmuxd does not accept within `timeout`.
    /// The connection then bounds each exchange by the same `timeout`.
    pub async fn connect_within(
        &self,
        tag: u32,
        timeout: Duration,
    ) -> Result<UsbmuxdConnection, IdeviceError> {
        let socket = tokio::time::timeout(timeout, self.to_socket())
            .await
            .map_err(|_| IdeviceError::Timeout)??;
        let mut conn = UsbmuxdConnection::new(socket, tag);
        conn.set_timeout(timeout);
        Ok(conn)
    }

    /// Reads `USBMUXD_SOCKET_ADDRESS`, falling back to the platform default.
    /// Values containing `:` are TCP addresses, anything else a socket path.
    pub fn from_env_var() -> Result<Self, AddrParseError> {
        Ok(match std::env::var("USBMUXD_SOCKET_ADDRESS") {
            Ok(var) => {
                #[cfg(unix)]
                if var.contains(':') {
                    Self::TcpSocket(SocketAddr::from_str(&var)?)
                } else {
                    Self::UnixSocket(var)
                }
                #[cfg(not(unix))]
                Self::TcpSocket(SocketAddr::from_str(&var)?)
            }
            Err(_) => Self::default(),
        })
    }
}

impl Default for UsbmuxdAddr {
    fn default() -> Self {
        #[cfg(not(unix))]
        {
            Self::TcpSocket(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::new(127, 0, 0, 1),
                Self::DEFAULT_PORT,
            )))
        }
        #[cfg(unix)]
        Self::UnixSocket(Self::SOCKET_FILE.to_string())
    }
}

impl UsbmuxdConnection {
    pub const BINARY_PLIST_VERSION: u32 = 0;
    pub const XML_PLIST_VERSION: u32 = 1;

    pub const RESULT_MESSAGE_TYPE: u32 = 1;
    pub const PLIST_MESSAGE_TYPE: u32 = 8;

    pub fn new(socket: Box<dyn ReadWrite>, tag: u32) -> Self {
        Self {
            socket,
            tag,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Lists all attached devices
    ///
    /// Entries usbmuxd describes incompletely are skipped.
    pub async fn get_devices(&mut self) -> Result<Vec<UsbmuxdDevice>, IdeviceError> {
        let req = plist_macro::plist!({
            "MessageType": "ListDevices",
            "ClientVersionString": "fruitstrap",
            "kLibUSBMuxVersion": 3u64,
        });
        let res = self.request(req).await?;
        let res = plist::from_value::<des::ListDevicesResponse>(&plist::Value::Dictionary(res))
            .map_err(|e| IdeviceError::ProtocolError(format!("bad device list: {e}")))?;

        let devs = res
            .device_list
            .into_iter()
            .filter_map(|x| match x.into_usbmuxd_dev() {
                Ok(d) => Some(d),
                Err(e) => {
                    warn!("Skipping device entry: {e}");
                    None
                }
            })
            .collect::<Vec<UsbmuxdDevice>>();

        Ok(devs)
    }

    pub async fn get_device(&mut self, udid: &str) -> Result<UsbmuxdDevice, IdeviceError> {
        let devices = self.get_devices().await?;
        DeviceSelector::Udid(udid.to_string())
            .choose(devices)
            .ok_or(IdeviceError::DeviceNotFound)
    }

    /// Fetches the pair record usbmuxd stores for `udid`
    pub async fn get_pair_record(&mut self, udid: &str) -> Result<PairingFile, IdeviceError> {
        debug!("Getting pair record for {udid}");
        let req = plist_macro::plist!({
            "MessageType": "ReadPairRecord",
            "PairRecordID": udid,
        });
        let res = self.request(req).await?;

        match res.get("PairRecordData") {
            Some(plist::Value::Data(d)) => PairingFile::from_bytes(d),
            // usbmuxd answers a Result instead when it has no record
            _ => Err(IdeviceError::PairingRequired),
        }
    }

    pub async fn get_buid(&mut self) -> Result<String, IdeviceError> {
        let req = plist_macro::plist!({
            "MessageType": "ReadBUID",
        });
        let mut res = self.request(req).await?;

        match res.remove("BUID") {
            Some(plist::Value::String(s)) => Ok(s),
            _ => Err(IdeviceError::ProtocolError("ReadBUID without BUID".into())),
        }
    }

    /// Turns this connection into a stream to `port` on the device
    ///
    /// # Arguments
    /// * `device_id` - usbmuxd device ID
    /// * `port` - TCP port on the device, host byte order
    /// * `label` - Connection label
    pub async fn connect_to_device(
        mut self,
        device_id: u32,
        port: u16,
        label: impl Into<String>,
    ) -> Result<Idevice, IdeviceError> {
        debug!("Connecting to device {device_id} on port {port}");
        let port = port.to_be();

        let req = plist_macro::plist!({
            "MessageType": "Connect",
            "DeviceID": device_id as u64,
            "PortNumber": port as u64,
        });
        let res = self.request(req).await?;
        match res.get("Number").and_then(|x| x.as_unsigned_integer()) {
            Some(0) => Ok(Idevice::new(self.socket, label)),
            Some(1) => Err(IdeviceError::UsbBadCommand),
            Some(2) => Err(IdeviceError::UsbBadDevice),
            Some(3) => Err(IdeviceError::UsbConnectionRefused),
            Some(6) => Err(IdeviceError::UsbBadVersion),
            other => Err(IdeviceError::ProtocolError(format!(
                "unexpected Connect result {other:?}"
            ))),
        }
    }

    /// Subscribes to attach and detach events
    pub async fn listen<'a>(
        &'a mut self,
    ) -> Result<
        Pin<Box<dyn Stream<Item = Result<UsbmuxdListenEvent, IdeviceError>> + Send + 'a>>,
        IdeviceError,
    > {
        let req = plist_macro::plist!({
            "MessageType": "Listen",
        });
        let res = self.request(req).await?;
        if res.get("Number").and_then(|x| x.as_unsigned_integer()) != Some(0) {
            return Err(IdeviceError::ProtocolError("Listen was refused".into()));
        }

        // Events arrive whenever devices come and go, so only the ack is bounded
        let stream = futures::stream::try_unfold(self, |conn| async move {
            loop {
                let msg = conn.read_plist().await?;

                let Some(plist::Value::String(s)) = msg.get("MessageType") else {
                    warn!("Received listen message without MessageType");
                    continue;
                };
                match s.as_str() {
                    "Attached" => {
                        let dev = plist::from_value::<DeviceListResponse>(
                            &plist::Value::Dictionary(msg),
                        )
                        .map_err(|e| IdeviceError::ProtocolError(e.to_string()))
                        .and_then(|props| props.into_usbmuxd_dev());
                        match dev {
                            Ok(dev) => return Ok(Some((UsbmuxdListenEvent::Connected(dev), conn))),
                            Err(e) => warn!("Ignoring malformed attach event: {e}"),
                        }
                    }
                    "Detached" => {
                        match msg.get("DeviceID").and_then(|v| v.as_unsigned_integer()) {
                            Some(id) => {
                                let res = UsbmuxdListenEvent::Disconnected(id as u32);
                                return Ok(Some((res, conn)));
                            }
                            None => debug!("Device detached (unknown ID)"),
                        }
                    }
                    other => debug!("Ignoring listen message {other}"),
                }
            }
        });

        Ok(Box::pin(stream))
    }

    /// Sends `req` and reads the reply, both within the connection's timeout
    async fn request(&mut self, req: plist::Value) -> Result<plist::Dictionary, IdeviceError> {
        let timeout = self.timeout;
        tokio::time::timeout(timeout, async {
            self.write_plist(req).await?;
            self.read_plist().await
        })
        .await
        .map_err(|_| {
            warn!("usbmuxd did not answer within {timeout:?}");
            IdeviceError::Timeout
        })?
    }

    async fn write_plist(&mut self, req: plist::Value) -> Result<(), IdeviceError> {
        let req = req.into_dictionary().ok_or_else(|| {
            IdeviceError::InternalError("usbmuxd request is not a dictionary".into())
        })?;
        let raw = raw_packet::encode(
            req,
            Self::XML_PLIST_VERSION,
            Self::PLIST_MESSAGE_TYPE,
            self.tag,
        )?;
        self.socket
            .write_all(&raw)
            .await
            .map_err(IdeviceError::from_socket_io)?;
        Ok(())
    }

    async fn read_plist(&mut self) -> Result<plist::Dictionary, IdeviceError> {
        let mut header = [0; raw_packet::HEADER_LEN];
        self.socket
            .read_exact(&mut header)
            .await
            .map_err(IdeviceError::from_socket_io)?;
        let header = raw_packet::RawPacketHeader::parse(&header)?;
        debug!("Reading {} bytes from muxer", header.body_len());

        let mut body = vec![0; header.body_len()];
        self.socket
            .read_exact(&mut body)
            .await
            .map_err(IdeviceError::from_socket_io)?;

        let res = crate::util::device_dictionary(&body)?;
        debug!("Read from muxer: {}", crate::pretty_print_dictionary(&res));
        Ok(res)
    }
}

impl UsbmuxdDevice {
    /// Creates a provider that connects through usbmuxd at `addr`
    pub fn to_provider(&self, addr: UsbmuxdAddr, label: impl Into<String>) -> UsbmuxdProvider {
        UsbmuxdProvider {
            addr,
            tag: self.device_id,
            udid: self.udid.clone(),
            device_id: self.device_id,
            label: label.into(),
        }
    }
}

/// Finds a device matching `selector`, waiting up to `timeout` for one to attach
///
/// # Errors
/// * `DeviceNotFound` if nothing matching shows up in time
/// * `Timeout` if usbmuxd stops answering for longer than `io_timeout`
pub async fn wait_for_device(
    addr: &UsbmuxdAddr,
    selector: &DeviceSelector,
    timeout: Duration,
    io_timeout: Duration,
) -> Result<UsbmuxdDevice, IdeviceError> {
    let mut conn = addr.connect_within(0, io_timeout).await?;
    if let Some(dev) = selector.choose(conn.get_devices().await?) {
        return Ok(dev);
    }
    if timeout.is_zero() {
        return Err(IdeviceError::DeviceNotFound);
    }

    debug!("Waiting up to {timeout:?} for {selector}");
    let wait = async {
        let mut events = conn.listen().await?;
        while let Some(event) = events.next().await {
            if let UsbmuxdListenEvent::Connected(dev) = event? {
                if selector.matches(&dev) {
                    return Ok(dev);
                }
            }
        }
        Err(IdeviceError::DeviceNotFound)
    };
    tokio::time::timeout(timeout, wait)
        .await
        .unwrap_or(Err(IdeviceError::DeviceNotFound))
}

/// Fires `source` with `Disconnected` when usbmuxd reports `device_id` gone
///
/// The watcher ends on its own once `source` has fired for any reason.
pub async fn watch_detach(
    addr: &UsbmuxdAddr,
    device_id: u32,
    source: CancelSource,
    io_timeout: Duration,
) -> Result<tokio::task::JoinHandle<()>, IdeviceError> {
    let mut conn = addr.connect_within(device_id, io_timeout).await?;
    let mut token = source.token();

    Ok(tokio::spawn(async move {
        let mut events = match conn.listen().await {
            Ok(e) => e,
            Err(e) => {
                warn!("Unable to watch for detach: {e}");
                return;
            }
        };
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                event = events.next() => match event {
                    Some(Ok(UsbmuxdListenEvent::Disconnected(id))) if id == device_id => {
                        debug!("Device {device_id} detached");
                        source.cancel(CancelReason::Disconnected);
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Lost usbmuxd listen connection: {e}");
                        source.cancel(CancelReason::Disconnected);
                        return;
                    }
                    None => {
                        source.cancel(CancelReason::Disconnected);
                        return;
                    }
                }
            }
        }
    }))
}
