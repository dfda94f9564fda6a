//! Lockdown service client
//!
//! Lockdown listens on a fixed port and is the gatekeeper for everything else:
//! it checks the host's pair record, upgrades the channel to TLS, reports the
//! device's properties and starts the other services on demand.

use plist::{Dictionary, Value};
use tracing::{debug, warn};

use crate::{
    Idevice, IdeviceError,
    pairing_file::PairingFile,
    util::{optional_bool, optional_string, required_string},
};

/// Client for the lockdown service
#[derive(Debug)]
pub struct LockdownClient {
    pub idevice: Idevice,
    session_id: Option<String>,
}

/// What the device reported about itself after the handshake
#[derive(Clone, Debug, PartialEq)]
pub struct Capabilities {
    pub udid: Option<String>,
    pub product_version: String,
    pub build_version: String,
    pub product_type: Option<String>,
    pub device_name: Option<String>,
    /// Every value lockdown returned
    pub values: Dictionary,
}

impl Capabilities {
    /// # Errors
    /// `ProtocolError` if `ProductVersion` or `BuildVersion` is missing
    pub fn from_values(values: Dictionary) -> Result<Self, IdeviceError> {
        Ok(Self {
            udid: optional_string(&values, "UniqueDeviceID")?,
            product_version: required_string(&values, "ProductVersion")?,
            build_version: required_string(&values, "BuildVersion")?,
            product_type: optional_string(&values, "ProductType")?,
            device_name: optional_string(&values, "DeviceName")?,
            values,
        })
    }

    /// `"17.1"` for `"17.1.2"`
    pub fn major_minor(&self) -> String {
        self.product_version
            .split('.')
            .take(2)
            .collect::<Vec<_>>()
            .join(".")
    }

    pub fn major_version(&self) -> Option<u32> {
        self.product_version.split('.').next()?.parse().ok()
    }
}

impl LockdownClient {
    /// The TCP port lockdown listens on
    pub const LOCKDOWND_PORT: u16 = 62078;

    pub fn new(idevice: Idevice) -> Self {
        Self {
            idevice,
            session_id: None,
        }
    }

    /// The id of the session started by [`Self::start_session`]
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Sends `request` with `body` and validates the reply's `Request` echo
    async fn request(
        &mut self,
        request: &str,
        mut body: Dictionary,
    ) -> Result<Dictionary, IdeviceError> {
        body.insert("Label".into(), self.idevice.label().into());
        body.insert("Request".into(), request.into());
        self.idevice.send_plist(Value::Dictionary(body)).await?;

        let res = self.idevice.read_plist().await?;
        match res.get("Request") {
            None => {}
            Some(Value::String(echo)) if echo == request => {}
            Some(other) => {
                return Err(IdeviceError::ProtocolError(format!(
                    "reply to {request} echoed {other:?}"
                )));
            }
        }
        Ok(res)
    }

    /// Asks what kind of daemon is answering
    pub async fn query_type(&mut self) -> Result<String, IdeviceError> {
        let res = self.request("QueryType", Dictionary::new()).await?;
        required_string(&res, "Type")
    }

    /// Authenticates the host and reads the device's properties
    ///
    /// # Arguments
    /// * `pairing_file` - The host identity, `None` if no record is known
    /// * `expected_type` - What `QueryType` must answer
    ///
    /// # Errors
    /// * `ProtocolError` if the peer isn't lockdown or answers malformed data
    /// * `PairingRequired` if there is no record or the device rejects it
    pub async fn handshake(
        &mut self,
        pairing_file: Option<&PairingFile>,
        expected_type: &str,
    ) -> Result<Capabilities, IdeviceError> {
        let kind = self.query_type().await?;
        if kind != expected_type {
            return Err(IdeviceError::ProtocolError(format!(
                "expected {expected_type}, peer is {kind}"
            )));
        }

        let Some(pairing_file) = pairing_file else {
            warn!("No pair record for {}", self.idevice.label());
            return Err(IdeviceError::PairingRequired);
        };
        self.start_session(pairing_file).await?;

        match self.get_value(None, None).await? {
            Value::Dictionary(values) => Capabilities::from_values(values),
            other => Err(IdeviceError::ProtocolError(format!(
                "GetValue returned {other:?}"
            ))),
        }
    }

    /// Starts a session, upgrading to TLS when the device asks for it
    ///
    /// # Returns
    /// The session id
    pub async fn start_session(
        &mut self,
        pairing_file: &PairingFile,
    ) -> Result<String, IdeviceError> {
        let req = plist_macro::plist!({
            "HostID": pairing_file.host_id.as_str(),
            "SystemBUID": pairing_file.system_buid.as_str(),
        });
        let body = req.into_dictionary().unwrap_or_default();
        let res = self.request("StartSession", body).await?;

        let session_id = required_string(&res, "SessionID")?;
        if optional_bool(&res, "EnableSessionSSL")?.unwrap_or(false) {
            self.idevice.start_session(pairing_file).await?;
        } else {
            debug!("Device left the session unencrypted");
        }

        self.session_id = Some(session_id.clone());
        Ok(session_id)
    }

    /// Reads a value, or every value in `domain` when `key` is `None`
    pub async fn get_value(
        &mut self,
        key: Option<&str>,
        domain: Option<&str>,
    ) -> Result<Value, IdeviceError> {
        let mut body = Dictionary::new();
        if let Some(key) = key {
            body.insert("Key".into(), key.into());
        }
        if let Some(domain) = domain {
            body.insert("Domain".into(), domain.into());
        }
        let mut res = self.request("GetValue", body).await?;
        res.remove("Value")
            .ok_or_else(|| IdeviceError::ProtocolError("GetValue without Value".into()))
    }

    /// Requests to start a service on the device
    ///
    /// # Returns
    /// The port the service listens on and whether it expects TLS
    pub async fn start_service(
        &mut self,
        identifier: &str,
    ) -> Result<(u16, bool), IdeviceError> {
        let req = plist_macro::plist!({
            "Service": identifier,
        });
        let body = req.into_dictionary().unwrap_or_default();
        let res = self.request("StartService", body).await?;

        // Absent over USB
        let ssl = optional_bool(&res, "EnableServiceSSL")?.unwrap_or(false);

        let port = res
            .get("Port")
            .and_then(|p| p.as_unsigned_integer())
            .and_then(|p| u16::try_from(p).ok())
            .ok_or_else(|| {
                IdeviceError::ProtocolError(format!("StartService {identifier} without a port"))
            })?;
        debug!("{identifier} is on port {port}, ssl: {ssl}");
        Ok((port, ssl))
    }

    /// Ends the current session, if any
    pub async fn stop_session(&mut self) -> Result<(), IdeviceError> {
        let Some(session_id) = self.session_id.take() else {
            return Ok(());
        };
        let req = plist_macro::plist!({
            "SessionID": session_id,
        });
        self.request("StopSession", req.into_dictionary().unwrap_or_default())
            .await?;
        Ok(())
    }
}

impl From<Idevice> for LockdownClient {
    fn from(value: Idevice) -> Self {
        Self::new(value)
    }
}
