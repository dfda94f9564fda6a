// Jackson Coxson
//! An authenticated lockdown session with one device
//!
//! The session owns the lockdown channel, the provider used to reach service
//! ports, and the cancellation source shared by every connection it hands out.
//! Closing or dropping it, or the device detaching, makes all of those
//! connections fail with `Cancelled` or `Disconnected` on their next I/O.

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    Idevice, IdeviceError, IdeviceService,
    cancel::{self, CancelReason, CancelSource, CancelToken},
    config::FruitstrapConfig,
    lockdown::{Capabilities, LockdownClient},
    pairing_file::PairingFile,
    provider::IdeviceProvider,
    usbmuxd::{self, DeviceSelector, UsbmuxdAddr},
};

/// Where a session is in its lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
    Handshaken,
    Mounted,
    Installed,
    Launched,
    Terminated,
}

impl SessionState {
    pub fn can_transition(self, next: Self) -> bool {
        use SessionState::*;
        match (self, next) {
            (_, Disconnected) => true,
            (Disconnected, Connected) | (Connected, Handshaken) | (Launched, Terminated) => true,
            (Handshaken | Mounted | Installed | Terminated, Mounted | Installed | Launched) => {
                true
            }
            _ => false,
        }
    }
}

/// Closes a session from another task
#[derive(Clone, Debug)]
pub struct SessionCloser {
    source: CancelSource,
}

impl SessionCloser {
    /// Cancels every in-flight and future operation of the session.
    /// Returns `false` if the session was already closed or disconnected.
    pub fn close(&self) -> bool {
        self.source.cancel(CancelReason::Closed)
    }
}

#[derive(Debug)]
pub struct Session {
    provider: Box<dyn IdeviceProvider>,
    lockdown: LockdownClient,
    pairing_file: PairingFile,
    capabilities: Capabilities,
    config: FruitstrapConfig,
    cancel: CancelSource,
    state: SessionState,
    detach_watch: Option<JoinHandle<()>>,
}

impl Session {
    /// Finds a device through usbmuxd and performs the lockdown handshake
    ///
    /// # Arguments
    /// * `selector` - Which device to use
    /// * `config` - Timeouts, limits and service names
    /// * `pairing_file` - A pair record to use instead of the one usbmuxd holds
    ///
    /// # Errors
    /// * `DeviceNotFound` if no matching device attaches within `device_timeout`
    /// * `PairingRequired` if no usable pair record exists
    /// * `ProtocolError` if lockdown misbehaves
    /// * `Timeout` if usbmuxd or the device stops answering
    pub async fn connect(
        selector: &DeviceSelector,
        config: FruitstrapConfig,
        pairing_file: Option<PairingFile>,
    ) -> Result<Self, IdeviceError> {
        config.validate()?;
        let addr = UsbmuxdAddr::from_env_var()
            .map_err(|e| IdeviceError::Config(format!("USBMUXD_SOCKET_ADDRESS: {e}")))?;
        let device =
            usbmuxd::wait_for_device(&addr, selector, config.device_timeout, config.io_timeout)
                .await?;
        info!("Using device {} ({:?})", device.udid, device.connection_type);

        let provider = device.to_provider(addr.clone(), config.label.clone());
        let cancel = CancelSource::new();
        let watcher = match usbmuxd::watch_detach(
            &addr,
            device.device_id,
            cancel.clone(),
            config.io_timeout,
        )
        .await
        {
            Ok(w) => Some(w),
            Err(e) => {
                warn!("Detach events unavailable: {e}");
                None
            }
        };

        match Self::establish(Box::new(provider), pairing_file, config, cancel).await {
            Ok(mut session) => {
                session.detach_watch = watcher;
                Ok(session)
            }
            Err(e) => {
                if let Some(w) = watcher {
                    w.abort();
                }
                Err(e)
            }
        }
    }

    /// Performs the lockdown handshake over `provider`
    ///
    /// `cancel` may be shared with a detach watcher the caller runs.
    pub async fn establish(
        provider: Box<dyn IdeviceProvider>,
        pairing_file: Option<PairingFile>,
        config: FruitstrapConfig,
        cancel: CancelSource,
    ) -> Result<Self, IdeviceError> {
        config.validate()?;
        let mut token = cancel.token();

        let mut idevice = cancel::guard(
            &mut token,
            Some(config.io_timeout),
            provider.connect(LockdownClient::LOCKDOWND_PORT),
        )
        .await?;
        idevice.attach(cancel.token(), &config);
        debug!("Connected to lockdown on {}", provider.label());

        let pairing_file = match pairing_file {
            Some(p) => Some(p),
            None => {
                match cancel::guard(&mut token, Some(config.io_timeout), provider.get_pairing_file())
                    .await
                {
                    Ok(p) => Some(p),
                    Err(IdeviceError::PairingRequired) => None,
                    Err(e) => return Err(e),
                }
            }
        };

        let mut lockdown = LockdownClient::new(idevice);
        let capabilities = lockdown
            .handshake(pairing_file.as_ref(), &config.services.lockdown_type)
            .await?;
        let pairing_file = pairing_file.ok_or(IdeviceError::PairingRequired)?;

        info!(
            "Connected to {} running {} ({})",
            capabilities.device_name.as_deref().unwrap_or("device"),
            capabilities.product_version,
            capabilities.build_version
        );

        Ok(Self {
            provider,
            lockdown,
            pairing_file,
            capabilities,
            config,
            cancel,
            state: SessionState::Handshaken,
            detach_watch: None,
        })
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn config(&self) -> &FruitstrapConfig {
        &self.config
    }

    /// The device's UDID as lockdown reported it, else as the provider knows it
    pub fn udid(&self) -> &str {
        self.capabilities
            .udid
            .as_deref()
            .or(self.provider.udid())
            .unwrap_or("unknown")
    }

    pub fn lockdown(&mut self) -> &mut LockdownClient {
        &mut self.lockdown
    }

    /// The current state, `Disconnected` once the session has been torn down
    pub fn state(&self) -> SessionState {
        if self.cancel.is_cancelled() {
            SessionState::Disconnected
        } else {
            self.state
        }
    }

    /// Moves to `next`
    ///
    /// # Errors
    /// `InvalidState` if the lifecycle doesn't allow it
    pub fn advance(&mut self, next: SessionState) -> Result<(), IdeviceError> {
        let current = self.state();
        if !current.can_transition(next) {
            return Err(IdeviceError::InvalidState(format!(
                "{current:?} -> {next:?}"
            )));
        }
        debug!("Session {current:?} -> {next:?}");
        self.state = next;
        Ok(())
    }

    /// Fails unless service operations are allowed right now
    pub fn ensure_active(&self) -> Result<(), IdeviceError> {
        if let Some(reason) = self.cancel.reason() {
            return Err(reason.into());
        }
        match self.state {
            SessionState::Disconnected => Err(IdeviceError::Disconnected),
            SessionState::Connected => Err(IdeviceError::SessionInactive),
            _ => Ok(()),
        }
    }

    /// Checks the device still answers lockdown within the I/O timeout
    ///
    /// # Errors
    /// `Timeout` if the device has stopped responding
    pub async fn ping(&mut self) -> Result<(), IdeviceError> {
        self.ensure_active()?;
        self.lockdown.get_value(Some("DeviceName"), None).await?;
        Ok(())
    }

    /// A token that fires when this session is torn down
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.token()
    }

    pub fn closer(&self) -> SessionCloser {
        SessionCloser {
            source: self.cancel.clone(),
        }
    }

    /// Starts `S` under its configured name
    pub async fn start_service<S: IdeviceService>(&mut self) -> Result<S, IdeviceError> {
        let name = S::service_name(&self.config.services).to_string();
        self.start_service_named(&name).await
    }

    /// Starts the service `name` and wraps the connection as `S`
    ///
    /// # Errors
    /// `SessionInactive` before the handshake, `Cancelled`/`Disconnected` after
    /// teardown, `ServiceNotFound` if lockdown doesn't know `name`
    pub async fn start_service_named<S: IdeviceService>(
        &mut self,
        name: &str,
    ) -> Result<S, IdeviceError> {
        self.ensure_active()?;
        let (port, ssl) = self.lockdown.start_service(name).await?;
        let mut idevice = self.connect_port(port).await?;
        if ssl {
            idevice.start_session(&self.pairing_file).await?;
        }
        Ok(S::from_idevice(idevice))
    }

    async fn connect_port(&mut self, port: u16) -> Result<Idevice, IdeviceError> {
        let mut token = self.cancel.token();
        let mut idevice = cancel::guard(
            &mut token,
            Some(self.config.io_timeout),
            self.provider.connect(port),
        )
        .await?;
        idevice.attach(token, &self.config);
        Ok(idevice)
    }

    /// Ends the lockdown session and cancels everything derived from it
    pub async fn close(mut self) -> Result<(), IdeviceError> {
        let res = if self.cancel.is_cancelled() {
            Ok(())
        } else {
            self.lockdown.stop_session().await
        };
        if let Err(e) = &res {
            debug!("StopSession failed: {e}");
        }
        self.cancel.cancel(CancelReason::Closed);
        self.state = SessionState::Disconnected;
        res
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel(CancelReason::Closed);
        if let Some(w) = self.detach_watch.take() {
            w.abort();
        }
    }
}

/// The pipeline step an error happened in
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Connect,
    Handshake,
    Mount,
    Install,
    Launch,
    Files,
}

impl Stage {
    /// Where a failed [`Session::connect`] went wrong
    ///
    /// Failing to reach usbmuxd or the device, or a bad environment, counts as
    /// connecting; anything after that is the lockdown handshake.
    pub fn of_connect_failure(e: &IdeviceError) -> Self {
        match e {
            IdeviceError::DeviceNotFound
            | IdeviceError::Config(_)
            | IdeviceError::Transport(_)
            | IdeviceError::UsbConnectionRefused
            | IdeviceError::UsbBadCommand
            | IdeviceError::UsbBadDevice
            | IdeviceError::UsbBadVersion => Stage::Connect,
            _ => Stage::Handshake,
        }
    }

    /// The process exit code the command-line tool uses for failures here
    pub fn exit_code(self) -> i32 {
        match self {
            Stage::Connect => 1,
            Stage::Handshake => 2,
            Stage::Mount => 3,
            Stage::Install => 4,
            Stage::Launch => 5,
            Stage::Files => 7,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Connect => "connect",
            Stage::Handshake => "handshake",
            Stage::Mount => "mount",
            Stage::Install => "install",
            Stage::Launch => "launch",
            Stage::Files => "file access",
        };
        f.write_str(s)
    }
}

/// An [`IdeviceError`] with the step and device it happened on
#[derive(Debug, thiserror::Error)]
#[error("{stage} failed on {udid}: {source}")]
pub struct StageError {
    pub stage: Stage,
    pub udid: String,
    pub source: IdeviceError,
}

impl StageError {
    pub fn new(stage: Stage, udid: impl Into<String>, source: IdeviceError) -> Self {
        Self {
            stage,
            udid: udid.into(),
            source,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.stage.exit_code()
    }
}
