//! High-level install helpers
//!
//! Stages a bundle under the staging directory through AFC, then asks the
//! installation proxy to install it, or to upgrade it when the identifier is
//! already installed.
//!
//! Notes:
//! - The package path given to the installation proxy is a path inside the
//!   AFC jail (e.g. `PublicStaging/Example.app`)
//! - A leftover staging directory from an interrupted run is removed first,
//!   so retrying needs no manual cleanup

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info, warn};

use crate::{
    IdeviceError, Session, SessionState,
    afc::{AfcClient, opcode::AfcFopenMode},
    installation_proxy::{InstallationProxyClient, ProgressUpdate},
};

use super::bundle::AppBundle;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstallOperation {
    Install,
    Upgrade,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransactionStatus {
    Pending,
    Succeeded,
    Failed(String),
}

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Progress and outcome of one install
#[derive(Clone, Debug)]
pub struct InstallTransaction {
    pub bundle_id: String,
    pub operation: InstallOperation,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    percent: Option<u64>,
    status: TransactionStatus,
}

impl InstallTransaction {
    pub fn new(bundle_id: impl Into<String>, operation: InstallOperation, total_bytes: u64) -> Self {
        Self {
            bundle_id: bundle_id.into(),
            operation,
            bytes_transferred: 0,
            total_bytes,
            percent: None,
            status: TransactionStatus::Pending,
        }
    }

    /// The highest percentage the device has reported
    pub fn percent(&self) -> u64 {
        self.percent.unwrap_or(0)
    }

    pub fn status(&self) -> &TransactionStatus {
        &self.status
    }

    /// Records a reported percentage, returning whether progress moved forward.
    /// Lower or repeated values are ignored.
    pub fn record_percent(&mut self, percent: u64) -> bool {
        let percent = percent.min(100);
        if self.percent.is_some_and(|p| p >= percent) {
            return false;
        }
        self.percent = Some(percent);
        true
    }

    /// Sets the terminal status
    ///
    /// # Errors
    /// `InvalidState` if a terminal status was already set
    pub fn finish(&mut self, status: TransactionStatus) -> Result<(), IdeviceError> {
        if self.status.is_terminal() {
            return Err(IdeviceError::InvalidState(format!(
                "{} already finished as {:?}",
                self.bundle_id, self.status
            )));
        }
        if status == TransactionStatus::Succeeded {
            self.record_percent(100);
        }
        self.status = status;
        Ok(())
    }
}

/// What an install reports while it runs
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InstallProgress {
    /// A bundle file is being copied to the device
    Transferring {
        path: String,
        bytes_sent: u64,
        total: u64,
    },
    /// The device is installing, with the highest percentage seen so far
    Installing {
        percent: u64,
        status: Option<String>,
    },
}

pub async fn install(session: &mut Session, bundle: &AppBundle) -> Result<InstallTransaction, IdeviceError> {
    install_with_callback(session, bundle, |_| async {}, ()).await
}

/// Transfers `bundle` and installs or upgrades it
///
/// # Errors
/// * `TransferInterrupted` if copying the bundle fails
/// * `InstallRejected` with the device's reason
/// * `Cancelled` if the session is closed meanwhile
pub async fn install_with_callback<Fut, S>(
    session: &mut Session,
    bundle: &AppBundle,
    callback: impl Fn((InstallProgress, S)) -> Fut,
    state: S,
) -> Result<InstallTransaction, IdeviceError>
where
    Fut: std::future::Future<Output = ()>,
    S: Clone,
{
    session.ensure_active()?;
    let mut inst = session.start_service::<InstallationProxyClient>().await?;
    let installed = inst
        .get_apps(Some("Any"), Some(&[bundle.bundle_id.clone()]))
        .await?;
    let operation = if installed.contains_key(&bundle.bundle_id) {
        InstallOperation::Upgrade
    } else {
        InstallOperation::Install
    };
    let mut transaction = InstallTransaction::new(&bundle.bundle_id, operation, bundle.total_bytes());
    info!("{operation:?} {} ({} bytes)", bundle.bundle_id, transaction.total_bytes);

    let remote = bundle.staging_path(&session.config().staging_dir);
    let mut afc = session.start_service::<AfcClient>().await?;
    if let Err(e) = transfer(&mut afc, bundle, &remote, &mut transaction, &callback, &state).await {
        let e = match e {
            IdeviceError::Cancelled => e,
            other => IdeviceError::TransferInterrupted(other.to_string()),
        };
        transaction.finish(TransactionStatus::Failed(e.to_string()))?;
        return Err(e);
    }
    if let Err(e) = afc.idevice.close().await {
        debug!("Closing AFC failed: {e}");
    }

    inst.idevice.set_timeout(session.config().install_timeout);
    let options = plist_macro::plist!({
        "PackageType": "Developer",
    });

    // percent + 1, so that zero means nothing seen yet
    let seen = AtomicU64::new(0);
    let seen_ref = &seen;
    let callback_ref = &callback;
    let on_update = move |(update, state): (ProgressUpdate, S)| {
        let increased = update
            .percent
            .map(|p| p.min(100))
            .filter(|p| seen_ref.fetch_max(p + 1, Ordering::SeqCst) < p + 1);
        let callback = callback_ref;
        async move {
            if let Some(percent) = increased {
                callback((
                    InstallProgress::Installing {
                        percent,
                        status: update.status,
                    },
                    state,
                ))
                .await;
            }
        }
    };

    let res = match operation {
        InstallOperation::Install => {
            inst.install_with_callback(&remote, Some(options), on_update, state.clone())
                .await
        }
        InstallOperation::Upgrade => {
            inst.upgrade_with_callback(&remote, Some(options), on_update, state.clone())
                .await
        }
    };
    if let Some(p) = seen.load(Ordering::SeqCst).checked_sub(1) {
        transaction.record_percent(p);
    }

    match res {
        Ok(()) => {
            let before = transaction.percent;
            transaction.finish(TransactionStatus::Succeeded)?;
            if before != Some(100) {
                callback((
                    InstallProgress::Installing {
                        percent: 100,
                        status: Some("Complete".into()),
                    },
                    state,
                ))
                .await;
            }
            session.advance(SessionState::Installed)?;
            info!("Installed {}", bundle.bundle_id);
            Ok(transaction)
        }
        Err(e) => {
            warn!("{operation:?} of {} failed: {e}", bundle.bundle_id);
            transaction.finish(TransactionStatus::Failed(e.to_string()))?;
            Err(e)
        }
    }
}

/// Copies every bundle entry below `remote`
async fn transfer<Fut, S>(
    afc: &mut AfcClient,
    bundle: &AppBundle,
    remote: &str,
    transaction: &mut InstallTransaction,
    callback: &impl Fn((InstallProgress, S)) -> Fut,
    state: &S,
) -> Result<(), IdeviceError>
where
    Fut: std::future::Future<Output = ()>,
    S: Clone,
{
    if let Some((staging, _)) = remote.rsplit_once('/') {
        if afc.get_file_info(staging).await.is_err() {
            afc.mk_dir(staging).await?;
        }
    }
    if afc.get_file_info(remote).await.is_ok() {
        debug!("Removing stale {remote}");
        afc.remove_all(remote).await?;
    }
    afc.mk_dir(remote).await?;

    let total = transaction.total_bytes;
    for entry in &bundle.entries {
        let device_path = format!("{remote}/{}", entry.relative_path);
        if entry.is_dir {
            afc.mk_dir(&device_path).await?;
            continue;
        }

        let bytes = tokio::fs::read(bundle.path.join(&entry.relative_path)).await?;
        if bytes.len() as u64 != entry.size {
            return Err(IdeviceError::TransferInterrupted(format!(
                "{} changed size during transfer",
                entry.relative_path
            )));
        }

        let base = transaction.bytes_transferred;
        let path = entry.relative_path.as_str();
        let mut fd = afc.open(&device_path, AfcFopenMode::WrOnly).await?;
        fd.write_with_progress(
            &bytes,
            |((written, _), state): ((usize, usize), S)| {
                callback((
                    InstallProgress::Transferring {
                        path: path.to_string(),
                        bytes_sent: base + written as u64,
                        total,
                    },
                    state,
                ))
            },
            state.clone(),
        )
        .await?;
        fd.close().await?;
        transaction.bytes_transferred += entry.size;
    }
    Ok(())
}

pub async fn uninstall(session: &mut Session, bundle_id: &str) -> Result<(), IdeviceError> {
    uninstall_with_callback(session, bundle_id, |_| async {}, ()).await
}

/// Removes the app `bundle_id`, reporting the device's status messages
pub async fn uninstall_with_callback<Fut, S>(
    session: &mut Session,
    bundle_id: &str,
    callback: impl Fn((ProgressUpdate, S)) -> Fut,
    state: S,
) -> Result<(), IdeviceError>
where
    Fut: std::future::Future<Output = ()>,
    S: Clone,
{
    session.ensure_active()?;
    let mut inst = session.start_service::<InstallationProxyClient>().await?;
    inst.idevice.set_timeout(session.config().install_timeout);
    inst.uninstall_with_callback(bundle_id, callback, state).await?;
    info!("Uninstalled {bundle_id}");
    Ok(())
}

/// Identifiers of the installed user apps, sorted
pub async fn lookup_applications(session: &mut Session) -> Result<Vec<String>, IdeviceError> {
    session.ensure_active()?;
    let mut inst = session.start_service::<InstallationProxyClient>().await?;
    let apps = inst.get_apps(Some("User"), None).await?;
    Ok(apps.into_keys().collect())
}

/// The on-device path of an app's executable, `<Path>/<CFBundleExecutable>`
///
/// # Errors
/// `LaunchFailed` if the app isn't installed or its record is incomplete
pub async fn lookup_executable(session: &mut Session, bundle_id: &str) -> Result<String, IdeviceError> {
    session.ensure_active()?;
    let mut inst = session.start_service::<InstallationProxyClient>().await?;
    let apps = inst
        .get_apps(Some("Any"), Some(&[bundle_id.to_string()]))
        .await?;

    let app = apps
        .get(bundle_id)
        .and_then(|a| a.as_dictionary())
        .ok_or_else(|| IdeviceError::LaunchFailed(format!("{bundle_id} not found in app list")))?;
    let path = app.get("Path").and_then(|x| x.as_string());
    let executable = app.get("CFBundleExecutable").and_then(|x| x.as_string());
    match (path, executable) {
        (Some(p), Some(e)) => Ok(format!("{p}/{e}")),
        _ => Err(IdeviceError::LaunchFailed(format!(
            "{bundle_id} has no Path or CFBundleExecutable"
        ))),
    }
}
