//! Installation proxy client
//!
//! Looks up, installs, upgrades and removes applications. Long operations
//! stream status dictionaries until one reports `Status = Complete`.

use std::collections::BTreeMap;

use plist::{Dictionary, Value};
use tracing::debug;

use crate::{Idevice, IdeviceError, IdeviceService, config::ServiceNames};

#[derive(Debug)]
pub struct InstallationProxyClient {
    pub idevice: Idevice,
}

/// One status message of a running operation
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ProgressUpdate {
    pub percent: Option<u64>,
    pub status: Option<String>,
}

impl IdeviceService for InstallationProxyClient {
    fn service_name(names: &ServiceNames) -> &str {
        &names.installation_proxy
    }

    fn from_idevice(idevice: Idevice) -> Self {
        Self::new(idevice)
    }
}

/// The reason carried by a failed reply, if any
fn failure(res: &Dictionary) -> Option<String> {
    let error = res.get("Error").and_then(|x| x.as_string());
    let description = res.get("ErrorDescription").and_then(|x| x.as_string());
    match (error, description) {
        (Some(e), Some(d)) => Some(format!("{e}: {d}")),
        (Some(e), None) => Some(e.to_string()),
        (None, Some(d)) => Some(d.to_string()),
        (None, None) => None,
    }
}

impl InstallationProxyClient {
    pub fn new(idevice: Idevice) -> Self {
        Self { idevice }
    }

    /// Looks up installed apps
    ///
    /// # Arguments
    /// * `application_type` - `User`, `System` or `Any`, defaulting to `Any`
    /// * `bundle_identifiers` - Restricts the lookup to these apps
    ///
    /// # Returns
    /// App attributes keyed by bundle identifier
    pub async fn get_apps(
        &mut self,
        application_type: Option<&str>,
        bundle_identifiers: Option<&[String]>,
    ) -> Result<BTreeMap<String, Value>, IdeviceError> {
        let mut options = Dictionary::new();
        options.insert(
            "ApplicationType".into(),
            application_type.unwrap_or("Any").into(),
        );
        if let Some(ids) = bundle_identifiers {
            options.insert(
                "BundleIDs".into(),
                Value::Array(ids.iter().map(|id| Value::from(id.as_str())).collect()),
            );
        }

        let req = plist_macro::plist!({
            "Command": "Lookup",
            "ClientOptions": Value::Dictionary(options),
        });
        self.idevice.send_plist(req).await?;

        let mut res = self.idevice.read_plist_unchecked().await?;
        if let Some(e) = failure(&res) {
            return Err(IdeviceError::InstallRejected(e));
        }
        match res.remove("LookupResult") {
            Some(Value::Dictionary(res)) => Ok(res.into_iter().collect()),
            _ => Err(IdeviceError::ProtocolError("Lookup without LookupResult".into())),
        }
    }

    /// Installs the package staged at `package_path`
    pub async fn install_with_callback<Fut, S>(
        &mut self,
        package_path: &str,
        options: Option<Value>,
        callback: impl Fn((ProgressUpdate, S)) -> Fut,
        state: S,
    ) -> Result<(), IdeviceError>
    where
        Fut: std::future::Future<Output = ()>,
        S: Clone,
    {
        self.package_command("Install", package_path, options, callback, state)
            .await
    }

    /// Replaces an installed app with the package staged at `package_path`
    pub async fn upgrade_with_callback<Fut, S>(
        &mut self,
        package_path: &str,
        options: Option<Value>,
        callback: impl Fn((ProgressUpdate, S)) -> Fut,
        state: S,
    ) -> Result<(), IdeviceError>
    where
        Fut: std::future::Future<Output = ()>,
        S: Clone,
    {
        self.package_command("Upgrade", package_path, options, callback, state)
            .await
    }

    pub async fn uninstall_with_callback<Fut, S>(
        &mut self,
        bundle_id: &str,
        callback: impl Fn((ProgressUpdate, S)) -> Fut,
        state: S,
    ) -> Result<(), IdeviceError>
    where
        Fut: std::future::Future<Output = ()>,
        S: Clone,
    {
        let req = plist_macro::plist!({
            "Command": "Uninstall",
            "ApplicationIdentifier": bundle_id,
            "ClientOptions": {},
        });
        self.idevice.send_plist(req).await?;
        self.watch_completion(callback, state).await
    }

    async fn package_command<Fut, S>(
        &mut self,
        command: &str,
        package_path: &str,
        options: Option<Value>,
        callback: impl Fn((ProgressUpdate, S)) -> Fut,
        state: S,
    ) -> Result<(), IdeviceError>
    where
        Fut: std::future::Future<Output = ()>,
        S: Clone,
    {
        let options = options.unwrap_or_else(|| Value::Dictionary(Dictionary::new()));
        let req = plist_macro::plist!({
            "Command": command,
            "ClientOptions": options,
            "PackagePath": package_path,
        });
        self.idevice.send_plist(req).await?;
        self.watch_completion(callback, state).await
    }

    /// Reads status messages until the operation completes or fails
    async fn watch_completion<Fut, S>(
        &mut self,
        callback: impl Fn((ProgressUpdate, S)) -> Fut,
        state: S,
    ) -> Result<(), IdeviceError>
    where
        Fut: std::future::Future<Output = ()>,
        S: Clone,
    {
        loop {
            let res = self.idevice.read_plist_unchecked().await?;
            if let Some(e) = failure(&res) {
                return Err(IdeviceError::InstallRejected(e));
            }

            let update = ProgressUpdate {
                percent: res.get("PercentComplete").and_then(|x| x.as_unsigned_integer()),
                status: res
                    .get("Status")
                    .and_then(|x| x.as_string())
                    .map(String::from),
            };
            let complete = update.status.as_deref() == Some("Complete");
            debug!("Installation proxy: {update:?}");
            callback((update, state.clone())).await;

            if complete {
                return Ok(());
            }
        }
    }
}
