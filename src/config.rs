// Jackson Coxson
//! Runtime configuration.
//!
//! Everything here has a working default. A TOML file may override any subset:
//!
//! ```toml
//! io_timeout = 5.0
//! mount_timeout = 120
//!
//! [services]
//! debugserver = "com.apple.debugserver"
//!
//! [debug_environment]
//! NSUnbufferedIO = "YES"
//! ```

use std::{collections::BTreeMap, path::Path, time::Duration};

use serde::{Deserialize, Deserializer, de::Error as _};

use crate::{DEFAULT_CHUNK_SIZE, DEFAULT_TIMEOUT, IdeviceError, frame::DEFAULT_MAX_FRAME_LEN};

/// Service identifiers requested from lockdown
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServiceNames {
    /// What `QueryType` must answer
    pub lockdown_type: String,
    pub image_mounter: String,
    pub installation_proxy: String,
    pub afc: String,
    pub house_arrest: String,
    /// Tried first when launching
    pub debugserver: String,
    /// Fallback for devices without the secure proxy
    pub debugserver_legacy: String,
}

impl Default for ServiceNames {
    fn default() -> Self {
        Self {
            lockdown_type: "com.apple.mobile.lockdown".into(),
            image_mounter: "com.apple.mobile.mobile_image_mounter".into(),
            installation_proxy: "com.apple.mobile.installation_proxy".into(),
            afc: "com.apple.afc".into(),
            house_arrest: "com.apple.mobile.house_arrest".into(),
            debugserver: "com.apple.debugserver.DVTSecureSocketProxy".into(),
            debugserver_legacy: "com.apple.debugserver".into(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct FruitstrapConfig {
    /// Bound on every individual send and receive
    #[serde(deserialize_with = "seconds")]
    pub io_timeout: Duration,
    /// How long to wait for a matching device to attach
    #[serde(deserialize_with = "seconds")]
    pub device_timeout: Duration,
    /// How long `MountImage` may take to report a terminal status
    #[serde(deserialize_with = "seconds")]
    pub mount_timeout: Duration,
    /// Longest gap between installation proxy status messages
    #[serde(deserialize_with = "seconds")]
    pub install_timeout: Duration,
    /// Longest silence tolerated from a launched app, 0 for no limit
    #[serde(deserialize_with = "seconds")]
    pub output_idle_timeout: Duration,
    /// How long a launched app may stay silent before the device is checked
    /// for a pulse over lockdown
    #[serde(deserialize_with = "seconds")]
    pub liveness_interval: Duration,
    pub chunk_size: usize,
    pub max_frame_len: usize,
    /// AFC directory bundles are staged under
    pub staging_dir: String,
    pub label: String,
    pub services: ServiceNames,
    /// Passed to the launched process through `QEnvironmentHexEncoded`
    pub debug_environment: BTreeMap<String, String>,
}

impl Default for FruitstrapConfig {
    fn default() -> Self {
        Self {
            io_timeout: DEFAULT_TIMEOUT,
            device_timeout: Duration::from_secs(30),
            mount_timeout: Duration::from_secs(60),
            install_timeout: Duration::from_secs(300),
            output_idle_timeout: Duration::ZERO,
            liveness_interval: Duration::from_secs(30),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            staging_dir: "PublicStaging".into(),
            label: "fruitstrap".into(),
            services: ServiceNames::default(),
            debug_environment: BTreeMap::new(),
        }
    }
}

impl FruitstrapConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, IdeviceError> {
        let config: Self = toml::from_str(s).map_err(|e| IdeviceError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, IdeviceError> {
        let s = std::fs::read_to_string(path)?;
        Self::from_toml_str(&s)
    }

    /// Rejects values the transport can't work with
    pub fn validate(&self) -> Result<(), IdeviceError> {
        if self.chunk_size == 0 {
            return Err(IdeviceError::Config("chunk_size must be positive".into()));
        }
        if self.io_timeout.is_zero() {
            return Err(IdeviceError::Config("io_timeout must be positive".into()));
        }
        if self.liveness_interval.is_zero() {
            return Err(IdeviceError::Config(
                "liveness_interval must be positive".into(),
            ));
        }
        if self.max_frame_len < 1024 {
            return Err(IdeviceError::Config(
                "max_frame_len must be at least 1024".into(),
            ));
        }
        Ok(())
    }

    /// Applies one timeout to every slow operation, as the `--timeout` flag does
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.device_timeout = timeout;
        self.mount_timeout = timeout;
        self.install_timeout = timeout;
        self
    }

    /// The idle limit for app output, `None` when disabled
    pub fn output_idle_limit(&self) -> Option<Duration> {
        if self.output_idle_timeout.is_zero() {
            None
        } else {
            Some(self.output_idle_timeout)
        }
    }
}

fn seconds<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    let secs = f64::deserialize(d)?;
    Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
}
