//! Developer disk image handling
//!
//! Mounting is skipped when the device already has an image with the same
//! signature, so running it before every launch is cheap.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use tracing::{debug, info};

use crate::{
    IdeviceError, Session, SessionState,
    lockdown::Capabilities,
    mobile_image_mounter::{DEVELOPER_IMAGE_TYPE, ImageMounter, MountedImage},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MountResult {
    Mounted,
    /// An image with the same signature was already mounted
    AlreadyMounted,
}

/// `DeveloperDiskImage.dmg` -> `DeveloperDiskImage.dmg.signature`
pub fn signature_path(image_path: &Path) -> PathBuf {
    let mut s = OsString::from(image_path.as_os_str());
    s.push(".signature");
    PathBuf::from(s)
}

pub async fn mount(session: &mut Session, image_path: &Path) -> Result<MountResult, IdeviceError> {
    mount_with_progress(session, image_path, |_| async {}, ()).await
}

/// Mounts the developer disk image at `image_path`
///
/// # Arguments
/// * `callback` - Invoked with `((bytes_sent, total), state)` during upload
///
/// # Errors
/// * `ImageRejected` if the device refuses the image
/// * `MountTimeout` if the device doesn't answer within the mount timeout
pub async fn mount_with_progress<Fut, S>(
    session: &mut Session,
    image_path: &Path,
    callback: impl Fn(((usize, usize), S)) -> Fut,
    state: S,
) -> Result<MountResult, IdeviceError>
where
    Fut: std::future::Future<Output = ()>,
    S: Clone,
{
    session.ensure_active()?;
    let image = tokio::fs::read(image_path).await?;
    let signature = tokio::fs::read(signature_path(image_path)).await?;

    let mut mounter = session.start_service::<ImageMounter>().await?;
    if mounter.lookup_image(DEVELOPER_IMAGE_TYPE).await?.as_deref() == Some(signature.as_slice()) {
        info!("{} is already mounted", image_path.display());
        mounter.hangup().await?;
        session.advance(SessionState::Mounted)?;
        return Ok(MountResult::AlreadyMounted);
    }

    mounter
        .upload_image_with_progress(DEVELOPER_IMAGE_TYPE, &image, &signature, callback, state)
        .await?;
    let timeout = session.config().mount_timeout;
    mounter
        .mount_image(DEVELOPER_IMAGE_TYPE, &signature, timeout)
        .await?;
    mounter.hangup().await?;

    info!("Mounted {}", image_path.display());
    session.advance(SessionState::Mounted)?;
    Ok(MountResult::Mounted)
}

/// Unmounts every mounted developer image, returning how many there were
pub async fn unmount(session: &mut Session) -> Result<usize, IdeviceError> {
    session.ensure_active()?;
    let mut mounter = session.start_service::<ImageMounter>().await?;
    let images = mounter.copy_devices().await?;

    let mut count = 0;
    for image in images.iter().filter(|i| i.is_developer()) {
        let Some(mount_path) = image.mount_path.as_deref() else {
            debug!("Skipping developer image without a mount path");
            continue;
        };
        mounter
            .unmount_image(DEVELOPER_IMAGE_TYPE, mount_path, image.signature.as_deref())
            .await?;
        info!("Unmounted {mount_path}");
        count += 1;
    }
    mounter.hangup().await?;
    Ok(count)
}

pub async fn list_images(session: &mut Session) -> Result<Vec<MountedImage>, IdeviceError> {
    session.ensure_active()?;
    let mut mounter = session.start_service::<ImageMounter>().await?;
    let images = mounter.copy_devices().await?;
    mounter.hangup().await?;
    Ok(images)
}

pub async fn is_developer_image_mounted(session: &mut Session) -> Result<bool, IdeviceError> {
    session.ensure_active()?;
    let mut mounter = session.start_service::<ImageMounter>().await?;
    let mounted = mounter.lookup_image(DEVELOPER_IMAGE_TYPE).await?.is_some();
    mounter.hangup().await?;
    Ok(mounted)
}

/// Locates `DeveloperDiskImage.dmg` in an Xcode style DeviceSupport directory
#[derive(Clone, Debug)]
pub struct DeviceSupportPaths {
    root: PathBuf,
    product_version: String,
    build_version: String,
}

impl DeviceSupportPaths {
    pub const IMAGE_NAME: &'static str = "DeveloperDiskImage.dmg";

    pub fn new(
        root: impl Into<PathBuf>,
        product_version: impl Into<String>,
        build_version: impl Into<String>,
    ) -> Self {
        Self {
            root: root.into(),
            product_version: product_version.into(),
            build_version: build_version.into(),
        }
    }

    pub fn for_device(root: impl Into<PathBuf>, capabilities: &Capabilities) -> Self {
        Self::new(
            root,
            capabilities.product_version.clone(),
            capabilities.build_version.clone(),
        )
    }

    /// The DeviceSupport directory of the selected Xcode, honoring `DEVELOPER_DIR`
    pub fn default_root() -> PathBuf {
        let developer = std::env::var_os("DEVELOPER_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/Applications/Xcode.app/Contents/Developer"));
        developer
            .join("Platforms")
            .join("iPhoneOS.platform")
            .join("DeviceSupport")
    }

    /// Directory names to try, most specific first
    pub fn version_permutations(&self) -> Vec<String> {
        let short = self
            .product_version
            .split('.')
            .take(2)
            .collect::<Vec<_>>()
            .join(".");
        vec![
            format!("{} ({})", self.product_version, self.build_version),
            format!("{short} ({})", self.build_version),
            self.product_version.clone(),
            short,
            "Latest".to_string(),
        ]
    }

    /// # Errors
    /// `InvalidArgument` if no candidate directory holds an image
    pub fn developer_disk_image(&self) -> Result<PathBuf, IdeviceError> {
        self.version_permutations()
            .into_iter()
            .map(|dir| self.root.join(dir).join(Self::IMAGE_NAME))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| {
                IdeviceError::InvalidArgument(format!(
                    "could not find a developer disk image for {} ({}) under {}",
                    self.product_version,
                    self.build_version,
                    self.root.display()
                ))
            })
    }
}
