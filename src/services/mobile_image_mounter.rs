//! Mobile image mounter client
//!
//! Uploads and mounts the developer disk image that makes debugserver and the
//! other developer services available, and reports what is mounted.

use std::time::Duration;

use plist::{Dictionary, Value};
use tracing::{debug, warn};

use crate::{Idevice, IdeviceError, IdeviceService, config::ServiceNames, util};

/// The image type of developer disk images
pub const DEVELOPER_IMAGE_TYPE: &str = "Developer";

#[derive(Debug)]
pub struct ImageMounter {
    idevice: Idevice,
}

/// An entry of `CopyDevices`
#[derive(Clone, Debug, PartialEq)]
pub struct MountedImage {
    pub image_type: Option<String>,
    pub mount_path: Option<String>,
    pub signature: Option<Vec<u8>>,
    pub raw: Dictionary,
}

impl MountedImage {
    fn from_dictionary(raw: Dictionary) -> Self {
        Self {
            image_type: raw
                .get("DiskImageType")
                .and_then(|x| x.as_string())
                .map(String::from),
            mount_path: raw
                .get("MountPath")
                .and_then(|x| x.as_string())
                .map(String::from),
            signature: raw.get("ImageSignature").and_then(signature_of),
            raw,
        }
    }

    pub fn is_developer(&self) -> bool {
        self.image_type.as_deref() == Some(DEVELOPER_IMAGE_TYPE)
    }
}

impl IdeviceService for ImageMounter {
    fn service_name(names: &ServiceNames) -> &str {
        &names.image_mounter
    }

    fn from_idevice(idevice: Idevice) -> Self {
        Self::new(idevice)
    }
}

/// Signatures come as data, or as an array whose first element is the data
fn signature_of(v: &Value) -> Option<Vec<u8>> {
    match v {
        Value::Data(d) => Some(d.clone()),
        Value::Array(a) => a.first().and_then(|x| x.as_data()).map(|d| d.to_vec()),
        _ => None,
    }
}

/// The reason carried by a failed reply, if any
fn failure(res: &Dictionary) -> Option<String> {
    let error = res.get("Error").and_then(|x| x.as_string())?;
    Some(match res.get("DetailedError").and_then(|x| x.as_string()) {
        Some(detail) => format!("{error}: {detail}"),
        None => error.to_string(),
    })
}

impl ImageMounter {
    pub fn new(idevice: Idevice) -> Self {
        Self { idevice }
    }

    async fn command(&mut self, command: &str, mut body: Dictionary) -> Result<Dictionary, IdeviceError> {
        body.insert("Command".into(), command.into());
        self.idevice.send_plist(Value::Dictionary(body)).await?;
        self.idevice.read_plist_unchecked().await
    }

    /// Lists mounted images
    pub async fn copy_devices(&mut self) -> Result<Vec<MountedImage>, IdeviceError> {
        let mut res = self.command("CopyDevices", Dictionary::new()).await?;
        if let Some(e) = failure(&res) {
            return Err(IdeviceError::ProtocolError(format!("CopyDevices failed: {e}")));
        }
        match res.remove("EntryList") {
            Some(Value::Array(entries)) => Ok(entries
                .into_iter()
                .filter_map(|e| e.into_dictionary())
                .map(MountedImage::from_dictionary)
                .collect()),
            None => Ok(Vec::new()),
            Some(other) => Err(IdeviceError::ProtocolError(format!(
                "EntryList is {other:?}"
            ))),
        }
    }

    /// The signature of the mounted image of `image_type`, `None` if nothing is mounted
    pub async fn lookup_image(&mut self, image_type: &str) -> Result<Option<Vec<u8>>, IdeviceError> {
        let req = plist_macro::plist!({
            "ImageType": image_type,
        });
        let res = self
            .command("LookupImage", req.into_dictionary().unwrap_or_default())
            .await?;
        if let Some(e) = failure(&res) {
            return Err(IdeviceError::ProtocolError(format!("LookupImage failed: {e}")));
        }
        Ok(res.get("ImageSignature").and_then(signature_of))
    }

    /// Streams `image` to the device, reporting `((bytes_sent, total), state)`
    ///
    /// # Errors
    /// `ImageRejected` if the device refuses the upload
    pub async fn upload_image_with_progress<Fut, S>(
        &mut self,
        image_type: &str,
        image: &[u8],
        signature: &[u8],
        callback: impl Fn(((usize, usize), S)) -> Fut,
        state: S,
    ) -> Result<(), IdeviceError>
    where
        Fut: std::future::Future<Output = ()>,
        S: Clone,
    {
        let req = plist_macro::plist!({
            "ImageType": image_type,
            "ImageSize": image.len() as u64,
            "ImageSignature": Value::Data(signature.to_vec()),
        });
        let res = self
            .command("ReceiveBytes", req.into_dictionary().unwrap_or_default())
            .await?;
        if let Some(e) = failure(&res) {
            return Err(IdeviceError::ImageRejected(e));
        }
        let status = util::required_string(&res, "Status")?;
        if status != "ReceiveBytesAck" {
            return Err(IdeviceError::ProtocolError(format!(
                "expected ReceiveBytesAck, got {status}"
            )));
        }

        debug!("Sending {} image bytes", image.len());
        self.idevice
            .send_raw_with_progress(image, callback, state)
            .await?;

        let res = self.idevice.read_plist_unchecked().await?;
        if let Some(e) = failure(&res) {
            return Err(IdeviceError::ImageRejected(e));
        }
        let status = util::required_string(&res, "Status")?;
        if status != "Complete" {
            return Err(IdeviceError::ImageRejected(format!("upload ended with {status}")));
        }
        Ok(())
    }

    /// Mounts a previously uploaded image, waiting up to `timeout` for the result
    ///
    /// # Errors
    /// * `ImageRejected` if the device reports an error or a non-terminal status
    /// * `MountTimeout` if no answer arrives in time
    pub async fn mount_image(
        &mut self,
        image_type: &str,
        signature: &[u8],
        timeout: Duration,
    ) -> Result<(), IdeviceError> {
        let req = plist_macro::plist!({
            "ImageType": image_type,
            "ImageSignature": Value::Data(signature.to_vec()),
        });

        let previous = self.idevice.timeout();
        self.idevice.set_timeout(timeout);
        let res = self
            .command("MountImage", req.into_dictionary().unwrap_or_default())
            .await;
        self.idevice.set_timeout(previous);

        let res = match res {
            Ok(r) => r,
            Err(IdeviceError::Timeout) => return Err(IdeviceError::MountTimeout),
            Err(e) => return Err(e),
        };
        if let Some(e) = failure(&res) {
            return Err(IdeviceError::ImageRejected(e));
        }
        match res.get("Status").and_then(|x| x.as_string()) {
            Some("Complete") => Ok(()),
            Some(other) => Err(IdeviceError::ImageRejected(format!("mount ended with {other}"))),
            None => Err(IdeviceError::ImageRejected("mount reported no status".into())),
        }
    }

    /// Unmounts the image at `mount_path`
    pub async fn unmount_image(
        &mut self,
        image_type: &str,
        mount_path: &str,
        signature: Option<&[u8]>,
    ) -> Result<(), IdeviceError> {
        let mut req = Dictionary::new();
        req.insert("ImageType".into(), image_type.into());
        req.insert("MountPath".into(), mount_path.into());
        if let Some(signature) = signature {
            req.insert("ImageSignature".into(), Value::Data(signature.to_vec()));
        }
        let res = self.command("UnmountImage", req).await?;
        if let Some(e) = failure(&res) {
            warn!("UnmountImage {mount_path} failed: {e}");
            return Err(IdeviceError::ImageRejected(e));
        }
        Ok(())
    }

    /// Tells the service we are done and closes the connection
    pub async fn hangup(mut self) -> Result<(), IdeviceError> {
        let req = plist_macro::plist!({
            "Command": "Hangup",
        });
        self.idevice.send_plist(req).await?;
        self.idevice.close().await
    }
}
