//! House arrest
//!
//! Vends an app's sandbox container over AFC, so files can be read and written
//! inside it without a jailbreak. Only apps signed with `get-task-allow`
//! (development builds) can be vended.

use tracing::debug;

use crate::{Idevice, IdeviceError, IdeviceService, config::ServiceNames, util};

use super::afc::AfcClient;

#[derive(Debug)]
pub struct HouseArrestClient {
    pub idevice: Idevice,
}

impl IdeviceService for HouseArrestClient {
    fn service_name(names: &ServiceNames) -> &str {
        &names.house_arrest
    }

    fn from_idevice(idevice: Idevice) -> Self {
        Self::new(idevice)
    }
}

impl HouseArrestClient {
    pub fn new(idevice: Idevice) -> Self {
        Self { idevice }
    }

    /// Exposes the container of `bundle_id` (Documents, Library, tmp) over AFC
    ///
    /// # Errors
    /// `InvalidArgument` if the device can't vend that app
    pub async fn vend_container(mut self, bundle_id: &str) -> Result<AfcClient, IdeviceError> {
        let req = plist_macro::plist!({
            "Command": "VendContainer",
            "Identifier": bundle_id,
        });
        self.idevice.send_plist(req).await?;
        let res = self.idevice.read_plist_unchecked().await?;

        if let Some(e) = util::optional_string(&res, "Error")? {
            return Err(IdeviceError::InvalidArgument(format!(
                "cannot vend {bundle_id}: {e}"
            )));
        }
        debug!("Vended container of {bundle_id}");
        Ok(AfcClient::new(self.idevice))
    }
}
