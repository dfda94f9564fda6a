//! Local app bundles
//!
//! An [`AppBundle`] is read once from disk into an immutable manifest: the
//! identity from `Info.plist` plus every directory and file below the bundle
//! root, with sizes, in the order they will be transferred.

use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
};

use plist::{Dictionary, Value};
use tracing::debug;

use crate::IdeviceError;

const INFO_PLIST: &str = "Info.plist";
const ENTITLEMENTS: &str = "archived-expanded-entitlements.xcent";

/// One path inside a bundle
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BundleEntry {
    /// Path below the bundle root, `/` separated
    pub relative_path: String,
    /// Bytes announced for the entry, zero for directories
    pub size: u64,
    pub is_dir: bool,
}

#[derive(Clone, Debug)]
pub struct AppBundle {
    pub path: PathBuf,
    /// The bundle directory's name, e.g. `Example.app`
    pub name: String,
    pub bundle_id: String,
    pub executable: String,
    pub entitlements: Option<Dictionary>,
    pub info: Dictionary,
    pub entries: Vec<BundleEntry>,
}

impl AppBundle {
    /// Reads the bundle at `path`
    ///
    /// # Errors
    /// `InvalidArgument` if `path` isn't a bundle directory or `Info.plist`
    /// lacks `CFBundleIdentifier` or `CFBundleExecutable`
    pub async fn read(path: impl AsRef<Path>) -> Result<Self, IdeviceError> {
        let path = path.as_ref().to_path_buf();
        let meta = tokio::fs::metadata(&path).await?;
        if !meta.is_dir() {
            return Err(IdeviceError::InvalidArgument(format!(
                "{} is not a bundle directory",
                path.display()
            )));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                IdeviceError::InvalidArgument(format!("{} has no name", path.display()))
            })?;

        let info = read_dictionary(&path.join(INFO_PLIST)).await?.ok_or_else(|| {
            IdeviceError::InvalidArgument(format!("{} has no {INFO_PLIST}", path.display()))
        })?;
        let bundle_id = info_string(&info, "CFBundleIdentifier")?;
        let executable = info_string(&info, "CFBundleExecutable")?;
        let entitlements = read_dictionary(&path.join(ENTITLEMENTS)).await?;

        let entries = manifest(&path).await?;
        debug!("{bundle_id}: {} entries", entries.len());

        Ok(Self {
            path,
            name,
            bundle_id,
            executable,
            entitlements,
            info,
            entries,
        })
    }

    /// Reads only the identifier of the bundle at `path`
    pub async fn bundle_id_of(path: impl AsRef<Path>) -> Result<String, IdeviceError> {
        let info = read_dictionary(&path.as_ref().join(INFO_PLIST))
            .await?
            .ok_or_else(|| {
                IdeviceError::InvalidArgument(format!(
                    "{} has no {INFO_PLIST}",
                    path.as_ref().display()
                ))
            })?;
        info_string(&info, "CFBundleIdentifier")
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    /// Where the bundle is staged on the device
    pub fn staging_path(&self, staging_dir: &str) -> String {
        format!("{}/{}", staging_dir.trim_end_matches('/'), self.name)
    }

    /// Whether the app can be debugged
    pub fn get_task_allow(&self) -> bool {
        self.entitlements
            .as_ref()
            .and_then(|e| e.get("get-task-allow"))
            .and_then(|v| v.as_boolean())
            .unwrap_or(false)
    }
}

fn info_string(info: &Dictionary, key: &str) -> Result<String, IdeviceError> {
    info.get(key)
        .and_then(|v| v.as_string())
        .map(String::from)
        .ok_or_else(|| IdeviceError::InvalidArgument(format!("{INFO_PLIST} has no {key}")))
}

/// Reads a plist dictionary, `None` if the file doesn't exist
async fn read_dictionary(path: &Path) -> Result<Option<Dictionary>, IdeviceError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let value: Value = plist::from_bytes(&bytes)?;
    match value {
        Value::Dictionary(d) => Ok(Some(d)),
        _ => Err(IdeviceError::InvalidArgument(format!(
            "{} is not a dictionary",
            path.display()
        ))),
    }
}

/// Lists the bundle breadth first, each directory before its contents
async fn manifest(root: &Path) -> Result<Vec<BundleEntry>, IdeviceError> {
    let mut entries = Vec::new();
    let mut queue: VecDeque<(PathBuf, String)> = VecDeque::new();
    queue.push_back((root.to_path_buf(), String::new()));

    while let Some((dir, prefix)) = queue.pop_front() {
        let mut children = Vec::new();
        let mut rd = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = rd.next_entry().await? {
            children.push(entry);
        }
        children.sort_by_key(|e| e.file_name());

        for child in children {
            let name = child.file_name().to_string_lossy().into_owned();
            let relative_path = if prefix.is_empty() {
                name
            } else {
                format!("{prefix}/{name}")
            };
            let meta = tokio::fs::metadata(child.path()).await?;
            if meta.is_dir() {
                entries.push(BundleEntry {
                    relative_path: relative_path.clone(),
                    size: 0,
                    is_dir: true,
                });
                queue.push_back((child.path(), relative_path));
            } else if meta.is_file() {
                entries.push(BundleEntry {
                    relative_path,
                    size: meta.len(),
                    is_dir: false,
                });
            }
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_bundle(root: &Path) -> PathBuf {
        let app = root.join("Example.app");
        std::fs::create_dir_all(app.join("Base.lproj")).unwrap();
        let info = plist_macro::plist!({
            "CFBundleIdentifier": "com.example.app",
            "CFBundleExecutable": "Example",
        });
        info.to_file_xml(app.join("Info.plist")).unwrap();
        plist_macro::plist!({ "get-task-allow": true })
            .to_file_xml(app.join(ENTITLEMENTS))
            .unwrap();
        std::fs::write(app.join("Example"), vec![0u8; 1000]).unwrap();
        std::fs::write(app.join("Base.lproj/Main.strings"), b"hello").unwrap();
        app
    }

    #[tokio::test]
    async fn reads_manifest_and_identity() {
        let tmp = tempfile::tempdir().unwrap();
        let app = write_bundle(tmp.path());

        let bundle = AppBundle::read(&app).await.unwrap();
        assert_eq!(bundle.name, "Example.app");
        assert_eq!(bundle.bundle_id, "com.example.app");
        assert_eq!(bundle.executable, "Example");
        assert!(bundle.get_task_allow());
        assert_eq!(bundle.staging_path("PublicStaging/"), "PublicStaging/Example.app");

        let paths: Vec<&str> = bundle
            .entries
            .iter()
            .map(|e| e.relative_path.as_str())
            .collect();
        let dir = paths.iter().position(|p| *p == "Base.lproj").unwrap();
        let nested = paths
            .iter()
            .position(|p| *p == "Base.lproj/Main.strings")
            .unwrap();
        assert!(dir < nested);
        assert!(paths.contains(&"Info.plist"));
        assert_eq!(
            bundle.total_bytes(),
            1005 + std::fs::metadata(app.join("Info.plist")).unwrap().len()
                + std::fs::metadata(app.join(ENTITLEMENTS)).unwrap().len()
        );
    }

    #[tokio::test]
    async fn missing_info_plist_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let app = tmp.path().join("Broken.app");
        std::fs::create_dir(&app).unwrap();
        assert!(matches!(
            AppBundle::read(&app).await,
            Err(IdeviceError::InvalidArgument(_))
        ));
        assert!(AppBundle::bundle_id_of(&app).await.is_err());
    }
}
