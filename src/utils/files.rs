// Jackson Coxson
// Copying and listing files through AFC

use std::path::Path;

use tracing::debug;

use crate::{
    IdeviceError, Session,
    afc::{AfcClient, opcode::AfcFopenMode},
    house_arrest::HouseArrestClient,
};

/// Opens an app's container when `bundle_id` is given, the media area otherwise
pub async fn open_container(
    session: &mut Session,
    bundle_id: Option<&str>,
) -> Result<AfcClient, IdeviceError> {
    session.ensure_active()?;
    match bundle_id {
        Some(id) => {
            let client = session.start_service::<HouseArrestClient>().await?;
            client.vend_container(id).await
        }
        None => session.start_service::<AfcClient>().await,
    }
}

/// Copies `device_path` to `local_path`, returning the byte count
pub async fn get_file(
    afc: &mut AfcClient,
    device_path: &str,
    local_path: &Path,
) -> Result<u64, IdeviceError> {
    let mut fd = afc.open(device_path, AfcFopenMode::RdOnly).await?;
    let bytes = fd.read_to_end().await?;
    fd.close().await?;
    tokio::fs::write(local_path, &bytes).await?;
    Ok(bytes.len() as u64)
}

/// Copies `local_path` to `device_path`, returning the byte count
pub async fn put_file(
    afc: &mut AfcClient,
    local_path: &Path,
    device_path: &str,
) -> Result<u64, IdeviceError> {
    let bytes = tokio::fs::read(local_path).await?;
    let mut fd = afc.open(device_path, AfcFopenMode::WrOnly).await?;
    fd.write(&bytes).await?;
    fd.close().await?;
    Ok(bytes.len() as u64)
}

/// Lists `root` and everything below it depth first as `(depth, path)`.
/// Paths that can't be listed, files included, appear without children.
pub async fn walk(afc: &mut AfcClient, root: &str) -> Result<Vec<(usize, String)>, IdeviceError> {
    let mut out = Vec::new();
    let mut stack = vec![(0usize, root.to_string())];

    while let Some((depth, path)) = stack.pop() {
        let children = match afc.list_dir(&path).await {
            Ok(c) => c,
            Err(e) if e.ends_session() => return Err(e),
            Err(e) => {
                debug!("Not listing {path}: {e}");
                Vec::new()
            }
        };
        let base = path.trim_end_matches('/').to_string();
        for child in children.into_iter().rev() {
            stack.push((depth + 1, format!("{base}/{child}")));
        }
        out.push((depth, path));
    }
    Ok(out)
}
