use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::trace;

use crate::types::Result;

/// File system utilities
pub struct FsUtils;

impl FsUtils {
    /// Ensure the directory exists, owner-only on unix
    pub async fn ensure_private_dir<P: AsRef<Path>>(path: P) -> Result<()> {
        let path = path.as_ref();

        if !path.exists() {
            fs::create_dir_all(path).await?;
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, std::fs::Permissions::from_mode(0o700)).await?;
        }

        Ok(())
    }

    /// Replace a file's contents atomically with restrictive permissions.
    ///
    /// The data lands in a sibling temp file that is synced and renamed over
    /// the target, so readers see either the old or the new contents.
    pub async fn write_atomic<P: AsRef<Path>>(path: P, data: &[u8]) -> Result<()> {
        let path = path.as_ref();
        trace!("Writing {} bytes to file: {}", data.len(), path.display());

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).await?;
            }
        }

        let tmp = Self::temp_path(path);

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = fs::rename(&tmp, path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        Ok(())
    }

    /// Read a file, `None` when it does not exist
    pub async fn read_optional<P: AsRef<Path>>(path: P) -> Result<Option<Vec<u8>>> {
        match fs::read(path.as_ref()).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a file, ignoring absence
    pub async fn remove_file<P: AsRef<Path>>(path: P) -> Result<()> {
        match fs::remove_file(path.as_ref()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a directory and all its contents, ignoring absence
    pub async fn remove_dir_all<P: AsRef<Path>>(path: P) -> Result<()> {
        match fs::remove_dir_all(path.as_ref()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn temp_path(path: &Path) -> PathBuf {
        let mut name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        path.with_file_name(name)
    }
}
