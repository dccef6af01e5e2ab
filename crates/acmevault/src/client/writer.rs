//! Certificate files on the local filesystem
//!
//! Files are only rewritten when their content changes, so consumers watching
//! modification times (and the post-update hook) only fire on real updates.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use acmevault_config::ClientConfig;

use super::ClientError;
use crate::certificate::Certificate;

/// Mode for files holding private key material
pub const PRIVATE_FILE_MODE: u32 = 0o600;

/// Mode for the public certificate chain
pub const CERT_FILE_MODE: u32 = 0o640;

#[derive(Debug, Clone, Default)]
pub struct FsCertWriter {
    cert_file: Option<PathBuf>,
    private_key_file: Option<PathBuf>,
    pem_file: Option<PathBuf>,
}

impl FsCertWriter {
    pub fn new(
        cert_file: Option<PathBuf>,
        private_key_file: Option<PathBuf>,
        pem_file: Option<PathBuf>,
    ) -> Self {
        Self {
            cert_file,
            private_key_file,
            pem_file,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(
            config.cert_file.clone(),
            config.private_key_file.clone(),
            config.pem_file.clone(),
        )
    }

    /// Write all configured files. Returns whether any file changed.
    pub async fn write(&self, cert: &Certificate) -> Result<bool, ClientError> {
        let key = cert
            .private_key
            .as_deref()
            .ok_or_else(|| ClientError::MissingPrivateKey(cert.domain.clone()))?;

        let mut changed = false;

        if let Some(path) = &self.cert_file {
            changed |= write_if_changed(path, &cert.certificate, CERT_FILE_MODE).await?;
        }
        if let Some(path) = &self.private_key_file {
            changed |= write_if_changed(path, key, PRIVATE_FILE_MODE).await?;
        }
        if let Some(path) = &self.pem_file {
            let bundle = cert
                .pem_bundle()
                .ok_or_else(|| ClientError::MissingPrivateKey(cert.domain.clone()))?;
            changed |= write_if_changed(path, &bundle, PRIVATE_FILE_MODE).await?;
        }

        Ok(changed)
    }
}

/// Replace `path` with `content` unless it already holds exactly that
async fn write_if_changed(path: &Path, content: &[u8], mode: u32) -> Result<bool, ClientError> {
    let io_err = |source| ClientError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Ok(existing) = fs::read(path).await {
        if Sha256::digest(&existing) == Sha256::digest(content) {
            debug!(path = %path.display(), "File unchanged");
            return Ok(false);
        }
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await.map_err(io_err)?;
    }

    // Write next to the target and rename so readers never see a partial file
    let tmp = path.with_extension("acmevault.tmp");
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(mode);

    let mut file = options.open(&tmp).await.map_err(io_err)?;
    file.write_all(content).await.map_err(io_err)?;
    file.sync_all().await.map_err(io_err)?;
    drop(file);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, std::fs::Permissions::from_mode(mode))
            .await
            .map_err(io_err)?;
    }

    fs::rename(&tmp, path).await.map_err(io_err)?;
    info!(path = %path.display(), "Wrote certificate file");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::tests::self_signed;
    use std::fs;

    fn writer(dir: &Path) -> FsCertWriter {
        FsCertWriter::new(
            Some(dir.join("certs/example.crt")),
            Some(dir.join("private/example.key")),
            Some(dir.join("example.pem")),
        )
    }

    #[tokio::test]
    async fn test_writes_all_files_once() {
        let dir = tempfile::tempdir().unwrap();
        let writer = writer(dir.path());
        let cert = self_signed(&["example.com"], 60);

        assert!(writer.write(&cert).await.unwrap());
        assert!(!writer.write(&cert).await.unwrap());

        assert_eq!(fs::read(dir.path().join("certs/example.crt")).unwrap(), cert.certificate);
        assert_eq!(
            fs::read(dir.path().join("private/example.key")).unwrap(),
            cert.private_key.clone().unwrap()
        );
        assert_eq!(
            fs::read(dir.path().join("example.pem")).unwrap(),
            cert.pem_bundle().unwrap()
        );
    }

    #[tokio::test]
    async fn test_rewrites_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let writer = writer(dir.path());

        assert!(writer.write(&self_signed(&["example.com"], 60)).await.unwrap());
        assert!(writer.write(&self_signed(&["example.com"], 60)).await.unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_modes() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        writer(dir.path())
            .write(&self_signed(&["example.com"], 60))
            .await
            .unwrap();

        let mode = |p: &str| fs::metadata(dir.path().join(p)).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode("certs/example.crt"), CERT_FILE_MODE);
        assert_eq!(mode("private/example.key"), PRIVATE_FILE_MODE);
        assert_eq!(mode("example.pem"), PRIVATE_FILE_MODE);
    }

    #[tokio::test]
    async fn test_requires_private_key() {
        let dir = tempfile::tempdir().unwrap();
        let cert = self_signed(&["example.com"], 60).without_private_key();

        assert!(matches!(
            writer(dir.path()).write(&cert).await,
            Err(ClientError::MissingPrivateKey(_))
        ));
    }
}
