use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use log::info;

use crate::error::ProvisionError;

pub const DEFAULT_WEIGHTS_URL: &str =
    "https://github.com/juni0805/dog-emotion-backend/releases/download/v1/dog_emotion_model.pth";

/// Copies the resource at `url` into `dest`.
pub trait Transfer: Send + Sync {
    fn fetch(&self, url: &str, dest: &Path) -> Result<u64, ProvisionError>;
}

/// Plain blocking GET. No timeout: large weight files on slow links are expected.
pub struct HttpTransfer;

impl Transfer for HttpTransfer {
    fn fetch(&self, url: &str, dest: &Path) -> Result<u64, ProvisionError> {
        let transfer_err = |source: reqwest::Error| ProvisionError::Transfer {
            url: url.to_string(),
            source,
        };

        let client = reqwest::blocking::Client::builder()
            .timeout(None)
            .build()
            .map_err(transfer_err)?;
        let mut response = client
            .get(url)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(transfer_err)?;

        let io_err = |source: std::io::Error| ProvisionError::Io {
            path: dest.to_path_buf(),
            source,
        };
        let mut writer = BufWriter::new(File::create(dest).map_err(io_err)?);
        let bytes = response.copy_to(&mut writer).map_err(transfer_err)?;
        writer.flush().map_err(io_err)?;
        Ok(bytes)
    }
}

/// Makes sure the weights artifact exists at `path`, downloading it once if absent.
///
/// The body lands in `<path>.part` first and is renamed on success, so an
/// interrupted download never passes the existence check on the next start.
pub fn ensure_model_file(
    path: &Path,
    url: &str,
    transfer: &dyn Transfer,
) -> Result<(), ProvisionError> {
    if path.exists() {
        return Ok(());
    }

    info!("model file not found -> downloading from {url}");
    let part = partial_path(path);
    let bytes = match transfer.fetch(url, &part) {
        Ok(bytes) => bytes,
        Err(err) => {
            let _ = fs::remove_file(&part);
            return Err(err);
        }
    };

    fs::rename(&part, path).map_err(|source| ProvisionError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    info!("model downloaded: {} ({bytes} bytes)", path.display());
    Ok(())
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records every call and writes a fixed payload.
    #[derive(Default)]
    struct RecordingTransfer {
        calls: Mutex<Vec<String>>,
        fail: bool,
    }

    impl Transfer for RecordingTransfer {
        fn fetch(&self, url: &str, dest: &Path) -> Result<u64, ProvisionError> {
            self.calls.lock().unwrap().push(url.to_string());
            fs::write(dest, b"weights").unwrap();
            if self.fail {
                return Err(ProvisionError::Io {
                    path: dest.to_path_buf(),
                    source: std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "truncated"),
                });
            }
            Ok(7)
        }
    }

    #[test]
    fn existing_file_skips_network() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.pth");
        fs::write(&path, b"cached").unwrap();

        let transfer = RecordingTransfer::default();
        ensure_model_file(&path, DEFAULT_WEIGHTS_URL, &transfer).unwrap();

        assert!(transfer.calls.lock().unwrap().is_empty());
        assert_eq!(fs::read(&path).unwrap(), b"cached");
    }

    #[test]
    fn missing_file_downloads_once_from_url() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.pth");

        let transfer = RecordingTransfer::default();
        ensure_model_file(&path, DEFAULT_WEIGHTS_URL, &transfer).unwrap();
        ensure_model_file(&path, DEFAULT_WEIGHTS_URL, &transfer).unwrap();

        assert_eq!(*transfer.calls.lock().unwrap(), vec![DEFAULT_WEIGHTS_URL.to_string()]);
        assert_eq!(fs::read(&path).unwrap(), b"weights");
        assert!(!partial_path(&path).exists());
    }

    #[test]
    fn failed_download_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.pth");

        let transfer = RecordingTransfer {
            fail: true,
            ..Default::default()
        };
        let err = ensure_model_file(&path, DEFAULT_WEIGHTS_URL, &transfer).unwrap_err();

        assert!(matches!(err, ProvisionError::Io { .. }));
        assert!(!path.exists());
        assert!(!partial_path(&path).exists());
    }
}
