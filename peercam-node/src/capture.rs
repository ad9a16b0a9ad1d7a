//! File-backed capture source.
//!
//! Every request re-reads the image file, so an external process can keep
//! replacing it (e.g. a camera tool writing `latest.png`).

use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use peercam_core::{Capture, CaptureSource, PeerError};

pub struct FileCapture {
    path: PathBuf,
}

impl FileCapture {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CaptureSource for FileCapture {
    async fn request_capture(&self) -> Result<Capture, PeerError> {
        match tokio::fs::read(&self.path).await {
            Ok(data) => Ok(Capture::ready(Bytes::from(data))),
            // Not written yet: nothing to send this tick.
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "capture file missing");
                Ok(Capture::not_ready())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_current_contents() {
        let path = std::env::temp_dir().join(format!("peercam-capture-{}.png", std::process::id()));
        tokio::fs::write(&path, b"\x50\x4E\x47").await.unwrap();

        let source = FileCapture::new(&path);
        let capture = source.request_capture().await.unwrap();
        assert!(capture.ready);
        assert_eq!(&capture.bytes[..], b"\x50\x4E\x47");

        tokio::fs::write(&path, b"second").await.unwrap();
        let capture = source.request_capture().await.unwrap();
        assert_eq!(&capture.bytes[..], b"second");

        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    async fn missing_file_is_not_ready() {
        let source = FileCapture::new("/nonexistent/peercam/latest.png");
        let capture = source.request_capture().await.unwrap();
        assert!(!capture.ready);
        assert!(!capture.is_sendable());
    }
}
