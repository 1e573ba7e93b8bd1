//! Descriptor to fetch-locator resolution.
//!
//! Downloads may be submitted as a descriptor file instead of a locator. The
//! fetch tool converts it: `<fetch> metainfo <descriptor> magnet` prints the
//! locator on stdout.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Error type for locator resolution
#[derive(Debug, Error)]
pub enum LocatorError {
    #[error("Descriptor file not found: {0}")]
    MissingDescriptor(PathBuf),

    #[error("Descriptor is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Descriptor resolution failed: {0}")]
    Failed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Resolve a descriptor on disk into a locator.
pub async fn resolve_locator(fetch_tool: &Path, descriptor: &Path) -> Result<String, LocatorError> {
    if !tokio::fs::try_exists(descriptor).await.unwrap_or(false) {
        return Err(LocatorError::MissingDescriptor(descriptor.to_path_buf()));
    }

    let output = Command::new(fetch_tool)
        .arg("metainfo")
        .arg(descriptor)
        .arg("magnet")
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| LocatorError::Spawn {
            program: fetch_tool.display().to_string(),
            source,
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = stderr.trim();
        return Err(LocatorError::Failed(if detail.is_empty() {
            format!("{} exited with {}", fetch_tool.display(), output.status)
        } else {
            detail.to_string()
        }));
    }

    let locator = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if locator.is_empty() {
        return Err(LocatorError::Failed(format!(
            "{} printed no locator for {}",
            fetch_tool.display(),
            descriptor.display()
        )));
    }

    debug!(descriptor = %descriptor.display(), %locator, "Resolved descriptor");
    Ok(locator)
}

/// Resolve base64-encoded descriptor content into a locator.
///
/// The content is written to a temporary file that lives for the duration of
/// the call.
pub async fn resolve_locator_base64(fetch_tool: &Path, encoded: &str) -> Result<String, LocatorError> {
    let bytes = STANDARD.decode(encoded.trim())?;

    let mut file = tempfile::Builder::new()
        .prefix("taskd-descriptor-")
        .suffix(".torrent")
        .tempfile()?;
    file.write_all(&bytes)?;
    file.flush()?;

    resolve_locator(fetch_tool, file.path()).await
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    /// Write an executable shell script standing in for the fetch tool.
    fn fake_tool(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("torrent");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_resolves_and_trims_locator() {
        let temp = TempDir::new().unwrap();
        let tool = fake_tool(
            temp.path(),
            r#"[ "$1" = metainfo ] && [ "$3" = magnet ] || exit 9
echo "  magnet:?xt=urn:btih:$(basename "$2")  ""#,
        );
        let descriptor = temp.path().join("ubuntu.torrent");
        std::fs::write(&descriptor, b"d4:infod4:name6:ubuntuee").unwrap();

        let locator = resolve_locator(&tool, &descriptor).await.unwrap();
        assert_eq!(locator, "magnet:?xt=urn:btih:ubuntu.torrent");
    }

    #[tokio::test]
    async fn test_base64_content_is_materialized() {
        let temp = TempDir::new().unwrap();
        let tool = fake_tool(temp.path(), r#"printf 'magnet:?dn=%s\n' "$(cat "$2")""#);

        let encoded = STANDARD.encode("payload");
        let locator = resolve_locator_base64(&tool, &encoded).await.unwrap();
        assert_eq!(locator, "magnet:?dn=payload");
    }

    #[tokio::test]
    async fn test_tool_failure_is_reported() {
        let temp = TempDir::new().unwrap();
        let descriptor = temp.path().join("x.torrent");
        std::fs::write(&descriptor, b"x").unwrap();

        let failing = fake_tool(temp.path(), "echo 'bad metainfo' >&2; exit 1");
        match resolve_locator(&failing, &descriptor).await {
            Err(LocatorError::Failed(msg)) => assert_eq!(msg, "bad metainfo"),
            other => panic!("unexpected: {:?}", other),
        }

        let silent = fake_tool(temp.path(), "exit 0");
        assert!(matches!(
            resolve_locator(&silent, &descriptor).await,
            Err(LocatorError::Failed(_))
        ));
    }

    #[tokio::test]
    async fn test_bad_inputs() {
        let tool = PathBuf::from("/nonexistent/torrent");
        assert!(matches!(
            resolve_locator(&tool, Path::new("/nonexistent/x.torrent")).await,
            Err(LocatorError::MissingDescriptor(_))
        ));
        assert!(matches!(
            resolve_locator_base64(&tool, "not base64!").await,
            Err(LocatorError::Decode(_))
        ));
        assert!(matches!(
            resolve_locator_base64(&tool, &STANDARD.encode("x")).await,
            Err(LocatorError::Spawn { .. })
        ));
    }
}
