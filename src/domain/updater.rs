//! In-place binary replacement.
//!
//! The live executable is only touched by the final `rename`, after the
//! download completed and the new binary passed its self-check.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use nix::errno::Errno;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use super::heartbeat::versions_match;
use crate::config::UpdateConfig;
use crate::platform::{self, Arch};

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("cannot resolve own executable path: {0}")]
    ExecutablePath(#[source] std::io::Error),

    #[error("no release artifact published for architecture '{0}'")]
    UnsupportedArch(String),

    #[error("artifact download failed: {0}")]
    Download(#[from] reqwest::Error),

    #[error("artifact for {version} returned HTTP {status}")]
    HttpStatus { status: u16, version: String },

    #[error("writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("downloaded binary failed verification: {0}")]
    Verification(String),

    #[error("replacing {path}: {source}")]
    Replace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Where a given version is fetched from on this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateManifest {
    pub target_version: String,
    pub download_url: String,
}

#[async_trait]
pub trait Updater: Send + Sync {
    /// Install `target_version` and schedule a restart.
    async fn update(&self, target_version: &str) -> Result<(), UpdateError>;
}

pub struct SelfUpdater {
    config: UpdateConfig,
    token: Option<String>,
    executable: Option<PathBuf>,
}

impl SelfUpdater {
    pub fn new(config: UpdateConfig, token: Option<String>) -> Self {
        Self {
            config,
            token,
            executable: None,
        }
    }

    /// Replace `path` instead of the running executable.
    #[cfg(test)]
    pub fn with_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.executable = Some(path.into());
        self
    }

    pub fn manifest(&self, target_version: &str) -> Result<UpdateManifest, UpdateError> {
        let arch = Arch::detect()?;
        Ok(UpdateManifest {
            target_version: target_version.to_string(),
            download_url: platform::artifact_url(&self.config.release_url, target_version, arch),
        })
    }

    fn executable(&self) -> Result<PathBuf, UpdateError> {
        match &self.executable {
            Some(path) => Ok(path.clone()),
            None => std::env::current_exe().map_err(UpdateError::ExecutablePath),
        }
    }

    /// Download, verify and swap in `target_version`. Returns the replaced path.
    pub async fn install(&self, target_version: &str) -> Result<PathBuf, UpdateError> {
        let exe = self.executable()?;
        let manifest = self.manifest(target_version)?;
        let mut tmp = exe.clone().into_os_string();
        tmp.push(".new");
        let tmp = PathBuf::from(tmp);

        info!(
            version = %manifest.target_version,
            url = %manifest.download_url,
            "downloading agent update"
        );

        let result = self.stage(&manifest, &exe, &tmp).await;
        if result.is_err() {
            if let Err(e) = tokio::fs::remove_file(&tmp).await {
                if e.kind() != ErrorKind::NotFound {
                    warn!(path = %tmp.display(), error = %e, "failed to remove staged binary");
                }
            }
        }
        result.map(|_| exe)
    }

    async fn stage(
        &self,
        manifest: &UpdateManifest,
        exe: &Path,
        tmp: &Path,
    ) -> Result<(), UpdateError> {
        self.download(manifest, tmp).await?;
        if self.config.verify {
            verify(tmp, &manifest.target_version).await?;
        }
        tokio::fs::rename(tmp, exe)
            .await
            .map_err(|source| UpdateError::Replace {
                path: exe.to_path_buf(),
                source,
            })?;
        info!(version = %manifest.target_version, path = %exe.display(), "agent binary replaced");
        Ok(())
    }

    async fn download(&self, manifest: &UpdateManifest, tmp: &Path) -> Result<(), UpdateError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.config.download_timeout_secs.max(1)))
            .user_agent(concat!("edge-agent/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let mut request = client.get(&manifest.download_url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let resp = request.send().await?;
        if resp.status() != reqwest::StatusCode::OK {
            return Err(UpdateError::HttpStatus {
                status: resp.status().as_u16(),
                version: manifest.target_version.clone(),
            });
        }

        let io_err = |source| UpdateError::Io {
            path: tmp.to_path_buf(),
            source,
        };

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o755)
            .open(tmp)
            .await
            .map_err(io_err)?;

        let mut hasher = Sha256::new();
        let mut written: u64 = 0;
        let mut body = resp.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            written += chunk.len() as u64;
            file.write_all(&chunk).await.map_err(io_err)?;
        }
        file.flush().await.map_err(io_err)?;
        file.sync_all().await.map_err(io_err)?;
        drop(file);

        let digest = format!("{:x}", hasher.finalize());
        info!(bytes = written, sha256 = %digest, "artifact downloaded");
        Ok(())
    }

    /// Ask the supervisor to restart the agent. Without a supervisor command
    /// configured this is a no-op.
    pub async fn restart_service(&self) {
        let Some((program, args)) = self.config.restart_command.split_first() else {
            info!("no restart command configured; new binary takes effect on next start");
            return;
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        info!(command = %self.config.restart_command.join(" "), "restarting agent service");
        match Command::new(program).args(args).status().await {
            Ok(status) if status.success() => {}
            Ok(status) => {
                error!(%status, "restart command failed; exiting so the supervisor restarts the agent");
                std::process::exit(0);
            }
            Err(e) => {
                error!(error = %e, "restart command could not run; exiting so the supervisor restarts the agent");
                std::process::exit(0);
            }
        }
    }
}

#[async_trait]
impl Updater for SelfUpdater {
    async fn update(&self, target_version: &str) -> Result<(), UpdateError> {
        self.install(target_version).await?;
        let restarter = SelfUpdater::new(self.config.clone(), None);
        tokio::spawn(async move {
            restarter.restart_service().await;
        });
        Ok(())
    }
}

/// Run `<binary> version` and require exit 0 plus a first line of the form
/// `edge-agent <version>` naming exactly the target version.
async fn verify(binary: &Path, target_version: &str) -> Result<(), UpdateError> {
    let output = run_self_check(binary).await?;

    if !output.status.success() {
        return Err(UpdateError::Verification(format!(
            "self-check exited with {}",
            output.status
        )));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    match reported_version(&stdout) {
        Some(reported) if versions_match(reported, target_version) => {
            debug!(version = reported, "self-check passed");
            Ok(())
        }
        _ => Err(UpdateError::Verification(format!(
            "expected version {} in self-check output, got '{}'",
            target_version,
            stdout.trim()
        ))),
    }
}

/// Version token from the first line of `edge-agent version` output.
fn reported_version(stdout: &str) -> Option<&str> {
    let mut words = stdout.lines().next()?.split_whitespace();
    match (words.next(), words.next(), words.next()) {
        (Some("edge-agent"), Some(version), None) => Some(version),
        _ => None,
    }
}

async fn run_self_check(binary: &Path) -> Result<std::process::Output, UpdateError> {
    let mut attempts = 0;
    loop {
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            Command::new(binary).arg("version").kill_on_drop(true).output(),
        )
        .await
        .map_err(|_| UpdateError::Verification("self-check timed out".to_string()))?;

        match result {
            // The write handle may still be closing in another thread.
            Err(e) if e.raw_os_error() == Some(Errno::ETXTBSY as i32) && attempts < 5 => {
                attempts += 1;
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(e) => {
                return Err(UpdateError::Verification(format!(
                    "self-check could not run: {}",
                    e
                )))
            }
            Ok(output) => return Ok(output),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ORIGINAL: &[u8] = b"#!/bin/sh\necho edge-agent 1.0.0\n";

    fn setup(server: &MockServer, verify: bool) -> (tempfile::TempDir, PathBuf, SelfUpdater) {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("edge-agent");
        std::fs::write(&exe, ORIGINAL).unwrap();

        let config = UpdateConfig {
            enabled: true,
            release_url: format!("{}/download/v{{version}}/edge-agent-linux-{{arch}}", server.uri()),
            verify,
            restart_command: Vec::new(),
            download_timeout_secs: 5,
        };
        let updater = SelfUpdater::new(config, None).with_executable(&exe);
        (dir, exe, updater)
    }

    async fn serve(server: &MockServer, status: u16, body: &[u8]) {
        Mock::given(method("GET"))
            .and(path_regex("^/download/v2.0.0/edge-agent-linux-"))
            .respond_with(ResponseTemplate::new(status).set_body_bytes(body.to_vec()))
            .mount(server)
            .await;
    }

    fn staged(exe: &Path) -> PathBuf {
        PathBuf::from(format!("{}.new", exe.display()))
    }

    #[tokio::test]
    async fn non_200_leaves_binary_untouched() {
        let server = MockServer::start().await;
        serve(&server, 404, b"not found").await;
        let (_dir, exe, updater) = setup(&server, true);

        let err = updater.install("v2.0.0").await.unwrap_err();
        assert!(matches!(err, UpdateError::HttpStatus { status: 404, .. }));
        assert_eq!(std::fs::read(&exe).unwrap(), ORIGINAL);
        assert!(!staged(&exe).exists());
    }

    #[tokio::test]
    async fn failed_self_check_leaves_binary_untouched() {
        let server = MockServer::start().await;
        serve(&server, 200, b"#!/bin/sh\necho edge-agent 1.9.0\n").await;
        let (_dir, exe, updater) = setup(&server, true);

        let err = updater.install("v2.0.0").await.unwrap_err();
        assert!(matches!(err, UpdateError::Verification(_)));
        assert_eq!(std::fs::read(&exe).unwrap(), ORIGINAL);
        assert!(!staged(&exe).exists());
    }

    #[tokio::test]
    async fn near_miss_version_fails_verification() {
        for body in [
            &b"#!/bin/sh\necho edge-agent 12.0.0\n"[..],
            &b"#!/bin/sh\necho edge-agent 2.0.0-rc1\n"[..],
            &b"#!/bin/sh\necho edge-agent 2.0.0.1\n"[..],
        ] {
            let server = MockServer::start().await;
            serve(&server, 200, body).await;
            let (_dir, exe, updater) = setup(&server, true);

            let err = updater.install("v2.0.0").await.unwrap_err();
            assert!(matches!(err, UpdateError::Verification(_)), "{:?}", err);
            assert_eq!(std::fs::read(&exe).unwrap(), ORIGINAL);
            assert!(!staged(&exe).exists());
        }
    }

    #[test]
    fn reads_version_from_first_line_only() {
        assert_eq!(reported_version("edge-agent 2.0.0\n"), Some("2.0.0"));
        assert_eq!(reported_version("edge-agent v2.0.0\n  latest: 3.0.0\n"), Some("v2.0.0"));
        assert_eq!(reported_version("edge-agent\n"), None);
        assert_eq!(reported_version("other-tool 2.0.0\n"), None);
        assert_eq!(reported_version(""), None);
    }

    #[tokio::test]
    async fn nonzero_self_check_fails_verification() {
        let server = MockServer::start().await;
        serve(&server, 200, b"#!/bin/sh\necho edge-agent 2.0.0\nexit 1\n").await;
        let (_dir, exe, updater) = setup(&server, true);

        assert!(matches!(
            updater.install("v2.0.0").await,
            Err(UpdateError::Verification(_))
        ));
        assert_eq!(std::fs::read(&exe).unwrap(), ORIGINAL);
    }

    #[tokio::test]
    async fn verified_download_replaces_binary() {
        let server = MockServer::start().await;
        let new_binary = b"#!/bin/sh\necho edge-agent 2.0.0\n";
        serve(&server, 200, new_binary).await;
        let (_dir, exe, updater) = setup(&server, true);

        let replaced = updater.install("v2.0.0").await.unwrap();
        assert_eq!(replaced, exe);
        assert_eq!(std::fs::read(&exe).unwrap(), new_binary);
        assert!(!staged(&exe).exists());

        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&exe).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
    }

    #[tokio::test]
    async fn manifest_strips_leading_v() {
        let server = MockServer::start().await;
        let (_dir, _exe, updater) = setup(&server, false);
        let manifest = updater.manifest("v2.0.0").unwrap();
        assert!(manifest.download_url.contains("/download/v2.0.0/edge-agent-linux-"));
        assert_eq!(manifest.target_version, "v2.0.0");
    }
}
