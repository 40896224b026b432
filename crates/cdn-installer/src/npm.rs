// SPDX-License-Identifier: MIT OR Apache-2.0
//! A concrete [`PackageInstaller`] backed by an npm-compatible CLI
//! subprocess (`npm install` by default; any command that installs into
//! the same `node_modules` layout works equally well against the same
//! registry).
use crate::PackageInstaller;
use async_trait::async_trait;
use cdn_error::{CdnError, ErrorKind};
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

/// Invokes a package manager binary (`npm` by default) as a child process
/// to materialize one package into a working directory's `node_modules`.
pub struct NpmInstaller {
    program: String,
    registry: Option<String>,
}

impl NpmInstaller {
    /// An installer that shells out to `npm` on `PATH`, against the
    /// package manager's default registry.
    #[must_use]
    pub fn new() -> Self {
        Self { program: "npm".to_string(), registry: None }
    }

    /// Use a different package manager binary (e.g. `pnpm`, `yarn`), or one
    /// found at an absolute path.
    #[must_use]
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Point installs at a specific registry URL instead of npm's default.
    #[must_use]
    pub fn with_registry(mut self, registry: impl Into<String>) -> Self {
        self.registry = Some(registry.into());
        self
    }
}

impl Default for NpmInstaller {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PackageInstaller for NpmInstaller {
    async fn add(&self, work_dir: &Path, name: &str, version: &str) -> Result<(), CdnError> {
        tokio::fs::create_dir_all(work_dir)
            .await
            .map_err(|e| CdnError::new(ErrorKind::Fatal, "install", format!("could not create work dir: {e}")))?;

        let spec = format!("{name}@{version}");
        let mut cmd = Command::new(&self.program);
        cmd.current_dir(work_dir)
            .arg("install")
            .arg(&spec)
            .arg("--no-save")
            .arg("--no-audit")
            .arg("--no-fund")
            .arg("--ignore-scripts")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(registry) = &self.registry {
            cmd.arg("--registry").arg(registry);
        }

        debug!(target: "cdn.installer.npm", program = %self.program, spec = %spec, "spawning install subprocess");
        let output = cmd.output().await.map_err(|e| {
            CdnError::new(ErrorKind::Transient, "install", format!("failed to spawn {}: {e}", self.program))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(target: "cdn.installer.npm", spec = %spec, status = ?output.status.code(), "install subprocess failed");
            return Err(CdnError::new(
                ErrorKind::Transient,
                "install",
                format!("{} install {spec} exited with {:?}: {}", self.program, output.status.code(), stderr.trim()),
            )
            .with_context("package", name)
            .with_context("version", version));
        }
        Ok(())
    }

    async fn clean_cache(&self, work_dir: &Path, name: &str) -> Result<(), CdnError> {
        let target = work_dir.join("node_modules").join(name);
        match tokio::fs::remove_dir_all(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CdnError::new(ErrorKind::Fatal, "install", format!("could not clean cache for {name}: {e}"))),
        }
    }
}
