// SPDX-License-Identifier: MIT OR Apache-2.0
//! Materializes a package and its transitive dependency closure into a
//! working directory, with bounded retries: three attempts, a short pause
//! between failures, and success requires both the install command
//! succeeding AND the package's own manifest being observable on disk
//! afterward.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use cdn_core::Package;
use cdn_error::{CdnError, ErrorKind};
use cdn_registry::PkgFetch;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

mod npm;
pub use npm::NpmInstaller;

/// Maximum number of install attempts before giving up.
pub const MAX_ATTEMPTS: u32 = 3;
/// Pause between failed attempts.
pub const RETRY_PAUSE: Duration = Duration::from_millis(100);

/// The out-of-scope package-manager subprocess collaborator (`yarn add` /
/// `npm install`). Abstracted so tests can substitute a no-op or failing
/// double.
#[async_trait]
pub trait PackageInstaller: Send + Sync {
    /// Run the install command for `name@version` rooted at `work_dir`.
    /// Returning `Ok(())` means the command itself reported success — the
    /// caller is still responsible for verifying the manifest landed on
    /// disk.
    async fn add(&self, work_dir: &Path, name: &str, version: &str) -> Result<(), CdnError>;

    /// Remove any cached install artifacts for `name`, invoked after the
    /// final failed attempt.
    async fn clean_cache(&self, work_dir: &Path, name: &str) -> Result<(), CdnError>;
}

/// Materializes packages into working directories with the retry policy
/// from the build service's installer contract.
pub struct Installer {
    installer: Arc<dyn PackageInstaller>,
    max_attempts: u32,
    retry_pause: Duration,
}

impl Installer {
    /// Construct an installer backed by the given subprocess collaborator,
    /// using the default retry policy ([`MAX_ATTEMPTS`]/[`RETRY_PAUSE`]).
    #[must_use]
    pub fn new(installer: Arc<dyn PackageInstaller>) -> Self {
        Self { installer, max_attempts: MAX_ATTEMPTS, retry_pause: RETRY_PAUSE }
    }

    /// Construct an installer with a retry policy taken from runtime
    /// configuration (`install_max_attempts`/`install_retry_pause_ms`)
    /// rather than the hardcoded defaults.
    #[must_use]
    pub fn with_retry_policy(installer: Arc<dyn PackageInstaller>, max_attempts: u32, retry_pause: Duration) -> Self {
        Self { installer, max_attempts: max_attempts.max(1), retry_pause }
    }

    /// Install `pkg` under `work_dir`, retrying up to the configured
    /// attempt limit.
    ///
    /// # Errors
    ///
    /// Returns a `Transient` [`CdnError`] if every attempt fails; cache
    /// cleanup is scheduled before the error is returned.
    pub async fn install(&self, work_dir: &Path, pkg: &Package) -> Result<(), CdnError> {
        let mut last_err = None;
        for attempt in 1..=self.max_attempts {
            debug!(target: "cdn.installer", pkg = %pkg, attempt, "installing package");
            match self.try_install_once(work_dir, pkg).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(target: "cdn.installer", pkg = %pkg, attempt, error = %err, "install attempt failed");
                    last_err = Some(err);
                    if attempt < self.max_attempts {
                        tokio::time::sleep(self.retry_pause).await;
                    }
                }
            }
        }

        let _ = self.installer.clean_cache(work_dir, &pkg.name).await;
        Err(last_err.unwrap_or_else(|| {
            CdnError::new(ErrorKind::Transient, "install", format!("install of {pkg} exhausted all attempts"))
        }))
    }

    /// Install `pkg` only if its manifest is not already present under
    /// `work_dir`. Reuses the same retry policy as [`install`](Self::install).
    ///
    /// Covers the case where the rewriter discovers a dependency mid-build
    /// that was never part of the initial install closure.
    ///
    /// # Errors
    ///
    /// Same as [`install`](Self::install).
    pub async fn ensure_installed(&self, work_dir: &Path, pkg: &Package) -> Result<(), CdnError> {
        if manifest_path(work_dir, &pkg.name).exists() {
            return Ok(());
        }
        self.install(work_dir, pkg).await
    }

    async fn try_install_once(&self, work_dir: &Path, pkg: &Package) -> Result<(), CdnError> {
        self.installer.add(work_dir, &pkg.name, &pkg.version).await?;
        if !manifest_path(work_dir, &pkg.name).exists() {
            return Err(CdnError::new(
                ErrorKind::Transient,
                "install",
                format!("install command reported success but {} has no manifest on disk", pkg.name),
            ));
        }
        Ok(())
    }
}

fn manifest_path(work_dir: &Path, name: &str) -> PathBuf {
    work_dir.join("node_modules").join(name).join("package.json")
}

/// Resolves a version spec via [`PkgFetch`] before installing, bridging
/// `cdn-registry` and `cdn-installer` for callers that only have a version
/// range.
pub async fn resolve_and_install(
    installer: &Installer,
    fetch: &dyn PkgFetch,
    work_dir: &Path,
    name: &str,
    version_spec: &str,
) -> Result<Package, CdnError> {
    let resolved = fetch.info(name, version_spec).await?;
    let pkg = Package {
        name: resolved.name,
        version: resolved.version,
        submodule: String::new(),
    };
    installer.install(work_dir, &pkg).await?;
    Ok(pkg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    struct FlakyInstaller {
        fail_times: u32,
        calls: AtomicU32,
        write_manifest: bool,
    }

    #[async_trait]
    impl PackageInstaller for FlakyInstaller {
        async fn add(&self, work_dir: &Path, name: &str, _version: &str) -> Result<(), CdnError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                return Err(CdnError::new(ErrorKind::Transient, "install", "simulated failure"));
            }
            if self.write_manifest {
                let dir = work_dir.join("node_modules").join(name);
                std::fs::create_dir_all(&dir).unwrap();
                std::fs::write(dir.join("package.json"), "{}").unwrap();
            }
            Ok(())
        }

        async fn clean_cache(&self, _work_dir: &Path, _name: &str) -> Result<(), CdnError> {
            Ok(())
        }
    }

    fn pkg(name: &str, version: &str) -> Package {
        Package { name: name.to_string(), version: version.to_string(), submodule: String::new() }
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let dir = TempDir::new().unwrap();
        let installer = Installer::new(Arc::new(FlakyInstaller { fail_times: 0, calls: AtomicU32::new(0), write_manifest: true }));
        installer.install(dir.path(), &pkg("left-pad", "1.3.0")).await.unwrap();
    }

    #[tokio::test]
    async fn recovers_after_transient_failures_within_budget() {
        let dir = TempDir::new().unwrap();
        let installer = Installer::new(Arc::new(FlakyInstaller { fail_times: 2, calls: AtomicU32::new(0), write_manifest: true }));
        installer.install(dir.path(), &pkg("left-pad", "1.3.0")).await.unwrap();
    }

    #[tokio::test]
    async fn exhausts_attempts_and_cleans_cache() {
        let dir = TempDir::new().unwrap();
        let installer = Installer::new(Arc::new(FlakyInstaller { fail_times: 10, calls: AtomicU32::new(0), write_manifest: true }));
        let err = installer.install(dir.path(), &pkg("left-pad", "1.3.0")).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn missing_manifest_after_success_is_treated_as_failure() {
        let dir = TempDir::new().unwrap();
        let installer = Installer::new(Arc::new(FlakyInstaller { fail_times: 0, calls: AtomicU32::new(0), write_manifest: false }));
        let err = installer.install(dir.path(), &pkg("left-pad", "1.3.0")).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn ensure_installed_is_a_no_op_when_manifest_already_present() {
        let dir = TempDir::new().unwrap();
        let p = pkg("left-pad", "1.3.0");
        let node_modules = dir.path().join("node_modules").join(&p.name);
        std::fs::create_dir_all(&node_modules).unwrap();
        std::fs::write(node_modules.join("package.json"), "{}").unwrap();

        // Any install attempt here would fail; ensure_installed must skip it.
        let installer = Installer::new(Arc::new(FlakyInstaller { fail_times: 10, calls: AtomicU32::new(0), write_manifest: false }));
        installer.ensure_installed(dir.path(), &p).await.unwrap();
    }
}
