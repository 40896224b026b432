// SPDX-License-Identifier: MIT OR Apache-2.0
//! Package registry resolution for the CDN build service.
//!
//! [`PackageResolver`] turns a `(name, versionSpec)` pair into a concrete
//! `(name, version, manifest)` triple, consulting the out-of-scope
//! `PKG_FETCH` collaborator (modeled here as the [`PkgFetch`] trait) only
//! when `versionSpec` is not already a fully-pinned version.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use cdn_error::CdnError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// A package manifest as read from the registry (a filtered view of
/// `package.json`/`npm info`). Carries exactly the fields
/// `ModuleIntrospector` and `ResolverPlugin` need.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PackageManifest {
    /// Resolved package name.
    pub name: String,
    /// Resolved, fully-pinned version.
    pub version: String,
    /// CJS entry point, if declared.
    pub main: Option<String>,
    /// ESM entry point, if declared.
    pub module: Option<String>,
    /// Declared type-declaration entry, if any.
    pub types: Option<String>,
    /// Raw `exports` map value, pattern-matched later by the resolver.
    pub exports: Option<serde_json::Value>,
    /// Runtime dependencies declared by the package.
    pub dependencies: BTreeMap<String, String>,
    /// Peer dependencies declared by the package.
    pub peer_dependencies: BTreeMap<String, String>,
}

/// A package resolved to an exact version, with its manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPackage {
    /// Resolved package name (unchanged from the request, but explicit).
    pub name: String,
    /// Fully-pinned three-part version.
    pub version: String,
    /// The package's manifest.
    pub manifest: PackageManifest,
}

/// The out-of-scope package-registry client collaborator.
///
/// `PKG_FETCH.info` in spec terms: given a name and version spec, returns the
/// manifest the registry resolves it to.
#[async_trait]
pub trait PkgFetch: Send + Sync {
    /// Look up manifest info for `name` at `version_spec`, resolving ranges
    /// against the registry.
    async fn info(&self, name: &str, version_spec: &str) -> Result<ResolvedPackage, CdnError>;
}

/// Resolves package specifiers to exact, manifest-backed versions.
pub struct PackageResolver {
    fetch: Arc<dyn PkgFetch>,
}

impl PackageResolver {
    /// Construct a resolver backed by the given [`PkgFetch`] implementation.
    #[must_use]
    pub fn new(fetch: Arc<dyn PkgFetch>) -> Self {
        Self { fetch }
    }

    /// Resolve `(name, version_spec)` to a concrete version and manifest.
    ///
    /// Skips the registry round-trip when `version_spec` is already a
    /// fully-pinned three-part version.
    ///
    /// # Errors
    ///
    /// Returns [`CdnError`] with kind `PackageNotFound` if the registry
    /// reports no such package/version, or `Transient` for other network
    /// failures.
    pub async fn resolve(&self, name: &str, version_spec: &str) -> Result<ResolvedPackage, CdnError> {
        if is_full_version(version_spec) {
            return Ok(ResolvedPackage {
                name: name.to_string(),
                version: version_spec.to_string(),
                manifest: PackageManifest { name: name.to_string(), version: version_spec.to_string(), ..Default::default() },
            });
        }
        self.fetch.info(name, version_spec).await
    }
}

/// `true` if `spec` is already a fully-pinned `major.minor.patch` version
/// (optionally with a prerelease/build suffix), making a registry round-trip
/// unnecessary.
#[must_use]
pub fn is_full_version(spec: &str) -> bool {
    let core = spec.split(['-', '+']).next().unwrap_or(spec);
    let parts: Vec<&str> = core.split('.').collect();
    parts.len() == 3 && parts.iter().all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
}

/// Errors specific to the default npm-registry-backed [`PkgFetch`].
#[derive(Debug, thiserror::Error)]
pub enum RegistryFetchError {
    /// The HTTP request itself failed (DNS, connect, timeout).
    #[error("registry request failed: {0}")]
    Request(String),
    /// The registry responded but the package or version does not exist.
    #[error("package not found: {name}@{version_spec}")]
    NotFound {
        /// Package name requested.
        name: String,
        /// Version spec requested.
        version_spec: String,
    },
    /// The response body could not be parsed as a manifest.
    #[error("malformed registry response for {name}: {reason}")]
    Malformed {
        /// Package name requested.
        name: String,
        /// Parse failure detail.
        reason: String,
    },
}

impl From<RegistryFetchError> for CdnError {
    fn from(err: RegistryFetchError) -> Self {
        match &err {
            RegistryFetchError::NotFound { .. } => CdnError::new(cdn_error::ErrorKind::PackageNotFound, "init", err.to_string()),
            RegistryFetchError::Request(_) => CdnError::new(cdn_error::ErrorKind::Transient, "init", err.to_string()),
            RegistryFetchError::Malformed { .. } => CdnError::new(cdn_error::ErrorKind::Invalid, "init", err.to_string()),
        }
    }
}

/// Default [`PkgFetch`] backed by the public npm registry over HTTP.
pub struct NpmRegistryFetch {
    client: reqwest::Client,
    registry_base: String,
}

impl NpmRegistryFetch {
    /// Construct a fetcher pointed at the given registry base URL (e.g.
    /// `https://registry.npmjs.org`).
    #[must_use]
    pub fn new(registry_base: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), registry_base: registry_base.into() }
    }
}

#[async_trait]
impl PkgFetch for NpmRegistryFetch {
    async fn info(&self, name: &str, version_spec: &str) -> Result<ResolvedPackage, CdnError> {
        let url = format!("{}/{}", self.registry_base.trim_end_matches('/'), name);
        debug!(target: "cdn.registry", name, version_spec, url, "fetching package info");

        let resp = self.client.get(&url).send().await.map_err(|e| {
            warn!(target: "cdn.registry", name, error = %e, "registry request failed");
            RegistryFetchError::Request(e.to_string())
        })?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(RegistryFetchError::NotFound { name: name.to_string(), version_spec: version_spec.to_string() }.into());
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| RegistryFetchError::Malformed { name: name.to_string(), reason: e.to_string() })?;

        let version = resolve_dist_tag_or_range(&body, version_spec)
            .ok_or_else(|| RegistryFetchError::NotFound { name: name.to_string(), version_spec: version_spec.to_string() })?;

        let version_doc = body
            .get("versions")
            .and_then(|v| v.get(&version))
            .ok_or_else(|| RegistryFetchError::Malformed { name: name.to_string(), reason: format!("missing versions.{version}") })?;

        let manifest = manifest_from_json(name, &version, version_doc);
        Ok(ResolvedPackage { name: name.to_string(), version, manifest })
    }
}

fn resolve_dist_tag_or_range(doc: &serde_json::Value, version_spec: &str) -> Option<String> {
    if version_spec.is_empty() || version_spec == "latest" {
        return doc.get("dist-tags").and_then(|t| t.get("latest")).and_then(|v| v.as_str()).map(str::to_string);
    }
    if is_full_version(version_spec) {
        return Some(version_spec.to_string());
    }
    // Best-effort: fall back to the tagged dist version, else the newest key
    // under `versions`. A full semver-range resolver is out of scope here.
    doc.get("dist-tags")
        .and_then(|t| t.get(version_spec))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .or_else(|| doc.get("versions").and_then(|v| v.as_object()).and_then(|m| m.keys().last().cloned()))
}

/// Builds a [`PackageManifest`] from a raw `package.json`-shaped value,
/// whether it came from the registry's `versions.<v>` document or a local
/// on-disk `package.json` read after install — both carry the same fields
/// this crate cares about.
#[must_use]
pub fn manifest_from_json(name: &str, version: &str, doc: &serde_json::Value) -> PackageManifest {
    let string_map = |key: &str| -> BTreeMap<String, String> {
        doc.get(key)
            .and_then(|v| v.as_object())
            .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
            .unwrap_or_default()
    };
    PackageManifest {
        name: name.to_string(),
        version: version.to_string(),
        main: doc.get("main").and_then(|v| v.as_str()).map(str::to_string),
        module: doc.get("module").and_then(|v| v.as_str()).map(str::to_string),
        types: doc
            .get("types")
            .or_else(|| doc.get("typings"))
            .and_then(|v| v.as_str())
            .map(str::to_string),
        exports: doc.get("exports").cloned(),
        dependencies: string_map("dependencies"),
        peer_dependencies: string_map("peerDependencies"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockFetch {
        manifest: PackageManifest,
    }

    #[async_trait]
    impl PkgFetch for MockFetch {
        async fn info(&self, name: &str, _version_spec: &str) -> Result<ResolvedPackage, CdnError> {
            Ok(ResolvedPackage {
                name: name.to_string(),
                version: self.manifest.version.clone(),
                manifest: self.manifest.clone(),
            })
        }
    }

    #[test]
    fn full_version_detection() {
        assert!(is_full_version("18.2.0"));
        assert!(is_full_version("1.0.0-beta.1"));
        assert!(!is_full_version("^18.0.0"));
        assert!(!is_full_version("latest"));
        assert!(!is_full_version("18"));
    }

    #[tokio::test]
    async fn full_version_spec_skips_fetch() {
        let fetch = Arc::new(MockFetch {
            manifest: PackageManifest { name: "react".into(), version: "99.99.99".into(), ..Default::default() },
        });
        let resolver = PackageResolver::new(fetch);
        let resolved = resolver.resolve("react", "18.2.0").await.unwrap();
        // Falls straight through on the requested version, not the mock's.
        assert_eq!(resolved.version, "18.2.0");
    }

    #[tokio::test]
    async fn range_spec_consults_fetch() {
        let fetch = Arc::new(MockFetch {
            manifest: PackageManifest { name: "react".into(), version: "18.2.0".into(), ..Default::default() },
        });
        let resolver = PackageResolver::new(fetch);
        let resolved = resolver.resolve("react", "^18.0.0").await.unwrap();
        assert_eq!(resolved.version, "18.2.0");
    }
}
