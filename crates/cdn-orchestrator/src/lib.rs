// SPDX-License-Identifier: MIT OR Apache-2.0
//! Glues every other crate into the single-build pipeline: install,
//! introspect, bundle, rewrite, persist, and schedule sub-builds for
//! externals that aren't already resolvable to a finished artifact.
//!
//! Each stage is expressed as plain `?`-propagating Rust rather than behind
//! a generic stage trait — the stages are too heterogeneous (install needs
//! a working directory, rewrite needs the bundle's output) to share one
//! trait usefully.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use cdn_bundler::{BundleOptions, Bundler, BundlerDriver};
use cdn_config::BuildServiceConfig;
use cdn_core::{fingerprint, BuildDescriptor, DepsSet, ModuleMeta, Package, Target};
use cdn_error::{CdnError, ErrorKind};
use cdn_installer::Installer;
use cdn_introspect::{EntryManifest, ModuleIntrospector};
use cdn_queue::{BuildExecutor, BuildQueue};
use cdn_registry::{PackageManifest, PackageResolver, PkgFetch};
use cdn_resolver::{ResolveCtx, ResolverPlugin};
use cdn_rewrite::{ExternalInfo, OutputRewriter, RewriteCtx};
use cdn_store::{FsStore, MetaStore};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// The outcome of one completed build, shared across every coalesced
/// consumer by [`cdn_queue::BuildQueue`].
#[derive(Debug, Clone, PartialEq)]
pub struct BuildResult {
    /// The fingerprint this result was produced for, doubling as the `FS`
    /// and `DB` key.
    pub build_id: String,
    /// CDN-relative path the artifact was written to (identical to
    /// `build_id` in this implementation; kept as a separate field because
    /// the artifact store and the metadata store treat them as conceptually
    /// distinct keys).
    pub artifact_path: String,
    /// Metadata persisted alongside the artifact.
    pub meta: ModuleMeta,
}

/// Runs one build end to end: install, introspect, bundle, rewrite,
/// persist, `checkDTS`, and — for externals that resolve to a sibling
/// submodule or a dependency that isn't built yet — scheduling sub-builds
/// through the same [`BuildQueue`] this task is itself a worker of.
///
/// The `queue` field is a [`Weak`] handle to break the ownership cycle: the
/// queue owns this task as its `BuildExecutor`, and this task needs the
/// queue to schedule sub-builds. Constructed via [`spawn`]'s
/// `Arc::new_cyclic`.
pub struct BuildTask<B> {
    fetch: Arc<dyn PkgFetch>,
    resolver: PackageResolver,
    installer: Installer,
    bundler_driver: BundlerDriver<B>,
    fs: Arc<dyn FsStore>,
    meta_store: Arc<dyn MetaStore>,
    config: BuildServiceConfig,
    queue: Weak<BuildQueue<BuildResult, BuildTask<B>>>,
}

impl<B: Bundler + Send + Sync + 'static> BuildTask<B> {
    /// Construct a task. Prefer [`spawn`] unless you need to wire the
    /// `Weak<BuildQueue<..>>` some other way (e.g. tests that never
    /// schedule sub-builds and pass `Weak::new()`).
    #[must_use]
    pub fn new(
        fetch: Arc<dyn PkgFetch>,
        installer: Installer,
        bundler_driver: BundlerDriver<B>,
        fs: Arc<dyn FsStore>,
        meta_store: Arc<dyn MetaStore>,
        config: BuildServiceConfig,
        queue: Weak<BuildQueue<BuildResult, BuildTask<B>>>,
    ) -> Self {
        Self { resolver: PackageResolver::new(fetch.clone()), fetch, installer, bundler_driver, fs, meta_store, config, queue }
    }

    async fn run(&self, descriptor: &BuildDescriptor) -> Result<BuildResult, CdnError> {
        let fp = fingerprint(descriptor);
        let artifact_path = fp.clone();

        if cdn_store::already_built(self.fs.as_ref(), self.meta_store.as_ref(), &fp, &artifact_path).await? {
            debug!(target: "cdn.orchestrator", fingerprint = %fp, "already built, skipping pipeline");
            let meta = self.meta_store.get(&fp).await?;
            return Ok(BuildResult { build_id: fp, artifact_path, meta });
        }

        let _work_dir_guard;
        let work_dir: PathBuf = match &descriptor.work_dir {
            Some(shared) => PathBuf::from(shared),
            None => {
                let dir = TempDir::new().map_err(|e| CdnError::new(ErrorKind::Fatal, "init", format!("failed to create working directory: {e}")))?;
                let path = dir.path().to_path_buf();
                _work_dir_guard = Some(dir);
                path
            }
        };

        let resolved = self.resolver.resolve(&descriptor.package.name, &descriptor.package.version).await?;
        let mut package = descriptor.package.clone();
        package.version = resolved.version.clone();
        self.installer.install(&work_dir, &package).await?;

        for dep in &descriptor.deps {
            self.installer.ensure_installed(&work_dir, dep).await?;
        }

        // `resolved.manifest` may be an empty stub: `PackageResolver::resolve`
        // skips the registry round-trip entirely once the version is already
        // pinned, which is the common case for every sub-build this task
        // itself schedules. The manifest actually on disk after install is
        // the one `ModuleIntrospector` and the resolver plugin need.
        let package_dir = work_dir.join("node_modules").join(&package.name);
        let manifest = self.read_local_manifest(&package_dir, &package).await?;

        if descriptor.target == Target::Types {
            return self.build_types_only(descriptor, &fp, &artifact_path, &manifest, &package).await;
        }

        let entry_manifest = EntryManifest { main: manifest.main.clone(), module: manifest.module.clone(), types: manifest.types.clone() };
        let introspection = ModuleIntrospector::introspect(&package_dir, &entry_manifest)?;

        if introspection.meta.types_only {
            return self.build_types_only(descriptor, &fp, &artifact_path, &manifest, &package).await;
        }

        let node_modules_dir = work_dir.join("node_modules");
        let peer_dependencies: BTreeSet<String> = manifest.peer_dependencies.keys().cloned().collect();
        let entry_import_path = package.import_path();
        let resolve_ctx = ResolveCtx {
            pkg: &package,
            alias: &descriptor.alias,
            bundle_mode: descriptor.bundle_mode,
            no_require: descriptor.no_require,
            peer_dependencies: &peer_dependencies,
            defined_exports: manifest.exports.as_ref(),
            node_modules_dir: &node_modules_dir,
            entry_point: Some(entry_import_path.as_str()),
        };
        let mut resolver_plugin = ResolverPlugin::new(resolve_ctx);

        let entry_point = package_dir.join(&introspection.entry).to_string_lossy().into_owned();
        let known_exports = introspection.meta.exports.clone();
        let synthesize_entry_dir = work_dir.clone();
        let entry_for_synth = entry_import_path.clone();
        let synthesize_reexport_entry = move || synthesize_reexport_source(&synthesize_entry_dir, &entry_for_synth, &known_exports);

        let define = cdn_bundler::build_define_table(descriptor.target, descriptor.dev_mode, &entry_point);
        let options = BundleOptions {
            entry_point,
            working_dir: work_dir.to_string_lossy().into_owned(),
            target: descriptor.target,
            external: BTreeSet::new(),
            minify: !descriptor.dev_mode,
            define,
        };

        let bundle = self.bundler_driver.run(options, &entry_import_path, &mut resolver_plugin, synthesize_reexport_entry).await?;

        let mut resolutions: BTreeMap<String, ExternalInfo> = BTreeMap::new();
        for specifier in resolver_plugin.externals().iter() {
            let info = self.resolve_external(specifier, descriptor, &manifest, &package, &work_dir).await?;
            resolutions.insert(specifier.clone(), info);
        }

        let rewrite_ctx = RewriteCtx { target: descriptor.target, development: descriptor.dev_mode, deno_std_version: self.config.deno_std_version.clone() };
        let pkg_display = package.to_string();

        let mut package_css = false;
        let mut artifact_bytes: Option<Vec<u8>> = None;
        for file in &bundle.files {
            if file.path.ends_with(".css") {
                package_css = true;
                self.fs.write_file(&css_artifact_path(&artifact_path), &file.contents).await?;
                continue;
            }
            if !file.path.ends_with(".js") {
                continue;
            }
            let rewritten = OutputRewriter::rewrite(&file.contents, &rewrite_ctx, &pkg_display, descriptor.build_version, &resolutions)?;
            artifact_bytes = Some(rewritten.code);
        }

        let code = artifact_bytes
            .ok_or_else(|| CdnError::new(ErrorKind::BuildFailed, "bundle", "bundler produced no JavaScript output file"))?;
        self.fs.write_file(&artifact_path, &code).await?;

        let dts = self.check_dts(&manifest, &package, descriptor).await;

        let meta = ModuleMeta {
            exports: introspection.meta.exports,
            export_default: introspection.meta.export_default,
            cjs: introspection.meta.cjs,
            types_only: false,
            package_css,
            dts,
        };
        self.meta_store.put(&fp, &meta).await?;

        info!(target: "cdn.orchestrator", fingerprint = %fp, externals = resolutions.len(), "build complete");
        Ok(BuildResult { build_id: fp, artifact_path, meta })
    }

    /// Reads and parses the installed package's own `package.json`.
    ///
    /// The installer's contract already guarantees this file exists once
    /// `install`/`ensure_installed` succeed, so a read failure here is
    /// treated as fatal rather than retried.
    async fn read_local_manifest(&self, package_dir: &Path, package: &Package) -> Result<PackageManifest, CdnError> {
        let manifest_path = package_dir.join("package.json");
        let bytes = tokio::fs::read(&manifest_path).await.map_err(|e| {
            CdnError::new(ErrorKind::Fatal, "introspect", format!("failed to read {}: {e}", manifest_path.display()))
        })?;
        let doc: serde_json::Value = serde_json::from_slice(&bytes).map_err(|e| {
            CdnError::new(ErrorKind::Fatal, "introspect", format!("{} is not valid JSON: {e}", manifest_path.display()))
        })?;
        Ok(cdn_registry::manifest_from_json(&package.name, &package.version, &doc))
    }

    async fn build_types_only(
        &self,
        descriptor: &BuildDescriptor,
        fp: &str,
        artifact_path: &str,
        manifest: &PackageManifest,
        package: &Package,
    ) -> Result<BuildResult, CdnError> {
        let dts = self.check_dts(manifest, package, descriptor).await;
        let meta = ModuleMeta { exports: Vec::new(), export_default: false, cjs: false, types_only: true, package_css: false, dts };
        self.meta_store.put(fp, &meta).await?;
        Ok(BuildResult { build_id: fp.to_string(), artifact_path: artifact_path.to_string(), meta })
    }

    /// `checkDTS`: the package's own declarations if present, else
    /// `@types/<name>` tried in order `(deps-pinned version, ~minor,
    /// ^major, latest)`.
    async fn check_dts(&self, manifest: &PackageManifest, package: &Package, descriptor: &BuildDescriptor) -> String {
        if let Some(types) = &manifest.types {
            if !types.is_empty() {
                return format!("/v{}/{}@{}/{}", descriptor.build_version, package.name, package.version, types.trim_start_matches("./"));
            }
        }

        let types_pkg_name = format!("@types/{}", strip_scope(&package.name));
        let candidates = dts_version_candidates(descriptor, package);
        for spec in candidates {
            match self.fetch.info(&types_pkg_name, &spec).await {
                Ok(resolved) => {
                    let types_descriptor = BuildDescriptor::new(
                        Package { name: types_pkg_name.clone(), version: resolved.version.clone(), submodule: String::new() },
                        descriptor.build_version,
                        Target::Types,
                    );
                    let types_fp = fingerprint(&types_descriptor);
                    self.enqueue_fire_and_forget(types_descriptor).await;
                    return format!("/{types_fp}");
                }
                Err(err) if err.kind == ErrorKind::PackageNotFound => continue,
                Err(err) => {
                    warn!(target: "cdn.orchestrator", pkg = %types_pkg_name, error = %err, "checkDTS lookup failed");
                    break;
                }
            }
        }
        String::new()
    }

    /// Resolves one external specifier to a CDN URL per spec.md §4.8.B's
    /// eight-rule priority chain.
    async fn resolve_external(
        &self,
        specifier: &str,
        descriptor: &BuildDescriptor,
        manifest: &PackageManifest,
        root_package: &Package,
        work_dir: &Path,
    ) -> Result<ExternalInfo, CdnError> {
        // 1. Already a remote URL.
        if specifier.starts_with("http://") || specifier.starts_with("https://") || specifier.starts_with("node:") {
            return Ok(ExternalInfo { url: specifier.to_string(), meta: None });
        }

        // 2. Sibling submodule of the package being built.
        if let Some(submodule) = sibling_submodule(specifier, &root_package.name) {
            let mut sibling = descriptor.clone();
            sibling.package = Package { name: root_package.name.clone(), version: root_package.version.clone(), submodule };
            sibling.work_dir = Some(work_dir.to_string_lossy().into_owned());
            let sibling_fp = fingerprint(&sibling);

            let queue = self.queue.upgrade();
            let meta = match queue {
                Some(queue) => {
                    let consumer = queue.add(sibling, "sibling-submodule").await;
                    match consumer.wait().await {
                        Ok(result) => Some(result.meta),
                        Err(err) => {
                            warn!(target: "cdn.orchestrator", specifier, error = %err, "sibling submodule build failed");
                            None
                        }
                    }
                }
                None => None,
            };
            return Ok(ExternalInfo { url: format!("/{sibling_fp}"), meta });
        }

        // 3. `buffer` builtin.
        if specifier == "buffer" {
            let url = if descriptor.target == Target::Node {
                "node:buffer".to_string()
            } else {
                format!("/v{}/buffer", descriptor.build_version)
            };
            return Ok(ExternalInfo { url, meta: None });
        }

        // 4. `node-fetch` rewritten to a pinned native replacement.
        if specifier == "node-fetch" && descriptor.target != Target::Node {
            return Ok(ExternalInfo { url: format!("{}/node-fetch-native", self.config.cdn_origin.trim_end_matches('/')), meta: None });
        }

        // 5. Any other Node built-in, handled per target.
        if cdn_core::constants::is_built_in_node_module(specifier) {
            return Ok(ExternalInfo { url: self.builtin_url(specifier, descriptor), meta: None });
        }

        // 6. Pinned in the request's `deps` set.
        if let Some((pinned, submodule)) = pinned_for_specifier(&descriptor.deps, specifier) {
            let pin_pkg = Package { name: pinned.name.clone(), version: pinned.version.clone(), submodule };
            return self.schedule_and_reference(pin_pkg, descriptor).await;
        }

        // 7. `react-dom` importing `react`: pin to the root package's version.
        if root_package.name == "react-dom" && specifier == "react" {
            let pin_pkg = Package { name: "react".to_string(), version: root_package.version.clone(), submodule: String::new() };
            return self.schedule_and_reference(pin_pkg, descriptor).await;
        }

        // 8. Fallback: manifest dependency, then peer dependency, else latest.
        let version_spec = manifest
            .dependencies
            .get(specifier)
            .or_else(|| manifest.peer_dependencies.get(specifier))
            .cloned()
            .unwrap_or_else(|| "latest".to_string());
        let resolved = self.resolver.resolve(specifier, &version_spec).await?;
        let pkg = Package { name: specifier.to_string(), version: resolved.version, submodule: String::new() };
        self.schedule_and_reference(pkg, descriptor).await
    }

    fn builtin_url(&self, specifier: &str, descriptor: &BuildDescriptor) -> String {
        cdn_core::constants::built_in_module_url(descriptor.target, descriptor.build_version, &self.config.deno_std_version, specifier)
    }

    /// Schedules a sub-build for `pkg` (if not already built) and returns a
    /// reference to its eventual artifact URL. Non-blocking: the caller's
    /// bundle output references the URL immediately, the sub-build runs in
    /// the background.
    async fn schedule_and_reference(&self, pkg: Package, descriptor: &BuildDescriptor) -> Result<ExternalInfo, CdnError> {
        let sub_descriptor = BuildDescriptor::new(pkg, descriptor.build_version, descriptor.target);
        let sub_fp = fingerprint(&sub_descriptor);

        let artifact_path = sub_fp.clone();
        let already = cdn_store::already_built(self.fs.as_ref(), self.meta_store.as_ref(), &sub_fp, &artifact_path).await?;
        let meta = if already { self.meta_store.get(&sub_fp).await.ok() } else { None };
        if !already {
            self.enqueue_fire_and_forget(sub_descriptor).await;
        }
        Ok(ExternalInfo { url: format!("/{sub_fp}"), meta })
    }

    async fn enqueue_fire_and_forget(&self, descriptor: BuildDescriptor) {
        if let Some(queue) = self.queue.upgrade() {
            let _ = queue.add(descriptor, "").await;
        }
    }
}

#[async_trait]
impl<B: Bundler + Send + Sync + 'static> BuildExecutor<BuildResult> for BuildTask<B> {
    async fn execute(&self, descriptor: &BuildDescriptor) -> Result<BuildResult, CdnError> {
        self.run(descriptor).await
    }
}

/// Constructs a [`BuildTask`]-backed [`BuildQueue`], resolving the
/// queue/task ownership cycle via `Arc::new_cyclic`.
#[must_use]
pub fn spawn<B: Bundler + Send + Sync + 'static>(
    fetch: Arc<dyn PkgFetch>,
    installer: Installer,
    bundler_driver: BundlerDriver<B>,
    fs: Arc<dyn FsStore>,
    meta_store: Arc<dyn MetaStore>,
    config: BuildServiceConfig,
) -> Arc<BuildQueue<BuildResult, BuildTask<B>>> {
    let concurrency = config.worker_concurrency;
    Arc::new_cyclic(|weak: &Weak<BuildQueue<BuildResult, BuildTask<B>>>| {
        let task = BuildTask::new(fetch, installer, bundler_driver, fs, meta_store, config, weak.clone());
        BuildQueue::new(task, concurrency)
    })
}

/// Builds the in-memory "synthesize entry" source the bundler driver
/// compiles against when the real entry has no default export: import the
/// package twice (default, namespace), re-export every statically-known
/// named export, and fall back to the namespace minus `default`.
///
/// Written to `<work_dir>/.cdn-synth-entry.mjs` so the bundler (which only
/// accepts a filesystem entry point) can read it like any other source
/// file.
fn synthesize_reexport_source(work_dir: &Path, entry_import_path: &str, known_exports: &[String]) -> (String, String) {
    let mut source = String::new();
    source.push_str(&format!("import __cdn_default__ from \"{entry_import_path}\";\n"));
    source.push_str(&format!("import * as __cdn_ns__ from \"{entry_import_path}\";\n"));
    source.push_str("export default __cdn_default__;\n");
    if known_exports.is_empty() {
        source.push_str(&format!("export * from \"{entry_import_path}\";\n"));
    } else {
        source.push_str(&format!("export const {{ {} }} = __cdn_ns__;\n", known_exports.join(", ")));
    }
    let path = work_dir.join(".cdn-synth-entry.mjs");
    (path.to_string_lossy().into_owned(), source)
}

fn css_artifact_path(artifact_path: &str) -> String {
    match artifact_path.strip_suffix(".js") {
        Some(stem) => format!("{stem}.css"),
        None => format!("{artifact_path}.css"),
    }
}

/// `true`-returning variant: if `specifier` names a path under the root
/// package's own name (e.g. root is `my-pkg`, specifier is
/// `my-pkg/helpers`), returns the submodule path.
fn sibling_submodule(specifier: &str, root_name: &str) -> Option<String> {
    let rest = specifier.strip_prefix(root_name)?;
    let rest = rest.strip_prefix('/')?;
    if rest.is_empty() {
        None
    } else {
        Some(rest.to_string())
    }
}

/// Looks up `specifier` against the request's pinned `deps`, matching
/// either the exact specifier or a package-name prefix with a submodule
/// remainder (e.g. deps pins `lodash`, specifier is `lodash/debounce`).
fn pinned_for_specifier<'a>(deps: &'a DepsSet, specifier: &str) -> Option<(&'a Package, String)> {
    if let Some(pkg) = deps.get(specifier) {
        return Some((pkg, String::new()));
    }
    let segments: Vec<&str> = specifier.split('/').collect();
    for split_at in (1..segments.len()).rev() {
        let candidate = segments[..split_at].join("/");
        if let Some(pkg) = deps.get(&candidate) {
            return Some((pkg, segments[split_at..].join("/")));
        }
    }
    None
}

fn strip_scope(name: &str) -> String {
    name.rsplit('/').next().unwrap_or(name).to_string()
}

/// `(deps-pinned version, ~minor, ^major, latest)`, skipping any spec that
/// would be empty or meaningless.
fn dts_version_candidates(descriptor: &BuildDescriptor, package: &Package) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(pinned) = descriptor.deps.get(&package.name) {
        out.push(pinned.version.clone());
    }
    let mut parts = package.version.splitn(3, '.');
    if let (Some(major), Some(minor)) = (parts.next(), parts.next()) {
        out.push(format!("~{major}.{minor}"));
        out.push(format!("^{major}"));
    }
    out.push("latest".to_string());
    out
}
