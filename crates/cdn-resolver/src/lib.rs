// SPDX-License-Identifier: MIT OR Apache-2.0
//! Classifies bundler import specifiers as internal (bundled in) or
//! external (rewritten to a CDN URL later), per the `ResolverPlugin`
//! contract.
//!
//! The decision order (data URI, `node:` stripping, alias, bundle-mode
//! policy, `exports`-map sub-path resolution, self-reference, local-import
//! handling, `noRequire` passthrough, default external) is expressed as the
//! pure function [`classify`] so it is testable without an actual bundler
//! process.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use cdn_core::Package;

/// The way the bundler encountered an import specifier, mirroring
/// esbuild's `ResolveKind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportKind {
    /// A static `import ... from "specifier"` or `export ... from`.
    Import,
    /// A dynamic `import("specifier")`.
    DynamicImport,
    /// A CommonJS `require("specifier")` call.
    Require,
    /// A CommonJS `require.resolve("specifier")` call.
    RequireResolve,
}

impl ImportKind {
    fn is_require_like(self) -> bool {
        matches!(self, ImportKind::Require | ImportKind::RequireResolve)
    }
}

/// The resolver's verdict for one specifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Let the bundler inline this import normally.
    Internal,
    /// Exclude this import from the bundle.
    External {
        /// The path string the bundler should emit in place of the original
        /// specifier (sentinel-wrapped, unless `sentinel` is `false`).
        emit_path: String,
        /// The specifier as the rewriter will see it post-normalization —
        /// the key recorded in the task's `externals` set.
        specifier: String,
        /// `false` for `data:` URIs and `noRequire` passthrough, which are
        /// external but never sentinel-wrapped nor recorded in `externals`.
        sentinel: bool,
    },
}

/// Read-only context a single build task's resolver needs. Borrowed for the
/// lifetime of one `classify` call; the mutable `force_external` growth
/// from the bundler driver's retry loop is threaded in separately so this
/// function stays pure.
pub struct ResolveCtx<'a> {
    /// The package this build task is producing.
    pub pkg: &'a Package,
    /// Request-specifier to replacement-specifier substitutions.
    pub alias: &'a BTreeMap<String, String>,
    /// Whether non-peer, non-builtin dependencies should be inlined.
    pub bundle_mode: bool,
    /// Whether a `require()` of an ESM dependency should pass through
    /// unresolved rather than bundling or externalizing normally.
    pub no_require: bool,
    /// Names of the package's declared peer dependencies.
    pub peer_dependencies: &'a BTreeSet<String>,
    /// The package's raw `exports` map, if declared.
    pub defined_exports: Option<&'a serde_json::Value>,
    /// `<work_dir>/node_modules`, the root relative imports are resolved
    /// against.
    pub node_modules_dir: &'a Path,
    /// Absolute path to the synthesized or declared entry file, used for
    /// the self-reference check when a library re-imports its own entry by
    /// relative path.
    pub entry_point: Option<&'a str>,
}

/// Classify `raw_specifier`, imported by `importer` (an absolute path
/// within the installed package tree) as `kind`.
///
/// `force_external` is the set grown by [`cdn_bundler`]'s retry loop
/// (unresolved-specifier recovery); entries in it always externalize,
/// overriding the bundle-mode "bundle everything" policy.
#[must_use]
pub fn classify(ctx: &ResolveCtx<'_>, raw_specifier: &str, importer: &str, kind: ImportKind, force_external: &BTreeSet<String>) -> Resolution {
    // 1. data: URIs pass through untouched and unrecorded.
    if raw_specifier.starts_with("data:") {
        return Resolution::External { emit_path: raw_specifier.to_string(), specifier: raw_specifier.to_string(), sentinel: false };
    }

    // 2. Strip a trailing slash, then a `node:` prefix.
    let specifier = raw_specifier.trim_end_matches('/');
    let specifier = specifier.strip_prefix("node:").unwrap_or(specifier);

    // 3. `?alias` substitution.
    let specifier = ctx.alias.get(specifier).map(String::as_str).unwrap_or(specifier).to_string();

    // 4. Bundle-mode policy: bundle everything except builtins and peer deps,
    // unless the retry loop has already forced this specifier external.
    if ctx.bundle_mode && !force_external.contains(&specifier) {
        let pkg_name = bundle_pkg_name(&specifier);
        if !cdn_core::constants::is_built_in_node_module(pkg_name) && !ctx.peer_dependencies.contains(pkg_name) {
            return Resolution::Internal;
        }
    }

    // 5. Sub-path resolution against the package's `exports` map.
    if is_relative_specifier(&specifier) {
        if let Some(exports) = ctx.defined_exports {
            let module_path = resolve_module_path(ctx.node_modules_dir, ctx.pkg, importer, &specifier);
            if let Some(matched_export) = match_export(exports, &module_path) {
                let url = join_import_path(&ctx.pkg.name, &matched_export);
                if url == ctx.pkg.import_path() {
                    return Resolution::Internal;
                }
                return Resolution::External { emit_path: sentinel(&url), specifier: url.clone(), sentinel: true };
            }
        }
    }

    // 6. Self-reference: bundle the entry module and its own import path.
    if specifier == ctx.pkg.import_path() || ctx.entry_point == Some(specifier.as_str()) {
        return Resolution::Internal;
    }

    // 7. Other local imports.
    if is_local_import(&specifier) {
        if ctx.pkg.submodule.is_empty() {
            return Resolution::Internal;
        }
        if ctx.defined_exports.is_some() {
            return Resolution::Internal;
        }
        let package_relative = local_specifier_relative_to_node_modules(ctx.node_modules_dir, importer, &specifier);
        return Resolution::External { emit_path: sentinel(&package_relative), specifier: package_relative, sentinel: true };
    }

    // 8. `require()` of an ESM package when `noRequire` is set: pass through.
    if ctx.no_require && kind.is_require_like() {
        return Resolution::External { emit_path: specifier.clone(), specifier, sentinel: false };
    }

    // 9. Default: external, sentinel-wrapped.
    Resolution::External { emit_path: sentinel(&specifier), specifier: specifier.clone(), sentinel: true }
}

/// Stateful wrapper around [`classify`] for one build task: accumulates the
/// `externals` set the rewriter will later consume, and exposes
/// `force_external` for the bundler driver's retry loop to grow.
pub struct ResolverPlugin<'a> {
    ctx: ResolveCtx<'a>,
    externals: cdn_core::ExternalRef,
    force_external: BTreeSet<String>,
}

impl<'a> ResolverPlugin<'a> {
    /// Construct a plugin for one build task.
    #[must_use]
    pub fn new(ctx: ResolveCtx<'a>) -> Self {
        Self { ctx, externals: cdn_core::ExternalRef::new(), force_external: BTreeSet::new() }
    }

    /// Resolve one specifier, recording it in `externals` if the verdict
    /// is external-and-sentineled.
    pub fn on_resolve(&mut self, raw_specifier: &str, importer: &str, kind: ImportKind) -> Resolution {
        let resolution = classify(&self.ctx, raw_specifier, importer, kind, &self.force_external);
        if let Resolution::External { specifier, sentinel, .. } = &resolution {
            if *sentinel {
                self.externals.insert(specifier.clone());
            }
        }
        resolution
    }

    /// Force `specifier` external on every subsequent call, regardless of
    /// bundle-mode policy. Called by the bundler driver's unresolved-import
    /// retry loop (spec §4.7).
    pub fn force_external(&mut self, specifier: impl Into<String>) {
        self.force_external.insert(specifier.into());
    }

    /// The externals accumulated so far.
    #[must_use]
    pub fn externals(&self) -> &cdn_core::ExternalRef {
        &self.externals
    }
}

/// `true` for specifiers esbuild treats as filesystem-relative: `./x`,
/// `../x`, or the bare `..`.
fn is_relative_specifier(s: &str) -> bool {
    s.starts_with("./") || s.starts_with("../") || s == ".."
}

/// `true` for specifiers that name a local module rather than a package:
/// relative paths or absolute filesystem paths.
fn is_local_import(s: &str) -> bool {
    s.starts_with('.') || s.starts_with('/')
}

/// The bare package name a bundle-mode specifier belongs to (handles a
/// leading `@scope/`).
fn bundle_pkg_name(specifier: &str) -> &str {
    let mut parts = specifier.splitn(3, '/');
    let first = parts.next().unwrap_or(specifier);
    if specifier.starts_with('@') {
        match parts.next() {
            Some(_) => {
                let end = first.len() + 1 + specifier[first.len() + 1..].find('/').map_or(specifier.len() - first.len() - 1, |i| i);
                &specifier[..end.min(specifier.len())]
            }
            None => specifier,
        }
    } else {
        first
    }
}

/// Resolves `specifier` (relative to `importer`) into the `./`-prefixed
/// path within the package root that the `exports` map keys against,
/// normalizing the macOS `/private/var` alias.
fn resolve_module_path(node_modules_dir: &Path, pkg: &Package, importer: &str, specifier: &str) -> String {
    let importer_dir = Path::new(importer).parent().unwrap_or_else(|| Path::new(""));
    let resolved = normalize_join(importer_dir, specifier);
    let resolved = strip_private_var(&resolved);
    let package_root = node_modules_dir.join(&pkg.name);
    let package_root = strip_private_var(&package_root.to_string_lossy());
    match resolved.strip_prefix(package_root.as_str()) {
        Some(rest) => format!(".{rest}"),
        None => format!("./{resolved}"),
    }
}

/// Resolves `specifier` (relative to `importer`) into a package-relative
/// specifier by stripping the `node_modules/` prefix.
fn local_specifier_relative_to_node_modules(node_modules_dir: &Path, importer: &str, specifier: &str) -> String {
    let importer_dir = Path::new(importer).parent().unwrap_or_else(|| Path::new(""));
    let resolved = normalize_join(importer_dir, specifier);
    let resolved = strip_private_var(&resolved);
    let prefix = strip_private_var(&format!("{}/", node_modules_dir.to_string_lossy()));
    resolved.strip_prefix(prefix.as_str()).unwrap_or(&resolved).to_string()
}

fn normalize_join(dir: &Path, specifier: &str) -> String {
    let joined = dir.join(specifier);
    let mut out: Vec<&std::ffi::OsStr> = Vec::new();
    for component in joined.components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::Normal(part) => out.push(part),
            std::path::Component::RootDir => {}
            std::path::Component::Prefix(_) => {}
        }
    }
    let mut s = String::from("/");
    s.push_str(&out.iter().map(|p| p.to_string_lossy()).collect::<Vec<_>>().join("/"));
    s
}

fn strip_private_var(path: &str) -> String {
    path.strip_prefix("/private/var/").map(|rest| format!("/var/{rest}")).unwrap_or_else(|| path.to_string())
}

fn join_import_path(pkg_name: &str, export_key: &str) -> String {
    let trimmed = export_key.trim_start_matches("./");
    if trimmed.is_empty() || trimmed == "." {
        pkg_name.to_string()
    } else {
        format!("{pkg_name}/{trimmed}")
    }
}

fn sentinel(specifier: &str) -> String {
    format!("{}{}", cdn_core::constants::EXTERNAL_SENTINEL_PREFIX, specifier)
}

/// Matches `module_path` against a package's `exports` map, supporting a
/// single `*` wildcard per condition value (prefix/suffix framing, with
/// the captured middle substituted into the export key). Trims the
/// wildcard suffix from the bare `module_path` even when the match was only
/// found via the `.js`/`.mjs`-appended variant.
#[must_use]
pub fn match_export(exports: &serde_json::Value, module_path: &str) -> Option<String> {
    let map = exports.as_object()?;
    for (export_key, conditions) in map {
        if export_key == "." {
            continue;
        }
        let Some(cond_map) = conditions.as_object() else { continue };
        for value in cond_map.values() {
            let Some(s) = value.as_str() else { continue };
            if s.is_empty() {
                continue;
            }
            if module_path == s || format!("{module_path}.js") == s || format!("{module_path}.mjs") == s {
                return Some(export_key.clone());
            }
            if let Some((prefix, suffix)) = s.split_once('*') {
                let suffix_matches = module_path.ends_with(suffix)
                    || format!("{module_path}.js").ends_with(suffix)
                    || format!("{module_path}.mjs").ends_with(suffix);
                if module_path.starts_with(prefix) && suffix_matches {
                    let without_prefix = module_path.strip_prefix(prefix).unwrap_or(module_path);
                    let captured = without_prefix.strip_suffix(suffix).unwrap_or(without_prefix);
                    return Some(export_key.replacen('*', captured, 1));
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pkg(name: &str, submodule: &str) -> Package {
        Package { name: name.to_string(), version: "1.0.0".to_string(), submodule: submodule.to_string() }
    }

    fn ctx<'a>(pkg: &'a Package, alias: &'a BTreeMap<String, String>, peers: &'a BTreeSet<String>, exports: Option<&'a serde_json::Value>, nm: &'a Path) -> ResolveCtx<'a> {
        ResolveCtx {
            pkg,
            alias,
            bundle_mode: false,
            no_require: false,
            peer_dependencies: peers,
            defined_exports: exports,
            node_modules_dir: nm,
            entry_point: None,
        }
    }

    #[test]
    fn data_uri_passes_through_unrecorded() {
        let pkg = pkg("lodash", "");
        let alias = BTreeMap::new();
        let peers = BTreeSet::new();
        let nm = PathBuf::from("/wd/node_modules");
        let c = ctx(&pkg, &alias, &peers, None, &nm);
        let forced = BTreeSet::new();
        let res = classify(&c, "data:text/plain;base64,aGk=", "/wd/node_modules/lodash/index.js", ImportKind::Import, &forced);
        assert!(matches!(res, Resolution::External { sentinel: false, .. }));
    }

    #[test]
    fn node_prefix_is_stripped_before_default_external() {
        let pkg = pkg("lodash", "");
        let alias = BTreeMap::new();
        let peers = BTreeSet::new();
        let nm = PathBuf::from("/wd/node_modules");
        let c = ctx(&pkg, &alias, &peers, None, &nm);
        let forced = BTreeSet::new();
        let res = classify(&c, "node:path", "/wd/node_modules/lodash/index.js", ImportKind::Import, &forced);
        match res {
            Resolution::External { specifier, sentinel, .. } => {
                assert_eq!(specifier, "path");
                assert!(sentinel);
            }
            Resolution::Internal => panic!("expected external"),
        }
    }

    #[test]
    fn alias_substitution_applies_before_classification() {
        let pkg = pkg("app", "");
        let mut alias = BTreeMap::new();
        alias.insert("react".to_string(), "preact/compat".to_string());
        let peers = BTreeSet::new();
        let nm = PathBuf::from("/wd/node_modules");
        let c = ctx(&pkg, &alias, &peers, None, &nm);
        let forced = BTreeSet::new();
        let res = classify(&c, "react", "/wd/node_modules/app/index.js", ImportKind::Import, &forced);
        match res {
            Resolution::External { specifier, .. } => assert_eq!(specifier, "preact/compat"),
            Resolution::Internal => panic!("expected external"),
        }
    }

    #[test]
    fn bundle_mode_inlines_non_peer_non_builtin_deps() {
        let pkg = pkg("app", "");
        let alias = BTreeMap::new();
        let peers = BTreeSet::new();
        let nm = PathBuf::from("/wd/node_modules");
        let mut c = ctx(&pkg, &alias, &peers, None, &nm);
        c.bundle_mode = true;
        let forced = BTreeSet::new();
        let res = classify(&c, "left-pad", "/wd/node_modules/app/index.js", ImportKind::Import, &forced);
        assert_eq!(res, Resolution::Internal);
    }

    #[test]
    fn bundle_mode_still_externalizes_peer_dependencies() {
        let pkg = pkg("app", "");
        let alias = BTreeMap::new();
        let mut peers = BTreeSet::new();
        peers.insert("react".to_string());
        let nm = PathBuf::from("/wd/node_modules");
        let mut c = ctx(&pkg, &alias, &peers, None, &nm);
        c.bundle_mode = true;
        let forced = BTreeSet::new();
        let res = classify(&c, "react", "/wd/node_modules/app/index.js", ImportKind::Import, &forced);
        assert!(matches!(res, Resolution::External { .. }));
    }

    #[test]
    fn bundle_mode_still_externalizes_builtins() {
        let pkg = pkg("app", "");
        let alias = BTreeMap::new();
        let peers = BTreeSet::new();
        let nm = PathBuf::from("/wd/node_modules");
        let mut c = ctx(&pkg, &alias, &peers, None, &nm);
        c.bundle_mode = true;
        let forced = BTreeSet::new();
        let res = classify(&c, "fs", "/wd/node_modules/app/index.js", ImportKind::Import, &forced);
        assert!(matches!(res, Resolution::External { .. }));
    }

    #[test]
    fn force_external_overrides_bundle_mode() {
        let pkg = pkg("app", "");
        let alias = BTreeMap::new();
        let peers = BTreeSet::new();
        let nm = PathBuf::from("/wd/node_modules");
        let mut c = ctx(&pkg, &alias, &peers, None, &nm);
        c.bundle_mode = true;
        let mut forced = BTreeSet::new();
        forced.insert("left-pad".to_string());
        let res = classify(&c, "left-pad", "/wd/node_modules/app/index.js", ImportKind::Import, &forced);
        assert!(matches!(res, Resolution::External { .. }));
    }

    #[test]
    fn self_import_path_stays_internal() {
        let pkg = pkg("lodash", "");
        let alias = BTreeMap::new();
        let peers = BTreeSet::new();
        let nm = PathBuf::from("/wd/node_modules");
        let c = ctx(&pkg, &alias, &peers, None, &nm);
        let forced = BTreeSet::new();
        let res = classify(&c, "lodash", "/wd/node_modules/lodash/index.js", ImportKind::Import, &forced);
        assert_eq!(res, Resolution::Internal);
    }

    #[test]
    fn local_import_of_package_root_entry_bundles() {
        let pkg = pkg("lodash", "");
        let alias = BTreeMap::new();
        let peers = BTreeSet::new();
        let nm = PathBuf::from("/wd/node_modules");
        let c = ctx(&pkg, &alias, &peers, None, &nm);
        let forced = BTreeSet::new();
        let res = classify(&c, "./clone", "/wd/node_modules/lodash/index.js", ImportKind::Import, &forced);
        assert_eq!(res, Resolution::Internal);
    }

    #[test]
    fn local_import_of_submodule_without_exports_externalizes() {
        let pkg = pkg("lodash", "debounce");
        let alias = BTreeMap::new();
        let peers = BTreeSet::new();
        let nm = PathBuf::from("/wd/node_modules");
        let c = ctx(&pkg, &alias, &peers, None, &nm);
        let forced = BTreeSet::new();
        let res = classify(&c, "./_baseDebounce", "/wd/node_modules/lodash/debounce.js", ImportKind::Import, &forced);
        match res {
            Resolution::External { specifier, sentinel, .. } => {
                assert_eq!(specifier, "lodash/_baseDebounce");
                assert!(sentinel);
            }
            Resolution::Internal => panic!("expected external"),
        }
    }

    #[test]
    fn local_import_of_submodule_with_exports_map_bundles() {
        let pkg = pkg("pkg", "sub");
        let alias = BTreeMap::new();
        let peers = BTreeSet::new();
        let nm = PathBuf::from("/wd/node_modules");
        let exports = json!({".": {"import": "./index.js"}});
        let c = ctx(&pkg, &alias, &peers, Some(&exports), &nm);
        let forced = BTreeSet::new();
        let res = classify(&c, "./helper", "/wd/node_modules/pkg/sub.js", ImportKind::Import, &forced);
        assert_eq!(res, Resolution::Internal);
    }

    #[test]
    fn no_require_passes_through_require_calls() {
        let pkg = pkg("app", "");
        let alias = BTreeMap::new();
        let peers = BTreeSet::new();
        let nm = PathBuf::from("/wd/node_modules");
        let mut c = ctx(&pkg, &alias, &peers, None, &nm);
        c.no_require = true;
        let forced = BTreeSet::new();
        let res = classify(&c, "some-esm-pkg", "/wd/node_modules/app/index.js", ImportKind::Require, &forced);
        match res {
            Resolution::External { emit_path, specifier, sentinel } => {
                assert_eq!(emit_path, "some-esm-pkg");
                assert_eq!(specifier, "some-esm-pkg");
                assert!(!sentinel);
            }
            Resolution::Internal => panic!("expected external"),
        }
    }

    #[test]
    fn default_rule_externalizes_with_sentinel() {
        let pkg = pkg("app", "");
        let alias = BTreeMap::new();
        let peers = BTreeSet::new();
        let nm = PathBuf::from("/wd/node_modules");
        let c = ctx(&pkg, &alias, &peers, None, &nm);
        let forced = BTreeSet::new();
        let res = classify(&c, "react", "/wd/node_modules/app/index.js", ImportKind::Import, &forced);
        match res {
            Resolution::External { emit_path, specifier, sentinel } => {
                assert_eq!(specifier, "react");
                assert!(sentinel);
                assert!(emit_path.starts_with(cdn_core::constants::EXTERNAL_SENTINEL_PREFIX));
            }
            Resolution::Internal => panic!("expected external"),
        }
    }

    #[test]
    fn wildcard_export_match_substitutes_captured_middle() {
        let exports = json!({
            "./*": { "import": "./esm/*.js" }
        });
        let matched = match_export(&exports, "./esm/foo").unwrap();
        assert_eq!(matched, "./foo");
    }

    #[test]
    fn exact_export_match_wins_without_wildcard() {
        let exports = json!({
            "./button": { "import": "./esm/button.js" }
        });
        let matched = match_export(&exports, "./esm/button").unwrap();
        assert_eq!(matched, "./button");
    }

    #[test]
    fn exports_plugin_resolves_relative_submodule_through_wildcard() {
        let pkg = pkg("pkg", "");
        let alias = BTreeMap::new();
        let peers = BTreeSet::new();
        let nm = PathBuf::from("/wd/node_modules");
        let exports = json!({ "./*": { "import": "./esm/*.js" } });
        let c = ctx(&pkg, &alias, &peers, Some(&exports), &nm);
        let mut plugin = ResolverPlugin::new(c);
        let res = plugin.on_resolve("./button", "/wd/node_modules/pkg/esm/index.js", ImportKind::Import);
        match res {
            Resolution::External { specifier, .. } => assert_eq!(specifier, "pkg/button"),
            Resolution::Internal => panic!("expected external"),
        }
        assert!(plugin.externals().contains("pkg/button"));
    }
}
