// SPDX-License-Identifier: MIT OR Apache-2.0
//! The bundler collaborator abstraction and the retry loop that drives it.
//!
//! A single esbuild invocation rarely succeeds on the first try once
//! `force_external` (grown by the resolver plugin across retries, not the
//! bundler itself) is in play — esbuild reports unresolved imports and
//! missing default exports as build errors rather than exposing a
//! recoverable API, so the driver here re-runs the whole bundle with
//! adjusted inputs until it either succeeds or a genuinely fatal error
//! surfaces.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use cdn_core::Target;
use cdn_error::{CdnError, ErrorKind};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

mod reference;
pub use reference::SimpleJsBundler;

/// Upper bound on bundle attempts per build task, guarding against a
/// resolver/bundler disagreement looping forever.
pub const MAX_BUNDLE_ATTEMPTS: u32 = 8;

/// One file esbuild produced, keyed by its logical role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFile {
    /// Path relative to the esbuild outdir, e.g. `index.js` or `index.css`.
    pub path: String,
    /// Raw bytes.
    pub contents: Vec<u8>,
}

/// Inputs for one bundle invocation.
#[derive(Debug, Clone)]
pub struct BundleOptions {
    /// Absolute path to the entry file esbuild should start from.
    pub entry_point: String,
    /// Absolute path esbuild should treat as its working directory (used to
    /// resolve `node_modules`).
    pub working_dir: String,
    /// Output target informing esbuild's `Target`/`Platform` settings.
    pub target: Target,
    /// Specifiers the resolver plugin should treat as external on this
    /// attempt (seeded from `ResolverPlugin`'s classification, grown by the
    /// retry loop below).
    pub external: BTreeSet<String>,
    /// `true` to also emit a minified variant at `index.min.mjs` — unused
    /// by the driver's retry logic, consulted by the orchestrator only
    /// after a successful bundle.
    pub minify: bool,
    /// Global identifier replacements, e.g. `process.env.NODE_ENV` under a
    /// `development`/`production` flag. Skipped entirely for `Target::Node`.
    pub define: BTreeMap<String, String>,
}

/// The outcome of one successful bundle.
#[derive(Debug, Clone)]
pub struct BundleOutput {
    /// Every file esbuild wrote, including source maps if requested.
    pub files: Vec<OutputFile>,
}

/// A structured esbuild failure, distinguishing the two recoverable shapes
/// the retry loop understands from everything else (fatal).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleErrorKind {
    /// `Could not resolve "<specifier>"` — the named specifier should be
    /// added to `external` and the bundle retried, unless it is the entry
    /// point itself (which makes the whole build unrecoverable).
    CouldNotResolve {
        /// The specifier esbuild could not resolve.
        specifier: String,
    },
    /// `No matching export in "<file>" for import "default"` — the entry
    /// has no default export; the driver should synthesize a `mod.js`
    /// stand-in entry re-exporting `* as mod` and retry once.
    NoMatchingDefaultExport,
    /// Any other esbuild diagnostic. Not recoverable.
    Fatal(String),
}

/// The out-of-scope external bundler process collaborator (esbuild, in
/// particular). One invocation per attempt; the driver owns the retry state
/// machine, not this trait.
///
/// `resolver` is the live `OnResolve` hook for this attempt: a concrete
/// implementation calls [`cdn_resolver::ResolverPlugin::on_resolve`] for
/// every import specifier it encounters while traversing the module graph,
/// exactly as esbuild's plugin API would invoke a registered resolver
/// callback. The driver owns growing `resolver`'s `force_external` state
/// between attempts; the accumulated `externals()` set is what the
/// orchestrator hands to `cdn-rewrite` once a bundle finally succeeds.
#[async_trait]
pub trait Bundler: Send + Sync {
    /// Run one bundle attempt with the given options.
    async fn bundle(&self, options: &BundleOptions, resolver: &mut cdn_resolver::ResolverPlugin<'_>) -> Result<BundleOutput, BundleErrorKind>;
}

/// Drives [`Bundler::bundle`] through esbuild's two recoverable failure
/// modes.
pub struct BundlerDriver<B> {
    bundler: B,
}

impl<B: Bundler> BundlerDriver<B> {
    /// Wrap a bundler collaborator.
    #[must_use]
    pub fn new(bundler: B) -> Self {
        Self { bundler }
    }

    /// Run `options.entry_point` through the bundler, retrying per the
    /// state machine described on [`BundleErrorKind`].
    ///
    /// `entry_point_specifier` is the bare specifier (e.g. `my-pkg`) the
    /// entry point names, so a `CouldNotResolve` on it can be recognized as
    /// fatal rather than grown into `external`.
    ///
    /// # Errors
    ///
    /// Returns `UnresolvedExternal` if the retry budget is exhausted, or
    /// `BuildFailed` for any fatal esbuild diagnostic.
    pub async fn run(
        &self,
        mut options: BundleOptions,
        entry_point_specifier: &str,
        resolver: &mut cdn_resolver::ResolverPlugin<'_>,
        synthesize_reexport_entry: impl Fn() -> (String, String),
    ) -> Result<BundleOutput, CdnError> {
        let mut synthesized_once = false;

        for attempt in 1..=MAX_BUNDLE_ATTEMPTS {
            debug!(target: "cdn.bundler", attempt, external = options.external.len(), "running bundle attempt");
            match self.bundler.bundle(&options, resolver).await {
                Ok(output) => return Ok(output),
                Err(BundleErrorKind::CouldNotResolve { specifier }) => {
                    if specifier == entry_point_specifier || specifier == options.entry_point {
                        return Err(CdnError::new(ErrorKind::BuildFailed, "bundle", format!("entry point itself unresolvable: {specifier}")));
                    }
                    if !options.external.insert(specifier.clone()) {
                        return Err(CdnError::new(
                            ErrorKind::UnresolvedExternal,
                            "bundle",
                            format!("esbuild repeatedly failed to resolve {specifier} even after externalizing it"),
                        ));
                    }
                    resolver.force_external(specifier.clone());
                    warn!(target: "cdn.bundler", attempt, specifier, "externalizing unresolved import and retrying");
                }
                Err(BundleErrorKind::NoMatchingDefaultExport) => {
                    if synthesized_once {
                        return Err(CdnError::new(ErrorKind::BuildFailed, "bundle", "no default export even from synthesized re-export entry"));
                    }
                    let (new_entry, stdin_contents) = synthesize_reexport_entry();
                    debug!(target: "cdn.bundler", attempt, new_entry, "synthesizing default re-export entry and retrying");
                    tokio::fs::write(&new_entry, stdin_contents)
                        .await
                        .map_err(|e| CdnError::new(ErrorKind::Fatal, "bundle", format!("failed to write synthesized entry {new_entry}: {e}")))?;
                    options.entry_point = new_entry;
                    synthesized_once = true;
                }
                Err(BundleErrorKind::Fatal(message)) => {
                    return Err(CdnError::new(ErrorKind::BuildFailed, "bundle", message));
                }
            }
        }

        Err(CdnError::new(ErrorKind::UnresolvedExternal, "bundle", format!("exhausted {MAX_BUNDLE_ATTEMPTS} bundle attempts")))
    }
}

/// Builds the `define` table for esbuild's global-identifier replacement,
/// skipped entirely for [`Target::Node`] (Node's own globals are left
/// untouched there). Covers every identifier spec §4.7 lists: the six
/// runtime globals in [`cdn_core::constants::GLOBAL_DEFINE_SHIMS`] become
/// their `__Name$`-style placeholders (cdn-rewrite's job is to recognize
/// those placeholders and inject the matching shim import), while
/// `process.env.NODE_ENV`, `__filename`, and `__dirname` are replaced with
/// literal values since nothing downstream needs to import anything for
/// them.
#[must_use]
pub fn build_define_table(target: Target, development: bool, entry_point: &str) -> BTreeMap<String, String> {
    if target == Target::Node {
        return BTreeMap::new();
    }
    let mode = if development { "development" } else { "production" };
    let mut define = BTreeMap::new();
    define.insert("process.env.NODE_ENV".to_string(), format!("\"{mode}\""));
    for (identifier, placeholder, _module) in cdn_core::constants::GLOBAL_DEFINE_SHIMS {
        define.insert((*identifier).to_string(), (*placeholder).to_string());
    }
    let dirname = std::path::Path::new(entry_point).parent().map(|p| p.to_string_lossy().into_owned()).unwrap_or_default();
    define.insert("__filename".to_string(), format!("{entry_point:?}"));
    define.insert("__dirname".to_string(), format!("{dirname:?}"));
    define
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdn_core::Package;
    use cdn_resolver::{ResolveCtx, ResolverPlugin};
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct ScriptedBundler {
        responses: Mutex<Vec<Result<BundleOutput, BundleErrorKind>>>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Bundler for ScriptedBundler {
        async fn bundle(&self, _options: &BundleOptions, _resolver: &mut ResolverPlugin<'_>) -> Result<BundleOutput, BundleErrorKind> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                panic!("bundler called more times than scripted");
            }
            responses.remove(0)
        }
    }

    fn options() -> BundleOptions {
        BundleOptions {
            entry_point: "/wd/node_modules/pkg/index.js".to_string(),
            working_dir: "/wd".to_string(),
            target: Target::Es2022,
            external: BTreeSet::new(),
            minify: false,
            define: BTreeMap::new(),
        }
    }

    fn output() -> BundleOutput {
        BundleOutput { files: vec![OutputFile { path: "index.js".to_string(), contents: b"export {}".to_vec() }] }
    }

    fn test_pkg() -> Package {
        Package { name: "pkg".to_string(), version: "1.0.0".to_string(), submodule: String::new() }
    }

    macro_rules! resolver_plugin {
        ($name:ident, $pkg:expr) => {
            let alias = BTreeMap::new();
            let peers = BTreeSet::new();
            let node_modules = Path::new("/wd/node_modules");
            let mut $name = ResolverPlugin::new(ResolveCtx {
                pkg: &$pkg,
                alias: &alias,
                bundle_mode: false,
                no_require: false,
                peer_dependencies: &peers,
                defined_exports: None,
                node_modules_dir: node_modules,
                entry_point: None,
            });
        };
    }

    #[tokio::test]
    async fn succeeds_immediately_when_bundler_succeeds() {
        let bundler = ScriptedBundler { responses: Mutex::new(vec![Ok(output())]), calls: AtomicU32::new(0) };
        let driver = BundlerDriver::new(bundler);
        let pkg = test_pkg();
        resolver_plugin!(resolver, pkg);
        let result = driver.run(options(), "pkg", &mut resolver, || unreachable!()).await.unwrap();
        assert_eq!(result.files.len(), 1);
    }

    #[tokio::test]
    async fn grows_external_set_and_retries_on_could_not_resolve() {
        let bundler = ScriptedBundler {
            responses: Mutex::new(vec![
                Err(BundleErrorKind::CouldNotResolve { specifier: "left-pad".to_string() }),
                Ok(output()),
            ]),
            calls: AtomicU32::new(0),
        };
        let driver = BundlerDriver::new(bundler);
        let pkg = test_pkg();
        resolver_plugin!(resolver, pkg);
        let result = driver.run(options(), "pkg", &mut resolver, || unreachable!()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn entry_point_itself_unresolvable_is_fatal() {
        let bundler = ScriptedBundler {
            responses: Mutex::new(vec![Err(BundleErrorKind::CouldNotResolve { specifier: "pkg".to_string() })]),
            calls: AtomicU32::new(0),
        };
        let driver = BundlerDriver::new(bundler);
        let pkg = test_pkg();
        resolver_plugin!(resolver, pkg);
        let err = driver.run(options(), "pkg", &mut resolver, || unreachable!()).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn repeated_unresolved_after_externalizing_gives_up() {
        let bundler = ScriptedBundler {
            responses: Mutex::new(vec![
                Err(BundleErrorKind::CouldNotResolve { specifier: "left-pad".to_string() }),
                Err(BundleErrorKind::CouldNotResolve { specifier: "left-pad".to_string() }),
            ]),
            calls: AtomicU32::new(0),
        };
        let driver = BundlerDriver::new(bundler);
        let pkg = test_pkg();
        resolver_plugin!(resolver, pkg);
        let err = driver.run(options(), "pkg", &mut resolver, || unreachable!()).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn synthesizes_reexport_entry_once_on_missing_default() {
        let dir = tempfile::TempDir::new().unwrap();
        let synth_path = dir.path().join("mod.js").to_string_lossy().into_owned();
        let bundler = ScriptedBundler {
            responses: Mutex::new(vec![Err(BundleErrorKind::NoMatchingDefaultExport), Ok(output())]),
            calls: AtomicU32::new(0),
        };
        let driver = BundlerDriver::new(bundler);
        let pkg = test_pkg();
        resolver_plugin!(resolver, pkg);
        let result = driver.run(options(), "pkg", &mut resolver, || (synth_path.clone(), "export * as mod from \"pkg\";".to_string())).await;
        assert!(result.is_ok());
        assert_eq!(std::fs::read_to_string(&synth_path).unwrap(), "export * as mod from \"pkg\";");
    }

    #[tokio::test]
    async fn does_not_synthesize_twice() {
        let dir = tempfile::TempDir::new().unwrap();
        let synth_path = dir.path().join("mod.js").to_string_lossy().into_owned();
        let bundler = ScriptedBundler {
            responses: Mutex::new(vec![Err(BundleErrorKind::NoMatchingDefaultExport), Err(BundleErrorKind::NoMatchingDefaultExport)]),
            calls: AtomicU32::new(0),
        };
        let driver = BundlerDriver::new(bundler);
        let pkg = test_pkg();
        resolver_plugin!(resolver, pkg);
        let err = driver
            .run(options(), "pkg", &mut resolver, || (synth_path.clone(), "export * as mod from \"pkg\";".to_string()))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn fatal_error_is_not_retried() {
        let bundler = ScriptedBundler {
            responses: Mutex::new(vec![Err(BundleErrorKind::Fatal("syntax error".to_string()))]),
            calls: AtomicU32::new(0),
        };
        let driver = BundlerDriver::new(bundler);
        let pkg = test_pkg();
        resolver_plugin!(resolver, pkg);
        let err = driver.run(options(), "pkg", &mut resolver, || unreachable!()).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn define_table_skips_node_target() {
        assert!(build_define_table(Target::Node, false, "/wd/node_modules/pkg/index.js").is_empty());
    }

    #[test]
    fn define_table_sets_node_env_for_browser_target() {
        let table = build_define_table(Target::Es2022, true, "/wd/node_modules/pkg/index.js");
        assert_eq!(table.get("process.env.NODE_ENV"), Some(&"\"development\"".to_string()));
    }

    #[test]
    fn define_table_maps_every_global_to_its_placeholder() {
        let table = build_define_table(Target::Es2022, false, "/wd/node_modules/pkg/index.js");
        assert_eq!(table.get("process"), Some(&"__Process$".to_string()));
        assert_eq!(table.get("Buffer"), Some(&"__Buffer$".to_string()));
        assert_eq!(table.get("global"), Some(&"__global$".to_string()));
        assert_eq!(table.get("setImmediate"), Some(&"__setImmediate$".to_string()));
        assert_eq!(table.get("clearImmediate"), Some(&"__clearImmediate$".to_string()));
        assert_eq!(table.get("require.resolve"), Some(&"__rResolve$".to_string()));
    }

    #[test]
    fn define_table_sets_filename_and_dirname_literals() {
        let table = build_define_table(Target::Es2022, false, "/wd/node_modules/pkg/index.js");
        assert_eq!(table.get("__filename"), Some(&"\"/wd/node_modules/pkg/index.js\"".to_string()));
        assert_eq!(table.get("__dirname"), Some(&"\"/wd/node_modules/pkg\"".to_string()));
    }
}
