// SPDX-License-Identifier: MIT OR Apache-2.0
//! Determines entry point, exported names, and module flavor for an
//! installed package.
//!
//! Reads the installed package's manifest, chooses between `main` (CJS) and
//! `module` (ESM) entries, enumerates named exports via a lexical scan of
//! the entry file (not a full ECMAScript parser — cataloguing top-level
//! `export` statements does not need one), and detects the CJS/ESM flavor.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use cdn_core::ModuleMeta;
use cdn_error::{CdnError, ErrorKind};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Manifest fields this crate needs, independent of where they came from
/// (`cdn-registry`'s [`cdn_registry::PackageManifest`] or a local read).
#[derive(Debug, Clone, Default)]
pub struct EntryManifest {
    /// CJS entry point, relative to the package root.
    pub main: Option<String>,
    /// ESM entry point, relative to the package root.
    pub module: Option<String>,
    /// Declared type-declaration entry, if any.
    pub types: Option<String>,
}

/// The outcome of introspecting an installed package.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntrospectionResult {
    /// Metadata to persist alongside the build artifact.
    pub meta: ModuleMeta,
    /// Path to the chosen entry file, relative to the package root. Empty
    /// when `typesOnly`.
    pub entry: String,
}

/// Determine entry point, exports, and flavor for an installed package.
pub struct ModuleIntrospector;

impl ModuleIntrospector {
    /// Read `package_dir` (the installed package root) and classify it.
    ///
    /// # Errors
    ///
    /// Returns `Invalid` if neither a runtime entry nor `types` is declared.
    pub fn introspect(package_dir: &Path, manifest: &EntryManifest) -> Result<IntrospectionResult, CdnError> {
        if manifest.main.is_none() && manifest.module.is_none() {
            return match &manifest.types {
                Some(types) => Ok(IntrospectionResult {
                    meta: ModuleMeta { types_only: true, dts: types.clone(), ..Default::default() },
                    entry: String::new(),
                }),
                None => Err(CdnError::new(ErrorKind::Invalid, "init", "package declares neither a runtime entry nor types")),
            };
        }

        let (entry_rel, is_esm) = match (&manifest.module, &manifest.main) {
            (Some(m), _) => (m.clone(), true),
            (None, Some(m)) => (m.clone(), false),
            (None, None) => unreachable!("checked above"),
        };

        let entry_path = package_dir.join(&entry_rel);
        let source = std::fs::read_to_string(&entry_path)
            .map_err(|e| CdnError::new(ErrorKind::Invalid, "init", format!("cannot read entry {entry_rel}: {e}")))?;

        let exports = scan_named_exports(&source);
        let export_default = scan_has_default_export(&source);
        let cjs = !is_esm || looks_like_commonjs(&source);

        debug!(target: "cdn.introspect", entry = %entry_rel, exports = exports.len(), export_default, cjs, "introspected entry");

        Ok(IntrospectionResult {
            meta: ModuleMeta {
                exports,
                export_default,
                cjs,
                types_only: false,
                package_css: false,
                dts: manifest.types.clone().unwrap_or_default(),
            },
            entry: entry_rel,
        })
    }
}

/// Lexical scan for top-level `export` forms. Recognizes:
/// - `export { a, b as c }`
/// - `export const/let/var/function/class NAME`
#[must_use]
pub fn scan_named_exports(source: &str) -> Vec<String> {
    let mut names = Vec::new();
    for line in source.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("export {") {
            let body = rest.split('}').next().unwrap_or("");
            for item in body.split(',') {
                let item = item.trim();
                if item.is_empty() {
                    continue;
                }
                let name = match item.split_once(" as ") {
                    Some((_, alias)) => alias.trim(),
                    None => item,
                };
                if !name.is_empty() && name != "default" {
                    names.push(name.to_string());
                }
            }
        } else if let Some(rest) = line.strip_prefix("export const ") {
            push_declared_name(&mut names, rest);
        } else if let Some(rest) = line.strip_prefix("export let ") {
            push_declared_name(&mut names, rest);
        } else if let Some(rest) = line.strip_prefix("export var ") {
            push_declared_name(&mut names, rest);
        } else if let Some(rest) = line.strip_prefix("export function ") {
            push_declared_name(&mut names, rest);
        } else if let Some(rest) = line.strip_prefix("export function* ") {
            push_declared_name(&mut names, rest);
        } else if let Some(rest) = line.strip_prefix("export class ") {
            push_declared_name(&mut names, rest);
        } else if let Some(rest) = line.strip_prefix("export async function ") {
            push_declared_name(&mut names, rest);
        }
    }
    names.sort();
    names.dedup();
    names
}

fn push_declared_name(names: &mut Vec<String>, rest: &str) {
    let name: String = rest.chars().take_while(|c| c.is_alphanumeric() || *c == '_' || *c == '$').collect();
    if !name.is_empty() {
        names.push(name);
    }
}

/// `true` if the source contains a top-level `export default`.
#[must_use]
pub fn scan_has_default_export(source: &str) -> bool {
    source.lines().any(|l| l.trim_start().starts_with("export default"))
}

/// Heuristic CJS detection for a nominally-ESM entry: presence of
/// `module.exports` or `require(` assignments without any `import`/`export`
/// statement at the top level suggests the `module` field was mislabeled.
#[must_use]
pub fn looks_like_commonjs(source: &str) -> bool {
    let has_cjs_marker = source.contains("module.exports") || source.contains("exports.");
    let has_esm_marker = source.lines().any(|l| {
        let t = l.trim_start();
        t.starts_with("import ") || t.starts_with("export ")
    });
    has_cjs_marker && !has_esm_marker
}

/// Locate `package_dir`'s package.json-declared `name` on disk, used by
/// callers that only have a package root and need the manifest path.
#[must_use]
pub fn package_json_path(package_dir: &Path) -> PathBuf {
    package_dir.join("package.json")
}
