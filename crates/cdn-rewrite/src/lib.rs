// SPDX-License-Identifier: MIT OR Apache-2.0
//! Rewrites a bundler's raw output into the artifact the CDN actually
//! serves: banner, external-sentinel substitution with CJS/ESM interop,
//! and target-specific global rewrites.
//!
//! A post-processing pass over each bundler output file: a byte-level scan
//! for `__ESM_SH_EXTERNAL:<specifier>` string literals (the sentinel
//! survives minification because the bundler treats it as opaque string
//! content), each replaced according to the calling
//! context (`require(...)`, `require.resolve(...)`, a static `import ...
//! from`, or a dynamic `import(...)`) and, for `require()` call sites, one
//! of four CJS/ESM interop shapes hoisted as a real ES import at the top
//! of the file. This crate has no bundler or registry dependency — the
//! orchestrator resolves every external specifier to a CDN URL and (where
//! known) its [`cdn_core::ModuleMeta`] before calling in here; this crate's
//! job is purely textual.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use cdn_core::{ModuleMeta, Target};
use cdn_error::{CdnError, ErrorKind};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// What an external specifier resolved to, as determined by the
/// orchestrator's CDN-resolution chain.
#[derive(Debug, Clone)]
pub struct ExternalInfo {
    /// The CDN (or remote/builtin) URL this specifier should be replaced
    /// with.
    pub url: String,
    /// The external's own module metadata, when known (it was built or
    /// already in `DB`). `None` for remote passthroughs and anything the
    /// resolution chain could not introspect, forcing the conservative
    /// plain-default interop form.
    pub meta: Option<ModuleMeta>,
}

/// Per-rewrite settings that are not specific to any one external.
#[derive(Debug, Clone)]
pub struct RewriteCtx {
    /// Output target, controlling the Deno-specific rewrites and whether
    /// Node-global shims are injected at all.
    pub target: Target,
    /// `true` to keep `development`-mode branches (affects nothing in this
    /// crate directly; carried through for banner metadata parity with the
    /// `define` table cdn-bundler built for the same build).
    pub development: bool,
    /// Pinned Deno standard-library version, used to build `std/node/...`
    /// shim URLs when `target == Target::Deno`.
    pub deno_std_version: String,
}

/// The result of rewriting one bundler output file.
#[derive(Debug, Clone, Default)]
pub struct RewrittenOutput {
    /// The rewritten source, ready to persist.
    pub code: Vec<u8>,
    /// Node-global shim packages this output ended up importing
    /// (`buffer`, `process`, ...), for the orchestrator's own metadata.
    pub shims_used: BTreeSet<&'static str>,
}

/// Rewrites bundler output.
pub struct OutputRewriter;

impl OutputRewriter {
    /// Rewrite one bundler output file.
    ///
    /// `resolutions` must contain an entry for every specifier the
    /// resolver recorded in the build's `externals` set; a sentinel whose
    /// specifier is missing from `resolutions` is a programming error in
    /// the orchestrator, not a recoverable build failure.
    ///
    /// # Errors
    ///
    /// Returns `Fatal` if `source` is not valid UTF-8, or if a sentinel
    /// string literal is malformed (unterminated).
    pub fn rewrite(source: &[u8], ctx: &RewriteCtx, pkg_display: &str, build_version: i32, resolutions: &BTreeMap<String, ExternalInfo>) -> Result<RewrittenOutput, CdnError> {
        let text = std::str::from_utf8(source).map_err(|e| CdnError::new(ErrorKind::Fatal, "rewrite", format!("bundler output is not valid UTF-8: {e}")))?;

        let mut prelude = String::new();
        let mut body = String::new();
        let mut shims_used = BTreeSet::new();
        let mut hoisted_for: BTreeMap<String, String> = BTreeMap::new();
        let mut binding_counter: u32 = 0;

        let mut cursor = 0usize;
        while let Some(rel_start) = text[cursor..].find(cdn_core::constants::EXTERNAL_SENTINEL_PREFIX) {
            let sentinel_start = cursor + rel_start;
            let quote_idx = sentinel_start.checked_sub(1).filter(|&i| matches!(text.as_bytes()[i], b'"' | b'\'')).ok_or_else(|| {
                CdnError::new(ErrorKind::Fatal, "rewrite", "external sentinel not preceded by a quote character")
            })?;
            let quote_char = text.as_bytes()[quote_idx];
            let specifier_start = sentinel_start + cdn_core::constants::EXTERNAL_SENTINEL_PREFIX.len();
            let close_rel = text[specifier_start..].find(quote_char as char).ok_or_else(|| {
                CdnError::new(ErrorKind::Fatal, "rewrite", "unterminated external sentinel string literal")
            })?;
            let close_idx = specifier_start + close_rel;
            let specifier = &text[specifier_start..close_idx];

            let resolution = resolutions.get(specifier).ok_or_else(|| {
                CdnError::new(ErrorKind::Fatal, "rewrite", format!("no resolution recorded for external '{specifier}'")).with_context("specifier", specifier)
            })?;

            let call_site = detect_call_site(&text[..quote_idx]);
            body.push_str(&text[cursor..call_site.replace_from.unwrap_or(quote_idx)]);

            match call_site.kind {
                CallSiteKind::Require => {
                    let close_paren = find_close_paren_after(text, close_idx).ok_or_else(|| {
                        CdnError::new(ErrorKind::Fatal, "rewrite", "unterminated require(...) call around external sentinel")
                    })?;
                    let named = try_property_access(text, close_paren + 1).filter(|&(prop, _)| {
                        resolution.meta.as_ref().is_some_and(|m| m.exports.iter().any(|e| e == prop))
                    });
                    if let Some((prop, prop_end)) = named {
                        let key = format!("{specifier}.{prop}");
                        let binding = hoisted_for.entry(key).or_insert_with(|| {
                            binding_counter += 1;
                            let binding = format!("__esmExternal{binding_counter}");
                            prelude.push_str(&format!("import {{ {prop} as {binding} }} from \"{}\";\n", resolution.url));
                            binding
                        });
                        body.push_str(binding);
                        cursor = prop_end;
                    } else {
                        let binding = hoisted_for.entry(specifier.to_string()).or_insert_with(|| {
                            binding_counter += 1;
                            let binding = format!("__esmExternal{binding_counter}");
                            let form = classify_interop(resolution.meta.as_ref(), specifier);
                            prelude.push_str(&prelude_for(form, &binding, &resolution.url));
                            binding
                        });
                        body.push_str(binding);
                        cursor = close_paren + 1;
                    }
                }
                CallSiteKind::RequireResolve => {
                    body.push('"');
                    body.push_str(&resolution.url);
                    body.push('"');
                    let close_paren = find_close_paren_after(text, close_idx).ok_or_else(|| {
                        CdnError::new(ErrorKind::Fatal, "rewrite", "unterminated require.resolve(...) call around external sentinel")
                    })?;
                    cursor = close_paren + 1;
                }
                CallSiteKind::StaticOrDynamicImportOrPlainString => {
                    body.push(quote_char as char);
                    body.push_str(&resolution.url);
                    body.push(quote_char as char);
                    cursor = close_idx + 1;
                }
            }
        }
        body.push_str(&text[cursor..]);

        detect_shim_needs(&body, ctx.target, &mut shims_used);
        for placeholder in &shims_used {
            prelude.push_str(&shim_import_line(placeholder, ctx, build_version));
        }

        let mut rewritten = body;
        if ctx.target == Target::Deno {
            rewritten = apply_deno_window_check_rewrite(&rewritten);
        }

        let mut out = String::new();
        out.push_str(&build_banner(pkg_display, build_version));
        out.push_str(&prelude);
        out.push_str(&rewritten);

        debug!(target: "cdn.rewrite", pkg = pkg_display, externals = hoisted_for.len(), shims = shims_used.len(), "rewrote bundler output");

        Ok(RewrittenOutput { code: out.into_bytes(), shims_used })
    }
}

enum CallSiteKind {
    Require,
    RequireResolve,
    StaticOrDynamicImportOrPlainString,
}

struct CallSite {
    kind: CallSiteKind,
    /// Index the copied prefix should stop at — `None` means "the opening
    /// quote itself" (the static/dynamic-import/plain-string case, where we
    /// keep the quote and only replace its contents).
    replace_from: Option<usize>,
}

/// Inspects the text immediately preceding a sentinel's opening quote to
/// decide how the string literal is being used.
fn detect_call_site(prefix: &str) -> CallSite {
    let trimmed = prefix.trim_end();
    if let Some(before) = trimmed.strip_suffix("require.resolve(") {
        return CallSite { kind: CallSiteKind::RequireResolve, replace_from: Some(before.len()) };
    }
    if let Some(before) = trimmed.strip_suffix("require(") {
        return CallSite { kind: CallSiteKind::Require, replace_from: Some(before.len()) };
    }
    CallSite { kind: CallSiteKind::StaticOrDynamicImportOrPlainString, replace_from: None }
}

/// Finds the `)` closing a `require(...)`/`require.resolve(...)` call whose
/// sole argument was the sentinel string literal ending at `close_quote_idx`.
fn find_close_paren_after(text: &str, close_quote_idx: usize) -> Option<usize> {
    let rest = &text[close_quote_idx + 1..];
    let offset = rest.find(')')?;
    if rest[..offset].trim().is_empty() {
        Some(close_quote_idx + 1 + offset)
    } else {
        None
    }
}

/// The four CJS/ESM interop shapes a `require()` of an external can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InteropForm {
    /// ESM module with no default export: bind the whole namespace.
    NamedOnly,
    /// ESM module with a default export: bind a merged
    /// `{ ...namespace, default }` object so both `require("x").named` and
    /// `require("x").default`/callable-default usage keep working.
    EsmDefaultMerge,
    /// CJS module whose default export is itself the `module.exports`
    /// value with named properties attached (the `__esModule`-flagged
    /// shape): merge default and namespace the same way, since both came
    /// from the same underlying object.
    CjsEsModuleMerge,
    /// Unknown module shape, or a module (like `object-assign`) whose
    /// `require()` result is conventionally just the callable default
    /// itself: bind the default export directly.
    PlainDefault,
}

/// Packages whose CJS export IS their default export, not a named-plus-
/// default object — `require()`ing them must yield the callable/value
/// itself, never a merged namespace object.
const DEFAULT_ONLY_PACKAGES: &[&str] = &["object-assign"];

fn classify_interop(meta: Option<&ModuleMeta>, specifier: &str) -> InteropForm {
    let bare = specifier.split('/').next().unwrap_or(specifier);
    if DEFAULT_ONLY_PACKAGES.contains(&bare) {
        return InteropForm::PlainDefault;
    }
    match meta {
        Some(m) if m.cjs && m.export_default => InteropForm::CjsEsModuleMerge,
        Some(m) if !m.cjs && m.export_default => InteropForm::EsmDefaultMerge,
        Some(m) if !m.cjs && !m.export_default => InteropForm::NamedOnly,
        _ => InteropForm::PlainDefault,
    }
}

fn prelude_for(form: InteropForm, binding: &str, url: &str) -> String {
    match form {
        InteropForm::NamedOnly => format!("import * as {binding} from \"{url}\";\n"),
        InteropForm::EsmDefaultMerge => format!(
            "import {binding}$default, * as {binding}$ns from \"{url}\";\nconst {binding} = Object.assign(Object.create(null), {binding}$ns, {{ default: {binding}$default }});\n"
        ),
        InteropForm::CjsEsModuleMerge => format!(
            "import {binding}$default, * as {binding}$ns from \"{url}\";\nconst {binding} = Object.assign({binding}$default, {binding}$ns);\n"
        ),
        InteropForm::PlainDefault => format!("import {binding} from \"{url}\";\n"),
    }
}

/// Scans rewritten output for the `__Name$`-style placeholders
/// [`cdn_core::constants::GLOBAL_DEFINE_SHIMS`] lists — the bundler's
/// `define` table already replaced the bare globals with these, so gating
/// on the placeholder (rather than the original identifier) keeps "a shim
/// import appears iff its placeholder symbol appears in the body" exact,
/// including across minification.
fn detect_shim_needs(body: &str, target: Target, shims_used: &mut BTreeSet<&'static str>) {
    if target == Target::Node {
        return;
    }
    for (_, placeholder, _) in cdn_core::constants::GLOBAL_DEFINE_SHIMS {
        if contains_word(body, placeholder) {
            shims_used.insert(placeholder);
        }
    }
}

fn contains_word(haystack: &str, needle: &str) -> bool {
    let bytes = haystack.as_bytes();
    let nbytes = needle.as_bytes();
    let is_ident = |b: u8| b.is_ascii_alphanumeric() || b == b'_' || b == b'$';
    let mut start = 0;
    while let Some(rel) = haystack[start..].find(needle) {
        let idx = start + rel;
        let before_ok = idx == 0 || !is_ident(bytes[idx - 1]);
        let after_idx = idx + nbytes.len();
        let after_ok = after_idx >= bytes.len() || !is_ident(bytes[after_idx]);
        if before_ok && after_ok {
            return true;
        }
        start = idx + 1;
    }
    false
}

/// Builds the prelude import binding a placeholder to its shim module,
/// using the target-specific built-in-module URL scheme from §4.8.D (Deno
/// standard-library module when one exists, otherwise the embedded
/// polyfill under `v{build_version}`).
fn shim_import_line(placeholder: &str, ctx: &RewriteCtx, build_version: i32) -> String {
    let module = cdn_core::constants::GLOBAL_DEFINE_SHIMS
        .iter()
        .find(|(_, p, _)| *p == placeholder)
        .map_or(placeholder, |(_, _, module)| *module);
    let url = cdn_core::constants::built_in_module_url(ctx.target, build_version, &ctx.deno_std_version, module);
    format!("import {placeholder} from \"{url}\";\n")
}

/// Detects a `.<identifier>` property access immediately following `start`
/// (e.g. the `.foo` in `require("x").foo`), returning the identifier and
/// the index just past it.
fn try_property_access(text: &str, start: usize) -> Option<(&str, usize)> {
    let rest = text.get(start..)?.strip_prefix('.')?;
    let end = rest.find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '$')).unwrap_or(rest.len());
    if end == 0 || rest.as_bytes()[0].is_ascii_digit() {
        return None;
    }
    Some((&rest[..end], start + 1 + end))
}

/// Browser-authored libraries frequently branch on `typeof window !==
/// "undefined"` to detect a DOM environment; Deno has neither `window` by
/// default nor the same feature-detection convention, so the equivalent
/// check there is against the `Deno` global.
fn apply_deno_window_check_rewrite(source: &str) -> String {
    source.replace("typeof window !== \"undefined\"", "typeof Deno !== \"undefined\"").replace("typeof window !== 'undefined'", "typeof Deno !== 'undefined'")
}

/// Builds the comment banner prepended to every served artifact.
#[must_use]
pub fn build_banner(pkg_display: &str, build_version: i32) -> String {
    format!("/* {pkg_display} (build v{build_version}) - generated by the CDN build service */\n")
}
