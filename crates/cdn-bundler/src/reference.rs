// SPDX-License-Identifier: MIT OR Apache-2.0
//! A minimal, in-process [`Bundler`] implementation.
//!
//! A production-grade bundler (esbuild, in particular) is an
//! external-collaborator interface, not a module this crate is asked to
//! reimplement in full: a real ECMAScript bundler needs a real parser,
//! scope analysis, and minification, none of which are in scope here.
//! [`SimpleJsBundler`] exists so the CLI and daemon binaries have something
//! real to run against instead of only the test doubles the driver's unit
//! tests use.
//!
//! It supports the subset of module shapes the pipeline actually produces:
//! single-file ESM entries (most leaf npm packages), ESM entries that
//! import sibling files within the same package by relative specifier, and
//! the synthesized re-export entry `cdn-orchestrator` builds when the real
//! entry has no default export. It does not perform scope-hoisting or
//! identifier renaming: inlined modules keep their original top-level
//! identifier names, so two internal files that happen to declare the same
//! name will collide. A module that looks CommonJS-authored (uses
//! `module.exports`/`exports.x` and no `export` keyword) alongside ESM
//! `export` syntax in the same file is rejected with
//! [`BundleErrorKind::Fatal`] rather than guessed at; plain `require()` of
//! an internal sibling is likewise not supported.
use async_trait::async_trait;
use cdn_resolver::{ImportKind, Resolution, ResolverPlugin};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{BundleErrorKind, BundleOptions, BundleOutput, Bundler, OutputFile};

/// Bundles straight off the filesystem with no external process.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimpleJsBundler;

impl SimpleJsBundler {
    /// Construct the bundler. Stateless; one instance can be shared across
    /// every build task.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Bundler for SimpleJsBundler {
    async fn bundle(&self, options: &BundleOptions, resolver: &mut ResolverPlugin<'_>) -> Result<BundleOutput, BundleErrorKind> {
        let mut graph = Graph { cache: BTreeMap::new(), order: Vec::new() };
        let entry_path = PathBuf::from(&options.entry_point);
        let entry = inline_module(&entry_path, options, resolver, &mut graph, true).await?;

        let mut out = String::new();
        for path in &graph.order {
            let record = graph.cache.get(path).expect("every ordered path was inlined");
            out.push_str(&record.body);
            if !out.ends_with('\n') {
                out.push('\n');
            }
        }
        out.push_str(&entry.body);

        let code = if options.minify { strip_blank_lines(&out) } else { out };
        Ok(BundleOutput { files: vec![OutputFile { path: "index.js".to_string(), contents: code.into_bytes() }] })
    }
}

/// One inlined dependency module: its rewritten body plus enough
/// bookkeeping for importers to reference its bindings directly, without a
/// module-registry indirection.
struct ModuleRecord {
    body: String,
    named: Vec<String>,
    default_ident: Option<String>,
}

/// Dependency modules already inlined, in the order their bodies must
/// appear (dependencies before dependents, so `const`/`class` bindings are
/// initialized before anything references them).
struct Graph {
    cache: BTreeMap<PathBuf, ModuleRecord>,
    order: Vec<PathBuf>,
}

impl Graph {
    fn is_cached(&self, path: &Path) -> bool {
        self.cache.contains_key(path)
    }
}

fn inline_module<'a>(
    path: &'a Path,
    options: &'a BundleOptions,
    resolver: &'a mut ResolverPlugin<'_>,
    graph: &'a mut Graph,
    is_entry: bool,
) -> Pin<Box<dyn Future<Output = Result<ModuleRecord, BundleErrorKind>> + 'a>> {
    Box::pin(async move {
        let source = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| BundleErrorKind::Fatal(format!("could not read {}: {e}", path.display())))?;

        if !is_entry && looks_ambiguous(&source) {
            return Err(BundleErrorKind::Fatal(format!("{} mixes CommonJS and ESM export forms", path.display())));
        }

        let importer = path.to_string_lossy().into_owned();
        let mut body = String::new();
        let mut named = Vec::new();
        let mut default_ident = None;

        for raw_line in source.lines() {
            let line = raw_line.trim_end();
            match rewrite_line(line, &importer, options, resolver, graph, is_entry, &mut named, &mut default_ident).await? {
                Some(rewritten) => {
                    if !rewritten.is_empty() {
                        body.push_str(&rewritten);
                        body.push('\n');
                    }
                }
                None => {
                    body.push_str(line);
                    body.push('\n');
                }
            }
        }

        Ok(ModuleRecord { body, named, default_ident })
    })
}

#[allow(clippy::too_many_arguments)]
async fn rewrite_line(
    line: &str,
    importer: &str,
    options: &BundleOptions,
    resolver: &mut ResolverPlugin<'_>,
    graph: &mut Graph,
    is_entry: bool,
    named: &mut Vec<String>,
    default_ident: &mut Option<String>,
) -> Result<Option<String>, BundleErrorKind> {
    let trimmed = line.trim_start();
    let indent = &line[..line.len() - trimmed.len()];

    if trimmed.starts_with("import ") || trimmed.starts_with("import(") {
        if let Some(spec) = extract_quoted_after(trimmed, "from") {
            return Ok(Some(rewrite_import(indent, trimmed, &spec, importer, options, resolver, graph).await?));
        }
        if let Some(spec) = extract_bare_side_effect_import(trimmed) {
            return match classify(resolver, &spec, importer, ImportKind::Import) {
                Resolved::External(emit) => Ok(Some(format!("{indent}import \"{emit}\";"))),
                Resolved::Internal => {
                    ensure_inlined(&spec, options, resolver, graph, importer).await?;
                    Ok(Some(String::new()))
                }
            };
        }
        return Ok(None);
    }

    if trimmed.starts_with("export *") {
        if let Some(rest) = trimmed.strip_prefix("export * as ") {
            if let Some((name, spec_part)) = rest.split_once(" from ") {
                let spec = unquote(spec_part.trim_end_matches(';').trim());
                return Ok(Some(rewrite_export_star(indent, name.trim(), &spec, importer, options, resolver, graph, is_entry).await?));
            }
        } else if let Some(rest) = trimmed.strip_prefix("export * from ") {
            let spec = unquote(rest.trim_end_matches(';').trim());
            return match classify(resolver, &spec, importer, ImportKind::Import) {
                Resolved::External(emit) => Ok(Some(format!("{indent}export * from \"{emit}\";"))),
                Resolved::Internal => {
                    let rec_named = ensure_inlined(&spec, options, resolver, graph, importer).await?.named.clone();
                    named.extend(rec_named.clone());
                    if is_entry {
                        Ok(Some(format!("{indent}export {{ {} }};", rec_named.join(", "))))
                    } else {
                        Ok(Some(String::new()))
                    }
                }
            };
        }
        return Ok(None);
    }

    // `export const { a, b } = ident;` — the synthesized re-export entry's
    // destructuring shape (see `cdn-orchestrator`'s entry synthesis). Valid
    // JavaScript on its own; expanded here into one `export const` per name
    // so each becomes its own named binding like any other export.
    if let Some(rest) = trimmed.strip_prefix("export const {") {
        if let Some((names_part, tail)) = rest.split_once('}') {
            let tail = tail.trim();
            if let Some(ident) = tail.strip_prefix('=').map(|s| s.trim_end_matches(';').trim().to_string()) {
                let mut out = String::new();
                for raw in names_part.split(',') {
                    let name = raw.trim();
                    if name.is_empty() {
                        continue;
                    }
                    out.push_str(&format!("{indent}export const {name} = {ident}.{name};\n"));
                    named.push(name.to_string());
                }
                return Ok(Some(out.trim_end_matches('\n').to_string()));
            }
        }
        return Ok(None);
    }

    if let Some(rest) = trimmed.strip_prefix("export {") {
        if let Some((names_part, tail)) = rest.split_once('}') {
            let tail = tail.trim();
            if let Some(from_spec) = tail.strip_prefix("from ") {
                let spec = unquote(from_spec.trim_end_matches(';').trim());
                return match classify(resolver, &spec, importer, ImportKind::Import) {
                    Resolved::External(emit) => Ok(Some(format!("{indent}export {{{names_part}}} from \"{emit}\";"))),
                    Resolved::Internal => {
                        ensure_inlined(&spec, options, resolver, graph, importer).await?;
                        let mut out = String::new();
                        for raw in names_part.split(',') {
                            let Some((src, local)) = split_as(raw) else { continue };
                            out.push_str(&format!("{indent}export const {local} = {src};\n"));
                            named.push(local);
                        }
                        Ok(Some(out.trim_end_matches('\n').to_string()))
                    }
                };
            }
            // export { a, b as c }; (local re-export, no specifier)
            if is_entry {
                for raw in names_part.split(',') {
                    if let Some((_, local)) = split_as(raw) {
                        named.push(local);
                    }
                }
                return Ok(None);
            }
            return Ok(Some(String::new()));
        }
        return Ok(None);
    }

    if let Some(rest) = trimmed.strip_prefix("export default ") {
        if is_entry {
            return Ok(None);
        }
        if let Some(name) = declared_name_after(rest, "function").or_else(|| declared_name_after(rest, "class")) {
            *default_ident = Some(name);
            return Ok(Some(format!("{indent}{rest}")));
        }
        let rest_trim = rest.trim_start();
        if rest_trim.starts_with("function") || rest_trim.starts_with("class") || rest_trim.starts_with("async function") {
            let id = format!("__cdn_default_{}", next_synthetic_id());
            let with_name = insert_synthetic_name(rest, &id);
            *default_ident = Some(id);
            return Ok(Some(format!("{indent}{with_name}")));
        }
        let id = format!("__cdn_default_{}", next_synthetic_id());
        *default_ident = Some(id.clone());
        return Ok(Some(format!("{indent}const {id} = {rest}")));
    }

    if let Some(rest) = trimmed.strip_prefix("export ") {
        if let Some(name) = declared_export_name(rest) {
            named.push(name);
            return if is_entry { Ok(None) } else { Ok(Some(format!("{indent}{rest}"))) };
        }
    }

    Ok(None)
}

enum Resolved {
    External(String),
    Internal,
}

fn classify(resolver: &mut ResolverPlugin<'_>, spec: &str, importer: &str, kind: ImportKind) -> Resolved {
    match resolver.on_resolve(spec, importer, kind) {
        Resolution::Internal => Resolved::Internal,
        Resolution::External { emit_path, .. } => Resolved::External(emit_path),
    }
}

async fn ensure_inlined<'g>(
    spec: &str,
    options: &BundleOptions,
    resolver: &mut ResolverPlugin<'_>,
    graph: &'g mut Graph,
    importer: &str,
) -> Result<&'g ModuleRecord, BundleErrorKind> {
    let target = resolve_on_disk(&options.working_dir, Path::new(importer), spec)
        .await
        .ok_or_else(|| BundleErrorKind::CouldNotResolve { specifier: spec.to_string() })?;
    if !graph.is_cached(&target) {
        let record = inline_module(&target, options, resolver, graph, false).await?;
        graph.cache.insert(target.clone(), record);
        graph.order.push(target.clone());
    }
    Ok(graph.cache.get(&target).expect("just inserted"))
}

async fn rewrite_import(
    indent: &str,
    trimmed: &str,
    spec: &str,
    importer: &str,
    options: &BundleOptions,
    resolver: &mut ResolverPlugin<'_>,
    graph: &mut Graph,
) -> Result<String, BundleErrorKind> {
    let kind = if trimmed.starts_with("import(") { ImportKind::DynamicImport } else { ImportKind::Import };
    match classify(resolver, spec, importer, kind) {
        Resolved::External(emit) => Ok(rewrite_specifier_text(indent, trimmed, spec, &emit)),
        Resolved::Internal => {
            let rec = ensure_inlined(spec, options, resolver, graph, importer).await?;
            bind_import(indent, trimmed, rec)
        }
    }
}

fn bind_import(indent: &str, trimmed: &str, rec: &ModuleRecord) -> Result<String, BundleErrorKind> {
    let clause = trimmed.strip_prefix("import ").unwrap_or(trimmed);
    let clause = clause.split(" from ").next().unwrap_or("").trim();

    if let Some(inner) = clause.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
        let mut out = String::new();
        for raw in inner.split(',') {
            let Some((src, local)) = split_as(raw) else { continue };
            if src != local {
                out.push_str(&format!("{indent}const {local} = {src};\n"));
            }
        }
        return Ok(out.trim_end_matches('\n').to_string());
    }
    if let Some(ns) = clause.strip_prefix("* as ") {
        return Ok(format!("{indent}{}", namespace_object_decl(ns.trim(), rec)));
    }
    let ident = clause.trim();
    if ident.is_empty() {
        return Ok(String::new());
    }
    match &rec.default_ident {
        Some(def) => Ok(format!("{indent}const {ident} = {def};")),
        None => Ok(format!("{indent}const {ident} = undefined;")),
    }
}

async fn rewrite_export_star(
    indent: &str,
    ns_name: &str,
    spec: &str,
    importer: &str,
    options: &BundleOptions,
    resolver: &mut ResolverPlugin<'_>,
    graph: &mut Graph,
    is_entry: bool,
) -> Result<String, BundleErrorKind> {
    match classify(resolver, spec, importer, ImportKind::Import) {
        Resolved::External(emit) => Ok(format!("{indent}export * as {ns_name} from \"{emit}\";")),
        Resolved::Internal => {
            let rec = ensure_inlined(spec, options, resolver, graph, importer).await?;
            let decl = namespace_object_decl(ns_name, rec);
            if is_entry {
                Ok(format!("{indent}{decl}\n{indent}export {{ {ns_name} }};"))
            } else {
                Ok(format!("{indent}{decl}"))
            }
        }
    }
}

fn namespace_object_decl(ns_name: &str, rec: &ModuleRecord) -> String {
    let mut obj = format!("var {ns_name} = {{ ");
    for name in &rec.named {
        obj.push_str(&format!("{name}: {name}, "));
    }
    if let Some(def) = &rec.default_ident {
        obj.push_str(&format!("default: {def} "));
    }
    obj.push_str("};");
    obj
}

fn rewrite_specifier_text(indent: &str, trimmed: &str, spec: &str, emit: &str) -> String {
    let quote = if trimmed.contains('\'') && !trimmed.contains('"') { '\'' } else { '"' };
    let double = trimmed.replacen(&format!("\"{spec}\""), &format!("{quote}{emit}{quote}"), 1);
    let replaced = if double != trimmed { double } else { trimmed.replacen(&format!("'{spec}'"), &format!("{quote}{emit}{quote}"), 1) };
    format!("{indent}{replaced}")
}

fn extract_quoted_after(trimmed: &str, keyword: &str) -> Option<String> {
    let idx = trimmed.find(&format!(" {keyword} "))?;
    let rest = trimmed[idx + keyword.len() + 2..].trim_start();
    let quote = rest.chars().next()?;
    if quote != '"' && quote != '\'' {
        return None;
    }
    let end = rest[1..].find(quote)? + 1;
    Some(rest[1..end].to_string())
}

fn extract_bare_side_effect_import(trimmed: &str) -> Option<String> {
    let rest = trimmed.strip_prefix("import ")?.trim_start();
    let quote = rest.chars().next()?;
    if quote != '"' && quote != '\'' {
        return None;
    }
    let end = rest[1..].find(quote)? + 1;
    Some(rest[1..end].to_string())
}

fn unquote(s: &str) -> String {
    s.trim().trim_matches('"').trim_matches('\'').to_string()
}

fn split_as(raw: &str) -> Option<(String, String)> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Some((src, local)) = raw.split_once(" as ") {
        Some((src.trim().to_string(), local.trim().to_string()))
    } else {
        Some((raw.to_string(), raw.to_string()))
    }
}

fn declared_export_name(rest: &str) -> Option<String> {
    for kw in ["const ", "let ", "var ", "function* ", "function ", "async function ", "class "] {
        if let Some(tail) = rest.strip_prefix(kw) {
            let name: String = tail.chars().take_while(|c| c.is_alphanumeric() || *c == '_' || *c == '$').collect();
            if !name.is_empty() {
                return Some(name);
            }
        }
    }
    None
}

fn declared_name_after(rest: &str, keyword: &str) -> Option<String> {
    let idx = rest.find(keyword)?;
    let tail = rest[idx + keyword.len()..].trim_start();
    let name: String = tail.chars().take_while(|c| c.is_alphanumeric() || *c == '_' || *c == '$').collect();
    if name.is_empty() { None } else { Some(name) }
}

fn insert_synthetic_name(rest: &str, id: &str) -> String {
    for kw in ["async function", "function*", "function", "class"] {
        if let Some(idx) = rest.find(kw) {
            let after = idx + kw.len();
            let tail = &rest[after..];
            if tail.trim_start().starts_with('(') || tail.trim_start().starts_with('{') {
                return format!("{} {}{}", &rest[..after], id, tail);
            }
        }
    }
    rest.to_string()
}

fn looks_ambiguous(source: &str) -> bool {
    let has_cjs = source.contains("module.exports") || source.contains("exports.");
    let has_esm = source.lines().any(|l| l.trim_start().starts_with("export "));
    has_cjs && has_esm
}

fn strip_blank_lines(code: &str) -> String {
    code.lines().filter(|l| !l.trim().is_empty()).collect::<Vec<_>>().join("\n")
}

async fn resolve_on_disk(working_dir: &str, importer: &Path, specifier: &str) -> Option<PathBuf> {
    let base = if specifier.starts_with('.') || specifier.starts_with('/') {
        let dir = importer.parent().unwrap_or_else(|| Path::new(""));
        normalize_join(dir, specifier)
    } else {
        Path::new(working_dir).join("node_modules").join(specifier)
    };
    resolve_candidate(&base).await
}

fn normalize_join(dir: &Path, specifier: &str) -> PathBuf {
    let joined = dir.join(specifier);
    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

async fn resolve_candidate(base: &Path) -> Option<PathBuf> {
    if tokio::fs::metadata(base).await.map(|m| m.is_file()).unwrap_or(false) {
        return Some(base.to_path_buf());
    }
    for ext in [".mjs", ".js", ".cjs"] {
        let candidate = append_ext(base, ext);
        if tokio::fs::metadata(&candidate).await.is_ok() {
            return Some(candidate);
        }
    }
    if tokio::fs::metadata(base).await.map(|m| m.is_dir()).unwrap_or(false) {
        if let Some(entry) = package_json_entry(base).await {
            let candidate = base.join(&entry);
            if tokio::fs::metadata(&candidate).await.is_ok() {
                return Some(candidate);
            }
        }
        for name in ["index.mjs", "index.js", "index.cjs"] {
            let candidate = base.join(name);
            if tokio::fs::metadata(&candidate).await.is_ok() {
                return Some(candidate);
            }
        }
    }
    None
}

fn append_ext(base: &Path, ext: &str) -> PathBuf {
    let mut s = base.as_os_str().to_os_string();
    s.push(ext);
    PathBuf::from(s)
}

async fn package_json_entry(dir: &Path) -> Option<String> {
    let bytes = tokio::fs::read(dir.join("package.json")).await.ok()?;
    let json: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    json.get("module")
        .or_else(|| json.get("main"))
        .and_then(|v| v.as_str())
        .map(|s| s.trim_start_matches("./").to_string())
}

fn next_synthetic_id() -> usize {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    COUNTER.fetch_add(1, Ordering::SeqCst)
}
