//! Fixed tables the rest of the pipeline consults when classifying imports.

/// Service-wide schema counter. Bumping this invalidates every prior
/// fingerprint without touching a single stored artifact's bytes.
pub const VERSION: i32 = 136;

/// The sentinel that survives minification in a string literal and marks a
/// bundler output reference as external, pending rewrite.
pub const EXTERNAL_SENTINEL_PREFIX: &str = "__ESM_SH_EXTERNAL:";

/// Runtime identifiers the bundler's `define` table rewrites to a
/// placeholder before emission, skipped entirely on `target=="node"`.
/// Each entry pairs the source identifier, the placeholder it becomes, and
/// the built-in module whose polyfill backs that placeholder's prelude
/// import. Shared between `cdn-bundler` (which builds the `define` table
/// from the first two columns) and `cdn-rewrite` (which scans rewritten
/// output for the placeholder and, on a match, resolves the third column
/// to a shim URL).
pub const GLOBAL_DEFINE_SHIMS: &[(&str, &str, &str)] = &[
    ("process", "__Process$", "process"),
    ("Buffer", "__Buffer$", "buffer"),
    ("global", "__global$", "global"),
    ("setImmediate", "__setImmediate$", "timers"),
    ("clearImmediate", "__clearImmediate$", "timers"),
    ("require.resolve", "__rResolve$", "require_resolve"),
];

/// Resolves the built-in-module URL a global shim placeholder (or a true
/// Node built-in external) should import from: `node:` passthrough on
/// `node`, the pinned Deno standard-library module when one exists, else a
/// published polyfill package or an embedded polyfill asset.
#[must_use]
pub fn built_in_module_url(target: crate::Target, build_version: i32, deno_std_version: &str, module: &str) -> String {
    match target {
        crate::Target::Node => format!("node:{module}"),
        crate::Target::Deno if has_deno_std_node_module(module) => {
            format!("https://deno.land/std@{deno_std_version}/node/{module}.ts")
        }
        _ => match polyfill_for_built_in(module) {
            Some(polyfill) => format!("/v{build_version}/{polyfill}"),
            None => format!("/v{build_version}/embed/polyfills/node_{module}.js"),
        },
    }
}

/// Node built-ins that are never bundled; their handling depends on target
/// (passthrough on `node`, stdlib URL on `deno`, polyfill or stub elsewhere).
pub const BUILT_IN_NODE_MODULES: &[&str] = &[
    "assert",
    "buffer",
    "child_process",
    "cluster",
    "console",
    "constants",
    "crypto",
    "dgram",
    "dns",
    "domain",
    "events",
    "fs",
    "http",
    "http2",
    "https",
    "module",
    "net",
    "os",
    "path",
    "perf_hooks",
    "process",
    "punycode",
    "querystring",
    "readline",
    "repl",
    "stream",
    "string_decoder",
    "sys",
    "timers",
    "tls",
    "tty",
    "url",
    "util",
    "v8",
    "vm",
    "worker_threads",
    "zlib",
];

/// Node built-ins that ship a browser polyfill package under `embed/polyfills`
/// or a published polyfill, keyed to the submodule the polyfill lives at.
pub const POLYFILLED_BUILT_IN_NODE_MODULES: &[(&str, &str)] = &[
    ("buffer", "buffer"),
    ("events", "events"),
    ("path", "path-browserify"),
    ("querystring", "querystring-es3"),
    ("stream", "stream-browserify"),
    ("string_decoder", "string_decoder"),
    ("url", "url"),
    ("util", "util"),
];

/// Node built-ins with a corresponding Deno standard-library module, relative
/// to `std/node/` at the pinned `denoStdVersion`.
pub const DENO_STD_NODE_MODULES: &[&str] = &[
    "assert",
    "buffer",
    "crypto",
    "events",
    "fs",
    "path",
    "process",
    "stream",
    "string_decoder",
    "url",
    "util",
];

/// Returns `true` if `name` names a Node built-in module.
#[must_use]
pub fn is_built_in_node_module(name: &str) -> bool {
    BUILT_IN_NODE_MODULES.contains(&name)
}

/// Looks up the polyfill submodule for a built-in, if one is published.
#[must_use]
pub fn polyfill_for_built_in(name: &str) -> Option<&'static str> {
    POLYFILLED_BUILT_IN_NODE_MODULES
        .iter()
        .find(|(builtin, _)| *builtin == name)
        .map(|(_, polyfill)| *polyfill)
}

/// Returns `true` if `name` has a Deno `std/node/<name>.ts` counterpart.
#[must_use]
pub fn has_deno_std_node_module(name: &str) -> bool {
    DENO_STD_NODE_MODULES.contains(&name)
}
