// SPDX-License-Identifier: MIT OR Apache-2.0
//! HTTP control plane: parses an esm.sh-style request path into a
//! [`BuildDescriptor`], submits it to a shared [`BuildQueue`], and streams
//! back the finished artifact or a JSON error body.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use axum::{
    extract::{Path as AxPath, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use cdn_bundler::SimpleJsBundler;
use cdn_config::BuildServiceConfig;
use cdn_core::{BuildDescriptor, Package, Target};
use cdn_error::{CdnError, CdnErrorDto, ErrorKind};
use cdn_orchestrator::{BuildResult, BuildTask};
use cdn_queue::BuildQueue;
use cdn_store::FsStore;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// The only queue/task shape this daemon serves: one bundler implementation,
/// shared across every request.
pub type DaemonQueue = BuildQueue<BuildResult, BuildTask<SimpleJsBundler>>;

/// Shared daemon state.
#[derive(Clone)]
pub struct AppState {
    /// The build-coalescing queue every request is submitted to.
    pub queue: Arc<DaemonQueue>,
    /// Where finished artifacts live, for reading back after a build
    /// completes (or was already cached).
    pub fs: Arc<dyn FsStore>,
    /// Effective runtime configuration (pins, timeouts, build version).
    pub config: BuildServiceConfig,
}

/// A JSON-bodied API error, mirroring [`CdnErrorDto`] with an HTTP status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    dto: CdnErrorDto,
}

impl ApiError {
    fn from_cdn_error(err: CdnError) -> Self {
        let status = match err.kind {
            ErrorKind::Invalid => StatusCode::BAD_REQUEST,
            ErrorKind::PackageNotFound => StatusCode::NOT_FOUND,
            ErrorKind::Transient => StatusCode::BAD_GATEWAY,
            ErrorKind::UnresolvedExternal | ErrorKind::BuildFailed | ErrorKind::Fatal => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        };
        Self { status, dto: CdnErrorDto::from(&err) }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, dto: CdnErrorDto::from(&CdnError::new(ErrorKind::Invalid, "router", message)) }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.dto)).into_response()
    }
}

/// Build the Axum router serving every daemon route.
#[must_use]
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(cmd_health))
        .route("/{*path}", get(cmd_build))
        .with_state(state)
}

async fn cmd_health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "build_version": cdn_core::constants::VERSION,
        "time_unix_ignored": "daemon does not stamp wall-clock time at rest",
    }))
}

async fn cmd_build(AxPath(path): AxPath<String>, State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let pins = state.config.pins.as_map();
    let (package, target, alias, deps) = parse_request_path(&path, &pins).map_err(ApiError::bad_request)?;

    let mut descriptor = BuildDescriptor::new(package, state.config.build_version, target);
    descriptor.alias = alias;
    descriptor.deps = deps;
    let descriptor = descriptor.canonicalize();
    info!(target: "cdn.daemon", pkg = %descriptor.package, build_target = %target, "routing build request");

    let consumer = state.queue.add(descriptor, path.clone()).await;
    let timeout = Duration::from_secs(state.config.consumer_timeout_secs);
    let result = consumer.wait_with_timeout(timeout).await.map_err(ApiError::from_cdn_error)?;

    let bytes = state.fs.read_file(&result.artifact_path).await.map_err(ApiError::from_cdn_error)?;

    let content_type = if target == Target::Types {
        "application/typescript; charset=utf-8"
    } else {
        "application/javascript; charset=utf-8"
    };

    Ok((
        [(header::CONTENT_TYPE, content_type), (header::CACHE_CONTROL, "public, max-age=31536000, immutable")],
        bytes,
    )
        .into_response())
}

/// Splits an esm.sh-style request path into its `(Package, Target)`,
/// decoding an embedded `X-`-prefixed alias+deps segment into the returned
/// descriptor fields when present.
///
/// Grammar (§3 of the URL layout): an optional leading `v{buildVersion}`
/// segment, the package name+version+submodule segments, an optional
/// `X-<base64>` alias/deps segment, a build-target segment, and any
/// remaining submodule segments. Every segment that is neither the version
/// prefix, the alias segment, nor a valid [`Target`] is treated as part of
/// the package pathname, in the order it appears.
fn parse_request_path(
    path: &str,
    pins: &std::collections::BTreeMap<String, String>,
) -> Result<(Package, Target, std::collections::BTreeMap<String, String>, cdn_core::DepsSet), String> {
    let segments: Vec<&str> = path.trim_matches('/').split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return Err("empty request path".to_string());
    }

    let mut pkg_segments: Vec<&str> = Vec::new();
    let mut alias_segment: Option<&str> = None;
    let mut target: Option<Target> = None;

    for (i, seg) in segments.iter().enumerate() {
        if i == 0 && is_version_prefix(seg) {
            continue;
        }
        if target.is_none() && seg.starts_with(cdn_core::codec::PREFIX) {
            alias_segment = Some(seg);
            continue;
        }
        if target.is_none() {
            if let Ok(t) = seg.parse::<Target>() {
                target = Some(t);
                continue;
            }
        }
        pkg_segments.push(seg);
    }

    let target = target.ok_or_else(|| "request path is missing a build target segment".to_string())?;
    let pkg_pathname = pkg_segments.join("/");
    let package = Package::parse(&pkg_pathname, pins).map_err(|e| e.to_string())?;

    let (alias, deps) = match alias_segment {
        Some(segment) => match cdn_core::decode(segment) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(target: "cdn.daemon", segment, error = %e, "ignoring malformed alias/deps segment");
                (std::collections::BTreeMap::new(), cdn_core::DepsSet::new())
            }
        },
        None => (std::collections::BTreeMap::new(), cdn_core::DepsSet::new()),
    };

    Ok((package, target, alias, deps))
}

fn is_version_prefix(segment: &str) -> bool {
    segment.len() > 1 && segment.starts_with('v') && segment[1..].chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn parses_plain_package_and_target() {
        let (pkg, target, _, _) = parse_request_path("/react@18.2.0/es2022/react.js", &BTreeMap::new()).unwrap();
        assert_eq!(pkg.name, "react");
        assert_eq!(pkg.version, "18.2.0");
        assert_eq!(target, Target::Es2022);
    }

    #[test]
    fn strips_leading_build_version_segment() {
        let (pkg, target, _, _) = parse_request_path("/v136/left-pad@1.3.0/es2022", &BTreeMap::new()).unwrap();
        assert_eq!(pkg.name, "left-pad");
        assert_eq!(target, Target::Es2022);
    }

    #[test]
    fn keeps_submodule_segments_after_target() {
        let (pkg, target, _, _) = parse_request_path("/@scope/pkg@1.0.0/es2022/sub/path.js", &BTreeMap::new()).unwrap();
        assert_eq!(pkg.name, "@scope/pkg");
        assert_eq!(pkg.submodule, "sub/path");
        assert_eq!(target, Target::Es2022);
    }

    #[test]
    fn tolerates_an_alias_deps_segment() {
        let mut deps = cdn_core::DepsSet::new();
        deps.insert(cdn_core::Package { name: "react".to_string(), version: "18.2.0".to_string(), submodule: String::new() });
        let alias: BTreeMap<String, String> = BTreeMap::new();
        let segment = cdn_core::encode(&alias, &deps);
        let path = format!("/react-dom@18.2.0/{segment}/es2022/react-dom.js");
        let (pkg, target, decoded_alias, decoded_deps) = parse_request_path(&path, &BTreeMap::new()).unwrap();
        assert_eq!(pkg.name, "react-dom");
        assert_eq!(target, Target::Es2022);
        assert!(decoded_alias.is_empty());
        assert_eq!(decoded_deps.get("react").map(|p| p.version.as_str()), Some("18.2.0"));
    }

    #[test]
    fn missing_target_is_rejected() {
        let err = parse_request_path("/react@18.2.0", &BTreeMap::new()).unwrap_err();
        assert!(err.contains("build target"));
    }
}
