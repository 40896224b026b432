//! Unified error taxonomy for the CDN build service.
//!
//! Every [`CdnError`] carries a stable [`ErrorKind`], a `stage` tag
//! identifying which pipeline stage raised it (`install`, `init`, `build`,
//! `transform-dts`, ...), a human-readable message, an optional cause
//! chain, and arbitrary key-value context. Use the builder returned by
//! [`CdnError::new`] to construct errors fluently.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// The closed set of ways a build can fail.
///
/// Unlike a typical code/category split, `ErrorKind` *is* the category here:
/// the pipeline's failure modes are few enough that a flat enum is the
/// whole taxonomy, with [`CdnError::stage`] supplying the finer-grained
/// "where" that a sub-code would otherwise carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed package specifier, invalid `deps` query, or unknown build
    /// target. Reported; never retried.
    Invalid,
    /// The resolver reports no such package or version. Reported.
    PackageNotFound,
    /// Network or install failure within the retry budget. Retried (3x,
    /// 100ms pause) at the component level.
    Transient,
    /// The bundler cannot resolve a non-self specifier. Recovered by
    /// growing `forceExternal` and re-running; exhausting the retry budget
    /// escalates to [`ErrorKind::BuildFailed`].
    UnresolvedExternal,
    /// The bundler returned a non-recoverable error. Reported.
    BuildFailed,
    /// A consumer-side wait deadline expired. Synthesized only at the
    /// consumer/daemon boundary; never raised by the build task itself, and
    /// never aborts the underlying build.
    Timeout,
    /// `FS`/`DB` write failure. Reported; any partial state is tolerated
    /// because `FS` always leads `DB`.
    Fatal,
}

impl ErrorKind {
    /// `true` if a failure of this kind is, in principle, worth retrying at
    /// the component level rather than surfacing immediately.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::UnresolvedExternal)
    }

    /// Stable `&'static str` representation (e.g. `"package_not_found"`).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Invalid => "invalid",
            ErrorKind::PackageNotFound => "package_not_found",
            ErrorKind::Transient => "transient",
            ErrorKind::UnresolvedExternal => "unresolved_external",
            ErrorKind::BuildFailed => "build_failed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Fatal => "fatal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// CdnError
// ---------------------------------------------------------------------------

/// Unified build-service error.
///
/// Carries a stable [`ErrorKind`], a `stage` tag, a human-readable message,
/// an optional source error for cause-chaining, and arbitrary structured
/// context.
///
/// # Builder usage
///
/// ```
/// use cdn_error::{CdnError, ErrorKind};
///
/// let err = CdnError::new(ErrorKind::Transient, "install", "yarn add failed")
///     .with_context("pkg", "lodash@4.17.21")
///     .with_context("attempt", 2);
/// ```
pub struct CdnError {
    /// Machine-readable error kind.
    pub kind: ErrorKind,
    /// Pipeline stage that raised the error (`install`, `init`, `build`,
    /// `transform-dts`, ...), for observability.
    pub stage: String,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl CdnError {
    /// Create a new error with the given kind, stage tag, and message.
    pub fn new(kind: ErrorKind, stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            stage: stage.into(),
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// The value is converted via [`serde_json::to_value`]; if serialisation
    /// fails, the entry is silently skipped.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// `true` if this error is worth retrying at the component level.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl fmt::Debug for CdnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("CdnError");
        d.field("kind", &self.kind);
        d.field("stage", &self.stage);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for CdnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} @ {}] {}", self.kind, self.stage, self.message)?;
        if !self.context.is_empty() {
            // Deterministic output thanks to BTreeMap.
            if let Ok(ctx) = serde_json::to_string(&self.context) {
                write!(f, " {ctx}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for CdnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<cdn_core::PackageParseError> for CdnError {
    fn from(err: cdn_core::PackageParseError) -> Self {
        CdnError::new(ErrorKind::Invalid, "init", err.to_string()).with_source(err)
    }
}

impl From<cdn_core::CodecError> for CdnError {
    fn from(err: cdn_core::CodecError) -> Self {
        CdnError::new(ErrorKind::Invalid, "init", err.to_string()).with_source(err)
    }
}

// ---------------------------------------------------------------------------
// Serialization support
// ---------------------------------------------------------------------------

/// Serialisable snapshot of a [`CdnError`] (without the opaque source),
/// suitable for the HTTP error body or a module body `throw`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CdnErrorDto {
    /// Error kind.
    pub kind: ErrorKind,
    /// Pipeline stage tag.
    pub stage: String,
    /// Human-readable message.
    pub message: String,
    /// Structured context.
    pub context: BTreeMap<String, serde_json::Value>,
    /// String representation of the source error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_message: Option<String>,
}

impl From<&CdnError> for CdnErrorDto {
    fn from(err: &CdnError) -> Self {
        Self {
            kind: err.kind,
            stage: err.stage.clone(),
            message: err.message.clone(),
            context: err.context.clone(),
            source_message: err.source.as_ref().map(|s| s.to_string()),
        }
    }
}

impl From<CdnErrorDto> for CdnError {
    fn from(dto: CdnErrorDto) -> Self {
        Self {
            kind: dto.kind,
            stage: dto.stage,
            message: dto.message,
            source: None,
            context: dto.context,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    const ALL_KINDS: &[ErrorKind] = &[
        ErrorKind::Invalid,
        ErrorKind::PackageNotFound,
        ErrorKind::Transient,
        ErrorKind::UnresolvedExternal,
        ErrorKind::BuildFailed,
        ErrorKind::Timeout,
        ErrorKind::Fatal,
    ];

    #[test]
    fn basic_construction() {
        let err = CdnError::new(ErrorKind::Fatal, "build", "boom");
        assert_eq!(err.kind, ErrorKind::Fatal);
        assert_eq!(err.stage, "build");
        assert_eq!(err.message, "boom");
        assert!(err.source.is_none());
        assert!(err.context.is_empty());
    }

    #[test]
    fn display_includes_kind_and_stage() {
        let err = CdnError::new(ErrorKind::PackageNotFound, "init", "no such version");
        assert_eq!(err.to_string(), "[package_not_found @ init] no such version");
    }

    #[test]
    fn display_with_context() {
        let err = CdnError::new(ErrorKind::Transient, "install", "timed out")
            .with_context("attempt", 2);
        let s = err.to_string();
        assert!(s.starts_with("[transient @ install] timed out"));
        assert!(s.contains("attempt"));
    }

    #[test]
    fn retryability_matches_spec() {
        assert!(ErrorKind::Transient.is_retryable());
        assert!(ErrorKind::UnresolvedExternal.is_retryable());
        assert!(!ErrorKind::Fatal.is_retryable());
        assert!(!ErrorKind::Invalid.is_retryable());
        assert!(!ErrorKind::Timeout.is_retryable());
    }

    #[test]
    fn builder_with_source() {
        let src = io::Error::new(io::ErrorKind::NotFound, "manifest missing");
        let err = CdnError::new(ErrorKind::Transient, "install", "install failed").with_source(src);
        assert!(err.source.is_some());
        assert_eq!(err.source.as_ref().unwrap().to_string(), "manifest missing");
    }

    #[test]
    fn std_error_source_chain() {
        let inner = io::Error::new(io::ErrorKind::NotFound, "not found");
        let err = CdnError::new(ErrorKind::Fatal, "build", "write failed").with_source(inner);
        let src = std::error::Error::source(&err).unwrap();
        assert_eq!(src.to_string(), "not found");
    }

    #[test]
    fn error_kind_serde_roundtrip() {
        let kind = ErrorKind::UnresolvedExternal;
        let json = serde_json::to_string(&kind).unwrap();
        assert_eq!(json, r#""unresolved_external""#);
        let back: ErrorKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, kind);
    }

    #[test]
    fn dto_roundtrip_without_source() {
        let err = CdnError::new(ErrorKind::BuildFailed, "build", "could not resolve")
            .with_context("specifier", "left-pad");
        let dto: CdnErrorDto = (&err).into();
        let json = serde_json::to_string(&dto).unwrap();
        let back: CdnErrorDto = serde_json::from_str(&json).unwrap();
        assert_eq!(dto, back);
        assert!(back.source_message.is_none());
    }

    #[test]
    fn dto_roundtrip_with_source() {
        let src = io::Error::new(io::ErrorKind::BrokenPipe, "pipe broke");
        let err = CdnError::new(ErrorKind::Fatal, "build", "crash").with_source(src);
        let dto: CdnErrorDto = (&err).into();
        assert_eq!(dto.source_message.as_deref(), Some("pipe broke"));
    }

    #[test]
    fn all_kinds_have_unique_as_str() {
        let mut seen = std::collections::HashSet::new();
        for kind in ALL_KINDS {
            assert!(seen.insert(kind.as_str()));
        }
        assert_eq!(seen.len(), ALL_KINDS.len());
    }

    #[test]
    fn all_kinds_display_matches_as_str() {
        for kind in ALL_KINDS {
            assert_eq!(kind.to_string(), kind.as_str());
        }
    }

    #[test]
    fn from_package_parse_error_tags_invalid() {
        let err: CdnError =
            cdn_core::PackageParseError::InvalidName("@@".to_string()).into();
        assert_eq!(err.kind, ErrorKind::Invalid);
        assert_eq!(err.stage, "init");
    }

    #[test]
    fn context_with_nested_json() {
        let err = CdnError::new(ErrorKind::Invalid, "init", "bad target")
            .with_context("got", serde_json::json!({"target": "es6"}));
        assert_eq!(err.context["got"], serde_json::json!({"target": "es6"}));
    }
}
