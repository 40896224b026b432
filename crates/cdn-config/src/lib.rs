// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration loading, validation, and merging for the CDN build service.
//!
//! This crate provides [`BuildServiceConfig`] — the top-level runtime
//! settings — together with helpers for loading from TOML files, merging
//! overlays, and producing advisory [`ConfigWarning`]s. The ambiguous
//! site-policy version pins (`react`, `react-dom`, `@microsoft/fast-element`)
//! live here as [`PinPolicy`] data, not code, so they can be revised without
//! a rebuild.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Warnings
// ---------------------------------------------------------------------------

/// Advisory-level issues that do not prevent operation but deserve attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// `cdn_origin` has no URL scheme; relative rewriting may misbehave.
    OriginMissingScheme {
        /// The configured origin value.
        origin: String,
    },
    /// A recommended optional field is missing.
    MissingOptionalField {
        /// Name of the missing field.
        field: String,
        /// Why it matters.
        hint: String,
    },
    /// `worker_concurrency` is unusually large for a single node.
    LargeWorkerConcurrency {
        /// Configured value.
        value: usize,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::OriginMissingScheme { origin } => {
                write!(f, "cdn_origin '{origin}' has no scheme")
            }
            ConfigWarning::MissingOptionalField { field, hint } => {
                write!(f, "missing optional field '{field}': {hint}")
            }
            ConfigWarning::LargeWorkerConcurrency { value } => {
                write!(f, "worker_concurrency is unusually large ({value})")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Top-level runtime configuration for the build service.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct BuildServiceConfig {
    /// Size of the [`BuildQueue`](cdn_core) worker pool — the number of
    /// fingerprints that can be built in parallel.
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    /// Service-wide schema counter embedded in every fingerprint.
    #[serde(default = "default_build_version")]
    pub build_version: i32,

    /// Origin this service is served from, used to build absolute CDN URLs
    /// for sub-build references.
    #[serde(default = "default_cdn_origin")]
    pub cdn_origin: String,

    /// Deno standard-library version pinned for `std/node/...` rewrites.
    #[serde(default = "default_deno_std_version")]
    pub deno_std_version: String,

    /// Maximum attempts for a package install before giving up.
    #[serde(default = "default_install_max_attempts")]
    pub install_max_attempts: u32,

    /// Pause between install attempts, in milliseconds.
    #[serde(default = "default_install_retry_pause_ms")]
    pub install_retry_pause_ms: u64,

    /// Wall-clock deadline, in seconds, a request waits for an in-flight or
    /// queued build before detaching with a `Timeout`.
    #[serde(default = "default_consumer_timeout_secs")]
    pub consumer_timeout_secs: u64,

    /// Site-policy version pins applied during package-specifier parsing.
    #[serde(default)]
    pub pins: PinPolicy,
}

impl Default for BuildServiceConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: default_worker_concurrency(),
            build_version: default_build_version(),
            cdn_origin: default_cdn_origin(),
            deno_std_version: default_deno_std_version(),
            install_max_attempts: default_install_max_attempts(),
            install_retry_pause_ms: default_install_retry_pause_ms(),
            consumer_timeout_secs: default_consumer_timeout_secs(),
            pins: PinPolicy::default(),
        }
    }
}

/// Site-policy version pins: a request for an unpinned version of one of
/// these packages is silently redirected to the configured version.
///
/// Defaults pin `react`/`react-dom` to major version `18` and carry an
/// experimental pin for `@microsoft/fast-element`; kept here as data so a
/// future policy change does not require touching
/// [`cdn_core::Package::parse`].
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct PinPolicy {
    /// Package name → pinned version-spec map.
    #[serde(flatten)]
    pub pins: BTreeMap<String, String>,
}

impl Default for PinPolicy {
    fn default() -> Self {
        let mut pins = BTreeMap::new();
        pins.insert("react".to_string(), "18".to_string());
        pins.insert("react-dom".to_string(), "18".to_string());
        pins.insert("@microsoft/fast-element".to_string(), "2".to_string());
        Self { pins }
    }
}

impl PinPolicy {
    /// Converts to the plain `name -> version` map [`cdn_core::Package::parse`]
    /// expects, decoupling the core data model from this crate.
    #[must_use]
    pub fn as_map(&self) -> BTreeMap<String, String> {
        self.pins.clone()
    }
}

fn default_worker_concurrency() -> usize {
    8
}
fn default_build_version() -> i32 {
    cdn_core::constants::VERSION
}
fn default_cdn_origin() -> String {
    "https://esm.sh".to_string()
}
fn default_deno_std_version() -> String {
    "0.177.0".to_string()
}
fn default_install_max_attempts() -> u32 {
    3
}
fn default_install_retry_pause_ms() -> u64 {
    100
}
fn default_consumer_timeout_secs() -> u64 {
    60
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load a [`BuildServiceConfig`] from an optional TOML file path.
///
/// * If `path` is `Some`, reads and parses the file.
/// * If `path` is `None`, returns [`BuildServiceConfig::default()`].
///
/// Environment variable overrides are applied on top in both cases.
///
/// # Errors
///
/// Returns [`ConfigError::FileNotFound`] or [`ConfigError::ParseError`].
pub fn load_config(path: Option<&Path>) -> Result<BuildServiceConfig, ConfigError> {
    let mut config = match path {
        Some(p) => {
            let content = std::fs::read_to_string(p)
                .map_err(|_| ConfigError::FileNotFound { path: p.display().to_string() })?;
            parse_toml(&content)?
        }
        None => BuildServiceConfig::default(),
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Parse a TOML string into a [`BuildServiceConfig`].
///
/// # Errors
///
/// Returns [`ConfigError::ParseError`] if `content` is not valid TOML or
/// does not match the expected shape.
pub fn parse_toml(content: &str) -> Result<BuildServiceConfig, ConfigError> {
    toml::from_str::<BuildServiceConfig>(content).map_err(|e| ConfigError::ParseError { reason: e.to_string() })
}

// ---------------------------------------------------------------------------
// Env overrides
// ---------------------------------------------------------------------------

/// Apply environment variable overrides.
///
/// Recognised variables:
/// - `CDN_WORKER_CONCURRENCY`
/// - `CDN_BUILD_VERSION`
/// - `CDN_ORIGIN`
/// - `CDN_DENO_STD_VERSION`
pub fn apply_env_overrides(config: &mut BuildServiceConfig) {
    if let Ok(val) = std::env::var("CDN_WORKER_CONCURRENCY") {
        if let Ok(n) = val.parse() {
            config.worker_concurrency = n;
        }
    }
    if let Ok(val) = std::env::var("CDN_BUILD_VERSION") {
        if let Ok(n) = val.parse() {
            config.build_version = n;
        }
    }
    if let Ok(val) = std::env::var("CDN_ORIGIN") {
        config.cdn_origin = val;
    }
    if let Ok(val) = std::env::var("CDN_DENO_STD_VERSION") {
        config.deno_std_version = val;
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Threshold above which `worker_concurrency` generates a warning.
const LARGE_CONCURRENCY_THRESHOLD: usize = 256;

/// Validate a parsed configuration, returning advisory warnings.
///
/// Hard errors (zero concurrency, zero retry attempts, empty origin) are
/// returned as a [`ConfigError::ValidationError`]; soft issues come back as
/// warnings.
///
/// # Errors
///
/// Returns [`ConfigError::ValidationError`] if one or more hard constraints
/// are violated.
pub fn validate_config(config: &BuildServiceConfig) -> Result<Vec<ConfigWarning>, ConfigError> {
    let mut errors: Vec<String> = Vec::new();
    let mut warnings: Vec<ConfigWarning> = Vec::new();

    if config.worker_concurrency == 0 {
        errors.push("worker_concurrency must be at least 1".to_string());
    } else if config.worker_concurrency > LARGE_CONCURRENCY_THRESHOLD {
        warnings.push(ConfigWarning::LargeWorkerConcurrency { value: config.worker_concurrency });
    }

    if config.install_max_attempts == 0 {
        errors.push("install_max_attempts must be at least 1".to_string());
    }

    if config.cdn_origin.trim().is_empty() {
        errors.push("cdn_origin must not be empty".to_string());
    } else if !config.cdn_origin.contains("://") {
        warnings.push(ConfigWarning::OriginMissingScheme { origin: config.cdn_origin.clone() });
    }

    if config.deno_std_version.trim().is_empty() {
        warnings.push(ConfigWarning::MissingOptionalField {
            field: "deno_std_version".to_string(),
            hint: "deno target builds will reference an empty std version".to_string(),
        });
    }

    if errors.is_empty() {
        Ok(warnings)
    } else {
        Err(ConfigError::ValidationError { reasons: errors })
    }
}

// ---------------------------------------------------------------------------
// Merging
// ---------------------------------------------------------------------------

/// Merge two configurations. Values in `overlay` take precedence over
/// `base`; `overlay`'s pins are layered on top of `base`'s.
#[must_use]
pub fn merge_configs(base: BuildServiceConfig, overlay: BuildServiceConfig) -> BuildServiceConfig {
    let mut pins = base.pins.pins;
    pins.extend(overlay.pins.pins);
    BuildServiceConfig {
        worker_concurrency: overlay.worker_concurrency,
        build_version: overlay.build_version,
        cdn_origin: overlay.cdn_origin,
        deno_std_version: overlay.deno_std_version,
        install_max_attempts: overlay.install_max_attempts,
        install_retry_pause_ms: overlay.install_retry_pause_ms,
        consumer_timeout_secs: overlay.consumer_timeout_secs,
        pins: PinPolicy { pins },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = BuildServiceConfig::default();
        validate_config(&cfg).expect("default config should be valid");
    }

    #[test]
    fn default_config_has_sensible_defaults() {
        let cfg = BuildServiceConfig::default();
        assert_eq!(cfg.worker_concurrency, 8);
        assert_eq!(cfg.install_max_attempts, 3);
        assert_eq!(cfg.consumer_timeout_secs, 60);
    }

    #[test]
    fn default_pins_cover_react_family() {
        let cfg = BuildServiceConfig::default();
        assert_eq!(cfg.pins.pins.get("react").map(String::as_str), Some("18"));
        assert_eq!(cfg.pins.pins.get("react-dom").map(String::as_str), Some("18"));
        assert_eq!(cfg.pins.pins.get("@microsoft/fast-element").map(String::as_str), Some("2"));
    }

    #[test]
    fn parse_valid_toml_string() {
        let toml = r#"
            worker_concurrency = 16
            cdn_origin = "https://cdn.example.com"
        "#;
        let cfg = parse_toml(toml).unwrap();
        assert_eq!(cfg.worker_concurrency, 16);
        assert_eq!(cfg.cdn_origin, "https://cdn.example.com");
        // Fields absent from the TOML still take their defaults.
        assert_eq!(cfg.install_max_attempts, 3);
    }

    #[test]
    fn parse_invalid_toml_gives_parse_error() {
        let bad = "this is [not valid toml =";
        let err = parse_toml(bad).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn zero_concurrency_is_a_hard_error() {
        let mut cfg = BuildServiceConfig::default();
        cfg.worker_concurrency = 0;
        let err = validate_config(&cfg).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn missing_scheme_is_only_a_warning() {
        let mut cfg = BuildServiceConfig::default();
        cfg.cdn_origin = "cdn.example.com".to_string();
        let warnings = validate_config(&cfg).unwrap();
        assert!(warnings.contains(&ConfigWarning::OriginMissingScheme { origin: "cdn.example.com".to_string() }));
    }

    #[test]
    fn merge_overlay_wins_on_scalars_and_layers_pins() {
        let base = BuildServiceConfig::default();
        let mut overlay = BuildServiceConfig::default();
        overlay.worker_concurrency = 32;
        overlay.pins.pins.insert("left-pad".to_string(), "1.3.0".to_string());

        let merged = merge_configs(base, overlay);
        assert_eq!(merged.worker_concurrency, 32);
        assert_eq!(merged.pins.pins.get("react").map(String::as_str), Some("18"));
        assert_eq!(merged.pins.pins.get("left-pad").map(String::as_str), Some("1.3.0"));
    }

    #[test]
    fn env_overrides_apply_on_top_of_file_config() {
        // SAFETY-equivalent note: tests in this module run serially enough
        // (single-threaded by convention in this crate) that env var writes
        // don't race; still, scope the var to this test only.
        std::env::set_var("CDN_WORKER_CONCURRENCY", "4");
        let mut cfg = BuildServiceConfig::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.worker_concurrency, 4);
        std::env::remove_var("CDN_WORKER_CONCURRENCY");
    }
}
