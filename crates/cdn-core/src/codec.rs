//! [`encode`]/[`decode`]: the `alias+deps` prefix segment embedded in build
//! URLs (`.../v136/pkg@1.0.0/X-<segment>/es2022/pkg.js`), plus
//! [`fix_alias_deps`], the canonicalization pass every descriptor goes
//! through before fingerprinting.

use std::collections::BTreeMap;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crate::descriptor::DepsSet;
use crate::package::{Package, PackageParseError};

/// The discriminator prefix distinguishing an alias+deps segment from a
/// build-target path segment (`es2022`, `deno`, ...).
pub const PREFIX: &str = "X-";

/// Errors raised decoding a previously-encoded alias+deps segment.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CodecError {
    /// The segment did not begin with [`PREFIX`].
    #[error("segment is missing the '{PREFIX}' discriminator prefix")]
    MissingPrefix,
    /// The segment body was not valid URL-safe base64.
    #[error("segment body is not valid base64: {0}")]
    InvalidBase64(String),
    /// The decoded bytes were not valid UTF-8.
    #[error("decoded segment is not valid UTF-8")]
    InvalidUtf8,
    /// A dependency entry did not parse as `name@version[/submodule]`.
    #[error("invalid dependency entry: {0}")]
    InvalidDependency(#[from] PackageParseError),
}

/// Encodes `alias` and `deps` into a URL-safe segment. Returns the empty
/// string (no trailing slash in the URL) when both are empty.
#[must_use]
pub fn encode(alias: &BTreeMap<String, String>, deps: &DepsSet) -> String {
    if alias.is_empty() && deps.is_empty() {
        return String::new();
    }
    let canonical = canonical_string(alias, deps);
    format!("{PREFIX}{}", URL_SAFE_NO_PAD.encode(canonical.as_bytes()))
}

/// Inverse of [`encode`]. `decode(encode(a, d)) == (a, d)` for already
/// canonical `(a, d)` — see the `codec round-trip` property test.
///
/// # Errors
///
/// Returns [`CodecError`] if the segment is malformed.
pub fn decode(segment: &str) -> Result<(BTreeMap<String, String>, DepsSet), CodecError> {
    let body = segment.strip_prefix(PREFIX).ok_or(CodecError::MissingPrefix)?;
    let bytes = URL_SAFE_NO_PAD
        .decode(body)
        .map_err(|e| CodecError::InvalidBase64(e.to_string()))?;
    let canonical = String::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)?;

    let (alias_part, deps_part) = canonical.split_once('|').unwrap_or((canonical.as_str(), ""));

    let mut alias = BTreeMap::new();
    if !alias_part.is_empty() {
        for entry in alias_part.split(',') {
            if let Some((k, v)) = entry.split_once(':') {
                alias.insert(k.to_string(), v.to_string());
            }
        }
    }

    let mut packages = Vec::new();
    if !deps_part.is_empty() {
        for entry in deps_part.split(',') {
            packages.push(Package::parse(entry, &BTreeMap::new())?);
        }
    }

    Ok((alias, DepsSet::from_packages(packages)))
}

/// Drops alias/deps entries that reference `current_pkg_name` itself — a
/// package cannot alias or pin itself — and returns the canonicalized pair.
/// Must run before [`crate::fingerprint::fingerprint`].
#[must_use]
pub fn fix_alias_deps(
    alias: BTreeMap<String, String>,
    deps: DepsSet,
    current_pkg_name: &str,
) -> (BTreeMap<String, String>, DepsSet) {
    let alias = alias
        .into_iter()
        .filter(|(from, to)| from != current_pkg_name && to != current_pkg_name)
        .collect();
    let deps = DepsSet::from_packages(deps.iter().filter(|pkg| pkg.name != current_pkg_name).cloned());
    (alias, deps)
}

fn canonical_string(alias: &BTreeMap<String, String>, deps: &DepsSet) -> String {
    let alias_part = alias
        .iter()
        .map(|(k, v)| format!("{k}:{v}"))
        .collect::<Vec<_>>()
        .join(",");
    format!("{alias_part}|{deps}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkg(name: &str, version: &str) -> Package {
        Package { name: name.to_string(), version: version.to_string(), submodule: String::new() }
    }

    #[test]
    fn empty_inputs_encode_to_empty_segment() {
        assert_eq!(encode(&BTreeMap::new(), &DepsSet::new()), "");
    }

    #[test]
    fn round_trips_alias_and_deps() {
        let mut alias = BTreeMap::new();
        alias.insert("foo".to_string(), "bar".to_string());
        let deps = DepsSet::from_packages([pkg("react", "18.2.0"), pkg("react-dom", "18.2.0")]);

        let segment = encode(&alias, &deps);
        assert!(segment.starts_with(PREFIX));
        let (decoded_alias, decoded_deps) = decode(&segment).unwrap();
        assert_eq!(decoded_alias, alias);
        assert_eq!(decoded_deps, deps);
    }

    #[test]
    fn decode_rejects_missing_prefix() {
        assert!(matches!(decode("not-a-segment"), Err(CodecError::MissingPrefix)));
    }

    #[test]
    fn fix_alias_deps_drops_self_references() {
        let mut alias = BTreeMap::new();
        alias.insert("lodash".to_string(), "lodash-es".to_string());
        alias.insert("self-pkg".to_string(), "x".to_string());
        let deps = DepsSet::from_packages([pkg("self-pkg", "1.0.0"), pkg("lodash", "4.17.21")]);

        let (alias, deps) = fix_alias_deps(alias, deps, "self-pkg");
        assert!(!alias.contains_key("self-pkg"));
        assert!(alias.contains_key("lodash"));
        assert!(!deps.contains("self-pkg"));
        assert!(deps.contains("lodash"));
    }

    proptest::proptest! {
        #[test]
        fn round_trip_holds_for_arbitrary_non_self_inputs(
            names in proptest::collection::vec("[a-z][a-z0-9]{0,8}", 0..4),
        ) {
            let deps = DepsSet::from_packages(names.iter().map(|n| pkg(n, "1.0.0")));
            let segment = encode(&BTreeMap::new(), &deps);
            let (_, decoded) = decode(&segment).unwrap();
            proptest::prop_assert_eq!(decoded, deps);
        }
    }
}
