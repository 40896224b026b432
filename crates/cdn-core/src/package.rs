//! [`Package`]: the immutable `(name, version, submodule)` identity that
//! anchors every other type in this crate.

use std::collections::BTreeMap;
use std::fmt;

/// Maximum byte length of an npm package name or scope, per
/// <https://github.com/npm/validate-npm-package-name>.
pub const MAX_NAME_LEN: usize = 214;

/// Errors raised while parsing a package specifier out of a request path.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum PackageParseError {
    /// The path was empty after trimming slashes.
    #[error("empty package specifier")]
    Empty,
    /// A scope or package name exceeded [`MAX_NAME_LEN`] or used disallowed
    /// characters.
    #[error("invalid package name '{0}'")]
    InvalidName(String),
}

/// An immutable package identity: `name`, resolved `version`, and an
/// optional `submodule` sub-path.
///
/// Equality is triple-equality on the three fields. [`Package::parse`]
/// performs the registry-path grammar (scope splitting, name/version
/// splitting on the last `@`); it does not itself resolve an unpinned
/// version spec against the registry — that is [`crate::DepsSet`]'s and
/// `cdn-registry`'s job.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct Package {
    /// Package name, including a leading `@scope/` if scoped.
    pub name: String,
    /// Fully-resolved three-part version string.
    pub version: String,
    /// Slash-path relative to the package root, with no trailing `.js`.
    /// Empty string means "the package root".
    pub submodule: String,
}

impl Package {
    /// Parses a registry path like `@scope/name@version/sub/path.js` (or any
    /// prefix thereof) into a [`Package`], applying `pins` (a name →
    /// site-policy version override table, e.g. a forced `react` major) to
    /// the resolved name before version parsing.
    ///
    /// The returned version is NOT guaranteed fully-resolved: if the path
    /// segment after `@` is not already a full three-part version, the
    /// caller (`cdn-registry::PackageResolver`) is responsible for resolving
    /// it against the registry and overwriting [`Package::version`].
    ///
    /// # Errors
    ///
    /// Returns [`PackageParseError`] if the path is empty or the scope/name
    /// fails npm's naming grammar.
    pub fn parse(pathname: &str, pins: &BTreeMap<String, String>) -> Result<Self, PackageParseError> {
        let trimmed = pathname.trim_matches('/');
        if trimmed.is_empty() {
            return Err(PackageParseError::Empty);
        }
        let segments: Vec<&str> = trimmed.split('/').map(str::trim).collect();

        let (scope, package_name, submodule_segments) = if segments[0].starts_with('@') && segments.len() > 1 {
            (Some(&segments[0][1..]), segments[1], &segments[2..])
        } else {
            (None, segments[0], &segments[1..])
        };

        if let Some(scope) = scope {
            if scope.len() > MAX_NAME_LEN || !is_valid_npm_name(scope) {
                return Err(PackageParseError::InvalidName(scope.to_string()));
            }
        }

        let (bare_name, version_spec) = split_name_version(package_name);
        if bare_name.is_empty() || bare_name.len() > MAX_NAME_LEN || !is_valid_npm_name(bare_name) {
            return Err(PackageParseError::InvalidName(bare_name.to_string()));
        }

        let name = match scope {
            Some(scope) => format!("@{scope}/{bare_name}"),
            None => bare_name.to_string(),
        };

        let version = pins.get(&name).cloned().unwrap_or_else(|| version_spec.to_string());
        let submodule = submodule_segments
            .join("/")
            .strip_suffix(".js")
            .map(str::to_string)
            .unwrap_or_else(|| submodule_segments.join("/"));

        Ok(Package { name, version, submodule })
    }

    /// The import path a bundler would use to reach this package or
    /// submodule (no version).
    #[must_use]
    pub fn import_path(&self) -> String {
        if self.submodule.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.name, self.submodule)
        }
    }
}

impl fmt::Display for Package {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)?;
        if !self.submodule.is_empty() {
            write!(f, "/{}", self.submodule)?;
        }
        Ok(())
    }
}

/// Splits `s` on the last `@`, treating a leading `@` (already stripped by
/// the caller for scopes) as part of the name rather than a separator.
fn split_name_version(s: &str) -> (&str, &str) {
    match s.rfind('@') {
        Some(idx) if idx > 0 => (&s[..idx], &s[idx + 1..]),
        _ => (s, ""),
    }
}

/// A conservative version of npm's `validate-npm-package-name` charset
/// check: lowercase alphanumerics, `.`, `_`, `-`, not starting with `.` or
/// `_` or `-`.
fn is_valid_npm_name(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    let mut chars = name.chars();
    let first = chars.next().unwrap();
    if first == '.' || first == '_' || first == '-' {
        return false;
    }
    name.chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pins() -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    #[test]
    fn parses_unscoped_name_version() {
        let pkg = Package::parse("lodash@4.17.21", &pins()).unwrap();
        assert_eq!(pkg.name, "lodash");
        assert_eq!(pkg.version, "4.17.21");
        assert_eq!(pkg.submodule, "");
    }

    #[test]
    fn parses_scoped_name_with_submodule() {
        let pkg = Package::parse("@babel/core@7.23.0/lib/index.js", &pins()).unwrap();
        assert_eq!(pkg.name, "@babel/core");
        assert_eq!(pkg.version, "7.23.0");
        assert_eq!(pkg.submodule, "lib/index");
    }

    #[test]
    fn missing_version_spec_defaults_to_empty() {
        let pkg = Package::parse("react", &pins()).unwrap();
        assert_eq!(pkg.name, "react");
        assert_eq!(pkg.version, "");
    }

    #[test]
    fn pin_policy_overrides_version_spec() {
        let mut pins = pins();
        pins.insert("react".to_string(), "18".to_string());
        let pkg = Package::parse("react@17.0.2", &pins).unwrap();
        assert_eq!(pkg.version, "18");
    }

    #[test]
    fn rejects_empty_path() {
        assert_eq!(Package::parse("///", &pins()), Err(PackageParseError::Empty));
    }

    #[test]
    fn rejects_overlong_name() {
        let long = "a".repeat(MAX_NAME_LEN + 1);
        assert!(matches!(
            Package::parse(&long, &pins()),
            Err(PackageParseError::InvalidName(_))
        ));
    }

    #[test]
    fn display_round_trips_through_import_path() {
        let pkg = Package {
            name: "@scope/pkg".to_string(),
            version: "1.2.3".to_string(),
            submodule: "sub/mod".to_string(),
        };
        assert_eq!(pkg.to_string(), "@scope/pkg@1.2.3/sub/mod");
        assert_eq!(pkg.import_path(), "@scope/pkg/sub/mod");
    }

    #[test]
    fn identity_equality_is_triple_equality() {
        let a = Package { name: "x".into(), version: "1.0.0".into(), submodule: String::new() };
        let b = Package { name: "x".into(), version: "1.0.0".into(), submodule: String::new() };
        let c = Package { name: "x".into(), version: "1.0.1".into(), submodule: String::new() };
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
