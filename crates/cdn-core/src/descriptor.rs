//! [`BuildDescriptor`]: the canonical input to the build pipeline, plus
//! [`DepsSet`], the ordered dependency-pin collection it carries.

use std::collections::BTreeMap;
use std::fmt;

use crate::package::Package;
use crate::target::Target;

/// An ordered, deduplicated-by-name collection of pinned [`Package`]s,
/// canonically sorted by string form.
///
/// [`DepsSet::contains`] checks membership by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DepsSet(Vec<Package>);

impl DepsSet {
    /// An empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a canonically-sorted set from an arbitrary iterator, keeping
    /// the first occurrence of each package name.
    pub fn from_packages(packages: impl IntoIterator<Item = Package>) -> Self {
        let mut seen = std::collections::BTreeSet::new();
        let mut out = Vec::new();
        for pkg in packages {
            if seen.insert(pkg.name.clone()) {
                out.push(pkg);
            }
        }
        out.sort_by(|a, b| a.to_string().cmp(&b.to_string()));
        Self(out)
    }

    /// Inserts `pkg`, replacing any existing pin for the same name, and
    /// re-sorts. No-op if an identical entry is already present.
    pub fn insert(&mut self, pkg: Package) {
        self.0.retain(|existing| existing.name != pkg.name);
        self.0.push(pkg);
        self.0.sort_by(|a, b| a.to_string().cmp(&b.to_string()));
    }

    /// `true` if a pin for `name` exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|pkg| pkg.name == name)
    }

    /// Looks up the pinned [`Package`] for `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Package> {
        self.0.iter().find(|pkg| pkg.name == name)
    }

    /// Iterates the pins in canonical order.
    pub fn iter(&self) -> std::slice::Iter<'_, Package> {
        self.0.iter()
    }

    /// Number of pins.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// `true` if no pins are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for DepsSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self.0.iter().map(Package::to_string).collect::<Vec<_>>().join(",");
        f.write_str(&joined)
    }
}

impl<'a> IntoIterator for &'a DepsSet {
    type Item = &'a Package;
    type IntoIter = std::slice::Iter<'a, Package>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// The validated, immutable input to the build pipeline.
///
/// `work_dir` and `stage` are transient observability state, mutated only by
/// the orchestrator after construction; they are deliberately excluded from
/// [`crate::fingerprint`] and from equality-for-canonicalization purposes.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BuildDescriptor {
    pub package: Package,
    /// Monotonic service-wide schema counter; bumping it invalidates prior
    /// artifacts without touching their bytes.
    pub build_version: i32,
    /// Request-specifier to replacement-specifier substitutions.
    pub alias: BTreeMap<String, String>,
    /// Pinned dependency versions, canonically sorted.
    pub deps: DepsSet,
    pub target: Target,
    pub dev_mode: bool,
    pub bundle_mode: bool,
    pub no_require: bool,
    pub keep_names: bool,
    pub ignore_annotations: bool,
    /// Working directory path, assigned by the orchestrator on first need.
    #[serde(skip)]
    pub work_dir: Option<String>,
    /// Current pipeline stage, for log/error tagging only.
    #[serde(skip)]
    pub stage: Option<String>,
}

impl BuildDescriptor {
    /// Constructs a descriptor with every transient/boolean field at its
    /// default, for tests and for CLI single-build invocations.
    #[must_use]
    pub fn new(package: Package, build_version: i32, target: Target) -> Self {
        Self {
            package,
            build_version,
            alias: BTreeMap::new(),
            deps: DepsSet::new(),
            target,
            dev_mode: false,
            bundle_mode: false,
            no_require: false,
            keep_names: false,
            ignore_annotations: false,
            work_dir: None,
            stage: None,
        }
    }

    /// Returns a copy with `alias`/`deps` canonicalized via
    /// [`crate::codec::fix_alias_deps`] and `work_dir`/`stage` cleared —
    /// the form that two otherwise-equivalent requests must agree on before
    /// fingerprinting (spec invariant: equivalent descriptors under
    /// canonicalization yield equal fingerprints).
    #[must_use]
    pub fn canonicalize(&self) -> Self {
        let (alias, deps) = crate::codec::fix_alias_deps(self.alias.clone(), self.deps.clone(), &self.package.name);
        Self { alias, deps, work_dir: None, stage: None, ..self.clone() }
    }
}
