//! [`fingerprint`]: the pure function deriving a canonical build ID — the
//! cache key for both `FS` and `DB` — from a [`BuildDescriptor`].

use crate::codec;
use crate::descriptor::BuildDescriptor;
use crate::target::Target;

/// Derives the canonical build ID for `desc`.
///
/// Grammar: `v{buildVersion}/{name}@{version}/[{codec}/]{target}/{leaf}{flags}[.js]`
/// where `leaf` is the submodule if present, else the basename of the
/// package name, `flags` is the fixed-order suffix chain
/// `.nr.kn.ia.development.bundle` (only booleans that are set contribute),
/// and the trailing `.js` is dropped for `target == Target::Types`.
///
/// Pure and total: no clock, no host nonce, no I/O. `desc` is canonicalized
/// internally (alias/deps sorted, self-references dropped) so two
/// descriptors that are equivalent modulo canonicalization fingerprint
/// identically.
#[must_use]
pub fn fingerprint(desc: &BuildDescriptor) -> String {
    let canon = desc.canonicalize();
    let codec_segment = codec::encode(&canon.alias, &canon.deps);

    let leaf = if canon.package.submodule.is_empty() {
        basename(&canon.package.name)
    } else {
        canon.package.submodule.clone()
    };

    let mut parts = vec![
        format!("v{}", canon.build_version),
        format!("{}@{}", canon.package.name, canon.package.version),
    ];
    if !codec_segment.is_empty() {
        parts.push(codec_segment);
    }
    parts.push(canon.target.to_string());

    let ext = if canon.target == Target::Types { "" } else { ".js" };
    parts.push(format!("{leaf}{}{ext}", flag_suffix(&canon)));

    parts.join("/")
}

/// Basename of a (possibly scoped) package name: the part after the last
/// `/`, so `@scope/name` yields `name`.
fn basename(name: &str) -> String {
    name.rsplit('/').next().unwrap_or(name).to_string()
}

/// Flag suffix in the fixed tie-break order `nr, kn, ia, development, bundle`.
fn flag_suffix(desc: &BuildDescriptor) -> String {
    let mut s = String::new();
    if desc.no_require {
        s.push_str(".nr");
    }
    if desc.keep_names {
        s.push_str(".kn");
    }
    if desc.ignore_annotations {
        s.push_str(".ia");
    }
    if desc.dev_mode {
        s.push_str(".development");
    }
    if desc.bundle_mode {
        s.push_str(".bundle");
    }
    s
}
