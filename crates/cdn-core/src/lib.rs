// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! Stable data model for the CDN build service.
//!
//! This crate has no I/O and no async runtime dependency: every type here is
//! plain data, and [`fingerprint::fingerprint`] is a pure function. Every
//! other crate in the workspace depends on this one; it depends on nothing
//! in the workspace.

/// `X-`-prefixed alias+deps URL segment codec.
pub mod codec;
/// Fixed lookup tables consulted by the resolver and rewriter.
pub mod constants;
/// [`BuildDescriptor`] and [`DepsSet`].
pub mod descriptor;
/// The canonical build-ID derivation.
pub mod fingerprint;
/// Per-artifact persisted metadata and the externals collection.
pub mod meta;
/// [`Package`] identity and its registry-path parser.
pub mod package;
/// The closed output-target enumeration.
pub mod target;

pub use codec::{decode, encode, fix_alias_deps, CodecError};
pub use descriptor::{BuildDescriptor, DepsSet};
pub use fingerprint::fingerprint;
pub use meta::{ExternalRef, ModuleMeta};
pub use package::{Package, PackageParseError};
pub use target::{Target, UnknownTarget};
