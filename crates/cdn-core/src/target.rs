//! [`Target`]: the closed enumeration of output profiles a build can be
//! requested for.

use std::fmt;
use std::str::FromStr;

/// The output ECMAScript profile or host a build is compiled against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    Es2015,
    Es2016,
    Es2017,
    Es2018,
    Es2019,
    Es2020,
    Es2021,
    Es2022,
    Esnext,
    Deno,
    Node,
    /// Not a runtime target: requests a `.d.ts` artifact instead of a module.
    Types,
}

impl Target {
    /// All targets, in canonical enumeration order.
    pub const ALL: [Target; 12] = [
        Target::Es2015,
        Target::Es2016,
        Target::Es2017,
        Target::Es2018,
        Target::Es2019,
        Target::Es2020,
        Target::Es2021,
        Target::Es2022,
        Target::Esnext,
        Target::Deno,
        Target::Node,
        Target::Types,
    ];

    /// `true` for the browser ECMAScript-profile targets (excludes `node`,
    /// `deno`, and `types`).
    #[must_use]
    pub fn is_es_profile(self) -> bool {
        !matches!(self, Target::Deno | Target::Node | Target::Types)
    }

    /// The platform string the bundler driver passes through, `"browser"`
    /// for every target except `node`.
    #[must_use]
    pub fn bundler_platform(self) -> &'static str {
        if self == Target::Node { "node" } else { "browser" }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Target::Es2015 => "es2015",
            Target::Es2016 => "es2016",
            Target::Es2017 => "es2017",
            Target::Es2018 => "es2018",
            Target::Es2019 => "es2019",
            Target::Es2020 => "es2020",
            Target::Es2021 => "es2021",
            Target::Es2022 => "es2022",
            Target::Esnext => "esnext",
            Target::Deno => "deno",
            Target::Node => "node",
            Target::Types => "types",
        };
        f.write_str(s)
    }
}

/// Error returned by [`Target::from_str`] for an unrecognized target token.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown build target '{0}'")]
pub struct UnknownTarget(pub String);

impl FromStr for Target {
    type Err = UnknownTarget;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "es2015" => Target::Es2015,
            "es2016" => Target::Es2016,
            "es2017" => Target::Es2017,
            "es2018" => Target::Es2018,
            "es2019" => Target::Es2019,
            "es2020" => Target::Es2020,
            "es2021" => Target::Es2021,
            "es2022" => Target::Es2022,
            "esnext" => Target::Esnext,
            "deno" => Target::Deno,
            "node" => Target::Node,
            "types" => Target::Types,
            other => return Err(UnknownTarget(other.to_string())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_target() {
        for target in Target::ALL {
            assert_eq!(target.to_string().parse::<Target>().unwrap(), target);
        }
    }

    #[test]
    fn unknown_target_is_rejected() {
        assert_eq!("es6".parse::<Target>(), Err(UnknownTarget("es6".to_string())));
    }

    #[test]
    fn only_node_uses_node_platform() {
        assert_eq!(Target::Node.bundler_platform(), "node");
        assert_eq!(Target::Deno.bundler_platform(), "browser");
        assert_eq!(Target::Es2022.bundler_platform(), "browser");
    }
}
