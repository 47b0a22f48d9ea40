use crate::Error;
use regex::Regex;
use std::{fmt, str::FromStr, sync::LazyLock};

/// Matches an identity spanning whole path segments.
static IDENTITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<version>v?[0-9]+\.[0-9]+(?:\.[0-9]+)?(?:\.[0-9]+)?(?:-[a-zA-Z0-9]+)?)/(?:(?P<os>linux|darwin|windows)/(?P<arch>amd64|386)|(?P<kind>aggregate|browser|external))$",
    )
    .expect("identity regex is valid")
});

/// Type of the peer on the other end of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    Agent,
    Aggregate,
    Browser,
    External,
}

impl ConnectionKind {
    pub const ALL: [Self; 4] = [Self::Agent, Self::Aggregate, Self::Browser, Self::External];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Aggregate => "aggregate",
            Self::Browser => "browser",
            Self::External => "external",
        }
    }
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "agent" => Ok(Self::Agent),
            "aggregate" => Ok(Self::Aggregate),
            "browser" => Ok(Self::Browser),
            "external" => Ok(Self::External),
            other => Err(Error::InvalidIdentity(format!(
                "unknown connection kind: {other}"
            ))),
        }
    }
}

/// Operating system and architecture of an agent binary.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

/// Identifies a build of a binary. Used only as a directory key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AgentBinaryIdentity {
    pub version: String,

    /// Only set for agent binaries.
    pub platform: Option<Platform>,
}

impl AgentBinaryIdentity {
    pub fn agent(version: &str, os: &str, arch: &str) -> Self {
        Self {
            version: version.to_string(),
            platform: Some(Platform {
                os: os.to_string(),
                arch: arch.to_string(),
            }),
        }
    }

    pub fn versioned(version: &str) -> Self {
        Self {
            version: version.to_string(),
            platform: None,
        }
    }

    /// Directory key: `version/os/arch` for agents, `version` otherwise.
    pub fn key(&self) -> String {
        match &self.platform {
            Some(Platform { os, arch }) => format!("{}/{os}/{arch}", self.version),
            None => self.version.clone(),
        }
    }

    /// Storage path segment of this identity for binaries of `kind`.
    pub fn path_segment(&self, kind: ConnectionKind) -> String {
        match (&self.platform, kind) {
            (Some(_), ConnectionKind::Agent) => self.key(),
            _ => format!("{}/{kind}", self.version),
        }
    }
}

impl fmt::Display for AgentBinaryIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Every identity in `path`. An identity spans two (`{version}/{kind}`) or three
/// (`{version}/{os}/{arch}`) whole segments.
fn identities(path: &str) -> Vec<(ConnectionKind, AgentBinaryIdentity)> {
    let segments: Vec<&str> = path.split('/').collect();
    let mut found = Vec::new();
    for start in 0..segments.len() {
        for width in [2, 3] {
            let Some(window) = segments.get(start..start + width) else {
                continue;
            };
            let candidate = window.join("/");
            let Some(captures) = IDENTITY.captures(&candidate) else {
                continue;
            };
            let version = &captures["version"];
            match (captures.name("os"), captures.name("arch"), captures.name("kind")) {
                (Some(os), Some(arch), _) => found.push((
                    ConnectionKind::Agent,
                    AgentBinaryIdentity::agent(version, os.as_str(), arch.as_str()),
                )),
                (_, _, Some(kind)) => {
                    if let Ok(kind) = kind.as_str().parse() {
                        found.push((kind, AgentBinaryIdentity::versioned(version)));
                    }
                }
                _ => {}
            }
        }
    }
    found
}

/// Parse the connection kind and identity out of a binary storage path.
///
/// The path must contain exactly one identity: `{version}/{os}/{arch}` for agents or
/// `{version}/{aggregate|browser|external}` for other kinds, each part a whole segment.
pub fn extract_identity(path: &str) -> Result<(ConnectionKind, AgentBinaryIdentity), Error> {
    let [identity] = <[_; 1]>::try_from(identities(path)).map_err(|found: Vec<_>| {
        Error::AmbiguousIdentity {
            path: path.to_string(),
            matches: found.len(),
        }
    })?;
    Ok(identity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_extract_inverts_path_segment() {
        for version in ["1.2", "1.2.3", "v1.2.3.4", "1.0.0-rc1"] {
            for os in ["linux", "darwin", "windows"] {
                for arch in ["amd64", "386"] {
                    let identity = AgentBinaryIdentity::agent(version, os, arch);
                    let path = format!(
                        "binaries/vxagent/{}/vxagent",
                        identity.path_segment(ConnectionKind::Agent)
                    );
                    let (kind, extracted) = extract_identity(&path).unwrap();
                    assert_eq!(kind, ConnectionKind::Agent);
                    assert_eq!(extracted, identity);
                }
            }
            for kind in [
                ConnectionKind::Aggregate,
                ConnectionKind::Browser,
                ConnectionKind::External,
            ] {
                let identity = AgentBinaryIdentity::versioned(version);
                let path = format!("binaries/{}/module.bin", identity.path_segment(kind));
                let (extracted_kind, extracted) = extract_identity(&path).unwrap();
                assert_eq!(extracted_kind, kind);
                assert_eq!(extracted, identity);
            }
        }
    }

    #[test_case("binaries/vxagent/linux/amd64/vxagent", 0; "missing version")]
    #[test_case("binaries/1.2.3/freebsd/amd64/vxagent", 0; "unknown os")]
    #[test_case("binaries/1.2.3/linux/arm64/vxagent", 0; "unknown arch")]
    #[test_case("1.2.3/linux/amd64/1.2.4/linux/386", 2; "two agent identities")]
    #[test_case("1.2.3/browser/1.2.3/external", 2; "two module identities")]
    #[test_case("/bin/1.2.3.4.5/linux/amd64", 0; "version with too many parts")]
    #[test_case("/bin/v11.2.3/linux/amd64x", 0; "arch with trailing characters")]
    #[test_case("x1.0/aggregate", 0; "version with leading characters")]
    #[test_case("1.0/aggregates/module.bin", 0; "kind with trailing characters")]
    fn test_extract_rejects(path: &str, matches: usize) {
        match extract_identity(path) {
            Err(Error::AmbiguousIdentity { matches: found, .. }) => assert_eq!(found, matches),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_key() {
        assert_eq!(
            AgentBinaryIdentity::agent("1.2.3", "linux", "amd64").key(),
            "1.2.3/linux/amd64"
        );
        assert_eq!(AgentBinaryIdentity::versioned("1.2.3").key(), "1.2.3");
    }

    #[test]
    fn test_kind_parse() {
        for kind in ConnectionKind::ALL {
            assert_eq!(kind.as_str().parse::<ConnectionKind>().unwrap(), kind);
        }
        assert!("server".parse::<ConnectionKind>().is_err());
    }
}
