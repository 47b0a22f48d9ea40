use super::{extract_identity, AgentBinaryIdentity, ConnectionKind};
use crate::Error;
use bastion_persistence::ChecksumRow;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::warn;

/// Expected binary hashes, keyed by identity, for every connection kind.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AbhList {
    agents: HashMap<String, Vec<Vec<u8>>>,
    aggregates: HashMap<String, Vec<Vec<u8>>>,
    browsers: HashMap<String, Vec<Vec<u8>>>,
    externals: HashMap<String, Vec<Vec<u8>>>,
}

/// One hash or an ordered list of hashes, hex-encoded.
#[derive(Deserialize)]
#[serde(untagged)]
enum Hashes {
    One(String),
    Many(Vec<String>),
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct FileList {
    agents: HashMap<String, Hashes>,
    aggregates: HashMap<String, Hashes>,
    browsers: HashMap<String, Hashes>,
    externals: HashMap<String, Hashes>,
}

#[derive(Deserialize)]
struct VersionedFile {
    v1: FileList,
}

fn decode(entries: HashMap<String, Hashes>) -> Result<HashMap<String, Vec<Vec<u8>>>, Error> {
    entries
        .into_iter()
        .map(|(identity, hashes)| {
            let hashes = match hashes {
                Hashes::One(hash) => vec![hash],
                Hashes::Many(hashes) => hashes,
            };
            let hashes = hashes
                .iter()
                .map(hex::decode)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|err| Error::InvalidDirectory(format!("{identity}: {err}")))?;
            Ok((identity, hashes))
        })
        .collect()
}

impl AbhList {
    /// Parse the versioned JSON directory file.
    pub fn from_json(raw: &[u8]) -> Result<Self, Error> {
        let file: VersionedFile = serde_json::from_slice(raw)
            .map_err(|err| Error::InvalidDirectory(err.to_string()))?;
        Ok(Self {
            agents: decode(file.v1.agents)?,
            aggregates: decode(file.v1.aggregates)?,
            browsers: decode(file.v1.browsers)?,
            externals: decode(file.v1.externals)?,
        })
    }

    /// Build the directory from relational checksum rows.
    ///
    /// Files whose path does not yield an identity of the row's kind are skipped.
    pub fn from_rows(rows: &[ChecksumRow]) -> Result<Self, Error> {
        let mut list = Self::default();
        for row in rows {
            let kind: ConnectionKind = row.kind.parse()?;
            for (path, hash) in &row.files {
                let identity = match extract_identity(path) {
                    Ok((found, identity)) if found == kind => identity,
                    Ok((found, _)) => {
                        warn!(path, %kind, %found, "binary kind does not match its row");
                        continue;
                    }
                    Err(err) => {
                        warn!(?err, path, "skipping binary without identity");
                        continue;
                    }
                };
                let hash = hex::decode(hash)
                    .map_err(|err| Error::InvalidDirectory(format!("{path}: {err}")))?;
                list.insert(kind, &identity, hash);
            }
        }
        Ok(list)
    }

    /// Append `hash` to the list of `identity`.
    pub fn insert(&mut self, kind: ConnectionKind, identity: &AgentBinaryIdentity, hash: Vec<u8>) {
        let hashes = self.partition_mut(kind).entry(identity.key()).or_default();
        if !hashes.contains(&hash) {
            hashes.push(hash);
        }
    }

    /// Return a copy of the hashes registered for `identity`.
    pub fn get(
        &self,
        kind: ConnectionKind,
        identity: &AgentBinaryIdentity,
    ) -> Result<Vec<Vec<u8>>, Error> {
        let key = identity.key();
        self.partition(kind)
            .get(&key)
            .filter(|hashes| !hashes.is_empty())
            .cloned()
            .ok_or(Error::NotFound {
                kind,
                identity: key,
            })
    }

    /// Number of identities registered for `kind`.
    pub fn len(&self, kind: ConnectionKind) -> usize {
        self.partition(kind).len()
    }

    fn partition(&self, kind: ConnectionKind) -> &HashMap<String, Vec<Vec<u8>>> {
        match kind {
            ConnectionKind::Agent => &self.agents,
            ConnectionKind::Aggregate => &self.aggregates,
            ConnectionKind::Browser => &self.browsers,
            ConnectionKind::External => &self.externals,
        }
    }

    fn partition_mut(&mut self, kind: ConnectionKind) -> &mut HashMap<String, Vec<Vec<u8>>> {
        match kind {
            ConnectionKind::Agent => &mut self.agents,
            ConnectionKind::Aggregate => &mut self.aggregates,
            ConnectionKind::Browser => &mut self.browsers,
            ConnectionKind::External => &mut self.externals,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_json() {
        let raw = br#"{"v1": {
            "agents": {
                "1.2.3/linux/amd64": ["deadbeef", "cafebabe"],
                "1.2.3/windows/386": "00ff"
            },
            "browsers": {"1.2.3": "0102"}
        }}"#;
        let list = AbhList::from_json(raw).unwrap();
        let linux = AgentBinaryIdentity::agent("1.2.3", "linux", "amd64");
        assert_eq!(
            list.get(ConnectionKind::Agent, &linux).unwrap(),
            vec![vec![0xde, 0xad, 0xbe, 0xef], vec![0xca, 0xfe, 0xba, 0xbe]]
        );
        let windows = AgentBinaryIdentity::agent("1.2.3", "windows", "386");
        assert_eq!(
            list.get(ConnectionKind::Agent, &windows).unwrap(),
            vec![vec![0x00, 0xff]]
        );
        assert_eq!(
            list.get(ConnectionKind::Browser, &AgentBinaryIdentity::versioned("1.2.3"))
                .unwrap(),
            vec![vec![1, 2]]
        );
        assert_eq!(list.len(ConnectionKind::External), 0);
    }

    #[test]
    fn test_get_exact_match_only() {
        let raw = br#"{"v1": {"agents": {"1.2.3/linux/amd64": "deadbeef"}}}"#;
        let list = AbhList::from_json(raw).unwrap();
        for identity in [
            AgentBinaryIdentity::agent("1.2", "linux", "amd64"),
            AgentBinaryIdentity::agent("1.2.3", "linux", "386"),
            AgentBinaryIdentity::versioned("1.2.3"),
        ] {
            assert!(matches!(
                list.get(ConnectionKind::Agent, &identity),
                Err(Error::NotFound { .. })
            ));
        }
        let linux = AgentBinaryIdentity::agent("1.2.3", "linux", "amd64");
        assert!(list.get(ConnectionKind::Aggregate, &linux).is_err());
    }

    #[test]
    fn test_from_json_rejects_bad_hex() {
        let raw = br#"{"v1": {"agents": {"1.2.3/linux/amd64": "zz"}}}"#;
        assert!(matches!(
            AbhList::from_json(raw),
            Err(Error::InvalidDirectory(_))
        ));
        assert!(AbhList::from_json(b"{}").is_err());
    }

    #[test]
    fn test_from_rows() {
        let rows = vec![
            ChecksumRow {
                kind: "agent".into(),
                files: HashMap::from([
                    ("vxagent/1.2.3/linux/amd64/vxagent".into(), "deadbeef".into()),
                    ("vxagent/readme.txt".into(), "00".into()),
                ]),
            },
            ChecksumRow {
                kind: "external".into(),
                files: HashMap::from([("vxagent/2.0.0/external/ext".into(), "0a".into())]),
            },
        ];
        let list = AbhList::from_rows(&rows).unwrap();
        let linux = AgentBinaryIdentity::agent("1.2.3", "linux", "amd64");
        assert_eq!(
            list.get(ConnectionKind::Agent, &linux).unwrap(),
            vec![vec![0xde, 0xad, 0xbe, 0xef]]
        );
        assert_eq!(
            list.get(ConnectionKind::External, &AgentBinaryIdentity::versioned("2.0.0"))
                .unwrap(),
            vec![vec![0x0a]]
        );
        assert_eq!(list.len(ConnectionKind::Agent), 1);
    }
}
