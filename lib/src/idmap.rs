//! Sub-UID/GID translation between host and container identities.

use anyhow::{anyhow, Context, Result};
use oci_spec::runtime::{LinuxIdMapping, LinuxIdMappingBuilder};
use serde::{Deserialize, Serialize};

/// The id-mapping configuration of a bundle, persisted in `umoci.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MapOptions {
    /// UID mappings, container to host.
    #[serde(default)]
    pub uid_mappings: Vec<LinuxIdMapping>,
    /// GID mappings, container to host.
    #[serde(default)]
    pub gid_mappings: Vec<LinuxIdMapping>,
    /// Whether the bundle was created rootless.
    #[serde(default)]
    pub rootless: bool,
}

impl MapOptions {
    /// The default rootless mapping: container root maps to the caller.
    pub fn rootless(uid: u32, gid: u32) -> Self {
        let one = |host: u32, container: u32| {
            LinuxIdMappingBuilder::default()
                .host_id(host)
                .container_id(container)
                .size(1u32)
                .build()
                .expect("static idmap")
        };
        Self {
            uid_mappings: vec![one(uid, 0)],
            gid_mappings: vec![one(gid, 0)],
            rootless: true,
        }
    }

    /// Translate a container UID to a host UID.
    pub fn uid_to_host(&self, uid: u32) -> Option<u32> {
        to_host(uid, &self.uid_mappings)
    }

    /// Translate a container GID to a host GID.
    pub fn gid_to_host(&self, gid: u32) -> Option<u32> {
        to_host(gid, &self.gid_mappings)
    }

    /// Translate a host UID back to a container UID.
    pub fn uid_to_container(&self, uid: u32) -> Option<u32> {
        to_container(uid, &self.uid_mappings)
    }

    /// Translate a host GID back to a container GID.
    pub fn gid_to_container(&self, gid: u32) -> Option<u32> {
        to_container(gid, &self.gid_mappings)
    }
}

fn to_host(id: u32, mappings: &[LinuxIdMapping]) -> Option<u32> {
    if mappings.is_empty() {
        return Some(id);
    }
    mappings.iter().find_map(|m| {
        id.checked_sub(m.container_id())
            .filter(|delta| *delta < m.size())
            .map(|delta| m.host_id() + delta)
    })
}

fn to_container(id: u32, mappings: &[LinuxIdMapping]) -> Option<u32> {
    if mappings.is_empty() {
        return Some(id);
    }
    mappings.iter().find_map(|m| {
        id.checked_sub(m.host_id())
            .filter(|delta| *delta < m.size())
            .map(|delta| m.container_id() + delta)
    })
}

/// Parse a `container:host:size` mapping triple as used on the CLI.
pub fn parse_idmap(s: &str) -> Result<LinuxIdMapping> {
    let parts: Vec<_> = s.split(':').collect();
    let [container, host, size] = parts.as_slice() else {
        return Err(anyhow!("expected container:host:size, got {s:?}"));
    };
    let parse = |v: &str, what| {
        v.parse::<u32>()
            .with_context(|| format!("parsing {what} in idmap {s:?}"))
    };
    Ok(LinuxIdMappingBuilder::default()
        .container_id(parse(container, "container id")?)
        .host_id(parse(host, "host id")?)
        .size(parse(size, "size")?)
        .build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_when_unmapped() {
        let m = MapOptions::default();
        assert_eq!(m.uid_to_host(0), Some(0));
        assert_eq!(m.uid_to_host(1234), Some(1234));
        assert_eq!(m.gid_to_container(99), Some(99));
    }

    #[test]
    fn test_range_translation() -> Result<()> {
        let m = MapOptions {
            uid_mappings: vec![parse_idmap("0:100000:65536")?],
            gid_mappings: vec![parse_idmap("0:200000:2")?],
            rootless: false,
        };
        assert_eq!(m.uid_to_host(0), Some(100000));
        assert_eq!(m.uid_to_host(500), Some(100500));
        assert_eq!(m.uid_to_host(65536), None);
        assert_eq!(m.uid_to_container(100500), Some(500));
        assert_eq!(m.uid_to_container(99999), None);
        assert_eq!(m.gid_to_host(1), Some(200001));
        assert_eq!(m.gid_to_host(2), None);
        Ok(())
    }

    #[test]
    fn test_rootless_mapping() {
        let m = MapOptions::rootless(1000, 1000);
        assert!(m.rootless);
        assert_eq!(m.uid_to_host(0), Some(1000));
        assert_eq!(m.uid_to_host(500), None);
        assert_eq!(m.uid_to_container(1000), Some(0));
    }

    #[test]
    fn test_parse_idmap_errors() {
        assert!(parse_idmap("1:2").is_err());
        assert!(parse_idmap("a:b:c").is_err());
        assert!(parse_idmap("0:1000:1").is_ok());
    }
}
