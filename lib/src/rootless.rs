//! The `user.rootlesscontainers` extended attribute protocol.
//!
//! When the caller cannot `chown` to arbitrary ids or `mknod` device
//! nodes, the intended ownership and device identity of a path are
//! stored in a protobuf message under a well-known xattr key. Both the
//! extractor (writing) and the generator/mtree side (reading) speak this
//! protocol, so ownership survives an unpack/repack cycle even though
//! the files on disk all belong to the caller.

use anyhow::{Context, Result};
use prost::Message;

/// The xattr key carrying the emulation payload.
pub const ROOTLESS_XATTR: &str = "user.rootlesscontainers";

/// The kind of an emulated device node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// A character device.
    Char,
    /// A block device.
    Block,
}

/// The wire message stored in the xattr.
///
/// Fields with the value `0` are omitted on the wire (proto3 defaults);
/// an id of `0` therefore means "no override", which is consistent with
/// the emulation only ever being used for ids that do not map to the
/// caller.
#[derive(Clone, PartialEq, Message)]
pub struct Resource {
    /// Intended owner uid inside the image; `0` means no override.
    #[prost(uint32, tag = "1")]
    pub uid: u32,
    /// Intended owner gid inside the image; `0` means no override.
    #[prost(uint32, tag = "2")]
    pub gid: u32,
    /// Device major for an emulated device node.
    #[prost(uint32, tag = "3")]
    pub dev_major: u32,
    /// Device minor for an emulated device node.
    #[prost(uint32, tag = "4")]
    pub dev_minor: u32,
    /// Device kind: `0` none, `1` char, `2` block.
    #[prost(uint32, tag = "5")]
    pub dev_type: u32,
}

impl Resource {
    /// Whether the message carries no overrides at all.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// The emulated device identity, if any.
    pub fn device(&self) -> Option<(DeviceKind, u32, u32)> {
        let kind = match self.dev_type {
            0 => return None,
            1 => DeviceKind::Char,
            _ => DeviceKind::Block,
        };
        Some((kind, self.dev_major, self.dev_minor))
    }

    /// Record an emulated device identity.
    pub fn set_device(&mut self, kind: DeviceKind, major: u32, minor: u32) {
        self.dev_type = match kind {
            DeviceKind::Char => 1,
            DeviceKind::Block => 2,
        };
        self.dev_major = major;
        self.dev_minor = minor;
    }

    /// Serialize for storage in the xattr.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    /// Parse the xattr payload; an empty value means "no overrides".
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Self::decode(data).context("Decoding rootless xattr")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() -> Result<()> {
        let mut r = Resource {
            uid: 500,
            gid: 500,
            ..Default::default()
        };
        let decoded = Resource::from_bytes(&r.to_bytes())?;
        assert_eq!(decoded.uid, 500);
        assert_eq!(decoded.gid, 500);
        assert_eq!(decoded.device(), None);

        r.set_device(DeviceKind::Block, 8, 1);
        let decoded = Resource::from_bytes(&r.to_bytes())?;
        assert_eq!(decoded.device(), Some((DeviceKind::Block, 8, 1)));
        Ok(())
    }

    #[test]
    fn test_empty_payload_means_no_overrides() -> Result<()> {
        let r = Resource::from_bytes(b"")?;
        assert!(r.is_empty());
        // Default fields are omitted from the encoding entirely.
        assert!(Resource::default().to_bytes().is_empty());
        Ok(())
    }
}
