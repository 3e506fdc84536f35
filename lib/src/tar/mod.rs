//! The tar layer codec: shared conventions between the extractor and
//! the generator.

use anyhow::{anyhow, Context, Result};

pub mod extract;
pub mod generate;

pub use extract::{ExtractOptions, OnDiskFormat, TarExtractor};
pub use generate::{generate_layer, GenerateOptions};

/// Prefix marking a whiteout entry in a layer.
pub(crate) const WHITEOUT_PREFIX: &str = ".wh.";
/// Basename of an opaque whiteout, clearing the enclosing directory.
pub(crate) const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";
/// PAX record key prefix carrying xattrs.
pub(crate) const PAX_SCHILY_XATTR: &str = "SCHILY.xattr.";

// The xattr protocol key must never round-trip through layer content.
use crate::rootless::ROOTLESS_XATTR;

/// Xattrs which are never applied on extraction nor emitted on
/// generation. These are host/overlayfs artefacts; re-applying them
/// would corrupt the host's view of the tree. Note that
/// `system.nfs4_acl` is deliberately *not* in this set.
pub(crate) fn is_denied_xattr(name: &str) -> bool {
    name == "security.selinux"
        || name == ROOTLESS_XATTR
        || name.starts_with("trusted.overlay.")
        || name.starts_with("trusted.SGI_ACL_")
}

/// Parse a PAX time record (`seconds[.subsecond]`) into
/// `(seconds, nanos)`.
pub(crate) fn parse_pax_time(value: &str) -> Result<(i64, u32)> {
    let (secs, frac) = match value.split_once('.') {
        Some((s, f)) => (s, Some(f)),
        None => (value, None),
    };
    let secs: i64 = secs
        .parse()
        .with_context(|| format!("parsing PAX time {value:?}"))?;
    let nanos = match frac {
        None => 0,
        Some(frac) => {
            let digits: String = frac.chars().take(9).collect();
            if digits.chars().any(|c| !c.is_ascii_digit()) {
                return Err(anyhow!("parsing PAX time {value:?}"));
            }
            let mut n: u32 = digits.parse().unwrap_or(0);
            for _ in digits.len()..9 {
                n *= 10;
            }
            n
        }
    };
    Ok((secs, nanos))
}

/// Format `(seconds, nanos)` as a PAX time record.
pub(crate) fn format_pax_time(secs: i64, nanos: u32) -> String {
    if nanos == 0 {
        format!("{secs}")
    } else {
        format!("{secs}.{nanos:09}")
    }
}

/// Per-entry metadata recovered from PAX extension records.
#[derive(Debug, Default)]
pub(crate) struct PaxRecords {
    /// Xattrs keyed by name.
    pub(crate) xattrs: Vec<(String, Vec<u8>)>,
    /// Access time override.
    pub(crate) atime: Option<(i64, u32)>,
    /// Modification time override (higher precision than the header).
    pub(crate) mtime: Option<(i64, u32)>,
}

/// Collect the PAX records of a tar entry.
pub(crate) fn pax_records<R: std::io::Read>(entry: &mut tar::Entry<R>) -> Result<PaxRecords> {
    let mut r = PaxRecords::default();
    let Some(extensions) = entry.pax_extensions()? else {
        return Ok(r);
    };
    for ext in extensions {
        let ext = ext?;
        let Ok(key) = ext.key() else {
            continue;
        };
        if let Some(xattr_name) = key.strip_prefix(PAX_SCHILY_XATTR) {
            r.xattrs
                .push((xattr_name.to_string(), ext.value_bytes().to_vec()));
        } else if key == "atime" {
            r.atime = Some(parse_pax_time(ext.value().unwrap_or("0"))?);
        } else if key == "mtime" {
            r.mtime = Some(parse_pax_time(ext.value().unwrap_or("0"))?);
        }
    }
    Ok(r)
}
