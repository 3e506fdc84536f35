//! The textual mtree encoding.
//!
//! One line per path: the vis-encoded path followed by `key=value`
//! keywords. Paths always start with `./` (or are exactly `.`), so a
//! manifest line is self-describing without `/set` state.

use std::collections::BTreeMap;
use std::io::{BufRead, Write};

use anyhow::{Context, Result};
use base64::Engine;
use camino::Utf8PathBuf;
use fn_error_context::context;

use super::{kind_from_name, kind_name, MtreeEntry};
use crate::fseval::FileKind;
use crate::Error;

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// Escape a string for use as a single mtree token.
pub(crate) fn vis(s: &str) -> String {
    let mut r = String::with_capacity(s.len());
    for b in s.bytes() {
        if b > 0x20 && b < 0x7f && b != b'\\' && b != b'#' && b != b'=' {
            r.push(b as char);
        } else {
            r.push_str(&format!("\\{b:03o}"));
        }
    }
    r
}

/// Reverse of [`vis`].
pub(crate) fn unvis(s: &str) -> Result<String> {
    let mut bytes = Vec::with_capacity(s.len());
    let mut chars = s.bytes();
    while let Some(b) = chars.next() {
        if b != b'\\' {
            bytes.push(b);
            continue;
        }
        let mut v: u32 = 0;
        for _ in 0..3 {
            let d = chars
                .next()
                .and_then(|c| (c as char).to_digit(8))
                .ok_or_else(|| Error::Invalid(format!("mtree escape in {s:?}")))?;
            v = v * 8 + d;
        }
        bytes.push(v as u8);
    }
    String::from_utf8(bytes).map_err(|_| Error::Invalid(format!("mtree token {s:?}")).into())
}

/// Serialize entries to the manifest format.
#[context("Emitting mtree manifest")]
pub fn emit(entries: &[MtreeEntry], out: &mut impl Write) -> Result<()> {
    writeln!(out, "#mtree v2.0")?;
    for e in entries {
        let path = if e.path == "." {
            ".".to_string()
        } else {
            format!("./{}", vis(e.path.as_str()))
        };
        write!(out, "{path} type={}", kind_name(e.kind))?;
        if e.kind == FileKind::File {
            write!(out, " size={}", e.size)?;
        }
        write!(out, " uid={} gid={} mode={:04o}", e.uid, e.gid, e.mode)?;
        if let Some(link) = &e.link {
            write!(out, " link={}", vis(link))?;
        }
        write!(out, " nlink={}", e.nlink)?;
        write!(out, " tar_time={}.000000000", e.tar_time)?;
        if let Some(sha256) = &e.sha256 {
            write!(out, " sha256digest={sha256}")?;
        }
        for (key, value) in &e.xattrs {
            write!(out, " xattr.{}={}", vis(key), B64.encode(value))?;
        }
        writeln!(out)?;
    }
    Ok(())
}

/// Parse a manifest.
#[context("Parsing mtree manifest")]
pub fn parse(src: impl BufRead) -> Result<Vec<MtreeEntry>> {
    let mut out = Vec::new();
    for (lineno, line) in src.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let entry = parse_line(line).with_context(|| format!("mtree line {}", lineno + 1))?;
        out.push(entry);
    }
    Ok(out)
}

fn parse_line(line: &str) -> Result<MtreeEntry> {
    let mut tokens = line.split_ascii_whitespace();
    let raw_path = tokens.next().expect("non-empty line");
    let path = unvis(raw_path)?;
    let path = path.strip_prefix("./").unwrap_or(&path);
    let path = if path.is_empty() { "." } else { path };
    let mut entry = MtreeEntry {
        path: Utf8PathBuf::from(path),
        kind: FileKind::File,
        size: 0,
        uid: 0,
        gid: 0,
        mode: 0,
        link: None,
        nlink: 1,
        tar_time: 0,
        sha256: None,
        xattrs: BTreeMap::new(),
    };
    let mut saw_type = false;
    for token in tokens {
        let Some((key, value)) = token.split_once('=') else {
            return Err(Error::Invalid(format!("mtree keyword {token:?}")).into());
        };
        match key {
            "type" => {
                entry.kind = kind_from_name(value)?;
                saw_type = true;
            }
            "size" => entry.size = value.parse().context("size")?,
            "uid" => entry.uid = value.parse().context("uid")?,
            "gid" => entry.gid = value.parse().context("gid")?,
            "mode" => {
                entry.mode = u32::from_str_radix(value, 8).context("mode")?;
            }
            "link" => entry.link = Some(unvis(value)?),
            "nlink" => entry.nlink = value.parse().context("nlink")?,
            "tar_time" => {
                let secs = value.split('.').next().unwrap_or(value);
                entry.tar_time = secs.parse().context("tar_time")?;
            }
            "sha256digest" => entry.sha256 = Some(value.to_string()),
            _ if key.starts_with("xattr.") => {
                let name = unvis(&key["xattr.".len()..])?;
                let data = B64
                    .decode(value)
                    .map_err(|_| Error::Invalid(format!("xattr value for {name}")))?;
                entry.xattrs.insert(name, data);
            }
            other => {
                tracing::warn!("ignoring unknown mtree keyword {other:?}");
            }
        }
    }
    if !saw_type {
        return Err(Error::Invalid(format!("mtree entry {path:?} missing type")).into());
    }
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vis_roundtrip() -> Result<()> {
        for s in ["plain", "with space", "tab\there", "oc#t=al\\", "ünïcode"] {
            assert_eq!(unvis(&vis(s))?, s, "{s}");
        }
        assert_eq!(vis("a b"), "a\\040b");
        Ok(())
    }

    #[test]
    fn test_emit_parse_roundtrip() -> Result<()> {
        let entries = vec![
            MtreeEntry {
                path: ".".into(),
                kind: FileKind::Dir,
                size: 0,
                uid: 0,
                gid: 0,
                mode: 0o755,
                link: None,
                nlink: 3,
                tar_time: 100,
                sha256: None,
                xattrs: BTreeMap::new(),
            },
            MtreeEntry {
                path: "etc/my config".into(),
                kind: FileKind::File,
                size: 6,
                uid: 1000,
                gid: 7,
                mode: 0o640,
                link: None,
                nlink: 1,
                tar_time: 200,
                sha256: Some(
                    "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03".into(),
                ),
                xattrs: [("user.k".to_string(), b"v\x00v".to_vec())]
                    .into_iter()
                    .collect(),
            },
            MtreeEntry {
                path: "bin/sh".into(),
                kind: FileKind::Symlink,
                size: 0,
                uid: 0,
                gid: 0,
                mode: 0o777,
                link: Some("bash".into()),
                nlink: 1,
                tar_time: 50,
                sha256: None,
                xattrs: BTreeMap::new(),
            },
        ];
        let mut buf = Vec::new();
        emit(&entries, &mut buf)?;
        let parsed = parse(std::io::BufReader::new(buf.as_slice()))?;
        similar_asserts::assert_eq!(parsed, entries);
        Ok(())
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse(std::io::BufReader::new(&b"./x notakeyword\n"[..])).is_err());
        assert!(parse(std::io::BufReader::new(&b"./x type=alien\n"[..])).is_err());
    }
}
