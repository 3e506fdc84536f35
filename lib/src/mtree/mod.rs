//! Mtree manifests: the authoritative "before" state of a bundle
//! rootfs, written at unpack time and diffed at repack time.
//!
//! The keyword set is `{size, type, uid, gid, mode, link, nlink,
//! tar_time, sha256digest, xattr}`. Both writing and checking go
//! through an [`FsEval`], so id translation and rootless emulation are
//! consistent with the enclosing operation.

use std::collections::BTreeMap;
use std::io::Write;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std::fs::Dir;
use cap_std_ext::cap_std;
use fn_error_context::context;
use tokio_util::sync::CancellationToken;

use crate::digest::Digester;
use crate::fseval::{FileKind, FsEval};
use crate::tar::is_denied_xattr;
use crate::Error;

mod check;
mod format;

pub use check::{check, Delta, DeltaKind};
pub use format::{emit, parse};

/// One rootfs path as recorded in a manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct MtreeEntry {
    /// Path relative to the rootfs; `.` is the rootfs itself.
    pub path: Utf8PathBuf,
    /// Object kind.
    pub kind: FileKind,
    /// Size in bytes (meaningful for regular files).
    pub size: u64,
    /// Owner uid (container view).
    pub uid: u32,
    /// Owner gid (container view).
    pub gid: u32,
    /// Permission bits.
    pub mode: u32,
    /// Symlink target.
    pub link: Option<String>,
    /// Hard link count.
    pub nlink: u64,
    /// Modification time at tar granularity (whole seconds).
    pub tar_time: i64,
    /// Hex SHA-256 of the content (regular files).
    pub sha256: Option<String>,
    /// Xattrs (minus the denied set and protocol-internal keys).
    pub xattrs: BTreeMap<String, Vec<u8>>,
}

pub(crate) fn kind_name(kind: FileKind) -> &'static str {
    match kind {
        FileKind::File => "file",
        FileKind::Dir => "dir",
        FileKind::Symlink => "link",
        FileKind::Char => "char",
        FileKind::Block => "block",
        FileKind::Fifo => "fifo",
        FileKind::Socket => "socket",
    }
}

pub(crate) fn kind_from_name(name: &str) -> Result<FileKind> {
    Ok(match name {
        "file" => FileKind::File,
        "dir" => FileKind::Dir,
        "link" => FileKind::Symlink,
        "char" => FileKind::Char,
        "block" => FileKind::Block,
        "fifo" => FileKind::Fifo,
        "socket" => FileKind::Socket,
        o => return Err(Error::Invalid(format!("mtree type {o:?}")).into()),
    })
}

/// Walk the rootfs, producing entries in deterministic (depth-first,
/// lexicographic) order, the root first.
#[context("Walking rootfs")]
pub fn walk(root: &Dir, fs: &dyn FsEval, token: &CancellationToken) -> Result<Vec<MtreeEntry>> {
    let mut out = Vec::new();
    let resolved = fs.resolve_dir(root, Utf8Path::new(""), false)?;
    let md = fs
        .metadata(&resolved.dir, ".")?
        .ok_or_else(|| Error::NotFound("rootfs".into()))?;
    out.push(MtreeEntry {
        path: Utf8PathBuf::from("."),
        kind: md.kind,
        size: 0,
        uid: md.uid,
        gid: md.gid,
        mode: md.mode,
        link: None,
        nlink: md.nlink,
        tar_time: md.mtime_sec,
        sha256: None,
        xattrs: collect_xattrs(fs, &resolved.dir, ".")?,
    });
    walk_dir(&resolved.dir, fs, Utf8Path::new("."), &mut out, token)?;
    Ok(out)
}

fn walk_dir(
    dir: &Dir,
    fs: &dyn FsEval,
    rel: &Utf8Path,
    out: &mut Vec<MtreeEntry>,
    token: &CancellationToken,
) -> Result<()> {
    for name in fs.readdir(dir)? {
        if token.is_cancelled() {
            return Err(Error::Cancelled.into());
        }
        let path = rel.join(&name);
        let Some(md) = fs.metadata(dir, &name)? else {
            // Raced with a concurrent modification; the bundle is
            // supposed to be exclusively owned, so surface it.
            return Err(Error::NotFound(format!("{path} vanished during walk")).into());
        };
        let link = (md.kind == FileKind::Symlink)
            .then(|| fs.read_link(dir, &name))
            .transpose()?;
        let sha256 = if md.kind == FileKind::File {
            let f = fs.open(dir, &name)?;
            let (digest, _) = Digester::sha256()?
                .consume(std::io::BufReader::new(f))
                .with_context(|| format!("hashing {path}"))?;
            Some(digest.digest().to_string())
        } else {
            None
        };
        let xattrs = if md.kind == FileKind::Symlink {
            BTreeMap::new()
        } else {
            collect_xattrs(fs, dir, &name)?
        };
        out.push(MtreeEntry {
            path: path.clone(),
            kind: md.kind,
            size: if md.kind == FileKind::File { md.size } else { 0 },
            uid: md.uid,
            gid: md.gid,
            mode: md.mode,
            link,
            nlink: md.nlink,
            tar_time: md.mtime_sec,
            sha256,
            xattrs,
        });
        if md.kind == FileKind::Dir {
            let child = fs.open_child_dir(dir, &name)?;
            walk_dir(&child.dir, fs, &path, out, token)?;
        }
    }
    Ok(())
}

fn collect_xattrs(fs: &dyn FsEval, dir: &Dir, name: &str) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut r = BTreeMap::new();
    for key in fs.list_xattrs(dir, name)? {
        if is_denied_xattr(&key) {
            continue;
        }
        if let Some(value) = fs.get_xattr(dir, name, &key)? {
            r.insert(key, value);
        }
    }
    Ok(r)
}

/// Walk the rootfs and write the manifest to `out`.
#[context("Writing mtree manifest")]
pub fn write(
    root: &Dir,
    fs: &dyn FsEval,
    out: &mut impl Write,
    token: &CancellationToken,
) -> Result<()> {
    let entries = walk(root, fs, token)?;
    emit(&entries, out)
}
