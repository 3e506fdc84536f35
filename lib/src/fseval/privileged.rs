//! The privileged evaluator: thin syscall wrappers.

use anyhow::{Context, Result};
use camino::Utf8Path;
use cap_std::fs::Dir;
use cap_std_ext::cap_std;
use rustix::fs::{AtFlags, Mode, Timespec, Timestamps};
use rustix::process::{Gid, Uid};

use super::{
    open_leaf_nofollow, raw_metadata, xattrs, EvalMetadata, FsEval, NodeKind, ResolvedDir,
    Timestamp,
};
use crate::idmap::MapOptions;
use crate::Error;

/// Filesystem access with no translation beyond the configured id-map.
#[derive(Debug)]
pub struct PrivilegedFsEval {
    map: MapOptions,
}

impl PrivilegedFsEval {
    /// Create an evaluator translating through `map`.
    pub fn new(map: MapOptions) -> Self {
        Self { map }
    }
}

pub(crate) fn timestamps(atime: Timestamp, mtime: Timestamp) -> Timestamps {
    let ts = |(sec, nsec): Timestamp| Timespec {
        tv_sec: sec,
        tv_nsec: nsec as _,
    };
    Timestamps {
        last_access: ts(atime),
        last_modification: ts(mtime),
    }
}

pub(crate) fn read_link_at(dir: &Dir, name: &str) -> Result<String> {
    let target = rustix::fs::readlinkat(dir, name, Vec::new())
        .with_context(|| format!("readlink {name}"))?;
    Ok(target.to_string_lossy().into_owned())
}

pub(crate) fn readdir_sorted(dir: &Dir) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for ent in dir.entries()? {
        let ent = ent?;
        let name = ent.file_name();
        let name = name
            .to_str()
            .ok_or_else(|| Error::Invalid(format!("non-UTF-8 file name {name:?}")))?;
        names.push(name.to_string());
    }
    names.sort();
    Ok(names)
}

impl FsEval for PrivilegedFsEval {
    fn map(&self) -> &MapOptions {
        &self.map
    }

    fn resolve_dir(&self, root: &Dir, path: &Utf8Path, create: bool) -> Result<ResolvedDir> {
        if path.as_str().is_empty() || path == "." {
            return Ok(ResolvedDir::plain(root.try_clone()?));
        }
        match root.open_dir(path) {
            Ok(d) => Ok(ResolvedDir::plain(d)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && create => {
                root.create_dir_all(path)
                    .with_context(|| format!("mkdir -p {path}"))?;
                Ok(ResolvedDir::plain(root.open_dir(path)?))
            }
            Err(e) => Err(e).with_context(|| format!("opening directory {path}")),
        }
    }

    fn open_child_dir(&self, dir: &Dir, name: &str) -> Result<ResolvedDir> {
        Ok(ResolvedDir::plain(
            dir.open_dir(name)
                .with_context(|| format!("opening directory {name}"))?,
        ))
    }

    fn metadata(&self, dir: &Dir, name: &str) -> Result<Option<EvalMetadata>> {
        let Some(mut md) = raw_metadata(dir, name)? else {
            return Ok(None);
        };
        md.uid = self
            .map
            .uid_to_container(md.uid)
            .ok_or_else(|| Error::Invalid(format!("cannot map host uid {}", md.uid)))?;
        md.gid = self
            .map
            .gid_to_container(md.gid)
            .ok_or_else(|| Error::Invalid(format!("cannot map host gid {}", md.gid)))?;
        Ok(Some(md))
    }

    fn open(&self, dir: &Dir, name: &str) -> Result<std::fs::File> {
        let fd = open_leaf_nofollow(dir, name).with_context(|| format!("open {name}"))?;
        Ok(std::fs::File::from(fd))
    }

    fn readdir(&self, dir: &Dir) -> Result<Vec<String>> {
        readdir_sorted(dir)
    }

    fn read_link(&self, dir: &Dir, name: &str) -> Result<String> {
        read_link_at(dir, name)
    }

    fn symlink(&self, dir: &Dir, name: &str, target: &str) -> Result<()> {
        rustix::fs::symlinkat(target, dir, name)
            .with_context(|| format!("symlink {name} -> {target}"))?;
        Ok(())
    }

    fn hard_link(
        &self,
        old_dir: &Dir,
        old_name: &str,
        new_dir: &Dir,
        new_name: &str,
    ) -> Result<()> {
        rustix::fs::linkat(old_dir, old_name, new_dir, new_name, AtFlags::empty())
            .with_context(|| format!("link {new_name} -> {old_name}"))?;
        Ok(())
    }

    fn mkdir(&self, dir: &Dir, name: &str, mode: u32) -> Result<()> {
        rustix::fs::mkdirat(dir, name, Mode::from_raw_mode(mode))
            .with_context(|| format!("mkdir {name}"))?;
        Ok(())
    }

    fn chmod(&self, dir: &Dir, name: &str, mode: u32) -> Result<()> {
        rustix::fs::chmodat(dir, name, Mode::from_raw_mode(mode), AtFlags::empty())
            .with_context(|| format!("chmod {name}"))?;
        Ok(())
    }

    fn lchown(&self, dir: &Dir, name: &str, uid: u32, gid: u32) -> Result<()> {
        let host_uid = self
            .map
            .uid_to_host(uid)
            .ok_or_else(|| Error::Invalid(format!("cannot map uid {uid}")))?;
        let host_gid = self
            .map
            .gid_to_host(gid)
            .ok_or_else(|| Error::Invalid(format!("cannot map gid {gid}")))?;
        #[allow(unsafe_code)]
        rustix::fs::chownat(
            dir,
            name,
            // SAFETY: host_uid/host_gid come from a validated id-map lookup.
            Some(unsafe { Uid::from_raw(host_uid) }),
            Some(unsafe { Gid::from_raw(host_gid) }),
            AtFlags::SYMLINK_NOFOLLOW,
        )
        .with_context(|| format!("chown {name}"))?;
        Ok(())
    }

    fn lutimes(&self, dir: &Dir, name: &str, atime: Timestamp, mtime: Timestamp) -> Result<()> {
        rustix::fs::utimensat(
            dir,
            name,
            &timestamps(atime, mtime),
            AtFlags::SYMLINK_NOFOLLOW,
        )
        .with_context(|| format!("utimes {name}"))?;
        Ok(())
    }

    fn mknod(
        &self,
        dir: &Dir,
        name: &str,
        kind: NodeKind,
        mode: u32,
        major: u32,
        minor: u32,
    ) -> Result<()> {
        let ftype = match kind {
            NodeKind::Char => rustix::fs::FileType::CharacterDevice,
            NodeKind::Block => rustix::fs::FileType::BlockDevice,
            NodeKind::Fifo => rustix::fs::FileType::Fifo,
        };
        rustix::fs::mknodat(
            dir,
            name,
            ftype,
            Mode::from_raw_mode(mode),
            rustix::fs::makedev(major, minor),
        )
        .with_context(|| format!("mknod {name}"))?;
        Ok(())
    }

    fn remove_file(&self, dir: &Dir, name: &str) -> Result<()> {
        rustix::fs::unlinkat(dir, name, AtFlags::empty())
            .with_context(|| format!("unlink {name}"))?;
        Ok(())
    }

    fn remove_dir(&self, dir: &Dir, name: &str) -> Result<()> {
        rustix::fs::unlinkat(dir, name, AtFlags::REMOVEDIR)
            .with_context(|| format!("rmdir {name}"))?;
        Ok(())
    }

    fn list_xattrs(&self, dir: &Dir, name: &str) -> Result<Vec<String>> {
        match open_leaf_nofollow(dir, name) {
            Ok(fd) => xattrs::list(fd),
            // Symlinks cannot carry the xattrs we handle.
            Err(rustix::io::Errno::LOOP) => Ok(Vec::new()),
            Err(e) => Err(e).with_context(|| format!("open {name}")),
        }
    }

    fn get_xattr(&self, dir: &Dir, name: &str, key: &str) -> Result<Option<Vec<u8>>> {
        match open_leaf_nofollow(dir, name) {
            Ok(fd) => xattrs::get(fd, key),
            Err(rustix::io::Errno::LOOP) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("open {name}")),
        }
    }

    fn set_xattr(&self, dir: &Dir, name: &str, key: &str, value: &[u8]) -> Result<()> {
        let fd = open_leaf_nofollow(dir, name).with_context(|| format!("open {name}"))?;
        xattrs::set(fd, key, value)
    }

    fn remove_xattr(&self, dir: &Dir, name: &str, key: &str) -> Result<()> {
        match open_leaf_nofollow(dir, name) {
            Ok(fd) => xattrs::remove(fd, key),
            Err(rustix::io::Errno::LOOP) => Ok(()),
            Err(e) => Err(e).with_context(|| format!("open {name}")),
        }
    }
}
