//! The rootless evaluator.
//!
//! Two things differ from the privileged evaluator. Traversal that is
//! denied by restrictive directory modes is retried after temporarily
//! relaxing the offending ancestor to be searchable by the caller, with
//! the original mode restored by a guard on every exit path. And
//! operations that need capabilities the caller lacks (`chown` to
//! arbitrary ids, `mknod` of device nodes) are emulated through the
//! `user.rootlesscontainers` xattr protocol instead of being attempted
//! against the host.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std::fs::{Dir, MetadataExt};
use cap_std_ext::cap_std;
use rustix::fs::{AtFlags, Mode, OFlags};
use rustix::process::{Gid, Uid};

use super::privileged::PrivilegedFsEval;
use super::{
    open_leaf_nofollow, raw_metadata, xattrs, EvalMetadata, FileKind, FsEval, NodeKind,
    RelaxGuard, ResolvedDir, Timestamp,
};
use crate::idmap::MapOptions;
use crate::rootless::{DeviceKind, Resource, ROOTLESS_XATTR};
use crate::Error;

/// Filesystem access for callers without `CAP_DAC_OVERRIDE`,
/// `CAP_CHOWN` or `CAP_MKNOD`.
#[derive(Debug)]
pub struct RootlessFsEval {
    inner: PrivilegedFsEval,
    map: MapOptions,
}

impl RootlessFsEval {
    /// Create an evaluator translating through `map`.
    pub fn new(map: MapOptions) -> Self {
        Self {
            inner: PrivilegedFsEval::new(map.clone()),
            map,
        }
    }

    /// Relax the deepest component of `path` that denies traversal.
    /// Returns whether any progress was made.
    fn relax_one(&self, root: &Dir, path: &Utf8Path, guard: &mut RelaxGuard) -> Result<bool> {
        let mut parent = root.try_clone()?;
        let mut prefix = Utf8PathBuf::new();
        for comp in path.components() {
            let name = comp.as_str();
            prefix.push(name);
            match root.open_dir(&prefix) {
                Ok(d) => parent = d,
                Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                    let md = parent
                        .symlink_metadata(name)
                        .with_context(|| format!("lstat {prefix}"))?;
                    // Relaxing through a symlink would chmod whatever it
                    // points at; refuse and let the caller surface the
                    // original permission error.
                    if !md.is_dir() {
                        return Ok(false);
                    }
                    let mode = md.mode() & 0o7777;
                    rustix::fs::chmodat(
                        &parent,
                        name,
                        Mode::from_raw_mode(mode | 0o700),
                        AtFlags::empty(),
                    )
                    .with_context(|| format!("relaxing {prefix}"))?;
                    guard.push_path(parent.try_clone()?, name, mode);
                    tracing::trace!("rootless: relaxed {prefix} ({mode:o})");
                    return Ok(true);
                }
                Err(_) => return Ok(false),
            }
        }
        Ok(false)
    }

    /// Ensure the resolved directory itself is rwx for the caller so
    /// that leaf operations inside it succeed.
    fn relax_final(&self, dir: &Dir, guard: &mut RelaxGuard) -> Result<()> {
        let md = dir.dir_metadata()?;
        let mode = md.mode() & 0o7777;
        if mode & 0o700 != 0o700 {
            rustix::fs::fchmod(dir, Mode::from_raw_mode(mode | 0o700))
                .context("relaxing directory")?;
            guard.push_fd(dir.try_clone()?, mode);
        }
        Ok(())
    }

    fn read_resource(&self, dir: &Dir, name: &str) -> Result<Option<Resource>> {
        let fd = match open_leaf_nofollow(dir, name) {
            Ok(fd) => fd,
            Err(rustix::io::Errno::LOOP) => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("open {name}")),
        };
        match xattrs::get(fd, ROOTLESS_XATTR)? {
            Some(data) => Ok(Some(Resource::from_bytes(&data)?)),
            None => Ok(None),
        }
    }

    fn write_resource(&self, dir: &Dir, name: &str, resource: &Resource) -> Result<()> {
        let fd = open_leaf_nofollow(dir, name).with_context(|| format!("open {name}"))?;
        if resource.is_empty() {
            xattrs::remove(fd, ROOTLESS_XATTR)
        } else {
            xattrs::set(fd, ROOTLESS_XATTR, &resource.to_bytes())
        }
    }
}

impl FsEval for RootlessFsEval {
    fn map(&self) -> &MapOptions {
        &self.map
    }

    fn resolve_dir(&self, root: &Dir, path: &Utf8Path, create: bool) -> Result<ResolvedDir> {
        let mut guard = RelaxGuard::default();
        if path.as_str().is_empty() || path == "." {
            let dir = root.try_clone()?;
            self.relax_final(&dir, &mut guard)?;
            return Ok(ResolvedDir::relaxed(dir, guard));
        }
        // Bounded by the path depth: each round either resolves or
        // relaxes one more ancestor.
        let attempts = path.components().count() + 2;
        for _ in 0..attempts {
            match root.open_dir(path) {
                Ok(dir) => {
                    self.relax_final(&dir, &mut guard)?;
                    return Ok(ResolvedDir::relaxed(dir, guard));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound && create => {
                    if let Err(e2) = root.create_dir_all(path) {
                        if e2.kind() == std::io::ErrorKind::PermissionDenied
                            && self.relax_one(root, path, &mut guard)?
                        {
                            continue;
                        }
                        return Err(e2).with_context(|| format!("mkdir -p {path}"));
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                    if self.relax_one(root, path, &mut guard)? {
                        continue;
                    }
                    return Err(e).with_context(|| format!("opening directory {path}"));
                }
                Err(e) => return Err(e).with_context(|| format!("opening directory {path}")),
            }
        }
        Err(Error::RootlessRestriction(format!("cannot traverse to {path}")).into())
    }

    fn open_child_dir(&self, dir: &Dir, name: &str) -> Result<ResolvedDir> {
        let mut guard = RelaxGuard::default();
        let child = match dir.open_dir(name) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                let md = dir
                    .symlink_metadata(name)
                    .with_context(|| format!("lstat {name}"))?;
                if !md.is_dir() {
                    return Err(e).with_context(|| format!("opening directory {name}"));
                }
                let mode = md.mode() & 0o7777;
                rustix::fs::chmodat(
                    dir,
                    name,
                    Mode::from_raw_mode(mode | 0o700),
                    AtFlags::empty(),
                )
                .with_context(|| format!("relaxing {name}"))?;
                guard.push_path(dir.try_clone()?, name, mode);
                dir.open_dir(name)
                    .with_context(|| format!("opening directory {name}"))?
            }
            Err(e) => return Err(e).with_context(|| format!("opening directory {name}")),
        };
        self.relax_final(&child, &mut guard)?;
        Ok(ResolvedDir::relaxed(child, guard))
    }

    fn metadata(&self, dir: &Dir, name: &str) -> Result<Option<EvalMetadata>> {
        let Some(mut md) = raw_metadata(dir, name)? else {
            return Ok(None);
        };
        let resource = if md.kind == FileKind::Symlink {
            None
        } else {
            self.read_resource(dir, name)?
        };
        let resource = resource.unwrap_or_default();
        // Ownership: the xattr override wins; otherwise translate the
        // host owner (normally the caller) back through the mapping.
        md.uid = if resource.uid != 0 {
            resource.uid
        } else {
            self.map
                .uid_to_container(md.uid)
                .ok_or_else(|| Error::Invalid(format!("cannot map host uid {}", md.uid)))?
        };
        md.gid = if resource.gid != 0 {
            resource.gid
        } else {
            self.map
                .gid_to_container(md.gid)
                .ok_or_else(|| Error::Invalid(format!("cannot map host gid {}", md.gid)))?
        };
        if let Some((kind, major, minor)) = resource.device() {
            md.kind = match kind {
                DeviceKind::Char => FileKind::Char,
                DeviceKind::Block => FileKind::Block,
            };
            md.rdev_major = major;
            md.rdev_minor = minor;
            md.size = 0;
        }
        Ok(Some(md))
    }

    fn open(&self, dir: &Dir, name: &str) -> Result<std::fs::File> {
        self.inner.open(dir, name)
    }

    fn readdir(&self, dir: &Dir) -> Result<Vec<String>> {
        self.inner.readdir(dir)
    }

    fn read_link(&self, dir: &Dir, name: &str) -> Result<String> {
        self.inner.read_link(dir, name)
    }

    fn symlink(&self, dir: &Dir, name: &str, target: &str) -> Result<()> {
        self.inner.symlink(dir, name, target)
    }

    fn hard_link(
        &self,
        old_dir: &Dir,
        old_name: &str,
        new_dir: &Dir,
        new_name: &str,
    ) -> Result<()> {
        self.inner.hard_link(old_dir, old_name, new_dir, new_name)
    }

    fn mkdir(&self, dir: &Dir, name: &str, mode: u32) -> Result<()> {
        self.inner.mkdir(dir, name, mode)
    }

    fn chmod(&self, dir: &Dir, name: &str, mode: u32) -> Result<()> {
        self.inner.chmod(dir, name, mode)
    }

    fn lchown(&self, dir: &Dir, name: &str, uid: u32, gid: u32) -> Result<()> {
        // If the target maps to ids we can legitimately use, try the
        // real syscall; EPERM falls back to emulation.
        if let (Some(host_uid), Some(host_gid)) = (self.map.uid_to_host(uid), self.map.gid_to_host(gid))
        {
            #[allow(unsafe_code)]
            let chown_result = rustix::fs::chownat(
                dir,
                name,
                // SAFETY: host_uid/host_gid come from a validated id-map lookup.
                Some(unsafe { Uid::from_raw(host_uid) }),
                Some(unsafe { Gid::from_raw(host_gid) }),
                AtFlags::SYMLINK_NOFOLLOW,
            );
            match chown_result {
                Ok(()) => {
                    // Drop any stale ownership override, keeping device
                    // emulation intact.
                    if let Some(mut resource) = self.read_resource(dir, name)? {
                        if resource.uid != 0 || resource.gid != 0 {
                            resource.uid = 0;
                            resource.gid = 0;
                            self.write_resource(dir, name, &resource)?;
                        }
                    }
                    return Ok(());
                }
                Err(rustix::io::Errno::PERM) | Err(rustix::io::Errno::INVAL) => {}
                Err(e) => return Err(e).with_context(|| format!("chown {name}")),
            }
        }
        // Symlinks cannot carry user xattrs; ownership of a symlink is
        // not meaningful enough to fail the whole unpack over.
        if let Some(md) = raw_metadata(dir, name)? {
            if md.kind == FileKind::Symlink {
                tracing::debug!("rootless: ignoring chown({uid}:{gid}) of symlink {name}");
                return Ok(());
            }
        }
        let mut resource = self.read_resource(dir, name)?.unwrap_or_default();
        resource.uid = uid;
        resource.gid = gid;
        self.write_resource(dir, name, &resource)
            .with_context(|| format!("emulating chown {name}"))
    }

    fn lutimes(&self, dir: &Dir, name: &str, atime: Timestamp, mtime: Timestamp) -> Result<()> {
        self.inner.lutimes(dir, name, atime, mtime)
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
        let device = match kind {
            // No privilege needed for FIFOs.
            NodeKind::Fifo => return self.inner.mknod(dir, name, kind, mode, major, minor),
            NodeKind::Char => DeviceKind::Char,
            NodeKind::Block => DeviceKind::Block,
        };
        // Never attempt a host device node: represent it as an empty
        // file carrying the device identity in the xattr protocol.
        let fd = rustix::fs::openat(
            dir,
            name,
            OFlags::CREATE | OFlags::EXCL | OFlags::WRONLY | OFlags::CLOEXEC,
            Mode::from_raw_mode(mode),
        )
        .with_context(|| format!("emulating mknod {name}"))?;
        let mut resource = Resource::default();
        resource.set_device(device, major, minor);
        xattrs::set(fd, ROOTLESS_XATTR, &resource.to_bytes())
            .with_context(|| format!("emulating mknod {name}"))
    }

    fn remove_file(&self, dir: &Dir, name: &str) -> Result<()> {
        self.inner.remove_file(dir, name)
    }

    fn remove_dir(&self, dir: &Dir, name: &str) -> Result<()> {
        self.inner.remove_dir(dir, name)
    }

    fn list_xattrs(&self, dir: &Dir, name: &str) -> Result<Vec<String>> {
        self.inner.list_xattrs(dir, name)
    }

    fn get_xattr(&self, dir: &Dir, name: &str, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get_xattr(dir, name, key)
    }

    fn set_xattr(&self, dir: &Dir, name: &str, key: &str, value: &[u8]) -> Result<()> {
        self.inner.set_xattr(dir, name, key, value)
    }

    fn remove_xattr(&self, dir: &Dir, name: &str, key: &str) -> Result<()> {
        self.inner.remove_xattr(dir, name, key)
    }
}
