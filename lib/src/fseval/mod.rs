//! A uniform abstraction over privileged and rootless filesystem access.
//!
//! All host filesystem work done by the layer codec and the mtree
//! manifest goes through the [`FsEval`] trait: directory resolution is
//! capability-relative (a [`Dir`] handle rooted at the bundle rootfs, so
//! symlinks are followed inside the root but can never escape it) and
//! leaf operations are `*at` syscalls against the resolved parent
//! directory.
//!
//! The privileged evaluator is a set of thin syscall wrappers. The
//! rootless evaluator additionally relaxes ancestor directory modes when
//! traversal is denied (restoring them via a guard on every exit path)
//! and emulates `chown`/`mknod` through the xattr protocol in
//! [`crate::rootless`].

use std::os::fd::AsFd;

use anyhow::{Context, Result};
use camino::Utf8Path;
use cap_std::fs::{Dir, MetadataExt};
use cap_std_ext::cap_std;
use rustix::fs::{AtFlags, Mode, OFlags};

use crate::idmap::MapOptions;

mod privileged;
mod rootless_eval;

pub use privileged::PrivilegedFsEval;
pub use rootless_eval::RootlessFsEval;

/// The kind of a filesystem object, as seen by `lstat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Regular file.
    File,
    /// Directory.
    Dir,
    /// Symbolic link.
    Symlink,
    /// Character device.
    Char,
    /// Block device.
    Block,
    /// FIFO.
    Fifo,
    /// Unix socket.
    Socket,
}

/// The kind of node creatable through [`FsEval::mknod`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Character device.
    Char,
    /// Block device.
    Block,
    /// FIFO.
    Fifo,
}

/// Metadata as observed through an evaluator.
///
/// The uid/gid are translated into the container's view through the
/// evaluator's id-mapping (and, rootless, through the xattr protocol);
/// everything else is raw host state.
#[derive(Debug, Clone)]
pub struct EvalMetadata {
    /// Object kind. Rootless device emulation is already applied.
    pub kind: FileKind,
    /// Size in bytes.
    pub size: u64,
    /// Permission bits (including setuid/setgid/sticky).
    pub mode: u32,
    /// Owner uid, container view.
    pub uid: u32,
    /// Owner gid, container view.
    pub gid: u32,
    /// Hard link count.
    pub nlink: u64,
    /// Inode number.
    pub ino: u64,
    /// Device containing the file.
    pub dev: u64,
    /// Access time, seconds.
    pub atime_sec: i64,
    /// Access time, nanoseconds part.
    pub atime_nsec: u32,
    /// Modification time, seconds.
    pub mtime_sec: i64,
    /// Modification time, nanoseconds part.
    pub mtime_nsec: u32,
    /// Device major for char/block nodes.
    pub rdev_major: u32,
    /// Device minor for char/block nodes.
    pub rdev_minor: u32,
}

/// A resolved directory handle, possibly holding relaxed ancestor modes
/// that are restored when this value is dropped.
#[derive(Debug)]
pub struct ResolvedDir {
    /// The directory handle.
    pub dir: Dir,
    _relax: Option<RelaxGuard>,
}

impl ResolvedDir {
    pub(crate) fn plain(dir: Dir) -> Self {
        Self { dir, _relax: None }
    }

    pub(crate) fn relaxed(dir: Dir, guard: RelaxGuard) -> Self {
        let guard = (!guard.is_empty()).then_some(guard);
        Self { dir, _relax: guard }
    }
}

/// Mode restorations to perform, in reverse order, when traversal
/// relaxation goes out of scope.
#[derive(Debug, Default)]
pub(crate) struct RelaxGuard {
    restores: Vec<Restore>,
}

#[derive(Debug)]
enum Restore {
    /// Restore `mode` on `name` inside `dir`.
    Path { dir: Dir, name: String, mode: u32 },
    /// Restore `mode` on an open directory.
    Fd { dir: Dir, mode: u32 },
}

impl RelaxGuard {
    fn is_empty(&self) -> bool {
        self.restores.is_empty()
    }

    pub(crate) fn push_path(&mut self, dir: Dir, name: &str, mode: u32) {
        self.restores.push(Restore::Path {
            dir,
            name: name.to_string(),
            mode,
        });
    }

    pub(crate) fn push_fd(&mut self, dir: Dir, mode: u32) {
        self.restores.push(Restore::Fd { dir, mode });
    }
}

impl Drop for RelaxGuard {
    fn drop(&mut self) {
        for restore in self.restores.drain(..).rev() {
            let r = match &restore {
                Restore::Path { dir, name, mode } => rustix::fs::chmodat(
                    dir,
                    name.as_str(),
                    Mode::from_raw_mode(*mode),
                    AtFlags::empty(),
                ),
                Restore::Fd { dir, mode } => {
                    rustix::fs::fchmod(dir, Mode::from_raw_mode(*mode))
                }
            };
            if let Err(e) = r {
                tracing::warn!("failed to restore directory mode: {e}");
            }
        }
    }
}

/// Timestamps applied through [`FsEval::lutimes`], `(seconds, nanos)`.
pub type Timestamp = (i64, u32);

/// The uniform filesystem operation set.
///
/// `dir`/`name` pairs always address a single path component inside an
/// already-resolved directory; resolution itself goes through
/// [`FsEval::resolve_dir`].
pub trait FsEval: std::fmt::Debug + Send + Sync {
    /// The id-mapping this evaluator translates through.
    fn map(&self) -> &MapOptions;

    /// Resolve `path` (relative, possibly empty) to a directory handle
    /// inside `root`, optionally creating missing components.
    fn resolve_dir(&self, root: &Dir, path: &Utf8Path, create: bool) -> Result<ResolvedDir>;

    /// Open the directory `name` inside `dir`.
    fn open_child_dir(&self, dir: &Dir, name: &str) -> Result<ResolvedDir>;

    /// `lstat` with id translation; `None` when the path does not exist.
    fn metadata(&self, dir: &Dir, name: &str) -> Result<Option<EvalMetadata>>;

    /// Open a regular file for reading (never following a symlink leaf).
    fn open(&self, dir: &Dir, name: &str) -> Result<std::fs::File>;

    /// Directory entry names, sorted.
    fn readdir(&self, dir: &Dir) -> Result<Vec<String>>;

    /// Read a symlink target.
    fn read_link(&self, dir: &Dir, name: &str) -> Result<String>;

    /// Create a symlink to `target`.
    fn symlink(&self, dir: &Dir, name: &str, target: &str) -> Result<()>;

    /// Create a hard link to `old_name` in `old_dir`.
    fn hard_link(&self, old_dir: &Dir, old_name: &str, new_dir: &Dir, new_name: &str)
        -> Result<()>;

    /// Create a directory.
    fn mkdir(&self, dir: &Dir, name: &str, mode: u32) -> Result<()>;

    /// Change permission bits (the leaf must not be a symlink).
    fn chmod(&self, dir: &Dir, name: &str, mode: u32) -> Result<()>;

    /// Change ownership (container ids), without following a symlink
    /// leaf.
    fn lchown(&self, dir: &Dir, name: &str, uid: u32, gid: u32) -> Result<()>;

    /// Set access/modification times without following a symlink leaf.
    fn lutimes(&self, dir: &Dir, name: &str, atime: Timestamp, mtime: Timestamp) -> Result<()>;

    /// Create a device node or FIFO.
    fn mknod(
        &self,
        dir: &Dir,
        name: &str,
        kind: NodeKind,
        mode: u32,
        major: u32,
        minor: u32,
    ) -> Result<()>;

    /// Remove a non-directory.
    fn remove_file(&self, dir: &Dir, name: &str) -> Result<()>;

    /// Remove an empty directory.
    fn remove_dir(&self, dir: &Dir, name: &str) -> Result<()>;

    /// Remove a path recursively; removing a missing path is not an
    /// error.
    fn remove_all(&self, dir: &Dir, name: &str) -> Result<()> {
        let Some(meta) = self.metadata(dir, name)? else {
            return Ok(());
        };
        if meta.kind != FileKind::Dir {
            return self.remove_file(dir, name);
        }
        let child = self.open_child_dir(dir, name)?;
        for entry in self.readdir(&child.dir)? {
            self.remove_all(&child.dir, &entry)?;
        }
        drop(child);
        self.remove_dir(dir, name)
    }

    /// Names of the xattrs on the leaf (empty for symlinks).
    fn list_xattrs(&self, dir: &Dir, name: &str) -> Result<Vec<String>>;

    /// Read one xattr; `None` when absent.
    fn get_xattr(&self, dir: &Dir, name: &str, key: &str) -> Result<Option<Vec<u8>>>;

    /// Set one xattr on the leaf (fails on symlinks).
    fn set_xattr(&self, dir: &Dir, name: &str, key: &str, value: &[u8]) -> Result<()>;

    /// Remove one xattr; removing an absent xattr is not an error.
    fn remove_xattr(&self, dir: &Dir, name: &str, key: &str) -> Result<()>;
}

/// Construct the evaluator matching the mapping options.
pub fn new(map: MapOptions) -> Box<dyn FsEval> {
    if map.rootless {
        Box::new(RootlessFsEval::new(map))
    } else {
        Box::new(PrivilegedFsEval::new(map))
    }
}

/// Open the leaf itself without following symlinks, for fd-based xattr
/// calls. Fails with `ELOOP` on symlinks, which callers surface as
/// "xattrs unsupported here". `O_NONBLOCK` keeps a FIFO leaf from
/// blocking the open.
pub(crate) fn open_leaf_nofollow(dir: &Dir, name: &str) -> rustix::io::Result<rustix::fd::OwnedFd> {
    rustix::fs::openat(
        dir,
        name,
        OFlags::RDONLY | OFlags::NOFOLLOW | OFlags::CLOEXEC | OFlags::NONBLOCK,
        Mode::empty(),
    )
}

pub(crate) fn file_kind_from_mode(st_mode: u32) -> FileKind {
    match st_mode & libc::S_IFMT {
        libc::S_IFDIR => FileKind::Dir,
        libc::S_IFLNK => FileKind::Symlink,
        libc::S_IFCHR => FileKind::Char,
        libc::S_IFBLK => FileKind::Block,
        libc::S_IFIFO => FileKind::Fifo,
        libc::S_IFSOCK => FileKind::Socket,
        _ => FileKind::File,
    }
}

/// Assemble raw (untranslated) metadata from a `cap-std` lstat.
pub(crate) fn raw_metadata(dir: &Dir, name: &str) -> Result<Option<EvalMetadata>> {
    let md = match dir.symlink_metadata(name) {
        Ok(md) => md,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("lstat {name}")),
    };
    let rdev = md.rdev();
    Ok(Some(EvalMetadata {
        kind: file_kind_from_mode(md.mode()),
        size: md.len(),
        mode: md.mode() & 0o7777,
        uid: md.uid(),
        gid: md.gid(),
        nlink: md.nlink(),
        ino: md.ino(),
        dev: md.dev(),
        atime_sec: md.atime(),
        atime_nsec: md.atime_nsec() as u32,
        mtime_sec: md.mtime(),
        mtime_nsec: md.mtime_nsec() as u32,
        rdev_major: rustix::fs::major(rdev),
        rdev_minor: rustix::fs::minor(rdev),
    }))
}

/// Shared fd-based xattr plumbing.
pub(crate) mod xattrs {
    use super::*;

    pub(crate) fn list(fd: impl AsFd) -> Result<Vec<String>> {
        let mut buf = vec![0u8; 1024];
        loop {
            match rustix::fs::flistxattr(&fd, &mut buf) {
                Ok(n) if n <= buf.len() => {
                    buf.truncate(n);
                    break;
                }
                Ok(n) => buf.resize(n, 0),
                Err(rustix::io::Errno::RANGE) => {
                    let n = rustix::fs::flistxattr(&fd, &mut [])?;
                    buf.resize(n, 0);
                }
                Err(e) => return Err(e).context("flistxattr"),
            }
        }
        Ok(buf
            .split(|b| *b == 0)
            .filter(|s| !s.is_empty())
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect())
    }

    pub(crate) fn get(fd: impl AsFd, key: &str) -> Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; 1024];
        loop {
            match rustix::fs::fgetxattr(&fd, key, &mut buf) {
                Ok(n) if n <= buf.len() => {
                    buf.truncate(n);
                    return Ok(Some(buf));
                }
                Ok(n) => buf.resize(n, 0),
                Err(rustix::io::Errno::RANGE) => {
                    let n = rustix::fs::fgetxattr(&fd, key, &mut [])?;
                    buf.resize(n.max(1), 0);
                }
                Err(rustix::io::Errno::NODATA) => return Ok(None),
                Err(e) => return Err(e).with_context(|| format!("fgetxattr {key}")),
            }
        }
    }

    pub(crate) fn set(fd: impl AsFd, key: &str, value: &[u8]) -> Result<()> {
        rustix::fs::fsetxattr(&fd, key, value, rustix::fs::XattrFlags::empty())
            .with_context(|| format!("fsetxattr {key}"))?;
        Ok(())
    }

    pub(crate) fn remove(fd: impl AsFd, key: &str) -> Result<()> {
        match rustix::fs::fremovexattr(&fd, key) {
            Ok(()) | Err(rustix::io::Errno::NODATA) => Ok(()),
            Err(e) => Err(e).with_context(|| format!("fremovexattr {key}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cap_std_ext::cap_tempfile;

    #[test]
    fn test_file_kinds() {
        assert_eq!(file_kind_from_mode(libc::S_IFREG | 0o644), FileKind::File);
        assert_eq!(file_kind_from_mode(libc::S_IFDIR | 0o755), FileKind::Dir);
        assert_eq!(file_kind_from_mode(libc::S_IFLNK | 0o777), FileKind::Symlink);
        assert_eq!(file_kind_from_mode(libc::S_IFCHR | 0o600), FileKind::Char);
    }

    #[test]
    fn test_raw_metadata() -> Result<()> {
        let td = cap_tempfile::tempdir(cap_std::ambient_authority())?;
        td.write("f", b"hello")?;
        let md = raw_metadata(&td, "f")?.unwrap();
        assert_eq!(md.kind, FileKind::File);
        assert_eq!(md.size, 5);
        assert!(raw_metadata(&td, "missing")?.is_none());
        Ok(())
    }
}
