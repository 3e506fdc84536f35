//! Applying a tar layer onto a rootfs.
//!
//! Entries are processed in stream order. Every path is lexically
//! cleaned and then resolved capability-relative to the destination, so
//! symlinks inside the destination are honoured but a symlink whose
//! target escapes makes the entry fail rather than touching the host.
//! Whiteouts are applied the moment they are seen; directory metadata
//! is deferred and re-applied in reverse depth order once the layer is
//! complete, so that creating children does not perturb parents.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use anyhow::{Context, Result};
use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use cap_std::fs::Dir;
use cap_std_ext::cap_std;
use cap_std_ext::cap_tempfile;
use fn_error_context::context;
use rustix::fs::Mode;
use tokio_util::sync::CancellationToken;

use super::{is_denied_xattr, pax_records, PaxRecords, OPAQUE_WHITEOUT, WHITEOUT_PREFIX};
use crate::fseval::{FileKind, FsEval, NodeKind, ResolvedDir, Timestamp};
use crate::Error;

/// How layer deletions are rendered on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnDiskFormat {
    /// A plain rootfs: whiteouts are applied by deleting.
    #[default]
    Dir,
    /// An overlayfs upper layer: whiteouts become `0:0` character
    /// devices and opaque markers become `trusted.overlay.opaque`.
    /// Requires the privileges to create device nodes.
    Overlayfs,
}

/// Options controlling extraction.
#[derive(Debug)]
pub struct ExtractOptions {
    /// Keep an existing symlink-to-directory when the layer carries a
    /// directory at the same path, instead of replacing it.
    pub keep_dirlinks: bool,
    /// Treat failure to apply a (non-denied) xattr as a warning rather
    /// than an error.
    pub best_effort_xattrs: bool,
    /// How to render whiteouts.
    pub on_disk_format: OnDiskFormat,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            keep_dirlinks: false,
            best_effort_xattrs: true,
            on_disk_format: OnDiskFormat::default(),
        }
    }
}

/// Deferred directory metadata, applied after the layer completes.
#[derive(Debug)]
enum DirState {
    /// The layer carried an entry for this directory: apply its full
    /// metadata.
    FromEntry(DirMeta),
    /// The directory was only traversed/modified: restore its
    /// timestamps (its mode is only ever changed by the rootless
    /// relaxation guard, which restores it itself).
    Preexisting {
        atime: Timestamp,
        mtime: Timestamp,
    },
}

#[derive(Debug)]
struct DirMeta {
    mode: u32,
    uid: u32,
    gid: u32,
    atime: Timestamp,
    mtime: Timestamp,
    xattrs: Vec<(String, Vec<u8>)>,
}

/// Applies tar layers onto a destination rootfs.
#[derive(Debug)]
pub struct TarExtractor<'a> {
    root: &'a Dir,
    fs: &'a dyn FsEval,
    opts: ExtractOptions,
    dirs: BTreeMap<Utf8PathBuf, DirState>,
}

/// Lexically clean an entry name: strip `.` components, reject absolute
/// paths and any `..`.
fn clean_entry_path(path: &Utf8Path) -> Result<Utf8PathBuf, Error> {
    let mut clean = Utf8PathBuf::new();
    for comp in path.components() {
        match comp {
            Utf8Component::Normal(p) => clean.push(p),
            Utf8Component::CurDir => {}
            Utf8Component::RootDir | Utf8Component::Prefix(_) => {
                return Err(Error::malformed_layer(path, "absolute path"));
            }
            Utf8Component::ParentDir => {
                return Err(Error::malformed_layer(path, "path escapes destination"));
            }
        }
    }
    Ok(clean)
}

/// Split a cleaned path into its parent and basename; the empty path
/// addresses the root itself (parent is the root, basename `.`).
fn split_parent(clean: &Utf8Path) -> (&Utf8Path, &str) {
    match (clean.parent(), clean.file_name()) {
        (Some(parent), Some(base)) => (parent, base),
        _ => (Utf8Path::new(""), "."),
    }
}

impl<'a> TarExtractor<'a> {
    /// Create an extractor writing into `root` through `fs`.
    pub fn new(root: &'a Dir, fs: &'a dyn FsEval, opts: ExtractOptions) -> Self {
        Self {
            root,
            fs,
            opts,
            dirs: BTreeMap::new(),
        }
    }

    /// Apply one tar stream onto the destination.
    #[context("Extracting layer")]
    pub fn unpack(&mut self, src: impl Read, token: &CancellationToken) -> Result<()> {
        let mut archive = tar::Archive::new(src);
        for entry in archive.entries()? {
            if token.is_cancelled() {
                return Err(Error::Cancelled.into());
            }
            let mut entry = entry?;
            self.apply(&mut entry, token)?;
        }
        self.restore_directories()
    }

    /// Apply a single entry.
    fn apply<R: Read>(&mut self, entry: &mut tar::Entry<R>, token: &CancellationToken) -> Result<()> {
        use tar::EntryType;

        let raw_path = entry.path()?.into_owned();
        let Some(raw_path) = Utf8Path::from_path(&raw_path) else {
            return Err(Error::malformed_layer(
                raw_path.to_string_lossy(),
                "non-UTF-8 path",
            )
            .into());
        };
        let etype = entry.header().entry_type();
        match etype {
            EntryType::XHeader | EntryType::XGlobalHeader | EntryType::GNULongName
            | EntryType::GNULongLink => {
                tracing::trace!("skipping meta entry {raw_path}");
                return Ok(());
            }
            _ => {}
        }
        let clean = clean_entry_path(raw_path)?;
        tracing::trace!("unpacking {clean} ({etype:?})");
        let (parent_rel, base) = split_parent(&clean);

        // Whiteouts apply immediately, whatever their position in the
        // stream; later creates simply clobber.
        if base == OPAQUE_WHITEOUT {
            return self
                .apply_opaque_whiteout(parent_rel)
                .with_context(|| format!("opaque whiteout {raw_path}"));
        }
        if let Some(victim) = base.strip_prefix(WHITEOUT_PREFIX) {
            if victim.is_empty() {
                return Err(Error::malformed_layer(raw_path, "empty whiteout").into());
            }
            let parent = self.resolve_parent(&clean, parent_rel)?;
            // Whiteing out a path that does not exist is fine.
            self.fs
                .remove_all(&parent.dir, victim)
                .with_context(|| format!("whiteout {raw_path}"))?;
            if self.opts.on_disk_format == OnDiskFormat::Overlayfs {
                self.check_overlayfs_allowed()?;
                self.fs
                    .mknod(&parent.dir, victim, NodeKind::Char, 0o600, 0, 0)
                    .with_context(|| format!("overlayfs whiteout {raw_path}"))?;
            }
            return Ok(());
        }

        let mut pax = pax_records(entry)?;
        let header = entry.header();
        let mode = (header.mode()? & 0o7777) as u32;
        let uid: u32 = header
            .uid()?
            .try_into()
            .map_err(|_| Error::malformed_layer(raw_path, "uid out of range"))?;
        let gid: u32 = header
            .gid()?
            .try_into()
            .map_err(|_| Error::malformed_layer(raw_path, "gid out of range"))?;
        let mtime = pax
            .mtime
            .take()
            .unwrap_or((header.mtime().unwrap_or_default() as i64, 0));
        let atime = pax.atime.take().unwrap_or(mtime);
        let meta = EntryMeta {
            mode,
            uid,
            gid,
            atime,
            mtime,
        };

        match etype {
            EntryType::Directory => self.apply_directory(&clean, meta, pax),
            EntryType::Regular | EntryType::Continuous => {
                self.apply_regular(&clean, entry, meta, pax, token)
            }
            EntryType::Symlink => self.apply_symlink(&clean, entry, meta),
            EntryType::Link => self.apply_hardlink(&clean, entry),
            EntryType::Char => self.apply_device(&clean, NodeKind::Char, entry, meta, pax),
            EntryType::Block => self.apply_device(&clean, NodeKind::Block, entry, meta, pax),
            EntryType::Fifo => self.apply_device(&clean, NodeKind::Fifo, entry, meta, pax),
            other => Err(Error::malformed_layer(
                raw_path,
                format!("unsupported entry type {other:?}"),
            )
            .into()),
        }
        .with_context(|| format!("entry {raw_path}"))
    }

    /// Resolve the parent directory of an entry, creating missing
    /// components and snapshotting its pre-extraction timestamps for
    /// restoration.
    fn resolve_parent(&mut self, clean: &Utf8Path, parent_rel: &Utf8Path) -> Result<ResolvedDir> {
        let parent = self
            .fs
            .resolve_dir(self.root, parent_rel, true)
            .map_err(|e| match e.downcast_ref::<std::io::Error>() {
                Some(io) if io.kind() == std::io::ErrorKind::PermissionDenied => {
                    anyhow::Error::from(Error::malformed_layer(
                        clean.as_str(),
                        "parent escapes destination or is not traversable",
                    ))
                }
                _ => e,
            })?;
        self.note_touched(parent_rel, &parent.dir)?;
        Ok(parent)
    }

    /// Record a directory's pre-extraction timestamps, once.
    fn note_touched(&mut self, rel: &Utf8Path, dir: &Dir) -> Result<()> {
        if self.dirs.contains_key(rel) {
            return Ok(());
        }
        let md = dir.dir_metadata()?;
        use cap_std::fs::MetadataExt;
        self.dirs.insert(
            rel.to_owned(),
            DirState::Preexisting {
                atime: (md.atime(), md.atime_nsec() as u32),
                mtime: (md.mtime(), md.mtime_nsec() as u32),
            },
        );
        Ok(())
    }

    fn apply_opaque_whiteout(&mut self, dir_rel: &Utf8Path) -> Result<()> {
        let parent = self.resolve_parent(dir_rel, dir_rel)?;
        if self.opts.on_disk_format == OnDiskFormat::Overlayfs {
            self.check_overlayfs_allowed()?;
            return self
                .fs
                .set_xattr(&parent.dir, ".", "trusted.overlay.opaque", b"y");
        }
        // Clear the contents; the directory itself (mode, ownership)
        // stays until a later entry overwrites it.
        for name in self.fs.readdir(&parent.dir)? {
            self.fs.remove_all(&parent.dir, &name)?;
        }
        Ok(())
    }

    /// Overlayfs whiteouts are real device nodes and trusted xattrs;
    /// emulating them would produce a layer overlayfs cannot read.
    fn check_overlayfs_allowed(&self) -> Result<()> {
        if self.fs.map().rootless {
            return Err(Error::RootlessRestriction(
                "overlayfs whiteouts require device node privileges".into(),
            )
            .into());
        }
        Ok(())
    }

    fn apply_directory(
        &mut self,
        clean: &Utf8Path,
        meta: EntryMeta,
        pax: PaxRecords,
    ) -> Result<()> {
        let (parent_rel, base) = split_parent(clean);
        if base != "." {
            let parent = self.resolve_parent(clean, parent_rel)?;
            match self.fs.metadata(&parent.dir, base)? {
                None => {
                    self.fs.mkdir(&parent.dir, base, 0o755)?;
                }
                Some(existing) if existing.kind == FileKind::Dir => {
                    // Merge with the existing directory.
                }
                Some(existing)
                    if existing.kind == FileKind::Symlink && self.opts.keep_dirlinks =>
                {
                    // Only keep the link if it resolves to a directory
                    // inside the destination.
                    if self.fs.resolve_dir(self.root, clean, false).is_err() {
                        self.fs.remove_file(&parent.dir, base)?;
                        self.fs.mkdir(&parent.dir, base, 0o755)?;
                    }
                }
                Some(_) => {
                    self.fs.remove_all(&parent.dir, base)?;
                    self.fs.mkdir(&parent.dir, base, 0o755)?;
                }
            }
        }
        // Metadata is applied when the layer completes.
        self.dirs.insert(
            clean.to_owned(),
            DirState::FromEntry(DirMeta {
                mode: meta.mode,
                uid: meta.uid,
                gid: meta.gid,
                atime: meta.atime,
                mtime: meta.mtime,
                xattrs: pax.xattrs,
            }),
        );
        Ok(())
    }

    fn apply_regular<R: Read>(
        &mut self,
        clean: &Utf8Path,
        entry: &mut tar::Entry<R>,
        meta: EntryMeta,
        pax: PaxRecords,
        token: &CancellationToken,
    ) -> Result<()> {
        let (parent_rel, base) = split_parent(clean);
        if base == "." {
            return Err(Error::malformed_layer(clean.as_str(), "file at root").into());
        }
        let parent = self.resolve_parent(clean, parent_rel)?;
        if let Some(existing) = self.fs.metadata(&parent.dir, base)? {
            if existing.kind == FileKind::Dir {
                self.fs.remove_all(&parent.dir, base)?;
            }
            // A non-directory is atomically replaced by the rename
            // below. Note that in rootless mode we never write-open an
            // existing file either; other hardlinks to its inode keep
            // the old content.
        }
        let mut tmp = cap_tempfile::TempFile::new(&parent.dir).context("creating tempfile")?;
        let mut buf = vec![0u8; 128 * 1024];
        loop {
            if token.is_cancelled() {
                return Err(Error::Cancelled.into());
            }
            let n = entry.read(&mut buf)?;
            if n == 0 {
                break;
            }
            tmp.as_file_mut().write_all(&buf[..n])?;
        }
        rustix::fs::fchmod(tmp.as_file_mut(), Mode::from_raw_mode(meta.mode))
            .context("setting file mode")?;
        tmp.replace(base).context("renaming into place")?;
        self.apply_leaf_metadata(&parent.dir, base, &meta, &pax)
    }

    fn apply_symlink<R: Read>(
        &mut self,
        clean: &Utf8Path,
        entry: &mut tar::Entry<R>,
        meta: EntryMeta,
    ) -> Result<()> {
        let (parent_rel, base) = split_parent(clean);
        let target = entry
            .link_name()?
            .ok_or_else(|| Error::malformed_layer(clean.as_str(), "symlink without target"))?;
        let Some(target) = target.to_str() else {
            return Err(Error::malformed_layer(clean.as_str(), "non-UTF-8 link target").into());
        };
        let target = target.to_owned();
        let parent = self.resolve_parent(clean, parent_rel)?;
        // Unconditionally replace; the target is stored verbatim and
        // never resolved here.
        self.fs.remove_all(&parent.dir, base)?;
        self.fs.symlink(&parent.dir, base, &target)?;
        self.fs.lchown(&parent.dir, base, meta.uid, meta.gid)?;
        self.fs
            .lutimes(&parent.dir, base, meta.atime, meta.mtime)?;
        Ok(())
    }

    fn apply_hardlink<R: Read>(&mut self, clean: &Utf8Path, entry: &mut tar::Entry<R>) -> Result<()> {
        let (parent_rel, base) = split_parent(clean);
        let target = entry
            .link_name()?
            .ok_or_else(|| Error::malformed_layer(clean.as_str(), "hardlink without target"))?;
        let Some(target) = Utf8Path::from_path(&target) else {
            return Err(Error::malformed_layer(clean.as_str(), "non-UTF-8 link target").into());
        };
        let target_clean = clean_entry_path(target)?;
        let (target_parent_rel, target_base) = split_parent(&target_clean);
        let target_parent = self
            .fs
            .resolve_dir(self.root, target_parent_rel, false)
            .map_err(|_| {
                Error::malformed_layer(clean.as_str(), format!("hardlink target {target_clean} unavailable"))
            })?;
        match self.fs.metadata(&target_parent.dir, target_base)? {
            Some(md) if md.kind != FileKind::Dir => {}
            _ => {
                return Err(Error::malformed_layer(
                    clean.as_str(),
                    format!("hardlink to unknown target {target_clean}"),
                )
                .into());
            }
        }
        let parent = self.resolve_parent(clean, parent_rel)?;
        self.fs.remove_all(&parent.dir, base)?;
        self.fs
            .hard_link(&target_parent.dir, target_base, &parent.dir, base)?;
        // The link shares the target's inode; no metadata to apply.
        Ok(())
    }

    fn apply_device<R: Read>(
        &mut self,
        clean: &Utf8Path,
        kind: NodeKind,
        entry: &mut tar::Entry<R>,
        meta: EntryMeta,
        pax: PaxRecords,
    ) -> Result<()> {
        let (parent_rel, base) = split_parent(clean);
        let header = entry.header();
        let major = header.device_major()?.unwrap_or(0);
        let minor = header.device_minor()?.unwrap_or(0);
        let parent = self.resolve_parent(clean, parent_rel)?;
        self.fs.remove_all(&parent.dir, base)?;
        self.fs
            .mknod(&parent.dir, base, kind, meta.mode, major, minor)?;
        // mknod/mkdir are subject to the umask; re-apply the exact mode.
        self.fs.chmod(&parent.dir, base, meta.mode)?;
        self.apply_leaf_metadata(&parent.dir, base, &meta, &pax)
    }

    /// Ownership, xattrs and times for a freshly-created leaf.
    fn apply_leaf_metadata(
        &self,
        dir: &Dir,
        base: &str,
        meta: &EntryMeta,
        pax: &PaxRecords,
    ) -> Result<()> {
        self.fs.lchown(dir, base, meta.uid, meta.gid)?;
        self.apply_xattrs(dir, base, &pax.xattrs)?;
        // Times go last so the metadata application itself is not
        // observable.
        self.fs.lutimes(dir, base, meta.atime, meta.mtime)?;
        Ok(())
    }

    fn apply_xattrs(&self, dir: &Dir, base: &str, xattrs: &[(String, Vec<u8>)]) -> Result<()> {
        for (name, value) in xattrs {
            if is_denied_xattr(name) {
                tracing::debug!("ignoring denied xattr {name} on {base}");
                continue;
            }
            if let Err(e) = self.fs.set_xattr(dir, base, name, value) {
                if self.opts.best_effort_xattrs {
                    tracing::warn!("failed to set xattr {name} on {base}: {e:#}");
                } else {
                    return Err(e).with_context(|| format!("setting xattr {name}"));
                }
            }
        }
        Ok(())
    }

    /// Re-apply directory metadata in reverse depth order.
    #[context("Restoring directory metadata")]
    fn restore_directories(&mut self) -> Result<()> {
        let mut dirs: Vec<_> = std::mem::take(&mut self.dirs).into_iter().collect();
        dirs.sort_by(|(a, _), (b, _)| {
            b.components()
                .count()
                .cmp(&a.components().count())
                .then_with(|| b.cmp(a))
        });
        for (path, state) in dirs {
            let (parent_rel, base) = split_parent(&path);
            let parent = self.fs.resolve_dir(self.root, parent_rel, false)?;
            match state {
                DirState::Preexisting { atime, mtime } => {
                    self.fs.lutimes(&parent.dir, base, atime, mtime)?;
                }
                DirState::FromEntry(meta) => {
                    self.fs
                        .chmod(&parent.dir, base, meta.mode)
                        .with_context(|| format!("restoring {path}"))?;
                    self.fs.lchown(&parent.dir, base, meta.uid, meta.gid)?;
                    self.apply_xattrs(&parent.dir, base, &meta.xattrs)?;
                    self.fs
                        .lutimes(&parent.dir, base, meta.atime, meta.mtime)?;
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
struct EntryMeta {
    mode: u32,
    uid: u32,
    gid: u32,
    atime: Timestamp,
    mtime: Timestamp,
}
