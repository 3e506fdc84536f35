//! Comparing a manifest against the current rootfs state.

use std::collections::BTreeMap;

use anyhow::Result;
use camino::Utf8PathBuf;
use cap_std::fs::Dir;
use cap_std_ext::cap_std;
use fn_error_context::context;
use tokio_util::sync::CancellationToken;

use super::{walk, MtreeEntry};
use crate::fseval::{FileKind, FsEval};

/// How a path differs from the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaKind {
    /// On disk but not in the manifest.
    Added,
    /// In both, with differing keywords.
    Modified,
    /// In the manifest but not on disk.
    Deleted,
    /// A directory perturbed only by changes to its children
    /// (`tar_time`/`size`/`nlink`); usually filtered out.
    Relevant,
}

/// One difference between the manifest and the rootfs.
#[derive(Debug, Clone)]
pub struct Delta {
    /// The path that differs.
    pub path: Utf8PathBuf,
    /// The difference category.
    pub kind: DeltaKind,
    /// Manifest-side entry (absent for `Added`).
    pub old: Option<MtreeEntry>,
    /// Disk-side entry (absent for `Deleted`).
    pub new: Option<MtreeEntry>,
    /// Names of the keywords that differ (for `Modified`/`Relevant`).
    pub changed: Vec<&'static str>,
}

/// Keywords treated as pure child-perturbation noise on directories.
const DIR_NOISE_KEYWORDS: &[&str] = &["tar_time", "size", "nlink"];

fn changed_keywords(old: &MtreeEntry, new: &MtreeEntry) -> Vec<&'static str> {
    let mut r = Vec::new();
    if old.kind != new.kind {
        r.push("type");
    }
    if old.kind == FileKind::File && old.size != new.size {
        r.push("size");
    }
    if old.uid != new.uid {
        r.push("uid");
    }
    if old.gid != new.gid {
        r.push("gid");
    }
    if old.mode != new.mode {
        r.push("mode");
    }
    if old.link != new.link {
        r.push("link");
    }
    if old.nlink != new.nlink {
        r.push("nlink");
    }
    if old.tar_time != new.tar_time {
        r.push("tar_time");
    }
    if old.sha256 != new.sha256 {
        r.push("sha256digest");
    }
    if old.xattrs != new.xattrs {
        r.push("xattr");
    }
    r
}

/// Compare `manifest` against the rootfs, returning every difference in
/// path order.
#[context("Checking rootfs against manifest")]
pub fn check(
    root: &Dir,
    fs: &dyn FsEval,
    manifest: &[MtreeEntry],
    token: &CancellationToken,
) -> Result<Vec<Delta>> {
    let current = walk(root, fs, token)?;
    let old: BTreeMap<_, _> = manifest.iter().map(|e| (e.path.clone(), e)).collect();
    let new: BTreeMap<_, _> = current.iter().map(|e| (e.path.clone(), e)).collect();

    let mut deltas = Vec::new();
    let paths: std::collections::BTreeSet<_> = old.keys().chain(new.keys()).cloned().collect();
    for path in paths {
        match (old.get(&path), new.get(&path)) {
            (Some(o), Some(n)) => {
                let changed = changed_keywords(o, n);
                if changed.is_empty() {
                    continue;
                }
                let kind = if o.kind == FileKind::Dir
                    && n.kind == FileKind::Dir
                    && changed.iter().all(|k| DIR_NOISE_KEYWORDS.contains(k))
                {
                    DeltaKind::Relevant
                } else {
                    DeltaKind::Modified
                };
                deltas.push(Delta {
                    path,
                    kind,
                    old: Some((*o).clone()),
                    new: Some((*n).clone()),
                    changed,
                });
            }
            (None, Some(n)) => deltas.push(Delta {
                path,
                kind: DeltaKind::Added,
                old: None,
                new: Some((*n).clone()),
                changed: Vec::new(),
            }),
            (Some(o), None) => deltas.push(Delta {
                path,
                kind: DeltaKind::Deleted,
                old: Some((*o).clone()),
                new: None,
                changed: Vec::new(),
            }),
            (None, None) => unreachable!(),
        }
    }
    Ok(deltas)
}

#[cfg(test)]
mod tests {
    use cap_std_ext::{cap_std, cap_tempfile};

    use super::*;
    use crate::fseval::PrivilegedFsEval;
    use crate::idmap::MapOptions;

    #[test]
    fn test_check_detects_changes() -> Result<()> {
        let td = cap_tempfile::tempdir(cap_std::ambient_authority())?;
        td.create_dir_all("a/b")?;
        td.write("a/b/c", b"X")?;
        td.write("keep", b"same")?;
        let fs = PrivilegedFsEval::new(MapOptions::default());
        let token = CancellationToken::new();
        // Pin the directory mtime in the past so the later deletion
        // observably bumps it.
        {
            let a = fs.resolve_dir(&td, camino::Utf8Path::new("a"), false)?;
            fs.lutimes(&a.dir, "b", (1000, 0), (1000, 0))?;
        }
        let manifest = walk(&td, &fs, &token)?;

        // No changes yet.
        assert!(check(&td, &fs, &manifest, &token)?.is_empty());

        // Delete a file, add a file, modify another.
        td.remove_file("a/b/c")?;
        td.write("new", b"fresh")?;
        td.write("keep", b"changed!")?;
        let deltas = check(&td, &fs, &manifest, &token)?;

        let find = |p: &str| deltas.iter().find(|d| d.path == p);
        let deleted = find("a/b/c").expect("deleted delta");
        assert_eq!(deleted.kind, DeltaKind::Deleted);
        let added = find("new").expect("added delta");
        assert_eq!(added.kind, DeltaKind::Added);
        let modified = find("keep").expect("modified delta");
        assert_eq!(modified.kind, DeltaKind::Modified);
        assert!(modified.changed.contains(&"sha256digest"));
        assert!(modified.changed.contains(&"size"));
        // The parent dir of the deletion shows up only as Relevant.
        let parent = find("a/b").expect("parent delta");
        assert_eq!(parent.kind, DeltaKind::Relevant);
        // Exactly one Deleted delta (S3 shape).
        assert_eq!(
            deltas
                .iter()
                .filter(|d| d.kind == DeltaKind::Deleted)
                .count(),
            1
        );
        Ok(())
    }
}
