//! Synthesizing a delta layer from mtree deltas.
//!
//! The output is reproducible: entries appear in path order, numeric
//! owners are container ids, owner names are blank, and PAX extended
//! records are emitted only where a plain USTAR header cannot hold the
//! value.

use std::collections::HashMap;
use std::io::Write;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std::fs::Dir;
use cap_std_ext::cap_std;
use fn_error_context::context;
use tokio_util::sync::CancellationToken;

use super::{is_denied_xattr, PAX_SCHILY_XATTR, WHITEOUT_PREFIX};
use crate::fseval::{FileKind, FsEval};
use crate::mtree::{Delta, DeltaKind, MtreeEntry};
use crate::Error;

/// Largest value representable in a USTAR octal id field.
const USTAR_MAX_ID: u32 = 0o7777777;
/// Longest path that fits the USTAR name field.
const USTAR_MAX_NAME: usize = 100;

/// Options controlling layer generation.
#[derive(Debug, Default)]
pub struct GenerateOptions {
    /// Path prefixes (relative to the rootfs) whose changes are never
    /// emitted; typically the image config's volumes.
    pub masked_paths: Vec<Utf8PathBuf>,
}

impl GenerateOptions {
    fn is_masked(&self, path: &Utf8Path) -> bool {
        self.masked_paths.iter().any(|mask| {
            let mask = Utf8Path::new(mask.as_str().trim_start_matches('/'));
            path.starts_with(mask)
        })
    }
}

/// Write a tar stream encoding `deltas` into `out`.
///
/// `Relevant` deltas (parents perturbed by child edits) are filtered
/// out; deletions become whiteouts; everything else is read back from
/// the rootfs through the evaluator.
#[context("Generating delta layer")]
pub fn generate_layer(
    root: &Dir,
    fs: &dyn FsEval,
    deltas: &[Delta],
    opts: &GenerateOptions,
    out: impl Write,
    token: &CancellationToken,
) -> Result<()> {
    let mut builder = tar::Builder::new(out);
    let mut deleted_dirs: Vec<Utf8PathBuf> = Vec::new();
    // Hardlink bookkeeping: first path seen for an inode wins.
    let mut seen_inodes: HashMap<(u64, u64), Utf8PathBuf> = HashMap::new();

    for delta in deltas {
        if token.is_cancelled() {
            return Err(Error::Cancelled.into());
        }
        if opts.is_masked(&delta.path) {
            tracing::debug!("masking delta for {}", delta.path);
            continue;
        }
        match delta.kind {
            DeltaKind::Relevant => continue,
            DeltaKind::Deleted => {
                // A whiteout under an already-whited-out directory is
                // redundant.
                if deleted_dirs.iter().any(|d| delta.path.starts_with(d)) {
                    continue;
                }
                if delta.old.as_ref().map(|o| o.kind) == Some(FileKind::Dir) {
                    deleted_dirs.push(delta.path.clone());
                }
                append_whiteout(&mut builder, &delta.path)
                    .with_context(|| format!("whiteout for {}", delta.path))?;
            }
            DeltaKind::Added | DeltaKind::Modified => {
                let entry = delta.new.as_ref().expect("disk side present");
                append_entry(&mut builder, root, fs, entry, &mut seen_inodes)
                    .with_context(|| format!("archiving {}", delta.path))?;
            }
        }
    }
    builder.finish()?;
    Ok(())
}

fn append_whiteout(builder: &mut tar::Builder<impl Write>, path: &Utf8Path) -> Result<()> {
    let base = path
        .file_name()
        .ok_or_else(|| Error::Invalid(format!("cannot whiteout {path}")))?;
    let name = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => {
            parent.join(format!("{WHITEOUT_PREFIX}{base}"))
        }
        _ => Utf8PathBuf::from(format!("{WHITEOUT_PREFIX}{base}")),
    };
    let mut header = tar::Header::new_ustar();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(0);
    header.set_mode(0);
    header.set_mtime(0);
    append_with_long_name(builder, &mut header, &name, std::io::empty())?;
    Ok(())
}

fn append_entry(
    builder: &mut tar::Builder<impl Write>,
    root: &Dir,
    fs: &dyn FsEval,
    entry: &MtreeEntry,
    seen_inodes: &mut HashMap<(u64, u64), Utf8PathBuf>,
) -> Result<()> {
    let path = &entry.path;
    let (parent_rel, base) = match (path.parent(), path.file_name()) {
        (Some(p), Some(b)) => (p, b),
        // The rootfs itself: emitted as a `./` directory entry.
        _ => (Utf8Path::new(""), "."),
    };
    let parent = fs.resolve_dir(root, parent_rel, false)?;
    let Some(md) = fs.metadata(&parent.dir, base)? else {
        return Err(Error::NotFound(format!("{path} vanished during generation")).into());
    };

    let mut pax: Vec<(String, Vec<u8>)> = Vec::new();
    for (key, value) in &entry.xattrs {
        if is_denied_xattr(key) {
            continue;
        }
        pax.push((format!("{PAX_SCHILY_XATTR}{key}"), value.clone()));
    }
    if entry.uid > USTAR_MAX_ID {
        pax.push(("uid".into(), entry.uid.to_string().into_bytes()));
    }
    if entry.gid > USTAR_MAX_ID {
        pax.push(("gid".into(), entry.gid.to_string().into_bytes()));
    }

    let mut header = tar::Header::new_ustar();
    header.set_mode(entry.mode);
    header.set_uid(entry.uid.min(USTAR_MAX_ID) as u64);
    header.set_gid(entry.gid.min(USTAR_MAX_ID) as u64);
    header.set_mtime(entry.tar_time.max(0) as u64);

    match entry.kind {
        FileKind::File => {
            // Represent further links to an already-archived inode as
            // hardlink entries.
            if md.nlink > 1 {
                if let Some(first) = seen_inodes.get(&(md.dev, md.ino)) {
                    header.set_entry_type(tar::EntryType::Link);
                    header.set_size(0);
                    if !pax.is_empty() {
                        append_pax(builder, &pax)?;
                    }
                    builder.append_link(&mut header, path, first)?;
                    return Ok(());
                }
                seen_inodes.insert((md.dev, md.ino), path.clone());
            }
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(md.size);
            let f = fs.open(&parent.dir, base)?;
            if !pax.is_empty() {
                append_pax(builder, &pax)?;
            }
            append_with_long_name(builder, &mut header, path, std::io::BufReader::new(f))?;
        }
        FileKind::Dir => {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            if !pax.is_empty() {
                append_pax(builder, &pax)?;
            }
            append_with_long_name(builder, &mut header, path, std::io::empty())?;
        }
        FileKind::Symlink => {
            let target = entry
                .link
                .clone()
                .map(Ok)
                .unwrap_or_else(|| fs.read_link(&parent.dir, base))?;
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            if target.len() > USTAR_MAX_NAME {
                pax.push(("linkpath".into(), target.clone().into_bytes()));
            }
            if !pax.is_empty() {
                append_pax(builder, &pax)?;
            }
            if target.len() > USTAR_MAX_NAME {
                let truncated: String = target.chars().take(USTAR_MAX_NAME / 2).collect();
                header.set_link_name(&truncated)?;
                append_with_long_name(builder, &mut header, path, std::io::empty())?;
            } else {
                builder.append_link(&mut header, path, &target)?;
            }
        }
        FileKind::Char | FileKind::Block => {
            header.set_entry_type(if entry.kind == FileKind::Char {
                tar::EntryType::Char
            } else {
                tar::EntryType::Block
            });
            header.set_size(0);
            header.set_device_major(md.rdev_major)?;
            header.set_device_minor(md.rdev_minor)?;
            if !pax.is_empty() {
                append_pax(builder, &pax)?;
            }
            append_with_long_name(builder, &mut header, path, std::io::empty())?;
        }
        FileKind::Fifo => {
            header.set_entry_type(tar::EntryType::Fifo);
            header.set_size(0);
            if !pax.is_empty() {
                append_pax(builder, &pax)?;
            }
            append_with_long_name(builder, &mut header, path, std::io::empty())?;
        }
        FileKind::Socket => {
            return Err(Error::Invalid(format!("cannot archive socket {path}")).into());
        }
    }
    Ok(())
}

fn append_pax(
    builder: &mut tar::Builder<impl Write>,
    records: &[(String, Vec<u8>)],
) -> Result<()> {
    builder.append_pax_extensions(records.iter().map(|(k, v)| (k.as_str(), v.as_slice())))?;
    Ok(())
}

/// Append an entry, using a PAX `path` record (rather than GNU long
/// name entries) when the path exceeds the USTAR name field.
fn append_with_long_name(
    builder: &mut tar::Builder<impl Write>,
    header: &mut tar::Header,
    path: &Utf8Path,
    data: impl std::io::Read,
) -> Result<()> {
    if path.as_str().len() > USTAR_MAX_NAME {
        builder.append_pax_extensions([("path", path.as_str().as_bytes())])?;
        let truncated: String = path.as_str().chars().take(USTAR_MAX_NAME / 2).collect();
        header.set_path(&truncated)?;
        header.set_cksum();
        builder.append(header, data)?;
    } else {
        builder.append_data(header, path, data)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use cap_std_ext::{cap_std, cap_tempfile};

    use super::*;
    use crate::fseval::PrivilegedFsEval;
    use crate::idmap::MapOptions;
    use crate::mtree;

    fn generate(
        td: &Dir,
        manifest: &[MtreeEntry],
        opts: &GenerateOptions,
    ) -> Result<Vec<u8>> {
        let fs = PrivilegedFsEval::new(MapOptions::default());
        let token = CancellationToken::new();
        let deltas = mtree::check(td, &fs, manifest, &token)?;
        let mut buf = Vec::new();
        generate_layer(td, &fs, &deltas, opts, &mut buf, &token)?;
        Ok(buf)
    }

    fn entry_names(tarball: &[u8]) -> Vec<String> {
        let mut archive = tar::Archive::new(tarball);
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_delta_layer_contents() -> Result<()> {
        let td = cap_tempfile::tempdir(cap_std::ambient_authority())?;
        td.create_dir("d")?;
        td.write("d/gone", b"bye")?;
        td.write("kept", b"same")?;
        let fs = PrivilegedFsEval::new(MapOptions::default());
        let token = CancellationToken::new();
        let manifest = mtree::walk(&td, &fs, &token)?;

        td.remove_file("d/gone")?;
        td.write("fresh", b"new content")?;

        let tarball = generate(&td, &manifest, &GenerateOptions::default())?;
        let names = entry_names(&tarball);
        assert!(names.contains(&"d/.wh.gone".to_string()), "{names:?}");
        assert!(names.contains(&"fresh".to_string()), "{names:?}");
        assert!(!names.iter().any(|n| n.contains("kept")), "{names:?}");

        // Determinism: generating twice yields identical bytes.
        let again = generate(&td, &manifest, &GenerateOptions::default())?;
        assert_eq!(tarball, again);
        Ok(())
    }

    #[test]
    fn test_deleted_directory_single_whiteout() -> Result<()> {
        let td = cap_tempfile::tempdir(cap_std::ambient_authority())?;
        td.create_dir_all("dir/sub")?;
        td.write("dir/sub/f", b"x")?;
        let fs = PrivilegedFsEval::new(MapOptions::default());
        let token = CancellationToken::new();
        let manifest = mtree::walk(&td, &fs, &token)?;

        td.remove_dir_all("dir")?;
        let tarball = generate(&td, &manifest, &GenerateOptions::default())?;
        let names = entry_names(&tarball);
        assert_eq!(names, vec![".wh.dir"]);
        Ok(())
    }

    #[test]
    fn test_masked_paths_omitted() -> Result<()> {
        let td = cap_tempfile::tempdir(cap_std::ambient_authority())?;
        td.create_dir("volume")?;
        let fs = PrivilegedFsEval::new(MapOptions::default());
        let token = CancellationToken::new();
        let manifest = mtree::walk(&td, &fs, &token)?;

        td.write("volume/scratch", b"ephemeral")?;
        td.write("real", b"payload")?;
        let opts = GenerateOptions {
            masked_paths: vec!["/volume".into()],
        };
        let tarball = generate(&td, &manifest, &opts)?;
        let names = entry_names(&tarball);
        assert!(names.contains(&"real".to_string()), "{names:?}");
        assert!(!names.iter().any(|n| n.starts_with("volume")), "{names:?}");
        Ok(())
    }

    #[test]
    fn test_hardlinks_become_link_entries() -> Result<()> {
        let td = cap_tempfile::tempdir(cap_std::ambient_authority())?;
        let fs = PrivilegedFsEval::new(MapOptions::default());
        let token = CancellationToken::new();
        let manifest = mtree::walk(&td, &fs, &token)?;

        td.write("one", b"shared")?;
        td.hard_link("one", &td, "two")?;
        let tarball = generate(&td, &manifest, &GenerateOptions::default())?;
        let mut archive = tar::Archive::new(tarball.as_slice());
        let mut kinds = Vec::new();
        for e in archive.entries()? {
            let e = e?;
            kinds.push((
                e.path()?.to_string_lossy().into_owned(),
                e.header().entry_type(),
            ));
        }
        assert_eq!(
            kinds,
            vec![
                ("one".to_string(), tar::EntryType::Regular),
                ("two".to_string(), tar::EntryType::Link),
            ]
        );
        Ok(())
    }
}
