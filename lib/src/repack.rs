//! Repacking a modified bundle into a new image.
//!
//! The mtree snapshot taken at unpack time is checked against the
//! rootfs; the resulting deltas (filtered against masked paths and
//! parent-perturbation noise) are streamed through the tar generator,
//! the DiffID hasher and the compressor straight into the blob store,
//! and the mutator commits the new layer up the original descriptor
//! path.

use std::path::Path;

use anyhow::{Context, Result};
use fn_error_context::context;
use oci_spec::image::History;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::bundle;
use crate::cas::resolve::update_reference;
use crate::cas::{DescriptorPath, ImageLayout};
use crate::fseval;
use crate::mtree::{self, DeltaKind};
use crate::mutate::Mutator;
use crate::tar::{generate_layer, GenerateOptions};
use crate::tokio_util::{run_with_cancellation, spawn_blocking_flatten};
use crate::Compression;

/// Options controlling repack.
#[derive(Debug, Default)]
pub struct RepackOptions {
    /// Additional masked path prefixes, on top of the config volumes.
    pub masks: Vec<String>,
    /// Do not mask the image config's volumes.
    pub no_mask_volumes: bool,
    /// After committing, re-snapshot the bundle so it can be repacked
    /// again incrementally.
    pub refresh_bundle: bool,
    /// Layer compression; `None` inherits from the previous layers.
    pub compression: Option<Compression>,
    /// History entry to record for the new layer.
    pub history: Option<History>,
}

/// Repack the bundle at `bundle_path` onto its source image, updating
/// reference `name` to the committed manifest. Returns the new
/// descriptor path.
#[context("Repacking bundle")]
#[instrument(level = "debug", skip_all)]
pub async fn repack(
    layout: &ImageLayout,
    name: &str,
    bundle_path: &Path,
    opts: &RepackOptions,
    token: &CancellationToken,
) -> Result<DescriptorPath> {
    let bundle = bundle::open_bundle_dir(bundle_path)?;
    let meta = bundle::read_meta(&bundle)?;
    let mut mutator = Mutator::new(layout, meta.from.clone())?;

    let manifest_file = bundle
        .open(format!("{}.mtree", meta.mtree_name))
        .context("Opening mtree snapshot")?;
    let snapshot = mtree::parse(std::io::BufReader::new(manifest_file.into_std()))?;

    // Diff the rootfs against the snapshot on a blocking worker.
    let rootfs = bundle.open_dir(bundle::ROOTFS_NAME)?;
    let map = meta.map_options.clone();
    let check_root = rootfs.try_clone()?;
    let check_token = token.clone();
    let deltas = run_with_cancellation(
        token,
        spawn_blocking_flatten(move || {
            let fs = fseval::new(map);
            mtree::check(&check_root, fs.as_ref(), &snapshot, &check_token)
        }),
    )
    .await?;

    let mut generate_opts = GenerateOptions::default();
    if !opts.no_mask_volumes {
        generate_opts.masked_paths = bundle::config_volumes(&mutator.configuration())
            .into_iter()
            .map(Into::into)
            .collect();
    }
    generate_opts
        .masked_paths
        .extend(opts.masks.iter().map(Into::into));

    let effective = deltas
        .iter()
        .filter(|d| d.kind != DeltaKind::Relevant)
        .filter(|d| {
            !generate_opts
                .masked_paths
                .iter()
                .any(|m| d.path.starts_with(m.as_str().trim_start_matches('/')))
        })
        .count();
    if effective == 0 {
        tracing::info!("no changes to repack");
    } else {
        let fs = fseval::new(meta.map_options.clone());
        mutator.add_layer(opts.compression, opts.history.clone(), None, |w| {
            generate_layer(&rootfs, fs.as_ref(), &deltas, &generate_opts, w, token)
        })?;
    }

    let new_path = mutator.commit(token)?;
    update_reference(layout, name, new_path.root())?;

    if opts.refresh_bundle {
        refresh_bundle(&bundle, &meta, &new_path, token).await?;
    }
    Ok(new_path)
}

/// Point the bundle at the just-committed image: fresh snapshot, fresh
/// metadata, old snapshot removed.
#[context("Refreshing bundle")]
async fn refresh_bundle(
    bundle: &cap_std_ext::cap_std::fs::Dir,
    old_meta: &bundle::BundleMeta,
    new_path: &DescriptorPath,
    token: &CancellationToken,
) -> Result<()> {
    use cap_std_ext::dirext::CapStdExtDirExt;

    let mtree_name = bundle::mtree_name(new_path.descriptor().digest());
    let map = old_meta.map_options.clone();
    let walk_root = bundle.open_dir(bundle::ROOTFS_NAME)?;
    let walk_token = token.clone();
    let manifest_text = run_with_cancellation(
        token,
        spawn_blocking_flatten(move || {
            let fs = fseval::new(map);
            let mut buf = Vec::new();
            mtree::write(&walk_root, fs.as_ref(), &mut buf, &walk_token)?;
            Ok(buf)
        }),
    )
    .await?;
    bundle.atomic_write(format!("{mtree_name}.mtree"), manifest_text)?;
    if mtree_name != old_meta.mtree_name {
        let _ = bundle.remove_file(format!("{}.mtree", old_meta.mtree_name));
    }
    bundle::write_meta(
        bundle,
        &bundle::BundleMeta {
            version: bundle::META_VERSION.into(),
            from: new_path.clone(),
            map_options: old_meta.map_options.clone(),
            mtree_name,
        },
    )
}

#[cfg(test)]
mod tests {
    use cap_std_ext::{cap_std, cap_tempfile};

    use super::*;
    use crate::cas::resolve::resolve_reference_required;
    use crate::unpack::{unpack, UnpackOptions};

    /// Unpack → modify → repack → unpack again, and compare the two
    /// bundles.
    #[tokio::test]
    async fn test_unpack_repack_roundtrip() -> Result<()> {
        let td = cap_tempfile::tempdir(cap_std::ambient_authority())?;
        let host = tempfile::tempdir()?;
        let layout = crate::cas::ImageLayout::create(&td)?;
        let token = CancellationToken::new();

        // Seed image: a couple of files and a directory.
        let path = crate::unpack::tests::build_image(&layout, |b| {
            let mut h = tar::Header::new_ustar();
            h.set_entry_type(tar::EntryType::Directory);
            h.set_mode(0o755);
            h.set_size(0);
            h.set_mtime(42);
            b.append_data(&mut h, "data", &[][..])?;
            let mut h = tar::Header::new_ustar();
            h.set_entry_type(tar::EntryType::Regular);
            h.set_mode(0o644);
            h.set_size(3);
            h.set_mtime(42);
            b.append_data(&mut h, "data/keep", &b"old"[..])?;
            let mut h = tar::Header::new_ustar();
            h.set_entry_type(tar::EntryType::Regular);
            h.set_mode(0o600);
            h.set_size(6);
            h.set_mtime(42);
            b.append_data(&mut h, "data/gone", &b"delete"[..])
        })?;

        let bundle_path = host.path().join("bundle");
        unpack(&layout, &path, &bundle_path, &UnpackOptions::default(), &token).await?;

        // Mutate the bundle.
        let bundle = bundle::open_bundle_dir(&bundle_path)?;
        let rootfs = bundle.open_dir(bundle::ROOTFS_NAME)?;
        rootfs.write("data/added", b"fresh")?;
        rootfs.remove_file("data/gone")?;

        let new_path = repack(
            &layout,
            "latest",
            &bundle_path,
            &RepackOptions::default(),
            &token,
        )
        .await?;
        assert_ne!(
            new_path.descriptor().digest(),
            path.descriptor().digest()
        );
        // The new manifest gained a delta layer and resolves by name.
        let resolved = resolve_reference_required(&layout, "latest", &token)?;
        assert_eq!(resolved.descriptor().digest(), new_path.descriptor().digest());
        let mutator = Mutator::new(&layout, new_path.clone())?;
        assert_eq!(mutator.manifest().layers().len(), 2);
        assert_eq!(mutator.configuration().rootfs().diff_ids().len(), 2);

        // Unpacking the committed image reproduces the modified rootfs.
        let bundle2_path = host.path().join("bundle2");
        unpack(&layout, &new_path, &bundle2_path, &UnpackOptions::default(), &token).await?;
        let bundle2 = bundle::open_bundle_dir(&bundle2_path)?;
        let rootfs2 = bundle2.open_dir(bundle::ROOTFS_NAME)?;
        assert_eq!(rootfs2.read("data/keep")?, b"old");
        assert_eq!(rootfs2.read("data/added")?, b"fresh");
        assert!(!rootfs2.try_exists("data/gone")?);
        Ok(())
    }

    /// Repacking an unmodified bundle adds no layer.
    #[tokio::test]
    async fn test_repack_without_changes() -> Result<()> {
        let td = cap_tempfile::tempdir(cap_std::ambient_authority())?;
        let host = tempfile::tempdir()?;
        let layout = crate::cas::ImageLayout::create(&td)?;
        let token = CancellationToken::new();
        let path = crate::unpack::tests::build_image(&layout, |b| {
            let mut h = tar::Header::new_ustar();
            h.set_entry_type(tar::EntryType::Regular);
            h.set_mode(0o644);
            h.set_size(1);
            h.set_mtime(7);
            b.append_data(&mut h, "f", &b"x"[..])
        })?;
        let bundle_path = host.path().join("bundle");
        unpack(&layout, &path, &bundle_path, &UnpackOptions::default(), &token).await?;
        let new_path = repack(
            &layout,
            "latest",
            &bundle_path,
            &RepackOptions::default(),
            &token,
        )
        .await?;
        let mutator = Mutator::new(&layout, new_path)?;
        assert_eq!(mutator.manifest().layers().len(), 1);
        Ok(())
    }

    /// Changes under a volume are masked out of the delta layer.
    #[tokio::test]
    async fn test_repack_masks() -> Result<()> {
        let td = cap_tempfile::tempdir(cap_std::ambient_authority())?;
        let host = tempfile::tempdir()?;
        let layout = crate::cas::ImageLayout::create(&td)?;
        let token = CancellationToken::new();
        let path = crate::unpack::tests::build_image(&layout, |b| {
            let mut h = tar::Header::new_ustar();
            h.set_entry_type(tar::EntryType::Directory);
            h.set_mode(0o755);
            h.set_size(0);
            h.set_mtime(7);
            b.append_data(&mut h, "scratch", &[][..])
        })?;
        let bundle_path = host.path().join("bundle");
        unpack(&layout, &path, &bundle_path, &UnpackOptions::default(), &token).await?;
        let bundle = bundle::open_bundle_dir(&bundle_path)?;
        let rootfs = bundle.open_dir(bundle::ROOTFS_NAME)?;
        rootfs.write("scratch/junk", b"ephemeral")?;

        let opts = RepackOptions {
            masks: vec!["/scratch".into()],
            ..Default::default()
        };
        let new_path = repack(&layout, "latest", &bundle_path, &opts, &token).await?;
        // Nothing but masked changes: no layer added.
        let mutator = Mutator::new(&layout, new_path)?;
        assert_eq!(mutator.manifest().layers().len(), 1);
        Ok(())
    }
}
