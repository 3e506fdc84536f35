//! Unpacking an image into a bundle.
//!
//! Layers are applied strictly in manifest order. For each layer the
//! blob reader and decompressor run on one blocking worker, feeding a
//! bounded in-memory pipe whose other end drives the tar extractor on a
//! second worker; the async orchestrator joins them and watches for
//! cancellation. DiffIDs are computed on the uncompressed side as the
//! bytes flow past.

use std::path::Path;

use anyhow::{Context, Result};
use cap_std::fs::Dir;
use cap_std_ext::cap_std;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use oci_spec::image::{Descriptor, Digest, DigestAlgorithm};
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::bundle::{self, BundleMeta};
use crate::cas::{DescriptorPath, ImageLayout};
use crate::compression::decompressor;
use crate::digest::HashingReader;
use crate::fseval;
use crate::idmap::MapOptions;
use crate::mutate::Mutator;
use crate::tar::{ExtractOptions, TarExtractor};
use crate::tokio_util::{run_with_cancellation, spawn_blocking_flatten};
use crate::Error;

/// Options controlling unpack.
#[derive(Debug, Default)]
pub struct UnpackOptions {
    /// The id-mapping (and rootless flag) to unpack with.
    pub map: MapOptions,
    /// Keep existing in-rootfs symlinks to directories.
    pub keep_dirlinks: bool,
    /// Whether unappliable xattrs abort the unpack.
    pub strict_xattrs: bool,
}

impl UnpackOptions {
    fn extract_options(&self) -> ExtractOptions {
        ExtractOptions {
            keep_dirlinks: self.keep_dirlinks,
            best_effort_xattrs: !self.strict_xattrs,
            ..Default::default()
        }
    }
}

/// Unpack the manifest at `path` into a fresh bundle at `bundle_path`:
/// the extracted rootfs, the runtime config, the custodial metadata and
/// the mtree snapshot driving later repacks.
#[context("Unpacking image into bundle")]
#[instrument(level = "debug", skip_all)]
pub async fn unpack(
    layout: &ImageLayout,
    path: &DescriptorPath,
    bundle_path: &Path,
    opts: &UnpackOptions,
    token: &CancellationToken,
) -> Result<()> {
    let mutator = Mutator::new(layout, path.clone())?;
    let config = mutator.configuration();
    let bundle = bundle::create_bundle_dir(bundle_path)?;
    let rootfs = bundle.open_dir(bundle::ROOTFS_NAME)?;

    unpack_rootfs(layout, path, &rootfs, opts, token).await?;

    // The mtree snapshot is the authoritative "before" state for later
    // repacks; it must observe the rootfs through the same evaluator.
    let mtree_name = bundle::mtree_name(path.descriptor().digest());
    let map = opts.map.clone();
    let walk_root = rootfs.try_clone()?;
    let walk_token = token.clone();
    let manifest_text = run_with_cancellation(
        token,
        spawn_blocking_flatten(move || {
            let fs = fseval::new(map);
            let mut buf = Vec::new();
            crate::mtree::write(&walk_root, fs.as_ref(), &mut buf, &walk_token)?;
            Ok(buf)
        }),
    )
    .await?;
    bundle.atomic_write(format!("{mtree_name}.mtree"), manifest_text)?;

    let spec = bundle::runtime_config(&config, &opts.map)?;
    bundle.atomic_write(
        bundle::CONFIG_JSON,
        serde_json::to_vec_pretty(&spec).context("Serializing runtime config")?,
    )?;

    bundle::write_meta(
        &bundle,
        &BundleMeta {
            version: bundle::META_VERSION.into(),
            from: path.clone(),
            map_options: opts.map.clone(),
            mtree_name,
        },
    )?;
    tracing::debug!("unpacked {} into {}", path.descriptor().digest(), bundle_path.display());
    Ok(())
}

/// Extract just the rootfs of the manifest at `path` into `rootfs`
/// (which must already exist), without writing any bundle metadata.
#[context("Unpacking rootfs")]
pub async fn unpack_rootfs(
    layout: &ImageLayout,
    path: &DescriptorPath,
    rootfs: &Dir,
    opts: &UnpackOptions,
    token: &CancellationToken,
) -> Result<()> {
    let mutator = Mutator::new(layout, path.clone())?;
    let manifest = mutator.manifest();
    let config = mutator.configuration();
    let diff_ids = config.rootfs().diff_ids();
    if manifest.layers().len() != diff_ids.len() {
        return Err(Error::Invalid(format!(
            "manifest has {} layers but config lists {} diff_ids",
            manifest.layers().len(),
            diff_ids.len()
        ))
        .into());
    }
    for (layer, diff_id) in manifest.layers().iter().zip(diff_ids) {
        let expected: Digest = diff_id
            .parse()
            .map_err(|_| Error::Invalid(format!("diff_id {diff_id:?}")))?;
        apply_layer(layout, layer, &expected, rootfs, opts, token)
            .await
            .with_context(|| format!("applying layer {}", layer.digest()))?;
    }
    Ok(())
}

/// Apply one layer: blob → decompress → hash DiffID → extract, with the
/// decompressor and the extractor overlapped through a bounded pipe.
async fn apply_layer(
    layout: &ImageLayout,
    layer: &Descriptor,
    expected_diff_id: &Digest,
    rootfs: &Dir,
    opts: &UnpackOptions,
    token: &CancellationToken,
) -> Result<()> {
    tracing::debug!("applying layer {}", layer.digest());
    let blob_file = layout.open_blob_file(layer.digest())?;
    let blob_digest = layer.digest().clone();
    let blob_size = layer.size();
    let media_type = layer.media_type().clone();
    let (tx, rx) = tokio::io::duplex(128 * 1024);

    let producer = spawn_blocking_flatten(move || {
        let mut blob = crate::digest::VerifiedReader::new(blob_file, blob_digest, Some(blob_size))?;
        let mut bridge = SyncIoBridge::new(tx);
        let diff_id = {
            let decompressed = decompressor(&media_type, &mut blob)?;
            let mut hashing = HashingReader::new(decompressed, &DigestAlgorithm::Sha256)?;
            std::io::copy(&mut hashing, &mut bridge).context("Streaming layer")?;
            let (diff_id, _) = hashing.finish()?;
            diff_id
        };
        // Some producers pad NUL bytes past the compressed stream but
        // inside the declared blob size; drain so verification covers
        // the whole blob.
        let trailing = std::io::copy(&mut blob, &mut std::io::sink())?;
        if trailing > 0 {
            tracing::debug!("layer has {trailing} trailing bytes");
        }
        blob.close()?;
        Ok(diff_id)
    });

    let map = opts.map.clone();
    let extract_opts = opts.extract_options();
    let extract_root = rootfs.try_clone()?;
    let extract_token = token.clone();
    let consumer = spawn_blocking_flatten(move || {
        let fs = fseval::new(map);
        let mut extractor = TarExtractor::new(&extract_root, fs.as_ref(), extract_opts);
        let mut src = SyncIoBridge::new(rx);
        extractor.unpack(&mut src, &extract_token)?;
        // Consume any tar padding so the producer is not blocked on a
        // full pipe at the end of the stream.
        std::io::copy(&mut src, &mut std::io::sink())?;
        Ok(())
    });

    let (diff_id, ()) = run_with_cancellation(token, async {
        tokio::try_join!(producer, consumer)
    })
    .await?;
    if diff_id != *expected_diff_id {
        return Err(Error::corrupt_blob(
            layer.digest(),
            format!("diff_id {diff_id} does not match {expected_diff_id}"),
        )
        .into());
    }
    Ok(())
}
