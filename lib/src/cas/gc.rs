//! Garbage collection of unreferenced blobs.

use std::collections::HashSet;

use anyhow::{Context, Result};
use fn_error_context::context;
use oci_spec::image::Digest;
use tokio_util::sync::CancellationToken;

use super::walk::child_descriptors;
use super::ImageLayout;
use crate::Error;

/// A per-digest policy consulted before deleting an unreachable blob.
/// Returning `false` retains the blob; an error aborts the collection.
pub type GcPolicy<'a> = dyn FnMut(&Digest) -> Result<bool> + 'a;

/// The outcome of a garbage collection pass.
#[derive(Debug, Default)]
pub struct GcSummary {
    /// Digests that were deleted.
    pub removed: Vec<Digest>,
    /// Unreachable digests retained by the policy.
    pub retained: Vec<Digest>,
}

/// Compute the set of digests reachable from the top-level index.
///
/// Every visited blob is digest-verified as it is read; a reachable blob
/// that fails verification aborts the walk.
#[context("Computing reachable set")]
pub fn reachable(layout: &ImageLayout, token: &CancellationToken) -> Result<HashSet<String>> {
    let index = layout.get_index()?;
    let mut seen = HashSet::new();
    let mut queue: Vec<_> = index.manifests().to_vec();
    while let Some(desc) = queue.pop() {
        if token.is_cancelled() {
            return Err(Error::Cancelled.into());
        }
        if !seen.insert(desc.digest().to_string()) {
            continue;
        }
        let Some(blob) = layout
            .read_parsed_blob(&desc)
            .with_context(|| format!("Walking {}", desc.digest()))?
        else {
            // Opaque leaf; reachable but nothing to descend into.
            continue;
        };
        queue.extend(child_descriptors(&blob.parsed));
    }
    Ok(seen)
}

/// Delete every blob not reachable from the index, consulting `policy`
/// (when given) for each candidate, then clean up stray temporaries.
#[context("Garbage collecting image")]
pub fn gc(
    layout: &ImageLayout,
    mut policy: Option<&mut GcPolicy<'_>>,
    token: &CancellationToken,
) -> Result<GcSummary> {
    let reachable = reachable(layout, token)?;
    let mut summary = GcSummary::default();
    for digest in layout.list()? {
        if token.is_cancelled() {
            return Err(Error::Cancelled.into());
        }
        if reachable.contains(&digest.to_string()) {
            continue;
        }
        if let Some(policy) = policy.as_deref_mut() {
            if !policy(&digest).context("GC policy")? {
                tracing::debug!("gc: policy retained {digest}");
                summary.retained.push(digest);
                continue;
            }
        }
        tracing::debug!("gc: removing {digest}");
        // Deletion is idempotent, so a blob disappearing between the
        // enumeration and this call is fine.
        layout.delete(&digest)?;
        summary.removed.push(digest);
    }
    layout.clean()?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use cap_std_ext::{cap_std, cap_tempfile};
    use oci_spec::image::{
        DescriptorBuilder, ImageConfigurationBuilder, ImageManifestBuilder, MediaType,
        SCHEMA_VERSION,
    };

    use super::super::resolve::update_reference;
    use super::*;

    #[test]
    fn test_gc_reachability() -> Result<()> {
        let td = cap_tempfile::tempdir(cap_std::ambient_authority())?;
        let layout = ImageLayout::create(&td)?;
        let token = CancellationToken::new();

        // A config and a layer, referenced from a manifest in the index.
        let config = ImageConfigurationBuilder::default().build().unwrap();
        let (config_digest, config_size) = layout.put_json_blob(&config, &token)?;
        let (layer_digest, layer_size) = layout.put_blob(&b"layer-bytes"[..], &token)?;
        let manifest = ImageManifestBuilder::default()
            .schema_version(SCHEMA_VERSION)
            .config(
                DescriptorBuilder::default()
                    .media_type(MediaType::ImageConfig)
                    .digest(config_digest.clone())
                    .size(config_size)
                    .build()
                    .unwrap(),
            )
            .layers(vec![DescriptorBuilder::default()
                .media_type(MediaType::ImageLayer)
                .digest(layer_digest.clone())
                .size(layer_size)
                .build()
                .unwrap()])
            .build()
            .unwrap();
        let (manifest_digest, manifest_size) = layout.put_json_blob(&manifest, &token)?;
        let manifest_desc = DescriptorBuilder::default()
            .media_type(MediaType::ImageManifest)
            .digest(manifest_digest.clone())
            .size(manifest_size)
            .build()
            .unwrap();
        update_reference(&layout, "latest", &manifest_desc)?;

        // And one orphan.
        let (orphan, _) = layout.put_blob(&b"orphan"[..], &token)?;

        let summary = gc(&layout, None, &token)?;
        assert_eq!(summary.removed.len(), 1);
        assert_eq!(summary.removed[0], orphan);
        assert!(layout.stat(&config_digest)?);
        assert!(layout.stat(&layer_digest)?);
        assert!(layout.stat(&manifest_digest)?);
        assert!(!layout.stat(&orphan)?);

        // A second pass is a no-op.
        let summary = gc(&layout, None, &token)?;
        assert!(summary.removed.is_empty());
        Ok(())
    }

    #[test]
    fn test_gc_policy() -> Result<()> {
        let td = cap_tempfile::tempdir(cap_std::ambient_authority())?;
        let layout = ImageLayout::create(&td)?;
        let token = CancellationToken::new();
        let (keep, _) = layout.put_blob(&b"keep-me"[..], &token)?;
        let (drop_it, _) = layout.put_blob(&b"drop-me"[..], &token)?;

        let keep2 = keep.clone();
        let mut policy = move |d: &Digest| Ok(*d != keep2);
        let summary = gc(&layout, Some(&mut policy), &token)?;
        assert_eq!(summary.removed, vec![drop_it]);
        assert_eq!(summary.retained, vec![keep.clone()]);
        assert!(layout.stat(&keep)?);

        // A failing policy aborts.
        let mut failing = |_: &Digest| anyhow::bail!("boom");
        assert!(gc(&layout, Some(&mut failing), &token).is_err());
        assert!(layout.stat(&keep)?);
        Ok(())
    }

    #[test]
    fn test_gc_cancellation() -> Result<()> {
        let td = cap_tempfile::tempdir(cap_std::ambient_authority())?;
        let layout = ImageLayout::create(&td)?;
        let token = CancellationToken::new();
        layout.put_blob(&b"blob"[..], &token)?;
        token.cancel();
        let err = gc(&layout, None, &token).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::Cancelled)
        ));
        Ok(())
    }
}
