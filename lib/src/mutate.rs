//! High-level mutation of an image: add layers, replace configuration,
//! and commit the result back through the descriptor path.

use std::collections::HashMap;
use std::io::{Read, Write};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use fn_error_context::context;
use oci_spec::image::{
    Arch, Config, Descriptor, DescriptorBuilder, Digest, History, ImageConfiguration,
    ImageManifest, MediaType, Os,
};
use tokio_util::sync::CancellationToken;

use crate::cas::{DescriptorPath, ImageLayout, ParsedBlob};
use crate::compression::layer_compression;
use crate::digest::HashingWriter;
use crate::{Compression, Error};

/// Annotation carrying the uncompressed size of a compressed layer.
/// Advisory only; it must never be trusted for anything
/// security-relevant.
pub const UNCOMPRESSED_SIZE_ANNOTATION: &str = "ci.umo.uncompressed_blob_size";

/// Image-wide metadata split out of the configuration.
#[derive(Debug, Clone, Default)]
pub struct Meta {
    /// Creation timestamp.
    pub created: Option<DateTime<Utc>>,
    /// Author of the image.
    pub author: Option<String>,
    /// Target architecture.
    pub architecture: Option<Arch>,
    /// Target operating system.
    pub os: Option<Os>,
}

/// A cached (manifest, configuration) pair for the target of a
/// descriptor path, with commit support.
#[derive(Debug)]
pub struct Mutator<'a> {
    layout: &'a ImageLayout,
    path: DescriptorPath,
    manifest: ImageManifest,
    config: ImageConfiguration,
}

impl<'a> Mutator<'a> {
    /// Load the manifest and configuration referenced by `path`; the
    /// path must target an image manifest.
    #[context("Opening image for mutation")]
    pub fn new(layout: &'a ImageLayout, path: DescriptorPath) -> Result<Self> {
        path.validate()?;
        let target = path.descriptor();
        if target.media_type() != &MediaType::ImageManifest {
            return Err(Error::UnsupportedMediaType(format!(
                "cannot mutate {}",
                target.media_type()
            ))
            .into());
        }
        let manifest = match layout.read_parsed_blob(target)? {
            Some(blob) => match blob.parsed {
                ParsedBlob::Manifest(m) => m,
                _ => return Err(Error::Invalid(format!("blob {} is not a manifest", target.digest())).into()),
            },
            None => return Err(Error::UnsupportedMediaType(target.media_type().to_string()).into()),
        };
        let config = match layout.read_parsed_blob(manifest.config())? {
            Some(blob) => match blob.parsed {
                ParsedBlob::Config(c) => c,
                _ => {
                    return Err(Error::Invalid(format!(
                        "blob {} is not an image configuration",
                        manifest.config().digest()
                    ))
                    .into())
                }
            },
            None => {
                return Err(
                    Error::UnsupportedMediaType(manifest.config().media_type().to_string()).into(),
                )
            }
        };
        Ok(Self {
            layout,
            path,
            manifest,
            config,
        })
    }

    /// A copy of the manifest as it currently stands.
    pub fn manifest(&self) -> ImageManifest {
        self.manifest.clone()
    }

    /// A copy of the full image configuration.
    pub fn configuration(&self) -> ImageConfiguration {
        self.config.clone()
    }

    /// A copy of the inner runtime configuration section.
    pub fn config(&self) -> Config {
        self.config.config().clone().unwrap_or_default()
    }

    /// A copy of the image-wide metadata.
    pub fn meta(&self) -> Meta {
        Meta {
            created: self
                .config
                .created()
                .as_deref()
                .and_then(|c| DateTime::parse_from_rfc3339(c).ok())
                .map(|t| t.with_timezone(&Utc)),
            author: self.config.author().clone(),
            architecture: Some(self.config.architecture().clone()),
            os: Some(self.config.os().clone()),
        }
    }

    /// A copy of the manifest annotations.
    pub fn annotations(&self) -> HashMap<String, String> {
        self.manifest.annotations().clone().unwrap_or_default()
    }

    /// The descriptor path this mutator targets.
    pub fn source(&self) -> &DescriptorPath {
        &self.path
    }

    /// Replace configuration, metadata and annotations, optionally
    /// appending a history entry (marked `empty_layer` since no layer
    /// accompanies it).
    pub fn set(
        &mut self,
        config: Config,
        meta: Meta,
        annotations: Option<HashMap<String, String>>,
        history: Option<History>,
    ) -> Result<()> {
        self.config.set_config(Some(config));
        if let Some(created) = meta.created {
            self.config
                .set_created(Some(created.to_rfc3339_opts(SecondsFormat::Secs, true)));
        }
        if let Some(author) = meta.author {
            self.config.set_author(Some(author));
        }
        if let Some(architecture) = meta.architecture {
            self.config.set_architecture(architecture);
        }
        if let Some(os) = meta.os {
            self.config.set_os(os);
        }
        if let Some(annotations) = annotations {
            self.manifest.set_annotations(Some(annotations));
        }
        if let Some(mut history) = history {
            if history.empty_layer().is_none() {
                history.set_empty_layer(Some(true));
            }
            self.config.history_mut().push(history);
        }
        Ok(())
    }

    /// The compression to use when none was requested: that of the most
    /// recent compressed layer, else gzip.
    fn inherited_compression(&self) -> Compression {
        for layer in self.manifest.layers().iter().rev() {
            if let Ok(c) = layer_compression(layer.media_type()) {
                if c != Compression::None {
                    return c;
                }
            }
        }
        Compression::Gzip
    }

    /// Append a layer whose uncompressed tar bytes are produced by
    /// `produce`, returning its descriptor.
    ///
    /// The bytes are hashed (for the DiffID) and compressed on their
    /// way into the blob store in one pass.
    #[context("Adding layer")]
    pub fn add_layer<F>(
        &mut self,
        compressor: Option<Compression>,
        history: Option<History>,
        annotations: Option<HashMap<String, String>>,
        produce: F,
    ) -> Result<Descriptor>
    where
        F: FnOnce(&mut dyn Write) -> Result<()>,
    {
        let compression = compressor.unwrap_or_else(|| self.inherited_compression());
        let blob = self.layout.blob_writer()?;
        let compressed = compression.compress(blob)?;
        let mut tee = HashingWriter::new(compressed, &oci_spec::image::DigestAlgorithm::Sha256)?;
        produce(&mut tee)?;
        let (diff_id, uncompressed_size, compressed) = tee.finish()?;
        let blob = compressed.finish().context("Finishing compression")?;
        let (digest, size) = blob.complete()?;

        let mut annotations = annotations.unwrap_or_default();
        if uncompressed_size != size {
            annotations.insert(
                UNCOMPRESSED_SIZE_ANNOTATION.to_string(),
                uncompressed_size.to_string(),
            );
        }
        let mut builder = DescriptorBuilder::default()
            .media_type(compression.media_type())
            .digest(digest)
            .size(size);
        if !annotations.is_empty() {
            builder = builder.annotations(annotations);
        }
        let descriptor = builder.build().context("Building layer descriptor")?;
        self.append_layer(descriptor.clone(), history, diff_id);
        Ok(descriptor)
    }

    /// Append a layer by copying `reader` (uncompressed tar bytes).
    pub fn add(
        &mut self,
        mut reader: impl Read,
        compressor: Option<Compression>,
        history: Option<History>,
        annotations: Option<HashMap<String, String>>,
        token: &CancellationToken,
    ) -> Result<Descriptor> {
        self.add_layer(compressor, history, annotations, |w| {
            let mut buf = vec![0u8; 128 * 1024];
            loop {
                if token.is_cancelled() {
                    return Err(Error::Cancelled.into());
                }
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    return Ok(());
                }
                w.write_all(&buf[..n])?;
            }
        })
    }

    /// Append a pre-existing blob as a layer without re-hashing it.
    #[context("Adding existing layer")]
    pub fn add_existing(
        &mut self,
        descriptor: Descriptor,
        history: Option<History>,
        diff_id: Digest,
    ) -> Result<()> {
        layer_compression(descriptor.media_type())?;
        if !self.layout.stat(descriptor.digest())? {
            return Err(Error::NotFound(format!("blob {}", descriptor.digest())).into());
        }
        self.append_layer(descriptor, history, diff_id);
        Ok(())
    }

    fn append_layer(
        &mut self,
        descriptor: Descriptor,
        history: Option<History>,
        diff_id: Digest,
    ) {
        self.manifest.layers_mut().push(descriptor);
        let mut rootfs = self.config.rootfs().clone();
        rootfs.diff_ids_mut().push(diff_id.to_string());
        self.config.set_rootfs(rootfs);
        let mut history = history.unwrap_or_default();
        if history.created().is_none() {
            history.set_created(Some(
                Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            ));
        }
        history.set_empty_layer(Some(false));
        self.config.history_mut().push(history);
    }

    /// Write the updated configuration and manifest, then rewrite every
    /// ancestor in the descriptor path (and finally the top-level
    /// index) to point at the new content. Returns the new path.
    #[context("Committing image changes")]
    pub fn commit(&mut self, token: &CancellationToken) -> Result<DescriptorPath> {
        let (config_digest, config_size) = self
            .layout
            .put_json_blob(&self.config, token)
            .context("Writing config blob")?;
        let config_desc = DescriptorBuilder::default()
            .media_type(MediaType::ImageConfig)
            .digest(config_digest)
            .size(config_size)
            .build()
            .context("Building config descriptor")?;
        self.manifest.set_config(config_desc);

        let (manifest_digest, manifest_size) = self
            .layout
            .put_json_blob(&self.manifest, token)
            .context("Writing manifest blob")?;
        // The new target keeps the old entry's annotations and
        // platform.
        let mut new_target = self.path.descriptor().clone();
        new_target.set_digest(manifest_digest);
        new_target.set_size(manifest_size);

        // Rewrite ancestors bottom-up, replacing the old child (matched
        // by digest) in each.
        let walk = self.path.walk();
        let mut new_walk = vec![new_target];
        for parent in walk[..walk.len() - 1].iter().rev() {
            let old_child_walk_index = new_walk.len();
            let old_child = &walk[walk.len() - old_child_walk_index];
            let new_child = new_walk.last().expect("non-empty").clone();
            let parsed = self
                .layout
                .read_parsed_blob(parent)?
                .ok_or_else(|| {
                    Error::UnsupportedMediaType(parent.media_type().to_string())
                })?;
            let ParsedBlob::Index(mut index) = parsed.parsed else {
                return Err(Error::Invalid(format!(
                    "descriptor path parent {} is not an index",
                    parent.digest()
                ))
                .into());
            };
            let mut replaced = false;
            let mut manifests = index.manifests().clone();
            for entry in manifests.iter_mut() {
                if entry.digest() == old_child.digest() {
                    replace_descriptor(entry, &new_child);
                    replaced = true;
                }
            }
            if !replaced {
                return Err(Error::Invalid(format!(
                    "parent index {} does not reference {}",
                    parent.digest(),
                    old_child.digest()
                ))
                .into());
            }
            index.set_manifests(manifests);
            let (digest, size) = self
                .layout
                .put_json_blob(&index, token)
                .context("Writing index blob")?;
            let mut new_parent = parent.clone();
            new_parent.set_digest(digest);
            new_parent.set_size(size);
            new_walk.push(new_parent);
        }
        new_walk.reverse();

        // Swap the old root for the new one in the top-level index.
        let old_root = self.path.root();
        let new_root = new_walk.first().expect("non-empty").clone();
        let mut index = self.layout.get_index()?;
        let mut manifests = index.manifests().clone();
        let mut replaced = false;
        for entry in manifests.iter_mut() {
            if entry.digest() == old_root.digest() {
                replace_descriptor(entry, &new_root);
                replaced = true;
            }
        }
        if !replaced {
            // The source entry is gone (e.g. re-tagged meanwhile); add
            // the new root so the commit is still reachable.
            tracing::warn!("source index entry {} disappeared; appending", old_root.digest());
            manifests.push(new_root.clone());
        }
        index.set_manifests(manifests);
        self.layout.put_index(&index)?;

        let new_path = DescriptorPath::new(new_walk)?;
        self.path = new_path.clone();
        Ok(new_path)
    }
}

/// Point `entry` at new content, preserving its annotations and
/// platform. A media-type change is suspicious (manifest/index
/// confusion) and is surfaced loudly.
fn replace_descriptor(entry: &mut Descriptor, new: &Descriptor) {
    if entry.media_type() != new.media_type() {
        tracing::warn!(
            "media-type of {} changed from {} to {} during commit",
            entry.digest(),
            entry.media_type(),
            new.media_type()
        );
        entry.set_media_type(new.media_type().clone());
    }
    entry.set_digest(new.digest().clone());
    entry.set_size(new.size());
}

#[cfg(test)]
mod tests {
    use cap_std_ext::{cap_std, cap_tempfile};
    use oci_spec::image::{ImageConfigurationBuilder, ImageIndexBuilder, ImageManifestBuilder, SCHEMA_VERSION};

    use super::*;
    use crate::cas::resolve::{
        resolve_reference_required, update_reference, REF_NAME_ANNOTATION,
    };

    /// Build a minimal image (config + one layer + manifest) tagged
    /// `name`, returning its path.
    fn build_image(layout: &ImageLayout, name: &str) -> Result<DescriptorPath> {
        let token = CancellationToken::new();
        let config = ImageConfigurationBuilder::default().build().unwrap();
        let (cd, cs) = layout.put_json_blob(&config, &token)?;
        let config_desc = DescriptorBuilder::default()
            .media_type(MediaType::ImageConfig)
            .digest(cd)
            .size(cs)
            .build()
            .unwrap();
        let manifest = ImageManifestBuilder::default()
            .schema_version(SCHEMA_VERSION)
            .config(config_desc)
            .layers(Vec::new())
            .build()
            .unwrap();
        let (md, ms) = layout.put_json_blob(&manifest, &token)?;
        let manifest_desc = DescriptorBuilder::default()
            .media_type(MediaType::ImageManifest)
            .digest(md)
            .size(ms)
            .build()
            .unwrap();
        update_reference(layout, name, &manifest_desc)?;
        resolve_reference_required(layout, name, &token)
    }

    #[test]
    fn test_add_layer_updates_manifest_and_config() -> Result<()> {
        let td = cap_tempfile::tempdir(cap_std::ambient_authority())?;
        let layout = ImageLayout::create(&td)?;
        let token = CancellationToken::new();
        let path = build_image(&layout, "latest")?;
        let mut mutator = Mutator::new(&layout, path)?;
        let desc = mutator.add(
            &b"pretend this is a tarball"[..],
            Some(Compression::Gzip),
            None,
            None,
            &token,
        )?;
        assert_eq!(desc.media_type(), &MediaType::ImageLayerGzip);
        let annotations = desc.annotations().as_ref().unwrap();
        assert_eq!(
            annotations.get(UNCOMPRESSED_SIZE_ANNOTATION).unwrap(),
            "25"
        );
        let manifest = mutator.manifest();
        assert_eq!(manifest.layers().len(), 1);
        let config = mutator.configuration();
        assert_eq!(config.rootfs().diff_ids().len(), 1);
        assert_eq!(config.history().len(), 1);
        assert_eq!(config.history()[0].empty_layer(), Some(false));

        let new_path = mutator.commit(&token)?;
        // The committed manifest resolves through the original name.
        let resolved = resolve_reference_required(&layout, "latest", &token)?;
        assert_eq!(resolved.descriptor().digest(), new_path.descriptor().digest());
        // And the layer blob verifies.
        layout.get_verified_blob(&manifest.layers()[0])?.close()?;
        Ok(())
    }

    #[test]
    fn test_commit_through_nested_index() -> Result<()> {
        let td = cap_tempfile::tempdir(cap_std::ambient_authority())?;
        let layout = ImageLayout::create(&td)?;
        let token = CancellationToken::new();
        // index -> nested index -> manifest
        let inner_path = build_image(&layout, "scratch")?;
        let mut manifest_desc = inner_path.descriptor().clone();
        // Inside the nested index the manifest is anonymous.
        manifest_desc.set_annotations(None);
        crate::cas::resolve::delete_reference(&layout, "scratch")?;
        let nested = ImageIndexBuilder::default()
            .schema_version(SCHEMA_VERSION)
            .manifests(vec![manifest_desc])
            .build()
            .unwrap();
        let (nd, ns) = layout.put_json_blob(&nested, &token)?;
        let nested_desc = DescriptorBuilder::default()
            .media_type(MediaType::ImageIndex)
            .digest(nd)
            .size(ns)
            .build()
            .unwrap();
        update_reference(&layout, "v1", &nested_desc)?;

        let path = resolve_reference_required(&layout, "v1", &token)?;
        assert_eq!(path.walk().len(), 2);
        let originals: Vec<_> = path.walk().to_vec();

        let mut mutator = Mutator::new(&layout, path)?;
        mutator.set(
            Config::default(),
            Meta {
                author: Some("test suite".into()),
                ..Default::default()
            },
            None,
            None,
        )?;
        let new_path = mutator.commit(&token)?;

        // Same shape, all digests changed, media-types preserved.
        assert_eq!(new_path.walk().len(), originals.len());
        for (old, new) in originals.iter().zip(new_path.walk()) {
            assert_ne!(old.digest(), new.digest());
            assert_eq!(old.media_type(), new.media_type());
        }
        // The root keeps its reference annotation.
        assert_eq!(
            new_path
                .root()
                .annotations()
                .as_ref()
                .and_then(|a| a.get(REF_NAME_ANNOTATION))
                .map(String::as_str),
            Some("v1")
        );
        // Resolving the name now yields the new path.
        let resolved = resolve_reference_required(&layout, "v1", &token)?;
        assert_eq!(resolved.descriptor().digest(), new_path.descriptor().digest());
        assert_eq!(resolved.root().digest(), new_path.root().digest());
        Ok(())
    }
}
