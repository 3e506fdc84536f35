//! Descriptor enumeration over parsed blobs.
//!
//! Exactly the descriptors embedded in the OCI image-spec types are
//! visited, in declaration order; opaque (`Raw`) payloads are never
//! looked into. Everything that traverses a descriptor graph (reference
//! resolution, garbage collection, the mutator's commit walk) goes
//! through these two functions.

use anyhow::Result;
use oci_spec::image::Descriptor;

use super::media::ParsedBlob;

/// Return every descriptor directly embedded in `parsed`, in order.
pub fn child_descriptors(parsed: &ParsedBlob) -> Vec<Descriptor> {
    match parsed {
        ParsedBlob::Index(index) => index.manifests().clone(),
        ParsedBlob::Manifest(manifest) => {
            let mut r = Vec::with_capacity(manifest.layers().len() + 2);
            r.push(manifest.config().clone());
            r.extend(manifest.layers().iter().cloned());
            if let Some(subject) = manifest.subject() {
                r.push(subject.clone());
            }
            r
        }
        ParsedBlob::Config(_) | ParsedBlob::Raw(_) => Vec::new(),
    }
}

/// Apply `f` to every embedded descriptor of `parsed`, in place.
///
/// Each descriptor is visited exactly once, in the same order as
/// [`child_descriptors`]; an identity mapping leaves the value
/// structurally unchanged.
pub fn map_descriptors(
    parsed: &mut ParsedBlob,
    mut f: impl FnMut(&mut Descriptor) -> Result<()>,
) -> Result<()> {
    match parsed {
        ParsedBlob::Index(index) => {
            let mut manifests = index.manifests().clone();
            for d in manifests.iter_mut() {
                f(d)?;
            }
            index.set_manifests(manifests);
        }
        ParsedBlob::Manifest(manifest) => {
            let mut config = manifest.config().clone();
            f(&mut config)?;
            manifest.set_config(config);
            let mut layers = manifest.layers().clone();
            for d in layers.iter_mut() {
                f(d)?;
            }
            manifest.set_layers(layers);
            if let Some(subject) = manifest.subject() {
                let mut subject = subject.clone();
                f(&mut subject)?;
                manifest.set_subject(Some(subject));
            }
        }
        ParsedBlob::Config(_) | ParsedBlob::Raw(_) => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use oci_spec::image::{
        Descriptor, DescriptorBuilder, ImageIndexBuilder, ImageManifestBuilder, MediaType,
        Sha256Digest, SCHEMA_VERSION,
    };

    use super::*;

    fn desc(hexbyte: u8, media_type: MediaType) -> Descriptor {
        let hex: String = std::iter::repeat(format!("{hexbyte:02x}")).take(32).collect();
        DescriptorBuilder::default()
            .media_type(media_type)
            .digest(Sha256Digest::from_str(&hex).unwrap())
            .size(42u64)
            .build()
            .unwrap()
    }

    fn test_manifest() -> ParsedBlob {
        ParsedBlob::Manifest(
            ImageManifestBuilder::default()
                .schema_version(SCHEMA_VERSION)
                .config(desc(0xaa, MediaType::ImageConfig))
                .layers(vec![
                    desc(0xbb, MediaType::ImageLayerGzip),
                    desc(0xcc, MediaType::ImageLayerGzip),
                ])
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_visit_order() {
        let m = test_manifest();
        let children = child_descriptors(&m);
        assert_eq!(children.len(), 3);
        assert_eq!(children[0].media_type(), &MediaType::ImageConfig);
        assert!(children[1].digest().digest().starts_with("bb"));
        assert!(children[2].digest().digest().starts_with("cc"));

        let idx = ParsedBlob::Index(
            ImageIndexBuilder::default()
                .schema_version(SCHEMA_VERSION)
                .manifests(vec![desc(0x11, MediaType::ImageManifest)])
                .build()
                .unwrap(),
        );
        assert_eq!(child_descriptors(&idx).len(), 1);
        assert!(child_descriptors(&ParsedBlob::Raw(vec![1, 2, 3])).is_empty());
    }

    #[test]
    fn test_map_identity_is_noop() -> Result<()> {
        let mut m = test_manifest();
        let orig = m.clone();
        map_descriptors(&mut m, |_| Ok(()))?;
        assert_eq!(m, orig);
        Ok(())
    }

    #[test]
    fn test_map_visits_each_once() -> Result<()> {
        let mut m = test_manifest();
        let mut first = Vec::new();
        map_descriptors(&mut m, |d| {
            first.push(d.digest().to_string());
            Ok(())
        })?;
        let mut second = Vec::new();
        map_descriptors(&mut m, |d| {
            second.push(d.digest().to_string());
            Ok(())
        })?;
        assert_eq!(first.len(), 3);
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn test_map_rewrites_in_place() -> Result<()> {
        let mut m = test_manifest();
        let replacement = desc(0xdd, MediaType::ImageLayerGzip);
        map_descriptors(&mut m, |d| {
            if d.digest().digest().starts_with("bb") {
                *d = replacement.clone();
            }
            Ok(())
        })?;
        let children = child_descriptors(&m);
        assert!(children[1].digest().digest().starts_with("dd"));
        assert!(children[2].digest().digest().starts_with("cc"));
        Ok(())
    }
}
