//! Reference resolution over the top-level index.
//!
//! References are index entries carrying the standard
//! `org.opencontainers.image.ref.name` annotation. Resolving one walks
//! the descriptor graph depth-first until it reaches a registered target
//! media-type, yielding the full [`DescriptorPath`] from the index entry
//! down to the target.

use std::collections::HashSet;

use anyhow::{Context, Result};
use fn_error_context::context;
use oci_spec::image::Descriptor;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use super::walk::child_descriptors;
use super::ImageLayout;
use crate::Error;

/// The standard annotation naming an index entry.
pub const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

// refname  ::= component ("/" component)*
// component::= alphanum (separator alphanum)*
// alphanum ::= [A-Za-z0-9]+
// separator::= [-._:@+] | "--"
static REF_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    let component = r"[A-Za-z0-9]+(?:(?:--|[-._:@+])[A-Za-z0-9]+)*";
    Regex::new(&format!(r"^{component}(?:/{component})*$")).unwrap()
});

/// Whether `name` is a valid reference name.
pub fn is_valid_reference_name(name: &str) -> bool {
    REF_NAME_RE.is_match(name)
}

fn check_reference_name(name: &str) -> Result<()> {
    if !is_valid_reference_name(name) {
        return Err(Error::Invalid(format!("reference name {name:?}")).into());
    }
    Ok(())
}

/// The reference name annotated on a descriptor, if any.
pub fn descriptor_ref_name(d: &Descriptor) -> Option<&str> {
    d.annotations()
        .as_ref()
        .and_then(|a| a.get(REF_NAME_ANNOTATION))
        .map(String::as_str)
}

/// An ordered walk from an index entry down to a target descriptor.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DescriptorPath {
    #[serde(rename = "path")]
    walk: Vec<Descriptor>,
}

impl DescriptorPath {
    /// Construct a path; the walk must be non-empty.
    pub fn new(walk: Vec<Descriptor>) -> Result<Self> {
        if walk.is_empty() {
            return Err(Error::Invalid("empty descriptor path".into()).into());
        }
        Ok(Self { walk })
    }

    /// A path of length one.
    pub fn from_root(root: Descriptor) -> Self {
        Self { walk: vec![root] }
    }

    /// Extend the walk by one descriptor.
    pub fn child(&self, d: Descriptor) -> Self {
        let mut walk = self.walk.clone();
        walk.push(d);
        Self { walk }
    }

    /// The index entry the walk started from.
    pub fn root(&self) -> &Descriptor {
        self.walk.first().expect("non-empty walk")
    }

    /// The target the walk ended at.
    pub fn descriptor(&self) -> &Descriptor {
        self.walk.last().expect("non-empty walk")
    }

    /// The full walk, root first.
    pub fn walk(&self) -> &[Descriptor] {
        &self.walk
    }

    /// Validate a deserialized path.
    pub fn validate(&self) -> Result<()> {
        if self.walk.is_empty() {
            return Err(Error::Invalid("empty descriptor path".into()).into());
        }
        Ok(())
    }
}

/// Resolve every target path reachable from index entries matching
/// `predicate`.
pub fn resolve_matching(
    layout: &ImageLayout,
    mut predicate: impl FnMut(&Descriptor) -> bool,
    token: &CancellationToken,
) -> Result<Vec<DescriptorPath>> {
    let index = layout.get_index()?;
    let mut out = Vec::new();
    for d in index.manifests() {
        if !predicate(d) {
            continue;
        }
        let mut stack = HashSet::new();
        descend(
            layout,
            &DescriptorPath::from_root(d.clone()),
            &mut stack,
            &mut out,
            token,
        )?;
    }
    Ok(out)
}

/// Resolve a reference name to all of its target paths.
#[context("Resolving reference {name}")]
pub fn resolve_reference(
    layout: &ImageLayout,
    name: &str,
    token: &CancellationToken,
) -> Result<Vec<DescriptorPath>> {
    check_reference_name(name)?;
    resolve_matching(layout, |d| descriptor_ref_name(d) == Some(name), token)
}

/// Resolve a reference name which must name exactly one target.
pub fn resolve_reference_required(
    layout: &ImageLayout,
    name: &str,
    token: &CancellationToken,
) -> Result<DescriptorPath> {
    let mut paths = resolve_reference(layout, name, token)?;
    match paths.len() {
        0 => Err(Error::UnresolvedReference(name.to_string()).into()),
        1 => Ok(paths.remove(0)),
        count => Err(Error::AmbiguousReference {
            name: name.to_string(),
            count,
        }
        .into()),
    }
}

fn descend(
    layout: &ImageLayout,
    path: &DescriptorPath,
    stack: &mut HashSet<String>,
    out: &mut Vec<DescriptorPath>,
    token: &CancellationToken,
) -> Result<()> {
    if token.is_cancelled() {
        return Err(Error::Cancelled.into());
    }
    let d = path.descriptor().clone();
    let key = d.digest().to_string();
    if !stack.insert(key.clone()) {
        return Err(Error::Invalid(format!("descriptor cycle at {key}")).into());
    }
    let r = (|| -> Result<()> {
        if layout.registry().is_target(d.media_type()) {
            out.push(path.clone());
            return Ok(());
        }
        let Some(blob) = layout.read_parsed_blob(&d)? else {
            // An opaque leaf (e.g. a layer); nothing to descend into.
            return Ok(());
        };
        for child in child_descriptors(&blob.parsed) {
            // Never cross into another named reference.
            if descriptor_ref_name(&child).is_some() {
                continue;
            }
            descend(layout, &path.child(child), stack, out, token)?;
        }
        Ok(())
    })();
    stack.remove(&key);
    r
}

/// Replace or insert the index entry named `name`.
#[context("Updating reference {name}")]
pub fn update_reference(layout: &ImageLayout, name: &str, descriptor: &Descriptor) -> Result<()> {
    check_reference_name(name)?;
    let mut index = layout.get_index()?;
    let mut manifests = index.manifests().clone();
    manifests.retain(|d| descriptor_ref_name(d) != Some(name));
    let mut tagged = descriptor.clone();
    let mut annotations = tagged.annotations().clone().unwrap_or_default();
    annotations.insert(REF_NAME_ANNOTATION.to_string(), name.to_string());
    tagged.set_annotations(Some(annotations));
    manifests.push(tagged);
    index.set_manifests(manifests);
    layout.put_index(&index)
}

/// Remove every index entry named `name`; removing a name that does not
/// exist is not an error.
#[context("Deleting reference {name}")]
pub fn delete_reference(layout: &ImageLayout, name: &str) -> Result<()> {
    check_reference_name(name)?;
    let mut index = layout.get_index()?;
    let mut manifests = index.manifests().clone();
    manifests.retain(|d| descriptor_ref_name(d) != Some(name));
    index.set_manifests(manifests);
    layout.put_index(&index)
}

/// Enumerate `(name, descriptor)` for every named index entry.
pub fn list_references(layout: &ImageLayout) -> Result<Vec<(String, Descriptor)>> {
    let index = layout.get_index().context("Listing references")?;
    Ok(index
        .manifests()
        .iter()
        .filter_map(|d| descriptor_ref_name(d).map(|name| (name.to_string(), d.clone())))
        .collect())
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use cap_std_ext::{cap_std, cap_tempfile};
    use oci_spec::image::{
        DescriptorBuilder, ImageIndexBuilder, MediaType, Sha256Digest, SCHEMA_VERSION,
    };

    use super::*;

    #[test]
    fn test_reference_name_grammar() {
        let valid = [
            "latest",
            "v1",
            "a",
            "1.0.2",
            "name:tag",
            "foo/bar/baz",
            "a-b",
            "a--b",
            "a.b-c_d:e@f+g",
            "A9/Z0",
        ];
        for v in valid {
            assert!(is_valid_reference_name(v), "{v} should be valid");
        }
        let invalid = [
            "",
            "-a",
            "a-",
            ".a",
            "a.",
            "a..b",
            "a---b",
            "a//b",
            "/a",
            "a/",
            "a b",
            "a:",
            "@a",
            "a+-b",
            "über",
        ];
        for v in invalid {
            assert!(!is_valid_reference_name(v), "{v} should be invalid");
        }
    }

    fn manifest_descriptor(hexbyte: u8) -> Descriptor {
        let hex: String = std::iter::repeat(format!("{hexbyte:02x}")).take(32).collect();
        DescriptorBuilder::default()
            .media_type(MediaType::ImageManifest)
            .digest(Sha256Digest::from_str(&hex).unwrap())
            .size(7u64)
            .build()
            .unwrap()
    }

    #[test]
    fn test_update_resolve_roundtrip() -> Result<()> {
        let td = cap_tempfile::tempdir(cap_std::ambient_authority())?;
        let layout = ImageLayout::create(&td)?;
        let token = CancellationToken::new();
        let d = manifest_descriptor(0xab);
        update_reference(&layout, "v1", &d)?;
        let paths = resolve_reference(&layout, "v1", &token)?;
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].walk().len(), 1);
        assert_eq!(paths[0].descriptor().digest(), d.digest());
        // Replacing the entry keeps exactly one.
        let d2 = manifest_descriptor(0xcd);
        update_reference(&layout, "v1", &d2)?;
        let path = resolve_reference_required(&layout, "v1", &token)?;
        assert_eq!(path.descriptor().digest(), d2.digest());
        // Deleting is idempotent.
        delete_reference(&layout, "v1")?;
        delete_reference(&layout, "v1")?;
        assert!(matches!(
            resolve_reference_required(&layout, "v1", &token)
                .unwrap_err()
                .downcast_ref::<Error>(),
            Some(Error::UnresolvedReference(_))
        ));
        Ok(())
    }

    #[test]
    fn test_ambiguous_reference() -> Result<()> {
        let td = cap_tempfile::tempdir(cap_std::ambient_authority())?;
        let layout = ImageLayout::create(&td)?;
        let token = CancellationToken::new();
        // Two entries annotated with the same name, pointing at
        // different manifests.
        let mut index = layout.get_index()?;
        let mut manifests = Vec::new();
        for b in [0x11, 0x22] {
            let mut d = manifest_descriptor(b);
            d.set_annotations(Some(
                [(REF_NAME_ANNOTATION.to_string(), "v1".to_string())]
                    .into_iter()
                    .collect(),
            ));
            manifests.push(d);
        }
        index.set_manifests(manifests);
        layout.put_index(&index)?;
        let paths = resolve_reference(&layout, "v1", &token)?;
        assert_eq!(paths.len(), 2);
        assert!(matches!(
            resolve_reference_required(&layout, "v1", &token)
                .unwrap_err()
                .downcast_ref::<Error>(),
            Some(Error::AmbiguousReference { count: 2, .. })
        ));
        Ok(())
    }

    #[test]
    fn test_resolution_through_nested_index() -> Result<()> {
        let td = cap_tempfile::tempdir(cap_std::ambient_authority())?;
        let layout = ImageLayout::create(&td)?;
        let token = CancellationToken::new();
        let target = manifest_descriptor(0x77);
        // A named child inside the nested index must not be crossed.
        let mut named_child = manifest_descriptor(0x88);
        named_child.set_annotations(Some(
            [(REF_NAME_ANNOTATION.to_string(), "other".to_string())]
                .into_iter()
                .collect(),
        ));
        let nested = ImageIndexBuilder::default()
            .schema_version(SCHEMA_VERSION)
            .manifests(vec![target.clone(), named_child])
            .build()
            .unwrap();
        let (digest, size) = layout.put_json_blob(&nested, &token)?;
        let nested_desc = DescriptorBuilder::default()
            .media_type(MediaType::ImageIndex)
            .digest(digest)
            .size(size)
            .build()
            .unwrap();
        update_reference(&layout, "v1", &nested_desc)?;
        let path = resolve_reference_required(&layout, "v1", &token)?;
        assert_eq!(path.walk().len(), 2);
        assert_eq!(path.root().media_type(), &MediaType::ImageIndex);
        assert_eq!(path.descriptor().digest(), target.digest());
        Ok(())
    }
}
