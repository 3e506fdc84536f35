//! Media-type registry: mapping blob media-types to typed parsers.
//!
//! The registry decides which blobs the descriptor walker is allowed to
//! look inside. Only media-types registered here are ever parsed;
//! everything else is treated as an opaque leaf, which keeps the walker
//! from reading into third-party blob payloads.

use std::collections::{HashMap, HashSet};
use std::io::Read;

use anyhow::Result;
use oci_spec::image::{
    Descriptor, ImageConfiguration, ImageIndex, ImageManifest, MediaType,
};

/// A parser turning raw blob bytes into a typed value.
pub type BlobParser = Box<dyn Fn(&mut dyn Read) -> Result<ParsedBlob> + Send + Sync>;

/// A blob parsed through the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedBlob {
    /// An image index (`application/vnd.oci.image.index.v1+json`).
    Index(ImageIndex),
    /// An image manifest (`application/vnd.oci.image.manifest.v1+json`).
    Manifest(ImageManifest),
    /// An image configuration (`application/vnd.oci.image.config.v1+json`).
    Config(ImageConfiguration),
    /// Opaque bytes from a registered third-party parser.
    Raw(Vec<u8>),
}

/// A parsed blob together with the descriptor it was loaded through.
#[derive(Debug, Clone)]
pub struct Blob {
    /// The descriptor the blob was addressed by.
    pub descriptor: Descriptor,
    /// The typed content.
    pub parsed: ParsedBlob,
}

impl Blob {
    /// The manifest inside, if this blob is one.
    pub fn manifest(&self) -> Option<&ImageManifest> {
        match &self.parsed {
            ParsedBlob::Manifest(m) => Some(m),
            _ => None,
        }
    }

    /// The index inside, if this blob is one.
    pub fn index(&self) -> Option<&ImageIndex> {
        match &self.parsed {
            ParsedBlob::Index(i) => Some(i),
            _ => None,
        }
    }
}

/// Registry of media-type parsers and resolution targets.
pub struct MediaTypeRegistry {
    parsers: HashMap<String, BlobParser>,
    targets: HashSet<String>,
}

impl std::fmt::Debug for MediaTypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTypeRegistry")
            .field("parsers", &self.parsers.keys())
            .field("targets", &self.targets)
            .finish()
    }
}

impl Default for MediaTypeRegistry {
    fn default() -> Self {
        let mut r = Self {
            parsers: HashMap::new(),
            targets: HashSet::new(),
        };
        r.register(MediaType::ImageIndex, |src| {
            Ok(ParsedBlob::Index(ImageIndex::from_reader(src)?))
        });
        r.register(MediaType::ImageManifest, |src| {
            Ok(ParsedBlob::Manifest(ImageManifest::from_reader(src)?))
        });
        r.register(MediaType::ImageConfig, |src| {
            Ok(ParsedBlob::Config(ImageConfiguration::from_reader(src)?))
        });
        // The default terminal for reference resolution.
        r.register_target(&MediaType::ImageManifest);
        r
    }
}

impl MediaTypeRegistry {
    /// Associate a parser with a media-type.
    pub fn register(
        &mut self,
        media_type: MediaType,
        parser: impl Fn(&mut dyn Read) -> Result<ParsedBlob> + Send + Sync + 'static,
    ) {
        self.parsers
            .insert(media_type.to_string(), Box::new(parser));
    }

    /// Mark a media-type as a terminal for reference resolution.
    pub fn register_target(&mut self, media_type: &MediaType) {
        self.targets.insert(media_type.to_string());
    }

    /// Whether a parser is registered for this media-type.
    pub fn is_registered(&self, media_type: &MediaType) -> bool {
        self.parsers.contains_key(&media_type.to_string())
    }

    /// Whether this media-type terminates reference resolution.
    pub fn is_target(&self, media_type: &MediaType) -> bool {
        self.targets.contains(&media_type.to_string())
    }

    /// Parse a blob; `None` when the media-type has no registered parser.
    pub fn parse(
        &self,
        media_type: &MediaType,
        src: &mut dyn Read,
    ) -> Result<Option<ParsedBlob>> {
        match self.parsers.get(&media_type.to_string()) {
            Some(p) => Ok(Some(p(src)?)),
            None => Ok(None),
        }
    }
}
