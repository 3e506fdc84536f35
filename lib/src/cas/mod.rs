//! The content-addressed blob store backing an OCI image layout
//! directory.
//!
//! An image is a directory with an `oci-layout` marker, a `blobs/<algo>`
//! tree holding one file per blob (named by its content digest), and a
//! top-level `index.json`. All access goes through a capability-relative
//! [`Dir`] handle so nothing here can escape the layout directory.

use std::io::{Read, Write};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std::fs::Dir;
use cap_std_ext::cap_std;
use cap_std_ext::cap_tempfile;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use oci_spec::image::{
    Descriptor, Digest, DigestAlgorithm, ImageIndex, ImageIndexBuilder, SCHEMA_VERSION,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::digest::{Digester, VerifiedReader};
use crate::Error;

pub mod gc;
pub mod media;
pub mod resolve;
pub mod walk;

pub use media::{Blob, MediaTypeRegistry, ParsedBlob};
pub use resolve::DescriptorPath;

/// Name of the directory holding blob shards.
const BLOBS_DIR: &str = "blobs";
/// Name of the top-level index file.
const INDEX_JSON: &str = "index.json";
/// Name of the layout marker file.
const LAYOUT_FILE: &str = "oci-layout";
/// The layout version we read and write.
const LAYOUT_VERSION: &str = "1.0.0";
/// Prefix used by in-flight temporary files inside the layout.
const TEMP_PREFIX: &str = ".tmp";

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct LayoutMarker {
    #[serde(rename = "imageLayoutVersion")]
    image_layout_version: String,
}

/// An opened OCI image layout directory.
pub struct ImageLayout {
    dir: Arc<Dir>,
    algorithm: DigestAlgorithm,
    registry: MediaTypeRegistry,
}

impl std::fmt::Debug for ImageLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageLayout")
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

/// Compute the relative path of a blob inside the layout.
fn blob_path(digest: &Digest) -> Utf8PathBuf {
    Utf8PathBuf::from(BLOBS_DIR)
        .join(digest.algorithm().to_string())
        .join(digest.digest())
}

impl ImageLayout {
    /// Initialize a fresh, empty image layout in `dir`.
    ///
    /// Fails with [`Error::Clobber`] if the directory already carries a
    /// layout.
    #[context("Creating image layout")]
    pub fn create(dir: &Dir) -> Result<Self> {
        if dir.try_exists(LAYOUT_FILE)? {
            return Err(Error::Clobber(LAYOUT_FILE.into()).into());
        }
        dir.create_dir_all(Utf8Path::new(BLOBS_DIR).join(DigestAlgorithm::Sha256.to_string()))?;
        let marker = serde_json::to_vec(&LayoutMarker {
            image_layout_version: LAYOUT_VERSION.into(),
        })?;
        dir.atomic_write(LAYOUT_FILE, marker)?;
        let index = ImageIndexBuilder::default()
            .schema_version(SCHEMA_VERSION)
            .manifests(Vec::new())
            .build()
            .context("Building empty index")?;
        let r = Self::new(dir)?;
        r.put_index(&index)?;
        Ok(r)
    }

    /// Open an existing image layout, validating the layout marker.
    #[context("Opening image layout")]
    pub fn open(dir: &Dir) -> Result<Self> {
        let marker = dir
            .open_optional(LAYOUT_FILE)?
            .ok_or_else(|| Error::Invalid(format!("image layout: no {LAYOUT_FILE} file")))?;
        let marker: LayoutMarker = serde_json::from_reader(std::io::BufReader::new(marker))
            .map_err(|e| Error::Invalid(format!("image layout: {LAYOUT_FILE}: {e}")))?;
        // We support all 1.x layouts.
        if !marker.image_layout_version.starts_with("1.") {
            return Err(Error::Invalid(format!(
                "image layout: unsupported version {}",
                marker.image_layout_version
            ))
            .into());
        }
        if !dir.try_exists(INDEX_JSON)? {
            return Err(Error::Invalid(format!("image layout: no {INDEX_JSON}")).into());
        }
        Self::new(dir)
    }

    fn new(dir: &Dir) -> Result<Self> {
        Ok(Self {
            dir: Arc::new(dir.try_clone()?),
            algorithm: DigestAlgorithm::Sha256,
            registry: MediaTypeRegistry::default(),
        })
    }

    /// The media-type registry used when parsing blobs.
    pub fn registry(&self) -> &MediaTypeRegistry {
        &self.registry
    }

    /// Mutable access to the media-type registry, for registering
    /// third-party parsers or additional resolution targets.
    pub fn registry_mut(&mut self) -> &mut MediaTypeRegistry {
        &mut self.registry
    }

    /// Start writing a new blob. Bytes are hashed as they are written
    /// to a temporary file; [`BlobWriter::complete`] renames it to its
    /// content address.
    pub fn blob_writer(&self) -> Result<BlobWriter<'_>> {
        Ok(BlobWriter {
            layout: self,
            tmp: Some(cap_tempfile::TempFile::new(&self.dir)?),
            digester: Digester::new(&self.algorithm)?,
            size: 0,
        })
    }

    /// Stream `src` into the store, returning the digest and size of the
    /// written blob.
    ///
    /// The bytes are hashed while they are written to a temporary file
    /// which is atomically renamed to its content address at the end; a
    /// pre-existing blob with the same digest is left untouched.
    #[context("Writing blob")]
    pub fn put_blob(&self, mut src: impl Read, token: &CancellationToken) -> Result<(Digest, u64)> {
        let mut w = self.blob_writer()?;
        let mut buf = vec![0u8; 128 * 1024];
        loop {
            if token.is_cancelled() {
                // Dropping the writer unlinks the temporary.
                return Err(Error::Cancelled.into());
            }
            let n = src.read(&mut buf)?;
            if n == 0 {
                break;
            }
            w.write_all(&buf[..n])?;
        }
        w.complete()
    }

    /// Serialize `v` as canonical JSON and store it as a blob.
    pub fn put_json_blob<S: Serialize>(&self, v: &S, token: &CancellationToken) -> Result<(Digest, u64)> {
        let buf = serde_json::to_vec(v).context("Serializing blob")?;
        self.put_blob(buf.as_slice(), token)
    }

    /// Open a blob for reading, verifying its content digest on close.
    ///
    /// Closing the returned reader reads to the end of the file; callers
    /// that only need existence should use [`Self::stat`].
    pub fn get_blob(&self, digest: &Digest) -> Result<VerifiedReader<std::fs::File>> {
        self.get_blob_with_size(digest, None)
    }

    /// Open a blob via its descriptor, additionally verifying the size.
    pub fn get_verified_blob(&self, desc: &Descriptor) -> Result<VerifiedReader<std::fs::File>> {
        self.get_blob_with_size(desc.digest(), Some(desc.size()))
    }

    fn get_blob_with_size(
        &self,
        digest: &Digest,
        size: Option<u64>,
    ) -> Result<VerifiedReader<std::fs::File>> {
        VerifiedReader::new(self.open_blob_file(digest)?, digest.clone(), size)
    }

    /// Open the raw blob file, without verification plumbing.
    pub(crate) fn open_blob_file(&self, digest: &Digest) -> Result<std::fs::File> {
        let path = blob_path(digest);
        match self.dir.open(&path) {
            Ok(f) => Ok(f.into_std()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("blob {digest}")).into())
            }
            Err(e) => Err(anyhow!(e).context(format!("Opening blob {digest}"))),
        }
    }

    /// Read a blob fully into memory, verifying digest and size, and
    /// parse it through the media-type registry. Returns `None` when no
    /// parser is registered for the descriptor's media-type.
    pub fn read_parsed_blob(&self, desc: &Descriptor) -> Result<Option<Blob>> {
        if !self.registry.is_registered(desc.media_type()) {
            return Ok(None);
        }
        let mut r = self.get_verified_blob(desc)?;
        let mut buf = Vec::with_capacity(desc.size().min(1024 * 1024) as usize);
        r.read_to_end(&mut buf)?;
        r.close()?;
        let parsed = self
            .registry
            .parse(desc.media_type(), &mut buf.as_slice())
            .with_context(|| format!("Parsing blob {}", desc.digest()))?
            .expect("registered media-type has a parser");
        Ok(Some(Blob {
            descriptor: desc.clone(),
            parsed,
        }))
    }

    /// Whether a blob exists, without reading it.
    pub fn stat(&self, digest: &Digest) -> Result<bool> {
        Ok(self.dir.try_exists(blob_path(digest))?)
    }

    /// Delete a blob. Deleting a blob that does not exist is not an
    /// error.
    #[context("Deleting blob")]
    pub fn delete(&self, digest: &Digest) -> Result<()> {
        match self.dir.remove_file(blob_path(digest)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Enumerate every blob in the store.
    #[context("Listing blobs")]
    pub fn list(&self) -> Result<Vec<Digest>> {
        let mut r = Vec::new();
        for shard in self.dir.read_dir(BLOBS_DIR)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            let algo = shard.file_name();
            let algo = algo
                .to_str()
                .ok_or_else(|| Error::Invalid(format!("blob shard name {algo:?}")))?
                .to_owned();
            for ent in shard.open_dir()?.entries()? {
                let ent = ent?;
                let name = ent.file_name();
                let Some(name) = name.to_str() else {
                    return Err(Error::Invalid(format!("blob file name {name:?}")).into());
                };
                if name.starts_with(TEMP_PREFIX) {
                    continue;
                }
                let digest: Digest = format!("{algo}:{name}")
                    .parse()
                    .map_err(|_| Error::Invalid(format!("blob path {algo}/{name}")))?;
                r.push(digest);
            }
        }
        Ok(r)
    }

    /// Remove stray temporary files and empty shard directories. Never
    /// touches a blob or the index.
    #[context("Cleaning image layout")]
    pub fn clean(&self) -> Result<()> {
        for ent in self.dir.entries()? {
            let ent = ent?;
            if let Some(name) = ent.file_name().to_str() {
                if name.starts_with(TEMP_PREFIX) && ent.file_type()?.is_file() {
                    self.dir.remove_file(name)?;
                }
            }
        }
        for shard in self.dir.read_dir(BLOBS_DIR)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            let shard_name = shard.file_name();
            let Some(shard_name) = shard_name.to_str() else {
                continue;
            };
            let d = shard.open_dir()?;
            let mut empty = true;
            for ent in d.entries()? {
                let ent = ent?;
                if let Some(name) = ent.file_name().to_str() {
                    if name.starts_with(TEMP_PREFIX) && ent.file_type()?.is_file() {
                        d.remove_file(name)?;
                        continue;
                    }
                }
                empty = false;
            }
            if empty {
                self.dir
                    .remove_dir(Utf8Path::new(BLOBS_DIR).join(shard_name))?;
            }
        }
        Ok(())
    }

    /// Read the top-level index.
    #[context("Reading index")]
    pub fn get_index(&self) -> Result<ImageIndex> {
        let f = self
            .dir
            .open_optional(INDEX_JSON)?
            .ok_or_else(|| Error::Invalid(format!("image layout: no {INDEX_JSON}")))?;
        let index = ImageIndex::from_reader(std::io::BufReader::new(f))
            .map_err(|e| Error::Invalid(format!("{INDEX_JSON}: {e}")))?;
        Ok(index)
    }

    /// Atomically replace the top-level index.
    #[context("Writing index")]
    pub fn put_index(&self, index: &ImageIndex) -> Result<()> {
        self.dir
            .atomic_replace_with(INDEX_JSON, |w| -> Result<()> {
                let mut ser = serde_json::Serializer::new(w);
                index.serialize(&mut ser).context("Failed to serialize")?;
                Ok(())
            })
    }

    /// Re-hash every blob in the store and verify it matches its name.
    /// Returns the number of verified blobs.
    #[context("Verifying store")]
    pub fn fsck(&self) -> Result<u32> {
        let mut n = 0;
        for digest in self.list()? {
            self.get_blob(&digest)?
                .close()
                .with_context(|| format!("Verifying blob {digest}"))?;
            n += 1;
        }
        Ok(n)
    }
}

/// An in-flight blob, hashed as it is written.
pub struct BlobWriter<'a> {
    layout: &'a ImageLayout,
    tmp: Option<cap_tempfile::TempFile<'a>>,
    digester: Digester,
    size: u64,
}

impl std::fmt::Debug for BlobWriter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobWriter").field("size", &self.size).finish()
    }
}

impl BlobWriter<'_> {
    /// Finish writing: move the temporary into its content address and
    /// return the digest and size.
    #[context("Completing blob")]
    pub fn complete(mut self) -> Result<(Digest, u64)> {
        let digest = self.digester.finish()?;
        let size = self.size;
        let tmp = self.tmp.take().expect("writer not yet completed");
        let path = blob_path(&digest);
        self.layout
            .dir
            .create_dir_all(path.parent().expect("blob path has parent"))?;
        if self.layout.dir.try_exists(&path)? {
            // Identical content is already present; keep the existing
            // (immutable) blob and discard the temporary.
            drop(tmp);
        } else {
            tmp.replace(&path).context("Moving blob into place")?;
        }
        tracing::trace!("wrote blob {digest} ({size} bytes)");
        Ok((digest, size))
    }
}

impl Write for BlobWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.digester.update(buf).map_err(std::io::Error::other)?;
        self.tmp
            .as_mut()
            .expect("writer not yet completed")
            .as_file_mut()
            .write_all(buf)?;
        self.size += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO_DIGEST: &str =
        "sha256:5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03";

    fn new_layout() -> Result<(cap_tempfile::TempDir, ImageLayout)> {
        let td = cap_tempfile::tempdir(cap_std::ambient_authority())?;
        let layout = ImageLayout::create(&td)?;
        Ok((td, layout))
    }

    #[test]
    fn test_put_get_roundtrip() -> Result<()> {
        let (_td, layout) = new_layout()?;
        let token = CancellationToken::new();
        let (digest, size) = layout.put_blob(&b"hello\n"[..], &token)?;
        assert_eq!(digest.to_string(), HELLO_DIGEST);
        assert_eq!(size, 6);
        let mut r = layout.get_blob(&digest)?;
        let mut buf = Vec::new();
        r.read_to_end(&mut buf)?;
        assert_eq!(buf, b"hello\n");
        r.close()?;
        // Idempotent re-put of identical content.
        let (digest2, _) = layout.put_blob(&b"hello\n"[..], &token)?;
        assert_eq!(digest, digest2);
        assert_eq!(layout.list()?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_corruption_detected() -> Result<()> {
        let (td, layout) = new_layout()?;
        let token = CancellationToken::new();
        let (digest, _) = layout.put_blob(&b"hello\n"[..], &token)?;
        // Corrupt one byte on disk.
        let path = blob_path(&digest);
        let mut contents = td.read(&path)?;
        contents[0] ^= 0xff;
        td.write(&path, contents)?;
        let err = layout.get_blob(&digest)?.close().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::CorruptBlob { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_stat_delete_idempotent() -> Result<()> {
        let (_td, layout) = new_layout()?;
        let token = CancellationToken::new();
        let (digest, _) = layout.put_blob(&b"data"[..], &token)?;
        assert!(layout.stat(&digest)?);
        layout.delete(&digest)?;
        assert!(!layout.stat(&digest)?);
        layout.delete(&digest)?;
        assert!(matches!(
            layout.get_blob(&digest).unwrap_err().downcast_ref::<Error>(),
            Some(Error::NotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_create_rejects_existing() -> Result<()> {
        let (td, _layout) = new_layout()?;
        let err = ImageLayout::create(&td).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::Clobber(_))
        ));
        Ok(())
    }

    #[test]
    fn test_fsck_and_clean() -> Result<()> {
        let (td, layout) = new_layout()?;
        let token = CancellationToken::new();
        layout.put_blob(&b"one"[..], &token)?;
        layout.put_blob(&b"two"[..], &token)?;
        assert_eq!(layout.fsck()?, 2);
        // A stray temporary must be cleaned up without touching blobs.
        td.write(".tmpdeadbeef", b"junk")?;
        layout.clean()?;
        assert!(!td.try_exists(".tmpdeadbeef")?);
        assert_eq!(layout.fsck()?, 2);
        Ok(())
    }
}
