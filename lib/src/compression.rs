//! Layer compression and decompression, keyed by OCI media-type.

use std::io::{Read, Write};

use anyhow::Result;
use oci_spec::image::MediaType;

use crate::Error;

/// The compression applied to a layer blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// An uncompressed `tar` layer.
    None,
    /// `tar+gzip`.
    #[default]
    Gzip,
    /// `tar+zstd`.
    Zstd,
}

impl Compression {
    /// The distributable layer media-type for this compression.
    pub fn media_type(&self) -> MediaType {
        match self {
            Compression::None => MediaType::ImageLayer,
            Compression::Gzip => MediaType::ImageLayerGzip,
            Compression::Zstd => MediaType::ImageLayerZstd,
        }
    }

    /// Wrap `w` so that bytes written come out compressed.
    pub fn compress<W: Write>(&self, w: W) -> Result<CompressedWriter<W>> {
        Ok(match self {
            Compression::None => CompressedWriter::Plain(w),
            Compression::Gzip => {
                CompressedWriter::Gzip(flate2::write::GzEncoder::new(w, flate2::Compression::default()))
            }
            Compression::Zstd => CompressedWriter::Zstd(zstd::stream::write::Encoder::new(w, 0)?),
        })
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Zstd => "zstd",
        };
        f.write_str(s)
    }
}

/// Whether this media-type is a layer of any kind we know.
pub(crate) fn is_layer_type(media_type: &MediaType) -> bool {
    layer_compression(media_type).is_ok()
}

/// The compression of a layer media-type; unknown suffixes are
/// [`Error::UnsupportedMediaType`].
pub(crate) fn layer_compression(media_type: &MediaType) -> Result<Compression> {
    let c = match media_type {
        MediaType::ImageLayer | MediaType::ImageLayerNonDistributable => Compression::None,
        MediaType::ImageLayerGzip | MediaType::ImageLayerNonDistributableGzip => Compression::Gzip,
        MediaType::ImageLayerZstd | MediaType::ImageLayerNonDistributableZstd => Compression::Zstd,
        o => return Err(Error::UnsupportedMediaType(o.to_string()).into()),
    };
    Ok(c)
}

/// Create a decompressor for a layer media-type, given its raw stream.
pub(crate) fn decompressor<'a>(
    media_type: &MediaType,
    src: impl Read + Send + 'a,
) -> Result<Box<dyn Read + Send + 'a>> {
    let r: Box<dyn Read + Send + 'a> = match layer_compression(media_type)? {
        Compression::None => Box::new(src),
        Compression::Gzip => Box::new(flate2::bufread::GzDecoder::new(std::io::BufReader::new(
            src,
        ))),
        Compression::Zstd => Box::new(zstd::stream::read::Decoder::new(src)?),
    };
    Ok(r)
}

/// A writer compressing into an inner writer; [`Self::finish`] flushes
/// the trailing compressed frame and hands the inner writer back.
pub enum CompressedWriter<W: Write> {
    /// Identity.
    Plain(W),
    /// gzip via flate2.
    Gzip(flate2::write::GzEncoder<W>),
    /// zstd.
    Zstd(zstd::stream::write::Encoder<'static, W>),
}

impl<W: Write> std::fmt::Debug for CompressedWriter<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CompressedWriter::Plain(_) => "Plain",
            CompressedWriter::Gzip(_) => "Gzip",
            CompressedWriter::Zstd(_) => "Zstd",
        };
        f.debug_tuple(name).finish()
    }
}

impl<W: Write> CompressedWriter<W> {
    /// Finalize the compressed stream.
    pub fn finish(self) -> std::io::Result<W> {
        match self {
            CompressedWriter::Plain(w) => Ok(w),
            CompressedWriter::Gzip(w) => w.finish(),
            CompressedWriter::Zstd(w) => w.finish(),
        }
    }
}

impl<W: Write> Write for CompressedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            CompressedWriter::Plain(w) => w.write(buf),
            CompressedWriter::Gzip(w) => w.write(buf),
            CompressedWriter::Zstd(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            CompressedWriter::Plain(w) => w.flush(),
            CompressedWriter::Gzip(w) => w.flush(),
            CompressedWriter::Zstd(w) => w.flush(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_types() {
        assert_eq!(
            layer_compression(&MediaType::ImageLayerGzip).unwrap(),
            Compression::Gzip
        );
        assert_eq!(
            layer_compression(&MediaType::ImageLayerNonDistributableZstd).unwrap(),
            Compression::Zstd
        );
        assert!(is_layer_type(&MediaType::ImageLayer));
        assert!(!is_layer_type(&MediaType::ImageConfig));
        let err = layer_compression(&MediaType::ImageConfig).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::UnsupportedMediaType(_))
        ));
    }

    #[test]
    fn test_roundtrip() -> Result<()> {
        for c in [Compression::None, Compression::Gzip, Compression::Zstd] {
            let mut w = c.compress(Vec::new())?;
            w.write_all(b"some layer bytes")?;
            let compressed = w.finish()?;
            let mut r = decompressor(&c.media_type(), compressed.as_slice())?;
            let mut out = Vec::new();
            r.read_to_end(&mut out)?;
            assert_eq!(out, b"some layer bytes", "compression {c}");
        }
        Ok(())
    }
}
