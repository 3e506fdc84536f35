//! The structured error kinds shared across the crate.
//!
//! Operations return [`anyhow::Result`] so callers get contextualized
//! error chains; the kinds below are the typed roots of those chains and
//! can be recovered with [`anyhow::Error::downcast_ref`].

/// A classified failure from one of the core operations.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A blob or reference does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// Malformed digest, invalid reference name, bad layout file.
    #[error("invalid {0}")]
    Invalid(String),

    /// Blob content does not match its declared digest or size.
    #[error("corrupt blob {digest}: {reason}")]
    CorruptBlob {
        /// The digest the blob was addressed by.
        digest: String,
        /// What failed to match.
        reason: String,
    },

    /// The tar stream violates ordering, path safety, or self-consistency.
    #[error("malformed layer: entry {path}: {reason}")]
    MalformedLayer {
        /// Path of the offending entry.
        path: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A media-type required here is not registered.
    #[error("unsupported media type {0}")]
    UnsupportedMediaType(String),

    /// More than one target path resolved for a reference name.
    #[error("ambiguous reference {name}: resolved {count} target paths")]
    AmbiguousReference {
        /// The reference name being resolved.
        name: String,
        /// How many paths resolved.
        count: usize,
    },

    /// No target path resolved for a reference name.
    #[error("unresolved reference {0}")]
    UnresolvedReference(String),

    /// The operation requires privileges the caller does not hold.
    #[error("rootless restriction: {0}")]
    RootlessRestriction(String),

    /// An atomic create-only target already exists.
    #[error("target already exists: {0}")]
    Clobber(String),

    /// Cooperative cancellation fired.
    #[error("operation was cancelled")]
    Cancelled,
}

impl Error {
    pub(crate) fn malformed_layer(path: impl ToString, reason: impl Into<String>) -> Self {
        Self::MalformedLayer {
            path: path.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn corrupt_blob(digest: impl ToString, reason: impl Into<String>) -> Self {
        Self::CorruptBlob {
            digest: digest.to_string(),
            reason: reason.into(),
        }
    }
}
