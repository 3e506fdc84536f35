//! # OCI image unpack/repack tool
//!
//! This crate implements the core of an OCI image manipulation tool: a
//! content-addressed blob store over an [OCI image layout] directory, a
//! tar layer codec that can extract layers onto a host filesystem and
//! synthesize new delta layers from an mtree snapshot, and a "rootless"
//! filesystem mode that emulates ownership and device nodes through an
//! extended attribute protocol when the caller lacks the relevant
//! capabilities.
//!
//! [OCI image layout]: https://github.com/opencontainers/image-spec/blob/main/image-layout.md

// See https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
#![deny(missing_debug_implementations)]

pub mod bundle;
pub mod cas;
pub mod cli;
mod compression;
pub mod digest;
mod errors;
pub mod fseval;
pub mod idmap;
pub mod mtree;
pub mod mutate;
pub mod repack;
pub mod rootless;
pub mod tar;
pub(crate) mod tokio_util;
pub mod unpack;

pub use compression::Compression;
pub use errors::Error;

/// The standard result type used throughout this crate.
pub type Result<T> = anyhow::Result<T>;

/// Re-export the OCI types that are part of our public API.
pub use oci_spec;
