//! # OCI image manipulation CLI
//!
//! Command line tool to unpack, repack and modify OCI images.

use std::ffi::OsString;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use cap_std::fs::Dir;
use cap_std_ext::cap_std;
use chrono::{DateTime, SecondsFormat, Utc};
use clap::{Parser, Subcommand};
use fn_error_context::context;
use oci_spec::image::{
    Arch, DescriptorBuilder, History, ImageConfigurationBuilder, ImageManifestBuilder, MediaType,
    Os, SCHEMA_VERSION,
};
use oci_spec::runtime::LinuxIdMapping;
use tokio_util::sync::CancellationToken;

use crate::cas::resolve::{
    delete_reference, list_references, resolve_reference_required, update_reference,
};
use crate::cas::{gc, DescriptorPath, ImageLayout};
use crate::idmap::{parse_idmap, MapOptions};
use crate::mutate::{Meta, Mutator};
use crate::repack::{repack, RepackOptions};
use crate::tar::WHITEOUT_PREFIX;
use crate::unpack::{unpack, unpack_rootfs, UnpackOptions};
use crate::{bundle, Compression, Error};

/// An `--image PATH[:TAG]` argument. An empty or missing tag defaults
/// to `latest`.
#[derive(Debug, Clone)]
pub struct ImageRef {
    /// Path of the image layout directory.
    pub path: PathBuf,
    /// Reference name inside the layout.
    pub tag: String,
}

impl FromStr for ImageRef {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (path, tag) = match s.rsplit_once(':') {
            // A separator inside the last path component is a tag.
            Some((path, tag)) if !tag.contains('/') => (path, tag),
            _ => (s, ""),
        };
        if path.is_empty() {
            return Err(Error::Invalid(format!("image reference {s:?}")).into());
        }
        let tag = if tag.is_empty() { "latest" } else { tag };
        if !crate::cas::resolve::is_valid_reference_name(tag) {
            return Err(Error::Invalid(format!("tag {tag:?}")).into());
        }
        Ok(Self {
            path: PathBuf::from(path),
            tag: tag.to_string(),
        })
    }
}

impl ImageRef {
    fn open(&self) -> Result<ImageLayout> {
        let dir = Dir::open_ambient_dir(&self.path, cap_std::ambient_authority())
            .with_context(|| format!("opening image {}", self.path.display()))?;
        ImageLayout::open(&dir)
    }

    fn resolve(&self, layout: &ImageLayout, token: &CancellationToken) -> Result<DescriptorPath> {
        resolve_reference_required(layout, &self.tag, token)
    }
}

/// Id-mapping flags shared by the unpacking commands.
#[derive(Debug, Parser)]
struct MapFlags {
    /// Enable rootless mode: map the caller to container root and
    /// emulate the rest.
    #[clap(long)]
    rootless: bool,

    /// UID mapping (container:host:size); may be repeated.
    #[clap(long = "uid-map", value_parser = parse_idmap)]
    uid_maps: Vec<LinuxIdMapping>,

    /// GID mapping (container:host:size); may be repeated.
    #[clap(long = "gid-map", value_parser = parse_idmap)]
    gid_maps: Vec<LinuxIdMapping>,
}

impl MapFlags {
    fn to_map_options(&self) -> MapOptions {
        let mut map = if self.rootless {
            MapOptions::rootless(
                rustix::process::geteuid().as_raw(),
                rustix::process::getegid().as_raw(),
            )
        } else {
            MapOptions::default()
        };
        if !self.uid_maps.is_empty() {
            map.uid_mappings = self.uid_maps.clone();
        }
        if !self.gid_maps.is_empty() {
            map.gid_mappings = self.gid_maps.clone();
        }
        map
    }
}

/// History metadata flags shared by the mutating commands.
#[derive(Debug, Parser)]
struct HistoryFlags {
    /// Do not append a history entry.
    #[clap(long = "no-history")]
    no_history: bool,

    /// History author.
    #[clap(long = "history.author")]
    history_author: Option<String>,

    /// History comment.
    #[clap(long = "history.comment")]
    comment: Option<String>,

    /// History created_by.
    #[clap(long = "history.created_by")]
    created_by: Option<String>,

    /// History creation timestamp (RFC 3339).
    #[clap(long = "history.created")]
    history_created: Option<DateTime<Utc>>,
}

impl HistoryFlags {
    fn to_history(&self, default_created_by: &str) -> Option<History> {
        if self.no_history {
            return None;
        }
        let mut h = History::default();
        h.set_author(self.history_author.clone());
        h.set_comment(self.comment.clone());
        h.set_created_by(Some(
            self.created_by
                .clone()
                .unwrap_or_else(|| default_created_by.to_string()),
        ));
        h.set_created(Some(
            self.history_created
                .unwrap_or_else(Utc::now)
                .to_rfc3339_opts(SecondsFormat::Secs, true),
        ));
        Some(h)
    }
}

/// The `--compress` choices; `auto` inherits from the previous layers.
#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum CompressArg {
    Auto,
    None,
    Gzip,
    Zstd,
}

impl CompressArg {
    fn to_compression(self) -> Option<Compression> {
        match self {
            CompressArg::Auto => None,
            CompressArg::None => Some(Compression::None),
            CompressArg::Gzip => Some(Compression::Gzip),
            CompressArg::Zstd => Some(Compression::Zstd),
        }
    }
}

/// Unpack an image into an OCI runtime bundle.
#[derive(Debug, Parser)]
struct UnpackCmd {
    /// Source image (PATH[:TAG]).
    #[clap(long)]
    image: ImageRef,

    /// Destination bundle directory.
    bundle: PathBuf,

    #[clap(flatten)]
    map: MapFlags,

    /// Keep existing symlinks to directories when the layer carries a
    /// directory at the same path.
    #[clap(long = "keep-dirlinks")]
    keep_dirlinks: bool,
}

/// Repack a bundle into a new image layer and tag.
#[derive(Debug, Parser)]
struct RepackCmd {
    /// Destination image (PATH[:TAG]).
    #[clap(long)]
    image: ImageRef,

    /// Bundle to repack.
    bundle: PathBuf,

    #[clap(flatten)]
    history: HistoryFlags,

    /// Additional masked path prefix; may be repeated.
    #[clap(long = "mask-path")]
    mask_paths: Vec<String>,

    /// Do not mask the image config's volumes.
    #[clap(long = "no-mask-volumes")]
    no_mask_volumes: bool,

    /// Update the bundle metadata to point at the new image.
    #[clap(long = "refresh-bundle")]
    refresh_bundle: bool,

    /// Layer compression.
    #[clap(long, value_enum, default_value = "auto")]
    compress: CompressArg,
}

/// Modify the image configuration.
#[derive(Debug, Parser)]
struct ConfigCmd {
    /// Image to modify (PATH[:TAG]).
    #[clap(long)]
    image: ImageRef,

    /// Tag to store the result under (defaults to the source tag).
    #[clap(long)]
    tag: Option<String>,

    #[clap(flatten)]
    history: HistoryFlags,

    /// Clear a list field (config.labels, config.env, config.volumes,
    /// config.entrypoint, config.cmd, config.exposedports); may be
    /// repeated.
    #[clap(long)]
    clear: Vec<String>,

    #[clap(long = "config.user")]
    user: Option<String>,
    #[clap(long = "config.workingdir")]
    workingdir: Option<String>,
    #[clap(long = "config.env")]
    env: Vec<String>,
    #[clap(long = "config.entrypoint")]
    entrypoint: Vec<String>,
    #[clap(long = "config.cmd")]
    cmd: Vec<String>,
    #[clap(long = "config.volume")]
    volume: Vec<String>,
    #[clap(long = "config.label")]
    label: Vec<String>,
    #[clap(long = "config.exposedports")]
    exposedports: Vec<String>,
    #[clap(long = "config.stopsignal")]
    stopsignal: Option<String>,
    #[clap(long)]
    architecture: Option<String>,
    #[clap(long)]
    os: Option<String>,
    #[clap(long)]
    author: Option<String>,
    /// Image creation timestamp (RFC 3339).
    #[clap(long)]
    created: Option<DateTime<Utc>>,
}

/// Tag an image target under an additional name.
#[derive(Debug, Parser)]
struct TagCmd {
    /// Source image (PATH[:TAG]).
    #[clap(long)]
    image: ImageRef,

    /// The new tag name.
    tag: String,
}

/// Remove a tag.
#[derive(Debug, Parser)]
struct RmCmd {
    /// Image tag to remove (PATH[:TAG]).
    #[clap(long)]
    image: ImageRef,
}

/// List the tags in an image layout.
#[derive(Debug, Parser)]
struct LsCmd {
    /// Image layout path (a TAG suffix is ignored).
    #[clap(long)]
    image: ImageRef,
}

/// Show the history of an image.
#[derive(Debug, Parser)]
struct StatCmd {
    /// Image to inspect (PATH[:TAG]).
    #[clap(long)]
    image: ImageRef,

    /// Emit JSON instead of a table.
    #[clap(long)]
    json: bool,
}

/// Initialize a fresh, empty image layout.
#[derive(Debug, Parser)]
struct InitCmd {
    /// Directory to create the layout in.
    #[clap(long)]
    layout: PathBuf,
}

/// Create a new empty image (manifest + config) in a layout.
#[derive(Debug, Parser)]
struct NewCmd {
    /// Image to create (PATH[:TAG]).
    #[clap(long)]
    image: ImageRef,
}

/// Garbage-collect unreferenced blobs.
#[derive(Debug, Parser)]
struct GcCmd {
    /// Image layout path.
    #[clap(long)]
    layout: PathBuf,
}

/// Insert a host file or directory into the image as a new layer.
#[derive(Debug, Parser)]
struct InsertCmd {
    /// Image to modify (PATH[:TAG]).
    #[clap(long)]
    image: ImageRef,

    /// Host path to insert (omitted with --whiteout).
    source: Option<PathBuf>,

    /// Path inside the image.
    target: Utf8PathBuf,

    /// Insert a whiteout for the target instead of content.
    #[clap(long)]
    whiteout: bool,

    #[clap(flatten)]
    history: HistoryFlags,

    /// Layer compression.
    #[clap(long, value_enum, default_value = "auto")]
    compress: CompressArg,
}

/// Lower-level commands that do not maintain bundle metadata.
#[derive(Debug, Subcommand)]
enum RawCmd {
    /// Extract the rootfs only, without bundle metadata.
    Unpack {
        /// Source image (PATH[:TAG]).
        #[clap(long)]
        image: ImageRef,

        /// Destination rootfs directory (created if missing).
        rootfs: PathBuf,

        #[clap(flatten)]
        map: MapFlags,
    },
    /// Append a raw tar file as a layer.
    AddLayer {
        /// Image to modify (PATH[:TAG]).
        #[clap(long)]
        image: ImageRef,

        /// An uncompressed tar archive.
        tar_file: PathBuf,

        #[clap(flatten)]
        history: HistoryFlags,

        /// Layer compression.
        #[clap(long, value_enum, default_value = "auto")]
        compress: CompressArg,
    },
    /// Generate a runtime-spec config.json from the image config.
    RuntimeConfig {
        /// Source image (PATH[:TAG]).
        #[clap(long)]
        image: ImageRef,

        /// Where to write the config.json.
        output: PathBuf,

        #[clap(flatten)]
        map: MapFlags,
    },
}

#[derive(Debug, Subcommand)]
enum Cmd {
    Unpack(UnpackCmd),
    Repack(RepackCmd),
    Config(ConfigCmd),
    Tag(TagCmd),
    Rm(RmCmd),
    Ls(LsCmd),
    Stat(StatCmd),
    Init(InitCmd),
    New(NewCmd),
    Gc(GcCmd),
    Insert(InsertCmd),
    #[clap(subcommand)]
    Raw(RawCmd),
}

/// umoci modifies Open Container images.
#[derive(Debug, Parser)]
#[clap(name = "umoci", version)]
struct Cli {
    /// Increase log verbosity (also honours RUST_LOG).
    #[clap(long, short = 'v', global = true)]
    verbose: bool,

    #[clap(subcommand)]
    cmd: Cmd,
}

/// Whether `--verbose` appears in the raw arguments (used by the
/// binary to pick a default log filter before parsing).
pub fn want_verbose(args: impl IntoIterator<Item = OsString>) -> bool {
    args.into_iter().any(|a| a == "--verbose" || a == "-v")
}

/// Parse arguments and run the selected command.
pub async fn run_from_iter<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);
    let token = CancellationToken::new();
    match cli.cmd {
        Cmd::Unpack(c) => cmd_unpack(c, &token).await,
        Cmd::Repack(c) => cmd_repack(c, &token).await,
        Cmd::Config(c) => cmd_config(c, &token),
        Cmd::Tag(c) => cmd_tag(c, &token),
        Cmd::Rm(c) => cmd_rm(c),
        Cmd::Ls(c) => cmd_ls(c),
        Cmd::Stat(c) => cmd_stat(c, &token),
        Cmd::Init(c) => cmd_init(c),
        Cmd::New(c) => cmd_new(c, &token),
        Cmd::Gc(c) => cmd_gc(c, &token),
        Cmd::Insert(c) => cmd_insert(c, &token),
        Cmd::Raw(c) => cmd_raw(c, &token).await,
    }
}

async fn cmd_unpack(c: UnpackCmd, token: &CancellationToken) -> Result<()> {
    let layout = c.image.open()?;
    let path = c.image.resolve(&layout, token)?;
    let opts = UnpackOptions {
        map: c.map.to_map_options(),
        keep_dirlinks: c.keep_dirlinks,
        strict_xattrs: false,
    };
    unpack(&layout, &path, &c.bundle, &opts, token).await
}

async fn cmd_repack(c: RepackCmd, token: &CancellationToken) -> Result<()> {
    let layout = c.image.open()?;
    let opts = RepackOptions {
        masks: c.mask_paths,
        no_mask_volumes: c.no_mask_volumes,
        refresh_bundle: c.refresh_bundle,
        compression: c.compress.to_compression(),
        history: c.history.to_history("umoci repack"),
    };
    let new_path = repack(&layout, &c.image.tag, &c.bundle, &opts, token).await?;
    tracing::info!(
        "repacked {} -> {}",
        c.bundle.display(),
        new_path.descriptor().digest()
    );
    Ok(())
}

#[context("Configuring image")]
fn cmd_config(c: ConfigCmd, token: &CancellationToken) -> Result<()> {
    let layout = c.image.open()?;
    let path = c.image.resolve(&layout, token)?;
    let mut mutator = Mutator::new(&layout, path)?;
    let mut config = mutator.config();

    for field in &c.clear {
        match field.as_str() {
            "config.labels" => config.set_labels(None),
            "config.env" => config.set_env(None),
            "config.volumes" => config.set_volumes(None),
            "config.entrypoint" => config.set_entrypoint(None),
            "config.cmd" => config.set_cmd(None),
            "config.exposedports" => config.set_exposed_ports(None),
            o => return Err(Error::Invalid(format!("unknown --clear target {o:?}")).into()),
        };
    }
    if let Some(user) = c.user {
        config.set_user(Some(user));
    }
    if let Some(dir) = c.workingdir {
        config.set_working_dir(Some(dir));
    }
    let extend = |cur: &Option<Vec<String>>, new: &[String]| -> Option<Vec<String>> {
        let mut v = cur.clone().unwrap_or_default();
        v.extend(new.iter().cloned());
        Some(v)
    };
    if !c.env.is_empty() {
        let v = extend(config.env(), &c.env);
        config.set_env(v);
    }
    if !c.entrypoint.is_empty() {
        config.set_entrypoint(Some(c.entrypoint.clone()));
    }
    if !c.cmd.is_empty() {
        config.set_cmd(Some(c.cmd.clone()));
    }
    if !c.volume.is_empty() {
        let v = extend(config.volumes(), &c.volume);
        config.set_volumes(v);
    }
    if !c.exposedports.is_empty() {
        let v = extend(config.exposed_ports(), &c.exposedports);
        config.set_exposed_ports(v);
    }
    if !c.label.is_empty() {
        let mut labels = config.labels().clone().unwrap_or_default();
        for kv in &c.label {
            let (k, v) = kv
                .split_once('=')
                .ok_or_else(|| Error::Invalid(format!("label {kv:?} (expected key=value)")))?;
            labels.insert(k.to_string(), v.to_string());
        }
        config.set_labels(Some(labels));
    }
    if let Some(signal) = c.stopsignal {
        config.set_stop_signal(Some(signal));
    }

    let meta = Meta {
        created: c.created,
        author: c.author,
        architecture: c.architecture.map(|a| Arch::from(a.as_str())),
        os: c.os.map(|o| Os::from(o.as_str())),
    };
    mutator.set(config, meta, None, c.history.to_history("umoci config"))?;
    let new_path = mutator.commit(token)?;
    if let Some(tag) = c.tag {
        update_reference(&layout, &tag, new_path.root())?;
    }
    Ok(())
}

fn cmd_tag(c: TagCmd, token: &CancellationToken) -> Result<()> {
    let layout = c.image.open()?;
    let path = c.image.resolve(&layout, token)?;
    let mut root = path.root().clone();
    // The new entry carries only the new name.
    root.set_annotations(None);
    update_reference(&layout, &c.tag, &root)
}

fn cmd_rm(c: RmCmd) -> Result<()> {
    let layout = c.image.open()?;
    delete_reference(&layout, &c.image.tag)
}

fn cmd_ls(c: LsCmd) -> Result<()> {
    let layout = c.image.open()?;
    for (name, _) in list_references(&layout)? {
        println!("{name}");
    }
    Ok(())
}

#[derive(Debug, serde::Serialize)]
struct Stat {
    history: Vec<History>,
}

fn cmd_stat(c: StatCmd, token: &CancellationToken) -> Result<()> {
    let layout = c.image.open()?;
    let path = c.image.resolve(&layout, token)?;
    let mutator = Mutator::new(&layout, path)?;
    let stat = Stat {
        history: mutator.configuration().history().clone(),
    };
    if c.json {
        println!("{}", serde_json::to_string_pretty(&stat)?);
        return Ok(());
    }
    println!("{:<25} {:<12} {:<6} CREATED BY", "CREATED", "SIZE", "EMPTY");
    for h in &stat.history {
        println!(
            "{:<25} {:<12} {:<6} {}",
            h.created().as_deref().unwrap_or("<unknown>"),
            "-",
            h.empty_layer().unwrap_or(false),
            h.created_by().as_deref().unwrap_or("")
        );
    }
    Ok(())
}

fn cmd_init(c: InitCmd) -> Result<()> {
    std::fs::create_dir_all(&c.layout)
        .with_context(|| format!("creating {}", c.layout.display()))?;
    let dir = Dir::open_ambient_dir(&c.layout, cap_std::ambient_authority())?;
    ImageLayout::create(&dir)?;
    Ok(())
}

/// Create a blank image: an empty config and a layer-less manifest.
#[context("Creating new image")]
fn cmd_new(c: NewCmd, token: &CancellationToken) -> Result<()> {
    let layout = c.image.open()?;
    let config = ImageConfigurationBuilder::default()
        .build()
        .context("Building empty config")?;
    let (cd, cs) = layout.put_json_blob(&config, token)?;
    let manifest = ImageManifestBuilder::default()
        .schema_version(SCHEMA_VERSION)
        .config(
            DescriptorBuilder::default()
                .media_type(MediaType::ImageConfig)
                .digest(cd)
                .size(cs)
                .build()
                .context("Building config descriptor")?,
        )
        .layers(Vec::new())
        .build()
        .context("Building manifest")?;
    let (md, ms) = layout.put_json_blob(&manifest, token)?;
    let desc = DescriptorBuilder::default()
        .media_type(MediaType::ImageManifest)
        .digest(md)
        .size(ms)
        .build()
        .context("Building manifest descriptor")?;
    update_reference(&layout, &c.image.tag, &desc)
}

fn cmd_gc(c: GcCmd, token: &CancellationToken) -> Result<()> {
    let dir = Dir::open_ambient_dir(&c.layout, cap_std::ambient_authority())
        .with_context(|| format!("opening layout {}", c.layout.display()))?;
    let layout = ImageLayout::open(&dir)?;
    let summary = gc::gc(&layout, None, token)?;
    for digest in &summary.removed {
        println!("removed {digest}");
    }
    tracing::info!(
        "gc: removed {} blobs, retained {}",
        summary.removed.len(),
        summary.retained.len()
    );
    Ok(())
}

#[context("Inserting into image")]
fn cmd_insert(c: InsertCmd, token: &CancellationToken) -> Result<()> {
    let layout = c.image.open()?;
    let path = c.image.resolve(&layout, token)?;
    let mut mutator = Mutator::new(&layout, path)?;
    let target = c.target.as_str().trim_start_matches('/').to_string();
    if target.is_empty() {
        return Err(Error::Invalid("empty insert target".into()).into());
    }
    let history = c.history.to_history("umoci insert");

    mutator.add_layer(c.compress.to_compression(), history, None, |w| {
        let mut builder = tar::Builder::new(w);
        builder.follow_symlinks(false);
        if c.whiteout {
            let target = Utf8PathBuf::from(&target);
            let base = target
                .file_name()
                .ok_or_else(|| Error::Invalid(format!("cannot whiteout {target}")))?;
            let name = match target.parent() {
                Some(parent) if !parent.as_str().is_empty() => {
                    parent.join(format!("{WHITEOUT_PREFIX}{base}"))
                }
                _ => Utf8PathBuf::from(format!("{WHITEOUT_PREFIX}{base}")),
            };
            let mut header = tar::Header::new_ustar();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(0);
            header.set_mode(0);
            header.set_mtime(0);
            builder.append_data(&mut header, name, std::io::empty())?;
        } else {
            let source = c
                .source
                .as_ref()
                .ok_or_else(|| Error::Invalid("insert requires a source path".into()))?;
            let md = std::fs::symlink_metadata(source)
                .with_context(|| format!("lstat {}", source.display()))?;
            if md.is_dir() {
                builder.append_dir_all(&target, source)?;
            } else {
                builder.append_path_with_name(source, &target)?;
            }
        }
        builder.finish()?;
        Ok(())
    })?;
    let new_path = mutator.commit(token)?;
    update_reference(&layout, &c.image.tag, new_path.root())?;
    Ok(())
}

async fn cmd_raw(c: RawCmd, token: &CancellationToken) -> Result<()> {
    match c {
        RawCmd::Unpack { image, rootfs, map } => {
            let layout = image.open()?;
            let path = image.resolve(&layout, token)?;
            std::fs::create_dir_all(&rootfs)
                .with_context(|| format!("creating {}", rootfs.display()))?;
            let root = Dir::open_ambient_dir(&rootfs, cap_std::ambient_authority())?;
            let opts = UnpackOptions {
                map: map.to_map_options(),
                ..Default::default()
            };
            unpack_rootfs(&layout, &path, &root, &opts, token).await
        }
        RawCmd::AddLayer {
            image,
            tar_file,
            history,
            compress,
        } => {
            let layout = image.open()?;
            let path = image.resolve(&layout, token)?;
            let mut mutator = Mutator::new(&layout, path)?;
            let f = std::fs::File::open(&tar_file)
                .with_context(|| format!("opening {}", tar_file.display()))?;
            mutator.add(
                std::io::BufReader::new(f),
                compress.to_compression(),
                history.to_history("umoci raw add-layer"),
                None,
                token,
            )?;
            let new_path = mutator.commit(token)?;
            update_reference(&layout, &image.tag, new_path.root())?;
            Ok(())
        }
        RawCmd::RuntimeConfig { image, output, map } => {
            let layout = image.open()?;
            let path = image.resolve(&layout, token)?;
            let mutator = Mutator::new(&layout, path)?;
            let spec = bundle::runtime_config(&mutator.configuration(), &map.to_map_options())?;
            let buf = serde_json::to_vec_pretty(&spec).context("Serializing runtime config")?;
            std::fs::write(&output, buf)
                .with_context(|| format!("writing {}", output.display()))?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_ref_parsing() {
        let r: ImageRef = "path/to/image:v1".parse().unwrap();
        assert_eq!(r.path, PathBuf::from("path/to/image"));
        assert_eq!(r.tag, "v1");
        let r: ImageRef = "image".parse().unwrap();
        assert_eq!(r.tag, "latest");
        let r: ImageRef = "image:".parse().unwrap();
        assert_eq!(r.tag, "latest");
        // A colon inside a directory component is not a tag separator.
        let r: ImageRef = "dir:with/slash".parse().unwrap();
        assert_eq!(r.path, PathBuf::from("dir:with/slash"));
        assert_eq!(r.tag, "latest");
        assert!("".parse::<ImageRef>().is_err());
        assert!("img:UPPER CASE".parse::<ImageRef>().is_err());
    }

    #[test]
    fn test_cli_parses() {
        Cli::parse_from(["umoci", "unpack", "--image", "img:latest", "bundle"]);
        Cli::parse_from([
            "umoci",
            "repack",
            "--image",
            "img:new",
            "--refresh-bundle",
            "--compress",
            "zstd",
            "bundle",
        ]);
        Cli::parse_from([
            "umoci",
            "config",
            "--image",
            "img",
            "--config.env",
            "A=b",
            "--clear",
            "config.labels",
        ]);
        Cli::parse_from(["umoci", "raw", "unpack", "--image", "img", "rootfs"]);
        Cli::parse_from(["umoci", "gc", "--layout", "img"]);
    }
}
