//! Bundle layout: the on-disk shape of an unpacked image, plus
//! generation of the runtime-spec `config.json`.
//!
//! ```text
//! <bundle>/
//!   rootfs/            extracted filesystem
//!   config.json        runtime-spec configuration (generated)
//!   umoci.json         custodial metadata for repacking
//!   <mtree_name>.mtree snapshot driving the repack diff
//! ```

use std::collections::HashMap;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;

use anyhow::{Context, Result};
use cap_std::fs::Dir;
use cap_std_ext::cap_std;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use oci_spec::image::{Digest, ImageConfiguration};
use oci_spec::runtime::{
    LinuxNamespace, LinuxNamespaceBuilder, LinuxNamespaceType, ProcessBuilder, RootBuilder, Spec,
    SpecBuilder, UserBuilder,
};
use serde::{Deserialize, Serialize};

use crate::cas::DescriptorPath;
use crate::idmap::MapOptions;
use crate::Error;

/// Name of the rootfs directory inside a bundle.
pub const ROOTFS_NAME: &str = "rootfs";
/// Name of the runtime config inside a bundle.
pub const CONFIG_JSON: &str = "config.json";
/// Name of the custodial metadata file inside a bundle.
pub const META_NAME: &str = "umoci.json";
/// The metadata version we read and write.
pub const META_VERSION: &str = "2";

/// Custodial metadata tying a bundle to its source image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleMeta {
    /// Metadata format version.
    pub version: String,
    /// The descriptor path the bundle was unpacked from; repacks target
    /// this path.
    pub from: DescriptorPath,
    /// The id-mapping the bundle was unpacked with.
    pub map_options: MapOptions,
    /// Basename (without extension) of the mtree snapshot.
    pub mtree_name: String,
}

impl BundleMeta {
    fn validate(&self) -> Result<()> {
        if self.version != META_VERSION {
            return Err(Error::Invalid(format!(
                "bundle metadata version {:?} (expected {META_VERSION:?})",
                self.version
            ))
            .into());
        }
        self.from.validate()
    }
}

/// The snapshot name for a source manifest digest
/// (`sha256:abc…` becomes `sha256_abc…`).
pub fn mtree_name(digest: &Digest) -> String {
    format!("{digest}").replace(':', "_")
}

/// Create (or adopt an empty existing) bundle directory with mode
/// `0700`, returning a handle to it.
#[context("Creating bundle directory")]
pub fn create_bundle_dir(path: &Path) -> Result<Dir> {
    match std::fs::DirBuilder::new().mode(0o700).create(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            // Adopt an existing *empty* directory; anything else is a
            // clobber.
            if std::fs::read_dir(path)?.next().is_some() {
                return Err(Error::Clobber(path.display().to_string()).into());
            }
            std::fs::set_permissions(path, std::os::unix::fs::PermissionsExt::from_mode(0o700))?;
        }
        Err(e) => return Err(e).with_context(|| format!("creating {}", path.display())),
    }
    let dir = Dir::open_ambient_dir(path, cap_std::ambient_authority())?;
    dir.create_dir(ROOTFS_NAME)?;
    Ok(dir)
}

/// Open an existing bundle directory.
#[context("Opening bundle")]
pub fn open_bundle_dir(path: &Path) -> Result<Dir> {
    let dir = Dir::open_ambient_dir(path, cap_std::ambient_authority())
        .with_context(|| format!("opening {}", path.display()))?;
    if !dir.try_exists(ROOTFS_NAME)? {
        return Err(Error::Invalid(format!("bundle {} has no rootfs", path.display())).into());
    }
    Ok(dir)
}

/// Persist the custodial metadata.
#[context("Writing bundle metadata")]
pub fn write_meta(dir: &Dir, meta: &BundleMeta) -> Result<()> {
    meta.validate()?;
    let buf = serde_json::to_vec(meta)?;
    dir.atomic_write(META_NAME, buf)?;
    Ok(())
}

/// Read and validate the custodial metadata.
#[context("Reading bundle metadata")]
pub fn read_meta(dir: &Dir) -> Result<BundleMeta> {
    let f = dir
        .open_optional(META_NAME)?
        .ok_or_else(|| Error::NotFound(format!("bundle metadata ({META_NAME})")))?;
    let meta: BundleMeta = serde_json::from_reader(std::io::BufReader::new(f))
        .map_err(|e| Error::Invalid(format!("{META_NAME}: {e}")))?;
    meta.validate()?;
    Ok(meta)
}

/// Volume paths declared by the image configuration, used as mask
/// prefixes during repack.
pub fn config_volumes(config: &ImageConfiguration) -> Vec<String> {
    config
        .config()
        .as_ref()
        .and_then(|c| c.volumes().as_ref())
        .map(|v| v.iter().cloned().collect())
        .unwrap_or_default()
}

/// Translate an image configuration into a runtime-spec `config.json`.
///
/// The conversion follows the image-spec conversion rules for the
/// verbatim fields; `Config.User` is supported in numeric
/// `uid[:gid]` form (name resolution against the rootfs is out of
/// scope here).
#[context("Generating runtime config")]
pub fn runtime_config(config: &ImageConfiguration, map: &MapOptions) -> Result<Spec> {
    let mut spec = SpecBuilder::default().build().context("Building spec")?;
    spec.set_root(Some(
        RootBuilder::default()
            .path(ROOTFS_NAME)
            .readonly(false)
            .build()
            .context("Building root")?,
    ));

    let mut annotations: HashMap<String, String> = HashMap::new();
    annotations.insert(
        "org.opencontainers.image.os".to_string(),
        config.os().to_string(),
    );
    annotations.insert(
        "org.opencontainers.image.architecture".to_string(),
        config.architecture().to_string(),
    );
    if let Some(author) = config.author() {
        annotations.insert("org.opencontainers.image.author".to_string(), author.clone());
    }
    if let Some(created) = config.created() {
        annotations.insert("org.opencontainers.image.created".to_string(), created.clone());
    }

    if let Some(cfg) = config.config() {
        let mut process = ProcessBuilder::default().build().context("Building process")?;
        if let Some(dir) = cfg.working_dir() {
            process.set_cwd(dir.into());
        }
        match (cfg.entrypoint(), cfg.cmd()) {
            (None, None) => {}
            (None, Some(cmd)) => {
                process.set_args(Some(cmd.clone()));
            }
            (Some(entrypoint), None) => {
                process.set_args(Some(entrypoint.clone()));
            }
            (Some(entrypoint), Some(cmd)) => {
                let mut args = entrypoint.clone();
                args.extend(cmd.iter().cloned());
                process.set_args(Some(args));
            }
        }
        process.set_env(cfg.env().clone());
        if let Some(user) = cfg.user() {
            let (uid, gid) = parse_numeric_user(user)?;
            process.set_user(
                UserBuilder::default()
                    .uid(uid)
                    .gid(gid)
                    .build()
                    .context("Building user")?,
            );
        }
        spec.set_process(Some(process));
        if let Some(stop_signal) = cfg.stop_signal() {
            annotations.insert(
                "org.opencontainers.image.stopSignal".to_string(),
                stop_signal.clone(),
            );
        }
        // Labels take precedence over the derived annotations.
        if let Some(labels) = cfg.labels() {
            annotations.extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
    }
    spec.set_annotations(Some(annotations));

    if map.rootless {
        let mut linux = spec.linux().clone().unwrap_or_default();
        let mut namespaces: Vec<LinuxNamespace> =
            linux.namespaces().clone().unwrap_or_default();
        if !namespaces
            .iter()
            .any(|ns| ns.typ() == LinuxNamespaceType::User)
        {
            namespaces.push(
                LinuxNamespaceBuilder::default()
                    .typ(LinuxNamespaceType::User)
                    .build()
                    .context("Building user namespace")?,
            );
        }
        linux.set_namespaces(Some(namespaces));
        linux.set_uid_mappings(Some(map.uid_mappings.clone()));
        linux.set_gid_mappings(Some(map.gid_mappings.clone()));
        spec.set_linux(Some(linux));
    }
    Ok(spec)
}

/// Parse `Config.User` in `uid[:gid]` numeric form.
fn parse_numeric_user(user: &str) -> Result<(u32, u32)> {
    let (uid, gid) = match user.split_once(':') {
        Some((uid, gid)) => (uid, gid),
        None => (user, ""),
    };
    let parse = |s: &str| -> Result<u32> {
        s.parse()
            .map_err(|_| Error::Invalid(format!("non-numeric user {user:?}")).into())
    };
    let uid = if uid.is_empty() { 0 } else { parse(uid)? };
    let gid = if gid.is_empty() { uid } else { parse(gid)? };
    Ok((uid, gid))
}

#[cfg(test)]
mod tests {
    use oci_spec::image::{ConfigBuilder, ImageConfigurationBuilder};

    use super::*;

    #[test]
    fn test_bundle_dir_modes_and_clobber() -> Result<()> {
        let td = tempfile::tempdir()?;
        let path = td.path().join("bundle");
        let dir = create_bundle_dir(&path)?;
        use std::os::unix::fs::MetadataExt;
        assert_eq!(std::fs::metadata(&path)?.mode() & 0o7777, 0o700);
        drop(dir);
        // Recreating over a non-empty bundle is refused.
        let err = create_bundle_dir(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::Clobber(_))
        ));
        Ok(())
    }

    #[test]
    fn test_meta_roundtrip() -> Result<()> {
        use oci_spec::image::{DescriptorBuilder, MediaType, Sha256Digest};
        use std::str::FromStr;
        let td = tempfile::tempdir()?;
        let dir = create_bundle_dir(&td.path().join("b"))?;
        let desc = DescriptorBuilder::default()
            .media_type(MediaType::ImageManifest)
            .digest(
                Sha256Digest::from_str(
                    "2c26b46b68ffc68ff99b453c1d30413413422d706483bfa0f98a5e886266e7ae",
                )
                .unwrap(),
            )
            .size(7u64)
            .build()
            .unwrap();
        let meta = BundleMeta {
            version: META_VERSION.into(),
            from: DescriptorPath::from_root(desc),
            map_options: MapOptions::rootless(1000, 1000),
            mtree_name: "sha256_2c26b4".into(),
        };
        write_meta(&dir, &meta)?;
        let read = read_meta(&dir)?;
        assert_eq!(read.version, META_VERSION);
        assert_eq!(read.mtree_name, meta.mtree_name);
        assert!(read.map_options.rootless);
        assert_eq!(read.from, meta.from);
        Ok(())
    }

    #[test]
    fn test_runtime_config() -> Result<()> {
        let inner = ConfigBuilder::default()
            .entrypoint(vec!["/bin/sh".to_string()])
            .cmd(vec!["-c".to_string(), "true".to_string()])
            .env(vec!["PATH=/usr/bin".to_string()])
            .user("1000:7".to_string())
            .working_dir("/srv".to_string())
            .build()
            .unwrap();
        let config = ImageConfigurationBuilder::default()
            .config(inner)
            .build()
            .unwrap();
        let spec = runtime_config(&config, &MapOptions::rootless(1000, 1000))?;
        let process = spec.process().as_ref().unwrap();
        assert_eq!(
            process.args().as_ref().unwrap(),
            &vec!["/bin/sh".to_string(), "-c".into(), "true".into()]
        );
        assert_eq!(process.cwd(), Path::new("/srv"));
        let user = process.user();
        assert_eq!((user.uid(), user.gid()), (1000, 7));
        // Rootless adds a user namespace and the mappings.
        let linux = spec.linux().as_ref().unwrap();
        assert!(linux
            .namespaces()
            .as_ref()
            .unwrap()
            .iter()
            .any(|ns| ns.typ() == LinuxNamespaceType::User));
        assert_eq!(linux.uid_mappings().as_ref().unwrap().len(), 1);
        Ok(())
    }

    #[test]
    fn test_mtree_name() {
        use std::str::FromStr;
        let d = Digest::from_str(
            "sha256:2c26b46b68ffc68ff99b453c1d30413413422d706483bfa0f98a5e886266e7ae",
        )
        .unwrap();
        assert_eq!(
            mtree_name(&d),
            "sha256_2c26b46b68ffc68ff99b453c1d30413413422d706483bfa0f98a5e886266e7ae"
        );
    }
}
