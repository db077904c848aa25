//! On-disk stream model and scanner.
//!
//! A stream is a directory tree of the form
//! `<stream>/<distro>/<release>/<arch>/<variant>/<version>/<files>`.
//! The scanner turns that tree into [`Product`]s, [`Version`]s and
//! [`Item`]s without touching anything: hashing is opt-in via
//! [`ScanOptions`], so the cheap rescan used for diffing stays cheap.

pub mod config;
pub mod index;

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::hash;
use crate::stream::config::ImageConfig;

/// Name of the checksum file containing SHA-256 hashes.
pub const FILE_CHECKSUM_SHA256: &str = "SHA256SUMS";

/// Name of the optional per-version image configuration file.
pub const FILE_IMAGE_CONFIG: &str = "image.yaml";

/// Item type of the metadata tarball.
pub const ITEM_TYPE_METADATA: &str = "lxd.tar.xz";

/// Item type of a container root filesystem.
pub const ITEM_TYPE_SQUASHFS: &str = "squashfs";

/// Item type of a container root filesystem delta.
pub const ITEM_TYPE_SQUASHFS_DELTA: &str = "squashfs.vcdiff";

/// Item type of a VM root filesystem (qcow2).
pub const ITEM_TYPE_DISK_KVM: &str = "disk-kvm.img";

/// Item type of a VM root filesystem delta.
pub const ITEM_TYPE_DISK_KVM_DELTA: &str = "disk-kvm.img.vcdiff";

/// Item type of a root filesystem tarball.
pub const ITEM_TYPE_ROOT_TARXZ: &str = "root.tar.xz";

/// File extensions that become catalog items.
const ALLOWED_ITEM_EXTENSIONS: &[&str] =
    &[".tar.xz", ".squashfs", ".vcdiff", ".qcow2", ".qcow2.vcdiff"];

/// Expected shape of a product path relative to the repository root.
const PRODUCT_PATH_FORMAT: &str = "stream/distribution/release/architecture/variant";

/// Invariant errors the scanner recovers from locally.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The version is missing its metadata file or every rootfs, or is a
    /// hidden (partially uploaded) directory.
    #[error("Product version is incomplete: {0:?}")]
    VersionIncomplete(String),

    /// The version's `image.yaml` could not be parsed.
    #[error("Product version has invalid image config: {0:?}: {1}")]
    VersionInvalidImageConfig(String, String),

    /// The path does not name a product directory.
    #[error("Invalid product path: {0}")]
    ProductInvalidPath(String),
}

/// Scanner behavior toggles. Both default to off.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanOptions {
    pub include_incomplete: bool,
    pub calc_hashes: bool,
}

impl ScanOptions {
    pub fn include_incomplete(mut self, value: bool) -> Self {
        self.include_incomplete = value;
        self
    }

    pub fn calc_hashes(mut self, value: bool) -> Self {
        self.calc_hashes = value;
        self
    }
}

/// A single file within a product version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Type of the file; a known item type when the extension is
    /// recognized, otherwise the file name itself.
    pub ftype: String,

    /// Path relative to the repository root, `/`-separated.
    pub path: String,

    /// Size in bytes.
    pub size: u64,

    /// SHA-256 of the file, when hashes were requested.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sha256: String,

    /// Combined SHA-256 of the metadata tarball followed by the VM rootfs.
    /// Set only on the metadata item when both files are present.
    #[serde(
        rename = "combined_disk-kvm-img_sha256",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub combined_sha256_disk_kvm_img: String,

    /// Combined SHA-256 of the metadata tarball followed by the container
    /// rootfs. Set only on the metadata item when both files are present.
    #[serde(
        rename = "combined_squashfs_sha256",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub combined_sha256_squashfs: String,

    /// Combined SHA-256 of the metadata tarball followed by the rootfs
    /// tarball. Set only on the metadata item when both files are present.
    #[serde(
        rename = "combined_rootxz_sha256",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub combined_sha256_rootxz: String,

    /// Version name the delta was calculated from. Set only on delta items.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub delta_base: String,
}

/// A dated build of a product: one directory of items.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Version {
    /// Whether the version lacks the metadata file or every rootfs.
    /// Hidden directories are always incomplete.
    #[serde(skip)]
    pub incomplete: bool,

    /// Filename to checksum pairs parsed from `SHA256SUMS`.
    #[serde(skip)]
    pub checksums: BTreeMap<String, String>,

    /// Parsed `image.yaml`, when present.
    #[serde(skip)]
    pub image_config: ImageConfig,

    /// Items keyed by file name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub items: BTreeMap<String, Item>,
}

/// A single image identity with all of its versions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Product {
    /// Comma-joined aliases the product can be referenced by.
    pub aliases: String,

    /// Architecture the image was built for (e.g. amd64).
    #[serde(rename = "arch")]
    pub architecture: String,

    /// Name of the image distribution.
    pub distro: String,

    /// Pretty name of the operating system.
    pub os: String,

    /// Name of the image release.
    pub release: String,

    /// Pretty display name of the release.
    pub release_title: String,

    /// Name of the image variant.
    pub variant: String,

    /// Versions keyed by version name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub versions: BTreeMap<String, Version>,

    /// Configuration requirements the image expects at runtime.
    #[serde(default)]
    pub requirements: BTreeMap<String, String>,
}

impl Product {
    /// Product ID: `distro:release:arch:variant`.
    pub fn id(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.distro, self.release, self.architecture, self.variant
        )
    }

    /// Product path relative to its stream root.
    pub fn rel_path(&self) -> PathBuf {
        [
            self.distro.as_str(),
            self.release.as_str(),
            self.architecture.as_str(),
            self.variant.as_str(),
        ]
        .iter()
        .collect()
    }
}

/// One stream's products (`products:1.0`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProductCatalog {
    /// Stream name (e.g. images).
    pub content_id: String,

    pub format: String,

    pub datatype: String,

    /// Products keyed by product ID.
    pub products: BTreeMap<String, Product>,
}

impl ProductCatalog {
    pub fn new(stream_name: &str, products: BTreeMap<String, Product>) -> Self {
        Self {
            content_id: stream_name.to_string(),
            format: "products:1.0".to_string(),
            datatype: "image-downloads".to_string(),
            products,
        }
    }
}

/// Path of a stream's published catalog file.
pub fn catalog_path(root_dir: &Path, stream_version: &str, stream_name: &str) -> PathBuf {
    root_dir
        .join("streams")
        .join(stream_version)
        .join(format!("{stream_name}.json"))
}

/// Walk the stream subtree and collect all products keyed by product ID.
///
/// Intermediate directories (wrong depth) are ignored; products without a
/// single included version are skipped; other errors surface.
pub fn get_products(
    root_dir: &Path,
    stream_rel_path: &Path,
    opts: ScanOptions,
) -> Result<BTreeMap<String, Product>> {
    let stream_path = root_dir.join(stream_rel_path);
    let mut products = BTreeMap::new();

    for entry in WalkDir::new(&stream_path) {
        let entry =
            entry.with_context(|| format!("Failed to walk {}", stream_path.display()))?;
        if !entry.file_type().is_dir() {
            continue;
        }

        let rel_path = entry
            .path()
            .strip_prefix(root_dir)
            .with_context(|| format!("Failed to resolve {}", entry.path().display()))?;

        let product = match get_product(root_dir, rel_path, opts) {
            Ok(product) => product,
            Err(err) => match err.downcast_ref::<StreamError>() {
                Some(StreamError::ProductInvalidPath(_)) => continue,
                _ => return Err(err),
            },
        };

        // Skip products with no versions (empty products).
        if product.versions.is_empty() {
            continue;
        }

        products.insert(product.id(), product);
    }

    Ok(products)
}

/// Read the product on the given path including all of its versions.
///
/// The relative path must match `stream/distribution/release/architecture/
/// variant` and name an existing directory. Incomplete versions and
/// versions with a broken image config are skipped.
pub fn get_product(root_dir: &Path, product_rel_path: &Path, opts: ScanOptions) -> Result<Product> {
    let parts: Vec<&str> = product_rel_path
        .iter()
        .map(|part| part.to_str().unwrap_or_default())
        .collect();

    // Ensure the product relative path matches the required format.
    if parts.len() != 5 || parts.iter().any(|part| part.is_empty()) {
        return Err(StreamError::ProductInvalidPath(format!(
            "path {:?} does not match the required format {:?}",
            rel_path_string(product_rel_path),
            PRODUCT_PATH_FORMAT
        ))
        .into());
    }

    let product_path = root_dir.join(product_rel_path);
    let metadata = match fs::metadata(&product_path) {
        Ok(metadata) => metadata,
        Err(err) => {
            return Err(StreamError::ProductInvalidPath(format!(
                "{:?}: {err}",
                rel_path_string(product_rel_path)
            ))
            .into())
        }
    };

    if !metadata.is_dir() {
        return Err(StreamError::ProductInvalidPath(format!(
            "{:?}: not a directory",
            rel_path_string(product_rel_path)
        ))
        .into());
    }

    let mut product = Product {
        distro: parts[1].to_string(),
        release: parts[2].to_string(),
        architecture: parts[3].to_string(),
        variant: parts[4].to_string(),
        ..Default::default()
    };

    let mut entries: Vec<fs::DirEntry> = fs::read_dir(&product_path)
        .with_context(|| format!("Failed to read product contents {}", product_path.display()))?
        .collect::<io::Result<_>>()?;

    // Sorted order so that config from the newest complete version wins.
    entries.sort_by_key(|entry| entry.file_name());

    let mut aliases: Vec<String> = Vec::new();
    let mut os_name = String::new();

    for entry in entries {
        if !entry.file_type()?.is_dir() {
            continue;
        }

        let version_name = entry.file_name().to_string_lossy().into_owned();
        let version_rel_path = product_rel_path.join(&version_name);

        let version = match get_version(root_dir, &version_rel_path, opts) {
            Ok(version) => version,
            Err(err) => match err.downcast_ref::<StreamError>() {
                Some(StreamError::VersionIncomplete(_)) => continue,
                Some(StreamError::VersionInvalidImageConfig(..)) => {
                    tracing::warn!(
                        version = rel_path_string(&version_rel_path),
                        error = %err,
                        "Skipping version with invalid image config"
                    );
                    continue;
                }
                _ => return Err(err),
            },
        };

        // Apply the image config of each complete version in turn; the
        // last (newest) one wins.
        if !version.incomplete {
            aliases.clear();
            product.requirements.clear();

            os_name = version.image_config.distro_name.clone();

            for rule in &version.image_config.requirements {
                if rule.applies_to(&product.release, &product.architecture, &product.variant) {
                    for (key, value) in &rule.requirements {
                        product.requirements.insert(key.clone(), value.clone());
                    }
                }
            }

            for (release, release_aliases) in &version.image_config.release_aliases {
                if release != &product.release {
                    // Skip aliases for other releases.
                    continue;
                }

                for release_alias in release_aliases.split(',') {
                    aliases.extend(create_aliases(
                        &product.distro,
                        release_alias,
                        &product.variant,
                    ));
                }
            }
        }

        product.versions.insert(version_name, version);
    }

    // Default aliases come first, config-provided ones after.
    let mut all_aliases = create_aliases(&product.distro, &product.release, &product.variant);
    all_aliases.extend(aliases);
    product.aliases = all_aliases.join(",");

    product.os = if os_name.is_empty() {
        title_case(&product.distro)
    } else {
        os_name
    };

    Ok(product)
}

/// Read a single version directory, classifying files into items and
/// parsing `SHA256SUMS` and `image.yaml` along the way.
///
/// When hashing is requested, items get their SHA-256 and the metadata item
/// gets combined hashes for each coexisting rootfs.
pub fn get_version(root_dir: &Path, version_rel_path: &Path, opts: ScanOptions) -> Result<Version> {
    let version_path = root_dir.join(version_rel_path);

    // Hidden versions are considered incomplete, as they may contain
    // partially uploaded files.
    let dir_name = version_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    if dir_name.starts_with('.') && !opts.include_incomplete {
        return Err(StreamError::VersionIncomplete(format!(
            "{} (hidden version)",
            rel_path_string(version_rel_path)
        ))
        .into());
    }

    let mut version = Version {
        incomplete: true,
        ..Default::default()
    };

    let entries = fs::read_dir(&version_path)
        .with_context(|| format!("Failed to read {}", version_path.display()))?;

    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            continue;
        }

        let file_name = entry.file_name().to_string_lossy().into_owned();

        if has_allowed_extension(&file_name) {
            let item_rel_path = version_rel_path.join(&file_name);
            let item = get_item(root_dir, &item_rel_path, opts)?;
            version.items.insert(file_name, item);
        } else if file_name == FILE_CHECKSUM_SHA256 {
            version.checksums = read_checksum_file(&entry.path())
                .context("Failed to read checksums file")?;
        } else if file_name == FILE_IMAGE_CONFIG {
            version.image_config = config::read_image_config(&entry.path()).map_err(|err| {
                StreamError::VersionInvalidImageConfig(
                    rel_path_string(version_rel_path),
                    format!("{err:#}"),
                )
            })?;
        }
    }

    // A version is complete once the metadata tarball and at least one
    // rootfs (squashfs or qcow2) are present. Combined hashes live on the
    // metadata item.
    if version.items.contains_key(ITEM_TYPE_METADATA) {
        let metadata_path = version_path.join(ITEM_TYPE_METADATA);
        let mut metadata_item = version.items[ITEM_TYPE_METADATA].clone();

        for (item_name, item) in &version.items {
            if ![ITEM_TYPE_SQUASHFS, ITEM_TYPE_DISK_KVM, ITEM_TYPE_ROOT_TARXZ]
                .contains(&item.ftype.as_str())
            {
                // Not relevant for a combined checksum.
                continue;
            }

            let item_hash = if opts.calc_hashes {
                hash::file_hash(&[&metadata_path, &version_path.join(item_name)])?
            } else {
                String::new()
            };

            match item.ftype.as_str() {
                ITEM_TYPE_DISK_KVM => {
                    metadata_item.combined_sha256_disk_kvm_img = item_hash;
                    version.incomplete = false;
                }
                ITEM_TYPE_SQUASHFS => {
                    metadata_item.combined_sha256_squashfs = item_hash;
                    version.incomplete = false;
                }
                ITEM_TYPE_ROOT_TARXZ => {
                    metadata_item.combined_sha256_rootxz = item_hash;
                }
                _ => {}
            }
        }

        version
            .items
            .insert(ITEM_TYPE_METADATA.to_string(), metadata_item);
    }

    if version.incomplete && !opts.include_incomplete {
        return Err(
            StreamError::VersionIncomplete(rel_path_string(version_rel_path)).into(),
        );
    }

    Ok(version)
}

/// Build an item for the file on the given path, deriving its type (and,
/// for deltas, the base version) from the file name.
pub fn get_item(root_dir: &Path, item_rel_path: &Path, opts: ScanOptions) -> Result<Item> {
    let item_path = root_dir.join(item_rel_path);
    let metadata = fs::metadata(&item_path)
        .with_context(|| format!("Failed to read {}", item_path.display()))?;

    let file_name = item_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut item = Item {
        path: rel_path_string(item_rel_path),
        size: metadata.len(),
        ..Default::default()
    };

    if opts.calc_hashes {
        item.sha256 = hash::file_hash(&[&item_path])?;
    }

    let extension = file_name.rsplit_once('.').map(|(_, ext)| ext);
    match extension {
        Some("squashfs") => item.ftype = ITEM_TYPE_SQUASHFS.to_string(),
        Some("qcow2") => item.ftype = ITEM_TYPE_DISK_KVM.to_string(),
        Some("vcdiff") => {
            // Delta file names embed the base version:
            //   rootfs.<base>.vcdiff / disk.<base>.qcow2.vcdiff
            let parts: Vec<&str> = file_name.split('.').collect();
            if file_name.ends_with(".qcow2.vcdiff") {
                item.ftype = ITEM_TYPE_DISK_KVM_DELTA.to_string();
                item.delta_base = parts[parts.len() - 3].to_string();
            } else {
                item.ftype = ITEM_TYPE_SQUASHFS_DELTA.to_string();
                item.delta_base = parts[parts.len() - 2].to_string();
            }
        }
        _ => item.ftype = file_name,
    }

    Ok(item)
}

/// Parse a checksum file into filename/checksum pairs.
///
/// Lines are whitespace-trimmed and split into checksum and filename;
/// malformed lines are ignored and later duplicates win.
pub fn read_checksum_file(path: &Path) -> Result<BTreeMap<String, String>> {
    use std::io::BufRead;

    let file = fs::File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut checksums = BTreeMap::new();

    for line in io::BufReader::new(file).lines() {
        let line = line?;
        let line = line.trim();

        let Some((checksum, file_name)) = line.split_once(' ') else {
            continue;
        };

        let file_name = file_name.trim();
        if file_name.is_empty() {
            continue;
        }

        checksums.insert(file_name.to_string(), checksum.to_string());
    }

    Ok(checksums)
}

/// Aliases for the given distro, release and variant.
///
/// `current` releases and `default` variants get shortened forms as well.
pub fn create_aliases(distro: &str, release: &str, variant: &str) -> Vec<String> {
    let mut aliases = vec![format!("{distro}/{release}/{variant}")];

    if release == "current" {
        aliases.push(format!("{distro}/{variant}"));
    }

    if variant == "default" {
        if release == "current" {
            aliases.push(distro.to_string());
        } else {
            aliases.push(format!("{distro}/{release}"));
        }
    }

    aliases
}

fn has_allowed_extension(file_name: &str) -> bool {
    ALLOWED_ITEM_EXTENSIONS
        .iter()
        .any(|ext| file_name.ends_with(ext))
}

/// Relative path as a `/`-separated string, as serialized in the catalog.
fn rel_path_string(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn title_case(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}
