//! Prune orchestrator: version retention and dangling cleanup.
//!
//! Retention rewrites the catalog before touching the filesystem, so a
//! client following the published catalog never resolves a version whose
//! directory is already gone. Dangling cleanup goes the other way: it
//! removes directories the catalog does not reference, with a grace window
//! so an upload in progress is never swept up, and it refuses to run
//! against an empty catalog (an empty or lost catalog would otherwise
//! condemn the entire tree).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context, Result};

use crate::fsutil;
use crate::stream::{self, ProductCatalog, ScanOptions};

/// Grace period before an unreferenced directory may be deleted. Protects
/// against racing with an in-progress upload.
pub const DANGLING_MAX_AGE: Duration = Duration::from_secs(6 * 60 * 60);

/// Options for the prune command.
#[derive(Debug, Clone)]
pub struct PruneOptions {
    /// Stream format version directory under `streams/` (e.g. `v1`).
    pub stream_version: String,

    /// Stream names (image directories) relative to the repository root.
    pub image_dirs: Vec<String>,

    /// Number of versions to retain per product. Must be at least 1.
    pub retain: usize,

    /// Also remove versions not referenced by the product catalog.
    pub dangling: bool,
}

/// Apply retention (and optionally dangling cleanup) to every configured
/// stream, then sweep empty directories.
pub fn prune(root_dir: &Path, opts: &PruneOptions) -> Result<()> {
    for stream_name in &opts.image_dirs {
        if opts.dangling {
            prune_dangling_product_versions(root_dir, &opts.stream_version, stream_name)?;
        }

        prune_stream_product_versions(root_dir, &opts.stream_version, stream_name, opts.retain)?;
    }

    prune_empty_dirs(root_dir, true)
}

/// Remove all product versions from the catalog except the `retain`
/// newest (largest) version names, then delete the dropped directories.
///
/// The catalog is republished before any directory is removed.
pub fn prune_stream_product_versions(
    root_dir: &Path,
    stream_version: &str,
    stream_name: &str,
    retain: usize,
) -> Result<()> {
    if retain < 1 {
        bail!("At least 1 product version must be retained");
    }

    let catalog_file_path = stream::catalog_path(root_dir, stream_version, stream_name);
    let mut catalog: ProductCatalog = fsutil::read_json_file(&catalog_file_path)?;

    // Collect the versions that fall out of the retention window.
    let mut discard_paths: Vec<PathBuf> = Vec::new();

    for product in catalog.products.values_mut() {
        let product_path = root_dir.join(stream_name).join(product.rel_path());

        if product.versions.len() <= retain {
            // All product versions must be retained.
            continue;
        }

        // Newest (lexicographically largest) names first.
        let mut version_names: Vec<String> = product.versions.keys().cloned().collect();
        version_names.sort();
        version_names.reverse();

        for version_name in version_names.split_off(retain) {
            product.versions.remove(&version_name);
            discard_paths.push(product_path.join(&version_name));
        }
    }

    // Update the catalog before removing anything from disk, so that a
    // non-existing version is never listed for download.
    let temp_path = fsutil::hidden_temp_path(&catalog_file_path)?;
    fsutil::write_json_file(&temp_path, &catalog)?;
    fs::rename(&temp_path, &catalog_file_path).with_context(|| {
        format!(
            "Failed to replace product catalog {}",
            catalog_file_path.display()
        )
    })?;
    fsutil::set_published_mode(&catalog_file_path)?;

    for path in discard_paths {
        if let Err(err) = fs::remove_dir_all(&path) {
            // The next build run will notice the drift and re-include the
            // version, so this is not fatal.
            tracing::error!(path = %path.display(), error = %err, "Failed to prune old product version");
            continue;
        }

        tracing::info!(path = %path.display(), "Pruned old product version");
    }

    Ok(())
}

/// Remove product and version directories that exist on disk but are not
/// referenced by the product catalog, once they are older than
/// [`DANGLING_MAX_AGE`].
pub fn prune_dangling_product_versions(
    root_dir: &Path,
    stream_version: &str,
    stream_name: &str,
) -> Result<()> {
    // Scan the directory hierarchy, including incomplete versions: a
    // half-uploaded version is still a directory that can dangle.
    let scanned = stream::get_products(
        root_dir,
        Path::new(stream_name),
        ScanOptions::default().include_incomplete(true),
    )?;

    let catalog_file_path = stream::catalog_path(root_dir, stream_version, stream_name);
    let catalog: ProductCatalog = fsutil::read_json_file(&catalog_file_path)?;

    // An empty catalog would mark everything as dangling. That is far more
    // likely to be a lost or broken catalog than an empty repository.
    if catalog.products.is_empty() {
        tracing::info!(
            stream = stream_name,
            "Skipping removal of dangling resources, because product catalog is empty"
        );
        return Ok(());
    }

    for (id, scanned_product) in &scanned {
        let product_path = root_dir.join(stream_name).join(scanned_product.rel_path());

        match catalog.products.get(id) {
            None => {
                remove_if_older(&product_path, DANGLING_MAX_AGE)?;
            }
            Some(catalog_product) => {
                for version_name in scanned_product.versions.keys() {
                    if catalog_product.versions.contains_key(version_name) {
                        // Version is referenced, nothing to do.
                        continue;
                    }

                    remove_if_older(&product_path.join(version_name), DANGLING_MAX_AGE)?;
                }
            }
        }
    }

    Ok(())
}

/// Remove the directory when its modification time is older than `max_age`.
/// Removal failures are logged, not fatal.
fn remove_if_older(path: &Path, max_age: Duration) -> Result<()> {
    let metadata = fs::metadata(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let modified = metadata
        .modified()
        .with_context(|| format!("Failed to read modification time of {}", path.display()))?;

    let age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or_default();
    if age <= max_age {
        return Ok(());
    }

    if let Err(err) = fs::remove_dir_all(path) {
        tracing::error!(path = %path.display(), error = %err, "Failed to prune dangling resource");
        return Ok(());
    }

    tracing::info!(path = %path.display(), "Pruned dangling resource");
    Ok(())
}

/// Recursively remove empty directories under `base_dir`. With `keep_base`
/// the base directory itself survives even when empty.
pub fn prune_empty_dirs(base_dir: &Path, keep_base: bool) -> Result<()> {
    // Normalize away `.` components and redundant separators.
    let base_dir: PathBuf = base_dir.components().collect();
    prune_empty_dirs_inner(&base_dir, keep_base)
}

fn prune_empty_dirs_inner(base_dir: &Path, keep_base: bool) -> Result<()> {
    let mut entries = read_dir_entries(base_dir)?;

    if !entries.is_empty() {
        for entry in &entries {
            if !entry.file_type()?.is_dir() {
                continue;
            }

            prune_empty_dirs_inner(&entry.path(), false)?;
        }

        // Children may have been removed; look again.
        entries = read_dir_entries(base_dir)?;
    }

    if !keep_base && entries.is_empty() {
        fs::remove_dir(base_dir)
            .with_context(|| format!("Failed to remove {}", base_dir.display()))?;
        tracing::info!(path = %base_dir.display(), "Removed empty directory");
    }

    Ok(())
}

fn read_dir_entries(dir: &Path) -> Result<Vec<fs::DirEntry>> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to read {}", dir.display()))?
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("Failed to read {}", dir.display()))?;
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{ProductMock, VersionMock};
    use tempfile::TempDir;

    fn complete_version(name: &str) -> VersionMock {
        VersionMock::new(name).with_files(&["lxd.tar.xz", "disk.qcow2"])
    }

    fn read_catalog(root: &Path) -> ProductCatalog {
        fsutil::read_json_file(&stream::catalog_path(root, "v1", "images")).unwrap()
    }

    #[test]
    fn retention_keeps_the_largest_version_names() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let product_rel = "images/ubuntu/noble/amd64/default";
        ProductMock::new(product_rel)
            .add_version(complete_version("2024_01_01"))
            .add_version(complete_version("2024_01_05"))
            .add_version(complete_version("2024_05_01"))
            .add_version(complete_version("2025_01_01"))
            .with_catalog()
            .create(root);

        prune_stream_product_versions(root, "v1", "images", 3).unwrap();

        let catalog = read_catalog(root);
        let product = &catalog.products["ubuntu:noble:amd64:default"];
        assert_eq!(
            product.versions.keys().collect::<Vec<_>>(),
            vec!["2024_01_05", "2024_05_01", "2025_01_01"]
        );

        let product_dir = root.join(product_rel);
        assert!(!product_dir.join("2024_01_01").exists());
        for kept in ["2024_01_05", "2024_05_01", "2025_01_01"] {
            assert!(product_dir.join(kept).exists());
        }
    }

    #[test]
    fn retention_leaves_small_products_alone() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        ProductMock::new("images/ubuntu/noble/amd64/default")
            .add_version(complete_version("v1"))
            .add_version(complete_version("v2"))
            .with_catalog()
            .create(root);

        prune_stream_product_versions(root, "v1", "images", 5).unwrap();

        let catalog = read_catalog(root);
        let product = &catalog.products["ubuntu:noble:amd64:default"];
        assert_eq!(product.versions.len(), 2);
        assert!(root
            .join("images/ubuntu/noble/amd64/default/v1")
            .exists());
    }

    #[test]
    fn retention_of_zero_is_rejected() {
        let tmp = TempDir::new().unwrap();
        assert!(prune_stream_product_versions(tmp.path(), "v1", "images", 0).is_err());
    }

    #[test]
    fn dangling_prune_skips_when_catalog_is_empty() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        // Catalog snapshot taken before any version exists: zero products.
        ProductMock::new("images/ubuntu/noble/amd64/default")
            .with_catalog()
            .add_version(complete_version("v1"))
            .with_files_age(Duration::from_secs(24 * 60 * 60))
            .create(root);

        prune_dangling_product_versions(root, "v1", "images").unwrap();

        assert!(root
            .join("images/ubuntu/noble/amd64/default/v1")
            .exists());
    }

    #[test]
    fn dangling_versions_are_removed_after_the_grace_window() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let product_rel = "images/ubuntu/noble/amd64/default";
        // v1 makes it into the catalog; v2 and the hidden upload appear
        // later and are aged past the grace window.
        ProductMock::new(product_rel)
            .add_version(complete_version("v1"))
            .with_catalog()
            .add_version(complete_version("v2"))
            .add_version(VersionMock::new(".upload").with_files(&["lxd.tar.xz"]))
            .with_files_age(Duration::from_secs(24 * 60 * 60))
            .create(root);

        prune_dangling_product_versions(root, "v1", "images").unwrap();

        let product_dir = root.join(product_rel);
        assert!(product_dir.join("v1").exists());
        assert!(!product_dir.join("v2").exists());
        assert!(!product_dir.join(".upload").exists());
    }

    #[test]
    fn fresh_dangling_versions_survive_the_grace_window() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let product_rel = "images/ubuntu/noble/amd64/default";
        ProductMock::new(product_rel)
            .add_version(complete_version("v1"))
            .with_catalog()
            .add_version(complete_version("v2"))
            .create(root);

        prune_dangling_product_versions(root, "v1", "images").unwrap();

        // v2 is dangling but fresh, so it stays.
        assert!(root.join(product_rel).join("v2").exists());
    }

    #[test]
    fn unreferenced_products_are_removed_after_the_grace_window() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        ProductMock::new("images/ubuntu/noble/amd64/default")
            .add_version(complete_version("v1"))
            .with_catalog()
            .create(root);
        ProductMock::new("images/alpine/3.19/amd64/default")
            .add_version(complete_version("v1"))
            .with_files_age(Duration::from_secs(24 * 60 * 60))
            .create(root);

        // Age applies to the whole tree, but the ubuntu product is
        // referenced by the catalog and must survive regardless.
        prune_dangling_product_versions(root, "v1", "images").unwrap();

        assert!(!root.join("images/alpine/3.19/amd64/default").exists());
        assert!(root.join("images/ubuntu/noble/amd64/default/v1").exists());
    }

    #[test]
    fn empty_dirs_are_swept_keeping_the_base() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("images/a/b/c")).unwrap();
        fs::create_dir_all(root.join("images/with-file")).unwrap();
        fs::write(root.join("images/with-file/keep.txt"), "x").unwrap();

        prune_empty_dirs(root, true).unwrap();

        assert!(!root.join("images/a").exists());
        assert!(root.join("images/with-file/keep.txt").exists());
        assert!(root.exists());
    }

    #[test]
    fn retention_prune_end_to_end() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        ProductMock::new("images/ubuntu/noble/amd64/default")
            .add_version(complete_version("2024_01_01"))
            .add_version(complete_version("2024_01_05"))
            .add_version(complete_version("2024_05_01"))
            .add_version(complete_version("2025_01_01"))
            .with_catalog()
            .create(root);

        let opts = PruneOptions {
            stream_version: "v1".to_string(),
            image_dirs: vec!["images".to_string()],
            retain: 3,
            dangling: false,
        };
        prune(root, &opts).unwrap();

        let catalog = read_catalog(root);
        assert_eq!(
            catalog.products["ubuntu:noble:amd64:default"]
                .versions
                .len(),
            3
        );
        assert!(!root
            .join("images/ubuntu/noble/amd64/default/2024_01_01")
            .exists());
    }
}
