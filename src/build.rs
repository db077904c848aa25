//! Build orchestrator: incremental catalog rebuild and delta generation.
//!
//! The pipeline has two phases separated by a join barrier. Phase one
//! rescans the tree, diffs it against the published catalog and hashes only
//! the versions that are new, verifying them against their `SHA256SUMS`.
//! Phase two walks the now-complete catalog and generates the missing
//! `.vcdiff` deltas between successive versions. Only after both phases
//! join are the catalogs and the index published, catalogs first so the
//! index never references a file that is not in place.
//!
//! Per-version and per-delta failures are logged and skipped; one bad
//! version must not block every good one.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};

use crate::cancel::Cancellation;
use crate::delta;
use crate::fsutil::{self, Publisher};
use crate::stream::index::StreamIndex;
use crate::stream::{
    self, Product, ProductCatalog, ScanOptions, Version, FILE_CHECKSUM_SHA256,
    ITEM_TYPE_DISK_KVM, ITEM_TYPE_DISK_KVM_DELTA, ITEM_TYPE_SQUASHFS, ITEM_TYPE_SQUASHFS_DELTA,
};
use crate::workers::WorkerPool;

/// Options for the build command.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Stream format version directory under `streams/` (e.g. `v1`).
    pub stream_version: String,

    /// Stream names (image directories) relative to the repository root.
    pub image_dirs: Vec<String>,

    /// Maximum number of concurrent hash/delta operations.
    pub workers: usize,
}

/// Rebuild the product catalogs for all configured streams and publish
/// them together with the stream index.
pub fn build_index(cancel: &Cancellation, root_dir: &Path, opts: &BuildOptions) -> Result<()> {
    let meta_dir = root_dir.join("streams").join(&opts.stream_version);
    fs::create_dir_all(&meta_dir)
        .with_context(|| format!("Failed to create metadata directory {}", meta_dir.display()))?;

    let mut index = StreamIndex::new();
    let mut publisher = Publisher::new();

    for stream_name in &opts.image_dirs {
        let catalog =
            build_product_catalog(cancel, root_dir, &opts.stream_version, stream_name, opts.workers)?;

        // Stage the catalog and its gzipped companion next to the final
        // file; nothing is visible to clients until the renames below.
        let catalog_file_path = meta_dir.join(format!("{stream_name}.json"));
        publisher
            .stage_json(&catalog_file_path, &catalog)
            .with_context(|| format!("Failed to write product catalog for {stream_name}"))?;

        let catalog_rel_path =
            format!("streams/{}/{}.json", opts.stream_version, stream_name);
        index.add_entry(stream_name, &catalog_rel_path, &catalog);
    }

    if cancel.is_cancelled() {
        bail!("Build interrupted");
    }

    // The index is staged last, so its rename comes after every catalog
    // is already in place.
    publisher
        .stage_json(&meta_dir.join("index.json"), &index)
        .context("Failed to write index file")?;

    publisher.commit()
}

/// Build one stream's product catalog.
///
/// Loads the published catalog (or starts empty), incorporates new
/// versions found on disk, then ensures delta files exist for successive
/// version pairs. Worker jobs mutate the catalog under a single mutex.
fn build_product_catalog(
    cancel: &Cancellation,
    root_dir: &Path,
    stream_version: &str,
    stream_name: &str,
    workers: usize,
) -> Result<ProductCatalog> {
    let catalog_file_path = stream::catalog_path(root_dir, stream_version, stream_name);
    let catalog = match fsutil::read_json_file::<ProductCatalog>(&catalog_file_path) {
        Ok(catalog) => catalog,
        Err(err) if fsutil::is_not_found(&err) => {
            ProductCatalog::new(stream_name, BTreeMap::new())
        }
        Err(err) => return Err(err),
    };

    // Rescan the directory hierarchy without hashing; hashes are computed
    // only for versions the catalog has not seen yet.
    let scanned = stream::get_products(root_dir, Path::new(stream_name), ScanOptions::default())?;
    let (_vanished, added) = diff_products(&catalog.products, &scanned);

    let root_dir = Arc::new(root_dir.to_path_buf());
    let stream_name = Arc::new(stream_name.to_string());
    let catalog = Arc::new(Mutex::new(catalog));
    let pool = WorkerPool::new(workers, cancel.clone());

    for (id, product) in added {
        let product_rel_path = Path::new(stream_name.as_str()).join(product.rel_path());

        {
            // Replace the product record with the freshly scanned one so
            // new metadata (aliases, requirements, OS name) wins, but
            // retain the already-hashed versions.
            let mut catalog = catalog.lock().unwrap();
            let mut entry = product.clone();
            entry.versions = match catalog.products.get(&id) {
                Some(existing) if !existing.versions.is_empty() => existing.versions.clone(),
                _ => BTreeMap::new(),
            };
            catalog.products.insert(id.clone(), entry);
        }

        for version_name in product.versions.keys() {
            let root_dir = Arc::clone(&root_dir);
            let stream_name = Arc::clone(&stream_name);
            let catalog = Arc::clone(&catalog);
            let id = id.clone();
            let version_name = version_name.clone();
            let version_rel_path = product_rel_path.join(&version_name);

            pool.submit(move || {
                ingest_new_version(
                    &root_dir,
                    &stream_name,
                    &id,
                    &version_name,
                    &version_rel_path,
                    &catalog,
                );
            });
        }
    }

    // All new versions must be in the catalog before delta generation can
    // decide which version pairs are valid.
    pool.wait();

    let products_snapshot = catalog.lock().unwrap().products.clone();

    for (id, product) in products_snapshot {
        let product_rel_path = Path::new(stream_name.as_str()).join(product.rel_path());

        // BTreeMap keys iterate in ascending lexicographic order.
        let version_names: Vec<String> = product.versions.keys().cloned().collect();
        if version_names.len() < 2 {
            // At least 2 versions must be available for a delta; the
            // oldest one has nothing to diff against.
            continue;
        }

        for i in 1..version_names.len() {
            let source_name = &version_names[i - 1];
            let target_name = &version_names[i];
            let target_version = &product.versions[target_name];

            for (item_name, item) in &target_version.items {
                if item.ftype != ITEM_TYPE_DISK_KVM && item.ftype != ITEM_TYPE_SQUASHFS {
                    // Deltas are generated only for rootfs images.
                    continue;
                }

                let cancel = cancel.clone();
                let root_dir = Arc::clone(&root_dir);
                let catalog = Arc::clone(&catalog);
                let id = id.clone();
                let product_rel_path = product_rel_path.clone();
                let source_name = source_name.clone();
                let target_name = target_name.clone();
                let target_version = target_version.clone();
                let item_name = item_name.clone();
                let item_ftype = item.ftype.clone();

                pool.submit(move || {
                    ensure_version_delta(
                        &cancel,
                        &root_dir,
                        &id,
                        &product_rel_path,
                        &source_name,
                        &target_name,
                        &target_version,
                        &item_name,
                        &item_ftype,
                        &catalog,
                    );
                });
            }
        }
    }

    pool.wait();
    drop(pool);

    if cancel.is_cancelled() {
        bail!("Build interrupted");
    }

    let catalog = Arc::try_unwrap(catalog)
        .map_err(|_| anyhow::anyhow!("Catalog still shared after worker pool shutdown"))?
        .into_inner()
        .unwrap();
    Ok(catalog)
}

/// Phase-one job: hash a newly observed version, verify it against its
/// checksum manifest and insert it into the catalog.
fn ingest_new_version(
    root_dir: &Path,
    stream_name: &str,
    product_id: &str,
    version_name: &str,
    version_rel_path: &Path,
    catalog: &Mutex<ProductCatalog>,
) {
    let version = match stream::get_version(
        root_dir,
        version_rel_path,
        ScanOptions::default().calc_hashes(true),
    ) {
        Ok(version) => version,
        Err(err) => {
            tracing::error!(
                stream = stream_name,
                product = product_id,
                version = version_name,
                error = %err,
                "Failed to get version"
            );
            return;
        }
    };

    if !version.checksums.is_empty() {
        for (item_name, item) in &version.items {
            let checksum = match version.checksums.get(item_name) {
                Some(checksum) => checksum.as_str(),
                None => {
                    // Delta files are hashed and appended to the checksum
                    // file by this same pipeline after the manifest was
                    // first written, so a missing entry is expected.
                    if item.ftype == ITEM_TYPE_DISK_KVM_DELTA
                        || item.ftype == ITEM_TYPE_SQUASHFS_DELTA
                    {
                        continue;
                    }

                    ""
                }
            };

            if checksum != item.sha256 {
                tracing::error!(
                    stream = stream_name,
                    product = product_id,
                    version = version_name,
                    item = item_name,
                    "Checksum mismatch"
                );
                return;
            }
        }
    }

    let mut catalog = catalog.lock().unwrap();
    if let Some(product) = catalog.products.get_mut(product_id) {
        product
            .versions
            .insert(version_name.to_string(), version);
    }
    drop(catalog);

    tracing::info!(
        stream = stream_name,
        product = product_id,
        version = version_name,
        "New version added to the product catalog"
    );
}

/// Phase-two job: make sure the delta from `source_name` to `target_name`
/// exists for one rootfs item and is recorded in the catalog (and the
/// version's checksum manifest).
#[allow(clippy::too_many_arguments)]
fn ensure_version_delta(
    cancel: &Cancellation,
    root_dir: &Path,
    product_id: &str,
    product_rel_path: &Path,
    source_name: &str,
    target_name: &str,
    target_version: &Version,
    item_name: &str,
    item_ftype: &str,
    catalog: &Mutex<ProductCatalog>,
) {
    // Delta file name: item name with its final extension swapped for
    // `<sourceVersion>.<suffix>`.
    let prefix = item_name
        .rsplit_once('.')
        .map(|(prefix, _)| prefix)
        .unwrap_or(item_name);
    let suffix = if item_ftype == ITEM_TYPE_DISK_KVM {
        "qcow2.vcdiff"
    } else {
        "vcdiff"
    };
    let delta_name = format!("{prefix}.{source_name}.{suffix}");

    let existing_delta = target_version.items.get(&delta_name);

    if existing_delta.is_none() {
        let source_path = root_dir
            .join(product_rel_path)
            .join(source_name)
            .join(item_name);
        let target_path = root_dir
            .join(product_rel_path)
            .join(target_name)
            .join(item_name);
        let output_path = root_dir
            .join(product_rel_path)
            .join(target_name)
            .join(&delta_name);

        match fs::metadata(&source_path) {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                // The source version never had this rootfs; nothing to
                // diff against.
                return;
            }
            Err(err) => {
                tracing::error!(
                    product = product_id,
                    version = target_name,
                    item = item_name,
                    delta_base = source_name,
                    error = %err,
                    "Failed to read base delta file"
                );
                return;
            }
        }

        if let Err(err) = delta::generate_delta(cancel, &source_path, &target_path, &output_path) {
            tracing::error!(
                product = product_id,
                version = target_name,
                item = delta_name,
                delta_base = source_name,
                error = %err,
                "Failed creating delta file"
            );
            return;
        }

        tracing::info!(
            product = product_id,
            version = target_name,
            item = delta_name,
            delta_base = source_name,
            "Delta generated successfully"
        );
    }

    // Hash the delta when it was just generated, or when the catalog entry
    // predates hash calculation.
    let needs_hash = existing_delta.map(|item| item.sha256.is_empty()).unwrap_or(true);
    if !needs_hash {
        return;
    }

    let delta_rel_path = product_rel_path.join(target_name).join(&delta_name);
    let delta_item = match stream::get_item(
        root_dir,
        &delta_rel_path,
        ScanOptions::default().calc_hashes(true),
    ) {
        Ok(item) => item,
        Err(err) => {
            tracing::error!(
                product = product_id,
                version = target_name,
                item = delta_name,
                error = %err,
                "Failed to get delta item"
            );
            return;
        }
    };

    // Append the delta hash to the version's checksum manifest, when one
    // exists and does not already list the delta.
    if !target_version.checksums.is_empty() && !target_version.checksums.contains_key(&delta_name)
    {
        let checksum_file_path = root_dir
            .join(product_rel_path)
            .join(target_name)
            .join(FILE_CHECKSUM_SHA256);
        let line = format!("{}  {}\n", delta_item.sha256, delta_name);

        if let Err(err) = fsutil::append_to_file(&checksum_file_path, &line) {
            tracing::error!(
                product = product_id,
                version = target_name,
                error = %err,
                "Failed to update checksums file"
            );
            return;
        }

        let mut catalog = catalog.lock().unwrap();
        if let Some(version) = catalog
            .products
            .get_mut(product_id)
            .and_then(|product| product.versions.get_mut(target_name))
        {
            version
                .checksums
                .insert(delta_name.clone(), delta_item.sha256.clone());
        }
    }

    let mut catalog = catalog.lock().unwrap();
    if let Some(version) = catalog
        .products
        .get_mut(product_id)
        .and_then(|product| product.versions.get_mut(target_name))
    {
        version.items.insert(delta_name, delta_item);
    }
}

/// Compare two product maps. Returns `(only_in_old, only_in_new)`, where a
/// product counts as "new" when its ID is unseen or when at least one of
/// its versions is; in the latter case only the new versions are carried
/// and the product metadata comes from the new map.
pub fn diff_products(
    old_products: &BTreeMap<String, Product>,
    new_products: &BTreeMap<String, Product>,
) -> (BTreeMap<String, Product>, BTreeMap<String, Product>) {
    fn find_missing(
        reference: &BTreeMap<String, Product>,
        candidates: &BTreeMap<String, Product>,
    ) -> BTreeMap<String, Product> {
        let mut missing = BTreeMap::new();

        for (id, product) in candidates {
            let Some(known) = reference.get(id) else {
                missing.insert(id.clone(), product.clone());
                continue;
            };

            let new_versions: BTreeMap<String, Version> = product
                .versions
                .iter()
                .filter(|(name, _)| !known.versions.contains_key(*name))
                .map(|(name, version)| (name.clone(), version.clone()))
                .collect();

            if !new_versions.is_empty() {
                let mut product = product.clone();
                product.versions = new_versions;
                missing.insert(id.clone(), product);
            }
        }

        missing
    }

    (
        find_missing(new_products, old_products),
        find_missing(old_products, new_products),
    )
}
