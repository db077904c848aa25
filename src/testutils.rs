//! Test helpers for building mock repository trees.
//!
//! Mocks are declarative: describe a product with its versions and items,
//! then `create` the directory structure inside a scratch root. Steps are
//! applied in order, so a catalog snapshot or a file-age change can be
//! positioned between versions (e.g. "catalog knows v1, v2 appeared
//! later").

use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use filetime::FileTime;
use walkdir::WalkDir;

use crate::fsutil;
use crate::stream::{self, ProductCatalog, ScanOptions};

/// Default content of mocked item files.
pub const ITEM_DEFAULT_CONTENT: &str = "test-content";

/// SHA-256 of [`ITEM_DEFAULT_CONTENT`].
pub const ITEM_DEFAULT_CONTENT_SHA: &str =
    "0a3666a0710c08aa6d0de92ce72beeb5b93124cce1bf3701c9d6cdeb543cb73e";

/// A single mocked file within a version.
pub struct ItemMock {
    name: String,
    content: String,
}

impl ItemMock {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            content: ITEM_DEFAULT_CONTENT.to_string(),
        }
    }

    pub fn with_content(mut self, content: &str) -> Self {
        self.content = content.to_string();
        self
    }

    pub fn create(&self, version_dir: &Path) {
        fs::create_dir_all(version_dir).unwrap();
        fs::write(version_dir.join(&self.name), &self.content).unwrap();
    }
}

/// A mocked version directory.
pub struct VersionMock {
    name: String,
    items: Vec<ItemMock>,
    checksums: Option<String>,
    image_config: Option<String>,
}

impl VersionMock {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            items: Vec::new(),
            checksums: None,
            image_config: None,
        }
    }

    /// Shorthand for several items with the default content.
    pub fn with_files(mut self, names: &[&str]) -> Self {
        for name in names {
            self.items.push(ItemMock::new(name));
        }
        self
    }

    pub fn add_item(mut self, item: ItemMock) -> Self {
        self.items.push(item);
        self
    }

    /// Checksum file entries, written verbatim one per line.
    pub fn with_checksums(mut self, entries: &[&str]) -> Self {
        self.checksums = Some(entries.join("\n") + "\n");
        self
    }

    /// `image.yaml` content, one line per element.
    pub fn with_image_config(mut self, lines: &[&str]) -> Self {
        self.image_config = Some(lines.join("\n") + "\n");
        self
    }

    pub fn create(&self, product_dir: &Path) {
        let version_dir = product_dir.join(&self.name);
        fs::create_dir_all(&version_dir).unwrap();

        for item in &self.items {
            item.create(&version_dir);
        }

        if let Some(checksums) = &self.checksums {
            fs::write(version_dir.join(stream::FILE_CHECKSUM_SHA256), checksums).unwrap();
        }

        if let Some(config) = &self.image_config {
            fs::write(version_dir.join(stream::FILE_IMAGE_CONFIG), config).unwrap();
        }
    }
}

enum MockStep {
    Version(VersionMock),
    CatalogSnapshot,
    FilesAge(Duration),
}

/// A mocked product directory structure.
pub struct ProductMock {
    rel_path: String,
    steps: Vec<MockStep>,
}

impl ProductMock {
    /// `rel_path` is relative to the repository root and includes the
    /// stream name (`images/ubuntu/noble/amd64/default`).
    pub fn new(rel_path: &str) -> Self {
        Self {
            rel_path: rel_path.to_string(),
            steps: Vec::new(),
        }
    }

    pub fn add_version(mut self, version: VersionMock) -> Self {
        self.steps.push(MockStep::Version(version));
        self
    }

    /// Snapshot the product catalog from the tree as built so far
    /// (no hashes, no deltas), mimicking an earlier maintainer run.
    pub fn with_catalog(mut self) -> Self {
        self.steps.push(MockStep::CatalogSnapshot);
        self
    }

    /// Set the modification time of everything created so far to
    /// `age` in the past.
    pub fn with_files_age(mut self, age: Duration) -> Self {
        self.steps.push(MockStep::FilesAge(age));
        self
    }

    pub fn stream_name(&self) -> &str {
        self.rel_path.split('/').next().unwrap_or_default()
    }

    pub fn create(&self, root_dir: &Path) {
        let product_dir = root_dir.join(&self.rel_path);
        fs::create_dir_all(&product_dir).unwrap();

        for step in &self.steps {
            match step {
                MockStep::Version(version) => version.create(&product_dir),
                MockStep::CatalogSnapshot => {
                    mock_product_catalog(root_dir, self.stream_name())
                }
                MockStep::FilesAge(age) => set_files_age(root_dir, *age),
            }
        }
    }
}

/// Write a product catalog built from the current directory structure.
/// No hashes are calculated and no delta files are generated.
pub fn mock_product_catalog(root_dir: &Path, stream_name: &str) {
    let products =
        stream::get_products(root_dir, Path::new(stream_name), ScanOptions::default()).unwrap();
    let catalog = ProductCatalog::new(stream_name, products);

    let catalog_path = stream::catalog_path(root_dir, "v1", stream_name);
    fs::create_dir_all(catalog_path.parent().unwrap()).unwrap();
    fsutil::write_json_file(&catalog_path, &catalog).unwrap();
}

/// Recursively set the modification time of everything under `path` to
/// `age` in the past. Useful for dangling-prune tests.
pub fn set_files_age(path: &Path, age: Duration) {
    let mtime = FileTime::from_system_time(SystemTime::now() - age);

    for entry in WalkDir::new(path).into_iter().filter_map(Result::ok) {
        filetime::set_file_mtime(entry.path(), mtime).unwrap();
    }
}
