//! Stream index (`index:1.0`).
//!
//! The index is the entry point clients fetch first: it lists every
//! published product catalog with its path relative to the repository root
//! and the sorted product IDs it contains.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::stream::ProductCatalog;

/// A single catalog reference within the index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamIndexEntry {
    pub datatype: String,

    /// Catalog path relative to the repository root, with `/` separators.
    pub path: String,

    pub format: String,

    /// RFC 3339 timestamp of the last index update.
    pub updated: String,

    /// Sorted product IDs available in the catalog.
    pub products: Vec<String>,
}

/// Index of all published product catalogs (`index:1.0`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamIndex {
    pub format: String,
    pub index: BTreeMap<String, StreamIndexEntry>,
}

impl Default for StreamIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamIndex {
    pub fn new() -> Self {
        Self {
            format: "index:1.0".to_string(),
            index: BTreeMap::new(),
        }
    }

    /// Add (or replace) the entry for a stream's catalog.
    pub fn add_entry(&mut self, stream_name: &str, catalog_rel_path: &str, catalog: &ProductCatalog) {
        // BTreeMap keys are already sorted.
        let products: Vec<String> = catalog.products.keys().cloned().collect();

        let updated = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();

        self.index.insert(
            stream_name.to_string(),
            StreamIndexEntry {
                datatype: catalog.datatype.clone(),
                path: catalog_rel_path.to_string(),
                format: "products:1.0".to_string(),
                updated,
                products,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::Product;

    #[test]
    fn entry_lists_sorted_product_ids() {
        let mut products = BTreeMap::new();
        for id in ["ubuntu:noble:amd64:default", "alpine:3.19:amd64:default"] {
            products.insert(id.to_string(), Product::default());
        }
        let catalog = ProductCatalog::new("images", products);

        let mut index = StreamIndex::new();
        index.add_entry("images", "streams/v1/images.json", &catalog);

        let entry = index.index.get("images").unwrap();
        assert_eq!(entry.datatype, "image-downloads");
        assert_eq!(entry.format, "products:1.0");
        assert_eq!(entry.path, "streams/v1/images.json");
        assert_eq!(
            entry.products,
            vec![
                "alpine:3.19:amd64:default".to_string(),
                "ubuntu:noble:amd64:default".to_string(),
            ]
        );
        // RFC 3339 timestamps contain a date/time separator.
        assert!(entry.updated.contains('T'));
    }

    #[test]
    fn serialized_format_is_index_1_0() {
        let index = StreamIndex::new();
        let json = serde_json::to_value(&index).unwrap();
        assert_eq!(json["format"], "index:1.0");
        assert!(json["index"].as_object().unwrap().is_empty());
    }
}
