//! Maintainer for a static simple-streams image repository.
//!
//! A simple-streams repository is an HTTP-servable directory tree of
//! operating-system images (container root filesystems and VM disk images)
//! plus a machine-readable JSON catalog. Image consumers fetch
//! `streams/v1/index.json`, resolve a product catalog, and download the
//! referenced artifacts. This crate is the pipeline that keeps that tree
//! and its catalogs consistent:
//!
//! - **Scanner** - walks a stream subtree and turns directories into
//!   products, versions, and items ([`stream`])
//! - **Build** - incrementally rebuilds the product catalog, verifies
//!   checksums, generates binary deltas, and publishes atomically
//!   ([`build`])
//! - **Prune** - applies version retention and removes dangling
//!   directories ([`prune`])
//!
//! # Architecture
//!
//! ```text
//! scanner (stream) ──> diff against published catalog
//!        │                        │
//!        │                 new versions ──> worker pool: hash + verify
//!        │                        │
//!        │                 join barrier ──> worker pool: vcdiff deltas
//!        │                        │
//!        └──────────> catalog + index ──> temp files ──> atomic rename
//! ```
//!
//! The binary in `src/bin/` is a thin CLI shell; all behavior lives here.

pub mod build;
pub mod cancel;
pub mod delta;
pub mod fsutil;
pub mod hash;
pub mod prune;
pub mod stream;
pub mod workers;

#[cfg(test)]
pub mod testutils;
