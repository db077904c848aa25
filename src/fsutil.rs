//! JSON file helpers and the atomic publishing protocol.
//!
//! Catalog and index files are never written in place. Each artifact goes to
//! a dot-prefixed `.name.tmp` sibling together with a gzipped companion, and
//! only after every artifact is staged are the temp files renamed to their
//! final names, catalogs first and the index last. A reader that follows the
//! index therefore never sees it reference a catalog that does not exist yet.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Read a JSON file into the given type.
///
/// A missing file surfaces as an [`io::Error`] with kind `NotFound` in the
/// error chain, so callers can treat absence as "start empty".
pub fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let value = serde_json::from_reader(io::BufReader::new(file))
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(value)
}

/// Returns true when the error chain bottoms out in a `NotFound` I/O error.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.downcast_ref::<io::Error>()
        .map(|e| e.kind() == io::ErrorKind::NotFound)
        .unwrap_or(false)
}

/// Write a value as compact JSON (with a trailing newline) to the given path.
pub fn write_json_file<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut bytes = serde_json::to_vec(value).context("Failed to encode JSON")?;
    bytes.push(b'\n');
    fs::write(path, bytes).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Compress the source file to the destination path at best compression.
pub fn gzip_file(src: &Path, dst: &Path) -> Result<()> {
    let mut reader =
        File::open(src).with_context(|| format!("Failed to open {}", src.display()))?;
    let writer =
        File::create(dst).with_context(|| format!("Failed to create {}", dst.display()))?;

    let mut encoder = GzEncoder::new(writer, Compression::best());
    io::copy(&mut reader, &mut encoder)
        .with_context(|| format!("Failed to compress {}", src.display()))?;
    encoder
        .finish()
        .with_context(|| format!("Failed to finish {}", dst.display()))?;
    Ok(())
}

/// Append content to an existing file. Empty content is a no-op.
pub fn append_to_file(path: &Path, content: &str) -> Result<()> {
    if content.is_empty() {
        return Ok(());
    }

    let mut file = OpenOptions::new()
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    file.write_all(content.as_bytes())
        .with_context(|| format!("Failed to append to {}", path.display()))?;
    Ok(())
}

/// Sibling path with `.gz` appended (`images.json` -> `images.json.gz`).
pub fn gz_path(path: &Path) -> PathBuf {
    PathBuf::from(format!("{}.gz", path.display()))
}

/// Hidden temp sibling of the given path (`images.json` -> `.images.json.tmp`).
/// The temp file lives next to the final file so the rename stays on one
/// filesystem, and the dot prefix keeps it out of published names.
pub fn hidden_temp_path(path: &Path) -> Result<PathBuf> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("Invalid file name in {}", path.display()))?;
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    Ok(parent.join(format!(".{name}.tmp")))
}

struct Replace {
    old: PathBuf,
    new: PathBuf,
}

/// Staged multi-file publish.
///
/// [`Publisher::stage_json`] writes each artifact and its gzipped companion
/// to temp siblings; [`Publisher::commit`] renames everything into place in
/// staging order and sets mode 0644. Temp files that were staged but not
/// renamed are removed when the publisher is dropped, so a failed run leaves
/// nothing behind that a later run cannot overwrite.
#[derive(Default)]
pub struct Publisher {
    replaces: Vec<Replace>,
    temps: Vec<PathBuf>,
}

impl Publisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a JSON artifact and its `.gz` companion for `final_path`.
    pub fn stage_json<T: Serialize>(&mut self, final_path: &Path, value: &T) -> Result<()> {
        let temp_path = hidden_temp_path(final_path)?;
        write_json_file(&temp_path, value)?;
        self.temps.push(temp_path.clone());

        let temp_gz_path = gz_path(&temp_path);
        gzip_file(&temp_path, &temp_gz_path)?;
        self.temps.push(temp_gz_path.clone());

        self.replaces.push(Replace {
            old: temp_path,
            new: final_path.to_path_buf(),
        });
        self.replaces.push(Replace {
            old: temp_gz_path,
            new: gz_path(final_path),
        });
        Ok(())
    }

    /// Rename all staged artifacts to their final names, in staging order.
    pub fn commit(mut self) -> Result<()> {
        if self.replaces.is_empty() {
            bail!("Nothing staged for publishing");
        }

        for replace in &self.replaces {
            fs::rename(&replace.old, &replace.new).with_context(|| {
                format!(
                    "Failed to rename {} to {}",
                    replace.old.display(),
                    replace.new.display()
                )
            })?;
            set_published_mode(&replace.new)?;
        }

        // All temps are renamed away; nothing left for Drop to clean up.
        self.temps.clear();
        Ok(())
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        for temp in &self.temps {
            let _ = fs::remove_file(temp);
        }
    }
}

/// Set read permissions (0644) on a published file.
pub fn set_published_mode(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o644))
            .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    }
    Ok(())
}
