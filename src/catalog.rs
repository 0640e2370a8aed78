//! Image catalog: walks the mounted volume and filters by picture mode.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};
use tracing::{debug, instrument};
use walkdir::{DirEntry, WalkDir};

use crate::error::CatalogError;
use crate::settings::{PictureMode, Settings};

/// Lowercase extensions accepted by the panel pipeline.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "tif", "tiff", "bmp"];

/// Stable identity of a source image: digest of canonical path, mtime and size.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(String);

impl EntryId {
    pub fn for_source(canonical: &Path, modified: SystemTime, len: u64) -> Self {
        let since_epoch = modified.duration_since(UNIX_EPOCH).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_os_str().as_encoded_bytes());
        hasher.update(since_epoch.as_secs().to_le_bytes());
        hasher.update(since_epoch.subsec_nanos().to_le_bytes());
        hasher.update(len.to_le_bytes());
        let digest = hasher.finalize();
        Self(digest[..16].iter().map(|b| format!("{b:02x}")).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntryId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub path: PathBuf,
    pub id: EntryId,
}

impl CatalogEntry {
    /// Read the identity of `path` from its metadata.
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let meta = fs::metadata(path)?;
        let canonical = fs::canonicalize(path)?;
        let modified = meta.modified().unwrap_or(UNIX_EPOCH);
        Ok(Self {
            path: path.to_path_buf(),
            id: EntryId::for_source(&canonical, modified, meta.len()),
        })
    }
}

/// Eligible images under the active picture mode, ordered by path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
}

impl Catalog {
    /// Sort by path and drop later duplicates of an identity.
    pub fn from_entries(mut entries: Vec<CatalogEntry>) -> Self {
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        let mut seen = HashSet::new();
        entries.retain(|e| seen.insert(e.id.clone()));
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, CatalogEntry> {
        self.entries.iter()
    }

    pub fn get(&self, id: &EntryId) -> Option<&CatalogEntry> {
        self.entries.iter().find(|e| &e.id == id)
    }

    pub fn contains(&self, id: &EntryId) -> bool {
        self.get(id).is_some()
    }
}

impl<'a> IntoIterator for &'a Catalog {
    type Item = &'a CatalogEntry;
    type IntoIter = std::slice::Iter<'a, CatalogEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Return `true` if `path` has a whitelisted image extension.
#[must_use]
pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .is_some_and(|ext| {
            let ext = ext.to_ascii_lowercase();
            SUPPORTED_EXTENSIONS.contains(&ext.as_str())
        })
}

/// Enumerate the eligible images under `root` for the current settings.
///
/// # Errors
/// Returns [`CatalogError::Empty`] when nothing survives filtering, including
/// when the online folder does not exist.
#[instrument(skip(settings), fields(root = %root.display(), mode = %settings.picture_mode))]
pub fn rebuild(root: &Path, settings: &Settings) -> Result<Catalog, CatalogError> {
    let online_root = root.join(&settings.s3_folder);
    let (walk_root, excluded) = match settings.picture_mode {
        PictureMode::Both => (root.to_path_buf(), None),
        PictureMode::Local => (root.to_path_buf(), Some(online_root.as_path())),
        PictureMode::Online => (online_root.clone(), None),
    };

    let mut entries = Vec::new();
    for entry in WalkDir::new(&walk_root)
        .follow_links(true)
        .into_iter()
        .filter_entry(|e| !is_hidden_below_root(e) && excluded.is_none_or(|ex| e.path() != ex))
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                debug!(error = %err, "walk: skipping unreadable entry");
                continue;
            }
        };
        let path = entry.path();
        if !entry.file_type().is_file() || !is_supported_image(path) {
            continue;
        }
        match CatalogEntry::from_path(path) {
            Ok(catalog_entry) => entries.push(catalog_entry),
            Err(err) => debug!(path = %path.display(), error = %err, "walk: metadata unavailable"),
        }
    }

    let catalog = Catalog::from_entries(entries);
    if catalog.is_empty() {
        return Err(CatalogError::Empty {
            root: walk_root,
            mode: settings.picture_mode,
        });
    }
    debug!(entries = catalog.len(), "catalog rebuilt");
    Ok(catalog)
}

fn is_hidden_below_root(entry: &DirEntry) -> bool {
    // The root itself may be a dot-dir (tempdirs, odd volume labels).
    if entry.depth() == 0 {
        return false;
    }
    entry
        .file_name()
        .to_str()
        .is_some_and(|n| n.starts_with('.'))
}
