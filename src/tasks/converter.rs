use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use image::{ImageFormat, RgbImage};
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, CatalogEntry, EntryId};
use crate::error::{ConversionError, DecodeError};

const CACHE_EXTENSION: &str = "png";

/// Target geometry of the e-paper panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PanelSpec {
    pub width: u32,
    pub height: u32,
}

impl Default for PanelSpec {
    fn default() -> Self {
        Self {
            width: 800,
            height: 480,
        }
    }
}

/// Panel-ready bitmap: RGB8, every pixel already snapped to the panel palette.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendering {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl Rendering {
    /// Plain white frame, used when the boot asset is unavailable.
    pub fn blank(panel: PanelSpec) -> Self {
        let frame = RgbImage::from_pixel(panel.width, panel.height, image::Rgb([255, 255, 255]));
        Self::from_image(frame)
    }

    pub fn from_image(image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            width,
            height,
            pixels: image.into_raw(),
        }
    }

    pub fn to_image(&self) -> Option<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.pixels.clone())
    }

    pub fn matches(&self, panel: PanelSpec) -> bool {
        self.width == panel.width && self.height == panel.height
    }
}

/// The decode/resize/dither collaborator.
pub trait Decoder {
    fn decode(&self, source: &Path, panel: PanelSpec) -> Result<Rendering, DecodeError>;
}

/// Persistent store of panel-ready renderings keyed by source identity.
#[derive(Debug)]
pub struct ConversionCache<D> {
    dir: PathBuf,
    panel: PanelSpec,
    decoder: D,
}

impl<D: Decoder> ConversionCache<D> {
    pub fn open(dir: impl Into<PathBuf>, panel: PanelSpec, decoder: D) -> anyhow::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create conversion cache at {}", dir.display()))?;
        Ok(Self { dir, panel, decoder })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn decoder(&self) -> &D {
        &self.decoder
    }

    pub fn path_for(&self, id: &EntryId) -> PathBuf {
        self.dir.join(format!("{id}.{CACHE_EXTENSION}"))
    }

    /// Return the cached rendering for `entry`, converting it first if needed.
    ///
    /// The decoder is only invoked when no valid cache file exists. A failed
    /// conversion leaves the cache untouched.
    pub fn ensure(&self, entry: &CatalogEntry) -> Result<Rendering, ConversionError> {
        let cached = self.path_for(&entry.id);
        if let Some(rendering) = self.load_cached(&cached) {
            debug!(path = %entry.path.display(), cache = %cached.display(), "conversion cache hit");
            return Ok(rendering);
        }

        if let Err(source) = fs::metadata(&entry.path) {
            return Err(ConversionError::Read {
                path: entry.path.clone(),
                source,
            });
        }

        let rendering = self
            .decoder
            .decode(&entry.path, self.panel)
            .map_err(|source| ConversionError::Decode {
                path: entry.path.clone(),
                source,
            })?;
        self.persist(&cached, &rendering)?;
        info!(path = %entry.path.display(), cache = %cached.display(), "converted image");
        Ok(rendering)
    }

    fn load_cached(&self, path: &Path) -> Option<Rendering> {
        if !path.exists() {
            return None;
        }
        match image::open(path) {
            Ok(img) => {
                let rendering = Rendering::from_image(img.to_rgb8());
                if rendering.matches(self.panel) {
                    Some(rendering)
                } else {
                    debug!(path = %path.display(), "cached rendering has stale geometry; rebuilding");
                    None
                }
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "unreadable cache file; rebuilding");
                None
            }
        }
    }

    fn persist(&self, path: &Path, rendering: &Rendering) -> Result<(), ConversionError> {
        let cache_err = |source: image::ImageError| ConversionError::Cache {
            path: path.to_path_buf(),
            source,
        };
        let frame = rendering.to_image().ok_or_else(|| {
            cache_err(image::ImageError::Parameter(
                image::error::ParameterError::from_kind(
                    image::error::ParameterErrorKind::DimensionMismatch,
                ),
            ))
        })?;
        let tmp = path.with_extension("png.tmp");
        frame
            .save_with_format(&tmp, ImageFormat::Png)
            .map_err(cache_err)?;
        fs::rename(&tmp, path).map_err(|err| {
            let _ = fs::remove_file(&tmp);
            cache_err(image::ImageError::IoError(err))
        })
    }

    /// Delete renderings whose identity is no longer in `catalog`.
    pub fn prune(&self, catalog: &Catalog) -> usize {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(dir = %self.dir.display(), error = %err, "cannot list conversion cache");
                return 0;
            }
        };

        let mut removed = 0;
        for path in entries.filter_map(Result::ok).map(|e| e.path()) {
            let is_rendering = path
                .extension()
                .is_some_and(|ext| ext == CACHE_EXTENSION);
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !is_rendering || catalog.contains(&EntryId::from(stem)) {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!(path = %path.display(), "pruned stale rendering");
                    removed += 1;
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!(path = %path.display(), error = %err, "failed to prune rendering"),
            }
        }
        if removed > 0 {
            info!(removed, "pruned conversion cache");
        }
        removed
    }
}
