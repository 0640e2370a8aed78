use std::path::PathBuf;

use thiserror::Error;

use crate::settings::PictureMode;
use crate::tasks::display::PanelCommand;

/// A settings candidate that exists but could not be used.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings at {}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed settings JSON at {}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("settings at {} must be a JSON object", .path.display())]
    NotAnObject { path: PathBuf },
}

#[derive(Debug, Error)]
pub enum CatalogError {
    /// The walk finished but nothing survived mode and format filtering.
    #[error("no eligible images under {} for picture mode {mode}", .root.display())]
    Empty { root: PathBuf, mode: PictureMode },
}

/// Produced by the decoder collaborator.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("source image {} is unreadable", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("decoder rejected {}", .path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: DecodeError,
    },

    #[error("failed to persist rendering at {}", .path.display())]
    Cache {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

#[derive(Debug, Error)]
pub enum DisplayError {
    /// The panel collaborator reported a failed transfer.
    #[error("panel {command} failed: {reason:#}")]
    Transfer {
        command: PanelCommand,
        reason: anyhow::Error,
    },
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no storage volume mounted under {}", .0.display())]
    Unavailable(PathBuf),
}

/// Failure of a single present request; the scheduler treats the two causes
/// differently.
#[derive(Debug, Error)]
pub enum PresentError {
    #[error(transparent)]
    Conversion(#[from] ConversionError),

    #[error(transparent)]
    Display(#[from] DisplayError),
}
