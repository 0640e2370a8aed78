//! Removable storage discovery and the SD-card interval override.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::StorageError;

pub const REFRESH_OVERRIDE_FILE: &str = "refresh_time.txt";

/// Longest interval the override file may request.
pub const MAX_REFRESH_OVERRIDE: Duration = Duration::from_secs(24 * 60 * 60);

/// Default mount base used by desktop automounters: `/media/<user>`.
pub fn default_mount_base() -> PathBuf {
    let user = std::env::var("SUDO_USER")
        .ok()
        .filter(|u| !u.is_empty())
        .or_else(|| std::env::var("USER").ok().filter(|u| !u.is_empty()));
    match user {
        Some(user) => Path::new("/media").join(user),
        None => PathBuf::from("/media"),
    }
}

/// Return the first accessible volume directory under `mount_base`.
///
/// Directories are considered in name order so the choice is stable when
/// several cards are present. Entries that cannot be listed are stale mount
/// points left behind by a yanked card and are skipped.
pub fn find_volume(mount_base: &Path) -> Result<PathBuf, StorageError> {
    let unavailable = || StorageError::Unavailable(mount_base.to_path_buf());
    let entries = fs::read_dir(mount_base).map_err(|err| {
        debug!(base = %mount_base.display(), error = %err, "mount base unreadable");
        unavailable()
    })?;

    let mut dirs: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();

    for dir in dirs {
        match fs::read_dir(&dir) {
            Ok(_) => return Ok(dir),
            Err(err) => {
                warn!(path = %dir.display(), error = %err, "skipping stale or inaccessible mount");
            }
        }
    }
    Err(unavailable())
}

/// Interval from `refresh_time.txt` at the volume root, in seconds.
pub fn read_refresh_override(root: &Path) -> Option<Duration> {
    let path = root.join(REFRESH_OVERRIDE_FILE);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no refresh override on volume");
            return None;
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to read refresh override");
            return None;
        }
    };
    let trimmed = raw.trim();
    let seconds = trimmed
        .chars()
        .all(|c| c.is_ascii_digit())
        .then(|| trimmed.parse::<u64>().ok())
        .flatten()
        .filter(|s| *s > 0);
    let Some(seconds) = seconds else {
        warn!(path = %path.display(), contents = trimmed, "refresh override is not a positive integer");
        return None;
    };
    let requested = Duration::from_secs(seconds);
    if requested > MAX_REFRESH_OVERRIDE {
        warn!(
            path = %path.display(),
            seconds,
            "refresh override exceeds one day; clamping"
        );
        return Some(MAX_REFRESH_OVERRIDE);
    }
    Some(requested)
}
