//! User settings: candidate discovery, lenient parsing and interval resolution.

use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use chrono::NaiveTime;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::SettingsError;
use crate::storage;

pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const SYSTEM_SETTINGS_PATH: &str = "/etc/epaper_frame/settings.json";
pub const DEFAULT_S3_FOLDER: &str = "s3_folder";
pub const DEFAULT_CHANGE_INTERVAL_MINUTES: u32 = 15;
/// Used when neither the settings nor the override file yield an interval.
pub const FALLBACK_INTERVAL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PictureMode {
    Local,
    Online,
    #[default]
    Both,
}

impl PictureMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Online => "online",
            Self::Both => "both",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "local" => Some(Self::Local),
            "online" => Some(Self::Online),
            "both" => Some(Self::Both),
            _ => None,
        }
    }
}

impl fmt::Display for PictureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local wall-clock window during which rotation is suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuietHours {
    start: NaiveTime,
    end: NaiveTime,
}

impl QuietHours {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    pub fn start(&self) -> NaiveTime {
        self.start
    }

    pub fn end(&self) -> NaiveTime {
        self.end
    }

    /// `start > end` wraps around midnight; `start == end` never applies.
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start < self.end {
            self.start <= time && time < self.end
        } else if self.start > self.end {
            time >= self.start || time < self.end
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Settings {
    pub picture_mode: PictureMode,
    /// `None` when the loaded file had no usable value; the SD-card override
    /// file is consulted in that case.
    pub change_interval_minutes: Option<u32>,
    pub stop_rotation_between: Option<QuietHours>,
    pub s3_folder: PathBuf,
    /// File the values came from; `None` for built-in defaults.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loaded_from: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            picture_mode: PictureMode::default(),
            change_interval_minutes: Some(DEFAULT_CHANGE_INTERVAL_MINUTES),
            stop_rotation_between: None,
            s3_folder: PathBuf::from(DEFAULT_S3_FOLDER),
            loaded_from: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalSource {
    Settings,
    OverrideFile,
    Fallback,
}

impl Settings {
    /// Parse one settings document. Syntax errors and non-object documents
    /// reject the whole file; individual bad values fall back per key.
    pub fn from_json_str(path: &Path, raw: &str) -> Result<Self, SettingsError> {
        let value: Value = serde_json::from_str(raw).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        let Value::Object(map) = value else {
            return Err(SettingsError::NotAnObject {
                path: path.to_path_buf(),
            });
        };
        Ok(Self::from_map(path, &map))
    }

    fn from_map(path: &Path, map: &Map<String, Value>) -> Self {
        let defaults = Self::default();

        let picture_mode = match map.get("picture_mode") {
            None | Some(Value::Null) => defaults.picture_mode,
            Some(Value::String(raw)) => PictureMode::parse(raw).unwrap_or_else(|| {
                warn!(path = %path.display(), value = raw.as_str(), "unknown picture_mode; using both");
                PictureMode::Both
            }),
            Some(other) => {
                warn!(path = %path.display(), value = %other, "picture_mode must be a string; using both");
                PictureMode::Both
            }
        };

        let change_interval_minutes = match map.get("change_interval_minutes") {
            None => defaults.change_interval_minutes,
            Some(value) => {
                let minutes = parse_positive_minutes(value);
                if minutes.is_none() {
                    warn!(
                        path = %path.display(),
                        value = %value,
                        "change_interval_minutes unusable; deferring to override file"
                    );
                }
                minutes
            }
        };

        let stop_rotation_between = match map.get("stop_rotation_between") {
            None | Some(Value::Null) => None,
            Some(value) => {
                let window = parse_quiet_hours(value);
                if window.is_none() {
                    warn!(path = %path.display(), value = %value, "ignoring malformed stop_rotation_between");
                }
                window
            }
        };

        let s3_folder = match map.get("s3_folder") {
            None | Some(Value::Null) => defaults.s3_folder,
            Some(Value::String(raw)) if is_safe_relative(raw) => PathBuf::from(raw.trim()),
            Some(other) => {
                warn!(
                    path = %path.display(),
                    value = %other,
                    "s3_folder must be a relative path; using {DEFAULT_S3_FOLDER}"
                );
                defaults.s3_folder
            }
        };

        Self {
            picture_mode,
            change_interval_minutes,
            stop_rotation_between,
            s3_folder,
            loaded_from: Some(path.to_path_buf()),
        }
    }

    /// Resolve the rotation interval: settings value, then the override file at
    /// the volume root, then [`FALLBACK_INTERVAL`].
    pub fn rotation_interval(&self, volume_root: Option<&Path>) -> (Duration, IntervalSource) {
        if let Some(minutes) = self.change_interval_minutes {
            return (
                Duration::from_secs(u64::from(minutes) * 60),
                IntervalSource::Settings,
            );
        }
        if let Some(interval) = volume_root.and_then(storage::read_refresh_override) {
            return (interval, IntervalSource::OverrideFile);
        }
        (FALLBACK_INTERVAL, IntervalSource::Fallback)
    }
}

fn parse_positive_minutes(value: &Value) -> Option<u32> {
    let minutes = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }?;
    u32::try_from(minutes).ok().filter(|m| *m > 0)
}

fn parse_quiet_hours(value: &Value) -> Option<QuietHours> {
    let obj = value.as_object()?;
    let start = obj.get("start").or_else(|| obj.get("evening"))?.as_str()?;
    let end = obj.get("end").or_else(|| obj.get("morning"))?.as_str()?;
    Some(QuietHours::new(parse_clock(start)?, parse_clock(end)?))
}

fn parse_clock(raw: &str) -> Option<NaiveTime> {
    let trimmed = raw.trim();
    ["%H:%M", "%H:%M:%S"]
        .iter()
        .find_map(|format| NaiveTime::parse_from_str(trimmed, format).ok())
}

fn is_safe_relative(raw: &str) -> bool {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return false;
    }
    Path::new(trimmed)
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Ordered list of settings candidates; the first one that parses wins.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    candidates: Vec<PathBuf>,
}

impl SettingsStore {
    pub fn new(candidates: Vec<PathBuf>) -> Self {
        Self { candidates }
    }

    /// System-wide, then per-user, then next to the installed binary.
    pub fn standard(install_dir: &Path) -> Self {
        let mut candidates = vec![PathBuf::from(SYSTEM_SETTINGS_PATH)];
        if let Some(config_dir) = dirs::config_dir() {
            candidates.push(config_dir.join("epaper_frame").join(SETTINGS_FILE_NAME));
        }
        candidates.push(install_dir.join(SETTINGS_FILE_NAME));
        Self::new(candidates)
    }

    pub fn candidates(&self) -> &[PathBuf] {
        &self.candidates
    }

    /// Never fails: bad candidates are logged and skipped, and built-in
    /// defaults stand in when nothing usable is found.
    pub fn load(&self) -> Settings {
        for path in &self.candidates {
            match load_candidate(path) {
                Ok(Some(settings)) => {
                    debug!(path = %path.display(), "loaded settings");
                    return settings;
                }
                Ok(None) => {
                    debug!(path = %path.display(), "settings candidate absent");
                }
                Err(err) => {
                    warn!(error = %err, "skipping settings candidate");
                }
            }
        }
        info!("no usable settings file; using built-in defaults");
        Settings::default()
    }
}

fn load_candidate(path: &Path) -> Result<Option<Settings>, SettingsError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(SettingsError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    Settings::from_json_str(path, &raw).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn parse(raw: &str) -> Settings {
        Settings::from_json_str(Path::new("/test/settings.json"), raw).expect("valid settings")
    }

    #[test]
    fn overnight_window_wraps_midnight() {
        let quiet = QuietHours::new(hm(22, 0), hm(6, 0));
        assert!(quiet.contains(hm(23, 30)));
        assert!(quiet.contains(hm(2, 0)));
        assert!(quiet.contains(hm(22, 0)));
        assert!(!quiet.contains(hm(6, 0)));
        assert!(!quiet.contains(hm(12, 0)));
    }

    #[test]
    fn same_day_window_is_half_open() {
        let quiet = QuietHours::new(hm(13, 0), hm(15, 30));
        assert!(quiet.contains(hm(13, 0)));
        assert!(quiet.contains(hm(15, 29)));
        assert!(!quiet.contains(hm(15, 30)));
        assert!(!quiet.contains(hm(9, 0)));
    }

    #[test]
    fn equal_bounds_never_apply() {
        let quiet = QuietHours::new(hm(7, 0), hm(7, 0));
        assert!(!quiet.contains(hm(7, 0)));
        assert!(!quiet.contains(hm(19, 0)));
    }

    #[test]
    fn missing_keys_take_defaults() {
        let settings = parse("{}");
        assert_eq!(settings.picture_mode, PictureMode::Both);
        assert_eq!(settings.change_interval_minutes, Some(15));
        assert_eq!(settings.stop_rotation_between, None);
        assert_eq!(settings.s3_folder, PathBuf::from("s3_folder"));
        assert_eq!(
            settings.loaded_from.as_deref(),
            Some(Path::new("/test/settings.json"))
        );
    }

    #[test]
    fn accepts_evening_morning_aliases() {
        let settings = parse(r#"{"stop_rotation_between": {"evening": "21:15", "morning": "07:00"}}"#);
        let quiet = settings.stop_rotation_between.expect("quiet hours");
        assert_eq!(quiet.start(), hm(21, 15));
        assert_eq!(quiet.end(), hm(7, 0));
    }

    #[test]
    fn interval_accepts_numeric_strings_and_rejects_zero() {
        assert_eq!(
            parse(r#"{"change_interval_minutes": "5"}"#).change_interval_minutes,
            Some(5)
        );
        assert_eq!(
            parse(r#"{"change_interval_minutes": 0}"#).change_interval_minutes,
            None
        );
        assert_eq!(
            parse(r#"{"change_interval_minutes": null}"#).change_interval_minutes,
            None
        );
        assert_eq!(
            parse(r#"{"change_interval_minutes": -3}"#).change_interval_minutes,
            None
        );
    }

    #[test]
    fn unknown_mode_falls_back_to_both() {
        let settings = parse(r#"{"picture_mode": "everything"}"#);
        assert_eq!(settings.picture_mode, PictureMode::Both);
        let settings = parse(r#"{"picture_mode": "ONLINE"}"#);
        assert_eq!(settings.picture_mode, PictureMode::Online);
    }

    #[test]
    fn s3_folder_must_stay_inside_the_volume() {
        assert_eq!(
            parse(r#"{"s3_folder": "../etc"}"#).s3_folder,
            PathBuf::from("s3_folder")
        );
        assert_eq!(
            parse(r#"{"s3_folder": "/abs"}"#).s3_folder,
            PathBuf::from("s3_folder")
        );
        assert_eq!(
            parse(r#"{"s3_folder": "cloud/sync"}"#).s3_folder,
            PathBuf::from("cloud/sync")
        );
    }

    #[test]
    fn serializes_with_lowercase_mode_and_clock_times() {
        let settings = parse(
            r#"{"picture_mode": "local", "stop_rotation_between": {"start": "22:00", "end": "06:30"}}"#,
        );
        let json = serde_json::to_value(&settings).unwrap();
        assert_eq!(json["picture_mode"], "local");
        assert_eq!(json["stop_rotation_between"]["start"], "22:00:00");
        assert_eq!(json["stop_rotation_between"]["end"], "06:30:00");
        assert_eq!(json["change_interval_minutes"], 15);
    }

    #[test]
    fn non_object_document_is_rejected() {
        let err = Settings::from_json_str(Path::new("x.json"), "[1, 2]").unwrap_err();
        assert!(matches!(err, SettingsError::NotAnObject { .. }));
    }
}
