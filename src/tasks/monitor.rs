use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{Local, NaiveTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::{self, Catalog, CatalogEntry};
use crate::error::{DisplayError, PresentError};
use crate::settings::{Settings, SettingsStore};
use crate::storage;
use crate::tasks::converter::{ConversionCache, Decoder};
use crate::tasks::display::{DisplayManager, PanelDriver};
use crate::tasks::scheduler::{Presenter, Scheduler, TickOutcome, TickPolicy};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_SETTINGS_REFRESH: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct MonitorOptions {
    /// Directory whose sub-directories are candidate volumes.
    pub mount_base: PathBuf,
    pub poll_interval: Duration,
    /// How often settings are re-read and the catalog rebuilt while mounted.
    pub settings_refresh: Duration,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            mount_base: storage::default_mount_base(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            settings_refresh: DEFAULT_SETTINGS_REFRESH,
        }
    }
}

/// Converts through the cache and forwards to the display.
struct Renderer<'a, D, P> {
    cache: &'a ConversionCache<D>,
    display: &'a mut DisplayManager<P>,
}

impl<D: Decoder, P: PanelDriver> Presenter for Renderer<'_, D, P> {
    fn show_boot(&mut self) -> Result<(), DisplayError> {
        self.display.show_boot()
    }

    fn present(&mut self, entry: &CatalogEntry) -> Result<(), PresentError> {
        let frame = self.cache.ensure(entry)?;
        self.display.show(&frame)?;
        Ok(())
    }

    fn hold(&mut self) -> Result<(), DisplayError> {
        self.display.hold()
    }
}

/// Top-level driver tying storage, settings, catalog and scheduler together.
pub struct Monitor<D, P> {
    options: MonitorOptions,
    store: SettingsStore,
    settings: Settings,
    settings_checked_at: Option<Instant>,
    volume: Option<PathBuf>,
    interval: Duration,
    published: Option<Catalog>,
    cache: ConversionCache<D>,
    display: DisplayManager<P>,
    scheduler: Scheduler,
}

impl<D: Decoder, P: PanelDriver> Monitor<D, P> {
    pub fn new(
        options: MonitorOptions,
        store: SettingsStore,
        cache: ConversionCache<D>,
        display: DisplayManager<P>,
        scheduler: Scheduler,
    ) -> Self {
        let settings = Settings::default();
        let (interval, _) = settings.rotation_interval(None);
        Self {
            options,
            store,
            settings,
            settings_checked_at: None,
            volume: None,
            interval,
            published: None,
            cache,
            display,
            scheduler,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn volume(&self) -> Option<&Path> {
        self.volume.as_deref()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn display(&self) -> &DisplayManager<P> {
        &self.display
    }

    pub fn cache(&self) -> &ConversionCache<D> {
        &self.cache
    }

    /// One iteration of the loop. Returns `None` when no tick was issued
    /// because storage is unavailable.
    pub fn poll(&mut self, now: Instant, wall: NaiveTime) -> Option<TickOutcome> {
        let volume = storage::find_volume(&self.options.mount_base).ok();
        let mount_changed = volume != self.volume;
        if mount_changed {
            match &volume {
                Some(path) => info!(volume = %path.display(), "storage mounted"),
                None => warn!(base = %self.options.mount_base.display(), "storage unavailable; waiting"),
            }
            self.volume = volume;
        }

        let refresh_due = self
            .settings_checked_at
            .is_none_or(|at| now.saturating_duration_since(at) >= self.options.settings_refresh);
        if mount_changed || refresh_due {
            self.refresh(now);
        }

        if self.volume.is_none() && !self.scheduler.is_booting() {
            return None;
        }

        let policy = TickPolicy {
            interval: self.interval,
            quiet_hours: self.settings.stop_rotation_between,
        };
        let mut presenter = Renderer {
            cache: &self.cache,
            display: &mut self.display,
        };
        Some(self.scheduler.tick(now, wall, &policy, &mut presenter))
    }

    fn refresh(&mut self, now: Instant) {
        let first = self.settings_checked_at.is_none();
        self.settings_checked_at = Some(now);

        let settings = self.store.load();
        if first || settings != self.settings {
            info!(
                source = %settings
                    .loaded_from
                    .as_deref()
                    .map_or_else(|| "built-in defaults".to_string(), |p| p.display().to_string()),
                mode = %settings.picture_mode,
                quiet_hours = settings.stop_rotation_between.is_some(),
                "settings applied"
            );
            self.settings = settings;
        }

        let (interval, source) = self.settings.rotation_interval(self.volume.as_deref());
        if first || interval != self.interval {
            info!(interval = %humantime::format_duration(interval), ?source, "rotation interval");
            self.interval = interval;
        }

        let catalog = match &self.volume {
            None => Catalog::default(),
            Some(root) => match catalog::rebuild(root, &self.settings) {
                Ok(catalog) => {
                    self.cache.prune(&catalog);
                    catalog
                }
                Err(err) => {
                    warn!(error = %err, "catalog is empty");
                    Catalog::default()
                }
            },
        };

        if self.published.as_ref() != Some(&catalog) {
            debug!(entries = catalog.len(), "publishing catalog");
            self.scheduler.catalog_changed(catalog.clone());
            self.published = Some(catalog);
        }
    }

    /// Poll until `cancel` fires.
    pub async fn run(&mut self, cancel: CancellationToken) {
        info!(
            base = %self.options.mount_base.display(),
            poll = %humantime::format_duration(self.options.poll_interval),
            "monitor started"
        );
        while !cancel.is_cancelled() {
            if let Some(outcome) = self.poll(Instant::now(), Local::now().time()) {
                debug!(?outcome, phase = ?self.scheduler.phase(), "tick");
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.options.poll_interval) => {}
            }
        }
        info!("monitor stopped");
    }
}
