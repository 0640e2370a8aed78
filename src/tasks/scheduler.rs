//! Rotation state machine: decides on each tick whether to show the boot
//! picture, advance to a new image, or keep holding during quiet hours.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::NaiveTime;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, CatalogEntry, EntryId};
use crate::error::{DisplayError, PresentError};
use crate::settings::QuietHours;

/// Cap on how far ahead a deadline is scheduled.
const LONGEST_WAIT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationPhase {
    Booting,
    Rotating,
    Paused,
}

/// Per-tick view of the user policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickPolicy {
    pub interval: Duration,
    pub quiet_hours: Option<QuietHours>,
}

impl TickPolicy {
    fn is_quiet(&self, wall: NaiveTime) -> bool {
        self.quiet_hours.is_some_and(|q| q.contains(wall))
    }
}

/// What the scheduler drives: conversion plus the display.
pub trait Presenter {
    fn show_boot(&mut self) -> Result<(), DisplayError>;
    fn present(&mut self, entry: &CatalogEntry) -> Result<(), PresentError>;
    fn hold(&mut self) -> Result<(), DisplayError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Boot picture issued; carries the phase entered afterwards.
    Booted(RotationPhase),
    Shown(EntryId),
    EnteredPause,
    Holding,
    NotDue,
    Starved,
    DisplayFailed(EntryId),
    /// Every eligible entry failed conversion this tick.
    Exhausted,
}

#[derive(Debug)]
pub struct Scheduler {
    phase: RotationPhase,
    /// `None` while the boot picture is on the panel.
    current: Option<EntryId>,
    history: VecDeque<EntryId>,
    history_limit: usize,
    next_tick: Option<Instant>,
    /// When `next_tick` was last scheduled from an interval.
    scheduled_at: Option<Instant>,
    catalog: Catalog,
    incoming: Option<Catalog>,
    retry: Option<EntryId>,
    hold_pending: bool,
    starved_warned: bool,
    rng: StdRng,
}

impl Scheduler {
    pub fn new(rng: StdRng, history_limit: usize) -> Self {
        Self {
            phase: RotationPhase::Booting,
            current: None,
            history: VecDeque::new(),
            history_limit: history_limit.max(1),
            next_tick: None,
            scheduled_at: None,
            catalog: Catalog::default(),
            incoming: None,
            retry: None,
            hold_pending: false,
            starved_warned: false,
            rng,
        }
    }

    pub fn phase(&self) -> RotationPhase {
        self.phase
    }

    pub fn is_booting(&self) -> bool {
        self.phase == RotationPhase::Booting
    }

    pub fn current_id(&self) -> Option<&EntryId> {
        self.current.as_ref()
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Stage a new eligible set; it takes effect at the start of the next tick.
    pub fn catalog_changed(&mut self, catalog: Catalog) {
        self.incoming = Some(catalog);
    }

    pub fn tick(
        &mut self,
        now: Instant,
        wall: NaiveTime,
        policy: &TickPolicy,
        presenter: &mut impl Presenter,
    ) -> TickOutcome {
        self.apply_incoming();

        match self.phase {
            RotationPhase::Booting => self.boot(now, wall, policy, presenter),
            RotationPhase::Rotating => {
                self.shorten_deadline(policy);
                if self.next_tick.is_some_and(|due| now < due) {
                    return TickOutcome::NotDue;
                }
                if policy.is_quiet(wall) {
                    info!(%wall, "quiet hours started; pausing rotation");
                    self.phase = RotationPhase::Paused;
                    self.issue_hold(now, policy, presenter);
                    return TickOutcome::EnteredPause;
                }
                self.advance(now, policy, presenter)
            }
            RotationPhase::Paused => {
                if !policy.is_quiet(wall) {
                    info!(%wall, "quiet hours over; resuming rotation");
                    self.phase = RotationPhase::Rotating;
                    return self.advance(now, policy, presenter);
                }
                if self.hold_pending && self.next_tick.is_none_or(|due| now >= due) {
                    self.issue_hold(now, policy, presenter);
                }
                TickOutcome::Holding
            }
        }
    }

    fn boot(
        &mut self,
        now: Instant,
        wall: NaiveTime,
        policy: &TickPolicy,
        presenter: &mut impl Presenter,
    ) -> TickOutcome {
        if let Err(err) = presenter.show_boot() {
            warn!(error = %err, "boot picture failed; continuing");
        }
        self.current = None;
        if policy.is_quiet(wall) {
            info!(%wall, "booted inside quiet hours; holding boot picture");
            self.phase = RotationPhase::Paused;
            self.issue_hold(now, policy, presenter);
        } else {
            info!("booted; rotation starting");
            self.phase = RotationPhase::Rotating;
            self.next_tick = Some(now);
        }
        TickOutcome::Booted(self.phase)
    }

    fn issue_hold(&mut self, now: Instant, policy: &TickPolicy, presenter: &mut impl Presenter) {
        match presenter.hold() {
            Ok(()) => self.hold_pending = false,
            Err(err) => {
                warn!(error = %err, "hold failed; retrying after one interval");
                self.hold_pending = true;
                self.schedule(now, policy);
            }
        }
    }

    fn advance(
        &mut self,
        now: Instant,
        policy: &TickPolicy,
        presenter: &mut impl Presenter,
    ) -> TickOutcome {
        if self.catalog.is_empty() {
            if !self.starved_warned {
                warn!("no eligible images; rotation idle");
                self.starved_warned = true;
            }
            return TickOutcome::Starved;
        }
        self.starved_warned = false;
        self.schedule(now, policy);

        let mut rejected = HashSet::new();
        loop {
            let retried = self
                .retry
                .take()
                .and_then(|id| self.catalog.get(&id).cloned());
            let entry = match retried {
                Some(entry) => entry,
                None => match self.pick(&rejected) {
                    Some(entry) => entry,
                    None => {
                        warn!(rejected = rejected.len(), "every eligible image failed to convert");
                        return TickOutcome::Exhausted;
                    }
                },
            };

            match presenter.present(&entry) {
                Ok(()) => {
                    info!(path = %entry.path.display(), id = %entry.id, "displayed image");
                    self.record_shown(entry.id.clone());
                    return TickOutcome::Shown(entry.id);
                }
                Err(PresentError::Conversion(err)) => {
                    warn!(error = %err, "skipping image");
                    rejected.insert(entry.id);
                }
                Err(PresentError::Display(err)) => {
                    warn!(path = %entry.path.display(), error = %err, "display failed; will retry");
                    self.retry = Some(entry.id.clone());
                    return TickOutcome::DisplayFailed(entry.id);
                }
            }
        }
    }

    fn schedule(&mut self, now: Instant, policy: &TickPolicy) {
        self.scheduled_at = Some(now);
        self.next_tick = Some(deadline(now, policy.interval));
    }

    /// Pull a pending deadline in when the interval has been shortened.
    fn shorten_deadline(&mut self, policy: &TickPolicy) {
        let (Some(due), Some(from)) = (self.next_tick, self.scheduled_at) else {
            return;
        };
        let shortened = deadline(from, policy.interval);
        if shortened < due {
            debug!(interval = ?policy.interval, "interval shortened; moving next change earlier");
            self.next_tick = Some(shortened);
        }
    }

    fn pick(&mut self, rejected: &HashSet<EntryId>) -> Option<CatalogEntry> {
        let usable: Vec<&CatalogEntry> = self
            .catalog
            .iter()
            .filter(|e| !rejected.contains(&e.id))
            .collect();
        if usable.is_empty() {
            return None;
        }

        let window = self.history_limit.min(self.catalog.len().saturating_sub(1));
        let recent: Vec<&EntryId> = self.history.iter().rev().take(window).collect();
        let fresh: Vec<&CatalogEntry> = usable
            .iter()
            .copied()
            .filter(|e| !recent.contains(&&e.id))
            .collect();

        let candidates = if !fresh.is_empty() {
            fresh
        } else {
            let not_current: Vec<&CatalogEntry> = usable
                .iter()
                .copied()
                .filter(|e| self.current.as_ref() != Some(&e.id))
                .collect();
            if not_current.is_empty() {
                usable
            } else {
                not_current
            }
        };
        candidates.choose(&mut self.rng).map(|e| (*e).clone())
    }

    fn record_shown(&mut self, id: EntryId) {
        self.history.push_back(id.clone());
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }
        self.current = Some(id);
    }

    fn apply_incoming(&mut self) {
        let Some(catalog) = self.incoming.take() else {
            return;
        };
        let current_gone = self
            .current
            .as_ref()
            .is_some_and(|id| !catalog.contains(id));
        if current_gone {
            info!("displayed image left the catalog; clearing history");
            self.history.clear();
        } else {
            self.history.retain(|id| catalog.contains(id));
        }
        if self.retry.as_ref().is_some_and(|id| !catalog.contains(id)) {
            debug!("dropping retry for image no longer eligible");
            self.retry = None;
        }
        info!(entries = catalog.len(), "catalog updated");
        self.catalog = catalog;
    }
}

fn deadline(now: Instant, interval: Duration) -> Instant {
    now.checked_add(interval.min(LONGEST_WAIT)).unwrap_or(now)
}

/// Plan the next `iterations` picks without touching the panel.
pub fn simulate_rotation(
    catalog: Catalog,
    iterations: usize,
    history_limit: usize,
    seed: Option<u64>,
) -> Vec<PathBuf> {
    struct DryRun<'a> {
        plan: &'a mut Vec<PathBuf>,
    }

    impl Presenter for DryRun<'_> {
        fn show_boot(&mut self) -> Result<(), DisplayError> {
            Ok(())
        }

        fn present(&mut self, entry: &CatalogEntry) -> Result<(), PresentError> {
            self.plan.push(entry.path.clone());
            Ok(())
        }

        fn hold(&mut self) -> Result<(), DisplayError> {
            Ok(())
        }
    }

    let rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };
    let mut scheduler = Scheduler::new(rng, history_limit);
    scheduler.catalog_changed(catalog);

    let policy = TickPolicy {
        interval: Duration::from_secs(60),
        quiet_hours: None,
    };
    let noon = NaiveTime::from_hms_opt(12, 0, 0).unwrap_or_default();
    let mut plan = Vec::with_capacity(iterations);
    let mut presenter = DryRun { plan: &mut plan };
    let mut now = Instant::now();
    scheduler.tick(now, noon, &policy, &mut presenter);
    for _ in 0..iterations {
        if scheduler.tick(now, noon, &policy, &mut presenter) == TickOutcome::Starved {
            break;
        }
        now += policy.interval;
    }
    plan
}
