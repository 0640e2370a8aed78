use std::collections::HashSet;
use std::io;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::NaiveTime;
use epaper_frame::catalog::{Catalog, CatalogEntry, EntryId};
use epaper_frame::error::{ConversionError, DisplayError, PresentError};
use epaper_frame::settings::QuietHours;
use epaper_frame::tasks::display::PanelCommand;
use epaper_frame::tasks::scheduler::{
    Presenter, RotationPhase, Scheduler, TickOutcome, TickPolicy,
};
use rand::SeedableRng;
use rand::rngs::StdRng;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Boot,
    Show(EntryId),
    Hold,
}

#[derive(Default)]
struct FakePresenter {
    events: Vec<Event>,
    display_failures: usize,
    hold_failures: usize,
    unconvertible: HashSet<EntryId>,
}

impl FakePresenter {
    fn shown(&self) -> Vec<EntryId> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Show(id) => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    fn holds(&self) -> usize {
        self.events.iter().filter(|e| **e == Event::Hold).count()
    }
}

fn transfer_error(command: PanelCommand) -> DisplayError {
    DisplayError::Transfer {
        command,
        reason: anyhow::anyhow!("busy line"),
    }
}

impl Presenter for FakePresenter {
    fn show_boot(&mut self) -> Result<(), DisplayError> {
        self.events.push(Event::Boot);
        Ok(())
    }

    fn present(&mut self, entry: &CatalogEntry) -> Result<(), PresentError> {
        if self.unconvertible.contains(&entry.id) {
            return Err(ConversionError::Read {
                path: entry.path.clone(),
                source: io::Error::from(io::ErrorKind::InvalidData),
            }
            .into());
        }
        if self.display_failures > 0 {
            self.display_failures -= 1;
            return Err(transfer_error(PanelCommand::ShowImage).into());
        }
        self.events.push(Event::Show(entry.id.clone()));
        Ok(())
    }

    fn hold(&mut self) -> Result<(), DisplayError> {
        if self.hold_failures > 0 {
            self.hold_failures -= 1;
            return Err(transfer_error(PanelCommand::Hold));
        }
        self.events.push(Event::Hold);
        Ok(())
    }
}

fn catalog(names: &[&str]) -> Catalog {
    Catalog::from_entries(
        names
            .iter()
            .map(|name| CatalogEntry {
                path: PathBuf::from(format!("/media/pi/SD/{name}")),
                id: EntryId::from(*name),
            })
            .collect(),
    )
}

fn hm(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

fn policy(interval: Duration, quiet_hours: Option<QuietHours>) -> TickPolicy {
    TickPolicy {
        interval,
        quiet_hours,
    }
}

fn scheduler_with(names: &[&str], seed: u64) -> Scheduler {
    let mut scheduler = Scheduler::new(StdRng::seed_from_u64(seed), 3);
    scheduler.catalog_changed(catalog(names));
    scheduler
}

#[test]
fn never_repeats_back_to_back() {
    let every_tick = policy(Duration::from_secs(1), None);
    for size in 2..=5 {
        let names: Vec<String> = (0..size).map(|i| format!("img{i}.jpg")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        for seed in 0..5 {
            let mut scheduler = scheduler_with(&refs, seed);
            let mut presenter = FakePresenter::default();
            let start = Instant::now();
            for i in 0..100 {
                scheduler.tick(start + Duration::from_secs(i), hm(12, 0), &every_tick, &mut presenter);
            }
            let shown = presenter.shown();
            assert!(shown.len() >= 98, "size {size}: only {} shows", shown.len());
            for pair in shown.windows(2) {
                assert_ne!(pair[0], pair[1], "size {size} seed {seed} repeated");
            }
        }
    }
}

#[test]
fn single_entry_is_always_selected() {
    let mut scheduler = scheduler_with(&["only.jpg"], 3);
    let mut presenter = FakePresenter::default();
    let every_tick = policy(Duration::from_secs(1), None);
    let start = Instant::now();
    for i in 0..10 {
        scheduler.tick(start + Duration::from_secs(i), hm(9, 0), &every_tick, &mut presenter);
    }
    let shown = presenter.shown();
    assert_eq!(shown.len(), 9);
    assert!(shown.iter().all(|id| id.as_str() == "only.jpg"));
}

#[test]
fn one_change_per_simulated_minute() {
    let mut scheduler = scheduler_with(&["a.jpg", "b.jpg", "c.jpg", "d.jpg"], 11);
    let mut presenter = FakePresenter::default();
    let minute = policy(Duration::from_secs(60), None);
    let start = Instant::now();

    let first = scheduler.tick(start, hm(10, 0), &minute, &mut presenter);
    assert_eq!(first, TickOutcome::Booted(RotationPhase::Rotating));
    assert_eq!(scheduler.phase(), RotationPhase::Rotating);

    let mut show_times = Vec::new();
    for step in 1..=300u64 {
        let elapsed = Duration::from_secs(step * 2);
        if let TickOutcome::Shown(_) =
            scheduler.tick(start + elapsed, hm(10, 0), &minute, &mut presenter)
        {
            show_times.push(elapsed.as_secs());
        }
    }

    assert_eq!(presenter.events.first(), Some(&Event::Boot));
    assert_eq!(show_times.len(), 10);
    assert_eq!(show_times[0], 2);
    for pair in show_times.windows(2) {
        assert_eq!(pair[1] - pair[0], 60);
    }
}

#[test]
fn quiet_hours_hold_the_last_image() {
    let mut scheduler = scheduler_with(&["a.jpg", "b.jpg", "c.jpg"], 5);
    let mut presenter = FakePresenter::default();
    let quiet = QuietHours::new(hm(22, 0), hm(6, 0));
    let minute = policy(Duration::from_secs(60), Some(quiet));
    let start = Instant::now();
    let wall_start = hm(21, 50);

    let mut paused_at = None;
    let mut held_id = None;
    let mut resumed_at = None;
    // 21:50 through 06:30 in 30 s steps.
    for step in 0..=1040u64 {
        let elapsed = Duration::from_secs(step * 30);
        let wall = wall_start + chrono::Duration::seconds(elapsed.as_secs() as i64);
        let outcome = scheduler.tick(start + elapsed, wall, &minute, &mut presenter);
        match outcome {
            TickOutcome::EnteredPause => {
                paused_at = Some(wall);
                held_id = scheduler.current_id().cloned();
            }
            TickOutcome::Shown(_) if paused_at.is_some() && resumed_at.is_none() => {
                resumed_at = Some(wall);
            }
            _ => {}
        }
        if paused_at.is_some() && resumed_at.is_none() {
            assert_eq!(scheduler.phase(), RotationPhase::Paused);
            assert_eq!(scheduler.current_id(), held_id.as_ref());
        }
    }

    let paused_at = paused_at.expect("rotation paused");
    assert!(paused_at >= hm(22, 0) && paused_at <= hm(22, 1));
    assert_eq!(resumed_at, Some(hm(6, 0)));
    assert_eq!(presenter.holds(), 1);
    assert_eq!(scheduler.phase(), RotationPhase::Rotating);
}

#[test]
fn booting_inside_quiet_hours_keeps_boot_picture() {
    let mut scheduler = scheduler_with(&["a.jpg", "b.jpg"], 2);
    let mut presenter = FakePresenter::default();
    let quiet = QuietHours::new(hm(22, 0), hm(6, 0));
    let minute = policy(Duration::from_secs(60), Some(quiet));
    let start = Instant::now();

    let outcome = scheduler.tick(start, hm(23, 0), &minute, &mut presenter);
    assert_eq!(outcome, TickOutcome::Booted(RotationPhase::Paused));
    for i in 1..10 {
        let outcome = scheduler.tick(start + Duration::from_secs(i * 60), hm(23, 0), &minute, &mut presenter);
        assert_eq!(outcome, TickOutcome::Holding);
    }
    assert_eq!(presenter.events, vec![Event::Boot, Event::Hold]);
    assert_eq!(scheduler.current_id(), None);
}

#[test]
fn failed_hold_is_retried_after_an_interval() {
    let mut scheduler = scheduler_with(&["a.jpg"], 2);
    let mut presenter = FakePresenter {
        hold_failures: 1,
        ..FakePresenter::default()
    };
    let quiet = QuietHours::new(hm(22, 0), hm(6, 0));
    let minute = policy(Duration::from_secs(60), Some(quiet));
    let start = Instant::now();

    scheduler.tick(start, hm(23, 0), &minute, &mut presenter);
    scheduler.tick(start + Duration::from_secs(30), hm(23, 0), &minute, &mut presenter);
    assert_eq!(presenter.holds(), 0);
    scheduler.tick(start + Duration::from_secs(60), hm(23, 1), &minute, &mut presenter);
    assert_eq!(presenter.holds(), 1);
    scheduler.tick(start + Duration::from_secs(200), hm(23, 3), &minute, &mut presenter);
    assert_eq!(presenter.holds(), 1);
}

#[test]
fn display_failure_retries_the_same_entry() {
    let mut scheduler = scheduler_with(&["a.jpg", "b.jpg", "c.jpg"], 9);
    let mut presenter = FakePresenter {
        display_failures: 1,
        ..FakePresenter::default()
    };
    let minute = policy(Duration::from_secs(60), None);
    let start = Instant::now();

    scheduler.tick(start, hm(12, 0), &minute, &mut presenter);
    let failed = match scheduler.tick(start, hm(12, 0), &minute, &mut presenter) {
        TickOutcome::DisplayFailed(id) => id,
        other => panic!("expected display failure, got {other:?}"),
    };
    assert_eq!(scheduler.phase(), RotationPhase::Rotating);
    assert_eq!(
        scheduler.tick(start + Duration::from_secs(30), hm(12, 0), &minute, &mut presenter),
        TickOutcome::NotDue
    );
    assert_eq!(
        scheduler.tick(start + Duration::from_secs(60), hm(12, 1), &minute, &mut presenter),
        TickOutcome::Shown(failed)
    );
}

#[test]
fn conversion_failure_skips_to_another_entry() {
    let mut scheduler = scheduler_with(&["a.jpg", "b.jpg"], 4);
    let mut presenter = FakePresenter {
        unconvertible: HashSet::from([EntryId::from("a.jpg")]),
        ..FakePresenter::default()
    };
    let every_tick = policy(Duration::from_secs(1), None);
    let start = Instant::now();

    scheduler.tick(start, hm(12, 0), &every_tick, &mut presenter);
    for i in 0..20 {
        let outcome = scheduler.tick(start + Duration::from_secs(i), hm(12, 0), &every_tick, &mut presenter);
        assert_eq!(outcome, TickOutcome::Shown(EntryId::from("b.jpg")));
    }
}

#[test]
fn all_entries_unconvertible_exhausts_the_tick() {
    let mut scheduler = scheduler_with(&["a.jpg", "b.jpg"], 4);
    let mut presenter = FakePresenter {
        unconvertible: HashSet::from([EntryId::from("a.jpg"), EntryId::from("b.jpg")]),
        ..FakePresenter::default()
    };
    let minute = policy(Duration::from_secs(60), None);
    let start = Instant::now();

    scheduler.tick(start, hm(12, 0), &minute, &mut presenter);
    assert_eq!(
        scheduler.tick(start, hm(12, 0), &minute, &mut presenter),
        TickOutcome::Exhausted
    );
    assert_eq!(
        scheduler.tick(start + Duration::from_secs(1), hm(12, 0), &minute, &mut presenter),
        TickOutcome::NotDue
    );
}

#[test]
fn catalog_change_drops_vanished_entries() {
    let mut scheduler = scheduler_with(&["a.jpg"], 8);
    let mut presenter = FakePresenter {
        display_failures: 1,
        ..FakePresenter::default()
    };
    let minute = policy(Duration::from_secs(60), None);
    let start = Instant::now();

    scheduler.tick(start, hm(12, 0), &minute, &mut presenter);
    assert_eq!(
        scheduler.tick(start, hm(12, 0), &minute, &mut presenter),
        TickOutcome::DisplayFailed(EntryId::from("a.jpg"))
    );

    scheduler.catalog_changed(catalog(&["x.jpg", "y.jpg"]));
    let mut seen = HashSet::new();
    for i in 1..=6 {
        match scheduler.tick(start + Duration::from_secs(60 * i), hm(12, 0), &minute, &mut presenter) {
            TickOutcome::Shown(id) => {
                seen.insert(id);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!(
        seen,
        HashSet::from([EntryId::from("x.jpg"), EntryId::from("y.jpg")])
    );
    assert_eq!(scheduler.catalog().len(), 2);
}

fn show_three(seed: u64) -> (Scheduler, FakePresenter, Vec<EntryId>, Instant) {
    let mut scheduler = scheduler_with(&["a.jpg", "b.jpg", "c.jpg", "d.jpg"], seed);
    let mut presenter = FakePresenter::default();
    let minute = policy(Duration::from_secs(60), None);
    let start = Instant::now();
    scheduler.tick(start, hm(12, 0), &minute, &mut presenter);
    for i in 0..3 {
        scheduler.tick(start + Duration::from_secs(60 * i), hm(12, 0), &minute, &mut presenter);
    }
    let shown = presenter.shown();
    assert_eq!(shown.len(), 3);
    (scheduler, presenter, shown, start + Duration::from_secs(180))
}

fn name(id: &EntryId) -> String {
    id.to_string()
}

#[test]
fn vanished_current_image_clears_history() {
    let minute = policy(Duration::from_secs(60), None);
    let mut first_picks = HashSet::new();
    for seed in 0..20 {
        let (mut scheduler, mut presenter, shown, due) = show_three(seed);
        assert_eq!(scheduler.current_id(), Some(&shown[2]));

        let survivors = [name(&shown[0]), name(&shown[1]), "e.jpg".to_string()];
        let refs: Vec<&str> = survivors.iter().map(String::as_str).collect();
        scheduler.catalog_changed(catalog(&refs));

        match scheduler.tick(due, hm(12, 0), &minute, &mut presenter) {
            TickOutcome::Shown(id) => {
                first_picks.insert(id);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    // With the history kept, only e.jpg would be eligible.
    assert!(
        first_picks.iter().any(|id| *id != EntryId::from("e.jpg")),
        "former history never drawn: {first_picks:?}"
    );
}

#[test]
fn catalog_change_keeping_current_still_excludes_it() {
    let minute = policy(Duration::from_secs(60), None);
    for seed in 0..20 {
        let (mut scheduler, mut presenter, shown, due) = show_three(seed);
        let mut names: Vec<String> = shown.iter().map(name).collect();
        names.extend(["e.jpg".to_string(), "f.jpg".to_string()]);
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        scheduler.catalog_changed(catalog(&refs));

        match scheduler.tick(due, hm(12, 0), &minute, &mut presenter) {
            TickOutcome::Shown(id) => {
                assert_ne!(id, shown[2], "seed {seed} repeated the current image");
                assert!(
                    id == EntryId::from("e.jpg") || id == EntryId::from("f.jpg"),
                    "seed {seed} picked recent {id}"
                );
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
