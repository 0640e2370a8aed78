use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

use epaper_frame::catalog;
use epaper_frame::platform::panel_command::{CommandPanel, PanelCommandPlan};
use epaper_frame::processing::panel::PanelDecoder;
use epaper_frame::settings::SettingsStore;
use epaper_frame::storage;
use epaper_frame::tasks::converter::{ConversionCache, PanelSpec};
use epaper_frame::tasks::display::{DisplayManager, load_boot_frame};
use epaper_frame::tasks::monitor::{Monitor, MonitorOptions};
use epaper_frame::tasks::scheduler::{self, Scheduler};

#[derive(Debug, Parser)]
#[command(
    name = "epaper-frame",
    version,
    about = "Rotate pictures from removable storage on a colour e-paper panel"
)]
struct Args {
    /// Directory whose sub-directories are scanned for a mounted card
    #[arg(long, env = "EPAPER_FRAME_MOUNT_BASE", value_name = "DIR")]
    mount_base: Option<PathBuf>,
    /// Installation directory (settings.json, pic/start.jpg); defaults to the binary's directory
    #[arg(long, env = "EPAPER_FRAME_INSTALL_DIR", value_name = "DIR")]
    install_dir: Option<PathBuf>,
    /// Where converted panel renderings are cached [default: <install>/cache]
    #[arg(long, env = "EPAPER_FRAME_CACHE_DIR", value_name = "DIR")]
    cache_dir: Option<PathBuf>,
    /// Picture shown while booting [default: <install>/pic/start.jpg]
    #[arg(long, env = "EPAPER_FRAME_BOOT_IMAGE", value_name = "FILE")]
    boot_image: Option<PathBuf>,
    /// Directory the current frame is written to for the panel tool [default: <install>/spool]
    #[arg(long, env = "EPAPER_FRAME_SPOOL_DIR", value_name = "DIR")]
    spool_dir: Option<PathBuf>,
    #[arg(long, env = "EPAPER_FRAME_PANEL_WIDTH", default_value_t = 800)]
    panel_width: u32,
    #[arg(long, env = "EPAPER_FRAME_PANEL_HEIGHT", default_value_t = 480)]
    panel_height: u32,
    /// Shell command run for each frame; `{frame}` and `{command}` are substituted
    #[arg(long, env = "EPAPER_FRAME_SHOW_COMMAND", value_name = "TEMPLATE")]
    show_command: Option<String>,
    /// Shell command run when the panel should hold its image
    #[arg(long, env = "EPAPER_FRAME_HOLD_COMMAND", value_name = "TEMPLATE")]
    hold_command: Option<String>,
    /// Storage polling cadence
    #[arg(long, env = "EPAPER_FRAME_POLL_INTERVAL", value_parser = humantime::parse_duration, default_value = "2s")]
    poll_interval: Duration,
    /// How often settings are re-read and the catalog rebuilt
    #[arg(long, env = "EPAPER_FRAME_SETTINGS_REFRESH", value_parser = humantime::parse_duration, default_value = "60s")]
    settings_refresh: Duration,
    /// Number of recent pictures excluded from the next pick
    #[arg(long, env = "EPAPER_FRAME_HISTORY", default_value_t = 3)]
    history: usize,
    /// Deterministic RNG seed for picture selection
    #[arg(long, env = "EPAPER_FRAME_SEED")]
    seed: Option<u64>,
    /// Print the catalog and the next N picks without touching the panel
    #[arg(long = "catalog-dry-run", value_name = "ITERATIONS")]
    catalog_dry_run: Option<usize>,
    /// Increase log verbosity (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let install_dir = match args.install_dir {
        Some(dir) => dir,
        None => default_install_dir()?,
    };
    let store = SettingsStore::standard(&install_dir);
    let mount_base = args
        .mount_base
        .unwrap_or_else(storage::default_mount_base);

    if let Some(iterations) = args.catalog_dry_run {
        return run_catalog_dry_run(&store, &mount_base, iterations, args.history, args.seed);
    }

    let panel = PanelSpec {
        width: args.panel_width,
        height: args.panel_height,
    };
    if panel.width == 0 || panel.height == 0 {
        return Err(anyhow!("panel dimensions must be non-zero"));
    }

    let cache_dir = args.cache_dir.unwrap_or_else(|| install_dir.join("cache"));
    let cache = ConversionCache::open(&cache_dir, panel, PanelDecoder)?;

    let boot_image = args
        .boot_image
        .unwrap_or_else(|| install_dir.join("pic").join("start.jpg"));
    let boot = load_boot_frame(&boot_image, panel, &PanelDecoder);

    let driver = CommandPanel::new(PanelCommandPlan {
        spool_dir: args.spool_dir.unwrap_or_else(|| install_dir.join("spool")),
        show_command: args.show_command,
        hold_command: args.hold_command,
    })
    .context("invalid panel command configuration")?;
    tracing::info!(?driver, ?panel, cache = %cache_dir.display(), "panel configured");

    let scheduler = Scheduler::new(seeded_rng(args.seed), args.history);
    let options = MonitorOptions {
        mount_base,
        poll_interval: args.poll_interval,
        settings_refresh: args.settings_refresh,
    };
    let mut monitor = Monitor::new(
        options,
        store,
        cache,
        DisplayManager::new(driver, boot),
        scheduler,
    );

    let cancel = CancellationToken::new();
    spawn_shutdown_listener(cancel.clone());
    monitor.run(cancel).await;
    Ok(())
}

fn init_tracing(verbose: u8) {
    let fallback = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .with_target(false)
        .compact()
        .init();
}

fn default_install_dir() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("failed to locate the running executable")?;
    exe.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| anyhow!("executable {} has no parent directory", exe.display()))
}

fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    }
}

fn spawn_shutdown_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => tracing::info!("SIGINT received; shutting down"),
                        _ = term.recv() => tracing::info!("SIGTERM received; shutting down"),
                    }
                }
                Err(err) => {
                    tracing::warn!("failed to install SIGTERM handler: {err}");
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Ctrl-C received; shutting down");
        }
        cancel.cancel();
    });
}

fn run_catalog_dry_run(
    store: &SettingsStore,
    mount_base: &Path,
    iterations: usize,
    history: usize,
    seed: Option<u64>,
) -> Result<()> {
    let volume = storage::find_volume(mount_base)?;
    let settings = store.load();
    let (interval, source) = settings.rotation_interval(Some(&volume));

    println!(
        "# catalog dry run\n# volume: {}\n# interval: {} ({:?})\n# iterations: {}\n# seed: {}",
        volume.display(),
        humantime::format_duration(interval),
        source,
        iterations,
        seed.map_or_else(|| "(random)".to_string(), |s| s.to_string())
    );
    println!(
        "# settings:\n{}\n",
        serde_json::to_string_pretty(&settings).context("failed to render settings")?
    );

    let catalog = match catalog::rebuild(&volume, &settings) {
        Ok(catalog) => catalog,
        Err(err) => {
            println!("({err})");
            return Ok(());
        }
    };

    println!("# catalog ({} entries):", catalog.len());
    for entry in &catalog {
        println!("  {}  {}", entry.id, entry.path.display());
    }

    let plan = scheduler::simulate_rotation(catalog, iterations, history, seed);
    println!("\n# planned order:");
    for (idx, path) in plan.iter().enumerate() {
        println!("  {:>4}: {}", idx + 1, path.display());
    }
    Ok(())
}
