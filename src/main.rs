use std::{
    io::{self, BufRead},
    path::PathBuf,
    process::ExitCode,
    sync::{Arc, Mutex, Weak},
    thread,
};

use anyhow::Context;
use clap::Parser;
use futures::executor::block_on;
use tracing::{debug, error, info, warn};

use media_tray::{
    config::Config,
    detector::DetectorStrategy,
    logging,
    model::DISPLAY_TITLE_LIMIT,
    platform::ManagerHandle,
    MediaProperties, MediaSessionTracker, PlatformResult, Thumbnail, TrackerSnapshot,
    TransportGlyph,
};

/// Console stand-in for the tray icon and flyout.
#[derive(Debug, Parser)]
#[command(name = "media-tray", version)]
struct Args {
    /// Configuration file; defaults to the usual config.toml locations.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, value_enum)]
    detector: Option<DetectorStrategy>,

    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Log filter, e.g. `debug` or `media_tray=trace`.
    #[arg(long)]
    log: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    TogglePlayPause,
    Next,
    Previous,
    Status,
    Quit,
}

fn parse_command(line: &str) -> Option<Command> {
    match line.trim().to_ascii_lowercase().as_str() {
        "p" | "toggle" | "play" | "pause" => Some(Command::TogglePlayPause),
        "n" | "next" => Some(Command::Next),
        "b" | "prev" | "previous" => Some(Command::Previous),
        "s" | "status" => Some(Command::Status),
        "q" | "quit" | "exit" => Some(Command::Quit),
        _ => None,
    }
}

fn describe(snapshot: &TrackerSnapshot) -> String {
    let Some(source) = snapshot.source_app_id.as_deref() else {
        return "no media playing".to_string();
    };
    let status = snapshot
        .playback
        .as_ref()
        .map(|info| info.status.as_str())
        .unwrap_or("Unknown");
    match snapshot.properties.as_ref() {
        Some(props) => format!(
            "{} - {} [{status}] ({source})",
            props.display_title(DISPLAY_TITLE_LIMIT),
            props.artist
        ),
        None => format!("[{status}] ({source})"),
    }
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match args.config.as_deref() {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(strategy) = args.detector {
        config.detector.strategy = strategy;
    }
    if let Some(interval) = args.poll_interval_ms {
        config.detector.poll_interval_ms = interval;
    }
    if let Some(filter) = args.log.clone() {
        config.logging.filter = filter;
    }
    Ok(config)
}

#[cfg(target_os = "windows")]
async fn acquire_manager() -> PlatformResult<ManagerHandle> {
    media_tray::platform::windows::request_manager().await
}

#[cfg(not(target_os = "windows"))]
async fn acquire_manager() -> PlatformResult<ManagerHandle> {
    Err(media_tray::PlatformError::Unavailable(
        "system media sessions are only available on Windows".to_string(),
    ))
}

/// Remembers the artwork last handed out, so a metadata refresh for the same
/// track does not load it again.
#[derive(Default)]
struct ArtworkCache {
    key: Mutex<Option<String>>,
}

impl ArtworkCache {
    fn needs_load(&self, props: &MediaProperties) -> Option<(String, Thumbnail)> {
        let thumbnail = props.thumbnail.clone()?;
        let key = props.thumbnail_cache_key();
        let mut current = self.key.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if current.as_deref() == Some(key.as_str()) {
            return None;
        }
        *current = Some(key.clone());
        Some((key, thumbnail))
    }
}

fn load_artwork(key: String, thumbnail: Thumbnail) {
    let spawned = thread::Builder::new()
        .name("artwork".into())
        .spawn(move || match block_on(thumbnail.read()) {
            Ok(bytes) => info!(track = %key, bytes = bytes.len(), "artwork loaded"),
            Err(err) => warn!(track = %key, error = %err, "failed to load artwork"),
        });
    if let Err(err) = spawned {
        warn!(error = %err, "failed to start artwork loader");
    }
}

fn glyph_of(tracker: &Weak<MediaSessionTracker>) -> TransportGlyph {
    tracker
        .upgrade()
        .map_or(TransportGlyph::NoMedia, |tracker| tracker.glyph())
}

fn subscribe_console(tracker: &Arc<MediaSessionTracker>) {
    let weak = Arc::downgrade(tracker);
    tracker.on_session_changed(move |changed| {
        info!(
            from = ?changed.previous,
            to = ?changed.current,
            glyph = ?glyph_of(&weak),
            "session changed"
        );
    });

    let weak = Arc::downgrade(tracker);
    tracker.on_playback_info_changed(move |playback| {
        info!(status = %playback.status, glyph = ?glyph_of(&weak), "playback changed");
    });

    let weak = Arc::downgrade(tracker);
    let artwork = ArtworkCache::default();
    tracker.on_media_properties_changed(move || {
        let Some(tracker) = weak.upgrade() else {
            return;
        };
        let snapshot = tracker.snapshot();
        info!(now_playing = %describe(&snapshot), glyph = ?snapshot.glyph(), "media properties changed");
        match snapshot.properties.as_ref().and_then(|props| artwork.needs_load(props)) {
            Some((key, thumbnail)) => load_artwork(key, thumbnail),
            None => debug!("no new artwork"),
        }
    });
}

fn run(args: Args) -> anyhow::Result<()> {
    let config = load_config(&args)?;
    logging::init(&config.logging.filter)?;

    let tracker = Arc::new(
        block_on(MediaSessionTracker::initialize(
            acquire_manager(),
            config.tracker_options(),
        ))
        .context("Failed to start media session tracking")?,
    );
    info!(detector = ?tracker.detector_kind(), "tracking media sessions");
    subscribe_console(&tracker);
    println!("{} [{:?}]", describe(&tracker.snapshot()), tracker.glyph());

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("Failed to read command")?;
        match parse_command(&line) {
            Some(Command::TogglePlayPause) => block_on(tracker.toggle_play_pause()),
            Some(Command::Next) => block_on(tracker.skip_next()),
            Some(Command::Previous) => block_on(tracker.skip_previous()),
            Some(Command::Status) => {
                println!("{} [{:?}]", describe(&tracker.snapshot()), tracker.glyph())
            }
            Some(Command::Quit) => break,
            None => println!("commands: p(lay/pause), n(ext), b(ack), s(tatus), q(uit)"),
        }
    }

    tracker.dispose();
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            eprintln!("media-tray: {err:#}");
            ExitCode::FAILURE
        }
    }
}
