mod args;
mod clipboard;
mod producer;

use anyhow::{Context, Result};
use args::Args;
use clap::Parser;
use clipboard::ChannelSink;
use pixpipe_display::{
    DeviceCaps, GlVersion, HeadlessDevice, HeadlessOptions, PngSnapshotSink, PresentConfig, Presenter,
    PresenterEvent, SnapshotSink,
};
use producer::Producer;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

fn init_logging(verbose: bool) -> Result<()> {
    let log_level = if verbose { "debug" } else { "info" };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("pixpipe_bench={},pixpipe_display={}", log_level, log_level).into()),
        )
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    Ok(())
}

fn load_config(args: &Args) -> Result<PresentConfig> {
    let mut config = match &args.config {
        Some(path) => PresentConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => PresentConfig::default(),
    };
    if let Some((width, height)) = args.mode {
        config.surface.width = width;
        config.surface.height = height;
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Summary written with `--report`.
#[derive(Debug, Default, Serialize)]
struct RunReport {
    mode: String,
    renderer: String,
    gl_version: String,
    degradations: Vec<String>,
    seconds: f64,
    frames: u64,
    fps: f64,
    uploaded_texels: u64,
    ticks: u64,
    rects_queued: u64,
    rects_coalesced: u64,
}

impl RunReport {
    fn record(&mut self, event: &PresenterEvent) {
        match event {
            PresenterEvent::RendererSelected { kind, version } => {
                info!("Renderer: {} (OpenGL {})", kind, version);
                self.renderer = kind.to_string();
                self.gl_version = version.to_string();
            }
            PresenterEvent::RendererDegraded { from, to, code } => {
                warn!("Renderer degraded from {} to {} (error {})", from, to, code);
                self.degradations.push(format!("{} -> {} ({})", from, to, code));
            }
            PresenterEvent::Stopped => info!("Render thread stopped"),
        }
    }

    fn write(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self).context("Failed to serialize report")?;
        std::fs::write(path, text).with_context(|| format!("Failed to write report to {}", path.display()))?;
        info!("Report written to {}", path.display());
        Ok(())
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose)?;

    info!("Starting pixpipe-bench {}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args)?;
    let caps = DeviceCaps {
        version: args.gl_version.unwrap_or(GlVersion::V3_0),
        max_texture_size: args.max_texture,
        ..DeviceCaps::default()
    };
    let (factory, probe) = HeadlessDevice::factory(HeadlessOptions {
        caps,
        record_calls: false,
        ..Default::default()
    });

    let (event_tx, events) = crossbeam_channel::unbounded();
    let (sink, snapshots) = ChannelSink::new();
    let mut presenter = Presenter::builder(factory)
        .config(config)
        .window_size(args.window.0, args.window.1)
        .snapshot_sink(Arc::new(sink))
        .events(event_tx)
        .build()?;
    presenter.start()?;

    let mut report = RunReport {
        mode: presenter.current_mode().to_string(),
        ..Default::default()
    };
    let mut producer = Producer::new(presenter.surface().size(), args.rects);
    let tick = Duration::from_millis(args.tick_ms.max(1));
    let started = Instant::now();
    let deadline = started + Duration::from_secs(args.duration);

    while Instant::now() < deadline {
        producer.tick(&presenter)?;
        for event in events.try_iter() {
            report.record(&event);
        }
        if !presenter.is_running() {
            warn!("Render thread exited before the run finished");
            break;
        }
        thread::sleep(tick);
    }

    if args.snapshot_dir.is_some() || args.clipboard {
        presenter.request_snapshot();
        match snapshots.recv_timeout(Duration::from_secs(2)) {
            Ok(snapshot) => {
                if args.clipboard {
                    if let Err(e) = clipboard::copy_to_clipboard(&snapshot) {
                        warn!("{:#}", e);
                    }
                }
                if let Some(dir) = &args.snapshot_dir {
                    std::fs::create_dir_all(dir)
                        .with_context(|| format!("Failed to create {}", dir.display()))?;
                    PngSnapshotSink::new(dir, "pixpipe").export(snapshot);
                }
            }
            Err(_) => warn!("No snapshot arrived"),
        }
    }

    let elapsed = started.elapsed();
    presenter.stop();
    for event in events.try_iter() {
        report.record(&event);
    }

    let stats = producer.stats();
    report.seconds = elapsed.as_secs_f64();
    report.frames = presenter.frames_presented();
    report.fps = report.frames as f64 / report.seconds.max(f64::EPSILON);
    report.uploaded_texels = probe.uploaded_texels();
    report.ticks = stats.ticks;
    report.rects_queued = stats.queued;
    report.rects_coalesced = stats.coalesced;

    info!(
        "{} frames in {:.2}s ({:.1} fps), {} texels uploaded, {} rects queued, {} coalesced",
        report.frames, report.seconds, report.fps, report.uploaded_texels, report.rects_queued, report.rects_coalesced
    );

    if let Some(path) = &args.report {
        report.write(path)?;
    }

    Ok(())
}
