//! The render thread.
//!
//! One thread per active display mode owns the graphics device and the
//! renderer. Each iteration it applies pending vsync and filter changes,
//! drains the dirty ring, uploads, composites and swaps. After the second
//! frame following a viewport change it sleeps until the producer signals.

use crate::config::PresentConfig;
use crate::error::{DisplayResult, ErrorReporter, ErrorSink, RenderError};
use crate::filter::FilterSlot;
use crate::gpu::{DeviceFactory, GlVersion, GraphicsDevice};
use crate::renderer::{build_renderer, select_renderer, PresentPass, Renderer, RendererKind, RendererPlan, RendererSetup};
use crate::shader::ShaderSourceProvider;
use crate::snapshot::{SnapshotRequest, SnapshotSink};
use crate::surface::LogicalSurface;
use crate::viewport::{SharedViewport, ViewportGeometry};
use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Notifications from the render thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenterEvent {
    RendererSelected { kind: RendererKind, version: GlVersion },
    RendererDegraded { from: RendererKind, to: RendererKind, code: u32 },
    Stopped,
}

/// State shared by the presenter and its render thread.
pub(crate) struct SharedState {
    pub viewport: SharedViewport,
    pub filter: FilterSlot,
    pub snapshot: SnapshotRequest,
    pub vsync: AtomicBool,
    pub frames: AtomicU64,
}

/// Wakes the render thread out of its idle wait.
#[derive(Debug, Clone)]
pub(crate) struct Wake {
    tx: Sender<()>,
}

impl Wake {
    pub fn new() -> (Self, Receiver<()>) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        (Self { tx }, rx)
    }

    /// Signal without blocking; a pending signal absorbs this one.
    pub fn signal(&self) {
        let _ = self.tx.try_send(());
    }
}

/// Everything a render thread needs.
pub(crate) struct RenderJob {
    pub factory: Arc<dyn DeviceFactory>,
    pub config: PresentConfig,
    pub surface: Arc<LogicalSurface>,
    pub shared: Arc<SharedState>,
    pub shaders: Arc<dyn ShaderSourceProvider>,
    pub error_sink: Arc<dyn ErrorSink>,
    pub snapshot_sink: Option<Arc<dyn SnapshotSink>>,
    pub events: Option<Sender<PresenterEvent>>,
    pub wake: Receiver<()>,
}

/// Handle to a running render thread.
pub(crate) struct RenderThread {
    handle: Option<JoinHandle<()>>,
    finish: Arc<AtomicBool>,
    wake: Wake,
}

impl RenderThread {
    pub fn spawn(job: RenderJob, wake: Wake) -> DisplayResult<Self> {
        let finish = Arc::new(AtomicBool::new(false));
        let thread_finish = finish.clone();
        let handle = std::thread::Builder::new()
            .name("pixpipe-render".into())
            .spawn(move || RenderLoop::run(job, thread_finish))?;
        Ok(Self {
            handle: Some(handle),
            finish,
            wake,
        })
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Ask the thread to finish and wait for it.
    pub fn stop(&mut self) {
        self.finish.store(true, Ordering::Release);
        self.wake.signal();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Render thread panicked");
            }
        }
    }
}

impl Drop for RenderThread {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Frames per second over one-second windows.
#[derive(Debug)]
struct FrameStats {
    window_start: Instant,
    frames: u32,
}

impl FrameStats {
    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            frames: 0,
        }
    }

    fn tick(&mut self) {
        self.frames += 1;
        let elapsed = self.window_start.elapsed();
        if elapsed >= Duration::from_secs(1) {
            let fps = self.frames as f64 / elapsed.as_secs_f64();
            debug!("Frame rate: {:.1} fps", fps);
            self.window_start = Instant::now();
            self.frames = 0;
        }
    }
}

/// The plan to try after `err` broke `plan`.
fn fallback(plan: &RendererPlan, err: &RenderError) -> Option<RendererPlan> {
    if err.code().is_fatal() {
        None
    } else if err.is_resource_exhaustion() {
        (plan.kind != RendererKind::Tiled).then(|| plan.lowest())
    } else if err.is_capability() {
        plan.degrade()
    } else {
        None
    }
}

struct RenderLoop {
    job: RenderJob,
    device: Box<dyn GraphicsDevice>,
    renderer: Option<Box<dyn Renderer>>,
    plan: RendererPlan,
    reporter: ErrorReporter,
    geometry: ViewportGeometry,
    vsync: Option<bool>,
    clear_frames: u32,
    stats: FrameStats,
}

impl RenderLoop {
    fn run(job: RenderJob, finish: Arc<AtomicBool>) {
        let mut reporter = ErrorReporter::new(job.error_sink.clone());
        let device = match job.factory.create() {
            Ok(device) => device,
            Err(err) => {
                error!("Failed to create graphics device: {}", err);
                reporter.report_error(&err);
                Self::notify(&job.events, PresenterEvent::Stopped);
                return;
            }
        };

        let caps = device.caps();
        info!(
            "Graphics device: GL {}, max texture {}, native RGB565: {}",
            caps.version, caps.max_texture_size, caps.native_rgb565
        );
        let plan = select_renderer(&caps, job.surface.size(), &job.config.renderer);

        let mut this = Self {
            geometry: *job.shared.viewport.snapshot().geometry(),
            job,
            device,
            renderer: None,
            plan,
            reporter,
            vsync: None,
            clear_frames: 0,
            stats: FrameStats::new(),
        };

        if this.install(plan) {
            while !finish.load(Ordering::Acquire) {
                if let Err(err) = this.frame() {
                    if !this.recover(err) {
                        break;
                    }
                    continue;
                }
                if this.clear_frames >= 2 && !finish.load(Ordering::Acquire) && this.job.wake.recv().is_err() {
                    break;
                }
            }
        }

        if let Some(renderer) = this.renderer.take() {
            renderer.teardown(this.device.as_mut());
        }
        debug!("Render thread finished");
        Self::notify(&this.job.events, PresenterEvent::Stopped);
    }

    fn notify(events: &Option<Sender<PresenterEvent>>, event: PresenterEvent) {
        if let Some(tx) = events {
            let _ = tx.try_send(event);
        }
    }

    fn setup(&self) -> RendererSetup {
        RendererSetup {
            surface: self.job.surface.size(),
            shaders: self.job.shaders.clone(),
            dirty_capacity: self.job.surface.dirty_queue().capacity(),
        }
    }

    /// Build `plan`, stepping down until something works. False if nothing does.
    fn install(&mut self, mut plan: RendererPlan) -> bool {
        let setup = self.setup();
        loop {
            match build_renderer(&plan, self.device.as_mut(), &setup) {
                Ok(renderer) => {
                    info!("Using {} renderer (GL {})", plan.kind, plan.version);
                    self.renderer = Some(renderer);
                    self.plan = plan;
                    Self::notify(
                        &self.job.events,
                        PresenterEvent::RendererSelected {
                            kind: plan.kind,
                            version: plan.version,
                        },
                    );
                    // A fresh renderer starts from nothing.
                    self.job.surface.invalidate();
                    self.job.shared.filter.mark_changed();
                    self.job.shared.viewport.request_refresh();
                    return true;
                }
                Err(err) => {
                    self.reporter.report_error(&err);
                    match fallback(&plan, &err) {
                        Some(next) => {
                            warn!("{} renderer unavailable ({}), trying {}", plan.kind, err, next.kind);
                            Self::notify(
                                &self.job.events,
                                PresenterEvent::RendererDegraded {
                                    from: plan.kind,
                                    to: next.kind,
                                    code: err.code().id(),
                                },
                            );
                            plan = next;
                        }
                        None => {
                            error!("No usable renderer: {}", err);
                            return false;
                        }
                    }
                }
            }
        }
    }

    /// Replace a renderer that failed mid-frame. False if the loop must exit.
    fn recover(&mut self, err: RenderError) -> bool {
        self.reporter.report_error(&err);
        let Some(next) = fallback(&self.plan, &err) else {
            if err.code().is_fatal() {
                error!("Graphics device unusable, render loop stopping: {}", err);
            } else {
                error!("Render loop stopping: {}", err);
            }
            return false;
        };
        warn!("{} renderer failed ({}), switching to {}", self.plan.kind, err, next.kind);
        Self::notify(
            &self.job.events,
            PresenterEvent::RendererDegraded {
                from: self.plan.kind,
                to: next.kind,
                code: err.code().id(),
            },
        );
        if let Some(renderer) = self.renderer.take() {
            renderer.teardown(self.device.as_mut());
        }
        self.install(next)
    }

    fn frame(&mut self) -> DisplayResult<()> {
        let Some(renderer) = self.renderer.as_mut() else {
            return Err(RenderError::NoMode);
        };
        let device = self.device.as_mut();
        let shared = &self.job.shared;

        let vsync = shared.vsync.load(Ordering::Acquire);
        if self.vsync != Some(vsync) {
            device.set_swap_interval(vsync);
            self.vsync = Some(vsync);
        }

        if let Some(filter) = shared.filter.take() {
            debug!("Applying filter {:?}", filter);
            renderer.set_filter(device, filter, &mut self.reporter)?;
            shared.viewport.request_refresh();
        }

        let mut regions = self.job.surface.drain();

        let viewport_changed = match shared.viewport.check_view() {
            Some(geometry) => {
                debug!("Viewport {}", geometry);
                self.geometry = geometry;
                self.clear_frames = 0;
                true
            }
            None => false,
        };
        let clear = self.clear_frames <= 1;
        self.clear_frames = self.clear_frames.saturating_add(1);

        {
            let pixels = self.job.surface.pixels();
            renderer.upload_dirty(device, &pixels, &mut regions)?;
        }

        let snapshot = shared.snapshot.take();
        let shot = match renderer.present(
            device,
            &PresentPass {
                viewport: &self.geometry,
                viewport_changed,
                clear,
                snapshot,
            },
        ) {
            Ok(shot) => shot,
            Err(err) => {
                // The replacement renderer captures it instead.
                if snapshot {
                    shared.snapshot.request();
                }
                return Err(err);
            }
        };
        if let Some(shot) = shot {
            match &self.job.snapshot_sink {
                Some(sink) => sink.export(shot),
                None => debug!("Snapshot taken without a sink, dropping"),
            }
        }

        device.present()?;
        shared.frames.fetch_add(1, Ordering::Release);
        self.stats.tick();
        Ok(())
    }
}
