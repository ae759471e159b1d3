//! Producer-facing handle to the presentation pipeline.
//!
//! A [`Presenter`] owns the logical surface and the render thread. Producers
//! write pixels, submit dirty rectangles and change settings from any thread;
//! every setter only publishes state and wakes the render thread, which
//! picks the change up on its next iteration.

use crate::config::PresentConfig;
use crate::dirty::{AppendOutcome, UpdateRect};
use crate::error::{DisplayResult, ErrorSink, TracingErrorSink};
use crate::filter::{Filter, FilterSlot, Interpolation, UpscaleKind};
use crate::gpu::DeviceFactory;
use crate::mode::DisplayMode;
use crate::render_thread::{PresenterEvent, RenderJob, RenderThread, SharedState, Wake};
use crate::shader::{BuiltinShaders, ShaderSourceProvider};
use crate::snapshot::{SnapshotRequest, SnapshotSink};
use crate::surface::{LogicalSurface, SurfaceBuffer};
use crate::viewport::{SharedViewport, Viewport};
use crossbeam_channel::{Receiver, Sender};
use pixpipe_common::{Point, Rect, Size};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Whether the output covers a window or the whole screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WindowState {
    #[default]
    Windowed,
    Fullscreen,
}

/// Builder for configuring a [`Presenter`]
pub struct PresenterBuilder {
    factory: Arc<dyn DeviceFactory>,
    config: PresentConfig,
    shaders: Arc<dyn ShaderSourceProvider>,
    error_sink: Arc<dyn ErrorSink>,
    snapshot_sink: Option<Arc<dyn SnapshotSink>>,
    events: Option<Sender<PresenterEvent>>,
    window: Option<Size>,
}

impl PresenterBuilder {
    pub fn new(factory: Arc<dyn DeviceFactory>) -> Self {
        Self {
            factory,
            config: PresentConfig::default(),
            shaders: Arc::new(BuiltinShaders),
            error_sink: Arc::new(TracingErrorSink),
            snapshot_sink: None,
            events: None,
            window: None,
        }
    }

    pub fn config(mut self, config: PresentConfig) -> Self {
        self.config = config;
        self
    }

    /// Source of shader programs, upscalers included.
    pub fn shader_provider(mut self, shaders: Arc<dyn ShaderSourceProvider>) -> Self {
        self.shaders = shaders;
        self
    }

    pub fn error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.error_sink = sink;
        self
    }

    pub fn snapshot_sink(mut self, sink: Arc<dyn SnapshotSink>) -> Self {
        self.snapshot_sink = Some(sink);
        self
    }

    /// Receive [`PresenterEvent`]s on `tx`. Events are dropped when it is full.
    pub fn events(mut self, tx: Sender<PresenterEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Initial window client size. Defaults to the mode size.
    pub fn window_size(mut self, width: u32, height: u32) -> Self {
        self.window = Some(Size::new(width, height));
        self
    }

    /// Build the presenter. The render thread is not started.
    pub fn build(self) -> DisplayResult<Presenter> {
        self.config.validate()?;
        let mode = self.config.initial_mode()?;
        let surface = Arc::new(LogicalSurface::new(mode, self.config.surface.dirty_capacity)?);
        let window = self.window.unwrap_or_else(|| mode.size());

        let viewport = Viewport::new(mode.size(), window, self.config.image.aspect);
        let shared = Arc::new(SharedState {
            viewport: SharedViewport::new(viewport),
            filter: FilterSlot::new(self.config.image.filter()),
            snapshot: SnapshotRequest::default(),
            vsync: AtomicBool::new(self.config.image.vsync),
            frames: AtomicU64::new(0),
        });
        let (wake, wake_rx) = Wake::new();

        debug!("Presenter created for {} in {}x{} window", mode, window.width, window.height);
        Ok(Presenter {
            config: self.config,
            factory: self.factory,
            shaders: self.shaders,
            error_sink: self.error_sink,
            snapshot_sink: self.snapshot_sink,
            events: self.events,
            shared,
            surface,
            wake,
            wake_rx,
            thread: None,
            window_state: WindowState::Windowed,
        })
    }
}

/// The presentation pipeline.
pub struct Presenter {
    config: PresentConfig,
    factory: Arc<dyn DeviceFactory>,
    shaders: Arc<dyn ShaderSourceProvider>,
    error_sink: Arc<dyn ErrorSink>,
    snapshot_sink: Option<Arc<dyn SnapshotSink>>,
    events: Option<Sender<PresenterEvent>>,
    shared: Arc<SharedState>,
    surface: Arc<LogicalSurface>,
    wake: Wake,
    wake_rx: Receiver<()>,
    thread: Option<RenderThread>,
    window_state: WindowState,
}

impl Presenter {
    /// A presenter with default collaborators and the given configuration.
    pub fn new(factory: Arc<dyn DeviceFactory>, config: PresentConfig) -> DisplayResult<Self> {
        PresenterBuilder::new(factory).config(config).build()
    }

    pub fn builder(factory: Arc<dyn DeviceFactory>) -> PresenterBuilder {
        PresenterBuilder::new(factory)
    }

    pub fn config(&self) -> &PresentConfig {
        &self.config
    }

    /// Switch to a catalog mode of the given size.
    pub fn set_mode(&mut self, width: u32, height: u32) -> DisplayResult<()> {
        let mode = DisplayMode::find(width, height)?;
        self.apply_mode(mode)
    }

    /// Switch to a catalog mode, matching depth too.
    pub fn set_display_mode(&mut self, width: u32, height: u32, bits_per_pixel: u32) -> DisplayResult<()> {
        let mode = DisplayMode::find_exact(width, height, bits_per_pixel)?;
        self.apply_mode(mode)
    }

    fn apply_mode(&mut self, mode: DisplayMode) -> DisplayResult<()> {
        info!("Setting display mode {}", mode);
        self.stop();
        self.surface = Arc::new(LogicalSurface::new(mode, self.config.surface.dirty_capacity)?);
        self.shared
            .viewport
            .update(|v| v.set_mode_size(mode.width, mode.height));
        self.start()
    }

    pub fn current_mode(&self) -> DisplayMode {
        self.surface.mode()
    }

    /// Start the render thread if it is not running.
    pub fn start(&mut self) -> DisplayResult<()> {
        if self.thread.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }
        // Reap a thread that exited on its own.
        self.stop();

        self.shared.filter.mark_changed();
        self.shared.viewport.request_refresh();
        // Drop a stale signal so the first idle wait is a real one.
        let _ = self.wake_rx.try_recv();

        let job = RenderJob {
            factory: self.factory.clone(),
            config: self.config.clone(),
            surface: self.surface.clone(),
            shared: self.shared.clone(),
            shaders: self.shaders.clone(),
            error_sink: self.error_sink.clone(),
            snapshot_sink: self.snapshot_sink.clone(),
            events: self.events.clone(),
            wake: self.wake_rx.clone(),
        };
        self.thread = Some(RenderThread::spawn(job, self.wake.clone())?);
        debug!("Render thread started");
        Ok(())
    }

    /// Stop the render thread and release its GPU resources.
    pub fn stop(&mut self) {
        if let Some(mut thread) = self.thread.take() {
            thread.stop();
            debug!("Render thread stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn window_state(&self) -> WindowState {
        self.window_state
    }

    /// Move between windowed and fullscreen. Restarts a running render thread.
    pub fn set_window_state(&mut self, state: WindowState) -> DisplayResult<()> {
        if self.window_state == state {
            return Ok(());
        }
        let running = self.is_running();
        self.stop();
        self.window_state = state;
        self.shared
            .viewport
            .update(|v| v.set_fullscreen(state == WindowState::Fullscreen));
        if running {
            self.start()?;
        }
        Ok(())
    }

    /// The current surface. Replaced on every mode change.
    pub fn surface(&self) -> Arc<LogicalSurface> {
        self.surface.clone()
    }

    /// Mark a region as modified.
    pub fn submit_dirty_rect(&self, rect: Rect) -> AppendOutcome {
        let outcome = self.surface.submit(UpdateRect::from_rect(rect));
        self.wake.signal();
        outcome
    }

    /// Copy tightly packed pixels into `rect` and mark it modified.
    pub fn write_pixels(&self, rect: Rect, pixels: &[u16]) -> DisplayResult<AppendOutcome> {
        let outcome = self.surface.write_rect(rect, pixels)?;
        self.wake.signal();
        Ok(outcome)
    }

    pub fn fill_rect(&self, rect: Rect, pixel: u16) -> DisplayResult<AppendOutcome> {
        let outcome = self.surface.fill_rect(rect, pixel)?;
        self.wake.signal();
        Ok(outcome)
    }

    /// Edit the surface directly. Changed regions must be submitted separately.
    pub fn with_pixels_mut<R>(&self, f: impl FnOnce(&mut SurfaceBuffer) -> R) -> R {
        let mut pixels = self.surface.pixels_mut();
        f(&mut pixels)
    }

    /// Select interpolation and an optional upscaler. Factors are normalized
    /// to the configured maximum and the upscaler's supported set.
    pub fn set_filter(&self, interpolation: Interpolation, upscale: Option<(UpscaleKind, u32)>) {
        let upscale = upscale.map(|(kind, factor)| self.config.image.upscale_for(kind, factor));
        let filter = Filter::new(interpolation, upscale);
        debug!("Filter requested: {:?}", filter);
        self.shared.filter.set(filter);
        self.wake.signal();
    }

    /// The most recently requested filter.
    pub fn filter(&self) -> Filter {
        self.shared.filter.current()
    }

    /// Capture the next frame into the snapshot sink.
    pub fn request_snapshot(&self) {
        self.shared.snapshot.request();
        self.wake.signal();
    }

    pub fn set_window_size(&self, width: u32, height: u32) {
        self.shared.viewport.update(|v| v.set_window_size(width, height));
        self.wake.signal();
    }

    pub fn set_vsync(&self, vsync: bool) {
        self.shared.vsync.store(vsync, Ordering::Release);
        self.wake.signal();
    }

    pub fn set_aspect_lock(&self, locked: bool) {
        self.shared.viewport.update(|v| v.set_aspect_lock(locked));
        self.wake.signal();
    }

    /// Map a window position to surface coordinates.
    pub fn map_cursor(&self, point: Point) -> Point {
        self.shared.viewport.map_cursor(point)
    }

    /// Area the OS cursor should be confined to, if any.
    pub fn cursor_clip(&self) -> Option<Rect> {
        self.shared.viewport.cursor_clip()
    }

    /// Current viewport state.
    pub fn viewport(&self) -> Viewport {
        self.shared.viewport.snapshot()
    }

    pub fn frames_presented(&self) -> u64 {
        self.shared.frames.load(Ordering::Acquire)
    }
}

impl Drop for Presenter {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RenderError;
    use crate::filter::Upscale;
    use crate::gpu::{HeadlessDevice, HeadlessOptions};
    use pretty_assertions::assert_eq;

    fn presenter() -> Presenter {
        let (factory, _) = HeadlessDevice::factory(HeadlessOptions::default());
        Presenter::builder(factory)
            .window_size(800, 600)
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_defaults() {
        let presenter = presenter();
        assert!(!presenter.is_running());
        assert_eq!(presenter.current_mode().size(), Size::new(640, 480));
        assert_eq!(presenter.window_state(), WindowState::Windowed);
        assert_eq!(presenter.frames_presented(), 0);
    }

    #[test]
    fn test_set_filter_normalizes_factor() {
        let presenter = presenter();
        presenter.set_filter(Interpolation::Hermite, Some((UpscaleKind::Xbrz, 5)));
        assert_eq!(
            presenter.filter(),
            Filter::new(
                Interpolation::Hermite,
                Some(presenter.config().image.upscale_for(UpscaleKind::Xbrz, 5))
            )
        );
        presenter.set_filter(Interpolation::Nearest, None);
        assert_eq!(presenter.filter().upscale, None::<Upscale>);
    }

    #[test]
    fn test_invalid_mode_keeps_surface() {
        let mut presenter = presenter();
        let err = presenter.set_mode(123, 45).unwrap_err();
        assert!(matches!(err, RenderError::InvalidMode { .. }));
        assert_eq!(presenter.current_mode().size(), Size::new(640, 480));
        assert!(!presenter.is_running());
    }

    #[test]
    fn test_cursor_mapping_before_first_frame() {
        let presenter = presenter();
        // Geometry is computed lazily by the render thread; until then
        // the identity mapping applies.
        assert_eq!(presenter.map_cursor(Point::new(10, 20)), Point::new(10, 20));
        assert_eq!(presenter.cursor_clip(), None);
    }

    #[test]
    fn test_cursor_mapping_before_first_frame_stays_on_surface() {
        let presenter = presenter();
        assert_eq!(presenter.map_cursor(Point::new(1000, 900)), Point::new(639, 479));
        assert_eq!(presenter.map_cursor(Point::new(-5, -1)), Point::new(0, 0));
        assert_eq!(presenter.map_cursor(Point::new(639, -3)), Point::new(639, 0));
    }

    #[test]
    fn test_dirty_submission_outside_surface_is_ignored() {
        let presenter = presenter();
        assert_eq!(
            presenter.submit_dirty_rect(Rect::new(700, 500, 10, 10)),
            AppendOutcome::Ignored
        );
        assert_eq!(
            presenter.submit_dirty_rect(Rect::new(0, 0, 10, 10)),
            AppendOutcome::Queued
        );
    }
}
