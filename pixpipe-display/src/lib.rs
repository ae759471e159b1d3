//! # pixpipe-display: Incremental Surface Presentation
//!
//! This crate presents a 16-bit RGB565 software surface through OpenGL,
//! uploading only the regions a producer marked dirty. It scales the image
//! into the window with optional aspect lock, resamples it with selectable
//! interpolation and can run pixel-art upscalers on the GPU.
//!
//! ## Features
//!
//! - **Dirty-rectangle uploads**: a lock-free ring of modified regions that
//!   degrades to a full redraw on overflow
//! - **Three renderers**: fixed-function tiles, single-texture resampling and
//!   stencil-masked upscaling, picked from device capabilities
//! - **Graceful degradation**: capability and resource failures step down to
//!   a less capable renderer without stopping the pipeline
//! - **Headless device**: the full pipeline runs without a window for tests
//!   and benchmarks
//!
//! ## Example
//!
//! ```rust,no_run
//! use pixpipe_display::{HeadlessDevice, HeadlessOptions, Presenter, Interpolation};
//! use pixpipe_common::Rect;
//!
//! # fn example() -> pixpipe_display::DisplayResult<()> {
//! let (factory, _probe) = HeadlessDevice::factory(HeadlessOptions::default());
//! let mut presenter = Presenter::builder(factory).window_size(800, 600).build()?;
//! presenter.set_mode(640, 480)?;
//!
//! presenter.fill_rect(Rect::new(0, 0, 64, 64), 0xF800)?;
//! presenter.set_filter(Interpolation::Cubic, None);
//! presenter.stop();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dirty;
pub mod error;
pub mod filter;
pub mod gpu;
pub mod mode;
pub mod presenter;
mod render_thread;
pub mod renderer;
pub mod shader;
pub mod snapshot;
pub mod surface;
pub mod viewport;

pub use config::{ImageConfig, PresentConfig, RendererConfig, RendererPreference, SurfaceConfig, UpscaleFactors};
pub use dirty::{AppendOutcome, DirtyRegionQueue, DirtyRegions, UpdateRect};
pub use error::{ErrorCode, ErrorReporter, ErrorSink, RenderError, TracingErrorSink};
pub use filter::{Filter, FilterSlot, Interpolation, Upscale, UpscaleKind};
pub use gpu::{DeviceCaps, DeviceFactory, GlVersion, GraphicsDevice, HeadlessDevice, HeadlessOptions, HeadlessProbe};
pub use mode::{DisplayMode, MODE_CATALOG};
pub use presenter::{Presenter, PresenterBuilder, WindowState};
pub use render_thread::PresenterEvent;
pub use renderer::{RendererKind, RendererPlan};
pub use shader::{BuiltinShaders, ShaderLibrary, ShaderSourceProvider};
pub use snapshot::{Snapshot, SnapshotSink};
pub use surface::{LogicalSurface, SurfaceBuffer};
pub use viewport::{Viewport, ViewportCalculator, ViewportGeometry};

#[cfg(feature = "gl")]
pub use gpu::gl::{GlowDevice, PresentSurface};
#[cfg(feature = "screenshots")]
pub use snapshot::PngSnapshotSink;

pub use error::DisplayResult;
