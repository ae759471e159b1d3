//! Resample renderer with a pixel-art upscale pass.
//!
//! With an upscaler selected each frame runs two passes:
//!
//! 1. Surface texture → offscreen target at `factor ×` the surface size,
//!    through the upscale program. Unless the whole surface changed, the
//!    dirty rectangles are first written to the stencil buffer and the pass
//!    only touches pixels under them; the rest of the target keeps the
//!    previous frame.
//! 2. Offscreen colour texture → backbuffer through the interpolation program.
//!
//! Without an upscaler it behaves exactly like the resample renderer.

use super::resample::{sampling, QuadPipeline};
use super::{ortho, PresentPass, Renderer, RendererKind};
use crate::dirty::DirtyRegions;
use crate::error::{DisplayResult, ErrorReporter};
use crate::filter::{Filter, Upscale};
use crate::gpu::{
    BufferHandle, BufferUsage, ClearMask, GraphicsDevice, OffscreenTarget, Primitive, ReadSource, RenderTarget,
    ScaleFilter, StencilMode, VertexLayout,
};
use crate::shader::{pack_tex_size, GlslVersion, ShaderGroup, ShaderId, ShaderSourceProvider};
use crate::snapshot::Snapshot;
use crate::surface::SurfaceBuffer;
use pixpipe_common::{Rect, Size};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

const STENCIL_REF: u8 = 1;
const POINTS_PER_RECT: usize = 6;

/// Stream buffer of stencil triangles, six points per dirty rectangle.
struct StencilBuffer {
    buffer: BufferHandle,
    capacity: usize,
    scratch: Vec<f32>,
}

impl StencilBuffer {
    fn new(device: &mut dyn GraphicsDevice, capacity: usize) -> DisplayResult<Self> {
        let buffer = device.create_buffer(
            VertexLayout::Position2d,
            BufferUsage::Stream,
            capacity * POINTS_PER_RECT,
            None,
        )?;
        Ok(Self {
            buffer,
            capacity,
            scratch: Vec::with_capacity(capacity * POINTS_PER_RECT * 2),
        })
    }

    /// Write two triangles per active region. Returns the vertex count, or
    /// `None` when the regions do not fit.
    fn fill(&mut self, device: &mut dyn GraphicsDevice, regions: &DirtyRegions) -> DisplayResult<Option<u32>> {
        if regions.len() > self.capacity {
            return Ok(None);
        }
        self.scratch.clear();
        for rect in regions.iter() {
            let (l, t) = (rect.left as f32, rect.top as f32);
            let (r, b) = (rect.right as f32, rect.bottom as f32);
            self.scratch
                .extend_from_slice(&[l, t, r, t, r, b, l, t, r, b, l, b]);
        }
        device.update_buffer(self.buffer, &self.scratch)?;
        Ok(Some((self.scratch.len() / 2) as u32))
    }
}

/// What the upscale pass does this frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpscalePass {
    Skip,
    Full,
    Stenciled,
}

pub struct UpscaleRenderer {
    pipeline: QuadPipeline,
    provider: Arc<dyn ShaderSourceProvider>,
    ladder: Vec<GlslVersion>,
    stencil_program: ShaderGroup,
    upscalers: HashMap<ShaderId, ShaderGroup>,
    active: Option<Upscale>,
    offscreen: Option<OffscreenTarget>,
    stencil: Option<StencilBuffer>,
    dirty_capacity: usize,
    needs_full: bool,
    pass: UpscalePass,
}

impl UpscaleRenderer {
    pub fn new(
        device: &mut dyn GraphicsDevice,
        provider: Arc<dyn ShaderSourceProvider>,
        surface: Size,
        ladder: Vec<GlslVersion>,
        native_rgb565: bool,
        dirty_capacity: usize,
    ) -> DisplayResult<Self> {
        let pipeline = QuadPipeline::new(device, provider.as_ref(), surface, &ladder, native_rgb565)?;
        let stencil_program =
            match ShaderGroup::new(device, provider.as_ref(), &ladder, ShaderId::Stencil, Some(ortho(surface))) {
                Ok(group) => group,
                Err(err) => {
                    pipeline.destroy(device);
                    return Err(err);
                }
            };
        Ok(Self {
            pipeline,
            provider,
            ladder,
            stencil_program,
            upscalers: HashMap::new(),
            active: None,
            offscreen: None,
            stencil: None,
            dirty_capacity,
            needs_full: false,
            pass: UpscalePass::Skip,
        })
    }

    /// The upscaler in effect, if any.
    pub fn active_upscale(&self) -> Option<Upscale> {
        self.active
    }

    pub fn offscreen(&self) -> Option<OffscreenTarget> {
        self.offscreen
    }

    fn leave_upscale(&mut self, device: &mut dyn GraphicsDevice) {
        if self.active.take().is_some() {
            debug!("Leaving upscale mode");
        }
        if let Some(target) = self.offscreen.take() {
            device.delete_target(target);
        }
    }

    /// Compile the program for `upscale` unless cached.
    fn ensure_program(&mut self, device: &mut dyn GraphicsDevice, upscale: Upscale) -> DisplayResult<()> {
        let id = ShaderId::for_upscale(upscale);
        if self.upscalers.contains_key(&id) {
            return Ok(());
        }
        let group = ShaderGroup::new(device, self.provider.as_ref(), &self.ladder, id, None)?;
        self.upscalers.insert(id, group);
        Ok(())
    }

    fn enter_upscale(&mut self, device: &mut dyn GraphicsDevice, upscale: Upscale) -> DisplayResult<()> {
        let size = self.pipeline.surface().scaled(upscale.factor);
        if self.offscreen.map(|t| t.size) != Some(size) {
            if let Some(old) = self.offscreen.take() {
                device.delete_target(old);
            }
            self.offscreen = Some(device.create_target(size)?);
            self.needs_full = true;
        }
        // Regions kept from the previous upscaler would mix with the new one.
        if self.active != Some(upscale) {
            self.needs_full = true;
        }
        if self.stencil.is_none() {
            self.stencil = Some(StencilBuffer::new(device, self.dirty_capacity)?);
        }
        self.active = Some(upscale);
        info!("Upscaling with {} to {}x{}", upscale, size.width, size.height);
        Ok(())
    }

    fn stencil_pass(&mut self, device: &mut dyn GraphicsDevice, regions: &DirtyRegions) -> DisplayResult<UpscalePass> {
        let Some(stencil) = self.stencil.as_mut() else {
            return Ok(UpscalePass::Full);
        };
        let Some(count) = stencil.fill(device, regions)? else {
            return Ok(UpscalePass::Full);
        };
        device.clear(ClearMask::STENCIL);
        device.set_stencil(StencilMode::Write { reference: STENCIL_REF });
        self.stencil_program.bind(device, 0);
        device.draw(stencil.buffer, None, Primitive::Triangles, 0, count);
        device.set_stencil(StencilMode::Test { reference: STENCIL_REF });
        Ok(UpscalePass::Stenciled)
    }
}

impl Renderer for UpscaleRenderer {
    fn kind(&self) -> RendererKind {
        RendererKind::Upscale
    }

    fn set_filter(
        &mut self,
        device: &mut dyn GraphicsDevice,
        filter: Filter,
        reporter: &mut ErrorReporter,
    ) -> DisplayResult<()> {
        self.pipeline.select(filter.interpolation);

        match filter.upscale {
            Some(upscale) => match self.ensure_program(device, upscale) {
                Ok(()) => self.enter_upscale(device, upscale)?,
                Err(err) if err.is_capability() => {
                    warn!("Upscaler {} unavailable: {}", upscale, err);
                    reporter.report_error(&err);
                    self.leave_upscale(device);
                }
                Err(err) => return Err(err),
            },
            None => self.leave_upscale(device),
        }

        // Upscalers read exact source texels.
        let source_filter = if self.active.is_some() {
            ScaleFilter::Nearest
        } else {
            sampling(filter.interpolation)
        };
        device.set_texture_filter(self.pipeline.texture(), source_filter);
        if let Some(target) = self.offscreen {
            device.set_texture_filter(target.color, sampling(filter.interpolation));
        }
        Ok(())
    }

    fn upload_dirty(
        &mut self,
        device: &mut dyn GraphicsDevice,
        pixels: &SurfaceBuffer,
        regions: &mut DirtyRegions,
    ) -> DisplayResult<()> {
        if std::mem::take(&mut self.needs_full) {
            regions.force_full();
        }
        self.pass = UpscalePass::Skip;

        if let (Some(_), Some(target)) = (self.active, self.offscreen) {
            device.bind_target(RenderTarget::Offscreen(target.handle));
            device.set_viewport(Rect::from_size(target.size));
            self.pass = if regions.is_empty() {
                UpscalePass::Skip
            } else if regions.is_full() {
                UpscalePass::Full
            } else {
                self.stencil_pass(device, regions)?
            };
        }

        self.pipeline.upload(device, pixels, regions)
    }

    fn present(&mut self, device: &mut dyn GraphicsDevice, pass: &PresentPass<'_>) -> DisplayResult<Option<Snapshot>> {
        let (Some(upscale), Some(target)) = (self.active, self.offscreen) else {
            return self.pipeline.present(device, pass);
        };

        if self.pass != UpscalePass::Skip {
            if let Some(program) = self.upscalers.get(&ShaderId::for_upscale(upscale)) {
                program.bind(device, self.pipeline.tex_size());
                device.draw(
                    self.pipeline.quad(),
                    Some(self.pipeline.texture()),
                    Primitive::TriangleFan,
                    0,
                    4,
                );
            }
        }
        if self.pass == UpscalePass::Stenciled {
            device.set_stencil(StencilMode::Disabled);
        }

        device.bind_target(RenderTarget::Backbuffer);
        device.set_viewport(pass.viewport.rect);
        if pass.clear {
            device.clear(ClearMask::COLOR);
        }
        self.pipeline
            .program()
            .bind(device, pack_tex_size(target.size.width, target.size.height));
        device.draw(self.pipeline.quad(), Some(target.color), Primitive::TriangleFan, 4, 4);

        if !pass.snapshot {
            return Ok(None);
        }
        let data = device.read_pixels(ReadSource::Offscreen(target))?;
        Ok(Some(Snapshot::new(target.size.width, target.size.height, data)))
    }

    fn teardown(mut self: Box<Self>, device: &mut dyn GraphicsDevice) {
        self.leave_upscale(device);
        if let Some(stencil) = self.stencil.take() {
            device.delete_buffer(stencil.buffer);
        }
        for (_, group) in self.upscalers.drain() {
            group.destroy(device);
        }
        let this = *self;
        this.stencil_program.destroy(device);
        this.pipeline.destroy(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dirty::{DirtyRegionQueue, UpdateRect};
    use crate::error::{ErrorCode, ErrorSink};
    use crate::filter::{Interpolation, UpscaleKind};
    use crate::gpu::{DeviceCall, HeadlessDevice, HeadlessOptions, HeadlessProbe};
    use crate::shader::ShaderLibrary;
    use crate::viewport::ViewportCalculator;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::panic::Location;

    #[derive(Default)]
    struct CollectingSink(Mutex<Vec<ErrorCode>>);

    impl ErrorSink for CollectingSink {
        fn report(&self, code: ErrorCode, _location: &'static Location<'static>) {
            self.0.lock().push(code);
        }
    }

    const SURFACE: Size = Size {
        width: 320,
        height: 240,
    };

    fn library() -> Arc<dyn ShaderSourceProvider> {
        let mut library = ShaderLibrary::new();
        library.insert_upscaler(
            UpscaleKind::ScaleNx,
            2,
            "uniform sampler2D tex01;\nvarying vec2 fTexCoord;\nvoid main() { gl_FragColor = texture2D(tex01, fTexCoord); }\n",
        );
        Arc::new(library)
    }

    fn setup() -> (HeadlessDevice, HeadlessProbe, UpscaleRenderer) {
        let (mut device, probe) = HeadlessDevice::new(HeadlessOptions::default());
        let renderer = UpscaleRenderer::new(
            &mut device,
            library(),
            SURFACE,
            vec![GlslVersion::V130, GlslVersion::V110],
            true,
            16,
        )
        .unwrap();
        (device, probe, renderer)
    }

    fn scale2x() -> Filter {
        Filter::new(
            Interpolation::Linear,
            Some(Upscale {
                kind: UpscaleKind::ScaleNx,
                factor: 2,
            }),
        )
    }

    fn present(renderer: &mut UpscaleRenderer, device: &mut HeadlessDevice, snapshot: bool) -> Option<Snapshot> {
        let geometry = ViewportCalculator::compute(Size::new(640, 480), SURFACE, true);
        renderer
            .present(
                device,
                &PresentPass {
                    viewport: &geometry,
                    viewport_changed: false,
                    clear: false,
                    snapshot,
                },
            )
            .unwrap()
    }

    fn partial_regions() -> DirtyRegions {
        let queue = DirtyRegionQueue::new(SURFACE, 16);
        let _ = queue.drain();
        queue.append(UpdateRect::new(10, 10, 20, 20));
        queue.drain()
    }

    #[test]
    fn test_enter_upscale_allocates_target_and_forces_full() {
        let (mut device, probe, mut renderer) = setup();
        let mut reporter = ErrorReporter::new(Arc::new(CollectingSink::default()));
        renderer.set_filter(&mut device, scale2x(), &mut reporter).unwrap();

        let target = renderer.offscreen().unwrap();
        assert_eq!(target.size, Size::new(640, 480));
        assert_eq!(probe.live_targets(), 1);

        let pixels = SurfaceBuffer::new(SURFACE.width, SURFACE.height);
        let mut regions = partial_regions();
        probe.clear_calls();
        renderer.upload_dirty(&mut device, &pixels, &mut regions).unwrap();
        assert!(regions.is_full());
        // A full redraw needs no stencil.
        assert!(!probe.calls().iter().any(|c| matches!(c, DeviceCall::Stencil(_))));
    }

    #[test]
    fn test_switching_upscaler_forces_full_redraw() {
        let (mut device, recorded) = HeadlessDevice::new(HeadlessOptions::default());
        let mut library = ShaderLibrary::new();
        let source = "uniform sampler2D tex01;\nvarying vec2 fTexCoord;\nvoid main() { gl_FragColor = texture2D(tex01, fTexCoord); }\n";
        library.insert_upscaler(UpscaleKind::ScaleNx, 2, source);
        library.insert_upscaler(UpscaleKind::Eagle, 2, source);
        let mut renderer = UpscaleRenderer::new(
            &mut device,
            Arc::new(library),
            SURFACE,
            vec![GlslVersion::V130, GlslVersion::V110],
            true,
            16,
        )
        .unwrap();
        let mut reporter = ErrorReporter::new(Arc::new(CollectingSink::default()));
        let pixels = SurfaceBuffer::new(SURFACE.width, SURFACE.height);

        renderer.set_filter(&mut device, scale2x(), &mut reporter).unwrap();
        let target = renderer.offscreen().unwrap();
        renderer
            .upload_dirty(&mut device, &pixels, &mut DirtyRegions::full(SURFACE))
            .unwrap();
        let _ = present(&mut renderer, &mut device, false);

        let eagle = Filter::new(
            Interpolation::Linear,
            Some(Upscale {
                kind: UpscaleKind::Eagle,
                factor: 2,
            }),
        );
        renderer.set_filter(&mut device, eagle, &mut reporter).unwrap();
        assert_eq!(renderer.offscreen(), Some(target));

        recorded.clear_calls();
        let mut regions = partial_regions();
        renderer.upload_dirty(&mut device, &pixels, &mut regions).unwrap();
        assert!(regions.is_full());
        assert!(!recorded.calls().iter().any(|c| matches!(c, DeviceCall::Stencil(_))));

        // The same upscaler again keeps partial updates.
        let _ = present(&mut renderer, &mut device, false);
        renderer.set_filter(&mut device, eagle, &mut reporter).unwrap();
        let mut regions = partial_regions();
        renderer.upload_dirty(&mut device, &pixels, &mut regions).unwrap();
        assert!(!regions.is_full());
    }

    #[test]
    fn test_partial_update_uses_stencil() {
        let (mut device, probe, mut renderer) = setup();
        let mut reporter = ErrorReporter::new(Arc::new(CollectingSink::default()));
        renderer.set_filter(&mut device, scale2x(), &mut reporter).unwrap();
        let pixels = SurfaceBuffer::new(SURFACE.width, SURFACE.height);
        let mut first = DirtyRegions::full(SURFACE);
        renderer.upload_dirty(&mut device, &pixels, &mut first).unwrap();
        let _ = present(&mut renderer, &mut device, false);

        probe.clear_calls();
        let mut regions = partial_regions();
        renderer.upload_dirty(&mut device, &pixels, &mut regions).unwrap();
        let _ = present(&mut renderer, &mut device, false);

        let stencil: Vec<StencilMode> = probe
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                DeviceCall::Stencil(mode) => Some(mode),
                _ => None,
            })
            .collect();
        assert_eq!(
            stencil,
            vec![
                StencilMode::Write { reference: 1 },
                StencilMode::Test { reference: 1 },
                StencilMode::Disabled,
            ]
        );
        let draws: Vec<(Primitive, u32, u32)> = probe
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                DeviceCall::Draw {
                    primitive, first, count, ..
                } => Some((primitive, first, count)),
                _ => None,
            })
            .collect();
        assert_eq!(
            draws,
            vec![
                (Primitive::Triangles, 0, 6),
                (Primitive::TriangleFan, 0, 4),
                (Primitive::TriangleFan, 4, 4),
            ]
        );
    }

    #[test]
    fn test_missing_upscaler_reports_once_and_falls_back() {
        let (mut device, probe, mut renderer) = setup();
        let sink = Arc::new(CollectingSink::default());
        let mut reporter = ErrorReporter::new(sink.clone());
        let xbrz = Filter::new(
            Interpolation::Linear,
            Some(Upscale {
                kind: UpscaleKind::Xbrz,
                factor: 4,
            }),
        );
        renderer.set_filter(&mut device, xbrz, &mut reporter).unwrap();
        renderer.set_filter(&mut device, xbrz, &mut reporter).unwrap();

        assert_eq!(renderer.active_upscale(), None);
        assert_eq!(probe.live_targets(), 0);
        assert_eq!(*sink.0.lock(), vec![ErrorCode::ShaderSourceMissing]);
    }

    #[test]
    fn test_leaving_upscale_frees_target_once() {
        let (mut device, probe, mut renderer) = setup();
        let mut reporter = ErrorReporter::new(Arc::new(CollectingSink::default()));
        renderer.set_filter(&mut device, scale2x(), &mut reporter).unwrap();
        probe.clear_calls();
        renderer
            .set_filter(&mut device, Filter::new(Interpolation::Cubic, None), &mut reporter)
            .unwrap();
        renderer
            .set_filter(&mut device, Filter::new(Interpolation::Linear, None), &mut reporter)
            .unwrap();
        let deletes = probe
            .calls()
            .iter()
            .filter(|c| matches!(c, DeviceCall::DeleteTarget(_)))
            .count();
        assert_eq!(deletes, 1);
        assert_eq!(probe.live_targets(), 0);
    }

    #[test]
    fn test_snapshot_reads_offscreen_target() {
        let (mut device, _probe, mut renderer) = setup();
        let mut reporter = ErrorReporter::new(Arc::new(CollectingSink::default()));
        renderer.set_filter(&mut device, scale2x(), &mut reporter).unwrap();
        let pixels = SurfaceBuffer::new(SURFACE.width, SURFACE.height);
        let mut regions = DirtyRegions::full(SURFACE);
        renderer.upload_dirty(&mut device, &pixels, &mut regions).unwrap();
        let shot = present(&mut renderer, &mut device, true).unwrap();
        assert_eq!((shot.width, shot.height), (640, 480));
        assert_eq!(shot.data.len(), 640 * 480 * 3);
    }

    #[test]
    fn test_teardown_frees_everything() {
        let (mut device, probe, mut renderer) = setup();
        let mut reporter = ErrorReporter::new(Arc::new(CollectingSink::default()));
        renderer.set_filter(&mut device, scale2x(), &mut reporter).unwrap();
        Box::new(renderer).teardown(&mut device);
        assert_eq!(probe.live_textures(), 0);
        assert_eq!(probe.live_buffers(), 0);
        assert_eq!(probe.live_targets(), 0);
        assert!(probe.live_programs().is_empty());
    }
}
