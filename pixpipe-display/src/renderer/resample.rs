//! Single-texture renderer with interpolation programs.

use super::upload::Uploader;
use super::{textured_quads, PresentPass, Renderer, RendererKind};
use crate::dirty::DirtyRegions;
use crate::error::{DisplayResult, ErrorReporter};
use crate::filter::{Filter, Interpolation};
use crate::gpu::{
    BufferHandle, BufferUsage, ClearMask, GraphicsDevice, Primitive, ReadSource, ScaleFilter, TextureDesc,
    TextureHandle, VertexLayout,
};
use crate::shader::{pack_tex_size, GlslVersion, ShaderGroup, ShaderId, ShaderSourceProvider};
use crate::snapshot::Snapshot;
use crate::surface::SurfaceBuffer;
use pixpipe_common::{next_pow2, Size};
use tracing::debug;

pub(crate) fn sampling(interpolation: Interpolation) -> ScaleFilter {
    if interpolation.uses_linear_sampling() {
        ScaleFilter::Linear
    } else {
        ScaleFilter::Nearest
    }
}

/// The linear, hermite and cubic programs.
#[derive(Debug)]
struct InterpolationPrograms {
    linear: ShaderGroup,
    hermite: ShaderGroup,
    cubic: ShaderGroup,
}

impl InterpolationPrograms {
    fn new(
        device: &mut dyn GraphicsDevice,
        provider: &dyn ShaderSourceProvider,
        ladder: &[GlslVersion],
    ) -> DisplayResult<Self> {
        let linear = ShaderGroup::new(device, provider, ladder, ShaderId::Linear, None)?;
        let hermite = match ShaderGroup::new(device, provider, ladder, ShaderId::Hermite, None) {
            Ok(group) => group,
            Err(err) => {
                linear.destroy(device);
                return Err(err);
            }
        };
        let cubic = match ShaderGroup::new(device, provider, ladder, ShaderId::Cubic, None) {
            Ok(group) => group,
            Err(err) => {
                linear.destroy(device);
                hermite.destroy(device);
                return Err(err);
            }
        };
        Ok(Self { linear, hermite, cubic })
    }

    fn get(&self, id: ShaderId) -> &ShaderGroup {
        match id {
            ShaderId::Hermite => &self.hermite,
            ShaderId::Cubic => &self.cubic,
            _ => &self.linear,
        }
    }

    fn destroy(self, device: &mut dyn GraphicsDevice) {
        self.linear.destroy(device);
        self.hermite.destroy(device);
        self.cubic.destroy(device);
    }
}

/// Surface texture, quad buffer and interpolation programs.
///
/// The texture is square with a power-of-two edge. The quad buffer holds the
/// source quad at vertex 0 and the flipped render-target quad at vertex 4.
#[derive(Debug)]
pub(crate) struct QuadPipeline {
    surface: Size,
    texture: TextureHandle,
    tex_edge: u32,
    quad: BufferHandle,
    programs: InterpolationPrograms,
    interpolation: Interpolation,
    uploader: Uploader,
}

impl QuadPipeline {
    pub fn new(
        device: &mut dyn GraphicsDevice,
        provider: &dyn ShaderSourceProvider,
        surface: Size,
        ladder: &[GlslVersion],
        native_rgb565: bool,
    ) -> DisplayResult<Self> {
        let uploader = Uploader::new(native_rgb565);
        let tex_edge = next_pow2(surface.max_dimension());
        let texture = device.create_texture(&TextureDesc {
            size: Size::new(tex_edge, tex_edge),
            format: uploader.format(),
            filter: ScaleFilter::default(),
        })?;

        let extent = (
            surface.width as f32 / tex_edge as f32,
            surface.height as f32 / tex_edge as f32,
        );
        let vertices = textured_quads(surface, extent);
        let quad = match device.create_buffer(VertexLayout::Textured, BufferUsage::Static, 8, Some(&vertices)) {
            Ok(quad) => quad,
            Err(err) => {
                device.delete_texture(texture);
                return Err(err);
            }
        };

        let programs = match InterpolationPrograms::new(device, provider, ladder) {
            Ok(programs) => programs,
            Err(err) => {
                device.delete_buffer(quad);
                device.delete_texture(texture);
                return Err(err);
            }
        };

        debug!("Surface texture {}x{} for {:?}", tex_edge, tex_edge, surface);
        Ok(Self {
            surface,
            texture,
            tex_edge,
            quad,
            programs,
            interpolation: Interpolation::default(),
            uploader,
        })
    }

    pub fn surface(&self) -> Size {
        self.surface
    }

    pub fn texture(&self) -> TextureHandle {
        self.texture
    }

    pub fn quad(&self) -> BufferHandle {
        self.quad
    }

    pub fn interpolation(&self) -> Interpolation {
        self.interpolation
    }

    /// Packed size of the surface texture for the `texSize` uniform.
    pub fn tex_size(&self) -> u32 {
        pack_tex_size(self.tex_edge, self.tex_edge)
    }

    pub fn select(&mut self, interpolation: Interpolation) {
        self.interpolation = interpolation;
    }

    /// Program for the current interpolation.
    pub fn program(&self) -> &ShaderGroup {
        self.programs.get(ShaderId::for_interpolation(self.interpolation))
    }

    pub fn upload(
        &mut self,
        device: &mut dyn GraphicsDevice,
        pixels: &SurfaceBuffer,
        regions: &DirtyRegions,
    ) -> DisplayResult<()> {
        self.uploader.upload_regions(device, self.texture, pixels, regions)
    }

    /// Draw the surface texture straight to the backbuffer.
    pub fn present(&self, device: &mut dyn GraphicsDevice, pass: &PresentPass<'_>) -> DisplayResult<Option<Snapshot>> {
        let view = pass.viewport.rect;
        if pass.viewport_changed {
            device.set_viewport(view);
        }
        if pass.clear {
            device.clear(ClearMask::COLOR);
        }
        self.program().bind(device, self.tex_size());
        device.draw(self.quad, Some(self.texture), Primitive::TriangleFan, 0, 4);

        if !pass.snapshot {
            return Ok(None);
        }
        let data = device.read_pixels(ReadSource::Backbuffer(view))?;
        Ok(Some(Snapshot::new(view.width, view.height, data)))
    }

    pub fn destroy(self, device: &mut dyn GraphicsDevice) {
        self.programs.destroy(device);
        device.delete_buffer(self.quad);
        device.delete_texture(self.texture);
    }
}

#[derive(Debug)]
pub struct ResampleRenderer {
    pipeline: QuadPipeline,
}

impl ResampleRenderer {
    pub fn new(
        device: &mut dyn GraphicsDevice,
        provider: &dyn ShaderSourceProvider,
        surface: Size,
        ladder: &[GlslVersion],
        native_rgb565: bool,
    ) -> DisplayResult<Self> {
        Ok(Self {
            pipeline: QuadPipeline::new(device, provider, surface, ladder, native_rgb565)?,
        })
    }
}

impl Renderer for ResampleRenderer {
    fn kind(&self) -> RendererKind {
        RendererKind::Resample
    }

    fn set_filter(
        &mut self,
        device: &mut dyn GraphicsDevice,
        filter: Filter,
        _reporter: &mut ErrorReporter,
    ) -> DisplayResult<()> {
        if let Some(upscale) = filter.upscale {
            debug!("Upscaler {} needs the upscale renderer, ignoring", upscale);
        }
        self.pipeline.select(filter.interpolation);
        device.set_texture_filter(self.pipeline.texture(), sampling(filter.interpolation));
        Ok(())
    }

    fn upload_dirty(
        &mut self,
        device: &mut dyn GraphicsDevice,
        pixels: &SurfaceBuffer,
        regions: &mut DirtyRegions,
    ) -> DisplayResult<()> {
        self.pipeline.upload(device, pixels, regions)
    }

    fn present(&mut self, device: &mut dyn GraphicsDevice, pass: &PresentPass<'_>) -> DisplayResult<Option<Snapshot>> {
        self.pipeline.present(device, pass)
    }

    fn teardown(self: Box<Self>, device: &mut dyn GraphicsDevice) {
        self.pipeline.destroy(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TracingErrorSink;
    use crate::gpu::{DeviceCall, DeviceCaps, GlVersion, HeadlessDevice, HeadlessOptions};
    use crate::shader::BuiltinShaders;
    use crate::viewport::ViewportCalculator;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn renderer(options: HeadlessOptions) -> (HeadlessDevice, crate::gpu::HeadlessProbe, DisplayResult<ResampleRenderer>) {
        let (mut device, probe) = HeadlessDevice::new(options);
        let renderer = ResampleRenderer::new(
            &mut device,
            &BuiltinShaders,
            Size::new(640, 480),
            &[GlslVersion::V110],
            true,
        );
        (device, probe, renderer)
    }

    #[test]
    fn test_resources_created_and_freed() {
        let (mut device, probe, renderer) = renderer(HeadlessOptions::default());
        let renderer = renderer.unwrap();
        assert_eq!(probe.texture_sizes(), vec![Size::new(1024, 1024)]);
        assert_eq!(probe.live_programs(), vec!["cubic", "hermite", "linear"]);
        Box::new(renderer).teardown(&mut device);
        assert_eq!(probe.live_textures(), 0);
        assert_eq!(probe.live_buffers(), 0);
        assert!(probe.live_programs().is_empty());
    }

    #[test]
    fn test_partial_failure_releases_programs() {
        let (_, probe, renderer) = renderer(HeadlessOptions {
            failing_programs: vec!["cubic".into()],
            ..Default::default()
        });
        assert!(renderer.is_err());
        assert!(probe.live_programs().is_empty());
        assert_eq!(probe.live_textures(), 0);
        assert_eq!(probe.live_buffers(), 0);
    }

    #[test]
    fn test_cannot_build_without_shaders() {
        let (_, _, renderer) = renderer(HeadlessOptions::with_caps(DeviceCaps {
            version: GlVersion::V1_2,
            ..Default::default()
        }));
        assert!(renderer.unwrap_err().is_capability());
    }

    #[test]
    fn test_present_binds_selected_program() {
        let (mut device, probe, renderer) = renderer(HeadlessOptions::default());
        let mut renderer = renderer.unwrap();
        let mut reporter = ErrorReporter::new(Arc::new(TracingErrorSink));
        renderer
            .set_filter(&mut device, Filter::new(Interpolation::Cubic, None), &mut reporter)
            .unwrap();

        let geometry = ViewportCalculator::compute(Size::new(800, 600), Size::new(640, 480), true);
        probe.clear_calls();
        let shot = renderer
            .present(
                &mut device,
                &PresentPass {
                    viewport: &geometry,
                    viewport_changed: true,
                    clear: true,
                    snapshot: true,
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!((shot.width, shot.height), (800, 600));

        let calls = probe.calls();
        assert_eq!(calls[0], DeviceCall::Viewport(geometry.rect));
        assert!(calls.contains(&DeviceCall::UseProgram {
            name: "cubic".into(),
            tex_size: Some(pack_tex_size(1024, 1024)),
        }));
        assert!(calls.iter().any(|c| matches!(
            c,
            DeviceCall::Draw {
                primitive: Primitive::TriangleFan,
                first: 0,
                count: 4,
                ..
            }
        )));
    }
}
