//! Presentation strategies.
//!
//! One [`Renderer`] is active per display mode. Which one is decided once by
//! [`select_renderer`] from the device capabilities and the configuration:
//!
//! - [`TiledRenderer`]: fixed-function textured quads, one texture per tile.
//! - [`ResampleRenderer`]: one texture, one quad, an interpolation program.
//! - [`UpscaleRenderer`]: resample plus a pixel-art upscale pass into an
//!   offscreen target, redrawn only under the dirty rectangles via stencil.
//!
//! When a renderer fails the render thread steps down with
//! [`RendererPlan::degrade`] or jumps straight to tiled on resource exhaustion.

mod resample;
mod tiled;
mod upload;
mod upscale;

pub use resample::ResampleRenderer;
pub use tiled::{tile_layout, TileLayout, TiledRenderer, MIN_TILE_EDGE};
pub use upload::grow_to_even;
pub use upscale::UpscaleRenderer;

use crate::config::{RendererConfig, RendererPreference};
use crate::dirty::DirtyRegions;
use crate::error::{DisplayResult, ErrorReporter};
use crate::filter::Filter;
use crate::gpu::{DeviceCaps, GlVersion, GraphicsDevice};
use crate::shader::{GlslVersion, ShaderSourceProvider};
use crate::snapshot::Snapshot;
use crate::surface::SurfaceBuffer;
use crate::viewport::ViewportGeometry;
use pixpipe_common::{next_pow2, Size};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// The three presentation strategies, least capable first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RendererKind {
    Tiled,
    Resample,
    Upscale,
}

impl fmt::Display for RendererKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tiled => write!(f, "tiled"),
            Self::Resample => write!(f, "resample"),
            Self::Upscale => write!(f, "upscale"),
        }
    }
}

/// Outcome of the capability probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RendererPlan {
    pub kind: RendererKind,
    /// Effective capability tier after caps and configuration.
    pub version: GlVersion,
    /// Upload RGB565 directly instead of expanding on the CPU.
    pub native_rgb565: bool,
}

impl RendererPlan {
    /// The next less capable plan, `None` below tiled.
    pub fn degrade(&self) -> Option<Self> {
        let (kind, version) = match self.kind {
            RendererKind::Upscale => (RendererKind::Resample, GlVersion::V2_0),
            RendererKind::Resample => (RendererKind::Tiled, self.version.min(GlVersion::V1_2)),
            RendererKind::Tiled => return None,
        };
        Some(Self {
            kind,
            version,
            native_rgb565: self.native_rgb565,
        })
    }

    /// The least capable plan.
    pub fn lowest(&self) -> Self {
        Self {
            kind: RendererKind::Tiled,
            version: self.version.min(GlVersion::V1_2),
            native_rgb565: self.native_rgb565,
        }
    }

    /// GLSL dialects worth trying for this plan, best first.
    pub fn glsl_ladder(&self) -> Vec<GlslVersion> {
        let preferred = match self.kind {
            RendererKind::Upscale => GlslVersion::V130,
            _ => GlslVersion::V110,
        };
        GlslVersion::ladder(preferred, self.version.max_glsl())
    }
}

/// Pick a renderer for a `mode`-sized surface on a device with `caps`.
pub fn select_renderer(caps: &DeviceCaps, mode: Size, config: &RendererConfig) -> RendererPlan {
    let mut version = caps.version;
    if let Some(cap) = config.gl_version {
        version = version.min(cap);
    }

    // Shader paths need the whole surface in one texture.
    if version >= GlVersion::V2_0 && caps.max_texture_size < next_pow2(mode.max_dimension()) {
        debug!(
            "Max texture size {} too small for {:?}, using tiled path",
            caps.max_texture_size, mode
        );
        version = GlVersion::V1_1;
    }

    match config.preference {
        RendererPreference::Tiled => version = version.min(GlVersion::V1_2),
        RendererPreference::Resample => version = version.min(GlVersion::V2_0),
        RendererPreference::Upscale | RendererPreference::Auto => {}
    }

    let kind = if version >= GlVersion::V3_0 {
        RendererKind::Upscale
    } else if version >= GlVersion::V2_0 {
        RendererKind::Resample
    } else {
        RendererKind::Tiled
    };

    let native_rgb565 = caps.native_rgb565 && version > GlVersion::V1_1 && !config.force_cpu_expansion;

    RendererPlan {
        kind,
        version,
        native_rgb565,
    }
}

/// Per-frame inputs to [`Renderer::present`].
#[derive(Debug, Clone, Copy)]
pub struct PresentPass<'a> {
    pub viewport: &'a ViewportGeometry,
    /// The viewport was recomputed this frame.
    pub viewport_changed: bool,
    /// Clear the backbuffer before drawing.
    pub clear: bool,
    /// Capture the frame before the swap.
    pub snapshot: bool,
}

/// A presentation strategy. Owns every GPU object it creates.
pub trait Renderer {
    fn kind(&self) -> RendererKind;

    /// Apply a filter taken from the filter slot.
    fn set_filter(
        &mut self,
        device: &mut dyn GraphicsDevice,
        filter: Filter,
        reporter: &mut ErrorReporter,
    ) -> DisplayResult<()>;

    /// Upload the dirty regions of `pixels`. May widen `regions` to the full surface.
    fn upload_dirty(
        &mut self,
        device: &mut dyn GraphicsDevice,
        pixels: &SurfaceBuffer,
        regions: &mut DirtyRegions,
    ) -> DisplayResult<()>;

    /// Composite to the backbuffer; the swap is left to the caller.
    fn present(&mut self, device: &mut dyn GraphicsDevice, pass: &PresentPass<'_>) -> DisplayResult<Option<Snapshot>>;

    /// Free every GPU object.
    fn teardown(self: Box<Self>, device: &mut dyn GraphicsDevice);
}

/// Everything a renderer needs at construction.
#[derive(Clone)]
pub struct RendererSetup {
    pub surface: Size,
    pub shaders: Arc<dyn ShaderSourceProvider>,
    pub dirty_capacity: usize,
}

/// Build the renderer for `plan`.
pub fn build_renderer(
    plan: &RendererPlan,
    device: &mut dyn GraphicsDevice,
    setup: &RendererSetup,
) -> DisplayResult<Box<dyn Renderer>> {
    debug!("Building {} renderer at GL {}", plan.kind, plan.version);
    let renderer: Box<dyn Renderer> = match plan.kind {
        RendererKind::Tiled => Box::new(TiledRenderer::new(device, setup.surface, plan.native_rgb565)?),
        RendererKind::Resample => Box::new(ResampleRenderer::new(
            device,
            setup.shaders.as_ref(),
            setup.surface,
            &plan.glsl_ladder(),
            plan.native_rgb565,
        )?),
        RendererKind::Upscale => Box::new(UpscaleRenderer::new(
            device,
            setup.shaders.clone(),
            setup.surface,
            plan.glsl_ladder(),
            plan.native_rgb565,
            setup.dirty_capacity,
        )?),
    };
    Ok(renderer)
}

/// Column-major orthographic projection mapping `size` pixels, origin top-left,
/// onto clip space.
pub fn ortho(size: Size) -> [f32; 16] {
    let w = size.width.max(1) as f32;
    let h = size.height.max(1) as f32;
    [
        2.0 / w, 0.0, 0.0, 0.0, //
        0.0, -2.0 / h, 0.0, 0.0, //
        0.0, 0.0, 2.0, 0.0, //
        -1.0, 1.0, -1.0, 1.0,
    ]
}

/// Multiply a column-major matrix by a vector.
pub fn transform(m: &[f32; 16], v: [f32; 4]) -> [f32; 4] {
    let mut out = [0.0; 4];
    for (row, value) in out.iter_mut().enumerate() {
        *value = (0..4).map(|col| m[col * 4 + row] * v[col]).sum();
    }
    out
}

/// Eight textured vertices with the projection baked in.
///
/// Vertices 0..4 draw the surface texture, whose content occupies
/// `tex_extent` of the texture. Vertices 4..8 cover the same area with
/// vertically flipped coordinates spanning a whole render-target texture.
pub fn textured_quads(surface: Size, tex_extent: (f32, f32)) -> Vec<f32> {
    let mvp = ortho(surface);
    let (w, h) = (surface.width as f32, surface.height as f32);
    let (tx, ty) = tex_extent;
    let corners = [(0.0, 0.0), (w, 0.0), (w, h), (0.0, h)];
    let source_uv = [(0.0, 0.0), (tx, 0.0), (tx, ty), (0.0, ty)];
    let target_uv = [(0.0, 1.0), (1.0, 1.0), (1.0, 0.0), (0.0, 0.0)];

    let mut data = Vec::with_capacity(8 * 8);
    for uvs in [source_uv, target_uv] {
        for ((x, y), (u, v)) in corners.iter().zip(uvs.iter()) {
            let p = transform(&mvp, [*x, *y, 0.0, 1.0]);
            data.extend_from_slice(&[p[0], p[1], p[2], p[3], *u, *v, 0.0, 0.0]);
        }
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn caps(version: GlVersion, max_texture_size: u32) -> DeviceCaps {
        DeviceCaps {
            version,
            max_texture_size,
            native_rgb565: true,
        }
    }

    #[test]
    fn test_select_by_version() {
        let mode = Size::new(640, 480);
        let config = RendererConfig::default();
        assert_eq!(select_renderer(&caps(GlVersion::V3_0, 4096), mode, &config).kind, RendererKind::Upscale);
        assert_eq!(select_renderer(&caps(GlVersion::V2_0, 4096), mode, &config).kind, RendererKind::Resample);
        assert_eq!(select_renderer(&caps(GlVersion::V1_2, 4096), mode, &config).kind, RendererKind::Tiled);
    }

    #[test]
    fn test_small_max_texture_forces_tiled() {
        let plan = select_renderer(&caps(GlVersion::V3_0, 512), Size::new(640, 480), &RendererConfig::default());
        assert_eq!(plan.kind, RendererKind::Tiled);
        assert_eq!(plan.version, GlVersion::V1_1);
        assert!(!plan.native_rgb565);
    }

    #[test]
    fn test_preference_caps_tier() {
        let config = RendererConfig {
            preference: RendererPreference::Resample,
            ..Default::default()
        };
        assert_eq!(
            select_renderer(&caps(GlVersion::V3_0, 4096), Size::new(640, 480), &config).kind,
            RendererKind::Resample
        );

        let config = RendererConfig {
            gl_version: Some(GlVersion::V1_2),
            ..Default::default()
        };
        let plan = select_renderer(&caps(GlVersion::V3_0, 4096), Size::new(640, 480), &config);
        assert_eq!(plan.kind, RendererKind::Tiled);
        assert!(plan.native_rgb565);
    }

    #[test]
    fn test_force_cpu_expansion() {
        let config = RendererConfig {
            force_cpu_expansion: true,
            ..Default::default()
        };
        assert!(!select_renderer(&caps(GlVersion::V3_0, 4096), Size::new(640, 480), &config).native_rgb565);
    }

    #[test]
    fn test_degrade_chain() {
        let plan = select_renderer(&caps(GlVersion::V3_0, 4096), Size::new(640, 480), &RendererConfig::default());
        let resample = plan.degrade().unwrap();
        assert_eq!(resample.kind, RendererKind::Resample);
        assert_eq!(resample.glsl_ladder(), vec![GlslVersion::V110]);
        let tiled = resample.degrade().unwrap();
        assert_eq!(tiled.kind, RendererKind::Tiled);
        assert!(tiled.degrade().is_none());
        assert_eq!(plan.lowest().kind, RendererKind::Tiled);
        assert_eq!(plan.glsl_ladder(), vec![GlslVersion::V130, GlslVersion::V110]);
    }

    #[test]
    fn test_ortho_maps_corners() {
        let m = ortho(Size::new(640, 480));
        assert_eq!(transform(&m, [0.0, 0.0, 0.0, 1.0]), [-1.0, 1.0, -1.0, 1.0]);
        assert_eq!(transform(&m, [640.0, 480.0, 0.0, 1.0]), [1.0, -1.0, -1.0, 1.0]);
    }

    #[test]
    fn test_textured_quads_layout() {
        let data = textured_quads(Size::new(640, 480), (0.625, 0.46875));
        assert_eq!(data.len(), 64);
        // Vertex 2: bottom-right of the source quad.
        assert_eq!(&data[16..22], &[1.0, -1.0, -1.0, 1.0, 0.625, 0.46875]);
        // Vertex 4: top-left of the flipped quad samples the top of the target.
        assert_eq!(&data[32..38], &[-1.0, 1.0, -1.0, 1.0, 0.0, 1.0]);
    }
}
