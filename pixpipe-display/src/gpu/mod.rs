//! Graphics device abstraction.
//!
//! Renderers talk to the GPU only through [`GraphicsDevice`]. Two backends
//! exist: [`GlowDevice`](gl::GlowDevice) drives a real OpenGL context through
//! `glow`, and [`HeadlessDevice`] keeps everything in memory and records each
//! call so tests and the bench can run without a window.
//!
//! All handles are plain ids owned by the renderer that created them. A device
//! lives on the render thread only; it is produced there by a [`DeviceFactory`]
//! because a GL context must be current on the thread that issues GL calls.

#[cfg(feature = "gl")]
pub mod gl;
pub mod headless;

pub use headless::{DeviceCall, HeadlessDevice, HeadlessOptions, HeadlessProbe};

use crate::error::DisplayResult;
use crate::shader::GlslVersion;
use bitflags::bitflags;
use pixpipe_common::{Rect, Size};
use std::fmt;

/// OpenGL capability tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub enum GlVersion {
    #[serde(rename = "1.1")]
    V1_1,
    #[serde(rename = "1.2")]
    V1_2,
    #[serde(rename = "2.0")]
    V2_0,
    #[serde(rename = "3.0")]
    V3_0,
}

impl GlVersion {
    /// Tier for a reported `major.minor` version.
    pub fn from_numbers(major: u32, minor: u32) -> Self {
        match (major, minor) {
            (0..=1, 0..=1) => Self::V1_1,
            (0..=1, _) => Self::V1_2,
            (2, _) => Self::V2_0,
            _ => Self::V3_0,
        }
    }

    /// Highest GLSL dialect available at this tier.
    pub fn max_glsl(&self) -> Option<GlslVersion> {
        match self {
            Self::V1_1 | Self::V1_2 => None,
            Self::V2_0 => Some(GlslVersion::V110),
            Self::V3_0 => Some(GlslVersion::V130),
        }
    }
}

impl fmt::Display for GlVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::V1_1 => "1.1",
            Self::V1_2 => "1.2",
            Self::V2_0 => "2.0",
            Self::V3_0 => "3.0",
        };
        f.write_str(text)
    }
}

/// What the device can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCaps {
    pub version: GlVersion,
    pub max_texture_size: u32,
    /// Textures can be uploaded from packed RGB565 without conversion.
    pub native_rgb565: bool,
}

impl DeviceCaps {
    pub fn supports_shaders(&self) -> bool {
        self.version >= GlVersion::V2_0
    }
}

impl Default for DeviceCaps {
    fn default() -> Self {
        Self {
            version: GlVersion::V3_0,
            max_texture_size: 8192,
            native_rgb565: true,
        }
    }
}

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);
    };
}

handle!(
    /// A 2D texture.
    TextureHandle
);
handle!(
    /// A vertex buffer.
    BufferHandle
);
handle!(
    /// A linked shader program.
    ProgramHandle
);
handle!(
    /// A framebuffer with colour texture and depth/stencil renderbuffer.
    TargetHandle
);

/// Texel storage of a texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureFormat {
    Rgb565,
    Rgba8,
}

/// Minification and magnification filter of a texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScaleFilter {
    /// Nearest neighbor filtering (sharp, pixelated)
    Nearest,
    /// Linear filtering (smooth, blurred)
    #[default]
    Linear,
}

impl fmt::Display for ScaleFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nearest => write!(f, "Nearest"),
            Self::Linear => write!(f, "Linear"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDesc {
    pub size: Size,
    pub format: TextureFormat,
    pub filter: ScaleFilter,
}

/// Source pixels for a texture upload.
#[derive(Debug, Clone, Copy)]
pub enum PixelData<'a> {
    /// Packed RGB565 rows, `row_length` pixels apart.
    Rgb565 { pixels: &'a [u16], row_length: u32 },
    /// Tightly packed RGBA8 rows.
    Rgba8 { bytes: &'a [u8] },
}

/// Vertex formats understood by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexLayout {
    /// `vec4` position, `vec2` tex coord, two floats of padding.
    Textured,
    /// `vec2` position.
    Position2d,
}

impl VertexLayout {
    pub const fn floats_per_vertex(&self) -> usize {
        match self {
            Self::Textured => 8,
            Self::Position2d => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferUsage {
    Static,
    Stream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    TriangleFan,
    Triangles,
}

bitflags! {
    /// Buffers to clear.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClearMask: u8 {
        const COLOR = 0b01;
        const STENCIL = 0b10;
    }
}

/// Stencil configuration for subsequent draws.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StencilMode {
    Disabled,
    /// Always pass, replace stencil with `reference`, colour writes masked.
    Write { reference: u8 },
    /// Draw only where stencil equals `reference`, stencil kept.
    Test { reference: u8 },
}

/// Where draws land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderTarget {
    Backbuffer,
    Offscreen(TargetHandle),
}

/// An offscreen framebuffer and its colour texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffscreenTarget {
    pub handle: TargetHandle,
    pub color: TextureHandle,
    pub size: Size,
}

/// Uniform values applied when a program is bound.
#[derive(Debug, Clone, Copy, Default)]
pub struct Uniforms<'a> {
    /// Packed texture size, width in the low 16 bits.
    pub tex_size: Option<u32>,
    pub mvp: Option<&'a [f32; 16]>,
}

/// Program sources for one GLSL dialect.
#[derive(Debug, Clone, Copy)]
pub struct ProgramSource<'a> {
    pub name: &'a str,
    pub vertex: &'a str,
    pub fragment: &'a str,
}

/// One tile of the tiled renderer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileQuad {
    pub texture: TextureHandle,
    /// Destination in surface pixels.
    pub dest: Rect,
    /// Texture coordinate of the tile's bottom-right corner.
    pub tex_extent: (f32, f32),
}

/// What to read back for a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    /// A rectangle of the backbuffer in window pixels, origin bottom-left.
    Backbuffer(Rect),
    Offscreen(OffscreenTarget),
}

/// The GPU operations the renderers need.
pub trait GraphicsDevice {
    fn caps(&self) -> DeviceCaps;

    fn set_swap_interval(&mut self, vsync: bool);

    fn create_texture(&mut self, desc: &TextureDesc) -> DisplayResult<TextureHandle>;
    fn set_texture_filter(&mut self, texture: TextureHandle, filter: ScaleFilter);
    /// Replace `region` of `texture`.
    fn upload(&mut self, texture: TextureHandle, region: Rect, data: PixelData<'_>) -> DisplayResult<()>;
    fn delete_texture(&mut self, texture: TextureHandle);

    fn create_buffer(
        &mut self,
        layout: VertexLayout,
        usage: BufferUsage,
        vertices: usize,
        data: Option<&[f32]>,
    ) -> DisplayResult<BufferHandle>;
    fn update_buffer(&mut self, buffer: BufferHandle, data: &[f32]) -> DisplayResult<()>;
    fn delete_buffer(&mut self, buffer: BufferHandle);

    fn create_target(&mut self, size: Size) -> DisplayResult<OffscreenTarget>;
    fn delete_target(&mut self, target: OffscreenTarget);
    fn bind_target(&mut self, target: RenderTarget);

    fn set_viewport(&mut self, rect: Rect);
    fn clear(&mut self, mask: ClearMask);
    fn set_stencil(&mut self, mode: StencilMode);

    fn compile_program(&mut self, source: &ProgramSource<'_>) -> DisplayResult<ProgramHandle>;
    fn use_program(&mut self, program: ProgramHandle, uniforms: &Uniforms<'_>);
    fn delete_program(&mut self, program: ProgramHandle);

    /// Draw `count` vertices from `buffer` through the bound program.
    fn draw(
        &mut self,
        buffer: BufferHandle,
        texture: Option<TextureHandle>,
        primitive: Primitive,
        first: u32,
        count: u32,
    );
    /// Draw textured tiles in surface coordinates without a bound program.
    fn draw_tiles(&mut self, surface: Size, tiles: &[TileQuad]) -> DisplayResult<()>;

    /// Read packed RGB rows, bottom row first.
    fn read_pixels(&mut self, source: ReadSource) -> DisplayResult<Vec<u8>>;

    /// Swap buffers and wait for the GPU to finish.
    fn present(&mut self) -> DisplayResult<()>;
}

/// Creates a device on the render thread.
pub trait DeviceFactory: Send + Sync {
    fn create(&self) -> DisplayResult<Box<dyn GraphicsDevice>>;
}

impl<F> DeviceFactory for F
where
    F: Fn() -> DisplayResult<Box<dyn GraphicsDevice>> + Send + Sync,
{
    fn create(&self) -> DisplayResult<Box<dyn GraphicsDevice>> {
        self()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_tiers() {
        assert_eq!(GlVersion::from_numbers(1, 1), GlVersion::V1_1);
        assert_eq!(GlVersion::from_numbers(1, 5), GlVersion::V1_2);
        assert_eq!(GlVersion::from_numbers(2, 1), GlVersion::V2_0);
        assert_eq!(GlVersion::from_numbers(4, 6), GlVersion::V3_0);
        assert!(GlVersion::V1_2 < GlVersion::V2_0);
        assert_eq!(GlVersion::V1_2.max_glsl(), None);
    }

    #[test]
    fn test_scale_filter_display() {
        assert_eq!(format!("{}", ScaleFilter::Nearest), "Nearest");
        assert_eq!(format!("{}", ScaleFilter::Linear), "Linear");
    }

    #[test]
    fn test_clear_mask() {
        let mask = ClearMask::COLOR | ClearMask::STENCIL;
        assert!(mask.contains(ClearMask::STENCIL));
        assert!(!ClearMask::COLOR.contains(ClearMask::STENCIL));
    }
}
