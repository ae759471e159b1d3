//! OpenGL device on top of `glow`.
//!
//! The device must be created and used on the thread where its context is
//! current. Window-system specifics (buffer swaps, swap interval, drawable
//! size) sit behind [`PresentSurface`].

use super::{
    BufferHandle, BufferUsage, ClearMask, DeviceCaps, GlVersion, GraphicsDevice, OffscreenTarget, PixelData,
    Primitive, ProgramHandle, ProgramSource, ReadSource, RenderTarget, ScaleFilter, StencilMode, TargetHandle,
    TextureDesc, TextureFormat, TextureHandle, TileQuad, Uniforms, VertexLayout,
};
use crate::error::{DisplayResult, ErrorCode, RenderError};
use crate::renderer::{ortho, transform};
use crate::shader::{BuiltinShaders, GlslVersion, ShaderId, ShaderSourceProvider, ShaderStage};
use glow::{HasContext, PixelPackData, PixelUnpackData};
use pixpipe_common::{Rect, Size};
use std::collections::HashMap;
use std::ffi::c_void;
use tracing::{debug, trace, warn};

/// The drawable a [`GlowDevice`] presents to.
pub trait PresentSurface {
    fn swap_buffers(&mut self) -> anyhow::Result<()>;
    fn set_swap_interval(&mut self, vsync: bool) -> anyhow::Result<()>;
    /// Drawable size in pixels.
    fn size(&self) -> Size;
}

const ATTRIB_POSITION: u32 = 0;
const ATTRIB_TEX_COORD: u32 = 1;

// Compatibility-profile enums glow does not define.
const GL_MODELVIEW: u32 = 0x1700;
const GL_PROJECTION: u32 = 0x1701;
const GL_TEXTURE_ENV: u32 = 0x2300;
const GL_TEXTURE_ENV_MODE: u32 = 0x2200;
const GL_VERTEX_ARRAY: u32 = 0x8074;
const GL_TEXTURE_COORD_ARRAY: u32 = 0x8078;
const GL_CLAMP: u32 = 0x2900;

/// Fixed-function entry points for drawing tiles on contexts without shaders.
/// glow only binds the programmable pipeline, so these are resolved through
/// the same loader that built the context.
struct FixedFunction {
    matrix_mode: unsafe extern "system" fn(u32),
    load_identity: unsafe extern "system" fn(),
    tex_envi: unsafe extern "system" fn(u32, u32, i32),
    enable_client_state: unsafe extern "system" fn(u32),
    disable_client_state: unsafe extern "system" fn(u32),
    vertex_pointer: unsafe extern "system" fn(i32, u32, i32, *const c_void),
    tex_coord_pointer: unsafe extern "system" fn(i32, u32, i32, *const c_void),
}

impl FixedFunction {
    /// Returns `None` if any entry point is missing.
    ///
    /// # Safety
    ///
    /// `loader` must return either null or the address of the named GL function.
    unsafe fn load(loader: &mut dyn FnMut(&str) -> *const c_void) -> Option<Self> {
        macro_rules! entry {
            ($name:literal) => {{
                let ptr = loader($name);
                if ptr.is_null() {
                    debug!("{} unavailable", $name);
                    return None;
                }
                unsafe { std::mem::transmute::<*const c_void, _>(ptr) }
            }};
        }
        Some(Self {
            matrix_mode: entry!("glMatrixMode"),
            load_identity: entry!("glLoadIdentity"),
            tex_envi: entry!("glTexEnvi"),
            enable_client_state: entry!("glEnableClientState"),
            disable_client_state: entry!("glDisableClientState"),
            vertex_pointer: entry!("glVertexPointer"),
            tex_coord_pointer: entry!("glTexCoordPointer"),
        })
    }
}

/// How [`GraphicsDevice::draw_tiles`] reaches the screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TilePath {
    /// A linked "tiles" program fed from a stream buffer.
    Program,
    /// Client-side vertex arrays and `GL_REPLACE` texturing.
    FixedFunction,
}

/// A context with neither shaders nor fixed-function entry points cannot draw at all.
fn tile_path(caps: DeviceCaps, fixed_function: bool) -> DisplayResult<TilePath> {
    if caps.supports_shaders() {
        Ok(TilePath::Program)
    } else if fixed_function {
        Ok(TilePath::FixedFunction)
    } else {
        Err(RenderError::Capability(ErrorCode::ContextCreation))
    }
}

struct GlTexture {
    texture: glow::Texture,
    desc: TextureDesc,
}

struct GlBuffer {
    buffer: glow::Buffer,
    layout: VertexLayout,
}

struct GlProgram {
    program: glow::Program,
    tex_size: Option<glow::UniformLocation>,
    mvp: Option<glow::UniformLocation>,
    sampler: Option<glow::UniformLocation>,
}

struct GlTarget {
    framebuffer: glow::Framebuffer,
    depth_stencil: glow::Renderbuffer,
    target: OffscreenTarget,
}

/// Program and stream buffer for [`GraphicsDevice::draw_tiles`].
struct TilePipeline {
    program: ProgramHandle,
    buffer: BufferHandle,
    capacity: usize,
}

fn gl_size(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn formats(format: TextureFormat) -> (i32, u32, u32, i32) {
    // (internal format, format, type, unpack alignment)
    match format {
        TextureFormat::Rgb565 => (glow::RGB as i32, glow::RGB, glow::UNSIGNED_SHORT_5_6_5, 2),
        TextureFormat::Rgba8 => (glow::RGBA8 as i32, glow::RGBA, glow::UNSIGNED_BYTE, 4),
    }
}

fn filter_enum(filter: ScaleFilter) -> i32 {
    match filter {
        ScaleFilter::Nearest => glow::NEAREST as i32,
        ScaleFilter::Linear => glow::LINEAR as i32,
    }
}

pub struct GlowDevice {
    gl: glow::Context,
    surface: Box<dyn PresentSurface>,
    caps: DeviceCaps,
    vao: Option<glow::VertexArray>,
    next_id: u32,
    textures: HashMap<TextureHandle, GlTexture>,
    buffers: HashMap<BufferHandle, GlBuffer>,
    programs: HashMap<ProgramHandle, GlProgram>,
    targets: HashMap<TargetHandle, GlTarget>,
    bound: RenderTarget,
    tiles: Option<TilePipeline>,
    tile_path: TilePath,
    fixed: Option<FixedFunction>,
    tile_scratch: Vec<f32>,
}

impl GlowDevice {
    /// Wrap a context that is current on the calling thread.
    ///
    /// Without the fixed-function entry points a GL 1.x context is rejected;
    /// use [`GlowDevice::from_loader`] for those.
    ///
    /// # Safety
    ///
    /// `gl` must stay current on this thread for the lifetime of the device.
    pub unsafe fn new(gl: glow::Context, surface: Box<dyn PresentSurface>) -> DisplayResult<Self> {
        unsafe { Self::build(gl, None, surface) }
    }

    /// Load the current context through `loader`, including the fixed-function
    /// entry points the tiled renderer needs on GL 1.x.
    ///
    /// # Safety
    ///
    /// `loader` must resolve functions of the context current on this thread,
    /// and that context must stay current for the lifetime of the device.
    pub unsafe fn from_loader<F>(mut loader: F, surface: Box<dyn PresentSurface>) -> DisplayResult<Self>
    where
        F: FnMut(&str) -> *const c_void,
    {
        let fixed = unsafe { FixedFunction::load(&mut loader) };
        let gl = unsafe { glow::Context::from_loader_function(&mut loader) };
        unsafe { Self::build(gl, fixed, surface) }
    }

    unsafe fn build(
        gl: glow::Context,
        fixed: Option<FixedFunction>,
        surface: Box<dyn PresentSurface>,
    ) -> DisplayResult<Self> {
        let reported = gl.version();
        let version = GlVersion::from_numbers(reported.major, reported.minor);
        let max_texture_size = unsafe { gl.get_parameter_i32(glow::MAX_TEXTURE_SIZE) };
        if reported.major == 0 || max_texture_size <= 0 {
            // No current context answers these queries.
            return Err(RenderError::Capability(ErrorCode::ContextCreation));
        }
        let max_texture_size = max_texture_size as u32;
        let caps = DeviceCaps {
            version,
            max_texture_size,
            native_rgb565: version > GlVersion::V1_1,
        };
        let tile_path = tile_path(caps, fixed.is_some())?;
        debug!(
            "GL context {}.{} ({}), max texture {}, tiles via {:?}",
            reported.major, reported.minor, reported.vendor_info, max_texture_size, tile_path
        );

        let vao = if version >= GlVersion::V3_0 {
            let vao = unsafe { gl.create_vertex_array() }.map_err(RenderError::ResourceExhausted)?;
            unsafe { gl.bind_vertex_array(Some(vao)) };
            Some(vao)
        } else {
            None
        };

        unsafe {
            gl.disable(glow::DEPTH_TEST);
            gl.disable(glow::BLEND);
            gl.clear_color(0.0, 0.0, 0.0, 1.0);
            gl.clear_stencil(0);
        }

        Ok(Self {
            gl,
            surface,
            caps,
            vao,
            next_id: 0,
            textures: HashMap::new(),
            buffers: HashMap::new(),
            programs: HashMap::new(),
            targets: HashMap::new(),
            bound: RenderTarget::Backbuffer,
            tiles: None,
            tile_path,
            fixed,
            tile_scratch: Vec::new(),
        })
    }

    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    /// Fail with resource exhaustion if the driver ran out of memory.
    fn check_memory(&self, what: &str) -> DisplayResult<()> {
        let error = unsafe { self.gl.get_error() };
        if error == glow::OUT_OF_MEMORY {
            return Err(RenderError::ResourceExhausted(format!("out of memory allocating {}", what)));
        }
        if error != glow::NO_ERROR {
            trace!("GL error 0x{:x} after {}", error, what);
        }
        Ok(())
    }

    fn compile_stage(&self, stage: u32, source: &str, name: &str) -> DisplayResult<glow::Shader> {
        let gl = &self.gl;
        unsafe {
            let shader = gl.create_shader(stage).map_err(RenderError::ResourceExhausted)?;
            gl.shader_source(shader, source);
            gl.compile_shader(shader);
            if !gl.get_shader_compile_status(shader) {
                let log = gl.get_shader_info_log(shader);
                gl.delete_shader(shader);
                return Err(RenderError::ShaderCompile {
                    program: name.to_string(),
                    log,
                });
            }
            Ok(shader)
        }
    }

    /// Flip a window-space rectangle to GL's bottom-left origin when it targets the backbuffer.
    fn to_gl_rect(&self, rect: Rect) -> (i32, i32, i32, i32) {
        let y = match self.bound {
            RenderTarget::Backbuffer => gl_size(self.surface.size().height) - rect.bottom(),
            RenderTarget::Offscreen(_) => rect.y,
        };
        (rect.x, y, gl_size(rect.width), gl_size(rect.height))
    }

    fn bind_vertices(&self, buffer: &GlBuffer) {
        let gl = &self.gl;
        let stride = (buffer.layout.floats_per_vertex() * std::mem::size_of::<f32>()) as i32;
        unsafe {
            gl.bind_buffer(glow::ARRAY_BUFFER, Some(buffer.buffer));
            gl.enable_vertex_attrib_array(ATTRIB_POSITION);
            match buffer.layout {
                VertexLayout::Textured => {
                    gl.vertex_attrib_pointer_f32(ATTRIB_POSITION, 4, glow::FLOAT, false, stride, 0);
                    gl.enable_vertex_attrib_array(ATTRIB_TEX_COORD);
                    gl.vertex_attrib_pointer_f32(ATTRIB_TEX_COORD, 2, glow::FLOAT, false, stride, 16);
                }
                VertexLayout::Position2d => {
                    gl.vertex_attrib_pointer_f32(ATTRIB_POSITION, 2, glow::FLOAT, false, stride, 0);
                    gl.disable_vertex_attrib_array(ATTRIB_TEX_COORD);
                }
            }
        }
    }

    /// Clip-space tile vertices into `tile_scratch`: position (4), tex coord (2), padding (2).
    fn fill_tile_vertices(&mut self, surface: Size, tiles: &[TileQuad]) {
        let mvp = ortho(surface);
        self.tile_scratch.clear();
        for tile in tiles {
            let (l, t) = (tile.dest.x as f32, tile.dest.y as f32);
            let (r, b) = (tile.dest.right() as f32, tile.dest.bottom() as f32);
            let (u, v) = tile.tex_extent;
            for (x, y, s, tc) in [(l, t, 0.0, 0.0), (r, t, u, 0.0), (r, b, u, v), (l, b, 0.0, v)] {
                let p = transform(&mvp, [x, y, 0.0, 1.0]);
                self.tile_scratch
                    .extend_from_slice(&[p[0], p[1], p[2], p[3], s, tc, 0.0, 0.0]);
            }
        }
    }

    fn draw_tiles_fixed(&mut self, surface: Size, tiles: &[TileQuad]) -> DisplayResult<()> {
        self.fill_tile_vertices(surface, tiles);
        let Some(fixed) = &self.fixed else {
            return Err(RenderError::Capability(ErrorCode::ContextCreation));
        };
        let gl = &self.gl;
        let stride = (8 * std::mem::size_of::<f32>()) as i32;
        let base = self.tile_scratch.as_ptr();
        unsafe {
            // Vertices are already in clip space.
            (fixed.matrix_mode)(GL_PROJECTION);
            (fixed.load_identity)();
            (fixed.matrix_mode)(GL_MODELVIEW);
            (fixed.load_identity)();
            gl.enable(glow::TEXTURE_2D);
            (fixed.tex_envi)(GL_TEXTURE_ENV, GL_TEXTURE_ENV_MODE, glow::REPLACE as i32);
            (fixed.enable_client_state)(GL_VERTEX_ARRAY);
            (fixed.enable_client_state)(GL_TEXTURE_COORD_ARRAY);
            (fixed.vertex_pointer)(4, glow::FLOAT, stride, base.cast());
            (fixed.tex_coord_pointer)(2, glow::FLOAT, stride, base.add(4).cast());
            for (index, tile) in tiles.iter().enumerate() {
                let texture = self.textures.get(&tile.texture).map(|t| t.texture);
                gl.bind_texture(glow::TEXTURE_2D, texture);
                gl.draw_arrays(glow::TRIANGLE_FAN, index as i32 * 4, 4);
            }
            (fixed.disable_client_state)(GL_TEXTURE_COORD_ARRAY);
            (fixed.disable_client_state)(GL_VERTEX_ARRAY);
        }
        Ok(())
    }

    fn ensure_tile_pipeline(&mut self, tiles: usize) -> DisplayResult<()> {
        if let Some(pipeline) = &self.tiles {
            if pipeline.capacity >= tiles {
                return Ok(());
            }
        }
        if let Some(old) = self.tiles.take() {
            self.delete_buffer(old.buffer);
            self.delete_program(old.program);
        }

        let mut program = None;
        for version in GlslVersion::ALL.iter().rev() {
            let (Some(vertex), Some(fragment)) = (
                BuiltinShaders.source(*version, ShaderStage::Vertex, ShaderId::Linear),
                BuiltinShaders.source(*version, ShaderStage::Fragment, ShaderId::Linear),
            ) else {
                continue;
            };
            match self.compile_program(&ProgramSource {
                name: "tiles",
                vertex: &vertex,
                fragment: &fragment,
            }) {
                Ok(handle) => {
                    program = Some(handle);
                    break;
                }
                Err(err) => debug!("Tile program at {:?} failed: {}", version, err),
            }
        }
        let program = program.ok_or_else(|| RenderError::ShaderCompile {
            program: "tiles".into(),
            log: "no GLSL dialect accepted".into(),
        })?;

        let buffer = match self.create_buffer(VertexLayout::Textured, BufferUsage::Stream, tiles * 4, None) {
            Ok(buffer) => buffer,
            Err(err) => {
                self.delete_program(program);
                return Err(err);
            }
        };
        self.tiles = Some(TilePipeline {
            program,
            buffer,
            capacity: tiles,
        });
        Ok(())
    }
}

impl GraphicsDevice for GlowDevice {
    fn caps(&self) -> DeviceCaps {
        self.caps
    }

    fn set_swap_interval(&mut self, vsync: bool) {
        if let Err(e) = self.surface.set_swap_interval(vsync) {
            warn!("Failed to set swap interval: {:#}", e);
        }
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> DisplayResult<TextureHandle> {
        let (internal, format, ty, _) = formats(desc.format);
        let wrap = if self.caps.version >= GlVersion::V1_2 {
            glow::CLAMP_TO_EDGE as i32
        } else {
            GL_CLAMP as i32
        };
        let texture = unsafe {
            let gl = &self.gl;
            let texture = gl.create_texture().map_err(RenderError::ResourceExhausted)?;
            gl.bind_texture(glow::TEXTURE_2D, Some(texture));
            gl.tex_image_2d(
                glow::TEXTURE_2D,
                0,
                internal,
                gl_size(desc.size.width),
                gl_size(desc.size.height),
                0,
                format,
                ty,
                PixelUnpackData::Slice(None),
            );
            gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MIN_FILTER, filter_enum(desc.filter));
            gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MAG_FILTER, filter_enum(desc.filter));
            gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_WRAP_S, wrap);
            gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_WRAP_T, wrap);
            texture
        };
        if let Err(err) = self.check_memory("texture") {
            unsafe { self.gl.delete_texture(texture) };
            return Err(err);
        }

        let handle = TextureHandle(self.next_id());
        self.textures.insert(handle, GlTexture { texture, desc: *desc });
        Ok(handle)
    }

    fn set_texture_filter(&mut self, texture: TextureHandle, filter: ScaleFilter) {
        let Some(record) = self.textures.get_mut(&texture) else {
            return;
        };
        record.desc.filter = filter;
        unsafe {
            self.gl.bind_texture(glow::TEXTURE_2D, Some(record.texture));
            self.gl
                .tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MIN_FILTER, filter_enum(filter));
            self.gl
                .tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MAG_FILTER, filter_enum(filter));
        }
    }

    fn upload(&mut self, texture: TextureHandle, region: Rect, data: PixelData<'_>) -> DisplayResult<()> {
        let record = self
            .textures
            .get(&texture)
            .ok_or_else(|| RenderError::OutOfBounds(format!("unknown texture {:?}", texture)))?;
        if region.is_empty() {
            return Ok(());
        }
        let (w, h) = (region.width as usize, region.height as usize);

        let (bytes, row_length, format) = match data {
            PixelData::Rgb565 { pixels, row_length } => {
                let needed = (h - 1) * row_length as usize + w;
                let pixels = pixels
                    .get(..needed)
                    .ok_or_else(|| RenderError::OutOfBounds("short RGB565 upload".into()))?;
                (bytemuck::cast_slice::<u16, u8>(pixels), row_length, TextureFormat::Rgb565)
            }
            PixelData::Rgba8 { bytes } => {
                let bytes = bytes
                    .get(..w * h * 4)
                    .ok_or_else(|| RenderError::OutOfBounds("short RGBA8 upload".into()))?;
                (bytes, region.width, TextureFormat::Rgba8)
            }
        };
        let (_, gl_format, ty, alignment) = formats(format);

        unsafe {
            let gl = &self.gl;
            gl.bind_texture(glow::TEXTURE_2D, Some(record.texture));
            gl.pixel_store_i32(glow::UNPACK_ALIGNMENT, alignment);
            gl.pixel_store_i32(glow::UNPACK_ROW_LENGTH, gl_size(row_length));
            gl.tex_sub_image_2d(
                glow::TEXTURE_2D,
                0,
                region.x,
                region.y,
                gl_size(region.width),
                gl_size(region.height),
                gl_format,
                ty,
                PixelUnpackData::Slice(Some(bytes)),
            );
            gl.pixel_store_i32(glow::UNPACK_ROW_LENGTH, 0);
        }
        Ok(())
    }

    fn delete_texture(&mut self, texture: TextureHandle) {
        if let Some(record) = self.textures.remove(&texture) {
            unsafe { self.gl.delete_texture(record.texture) };
        }
    }

    fn create_buffer(
        &mut self,
        layout: VertexLayout,
        usage: BufferUsage,
        vertices: usize,
        data: Option<&[f32]>,
    ) -> DisplayResult<BufferHandle> {
        let usage = match usage {
            BufferUsage::Static => glow::STATIC_DRAW,
            BufferUsage::Stream => glow::STREAM_DRAW,
        };
        let buffer = unsafe {
            let gl = &self.gl;
            let buffer = gl.create_buffer().map_err(RenderError::ResourceExhausted)?;
            gl.bind_buffer(glow::ARRAY_BUFFER, Some(buffer));
            match data {
                Some(data) => gl.buffer_data_u8_slice(glow::ARRAY_BUFFER, bytemuck::cast_slice(data), usage),
                None => {
                    let bytes = vertices * layout.floats_per_vertex() * std::mem::size_of::<f32>();
                    gl.buffer_data_size(glow::ARRAY_BUFFER, gl_size(bytes as u32), usage);
                }
            }
            buffer
        };
        if let Err(err) = self.check_memory("vertex buffer") {
            unsafe { self.gl.delete_buffer(buffer) };
            return Err(err);
        }

        let handle = BufferHandle(self.next_id());
        self.buffers.insert(handle, GlBuffer { buffer, layout });
        Ok(handle)
    }

    fn update_buffer(&mut self, buffer: BufferHandle, data: &[f32]) -> DisplayResult<()> {
        let record = self
            .buffers
            .get(&buffer)
            .ok_or_else(|| RenderError::OutOfBounds(format!("unknown buffer {:?}", buffer)))?;
        unsafe {
            self.gl.bind_buffer(glow::ARRAY_BUFFER, Some(record.buffer));
            self.gl
                .buffer_sub_data_u8_slice(glow::ARRAY_BUFFER, 0, bytemuck::cast_slice(data));
        }
        Ok(())
    }

    fn delete_buffer(&mut self, buffer: BufferHandle) {
        if let Some(record) = self.buffers.remove(&buffer) {
            unsafe { self.gl.delete_buffer(record.buffer) };
        }
    }

    fn create_target(&mut self, size: Size) -> DisplayResult<OffscreenTarget> {
        let color = self.create_texture(&TextureDesc {
            size,
            format: TextureFormat::Rgba8,
            filter: ScaleFilter::Nearest,
        })?;
        let Some(color_texture) = self.textures.get(&color).map(|t| t.texture) else {
            return Err(RenderError::OutOfBounds(format!("unknown texture {:?}", color)));
        };

        let created = unsafe {
            let gl = &self.gl;
            gl.create_framebuffer().and_then(|framebuffer| match gl.create_renderbuffer() {
                Ok(renderbuffer) => Ok((framebuffer, renderbuffer)),
                Err(e) => {
                    gl.delete_framebuffer(framebuffer);
                    Err(e)
                }
            })
        };
        let (framebuffer, depth_stencil) = match created {
            Ok(objects) => objects,
            Err(e) => {
                self.delete_texture(color);
                return Err(RenderError::ResourceExhausted(e));
            }
        };

        let status = unsafe {
            let gl = &self.gl;
            gl.bind_renderbuffer(glow::RENDERBUFFER, Some(depth_stencil));
            gl.renderbuffer_storage(
                glow::RENDERBUFFER,
                glow::DEPTH24_STENCIL8,
                gl_size(size.width),
                gl_size(size.height),
            );
            gl.bind_framebuffer(glow::FRAMEBUFFER, Some(framebuffer));
            gl.framebuffer_texture_2d(
                glow::FRAMEBUFFER,
                glow::COLOR_ATTACHMENT0,
                glow::TEXTURE_2D,
                Some(color_texture),
                0,
            );
            gl.framebuffer_renderbuffer(
                glow::FRAMEBUFFER,
                glow::DEPTH_STENCIL_ATTACHMENT,
                glow::RENDERBUFFER,
                Some(depth_stencil),
            );
            let status = gl.check_framebuffer_status(glow::FRAMEBUFFER);
            gl.bind_renderbuffer(glow::RENDERBUFFER, None);
            gl.bind_framebuffer(glow::FRAMEBUFFER, None);
            status
        };
        self.bound = RenderTarget::Backbuffer;

        let memory = self.check_memory("offscreen target");
        if status != glow::FRAMEBUFFER_COMPLETE || memory.is_err() {
            unsafe {
                self.gl.delete_framebuffer(framebuffer);
                self.gl.delete_renderbuffer(depth_stencil);
            }
            self.delete_texture(color);
            return Err(memory.err().unwrap_or_else(|| {
                RenderError::ResourceExhausted(format!("incomplete framebuffer 0x{:x}", status))
            }));
        }

        let target = OffscreenTarget {
            handle: TargetHandle(self.next_id()),
            color,
            size,
        };
        self.targets.insert(
            target.handle,
            GlTarget {
                framebuffer,
                depth_stencil,
                target,
            },
        );
        debug!("Created offscreen target {}x{}", size.width, size.height);
        Ok(target)
    }

    fn delete_target(&mut self, target: OffscreenTarget) {
        if let Some(record) = self.targets.remove(&target.handle) {
            if self.bound == RenderTarget::Offscreen(target.handle) {
                self.bind_target(RenderTarget::Backbuffer);
            }
            unsafe {
                self.gl.delete_framebuffer(record.framebuffer);
                self.gl.delete_renderbuffer(record.depth_stencil);
            }
            self.delete_texture(record.target.color);
        }
    }

    fn bind_target(&mut self, target: RenderTarget) {
        let framebuffer = match target {
            RenderTarget::Backbuffer => None,
            RenderTarget::Offscreen(handle) => match self.targets.get(&handle) {
                Some(record) => Some(record.framebuffer),
                None => {
                    warn!("Binding unknown target {:?}", handle);
                    None
                }
            },
        };
        // GL 1.x has no framebuffer objects and only ever draws to the backbuffer.
        if framebuffer.is_none() && self.bound == RenderTarget::Backbuffer {
            return;
        }
        unsafe { self.gl.bind_framebuffer(glow::FRAMEBUFFER, framebuffer) };
        self.bound = if framebuffer.is_some() {
            target
        } else {
            RenderTarget::Backbuffer
        };
    }

    fn set_viewport(&mut self, rect: Rect) {
        let (x, y, w, h) = self.to_gl_rect(rect);
        unsafe { self.gl.viewport(x, y, w, h) };
    }

    fn clear(&mut self, mask: ClearMask) {
        let mut bits = 0;
        if mask.contains(ClearMask::COLOR) {
            bits |= glow::COLOR_BUFFER_BIT;
        }
        if mask.contains(ClearMask::STENCIL) {
            bits |= glow::STENCIL_BUFFER_BIT;
        }
        unsafe { self.gl.clear(bits) };
    }

    fn set_stencil(&mut self, mode: StencilMode) {
        let gl = &self.gl;
        unsafe {
            match mode {
                StencilMode::Disabled => {
                    gl.disable(glow::STENCIL_TEST);
                    gl.color_mask(true, true, true, true);
                }
                StencilMode::Write { reference } => {
                    gl.enable(glow::STENCIL_TEST);
                    gl.stencil_func(glow::ALWAYS, i32::from(reference), 0xFF);
                    gl.stencil_op(glow::KEEP, glow::KEEP, glow::REPLACE);
                    gl.color_mask(false, false, false, false);
                }
                StencilMode::Test { reference } => {
                    gl.enable(glow::STENCIL_TEST);
                    gl.stencil_func(glow::EQUAL, i32::from(reference), 0xFF);
                    gl.stencil_op(glow::KEEP, glow::KEEP, glow::KEEP);
                    gl.color_mask(true, true, true, true);
                }
            }
        }
    }

    fn compile_program(&mut self, source: &ProgramSource<'_>) -> DisplayResult<ProgramHandle> {
        if !self.caps.supports_shaders() {
            return Err(RenderError::ShaderCompile {
                program: source.name.to_string(),
                log: format!("GL {} has no programmable pipeline", self.caps.version),
            });
        }
        let vertex = self.compile_stage(glow::VERTEX_SHADER, source.vertex, source.name)?;
        let fragment = match self.compile_stage(glow::FRAGMENT_SHADER, source.fragment, source.name) {
            Ok(fragment) => fragment,
            Err(err) => {
                unsafe { self.gl.delete_shader(vertex) };
                return Err(err);
            }
        };

        let linked = unsafe {
            let gl = &self.gl;
            let linked = gl.create_program().map_err(RenderError::ResourceExhausted).and_then(|program| {
                gl.attach_shader(program, vertex);
                gl.attach_shader(program, fragment);
                gl.bind_attrib_location(program, ATTRIB_POSITION, "vCoord");
                gl.bind_attrib_location(program, ATTRIB_TEX_COORD, "vTexCoord");
                gl.link_program(program);
                gl.detach_shader(program, vertex);
                gl.detach_shader(program, fragment);
                if gl.get_program_link_status(program) {
                    Ok(program)
                } else {
                    let log = gl.get_program_info_log(program);
                    gl.delete_program(program);
                    Err(RenderError::ShaderCompile {
                        program: source.name.to_string(),
                        log,
                    })
                }
            });
            gl.delete_shader(vertex);
            gl.delete_shader(fragment);
            linked
        };
        let program = linked?;

        let record = unsafe {
            let gl = &self.gl;
            GlProgram {
                program,
                tex_size: gl.get_uniform_location(program, "texSize"),
                mvp: gl.get_uniform_location(program, "mvp"),
                sampler: gl.get_uniform_location(program, "tex01"),
            }
        };
        let handle = ProgramHandle(self.next_id());
        self.programs.insert(handle, record);
        debug!("Linked program {}", source.name);
        Ok(handle)
    }

    fn use_program(&mut self, program: ProgramHandle, uniforms: &Uniforms<'_>) {
        let Some(record) = self.programs.get(&program) else {
            warn!("Using unknown program {:?}", program);
            return;
        };
        let gl = &self.gl;
        unsafe {
            gl.use_program(Some(record.program));
            if let Some(sampler) = &record.sampler {
                gl.uniform_1_i32(Some(sampler), 0);
            }
            if let (Some(location), Some(packed)) = (&record.tex_size, uniforms.tex_size) {
                gl.uniform_2_f32(Some(location), (packed & 0xFFFF) as f32, (packed >> 16) as f32);
            }
            if let (Some(location), Some(mvp)) = (&record.mvp, uniforms.mvp) {
                gl.uniform_matrix_4_f32_slice(Some(location), false, mvp);
            }
        }
    }

    fn delete_program(&mut self, program: ProgramHandle) {
        if let Some(record) = self.programs.remove(&program) {
            unsafe { self.gl.delete_program(record.program) };
        }
    }

    fn draw(
        &mut self,
        buffer: BufferHandle,
        texture: Option<TextureHandle>,
        primitive: Primitive,
        first: u32,
        count: u32,
    ) {
        let Some(record) = self.buffers.get(&buffer) else {
            warn!("Drawing unknown buffer {:?}", buffer);
            return;
        };
        self.bind_vertices(record);
        let mode = match primitive {
            Primitive::TriangleFan => glow::TRIANGLE_FAN,
            Primitive::Triangles => glow::TRIANGLES,
        };
        let texture = texture.and_then(|t| self.textures.get(&t)).map(|t| t.texture);
        unsafe {
            self.gl.active_texture(glow::TEXTURE0);
            self.gl.bind_texture(glow::TEXTURE_2D, texture);
            self.gl.draw_arrays(mode, gl_size(first), gl_size(count));
        }
    }

    fn draw_tiles(&mut self, surface: Size, tiles: &[TileQuad]) -> DisplayResult<()> {
        if tiles.is_empty() {
            return Ok(());
        }
        if self.tile_path == TilePath::FixedFunction {
            return self.draw_tiles_fixed(surface, tiles);
        }
        self.ensure_tile_pipeline(tiles.len())?;
        let Some(pipeline) = &self.tiles else {
            return Ok(());
        };
        let (program, buffer) = (pipeline.program, pipeline.buffer);

        self.fill_tile_vertices(surface, tiles);
        let vertices = std::mem::take(&mut self.tile_scratch);
        let uploaded = self.update_buffer(buffer, &vertices);
        self.tile_scratch = vertices;
        uploaded?;

        self.use_program(program, &Uniforms::default());
        for (index, tile) in tiles.iter().enumerate() {
            self.draw(buffer, Some(tile.texture), Primitive::TriangleFan, index as u32 * 4, 4);
        }
        Ok(())
    }

    fn read_pixels(&mut self, source: ReadSource) -> DisplayResult<Vec<u8>> {
        let previous = self.bound;
        let (x, y, w, h) = match source {
            ReadSource::Backbuffer(rect) => {
                self.bind_target(RenderTarget::Backbuffer);
                self.to_gl_rect(rect)
            }
            ReadSource::Offscreen(target) => {
                self.bind_target(RenderTarget::Offscreen(target.handle));
                (0, 0, gl_size(target.size.width), gl_size(target.size.height))
            }
        };

        let mut data = vec![0u8; w.max(0) as usize * h.max(0) as usize * 3];
        unsafe {
            self.gl.pixel_store_i32(glow::PACK_ALIGNMENT, 1);
            self.gl
                .read_pixels(x, y, w, h, glow::RGB, glow::UNSIGNED_BYTE, PixelPackData::Slice(Some(&mut data)));
        }
        let checked = self.check_memory("read back");
        self.bind_target(previous);
        checked.map(|()| data)
    }

    fn present(&mut self) -> DisplayResult<()> {
        self.surface.swap_buffers()?;
        unsafe { self.gl.finish() };
        Ok(())
    }
}

impl Drop for GlowDevice {
    fn drop(&mut self) {
        if let Some(pipeline) = self.tiles.take() {
            self.delete_buffer(pipeline.buffer);
            self.delete_program(pipeline.program);
        }
        let targets: Vec<OffscreenTarget> = self.targets.values().map(|t| t.target).collect();
        for target in targets {
            self.delete_target(target);
        }
        let gl = &self.gl;
        unsafe {
            for (_, texture) in self.textures.drain() {
                gl.delete_texture(texture.texture);
            }
            for (_, buffer) in self.buffers.drain() {
                gl.delete_buffer(buffer.buffer);
            }
            for (_, program) in self.programs.drain() {
                gl.delete_program(program.program);
            }
            if let Some(vao) = self.vao.take() {
                gl.delete_vertex_array(vao);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(version: GlVersion) -> DeviceCaps {
        DeviceCaps {
            version,
            ..Default::default()
        }
    }

    #[test]
    fn test_tile_path_uses_fixed_function_without_shaders() {
        assert_eq!(tile_path(caps(GlVersion::V1_1), true).unwrap(), TilePath::FixedFunction);
        assert_eq!(tile_path(caps(GlVersion::V1_2), true).unwrap(), TilePath::FixedFunction);
    }

    #[test]
    fn test_tile_path_prefers_program_with_shaders() {
        assert_eq!(tile_path(caps(GlVersion::V2_0), true).unwrap(), TilePath::Program);
        assert_eq!(tile_path(caps(GlVersion::V3_0), false).unwrap(), TilePath::Program);
    }

    #[test]
    fn test_tile_path_rejects_unusable_context() {
        let err = tile_path(caps(GlVersion::V1_2), false).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ContextCreation);
        assert!(err.code().is_fatal());
    }

    #[test]
    fn test_fixed_function_needs_every_entry_point() {
        static ANCHOR: u8 = 0;
        let mut all = |_: &str| (&ANCHOR as *const u8).cast::<c_void>();
        assert!(unsafe { FixedFunction::load(&mut all) }.is_some());

        let mut asked = Vec::new();
        let mut missing_one = |name: &str| {
            asked.push(name.to_string());
            if name == "glTexEnvi" {
                std::ptr::null()
            } else {
                (&ANCHOR as *const u8).cast::<c_void>()
            }
        };
        assert!(unsafe { FixedFunction::load(&mut missing_one) }.is_none());
        assert_eq!(asked.last().map(String::as_str), Some("glTexEnvi"));
    }
}
