//! In-memory graphics device.
//!
//! Textures hold real RGBA8 texels so uploads can be inspected; draws,
//! state changes and presents are recorded as [`DeviceCall`]s. A
//! [`HeadlessProbe`] shares the device state and stays usable from the test
//! thread while the device itself lives on the render thread.

use super::{
    BufferHandle, BufferUsage, ClearMask, DeviceCaps, DeviceFactory, GraphicsDevice,
    OffscreenTarget, PixelData, Primitive, ProgramHandle, ProgramSource, ReadSource,
    RenderTarget, ScaleFilter, StencilMode, TargetHandle, TextureDesc, TextureFormat,
    TextureHandle, TileQuad, Uniforms, VertexLayout,
};
use crate::error::{DisplayResult, RenderError};
use parking_lot::Mutex;
use pixpipe_common::{rgb565, Rect, Size};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

/// Behaviour of a [`HeadlessDevice`].
#[derive(Debug, Clone)]
pub struct HeadlessOptions {
    pub caps: DeviceCaps,
    /// Keep a log of every call. Disable for long runs.
    pub record_calls: bool,
    /// Program names whose compilation fails.
    pub failing_programs: Vec<String>,
    /// Total texture and target memory in bytes before allocations fail.
    pub memory_budget: Option<u64>,
    /// Fail every offscreen target allocation.
    pub fail_targets: bool,
    /// Draw tiles through a shader program instead of fixed-function state,
    /// like a GL device built without its fixed-function entry points.
    /// Tile draws then fail below GL 2.0.
    pub program_tiles: bool,
    /// Number of read-backs that run out of memory before reads succeed.
    pub failing_reads: u32,
}

impl Default for HeadlessOptions {
    fn default() -> Self {
        Self {
            caps: DeviceCaps::default(),
            record_calls: true,
            failing_programs: Vec::new(),
            memory_budget: None,
            fail_targets: false,
            program_tiles: false,
            failing_reads: 0,
        }
    }
}

impl HeadlessOptions {
    pub fn with_caps(caps: DeviceCaps) -> Self {
        Self {
            caps,
            ..Default::default()
        }
    }
}

/// One recorded device call.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCall {
    SwapInterval(bool),
    CreateTexture { texture: TextureHandle, desc: TextureDesc },
    TextureFilter { texture: TextureHandle, filter: ScaleFilter },
    Upload { texture: TextureHandle, region: Rect, format: TextureFormat },
    DeleteTexture(TextureHandle),
    CreateBuffer { buffer: BufferHandle, layout: VertexLayout, vertices: usize },
    UpdateBuffer { buffer: BufferHandle, floats: usize },
    DeleteBuffer(BufferHandle),
    CreateTarget(OffscreenTarget),
    DeleteTarget(TargetHandle),
    BindTarget(RenderTarget),
    Viewport(Rect),
    Clear(ClearMask),
    Stencil(StencilMode),
    CompileProgram { program: ProgramHandle, name: String },
    UseProgram { name: String, tex_size: Option<u32> },
    DeleteProgram(ProgramHandle),
    Draw {
        texture: Option<TextureHandle>,
        primitive: Primitive,
        first: u32,
        count: u32,
    },
    DrawTiles(Vec<TileQuad>),
    ReadPixels(ReadSource),
    Present,
}

struct TextureRecord {
    desc: TextureDesc,
    texels: Vec<u8>,
}

struct BufferRecord {
    layout: VertexLayout,
    vertices: usize,
    data: Vec<f32>,
}

#[derive(Default)]
struct HeadlessState {
    next_id: u32,
    textures: HashMap<TextureHandle, TextureRecord>,
    buffers: HashMap<BufferHandle, BufferRecord>,
    targets: HashMap<TargetHandle, OffscreenTarget>,
    programs: HashMap<ProgramHandle, String>,
    calls: Vec<DeviceCall>,
    frames: u64,
    uploaded_texels: u64,
    vsync: Option<bool>,
}

impl HeadlessState {
    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn memory_in_use(&self) -> u64 {
        let textures: u64 = self
            .textures
            .values()
            .map(|t| t.desc.size.area() * bytes_per_texel(t.desc.format))
            .sum();
        // Colour texture is counted above; add the depth/stencil renderbuffer.
        let stencil: u64 = self.targets.values().map(|t| t.size.area() * 4).sum();
        textures + stencil
    }
}

fn bytes_per_texel(format: TextureFormat) -> u64 {
    match format {
        TextureFormat::Rgb565 => 2,
        TextureFormat::Rgba8 => 4,
    }
}

/// A graphics device without a GPU.
pub struct HeadlessDevice {
    options: HeadlessOptions,
    state: Arc<Mutex<HeadlessState>>,
}

impl HeadlessDevice {
    pub fn new(options: HeadlessOptions) -> (Self, HeadlessProbe) {
        let state = Arc::new(Mutex::new(HeadlessState::default()));
        let probe = HeadlessProbe {
            state: state.clone(),
        };
        (Self { options, state }, probe)
    }

    /// A factory whose devices all share one probe.
    pub fn factory(options: HeadlessOptions) -> (Arc<dyn DeviceFactory>, HeadlessProbe) {
        let state = Arc::new(Mutex::new(HeadlessState::default()));
        let probe = HeadlessProbe {
            state: state.clone(),
        };
        let factory = move || -> DisplayResult<Box<dyn GraphicsDevice>> {
            Ok(Box::new(HeadlessDevice {
                options: options.clone(),
                state: state.clone(),
            }))
        };
        let factory: Arc<dyn DeviceFactory> = Arc::new(factory);
        (factory, probe)
    }

    fn record(&self, call: DeviceCall) {
        if self.options.record_calls {
            self.state.lock().calls.push(call);
        }
    }

    fn check_budget(&self, state: &HeadlessState, extra: u64) -> DisplayResult<()> {
        match self.options.memory_budget {
            Some(budget) if state.memory_in_use() + extra > budget => {
                Err(RenderError::ResourceExhausted(format!(
                    "headless budget of {} bytes exceeded",
                    budget
                )))
            }
            _ => Ok(()),
        }
    }
}

impl GraphicsDevice for HeadlessDevice {
    fn caps(&self) -> DeviceCaps {
        self.options.caps
    }

    fn set_swap_interval(&mut self, vsync: bool) {
        self.state.lock().vsync = Some(vsync);
        self.record(DeviceCall::SwapInterval(vsync));
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> DisplayResult<TextureHandle> {
        let max = self.options.caps.max_texture_size;
        if desc.size.width > max || desc.size.height > max {
            return Err(RenderError::ResourceExhausted(format!(
                "texture {}x{} exceeds maximum {}",
                desc.size.width, desc.size.height, max
            )));
        }
        let texture = {
            let mut state = self.state.lock();
            self.check_budget(&state, desc.size.area() * bytes_per_texel(desc.format))?;
            let texture = TextureHandle(state.next_id());
            state.textures.insert(
                texture,
                TextureRecord {
                    desc: *desc,
                    texels: vec![0; desc.size.area() as usize * 4],
                },
            );
            texture
        };
        self.record(DeviceCall::CreateTexture { texture, desc: *desc });
        Ok(texture)
    }

    fn set_texture_filter(&mut self, texture: TextureHandle, filter: ScaleFilter) {
        if let Some(record) = self.state.lock().textures.get_mut(&texture) {
            record.desc.filter = filter;
        }
        self.record(DeviceCall::TextureFilter { texture, filter });
    }

    fn upload(&mut self, texture: TextureHandle, region: Rect, data: PixelData<'_>) -> DisplayResult<()> {
        let format = {
            let mut state = self.state.lock();
            let record = state
                .textures
                .get_mut(&texture)
                .ok_or_else(|| RenderError::OutOfBounds(format!("unknown texture {:?}", texture)))?;
            let bounds = Rect::from_size(record.desc.size);
            if region.x < 0 || region.y < 0 || !bounds.contains_rect(&region) {
                return Err(RenderError::OutOfBounds(format!(
                    "upload {:?} outside texture {:?}",
                    region, record.desc.size
                )));
            }

            let tex_width = record.desc.size.width as usize;
            let (w, h) = (region.width as usize, region.height as usize);
            let format = match data {
                PixelData::Rgb565 { pixels, row_length } => {
                    let row_length = row_length as usize;
                    if h > 0 && pixels.len() < (h - 1) * row_length + w {
                        return Err(RenderError::OutOfBounds("short RGB565 upload".into()));
                    }
                    for y in 0..h {
                        for x in 0..w {
                            let texel = rgb565::expand(pixels[y * row_length + x]);
                            let at = ((region.y as usize + y) * tex_width + region.x as usize + x) * 4;
                            record.texels[at..at + 4].copy_from_slice(&texel);
                        }
                    }
                    TextureFormat::Rgb565
                }
                PixelData::Rgba8 { bytes } => {
                    if bytes.len() < w * h * 4 {
                        return Err(RenderError::OutOfBounds("short RGBA8 upload".into()));
                    }
                    for y in 0..h {
                        let at = ((region.y as usize + y) * tex_width + region.x as usize) * 4;
                        record.texels[at..at + w * 4].copy_from_slice(&bytes[y * w * 4..(y + 1) * w * 4]);
                    }
                    TextureFormat::Rgba8
                }
            };
            state.uploaded_texels += region.area();
            format
        };
        trace!("Headless upload {:?} into {:?}", region, texture);
        self.record(DeviceCall::Upload {
            texture,
            region,
            format,
        });
        Ok(())
    }

    fn delete_texture(&mut self, texture: TextureHandle) {
        self.state.lock().textures.remove(&texture);
        self.record(DeviceCall::DeleteTexture(texture));
    }

    fn create_buffer(
        &mut self,
        layout: VertexLayout,
        _usage: BufferUsage,
        vertices: usize,
        data: Option<&[f32]>,
    ) -> DisplayResult<BufferHandle> {
        let buffer = {
            let mut state = self.state.lock();
            let buffer = BufferHandle(state.next_id());
            let mut contents = vec![0.0; vertices * layout.floats_per_vertex()];
            if let Some(data) = data {
                let n = data.len().min(contents.len());
                contents[..n].copy_from_slice(&data[..n]);
            }
            state.buffers.insert(
                buffer,
                BufferRecord {
                    layout,
                    vertices,
                    data: contents,
                },
            );
            buffer
        };
        self.record(DeviceCall::CreateBuffer {
            buffer,
            layout,
            vertices,
        });
        Ok(buffer)
    }

    fn update_buffer(&mut self, buffer: BufferHandle, data: &[f32]) -> DisplayResult<()> {
        {
            let mut state = self.state.lock();
            let record = state
                .buffers
                .get_mut(&buffer)
                .ok_or_else(|| RenderError::OutOfBounds(format!("unknown buffer {:?}", buffer)))?;
            if data.len() > record.vertices * record.layout.floats_per_vertex() {
                return Err(RenderError::OutOfBounds(format!(
                    "{} floats exceed buffer of {} vertices",
                    data.len(),
                    record.vertices
                )));
            }
            record.data[..data.len()].copy_from_slice(data);
        }
        self.record(DeviceCall::UpdateBuffer {
            buffer,
            floats: data.len(),
        });
        Ok(())
    }

    fn delete_buffer(&mut self, buffer: BufferHandle) {
        self.state.lock().buffers.remove(&buffer);
        self.record(DeviceCall::DeleteBuffer(buffer));
    }

    fn create_target(&mut self, size: Size) -> DisplayResult<OffscreenTarget> {
        if self.options.fail_targets {
            return Err(RenderError::ResourceExhausted(format!(
                "offscreen target {}x{}",
                size.width, size.height
            )));
        }
        let color = self.create_texture(&TextureDesc {
            size,
            format: TextureFormat::Rgba8,
            filter: ScaleFilter::Nearest,
        })?;
        let target = {
            let mut state = self.state.lock();
            if let Err(err) = self.check_budget(&state, size.area() * 4) {
                state.textures.remove(&color);
                return Err(err);
            }
            let target = OffscreenTarget {
                handle: TargetHandle(state.next_id()),
                color,
                size,
            };
            state.targets.insert(target.handle, target);
            target
        };
        self.record(DeviceCall::CreateTarget(target));
        Ok(target)
    }

    fn delete_target(&mut self, target: OffscreenTarget) {
        {
            let mut state = self.state.lock();
            state.targets.remove(&target.handle);
            state.textures.remove(&target.color);
        }
        self.record(DeviceCall::DeleteTarget(target.handle));
    }

    fn bind_target(&mut self, target: RenderTarget) {
        self.record(DeviceCall::BindTarget(target));
    }

    fn set_viewport(&mut self, rect: Rect) {
        self.record(DeviceCall::Viewport(rect));
    }

    fn clear(&mut self, mask: ClearMask) {
        self.record(DeviceCall::Clear(mask));
    }

    fn set_stencil(&mut self, mode: StencilMode) {
        self.record(DeviceCall::Stencil(mode));
    }

    fn compile_program(&mut self, source: &ProgramSource<'_>) -> DisplayResult<ProgramHandle> {
        if !self.options.caps.supports_shaders() {
            return Err(RenderError::ShaderCompile {
                program: source.name.to_string(),
                log: "device has no programmable pipeline".into(),
            });
        }
        if source.vertex.trim().is_empty()
            || source.fragment.trim().is_empty()
            || self.options.failing_programs.iter().any(|p| p == source.name)
        {
            return Err(RenderError::ShaderCompile {
                program: source.name.to_string(),
                log: "rejected by headless device".into(),
            });
        }
        let program = {
            let mut state = self.state.lock();
            let program = ProgramHandle(state.next_id());
            state.programs.insert(program, source.name.to_string());
            program
        };
        self.record(DeviceCall::CompileProgram {
            program,
            name: source.name.to_string(),
        });
        Ok(program)
    }

    fn use_program(&mut self, program: ProgramHandle, uniforms: &Uniforms<'_>) {
        let name = self
            .state
            .lock()
            .programs
            .get(&program)
            .cloned()
            .unwrap_or_default();
        self.record(DeviceCall::UseProgram {
            name,
            tex_size: uniforms.tex_size,
        });
    }

    fn delete_program(&mut self, program: ProgramHandle) {
        self.state.lock().programs.remove(&program);
        self.record(DeviceCall::DeleteProgram(program));
    }

    fn draw(
        &mut self,
        _buffer: BufferHandle,
        texture: Option<TextureHandle>,
        primitive: Primitive,
        first: u32,
        count: u32,
    ) {
        self.record(DeviceCall::Draw {
            texture,
            primitive,
            first,
            count,
        });
    }

    fn draw_tiles(&mut self, _surface: Size, tiles: &[TileQuad]) -> DisplayResult<()> {
        if self.options.program_tiles && !self.options.caps.supports_shaders() {
            return Err(RenderError::ShaderCompile {
                program: "tiles".into(),
                log: "device has no programmable pipeline".into(),
            });
        }
        self.record(DeviceCall::DrawTiles(tiles.to_vec()));
        Ok(())
    }

    fn read_pixels(&mut self, source: ReadSource) -> DisplayResult<Vec<u8>> {
        self.record(DeviceCall::ReadPixels(source));
        if self.options.failing_reads > 0 {
            self.options.failing_reads -= 1;
            return Err(RenderError::ResourceExhausted("read back".into()));
        }
        match source {
            ReadSource::Backbuffer(rect) => Ok(vec![0; rect.area() as usize * 3]),
            ReadSource::Offscreen(target) => {
                let state = self.state.lock();
                let record = state.textures.get(&target.color).ok_or_else(|| {
                    RenderError::OutOfBounds(format!("unknown target {:?}", target.handle))
                })?;
                Ok(record
                    .texels
                    .chunks_exact(4)
                    .flat_map(|texel| [texel[0], texel[1], texel[2]])
                    .collect())
            }
        }
    }

    fn present(&mut self) -> DisplayResult<()> {
        self.state.lock().frames += 1;
        self.record(DeviceCall::Present);
        Ok(())
    }
}

/// Read-only view of a headless device's state.
#[derive(Clone)]
pub struct HeadlessProbe {
    state: Arc<Mutex<HeadlessState>>,
}

impl HeadlessProbe {
    pub fn calls(&self) -> Vec<DeviceCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn frames_presented(&self) -> u64 {
        self.state.lock().frames
    }

    pub fn uploaded_texels(&self) -> u64 {
        self.state.lock().uploaded_texels
    }

    pub fn vsync(&self) -> Option<bool> {
        self.state.lock().vsync
    }

    pub fn live_textures(&self) -> usize {
        self.state.lock().textures.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn live_targets(&self) -> usize {
        self.state.lock().targets.len()
    }

    pub fn live_programs(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().programs.values().cloned().collect();
        names.sort();
        names
    }

    /// Sizes of live textures, sorted by handle.
    pub fn texture_sizes(&self) -> Vec<Size> {
        let state = self.state.lock();
        let mut handles: Vec<_> = state.textures.keys().copied().collect();
        handles.sort();
        handles.iter().map(|h| state.textures[h].desc.size).collect()
    }

    pub fn texture_filter(&self, texture: TextureHandle) -> Option<ScaleFilter> {
        self.state.lock().textures.get(&texture).map(|t| t.desc.filter)
    }

    /// RGBA texel of a live texture.
    pub fn texel(&self, texture: TextureHandle, x: u32, y: u32) -> Option<[u8; 4]> {
        let state = self.state.lock();
        let record = state.textures.get(&texture)?;
        if x >= record.desc.size.width || y >= record.desc.size.height {
            return None;
        }
        let at = (y as usize * record.desc.size.width as usize + x as usize) * 4;
        let mut texel = [0; 4];
        texel.copy_from_slice(&record.texels[at..at + 4]);
        Some(texel)
    }

    /// Regions uploaded since the call log was last cleared.
    pub fn uploads(&self) -> Vec<(TextureHandle, Rect)> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                DeviceCall::Upload { texture, region, .. } => Some((*texture, *region)),
                _ => None,
            })
            .collect()
    }

    /// Contents of a live vertex buffer.
    pub fn buffer_data(&self, buffer: BufferHandle) -> Option<Vec<f32>> {
        self.state.lock().buffers.get(&buffer).map(|b| b.data.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::GlVersion;
    use pretty_assertions::assert_eq;

    fn device() -> (HeadlessDevice, HeadlessProbe) {
        HeadlessDevice::new(HeadlessOptions::default())
    }

    #[test]
    fn test_rgb565_upload_expands_texels() {
        let (mut dev, probe) = device();
        let texture = dev
            .create_texture(&TextureDesc {
                size: Size::new(4, 4),
                format: TextureFormat::Rgb565,
                filter: ScaleFilter::Linear,
            })
            .unwrap();

        let pixels = [0xF800, 0x07E0, 0xAAAA, 0x001F, 0xFFFF, 0xAAAA];
        dev.upload(
            texture,
            Rect::new(1, 1, 2, 2),
            PixelData::Rgb565 {
                pixels: &pixels,
                row_length: 3,
            },
        )
        .unwrap();

        assert_eq!(probe.texel(texture, 1, 1), Some([0xF8, 0, 0, 0xFF]));
        assert_eq!(probe.texel(texture, 2, 1), Some([0, 0xFC, 0, 0xFF]));
        assert_eq!(probe.texel(texture, 1, 2), Some([0, 0, 0xF8, 0xFF]));
        assert_eq!(probe.texel(texture, 0, 0), Some([0, 0, 0, 0]));
        assert_eq!(probe.uploads(), vec![(texture, Rect::new(1, 1, 2, 2))]);
        assert_eq!(probe.uploaded_texels(), 4);
    }

    #[test]
    fn test_upload_outside_texture_fails() {
        let (mut dev, _) = device();
        let texture = dev
            .create_texture(&TextureDesc {
                size: Size::new(2, 2),
                format: TextureFormat::Rgba8,
                filter: ScaleFilter::Nearest,
            })
            .unwrap();
        let bytes = [0u8; 36];
        assert!(dev
            .upload(texture, Rect::new(0, 0, 3, 3), PixelData::Rgba8 { bytes: &bytes })
            .is_err());
    }

    #[test]
    fn test_budget_and_max_texture() {
        let (mut dev, probe) = HeadlessDevice::new(HeadlessOptions {
            caps: DeviceCaps {
                max_texture_size: 256,
                ..Default::default()
            },
            memory_budget: Some(256 * 256 * 2),
            ..Default::default()
        });
        let desc = TextureDesc {
            size: Size::new(256, 256),
            format: TextureFormat::Rgb565,
            filter: ScaleFilter::Linear,
        };
        dev.create_texture(&desc).unwrap();
        assert!(matches!(
            dev.create_texture(&desc),
            Err(RenderError::ResourceExhausted(_))
        ));
        assert!(dev
            .create_texture(&TextureDesc {
                size: Size::new(512, 1),
                ..desc
            })
            .is_err());
        assert_eq!(probe.live_textures(), 1);
    }

    #[test]
    fn test_target_lifecycle() {
        let (mut dev, probe) = device();
        let target = dev.create_target(Size::new(8, 4)).unwrap();
        assert_eq!(probe.live_targets(), 1);
        assert_eq!(probe.live_textures(), 1);

        let rgb = dev.read_pixels(ReadSource::Offscreen(target)).unwrap();
        assert_eq!(rgb.len(), 8 * 4 * 3);

        dev.delete_target(target);
        assert_eq!(probe.live_targets(), 0);
        assert_eq!(probe.live_textures(), 0);
    }

    #[test]
    fn test_programs_need_shader_tier() {
        let (mut dev, _) = HeadlessDevice::new(HeadlessOptions::with_caps(DeviceCaps {
            version: GlVersion::V1_1,
            ..Default::default()
        }));
        let source = ProgramSource {
            name: "linear",
            vertex: "void main() {}",
            fragment: "void main() {}",
        };
        assert!(dev.compile_program(&source).is_err());
    }

    #[test]
    fn test_tiles_need_program_only_when_requested() {
        let caps = DeviceCaps {
            version: GlVersion::V1_2,
            ..Default::default()
        };
        let tile = TileQuad {
            texture: TextureHandle(1),
            dest: Rect::new(0, 0, 16, 16),
            tex_extent: (1.0, 1.0),
        };

        let (mut fixed, _) = HeadlessDevice::new(HeadlessOptions::with_caps(caps));
        fixed.draw_tiles(Size::new(16, 16), &[tile]).unwrap();

        let (mut programmed, recorded) = HeadlessDevice::new(HeadlessOptions {
            program_tiles: true,
            ..HeadlessOptions::with_caps(caps)
        });
        let err = programmed.draw_tiles(Size::new(16, 16), &[tile]).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::ShaderCompile);
        assert!(recorded.calls().is_empty());
    }

    #[test]
    fn test_factory_shares_probe() {
        let (factory, probe) = HeadlessDevice::factory(HeadlessOptions::default());
        let mut a = factory.create().unwrap();
        a.present().unwrap();
        let mut b = factory.create().unwrap();
        b.present().unwrap();
        assert_eq!(probe.frames_presented(), 2);
        assert_eq!(probe.calls(), vec![DeviceCall::Present, DeviceCall::Present]);
    }
}
