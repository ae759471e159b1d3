//! Fixed-function renderer: the surface split over square power-of-two tiles.

use super::upload::{grow_to_even, Uploader};
use super::{PresentPass, Renderer, RendererKind};
use crate::dirty::DirtyRegions;
use crate::error::{DisplayResult, ErrorReporter};
use crate::filter::Filter;
use crate::gpu::{ClearMask, GraphicsDevice, ReadSource, ScaleFilter, TextureDesc, TextureHandle, TileQuad};
use crate::snapshot::Snapshot;
use crate::surface::SurfaceBuffer;
use pixpipe_common::{next_pow2, Rect, Size};
use tracing::debug;

/// Smallest tile edge, whatever the device reports.
pub const MIN_TILE_EDGE: u32 = 256;

/// How a surface is cut into tiles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileLayout {
    /// Edge of every tile texture.
    pub edge: u32,
    /// Surface area covered by each tile, row by row.
    pub tiles: Vec<Rect>,
}

/// Cut `surface` into tiles no larger than `max_texture_size`.
pub fn tile_layout(surface: Size, max_texture_size: u32) -> TileLayout {
    let edge = next_pow2(surface.max_dimension()).min(max_texture_size.max(MIN_TILE_EDGE));
    let mut tiles = Vec::new();
    let mut y = 0;
    while y < surface.height {
        let height = edge.min(surface.height - y);
        let mut x = 0;
        while x < surface.width {
            let width = edge.min(surface.width - x);
            tiles.push(Rect::new(x as i32, y as i32, width, height));
            x += edge;
        }
        y += edge;
    }
    TileLayout { edge, tiles }
}

#[derive(Debug)]
struct Tile {
    area: Rect,
    texture: TextureHandle,
}

pub struct TiledRenderer {
    surface: Size,
    edge: u32,
    tiles: Vec<Tile>,
    uploader: Uploader,
}

impl TiledRenderer {
    pub fn new(device: &mut dyn GraphicsDevice, surface: Size, native_rgb565: bool) -> DisplayResult<Self> {
        let layout = tile_layout(surface, device.caps().max_texture_size);
        let uploader = Uploader::new(native_rgb565);
        let desc = TextureDesc {
            size: Size::new(layout.edge, layout.edge),
            format: uploader.format(),
            filter: ScaleFilter::default(),
        };

        let mut tiles = Vec::with_capacity(layout.tiles.len());
        for area in layout.tiles {
            match device.create_texture(&desc) {
                Ok(texture) => tiles.push(Tile { area, texture }),
                Err(err) => {
                    for tile in tiles {
                        device.delete_texture(tile.texture);
                    }
                    return Err(err);
                }
            }
        }
        debug!(
            "Tiled renderer: {} tile(s) of {}x{} for {:?}",
            tiles.len(),
            layout.edge,
            layout.edge,
            surface
        );

        Ok(Self {
            surface,
            edge: layout.edge,
            tiles,
            uploader,
        })
    }

    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    fn upload_rect(&mut self, device: &mut dyn GraphicsDevice, pixels: &SurfaceBuffer, rect: Rect) -> DisplayResult<()> {
        for tile in &self.tiles {
            let Some(clip) = tile.area.intersect(&rect) else {
                continue;
            };
            let clip = grow_to_even(clip, tile.area.x, tile.area.right());
            let dest = Rect::new(clip.x - tile.area.x, clip.y - tile.area.y, clip.width, clip.height);
            self.uploader.upload(device, tile.texture, dest, pixels, clip)?;
        }
        Ok(())
    }

    fn quads(&self) -> Vec<TileQuad> {
        let edge = self.edge as f32;
        self.tiles
            .iter()
            .map(|tile| TileQuad {
                texture: tile.texture,
                dest: tile.area,
                tex_extent: (tile.area.width as f32 / edge, tile.area.height as f32 / edge),
            })
            .collect()
    }
}

impl Renderer for TiledRenderer {
    fn kind(&self) -> RendererKind {
        RendererKind::Tiled
    }

    fn set_filter(
        &mut self,
        device: &mut dyn GraphicsDevice,
        filter: Filter,
        _reporter: &mut ErrorReporter,
    ) -> DisplayResult<()> {
        let filter = filter.capped_for_fixed_function();
        let scale = if filter.interpolation.uses_linear_sampling() {
            ScaleFilter::Linear
        } else {
            ScaleFilter::Nearest
        };
        for tile in &self.tiles {
            device.set_texture_filter(tile.texture, scale);
        }
        Ok(())
    }

    fn upload_dirty(
        &mut self,
        device: &mut dyn GraphicsDevice,
        pixels: &SurfaceBuffer,
        regions: &mut DirtyRegions,
    ) -> DisplayResult<()> {
        if regions.is_full() {
            return self.upload_rect(device, pixels, Rect::from_size(self.surface));
        }
        let rects: Vec<Rect> = regions.iter().map(|r| r.clipped(self.surface).to_rect()).collect();
        for rect in rects {
            if !rect.is_empty() {
                self.upload_rect(device, pixels, rect)?;
            }
        }
        Ok(())
    }

    fn present(&mut self, device: &mut dyn GraphicsDevice, pass: &PresentPass<'_>) -> DisplayResult<Option<Snapshot>> {
        let view = pass.viewport.rect;
        if pass.viewport_changed {
            device.set_viewport(view);
        }
        if pass.clear {
            device.clear(ClearMask::COLOR);
        }
        device.draw_tiles(self.surface, &self.quads())?;

        if !pass.snapshot {
            return Ok(None);
        }
        let data = device.read_pixels(ReadSource::Backbuffer(view))?;
        Ok(Some(Snapshot::new(view.width, view.height, data)))
    }

    fn teardown(self: Box<Self>, device: &mut dyn GraphicsDevice) {
        for tile in self.tiles {
            device.delete_texture(tile.texture);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dirty::{DirtyRegionQueue, UpdateRect};
    use crate::error::TracingErrorSink;
    use crate::filter::Interpolation;
    use crate::gpu::{DeviceCall, DeviceCaps, GlVersion, HeadlessDevice, HeadlessOptions};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn tiled_device(max_texture_size: u32) -> (HeadlessDevice, crate::gpu::HeadlessProbe) {
        HeadlessDevice::new(HeadlessOptions::with_caps(DeviceCaps {
            version: GlVersion::V1_1,
            max_texture_size,
            native_rgb565: false,
        }))
    }

    #[test]
    fn test_layout_single_tile() {
        let layout = tile_layout(Size::new(640, 480), 2048);
        assert_eq!(layout.edge, 1024);
        assert_eq!(layout.tiles, vec![Rect::new(0, 0, 640, 480)]);
    }

    #[test]
    fn test_layout_grid() {
        let layout = tile_layout(Size::new(2050, 1030), 1024);
        assert_eq!(layout.edge, 1024);
        assert_eq!(layout.tiles.len(), 6);
        assert_eq!(layout.tiles[2], Rect::new(2048, 0, 2, 1024));
        assert_eq!(layout.tiles[5], Rect::new(2048, 1024, 2, 6));
    }

    #[test]
    fn test_layout_edge_floor() {
        assert_eq!(tile_layout(Size::new(640, 480), 64).edge, MIN_TILE_EDGE);
    }

    #[test]
    fn test_renderer_allocates_one_texture_per_tile() {
        let (mut device, probe) = tiled_device(1024);
        let renderer = TiledRenderer::new(&mut device, Size::new(2050, 1030), false).unwrap();
        assert_eq!(renderer.tile_count(), 6);
        assert_eq!(probe.live_textures(), 6);
        Box::new(renderer).teardown(&mut device);
        assert_eq!(probe.live_textures(), 0);
    }

    #[test]
    fn test_upload_splits_across_tiles() {
        let surface = Size::new(2050, 1030);
        let (mut device, probe) = tiled_device(1024);
        let mut renderer = TiledRenderer::new(&mut device, surface, false).unwrap();
        let pixels = SurfaceBuffer::new(surface.width, surface.height);

        let queue = DirtyRegionQueue::new(surface, 8);
        let _ = queue.drain();
        queue.append(UpdateRect::new(1020, 1020, 1030, 1026));
        let mut regions = queue.drain();
        probe.clear_calls();
        renderer.upload_dirty(&mut device, &pixels, &mut regions).unwrap();

        let regions: Vec<Rect> = probe.uploads().into_iter().map(|(_, r)| r).collect();
        assert_eq!(
            regions,
            vec![
                Rect::new(1020, 1020, 4, 4),
                Rect::new(0, 1020, 6, 4),
                Rect::new(1020, 0, 4, 2),
                Rect::new(0, 0, 6, 2),
            ]
        );
    }

    #[test]
    fn test_odd_width_at_tile_edge_grows_right() {
        let surface = Size::new(640, 480);
        let (mut device, probe) = tiled_device(1024);
        let mut renderer = TiledRenderer::new(&mut device, surface, false).unwrap();
        let pixels = SurfaceBuffer::new(surface.width, surface.height);
        let queue = DirtyRegionQueue::new(surface, 8);
        let _ = queue.drain();
        queue.append(UpdateRect::new(0, 10, 7, 11));
        let mut regions = queue.drain();
        probe.clear_calls();
        renderer.upload_dirty(&mut device, &pixels, &mut regions).unwrap();
        assert_eq!(probe.uploads()[0].1, Rect::new(0, 10, 8, 1));
    }

    #[test]
    fn test_filter_caps_to_sampling() {
        let (mut device, probe) = tiled_device(1024);
        let mut renderer = TiledRenderer::new(&mut device, Size::new(640, 480), false).unwrap();
        let mut reporter = ErrorReporter::new(Arc::new(TracingErrorSink));
        renderer
            .set_filter(&mut device, Filter::new(Interpolation::Nearest, None), &mut reporter)
            .unwrap();
        assert!(probe
            .calls()
            .iter()
            .any(|c| matches!(c, DeviceCall::TextureFilter { filter: ScaleFilter::Nearest, .. })));
    }
}
