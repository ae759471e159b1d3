//! The logical surface: a 16-bit pixel buffer plus its dirty-region ring.
//!
//! # Memory Layout
//!
//! Pixels are RGB565 `u16` values in row-major order with no padding:
//!
//! ```text
//! Pixel at (x, y) is data[y * width + x]
//! ```
//!
//! The stride is measured in **pixels** and always equals the width.

use crate::dirty::{AppendOutcome, DirtyRegionQueue, DirtyRegions, UpdateRect};
use crate::error::{DisplayResult, RenderError};
use crate::mode::DisplayMode;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use pixpipe_common::{Point, Rect, Size};

/// Owned RGB565 pixel storage.
#[derive(Debug, Clone)]
pub struct SurfaceBuffer {
    width: u32,
    height: u32,
    data: Vec<u16>,
}

impl SurfaceBuffer {
    /// Create a black buffer.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; width as usize * height as usize],
        }
    }

    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    /// Stride in pixels.
    pub fn stride(&self) -> usize {
        self.width as usize
    }

    pub fn data(&self) -> &[u16] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u16] {
        &mut self.data
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<u16> {
        if x >= self.width || y >= self.height {
            return None;
        }
        Some(self.data[y as usize * self.stride() + x as usize])
    }

    fn validate_rect(&self, rect: Rect) -> DisplayResult<()> {
        if rect.x < 0
            || rect.y < 0
            || (rect.x as u32).checked_add(rect.width).map_or(true, |r| r > self.width)
            || (rect.y as u32).checked_add(rect.height).map_or(true, |b| b > self.height)
        {
            return Err(RenderError::OutOfBounds(format!(
                "{:?} (surface size: {}x{})",
                rect, self.width, self.height
            )));
        }
        Ok(())
    }

    /// Pixels from the top-left of `rect` to the end of the buffer.
    ///
    /// Rows of the rectangle start every [`stride`](Self::stride) pixels.
    pub fn region(&self, rect: Rect) -> DisplayResult<&[u16]> {
        self.validate_rect(rect)?;
        let start = rect.y as usize * self.stride() + rect.x as usize;
        Ok(&self.data[start..])
    }

    pub fn fill_rect(&mut self, rect: Rect, pixel: u16) -> DisplayResult<()> {
        self.validate_rect(rect)?;
        let stride = self.stride();
        for y in 0..rect.height as usize {
            let offset = (rect.y as usize + y) * stride + rect.x as usize;
            self.data[offset..offset + rect.width as usize].fill(pixel);
        }
        Ok(())
    }

    /// Copy `pixels` into `dest`. A `stride` of 0 means tightly packed.
    pub fn image_rect(&mut self, dest: Rect, pixels: &[u16], stride: usize) -> DisplayResult<()> {
        self.validate_rect(dest)?;
        if dest.is_empty() {
            return Ok(());
        }

        let width = dest.width as usize;
        let src_stride = if stride == 0 { width } else { stride };
        let required = src_stride * (dest.height as usize - 1) + width;
        if pixels.len() < required {
            return Err(RenderError::OutOfBounds(format!(
                "insufficient source data: got {} pixels, need at least {}",
                pixels.len(),
                required
            )));
        }

        let dst_stride = self.stride();
        for y in 0..dest.height as usize {
            let dst = (dest.y as usize + y) * dst_stride + dest.x as usize;
            let src = y * src_stride;
            self.data[dst..dst + width].copy_from_slice(&pixels[src..src + width]);
        }
        Ok(())
    }

    /// Move a block within the buffer. `src_offset` points from `dest` to the source.
    pub fn copy_rect(&mut self, dest: Rect, src_offset: Point) -> DisplayResult<()> {
        self.validate_rect(dest)?;
        let src = Rect::new(
            dest.x.saturating_add(src_offset.x),
            dest.y.saturating_add(src_offset.y),
            dest.width,
            dest.height,
        );
        self.validate_rect(src)?;

        let stride = self.stride();
        let width = dest.width as usize;
        let copy_row = |data: &mut Vec<u16>, y: usize| {
            let from = (src.y as usize + y) * stride + src.x as usize;
            let to = (dest.y as usize + y) * stride + dest.x as usize;
            data.copy_within(from..from + width, to);
        };

        // Copy bottom-up when the source lies above the destination.
        if src_offset.y < 0 {
            for y in (0..dest.height as usize).rev() {
                copy_row(&mut self.data, y);
            }
        } else {
            for y in 0..dest.height as usize {
                copy_row(&mut self.data, y);
            }
        }
        Ok(())
    }
}

/// Pixel storage and dirty ring for one display mode.
///
/// Shared as `Arc<LogicalSurface>` between the producer and the render thread.
/// The producer writes pixels under the write guard and then appends the
/// modified rectangle; the render thread drains the ring and uploads under the
/// read guard.
#[derive(Debug)]
pub struct LogicalSurface {
    mode: DisplayMode,
    pixels: RwLock<SurfaceBuffer>,
    dirty: DirtyRegionQueue,
}

impl LogicalSurface {
    pub fn new(mode: DisplayMode, dirty_capacity: usize) -> DisplayResult<Self> {
        if mode.width == 0
            || mode.height == 0
            || mode.width > u32::from(u16::MAX)
            || mode.height > u32::from(u16::MAX)
        {
            return Err(RenderError::InvalidMode {
                width: mode.width,
                height: mode.height,
                bits_per_pixel: mode.bits_per_pixel,
            });
        }
        Ok(Self {
            mode,
            pixels: RwLock::new(SurfaceBuffer::new(mode.width, mode.height)),
            dirty: DirtyRegionQueue::new(mode.size(), dirty_capacity),
        })
    }

    pub fn mode(&self) -> DisplayMode {
        self.mode
    }

    pub fn size(&self) -> Size {
        self.mode.size()
    }

    pub fn pixels(&self) -> RwLockReadGuard<'_, SurfaceBuffer> {
        self.pixels.read()
    }

    /// Write access without recording a dirty region.
    pub fn pixels_mut(&self) -> RwLockWriteGuard<'_, SurfaceBuffer> {
        self.pixels.write()
    }

    /// Record a modified region.
    pub fn submit(&self, rect: UpdateRect) -> AppendOutcome {
        self.dirty.append(rect)
    }

    /// Copy `pixels` (tightly packed) into `rect` and record it as dirty.
    pub fn write_rect(&self, rect: Rect, pixels: &[u16]) -> DisplayResult<AppendOutcome> {
        self.pixels.write().image_rect(rect, pixels, 0)?;
        Ok(self.dirty.append(rect.into()))
    }

    /// Fill `rect` with one colour and record it as dirty.
    pub fn fill_rect(&self, rect: Rect, pixel: u16) -> DisplayResult<AppendOutcome> {
        self.pixels.write().fill_rect(rect, pixel)?;
        Ok(self.dirty.append(rect.into()))
    }

    /// Force the next drain to cover the whole surface.
    pub fn invalidate(&self) {
        self.dirty.invalidate();
    }

    /// Render-thread side of the dirty ring.
    pub fn drain(&self) -> DirtyRegions {
        self.dirty.drain()
    }

    pub fn dirty_queue(&self) -> &DirtyRegionQueue {
        &self.dirty
    }
}
