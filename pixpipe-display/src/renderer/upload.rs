//! Texture uploads of dirty surface regions.

use crate::dirty::DirtyRegions;
use crate::error::DisplayResult;
use crate::gpu::{GraphicsDevice, PixelData, TextureFormat, TextureHandle};
use crate::surface::SurfaceBuffer;
use pixpipe_common::{rgb565, Rect};
use tracing::trace;

/// Widen an odd-width rectangle by one column so 16-bit rows stay 4-byte aligned.
///
/// Grows left unless the rectangle already starts at `anchor_x`, otherwise
/// right unless that would pass `max_right`. A rectangle pinned at both ends
/// is returned unchanged.
pub fn grow_to_even(clip: Rect, anchor_x: i32, max_right: i32) -> Rect {
    if clip.width % 2 == 0 {
        return clip;
    }
    if clip.x != anchor_x {
        Rect::new(clip.x - 1, clip.y, clip.width + 1, clip.height)
    } else if clip.right() < max_right {
        Rect::new(clip.x, clip.y, clip.width + 1, clip.height)
    } else {
        clip
    }
}

/// Moves surface pixels into textures, either as packed RGB565 or expanded.
#[derive(Debug)]
pub(crate) struct Uploader {
    native_rgb565: bool,
    scratch: Vec<u8>,
}

impl Uploader {
    pub fn new(native_rgb565: bool) -> Self {
        Self {
            native_rgb565,
            scratch: Vec::new(),
        }
    }

    pub fn format(&self) -> TextureFormat {
        if self.native_rgb565 {
            TextureFormat::Rgb565
        } else {
            TextureFormat::Rgba8
        }
    }

    /// Copy `src` of the surface into `dest` of `texture`. Both have the same size.
    pub fn upload(
        &mut self,
        device: &mut dyn GraphicsDevice,
        texture: TextureHandle,
        dest: Rect,
        pixels: &SurfaceBuffer,
        src: Rect,
    ) -> DisplayResult<()> {
        if src.is_empty() {
            return Ok(());
        }
        let rows = pixels.region(src)?;
        trace!("Uploading {:?} to {:?} of {:?}", src, dest, texture);
        if self.native_rgb565 {
            device.upload(
                texture,
                dest,
                PixelData::Rgb565 {
                    pixels: rows,
                    row_length: pixels.stride() as u32,
                },
            )
        } else {
            rgb565::expand_block(
                rows,
                pixels.stride(),
                src.width as usize,
                src.height as usize,
                &mut self.scratch,
            );
            device.upload(texture, dest, PixelData::Rgba8 { bytes: &self.scratch })
        }
    }

    /// Upload every active region into a texture holding the surface at its origin.
    pub fn upload_regions(
        &mut self,
        device: &mut dyn GraphicsDevice,
        texture: TextureHandle,
        pixels: &SurfaceBuffer,
        regions: &DirtyRegions,
    ) -> DisplayResult<()> {
        let size = pixels.size();
        if regions.is_full() {
            let full = Rect::from_size(size);
            return self.upload(device, texture, full, pixels, full);
        }
        for rect in regions.iter() {
            let clip = rect.clipped(size).to_rect();
            if clip.is_empty() {
                continue;
            }
            // Full-width strips are contiguous rows already.
            let clip = if clip.x == 0 && clip.width == size.width {
                clip
            } else {
                grow_to_even(clip, 0, size.width as i32)
            };
            self.upload(device, texture, clip, pixels, clip)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dirty::{DirtyRegionQueue, UpdateRect};
    use crate::gpu::{HeadlessDevice, HeadlessOptions, ScaleFilter, TextureDesc};
    use pixpipe_common::Size;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_grow_to_even() {
        // Odd width at the anchor grows right.
        assert_eq!(grow_to_even(Rect::new(0, 0, 7, 4), 0, 64), Rect::new(0, 0, 8, 4));
        // Away from the anchor grows left.
        assert_eq!(grow_to_even(Rect::new(5, 2, 3, 1), 0, 64), Rect::new(4, 2, 4, 1));
        // Pinned at both ends stays odd.
        assert_eq!(grow_to_even(Rect::new(0, 0, 7, 1), 0, 7), Rect::new(0, 0, 7, 1));
        // Even widths are untouched.
        assert_eq!(grow_to_even(Rect::new(3, 0, 6, 1), 0, 64), Rect::new(3, 0, 6, 1));
    }

    fn surface_with_gradient(size: Size) -> SurfaceBuffer {
        let mut buffer = SurfaceBuffer::new(size.width, size.height);
        for (i, px) in buffer.data_mut().iter_mut().enumerate() {
            *px = i as u16;
        }
        buffer
    }

    fn texture(device: &mut HeadlessDevice, size: Size, format: TextureFormat) -> TextureHandle {
        device
            .create_texture(&TextureDesc {
                size,
                format,
                filter: ScaleFilter::Nearest,
            })
            .unwrap()
    }

    #[test]
    fn test_native_and_expanded_paths_agree() {
        let size = Size::new(16, 8);
        let pixels = surface_with_gradient(size);
        let region = Rect::new(3, 2, 5, 4);

        let (mut device, probe) = HeadlessDevice::new(HeadlessOptions::default());
        let native = texture(&mut device, size, TextureFormat::Rgb565);
        let expanded = texture(&mut device, size, TextureFormat::Rgba8);
        Uploader::new(true)
            .upload(&mut device, native, region, &pixels, region)
            .unwrap();
        Uploader::new(false)
            .upload(&mut device, expanded, region, &pixels, region)
            .unwrap();

        for y in 2..6 {
            for x in 3..8 {
                let expected = rgb565::expand(pixels.pixel(x, y).unwrap());
                assert_eq!(probe.texel(native, x, y), Some(expected));
                assert_eq!(probe.texel(expanded, x, y), Some(expected));
            }
        }
    }

    #[test]
    fn test_regions_widen_odd_rects() {
        let size = Size::new(32, 8);
        let pixels = surface_with_gradient(size);
        let queue = DirtyRegionQueue::new(size, 8);
        // Consume the initial full drain.
        let _ = queue.drain();
        queue.append(UpdateRect::new(0, 0, 7, 1));
        queue.append(UpdateRect::new(0, 4, 32, 6));
        let regions = queue.drain();

        let (mut device, probe) = HeadlessDevice::new(HeadlessOptions::default());
        let tex = texture(&mut device, size, TextureFormat::Rgb565);
        probe.clear_calls();
        Uploader::new(true)
            .upload_regions(&mut device, tex, &pixels, &regions)
            .unwrap();
        assert_eq!(
            probe.uploads(),
            vec![(tex, Rect::new(0, 0, 8, 1)), (tex, Rect::new(0, 4, 32, 2))]
        );
    }
}
