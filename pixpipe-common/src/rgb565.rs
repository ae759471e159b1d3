//! RGB565 pixel helpers.
//!
//! The logical surface stores pixels as 16-bit words with the red channel in the
//! top five bits, green in the middle six and blue in the low five:
//!
//! ```text
//! 15      11 10        5 4       0
//! [ R R R R R G G G G G G B B B B B ]
//! ```
//!
//! Expansion to 8 bits per channel is a plain left shift (no bit replication), so a
//! full-intensity channel expands to `0xF8` / `0xFC`. This matches what a GPU's
//! fixed conversion of `UNSIGNED_SHORT_5_6_5` data looks like closely enough for a
//! fallback path and keeps the inner loop to three masks and shifts.

/// Mask of the red channel.
pub const RED_MASK: u16 = 0xF800;
/// Mask of the green channel.
pub const GREEN_MASK: u16 = 0x07E0;
/// Mask of the blue channel.
pub const BLUE_MASK: u16 = 0x001F;

/// Pack 8-bit channels into a 565 word, dropping the low bits.
pub const fn pack(r: u8, g: u8, b: u8) -> u16 {
    ((r as u16 & 0xF8) << 8) | ((g as u16 & 0xFC) << 3) | (b as u16 >> 3)
}

/// Expand a 565 word into RGBA8 bytes with opaque alpha.
#[inline]
pub const fn expand(px: u16) -> [u8; 4] {
    [
        ((px & RED_MASK) >> 8) as u8,
        ((px & GREEN_MASK) >> 3) as u8,
        ((px & BLUE_MASK) << 3) as u8,
        0xFF,
    ]
}

/// Expand a 565 word into packed RGB8 bytes.
#[inline]
pub const fn expand_rgb(px: u16) -> [u8; 3] {
    let [r, g, b, _] = expand(px);
    [r, g, b]
}

/// Expand a `width × height` block of 565 pixels read with a row stride of
/// `stride` pixels into tightly packed RGBA8 bytes.
///
/// `dst` is cleared first and reused across calls so the render loop does not
/// allocate per upload.
pub fn expand_block(src: &[u16], stride: usize, width: usize, height: usize, dst: &mut Vec<u8>) {
    dst.clear();
    dst.reserve(width * height * 4);
    for row in src.chunks(stride).take(height) {
        for &px in &row[..width] {
            dst.extend_from_slice(&expand(px));
        }
    }
}
