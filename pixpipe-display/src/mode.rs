//! Display mode catalog.

use crate::error::{DisplayResult, RenderError};
use pixpipe_common::Size;
use std::fmt;

/// A display mode the surface can be created in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DisplayMode {
    pub width: u32,
    pub height: u32,
    pub bits_per_pixel: u32,
}

/// Surface pixel depth. All catalog modes are RGB565.
pub const SURFACE_BPP: u32 = 16;

const fn mode(width: u32, height: u32) -> DisplayMode {
    DisplayMode {
        width,
        height,
        bits_per_pixel: SURFACE_BPP,
    }
}

/// Every mode a producer may request.
pub const MODE_CATALOG: &[DisplayMode] = &[
    mode(640, 480),
    mode(800, 600),
    mode(1024, 768),
    mode(1152, 864),
    mode(1280, 720),
    mode(1280, 768),
    mode(1280, 800),
    mode(1280, 960),
    mode(1280, 1024),
    mode(1360, 768),
    mode(1366, 768),
    mode(1400, 1050),
    mode(1440, 900),
    mode(1600, 900),
    mode(1600, 1200),
    mode(1680, 1050),
    mode(1920, 1080),
    mode(1920, 1200),
];

impl DisplayMode {
    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    /// Look up a catalog mode by dimensions.
    pub fn find(width: u32, height: u32) -> DisplayResult<DisplayMode> {
        Self::find_exact(width, height, SURFACE_BPP)
    }

    /// Look up a catalog mode by dimensions and depth.
    pub fn find_exact(width: u32, height: u32, bits_per_pixel: u32) -> DisplayResult<DisplayMode> {
        MODE_CATALOG
            .iter()
            .copied()
            .find(|m| m.width == width && m.height == height && m.bits_per_pixel == bits_per_pixel)
            .ok_or(RenderError::InvalidMode {
                width,
                height,
                bits_per_pixel,
            })
    }
}

impl fmt::Display for DisplayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}@{}", self.width, self.height, self.bits_per_pixel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_catalog_mode() {
        let m = DisplayMode::find(800, 600).unwrap();
        assert_eq!(m.bits_per_pixel, 16);
        assert_eq!(m.size(), Size::new(800, 600));
        assert_eq!(m.to_string(), "800x600@16");
    }

    #[test]
    fn test_unknown_mode_rejected() {
        assert!(matches!(
            DisplayMode::find(1000, 10),
            Err(RenderError::InvalidMode { width: 1000, .. })
        ));
        assert!(DisplayMode::find_exact(640, 480, 32).is_err());
    }

    #[test]
    fn test_catalog_fits_dirty_ring_packing() {
        for m in MODE_CATALOG {
            assert!(m.width <= u32::from(u16::MAX));
            assert!(m.height <= u32::from(u16::MAX));
        }
    }
}
