//! Common types and utilities shared by the pixpipe crates.
//!
//! This crate provides the small value types used across the presentation pipeline:
//! - [`Point`] - 2D point with i32 coordinates
//! - [`Size`] - width/height pair in pixels
//! - [`Rect`] - Rectangle with position and dimensions
//! - [`rgb565`] - packing and expansion helpers for 16-bit 5-6-5 pixels

pub mod rgb565;

/// A 2D point with integer coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    /// Create a new point.
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Width and height in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    /// Create a new size.
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// True when either dimension is zero.
    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// The larger of the two dimensions.
    pub const fn max_dimension(&self) -> u32 {
        if self.width > self.height {
            self.width
        } else {
            self.height
        }
    }

    /// Both dimensions multiplied by an integer factor.
    pub const fn scaled(&self, factor: u32) -> Self {
        Self::new(self.width * factor, self.height * factor)
    }

    /// Number of pixels covered.
    pub const fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// A rectangle defined by top-left position and dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    /// Create a new rectangle.
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Rectangle at the origin covering `size`.
    pub const fn from_size(size: Size) -> Self {
        Self::new(0, 0, size.width, size.height)
    }

    /// Build a rectangle from its edges; inverted edges yield an empty rectangle.
    pub fn from_edges(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self::new(
            left,
            top,
            (right - left).max(0) as u32,
            (bottom - top).max(0) as u32,
        )
    }

    /// Get the right edge (x + width).
    pub const fn right(&self) -> i32 {
        self.x + self.width as i32
    }

    /// Get the bottom edge (y + height).
    pub const fn bottom(&self) -> i32 {
        self.y + self.height as i32
    }

    /// Dimensions of the rectangle.
    pub const fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    /// True when the rectangle covers no pixels.
    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Check if a point is contained within this rectangle.
    pub const fn contains_point(&self, px: i32, py: i32) -> bool {
        px >= self.x && px < self.right() && py >= self.y && py < self.bottom()
    }

    /// True when `other` lies entirely inside this rectangle.
    pub const fn contains_rect(&self, other: &Rect) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    /// Overlapping region of two rectangles, `None` when they do not overlap.
    pub fn intersect(&self, other: &Rect) -> Option<Rect> {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        if right > left && bottom > top {
            Some(Rect::from_edges(left, top, right, bottom))
        } else {
            None
        }
    }

    /// Check whether two rectangles overlap.
    pub fn intersects(&self, other: Rect) -> bool {
        self.intersect(&other).is_some()
    }

    /// Get the area of the rectangle.
    pub const fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Smallest power of two that is greater than or equal to `value` (1 for 0).
pub const fn next_pow2(value: u32) -> u32 {
    let mut res = 1u32;
    while res < value {
        res <<= 1;
    }
    res
}
