//! Viewport management: fitting the logical surface into the window.
//!
//! The viewport maps between the surface coordinate space and the window
//! coordinate space. With aspect lock off the surface is stretched to fill the
//! window. With aspect lock on the smaller of the two scale factors is used on
//! both axes and the image is centered along the other axis.
//!
//! Geometry is recomputed lazily: setters only raise a `refresh` flag and the
//! render thread calls [`Viewport::check_view`] once per frame.

use parking_lot::Mutex;
use pixpipe_common::{Point, Rect, Size};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, trace};

/// Computed placement of the surface inside the window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportGeometry {
    /// On-screen rectangle in window pixels.
    pub rect: Rect,
    /// Raw per-axis factor `window / mode`.
    pub view_factor: (f64, f64),
    /// Factors applied to display and cursor mapping.
    pub scale_x: f64,
    pub scale_y: f64,
}

impl Default for ViewportGeometry {
    fn default() -> Self {
        Self {
            rect: Rect::default(),
            view_factor: (1.0, 1.0),
            scale_x: 1.0,
            scale_y: 1.0,
        }
    }
}

impl fmt::Display for ViewportGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Viewport(rect={}x{}+{}+{}, scale={:.3}x{:.3})",
            self.rect.width, self.rect.height, self.rect.x, self.rect.y, self.scale_x, self.scale_y
        )
    }
}

/// Pure viewport math.
pub struct ViewportCalculator;

impl ViewportCalculator {
    /// Place a `mode`-sized image inside `window`.
    pub fn compute(window: Size, mode: Size, aspect_locked: bool) -> ViewportGeometry {
        let mut geometry = ViewportGeometry {
            rect: Rect::from_size(window),
            ..Default::default()
        };
        if mode.is_empty() {
            return geometry;
        }

        let fx = f64::from(window.width) / f64::from(mode.width);
        let fy = f64::from(window.height) / f64::from(mode.height);
        geometry.view_factor = (fx, fy);
        geometry.scale_x = fx;
        geometry.scale_y = fy;

        if aspect_locked && fx != fy {
            if fx > fy {
                let fw = fy * f64::from(mode.width);
                geometry.rect.width = fw.round() as u32;
                geometry.rect.x = ((f64::from(window.width) - fw) / 2.0).round() as i32;
                geometry.scale_x = fy;
            } else {
                let fh = fx * f64::from(mode.height);
                geometry.rect.height = fh.round() as u32;
                geometry.rect.y = ((f64::from(window.height) - fh) / 2.0).round() as i32;
                geometry.scale_y = fx;
            }
        }
        geometry
    }
}

/// Inputs that determine the geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewportInputs {
    pub window: Size,
    pub mode: Size,
    pub aspect_locked: bool,
    pub fullscreen: bool,
}

/// Viewport state with lazy recomputation.
#[derive(Debug, Clone)]
pub struct Viewport {
    inputs: ViewportInputs,
    geometry: ViewportGeometry,
    refresh: bool,
}

impl Viewport {
    /// Create a viewport; the first [`check_view`](Self::check_view) computes geometry.
    pub fn new(mode: Size, window: Size, aspect_locked: bool) -> Self {
        debug!("Creating viewport: mode {:?}, window {:?}, aspect {}", mode, window, aspect_locked);
        Self {
            inputs: ViewportInputs {
                window,
                mode,
                aspect_locked,
                fullscreen: false,
            },
            geometry: ViewportGeometry::default(),
            refresh: true,
        }
    }

    pub fn inputs(&self) -> &ViewportInputs {
        &self.inputs
    }

    /// Last computed geometry.
    pub fn geometry(&self) -> &ViewportGeometry {
        &self.geometry
    }

    pub fn needs_refresh(&self) -> bool {
        self.refresh
    }

    /// Set the window client size (called on window resize).
    pub fn set_window_size(&mut self, width: u32, height: u32) {
        let size = Size::new(width, height);
        if self.inputs.window != size {
            debug!("Viewport window size changed to {}x{}", width, height);
            self.inputs.window = size;
            self.refresh = true;
        }
    }

    /// Set the surface size (called on mode change).
    pub fn set_mode_size(&mut self, width: u32, height: u32) {
        let size = Size::new(width, height);
        if self.inputs.mode != size {
            debug!("Viewport mode size changed to {}x{}", width, height);
            self.inputs.mode = size;
            self.refresh = true;
        }
    }

    pub fn set_aspect_lock(&mut self, locked: bool) {
        if self.inputs.aspect_locked != locked {
            self.inputs.aspect_locked = locked;
            self.refresh = true;
        }
    }

    pub fn set_fullscreen(&mut self, fullscreen: bool) {
        if self.inputs.fullscreen != fullscreen {
            self.inputs.fullscreen = fullscreen;
            self.refresh = true;
        }
    }

    pub fn request_refresh(&mut self) {
        self.refresh = true;
    }

    /// Recompute geometry if an input changed. Returns true if it did.
    pub fn check_view(&mut self) -> bool {
        if !self.refresh {
            return false;
        }
        self.refresh = false;
        self.geometry =
            ViewportCalculator::compute(self.inputs.window, self.inputs.mode, self.inputs.aspect_locked);
        trace!("Recomputed {}", self.geometry);
        true
    }

    /// Map a window point to surface coordinates.
    ///
    /// Points left of or above the image map to 0; points right of or below it
    /// map to the last row or column. Before the first geometry is computed
    /// the mapping is the identity, clamped to the surface.
    pub fn map_cursor(&self, point: Point) -> Point {
        let rect = self.geometry.rect;
        let mode = self.inputs.mode;
        if rect.is_empty() {
            let last_x = (mode.width as i32 - 1).max(0);
            let last_y = (mode.height as i32 - 1).max(0);
            return Point::new(point.x.clamp(0, last_x), point.y.clamp(0, last_y));
        }

        let x = if point.x < rect.x {
            0
        } else if point.x >= rect.right() {
            mode.width as i32 - 1
        } else {
            (f64::from(point.x - rect.x) / self.geometry.scale_x) as i32
        };
        let y = if point.y < rect.y {
            0
        } else if point.y >= rect.bottom() {
            mode.height as i32 - 1
        } else {
            (f64::from(point.y - rect.y) / self.geometry.scale_y) as i32
        };
        Point::new(x, y)
    }

    /// Map a surface point to the window pixel at its top-left corner.
    pub fn map_to_window(&self, point: Point) -> Point {
        let rect = self.geometry.rect;
        Point::new(
            rect.x + (f64::from(point.x) * self.geometry.scale_x).round() as i32,
            rect.y + (f64::from(point.y) * self.geometry.scale_y).round() as i32,
        )
    }

    /// Rectangle to confine the OS cursor to, in window coordinates.
    pub fn cursor_clip(&self) -> Option<Rect> {
        if self.inputs.aspect_locked && self.inputs.fullscreen && !self.geometry.rect.is_empty() {
            Some(self.geometry.rect)
        } else {
            None
        }
    }
}

/// A [`Viewport`] shared between the producer and the render thread.
///
/// The render thread checks an atomic flag each frame and only takes the lock
/// when something changed.
#[derive(Debug)]
pub struct SharedViewport {
    inner: Mutex<Viewport>,
    refresh: AtomicBool,
}

impl SharedViewport {
    pub fn new(viewport: Viewport) -> Self {
        let refresh = viewport.needs_refresh();
        Self {
            inner: Mutex::new(viewport),
            refresh: AtomicBool::new(refresh),
        }
    }

    /// Mutate the inputs; raises the shared flag if the geometry went stale.
    pub fn update<R>(&self, f: impl FnOnce(&mut Viewport) -> R) -> R {
        let mut viewport = self.inner.lock();
        let result = f(&mut viewport);
        if viewport.needs_refresh() {
            self.refresh.store(true, Ordering::Release);
        }
        result
    }

    pub fn request_refresh(&self) {
        self.update(Viewport::request_refresh);
    }

    /// Render-thread side: new geometry if a refresh was pending.
    pub fn check_view(&self) -> Option<ViewportGeometry> {
        if !self.refresh.swap(false, Ordering::AcqRel) {
            return None;
        }
        let mut viewport = self.inner.lock();
        viewport.check_view();
        Some(*viewport.geometry())
    }

    pub fn snapshot(&self) -> Viewport {
        self.inner.lock().clone()
    }

    pub fn map_cursor(&self, point: Point) -> Point {
        self.inner.lock().map_cursor(point)
    }

    pub fn cursor_clip(&self) -> Option<Rect> {
        self.inner.lock().cursor_clip()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn computed(mode: Size, window: Size, aspect: bool) -> Viewport {
        let mut viewport = Viewport::new(mode, window, aspect);
        viewport.check_view();
        viewport
    }

    #[test]
    fn test_map_cursor_clamps_before_check_view() {
        let viewport = Viewport::new(Size::new(320, 200), Size::new(640, 400), true);
        assert_eq!(viewport.map_cursor(Point::new(500, 10)), Point::new(319, 10));
        assert_eq!(viewport.map_cursor(Point::new(-20, 250)), Point::new(0, 199));
    }

    #[test]
    fn test_uniform_scale() {
        let g = ViewportCalculator::compute(Size::new(800, 600), Size::new(640, 480), true);
        assert_eq!(g.rect, Rect::new(0, 0, 800, 600));
        assert_eq!(g.scale_x, 1.25);
        assert_eq!(g.scale_y, 1.25);
    }

    #[test]
    fn test_pillarbox() {
        let g = ViewportCalculator::compute(Size::new(900, 600), Size::new(640, 480), true);
        assert_eq!(g.scale_x, 1.25);
        assert_eq!(g.scale_y, 1.25);
        assert_eq!(g.rect, Rect::new(50, 0, 800, 600));
        assert_eq!(g.view_factor.0, 900.0 / 640.0);
    }

    #[test]
    fn test_letterbox() {
        let g = ViewportCalculator::compute(Size::new(640, 600), Size::new(640, 480), true);
        assert_eq!(g.rect, Rect::new(0, 60, 640, 480));
        assert_eq!(g.scale_y, 1.0);
    }

    #[test]
    fn test_stretch_without_aspect() {
        let g = ViewportCalculator::compute(Size::new(900, 600), Size::new(640, 480), false);
        assert_eq!(g.rect, Rect::new(0, 0, 900, 600));
        assert_eq!(g.scale_x, 900.0 / 640.0);
        assert_eq!(g.scale_y, 1.25);
    }

    #[test]
    fn test_check_view_is_lazy() {
        let mut viewport = Viewport::new(Size::new(640, 480), Size::new(640, 480), true);
        assert!(viewport.check_view());
        assert!(!viewport.check_view());

        viewport.set_window_size(640, 480);
        assert!(!viewport.check_view());

        viewport.set_window_size(1280, 960);
        assert!(viewport.check_view());
        assert_eq!(viewport.geometry().scale_x, 2.0);
    }

    #[test]
    fn test_map_cursor_clamps_outside() {
        let viewport = computed(Size::new(640, 480), Size::new(900, 600), true);
        assert_eq!(viewport.map_cursor(Point::new(10, 10)), Point::new(0, 8));
        assert_eq!(viewport.map_cursor(Point::new(860, 10)), Point::new(639, 8));
        assert_eq!(viewport.map_cursor(Point::new(50, 0)), Point::new(0, 0));
        assert_eq!(viewport.map_cursor(Point::new(849, 599)), Point::new(639, 479));
    }

    #[test]
    fn test_cursor_clip_only_fullscreen_with_aspect() {
        let mut viewport = computed(Size::new(640, 480), Size::new(900, 600), true);
        assert_eq!(viewport.cursor_clip(), None);

        viewport.set_fullscreen(true);
        viewport.check_view();
        assert_eq!(viewport.cursor_clip(), Some(Rect::new(50, 0, 800, 600)));

        viewport.set_aspect_lock(false);
        viewport.check_view();
        assert_eq!(viewport.cursor_clip(), None);
    }

    #[test]
    fn test_shared_viewport_refresh_flag() {
        let shared = SharedViewport::new(Viewport::new(Size::new(640, 480), Size::new(640, 480), true));
        assert!(shared.check_view().is_some());
        assert!(shared.check_view().is_none());

        shared.update(|v| v.set_window_size(800, 600));
        let geometry = shared.check_view().unwrap();
        assert_eq!(geometry.rect, Rect::new(0, 0, 800, 600));

        shared.request_refresh();
        assert!(shared.check_view().is_some());
    }

    proptest! {
        #[test]
        fn prop_compute_is_idempotent_and_uniform_under_aspect(
            ww in 1u32..4000, wh in 1u32..4000, mw in 1u32..2000, mh in 1u32..2000,
        ) {
            let window = Size::new(ww, wh);
            let mode = Size::new(mw, mh);
            let a = ViewportCalculator::compute(window, mode, true);
            let b = ViewportCalculator::compute(window, mode, true);
            prop_assert_eq!(a, b);
            prop_assert_eq!(a.scale_x, a.scale_y);
            prop_assert!(a.rect.right() <= ww as i32 + 1);
            prop_assert!(a.rect.bottom() <= wh as i32 + 1);
        }

        #[test]
        fn prop_cursor_round_trip_within_one_pixel(
            ww in 640u32..3000, wh in 480u32..3000, px in 0i32..640, py in 0i32..480,
        ) {
            let viewport = computed(Size::new(640, 480), Size::new(ww, wh), true);
            let window_point = viewport.map_to_window(Point::new(px, py));
            let back = viewport.map_cursor(window_point);
            prop_assert!((back.x - px).abs() <= 1, "x {} -> {}", px, back.x);
            prop_assert!((back.y - py).abs() <= 1, "y {} -> {}", py, back.y);
        }
    }
}
