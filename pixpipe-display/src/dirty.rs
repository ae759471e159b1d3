//! Dirty-region ring shared between the producer and the render thread.
//!
//! The producer appends modified rectangles and the render thread drains
//! everything appended since its previous drain. The ring is single-producer,
//! single-consumer and lock-free: each slot packs one rectangle into an
//! `AtomicU64`, and publication happens by advancing the write cursor with
//! release ordering.
//!
//! When the ring is full the producer raises an overflow flag instead of
//! dropping the rectangle. The next drain then ends with one synthetic
//! full-surface rectangle, so no modification is ever lost.

use pixpipe_common::{Rect, Size};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tracing::trace;

/// Smallest ring that can hold a rectangle.
pub const MIN_DIRTY_CAPACITY: usize = 2;

/// One modified region of the surface in edge form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpdateRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    pub active: bool,
}

impl UpdateRect {
    /// Active when the edges enclose at least one pixel.
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
            active: left < right && top < bottom,
        }
    }

    pub fn from_rect(rect: Rect) -> Self {
        Self::new(rect.x, rect.y, rect.right(), rect.bottom())
    }

    /// The whole surface.
    pub fn full(size: Size) -> Self {
        Self::new(0, 0, size.width as i32, size.height as i32)
    }

    pub fn width(&self) -> u32 {
        (self.right - self.left).max(0) as u32
    }

    pub fn height(&self) -> u32 {
        (self.bottom - self.top).max(0) as u32
    }

    pub fn to_rect(&self) -> Rect {
        Rect::from_edges(self.left, self.top, self.right, self.bottom)
    }

    /// Clamp to `[0, size)`. Rectangles left with no area become inactive.
    pub fn clipped(&self, size: Size) -> Self {
        if !self.active {
            return *self;
        }
        Self::new(
            self.left.clamp(0, size.width as i32),
            self.top.clamp(0, size.height as i32),
            self.right.clamp(0, size.width as i32),
            self.bottom.clamp(0, size.height as i32),
        )
    }

    /// True if this rectangle covers the whole of `size`.
    pub fn covers(&self, size: Size) -> bool {
        self.active
            && self.left <= 0
            && self.top <= 0
            && self.right >= size.width as i32
            && self.bottom >= size.height as i32
    }

    // Slot encoding: four 16-bit edges, zero means an inactive slot.
    fn pack(&self) -> u64 {
        if !self.active {
            return 0;
        }
        u64::from(self.left as u16)
            | u64::from(self.top as u16) << 16
            | u64::from(self.right as u16) << 32
            | u64::from(self.bottom as u16) << 48
    }

    fn unpack(bits: u64) -> Self {
        Self::new(
            i32::from(bits as u16),
            i32::from((bits >> 16) as u16),
            i32::from((bits >> 32) as u16),
            i32::from((bits >> 48) as u16),
        )
    }
}

impl From<Rect> for UpdateRect {
    fn from(rect: Rect) -> Self {
        Self::from_rect(rect)
    }
}

/// What happened to an appended rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Stored in its own slot.
    Queued,
    /// The ring was full; the next drain redraws the whole surface.
    Coalesced,
    /// Nothing of the rectangle lies on the surface.
    Ignored,
}

/// Fixed-capacity SPSC ring of dirty rectangles.
#[derive(Debug)]
pub struct DirtyRegionQueue {
    slots: Box<[AtomicU64]>,
    write: AtomicUsize,
    read: AtomicUsize,
    overflow: AtomicBool,
    primed: AtomicBool,
    bounds: Size,
}

impl DirtyRegionQueue {
    /// Create a ring for a surface of `bounds`. `capacity` is raised to the minimum.
    ///
    /// One slot always stays free to tell a full ring from an empty one, so at
    /// most `capacity - 1` rectangles are pending at once.
    pub fn new(bounds: Size, capacity: usize) -> Self {
        let capacity = capacity.max(MIN_DIRTY_CAPACITY);
        let slots = (0..capacity).map(|_| AtomicU64::new(0)).collect();
        Self {
            slots,
            write: AtomicUsize::new(0),
            read: AtomicUsize::new(0),
            overflow: AtomicBool::new(false),
            primed: AtomicBool::new(false),
            bounds,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn bounds(&self) -> Size {
        self.bounds
    }

    /// Producer side: record a modified region.
    pub fn append(&self, rect: UpdateRect) -> AppendOutcome {
        let rect = rect.clipped(self.bounds);
        if !rect.active {
            return AppendOutcome::Ignored;
        }

        let write = self.write.load(Ordering::Relaxed);
        let next = (write + 1) % self.slots.len();
        if next == self.read.load(Ordering::Acquire) {
            self.overflow.store(true, Ordering::Release);
            trace!("Dirty ring full, coalescing into full-surface redraw");
            return AppendOutcome::Coalesced;
        }

        self.slots[write].store(rect.pack(), Ordering::Relaxed);
        self.write.store(next, Ordering::Release);
        AppendOutcome::Queued
    }

    /// Producer side: force the next drain to cover the whole surface.
    pub fn invalidate(&self) {
        self.overflow.store(true, Ordering::Release);
    }

    /// Number of rectangles appended but not yet drained.
    pub fn pending(&self) -> usize {
        let write = self.write.load(Ordering::Acquire);
        let read = self.read.load(Ordering::Acquire);
        (write + self.slots.len() - read) % self.slots.len()
    }

    /// Consumer side: take everything appended since the previous drain.
    ///
    /// Must only be called from one thread.
    pub fn drain(&self) -> DirtyRegions {
        let end = self.write.load(Ordering::Acquire);
        let overflowed = self.overflow.swap(false, Ordering::AcqRel);
        let mut index = self.read.load(Ordering::Relaxed);

        let mut rects = Vec::with_capacity(self.pending());
        while index != end {
            let rect = UpdateRect::unpack(self.slots[index].load(Ordering::Relaxed));
            if rect.active {
                rects.push(rect);
            }
            index = (index + 1) % self.slots.len();
        }
        self.read.store(end, Ordering::Release);

        if !self.primed.swap(true, Ordering::AcqRel) {
            return DirtyRegions::full(self.bounds);
        }

        let mut regions = DirtyRegions {
            rects,
            bounds: self.bounds,
            full: false,
        };
        if overflowed {
            regions.push_full();
        }
        regions
    }
}

/// Rectangles taken from the ring in one drain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirtyRegions {
    rects: Vec<UpdateRect>,
    bounds: Size,
    full: bool,
}

impl DirtyRegions {
    /// Exactly one rectangle covering the surface.
    pub fn full(bounds: Size) -> Self {
        Self {
            rects: vec![UpdateRect::full(bounds)],
            bounds,
            full: true,
        }
    }

    pub fn empty(bounds: Size) -> Self {
        Self {
            rects: Vec::new(),
            bounds,
            full: false,
        }
    }

    pub fn rects(&self) -> &[UpdateRect] {
        &self.rects
    }

    pub fn iter(&self) -> impl Iterator<Item = &UpdateRect> {
        self.rects.iter().filter(|r| r.active)
    }

    pub fn len(&self) -> usize {
        self.rects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    pub fn bounds(&self) -> Size {
        self.bounds
    }

    /// True when some rectangle covers the whole surface.
    pub fn is_full(&self) -> bool {
        self.full
    }

    /// Replace the contents with a single full-surface rectangle.
    pub fn force_full(&mut self) {
        *self = Self::full(self.bounds);
    }

    fn push_full(&mut self) {
        self.rects.push(UpdateRect::full(self.bounds));
        self.full = true;
    }

    /// Bounding box of every active rectangle.
    pub fn union_bounds(&self) -> Option<Rect> {
        self.iter()
            .map(UpdateRect::to_rect)
            .reduce(|a, b| {
                Rect::from_edges(
                    a.x.min(b.x),
                    a.y.min(b.y),
                    a.right().max(b.right()),
                    a.bottom().max(b.bottom()),
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    const BOUNDS: Size = Size::new(640, 480);

    fn primed(capacity: usize) -> DirtyRegionQueue {
        let queue = DirtyRegionQueue::new(BOUNDS, capacity);
        queue.drain();
        queue
    }

    #[test]
    fn test_first_drain_is_one_full_rect() {
        let queue = DirtyRegionQueue::new(BOUNDS, 16);
        queue.append(UpdateRect::new(10, 10, 20, 20));

        let regions = queue.drain();
        assert_eq!(regions.rects(), &[UpdateRect::full(BOUNDS)]);
        assert!(regions.is_full());

        assert!(queue.drain().is_empty());
    }

    #[test]
    fn test_drain_returns_appended_in_order() {
        let queue = primed(16);
        queue.append(UpdateRect::new(0, 0, 10, 10));
        queue.append(UpdateRect::new(5, 5, 15, 25));

        let regions = queue.drain();
        assert_eq!(
            regions.rects(),
            &[UpdateRect::new(0, 0, 10, 10), UpdateRect::new(5, 5, 15, 25)]
        );
        assert!(!regions.is_full());
        assert_eq!(regions.union_bounds(), Some(Rect::new(0, 0, 15, 25)));
    }

    #[test]
    fn test_append_clamps_and_ignores_offscreen() {
        let queue = primed(16);
        assert_eq!(queue.append(UpdateRect::new(-5, -5, 10, 10)), AppendOutcome::Queued);
        assert_eq!(queue.append(UpdateRect::new(700, 0, 800, 10)), AppendOutcome::Ignored);
        assert_eq!(queue.append(UpdateRect::new(10, 10, 10, 20)), AppendOutcome::Ignored);

        assert_eq!(queue.drain().rects(), &[UpdateRect::new(0, 0, 10, 10)]);
    }

    #[test]
    fn test_overflow_coalesces_to_full_surface() {
        let queue = primed(4);
        for i in 0..3 {
            assert_eq!(queue.append(UpdateRect::new(i, 0, i + 1, 1)), AppendOutcome::Queued);
        }
        assert_eq!(queue.append(UpdateRect::new(50, 50, 60, 60)), AppendOutcome::Coalesced);

        let regions = queue.drain();
        assert_eq!(regions.len(), 4);
        assert_eq!(regions.rects()[3], UpdateRect::full(BOUNDS));
        assert!(regions.is_full());

        // Slots are free again after the drain.
        assert_eq!(queue.append(UpdateRect::new(1, 1, 2, 2)), AppendOutcome::Queued);
        assert!(!queue.drain().is_full());
    }

    #[test]
    fn test_force_full_replaces_contents() {
        let queue = primed(8);
        queue.append(UpdateRect::new(1, 1, 3, 3));
        let mut regions = queue.drain();
        regions.force_full();
        assert_eq!(regions.rects(), &[UpdateRect::full(BOUNDS)]);
    }

    #[test]
    fn test_invalidate() {
        let queue = primed(8);
        queue.invalidate();
        assert!(queue.drain().is_full());
    }

    #[test]
    fn test_pack_roundtrip_at_limits() {
        let rect = UpdateRect::new(0, 1, 1920, 1200);
        assert_eq!(UpdateRect::unpack(rect.pack()), rect);
        assert!(!UpdateRect::unpack(0).active);
    }

    #[test]
    fn test_concurrent_producer_is_covered() {
        let queue = std::sync::Arc::new(primed(8));
        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                for y in 0..200 {
                    queue.append(UpdateRect::new(0, y, 4, y + 1));
                }
            })
        };

        let mut covered = vec![false; 200];
        let mut done = false;
        while !done {
            done = producer.is_finished();
            let regions = queue.drain();
            for r in regions.iter() {
                for y in r.top.max(0)..r.bottom.min(200) {
                    covered[y as usize] = true;
                }
            }
        }
        producer.join().unwrap();
        let regions = queue.drain();
        for r in regions.iter() {
            for y in r.top.max(0)..r.bottom.min(200) {
                covered[y as usize] = true;
            }
        }
        assert!(covered.iter().all(|c| *c));
    }

    proptest! {
        #[test]
        fn prop_drained_union_covers_appended(
            rects in proptest::collection::vec((0i32..640, 0i32..480, 1i32..64, 1i32..64), 0..40),
            capacity in 2usize..16,
        ) {
            let queue = primed(capacity);
            let mut drained = Vec::new();
            for (i, (x, y, w, h)) in rects.iter().enumerate() {
                queue.append(UpdateRect::new(*x, *y, x + w, y + h));
                if i % 7 == 6 {
                    drained.extend(queue.drain().iter().copied());
                }
            }
            drained.extend(queue.drain().iter().copied());

            for (x, y, w, h) in rects {
                let want = UpdateRect::new(x, y, x + w, y + h).clipped(BOUNDS).to_rect();
                let covered = drained
                    .iter()
                    .any(|d| d.covers(BOUNDS) || d.to_rect().contains_rect(&want));
                prop_assert!(covered, "{:?} not covered", want);
            }
        }
    }
}
