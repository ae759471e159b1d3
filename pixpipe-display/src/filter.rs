//! Filter selection shared between the producer and the render thread.
//!
//! A [`Filter`] is an interpolation kind plus an optional pixel-art upscaler.
//! The producer publishes filters into a [`FilterSlot`]; the render thread
//! takes at most one change per iteration. The slot packs the whole filter
//! and a changed bit into one atomic word, so the last write always wins and
//! a reader never sees a torn filter.

use pixpipe_common::Size;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// How the final image is resampled to the viewport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interpolation {
    Nearest,
    #[default]
    Linear,
    Hermite,
    Cubic,
}

impl Interpolation {
    /// Linear and Hermite sample with bilinear filtering, the others point-sample.
    pub fn uses_linear_sampling(&self) -> bool {
        matches!(self, Self::Linear | Self::Hermite)
    }

    fn to_bits(self) -> u32 {
        match self {
            Self::Nearest => 0,
            Self::Linear => 1,
            Self::Hermite => 2,
            Self::Cubic => 3,
        }
    }

    fn from_bits(bits: u32) -> Self {
        match bits {
            0 => Self::Nearest,
            2 => Self::Hermite,
            3 => Self::Cubic,
            _ => Self::Linear,
        }
    }
}

/// Pixel-art upscaler families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpscaleKind {
    ScaleNx,
    ScaleHq,
    Xbrz,
    Xsal,
    Eagle,
}

impl UpscaleKind {
    pub const ALL: [UpscaleKind; 5] = [
        Self::ScaleNx,
        Self::ScaleHq,
        Self::Xbrz,
        Self::Xsal,
        Self::Eagle,
    ];

    /// Integer factors a shader exists for, ascending.
    pub fn supported_factors(&self) -> &'static [u32] {
        match self {
            Self::ScaleNx => &[2, 3],
            Self::ScaleHq => &[2, 4],
            Self::Xbrz => &[2, 3, 4, 5, 6],
            Self::Xsal | Self::Eagle => &[2],
        }
    }

    /// Largest supported factor not above `requested`, never below the smallest.
    pub fn normalize_factor(&self, requested: u32) -> u32 {
        let factors = self.supported_factors();
        factors
            .iter()
            .rev()
            .copied()
            .find(|f| *f <= requested)
            .unwrap_or(factors[0])
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ScaleNx => "scalenx",
            Self::ScaleHq => "scalehq",
            Self::Xbrz => "xbrz",
            Self::Xsal => "xsal",
            Self::Eagle => "eagle",
        }
    }

    fn to_bits(self) -> u32 {
        match self {
            Self::ScaleNx => 1,
            Self::ScaleHq => 2,
            Self::Xbrz => 3,
            Self::Xsal => 4,
            Self::Eagle => 5,
        }
    }

    fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            1 => Some(Self::ScaleNx),
            2 => Some(Self::ScaleHq),
            3 => Some(Self::Xbrz),
            4 => Some(Self::Xsal),
            5 => Some(Self::Eagle),
            _ => None,
        }
    }
}

/// An upscaler with a normalized factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Upscale {
    pub kind: UpscaleKind,
    pub factor: u32,
}

impl Upscale {
    /// Snap `factor` to a supported one, capped by `max_factor` when given.
    pub fn new(kind: UpscaleKind, factor: u32, max_factor: Option<u32>) -> Self {
        let capped = match max_factor {
            Some(max) => factor.min(max),
            None => factor,
        };
        Self {
            kind,
            factor: kind.normalize_factor(capped),
        }
    }
}

impl fmt::Display for Upscale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.kind.name(), self.factor)
    }
}

/// Interpolation plus optional upscaler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Filter {
    pub interpolation: Interpolation,
    pub upscale: Option<Upscale>,
}

impl Filter {
    pub fn new(interpolation: Interpolation, upscale: Option<Upscale>) -> Self {
        Self {
            interpolation,
            upscale,
        }
    }

    /// The fixed-function path has no programs: no upscaling, at most linear.
    pub fn capped_for_fixed_function(self) -> Self {
        let interpolation = match self.interpolation {
            Interpolation::Nearest => Interpolation::Nearest,
            _ => Interpolation::Linear,
        };
        Self {
            interpolation,
            upscale: None,
        }
    }

    /// Size of the upscaled image for a surface of `surface`.
    pub fn output_size(&self, surface: Size) -> Size {
        match self.upscale {
            Some(up) => surface.scaled(up.factor),
            None => surface,
        }
    }
}

const CHANGED: u32 = 1 << 31;

fn encode(filter: Filter) -> u32 {
    let (kind, factor) = match filter.upscale {
        Some(up) => (up.kind.to_bits(), up.factor.min(0xFF)),
        None => (0, 0),
    };
    filter.interpolation.to_bits() | kind << 8 | factor << 16
}

fn decode(bits: u32) -> Filter {
    let interpolation = Interpolation::from_bits(bits & 0xFF);
    let upscale = UpscaleKind::from_bits((bits >> 8) & 0xFF).map(|kind| Upscale {
        kind,
        factor: kind.normalize_factor((bits >> 16) & 0xFF),
    });
    Filter::new(interpolation, upscale)
}

/// Whether a filter change is waiting for the render thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterState {
    Idle,
    Pending,
}

/// Single-word filter mailbox.
#[derive(Debug)]
pub struct FilterSlot {
    packed: AtomicU32,
}

impl FilterSlot {
    /// A slot holding `filter`, already pending so the first frame applies it.
    pub fn new(filter: Filter) -> Self {
        Self {
            packed: AtomicU32::new(encode(filter) | CHANGED),
        }
    }

    /// Publish a filter. Overwrites any change not yet taken.
    pub fn set(&self, filter: Filter) {
        self.packed.store(encode(filter) | CHANGED, Ordering::Release);
    }

    /// Render-thread side: the filter if it changed since the last take.
    pub fn take(&self) -> Option<Filter> {
        let previous = self.packed.fetch_and(!CHANGED, Ordering::AcqRel);
        (previous & CHANGED != 0).then(|| decode(previous))
    }

    /// Mark the current filter as changed without altering it.
    pub fn mark_changed(&self) {
        self.packed.fetch_or(CHANGED, Ordering::AcqRel);
    }

    pub fn current(&self) -> Filter {
        decode(self.packed.load(Ordering::Acquire))
    }

    pub fn state(&self) -> FilterState {
        if self.packed.load(Ordering::Acquire) & CHANGED != 0 {
            FilterState::Pending
        } else {
            FilterState::Idle
        }
    }
}

impl Default for FilterSlot {
    fn default() -> Self {
        Self::new(Filter::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[test]
    fn test_factor_normalization() {
        assert_eq!(UpscaleKind::ScaleHq.normalize_factor(3), 2);
        assert_eq!(UpscaleKind::ScaleHq.normalize_factor(9), 4);
        assert_eq!(UpscaleKind::ScaleNx.normalize_factor(1), 2);
        assert_eq!(UpscaleKind::Xbrz.normalize_factor(5), 5);
        assert_eq!(UpscaleKind::Eagle.normalize_factor(4), 2);

        assert_eq!(Upscale::new(UpscaleKind::Xbrz, 6, Some(4)).factor, 4);
        assert_eq!(Upscale::new(UpscaleKind::ScaleHq, 4, Some(3)).factor, 2);
    }

    #[test]
    fn test_sampling_modes() {
        assert!(Interpolation::Linear.uses_linear_sampling());
        assert!(Interpolation::Hermite.uses_linear_sampling());
        assert!(!Interpolation::Nearest.uses_linear_sampling());
        assert!(!Interpolation::Cubic.uses_linear_sampling());
    }

    #[test]
    fn test_fixed_function_cap() {
        let filter = Filter::new(
            Interpolation::Cubic,
            Some(Upscale::new(UpscaleKind::Xbrz, 3, None)),
        );
        assert_eq!(
            filter.capped_for_fixed_function(),
            Filter::new(Interpolation::Linear, None)
        );
    }

    #[test]
    fn test_output_size() {
        let filter = Filter::new(
            Interpolation::Linear,
            Some(Upscale::new(UpscaleKind::ScaleNx, 3, None)),
        );
        assert_eq!(filter.output_size(Size::new(640, 480)), Size::new(1920, 1440));
    }

    #[test]
    fn test_slot_take_clears_pending() {
        let slot = FilterSlot::new(Filter::default());
        assert_eq!(slot.state(), FilterState::Pending);
        assert_eq!(slot.take(), Some(Filter::default()));
        assert_eq!(slot.state(), FilterState::Idle);
        assert_eq!(slot.take(), None);

        slot.mark_changed();
        assert_eq!(slot.take(), Some(Filter::default()));
    }

    #[test]
    fn test_last_writer_wins() {
        let slot = FilterSlot::new(Filter::default());
        slot.take();

        let a = Filter::new(Interpolation::Hermite, None);
        let b = Filter::new(
            Interpolation::Cubic,
            Some(Upscale::new(UpscaleKind::Xbrz, 4, None)),
        );
        slot.set(a);
        slot.set(b);
        assert_eq!(slot.take(), Some(b));
        assert_eq!(slot.take(), None);
        assert_eq!(slot.current(), b);
    }

    #[test]
    fn test_concurrent_writes_observe_final_value() {
        let slot = Arc::new(FilterSlot::default());
        let last = Filter::new(
            Interpolation::Nearest,
            Some(Upscale::new(UpscaleKind::Eagle, 2, None)),
        );
        let writer = {
            let slot = slot.clone();
            std::thread::spawn(move || {
                for i in 0..1000u32 {
                    let interpolation = if i % 2 == 0 {
                        Interpolation::Cubic
                    } else {
                        Interpolation::Hermite
                    };
                    slot.set(Filter::new(interpolation, None));
                }
                slot.set(last);
            })
        };
        while !writer.is_finished() {
            slot.take();
        }
        writer.join().unwrap();

        let mut seen = None;
        while let Some(filter) = slot.take() {
            seen = Some(filter);
        }
        assert_eq!(seen.unwrap_or_else(|| slot.current()), last);
    }
}
