//! One-shot frame capture.

use std::sync::atomic::{AtomicBool, Ordering};

/// A captured frame: packed 24-bit RGB, bottom row first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl Snapshot {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            data,
        }
    }

    pub fn row_len(&self) -> usize {
        self.width as usize * 3
    }

    /// Rows top row first, as image encoders expect.
    pub fn to_top_down(&self) -> Vec<u8> {
        let row = self.row_len();
        if row == 0 {
            return Vec::new();
        }
        self.data
            .chunks_exact(row)
            .rev()
            .flatten()
            .copied()
            .collect()
    }

    /// Top-down RGBA with opaque alpha.
    pub fn to_rgba_top_down(&self) -> Vec<u8> {
        self.to_top_down()
            .chunks_exact(3)
            .flat_map(|px| [px[0], px[1], px[2], 0xFF])
            .collect()
    }

    /// RGB of the pixel at `(x, y)` with `y` counted from the top.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let row = (self.height - 1 - y) as usize;
        let at = row * self.row_len() + x as usize * 3;
        let mut px = [0; 3];
        px.copy_from_slice(self.data.get(at..at + 3)?);
        Some(px)
    }
}

/// Receives captured frames on the render thread.
pub trait SnapshotSink: Send + Sync {
    fn export(&self, snapshot: Snapshot);
}

impl<F> SnapshotSink for F
where
    F: Fn(Snapshot) + Send + Sync,
{
    fn export(&self, snapshot: Snapshot) {
        self(snapshot)
    }
}

/// Producer-set, render-thread-cleared capture request.
#[derive(Debug, Default)]
pub struct SnapshotRequest {
    pending: AtomicBool,
}

impl SnapshotRequest {
    pub fn request(&self) {
        self.pending.store(true, Ordering::Release);
    }

    /// Read and clear the request.
    pub fn take(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }
}

#[cfg(feature = "screenshots")]
pub use png::PngSnapshotSink;

#[cfg(feature = "screenshots")]
mod png {
    use super::{Snapshot, SnapshotSink};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tracing::{info, warn};

    /// Writes each snapshot to `<dir>/<prefix>-NNNN.png`.
    pub struct PngSnapshotSink {
        dir: PathBuf,
        prefix: String,
        counter: AtomicU32,
    }

    impl PngSnapshotSink {
        pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
            Self {
                dir: dir.into(),
                prefix: prefix.into(),
                counter: AtomicU32::new(0),
            }
        }

        fn save(&self, snapshot: &Snapshot) -> anyhow::Result<PathBuf> {
            let index = self.counter.fetch_add(1, Ordering::Relaxed);
            let path = self.dir.join(format!("{}-{:04}.png", self.prefix, index));
            let image = image::RgbImage::from_raw(snapshot.width, snapshot.height, snapshot.to_top_down())
                .ok_or_else(|| anyhow::anyhow!("snapshot buffer does not match {}x{}", snapshot.width, snapshot.height))?;
            image.save(&path)?;
            Ok(path)
        }
    }

    impl SnapshotSink for PngSnapshotSink {
        fn export(&self, snapshot: Snapshot) {
            match self.save(&snapshot) {
                Ok(path) => info!("Snapshot saved to {}", path.display()),
                Err(e) => warn!("Failed to save snapshot: {}", e),
            }
        }
    }
}
