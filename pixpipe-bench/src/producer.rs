//! Synthetic surface producer.
//!
//! Writes bouncing coloured blocks into the surface the way an emulator core
//! would write sprites, reporting each block as a dirty rectangle.

use pixpipe_common::{rgb565, Rect, Size};
use pixpipe_display::{AppendOutcome, DisplayResult, Presenter};

/// Per-run counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProducerStats {
    pub ticks: u64,
    pub queued: u64,
    pub coalesced: u64,
}

struct Block {
    rect: Rect,
    dx: i32,
    dy: i32,
    colour: u16,
}

pub struct Producer {
    bounds: Size,
    blocks: Vec<Block>,
    rng: u32,
    stats: ProducerStats,
}

impl Producer {
    pub fn new(bounds: Size, count: u32) -> Self {
        let mut producer = Self {
            bounds,
            blocks: Vec::with_capacity(count as usize),
            rng: 0x9E37_79B9,
            stats: ProducerStats::default(),
        };
        for _ in 0..count {
            let block = producer.spawn_block();
            producer.blocks.push(block);
        }
        producer
    }

    fn next(&mut self) -> u32 {
        // xorshift32
        let mut x = self.rng;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.rng = x;
        x
    }

    fn spawn_block(&mut self) -> Block {
        let edge = 8 + self.next() % 56;
        let width = edge.min(self.bounds.width);
        let height = edge.min(self.bounds.height);
        let x = self.next() % (self.bounds.width - width + 1);
        let y = self.next() % (self.bounds.height - height + 1);
        let colour = self.next();
        let speed = |v: u32| (v % 7) as i32 - 3;
        Block {
            rect: Rect::new(x as i32, y as i32, width, height),
            dx: speed(self.next()),
            dy: speed(self.next()),
            colour: rgb565::pack(colour as u8, (colour >> 8) as u8, (colour >> 16) as u8),
        }
    }

    /// Move every block one step, erasing the old position and drawing the new.
    pub fn tick(&mut self, presenter: &Presenter) -> DisplayResult<ProducerStats> {
        let max_x = (self.bounds.width as i32 - 1).max(0);
        let max_y = (self.bounds.height as i32 - 1).max(0);
        let mut outcomes = Vec::with_capacity(self.blocks.len() * 2);

        presenter.with_pixels_mut(|buffer| -> DisplayResult<()> {
            for block in &mut self.blocks {
                let old = block.rect;
                buffer.fill_rect(old, 0)?;

                let mut rect = old;
                rect.x += block.dx;
                rect.y += block.dy;
                if rect.x < 0 || rect.right() - 1 > max_x {
                    block.dx = -block.dx;
                    rect.x = old.x;
                }
                if rect.y < 0 || rect.bottom() - 1 > max_y {
                    block.dy = -block.dy;
                    rect.y = old.y;
                }
                block.rect = rect;
                buffer.fill_rect(rect, block.colour)?;

                outcomes.push(old);
                outcomes.push(rect);
            }
            Ok(())
        })?;

        for rect in outcomes {
            match presenter.submit_dirty_rect(rect) {
                AppendOutcome::Queued => self.stats.queued += 1,
                AppendOutcome::Coalesced => self.stats.coalesced += 1,
                AppendOutcome::Ignored => {}
            }
        }
        self.stats.ticks += 1;
        Ok(self.stats)
    }

    pub fn stats(&self) -> ProducerStats {
        self.stats
    }
}
