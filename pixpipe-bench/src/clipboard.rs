//! Snapshot hand-off to the main thread and the system clipboard.

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender};
use pixpipe_display::{Snapshot, SnapshotSink};
use std::borrow::Cow;
use tracing::{info, warn};

/// Forwards snapshots from the render thread to whoever holds the receiver.
///
/// The clipboard handle must stay on the thread that created it, so the render
/// thread never touches it directly.
pub struct ChannelSink {
    tx: Sender<Snapshot>,
}

impl ChannelSink {
    pub fn new() -> (Self, Receiver<Snapshot>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self { tx }, rx)
    }
}

impl SnapshotSink for ChannelSink {
    fn export(&self, snapshot: Snapshot) {
        if self.tx.send(snapshot).is_err() {
            warn!("Snapshot receiver closed, dropping snapshot");
        }
    }
}

/// Place a snapshot on the clipboard as an RGBA image.
pub fn copy_to_clipboard(snapshot: &Snapshot) -> Result<()> {
    let mut clipboard = arboard::Clipboard::new().context("Failed to open clipboard")?;
    let image = arboard::ImageData {
        width: snapshot.width as usize,
        height: snapshot.height as usize,
        bytes: Cow::Owned(snapshot.to_rgba_top_down()),
    };
    clipboard
        .set_image(image)
        .context("Failed to copy snapshot to clipboard")?;
    info!("Copied {}x{} snapshot to clipboard", snapshot.width, snapshot.height);
    Ok(())
}
