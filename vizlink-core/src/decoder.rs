//! Image stream decoder.
//!
//! Each subscribed view gets a single-slot buffer holding the most recent
//! undisplayed [`Frame`]: a late frame is superseded by a newer one, never
//! queued, so latency stays bounded and a stalled consumer for one view
//! cannot delay another. Decoding into a raster happens lazily on the
//! consuming side, one frame at a time.
//!
//! Sequence numbers are monotone per view within a session; any decrease
//! is a stale or duplicate frame and is dropped without error.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::DecodeError;
use crate::wire::{Frame, FrameEncoding};

// ── Raster ───────────────────────────────────────────────────────

/// A decoded frame ready for display: tightly-packed RGBA8 rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    pub width: u32,
    pub height: u32,
    /// `width * height * 4` bytes.
    pub data: Vec<u8>,
}

/// Decompress one frame into a raster.
pub fn decode_frame(frame: &Frame) -> Result<Raster, DecodeError> {
    let data = match frame.encoding {
        FrameEncoding::Raw => frame.payload.to_vec(),
        FrameEncoding::Zstd => zstd::decode_all(frame.payload.as_ref())
            .map_err(|e| DecodeError::Malformed(format!("zstd decode failed: {e}")))?,
    };

    let expected = frame.width as usize * frame.height as usize * 4;
    if data.len() != expected {
        return Err(DecodeError::Malformed(format!(
            "raster size mismatch: {} bytes for {}x{}",
            data.len(),
            frame.width,
            frame.height
        )));
    }

    Ok(Raster {
        width: frame.width,
        height: frame.height,
        data,
    })
}

// ── DecoderStats ─────────────────────────────────────────────────

/// Frame counters for one decoder, shared with its subscriptions.
#[derive(Debug, Default)]
pub struct DecoderStats {
    accepted: AtomicU64,
    stale: AtomicU64,
    unroutable: AtomicU64,
    malformed: AtomicU64,
}

/// Point-in-time copy of [`DecoderStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStatsSnapshot {
    /// Frames that passed the sequence gate.
    pub accepted: u64,
    /// Frames dropped for a non-increasing sequence number.
    pub stale: u64,
    /// Frames offered for a view with no subscription.
    pub unroutable: u64,
    /// Frames that failed payload decoding.
    pub malformed: u64,
}

impl DecoderStats {
    pub fn snapshot(&self) -> DecoderStatsSnapshot {
        DecoderStatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            unroutable: self.unroutable.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn count_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }
}

// ── StreamDecoder ────────────────────────────────────────────────

/// Per-view slot: the sequence gate plus the latest-frame buffer.
struct ViewSlot {
    last_sequence: Option<u64>,
    latest: watch::Sender<Option<Frame>>,
}

/// Routes incoming frames to per-view single-slot buffers.
pub struct StreamDecoder {
    slots: HashMap<i64, ViewSlot>,
    stats: Arc<DecoderStats>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self {
            slots: HashMap::new(),
            stats: Arc::new(DecoderStats::default()),
        }
    }

    /// Subscribe to frames for `view_id`.
    ///
    /// Subscribing to an already-subscribed view attaches to the existing
    /// slot; its sequence gate is preserved.
    pub fn subscribe(&mut self, view_id: i64) -> ViewSubscription {
        let slot = self.slots.entry(view_id).or_insert_with(|| {
            let (latest, _) = watch::channel(None);
            ViewSlot {
                last_sequence: None,
                latest,
            }
        });
        ViewSubscription {
            view_id,
            rx: slot.latest.subscribe(),
            stats: Arc::clone(&self.stats),
        }
    }

    /// Release decoder-side resources for `view_id`. Idempotent.
    ///
    /// Any outstanding [`ViewSubscription`] for the view sees its stream
    /// end.
    pub fn unsubscribe(&mut self, view_id: i64) {
        self.slots.remove(&view_id);
    }

    /// Forget the sequence history for `view_id` (used on reconnect,
    /// when the server restarts numbering). The slot itself survives.
    pub fn reset(&mut self, view_id: i64) {
        if let Some(slot) = self.slots.get_mut(&view_id) {
            slot.last_sequence = None;
        }
    }

    /// Offer an incoming frame to its view slot.
    ///
    /// Returns `true` when the frame was accepted (it is now the latest
    /// undisplayed frame for the view). Stale, duplicate, and unroutable
    /// frames are dropped and counted, never an error.
    pub fn offer(&mut self, frame: Frame) -> bool {
        let Some(slot) = self.slots.get_mut(&frame.view_id) else {
            self.stats.unroutable.fetch_add(1, Ordering::Relaxed);
            debug!(view_id = frame.view_id, "frame for unsubscribed view dropped");
            return false;
        };

        if let Some(last) = slot.last_sequence {
            if frame.sequence <= last {
                self.stats.stale.fetch_add(1, Ordering::Relaxed);
                debug!(
                    view_id = frame.view_id,
                    sequence = frame.sequence,
                    last, "stale frame dropped"
                );
                return false;
            }
        }

        slot.last_sequence = Some(frame.sequence);
        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
        // Replaces any undisplayed predecessor: bounded latency over
        // completeness.
        let _ = slot.latest.send(Some(frame));
        true
    }

    /// Whether `view_id` currently has a slot.
    pub fn is_subscribed(&self, view_id: i64) -> bool {
        self.slots.contains_key(&view_id)
    }

    /// Shared counters.
    pub fn stats(&self) -> Arc<DecoderStats> {
        Arc::clone(&self.stats)
    }
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

// ── ViewSubscription ─────────────────────────────────────────────

/// Consumer side of one view's frame stream.
///
/// Holding this does not buffer frames: only the most recent undisplayed
/// frame is retained, and it is decoded here, on demand.
pub struct ViewSubscription {
    view_id: i64,
    rx: watch::Receiver<Option<Frame>>,
    stats: Arc<DecoderStats>,
}

impl ViewSubscription {
    /// The view this subscription is bound to.
    pub fn view_id(&self) -> i64 {
        self.view_id
    }

    /// Wait for the next frame and decode it.
    ///
    /// Malformed frames are logged, counted, and skipped — a corrupt
    /// frame never ends the stream. Returns `None` once the decoder side
    /// unsubscribed the view.
    pub async fn next_raster(&mut self) -> Option<Raster> {
        loop {
            self.rx.changed().await.ok()?;
            let frame = self.rx.borrow_and_update().clone();
            let Some(frame) = frame else { continue };
            match decode_frame(&frame) {
                Ok(raster) => return Some(raster),
                Err(e) => {
                    self.stats.count_malformed();
                    warn!(view_id = frame.view_id, sequence = frame.sequence, "{e}");
                }
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
