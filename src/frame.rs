//! Decoded frame containers and the per-face latest-frame slot.
//!
//! - `PlaneLayout`: the three-plane 4:2:0 layout negotiated with a decoder.
//! - `Frame`: owned plane bytes for one decoded picture.
//! - `FrameBuffer`: single-consumer, last-write-wins slot shared between a decoder
//!   callback thread and the render consumer loop.
//! - `FrameSignal`: wakes the consumer loop when any slot receives a frame.
//!
//! The slot lock is held only across the swap of the pending frame, never across an
//! allocation, a copy or a render call.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// Number of planes every frame carries (Y/U/V, or BGRA plus two empty planes).
pub const PLANE_COUNT: usize = 3;

// ----------------------------------------------------------------------------
// PlaneLayout: negotiated plane geometry
// ----------------------------------------------------------------------------

/// Plane strides and line counts declared to the decoder during format negotiation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlaneLayout {
    pub width: u32,
    pub height: u32,
    pub pitches: [u32; PLANE_COUNT],
    pub lines: [u32; PLANE_COUNT],
}

impl PlaneLayout {
    /// Fixed 4:2:0 planar layout. Odd dimensions are out of contract.
    pub fn i420(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pitches: [width, width / 2, width / 2],
            lines: [height, height / 2, height / 2],
        }
    }

    /// Byte size of each plane: `w*h`, `w*h/4`, `w*h/4`.
    pub fn plane_sizes(&self) -> [usize; PLANE_COUNT] {
        let luma = self.width as usize * self.height as usize;
        [luma, luma / 4, luma / 4]
    }

    /// Allocate a zeroed frame with this layout.
    pub fn allocate(&self) -> Frame {
        let [y, u, v] = self.plane_sizes();
        Frame::from_planes([vec![0u8; y], vec![0u8; u], vec![0u8; v]])
    }
}

// ----------------------------------------------------------------------------
// Frame: owned plane data
// ----------------------------------------------------------------------------

/// One decoded picture. Each plane owns its bytes; the plane size is the length of
/// its buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    planes: [Vec<u8>; PLANE_COUNT],
}

impl Frame {
    pub fn from_planes(planes: [Vec<u8>; PLANE_COUNT]) -> Self {
        Self { planes }
    }

    /// Packed BGRA still image: the pixels go in plane 0, planes 1 and 2 are empty.
    pub fn packed_bgra(pixels: Vec<u8>) -> Self {
        Self {
            planes: [pixels, Vec::new(), Vec::new()],
        }
    }

    pub fn plane(&self, index: usize) -> &[u8] {
        &self.planes[index]
    }

    pub fn planes(&self) -> &[Vec<u8>; PLANE_COUNT] {
        &self.planes
    }

    /// Writable planes for a decoder to fill in place.
    pub fn planes_mut(&mut self) -> &mut [Vec<u8>; PLANE_COUNT] {
        &mut self.planes
    }

    pub fn sizes(&self) -> [usize; PLANE_COUNT] {
        [
            self.planes[0].len(),
            self.planes[1].len(),
            self.planes[2].len(),
        ]
    }

    pub fn byte_len(&self) -> usize {
        self.sizes().iter().sum()
    }

    /// True when the frame still matches the given layout (used to recycle buffers).
    pub fn matches(&self, layout: &PlaneLayout) -> bool {
        self.sizes() == layout.plane_sizes()
    }
}

// ----------------------------------------------------------------------------
// FrameSignal: consumer wake-up
// ----------------------------------------------------------------------------

/// Generation counter bumped every time any session publishes a frame.
///
/// The consumer loop remembers the last generation it saw and waits (bounded) for it
/// to move when a whole round-robin cycle came up empty.
#[derive(Debug, Default)]
pub struct FrameSignal {
    generation: Mutex<u64>,
    ready: Condvar,
}

impl FrameSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        let mut generation = lock_recover(&self.generation);
        *generation = generation.wrapping_add(1);
        self.ready.notify_all();
    }

    pub fn generation(&self) -> u64 {
        *lock_recover(&self.generation)
    }

    /// Wait until the generation differs from `seen` or `timeout` elapses.
    /// Returns the generation observed on wake-up.
    pub fn wait_for_change(&self, seen: u64, timeout: Duration) -> u64 {
        let guard = lock_recover(&self.generation);
        let (guard, _) = self
            .ready
            .wait_timeout_while(guard, timeout, |generation| *generation == seen)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard
    }
}

// ----------------------------------------------------------------------------
// FrameBuffer: latest-frame slot
// ----------------------------------------------------------------------------

/// Holds at most one pending frame for a face.
///
/// `enqueue` replaces whatever is pending and hands the replaced frame back to the
/// producer; the consumer never sees it. `dequeue` takes and clears. A given enqueued
/// frame is therefore returned by `dequeue` at most once, and never after a newer one
/// has been enqueued.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    pending: Mutex<Option<Frame>>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swap in a new frame, returning the un-consumed one it displaced.
    pub fn enqueue(&self, frame: Frame) -> Option<Frame> {
        lock_recover(&self.pending).replace(frame)
    }

    /// Take the pending frame, if any.
    pub fn dequeue(&self) -> Option<Frame> {
        lock_recover(&self.pending).take()
    }

    pub fn has_pending(&self) -> bool {
        lock_recover(&self.pending).is_some()
    }

    /// Drop any pending frame.
    pub fn clear(&self) {
        lock_recover(&self.pending).take();
    }
}

/// The frame path guards plain data with no cross-field invariants, so a poisoned
/// lock is still usable.
pub(crate) fn lock_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
