//! # Turn Buffer
//!
//! Holds the caller's audio frames for the turn currently being listened to.
//!
//! ## Key Features:
//! - **Arrival order**: Frames come out exactly in the order they went in
//! - **Snapshot-and-clear**: [`TurnBuffer::drain_all`] hands the whole turn over and
//!   leaves the buffer empty, so a frame can never be played twice
//! - **Single owner**: The buffer lives inside one session task, so it needs no lock
//!
//! Whether a frame is *allowed* in (Listening only) is decided by the
//! session state machine before calling [`TurnBuffer::append`].

use crate::protocol::AudioFrame;

#[derive(Debug, Default)]
pub struct TurnBuffer {
    frames: Vec<AudioFrame>,
    payload_bytes: usize,
}

impl TurnBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, frame: AudioFrame) {
        self.payload_bytes += frame.payload_len();
        self.frames.push(frame);
    }

    /// Take every buffered frame in arrival order and leave the buffer empty.
    ///
    /// ## Rust Concepts:
    /// - **std::mem::take**: Swaps in an empty `Vec` and returns the old one without
    ///   cloning any frame
    pub fn drain_all(&mut self) -> Vec<AudioFrame> {
        self.payload_bytes = 0;
        std::mem::take(&mut self.frames)
    }

    /// Drop everything buffered, returning how many frames were discarded.
    pub fn clear(&mut self) -> usize {
        let discarded = self.frames.len();
        self.frames.clear();
        self.payload_bytes = 0;
        discarded
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Total encoded payload bytes currently buffered.
    pub fn payload_bytes(&self) -> usize {
        self.payload_bytes
    }
}
