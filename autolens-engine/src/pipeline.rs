//! Receive pipeline
//!
//! Sits between the driver events and the engine flush tick. Frames pass a
//! gate (measuring, tx-echo policy), collect in a pending buffer and are
//! taken out in one swap per flush. While paused the buffer keeps growing
//! and nothing is taken.

use crate::types::CanFrame;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Gate and pending buffer
#[derive(Debug)]
pub struct ReceivePipeline {
    pending: Mutex<Vec<CanFrame>>,
    measuring: AtomicBool,
    paused: AtomicBool,
    drop_tx_echo: AtomicBool,
    accepted: AtomicU64,
    rejected: AtomicU64,
}

impl Default for ReceivePipeline {
    fn default() -> Self {
        Self {
            pending: Mutex::new(Vec::with_capacity(4096)),
            measuring: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            drop_tx_echo: AtomicBool::new(true),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }
}

impl ReceivePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer one frame; returns true if it was queued
    pub fn push(&self, frame: CanFrame) -> bool {
        if !self.admits(&frame) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        self.pending.lock().push(frame);
        self.accepted.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Offer a batch under one lock; returns the number queued
    pub fn push_batch(&self, frames: impl IntoIterator<Item = CanFrame>) -> usize {
        let mut queued = 0usize;
        let mut rejected = 0u64;
        {
            let mut pending = self.pending.lock();
            for frame in frames {
                if self.admits(&frame) {
                    pending.push(frame);
                    queued += 1;
                } else {
                    rejected += 1;
                }
            }
        }
        self.accepted.fetch_add(queued as u64, Ordering::Relaxed);
        self.rejected.fetch_add(rejected, Ordering::Relaxed);
        queued
    }

    fn admits(&self, frame: &CanFrame) -> bool {
        if !self.measuring.load(Ordering::Acquire) {
            return false;
        }
        !(frame.is_tx_echo && self.drop_tx_echo.load(Ordering::Relaxed))
    }

    /// Swap out everything pending
    ///
    /// Returns nothing while paused.
    pub fn take_pending(&self) -> Vec<CanFrame> {
        if self.paused.load(Ordering::Acquire) {
            return Vec::new();
        }
        self.drain()
    }

    /// Swap out everything pending regardless of pause
    pub fn drain(&self) -> Vec<CanFrame> {
        let mut pending = self.pending.lock();
        if pending.is_empty() {
            return Vec::new();
        }
        let capacity = pending.capacity();
        std::mem::replace(&mut *pending, Vec::with_capacity(capacity))
    }

    /// Drop everything pending
    pub fn clear(&self) {
        self.pending.lock().clear();
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn set_measuring(&self, measuring: bool) {
        self.measuring.store(measuring, Ordering::Release);
    }

    pub fn is_measuring(&self) -> bool {
        self.measuring.load(Ordering::Acquire)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Tx-echo policy; echoes are dropped by default
    pub fn set_drop_tx_echo(&self, drop: bool) {
        self.drop_tx_echo.store(drop, Ordering::Relaxed);
    }

    pub fn drops_tx_echo(&self) -> bool {
        self.drop_tx_echo.load(Ordering::Relaxed)
    }

    /// Frames queued since creation
    pub fn accepted_count(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Frames refused at the gate since creation
    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

/// Frames-per-second counter fed at the gate and read by the 1 s tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateCounter {
    since_tick: u64,
    rate: u64,
}

impl RateCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count frames accepted at the gate
    pub fn record(&mut self, frames: usize) {
        self.since_tick += frames as u64;
    }

    /// Close the current second and return its rate
    pub fn tick(&mut self) -> u64 {
        self.rate = self.since_tick;
        self.since_tick = 0;
        self.rate
    }

    /// Rate of the last closed second
    pub fn rate(&self) -> u64 {
        self.rate
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
