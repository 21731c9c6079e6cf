//! Single-producer/single-consumer byte FIFO with a contiguous-span
//! reserve/commit API, used for TX staging (SDIO DMA submission) and RX
//! buffering (mux channel 1, UART/SDIO input staging).

use crate::error::{NcpError, Result};

/// A fixed-capacity ring buffer of bytes.
///
/// `put`/`get` move whole byte ranges in and out. `consume`/`consume_commit`
/// additionally expose a contiguous span of currently-buffered bytes so a
/// caller that must hand a contiguous slice to hardware (SDIO `send_queue`)
/// can reserve it, attempt the hardware operation, and roll back on failure
/// without losing the data.
pub struct RingBuffer {
    storage: Vec<u8>,
    capacity: usize,
    head: usize,
    tail: usize,
    reserved: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            storage: vec![0u8; capacity],
            capacity,
            head: 0,
            tail: 0,
            reserved: 0,
        }
    }

    /// Bytes currently buffered and not already reserved by a pending `consume`.
    pub fn data(&self) -> usize {
        (self.tail - self.head) - self.reserved
    }

    /// Free bytes available to `put`.
    pub fn space(&self) -> usize {
        self.capacity - (self.tail - self.head)
    }

    pub fn empty(&self) -> bool {
        self.tail == self.head
    }

    pub fn reset(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.reserved = 0;
    }

    /// Appends `src` to the buffer. `src` may be empty (used to reserve
    /// alignment padding without writing real data); fails with
    /// `TooLargeData` if there isn't enough space.
    pub fn put(&mut self, src: &[u8]) -> Result<()> {
        if src.len() > self.space() {
            return Err(NcpError::TooLargeData);
        }
        for &byte in src {
            let idx = self.tail % self.capacity;
            self.storage[idx] = byte;
            self.tail += 1;
        }
        Ok(())
    }

    /// Reserves `n` padding bytes (value `0`) without requiring source data,
    /// used to round a DMA span up to an alignment boundary.
    pub fn put_padding(&mut self, n: usize) -> Result<()> {
        if n > self.space() {
            return Err(NcpError::TooLargeData);
        }
        for _ in 0..n {
            let idx = self.tail % self.capacity;
            self.storage[idx] = 0;
            self.tail += 1;
        }
        Ok(())
    }

    /// Copies up to `dst.len()` buffered bytes into `dst`, returning the
    /// number copied.
    pub fn get(&mut self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.data());
        for slot in dst.iter_mut().take(n) {
            let idx = self.head % self.capacity;
            *slot = self.storage[idx];
            self.head += 1;
        }
        n
    }

    /// Returns a contiguous, non-wrapping span of up to `n` buffered bytes
    /// and marks them reserved; the span does not cross the backing array's
    /// wrap boundary, so it may be shorter than `n` even when more data is
    /// available. Call [`consume_commit`](Self::consume_commit) to release
    /// the reservation.
    pub fn consume(&mut self, n: usize) -> &[u8] {
        let available = self.data();
        let want = n.min(available);
        let start = self.head % self.capacity;
        let until_wrap = self.capacity - start;
        let span = want.min(until_wrap);
        self.reserved = span;
        &self.storage[start..start + span]
    }

    /// Commits a previous [`consume`](Self::consume) call: `actual` bytes
    /// were truly consumed (advances `head`), the remaining
    /// `reserved - actual` are released back to the buffer (available for a
    /// future `consume` again).
    pub fn consume_commit(&mut self, actual: usize, reserved: usize) {
        debug_assert!(actual <= reserved);
        debug_assert!(reserved <= self.reserved);
        self.head += actual;
        self.reserved = 0;
    }
}
