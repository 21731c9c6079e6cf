//! The transport contract and the process-wide "active transport" registry.

pub mod mux_transport;
pub mod sdio;
pub mod uart;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{NcpError, Result};

/// Callback invoked from a transport's RX thread while it is in direct mode,
/// once per arrival of new bytes. Must not block.
pub type DirectModeCallback = Box<dyn Fn(usize) + Send + Sync>;

/// The polymorphic transport contract every backend (UART, SDIO, the mux
/// transport layered on either) implements.
///
/// Backends are driven by the AT-library glue through whichever transport is
/// currently [`ActiveTransport`]; at most one is active, and it is bypassed
/// in favor of a registered [`DirectModeCallback`] while in direct mode.
pub trait Transport: Send + Sync {
    /// Starts background threads and registers with the backend hardware.
    fn init(&self) -> Result<()>;

    /// Stops background threads and releases hardware.
    fn destroy(&self) -> Result<()>;

    /// Reads up to `buf.len()` bytes, blocking at most `timeout`. Returns
    /// `0` on timeout with no data, never blocks past `timeout`.
    fn read_data(&self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Writes all of `data`, or as much as clears transient backpressure;
    /// returns the number of bytes actually written.
    fn write_data(&self, data: &[u8]) -> Result<usize>;

    /// Discards any buffered input.
    fn flush_input(&self) -> Result<()>;

    /// Bytes immediately available to [`read_data`](Self::read_data) without blocking.
    fn data_length(&self) -> usize;

    /// Blocks until the TX path is drained, or `timeout` elapses.
    fn wait_write_complete(&self, timeout: Duration) -> Result<()>;

    /// Enables or disables direct mode. When enabling with `Some(cb)`, `cb`
    /// is invoked from the RX thread with the byte count each time data
    /// arrives, instead of notifying the AT parser.
    fn set_direct_mode(&self, on: bool, cb: Option<DirectModeCallback>);

    fn is_direct_mode(&self) -> bool;
}

/// The process-wide "currently active" transport; AT-library device-ops
/// dispatch through whichever transport is registered here.
#[derive(Default)]
pub struct ActiveTransport {
    inner: Mutex<Option<Arc<dyn Transport>>>,
}

impl ActiveTransport {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    pub fn set(&self, transport: Arc<dyn Transport>) {
        *self.inner.lock().unwrap() = Some(transport);
    }

    pub fn clear(&self) {
        *self.inner.lock().unwrap() = None;
    }

    pub fn get(&self) -> Result<Arc<dyn Transport>> {
        self.inner
            .lock()
            .unwrap()
            .clone()
            .ok_or(NcpError::InvalidState)
    }

    pub fn is_set(&self) -> bool {
        self.inner.lock().unwrap().is_some()
    }
}
