//! Minimal byte-stream contract shared by transports, XMODEM, and the
//! firmware image writer.
//!
//! Transports, the image-writer sink, and XMODEM's source/destination are
//! all expressed in terms of [`embedded_io`]'s `Read`/`Write` traits rather
//! than a bespoke pair, so any backend that already speaks `embedded-io`
//! (the UART crates this crate depends on) plugs in without an adaptor.

pub use embedded_io::{Read, Write};

use crate::error::{NcpError, Result};

/// Adapts an [`embedded_io::Error`] into this crate's [`NcpError`].
pub fn map_io_err<E: embedded_io::Error>(err: E) -> NcpError {
    use embedded_io::ErrorKind;
    match err.kind() {
        ErrorKind::TimedOut => NcpError::Timeout,
        ErrorKind::OutOfMemory => NcpError::NoMemory,
        ErrorKind::InvalidInput | ErrorKind::InvalidData => NcpError::InvalidParam,
        _ => NcpError::Io(std::io::Error::other(format!("{:?}", err.kind()))),
    }
}

/// A sink an image update streams bytes into: `begin`/`write`/`finish`/`cancel`.
///
/// Mirrors the external flash-writer collaborator this crate treats as a
/// black box; production code backs this with the platform's partition
/// writer, tests back it with an in-memory `Vec<u8>`.
pub trait ImageSink: Send {
    /// Prepares to receive exactly `expected_len` bytes.
    fn begin(&mut self, expected_len: usize) -> Result<()>;
    /// Appends `data` to the image; called in order, no gaps.
    fn write(&mut self, data: &[u8]) -> Result<()>;
    /// Commits the image as complete and valid.
    fn finish(&mut self) -> Result<()>;
    /// Discards everything written so far.
    fn cancel(&mut self) -> Result<()>;
}

/// An in-memory [`ImageSink`] used by tests and by hosts without real flash.
#[derive(Default)]
pub struct MemoryImageSink {
    pub expected_len: usize,
    pub data: Vec<u8>,
    pub finished: bool,
}

impl ImageSink for MemoryImageSink {
    fn begin(&mut self, expected_len: usize) -> Result<()> {
        self.expected_len = expected_len;
        self.data.clear();
        self.finished = false;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.data.len() + data.len() > self.expected_len {
            return Err(NcpError::TooLargeData);
        }
        self.data.extend_from_slice(data);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if self.data.len() != self.expected_len {
            return Err(NcpError::InvalidState);
        }
        self.finished = true;
        Ok(())
    }

    fn cancel(&mut self) -> Result<()> {
        self.data.clear();
        self.finished = false;
        Ok(())
    }
}
