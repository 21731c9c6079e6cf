//! Binds the XMODEM receiver to the image-writer sink and drives the
//! `+FWUPD` command's lifecycle.

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::error::{NcpError, Result};
use crate::stream::ImageSink;
use crate::transport::ActiveTransport;
use crate::xmodem::{Receiver, StepResult};

/// Hook for restarting the device; injected so tests can observe "the
/// device would have restarted here" without actually restarting the host
/// process.
pub trait RestartHook: Send + Sync {
    fn restart(&self);
}

/// A `RestartHook` that just records whether it fired, for tests.
#[derive(Default)]
pub struct RecordingRestartHook {
    pub fired: std::sync::atomic::AtomicBool,
}

impl RestartHook for RecordingRestartHook {
    fn restart(&self) {
        self.fired.store(true, std::sync::atomic::Ordering::Release);
    }
}

/// Unconditionally cancels the wrapped sink on drop unless
/// [`commit`](Self::commit) has already consumed it — the scope-guarded
/// rollback the firmware-update path relies on instead of a manual
/// cancel-on-every-error-path.
struct UpdateGuard<'a> {
    sink: &'a mut dyn ImageSink,
    committed: bool,
}

impl<'a> UpdateGuard<'a> {
    fn new(sink: &'a mut dyn ImageSink) -> Self {
        Self {
            sink,
            committed: false,
        }
    }

    fn commit(mut self) -> Result<()> {
        self.committed = true;
        self.sink.finish()
    }
}

impl Drop for UpdateGuard<'_> {
    fn drop(&mut self) {
        if !self.committed {
            let _ = self.sink.cancel();
        }
    }
}

/// Runs the `+FWUPD=<size>` command end to end: begins the update, enables
/// direct mode on the active transport, drives XMODEM to completion, then
/// disables direct mode and either commits (success) or rolls back
/// (failure) before returning.
///
/// On success the device is expected to restart via `restart_hook`; because
/// a restart never returns control to the AT parser, the success path has
/// no meaningful "and then respond OK" step beyond what is modeled here —
/// the caller's AT-library glue is expected to emit `+FWUPD: ONGOING`
/// before calling this, and this function's `Ok(())` return is the signal
/// to emit the final `OK` immediately before the restart hook fires.
pub fn run_firmware_update(
    active: &ActiveTransport,
    config: &Config,
    sink: &mut dyn ImageSink,
    expected_size: usize,
    restart_hook: &dyn RestartHook,
) -> Result<()> {
    if expected_size == 0 || expected_size > config.fwupd_max_image_size {
        return Err(NcpError::OutOfRange);
    }

    let transport = active.get()?;
    transport.set_direct_mode(true, None);

    let result = (|| -> Result<()> {
        let mut guard = UpdateGuard::new(sink);
        let mut receiver =
            Receiver::new(transport.as_ref(), &mut *guard.sink, config, expected_size)?;
        loop {
            match receiver.run()? {
                StepResult::Done => break,
                StepResult::Running => continue,
            }
        }
        guard.commit()
    })();

    // Drain any trailing CAN bytes left on the wire before handing the
    // transport back to the AT parser.
    let mut drain_buf = [0u8; 64];
    while transport
        .read_data(&mut drain_buf, Duration::from_millis(50))
        .unwrap_or(0)
        > 0
    {}

    transport.set_direct_mode(false, None);

    if result.is_ok() {
        let _ = transport.wait_write_complete(Duration::from_secs(5));
        restart_hook.restart();
    }

    result
}

/// Process-wide guard ensuring only one `+FWUPD` runs at a time.
pub struct FirmwareUpdateCoordinator {
    busy: Arc<std::sync::Mutex<bool>>,
}

impl Default for FirmwareUpdateCoordinator {
    fn default() -> Self {
        Self {
            busy: Arc::new(std::sync::Mutex::new(false)),
        }
    }
}

impl FirmwareUpdateCoordinator {
    pub fn try_begin(&self) -> Result<()> {
        let mut busy = self.busy.lock().unwrap();
        if *busy {
            return Err(NcpError::Busy);
        }
        *busy = true;
        Ok(())
    }

    pub fn end(&self) {
        *self.busy.lock().unwrap() = false;
    }
}
