//! The GSM 07.10 basic-mode multiplexer session: framing, per-channel state,
//! control-channel negotiation, flow control, and keepalives.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::error::{NcpError, Result};
use crate::mux::channel::{Channel, ChannelState, ModemStatus};
use crate::mux::frame::{DecodeEvent, Decoder, Frame, FrameType};
use crate::synch::RecursiveMutex;
use crate::transport::Transport;

pub const DLCI_CONTROL: u8 = 0;

/// Control-channel (DLCI 0) command identifiers, packed the way basic-mode
/// multiplexer-control commands are: a type byte with EA/CR bits, a length
/// byte, then a command-specific payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlCommand {
    Pn = 0x20,
    Psc = 0x10,
    Cld = 0x30,
    Test = 0x08,
    Msc = 0x18,
    Fcon = 0x28,
    Fcoff = 0x38,
}

impl ControlCommand {
    fn from_type_byte(byte: u8) -> Option<Self> {
        match byte & !0x02 {
            0x20 => Some(Self::Pn),
            0x10 => Some(Self::Psc),
            0x30 => Some(Self::Cld),
            0x08 => Some(Self::Test),
            0x18 => Some(Self::Msc),
            0x28 => Some(Self::Fcon),
            0x38 => Some(Self::Fcoff),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Stopped,
    Starting,
    Started,
    Stopping,
}

/// Invoked on every DLCI data arrival. Must not block — it runs on the input
/// pump thread.
pub type DataHandler = Box<dyn FnMut(u8, &[u8]) + Send>;

/// Invoked on every channel-state transition; returning `false` refuses the
/// transition (the session sends DM instead of UA for an inbound SABM).
pub type StateHandler = Box<dyn FnMut(u8, ChannelState, ChannelState) -> bool + Send>;

struct Shared {
    state: Mutex<SessionState>,
    channels: Mutex<HashMap<u8, Channel>>,
    global_fcoff: AtomicBool,
    cancelled: AtomicBool,
    flow_changed: Condvar,
    keepalive_misses: AtomicU8,
    data_handlers: Mutex<HashMap<u8, DataHandler>>,
    state_handler: Mutex<Option<StateHandler>>,
}

/// The output path is guarded by a recursive mutex because control-channel
/// replies (e.g. an echoed Test command) are written from inside the input
/// pump while `writeChannel` may already be executing on another thread
/// emitting a multi-frame payload; re-entrant acquisition by the *same*
/// thread must not deadlock, which is why this is a [`RecursiveMutex`]
/// rather than `std::sync::Mutex`.
struct OutputGuard<'a> {
    lock: &'a RecursiveMutex,
}

impl Drop for OutputGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

struct Output {
    lock: RecursiveMutex,
    transport: UnsafeCell<Option<Arc<dyn Transport>>>,
}

// SAFETY: `transport` is only ever accessed while `lock` is held.
unsafe impl Send for Output {}
unsafe impl Sync for Output {}

impl Output {
    fn acquire(&self) -> OutputGuard<'_> {
        self.lock.acquire();
        OutputGuard { lock: &self.lock }
    }

    fn set(&self, transport: Arc<dyn Transport>) {
        let _guard = self.acquire();
        unsafe {
            *self.transport.get() = Some(transport);
        }
    }

    fn clear(&self) {
        let _guard = self.acquire();
        unsafe {
            *self.transport.get() = None;
        }
    }

    fn write_frame(&self, frame: &Frame, timeout: Duration) -> Result<()> {
        let _guard = self.acquire();
        let transport = unsafe { &*self.transport.get() }
            .clone()
            .ok_or(NcpError::InvalidState)?;
        let wire = frame.encode();
        let mut written = 0;
        let deadline = Instant::now() + timeout;
        while written < wire.len() {
            let n = transport.write_data(&wire[written..])?;
            if n == 0 {
                if Instant::now() >= deadline {
                    return Err(NcpError::Timeout);
                }
                std::thread::sleep(Duration::from_millis(2));
                continue;
            }
            written += n;
        }
        Ok(())
    }
}

/// A running GSM 07.10 basic-mode multiplexer.
pub struct MuxSession {
    config: Arc<Config>,
    underlying: Mutex<Option<Arc<dyn Transport>>>,
    output: Arc<Output>,
    decoder: Mutex<Decoder>,
    shared: Arc<Shared>,
    keepalive_thread: Mutex<Option<JoinHandle<()>>>,
}

impl MuxSession {
    pub fn new(config: Arc<Config>) -> Self {
        let mut channels = HashMap::new();
        channels.insert(DLCI_CONTROL, Channel::new(DLCI_CONTROL));

        Self {
            decoder: Mutex::new(Decoder::new(config.mux_n1_default)),
            config,
            underlying: Mutex::new(None),
            output: Arc::new(Output {
                lock: RecursiveMutex::new(),
                transport: UnsafeCell::new(None),
            }),
            shared: Arc::new(Shared {
                state: Mutex::new(SessionState::Stopped),
                channels: Mutex::new(channels),
                global_fcoff: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                flow_changed: Condvar::new(),
                keepalive_misses: AtomicU8::new(0),
                data_handlers: Mutex::new(HashMap::new()),
                state_handler: Mutex::new(None),
            }),
            keepalive_thread: Mutex::new(None),
        }
    }

    pub fn set_data_handler(&self, dlci: u8, handler: DataHandler) {
        self.shared.data_handlers.lock().unwrap().insert(dlci, handler);
    }

    pub fn set_state_handler(&self, handler: StateHandler) {
        *self.shared.state_handler.lock().unwrap() = Some(handler);
    }

    /// Starts the session atop `transport`, which must already be in direct
    /// mode with its notification callback wired to [`notify_input`](Self::notify_input).
    pub fn start(&self, transport: Arc<dyn Transport>) -> Result<()> {
        {
            let mut state = self.shared.state.lock().unwrap();
            if *state != SessionState::Stopped {
                return Err(NcpError::InvalidState);
            }
            *state = SessionState::Starting;
        }
        *self.underlying.lock().unwrap() = Some(Arc::clone(&transport));
        self.output.set(transport);
        self.shared.cancelled.store(false, Ordering::Release);
        self.shared.global_fcoff.store(false, Ordering::Release);

        for dlci in [1u8, 2, 3] {
            self.shared
                .channels
                .lock()
                .unwrap()
                .entry(dlci)
                .or_insert_with(|| Channel::new(dlci));
        }

        *self.shared.state.lock().unwrap() = SessionState::Started;

        let shared = Arc::clone(&self.shared);
        let output = Arc::clone(&self.output);
        let interval = self.config.mux_keepalive_interval;
        let miss_limit = self.config.mux_keepalive_miss_limit;
        let handle = std::thread::Builder::new()
            .name("mux-keepalive".into())
            .spawn(move || Self::keepalive_loop(shared, output, interval, miss_limit))
            .map_err(NcpError::Io)?;
        *self.keepalive_thread.lock().unwrap() = Some(handle);
        Ok(())
    }

    fn keepalive_loop(
        shared: Arc<Shared>,
        output: Arc<Output>,
        interval: Duration,
        miss_limit: u32,
    ) {
        loop {
            std::thread::sleep(interval);
            if *shared.state.lock().unwrap() != SessionState::Started {
                return;
            }
            let misses = shared.keepalive_misses.fetch_add(1, Ordering::AcqRel) + 1;
            if misses as u32 >= miss_limit {
                log::warn!("mux keepalive: {} consecutive misses, stopping session", misses);
                *shared.state.lock().unwrap() = SessionState::Stopping;
                shared.cancelled.store(true, Ordering::Release);
                shared.flow_changed.notify_all();
                return;
            }
            let frame = control_command_frame(ControlCommand::Test, &[]);
            let _ = output.write_frame(&frame, Duration::from_secs(1));
        }
    }

    pub fn is_running(&self) -> bool {
        *self.shared.state.lock().unwrap() == SessionState::Started
    }

    /// Stops the session: issues CLD best-effort, unblocks any
    /// `write_channel` callers, and marks the session stopped.
    pub fn stop(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock().unwrap();
            if *state != SessionState::Started {
                return Ok(());
            }
            *state = SessionState::Stopping;
        }
        let frame = control_command_frame(ControlCommand::Cld, &[]);
        let _ = self.output.write_frame(&frame, Duration::from_millis(500));
        self.shared.cancelled.store(true, Ordering::Release);
        self.shared.flow_changed.notify_all();
        self.output.clear();
        *self.underlying.lock().unwrap() = None;
        *self.shared.state.lock().unwrap() = SessionState::Stopped;
        Ok(())
    }

    /// Called by the transport's direct-mode notification callback with the
    /// count of newly-arrived bytes; reads exactly that many bytes from the
    /// underlying transport and feeds them to the decoder.
    pub fn notify_input(&self, len: usize) {
        let transport = match self.underlying.lock().unwrap().clone() {
            Some(t) => t,
            None => return,
        };
        let mut remaining = len;
        let mut buf = [0u8; 256];
        while remaining > 0 {
            let want = remaining.min(buf.len());
            let n = match transport.read_data(&mut buf[..want], Duration::from_millis(50)) {
                Ok(n) => n,
                Err(_) => break,
            };
            if n == 0 {
                break;
            }
            remaining -= n;
            for &byte in &buf[..n] {
                self.feed_byte(byte);
            }
        }
    }

    fn feed_byte(&self, byte: u8) {
        let event = self.decoder.lock().unwrap().feed(byte);
        match event {
            DecodeEvent::Pending => {}
            DecodeEvent::Dropped => {
                log::debug!("mux: dropped a frame (bad fcs or framing)");
            }
            DecodeEvent::Frame(frame) => self.handle_frame(frame),
        }
    }

    fn handle_frame(&self, frame: Frame) {
        self.shared.keepalive_misses.store(0, Ordering::Release);
        if frame.dlci == DLCI_CONTROL {
            self.handle_control_frame(&frame);
            return;
        }
        match frame.frame_type {
            FrameType::Sabm => self.handle_sabm(frame.dlci),
            FrameType::Ua => self.handle_ua(frame.dlci),
            FrameType::Disc => self.handle_disc(frame.dlci),
            FrameType::Dm => self.set_channel_state(frame.dlci, ChannelState::Closed),
            FrameType::Uih | FrameType::Ui => self.handle_data(frame.dlci, &frame.payload),
        }
    }

    fn set_channel_state(&self, dlci: u8, next: ChannelState) -> bool {
        let old = {
            let mut channels = self.shared.channels.lock().unwrap();
            let channel = channels.entry(dlci).or_insert_with(|| Channel::new(dlci));
            let old = channel.state;
            if !old.can_transition_to(next) {
                return false;
            }
            channel.state = next;
            old
        };
        let accepted = match self.shared.state_handler.lock().unwrap().as_mut() {
            Some(handler) => handler(dlci, old, next),
            None => true,
        };
        if !accepted {
            self.shared.channels.lock().unwrap().get_mut(&dlci).unwrap().state = old;
        }
        accepted
    }

    fn handle_sabm(&self, dlci: u8) {
        let accepted = self.set_channel_state(dlci, ChannelState::Open);
        let reply = if accepted {
            Frame::new(dlci, false, FrameType::Ua, Vec::new())
        } else {
            Frame::new(dlci, false, FrameType::Dm, Vec::new())
        };
        let _ = self.output.write_frame(&reply, Duration::from_secs(1));
    }

    fn handle_ua(&self, dlci: u8) {
        let channels = self.shared.channels.lock().unwrap();
        let state = channels.get(&dlci).map(|c| c.state);
        drop(channels);
        match state {
            Some(ChannelState::Opening) => {
                self.set_channel_state(dlci, ChannelState::Open);
            }
            Some(ChannelState::Closing) => {
                self.set_channel_state(dlci, ChannelState::Closed);
            }
            _ => {}
        }
    }

    fn handle_disc(&self, dlci: u8) {
        self.set_channel_state(dlci, ChannelState::Closed);
        let reply = Frame::new(dlci, false, FrameType::Ua, Vec::new());
        let _ = self.output.write_frame(&reply, Duration::from_secs(1));
    }

    fn handle_data(&self, dlci: u8, payload: &[u8]) {
        if let Some(handler) = self.shared.data_handlers.lock().unwrap().get_mut(&dlci) {
            handler(dlci, payload);
        }
    }

    fn handle_control_frame(&self, frame: &Frame) {
        if frame.payload.is_empty() {
            return;
        }
        let type_byte = frame.payload[0];
        let Some(command) = ControlCommand::from_type_byte(type_byte) else {
            return;
        };
        let is_command = type_byte & 0x02 != 0;
        match command {
            ControlCommand::Test if is_command => {
                let reply = control_command_frame(ControlCommand::Test, &frame.payload[2..]);
                let _ = self.output.write_frame(&reply, Duration::from_secs(1));
            }
            ControlCommand::Test => {
                // Response to our own keepalive: already cleared above.
            }
            ControlCommand::Fcoff if is_command => {
                self.shared.global_fcoff.store(true, Ordering::Release);
                let reply = control_command_frame(ControlCommand::Fcoff, &[]);
                let _ = self.output.write_frame(&reply, Duration::from_secs(1));
            }
            ControlCommand::Fcon if is_command => {
                self.shared.global_fcoff.store(false, Ordering::Release);
                self.shared.flow_changed.notify_all();
                let reply = control_command_frame(ControlCommand::Fcon, &[]);
                let _ = self.output.write_frame(&reply, Duration::from_secs(1));
            }
            ControlCommand::Msc if is_command => {
                if frame.payload.len() >= 4 {
                    let target_dlci = frame.payload[2] >> 2;
                    let status = ModemStatus::from_byte(frame.payload[3]);
                    if let Some(channel) = self.shared.channels.lock().unwrap().get_mut(&target_dlci) {
                        channel.remote_status = status;
                    }
                    self.shared.flow_changed.notify_all();
                }
                let reply = control_command_frame(ControlCommand::Msc, &frame.payload[2..]);
                let _ = self.output.write_frame(&reply, Duration::from_secs(1));
            }
            ControlCommand::Cld if is_command => {
                *self.shared.state.lock().unwrap() = SessionState::Stopping;
                self.shared.cancelled.store(true, Ordering::Release);
                self.shared.flow_changed.notify_all();
            }
            ControlCommand::Psc if is_command => {
                let reply = control_command_frame(ControlCommand::Psc, &[]);
                let _ = self.output.write_frame(&reply, Duration::from_secs(1));
            }
            ControlCommand::Pn if is_command => {
                let mut extra = frame.payload[2..].to_vec();
                if extra.len() >= 6 {
                    let proposed_n1 = u16::from_le_bytes([extra[4], extra[5]]) as usize;
                    let accepted_n1 = proposed_n1.clamp(1, self.config.mux_n1_ceiling);
                    self.decoder.lock().unwrap().set_max_payload(accepted_n1);
                    let accepted = (accepted_n1 as u16).to_le_bytes();
                    extra[4] = accepted[0];
                    extra[5] = accepted[1];
                }
                let reply = control_command_frame(ControlCommand::Pn, &extra);
                let _ = self.output.write_frame(&reply, Duration::from_secs(1));
            }
            _ => {}
        }
    }

    /// Splits `data` into UIH frames of at most the negotiated frame size
    /// and writes them to `dlci`, blocking up to `timeout` while the
    /// channel's remote flow control (or a global FCOFF) is asserted.
    pub fn write_channel(&self, dlci: u8, data: &[u8], timeout: Duration) -> Result<usize> {
        if !self.is_running() {
            return Err(NcpError::InvalidState);
        }
        let deadline = Instant::now() + timeout;
        self.wait_for_flow(dlci, deadline)?;

        let n1 = self.config.mux_n1_default;
        let mut written = 0;
        for chunk in data.chunks(n1) {
            self.wait_for_flow(dlci, deadline)?;
            let frame = Frame::new(dlci, true, FrameType::Uih, chunk.to_vec());
            let remaining = deadline.saturating_duration_since(Instant::now());
            self.output.write_frame(&frame, remaining)?;
            written += chunk.len();
        }
        Ok(written)
    }

    fn wait_for_flow(&self, dlci: u8, deadline: Instant) -> Result<()> {
        loop {
            if self.shared.cancelled.load(Ordering::Acquire) {
                return Err(NcpError::Cancelled);
            }
            let blocked = self.shared.global_fcoff.load(Ordering::Acquire)
                || self
                    .shared
                    .channels
                    .lock()
                    .unwrap()
                    .get(&dlci)
                    .map(|c| c.remote_status.contains(ModemStatus::FC))
                    .unwrap_or(false);
            if !blocked {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(NcpError::Timeout);
            }
            let guard = self.shared.channels.lock().unwrap();
            let (_guard, _result) = self
                .shared
                .flow_changed
                .wait_timeout(guard, deadline - now)
                .unwrap();
        }
    }
}

fn control_command_frame(command: ControlCommand, extra: &[u8]) -> Frame {
    let mut payload = Vec::with_capacity(2 + extra.len());
    payload.push(command as u8 | 0x02);
    let len = extra.len();
    payload.push(((len as u8) << 1) | 0x01);
    payload.extend_from_slice(extra);
    Frame::new(DLCI_CONTROL, true, FrameType::Uih, payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use crate::transport::DirectModeCallback;
    use std::time::Duration;

    struct PairedTransport {
        inbox: StdMutex<std::collections::VecDeque<u8>>,
        outbox: StdMutex<Vec<u8>>,
    }

    impl Transport for PairedTransport {
        fn init(&self) -> Result<()> {
            Ok(())
        }
        fn destroy(&self) -> Result<()> {
            Ok(())
        }
        fn read_data(&self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
            let mut inbox = self.inbox.lock().unwrap();
            let n = buf.len().min(inbox.len());
            for slot in buf.iter_mut().take(n) {
                *slot = inbox.pop_front().unwrap();
            }
            Ok(n)
        }
        fn write_data(&self, data: &[u8]) -> Result<usize> {
            self.outbox.lock().unwrap().extend_from_slice(data);
            Ok(data.len())
        }
        fn flush_input(&self) -> Result<()> {
            Ok(())
        }
        fn data_length(&self) -> usize {
            self.inbox.lock().unwrap().len()
        }
        fn wait_write_complete(&self, _timeout: Duration) -> Result<()> {
            Ok(())
        }
        fn set_direct_mode(&self, _on: bool, _cb: Option<DirectModeCallback>) {}
        fn is_direct_mode(&self) -> bool {
            true
        }
    }

    #[test]
    fn sabm_is_accepted_and_replies_ua() {
        let transport: Arc<dyn Transport> = Arc::new(PairedTransport {
            inbox: StdMutex::new(std::collections::VecDeque::new()),
            outbox: StdMutex::new(Vec::new()),
        });
        let session = MuxSession::new(Arc::new(Config::default()));
        session.start(Arc::clone(&transport)).unwrap();

        let sabm = Frame::new(1, true, FrameType::Sabm, Vec::new()).encode();
        for &b in &sabm {
            session.feed_byte(b);
        }

        let state = session.shared.channels.lock().unwrap().get(&1).unwrap().state;
        assert_eq!(state, ChannelState::Open);
        session.stop().unwrap();
    }

    #[test]
    fn pn_negotiation_clamps_to_configured_ceiling() {
        let transport: Arc<dyn Transport> = Arc::new(PairedTransport {
            inbox: StdMutex::new(std::collections::VecDeque::new()),
            outbox: StdMutex::new(Vec::new()),
        });
        let config = Arc::new(Config {
            mux_n1_ceiling: 32,
            ..Config::default()
        });
        let session = MuxSession::new(config);

        let received: Arc<StdMutex<Vec<usize>>> = Arc::new(StdMutex::new(Vec::new()));
        let received_for_handler = Arc::clone(&received);
        session.set_data_handler(
            1,
            Box::new(move |_dlci, data| {
                received_for_handler.lock().unwrap().push(data.len());
            }),
        );

        session.start(Arc::clone(&transport)).unwrap();

        let sabm = Frame::new(1, true, FrameType::Sabm, Vec::new()).encode();
        for &b in &sabm {
            session.feed_byte(b);
        }

        // Propose N1 = 200 against a ceiling of 32; the session should clamp.
        let pn_extra = vec![1 << 2, 0, 0, 0, 200u8, 0u8, 0, 7];
        let pn = control_command_frame(ControlCommand::Pn, &pn_extra).encode();
        for &b in &pn {
            session.feed_byte(b);
        }

        let oversized = Frame::new(1, true, FrameType::Uih, vec![0xAAu8; 40]).encode();
        for &b in &oversized {
            session.feed_byte(b);
        }
        assert!(received.lock().unwrap().is_empty());

        let fits = Frame::new(1, true, FrameType::Uih, vec![0xBBu8; 20]).encode();
        for &b in &fits {
            session.feed_byte(b);
        }
        assert_eq!(received.lock().unwrap().as_slice(), &[20]);

        session.stop().unwrap();
    }

    #[test]
    fn writing_a_channel_splits_into_frames_at_n1() {
        let transport: Arc<dyn Transport> = Arc::new(PairedTransport {
            inbox: StdMutex::new(std::collections::VecDeque::new()),
            outbox: StdMutex::new(Vec::new()),
        });
        let config = Arc::new(Config {
            mux_n1_default: 4,
            ..Config::default()
        });
        let session = MuxSession::new(config);
        session.start(transport).unwrap();
        let n = session
            .write_channel(1, b"abcdefgh", Duration::from_secs(1))
            .unwrap();
        assert_eq!(n, 8);
        session.stop().unwrap();
    }
}
