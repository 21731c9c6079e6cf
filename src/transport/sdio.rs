//! SDIO transport: a slave SDIO driver wrapped by separate RX and TX
//! threads, since the underlying driver cannot block on both directions at
//! once.
//!
//! Grounded on the kernel's virtio-console queue management
//! (`drivers::console`) for the pattern of pre-registered fixed-size buffers
//! handed back and forth with a hardware queue, re-expressed here against a
//! small [`SdioHal`] seam instead of a concrete virtio queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::error::{NcpError, Result};
use crate::ring_buffer::RingBuffer;
use crate::synch::RecursiveMutex;
use crate::transport::{DirectModeCallback, Transport};

/// The hardware-facing half of the SDIO transport.
pub trait SdioHal: Send + Sync {
    /// Registers `count` fixed-size `buf_len` receive buffers with the driver.
    fn register_rx_buffers(&self, count: usize, buf_len: usize);
    /// Blocks until a receive buffer is filled; returns `(buffer_id, data)`.
    fn recv(&self, timeout: Duration) -> Option<(u32, Vec<u8>)>;
    /// Returns a drained receive buffer to the driver's free pool and pokes
    /// the host interrupt line announcing a new free slot.
    fn recv_load_buf(&self, buffer_id: u32);
    /// Submits a contiguous, DMA-capable, 4-byte-aligned span for transmission.
    fn send_queue(&self, data: &[u8]) -> Result<()>;
    /// Blocks until the most recently queued `send_queue` span has been
    /// consumed by the hardware, up to `timeout`.
    fn send_get_finished(&self, timeout: Duration) -> bool;
}

/// An in-memory `SdioHal` double driven directly by tests/hosts.
pub struct LoopbackSdioHal {
    to_device: Mutex<VecDeque<Vec<u8>>>,
    to_host: Mutex<Vec<u8>>,
}

impl LoopbackSdioHal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            to_device: Mutex::new(VecDeque::new()),
            to_host: Mutex::new(Vec::new()),
        })
    }

    pub fn push_from_host(&self, chunk: Vec<u8>) {
        self.to_device.lock().unwrap().push_back(chunk);
    }

    pub fn drain_to_host(&self) -> Vec<u8> {
        std::mem::take(&mut self.to_host.lock().unwrap())
    }
}

impl SdioHal for LoopbackSdioHal {
    fn register_rx_buffers(&self, _count: usize, _buf_len: usize) {}

    fn recv(&self, timeout: Duration) -> Option<(u32, Vec<u8>)> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(chunk) = self.to_device.lock().unwrap().pop_front() {
                return Some((0, chunk));
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn recv_load_buf(&self, _buffer_id: u32) {}

    fn send_queue(&self, data: &[u8]) -> Result<()> {
        self.to_host.lock().unwrap().extend_from_slice(data);
        Ok(())
    }

    fn send_get_finished(&self, _timeout: Duration) -> bool {
        true
    }
}

struct RxInner {
    /// FIFO of buffers received from the driver but not fully drained yet.
    queue: Mutex<VecDeque<(u32, Vec<u8>, usize)>>,
    available: AtomicUsize,
}

struct TxInner {
    ring: RecursiveMutex,
    ring_data: Mutex<RingBuffer>,
    drained: Mutex<bool>,
    drained_cv: std::sync::Condvar,
}

pub struct SdioTransport {
    hal: Arc<dyn SdioHal>,
    config: Arc<Config>,
    exit: Arc<AtomicBool>,
    direct_mode: Arc<AtomicBool>,
    direct_cb: Arc<Mutex<Option<DirectModeCallback>>>,
    rx: Arc<RxInner>,
    tx: Arc<TxInner>,
    rx_thread: Mutex<Option<JoinHandle<()>>>,
    tx_thread: Mutex<Option<JoinHandle<()>>>,
}

const RX_BUFFER_COUNT: usize = 8;
const RX_BUFFER_LEN: usize = 2048;
const TX_RING_CAPACITY: usize = 8192;

impl SdioTransport {
    pub fn new(hal: Arc<dyn SdioHal>, config: Arc<Config>) -> Self {
        Self {
            hal,
            config,
            exit: Arc::new(AtomicBool::new(false)),
            direct_mode: Arc::new(AtomicBool::new(false)),
            direct_cb: Arc::new(Mutex::new(None)),
            rx: Arc::new(RxInner {
                queue: Mutex::new(VecDeque::new()),
                available: AtomicUsize::new(0),
            }),
            tx: Arc::new(TxInner {
                ring: RecursiveMutex::new(),
                ring_data: Mutex::new(RingBuffer::new(TX_RING_CAPACITY)),
                drained: Mutex::new(true),
                drained_cv: std::sync::Condvar::new(),
            }),
            rx_thread: Mutex::new(None),
            tx_thread: Mutex::new(None),
        }
    }

    fn rx_loop(
        hal: Arc<dyn SdioHal>,
        exit: Arc<AtomicBool>,
        direct_mode: Arc<AtomicBool>,
        direct_cb: Arc<Mutex<Option<DirectModeCallback>>>,
        rx: Arc<RxInner>,
    ) {
        while !exit.load(Ordering::Acquire) {
            match hal.recv(Duration::from_millis(200)) {
                Some((id, data)) => {
                    let len = data.len();
                    rx.queue.lock().unwrap().push_back((id, data, 0));
                    rx.available.fetch_add(len, Ordering::AcqRel);
                    if direct_mode.load(Ordering::Acquire) {
                        if let Some(cb) = direct_cb.lock().unwrap().as_ref() {
                            cb(len);
                        }
                    }
                }
                None => continue,
            }
        }
    }

    fn start_transmission(hal: &dyn SdioHal, tx: &TxInner, block_size: usize) {
        tx.ring.acquire();
        let span_len = {
            let mut ring = tx.ring_data.lock().unwrap();
            let data = ring.data();
            if data == 0 {
                tx.ring.release();
                return;
            }
            let want = data.min(block_size);
            let span = ring.consume(want);
            let span_len = span.len();
            let aligned = span_len.div_ceil(4) * 4;
            let padding = aligned - span_len;
            let span_copy = span.to_vec();
            match hal.send_queue(&span_copy) {
                Ok(()) => {
                    ring.consume_commit(span_len, span_len);
                    if padding > 0 {
                        let _ = ring.put_padding(padding);
                        let pad_span = ring.consume(padding);
                        let pad_len = pad_span.len();
                        ring.consume_commit(pad_len, pad_len);
                    }
                }
                Err(_) => {
                    ring.consume_commit(0, span_len);
                }
            }
            span_len
        };
        tx.ring.release();
        let _ = span_len;
    }

    fn tx_loop(hal: Arc<dyn SdioHal>, tx: Arc<TxInner>, exit: Arc<AtomicBool>, block_size: usize) {
        while !exit.load(Ordering::Acquire) {
            Self::start_transmission(hal.as_ref(), &tx, block_size);
            if hal.send_get_finished(Duration::from_millis(200)) {
                let mut drained = tx.drained.lock().unwrap();
                *drained = tx.ring_data.lock().unwrap().empty();
                tx.drained_cv.notify_all();
            }
        }
    }
}

impl Transport for SdioTransport {
    fn init(&self) -> Result<()> {
        self.hal.register_rx_buffers(RX_BUFFER_COUNT, RX_BUFFER_LEN);

        let hal = Arc::clone(&self.hal);
        let exit = Arc::clone(&self.exit);
        let direct_mode = Arc::clone(&self.direct_mode);
        let direct_cb = Arc::clone(&self.direct_cb);
        let rx = Arc::clone(&self.rx);
        let rx_handle = std::thread::Builder::new()
            .name("sdio-rx".into())
            .spawn(move || Self::rx_loop(hal, exit, direct_mode, direct_cb, rx))
            .map_err(NcpError::Io)?;
        *self.rx_thread.lock().unwrap() = Some(rx_handle);

        let hal = Arc::clone(&self.hal);
        let tx = Arc::clone(&self.tx);
        let exit = Arc::clone(&self.exit);
        let block_size = self.config.sdio_block_size;
        let tx_handle = std::thread::Builder::new()
            .name("sdio-tx".into())
            .spawn(move || Self::tx_loop(hal, tx, exit, block_size))
            .map_err(NcpError::Io)?;
        *self.tx_thread.lock().unwrap() = Some(tx_handle);
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        self.exit.store(true, Ordering::Release);
        if let Some(h) = self.rx_thread.lock().unwrap().take() {
            let _ = h.join();
        }
        if let Some(h) = self.tx_thread.lock().unwrap().take() {
            let _ = h.join();
        }
        Ok(())
    }

    fn read_data(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut queue = self.rx.queue.lock().unwrap();
                if let Some((id, data, offset)) = queue.front_mut() {
                    let remaining = &data[*offset..];
                    let n = remaining.len().min(buf.len());
                    buf[..n].copy_from_slice(&remaining[..n]);
                    *offset += n;
                    self.rx.available.fetch_sub(n, Ordering::AcqRel);
                    if *offset == data.len() {
                        let id = *id;
                        queue.pop_front();
                        drop(queue);
                        self.hal.recv_load_buf(id);
                    }
                    return Ok(n);
                }
            }
            if Instant::now() >= deadline {
                return Ok(0);
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn write_data(&self, data: &[u8]) -> Result<usize> {
        self.tx.ring.acquire();
        let result = self.tx.ring_data.lock().unwrap().put(data);
        self.tx.ring.release();
        *self.tx.drained.lock().unwrap() = false;
        result.map(|_| data.len())
    }

    fn flush_input(&self) -> Result<()> {
        let mut queue = self.rx.queue.lock().unwrap();
        for (id, _, _) in queue.drain(..) {
            self.hal.recv_load_buf(id);
        }
        self.rx.available.store(0, Ordering::Release);
        Ok(())
    }

    fn data_length(&self) -> usize {
        self.rx.available.load(Ordering::Acquire)
    }

    fn wait_write_complete(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut drained = self.tx.drained.lock().unwrap();
        while !*drained {
            let now = Instant::now();
            if now >= deadline {
                return Err(NcpError::Timeout);
            }
            let (guard, result) = self
                .tx
                .drained_cv
                .wait_timeout(drained, deadline - now)
                .unwrap();
            drained = guard;
            if result.timed_out() && !*drained {
                return Err(NcpError::Timeout);
            }
        }
        Ok(())
    }

    fn set_direct_mode(&self, on: bool, cb: Option<DirectModeCallback>) {
        *self.direct_cb.lock().unwrap() = cb;
        self.direct_mode.store(on, Ordering::Release);
    }

    fn is_direct_mode(&self) -> bool {
        self.direct_mode.load(Ordering::Acquire)
    }
}
