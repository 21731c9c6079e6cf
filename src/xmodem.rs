//! XMODEM-1K receive state machine, pumped by the caller in a tight loop
//! rather than owning its own thread — so the caller (the `+FWUPD` command
//! handler, running on the AT parser's thread) controls priority and
//! cancellation.

use std::time::{Duration, Instant};

use crate::config::Config;
use crate::crc::crc16_ccitt;
use crate::error::{NcpError, Result};
use crate::stream::ImageSink;
use crate::transport::Transport;

const SOH: u8 = 0x01;
const STX: u8 = 0x02;
const EOT: u8 = 0x04;
const CAN: u8 = 0x18;
const NCG_BYTE: u8 = b'C';
const ACK: u8 = 0x06;
const NAK: u8 = 0x15;

const SHORT_PACKET_SIZE: usize = 128;
const LONG_PACKET_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    SendNcg,
    RecvPacketHeader,
    RecvPacketData,
    Done,
}

/// Outcome of one [`Receiver::run`] step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    Running,
    Done,
}

/// The XMODEM-1K receive state machine.
pub struct Receiver<'a> {
    transport: &'a dyn Transport,
    sink: &'a mut dyn ImageSink,
    config: &'a Config,

    state: State,
    file_size: usize,
    file_offset: usize,
    packet_num: u8,
    held_packet: Vec<u8>,
    retry_count: u32,
    recv_can_count: u32,
    ncg_sent: u32,
    state_entered: Instant,

    /// Size of the packet currently being received (128 or 1024), set when
    /// its header byte (SOH/STX) is seen.
    pending_packet_size: usize,
    /// Bytes accumulated for the in-flight packet: number, complement, data, CRC16.
    pending_num_bytes: Vec<u8>,
}

impl<'a> Receiver<'a> {
    pub fn new(
        transport: &'a dyn Transport,
        sink: &'a mut dyn ImageSink,
        config: &'a Config,
        expected_size: usize,
    ) -> Result<Self> {
        sink.begin(expected_size)?;
        Ok(Self {
            transport,
            sink,
            config,
            state: State::SendNcg,
            file_size: expected_size,
            file_offset: 0,
            packet_num: 1,
            held_packet: Vec::new(),
            retry_count: 0,
            recv_can_count: 0,
            ncg_sent: 0,
            state_entered: Instant::now(),
            pending_packet_size: 0,
            pending_num_bytes: Vec::new(),
        })
    }

    fn enter(&mut self, state: State) {
        self.state = state;
        self.state_entered = Instant::now();
    }

    fn read_byte(&self, timeout: Duration) -> Result<Option<u8>> {
        let mut buf = [0u8; 1];
        let n = self.transport.read_data(&mut buf, timeout)?;
        Ok(if n == 1 { Some(buf[0]) } else { None })
    }

    fn write_all(&self, data: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < data.len() {
            let n = self.transport.write_data(&data[written..])?;
            if n == 0 {
                return Err(NcpError::Io(std::io::Error::from(
                    std::io::ErrorKind::WriteZero,
                )));
            }
            written += n;
        }
        Ok(())
    }

    fn abort(&mut self, err: NcpError) -> Result<StepResult> {
        let can = [CAN; 1];
        for _ in 0..self.config.xmodem_send_can_count {
            let _ = self.write_all(&can);
        }
        self.enter(State::Done);
        Err(err)
    }

    /// Executes one non-blocking step. Call repeatedly until it returns
    /// `Ok(StepResult::Done)` or an `Err`.
    pub fn run(&mut self) -> Result<StepResult> {
        match self.state {
            State::Done => Ok(StepResult::Done),
            State::SendNcg => self.step_send_ncg(),
            State::RecvPacketHeader => self.step_recv_header(),
            State::RecvPacketData => self.step_recv_data(),
        }
    }

    fn step_send_ncg(&mut self) -> Result<StepResult> {
        if self.ncg_sent >= self.config.xmodem_ncg_retry_count {
            self.enter(State::Done);
            return Err(NcpError::Timeout);
        }
        self.write_all(&[NCG_BYTE])?;
        self.ncg_sent += 1;

        if let Some(byte) = self.read_byte(self.config.xmodem_ncg_interval)? {
            match byte {
                SOH | STX | EOT => {
                    self.enter(State::RecvPacketHeader);
                    return self.handle_header_byte(byte);
                }
                CAN => return self.handle_can(),
                _ => {}
            }
        }
        Ok(StepResult::Running)
    }

    fn handle_can(&mut self) -> Result<StepResult> {
        self.recv_can_count += 1;
        if self.recv_can_count >= self.config.xmodem_recv_can_count {
            self.enter(State::Done);
            return Err(NcpError::Cancelled);
        }
        Ok(StepResult::Running)
    }

    fn step_recv_header(&mut self) -> Result<StepResult> {
        match self.read_byte(self.config.xmodem_step_timeout)? {
            Some(byte) => self.handle_header_byte(byte),
            None => {
                if self.state_entered.elapsed() > self.config.xmodem_packet_timeout {
                    self.enter(State::Done);
                    return Err(NcpError::Timeout);
                }
                Ok(StepResult::Running)
            }
        }
    }

    fn handle_header_byte(&mut self, byte: u8) -> Result<StepResult> {
        match byte {
            SOH => self.begin_packet(SHORT_PACKET_SIZE),
            STX => self.begin_packet(LONG_PACKET_SIZE),
            EOT => self.finish_transfer(),
            CAN => self.handle_can(),
            _ => Err(NcpError::Protocol),
        }
    }

    fn begin_packet(&mut self, size: usize) -> Result<StepResult> {
        self.recv_can_count = 0;
        self.pending_packet_size = size;
        self.pending_num_bytes.clear();
        self.enter(State::RecvPacketData);
        Ok(StepResult::Running)
    }

    fn finish_transfer(&mut self) -> Result<StepResult> {
        self.flush_held_packet()?;
        if self.file_offset != self.file_size {
            self.enter(State::Done);
            return Err(NcpError::InvalidState);
        }
        self.write_all(&[ACK])?;
        self.sink.finish()?;
        self.enter(State::Done);
        Ok(StepResult::Done)
    }

    fn flush_held_packet(&mut self) -> Result<()> {
        if self.held_packet.is_empty() {
            return Ok(());
        }
        let remaining = self.file_size - self.file_offset;
        let take = self.held_packet.len().min(remaining);
        self.sink.write(&self.held_packet[..take])?;
        self.file_offset += take;
        self.held_packet.clear();
        Ok(())
    }

    fn step_recv_data(&mut self) -> Result<StepResult> {
        let size = self.pending_packet_size;
        // Collect: packet number, complement, `size` data bytes, 2 CRC bytes.
        let needed = 2 + size + 2;
        while self.pending_num_bytes.len() < needed {
            match self.read_byte(self.config.xmodem_step_timeout)? {
                Some(byte) => self.pending_num_bytes.push(byte),
                None => {
                    if self.state_entered.elapsed() > self.config.xmodem_packet_timeout {
                        self.enter(State::Done);
                        return Err(NcpError::Timeout);
                    }
                    return Ok(StepResult::Running);
                }
            }
        }

        let num = self.pending_num_bytes[0];
        let num_complement = self.pending_num_bytes[1];
        let data = &self.pending_num_bytes[2..2 + size];
        let crc_hi = self.pending_num_bytes[2 + size];
        let crc_lo = self.pending_num_bytes[2 + size + 1];
        let received_crc = ((crc_hi as u16) << 8) | crc_lo as u16;

        let header_ok = num == !num_complement;
        let crc_ok = crc16_ccitt(data) == received_crc;

        if !header_ok {
            self.enter(State::Done);
            return Err(NcpError::Protocol);
        }

        if num == self.packet_num {
            // Fresh packet.
            if !crc_ok {
                return self.nak_and_retry();
            }
            self.flush_held_packet()?;
            self.held_packet = data.to_vec();
            self.packet_num = self.packet_num.wrapping_add(1);
            self.retry_count = 0;
            self.write_all(&[ACK])?;
            self.enter(State::RecvPacketHeader);
            Ok(StepResult::Running)
        } else if num == self.packet_num.wrapping_sub(1) {
            // Retransmission of the packet we already ack'd (our ACK was
            // presumably lost): re-ack without re-writing to the sink,
            // subject to the same retry cap as a CRC-mismatch retry.
            self.retry_count += 1;
            if self.retry_count > self.config.xmodem_max_packet_retry_count {
                return self.abort(NcpError::LimitExceeded);
            }
            self.write_all(&[ACK])?;
            self.enter(State::RecvPacketHeader);
            Ok(StepResult::Running)
        } else {
            self.enter(State::Done);
            Err(NcpError::Protocol)
        }
    }

    fn nak_and_retry(&mut self) -> Result<StepResult> {
        self.retry_count += 1;
        if self.retry_count > self.config.xmodem_max_packet_retry_count {
            return self.abort(NcpError::LimitExceeded);
        }
        self.write_all(&[NAK])?;
        self.enter(State::RecvPacketHeader);
        Ok(StepResult::Running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemoryImageSink;
    use crate::transport::DirectModeCallback;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// A direct in-memory duplex byte pipe standing in for the active
    /// transport while XMODEM is driving it in direct mode.
    struct FakeWireTransport {
        to_receiver: Mutex<VecDeque<u8>>,
        from_receiver: Mutex<Vec<u8>>,
    }

    impl FakeWireTransport {
        fn new() -> Self {
            Self {
                to_receiver: Mutex::new(VecDeque::new()),
                from_receiver: Mutex::new(Vec::new()),
            }
        }

        fn push(&self, data: &[u8]) {
            self.to_receiver.lock().unwrap().extend(data.iter().copied());
        }

        fn sent(&self) -> Vec<u8> {
            self.from_receiver.lock().unwrap().clone()
        }
    }

    impl Transport for FakeWireTransport {
        fn init(&self) -> Result<()> {
            Ok(())
        }
        fn destroy(&self) -> Result<()> {
            Ok(())
        }
        fn read_data(&self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
            let mut q = self.to_receiver.lock().unwrap();
            let n = buf.len().min(q.len());
            for slot in buf.iter_mut().take(n) {
                *slot = q.pop_front().unwrap();
            }
            Ok(n)
        }
        fn write_data(&self, data: &[u8]) -> Result<usize> {
            self.from_receiver.lock().unwrap().extend_from_slice(data);
            Ok(data.len())
        }
        fn flush_input(&self) -> Result<()> {
            Ok(())
        }
        fn data_length(&self) -> usize {
            self.to_receiver.lock().unwrap().len()
        }
        fn wait_write_complete(&self, _timeout: Duration) -> Result<()> {
            Ok(())
        }
        fn set_direct_mode(&self, _on: bool, _cb: Option<DirectModeCallback>) {}
        fn is_direct_mode(&self) -> bool {
            true
        }
    }

    fn build_packet(num: u8, data: &[u8], size: usize) -> Vec<u8> {
        let mut packet = Vec::new();
        packet.push(if size == SHORT_PACKET_SIZE { SOH } else { STX });
        packet.push(num);
        packet.push(!num);
        let mut padded = data.to_vec();
        padded.resize(size, 0x1A);
        packet.extend_from_slice(&padded);
        let crc = crc16_ccitt(&padded);
        packet.push((crc >> 8) as u8);
        packet.push((crc & 0xFF) as u8);
        packet
    }

    fn drive_to_completion(receiver: &mut Receiver<'_>) -> Result<()> {
        loop {
            match receiver.run()? {
                StepResult::Done => return Ok(()),
                StepResult::Running => continue,
            }
        }
    }

    #[test]
    fn receives_single_short_packet_preserving_exact_size() {
        let transport = FakeWireTransport::new();
        let config = Config::default();
        let mut sink = MemoryImageSink::default();
        let mut receiver = Receiver::new(&transport, &mut sink, &config, 1).unwrap();

        transport.push(&build_packet(1, b"X", SHORT_PACKET_SIZE));
        transport.push(&[EOT]);

        drive_to_completion(&mut receiver).unwrap();
        assert_eq!(sink.data.len(), 1);
        assert_eq!(sink.data, b"X");
        assert!(sink.finished);
        assert!(transport.sent().contains(&NCG_BYTE));
    }

    #[test]
    fn size_is_preserved_across_1k_packets() {
        let transport = FakeWireTransport::new();
        let config = Config::default();
        let mut sink = MemoryImageSink::default();
        let total = 2048;
        let mut receiver = Receiver::new(&transport, &mut sink, &config, total).unwrap();

        transport.push(&build_packet(1, &[0xABu8; LONG_PACKET_SIZE], LONG_PACKET_SIZE));
        transport.push(&build_packet(2, &[0xCDu8; LONG_PACKET_SIZE], LONG_PACKET_SIZE));
        transport.push(&[EOT]);

        drive_to_completion(&mut receiver).unwrap();
        assert_eq!(sink.data.len(), total);
        assert!(sink.finished);
    }

    #[test]
    fn crc_mismatch_triggers_nak_then_succeeds_on_retransmit() {
        let transport = FakeWireTransport::new();
        let config = Config::default();
        let mut sink = MemoryImageSink::default();
        let mut receiver = Receiver::new(&transport, &mut sink, &config, 1).unwrap();

        let mut bad_packet = build_packet(1, b"X", SHORT_PACKET_SIZE);
        let last = bad_packet.len() - 1;
        bad_packet[last] ^= 0xFF;
        transport.push(&bad_packet);
        transport.push(&build_packet(1, b"X", SHORT_PACKET_SIZE));
        transport.push(&[EOT]);

        drive_to_completion(&mut receiver).unwrap();
        assert_eq!(sink.data, b"X");
        assert!(transport.sent().contains(&NAK));
    }

    #[test]
    fn third_consecutive_nak_returns_limit_exceeded_and_floods_can() {
        let transport = FakeWireTransport::new();
        let config = Config::default();
        let mut sink = MemoryImageSink::default();
        let mut receiver = Receiver::new(&transport, &mut sink, &config, 1).unwrap();

        for _ in 0..3 {
            let mut bad_packet = build_packet(1, b"X", SHORT_PACKET_SIZE);
            let last = bad_packet.len() - 1;
            bad_packet[last] ^= 0xFF;
            transport.push(&bad_packet);
        }

        let err = drive_to_completion(&mut receiver).unwrap_err();
        assert!(matches!(err, NcpError::LimitExceeded));

        let sent = transport.sent();
        let can_count = config.xmodem_send_can_count as usize;
        let can_tail: Vec<u8> = sent.iter().rev().take(can_count).copied().collect();
        assert_eq!(can_tail.len(), can_count);
        assert!(can_tail.iter().all(|&b| b == CAN));
    }

    #[test]
    fn two_cans_cancel_the_transfer() {
        let transport = FakeWireTransport::new();
        let config = Config::default();
        let mut sink = MemoryImageSink::default();
        let mut receiver = Receiver::new(&transport, &mut sink, &config, 1).unwrap();

        transport.push(&[CAN, CAN]);

        let err = drive_to_completion(&mut receiver).unwrap_err();
        assert!(matches!(err, NcpError::Cancelled));
    }
}
