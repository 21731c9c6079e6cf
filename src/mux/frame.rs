//! GSM 07.10 basic-mode frame encoding/decoding.

use crate::crc::{fcs_finish, fcs_is_valid, fcs_update};
use crate::error::{NcpError, Result};

pub const FLAG: u8 = 0xF9;

/// Basic-mode control-field frame types (EA/C bits stripped).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Sabm,
    Ua,
    Dm,
    Disc,
    Uih,
    Ui,
}

impl FrameType {
    /// Whether the FCS for this frame type covers the payload in addition
    /// to the header (all frame types except UIH/UI).
    pub fn fcs_covers_payload(self) -> bool {
        !matches!(self, FrameType::Uih | FrameType::Ui)
    }

    fn to_control_byte(self, poll_final: bool) -> u8 {
        let base = match self {
            FrameType::Sabm => 0x2F,
            FrameType::Ua => 0x63,
            FrameType::Dm => 0x0F,
            FrameType::Disc => 0x43,
            FrameType::Uih => 0xEF,
            FrameType::Ui => 0x03,
        };
        if poll_final {
            base | 0x10
        } else {
            base
        }
    }

    fn from_control_byte(byte: u8) -> Option<(Self, bool)> {
        let poll_final = byte & 0x10 != 0;
        let base = byte & !0x10;
        let frame_type = match base {
            0x2F => FrameType::Sabm,
            0x63 => FrameType::Ua,
            0x0F => FrameType::Dm,
            0x43 => FrameType::Disc,
            0xEF => FrameType::Uih,
            0x03 => FrameType::Ui,
            _ => return None,
        };
        Some((frame_type, poll_final))
    }
}

/// A decoded (or to-be-encoded) GSM 07.10 basic-mode frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub dlci: u8,
    pub command: bool,
    pub frame_type: FrameType,
    pub poll_final: bool,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(dlci: u8, command: bool, frame_type: FrameType, payload: Vec<u8>) -> Self {
        Self {
            dlci,
            command,
            frame_type,
            poll_final: false,
            payload,
        }
    }

    /// Serializes this frame into wire bytes, flags included.
    pub fn encode(&self) -> Vec<u8> {
        let address = (self.dlci << 2) | 0x01 | if self.command { 0x02 } else { 0x00 };
        let control = self.frame_type.to_control_byte(self.poll_final);
        let len = self.payload.len();

        let mut out = Vec::with_capacity(len + 8);
        out.push(FLAG);
        out.push(address);
        out.push(control);
        if len <= 0x7F {
            out.push(((len as u8) << 1) | 0x01);
        } else {
            out.push((((len & 0x7F) as u8) << 1) & 0xFE);
            out.push((len >> 7) as u8);
        }

        let mut crc = fcs_update(0xFF, &[address, control]);
        let length_bytes_start = out.len() - if len <= 0x7F { 1 } else { 2 };
        crc = fcs_update(crc, &out[length_bytes_start..]);
        if self.frame_type.fcs_covers_payload() {
            crc = fcs_update(crc, &self.payload);
        }

        out.extend_from_slice(&self.payload);
        out.push(fcs_finish(crc));
        out.push(FLAG);
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    FlagSearch,
    Address,
    Control,
    Len1,
    Len2,
    Payload,
    Fcs,
    EndFlag,
}

/// A streaming byte-at-a-time decoder for the basic-mode framing.
pub struct Decoder {
    state: DecodeState,
    address: u8,
    control: u8,
    frame_type: FrameType,
    poll_final: bool,
    len: usize,
    payload: Vec<u8>,
    crc: u8,
    max_payload: usize,
}

pub enum DecodeEvent {
    /// No complete frame yet.
    Pending,
    /// A complete, FCS-valid frame.
    Frame(Frame),
    /// A frame was dropped (bad FCS, unknown control byte, or oversized payload).
    Dropped,
}

impl Decoder {
    pub fn new(max_payload: usize) -> Self {
        Self {
            state: DecodeState::FlagSearch,
            address: 0,
            control: 0,
            frame_type: FrameType::Ui,
            poll_final: false,
            len: 0,
            payload: Vec::new(),
            crc: 0xFF,
            max_payload,
        }
    }

    pub fn set_max_payload(&mut self, max_payload: usize) {
        self.max_payload = max_payload;
    }

    /// Feeds one byte into the decoder, returning an event if a frame
    /// boundary (complete or dropped) was reached.
    pub fn feed(&mut self, byte: u8) -> DecodeEvent {
        match self.state {
            DecodeState::FlagSearch => {
                if byte == FLAG {
                    self.state = DecodeState::Address;
                    self.crc = 0xFF;
                }
                DecodeEvent::Pending
            }
            DecodeState::Address => {
                if byte == FLAG {
                    // Consecutive flags: stay here, treat as idle fill.
                    return DecodeEvent::Pending;
                }
                self.address = byte;
                self.crc = fcs_update(self.crc, &[byte]);
                self.state = DecodeState::Control;
                DecodeEvent::Pending
            }
            DecodeState::Control => {
                match FrameType::from_control_byte(byte) {
                    Some((ft, pf)) => {
                        self.control = byte;
                        self.frame_type = ft;
                        self.poll_final = pf;
                        self.crc = fcs_update(self.crc, &[byte]);
                        self.state = DecodeState::Len1;
                        DecodeEvent::Pending
                    }
                    None => {
                        self.state = DecodeState::FlagSearch;
                        DecodeEvent::Dropped
                    }
                }
            }
            DecodeState::Len1 => {
                self.crc = fcs_update(self.crc, &[byte]);
                if byte & 0x01 != 0 {
                    self.len = (byte >> 1) as usize;
                    self.payload.clear();
                    self.state = if self.len == 0 {
                        DecodeState::Fcs
                    } else {
                        DecodeState::Payload
                    };
                    if self.len > self.max_payload {
                        self.state = DecodeState::FlagSearch;
                        return DecodeEvent::Dropped;
                    }
                } else {
                    self.len = (byte >> 1) as usize;
                    self.state = DecodeState::Len2;
                }
                DecodeEvent::Pending
            }
            DecodeState::Len2 => {
                self.crc = fcs_update(self.crc, &[byte]);
                self.len |= (byte as usize) << 7;
                self.payload.clear();
                if self.len > self.max_payload {
                    self.state = DecodeState::FlagSearch;
                    return DecodeEvent::Dropped;
                }
                self.state = if self.len == 0 {
                    DecodeState::Fcs
                } else {
                    DecodeState::Payload
                };
                DecodeEvent::Pending
            }
            DecodeState::Payload => {
                self.payload.push(byte);
                if self.frame_type.fcs_covers_payload() {
                    self.crc = fcs_update(self.crc, &[byte]);
                }
                if self.payload.len() == self.len {
                    self.state = DecodeState::Fcs;
                }
                DecodeEvent::Pending
            }
            DecodeState::Fcs => {
                self.state = DecodeState::EndFlag;
                if !fcs_is_valid(self.crc, byte) {
                    self.state = DecodeState::FlagSearch;
                    return DecodeEvent::Dropped;
                }
                DecodeEvent::Pending
            }
            DecodeState::EndFlag => {
                self.state = DecodeState::FlagSearch;
                if byte != FLAG {
                    return DecodeEvent::Dropped;
                }
                let frame = Frame {
                    dlci: self.address >> 2,
                    command: self.address & 0x02 != 0,
                    frame_type: self.frame_type,
                    poll_final: self.poll_final,
                    payload: std::mem::take(&mut self.payload),
                };
                DecodeEvent::Frame(frame)
            }
        }
    }
}

/// Decodes a single frame out of a fully-buffered byte slice; used by tests
/// and by callers that already have a whole frame in hand.
pub fn decode_one(max_payload: usize, bytes: &[u8]) -> Result<Frame> {
    let mut decoder = Decoder::new(max_payload);
    for &b in bytes {
        match decoder.feed(b) {
            DecodeEvent::Frame(frame) => return Ok(frame),
            DecodeEvent::Dropped => return Err(NcpError::Protocol),
            DecodeEvent::Pending => continue,
        }
    }
    Err(NcpError::EndOfStream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip_uih() {
        let frame = Frame::new(1, true, FrameType::Uih, b"AT\r\n".to_vec());
        let wire = frame.encode();
        let decoded = decode_one(4096, &wire).unwrap();
        assert_eq!(decoded.dlci, 1);
        assert_eq!(decoded.frame_type, FrameType::Uih);
        assert_eq!(decoded.payload, b"AT\r\n");
    }

    #[test]
    fn encode_decode_round_trip_sabm_empty_payload() {
        let frame = Frame::new(2, true, FrameType::Sabm, Vec::new());
        let wire = frame.encode();
        let decoded = decode_one(4096, &wire).unwrap();
        assert_eq!(decoded.frame_type, FrameType::Sabm);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn corrupted_fcs_is_dropped() {
        let frame = Frame::new(1, true, FrameType::Uih, b"x".to_vec());
        let mut wire = frame.encode();
        let fcs_index = wire.len() - 2;
        wire[fcs_index] ^= 0xFF;
        assert!(matches!(decode_one(4096, &wire), Err(NcpError::Protocol)));
    }

    #[test]
    fn oversized_payload_is_dropped() {
        let frame = Frame::new(1, true, FrameType::Uih, vec![0u8; 16]);
        let wire = frame.encode();
        assert!(matches!(decode_one(8, &wire), Err(NcpError::Protocol)));
    }

    #[test]
    fn extended_length_round_trips() {
        let payload = vec![0xAAu8; 300];
        let frame = Frame::new(3, true, FrameType::Uih, payload.clone());
        let wire = frame.encode();
        let decoded = decode_one(4096, &wire).unwrap();
        assert_eq!(decoded.payload, payload);
    }
}
