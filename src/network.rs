//! The boundary between the mux transport and the Wi-Fi/IP stack.
//!
//! The IP stack is an external collaborator, referenced only through this
//! trait: it produces Ethernet frames to transmit (station or soft-AP) and
//! accepts frames received on the corresponding mux channel. Grounded on the
//! kernel's `NetworkInterface` driver trait, narrowed from a full device
//! abstraction (TX/RX buffer ownership, interrupts, polling mode) down to
//! the one thing a mux channel actually needs: handing typed Ethernet
//! frames across the channel boundary.

use smoltcp::wire::{EthernetFrame, EthernetProtocol};

use crate::error::{NcpError, Result};

/// Which Wi-Fi interface a mux data channel (2 or 3) carries frames for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkInterfaceKind {
    Station,
    SoftAp,
}

/// Accepts Ethernet frames arriving from the host over a mux data channel,
/// destined for the Wi-Fi stack.
pub trait NetworkSink: Send {
    fn interface(&self) -> NetworkInterfaceKind;

    /// Delivers one Ethernet frame received from the mux channel to the
    /// network stack. `payload` is validated as a well-formed Ethernet
    /// frame by the caller before this is invoked. Called from a dedicated
    /// network-rx worker thread, off the mux session's input-pump thread, so
    /// a blocking implementation does not stall frame decoding.
    fn inject(&mut self, frame: EthernetFrame<&[u8]>) -> Result<()>;
}

/// Validates that `payload` is a well-formed Ethernet frame with a
/// recognized ethertype, returning the parsed view. Mux payloads that fail
/// this check are dropped with a logged warning rather than forwarded.
pub fn parse_ethernet_frame(payload: &[u8]) -> Result<EthernetFrame<&[u8]>> {
    let frame = EthernetFrame::new_checked(payload).map_err(|_| NcpError::InvalidFormat)?;
    match frame.ethertype() {
        EthernetProtocol::Ipv4 | EthernetProtocol::Ipv6 | EthernetProtocol::Arp => Ok(frame),
        EthernetProtocol::Unknown(_) => Err(NcpError::InvalidFormat),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_truncated_frame() {
        assert!(matches!(
            parse_ethernet_frame(&[0u8; 4]),
            Err(NcpError::InvalidFormat)
        ));
    }
}
