//! Runtime tunables, centralized instead of scattered as magic numbers.

use std::time::Duration;

/// Every numeric knob named throughout the transport, mux, and XMODEM
/// components. Constructed once at process bring-up and shared read-only
/// (`Arc<Config>`) by whichever components need it.
#[derive(Debug, Clone)]
pub struct Config {
    /// UART line rate.
    pub uart_baud_rate: u32,
    /// RTS is deasserted once the UART RX buffer has fewer than this many
    /// free bytes.
    pub uart_rts_threshold: usize,

    /// SDIO block size; the largest contiguous span submitted per `send_queue` call.
    pub sdio_block_size: usize,

    /// Default negotiated max mux frame size (N1), before any PN renegotiation.
    pub mux_n1_default: usize,
    /// Upper bound a PN proposal may negotiate N1 to.
    pub mux_n1_ceiling: usize,
    /// Interval between keepalive Test commands on DLCI 0.
    pub mux_keepalive_interval: Duration,
    /// Consecutive missed keepalive responses before the session is torn down.
    pub mux_keepalive_miss_limit: u32,
    /// Per-call timeout for `writeChannel` when blocked on flow control.
    pub mux_write_timeout: Duration,

    /// XMODEM: interval between NCG ('C') retransmissions.
    pub xmodem_ncg_interval: Duration,
    /// XMODEM: number of NCG bytes sent before giving up.
    pub xmodem_ncg_retry_count: u32,
    /// XMODEM: max time between packet-level progress.
    pub xmodem_packet_timeout: Duration,
    /// XMODEM: timeout for a single send/receive step.
    pub xmodem_step_timeout: Duration,
    /// XMODEM: retransmissions tolerated for one packet before giving up.
    pub xmodem_max_packet_retry_count: u32,
    /// XMODEM: consecutive CANs from the sender that cancel the transfer.
    pub xmodem_recv_can_count: u32,
    /// XMODEM: CAN bytes sent by the receiver when aborting.
    pub xmodem_send_can_count: u32,

    /// Ceiling on the size a `+FWUPD` command will accept.
    pub fwupd_max_image_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            uart_baud_rate: 921_600,
            uart_rts_threshold: 122,

            sdio_block_size: 512,

            mux_n1_default: 1509,
            mux_n1_ceiling: 4096,
            mux_keepalive_interval: Duration::from_secs(5),
            mux_keepalive_miss_limit: 3,
            mux_write_timeout: Duration::from_secs(10),

            xmodem_ncg_interval: Duration::from_secs(3),
            xmodem_ncg_retry_count: 10,
            xmodem_packet_timeout: Duration::from_secs(10),
            xmodem_step_timeout: Duration::from_secs(3),
            xmodem_max_packet_retry_count: 2,
            xmodem_recv_can_count: 2,
            xmodem_send_can_count: 8,

            fwupd_max_image_size: 4 * 1024 * 1024,
        }
    }
}
