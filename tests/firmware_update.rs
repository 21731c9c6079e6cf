//! End-to-end `+FWUPD` test: drives the XMODEM receiver through the active
//! transport exactly as the AT command layer would, using the public API
//! only.

use std::sync::Arc;

use ncp_firmware::config::Config;
use ncp_firmware::crc::crc16_ccitt;
use ncp_firmware::error::NcpError;
use ncp_firmware::fwupd::{run_firmware_update, RecordingRestartHook};
use ncp_firmware::stream::MemoryImageSink;
use ncp_firmware::transport::uart::{LoopbackUartHal, UartTransport};
use ncp_firmware::transport::{ActiveTransport, Transport};

fn build_packet(num: u8, data: &[u8], size: usize) -> Vec<u8> {
    let mut packet = vec![if size == 128 { 0x01u8 } else { 0x02u8 }, num, !num];
    let mut padded = data.to_vec();
    padded.resize(size, 0x1A);
    packet.extend_from_slice(&padded);
    let crc = crc16_ccitt(&padded);
    packet.push((crc >> 8) as u8);
    packet.push((crc & 0xFF) as u8);
    packet
}

#[test]
fn full_image_transfers_over_uart_and_restarts() {
    let hal = LoopbackUartHal::new();
    let config = Arc::new(Config::default());
    let uart = Arc::new(UartTransport::new(hal.clone(), Arc::clone(&config)));
    uart.init().unwrap();

    let active = ActiveTransport::new();
    active.set(uart.clone() as Arc<dyn Transport>);

    let payload = b"firmware-image-bytes".to_vec();
    hal.push_from_host(&build_packet(1, &payload, 1024));
    hal.push_from_host(&[0x04]); // EOT

    let mut sink = MemoryImageSink::default();
    let hook = RecordingRestartHook::default();

    run_firmware_update(&active, &config, &mut sink, payload.len(), &hook).unwrap();

    assert_eq!(sink.data, payload);
    assert!(sink.finished);
    assert!(hook.fired.load(std::sync::atomic::Ordering::Acquire));

    uart.destroy().unwrap();
}

#[test]
fn oversized_request_is_rejected_before_touching_the_wire() {
    let hal = LoopbackUartHal::new();
    let config = Arc::new(Config::default());
    let uart = Arc::new(UartTransport::new(hal.clone(), Arc::clone(&config)));
    uart.init().unwrap();

    let active = ActiveTransport::new();
    active.set(uart.clone() as Arc<dyn Transport>);

    let mut sink = MemoryImageSink::default();
    let hook = RecordingRestartHook::default();

    let err = run_firmware_update(
        &active,
        &config,
        &mut sink,
        config.fwupd_max_image_size + 1,
        &hook,
    )
    .unwrap_err();

    assert!(matches!(err, NcpError::OutOfRange));
    assert!(!hook.fired.load(std::sync::atomic::Ordering::Acquire));
    uart.destroy().unwrap();
}
