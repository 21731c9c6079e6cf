//! Handler bodies for the AT commands this crate owns: `+CMUX`, `+FWUPD`,
//! `+CGMR`, `+MVER`, `+GETMAC`, `+GPIOC`/`+GPIOR`/`+GPIOW`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::Config;
use crate::error::{NcpError, Result};
use crate::fwupd::{run_firmware_update, FirmwareUpdateCoordinator, RestartHook};
use crate::network::NetworkSink;
use crate::stream::ImageSink;
use crate::transport::mux_transport::MuxTransport;
use crate::transport::{ActiveTransport, Transport};

/// A textual AT command response, built by handlers and handed back to the
/// (external) AT parser to write to the host.
#[derive(Debug, Clone)]
pub enum AtResponse {
    Ok(Option<String>),
    Error,
}

/// The parsed form of one of this crate's custom commands; the real parser
/// owns tokenizing `AT+...` lines into this shape.
#[derive(Debug, Clone)]
pub enum AtCommand {
    Cmux,
    FwUpdate { size: usize },
    GetVersionString,
    GetModuleVersion,
    GetMac { interface: u8 },
    GpioConfigure { pin: u32, mode: u8, pull: u8, default: bool },
    GpioRead { pin: u32 },
    GpioWrite { pin: u32, level: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpioMode {
    Disabled,
    Input,
    Output,
    OutputOpenDrain,
}

impl GpioMode {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Disabled),
            1 => Some(Self::Input),
            2 => Some(Self::Output),
            3 => Some(Self::OutputOpenDrain),
            _ => None,
        }
    }
}

/// The trivial GPIO backend this crate treats as an external collaborator;
/// a real implementation wraps the platform's GPIO HAL.
pub trait GpioBackend: Send + Sync {
    fn configure(&self, pin: u32, mode: GpioMode, pull: u8, default_level: bool) -> Result<()>;
    fn read(&self, pin: u32) -> Result<bool>;
    fn write(&self, pin: u32, level: bool) -> Result<()>;
}

/// Everything a command handler needs: the active-transport registry, the
/// firmware-update coordinator, the device's static identity strings, and
/// the GPIO backend. Shared (`Arc`) across however many command-dispatch
/// threads the external AT parser uses.
pub struct CommandContext {
    pub config: Arc<Config>,
    pub active_transport: Arc<ActiveTransport>,
    pub firmware_version: String,
    pub module_version: u32,
    pub mac_addresses: [[u8; 6]; 4],
    pub gpio: Arc<dyn GpioBackend>,
    pub fwupd: Arc<FirmwareUpdateCoordinator>,
    pub restart_hook: Arc<dyn RestartHook>,
    pub mux_transport: Mutex<Option<Arc<MuxTransport>>>,
    pub image_sink: Mutex<Box<dyn ImageSink>>,
}

/// Builds a [`MuxTransport`], activates mux mode, and swaps it in as the
/// active transport for the `+CMUX` command.
pub fn handle_cmux(
    ctx: &CommandContext,
    underlying: Arc<dyn Transport>,
    station: Option<Arc<Mutex<dyn NetworkSink>>>,
    soft_ap: Option<Arc<Mutex<dyn NetworkSink>>>,
) -> Result<AtResponse> {
    if ctx.mux_transport.lock().unwrap().is_some() {
        return Err(NcpError::InvalidState);
    }
    underlying.wait_write_complete(Duration::from_secs(2))?;
    let mux = MuxTransport::new(underlying, Arc::clone(&ctx.config), station, soft_ap);
    mux.activate()?;
    ctx.active_transport.set(Arc::clone(&mux) as Arc<dyn Transport>);
    *ctx.mux_transport.lock().unwrap() = Some(mux);
    Ok(AtResponse::Ok(None))
}

/// Runs `+FWUPD=<size>` to completion. Returns `+FWUPD: ONGOING` first via
/// the caller (a real dispatcher would write it before invoking this), then
/// this function blocks until the transfer finishes, cancels, or fails.
pub fn handle_fwupd(ctx: &CommandContext, size: usize) -> Result<AtResponse> {
    ctx.fwupd.try_begin()?;
    let mut sink = ctx.image_sink.lock().unwrap();
    let result = run_firmware_update(
        &ctx.active_transport,
        &ctx.config,
        sink.as_mut(),
        size,
        ctx.restart_hook.as_ref(),
    );
    ctx.fwupd.end();
    match result {
        Ok(()) => Ok(AtResponse::Ok(None)),
        Err(_) => Ok(AtResponse::Error),
    }
}

pub fn handle_cgmr(ctx: &CommandContext) -> AtResponse {
    AtResponse::Ok(Some(ctx.firmware_version.clone()))
}

pub fn handle_mver(ctx: &CommandContext) -> AtResponse {
    AtResponse::Ok(Some(ctx.module_version.to_string()))
}

pub fn handle_getmac(ctx: &CommandContext, interface: u8) -> Result<AtResponse> {
    let mac = ctx
        .mac_addresses
        .get(interface as usize)
        .ok_or(NcpError::InvalidParam)?;
    let text = mac
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":");
    Ok(AtResponse::Ok(Some(text)))
}

pub fn handle_gpioc(
    ctx: &CommandContext,
    pin: u32,
    mode: u8,
    pull: u8,
    default_level: bool,
) -> Result<AtResponse> {
    let mode = GpioMode::from_u8(mode).ok_or(NcpError::InvalidParam)?;
    if pull > 2 {
        return Err(NcpError::InvalidParam);
    }
    ctx.gpio.configure(pin, mode, pull, default_level)?;
    Ok(AtResponse::Ok(None))
}

pub fn handle_gpior(ctx: &CommandContext, pin: u32) -> Result<AtResponse> {
    let level = ctx.gpio.read(pin)?;
    Ok(AtResponse::Ok(Some(if level { "1" } else { "0" }.to_string())))
}

pub fn handle_gpiow(ctx: &CommandContext, pin: u32, level: bool) -> Result<AtResponse> {
    ctx.gpio.write(pin, level)?;
    Ok(AtResponse::Ok(None))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopGpio;
    impl GpioBackend for NoopGpio {
        fn configure(&self, _pin: u32, _mode: GpioMode, _pull: u8, _default_level: bool) -> Result<()> {
            Ok(())
        }
        fn read(&self, _pin: u32) -> Result<bool> {
            Ok(true)
        }
        fn write(&self, _pin: u32, _level: bool) -> Result<()> {
            Ok(())
        }
    }

    fn context() -> CommandContext {
        CommandContext {
            config: Arc::new(Config::default()),
            active_transport: Arc::new(ActiveTransport::new()),
            firmware_version: "1.2.3".to_string(),
            module_version: 42,
            mac_addresses: [[0, 1, 2, 3, 4, 5]; 4],
            gpio: Arc::new(NoopGpio),
            fwupd: Arc::new(FirmwareUpdateCoordinator::default()),
            restart_hook: Arc::new(crate::fwupd::RecordingRestartHook::default()),
            mux_transport: Mutex::new(None),
            image_sink: Mutex::new(Box::new(crate::stream::MemoryImageSink::default())),
        }
    }

    #[test]
    fn cgmr_reports_configured_version() {
        let ctx = context();
        match handle_cgmr(&ctx) {
            AtResponse::Ok(Some(text)) => assert_eq!(text, "1.2.3"),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn getmac_formats_as_colon_hex() {
        let ctx = context();
        match handle_getmac(&ctx, 0).unwrap() {
            AtResponse::Ok(Some(text)) => assert_eq!(text, "00:01:02:03:04:05"),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn getmac_rejects_unknown_interface() {
        let ctx = context();
        assert!(matches!(
            handle_getmac(&ctx, 9),
            Err(NcpError::InvalidParam)
        ));
    }

    #[test]
    fn gpioc_rejects_invalid_mode() {
        let ctx = context();
        assert!(matches!(
            handle_gpioc(&ctx, 4, 9, 0, false),
            Err(NcpError::InvalidParam)
        ));
    }
}
