//! Logger bring-up.
//!
//! Library code here never installs a logger of its own; every component
//! logs through the `log` crate's macros (`trace!`/`debug!`/`info!`/`warn!`/
//! `error!`) and it is up to the process entry point to call [`init`] once.

use log::LevelFilter;

/// Installs `env_logger` as the global logger, honoring `RUST_LOG` if set
/// and otherwise defaulting to `level`.
pub fn init(level: LevelFilter) {
    let mut builder = env_logger::Builder::from_default_env();
    builder.filter_level(level);
    let _ = builder.try_init();
}
