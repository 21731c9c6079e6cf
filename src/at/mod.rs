//! AT-command glue: registers the commands this crate owns and calls into
//! the transport/mux/fwupd layers. The AT parser/dispatcher itself is an
//! external collaborator — this module only implements the handler bodies
//! that a real dispatcher would invoke by name.

pub mod commands;

pub use commands::{AtCommand, AtResponse, CommandContext};
