//! Error types.

mod lan_error;

pub use lan_error::LanError;
