pub mod commands;
pub mod config_manager;
pub mod error;
pub mod services;
pub mod utils;

#[cfg(test)]
mod testing;

pub use error::{BootstrapError, ToolFailure};
