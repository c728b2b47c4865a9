// Utils module - node-level helpers shared by the services
pub mod exec;
pub mod networking;
pub mod prompt;
pub mod string;

pub use string::{bytes_to_string, format_address};
