//! Library half of the kiln binary: runtime wiring and the HTTP trigger API.

pub mod server;
pub mod settings;
