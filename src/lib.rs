#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod config;
pub mod daemon;
pub mod endpoint;
pub mod seen;
pub mod server;
pub mod wire;

pub use config::Config;
pub use endpoint::Endpoint;
pub use seen::SeenSet;
pub use server::{Server, ShutdownHandle};
