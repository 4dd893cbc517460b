//! Helper library for the tvarr relay binary: the bind/TLS config struct,
//! logging initialization, and certificate loading shared by anything that
//! hosts `relay-core` behind an HTTP surface.

mod config;
mod log;
mod tls;

pub use config::ServerConfig;
pub use log::Log;
pub use tls::{load_server_config, self_signed};
