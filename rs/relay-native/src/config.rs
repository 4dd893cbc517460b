use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

/// Bind address and optional TLS material for the relay's HTTP surface.
#[derive(Parser, Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
	#[arg(long, env = "TVARR_BIND", default_value = "0.0.0.0:8080")]
	pub bind: SocketAddr,

	#[arg(long, env = "TVARR_TLS_CERT")]
	pub tls_cert: Option<PathBuf>,

	#[arg(long, env = "TVARR_TLS_KEY")]
	pub tls_key: Option<PathBuf>,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self {
			bind: "0.0.0.0:8080".parse().unwrap(),
			tls_cert: None,
			tls_key: None,
		}
	}
}

impl ServerConfig {
	pub fn tls_enabled(&self) -> bool {
		self.tls_cert.is_some() && self.tls_key.is_some()
	}
}
