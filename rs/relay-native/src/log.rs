use clap::Parser;
use serde::{Deserialize, Serialize};

/// Logging configuration shared by every tvarr binary.
///
/// Flattened into the binary's top-level CLI args, the same way this
/// workspace's other native helper config structs compose into one
/// `Parser`-derived struct rather than each binary hand-rolling its own
/// `tracing_subscriber` setup.
#[derive(Parser, Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Log {
	/// Overrides `RUST_LOG`; defaults to `info` for this crate and `warn`
	/// for dependencies when neither is set.
	#[arg(long, env = "RUST_LOG")]
	pub level: Option<String>,

	/// Emit newline-delimited JSON instead of the human-readable format,
	/// for log shipping into a structured sink.
	#[arg(long, env = "TVARR_LOG_JSON")]
	#[serde(default)]
	pub json: bool,
}

impl Default for Log {
	fn default() -> Self {
		Self {
			level: None,
			json: false,
		}
	}
}

impl Log {
	/// Installs the global `tracing` subscriber. Must be called once, as
	/// early as possible in `main`.
	#[cfg(not(feature = "tokio-console"))]
	pub fn init(&self) {
		let filter = tracing_subscriber::EnvFilter::try_new(
			self.level.clone().unwrap_or_else(|| "info,tower_http=warn".to_string()),
		)
		.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

		let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
		if self.json {
			subscriber.json().init();
		} else {
			subscriber.init();
		}
	}

	/// With the `tokio-console` feature, layer `console-subscriber` in
	/// alongside the usual formatter instead of replacing it.
	#[cfg(feature = "tokio-console")]
	pub fn init(&self) {
		use tracing_subscriber::prelude::*;

		let filter = tracing_subscriber::EnvFilter::try_new(
			self.level.clone().unwrap_or_else(|| "info,tower_http=warn".to_string()),
		)
		.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

		tracing_subscriber::registry()
			.with(console_subscriber::spawn())
			.with(filter)
			.with(tracing_subscriber::fmt::layer())
			.init();
	}
}
