use std::path::PathBuf;

use clap::Parser;
use relay_core::config::RelayCoreConfig;
use relay_native::{Log, ServerConfig};
use serde::{Deserialize, Serialize};

use crate::channels::ChannelDirectory;

/// Top-level configuration for the relay binary: flattens the ambient
/// server/log structs from `relay-native` together with every domain
/// tunable `relay-core` exposes, the same aggregation `moq-relay::Config`
/// does over its own `HttpConfig`/`ClusterConfig`/etc.
#[derive(Parser, Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
#[command(name = "relay-server", about = "HTTP relay for live IPTV channels")]
pub struct RelayConfig {
	#[command(flatten)]
	pub server: ServerConfig,

	#[command(flatten)]
	pub log: Log,

	/// Every domain tunable `relay-core` exposes. Not individually exposed
	/// as CLI flags — `relay-core` stays clap-free — so this is only ever
	/// set via `--file`'s TOML document; CLI/env cover `server`/`log`/`file`.
	#[arg(skip)]
	#[serde(flatten)]
	pub core: RelayCoreConfig,

	/// Channels this relay serves, keyed by the id used in
	/// `/relay/stream/{channel_id}`. Only ever set via `--file`'s TOML
	/// document, same as `core`.
	#[arg(skip)]
	#[serde(default)]
	pub channels: ChannelDirectory,

	/// Loads defaults from a TOML file before applying CLI/env overrides on
	/// top, mirroring `moq-relay::Config::load`'s file-then-flags merge.
	#[arg(long, env = "TVARR_CONFIG")]
	pub file: Option<PathBuf>,
}

impl Default for RelayConfig {
	fn default() -> Self {
		Self {
			server: ServerConfig::default(),
			log: Log::default(),
			core: RelayCoreConfig::default(),
			channels: ChannelDirectory::default(),
			file: None,
		}
	}
}

impl RelayConfig {
	/// Parses CLI/env arguments, then if `--file` points at a TOML document,
	/// reloads starting from that file's contents and re-applies the same
	/// CLI/env arguments on top so flags always win over the file.
	pub fn load() -> anyhow::Result<Self> {
		let cli = Self::parse();
		let Some(path) = cli.file.clone() else {
			return Ok(cli);
		};

		let contents = std::fs::read_to_string(&path)
			.map_err(|e| anyhow::anyhow!("reading config file {}: {e}", path.display()))?;
		let mut merged: Self = toml::from_str(&contents)
			.map_err(|e| anyhow::anyhow!("parsing config file {}: {e}", path.display()))?;
		merged.update_from(std::env::args_os());
		Ok(merged)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_round_trip_through_toml() {
		let config = RelayConfig::default();
		let toml = toml::to_string(&config).unwrap();
		let parsed: RelayConfig = toml::from_str(&toml).unwrap();
		assert_eq!(parsed.server.bind, config.server.bind);
	}
}
