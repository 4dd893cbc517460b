//! Static channel directory: maps a channel id to its upstream origin and
//! the relay profiles it can be requested with.
//!
//! Aggregating channel lists/EPG from provider playlists is out of this
//! binary's scope (see DESIGN.md); this is the minimal directory the relay
//! surface needs to resolve `{channel_id}` from the HTTP route to an origin
//! URL, loaded the same way `RelayConfig` loads everything else — CLI/env
//! for the ambient server settings, TOML for the domain data.

use std::collections::HashMap;

use relay_core::profile::RelayProfile;
use serde::{Deserialize, Serialize};
use url::Url;

/// One channel's upstream origin and the relay profiles it accepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelEntry {
	pub origin: Url,
	pub profiles: Vec<RelayProfile>,
	pub default_profile: String,
}

impl ChannelEntry {
	pub fn profile(&self, id: Option<&str>) -> Option<&RelayProfile> {
		let id = id.unwrap_or(&self.default_profile);
		self.profiles.iter().find(|p| p.id == id)
	}
}

pub type ChannelDirectory = HashMap<String, ChannelEntry>;
