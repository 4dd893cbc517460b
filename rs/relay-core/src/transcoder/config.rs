use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscoderConfig {
	pub ffmpeg_path: String,
	#[serde(with = "humantime_serde")]
	pub startup_timeout: Duration,
	#[serde(with = "humantime_serde")]
	pub initial_backoff: Duration,
	#[serde(with = "humantime_serde")]
	pub max_backoff: Duration,
	pub max_restarts: u32,
	#[serde(with = "humantime_serde")]
	pub shutdown_grace: Duration,
}

impl Default for TranscoderConfig {
	fn default() -> Self {
		Self {
			ffmpeg_path: "ffmpeg".to_string(),
			startup_timeout: Duration::from_secs(10),
			initial_backoff: Duration::from_millis(500),
			max_backoff: Duration::from_secs(30),
			max_restarts: 5,
			shutdown_grace: Duration::from_secs(3),
		}
	}
}
