use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::output::segment::SegmentConfig;
use crate::pool::ConnectionPoolConfig;
use crate::transcoder::TranscoderConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
	pub video_capacity: usize,
	pub audio_capacity: usize,
	#[serde(with = "humantime_serde")]
	pub variant_idle_timeout: Duration,
	#[serde(with = "humantime_serde")]
	pub sweep_interval: Duration,
}

impl Default for BufferConfig {
	fn default() -> Self {
		Self {
			video_capacity: 180,
			audio_capacity: 360,
			variant_idle_timeout: Duration::from_secs(60),
			sweep_interval: Duration::from_secs(10),
		}
	}
}

/// Aggregates every domain-level tunable `relay-core` needs, independent of
/// how the hosting binary surfaces them (CLI flags, a TOML file, or both —
/// `relay-native`/`relay-server` own that layer and build one of these).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayCoreConfig {
	pub circuit_breaker: CircuitBreakerConfig,
	pub connection_pool: ConnectionPoolConfig,
	pub buffer: BufferConfig,
	pub transcoder: TranscoderConfig,
	pub segment: SegmentConfig,
}

impl Default for RelayCoreConfig {
	fn default() -> Self {
		Self {
			circuit_breaker: CircuitBreakerConfig::default(),
			connection_pool: ConnectionPoolConfig::default(),
			buffer: BufferConfig::default(),
			transcoder: TranscoderConfig::default(),
			segment: SegmentConfig::default(),
		}
	}
}
