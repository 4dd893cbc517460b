use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::{AudioCodec, VideoCodec};

/// Output container a relay profile asks to be repackaged or transcoded
/// into, independent of the upstream's own container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerHint {
	MpegTs,
	HlsTs,
	HlsFmp4,
	Dash,
}

/// How a variant's samples should reach the output processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
	/// Forward the upstream's own container bytes unmodified.
	Direct,
	/// Demux once, remux into the requested container with no transcode.
	Repackage,
	/// Demux, transcode to the profile's target codecs, then remux.
	Transcode,
}

/// A named relay configuration a client requests by id: target codecs,
/// output container, delivery mode, and an opaque argument template handed
/// to the transcoder's command-line builder.
///
/// The core treats everything beyond `target`/`container_hint`/
/// `delivery_mode` as opaque, forwarding `transcoder_args` verbatim to
/// `transcoder::args` — this is deliberately the one place the core reads
/// profile internals it doesn't otherwise need, since the deterministic
/// FFmpeg argument list can't be built without them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayProfile {
	pub id: String,
	pub target_video: Option<VideoCodec>,
	pub target_audio: Option<AudioCodec>,
	pub container_hint: ContainerHint,
	pub delivery_mode: DeliveryMode,
	#[serde(default)]
	pub transcoder_args: BTreeMap<String, String>,
}
