use serde::{Deserialize, Serialize};
use url::Url;

use crate::model::{AudioCodec, VideoCodec};

/// The container format an upstream origin was detected to be serving,
/// determined by probing (content-type, magic bytes, or playlist parse)
/// rather than trusted from the configured URL's extension alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
	MpegTs,
	HlsTs,
	HlsFmp4,
	Dash,
}

/// The outcome of probing an upstream source: its container format and the
/// codecs found inside it, used by the smart-delivery router to decide
/// whether a requested variant can be served by passthrough or repackage
/// alone, or requires transcoding.
#[derive(Debug, Clone)]
pub struct Classification {
	pub source_url: Url,
	pub format: SourceFormat,
	pub video: Option<VideoCodec>,
	pub audio: Option<AudioCodec>,
}

impl Classification {
	pub fn host(&self) -> String {
        self.source_url.host_str().unwrap_or_default().to_string()
	}
}
