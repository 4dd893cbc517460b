use serde::{Deserialize, Serialize};

/// Video codecs the relay can carry in an elementary-stream track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
	H264,
	H265,
	Av1,
	Vp9,
}

/// Audio codecs the relay can carry in an elementary-stream track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
	Aac,
	Ac3,
	Eac3,
	Mp3,
	Opus,
}

/// A sum type over the two track kinds a variant can hold.
///
/// Kept as a tagged enum rather than a string per the sum-type design note:
/// the relay never needs to compare codecs across the video/audio boundary,
/// so collapsing them into one "codec: String" field would only discard
/// information callers have to re-derive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Codec {
	Video(VideoCodec),
	Audio(AudioCodec),
}

impl Codec {
	pub fn is_video(&self) -> bool {
		matches!(self, Codec::Video(_))
	}

	pub fn is_audio(&self) -> bool {
		matches!(self, Codec::Audio(_))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn codec_kind_predicates() {
		assert!(Codec::Video(VideoCodec::H264).is_video());
		assert!(!Codec::Video(VideoCodec::H264).is_audio());
		assert!(Codec::Audio(AudioCodec::Aac).is_audio());
	}
}
