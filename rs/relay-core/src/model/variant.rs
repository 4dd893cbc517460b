use std::fmt;

use super::codec::{AudioCodec, VideoCodec};
use super::track::{ESTrackConsumer, ESTrackProducer};

/// Identifies one transcode/passthrough rendition of a channel inside a
/// [`super::buffer::SharedBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VariantKey {
	pub video: Option<VideoCodec>,
	pub audio: Option<AudioCodec>,
}

impl VariantKey {
	/// The variant holding the original, un-transcoded upstream codecs.
	pub fn source(video: Option<VideoCodec>, audio: Option<AudioCodec>) -> Self {
		Self { video, audio }
	}
}

impl fmt::Display for VariantKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match (self.video, self.audio) {
			(Some(v), Some(a)) => write!(f, "{v:?}+{a:?}"),
			(Some(v), None) => write!(f, "{v:?}"),
			(None, Some(a)) => write!(f, "{a:?}"),
			(None, None) => write!(f, "empty"),
		}
	}
}

/// Up to two elementary-stream tracks (video, audio) that together make up
/// one deliverable rendition of a channel.
pub struct ESVariantProducer {
	pub key: VariantKey,
	pub video: Option<ESTrackProducer>,
	pub audio: Option<ESTrackProducer>,
}

#[derive(Clone)]
pub struct ESVariantConsumer {
	pub key: VariantKey,
	pub video: Option<ESTrackConsumer>,
	pub audio: Option<ESTrackConsumer>,
}
