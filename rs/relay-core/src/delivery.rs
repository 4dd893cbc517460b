use crate::classification::Classification;
use crate::model::VariantKey;
use crate::profile::{ContainerHint, DeliveryMode, RelayProfile};

/// Decides how a requested profile's variant should be produced from a
/// classified upstream source, without touching any I/O itself.
///
/// The three delivery modes are tried in the order direct < repackage <
/// transcode, each one only reachable if the previous one can't satisfy the
/// request — direct passthrough is by far the cheapest, so the router never
/// transcodes when a repackage would do.
pub struct DeliveryRouter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
	/// Forward the upstream's bytes unchanged; the client gets exactly the
	/// origin's container and codecs.
	Direct,
	/// Demux once and remux into the profile's container with no codec
	/// change.
	Repackage,
	/// Demux, run the upstream through a transcoder for this profile's
	/// target codecs, then remux.
	Transcode,
}

impl DeliveryRouter {
	/// Whether the profile's target codecs are exactly what the upstream
	/// already provides, independent of container.
	pub fn codecs_match(classification: &Classification, profile: &RelayProfile) -> bool {
		let video_matches = match profile.target_video {
			Some(target) => classification.video == Some(target),
			None => classification.video.is_none(),
		};
		let audio_matches = match profile.target_audio {
			Some(target) => classification.audio == Some(target),
			None => classification.audio.is_none(),
		};
		video_matches && audio_matches
	}

	/// Whether the profile's requested container is exactly the upstream's
	/// own, independent of codecs. Exposed alongside [`Self::codecs_match`]
	/// so callers that only need to label a decision (e.g. the HTTP
	/// surface's `X-Stream-Decision` header, which distinguishes a
	/// byte-identical "passthrough" repackage from one that actually
	/// changes container) don't have to re-derive this match themselves.
	pub fn container_matches(classification: &Classification, profile: &RelayProfile) -> bool {
		matches!(
			(classification.format, profile.container_hint),
			(crate::classification::SourceFormat::MpegTs, ContainerHint::MpegTs)
				| (crate::classification::SourceFormat::HlsTs, ContainerHint::HlsTs)
				| (crate::classification::SourceFormat::HlsFmp4, ContainerHint::HlsFmp4)
				| (crate::classification::SourceFormat::Dash, ContainerHint::Dash)
		)
	}

	pub fn decide(classification: &Classification, profile: &RelayProfile) -> Decision {
		let codecs_match = Self::codecs_match(classification, profile);
		let container_matches = Self::container_matches(classification, profile);

		if profile.delivery_mode == DeliveryMode::Direct && codecs_match && container_matches {
			return Decision::Direct;
		}
		if codecs_match {
			return Decision::Repackage;
		}
		Decision::Transcode
	}

	/// The variant key the decided delivery mode will produce: the source
	/// codecs for `Direct`/`Repackage`, the profile's target codecs for
	/// `Transcode`.
	pub fn variant_key(classification: &Classification, profile: &RelayProfile, decision: Decision) -> VariantKey {
		match decision {
			Decision::Direct | Decision::Repackage => {
				VariantKey::source(classification.video, classification.audio)
			}
			Decision::Transcode => VariantKey::source(profile.target_video, profile.target_audio),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::classification::SourceFormat;
	use crate::model::{AudioCodec, VideoCodec};
	use std::collections::BTreeMap;
	use url::Url;

	fn classification(format: SourceFormat, video: VideoCodec, audio: AudioCodec) -> Classification {
		Classification {
			source_url: Url::parse("http://origin.example/stream").unwrap(),
			format,
			video: Some(video),
			audio: Some(audio),
		}
	}

	fn profile(mode: DeliveryMode, hint: ContainerHint, video: VideoCodec, audio: AudioCodec) -> RelayProfile {
		RelayProfile {
			id: "p".into(),
			target_video: Some(video),
			target_audio: Some(audio),
			container_hint: hint,
			delivery_mode: mode,
			transcoder_args: BTreeMap::new(),
		}
	}

	#[test]
	fn identical_request_is_direct() {
		let c = classification(SourceFormat::MpegTs, VideoCodec::H264, AudioCodec::Aac);
		let p = profile(DeliveryMode::Direct, ContainerHint::MpegTs, VideoCodec::H264, AudioCodec::Aac);
		assert_eq!(DeliveryRouter::decide(&c, &p), Decision::Direct);
	}

	#[test]
	fn same_codecs_different_container_is_repackage() {
		let c = classification(SourceFormat::MpegTs, VideoCodec::H264, AudioCodec::Aac);
		let p = profile(DeliveryMode::Direct, ContainerHint::HlsTs, VideoCodec::H264, AudioCodec::Aac);
		assert_eq!(DeliveryRouter::decide(&c, &p), Decision::Repackage);
	}

	#[test]
	fn different_codec_requires_transcode() {
		let c = classification(SourceFormat::MpegTs, VideoCodec::H264, AudioCodec::Aac);
		let p = profile(DeliveryMode::Direct, ContainerHint::MpegTs, VideoCodec::H265, AudioCodec::Aac);
		assert_eq!(DeliveryRouter::decide(&c, &p), Decision::Transcode);
	}
}
