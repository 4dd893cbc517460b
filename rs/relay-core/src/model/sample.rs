use bytes::Bytes;
use std::time::Instant;

/// One decoded-container-independent access unit: an Annex B NAL access unit,
/// a raw OBU, or a raw audio frame, already stripped of its source container.
#[derive(Debug, Clone)]
pub struct ESSample {
	/// Presentation timestamp, in the track's original timebase (90kHz for
	/// video tracks derived from MPEG-TS, the sample rate for raw audio).
	pub pts: i64,
	/// Decode timestamp. Equal to `pts` for streams without B-frames.
	pub dts: i64,
	pub data: Bytes,
	pub is_keyframe: bool,
	/// Monotonically increasing per-track counter, assigned at ingest.
	pub sequence: u64,
	/// Wall-clock arrival time, used only for idle/staleness bookkeeping —
	/// never for presentation timing.
	pub received_at: Instant,
}

impl ESSample {
	pub fn new(pts: i64, dts: i64, data: Bytes, is_keyframe: bool, sequence: u64) -> Self {
		Self {
			pts,
			dts,
			data,
			is_keyframe,
			sequence,
			received_at: Instant::now(),
		}
	}
}
