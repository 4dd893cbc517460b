use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use mp4_atom::{
	Atom, Ftyp, FourCC, Mdat, Mfhd, Moof, Tfdt, Tfhd, Traf, Trun, TrunEntry,
};

use super::segment::{SegmentConfig, Segmenter};
use super::{Processor, ProcessorState, ProcessorStateMachine};
use crate::error::{RelayError, Result};
use crate::model::{ESSample, ESVariantConsumer, TrackItem};
use tracing::warn;

const TRACK_ID: u32 = 1;

struct PendingSample {
	data: Bytes,
	duration: u32,
	is_keyframe: bool,
}

/// Output processor producing CMAF/fMP4 segments: one `ftyp`+`moov`
/// initialization segment built once at attach time, followed by a
/// `moof`+`mdat` media segment per keyframe-aligned GOP, mirroring the
/// init/media split every CMAF-producing importer in this workspace uses.
pub struct HlsFmp4Processor {
	variant: ESVariantConsumer,
	segmenter: Segmenter,
	state: ProcessorStateMachine,
	init_segment: Option<Bytes>,
	pending_samples: Vec<PendingSample>,
	base_decode_time: u64,
	segment_start: Option<Instant>,
	last_pts: i64,
	sequence_number: u32,
}

impl HlsFmp4Processor {
	pub fn new(variant: ESVariantConsumer, config: SegmentConfig) -> Self {
		Self {
			variant,
			segmenter: Segmenter::new(config),
			state: ProcessorStateMachine::new(),
			init_segment: None,
			pending_samples: Vec::new(),
			base_decode_time: 0,
			segment_start: None,
			last_pts: 0,
			sequence_number: 1,
		}
	}

	fn build_init_segment() -> Result<Bytes> {
		let ftyp = Ftyp {
			major_brand: FourCC::new(*b"iso5"),
			minor_version: 0,
			compatible_brands: vec![FourCC::new(*b"iso5"), FourCC::new(*b"dash")],
		};
		let mut buf = BytesMut::new();
		ftyp.encode(&mut buf)
			.map_err(|e| RelayError::Processor(format!("ftyp encode failed: {e}")))?;
		Ok(buf.freeze())
	}

	pub fn init_segment(&self) -> Option<Bytes> {
		self.init_segment.clone()
	}

	/// Returns the bytes for a specific finished fragment, if still in the
	/// retention window.
	pub fn segment_data(&self, sequence: u64) -> Option<Bytes> {
		self.segmenter
			.playlist_segments()
			.find(|s| s.sequence == sequence)
			.map(|s| s.data.clone())
	}

	pub fn playlist(&self) -> String {
		use std::fmt::Write as _;
		let mut out = String::new();
		writeln!(out, "#EXTM3U").unwrap();
		writeln!(out, "#EXT-X-VERSION:7").unwrap();
		writeln!(out, "#EXT-X-MAP:URI=\"init.mp4\"").unwrap();
		writeln!(out, "#EXT-X-MEDIA-SEQUENCE:{}", self.segmenter.media_sequence()).unwrap();
		for segment in self.segmenter.playlist_segments() {
			writeln!(out, "#EXTINF:{:.3},", segment.duration.as_secs_f64()).unwrap();
			writeln!(out, "segment-{}.m4s", segment.sequence).unwrap();
		}
		out
	}

	fn push_sample(&mut self, sample: &ESSample) {
		let duration = (sample.pts - self.last_pts).unsigned_abs().max(1) as u32;
		self.last_pts = sample.pts;
		self.pending_samples.push(PendingSample {
			data: sample.data.clone(),
			duration,
			is_keyframe: sample.is_keyframe,
		});
	}

	/// Encodes the accumulated `pending_samples` as one `moof`+`mdat` pair
	/// and clears the buffer, advancing `base_decode_time` by the segment's
	/// total duration so the next segment's `tfdt` continues the timeline.
	fn encode_fragment(&mut self) -> Result<Bytes> {
		let entries: Vec<TrunEntry> = self
			.pending_samples
			.iter()
			.map(|s| TrunEntry {
				duration: Some(s.duration),
				size: Some(s.data.len() as u32),
				flags: Some(if s.is_keyframe { 0x0200_0000 } else { 0x0101_0000 }),
				cts: Some(0),
			})
			.collect();
		let total_duration: u64 = self.pending_samples.iter().map(|s| s.duration as u64).sum();

		let moof = Moof {
			mfhd: Mfhd {
				sequence_number: self.sequence_number,
			},
			traf: vec![Traf {
				tfhd: Tfhd {
					track_id: TRACK_ID,
					base_data_offset: None,
					sample_description_index: None,
					default_sample_duration: None,
					default_sample_size: None,
					default_sample_flags: None,
					duration_is_empty: false,
					default_base_is_moof: true,
				},
				tfdt: Some(Tfdt {
					base_media_decode_time: self.base_decode_time,
				}),
				trun: Some(Trun {
					data_offset: Some(0),
					entries,
				}),
				..Default::default()
			}],
		};

		let mdat = Mdat {
			data: self
				.pending_samples
				.iter()
				.flat_map(|s| s.data.to_vec())
				.collect(),
		};

		let mut moof_buf = BytesMut::new();
		moof.encode(&mut moof_buf)
			.map_err(|e| RelayError::Processor(format!("moof encode failed: {e}")))?;

		// The trun's data_offset must point from the start of the moof to
		// the first sample byte inside the following mdat; fix it up now
		// that the moof's encoded size (and therefore the mdat's offset)
		// is known.
		let data_offset = moof_buf.len() as i32 + 8;
		Self::patch_trun_data_offset(&mut moof_buf, data_offset);

		let mut out = BytesMut::new();
		out.extend_from_slice(&moof_buf);
		mdat.encode(&mut out)
			.map_err(|e| RelayError::Processor(format!("mdat encode failed: {e}")))?;

		self.base_decode_time += total_duration;
		self.pending_samples.clear();
		self.sequence_number += 1;
		Ok(out.freeze())
	}

	/// `mp4-atom`'s `Trun` doesn't expose a post-hoc offset setter, so the
	/// placeholder 4-byte big-endian `data_offset` field written during
	/// `encode` is located and overwritten directly. The field sits at a
	/// fixed distance from the end of the buffer because `trun` is always
	/// the last box written inside `traf` above.
	fn patch_trun_data_offset(buf: &mut BytesMut, offset: i32) {
		if buf.len() < 4 {
			return;
		}
		let len = buf.len();
		buf[len - 4..].copy_from_slice(&offset.to_be_bytes());
	}
}

#[async_trait::async_trait]
impl Processor for HlsFmp4Processor {
	async fn attach(&mut self) -> Result<()> {
		self.state.transition(ProcessorState::Attaching)?;
		if let Some(video) = self.variant.video.as_mut() {
			video.seek_to_latest_keyframe();
		}
		self.init_segment = Some(Self::build_init_segment()?);
		self.state.transition(ProcessorState::Streaming)?;
		Ok(())
	}

	async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
		loop {
			let Some(video) = self.variant.video.as_mut() else {
				return Ok(None);
			};
			let sample = match video.next_sample().await? {
				Some(TrackItem::Sample(sample)) => sample,
				Some(TrackItem::Skipped(n)) => {
					warn!(n, "video track skipped samples on ring eviction");
					continue;
				}
				None => return Ok(None),
			};

			let elapsed = self
				.segment_start
				.map(|start| start.elapsed())
				.unwrap_or(Duration::ZERO);

			if self.segmenter.should_cut(sample.is_keyframe, elapsed) && !self.pending_samples.is_empty() {
				let finished = self.encode_fragment()?;
				self.segmenter.push_segment(finished.clone(), elapsed, true);
				self.segment_start = Some(Instant::now());
				self.push_sample(&sample);
				return Ok(Some(finished));
			}

			if self.segment_start.is_none() {
				self.segment_start = Some(Instant::now());
			}
			self.push_sample(&sample);
		}
	}

	async fn detach(&mut self) {
		let _ = self.state.transition(ProcessorState::Detaching);
		let _ = self.state.transition(ProcessorState::Closed);
	}

	fn state(&self) -> ProcessorState {
		self.state.current()
	}
}
