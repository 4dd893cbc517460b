use std::fmt::Write as _;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

use super::mpegts::TsMuxer;
use super::segment::{SegmentConfig, Segmenter};
use super::{Processor, ProcessorState, ProcessorStateMachine};
use crate::error::Result;
use crate::model::{ESVariantConsumer, TrackItem};
use tracing::warn;

/// Output processor producing HLS media-playlist-plus-TS-segments for a
/// variant: each segment is a keyframe-aligned run of `TsMuxer` output, and
/// `playlist()` renders the sliding `#EXT-X-MEDIA-SEQUENCE` window over the
/// segments still retained.
pub struct HlsTsProcessor {
	variant: ESVariantConsumer,
	muxer: TsMuxer,
	segmenter: Segmenter,
	state: ProcessorStateMachine,
	current_segment: BytesMut,
	segment_start: Option<Instant>,
}

impl HlsTsProcessor {
	pub fn new(variant: ESVariantConsumer, config: SegmentConfig) -> Self {
		let video_codec = variant.video.as_ref().map(|t| t.codec());
		let audio_codec = variant.audio.as_ref().map(|t| t.codec());
		Self {
			variant,
			muxer: TsMuxer::new(video_codec, audio_codec),
			segmenter: Segmenter::new(config),
			state: ProcessorStateMachine::new(),
			current_segment: BytesMut::new(),
			segment_start: None,
		}
	}

	/// Renders the current sliding-window media playlist.
	pub fn playlist(&self) -> String {
		let mut out = String::new();
		writeln!(out, "#EXTM3U").unwrap();
		writeln!(out, "#EXT-X-VERSION:3").unwrap();
		writeln!(
			out,
			"#EXT-X-TARGETDURATION:{}",
			self.segmenter_target_duration_secs()
		)
		.unwrap();
		writeln!(out, "#EXT-X-MEDIA-SEQUENCE:{}", self.segmenter.media_sequence()).unwrap();
		for segment in self.segmenter.playlist_segments() {
			writeln!(out, "#EXTINF:{:.3},", segment.duration.as_secs_f64()).unwrap();
			writeln!(out, "segment-{}.ts", segment.sequence).unwrap();
		}
		out
	}

	fn segmenter_target_duration_secs(&self) -> u64 {
		self.segmenter
			.playlist_segments()
			.map(|s| s.duration.as_secs().max(1))
			.max()
			.unwrap_or(6)
	}

	/// Returns the bytes for a specific finished segment, if still in the
	/// retention window.
	pub fn segment_data(&self, sequence: u64) -> Option<Bytes> {
		self.segmenter
			.playlist_segments()
			.find(|s| s.sequence == sequence)
			.map(|s| s.data.clone())
	}
}

#[async_trait::async_trait]
impl Processor for HlsTsProcessor {
	async fn attach(&mut self) -> Result<()> {
		self.state.transition(ProcessorState::Attaching)?;
		if let Some(video) = self.variant.video.as_mut() {
			video.seek_to_latest_keyframe();
		}
		self.state.transition(ProcessorState::Streaming)?;
		Ok(())
	}

	/// Drives the segmenter until one full segment is cut, returning that
	/// segment's playlist text followed by its bytes so callers driving an
	/// HTTP response body only need to poll `next_chunk` in a loop.
	async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
		loop {
			let video_pid = self.muxer.video_pid();
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
			if self.segmenter.should_cut(sample.is_keyframe, elapsed) && !self.current_segment.is_empty() {
				let finished = self.current_segment.split().freeze();
				let duration = elapsed;
				self.segmenter.push_segment(finished.clone(), duration, true);
				self.segment_start = Some(Instant::now());
				let packets = self.muxer.mux_sample(
					video_pid,
					sample.pts,
					sample.dts,
					&sample.data,
					sample.is_keyframe,
				);
				self.current_segment.extend_from_slice(&packets);
				return Ok(Some(finished));
			}

			if self.segment_start.is_none() {
				self.segment_start = Some(Instant::now());
			}
			let packets =
				self.muxer
					.mux_sample(video_pid, sample.pts, sample.dts, &sample.data, sample.is_keyframe);
			self.current_segment.extend_from_slice(&packets);
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

#[cfg(test)]
mod tests {
	use super::*;
	use crate::model::{Codec, ESSample, ESTrackProducer, VideoCodec};
	use bytes::Bytes as BytesT;

	#[tokio::test]
	async fn playlist_lists_cut_segments() {
		let (mut producer, consumer) = ESTrackProducer::new(Codec::Video(VideoCodec::H264), 64);
		let variant = ESVariantConsumer {
			key: crate::model::VariantKey::source(Some(VideoCodec::H264), None),
			video: Some(consumer),
			audio: None,
		};
		let mut processor = HlsTsProcessor::new(
			variant,
			SegmentConfig {
				target_duration: Duration::from_millis(1),
				playlist_window: 4,
			},
		);
		processor.attach().await.unwrap();

		producer.write_sample(ESSample::new(0, 0, BytesT::from_static(b"x"), true, 0));
		producer.write_sample(ESSample::new(1, 1, BytesT::from_static(b"y"), false, 1));
		tokio::time::sleep(Duration::from_millis(5)).await;
		producer.write_sample(ESSample::new(2, 2, BytesT::from_static(b"z"), true, 2));

		let _ = processor.next_chunk().await.unwrap();
		let _ = processor.next_chunk().await.unwrap();
		let _ = processor.next_chunk().await.unwrap();

		let playlist = processor.playlist();
		assert!(playlist.contains("#EXTM3U"));
	}
}
