use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentConfig {
	#[serde(with = "humantime_serde")]
	pub target_duration: Duration,
	pub playlist_window: usize,
}

impl Default for SegmentConfig {
	fn default() -> Self {
		Self {
			target_duration: Duration::from_secs(6),
			playlist_window: 6,
		}
	}
}

/// One finished segment ready to be listed in a playlist/manifest and
/// served to a client.
#[derive(Debug, Clone)]
pub struct Segment {
	pub sequence: u64,
	pub duration: Duration,
	pub data: Bytes,
	pub is_independent: bool,
}

/// Keyframe-aligned segmenter shared by the HLS-TS, HLS-fMP4 and DASH
/// output processors: accumulates samples into the current segment and
/// cuts a new one at the next keyframe once `target_duration` has elapsed,
/// never mid-GOP.
pub struct Segmenter {
	config: SegmentConfig,
	window: VecDeque<Segment>,
	next_sequence: u64,
    segment_started_at: Option<Instant>,
}

impl Segmenter {
	pub fn new(config: SegmentConfig) -> Self {
		Self {
			config,
			window: VecDeque::new(),
			next_sequence: 0,
			segment_started_at: None,
		}
	}

	/// Returns `true` if, given that the current segment has been open for
	/// `elapsed` and `is_keyframe` describes the sample about to be
	/// written, a new segment should be cut before writing it.
	///
	/// Normally a cut only happens at `target_duration` and only on a
	/// keyframe boundary. Past 1.5x `target_duration` a cut is forced
	/// regardless, so a stalled or unusually long GOP can't grow a segment
	/// without bound.
	pub fn should_cut(&mut self, is_keyframe: bool, elapsed_since_start: Duration) -> bool {
		if self.segment_started_at.is_some() && elapsed_since_start >= self.config.target_duration.mul_f64(1.5) {
			return true;
		}
		if !is_keyframe {
			return false;
		}
		self.segment_started_at.is_none() || elapsed_since_start >= self.config.target_duration
	}

	pub fn push_segment(&mut self, data: Bytes, duration: Duration, is_independent: bool) -> Segment {
		let segment = Segment {
			sequence: self.next_sequence,
			duration,
			data,
			is_independent,
		};
		self.next_sequence += 1;
		self.window.push_back(segment.clone());
		while self.window.len() > self.config.playlist_window {
			self.window.pop_front();
		}
		self.segment_started_at = Some(Instant::now());
		segment
	}

	pub fn playlist_segments(&self) -> impl Iterator<Item = &Segment> {
		self.window.iter()
	}

	pub fn media_sequence(&self) -> u64 {
		self.window.front().map(|s| s.sequence).unwrap_or(self.next_sequence)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn cuts_only_on_keyframe_boundaries() {
		let mut segmenter = Segmenter::new(SegmentConfig {
			target_duration: Duration::from_secs(1),
			playlist_window: 3,
		});
		assert!(!segmenter.should_cut(false, Duration::from_secs(2)));
		assert!(segmenter.should_cut(true, Duration::from_secs(0)));
	}

	#[test]
	fn forces_cut_past_1_5x_target_even_without_keyframe() {
		let mut segmenter = Segmenter::new(SegmentConfig {
			target_duration: Duration::from_secs(1),
			playlist_window: 3,
		});
		segmenter.push_segment(Bytes::from_static(b"x"), Duration::from_secs(1), true);
		assert!(!segmenter.should_cut(false, Duration::from_millis(1400)));
		assert!(segmenter.should_cut(false, Duration::from_millis(1500)));
	}

	#[test]
	fn window_evicts_oldest_segment() {
		let mut segmenter = Segmenter::new(SegmentConfig {
			target_duration: Duration::from_secs(1),
			playlist_window: 2,
		});
		for _ in 0..3 {
			segmenter.push_segment(Bytes::from_static(b"x"), Duration::from_secs(1), true);
		}
		let sequences: Vec<_> = segmenter.playlist_segments().map(|s| s.sequence).collect();
		assert_eq!(sequences, vec![1, 2]);
	}
}
