use std::collections::VecDeque;

use tokio::sync::watch;

use super::codec::Codec;
use super::sample::ESSample;
use crate::error::{RelayError, Result};

/// Ring-buffer contents shared between one producer and any number of
/// consumers, broadcast the way `moq-lite`'s `TrackState` is: consumers hold
/// a `watch::Receiver` and re-read the whole state on every wakeup rather
/// than being pushed individual samples.
#[derive(Clone)]
struct TrackState {
	samples: VecDeque<ESSample>,
	closed: Option<Result<()>>,
}

impl TrackState {
	fn new() -> Self {
		Self {
			samples: VecDeque::new(),
			closed: None,
		}
	}
}

/// A single elementary-stream track (one codec, one direction) inside a
/// variant: the ring buffer plus its capacity and keyframe-retention policy.
///
/// Writers call [`ESTrackProducer::write_sample`]; readers clone an
/// [`ESTrackConsumer`] per attached processor, exactly as `TrackProducer`/
/// `TrackConsumer` split ownership in the teacher's model module.
pub struct ESTrackProducer {
	codec: Codec,
	capacity: usize,
	state: watch::Sender<TrackState>,
	next_sequence: u64,
}

impl ESTrackProducer {
	pub fn new(codec: Codec, capacity: usize) -> (Self, ESTrackConsumer) {
		let (tx, rx) = watch::channel(TrackState::new());
		let producer = Self {
			codec,
			capacity,
			state: tx,
			next_sequence: 0,
		};
		let consumer = ESTrackConsumer {
			codec,
			state: rx,
			last_seen: 0,
		};
		(producer, consumer)
	}

	pub fn codec(&self) -> Codec {
		self.codec
	}

	/// Appends a sample and evicts older samples to respect `capacity`.
	///
	/// Eviction policy: the oldest non-keyframe sample is dropped first; the
	/// most recently written keyframe is never evicted even if that means
	/// briefly exceeding `capacity` by one entry, since a consumer attaching
	/// right after the eviction would otherwise have no keyframe to start
	/// decoding from.
	pub fn write_sample(&mut self, mut data: ESSample) {
		data.sequence = self.next_sequence;
		self.next_sequence += 1;

		self.state.send_if_modified(|state| {
			state.samples.push_back(data);
			while state.samples.len() > self.capacity {
				let last_keyframe_index =
					state.samples.iter().rposition(|s| s.is_keyframe);
				let evict_index = state
					.samples
					.iter()
					.position(|s| !s.is_keyframe)
					.filter(|&i| Some(i) != last_keyframe_index);
				match evict_index {
					Some(i) => {
						state.samples.remove(i);
					}
					None => break,
				}
			}
			true
		});
	}

	pub fn close(self, result: Result<()>) {
		self.state.send_if_modified(|state| {
			state.closed = Some(result);
			true
		});
	}
}

/// One item pulled off an [`ESTrackConsumer`].
///
/// A reader that falls far enough behind the producer's write rate can have
/// its cursor's target evicted out from under it by the ring's capacity
/// limit; `Skipped` reports that gap exactly once, in place of the sample
/// that would otherwise have silently vanished.
#[derive(Debug, Clone)]
pub enum TrackItem {
	Sample(ESSample),
	/// `n` samples between the reader's old cursor and the resumed position
	/// were evicted before this reader ever saw them.
	Skipped(u64),
}

/// A read-only cursor over an [`ESTrackProducer`]'s ring buffer.
///
/// Cheap to clone: every attached output processor holds its own
/// `ESTrackConsumer` with an independent `last_seen` cursor, mirroring the
/// per-consumer `seen`/`index` cursors in the teacher's `TrackConsumer`/
/// `GroupConsumer`.
#[derive(Clone)]
pub struct ESTrackConsumer {
	codec: Codec,
	state: watch::Receiver<TrackState>,
	last_seen: u64,
}

impl ESTrackConsumer {
	pub fn codec(&self) -> Codec {
		self.codec
	}

	/// Returns the next item after `last_seen`, waiting for one to arrive.
	/// Returns `Ok(None)` once the track is closed with no more samples
	/// buffered, and `Err` if it closed with an error.
	///
	/// If eviction has carried the oldest buffered sample past this cursor,
	/// the cursor is fast-forwarded to the oldest keyframe still available
	/// and a single [`TrackItem::Skipped`] is returned first; the
	/// fast-forwarded sample itself is delivered on the following call.
	pub async fn next_sample(&mut self) -> Result<Option<TrackItem>> {
		loop {
			{
				let state = self.state.borrow();
				if let Some(next) = state
					.samples
					.iter()
					.find(|s| s.sequence > self.last_seen)
					.cloned()
				{
					if next.sequence > self.last_seen + 1 {
						let skipped = next.sequence - self.last_seen - 1;
						let resume_at = state
							.samples
							.iter()
							.find(|s| s.is_keyframe && s.sequence > self.last_seen)
							.map(|s| s.sequence)
							.unwrap_or(next.sequence);
						drop(state);
						self.last_seen = resume_at - 1;
						return Ok(Some(TrackItem::Skipped(skipped)));
					}
					drop(state);
					self.last_seen = next.sequence;
					return Ok(Some(TrackItem::Sample(next)));
				}
				if let Some(closed) = &state.closed {
					return closed.clone().map(|_| None);
				}
			}
			if self.state.changed().await.is_err() {
				return Err(RelayError::Closed);
			}
		}
	}

	/// Returns the most recent keyframe currently buffered without advancing
	/// the cursor, used by processors attaching mid-stream that need to seek
	/// forward to a decodable starting point instead of replaying history.
	pub fn latest_keyframe(&self) -> Option<ESSample> {
		self.state
			.borrow()
			.samples
			.iter()
			.rev()
			.find(|s| s.is_keyframe)
			.cloned()
	}

	/// Fast-forwards the cursor to just before the latest buffered keyframe,
	/// so the next `next_sample` call returns that keyframe.
	pub fn seek_to_latest_keyframe(&mut self) {
		if let Some(sample) = self.latest_keyframe() {
			self.last_seen = sample.sequence.saturating_sub(1);
		}
	}
}

#[cfg(test)]
impl ESTrackConsumer {
	pub(crate) fn assert_no_sample(&mut self) {
		use futures::FutureExt;
		assert!(self.next_sample().now_or_never().is_none());
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::model::codec::VideoCodec;
	use bytes::Bytes;

	fn sample(keyframe: bool) -> ESSample {
		ESSample::new(0, 0, Bytes::from_static(b"x"), keyframe, 0)
	}

	#[tokio::test]
	async fn basic_write_read() {
		let (mut producer, mut consumer) =
			ESTrackProducer::new(Codec::Video(VideoCodec::H264), 4);
		producer.write_sample(sample(true));
		let got = consumer.next_sample().await.unwrap().unwrap();
		let TrackItem::Sample(got) = got else {
			panic!("expected a sample, got {got:?}");
		};
		assert!(got.is_keyframe);
		assert_eq!(got.sequence, 0);
	}

	#[tokio::test]
	async fn eviction_past_cursor_reports_skipped_then_resumes_at_keyframe() {
		let (mut producer, mut consumer) =
			ESTrackProducer::new(Codec::Video(VideoCodec::H264), 2);
		producer.write_sample(sample(true));
		let got = consumer.next_sample().await.unwrap().unwrap();
		assert!(matches!(got, TrackItem::Sample(s) if s.sequence == 0));

		// Push enough non-keyframes to evict sequence 1 and 2 out from under
		// the still-behind consumer (cursor is at 0), then a fresh keyframe.
		producer.write_sample(sample(false));
		producer.write_sample(sample(false));
		producer.write_sample(sample(false));
		producer.write_sample(sample(true));

		match consumer.next_sample().await.unwrap().unwrap() {
			TrackItem::Skipped(n) => assert!(n > 0),
			other => panic!("expected Skipped, got {other:?}"),
		}
		match consumer.next_sample().await.unwrap().unwrap() {
			TrackItem::Sample(s) => assert!(s.is_keyframe),
			other => panic!("expected the resumed keyframe, got {other:?}"),
		}
	}

	#[tokio::test]
	async fn keyframe_never_evicted() {
		let (mut producer, consumer) =
			ESTrackProducer::new(Codec::Video(VideoCodec::H264), 2);
		producer.write_sample(sample(true));
		producer.write_sample(sample(false));
		producer.write_sample(sample(false));
		producer.write_sample(sample(false));
		let kf = consumer.latest_keyframe();
		assert!(kf.is_some());
		assert_eq!(kf.unwrap().sequence, 0);
	}

	#[tokio::test]
	async fn closed_without_pending_returns_none() {
		let (producer, mut consumer) =
			ESTrackProducer::new(Codec::Video(VideoCodec::H264), 4);
		producer.close(Ok(()));
		let got = consumer.next_sample().await.unwrap();
		assert!(got.is_none());
	}

	#[tokio::test]
	async fn consumer_has_no_sample_until_written() {
		let (_producer, mut consumer) =
			ESTrackProducer::new(Codec::Video(VideoCodec::H264), 4);
		consumer.assert_no_sample();
	}
}
