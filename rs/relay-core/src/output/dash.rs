use std::time::Duration;

use bytes::Bytes;

use super::hls_fmp4::HlsFmp4Processor;
use super::segment::SegmentConfig;
use super::{Processor, ProcessorState};
use crate::error::Result;
use crate::model::ESVariantConsumer;

/// Output processor producing DASH: reuses [`HlsFmp4Processor`]'s CMAF
/// fragment encoding verbatim (DASH and HLS-fMP4 share the same on-wire
/// segment format, differing only in manifest syntax) and renders an MPD
/// instead of an m3u8 media playlist.
pub struct DashProcessor {
	inner: HlsFmp4Processor,
	target_duration: Duration,
}

impl DashProcessor {
	pub fn new(variant: ESVariantConsumer, config: SegmentConfig) -> Self {
		let target_duration = config.target_duration;
		Self {
			inner: HlsFmp4Processor::new(variant, config),
			target_duration,
		}
	}

	pub fn init_segment(&self) -> Option<Bytes> {
		self.inner.init_segment()
	}

	pub fn segment_data(&self, sequence: u64) -> Option<Bytes> {
		self.inner.segment_data(sequence)
	}

	pub fn manifest(&self) -> String {
		let segment_count = self.inner.playlist().lines().filter(|l| l.ends_with(".m4s")).count();
		format!(
			concat!(
				"<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n",
				"<MPD xmlns=\"urn:mpeg:dash:schema:mpd:2011\" type=\"dynamic\" ",
				"minimumUpdatePeriod=\"PT{:.1}S\" profiles=\"urn:mpeg:dash:profile:isoff-live:2011\">\n",
				"  <Period>\n",
				"    <AdaptationSet contentType=\"video\" segmentAlignment=\"true\">\n",
				"      <SegmentTemplate media=\"segment-$Number$.m4s\" initialization=\"init.mp4\" ",
				"startNumber=\"1\" duration=\"{}\" timescale=\"1\" />\n",
				"    </AdaptationSet>\n",
				"  </Period>\n",
				"</MPD>\n",
			),
			self.target_duration.as_secs_f64(),
			segment_count.max(1),
		)
	}
}

#[async_trait::async_trait]
impl Processor for DashProcessor {
	async fn attach(&mut self) -> Result<()> {
		self.inner.attach().await
	}

	async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
		self.inner.next_chunk().await
	}

	async fn detach(&mut self) {
		self.inner.detach().await
	}

	fn state(&self) -> ProcessorState {
		self.inner.state()
	}
}
