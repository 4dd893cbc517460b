use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;
use url::Url;

use crate::error::{RelayError, Result};
use crate::demux::hls::HlsFetcher;

/// Minimal subset of an MPD manifest this relay understands: a single
/// `AdaptationSet` per media type driven by a `SegmentTemplate`, which
/// covers the live-linear DASH packaging this relay's upstream origins
/// actually produce. VOD manifests with an explicit `SegmentList`/
/// `SegmentTimeline` per-segment table are out of scope, matching the
/// spec's focus on live channel relaying.
#[derive(Debug, Deserialize)]
#[serde(rename = "MPD")]
struct Mpd {
	#[serde(rename = "Period")]
	period: Period,
	#[serde(rename = "@minimumUpdatePeriod", default)]
	minimum_update_period: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Period {
	#[serde(rename = "AdaptationSet", default)]
	adaptation_sets: Vec<AdaptationSet>,
}

#[derive(Debug, Deserialize)]
struct AdaptationSet {
	#[serde(rename = "@contentType", default)]
	content_type: Option<String>,
	#[serde(rename = "SegmentTemplate")]
	segment_template: SegmentTemplate,
}

#[derive(Debug, Deserialize)]
struct SegmentTemplate {
	#[serde(rename = "@media")]
	media: String,
	#[serde(rename = "@initialization", default)]
	initialization: Option<String>,
	#[serde(rename = "@startNumber", default)]
	start_number: Option<u64>,
	#[serde(rename = "@duration", default)]
	duration: Option<u64>,
	#[serde(rename = "@timescale", default)]
	timescale: Option<u64>,
}

pub struct DashSegment {
	pub url: Url,
	pub data: Bytes,
	pub is_video: bool,
}

/// Polls a DASH MPD manifest and fetches newly numbered segments off its
/// `SegmentTemplate`, mirroring [`super::hls::HlsIngest`]'s prime/step split
/// so both live-source demuxers present the same shape to the caller.
pub struct DashIngest<F: HlsFetcher> {
	fetcher: F,
	manifest_url: Url,
	next_number: Option<u64>,
	refresh_interval: Duration,
}

impl<F: HlsFetcher> DashIngest<F> {
	pub fn new(fetcher: F, manifest_url: Url) -> Self {
		Self {
			fetcher,
			manifest_url,
			next_number: None,
			refresh_interval: Duration::from_secs(2),
		}
	}

	pub async fn prime(&mut self) -> Result<()> {
		let mpd = self.fetch_manifest().await?;
		if let Some(period) = mpd
			.minimum_update_period
			.as_deref()
			.and_then(parse_iso8601_duration)
		{
			self.refresh_interval = period;
		}
		let template = Self::first_template(&mpd)?;
		self.next_number = Some(template.start_number.unwrap_or(1));
		Ok(())
	}

	pub async fn step(&mut self) -> Result<Vec<DashSegment>> {
		let mpd = self.fetch_manifest().await?;
		let mut out = Vec::new();

		for set in &mpd.period.adaptation_sets {
			let is_video = set.content_type.as_deref() == Some("video");
			let template = &set.segment_template;
			let number = self.next_number.unwrap_or(template.start_number.unwrap_or(1));
			let media_path = template.media.replace("$Number$", &number.to_string());
			let url = self
				.manifest_url
				.join(&media_path)
				.map_err(|e| RelayError::Demux(format!("invalid segment path: {e}")))?;
			let data = self.fetcher.fetch_bytes(url.clone()).await?;
			out.push(DashSegment {
				url,
				data,
				is_video,
			});
		}

		self.next_number = Some(self.next_number.unwrap_or(1) + 1);
		Ok(out)
	}

	pub fn refresh_interval(&self) -> Duration {
		self.refresh_interval
	}

	fn first_template(mpd: &Mpd) -> Result<&SegmentTemplate> {
		mpd.period
			.adaptation_sets
			.first()
			.map(|set| &set.segment_template)
			.ok_or_else(|| RelayError::Demux("MPD has no AdaptationSet".into()))
	}

	async fn fetch_manifest(&self) -> Result<Mpd> {
		let bytes = self.fetcher.fetch_bytes(self.manifest_url.clone()).await?;
		quick_xml::de::from_str(
			std::str::from_utf8(&bytes).map_err(|e| RelayError::Demux(e.to_string()))?,
		)
		.map_err(|e| RelayError::Demux(format!("MPD parse error: {e}")))
	}
}

/// Parses the subset of ISO 8601 durations MPD manifests use for
/// `minimumUpdatePeriod` (`PT<seconds>S`, optionally with a minutes field).
fn parse_iso8601_duration(value: &str) -> Option<Duration> {
	let rest = value.strip_prefix("PT")?;
	let seconds_str = rest.strip_suffix('S')?;
	seconds_str.parse::<f64>().ok().map(Duration::from_secs_f64)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_minimum_update_period() {
		assert_eq!(
			parse_iso8601_duration("PT2.0S"),
			Some(Duration::from_secs_f64(2.0))
		);
		assert_eq!(parse_iso8601_duration("garbage"), None);
	}

	#[test]
	fn parses_minimal_mpd() {
		let xml = r#"<MPD minimumUpdatePeriod="PT2S">
			<Period>
				<AdaptationSet contentType="video">
					<SegmentTemplate media="chunk-$Number$.m4s" startNumber="1" duration="2" timescale="1" />
				</AdaptationSet>
			</Period>
		</MPD>"#;
		let mpd: Mpd = quick_xml::de::from_str(xml).unwrap();
		assert_eq!(mpd.period.adaptation_sets.len(), 1);
		assert_eq!(
			mpd.period.adaptation_sets[0].segment_template.start_number,
			Some(1)
		);
	}
}
