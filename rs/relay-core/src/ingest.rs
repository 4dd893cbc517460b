//! Wires a classified upstream origin to a session's [`SharedBuffer`]: probes
//! the origin to pick a demuxer, then runs that demuxer against a streamed
//! HTTP body for as long as the session lives, writing samples into the
//! source variant as they arrive.
//!
//! This is the one place `relay-core` talks to the network directly — every
//! other module is pure parsing/bookkeeping, fed bytes by a caller. Kept
//! behind the crate's own `reqwest`-backed [`HlsFetcher`] impl so the HLS/DASH
//! ingest loops share exactly one HTTP client configuration with the plain
//! MPEG-TS path.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use url::Url;

use crate::circuit_breaker::{CircuitBreaker, FailureKind};
use crate::classification::{Classification, SourceFormat};
use crate::demux::dash::DashIngest;
use crate::demux::fmp4::Fmp4Demuxer;
use crate::demux::hls::{HlsConfig, HlsFetcher, HlsIngest};
use crate::demux::mpegts::TsDemuxer;
use crate::error::{RelayError, Result};
use crate::model::{Codec, ESSample, ESTrackProducer, ESVariantConsumer, ESVariantProducer, VariantKey};
use crate::pool::ConnectionPool;

/// Production [`HlsFetcher`] backed by `reqwest`. Also used directly by
/// [`probe_origin`] and the MPEG-TS ingest loop, so every upstream fetch in
/// this crate goes through one client configuration.
#[derive(Clone)]
pub struct ReqwestFetcher {
	client: reqwest::Client,
}

impl ReqwestFetcher {
	pub fn new(client: reqwest::Client) -> Self {
		Self { client }
	}
}

impl HlsFetcher for ReqwestFetcher {
	fn fetch_bytes(&self, url: Url) -> Pin<Box<dyn Future<Output = Result<Bytes>> + Send + '_>> {
		Box::pin(async move {
			let response = self
				.client
				.get(url)
				.send()
				.await
				.map_err(|e| RelayError::Origin(e.to_string()))?
				.error_for_status()
				.map_err(|e| RelayError::Origin(e.to_string()))?;
			response.bytes().await.map_err(|e| RelayError::Origin(e.to_string()))
		})
	}
}

/// Byte budget for [`probe_origin`]'s codec sniff: enough for a few TS
/// packets, an HLS segment, or a CMAF init+fragment, but small enough that a
/// slow or hostile origin can't stall session creation.
const PROBE_BYTE_BUDGET: usize = 1 << 20;

/// Classifies an upstream URL before a session commits to it: a cheap
/// extension/content-type check picks the container format, then a short
/// prefix of the body is run through the matching demuxer to recover
/// best-effort codecs. The probe connection is then dropped; ingest proper
/// opens its own fresh connection, since a live origin may not tolerate the
/// probe's partial read being resumed mid-stream.
pub async fn probe_origin(client: &reqwest::Client, url: &Url) -> Result<Classification> {
	let format = sniff_format(client, url).await;
	let (video, audio) = match format {
		SourceFormat::MpegTs => sniff_mpegts_codecs(client, url).await.unwrap_or((None, None)),
		SourceFormat::HlsFmp4 | SourceFormat::Dash => (None, None),
		SourceFormat::HlsTs => (None, None),
	};
	Ok(Classification {
		source_url: url.clone(),
		format,
		video,
		audio,
	})
}

async fn sniff_format(client: &reqwest::Client, url: &Url) -> SourceFormat {
	if url.path().ends_with(".m3u8") {
		return SourceFormat::HlsTs;
	}
	if url.path().ends_with(".mpd") {
		return SourceFormat::Dash;
	}
	let Ok(response) = client.head(url.clone()).send().await else {
		return SourceFormat::MpegTs;
	};
	let content_type = response
		.headers()
		.get(reqwest::header::CONTENT_TYPE)
		.and_then(|v| v.to_str().ok())
		.unwrap_or_default();
	if content_type.contains("mpegurl") {
		SourceFormat::HlsTs
	} else if content_type.contains("dash+xml") {
		SourceFormat::Dash
	} else if content_type.contains("mp4") {
		SourceFormat::HlsFmp4
	} else {
		SourceFormat::MpegTs
	}
}

async fn sniff_mpegts_codecs(
	client: &reqwest::Client,
	url: &Url,
) -> Result<(Option<crate::model::VideoCodec>, Option<crate::model::AudioCodec>)> {
	let mut stream = client
		.get(url.clone())
		.send()
		.await
		.map_err(|e| RelayError::Origin(e.to_string()))?
		.bytes_stream();

	let mut demuxer = TsDemuxer::new();
	let mut video = None;
	let mut audio = None;
	let mut consumed = 0usize;

	while let Some(chunk) = stream.next().await {
		let chunk = chunk.map_err(|e| RelayError::Origin(e.to_string()))?;
		consumed += chunk.len();
		for sample in demuxer.push(chunk)? {
			match sample.codec {
				Codec::Video(c) => video = Some(c),
				Codec::Audio(c) => audio = Some(c),
			}
		}
		if (video.is_some() && audio.is_some()) || consumed >= PROBE_BYTE_BUDGET {
			break;
		}
	}
	Ok((video, audio))
}

/// The producer and consumer halves of a newly classified source variant,
/// built once codecs are known. `producer` is handed to [`run_ingest`];
/// `consumer` is registered with the session's
/// [`crate::model::SharedBuffer`] so output processors can attach to it.
pub struct SourceVariant {
	pub key: VariantKey,
	pub producer: ESVariantProducer,
	pub consumer: ESVariantConsumer,
}

/// Builds empty video/audio tracks for a classified source, using the
/// capacities configured for the buffer.
pub fn build_source_variant(classification: &Classification, video_capacity: usize, audio_capacity: usize) -> SourceVariant {
	let key = VariantKey::source(classification.video, classification.audio);
	let (video_producer, video_consumer) = match classification.video {
		Some(codec) => {
			let (p, c) = ESTrackProducer::new(Codec::Video(codec), video_capacity);
			(Some(p), Some(c))
		}
		None => (None, None),
	};
	let (audio_producer, audio_consumer) = match classification.audio {
		Some(codec) => {
			let (p, c) = ESTrackProducer::new(Codec::Audio(codec), audio_capacity);
			(Some(p), Some(c))
		}
		None => (None, None),
	};
	SourceVariant {
		key,
		producer: ESVariantProducer {
			key,
			video: video_producer,
			audio: audio_producer,
		},
		consumer: ESVariantConsumer {
			key,
			video: video_consumer,
			audio: audio_consumer,
		},
	}
}

/// Runs one upstream ingest to completion (or failure), writing demuxed
/// samples into `source`. Dispatches on `classification.format`; whichever
/// branch runs acquires a connection-pool permit before opening the origin
/// socket and reports the outcome to the circuit breaker, matching the
/// session-creation contract that a circuit-open origin never gets a buffer.
pub async fn run_ingest(
	classification: Classification,
	mut source: ESVariantProducer,
	pool: Arc<ConnectionPool>,
	breaker: Arc<CircuitBreaker>,
	client: reqwest::Client,
) -> Result<()> {
	let host = classification.host();
	if !breaker.allow(&host) {
		return Err(RelayError::CircuitOpen);
	}

	let result = match classification.format {
		SourceFormat::MpegTs => run_mpegts_ingest(&classification, &mut source, &pool, &client).await,
		SourceFormat::HlsTs | SourceFormat::HlsFmp4 => run_hls_ingest(&classification, &mut source, &pool, &client).await,
		SourceFormat::Dash => run_dash_ingest(&classification, &mut source, &pool, &client).await,
	};

	match &result {
		Ok(()) => breaker.record_success(&host),
		Err(_) => breaker.record_failure(&host, FailureKind::Network),
	}
	result
}

fn deliver(source: &mut ESVariantProducer, codec: Codec, sample: ESSample) {
	match codec {
		Codec::Video(_) => {
			if let Some(track) = source.video.as_mut() {
				track.write_sample(sample);
			}
		}
		Codec::Audio(_) => {
			if let Some(track) = source.audio.as_mut() {
				track.write_sample(sample);
			}
		}
	}
}

async fn run_mpegts_ingest(
	classification: &Classification,
	source: &mut ESVariantProducer,
	pool: &ConnectionPool,
	client: &reqwest::Client,
) -> Result<()> {
	let host = classification.host();
	let _permit = pool.acquire(&host).await?;

	let response = client
		.get(classification.source_url.clone())
		.send()
		.await
		.map_err(|e| RelayError::Origin(e.to_string()))?
		.error_for_status()
		.map_err(|e| RelayError::Origin(e.to_string()))?;

	let mut stream = response.bytes_stream();
	let mut demuxer = TsDemuxer::new();
	while let Some(chunk) = stream.next().await {
		let chunk = chunk.map_err(|e| RelayError::Origin(e.to_string()))?;
		for demuxed in demuxer.push(chunk)? {
			deliver(source, demuxed.codec, demuxed.sample);
		}
	}
	Ok(())
}

/// Unlike [`run_mpegts_ingest`]'s single long-lived GET, HLS ingest is a
/// sequence of short playlist/segment fetches, so a pool permit is acquired
/// and released around each one rather than held for the ingest's whole
/// lifetime — otherwise one channel's HLS ingest would pin a connection-pool
/// slot for as long as the session lives, starving other channels on the
/// same host of the concurrency the pool exists to cap.
async fn run_hls_ingest(
	classification: &Classification,
	source: &mut ESVariantProducer,
	pool: &ConnectionPool,
	client: &reqwest::Client,
) -> Result<()> {
	let host = classification.host();
	let fetcher = ReqwestFetcher::new(client.clone());
	let mut ingest = HlsIngest::new(
		fetcher,
		HlsConfig {
			playlist: classification.source_url.clone(),
			preroll_segments: 3,
			refresh_ratio: 0.5,
		},
	);
	{
		let _permit = pool.acquire(&host).await?;
		ingest.prime().await?;
	}

	let mut ts_demuxer = TsDemuxer::new();
	let mut fmp4_demuxer = Fmp4Demuxer::new();

	loop {
		let segments = {
			let _permit = pool.acquire(&host).await?;
			ingest.step().await?
		};
		for segment in segments {
			if segment.is_fmp4 {
				fmp4_demuxer.push(segment.data);
				for demuxed in fmp4_demuxer.step()? {
					deliver(source, demuxed.codec, demuxed.sample);
				}
			} else {
				for demuxed in ts_demuxer.push(segment.data)? {
					deliver(source, demuxed.codec, demuxed.sample);
				}
			}
		}
		tokio::time::sleep(ingest.refresh_interval().max(Duration::from_millis(200))).await;
	}
}

/// Same per-fetch pool gating as [`run_hls_ingest`], since DASH ingest is
/// likewise a sequence of short manifest/segment fetches rather than one
/// held connection.
async fn run_dash_ingest(
	classification: &Classification,
	source: &mut ESVariantProducer,
	pool: &ConnectionPool,
	client: &reqwest::Client,
) -> Result<()> {
	let host = classification.host();
	let fetcher = ReqwestFetcher::new(client.clone());
	let mut ingest = DashIngest::new(fetcher, classification.source_url.clone());
	{
		let _permit = pool.acquire(&host).await?;
		ingest.prime().await?;
	}

	let mut demuxer = Fmp4Demuxer::new();
	loop {
		let segments = {
			let _permit = pool.acquire(&host).await?;
			ingest.step().await?
		};
		for segment in segments {
			demuxer.push(segment.data);
			for demuxed in demuxer.step()? {
				deliver(source, demuxed.codec, demuxed.sample);
			}
		}
		tokio::time::sleep(ingest.refresh_interval().max(Duration::from_millis(200))).await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::model::VideoCodec;

	#[test]
	fn build_source_variant_creates_tracks_for_detected_codecs() {
		let classification = Classification {
			source_url: Url::parse("http://origin.example/stream").unwrap(),
			format: SourceFormat::MpegTs,
			video: Some(VideoCodec::H264),
			audio: None,
		};
		let source = build_source_variant(&classification, 8, 8);
		assert!(source.producer.video.is_some());
		assert!(source.producer.audio.is_none());
		assert!(source.consumer.video.is_some());
		assert!(source.consumer.audio.is_none());
		assert_eq!(source.key, VariantKey::source(Some(VideoCodec::H264), None));
	}
}
