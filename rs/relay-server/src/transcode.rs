//! Lazily starts an on-demand transcoder pipeline for a requested profile
//! and keeps its output variant registered in the session's buffer for as
//! long as clients are attached to it.
//!
//! Single-flight dedup across concurrent requests for the same channel and
//! target profile lives in
//! [`relay_core::model::SharedBuffer::get_or_create_variant`], not here:
//! `ensure_running` is only ever invoked from inside that buffer's per-key
//! slot, so at most one pipeline start is ever in flight for a given
//! session+target. Because each session owns a freshly built buffer, that
//! single-flight slot dies with the session instead of surviving it as a
//! stale global cache would.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use relay_core::demux::{Fmp4Demuxer, TsDemuxer};
use relay_core::model::{Codec, ESTrackProducer, ESVariantConsumer, ESVariantProducer, TrackItem, VariantKey};
use relay_core::output::mpegts::TsMuxer;
use relay_core::profile::RelayProfile;
use relay_core::session::Session;
use relay_core::transcoder::{args::output_is_fmp4, Transcoder, TranscoderConfig};
use relay_core::{RelayError, Result};
use tracing::warn;

/// Starts on-demand transcoder pipelines. Holds no per-channel state of its
/// own — see the module docs for why the single-flight guarantee lives in
/// [`relay_core::model::SharedBuffer`] instead.
#[derive(Default)]
pub struct TranscodeRegistry;

impl TranscodeRegistry {
	pub fn new() -> Self {
		Self
	}

	/// Builds `target`'s tracks, registers them in `session`'s buffer, and
	/// starts the transcoder process, then hands the pipeline's long-running
	/// pump loop off to a background task. Returns once the variant is
	/// registered and readable, without waiting for the pipeline to finish;
	/// the background task removes the variant from the buffer itself when
	/// the pipeline ends, so a later request for the same target starts a
	/// fresh pipeline instead of finding a stale entry.
	pub async fn ensure_running(
		&self,
		session: &Arc<Session>,
		source: VariantKey,
		target: VariantKey,
		profile: RelayProfile,
		config: TranscoderConfig,
	) -> Result<()> {
		let mut source_consumer = session.buffer.variant(&source).await.ok_or(RelayError::NotFound)?;

		let (video_producer, video_consumer) = match target.video {
			Some(codec) => {
				let (p, c) = ESTrackProducer::new(Codec::Video(codec), 180);
				(Some(p), Some(c))
			}
			None => (None, None),
		};
		let (audio_producer, audio_consumer) = match target.audio {
			Some(codec) => {
				let (p, c) = ESTrackProducer::new(Codec::Audio(codec), 360);
				(Some(p), Some(c))
			}
			None => (None, None),
		};
		let mut target_producer = ESVariantProducer {
			key: target,
			video: video_producer,
			audio: audio_producer,
		};
		let target_consumer = ESVariantConsumer {
			key: target,
			video: video_consumer,
			audio: audio_consumer,
		};

		let mut transcoder = Transcoder::new(config, profile.clone());
		transcoder.start().await?;

		session.buffer.insert_variant_consumer(target, target_consumer).await;

		let session = session.clone();
		tokio::spawn(async move {
			pump_pipeline(&mut source_consumer, &mut target_producer, &mut transcoder, &profile).await;
			transcoder.shutdown().await;
			target_producer.video.take().map(|t| t.close(Ok(())));
			target_producer.audio.take().map(|t| t.close(Ok(())));
			session.buffer.remove_variant(&target).await;
		});

		Ok(())
	}
}

/// Pumps source samples through the transcoder and demuxes its stdout into
/// `target`'s tracks until the source closes or the transcoder errors.
async fn pump_pipeline(
	source: &mut ESVariantConsumer,
	target: &mut ESVariantProducer,
	transcoder: &mut Transcoder,
	profile: &RelayProfile,
) {
	let fmp4_output = output_is_fmp4(profile);
	let input_video = source.video.as_ref().map(|t| t.codec());
	let input_audio = source.audio.as_ref().map(|t| t.codec());
	let mut input_muxer = TsMuxer::new(input_video, input_audio);
	let mut ts_demuxer = TsDemuxer::new();
	let mut fmp4_demuxer = Fmp4Demuxer::new();

	let mut stdout_buf = [0u8; 64 * 1024];
	loop {
		let wrote_any = match pump_input(source, &mut input_muxer, transcoder).await {
			Ok(wrote) => wrote,
			Err(err) => {
				warn!(%err, "transcoder input pump ended");
				break;
			}
		};
		let read = match transcoder.read_output(&mut stdout_buf).await {
			Ok(read) => read,
			Err(err) => {
				warn!(%err, "transcoder output read failed");
				break;
			}
		};
		if read == 0 && !wrote_any {
			break;
		}
		if read > 0 {
			let chunk = Bytes::copy_from_slice(&stdout_buf[..read]);
			let demuxed = if fmp4_output {
				fmp4_demuxer.push(chunk);
				match fmp4_demuxer.step() {
					Ok(samples) => samples.into_iter().map(|s| (s.codec, s.sample)).collect::<Vec<_>>(),
					Err(err) => {
						warn!(%err, "fmp4 demux of transcoder output failed");
						break;
					}
				}
			} else {
				match ts_demuxer.push(chunk) {
					Ok(samples) => samples.into_iter().map(|s| (s.codec, s.sample)).collect(),
					Err(err) => {
						warn!(%err, "ts demux of transcoder output failed");
						break;
					}
				}
			};
			for (codec, sample) in demuxed {
				match codec {
					Codec::Video(_) => {
						if let Some(track) = target.video.as_mut() {
							track.write_sample(sample);
						}
					}
					Codec::Audio(_) => {
						if let Some(track) = target.audio.as_mut() {
							track.write_sample(sample);
						}
					}
				}
			}
		}
	}
}

/// Pulls one sample each from the source's video and audio tracks (whichever
/// have one pending), muxing them to MPEG-TS and writing the bytes to the
/// transcoder's stdin. Returns whether anything was written. A `Skipped`
/// marker from a lagging cursor is logged and skipped over rather than fed
/// to the transcoder.
async fn pump_input(
	source: &mut ESVariantConsumer,
	muxer: &mut TsMuxer,
	transcoder: &mut Transcoder,
) -> Result<bool> {
	let mut out = BytesMut::new();
	let mut wrote = false;
	if let Some(video) = source.video.as_mut() {
		loop {
			match video.next_sample().await? {
				Some(TrackItem::Sample(sample)) => {
					let packets = muxer.mux_sample(muxer.video_pid(), sample.pts, sample.dts, &sample.data, sample.is_keyframe);
					out.extend_from_slice(&packets);
					wrote = true;
					break;
				}
				Some(TrackItem::Skipped(n)) => {
					warn!(n, "transcoder input video track skipped samples on ring eviction");
					continue;
				}
				None => break,
			}
		}
	}
	if let Some(audio) = source.audio.as_mut() {
		loop {
			match audio.next_sample().await? {
				Some(TrackItem::Sample(sample)) => {
					let packets = muxer.mux_sample(muxer.audio_pid(), sample.pts, sample.dts, &sample.data, true);
					out.extend_from_slice(&packets);
					wrote = true;
					break;
				}
				Some(TrackItem::Skipped(n)) => {
					warn!(n, "transcoder input audio track skipped samples on ring eviction");
					continue;
				}
				None => break,
			}
		}
	}
	if !out.is_empty() {
		transcoder.write_input(&out).await?;
	}
	Ok(wrote)
}
