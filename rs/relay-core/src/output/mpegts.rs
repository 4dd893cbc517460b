use bytes::{BufMut, Bytes, BytesMut};

use super::{Processor, ProcessorState, ProcessorStateMachine};
use crate::error::Result;
use crate::model::{AudioCodec, Codec, ESVariantConsumer, TrackItem, VideoCodec};
use tracing::warn;

const PACKET_LEN: usize = 188;
const PAT_PID: u16 = 0x0000;
const PMT_PID: u16 = 0x0100;
const VIDEO_PID: u16 = 0x0101;
const AUDIO_PID: u16 = 0x0102;

fn stream_type_for(codec: Codec) -> u8 {
	match codec {
		Codec::Video(VideoCodec::H264) => 0x1b,
		Codec::Video(VideoCodec::H265) => 0x24,
		Codec::Video(_) => 0x1b,
		Codec::Audio(AudioCodec::Aac) => 0x0f,
		Codec::Audio(AudioCodec::Ac3) => 0x81,
		Codec::Audio(_) => 0x0f,
	}
}

/// Remuxes elementary-stream samples into MPEG-TS packets: PAT/PMT are
/// (re-)emitted on a fixed interval, and each sample becomes one PES
/// packet split across as many 188-byte TS packets as its size requires,
/// with stuffing bytes added to the final packet's adaptation field.
pub struct TsMuxer {
	video_codec: Option<Codec>,
	audio_codec: Option<Codec>,
	continuity: [u8; 3],
	packets_since_psi: u32,
}

impl TsMuxer {
	pub fn new(video_codec: Option<Codec>, audio_codec: Option<Codec>) -> Self {
		Self {
			video_codec,
			audio_codec,
			continuity: [0; 3],
			packets_since_psi: 0,
		}
	}

	fn psi_index(pid: u16) -> usize {
		match pid {
			PAT_PID => 0,
			PMT_PID => 1,
			_ => 2,
		}
	}

	fn next_continuity(&mut self, pid: u16) -> u8 {
		let idx = Self::psi_index(pid);
		let value = self.continuity[idx];
		self.continuity[idx] = (value + 1) & 0x0f;
		value
	}

	/// Emits PAT+PMT if they haven't been sent in the last 40 packets
	/// (roughly once per keyframe for typical GOP sizes), matching common
	/// muxer practice of repeating PSI tables so clients tuning in mid
	/// stream can find the program map quickly.
	pub fn maybe_psi(&mut self) -> Option<Bytes> {
		if self.packets_since_psi > 0 && self.packets_since_psi < 40 {
			self.packets_since_psi += 1;
			return None;
		}
		self.packets_since_psi = 1;
		let mut out = BytesMut::new();
		out.extend_from_slice(&self.build_pat());
		out.extend_from_slice(&self.build_pmt());
		Some(out.freeze())
	}

	fn build_pat(&mut self) -> Bytes {
		let mut section = BytesMut::new();
		section.put_u8(0x00);
		section.put_u16(0xb00d);
		section.put_u16(0x0001);
		section.put_u8(0xc1);
		section.put_u8(0x00);
		section.put_u8(0x00);
		section.put_u16(0x0001);
		section.put_u16(0xe000 | PMT_PID);
		section.put_u32(0);

		self.wrap_psi(PAT_PID, &section)
	}

	fn build_pmt(&mut self) -> Bytes {
		let mut streams = BytesMut::new();
		if let Some(codec) = self.video_codec {
			streams.put_u8(stream_type_for(codec));
			streams.put_u16(0xe000 | VIDEO_PID);
			streams.put_u16(0xf000);
		}
		if let Some(codec) = self.audio_codec {
			streams.put_u8(stream_type_for(codec));
			streams.put_u16(0xe000 | AUDIO_PID);
			streams.put_u16(0xf000);
		}

		let pcr_pid = self.video_codec.map(|_| VIDEO_PID).unwrap_or(AUDIO_PID);
		let section_len = 9 + streams.len() + 4;
		let mut section = BytesMut::new();
		section.put_u8(0x02);
		section.put_u16(0xb000 | section_len as u16);
		section.put_u16(0x0001);
		section.put_u8(0xc1);
		section.put_u8(0x00);
		section.put_u8(0x00);
		section.put_u16(0xe000 | pcr_pid);
		section.put_u16(0xf000);
		section.extend_from_slice(&streams);
		section.put_u32(0);

		self.wrap_psi(PMT_PID, &section)
	}

	fn wrap_psi(&mut self, pid: u16, section: &[u8]) -> Bytes {
		let mut packet = BytesMut::with_capacity(PACKET_LEN);
		packet.put_u8(0x47);
		packet.put_u16(0x4000 | pid);
		let cc = self.next_continuity(pid);
		packet.put_u8(0x10 | cc);
		packet.put_u8(0x00);
		packet.extend_from_slice(section);
		while packet.len() < PACKET_LEN {
			packet.put_u8(0xff);
		}
		packet.truncate(PACKET_LEN);
		packet.freeze()
	}

	/// Packetizes one sample's PES payload into TS packets for `pid`.
	pub fn mux_sample(&mut self, pid: u16, pts: i64, dts: i64, data: &[u8], is_keyframe: bool) -> Bytes {
		let mut pes = BytesMut::new();
		pes.put_u8(0x00);
		pes.put_u8(0x00);
		pes.put_u8(0x01);
		pes.put_u8(if pid == VIDEO_PID { 0xe0 } else { 0xc0 });
		let pes_len = (data.len() + 13).min(0xffff);
		pes.put_u16(if pid == VIDEO_PID { 0 } else { pes_len as u16 });
		pes.put_u8(0x80);
		pes.put_u8(0xc0);
		pes.put_u8(10);
		pes.extend_from_slice(&encode_timestamp(0x3, pts));
		pes.extend_from_slice(&encode_timestamp(0x1, dts));
		pes.extend_from_slice(data);

		let mut out = BytesMut::new();
		let mut remaining = &pes[..];
		let mut first = true;
		while !remaining.is_empty() {
			let mut packet = BytesMut::with_capacity(PACKET_LEN);
			packet.put_u8(0x47);
			let pusi = if first { 0x4000 } else { 0x0000 };
			packet.put_u16(pusi | pid);
			let cc = self.next_continuity(pid);
			let has_adaptation = first && is_keyframe;
			let flags = if has_adaptation { 0x30 } else { 0x10 };
			packet.put_u8(flags | cc);

			if has_adaptation {
				packet.put_u8(1);
				packet.put_u8(0x50);
			}

			let header_len = packet.len();
			let space = PACKET_LEN - header_len;
			let take = remaining.len().min(space);
			packet.extend_from_slice(&remaining[..take]);
			remaining = &remaining[take..];

			if packet.len() < PACKET_LEN {
				let stuffing = PACKET_LEN - packet.len();
				let mut padded = BytesMut::with_capacity(PACKET_LEN);
				padded.put_u8(0x47);
				padded.put_u16(pid);
				padded.put_u8(0x30 | cc);
				padded.put_u8((stuffing - 1) as u8);
				if stuffing > 1 {
					padded.put_u8(0x00);
					for _ in 0..stuffing.saturating_sub(2) {
						padded.put_u8(0xff);
					}
				}
				padded.extend_from_slice(&packet[header_len..]);
				out.extend_from_slice(&padded);
			} else {
				out.extend_from_slice(&packet);
			}
			first = false;
		}
		out.freeze()
	}

	pub fn video_pid(&self) -> u16 {
		VIDEO_PID
	}

	pub fn audio_pid(&self) -> u16 {
		AUDIO_PID
	}
}

fn encode_timestamp(marker: u8, ts: i64) -> [u8; 5] {
	let ts = ts & 0x1_ffff_ffff;
	[
		(marker << 4) | (((ts >> 30) as u8) << 1) | 1,
		(ts >> 22) as u8,
		(((ts >> 15) as u8) << 1) | 1,
		(ts >> 7) as u8,
		(((ts << 1) as u8)) | 1,
	]
}

/// Output processor serving a variant as a continuous MPEG-TS byte stream.
pub struct MpegTsProcessor {
	variant: ESVariantConsumer,
	muxer: TsMuxer,
	state: ProcessorStateMachine,
}

impl MpegTsProcessor {
	pub fn new(variant: ESVariantConsumer) -> Self {
		let video_codec = variant.video.as_ref().map(|t| t.codec());
		let audio_codec = variant.audio.as_ref().map(|t| t.codec());
		Self {
			variant,
			muxer: TsMuxer::new(video_codec, audio_codec),
			state: ProcessorStateMachine::new(),
		}
	}
}

#[async_trait::async_trait]
impl Processor for MpegTsProcessor {
	async fn attach(&mut self) -> Result<()> {
		self.state.transition(ProcessorState::Attaching)?;
		if let Some(video) = self.variant.video.as_mut() {
			video.seek_to_latest_keyframe();
		}
		self.state.transition(ProcessorState::Streaming)?;
		Ok(())
	}

	async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
		let mut out = BytesMut::new();
		if let Some(psi) = self.muxer.maybe_psi() {
			out.extend_from_slice(&psi);
		}

		let video_pid = self.muxer.video_pid();
		let audio_pid = self.muxer.audio_pid();

		if let Some(video) = self.variant.video.as_mut() {
			loop {
				match video.next_sample().await? {
					Some(TrackItem::Sample(sample)) => {
						let packets = self.muxer.mux_sample(
							video_pid,
							sample.pts,
							sample.dts,
							&sample.data,
							sample.is_keyframe,
						);
						out.extend_from_slice(&packets);
						return Ok(Some(out.freeze()));
					}
					Some(TrackItem::Skipped(n)) => {
						warn!(n, "video track skipped samples on ring eviction");
						continue;
					}
					None => break,
				}
			}
		}
		if let Some(audio) = self.variant.audio.as_mut() {
			loop {
				match audio.next_sample().await? {
					Some(TrackItem::Sample(sample)) => {
						let packets =
							self.muxer
								.mux_sample(audio_pid, sample.pts, sample.dts, &sample.data, true);
						out.extend_from_slice(&packets);
						return Ok(Some(out.freeze()));
					}
					Some(TrackItem::Skipped(n)) => {
						warn!(n, "audio track skipped samples on ring eviction");
						continue;
					}
					None => break,
				}
			}
		}
		Ok(None)
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

	#[test]
	fn psi_repeats_on_interval() {
		let mut muxer = TsMuxer::new(Some(Codec::Video(VideoCodec::H264)), None);
		assert!(muxer.maybe_psi().is_some());
		assert!(muxer.maybe_psi().is_none());
	}

	#[test]
	fn mux_sample_produces_aligned_packets() {
		let mut muxer = TsMuxer::new(Some(Codec::Video(VideoCodec::H264)), None);
		let data = vec![0u8; 500];
		let packets = muxer.mux_sample(muxer.video_pid(), 0, 0, &data, true);
		assert_eq!(packets.len() % PACKET_LEN, 0);
		assert_eq!(packets[0], 0x47);
	}
}
