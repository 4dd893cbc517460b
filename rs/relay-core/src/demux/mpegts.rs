use std::collections::HashMap;

use bytes::{Buf, Bytes, BytesMut};

use super::nal::AnnexBDecoder;
use crate::error::{RelayError, Result};
use crate::model::{AudioCodec, Codec, ESSample, VideoCodec};

const PACKET_LEN: usize = 188;
const SYNC_BYTE: u8 = 0x47;

#[derive(Debug, Clone, Copy)]
enum StreamKind {
	Video(VideoCodec),
	Audio(AudioCodec),
}

fn stream_kind_from_type(stream_type: u8) -> Option<StreamKind> {
	match stream_type {
		0x1b => Some(StreamKind::Video(VideoCodec::H264)),
		0x24 => Some(StreamKind::Video(VideoCodec::H265)),
		0x0f | 0x11 => Some(StreamKind::Audio(AudioCodec::Aac)),
		0x81 => Some(StreamKind::Audio(AudioCodec::Ac3)),
		0x03 | 0x04 => Some(StreamKind::Audio(AudioCodec::Mp3)),
		_ => None,
	}
}

struct PesAssembly {
	kind: StreamKind,
	buffer: BytesMut,
	decoder: Option<AnnexBDecoder>,
}

pub struct DemuxedSample {
	pub pid: u16,
	pub codec: Codec,
	pub sample: ESSample,
}

/// Incremental MPEG-TS demuxer: feed raw 188-byte-aligned TS packets, pull
/// out reassembled elementary-stream samples per PID once PAT and PMT have
/// been seen.
///
/// PES payloads are buffered per PID until the next packet with
/// `payload_unit_start_indicator` set, at which point the previous PES
/// packet is parsed (PTS/DTS from its optional header) and handed to the
/// caller as one [`ESSample`]. Video PIDs additionally run their payload
/// through [`AnnexBDecoder`] to split NAL units and detect keyframes.
pub struct TsDemuxer {
	carry: BytesMut,
	pmt_pid: Option<u16>,
	streams: HashMap<u16, StreamKind>,
	assemblies: HashMap<u16, PesAssembly>,
	sequence: HashMap<u16, u64>,
}

impl TsDemuxer {
	pub fn new() -> Self {
		Self {
			carry: BytesMut::new(),
			pmt_pid: None,
			streams: HashMap::new(),
			assemblies: HashMap::new(),
			sequence: HashMap::new(),
		}
	}

	pub fn push<B: Buf>(&mut self, mut data: B) -> Result<Vec<DemuxedSample>> {
		let mut bytes = BytesMut::new();
		bytes.extend_from_slice(&self.carry);
		while data.has_remaining() {
			let chunk = data.chunk();
			bytes.extend_from_slice(chunk);
			let len = chunk.len();
			data.advance(len);
		}

		let mut out = Vec::new();
		let mut offset = 0;
		while offset + PACKET_LEN <= bytes.len() {
			if bytes[offset] != SYNC_BYTE {
				// Resync: scan forward for the next sync byte rather than
				// failing the whole stream on one corrupt packet.
				offset += 1;
				continue;
			}
			let packet = bytes.slice(offset..offset + PACKET_LEN);
			self.handle_packet(&packet, &mut out)?;
			offset += PACKET_LEN;
		}

		self.carry = BytesMut::from(&bytes[offset..]);
		Ok(out)
	}

	fn handle_packet(&mut self, packet: &Bytes, out: &mut Vec<DemuxedSample>) -> Result<()> {
		let payload_start = (packet[1] & 0x40) != 0;
		let pid = (((packet[1] & 0x1f) as u16) << 8) | packet[2] as u16;
		let adaptation = (packet[3] >> 4) & 0x3;

		let mut header_len = 4;
		if adaptation == 2 || adaptation == 3 {
			let adaptation_len = packet[4] as usize;
			header_len += 1 + adaptation_len;
		}
		if adaptation == 2 || header_len > packet.len() {
			return Ok(());
		}
		let payload = packet.slice(header_len..);

		if pid == 0x0000 {
			self.parse_pat(&payload, payload_start);
			return Ok(());
		}
		if Some(pid) == self.pmt_pid {
			self.parse_pmt(&payload, payload_start);
			return Ok(());
		}

		let Some(&kind) = self.streams.get(&pid) else {
			return Ok(());
		};

		if payload_start {
			if let Some(assembly) = self.assemblies.remove(&pid) {
				self.emit_pes(pid, assembly, out)?;
			}
			self.assemblies.insert(
				pid,
				PesAssembly {
					kind,
					buffer: BytesMut::new(),
					decoder: matches!(kind, StreamKind::Video(VideoCodec::H264 | VideoCodec::H265))
						.then(|| match kind {
							StreamKind::Video(codec) => AnnexBDecoder::new(codec),
							_ => unreachable!(),
						}),
				},
			);
		}

		if let Some(assembly) = self.assemblies.get_mut(&pid) {
			assembly.buffer.extend_from_slice(&payload);
		}

		Ok(())
	}

	fn emit_pes(&mut self, pid: u16, assembly: PesAssembly, out: &mut Vec<DemuxedSample>) -> Result<()> {
		let data = assembly.buffer.freeze();
		if data.len() < 9 || data[0] != 0x00 || data[1] != 0x00 || data[2] != 0x01 {
			return Ok(());
		}
		let pts_dts_flags = (data[7] >> 6) & 0x3;
		let header_data_len = data[8] as usize;
		let header_end = 9 + header_data_len;
		if header_end > data.len() {
			return Ok(());
		}

		let pts = if pts_dts_flags & 0x2 != 0 && data.len() >= 14 {
			Self::parse_timestamp(&data[9..14])
		} else {
			0
		};
		let dts = if pts_dts_flags == 0x3 && data.len() >= 19 {
			Self::parse_timestamp(&data[14..19])
		} else {
			pts
		};

		let es_payload = data.slice(header_end..);
		let sequence = self.sequence.entry(pid).or_insert(0);
		let seq = *sequence;
		*sequence += 1;

		let codec = match assembly.kind {
			StreamKind::Video(codec) => Codec::Video(codec),
			StreamKind::Audio(codec) => Codec::Audio(codec),
		};
		let (payload, is_keyframe) = match (assembly.kind, assembly.decoder) {
			(StreamKind::Video(_), Some(mut decoder)) => decoder.decode(&es_payload),
			_ => (es_payload, true),
		};

		out.push(DemuxedSample {
			pid,
			codec,
			sample: ESSample::new(pts, dts, payload, is_keyframe, seq),
		});
		Ok(())
	}

	fn parse_timestamp(bytes: &[u8]) -> i64 {
		let b0 = bytes[0] as i64;
		let b1 = bytes[1] as i64;
		let b2 = bytes[2] as i64;
		let b3 = bytes[3] as i64;
		let b4 = bytes[4] as i64;
		((b0 >> 1) & 0x7) << 30 | (b1 << 22) | ((b2 >> 1) << 15) | (b3 << 7) | (b4 >> 1)
	}

	fn parse_pat(&mut self, payload: &Bytes, payload_start: bool) {
		if !payload_start || payload.is_empty() {
			return;
		}
		let pointer = payload[0] as usize;
		let section = &payload[1 + pointer..];
		if section.len() < 8 {
			return;
		}
		let section_len = (((section[1] & 0x0f) as usize) << 8) | section[2] as usize;
		let programs = &section[8..(3 + section_len).min(section.len()).max(8)];
		let mut i = 0;
		while i + 4 <= programs.len() {
			let program_number = ((programs[i] as u16) << 8) | programs[i + 1] as u16;
			let pid = (((programs[i + 2] & 0x1f) as u16) << 8) | programs[i + 3] as u16;
			if program_number != 0 {
				self.pmt_pid = Some(pid);
			}
			i += 4;
		}
	}

	fn parse_pmt(&mut self, payload: &Bytes, payload_start: bool) {
		if !payload_start || payload.is_empty() {
			return;
		}
		let pointer = payload[0] as usize;
		let section = &payload[1 + pointer..];
		if section.len() < 12 {
			return;
		}
		let section_len = (((section[1] & 0x0f) as usize) << 8) | section[2] as usize;
		let program_info_len = (((section[10] & 0x0f) as usize) << 8) | section[11] as usize;
		let mut i = 12 + program_info_len;
		let end = (3 + section_len).min(section.len());
		while i + 5 <= end {
			let stream_type = section[i];
			let pid = (((section[i + 1] & 0x1f) as u16) << 8) | section[i + 2] as u16;
			let es_info_len = (((section[i + 3] & 0x0f) as usize) << 8) | section[i + 4] as usize;
			if let Some(kind) = stream_kind_from_type(stream_type) {
				self.streams.insert(pid, kind);
			}
			i += 5 + es_info_len;
		}
	}
}

impl Default for TsDemuxer {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ignores_non_sync_garbage_until_resync() {
		let mut demuxer = TsDemuxer::new();
		let mut garbage = vec![0xffu8; 10];
		garbage.extend(std::iter::repeat(0u8).take(PACKET_LEN));
		let result = demuxer.push(Bytes::from(garbage));
		assert!(result.is_ok());
	}

	#[test]
	fn parses_pat_and_tracks_pmt_pid() {
		let mut demuxer = TsDemuxer::new();
		let mut packet = vec![0u8; PACKET_LEN];
		packet[0] = SYNC_BYTE;
		packet[1] = 0x40;
		packet[2] = 0x00;
		packet[3] = 0x10;
		let payload_offset = 4;
		packet[payload_offset] = 0x00;
		packet[payload_offset + 1] = 0x00;
		packet[payload_offset + 2] = 0xb0;
		packet[payload_offset + 3] = 13;
		packet[payload_offset + 4] = 0x00;
		packet[payload_offset + 5] = 0x01;
		packet[payload_offset + 6] = 0xc1;
		packet[payload_offset + 7] = 0x00;
		packet[payload_offset + 8] = 0x00;
		packet[payload_offset + 9] = 0x00;
		packet[payload_offset + 10] = 0x01;
		packet[payload_offset + 11] = 0xe1;
		packet[payload_offset + 12] = 0x00;
		demuxer.push(Bytes::from(packet)).unwrap();
		assert_eq!(demuxer.pmt_pid, Some(0x100));
	}
}
