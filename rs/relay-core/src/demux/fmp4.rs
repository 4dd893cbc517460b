use std::collections::HashMap;

use bytes::{Buf, Bytes};
use mp4_atom::Any;

use super::atom_reader::{AtomEvent, AtomReader};
use crate::error::{RelayError, Result};
use crate::model::{AudioCodec, Codec, ESSample, VideoCodec};

#[derive(Debug, Clone, Copy)]
enum TrackCodec {
	Video(VideoCodec),
	Audio(AudioCodec),
}

impl From<TrackCodec> for Codec {
	fn from(codec: TrackCodec) -> Self {
		match codec {
			TrackCodec::Video(c) => Codec::Video(c),
			TrackCodec::Audio(c) => Codec::Audio(c),
		}
	}
}

struct TrackInfo {
	codec: TrackCodec,
	timescale: u32,
}

struct PendingEntry {
	track_id: u32,
	size: u32,
	duration: u32,
	is_keyframe: bool,
	cts_offset: i32,
}

/// Demuxes a fragmented MP4 / CMAF byte stream into [`ESSample`]s per track,
/// keyed by the track id assigned in the initialization segment's `moov`.
///
/// Grounded on the atom-walking structure used by this workspace's CMAF
/// importer: `ftyp`/`moov` establish track identity and timescale once,
/// then each `moof`/`mdat` pair is decoded in turn, with `trun` sample
/// entries sliced directly out of the zero-copy `mdat` body.
pub struct Fmp4Demuxer {
	reader: AtomReader,
	tracks: HashMap<u32, TrackInfo>,
	pending: Vec<PendingEntry>,
	sequence: u64,
}

pub struct DemuxedSample {
    pub track_id: u32,
    pub codec: Codec,
    pub sample: ESSample,
}

impl Fmp4Demuxer {
	pub fn new() -> Self {
		Self {
			reader: AtomReader::new(),
			tracks: HashMap::new(),
			pending: Vec::new(),
			sequence: 0,
		}
	}

	pub fn push<B: Buf>(&mut self, data: B) {
		self.reader.push(data);
	}

	/// Drains as many complete samples as the buffered bytes allow. Call in
	/// a loop until it returns an empty vec to fully drain the current push.
	pub fn step(&mut self) -> Result<Vec<DemuxedSample>> {
		let mut out = Vec::new();
		loop {
			let event = self
				.reader
				.next()
				.map_err(|e| RelayError::Demux(e.to_string()))?;
			match event {
				None => return Ok(out),
				Some(AtomEvent::Atom(atom, _)) => self.handle_atom(atom)?,
				Some(AtomEvent::Mdat(body, _)) => self.handle_mdat(body, &mut out)?,
			}
		}
	}

	fn handle_atom(&mut self, atom: Any) -> Result<()> {
		match atom {
			Any::Moov(moov) => {
				for trak in moov.trak {
					let track_id = trak.tkhd.track_id;
					let timescale = trak.mdia.mdhd.timescale;
					let codec = Self::codec_from_stsd(&trak.mdia.minf.stbl.stsd);
					if let Some(codec) = codec {
						self.tracks.insert(track_id, TrackInfo { codec, timescale });
					}
				}
				Ok(())
			}
			Any::Moof(moof) => {
				self.pending.clear();
				for traf in moof.traf {
					let track_id = traf.tfhd.track_id;
					let default_duration = traf.tfhd.default_sample_duration.unwrap_or(0);
					let Some(trun) = traf.trun else { continue };
					for entry in trun.entries {
						let size = entry.size.unwrap_or(0);
						let duration = entry.duration.unwrap_or(default_duration);
						let is_keyframe = entry
							.flags
							.map(|flags| (flags >> 16) & 0x1 == 0)
							.unwrap_or(false);
						let cts_offset = entry.cts.unwrap_or(0);
						self.pending.push(PendingEntry {
							track_id,
							size,
							duration,
							is_keyframe,
							cts_offset,
						});
					}
				}
				Ok(())
			}
			_ => Ok(()),
		}
	}

	fn handle_mdat(&mut self, body: Bytes, out: &mut Vec<DemuxedSample>) -> Result<()> {
		let mut offset = 0usize;
		for entry in self.pending.drain(..) {
			let size = entry.size as usize;
			if offset + size > body.len() {
				return Err(RelayError::Demux(
					"trun sample size exceeds mdat body".into(),
				));
			}
			let data = body.slice(offset..offset + size);
			offset += size;

			let Some(info) = self.tracks.get(&entry.track_id) else {
				continue;
			};
			let codec = info.codec.into();
			let pts = entry.duration as i64 * self.sequence as i64 + entry.cts_offset as i64;
			let dts = entry.duration as i64 * self.sequence as i64;
			let _ = info.timescale;
			let sample = ESSample::new(pts, dts, data, entry.is_keyframe, self.sequence);
			self.sequence += 1;
			out.push(DemuxedSample {
				track_id: entry.track_id,
				codec,
				sample,
			});
		}
		Ok(())
	}

	fn codec_from_stsd(stsd: &mp4_atom::Stsd) -> Option<TrackCodec> {
		match stsd.codecs.first()? {
			mp4_atom::Codec::Avc1(_) | mp4_atom::Codec::Avc3(_) => {
				Some(TrackCodec::Video(VideoCodec::H264))
			}
			mp4_atom::Codec::Hev1(_) | mp4_atom::Codec::Hvc1(_) => {
				Some(TrackCodec::Video(VideoCodec::H265))
			}
			mp4_atom::Codec::Av01(_) => Some(TrackCodec::Video(VideoCodec::Av1)),
			mp4_atom::Codec::Vp09(_) => Some(TrackCodec::Video(VideoCodec::Vp9)),
			mp4_atom::Codec::Mp4a(_) => Some(TrackCodec::Audio(AudioCodec::Aac)),
			mp4_atom::Codec::Opus(_) => Some(TrackCodec::Audio(AudioCodec::Opus)),
			_ => None,
		}
	}
}

impl Default for Fmp4Demuxer {
	fn default() -> Self {
		Self::new()
	}
}
