use bytes::{Bytes, BytesMut};

use crate::model::VideoCodec;

pub const START_CODE: &[u8] = &[0, 0, 0, 1];

/// NAL unit types that mark a decodable random-access point for H.264/H.265
/// Annex B streams: IDR slices and, for H.265, CRA/BLA/IDR access units.
fn is_keyframe_nal(codec: VideoCodec, nal: &[u8]) -> bool {
	let Some(&first_byte) = nal.first() else {
		return false;
	};
	match codec {
		VideoCodec::H264 => (first_byte & 0x1f) == 5,
		VideoCodec::H265 => {
			let nal_type = (first_byte >> 1) & 0x3f;
			(16..=23).contains(&nal_type)
		}
		_ => false,
	}
}

/// Splits a byte-stream of Annex B NAL units (each prefixed by a 3- or
/// 4-byte start code) into individual NAL payloads, stripping the start
/// codes. Mirrors the start-code scanning used by the Annex B importer this
/// crate's decoder is grounded on.
pub struct NalIterator<'a> {
	data: &'a [u8],
	pos: usize,
}

impl<'a> NalIterator<'a> {
	pub fn new(data: &'a [u8]) -> Self {
		Self { data, pos: 0 }
	}

	fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
		let mut i = from;
		while i + 3 <= data.len() {
			if data[i] == 0 && data[i + 1] == 0 {
				if data[i + 2] == 1 {
					return Some((i, 3));
				}
				if i + 4 <= data.len() && data[i + 2] == 0 && data[i + 3] == 1 {
					return Some((i, 4));
				}
			}
			i += 1;
		}
		None
	}
}

impl<'a> Iterator for NalIterator<'a> {
	type Item = &'a [u8];

	fn next(&mut self) -> Option<Self::Item> {
		let (start, start_len) = Self::find_start_code(self.data, self.pos)?;
		let nal_begin = start + start_len;
		let end = Self::find_start_code(self.data, nal_begin)
			.map(|(next_start, _)| next_start)
			.unwrap_or(self.data.len());
		self.pos = end;
		if end > nal_begin {
			Some(&self.data[nal_begin..end])
		} else {
			None
		}
	}
}

/// An Annex B access unit demuxer: accumulates NAL units for one frame and
/// reports whether the frame starts a new GOP.
pub struct AnnexBDecoder {
	codec: VideoCodec,
	sps: Option<h264_parser::Sps>,
}

impl AnnexBDecoder {
	pub fn new(codec: VideoCodec) -> Self {
		Self { codec, sps: None }
	}

	/// Feeds one Annex-B buffer (which may contain several NAL units making
	/// up one frame) and returns the frame's reassembled bytes (start codes
	/// preserved, so the result round-trips into any Annex B consumer) and
	/// whether it is a keyframe.
	pub fn decode(&mut self, data: &[u8]) -> (Bytes, bool) {
		let mut is_keyframe = false;
		let mut out = BytesMut::with_capacity(data.len() + 16);

		for nal in NalIterator::new(data) {
			if self.codec == VideoCodec::H264 {
				let nal_type = nal.first().map(|b| b & 0x1f).unwrap_or(0);
				if nal_type == 7 {
					if let Ok(sps) = h264_parser::Sps::parse(nal) {
						self.sps = Some(sps);
					}
				}
			}
			if is_keyframe_nal(self.codec, nal) {
				is_keyframe = true;
			}
			out.extend_from_slice(START_CODE);
			out.extend_from_slice(nal);
		}

		(out.freeze(), is_keyframe)
	}

	pub fn sps(&self) -> Option<&h264_parser::Sps> {
		self.sps.as_ref()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn splits_multiple_nals() {
		let data = [
			0, 0, 0, 1, 0x67, 0xaa, 0, 0, 0, 1, 0x65, 0xbb, 0xcc,
		];
		let nals: Vec<_> = NalIterator::new(&data).collect();
        assert_eq!(nals.len(), 2);
		assert_eq!(nals[0], &[0x67, 0xaa]);
		assert_eq!(nals[1], &[0x65, 0xbb, 0xcc]);
	}

	#[test]
	fn handles_three_byte_start_code() {
		let data = [0, 0, 1, 0x67, 0xaa];
		let nals: Vec<_> = NalIterator::new(&data).collect();
		assert_eq!(nals, vec![&[0x67u8, 0xaa][..]]);
	}

	#[test]
	fn detects_h264_idr_keyframe() {
		let mut decoder = AnnexBDecoder::new(VideoCodec::H264);
		let data = [0, 0, 0, 1, 0x65, 0xaa, 0xbb];
		let (_, is_keyframe) = decoder.decode(&data);
		assert!(is_keyframe);
	}

	#[test]
	fn non_idr_slice_is_not_keyframe() {
		let mut decoder = AnnexBDecoder::new(VideoCodec::H264);
		let data = [0, 0, 0, 1, 0x41, 0xaa, 0xbb];
		let (_, is_keyframe) = decoder.decode(&data);
		assert!(!is_keyframe);
	}
}
