use bytes::{Buf, BufMut, Bytes, BytesMut};
use mp4_atom::{Any, Atom, Header};

/// One parsed unit out of an incrementally-fed fMP4/MP4 byte stream.
///
/// `mdat` bodies are handed back as zero-copy `Bytes` slices rather than
/// being parsed into a typed atom, since their contents are raw sample data
/// the caller already knows how to walk via the preceding `moov`/`moof`.
pub enum AtomEvent {
	Atom(Any, usize),
	Mdat(Bytes, usize),
}

/// Incremental atom-box reader: feed it chunks as they arrive off the wire,
/// pull out whole atoms (or `mdat` bodies) as soon as enough bytes have
/// accumulated, without ever buffering more than one atom's worth of data.
pub struct AtomReader {
	buffer: BytesMut,
}

impl AtomReader {
	pub fn new() -> Self {
		Self {
			buffer: BytesMut::new(),
		}
	}

	pub fn push<B: Buf>(&mut self, data: B) {
		self.buffer.put(data);
	}

	/// Returns the next complete atom or `mdat` body, or `None` if the
	/// buffer doesn't yet hold a full header (or full `mdat` body).
	pub fn next(&mut self) -> anyhow::Result<Option<AtomEvent>> {
		let mut cursor = self.buffer.as_ref();
		let before = cursor.remaining();

		let header = match Header::decode_maybe(&mut cursor)? {
			Some(header) => header,
			None => return Ok(None),
		};
		let header_size = before - cursor.remaining();
		let body_size = match header.size {
			Some(size) => size as usize,
			// A size of `None` means "rest of file" (streams never use
			// this), which we can't support incrementally.
			None => anyhow::bail!("atom with unbounded size is not supported"),
		};

		if header.kind == mp4_atom::Mdat::KIND {
			if self.buffer.len() < body_size {
				return Ok(None);
			}
			self.buffer.advance(header_size);
			let body = self.buffer.split_to(body_size - header_size).freeze();
			return Ok(Some(AtomEvent::Mdat(body, body_size)));
		}

		if self.buffer.len() < body_size {
			return Ok(None);
		}

		let mut atom_bytes = self.buffer.split_to(body_size);
		let atom = Any::decode_atom(&header, &mut atom_bytes)?;
		Ok(Some(AtomEvent::Atom(atom, body_size)))
	}
}

impl Default for AtomReader {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn ftyp_bytes() -> Bytes {
		let atom = Any::Ftyp(mp4_atom::Ftyp {
			major_brand: mp4_atom::FourCC::new(*b"isom"),
			minor_version: 0,
			compatible_brands: vec![mp4_atom::FourCC::new(*b"isom")],
		});
		let mut buf = BytesMut::new();
		atom.encode(&mut buf).unwrap();
		buf.freeze()
	}

	#[test]
	fn reader_partial_header() {
		let bytes = ftyp_bytes();
		let mut reader = AtomReader::new();
		reader.push(bytes.slice(0..2));
		assert!(reader.next().unwrap().is_none());
		reader.push(bytes.slice(2..));
		assert!(matches!(reader.next().unwrap(), Some(AtomEvent::Atom(..))));
	}

	#[test]
	fn reader_partial_body() {
		let bytes = ftyp_bytes();
		let mut reader = AtomReader::new();
		reader.push(bytes.slice(0..bytes.len() - 1));
		assert!(reader.next().unwrap().is_none());
		reader.push(bytes.slice(bytes.len() - 1..));
		assert!(matches!(reader.next().unwrap(), Some(AtomEvent::Atom(..))));
	}

	#[test]
	fn reader_mdat_zero_copy() {
		let payload = Bytes::from_static(b"sample-data-goes-here");
		let mut header_bytes = BytesMut::new();
		let size = (8 + payload.len()) as u32;
		header_bytes.extend_from_slice(&size.to_be_bytes());
		header_bytes.extend_from_slice(b"mdat");
		header_bytes.extend_from_slice(&payload);

		let mut reader = AtomReader::new();
		reader.push(header_bytes.freeze());
		match reader.next().unwrap() {
			Some(AtomEvent::Mdat(body, _)) => assert_eq!(body, payload),
			other => panic!("expected mdat, got {}", other.is_some()),
		}
	}

	#[test]
	fn reader_multiple_atoms() {
		let bytes = ftyp_bytes();
		let mut reader = AtomReader::new();
		reader.push(bytes.clone());
		reader.push(bytes.clone());
		assert!(reader.next().unwrap().is_some());
		assert!(reader.next().unwrap().is_some());
		assert!(reader.next().unwrap().is_none());
	}
}
