use std::sync::Arc;

/// Every failure mode the relay core can produce.
///
/// Mirrors the flat, named-variant shape used throughout the corpus this crate
/// is built from: one enum, `thiserror`-derived, with a `status()` mapping
/// instead of scattering HTTP status codes through call sites.
#[derive(thiserror::Error, Debug, Clone)]
pub enum RelayError {
	/// The upstream origin could not be reached or returned a non-2xx status.
	#[error("origin error: {0}")]
	Origin(String),

	/// A demuxer hit an unrecoverable parse error and closed its source variant.
	#[error("demux error: {0}")]
	Demux(String),

	/// A transcoder subprocess failed to start or exited unexpectedly.
	#[error("transcoder error: {0}")]
	Transcoder(String),

	/// An output processor failed; scoped to that processor only.
	#[error("processor error: {0}")]
	Processor(String),

	/// The buffer, variant, or session has been closed.
	#[error("closed")]
	Closed,

	/// A requested resource (segment, variant) existed but expired.
	#[error("expired")]
	Expired,

	/// A requested resource does not exist.
	#[error("not found")]
	NotFound,

	/// The circuit breaker for this origin is open.
	#[error("circuit open")]
	CircuitOpen,

	/// The caller cancelled a blocking operation (client disconnect, shutdown).
	#[error("cancelled")]
	Cancel,

	/// The request was malformed.
	#[error("bad request: {0}")]
	BadRequest(String),

	/// Wraps an I/O failure. `std::io::Error` is not `Clone`, so the message
	/// is captured instead of the original error.
	#[error("io error: {0}")]
	Io(Arc<str>),
}

impl RelayError {
	/// HTTP status this error maps to, used by the single translator at the
	/// session surface (`spec.md` §7's "propagation policy").
	pub fn status(&self) -> http_status_shim::StatusCode {
		use http_status_shim::StatusCode as S;
		match self {
			Self::Origin(_) => S::SERVICE_UNAVAILABLE,
			Self::CircuitOpen => S::SERVICE_UNAVAILABLE,
			Self::Demux(_) => S::BAD_GATEWAY,
			Self::Transcoder(_) => S::BAD_GATEWAY,
			Self::Processor(_) => S::INTERNAL_SERVER_ERROR,
			Self::Closed => S::GONE,
			Self::Expired | Self::NotFound => S::NOT_FOUND,
			Self::Cancel => S::INTERNAL_SERVER_ERROR,
			Self::BadRequest(_) => S::BAD_REQUEST,
			Self::Io(_) => S::INTERNAL_SERVER_ERROR,
		}
	}
}

impl From<std::io::Error> for RelayError {
	fn from(err: std::io::Error) -> Self {
		Self::Io(err.to_string().into())
	}
}

pub type Result<T> = std::result::Result<T, RelayError>;

/// A tiny status-code shim so `relay-core` never depends on `axum`/`http`.
///
/// `relay-server` converts these into real `http::StatusCode` values at the
/// HTTP boundary; keeping the dependency out of the core mirrors the
/// teacher's split between `hang` (no HTTP dependency) and `moq-relay`/
/// `hang-cli` (the HTTP-aware binaries).
pub mod http_status_shim {
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct StatusCode(pub u16);

	impl StatusCode {
		pub const BAD_REQUEST: Self = Self(400);
		pub const NOT_FOUND: Self = Self(404);
		pub const GONE: Self = Self(410);
		pub const INTERNAL_SERVER_ERROR: Self = Self(500);
		pub const BAD_GATEWAY: Self = Self(502);
		pub const SERVICE_UNAVAILABLE: Self = Self(503);

		pub fn as_u16(self) -> u16 {
			self.0
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn status_mapping_matches_spec_table() {
		assert_eq!(RelayError::NotFound.status(), http_status_shim::StatusCode::NOT_FOUND);
		assert_eq!(RelayError::CircuitOpen.status(), http_status_shim::StatusCode::SERVICE_UNAVAILABLE);
		assert_eq!(RelayError::Expired.status(), http_status_shim::StatusCode::NOT_FOUND);
	}
}
