pub mod atom_reader;
pub mod dash;
pub mod fmp4;
pub mod hls;
pub mod mpegts;
pub mod nal;

pub use fmp4::Fmp4Demuxer;
pub use hls::{HlsConfig, HlsFetcher, HlsIngest};
pub use mpegts::TsDemuxer;
