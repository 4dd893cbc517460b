pub mod buffer;
pub mod codec;
pub mod sample;
pub mod track;
pub mod variant;

pub use buffer::SharedBuffer;
pub use codec::{AudioCodec, Codec, VideoCodec};
pub use sample::ESSample;
pub use track::{ESTrackConsumer, ESTrackProducer, TrackItem};
pub use variant::{ESVariantConsumer, ESVariantProducer, VariantKey};
