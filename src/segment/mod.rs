//! The segment layer: binary encoding ([`codec`]), DNS label/TXT framing
//! ([`label_codec`]), and outbound staging ([`buffer`]).

pub mod buffer;
pub mod codec;
pub mod label_codec;

pub use buffer::SegmentBuffer;
pub use codec::{Segment, SegmentCodecConfig, SegmentFlags};
pub use label_codec::LabelCodecError;
