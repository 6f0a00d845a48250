//! Audio primitives
//!
//! Frames arrive from the device already decoded to normalized float samples.
//! Codec work (Opus and friends) happens before a [`Frame`] is built.

mod frame;
mod pcm;
mod source;

pub use frame::{DEFAULT_CHANNELS, DEFAULT_SAMPLE_RATE, Frame};
pub use pcm::{f32_to_pcm16_le, pcm16_le_to_f32, read_wav_frames, streaming_wav_header};
pub use source::{ChannelFrameSource, FrameSource};
