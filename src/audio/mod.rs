//! Audio file helpers.

pub mod wav;

pub use wav::{pcm_to_wav, ulaw_to_wav, wrap_output};
