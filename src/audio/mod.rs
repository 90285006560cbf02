//! Audio plumbing: PCM conversion, streams, capture, echo control, mixing.

pub mod aec;
pub mod mixer;
pub mod pcm;
pub mod pipe;
pub mod resample;
pub mod source;
pub mod stream;
