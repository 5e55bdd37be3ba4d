//! # Wake Word Pipeline
//!
//! Always-on detection over the client's idle audio stream. Base64 PCM
//! chunks (24kHz, 16-bit mono) arrive on the channel, get resampled to the
//! 16kHz rate the detection models consume, and are scored frame by frame.
//! A score above the detection threshold emits a detection event that the
//! session layer turns into a voice session start.
//!
//! The pipeline is deliberately lossy: both buffers are hard-capped and the
//! inbound chunk queue drops on overflow. Stale audio is worthless for wake
//! word detection, so memory stays bounded no matter how fast a client
//! streams.

pub mod buffer;
pub mod detector;
pub mod model;

pub use detector::{WakeWordDetector, WakeWordOutput};
