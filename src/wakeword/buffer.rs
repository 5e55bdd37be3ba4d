//! # Sample Buffers
//!
//! The two staging buffers between raw client audio and model frames:
//!
//! 1. **source**: 24kHz samples as they arrive, capped at a few seconds
//! 2. **target**: 16kHz resampled samples awaiting frame extraction,
//!    capped at a handful of frames
//!
//! Both caps discard the oldest audio first. Resampling is linear
//! interpolation; a short tail of source audio (~100ms) is carried over
//! between calls so chunk boundaries do not produce discontinuities.

use std::collections::VecDeque;

use crate::config::WakeWordConfig;

pub struct WakeWordBuffers {
    source: Vec<i16>,
    target: VecDeque<i16>,
    source_rate: u32,
    target_rate: u32,
    frame_size: usize,
    max_source: usize,
    max_target: usize,
    tail: usize,
}

impl WakeWordBuffers {
    pub fn new(config: &WakeWordConfig) -> Self {
        Self {
            source: Vec::new(),
            target: VecDeque::new(),
            source_rate: config.source_sample_rate,
            target_rate: config.target_sample_rate,
            frame_size: config.frame_size,
            max_source: config.max_source_samples(),
            max_target: config.max_target_samples(),
            tail: config.tail_samples(),
        }
    }

    /// Append source-rate samples, discarding the oldest when over the cap.
    pub fn push_source(&mut self, samples: &[i16]) {
        self.source.extend_from_slice(samples);
        if self.source.len() > self.max_source {
            let excess = self.source.len() - self.max_source;
            self.source.drain(..excess);
        }
    }

    /// Resample buffered source audio into the target buffer.
    ///
    /// The last ~100ms of source audio stays buffered as context for the
    /// next call; only the portion before it is consumed. Returns the number
    /// of target-rate samples produced.
    pub fn resample_into_target(&mut self) -> usize {
        if self.source.len() <= self.tail {
            return 0;
        }
        let consume = self.source.len() - self.tail;
        let consumed: Vec<i16> = self.source.drain(..consume).collect();

        let out_len =
            (consumed.len() as u64 * self.target_rate as u64 / self.source_rate as u64) as usize;
        if out_len == 0 {
            return 0;
        }

        let step = consumed.len() as f32 / out_len as f32;
        for i in 0..out_len {
            let pos = i as f32 * step;
            let idx = pos as usize;
            let frac = pos - idx as f32;
            let a = consumed[idx] as f32;
            let b = consumed[(idx + 1).min(consumed.len() - 1)] as f32;
            self.target.push_back((a + (b - a) * frac) as i16);
        }

        while self.target.len() > self.max_target {
            self.target.pop_front();
        }
        out_len
    }

    /// Pull one model frame if enough target samples are buffered.
    pub fn next_frame(&mut self) -> Option<Vec<i16>> {
        if self.target.len() < self.frame_size {
            return None;
        }
        Some(self.target.drain(..self.frame_size).collect())
    }

    /// Reset after a detection fires. The source buffer is dropped entirely;
    /// half a frame of target audio is kept so the models retain a little
    /// acoustic context.
    pub fn clear_after_detection(&mut self) {
        self.source.clear();
        let keep = self.frame_size / 2;
        while self.target.len() > keep {
            self.target.pop_front();
        }
    }

    pub fn source_len(&self) -> usize {
        self.source.len()
    }

    pub fn target_len(&self) -> usize {
        self.target.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> WakeWordConfig {
        WakeWordConfig {
            source_sample_rate: 24000,
            target_sample_rate: 16000,
            frame_size: 1280,
            detection_threshold: 0.2,
            max_buffer_seconds: 5,
            max_pending_frames: 10,
            queue_capacity: 64,
            poll_interval_ms: 100,
            models: vec!["default".to_string()],
        }
    }

    #[test]
    fn test_source_cap_discards_oldest_under_burst() {
        let config = test_config();
        let mut buffers = WakeWordBuffers::new(&config);

        // 100 chunks of 2000 samples is well past the 5-second cap.
        for i in 0..100u32 {
            let chunk = vec![i as i16; 2000];
            buffers.push_source(&chunk);
        }
        assert_eq!(buffers.source_len(), config.max_source_samples());
    }

    #[test]
    fn test_resample_ratio_and_tail_retention() {
        let config = test_config();
        let mut buffers = WakeWordBuffers::new(&config);

        buffers.push_source(&vec![1000i16; 24000]);
        let produced = buffers.resample_into_target();

        // 21600 consumed samples at 2/3 ratio, 2400 kept as context.
        assert_eq!(produced, 14400);
        assert_eq!(buffers.target_len(), 14400);
        assert_eq!(buffers.source_len(), config.tail_samples());
    }

    #[test]
    fn test_resample_skips_when_only_tail_remains() {
        let config = test_config();
        let mut buffers = WakeWordBuffers::new(&config);
        buffers.push_source(&vec![0i16; 1000]);
        assert_eq!(buffers.resample_into_target(), 0);
        assert_eq!(buffers.source_len(), 1000);
    }

    #[test]
    fn test_target_cap_bounds_pending_frames() {
        let config = test_config();
        let mut buffers = WakeWordBuffers::new(&config);

        // Feed far more audio than ten frames' worth.
        for _ in 0..20 {
            buffers.push_source(&vec![500i16; 24000]);
            buffers.resample_into_target();
        }
        assert!(buffers.target_len() <= config.max_target_samples());
    }

    #[test]
    fn test_frame_extraction() {
        let config = test_config();
        let mut buffers = WakeWordBuffers::new(&config);
        buffers.push_source(&vec![2000i16; 24000]);
        buffers.resample_into_target();

        let frame = buffers.next_frame().unwrap();
        assert_eq!(frame.len(), config.frame_size);
        // Constant input resamples to (roughly) constant output.
        assert!(frame.iter().all(|&s| (s - 2000).abs() <= 1));
    }

    #[test]
    fn test_clear_after_detection_keeps_half_frame() {
        let config = test_config();
        let mut buffers = WakeWordBuffers::new(&config);
        buffers.push_source(&vec![100i16; 24000]);
        buffers.resample_into_target();

        buffers.clear_after_detection();
        assert_eq!(buffers.source_len(), 0);
        assert_eq!(buffers.target_len(), config.frame_size / 2);
    }
}
