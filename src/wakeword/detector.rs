//! # Detection Loop
//!
//! One detector runs per connected client for the lifetime of the
//! connection. Audio enters through [`WakeWordDetector::add_audio_chunk`]
//! (called from the router on idle `audio` envelopes) and crosses into the
//! detection task over a bounded queue; a full queue drops the chunk
//! rather than backpressuring the router.

use byteorder::{ByteOrder, LittleEndian};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::config::WakeWordConfig;
use crate::wakeword::buffer::WakeWordBuffers;
use crate::wakeword::model::ModelSet;

/// Events emitted by the detection loop.
#[derive(Debug, Clone)]
pub enum WakeWordOutput {
    Detected {
        wake_word: String,
        confidence: f32,
        timestamp: DateTime<Utc>,
    },
    /// Latest per-model scores, emitted per scored frame. Delivered
    /// best-effort; a full event queue drops them.
    Status { scores: HashMap<String, f32> },
}

pub struct WakeWordDetector {
    config: WakeWordConfig,
    chunk_tx: mpsc::Sender<Vec<i16>>,
    chunk_rx: Mutex<Option<mpsc::Receiver<Vec<i16>>>>,
    running: AtomicBool,
    chunks_received: AtomicU64,
    chunks_dropped: AtomicU64,
}

impl WakeWordDetector {
    pub fn new(config: WakeWordConfig) -> Self {
        let (chunk_tx, chunk_rx) = mpsc::channel(config.queue_capacity);
        Self {
            config,
            chunk_tx,
            chunk_rx: Mutex::new(Some(chunk_rx)),
            running: AtomicBool::new(false),
            chunks_received: AtomicU64::new(0),
            chunks_dropped: AtomicU64::new(0),
        }
    }

    /// Decode a little-endian 16-bit PCM chunk and queue it for detection.
    /// A trailing odd byte is ignored; a full queue drops the chunk.
    pub fn add_audio_chunk(&self, bytes: &[u8]) {
        let samples: Vec<i16> = bytes.chunks_exact(2).map(LittleEndian::read_i16).collect();
        if samples.is_empty() {
            return;
        }

        match self.chunk_tx.try_send(samples) {
            Ok(()) => {
                self.chunks_received.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.chunks_dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Wake word queue full, dropping audio chunk");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Wake word queue closed, dropping audio chunk");
            }
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn chunks_received(&self) -> u64 {
        self.chunks_received.load(Ordering::Relaxed)
    }

    pub fn chunks_dropped(&self) -> u64 {
        self.chunks_dropped.load(Ordering::Relaxed)
    }

    /// Run the detection loop until [`stop`](Self::stop) is called.
    ///
    /// The loop wakes at the poll interval even without audio so a stop
    /// request is observed promptly. After a detection fires, the buffers
    /// are cleared (minus a little context) so the same utterance cannot
    /// trigger twice.
    pub async fn run(self: std::sync::Arc<Self>, events: mpsc::Sender<WakeWordOutput>) {
        let mut rx = match self.chunk_rx.lock().unwrap().take() {
            Some(rx) => rx,
            None => {
                warn!("Wake word detector already running");
                return;
            }
        };

        self.running.store(true, Ordering::SeqCst);
        let mut buffers = WakeWordBuffers::new(&self.config);
        let mut models = ModelSet::load(&self.config.models);
        info!("Wake word detection started");

        while self.running.load(Ordering::SeqCst) {
            let chunk = match timeout(self.config.poll_interval(), rx.recv()).await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(_) => continue,
            };

            buffers.push_source(&chunk);
            buffers.resample_into_target();

            while let Some(frame) = buffers.next_frame() {
                models.predict(&frame);
                let _ = events.try_send(WakeWordOutput::Status {
                    scores: models.scores().clone(),
                });
                if let Some(detection) =
                    models.best_over_threshold(self.config.detection_threshold)
                {
                    info!(
                        wake_word = %detection.wake_word,
                        confidence = detection.confidence,
                        "Wake word detected"
                    );
                    buffers.clear_after_detection();
                    if events
                        .send(WakeWordOutput::Detected {
                            wake_word: detection.wake_word,
                            confidence: detection.confidence,
                            timestamp: Utc::now(),
                        })
                        .await
                        .is_err()
                    {
                        self.running.store(false, Ordering::SeqCst);
                    }
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        *self.chunk_rx.lock().unwrap() = Some(rx);
        info!("Wake word detection stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn test_config() -> WakeWordConfig {
        WakeWordConfig {
            source_sample_rate: 24000,
            target_sample_rate: 16000,
            frame_size: 1280,
            detection_threshold: 0.2,
            max_buffer_seconds: 5,
            max_pending_frames: 10,
            queue_capacity: 64,
            poll_interval_ms: 10,
            models: vec!["default".to_string()],
        }
    }

    fn sine_chunk_bytes(amplitude: f64, samples: usize) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(samples * 2);
        for i in 0..samples {
            let t = i as f64 / 24000.0;
            let s = (amplitude * (2.0 * std::f64::consts::PI * 440.0 * t).sin()) as i16;
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        bytes
    }

    #[tokio::test]
    async fn test_queue_full_drops_instead_of_blocking() {
        let mut config = test_config();
        config.queue_capacity = 2;
        let detector = WakeWordDetector::new(config);

        for _ in 0..5 {
            detector.add_audio_chunk(&sine_chunk_bytes(1000.0, 100));
        }
        assert_eq!(detector.chunks_dropped(), 3);
    }

    #[tokio::test]
    async fn test_loud_tone_triggers_detection() {
        let detector = Arc::new(WakeWordDetector::new(test_config()));
        let (tx, mut rx) = mpsc::channel(16);
        let handle = tokio::spawn(detector.clone().run(tx));

        // Two seconds of loud tone is more than enough frames.
        detector.add_audio_chunk(&sine_chunk_bytes(12000.0, 48000));

        let detected = tokio::time::timeout(Duration::from_secs(2), async {
            while let Some(event) = rx.recv().await {
                if let WakeWordOutput::Detected {
                    wake_word,
                    confidence,
                    ..
                } = event
                {
                    return Some((wake_word, confidence));
                }
            }
            None
        })
        .await
        .expect("no detection within two seconds")
        .expect("event stream ended early");

        assert_eq!(detected.0, "default");
        assert!(detected.1 >= 0.2);

        detector.stop();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_silence_produces_no_detection() {
        let detector = Arc::new(WakeWordDetector::new(test_config()));
        let (tx, mut rx) = mpsc::channel(16);
        let handle = tokio::spawn(detector.clone().run(tx));

        detector.add_audio_chunk(&vec![0u8; 96000]);

        // Drain what arrives in a short window; none of it may be a
        // detection.
        let deadline = tokio::time::Instant::now() + Duration::from_millis(200);
        while let Ok(Some(event)) =
            tokio::time::timeout_at(deadline, rx.recv()).await
        {
            assert!(matches!(event, WakeWordOutput::Status { .. }));
        }

        detector.stop();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_terminates_loop_promptly() {
        let detector = Arc::new(WakeWordDetector::new(test_config()));
        let (tx, _rx) = mpsc::channel(16);
        let handle = tokio::spawn(detector.clone().run(tx));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(detector.is_running());
        detector.stop();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("detector loop did not stop")
            .unwrap();
        assert!(!detector.is_running());
    }
}
