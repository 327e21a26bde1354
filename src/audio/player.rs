//! Player bus feeder
//!
//! Paces a raw s16le mono PCM file into the player bus in real time, one
//! frame per frame period. Stands in for an external media player; anything
//! else that decodes audio can push into a [`SourceFeed`] directly.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::engine::SourceFeed;
use crate::error::AudioError;

pub struct PcmFileFeeder {
    running: Arc<AtomicBool>,
    frames_fed: Arc<AtomicU64>,
    thread_handle: Option<JoinHandle<()>>,
}

impl PcmFileFeeder {
    pub fn start(
        path: &Path,
        frame_samples: usize,
        period: Duration,
        looping: bool,
        feed: SourceFeed,
    ) -> Result<Self, AudioError> {
        let file = File::open(path)
            .map_err(|e| AudioError::SourceOpen(format!("{}: {}", path.display(), e)))?;
        Self::spawn(BufReader::new(file), frame_samples, period, looping, feed)
    }

    /// Feed from any seekable reader
    pub fn spawn<R>(
        mut reader: R,
        frame_samples: usize,
        period: Duration,
        looping: bool,
        mut feed: SourceFeed,
    ) -> Result<Self, AudioError>
    where
        R: Read + Seek + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let frames_fed = Arc::new(AtomicU64::new(0));
        let running_for_loop = running.clone();
        let counter = frames_fed.clone();

        let handle = thread::Builder::new()
            .name("player-feed".into())
            .spawn(move || {
                let mut bytes = vec![0u8; frame_samples * 2];
                let mut samples = Vec::with_capacity(frame_samples);
                let mut deadline = Instant::now();
                let mut fed_since_rewind = false;

                while running_for_loop.load(Ordering::Relaxed) {
                    let n = match read_frame(&mut reader, &mut bytes) {
                        Ok(0) if looping && fed_since_rewind => {
                            if let Err(e) = reader.seek(SeekFrom::Start(0)) {
                                tracing::warn!("Player source rewind failed: {}", e);
                                break;
                            }
                            fed_since_rewind = false;
                            continue;
                        }
                        Ok(0) => break,
                        Ok(n) => n,
                        Err(e) => {
                            tracing::warn!("Player source read failed: {}", e);
                            break;
                        }
                    };

                    fed_since_rewind = true;
                    decode_s16le(&bytes[..n], &mut samples);
                    feed.push(&samples, samples.len());
                    counter.fetch_add(1, Ordering::Relaxed);

                    deadline += period;
                    let now = Instant::now();
                    if deadline > now {
                        thread::sleep(deadline - now);
                    } else {
                        deadline = now;
                    }
                }
                tracing::info!("Player source finished");
            })
            .map_err(|e| AudioError::SourceOpen(e.to_string()))?;

        Ok(Self {
            running,
            frames_fed,
            thread_handle: Some(handle),
        })
    }

    pub fn frames_fed(&self) -> u64 {
        self.frames_fed.load(Ordering::Relaxed)
    }

    pub fn is_finished(&self) -> bool {
        self.thread_handle
            .as_ref()
            .map(|h| h.is_finished())
            .unwrap_or(true)
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PcmFileFeeder {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Fill `buf` as far as the reader allows; a short count means EOF
fn read_frame<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Little-endian 16-bit samples; a trailing odd byte is dropped
pub fn decode_s16le(bytes: &[u8], out: &mut Vec<i16>) {
    out.clear();
    out.extend(
        bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]])),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::engine::AudioEngine;
    use crate::audio::mixer::SourceKind;
    use crate::audio::params::MixParameters;
    use crate::config::AudioConfig;
    use std::io::Cursor;

    #[test]
    fn test_decode_s16le() {
        let mut out = Vec::new();
        decode_s16le(&[0x01, 0x00, 0xff, 0xff, 0x00, 0x80, 0x7f], &mut out);
        assert_eq!(out, vec![1, -1, i16::MIN]);
    }

    #[test]
    fn test_feeds_whole_file_then_detaches() {
        let engine = AudioEngine::new(&AudioConfig::default(), Arc::new(MixParameters::default()));
        let feed = engine.take_source(SourceKind::Player).unwrap();

        // Three frames of 4 samples
        let bytes: Vec<u8> = (0..12i16).flat_map(|s| s.to_le_bytes()).collect();
        let mut feeder =
            PcmFileFeeder::spawn(Cursor::new(bytes), 4, Duration::from_millis(1), false, feed)
                .unwrap();

        let started = Instant::now();
        while !feeder.is_finished() && started.elapsed() < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(5));
        }
        feeder.stop();
        assert_eq!(feeder.frames_fed(), 3);
        assert!(!engine.is_attached(SourceKind::Player));
    }

    #[test]
    fn test_looping_keeps_feeding() {
        let engine = AudioEngine::new(&AudioConfig::default(), Arc::new(MixParameters::default()));
        let feed = engine.take_source(SourceKind::Player).unwrap();
        let bytes = vec![0u8; 8];
        let mut feeder =
            PcmFileFeeder::spawn(Cursor::new(bytes), 4, Duration::from_millis(1), true, feed)
                .unwrap();
        thread::sleep(Duration::from_millis(30));
        assert!(!feeder.is_finished());
        feeder.stop();
        assert!(feeder.frames_fed() > 1);
    }

    #[test]
    fn test_missing_file() {
        let engine = AudioEngine::new(&AudioConfig::default(), Arc::new(MixParameters::default()));
        let feed = engine.take_source(SourceKind::Player).unwrap();
        let err = PcmFileFeeder::start(
            Path::new("/nonexistent/player.pcm"),
            480,
            Duration::from_millis(10),
            false,
            feed,
        )
        .err();
        assert!(matches!(err, Some(AudioError::SourceOpen(_))));
    }
}
