//! Opus encoder wrapper
//!
//! Mono, fixed frame size, settings tuned for a mixed voice/music program.

use bytes::Bytes;
use opus::{Application, Channels, Encoder};

use crate::error::CodecError;

/// Expected packet loss on Wi-Fi listeners, used to size in-band FEC
const PACKET_LOSS_PERC: i32 = 5;

/// Opus encoder for one outgoing track
pub struct OpusEncoder {
    encoder: Encoder,
    frame_size: usize,
    /// Reused output buffer (max Opus packet is about 1275 bytes)
    encode_buffer: Vec<u8>,
    frames_encoded: u64,
    bytes_produced: u64,
}

impl OpusEncoder {
    pub fn new(sample_rate: u32, frame_size: usize, bitrate: u32) -> Result<Self, CodecError> {
        let mut encoder = Encoder::new(sample_rate, Channels::Mono, Application::Audio)
            .map_err(|e| CodecError::EncoderInit(e.to_string()))?;

        encoder
            .set_bitrate(opus::Bitrate::Bits(bitrate as i32))
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set bitrate: {}", e)))?;
        encoder
            .set_vbr(true)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set VBR: {}", e)))?;
        encoder
            .set_inband_fec(true)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set FEC: {}", e)))?;
        encoder
            .set_packet_loss_perc(PACKET_LOSS_PERC)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set packet loss: {}", e)))?;

        Ok(Self {
            encoder,
            frame_size,
            encode_buffer: vec![0u8; 4000],
            frames_encoded: 0,
            bytes_produced: 0,
        })
    }

    /// Encode exactly one frame of mono PCM
    pub fn encode(&mut self, samples: &[i16]) -> Result<Bytes, CodecError> {
        if samples.len() != self.frame_size {
            return Err(CodecError::InvalidFrameSize(samples.len()));
        }

        let size = self
            .encoder
            .encode(samples, &mut self.encode_buffer)
            .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;

        self.frames_encoded += 1;
        self.bytes_produced += size as u64;
        Ok(Bytes::copy_from_slice(&self.encode_buffer[..size]))
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn stats(&self) -> EncoderStats {
        EncoderStats {
            frames_encoded: self.frames_encoded,
            bytes_produced: self.bytes_produced,
            average_frame_size: if self.frames_encoded > 0 {
                self.bytes_produced as f32 / self.frames_encoded as f32
            } else {
                0.0
            },
        }
    }
}

/// Encoder statistics
#[derive(Debug, Clone)]
pub struct EncoderStats {
    pub frames_encoded: u64,
    pub bytes_produced: u64,
    pub average_frame_size: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encodes_ten_ms_frames() {
        let mut encoder = OpusEncoder::new(48_000, 480, 64_000).unwrap();
        let silence = vec![0i16; 480];
        let packet = encoder.encode(&silence).unwrap();
        assert!(!packet.is_empty());
        assert!(packet.len() < 480 * 2);
        assert_eq!(encoder.stats().frames_encoded, 1);
    }

    #[test]
    fn test_rejects_wrong_frame_size() {
        let mut encoder = OpusEncoder::new(48_000, 480, 64_000).unwrap();
        assert!(matches!(
            encoder.encode(&[0i16; 100]),
            Err(CodecError::InvalidFrameSize(100))
        ));
    }
}
